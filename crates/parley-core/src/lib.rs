//! # parley-core
//!
//! Shared vocabulary for the Parley signaling relay:
//!
//! - **Identifiers**: [`ClientId`], [`CallId`] (peer-supplied, opaque) and
//!   [`ConnectionId`] (server-minted, one per transport connection)
//! - **Logging**: subscriber setup and an in-memory capture layer for tests

#![deny(unsafe_code)]

pub mod ids;
pub mod logging;

pub use ids::{CallId, ClientId, ConnectionId};
