//! # parley-signaling
//!
//! Transport-independent core of the relay:
//!
//! - [`protocol`]: inbound and outbound message types
//! - [`connection`]: handle to one peer's bounded outbound queue
//! - [`registry`]: client identifier to connection map
//! - [`session`]: call sessions and the concurrent call store
//! - [`router`]: call state machine and message delivery
//!
//! The transport feeds text frames to [`Router::handle_text`] and calls
//! [`Router::disconnect`] when a connection closes.

#![deny(unsafe_code)]

pub mod connection;
pub mod errors;
pub mod metrics;
pub mod protocol;
pub mod registry;
pub mod router;
pub mod session;

pub use connection::ClientConnection;
pub use errors::{Result, SignalingError};
pub use protocol::{ClientMessage, EndReason, FailureReason, Inbound, ServerMessage};
pub use registry::ConnectionRegistry;
pub use router::{ConnectionState, DeliveryReport, RelayStats, Router, RouterConfig};
pub use session::{CallSession, CallSessionStore, CallStatus};
