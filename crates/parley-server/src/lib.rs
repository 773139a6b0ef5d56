//! # parley-server
//!
//! Axum HTTP + WebSocket front end for the Parley signaling relay.
//!
//! - `GET /ws` (also `GET /`): WebSocket upgrade, one session task per peer
//! - `GET /health`: liveness and live counts as JSON
//! - `GET /metrics`: Prometheus exposition

#![deny(unsafe_code)]

pub mod config;
pub mod errors;
pub mod health;
pub mod metrics;
pub mod server;
pub mod shutdown;
pub mod stats;
pub mod websocket;

pub use config::ServerConfig;
pub use errors::{Result, ServerError};
pub use server::ParleyServer;
