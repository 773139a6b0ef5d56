//! Error types for signaling operations.

use parley_core::{CallId, ClientId};

use crate::session::CallStatus;

/// Errors raised while parsing or routing signaling messages.
///
/// None of these are fatal to a connection: the router logs them and moves
/// on to the next frame.
#[derive(Debug, thiserror::Error)]
pub enum SignalingError {
    /// The frame is not a JSON object, has no `type`, or lacks a required field.
    #[error("malformed message: {0}")]
    MalformedMessage(String),

    /// The `type` field names no known message and forwarding is disabled.
    #[error("unknown message type: {0}")]
    UnknownMessageType(String),

    /// The addressed client is not registered or its outbound queue is unusable.
    #[error("recipient unavailable: {0}")]
    RecipientUnavailable(ClientId),

    /// A call was requested on behalf of an id this connection has not registered.
    #[error("{0} is not registered on this connection")]
    NotRegistered(ClientId),

    /// A live call already uses this identifier.
    #[error("duplicate call id: {0}")]
    DuplicateCallId(CallId),

    /// No live call has this identifier.
    #[error("unknown call: {0}")]
    UnknownCall(CallId),

    /// The requested lifecycle step does not apply to the call's current status.
    #[error("call {call_id} is {status:?}, cannot {action}")]
    InvalidTransition {
        /// Affected call.
        call_id: CallId,
        /// Status at the time of the attempt.
        status: CallStatus,
        /// Attempted action.
        action: &'static str,
    },

    /// Outbound serialization failed.
    #[error("serialization error: {0}")]
    Serialization(#[from] serde_json::Error),
}

/// Result alias for signaling operations.
pub type Result<T> = std::result::Result<T, SignalingError>;
