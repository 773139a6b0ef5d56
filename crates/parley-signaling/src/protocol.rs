//! Wire format: one JSON object per text frame, discriminated by `type`.
//!
//! Inbound frames parse into [`ClientMessage`]; the raw text and the
//! generic JSON value are kept alongside so media-negotiation messages can
//! be forwarded byte-for-byte and direct messages can be echoed back in a
//! `recipient_unavailable` error.

use std::fmt;
use std::sync::Arc;

use parley_core::{CallId, ClientId};
use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::errors::{Result, SignalingError};

/// Messages a peer sends to the relay.
#[derive(Clone, Debug, PartialEq, Deserialize)]
#[serde(tag = "type", rename_all = "kebab-case")]
pub enum ClientMessage {
    /// Bind this connection to a client identifier.
    #[serde(rename_all = "camelCase")]
    Register {
        /// Identifier to register under.
        user_id: ClientId,
    },
    /// Start ringing `to`.
    #[serde(rename_all = "camelCase")]
    CallRequest {
        /// Caller.
        from: ClientId,
        /// Receiver.
        to: ClientId,
        /// Caller-chosen call identifier.
        call_id: CallId,
        /// Opaque caller payload, passed through to the receiver.
        #[serde(default)]
        data: Option<Value>,
    },
    /// Receiver accepts; `to` is the original caller.
    #[serde(rename_all = "camelCase")]
    CallAccept {
        /// Receiver.
        from: ClientId,
        /// Original caller.
        to: ClientId,
        /// Call being accepted.
        call_id: CallId,
        /// Opaque receiver payload, passed through to the caller.
        #[serde(default)]
        data: Option<Value>,
    },
    /// Receiver declines; `to` is the original caller.
    #[serde(rename_all = "camelCase")]
    CallReject {
        /// Receiver.
        from: ClientId,
        /// Original caller.
        to: ClientId,
        /// Call being rejected.
        call_id: CallId,
    },
    /// Either party hangs up.
    #[serde(rename_all = "camelCase")]
    CallEnd {
        /// Call being ended.
        call_id: CallId,
    },
    /// Session description offer, forwarded verbatim.
    Offer {
        /// Recipient.
        to: ClientId,
    },
    /// Session description answer, forwarded verbatim.
    Answer {
        /// Recipient.
        to: ClientId,
    },
    /// Network-path candidate, forwarded verbatim.
    IceCandidate {
        /// Recipient.
        to: ClientId,
    },
    /// Any other `type` value.
    #[serde(other)]
    Unknown,
}

impl ClientMessage {
    /// Wire `type`, or `"unknown"` for unrecognized messages.
    pub fn kind(&self) -> &'static str {
        match self {
            Self::Register { .. } => "register",
            Self::CallRequest { .. } => "call-request",
            Self::CallAccept { .. } => "call-accept",
            Self::CallReject { .. } => "call-reject",
            Self::CallEnd { .. } => "call-end",
            Self::Offer { .. } => "offer",
            Self::Answer { .. } => "answer",
            Self::IceCandidate { .. } => "ice-candidate",
            Self::Unknown => "unknown",
        }
    }
}

/// A parsed inbound frame.
#[derive(Clone, Debug)]
pub struct Inbound {
    /// The frame exactly as received.
    pub raw: Arc<String>,
    /// The frame as generic JSON.
    pub value: Value,
    /// The `type` field as sent.
    pub kind: String,
    /// The typed message.
    pub message: ClientMessage,
}

impl Inbound {
    /// Parse one text frame.
    ///
    /// Fails with [`SignalingError::MalformedMessage`] when the frame is not
    /// a JSON object, has no string `type`, or a known type is missing a
    /// required field. Unknown types parse successfully as
    /// [`ClientMessage::Unknown`].
    pub fn parse(text: &str) -> Result<Self> {
        let value: Value = serde_json::from_str(text)
            .map_err(|e| SignalingError::MalformedMessage(format!("invalid JSON: {e}")))?;
        if !value.is_object() {
            return Err(SignalingError::MalformedMessage(
                "frame is not a JSON object".into(),
            ));
        }
        let kind = value
            .get("type")
            .and_then(Value::as_str)
            .ok_or_else(|| SignalingError::MalformedMessage("missing string field `type`".into()))?
            .to_owned();
        let message = ClientMessage::deserialize(&value)
            .map_err(|e| SignalingError::MalformedMessage(format!("{kind}: {e}")))?;

        Ok(Self {
            raw: Arc::new(text.to_owned()),
            value,
            kind,
            message,
        })
    }
}

/// Why a call could not be set up.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FailureReason {
    /// The receiver is not registered or cannot take messages.
    UserUnavailable,
    /// Another live call already uses this `callId`.
    DuplicateCallId,
}

/// Why a call ended.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum EndReason {
    /// A participant sent `call-end`.
    EndedByUser,
    /// A participant's connection closed.
    ParticipantDisconnected,
    /// The relay is shutting down.
    Shutdown,
}

impl EndReason {
    /// Wire spelling.
    pub fn as_str(self) -> &'static str {
        match self {
            Self::EndedByUser => "ended_by_user",
            Self::ParticipantDisconnected => "participant_disconnected",
            Self::Shutdown => "shutdown",
        }
    }
}

impl fmt::Display for EndReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Error codes carried by [`ServerMessage::Error`].
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ErrorCode {
    /// The addressed peer is not reachable.
    RecipientUnavailable,
}

/// Messages the relay sends to peers.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "kebab-case")]
pub enum ServerMessage {
    /// Registration acknowledged.
    #[serde(rename_all = "camelCase")]
    Registered {
        /// Always `true`.
        success: bool,
        /// The identifier now bound to this connection.
        client_id: ClientId,
    },
    /// Someone is calling you.
    #[serde(rename_all = "camelCase")]
    IncomingCall {
        /// Caller.
        from: ClientId,
        /// Call identifier.
        call_id: CallId,
        /// Caller payload.
        #[serde(default, skip_serializing_if = "Option::is_none")]
        data: Option<Value>,
    },
    /// Your call could not be placed.
    #[serde(rename_all = "camelCase")]
    CallFailed {
        /// Failure reason.
        reason: FailureReason,
        /// Call identifier.
        call_id: CallId,
    },
    /// Your call was accepted.
    #[serde(rename_all = "camelCase")]
    CallAccepted {
        /// Receiver.
        from: ClientId,
        /// Call identifier.
        call_id: CallId,
        /// Receiver payload.
        #[serde(default, skip_serializing_if = "Option::is_none")]
        data: Option<Value>,
    },
    /// Your call was declined.
    #[serde(rename_all = "camelCase")]
    CallRejected {
        /// Receiver.
        from: ClientId,
        /// Call identifier.
        call_id: CallId,
    },
    /// A call you were part of is over.
    #[serde(rename_all = "camelCase")]
    CallEnded {
        /// Call identifier.
        call_id: CallId,
        /// End reason.
        reason: EndReason,
        /// Milliseconds since the call connected, `0` if it never did.
        duration: u64,
    },
    /// A direct message could not be delivered.
    #[serde(rename_all = "camelCase")]
    Error {
        /// Error code.
        error: ErrorCode,
        /// The message that could not be delivered.
        original_message: Value,
    },
}

impl ServerMessage {
    /// Value of the `type` field.
    pub fn kind(&self) -> &'static str {
        match self {
            Self::Registered { .. } => "registered",
            Self::IncomingCall { .. } => "incoming-call",
            Self::CallFailed { .. } => "call-failed",
            Self::CallAccepted { .. } => "call-accepted",
            Self::CallRejected { .. } => "call-rejected",
            Self::CallEnded { .. } => "call-ended",
            Self::Error { .. } => "error",
        }
    }

    /// Serialize to a frame.
    pub fn to_frame(&self) -> Result<Arc<String>> {
        Ok(Arc::new(serde_json::to_string(self)?))
    }
}
