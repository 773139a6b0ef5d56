//! Call sessions and their store.
//!
//! A session is created `ringing` by a call request, moves to `connected`
//! when the receiver accepts, and is removed from the store when it ends.
//! Ended sessions never remain in the store; [`CallSession::terminate`]
//! produces the final record for notifications and logs.

use chrono::{DateTime, Utc};
use dashmap::DashMap;
use dashmap::mapref::entry::Entry;
use parley_core::{CallId, ClientId};
use serde::Serialize;

use crate::errors::{Result, SignalingError};
use crate::protocol::EndReason;

/// Lifecycle status of a call.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum CallStatus {
    /// Requested, awaiting the receiver.
    Ringing,
    /// Accepted by the receiver.
    Connected,
    /// Over; only seen on terminated records.
    Ended,
}

/// One call attempt between two clients.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct CallSession {
    /// Caller-chosen identifier.
    pub call_id: CallId,
    /// Who placed the call.
    pub caller: ClientId,
    /// Who was called.
    pub receiver: ClientId,
    /// Current status.
    pub status: CallStatus,
    /// When the request arrived.
    pub start_time: DateTime<Utc>,
    /// When the receiver accepted.
    pub connect_time: Option<DateTime<Utc>>,
}

/// Final record of a call that has ended.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct EndedCall {
    /// The session as it was when it ended, with status `Ended`.
    pub session: CallSession,
    /// Why it ended.
    pub reason: EndReason,
    /// Milliseconds between connect and end, `0` if it never connected.
    pub duration_ms: u64,
}

impl CallSession {
    /// A freshly requested call.
    pub fn ringing(call_id: CallId, caller: ClientId, receiver: ClientId, now: DateTime<Utc>) -> Self {
        Self {
            call_id,
            caller,
            receiver,
            status: CallStatus::Ringing,
            start_time: now,
            connect_time: None,
        }
    }

    /// Move from ringing to connected.
    pub fn accept(&mut self, now: DateTime<Utc>) -> Result<()> {
        if self.status != CallStatus::Ringing {
            return Err(SignalingError::InvalidTransition {
                call_id: self.call_id.clone(),
                status: self.status,
                action: "accept",
            });
        }
        self.status = CallStatus::Connected;
        self.connect_time = Some(now);
        Ok(())
    }

    /// Milliseconds connected as of `now`; `0` if never connected.
    pub fn duration_ms(&self, now: DateTime<Utc>) -> u64 {
        self.connect_time.map_or(0, |connected| {
            u64::try_from((now - connected).num_milliseconds()).unwrap_or(0)
        })
    }

    /// End the call.
    pub fn terminate(mut self, reason: EndReason, now: DateTime<Utc>) -> EndedCall {
        let duration_ms = self.duration_ms(now);
        self.status = CallStatus::Ended;
        EndedCall {
            session: self,
            reason,
            duration_ms,
        }
    }

    /// Whether `id` is the caller or the receiver.
    pub fn involves(&self, id: &ClientId) -> bool {
        self.caller == *id || self.receiver == *id
    }

    /// The participant that is not `id`, if `id` participates.
    pub fn other_party(&self, id: &ClientId) -> Option<&ClientId> {
        if self.caller == *id {
            Some(&self.receiver)
        } else if self.receiver == *id {
            Some(&self.caller)
        } else {
            None
        }
    }

    /// Both participants, deduplicated when a client called itself.
    pub fn participants(&self) -> Vec<&ClientId> {
        if self.caller == self.receiver {
            vec![&self.caller]
        } else {
            vec![&self.caller, &self.receiver]
        }
    }
}

/// Concurrent map of live calls keyed by call identifier.
///
/// Every mutation of one session happens under that key's shard lock, so
/// two racing removals of the same call see exactly one winner.
#[derive(Default)]
pub struct CallSessionStore {
    sessions: DashMap<CallId, CallSession>,
}

impl CallSessionStore {
    /// Create an empty store.
    pub fn new() -> Self {
        Self::default()
    }

    /// Insert a new ringing call. Fails if the identifier is already live.
    pub fn create(
        &self,
        call_id: CallId,
        caller: ClientId,
        receiver: ClientId,
        now: DateTime<Utc>,
    ) -> Result<CallSession> {
        match self.sessions.entry(call_id) {
            Entry::Occupied(entry) => Err(SignalingError::DuplicateCallId(entry.key().clone())),
            Entry::Vacant(entry) => {
                let session = CallSession::ringing(entry.key().clone(), caller, receiver, now);
                let _ = entry.insert(session.clone());
                Ok(session)
            }
        }
    }

    /// Snapshot of a call.
    pub fn get(&self, call_id: &CallId) -> Option<CallSession> {
        self.sessions.get(call_id).map(|s| s.value().clone())
    }

    /// Apply `f` to a call under its lock.
    pub fn update<T>(&self, call_id: &CallId, f: impl FnOnce(&mut CallSession) -> T) -> Option<T> {
        self.sessions.get_mut(call_id).map(|mut s| f(s.value_mut()))
    }

    /// Mark a ringing call connected, returning the updated snapshot.
    pub fn accept(&self, call_id: &CallId, now: DateTime<Utc>) -> Result<CallSession> {
        self.update(call_id, |session| -> Result<CallSession> {
            session.accept(now)?;
            Ok(session.clone())
        })
        .unwrap_or_else(|| Err(SignalingError::UnknownCall(call_id.clone())))
    }

    /// Remove a call. Only one of several concurrent callers gets `Some`.
    pub fn delete(&self, call_id: &CallId) -> Option<CallSession> {
        self.sessions.remove(call_id).map(|(_, s)| s)
    }

    /// Remove a call only if `predicate` holds for it.
    pub fn delete_if(
        &self,
        call_id: &CallId,
        predicate: impl FnOnce(&CallSession) -> bool,
    ) -> Option<CallSession> {
        self.sessions
            .remove_if(call_id, |_, s| predicate(s))
            .map(|(_, s)| s)
    }

    /// Identifiers of calls in which `client` participates.
    pub fn sessions_involving(&self, client: &ClientId) -> Vec<CallId> {
        self.sessions
            .iter()
            .filter(|e| e.value().involves(client))
            .map(|e| e.key().clone())
            .collect()
    }

    /// Identifiers of all live calls.
    pub fn call_ids(&self) -> Vec<CallId> {
        self.sessions.iter().map(|e| e.key().clone()).collect()
    }

    /// Number of live calls.
    pub fn len(&self) -> usize {
        self.sessions.len()
    }

    /// Whether there are no live calls.
    pub fn is_empty(&self) -> bool {
        self.sessions.is_empty()
    }

    /// Live calls grouped by status: `(ringing, connected)`.
    pub fn status_counts(&self) -> (usize, usize) {
        self.sessions
            .iter()
            .fold((0, 0), |(ringing, connected), e| match e.value().status {
                CallStatus::Ringing => (ringing + 1, connected),
                CallStatus::Connected => (ringing, connected + 1),
                CallStatus::Ended => (ringing, connected),
            })
    }
}
