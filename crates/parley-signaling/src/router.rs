//! Message routing and the call state machine.
//!
//! Routing happens in two steps. [`Router::dispatch`] interprets one
//! inbound message against the connection's state, applies registry and
//! call-store mutations, and returns the outbound [`Envelope`]s.
//! [`Router::deliver`] then pushes each envelope to its recipient and, when
//! the recipient cannot take it, applies the envelope's [`Undeliverable`]
//! policy.
//!
//! Every removal of a call goes through [`CallSessionStore::delete`], which
//! hands the session to exactly one caller. Only that caller emits
//! `call-ended`, so each participant hears about the end of a call once.

use std::sync::Arc;

use chrono::Utc;
use metrics::{counter, gauge, histogram};
use parley_core::{CallId, ClientId};
use serde_json::Value;
use tracing::{debug, info, warn};

use crate::connection::ClientConnection;
use crate::errors::{Result, SignalingError};
use crate::metrics as names;
use crate::protocol::{ClientMessage, EndReason, ErrorCode, FailureReason, Inbound, ServerMessage};
use crate::registry::ConnectionRegistry;
use crate::session::{CallSessionStore, CallStatus, EndedCall};

/// Routing options.
#[derive(Clone, Debug, Default)]
pub struct RouterConfig {
    /// Relay unrecognized message types that carry a `to` field.
    pub forward_unknown_types: bool,
}

/// Per-connection routing state, owned by the connection's task.
#[derive(Debug)]
pub struct ConnectionState {
    connection: Arc<ClientConnection>,
    client_id: Option<ClientId>,
}

impl ConnectionState {
    /// State for a freshly accepted, not yet registered connection.
    pub fn new(connection: Arc<ClientConnection>) -> Self {
        Self {
            connection,
            client_id: None,
        }
    }

    /// The underlying connection.
    pub fn connection(&self) -> &Arc<ClientConnection> {
        &self.connection
    }

    /// Identifier this connection registered under, if any.
    pub fn client_id(&self) -> Option<&ClientId> {
        self.client_id.as_ref()
    }
}

/// Who an envelope is for.
#[derive(Clone, Debug, PartialEq)]
pub enum Recipient {
    /// The connection the inbound message came from.
    Origin,
    /// Whatever connection is registered under this identifier at delivery time.
    Client(ClientId),
}

/// What an envelope carries.
#[derive(Clone, Debug, PartialEq)]
pub enum Payload {
    /// A message produced by the relay.
    Message(ServerMessage),
    /// An inbound frame relayed byte-for-byte.
    Verbatim(Arc<String>),
}

/// What to do when the recipient cannot take an envelope.
#[derive(Clone, Debug, PartialEq)]
pub enum Undeliverable {
    /// Nothing; the loss is only counted.
    Drop,
    /// Remove the ringing call and tell the origin `call-failed`.
    FailCall {
        /// Call to fail.
        call_id: CallId,
        /// Caller that created it.
        caller: ClientId,
    },
    /// Tell the origin `recipient_unavailable`, echoing this message.
    ReportToOrigin(Value),
}

/// One outbound delivery.
#[derive(Clone, Debug, PartialEq)]
pub struct Envelope {
    /// Recipient.
    pub to: Recipient,
    /// Content.
    pub payload: Payload,
    /// Fallback when delivery fails.
    pub on_undeliverable: Undeliverable,
}

impl Envelope {
    fn to_origin(message: ServerMessage) -> Self {
        Self {
            to: Recipient::Origin,
            payload: Payload::Message(message),
            on_undeliverable: Undeliverable::Drop,
        }
    }

    fn to_client(id: ClientId, payload: Payload, on_undeliverable: Undeliverable) -> Self {
        Self {
            to: Recipient::Client(id),
            payload,
            on_undeliverable,
        }
    }
}

/// Outcome of delivering a batch of envelopes.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct DeliveryReport {
    /// Envelopes accepted by their recipient's queue.
    pub delivered: usize,
    /// Envelopes whose recipient was missing or refused them.
    pub undeliverable: usize,
}

/// Point-in-time counts for health and stats output.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct RelayStats {
    /// Registered clients.
    pub registered_clients: usize,
    /// Calls awaiting an answer.
    pub ringing_calls: usize,
    /// Calls in progress.
    pub connected_calls: usize,
}

impl RelayStats {
    /// Live calls of any status.
    pub fn active_calls(&self) -> usize {
        self.ringing_calls + self.connected_calls
    }
}

/// Routes signaling messages between registered clients.
pub struct Router {
    registry: Arc<ConnectionRegistry>,
    calls: Arc<CallSessionStore>,
    config: RouterConfig,
}

impl Router {
    /// Create a router over shared registry and call store.
    pub fn new(
        registry: Arc<ConnectionRegistry>,
        calls: Arc<CallSessionStore>,
        config: RouterConfig,
    ) -> Self {
        Self {
            registry,
            calls,
            config,
        }
    }

    /// Client registry.
    pub fn registry(&self) -> &Arc<ConnectionRegistry> {
        &self.registry
    }

    /// Call store.
    pub fn calls(&self) -> &Arc<CallSessionStore> {
        &self.calls
    }

    /// Current counts.
    pub fn stats(&self) -> RelayStats {
        let (ringing_calls, connected_calls) = self.calls.status_counts();
        RelayStats {
            registered_clients: self.registry.count(),
            ringing_calls,
            connected_calls,
        }
    }

    /// Parse, dispatch and deliver one text frame.
    pub fn handle_text(&self, state: &mut ConnectionState, text: &str) -> Result<DeliveryReport> {
        let inbound = Inbound::parse(text)?;
        let envelopes = self.dispatch(state, inbound)?;
        Ok(self.deliver(state, envelopes))
    }

    /// Interpret one message and apply its state changes.
    ///
    /// Errors mean the message was ignored: nothing changed and nothing is
    /// to be sent.
    pub fn dispatch(&self, state: &mut ConnectionState, inbound: Inbound) -> Result<Vec<Envelope>> {
        let Inbound {
            raw,
            value,
            kind,
            message,
        } = inbound;
        let label = message.kind();
        counter!(names::MESSAGES_RECEIVED_TOTAL, "type" => label).increment(1);
        let now = Utc::now();

        match message {
            ClientMessage::Register { user_id } => Ok(vec![self.register(state, user_id)]),

            ClientMessage::CallRequest {
                from,
                to,
                call_id,
                data,
            } if state.client_id.as_ref() == Some(&from) => match self.calls.create(
                call_id.clone(),
                from.clone(),
                to.clone(),
                now,
            ) {
                Ok(_) => {
                    info!(call_id = %call_id, caller = %from, receiver = %to, "call requested");
                    counter!(names::CALLS_STARTED_TOTAL).increment(1);
                    self.record_gauges();
                    Ok(vec![Envelope::to_client(
                        to,
                        Payload::Message(ServerMessage::IncomingCall {
                            from: from.clone(),
                            call_id: call_id.clone(),
                            data,
                        }),
                        Undeliverable::FailCall {
                            call_id,
                            caller: from,
                        },
                    )])
                }
                Err(SignalingError::DuplicateCallId(call_id)) => {
                    warn!(call_id = %call_id, caller = %from, "call id already in use");
                    counter!(names::CALLS_FAILED_TOTAL, "reason" => "duplicate_call_id").increment(1);
                    Ok(vec![Envelope::to_origin(ServerMessage::CallFailed {
                        reason: FailureReason::DuplicateCallId,
                        call_id,
                    })])
                }
                Err(e) => Err(e),
            },

            // A caller no connection owns could never be cleaned up.
            ClientMessage::CallRequest { from, .. } => Err(SignalingError::NotRegistered(from)),

            ClientMessage::CallAccept {
                from,
                to,
                call_id,
                data,
            } => {
                let _ = self.calls.accept(&call_id, now)?;
                info!(call_id = %call_id, receiver = %from, "call connected");
                counter!(names::CALLS_CONNECTED_TOTAL).increment(1);
                Ok(vec![Envelope::to_client(
                    to,
                    Payload::Message(ServerMessage::CallAccepted {
                        from,
                        call_id,
                        data,
                    }),
                    Undeliverable::ReportToOrigin(value),
                )])
            }

            ClientMessage::CallReject { from, to, call_id } => {
                if self.calls.delete(&call_id).is_some() {
                    info!(call_id = %call_id, receiver = %from, "call rejected");
                    counter!(names::CALLS_ENDED_TOTAL, "reason" => "rejected").increment(1);
                    self.record_gauges();
                }
                Ok(vec![Envelope::to_client(
                    to,
                    Payload::Message(ServerMessage::CallRejected { from, call_id }),
                    Undeliverable::ReportToOrigin(value),
                )])
            }

            ClientMessage::CallEnd { call_id } => {
                let session = self
                    .calls
                    .delete(&call_id)
                    .ok_or(SignalingError::UnknownCall(call_id))?;
                let ended = session.terminate(EndReason::EndedByUser, now);
                self.record_end(&ended);
                let message = call_ended(&ended);
                Ok(ended
                    .session
                    .participants()
                    .into_iter()
                    .map(|party| {
                        Envelope::to_client(
                            party.clone(),
                            Payload::Message(message.clone()),
                            Undeliverable::Drop,
                        )
                    })
                    .collect())
            }

            ClientMessage::Offer { to }
            | ClientMessage::Answer { to }
            | ClientMessage::IceCandidate { to } => {
                debug!(kind = %kind, to = %to, bytes = raw.len(), "relaying media negotiation");
                counter!(names::MESSAGES_FORWARDED_TOTAL, "type" => label).increment(1);
                Ok(vec![Envelope::to_client(
                    to,
                    Payload::Verbatim(raw),
                    Undeliverable::Drop,
                )])
            }

            ClientMessage::Unknown => {
                let to = value.get("to").and_then(Value::as_str).map(ClientId::from);
                match to {
                    Some(to) if self.config.forward_unknown_types => {
                        debug!(kind = %kind, to = %to, "relaying unrecognized message");
                        counter!(names::MESSAGES_FORWARDED_TOTAL, "type" => label).increment(1);
                        Ok(vec![Envelope::to_client(
                            to,
                            Payload::Verbatim(raw),
                            Undeliverable::ReportToOrigin(value),
                        )])
                    }
                    _ => Err(SignalingError::UnknownMessageType(kind)),
                }
            }
        }
    }

    /// Push envelopes to their recipients, applying fallbacks for failures.
    pub fn deliver(&self, state: &ConnectionState, envelopes: Vec<Envelope>) -> DeliveryReport {
        let mut report = DeliveryReport::default();
        for envelope in envelopes {
            let frame = match envelope.payload {
                Payload::Verbatim(frame) => frame,
                Payload::Message(message) => match message.to_frame() {
                    Ok(frame) => frame,
                    Err(e) => {
                        warn!(error = %e, kind = message.kind(), "failed to serialize outbound message");
                        report.undeliverable += 1;
                        continue;
                    }
                },
            };

            let sent = match &envelope.to {
                Recipient::Origin => state.connection.send(frame),
                Recipient::Client(id) => self.registry.send_to(id, frame).is_ok(),
            };

            if sent {
                report.delivered += 1;
                continue;
            }
            report.undeliverable += 1;
            self.undeliverable(state, &envelope.to, envelope.on_undeliverable);
        }
        report
    }

    /// Clean up after the connection closed.
    ///
    /// Deregisters the client if this connection is still its current one
    /// and ends its calls, notifying only the other party. Returns the
    /// number of calls ended.
    pub fn disconnect(&self, state: &mut ConnectionState) -> usize {
        state.connection.close();
        self.release(state, EndReason::ParticipantDisconnected)
    }

    /// Clean up a connection the server is about to close.
    ///
    /// Any call still involving the client ends with reason `shutdown`. The
    /// connection stops accepting frames afterwards, so frames already
    /// queued can still be flushed before the transport closes.
    pub fn shutdown(&self, state: &mut ConnectionState) -> usize {
        let ended = self.release(state, EndReason::Shutdown);
        state.connection.close();
        ended
    }

    /// End every live call, notifying both parties.
    ///
    /// Run before connections start tearing down so every participant is
    /// still registered and reachable.
    pub fn end_all_calls(&self, reason: EndReason) -> usize {
        let now = Utc::now();
        let mut ended = 0;
        for call_id in self.calls.call_ids() {
            let Some(session) = self.calls.delete(&call_id) else {
                continue;
            };
            let record = session.terminate(reason, now);
            self.record_end(&record);
            ended += 1;
            self.notify_ended(&record, record.session.participants());
        }
        if ended > 0 {
            self.record_gauges();
        }
        ended
    }

    fn register(&self, state: &mut ConnectionState, user_id: ClientId) -> Envelope {
        let connection = &state.connection;
        if let Some(previous) = state.client_id.take() {
            if previous != user_id && self.registry.remove_if_current(&previous, connection.id()) {
                let calls_ended = self.end_calls_of(&previous, EndReason::ParticipantDisconnected);
                info!(
                    client_id = %previous,
                    connection_id = %connection.id(),
                    calls_ended,
                    "released previous registration"
                );
            }
        }

        let replaced = self.registry.register(user_id.clone(), Arc::clone(connection));
        if let Some(old) = replaced.filter(|old| old.id() != connection.id()) {
            info!(client_id = %user_id, replaced = %old.id(), "client re-registered from a new connection");
        }
        info!(
            client_id = %user_id,
            connection_id = %connection.id(),
            clients = self.registry.count(),
            "client registered"
        );
        state.client_id = Some(user_id.clone());
        self.record_gauges();

        Envelope::to_origin(ServerMessage::Registered {
            success: true,
            client_id: user_id,
        })
    }

    fn undeliverable(&self, state: &ConnectionState, to: &Recipient, policy: Undeliverable) {
        let reason = match policy {
            Undeliverable::Drop => "recipient_unavailable",
            Undeliverable::FailCall { .. } => "user_unavailable",
            Undeliverable::ReportToOrigin(_) => "reported",
        };
        counter!(names::MESSAGES_DROPPED_TOTAL, "reason" => reason).increment(1);

        match policy {
            Undeliverable::Drop => {
                debug!(to = ?to, "recipient unavailable, message dropped");
            }
            Undeliverable::FailCall { call_id, caller } => {
                let removed = self.calls.delete_if(&call_id, |s| {
                    s.status == CallStatus::Ringing && s.caller == caller
                });
                if removed.is_none() {
                    debug!(call_id = %call_id, "call already gone, not reporting failure");
                    return;
                }
                self.record_gauges();
                info!(call_id = %call_id, caller = %caller, "receiver unavailable, call failed");
                counter!(names::CALLS_FAILED_TOTAL, "reason" => "user_unavailable").increment(1);
                let _ = state.connection.send_message(&ServerMessage::CallFailed {
                    reason: FailureReason::UserUnavailable,
                    call_id,
                });
            }
            Undeliverable::ReportToOrigin(original) => {
                debug!(to = ?to, "recipient unavailable, reporting to sender");
                let _ = state.connection.send_message(&ServerMessage::Error {
                    error: ErrorCode::RecipientUnavailable,
                    original_message: original,
                });
            }
        }
    }

    fn release(&self, state: &mut ConnectionState, reason: EndReason) -> usize {
        let Some(client_id) = state.client_id.take() else {
            return 0;
        };
        if !self
            .registry
            .remove_if_current(&client_id, state.connection.id())
        {
            debug!(client_id = %client_id, "superseded connection closed, registration kept");
            return 0;
        }

        let ended = self.end_calls_of(&client_id, reason);
        info!(
            client_id = %client_id,
            calls_ended = ended,
            reason = %reason,
            clients = self.registry.count(),
            "client deregistered"
        );
        self.record_gauges();
        ended
    }

    /// End every call involving `client_id`, notifying only the other party.
    fn end_calls_of(&self, client_id: &ClientId, reason: EndReason) -> usize {
        let now = Utc::now();
        let mut ended = 0;
        for call_id in self.calls.sessions_involving(client_id) {
            // Lost the race to another remover.
            let Some(session) = self.calls.delete(&call_id) else {
                continue;
            };
            let record = session.terminate(reason, now);
            self.record_end(&record);
            ended += 1;

            if let Some(other) = record.session.other_party(client_id) {
                if other != client_id {
                    self.notify_ended(&record, vec![other]);
                }
            }
        }
        if ended > 0 {
            self.record_gauges();
        }
        ended
    }

    fn notify_ended(&self, ended: &EndedCall, parties: Vec<&ClientId>) {
        let frame = match call_ended(ended).to_frame() {
            Ok(frame) => frame,
            Err(e) => {
                warn!(error = %e, "failed to serialize call-ended");
                return;
            }
        };
        for party in parties {
            if self.registry.send_to(party, Arc::clone(&frame)).is_err() {
                counter!(names::MESSAGES_DROPPED_TOTAL, "reason" => "recipient_unavailable")
                    .increment(1);
            }
        }
    }

    #[allow(clippy::cast_precision_loss)]
    fn record_end(&self, ended: &EndedCall) {
        info!(
            call_id = %ended.session.call_id,
            caller = %ended.session.caller,
            receiver = %ended.session.receiver,
            reason = %ended.reason,
            duration_ms = ended.duration_ms,
            "call ended"
        );
        counter!(names::CALLS_ENDED_TOTAL, "reason" => ended.reason.as_str()).increment(1);
        if ended.session.connect_time.is_some() {
            histogram!(names::CALL_DURATION_SECONDS).record(ended.duration_ms as f64 / 1000.0);
        }
    }

    #[allow(clippy::cast_precision_loss)]
    fn record_gauges(&self) {
        gauge!(names::CLIENTS_REGISTERED).set(self.registry.count() as f64);
        gauge!(names::CALLS_ACTIVE).set(self.calls.len() as f64);
    }
}

fn call_ended(ended: &EndedCall) -> ServerMessage {
    ServerMessage::CallEnded {
        call_id: ended.session.call_id.clone(),
        reason: ended.reason,
        duration: ended.duration_ms,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use assert_matches::assert_matches;
    use parley_core::logging::capture_logs;
    use serde_json::json;
    use tokio::sync::mpsc;
    use tracing::Level;

    struct Peer {
        state: ConnectionState,
        rx: mpsc::Receiver<Arc<String>>,
    }

    impl Peer {
        fn new(capacity: usize) -> Self {
            let (conn, rx) = ClientConnection::channel(capacity);
            Self {
                state: ConnectionState::new(Arc::new(conn)),
                rx,
            }
        }

        fn frames(&mut self) -> Vec<String> {
            let mut out = Vec::new();
            while let Ok(frame) = self.rx.try_recv() {
                out.push(frame.as_str().to_owned());
            }
            out
        }

        fn messages(&mut self) -> Vec<Value> {
            self.frames()
                .iter()
                .map(|f| serde_json::from_str(f).unwrap())
                .collect()
        }
    }

    fn router() -> Router {
        router_with(RouterConfig::default())
    }

    fn router_with(config: RouterConfig) -> Router {
        Router::new(
            Arc::new(ConnectionRegistry::new()),
            Arc::new(CallSessionStore::new()),
            config,
        )
    }

    fn send(router: &Router, peer: &mut Peer, message: Value) -> Result<DeliveryReport> {
        router.handle_text(&mut peer.state, &message.to_string())
    }

    fn registered(router: &Router, id: &str) -> Peer {
        let mut peer = Peer::new(16);
        let _ = send(router, &mut peer, json!({"type":"register","userId":id})).unwrap();
        let _ = peer.frames();
        peer
    }

    fn request(router: &Router, caller: &mut Peer, from: &str, to: &str, call_id: &str) {
        let _ = send(
            router,
            caller,
            json!({"type":"call-request","from":from,"to":to,"callId":call_id}),
        )
        .unwrap();
    }

    /// Alice calls Bob and Bob accepts; both queues drained.
    fn connected_call(router: &Router) -> (Peer, Peer) {
        let mut alice = registered(router, "alice");
        let mut bob = registered(router, "bob");
        request(router, &mut alice, "alice", "bob", "c1");
        let _ = send(
            router,
            &mut bob,
            json!({"type":"call-accept","from":"bob","to":"alice","callId":"c1"}),
        )
        .unwrap();
        let _ = alice.frames();
        let _ = bob.frames();
        (alice, bob)
    }

    // ── registration ────────────────────────────────────────────────

    #[test]
    fn register_replies_and_binds() {
        let router = router();
        let mut peer = Peer::new(4);
        let report = send(&router, &mut peer, json!({"type":"register","userId":"alice"})).unwrap();
        assert_eq!(report.delivered, 1);
        assert_eq!(
            peer.messages(),
            vec![json!({"type":"registered","success":true,"clientId":"alice"})]
        );
        assert_eq!(peer.state.client_id(), Some(&ClientId::from("alice")));
        let found = router.registry().lookup(&"alice".into()).unwrap();
        assert_eq!(found.id(), peer.state.connection().id());
    }

    #[test]
    fn re_register_replaces_and_stale_close_keeps_replacement() {
        let router = router();
        let mut old = registered(&router, "alice");
        let mut new = registered(&router, "alice");
        assert_eq!(
            router.registry().lookup(&"alice".into()).unwrap().id(),
            new.state.connection().id()
        );

        let mut bob = registered(&router, "bob");
        request(&router, &mut bob, "bob", "alice", "c1");
        assert!(old.frames().is_empty(), "stale connection must not receive");
        assert_eq!(new.messages()[0]["type"], "incoming-call");

        assert_eq!(router.disconnect(&mut old.state), 0);
        assert!(router.registry().contains(&"alice".into()));
        assert!(router.calls().get(&"c1".into()).is_some());
    }

    #[test]
    fn register_under_new_id_releases_old() {
        let router = router();
        let mut peer = registered(&router, "alice");
        let _ = send(&router, &mut peer, json!({"type":"register","userId":"alicia"})).unwrap();
        assert!(!router.registry().contains(&"alice".into()));
        assert!(router.registry().contains(&"alicia".into()));
        assert_eq!(router.stats().registered_clients, 1);
    }

    #[test]
    fn register_under_new_id_ends_calls_of_old_id() {
        let router = router();
        let (mut alice, mut bob) = connected_call(&router);
        let _ = send(&router, &mut alice, json!({"type":"register","userId":"alicia"})).unwrap();

        let messages = bob.messages();
        assert_eq!(messages.len(), 1);
        assert_eq!(messages[0]["type"], "call-ended");
        assert_eq!(messages[0]["callId"], "c1");
        assert_eq!(messages[0]["reason"], "participant_disconnected");
        assert!(router.calls().get(&"c1".into()).is_none());
        assert_eq!(
            alice.messages(),
            vec![json!({"type":"registered","success":true,"clientId":"alicia"})]
        );

        assert_eq!(router.disconnect(&mut alice.state), 0);
        assert!(router.calls().is_empty());
    }

    #[test]
    fn call_request_for_unowned_id_is_refused() {
        let router = router();
        let mut bob = registered(&router, "bob");
        let mut stranger = Peer::new(4);
        assert_matches!(
            send(
                &router,
                &mut stranger,
                json!({"type":"call-request","from":"alice","to":"bob","callId":"c1"}),
            ),
            Err(SignalingError::NotRegistered(id)) if id.as_str() == "alice"
        );

        let mut mallory = registered(&router, "mallory");
        assert_matches!(
            send(
                &router,
                &mut mallory,
                json!({"type":"call-request","from":"alice","to":"bob","callId":"c2"}),
            ),
            Err(SignalingError::NotRegistered(_))
        );
        assert!(bob.frames().is_empty());
        assert!(router.calls().is_empty());
    }

    // ── call setup ──────────────────────────────────────────────────

    #[test]
    fn call_request_rings_receiver_once() {
        let router = router();
        let mut alice = registered(&router, "alice");
        let mut bob = registered(&router, "bob");
        let _ = send(
            &router,
            &mut alice,
            json!({"type":"call-request","from":"alice","to":"bob","callId":"c1","data":{"video":true}}),
        )
        .unwrap();

        assert_eq!(
            bob.messages(),
            vec![json!({"type":"incoming-call","from":"alice","callId":"c1","data":{"video":true}})]
        );
        assert!(alice.frames().is_empty());
        let session = router.calls().get(&"c1".into()).unwrap();
        assert_eq!(session.status, CallStatus::Ringing);
        assert_eq!(session.caller.as_str(), "alice");
        assert_eq!(session.receiver.as_str(), "bob");
    }

    #[test]
    fn call_request_to_offline_receiver_fails() {
        let router = router();
        let mut alice = registered(&router, "alice");
        let report = send(
            &router,
            &mut alice,
            json!({"type":"call-request","from":"alice","to":"bob","callId":"c1"}),
        )
        .unwrap();

        assert_eq!(report.undeliverable, 1);
        assert_eq!(
            alice.messages(),
            vec![json!({"type":"call-failed","reason":"user_unavailable","callId":"c1"})]
        );
        assert!(router.calls().get(&"c1".into()).is_none());
    }

    #[test]
    fn call_request_to_saturated_receiver_fails() {
        let router = router();
        let mut alice = registered(&router, "alice");
        let mut bob = Peer::new(1);
        let _ = send(&router, &mut bob, json!({"type":"register","userId":"bob"})).unwrap();
        // `registered` reply still occupies bob's only slot.
        request(&router, &mut alice, "alice", "bob", "c1");
        assert_eq!(alice.messages()[0]["reason"], "user_unavailable");
        assert!(router.calls().is_empty());
    }

    #[test]
    fn duplicate_call_id_rejected() {
        let router = router();
        let mut alice = registered(&router, "alice");
        let mut bob = registered(&router, "bob");
        let mut carol = registered(&router, "carol");
        request(&router, &mut alice, "alice", "bob", "c1");
        request(&router, &mut carol, "carol", "bob", "c1");

        assert_eq!(
            carol.messages(),
            vec![json!({"type":"call-failed","reason":"duplicate_call_id","callId":"c1"})]
        );
        assert_eq!(bob.messages().len(), 1);
        assert_eq!(router.calls().get(&"c1".into()).unwrap().caller.as_str(), "alice");
    }

    #[test]
    fn accept_connects_and_notifies_caller() {
        let router = router();
        let mut alice = registered(&router, "alice");
        let mut bob = registered(&router, "bob");
        request(&router, &mut alice, "alice", "bob", "c1");
        let _ = bob.frames();

        let _ = send(
            &router,
            &mut bob,
            json!({"type":"call-accept","from":"bob","to":"alice","callId":"c1","data":{"sdp":"x"}}),
        )
        .unwrap();
        assert_eq!(
            alice.messages(),
            vec![json!({"type":"call-accepted","from":"bob","callId":"c1","data":{"sdp":"x"}})]
        );
        let session = router.calls().get(&"c1".into()).unwrap();
        assert_eq!(session.status, CallStatus::Connected);
        assert!(session.connect_time.is_some());
        assert_eq!(router.stats().connected_calls, 1);
    }

    #[test]
    fn accept_unknown_call_is_ignored() {
        let router = router();
        let mut alice = registered(&router, "alice");
        let mut bob = registered(&router, "bob");
        let result = send(
            &router,
            &mut bob,
            json!({"type":"call-accept","from":"bob","to":"alice","callId":"nope"}),
        );
        assert_matches!(result, Err(SignalingError::UnknownCall(_)));
        assert!(alice.frames().is_empty());
        assert!(router.calls().is_empty());
    }

    #[test]
    fn accept_twice_is_ignored() {
        let router = router();
        let (mut alice, mut bob) = connected_call(&router);
        let result = send(
            &router,
            &mut bob,
            json!({"type":"call-accept","from":"bob","to":"alice","callId":"c1"}),
        );
        assert_matches!(result, Err(SignalingError::InvalidTransition { .. }));
        assert!(alice.frames().is_empty());
    }

    #[test]
    fn accept_to_unreachable_caller_reports_to_sender() {
        let router = router();
        let mut alice = registered(&router, "alice");
        let mut bob = registered(&router, "bob");
        request(&router, &mut alice, "alice", "bob", "c1");
        let _ = bob.frames();
        // Transport gone but cleanup not yet run.
        alice.state.connection().close();

        let accept = json!({"type":"call-accept","from":"bob","to":"alice","callId":"c1"});
        let _ = send(&router, &mut bob, accept.clone()).unwrap();
        assert_eq!(
            bob.messages(),
            vec![json!({"type":"error","error":"recipient_unavailable","originalMessage":accept})]
        );
    }

    #[test]
    fn reject_notifies_caller_and_removes_call() {
        let router = router();
        let mut alice = registered(&router, "alice");
        let mut bob = registered(&router, "bob");
        request(&router, &mut alice, "alice", "bob", "c1");

        let _ = send(
            &router,
            &mut bob,
            json!({"type":"call-reject","from":"bob","to":"alice","callId":"c1"}),
        )
        .unwrap();
        assert_eq!(
            alice.messages(),
            vec![json!({"type":"call-rejected","from":"bob","callId":"c1"})]
        );
        assert!(router.calls().is_empty());
    }

    // ── call teardown ───────────────────────────────────────────────

    #[test]
    fn end_notifies_both_and_removes_call() {
        let router = router();
        let (mut alice, mut bob) = connected_call(&router);
        let _ = send(&router, &mut alice, json!({"type":"call-end","callId":"c1"})).unwrap();

        for peer in [&mut alice, &mut bob] {
            let messages = peer.messages();
            assert_eq!(messages.len(), 1);
            assert_eq!(messages[0]["type"], "call-ended");
            assert_eq!(messages[0]["callId"], "c1");
            assert_eq!(messages[0]["reason"], "ended_by_user");
            assert!(messages[0]["duration"].as_u64().is_some());
        }
        assert!(router.calls().is_empty());
    }

    #[test]
    fn end_ringing_call_reports_zero_duration() {
        let router = router();
        let mut alice = registered(&router, "alice");
        let mut bob = registered(&router, "bob");
        request(&router, &mut alice, "alice", "bob", "c1");
        let _ = bob.frames();
        let _ = send(&router, &mut alice, json!({"type":"call-end","callId":"c1"})).unwrap();
        assert_eq!(bob.messages()[0]["duration"], 0);
    }

    #[test]
    fn end_unknown_call_is_ignored() {
        let router = router();
        let mut alice = registered(&router, "alice");
        assert_matches!(
            send(&router, &mut alice, json!({"type":"call-end","callId":"ghost"})),
            Err(SignalingError::UnknownCall(_))
        );
        assert!(alice.frames().is_empty());
    }

    #[test]
    fn disconnect_ends_call_for_other_party_once() {
        let router = router();
        let (mut alice, mut bob) = connected_call(&router);

        assert_eq!(router.disconnect(&mut alice.state), 1);
        let messages = bob.messages();
        assert_eq!(messages.len(), 1);
        assert_eq!(messages[0]["type"], "call-ended");
        assert_eq!(messages[0]["reason"], "participant_disconnected");
        assert!(alice.frames().is_empty());
        assert!(router.calls().is_empty());
        assert!(!router.registry().contains(&"alice".into()));

        assert_eq!(router.disconnect(&mut bob.state), 0);
        assert!(bob.frames().is_empty());
    }

    #[test]
    fn disconnect_ends_every_call_of_client() {
        let router = router();
        let mut alice = registered(&router, "alice");
        let mut bob = registered(&router, "bob");
        let mut carol = registered(&router, "carol");
        request(&router, &mut alice, "alice", "bob", "c1");
        request(&router, &mut carol, "carol", "alice", "c2");
        let _ = bob.frames();
        let _ = alice.frames();

        assert_eq!(router.disconnect(&mut alice.state), 2);
        assert_eq!(bob.messages()[0]["callId"], "c1");
        assert_eq!(carol.messages()[0]["callId"], "c2");
        assert!(router.calls().is_empty());
    }

    #[test]
    fn disconnect_of_unregistered_connection_is_noop() {
        let router = router();
        let mut peer = Peer::new(4);
        assert_eq!(router.disconnect(&mut peer.state), 0);
        assert!(peer.state.connection().is_closed());
    }

    #[test]
    fn end_all_calls_notifies_both_parties() {
        let router = router();
        let (mut alice, mut bob) = connected_call(&router);
        let mut carol = registered(&router, "carol");
        request(&router, &mut carol, "carol", "dave", "c2");
        let _ = carol.frames();

        assert_eq!(router.end_all_calls(EndReason::Shutdown), 1);
        for peer in [&mut alice, &mut bob] {
            let messages = peer.messages();
            assert_eq!(messages.len(), 1);
            assert_eq!(messages[0]["reason"], "shutdown");
        }
        assert!(router.calls().is_empty());

        assert_eq!(router.shutdown(&mut alice.state), 0);
        assert!(alice.state.connection().is_closed());
        assert!(!router.registry().contains(&"alice".into()));
    }

    #[test]
    fn shutdown_ends_remaining_calls_for_other_party() {
        let router = router();
        let (mut alice, mut bob) = connected_call(&router);
        assert_eq!(router.shutdown(&mut alice.state), 1);
        assert_eq!(bob.messages()[0]["reason"], "shutdown");
        assert!(alice.frames().is_empty());
    }

    // ── media negotiation ───────────────────────────────────────────

    #[test]
    fn ice_candidate_relayed_verbatim() {
        let router = router();
        let mut alice = registered(&router, "alice");
        let mut bob = registered(&router, "bob");
        let text = r#"{"type":"ice-candidate","to":"bob","from":"alice","candidate":{"candidate":"candidate:0 1 UDP 2122252543 192.0.2.1 49203 typ host","sdpMLineIndex":0}}"#;

        let report = router.handle_text(&mut alice.state, text).unwrap();
        assert_eq!(report.delivered, 1);
        assert_eq!(bob.frames(), vec![text.to_owned()]);
    }

    #[test]
    fn offer_and_answer_relayed_verbatim() {
        let router = router();
        let mut alice = registered(&router, "alice");
        let mut bob = registered(&router, "bob");
        let offer = r#"{"type":"offer","to":"bob","sdp":"v=0\r\no=- 1 2 IN IP4 127.0.0.1"}"#;
        let answer = r#"{"type":"answer","to":"alice","sdp":"v=0"}"#;
        let _ = router.handle_text(&mut alice.state, offer).unwrap();
        let _ = router.handle_text(&mut bob.state, answer).unwrap();
        assert_eq!(bob.frames(), vec![offer.to_owned()]);
        assert_eq!(alice.frames(), vec![answer.to_owned()]);
    }

    #[test]
    fn media_negotiation_to_absent_peer_is_silent() {
        let router = router();
        let mut alice = registered(&router, "alice");
        let report = send(
            &router,
            &mut alice,
            json!({"type":"ice-candidate","to":"bob","candidate":{}}),
        )
        .unwrap();
        assert_eq!(report.undeliverable, 1);
        assert!(alice.frames().is_empty());
    }

    // ── other frames ────────────────────────────────────────────────

    #[test]
    fn unknown_type_dropped_by_default() {
        let router = router();
        let mut alice = registered(&router, "alice");
        let mut bob = registered(&router, "bob");
        assert_matches!(
            send(&router, &mut alice, json!({"type":"chat","to":"bob","text":"hi"})),
            Err(SignalingError::UnknownMessageType(kind)) if kind == "chat"
        );
        assert!(bob.frames().is_empty());
    }

    #[test]
    fn unknown_type_forwarded_when_enabled() {
        let router = router_with(RouterConfig {
            forward_unknown_types: true,
        });
        let mut alice = registered(&router, "alice");
        let mut bob = registered(&router, "bob");
        let text = r#"{"type":"chat","to":"bob","text":"hi"}"#;
        let _ = router.handle_text(&mut alice.state, text).unwrap();
        assert_eq!(bob.frames(), vec![text.to_owned()]);

        let missing = json!({"type":"chat","to":"nobody","text":"hi"});
        let _ = send(&router, &mut alice, missing.clone()).unwrap();
        assert_eq!(
            alice.messages(),
            vec![json!({"type":"error","error":"recipient_unavailable","originalMessage":missing})]
        );
    }

    #[test]
    fn malformed_frame_changes_nothing() {
        let router = router();
        let mut alice = registered(&router, "alice");
        assert_matches!(
            router.handle_text(&mut alice.state, "{oops"),
            Err(SignalingError::MalformedMessage(_))
        );
        assert_matches!(
            send(&router, &mut alice, json!({"type":"call-request","from":"alice"})),
            Err(SignalingError::MalformedMessage(_))
        );
        assert!(alice.frames().is_empty());
        assert!(router.calls().is_empty());
        assert!(router.registry().contains(&"alice".into()));
    }

    // ── dispatch/deliver split ──────────────────────────────────────

    #[test]
    fn dispatch_produces_envelopes_without_sending() {
        let router = router();
        let mut alice = registered(&router, "alice");
        let inbound =
            Inbound::parse(r#"{"type":"call-request","from":"alice","to":"bob","callId":"c9"}"#)
                .unwrap();
        let envelopes = router.dispatch(&mut alice.state, inbound).unwrap();

        assert_eq!(envelopes.len(), 1);
        assert_eq!(envelopes[0].to, Recipient::Client("bob".into()));
        assert_matches!(
            &envelopes[0].on_undeliverable,
            Undeliverable::FailCall { call_id, .. } if call_id.as_str() == "c9"
        );
        assert!(router.calls().get(&"c9".into()).is_some());
        assert!(alice.frames().is_empty());

        let report = router.deliver(&alice.state, envelopes);
        assert_eq!(report, DeliveryReport { delivered: 0, undeliverable: 1 });
        assert!(router.calls().get(&"c9".into()).is_none());
    }

    #[test]
    fn failed_delivery_of_already_ended_call_is_not_reported() {
        let router = router();
        let mut alice = registered(&router, "alice");
        let inbound =
            Inbound::parse(r#"{"type":"call-request","from":"alice","to":"bob","callId":"c3"}"#)
                .unwrap();
        let envelopes = router.dispatch(&mut alice.state, inbound).unwrap();
        let _ = send(&router, &mut alice, json!({"type":"call-end","callId":"c3"})).unwrap();
        let _ = alice.frames();

        let report = router.deliver(&alice.state, envelopes);
        assert_eq!(report.undeliverable, 1);
        assert!(alice.frames().is_empty());
        assert!(router.calls().is_empty());
    }

    #[test]
    fn call_lifecycle_is_logged() {
        let (logs, _guard) = capture_logs();
        let router = router();
        let (mut alice, _bob) = connected_call(&router);
        let _ = send(&router, &mut alice, json!({"type":"call-end","callId":"c1"})).unwrap();

        assert!(logs.has_event(Level::INFO, "call requested"));
        assert!(logs.has_event(Level::INFO, "call connected"));
        let ended = logs
            .events()
            .into_iter()
            .find(|e| e.message == "call ended")
            .unwrap();
        assert_eq!(ended.field("reason"), Some("ended_by_user"));
        assert_eq!(ended.field("call_id"), Some("c1"));
    }
}
