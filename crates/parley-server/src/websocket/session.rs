//! WebSocket session lifecycle: one connected peer from upgrade through
//! disconnect.
//!
//! The read half runs in the session task and feeds text frames to the
//! router in arrival order. The write half runs in a separate task that
//! drains the connection's outbound queue and sends heartbeat pings. Either
//! side ending tears the session down, and cleanup always runs exactly once
//! through the router.

use std::sync::Arc;

use axum::extract::ws::{CloseFrame, Message, WebSocket, close_code};
use futures::stream::SplitSink;
use futures::{SinkExt, StreamExt};
use metrics::{counter, gauge, histogram};
use parley_signaling::{ClientConnection, ConnectionState, Router, SignalingError};
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing::{Instrument, Span, debug, info, instrument, trace, warn};

use crate::config::ServerConfig;
use crate::metrics as names;

/// Why the read loop stopped.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
enum Exit {
    /// Peer sent Close or the stream ended.
    PeerClosed,
    /// Socket error, heartbeat timeout or failed write.
    Transport,
    /// Server shutdown.
    Shutdown,
}

/// Run a WebSocket session for a connected peer.
#[instrument(skip_all, fields(conn_id = tracing::field::Empty, client_id = tracing::field::Empty))]
pub async fn run_ws_session(
    ws: WebSocket,
    router: Arc<Router>,
    config: Arc<ServerConfig>,
    shutdown: CancellationToken,
) {
    let (connection, send_rx) = ClientConnection::channel(config.send_queue_capacity);
    let connection = Arc::new(connection);
    let _ = Span::current().record("conn_id", connection.id().as_str());
    let mut state = ConnectionState::new(Arc::clone(&connection));

    info!("client connected");
    counter!(names::WS_CONNECTIONS_TOTAL).increment(1);
    gauge!(names::WS_CONNECTIONS_ACTIVE).increment(1.0);

    let (ws_tx, mut ws_rx) = ws.split();
    let finish = CancellationToken::new();
    let writer_gone = CancellationToken::new();
    let writer = tokio::spawn(write_loop(
        ws_tx,
        send_rx,
        Arc::clone(&connection),
        Arc::clone(&config),
        finish.clone(),
        writer_gone.clone(),
        shutdown.clone(),
    )
    .instrument(Span::current()));

    let exit = loop {
        tokio::select! {
            () = shutdown.cancelled() => break Exit::Shutdown,
            () = writer_gone.cancelled() => break Exit::Transport,
            frame = ws_rx.next() => match frame {
                Some(Ok(message)) => {
                    connection.mark_alive();
                    if handle_frame(&router, &mut state, message) {
                        break Exit::PeerClosed;
                    }
                }
                Some(Err(e)) => {
                    debug!(error = %e, "websocket read failed");
                    break Exit::Transport;
                }
                None => break Exit::PeerClosed,
            },
        }
    };

    let calls_ended = if exit == Exit::Shutdown {
        router.shutdown(&mut state)
    } else {
        router.disconnect(&mut state)
    };
    finish.cancel();
    if writer.await.is_err() {
        warn!("writer task panicked");
    }

    info!(
        reason = ?exit,
        calls_ended,
        dropped = connection.drop_count(),
        duration_secs = connection.age().as_secs(),
        "client disconnected"
    );
    counter!(names::WS_DISCONNECTIONS_TOTAL).increment(1);
    gauge!(names::WS_CONNECTIONS_ACTIVE).decrement(1.0);
    histogram!(names::WS_CONNECTION_DURATION_SECONDS).record(connection.age().as_secs_f64());
}

/// Route one inbound frame. Returns `true` when the peer closed.
fn handle_frame(router: &Router, state: &mut ConnectionState, message: Message) -> bool {
    let text = match message {
        Message::Text(ref text) => text.as_str(),
        Message::Binary(ref data) => {
            if let Ok(text) = std::str::from_utf8(data) {
                text
            } else {
                debug!(len = data.len(), "ignoring non-UTF-8 binary frame");
                return false;
            }
        }
        Message::Close(frame) => {
            debug!(?frame, "client sent close frame");
            return true;
        }
        Message::Ping(_) | Message::Pong(_) => return false,
    };

    let was_registered = state.client_id().cloned();
    match router.handle_text(state, text) {
        Ok(report) => trace!(
            delivered = report.delivered,
            undeliverable = report.undeliverable,
            "message routed"
        ),
        Err(SignalingError::MalformedMessage(reason)) => {
            warn!(%reason, "malformed message ignored");
        }
        Err(e) => debug!(error = %e, "message ignored"),
    }
    if let Some(id) = state.client_id() {
        if was_registered.as_ref() != Some(id) {
            let _ = Span::current().record("client_id", id.as_str());
        }
    }
    false
}

/// Drain the outbound queue into the socket and keep the peer alive.
async fn write_loop(
    mut ws_tx: SplitSink<WebSocket, Message>,
    mut send_rx: mpsc::Receiver<Arc<String>>,
    connection: Arc<ClientConnection>,
    config: Arc<ServerConfig>,
    finish: CancellationToken,
    writer_gone: CancellationToken,
    shutdown: CancellationToken,
) {
    let mut ping = tokio::time::interval(config.heartbeat_interval);
    // The first tick completes immediately.
    let _ = ping.tick().await;

    loop {
        tokio::select! {
            biased;
            () = finish.cancelled() => {
                close_socket(&mut ws_tx, &mut send_rx, shutdown.is_cancelled()).await;
                break;
            }
            frame = send_rx.recv() => {
                let Some(frame) = frame else { break };
                if ws_tx.send(text_message(frame)).await.is_err() {
                    break;
                }
            }
            _ = ping.tick() => {
                if !connection.check_alive() && connection.last_seen_elapsed() > config.heartbeat_timeout {
                    warn!(
                        silent_secs = connection.last_seen_elapsed().as_secs(),
                        "client unresponsive, disconnecting"
                    );
                    break;
                }
                if ws_tx.send(Message::Ping(Vec::new().into())).await.is_err() {
                    break;
                }
            }
        }
    }
    writer_gone.cancel();
}

/// Flush frames queued during cleanup, then close the socket.
async fn close_socket(
    ws_tx: &mut SplitSink<WebSocket, Message>,
    send_rx: &mut mpsc::Receiver<Arc<String>>,
    going_away: bool,
) {
    while let Ok(frame) = send_rx.try_recv() {
        if ws_tx.send(text_message(frame)).await.is_err() {
            return;
        }
    }
    if going_away {
        let _ = ws_tx
            .send(Message::Close(Some(CloseFrame {
                code: close_code::AWAY,
                reason: "server shutting down".into(),
            })))
            .await;
    }
    let _ = ws_tx.close().await;
}

fn text_message(frame: Arc<String>) -> Message {
    Message::Text(Arc::unwrap_or_clone(frame).into())
}
