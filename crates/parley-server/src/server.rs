//! `ParleyServer`: Axum HTTP + WebSocket server.

use std::net::SocketAddr;
use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::time::Instant;

use axum::extract::State;
use axum::extract::ws::WebSocketUpgrade;
use axum::http::{StatusCode, header};
use axum::response::{IntoResponse, Json, Response};
use axum::routing::get;
use metrics::counter;
use metrics_exporter_prometheus::PrometheusHandle;
use parley_signaling::{CallSessionStore, ConnectionRegistry, EndReason, RelayStats, Router};
use tokio::net::TcpListener;
use tokio::task::JoinHandle;
use tower_http::cors::CorsLayer;
use tower_http::trace::TraceLayer;
use tracing::{info, warn};

use crate::config::ServerConfig;
use crate::errors::{Result, ServerError};
use crate::health::{self, HealthResponse};
use crate::metrics as names;
use crate::shutdown::ShutdownCoordinator;
use crate::stats::run_stats_logger;
use crate::websocket::session::run_ws_session;

/// Shared state accessible from Axum handlers.
#[derive(Clone)]
pub struct AppState {
    /// Message router over the registry and call store.
    pub router: Arc<Router>,
    /// Server configuration.
    pub config: Arc<ServerConfig>,
    /// Shutdown coordinator.
    pub shutdown: Arc<ShutdownCoordinator>,
    /// Open WebSocket connections.
    pub connections: Arc<AtomicUsize>,
    /// When the server started.
    pub start_time: Instant,
    /// Prometheus handle for `/metrics`.
    pub metrics: PrometheusHandle,
}

/// The signaling relay server.
pub struct ParleyServer {
    config: Arc<ServerConfig>,
    router: Arc<Router>,
    shutdown: Arc<ShutdownCoordinator>,
    connections: Arc<AtomicUsize>,
    start_time: Instant,
    metrics: PrometheusHandle,
}

impl ParleyServer {
    /// Create a server with an empty registry and call store.
    pub fn new(config: ServerConfig, metrics: PrometheusHandle) -> Self {
        let router = Router::new(
            Arc::new(ConnectionRegistry::new()),
            Arc::new(CallSessionStore::new()),
            config.routing.clone(),
        );
        Self {
            config: Arc::new(config),
            router: Arc::new(router),
            shutdown: Arc::new(ShutdownCoordinator::new()),
            connections: Arc::new(AtomicUsize::new(0)),
            start_time: Instant::now(),
            metrics,
        }
    }

    /// Build the Axum router with all routes.
    ///
    /// The WebSocket endpoint answers on both `/ws` and `/`.
    pub fn app(&self) -> axum::Router {
        let state = AppState {
            router: Arc::clone(&self.router),
            config: Arc::clone(&self.config),
            shutdown: Arc::clone(&self.shutdown),
            connections: Arc::clone(&self.connections),
            start_time: self.start_time,
            metrics: self.metrics.clone(),
        };

        axum::Router::new()
            .route("/", get(ws_handler))
            .route("/ws", get(ws_handler))
            .route("/health", get(health_handler))
            .route("/metrics", get(metrics_handler))
            .with_state(state)
            .layer(TraceLayer::new_for_http())
            .layer(CorsLayer::permissive())
    }

    /// Bind the listener and start serving in the background.
    ///
    /// Returns the bound address and the serve task, which completes once
    /// shutdown has been signalled and the listener has stopped.
    pub async fn listen(&self) -> Result<(SocketAddr, JoinHandle<()>)> {
        let addr = self.config.bind_addr();
        let listener = TcpListener::bind(&addr)
            .await
            .map_err(|source| ServerError::Bind { addr, source })?;
        let local_addr = listener.local_addr()?;

        if let Some(every) = self.config.stats_interval {
            let _stats = self.shutdown.spawn(run_stats_logger(
                Arc::clone(&self.router),
                Arc::clone(&self.connections),
                every,
                self.shutdown.token(),
            ));
        }

        let app = self.app();
        let token = self.shutdown.token();
        let handle = tokio::spawn(async move {
            let served = axum::serve(listener, app)
                .with_graceful_shutdown(token.cancelled_owned())
                .await;
            if let Err(e) = served {
                warn!(error = %e, "server stopped with error");
            }
        });

        info!(addr = %local_addr, "signaling server listening");
        Ok((local_addr, handle))
    }

    /// Signal shutdown and wait for connection tasks to drain.
    ///
    /// Returns `true` if everything finished within the configured timeout.
    pub async fn graceful_shutdown(&self) -> bool {
        let calls_ended = self.router.end_all_calls(EndReason::Shutdown);
        info!(
            connections = self.connection_count(),
            calls_ended,
            "shutting down signaling server"
        );
        self.shutdown
            .graceful_shutdown(self.config.shutdown_timeout)
            .await
    }

    /// The shutdown coordinator.
    pub fn shutdown(&self) -> &Arc<ShutdownCoordinator> {
        &self.shutdown
    }

    /// The message router.
    pub fn router(&self) -> &Arc<Router> {
        &self.router
    }

    /// The server configuration.
    pub fn config(&self) -> &ServerConfig {
        &self.config
    }

    /// Open WebSocket connections.
    pub fn connection_count(&self) -> usize {
        self.connections.load(Ordering::Relaxed)
    }

    /// Registry and call counts.
    pub fn stats(&self) -> RelayStats {
        self.router.stats()
    }
}

/// One occupied connection slot, released on drop.
struct ConnectionSlot {
    connections: Arc<AtomicUsize>,
}

impl ConnectionSlot {
    fn acquire(connections: &Arc<AtomicUsize>, max: usize) -> Option<Self> {
        connections
            .fetch_update(Ordering::AcqRel, Ordering::Acquire, |n| (n < max).then_some(n + 1))
            .ok()
            .map(|_| Self {
                connections: Arc::clone(connections),
            })
    }
}

impl Drop for ConnectionSlot {
    fn drop(&mut self) {
        let _ = self.connections.fetch_sub(1, Ordering::AcqRel);
    }
}

/// GET /ws: upgrade to a signaling session.
async fn ws_handler(ws: WebSocketUpgrade, State(state): State<AppState>) -> Response {
    if state.shutdown.is_shutting_down() {
        return (StatusCode::SERVICE_UNAVAILABLE, "server shutting down").into_response();
    }
    let Some(slot) = ConnectionSlot::acquire(&state.connections, state.config.max_connections)
    else {
        warn!(
            max_connections = state.config.max_connections,
            "connection limit reached, refusing upgrade"
        );
        counter!(names::WS_CONNECTIONS_REJECTED_TOTAL).increment(1);
        return (StatusCode::SERVICE_UNAVAILABLE, "connection limit reached").into_response();
    };

    let max_message_size = state.config.max_message_size;
    ws.max_message_size(max_message_size)
        .max_frame_size(max_message_size)
        .on_upgrade(move |socket| {
            let session = run_ws_session(
                socket,
                Arc::clone(&state.router),
                Arc::clone(&state.config),
                state.shutdown.token(),
            );
            state.shutdown.track(async move {
                let _slot = slot;
                session.await;
            })
        })
}

/// GET /health
async fn health_handler(State(state): State<AppState>) -> Json<HealthResponse> {
    Json(health::health_check(
        state.start_time,
        state.connections.load(Ordering::Relaxed),
        state.router.stats(),
    ))
}

/// GET /metrics
async fn metrics_handler(State(state): State<AppState>) -> impl IntoResponse {
    (
        [(header::CONTENT_TYPE, "text/plain; version=0.0.4")],
        crate::metrics::render(&state.metrics),
    )
}

#[cfg(test)]
mod tests {
    use super::*;
    use axum::body::Body;
    use axum::http::Request;
    use tower::ServiceExt;

    fn make_server() -> ParleyServer {
        ParleyServer::new(ServerConfig::default(), crate::metrics::detached_handle())
    }

    async fn get_json(app: axum::Router, uri: &str) -> (StatusCode, serde_json::Value) {
        let req = Request::builder().uri(uri).body(Body::empty()).unwrap();
        let resp = app.oneshot(req).await.unwrap();
        let status = resp.status();
        let body = axum::body::to_bytes(resp.into_body(), 10_000).await.unwrap();
        (status, serde_json::from_slice(&body).unwrap_or_default())
    }

    #[tokio::test]
    async fn health_endpoint_reports_counts() {
        let server = make_server();
        let (status, parsed) = get_json(server.app(), "/health").await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(parsed["status"], "ok");
        assert_eq!(parsed["connections"], 0);
        assert_eq!(parsed["registeredClients"], 0);
        assert_eq!(parsed["activeCalls"], 0);
        assert!(parsed["uptimeSecs"].is_number());
    }

    #[tokio::test]
    async fn metrics_endpoint_serves_text() {
        let server = make_server();
        let req = Request::builder().uri("/metrics").body(Body::empty()).unwrap();
        let resp = server.app().oneshot(req).await.unwrap();
        assert_eq!(resp.status(), StatusCode::OK);
        let content_type = resp.headers()[header::CONTENT_TYPE].to_str().unwrap();
        assert!(content_type.starts_with("text/plain"));
    }

    #[tokio::test]
    async fn plain_get_on_ws_is_not_an_upgrade() {
        let server = make_server();
        let req = Request::builder().uri("/ws").body(Body::empty()).unwrap();
        let resp = server.app().oneshot(req).await.unwrap();
        assert!(resp.status().is_client_error());
    }

    #[tokio::test]
    async fn unknown_route_returns_404() {
        let server = make_server();
        let (status, _) = get_json(server.app(), "/nonexistent").await;
        assert_eq!(status, StatusCode::NOT_FOUND);
    }

    #[test]
    fn connection_slots_are_bounded() {
        let counter = Arc::new(AtomicUsize::new(0));
        let first = ConnectionSlot::acquire(&counter, 2).unwrap();
        let second = ConnectionSlot::acquire(&counter, 2).unwrap();
        assert!(ConnectionSlot::acquire(&counter, 2).is_none());
        assert_eq!(counter.load(Ordering::Relaxed), 2);

        drop(first);
        assert_eq!(counter.load(Ordering::Relaxed), 1);
        let _third = ConnectionSlot::acquire(&counter, 2).unwrap();
        drop(second);
        assert_eq!(counter.load(Ordering::Relaxed), 1);
    }

    #[tokio::test]
    async fn listen_binds_free_port() {
        let server = make_server();
        let (addr, handle) = server.listen().await.unwrap();
        assert_ne!(addr.port(), 0);
        assert!(server.graceful_shutdown().await);
        handle.await.unwrap();
    }

    #[tokio::test]
    async fn listen_reports_bind_failure() {
        let first = make_server();
        let (addr, _handle) = first.listen().await.unwrap();

        let config = ServerConfig {
            port: addr.port(),
            ..ServerConfig::default()
        };
        let second = ParleyServer::new(config, crate::metrics::detached_handle());
        assert!(matches!(
            second.listen().await,
            Err(ServerError::Bind { .. })
        ));
        first.shutdown().shutdown();
    }
}
