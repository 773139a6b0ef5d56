//! Server configuration.

use std::time::Duration;

use parley_settings::ParleySettings;
use parley_signaling::RouterConfig;

/// Runtime configuration for [`ParleyServer`](crate::server::ParleyServer).
#[derive(Clone, Debug)]
pub struct ServerConfig {
    /// Host to bind (default `"127.0.0.1"`).
    pub host: String,
    /// Port to bind (default `0` for auto-assign).
    pub port: u16,
    /// Maximum concurrent WebSocket connections.
    pub max_connections: usize,
    /// Interval between server-initiated Ping frames.
    pub heartbeat_interval: Duration,
    /// Silence after which a peer is disconnected.
    pub heartbeat_timeout: Duration,
    /// Max inbound WebSocket message size in bytes.
    pub max_message_size: usize,
    /// Outbound queue capacity per connection.
    pub send_queue_capacity: usize,
    /// Period of the stats log line, `None` to disable.
    pub stats_interval: Option<Duration>,
    /// Upper bound on draining connections at shutdown.
    pub shutdown_timeout: Duration,
    /// Message routing options.
    pub routing: RouterConfig,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            host: "127.0.0.1".into(),
            port: 0,
            max_connections: 1024,
            heartbeat_interval: Duration::from_secs(30),
            heartbeat_timeout: Duration::from_secs(90),
            max_message_size: 1024 * 1024,
            send_queue_capacity: 256,
            stats_interval: None,
            shutdown_timeout: Duration::from_secs(10),
            routing: RouterConfig::default(),
        }
    }
}

impl ServerConfig {
    /// `host:port` to bind.
    pub fn bind_addr(&self) -> String {
        format!("{}:{}", self.host, self.port)
    }
}

impl From<&ParleySettings> for ServerConfig {
    fn from(settings: &ParleySettings) -> Self {
        let server = &settings.server;
        Self {
            host: server.host.clone(),
            port: server.port,
            max_connections: server.max_connections,
            heartbeat_interval: server.heartbeat_interval(),
            heartbeat_timeout: server.heartbeat_timeout(),
            max_message_size: server.max_message_size,
            send_queue_capacity: server.send_queue_capacity,
            stats_interval: server.stats_interval(),
            shutdown_timeout: server.shutdown_timeout(),
            routing: RouterConfig {
                forward_unknown_types: settings.signaling.forward_unknown_types,
            },
        }
    }
}
