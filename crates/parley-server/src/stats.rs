//! Periodic stats log line.

use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::time::Duration;

use parley_signaling::Router;
use tokio_util::sync::CancellationToken;
use tracing::info;

/// Log connection and call counts every `every` until cancelled.
pub async fn run_stats_logger(
    router: Arc<Router>,
    connections: Arc<AtomicUsize>,
    every: Duration,
    cancel: CancellationToken,
) {
    let mut tick = tokio::time::interval(every);
    let _ = tick.tick().await;

    loop {
        tokio::select! {
            () = cancel.cancelled() => break,
            _ = tick.tick() => {
                let stats = router.stats();
                info!(
                    connections = connections.load(Ordering::Relaxed),
                    clients = stats.registered_clients,
                    active_calls = stats.active_calls(),
                    ringing = stats.ringing_calls,
                    connected = stats.connected_calls,
                    "relay stats"
                );
            }
        }
    }
}
