//! Structured logging with `tracing`.
//!
//! - [`LogFormat`] selects compact human output or JSON lines
//! - [`init_subscriber`] installs the process-wide subscriber
//! - [`bootstrap_guard`] covers startup work that runs before it
//! - [`capture`] records events in memory so tests can assert on diagnostics

pub mod capture;

use serde::{Deserialize, Serialize};

pub use capture::{CapturedEvent, CapturedLogs, capture_logs};

/// Output format of the stderr log layer.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum LogFormat {
    /// Single-line human-readable output.
    #[default]
    Compact,
    /// One JSON object per line.
    Json,
}

impl LogFormat {
    /// Parse a format name (`compact`/`text` or `json`), case-insensitive.
    pub fn parse(value: &str) -> Option<Self> {
        match value.to_ascii_lowercase().as_str() {
            "compact" | "text" | "pretty" => Some(Self::Compact),
            "json" => Some(Self::Json),
            _ => None,
        }
    }
}

/// Initialize the global tracing subscriber writing to stderr.
///
/// `RUST_LOG` takes precedence over `level` when set. Subsequent calls are
/// no-ops.
pub fn init_subscriber(level: &str, format: LogFormat) {
    use tracing_subscriber::EnvFilter;

    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(level));
    let builder = tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_target(true)
        .with_writer(std::io::stderr);

    // try_init fails only when a global subscriber is already set
    let _ = match format {
        LogFormat::Compact => builder.compact().try_init(),
        LogFormat::Json => builder.json().with_current_span(true).try_init(),
    };
}

/// Route this thread's events to stderr at `warn` until the guard drops.
///
/// Settings are loaded before the configured subscriber can be built, so
/// warnings about ignored overrides would otherwise be lost.
pub fn bootstrap_guard() -> tracing::subscriber::DefaultGuard {
    let subscriber = tracing_subscriber::fmt()
        .with_max_level(tracing::Level::WARN)
        .with_target(true)
        .with_writer(std::io::stderr)
        .compact()
        .finish();
    tracing::subscriber::set_default(subscriber)
}
