//! Server error types.

/// Errors raised while starting or running the server.
#[derive(Debug, thiserror::Error)]
pub enum ServerError {
    /// The listener could not bind.
    #[error("failed to bind {addr}: {source}")]
    Bind {
        /// Address that was requested.
        addr: String,
        /// Underlying I/O error.
        #[source]
        source: std::io::Error,
    },

    /// Other I/O failure.
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// The global metrics recorder could not be installed.
    #[error("metrics recorder: {0}")]
    Metrics(String),
}

/// Result alias for server operations.
pub type Result<T> = std::result::Result<T, ServerError>;
