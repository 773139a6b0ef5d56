//! Settings error types.

use std::path::PathBuf;

use thiserror::Error;

/// Why a settings file could not become a usable [`ParleySettings`].
///
/// [`ParleySettings`]: crate::ParleySettings
#[derive(Debug, Error)]
pub enum SettingsError {
    /// The file exists but could not be read.
    #[error("cannot read {}: {source}", .path.display())]
    Read {
        /// File that failed.
        path: PathBuf,
        /// Underlying I/O error.
        #[source]
        source: std::io::Error,
    },
    /// The file is not JSON, or a key has the wrong type.
    #[error("{} is not valid settings JSON: {source}", .path.display())]
    Parse {
        /// File that failed.
        path: PathBuf,
        /// Underlying JSON error.
        #[source]
        source: serde_json::Error,
    },
    /// The compiled defaults failed to serialize.
    #[error("failed to encode default settings: {0}")]
    Defaults(#[source] serde_json::Error),
    /// A value parsed but cannot work at runtime.
    #[error("{field}: {reason}")]
    Invalid {
        /// camelCase path of the offending key, e.g. `server.port`.
        field: &'static str,
        /// What is wrong with it.
        reason: String,
    },
}

impl SettingsError {
    pub(crate) fn invalid(field: &'static str, reason: impl Into<String>) -> Self {
        Self::Invalid {
            field,
            reason: reason.into(),
        }
    }
}

/// Result type for settings operations.
pub type Result<T> = std::result::Result<T, SettingsError>;
