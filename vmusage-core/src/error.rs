//! Error types for vmusage.
//!
//! All errors use `thiserror` for ergonomic error handling and proper error chains.
//! Background work never panics on a fatal error; it raises it through a
//! [`FatalSignal`] so the daemon can log it and exit non-zero.

use std::path::PathBuf;
use std::time::Duration;
use thiserror::Error;
use tokio::sync::mpsc;
use tracing::error;

/// Result type alias for vmusage operations.
pub type Result<T> = std::result::Result<T, UsageError>;

/// Main error type for vmusage.
#[derive(Error, Debug)]
pub enum UsageError {
    // File system errors
    #[error("I/O error at {path:?}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    /// A write, fsync, rename or unlink that persistence depends on failed.
    #[error("Durability failure at {path:?} during {operation}: {source}")]
    Durability {
        path: PathBuf,
        operation: &'static str,
        #[source]
        source: std::io::Error,
    },

    #[error("Usage log writer for {path:?} is closed")]
    WriterClosed { path: PathBuf },

    /// Compaction could not finish; the original log is still in place.
    #[error("Compaction of {path:?} failed: {reason}")]
    Compaction { path: PathBuf, reason: String },

    // Host collaborator errors
    #[error("Command {command} failed ({status}): {stderr}")]
    CommandFailed { command: String, status: String, stderr: String },

    #[error("Command {command} timed out after {timeout:?}")]
    CommandTimeout { command: String, timeout: Duration },

    #[error("Invalid host identity: {reason}")]
    InvalidHostIdentity { reason: String },

    #[error("Failed to serialize usage record: {0}")]
    Serialization(#[from] serde_json::Error),

    // Configuration errors
    #[error("Invalid configuration: {reason}")]
    InvalidConfig { reason: String },

    // Generic errors
    #[error("Internal error: {0}")]
    Internal(String),
}

impl UsageError {
    /// Create an Internal error from any error type.
    pub fn internal(err: impl std::error::Error + Send + Sync + 'static) -> Self {
        Self::Internal(err.to_string())
    }

    /// Whether this error must terminate the process.
    ///
    /// Compaction failures leave the original file in place and are retried
    /// on the next pass; everything else means host state or persistence can
    /// no longer be trusted.
    pub fn is_fatal(&self) -> bool {
        !matches!(self, UsageError::Compaction { .. })
    }
}

/// Handle used by background tasks to escalate fatal errors to the process owner.
#[derive(Clone, Debug)]
pub struct FatalSignal {
    tx: mpsc::UnboundedSender<UsageError>,
}

impl FatalSignal {
    /// Create a signal handle and the receiver the daemon waits on.
    pub fn channel() -> (Self, mpsc::UnboundedReceiver<UsageError>) {
        let (tx, rx) = mpsc::unbounded_channel();
        (Self { tx }, rx)
    }

    /// Log a fatal error and hand it to the process owner.
    pub fn raise(&self, component: &'static str, err: UsageError) {
        error!(component, error = %err, "fatal error");
        if self.tx.send(err).is_err() {
            error!(component, "fatal error receiver is gone");
        }
    }
}
