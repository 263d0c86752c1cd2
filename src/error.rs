use serde::Serialize;
use std::fmt;
use std::path::PathBuf;
use thiserror::Error;

use crate::record::QueueKind;
use crate::status::QueueStatus;

/// Failures reported by a [`crate::store::KvStore`]
#[derive(Error, Debug)]
pub enum StoreError {
    #[error("Database error: {0}")]
    Database(#[from] sqlx::Error),
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
    #[error("Record '{key}' could not be decoded: {source}")]
    Decode {
        key: String,
        #[source]
        source: serde_json::Error,
    },
    #[error("Record '{key}' could not be encoded: {source}")]
    Encode {
        key: String,
        #[source]
        source: serde_json::Error,
    },
}

pub type StoreResult<T> = Result<T, StoreError>;

/// Failures reported by a [`crate::remote::BlobStore`]
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum RemoteError {
    /// The remote could not be reached; retried on the next tick with no penalty
    #[error("Network error: {0}")]
    Network(String),
    /// Credentials were rejected; refreshed once and the call retried
    #[error("Credentials expired: {0}")]
    CredentialsExpired(String),
    #[error("Remote error{}: {message}", request_id.as_deref().map(|id| format!(" ({id})")).unwrap_or_default())]
    Remote {
        message: String,
        retryable: bool,
        request_id: Option<String>,
    },
}

impl RemoteError {
    pub fn remote(message: impl Into<String>, retryable: bool) -> Self {
        RemoteError::Remote {
            message: message.into(),
            retryable,
            request_id: None,
        }
    }

    /// Transient connectivity failure
    pub fn is_transient(&self) -> bool {
        matches!(self, RemoteError::Network(_))
    }

    /// Failure the remote marked as safe to retry without counting against the queue
    pub fn is_retryable(&self) -> bool {
        match self {
            RemoteError::Network(_) => true,
            RemoteError::CredentialsExpired(_) => false,
            RemoteError::Remote { retryable, .. } => *retryable,
        }
    }
}

pub type RemoteResult<T> = Result<T, RemoteError>;

/// Failures surfaced by queue operations
#[derive(Error, Debug)]
pub enum QueueError {
    #[error(transparent)]
    Store(#[from] StoreError),
    #[error(transparent)]
    Remote(#[from] RemoteError),
    /// The capture source produced an empty chunk
    #[error("{}", ErrorKind::StaleCapture.description())]
    StaleCapture,
    #[error("Queue for {kind} no longer accepts chunks (status {status})")]
    NotAccepting { kind: QueueKind, status: QueueStatus },
}

/// Configuration and credentials failures
#[derive(Error, Debug)]
pub enum ConfigError {
    #[error("Failed to read '{path}': {source}")]
    Read {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
    #[error("Failed to parse '{path}': {source}")]
    Parse {
        path: PathBuf,
        #[source]
        source: toml::de::Error,
    },
    #[error("Invalid configuration: {0}")]
    Invalid(String),
    #[error("Credentials error: {0}")]
    Credentials(String),
}

/// Errors returned by [`crate::service::UploadService`]
#[derive(Error, Debug)]
pub enum ServiceError {
    #[error(transparent)]
    Store(#[from] StoreError),
    #[error(transparent)]
    Queue(#[from] QueueError),
    #[error(transparent)]
    Config(#[from] ConfigError),
    #[error("Queue for draft '{draft_id}' ({kind}) is already running")]
    AlreadyRunning { draft_id: String, kind: QueueKind },
    #[error("Queue runner task failed: {0}")]
    Runner(String),
}

/// Catalogue of conditions reported to the host through queue events
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
pub enum ErrorKind {
    Network,
    MissingChunk,
    MissingChunkGaveUp,
    StitchFailed,
    StaleCapture,
    Dismissed,
    UploadFailed,
    StoreFailure,
}

impl ErrorKind {
    /// Stable code shared with hosts that already understand these conditions
    pub fn code(self) -> &'static str {
        match self {
            ErrorKind::Network => "NETWORK_ERROR",
            ErrorKind::MissingChunk => "DB_NO_SUCH_KEY",
            ErrorKind::MissingChunkGaveUp => "DB_NO_SUCH_KEY_RETRY",
            ErrorKind::StitchFailed => "UPLOAD_ABORTED_DUE_TO_ERROR",
            ErrorKind::StaleCapture => "BROWSER_STALE",
            ErrorKind::Dismissed => "RECORDING_DISMISSED",
            ErrorKind::UploadFailed => "UPLOAD_FAILED",
            ErrorKind::StoreFailure => "ERROR_PUTTING_KEY",
        }
    }

    pub fn description(self) -> &'static str {
        match self {
            ErrorKind::Network => "Network error!",
            ErrorKind::MissingChunk => "There is no key available in db",
            ErrorKind::MissingChunkGaveUp => "We tried, really there is no such key",
            ErrorKind::StitchFailed => "Upload aborted due to error, we are going to retry",
            ErrorKind::StaleCapture => "Browser has gone state, restart browser",
            ErrorKind::Dismissed => "Recording has been dismissed",
            ErrorKind::UploadFailed => "upload failed, will keep retrying!",
            ErrorKind::StoreFailure => "Error while creating key in DB",
        }
    }
}

impl fmt::Display for ErrorKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}: {}", self.code(), self.description())
    }
}
