//! Error types for snapshot storage and remote synchronization.

use thiserror::Error;

/// Failures inside a snapshot backend.
///
/// These never escape [`SnapshotStore`](crate::snapshot_store::SnapshotStore):
/// the store logs them and degrades to its fallback or to "no snapshot".
#[derive(Error, Debug)]
#[non_exhaustive]
pub enum StoreError {
    /// LMDB environment or transaction failure.
    #[error("lmdb error: {0}")]
    Lmdb(#[from] lmdb::Error),

    /// Filesystem failure in the fallback store.
    #[error("io error: {0}")]
    Io(#[from] std::io::Error),

    /// Snapshot could not be encoded or decoded.
    #[error("serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    /// The write would exceed the backend's quota.
    #[error("quota exceeded: needed {needed} bytes, {available} available")]
    QuotaExceeded { needed: usize, available: usize },

    /// The backend was closed and can no longer be used.
    #[error("store is closed")]
    Closed,
}

/// Coarse classification of a remote failure.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RemoteErrorKind {
    /// The request never reached the server.
    Network,
    /// The server rejected or failed the request.
    Server,
    /// The attempt exceeded `attempt_timeout_ms`.
    Timeout,
}

/// Error reported by a [`RemoteDocuments`](crate::remote_sync::RemoteDocuments) implementation.
#[derive(Error, Debug, Clone)]
#[error("{kind:?}: {message}")]
pub struct RemoteError {
    pub message: String,
    pub kind: RemoteErrorKind,
}

impl RemoteError {
    pub fn network(message: impl Into<String>) -> Self {
        Self {
            message: message.into(),
            kind: RemoteErrorKind::Network,
        }
    }

    pub fn server(message: impl Into<String>) -> Self {
        Self {
            message: message.into(),
            kind: RemoteErrorKind::Server,
        }
    }

    pub fn timeout(message: impl Into<String>) -> Self {
        Self {
            message: message.into(),
            kind: RemoteErrorKind::Timeout,
        }
    }
}

/// Errors surfaced to the view that owns a draft.
#[derive(Error, Debug, Clone)]
#[non_exhaustive]
pub enum SyncError {
    /// The authoritative copy could not be loaded.
    #[error("failed to load document: {0}")]
    Load(RemoteError),

    /// The remote write failed after all retries; the data is still pending.
    #[error("failed to save document after {attempts} attempt(s): {source}")]
    Write {
        attempts: u32,
        #[source]
        source: RemoteError,
    },

    /// Connectivity is down; the data is still pending.
    #[error("offline")]
    Offline,

    /// There was nothing to write.
    #[error("nothing to sync")]
    NothingPending,

    /// No tokio runtime was available to drive timers and writes.
    #[error("no tokio runtime available")]
    NoRuntime,

    /// The controller was disposed.
    #[error("sync controller is disposed")]
    Disposed,
}
