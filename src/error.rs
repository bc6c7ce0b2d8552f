//! Per-subsystem error enums (spec §7), one per failure-mode table row.
//!
//! Each subsystem owns its own enum rather than a single crate-wide error —
//! the same convention the teacher uses for `enterprise::cloud::sync::SyncError`,
//! `enterprise::cloud::transfer::TransferError`, and
//! `enterprise::security::vault`'s `SecurityError`.

use thiserror::Error;

/// Errors surfaced by the encrypted compressed store (spec §4.A).
#[derive(Debug, Error)]
pub enum StoreError {
    #[error("item not found: {0}")]
    NotFound(String),

    #[error("item corrupted or authentication failed: {0}")]
    Corrupted(String),

    #[error("unsupported algorithm or format tag: {0}")]
    UnsupportedFormat(String),

    #[error("storage I/O error: {0}")]
    StorageIo(#[from] std::io::Error),

    #[error("secret vault error: {0}")]
    Keychain(#[from] KeychainError),

    #[error("metadata serialization error: {0}")]
    Serialization(#[from] serde_json::Error),
}

pub type StoreResult<T> = Result<T, StoreError>;

/// Errors surfaced by the [`crate::interfaces::SecretVault`] collaborator.
#[derive(Debug, Error)]
pub enum KeychainError {
    #[error("secret not found for tag: {0}")]
    NotFound(String),

    #[error("vault I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("vault backend error: {0}")]
    Backend(String),
}

/// Outcome of a remote executor invocation (spec §6, §7).
#[derive(Debug, Error)]
pub enum RemoteError {
    /// Transient network fault: timeout, connection lost, unreachable.
    #[error("transient network error: {0}")]
    TransientNetwork(String),

    /// The remote returned a status in the configured retryable set.
    #[error("retryable server error (status {status}): {message}")]
    RetryableServer { status: u16, message: String },

    /// A non-retryable server response.
    #[error("terminal server error (status {status}): {message}")]
    TerminalServer { status: u16, message: String },

    #[error("bad request: {0}")]
    BadRequest(String),

    /// Last-writer-wins conflict detected by the executor or puller.
    #[error("conflict on entity {entity_id}")]
    Conflict { entity_id: String },
}

impl RemoteError {
    /// Whether this error should be retried with backoff, per the
    /// retryability rule in spec §4.C.
    pub fn is_retryable(&self, retryable_statuses: &[u16]) -> bool {
        match self {
            RemoteError::TransientNetwork(_) => true,
            RemoteError::RetryableServer { status, .. } => retryable_statuses.contains(status),
            _ => false,
        }
    }
}

/// Errors surfaced by the retry queue (spec §4.C).
#[derive(Debug, Error)]
pub enum QueueError {
    #[error("operation not found: {0}")]
    NotFound(uuid::Uuid),

    #[error("persistence error: {0}")]
    Persistence(#[from] std::io::Error),

    #[error("serialization error: {0}")]
    Serialization(#[from] serde_json::Error),
}

pub type QueueResult<T> = Result<T, QueueError>;

/// Errors surfaced by the optimistic update manager (spec §4.D).
#[derive(Debug, Error)]
pub enum OptimisticError {
    #[error("pending update not found: {0}")]
    NotFound(uuid::Uuid),

    #[error("rollback timed out for update {0}")]
    Timeout(uuid::Uuid),

    #[error("sync failed: {0}")]
    SyncFailed(#[from] RemoteError),

    #[error("entity store error: {0}")]
    Store(String),
}

pub type OptimisticResult<T> = Result<T, OptimisticError>;

/// Errors surfaced by the bandwidth optimizer (spec §4.B).
#[derive(Debug, Error)]
pub enum BandwidthError {
    #[error("transfer not found: {0}")]
    NotFound(uuid::Uuid),

    #[error("transfer ineligible for admission: {0}")]
    Ineligible(String),
}

pub type BandwidthResult<T> = Result<T, BandwidthError>;
