//! External collaborators consumed by the core (spec §6).
//!
//! These traits are the seam between this crate and application-supplied
//! code: remote API clients, reachability plumbing, and platform secret
//! storage. The core never implements them for production use — only test
//! doubles live in this crate.

use async_trait::async_trait;
use chrono::{DateTime, Utc};

use crate::error::{KeychainError, RemoteError};
use crate::types::{Change, Operation};

/// Executes the remote side-effect of an [`Operation`] (consumed by the
/// retry queue).
///
/// Implementations must be idempotent keyed by `op_id`: the retry queue
/// gives at-least-once delivery, so a server may observe the same `op_id`
/// more than once and must deduplicate.
#[async_trait]
pub trait RemoteExecutor: Send + Sync {
    async fn execute(&self, operation: &Operation) -> Result<(), RemoteError>;
}

/// Fetches remote changes since a cursor (consumed by the orchestrator's
/// pull driver).
#[async_trait]
pub trait RemotePuller: Send + Sync {
    async fn fetch_changes(&self, since_version: i64) -> Result<Vec<Change>, RemoteError>;
}

/// Bidirectional mapping between an entity value and an opaque byte string.
/// Round-tripping through `encode` then `decode` must be lossless.
pub trait EntityCodec<E>: Send + Sync {
    fn encode(&self, entity: &E) -> Vec<u8>;
    fn decode(&self, bytes: &[u8]) -> Result<E, String>;
}

/// A network path change as reported by the platform (consumed by the
/// bandwidth optimizer).
#[derive(Debug, Clone, Copy)]
pub struct PathEvent {
    pub connection_type: crate::types::ConnectionType,
    pub is_expensive: bool,
    pub is_constrained: bool,
}

/// Observes platform network-path changes (consumed by the bandwidth
/// optimizer).
#[async_trait]
pub trait NetworkPathObserver: Send + Sync {
    /// Block until the next path change and return it.
    async fn next_change(&self) -> PathEvent;
}

/// Platform secret storage (consumed by the encrypted compressed store).
#[async_trait]
pub trait SecretVault: Send + Sync {
    async fn store(&self, tag: &str, bytes: &[u8]) -> Result<(), KeychainError>;
    async fn retrieve(&self, tag: &str) -> Result<Vec<u8>, KeychainError>;
    async fn delete(&self, tag: &str) -> Result<(), KeychainError>;
    async fn delete_all(&self) -> Result<(), KeychainError>;
}

/// Convenience re-export so callers constructing [`Operation`]s and
/// [`Change`]s don't need a second `use chrono::...` line.
pub type Timestamp = DateTime<Utc>;

pub(crate) fn now() -> DateTime<Utc> {
    Utc::now()
}
