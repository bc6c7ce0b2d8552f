//! Core data model shared by the retry queue, optimistic update manager,
//! bandwidth optimizer, and encrypted compressed store.
//!
//! Entities are opaque to the core except for the four attributes exposed by
//! the [`Entity`] trait; everything else is caller-defined and travels as an
//! already-serialized payload produced by an [`crate::interfaces::EntityCodec`].

use std::collections::HashMap;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// Stable attributes the core needs from an application entity.
///
/// Implementors may carry arbitrary additional fields; only these four are
/// ever inspected by the retry queue, OUM, or store.
pub trait Entity {
    /// Stable identifier, unique within `entity_type`.
    fn id(&self) -> &str;
    /// Monotonic last-modification timestamp, used for LWW conflict resolution.
    fn modified_at(&self) -> DateTime<Utc>;
    /// Monotonically increasing version counter.
    fn version(&self) -> i64;
    /// Whether this entity has local changes not yet confirmed by the remote.
    fn dirty(&self) -> bool;
}

/// Priority band for queued operations and transfers.
///
/// Ordering is `Critical > High > Normal > Low`; derived `Ord` ranks variants
/// by declaration order, so higher-urgency variants must be declared last.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub enum Priority {
    Low,
    Normal,
    High,
    Critical,
}

/// Kind of mutation an [`Operation`] represents.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum OperationKind {
    Create,
    Update,
    Delete,
    Sync,
    Upload,
    Download,
}

/// Lifecycle state of a queued [`Operation`].
///
/// `Completed` and `Cancelled` are terminal: once reached, no further
/// transition is permitted (invariant from spec §3).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum OperationStatus {
    Pending,
    InProgress,
    Retrying,
    Completed,
    Failed,
    Cancelled,
}

impl OperationStatus {
    /// Whether no further status transition is permitted from this state.
    pub fn is_terminal(self) -> bool {
        matches!(self, OperationStatus::Completed | OperationStatus::Cancelled)
    }
}

/// A pending mutation durably tracked by the retry queue.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Operation {
    pub op_id: Uuid,
    pub kind: OperationKind,
    pub entity_id: String,
    pub entity_type: String,
    #[serde(with = "hex_bytes")]
    pub payload: Vec<u8>,
    pub priority: Priority,
    pub created_at: DateTime<Utc>,
    pub retry_count: u32,
    pub last_attempt: Option<DateTime<Utc>>,
    pub next_retry: Option<DateTime<Utc>>,
    pub status: OperationStatus,
    pub last_error: Option<String>,
    pub metadata: HashMap<String, String>,
}

impl Operation {
    /// Construct a freshly enqueued operation: `status = Pending`, zero retries.
    pub fn new(
        kind: OperationKind,
        entity_id: impl Into<String>,
        entity_type: impl Into<String>,
        payload: Vec<u8>,
        priority: Priority,
    ) -> Self {
        let now = Utc::now();
        Self {
            op_id: Uuid::new_v4(),
            kind,
            entity_id: entity_id.into(),
            entity_type: entity_type.into(),
            payload,
            priority,
            created_at: now,
            retry_count: 0,
            last_attempt: None,
            next_retry: Some(now),
            status: OperationStatus::Pending,
            last_error: None,
            metadata: HashMap::new(),
        }
    }

    /// Ordering key for the in-memory queue: priority descending, then
    /// `created_at` ascending (spec §3).
    pub fn sort_key(&self) -> (std::cmp::Reverse<Priority>, DateTime<Utc>) {
        (std::cmp::Reverse(self.priority), self.created_at)
    }

    /// Whether this operation is eligible to run now: status allows it and
    /// `next_retry` (if any) has passed.
    pub fn is_eligible(&self, now: DateTime<Utc>) -> bool {
        matches!(self.status, OperationStatus::Pending | OperationStatus::Retrying)
            && self.next_retry.map(|t| t <= now).unwrap_or(false)
    }
}

/// Kind of optimistic mutation tracked by the OUM. A strict subset of
/// [`OperationKind`] — sync/upload/download never apply optimistically.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum OptimisticOp {
    Create,
    Update,
    Delete,
}

/// Lifecycle state of a [`PendingUpdate`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum UpdateStatus {
    Pending,
    Syncing,
    Confirmed,
    Failed,
    RolledBack,
}

/// Rollback record owned by the optimistic update manager.
///
/// Invariant: `original_value` is `Some` for `op ∈ {Update, Delete}` and
/// `None` for `op = Create` (spec §3).
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PendingUpdate {
    pub update_id: Uuid,
    pub entity_id: String,
    pub entity_type: String,
    pub op: OptimisticOp,
    #[serde(with = "opt_hex_bytes")]
    pub original_value: Option<Vec<u8>>,
    #[serde(with = "hex_bytes")]
    pub optimistic_value: Vec<u8>,
    pub status: UpdateStatus,
    pub deadline_at: DateTime<Utc>,
    pub last_error: Option<String>,
}

impl PendingUpdate {
    /// Build a pending update, validating the original-value invariant.
    pub fn new(
        entity_id: impl Into<String>,
        entity_type: impl Into<String>,
        op: OptimisticOp,
        original_value: Option<Vec<u8>>,
        optimistic_value: Vec<u8>,
        deadline_at: DateTime<Utc>,
    ) -> Self {
        debug_assert_eq!(
            matches!(op, OptimisticOp::Update | OptimisticOp::Delete),
            original_value.is_some(),
            "original_value must be present for update/delete and absent for create"
        );
        Self {
            update_id: Uuid::new_v4(),
            entity_id: entity_id.into(),
            entity_type: entity_type.into(),
            op,
            original_value,
            optimistic_value,
            status: UpdateStatus::Pending,
            deadline_at,
            last_error: None,
        }
    }
}

/// Kind of bandwidth-managed transfer.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum TransferKind {
    Upload,
    Download,
    Sync,
}

/// Lifecycle state of a [`TransferTask`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum TransferStatus {
    Pending,
    Queued,
    Active,
    Paused,
    Completed,
    Failed,
    Cancelled,
}

/// A bandwidth-managed transfer tracked by the bandwidth optimizer.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TransferTask {
    pub task_id: Uuid,
    pub kind: TransferKind,
    pub size: u64,
    pub priority: Priority,
    pub created_at: DateTime<Utc>,
    pub started_at: Option<DateTime<Utc>>,
    pub completed_at: Option<DateTime<Utc>>,
    pub transferred_bytes: u64,
    pub status: TransferStatus,
    pub last_error: Option<String>,
    /// Content fingerprint used for deduplication of in-flight tasks.
    pub content_hash: [u8; 32],
}

impl TransferTask {
    pub fn new(kind: TransferKind, size: u64, priority: Priority, content_hash: [u8; 32]) -> Self {
        Self {
            task_id: Uuid::new_v4(),
            kind,
            size,
            priority,
            created_at: Utc::now(),
            started_at: None,
            completed_at: None,
            transferred_bytes: 0,
            status: TransferStatus::Pending,
            last_error: None,
            content_hash,
        }
    }

    /// Fraction of the transfer completed, in `[0, 1]`.
    pub fn progress(&self) -> f64 {
        if self.size == 0 {
            1.0
        } else {
            self.transferred_bytes as f64 / self.size as f64
        }
    }

    /// Average throughput in bytes/second over the transfer's active window.
    pub fn throughput(&self, now: DateTime<Utc>) -> Option<f64> {
        let started = self.started_at?;
        let end = self.completed_at.unwrap_or(now);
        let elapsed = (end - started).num_milliseconds();
        if elapsed <= 0 {
            None
        } else {
            Some(self.transferred_bytes as f64 / (elapsed as f64 / 1000.0))
        }
    }
}

/// Type of network connection as reported by the path observer.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum ConnectionType {
    Wifi,
    Cellular,
    Ethernet,
    Unknown,
}

/// Coarse signal-strength band, ordered `Unknown < Poor < Fair < Good < Excellent`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize)]
pub enum SignalStrength {
    Unknown,
    Poor,
    Fair,
    Good,
    Excellent,
}

/// Classified quality band, used to drive admission and chunking decisions.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum QualityBand {
    Poor,
    Fair,
    Good,
}

/// A point-in-time network quality snapshot.
#[derive(Debug, Clone, Copy, Serialize, Deserialize)]
pub struct NetworkQuality {
    pub connection_type: ConnectionType,
    pub is_expensive: bool,
    pub is_constrained: bool,
    /// Estimated bandwidth in bytes/second.
    pub estimated_bandwidth: f64,
    /// Round-trip latency in seconds.
    pub latency: f64,
    /// Fraction of packets lost, in `[0, 1]`.
    pub packet_loss: f64,
    pub signal_strength: SignalStrength,
}

impl NetworkQuality {
    /// Classify into a [`QualityBand`] per spec §3's thresholds.
    pub fn band(&self) -> QualityBand {
        const MB: f64 = 1_000_000.0;
        const KB: f64 = 100_000.0;
        if self.estimated_bandwidth > MB && self.latency < 0.100 && self.packet_loss < 0.01 {
            QualityBand::Good
        } else if self.estimated_bandwidth > KB && self.latency < 0.500 && self.packet_loss < 0.05 {
            QualityBand::Fair
        } else {
            QualityBand::Poor
        }
    }

    /// A quality snapshot that always admits and never defers, used in tests
    /// and as a fallback default.
    pub fn unconstrained() -> Self {
        Self {
            connection_type: ConnectionType::Wifi,
            is_expensive: false,
            is_constrained: false,
            estimated_bandwidth: 10_000_000.0,
            latency: 0.01,
            packet_loss: 0.0,
            signal_strength: SignalStrength::Excellent,
        }
    }
}

/// A change reported by the remote puller during a pull cycle (§6).
#[derive(Debug, Clone, Serialize, Deserialize)]
pub enum Change {
    Created { id: String, payload: Vec<u8>, modified_at: DateTime<Utc>, version: i64 },
    Updated { id: String, payload: Vec<u8>, modified_at: DateTime<Utc>, version: i64 },
    Deleted { id: String },
}

/// Symmetric encryption algorithm tag, persisted alongside ciphertext.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum EncryptionAlgorithm {
    Aes256Gcm,
    ChaCha20Poly1305,
}

/// Compression engine tag, persisted alongside compressed payloads.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum CompressionAlgorithm {
    Lz4,
    Zlib,
    Lzma,
    /// Accepted for round-trip compatibility; served by the `Zlib` backend.
    /// See `store::compression` module docs.
    Lzfse,
}

/// A persisted, authenticated-encrypted (optionally compressed) record.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EncryptedBlob {
    #[serde(with = "hex_bytes")]
    pub ciphertext: Vec<u8>,
    pub algorithm_tag: EncryptionAlgorithm,
    pub timestamp: DateTime<Utc>,
    /// Present only when the blob is keyed by a password-derived key.
    #[serde(with = "opt_hex_bytes")]
    pub salt: Option<Vec<u8>>,
}

pub(crate) mod hex_bytes {
    use serde::{Deserialize, Deserializer, Serializer};

    pub fn serialize<S: Serializer>(bytes: &Vec<u8>, s: S) -> Result<S::Ok, S::Error> {
        s.serialize_str(&hex::encode(bytes))
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(d: D) -> Result<Vec<u8>, D::Error> {
        let s = String::deserialize(d)?;
        hex::decode(s).map_err(serde::de::Error::custom)
    }
}

pub(crate) mod opt_hex_bytes {
    use serde::{Deserialize, Deserializer, Serializer};

    pub fn serialize<S: Serializer>(bytes: &Option<Vec<u8>>, s: S) -> Result<S::Ok, S::Error> {
        match bytes {
            Some(b) => s.serialize_str(&hex::encode(b)),
            None => s.serialize_none(),
        }
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(d: D) -> Result<Option<Vec<u8>>, D::Error> {
        let s: Option<String> = Option::deserialize(d)?;
        match s {
            Some(s) => hex::decode(s).map(Some).map_err(serde::de::Error::custom),
            None => Ok(None),
        }
    }
}
