//! Configuration aggregates for each subsystem, with spec-mandated defaults.
//!
//! Mirrors `enterprise::config::EnterpriseConfig`'s `from_file`/`save`
//! round-trip through `serde_json`. No environment variable or CLI parsing
//! lives here — spec §6 is explicit that those are caller concerns.

use std::path::Path;

use serde::{Deserialize, Serialize};

use crate::types::{CompressionAlgorithm, EncryptionAlgorithm};

/// Backoff + retry policy for the retry queue (spec §4.C).
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RetryQueueConfig {
    pub max_retries: u32,
    pub initial_delay_secs: f64,
    pub multiplier: f64,
    pub max_delay_secs: f64,
    pub jitter: f64,
    /// HTTP statuses treated as retryable in addition to transient network faults.
    pub retryable_statuses: Vec<u16>,
}

impl Default for RetryQueueConfig {
    fn default() -> Self {
        Self {
            max_retries: 5,
            initial_delay_secs: 1.0,
            multiplier: 2.0,
            max_delay_secs: 300.0,
            jitter: 0.25,
            retryable_statuses: vec![408, 429, 500, 502, 503, 504],
        }
    }
}

impl RetryQueueConfig {
    /// The "aggressive" profile from spec §4.C: more retries, faster
    /// initial backoff, gentler growth, longer ceiling.
    pub fn aggressive() -> Self {
        Self {
            max_retries: 10,
            initial_delay_secs: 0.5,
            multiplier: 1.5,
            max_delay_secs: 600.0,
            ..Self::default()
        }
    }
}

/// Bandwidth optimizer configuration (spec §4.B).
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BandwidthConfig {
    pub max_concurrent_transfers: usize,
    pub large_file_threshold: u64,
    pub wifi_only_for_large_files: bool,
    pub base_chunk_size: usize,
    /// Priority floor below which a sync is deferred unless the caller
    /// flags it user-initiated.
    pub user_initiated_priority: crate::types::Priority,
    /// Number of throughput samples retained for the moving average.
    pub throughput_window: usize,
}

impl Default for BandwidthConfig {
    fn default() -> Self {
        Self {
            max_concurrent_transfers: 4,
            large_file_threshold: 10 * 1024 * 1024,
            wifi_only_for_large_files: true,
            base_chunk_size: 256 * 1024,
            user_initiated_priority: crate::types::Priority::High,
            throughput_window: 100,
        }
    }
}

/// Encrypted compressed store configuration (spec §4.A).
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StoreConfig {
    pub root_dir: std::path::PathBuf,
    pub default_encryption: EncryptionAlgorithm,
    pub default_compression: CompressionAlgorithm,
    pub min_size_to_compress: usize,
    pub stream_chunk_size: usize,
    pub pbkdf2_iterations: u32,
    pub master_key_vault_tag: String,
}

impl Default for StoreConfig {
    fn default() -> Self {
        Self {
            root_dir: std::path::PathBuf::from("offline-sync-store"),
            default_encryption: EncryptionAlgorithm::Aes256Gcm,
            default_compression: CompressionAlgorithm::Lz4,
            min_size_to_compress: 1024,
            stream_chunk_size: 64 * 1024,
            pbkdf2_iterations: 100_000,
            master_key_vault_tag: "offline-sync-core.master-key".to_string(),
        }
    }
}

/// Optimistic update manager configuration (spec §4.D).
#[derive(Debug, Clone, Copy, Serialize, Deserialize)]
pub struct OptimisticConfig {
    pub max_pending_updates: usize,
    pub rollback_timeout_secs: i64,
}

impl Default for OptimisticConfig {
    fn default() -> Self {
        Self {
            max_pending_updates: 100,
            rollback_timeout_secs: 30,
        }
    }
}

/// Aggregate configuration for the whole core, load/saved as one JSON document.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct Config {
    pub retry_queue: RetryQueueConfig,
    pub bandwidth: BandwidthConfig,
    pub store: StoreConfig,
    pub optimistic: OptimisticConfig,
}

impl Config {
    /// Load configuration from a JSON file on disk.
    pub fn from_json_file(path: impl AsRef<Path>) -> Result<Self, std::io::Error> {
        let contents = std::fs::read_to_string(path)?;
        serde_json::from_str(&contents)
            .map_err(|e| std::io::Error::new(std::io::ErrorKind::InvalidData, e))
    }

    /// Persist configuration to a JSON file on disk.
    pub fn to_json_file(&self, path: impl AsRef<Path>) -> Result<(), std::io::Error> {
        let json = serde_json::to_string_pretty(self)
            .map_err(|e| std::io::Error::new(std::io::ErrorKind::InvalidData, e))?;
        std::fs::write(path, json)
    }
}
