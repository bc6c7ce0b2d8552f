//! Encrypted Compressed Store (spec §4.A).
//!
//! Persists opaque byte payloads under a typed logical key space with
//! authenticated encryption and optional compression. Not a database:
//! lookups are by primary key (`id`), iteration is by type tag. Grounded in
//! `enterprise::cloud::storage`'s on-disk metadata-plus-payload split and
//! `enterprise::security::vault`'s secret-record shape, with the directory
//! layout pinned to spec §4.A exactly (`data/<id>.bin`, `meta/<id>.json`).

pub mod compression;
pub mod encryption;
pub mod kdf;
pub mod vault;

use std::path::{Path, PathBuf};
use std::sync::Arc;

use chrono::{DateTime, Utc};
use rand::RngCore;
use serde::{Deserialize, Serialize};
use tracing::instrument;
use uuid::Uuid;

use crate::config::StoreConfig;
use crate::error::{StoreError, StoreResult};
use crate::interfaces::SecretVault;
use crate::types::{CompressionAlgorithm, EncryptionAlgorithm};

/// Plaintext metadata stored alongside each encrypted payload.
///
/// Forward-readable: unknown extra fields are ignored by older readers
/// (spec §6), which `serde`'s default "ignore unknown fields" behavior
/// gives us for free as long as we never add `#[serde(deny_unknown_fields)]`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ItemMetadata {
    pub id: Uuid,
    #[serde(rename = "type")]
    pub type_tag: String,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
    pub size: u64,
    pub algorithm: EncryptionAlgorithm,
    pub compressed: bool,
    /// Which codec actually compressed this item, if any. `None` for items
    /// written before this field existed or for which compression was
    /// bypassed; `get()` falls back to the store's live default in that
    /// case, same as it always did.
    #[serde(default)]
    pub compression_algorithm: Option<CompressionAlgorithm>,
    pub original_size: u64,
    #[serde(default, with = "crate::types::opt_hex_bytes")]
    pub salt: Option<Vec<u8>>,
}

/// Aggregate usage statistics (spec §4.A's `usage()`).
#[derive(Debug, Clone, Copy, Serialize, Deserialize)]
pub struct Usage {
    pub bytes: u64,
    pub count: u64,
    /// Free space on the filesystem backing the store root, in bytes.
    /// `None` when it cannot be determined (the query is best-effort).
    pub free: Option<u64>,
}

/// Persistent store combining authenticated encryption with streaming
/// compression, keyed by `(type_tag, id)` per spec §9's "avoid reflection"
/// design note.
pub struct EncryptedCompressedStore {
    config: StoreConfig,
    master_key: [u8; 32],
    /// Set when the master key was derived rather than vault-generated, and
    /// stamped into every item's metadata so `EncryptedBlob.salt` (spec
    /// §4.A) is meaningful for password-keyed stores.
    salt: Option<Vec<u8>>,
}

impl EncryptedCompressedStore {
    /// Open (or initialize) a store rooted at `config.root_dir`. The master
    /// key is generated once and cached in `vault`; subsequent opens
    /// retrieve the same key.
    #[instrument(skip(config, vault))]
    pub async fn open(config: StoreConfig, vault: &dyn SecretVault) -> StoreResult<Self> {
        Self::create_dirs(&config).await?;

        let master_key = match vault.retrieve(&config.master_key_vault_tag).await {
            Ok(bytes) if bytes.len() == 32 => {
                let mut key = [0u8; 32];
                key.copy_from_slice(&bytes);
                key
            }
            _ => {
                let mut key = [0u8; 32];
                rand::rngs::OsRng.fill_bytes(&mut key);
                vault.store(&config.master_key_vault_tag, &key).await?;
                key
            }
        };

        Ok(Self { config, master_key, salt: None })
    }

    /// Open a store keyed by a user-supplied password instead of a
    /// vault-generated key, per spec §4.A's PBKDF2-HMAC-SHA256 keying path.
    /// The salt is generated once and cached in `vault` alongside the tag,
    /// so reopening with the same password yields the same key.
    #[instrument(skip(config, vault, password))]
    pub async fn open_with_password(config: StoreConfig, vault: &dyn SecretVault, password: &[u8]) -> StoreResult<Self> {
        Self::create_dirs(&config).await?;
        let salt = Self::load_or_create_salt(&config, vault).await?;
        let derived = kdf::derive_pbkdf2(password, &salt, config.pbkdf2_iterations);
        let mut master_key = [0u8; 32];
        master_key.copy_from_slice(derived.as_bytes());
        Ok(Self { config, master_key, salt: Some(salt) })
    }

    /// Open a store keyed by existing high-entropy key material (e.g. a key
    /// handed down from a platform secure enclave) via HKDF-SHA256, per spec
    /// §4.A's second named keying method. Unlike [`Self::open_with_password`]
    /// this does not run an expensive password-stretching KDF, since the
    /// input is assumed to already be a strong secret.
    #[instrument(skip(config, vault, input_key_material))]
    pub async fn open_with_key_material(config: StoreConfig, vault: &dyn SecretVault, input_key_material: &[u8]) -> StoreResult<Self> {
        Self::create_dirs(&config).await?;
        let salt = Self::load_or_create_salt(&config, vault).await?;
        let derived = kdf::derive_hkdf(input_key_material, &salt);
        let mut master_key = [0u8; 32];
        master_key.copy_from_slice(derived.as_bytes());
        Ok(Self { config, master_key, salt: Some(salt) })
    }

    async fn create_dirs(config: &StoreConfig) -> StoreResult<()> {
        tokio::fs::create_dir_all(config.root_dir.join("data")).await?;
        tokio::fs::create_dir_all(config.root_dir.join("meta")).await?;
        Ok(())
    }

    /// Fetch the derivation salt cached under `{master_key_vault_tag}.salt`,
    /// generating and caching a fresh one on first use.
    async fn load_or_create_salt(config: &StoreConfig, vault: &dyn SecretVault) -> StoreResult<Vec<u8>> {
        let salt_tag = format!("{}.salt", config.master_key_vault_tag);
        match vault.retrieve(&salt_tag).await {
            Ok(bytes) if bytes.len() == kdf::SALT_LEN => Ok(bytes),
            _ => {
                let mut salt = vec![0u8; kdf::SALT_LEN];
                rand::rngs::OsRng.fill_bytes(&mut salt);
                vault.store(&salt_tag, &salt).await?;
                Ok(salt)
            }
        }
    }

    fn data_path(&self, id: Uuid) -> PathBuf {
        self.config.root_dir.join("data").join(format!("{id}.bin"))
    }

    fn meta_path(&self, id: Uuid) -> PathBuf {
        self.config.root_dir.join("meta").join(format!("{id}.json"))
    }

    /// Persist `bytes` under `type_tag`, compressing (if it clears the
    /// size/ratio thresholds) then encrypting. Returns the new item's id.
    #[instrument(skip(self, bytes), fields(len = bytes.len()))]
    pub async fn put(&self, type_tag: &str, bytes: &[u8]) -> StoreResult<Uuid> {
        let id = Uuid::new_v4();
        let now = Utc::now();

        let (payload, compressed) = self.maybe_compress(bytes)?;
        let ciphertext = encryption::encrypt(self.config.default_encryption, &self.master_key, &payload)?;

        let meta = ItemMetadata {
            id,
            type_tag: type_tag.to_string(),
            created_at: now,
            updated_at: now,
            size: ciphertext.len() as u64,
            algorithm: self.config.default_encryption,
            compressed,
            compression_algorithm: compressed.then_some(self.config.default_compression),
            original_size: bytes.len() as u64,
            salt: self.salt.clone(),
        };

        write_atomic(&self.data_path(id), &ciphertext).await?;
        write_atomic(&self.meta_path(id), &serde_json::to_vec_pretty(&meta)?).await?;

        Ok(id)
    }

    /// Retrieve and decrypt/decompress the item stored under `id`.
    #[instrument(skip(self))]
    pub async fn get(&self, id: Uuid) -> StoreResult<Vec<u8>> {
        let meta = self.read_meta(id).await?;
        let ciphertext = tokio::fs::read(self.data_path(id))
            .await
            .map_err(|e| match e.kind() {
                std::io::ErrorKind::NotFound => StoreError::NotFound(id.to_string()),
                _ => StoreError::StorageIo(e),
            })?;

        let payload = encryption::decrypt(meta.algorithm, &self.master_key, &ciphertext)?;

        if meta.compressed {
            let algorithm = meta.compression_algorithm.unwrap_or(self.config.default_compression);
            compression::decompress(algorithm, &payload)
        } else {
            Ok(payload)
        }
    }

    /// Fetch an item's plaintext metadata without decrypting its payload.
    #[instrument(skip(self))]
    pub async fn metadata(&self, id: Uuid) -> StoreResult<ItemMetadata> {
        self.read_meta(id).await
    }

    async fn read_meta(&self, id: Uuid) -> StoreResult<ItemMetadata> {
        let bytes = tokio::fs::read(self.meta_path(id))
            .await
            .map_err(|e| match e.kind() {
                std::io::ErrorKind::NotFound => StoreError::NotFound(id.to_string()),
                _ => StoreError::StorageIo(e),
            })?;
        serde_json::from_slice(&bytes).map_err(|e| {
            // `algorithm`/`compression_algorithm` are the only enum-tagged
            // fields in ItemMetadata; an "unknown variant" error here means
            // the persisted tag doesn't match any algorithm this build
            // knows, not a structurally malformed document.
            if e.to_string().contains("unknown variant") {
                StoreError::UnsupportedFormat(e.to_string())
            } else {
                StoreError::Serialization(e)
            }
        })
    }

    /// Remove an item. Idempotent: deleting an already-absent id succeeds.
    #[instrument(skip(self))]
    pub async fn delete(&self, id: Uuid) -> StoreResult<()> {
        for path in [self.data_path(id), self.meta_path(id)] {
            match tokio::fs::remove_file(&path).await {
                Ok(()) => {}
                Err(e) if e.kind() == std::io::ErrorKind::NotFound => {}
                Err(e) => return Err(StoreError::StorageIo(e)),
            }
        }
        Ok(())
    }

    /// List the ids of all items saved under `type_tag`.
    pub async fn list_by_type(&self, type_tag: &str) -> StoreResult<Vec<Uuid>> {
        let mut ids = Vec::new();
        let meta_dir = self.config.root_dir.join("meta");
        let mut entries = tokio::fs::read_dir(&meta_dir).await?;
        while let Some(entry) = entries.next_entry().await? {
            let bytes = tokio::fs::read(entry.path()).await?;
            if let Ok(meta) = serde_json::from_slice::<ItemMetadata>(&bytes) {
                if meta.type_tag == type_tag {
                    ids.push(meta.id);
                }
            }
        }
        Ok(ids)
    }

    /// Remove every item from the store.
    pub async fn clear(&self) -> StoreResult<()> {
        for sub in ["data", "meta"] {
            let dir = self.config.root_dir.join(sub);
            let mut entries = tokio::fs::read_dir(&dir).await?;
            while let Some(entry) = entries.next_entry().await? {
                tokio::fs::remove_file(entry.path()).await.ok();
            }
        }
        Ok(())
    }

    /// Aggregate on-disk usage for the store.
    pub async fn usage(&self) -> StoreResult<Usage> {
        let data_dir = self.config.root_dir.join("data");
        let mut total = 0u64;
        let mut count = 0u64;
        let mut entries = tokio::fs::read_dir(&data_dir).await?;
        while let Some(entry) = entries.next_entry().await? {
            if let Ok(metadata) = entry.metadata().await {
                total += metadata.len();
                count += 1;
            }
        }
        Ok(Usage { bytes: total, count, free: None })
    }

    /// Compress `bytes` if it clears the size threshold and the compressed
    /// form is actually smaller (spec §4.A); otherwise pass through
    /// uncompressed and record `compressed = false`.
    fn maybe_compress(&self, bytes: &[u8]) -> StoreResult<(Vec<u8>, bool)> {
        if bytes.len() < self.config.min_size_to_compress {
            return Ok((bytes.to_vec(), false));
        }
        let compressed = compression::compress(self.config.default_compression, bytes, self.config.stream_chunk_size)?;
        if compressed.len() >= bytes.len() {
            Ok((bytes.to_vec(), false))
        } else {
            Ok((compressed, true))
        }
    }
}

/// Write `bytes` to `path` atomically: write to a sibling temp file, then
/// rename into place (spec §4.A: "per-id writes are atomic via
/// rename-into-place").
async fn write_atomic(path: &Path, bytes: &[u8]) -> std::io::Result<()> {
    let tmp = path.with_extension(format!(
        "{}.tmp",
        path.extension().and_then(|e| e.to_str()).unwrap_or("")
    ));
    tokio::fs::write(&tmp, bytes).await?;
    tokio::fs::rename(&tmp, path).await?;
    Ok(())
}

/// Convenience: build a store for tests/examples with an in-memory vault
/// and a temp-directory root.
pub async fn open_in_memory(root_dir: PathBuf) -> StoreResult<(EncryptedCompressedStore, Arc<vault::InMemoryVault>)> {
    let vault = Arc::new(vault::InMemoryVault::new());
    let mut config = StoreConfig::default();
    config.root_dir = root_dir;
    let store = EncryptedCompressedStore::open(config, vault.as_ref()).await?;
    Ok((store, vault))
}
