//! Reference [`SecretVault`] implementation.
//!
//! Production builds supply a platform secret store (Keychain, Android
//! Keystore, DPAPI, ...) via the [`SecretVault`] trait; this file provides
//! the file-backed implementation this crate's own tests run against, plus
//! an in-memory one for unit tests that shouldn't touch disk. Grounded in
//! `enterprise::security::vault::SecretValue`'s content-plus-metadata shape,
//! simplified to the four-method contract spec §6 defines — no versioning,
//! access policy, or rotation, none of which SPEC_FULL calls for.

use std::collections::HashMap;
use std::path::PathBuf;

use async_trait::async_trait;
use parking_lot::RwLock;
use zeroize::Zeroizing;

use crate::error::KeychainError;
use crate::interfaces::SecretVault;

/// Purely in-memory vault. Secrets vanish when the process exits — useful
/// for tests that want deterministic, disk-free key material.
#[derive(Default)]
pub struct InMemoryVault {
    secrets: RwLock<HashMap<String, Zeroizing<Vec<u8>>>>,
}

impl InMemoryVault {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl SecretVault for InMemoryVault {
    async fn store(&self, tag: &str, bytes: &[u8]) -> Result<(), KeychainError> {
        self.secrets
            .write()
            .insert(tag.to_string(), Zeroizing::new(bytes.to_vec()));
        Ok(())
    }

    async fn retrieve(&self, tag: &str) -> Result<Vec<u8>, KeychainError> {
        self.secrets
            .read()
            .get(tag)
            .map(|v| v.to_vec())
            .ok_or_else(|| KeychainError::NotFound(tag.to_string()))
    }

    async fn delete(&self, tag: &str) -> Result<(), KeychainError> {
        self.secrets.write().remove(tag);
        Ok(())
    }

    async fn delete_all(&self) -> Result<(), KeychainError> {
        self.secrets.write().clear();
        Ok(())
    }
}

/// File-backed vault: one file per tag under a root directory, with
/// restrictive permissions on Unix. Intended as a reference/testing
/// backend, not a substitute for a real platform keychain — spec §4.A's
/// master key "is stored in a platform-provided secret vault", and this
/// type is the fallback for platforms (or tests) with none available.
pub struct FileVault {
    root: PathBuf,
}

impl FileVault {
    /// Use `root` as the vault directory, creating it if absent.
    pub fn new(root: impl Into<PathBuf>) -> std::io::Result<Self> {
        let root = root.into();
        std::fs::create_dir_all(&root)?;
        Ok(Self { root })
    }

    /// Use the platform's default application-data directory.
    pub fn default_location(app_tag: &str) -> std::io::Result<Self> {
        let base = dirs::data_local_dir().unwrap_or_else(std::env::temp_dir);
        Self::new(base.join(app_tag).join("vault"))
    }

    fn path_for(&self, tag: &str) -> PathBuf {
        self.root.join(format!("{}.secret", sanitize_tag(tag)))
    }
}

fn sanitize_tag(tag: &str) -> String {
    tag.chars()
        .map(|c| if c.is_ascii_alphanumeric() || c == '-' || c == '_' || c == '.' { c } else { '_' })
        .collect()
}

#[async_trait]
impl SecretVault for FileVault {
    async fn store(&self, tag: &str, bytes: &[u8]) -> Result<(), KeychainError> {
        let path = self.path_for(tag);
        let tmp = path.with_extension("tmp");
        tokio::fs::write(&tmp, bytes).await?;
        tokio::fs::rename(&tmp, &path).await?;
        #[cfg(unix)]
        {
            use std::os::unix::fs::PermissionsExt;
            let perms = std::fs::Permissions::from_mode(0o600);
            tokio::fs::set_permissions(&path, perms).await?;
        }
        Ok(())
    }

    async fn retrieve(&self, tag: &str) -> Result<Vec<u8>, KeychainError> {
        let path = self.path_for(tag);
        tokio::fs::read(&path)
            .await
            .map_err(|_| KeychainError::NotFound(tag.to_string()))
    }

    async fn delete(&self, tag: &str) -> Result<(), KeychainError> {
        let path = self.path_for(tag);
        match tokio::fs::remove_file(&path).await {
            Ok(()) => Ok(()),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(()),
            Err(e) => Err(KeychainError::Io(e)),
        }
    }

    async fn delete_all(&self) -> Result<(), KeychainError> {
        let mut entries = tokio::fs::read_dir(&self.root).await?;
        while let Some(entry) = entries.next_entry().await? {
            tokio::fs::remove_file(entry.path()).await.ok();
        }
        Ok(())
    }
}
