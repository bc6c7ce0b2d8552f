//! Atomic JSON persistence for the retry queue (spec §4.C).
//!
//! Grounded in `enterprise::cloud::sync::SyncEngine`'s checkpoint-file
//! pattern: the whole operation set is serialized and written to a sibling
//! temp file, then renamed into place, so a crash mid-write never leaves a
//! truncated `RetryQueue.json` behind.

use std::path::{Path, PathBuf};

use crate::error::QueueResult;
use crate::types::Operation;

/// Load the persisted operation set from `path`. A missing or malformed
/// file is treated as an empty queue rather than an error — spec §4.C's
/// "failure semantics" note that persistence problems never block the
/// in-memory queue from operating.
pub async fn load(path: &Path) -> Vec<Operation> {
    match tokio::fs::read(path).await {
        Ok(bytes) => serde_json::from_slice(&bytes).unwrap_or_default(),
        Err(_) => Vec::new(),
    }
}

/// Persist `operations` to `path` atomically: write to a sibling temp file,
/// then rename into place.
pub async fn save(path: &Path, operations: &[Operation]) -> QueueResult<()> {
    let bytes = serde_json::to_vec_pretty(operations)?;
    let tmp: PathBuf = path.with_extension("json.tmp");
    if let Some(parent) = path.parent() {
        tokio::fs::create_dir_all(parent).await?;
    }
    tokio::fs::write(&tmp, bytes).await?;
    tokio::fs::rename(&tmp, path).await?;
    Ok(())
}
