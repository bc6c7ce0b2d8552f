//! Optimistic Update Manager (spec §4.D).
//!
//! Applies user-visible changes immediately, tracks pending state, and
//! guarantees rollback on sync failure or timeout. Grounded in
//! `enterprise::collaboration::operations::OperationalTransform`'s
//! apply/invert pattern (apply immediately, keep the inverse for undo) and
//! the single-timer deadline scheduler design note from this crate's own
//! architecture (`orchestrator`-adjacent: one `BinaryHeap` + one sleeping
//! task rather than one timer per pending update).

use std::cmp::Reverse;
use std::collections::BinaryHeap;
use std::future::Future;
use std::pin::Pin;
use std::sync::{Arc, Weak};

use chrono::{DateTime, Utc};
use dashmap::DashMap;
use parking_lot::Mutex;
use tokio::sync::{watch, Notify};
use tracing::{instrument, warn};
use uuid::Uuid;

use crate::config::OptimisticConfig;
use crate::error::{OptimisticError, OptimisticResult, RemoteError};
use crate::types::{OptimisticOp, PendingUpdate, UpdateStatus};

/// Storage seam the manager applies optimistic and confirmed/rolled-back
/// values against, keyed by `(entity_type, entity_id)` (spec §9's
/// no-runtime-reflection design note).
pub trait EntityStore: Send + Sync {
    fn put(&self, entity_type: &str, entity_id: &str, value: &[u8]);
    fn remove(&self, entity_type: &str, entity_id: &str);
    fn get(&self, entity_type: &str, entity_id: &str) -> Option<Vec<u8>>;
}

type SyncFuture = Pin<Box<dyn Future<Output = Result<Vec<u8>, RemoteError>> + Send>>;

/// Observable snapshots published after every state change.
#[derive(Debug, Clone)]
pub struct Snapshots {
    pub pending: watch::Receiver<Vec<PendingUpdate>>,
    pub failed: watch::Receiver<Vec<PendingUpdate>>,
}

struct Inner {
    config: OptimisticConfig,
    store: Arc<dyn EntityStore>,
    pending: DashMap<Uuid, PendingUpdate>,
    deadlines: Mutex<BinaryHeap<Reverse<(DateTime<Utc>, Uuid)>>>,
    wake: Notify,
    pending_tx: watch::Sender<Vec<PendingUpdate>>,
    failed_tx: watch::Sender<Vec<PendingUpdate>>,
}

/// Manages optimistic mutations: applies immediately, confirms or rolls
/// back as sync resolves, and force-rolls-back anything that outlives its
/// deadline.
pub struct OptimisticUpdateManager {
    inner: Arc<Inner>,
}

impl OptimisticUpdateManager {
    /// Construct a manager and start its single deadline-driver task. The
    /// task holds only a [`Weak`] reference, so it exits once every
    /// [`OptimisticUpdateManager`] clone referencing this state is dropped.
    pub fn new(config: OptimisticConfig, store: Arc<dyn EntityStore>) -> Self {
        let (pending_tx, _) = watch::channel(Vec::new());
        let (failed_tx, _) = watch::channel(Vec::new());
        let inner = Arc::new(Inner {
            config,
            store,
            pending: DashMap::new(),
            deadlines: Mutex::new(BinaryHeap::new()),
            wake: Notify::new(),
            pending_tx,
            failed_tx,
        });

        let weak = Arc::downgrade(&inner);
        tokio::spawn(deadline_driver(weak));

        Self { inner }
    }

    pub fn subscribe(&self) -> Snapshots {
        Snapshots {
            pending: self.inner.pending_tx.subscribe(),
            failed: self.inner.failed_tx.subscribe(),
        }
    }

    fn publish(&self) {
        publish_from(&self.inner);
    }

    fn deadline(&self) -> DateTime<Utc> {
        Utc::now() + chrono::Duration::seconds(self.inner.config.rollback_timeout_secs)
    }

    fn schedule_deadline(&self, update_id: Uuid, at: DateTime<Utc>) {
        self.inner.deadlines.lock().push(Reverse((at, update_id)));
        self.inner.wake.notify_one();
    }

    fn enforce_capacity(&self) {
        if self.inner.pending.len() <= self.inner.config.max_pending_updates {
            return;
        }
        let oldest = self
            .inner
            .pending
            .iter()
            .filter(|e| !matches!(e.value().status, UpdateStatus::Confirmed | UpdateStatus::RolledBack))
            .min_by_key(|e| e.value().deadline_at)
            .map(|e| *e.key());
        if let Some(id) = oldest {
            warn!(update_id = %id, "pending update capacity exceeded, rolling back oldest");
            self.rollback(id);
        }
    }

    fn insert_and_apply(&self, update: PendingUpdate, applied_value: &[u8]) -> Uuid {
        let id = update.update_id;
        self.inner.store.put(&update.entity_type, &update.entity_id, applied_value);
        self.schedule_deadline(id, update.deadline_at);
        self.inner.pending.insert(id, update);
        self.publish();
        self.enforce_capacity();
        id
    }

    /// Apply `optimistic_value` as a new entity immediately and kick off `sync_fn`.
    #[instrument(skip(self, optimistic_value, sync_fn))]
    pub fn optimistic_create(
        &self,
        entity_type: impl Into<String>,
        entity_id: impl Into<String>,
        optimistic_value: Vec<u8>,
        sync_fn: impl Future<Output = Result<Vec<u8>, RemoteError>> + Send + 'static,
    ) -> Uuid {
        let entity_type = entity_type.into();
        let entity_id = entity_id.into();
        let update = PendingUpdate::new(entity_id, entity_type, OptimisticOp::Create, None, optimistic_value.clone(), self.deadline());
        let id = self.insert_and_apply(update, &optimistic_value);
        self.start_sync(id, Box::pin(sync_fn));
        id
    }

    /// Snapshot the current value, replace it with `optimistic_value`, and kick off `sync_fn`.
    #[instrument(skip(self, optimistic_value, sync_fn))]
    pub fn optimistic_update(
        &self,
        entity_type: impl Into<String>,
        entity_id: impl Into<String>,
        optimistic_value: Vec<u8>,
        sync_fn: impl Future<Output = Result<Vec<u8>, RemoteError>> + Send + 'static,
    ) -> Uuid {
        let entity_type = entity_type.into();
        let entity_id = entity_id.into();
        let original = self.inner.store.get(&entity_type, &entity_id);
        let update = PendingUpdate::new(entity_id, entity_type, OptimisticOp::Update, original, optimistic_value.clone(), self.deadline());
        let id = self.insert_and_apply(update, &optimistic_value);
        self.start_sync(id, Box::pin(sync_fn));
        id
    }

    /// Snapshot the current value, remove it, and kick off `sync_fn`.
    #[instrument(skip(self, sync_fn))]
    pub fn optimistic_delete(
        &self,
        entity_type: impl Into<String>,
        entity_id: impl Into<String>,
        sync_fn: impl Future<Output = Result<Vec<u8>, RemoteError>> + Send + 'static,
    ) -> Uuid {
        let entity_type = entity_type.into();
        let entity_id = entity_id.into();
        let original = self.inner.store.get(&entity_type, &entity_id);
        let update = PendingUpdate::new(entity_id.clone(), entity_type.clone(), OptimisticOp::Delete, original, Vec::new(), self.deadline());
        let id = update.update_id;
        self.inner.store.remove(&entity_type, &entity_id);
        self.schedule_deadline(id, update.deadline_at);
        self.inner.pending.insert(id, update);
        self.publish();
        self.enforce_capacity();
        self.start_sync(id, Box::pin(sync_fn));
        id
    }

    fn start_sync(&self, update_id: Uuid, sync_fn: SyncFuture) {
        if let Some(mut entry) = self.inner.pending.get_mut(&update_id) {
            entry.status = UpdateStatus::Syncing;
        }
        self.publish();

        let inner = Arc::clone(&self.inner);
        tokio::spawn(async move {
            let result = sync_fn.await;
            let Some((entity_type, entity_id, op)) = inner.pending.get(&update_id).map(|e| (e.entity_type.clone(), e.entity_id.clone(), e.op)) else {
                return;
            };

            match result {
                Ok(server_value) => {
                    match op {
                        OptimisticOp::Delete => inner.store.remove(&entity_type, &entity_id),
                        OptimisticOp::Create | OptimisticOp::Update => inner.store.put(&entity_type, &entity_id, &server_value),
                    }
                    inner.pending.remove(&update_id);
                }
                Err(e) => {
                    if let Some(mut entry) = inner.pending.get_mut(&update_id) {
                        entry.status = UpdateStatus::Failed;
                        entry.last_error = Some(e.to_string());
                    }
                }
            }
            publish_from(&inner);
        });
    }

    /// Revert a pending update's effect on the store per its operation kind
    /// and mark it `rolledBack`, then purge it.
    #[instrument(skip(self))]
    pub fn rollback(&self, update_id: Uuid) {
        let Some((_, update)) = self.inner.pending.remove(&update_id) else {
            return;
        };
        match update.op {
            OptimisticOp::Create => self.inner.store.remove(&update.entity_type, &update.entity_id),
            OptimisticOp::Update | OptimisticOp::Delete => {
                if let Some(original) = &update.original_value {
                    self.inner.store.put(&update.entity_type, &update.entity_id, original);
                }
            }
        }
        self.publish();
    }

    /// Roll back every non-terminal pending update.
    pub fn rollback_all(&self) {
        let ids: Vec<Uuid> = self
            .inner
            .pending
            .iter()
            .filter(|e| !matches!(e.value().status, UpdateStatus::Confirmed | UpdateStatus::RolledBack))
            .map(|e| *e.key())
            .collect();
        for id in ids {
            self.rollback(id);
        }
    }

    /// Retry a failed update's sync with a freshly supplied `sync_fn`.
    pub fn retry(&self, update_id: Uuid, sync_fn: impl Future<Output = Result<Vec<u8>, RemoteError>> + Send + 'static) -> OptimisticResult<()> {
        if !self.inner.pending.contains_key(&update_id) {
            return Err(OptimisticError::NotFound(update_id));
        }
        self.start_sync(update_id, Box::pin(sync_fn));
        Ok(())
    }

    /// Whether `entity_id` has a non-terminal pending update.
    pub fn is_pending(&self, entity_id: &str) -> bool {
        self.inner.pending.iter().any(|e| e.entity_id == entity_id && matches!(e.status, UpdateStatus::Pending | UpdateStatus::Syncing))
    }

    /// Whether `entity_id` has an update currently in the `failed` state.
    pub fn is_failed(&self, entity_id: &str) -> bool {
        self.inner.pending.iter().any(|e| e.entity_id == entity_id && e.status == UpdateStatus::Failed)
    }
}

/// Split the tracked updates into the `pending` stream (still in-flight:
/// `pending`/`syncing`) and the `failed` stream, per spec §4.D's two named
/// observer streams.
fn publish_from(inner: &Arc<Inner>) {
    let mut pending = Vec::new();
    let mut failed = Vec::new();
    for entry in inner.pending.iter() {
        match entry.status {
            UpdateStatus::Pending | UpdateStatus::Syncing => pending.push(entry.value().clone()),
            UpdateStatus::Failed => failed.push(entry.value().clone()),
            UpdateStatus::Confirmed | UpdateStatus::RolledBack => {}
        }
    }
    let _ = inner.pending_tx.send(pending);
    let _ = inner.failed_tx.send(failed);
}

/// Single background task driving rollback deadlines: wakes at the
/// earliest scheduled deadline, force-rolls-back anything still pending or
/// syncing past it, and sleeps again. Exits once `inner` can no longer be
/// upgraded (the owning manager was dropped).
async fn deadline_driver(weak: Weak<Inner>) {
    loop {
        let Some(inner) = weak.upgrade() else { return };

        let next = inner.deadlines.lock().peek().map(|Reverse((at, _))| *at);
        match next {
            None => {
                inner.wake.notified().await;
            }
            Some(at) => {
                let wait = (at - Utc::now()).to_std().unwrap_or(std::time::Duration::ZERO);
                tokio::select! {
                    _ = tokio::time::sleep(wait) => {}
                    _ = inner.wake.notified() => {}
                }
                let Reverse((at, id)) = {
                    let mut deadlines = inner.deadlines.lock();
                    match deadlines.pop() {
                        Some(item) => item,
                        None => continue,
                    }
                };
                if at > Utc::now() {
                    inner.deadlines.lock().push(Reverse((at, id)));
                    continue;
                }
                if let Some(entry) = inner.pending.get(&id) {
                    if matches!(entry.status, UpdateStatus::Pending | UpdateStatus::Syncing) {
                        drop(entry);
                        let manager = OptimisticUpdateManager { inner: Arc::clone(&inner) };
                        manager.rollback(id);
                    }
                }
            }
        }
    }
}
