//! Orchestrator: pull driver and online/offline supervisor (spec §4.E).
//!
//! Wires the bandwidth optimizer, retry queue, and optimistic update
//! manager together. Subscribes to the bandwidth optimizer's network
//! quality stream; on a reachable transition, starts the retry queue and
//! runs a pull cycle. On an unreachable transition, stops the retry queue
//! without cancelling anything still queued. Grounded in
//! `enterprise::cloud::sync::SyncEngine`'s online/offline supervisor loop,
//! narrowed to the single last-writer-wins conflict strategy spec §4.E
//! names (the teacher's pluggable `ConflictResolver` strategy registry is
//! not carried over).

use std::marker::PhantomData;
use std::sync::atomic::{AtomicI64, Ordering};
use std::sync::Arc;

use chrono::{DateTime, Utc};
use tracing::{info, instrument, warn};

use crate::bandwidth::BandwidthOptimizer;
use crate::interfaces::{EntityCodec, RemotePuller};
use crate::optimistic::{EntityStore, OptimisticUpdateManager};
use crate::queue::RetryQueue;
use crate::types::{Change, ConnectionType, Entity};

/// Whether a remote change with `remote_modified_at` should be applied
/// over a local value last modified at `local_modified_at` (`None` if no
/// local value exists). Last-writer-wins, with the local value winning
/// ties (spec §2, §3).
pub fn resolve_conflict(local_modified_at: Option<DateTime<Utc>>, remote_modified_at: DateTime<Utc>) -> bool {
    match local_modified_at {
        None => true,
        Some(local) => remote_modified_at > local,
    }
}

/// Wires B (bandwidth), C (retry queue), and D (optimistic updates)
/// together and drives the remote → local pull cycle for entities of type
/// `E` stored under `entity_type`.
pub struct Orchestrator<E: Entity> {
    entity_type: String,
    bandwidth: Arc<BandwidthOptimizer>,
    queue: Arc<RetryQueue>,
    optimistic: Arc<OptimisticUpdateManager>,
    store: Arc<dyn EntityStore>,
    puller: Arc<dyn RemotePuller>,
    codec: Arc<dyn EntityCodec<E>>,
    cursor: AtomicI64,
    _entity: PhantomData<E>,
}

impl<E: Entity + Send + Sync + 'static> Orchestrator<E> {
    pub fn new(
        entity_type: impl Into<String>,
        bandwidth: Arc<BandwidthOptimizer>,
        queue: Arc<RetryQueue>,
        optimistic: Arc<OptimisticUpdateManager>,
        store: Arc<dyn EntityStore>,
        puller: Arc<dyn RemotePuller>,
        codec: Arc<dyn EntityCodec<E>>,
        starting_cursor: i64,
    ) -> Arc<Self> {
        let this = Arc::new(Self {
            entity_type: entity_type.into(),
            bandwidth,
            queue,
            optimistic,
            store,
            puller,
            codec,
            cursor: AtomicI64::new(starting_cursor),
            _entity: PhantomData,
        });
        tokio::spawn(Arc::clone(&this).supervise_network());
        this
    }

    pub fn cursor(&self) -> i64 {
        self.cursor.load(Ordering::SeqCst)
    }

    async fn supervise_network(self: Arc<Self>) {
        let mut quality = self.bandwidth.subscribe().quality;
        let mut reachable = quality.borrow().connection_type != ConnectionType::Unknown;
        loop {
            if quality.changed().await.is_err() {
                return;
            }
            let now_reachable = quality.borrow().connection_type != ConnectionType::Unknown;
            if now_reachable == reachable {
                continue;
            }
            reachable = now_reachable;

            if reachable {
                info!("network reachable; starting retry queue and running a pull cycle");
                self.queue.start_processing().await;
                if let Err(e) = self.pull_cycle().await {
                    warn!(error = %e, "pull cycle failed");
                }
            } else {
                info!("network unreachable; stopping retry queue processing (queued operations kept)");
                self.queue.stop_processing().await;
            }
        }
    }

    /// Fetch remote changes since the current cursor, resolve conflicts
    /// with last-writer-wins, apply the winners to the store, and advance
    /// the cursor.
    #[instrument(skip(self))]
    pub async fn pull_cycle(&self) -> Result<(), crate::error::RemoteError> {
        let since = self.cursor.load(Ordering::SeqCst);
        let changes = self.puller.fetch_changes(since).await?;

        for change in changes {
            match change {
                Change::Created { id, payload, modified_at, version } | Change::Updated { id, payload, modified_at, version } => {
                    self.apply_upsert(&id, &payload, modified_at, version);
                }
                Change::Deleted { id } => {
                    self.store.remove(&self.entity_type, &id);
                }
            }
        }

        Ok(())
    }

    fn apply_upsert(&self, id: &str, payload: &[u8], remote_modified_at: DateTime<Utc>, version: i64) {
        if self.optimistic.is_pending(id) {
            // A local optimistic change is still in flight for this entity;
            // applying the remote value now would clobber it before its own
            // sync resolves. Leave the cursor where it is so this change is
            // re-fetched and re-checked on the next pull cycle.
            info!(entity_id = %id, "deferring remote change: optimistic update in flight for entity");
            return;
        }

        let local_modified_at = self
            .store
            .get(&self.entity_type, id)
            .and_then(|bytes| match self.codec.decode(&bytes) {
                Ok(entity) => Some(entity.modified_at()),
                Err(e) => {
                    warn!(entity_id = %id, error = %e, "failed to decode local entity for conflict resolution; treating as absent");
                    None
                }
            });

        if resolve_conflict(local_modified_at, remote_modified_at) {
            self.store.put(&self.entity_type, id, payload);
        }
        self.cursor.fetch_max(version, Ordering::SeqCst);
    }
}
