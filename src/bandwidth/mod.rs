//! Bandwidth Optimizer (spec §4.B).
//!
//! Admission controller and transfer scheduler: does not perform I/O
//! itself, only issues admission permits and records outcomes reported by
//! an external I/O executor. Grounded in `enterprise::cloud::transfer::TransferManager`'s
//! admit/promote/pause cycle and `enterprise::ratelimit`'s quality-tiered
//! capacity halving, narrowed to the single-process, in-memory scope spec
//! §4.B defines (no distributed rate limiting).

pub mod quality;

use std::collections::VecDeque;

use dashmap::DashMap;
use parking_lot::RwLock;
use tokio::sync::watch;
use tracing::{instrument, warn};
use uuid::Uuid;

use crate::config::BandwidthConfig;
use crate::error::{BandwidthError, BandwidthResult};
use crate::interfaces::PathEvent;
use crate::types::{NetworkQuality, Priority, TransferStatus, TransferTask};

/// Observable snapshots published by the optimizer after every state change.
#[derive(Debug, Clone)]
pub struct Snapshots {
    pub quality: watch::Receiver<NetworkQuality>,
    pub transfers: watch::Receiver<Vec<TransferTask>>,
    pub average_throughput: watch::Receiver<f64>,
}

struct Inner {
    tasks: DashMap<Uuid, TransferTask>,
    /// Content hash → task id, for in-flight deduplication.
    dedup: DashMap<[u8; 32], Uuid>,
    quality: RwLock<NetworkQuality>,
    throughput_samples: RwLock<VecDeque<f64>>,
    quality_tx: watch::Sender<NetworkQuality>,
    transfers_tx: watch::Sender<Vec<TransferTask>>,
    throughput_tx: watch::Sender<f64>,
}

/// Network-quality-aware admission controller and transfer scheduler.
pub struct BandwidthOptimizer {
    config: BandwidthConfig,
    inner: Inner,
}

impl BandwidthOptimizer {
    pub fn new(config: BandwidthConfig, initial_quality: NetworkQuality) -> Self {
        let (quality_tx, _) = watch::channel(initial_quality);
        let (transfers_tx, _) = watch::channel(Vec::new());
        let (throughput_tx, _) = watch::channel(0.0);
        Self {
            config,
            inner: Inner {
                tasks: DashMap::new(),
                dedup: DashMap::new(),
                quality: RwLock::new(initial_quality),
                throughput_samples: RwLock::new(VecDeque::new()),
                quality_tx,
                transfers_tx,
                throughput_tx,
            },
        }
    }

    /// Subscribe to the optimizer's observable streams.
    pub fn subscribe(&self) -> Snapshots {
        Snapshots {
            quality: self.inner.quality_tx.subscribe(),
            transfers: self.inner.transfers_tx.subscribe(),
            average_throughput: self.inner.throughput_tx.subscribe(),
        }
    }

    fn current_quality(&self) -> NetworkQuality {
        *self.inner.quality.read()
    }

    fn publish_transfers(&self) {
        let snapshot: Vec<TransferTask> = self.inner.tasks.iter().map(|e| e.value().clone()).collect();
        let _ = self.inner.transfers_tx.send(snapshot);
    }

    /// Maximum concurrent active transfers under the current quality band.
    fn capacity(&self) -> usize {
        use crate::types::QualityBand;
        match self.current_quality().band() {
            QualityBand::Poor => (self.config.max_concurrent_transfers / 2).max(1),
            QualityBand::Fair | QualityBand::Good => self.config.max_concurrent_transfers,
        }
    }

    fn active_count(&self) -> usize {
        self.inner
            .tasks
            .iter()
            .filter(|e| e.value().status == TransferStatus::Active)
            .count()
    }

    fn is_eligible(&self, task: &TransferTask) -> bool {
        quality::is_eligible(
            &self.current_quality(),
            task.size,
            self.config.large_file_threshold,
            self.config.wifi_only_for_large_files,
        )
    }

    /// Insert `task` into the priority-ordered queue, deduplicating against
    /// any in-flight task with the same content hash. Returns the id of the
    /// admitted (or pre-existing, deduplicated) task. A task ineligible
    /// under the current network quality (e.g. a large file on a metered
    /// connection with `wifiOnlyForLargeFiles`) is parked `paused` instead
    /// of `queued` until a path change makes it eligible (spec §4.B S6).
    #[instrument(skip(self, task), fields(kind = ?task.kind, size = task.size))]
    pub fn enqueue(&self, mut task: TransferTask) -> Uuid {
        if let Some(existing) = self.inner.dedup.get(&task.content_hash) {
            if let Some(existing_task) = self.inner.tasks.get(existing.value()) {
                if !existing_task.status.is_terminal_transfer() {
                    return *existing.value();
                }
            }
        }

        task.status = if self.is_eligible(&task) { TransferStatus::Queued } else { TransferStatus::Paused };
        let id = task.task_id;
        self.inner.dedup.insert(task.content_hash, id);
        self.inner.tasks.insert(id, task);
        self.publish_transfers();
        self.process_queue();
        id
    }

    /// Promote the highest-priority eligible queued task to active until
    /// capacity is reached (spec §4.B's `processQueue`).
    #[instrument(skip(self))]
    pub fn process_queue(&self) {
        let capacity = self.capacity();
        loop {
            if self.active_count() >= capacity {
                break;
            }
            let mut candidates: Vec<(Priority, chrono::DateTime<chrono::Utc>, Uuid)> = self
                .inner
                .tasks
                .iter()
                .filter(|e| e.value().status == TransferStatus::Queued && self.is_eligible(e.value()))
                .map(|e| (e.value().priority, e.value().created_at, *e.key()))
                .collect();
            candidates.sort_by(|a, b| b.0.cmp(&a.0).then(a.1.cmp(&b.1)));

            match candidates.first() {
                Some((_, _, id)) => {
                    if let Some(mut task) = self.inner.tasks.get_mut(id) {
                        task.status = TransferStatus::Active;
                        task.started_at = Some(chrono::Utc::now());
                    }
                }
                None => break,
            }
        }
        self.publish_transfers();
    }

    /// Cancel a task regardless of its current state (terminal states are left alone).
    pub fn cancel(&self, id: Uuid) -> BandwidthResult<()> {
        let mut task = self.inner.tasks.get_mut(&id).ok_or(BandwidthError::NotFound(id))?;
        if !task.status.is_terminal_transfer() {
            task.status = TransferStatus::Cancelled;
        }
        drop(task);
        self.publish_transfers();
        Ok(())
    }

    /// Pause an admitted or queued task.
    pub fn pause(&self, id: Uuid) -> BandwidthResult<()> {
        let mut task = self.inner.tasks.get_mut(&id).ok_or(BandwidthError::NotFound(id))?;
        if matches!(task.status, TransferStatus::Active | TransferStatus::Queued) {
            task.status = TransferStatus::Paused;
        }
        drop(task);
        self.publish_transfers();
        self.process_queue();
        Ok(())
    }

    /// Resume a paused task back onto the queue.
    pub fn resume(&self, id: Uuid) -> BandwidthResult<()> {
        let mut task = self.inner.tasks.get_mut(&id).ok_or(BandwidthError::NotFound(id))?;
        if task.status == TransferStatus::Paused {
            task.status = TransferStatus::Queued;
        }
        drop(task);
        self.publish_transfers();
        self.process_queue();
        Ok(())
    }

    /// Record progress reported by the I/O executor.
    pub fn update_progress(&self, id: Uuid, bytes_so_far: u64) -> BandwidthResult<()> {
        let mut task = self.inner.tasks.get_mut(&id).ok_or(BandwidthError::NotFound(id))?;
        task.transferred_bytes = bytes_so_far;
        let throughput = task.throughput(chrono::Utc::now());
        drop(task);
        if let Some(sample) = throughput {
            self.record_throughput_sample(sample);
        }
        self.publish_transfers();
        Ok(())
    }

    /// Mark a task complete, freeing its admission slot.
    pub fn complete(&self, id: Uuid) -> BandwidthResult<()> {
        let mut task = self.inner.tasks.get_mut(&id).ok_or(BandwidthError::NotFound(id))?;
        task.status = TransferStatus::Completed;
        task.completed_at = Some(chrono::Utc::now());
        task.transferred_bytes = task.size;
        drop(task);
        self.publish_transfers();
        self.process_queue();
        Ok(())
    }

    /// Mark a task failed, freeing its admission slot.
    pub fn fail(&self, id: Uuid, err: impl Into<String>) -> BandwidthResult<()> {
        let mut task = self.inner.tasks.get_mut(&id).ok_or(BandwidthError::NotFound(id))?;
        task.status = TransferStatus::Failed;
        task.last_error = Some(err.into());
        drop(task);
        self.publish_transfers();
        self.process_queue();
        Ok(())
    }

    fn record_throughput_sample(&self, sample: f64) {
        let mut samples = self.inner.throughput_samples.write();
        samples.push_back(sample);
        while samples.len() > self.config.throughput_window {
            samples.pop_front();
        }
        let mean = samples.iter().sum::<f64>() / samples.len() as f64;
        drop(samples);
        let _ = self.inner.throughput_tx.send(mean);
    }

    /// `optimalChunkSize` for the current network quality.
    pub fn optimal_chunk_size(&self) -> usize {
        quality::optimal_chunk_size(self.config.base_chunk_size, self.current_quality().signal_strength)
    }

    /// `recommendedBatchSize` for the current network quality.
    pub fn recommended_batch_size(&self) -> usize {
        quality::recommended_batch_size(self.config.base_chunk_size, self.current_quality().signal_strength)
    }

    /// Whether a sync at `priority` should be deferred under current quality.
    pub fn should_defer_sync(&self, priority: Priority) -> bool {
        quality::should_defer_sync(&self.current_quality(), priority, self.config.user_initiated_priority)
    }

    /// Recompute quality from a path-change event, publish it, and
    /// re-admit/demote tasks as needed (spec §4.B's "On path change").
    #[instrument(skip(self))]
    pub fn on_path_change(&self, event: PathEvent) {
        {
            let mut quality = self.inner.quality.write();
            quality.connection_type = event.connection_type;
            quality.is_expensive = event.is_expensive;
            quality.is_constrained = event.is_constrained;
        }
        let quality = self.current_quality();
        let _ = self.inner.quality_tx.send(quality);

        let newly_eligible: Vec<Uuid> = self
            .inner
            .tasks
            .iter()
            .filter(|e| e.value().status == TransferStatus::Paused && self.is_eligible(e.value()))
            .map(|e| *e.key())
            .collect();
        for id in &newly_eligible {
            if let Some(mut task) = self.inner.tasks.get_mut(id) {
                task.status = TransferStatus::Queued;
            }
        }

        let active_ids: Vec<Uuid> = self
            .inner
            .tasks
            .iter()
            .filter(|e| e.value().status == TransferStatus::Active)
            .map(|e| *e.key())
            .collect();

        for id in &active_ids {
            if let Some(task) = self.inner.tasks.get(id) {
                if !self.is_eligible(&task) {
                    drop(task);
                    if let Some(mut task) = self.inner.tasks.get_mut(id) {
                        task.status = TransferStatus::Paused;
                        warn!(task_id = %id, "paused active transfer: no longer eligible after path change");
                    }
                }
            }
        }

        let capacity = self.capacity();
        loop {
            if self.active_count() <= capacity {
                break;
            }
            let mut active: Vec<(Priority, Uuid)> = self
                .inner
                .tasks
                .iter()
                .filter(|e| e.value().status == TransferStatus::Active)
                .map(|e| (e.value().priority, *e.key()))
                .collect();
            active.sort_by_key(|(priority, _)| *priority);
            match active.first() {
                Some((_, id)) => {
                    if let Some(mut task) = self.inner.tasks.get_mut(id) {
                        task.status = TransferStatus::Paused;
                    }
                }
                None => break,
            }
        }

        self.publish_transfers();
        self.process_queue();
    }
}

impl TransferStatus {
    fn is_terminal_transfer(self) -> bool {
        matches!(self, TransferStatus::Completed | TransferStatus::Failed | TransferStatus::Cancelled)
    }
}
