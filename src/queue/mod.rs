//! Retry Queue (spec §4.C).
//!
//! Durable, priority-ordered, exponential-backoff execution of operations
//! with at-least-once semantics, persisted across process restarts.
//! Grounded in `enterprise::cloud::sync::SyncEngine`'s single-driver-task
//! executor loop and checkpoint persistence, narrowed to the in-process,
//! single-entity-type-agnostic scope spec §4.C defines.

pub mod backoff;
pub mod persistence;

use std::path::PathBuf;
use std::sync::atomic::Ordering;
use std::sync::Arc;

use chrono::Utc;
use tokio::sync::{watch, Mutex, Notify};
use tokio::task::JoinHandle;
use tracing::{error, info, instrument, warn};
use uuid::Uuid;

use crate::config::RetryQueueConfig;
use crate::error::QueueResult;
use crate::interfaces::RemoteExecutor;
use crate::types::{Operation, OperationStatus};

/// Queue-wide status snapshot, published alongside the operation list.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct QueueStatus {
    pub processing: bool,
    pub pending_count: usize,
    pub in_progress_count: usize,
}

/// Observable snapshots published by the queue after every state change.
#[derive(Debug, Clone)]
pub struct Snapshots {
    pub operations: watch::Receiver<Vec<Operation>>,
    pub status: watch::Receiver<QueueStatus>,
}

/// Shared state, owned behind one `Arc` so the background executor loop can
/// outlive the [`RetryQueue`] handle that spawned it and so `enqueue` (which
/// only ever sees `&self`) can still restart the loop without needing an
/// `Arc<RetryQueue>` receiver.
struct State {
    config: RetryQueueConfig,
    persistence_path: PathBuf,
    ops: Mutex<Vec<Operation>>,
    executor: Arc<dyn RemoteExecutor>,
    ops_tx: watch::Sender<Vec<Operation>>,
    status_tx: watch::Sender<QueueStatus>,
    wake: Notify,
    running: std::sync::atomic::AtomicBool,
    driver: Mutex<Option<JoinHandle<()>>>,
}

impl State {
    async fn publish(&self, ops: &[Operation]) {
        let _ = self.ops_tx.send(ops.to_vec());
        let processing = self.running.load(Ordering::SeqCst);
        let _ = self.status_tx.send(status_of(ops, processing));
    }

    async fn persist(&self, ops: &[Operation]) {
        if let Err(e) = persistence::save(&self.persistence_path, ops).await {
            warn!(error = %e, "retry queue persistence failed; continuing with in-memory state");
        }
    }

    /// Spawn the executor loop if it isn't already running. Safe to call
    /// repeatedly: a second call while one is already in flight is a no-op.
    async fn ensure_running(self: &Arc<Self>) {
        let mut driver = self.driver.lock().await;
        if driver.is_some() {
            return;
        }
        self.running.store(true, Ordering::SeqCst);
        let this = Arc::clone(self);
        *driver = Some(tokio::spawn(async move { this.run_executor_loop().await }));
    }

    async fn run_executor_loop(self: Arc<Self>) {
        loop {
            if !self.running.load(Ordering::SeqCst) {
                return;
            }

            let now = Utc::now();
            let next = {
                let mut ops = self.ops.lock().await;
                let selected = ops
                    .iter()
                    .enumerate()
                    .filter(|(_, o)| o.is_eligible(now))
                    .min_by_key(|(_, o)| o.sort_key())
                    .map(|(i, _)| i);

                match selected {
                    Some(idx) => {
                        ops[idx].status = OperationStatus::InProgress;
                        ops[idx].last_attempt = Some(now);
                        let op = ops[idx].clone();
                        self.persist(&ops).await;
                        self.publish(&ops).await;
                        Selected::Op(op)
                    }
                    None => {
                        let min_next_retry = ops
                            .iter()
                            .filter(|o| matches!(o.status, OperationStatus::Pending | OperationStatus::Retrying))
                            .filter_map(|o| o.next_retry)
                            .min();
                        match min_next_retry {
                            Some(t) => Selected::WaitUntil(t),
                            None => Selected::Idle,
                        }
                    }
                }
            };

            match next {
                Selected::Op(op) => self.execute_one(op).await,
                Selected::WaitUntil(t) => {
                    let now = Utc::now();
                    let wait = (t - now).to_std().unwrap_or(std::time::Duration::ZERO);
                    tokio::select! {
                        _ = tokio::time::sleep(wait) => {}
                        _ = self.wake.notified() => {}
                    }
                }
                Selected::Idle => {
                    info!("retry queue drained; executor loop exiting");
                    self.running.store(false, Ordering::SeqCst);
                    // Clear the handle so a later enqueue (or an explicit
                    // start_processing) can spawn a fresh loop instead of
                    // finding a stale, already-finished driver in place.
                    *self.driver.lock().await = None;
                    return;
                }
            }
        }
    }

    async fn execute_one(&self, op: Operation) {
        let result = self.executor.execute(&op).await;
        let mut ops = self.ops.lock().await;
        let Some(slot) = ops.iter_mut().find(|o| o.op_id == op.op_id) else {
            return;
        };

        match result {
            Ok(()) => {
                slot.status = OperationStatus::Completed;
            }
            Err(e) => {
                let retryable = e.is_retryable(&self.config.retryable_statuses);
                if retryable && slot.retry_count + 1 < self.config.max_retries {
                    slot.retry_count += 1;
                    let delay = backoff::compute_delay_secs(&self.config, slot.retry_count);
                    slot.status = OperationStatus::Retrying;
                    slot.next_retry = Some(Utc::now() + chrono::Duration::milliseconds((delay * 1000.0) as i64));
                    slot.last_error = Some(e.to_string());
                } else {
                    slot.status = OperationStatus::Failed;
                    slot.last_error = Some(e.to_string());
                }
                error!(op_id = %op.op_id, error = %slot.last_error.as_deref().unwrap_or(""), "operation execution failed");
            }
        }

        self.persist(&ops).await;
        self.publish(&ops).await;
    }
}

/// Durable, priority-ordered retry queue.
pub struct RetryQueue {
    state: Arc<State>,
}

impl RetryQueue {
    /// Open a queue rooted at `persistence_path`, recovering any
    /// previously-persisted operations. `inProgress` operations from a
    /// prior run are demoted to `retrying` with `nextRetry = now` (spec
    /// §4.C's restart recovery rule).
    #[instrument(skip(config, executor))]
    pub async fn open(config: RetryQueueConfig, persistence_path: PathBuf, executor: Arc<dyn RemoteExecutor>) -> QueueResult<Self> {
        let mut ops = persistence::load(&persistence_path).await;
        let now = Utc::now();
        for op in ops.iter_mut() {
            if op.status == OperationStatus::InProgress {
                op.status = OperationStatus::Retrying;
                op.next_retry = Some(now);
            }
        }
        sort_ops(&mut ops);
        persistence::save(&persistence_path, &ops).await?;

        let (ops_tx, _) = watch::channel(ops.clone());
        let (status_tx, _) = watch::channel(status_of(&ops, false));

        Ok(Self {
            state: Arc::new(State {
                config,
                persistence_path,
                ops: Mutex::new(ops),
                executor,
                ops_tx,
                status_tx,
                wake: Notify::new(),
                running: std::sync::atomic::AtomicBool::new(false),
                driver: Mutex::new(None),
            }),
        })
    }

    /// Subscribe to the queue's observable streams.
    pub fn subscribe(&self) -> Snapshots {
        Snapshots {
            operations: self.state.ops_tx.subscribe(),
            status: self.state.status_tx.subscribe(),
        }
    }

    /// Enqueue a single operation. Returns its id. Persistence failures are
    /// logged, never surfaced — the in-memory queue remains authoritative
    /// for this process's lifetime (spec §4.C failure semantics). Restarts
    /// the executor loop if it had previously drained, so work queued while
    /// the network stays continuously reachable is never stranded.
    #[instrument(skip(self, op), fields(op_id = %op.op_id))]
    pub async fn enqueue(&self, op: Operation) -> Uuid {
        let id = op.op_id;
        let mut ops = self.state.ops.lock().await;
        ops.push(op);
        sort_ops(&mut ops);
        self.state.persist(&ops).await;
        self.state.publish(&ops).await;
        drop(ops);
        self.state.wake.notify_one();
        self.state.ensure_running().await;
        id
    }

    /// Enqueue several operations as one batch, one persistence write.
    pub async fn enqueue_batch(&self, batch: Vec<Operation>) -> Vec<Uuid> {
        let ids = batch.iter().map(|o| o.op_id).collect();
        let mut ops = self.state.ops.lock().await;
        ops.extend(batch);
        sort_ops(&mut ops);
        self.state.persist(&ops).await;
        self.state.publish(&ops).await;
        drop(ops);
        self.state.wake.notify_one();
        self.state.ensure_running().await;
        ids
    }

    /// Mark an operation cancelled, unless it is already in a terminal state.
    pub async fn cancel(&self, id: Uuid) -> QueueResult<()> {
        let mut ops = self.state.ops.lock().await;
        let op = ops.iter_mut().find(|o| o.op_id == id).ok_or(crate::error::QueueError::NotFound(id))?;
        if !op.status.is_terminal() {
            op.status = OperationStatus::Cancelled;
        }
        self.state.persist(&ops).await;
        self.state.publish(&ops).await;
        Ok(())
    }

    /// Cancel every non-terminal operation.
    pub async fn cancel_all(&self) {
        let mut ops = self.state.ops.lock().await;
        for op in ops.iter_mut() {
            if !op.status.is_terminal() {
                op.status = OperationStatus::Cancelled;
            }
        }
        self.state.persist(&ops).await;
        self.state.publish(&ops).await;
    }

    /// Remove operations in a terminal state from the in-memory/persisted set.
    pub async fn cleanup(&self) {
        let mut ops = self.state.ops.lock().await;
        ops.retain(|o| !o.status.is_terminal());
        self.state.persist(&ops).await;
        self.state.publish(&ops).await;
    }

    /// Reset every `failed` operation back to `retrying`, eligible immediately.
    pub async fn retry_failed(&self) {
        let mut ops = self.state.ops.lock().await;
        let now = Utc::now();
        for op in ops.iter_mut() {
            if op.status == OperationStatus::Failed {
                op.retry_count = 0;
                op.status = OperationStatus::Retrying;
                op.next_retry = Some(now);
                op.last_error = None;
            }
        }
        sort_ops(&mut ops);
        self.state.persist(&ops).await;
        self.state.publish(&ops).await;
        drop(ops);
        self.state.wake.notify_one();
        self.state.ensure_running().await;
    }

    /// Start the background executor loop, if not already running.
    pub async fn start_processing(&self) {
        self.state.ensure_running().await;
    }

    /// Stop the background executor loop. Queued operations are left
    /// untouched (spec §4.E: stopping processing never cancels work).
    pub async fn stop_processing(&self) {
        self.state.running.store(false, Ordering::SeqCst);
        self.state.wake.notify_one();
        let mut driver = self.state.driver.lock().await;
        if let Some(handle) = driver.take() {
            let _ = handle.await;
        }
        drop(driver);
        let ops = self.state.ops.lock().await;
        self.state.publish(&ops).await;
    }
}

enum Selected {
    Op(Operation),
    WaitUntil(chrono::DateTime<Utc>),
    Idle,
}

fn sort_ops(ops: &mut [Operation]) {
    ops.sort_by_key(|o| o.sort_key());
}

fn status_of(ops: &[Operation], processing: bool) -> QueueStatus {
    QueueStatus {
        processing,
        pending_count: ops.iter().filter(|o| matches!(o.status, OperationStatus::Pending | OperationStatus::Retrying)).count(),
        in_progress_count: ops.iter().filter(|o| o.status == OperationStatus::InProgress).count(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::RemoteError;
    use crate::types::{OperationKind, Priority};
    use async_trait::async_trait;

    struct AlwaysSucceeds;
    #[async_trait]
    impl RemoteExecutor for AlwaysSucceeds {
        async fn execute(&self, _op: &Operation) -> Result<(), RemoteError> {
            Ok(())
        }
    }

    struct AlwaysFailsTerminal;
    #[async_trait]
    impl RemoteExecutor for AlwaysFailsTerminal {
        async fn execute(&self, _op: &Operation) -> Result<(), RemoteError> {
            Err(RemoteError::BadRequest("nope".into()))
        }
    }

    struct OrderRecorder {
        order: std::sync::Mutex<Vec<String>>,
    }
    #[async_trait]
    impl RemoteExecutor for OrderRecorder {
        async fn execute(&self, op: &Operation) -> Result<(), RemoteError> {
            self.order.lock().unwrap().push(op.entity_id.clone());
            Ok(())
        }
    }

    async fn open_queue(config: RetryQueueConfig, executor: Arc<dyn RemoteExecutor>) -> (Arc<RetryQueue>, PathBuf, tempfile::TempDir) {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("RetryQueue.json");
        let queue = RetryQueue::open(config, path.clone(), executor).await.unwrap();
        (Arc::new(queue), path, dir)
    }

    #[tokio::test]
    async fn enqueue_persists_and_publishes() {
        let (queue, path, _dir) = open_queue(RetryQueueConfig::default(), Arc::new(AlwaysSucceeds)).await;
        let op = Operation::new(OperationKind::Update, "e1", "User", vec![], Priority::Normal);
        queue.enqueue(op).await;
        let persisted = persistence::load(&path).await;
        assert_eq!(persisted.len(), 1);
        queue.stop_processing().await;
    }

    #[tokio::test]
    async fn executor_completes_successful_operation_and_exits_when_drained() {
        let (queue, _path, _dir) = open_queue(RetryQueueConfig::default(), Arc::new(AlwaysSucceeds)).await;
        let op = Operation::new(OperationKind::Update, "e1", "User", vec![], Priority::Normal);
        queue.enqueue(op).await;

        queue.start_processing().await;
        tokio::time::sleep(std::time::Duration::from_millis(100)).await;
        queue.stop_processing().await;

        let snapshot = queue.subscribe().operations.borrow().clone();
        assert_eq!(snapshot[0].status, OperationStatus::Completed);
    }

    #[tokio::test]
    async fn terminal_failure_marks_operation_failed_without_retry() {
        let (queue, _path, _dir) = open_queue(RetryQueueConfig::default(), Arc::new(AlwaysFailsTerminal)).await;
        let op = Operation::new(OperationKind::Update, "e1", "User", vec![], Priority::Normal);
        queue.enqueue(op).await;

        queue.start_processing().await;
        tokio::time::sleep(std::time::Duration::from_millis(100)).await;
        queue.stop_processing().await;

        let snapshot = queue.subscribe().operations.borrow().clone();
        assert_eq!(snapshot[0].status, OperationStatus::Failed);
        assert_eq!(snapshot[0].retry_count, 0);
    }

    #[tokio::test]
    async fn priority_orders_execution() {
        let recorder = Arc::new(OrderRecorder { order: std::sync::Mutex::new(Vec::new()) });
        let (queue, _path, _dir) = open_queue(RetryQueueConfig::default(), recorder.clone()).await;

        let low = Operation::new(OperationKind::Update, "low", "User", vec![], Priority::Low);
        let critical = Operation::new(OperationKind::Update, "critical", "User", vec![], Priority::Critical);
        queue.enqueue(low).await;
        queue.enqueue(critical).await;

        queue.start_processing().await;
        tokio::time::sleep(std::time::Duration::from_millis(150)).await;
        queue.stop_processing().await;

        let order = recorder.order.lock().unwrap().clone();
        assert_eq!(order, vec!["critical", "low"]);
    }

    #[tokio::test]
    async fn cancel_marks_non_terminal_operation_cancelled() {
        let (queue, _path, _dir) = open_queue(RetryQueueConfig::default(), Arc::new(AlwaysSucceeds)).await;
        let op = Operation::new(OperationKind::Update, "e1", "User", vec![], Priority::Normal);
        let id = op.op_id;
        queue.enqueue(op).await;
        queue.cancel(id).await.unwrap();
        let snapshot = queue.subscribe().operations.borrow().clone();
        assert_eq!(snapshot[0].status, OperationStatus::Cancelled);
        queue.stop_processing().await;
    }

    #[tokio::test]
    async fn retry_failed_resets_failed_operations() {
        let (queue, _path, _dir) = open_queue(RetryQueueConfig::default(), Arc::new(AlwaysFailsTerminal)).await;
        let op = Operation::new(OperationKind::Update, "e1", "User", vec![], Priority::Normal);
        queue.enqueue(op).await;
        queue.start_processing().await;
        tokio::time::sleep(std::time::Duration::from_millis(100)).await;
        queue.stop_processing().await;

        queue.retry_failed().await;
        let snapshot = queue.subscribe().operations.borrow().clone();
        assert_eq!(snapshot[0].status, OperationStatus::Retrying);
        assert_eq!(snapshot[0].retry_count, 0);
        queue.stop_processing().await;
    }

    #[tokio::test]
    async fn restart_recovery_demotes_in_progress_to_retrying() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("RetryQueue.json");
        let mut op = Operation::new(OperationKind::Update, "e1", "User", vec![], Priority::Normal);
        op.status = OperationStatus::InProgress;
        persistence::save(&path, &[op]).await.unwrap();

        let queue = RetryQueue::open(RetryQueueConfig::default(), path, Arc::new(AlwaysSucceeds)).await.unwrap();
        let snapshot = queue.subscribe().operations.borrow().clone();
        assert_eq!(snapshot[0].status, OperationStatus::Retrying);
        assert!(snapshot[0].next_retry.is_some());
    }

    #[tokio::test]
    async fn cleanup_removes_terminal_operations() {
        let (queue, _path, _dir) = open_queue(RetryQueueConfig::default(), Arc::new(AlwaysSucceeds)).await;
        let op = Operation::new(OperationKind::Update, "e1", "User", vec![], Priority::Normal);
        let id = op.op_id;
        queue.enqueue(op).await;
        queue.cancel(id).await.unwrap();
        queue.cleanup().await;
        let snapshot = queue.subscribe().operations.borrow().clone();
        assert!(snapshot.is_empty());
        queue.stop_processing().await;
    }

    #[tokio::test]
    async fn enqueue_after_natural_drain_restarts_the_executor_loop() {
        let (queue, _path, _dir) = open_queue(RetryQueueConfig::default(), Arc::new(AlwaysSucceeds)).await;

        queue.start_processing().await;
        let first = Operation::new(OperationKind::Update, "e1", "User", vec![], Priority::Normal);
        queue.enqueue(first).await;
        // Give the loop time to drain and exit, clearing its driver handle.
        tokio::time::sleep(std::time::Duration::from_millis(100)).await;
        assert!(!queue.subscribe().status.borrow().processing);

        // Network stays reachable the whole time: nothing calls
        // start_processing again. The second operation must still run.
        let second = Operation::new(OperationKind::Update, "e2", "User", vec![], Priority::Normal);
        queue.enqueue(second).await;
        tokio::time::sleep(std::time::Duration::from_millis(100)).await;

        let snapshot = queue.subscribe().operations.borrow().clone();
        assert!(snapshot.iter().all(|o| o.status == OperationStatus::Completed));
        queue.stop_processing().await;
    }
}
