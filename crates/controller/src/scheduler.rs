//! Per-record worker scheduling.
//!
//! Each live record gets one worker task, so at most one cycle per record is
//! ever in flight. Workers share a semaphore bounding concurrent cycles across
//! all records. The controller follows [`StoreEvent`]s: new records get a
//! worker, spec changes wake the existing one, deletions cancel it.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use polling::{ReconcileError, Reconciler, RecordKey, RecordStore, RetryPolicy};
use tokio::sync::broadcast::error::RecvError;
use tokio::sync::{Notify, Semaphore};
use tokio::task::JoinSet;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, instrument, warn};

use crate::{ControllerConfig, MemoryStore, StoreEvent};

/// What a worker waits for before its next cycle.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Wait {
    For(Duration),
    UntilChanged,
}

/// Why a worker stopped.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Exit {
    Absent,
    Cancelled,
}

struct WorkerHandle {
    id: u64,
    wake: Arc<Notify>,
    cancel: CancellationToken,
}

/// Drives every record in a [`MemoryStore`] through the [`Reconciler`].
pub struct Controller {
    store: Arc<MemoryStore>,
    reconciler: Reconciler,
    config: ControllerConfig,
}

impl Controller {
    /// Cycles running past `config.reconcile_timeout` are abandoned and
    /// recorded as failures.
    pub fn new(store: Arc<MemoryStore>, reconciler: Reconciler, config: ControllerConfig) -> Self {
        let reconciler = reconciler.with_deadline(config.reconcile_timeout);
        Self { store, reconciler, config }
    }

    /// Runs until `cancel` fires, then cancels every worker and waits for them.
    pub async fn run(self, cancel: CancellationToken) {
        let mut events = self.store.subscribe();
        let permits = Arc::new(Semaphore::new(self.config.max_concurrent_reconciles.max(1)));
        let mut pool = WorkerPool {
            reconciler: self.reconciler.clone(),
            config: self.config.clone(),
            permits,
            parent: cancel.clone(),
            workers: HashMap::new(),
            tasks: JoinSet::new(),
            next_id: 0,
        };

        for key in self.store.keys().await {
            pool.spawn(key);
        }
        info!(records = pool.workers.len(), "controller started");

        loop {
            tokio::select! {
                _ = cancel.cancelled() => break,
                event = events.recv() => match event {
                    Ok(StoreEvent::Applied { key, generation }) => {
                        debug!(%key, %generation, "desired state applied");
                        pool.wake_or_spawn(key);
                    }
                    Ok(StoreEvent::Deleted { key }) => pool.stop(&key),
                    Err(RecvError::Lagged(missed)) => {
                        warn!(missed, "missed store events, resynchronising workers");
                        pool.resync(self.store.keys().await);
                    }
                    Err(RecvError::Closed) => break,
                },
                Some(joined) = pool.tasks.join_next() => match joined {
                    Ok((key, id, exit)) => {
                        pool.finished(&key, id);
                        // A record re-created before the worker noticed the deletion.
                        if exit == Exit::Absent && matches!(self.store.get(&key).await, Ok(Some(_))) {
                            pool.wake_or_spawn(key);
                        }
                    }
                    Err(err) => error!(error = %err, "worker task failed"),
                },
            }
        }

        info!("controller stopping");
        pool.shutdown().await;
    }
}

struct WorkerPool {
    reconciler: Reconciler,
    config: ControllerConfig,
    permits: Arc<Semaphore>,
    parent: CancellationToken,
    workers: HashMap<RecordKey, WorkerHandle>,
    tasks: JoinSet<(RecordKey, u64, Exit)>,
    next_id: u64,
}

impl WorkerPool {
    fn spawn(&mut self, key: RecordKey) {
        self.next_id += 1;
        let handle = WorkerHandle {
            id: self.next_id,
            wake: Arc::new(Notify::new()),
            cancel: self.parent.child_token(),
        };
        let worker = Worker {
            key: key.clone(),
            reconciler: self.reconciler.clone(),
            permits: Arc::clone(&self.permits),
            wake: Arc::clone(&handle.wake),
            cancel: handle.cancel.clone(),
            config: self.config.clone(),
        };
        let id = handle.id;
        self.tasks.spawn(async move {
            let exit = worker.run().await;
            (worker.key, id, exit)
        });
        self.workers.insert(key, handle);
    }

    fn wake_or_spawn(&mut self, key: RecordKey) {
        match self.workers.get(&key) {
            Some(handle) => handle.wake.notify_one(),
            None => self.spawn(key),
        }
    }

    fn stop(&mut self, key: &RecordKey) {
        if let Some(handle) = self.workers.remove(key) {
            debug!(%key, "stopping worker");
            handle.cancel.cancel();
        }
    }

    fn finished(&mut self, key: &RecordKey, id: u64) {
        if self.workers.get(key).is_some_and(|handle| handle.id == id) {
            self.workers.remove(key);
        }
    }

    fn resync(&mut self, live: Vec<RecordKey>) {
        let stale: Vec<RecordKey> = self.workers.keys().filter(|k| !live.contains(k)).cloned().collect();
        for key in &stale {
            self.stop(key);
        }
        for key in live {
            self.wake_or_spawn(key);
        }
    }

    async fn shutdown(mut self) {
        for handle in self.workers.values() {
            handle.cancel.cancel();
        }
        while let Some(joined) = self.tasks.join_next().await {
            if let Err(err) = joined {
                error!(error = %err, "worker task failed");
            }
        }
    }
}

struct Worker {
    key: RecordKey,
    reconciler: Reconciler,
    permits: Arc<Semaphore>,
    wake: Arc<Notify>,
    cancel: CancellationToken,
    config: ControllerConfig,
}

impl Worker {
    #[instrument(skip_all, fields(namespace = %self.key.namespace, name = %self.key.name))]
    async fn run(&self) -> Exit {
        loop {
            let wait = tokio::select! {
                _ = self.cancel.cancelled() => return Exit::Cancelled,
                next = self.cycle() => match next {
                    Some(wait) => wait,
                    None => return Exit::Absent,
                },
            };

            match wait {
                Wait::For(delay) => {
                    debug!(?delay, "waiting for next cycle");
                    tokio::select! {
                        _ = self.cancel.cancelled() => return Exit::Cancelled,
                        _ = tokio::time::sleep(delay) => {}
                        _ = self.wake.notified() => debug!("woken by spec change"),
                    }
                }
                Wait::UntilChanged => {
                    info!("configuration error, waiting for a spec change");
                    tokio::select! {
                        _ = self.cancel.cancelled() => return Exit::Cancelled,
                        _ = self.wake.notified() => debug!("woken by spec change"),
                    }
                }
            }
        }
    }

    /// One bounded cycle. `None` means the record is gone.
    async fn cycle(&self) -> Option<Wait> {
        let Ok(_permit) = Arc::clone(&self.permits).acquire_owned().await else {
            return None;
        };

        match self.reconciler.reconcile(&self.key, &self.cancel).await {
            Ok(outcome) => outcome.requeue_after().map(Wait::For),
            Err(ReconcileError::Cancelled) => Some(Wait::UntilChanged),
            Err(err) => Some(match err.retry_policy() {
                RetryPolicy::Retryable { after } => Wait::For(after.unwrap_or(self.config.error_backoff)),
                RetryPolicy::NonRetryable => Wait::UntilChanged,
            }),
        }
    }
}

#[cfg(test)]
#[path = "scheduler_tests.rs"]
mod tests;
