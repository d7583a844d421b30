//! Worker Pool
//!
//! Bounded set of tokio tasks running [`Worker`]s. At most one worker per
//! task id is active; concurrency is capped by a semaphore; the whole pool
//! shares one cancellation token.

use std::any::Any;
use std::panic::AssertUnwindSafe;
use std::sync::Arc;

use dashmap::mapref::entry::Entry;
use dashmap::DashMap;
use futures::FutureExt;
use tokio::sync::Semaphore;
use tokio::task::{AbortHandle, JoinError, JoinHandle};
use tokio_util::sync::CancellationToken;

use super::Worker;
use crate::entities::TaskId;
use crate::error::{GenerateError, PoolError};
use crate::queue::{PublishFrom, QueueManager, StopReason};

struct ActiveWorker {
    queue: QueueManager,
    abort: AbortHandle,
}

struct PoolInner {
    semaphore: Arc<Semaphore>,
    active: DashMap<TaskId, ActiveWorker>,
    shutdown: CancellationToken,
    max_workers: usize,
}

/// Removes the active entry when the supervising task ends or is aborted
struct Registration {
    inner: Arc<PoolInner>,
    task_id: TaskId,
}

impl Drop for Registration {
    fn drop(&mut self) {
        self.inner.active.remove(&self.task_id);
    }
}

/// Handle to a submitted worker
#[derive(Debug)]
pub struct WorkerHandle {
    task_id: TaskId,
    handle: JoinHandle<()>,
}

impl WorkerHandle {
    /// Task the worker generates
    #[must_use]
    pub fn task_id(&self) -> &TaskId {
        &self.task_id
    }

    /// Wait for the worker to finish
    ///
    /// # Errors
    ///
    /// Returns the join error if the supervising task was aborted.
    pub async fn join(self) -> Result<(), JoinError> {
        self.handle.await
    }

    /// Abort the worker; its resources are released as it unwinds
    pub fn abort(&self) {
        self.handle.abort();
    }

    /// Whether the worker has finished
    #[must_use]
    pub fn is_finished(&self) -> bool {
        self.handle.is_finished()
    }
}

/// Bounded, cancellable pool of generation workers
#[derive(Clone)]
pub struct WorkerPool {
    inner: Arc<PoolInner>,
}

impl std::fmt::Debug for WorkerPool {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("WorkerPool")
            .field("max_workers", &self.inner.max_workers)
            .field("active", &self.inner.active.len())
            .field("shutdown", &self.inner.shutdown.is_cancelled())
            .finish()
    }
}

impl WorkerPool {
    /// Create a pool running at most `max_workers` workers at once
    #[must_use]
    pub fn new(max_workers: usize) -> Self {
        let max_workers = max_workers.max(1);
        Self {
            inner: Arc::new(PoolInner {
                semaphore: Arc::new(Semaphore::new(max_workers)),
                active: DashMap::new(),
                shutdown: CancellationToken::new(),
                max_workers,
            }),
        }
    }

    /// Spawn `worker`
    ///
    /// The worker waits for a permit inside its own task, so this never
    /// blocks the caller.
    ///
    /// # Errors
    ///
    /// Returns [`PoolError::DuplicateTask`] if a worker for the same task is
    /// active and [`PoolError::ShuttingDown`] after [`WorkerPool::shutdown`].
    pub fn submit(&self, worker: Worker) -> Result<WorkerHandle, PoolError> {
        if self.inner.shutdown.is_cancelled() {
            return Err(PoolError::ShuttingDown);
        }

        let task_id = worker.task_id().clone();
        let queue = worker.queue().clone();

        let slot = match self.inner.active.entry(task_id.clone()) {
            Entry::Occupied(_) => return Err(PoolError::DuplicateTask(task_id)),
            Entry::Vacant(slot) => slot,
        };

        let handle = tokio::spawn(supervise(Arc::clone(&self.inner), worker));
        slot.insert(ActiveWorker {
            queue,
            abort: handle.abort_handle(),
        });

        tracing::debug!(task_id = %task_id, "Worker submitted");
        Ok(WorkerHandle { task_id, handle })
    }

    /// Ask a worker to stop cooperatively
    ///
    /// Returns `false` if no worker for `task_id` is active.
    pub fn cancel(&self, task_id: &TaskId) -> bool {
        let Some(active) = self.inner.active.get(task_id) else {
            return false;
        };
        active.queue.stop(PublishFrom::Pipeline, StopReason::UserManual);
        true
    }

    /// Stop accepting work and tear down every active worker
    pub fn shutdown(&self) {
        if self.inner.shutdown.is_cancelled() {
            return;
        }
        tracing::info!(active = self.inner.active.len(), "Worker pool shutting down");
        self.inner.shutdown.cancel();

        let active: Vec<(QueueManager, AbortHandle)> = self
            .inner
            .active
            .iter()
            .map(|entry| (entry.queue.clone(), entry.abort.clone()))
            .collect();
        for (queue, abort) in active {
            queue.stop(PublishFrom::Pipeline, StopReason::Shutdown);
            abort.abort();
        }
    }

    /// Whether a worker for `task_id` is active
    #[must_use]
    pub fn is_active(&self, task_id: &TaskId) -> bool {
        self.inner.active.contains_key(task_id)
    }

    /// Number of active (running or waiting) workers
    #[must_use]
    pub fn active_count(&self) -> usize {
        self.inner.active.len()
    }

    /// Concurrency limit
    #[must_use]
    pub fn max_workers(&self) -> usize {
        self.inner.max_workers
    }

    /// Whether [`WorkerPool::shutdown`] was called
    #[must_use]
    pub fn is_shutdown(&self) -> bool {
        self.inner.shutdown.is_cancelled()
    }
}

async fn supervise(inner: Arc<PoolInner>, worker: Worker) {
    let task_id = worker.task_id().clone();
    let queue = worker.queue().clone();
    let _registration = Registration {
        inner: Arc::clone(&inner),
        task_id: task_id.clone(),
    };

    let permit = tokio::select! {
        permit = Arc::clone(&inner.semaphore).acquire_owned() => permit,
        () = inner.shutdown.cancelled() => {
            queue.stop(PublishFrom::Pipeline, StopReason::Shutdown);
            return;
        }
    };
    let Ok(_permit) = permit else {
        return;
    };

    let outcome = tokio::select! {
        outcome = AssertUnwindSafe(worker.run()).catch_unwind() => outcome,
        () = inner.shutdown.cancelled() => {
            queue.stop(PublishFrom::Pipeline, StopReason::Shutdown);
            return;
        }
    };

    if let Err(panic) = outcome {
        let message = panic_message(panic.as_ref());
        tracing::error!(task_id = %task_id, panic = %message, "Worker panicked");
        if queue.is_stopped() {
            return;
        }
        let error = GenerateError::Unknown(format!("worker panicked: {message}"));
        if let Err(e) = queue.publish_error(error, PublishFrom::Worker) {
            tracing::debug!(task_id = %task_id, error = %e, "Panic error not published");
        }
    }
}

fn panic_message(panic: &(dyn Any + Send)) -> String {
    if let Some(message) = panic.downcast_ref::<&str>() {
        (*message).to_string()
    } else if let Some(message) = panic.downcast_ref::<String>() {
        message.clone()
    } else {
        "unknown panic".to_string()
    }
}
