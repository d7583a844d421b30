//! Stop Registry
//!
//! Per-task cooperative stop flags, shared by the request handlers that stop
//! tasks and the queues that observe them. The registry is an injected value,
//! never a global; clone it freely.
//!
//! ```text
//! set_stop_flag(task, user) ──▶ StopRegistry ──▶ StopFlag ──notify──▶ QueueListener
//!                                                   ▲
//!                              EventEmitter ────────┘ (checked at every emit)
//! ```

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use dashmap::DashMap;
use parking_lot::Mutex;
use tokio::sync::Notify;

use super::events::{PublishFrom, StopReason};
use crate::entities::TaskId;

/// One task's stop flag
#[derive(Debug, Default)]
pub struct StopFlag {
    stopped: AtomicBool,
    reason: Mutex<Option<StopReason>>,
    notify: Notify,
}

impl StopFlag {
    /// Create an unset flag
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Set the flag; returns `true` if this call set it
    pub fn set(&self, reason: StopReason) -> bool {
        let mut current = self.reason.lock();
        if current.is_some() {
            return false;
        }
        *current = Some(reason);
        self.stopped.store(true, Ordering::Release);
        drop(current);
        self.notify.notify_waiters();
        true
    }

    /// Whether the flag is set
    #[must_use]
    pub fn is_set(&self) -> bool {
        self.stopped.load(Ordering::Acquire)
    }

    /// Reason given by the first setter
    #[must_use]
    pub fn reason(&self) -> Option<StopReason> {
        *self.reason.lock()
    }

    /// Resolve once the flag is set
    pub async fn stopped(&self) {
        loop {
            let notified = self.notify.notified();
            if self.is_set() {
                return;
            }
            notified.await;
        }
    }
}

#[derive(Debug)]
struct StopEntry {
    owner: String,
    flag: Arc<StopFlag>,
}

/// Shared store of stop flags keyed by task id
#[derive(Clone, Debug, Default)]
pub struct StopRegistry {
    entries: Arc<DashMap<TaskId, StopEntry>>,
}

impl StopRegistry {
    /// Create an empty registry
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a task owned by `user_id` and return its flag
    ///
    /// A later registration under the same id replaces the earlier one; the
    /// earlier flag stays valid for its holder but is no longer reachable by id.
    pub fn register(&self, task_id: TaskId, user_id: impl Into<String>) -> Arc<StopFlag> {
        let flag = Arc::new(StopFlag::new());
        self.entries.insert(
            task_id,
            StopEntry {
                owner: user_id.into(),
                flag: Arc::clone(&flag),
            },
        );
        flag
    }

    /// External stop request; only the owning user may stop a task
    ///
    /// Returns `true` if the flag was set by this call.
    pub fn set_stop_flag(&self, task_id: &TaskId, user_id: &str) -> bool {
        let Some(entry) = self.entries.get(task_id) else {
            tracing::debug!(task_id = %task_id, "Stop requested for unknown task");
            return false;
        };

        if entry.owner != user_id {
            tracing::warn!(task_id = %task_id, "Stop requested by a user that does not own the task");
            return false;
        }

        let set = entry.flag.set(StopReason::UserManual);
        if set {
            tracing::info!(task_id = %task_id, "Stop flag set by user");
        }
        set
    }

    /// Internal stop without an ownership check
    pub fn stop(&self, task_id: &TaskId, from: PublishFrom, reason: StopReason) -> bool {
        let Some(entry) = self.entries.get(task_id) else {
            return false;
        };
        let set = entry.flag.set(reason);
        if set {
            tracing::info!(task_id = %task_id, from = ?from, reason = ?reason, "Stop flag set");
        }
        set
    }

    /// Whether a task's flag is set
    #[must_use]
    pub fn is_stopped(&self, task_id: &TaskId) -> bool {
        self.entries
            .get(task_id)
            .is_some_and(|entry| entry.flag.is_set())
    }

    /// Forget a task only if `flag` is still the one registered for it
    ///
    /// Returns `true` if the entry was removed.
    pub fn release(&self, task_id: &TaskId, flag: &Arc<StopFlag>) -> bool {
        self.entries
            .remove_if(task_id, |_, entry| Arc::ptr_eq(&entry.flag, flag))
            .is_some()
    }

    /// Number of registered tasks
    #[must_use]
    pub fn len(&self) -> usize {
        self.entries.len()
    }

    /// Whether no task is registered
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}
