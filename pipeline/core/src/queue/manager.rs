//! Queue Manager
//!
//! Owns the queue lifecycle for one task: publishing, a single listener with
//! idle keepalive and a max-execution-time guard, and stop signaling.
//!
//! # Publish rules
//!
//! - A stopped worker may only publish `Stop` or `Error`. Anything else is
//!   rejected with [`GenerateError::Stopped`] so the runner unwinds.
//! - Once a terminal event is queued every further publish is dropped.
//!
//! # Listening
//!
//! [`QueueListener::next`] waits for the next message with an idle timeout.
//! When nothing arrives within `idle_ping_interval` it returns a synthesized
//! `Ping`. When the stop flag is set it publishes `Stop` from the pipeline
//! side, so everything already queued is still delivered first. Listening
//! ends after the terminal message.

use std::sync::Arc;
use std::time::Duration;

use futures::stream::{self, Stream};
use tokio::sync::mpsc;
use tokio::time::Instant;

use super::events::{PublishFrom, QueueEvent, QueueMessage, StopReason};
use super::stop::{StopFlag, StopRegistry};
use super::task_queue::{PushOutcome, TaskQueue};
use crate::entities::TaskId;
use crate::error::{GenerateError, QueueError};

/// Listener timing configuration
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct ListenConfig {
    /// Emit a Ping after this long without messages
    pub idle_ping_interval: Duration,
    /// Stop the run after this long
    pub max_execution_time: Duration,
}

impl Default for ListenConfig {
    fn default() -> Self {
        Self {
            idle_ping_interval: Duration::from_secs(10),
            max_execution_time: Duration::from_secs(1200),
        }
    }
}

impl ListenConfig {
    /// Short intervals for tests
    #[must_use]
    pub fn for_testing() -> Self {
        Self {
            idle_ping_interval: Duration::from_millis(50),
            max_execution_time: Duration::from_secs(30),
        }
    }

    /// Set the idle ping interval
    #[must_use]
    pub fn with_idle_ping_interval(mut self, interval: Duration) -> Self {
        self.idle_ping_interval = interval;
        self
    }

    /// Set the max execution time
    #[must_use]
    pub fn with_max_execution_time(mut self, limit: Duration) -> Self {
        self.max_execution_time = limit;
        self
    }
}

struct Inner {
    task_id: TaskId,
    queue: TaskQueue,
    stop_flag: Arc<StopFlag>,
    registry: StopRegistry,
    config: ListenConfig,
}

impl Drop for Inner {
    fn drop(&mut self) {
        self.registry.release(&self.task_id, &self.stop_flag);
    }
}

/// Queue handle for one task, shared by the worker and the pipeline
#[derive(Clone)]
pub struct QueueManager {
    inner: Arc<Inner>,
}

impl std::fmt::Debug for QueueManager {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("QueueManager")
            .field("task_id", &self.inner.task_id)
            .field("stopped", &self.is_stopped())
            .field("terminated", &self.inner.queue.is_terminated())
            .finish()
    }
}

impl QueueManager {
    /// Create a queue for `task_id` and register its stop flag
    pub fn new(
        task_id: TaskId,
        user_id: impl Into<String>,
        registry: StopRegistry,
        config: ListenConfig,
    ) -> Self {
        let stop_flag = registry.register(task_id.clone(), user_id);
        Self {
            inner: Arc::new(Inner {
                task_id,
                queue: TaskQueue::new(),
                stop_flag,
                registry,
                config,
            }),
        }
    }

    /// Task this queue belongs to
    #[must_use]
    pub fn task_id(&self) -> &TaskId {
        &self.inner.task_id
    }

    /// Publish an event
    ///
    /// # Errors
    ///
    /// Returns [`GenerateError::Stopped`] when a worker publishes content
    /// after the stop flag is set, after the run has ended, or after the
    /// consumer went away. Pipeline-side publishes never fail.
    pub fn publish(&self, event: QueueEvent, from: PublishFrom) -> Result<(), GenerateError> {
        let task_id = &self.inner.task_id;

        if from == PublishFrom::Worker && self.is_stopped() && !event.allowed_after_stop() {
            tracing::debug!(
                task_id = %task_id,
                event = event.name(),
                "Rejected publish from stopped worker"
            );
            return Err(GenerateError::Stopped);
        }

        let message = QueueMessage::new(task_id.clone(), event, from);
        match self.inner.queue.push(message) {
            PushOutcome::Enqueued => Ok(()),
            PushOutcome::Stale(message) => {
                tracing::debug!(
                    task_id = %task_id,
                    event = message.event.name(),
                    from = ?from,
                    "Dropped publish after terminal event"
                );
                if from == PublishFrom::Worker && !message.event.is_terminal() {
                    Err(GenerateError::Stopped)
                } else {
                    Ok(())
                }
            }
            PushOutcome::Closed => {
                tracing::debug!(task_id = %task_id, "Publish after listener closed");
                if from == PublishFrom::Worker {
                    Err(GenerateError::Stopped)
                } else {
                    Ok(())
                }
            }
        }
    }

    /// Publish an `Error` event
    ///
    /// # Errors
    ///
    /// See [`QueueManager::publish`].
    pub fn publish_error(&self, error: GenerateError, from: PublishFrom) -> Result<(), GenerateError> {
        self.publish(QueueEvent::Error(error), from)
    }

    /// Start listening; allowed once per queue
    ///
    /// # Errors
    ///
    /// Returns [`QueueError::AlreadyListening`] on a second call.
    pub fn listen(&self) -> Result<QueueListener, QueueError> {
        let rx = self
            .inner
            .queue
            .take_receiver()
            .ok_or_else(|| QueueError::AlreadyListening(self.inner.task_id.clone()))?;

        let now = Instant::now();
        Ok(QueueListener {
            manager: self.clone(),
            rx,
            started_at: now,
            last_activity: now,
            stop_published: false,
            finished: false,
        })
    }

    /// Set this task's stop flag
    ///
    /// Returns `true` if this call set the flag.
    pub fn stop(&self, from: PublishFrom, reason: StopReason) -> bool {
        let set = self.inner.stop_flag.set(reason);
        if set {
            tracing::info!(task_id = %self.inner.task_id, from = ?from, reason = ?reason, "Stop flag set");
        }
        set
    }

    /// Whether the stop flag is set
    #[must_use]
    pub fn is_stopped(&self) -> bool {
        self.inner.stop_flag.is_set()
    }

    /// Whether a terminal event was queued
    #[must_use]
    pub fn is_terminated(&self) -> bool {
        self.inner.queue.is_terminated()
    }

    /// Resolve once the stop flag is set
    pub async fn stopped(&self) {
        self.inner.stop_flag.stopped().await;
    }

    fn config(&self) -> &ListenConfig {
        &self.inner.config
    }

    fn stop_flag(&self) -> &StopFlag {
        &self.inner.stop_flag
    }
}

enum Wake {
    Message(Option<QueueMessage>),
    Stop,
}

/// Single consumer of a task queue
pub struct QueueListener {
    manager: QueueManager,
    rx: mpsc::UnboundedReceiver<QueueMessage>,
    started_at: Instant,
    last_activity: Instant,
    stop_published: bool,
    finished: bool,
}

impl std::fmt::Debug for QueueListener {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("QueueListener")
            .field("task_id", self.manager.task_id())
            .field("stop_published", &self.stop_published)
            .field("finished", &self.finished)
            .finish_non_exhaustive()
    }
}

impl QueueListener {
    /// Next message, a synthesized Ping, or `None` after the terminal message
    pub async fn next(&mut self) -> Option<QueueMessage> {
        if self.finished {
            return None;
        }

        loop {
            self.check_stop();

            let now = Instant::now();
            let idle_limit = self.manager.config().idle_ping_interval;
            let mut wait = idle_limit.saturating_sub(now.duration_since(self.last_activity));
            if !self.stop_published {
                let run_limit = self.manager.config().max_execution_time;
                wait = wait.min(run_limit.saturating_sub(now.duration_since(self.started_at)));
            }

            let stop_published = self.stop_published;
            let flag = Arc::clone(&self.manager.inner.stop_flag);
            let rx = &mut self.rx;
            let wake = async move {
                tokio::select! {
                    biased;
                    message = rx.recv() => Wake::Message(message),
                    () = flag.stopped(), if !stop_published => Wake::Stop,
                }
            };

            match tokio::time::timeout(wait, wake).await {
                Ok(Wake::Message(Some(message))) => {
                    self.last_activity = Instant::now();
                    if message.event.is_terminal() {
                        self.finished = true;
                    }
                    return Some(message);
                }
                Ok(Wake::Message(None)) => {
                    self.finished = true;
                    return None;
                }
                Ok(Wake::Stop) => {}
                Err(_elapsed) => {
                    if self.last_activity.elapsed() >= idle_limit {
                        self.last_activity = Instant::now();
                        return Some(QueueMessage::new(
                            self.manager.task_id().clone(),
                            QueueEvent::Ping,
                            PublishFrom::Pipeline,
                        ));
                    }
                }
            }
        }
    }

    /// Consume the listener as a stream of messages
    pub fn into_stream(self) -> impl Stream<Item = QueueMessage> + Send {
        stream::unfold(self, |mut listener| async move {
            let message = listener.next().await?;
            Some((message, listener))
        })
    }

    /// Task this listener belongs to
    #[must_use]
    pub fn task_id(&self) -> &TaskId {
        self.manager.task_id()
    }

    fn check_stop(&mut self) {
        if self.stop_published {
            return;
        }

        if self.started_at.elapsed() >= self.manager.config().max_execution_time
            && self.manager.stop(PublishFrom::Pipeline, StopReason::Timeout)
        {
            tracing::warn!(task_id = %self.manager.task_id(), "Max execution time exceeded");
        }

        let Some(reason) = self.manager.stop_flag().reason() else {
            return;
        };

        self.stop_published = true;
        tracing::info!(task_id = %self.manager.task_id(), reason = ?reason, "Stop observed by listener");
        // Pipeline-side publishes do not fail; a stale Stop means a terminal event is already queued.
        let _ = self.manager.publish(QueueEvent::Stop(reason), PublishFrom::Pipeline);
    }
}
