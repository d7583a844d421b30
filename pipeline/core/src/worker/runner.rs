//! Runner seams and the event emitter
//!
//! The generation engine plugs in through [`RunnerFactory`] and
//! [`GenerationRunner`]. Runners never touch the queue directly; they report
//! progress through an [`EventEmitter`], which checks the stop flag at every
//! emission.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, OnceLock};

use async_trait::async_trait;
use serde_json::{Map, Value};

use crate::entities::{GenerateEntity, TaskId, TraceContext};
use crate::error::GenerateError;
use crate::queue::{AgentLog, PublishFrom, QueueEvent, QueueManager, RuntimeState, Usage};

// ============================================================================
// Collaborator Traits
// ============================================================================

/// Per-request resources (database session, tenant context, ...)
///
/// Released exactly once when the worker exits, on every path.
pub trait RequestResources: Send {
    /// Give the resources back
    fn release(&mut self);
}

/// Executes one generation
#[async_trait]
pub trait GenerationRunner: Send {
    /// Run to completion, reporting through `emitter`
    ///
    /// A well-behaved runner emits exactly one terminal event on success and
    /// returns an error kind on failure. `Err(GenerateError::Stopped)` is the
    /// normal way to unwind after a stop.
    async fn run(&mut self, emitter: &EventEmitter) -> Result<(), GenerateError>;
}

/// Builds runners and resources for a request
#[async_trait]
pub trait RunnerFactory: Send + Sync {
    /// Acquire per-request resources for the caller
    async fn open_resources(
        &self,
        context: &TraceContext,
    ) -> Result<Box<dyn RequestResources>, GenerateError>;

    /// Build the runner for `entity`
    fn create_runner(
        &self,
        entity: &GenerateEntity,
        context: &TraceContext,
    ) -> Result<Box<dyn GenerationRunner>, GenerateError>;
}

pub(crate) struct ResourceGuard {
    task_id: TaskId,
    resources: Option<Box<dyn RequestResources>>,
}

impl ResourceGuard {
    pub(crate) fn new(task_id: TaskId, resources: Box<dyn RequestResources>) -> Self {
        Self {
            task_id,
            resources: Some(resources),
        }
    }
}

impl Drop for ResourceGuard {
    fn drop(&mut self) {
        if let Some(mut resources) = self.resources.take() {
            resources.release();
            tracing::debug!(task_id = %self.task_id, "Request resources released");
        }
    }
}

// ============================================================================
// Event Emitter
// ============================================================================

/// Typed publishing API handed to runners
pub struct EventEmitter {
    queue: QueueManager,
    runtime_state: OnceLock<Arc<RuntimeState>>,
    terminal_sent: AtomicBool,
}

impl std::fmt::Debug for EventEmitter {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("EventEmitter")
            .field("task_id", self.queue.task_id())
            .field("terminal_sent", &self.terminal_sent())
            .finish_non_exhaustive()
    }
}

impl EventEmitter {
    /// Emitter publishing onto `queue`
    #[must_use]
    pub fn new(queue: QueueManager) -> Self {
        Self {
            queue,
            runtime_state: OnceLock::new(),
            terminal_sent: AtomicBool::new(false),
        }
    }

    /// Task being generated
    #[must_use]
    pub fn task_id(&self) -> &TaskId {
        self.queue.task_id()
    }

    /// Whether the task was asked to stop
    #[must_use]
    pub fn is_stopped(&self) -> bool {
        self.queue.is_stopped()
    }

    /// Safe point for long computations between emissions
    ///
    /// # Errors
    ///
    /// Returns [`GenerateError::Stopped`] once the stop flag is set.
    pub fn check_stopped(&self) -> Result<(), GenerateError> {
        if self.is_stopped() {
            Err(GenerateError::Stopped)
        } else {
            Ok(())
        }
    }

    /// Resolve once the stop flag is set
    pub async fn stopped(&self) {
        self.queue.stopped().await;
    }

    /// Emit answer text
    ///
    /// # Errors
    ///
    /// Returns [`GenerateError::Stopped`] when the task was stopped.
    pub fn text_chunk(&self, text: impl Into<String>) -> Result<(), GenerateError> {
        self.publish(QueueEvent::text(text))
    }

    /// Emit answer text produced by a workflow variable
    ///
    /// # Errors
    ///
    /// Returns [`GenerateError::Stopped`] when the task was stopped.
    pub fn text_chunk_from(
        &self,
        text: impl Into<String>,
        selector: Vec<String>,
    ) -> Result<(), GenerateError> {
        self.publish(QueueEvent::TextChunk {
            text: text.into(),
            from_variable_selector: Some(selector),
        })
    }

    /// Emit an agent log entry
    ///
    /// # Errors
    ///
    /// Returns [`GenerateError::Stopped`] when the task was stopped.
    pub fn agent_log(&self, log: AgentLog) -> Result<(), GenerateError> {
        self.publish(QueueEvent::AgentLog(log))
    }

    /// Start the workflow run; returns the shared counters
    ///
    /// # Errors
    ///
    /// Returns [`GenerateError::Stopped`] when the task was stopped.
    pub fn workflow_started(&self) -> Result<Arc<RuntimeState>, GenerateError> {
        let state = Arc::clone(self.runtime_state.get_or_init(RuntimeState::new));
        self.publish(QueueEvent::WorkflowStarted {
            runtime_state: Arc::clone(&state),
        })?;
        Ok(state)
    }

    /// Add consumed tokens to the run counters
    pub fn record_tokens(&self, tokens: u64) {
        if let Some(state) = self.runtime_state.get() {
            state.add_tokens(tokens);
        }
    }

    /// Count one executed node
    pub fn record_step(&self) {
        if let Some(state) = self.runtime_state.get() {
            state.increment_steps();
        }
    }

    /// Finish the workflow successfully
    ///
    /// # Errors
    ///
    /// Returns [`GenerateError::Stopped`] when the task was stopped.
    pub fn workflow_succeeded(&self, outputs: Map<String, Value>) -> Result<(), GenerateError> {
        self.publish(QueueEvent::WorkflowSucceeded { outputs })
    }

    /// Finish the workflow with handled node failures
    ///
    /// # Errors
    ///
    /// Returns [`GenerateError::Stopped`] when the task was stopped.
    pub fn workflow_partial_success(
        &self,
        outputs: Map<String, Value>,
        exceptions_count: u32,
    ) -> Result<(), GenerateError> {
        self.publish(QueueEvent::WorkflowPartialSuccess {
            outputs,
            exceptions_count,
        })
    }

    /// Fail the workflow
    ///
    /// # Errors
    ///
    /// Returns [`GenerateError::Stopped`] when the task was stopped.
    pub fn workflow_failed(
        &self,
        error: impl Into<String>,
        exceptions_count: u32,
    ) -> Result<(), GenerateError> {
        self.publish(QueueEvent::WorkflowFailed {
            error: error.into(),
            exceptions_count,
        })
    }

    /// Finish a chat/agent answer
    ///
    /// # Errors
    ///
    /// Returns [`GenerateError::Stopped`] when the task was stopped.
    pub fn message_end(&self, usage: Usage) -> Result<(), GenerateError> {
        self.publish(QueueEvent::MessageEnd { usage })
    }

    /// Whether this emitter published a terminal event
    #[must_use]
    pub fn terminal_sent(&self) -> bool {
        self.terminal_sent.load(Ordering::Acquire)
    }

    fn publish(&self, event: QueueEvent) -> Result<(), GenerateError> {
        let terminal = event.is_terminal();
        self.queue.publish(event, PublishFrom::Worker)?;
        if terminal {
            self.terminal_sent.store(true, Ordering::Release);
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::queue::{ListenConfig, StopReason, StopRegistry};

    fn emitter() -> (EventEmitter, QueueManager) {
        let queue = QueueManager::new(
            TaskId::new("t"),
            "u",
            StopRegistry::new(),
            ListenConfig::for_testing(),
        );
        (EventEmitter::new(queue.clone()), queue)
    }

    #[test]
    fn test_text_rejected_after_stop() {
        let (emitter, queue) = emitter();
        assert!(emitter.text_chunk("a").is_ok());
        queue.stop(PublishFrom::Pipeline, StopReason::UserManual);
        assert_eq!(emitter.text_chunk("b"), Err(GenerateError::Stopped));
        assert_eq!(emitter.check_stopped(), Err(GenerateError::Stopped));
        assert!(emitter.is_stopped());
    }

    #[test]
    fn test_terminal_tracking() {
        let (emitter, _queue) = emitter();
        assert!(!emitter.terminal_sent());
        emitter.message_end(Usage::new(1, 2)).unwrap();
        assert!(emitter.terminal_sent());
    }

    #[test]
    fn test_rejected_terminal_not_tracked() {
        let (emitter, queue) = emitter();
        queue.stop(PublishFrom::Pipeline, StopReason::UserManual);
        assert!(emitter.workflow_succeeded(Map::new()).is_err());
        assert!(!emitter.terminal_sent());
    }

    #[test]
    fn test_counters_follow_started_run() {
        let (emitter, _queue) = emitter();
        emitter.record_tokens(5);
        let state = emitter.workflow_started().unwrap();
        emitter.record_tokens(7);
        emitter.record_step();
        assert_eq!(state.total_tokens(), 7);
        assert_eq!(state.node_run_steps(), 1);
    }

    struct Counted(Arc<std::sync::atomic::AtomicUsize>);

    impl RequestResources for Counted {
        fn release(&mut self) {
            self.0.fetch_add(1, Ordering::SeqCst);
        }
    }

    #[test]
    fn test_resource_guard_releases_once() {
        let released = Arc::new(std::sync::atomic::AtomicUsize::new(0));
        let guard = ResourceGuard::new(TaskId::new("t"), Box::new(Counted(released.clone())));
        drop(guard);
        assert_eq!(released.load(Ordering::SeqCst), 1);
    }
}
