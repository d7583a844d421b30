//! Consumer-side task state
//!
//! ```text
//!            ┌──────────▶ SUCCEEDED
//!            │
//! INIT ──▶ RUNNING ─────▶ PARTIAL_SUCCEEDED
//!   │        │
//!   │        ├──────────▶ FAILED
//!   │        │
//!   └────────┴──────────▶ STOPPED
//! ```
//!
//! Chat apps never see a `WorkflowStarted`, so `INIT` may move straight to
//! any terminal state.

use std::sync::Arc;

use crate::error::{GenerateError, PipelineError};
use crate::queue::RuntimeState;

/// Lifecycle of one task as seen by the pipeline
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub enum PipelineState {
    /// Nothing received yet
    #[default]
    Init,
    /// Workflow run started
    Running,
    /// Finished successfully
    Succeeded,
    /// Finished with handled node failures
    PartialSucceeded,
    /// Failed
    Failed,
    /// Stopped
    Stopped,
}

impl PipelineState {
    /// Whether no further transition is allowed
    #[must_use]
    pub fn is_terminal(self) -> bool {
        !matches!(self, Self::Init | Self::Running)
    }

    /// Whether moving to `next` is legal
    #[must_use]
    pub fn can_transition_to(self, next: Self) -> bool {
        match self {
            Self::Init => next != Self::Init,
            Self::Running => next.is_terminal(),
            _ => false,
        }
    }
}

/// Accumulator owned by the pipeline; never shared with the worker
#[derive(Debug, Default)]
pub struct TaskState {
    /// Answer text received so far
    pub answer: String,
    state: PipelineState,
    workflow_run_id: Option<String>,
    runtime_state: Option<Arc<RuntimeState>>,
    last_error: Option<GenerateError>,
}

impl TaskState {
    /// Empty state
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Current lifecycle state
    #[must_use]
    pub fn state(&self) -> PipelineState {
        self.state
    }

    /// Append a text delta
    pub fn append_answer(&mut self, delta: &str) {
        self.answer.push_str(delta);
    }

    /// Move to `next`
    ///
    /// # Errors
    ///
    /// Returns [`PipelineError::InvariantViolation`] for an illegal move.
    pub fn transition(&mut self, next: PipelineState) -> Result<(), PipelineError> {
        if !self.state.can_transition_to(next) {
            return Err(PipelineError::InvariantViolation(format!(
                "illegal pipeline transition {:?} -> {next:?}",
                self.state
            )));
        }
        self.state = next;
        Ok(())
    }

    /// Record the started run
    ///
    /// # Errors
    ///
    /// Returns [`PipelineError::InvariantViolation`] if a run already started.
    pub fn start_run(
        &mut self,
        workflow_run_id: String,
        runtime_state: Arc<RuntimeState>,
    ) -> Result<(), PipelineError> {
        if self.workflow_run_id.is_some() {
            return Err(PipelineError::InvariantViolation(
                "workflow started twice".to_string(),
            ));
        }
        self.transition(PipelineState::Running)?;
        self.workflow_run_id = Some(workflow_run_id);
        self.runtime_state = Some(runtime_state);
        Ok(())
    }

    /// Run id captured from `workflow_started`
    #[must_use]
    pub fn workflow_run_id(&self) -> Option<&str> {
        self.workflow_run_id.as_deref()
    }

    /// Started run and its counters, if any
    #[must_use]
    pub fn run(&self) -> Option<(&str, &Arc<RuntimeState>)> {
        Some((self.workflow_run_id.as_deref()?, self.runtime_state.as_ref()?))
    }

    /// Remember the error that ended the task
    pub fn set_error(&mut self, error: GenerateError) {
        self.last_error = Some(error);
    }

    /// Error that ended the task, if any
    #[must_use]
    pub fn last_error(&self) -> Option<&GenerateError> {
        self.last_error.as_ref()
    }
}
