//! Pipeline Test Utilities
//!
//! Scripted collaborators for driving the pipeline without a real engine or
//! speech backend. Used by the unit tests, the integration tests and the CLI.
//!
//! # Usage
//!
//! ```ignore
//! use pipeline_core::test_utils::{ScriptStep, ScriptedRunnerFactory};
//!
//! let factory = Arc::new(ScriptedRunnerFactory::new(vec![
//!     ScriptStep::WorkflowStarted,
//!     ScriptStep::Text("Hello".into()),
//!     ScriptStep::WorkflowSucceeded(outputs),
//! ]));
//!
//! // After the run, verify the resources were given back
//! assert_eq!(factory.resources().released(), 1);
//! ```

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;

use async_trait::async_trait;
use parking_lot::Mutex;
use serde_json::{Map, Value};
use tokio::sync::Notify;

use crate::entities::{GenerateEntity, TraceContext};
use crate::error::{GenerateError, SynthesisError};
use crate::queue::{AgentLog, Usage};
use crate::tts::SpeechSynthesizer;
use crate::worker::{EventEmitter, GenerationRunner, RequestResources, RunnerFactory};

// ============================================================================
// Scripted Runner
// ============================================================================

/// One step of a scripted generation
#[derive(Clone, Debug)]
pub enum ScriptStep {
    /// Emit answer text
    Text(String),
    /// Emit an agent log entry
    AgentLog(AgentLog),
    /// Start the workflow run
    WorkflowStarted,
    /// Record consumed tokens
    Tokens(u64),
    /// Record one executed node
    NodeStep,
    /// Finish the workflow with these outputs
    WorkflowSucceeded(Map<String, Value>),
    /// Finish with handled node failures
    WorkflowPartialSuccess(Map<String, Value>, u32),
    /// Fail the workflow
    WorkflowFailed(String),
    /// Finish the chat answer; usage counts the recorded tokens
    MessageEnd,
    /// Return this error from the runner
    Fail(GenerateError),
    /// Panic with this message
    Panic(String),
    /// Park until the stop flag is set, then unwind with `Stopped`
    WaitForStop,
    /// Park until notified; unwinds with `Stopped` if stopped first
    WaitFor(Arc<Notify>),
}

/// Runner replaying a fixed list of steps
#[derive(Debug)]
pub struct ScriptedRunner {
    steps: Vec<ScriptStep>,
    completion_tokens: u64,
}

impl ScriptedRunner {
    /// Create a runner for `steps`
    #[must_use]
    pub fn new(steps: Vec<ScriptStep>) -> Self {
        Self {
            steps,
            completion_tokens: 0,
        }
    }
}

#[async_trait]
impl GenerationRunner for ScriptedRunner {
    /// # Panics
    ///
    /// Panics on a [`ScriptStep::Panic`] step.
    async fn run(&mut self, emitter: &EventEmitter) -> Result<(), GenerateError> {
        let steps = std::mem::take(&mut self.steps);
        for step in steps {
            match step {
                ScriptStep::Text(text) => emitter.text_chunk(text)?,
                ScriptStep::AgentLog(log) => emitter.agent_log(log)?,
                ScriptStep::WorkflowStarted => {
                    emitter.workflow_started()?;
                }
                ScriptStep::Tokens(tokens) => {
                    self.completion_tokens += tokens;
                    emitter.record_tokens(tokens);
                }
                ScriptStep::NodeStep => emitter.record_step(),
                ScriptStep::WorkflowSucceeded(outputs) => emitter.workflow_succeeded(outputs)?,
                ScriptStep::WorkflowPartialSuccess(outputs, exceptions) => {
                    emitter.workflow_partial_success(outputs, exceptions)?;
                }
                ScriptStep::WorkflowFailed(error) => emitter.workflow_failed(error, 0)?,
                ScriptStep::MessageEnd => {
                    emitter.message_end(Usage::new(0, self.completion_tokens))?;
                }
                ScriptStep::Fail(error) => return Err(error),
                ScriptStep::Panic(message) => panic!("{message}"),
                ScriptStep::WaitForStop => {
                    emitter.stopped().await;
                    return Err(GenerateError::Stopped);
                }
                ScriptStep::WaitFor(gate) => {
                    tokio::select! {
                        () = gate.notified() => {}
                        () = emitter.stopped() => return Err(GenerateError::Stopped),
                    }
                }
            }
        }
        Ok(())
    }
}

// ============================================================================
// Resources
// ============================================================================

/// Counts how often resources were opened and released
#[derive(Clone, Debug, Default)]
pub struct RecordingResources {
    opened: Arc<AtomicUsize>,
    released: Arc<AtomicUsize>,
}

impl RecordingResources {
    /// Fresh counters
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Hand out a resource handle and count it as opened
    #[must_use]
    pub fn open(&self) -> Box<dyn RequestResources> {
        self.opened.fetch_add(1, Ordering::SeqCst);
        Box::new(RecordingHandle {
            released: Arc::clone(&self.released),
        })
    }

    /// Handles opened so far
    #[must_use]
    pub fn opened(&self) -> usize {
        self.opened.load(Ordering::SeqCst)
    }

    /// Handles released so far
    #[must_use]
    pub fn released(&self) -> usize {
        self.released.load(Ordering::SeqCst)
    }
}

struct RecordingHandle {
    released: Arc<AtomicUsize>,
}

impl RequestResources for RecordingHandle {
    fn release(&mut self) {
        self.released.fetch_add(1, Ordering::SeqCst);
    }
}

/// Factory handing out [`ScriptedRunner`]s that replay the same steps
#[derive(Debug)]
pub struct ScriptedRunnerFactory {
    steps: Vec<ScriptStep>,
    open_error: Option<GenerateError>,
    resources: RecordingResources,
}

impl ScriptedRunnerFactory {
    /// Factory replaying `steps` for every request
    #[must_use]
    pub fn new(steps: Vec<ScriptStep>) -> Self {
        Self {
            steps,
            open_error: None,
            resources: RecordingResources::new(),
        }
    }

    /// Fail `open_resources` with `error`
    #[must_use]
    pub fn failing_open(mut self, error: GenerateError) -> Self {
        self.open_error = Some(error);
        self
    }

    /// Resource counters shared by every run
    #[must_use]
    pub fn resources(&self) -> &RecordingResources {
        &self.resources
    }
}

#[async_trait]
impl RunnerFactory for ScriptedRunnerFactory {
    async fn open_resources(
        &self,
        _context: &TraceContext,
    ) -> Result<Box<dyn RequestResources>, GenerateError> {
        match &self.open_error {
            Some(error) => Err(error.clone()),
            None => Ok(self.resources.open()),
        }
    }

    fn create_runner(
        &self,
        _entity: &GenerateEntity,
        _context: &TraceContext,
    ) -> Result<Box<dyn GenerationRunner>, GenerateError> {
        Ok(Box::new(ScriptedRunner::new(self.steps.clone())))
    }
}

// ============================================================================
// Mock Synthesizer
// ============================================================================

/// Synthesizer returning the UTF-8 bytes of its input as one audio chunk
#[derive(Debug, Default)]
pub struct MockSynthesizer {
    fail_on: Option<String>,
    calls: Mutex<Vec<String>>,
}

impl MockSynthesizer {
    /// Synthesizer that always succeeds
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Fail any batch containing `needle`
    #[must_use]
    pub fn failing_on(mut self, needle: impl Into<String>) -> Self {
        self.fail_on = Some(needle.into());
        self
    }

    /// Texts passed to `synthesize`, in call order
    #[must_use]
    pub fn calls(&self) -> Vec<String> {
        self.calls.lock().clone()
    }
}

#[async_trait]
impl SpeechSynthesizer for MockSynthesizer {
    async fn synthesize(
        &self,
        text: &str,
        _voice: Option<&str>,
    ) -> Result<Vec<Vec<u8>>, SynthesisError> {
        self.calls.lock().push(text.to_string());
        if let Some(needle) = &self.fail_on {
            if text.contains(needle.as_str()) {
                return Err(SynthesisError(format!("refused batch containing {needle:?}")));
            }
        }
        Ok(vec![text.as_bytes().to_vec()])
    }
}
