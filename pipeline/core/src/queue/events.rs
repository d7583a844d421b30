//! Queue Events
//!
//! Internal events flowing from the worker to the task pipeline. These never
//! leave the process; the pipeline translates them into
//! [`StreamResponse`](crate::pipeline::StreamResponse) frames.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use tokio::time::Instant;

use crate::entities::TaskId;
use crate::error::GenerateError;

/// Which side of the queue published a message
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PublishFrom {
    /// The worker (application manager side)
    Worker,
    /// The task pipeline (consumer side)
    Pipeline,
}

/// Why a run was stopped
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum StopReason {
    /// User pressed stop
    UserManual,
    /// Max execution time exceeded
    Timeout,
    /// The response stream was dropped
    ClientDisconnected,
    /// The worker pool is shutting down
    Shutdown,
}

impl StopReason {
    /// Message stored on the stopped workflow run
    #[must_use]
    pub fn message(&self) -> &'static str {
        match self {
            Self::UserManual => "Stopped by user.",
            Self::Timeout => "Max execution time exceeded.",
            Self::ClientDisconnected => "Client disconnected.",
            Self::Shutdown => "Service shutting down.",
        }
    }
}

/// Token usage reported with `MessageEnd`
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Usage {
    /// Prompt tokens
    pub prompt_tokens: u64,
    /// Completion tokens
    pub completion_tokens: u64,
    /// Sum of both
    pub total_tokens: u64,
}

impl Usage {
    /// Build usage from prompt and completion counts
    #[must_use]
    pub fn new(prompt_tokens: u64, completion_tokens: u64) -> Self {
        Self {
            prompt_tokens,
            completion_tokens,
            total_tokens: prompt_tokens + completion_tokens,
        }
    }
}

/// Agent reasoning/tool log entry
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct AgentLog {
    /// Log entry id
    pub id: String,
    /// Display label
    pub label: String,
    /// Entry status (`start`, `success`, `error`)
    pub status: String,
    /// Arbitrary payload
    pub data: Value,
}

/// Counters shared between the engine and the pipeline for one workflow run
///
/// Written by the worker through the emitter, read by the pipeline when the
/// run is finalized.
#[derive(Debug)]
pub struct RuntimeState {
    started_at: Instant,
    started_at_utc: DateTime<Utc>,
    total_tokens: AtomicU64,
    node_run_steps: AtomicU64,
}

impl RuntimeState {
    /// Start counting now
    #[must_use]
    pub fn new() -> Arc<Self> {
        Arc::new(Self {
            started_at: Instant::now(),
            started_at_utc: Utc::now(),
            total_tokens: AtomicU64::new(0),
            node_run_steps: AtomicU64::new(0),
        })
    }

    /// Add consumed tokens
    pub fn add_tokens(&self, tokens: u64) {
        self.total_tokens.fetch_add(tokens, Ordering::Relaxed);
    }

    /// Count one executed node
    pub fn increment_steps(&self) {
        self.node_run_steps.fetch_add(1, Ordering::Relaxed);
    }

    /// Tokens consumed so far
    #[must_use]
    pub fn total_tokens(&self) -> u64 {
        self.total_tokens.load(Ordering::Relaxed)
    }

    /// Nodes executed so far
    #[must_use]
    pub fn node_run_steps(&self) -> u64 {
        self.node_run_steps.load(Ordering::Relaxed)
    }

    /// Monotonic start instant
    #[must_use]
    pub fn started_at(&self) -> Instant {
        self.started_at
    }

    /// Wall-clock start
    #[must_use]
    pub fn started_at_utc(&self) -> DateTime<Utc> {
        self.started_at_utc
    }

    /// Seconds since start
    #[must_use]
    pub fn elapsed_secs(&self) -> f64 {
        self.started_at.elapsed().as_secs_f64()
    }
}

/// Internal event published onto a task queue
#[derive(Clone, Debug)]
pub enum QueueEvent {
    /// Keepalive synthesized by the listener
    Ping,
    /// Generation failed (terminal)
    Error(GenerateError),
    /// Generation stopped (terminal)
    Stop(StopReason),
    /// Incremental answer text
    TextChunk {
        /// Delta
        text: String,
        /// Variable selector that produced the text, if any
        from_variable_selector: Option<Vec<String>>,
    },
    /// Agent log entry
    AgentLog(AgentLog),
    /// Workflow run started
    WorkflowStarted {
        /// Counters for this run
        runtime_state: Arc<RuntimeState>,
    },
    /// Workflow finished successfully (terminal)
    WorkflowSucceeded {
        /// Final outputs
        outputs: Map<String, Value>,
    },
    /// Workflow finished with handled node failures (terminal)
    WorkflowPartialSuccess {
        /// Final outputs
        outputs: Map<String, Value>,
        /// Number of handled exceptions
        exceptions_count: u32,
    },
    /// Workflow failed (terminal)
    WorkflowFailed {
        /// Failure message
        error: String,
        /// Number of handled exceptions before the failure
        exceptions_count: u32,
    },
    /// Chat/agent answer complete (terminal)
    MessageEnd {
        /// Token usage
        usage: Usage,
    },
}

impl QueueEvent {
    /// Create a text chunk without a variable selector
    pub fn text(text: impl Into<String>) -> Self {
        Self::TextChunk {
            text: text.into(),
            from_variable_selector: None,
        }
    }

    /// Whether this event ends the run
    #[must_use]
    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            Self::Error(_)
                | Self::Stop(_)
                | Self::WorkflowSucceeded { .. }
                | Self::WorkflowPartialSuccess { .. }
                | Self::WorkflowFailed { .. }
                | Self::MessageEnd { .. }
        )
    }

    /// Whether a stopped worker may still publish this event
    #[must_use]
    pub fn allowed_after_stop(&self) -> bool {
        matches!(self, Self::Stop(_) | Self::Error(_))
    }

    /// Event name for logs
    #[must_use]
    pub fn name(&self) -> &'static str {
        match self {
            Self::Ping => "ping",
            Self::Error(_) => "error",
            Self::Stop(_) => "stop",
            Self::TextChunk { .. } => "text_chunk",
            Self::AgentLog(_) => "agent_log",
            Self::WorkflowStarted { .. } => "workflow_started",
            Self::WorkflowSucceeded { .. } => "workflow_succeeded",
            Self::WorkflowPartialSuccess { .. } => "workflow_partial_success",
            Self::WorkflowFailed { .. } => "workflow_failed",
            Self::MessageEnd { .. } => "message_end",
        }
    }
}

/// Envelope carried by the task queue
#[derive(Clone, Debug)]
pub struct QueueMessage {
    /// Owning task
    pub task_id: TaskId,
    /// Payload
    pub event: QueueEvent,
    /// Publisher
    pub from: PublishFrom,
}

impl QueueMessage {
    /// Wrap an event
    #[must_use]
    pub fn new(task_id: TaskId, event: QueueEvent, from: PublishFrom) -> Self {
        Self {
            task_id,
            event,
            from,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_terminal_events() {
        assert!(!QueueEvent::Ping.is_terminal());
        assert!(!QueueEvent::text("a").is_terminal());
        assert!(QueueEvent::Stop(StopReason::UserManual).is_terminal());
        assert!(QueueEvent::Error(GenerateError::Stopped).is_terminal());
        assert!(QueueEvent::MessageEnd {
            usage: Usage::default()
        }
        .is_terminal());
        assert!(QueueEvent::WorkflowFailed {
            error: "x".into(),
            exceptions_count: 0
        }
        .is_terminal());
    }

    #[test]
    fn test_allowed_after_stop() {
        assert!(QueueEvent::Stop(StopReason::Timeout).allowed_after_stop());
        assert!(QueueEvent::Error(GenerateError::Unknown("x".into())).allowed_after_stop());
        assert!(!QueueEvent::WorkflowSucceeded {
            outputs: Map::new()
        }
        .allowed_after_stop());
    }

    #[test]
    fn test_runtime_state_counters() {
        let state = RuntimeState::new();
        state.add_tokens(10);
        state.add_tokens(5);
        state.increment_steps();
        assert_eq!(state.total_tokens(), 15);
        assert_eq!(state.node_run_steps(), 1);
        assert!(state.elapsed_secs() >= 0.0);
    }

    #[test]
    fn test_usage_total() {
        assert_eq!(Usage::new(3, 4).total_tokens, 7);
    }
}
