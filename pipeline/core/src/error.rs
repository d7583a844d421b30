//! Error Types
//!
//! Every failure that can cross a module boundary in the pipeline is one of
//! the enums below. Runners report failures as a [`GenerateError`] kind; the
//! worker and the task pipeline never inspect concrete provider types.
//!
//! # Error Frames
//!
//! [`GenerateError::payload`] maps a kind to the `{code, status, message}`
//! triple rendered in `error` stream frames:
//!
//! | Kind | Code | Status |
//! |------|------|--------|
//! | validation | `invalid_param` | 400 |
//! | authorization | `invalid_api_key` | 401 |
//! | quota exceeded | `provider_quota_exceeded` | 400 |
//! | other invoke | `completion_request_error` | 400 |
//! | unknown | `internal_server_error` | 500 |

use std::fmt;

use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::entities::TaskId;
use crate::workflow::WorkflowRunStatus;

/// Message shown to clients for authorization failures
pub const INVALID_API_KEY_MESSAGE: &str = "Incorrect API key provided";

/// Message shown to clients for unknown failures; details stay in the logs
pub const INTERNAL_ERROR_MESSAGE: &str = "Internal Server Error, please contact support.";

// ============================================================================
// Generation Errors
// ============================================================================

/// Failure kind reported by a model provider invocation
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum InvokeErrorKind {
    /// Could not reach the provider
    Connection,
    /// Provider answered with a 5xx-like status
    ServerUnavailable,
    /// Provider throttled the request
    RateLimit,
    /// Provider rejected the request shape
    BadRequest,
    /// Tenant quota with the provider is exhausted
    QuotaExceeded,
}

impl fmt::Display for InvokeErrorKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Self::Connection => "connection",
            Self::ServerUnavailable => "server_unavailable",
            Self::RateLimit => "rate_limit",
            Self::BadRequest => "bad_request",
            Self::QuotaExceeded => "quota_exceeded",
        };
        f.write_str(name)
    }
}

/// Error returned by a generation runner, carried in `Error` queue events
#[derive(Clone, Debug, Error, PartialEq, Eq)]
pub enum GenerateError {
    /// Credentials were rejected by the provider
    #[error("authorization failed: {0}")]
    Authorization(String),

    /// Inputs failed validation
    #[error("validation failed: {0}")]
    Validation(String),

    /// The provider invocation failed
    #[error("provider invoke failed ({kind}): {message}")]
    Invoke {
        /// Failure category
        kind: InvokeErrorKind,
        /// Provider message
        message: String,
    },

    /// Generation was stopped; not a failure
    #[error("generation stopped")]
    Stopped,

    /// Anything else
    #[error("unknown error: {0}")]
    Unknown(String),
}

/// Client-facing rendering of a [`GenerateError`]
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct ErrorPayload {
    /// Stable machine-readable code
    pub code: &'static str,
    /// HTTP-like status
    pub status: u16,
    /// Human-readable message
    pub message: String,
}

impl GenerateError {
    /// Create an invoke error
    pub fn invoke(kind: InvokeErrorKind, message: impl Into<String>) -> Self {
        Self::Invoke {
            kind,
            message: message.into(),
        }
    }

    /// Short kind name used in log fields
    pub fn kind_name(&self) -> &'static str {
        match self {
            Self::Authorization(_) => "authorization",
            Self::Validation(_) => "validation",
            Self::Invoke { .. } => "invoke",
            Self::Stopped => "stopped",
            Self::Unknown(_) => "unknown",
        }
    }

    /// Whether this error only signals a cooperative stop
    pub fn is_stopped(&self) -> bool {
        matches!(self, Self::Stopped)
    }

    /// Map this error to the code, status and message of an error frame
    pub fn payload(&self) -> ErrorPayload {
        match self {
            Self::Validation(message) => ErrorPayload {
                code: "invalid_param",
                status: 400,
                message: message.clone(),
            },
            Self::Authorization(_) => ErrorPayload {
                code: "invalid_api_key",
                status: 401,
                message: INVALID_API_KEY_MESSAGE.to_string(),
            },
            Self::Invoke {
                kind: InvokeErrorKind::QuotaExceeded,
                ..
            } => ErrorPayload {
                code: "provider_quota_exceeded",
                status: 400,
                message: "Your quota for the model provider has been exhausted.".to_string(),
            },
            Self::Invoke { message, .. } => ErrorPayload {
                code: "completion_request_error",
                status: 400,
                message: message.clone(),
            },
            Self::Stopped | Self::Unknown(_) => ErrorPayload {
                code: "internal_server_error",
                status: 500,
                message: INTERNAL_ERROR_MESSAGE.to_string(),
            },
        }
    }
}

// ============================================================================
// Component Errors
// ============================================================================

/// Queue lifecycle errors
#[derive(Debug, Error, PartialEq, Eq)]
pub enum QueueError {
    /// `listen()` was already called for this queue
    #[error("queue for task {0} already has a listener")]
    AlreadyListening(TaskId),
}

/// Worker pool errors
#[derive(Debug, Error, PartialEq, Eq)]
pub enum PoolError {
    /// A worker for this task is still active
    #[error("a worker for task {0} is already running")]
    DuplicateTask(TaskId),

    /// The pool no longer accepts work
    #[error("worker pool is shutting down")]
    ShuttingDown,
}

/// Workflow run persistence errors
#[derive(Debug, Error, PartialEq, Eq)]
pub enum WorkflowRunError {
    /// No run with this id exists
    #[error("workflow run not found: {0}")]
    NotFound(String),

    /// The run is already finalized or the move is not allowed
    #[error("workflow run cannot move from {from} to {to}")]
    InvalidTransition {
        /// Current status
        from: WorkflowRunStatus,
        /// Requested status
        to: WorkflowRunStatus,
    },

    /// Backing store failure
    #[error("workflow run storage error: {0}")]
    Storage(String),
}

/// Speech synthesis failure; logged and skipped by the TTS publisher
#[derive(Clone, Debug, Error, PartialEq, Eq)]
#[error("speech synthesis failed: {0}")]
pub struct SynthesisError(pub String);

/// Top-level error returned by the task pipeline and the app generator
#[derive(Debug, Error)]
pub enum PipelineError {
    /// Generation failed; the error frame was the last frame
    #[error(transparent)]
    Generate(#[from] GenerateError),

    /// Events arrived in an order the state machine cannot accept
    #[error("pipeline invariant violated: {0}")]
    InvariantViolation(String),

    /// Workflow run could not be persisted
    #[error(transparent)]
    Persistence(#[from] WorkflowRunError),

    /// Queue misuse
    #[error(transparent)]
    Queue(#[from] QueueError),

    /// Worker could not be scheduled
    #[error(transparent)]
    Pool(#[from] PoolError),
}
