//! Stream Responses
//!
//! The external protocol. Every frame serializes as a JSON object tagged by
//! `"event"` and carries the `task_id`; workflow frames also carry the
//! `workflow_run_id` captured from `workflow_started`.
//!
//! ```text
//! data: {"event":"text_chunk","task_id":"...","workflow_run_id":"...","data":{"text":"Hi"}}
//!
//! event: ping
//! ```

use base64::engine::general_purpose::STANDARD as BASE64;
use base64::Engine;
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

use crate::entities::TaskId;
use crate::error::GenerateError;
use crate::queue::{AgentLog, Usage};
use crate::workflow::WorkflowRunStatus;

// ============================================================================
// Frames
// ============================================================================

/// One frame of the response stream
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(tag = "event", rename_all = "snake_case")]
pub enum StreamResponse {
    /// Keepalive
    Ping(PingStreamResponse),
    /// Generation failed; last primary frame
    Error(ErrorStreamResponse),
    /// Incremental answer text
    TextChunk(TextChunkStreamResponse),
    /// Agent log entry
    AgentLog(AgentLogStreamResponse),
    /// Workflow run created
    WorkflowStarted(WorkflowStartStreamResponse),
    /// Workflow run finalized
    WorkflowFinished(WorkflowFinishStreamResponse),
    /// Chat/agent answer finished
    MessageEnd(MessageEndStreamResponse),
    /// Synthesized audio
    MessageAudio(MessageAudioStreamResponse),
    /// End of audio
    MessageAudioEnd(MessageAudioStreamResponse),
}

/// Keepalive frame
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct PingStreamResponse {
    /// Task id
    pub task_id: TaskId,
}

/// Error frame
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct ErrorStreamResponse {
    /// Task id
    pub task_id: TaskId,
    /// Workflow run id, if a run started
    #[serde(skip_serializing_if = "Option::is_none", default)]
    pub workflow_run_id: Option<String>,
    /// Machine-readable code
    pub code: String,
    /// HTTP-like status
    pub status: u16,
    /// Human-readable message
    pub message: String,
}

impl ErrorStreamResponse {
    /// Render `error` for the client
    #[must_use]
    pub fn from_error(
        task_id: TaskId,
        workflow_run_id: Option<String>,
        error: &GenerateError,
    ) -> Self {
        let payload = error.payload();
        Self {
            task_id,
            workflow_run_id,
            code: payload.code.to_string(),
            status: payload.status,
            message: payload.message,
        }
    }
}

/// Text chunk payload
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct TextChunkData {
    /// Delta
    pub text: String,
    /// Variable selector that produced the text
    #[serde(skip_serializing_if = "Option::is_none", default)]
    pub from_variable_selector: Option<Vec<String>>,
}

/// Text chunk frame
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct TextChunkStreamResponse {
    /// Task id
    pub task_id: TaskId,
    /// Workflow run id (workflow modes)
    #[serde(skip_serializing_if = "Option::is_none", default)]
    pub workflow_run_id: Option<String>,
    /// Payload
    pub data: TextChunkData,
}

/// Agent log frame
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct AgentLogStreamResponse {
    /// Task id
    pub task_id: TaskId,
    /// Workflow run id (workflow modes)
    #[serde(skip_serializing_if = "Option::is_none", default)]
    pub workflow_run_id: Option<String>,
    /// Log entry
    pub data: AgentLog,
}

/// Workflow start payload
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct WorkflowStartData {
    /// Run id
    pub id: String,
    /// Workflow id
    pub workflow_id: String,
    /// Per tenant+app sequence number
    pub sequence_number: u64,
    /// Inputs merged with `sys.*` variables
    pub inputs: Map<String, Value>,
    /// Unix seconds
    pub created_at: i64,
}

/// Workflow start frame
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct WorkflowStartStreamResponse {
    /// Task id
    pub task_id: TaskId,
    /// Workflow run id
    pub workflow_run_id: String,
    /// Payload
    pub data: WorkflowStartData,
}

/// Workflow finish payload
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct WorkflowFinishData {
    /// Run id
    pub id: String,
    /// Workflow id
    pub workflow_id: String,
    /// Per tenant+app sequence number
    pub sequence_number: u64,
    /// Final status
    pub status: WorkflowRunStatus,
    /// Outputs
    pub outputs: Option<Map<String, Value>>,
    /// Error message
    pub error: Option<String>,
    /// Seconds
    pub elapsed_time: f64,
    /// Tokens consumed
    pub total_tokens: u64,
    /// Nodes executed
    pub total_steps: u64,
    /// Handled node exceptions
    pub exceptions_count: u32,
    /// Unix seconds
    pub created_at: i64,
    /// Unix seconds
    pub finished_at: i64,
}

/// Workflow finish frame
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct WorkflowFinishStreamResponse {
    /// Task id
    pub task_id: TaskId,
    /// Workflow run id
    pub workflow_run_id: String,
    /// Payload
    pub data: WorkflowFinishData,
}

/// Message end metadata
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct MessageMetadata {
    /// Token usage
    pub usage: Usage,
}

/// Message end frame
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct MessageEndStreamResponse {
    /// Task id
    pub task_id: TaskId,
    /// Workflow run id (advanced chat)
    #[serde(skip_serializing_if = "Option::is_none", default)]
    pub workflow_run_id: Option<String>,
    /// Message id
    pub id: Option<String>,
    /// Conversation id
    pub conversation_id: Option<String>,
    /// Metadata
    pub metadata: MessageMetadata,
}

/// Audio frame; `audio` is base64
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct MessageAudioStreamResponse {
    /// Task id
    pub task_id: TaskId,
    /// Base64 audio, empty for `message_audio_end`
    pub audio: String,
    /// Unix seconds
    pub created_at: i64,
}

impl MessageAudioStreamResponse {
    /// Encode raw audio bytes
    #[must_use]
    pub fn encode(task_id: TaskId, audio: &[u8]) -> Self {
        Self {
            task_id,
            audio: BASE64.encode(audio),
            created_at: chrono::Utc::now().timestamp(),
        }
    }
}

impl StreamResponse {
    /// Wire event name
    #[must_use]
    pub fn event_name(&self) -> &'static str {
        match self {
            Self::Ping(_) => "ping",
            Self::Error(_) => "error",
            Self::TextChunk(_) => "text_chunk",
            Self::AgentLog(_) => "agent_log",
            Self::WorkflowStarted(_) => "workflow_started",
            Self::WorkflowFinished(_) => "workflow_finished",
            Self::MessageEnd(_) => "message_end",
            Self::MessageAudio(_) => "message_audio",
            Self::MessageAudioEnd(_) => "message_audio_end",
        }
    }

    /// Task id carried by the frame
    #[must_use]
    pub fn task_id(&self) -> &TaskId {
        match self {
            Self::Ping(r) => &r.task_id,
            Self::Error(r) => &r.task_id,
            Self::TextChunk(r) => &r.task_id,
            Self::AgentLog(r) => &r.task_id,
            Self::WorkflowStarted(r) => &r.task_id,
            Self::WorkflowFinished(r) => &r.task_id,
            Self::MessageEnd(r) => &r.task_id,
            Self::MessageAudio(r) | Self::MessageAudioEnd(r) => &r.task_id,
        }
    }

    /// Workflow run id carried by the frame, if any
    #[must_use]
    pub fn workflow_run_id(&self) -> Option<&str> {
        match self {
            Self::Error(r) => r.workflow_run_id.as_deref(),
            Self::TextChunk(r) => r.workflow_run_id.as_deref(),
            Self::AgentLog(r) => r.workflow_run_id.as_deref(),
            Self::WorkflowStarted(r) => Some(&r.workflow_run_id),
            Self::WorkflowFinished(r) => Some(&r.workflow_run_id),
            Self::MessageEnd(r) => r.workflow_run_id.as_deref(),
            Self::Ping(_) | Self::MessageAudio(_) | Self::MessageAudioEnd(_) => None,
        }
    }

    /// Whether this is an audio frame
    #[must_use]
    pub fn is_audio(&self) -> bool {
        matches!(self, Self::MessageAudio(_) | Self::MessageAudioEnd(_))
    }

    /// Render as a server-sent event
    #[must_use]
    pub fn to_sse(&self) -> String {
        if matches!(self, Self::Ping(_)) {
            return "event: ping\n\n".to_string();
        }
        match serde_json::to_string(self) {
            Ok(json) => format!("data: {json}\n\n"),
            Err(e) => {
                tracing::error!(task_id = %self.task_id(), error = %e, "Failed to serialize stream response");
                String::new()
            }
        }
    }
}

// ============================================================================
// Blocking Responses
// ============================================================================

/// Aggregate result of a workflow run
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct WorkflowBlockingResponse {
    /// Task id
    pub task_id: TaskId,
    /// Workflow run id
    pub workflow_run_id: String,
    /// Finished run
    pub data: WorkflowFinishData,
}

impl From<WorkflowFinishStreamResponse> for WorkflowBlockingResponse {
    fn from(finish: WorkflowFinishStreamResponse) -> Self {
        Self {
            task_id: finish.task_id,
            workflow_run_id: finish.workflow_run_id,
            data: finish.data,
        }
    }
}

/// Aggregate result of a chat/agent message
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct MessageBlockingResponse {
    /// Task id
    pub task_id: TaskId,
    /// Message id
    pub message_id: Option<String>,
    /// Conversation id
    pub conversation_id: Option<String>,
    /// Full answer
    pub answer: String,
    /// Token usage
    pub usage: Usage,
    /// Whether the answer was cut short by a stop
    pub stopped: bool,
    /// Unix seconds
    pub created_at: i64,
}

/// Result of a workflow stopped before its run was created
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct StoppedBlockingResponse {
    /// Task id
    pub task_id: TaskId,
    /// Stop message
    pub message: String,
}

/// Result of `process(stream = false)`
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(tag = "mode", rename_all = "snake_case")]
pub enum BlockingResponse {
    /// Workflow result
    Workflow(WorkflowBlockingResponse),
    /// Message result
    Message(MessageBlockingResponse),
    /// Stopped before anything was produced
    Stopped(StoppedBlockingResponse),
}

impl BlockingResponse {
    /// Status of the result (`succeeded`, `failed`, `stopped`, ...)
    #[must_use]
    pub fn status(&self) -> &'static str {
        match self {
            Self::Workflow(r) => r.data.status.as_str(),
            Self::Message(r) if r.stopped => WorkflowRunStatus::Stopped.as_str(),
            Self::Message(_) => WorkflowRunStatus::Succeeded.as_str(),
            Self::Stopped(_) => WorkflowRunStatus::Stopped.as_str(),
        }
    }

    /// Task id
    #[must_use]
    pub fn task_id(&self) -> &TaskId {
        match self {
            Self::Workflow(r) => &r.task_id,
            Self::Message(r) => &r.task_id,
            Self::Stopped(r) => &r.task_id,
        }
    }
}
