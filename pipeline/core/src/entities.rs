//! Request Entities
//!
//! The per-request generation entity and the small value types derived from
//! it. A `GenerateEntity` is built once by the request handler, wrapped in an
//! `Arc` and shared read-only between the worker and the task pipeline.
//!
//! The worker never reads ambient request context. Everything it needs about
//! the caller is copied into a [`TraceContext`] before the task is spawned.

use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

/// Task identifier
#[derive(Clone, Debug, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct TaskId(pub String);

impl TaskId {
    /// Create a new task ID from a string
    pub fn new(id: impl Into<String>) -> Self {
        Self(id.into())
    }

    /// Generate a new unique task ID
    #[must_use]
    pub fn generate() -> Self {
        Self(uuid::Uuid::new_v4().to_string())
    }

    /// Get the string value
    #[must_use]
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl std::fmt::Display for TaskId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Kind of app being executed
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum AppMode {
    /// Plain chat completion
    Chat,
    /// Chat with tool-using agent
    AgentChat,
    /// Multi-node workflow without conversation
    Workflow,
    /// Workflow with conversation memory
    AdvancedChat,
}

impl AppMode {
    /// Whether runs of this mode produce a workflow run
    #[must_use]
    pub fn is_workflow(&self) -> bool {
        matches!(self, Self::Workflow | Self::AdvancedChat)
    }

    /// Whether this mode answers with a message
    #[must_use]
    pub fn is_conversational(&self) -> bool {
        !matches!(self, Self::Workflow)
    }

    /// Wire name
    #[must_use]
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Chat => "chat",
            Self::AgentChat => "agent-chat",
            Self::Workflow => "workflow",
            Self::AdvancedChat => "advanced-chat",
        }
    }
}

/// Where the request came from
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum InvokeFrom {
    /// Public API with an app key
    #[default]
    ServiceApi,
    /// Hosted web app
    WebApp,
    /// Explore page
    Explore,
    /// Builder debugger
    Debugger,
}

/// Text-to-speech settings for one request
#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct TtsSettings {
    /// Synthesize the answer while it streams
    pub auto_play: bool,
    /// Voice name passed to the synthesizer
    pub voice: Option<String>,
}

/// Caller context copied into the worker
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct TraceContext {
    /// Tenant that owns the app
    pub tenant_id: String,
    /// End user or account
    pub user_id: String,
    /// Correlation id for logs
    pub trace_id: String,
}

/// Everything needed to run one generation
#[derive(Clone, Debug)]
pub struct GenerateEntity {
    /// Task identifier, also the stop-flag key
    pub task_id: TaskId,
    /// Tenant identifier
    pub tenant_id: String,
    /// App identifier
    pub app_id: String,
    /// User identifier
    pub user_id: String,
    /// Workflow identifier (workflow modes only)
    pub workflow_id: Option<String>,
    /// Conversation identifier (conversational modes only)
    pub conversation_id: Option<String>,
    /// Message identifier (conversational modes only)
    pub message_id: Option<String>,
    /// App mode
    pub app_mode: AppMode,
    /// User inputs
    pub inputs: Map<String, Value>,
    /// User query
    pub query: Option<String>,
    /// Stream the response instead of blocking
    pub stream: bool,
    /// Request source
    pub invoke_from: InvokeFrom,
    /// Optional TTS settings
    pub tts: Option<TtsSettings>,
    /// Correlation id
    pub trace_id: String,
}

impl GenerateEntity {
    /// Create an entity with a fresh task id
    pub fn new(
        tenant_id: impl Into<String>,
        app_id: impl Into<String>,
        user_id: impl Into<String>,
        app_mode: AppMode,
    ) -> Self {
        let task_id = TaskId::generate();
        let trace_id = task_id.to_string();
        let (message_id, conversation_id) = if app_mode.is_conversational() {
            (
                Some(uuid::Uuid::new_v4().to_string()),
                Some(uuid::Uuid::new_v4().to_string()),
            )
        } else {
            (None, None)
        };

        Self {
            task_id,
            tenant_id: tenant_id.into(),
            app_id: app_id.into(),
            user_id: user_id.into(),
            workflow_id: app_mode.is_workflow().then(|| uuid::Uuid::new_v4().to_string()),
            conversation_id,
            message_id,
            app_mode,
            inputs: Map::new(),
            query: None,
            stream: true,
            invoke_from: InvokeFrom::default(),
            tts: None,
            trace_id,
        }
    }

    /// Set the task id
    #[must_use]
    pub fn with_task_id(mut self, task_id: TaskId) -> Self {
        self.task_id = task_id;
        self
    }

    /// Set the workflow id
    #[must_use]
    pub fn with_workflow_id(mut self, workflow_id: impl Into<String>) -> Self {
        self.workflow_id = Some(workflow_id.into());
        self
    }

    /// Add an input value
    #[must_use]
    pub fn with_input(mut self, key: impl Into<String>, value: impl Into<Value>) -> Self {
        self.inputs.insert(key.into(), value.into());
        self
    }

    /// Set the query
    #[must_use]
    pub fn with_query(mut self, query: impl Into<String>) -> Self {
        self.query = Some(query.into());
        self
    }

    /// Set streaming mode
    #[must_use]
    pub fn with_stream(mut self, stream: bool) -> Self {
        self.stream = stream;
        self
    }

    /// Set the request source
    #[must_use]
    pub fn with_invoke_from(mut self, invoke_from: InvokeFrom) -> Self {
        self.invoke_from = invoke_from;
        self
    }

    /// Enable TTS
    #[must_use]
    pub fn with_tts(mut self, tts: TtsSettings) -> Self {
        self.tts = Some(tts);
        self
    }

    /// Set the trace id
    #[must_use]
    pub fn with_trace_id(mut self, trace_id: impl Into<String>) -> Self {
        self.trace_id = trace_id.into();
        self
    }

    /// Whether TTS auto-play was requested
    #[must_use]
    pub fn tts_enabled(&self) -> bool {
        self.tts.as_ref().is_some_and(|tts| tts.auto_play)
    }

    /// Copy the caller context for the worker
    #[must_use]
    pub fn trace_context(&self) -> TraceContext {
        TraceContext {
            tenant_id: self.tenant_id.clone(),
            user_id: self.user_id.clone(),
            trace_id: self.trace_id.clone(),
        }
    }
}
