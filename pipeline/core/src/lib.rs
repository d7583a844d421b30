//! Pipeline Core - Asynchronous Generation Task Pipeline
//!
//! This crate runs LLM app generations (chat, agent, workflow) in a background
//! worker and delivers the results to the caller either as one blocking
//! response or as a lazy stream of protocol frames, optionally interleaved
//! with synthesized audio.
//!
//! # Architecture
//!
//! ```text
//! ┌──────────────────────────────────────────────────────────────────┐
//! │                          AppGenerator                            │
//! │                                                                  │
//! │  ┌────────────┐  QueueEvent   ┌──────────────┐  StreamResponse   │
//! │  │   Worker   │ ────────────▶ │ QueueManager │ ──────────────┐   │
//! │  │ (producer) │   publish     │  TaskQueue   │   listen      │   │
//! │  └─────┬──────┘               │  StopFlag    │               ▼   │
//! │        │                      └──────────────┘      ┌──────────────┐
//! │  ┌─────┴──────┐                                     │ TaskPipeline │
//! │  │ WorkerPool │                                     │  (consumer)  │
//! │  │ semaphore  │                                     └──┬────────┬──┘
//! │  └────────────┘                  WorkflowCycleManager ◀┘        │  │
//! │                                  (WorkflowRun repository)       │  │
//! │                                                 TtsPublisher ◀──┘  │
//! │                                                (SentenceBuffer,    │
//! │                                                 SpeechSynthesizer) │
//! └────────────────────────────────────────────────────────────────────┘
//! ```
//!
//! # Key Types
//!
//! - [`AppGenerator`]: Composition root for one request
//! - [`QueueManager`]: Per-task queue with idle pings and stop signaling
//! - [`Worker`]: Drives a [`GenerationRunner`] and guarantees one terminal event
//! - [`WorkerPool`]: Bounded, cancellable set of worker tasks
//! - [`TaskPipeline`]: Translates queue events into [`StreamResponse`] frames
//! - [`WorkflowCycleManager`]: Persists the workflow run lifecycle
//! - [`TtsPublisher`]: Sentence-batched speech synthesis
//!
//! # Quick Start
//!
//! ```ignore
//! use pipeline_core::{AppGenerator, AppMode, GenerateEntity, ProcessOutput};
//!
//! let config = pipeline_core::load_config()?;
//! let generator = AppGenerator::new(&config, repository, factory, StopRegistry::new());
//!
//! let entity = GenerateEntity::new("tenant", "app", "user", AppMode::Workflow);
//! match generator.generate(entity, true).await? {
//!     ProcessOutput::Streaming(mut frames) => {
//!         while let Some(frame) = frames.next().await {
//!             print!("{}", frame?.to_sse());
//!         }
//!     }
//!     ProcessOutput::Blocking(result) => println!("{}", serde_json::to_string(&result)?),
//! }
//! ```
//!
//! # Module Overview
//!
//! - [`config`]: Layered configuration (defaults, TOML, env, CLI)
//! - [`entities`]: Request entity and identifiers
//! - [`error`]: Error taxonomy
//! - [`generator`]: Request composition root
//! - [`pipeline`]: Consumer, response frames and task state
//! - [`queue`]: Task queue, stop flags and listener
//! - [`test_utils`]: Scripted runners and mock synthesizer
//! - [`tts`]: Text-to-speech publisher
//! - [`worker`]: Worker, pool and runner seams
//! - [`workflow`]: Workflow run lifecycle

#![warn(missing_docs)]
#![deny(clippy::all)]
#![warn(clippy::pedantic)]
#![allow(clippy::module_name_repetitions)]

pub mod config;
pub mod entities;
pub mod error;
pub mod generator;
pub mod pipeline;
pub mod queue;
pub mod test_utils;
pub mod tts;
pub mod worker;
pub mod workflow;

// Re-exports for convenience
pub use entities::{AppMode, GenerateEntity, InvokeFrom, TaskId, TraceContext, TtsSettings};
pub use error::{
    GenerateError, InvokeErrorKind, PipelineError, PoolError, QueueError, SynthesisError,
    WorkflowRunError,
};
pub use generator::AppGenerator;

// Queue exports
pub use queue::{
    AgentLog, ListenConfig, PublishFrom, QueueEvent, QueueListener, QueueManager, QueueMessage,
    RuntimeState, StopReason, StopRegistry, Usage,
};

// Worker exports
pub use worker::{
    EventEmitter, GenerationRunner, RequestResources, RunnerFactory, Worker, WorkerHandle,
    WorkerPool,
};

// Pipeline exports
pub use pipeline::{
    BlockingResponse, PipelineState, ProcessOutput, ResponseStream, StreamResponse, TaskPipeline,
    TaskState,
};

// Workflow exports
pub use workflow::{
    InMemoryWorkflowRunRepository, WorkflowCycleManager, WorkflowRun, WorkflowRunRepository,
    WorkflowRunStatus,
};

// TTS exports
pub use tts::{AudioChunk, AudioStatus, SpeechSynthesizer, TtsConfig, TtsPublisher};

// Config exports
pub use config::{
    default_config_path, load_config, load_config_from_path, ConfigError, ConfigOverrides,
    ConfigSource, PipelineConfigFile, PipelineToml,
};
