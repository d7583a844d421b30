//! Pipeline CLI - Headless Generation Runner
//!
//! Drives a scripted generation through the full task pipeline and prints
//! what a client would receive: server-sent events in streaming mode, or one
//! JSON document in blocking mode. Logs go to stderr so stdout carries only
//! protocol output.
//!
//! # Usage
//!
//! ```bash
//! # Stream a workflow run
//! pipeline-cli --mode workflow --text "Hello there. How are you?"
//!
//! # Blocking chat answer
//! pipeline-cli --mode chat --blocking
//!
//! # Interleave synthesized audio
//! pipeline-cli --mode chat --tts --voice alloy
//!
//! # Stop after two chunks, or fail with a provider error
//! pipeline-cli --stop-after 2
//! pipeline-cli --fail rate-limit
//!
//! # Verbose logging
//! RUST_LOG=debug pipeline-cli
//! ```

use std::path::PathBuf;
use std::sync::Arc;

use anyhow::{Context, Result};
use clap::{Parser, ValueEnum};
use futures::StreamExt;
use serde_json::{json, Map, Value};
use tokio::io::AsyncWriteExt;
use tracing::{info, warn};

use pipeline_core::test_utils::{MockSynthesizer, ScriptStep, ScriptedRunnerFactory};
use pipeline_core::{
    load_config_from_path, AppGenerator, AppMode, ConfigOverrides, GenerateEntity, GenerateError,
    InMemoryWorkflowRunRepository, InvokeErrorKind, ProcessOutput, StopRegistry, StreamResponse,
    TtsSettings,
};

/// Pipeline CLI - run a scripted generation through the task pipeline
#[derive(Parser, Debug)]
#[command(name = "pipeline-cli")]
#[command(author, version, about, long_about = None)]
struct Args {
    /// Configuration file path
    #[arg(short = 'c', long, env = "PIPELINE_CONFIG", value_name = "FILE")]
    config: Option<PathBuf>,

    /// Log level (trace, debug, info, warn, error)
    #[arg(short = 'l', long, env = "PIPELINE_LOG_LEVEL", default_value = "info")]
    log_level: String,

    /// App mode to simulate
    #[arg(short = 'm', long, value_enum, default_value_t = Mode::Workflow)]
    mode: Mode,

    /// Aggregate the run into one JSON document instead of streaming
    #[arg(short = 'b', long)]
    blocking: bool,

    /// Answer text; streamed word by word
    #[arg(short = 't', long, default_value = "Hello there. This answer was streamed by a scripted runner.")]
    text: String,

    /// User query
    #[arg(short = 'q', long, default_value = "Say hello")]
    query: String,

    /// Synthesize audio for the answer (streaming only)
    #[arg(long)]
    tts: bool,

    /// Voice passed to the synthesizer
    #[arg(long, requires = "tts")]
    voice: Option<String>,

    /// Stop the run after this many text chunks (blocking runs stop on start)
    #[arg(long, value_name = "CHUNKS")]
    stop_after: Option<usize>,

    /// Fail the run instead of finishing it
    #[arg(long, value_enum)]
    fail: Option<Failure>,

    /// Idle ping interval override (milliseconds)
    #[arg(long, value_name = "MS")]
    idle_ping_ms: Option<u64>,

    /// Max execution time override (seconds)
    #[arg(long, value_name = "SECS")]
    max_execution_secs: Option<u64>,
}

#[derive(Clone, Copy, Debug, ValueEnum)]
enum Mode {
    Chat,
    AgentChat,
    Workflow,
    AdvancedChat,
}

impl From<Mode> for AppMode {
    fn from(mode: Mode) -> Self {
        match mode {
            Mode::Chat => AppMode::Chat,
            Mode::AgentChat => AppMode::AgentChat,
            Mode::Workflow => AppMode::Workflow,
            Mode::AdvancedChat => AppMode::AdvancedChat,
        }
    }
}

#[derive(Clone, Copy, Debug, ValueEnum)]
enum Failure {
    Validation,
    Authorization,
    RateLimit,
    Unknown,
    Panic,
}

impl Failure {
    fn step(self) -> ScriptStep {
        match self {
            Self::Validation => {
                ScriptStep::Fail(GenerateError::Validation("query must not be empty".into()))
            }
            Self::Authorization => {
                ScriptStep::Fail(GenerateError::Authorization("provider rejected key".into()))
            }
            Self::RateLimit => ScriptStep::Fail(GenerateError::invoke(
                InvokeErrorKind::RateLimit,
                "Rate limit reached, retry later.",
            )),
            Self::Unknown => ScriptStep::Fail(GenerateError::Unknown("engine state corrupted".into())),
            Self::Panic => ScriptStep::Panic("scripted runner panicked".into()),
        }
    }
}

/// Initialize logging with the specified level
fn init_logging(level: &str) {
    let filter = tracing_subscriber::EnvFilter::try_from_default_env().unwrap_or_else(|_| {
        tracing_subscriber::EnvFilter::new(format!("pipeline_cli={level},pipeline_core={level}"))
    });

    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_target(true)
        .with_writer(std::io::stderr)
        .init();
}

fn word_count(args: &Args) -> usize {
    args.text.split_inclusive(' ').count()
}

/// Number of text chunks emitted before the run is stopped
fn stop_point(args: &Args) -> Option<usize> {
    args.stop_after.map(|chunks| chunks.min(word_count(args)))
}

/// Build the runner script for the requested run
fn script(args: &Args, mode: AppMode) -> Vec<ScriptStep> {
    let mut steps = Vec::new();
    if mode.is_workflow() {
        steps.push(ScriptStep::WorkflowStarted);
    }

    let stop_at = stop_point(args);
    for (index, word) in args.text.split_inclusive(' ').enumerate() {
        if stop_at == Some(index) {
            steps.push(ScriptStep::WaitForStop);
        }
        steps.push(ScriptStep::Text(word.to_string()));
        steps.push(ScriptStep::Tokens(1));
        if mode.is_workflow() {
            steps.push(ScriptStep::NodeStep);
        }
    }
    if stop_at == Some(word_count(args)) {
        steps.push(ScriptStep::WaitForStop);
    }

    if let Some(failure) = args.fail {
        steps.push(failure.step());
    } else if mode.is_conversational() {
        steps.push(ScriptStep::MessageEnd);
    } else {
        let mut outputs = Map::new();
        outputs.insert("answer".to_string(), Value::String(args.text.clone()));
        steps.push(ScriptStep::WorkflowSucceeded(outputs));
    }
    steps
}

#[tokio::main]
async fn main() -> Result<()> {
    let args = Args::parse();
    init_logging(&args.log_level);

    info!("Pipeline CLI starting");
    info!("Version: {}", env!("CARGO_PKG_VERSION"));

    let mut config = load_config_from_path(args.config.clone().or_else(pipeline_core::default_config_path))
        .context("Failed to load pipeline configuration")?;
    let mut overrides = ConfigOverrides::new();
    if let Some(ms) = args.idle_ping_ms {
        overrides = overrides.with_idle_ping_interval_ms(ms);
    }
    if let Some(secs) = args.max_execution_secs {
        overrides = overrides.with_max_execution_time_secs(secs);
    }
    overrides.apply(&mut config);
    config
        .validate()
        .context("Invalid configuration after CLI overrides")?;
    info!(source = ?config.source(), max_workers = config.max_workers, "Configuration loaded");

    let mode = AppMode::from(args.mode);
    let factory = Arc::new(ScriptedRunnerFactory::new(script(&args, mode)));
    let repository = Arc::new(InMemoryWorkflowRunRepository::new());
    let generator = AppGenerator::new(&config, repository, factory.clone(), StopRegistry::new())
        .with_synthesizer(Arc::new(MockSynthesizer::new()));

    let mut entity = GenerateEntity::new("local-tenant", "local-app", "local-user", mode)
        .with_query(args.query.clone());
    if args.tts {
        entity = entity.with_tts(TtsSettings {
            auto_play: true,
            voice: args.voice.clone(),
        });
    }
    let task_id = entity.task_id.clone();
    let user_id = entity.user_id.clone();

    {
        let generator = generator.clone();
        tokio::spawn(async move {
            if tokio::signal::ctrl_c().await.is_ok() {
                warn!("Interrupted, shutting down workers");
                generator.shutdown();
            }
        });
    }

    let stop_at = stop_point(&args);
    if stop_at.is_some() && (args.blocking || stop_at == Some(0)) {
        let generator = generator.clone();
        let task_id = task_id.clone();
        let user_id = user_id.clone();
        tokio::spawn(async move {
            while !generator.stop(&task_id, &user_id) {
                tokio::task::yield_now().await;
            }
        });
    }

    let output = generator
        .generate(entity, !args.blocking)
        .await
        .with_context(|| format!("Generation {task_id} failed"))?;

    let mut stdout = tokio::io::stdout();
    match output {
        ProcessOutput::Blocking(response) => {
            let mut document = serde_json::to_string_pretty(&response)
                .context("Failed to serialize blocking response")?;
            document.push('\n');
            stdout.write_all(document.as_bytes()).await?;
            stdout.flush().await?;
        }
        ProcessOutput::Streaming(mut frames) => {
            let mut text_chunks = 0;
            while let Some(frame) = frames.next().await {
                let frame = frame.with_context(|| format!("Pipeline for {task_id} failed"))?;
                stdout.write_all(frame.to_sse().as_bytes()).await?;
                stdout.flush().await?;

                if matches!(frame, StreamResponse::TextChunk(_)) {
                    text_chunks += 1;
                    if stop_at == Some(text_chunks) {
                        generator.stop(&task_id, &user_id);
                    }
                }
            }
        }
    }

    info!(
        task_id = %task_id,
        resources_released = factory.resources().released(),
        summary = %json!({"mode": mode.as_str(), "blocking": args.blocking}),
        "Pipeline CLI finished"
    );
    Ok(())
}
