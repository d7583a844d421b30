//! End-to-end tests: AppGenerator → WorkerPool → QueueManager → TaskPipeline
//!
//! Every test drives a scripted runner through the full request path and
//! inspects the frames or the blocking result the caller would see.

use std::sync::Arc;
use std::time::Duration;

use futures::StreamExt;
use pretty_assertions::assert_eq;
use serde_json::{json, Map, Value};
use tokio::sync::Notify;

use pipeline_core::test_utils::{MockSynthesizer, ScriptStep, ScriptedRunnerFactory};
use pipeline_core::{
    AgentLog, AppGenerator, AppMode, BlockingResponse, GenerateEntity, GenerateError, InMemoryWorkflowRunRepository,
    ListenConfig, PipelineConfigFile, PipelineError, PoolError, ProcessOutput, StopRegistry,
    StreamResponse, TtsConfig, TtsSettings, WorkflowRunStatus,
};

// =============================================================================
// Test Infrastructure
// =============================================================================

struct Harness {
    generator: AppGenerator,
    factory: Arc<ScriptedRunnerFactory>,
    repository: Arc<InMemoryWorkflowRunRepository>,
}

impl Harness {
    fn new(steps: Vec<ScriptStep>) -> Self {
        Self::with_listen(steps, ListenConfig::for_testing())
    }

    fn with_listen(steps: Vec<ScriptStep>, listen: ListenConfig) -> Self {
        let mut config = PipelineConfigFile::default();
        config.listen = listen;
        config.tts = TtsConfig::for_testing();

        let factory = Arc::new(ScriptedRunnerFactory::new(steps));
        let repository = Arc::new(InMemoryWorkflowRunRepository::new());
        let generator = AppGenerator::new(
            &config,
            repository.clone(),
            factory.clone(),
            StopRegistry::new(),
        )
        .with_synthesizer(Arc::new(MockSynthesizer::new()));

        Self {
            generator,
            factory,
            repository,
        }
    }

    async fn blocking(&self, entity: GenerateEntity) -> Result<BlockingResponse, PipelineError> {
        match self.generator.generate(entity, false).await? {
            ProcessOutput::Blocking(response) => Ok(response),
            ProcessOutput::Streaming(_) => panic!("expected a blocking result"),
        }
    }

    async fn streaming(&self, entity: GenerateEntity) -> Vec<StreamResponse> {
        match self.generator.generate(entity, true).await.unwrap() {
            ProcessOutput::Streaming(stream) => stream.map(Result::unwrap).collect().await,
            ProcessOutput::Blocking(_) => panic!("expected a stream"),
        }
    }

    /// Wait until every worker has deregistered
    async fn workers_idle(&self) {
        tokio::time::timeout(Duration::from_secs(2), async {
            while self.generator.pool().active_count() > 0 {
                tokio::task::yield_now().await;
            }
        })
        .await
        .expect("workers did not finish");
    }
}

fn workflow() -> GenerateEntity {
    GenerateEntity::new("tenant", "app", "user", AppMode::Workflow).with_query("what is it?")
}

fn chat() -> GenerateEntity {
    GenerateEntity::new("tenant", "app", "user", AppMode::Chat)
}

fn outputs(value: Value) -> Map<String, Value> {
    value.as_object().cloned().unwrap_or_default()
}

fn names(frames: &[StreamResponse]) -> Vec<&'static str> {
    frames
        .iter()
        .filter(|f| !matches!(f, StreamResponse::Ping(_)))
        .map(StreamResponse::event_name)
        .collect()
}

fn is_terminal(frame: &StreamResponse) -> bool {
    matches!(
        frame,
        StreamResponse::Error(_) | StreamResponse::WorkflowFinished(_) | StreamResponse::MessageEnd(_)
    )
}

// =============================================================================
// Blocking Mode
// =============================================================================

#[tokio::test]
async fn test_blocking_workflow_returns_outputs() {
    let h = Harness::new(vec![
        ScriptStep::WorkflowStarted,
        ScriptStep::Tokens(12),
        ScriptStep::NodeStep,
        ScriptStep::NodeStep,
        ScriptStep::WorkflowSucceeded(outputs(json!({"result": 42}))),
    ]);

    let BlockingResponse::Workflow(result) = h.blocking(workflow()).await.unwrap() else {
        panic!("expected a workflow result");
    };

    assert_eq!(result.data.status, WorkflowRunStatus::Succeeded);
    assert_eq!(result.data.outputs, Some(outputs(json!({"result": 42}))));
    assert_eq!(result.data.total_tokens, 12);
    assert_eq!(result.data.total_steps, 2);
    assert_eq!(result.workflow_run_id, result.data.id);

    let run = &h.repository.runs()[0];
    assert_eq!(run.status, WorkflowRunStatus::Succeeded);
    assert_eq!(run.inputs.get("sys.query"), Some(&json!("what is it?")));
}

#[tokio::test]
async fn test_blocking_chat_answer_is_concatenation() {
    let deltas = ["The ", "answer ", "is ", "forty", "-two."];
    let mut steps: Vec<_> = deltas.iter().map(|d| ScriptStep::Text((*d).into())).collect();
    steps.push(ScriptStep::Tokens(5));
    steps.push(ScriptStep::MessageEnd);
    let h = Harness::new(steps);

    let BlockingResponse::Message(message) = h.blocking(chat()).await.unwrap() else {
        panic!("expected a message result");
    };
    assert_eq!(message.answer, deltas.concat());
    assert!(!message.stopped);
    assert!(message.message_id.is_some());
}

#[tokio::test]
async fn test_blocking_error_is_generate_error() {
    let h = Harness::new(vec![ScriptStep::Fail(GenerateError::Validation(
        "missing input `city`".into(),
    ))]);

    let err = h.blocking(workflow()).await.unwrap_err();
    assert!(matches!(
        err,
        PipelineError::Generate(GenerateError::Validation(_))
    ));
}

#[tokio::test]
async fn test_blocking_stop_is_clean() {
    let h = Harness::new(vec![ScriptStep::WorkflowStarted, ScriptStep::WaitForStop]);
    let entity = workflow();
    let task_id = entity.task_id.clone();

    let generator = h.generator.clone();
    let stopper = tokio::spawn(async move {
        while !generator.stop(&task_id, "user") {
            tokio::task::yield_now().await;
        }
    });

    let response = h.blocking(entity).await.unwrap();
    stopper.await.unwrap();
    assert_eq!(response.status(), "stopped");
}

#[tokio::test]
async fn test_terminal_before_start_is_fatal() {
    let h = Harness::new(vec![ScriptStep::WorkflowSucceeded(Map::new())]);

    let err = h.blocking(workflow()).await.unwrap_err();
    assert!(matches!(err, PipelineError::InvariantViolation(_)));
    assert!(h.repository.is_empty());
}

// =============================================================================
// Streaming Mode
// =============================================================================

#[tokio::test]
async fn test_streaming_order_and_run_id() {
    let h = Harness::new(vec![
        ScriptStep::WorkflowStarted,
        ScriptStep::Text("a".into()),
        ScriptStep::Text("b".into()),
        ScriptStep::WorkflowSucceeded(Map::new()),
    ]);

    let frames: Vec<_> = h
        .streaming(workflow())
        .await
        .into_iter()
        .filter(|f| !matches!(f, StreamResponse::Ping(_)))
        .collect();

    assert_eq!(
        names(&frames),
        vec!["workflow_started", "text_chunk", "text_chunk", "workflow_finished"]
    );
    let texts: Vec<_> = frames
        .iter()
        .filter_map(|f| match f {
            StreamResponse::TextChunk(chunk) => Some(chunk.data.text.as_str()),
            _ => None,
        })
        .collect();
    assert_eq!(texts, vec!["a", "b"]);

    let run_id = frames[0].workflow_run_id().map(str::to_string);
    assert!(run_id.is_some());
    for frame in &frames {
        assert_eq!(frame.workflow_run_id().map(str::to_string), run_id);
        assert_eq!(frame.task_id(), frames[0].task_id());
    }
}

#[tokio::test]
async fn test_exactly_one_terminal_frame() {
    let h = Harness::new(vec![
        ScriptStep::WorkflowStarted,
        ScriptStep::WorkflowSucceeded(Map::new()),
        // Rejected: the run already ended.
        ScriptStep::Text("late".into()),
        ScriptStep::WorkflowFailed("late failure".into()),
    ]);

    let frames = h.streaming(workflow()).await;
    assert_eq!(frames.iter().filter(|f| is_terminal(f)).count(), 1);
    assert!(!names(&frames).contains(&"text_chunk"));
    h.workers_idle().await;
    assert_eq!(h.repository.runs()[0].status, WorkflowRunStatus::Succeeded);
}

#[tokio::test]
async fn test_stream_stop_finalizes_run_as_stopped() {
    let h = Harness::new(vec![
        ScriptStep::WorkflowStarted,
        ScriptStep::Text("partial".into()),
        ScriptStep::WaitForStop,
    ]);
    let entity = workflow();
    let task_id = entity.task_id.clone();

    let ProcessOutput::Streaming(mut stream) = h.generator.generate(entity, true).await.unwrap()
    else {
        panic!("expected a stream");
    };

    let mut frames = Vec::new();
    while let Some(frame) = stream.next().await {
        let frame = frame.unwrap();
        if matches!(frame, StreamResponse::TextChunk(_)) {
            assert!(!h.generator.stop(&task_id, "someone-else"));
            assert!(h.generator.stop(&task_id, "user"));
        }
        frames.push(frame);
    }

    assert_eq!(
        names(&frames),
        vec!["workflow_started", "text_chunk", "workflow_finished"]
    );
    let Some(StreamResponse::WorkflowFinished(finish)) = frames.last() else {
        panic!("expected workflow_finished");
    };
    assert_eq!(finish.data.status, WorkflowRunStatus::Stopped);
    assert_eq!(finish.data.error.as_deref(), Some("Stopped by user."));
}

#[tokio::test]
async fn test_agent_log_is_streamed_with_run_id() {
    let log = AgentLog {
        id: "log-7".into(),
        label: "web_search".into(),
        status: "success".into(),
        data: json!({"query": "rust", "results": 5}),
    };
    let h = Harness::new(vec![
        ScriptStep::WorkflowStarted,
        ScriptStep::AgentLog(log.clone()),
        ScriptStep::WorkflowSucceeded(Map::new()),
    ]);

    let frames = h.streaming(workflow()).await;
    assert_eq!(
        names(&frames),
        vec!["workflow_started", "agent_log", "workflow_finished"]
    );

    let frames: Vec<_> = frames
        .into_iter()
        .filter(|f| !matches!(f, StreamResponse::Ping(_)))
        .collect();
    let StreamResponse::AgentLog(frame) = &frames[1] else {
        panic!("expected agent_log");
    };
    assert_eq!(frame.data, log);
    assert_eq!(frame.workflow_run_id.as_deref(), frames[0].workflow_run_id());
    assert!(frame.workflow_run_id.is_some());
}

#[tokio::test]
async fn test_panic_becomes_error_frame() {
    let h = Harness::new(vec![
        ScriptStep::Text("x".into()),
        ScriptStep::Panic("engine exploded".into()),
    ]);

    let frames = h.streaming(chat()).await;
    assert_eq!(names(&frames), vec!["text_chunk", "error"]);
    let Some(StreamResponse::Error(error)) = frames.last() else {
        panic!("expected an error frame");
    };
    assert_eq!(error.code, "internal_server_error");
    assert_eq!(error.status, 500);
    assert!(!error.message.contains("engine exploded"));
}

#[tokio::test]
async fn test_dropped_stream_stops_worker() {
    let h = Harness::new(vec![ScriptStep::Text("hello".into()), ScriptStep::WaitForStop]);

    let ProcessOutput::Streaming(mut stream) = h.generator.generate(chat(), true).await.unwrap()
    else {
        panic!("expected a stream");
    };
    loop {
        let frame = stream.next().await.unwrap().unwrap();
        if matches!(frame, StreamResponse::TextChunk(_)) {
            break;
        }
    }
    drop(stream);

    h.workers_idle().await;
    assert_eq!(h.factory.resources().opened(), 1);
    assert_eq!(h.factory.resources().released(), 1);
    assert!(h.generator.stop_registry().is_empty());
}

#[tokio::test(start_paused = true)]
async fn test_idle_queue_pings_once_per_interval() {
    let gate = Arc::new(Notify::new());
    let h = Harness::with_listen(
        vec![
            ScriptStep::Text("thinking".into()),
            ScriptStep::WaitFor(gate.clone()),
            ScriptStep::MessageEnd,
        ],
        ListenConfig::default(),
    );

    let ProcessOutput::Streaming(mut stream) = h.generator.generate(chat(), true).await.unwrap()
    else {
        panic!("expected a stream");
    };

    let mut events = Vec::new();
    let mut pings = 0;
    while let Some(frame) = stream.next().await {
        let frame = frame.unwrap();
        if matches!(frame, StreamResponse::Ping(_)) {
            pings += 1;
            if pings == 3 {
                gate.notify_one();
            }
        }
        events.push(frame.event_name());
    }

    assert_eq!(
        events,
        vec!["text_chunk", "ping", "ping", "ping", "message_end"]
    );
}

// =============================================================================
// Text-to-Speech
// =============================================================================

#[tokio::test]
async fn test_tts_enabled_ends_with_one_audio_end() {
    let h = Harness::new(vec![
        ScriptStep::Text("Hello there. ".into()),
        ScriptStep::Text("How are you? ".into()),
        ScriptStep::Text("Fine.".into()),
        ScriptStep::MessageEnd,
    ]);
    let entity = chat().with_tts(TtsSettings {
        auto_play: true,
        voice: Some("alloy".into()),
    });

    let names = names(&h.streaming(entity).await);
    assert_eq!(names.iter().filter(|n| **n == "message_audio_end").count(), 1);
    assert_eq!(names.last(), Some(&"message_audio_end"));
    assert!(names.contains(&"message_audio"));

    let end = names.iter().position(|n| *n == "message_end").unwrap();
    assert!(names[end + 1..].iter().all(|n| n.starts_with("message_audio")));
}

#[tokio::test]
async fn test_tts_audio_end_follows_fatal_error() {
    let h = Harness::new(vec![
        ScriptStep::Text("Hello there. How are you? ".into()),
        ScriptStep::WorkflowSucceeded(Map::new()),
    ]);
    let entity = workflow().with_tts(TtsSettings {
        auto_play: true,
        voice: None,
    });

    let ProcessOutput::Streaming(stream) = h.generator.generate(entity, true).await.unwrap() else {
        panic!("expected a stream");
    };
    let frames: Vec<_> = stream.collect().await;

    let errors: Vec<_> = frames.iter().filter_map(|f| f.as_ref().err()).collect();
    assert_eq!(errors.len(), 1);
    assert!(matches!(errors[0], PipelineError::InvariantViolation(_)));

    let audio_ends = frames
        .iter()
        .filter(|f| matches!(f, Ok(StreamResponse::MessageAudioEnd(_))))
        .count();
    assert_eq!(audio_ends, 1);
    assert!(matches!(frames.last(), Some(Ok(StreamResponse::MessageAudioEnd(_)))));
}

#[tokio::test]
async fn test_tts_disabled_produces_no_audio() {
    let h = Harness::new(vec![
        ScriptStep::Text("Hello there. How are you?".into()),
        ScriptStep::MessageEnd,
    ]);

    let names = names(&h.streaming(chat()).await);
    assert!(names.iter().all(|n| !n.starts_with("message_audio")));
    assert_eq!(names, vec!["text_chunk", "message_end"]);
}

// =============================================================================
// Resources and Scheduling
// =============================================================================

#[tokio::test]
async fn test_resources_released_on_every_path() {
    let scripts = vec![
        vec![ScriptStep::Text("ok".into()), ScriptStep::MessageEnd],
        vec![ScriptStep::Fail(GenerateError::Unknown("db gone".into()))],
        vec![ScriptStep::Panic("boom".into())],
        vec![ScriptStep::Text("no terminal".into())],
    ];

    for steps in scripts {
        let h = Harness::new(steps);
        let _ = h.streaming(chat()).await;
        h.workers_idle().await;
        assert_eq!(h.factory.resources().opened(), 1);
        assert_eq!(h.factory.resources().released(), 1);
    }
}

#[tokio::test]
async fn test_resources_released_on_stop() {
    let h = Harness::new(vec![ScriptStep::WaitForStop]);
    let entity = chat();
    let task_id = entity.task_id.clone();

    let generator = h.generator.clone();
    let stopper = tokio::spawn(async move {
        while !generator.stop(&task_id, "user") {
            tokio::task::yield_now().await;
        }
    });

    let BlockingResponse::Message(message) = h.blocking(entity).await.unwrap() else {
        panic!("expected a message result");
    };
    stopper.await.unwrap();
    assert!(message.stopped);

    h.workers_idle().await;
    assert_eq!(h.factory.resources().released(), h.factory.resources().opened());
}

#[tokio::test]
async fn test_duplicate_task_rejected() {
    let gate = Arc::new(Notify::new());
    let h = Harness::new(vec![ScriptStep::WaitFor(gate.clone()), ScriptStep::MessageEnd]);
    let entity = chat();
    let duplicate = entity.clone();

    let ProcessOutput::Streaming(stream) = h.generator.generate(entity, true).await.unwrap() else {
        panic!("expected a stream");
    };

    let err = h.generator.generate(duplicate, true).await.unwrap_err();
    assert!(matches!(
        err,
        PipelineError::Pool(PoolError::DuplicateTask(_))
    ));

    gate.notify_one();
    let frames: Vec<_> = stream.map(Result::unwrap).collect().await;
    assert_eq!(names(&frames), vec!["message_end"]);
}

#[tokio::test]
async fn test_reused_task_id_stays_stoppable_after_old_stream_drops() {
    let gate = Arc::new(Notify::new());
    let h = Harness::new(vec![
        ScriptStep::Text("a".into()),
        ScriptStep::WaitFor(gate.clone()),
        ScriptStep::MessageEnd,
    ]);
    let first = chat();
    let task_id = first.task_id.clone();

    // First run finishes its worker but nobody reads its stream.
    gate.notify_one();
    let ProcessOutput::Streaming(old_stream) = h.generator.generate(first, true).await.unwrap()
    else {
        panic!("expected a stream");
    };
    h.workers_idle().await;

    let second = chat().with_task_id(task_id.clone());
    let ProcessOutput::Streaming(mut stream) = h.generator.generate(second, true).await.unwrap()
    else {
        panic!("expected a stream");
    };
    drop(old_stream);

    let mut frames = Vec::new();
    while let Some(frame) = stream.next().await {
        let frame = frame.unwrap();
        if matches!(frame, StreamResponse::TextChunk(_)) {
            assert_eq!(h.generator.stop_registry().len(), 1);
            assert!(h.generator.stop(&task_id, "user"));
        }
        frames.push(frame);
    }
    assert_eq!(names(&frames), vec!["text_chunk", "message_end"]);
    let Some(StreamResponse::MessageEnd(_)) = frames.last() else {
        panic!("expected message_end");
    };

    drop(stream);
    h.workers_idle().await;
    assert!(h.generator.stop_registry().is_empty());
}

#[tokio::test]
async fn test_sequence_numbers_increase_per_app() {
    let h = Harness::new(vec![
        ScriptStep::WorkflowStarted,
        ScriptStep::WorkflowPartialSuccess(Map::new(), 2),
    ]);

    let mut sequences = Vec::new();
    for _ in 0..3 {
        let BlockingResponse::Workflow(result) = h.blocking(workflow()).await.unwrap() else {
            panic!("expected a workflow result");
        };
        assert_eq!(result.data.status, WorkflowRunStatus::PartialSucceeded);
        assert_eq!(result.data.exceptions_count, 2);
        sequences.push(result.data.sequence_number);
    }
    assert_eq!(sequences, vec![1, 2, 3]);
}

// =============================================================================
// Elapsed Time
// =============================================================================

#[tokio::test(start_paused = true)]
async fn test_elapsed_time_is_seconds_on_every_terminal_path() {
    let gate = Arc::new(Notify::new());
    let scripts = vec![
        ScriptStep::WorkflowSucceeded(Map::new()),
        ScriptStep::WorkflowPartialSuccess(Map::new(), 1),
        ScriptStep::WorkflowFailed("node crashed".into()),
    ];

    for terminal in scripts {
        let h = Harness::with_listen(
            vec![
                ScriptStep::WorkflowStarted,
                ScriptStep::WaitFor(gate.clone()),
                terminal,
            ],
            ListenConfig::default(),
        );

        let ProcessOutput::Streaming(mut stream) =
            h.generator.generate(workflow(), true).await.unwrap()
        else {
            panic!("expected a stream");
        };

        let mut finish = None;
        while let Some(frame) = stream.next().await {
            match frame.unwrap() {
                // One idle interval (10s) passes before the run may finish.
                StreamResponse::Ping(_) => gate.notify_one(),
                StreamResponse::WorkflowFinished(f) => finish = Some(f),
                _ => {}
            }
        }

        let finish = finish.expect("workflow_finished frame");
        let elapsed = finish.data.elapsed_time;
        assert!((10.0..11.0).contains(&elapsed), "elapsed_time {elapsed} is not in seconds");
        assert!(finish.data.finished_at >= finish.data.created_at);
    }
}
