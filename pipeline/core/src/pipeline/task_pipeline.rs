//! Task Pipeline (consumer side)
//!
//! Sole reader of a task queue. Turns queue events into [`StreamResponse`]
//! frames, owns the [`TaskState`], persists the workflow run through the
//! [`WorkflowCycleManager`] and interleaves TTS audio.
//!
//! # Event mapping
//!
//! | Queue event | Frames |
//! |-------------|--------|
//! | `Ping` | `ping` |
//! | `TextChunk` | `text_chunk` (teed to TTS first) |
//! | `AgentLog` | `agent_log` |
//! | `WorkflowStarted` | `workflow_started` |
//! | `WorkflowSucceeded` / `PartialSuccess` / `Failed` | `workflow_finished` |
//! | `MessageEnd` | `workflow_finished` (if a run started), `message_end` |
//! | `Stop` | `workflow_finished` (if a run started), `message_end` (chat apps) |
//! | `Error` | `error` |
//!
//! # Audio
//!
//! Ready audio is drained without waiting before every primary frame. After
//! the terminal frame the pipeline waits for trailing audio until the
//! `Finish` chunk or the drain deadline, then emits one `message_audio_end`.
//! After an `error` frame it does not wait.

use std::collections::VecDeque;
use std::pin::Pin;
use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use futures::stream::{self, Stream};
use serde_json::{Map, Value};
use tokio::time::Instant;

use super::response::{
    AgentLogStreamResponse, BlockingResponse, ErrorStreamResponse, MessageAudioStreamResponse,
    MessageBlockingResponse, MessageEndStreamResponse, MessageMetadata, PingStreamResponse,
    StoppedBlockingResponse, StreamResponse, TextChunkData, TextChunkStreamResponse,
};
use super::state::{PipelineState, TaskState};
use crate::entities::GenerateEntity;
use crate::error::{GenerateError, PipelineError};
use crate::queue::{
    PublishFrom, QueueEvent, QueueListener, QueueManager, QueueMessage, RuntimeState, StopReason,
    Usage,
};
use crate::tts::{AudioChunk, AudioStatus, TtsPublisher};
use crate::workflow::{WorkflowCycleManager, WorkflowRunRepository, WorkflowRunStatus};

/// Lazy stream of response frames
pub type ResponseStream = Pin<Box<dyn Stream<Item = Result<StreamResponse, PipelineError>> + Send>>;

/// Result of [`TaskPipeline::process`]
pub enum ProcessOutput {
    /// Aggregate result
    Blocking(BlockingResponse),
    /// Frames in arrival order
    Streaming(ResponseStream),
}

impl std::fmt::Debug for ProcessOutput {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Blocking(response) => f.debug_tuple("Blocking").field(response).finish(),
            Self::Streaming(_) => f.write_str("Streaming(..)"),
        }
    }
}

#[derive(Clone, Copy, Debug)]
enum Phase {
    Primary,
    AudioDrain { deadline: Instant },
    Done,
}

/// Consumer for one task
pub struct TaskPipeline {
    entity: Arc<GenerateEntity>,
    queue: QueueManager,
    listener: QueueListener,
    cycle: WorkflowCycleManager,
    task_state: TaskState,
    tts: Option<TtsPublisher>,
    drain_timeout: Duration,
    audio_finished: bool,
    stop_reason: Option<StopReason>,
    pending: VecDeque<StreamResponse>,
    phase: Phase,
    completed: bool,
}

impl std::fmt::Debug for TaskPipeline {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("TaskPipeline")
            .field("task_id", &self.entity.task_id)
            .field("state", &self.task_state.state())
            .field("phase", &self.phase)
            .field("tts", &self.tts.is_some())
            .finish_non_exhaustive()
    }
}

impl TaskPipeline {
    /// Attach to `queue` as its only listener
    ///
    /// # Errors
    ///
    /// Returns [`PipelineError::Queue`] if the queue already has a listener.
    pub fn new(
        entity: Arc<GenerateEntity>,
        queue: QueueManager,
        repository: Arc<dyn WorkflowRunRepository>,
    ) -> Result<Self, PipelineError> {
        let listener = queue.listen()?;
        let cycle = WorkflowCycleManager::new(Arc::clone(&entity), repository);
        Ok(Self {
            entity,
            queue,
            listener,
            cycle,
            task_state: TaskState::new(),
            tts: None,
            drain_timeout: Duration::ZERO,
            audio_finished: false,
            stop_reason: None,
            pending: VecDeque::new(),
            phase: Phase::Primary,
            completed: false,
        })
    }

    /// Interleave audio from `publisher`, waiting up to `drain_timeout` for
    /// trailing chunks
    #[must_use]
    pub fn with_tts(mut self, publisher: TtsPublisher, drain_timeout: Duration) -> Self {
        self.tts = Some(publisher);
        self.drain_timeout = drain_timeout;
        self
    }

    /// Consume the queue
    ///
    /// Streaming yields every frame lazily. Blocking aggregates the run into
    /// one [`BlockingResponse`]; audio is never produced in blocking mode.
    ///
    /// # Errors
    ///
    /// In blocking mode returns [`PipelineError::Generate`] when the run
    /// ended with an error frame, plus any fatal pipeline error.
    pub async fn process(mut self, stream: bool) -> Result<ProcessOutput, PipelineError> {
        if stream {
            let frames = stream::unfold(self, |mut pipeline| async move {
                let frame = pipeline.next_response().await?;
                Some((frame, pipeline))
            });
            return Ok(ProcessOutput::Streaming(Box::pin(frames)));
        }

        self.tts = None;
        self.process_blocking().await.map(ProcessOutput::Blocking)
    }

    async fn process_blocking(mut self) -> Result<BlockingResponse, PipelineError> {
        while let Some(frame) = self.next_response().await {
            match frame? {
                StreamResponse::Error(_) => {
                    let error = self.task_state.last_error().cloned().unwrap_or_else(|| {
                        GenerateError::Unknown("error frame without error".to_string())
                    });
                    return Err(PipelineError::Generate(error));
                }
                StreamResponse::WorkflowFinished(finish)
                    if !self.entity.app_mode.is_conversational() =>
                {
                    return Ok(BlockingResponse::Workflow(finish.into()));
                }
                StreamResponse::MessageEnd(end) => {
                    return Ok(BlockingResponse::Message(MessageBlockingResponse {
                        task_id: end.task_id,
                        message_id: end.id,
                        conversation_id: end.conversation_id,
                        answer: self.task_state.answer.clone(),
                        usage: end.metadata.usage,
                        stopped: self.task_state.state() == PipelineState::Stopped,
                        created_at: Utc::now().timestamp(),
                    }));
                }
                _ => {}
            }
        }

        match self.stop_reason {
            Some(reason) if self.task_state.state() == PipelineState::Stopped => {
                Ok(BlockingResponse::Stopped(StoppedBlockingResponse {
                    task_id: self.entity.task_id.clone(),
                    message: reason.message().to_string(),
                }))
            }
            _ => Err(PipelineError::InvariantViolation(
                "queue ended without a terminal response".to_string(),
            )),
        }
    }

    /// Next frame, or `None` once the run and its audio are complete
    async fn next_response(&mut self) -> Option<Result<StreamResponse, PipelineError>> {
        loop {
            if let Some(frame) = self.pending.pop_front() {
                return Some(Ok(frame));
            }

            match self.phase {
                Phase::Primary => {
                    self.drain_ready_audio();
                    if !self.pending.is_empty() {
                        continue;
                    }
                    let Some(message) = self.listener.next().await else {
                        self.finish_primary(true);
                        continue;
                    };
                    if let Err(e) = self.handle_message(message).await {
                        tracing::error!(task_id = %self.entity.task_id, error = %e, "Task pipeline failed");
                        // The worker is still live; dropping the stream stops it.
                        self.end_audio(false);
                        return Some(Err(e));
                    }
                }
                Phase::AudioDrain { deadline } => {
                    let chunk = match self.tts.as_mut() {
                        Some(tts) => tts.next_audio_until(deadline).await,
                        None => None,
                    };
                    match chunk {
                        Some(AudioChunk {
                            audio,
                            status: AudioStatus::Pending,
                        }) => self.pending.push_back(self.audio_frame(&audio)),
                        _ => {
                            self.pending.push_back(self.audio_end_frame());
                            self.phase = Phase::Done;
                        }
                    }
                }
                Phase::Done => return None,
            }
        }
    }

    async fn handle_message(&mut self, message: QueueMessage) -> Result<(), PipelineError> {
        if matches!(message.event, QueueEvent::TextChunk { .. }) {
            if let Some(tts) = self.tts.as_mut() {
                tts.publish(Some(message.clone()));
            }
        }

        match message.event {
            QueueEvent::Ping => {
                self.pending.push_back(StreamResponse::Ping(PingStreamResponse {
                    task_id: self.entity.task_id.clone(),
                }));
            }
            QueueEvent::TextChunk {
                text,
                from_variable_selector,
            } => {
                self.task_state.append_answer(&text);
                self.pending.push_back(StreamResponse::TextChunk(TextChunkStreamResponse {
                    task_id: self.entity.task_id.clone(),
                    workflow_run_id: self.run_id(),
                    data: TextChunkData {
                        text,
                        from_variable_selector,
                    },
                }));
            }
            QueueEvent::AgentLog(log) => {
                self.pending.push_back(StreamResponse::AgentLog(AgentLogStreamResponse {
                    task_id: self.entity.task_id.clone(),
                    workflow_run_id: self.run_id(),
                    data: log,
                }));
            }
            QueueEvent::WorkflowStarted { runtime_state } => {
                if self.task_state.workflow_run_id().is_some() {
                    return Err(PipelineError::InvariantViolation(
                        "workflow started twice".to_string(),
                    ));
                }
                let run = self.cycle.handle_workflow_run_start(&runtime_state).await?;
                self.task_state.start_run(run.id.clone(), runtime_state)?;
                self.pending
                    .push_back(self.cycle.workflow_start_to_stream_response(&run));
            }
            QueueEvent::WorkflowSucceeded { outputs } => {
                let (run_id, runtime_state) = self.require_run("workflow_succeeded")?;
                let run = self
                    .cycle
                    .handle_workflow_run_success(&run_id, &runtime_state, outputs)
                    .await?;
                self.task_state.transition(PipelineState::Succeeded)?;
                self.pending
                    .push_back(self.cycle.workflow_finish_to_stream_response(&run));
                self.finish_primary(true);
            }
            QueueEvent::WorkflowPartialSuccess {
                outputs,
                exceptions_count,
            } => {
                let (run_id, runtime_state) = self.require_run("workflow_partial_success")?;
                let run = self
                    .cycle
                    .handle_workflow_run_partial_success(
                        &run_id,
                        &runtime_state,
                        outputs,
                        exceptions_count,
                    )
                    .await?;
                self.task_state.transition(PipelineState::PartialSucceeded)?;
                self.pending
                    .push_back(self.cycle.workflow_finish_to_stream_response(&run));
                self.finish_primary(true);
            }
            QueueEvent::WorkflowFailed {
                error,
                exceptions_count,
            } => {
                let (run_id, runtime_state) = self.require_run("workflow_failed")?;
                let run = self
                    .cycle
                    .handle_workflow_run_failed(
                        &run_id,
                        &runtime_state,
                        WorkflowRunStatus::Failed,
                        error,
                        exceptions_count,
                    )
                    .await?;
                self.task_state.transition(PipelineState::Failed)?;
                self.pending
                    .push_back(self.cycle.workflow_finish_to_stream_response(&run));
                self.finish_primary(true);
            }
            QueueEvent::MessageEnd { usage } => {
                if let Some((run_id, runtime_state)) = self.started_run() {
                    let mut outputs = Map::new();
                    outputs.insert(
                        "answer".to_string(),
                        Value::String(self.task_state.answer.clone()),
                    );
                    let run = self
                        .cycle
                        .handle_workflow_run_success(&run_id, &runtime_state, outputs)
                        .await?;
                    self.pending
                        .push_back(self.cycle.workflow_finish_to_stream_response(&run));
                }
                self.task_state.transition(PipelineState::Succeeded)?;
                self.pending.push_back(self.message_end_frame(usage));
                self.finish_primary(true);
            }
            QueueEvent::Stop(reason) => {
                self.stop_reason = Some(reason);
                if let Some((run_id, runtime_state)) = self.started_run() {
                    let run = self
                        .cycle
                        .handle_workflow_run_failed(
                            &run_id,
                            &runtime_state,
                            WorkflowRunStatus::Stopped,
                            reason.message(),
                            0,
                        )
                        .await?;
                    self.pending
                        .push_back(self.cycle.workflow_finish_to_stream_response(&run));
                }
                self.task_state.transition(PipelineState::Stopped)?;
                if self.entity.app_mode.is_conversational() {
                    self.pending.push_back(self.message_end_frame(Usage::default()));
                }
                tracing::info!(
                    task_id = %self.entity.task_id,
                    reason = ?reason,
                    answer_chars = self.task_state.answer.chars().count(),
                    "Task stopped"
                );
                self.finish_primary(true);
            }
            QueueEvent::Error(error) => {
                if let Some((run_id, runtime_state)) = self.started_run() {
                    self.cycle
                        .handle_workflow_run_failed(
                            &run_id,
                            &runtime_state,
                            WorkflowRunStatus::Failed,
                            error.to_string(),
                            0,
                        )
                        .await?;
                }
                self.task_state.transition(PipelineState::Failed)?;
                self.pending
                    .push_back(StreamResponse::Error(ErrorStreamResponse::from_error(
                        self.entity.task_id.clone(),
                        self.run_id(),
                        &error,
                    )));
                self.task_state.set_error(error);
                self.finish_primary(false);
            }
        }
        Ok(())
    }

    fn require_run(&self, event: &str) -> Result<(String, Arc<RuntimeState>), PipelineError> {
        self.started_run().ok_or_else(|| {
            PipelineError::InvariantViolation(format!("{event} arrived before workflow_started"))
        })
    }

    fn started_run(&self) -> Option<(String, Arc<RuntimeState>)> {
        self.task_state
            .run()
            .map(|(run_id, state)| (run_id.to_string(), Arc::clone(state)))
    }

    fn run_id(&self) -> Option<String> {
        self.task_state.workflow_run_id().map(str::to_string)
    }

    fn finish_primary(&mut self, wait_for_audio: bool) {
        self.completed = true;
        self.end_audio(wait_for_audio);
    }

    /// Flush TTS and schedule the single `message_audio_end`
    fn end_audio(&mut self, wait_for_audio: bool) {
        let Some(tts) = self.tts.as_mut() else {
            self.phase = Phase::Done;
            return;
        };

        tts.publish(None);
        if wait_for_audio && !self.audio_finished {
            self.phase = Phase::AudioDrain {
                deadline: Instant::now() + self.drain_timeout,
            };
        } else {
            self.pending.push_back(self.audio_end_frame());
            self.phase = Phase::Done;
        }
    }

    fn drain_ready_audio(&mut self) {
        let Some(tts) = self.tts.as_mut() else {
            return;
        };
        while let Some(chunk) = tts.try_next_audio() {
            if chunk.status == AudioStatus::Finish {
                self.audio_finished = true;
                break;
            }
            self.pending
                .push_back(StreamResponse::MessageAudio(MessageAudioStreamResponse::encode(
                    self.entity.task_id.clone(),
                    &chunk.audio,
                )));
        }
    }

    fn message_end_frame(&self, usage: Usage) -> StreamResponse {
        StreamResponse::MessageEnd(MessageEndStreamResponse {
            task_id: self.entity.task_id.clone(),
            workflow_run_id: self.run_id(),
            id: self.entity.message_id.clone(),
            conversation_id: self.entity.conversation_id.clone(),
            metadata: MessageMetadata { usage },
        })
    }

    fn audio_frame(&self, audio: &[u8]) -> StreamResponse {
        StreamResponse::MessageAudio(MessageAudioStreamResponse::encode(
            self.entity.task_id.clone(),
            audio,
        ))
    }

    fn audio_end_frame(&self) -> StreamResponse {
        StreamResponse::MessageAudioEnd(MessageAudioStreamResponse::encode(
            self.entity.task_id.clone(),
            &[],
        ))
    }
}

impl Drop for TaskPipeline {
    fn drop(&mut self) {
        if !self.completed
            && self
                .queue
                .stop(PublishFrom::Pipeline, StopReason::ClientDisconnected)
        {
            tracing::info!(task_id = %self.entity.task_id, "Response dropped before completion");
        }
    }
}
