//! App Generator
//!
//! Composition root for one request: builds the queue, attaches the task
//! pipeline (with TTS when requested), submits the worker to the pool and
//! returns the pipeline output.

use std::sync::Arc;

use crate::config::PipelineConfigFile;
use crate::entities::{GenerateEntity, TaskId};
use crate::error::{PipelineError, PoolError};
use crate::pipeline::{ProcessOutput, TaskPipeline};
use crate::queue::{ListenConfig, QueueManager, StopRegistry};
use crate::tts::{SpeechSynthesizer, TtsConfig, TtsPublisher};
use crate::worker::{RunnerFactory, Worker, WorkerPool};
use crate::workflow::WorkflowRunRepository;

/// Entry point for generation requests
#[derive(Clone)]
pub struct AppGenerator {
    listen: ListenConfig,
    tts: TtsConfig,
    pool: WorkerPool,
    stop_registry: StopRegistry,
    repository: Arc<dyn WorkflowRunRepository>,
    factory: Arc<dyn RunnerFactory>,
    synthesizer: Option<Arc<dyn SpeechSynthesizer>>,
}

impl std::fmt::Debug for AppGenerator {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("AppGenerator")
            .field("listen", &self.listen)
            .field("pool", &self.pool)
            .field("tts", &self.synthesizer.is_some())
            .finish_non_exhaustive()
    }
}

impl AppGenerator {
    /// Create a generator from loaded configuration
    pub fn new(
        config: &PipelineConfigFile,
        repository: Arc<dyn WorkflowRunRepository>,
        factory: Arc<dyn RunnerFactory>,
        stop_registry: StopRegistry,
    ) -> Self {
        Self {
            listen: config.listen.clone(),
            tts: config.tts.clone(),
            pool: WorkerPool::new(config.max_workers),
            stop_registry,
            repository,
            factory,
            synthesizer: None,
        }
    }

    /// Enable TTS for requests that ask for it
    #[must_use]
    pub fn with_synthesizer(mut self, synthesizer: Arc<dyn SpeechSynthesizer>) -> Self {
        self.synthesizer = Some(synthesizer);
        self
    }

    /// Shared stop registry
    #[must_use]
    pub fn stop_registry(&self) -> &StopRegistry {
        &self.stop_registry
    }

    /// Worker pool
    #[must_use]
    pub fn pool(&self) -> &WorkerPool {
        &self.pool
    }

    /// External stop request from `user_id`
    ///
    /// Returns `true` if the flag was set by this call.
    pub fn stop(&self, task_id: &TaskId, user_id: &str) -> bool {
        self.stop_registry.set_stop_flag(task_id, user_id)
    }

    /// Run `entity` and return its blocking result or response stream
    ///
    /// # Errors
    ///
    /// Returns [`PipelineError::Pool`] if the task cannot be scheduled, plus
    /// every error of [`TaskPipeline::process`].
    pub async fn generate(
        &self,
        mut entity: GenerateEntity,
        stream: bool,
    ) -> Result<ProcessOutput, PipelineError> {
        if self.pool.is_active(&entity.task_id) {
            return Err(PoolError::DuplicateTask(entity.task_id).into());
        }

        entity.stream = stream;
        let entity = Arc::new(entity);
        let task_id = entity.task_id.clone();

        let queue = QueueManager::new(
            task_id.clone(),
            entity.user_id.clone(),
            self.stop_registry.clone(),
            self.listen.clone(),
        );
        let mut pipeline =
            TaskPipeline::new(Arc::clone(&entity), queue.clone(), Arc::clone(&self.repository))?;

        if stream && entity.tts_enabled() {
            if let Some(synthesizer) = &self.synthesizer {
                let voice = entity.tts.as_ref().and_then(|tts| tts.voice.clone());
                let publisher =
                    TtsPublisher::spawn(task_id.clone(), Arc::clone(synthesizer), voice, &self.tts);
                pipeline = pipeline.with_tts(publisher, self.tts.drain_timeout);
            } else {
                tracing::debug!(task_id = %task_id, "TTS requested but no synthesizer configured");
            }
        }

        let worker = Worker::new(Arc::clone(&entity), queue, Arc::clone(&self.factory));
        self.pool.submit(worker)?;

        tracing::debug!(
            task_id = %task_id,
            app_mode = entity.app_mode.as_str(),
            stream,
            "Generation scheduled"
        );
        pipeline.process(stream).await
    }

    /// Stop every running task and refuse new ones
    pub fn shutdown(&self) {
        self.pool.shutdown();
    }
}
