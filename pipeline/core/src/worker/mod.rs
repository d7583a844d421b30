//! Worker (producer side)
//!
//! A [`Worker`] drives one generation on the [`WorkerPool`]. It opens the
//! request resources, runs the runner, maps the outcome to at most one
//! terminal event and releases the resources on every exit path.
//!
//! | Runner outcome | Published |
//! |----------------|-----------|
//! | terminal event emitted, `Ok` | nothing more |
//! | `Ok` without terminal event | `Error(Unknown)` |
//! | `Err(Stopped)` | nothing (the listener publishes `Stop`) |
//! | `Err(Authorization)` | `Error`, generic message |
//! | `Err(Validation)` / `Err(Invoke)` | `Error`, logged at warn |
//! | `Err(Unknown)` | `Error`, logged at error |
//!
//! Once the stop flag is set no `Error` is published: a stopped task ends
//! with `Stop`.

mod pool;
mod runner;

use std::sync::Arc;

use crate::entities::{GenerateEntity, TaskId, TraceContext};
use crate::error::{GenerateError, INVALID_API_KEY_MESSAGE};
use crate::queue::{PublishFrom, QueueManager};

pub use pool::{WorkerHandle, WorkerPool};
pub use runner::{EventEmitter, GenerationRunner, RequestResources, RunnerFactory};

use runner::ResourceGuard;

/// Message of the error published when a runner forgets its terminal event
pub const MISSING_TERMINAL_MESSAGE: &str = "generation finished without a terminal event";

/// One generation job
pub struct Worker {
    entity: Arc<GenerateEntity>,
    queue: QueueManager,
    factory: Arc<dyn RunnerFactory>,
}

impl std::fmt::Debug for Worker {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Worker")
            .field("task_id", &self.entity.task_id)
            .finish_non_exhaustive()
    }
}

impl Worker {
    /// Create a worker publishing onto `queue`
    pub fn new(
        entity: Arc<GenerateEntity>,
        queue: QueueManager,
        factory: Arc<dyn RunnerFactory>,
    ) -> Self {
        Self {
            entity,
            queue,
            factory,
        }
    }

    /// Task this worker generates
    #[must_use]
    pub fn task_id(&self) -> &TaskId {
        &self.entity.task_id
    }

    /// Queue this worker publishes onto
    #[must_use]
    pub fn queue(&self) -> &QueueManager {
        &self.queue
    }

    /// Run the generation to completion
    pub async fn run(self) {
        let context = self.entity.trace_context();
        let task_id = self.entity.task_id.clone();
        tracing::info!(
            task_id = %task_id,
            tenant_id = %context.tenant_id,
            trace_id = %context.trace_id,
            app_mode = self.entity.app_mode.as_str(),
            "Worker started"
        );

        let emitter = EventEmitter::new(self.queue.clone());
        let result = execute(&self.entity, &context, self.factory.as_ref(), &emitter).await;
        finish(&task_id, &context, &self.queue, &emitter, result);

        tracing::info!(task_id = %task_id, "Worker finished");
    }
}

async fn execute(
    entity: &GenerateEntity,
    context: &TraceContext,
    factory: &dyn RunnerFactory,
    emitter: &EventEmitter,
) -> Result<(), GenerateError> {
    let resources = factory.open_resources(context).await?;
    let _guard = ResourceGuard::new(entity.task_id.clone(), resources);

    let mut runner = factory.create_runner(entity, context)?;
    runner.run(emitter).await
}

fn finish(
    task_id: &TaskId,
    context: &TraceContext,
    queue: &QueueManager,
    emitter: &EventEmitter,
    result: Result<(), GenerateError>,
) {
    let error = match result {
        Ok(()) if emitter.terminal_sent() => return,
        Ok(()) => {
            tracing::error!(task_id = %task_id, "Runner returned without a terminal event");
            GenerateError::Unknown(MISSING_TERMINAL_MESSAGE.to_string())
        }
        Err(GenerateError::Stopped) => {
            tracing::info!(task_id = %task_id, "Generation stopped");
            return;
        }
        Err(GenerateError::Authorization(detail)) => {
            tracing::warn!(task_id = %task_id, detail = %detail, "Provider rejected credentials");
            GenerateError::Authorization(INVALID_API_KEY_MESSAGE.to_string())
        }
        Err(e @ (GenerateError::Validation(_) | GenerateError::Invoke { .. })) => {
            tracing::warn!(task_id = %task_id, kind = e.kind_name(), error = %e, "Generation failed");
            e
        }
        Err(e @ GenerateError::Unknown(_)) => {
            tracing::error!(
                task_id = %task_id,
                tenant_id = %context.tenant_id,
                trace_id = %context.trace_id,
                error = %e,
                "Unknown error during generation"
            );
            e
        }
    };

    if queue.is_stopped() {
        tracing::debug!(task_id = %task_id, kind = error.kind_name(), "Task stopped, error not published");
        return;
    }

    if let Err(e) = queue.publish_error(error, PublishFrom::Worker) {
        tracing::debug!(task_id = %task_id, error = %e, "Error event not published");
    }
}
