//! Workflow Cycle Manager
//!
//! Translates workflow lifecycle events into a persisted [`WorkflowRun`] and
//! the matching `workflow_started` / `workflow_finished` frames.
//!
//! Elapsed time is always reported in seconds (`f64`), measured from the
//! monotonic start instant held by the run's [`RuntimeState`].

use std::sync::Arc;

use chrono::Utc;
use serde_json::{Map, Value};

use super::repository::WorkflowRunRepository;
use super::run::{WorkflowRun, WorkflowRunStatus};
use crate::entities::GenerateEntity;
use crate::error::WorkflowRunError;
use crate::pipeline::{
    StreamResponse, WorkflowFinishData, WorkflowFinishStreamResponse, WorkflowStartData,
    WorkflowStartStreamResponse,
};
use crate::queue::RuntimeState;

/// Creates and finalizes workflow runs for one request
pub struct WorkflowCycleManager {
    entity: Arc<GenerateEntity>,
    repository: Arc<dyn WorkflowRunRepository>,
}

impl WorkflowCycleManager {
    /// Create a manager for `entity`
    pub fn new(entity: Arc<GenerateEntity>, repository: Arc<dyn WorkflowRunRepository>) -> Self {
        Self { entity, repository }
    }

    /// Create and persist a RUNNING run
    ///
    /// # Errors
    ///
    /// Returns an error if the repository fails.
    pub async fn handle_workflow_run_start(
        &self,
        runtime_state: &RuntimeState,
    ) -> Result<WorkflowRun, WorkflowRunError> {
        let entity = &self.entity;
        let run_id = uuid::Uuid::new_v4().to_string();
        let sequence_number = self
            .repository
            .next_sequence_number(&entity.tenant_id, &entity.app_id)
            .await?;

        let run = WorkflowRun {
            inputs: self.merged_inputs(&run_id),
            id: run_id,
            tenant_id: entity.tenant_id.clone(),
            app_id: entity.app_id.clone(),
            workflow_id: entity.workflow_id.clone().unwrap_or_default(),
            sequence_number,
            status: WorkflowRunStatus::Running,
            outputs: None,
            error: None,
            total_tokens: 0,
            total_steps: 0,
            exceptions_count: 0,
            created_by: entity.user_id.clone(),
            created_at: runtime_state.started_at_utc(),
            finished_at: None,
            elapsed_time: 0.0,
        };

        self.repository.save(&run).await?;
        tracing::debug!(
            task_id = %entity.task_id,
            workflow_run_id = %run.id,
            sequence_number,
            "Workflow run created"
        );
        Ok(run)
    }

    /// Finalize a run as SUCCEEDED
    ///
    /// # Errors
    ///
    /// Returns an error if the run is missing, already finalized, or cannot
    /// be saved.
    pub async fn handle_workflow_run_success(
        &self,
        run_id: &str,
        runtime_state: &RuntimeState,
        outputs: Map<String, Value>,
    ) -> Result<WorkflowRun, WorkflowRunError> {
        self.finalize(run_id, runtime_state, WorkflowRunStatus::Succeeded, |run| {
            run.outputs = Some(outputs);
        })
        .await
    }

    /// Finalize a run as PARTIAL_SUCCEEDED
    ///
    /// # Errors
    ///
    /// See [`WorkflowCycleManager::handle_workflow_run_success`].
    pub async fn handle_workflow_run_partial_success(
        &self,
        run_id: &str,
        runtime_state: &RuntimeState,
        outputs: Map<String, Value>,
        exceptions_count: u32,
    ) -> Result<WorkflowRun, WorkflowRunError> {
        self.finalize(
            run_id,
            runtime_state,
            WorkflowRunStatus::PartialSucceeded,
            |run| {
                run.outputs = Some(outputs);
                run.exceptions_count = exceptions_count;
            },
        )
        .await
    }

    /// Finalize a run as FAILED or STOPPED
    ///
    /// # Errors
    ///
    /// See [`WorkflowCycleManager::handle_workflow_run_success`].
    pub async fn handle_workflow_run_failed(
        &self,
        run_id: &str,
        runtime_state: &RuntimeState,
        status: WorkflowRunStatus,
        error: impl Into<String>,
        exceptions_count: u32,
    ) -> Result<WorkflowRun, WorkflowRunError> {
        let error = error.into();
        self.finalize(run_id, runtime_state, status, |run| {
            run.error = Some(error);
            run.exceptions_count = exceptions_count;
        })
        .await
    }

    /// Build the `workflow_started` frame
    #[must_use]
    pub fn workflow_start_to_stream_response(&self, run: &WorkflowRun) -> StreamResponse {
        StreamResponse::WorkflowStarted(WorkflowStartStreamResponse {
            task_id: self.entity.task_id.clone(),
            workflow_run_id: run.id.clone(),
            data: WorkflowStartData {
                id: run.id.clone(),
                workflow_id: run.workflow_id.clone(),
                sequence_number: run.sequence_number,
                inputs: run.inputs.clone(),
                created_at: run.created_at.timestamp(),
            },
        })
    }

    /// Build the `workflow_finished` frame
    #[must_use]
    pub fn workflow_finish_to_stream_response(&self, run: &WorkflowRun) -> StreamResponse {
        StreamResponse::WorkflowFinished(WorkflowFinishStreamResponse {
            task_id: self.entity.task_id.clone(),
            workflow_run_id: run.id.clone(),
            data: WorkflowFinishData {
                id: run.id.clone(),
                workflow_id: run.workflow_id.clone(),
                sequence_number: run.sequence_number,
                status: run.status,
                outputs: run.outputs.clone(),
                error: run.error.clone(),
                elapsed_time: run.elapsed_time,
                total_tokens: run.total_tokens,
                total_steps: run.total_steps,
                exceptions_count: run.exceptions_count,
                created_at: run.created_at.timestamp(),
                finished_at: run
                    .finished_at
                    .map_or_else(|| Utc::now().timestamp(), |t| t.timestamp()),
            },
        })
    }

    async fn finalize(
        &self,
        run_id: &str,
        runtime_state: &RuntimeState,
        status: WorkflowRunStatus,
        apply: impl FnOnce(&mut WorkflowRun) + Send,
    ) -> Result<WorkflowRun, WorkflowRunError> {
        let mut run = self.repository.get(run_id).await?;
        run.transition(status)?;

        run.elapsed_time = runtime_state.elapsed_secs();
        run.total_tokens = runtime_state.total_tokens();
        run.total_steps = runtime_state.node_run_steps();
        run.finished_at = Some(Utc::now());
        apply(&mut run);

        self.repository.save(&run).await?;
        tracing::info!(
            task_id = %self.entity.task_id,
            workflow_run_id = %run.id,
            status = %run.status,
            elapsed_time = run.elapsed_time,
            "Workflow run finalized"
        );
        Ok(run)
    }

    fn merged_inputs(&self, run_id: &str) -> Map<String, Value> {
        let entity = &self.entity;
        let mut inputs = entity.inputs.clone();
        inputs.insert(
            "sys.query".to_string(),
            Value::String(entity.query.clone().unwrap_or_default()),
        );
        inputs.insert("sys.user_id".to_string(), Value::String(entity.user_id.clone()));
        inputs.insert("sys.app_id".to_string(), Value::String(entity.app_id.clone()));
        if let Some(workflow_id) = &entity.workflow_id {
            inputs.insert("sys.workflow_id".to_string(), Value::String(workflow_id.clone()));
        }
        inputs.insert("sys.workflow_run_id".to_string(), Value::String(run_id.to_string()));
        inputs
    }
}
