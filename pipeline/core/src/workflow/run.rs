//! Workflow run entity and its status machine

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

use crate::error::WorkflowRunError;

/// Lifecycle status of a workflow run
///
/// `Running` moves to exactly one terminal status; terminal statuses never
/// move again.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum WorkflowRunStatus {
    /// Executing
    #[serde(rename = "running")]
    Running,
    /// Finished successfully
    #[serde(rename = "succeeded")]
    Succeeded,
    /// Finished with handled node failures
    #[serde(rename = "partial-succeeded")]
    PartialSucceeded,
    /// Failed
    #[serde(rename = "failed")]
    Failed,
    /// Stopped by the user, a timeout or a disconnect
    #[serde(rename = "stopped")]
    Stopped,
}

impl WorkflowRunStatus {
    /// Wire name
    #[must_use]
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Running => "running",
            Self::Succeeded => "succeeded",
            Self::PartialSucceeded => "partial-succeeded",
            Self::Failed => "failed",
            Self::Stopped => "stopped",
        }
    }

    /// Whether the run is finalized
    #[must_use]
    pub fn is_terminal(&self) -> bool {
        !matches!(self, Self::Running)
    }
}

impl std::fmt::Display for WorkflowRunStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Persisted record of one workflow execution
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct WorkflowRun {
    /// Run id
    pub id: String,
    /// Tenant id
    pub tenant_id: String,
    /// App id
    pub app_id: String,
    /// Workflow id
    pub workflow_id: String,
    /// Per tenant+app sequence number
    pub sequence_number: u64,
    /// Inputs merged with `sys.*` variables
    pub inputs: Map<String, Value>,
    /// Current status
    pub status: WorkflowRunStatus,
    /// Outputs on success
    pub outputs: Option<Map<String, Value>>,
    /// Error on failure or stop
    pub error: Option<String>,
    /// Tokens consumed
    pub total_tokens: u64,
    /// Nodes executed
    pub total_steps: u64,
    /// Handled node exceptions
    pub exceptions_count: u32,
    /// User that triggered the run
    pub created_by: String,
    /// Start time
    pub created_at: DateTime<Utc>,
    /// End time
    pub finished_at: Option<DateTime<Utc>>,
    /// Run duration in seconds
    pub elapsed_time: f64,
}

impl WorkflowRun {
    /// Move to `to`, rejecting anything but `Running` to a terminal status
    ///
    /// # Errors
    ///
    /// Returns [`WorkflowRunError::InvalidTransition`] if the run is already
    /// finalized or `to` is `Running`.
    pub fn transition(&mut self, to: WorkflowRunStatus) -> Result<(), WorkflowRunError> {
        if self.status.is_terminal() || !to.is_terminal() {
            return Err(WorkflowRunError::InvalidTransition {
                from: self.status,
                to,
            });
        }
        self.status = to;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn running() -> WorkflowRun {
        WorkflowRun {
            id: "run-1".into(),
            tenant_id: "t".into(),
            app_id: "a".into(),
            workflow_id: "w".into(),
            sequence_number: 1,
            inputs: Map::new(),
            status: WorkflowRunStatus::Running,
            outputs: None,
            error: None,
            total_tokens: 0,
            total_steps: 0,
            exceptions_count: 0,
            created_by: "u".into(),
            created_at: Utc::now(),
            finished_at: None,
            elapsed_time: 0.0,
        }
    }

    #[test]
    fn test_running_to_each_terminal() {
        for to in [
            WorkflowRunStatus::Succeeded,
            WorkflowRunStatus::PartialSucceeded,
            WorkflowRunStatus::Failed,
            WorkflowRunStatus::Stopped,
        ] {
            let mut run = running();
            assert!(run.transition(to).is_ok());
            assert_eq!(run.status, to);
        }
    }

    #[test]
    fn test_second_transition_rejected() {
        let mut run = running();
        run.transition(WorkflowRunStatus::Succeeded).unwrap();
        assert_eq!(
            run.transition(WorkflowRunStatus::Failed),
            Err(WorkflowRunError::InvalidTransition {
                from: WorkflowRunStatus::Succeeded,
                to: WorkflowRunStatus::Failed,
            })
        );
        assert_eq!(run.status, WorkflowRunStatus::Succeeded);
    }

    #[test]
    fn test_cannot_return_to_running() {
        let mut run = running();
        assert!(run.transition(WorkflowRunStatus::Running).is_err());
    }

    #[test]
    fn test_status_wire_names() {
        assert_eq!(
            serde_json::to_string(&WorkflowRunStatus::PartialSucceeded).unwrap(),
            "\"partial-succeeded\""
        );
        assert_eq!(WorkflowRunStatus::Stopped.to_string(), "stopped");
    }
}
