//! Workflow run lifecycle: entity, persistence and the cycle manager

mod cycle_manager;
mod repository;
mod run;

pub use cycle_manager::WorkflowCycleManager;
pub use repository::{InMemoryWorkflowRunRepository, WorkflowRunRepository};
pub use run::{WorkflowRun, WorkflowRunStatus};
