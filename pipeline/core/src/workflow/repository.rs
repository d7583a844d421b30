//! Workflow run persistence

use std::collections::HashMap;

use async_trait::async_trait;
use parking_lot::RwLock;

use super::run::WorkflowRun;
use crate::error::WorkflowRunError;

/// Storage for workflow runs
#[async_trait]
pub trait WorkflowRunRepository: Send + Sync {
    /// Next sequence number for runs of this tenant and app, starting at 1
    async fn next_sequence_number(
        &self,
        tenant_id: &str,
        app_id: &str,
    ) -> Result<u64, WorkflowRunError>;

    /// Insert or replace a run
    async fn save(&self, run: &WorkflowRun) -> Result<(), WorkflowRunError>;

    /// Load a run by id
    async fn get(&self, run_id: &str) -> Result<WorkflowRun, WorkflowRunError>;
}

#[derive(Debug, Default)]
struct Store {
    runs: HashMap<String, WorkflowRun>,
    sequences: HashMap<(String, String), u64>,
}

/// In-process repository
#[derive(Debug, Default)]
pub struct InMemoryWorkflowRunRepository {
    store: RwLock<Store>,
}

impl InMemoryWorkflowRunRepository {
    /// Create an empty repository
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Number of stored runs
    #[must_use]
    pub fn len(&self) -> usize {
        self.store.read().runs.len()
    }

    /// Whether no run is stored
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.store.read().runs.is_empty()
    }

    /// All stored runs, in no particular order
    #[must_use]
    pub fn runs(&self) -> Vec<WorkflowRun> {
        self.store.read().runs.values().cloned().collect()
    }
}

#[async_trait]
impl WorkflowRunRepository for InMemoryWorkflowRunRepository {
    async fn next_sequence_number(
        &self,
        tenant_id: &str,
        app_id: &str,
    ) -> Result<u64, WorkflowRunError> {
        let mut store = self.store.write();
        let next = store
            .sequences
            .entry((tenant_id.to_string(), app_id.to_string()))
            .or_insert(0);
        *next += 1;
        Ok(*next)
    }

    async fn save(&self, run: &WorkflowRun) -> Result<(), WorkflowRunError> {
        self.store.write().runs.insert(run.id.clone(), run.clone());
        Ok(())
    }

    async fn get(&self, run_id: &str) -> Result<WorkflowRun, WorkflowRunError> {
        self.store
            .read()
            .runs
            .get(run_id)
            .cloned()
            .ok_or_else(|| WorkflowRunError::NotFound(run_id.to_string()))
    }
}
