// Run-state storage
//
// Keeps each job's run history, newest first, so the scheduler can recover
// the last run time after a restart.

pub mod file;

pub use file::FileStateStore;

use crate::errors::StorageError;
use crate::models::RunRecord;
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::collections::{HashMap, VecDeque};
use tokio::sync::RwLock;

/// Default number of records kept per job
pub const DEFAULT_HISTORY_LIMIT: usize = 50;

/// Run-state store trait
#[async_trait]
pub trait JobStateStore: Send + Sync {
    /// Most recent record that counts as a run (skips are ignored)
    async fn last_run(&self, job_id: &str) -> Result<Option<RunRecord>, StorageError>;

    /// Append a record to the job's history
    async fn record_run(&self, record: RunRecord) -> Result<(), StorageError>;

    /// Up to `limit` records for the job, newest first
    async fn history(&self, job_id: &str, limit: usize) -> Result<Vec<RunRecord>, StorageError>;
}

/// Serialised form shared by the store implementations
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct StateDocument {
    #[serde(default)]
    pub jobs: HashMap<String, VecDeque<RunRecord>>,
}

impl StateDocument {
    pub(crate) fn push(&mut self, record: RunRecord, limit: usize) {
        let entries = self.jobs.entry(record.job_id.clone()).or_default();
        entries.push_front(record);
        entries.truncate(limit.max(1));
    }

    pub(crate) fn last_run(&self, job_id: &str) -> Option<RunRecord> {
        self.jobs
            .get(job_id)?
            .iter()
            .find(|r| r.counts_as_run())
            .cloned()
    }

    pub(crate) fn history(&self, job_id: &str, limit: usize) -> Vec<RunRecord> {
        self.jobs
            .get(job_id)
            .map(|entries| entries.iter().take(limit).cloned().collect())
            .unwrap_or_default()
    }
}

/// In-memory store
pub struct MemoryStateStore {
    state: RwLock<StateDocument>,
    history_limit: usize,
}

impl MemoryStateStore {
    pub fn new() -> Self {
        Self::with_history_limit(DEFAULT_HISTORY_LIMIT)
    }

    pub fn with_history_limit(history_limit: usize) -> Self {
        Self {
            state: RwLock::new(StateDocument::default()),
            history_limit,
        }
    }
}

impl Default for MemoryStateStore {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl JobStateStore for MemoryStateStore {
    async fn last_run(&self, job_id: &str) -> Result<Option<RunRecord>, StorageError> {
        Ok(self.state.read().await.last_run(job_id))
    }

    async fn record_run(&self, record: RunRecord) -> Result<(), StorageError> {
        self.state.write().await.push(record, self.history_limit);
        Ok(())
    }

    async fn history(&self, job_id: &str, limit: usize) -> Result<Vec<RunRecord>, StorageError> {
        Ok(self.state.read().await.history(job_id, limit))
    }
}
