// JSON file backed run-state store

use super::{JobStateStore, StateDocument};
use crate::errors::StorageError;
use crate::models::RunRecord;
use async_trait::async_trait;
use std::path::{Path, PathBuf};
use tokio::sync::Mutex;
use tracing::{debug, info, instrument};

/// Run-state store persisted to a single JSON file.
///
/// The whole document is held in memory and rewritten on every record via a
/// temporary file and rename, so a crash never leaves a truncated file.
pub struct FileStateStore {
    path: PathBuf,
    state: Mutex<StateDocument>,
    history_limit: usize,
}

impl FileStateStore {
    /// Open the store, loading existing state if the file exists
    #[instrument(skip_all, fields(path = %path.as_ref().display()))]
    pub async fn open(path: impl AsRef<Path>, history_limit: usize) -> Result<Self, StorageError> {
        let path = path.as_ref().to_path_buf();

        let state = match tokio::fs::read(&path).await {
            Ok(bytes) => serde_json::from_slice::<StateDocument>(&bytes)?,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                debug!("State file does not exist yet, starting empty");
                StateDocument::default()
            }
            Err(e) => return Err(e.into()),
        };

        info!(jobs = state.jobs.len(), "Run state loaded");

        Ok(Self {
            path,
            state: Mutex::new(state),
            history_limit,
        })
    }

    async fn persist(&self, state: &StateDocument) -> Result<(), StorageError> {
        if let Some(parent) = self.path.parent().filter(|p| !p.as_os_str().is_empty()) {
            tokio::fs::create_dir_all(parent).await?;
        }
        let bytes = serde_json::to_vec_pretty(state)?;
        let tmp = self.path.with_extension("json.tmp");
        tokio::fs::write(&tmp, bytes).await?;
        tokio::fs::rename(&tmp, &self.path).await?;
        Ok(())
    }
}

#[async_trait]
impl JobStateStore for FileStateStore {
    async fn last_run(&self, job_id: &str) -> Result<Option<RunRecord>, StorageError> {
        Ok(self.state.lock().await.last_run(job_id))
    }

    #[instrument(skip(self, record), fields(job_id = %record.job_id, run_id = %record.run_id))]
    async fn record_run(&self, record: RunRecord) -> Result<(), StorageError> {
        let mut state = self.state.lock().await;
        state.push(record, self.history_limit);
        self.persist(&state).await?;
        debug!("Run record persisted");
        Ok(())
    }

    async fn history(&self, job_id: &str, limit: usize) -> Result<Vec<RunRecord>, StorageError> {
        Ok(self.state.lock().await.history(job_id, limit))
    }
}
