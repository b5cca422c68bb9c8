//! Progress of running computations, one percentage per job and queue.
use std::{
    collections::HashMap,
    io::ErrorKind,
    path::PathBuf,
    sync::{Arc, RwLock},
};

use async_trait::async_trait;
use thiserror::Error;

use crate::{job::JobId, model::JobKind};

#[derive(Debug, Error)]
pub enum ProgressError {
    #[error("No progress recorded for {kind} job {job_id}")]
    NotFound { job_id: JobId, kind: JobKind },
    #[error("Invalid progress value {0:?}")]
    Invalid(String),
    #[error("Progress store in bad state")]
    BadState,
    #[error("Failed to access progress file: {0}")]
    Io(#[from] std::io::Error),
}

#[async_trait]
pub trait ProgressStore: Send + Sync {
    /// Record the progress of a job, values above 100 are clamped.
    async fn set(&self, job_id: JobId, kind: JobKind, progress: u8) -> Result<(), ProgressError>;

    /// The last progress recorded for the job of the given kind.
    async fn get(&self, job_id: JobId, kind: JobKind) -> Result<u8, ProgressError>;
}

/// Reports the progress of a single job, logging instead of failing when the store errors.
#[derive(Clone)]
pub struct ProgressReporter {
    store: Arc<dyn ProgressStore>,
    job_id: JobId,
    kind: JobKind,
}

impl ProgressReporter {
    pub fn new(store: Arc<dyn ProgressStore>, job_id: JobId, kind: JobKind) -> Self {
        Self {
            store,
            job_id,
            kind,
        }
    }

    pub async fn report(&self, progress: u8) {
        let _ = self
            .store
            .set(self.job_id, self.kind, progress)
            .await
            .inspect_err(|error| {
                tracing::warn!(?error, job_id = %self.job_id, kind = %self.kind, "Failed to record progress {progress}")
            });
    }
}

#[derive(Debug, Default)]
pub struct InMemoryProgressStore {
    progress: RwLock<HashMap<(JobId, JobKind), u8>>,
}

impl InMemoryProgressStore {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl ProgressStore for InMemoryProgressStore {
    async fn set(&self, job_id: JobId, kind: JobKind, progress: u8) -> Result<(), ProgressError> {
        self.progress
            .write()
            .map_err(|_| ProgressError::BadState)?
            .insert((job_id, kind), progress.min(100));
        Ok(())
    }

    async fn get(&self, job_id: JobId, kind: JobKind) -> Result<u8, ProgressError> {
        self.progress
            .read()
            .map_err(|_| ProgressError::BadState)?
            .get(&(job_id, kind))
            .copied()
            .ok_or(ProgressError::NotFound { job_id, kind })
    }
}

/// Stores each progress value in its own file, `progress_<kind>_<job id>`, so that it can be
/// shared between processes on the same host.
#[derive(Debug, Clone)]
pub struct FileProgressStore {
    directory: PathBuf,
}

impl FileProgressStore {
    pub fn new(directory: impl Into<PathBuf>) -> Self {
        Self {
            directory: directory.into(),
        }
    }

    fn path(&self, job_id: JobId, kind: JobKind) -> PathBuf {
        self.directory.join(format!("progress_{kind}_{job_id}"))
    }
}

#[async_trait]
impl ProgressStore for FileProgressStore {
    async fn set(&self, job_id: JobId, kind: JobKind, progress: u8) -> Result<(), ProgressError> {
        tokio::fs::create_dir_all(&self.directory).await?;
        tokio::fs::write(self.path(job_id, kind), progress.min(100).to_string()).await?;
        Ok(())
    }

    async fn get(&self, job_id: JobId, kind: JobKind) -> Result<u8, ProgressError> {
        let content = match tokio::fs::read_to_string(self.path(job_id, kind)).await {
            Ok(content) => content,
            Err(error) if error.kind() == ErrorKind::NotFound => {
                return Err(ProgressError::NotFound { job_id, kind })
            }
            Err(error) => return Err(error.into()),
        };
        content
            .trim()
            .parse()
            .map_err(|_| ProgressError::Invalid(content))
    }
}
