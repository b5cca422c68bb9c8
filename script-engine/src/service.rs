//! The facade used by the API layer to submit computations and poll their status.
use std::sync::Arc;

use chrono::Utc;
use futures::future::join_all;

use crate::{
    artifacts::ResultArtifactStore,
    backend::{self, Backend, BackendError, Query},
    executor::Executor,
    executors::{CustomizedComputationExecutor, DefaultComputationExecutor},
    job::JobId,
    model::{CustomizedComputationRequest, DefaultComputationRequest, JobKind},
    progress::ProgressStore,
    status::{CustomizedJobStatus, DefaultJobStatus, ExternalStatus, JobOverviewEntry, StatusAssembler},
    RuntimeError,
};

/// Enqueues computation jobs and reports their status.
///
/// Status queries never fail: a job that cannot be found or loaded is reported with an error
/// and without a status.
pub struct ScriptEngine<B> {
    backend: B,
    status: StatusAssembler,
    max_attempts: Option<u16>,
}

impl<B> ScriptEngine<B>
where
    B: Backend + Send + Sync,
{
    pub fn new(
        backend: B,
        progress: Arc<dyn ProgressStore>,
        artifacts: ResultArtifactStore,
    ) -> Self {
        Self {
            backend,
            status: StatusAssembler::new(progress, artifacts),
            max_attempts: None,
        }
    }

    /// Override the number of attempts of every job enqueued by this engine.
    pub fn with_max_attempts(self, max_attempts: u16) -> Self {
        Self {
            max_attempts: Some(max_attempts),
            ..self
        }
    }

    pub async fn post_default_indicator_computation(
        &self,
        request: DefaultComputationRequest,
    ) -> Result<JobId, RuntimeError> {
        let builder = DefaultComputationExecutor::job(request);
        let builder = match self.max_attempts {
            Some(max_attempts) => builder.with_max_attempts(max_attempts),
            None => builder,
        };
        builder.enqueue_to_backend(&self.backend).await
    }

    pub async fn post_customizable_indicator_computation(
        &self,
        request: CustomizedComputationRequest,
    ) -> Result<JobId, RuntimeError> {
        let builder = CustomizedComputationExecutor::job(request);
        let builder = match self.max_attempts {
            Some(max_attempts) => builder.with_max_attempts(max_attempts),
            None => builder,
        };
        builder.enqueue_to_backend(&self.backend).await
    }

    pub async fn get_default_indicator_computation(&self, job_id: JobId) -> DefaultJobStatus {
        match self.find_job(job_id, DefaultComputationExecutor::NAME).await {
            Ok(Some(job)) => self.status.default(&job, Utc::now()).await,
            Ok(None) => DefaultJobStatus::missing(job_id, None),
            Err(error) => DefaultJobStatus::missing(job_id, Some(lookup_error(job_id, &error))),
        }
    }

    pub async fn get_customizable_indicator_computation(
        &self,
        job_id: JobId,
    ) -> CustomizedJobStatus {
        match self
            .find_job(job_id, CustomizedComputationExecutor::NAME)
            .await
        {
            Ok(Some(job)) => self.status.customized(&job, Utc::now()).await,
            Ok(None) => CustomizedJobStatus::missing(job_id, None),
            Err(error) => {
                CustomizedJobStatus::missing(job_id, Some(lookup_error(job_id, &error)))
            }
        }
    }

    pub async fn get_default_job_overview(&self) -> Vec<JobOverviewEntry> {
        self.overview(DefaultComputationExecutor::NAME, JobKind::Default)
            .await
    }

    pub async fn get_customizable_job_overview(&self) -> Vec<JobOverviewEntry> {
        self.overview(CustomizedComputationExecutor::NAME, JobKind::Customized)
            .await
    }

    async fn find_job(
        &self,
        job_id: JobId,
        executor: &str,
    ) -> Result<Option<backend::Job>, BackendError> {
        let mut jobs = self
            .backend
            .query(Query::IdEquals(job_id).for_executor(executor))
            .await?;
        Ok(jobs.pop())
    }

    /// All jobs of the executor, one backend query per status bucket, ordered by id.
    async fn overview(&self, executor: &str, kind: JobKind) -> Vec<JobOverviewEntry> {
        let now = Utc::now();
        let buckets = join_all(ExternalStatus::ALL.iter().map(|bucket| async move {
            self.backend
                .query(bucket.query(now).for_executor(executor))
                .await
                .inspect_err(|error| {
                    tracing::warn!(?error, ?bucket, executor, "Failed to load job overview bucket")
                })
                .unwrap_or_default()
        }))
        .await;

        let mut jobs: Vec<backend::Job> = buckets.into_iter().flatten().collect();
        jobs.sort_by_key(|job| job.id);
        // a job changing status between the bucket queries shows up in two of them
        jobs.dedup_by_key(|job| job.id);

        let mut entries = Vec::with_capacity(jobs.len());
        for job in &jobs {
            entries.push(self.status.overview_entry(job, kind, now).await);
        }
        entries
    }
}

fn lookup_error(job_id: JobId, error: &BackendError) -> String {
    tracing::warn!(?error, %job_id, "Failed to load job");
    format!("Failed to load job with id '{job_id}': {error}")
}
