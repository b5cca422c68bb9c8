use std::{sync::Arc, time::Duration};

use chrono::{TimeDelta, Utc};
use tokio::task::JoinError;
use tracing::{instrument, Instrument};

use crate::{
    backend::{self, Backend},
    executor::{ExecutionError, ExecutionResult, Executor},
};

use super::{ErrorType, Job, JobId};

/// Runs the jobs claimed for a single executor and records their outcome on the backend.
pub(crate) struct JobRunner<B, E>
where
    B: Backend,
    E: Executor,
{
    backend: B,
    executor: Arc<E>,
    max_attempts: Option<u16>,
}

impl<B, E> JobRunner<B, E>
where
    B: Backend + Send + Sync + 'static,
    E: Executor,
{
    pub(crate) fn new(backend: B, executor: Arc<E>) -> Self {
        Self {
            backend,
            executor,
            max_attempts: None,
        }
    }

    /// Use `max_attempts` in place of the attempts the jobs were enqueued with.
    pub(crate) fn with_max_attempts(mut self, max_attempts: Option<u16>) -> Self {
        self.max_attempts = max_attempts;
        self
    }

    /// Decode a claimed job and execute it.
    ///
    /// A job whose data cannot be decoded will never succeed, so it is discarded straight away.
    pub async fn run(&self, mut job: backend::Job) {
        if let Some(max_attempts) = self.max_attempts {
            job.max_attempts = max_attempts;
        }
        let job_id = JobId::from(job.id);
        match Job::<E::Data>::try_from(job) {
            Ok(job) => self.execute_job(job).await,
            Err(error) => {
                tracing::error!(?error, %job_id, "Failed to decode job {job_id}: {error}");
                self.discard(
                    job_id,
                    backend::ExecutionError {
                        error_type: ErrorType::Other("decode".to_owned()),
                        message: error.to_string(),
                    },
                )
                .await;
            }
        }
    }

    #[instrument(skip(self, job), fields(job_id = %job.id, executor = E::NAME))]
    pub async fn execute_job(&self, job: Job<E::Data>) {
        let is_final_attempt = job.is_final_attempt();
        let job_id = job.id;
        let delay = self.executor.backoff(&job);
        let timeout = self.executor.timeout(&job);
        let executor = self.executor.clone();

        tracing::debug!(%job_id, attempt = job.attempt, "Executing job {job_id}");
        let fut = async move {
            match timeout {
                Some(duration) => tokio::time::timeout(duration, executor.execute(job))
                    .await
                    .map_err(|_elapsed| duration),
                None => Ok(executor.execute(job).await),
            }
        }
        .in_current_span();

        match tokio::spawn(fut).await {
            Ok(Ok(ExecutionResult::Done { result })) => match serde_json::to_value(result) {
                Ok(result) => self.handle_job_complete(job_id, result).await,
                Err(error) => {
                    self.handle_job_error(is_final_attempt, job_id, delay, error)
                        .await
                }
            },
            Ok(Ok(ExecutionResult::Error { error })) => {
                self.handle_job_error(is_final_attempt, job_id, delay, error)
                    .await
            }
            Ok(Err(elapsed)) => {
                self.handle_job_error(is_final_attempt, job_id, delay, elapsed)
                    .await
            }
            Err(error) => {
                self.handle_job_error(is_final_attempt, job_id, delay, error)
                    .await
            }
        }
    }

    async fn handle_job_complete(&self, job_id: JobId, result: serde_json::Value) {
        tracing::debug!(%job_id, "Job complete {job_id}");
        let _ = self
            .backend
            .mark_job_complete(job_id, result)
            .await
            .inspect_err(|err| {
                tracing::error!(
                    ?err,
                    %job_id,
                    "Failed to mark job {job_id} as complete, error: {err:?}",
                )
            });
    }

    async fn handle_job_error(
        &self,
        is_final_attempt: bool,
        job_id: JobId,
        delay: TimeDelta,
        error: impl Into<backend::ExecutionError>,
    ) {
        let error = error.into();
        if is_final_attempt {
            tracing::error!(
                %job_id,
                ?error,
                "Job {job_id} failed and will be discarded: error type: {}, message: {}",
                error.error_type,
                error.message
            );
            self.discard(job_id, error).await;
        } else {
            tracing::warn!(
                %job_id,
                ?error,
                "Job {job_id} failed and will be retried in {delay}: error type: {}, message: {}",
                error.error_type,
                error.message
            );
            let _ = self
                .backend
                .mark_job_retryable(job_id, Utc::now() + delay, error)
                .await
                .inspect_err(|err| {
                    tracing::error!(
                        ?err,
                        %job_id,
                        "Failed to mark job {job_id} as retryable, error: {err:?}",
                    )
                });
        }
    }

    async fn discard(&self, job_id: JobId, error: backend::ExecutionError) {
        let _ = self
            .backend
            .mark_job_discarded(job_id, error)
            .await
            .inspect_err(|err| {
                tracing::error!(
                    ?err,
                    %job_id,
                    "Failed to mark job {job_id} as discarded, error: {err:?}",
                )
            });
    }
}

impl From<JoinError> for backend::ExecutionError {
    fn from(value: JoinError) -> Self {
        let msg = value.to_string();
        let message = match value.try_into_panic() {
            Ok(panic) => panic
                .downcast_ref::<&str>()
                .map(ToString::to_string)
                .or_else(|| panic.downcast_ref::<String>().cloned())
                .unwrap_or(msg),
            Err(_) => msg,
        };
        Self {
            error_type: ErrorType::Panic,
            message,
        }
    }
}

impl From<Box<dyn ExecutionError>> for backend::ExecutionError {
    fn from(value: Box<dyn ExecutionError>) -> Self {
        Self {
            error_type: ErrorType::Other(value.error_type().to_owned()),
            message: value.to_string(),
        }
    }
}

impl From<Duration> for backend::ExecutionError {
    fn from(value: Duration) -> Self {
        Self {
            error_type: ErrorType::Timeout,
            message: format!("Job failed to complete within timeout: {value:?}"),
        }
    }
}

impl From<serde_json::Error> for backend::ExecutionError {
    fn from(value: serde_json::Error) -> Self {
        Self {
            error_type: ErrorType::Other("encode".to_owned()),
            message: format!("Failed to encode the job result: {value}"),
        }
    }
}

#[cfg(test)]
mod test {
    use crate::{
        backend::{memory::InMemoryBackend, testing::BackendTesting},
        executor::test::{FlakyExecutor, MockError, MockExecutionResult, SimpleExecutor},
        job::JobStatus,
    };

    use super::*;

    async fn run_once<E: Executor>(
        backend: &InMemoryBackend,
        executor: E,
        data: E::Data,
        max_attempts: u16,
    ) -> backend::Job {
        let id = E::job(data)
            .with_max_attempts(max_attempts)
            .enqueue_to_backend(backend)
            .await
            .unwrap();
        let job = backend.claim(E::NAME).await;
        JobRunner::new(backend.clone(), Arc::new(executor))
            .run(job)
            .await;
        backend.get_job(id).await.unwrap()
    }

    #[tokio::test]
    async fn completed_job_stores_result() {
        let backend = InMemoryBackend::new();
        let job = run_once(&backend, SimpleExecutor, "four".to_owned(), 1).await;

        assert_eq!(job.status, JobStatus::Complete);
        assert_eq!(job.result, Some(serde_json::json!(4)));
    }

    #[tokio::test]
    async fn error_is_retried_with_backoff() {
        let backend = InMemoryBackend::new();
        let data = MockExecutionResult::Error {
            error: MockError("broken".to_owned()),
        };
        let job = run_once(&backend, FlakyExecutor, data, 2).await;

        assert_eq!(job.status, JobStatus::Retryable);
        assert!(job.scheduled_at > Utc::now() + TimeDelta::minutes(59));
        assert_eq!(job.errors[0].error_type, ErrorType::Other("custom".to_owned()));
        assert_eq!(job.errors[0].details, "broken");
    }

    #[tokio::test]
    async fn error_on_final_attempt_discards() {
        let backend = InMemoryBackend::new();
        let data = MockExecutionResult::Error {
            error: MockError("broken".to_owned()),
        };
        let job = run_once(&backend, FlakyExecutor, data, 1).await;

        assert_eq!(job.status, JobStatus::Discarded);
        assert!(job.result.is_none());
    }

    #[tokio::test]
    async fn runner_attempts_override_the_enqueued_ones() {
        let backend = InMemoryBackend::new();
        let id = FlakyExecutor::job(MockExecutionResult::Error {
            error: MockError("broken".to_owned()),
        })
        .with_max_attempts(5)
        .enqueue_to_backend(&backend)
        .await
        .unwrap();
        let job = backend.claim(FlakyExecutor::NAME).await;

        JobRunner::new(backend.clone(), Arc::new(FlakyExecutor))
            .with_max_attempts(Some(1))
            .run(job)
            .await;

        assert_eq!(backend.get_job(id).await.unwrap().status, JobStatus::Discarded);
    }

    #[tokio::test]
    async fn panic_is_recorded() {
        let backend = InMemoryBackend::new();
        let job = run_once(&backend, FlakyExecutor, MockExecutionResult::Panic, 1).await;

        assert_eq!(job.status, JobStatus::Discarded);
        assert_eq!(job.errors[0].error_type, ErrorType::Panic);
        assert_eq!(job.errors[0].details, "job paniced");
    }

    #[tokio::test]
    async fn timeout_is_recorded() {
        let backend = InMemoryBackend::new();
        let job = run_once(&backend, FlakyExecutor, MockExecutionResult::Timeout, 1).await;

        assert_eq!(job.status, JobStatus::Discarded);
        assert_eq!(job.errors[0].error_type, ErrorType::Timeout);
    }

    #[tokio::test]
    async fn undecodable_job_is_discarded() {
        let backend = InMemoryBackend::new();
        let id = SimpleExecutor::job("data".to_owned())
            .enqueue_to_backend(&backend)
            .await
            .unwrap();
        let job = backend.claim(SimpleExecutor::NAME).await;

        JobRunner::new(backend.clone(), Arc::new(FlakyExecutor))
            .run(job)
            .await;

        let job = backend.get_job(id).await.unwrap();
        assert_eq!(job.status, JobStatus::Discarded);
        assert_eq!(job.errors[0].error_type, ErrorType::Other("decode".to_owned()));
    }
}
