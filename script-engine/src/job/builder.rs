//! Enqueuing jobs for an [`Executor`].
use chrono::{DateTime, TimeDelta, Utc};

use crate::{
    backend::{Backend, EnqueuableJob},
    executor::Executor,
    RuntimeError,
};

use super::JobId;

/// A job of the executor `E` about to be enqueued, created with [`Executor::job`].
pub struct JobBuilder<E>
where
    E: Executor,
{
    data: E::Data,
    max_attempts: u16,
    scheduled_at: DateTime<Utc>,
}

impl<E> JobBuilder<E>
where
    E: Executor,
{
    pub(crate) fn new(data: E::Data) -> Self {
        Self {
            data,
            max_attempts: E::MAX_ATTEMPTS,
            scheduled_at: Utc::now(),
        }
    }

    /// Override [`Executor::MAX_ATTEMPTS`] for this job, at least one attempt is always made.
    pub fn with_max_attempts(self, max_attempts: u16) -> Self {
        Self {
            max_attempts: max_attempts.max(1),
            ..self
        }
    }

    /// Hold the job back, it is reported as delayed until then.
    pub fn schedule_in(self, delay: TimeDelta) -> Self {
        Self {
            scheduled_at: Utc::now() + delay,
            ..self
        }
    }

    pub async fn enqueue_to_backend<B: Backend + ?Sized>(
        self,
        backend: &B,
    ) -> Result<JobId, RuntimeError> {
        let job_id = backend
            .enqueue(EnqueuableJob {
                executor: E::NAME.to_owned(),
                data: serde_json::to_value(&self.data)?,
                max_attempts: self.max_attempts,
                scheduled_at: self.scheduled_at,
            })
            .await?;

        tracing::debug!(%job_id, executor = E::NAME, "Enqueued job");
        Ok(job_id)
    }
}

#[cfg(test)]
mod tests {
    use crate::{
        backend::{memory::InMemoryBackend, testing::BackendTesting},
        executor::test::SimpleExecutor,
        job::JobStatus,
    };

    use super::*;

    #[tokio::test]
    async fn enqueue() {
        let backend = InMemoryBackend::new().paused();

        let job_id = SimpleExecutor::job("First job".to_owned())
            .with_max_attempts(4)
            .schedule_in(TimeDelta::hours(2))
            .enqueue_to_backend(&backend)
            .await
            .unwrap();

        let job = backend.get_job(job_id).await.unwrap();
        assert_eq!(job.executor, SimpleExecutor::NAME);
        assert_eq!(job.status, JobStatus::Scheduled);
        assert_eq!(job.max_attempts, 4);
        assert_eq!(job.data, serde_json::json!("First job"));
        assert!(job.scheduled_at > Utc::now() + TimeDelta::minutes(119));
    }

    #[tokio::test]
    async fn max_attempts_default_to_executor_and_stay_positive() {
        let backend = InMemoryBackend::new().paused();

        let default = SimpleExecutor::job("job".to_owned())
            .enqueue_to_backend(&backend)
            .await
            .unwrap();
        let zero = SimpleExecutor::job("job".to_owned())
            .with_max_attempts(0)
            .enqueue_to_backend(&backend)
            .await
            .unwrap();

        let default = backend.get_job(default).await.unwrap();
        assert_eq!(default.max_attempts, SimpleExecutor::MAX_ATTEMPTS);
        let zero = backend.get_job(zero).await.unwrap();
        assert_eq!(zero.max_attempts, 1);
    }
}
