//! Test suite for ensuring a correct implementation of a backend.
use std::{ops::Add, time::Duration};

use crate::pruner::{PruneBy, Spec};
use chrono::TimeDelta;
use futures::StreamExt;

use super::*;

const DEFAULT_EXECUTOR: &str = "executor";

impl EnqueuableJob {
    pub(crate) const DEFAULT_EXECUTOR: &'static str = DEFAULT_EXECUTOR;

    pub(crate) fn mock_job() -> Self {
        Self {
            executor: Self::DEFAULT_EXECUTOR.to_owned(),
            data: serde_json::Value::String("data".to_owned()),
            max_attempts: 5,
            scheduled_at: Utc::now(),
        }
    }

    pub(crate) fn with_executor(self, executor: impl ToString) -> Self {
        Self {
            executor: executor.to_string(),
            ..self
        }
    }

    pub(crate) fn with_scheduled_at(self, scheduled_at: DateTime<Utc>) -> Self {
        Self {
            scheduled_at,
            ..self
        }
    }
}

/// Create test suite for a script engine backend.
///
/// Backend implementations should include this as part of their test suites.
///
/// # Example
///
/// ```
/// use script_engine::test_suite;
/// use script_engine::backend::memory::InMemoryBackend;
/// test_suite!(for: InMemoryBackend::new());
/// ```
///
/// Backends that need external services can mark the generated tests as ignored:
///
/// ```ignore
/// test_suite!(
///     attr: tokio::test,
///     ignore: "requires a running redis server",
///     backend: RedisBackend::from_url(URL, "test").await.unwrap()
/// );
/// ```
#[macro_export]
macro_rules! test_suite {
    (for: $backend:expr) => {
        test_suite!(attr: tokio::test, backend: $backend);
    };
    (attr: $attr:meta, $(ignore: $reason:literal,)? backend: $backend:expr) => {
        #[$attr]
        $(#[ignore = $reason])?
        async fn subscribe_ready_jobs() {
          let backend = $backend;
          $crate::backend::testing::subscribe_ready_jobs(backend).await;
        }
        #[$attr]
        $(#[ignore = $reason])?
        async fn subscribe_ready_jobs_enqueuing_wakes_subscriber() {
          let backend = $backend;
          $crate::backend::testing::subscribe_ready_jobs_enqueuing_wakes_subscriber(backend).await;
        }
        #[$attr]
        $(#[ignore = $reason])?
        async fn subscribe_ready_jobs_streams_jobs_in_schedule_order() {
          let backend = $backend;
          $crate::backend::testing::subscribe_ready_jobs_streams_jobs_in_schedule_order(backend).await;
        }
        #[$attr]
        $(#[ignore = $reason])?
        async fn subscribe_ready_jobs_only_one_stream_receives_job() {
          let backend = $backend;
          $crate::backend::testing::subscribe_ready_jobs_only_one_stream_receives_job(backend).await;
        }
        #[$attr]
        $(#[ignore = $reason])?
        async fn enqueue() {
          let backend = $backend;
          $crate::backend::testing::enqueue(backend).await;
        }
        #[$attr]
        $(#[ignore = $reason])?
        async fn mark_job_complete() {
          let backend = $backend;
          $crate::backend::testing::mark_job_complete(backend).await;
        }
        #[$attr]
        $(#[ignore = $reason])?
        async fn mark_job_complete_not_found() {
          let backend = $backend;
          $crate::backend::testing::mark_job_complete_not_found(backend).await;
        }
        #[$attr]
        $(#[ignore = $reason])?
        async fn mark_job_retryable() {
          let backend = $backend;
          $crate::backend::testing::mark_job_retryable(backend).await;
        }
        #[$attr]
        $(#[ignore = $reason])?
        async fn mark_job_retryable_makes_job_claimable_again() {
          let backend = $backend;
          $crate::backend::testing::mark_job_retryable_makes_job_claimable_again(backend).await;
        }
        #[$attr]
        $(#[ignore = $reason])?
        async fn mark_job_retryable_not_found() {
          let backend = $backend;
          $crate::backend::testing::mark_job_retryable_not_found(backend).await;
        }
        #[$attr]
        $(#[ignore = $reason])?
        async fn mark_job_discarded() {
          let backend = $backend;
          $crate::backend::testing::mark_job_discarded(backend).await;
        }
        #[$attr]
        $(#[ignore = $reason])?
        async fn mark_job_discarded_not_found() {
          let backend = $backend;
          $crate::backend::testing::mark_job_discarded_not_found(backend).await;
        }
        #[$attr]
        $(#[ignore = $reason])?
        async fn query() {
          let backend = $backend;
          $crate::backend::testing::query(backend).await;
        }
        #[$attr]
        $(#[ignore = $reason])?
        async fn prune_jobs_by_length() {
          let backend = $backend;
          $crate::backend::testing::prune_jobs_by_length(backend).await;
        }
        #[$attr]
        $(#[ignore = $reason])?
        async fn prune_jobs_by_age() {
          let backend = $backend;
          $crate::backend::testing::prune_jobs_by_age(backend).await;
        }
    };
}

pub use test_suite;

#[cfg(test)]
impl Job {
    pub(crate) const DEFAULT_EXECUTOR: &'static str = DEFAULT_EXECUTOR;

    pub(crate) fn raw_job() -> Self {
        let now = Utc::now();
        Self {
            id: 0,
            executor: Self::DEFAULT_EXECUTOR.to_owned(),
            status: JobStatus::Scheduled,
            data: serde_json::Value::Null,
            result: None,
            attempt: 0,
            max_attempts: 3,
            errors: vec![],
            inserted_at: now,
            scheduled_at: now + TimeDelta::hours(2),
            attempted_at: None,
            completed_at: None,
            discarded_at: None,
        }
    }

    pub(crate) fn with_status(self, status: JobStatus) -> Self {
        Self { status, ..self }
    }
}

fn mock_error() -> ExecutionError {
    ExecutionError {
        error_type: ErrorType::Other("custom".to_owned()),
        message: "Error Message".to_owned(),
    }
}

#[doc(hidden)]
#[async_trait::async_trait]
pub trait BackendTesting: Backend + Sync {
    /// Claim the next ready job of the given executor, as a worker would.
    ///
    /// This method should only be used if there is a single job enqueued for the executor,
    /// otherwise it might mark other jobs as executing.
    async fn claim(&self, executor: &'static str) -> Job {
        let mut stream = self.subscribe_ready_jobs(executor.into()).await;
        match tokio::time::timeout(Duration::from_secs(5), stream.next()).await {
            Ok(Some(Ok(job))) => job,
            _ => panic!("No job could be claimed for {executor}"),
        }
    }

    async fn get_job(&self, id: JobId) -> Option<Job> {
        let mut jobs = self.query(Query::IdEquals(id)).await.unwrap();
        assert!(jobs.len() <= 1);
        jobs.pop()
    }
}

impl<T: Backend + Sync> BackendTesting for T {}

#[doc(hidden)]
pub async fn subscribe_ready_jobs(backend: impl Backend) {
    let executor = "executor";
    let mut stream = backend.subscribe_ready_jobs(executor.into()).await;
    backend
        .enqueue(EnqueuableJob::mock_job().with_executor("another_executor"))
        .await
        .unwrap();
    let job_id = backend
        .enqueue(EnqueuableJob::mock_job().with_executor(executor))
        .await
        .unwrap();

    let job = stream.next().await.unwrap().unwrap();
    assert_eq!(job.id, i32::from(job_id));
    assert_eq!(job.executor, executor);
    assert_eq!(job.status, JobStatus::Executing);
    assert_eq!(job.attempt, 1);
}

#[doc(hidden)]
pub async fn subscribe_ready_jobs_enqueuing_wakes_subscriber(backend: impl Backend) {
    let executor = "executor";
    let mut stream = backend.subscribe_ready_jobs(executor.into()).await;
    let handle = tokio::spawn(async move {
        match tokio::time::timeout(Duration::from_secs(2), stream.next()).await {
            Ok(Some(Ok(job))) => assert_eq!(job.executor, executor),
            Err(_) => panic!("Didn't get woken by enqueue of new job"),
            _ => panic!("Bad things happened"),
        }
    });
    tokio::task::yield_now().await;
    backend
        .enqueue(EnqueuableJob::mock_job().with_executor("another_executor"))
        .await
        .unwrap();
    backend
        .enqueue(EnqueuableJob::mock_job().with_executor(executor))
        .await
        .unwrap();
    handle.await.unwrap();
}

#[doc(hidden)]
pub async fn subscribe_ready_jobs_streams_jobs_in_schedule_order(backend: impl Backend) {
    let executor = "executor";
    let now = Utc::now();
    let mut stream = backend.subscribe_ready_jobs(executor.into()).await;
    let job_id1 = backend
        .enqueue(
            EnqueuableJob::mock_job()
                .with_executor(executor)
                .with_scheduled_at(now + TimeDelta::milliseconds(500)),
        )
        .await
        .unwrap();
    let job_id2 = backend
        .enqueue(
            EnqueuableJob::mock_job()
                .with_executor(executor)
                .with_scheduled_at(now),
        )
        .await
        .unwrap();
    let job_id3 = backend
        .enqueue(
            EnqueuableJob::mock_job()
                .with_executor(executor)
                .with_scheduled_at(now),
        )
        .await
        .unwrap();

    let job_ids: [JobId; 3] = [
        stream.next().await.unwrap().unwrap().id.into(),
        stream.next().await.unwrap().unwrap().id.into(),
        stream.next().await.unwrap().unwrap().id.into(),
    ];
    assert_eq!(job_ids, [job_id2, job_id3, job_id1]);
}

#[doc(hidden)]
pub async fn subscribe_ready_jobs_only_one_stream_receives_job(backend: impl Backend) {
    let executor = "executor";
    let mut stream1 = backend.subscribe_ready_jobs(executor.into()).await;
    let mut stream2 = backend.subscribe_ready_jobs(executor.into()).await;
    let job_id1 = backend
        .enqueue(EnqueuableJob::mock_job().with_executor(executor))
        .await
        .unwrap();
    let job_id2 = backend
        .enqueue(EnqueuableJob::mock_job().with_executor(executor))
        .await
        .unwrap();

    let job_ids: std::collections::HashSet<_> =
        futures::future::join_all([stream1.next(), stream2.next()])
            .await
            .into_iter()
            .map(|res| res.unwrap().unwrap().id)
            .collect();
    let expected = [i32::from(job_id1), i32::from(job_id2)]
        .into_iter()
        .collect();
    assert_eq!(job_ids, expected);
}

#[doc(hidden)]
pub async fn enqueue(backend: impl BackendTesting) {
    let id1 = backend.enqueue(EnqueuableJob::mock_job()).await.unwrap();
    let id2 = backend.enqueue(EnqueuableJob::mock_job()).await.unwrap();

    assert_ne!(id1, id2);
    let job = backend.get_job(id1).await.unwrap();
    assert_eq!(job.status, JobStatus::Scheduled);
    assert_eq!(job.attempt, 0);
    assert!(job.result.is_none());
    assert!(backend.get_job(id2).await.is_some());
}

#[doc(hidden)]
pub async fn mark_job_complete(backend: impl BackendTesting) {
    let id = backend.enqueue(EnqueuableJob::mock_job()).await.unwrap();
    backend.claim(EnqueuableJob::DEFAULT_EXECUTOR).await;
    let result = serde_json::json!({ "result_urls": ["http://localhost/indicators/1"] });

    assert!(backend.mark_job_complete(id, result.clone()).await.is_ok());

    let job = backend.get_job(id).await.unwrap();
    assert_eq!(job.status, JobStatus::Complete);
    assert_eq!(job.result, Some(result));
    assert!(job.completed_at.is_some());
    assert!(job.errors.is_empty());
}

#[doc(hidden)]
pub async fn mark_job_complete_not_found(backend: impl BackendTesting) {
    assert!(matches!(
        backend
            .mark_job_complete(4242.into(), serde_json::Value::Null)
            .await,
        Err(BackendError::JobNotFound(_))
    ));
}

#[doc(hidden)]
pub async fn mark_job_retryable(backend: impl BackendTesting) {
    let scheduled_at = Utc::now().add(TimeDelta::days(1));
    let id = backend.enqueue(EnqueuableJob::mock_job()).await.unwrap();
    backend.claim(EnqueuableJob::DEFAULT_EXECUTOR).await;

    assert!(backend
        .mark_job_retryable(id, scheduled_at, mock_error())
        .await
        .is_ok());

    let job = backend.get_job(id).await.unwrap();
    assert_eq!(job.status, JobStatus::Retryable);
    assert_eq!(job.errors.len(), 1);
    assert_eq!(job.errors[0].attempt, 1);
    assert!((job.scheduled_at - scheduled_at).abs() < TimeDelta::milliseconds(1));
    assert!(job.result.is_none());
}

#[doc(hidden)]
pub async fn mark_job_retryable_makes_job_claimable_again(backend: impl BackendTesting) {
    let executor = "retry_executor";
    let id = backend
        .enqueue(EnqueuableJob::mock_job().with_executor(executor))
        .await
        .unwrap();
    backend.claim(executor).await;
    backend
        .mark_job_retryable(id, Utc::now(), mock_error())
        .await
        .unwrap();

    let job = backend.claim(executor).await;
    assert_eq!(job.id, i32::from(id));
    assert_eq!(job.status, JobStatus::Executing);
    assert_eq!(job.attempt, 2);
    assert_eq!(job.errors.len(), 1);
}

#[doc(hidden)]
pub async fn mark_job_retryable_not_found(backend: impl BackendTesting) {
    assert!(matches!(
        backend
            .mark_job_retryable(4242.into(), Utc::now(), mock_error())
            .await,
        Err(BackendError::JobNotFound(_))
    ));
}

#[doc(hidden)]
pub async fn mark_job_discarded(backend: impl BackendTesting) {
    let id = backend.enqueue(EnqueuableJob::mock_job()).await.unwrap();
    backend.claim(EnqueuableJob::DEFAULT_EXECUTOR).await;
    let error = mock_error();

    assert!(backend.mark_job_discarded(id, error.clone()).await.is_ok());

    let job = backend.get_job(id).await.unwrap();
    assert_eq!(job.status, JobStatus::Discarded);
    assert!(job.discarded_at.is_some());
    assert!(job.result.is_none());
    assert_eq!(job.errors.len(), 1);

    let job_error = job.errors.first().unwrap();
    assert_eq!(job_error.attempt, job.attempt);
    assert_eq!(job_error.error_type, error.error_type);
    assert_eq!(job_error.details, error.message);
}

#[doc(hidden)]
pub async fn mark_job_discarded_not_found(backend: impl BackendTesting) {
    assert!(matches!(
        backend.mark_job_discarded(4242.into(), mock_error()).await,
        Err(BackendError::JobNotFound(_))
    ));
}

#[doc(hidden)]
pub async fn query(backend: impl BackendTesting) {
    let executor = "query_executor";
    let id1 = backend
        .enqueue(EnqueuableJob::mock_job().with_executor(executor))
        .await
        .unwrap();
    let id2 = backend
        .enqueue(
            EnqueuableJob::mock_job()
                .with_executor(executor)
                .with_scheduled_at(Utc::now() + TimeDelta::hours(1)),
        )
        .await
        .unwrap();
    backend
        .enqueue(EnqueuableJob::mock_job().with_executor("another_executor"))
        .await
        .unwrap();
    backend.claim(executor).await;
    backend
        .mark_job_complete(id1, serde_json::Value::Null)
        .await
        .unwrap();

    let complete = backend
        .query(Query::StatusEqual(JobStatus::Complete).for_executor(executor))
        .await
        .unwrap();
    assert_eq!(complete.len(), 1);
    assert_eq!(complete[0].id, i32::from(id1));

    let delayed = backend
        .query(
            Query::And(vec![
                Query::StatusEqual(JobStatus::Scheduled),
                Query::ScheduledAtAfter(Utc::now()),
            ])
            .for_executor(executor),
        )
        .await
        .unwrap();
    assert_eq!(delayed.len(), 1);
    assert_eq!(delayed[0].id, i32::from(id2));

    let all = backend
        .query(Query::ExecutorEqual(executor))
        .await
        .unwrap();
    assert_eq!(all.len(), 2);
}

#[doc(hidden)]
pub async fn prune_jobs_by_length(backend: impl BackendTesting) {
    let executor = "prune_length_executor";
    let mut ids = vec![];
    for _ in 0..3 {
        let id = backend
            .enqueue(EnqueuableJob::mock_job().with_executor(executor))
            .await
            .unwrap();
        backend.claim(executor).await;
        backend
            .mark_job_complete(id, serde_json::Value::Null)
            .await
            .unwrap();
        ids.push(id);
    }
    let pending = backend
        .enqueue(EnqueuableJob::mock_job().with_executor(executor))
        .await
        .unwrap();

    backend
        .prune_jobs(&PruneSpec {
            status: JobStatus::Complete,
            prune_by: PruneBy::MaxLength(1),
            executors: Spec::Only(vec![executor]),
        })
        .await
        .unwrap();

    assert!(backend.get_job(ids[0]).await.is_none());
    assert!(backend.get_job(ids[1]).await.is_none());
    assert!(backend.get_job(ids[2]).await.is_some());
    assert!(backend.get_job(pending).await.is_some());
}

#[doc(hidden)]
pub async fn prune_jobs_by_age(backend: impl BackendTesting) {
    let executor = "prune_age_executor";
    let id = backend
        .enqueue(EnqueuableJob::mock_job().with_executor(executor))
        .await
        .unwrap();
    backend.claim(executor).await;
    backend.mark_job_discarded(id, mock_error()).await.unwrap();

    let spec = PruneSpec {
        status: JobStatus::Discarded,
        prune_by: PruneBy::MaxAge(TimeDelta::hours(1)),
        executors: Spec::Only(vec![executor]),
    };
    backend.prune_jobs(&spec).await.unwrap();
    assert!(backend.get_job(id).await.is_some());

    let spec = PruneSpec {
        prune_by: PruneBy::MaxAge(TimeDelta::zero()),
        ..spec
    };
    tokio::time::sleep(Duration::from_millis(5)).await;
    backend.prune_jobs(&spec).await.unwrap();
    assert!(backend.get_job(id).await.is_none());
}
