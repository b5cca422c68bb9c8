//! An in memory implementation of [`Backend`].
//!
//! Jobs only live as long as the process. It is a correct implementation of the backend contract
//! and is what the test suites run against; production deployments use the Redis backend.
use std::{
    collections::{BTreeMap, HashMap},
    pin::Pin,
    sync::{
        atomic::{AtomicBool, AtomicI32, Ordering},
        Arc, RwLock,
    },
    time::Duration,
};

use async_stream::stream;
use async_trait::async_trait;
use chrono::{DateTime, TimeDelta, Utc};
use futures::Stream;
use tokio::sync::Notify;

use crate::{executor::ExecutorIdentifier, job::JobId, pruner::PruneSpec};

use super::{queryable::Queryable, Backend, BackendError, EnqueuableJob, ExecutionError, Job, Query};

/// Longest a subscriber sleeps without looking at the jobs again.
const IDLE_DELAY: Duration = Duration::from_secs(30);
/// Jobs due within this window are claimed right away instead of sleeping for them.
const LOOKAHEAD: TimeDelta = TimeDelta::milliseconds(15);

/// An in memory implementation of [`Backend`].
#[derive(Clone, Default)]
pub struct InMemoryBackend {
    jobs: Arc<RwLock<BTreeMap<i32, Job>>>,
    id_counter: Arc<AtomicI32>,
    wakeups: Arc<RwLock<HashMap<&'static str, Arc<Notify>>>>,
    paused: Arc<AtomicBool>,
}

impl InMemoryBackend {
    pub fn new() -> Self {
        Self::default()
    }

    /// Stop waking up subscribers when jobs are inserted or become pending again.
    ///
    /// Call [`InMemoryBackend::notify_all`] to let the executors pick the jobs up.
    pub fn paused(self) -> Self {
        self.paused.store(true, Ordering::Relaxed);
        self
    }

    /// Wake up every subscriber, paused or not.
    pub fn notify_all(&self) -> Result<(), BackendError> {
        self.wakeups
            .read()
            .map_err(|_| BackendError::BadState)?
            .values()
            .for_each(|wakeup| wakeup.notify_waiters());
        Ok(())
    }

    fn wakeup(&self, executor: &'static str) -> Result<Arc<Notify>, BackendError> {
        let mut wakeups = self.wakeups.write().map_err(|_| BackendError::BadState)?;
        Ok(wakeups.entry(executor).or_default().clone())
    }

    fn notify(&self, executor: &str) -> Result<(), BackendError> {
        if self.paused.load(Ordering::Relaxed) {
            return Ok(());
        }
        if let Some(wakeup) = self
            .wakeups
            .read()
            .map_err(|_| BackendError::BadState)?
            .get(executor)
        {
            wakeup.notify_waiters();
        }
        Ok(())
    }

    /// Mark the earliest due pending job of the executor as executing and return it.
    fn claim(&self, executor: &str) -> Result<Option<Job>, BackendError> {
        let mut jobs = self.jobs.write().map_err(|_| BackendError::BadState)?;
        let horizon = Utc::now() + LOOKAHEAD;
        let next = jobs
            .values_mut()
            .filter(|job| job.executor == executor && job.is_pending())
            .filter(|job| job.scheduled_at <= horizon)
            .min_by_key(|job| (job.scheduled_at, job.id));
        Ok(next.map(|job| {
            job.mark_job_executing();
            job.clone()
        }))
    }

    /// Time until the next pending job of the executor is due.
    fn idle_delay(&self, executor: &str) -> Result<Duration, BackendError> {
        let next: Option<DateTime<Utc>> = self
            .jobs
            .read()
            .map_err(|_| BackendError::BadState)?
            .values()
            .filter(|job| job.executor == executor && job.is_pending())
            .map(|job| job.scheduled_at)
            .min();
        Ok(next
            .and_then(|scheduled_at| (scheduled_at - Utc::now()).to_std().ok())
            .map_or(IDLE_DELAY, |delay| delay.min(IDLE_DELAY)))
    }

    fn update<F>(&self, id: JobId, transition: F) -> Result<(), BackendError>
    where
        F: FnOnce(&mut Job),
    {
        let mut jobs = self.jobs.write().map_err(|_| BackendError::BadState)?;
        let job = jobs
            .get_mut(&i32::from(id))
            .ok_or(BackendError::JobNotFound(id))?;
        transition(job);
        if job.is_pending() {
            self.notify(&job.executor)?;
        }
        Ok(())
    }
}

#[async_trait]
impl Backend for InMemoryBackend {
    async fn subscribe_ready_jobs(
        &self,
        executor_identifier: ExecutorIdentifier,
    ) -> Pin<Box<dyn Stream<Item = Result<Job, BackendError>> + Send>> {
        let executor = executor_identifier.as_str();
        let wakeup = match self.wakeup(executor) {
            Ok(wakeup) => wakeup,
            Err(error) => return Box::pin(futures::stream::once(async { Err::<Job, _>(error) })),
        };
        let backend = self.clone();

        Box::pin(stream! {
            loop {
                // registered before looking at the jobs so no wake up in between is lost
                let notified = wakeup.notified();
                tokio::pin!(notified);
                notified.as_mut().enable();

                match backend.claim(executor) {
                    Ok(Some(job)) => {
                        yield Ok(job);
                        continue;
                    }
                    Ok(None) => {}
                    Err(error) => {
                        yield Err(error);
                        continue;
                    }
                }
                let delay = match backend.idle_delay(executor) {
                    Ok(delay) => delay,
                    Err(error) => {
                        yield Err(error);
                        continue;
                    }
                };
                tokio::select! {
                    _ = &mut notified => {},
                    _ = tokio::time::sleep(delay) => {},
                }
            }
        })
    }

    async fn enqueue(&self, job: EnqueuableJob) -> Result<JobId, BackendError> {
        let id = self.id_counter.fetch_add(1, Ordering::SeqCst);
        let job = job.into_job(id);
        let executor = job.executor.clone();

        self.jobs
            .write()
            .map_err(|_| BackendError::BadState)?
            .insert(id, job);
        self.notify(&executor)?;

        Ok(id.into())
    }

    async fn mark_job_complete(
        &self,
        id: JobId,
        result: serde_json::Value,
    ) -> Result<(), BackendError> {
        self.update(id, |job| job.mark_job_complete(result))
    }

    async fn mark_job_retryable(
        &self,
        id: JobId,
        next_scheduled_at: DateTime<Utc>,
        error: ExecutionError,
    ) -> Result<(), BackendError> {
        self.update(id, |job| job.mark_job_retryable(next_scheduled_at, error))
    }

    async fn mark_job_discarded(
        &self,
        id: JobId,
        error: ExecutionError,
    ) -> Result<(), BackendError> {
        self.update(id, |job| job.mark_job_discarded(error))
    }

    async fn prune_jobs(&self, prune_spec: &PruneSpec) -> Result<(), BackendError> {
        let mut jobs = self.jobs.write().map_err(|_| BackendError::BadState)?;
        for id in prune_spec.pruned_ids(jobs.values(), Utc::now()) {
            jobs.remove(&id);
        }
        Ok(())
    }

    async fn query<'a>(&self, query: Query<'a>) -> Result<Vec<Job>, BackendError> {
        Ok(self
            .jobs
            .read()
            .map_err(|_| BackendError::BadState)?
            .values()
            .filter(|job| query.matches(job))
            .cloned()
            .collect())
    }
}

#[cfg(test)]
mod test {
    use crate::{
        job::{ErrorType, JobStatus},
        pruner::{PruneBy, Spec},
        test_suite,
    };
    use futures::StreamExt;

    use super::*;
    use assert_matches::assert_matches;

    test_suite!(for: InMemoryBackend::new());

    #[tokio::test]
    async fn subscribe_ready_jobs_enqueuing_does_not_wake_subscriber_when_paused() {
        let executor = "executor";
        let backend = InMemoryBackend::new().paused();
        let mut stream = backend.subscribe_ready_jobs(executor.into()).await;
        let handle = tokio::spawn(async move {
            match tokio::time::timeout(Duration::from_secs(1), stream.next()).await {
                Ok(Some(Ok(_job))) => panic!("Should not get woken up"),
                Err(_) => {}
                _ => panic!("Bad things happened"),
            }
        });
        tokio::task::yield_now().await;
        backend
            .enqueue(EnqueuableJob::mock_job().with_executor(executor))
            .await
            .unwrap();
        handle.await.unwrap();
    }

    #[tokio::test]
    async fn calling_notify_all_continues_execution() {
        let executor = "executor";
        let backend = InMemoryBackend::new().paused();
        let mut stream = backend.subscribe_ready_jobs(executor.into()).await;
        let handle = tokio::spawn(async move {
            match tokio::time::timeout(Duration::from_secs(1), stream.next()).await {
                Ok(Some(Ok(job))) => assert_eq!(job.executor, executor),
                Err(_) => panic!("Didn't get woken by notify_all"),
                _ => panic!("Bad things happened"),
            }
        });
        tokio::task::yield_now().await;
        backend
            .enqueue(EnqueuableJob::mock_job().with_executor(executor))
            .await
            .unwrap();
        backend.notify_all().unwrap();
        handle.await.unwrap();
    }

    #[tokio::test]
    async fn badstate_errors() {
        let backend = InMemoryBackend::new();
        let id = backend.enqueue(EnqueuableJob::mock_job()).await.unwrap();
        let error = ExecutionError {
            error_type: ErrorType::Other("custom".to_owned()),
            message: "Error Message".to_owned(),
        };
        let prune_spec = PruneSpec {
            status: JobStatus::Complete,
            prune_by: PruneBy::MaxLength(5),
            executors: Spec::Except(vec![]),
        };

        tokio::task::spawn({
            let backend = backend.clone();
            async move {
                let _guard = backend.jobs.write();
                panic!()
            }
        })
        .await
        .unwrap_err();

        assert_matches!(
            backend.enqueue(EnqueuableJob::mock_job()).await,
            Err(BackendError::BadState)
        );
        assert_matches!(
            backend.mark_job_complete(id, serde_json::Value::Null).await,
            Err(BackendError::BadState)
        );
        assert_matches!(
            backend
                .mark_job_retryable(id, Utc::now(), error.clone())
                .await,
            Err(BackendError::BadState)
        );
        assert_matches!(
            backend.mark_job_discarded(id, error).await,
            Err(BackendError::BadState)
        );
        assert_matches!(
            backend.prune_jobs(&prune_spec).await,
            Err(BackendError::BadState)
        );
        assert_matches!(
            backend.query(Query::IdEquals(id)).await,
            Err(BackendError::BadState)
        );
    }
}
