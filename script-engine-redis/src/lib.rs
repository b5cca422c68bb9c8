//! A durable [`Backend`] storing jobs in Redis.
//!
//! Every job is stored as JSON under `<namespace>:job:<id>`, the ids of all jobs are kept in the
//! `<namespace>:jobs` set and pending jobs wait in one sorted set per executor,
//! `<namespace>:ready:<executor>`, scored by the time they are scheduled at.
//!
//! A worker claims a job with a single Lua script that removes it from the ready set, stores it
//! as executing and records a lease in `<namespace>:executing:<executor>`, scored by the time the
//! lease runs out. Only the worker whose script removed the job runs it. Jobs whose lease ran out
//! because their worker died are retried, or discarded on their final attempt, by the next
//! worker polling the same executor.
//!
//! Subscribers in the same process are woken up on enqueue, jobs enqueued by other processes are
//! picked up by polling.
use std::{fmt::Display, pin::Pin, time::Duration};

use async_stream::stream;
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use futures::Stream;
use redis::{aio::ConnectionManager, AsyncCommands, Client, RedisError, Script, ToRedisArgs};
use script_engine::{
    backend::{queryable::Queryable, Backend, BackendError, EnqueuableJob, ExecutionError, Job, Query},
    executor::ExecutorIdentifier,
    job::{ErrorType, JobId, JobStatus},
    pruner::PruneSpec,
};
use tokio::sync::broadcast;

/// Upper bound on the time a subscriber waits before looking for ready jobs again.
const POLL_INTERVAL: Duration = Duration::from_secs(1);
/// Number of ready jobs looked at per claim attempt.
const CLAIM_BATCH: isize = 8;
/// How long a claimed job may run before it is handed to another worker.
pub const DEFAULT_CLAIM_LEASE: Duration = Duration::from_secs(60 * 60);

/// Moves a job from one sorted set to another and rewrites it, unless the job changed since it
/// was read.
///
/// KEYS: source set, job, target set.
/// ARGV: member, job as read, job to store, score in the target set or `''` to drop the member.
const MOVE_JOB: &str = r"
if redis.call('GET', KEYS[2]) ~= ARGV[2] then
  return 0
end
if redis.call('ZREM', KEYS[1], ARGV[1]) == 0 then
  return 0
end
redis.call('SET', KEYS[2], ARGV[3])
if ARGV[4] ~= '' then
  redis.call('ZADD', KEYS[3], ARGV[4], ARGV[1])
end
return 1
";

#[derive(Clone)]
pub struct RedisBackend {
    conn: ConnectionManager,
    namespace: NameSpace,
    wakeups: broadcast::Sender<String>,
    move_script: Script,
    lease: Duration,
}

fn map_err(error: RedisError) -> BackendError {
    tracing::error!(?error, "Redis command failed");
    BackendError::Unavailable(error.to_string())
}

impl RedisBackend {
    pub async fn from_url(redis_url: &str, namespace: impl ToString) -> Result<Self, BackendError> {
        let client = Client::open(redis_url).map_err(map_err)?;
        let (wakeups, _) = broadcast::channel(64);

        Ok(Self {
            conn: ConnectionManager::new(client).await.map_err(map_err)?,
            namespace: NameSpace(namespace.to_string()),
            wakeups,
            move_script: Script::new(MOVE_JOB),
            lease: DEFAULT_CLAIM_LEASE,
        })
    }

    /// How long a job may run before the backend assumes its worker died and runs it again.
    ///
    /// Must be longer than the longest computation, defaults to [`DEFAULT_CLAIM_LEASE`].
    pub fn with_claim_lease(mut self, lease: Duration) -> Self {
        self.lease = lease;
        self
    }

    async fn next_id(&self) -> Result<i32, BackendError> {
        self.conn
            .clone()
            .incr(self.namespace.id(), 1)
            .await
            .map_err(map_err)
    }

    async fn load_raw(&self, id: i32) -> Result<Option<String>, BackendError> {
        self.conn
            .clone()
            .get(self.namespace.job(id))
            .await
            .map_err(map_err)
    }

    async fn load(&self, id: i32) -> Result<Option<Job>, BackendError> {
        Ok(self
            .load_raw(id)
            .await?
            .map(|encoded| serde_json::from_str(&encoded))
            .transpose()?)
    }

    /// Store the job and keep the ready set of its executor in line with its status.
    async fn store(&self, job: &Job) -> Result<(), BackendError> {
        let mut pipe = redis::pipe();
        pipe.atomic()
            .set(self.namespace.job(job.id), serde_json::to_string(job)?)
            .ignore()
            .sadd(self.namespace.jobs(), job.id)
            .ignore();
        let ready = self.namespace.ready(&job.executor);
        if job.is_pending() {
            pipe.zadd(ready, member(job.id), job.scheduled_at.timestamp_millis())
                .ignore();
        } else {
            pipe.zrem(ready, member(job.id)).ignore();
        }
        if job.status != JobStatus::Executing {
            pipe.zrem(self.namespace.executing(&job.executor), member(job.id))
                .ignore();
        }
        pipe.query_async::<_, ()>(&mut self.conn.clone())
            .await
            .map_err(map_err)
    }

    async fn update<F>(&self, id: JobId, transition: F) -> Result<(), BackendError>
    where
        F: FnOnce(&mut Job),
    {
        let mut job = self
            .load(id.into())
            .await?
            .ok_or(BackendError::JobNotFound(id))?;
        transition(&mut job);
        self.store(&job).await?;
        if job.is_pending() {
            self.notify(&job.executor);
        }
        Ok(())
    }

    fn notify(&self, executor: &str) {
        // no subscribers in this process is fine
        let _ = self.wakeups.send(executor.to_owned());
    }

    /// Atomically move the job `read` from `from` to `to` and store it as `job`.
    ///
    /// Returns `false` when another worker moved or changed the job first.
    async fn move_job(
        &self,
        from: NameSpacedKey<'_>,
        to: NameSpacedKey<'_>,
        read: &str,
        job: &Job,
        score: Option<i64>,
    ) -> Result<bool, BackendError> {
        let moved: i64 = self
            .move_script
            .key(from)
            .key(self.namespace.job(job.id))
            .key(to)
            .arg(member(job.id))
            .arg(read)
            .arg(serde_json::to_string(job)?)
            .arg(score.map(|score| score.to_string()).unwrap_or_default())
            .invoke_async(&mut self.conn.clone())
            .await
            .map_err(map_err)?;
        Ok(moved == 1)
    }

    /// Claim the earliest due job of the executor, if any.
    async fn claim_next(&self, executor: &str) -> Result<Option<Job>, BackendError> {
        let mut conn = self.conn.clone();
        let due: Vec<String> = conn
            .zrangebyscore_limit(
                self.namespace.ready(executor),
                "-inf",
                Utc::now().timestamp_millis(),
                0,
                CLAIM_BATCH,
            )
            .await
            .map_err(map_err)?;

        for candidate in due {
            let id: i32 = candidate.parse().map_err(|_| BackendError::BadState)?;
            let Some(read) = self.load_raw(id).await? else {
                tracing::warn!(id, executor, "Ready job no longer exists");
                conn.zrem::<_, _, ()>(self.namespace.ready(executor), &candidate)
                    .await
                    .map_err(map_err)?;
                continue;
            };
            let mut job: Job = serde_json::from_str(&read)?;
            job.mark_job_executing();
            let lease_expiry = Utc::now()
                .timestamp_millis()
                .saturating_add(i64::try_from(self.lease.as_millis()).unwrap_or(i64::MAX));

            let claimed = self
                .move_job(
                    self.namespace.ready(executor),
                    self.namespace.executing(executor),
                    &read,
                    &job,
                    Some(lease_expiry),
                )
                .await?;
            if claimed {
                return Ok(Some(job));
            }
        }
        Ok(None)
    }

    /// Hand the jobs whose lease ran out back to the ready set, discarding those that were on
    /// their final attempt.
    async fn release_expired(&self, executor: &str) -> Result<(), BackendError> {
        let mut conn = self.conn.clone();
        let expired: Vec<String> = conn
            .zrangebyscore_limit(
                self.namespace.executing(executor),
                "-inf",
                Utc::now().timestamp_millis(),
                0,
                CLAIM_BATCH,
            )
            .await
            .map_err(map_err)?;

        for candidate in expired {
            let id: i32 = candidate.parse().map_err(|_| BackendError::BadState)?;
            let job = match self.load_raw(id).await? {
                Some(read) => Some((serde_json::from_str::<Job>(&read)?, read)),
                None => None,
            };
            let Some((mut job, read)) = job.filter(|(job, _)| job.status == JobStatus::Executing)
            else {
                conn.zrem::<_, _, ()>(self.namespace.executing(executor), &candidate)
                    .await
                    .map_err(map_err)?;
                continue;
            };

            let error = ExecutionError {
                error_type: ErrorType::Other("lease_expired".to_owned()),
                message: format!("Worker did not report back within {:?}", self.lease),
            };
            let score = if job.attempt >= job.max_attempts {
                job.mark_job_discarded(error);
                None
            } else {
                let now = Utc::now();
                job.mark_job_retryable(now, error);
                Some(now.timestamp_millis())
            };

            let released = self
                .move_job(
                    self.namespace.executing(executor),
                    self.namespace.ready(executor),
                    &read,
                    &job,
                    score,
                )
                .await?;
            if released {
                tracing::warn!(id, executor, status = ?job.status, "Released job with an expired lease");
            }
        }
        Ok(())
    }

    /// How long until the next job of the executor is due, capped at [`POLL_INTERVAL`].
    async fn next_delay(&self, executor: &str) -> Result<Duration, BackendError> {
        let next: Vec<(String, f64)> = self
            .conn
            .clone()
            .zrangebyscore_limit_withscores(self.namespace.ready(executor), "-inf", "+inf", 0, 1)
            .await
            .map_err(map_err)?;
        Ok(match next.first() {
            Some((_, score)) => {
                let wait = *score as i64 - Utc::now().timestamp_millis();
                Duration::from_millis(wait.max(0) as u64).min(POLL_INTERVAL)
            }
            None => POLL_INTERVAL,
        })
    }

    async fn load_all(&self) -> Result<Vec<Job>, BackendError> {
        let mut conn = self.conn.clone();
        let ids: Vec<i32> = conn.smembers(self.namespace.jobs()).await.map_err(map_err)?;
        if ids.is_empty() {
            return Ok(Vec::new());
        }

        let mut pipe = redis::pipe();
        for id in &ids {
            pipe.get(self.namespace.job(*id));
        }
        let encoded: Vec<Option<String>> = pipe.query_async(&mut conn).await.map_err(map_err)?;

        let mut jobs = Vec::with_capacity(ids.len());
        for encoded in encoded.into_iter().flatten() {
            jobs.push(serde_json::from_str(&encoded)?);
        }
        Ok(jobs)
    }
}

#[async_trait]
impl Backend for RedisBackend {
    async fn subscribe_ready_jobs(
        &self,
        executor_identifier: ExecutorIdentifier,
    ) -> Pin<Box<dyn Stream<Item = Result<Job, BackendError>> + Send>> {
        let backend = self.clone();
        let mut wakeups = self.wakeups.subscribe();
        let executor = executor_identifier.as_str();

        Box::pin(stream! {
            loop {
                if let Err(error) = backend.release_expired(executor).await {
                    yield Err(error);
                    continue;
                }
                match backend.claim_next(executor).await {
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
                let delay = match backend.next_delay(executor).await {
                    Ok(delay) => delay,
                    Err(error) => {
                        yield Err(error);
                        continue;
                    }
                };
                tokio::select! {
                    _ = wakeups.recv() => {},
                    _ = tokio::time::sleep(delay) => {},
                }
            }
        })
    }

    async fn enqueue(&self, job: EnqueuableJob) -> Result<JobId, BackendError> {
        let id = self.next_id().await?;
        let job = job.into_job(id);
        self.store(&job).await?;
        self.notify(&job.executor);
        Ok(id.into())
    }

    async fn mark_job_complete(
        &self,
        id: JobId,
        result: serde_json::Value,
    ) -> Result<(), BackendError> {
        self.update(id, |job| job.mark_job_complete(result)).await
    }

    async fn mark_job_retryable(
        &self,
        id: JobId,
        next_scheduled_at: DateTime<Utc>,
        error: ExecutionError,
    ) -> Result<(), BackendError> {
        self.update(id, |job| job.mark_job_retryable(next_scheduled_at, error))
            .await
    }

    async fn mark_job_discarded(
        &self,
        id: JobId,
        error: ExecutionError,
    ) -> Result<(), BackendError> {
        self.update(id, |job| job.mark_job_discarded(error)).await
    }

    async fn prune_jobs(&self, prune_spec: &PruneSpec) -> Result<(), BackendError> {
        let jobs = self.load_all().await?;
        let pruned = prune_spec.pruned_ids(&jobs, Utc::now());
        if pruned.is_empty() {
            return Ok(());
        }

        let mut pipe = redis::pipe();
        pipe.atomic();
        for job in jobs.iter().filter(|job| pruned.contains(&job.id)) {
            pipe.del(self.namespace.job(job.id))
                .ignore()
                .srem(self.namespace.jobs(), job.id)
                .ignore()
                .zrem(self.namespace.ready(&job.executor), member(job.id))
                .ignore()
                .zrem(self.namespace.executing(&job.executor), member(job.id))
                .ignore();
        }
        pipe.query_async::<_, ()>(&mut self.conn.clone())
            .await
            .map_err(map_err)?;
        tracing::debug!(count = pruned.len(), ?prune_spec, "Pruned jobs");
        Ok(())
    }

    async fn query<'a>(&self, query: Query<'a>) -> Result<Vec<Job>, BackendError> {
        if let Query::IdEquals(id) = query {
            return Ok(self.load(id.into()).await?.into_iter().collect());
        }
        let mut jobs: Vec<Job> = self
            .load_all()
            .await?
            .into_iter()
            .filter(|job| query.matches(job))
            .collect();
        jobs.sort_by_key(|job| job.id);
        Ok(jobs)
    }
}

/// Sorted set member of a job, zero padded so that jobs due at the same time sort by id.
fn member(id: i32) -> String {
    format!("{id:010}")
}

#[derive(Clone)]
struct NameSpace(String);

impl NameSpace {
    fn id(&self) -> NameSpacedKey<'_> {
        self.key(KeyType::Id)
    }

    fn job(&self, id: i32) -> NameSpacedKey<'_> {
        self.key(KeyType::Job(id))
    }

    fn jobs(&self) -> NameSpacedKey<'_> {
        self.key(KeyType::Jobs)
    }

    fn ready<'a>(&'a self, executor: &'a str) -> NameSpacedKey<'a> {
        self.key(KeyType::Ready(executor))
    }

    fn executing<'a>(&'a self, executor: &'a str) -> NameSpacedKey<'a> {
        self.key(KeyType::Executing(executor))
    }

    fn key<'a>(&'a self, kind: KeyType<'a>) -> NameSpacedKey<'a> {
        NameSpacedKey {
            namespace: &self.0,
            kind,
        }
    }
}

struct NameSpacedKey<'a> {
    namespace: &'a str,
    kind: KeyType<'a>,
}

impl Display for NameSpacedKey<'_> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.namespace)?;
        match self.kind {
            KeyType::Id => write!(f, ":id_counter"),
            KeyType::Job(id) => write!(f, ":job:{id}"),
            KeyType::Jobs => write!(f, ":jobs"),
            KeyType::Ready(executor) => write!(f, ":ready:{executor}"),
            KeyType::Executing(executor) => write!(f, ":executing:{executor}"),
        }
    }
}

impl ToRedisArgs for NameSpacedKey<'_> {
    fn write_redis_args<W>(&self, out: &mut W)
    where
        W: ?Sized + redis::RedisWrite,
    {
        out.write_arg_fmt(self);
    }
}

enum KeyType<'a> {
    Id,
    Job(i32),
    Jobs,
    Ready(&'a str),
    Executing(&'a str),
}
