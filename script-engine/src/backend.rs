//! The API for implementing a job queue backend.
//!
//! A backend stores jobs durably and hands them out to executor loops. The runtime relies on
//! the backend for the guarantee that a given job is only claimed by a single worker at a time:
//! the stream returned by [`Backend::subscribe_ready_jobs`] must mark a job as
//! [`JobStatus::Executing`] atomically with yielding it.
//!
//! Two implementations are provided: [`memory::InMemoryBackend`] for tests and single process
//! setups, and the Redis backend in the `script-engine-redis` crate.
use std::pin::Pin;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use futures::Stream;
use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::{
    executor::ExecutorIdentifier,
    job::{ErrorType, JobError, JobId, JobStatus},
    pruner::PruneSpec,
};

pub mod memory;
pub mod queryable;
pub mod testing;

/// Storage and dispatch of jobs for the worker runtime.
#[async_trait]
pub trait Backend {
    /// Subscribe to jobs ready to run for the given executor.
    ///
    /// Every job yielded has already been marked as executing and had its attempt incremented.
    async fn subscribe_ready_jobs(
        &self,
        executor_identifier: ExecutorIdentifier,
    ) -> Pin<Box<dyn Stream<Item = Result<Job, BackendError>> + Send>>;
    /// Store a new job and return its id.
    async fn enqueue(&self, job: EnqueuableJob) -> Result<JobId, BackendError>;
    /// Mark a job as complete and store its result.
    async fn mark_job_complete(
        &self,
        id: JobId,
        result: serde_json::Value,
    ) -> Result<(), BackendError>;
    /// Record a failed attempt and schedule the job to be retried.
    async fn mark_job_retryable(
        &self,
        id: JobId,
        next_scheduled_at: DateTime<Utc>,
        error: ExecutionError,
    ) -> Result<(), BackendError>;
    /// Record the failure of the final attempt.
    async fn mark_job_discarded(
        &self,
        id: JobId,
        error: ExecutionError,
    ) -> Result<(), BackendError>;
    /// Remove jobs matching the given spec.
    async fn prune_jobs(&self, prune_spec: &PruneSpec) -> Result<(), BackendError>;
    /// Load all jobs matching the query.
    async fn query<'a>(&self, query: Query<'a>) -> Result<Vec<Job>, BackendError>;
}

/// A job ready to be inserted into the backend.
#[derive(Debug, Clone, PartialEq)]
pub struct EnqueuableJob {
    pub executor: String,
    pub data: serde_json::Value,
    pub max_attempts: u16,
    pub scheduled_at: DateTime<Utc>,
}

/// The raw representation of a job as stored by a backend.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Job {
    pub id: i32,
    pub status: JobStatus,
    pub executor: String,
    pub data: serde_json::Value,
    pub result: Option<serde_json::Value>,
    pub attempt: u16,
    pub max_attempts: u16,
    pub errors: Vec<JobError>,
    pub inserted_at: DateTime<Utc>,
    pub scheduled_at: DateTime<Utc>,
    pub attempted_at: Option<DateTime<Utc>>,
    pub completed_at: Option<DateTime<Utc>>,
    pub discarded_at: Option<DateTime<Utc>>,
}

impl EnqueuableJob {
    /// Turn the enqueuable job into a freshly scheduled job with the given id.
    pub fn into_job(self, id: i32) -> Job {
        Job {
            id,
            status: JobStatus::Scheduled,
            executor: self.executor,
            data: self.data,
            result: None,
            attempt: 0,
            max_attempts: self.max_attempts,
            errors: vec![],
            inserted_at: Utc::now(),
            scheduled_at: self.scheduled_at,
            attempted_at: None,
            completed_at: None,
            discarded_at: None,
        }
    }
}

/// State transitions shared by backend implementations.
impl Job {
    pub fn mark_job_executing(&mut self) {
        self.attempted_at = Some(Utc::now());
        self.attempt += 1;
        self.status = JobStatus::Executing;
    }

    pub fn mark_job_complete(&mut self, result: serde_json::Value) {
        self.completed_at = Some(Utc::now());
        self.result = Some(result);
        self.status = JobStatus::Complete;
    }

    pub fn mark_job_retryable(&mut self, scheduled_at: DateTime<Utc>, error: ExecutionError) {
        self.scheduled_at = scheduled_at;
        self.errors.push(error.into_job_error(self.attempt));
        self.status = JobStatus::Retryable;
    }

    pub fn mark_job_discarded(&mut self, error: ExecutionError) {
        self.discarded_at = Some(Utc::now());
        self.errors.push(error.into_job_error(self.attempt));
        self.status = JobStatus::Discarded;
    }

    /// Whether the job is waiting to be claimed.
    pub fn is_pending(&self) -> bool {
        matches!(self.status, JobStatus::Scheduled | JobStatus::Retryable)
    }

    /// The time the job reached its terminal status, falling back to the insertion time.
    pub fn finished_at(&self) -> DateTime<Utc> {
        self.completed_at
            .or(self.discarded_at)
            .unwrap_or(self.inserted_at)
    }
}

/// The error of a single failed attempt, as reported to the backend.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ExecutionError {
    pub error_type: ErrorType,
    pub message: String,
}

impl ExecutionError {
    fn into_job_error(self, attempt: u16) -> JobError {
        JobError {
            attempt,
            error_type: self.error_type,
            details: self.message,
            recorded_at: Utc::now(),
        }
    }
}

#[derive(Debug, Error)]
pub enum BackendError {
    #[error("Error encoding or decoding data")]
    EncodeDecode(#[from] serde_json::Error),
    #[error("System in bad state")]
    BadState,
    #[error("Job {0} not found")]
    JobNotFound(JobId),
    #[error("Backend unavailable: {0}")]
    Unavailable(String),
}

/// Filter over the jobs stored in a backend.
#[derive(Debug, Clone, PartialEq)]
pub enum Query<'a> {
    Not(Box<Query<'a>>),
    And(Vec<Query<'a>>),
    Or(Vec<Query<'a>>),
    ExecutorEqual(&'a str),
    IdEquals(JobId),
    StatusEqual(JobStatus),
    ScheduledAtBefore(DateTime<Utc>),
    ScheduledAtAfter(DateTime<Utc>),
}

impl<'a> Query<'a> {
    /// Restrict the query to the jobs of a single executor.
    pub fn for_executor(self, executor: &'a str) -> Self {
        match self {
            Query::And(mut constraints) => {
                constraints.push(Query::ExecutorEqual(executor));
                Query::And(constraints)
            }
            query => Query::And(vec![query, Query::ExecutorEqual(executor)]),
        }
    }
}
