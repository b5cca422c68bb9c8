//! The [`Executor`] trait: a named unit of work run by the [`crate::WorkerRuntime`].
use std::error::Error;

use async_trait::async_trait;
use chrono::TimeDelta;
use serde::{de::DeserializeOwned, Serialize};

use crate::{
    backoff::{RetryBackoff, Strategy},
    job::{builder::JobBuilder, Job},
};

/// Retries of computation jobs start after 4 seconds and wait at most an hour, with 10% jitter.
const DEFAULT_BACKOFF: RetryBackoff =
    RetryBackoff::new(TimeDelta::seconds(4), TimeDelta::hours(1)).with_jitter(0.1);

/// An enqueuable execution unit.
///
/// Unlike a plain function an executor is a value: it owns the clients and stores it needs to
/// do its work, and a single instance is shared by all the jobs it runs.
#[async_trait]
pub trait Executor: Send + Sync + 'static {
    /// The type representing the job's arguments.
    type Data: Serialize + DeserializeOwned + Send + Sync + 'static;
    /// The type of the value stored on the job once it completes.
    type Output: Serialize + Send + 'static;
    /// The name of the executor.
    ///
    /// This is used to associate the jobs stored in the backend with this particular executor and
    /// must be unique among the executors sharing a backend.
    const NAME: &'static str;
    /// The maximum number of attempts to try this job before it is discarded.
    ///
    /// When enqueuing any given job this can be overridden via [`JobBuilder::with_max_attempts`].
    const MAX_ATTEMPTS: u16 = 3;

    async fn execute(&self, job: Job<Self::Data>) -> ExecutionResult<Self::Output>;

    fn backoff(&self, job: &Job<Self::Data>) -> TimeDelta {
        DEFAULT_BACKOFF.delay(job.attempt)
    }

    fn timeout(&self, _job: &Job<Self::Data>) -> Option<std::time::Duration> {
        None
    }

    /// Start building a job for this executor with the given data.
    fn job(data: Self::Data) -> JobBuilder<Self>
    where
        Self: Sized,
    {
        JobBuilder::new(data)
    }
}

#[derive(Debug, Eq, PartialEq, Clone, Hash)]
pub struct ExecutorIdentifier(&'static str);

impl From<&'static str> for ExecutorIdentifier {
    fn from(value: &'static str) -> Self {
        Self(value)
    }
}

impl ExecutorIdentifier {
    pub fn as_str(&self) -> &'static str {
        self.0
    }
}

impl std::ops::Deref for ExecutorIdentifier {
    type Target = str;

    fn deref(&self) -> &Self::Target {
        self.0
    }
}

/// The outcome of a single attempt of a job.
pub enum ExecutionResult<T> {
    Done { result: T },
    Error { error: Box<dyn ExecutionError> },
}

impl<T, E> From<Result<T, E>> for ExecutionResult<T>
where
    E: ExecutionError + 'static,
{
    fn from(value: Result<T, E>) -> Self {
        match value {
            Ok(result) => Self::Done { result },
            Err(error) => Self::Error {
                error: Box::new(error),
            },
        }
    }
}

pub trait ExecutionError: Error + Send {
    /// A short tag classifying the error, stored alongside the message on the job.
    fn error_type(&self) -> &'static str;
}
