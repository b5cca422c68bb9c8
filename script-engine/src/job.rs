//! The typed view of a job as handed to an [`crate::executor::Executor`].
use std::{fmt::Display, num::ParseIntError, str::FromStr};

use chrono::{DateTime, Utc};
use serde::{de::DeserializeOwned, Deserialize, Serialize};

use crate::backend;

pub mod builder;
pub(crate) mod runner;

/// Identifier of a job, unique within a backend.
#[derive(Debug, Eq, PartialEq, Clone, Copy, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct JobId(i32);

impl From<i32> for JobId {
    fn from(value: i32) -> Self {
        Self(value)
    }
}

impl From<JobId> for i32 {
    fn from(value: JobId) -> Self {
        value.0
    }
}

impl Display for JobId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl FromStr for JobId {
    type Err = ParseIntError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        s.trim().parse().map(Self)
    }
}

/// A job with its data decoded into the executor's data type.
#[derive(Debug, Clone)]
pub struct Job<D> {
    pub id: JobId,
    pub status: JobStatus,
    pub executor: String,
    pub data: D,
    pub attempt: u16,
    pub max_attempts: u16,
    pub errors: Vec<JobError>,
    pub inserted_at: DateTime<Utc>,
    pub scheduled_at: DateTime<Utc>,
    pub attempted_at: Option<DateTime<Utc>>,
    pub completed_at: Option<DateTime<Utc>>,
    pub discarded_at: Option<DateTime<Utc>>,
}

impl<D> TryFrom<backend::Job> for Job<D>
where
    D: DeserializeOwned,
{
    type Error = serde_json::Error;

    fn try_from(value: backend::Job) -> Result<Self, Self::Error> {
        let data = serde_json::from_value(value.data)?;
        Ok(Self {
            id: value.id.into(),
            status: value.status,
            executor: value.executor,
            data,
            attempt: value.attempt,
            max_attempts: value.max_attempts,
            errors: value.errors,
            inserted_at: value.inserted_at,
            scheduled_at: value.scheduled_at,
            attempted_at: value.attempted_at,
            completed_at: value.completed_at,
            discarded_at: value.discarded_at,
        })
    }
}

impl<D> Job<D> {
    pub(crate) fn is_final_attempt(&self) -> bool {
        self.attempt >= self.max_attempts
    }
}

/// The lifecycle status of a job as stored by a backend.
#[derive(Debug, Clone, Copy, Eq, PartialEq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum JobStatus {
    /// Waiting for its first attempt.
    Scheduled,
    /// Claimed by a worker and currently running.
    Executing,
    /// Failed at least once and waiting to be retried.
    Retryable,
    /// Finished successfully, the result is stored on the job.
    Complete,
    /// Failed on its final attempt.
    Discarded,
}

impl JobStatus {
    pub const ALL: [JobStatus; 5] = [
        Self::Scheduled,
        Self::Executing,
        Self::Retryable,
        Self::Complete,
        Self::Discarded,
    ];

    /// Whether no further attempt will be made for a job in this status.
    pub fn is_terminal(&self) -> bool {
        matches!(self, Self::Complete | Self::Discarded)
    }
}

/// A record of an error returned by one attempt of a job.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct JobError {
    pub attempt: u16,
    pub error_type: ErrorType,
    pub details: String,
    pub recorded_at: DateTime<Utc>,
}

/// Classification of the ways an attempt can fail.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ErrorType {
    /// The executor panicked.
    Panic,
    /// The executor did not finish within [`crate::executor::Executor::timeout`].
    Timeout,
    /// Error type reported by [`crate::executor::ExecutionError::error_type`].
    #[serde(untagged)]
    Other(String),
}

impl Display for ErrorType {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let val = match self {
            ErrorType::Panic => "panic",
            ErrorType::Timeout => "timeout",
            ErrorType::Other(val) => val,
        };
        write!(f, "{val}")
    }
}
