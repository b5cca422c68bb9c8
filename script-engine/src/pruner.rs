//! Retention of finished computation jobs.
//!
//! Finished jobs keep their results and job data in the backend so that the status endpoints
//! can report them. A [`PrunerConfig`] removes them again on a [`cron::Schedule`]: each
//! configured [`Pruner`] looks at the jobs of a single status and removes them either by age
//! or by keeping only the most recent ones.
//!
//! # Example
//!
//! Keep completed default computations for a week, but only the last 200 failed customized
//! computations:
//!
//! ```
//! # use script_engine::prelude::*;
//! # use std::str::FromStr;
//! # use chrono::TimeDelta;
//! # use script_engine::executors::{CustomizedComputationExecutor, DefaultComputationExecutor};
//! let config = PrunerConfig::new(cron::Schedule::from_str("0 0 * * * *").unwrap())
//!     .with_pruner(
//!         Pruner::max_age(TimeDelta::days(7), JobStatus::Complete)
//!             .only::<DefaultComputationExecutor>(),
//!     )
//!     .with_pruner(
//!         Pruner::max_length(200, JobStatus::Discarded)
//!             .only::<CustomizedComputationExecutor>(),
//!     );
//! ```
use chrono::TimeDelta;

pub(crate) mod runner;

use crate::{executor::Executor, job::JobStatus};

/// When and how finished jobs are removed.
///
/// Pass it to [`crate::WorkerRuntime::with_job_pruner`].
pub struct PrunerConfig {
    schedule: cron::Schedule,
    max_concurrency: Option<usize>,
    pruners: Vec<PruneSpec>,
}

impl PrunerConfig {
    pub fn new(schedule: cron::Schedule) -> Self {
        Self {
            schedule,
            max_concurrency: Some(10),
            pruners: Vec::new(),
        }
    }

    /// Remove succeeded and failed jobs of every executor once they finished more than
    /// `retention` ago.
    pub fn retention(schedule: cron::Schedule, retention: TimeDelta) -> Self {
        Self::new(schedule)
            .with_pruner(Pruner::max_age(retention, JobStatus::Complete))
            .with_pruner(Pruner::max_age(retention, JobStatus::Discarded))
    }

    /// The number of pruners run against the backend at the same time, `None` for no limit.
    pub fn with_max_concurrency(mut self, limit: Option<usize>) -> Self {
        self.max_concurrency = limit;
        self
    }

    pub fn with_pruner(mut self, pruner: Pruner) -> Self {
        self.pruners.push(pruner.0);
        self
    }
}

/// A single pruning rule as executed by a backend.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PruneSpec {
    pub status: JobStatus,
    pub prune_by: PruneBy,
    pub executors: Spec,
}

/// How matching jobs are selected for removal.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PruneBy {
    /// Remove the jobs that reached their status longer ago than the given [`TimeDelta`].
    MaxAge(TimeDelta),
    /// Keep at most the given number of jobs, removing the oldest first.
    MaxLength(u32),
}

/// The executors whose jobs a pruner applies to.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Spec {
    Except(Vec<&'static str>),
    Only(Vec<&'static str>),
}

/// A pruning rule, by default for the jobs of every executor.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Pruner(PruneSpec);

impl Pruner {
    /// Remove jobs with `status` that finished more than `age` ago.
    pub const fn max_age(age: TimeDelta, status: JobStatus) -> Self {
        Self::new(status, PruneBy::MaxAge(age))
    }

    /// Keep only the `length` most recent jobs with `status`.
    pub const fn max_length(length: u32, status: JobStatus) -> Self {
        Self::new(status, PruneBy::MaxLength(length))
    }

    const fn new(status: JobStatus, prune_by: PruneBy) -> Self {
        Self(PruneSpec {
            status,
            prune_by,
            executors: Spec::Except(Vec::new()),
        })
    }

    /// Restrict the pruner to the jobs of `E`, can be chained to name several executors.
    ///
    /// Replaces executors previously excluded with [`Pruner::except`].
    pub fn only<E: Executor>(mut self) -> Self {
        match &mut self.0.executors {
            Spec::Only(executors) => executors.push(E::NAME),
            executors => *executors = Spec::Only(vec![E::NAME]),
        }
        self
    }

    /// Leave the jobs of `E` alone, can be chained to name several executors.
    ///
    /// Replaces executors previously selected with [`Pruner::only`].
    pub fn except<E: Executor>(mut self) -> Self {
        match &mut self.0.executors {
            Spec::Except(executors) => executors.push(E::NAME),
            executors => *executors = Spec::Except(vec![E::NAME]),
        }
        self
    }
}
