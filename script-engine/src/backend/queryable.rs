//! In process evaluation of [`Query`] and [`PruneSpec`] against stored jobs.
//!
//! Backends without a native query language (the in-memory and Redis backends) load the jobs
//! and filter them with [`Queryable::matches`].
use chrono::{DateTime, Utc};

use crate::pruner::{PruneBy, PruneSpec, Spec};

use super::{Job, Query};

pub trait Queryable {
    fn matches(&self, job: &Job) -> bool;
}

impl<'a> Queryable for Query<'a> {
    fn matches(&self, job: &Job) -> bool {
        match self {
            Query::Not(inner) => !inner.matches(job),
            Query::And(inner) => inner.iter().all(|query| query.matches(job)),
            Query::Or(inner) => inner.iter().any(|query| query.matches(job)),
            Query::ExecutorEqual(executor) => job.executor == *executor,
            Query::IdEquals(id) => job.id == i32::from(*id),
            Query::StatusEqual(status) => job.status == *status,
            Query::ScheduledAtBefore(scheduled_at) => job.scheduled_at < *scheduled_at,
            Query::ScheduledAtAfter(scheduled_at) => job.scheduled_at > *scheduled_at,
        }
    }
}

impl Queryable for PruneSpec {
    fn matches(&self, job: &Job) -> bool {
        job.status == self.status && self.executors.matches(job)
    }
}

impl PruneSpec {
    /// The ids of the jobs this spec removes out of `jobs`.
    pub fn pruned_ids<'a>(
        &self,
        jobs: impl IntoIterator<Item = &'a Job>,
        now: DateTime<Utc>,
    ) -> Vec<i32> {
        let matching = jobs.into_iter().filter(|job| self.matches(job));
        match self.prune_by {
            PruneBy::MaxAge(age) => {
                let oldest_kept = now - age;
                matching
                    .filter(|job| job.finished_at() < oldest_kept)
                    .map(|job| job.id)
                    .collect()
            }
            PruneBy::MaxLength(length) => {
                let mut ids: Vec<i32> = matching.map(|job| job.id).collect();
                // newest jobs first, everything past `length` goes
                ids.sort_unstable_by(|a, b| b.cmp(a));
                ids.into_iter().skip(length as usize).collect()
            }
        }
    }
}

impl Queryable for Spec {
    fn matches(&self, job: &Job) -> bool {
        match self {
            Spec::Except(executors) => executors.iter().all(|&executor| executor != job.executor),
            Spec::Only(executors) => executors.iter().any(|&executor| executor == job.executor),
        }
    }
}
