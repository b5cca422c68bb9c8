//! Delays before failed computation jobs are attempted again.
//!
//! Jobs are retried with exponential backoff: the first retry waits `base`, every further retry
//! waits twice as long as the one before, up to `max`. A relative jitter spreads out the retries
//! of jobs that failed together, e.g. while the data management API was unavailable.
//!
//! ```
//! # use script_engine::prelude::*;
//! # use chrono::TimeDelta;
//! let backoff = RetryBackoff::new(TimeDelta::seconds(2), TimeDelta::seconds(30));
//!
//! assert_eq!(backoff.delay(1), TimeDelta::seconds(2));
//! assert_eq!(backoff.delay(3), TimeDelta::seconds(8));
//! assert_eq!(backoff.delay(5), TimeDelta::seconds(30));
//! ```
use chrono::TimeDelta;
use rand::Rng;

/// Computes the delay before the next attempt of a job.
pub trait Strategy {
    /// The delay after the given (one based) attempt failed.
    fn delay(&self, attempt: u16) -> TimeDelta;
}

/// A fixed delay regardless of the attempt.
impl Strategy for TimeDelta {
    fn delay(&self, _attempt: u16) -> TimeDelta {
        *self
    }
}

/// Exponential backoff with an upper bound and optional relative jitter.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct RetryBackoff {
    base: TimeDelta,
    max: TimeDelta,
    jitter: f64,
}

impl RetryBackoff {
    pub const fn new(base: TimeDelta, max: TimeDelta) -> Self {
        Self {
            base,
            max,
            jitter: 0.0,
        }
    }

    /// Move every delay randomly by up to `ratio` of its value in either direction.
    ///
    /// The jittered delay may exceed `max` by the same ratio.
    pub const fn with_jitter(mut self, ratio: f64) -> Self {
        self.jitter = ratio;
        self
    }

    fn undisturbed(&self, attempt: u16) -> TimeDelta {
        let exponent = u32::from(attempt.saturating_sub(1)).min(62);
        let milliseconds = self
            .base
            .num_milliseconds()
            .checked_mul(1 << exponent)
            .unwrap_or(i64::MAX)
            .min(self.max.num_milliseconds());
        TimeDelta::milliseconds(milliseconds)
    }
}

impl Strategy for RetryBackoff {
    fn delay(&self, attempt: u16) -> TimeDelta {
        let delay = self.undisturbed(attempt);
        let spread = (delay.num_milliseconds() as f64 * self.jitter.abs()).round() as i64;
        if spread == 0 {
            return delay;
        }
        let offset = rand::thread_rng().gen_range(-spread..=spread);
        (delay + TimeDelta::milliseconds(offset)).max(TimeDelta::zero())
    }
}
