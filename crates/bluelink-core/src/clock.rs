//! Clock abstraction.

use chrono::{DateTime, Utc};
use std::time::Instant;

/// Source of timestamps and monotonic instants.
///
/// Persisted timestamps come from `now`; durations are measured between
/// `monotonic` instants so they survive wall-clock adjustments.
pub trait Clock: Send + Sync {
    fn now(&self) -> DateTime<Utc>;
    fn monotonic(&self) -> Instant;
}

/// System clock used outside of tests.
#[derive(Debug, Default, Clone, Copy)]
pub struct SystemClock;

impl Clock for SystemClock {
    fn now(&self) -> DateTime<Utc> {
        Utc::now()
    }

    fn monotonic(&self) -> Instant {
        Instant::now()
    }
}
