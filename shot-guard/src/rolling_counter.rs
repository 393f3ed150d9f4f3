use std::num::NonZeroUsize;
use std::time::Duration;

use quanta::Clock;

use crate::rolling_policy::RollingPolicy;
use crate::rolling_window::BucketIter;
use crate::rolling_window::Window;

/// A rolling window of `size` buckets, each `bucket_duration` wide.
///
/// Writes accumulate into the current bucket; reads fold over the buckets which
/// are still inside the trailing `size * bucket_duration` interval.
#[derive(Debug)]
pub struct RollingCounter {
    policy: RollingPolicy,
}

impl RollingCounter {
    pub fn new(size: NonZeroUsize, bucket_duration: Duration) -> Self {
        Self::with_clock(size, bucket_duration, Clock::new())
    }

    /// A zero `bucket_duration` is raised to one nanosecond.
    pub fn with_clock(size: NonZeroUsize, bucket_duration: Duration, clock: Clock) -> Self {
        Self {
            policy: RollingPolicy::with_clock(Window::new(size), bucket_duration, clock),
        }
    }

    /// Add `val` to the running point of the current bucket.
    ///
    /// Negative and NaN values are ignored.
    pub fn add(&self, val: f64) {
        if val >= 0.0 {
            self.policy.add(val);
        }
    }

    /// Record `val` as a distinct point of the current bucket.
    ///
    /// Negative and NaN values are ignored.
    pub fn append(&self, val: f64) {
        if val >= 0.0 {
            self.policy.append(val);
        }
    }

    /// Whole buckets elapsed since the last write.
    pub fn timespan(&self) -> usize {
        self.policy.timespan()
    }

    pub fn size(&self) -> usize {
        self.policy.size()
    }

    pub fn bucket_duration(&self) -> Duration {
        self.policy.bucket_duration()
    }

    pub fn reduce<R>(&self, f: impl FnOnce(BucketIter<'_>) -> R) -> R {
        self.policy.reduce(f)
    }

    pub fn sum(&self) -> f64 {
        self.reduce(sum)
    }

    pub fn avg(&self) -> f64 {
        self.reduce(avg)
    }

    pub fn min(&self) -> f64 {
        self.reduce(min)
    }

    pub fn max(&self) -> f64 {
        self.reduce(max)
    }

    /// Number of writes across the live buckets.
    pub fn count(&self) -> u64 {
        self.reduce(count)
    }

    pub fn value(&self) -> f64 {
        self.sum()
    }
}

fn points<'a>(iter: BucketIter<'a>) -> impl Iterator<Item = f64> + 'a {
    iter.flat_map(|bucket| bucket.points().iter().copied())
}

pub(crate) fn sum(iter: BucketIter<'_>) -> f64 {
    points(iter).sum()
}

pub(crate) fn avg(iter: BucketIter<'_>) -> f64 {
    let (total, n) = points(iter).fold((0.0, 0usize), |(t, n), p| (t + p, n + 1));
    if n == 0 { 0.0 } else { total / n as f64 }
}

pub(crate) fn min(iter: BucketIter<'_>) -> f64 {
    points(iter).reduce(f64::min).unwrap_or(0.0)
}

pub(crate) fn max(iter: BucketIter<'_>) -> f64 {
    points(iter).reduce(f64::max).unwrap_or(0.0)
}

pub(crate) fn count(iter: BucketIter<'_>) -> u64 {
    iter.map(|bucket| bucket.count()).sum()
}
