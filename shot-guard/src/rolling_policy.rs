use std::time::Duration;

use parking_lot::Mutex;
use quanta::Clock;

use crate::rolling_window::BucketIter;
use crate::rolling_window::Window;
use crate::stamp::Timeline;

#[derive(Debug)]
struct PolicyState {
    window: Window,
    /// Index of the most recently written bucket.
    offset: usize,
    /// Grid-aligned time (nanos on the timeline) of the last write.
    last_append: u64,
}

/// Gives a [`Window`] real-time semantics.
///
/// Buckets are rotated lazily: a write resets every bucket that went stale since
/// the previous write, a reduce only skips them.
#[derive(Debug)]
pub struct RollingPolicy {
    state: Mutex<PolicyState>,
    bucket_ns: u64,
    timeline: Timeline,
}

impl RollingPolicy {
    pub fn new(window: Window, bucket_duration: Duration) -> Self {
        Self::with_clock(window, bucket_duration, Clock::new())
    }

    /// A zero `bucket_duration` is raised to one nanosecond.
    pub fn with_clock(window: Window, bucket_duration: Duration, clock: Clock) -> Self {
        let bucket_ns = u64::try_from(bucket_duration.as_nanos())
            .unwrap_or(u64::MAX)
            .max(1);
        let timeline = Timeline::new(clock);
        Self {
            state: Mutex::new(PolicyState {
                window,
                offset: 0,
                last_append: timeline.now(),
            }),
            bucket_ns,
            timeline,
        }
    }

    pub fn size(&self) -> usize {
        self.state.lock().window.size()
    }

    pub fn bucket_duration(&self) -> Duration {
        Duration::from_nanos(self.bucket_ns)
    }

    /// Whole buckets elapsed since the last write.
    pub fn timespan(&self) -> usize {
        let last_append = self.state.lock().last_append;
        self.span_since(last_append)
    }

    /// Accumulate `val` into the current bucket.
    pub fn add(&self, val: f64) {
        self.write(|window, offset| window.add(offset, val));
    }

    /// Record `val` as a new point in the current bucket.
    pub fn append(&self, val: f64) {
        self.write(|window, offset| window.append(offset, val));
    }

    /// Fold the live buckets, oldest first.
    pub fn reduce<R>(&self, f: impl FnOnce(BucketIter<'_>) -> R) -> R {
        let state = self.state.lock();
        let size = state.window.size();
        let span = self.span_since(state.last_append);
        let count = size.saturating_sub(span);
        // Only meaningful when count > 0; an empty iterator ignores it.
        let start = (state.offset + 1 + span % size) % size;
        f(state.window.iter(start, count))
    }

    fn span_since(&self, last_append: u64) -> usize {
        let elapsed = self.timeline.now().saturating_sub(last_append);
        usize::try_from(elapsed / self.bucket_ns).unwrap_or(usize::MAX)
    }

    fn write(&self, f: impl FnOnce(&mut Window, usize)) {
        let mut state = self.state.lock();
        let span = self.span_since(state.last_append);
        if span > 0 {
            let size = state.window.size();
            let mut offset = state.offset;
            for _ in 0..span.min(size) {
                offset = (offset + 1) % size;
                state.window.reset_bucket(offset);
            }
            state.offset = offset;
            state.last_append = state
                .last_append
                .saturating_add((span as u64).saturating_mul(self.bucket_ns));
        }
        let offset = state.offset;
        f(&mut state.window, offset);
    }
}

#[cfg(test)]
mod tests {
    use std::num::NonZeroUsize;
    use std::sync::Arc;

    use quanta::Mock;

    use super::*;

    fn policy(size: usize, bucket: Duration) -> (RollingPolicy, Arc<Mock>) {
        let (clock, mock) = Clock::mock();
        (
            RollingPolicy::with_clock(Window::new(NonZeroUsize::new(size).unwrap()), bucket, clock),
            mock,
        )
    }

    fn sum(policy: &RollingPolicy) -> f64 {
        policy.reduce(|iter| iter.map(|b| b.sum()).sum())
    }

    #[test]
    fn it_rotates_the_elapsed_buckets() {
        let (policy, mock) = policy(10, Duration::from_millis(100));
        policy.add(1.0);

        mock.increment(Duration::from_millis(250));
        assert_eq!(policy.timespan(), 2);
        policy.add(1.0);

        // Rotation is grid aligned: last append is at 200ms, not 250ms
        assert_eq!(policy.timespan(), 0);
        mock.increment(Duration::from_millis(60));
        assert_eq!(policy.timespan(), 1);

        assert_eq!(policy.state.lock().offset, 2);
        assert_eq!(sum(&policy), 2.0);
    }

    #[test]
    fn it_wraps_around_the_ring() {
        let (policy, mock) = policy(4, Duration::from_millis(10));
        for _ in 0..6 {
            policy.add(1.0);
            mock.increment(Duration::from_millis(10));
        }
        // Six writes into a four bucket ring: offset walked 0..=5, so it is at 1
        assert_eq!(policy.state.lock().offset, 1);
        // The bucket written at 20ms has aged out; three are still live
        assert_eq!(sum(&policy), 3.0);
    }

    #[test]
    fn it_resets_everything_after_a_long_idle() {
        let (policy, mock) = policy(5, Duration::from_millis(10));
        for _ in 0..5 {
            policy.add(2.0);
            mock.increment(Duration::from_millis(10));
        }
        mock.increment(Duration::from_secs(10));
        policy.add(1.0);

        let total: u64 = policy.reduce(|iter| iter.map(|b| b.count()).sum());
        assert_eq!(total, 1);
        assert_eq!(sum(&policy), 1.0);
    }

    #[test]
    fn reduce_skips_stale_buckets_without_clearing_them() {
        let (policy, mock) = policy(3, Duration::from_millis(10));
        policy.add(5.0);

        mock.increment(Duration::from_millis(30));
        assert_eq!(sum(&policy), 0.0);
        assert_eq!(policy.reduce(|iter| iter.len()), 0);

        // The data is still there until a write rotates it away
        assert_eq!(policy.state.lock().window.bucket(0).sum(), 5.0);
    }

    #[test]
    fn reduce_sees_a_shrinking_window() {
        let (policy, mock) = policy(4, Duration::from_millis(10));
        policy.add(1.0);

        for expected in [4, 3, 2, 1, 0] {
            assert_eq!(policy.reduce(|iter| iter.len()), expected);
            mock.increment(Duration::from_millis(10));
        }
    }

    #[test]
    fn zero_bucket_duration_is_clamped() {
        let (policy, mock) = policy(3, Duration::ZERO);
        assert_eq!(policy.bucket_duration(), Duration::from_nanos(1));

        policy.add(1.0);
        assert_eq!(sum(&policy), 1.0);
        mock.increment(3);
        assert_eq!(sum(&policy), 0.0);
    }

    #[test]
    fn it_keeps_append_and_add_separate() {
        let (policy, _mock) = policy(2, Duration::from_secs(1));
        policy.append(1.0);
        policy.append(2.0);

        let points = policy.reduce(|iter| iter.map(|b| b.points().len()).sum::<usize>());
        assert_eq!(points, 2);
    }
}
