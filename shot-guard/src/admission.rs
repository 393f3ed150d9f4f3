use std::num::NonZeroUsize;
use std::sync::Arc;
use std::sync::atomic::AtomicI64;
use std::sync::atomic::AtomicU64;
use std::sync::atomic::Ordering;
use std::time::Duration;

use quanta::Clock;
use serde::Deserialize;
use serde::Serialize;

use crate::Reason;
use crate::cpu::CpuGauge;
use crate::rolling_counter::RollingCounter;
use crate::rolling_window::Bucket;
use crate::stamp::AtomicStamp;
use crate::stamp::Timeline;

/// How long a drop keeps the inflight check armed once CPU falls again.
const DROP_GUARD: u64 = Duration::from_secs(1).as_nanos() as u64;

const NANOS_PER_MILLI: u64 = Duration::from_millis(1).as_nanos() as u64;

/// Configuration of an [`AdmissionController`].
///
/// Zero values are replaced with the defaults when the controller is built.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct AdmissionConfig {
    /// When false every request is admitted and nothing is recorded.
    pub enabled: bool,
    /// Length of the statistics window.
    #[serde(with = "humantime_serde")]
    pub window: Duration,
    /// Number of buckets the window is split into.
    pub bucket_count: usize,
    /// Smoothed CPU usage (0..=1000) at which shedding starts.
    pub cpu_threshold: u64,
}

impl Default for AdmissionConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            window: Duration::from_secs(10),
            bucket_count: 100,
            cpu_threshold: 800,
        }
    }
}

impl AdmissionConfig {
    pub fn with_enabled(mut self, enabled: bool) -> Self {
        self.enabled = enabled;
        self
    }

    pub fn with_window(mut self, window: Duration) -> Self {
        self.window = window;
        self
    }

    pub fn with_bucket_count(mut self, bucket_count: usize) -> Self {
        self.bucket_count = bucket_count;
        self
    }

    pub fn with_cpu_threshold(mut self, cpu_threshold: u64) -> Self {
        self.cpu_threshold = cpu_threshold;
        self
    }

    /// Replace zero-valued fields with their defaults.
    pub fn normalized(mut self) -> Self {
        let defaults = Self::default();
        if self.window.is_zero() {
            self.window = defaults.window;
        }
        if self.bucket_count == 0 {
            self.bucket_count = defaults.bucket_count;
        }
        if self.cpu_threshold == 0 {
            self.cpu_threshold = defaults.cpu_threshold;
        }
        self
    }

    /// Width of a single bucket, never less than a nanosecond.
    pub fn bucket_duration(&self) -> Duration {
        let buckets = u32::try_from(self.bucket_count).unwrap_or(u32::MAX).max(1);
        (self.window / buckets).max(Duration::from_nanos(1))
    }

    /// `bucket_count` as a ring size, at least one.
    pub fn window_size(&self) -> NonZeroUsize {
        NonZeroUsize::new(self.bucket_count).unwrap_or(NonZeroUsize::MIN)
    }
}

/// How a call admitted by an [`AdmissionController`] ended.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Outcome {
    /// Useful work was done; counts towards throughput.
    Success,
    /// The call did not do useful work; only its latency is recorded.
    Ignore,
    /// The call was given up on; only its latency is recorded.
    Drop,
}

/// A snapshot of the controller's view of the system.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct AdmissionStat {
    pub cpu: u64,
    pub inflight: i64,
    pub max_flight: u64,
    pub min_rt: u64,
    pub max_pass: u64,
}

#[derive(Debug)]
struct Inner {
    config: AdmissionConfig,
    cpu: Arc<CpuGauge>,
    /// Completed successful requests per bucket.
    pass_stat: RollingCounter,
    /// Round trip times in milliseconds.
    rt_stat: RollingCounter,
    inflight: AtomicI64,
    buckets_per_sec: u64,
    prev_drop: AtomicStamp,
    raw_max_pass: AtomicU64,
    raw_min_rt: AtomicU64,
    timeline: Timeline,
}

/// CPU and concurrency aware overload shedding.
///
/// The controller keeps the peak per-bucket throughput and the best per-bucket
/// latency of its recent window. Their product (Little's law) estimates how many
/// requests can be in flight before queueing starts. Once the process CPU passes
/// the threshold, requests above that estimate are dropped.
///
/// Cloning is cheap; clones share all state.
#[derive(Clone, Debug)]
pub struct AdmissionController {
    inner: Arc<Inner>,
}

impl AdmissionController {
    pub fn new(config: AdmissionConfig, cpu: Arc<CpuGauge>) -> Self {
        Self::with_clock(config, cpu, Clock::new())
    }

    pub fn with_clock(config: AdmissionConfig, cpu: Arc<CpuGauge>, clock: Clock) -> Self {
        let config = config.normalized();
        let bucket_duration = config.bucket_duration();
        let buckets_per_sec = (Duration::from_secs(1).as_nanos() / bucket_duration.as_nanos())
            .max(1) as u64;

        let inner = Inner {
            pass_stat: RollingCounter::with_clock(
                config.window_size(),
                bucket_duration,
                clock.clone(),
            ),
            rt_stat: RollingCounter::with_clock(config.window_size(), bucket_duration, clock.clone()),
            config,
            cpu,
            inflight: AtomicI64::new(0),
            buckets_per_sec,
            prev_drop: AtomicStamp::absent(),
            raw_max_pass: AtomicU64::new(0),
            raw_min_rt: AtomicU64::new(0),
            timeline: Timeline::new(clock),
        };
        Self {
            inner: Arc::new(inner),
        }
    }

    pub fn config(&self) -> &AdmissionConfig {
        &self.inner.config
    }

    /// Admit or reject a request.
    ///
    /// On success the returned [`Completion`] must be completed once the real call
    /// has finished. A rejection has no side effects.
    pub fn allow(&self) -> Result<Completion, Reason> {
        let inner = &self.inner;
        if !inner.config.enabled {
            return Ok(Completion {
                inner: None,
                start: 0,
            });
        }
        if inner.should_drop() {
            return Err(Reason::Overloaded);
        }
        inner.inflight.fetch_add(1, Ordering::AcqRel);
        Ok(Completion {
            inner: Some(Arc::clone(inner)),
            start: inner.timeline.now(),
        })
    }

    pub fn stat(&self) -> AdmissionStat {
        let inner = &self.inner;
        AdmissionStat {
            cpu: inner.cpu.get(),
            inflight: inner.inflight.load(Ordering::Acquire),
            max_flight: inner.max_flight(),
            min_rt: inner.min_rt(),
            max_pass: inner.max_pass(),
        }
    }
}

impl Inner {
    /// Buckets considered by `max_pass` and `min_rt`. The newest is left out when
    /// the whole window is live, so a half-filled bucket does not count.
    fn stat_buckets(&self) -> usize {
        self.config.bucket_count.saturating_sub(1)
    }

    fn max_pass(&self) -> u64 {
        let cached = self.raw_max_pass.load(Ordering::Acquire);
        if cached > 0 && self.pass_stat.timespan() < 1 {
            return cached;
        }
        let limit = self.stat_buckets();
        let peak = self
            .pass_stat
            .reduce(|iter| iter.take(limit).map(Bucket::sum).fold(1.0, f64::max));
        let peak = (peak as u64).max(1);
        self.raw_max_pass.store(peak, Ordering::Release);
        peak
    }

    fn min_rt(&self) -> u64 {
        let cached = self.raw_min_rt.load(Ordering::Acquire);
        if cached > 0 && self.rt_stat.timespan() < 1 {
            return cached;
        }
        let limit = self.stat_buckets();
        let best = self.rt_stat.reduce(|iter| {
            iter.take(limit)
                .filter(|bucket| bucket.count() > 0)
                .map(|bucket| bucket.sum() / bucket.count() as f64)
                .reduce(f64::min)
        });
        let best = best.map_or(1, |rt| rt as u64).max(1);
        self.raw_min_rt.store(best, Ordering::Release);
        best
    }

    fn max_flight(&self) -> u64 {
        let product = self
            .max_pass()
            .saturating_mul(self.min_rt())
            .saturating_mul(self.buckets_per_sec);
        (product as f64 / 1000.0 + 0.5).floor() as u64
    }

    fn exceeds_max_flight(&self, inflight: i64) -> bool {
        inflight > 0 && inflight as u64 > self.max_flight()
    }

    fn should_drop(&self) -> bool {
        let now = self.timeline.now();
        if self.cpu.get() < self.config.cpu_threshold {
            let Some(prev) = self.prev_drop.load() else {
                return false;
            };
            if now.saturating_sub(prev) <= DROP_GUARD {
                let inflight = self.inflight.load(Ordering::Acquire);
                return inflight > 1 && self.exceeds_max_flight(inflight);
            }
            self.prev_drop.clear();
            return false;
        }

        let inflight = self.inflight.load(Ordering::Acquire);
        let drop = self.exceeds_max_flight(inflight);
        if drop {
            tracing::debug!(
                cpu = self.cpu.get(),
                inflight,
                max_flight = self.max_flight(),
                "admission controller dropped request"
            );
            self.prev_drop.store(now);
        }
        drop
    }

    fn complete(&self, start: u64, outcome: Outcome) {
        let rt = self.timeline.now().saturating_sub(start) / NANOS_PER_MILLI;
        self.rt_stat.add(rt as f64);
        self.inflight.fetch_sub(1, Ordering::AcqRel);
        if outcome == Outcome::Success {
            self.pass_stat.add(1.0);
        }
    }
}

/// Completion hook of an admitted request.
///
/// Dropping it without calling [`Completion::done`] completes it as
/// [`Outcome::Ignore`], so an abandoned request never leaks an inflight slot.
#[derive(Debug)]
#[must_use = "an admitted request must be completed"]
pub struct Completion {
    inner: Option<Arc<Inner>>,
    start: u64,
}

impl Completion {
    pub fn done(mut self, outcome: Outcome) {
        self.finish(outcome);
    }

    fn finish(&mut self, outcome: Outcome) {
        if let Some(inner) = self.inner.take() {
            inner.complete(self.start, outcome);
        }
    }
}

impl Drop for Completion {
    fn drop(&mut self) {
        self.finish(Outcome::Ignore);
    }
}
