use std::fmt;
use std::sync::Arc;
use std::sync::atomic::AtomicU64;
use std::sync::atomic::Ordering;
use std::time::Duration;

use tokio::task::JoinHandle;
use tokio::time::MissedTickBehavior;

/// Weight given to the previous smoothed value on every sample.
const DECAY: f64 = 0.95;

const DEFAULT_INTERVAL: Duration = Duration::from_millis(500);

/// A source of instantaneous CPU utilisation, scaled to 0..=1000.
pub trait CpuUsage: Send + Sync {
    fn usage(&self) -> u64;
}

impl<F> CpuUsage for F
where
    F: Fn() -> u64 + Send + Sync,
{
    fn usage(&self) -> u64 {
        self()
    }
}

/// Smoothed CPU utilisation, shared by every admission controller of a process.
///
/// The average is kept at full precision, as `f64` bits, and read back rounded.
#[derive(Debug, Default)]
pub struct CpuGauge {
    smoothed: AtomicU64,
}

impl CpuGauge {
    pub fn new() -> Self {
        Self::default()
    }

    #[inline]
    pub fn get(&self) -> u64 {
        self.smoothed().round() as u64
    }

    pub fn set(&self, value: u64) {
        self.set_smoothed(value as f64);
    }

    fn smoothed(&self) -> f64 {
        f64::from_bits(self.smoothed.load(Ordering::Relaxed))
    }

    fn set_smoothed(&self, value: f64) {
        self.smoothed.store(value.to_bits(), Ordering::Relaxed);
    }
}

/// Periodically folds a [`CpuUsage`] reading into a [`CpuGauge`].
pub struct CpuSampler<U> {
    source: U,
    gauge: Arc<CpuGauge>,
    interval: Duration,
}

impl<U> fmt::Debug for CpuSampler<U> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("CpuSampler")
            .field("gauge", &self.gauge)
            .field("interval", &self.interval)
            .finish_non_exhaustive()
    }
}

impl<U> CpuSampler<U>
where
    U: CpuUsage + 'static,
{
    pub fn new(source: U, gauge: Arc<CpuGauge>) -> Self {
        Self {
            source,
            gauge,
            interval: DEFAULT_INTERVAL,
        }
    }

    /// Set the sampling period. Zero keeps the default.
    pub fn with_interval(mut self, interval: Duration) -> Self {
        if !interval.is_zero() {
            self.interval = interval;
        }
        self
    }

    pub fn gauge(&self) -> Arc<CpuGauge> {
        Arc::clone(&self.gauge)
    }

    /// Take one reading and publish the smoothed value.
    pub fn sample_once(&self) -> u64 {
        let prev = self.gauge.smoothed();
        let usage = self.source.usage().min(1000) as f64;
        self.gauge.set_smoothed(prev * DECAY + (1.0 - DECAY) * usage);
        self.gauge.get()
    }

    /// Sample on a fixed interval until the returned handle is stopped or dropped.
    ///
    /// # Panics
    ///
    /// Panics if called outside of a tokio runtime.
    pub fn start(self) -> SamplerHandle {
        let interval = self.interval;
        let gauge = self.gauge();
        tracing::debug!(?interval, "starting cpu sampler");
        let task = tokio::spawn(async move {
            let mut ticker = tokio::time::interval(interval);
            ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
            loop {
                ticker.tick().await;
                self.sample_once();
            }
        });
        SamplerHandle { task, gauge }
    }
}

/// Owns the background sampling task.
#[derive(Debug)]
pub struct SamplerHandle {
    task: JoinHandle<()>,
    gauge: Arc<CpuGauge>,
}

impl SamplerHandle {
    pub fn gauge(&self) -> Arc<CpuGauge> {
        Arc::clone(&self.gauge)
    }

    pub fn is_running(&self) -> bool {
        !self.task.is_finished()
    }

    pub fn stop(self) {
        self.task.abort();
    }
}

impl Drop for SamplerHandle {
    fn drop(&mut self) {
        tracing::debug!("stopping cpu sampler");
        self.task.abort();
    }
}
