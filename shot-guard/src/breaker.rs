use std::num::NonZeroUsize;
use std::sync::atomic::AtomicU8;
use std::sync::atomic::Ordering;
use std::time::Duration;

use parking_lot::Mutex;
use quanta::Clock;
use rand::Rng;
use rand::SeedableRng;
use rand::rngs::StdRng;
use serde::Deserialize;
use serde::Serialize;

use crate::Reason;
use crate::rolling_counter::RollingCounter;

/// A client-side circuit breaker.
///
/// Callers check [`Breaker::allow`] before a call and report how the call went
/// with [`Breaker::mark_success`] or [`Breaker::mark_failed`].
pub trait Breaker: Send + Sync {
    /// # Errors
    ///
    /// Returns [`Reason::Unavailable`] if the call should not be made.
    fn allow(&self) -> Result<(), Reason>;

    fn mark_success(&self);

    fn mark_failed(&self);
}

/// Informational state of an [`SreBreaker`]. It does not gate anything by itself.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum BreakerState {
    Closed,
    Open,
}

const STATE_CLOSED: u8 = 0;
const STATE_OPEN: u8 = 1;

/// Configuration of an [`SreBreaker`].
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct BreakerConfig {
    pub enabled: bool,
    /// How many requests per success are tolerated before rejecting.
    pub k: f64,
    #[serde(with = "humantime_serde")]
    pub window: Duration,
    pub bucket_count: usize,
    /// Below this many requests in the window the breaker never rejects.
    pub min_requests: u64,
}

impl Default for BreakerConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            k: 1.5,
            window: Duration::from_secs(3),
            bucket_count: 10,
            min_requests: 100,
        }
    }
}

impl BreakerConfig {
    pub fn with_enabled(mut self, enabled: bool) -> Self {
        self.enabled = enabled;
        self
    }

    pub fn with_k(mut self, k: f64) -> Self {
        self.k = k;
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

    pub fn with_min_requests(mut self, min_requests: u64) -> Self {
        self.min_requests = min_requests;
        self
    }

    /// Replace zero-valued fields with their defaults.
    pub fn normalized(mut self) -> Self {
        let defaults = Self::default();
        if self.k == 0.0 {
            self.k = defaults.k;
        }
        if self.window.is_zero() {
            self.window = defaults.window;
        }
        if self.bucket_count == 0 {
            self.bucket_count = defaults.bucket_count;
        }
        if self.min_requests == 0 {
            self.min_requests = defaults.min_requests;
        }
        self
    }

    pub fn bucket_duration(&self) -> Duration {
        let buckets = u32::try_from(self.bucket_count).unwrap_or(u32::MAX).max(1);
        (self.window / buckets).max(Duration::from_nanos(1))
    }

    /// `bucket_count` as a ring size, at least one.
    pub fn window_size(&self) -> NonZeroUsize {
        NonZeroUsize::new(self.bucket_count).unwrap_or(NonZeroUsize::MIN)
    }
}

/// The adaptive throttling breaker from Google's SRE book.
///
/// Over the window, a request is rejected with probability
/// `max(0, (total - k * success) / (total + 1))`. There is no half-open state:
/// the breaker recovers as old failures age out of the window.
#[derive(Debug)]
pub struct SreBreaker {
    config: BreakerConfig,
    /// One point per outcome: 1 for a success, 0 for a failure.
    stat: RollingCounter,
    rng: Mutex<StdRng>,
    state: AtomicU8,
}

impl SreBreaker {
    pub fn new(config: BreakerConfig) -> Self {
        Self::with_clock(config, Clock::new())
    }

    pub fn with_clock(config: BreakerConfig, clock: Clock) -> Self {
        let config = config.normalized();
        Self {
            stat: RollingCounter::with_clock(config.window_size(), config.bucket_duration(), clock),
            config,
            rng: Mutex::new(StdRng::from_os_rng()),
            state: AtomicU8::new(STATE_CLOSED),
        }
    }

    /// Make the rejection draws reproducible.
    pub fn with_seed(self, seed: u64) -> Self {
        *self.rng.lock() = StdRng::seed_from_u64(seed);
        self
    }

    pub fn config(&self) -> &BreakerConfig {
        &self.config
    }

    pub fn state(&self) -> BreakerState {
        match self.state.load(Ordering::Relaxed) {
            STATE_OPEN => BreakerState::Open,
            _ => BreakerState::Closed,
        }
    }

    /// Successes and total outcomes over the live window.
    pub fn summary(&self) -> (u64, u64) {
        self.stat.reduce(|iter| {
            iter.fold((0, 0), |(success, total), bucket| {
                (success + bucket.sum() as u64, total + bucket.count())
            })
        })
    }

    fn should_reject(&self, p: f64) -> bool {
        self.rng.lock().random::<f64>() < p
    }
}

impl Breaker for SreBreaker {
    fn allow(&self) -> Result<(), Reason> {
        if !self.config.enabled {
            return Ok(());
        }

        let (success, total) = self.summary();
        let accepted = self.config.k * success as f64;
        if total < self.config.min_requests || (total as f64) < accepted {
            self.state.store(STATE_CLOSED, Ordering::Relaxed);
            return Ok(());
        }

        self.state.store(STATE_OPEN, Ordering::Relaxed);
        let p = ((total as f64 - accepted) / (total + 1) as f64).max(0.0);
        if self.should_reject(p) {
            tracing::debug!(success, total, p, "breaker rejected request");
            return Err(Reason::Unavailable);
        }
        Ok(())
    }

    fn mark_success(&self) {
        if self.config.enabled {
            self.stat.add(1.0);
        }
    }

    fn mark_failed(&self) {
        // Counts towards the total but not towards success
        if self.config.enabled {
            self.stat.add(0.0);
        }
    }
}
