use std::fmt;
use std::sync::Arc;
use std::sync::atomic::AtomicI64;
use std::sync::atomic::AtomicU64;
use std::sync::atomic::Ordering;
use std::time::Duration;

use parking_lot::Mutex;
use quanta::Clock;
use rand::Rng;
use rand::SeedableRng;
use rand::rngs::StdRng;

use crate::Reason;
use crate::stamp::AtomicStamp;
use crate::stamp::Timeline;

/// Load assigned to an endpoint whose computed load is zero.
const PENALTY: u64 = 250 * Duration::from_secs(1).as_nanos() as u64;

/// An endpoint not picked for this long is forced on the next comparison.
const FORCE_GAP: u64 = Duration::from_secs(3).as_nanos() as u64;

/// Decay constant of the latency and success averages, in nanos.
const TAU: f64 = Duration::from_millis(600).as_nanos() as f64;

/// Period after which the windowed request counters are cleared.
const REQUEST_RESET: u64 = Duration::from_secs(3).as_nanos() as u64;

const SUCCESS_SCALE: u64 = 1000;
const MAX_VALID_LOAD: u64 = 900;
const PICK_ATTEMPTS: usize = 3;

const INITIAL_INFLIGHT: i64 = 1;
const INITIAL_SUCCESS: u64 = SUCCESS_SCALE / 2;
const INITIAL_SERVER_LOAD: u64 = 500;

struct Endpoint<C> {
    conn: C,
    addr: String,
    /// EWMA of the round trip time, in nanos.
    lag: AtomicU64,
    /// EWMA of the outcome, 0..=SUCCESS_SCALE.
    success: AtomicU64,
    inflight: AtomicI64,
    server_load: AtomicU64,
    last_completion: AtomicStamp,
    last_pick: AtomicStamp,
    requests: AtomicI64,
}

impl<C> Endpoint<C> {
    fn new(addr: String, conn: C) -> Self {
        Self {
            conn,
            addr,
            lag: AtomicU64::new(0),
            success: AtomicU64::new(INITIAL_SUCCESS),
            inflight: AtomicI64::new(INITIAL_INFLIGHT),
            server_load: AtomicU64::new(INITIAL_SERVER_LOAD),
            last_completion: AtomicStamp::absent(),
            last_pick: AtomicStamp::absent(),
            requests: AtomicI64::new(0),
        }
    }

    fn health(&self) -> u64 {
        self.success.load(Ordering::Relaxed)
    }

    fn valid(&self) -> bool {
        self.health() > SUCCESS_SCALE / 2
            && self.server_load.load(Ordering::Relaxed) < MAX_VALID_LOAD
    }

    /// Higher is worse.
    fn load(&self) -> u64 {
        let lag = (self.lag.load(Ordering::Relaxed) as f64).sqrt() as u64 + 1;
        let inflight = self.inflight.load(Ordering::Relaxed).max(0) as u64;
        let load = lag
            .saturating_mul(self.server_load.load(Ordering::Relaxed))
            .saturating_mul(inflight);
        if load == 0 { PENALTY } else { load }
    }

    fn stat(&self) -> EndpointStat {
        EndpointStat {
            addr: self.addr.clone(),
            lag: Duration::from_nanos(self.lag.load(Ordering::Relaxed)),
            success: self.health(),
            inflight: self.inflight.load(Ordering::Relaxed),
            server_load: self.server_load.load(Ordering::Relaxed),
            requests: self.requests.load(Ordering::Relaxed),
        }
    }
}

/// A point-in-time view of one endpoint.
#[derive(Clone, Debug, PartialEq)]
pub struct EndpointStat {
    pub addr: String,
    pub lag: Duration,
    pub success: u64,
    pub inflight: i64,
    pub server_load: u64,
    pub requests: i64,
}

/// What the caller learnt from a completed call.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct DoneInfo {
    pub failed: bool,
    /// Load reported by the server with the response, if any.
    pub server_load: Option<u64>,
}

impl DoneInfo {
    pub fn success() -> Self {
        Self::default()
    }

    pub fn failure() -> Self {
        Self {
            failed: true,
            server_load: None,
        }
    }

    pub fn with_server_load(mut self, load: u64) -> Self {
        self.server_load = Some(load);
        self
    }
}

struct Shared<C> {
    endpoints: Vec<Endpoint<C>>,
    rng: Mutex<StdRng>,
    last_reset: AtomicU64,
    timeline: Timeline,
}

/// Power-of-two-choices balancer.
///
/// Every pick samples two endpoints and keeps the one with the lower
/// `load / health`, where load combines latency, server reported load and
/// inflight requests. An endpoint left out for longer than three seconds is
/// picked regardless, so every endpoint keeps receiving some traffic and its
/// scores stay current.
///
/// A balancer is built from the set of ready connections; rebuild it when that
/// set changes. Cloning is cheap and clones share state.
pub struct P2c<C> {
    shared: Arc<Shared<C>>,
}

impl<C> Clone for P2c<C> {
    fn clone(&self) -> Self {
        Self {
            shared: Arc::clone(&self.shared),
        }
    }
}

impl<C> fmt::Debug for P2c<C> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("P2c")
            .field("endpoints", &self.endpoints())
            .finish()
    }
}

impl<C> P2c<C> {
    pub fn new<I, A>(endpoints: I) -> Self
    where
        I: IntoIterator<Item = (A, C)>,
        A: Into<String>,
    {
        Self::with_clock(endpoints, Clock::new())
    }

    pub fn with_clock<I, A>(endpoints: I, clock: Clock) -> Self
    where
        I: IntoIterator<Item = (A, C)>,
        A: Into<String>,
    {
        let endpoints = endpoints
            .into_iter()
            .map(|(addr, conn)| Endpoint::new(addr.into(), conn))
            .collect();
        Self {
            shared: Arc::new(Shared {
                endpoints,
                rng: Mutex::new(StdRng::from_os_rng()),
                last_reset: AtomicU64::new(0),
                timeline: Timeline::new(clock),
            }),
        }
    }

    /// Make the candidate sampling reproducible.
    pub fn with_seed(self, seed: u64) -> Self {
        *self.shared.rng.lock() = StdRng::seed_from_u64(seed);
        self
    }

    pub fn len(&self) -> usize {
        self.shared.endpoints.len()
    }

    pub fn is_empty(&self) -> bool {
        self.shared.endpoints.is_empty()
    }

    pub fn endpoints(&self) -> Vec<EndpointStat> {
        self.shared.endpoints.iter().map(Endpoint::stat).collect()
    }

    /// Choose the endpoint for the next call.
    ///
    /// # Errors
    ///
    /// Returns [`Reason::NoEndpoint`] if the balancer was built without endpoints.
    pub fn pick(&self) -> Result<Picked<C>, Reason> {
        let shared = &self.shared;
        let start = shared.timeline.now();
        let index = match shared.endpoints.len() {
            0 => return Err(Reason::NoEndpoint),
            1 => 0,
            _ => shared.choose(start),
        };

        let endpoint = &shared.endpoints[index];
        endpoint.inflight.fetch_add(1, Ordering::AcqRel);
        endpoint.requests.fetch_add(1, Ordering::Relaxed);
        Ok(Picked {
            shared: Arc::clone(shared),
            index,
            start,
            completed: false,
        })
    }
}

impl<C> Shared<C> {
    fn sample_pair(&self) -> (usize, usize) {
        let n = self.endpoints.len();
        let mut pair = (0, 1);
        for _ in 0..PICK_ATTEMPTS {
            let (a, mut b) = {
                let mut rng = self.rng.lock();
                (rng.random_range(0..n), rng.random_range(0..n - 1))
            };
            if b == a {
                b += 1;
            }
            pair = (a, b);
            if self.endpoints[a].valid() || self.endpoints[b].valid() {
                break;
            }
        }
        pair
    }

    fn choose(&self, start: u64) -> usize {
        let (a, b) = self.sample_pair();
        let (ea, eb) = (&self.endpoints[a], &self.endpoints[b]);

        // load_a / health_a > load_b / health_b, without dividing
        let (chosen, other) =
            if ea.load().saturating_mul(eb.health()) > eb.load().saturating_mul(ea.health()) {
                (b, a)
            } else {
                (a, b)
            };

        let starved = &self.endpoints[other];
        let last = starved.last_pick.load();
        if last.is_none_or(|t| start.saturating_sub(t) > FORCE_GAP)
            && starved.last_pick.compare_exchange(last, start).is_ok()
        {
            tracing::trace!(addr = %starved.addr, "forcing pick of starved endpoint");
            return other;
        }

        self.endpoints[chosen].last_pick.store(start);
        chosen
    }

    fn complete(&self, index: usize, start: u64, info: DoneInfo) {
        let endpoint = &self.endpoints[index];
        endpoint.inflight.fetch_sub(1, Ordering::AcqRel);

        let now = self.timeline.now();
        let previous = endpoint.last_completion.swap(now);
        let rtt = now.saturating_sub(start) as f64;

        let old_lag = endpoint.lag.load(Ordering::Relaxed);
        let w = match previous {
            // The first sample seeds the average
            _ if old_lag == 0 => 0.0,
            Some(previous) => (-(now.saturating_sub(previous) as f64) / TAU).exp(),
            None => 0.0,
        };

        let lag = old_lag as f64 * w + (1.0 - w) * rtt;
        endpoint.lag.store(lag as u64, Ordering::Relaxed);

        let outcome = if info.failed { 0 } else { SUCCESS_SCALE };
        let old_success = endpoint.success.load(Ordering::Relaxed);
        let success = old_success as f64 * w + (1.0 - w) * outcome as f64;
        endpoint.success.store(success as u64, Ordering::Relaxed);

        if let Some(load) = info.server_load.filter(|load| *load > 0) {
            endpoint.server_load.store(load, Ordering::Relaxed);
        }

        let last_reset = self.last_reset.load(Ordering::Acquire);
        if now.saturating_sub(last_reset) > REQUEST_RESET
            && self
                .last_reset
                .compare_exchange(last_reset, now, Ordering::AcqRel, Ordering::Relaxed)
                .is_ok()
        {
            tracing::trace!("resetting windowed request counters");
            for endpoint in &self.endpoints {
                endpoint.requests.store(0, Ordering::Relaxed);
            }
        }
    }
}

/// The endpoint chosen by [`P2c::pick`], together with its completion hook.
///
/// Dropping it without calling [`Picked::done`] releases the inflight slot but
/// leaves the endpoint's scores untouched.
#[must_use = "a picked endpoint must be completed"]
pub struct Picked<C> {
    shared: Arc<Shared<C>>,
    index: usize,
    start: u64,
    completed: bool,
}

impl<C> fmt::Debug for Picked<C> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Picked")
            .field("addr", &self.addr())
            .field("start", &self.start)
            .finish()
    }
}

impl<C> Picked<C> {
    pub fn conn(&self) -> &C {
        &self.shared.endpoints[self.index].conn
    }

    pub fn addr(&self) -> &str {
        &self.shared.endpoints[self.index].addr
    }

    pub fn done(mut self, info: DoneInfo) {
        self.completed = true;
        self.shared.complete(self.index, self.start, info);
    }
}

impl<C> Drop for Picked<C> {
    fn drop(&mut self) {
        if !self.completed {
            self.shared.endpoints[self.index]
                .inflight
                .fetch_sub(1, Ordering::AcqRel);
        }
    }
}
