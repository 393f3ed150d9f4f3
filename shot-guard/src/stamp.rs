use std::sync::atomic::AtomicU64;
use std::sync::atomic::Ordering;

use quanta::Clock;
use quanta::Instant;

/// Raw value used to mark an [`AtomicStamp`] that holds no timestamp.
const ABSENT: u64 = u64::MAX;

/// A monotonic nanosecond timeline anchored at construction.
///
/// All timestamps shared between threads are expressed on a `Timeline` so they fit
/// into a single `AtomicU64`.
#[derive(Clone, Debug)]
pub struct Timeline {
    clock: Clock,
    anchor: Instant,
}

impl Timeline {
    pub fn new(clock: Clock) -> Self {
        let anchor = clock.now();
        Self { clock, anchor }
    }

    /// Nanoseconds elapsed since the anchor.
    #[inline]
    pub fn now(&self) -> u64 {
        self.clock.now().duration_since(self.anchor).as_nanos() as u64
    }
}

impl Default for Timeline {
    fn default() -> Self {
        Self::new(Clock::new())
    }
}

/// An optional timestamp which can be shared between threads.
///
/// The absent state is explicit, so a stamp recorded at nanosecond zero of its
/// timeline is never mistaken for "never happened".
#[derive(Debug)]
pub struct AtomicStamp(AtomicU64);

impl AtomicStamp {
    pub const fn absent() -> Self {
        Self(AtomicU64::new(ABSENT))
    }

    pub const fn new(nanos: u64) -> Self {
        Self(AtomicU64::new(nanos))
    }

    #[inline]
    pub fn load(&self) -> Option<u64> {
        decode(self.0.load(Ordering::Acquire))
    }

    #[inline]
    pub fn store(&self, nanos: u64) {
        self.0.store(nanos, Ordering::Release);
    }

    #[inline]
    pub fn clear(&self) {
        self.0.store(ABSENT, Ordering::Release);
    }

    /// Store `nanos` and return the previous value.
    #[inline]
    pub fn swap(&self, nanos: u64) -> Option<u64> {
        decode(self.0.swap(nanos, Ordering::AcqRel))
    }

    /// Replace `current` with `new`, failing with the actual value if another
    /// thread got there first.
    #[inline]
    pub fn compare_exchange(&self, current: Option<u64>, new: u64) -> Result<(), Option<u64>> {
        self.0
            .compare_exchange(
                current.unwrap_or(ABSENT),
                new,
                Ordering::AcqRel,
                Ordering::Acquire,
            )
            .map(|_| ())
            .map_err(decode)
    }
}

impl Default for AtomicStamp {
    fn default() -> Self {
        Self::absent()
    }
}

#[inline]
fn decode(raw: u64) -> Option<u64> {
    (raw != ABSENT).then_some(raw)
}
