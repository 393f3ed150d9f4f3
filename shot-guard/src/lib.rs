//! # shot-guard
//!
//! `shot-guard` decides, per outbound request, whether a call should be admitted,
//! rejected or routed, using live load signals instead of static limits.
//!
//! ## Core Philosophy
//!
//! Every policy is fed by the outcome of the calls it admitted. A caller asks the
//! policy before issuing a real RPC and reports back once the RPC completes; the
//! statistics gathered this way drive the next decision.
//!
//! ## Key Concepts
//!
//! * **Rolling Counter**: a fixed ring of time buckets with lazy rotation. It is the
//!   statistical substrate shared by the admission controller and the breaker.
//! * **Admission Controller**: CPU and concurrency aware overload shedding, using a
//!   Little's law estimate of the sustainable in-flight count.
//! * **SRE Breaker**: probabilistic rejection driven by the ratio of total to
//!   successful requests.
//! * **P2C Balancer**: power-of-two-choices endpoint selection over EWMA scores.
//!
//! ## Example
//!
//! ```rust
//! use std::sync::Arc;
//!
//! use shot_guard::AdmissionConfig;
//! use shot_guard::AdmissionController;
//! use shot_guard::CpuGauge;
//! use shot_guard::Outcome;
//!
//! let gauge = Arc::new(CpuGauge::new());
//! let controller = AdmissionController::new(AdmissionConfig::default(), gauge);
//!
//! if let Ok(completion) = controller.allow() {
//!     // Issue the real call here
//!     completion.done(Outcome::Success);
//! }
//! ```

mod admission;
mod breaker;
mod cpu;
mod p2c;
mod rolling_counter;
mod rolling_policy;
mod rolling_window;
mod stamp;

pub use admission::AdmissionConfig;
pub use admission::AdmissionController;
pub use admission::AdmissionStat;
pub use admission::Completion;
pub use admission::Outcome;
pub use breaker::Breaker;
pub use breaker::BreakerConfig;
pub use breaker::BreakerState;
pub use breaker::SreBreaker;
pub use cpu::CpuGauge;
pub use cpu::CpuSampler;
pub use cpu::CpuUsage;
pub use cpu::SamplerHandle;
pub use p2c::DoneInfo;
pub use p2c::EndpointStat;
pub use p2c::P2c;
pub use p2c::Picked;
pub use rolling_counter::RollingCounter;
pub use rolling_policy::RollingPolicy;
pub use rolling_window::Bucket;
pub use rolling_window::BucketIter;
pub use rolling_window::Window;
pub use stamp::AtomicStamp;
pub use stamp::Timeline;

/// Reasons why a request might be rejected by a policy.
#[derive(Debug, Clone, Copy, PartialEq, Eq, thiserror::Error)]
pub enum Reason {
    /// The admission controller estimates the caller is past its capacity.
    #[error("overloaded; request dropped")]
    Overloaded,

    /// The circuit breaker rejected the call.
    #[error("service unavailable")]
    Unavailable,

    /// The balancer has no endpoint to pick from.
    #[error("no endpoint available")]
    NoEndpoint,
}
