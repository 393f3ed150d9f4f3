//! # Tower Guard
//!
//! `tower-guard` runs the client-side policies of [`shot_guard`] as middleware for
//! the [Tower](https://github.com/tower-rs/tower) ecosystem.
//!
//! ## The Guarded Stack
//! A typical client stacks the layers outside-in:
//!
//! 1. **Admission**: [`AdmissionLayer`] drops calls with `GuardError::Overloaded`
//!    once the process is CPU bound and more requests are in flight than the
//!    recent throughput and latency can sustain.
//! 2. **Circuit Breaking**: [`BreakerLayer`] rejects calls with
//!    `GuardError::Unavailable`, with a probability that grows with the share of
//!    recently failed calls.
//! 3. **Balancing**: [`BalanceService`] sends each call to one of several endpoint
//!    services using power-of-two-choices, fed by latency, success and any load the
//!    server reports in its responses.
//!
//! [`make_guarded_svc`] composes the first two and maps every error into a
//! unified, cloneable [`GuardError`].
//!
//! ## Feature Flags
//!
//! - `http`: Implements [`ReportsLoad`] for `http::Response`, reading the
//!   `cpu_usage` header.
//! - `axum`: Enables `IntoResponse` for [`GuardError`], allowing automatic conversion
//!   to HTTP status codes (503, 500).

mod admission_layer;
mod balance;
mod breaker_layer;
mod error;
mod utils;

#[cfg(test)]
mod tests;

pub use admission_layer::AdmissionFuture;
pub use admission_layer::AdmissionLayer;
pub use admission_layer::AdmissionService;
#[cfg(feature = "http")]
pub use balance::SERVER_LOAD_HEADER;
pub use balance::BalanceFuture;
pub use balance::BalanceService;
pub use balance::ReportsLoad;
pub use breaker_layer::BreakerFuture;
pub use breaker_layer::BreakerLayer;
pub use breaker_layer::BreakerService;
pub use error::GuardError;
pub use utils::ServiceBuilderExt;
pub use utils::make_guarded_svc;
