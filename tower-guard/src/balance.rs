use std::fmt;
use std::future::Future;
use std::pin::Pin;
use std::task::Context;
use std::task::Poll;

use opentelemetry::KeyValue;
use opentelemetry::global;
use opentelemetry::metrics::Counter;
use pin_project_lite::pin_project;
use shot_guard::DoneInfo;
use shot_guard::P2c;
use shot_guard::Picked;
use tower::BoxError;
use tower::Service;
use tower::ServiceExt;
use tower::util::Oneshot;

use crate::error::GuardError;

/// Responses which may carry the server's own load estimate.
///
/// The value is on the same 0..=1000 scale as the CPU usage fed to the admission
/// controller. The default implementation reports nothing, so a response type
/// without a load signal opts in with an empty impl. Plain `()`, `String` and
/// `&'static str` responses are covered here.
pub trait ReportsLoad {
    fn server_load(&self) -> Option<u64> {
        None
    }
}

impl ReportsLoad for () {}

impl ReportsLoad for String {}

impl ReportsLoad for &'static str {}

/// Header carrying the server's CPU usage.
#[cfg(feature = "http")]
pub const SERVER_LOAD_HEADER: &str = "cpu_usage";

#[cfg(feature = "http")]
impl<B> ReportsLoad for http::Response<B> {
    fn server_load(&self) -> Option<u64> {
        self.headers()
            .get(SERVER_LOAD_HEADER)?
            .to_str()
            .ok()?
            .trim()
            .parse()
            .ok()
    }
}

#[derive(Clone, Debug)]
struct BalanceServiceMetrics {
    requests: Counter<u64>,
}

/// Spreads calls over a set of endpoint services with a [`P2c`] balancer.
///
/// Each call picks an endpoint and drives a clone of its service to completion,
/// so the balancer is always ready. The outcome and any load reported in the
/// response feed back into the endpoint's scores.
pub struct BalanceService<S> {
    p2c: P2c<S>,
    instruments: BalanceServiceMetrics,
}

impl<S> Clone for BalanceService<S> {
    fn clone(&self) -> Self {
        Self {
            p2c: self.p2c.clone(),
            instruments: self.instruments.clone(),
        }
    }
}

impl<S> fmt::Debug for BalanceService<S> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("BalanceService")
            .field("p2c", &self.p2c)
            .finish()
    }
}

impl<S> BalanceService<S> {
    pub fn new(p2c: P2c<S>) -> Self {
        let meter = global::meter("balance_service");
        let instruments = BalanceServiceMetrics {
            requests: meter.u64_counter("balance_requests").build(),
        };

        Self { p2c, instruments }
    }

    /// Build from `(address, service)` pairs.
    pub fn from_endpoints<I, A>(endpoints: I) -> Self
    where
        I: IntoIterator<Item = (A, S)>,
        A: Into<String>,
    {
        Self::new(P2c::new(endpoints))
    }

    pub fn p2c(&self) -> &P2c<S> {
        &self.p2c
    }
}

pin_project! {
    #[project = BalanceFutureProj]
    /// Response future of [`BalanceService`].
    pub enum BalanceFuture<F, P> {
        Picked {
            #[pin]
            inner: F,
            picked: Option<P>,
        },
        NoEndpoint,
    }
}

impl<F, S, T> Future for BalanceFuture<F, Picked<S>>
where
    F: Future<Output = Result<T, BoxError>>,
    T: ReportsLoad,
{
    type Output = Result<T, BoxError>;

    fn poll(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Self::Output> {
        match self.project() {
            BalanceFutureProj::Picked { inner, picked } => {
                let res = std::task::ready!(inner.poll(cx));
                if let Some(picked) = picked.take() {
                    let info = match &res {
                        Ok(response) => DoneInfo {
                            failed: false,
                            server_load: response.server_load(),
                        },
                        Err(_) => DoneInfo::failure(),
                    };
                    picked.done(info);
                }
                Poll::Ready(res)
            }
            BalanceFutureProj::NoEndpoint => {
                Poll::Ready(Err(Box::new(GuardError::NoEndpoint)))
            }
        }
    }
}

impl<S, Req> Service<Req> for BalanceService<S>
where
    S: Service<Req, Error = BoxError> + Clone,
    S::Response: ReportsLoad,
{
    type Response = S::Response;
    type Error = BoxError;
    type Future = BalanceFuture<Oneshot<S, Req>, Picked<S>>;

    fn poll_ready(&mut self, _cx: &mut Context<'_>) -> Poll<Result<(), Self::Error>> {
        Poll::Ready(Ok(()))
    }

    fn call(&mut self, req: Req) -> Self::Future {
        match self.p2c.pick() {
            Ok(picked) => {
                self.instruments
                    .requests
                    .add(1, &[KeyValue::new("endpoint", picked.addr().to_string())]);
                BalanceFuture::Picked {
                    inner: picked.conn().clone().oneshot(req),
                    picked: Some(picked),
                }
            }
            Err(reason) => {
                tracing::debug!(%reason, "balancer has no endpoint");
                self.instruments
                    .requests
                    .add(1, &[KeyValue::new("endpoint", "none")]);
                BalanceFuture::NoEndpoint
            }
        }
    }
}
