use std::future::Future;
use std::pin::Pin;
use std::sync::Arc;
use std::task::Context;
use std::task::Poll;

use opentelemetry::KeyValue;
use opentelemetry::global;
use opentelemetry::metrics::Counter;
use pin_project_lite::pin_project;
use shot_guard::Breaker;
use shot_guard::Reason;
use tower::BoxError;
use tower::Layer;
use tower::Service;

use crate::error::GuardError;

/// Guards the inner service with a [`Breaker`].
#[derive(Debug)]
pub struct BreakerLayer<B>
where
    B: ?Sized,
{
    breaker: Arc<B>,
}

impl<B> Clone for BreakerLayer<B>
where
    B: ?Sized,
{
    fn clone(&self) -> Self {
        Self {
            breaker: Arc::clone(&self.breaker),
        }
    }
}

impl<B> BreakerLayer<B>
where
    B: Breaker + ?Sized,
{
    pub fn new(breaker: Arc<B>) -> Self {
        Self { breaker }
    }
}

impl<B, S> Layer<S> for BreakerLayer<B>
where
    B: ?Sized,
{
    type Service = BreakerService<B, S>;

    fn layer(&self, service: S) -> Self::Service {
        BreakerService::new(service, Arc::clone(&self.breaker))
    }
}

#[derive(Clone, Debug)]
struct BreakerServiceMetrics {
    requests: Counter<u64>,
}

/// Rejects calls the breaker refuses and marks every completed call.
#[derive(Debug)]
pub struct BreakerService<B, S>
where
    B: ?Sized,
{
    inner: S,
    breaker: Arc<B>,
    instruments: BreakerServiceMetrics,
}

impl<B, S> Clone for BreakerService<B, S>
where
    B: ?Sized,
    S: Clone,
{
    fn clone(&self) -> Self {
        Self {
            inner: self.inner.clone(),
            breaker: Arc::clone(&self.breaker),
            instruments: self.instruments.clone(),
        }
    }
}

impl<B, S> BreakerService<B, S>
where
    B: ?Sized,
{
    pub fn new(inner: S, breaker: Arc<B>) -> Self {
        let meter = global::meter("breaker_service");
        let instruments = BreakerServiceMetrics {
            requests: meter.u64_counter("breaker_requests").build(),
        };

        Self {
            inner,
            breaker,
            instruments,
        }
    }
}

pin_project! {
    #[project = BreakerFutureProj]
    /// Response future of [`BreakerService`].
    pub enum BreakerFuture<F, H> {
        Allowed {
            #[pin]
            inner: F,
            breaker: H,
        },
        Rejected {
            reason: Reason,
        },
    }
}

impl<F, B, T> Future for BreakerFuture<F, Arc<B>>
where
    F: Future<Output = Result<T, BoxError>>,
    B: Breaker + ?Sized,
{
    type Output = Result<T, BoxError>;

    fn poll(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Self::Output> {
        match self.project() {
            BreakerFutureProj::Allowed { inner, breaker } => {
                let res = std::task::ready!(inner.poll(cx));
                if res.is_ok() {
                    breaker.mark_success();
                } else {
                    breaker.mark_failed();
                }
                Poll::Ready(res)
            }
            BreakerFutureProj::Rejected { reason } => {
                Poll::Ready(Err(Box::new(GuardError::from(*reason))))
            }
        }
    }
}

impl<B, S, Req> Service<Req> for BreakerService<B, S>
where
    B: Breaker + ?Sized,
    S: Service<Req, Error = BoxError>,
{
    type Response = S::Response;
    type Error = BoxError;
    type Future = BreakerFuture<S::Future, Arc<B>>;

    fn poll_ready(&mut self, cx: &mut Context<'_>) -> Poll<Result<(), Self::Error>> {
        self.inner.poll_ready(cx)
    }

    fn call(&mut self, req: Req) -> Self::Future {
        match self.breaker.allow() {
            Ok(()) => {
                self.instruments
                    .requests
                    .add(1, &[KeyValue::new("outcome", "allowed")]);
                BreakerFuture::Allowed {
                    inner: self.inner.call(req),
                    breaker: Arc::clone(&self.breaker),
                }
            }
            Err(reason) => {
                self.instruments
                    .requests
                    .add(1, &[KeyValue::new("outcome", "rejected")]);
                BreakerFuture::Rejected { reason }
            }
        }
    }
}
