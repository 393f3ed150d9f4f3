use std::future::Future;
use std::pin::Pin;
use std::task::Context;
use std::task::Poll;

use opentelemetry::KeyValue;
use opentelemetry::global;
use opentelemetry::metrics::Counter;
use pin_project_lite::pin_project;
use shot_guard::AdmissionController;
use shot_guard::Completion;
use shot_guard::Outcome;
use shot_guard::Reason;
use tower::BoxError;
use tower::Layer;
use tower::Service;

use crate::error::GuardError;

/// Sheds requests with an [`AdmissionController`] before they reach the inner service.
#[derive(Clone, Debug)]
pub struct AdmissionLayer {
    controller: AdmissionController,
}

impl AdmissionLayer {
    /// Every service built by this layer shares `controller`.
    pub fn new(controller: AdmissionController) -> Self {
        Self { controller }
    }
}

impl<S> Layer<S> for AdmissionLayer {
    type Service = AdmissionService<S>;

    fn layer(&self, service: S) -> Self::Service {
        AdmissionService::new(service, self.controller.clone())
    }
}

#[derive(Clone, Debug)]
struct AdmissionServiceMetrics {
    requests: Counter<u64>,
}

/// Admits or drops each call, then reports the inner outcome to the controller.
///
/// A successful inner response counts as [`Outcome::Success`]; an inner error is
/// reported as [`Outcome::Ignore`], so it records latency but not throughput.
#[derive(Clone, Debug)]
pub struct AdmissionService<S> {
    inner: S,
    controller: AdmissionController,
    instruments: AdmissionServiceMetrics,
}

impl<S> AdmissionService<S> {
    pub fn new(inner: S, controller: AdmissionController) -> Self {
        let meter = global::meter("admission_service");
        let instruments = AdmissionServiceMetrics {
            requests: meter.u64_counter("admission_requests").build(),
        };

        Self {
            inner,
            controller,
            instruments,
        }
    }

    pub fn controller(&self) -> &AdmissionController {
        &self.controller
    }
}

pin_project! {
    #[project = AdmissionFutureProj]
    /// Response future of [`AdmissionService`].
    pub enum AdmissionFuture<F> {
        Admitted {
            #[pin]
            inner: F,
            completion: Option<Completion>,
        },
        Rejected {
            reason: Reason,
        },
    }
}

impl<F, T> Future for AdmissionFuture<F>
where
    F: Future<Output = Result<T, BoxError>>,
{
    type Output = Result<T, BoxError>;

    fn poll(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Self::Output> {
        match self.project() {
            AdmissionFutureProj::Admitted { inner, completion } => {
                let res = std::task::ready!(inner.poll(cx));
                if let Some(completion) = completion.take() {
                    let outcome = if res.is_ok() {
                        Outcome::Success
                    } else {
                        Outcome::Ignore
                    };
                    completion.done(outcome);
                }
                Poll::Ready(res)
            }
            AdmissionFutureProj::Rejected { reason } => {
                Poll::Ready(Err(Box::new(GuardError::from(*reason))))
            }
        }
    }
}

impl<S, Req> Service<Req> for AdmissionService<S>
where
    S: Service<Req, Error = BoxError>,
{
    type Response = S::Response;
    type Error = BoxError;
    type Future = AdmissionFuture<S::Future>;

    fn poll_ready(&mut self, cx: &mut Context<'_>) -> Poll<Result<(), Self::Error>> {
        self.inner.poll_ready(cx)
    }

    fn call(&mut self, req: Req) -> Self::Future {
        match self.controller.allow() {
            Ok(completion) => {
                self.instruments
                    .requests
                    .add(1, &[KeyValue::new("outcome", "admitted")]);
                AdmissionFuture::Admitted {
                    inner: self.inner.call(req),
                    completion: Some(completion),
                }
            }
            Err(reason) => {
                self.instruments
                    .requests
                    .add(1, &[KeyValue::new("outcome", "dropped")]);
                AdmissionFuture::Rejected { reason }
            }
        }
    }
}
