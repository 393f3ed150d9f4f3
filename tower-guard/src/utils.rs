use std::sync::Arc;

use shot_guard::AdmissionController;
use shot_guard::Breaker;
use tower::BoxError;
use tower::Service;
use tower::ServiceBuilder;
use tower::layer::util::Stack;
use tower::util::BoxCloneSyncService;

use crate::AdmissionLayer;
use crate::BreakerLayer;
use crate::GuardError;

/// Guard a client with admission control outside a circuit breaker.
///
/// Every error leaving the returned service is a boxed [`GuardError`].
pub fn make_guarded_svc<B, V, Req, Resp>(
    controller: AdmissionController,
    breaker: Arc<B>,
    svc: V,
) -> BoxCloneSyncService<Req, Resp, BoxError>
where
    B: Breaker + ?Sized + 'static,
    Req: Send + 'static,
    V: Service<Req, Response = Resp, Error = BoxError> + Clone + Send + Sync + 'static,
    <V as Service<Req>>::Future: Send,
    Resp: 'static,
{
    BoxCloneSyncService::new(
        ServiceBuilder::new()
            .map_err(GuardError::map_boxed)
            .admission(controller)
            .breaker(breaker)
            .service(svc),
    )
}

/// Service Builder Extension with additional useful functions for tower::ServiceBuilder.
pub trait ServiceBuilderExt<L> {
    /// Add an adaptive admission layer
    fn admission(self, controller: AdmissionController) -> ServiceBuilder<Stack<AdmissionLayer, L>>;

    /// Add a circuit breaker layer
    fn breaker<B>(self, breaker: Arc<B>) -> ServiceBuilder<Stack<BreakerLayer<B>, L>>
    where
        B: Breaker + ?Sized;
}

impl<L> ServiceBuilderExt<L> for ServiceBuilder<L> {
    fn admission(self, controller: AdmissionController) -> ServiceBuilder<Stack<AdmissionLayer, L>> {
        self.layer(AdmissionLayer::new(controller))
    }

    fn breaker<B>(self, breaker: Arc<B>) -> ServiceBuilder<Stack<BreakerLayer<B>, L>>
    where
        B: Breaker + ?Sized,
    {
        self.layer(BreakerLayer::new(breaker))
    }
}
