use std::sync::Arc;
use std::sync::atomic::AtomicUsize;
use std::sync::atomic::Ordering;
use std::task::Context;
use std::task::Poll;

use shot_guard::AdmissionConfig;
use shot_guard::AdmissionController;
use shot_guard::Breaker;
use shot_guard::BreakerConfig;
use shot_guard::CpuGauge;
use shot_guard::SreBreaker;
use tower::BoxError;
use tower::Layer;
use tower::Service;
use tower::ServiceBuilder;
use tower::ServiceExt;

use super::*;

use futures::future::Ready;
use futures::future::ready;

#[derive(Clone)]
struct MockService {
    pub count: Arc<AtomicUsize>,
    pub fail: bool,
}

impl MockService {
    fn new() -> Self {
        Self {
            count: Arc::new(AtomicUsize::new(0)),
            fail: false,
        }
    }

    fn failing() -> Self {
        Self {
            fail: true,
            ..Self::new()
        }
    }

    fn hits(&self) -> usize {
        self.count.load(Ordering::SeqCst)
    }
}

impl Service<()> for MockService {
    type Response = ();
    type Error = BoxError;
    type Future = Ready<Result<Self::Response, Self::Error>>;

    fn poll_ready(&mut self, _cx: &mut Context<'_>) -> Poll<Result<(), Self::Error>> {
        Poll::Ready(Ok(()))
    }

    fn call(&mut self, _req: ()) -> Self::Future {
        self.count.fetch_add(1, Ordering::SeqCst);
        if self.fail {
            ready(Err("backend failure".into()))
        } else {
            ready(Ok(()))
        }
    }
}

#[derive(Debug)]
struct Loaded(u64);

impl ReportsLoad for Loaded {
    fn server_load(&self) -> Option<u64> {
        Some(self.0)
    }
}

fn guard_err(err: BoxError) -> GuardError {
    err.downcast_ref::<GuardError>()
        .cloned()
        .expect("error should be a GuardError")
}

fn controller(cpu: u64) -> AdmissionController {
    let gauge = Arc::new(CpuGauge::new());
    gauge.set(cpu);
    AdmissionController::new(AdmissionConfig::default(), gauge)
}

#[tokio::test]
async fn test_admission_passes_through() {
    let controller = controller(100);
    let mock = MockService::new();
    let mut service = AdmissionLayer::new(controller.clone()).layer(mock.clone());

    for _ in 0..10 {
        service.ready().await.unwrap().call(()).await.unwrap();
    }

    assert_eq!(mock.hits(), 10);
    assert_eq!(controller.stat().inflight, 0);
}

#[tokio::test]
async fn test_admission_drops_when_overloaded() {
    let controller = controller(900);
    let mock = MockService::new();
    let mut service = AdmissionLayer::new(controller.clone()).layer(mock.clone());

    // Fresh history only sustains a single request in flight
    let held = controller.allow().unwrap();

    let err = service.ready().await.unwrap().call(()).await.unwrap_err();
    assert_eq!(guard_err(err), GuardError::Overloaded);
    assert_eq!(mock.hits(), 0);
    assert_eq!(controller.stat().inflight, 1);

    drop(held);
    assert_eq!(controller.stat().inflight, 0);
}

#[tokio::test]
async fn test_admission_passes_inner_errors_through() {
    let controller = controller(100);
    let mut service = AdmissionService::new(MockService::failing(), controller.clone());

    let err = service.ready().await.unwrap().call(()).await.unwrap_err();
    assert!(err.downcast_ref::<GuardError>().is_none());
    assert_eq!(err.to_string(), "backend failure");
    assert_eq!(controller.stat().inflight, 0);
}

#[tokio::test]
async fn test_breaker_marks_outcomes() {
    let breaker = Arc::new(SreBreaker::new(BreakerConfig::default()));
    let layer = BreakerLayer::new(Arc::clone(&breaker));

    let mut ok = layer.layer(MockService::new());
    let mut failing = layer.layer(MockService::failing());

    ok.ready().await.unwrap().call(()).await.unwrap();
    ok.ready().await.unwrap().call(()).await.unwrap();
    failing.ready().await.unwrap().call(()).await.unwrap_err();

    assert_eq!(breaker.summary(), (2, 3));
}

#[tokio::test]
async fn test_breaker_rejects_when_backend_is_down() {
    let breaker = Arc::new(SreBreaker::new(BreakerConfig::default()).with_seed(3));
    for _ in 0..200 {
        breaker.mark_failed();
    }

    let mock = MockService::new();
    let mut service = BreakerService::new(mock.clone(), Arc::clone(&breaker));

    let mut rejected = 0;
    for _ in 0..100 {
        if let Err(err) = service.ready().await.unwrap().call(()).await {
            assert_eq!(guard_err(err), GuardError::Unavailable);
            rejected += 1;
        }
    }

    assert!(rejected > 90, "only {rejected} of 100 rejected");
    assert_eq!(mock.hits(), 100 - rejected);
}

#[tokio::test]
async fn test_builder_ext_with_trait_object() {
    let breaker: Arc<dyn Breaker> = Arc::new(SreBreaker::new(BreakerConfig::default()));
    let mock = MockService::new();

    let mut service = ServiceBuilder::new()
        .admission(controller(100))
        .breaker(breaker)
        .service(mock.clone());

    service.ready().await.unwrap().call(()).await.unwrap();
    assert_eq!(mock.hits(), 1);
}

#[tokio::test]
async fn test_guarded_svc_maps_errors() {
    let breaker = Arc::new(SreBreaker::new(BreakerConfig::default()));
    let mut service = make_guarded_svc(controller(100), breaker, MockService::failing());

    let err = service.ready().await.unwrap().call(()).await.unwrap_err();
    assert_eq!(
        guard_err(err),
        GuardError::Inner("backend failure".to_string())
    );

    let overloaded = controller(900);
    let held = overloaded.allow().unwrap();
    let breaker = Arc::new(SreBreaker::new(BreakerConfig::default()));
    let mut service = make_guarded_svc(overloaded, breaker, MockService::new());

    let err = service.ready().await.unwrap().call(()).await.unwrap_err();
    assert_eq!(guard_err(err), GuardError::Overloaded);
    drop(held);
}

#[tokio::test]
async fn test_balance_spreads_calls() {
    let a = MockService::new();
    let b = MockService::new();
    let mut service = BalanceService::from_endpoints([("a", a.clone()), ("b", b.clone())]);

    for _ in 0..100 {
        service.ready().await.unwrap().call(()).await.unwrap();
    }

    assert_eq!(a.hits() + b.hits(), 100);
    for stat in service.p2c().endpoints() {
        assert_eq!(stat.inflight, 1);
    }
}

#[tokio::test]
async fn test_balance_without_endpoints() {
    let mut service = BalanceService::from_endpoints(Vec::<(String, MockService)>::new());

    let err = service.ready().await.unwrap().call(()).await.unwrap_err();
    assert_eq!(guard_err(err), GuardError::NoEndpoint);
}

#[tokio::test]
async fn test_balance_reports_failures() {
    let mut service = BalanceService::from_endpoints([("down", MockService::failing())]);

    service.ready().await.unwrap().call(()).await.unwrap_err();

    // The first completion replaces the neutral seed outright
    assert_eq!(service.p2c().endpoints()[0].success, 0);
}

#[tokio::test]
async fn test_balance_records_server_load() {
    let backend = tower::service_fn(|_req: ()| async { Ok::<_, BoxError>(Loaded(730)) });
    let mut service = BalanceService::from_endpoints([("10.0.0.1:8080", backend)]);

    let res = service.ready().await.unwrap().call(()).await.unwrap();
    assert_eq!(res.0, 730);
    assert_eq!(service.p2c().endpoints()[0].server_load, 730);
}

#[cfg(feature = "http")]
#[test]
fn test_http_response_reports_cpu_usage() {
    let res = http::Response::builder()
        .header(SERVER_LOAD_HEADER, "640")
        .body(())
        .unwrap();
    assert_eq!(res.server_load(), Some(640));

    let res = http::Response::builder()
        .header(SERVER_LOAD_HEADER, "busy")
        .body(())
        .unwrap();
    assert_eq!(res.server_load(), None);

    assert_eq!(http::Response::new(()).server_load(), None);
}

#[test]
fn test_plain_responses_report_no_load() {
    assert_eq!(().server_load(), None);
    assert_eq!(String::from("ok").server_load(), None);
    assert_eq!("ok".server_load(), None);
}

#[test]
fn test_reason_conversion() {
    use shot_guard::Reason;

    assert_eq!(GuardError::from(Reason::Overloaded), GuardError::Overloaded);
    assert_eq!(GuardError::from(Reason::Unavailable), GuardError::Unavailable);
    assert_eq!(GuardError::from(Reason::NoEndpoint), GuardError::NoEndpoint);
}
