use std::sync::Arc;
use std::time::Duration;
use std::time::Instant;

use hdrhistogram::Histogram;
use rand::Rng;
use shot_guard::AdmissionConfig;
use shot_guard::AdmissionController;
use shot_guard::BreakerConfig;
use shot_guard::CpuGauge;
use shot_guard::CpuSampler;
use shot_guard::SreBreaker;
use tokio::sync::Barrier;
use tokio::task::JoinSet;
use tokio::time::sleep;
use tower::BoxError;
use tower::Service;
use tower::ServiceBuilder;
use tower::ServiceExt;
use tower::service_fn;
use tower_guard::BalanceService;
use tower_guard::GuardError;
use tower_guard::ServiceBuilderExt;
use tower_guard::make_guarded_svc;
use tracing_subscriber::EnvFilter;

/// A backend with a fixed base latency, some jitter and a failure rate.
fn mock_backend(
    base: Duration,
    failure_rate: f64,
) -> impl Service<(), Response = &'static str, Error = BoxError, Future: Send> + Clone + Send + Sync
{
    service_fn(move |_req: ()| async move {
        let (jitter, fail) = {
            let mut rng = rand::rng();
            (rng.random_range(0..=base.as_millis() as u64 / 2), rng.random_bool(failure_rate))
        };
        sleep(base + Duration::from_millis(jitter)).await;
        if fail {
            Err::<_, BoxError>("backend failure".into())
        } else {
            Ok("success")
        }
    })
}

#[derive(Default)]
struct RejectionCounter {
    overloaded: usize,
    unavailable: usize,
    no_endpoint: usize,
    inner: usize,
    unknown: usize,
}

async fn run_load_test<S>(name: &str, svc: S, total_reqs: usize)
where
    S: Service<(), Response = &'static str, Error = BoxError> + Clone + Send + 'static,
    S::Future: Send,
{
    let mut hist_elapsed = Histogram::<u64>::new_with_bounds(1, 60_000_000, 3).unwrap();

    let mut tasks = JoinSet::new();
    let mut rejections = RejectionCounter::default();

    let start = Instant::now();

    let barrier = Arc::new(Barrier::new(total_reqs));

    for _ in 0..total_reqs {
        let mut local_svc = svc.clone();
        let bar = barrier.clone();
        tasks.spawn(async move {
            bar.wait().await;
            let req_start = Instant::now();
            let res = match local_svc.ready().await {
                Ok(ready_svc) => ready_svc.call(()).await,
                Err(e) => Err(e),
            };
            (res, req_start.elapsed())
        });
    }

    let mut success_count = 0;

    while let Some(task) = tasks.join_next().await {
        let (res, elapsed) = task.expect("Task panicked");
        match res {
            Ok(_) => {
                success_count += 1;
                hist_elapsed.record(elapsed.as_micros() as u64).unwrap();
            }
            Err(e) => match e.downcast_ref::<GuardError>() {
                Some(GuardError::Overloaded) => rejections.overloaded += 1,
                Some(GuardError::Unavailable) => rejections.unavailable += 1,
                Some(GuardError::NoEndpoint) => rejections.no_endpoint += 1,
                Some(GuardError::Inner(_)) => rejections.inner += 1,
                None if e.to_string() == "backend failure" => rejections.inner += 1,
                None => rejections.unknown += 1,
            },
        }
    }

    let total_duration = start.elapsed();
    let throughput = total_reqs as f64 / total_duration.as_secs_f64();
    let goodput = success_count as f64 / total_duration.as_secs_f64();

    println!("--- {} ---", name);
    println!("Total Duration:  {:.2?}", total_duration);
    println!("Success/Total:   {}/{}", success_count, total_reqs);
    println!("Total Rate:      {:.2} req/sec", throughput);
    println!("Success Rate:    {:.2} req/sec (Goodput)", goodput);

    if success_count > 0 {
        println!("P50 (Elapsed):   {}µs", hist_elapsed.value_at_quantile(0.5));
        println!(
            "P99 (Elapsed):   {}µs",
            hist_elapsed.value_at_quantile(0.99)
        );
    }

    let total_errors = rejections.overloaded
        + rejections.unavailable
        + rejections.no_endpoint
        + rejections.inner
        + rejections.unknown;
    println!("Errors:          {}", total_errors);
    if total_errors > 0 {
        println!("  └─ Overloaded:  {}", rejections.overloaded);
        println!("  └─ Unavailable: {}", rejections.unavailable);
        if rejections.no_endpoint > 0 {
            println!("  └─ NoEndpoint:  {}", rejections.no_endpoint);
        }
        println!("  └─ Inner:       {}", rejections.inner);
        if rejections.unknown > 0 {
            println!("  └─ Unknown:     {}", rejections.unknown);
        }
    }
    println!();
}

#[tokio::main]
async fn main() -> Result<(), BoxError> {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::from_default_env())
        .init();

    let total_reqs = 20_000;
    let latency = Duration::from_millis(50);

    // Pretend the process is CPU bound so the admission controller engages
    let sampler = CpuSampler::new(|| 950_u64, Arc::new(CpuGauge::new()))
        .with_interval(Duration::from_millis(10));
    let gauge = sampler.gauge();
    for _ in 0..100 {
        sampler.sample_once();
    }
    let sampler = sampler.start();

    // 1. Admission only
    let controller = AdmissionController::new(AdmissionConfig::default(), Arc::clone(&gauge));
    let svc = ServiceBuilder::new()
        .admission(controller)
        .service(mock_backend(latency, 0.0));
    run_load_test("Admission (CPU bound)", svc, total_reqs).await;

    // 2. Breaker over a failing backend
    let breaker = Arc::new(SreBreaker::new(BreakerConfig::default()));
    let svc = ServiceBuilder::new()
        .breaker(breaker)
        .service(mock_backend(latency, 0.8));
    run_load_test("Breaker (80% failures)", svc, total_reqs).await;

    // 3. Balancing over uneven endpoints
    let svc = BalanceService::from_endpoints([
        ("fast", mock_backend(latency, 0.0)),
        ("slow", mock_backend(latency * 4, 0.0)),
        ("flaky", mock_backend(latency, 0.5)),
    ]);
    let p2c = svc.p2c().clone();
    run_load_test("P2C Balance", svc, total_reqs).await;
    for stat in p2c.endpoints() {
        println!(
            "{:<6} requests={:<6} lag={:?} success={}",
            stat.addr, stat.requests, stat.lag, stat.success
        );
    }
    println!();

    // 4. The full guarded stack
    let controller = AdmissionController::new(AdmissionConfig::default(), gauge);
    let breaker = Arc::new(SreBreaker::new(BreakerConfig::default()));
    let svc = make_guarded_svc(controller, breaker, mock_backend(latency, 0.3));
    run_load_test("Guarded Stack (30% failures)", svc, total_reqs).await;

    sampler.stop();
    Ok(())
}
