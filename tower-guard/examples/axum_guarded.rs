use std::sync::Arc;
use std::sync::atomic::AtomicU64;
use std::sync::atomic::Ordering;
use std::time::Duration;

use axum::{
    Router, error_handling::HandleErrorLayer, http::StatusCode, response::IntoResponse,
    routing::get,
};
use shot_guard::{AdmissionConfig, AdmissionController, BreakerConfig, CpuGauge, CpuSampler, SreBreaker};
use tower::BoxError;
use tower::ServiceBuilder;
use tower_guard::{GuardError, ServiceBuilderExt};

#[tokio::main]
async fn main() {
    tracing_subscriber::fmt::init();

    // 1. Setup a CPU source. A real service would read /proc or cgroup stats here;
    // `/burn` raises the synthetic load so shedding can be observed.
    let load = Arc::new(AtomicU64::new(100));
    let source = {
        let load = Arc::clone(&load);
        move || load.load(Ordering::Relaxed)
    };
    let sampler = CpuSampler::new(source, Arc::new(CpuGauge::new()))
        .with_interval(Duration::from_millis(100))
        .start();

    // 2. Setup the policies
    let controller = AdmissionController::new(AdmissionConfig::default(), sampler.gauge());
    let breaker = Arc::new(SreBreaker::new(BreakerConfig::default()));

    // 3. Build the Router
    let app = Router::new()
        .route("/", get(|| async { "Hello, Guard!" }))
        .route(
            "/burn",
            get(move || async move {
                load.store(950, Ordering::Relaxed);
                "CPU pinned"
            }),
        )
        .layer(
            ServiceBuilder::new()
                // 1. The outermost layer: catches BoxError and returns Response
                .layer(HandleErrorLayer::new(handle_guard_error))
                // 2. The guards introduce BoxError
                .admission(controller)
                .breaker(breaker)
                // 3. Converts the Route's Infallible to BoxError
                .map_err(BoxError::from),
        );

    // 4. Serve
    let listener = tokio::net::TcpListener::bind("127.0.0.1:3000")
        .await
        .unwrap();
    println!("📡 Listening on http://127.0.0.1:3000");

    axum::serve(listener, app).await.unwrap();
    sampler.stop();
}

/// The signature must match BoxError -> IntoResponse
async fn handle_guard_error(err: BoxError) -> impl IntoResponse {
    if let Some(guard_err) = err.downcast_ref::<GuardError>() {
        guard_err.clone().into_response()
    } else {
        (StatusCode::INTERNAL_SERVER_ERROR, "Internal Service Error").into_response()
    }
}
