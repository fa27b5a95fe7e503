use std::time::Instant;

use axum::{
    body::Body, extract::MatchedPath, http::Request, middleware::Next, response::IntoResponse,
    routing::get, Router,
};
use metrics_exporter_prometheus::{BuildError, PrometheusBuilder, PrometheusHandle};

pub const RUNS_TOTAL: &str = "delta_runs_total";
pub const RUN_DURATION_SECONDS: &str = "delta_run_duration_seconds";
pub const RECORDS_LOADED_TOTAL: &str = "delta_records_loaded_total";
pub const RECORDS_CHANGED_TOTAL: &str = "delta_records_changed_total";
pub const RECORDS_PUBLISHED_TOTAL: &str = "delta_records_published_total";
pub const MESSAGES_PUBLISHED_TOTAL: &str = "delta_messages_published_total";
pub const BATCH_SIZE: &str = "delta_publish_batch_size";
pub const STORE_LOOKUPS_TOTAL: &str = "delta_store_chunk_lookups_total";
pub const STORE_UPSERTS_TOTAL: &str = "delta_store_chunk_upserts_total";
pub const TRIGGERS_TOTAL: &str = "delta_triggers_total";

/// Bind a `TcpListener` on the provided bind address to serve a `Router` on it.
/// Takes the router from `setup_metrics_routes`, with more routes possibly added by the caller.
pub async fn serve(router: Router, bind: &str) -> Result<(), std::io::Error> {
    let listener = tokio::net::TcpListener::bind(bind).await?;

    axum::serve(listener, router).await?;

    Ok(())
}

/// Add the prometheus endpoint and request tracking to an existing router.
pub fn setup_metrics_routes(router: Router) -> Result<Router, BuildError> {
    let recorder_handle = setup_metrics_recorder()?;

    Ok(router
        .route(
            "/metrics",
            get(move || std::future::ready(recorder_handle.render())),
        )
        .layer(axum::middleware::from_fn(track_metrics)))
}

pub fn setup_metrics_recorder() -> Result<PrometheusHandle, BuildError> {
    const EXPONENTIAL_SECONDS: &[f64] = &[
        0.005, 0.01, 0.025, 0.05, 0.1, 0.25, 0.5, 1.0, 2.5, 5.0, 10.0, 30.0, 60.0, 300.0,
    ];
    const BATCH_SIZES: &[f64] = &[1.0, 10.0, 50.0, 100.0, 250.0, 500.0, 1000.0];

    PrometheusBuilder::new()
        .set_buckets(EXPONENTIAL_SECONDS)?
        .set_buckets_for_metric(
            metrics_exporter_prometheus::Matcher::Full(BATCH_SIZE.to_string()),
            BATCH_SIZES,
        )?
        .install_recorder()
}

/// Middleware to record some common HTTP metrics
pub async fn track_metrics(req: Request<Body>, next: Next) -> impl IntoResponse {
    let start = Instant::now();

    let path = if let Some(matched_path) = req.extensions().get::<MatchedPath>() {
        matched_path.as_str().to_owned()
    } else {
        req.uri().path().to_owned()
    };

    let method = req.method().clone();

    let response = next.run(req).await;

    let latency = start.elapsed().as_secs_f64();
    let status = response.status().as_u16().to_string();

    let labels = [
        ("method", method.to_string()),
        ("path", path),
        ("status", status),
    ];

    metrics::counter!("http_requests_total", &labels).increment(1);
    metrics::histogram!("http_requests_duration_seconds", &labels).record(latency);

    response
}
