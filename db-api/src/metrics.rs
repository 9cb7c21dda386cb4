use std::time::Instant;

use axum::{body::Body, extract::MatchedPath, http::Request, middleware::Next, response::Response};
use metrics_exporter_prometheus::{BuildError, PrometheusBuilder, PrometheusHandle};

pub const HTTP_REQUESTS: &str = "http_requests_total";
pub const HTTP_REQUEST_DURATION: &str = "http_requests_duration_seconds";
pub const PROBE_ATTEMPTS: &str = "db_probe_attempts_total";
pub const PROBE_FAILURES: &str = "db_probe_failures_total";
pub const POOL_FAULTS: &str = "db_pool_faults_total";
pub const LIFECYCLE_EVENTS: &str = "lifecycle_events_total";
pub const POOL_ACTIVE: &str = "db_connection_pool_active";
pub const POOL_IDLE: &str = "db_connection_pool_idle";
pub const POOL_MAX: &str = "db_connection_pool_max";

pub fn setup_metrics_recorder() -> Result<PrometheusHandle, BuildError> {
    const EXPONENTIAL_SECONDS: &[f64] = &[
        0.005, 0.01, 0.025, 0.05, 0.1, 0.25, 0.5, 1.0, 2.5, 5.0, 10.0,
    ];

    PrometheusBuilder::new()
        .set_buckets(EXPONENTIAL_SECONDS)?
        .install_recorder()
}

/// Label for the route that served `req`: the template it matched (`/db/add/:name`) so every
/// inserted name shares one series, or `unmatched` for requests that hit no route.
fn route_label(req: &Request<Body>) -> String {
    req.extensions()
        .get::<MatchedPath>()
        .map(|matched| matched.as_str().to_owned())
        .unwrap_or_else(|| "unmatched".to_owned())
}

/// Count and time every request the router answers, panics included since this runs
/// outside the panic handler.
pub async fn track_metrics(req: Request<Body>, next: Next) -> Response {
    let route = route_label(&req);
    let method = req.method().to_string();
    let started = Instant::now();

    let response = next.run(req).await;

    let labels = [
        ("method", method),
        ("path", route),
        ("status", response.status().as_u16().to_string()),
    ];
    metrics::counter!(HTTP_REQUESTS, &labels).increment(1);
    metrics::histogram!(HTTP_REQUEST_DURATION, &labels).record(started.elapsed().as_secs_f64());

    response
}
