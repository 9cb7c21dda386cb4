use std::any::Any;
use std::sync::Arc;

use axum::extract::State;
use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use axum::{routing, Json, Router};
use metrics_exporter_prometheus::PrometheusHandle;
use tokio::sync::watch;
use tower_http::catch_panic::CatchPanicLayer;
use tower_http::trace::TraceLayer;

use crate::database::Database;
use crate::lifecycle::{EventSender, LifecycleEvent, Phase};
use crate::metrics;

use super::db::{self, ErrorResponse};

#[derive(Clone)]
pub struct AppState {
    pub db: Arc<dyn Database>,
    pub phase: watch::Receiver<Phase>,
}

pub fn app(
    db: Arc<dyn Database>,
    phase: watch::Receiver<Phase>,
    events: EventSender,
    metrics: Option<PrometheusHandle>,
) -> Router {
    instrument(routes(db, phase, metrics), events)
}

pub fn routes(
    db: Arc<dyn Database>,
    phase: watch::Receiver<Phase>,
    metrics: Option<PrometheusHandle>,
) -> Router {
    let state = AppState { db, phase };

    Router::new()
        .route("/", routing::get(db::index))
        .route("/db", routing::get(db::list))
        .route("/db/add/:name", routing::get(db::add))
        .route("/_readiness", routing::get(readiness))
        .route("/_liveness", routing::get(liveness))
        .route(
            "/metrics",
            routing::get(move || match metrics {
                Some(ref recorder_handle) => std::future::ready(recorder_handle.render()),
                None => std::future::ready("no metrics recorder installed".to_owned()),
            }),
        )
        .with_state(state)
}

/// Wrap every route added so far with panic capture, request metrics and tracing.
pub fn instrument(router: Router, events: EventSender) -> Router {
    router
        .layer(CatchPanicLayer::custom(
            move |panic: Box<dyn Any + Send + 'static>| handler_fault(&events, panic),
        ))
        .layer(axum::middleware::from_fn(metrics::track_metrics))
        .layer(TraceLayer::new_for_http())
}

pub async fn readiness(State(state): State<AppState>) -> (StatusCode, &'static str) {
    if state.phase.borrow().is_serving() {
        (StatusCode::OK, "ready")
    } else {
        (StatusCode::SERVICE_UNAVAILABLE, "not ready")
    }
}

pub async fn liveness() -> &'static str {
    "ok"
}

/// A panic escaping a handler leaves the process in an unknown state: answer this
/// request generically and ask the lifecycle controller to exit.
fn handler_fault(events: &EventSender, panic: Box<dyn Any + Send + 'static>) -> Response {
    let message = if let Some(message) = panic.downcast_ref::<String>() {
        message.clone()
    } else if let Some(message) = panic.downcast_ref::<&str>() {
        (*message).to_owned()
    } else {
        "unknown panic payload".to_owned()
    };
    events.send(LifecycleEvent::HandlerFault(message));

    (
        StatusCode::INTERNAL_SERVER_ERROR,
        Json(ErrorResponse {
            error: "Internal server error".to_owned(),
        }),
    )
        .into_response()
}
