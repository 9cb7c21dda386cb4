//! Serve the `test` table over HTTP once Postgres is reachable.
use std::sync::Arc;

use envconfig::Envconfig;
use tracing::error;
use tracing_subscriber::fmt;
use tracing_subscriber::fmt::format::FmtSpan;
use tracing_subscriber::layer::SubscriberExt;
use tracing_subscriber::util::SubscriberInitExt;
use tracing_subscriber::{EnvFilter, Layer};

use db_api::config::Config;
use db_api::database::PgDatabase;
use db_api::handlers;
use db_api::lifecycle::{supervise, ExitStatus, Lifecycle};
use db_api::metrics::setup_metrics_recorder;
use db_api::pool_monitor::PoolMonitor;
use db_api::server::spawn_signal_listener;

fn init_tracing(debug: bool) {
    let filter = || EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
    let base_layer = fmt::layer()
        .with_target(true)
        .with_thread_ids(true)
        .with_level(true);

    let log_layer = if debug {
        base_layer
            .with_span_events(FmtSpan::NEW | FmtSpan::CLOSE)
            .with_ansi(true)
            .with_filter(filter())
            .boxed()
    } else {
        base_layer.json().with_filter(filter()).boxed()
    };

    tracing_subscriber::registry().with(log_layer).init();
}

#[tokio::main]
async fn main() {
    let config = Config::init_from_env().expect("Invalid configuration:");
    init_tracing(config.debug);

    let probe = match config.probe.to_probe_config() {
        Ok(probe) => probe,
        Err(e) => {
            error!("invalid probe configuration: {}", e);
            std::process::exit(ExitStatus::Fatal.code());
        }
    };

    let lifecycle = Lifecycle::new();
    let events = lifecycle.events();

    if let Err(e) = spawn_signal_listener(events.clone()) {
        error!("failed to register signal handlers: {}", e);
        std::process::exit(ExitStatus::Fatal.code());
    }

    let recorder_handle = if config.export_prometheus {
        Some(setup_metrics_recorder().expect("failed to install metrics recorder"))
    } else {
        None
    };

    let db = PgDatabase::new(&config.database, events.clone());
    supervise(
        "pool_monitor",
        PoolMonitor::new(db.pool().clone(), config.pool_monitor_interval.0).run(),
        events.clone(),
    );

    let app = handlers::app(
        Arc::new(db.clone()),
        lifecycle.phase(),
        events,
        recorder_handle,
    );

    let status = lifecycle
        .run(&db, app, &probe, &config.serve_config())
        .await;
    std::process::exit(status.code());
}
