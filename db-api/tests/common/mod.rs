use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use axum::Router;
use once_cell::sync::Lazy;
use tokio::sync::watch;
use tokio::task::JoinHandle;

use db_api::backoff::ProbeConfig;
use db_api::handlers;
use db_api::lifecycle::{EventSender, ExitStatus, Lifecycle, LifecycleEvent, Phase, ShutdownSignal};
use db_api::server::ServeConfig;
use db_api::test_utils::MemoryDatabase;

pub static FAST_PROBE: Lazy<ProbeConfig> = Lazy::new(|| {
    ProbeConfig::new(5, Duration::from_millis(10), Duration::from_millis(40), 2.0).unwrap()
});

pub static DEFAULT_SERVE: Lazy<ServeConfig> = Lazy::new(|| ServeConfig {
    bind: "127.0.0.1:0".to_string(),
    drain_timeout: Duration::from_secs(5),
});

/// A `Lifecycle` running on a background task, serving the regular routes plus `extra`.
pub struct LifecycleHandle {
    pub events: EventSender,
    pub phase: watch::Receiver<Phase>,
    exit: JoinHandle<ExitStatus>,
}

impl LifecycleHandle {
    pub fn spawn(
        db: Arc<MemoryDatabase>,
        extra: Router,
        probe: ProbeConfig,
        serve: ServeConfig,
    ) -> LifecycleHandle {
        let lifecycle = Lifecycle::new();
        let events = lifecycle.events();
        let phase = lifecycle.phase();
        let app = handlers::instrument(
            handlers::routes(db.clone(), lifecycle.phase(), None).merge(extra),
            events.clone(),
        );

        let exit = tokio::spawn(async move { lifecycle.run(db.as_ref(), app, &probe, &serve).await });

        LifecycleHandle {
            events,
            phase,
            exit,
        }
    }

    pub fn for_database(db: Arc<MemoryDatabase>) -> LifecycleHandle {
        Self::spawn(db, Router::new(), *FAST_PROBE, DEFAULT_SERVE.clone())
    }

    /// Wait until the listener is bound and return its address.
    pub async fn serving_addr(&mut self) -> SocketAddr {
        let phase = tokio::time::timeout(
            Duration::from_secs(5),
            self.phase.wait_for(|phase| phase.is_serving() || phase.is_terminal()),
        )
        .await
        .expect("lifecycle never started serving")
        .expect("lifecycle dropped");

        match *phase {
            Phase::Serving(addr) => addr,
            other => panic!("expected to be serving, got {:?}", other),
        }
    }

    pub async fn wait_for_phase(&mut self, expected: Phase) {
        tokio::time::timeout(
            Duration::from_secs(5),
            self.phase.wait_for(|phase| *phase == expected),
        )
        .await
        .unwrap_or_else(|_| panic!("never reached {:?}", expected))
        .expect("lifecycle dropped");
    }

    pub fn signal(&self, signal: ShutdownSignal) {
        self.events.send(LifecycleEvent::Signal(signal));
    }

    pub async fn exit_status(self) -> ExitStatus {
        tokio::time::timeout(Duration::from_secs(10), self.exit)
            .await
            .expect("lifecycle did not exit")
            .expect("lifecycle task panicked")
    }
}

pub async fn get(addr: SocketAddr, path: &str) -> reqwest::Result<reqwest::Response> {
    reqwest::Client::new()
        .get(format!("http://{}{}", addr, path))
        .send()
        .await
}

/// Find a port nothing is listening on.
pub fn free_port() -> u16 {
    let listener = std::net::TcpListener::bind("127.0.0.1:0").unwrap();
    listener.local_addr().unwrap().port()
}
