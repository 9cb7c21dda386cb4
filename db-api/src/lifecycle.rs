use std::fmt;
use std::future::Future;
use std::net::SocketAddr;

use axum::Router;
use tokio::sync::{mpsc, watch};
use tracing::{debug, error, info, warn};

use crate::backoff::ProbeConfig;
use crate::database::Database;
use crate::metrics::LIFECYCLE_EVENTS;
use crate::readiness::wait_for_ready;
use crate::server::{ServeConfig, ServerHandle};

/// Where the process is in its life. Phases only ever move forward.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Phase {
    Starting,
    /// Waiting for the database to answer the liveness query.
    Probing,
    /// Accepting connections on the given address.
    Serving(SocketAddr),
    /// Refusing new connections while in-flight requests finish.
    Draining,
    Terminated,
    /// The database never became ready, no listener was started.
    Failed,
}

impl Phase {
    fn rank(&self) -> u8 {
        match self {
            Phase::Starting => 0,
            Phase::Probing => 1,
            Phase::Serving(_) => 2,
            Phase::Draining => 3,
            Phase::Terminated | Phase::Failed => 4,
        }
    }

    pub fn is_serving(&self) -> bool {
        matches!(self, Phase::Serving(_))
    }

    pub fn is_terminal(&self) -> bool {
        matches!(self, Phase::Terminated | Phase::Failed)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ShutdownSignal {
    Terminate,
    Interrupt,
}

impl fmt::Display for ShutdownSignal {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ShutdownSignal::Terminate => write!(f, "SIGTERM"),
            ShutdownSignal::Interrupt => write!(f, "SIGINT"),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum LifecycleEvent {
    /// A termination signal, starts draining.
    Signal(ShutdownSignal),
    /// An idle pooled connection failed. Logged only.
    PoolFault(String),
    /// A request handler panicked. Fatal.
    HandlerFault(String),
    /// A background task not tied to any request failed. Logged only.
    BackgroundFault(String),
}

impl LifecycleEvent {
    fn kind(&self) -> &'static str {
        match self {
            LifecycleEvent::Signal(_) => "signal",
            LifecycleEvent::PoolFault(_) => "pool_fault",
            LifecycleEvent::HandlerFault(_) => "handler_fault",
            LifecycleEvent::BackgroundFault(_) => "background_fault",
        }
    }
}

/// Cloneable handle for reporting events to the lifecycle controller.
#[derive(Clone, Debug)]
pub struct EventSender(mpsc::UnboundedSender<LifecycleEvent>);

impl From<mpsc::UnboundedSender<LifecycleEvent>> for EventSender {
    fn from(sender: mpsc::UnboundedSender<LifecycleEvent>) -> Self {
        EventSender(sender)
    }
}

impl EventSender {
    pub fn send(&self, event: LifecycleEvent) {
        if let Err(err) = self.0.send(event) {
            debug!("lifecycle controller is gone, dropping {:?}", err.0);
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ExitStatus {
    /// Drained and closed cleanly.
    Clean,
    /// Startup failed, a handler panicked, or the server failed to close.
    Fatal,
    /// In-flight requests outlived the drain deadline.
    DrainTimeout,
}

impl ExitStatus {
    pub fn code(self) -> i32 {
        match self {
            ExitStatus::Clean => 0,
            ExitStatus::Fatal => 1,
            ExitStatus::DrainTimeout => 2,
        }
    }
}

/// Drives the service from startup to exit: probe the database, serve, drain.
///
/// Everything that can change the course of the process arrives as a `LifecycleEvent`
/// on a single channel, so signal handlers, the pool and the router never share state
/// beyond the sender half.
pub struct Lifecycle {
    phase: watch::Sender<Phase>,
    events: EventSender,
    receiver: mpsc::UnboundedReceiver<LifecycleEvent>,
}

impl Lifecycle {
    pub fn new() -> Self {
        let (phase, _) = watch::channel(Phase::Starting);
        let (sender, receiver) = mpsc::unbounded_channel();

        Self {
            phase,
            events: EventSender(sender),
            receiver,
        }
    }

    pub fn events(&self) -> EventSender {
        self.events.clone()
    }

    pub fn phase(&self) -> watch::Receiver<Phase> {
        self.phase.subscribe()
    }

    fn advance(&self, next: Phase) -> bool {
        self.phase.send_if_modified(|current| {
            if current.is_terminal() || next.rank() <= current.rank() {
                warn!("ignoring phase transition {:?} -> {:?}", current, next);
                return false;
            }
            info!("lifecycle phase {:?} -> {:?}", current, next);
            *current = next;
            true
        })
    }

    /// Run the service to completion. The listener for `app` is only bound once `db`
    /// answers the liveness query.
    pub async fn run<D>(
        mut self,
        db: &D,
        app: Router,
        probe: &ProbeConfig,
        serve: &ServeConfig,
    ) -> ExitStatus
    where
        D: Database + ?Sized,
    {
        self.advance(Phase::Probing);

        let probing = wait_for_ready(db, probe);
        tokio::pin!(probing);
        let probed = loop {
            tokio::select! {
                result = &mut probing => break Some(result),
                Some(event) = self.receiver.recv() => match event {
                    LifecycleEvent::Signal(signal) => {
                        info!("received {} while waiting for postgres, exiting without serving", signal);
                        break None;
                    }
                    other => self.observe(other),
                },
            }
        };

        match probed {
            None => {
                self.advance(Phase::Terminated);
                return ExitStatus::Clean;
            }
            Some(Err(error)) => {
                error!("fatal: postgres did not become ready: {}", error);
                self.advance(Phase::Failed);
                return ExitStatus::Fatal;
            }
            Some(Ok(_)) => {}
        }

        let mut server = match ServerHandle::start(&serve.bind, app).await {
            Ok(server) => server,
            Err(error) => {
                error!("failed to bind {}: {}", serve.bind, error);
                self.advance(Phase::Failed);
                return ExitStatus::Fatal;
            }
        };
        self.advance(Phase::Serving(server.local_addr()));

        loop {
            tokio::select! {
                result = server.stopped() => {
                    error!("http server stopped while serving: {:?}", result);
                    self.advance(Phase::Terminated);
                    return ExitStatus::Fatal;
                }
                Some(event) = self.receiver.recv() => match event {
                    LifecycleEvent::Signal(signal) => {
                        info!("received {} - starting graceful shutdown", signal);
                        break;
                    }
                    LifecycleEvent::HandlerFault(message) => {
                        return self.fail_fast(&message);
                    }
                    other => self.observe(other),
                },
            }
        }

        self.advance(Phase::Draining);
        server.begin_drain();

        let deadline = tokio::time::sleep(serve.drain_timeout);
        tokio::pin!(deadline);
        loop {
            tokio::select! {
                result = server.stopped() => {
                    return match result {
                        Ok(()) => {
                            info!("http server closed");
                            self.advance(Phase::Terminated);
                            ExitStatus::Clean
                        }
                        Err(error) => {
                            error!("error closing http server: {}", error);
                            self.advance(Phase::Terminated);
                            ExitStatus::Fatal
                        }
                    };
                }
                _ = &mut deadline => {
                    error!(
                        "timeout of graceful shutdown after {:?} - forcing exit",
                        serve.drain_timeout
                    );
                    return ExitStatus::DrainTimeout;
                }
                Some(event) = self.receiver.recv() => match event {
                    LifecycleEvent::Signal(signal) => {
                        info!("received {} while draining, shutdown already in progress", signal);
                    }
                    LifecycleEvent::HandlerFault(message) => {
                        return self.fail_fast(&message);
                    }
                    other => self.observe(other),
                },
            }
        }
    }

    fn fail_fast(&self, message: &str) -> ExitStatus {
        metrics::counter!(LIFECYCLE_EVENTS, "kind" => "handler_fault").increment(1);
        error!("uncaught fault in request handler, exiting: {}", message);
        self.advance(Phase::Terminated);
        ExitStatus::Fatal
    }

    /// Events that are reported for visibility but never change the phase.
    fn observe(&self, event: LifecycleEvent) {
        metrics::counter!(LIFECYCLE_EVENTS, "kind" => event.kind()).increment(1);
        match event {
            LifecycleEvent::PoolFault(message) => {
                error!("unexpected error on idle postgres connection: {}", message)
            }
            LifecycleEvent::BackgroundFault(message) => {
                error!("background task failed: {}", message)
            }
            LifecycleEvent::Signal(_) | LifecycleEvent::HandlerFault(_) => {
                warn!("unhandled lifecycle event {:?}", event)
            }
        }
    }
}

impl Default for Lifecycle {
    fn default() -> Self {
        Self::new()
    }
}

/// Spawn a background task whose failure is reported as `LifecycleEvent::BackgroundFault`.
/// Such failures never take the listener down.
pub fn supervise<F>(name: &'static str, task: F, events: EventSender)
where
    F: Future<Output = ()> + Send + 'static,
{
    let handle = tokio::spawn(task);
    tokio::spawn(async move {
        match handle.await {
            Ok(()) => events.send(LifecycleEvent::BackgroundFault(format!(
                "{} exited unexpectedly",
                name
            ))),
            Err(err) if err.is_panic() => events.send(LifecycleEvent::BackgroundFault(format!(
                "{} panicked: {}",
                name, err
            ))),
            Err(_) => debug!("{} was cancelled", name),
        }
    });
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    #[test]
    fn phases_only_move_forward() {
        let lifecycle = Lifecycle::new();
        let phase = lifecycle.phase();
        let addr: SocketAddr = "127.0.0.1:3000".parse().unwrap();

        assert!(lifecycle.advance(Phase::Probing));
        assert!(!lifecycle.advance(Phase::Starting));
        assert!(!lifecycle.advance(Phase::Probing));
        assert!(lifecycle.advance(Phase::Serving(addr)));
        assert!(phase.borrow().is_serving());
        assert!(lifecycle.advance(Phase::Draining));
        assert!(!lifecycle.advance(Phase::Serving(addr)));
        assert!(!lifecycle.advance(Phase::Draining));
        assert!(lifecycle.advance(Phase::Terminated));
        assert!(!lifecycle.advance(Phase::Failed));
        assert_eq!(*phase.borrow(), Phase::Terminated);
    }

    #[test]
    fn failed_is_terminal() {
        let lifecycle = Lifecycle::new();

        assert!(lifecycle.advance(Phase::Probing));
        assert!(lifecycle.advance(Phase::Failed));
        assert!(!lifecycle.advance(Phase::Terminated));
        assert_eq!(*lifecycle.phase().borrow(), Phase::Failed);
    }

    #[test]
    fn exit_codes() {
        assert_eq!(ExitStatus::Clean.code(), 0);
        assert_eq!(ExitStatus::Fatal.code(), 1);
        assert_ne!(ExitStatus::DrainTimeout.code(), 0);
        assert_ne!(ExitStatus::DrainTimeout.code(), ExitStatus::Fatal.code());
    }

    #[tokio::test]
    async fn supervised_panics_become_background_faults() {
        let mut lifecycle = Lifecycle::new();

        supervise(
            "exploding",
            async { panic!("background boom") },
            lifecycle.events(),
        );

        let event = tokio::time::timeout(Duration::from_secs(5), lifecycle.receiver.recv())
            .await
            .expect("no event reported")
            .expect("channel closed");
        match event {
            LifecycleEvent::BackgroundFault(message) => assert!(message.contains("exploding")),
            other => panic!("unexpected event {:?}", other),
        }
    }

    #[tokio::test]
    async fn supervised_tasks_that_return_are_reported() {
        let mut lifecycle = Lifecycle::new();

        supervise("quitter", async {}, lifecycle.events());

        let event = tokio::time::timeout(Duration::from_secs(5), lifecycle.receiver.recv())
            .await
            .expect("no event reported");
        assert_eq!(
            event,
            Some(LifecycleEvent::BackgroundFault(
                "quitter exited unexpectedly".to_owned()
            ))
        );
    }
}
