use std::io;
use std::net::SocketAddr;
use std::time;

use axum::Router;
use thiserror::Error;
use tokio::net::TcpListener;
use tokio::signal::unix::{signal, SignalKind};
use tokio::sync::oneshot;
use tokio::task::{JoinError, JoinHandle};
use tracing::{debug, info};

use crate::lifecycle::{EventSender, LifecycleEvent, ShutdownSignal};

#[derive(Debug, Clone)]
pub struct ServeConfig {
    /// host:port to bind once the database is ready.
    pub bind: String,
    /// How long in-flight requests get to finish once draining starts.
    pub drain_timeout: time::Duration,
}

#[derive(Error, Debug)]
pub enum ServerError {
    #[error("http server failed: {0}")]
    Io(#[from] io::Error),
    #[error("http server task failed: {0}")]
    Task(#[from] JoinError),
}

/// The active listener and the task serving it.
/// Dropping the handle aborts the task, cutting off any request still running.
pub struct ServerHandle {
    addr: SocketAddr,
    drain: Option<oneshot::Sender<()>>,
    task: JoinHandle<io::Result<()>>,
}

impl ServerHandle {
    pub async fn start(bind: &str, app: Router) -> io::Result<ServerHandle> {
        let listener = TcpListener::bind(bind).await?;
        let addr = listener.local_addr()?;
        let (drain, drain_requested) = oneshot::channel::<()>();

        let task = tokio::spawn(async move {
            axum::serve(listener, app)
                .with_graceful_shutdown(async move {
                    if drain_requested.await.is_err() {
                        debug!("server handle dropped, shutting down listener");
                    }
                })
                .await
        });

        info!("listening on {}", addr);
        Ok(ServerHandle {
            addr,
            drain: Some(drain),
            task,
        })
    }

    pub fn local_addr(&self) -> SocketAddr {
        self.addr
    }

    /// Stop accepting connections and let open ones finish. Returns false if already draining.
    pub fn begin_drain(&mut self) -> bool {
        match self.drain.take() {
            Some(drain) => {
                if drain.send(()).is_err() {
                    debug!("http server already stopped before draining");
                }
                true
            }
            None => false,
        }
    }

    /// Resolves once the serving task has finished. Must not be polled again after it resolves.
    pub async fn stopped(&mut self) -> Result<(), ServerError> {
        (&mut self.task).await??;
        Ok(())
    }
}

impl Drop for ServerHandle {
    fn drop(&mut self) {
        self.task.abort();
    }
}

/// Forward SIGTERM and SIGINT to the lifecycle controller. Both are treated the same way.
pub fn spawn_signal_listener(events: EventSender) -> io::Result<JoinHandle<()>> {
    let mut term = signal(SignalKind::terminate())?;
    let mut interrupt = signal(SignalKind::interrupt())?;

    Ok(tokio::spawn(async move {
        loop {
            let received = tokio::select! {
                Some(()) = term.recv() => ShutdownSignal::Terminate,
                Some(()) = interrupt.recv() => ShutdownSignal::Interrupt,
                else => break,
            };
            events.send(LifecycleEvent::Signal(received));
        }
    }))
}
