//! Process lifecycle: named tasks, supervision, shutdown and probing.
//!
//! Every subcommand spawns its long-running activities into one `JoinSet`
//! and hands it to [`run_supervisor`]. A task that fails cancels the rest;
//! after cancellation the supervisor keeps joining so reducers get to run
//! their final flush before the process exits.

use crate::backoff::Backoff;
use crate::transport::{connect_and_subscribe, Handshake, TransportError};
use crate::wire::Endpoint;
use anyhow::Result;
use axum::Router;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::net::TcpListener;
use tokio::task::JoinSet;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;
use tracing::{error, info, warn};

// ============================================================================
// Readiness
// ============================================================================

/// Shared "ready to serve" flag behind `/ready`.
#[derive(Debug, Clone, Default)]
pub struct Readiness(Arc<AtomicBool>);

impl Readiness {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn set_ready(&self, ready: bool) {
        self.0.store(ready, Ordering::Release);
    }

    pub fn is_ready(&self) -> bool {
        self.0.load(Ordering::Acquire)
    }
}

// ============================================================================
// Task Names for Supervisor Logging
// ============================================================================

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TaskName {
    HttpServer,
    PublisherPump,
    Subscription,
    FlushLoop,
    WindowLoop,
}

impl std::fmt::Display for TaskName {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            TaskName::HttpServer => write!(f, "HttpServer"),
            TaskName::PublisherPump => write!(f, "PublisherPump"),
            TaskName::Subscription => write!(f, "Subscription"),
            TaskName::FlushLoop => write!(f, "FlushLoop"),
            TaskName::WindowLoop => write!(f, "WindowLoop"),
        }
    }
}

pub type TaskSet = JoinSet<Result<TaskName>>;

// ============================================================================
// HTTP
// ============================================================================

/// Bind the HTTP listener. Failure is a startup error.
pub async fn bind_http(addr: &str) -> Result<TcpListener> {
    TcpListener::bind(addr)
        .await
        .map_err(|e| anyhow::anyhow!("cannot bind HTTP server on {addr}: {e}"))
}

/// Spawn the HTTP server task into the JoinSet.
pub fn spawn_http_server(
    task_set: &mut TaskSet,
    listener: TcpListener,
    app: Router,
    cancel_token: CancellationToken,
) {
    task_set.spawn(async move {
        info!(addr = ?listener.local_addr().ok(), "[HttpServer] Task starting");

        let result = axum::serve(listener, app)
            .with_graceful_shutdown(async move {
                cancel_token.cancelled().await;
                info!("[HttpServer] Received shutdown signal");
            })
            .await;

        match result {
            Ok(()) => {
                info!("[HttpServer] Graceful shutdown complete");
                Ok(TaskName::HttpServer)
            }
            Err(e) => {
                error!("[HttpServer] Server error: {}", e);
                Err(anyhow::anyhow!("HTTP server error: {}", e))
            }
        }
    });
}

// ============================================================================
// Supervisor
// ============================================================================

/// Monitor tasks until shutdown or the first failure, then drain.
///
/// Tasks still running after `drain_timeout` are aborted.
pub async fn run_supervisor(
    task_set: &mut TaskSet,
    cancel_token: CancellationToken,
    drain_timeout: Duration,
) -> Result<()> {
    info!(tasks = task_set.len(), "[Supervisor] All tasks spawned, monitoring");

    let mut failure: Option<anyhow::Error> = None;
    loop {
        tokio::select! {
            () = cancel_token.cancelled() => {
                info!("[Supervisor] Shutdown signal received");
                break;
            }
            result = task_set.join_next() => {
                match result {
                    Some(Ok(Ok(task_name))) => {
                        info!("[Supervisor] Task {} completed normally", task_name);
                    }
                    Some(Ok(Err(e))) => {
                        error!("[Supervisor] Task failed with error: {:#}", e);
                        cancel_token.cancel();
                        failure = Some(e);
                        break;
                    }
                    Some(Err(e)) => {
                        error!("[Supervisor] Task panicked: {}", e);
                        cancel_token.cancel();
                        failure = Some(anyhow::anyhow!("Task panicked: {}", e));
                        break;
                    }
                    None => {
                        info!("[Supervisor] All tasks completed");
                        return Ok(());
                    }
                }
            }
        }
    }

    drain(task_set, drain_timeout).await;
    failure.map_or(Ok(()), Err)
}

async fn drain(task_set: &mut TaskSet, drain_timeout: Duration) {
    let drained = tokio::time::timeout(drain_timeout, async {
        while let Some(result) = task_set.join_next().await {
            match result {
                Ok(Ok(task_name)) => info!("[Supervisor] Task {} stopped", task_name),
                Ok(Err(e)) => warn!("[Supervisor] Task stopped with error: {:#}", e),
                Err(e) if e.is_cancelled() => {}
                Err(e) => warn!("[Supervisor] Task panicked during shutdown: {}", e),
            }
        }
    })
    .await;

    if drained.is_err() {
        warn!(
            remaining = task_set.len(),
            timeout_secs = drain_timeout.as_secs(),
            "[Supervisor] Drain timed out, aborting remaining tasks"
        );
        task_set.abort_all();
        while task_set.join_next().await.is_some() {}
    }
}

// ============================================================================
// Shutdown Signals
// ============================================================================

/// Cancel `token` on Ctrl-C or SIGTERM.
pub fn spawn_shutdown_listener(token: CancellationToken) {
    tokio::spawn(async move {
        shutdown_signal().await;
        info!("Shutdown requested, stopping tasks");
        token.cancel();
    });
}

async fn shutdown_signal() {
    let ctrl_c = async {
        if let Err(e) = tokio::signal::ctrl_c().await {
            warn!(error = %e, "Cannot listen for Ctrl-C");
            std::future::pending::<()>().await;
        }
    };

    #[cfg(unix)]
    let terminate = async {
        match tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate()) {
            Ok(mut stream) => {
                stream.recv().await;
            }
            Err(e) => {
                warn!(error = %e, "Cannot listen for SIGTERM");
                std::future::pending::<()>().await;
            }
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        () = ctrl_c => {}
        () = terminate => {}
    }
}

// ============================================================================
// Probe
// ============================================================================

/// Wait until a publisher accepts a subscription, or `timeout` elapses.
///
/// Used to start consumers only after the publisher is up. Rejection is
/// returned immediately; connection failures are retried.
pub async fn probe(
    endpoint: &Endpoint,
    topic: &str,
    timeout: Duration,
) -> Result<Handshake, TransportError> {
    let deadline = Instant::now() + timeout;
    let backoff = Backoff::new(Duration::from_millis(200), Duration::from_secs(2), 0.0);
    let mut attempt = 0u32;

    loop {
        let remaining = deadline.saturating_duration_since(Instant::now());
        if remaining.is_zero() {
            return Err(TransportError::Timeout("probe"));
        }
        let attempt_result =
            connect_and_subscribe(endpoint, topic, "phasecast-probe", remaining, remaining).await;
        match attempt_result {
            Ok((_connection, handshake)) => return Ok(handshake),
            Err(e) if e.is_fatal() => return Err(e),
            Err(e) => {
                warn!(%endpoint, attempt, error = %e, "Publisher not reachable yet");
                let delay = backoff
                    .delay(attempt)
                    .min(deadline.saturating_duration_since(Instant::now()));
                attempt = attempt.saturating_add(1);
                tokio::time::sleep(delay).await;
            }
        }
    }
}
