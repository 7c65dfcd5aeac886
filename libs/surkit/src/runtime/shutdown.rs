//! Shutdown coordination: turns OS signals, tokens or arbitrary futures into
//! exactly one host stop, and reports how it went.

use crate::runtime::{AppHost, HostError};
use parking_lot::Mutex;
use std::future::Future;
use std::pin::Pin;
use std::sync::Arc;
use surkit_bootstrap::signals::wait_for_shutdown;
use tokio_util::sync::CancellationToken;

/// How the coordinator should decide when to stop.
pub enum ShutdownOptions {
    /// Listen for OS signals (Ctrl+C / SIGTERM).
    Signals,
    /// An external `CancellationToken` controls the lifecycle.
    Token(CancellationToken),
    /// An arbitrary future; when it completes, we initiate shutdown.
    Future(Pin<Box<dyn Future<Output = ()> + Send>>),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ShutdownPhase {
    Running,
    Draining,
    Stopped,
}

#[derive(Debug)]
pub enum ShutdownOutcome {
    /// Every stop step succeeded.
    Clean,
    /// Another caller had already started the shutdown.
    AlreadyInProgress,
    Failed(HostError),
}

impl ShutdownOutcome {
    pub fn is_clean(&self) -> bool {
        !matches!(self, ShutdownOutcome::Failed(_))
    }

    /// Process exit code: 0 unless a shutdown step failed.
    pub fn exit_code(&self) -> u8 {
        match self {
            ShutdownOutcome::Failed(_) => 1,
            _ => 0,
        }
    }
}

pub struct ShutdownCoordinator {
    host: Arc<AppHost>,
    phase: Mutex<ShutdownPhase>,
}

impl ShutdownCoordinator {
    pub fn new(host: Arc<AppHost>) -> Arc<Self> {
        Arc::new(Self {
            host,
            phase: Mutex::new(ShutdownPhase::Running),
        })
    }

    pub fn phase(&self) -> ShutdownPhase {
        *self.phase.lock()
    }

    /// Stop the host once. Later calls return `AlreadyInProgress` without
    /// touching the host.
    pub async fn shutdown(&self) -> ShutdownOutcome {
        {
            let mut phase = self.phase.lock();
            if *phase != ShutdownPhase::Running {
                tracing::info!(phase = ?*phase, "shutdown already in progress; ignoring");
                return ShutdownOutcome::AlreadyInProgress;
            }
            *phase = ShutdownPhase::Draining;
        }

        tracing::info!("shutdown: draining host");
        let outcome = match self.host.stop().await {
            Ok(()) => ShutdownOutcome::Clean,
            Err(e) => ShutdownOutcome::Failed(e),
        };
        *self.phase.lock() = ShutdownPhase::Stopped;
        outcome
    }

    /// Arm the trigger from `options`, wait for a stop request (from the
    /// trigger or from `AppHost::request_stop`), then shut down.
    pub async fn run(self: &Arc<Self>, options: ShutdownOptions) -> ShutdownOutcome {
        let host = self.host.clone();
        match options {
            ShutdownOptions::Signals => {
                let coordinator = Arc::clone(self);
                tokio::spawn(async move {
                    loop {
                        match wait_for_shutdown().await {
                            Ok(signal) => {
                                if coordinator.phase() == ShutdownPhase::Running {
                                    tracing::info!(?signal, "shutdown: signal received");
                                    host.request_stop();
                                } else {
                                    tracing::info!(?signal, "shutdown already in progress; ignoring signal");
                                }
                            }
                            Err(e) => {
                                tracing::warn!(
                                    error = %e,
                                    "shutdown: primary waiter failed; falling back to ctrl_c()"
                                );
                                let _ = tokio::signal::ctrl_c().await;
                                host.request_stop();
                                break;
                            }
                        }
                    }
                });
            }
            ShutdownOptions::Token(token) => {
                tokio::spawn(async move {
                    token.cancelled().await;
                    tracing::info!("shutdown: external token cancelled");
                    host.request_stop();
                });
            }
            ShutdownOptions::Future(waiter) => {
                tokio::spawn(async move {
                    waiter.await;
                    tracing::info!("shutdown: external future completed");
                    host.request_stop();
                });
            }
        }

        self.host.stop_requested().await;
        self.shutdown().await
    }
}
