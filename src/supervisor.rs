//! Service supervision.
//!
//! Starting: bind and launch every enabled service plus the startup
//! one-shots. A service that cannot bind is logged and skipped; the others
//! keep going.
//!
//! Running: wait for a shutdown signal or an external cancel.
//!
//! Stopping: cancel the shared token, wait up to the shutdown timeout for
//! every service, abort whatever is left.

use std::future::Future;
use std::net::SocketAddr;
use std::time::Duration;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tokio_util::task::TaskTracker;
use tracing::{error, info, warn};

use crate::config::Config;
use crate::error::BindError;
use crate::oneshot;
use crate::protocols::datagram::DatagramServer;
use crate::protocols::websocket::WebSocketServer;
use crate::protocols::Transport;
use crate::server::StreamListener;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum State {
    Starting,
    Running,
    Stopping,
}

/// A launched service.
pub struct ServiceHandle {
    pub transport: Transport,
    pub local_addr: SocketAddr,
    task: JoinHandle<()>,
}

pub struct Supervisor {
    state: State,
    token: CancellationToken,
    services: Vec<ServiceHandle>,
    bind_failures: Vec<BindError>,
    oneshots: TaskTracker,
    shutdown_timeout: Duration,
}

impl Supervisor {
    /// Launch every enabled service and startup operation.
    pub async fn start(config: Config) -> Self {
        let mut supervisor = Supervisor {
            state: State::Starting,
            token: CancellationToken::new(),
            services: Vec::new(),
            bind_failures: Vec::new(),
            oneshots: TaskTracker::new(),
            shutdown_timeout: config.shutdown_timeout,
        };
        info!(state = ?supervisor.state, "Supervisor starting services");

        if let Some(addr) = &config.stream_listen {
            let bound =
                StreamListener::bind(addr, config.max_line_length, config.max_connections).await;
            supervisor.launch(bound, |s| s.local_addr(), Transport::Stream, StreamListener::run);
        }

        if let Some(addr) = &config.datagram_listen {
            let bound = DatagramServer::bind(addr, config.max_datagram_size).await;
            supervisor.launch(bound, |s| s.local_addr(), Transport::Datagram, DatagramServer::run);
        }

        if let Some(addr) = &config.websocket_listen {
            let bound = WebSocketServer::bind(addr, &config.websocket_path).await;
            supervisor.launch(
                bound,
                |s| s.local_addr(),
                Transport::WebSocket,
                WebSocketServer::run,
            );
        }

        if !config.startup.is_empty() {
            oneshot::spawn_startup(
                &config.startup,
                config.timeouts,
                &supervisor.oneshots,
                &supervisor.token,
            );
        }

        if supervisor.services.is_empty() {
            warn!("No services running");
        }

        supervisor.state = State::Running;
        info!(
            state = ?supervisor.state,
            services = supervisor.services.len(),
            failed = supervisor.bind_failures.len(),
            "Supervisor running"
        );
        supervisor
    }

    fn launch<S, Fut>(
        &mut self,
        bound: Result<S, BindError>,
        local_addr: impl FnOnce(&S) -> SocketAddr,
        transport: Transport,
        run: impl FnOnce(S, CancellationToken) -> Fut,
    ) where
        Fut: Future<Output = ()> + Send + 'static,
    {
        match bound {
            Ok(service) => {
                let local_addr = local_addr(&service);
                let task = tokio::spawn(run(service, self.token.child_token()));
                self.services.push(ServiceHandle {
                    transport,
                    local_addr,
                    task,
                });
            }
            Err(e) => {
                error!(error = %e, "Service failed to start");
                self.bind_failures.push(e);
            }
        }
    }

    pub fn state(&self) -> State {
        self.state
    }

    pub fn services(&self) -> &[ServiceHandle] {
        &self.services
    }

    /// Services that could not bind their address.
    pub fn bind_failures(&self) -> &[BindError] {
        &self.bind_failures
    }

    /// Bound address of the running service for `transport`, if any.
    pub fn local_addr(&self, transport: Transport) -> Option<SocketAddr> {
        self.services
            .iter()
            .find(|s| s.transport == transport)
            .map(|s| s.local_addr)
    }

    /// Token whose cancellation stops the supervisor.
    pub fn token(&self) -> CancellationToken {
        self.token.clone()
    }

    /// Run until `signal` resolves or the token is cancelled, then stop.
    pub async fn run_until<F>(self, signal: F)
    where
        F: Future<Output = ()>,
    {
        tokio::select! {
            _ = signal => info!("Shutdown signal received"),
            _ = self.token.cancelled() => info!("Shutdown requested"),
        }
        self.shutdown().await;
    }

    /// Cancel every service and wait for them, bounded by the shutdown timeout.
    pub async fn shutdown(mut self) {
        self.state = State::Stopping;
        info!(
            state = ?self.state,
            services = self.services.len(),
            timeout_secs = self.shutdown_timeout.as_secs(),
            "Supervisor stopping"
        );

        self.token.cancel();
        self.oneshots.close();

        let timeout = self.shutdown_timeout;
        let oneshots = self.oneshots.clone();
        let services = &mut self.services;
        let drain = async move {
            futures::future::join_all(services.iter_mut().map(|s| &mut s.task)).await;
            oneshots.wait().await;
        };

        if tokio::time::timeout(timeout, drain).await.is_err() {
            warn!(
                timeout = ?timeout,
                "Shutdown timed out, aborting remaining services"
            );
            for service in &self.services {
                if !service.task.is_finished() {
                    service.task.abort();
                }
            }
        }

        info!("Supervisor stopped");
    }
}

/// Resolves on Ctrl-C, or SIGTERM on Unix.
pub async fn shutdown_signal() {
    let ctrl_c = async {
        if let Err(e) = tokio::signal::ctrl_c().await {
            error!(error = %e, "Failed to listen for Ctrl-C");
            std::future::pending::<()>().await;
        }
    };

    #[cfg(unix)]
    let terminate = async {
        match tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate()) {
            Ok(mut sigterm) => {
                sigterm.recv().await;
            }
            Err(e) => {
                error!(error = %e, "Failed to listen for SIGTERM");
                std::future::pending::<()>().await;
            }
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {}
        _ = terminate => {}
    }
}
