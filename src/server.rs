//! TCP listener for the line echo protocol.
//!
//! Accepts connections and hands each one to its own session task. The accept
//! loop never waits on session work.

use crate::error::{BindError, SessionError};
use crate::protocols::{stream, SessionEnd, Transport};
use std::future::Future;
use std::io;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;
use tokio::net::TcpListener;
use tokio::sync::Semaphore;
use tokio_util::sync::CancellationToken;
use tokio_util::task::TaskTracker;
use tracing::{debug, error, info, warn};

/// Listen backlog for TCP services
const LISTEN_BACKLOG: i32 = 1024;

/// Pause after a failed accept before trying again
const ACCEPT_ERROR_BACKOFF: Duration = Duration::from_millis(100);

/// Stream listener instance
pub struct StreamListener {
    listener: TcpListener,
    local_addr: SocketAddr,
    max_line_length: usize,
    connection_limit: Arc<Semaphore>,
    sessions: TaskTracker,
}

impl StreamListener {
    /// Bind the listener. Fails if the address is unavailable.
    pub async fn bind(
        addr: &str,
        max_line_length: usize,
        max_connections: usize,
    ) -> Result<Self, BindError> {
        let listener = bind_tcp(Transport::Stream, addr).await?;
        let local_addr = listener
            .local_addr()
            .map_err(|e| BindError::new(Transport::Stream, addr, e))?;

        Ok(StreamListener {
            listener,
            local_addr,
            max_line_length,
            connection_limit: Arc::new(Semaphore::new(max_connections)),
            sessions: TaskTracker::new(),
        })
    }

    pub fn local_addr(&self) -> SocketAddr {
        self.local_addr
    }

    /// Accept connections until `token` is cancelled, then wait for the
    /// sessions to wind down.
    pub async fn run(self, token: CancellationToken) {
        info!(address = %self.local_addr, "Stream listener started");

        while let Some((stream, peer)) = accept_next(|| self.listener.accept(), &token).await {
            let Ok(permit) = self.connection_limit.clone().try_acquire_owned() else {
                warn!(peer = %peer, "Connection limit reached, closing connection");
                continue;
            };

            debug!(peer = %peer, "New connection");

            let max_line_length = self.max_line_length;
            let session_token = token.child_token();
            self.sessions.spawn(async move {
                let result =
                    stream::handle_connection(stream, max_line_length, session_token).await;
                log_session_end(peer, result);
                drop(permit);
            });
        }

        self.sessions.close();
        debug!(
            sessions = self.sessions.len(),
            "Stream listener stopping, waiting for sessions"
        );
        self.sessions.wait().await;
        info!(address = %self.local_addr, "Stream listener stopped");
    }
}

/// Wait for the next connection. Returns `None` once `token` is cancelled.
///
/// Accept failures (e.g. EMFILE) are logged and retried after a pause, so a
/// persistent error cannot spin the loop.
async fn accept_next<S, F, Fut>(
    mut accept: F,
    token: &CancellationToken,
) -> Option<(S, SocketAddr)>
where
    F: FnMut() -> Fut,
    Fut: Future<Output = io::Result<(S, SocketAddr)>>,
{
    loop {
        let accepted = tokio::select! {
            _ = token.cancelled() => return None,
            accepted = accept() => accepted,
        };

        match accepted {
            Ok(connection) => return Some(connection),
            Err(e) => {
                error!(error = %e, "Failed to accept connection");
                tokio::select! {
                    _ = token.cancelled() => return None,
                    _ = tokio::time::sleep(ACCEPT_ERROR_BACKOFF) => {}
                }
            }
        }
    }
}

fn log_session_end(peer: SocketAddr, result: Result<SessionEnd, SessionError>) {
    match result {
        Ok(SessionEnd::PeerClosed) => debug!(peer = %peer, "Client disconnected"),
        Ok(SessionEnd::Cancelled) => debug!(peer = %peer, "Session cancelled"),
        Err(e) => warn!(peer = %peer, error = %e, "Session ended with error"),
    }
}

/// Resolve `addr` and bind a TCP listener on the first address that works.
pub(crate) async fn bind_tcp(transport: Transport, addr: &str) -> Result<TcpListener, BindError> {
    let candidates = tokio::net::lookup_host(addr)
        .await
        .map_err(|e| BindError::new(transport, addr, e))?;

    let mut last_err = None;
    for candidate in candidates {
        match create_listener(candidate) {
            Ok(std_listener) => {
                return TcpListener::from_std(std_listener)
                    .map_err(|e| BindError::new(transport, addr, e));
            }
            Err(e) => last_err = Some(e),
        }
    }

    Err(BindError::new(
        transport,
        addr,
        last_err.unwrap_or_else(|| {
            io::Error::new(io::ErrorKind::InvalidInput, "address resolved to nothing")
        }),
    ))
}

/// Create a non-blocking TCP listener with SO_REUSEADDR.
///
/// SO_REUSEPORT stays off so that a port held by another process is reported
/// as a bind failure.
fn create_listener(addr: SocketAddr) -> io::Result<std::net::TcpListener> {
    let socket = socket2::Socket::new(
        socket2::Domain::for_address(addr),
        socket2::Type::STREAM,
        Some(socket2::Protocol::TCP),
    )?;

    socket.set_reuse_address(true)?;
    socket.set_nonblocking(true)?;
    socket.bind(&addr.into())?;
    socket.listen(LISTEN_BACKLOG)?;

    Ok(socket.into())
}
