//! Upgrade route and per-channel echo loop.

use axum::extract::ws::{Message, WebSocket, WebSocketUpgrade};
use axum::extract::{ConnectInfo, State};
use axum::response::IntoResponse;
use axum::routing::get;
use axum::Router;
use bytes::{Bytes, BytesMut};
use std::net::SocketAddr;
use std::time::Duration;
use tokio::net::TcpListener;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, trace, warn};

use crate::error::{BindError, SessionError};
use crate::protocols::{SessionEnd, Transport};
use crate::server::bind_tcp;

/// Prefix written in front of every echoed message.
pub const RESPONSE_PREFIX: &str = "Echo: ";

/// How long a cancelled channel may spend sending its close frame
const CLOSE_TIMEOUT: Duration = Duration::from_millis(500);

#[derive(Clone)]
struct ChannelState {
    token: CancellationToken,
}

/// Build the router exposing the upgrade route at `path`.
pub fn router(path: &str, token: CancellationToken) -> Router {
    Router::new()
        .route(path, get(upgrade_handler))
        .with_state(ChannelState { token })
}

/// WebSocket upgrade server instance
pub struct WebSocketServer {
    listener: TcpListener,
    local_addr: SocketAddr,
    path: String,
}

impl WebSocketServer {
    /// Bind the HTTP listener. Fails if the address is unavailable.
    pub async fn bind(addr: &str, path: &str) -> Result<Self, BindError> {
        let listener = bind_tcp(Transport::WebSocket, addr).await?;
        let local_addr = listener
            .local_addr()
            .map_err(|e| BindError::new(Transport::WebSocket, addr, e))?;

        Ok(WebSocketServer {
            listener,
            local_addr,
            path: path.to_string(),
        })
    }

    pub fn local_addr(&self) -> SocketAddr {
        self.local_addr
    }

    /// Serve upgrade requests until `token` is cancelled.
    pub async fn run(self, token: CancellationToken) {
        info!(
            address = %self.local_addr,
            path = %self.path,
            "WebSocket server started"
        );

        let app = router(&self.path, token.clone())
            .into_make_service_with_connect_info::<SocketAddr>();

        if let Err(e) = axum::serve(self.listener, app)
            .with_graceful_shutdown(token.cancelled_owned())
            .await
        {
            error!(error = %e, "WebSocket server failed");
        }

        info!(address = %self.local_addr, "WebSocket server stopped");
    }
}

async fn upgrade_handler(
    ws: WebSocketUpgrade,
    ConnectInfo(peer): ConnectInfo<SocketAddr>,
    State(state): State<ChannelState>,
) -> impl IntoResponse {
    debug!(peer = %peer, "WebSocket upgrade");

    ws.on_upgrade(move |socket| async move {
        match handle_socket(socket, state.token).await {
            Ok(SessionEnd::PeerClosed) => debug!(peer = %peer, "WebSocket client disconnected"),
            Ok(SessionEnd::Cancelled) => debug!(peer = %peer, "WebSocket session cancelled"),
            Err(e) => warn!(peer = %peer, error = %e, "WebSocket session ended with error"),
        }
    })
}

/// Echo loop for one upgraded channel.
pub async fn handle_socket(
    mut socket: WebSocket,
    token: CancellationToken,
) -> Result<SessionEnd, SessionError> {
    loop {
        let received = tokio::select! {
            _ = token.cancelled() => {
                // Best effort; the peer may already be gone or not reading
                let close = socket.send(Message::Close(None));
                let _ = tokio::time::timeout(CLOSE_TIMEOUT, close).await;
                return Ok(SessionEnd::Cancelled);
            }
            received = socket.recv() => received,
        };

        let reply = match received {
            None => return Ok(SessionEnd::PeerClosed),
            Some(Err(e)) => return Err(SessionError::WebSocket(e)),
            Some(Ok(Message::Close(_))) => return Ok(SessionEnd::PeerClosed),
            Some(Ok(Message::Ping(_) | Message::Pong(_))) => continue,
            Some(Ok(Message::Text(text))) => {
                trace!(bytes = text.as_str().len(), "Echoing text message");
                Message::Text(echo_text(text.as_str()).into())
            }
            Some(Ok(Message::Binary(data))) => {
                trace!(bytes = data.len(), "Echoing binary message");
                match std::str::from_utf8(&data) {
                    Ok(text) => Message::Text(echo_text(text).into()),
                    Err(_) => Message::Binary(echo_binary(&data)),
                }
            }
        };

        tokio::select! {
            _ = token.cancelled() => return Ok(SessionEnd::Cancelled),
            sent = socket.send(reply) => sent?,
        }
    }
}

/// Echo response for a text message.
pub fn echo_text(message: &str) -> String {
    let mut reply = String::with_capacity(RESPONSE_PREFIX.len() + message.len());
    reply.push_str(RESPONSE_PREFIX);
    reply.push_str(message);
    reply
}

fn echo_binary(data: &[u8]) -> Bytes {
    let mut reply = BytesMut::with_capacity(RESPONSE_PREFIX.len() + data.len());
    reply.extend_from_slice(RESPONSE_PREFIX.as_bytes());
    reply.extend_from_slice(data);
    reply.freeze()
}
