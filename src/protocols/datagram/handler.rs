//! UDP receive loop.

use std::net::SocketAddr;
use tokio::net::UdpSocket;
use tokio_util::sync::CancellationToken;
use tracing::{info, trace, warn};

use crate::error::BindError;
use crate::protocols::Transport;

/// Acknowledgment sent for every received datagram.
pub const ACK: &[u8] = b"Message received\n";

/// Stateless UDP acknowledgment server
pub struct DatagramServer {
    socket: UdpSocket,
    local_addr: SocketAddr,
    max_datagram_size: usize,
}

impl DatagramServer {
    /// Bind the UDP socket. Fails if the address is unavailable.
    pub async fn bind(addr: &str, max_datagram_size: usize) -> Result<Self, BindError> {
        let socket = UdpSocket::bind(addr)
            .await
            .map_err(|e| BindError::new(Transport::Datagram, addr, e))?;
        let local_addr = socket
            .local_addr()
            .map_err(|e| BindError::new(Transport::Datagram, addr, e))?;

        Ok(DatagramServer {
            socket,
            local_addr,
            max_datagram_size,
        })
    }

    pub fn local_addr(&self) -> SocketAddr {
        self.local_addr
    }

    /// Receive and acknowledge datagrams until `token` is cancelled.
    ///
    /// Receive and send failures are logged and the loop moves on.
    pub async fn run(self, token: CancellationToken) {
        info!(address = %self.local_addr, "Datagram server started");

        // One spare byte tells a payload of exactly the limit apart from a
        // truncated one.
        let mut buffer = vec![0u8; self.max_datagram_size + 1];

        loop {
            let received = tokio::select! {
                _ = token.cancelled() => break,
                received = self.socket.recv_from(&mut buffer) => received,
            };

            match received {
                Ok((n, sender)) => {
                    let payload = &buffer[..n.min(self.max_datagram_size)];
                    if n > self.max_datagram_size {
                        warn!(
                            peer = %sender,
                            limit = self.max_datagram_size,
                            "Datagram exceeds limit, payload truncated"
                        );
                    }
                    trace!(
                        peer = %sender,
                        bytes = payload.len(),
                        payload = %String::from_utf8_lossy(payload),
                        "Received datagram"
                    );

                    if let Err(e) = self.socket.send_to(ACK, sender).await {
                        warn!(peer = %sender, error = %e, "Failed to send acknowledgment");
                    }
                }
                Err(e) => {
                    warn!(error = %e, "Failed to receive datagram");
                }
            }
        }

        info!(address = %self.local_addr, "Datagram server stopped");
    }
}
