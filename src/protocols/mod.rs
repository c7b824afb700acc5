//! Protocol implementations.
//!
//! Each protocol owns its framing and its session loop:
//! - `stream`: newline-delimited echo over TCP
//! - `datagram`: stateless acknowledgments over UDP
//! - `websocket`: message echo over an HTTP upgrade

use std::fmt;

pub mod datagram;
pub mod stream;
pub mod websocket;

/// Transport served by one of the endpoint's services.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Transport {
    Stream,
    Datagram,
    WebSocket,
}

impl fmt::Display for Transport {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Transport::Stream => "stream",
            Transport::Datagram => "datagram",
            Transport::WebSocket => "websocket",
        };
        f.write_str(name)
    }
}

/// How a session loop ended without an error.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SessionEnd {
    /// The peer closed its side (end-of-stream or close frame).
    PeerClosed,
    /// The endpoint is shutting down.
    Cancelled,
}
