//! WebSocket echo protocol.
//!
//! One route (default `/ws`) accepts the HTTP upgrade handshake. On the
//! resulting channel every text message is answered with a prefixed copy:
//!
//! ```text
//! Request:  hello
//! Response: Echo: hello
//! ```
//!
//! Binary messages holding valid UTF-8 are answered as text, like any other
//! message. Binary messages that are not UTF-8 get the same prefix in a
//! binary reply. Ping/pong frames are answered by the WebSocket layer itself.
//! The session ends on a close frame, end of the underlying connection, any
//! receive or send error, or endpoint shutdown.

pub mod handler;

pub use handler::WebSocketServer;
