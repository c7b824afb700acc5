//! Line echo protocol.
//!
//! Every newline-terminated line a client sends is answered with a fixed
//! prefix followed by the line, byte-for-byte, terminator included:
//!
//! ```text
//! Request:  ping\n
//! Response: Message received: ping\n
//! ```
//!
//! There are no commands. The session ends when the client closes its write
//! side, when an I/O error occurs, or when a line grows past the configured
//! cap without a terminator. Bytes left unterminated at end-of-stream are
//! discarded.

pub mod handler;
pub mod parser;

pub use handler::handle_connection;
