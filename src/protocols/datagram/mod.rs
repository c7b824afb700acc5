//! Datagram acknowledgment protocol.
//!
//! Each datagram is a self-contained request. Whatever it carries, the sender
//! gets exactly one fixed acknowledgment back:
//!
//! ```text
//! Request:  <any payload>
//! Response: Message received\n
//! ```
//!
//! No state survives a datagram. The sender address is held only long enough
//! to write the reply. Payloads larger than the configured maximum are
//! truncated by the receive buffer; the truncation is logged and the datagram
//! is still acknowledged.

pub mod handler;

pub use handler::{DatagramServer, ACK};
