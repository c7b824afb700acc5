//! Error types for the endpoint's services and one-shot operations.
//!
//! Accept and receive failures are plain `std::io::Error`s: they are logged
//! where they happen and the loop continues, so they never travel.

use crate::protocols::Transport;
use std::io;
use std::net::IpAddr;
use std::time::Duration;
use thiserror::Error;

/// A service could not claim its address. Fatal to that service only.
#[derive(Debug, Error)]
#[error("failed to bind {transport} service on {addr}: {source}")]
pub struct BindError {
    pub transport: Transport,
    pub addr: String,
    #[source]
    pub source: io::Error,
}

impl BindError {
    pub fn new(transport: Transport, addr: impl Into<String>, source: io::Error) -> Self {
        BindError {
            transport,
            addr: addr.into(),
            source,
        }
    }
}

/// Terminal failure of a single session.
#[derive(Debug, Error)]
pub enum SessionError {
    #[error("session I/O error: {0}")]
    Io(#[from] io::Error),
    #[error("line exceeds {limit} bytes")]
    LineTooLong { limit: usize },
    #[error("websocket error: {0}")]
    WebSocket(#[from] axum::Error),
}

/// Outbound HTTP fetch failure.
#[derive(Debug, Error)]
pub enum RequestError {
    #[error("invalid URL '{url}': {reason}")]
    InvalidUrl { url: String, reason: String },
    #[error("failed to build HTTP client: {0}")]
    Client(#[source] reqwest::Error),
    #[error("request to {url} failed: {source}")]
    Transport {
        url: String,
        #[source]
        source: reqwest::Error,
    },
    #[error("failed to read response body from {url}: {source}")]
    Body {
        url: String,
        #[source]
        source: reqwest::Error,
    },
}

/// Name resolution failure.
#[derive(Debug, Error)]
pub enum ResolutionError {
    #[error("empty host name")]
    EmptyName,
    #[error("failed to resolve '{domain}': {source}")]
    Lookup {
        domain: String,
        #[source]
        source: io::Error,
    },
    #[error("'{domain}' resolved to no addresses")]
    NoAddresses { domain: String },
    #[error("resolving '{domain}' timed out after {timeout:?}")]
    Timeout { domain: String, timeout: Duration },
}

/// Reachability probe failure.
#[derive(Debug, Error)]
pub enum ProbeError {
    #[error(transparent)]
    Resolve(#[from] ResolutionError),
    #[error("ICMP probing of {addr} is not available: {source}")]
    Unsupported {
        addr: IpAddr,
        #[source]
        source: io::Error,
    },
    #[error("no echo reply from {addr} within {timeout:?}")]
    Timeout { addr: IpAddr, timeout: Duration },
    #[error("{addr} is unreachable (ICMP code {code})")]
    Unreachable { addr: IpAddr, code: u8 },
    #[error("probe of {addr} failed: {source}")]
    Io {
        addr: IpAddr,
        #[source]
        source: io::Error,
    },
}
