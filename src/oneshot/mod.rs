//! One-shot network operations.
//!
//! Each operation is a single call with its own timeout and no shared state:
//! - `fetch`: HTTP GET, full body
//! - `resolve`: host name to IP addresses
//! - `probe`: ICMP echo round-trip time
//!
//! Failures are returned to the caller and never retried here.

pub mod fetch;
pub mod probe;
pub mod resolve;

pub use fetch::fetch;
pub use probe::{probe, Prober};
pub use resolve::resolve_host;

use std::sync::Arc;
use tokio_util::sync::CancellationToken;
use tokio_util::task::TaskTracker;
use tracing::{error, info, warn};

use crate::config::{StartupConfig, Timeouts};

/// Launch every configured startup operation as its own task on `tracker`.
///
/// Outcomes are logged. Cancelling `token` abandons operations still in
/// flight.
pub fn spawn_startup(
    startup: &StartupConfig,
    timeouts: Timeouts,
    tracker: &TaskTracker,
    token: &CancellationToken,
) {
    for url in &startup.fetch {
        let url = url.clone();
        spawn_cancellable(tracker, token, async move {
            match fetch(&url, timeouts.fetch).await {
                Ok(response) if response.is_success() => info!(
                    url = %url,
                    status = response.status.as_u16(),
                    bytes = response.body.len(),
                    elapsed_ms = response.elapsed.as_millis() as u64,
                    "Fetched URL"
                ),
                Ok(response) => warn!(
                    url = %url,
                    status = response.status.as_u16(),
                    bytes = response.body.len(),
                    "Fetch returned non-success status"
                ),
                Err(e) => error!(error = %e, "Fetch failed"),
            }
        });
    }

    for domain in &startup.resolve {
        let domain = domain.clone();
        spawn_cancellable(tracker, token, async move {
            match resolve_host(&domain, timeouts.resolve).await {
                Ok(addrs) => info!(domain = %domain, addresses = ?addrs, "Resolved host"),
                Err(e) => error!(error = %e, "Resolution failed"),
            }
        });
    }

    if !startup.probe.is_empty() {
        let prober = Arc::new(Prober::new(timeouts.probe, timeouts.resolve));
        for host in &startup.probe {
            let host = host.clone();
            let prober = Arc::clone(&prober);
            spawn_cancellable(tracker, token, async move {
                match prober.probe(&host).await {
                    Ok(reply) => info!(
                        host = %host,
                        addr = %reply.addr,
                        rtt_us = reply.rtt.as_micros() as u64,
                        "Probe reply"
                    ),
                    Err(e) => error!(host = %host, error = %e, "Probe failed"),
                }
            });
        }
    }
}

fn spawn_cancellable<F>(tracker: &TaskTracker, token: &CancellationToken, operation: F)
where
    F: std::future::Future<Output = ()> + Send + 'static,
{
    let token = token.clone();
    tracker.spawn(async move {
        tokio::select! {
            _ = token.cancelled() => {}
            _ = operation => {}
        }
    });
}
