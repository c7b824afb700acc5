//! Host name resolution through the system resolver.

use std::net::IpAddr;
use std::time::Duration;

use crate::error::ResolutionError;

/// Resolve `domain` to its distinct IP addresses, in resolver order.
///
/// IP literals resolve to themselves.
pub async fn resolve_host(domain: &str, timeout: Duration) -> Result<Vec<IpAddr>, ResolutionError> {
    let domain = domain.trim();
    if domain.is_empty() {
        return Err(ResolutionError::EmptyName);
    }

    let lookup = tokio::net::lookup_host((domain, 0));
    let addrs = match tokio::time::timeout(timeout, lookup).await {
        Ok(Ok(addrs)) => addrs,
        Ok(Err(source)) => {
            return Err(ResolutionError::Lookup {
                domain: domain.to_string(),
                source,
            })
        }
        Err(_) => {
            return Err(ResolutionError::Timeout {
                domain: domain.to_string(),
                timeout,
            })
        }
    };

    let mut ips: Vec<IpAddr> = Vec::new();
    for addr in addrs {
        if !ips.contains(&addr.ip()) {
            ips.push(addr.ip());
        }
    }

    if ips.is_empty() {
        return Err(ResolutionError::NoAddresses {
            domain: domain.to_string(),
        });
    }
    Ok(ips)
}
