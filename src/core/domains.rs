//! Resolution of the configured service domains
//!
//! The second allow-list source: a fixed, statically configured list of
//! service hostnames resolved through the system resolver. Only A-record
//! IPv4 results are consumed. A domain that fails to resolve degrades
//! capability (that service becomes unreachable) but never aborts the
//! bootstrap - the caller logs and skips it.

use crate::core::error::{Error, Result};
use std::net::{IpAddr, Ipv4Addr};
use std::time::Duration;

/// Seam over name resolution so the phase machine is testable offline.
pub trait DomainResolver {
    /// Resolves a hostname to its IPv4 addresses.
    async fn resolve(&self, host: &str) -> Result<Vec<Ipv4Addr>>;
}

/// Production resolver using the system's standard resolution path.
#[derive(Debug, Clone, Copy)]
pub struct SystemResolver {
    timeout: Duration,
}

impl SystemResolver {
    pub fn new(timeout: Duration) -> Self {
        Self { timeout }
    }
}

impl DomainResolver for SystemResolver {
    async fn resolve(&self, host: &str) -> Result<Vec<Ipv4Addr>> {
        // lookup_host needs a port; 443 is arbitrary and discarded
        let query = format!("{host}:443");

        let addrs = tokio::time::timeout(self.timeout, tokio::net::lookup_host(query))
            .await
            .map_err(|_| Error::Resolve {
                host: host.to_string(),
                reason: "resolution timed out".to_string(),
            })?
            .map_err(|e| Error::Resolve {
                host: host.to_string(),
                reason: e.to_string(),
            })?;

        let v4: Vec<Ipv4Addr> = addrs
            .filter_map(|sock| match sock.ip() {
                IpAddr::V4(addr) => Some(addr),
                IpAddr::V6(_) => None,
            })
            .collect();

        if v4.is_empty() {
            return Err(Error::Resolve {
                host: host.to_string(),
                reason: "no A records".to_string(),
            });
        }

        Ok(v4)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_resolve_localhost_yields_ipv4_only() {
        let resolver = SystemResolver::new(Duration::from_secs(2));
        let addrs = resolver.resolve("localhost").await.unwrap();
        assert!(addrs.contains(&Ipv4Addr::LOCALHOST));
    }

    #[tokio::test]
    async fn test_resolve_failure_is_an_error() {
        let resolver = SystemResolver::new(Duration::from_secs(2));
        let result = resolver.resolve("cordon-invalid.invalid").await;
        assert!(matches!(result, Err(Error::Resolve { .. })));
    }
}
