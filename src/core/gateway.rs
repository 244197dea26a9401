//! Default-gateway detection and host-network derivation
//!
//! The host's /24 must stay reachable after lockdown or the operator is
//! stranded outside their own sandbox, so this path has no degraded mode:
//! a missing default route or a derivation that fails CIDR validation is
//! fatal and triggers rollback.

use crate::core::error::{Error, Result};
use crate::validators;
use ipnetwork::Ipv4Network;
use serde_json::Value;
use std::net::Ipv4Addr;
use tracing::info;

/// Seam over default-route discovery.
pub trait GatewayDetector {
    /// External binaries this detector needs on PATH; checked during
    /// preflight, before any mutation.
    fn required_tools(&self) -> Vec<&'static str> {
        Vec::new()
    }

    /// Returns the default gateway's IPv4 address.
    async fn default_gateway(&self) -> Result<Ipv4Addr>;
}

/// Production detector reading iproute2's JSON output.
#[derive(Debug, Clone, Copy, Default)]
pub struct IpRouteDetector;

impl IpRouteDetector {
    pub fn new() -> Self {
        Self
    }
}

impl GatewayDetector for IpRouteDetector {
    fn required_tools(&self) -> Vec<&'static str> {
        vec!["ip"]
    }

    async fn default_gateway(&self) -> Result<Ipv4Addr> {
        let output = tokio::process::Command::new("ip")
            .args(["-j", "-4", "route", "show", "default"])
            .output()
            .await
            .map_err(|e| Error::GatewayDetection(format!("failed to run ip: {e}")))?;

        if !output.status.success() {
            let stderr = String::from_utf8_lossy(&output.stderr);
            return Err(Error::GatewayDetection(format!(
                "ip route exited with {:?}: {}",
                output.status.code(),
                stderr.trim()
            )));
        }

        let routes: Value = serde_json::from_slice(&output.stdout)
            .map_err(|e| Error::GatewayDetection(format!("unparseable route listing: {e}")))?;

        let gateway = routes
            .as_array()
            .and_then(|list| list.first())
            .and_then(|route| route.get("gateway"))
            .and_then(Value::as_str)
            .ok_or_else(|| {
                Error::GatewayDetection("no default route with a gateway found".to_string())
            })?;

        validators::validate_ipv4(gateway).map_err(Error::GatewayDetection)
    }
}

/// Derives the host network from the gateway address: last octet zeroed,
/// /24 mask applied.
///
/// The derived string is re-validated as a CIDR before use; a malformed
/// derivation here is fatal, unlike a single bad allow-list entry.
pub fn derive_host_network(gateway: Ipv4Addr) -> Result<Ipv4Network> {
    let octets = gateway.octets();
    let candidate = format!("{}.{}.{}.0/24", octets[0], octets[1], octets[2]);

    let network = validators::validate_ipv4_cidr(&candidate).map_err(Error::GatewayDetection)?;
    info!("Host network derived from gateway {gateway}: {network}");
    Ok(network)
}
