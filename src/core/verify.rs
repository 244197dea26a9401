//! Post-apply verification probes
//!
//! A lockdown that cannot prove itself is not a lockdown. Two probes must
//! both behave as predicted before the run is declared successful: a
//! connection to a control target guaranteed off the allow-list must
//! fail, and a connection to a target guaranteed on it must succeed -
//! exercising DNS, the policy table, and the set match end to end. An
//! optional third probe to a best-effort service only warns.

use crate::core::error::{Error, Result};
use std::time::Duration;
use tracing::{info, warn};

/// Result of a single connection probe.
#[derive(Debug, Clone)]
pub struct ProbeOutcome {
    pub target: String,
    pub connected: bool,
    pub detail: String,
}

/// Attempts a TCP connection to `target` under a timeout.
///
/// A timeout is treated identically to an explicit connection failure.
pub async fn probe(target: &str, timeout: Duration) -> ProbeOutcome {
    match tokio::time::timeout(timeout, tokio::net::TcpStream::connect(target)).await {
        Ok(Ok(_stream)) => ProbeOutcome {
            target: target.to_string(),
            connected: true,
            detail: "connection established".to_string(),
        },
        Ok(Err(e)) => ProbeOutcome {
            target: target.to_string(),
            connected: false,
            detail: e.to_string(),
        },
        Err(_) => ProbeOutcome {
            target: target.to_string(),
            connected: false,
            detail: format!("timed out after {}s", timeout.as_secs()),
        },
    }
}

/// Probe targets for one verification pass.
#[derive(Debug, Clone)]
pub struct VerifySpec {
    /// Must be unreachable (proves deny-by-default is active)
    pub blocked_target: String,
    /// Must be reachable (proves the allow-list path end to end)
    pub required_target: String,
    /// Best-effort; warns on failure without aborting
    pub optional_target: Option<String>,
    pub timeout: Duration,
}

/// Runs the verification pass.
///
/// # Errors
///
/// Returns [`Error::VerificationFailed`] when the blocked control target
/// is reachable or the required target is not.
pub async fn verify_policy(spec: &VerifySpec) -> Result<()> {
    let blocked = probe(&spec.blocked_target, spec.timeout).await;
    if blocked.connected {
        return Err(Error::VerificationFailed(format!(
            "control target {} was reachable; deny-by-default is not enforcing",
            blocked.target
        )));
    }
    info!(
        "Control probe to {} blocked as expected ({})",
        blocked.target, blocked.detail
    );

    let required = probe(&spec.required_target, spec.timeout).await;
    if !required.connected {
        return Err(Error::VerificationFailed(format!(
            "required target {} was unreachable ({})",
            required.target, required.detail
        )));
    }
    info!("Required probe to {} succeeded", required.target);

    if let Some(optional_target) = &spec.optional_target {
        let optional = probe(optional_target, spec.timeout).await;
        if optional.connected {
            info!("Optional probe to {} succeeded", optional.target);
        } else {
            warn!(
                "Optional probe to {} failed ({}), continuing",
                optional.target, optional.detail
            );
        }
    }

    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio::net::TcpListener;

    async fn local_listener() -> (TcpListener, String) {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap().to_string();
        (listener, addr)
    }

    #[tokio::test]
    async fn test_probe_reaches_local_listener() {
        let (_listener, addr) = local_listener().await;
        let outcome = probe(&addr, Duration::from_secs(2)).await;
        assert!(outcome.connected);
    }

    #[tokio::test]
    async fn test_probe_fails_on_closed_port() {
        // Port 1 on loopback is essentially never listening
        let outcome = probe("127.0.0.1:1", Duration::from_secs(2)).await;
        assert!(!outcome.connected);
    }

    #[tokio::test]
    async fn test_verify_passes_when_probes_behave() {
        let (_listener, addr) = local_listener().await;
        let spec = VerifySpec {
            blocked_target: "127.0.0.1:1".to_string(),
            required_target: addr,
            optional_target: None,
            timeout: Duration::from_secs(2),
        };
        assert!(verify_policy(&spec).await.is_ok());
    }

    #[tokio::test]
    async fn test_verify_fails_when_control_target_reachable() {
        let (_listener, addr) = local_listener().await;
        let spec = VerifySpec {
            blocked_target: addr.clone(),
            required_target: addr,
            optional_target: None,
            timeout: Duration::from_secs(2),
        };
        let err = verify_policy(&spec).await.unwrap_err();
        assert!(matches!(err, Error::VerificationFailed(_)));
        assert!(err.to_string().contains("deny-by-default"));
    }

    #[tokio::test]
    async fn test_verify_fails_when_required_target_unreachable() {
        let spec = VerifySpec {
            blocked_target: "127.0.0.1:1".to_string(),
            required_target: "127.0.0.1:1".to_string(),
            optional_target: None,
            timeout: Duration::from_secs(2),
        };
        let err = verify_policy(&spec).await.unwrap_err();
        assert!(err.to_string().contains("unreachable"));
    }

    #[tokio::test]
    async fn test_verify_optional_failure_is_not_fatal() {
        let (_listener, addr) = local_listener().await;
        let spec = VerifySpec {
            blocked_target: "127.0.0.1:1".to_string(),
            required_target: addr,
            optional_target: Some("127.0.0.1:1".to_string()),
            timeout: Duration::from_secs(2),
        };
        assert!(verify_policy(&spec).await.is_ok());
    }
}
