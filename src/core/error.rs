use thiserror::Error;

/// Core error types for cordon
///
/// Every fatal condition has its own variant so each one renders an
/// individually identifiable line in the log stream. Recoverable
/// conditions (a single malformed range, an unresolvable domain, a DNS
/// replay failure) are warned about at the call site and never become
/// error values.
#[derive(Debug, Error)]
pub enum Error {
    /// I/O operation failed
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// JSON serialization/deserialization failed
    #[error("JSON error: {0}")]
    Serialization(#[from] serde_json::Error),

    /// A required external tool is not installed
    #[error("required tool '{0}' not found in PATH")]
    MissingTool(&'static str),

    /// The credential environment variable is absent or empty
    #[error("credential missing: environment variable '{0}' is not set")]
    MissingCredential(String),

    /// The metadata endpoint could not be fetched or returned garbage
    #[error("metadata fetch failed: {0}")]
    MetaFetch(String),

    /// The metadata endpoint answered with an error envelope
    #[error("metadata endpoint rejected the request: {0}")]
    MetaRejected(String),

    /// The metadata document lacks categories this deployment depends on
    #[error("metadata response is missing required categories {missing:?} (present keys: {present:?})")]
    MetaMissingCategories {
        missing: Vec<String>,
        present: Vec<String>,
    },

    /// A domain could not be resolved (recoverable at the call site)
    #[error("failed to resolve '{host}': {reason}")]
    Resolve { host: String, reason: String },

    /// Default-gateway detection or host-network derivation failed
    #[error("host network detection failed: {0}")]
    GatewayDetection(String),

    /// nftables command execution failed
    #[error("nftables error: {message}")]
    Nftables {
        message: String,
        stderr: Option<String>,
        exit_code: Option<i32>,
    },

    /// A required verification probe gave an unexpected result
    #[error("verification failed: {0}")]
    VerificationFailed(String),

    /// Another bootstrap invocation holds the instance lock
    #[error("another instance is already running (pid {0})")]
    AlreadyRunning(i32),

    /// Privilege escalation failed
    #[error("elevation error: {0}")]
    Elevation(String),

    /// Internal logic error
    #[error("internal error: {0}")]
    Internal(String),
}

pub type Result<T> = std::result::Result<T, Error>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_missing_categories_message_names_keys() {
        let err = Error::MetaMissingCategories {
            missing: vec!["git".to_string()],
            present: vec!["web".to_string(), "api".to_string()],
        };
        let msg = err.to_string();
        assert!(msg.contains("git"));
        assert!(msg.contains("web"));
        assert!(msg.contains("api"));
    }

    #[test]
    fn test_fatal_variants_are_distinguishable() {
        let variants = [
            Error::MissingTool("nft").to_string(),
            Error::MissingCredential("CORDON_TOKEN".into()).to_string(),
            Error::MetaFetch("timed out".into()).to_string(),
            Error::MetaRejected("Bad credentials".into()).to_string(),
            Error::GatewayDetection("no default route".into()).to_string(),
            Error::VerificationFailed("control target reachable".into()).to_string(),
        ];
        for (i, a) in variants.iter().enumerate() {
            for b in variants.iter().skip(i + 1) {
                assert_ne!(a, b);
            }
        }
    }
}
