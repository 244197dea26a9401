//! Bootstrap configuration
//!
//! Loaded from `config.json` in the XDG config directory (or an explicit
//! `--config` path); every field carries a production default, so a
//! missing file means a default deployment, not an error.

use crate::core::error::{Error, Result};
use serde::{Deserialize, Serialize};
use std::path::Path;
use std::time::Duration;

/// Complete bootstrap configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BootstrapConfig {
    /// Metadata endpoint publishing the service IP ranges
    #[serde(default = "default_meta_url")]
    pub meta_url: String,

    /// Environment variable holding the bearer token for the metadata
    /// fetch. The credential itself is supplied by an external
    /// authentication step; cordon only reads the variable.
    #[serde(default = "default_token_env")]
    pub token_env: String,

    /// Categories that must be present in the metadata document.
    /// Verification depends on these, so a missing one aborts the run.
    #[serde(default = "default_required_categories")]
    pub required_categories: Vec<String>,

    /// Categories consumed when present but not required
    #[serde(default)]
    pub optional_categories: Vec<String>,

    /// Service hostnames resolved into the allow-list
    #[serde(default = "default_allowed_domains")]
    pub allowed_domains: Vec<String>,

    /// The container runtime's embedded resolver address whose NAT rules
    /// must survive the flush
    #[serde(default = "default_docker_dns_addr")]
    pub docker_dns_addr: String,

    /// Verification control target guaranteed NOT to be allow-listed
    #[serde(default = "default_blocked_probe")]
    pub blocked_probe: String,

    /// Verification target guaranteed to be allow-listed
    #[serde(default = "default_required_probe")]
    pub required_probe: String,

    /// Best-effort verification target; failure only warns
    #[serde(default = "default_optional_probe")]
    pub optional_probe: Option<String>,

    /// Timeout for the metadata fetch (seconds)
    #[serde(default = "default_fetch_timeout")]
    pub fetch_timeout_secs: u64,

    /// Timeout per domain resolution (seconds)
    #[serde(default = "default_resolve_timeout")]
    pub resolve_timeout_secs: u64,

    /// Timeout per verification probe (seconds)
    #[serde(default = "default_probe_timeout")]
    pub probe_timeout_secs: u64,
}

fn default_meta_url() -> String {
    "https://api.github.com/meta".to_string()
}

fn default_token_env() -> String {
    "GITHUB_TOKEN".to_string()
}

fn default_required_categories() -> Vec<String> {
    ["web", "api", "git"].map(String::from).to_vec()
}

fn default_allowed_domains() -> Vec<String> {
    [
        "registry.npmjs.org",
        "index.crates.io",
        "static.crates.io",
        "pypi.org",
        "files.pythonhosted.org",
        "objects.githubusercontent.com",
        "raw.githubusercontent.com",
    ]
    .map(String::from)
    .to_vec()
}

fn default_docker_dns_addr() -> String {
    "127.0.0.11".to_string()
}

fn default_blocked_probe() -> String {
    "example.com:443".to_string()
}

fn default_required_probe() -> String {
    "api.github.com:443".to_string()
}

fn default_optional_probe() -> Option<String> {
    Some("registry.npmjs.org:443".to_string())
}

fn default_fetch_timeout() -> u64 {
    10
}

fn default_resolve_timeout() -> u64 {
    5
}

fn default_probe_timeout() -> u64 {
    5
}

impl Default for BootstrapConfig {
    fn default() -> Self {
        Self {
            meta_url: default_meta_url(),
            token_env: default_token_env(),
            required_categories: default_required_categories(),
            optional_categories: Vec::new(),
            allowed_domains: default_allowed_domains(),
            docker_dns_addr: default_docker_dns_addr(),
            blocked_probe: default_blocked_probe(),
            required_probe: default_required_probe(),
            optional_probe: default_optional_probe(),
            fetch_timeout_secs: default_fetch_timeout(),
            resolve_timeout_secs: default_resolve_timeout(),
            probe_timeout_secs: default_probe_timeout(),
        }
    }
}

impl BootstrapConfig {
    pub fn fetch_timeout(&self) -> Duration {
        Duration::from_secs(self.fetch_timeout_secs)
    }

    pub fn resolve_timeout(&self) -> Duration {
        Duration::from_secs(self.resolve_timeout_secs)
    }

    pub fn probe_timeout(&self) -> Duration {
        Duration::from_secs(self.probe_timeout_secs)
    }

    /// Sanity-checks the configured values before they reach the phases.
    ///
    /// # Errors
    ///
    /// Returns [`Error::Internal`] naming the first bad field.
    pub fn validate(&self) -> Result<()> {
        for domain in &self.allowed_domains {
            crate::validators::validate_hostname(domain)
                .map_err(|e| Error::Internal(format!("allowed_domains: {e}")))?;
        }
        crate::validators::validate_ipv4(&self.docker_dns_addr)
            .map_err(|e| Error::Internal(format!("docker_dns_addr: {e}")))?;
        crate::validators::validate_probe_target(&self.blocked_probe)
            .map_err(|e| Error::Internal(format!("blocked_probe: {e}")))?;
        crate::validators::validate_probe_target(&self.required_probe)
            .map_err(|e| Error::Internal(format!("required_probe: {e}")))?;
        if let Some(optional) = &self.optional_probe {
            crate::validators::validate_probe_target(optional)
                .map_err(|e| Error::Internal(format!("optional_probe: {e}")))?;
        }
        if self.required_categories.is_empty() {
            return Err(Error::Internal(
                "required_categories cannot be empty".to_string(),
            ));
        }
        Ok(())
    }
}

/// Loads the configuration.
///
/// An explicit path must exist and parse; the default location is
/// optional and silently falls back to defaults when absent.
///
/// # Errors
///
/// Returns `Err` for an unreadable or unparseable explicit path, or for
/// a default-location file that exists but does not parse.
pub async fn load_config(path: Option<&Path>) -> Result<BootstrapConfig> {
    let (path, required) = match path {
        Some(explicit) => (explicit.to_path_buf(), true),
        None => {
            let Some(mut default_path) = crate::utils::get_config_dir() else {
                return Ok(BootstrapConfig::default());
            };
            default_path.push("config.json");
            (default_path, false)
        }
    };

    match tokio::fs::read_to_string(&path).await {
        Ok(json) => {
            let config: BootstrapConfig = serde_json::from_str(&json)?;
            config.validate()?;
            Ok(config)
        }
        Err(e) if !required && e.kind() == std::io::ErrorKind::NotFound => {
            Ok(BootstrapConfig::default())
        }
        Err(e) => Err(Error::Internal(format!(
            "cannot read config {}: {e}",
            path.display()
        ))),
    }
}
