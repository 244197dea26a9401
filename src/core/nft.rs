//! The policy sink seam and the real nftables backend
//!
//! The kernel's packet-filter tables are host-global mutable state, so the
//! bootstrap never calls `nft` directly: every mutation goes through the
//! [`PolicySink`] trait. Production uses [`NftSink`], which pipes JSON
//! batches to an elevated `nft --json -f -`; tests substitute a recording
//! fake and never touch the kernel.

use crate::core::error::{Error, Result};
use serde_json::{Value, json};
use tracing::{error, info};

/// Abstraction over the host's packet-filter tables.
///
/// All methods take `&self`; the sink itself is stateless and the kernel
/// holds the state.
pub trait PolicySink {
    /// External binaries this sink needs on PATH; checked during
    /// preflight, before any mutation.
    fn required_tools(&self) -> Vec<&'static str> {
        Vec::new()
    }

    /// Submits one JSON batch atomically.
    async fn apply(&self, payload: &Value) -> Result<()>;

    /// Returns the live ruleset as JSON.
    async fn list_ruleset(&self) -> Result<Value>;

    /// Clears every table, chain, and named set.
    ///
    /// With no tables left, the kernel accepts everything: this is both
    /// the flush phase and the idempotent reset-to-permissive action. A
    /// collection that does not exist is naturally a no-op, not an error.
    async fn flush_ruleset(&self) -> Result<()> {
        self.apply(&flush_batch()).await
    }
}

/// The batch that wipes all packet filtering.
pub fn flush_batch() -> Value {
    json!({ "nftables": [ { "flush": { "ruleset": null } } ] })
}

/// Production [`PolicySink`] backed by the `nft` binary.
#[derive(Debug, Clone, Copy, Default)]
pub struct NftSink;

impl NftSink {
    pub fn new() -> Self {
        Self
    }

    async fn run_with_stdin(&self, args: &[&str], input: &str) -> Result<Vec<u8>> {
        let mut child = crate::elevation::create_elevated_nft_command(args)
            .map_err(|e| Error::Elevation(e.to_string()))?
            .stdin(std::process::Stdio::piped())
            .stdout(std::process::Stdio::piped())
            .stderr(std::process::Stdio::piped())
            .spawn()
            .map_err(|e| {
                error!("Failed to spawn elevated nft: {e}");
                Error::Internal(format!("failed to spawn nft: {e}"))
            })?;

        if let Some(mut stdin) = child.stdin.take() {
            use tokio::io::AsyncWriteExt;
            stdin.write_all(input.as_bytes()).await?;
        }

        let output = child.wait_with_output().await?;

        if output.status.success() {
            Ok(output.stdout)
        } else {
            let stderr = String::from_utf8_lossy(&output.stderr).to_string();
            error!("nft invocation failed: {stderr}");
            Err(Error::Nftables {
                message: stderr.clone(),
                stderr: Some(stderr),
                exit_code: output.status.code(),
            })
        }
    }
}

impl PolicySink for NftSink {
    fn required_tools(&self) -> Vec<&'static str> {
        // With the mock override active the real binary is not involved
        if std::env::var_os("CORDON_NFT_COMMAND").is_some() {
            Vec::new()
        } else {
            vec!["nft"]
        }
    }

    async fn apply(&self, payload: &Value) -> Result<()> {
        let json_string = serde_json::to_string(payload)?;
        self.run_with_stdin(&["--json", "-f", "-"], &json_string)
            .await?;
        Ok(())
    }

    async fn list_ruleset(&self) -> Result<Value> {
        info!("Listing live ruleset via nft --json");
        let stdout = self
            .run_with_stdin(&["--json", "list", "ruleset"], "")
            .await?;
        serde_json::from_slice(&stdout).map_err(|e| {
            error!("Failed to parse ruleset listing: {e}");
            Error::Internal(format!("failed to parse nft ruleset listing: {e}"))
        })
    }
}
