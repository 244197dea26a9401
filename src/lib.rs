//! cordon - egress lockdown bootstrap for sandboxed coding agents
//!
//! Converts an unrestricted network into a default-deny egress-filtered one,
//! permitting outbound traffic only to a dynamically computed allow-list.
//!
//! # Architecture
//!
//! - [`core`] - Phase orchestration, allow-list construction, policy
//!   generation, and nftables interaction
//! - [`audit`] - Security audit logging for all privileged operations
//! - [`validators`] - Strict IPv4/CIDR/hostname validation
//! - [`config`] - Bootstrap configuration with production defaults
//! - [`elevation`] - Privilege escalation for the `nft` binary
//! - [`utils`] - XDG directories and single-instance locking
//!
//! # Safety Features
//!
//! - Pre-mutation preflight (tools, credential, metadata shape) so fatal
//!   conditions abort before the first rule flush
//! - A policy transaction armed from the first mutating phase: any fatal
//!   error downstream resets the host to a permissive ruleset
//! - Container DNS NAT rules captured before the flush and replayed after
//! - Live verification probes before the run is declared successful
//! - SHA-256 allow-list fingerprints for idempotence checks

// Allow pedantic clippy warnings that are not worth fixing for this codebase
#![allow(clippy::must_use_candidate)]
#![allow(clippy::return_self_not_must_use)]
#![allow(clippy::uninlined_format_args)]
#![allow(clippy::missing_errors_doc)]
// The resolver/sink seams are consumed generically, never as dyn objects
#![allow(async_fn_in_trait)]

pub mod audit;
pub mod config;
pub mod core;
pub mod elevation;
pub mod utils;
pub mod validators;

// Re-export commonly used types
pub use crate::config::BootstrapConfig;
pub use crate::core::allowlist::{AddressCollection, AllowlistEntry, EntryOrigin};
pub use crate::core::error::{Error, Result};
pub use crate::core::phase::PolicyPhase;
