//! The sequential phase orchestrator and rollback transaction
//!
//! Control flow is strictly sequential: preflight (read-only) → flush →
//! restore container DNS → collect the allow-list over the permissive
//! network → load the collection → detect the host network → install the
//! default-deny policy → verify. The policy transaction is armed
//! immediately before the flush and disarmed only after verification
//! succeeds; on any fatal error in between, its compensation resets the
//! host to a permissive ruleset. The process therefore never terminates
//! half-locked: either the original policy (pre-mutation abort), the
//! permissive ruleset (rollback), or the verified lockdown.

use crate::audit;
use crate::config::BootstrapConfig;
use crate::core::allowlist::{AddressCollection, AllowlistEntry, EntryOrigin};
use crate::core::docker_dns::{self, PreservedDnsRules};
use crate::core::domains::DomainResolver;
use crate::core::error::{Error, Result};
use crate::core::gateway::{self, GatewayDetector};
use crate::core::meta::{self, RangeSource};
use crate::core::nft::PolicySink;
use crate::core::phase::PolicyPhase;
use crate::core::policy;
use crate::core::verify::{self, VerifySpec};
use crate::validators;
use ipnetwork::Ipv4Network;
use serde_json::json;
use tracing::{debug, error, info, warn};
use uuid::Uuid;

/// Summary of a successful bootstrap.
#[derive(Debug, Clone)]
pub struct BootstrapReport {
    pub run_id: Uuid,
    pub remote_entries: usize,
    pub domain_entries: usize,
    pub aggregated_ranges: usize,
    pub fingerprint: String,
    pub host_network: Ipv4Network,
}

/// The failure-triggered compensating action (scoped acquisition).
///
/// Armed from the first mutating phase until an explicit [`commit`].
/// Rollback is one idempotent reset-to-permissive - a `flush ruleset`
/// that also destroys the address collection - followed by a best-effort
/// replay of the preserved container DNS rules. It is safe to run however
/// little state was actually mutated.
///
/// [`commit`]: PolicyTransaction::commit
pub struct PolicyTransaction<'a, S: PolicySink> {
    sink: &'a S,
    preserved_dns: PreservedDnsRules,
    run_id: Uuid,
    armed: bool,
}

impl<'a, S: PolicySink> PolicyTransaction<'a, S> {
    pub fn begin(sink: &'a S, preserved_dns: PreservedDnsRules, run_id: Uuid) -> Self {
        Self {
            sink,
            preserved_dns,
            run_id,
            armed: true,
        }
    }

    /// Resets the host to an open (not locked-out, not half-configured)
    /// state. Idempotent; a second call is a no-op.
    pub async fn rollback(&mut self) {
        if !self.armed {
            return;
        }
        self.armed = false;

        info!("Rolling back: resetting packet filter to permissive accept");
        match self.sink.flush_ruleset().await {
            Ok(()) => {
                docker_dns::restore(self.sink, &self.preserved_dns).await;
                audit::log_rollback(self.run_id, true, None).await;
                info!("Rollback complete; host network policy is open");
            }
            Err(e) => {
                audit::log_rollback(self.run_id, false, Some(e.to_string())).await;
                error!("Rollback flush failed; manual `nft flush ruleset` may be required: {e}");
            }
        }
    }

    /// Disarms the transaction after a verified lockdown.
    pub fn commit(mut self) {
        self.armed = false;
    }
}

impl<S: PolicySink> Drop for PolicyTransaction<'_, S> {
    fn drop(&mut self) {
        // Rollback is async and cannot run here; reaching this armed
        // means a code path returned without rollback() or commit().
        if self.armed {
            error!("policy transaction dropped while armed - rollback was skipped");
        }
    }
}

/// The phase pipeline, generic over its four seams so the state machine
/// is testable without real network or kernel access.
pub struct Bootstrap<'a, S, R, D, G> {
    config: &'a BootstrapConfig,
    sink: &'a S,
    ranges: &'a R,
    domains: &'a D,
    gateway: &'a G,
    run_id: Uuid,
}

impl<'a, S, R, D, G> Bootstrap<'a, S, R, D, G>
where
    S: PolicySink,
    R: RangeSource,
    D: DomainResolver,
    G: GatewayDetector,
{
    pub fn new(
        config: &'a BootstrapConfig,
        sink: &'a S,
        ranges: &'a R,
        domains: &'a D,
        gateway: &'a G,
    ) -> Self {
        Self {
            config,
            sink,
            ranges,
            domains,
            gateway,
            run_id: Uuid::new_v4(),
        }
    }

    pub fn run_id(&self) -> Uuid {
        self.run_id
    }

    /// Runs the full bootstrap.
    ///
    /// # Errors
    ///
    /// Any fatal condition from preflight onward; if mutation had begun,
    /// the host has been reset to permissive before this returns.
    pub async fn run(&self) -> Result<BootstrapReport> {
        info!("Bootstrap run {} starting", self.run_id);

        // Everything up to here is read-only: a failure aborts while the
        // host still has its original policy.
        let raw_ranges = match self.preflight().await {
            Ok(ranges) => {
                audit::log_preflight(self.run_id, true, None).await;
                ranges
            }
            Err(e) => {
                audit::log_preflight(self.run_id, false, Some(e.to_string())).await;
                return Err(e);
            }
        };

        // Captured before any destructive operation; captured late, the
        // container's resolver wiring would be unrecoverable.
        let preserved = docker_dns::capture(self.sink, &self.config.docker_dns_addr).await?;

        let mut txn = PolicyTransaction::begin(self.sink, preserved.clone(), self.run_id);
        match self.run_phases(&preserved, &raw_ranges).await {
            Ok(report) => {
                txn.commit();
                info!(
                    "Bootstrap run {} verified: {} range(s), fingerprint {}",
                    report.run_id, report.aggregated_ranges, report.fingerprint
                );
                Ok(report)
            }
            Err(e) => {
                error!("Bootstrap failed, compensating: {e}");
                txn.rollback().await;
                Err(e)
            }
        }
    }

    /// Pre-mutation checks: required tools present, then the metadata
    /// document fetched and shape-validated. A rejected credential or a
    /// gutted document aborts before any rule flush.
    async fn preflight(&self) -> Result<Vec<String>> {
        for tool in self
            .sink
            .required_tools()
            .into_iter()
            .chain(self.gateway.required_tools())
        {
            if !crate::elevation::binary_exists(tool) {
                return Err(Error::MissingTool(tool));
            }
        }

        let document = self.ranges.fetch().await?;
        let ranges = meta::parse_ranges(
            &document,
            &self.config.required_categories,
            &self.config.optional_categories,
        )?;
        info!("Metadata preflight passed: {} candidate range(s)", ranges.len());
        Ok(ranges)
    }

    async fn run_phases(
        &self,
        preserved: &PreservedDnsRules,
        raw_ranges: &[String],
    ) -> Result<BootstrapReport> {
        // The host briefly has no packet filtering at all here; the
        // window is bounded by the phases that follow and never survives
        // a successful run.
        self.sink.flush_ruleset().await?;
        self.phase_done(PolicyPhase::Flushed, json!({})).await;

        docker_dns::restore(self.sink, preserved).await;
        self.phase_done(
            PolicyPhase::DnsRestored,
            json!({ "preserved_rules": preserved.rules.len() }),
        )
        .await;

        // Collecting runs over the permissive (empty) ruleset
        let collection = build_collection(self.config, self.domains, raw_ranges).await;
        self.phase_done(
            PolicyPhase::Collecting,
            json!({
                "remote": collection.count_by_origin(EntryOrigin::RemoteRange),
                "resolved": collection.count_by_origin(EntryOrigin::ResolvedDomain),
            }),
        )
        .await;

        let fingerprint = collection.fingerprint();
        self.sink
            .apply(&policy::collection_batch(&collection))
            .await?;
        self.phase_done(
            PolicyPhase::AllowlistReady,
            json!({ "fingerprint": fingerprint }),
        )
        .await;

        let gateway_addr = self.gateway.default_gateway().await?;
        let host_entry = AllowlistEntry::new(
            gateway::derive_host_network(gateway_addr)?,
            EntryOrigin::HostNetwork,
        );
        info!(
            "Keeping {} reachable ({})",
            host_entry.net, host_entry.origin
        );
        self.phase_done(
            PolicyPhase::HostDetected,
            json!({ "host_network": host_entry.net.to_string() }),
        )
        .await;

        self.sink
            .apply(&policy::lockdown_batch(host_entry.net))
            .await?;
        self.phase_done(PolicyPhase::LockedDown, json!({})).await;

        let spec = VerifySpec {
            blocked_target: self.config.blocked_probe.clone(),
            required_target: self.config.required_probe.clone(),
            optional_target: self.config.optional_probe.clone(),
            timeout: self.config.probe_timeout(),
        };
        match verify::verify_policy(&spec).await {
            Ok(()) => audit::log_verify(self.run_id, true, None).await,
            Err(e) => {
                audit::log_verify(self.run_id, false, Some(e.to_string())).await;
                return Err(e);
            }
        }

        Ok(BootstrapReport {
            run_id: self.run_id,
            remote_entries: collection.count_by_origin(EntryOrigin::RemoteRange),
            domain_entries: collection.count_by_origin(EntryOrigin::ResolvedDomain),
            aggregated_ranges: collection.aggregated().len(),
            fingerprint,
            host_network: host_entry.net,
        })
    }

    async fn phase_done(&self, phase: PolicyPhase, details: serde_json::Value) {
        info!("Phase complete: {phase}");
        audit::log_phase(self.run_id, phase, true, details, None).await;
    }
}

/// Populates the address collection from both sub-resolvers.
///
/// Remote ranges: IPv6 entries are dropped (IPv4-only policy) and a
/// malformed entry is skipped with a warning - the remainder of the
/// trusted range list stays usable. Domains: an unresolvable domain is
/// skipped with a warning; that service becomes unreachable, the
/// bootstrap does not fail.
pub async fn build_collection<D: DomainResolver>(
    config: &BootstrapConfig,
    domains: &D,
    raw_ranges: &[String],
) -> AddressCollection {
    let mut collection = AddressCollection::new(policy::ALLOW_SET);

    let mut dropped_v6 = 0usize;
    for candidate in raw_ranges {
        if validators::is_ipv6_entry(candidate) {
            dropped_v6 += 1;
            continue;
        }
        if let Err(reason) = collection.insert_cidr(candidate, EntryOrigin::RemoteRange) {
            warn!("Skipping malformed remote range: {reason}");
        }
    }
    if dropped_v6 > 0 {
        debug!("Dropped {dropped_v6} IPv6 range(s) from the metadata document");
    }

    for host in &config.allowed_domains {
        match domains.resolve(host).await {
            Ok(addrs) => {
                for addr in &addrs {
                    collection.insert_addr(*addr, EntryOrigin::ResolvedDomain);
                }
                info!("Resolved {host} to {} address(es)", addrs.len());
            }
            Err(e) => warn!("Skipping unresolvable domain: {e}"),
        }
    }

    collection
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::Value;
    use std::sync::Mutex;

    struct FakeSink {
        applied: Mutex<Vec<Value>>,
    }

    impl FakeSink {
        fn new() -> Self {
            Self {
                applied: Mutex::new(Vec::new()),
            }
        }
    }

    impl PolicySink for FakeSink {
        async fn apply(&self, payload: &Value) -> Result<()> {
            self.applied.lock().unwrap().push(payload.clone());
            Ok(())
        }

        async fn list_ruleset(&self) -> Result<Value> {
            Ok(json!({ "nftables": [] }))
        }
    }

    #[tokio::test]
    async fn test_transaction_rollback_flushes() {
        let sink = FakeSink::new();
        let mut txn = PolicyTransaction::begin(&sink, PreservedDnsRules::default(), Uuid::nil());

        txn.rollback().await;

        let applied = sink.applied.lock().unwrap();
        assert_eq!(applied.len(), 1);
        assert!(applied[0]["nftables"][0]["flush"].get("ruleset").is_some());
    }

    #[tokio::test]
    async fn test_transaction_rollback_is_idempotent() {
        let sink = FakeSink::new();
        let mut txn = PolicyTransaction::begin(&sink, PreservedDnsRules::default(), Uuid::nil());

        txn.rollback().await;
        txn.rollback().await;

        assert_eq!(sink.applied.lock().unwrap().len(), 1);
    }

    #[tokio::test]
    async fn test_transaction_commit_disarms() {
        let sink = FakeSink::new();
        let txn = PolicyTransaction::begin(&sink, PreservedDnsRules::default(), Uuid::nil());

        txn.commit();

        assert!(sink.applied.lock().unwrap().is_empty());
    }
}
