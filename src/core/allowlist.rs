//! Allow-list entries and the address collection
//!
//! The allow-list is assembled from three sources: the remote range
//! metadata, the resolved service domains, and the detected host network.
//! Every candidate passes strict validation before insertion and the final
//! set of ranges is aggregated into the minimal covering set before it is
//! rendered into the kernel's named set, bounding the number of
//! rule-engine entries without changing coverage.

use crate::validators;
use ipnetwork::Ipv4Network;
use sha2::{Digest, Sha256};
use std::net::Ipv4Addr;
use tracing::debug;

/// Where an allow-list entry came from.
///
/// Provenance is carried for logging and reporting only; it does not
/// affect how the entry is matched.
#[derive(Debug, Clone, Copy, PartialEq, Eq, strum::Display, strum::AsRefStr)]
pub enum EntryOrigin {
    /// Published IP range from the remote metadata document
    #[strum(serialize = "remote-range")]
    RemoteRange,
    /// Address resolved from a configured service domain
    #[strum(serialize = "resolved-domain")]
    ResolvedDomain,
    /// The /24 derived from the default gateway
    #[strum(serialize = "host-network")]
    HostNetwork,
}

/// A single validated IPv4 range with provenance.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct AllowlistEntry {
    pub net: Ipv4Network,
    pub origin: EntryOrigin,
}

impl AllowlistEntry {
    pub fn new(net: Ipv4Network, origin: EntryOrigin) -> Self {
        Self { net, origin }
    }
}

/// The mutable set backing the firewall's allow-list match.
///
/// Exactly one instance exists per run. It is created empty in the
/// collecting phase, populated only during that phase, rendered read-only
/// into set elements by the policy generator, and destroyed by the next
/// run's flush (or by rollback).
#[derive(Debug, Clone)]
pub struct AddressCollection {
    name: &'static str,
    entries: Vec<AllowlistEntry>,
}

impl AddressCollection {
    pub fn new(name: &'static str) -> Self {
        Self {
            name,
            entries: Vec::new(),
        }
    }

    pub fn name(&self) -> &'static str {
        self.name
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn entries(&self) -> &[AllowlistEntry] {
        &self.entries
    }

    /// Inserts a candidate CIDR string after strict validation.
    ///
    /// The stored network is canonicalized to its network address so that
    /// `10.0.0.7/24` and `10.0.0.0/24` are the same entry.
    ///
    /// # Errors
    ///
    /// Returns the validation failure for a non-conforming candidate; the
    /// caller decides whether that is a warning (remote data) or fatal
    /// (host network).
    pub fn insert_cidr(&mut self, candidate: &str, origin: EntryOrigin) -> Result<(), String> {
        let net = validators::validate_ipv4_cidr(candidate)?;
        self.insert_network(net, origin);
        Ok(())
    }

    /// Inserts an already-validated address as a /32.
    pub fn insert_addr(&mut self, addr: Ipv4Addr, origin: EntryOrigin) {
        if let Some(net) = canonical(addr, 32) {
            self.insert_network(net, origin);
        }
    }

    /// Inserts an already-validated network, canonicalized. Exact
    /// duplicates are dropped regardless of origin; the first source wins.
    pub fn insert_network(&mut self, net: Ipv4Network, origin: EntryOrigin) {
        if let Some(net) = canonical(net.ip(), net.prefix()) {
            if self.entries.iter().any(|entry| entry.net == net) {
                return;
            }
            debug!("allow-list += {} ({})", net, origin);
            self.entries.push(AllowlistEntry::new(net, origin));
        }
    }

    /// Number of entries contributed by a given source.
    pub fn count_by_origin(&self, origin: EntryOrigin) -> usize {
        self.entries.iter().filter(|e| e.origin == origin).count()
    }

    /// The minimal covering set of this collection's ranges.
    pub fn aggregated(&self) -> Vec<Ipv4Network> {
        aggregate(&self.entries.iter().map(|e| e.net).collect::<Vec<_>>())
    }

    /// SHA-256 fingerprint of the aggregated ranges.
    ///
    /// Stable across runs that produce the same allow-list, which makes
    /// repeated bootstraps on an unchanged environment observably
    /// identical in the audit log.
    pub fn fingerprint(&self) -> String {
        let mut hasher = Sha256::new();
        for net in self.aggregated() {
            hasher.update(net.to_string().as_bytes());
            hasher.update(b"\n");
        }
        format!("{:x}", hasher.finalize())
    }
}

fn prefix_mask(prefix: u8) -> u32 {
    if prefix == 0 {
        0
    } else {
        u32::MAX << (32 - u32::from(prefix))
    }
}

fn canonical(addr: Ipv4Addr, prefix: u8) -> Option<Ipv4Network> {
    let base = u32::from(addr) & prefix_mask(prefix);
    Ipv4Network::new(Ipv4Addr::from(base), prefix).ok()
}

/// Merges overlapping and adjacent ranges into the minimal covering set.
///
/// Semantically equivalent to the input: no address is lost and none is
/// gained. Duplicates and contained blocks collapse first; aligned sibling
/// pairs then merge into their parent until a fixpoint is reached.
pub fn aggregate(nets: &[Ipv4Network]) -> Vec<Ipv4Network> {
    // Canonical (base, prefix) spans, sorted so a covering block always
    // precedes the blocks it contains.
    let mut spans: Vec<(u32, u8)> = nets
        .iter()
        .map(|n| (u32::from(n.ip()) & prefix_mask(n.prefix()), n.prefix()))
        .collect();
    spans.sort_unstable();

    // Drop duplicates and blocks covered by an earlier, wider block.
    let mut kept: Vec<(u32, u8)> = Vec::with_capacity(spans.len());
    for (base, prefix) in spans {
        if let Some(&(kept_base, kept_prefix)) = kept.last()
            && kept_prefix <= prefix
            && (base & prefix_mask(kept_prefix)) == kept_base
        {
            continue;
        }
        kept.push((base, prefix));
    }

    // Merge aligned sibling pairs into their parent. A merge can enable
    // another one level up, so repeat until nothing changes.
    loop {
        let mut merged: Vec<(u32, u8)> = Vec::with_capacity(kept.len());
        let mut changed = false;
        let mut i = 0;
        while i < kept.len() {
            if i + 1 < kept.len() {
                let (a_base, a_prefix) = kept[i];
                let (b_base, b_prefix) = kept[i + 1];
                if a_prefix == b_prefix
                    && a_prefix > 0
                    && (a_base & prefix_mask(a_prefix - 1)) == a_base
                    && b_base == (a_base | (1u32 << (32 - u32::from(a_prefix))))
                {
                    merged.push((a_base, a_prefix - 1));
                    changed = true;
                    i += 2;
                    continue;
                }
            }
            merged.push(kept[i]);
            i += 1;
        }
        kept = merged;
        if !changed {
            break;
        }
    }

    kept.into_iter()
        .filter_map(|(base, prefix)| Ipv4Network::new(Ipv4Addr::from(base), prefix).ok())
        .collect()
}
