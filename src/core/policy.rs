//! nftables JSON generation for the lockdown policy
//!
//! Two batches are produced per run. The allow-list batch creates the
//! `cordon` table and the `allowed` interval set and loads its elements;
//! the lockdown batch installs the three default-deny chains and the
//! ordered exception rules. Keeping them separate means the collection
//! exists (and is inspectable) before the policy flip, and the flip itself
//! is a single atomic `nft -f` submission.
//!
//! # Rule ordering
//!
//! Ordering is load-bearing: the `@allowed` match must precede the final
//! reject. The narrow exceptions (loopback, established) come first for
//! efficiency, though correctness only depends on allow-before-reject.

use crate::core::allowlist::AddressCollection;
use ipnetwork::Ipv4Network;
use serde_json::{Value, json};

/// The one table this tool manages. Replaced wholesale on each run.
pub const POLICY_TABLE: &str = "cordon";

/// The one named address collection, an interval set inside the table.
pub const ALLOW_SET: &str = "allowed";

/// Chain priority; matches filter-hook convention, slightly ahead of 0 so
/// the verdict lands before any coexisting distro tables.
const CHAIN_PRIORITY: i32 = -10;

/// Creates a match expression for nft meta keys (iifname, oifname, ...)
fn meta_match(key: &str, value: impl serde::Serialize) -> Value {
    json!({
        "match": {
            "left": { "meta": { "key": key } },
            "op": "==",
            "right": value
        }
    })
}

/// Creates a conntrack state match for the given states
fn ct_state_match(states: &[&str]) -> Value {
    json!({
        "match": {
            "left": { "ct": { "key": "state" } },
            "op": "==",
            "right": { "set": states }
        }
    })
}

/// Creates an IPv4 header field match (saddr/daddr)
fn ip_match(field: &str, right: impl serde::Serialize) -> Value {
    json!({
        "match": {
            "left": { "payload": { "protocol": "ip", "field": field } },
            "op": "==",
            "right": right
        }
    })
}

/// Creates a transport port match (sport/dport) for tcp or udp
fn port_match(protocol: &str, field: &str, port: u16) -> Value {
    json!({
        "match": {
            "left": { "payload": { "protocol": protocol, "field": field } },
            "op": "==",
            "right": port
        }
    })
}

/// Creates a rule add wrapper with the standard cordon table structure
fn rule_add(chain: &str, expr: &[Value], comment: &str) -> Value {
    json!({
        "add": {
            "rule": {
                "family": "ip",
                "table": POLICY_TABLE,
                "chain": chain,
                "expr": expr,
                "comment": comment
            }
        }
    })
}

/// Renders one aggregated range as a set element.
///
/// Plain addresses stay plain strings; ranges become prefix objects, the
/// form nft expects for interval sets.
fn set_element(net: &Ipv4Network) -> Value {
    if net.prefix() == 32 {
        json!(net.ip().to_string())
    } else {
        json!({
            "prefix": {
                "addr": net.ip().to_string(),
                "len": net.prefix()
            }
        })
    }
}

/// Generates the allow-list batch: table, interval set, and elements.
///
/// The collection is read-only here; aggregation happens on the way out so
/// the kernel sees the minimal covering set.
pub fn collection_batch(collection: &AddressCollection) -> Value {
    let mut ops = Vec::with_capacity(3);

    ops.push(json!({ "add": { "table": { "family": "ip", "name": POLICY_TABLE } } }));
    ops.push(json!({
        "add": {
            "set": {
                "family": "ip",
                "table": POLICY_TABLE,
                "name": ALLOW_SET,
                "type": "ipv4_addr",
                "flags": ["interval"]
            }
        }
    }));

    let elements: Vec<Value> = collection.aggregated().iter().map(set_element).collect();
    if !elements.is_empty() {
        ops.push(json!({
            "add": {
                "element": {
                    "family": "ip",
                    "table": POLICY_TABLE,
                    "name": ALLOW_SET,
                    "elem": elements
                }
            }
        }));
    }

    json!({ "nftables": ops })
}

/// Generates the lockdown batch: default-deny chains and ordered rules.
///
/// Inbound exceptions: loopback, established/related, the host network,
/// and DNS/SSH response traffic. Outbound exceptions: loopback,
/// established/related, the host network, DNS queries, SSH, and
/// destinations in the allow-list set. Everything else outbound is
/// rejected with an administratively-prohibited response so client tools
/// fail fast instead of hanging on timeouts.
pub fn lockdown_batch(host_network: Ipv4Network) -> Value {
    let mut ops: Vec<Value> = Vec::with_capacity(16);

    for chain in ["input", "forward", "output"] {
        ops.push(json!({
            "add": {
                "chain": {
                    "family": "ip",
                    "table": POLICY_TABLE,
                    "name": chain,
                    "type": "filter",
                    "hook": chain,
                    "prio": CHAIN_PRIORITY,
                    "policy": "drop"
                }
            }
        }));
    }

    let host_net = host_network.to_string();

    let input_rules = [
        (
            "allow from loopback",
            vec![meta_match("iifname", "lo"), json!({ "accept": null })],
        ),
        (
            "allow tracked connections",
            vec![
                ct_state_match(&["established", "related"]),
                json!({ "accept": null }),
            ],
        ),
        (
            "allow from host network",
            vec![ip_match("saddr", &host_net), json!({ "accept": null })],
        ),
        (
            "allow dns responses",
            vec![port_match("udp", "sport", 53), json!({ "accept": null })],
        ),
        (
            "allow ssh responses",
            vec![port_match("tcp", "sport", 22), json!({ "accept": null })],
        ),
    ];
    for (comment, expr) in input_rules {
        ops.push(rule_add("input", &expr, comment));
    }

    let output_rules = [
        (
            "allow to loopback",
            vec![meta_match("oifname", "lo"), json!({ "accept": null })],
        ),
        (
            "allow tracked connections",
            vec![
                ct_state_match(&["established", "related"]),
                json!({ "accept": null }),
            ],
        ),
        (
            "allow to host network",
            vec![ip_match("daddr", &host_net), json!({ "accept": null })],
        ),
        (
            "allow dns queries",
            vec![port_match("udp", "dport", 53), json!({ "accept": null })],
        ),
        (
            "allow ssh",
            vec![port_match("tcp", "dport", 22), json!({ "accept": null })],
        ),
        (
            "allow listed destinations",
            vec![
                ip_match("daddr", format!("@{ALLOW_SET}")),
                json!({ "accept": null }),
            ],
        ),
        (
            "reject all other egress",
            vec![json!({ "reject": { "type": "icmpx", "expr": "admin-prohibited" } })],
        ),
    ];
    for (comment, expr) in output_rules {
        ops.push(rule_add("output", &expr, comment));
    }

    json!({ "nftables": ops })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::allowlist::{AddressCollection, EntryOrigin};

    fn host_net() -> Ipv4Network {
        "192.168.1.0/24".parse().unwrap()
    }

    fn rule_comments(batch: &Value, chain: &str) -> Vec<String> {
        batch["nftables"]
            .as_array()
            .unwrap()
            .iter()
            .filter_map(|op| op.get("add").and_then(|a| a.get("rule")))
            .filter(|r| r["chain"] == chain)
            .map(|r| r["comment"].as_str().unwrap().to_string())
            .collect()
    }

    #[test]
    fn test_collection_batch_structure() {
        let mut collection = AddressCollection::new(ALLOW_SET);
        collection
            .insert_cidr("140.82.112.0/20", EntryOrigin::RemoteRange)
            .unwrap();
        collection
            .insert_cidr("9.9.9.9", EntryOrigin::ResolvedDomain)
            .unwrap();

        let batch = collection_batch(&collection);
        let ops = batch["nftables"].as_array().unwrap();

        // table + set + elements
        assert_eq!(ops.len(), 3);
        assert_eq!(ops[0]["add"]["table"]["name"], POLICY_TABLE);
        assert_eq!(ops[1]["add"]["set"]["name"], ALLOW_SET);
        assert_eq!(ops[1]["add"]["set"]["flags"][0], "interval");

        let elems = ops[2]["add"]["element"]["elem"].as_array().unwrap();
        assert_eq!(elems.len(), 2);
        // Elements come out sorted; single addresses render as strings,
        // ranges as prefix objects
        assert_eq!(elems[0], "9.9.9.9");
        assert_eq!(elems[1]["prefix"]["addr"], "140.82.112.0");
        assert_eq!(elems[1]["prefix"]["len"], 20);
    }

    #[test]
    fn test_collection_batch_empty_set_has_no_element_op() {
        let collection = AddressCollection::new(ALLOW_SET);
        let batch = collection_batch(&collection);
        let ops = batch["nftables"].as_array().unwrap();

        assert_eq!(ops.len(), 2);
        assert!(ops.iter().all(|op| op["add"].get("element").is_none()));
    }

    #[test]
    fn test_collection_batch_aggregates_elements() {
        let mut collection = AddressCollection::new(ALLOW_SET);
        collection
            .insert_cidr("10.0.0.0/24", EntryOrigin::RemoteRange)
            .unwrap();
        collection
            .insert_cidr("10.0.0.0/25", EntryOrigin::RemoteRange)
            .unwrap();

        let batch = collection_batch(&collection);
        let elems = batch["nftables"][2]["add"]["element"]["elem"]
            .as_array()
            .unwrap();
        assert_eq!(elems.len(), 1);
        assert_eq!(elems[0]["prefix"]["addr"], "10.0.0.0");
        assert_eq!(elems[0]["prefix"]["len"], 24);
    }

    #[test]
    fn test_lockdown_batch_chains_default_deny() {
        let batch = lockdown_batch(host_net());
        let ops = batch["nftables"].as_array().unwrap();

        let chains: Vec<&Value> = ops
            .iter()
            .filter_map(|op| op.get("add").and_then(|a| a.get("chain")))
            .collect();
        assert_eq!(chains.len(), 3);
        for chain in chains {
            assert_eq!(chain["policy"], "drop");
            assert_eq!(chain["table"], POLICY_TABLE);
            assert_eq!(chain["family"], "ip");
        }
    }

    #[test]
    fn test_lockdown_batch_allow_set_match_precedes_reject() {
        let batch = lockdown_batch(host_net());
        let comments = rule_comments(&batch, "output");

        let allow_pos = comments
            .iter()
            .position(|c| c == "allow listed destinations")
            .unwrap();
        let reject_pos = comments
            .iter()
            .position(|c| c == "reject all other egress")
            .unwrap();
        assert!(allow_pos < reject_pos, "allow-list match must precede the catch-all reject");
        // The reject is last
        assert_eq!(reject_pos, comments.len() - 1);
    }

    #[test]
    fn test_lockdown_batch_narrow_exceptions_first() {
        let batch = lockdown_batch(host_net());
        let comments = rule_comments(&batch, "output");

        assert_eq!(comments[0], "allow to loopback");
        assert_eq!(comments[1], "allow tracked connections");
    }

    #[test]
    fn test_lockdown_batch_reject_is_admin_prohibited() {
        let batch = lockdown_batch(host_net());
        let ops = batch["nftables"].as_array().unwrap();

        let reject = ops
            .iter()
            .filter_map(|op| op.get("add").and_then(|a| a.get("rule")))
            .find(|r| r["comment"] == "reject all other egress")
            .unwrap();
        assert_eq!(reject["expr"][0]["reject"]["expr"], "admin-prohibited");
    }

    #[test]
    fn test_lockdown_batch_references_host_network_and_set() {
        let batch = lockdown_batch(host_net());
        let text = serde_json::to_string(&batch).unwrap();

        assert!(text.contains("192.168.1.0/24"));
        assert!(text.contains(&format!("@{ALLOW_SET}")));
        // Forward chain carries no exceptions at all
        assert!(rule_comments(&batch, "forward").is_empty());
    }

    #[test]
    fn test_lockdown_batch_dns_and_ssh_exceptions() {
        let batch = lockdown_batch(host_net());
        let input = rule_comments(&batch, "input");
        let output = rule_comments(&batch, "output");

        assert!(input.contains(&"allow dns responses".to_string()));
        assert!(input.contains(&"allow ssh responses".to_string()));
        assert!(output.contains(&"allow dns queries".to_string()));
        assert!(output.contains(&"allow ssh".to_string()));
    }
}
