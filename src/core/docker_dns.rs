//! Capture and replay of container-runtime DNS NAT rules
//!
//! Containerized hosts resolve names through the runtime's embedded
//! resolver, wired up with a handful of NAT rules. Those rules must
//! survive the flush: they are captured from the live ruleset JSON before
//! any destructive operation and replayed immediately after. Captured too
//! late, internal name resolution breaks for the container's lifetime.
//!
//! Absence of such rules is valid (non-containerized host). Failure to
//! replay an individual rule degrades name resolution but does not weaken
//! the security policy, so it is a warning rather than an error.

use crate::core::error::Result;
use crate::core::nft::PolicySink;
use serde_json::{Value, json};
use std::collections::HashSet;
use tracing::{info, warn};

const NAT_TABLE: &str = "nat";

/// Snapshot of the NAT chains and rules that reference the container
/// runtime's internal resolver, with kernel handles stripped so the
/// objects are replayable.
#[derive(Debug, Clone, Default)]
pub struct PreservedDnsRules {
    pub chains: Vec<Value>,
    pub rules: Vec<Value>,
}

impl PreservedDnsRules {
    pub fn is_empty(&self) -> bool {
        self.rules.is_empty()
    }
}

/// Removes kernel-assigned `handle` fields recursively; a replayed object
/// must not claim a handle from the pre-flush ruleset.
fn strip_handles(value: &mut Value) {
    match value {
        Value::Object(map) => {
            map.remove("handle");
            for child in map.values_mut() {
                strip_handles(child);
            }
        }
        Value::Array(items) => {
            for item in items {
                strip_handles(item);
            }
        }
        _ => {}
    }
}

fn is_nat_object(object: &Value) -> bool {
    object.get("family").and_then(Value::as_str) == Some("ip")
        && object.get("table").and_then(Value::as_str) == Some(NAT_TABLE)
}

/// Captures NAT rules mentioning the resolver address from the live
/// ruleset, together with the chains they depend on.
///
/// Must run before the flush. Listing failure is an error (it happens
/// pre-mutation, so aborting is safe); finding nothing is not.
pub async fn capture<S: PolicySink>(sink: &S, resolver_addr: &str) -> Result<PreservedDnsRules> {
    let ruleset = sink.list_ruleset().await?;

    let Some(objects) = ruleset.get("nftables").and_then(Value::as_array) else {
        info!("Ruleset listing carried no objects; nothing to preserve");
        return Ok(PreservedDnsRules::default());
    };

    let mut rules = Vec::new();
    let mut chain_names: HashSet<String> = HashSet::new();

    for object in objects {
        let Some(rule) = object.get("rule") else {
            continue;
        };
        if !is_nat_object(rule) {
            continue;
        }
        let Some(expr) = rule.get("expr") else {
            continue;
        };
        let Ok(expr_text) = serde_json::to_string(expr) else {
            continue;
        };
        if !expr_text.contains(resolver_addr) {
            continue;
        }

        if let Some(chain) = rule.get("chain").and_then(Value::as_str) {
            chain_names.insert(chain.to_string());
        }
        let mut rule = rule.clone();
        strip_handles(&mut rule);
        rules.push(rule);
    }

    let chains: Vec<Value> = objects
        .iter()
        .filter_map(|object| object.get("chain"))
        .filter(|chain| {
            is_nat_object(chain)
                && chain
                    .get("name")
                    .and_then(Value::as_str)
                    .is_some_and(|name| chain_names.contains(name))
        })
        .map(|chain| {
            let mut chain = chain.clone();
            strip_handles(&mut chain);
            chain
        })
        .collect();

    if rules.is_empty() {
        info!("No container DNS NAT rules found (non-containerized host?)");
    } else {
        info!(
            "Preserved {} container DNS rule(s) across {} chain(s)",
            rules.len(),
            chains.len()
        );
    }

    Ok(PreservedDnsRules { chains, rules })
}

/// Replays the preserved chains and rules after the flush.
///
/// The nat table and its chains go in as one batch; rules are replayed
/// one at a time so a single bad rule only costs that rule. Every failure
/// here is a warning - resolution degrades, the policy does not.
pub async fn restore<S: PolicySink>(sink: &S, preserved: &PreservedDnsRules) {
    if preserved.is_empty() {
        info!("No preserved container DNS rules to reinstate");
        return;
    }

    let mut batch: Vec<Value> =
        vec![json!({ "add": { "table": { "family": "ip", "name": NAT_TABLE } } })];
    for chain in &preserved.chains {
        batch.push(json!({ "add": { "chain": chain } }));
    }

    if let Err(e) = sink.apply(&json!({ "nftables": batch })).await {
        warn!("Failed to recreate container DNS chains, resolution may degrade: {e}");
        return;
    }

    let mut replayed = 0usize;
    for rule in &preserved.rules {
        match sink.apply(&json!({ "nftables": [ { "add": { "rule": rule } } ] })).await {
            Ok(()) => replayed += 1,
            Err(e) => warn!("Failed to replay a container DNS rule: {e}"),
        }
    }
    info!("Reinstated {replayed}/{} container DNS rule(s)", preserved.rules.len());
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::error::Error;
    use std::sync::Mutex;

    struct FakeSink {
        ruleset: Value,
        applied: Mutex<Vec<Value>>,
        fail_applies: bool,
    }

    impl FakeSink {
        fn new(ruleset: Value) -> Self {
            Self {
                ruleset,
                applied: Mutex::new(Vec::new()),
                fail_applies: false,
            }
        }
    }

    impl PolicySink for FakeSink {
        async fn apply(&self, payload: &Value) -> Result<()> {
            if self.fail_applies {
                return Err(Error::Internal("simulated apply failure".to_string()));
            }
            self.applied.lock().unwrap().push(payload.clone());
            Ok(())
        }

        async fn list_ruleset(&self) -> Result<Value> {
            Ok(self.ruleset.clone())
        }
    }

    fn docker_ruleset() -> Value {
        json!({
            "nftables": [
                { "metainfo": { "version": "1.0.9", "json_schema_version": 1 } },
                { "table": { "family": "ip", "name": "nat", "handle": 2 } },
                { "chain": {
                    "family": "ip", "table": "nat", "name": "DOCKER_OUTPUT",
                    "handle": 3
                } },
                { "chain": {
                    "family": "ip", "table": "nat", "name": "OUTPUT",
                    "handle": 1, "type": "nat", "hook": "output", "prio": -100,
                    "policy": "accept"
                } },
                { "rule": {
                    "family": "ip", "table": "nat", "chain": "DOCKER_OUTPUT",
                    "handle": 7,
                    "expr": [
                        { "match": {
                            "left": { "payload": { "protocol": "ip", "field": "daddr" } },
                            "op": "==", "right": "127.0.0.11"
                        } },
                        { "dnat": { "addr": "127.0.0.11", "port": 41017 } }
                    ]
                } },
                { "rule": {
                    "family": "ip", "table": "filter", "chain": "INPUT",
                    "handle": 9,
                    "expr": [ { "accept": null } ]
                } }
            ]
        })
    }

    #[tokio::test]
    async fn test_capture_finds_resolver_rules_and_chains() {
        let sink = FakeSink::new(docker_ruleset());
        let preserved = capture(&sink, "127.0.0.11").await.unwrap();

        assert_eq!(preserved.rules.len(), 1);
        assert_eq!(preserved.chains.len(), 1);
        assert_eq!(preserved.chains[0]["name"], "DOCKER_OUTPUT");
        // Handles must be stripped for replay
        assert!(preserved.rules[0].get("handle").is_none());
        assert!(preserved.chains[0].get("handle").is_none());
    }

    #[tokio::test]
    async fn test_capture_empty_on_plain_host() {
        let sink = FakeSink::new(json!({ "nftables": [
            { "metainfo": { "version": "1.0.9", "json_schema_version": 1 } }
        ] }));
        let preserved = capture(&sink, "127.0.0.11").await.unwrap();
        assert!(preserved.is_empty());
    }

    #[tokio::test]
    async fn test_restore_replays_chains_then_rules() {
        let sink = FakeSink::new(docker_ruleset());
        let preserved = capture(&sink, "127.0.0.11").await.unwrap();

        restore(&sink, &preserved).await;

        let applied = sink.applied.lock().unwrap();
        assert_eq!(applied.len(), 2);
        // First batch: table + chains
        let first = applied[0]["nftables"].as_array().unwrap();
        assert!(first[0]["add"]["table"].is_object());
        assert_eq!(first[1]["add"]["chain"]["name"], "DOCKER_OUTPUT");
        // Then each rule individually
        assert_eq!(applied[1]["nftables"][0]["add"]["rule"]["chain"], "DOCKER_OUTPUT");
    }

    #[tokio::test]
    async fn test_restore_noop_when_nothing_preserved() {
        let sink = FakeSink::new(json!({ "nftables": [] }));
        restore(&sink, &PreservedDnsRules::default()).await;
        assert!(sink.applied.lock().unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_restore_failure_is_not_fatal() {
        let mut sink = FakeSink::new(docker_ruleset());
        let preserved = capture(&sink, "127.0.0.11").await.unwrap();
        sink.fail_applies = true;

        // Must not panic or return an error
        restore(&sink, &preserved).await;
    }

    #[test]
    fn test_strip_handles_recursive() {
        let mut value = json!({
            "handle": 4,
            "nested": { "handle": 5, "keep": true },
            "list": [ { "handle": 6 } ]
        });
        strip_handles(&mut value);
        let text = serde_json::to_string(&value).unwrap();
        assert!(!text.contains("handle"));
        assert!(text.contains("keep"));
    }
}
