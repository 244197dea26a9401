//! The remote IP-range metadata resolver
//!
//! Fetches the structured range document (category name -> list of CIDR
//! strings) from the metadata endpoint and validates its shape. The fetch
//! and the shape validation both happen before the first mutating phase,
//! so a rejected credential or a gutted document aborts the run while the
//! host still has its original network policy.
//!
//! Validation order: (a) response non-empty, (b) not an error envelope,
//! (c) all required categories present. Per-entry CIDR validation happens
//! later, during collection, where a single bad entry is a warning rather
//! than a fatal condition.

use crate::core::error::{Error, Result};
use serde_json::Value;
use std::time::Duration;
use tracing::{debug, warn};

/// The error-envelope field: a JSON object carrying this key is a request
/// failure regardless of HTTP status.
const ERROR_MESSAGE_FIELD: &str = "message";

/// Source of the published IP-range document.
pub trait RangeSource {
    /// Fetches the raw metadata document.
    async fn fetch(&self) -> Result<Value>;
}

/// Production [`RangeSource`] over HTTPS.
///
/// The credential is read from the configured environment variable at
/// construction; its supplier is an external authentication step. An
/// absent or empty credential fails the fetch outright, which the
/// preflight turns into a pre-mutation abort.
pub struct HttpRangeSource {
    url: String,
    token_env: String,
    token: Option<String>,
    client: reqwest::Client,
}

impl HttpRangeSource {
    /// Builds the client with a hard request timeout; a hung endpoint is
    /// indistinguishable from a failed one.
    pub fn new(url: String, token_env: String, timeout: Duration) -> Result<Self> {
        let client = reqwest::Client::builder()
            .timeout(timeout)
            .user_agent(concat!("cordon/", env!("CARGO_PKG_VERSION")))
            .build()
            .map_err(|e| Error::MetaFetch(format!("failed to build HTTP client: {e}")))?;

        let token = std::env::var(&token_env)
            .ok()
            .filter(|value| !value.trim().is_empty());

        Ok(Self {
            url,
            token_env,
            token,
            client,
        })
    }
}

impl RangeSource for HttpRangeSource {
    async fn fetch(&self) -> Result<Value> {
        let Some(token) = &self.token else {
            return Err(Error::MissingCredential(self.token_env.clone()));
        };

        let request = self
            .client
            .get(&self.url)
            .header(reqwest::header::ACCEPT, "application/json")
            .bearer_auth(token);

        let response = request
            .send()
            .await
            .map_err(|e| Error::MetaFetch(format!("request to {} failed: {e}", self.url)))?;

        // Deliberately no error_for_status: the error envelope check in
        // parse_ranges handles auth rejections with their actual message.
        let body = response
            .text()
            .await
            .map_err(|e| Error::MetaFetch(format!("failed to read response body: {e}")))?;

        if body.trim().is_empty() {
            return Err(Error::MetaFetch("empty response body".to_string()));
        }

        serde_json::from_str(&body)
            .map_err(|e| Error::MetaFetch(format!("response is not valid JSON: {e}")))
    }
}

/// Validates the document shape and extracts the union of range strings.
///
/// Required categories must all be present; configured optional
/// categories contribute when present and are skipped with a debug note
/// otherwise. A category whose value is not an array of strings means the
/// document structure changed under us and is fatal, with the offending
/// key named.
///
/// # Errors
///
/// - [`Error::MetaFetch`] when the top level is not an object or a
///   category has the wrong shape
/// - [`Error::MetaRejected`] for an error envelope
/// - [`Error::MetaMissingCategories`] when required categories are absent
pub fn parse_ranges(document: &Value, required: &[String], optional: &[String]) -> Result<Vec<String>> {
    let object = document.as_object().ok_or_else(|| {
        Error::MetaFetch("metadata top-level value is not an object".to_string())
    })?;

    if let Some(message) = object.get(ERROR_MESSAGE_FIELD).and_then(Value::as_str) {
        return Err(Error::MetaRejected(message.to_string()));
    }

    let present: Vec<String> = object.keys().cloned().collect();
    let missing: Vec<String> = required
        .iter()
        .filter(|category| !object.contains_key(*category))
        .cloned()
        .collect();
    if !missing.is_empty() {
        return Err(Error::MetaMissingCategories { missing, present });
    }

    let mut ranges = Vec::new();
    for category in required.iter().chain(optional.iter()) {
        let Some(value) = object.get(category) else {
            debug!("optional category '{category}' absent, skipping");
            continue;
        };
        let entries = value.as_array().ok_or_else(|| {
            Error::MetaFetch(format!("category '{category}' is not an array of ranges"))
        })?;
        for entry in entries {
            match entry.as_str() {
                Some(range) => ranges.push(range.to_string()),
                None => {
                    warn!("category '{category}' contains a non-string entry, skipping it");
                }
            }
        }
    }

    Ok(ranges)
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn cats(names: &[&str]) -> Vec<String> {
        names.iter().map(ToString::to_string).collect()
    }

    #[test]
    fn test_parse_ranges_happy_path() {
        let doc = json!({
            "web": ["140.82.112.0/20", "2606:50c0::/32"],
            "api": ["140.82.112.0/20"],
            "git": ["192.30.252.0/22"],
            "ignored": ["10.0.0.0/8"]
        });

        let ranges = parse_ranges(&doc, &cats(&["web", "api", "git"]), &[]).unwrap();
        // Union across required categories, unlisted categories ignored,
        // nothing dropped here (IPv6 filtering happens at collection time)
        assert_eq!(
            ranges,
            vec!["140.82.112.0/20", "2606:50c0::/32", "140.82.112.0/20", "192.30.252.0/22"]
        );
    }

    #[test]
    fn test_parse_ranges_error_envelope() {
        let doc = json!({ "message": "Bad credentials" });
        let err = parse_ranges(&doc, &cats(&["web"]), &[]).unwrap_err();
        match err {
            Error::MetaRejected(msg) => assert_eq!(msg, "Bad credentials"),
            other => panic!("expected MetaRejected, got {other:?}"),
        }
    }

    #[test]
    fn test_parse_ranges_missing_category_is_fatal() {
        let doc = json!({ "web": [], "api": [] });
        let err = parse_ranges(&doc, &cats(&["web", "api", "git"]), &[]).unwrap_err();
        match err {
            Error::MetaMissingCategories { missing, present } => {
                assert_eq!(missing, vec!["git".to_string()]);
                assert!(present.contains(&"web".to_string()));
            }
            other => panic!("expected MetaMissingCategories, got {other:?}"),
        }
    }

    #[test]
    fn test_parse_ranges_rejects_non_object() {
        let doc = json!(["140.82.112.0/20"]);
        assert!(matches!(
            parse_ranges(&doc, &cats(&["web"]), &[]),
            Err(Error::MetaFetch(_))
        ));
    }

    #[test]
    fn test_parse_ranges_rejects_non_array_category() {
        let doc = json!({ "web": "140.82.112.0/20" });
        let err = parse_ranges(&doc, &cats(&["web"]), &[]).unwrap_err();
        assert!(err.to_string().contains("web"));
    }

    #[test]
    fn test_parse_ranges_optional_category_contributes_when_present() {
        let doc = json!({
            "web": ["1.1.1.0/24"],
            "pages": ["2.2.2.0/24"]
        });
        let ranges = parse_ranges(&doc, &cats(&["web"]), &cats(&["pages"])).unwrap();
        assert_eq!(ranges, vec!["1.1.1.0/24", "2.2.2.0/24"]);
    }

    #[test]
    fn test_parse_ranges_optional_category_absent_is_fine() {
        let doc = json!({ "web": ["1.1.1.0/24"] });
        let ranges = parse_ranges(&doc, &cats(&["web"]), &cats(&["pages"])).unwrap();
        assert_eq!(ranges, vec!["1.1.1.0/24"]);
    }

    #[test]
    fn test_parse_ranges_skips_non_string_entries() {
        let doc = json!({ "web": ["1.1.1.0/24", 42, null] });
        let ranges = parse_ranges(&doc, &cats(&["web"]), &[]).unwrap();
        assert_eq!(ranges, vec!["1.1.1.0/24"]);
    }

    #[tokio::test]
    async fn test_fetch_without_credential_fails_outright() {
        let _guard = crate::elevation::ENV_VAR_MUTEX.lock().unwrap();
        unsafe {
            std::env::remove_var("CORDON_TEST_ABSENT_TOKEN");
        }

        let source = HttpRangeSource::new(
            "https://metadata.invalid/ranges".to_string(),
            "CORDON_TEST_ABSENT_TOKEN".to_string(),
            Duration::from_secs(1),
        )
        .unwrap();

        let err = source.fetch().await.unwrap_err();
        assert!(matches!(err, Error::MissingCredential(_)));
        assert!(err.to_string().contains("CORDON_TEST_ABSENT_TOKEN"));
    }
}
