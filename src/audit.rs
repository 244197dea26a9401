//! Audit logging for security-critical operations
//!
//! Every phase outcome and every rollback is appended as one JSON line,
//! correlated by a per-run UUID. The audit log is how an operator answers
//! "what did the last bootstrap actually do" after the fact; the tracing
//! stream is ephemeral, this file is not.

use crate::core::phase::PolicyPhase;
use serde::{Deserialize, Serialize};
use std::path::PathBuf;
use tokio::io::AsyncWriteExt;
use uuid::Uuid;

/// Types of auditable events
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum EventType {
    Preflight,
    Phase,
    Verify,
    Rollback,
    ResetPermissive,
}

/// A single audit log entry
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AuditEvent {
    /// When the event occurred (UTC)
    pub timestamp: chrono::DateTime<chrono::Utc>,

    /// Correlates all events of one bootstrap invocation
    pub run_id: Uuid,

    /// Type of event
    pub event_type: EventType,

    /// Whether the operation succeeded
    pub success: bool,

    /// Additional structured data about the event
    pub details: serde_json::Value,

    /// Error message if operation failed
    pub error: Option<String>,
}

impl AuditEvent {
    /// Creates a new audit event
    pub fn new(
        run_id: Uuid,
        event_type: EventType,
        success: bool,
        details: serde_json::Value,
        error: Option<String>,
    ) -> Self {
        Self {
            timestamp: chrono::Utc::now(),
            run_id,
            event_type,
            success,
            details,
            error,
        }
    }
}

/// Audit log writer
pub struct AuditLog {
    log_path: PathBuf,
}

impl AuditLog {
    /// Creates a new audit log instance
    ///
    /// # Errors
    ///
    /// Returns `Err` if the state directory cannot be determined
    pub fn new() -> std::io::Result<Self> {
        let mut log_path = crate::utils::get_state_dir().ok_or_else(|| {
            std::io::Error::new(std::io::ErrorKind::NotFound, "State directory not found")
        })?;
        log_path.push("audit.log");

        Ok(Self { log_path })
    }

    /// Appends an event to the audit log as JSON-lines
    ///
    /// # Errors
    ///
    /// Returns `Err` if the file cannot be opened or written
    pub async fn log(&self, event: AuditEvent) -> std::io::Result<()> {
        let json = serde_json::to_string(&event)?;

        let mut file = tokio::fs::OpenOptions::new()
            .create(true)
            .append(true)
            .open(&self.log_path)
            .await?;

        file.write_all(json.as_bytes()).await?;
        file.write_all(b"\n").await?;
        file.sync_all().await?;

        Ok(())
    }

    /// Reads the most recent events from the log, newest first
    ///
    /// # Errors
    ///
    /// Returns `Err` if the file cannot be read
    pub async fn read_recent(&self, count: usize) -> std::io::Result<Vec<AuditEvent>> {
        let content = tokio::fs::read_to_string(&self.log_path).await?;

        let events: Vec<AuditEvent> = content
            .lines()
            .rev()
            .take(count)
            .filter_map(|line| serde_json::from_str(line).ok())
            .collect();

        Ok(events)
    }

    /// Returns the path to the audit log file
    pub fn path(&self) -> &PathBuf {
        &self.log_path
    }
}

/// Logs a phase outcome. Audit failures are warned about, never fatal -
/// the bootstrap must not abort because a log line could not be written.
pub async fn log_phase(
    run_id: Uuid,
    phase: PolicyPhase,
    success: bool,
    details: serde_json::Value,
    error: Option<String>,
) {
    let payload = serde_json::json!({
        "phase": phase.to_string(),
        "data": details,
    });
    append(AuditEvent::new(run_id, EventType::Phase, success, payload, error)).await;
}

/// Logs the pre-mutation preflight outcome
pub async fn log_preflight(run_id: Uuid, success: bool, error: Option<String>) {
    append(AuditEvent::new(
        run_id,
        EventType::Preflight,
        success,
        serde_json::json!({}),
        error,
    ))
    .await;
}

/// Logs the verification outcome
pub async fn log_verify(run_id: Uuid, success: bool, error: Option<String>) {
    append(AuditEvent::new(
        run_id,
        EventType::Verify,
        success,
        serde_json::json!({}),
        error,
    ))
    .await;
}

/// Logs a rollback, noting whether the compensation itself worked
pub async fn log_rollback(run_id: Uuid, success: bool, error: Option<String>) {
    append(AuditEvent::new(
        run_id,
        EventType::Rollback,
        success,
        serde_json::json!({}),
        error,
    ))
    .await;
}

/// Logs an operator-requested reset to the permissive ruleset
pub async fn log_reset(run_id: Uuid, success: bool, error: Option<String>) {
    append(AuditEvent::new(
        run_id,
        EventType::ResetPermissive,
        success,
        serde_json::json!({}),
        error,
    ))
    .await;
}

async fn append(event: AuditEvent) {
    match AuditLog::new() {
        Ok(audit) => {
            if let Err(e) = audit.log(event).await {
                tracing::warn!("Failed to write audit log: {}", e);
            }
        }
        Err(e) => tracing::warn!("Audit log unavailable: {}", e),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_audit_event_creation() {
        let run_id = Uuid::new_v4();
        let event = AuditEvent::new(
            run_id,
            EventType::Phase,
            true,
            serde_json::json!({"phase": "flushed"}),
            None,
        );

        assert!(event.success);
        assert!(event.error.is_none());
        assert_eq!(event.run_id, run_id);
        assert_eq!(event.details["phase"], "flushed");
    }

    #[test]
    fn test_event_serialization() {
        let event = AuditEvent::new(
            Uuid::nil(),
            EventType::Rollback,
            false,
            serde_json::json!({}),
            Some("verification failed".to_string()),
        );

        let json = serde_json::to_string(&event).unwrap();
        assert!(json.contains("rollback"));
        assert!(json.contains("verification failed"));
    }

    #[test]
    fn test_event_deserialization() {
        let json = r#"{"timestamp":"2024-01-01T00:00:00Z","run_id":"00000000-0000-0000-0000-000000000000","event_type":"verify","success":true,"details":{},"error":null}"#;
        let event: AuditEvent = serde_json::from_str(json).unwrap();

        assert!(event.success);
        assert!(matches!(event.event_type, EventType::Verify));
    }
}
