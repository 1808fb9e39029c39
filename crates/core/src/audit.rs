//! Structured audit events and the sink they are written through.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;

#[derive(Clone, Copy, Debug, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum AuditKind {
    OperationStart,
    OperationSuccess,
    OperationFailure,
    SnapshotDeleted,
}

/// One audit record. The context is the caller-supplied payload echoed
/// verbatim; the kernel does not redact it.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct AuditEvent {
    pub event: AuditKind,
    pub operation_id: String,
    pub operation: String,
    pub context: Value,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub duration_ms: Option<u64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
    pub timestamp: DateTime<Utc>,
}

impl AuditEvent {
    pub fn new(event: AuditKind, operation_id: impl Into<String>, operation: impl Into<String>, context: Value) -> Self {
        Self {
            event,
            operation_id: operation_id.into(),
            operation: operation.into(),
            context,
            duration_ms: None,
            error: None,
            timestamp: Utc::now(),
        }
    }

    pub fn with_duration(mut self, duration_ms: u64) -> Self {
        self.duration_ms = Some(duration_ms);
        self
    }

    pub fn with_error(mut self, error: impl Into<String>) -> Self {
        self.error = Some(error.into());
        self
    }
}

/// Destination for audit records; implementations must tolerate being
/// called from any task.
pub trait AuditSink: Send + Sync {
    fn audit(&self, event: &AuditEvent);
}

/// Sink that drops every event; used when auditing is disabled.
pub struct NullAuditSink;

impl AuditSink for NullAuditSink {
    fn audit(&self, _event: &AuditEvent) {}
}
