//! The single gate every mutating plugin action passes through: admission,
//! audit emission, and error propagation.

use std::collections::HashMap;
use std::future::Future;
use std::sync::Arc;
use std::time::Instant;

use chrono::{DateTime, Utc};
use mcp_hostd_core::{AuditEvent, AuditKind, AuditSink, HostdError, Result};
use parking_lot::Mutex;
use serde_json::Value;
use tokio::sync::Semaphore;
use tracing::{debug, error, info};
use uuid::Uuid;

/// Ephemeral record of an admitted operation.
#[derive(Clone, Debug)]
pub struct OperationRecord {
    pub operation: String,
    pub context: Value,
    pub started_at: DateTime<Utc>,
}

pub struct SecurityKernel {
    semaphore: Arc<Semaphore>,
    audit: Arc<dyn AuditSink>,
    audit_all: bool,
    operations: Mutex<HashMap<Uuid, OperationRecord>>,
}

/// Removes the operation record on every exit path, including task
/// cancellation.
struct OperationGuard<'a> {
    kernel: &'a SecurityKernel,
    id: Uuid,
}

impl Drop for OperationGuard<'_> {
    fn drop(&mut self) {
        self.kernel.operations.lock().remove(&self.id);
    }
}

impl SecurityKernel {
    pub fn new(max_concurrent_operations: usize, audit: Arc<dyn AuditSink>, audit_all: bool) -> Self {
        Self {
            semaphore: Arc::new(Semaphore::new(max_concurrent_operations)),
            audit,
            audit_all,
            operations: Mutex::new(HashMap::new()),
        }
    }

    /// Admit, audit, and run one operation. Admission does not queue: a
    /// saturated semaphore fails the call immediately. The underlying error
    /// is re-raised unchanged.
    pub async fn execute_with_audit<T, F>(
        &self,
        operation: &str,
        context: Value,
        fut: F,
    ) -> Result<T>
    where
        F: Future<Output = Result<T>>,
    {
        let _permit = self
            .semaphore
            .clone()
            .try_acquire_owned()
            .map_err(|_| {
                HostdError::ResourceLocked("maximum concurrent operations exceeded".to_string())
            })?;

        let id = Uuid::new_v4();
        let started = Instant::now();
        self.operations.lock().insert(
            id,
            OperationRecord {
                operation: operation.to_string(),
                context: context.clone(),
                started_at: Utc::now(),
            },
        );
        let _guard = OperationGuard { kernel: self, id };

        info!(operation_id = %id, operation, "operation admitted");
        self.emit(AuditEvent::new(
            AuditKind::OperationStart,
            id.to_string(),
            operation,
            context.clone(),
        ));

        let result = fut.await;
        let duration_ms = started.elapsed().as_millis() as u64;
        match &result {
            Ok(_) => {
                debug!(operation_id = %id, duration_ms, "operation succeeded");
                self.emit(
                    AuditEvent::new(
                        AuditKind::OperationSuccess,
                        id.to_string(),
                        operation,
                        context,
                    )
                    .with_duration(duration_ms),
                );
            }
            Err(e) => {
                error!(operation_id = %id, duration_ms, error = %e, "operation failed");
                self.emit(
                    AuditEvent::new(
                        AuditKind::OperationFailure,
                        id.to_string(),
                        operation,
                        context,
                    )
                    .with_duration(duration_ms)
                    .with_error(e.to_string()),
                );
            }
        }
        result
    }

    pub fn in_flight(&self) -> usize {
        self.operations.lock().len()
    }

    fn emit(&self, event: AuditEvent) {
        if self.audit_all {
            self.audit.audit(&event);
        }
    }
}
