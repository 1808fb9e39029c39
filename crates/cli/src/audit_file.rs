//! JSONL audit sink writing date-stamped files under the log directory.

use chrono::Utc;
use mcp_hostd_core::{AuditEvent, AuditSink};
use parking_lot::Mutex;
use std::io::Write;
use std::path::PathBuf;
use tracing::warn;

pub struct JsonlAuditSink {
    dir: PathBuf,
    lock: Mutex<()>,
}

impl JsonlAuditSink {
    pub fn new(dir: impl Into<PathBuf>) -> std::io::Result<Self> {
        let dir = dir.into();
        std::fs::create_dir_all(&dir)?;
        Ok(Self {
            dir,
            lock: Mutex::new(()),
        })
    }

    fn current_path(&self) -> PathBuf {
        self.dir
            .join(format!("audit-{}.log", Utc::now().format("%Y-%m-%d")))
    }
}

impl AuditSink for JsonlAuditSink {
    fn audit(&self, event: &AuditEvent) {
        let line = match serde_json::to_string(event) {
            Ok(line) => line,
            Err(e) => {
                warn!(error = %e, "failed to serialize audit event");
                return;
            }
        };
        let _guard = self.lock.lock();
        let result = std::fs::OpenOptions::new()
            .create(true)
            .append(true)
            .open(self.current_path())
            .and_then(|mut file| writeln!(file, "{line}"));
        if let Err(e) = result {
            warn!(error = %e, "failed to write audit event");
        }
    }
}
