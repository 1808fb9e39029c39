//! Append-only catalog of file and service-state checkpoints.
//!
//! Each snapshot is one self-contained JSON record named by its UUID.
//! Records are written to a sibling temporary file and renamed into place,
//! so a partial record never appears at the final name. Restoration is
//! best-effort per entry: one failed file does not stop the rest.

use std::path::{Path, PathBuf};
use std::sync::Arc;

use base64::engine::general_purpose::STANDARD as BASE64;
use base64::Engine;
use chrono::{DateTime, Utc};
use mcp_hostd_core::{
    AuditEvent, AuditKind, AuditSink, HostdError, Result, ServiceState, ServiceStateProvider,
};
use serde::{Deserialize, Serialize};
use tokio::io::AsyncWriteExt;
use tracing::{debug, info, warn};
use uuid::Uuid;

#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct SnapshotRecord {
    pub id: String,
    pub description: String,
    pub created_at: DateTime<Utc>,
    pub host: HostInfo,
    pub files: Vec<FileEntry>,
    pub services: Vec<ServiceState>,
}

#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct HostInfo {
    pub hostname: String,
    pub kernel: String,
}

#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct FileEntry {
    pub path: PathBuf,
    #[serde(with = "base64_bytes")]
    pub content: Vec<u8>,
    pub mode: u32,
    pub size: u64,
    pub mtime: DateTime<Utc>,
}

#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct SnapshotSummary {
    pub id: String,
    pub description: String,
    pub created_at: DateTime<Utc>,
    pub file_count: usize,
    pub service_count: usize,
}

/// Counts from a best-effort restore.
#[derive(Clone, Debug, Default, Serialize)]
pub struct RestoreReport {
    pub files_restored: usize,
    pub files_failed: usize,
    pub services_applied: usize,
    pub services_failed: usize,
}

pub struct SnapshotStore {
    dir: PathBuf,
    services: Arc<dyn ServiceStateProvider>,
    audit: Arc<dyn AuditSink>,
}

impl SnapshotStore {
    pub fn new(
        dir: impl Into<PathBuf>,
        services: Arc<dyn ServiceStateProvider>,
        audit: Arc<dyn AuditSink>,
    ) -> Self {
        Self {
            dir: dir.into(),
            services,
            audit,
        }
    }

    /// Capture the named files and the provider's service states into a new
    /// immutable record; returns the snapshot id.
    pub async fn create_snapshot(
        &self,
        description: &str,
        file_paths: &[PathBuf],
    ) -> Result<String> {
        let id = Uuid::new_v4().to_string();
        info!(snapshot_id = %id, description, "creating snapshot");

        let mut files = Vec::new();
        for path in file_paths {
            let meta = match tokio::fs::metadata(path).await {
                Ok(meta) if meta.is_file() => meta,
                _ => {
                    debug!(path = %path.display(), "skipping absent path");
                    continue;
                }
            };
            let content = tokio::fs::read(path).await?;
            files.push(FileEntry {
                path: path.clone(),
                mode: file_mode(&meta),
                size: meta.len(),
                mtime: meta
                    .modified()
                    .map(DateTime::<Utc>::from)
                    .unwrap_or_else(|_| Utc::now()),
                content,
            });
        }

        let services = self.services.capture().await?;
        let record = SnapshotRecord {
            id: id.clone(),
            description: description.to_string(),
            created_at: Utc::now(),
            host: host_info(),
            files,
            services,
        };

        tokio::fs::create_dir_all(&self.dir).await?;
        let data = serde_json::to_vec_pretty(&record)?;
        let tmp = self.dir.join(format!(".tmp-{id}.json"));
        let path = self.record_path(&id);
        write_atomic(&tmp, &path, &data).await?;

        info!(snapshot_id = %id, files = record.files.len(), services = record.services.len(), "snapshot created");
        Ok(id)
    }

    /// Converge the captured file set and service states back to the
    /// recorded values. Per-entry failures are audited and skipped.
    pub async fn restore_snapshot(&self, id: &str) -> Result<RestoreReport> {
        let record = self.read_record(id).await?;
        info!(snapshot_id = %id, "restoring snapshot");
        let mut report = RestoreReport::default();

        for entry in &record.files {
            match self.restore_file(entry).await {
                Ok(()) => report.files_restored += 1,
                Err(e) => {
                    warn!(path = %entry.path.display(), error = %e, "failed to restore file");
                    self.audit.audit(
                        &AuditEvent::new(
                            AuditKind::OperationFailure,
                            id,
                            "snapshot_restore_file",
                            serde_json::json!({"path": entry.path}),
                        )
                        .with_error(e.to_string()),
                    );
                    report.files_failed += 1;
                }
            }
        }

        let current = match self.services.capture().await {
            Ok(states) => states,
            Err(e) => {
                warn!(error = %e, "failed to capture current service states");
                Vec::new()
            }
        };
        for recorded in &record.services {
            let unchanged = current
                .iter()
                .any(|state| state == recorded);
            if unchanged {
                continue;
            }
            match self.services.apply(recorded).await {
                Ok(()) => report.services_applied += 1,
                Err(e) => {
                    warn!(service = %recorded.name, error = %e, "failed to converge service state");
                    self.audit.audit(
                        &AuditEvent::new(
                            AuditKind::OperationFailure,
                            id,
                            "snapshot_restore_service",
                            serde_json::json!({"service": recorded.name}),
                        )
                        .with_error(e.to_string()),
                    );
                    report.services_failed += 1;
                }
            }
        }

        info!(
            snapshot_id = %id,
            files_restored = report.files_restored,
            files_failed = report.files_failed,
            "restore finished"
        );
        Ok(report)
    }

    /// Record summaries, newest first. Unparseable files are skipped.
    pub async fn list_snapshots(&self) -> Result<Vec<SnapshotSummary>> {
        let mut summaries = Vec::new();
        let mut entries = match tokio::fs::read_dir(&self.dir).await {
            Ok(entries) => entries,
            Err(_) => return Ok(summaries),
        };
        while let Some(entry) = entries.next_entry().await? {
            let path = entry.path();
            if path.extension().and_then(|s| s.to_str()) != Some("json") {
                continue;
            }
            let Ok(raw) = tokio::fs::read(&path).await else {
                continue;
            };
            if let Ok(record) = serde_json::from_slice::<SnapshotRecord>(&raw) {
                summaries.push(SnapshotSummary {
                    id: record.id,
                    description: record.description,
                    created_at: record.created_at,
                    file_count: record.files.len(),
                    service_count: record.services.len(),
                });
            }
        }
        summaries.sort_by(|a, b| b.created_at.cmp(&a.created_at));
        Ok(summaries)
    }

    /// Remove a record; a deleted id can never be restored again.
    pub async fn delete_snapshot(&self, id: &str) -> Result<()> {
        let id = parse_id(id)?;
        let path = self.record_path(&id);
        tokio::fs::remove_file(&path)
            .await
            .map_err(|_| HostdError::Internal(format!("snapshot not found: {id}")))?;
        info!(snapshot_id = %id, "snapshot deleted");
        self.audit.audit(&AuditEvent::new(
            AuditKind::SnapshotDeleted,
            id.clone(),
            "snapshot_delete",
            serde_json::json!({"snapshot_id": id}),
        ));
        Ok(())
    }

    async fn read_record(&self, id: &str) -> Result<SnapshotRecord> {
        let id = parse_id(id)?;
        let path = self.record_path(&id);
        let raw = tokio::fs::read(&path)
            .await
            .map_err(|_| HostdError::Internal(format!("snapshot not found: {id}")))?;
        Ok(serde_json::from_slice(&raw)?)
    }

    async fn restore_file(&self, entry: &FileEntry) -> Result<()> {
        if let Some(parent) = entry.path.parent() {
            tokio::fs::create_dir_all(parent).await?;
        }
        tokio::fs::write(&entry.path, &entry.content).await?;
        let permissions = permissions_from_mode(entry.mode);
        tokio::fs::set_permissions(&entry.path, permissions).await?;
        Ok(())
    }

    fn record_path(&self, id: &str) -> PathBuf {
        self.dir.join(format!("{id}.json"))
    }
}

/// Snapshot ids are UUIDs; anything else is rejected before it can reach
/// the filesystem.
fn parse_id(id: &str) -> Result<String> {
    Uuid::parse_str(id)
        .map(|u| u.to_string())
        .map_err(|_| HostdError::InvalidParams(format!("invalid snapshot id: {id}")))
}

fn file_mode(meta: &std::fs::Metadata) -> u32 {
    use std::os::unix::fs::PermissionsExt;
    meta.permissions().mode()
}

fn permissions_from_mode(mode: u32) -> std::fs::Permissions {
    use std::os::unix::fs::PermissionsExt;
    std::fs::Permissions::from_mode(mode)
}

fn host_info() -> HostInfo {
    let hostname = nix::unistd::gethostname()
        .map(|h| h.to_string_lossy().into_owned())
        .unwrap_or_default();
    let kernel = std::fs::read_to_string("/proc/sys/kernel/osrelease")
        .map(|s| s.trim().to_string())
        .unwrap_or_default();
    HostInfo { hostname, kernel }
}

async fn write_atomic(tmp: &Path, final_path: &Path, data: &[u8]) -> Result<()> {
    {
        let mut file = tokio::fs::File::create(tmp).await?;
        file.write_all(data).await?;
        file.sync_all().await?;
    }
    tokio::fs::rename(tmp, final_path).await?;
    if let Some(dir) = final_path.parent() {
        let dir_file = std::fs::File::open(dir)?;
        dir_file.sync_all()?;
    }
    Ok(())
}

mod base64_bytes {
    use super::{Engine, BASE64};
    use serde::{Deserialize, Deserializer, Serializer};

    pub fn serialize<S: Serializer>(bytes: &[u8], serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_str(&BASE64.encode(bytes))
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(deserializer: D) -> Result<Vec<u8>, D::Error> {
        let encoded = String::deserialize(deserializer)?;
        BASE64
            .decode(encoded.as_bytes())
            .map_err(serde::de::Error::custom)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use async_trait::async_trait;
    use mcp_hostd_core::NullAuditSink;
    use parking_lot::Mutex;
    use std::os::unix::fs::PermissionsExt;

    struct RecordingSink {
        events: Mutex<Vec<AuditEvent>>,
    }

    impl RecordingSink {
        fn new() -> Self {
            Self {
                events: Mutex::new(Vec::new()),
            }
        }
    }

    impl AuditSink for RecordingSink {
        fn audit(&self, event: &AuditEvent) {
            self.events.lock().push(event.clone());
        }
    }

    struct FakeServices {
        current: Mutex<Vec<ServiceState>>,
        applied: Mutex<Vec<ServiceState>>,
    }

    impl FakeServices {
        fn new(current: Vec<ServiceState>) -> Self {
            Self {
                current: Mutex::new(current),
                applied: Mutex::new(Vec::new()),
            }
        }
    }

    #[async_trait]
    impl ServiceStateProvider for FakeServices {
        async fn capture(&self) -> Result<Vec<ServiceState>> {
            Ok(self.current.lock().clone())
        }

        async fn apply(&self, state: &ServiceState) -> Result<()> {
            self.applied.lock().push(state.clone());
            Ok(())
        }
    }

    fn store_in(dir: &Path) -> SnapshotStore {
        SnapshotStore::new(dir, Arc::new(mcp_hostd_core::NoServices), Arc::new(NullAuditSink))
    }

    #[tokio::test]
    async fn create_then_restore_round_trips_content_and_mode() {
        let tmp = tempfile::tempdir().unwrap();
        let target = tmp.path().join("x.conf");
        std::fs::write(&target, "A").unwrap();
        std::fs::set_permissions(&target, std::fs::Permissions::from_mode(0o600)).unwrap();

        let store = store_in(&tmp.path().join("snapshots"));
        let id = store
            .create_snapshot("before edit", &[target.clone()])
            .await
            .unwrap();

        std::fs::write(&target, "B").unwrap();
        std::fs::set_permissions(&target, std::fs::Permissions::from_mode(0o644)).unwrap();

        let report = store.restore_snapshot(&id).await.unwrap();
        assert_eq!(report.files_restored, 1);
        assert_eq!(report.files_failed, 0);
        assert_eq!(std::fs::read_to_string(&target).unwrap(), "A");
        let mode = std::fs::metadata(&target).unwrap().permissions().mode();
        assert_eq!(mode & 0o777, 0o600);
    }

    #[tokio::test]
    async fn restore_is_idempotent_over_the_file_set() {
        let tmp = tempfile::tempdir().unwrap();
        let target = tmp.path().join("x");
        std::fs::write(&target, "A").unwrap();

        let store = store_in(&tmp.path().join("snapshots"));
        let id = store.create_snapshot("x", &[target.clone()]).await.unwrap();

        store.restore_snapshot(&id).await.unwrap();
        store.restore_snapshot(&id).await.unwrap();
        assert_eq!(std::fs::read_to_string(&target).unwrap(), "A");
    }

    #[tokio::test]
    async fn restore_recreates_missing_parent_directories() {
        let tmp = tempfile::tempdir().unwrap();
        let nested = tmp.path().join("etc").join("app").join("x.conf");
        std::fs::create_dir_all(nested.parent().unwrap()).unwrap();
        std::fs::write(&nested, "A").unwrap();

        let store = store_in(&tmp.path().join("snapshots"));
        let id = store.create_snapshot("x", &[nested.clone()]).await.unwrap();

        std::fs::remove_dir_all(tmp.path().join("etc")).unwrap();
        store.restore_snapshot(&id).await.unwrap();
        assert_eq!(std::fs::read_to_string(&nested).unwrap(), "A");
    }

    #[tokio::test]
    async fn absent_paths_are_skipped_at_capture() {
        let tmp = tempfile::tempdir().unwrap();
        let store = store_in(&tmp.path().join("snapshots"));
        let id = store
            .create_snapshot("empty", &[tmp.path().join("nope")])
            .await
            .unwrap();
        let summaries = store.list_snapshots().await.unwrap();
        assert_eq!(summaries[0].id, id);
        assert_eq!(summaries[0].file_count, 0);
    }

    #[tokio::test]
    async fn list_is_sorted_newest_first() {
        let tmp = tempfile::tempdir().unwrap();
        let store = store_in(&tmp.path().join("snapshots"));
        let first = store.create_snapshot("first", &[]).await.unwrap();
        tokio::time::sleep(std::time::Duration::from_millis(10)).await;
        let second = store.create_snapshot("second", &[]).await.unwrap();

        let summaries = store.list_snapshots().await.unwrap();
        assert_eq!(summaries.len(), 2);
        assert_eq!(summaries[0].id, second);
        assert_eq!(summaries[1].id, first);
    }

    #[tokio::test]
    async fn deleted_snapshot_cannot_be_restored() {
        let tmp = tempfile::tempdir().unwrap();
        let sink = Arc::new(RecordingSink::new());
        let store = SnapshotStore::new(
            tmp.path().join("snapshots"),
            Arc::new(mcp_hostd_core::NoServices),
            sink.clone(),
        );
        let id = store.create_snapshot("gone soon", &[]).await.unwrap();
        store.delete_snapshot(&id).await.unwrap();
        assert!(store.restore_snapshot(&id).await.is_err());

        let events = sink.events.lock();
        assert!(events
            .iter()
            .any(|e| e.event == AuditKind::SnapshotDeleted));
    }

    #[tokio::test]
    async fn malformed_ids_are_rejected() {
        let tmp = tempfile::tempdir().unwrap();
        let store = store_in(&tmp.path().join("snapshots"));
        let err = store.restore_snapshot("../../etc/passwd").await.unwrap_err();
        assert_eq!(err.code(), -32602);
        assert!(store.delete_snapshot("not-a-uuid").await.is_err());
    }

    #[tokio::test]
    async fn no_temporary_files_remain_after_create() {
        let tmp = tempfile::tempdir().unwrap();
        let dir = tmp.path().join("snapshots");
        let store = store_in(&dir);
        store.create_snapshot("x", &[]).await.unwrap();
        let leftovers: Vec<_> = std::fs::read_dir(&dir)
            .unwrap()
            .filter_map(|e| e.ok())
            .filter(|e| e.file_name().to_string_lossy().starts_with(".tmp-"))
            .collect();
        assert!(leftovers.is_empty());
    }

    #[tokio::test]
    async fn service_convergence_applies_only_divergent_states() {
        let tmp = tempfile::tempdir().unwrap();
        let recorded_ok = ServiceState {
            name: "sshd.service".into(),
            enabled: true,
            active: true,
        };
        let divergent = ServiceState {
            name: "nginx.service".into(),
            enabled: true,
            active: false,
        };
        let provider = Arc::new(FakeServices::new(vec![recorded_ok.clone(), divergent.clone()]));
        let store = SnapshotStore::new(
            tmp.path().join("snapshots"),
            provider.clone(),
            Arc::new(NullAuditSink),
        );
        let id = store.create_snapshot("services", &[]).await.unwrap();

        // nginx drifts: recorded active=false, now active=true
        provider.current.lock()[1].active = true;
        let report = store.restore_snapshot(&id).await.unwrap();
        assert_eq!(report.services_applied, 1);
        let applied = provider.applied.lock();
        assert_eq!(applied.len(), 1);
        assert_eq!(applied[0].name, "nginx.service");
        assert!(!applied[0].active);
    }
}
