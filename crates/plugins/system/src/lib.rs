//! Built-in plugin exposing safe command execution and the snapshot
//! substrate as MCP tools, plus host-state resources.

use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use mcp_hostd_core::{
    HostdError, Plugin, ResourceDescriptor, Result, ServiceStateProvider, ToolDescriptor,
};
use mcp_hostd_exec::{CommandExecutor, ExecOptions};
use mcp_hostd_proto::methods::ToolCallResult;
use mcp_hostd_snapshot::SnapshotStore;
use serde_json::{json, Map, Value};
use tracing::info;

pub const TOOL_SYSTEM_EXEC: &str = "system_exec";
pub const TOOL_SYSTEM_SNAPSHOT: &str = "system_snapshot";
pub const TOOL_SYSTEM_ROLLBACK: &str = "system_rollback";
pub const TOOL_SYSTEM_SNAPSHOTS_LIST: &str = "system_snapshots_list";

pub const RESOURCE_SYSTEM_INFO: &str = "system://info";
pub const RESOURCE_SYSTEM_LOGS: &str = "system://logs";
pub const RESOURCE_SYSTEM_SERVICES: &str = "system://services";
pub const RESOURCE_SYSTEM_SNAPSHOTS: &str = "system://snapshots";

/// Byte ceiling for the `system://logs` tail.
const LOG_TAIL_BYTES: usize = 64 * 1024;

pub struct SystemPlugin {
    executor: Arc<CommandExecutor>,
    snapshots: Arc<SnapshotStore>,
    services: Arc<dyn ServiceStateProvider>,
    log_dir: PathBuf,
}

impl SystemPlugin {
    pub fn new(
        executor: Arc<CommandExecutor>,
        snapshots: Arc<SnapshotStore>,
        services: Arc<dyn ServiceStateProvider>,
        log_dir: impl Into<PathBuf>,
    ) -> Self {
        Self {
            executor,
            snapshots,
            services,
            log_dir: log_dir.into(),
        }
    }

    /// Tail of the most recently written log file; empty when the log
    /// directory holds nothing yet.
    async fn recent_logs(&self) -> Result<String> {
        let mut entries = match tokio::fs::read_dir(&self.log_dir).await {
            Ok(entries) => entries,
            Err(_) => return Ok(String::new()),
        };
        let mut newest: Option<(std::time::SystemTime, PathBuf)> = None;
        while let Some(entry) = entries.next_entry().await? {
            let path = entry.path();
            if path.extension().and_then(|s| s.to_str()) != Some("log") {
                continue;
            }
            let Ok(meta) = entry.metadata().await else {
                continue;
            };
            let modified = meta
                .modified()
                .unwrap_or(std::time::SystemTime::UNIX_EPOCH);
            if newest.as_ref().map(|(ts, _)| modified > *ts).unwrap_or(true) {
                newest = Some((modified, path));
            }
        }
        let Some((_, path)) = newest else {
            return Ok(String::new());
        };
        let raw = tokio::fs::read(&path).await?;
        let start = raw.len().saturating_sub(LOG_TAIL_BYTES);
        Ok(String::from_utf8_lossy(&raw[start..]).into_owned())
    }

    async fn exec_tool(&self, args: &Map<String, Value>) -> Result<ToolCallResult> {
        let command = args
            .get("command")
            .and_then(Value::as_str)
            .ok_or_else(|| HostdError::InvalidParams("Missing command".into()))?;
        let command_args: Vec<String> = args
            .get("args")
            .and_then(Value::as_array)
            .map(|items| {
                items
                    .iter()
                    .filter_map(Value::as_str)
                    .map(str::to_string)
                    .collect()
            })
            .unwrap_or_default();
        let require_root = args
            .get("require_root")
            .and_then(Value::as_bool)
            .unwrap_or(false);
        let options = match args.get("timeout").and_then(Value::as_u64) {
            Some(seconds) => ExecOptions::captured().with_timeout(Duration::from_secs(seconds)),
            None => ExecOptions::captured(),
        };

        let outcome = if require_root {
            self.executor
                .execute_with_elevation(command, &command_args, options)
                .await?
        } else {
            self.executor.execute(command, &command_args, options).await?
        };

        let metadata = json!({
            "exitCode": outcome.exit_code,
            "durationMs": outcome.duration.as_millis() as u64,
            "truncated": outcome.truncated,
        });
        let result = if outcome.success {
            ToolCallResult::text(outcome.stdout)
        } else {
            ToolCallResult::error(format!("Error: {}", outcome.stderr))
        };
        Ok(result.with_metadata(metadata))
    }

    async fn snapshot_tool(&self, args: &Map<String, Value>) -> Result<ToolCallResult> {
        let description = args
            .get("description")
            .and_then(Value::as_str)
            .ok_or_else(|| HostdError::InvalidParams("Missing snapshot description".into()))?;
        let files: Vec<PathBuf> = args
            .get("files")
            .and_then(Value::as_array)
            .map(|items| {
                items
                    .iter()
                    .filter_map(Value::as_str)
                    .map(PathBuf::from)
                    .collect()
            })
            .unwrap_or_default();
        let id = self.snapshots.create_snapshot(description, &files).await?;
        info!(snapshot_id = %id, "snapshot created via tool");
        Ok(ToolCallResult::text(id))
    }

    async fn rollback_tool(&self, args: &Map<String, Value>) -> Result<ToolCallResult> {
        let id = args
            .get("snapshot_id")
            .and_then(Value::as_str)
            .ok_or_else(|| HostdError::InvalidParams("Missing snapshot_id".into()))?;
        let report = self.snapshots.restore_snapshot(id).await?;
        Ok(
            ToolCallResult::text(format!("Rolled back to snapshot {id}"))
                .with_metadata(json!(report)),
        )
    }

    async fn snapshots_list_tool(&self) -> Result<ToolCallResult> {
        let summaries = self.snapshots.list_snapshots().await?;
        Ok(ToolCallResult::text(serde_json::to_string_pretty(
            &summaries,
        )?))
    }
}

#[async_trait]
impl Plugin for SystemPlugin {
    fn name(&self) -> &str {
        "system"
    }

    fn tools(&self) -> Vec<ToolDescriptor> {
        vec![
            ToolDescriptor {
                name: TOOL_SYSTEM_EXEC.into(),
                description: "Execute a system command with proper privilege handling".into(),
                input_schema: json!({
                    "type": "object",
                    "properties": {
                        "command": {
                            "type": "string",
                            "description": "Command to execute"
                        },
                        "args": {
                            "type": "array",
                            "items": {"type": "string"},
                            "description": "Command arguments"
                        },
                        "require_root": {
                            "type": "boolean",
                            "description": "Whether the command requires root privileges",
                            "default": false
                        },
                        "timeout": {
                            "type": "integer",
                            "description": "Timeout in seconds",
                            "minimum": 1,
                            "default": 300
                        }
                    },
                    "required": ["command"]
                }),
            },
            ToolDescriptor {
                name: TOOL_SYSTEM_SNAPSHOT.into(),
                description: "Create a system snapshot for rollback".into(),
                input_schema: json!({
                    "type": "object",
                    "properties": {
                        "description": {
                            "type": "string",
                            "description": "Snapshot description"
                        },
                        "files": {
                            "type": "array",
                            "items": {"type": "string"},
                            "description": "Files to include in the snapshot"
                        }
                    },
                    "required": ["description"]
                }),
            },
            ToolDescriptor {
                name: TOOL_SYSTEM_ROLLBACK.into(),
                description: "Roll back to a previous system snapshot".into(),
                input_schema: json!({
                    "type": "object",
                    "properties": {
                        "snapshot_id": {
                            "type": "string",
                            "description": "Snapshot ID to roll back to",
                            "pattern": "^[0-9a-fA-F-]{36}$"
                        }
                    },
                    "required": ["snapshot_id"]
                }),
            },
            ToolDescriptor {
                name: TOOL_SYSTEM_SNAPSHOTS_LIST.into(),
                description: "List available system snapshots".into(),
                input_schema: json!({"type": "object", "properties": {}}),
            },
        ]
    }

    fn resources(&self) -> Vec<ResourceDescriptor> {
        vec![
            ResourceDescriptor {
                uri: RESOURCE_SYSTEM_INFO.into(),
                name: "System Information".into(),
                description: Some("Current system information and status".into()),
                mime_type: Some("application/json".into()),
            },
            ResourceDescriptor {
                uri: RESOURCE_SYSTEM_LOGS.into(),
                name: "System Logs".into(),
                description: Some("Recent system logs".into()),
                mime_type: Some("text/plain".into()),
            },
            ResourceDescriptor {
                uri: RESOURCE_SYSTEM_SERVICES.into(),
                name: "Service Status".into(),
                description: Some("Status of tracked system services".into()),
                mime_type: Some("application/json".into()),
            },
            ResourceDescriptor {
                uri: RESOURCE_SYSTEM_SNAPSHOTS.into(),
                name: "System Snapshots".into(),
                description: Some("Available system snapshots for rollback".into()),
                mime_type: Some("application/json".into()),
            },
        ]
    }

    async fn call_tool(&self, name: &str, args: &Map<String, Value>) -> Result<ToolCallResult> {
        match name {
            TOOL_SYSTEM_EXEC => self.exec_tool(args).await,
            TOOL_SYSTEM_SNAPSHOT => self.snapshot_tool(args).await,
            TOOL_SYSTEM_ROLLBACK => self.rollback_tool(args).await,
            TOOL_SYSTEM_SNAPSHOTS_LIST => self.snapshots_list_tool().await,
            other => Err(HostdError::Internal(format!("Tool not found: {other}"))),
        }
    }

    async fn read_resource(&self, uri: &str) -> Result<String> {
        match uri {
            RESOURCE_SYSTEM_INFO => {
                let hostname = nix::unistd::gethostname()
                    .map(|h| h.to_string_lossy().into_owned())
                    .unwrap_or_default();
                let kernel = std::fs::read_to_string("/proc/sys/kernel/osrelease")
                    .map(|s| s.trim().to_string())
                    .unwrap_or_default();
                Ok(serde_json::to_string_pretty(&json!({
                    "hostname": hostname,
                    "kernel": kernel,
                    "pid": std::process::id(),
                }))?)
            }
            RESOURCE_SYSTEM_LOGS => self.recent_logs().await,
            RESOURCE_SYSTEM_SERVICES => {
                let states = self.services.capture().await?;
                Ok(serde_json::to_string_pretty(&states)?)
            }
            RESOURCE_SYSTEM_SNAPSHOTS => {
                let summaries = self.snapshots.list_snapshots().await?;
                Ok(serde_json::to_string_pretty(&summaries)?)
            }
            other => Err(HostdError::Internal(format!("Resource not found: {other}"))),
        }
    }
}
