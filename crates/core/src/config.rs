//! Daemon configuration: TOML file plus `HOSTD_*` environment overrides.

use crate::errors::{HostdError, Result};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::path::{Path, PathBuf};

#[derive(Clone, Debug, Serialize, Deserialize, Default)]
#[serde(default)]
pub struct Config {
    pub server: ServerSection,
    pub logging: LoggingSection,
    pub security: SecuritySection,
    pub snapshots: SnapshotSection,
    pub plugins: BTreeMap<String, PluginSection>,
}

#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(default)]
pub struct ServerSection {
    pub host: String,
    pub port: u16,
}

impl Default for ServerSection {
    fn default() -> Self {
        Self {
            host: "localhost".to_string(),
            port: 8080,
        }
    }
}

#[derive(Clone, Copy, Debug, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum LogLevel {
    Error,
    Warn,
    Info,
    Debug,
}

impl LogLevel {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Error => "error",
            Self::Warn => "warn",
            Self::Info => "info",
            Self::Debug => "debug",
        }
    }

    pub fn parse(s: &str) -> Result<Self> {
        match s {
            "error" => Ok(Self::Error),
            "warn" => Ok(Self::Warn),
            "info" => Ok(Self::Info),
            "debug" => Ok(Self::Debug),
            other => Err(HostdError::Configuration(format!(
                "unknown log level '{other}'"
            ))),
        }
    }
}

#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(default)]
pub struct LoggingSection {
    pub level: LogLevel,
    pub log_dir: PathBuf,
    pub max_files: u32,
    pub max_size: u64,
}

impl Default for LoggingSection {
    fn default() -> Self {
        Self {
            level: LogLevel::Info,
            log_dir: PathBuf::from("/var/log/hostd"),
            max_files: 14,
            max_size: 10 * 1024 * 1024,
        }
    }
}

#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(default)]
pub struct SecuritySection {
    pub require_auth: bool,
    pub allowed_commands: Vec<String>,
    pub max_concurrent_operations: usize,
    /// Default child-process deadline in milliseconds.
    pub command_timeout: u64,
    pub audit_all: bool,
}

impl Default for SecuritySection {
    fn default() -> Self {
        Self {
            require_auth: true,
            allowed_commands: Vec::new(),
            max_concurrent_operations: 10,
            command_timeout: 300_000,
            audit_all: true,
        }
    }
}

#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(default)]
pub struct SnapshotSection {
    pub dir: PathBuf,
    /// systemd units whose enabled/active state is captured into snapshots.
    pub services: Vec<String>,
}

impl Default for SnapshotSection {
    fn default() -> Self {
        Self {
            dir: PathBuf::from("/var/lib/hostd/snapshots"),
            services: Vec::new(),
        }
    }
}

#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(default)]
pub struct PluginSection {
    pub enabled: bool,
    #[serde(flatten)]
    pub options: toml::value::Table,
}

impl Default for PluginSection {
    fn default() -> Self {
        Self {
            enabled: true,
            options: toml::value::Table::new(),
        }
    }
}

impl Config {
    /// Load configuration from an optional TOML file, then apply `HOSTD_*`
    /// environment overrides, then validate.
    pub fn load(path: Option<&Path>) -> Result<Self> {
        let mut config = match path {
            Some(p) => {
                let raw = std::fs::read_to_string(p)?;
                toml::from_str(&raw)
                    .map_err(|e| HostdError::Configuration(format!("{}: {e}", p.display())))?
            }
            None => Config::default(),
        };
        config.apply_env();
        config.validate()?;
        Ok(config)
    }

    fn apply_env(&mut self) {
        if let Ok(host) = std::env::var("HOSTD_HOST") {
            self.server.host = host;
        }
        if let Ok(port) = std::env::var("HOSTD_PORT") {
            if let Ok(port) = port.parse() {
                self.server.port = port;
            }
        }
        if let Ok(level) = std::env::var("HOSTD_LOG_LEVEL") {
            if let Ok(level) = LogLevel::parse(&level) {
                self.logging.level = level;
            }
        }
        if let Ok(dir) = std::env::var("HOSTD_LOG_DIR") {
            self.logging.log_dir = PathBuf::from(dir);
        }
        if let Ok(dir) = std::env::var("HOSTD_SNAPSHOT_DIR") {
            self.snapshots.dir = PathBuf::from(dir);
        }
        if let Ok(commands) = std::env::var("HOSTD_ALLOWED_COMMANDS") {
            self.security.allowed_commands = commands
                .split(',')
                .map(|s| s.trim().to_string())
                .filter(|s| !s.is_empty())
                .collect();
        }
        if let Ok(max_ops) = std::env::var("HOSTD_MAX_CONCURRENT_OPS") {
            if let Ok(max_ops) = max_ops.parse() {
                self.security.max_concurrent_operations = max_ops;
            }
        }
        if let Ok(timeout) = std::env::var("HOSTD_COMMAND_TIMEOUT_MS") {
            if let Ok(timeout) = timeout.parse() {
                self.security.command_timeout = timeout;
            }
        }
        if let Ok(auth) = std::env::var("HOSTD_REQUIRE_AUTH") {
            self.security.require_auth = auth.parse().unwrap_or(true);
        }
        if let Ok(audit) = std::env::var("HOSTD_AUDIT_ALL") {
            self.security.audit_all = audit.parse().unwrap_or(true);
        }
    }

    pub fn validate(&self) -> Result<()> {
        if self.server.port == 0 {
            return Err(HostdError::Configuration(
                "server.port must be in 1..=65535".to_string(),
            ));
        }
        if self.security.max_concurrent_operations < 1 {
            return Err(HostdError::Configuration(
                "security.max_concurrent_operations must be at least 1".to_string(),
            ));
        }
        if self.security.command_timeout < 1000 {
            return Err(HostdError::Configuration(
                "security.command_timeout must be at least 1000 ms".to_string(),
            ));
        }
        Ok(())
    }

    /// Whether a plugin is enabled; plugins absent from the table default on.
    pub fn plugin_enabled(&self, name: &str) -> bool {
        self.plugins.get(name).map(|p| p.enabled).unwrap_or(true)
    }

    pub fn bind_address(&self) -> String {
        format!("{}:{}", self.server.host, self.server.port)
    }
}
