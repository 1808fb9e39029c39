//! Service-state provider backed by systemctl.

use async_trait::async_trait;
use mcp_hostd_core::{Result, ServiceState, ServiceStateProvider};
use mcp_hostd_exec::{CommandExecutor, ExecOptions};
use std::sync::Arc;
use tracing::debug;

/// Captures and converges the enabled/active state of a configured set of
/// units. Transitions run through the executor with elevation, so the
/// daemon works both as root and via the elevation helper.
pub struct SystemdStates {
    executor: Arc<CommandExecutor>,
    units: Vec<String>,
}

impl SystemdStates {
    pub fn new(executor: Arc<CommandExecutor>, units: Vec<String>) -> Self {
        Self { executor, units }
    }

    async fn probe(&self, verb: &str, unit: &str) -> Result<bool> {
        let outcome = self
            .executor
            .execute(
                "systemctl",
                &[verb.to_string(), unit.to_string()],
                ExecOptions::captured(),
            )
            .await?;
        Ok(outcome.success)
    }

    async fn transition(&self, verb: &str, unit: &str) -> Result<()> {
        debug!(unit, verb, "service transition");
        self.executor
            .execute_with_elevation(
                "systemctl",
                &[verb.to_string(), unit.to_string()],
                ExecOptions::captured(),
            )
            .await?;
        Ok(())
    }
}

#[async_trait]
impl ServiceStateProvider for SystemdStates {
    async fn capture(&self) -> Result<Vec<ServiceState>> {
        let mut states = Vec::with_capacity(self.units.len());
        for unit in &self.units {
            states.push(ServiceState {
                name: unit.clone(),
                enabled: self.probe("is-enabled", unit).await?,
                active: self.probe("is-active", unit).await?,
            });
        }
        Ok(states)
    }

    async fn apply(&self, state: &ServiceState) -> Result<()> {
        self.transition(if state.enabled { "enable" } else { "disable" }, &state.name)
            .await?;
        self.transition(if state.active { "start" } else { "stop" }, &state.name)
            .await?;
        Ok(())
    }
}
