//! Service-state capture and convergence, abstracted behind a provider.

use crate::errors::Result;
use async_trait::async_trait;
use serde::{Deserialize, Serialize};

/// Enabled/active state of one service unit at a point in time.
#[derive(Clone, Debug, Serialize, Deserialize, PartialEq, Eq)]
pub struct ServiceState {
    pub name: String,
    pub enabled: bool,
    pub active: bool,
}

/// Collaborator that reads and applies service state on the host. The
/// snapshot store captures through it and converges through it on restore.
#[async_trait]
pub trait ServiceStateProvider: Send + Sync {
    async fn capture(&self) -> Result<Vec<ServiceState>>;

    /// Drive the named service toward the given state.
    async fn apply(&self, state: &ServiceState) -> Result<()>;
}

/// Provider for hosts with no tracked services.
pub struct NoServices;

#[async_trait]
impl ServiceStateProvider for NoServices {
    async fn capture(&self) -> Result<Vec<ServiceState>> {
        Ok(Vec::new())
    }

    async fn apply(&self, _state: &ServiceState) -> Result<()> {
        Ok(())
    }
}
