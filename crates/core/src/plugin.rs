//! The capability interface plugins implement to join the registry.

use crate::descriptor::{ResourceDescriptor, ToolDescriptor};
use crate::errors::Result;
use async_trait::async_trait;
use mcp_hostd_proto::methods::ToolCallResult;
use serde_json::{Map, Value};

/// A collaborator supplying a set of tools and resources. Descriptor
/// accessors are synchronous and must be cheap; handlers may suspend.
#[async_trait]
pub trait Plugin: Send + Sync {
    /// Registry key for this plugin; also the owner tag on its descriptors.
    fn name(&self) -> &str;

    /// One-time setup before the plugin's descriptors are published.
    async fn initialize(&self) -> Result<()> {
        Ok(())
    }

    /// Teardown on unregistration or server shutdown.
    async fn cleanup(&self) -> Result<()> {
        Ok(())
    }

    fn tools(&self) -> Vec<ToolDescriptor>;

    fn resources(&self) -> Vec<ResourceDescriptor>;

    /// Execute a tool this plugin declared. Arguments have already passed
    /// schema validation.
    async fn call_tool(&self, name: &str, args: &Map<String, Value>) -> Result<ToolCallResult>;

    /// Read a resource this plugin declared, returning its content.
    async fn read_resource(&self, uri: &str) -> Result<String>;
}
