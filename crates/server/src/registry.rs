//! Namespace for tool and resource descriptors across plugins.

use std::collections::{HashMap, HashSet};
use std::sync::Arc;

use mcp_hostd_core::{
    HostdError, Plugin, ResourceDescriptor, Result, ToolDescriptor,
};
use mcp_hostd_proto::methods::ToolCallResult;
use parking_lot::RwLock;
use serde_json::{Map, Value};
use tracing::{info, warn};

struct ToolEntry {
    descriptor: ToolDescriptor,
    owner: String,
}

struct ResourceEntry {
    descriptor: ResourceDescriptor,
    owner: String,
}

#[derive(Default)]
struct Inner {
    tools: HashMap<String, ToolEntry>,
    resources: HashMap<String, ResourceEntry>,
    plugins: HashMap<String, Arc<dyn Plugin>>,
}

/// Shared mutable registry. Registration and unregistration are exclusive
/// with listing and dispatch through a read-write lock; handler invocation
/// happens outside the lock on a cloned plugin handle.
#[derive(Default)]
pub struct PluginRegistry {
    inner: RwLock<Inner>,
}

impl PluginRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Initialize the plugin, then atomically publish its descriptors. Any
    /// tool-name or URI collision aborts the whole registration; nothing
    /// from the colliding plugin is retained.
    pub async fn register(&self, plugin: Arc<dyn Plugin>) -> Result<()> {
        plugin.initialize().await?;
        let name = plugin.name().to_string();
        let tools = plugin.tools();
        let resources = plugin.resources();

        let mut inner = self.inner.write();
        if inner.plugins.contains_key(&name) {
            return Err(HostdError::Configuration(format!(
                "plugin already registered: {name}"
            )));
        }
        let mut incoming_tools = HashSet::new();
        for tool in &tools {
            if inner.tools.contains_key(&tool.name) || !incoming_tools.insert(tool.name.clone()) {
                return Err(HostdError::Configuration(format!(
                    "tool already registered: {}",
                    tool.name
                )));
            }
        }
        let mut incoming_uris = HashSet::new();
        for resource in &resources {
            if inner.resources.contains_key(&resource.uri)
                || !incoming_uris.insert(resource.uri.clone())
            {
                return Err(HostdError::Configuration(format!(
                    "resource already registered: {}",
                    resource.uri
                )));
            }
        }

        for descriptor in tools {
            inner.tools.insert(
                descriptor.name.clone(),
                ToolEntry {
                    descriptor,
                    owner: name.clone(),
                },
            );
        }
        for descriptor in resources {
            inner.resources.insert(
                descriptor.uri.clone(),
                ResourceEntry {
                    descriptor,
                    owner: name.clone(),
                },
            );
        }
        inner.plugins.insert(name.clone(), plugin);
        info!(plugin = %name, "registered plugin");
        Ok(())
    }

    /// Remove exactly the entries the plugin owns, then run its cleanup
    /// hook.
    pub async fn unregister(&self, name: &str) -> Result<()> {
        let plugin = {
            let mut inner = self.inner.write();
            let plugin = inner
                .plugins
                .remove(name)
                .ok_or_else(|| HostdError::Internal(format!("plugin not found: {name}")))?;
            inner.tools.retain(|_, entry| entry.owner != name);
            inner.resources.retain(|_, entry| entry.owner != name);
            plugin
        };
        plugin.cleanup().await?;
        info!(plugin = %name, "unregistered plugin");
        Ok(())
    }

    pub fn list_tools(&self) -> Vec<ToolDescriptor> {
        let inner = self.inner.read();
        let mut tools: Vec<_> = inner
            .tools
            .values()
            .map(|entry| entry.descriptor.clone())
            .collect();
        tools.sort_by(|a, b| a.name.cmp(&b.name));
        tools
    }

    pub fn list_resources(&self) -> Vec<ResourceDescriptor> {
        let inner = self.inner.read();
        let mut resources: Vec<_> = inner
            .resources
            .values()
            .map(|entry| entry.descriptor.clone())
            .collect();
        resources.sort_by(|a, b| a.uri.cmp(&b.uri));
        resources
    }

    pub fn list_plugins(&self) -> Vec<String> {
        let mut names: Vec<_> = self.inner.read().plugins.keys().cloned().collect();
        names.sort();
        names
    }

    pub fn find_tool(&self, name: &str) -> Option<(ToolDescriptor, Arc<dyn Plugin>)> {
        let inner = self.inner.read();
        let entry = inner.tools.get(name)?;
        let plugin = inner.plugins.get(&entry.owner)?;
        Some((entry.descriptor.clone(), Arc::clone(plugin)))
    }

    pub fn find_resource(&self, uri: &str) -> Option<(ResourceDescriptor, Arc<dyn Plugin>)> {
        let inner = self.inner.read();
        let entry = inner.resources.get(uri)?;
        let plugin = inner.plugins.get(&entry.owner)?;
        Some((entry.descriptor.clone(), Arc::clone(plugin)))
    }

    pub async fn execute_tool(&self, name: &str, args: &Map<String, Value>) -> Result<ToolCallResult> {
        let (_, plugin) = self
            .find_tool(name)
            .ok_or_else(|| HostdError::Internal(format!("Tool not found: {name}")))?;
        plugin.call_tool(name, args).await
    }

    pub async fn read_resource(&self, uri: &str) -> Result<String> {
        let (_, plugin) = self
            .find_resource(uri)
            .ok_or_else(|| HostdError::Internal(format!("Resource not found: {uri}")))?;
        plugin.read_resource(uri).await
    }

    /// Run every plugin's cleanup hook and empty the registry; invoked at
    /// shutdown.
    pub async fn cleanup(&self) {
        let plugins: Vec<_> = {
            let mut inner = self.inner.write();
            inner.tools.clear();
            inner.resources.clear();
            inner.plugins.drain().collect()
        };
        for (name, plugin) in plugins {
            if let Err(e) = plugin.cleanup().await {
                warn!(plugin = %name, error = %e, "plugin cleanup failed");
            }
        }
    }
}
