//! Tool and resource descriptors as they appear in registry listings.

use serde::{Deserialize, Serialize};
use serde_json::Value;

/// A named, schema-bounded action exposed by a plugin. The `name` is the
/// registry key and must be globally unique across plugins.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct ToolDescriptor {
    pub name: String,
    pub description: String,
    #[serde(rename = "inputSchema")]
    pub input_schema: Value,
}

/// A named, read-only datum identified by URI.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct ResourceDescriptor {
    pub uri: String,
    pub name: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub description: Option<String>,
    #[serde(rename = "mimeType", default, skip_serializing_if = "Option::is_none")]
    pub mime_type: Option<String>,
}
