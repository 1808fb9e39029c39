//! Wire-level types for the hostd control plane: JSON-RPC 2.0 envelopes,
//! the MCP method surface, and tool-result content.
//! No IO within this crate.

pub mod envelope;
pub mod methods;

pub use crate::envelope::{JsonRpcError, JsonRpcRequest, JsonRpcResponse};
pub use crate::methods::{
    ClientInfo, InitializeParams, InitializeResult, PromptsCapability, ResourcesCapability,
    ServerCapabilities, ServerInfo, ToolCallResult, ToolContent, ToolsCapability,
};
