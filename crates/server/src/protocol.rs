//! The JSON-RPC / MCP protocol state machine.
//!
//! Dispatch goes through a fixed-keyed table from method name to handler,
//! so adding a method never touches the dispatch core. The machine itself
//! owns no side effects; it delegates to the registry and the kernel.

use std::collections::HashMap;
use std::future::Future;
use std::pin::Pin;
use std::sync::{Arc, OnceLock};

use mcp_hostd_core::{validate_arguments, HostdError, Session};
use mcp_hostd_proto::envelope::{
    INVALID_REQUEST, METHOD_NOT_FOUND, NOT_INITIALIZED,
};
use mcp_hostd_proto::methods::{
    self, InitializeParams, InitializeResult, ServerCapabilities, ServerInfo,
};
use mcp_hostd_proto::{JsonRpcRequest, JsonRpcResponse};
use serde_json::{json, Map, Value};
use tracing::{debug, info};

use crate::kernel::SecurityKernel;
use crate::registry::PluginRegistry;

type HandlerFuture<'a> = Pin<Box<dyn Future<Output = Option<JsonRpcResponse>> + Send + 'a>>;
type MethodHandler = for<'a> fn(&'a McpDispatcher, JsonRpcRequest) -> HandlerFuture<'a>;

fn call_initialize<'a>(d: &'a McpDispatcher, req: JsonRpcRequest) -> HandlerFuture<'a> {
    Box::pin(d.handle_initialize(req))
}

fn call_initialized<'a>(d: &'a McpDispatcher, req: JsonRpcRequest) -> HandlerFuture<'a> {
    Box::pin(d.handle_initialized(req))
}

fn call_tools_list<'a>(d: &'a McpDispatcher, req: JsonRpcRequest) -> HandlerFuture<'a> {
    Box::pin(d.handle_tools_list(req))
}

fn call_tools_call<'a>(d: &'a McpDispatcher, req: JsonRpcRequest) -> HandlerFuture<'a> {
    Box::pin(d.handle_tools_call(req))
}

fn call_resources_list<'a>(d: &'a McpDispatcher, req: JsonRpcRequest) -> HandlerFuture<'a> {
    Box::pin(d.handle_resources_list(req))
}

fn call_resources_read<'a>(d: &'a McpDispatcher, req: JsonRpcRequest) -> HandlerFuture<'a> {
    Box::pin(d.handle_resources_read(req))
}

fn call_resources_subscribe<'a>(d: &'a McpDispatcher, req: JsonRpcRequest) -> HandlerFuture<'a> {
    Box::pin(d.handle_resources_subscribe(req))
}

fn call_completion<'a>(d: &'a McpDispatcher, req: JsonRpcRequest) -> HandlerFuture<'a> {
    Box::pin(d.handle_completion(req))
}

fn method_table() -> &'static HashMap<&'static str, MethodHandler> {
    static TABLE: OnceLock<HashMap<&'static str, MethodHandler>> = OnceLock::new();
    TABLE.get_or_init(|| {
        let mut table: HashMap<&'static str, MethodHandler> = HashMap::new();
        table.insert(methods::METHOD_INITIALIZE, call_initialize);
        table.insert(methods::METHOD_INITIALIZED, call_initialized);
        table.insert(methods::METHOD_TOOLS_LIST, call_tools_list);
        table.insert(methods::METHOD_TOOLS_CALL, call_tools_call);
        table.insert(methods::METHOD_RESOURCES_LIST, call_resources_list);
        table.insert(methods::METHOD_RESOURCES_READ, call_resources_read);
        table.insert(methods::METHOD_RESOURCES_SUBSCRIBE, call_resources_subscribe);
        table.insert(methods::METHOD_COMPLETION_COMPLETE, call_completion);
        table
    })
}

pub struct McpDispatcher {
    session: Arc<Session>,
    registry: Arc<PluginRegistry>,
    kernel: Arc<SecurityKernel>,
    server_name: String,
    server_version: String,
}

impl McpDispatcher {
    pub fn new(
        session: Arc<Session>,
        registry: Arc<PluginRegistry>,
        kernel: Arc<SecurityKernel>,
        server_name: impl Into<String>,
        server_version: impl Into<String>,
    ) -> Self {
        Self {
            session,
            registry,
            kernel,
            server_name: server_name.into(),
            server_version: server_version.into(),
        }
    }

    /// Route one decoded frame. `None` means the frame was a notification
    /// that produces no response.
    pub async fn dispatch_value(&self, value: Value) -> Option<JsonRpcResponse> {
        let Some(envelope) = value.as_object() else {
            return Some(JsonRpcResponse::error(
                None,
                INVALID_REQUEST,
                "Invalid Request",
            ));
        };
        let id = envelope.get("id").cloned();
        if envelope.get("jsonrpc").and_then(Value::as_str) != Some("2.0") {
            return Some(JsonRpcResponse::error(id, INVALID_REQUEST, "Invalid Request"));
        }
        let Some(method) = envelope.get("method").and_then(Value::as_str) else {
            return Some(JsonRpcResponse::error(id, INVALID_REQUEST, "Invalid Request"));
        };
        debug!(method, "dispatching request");

        if !self.session.is_initialized() && !methods::PRE_INIT_METHODS.contains(&method) {
            return Some(JsonRpcResponse::error(
                id,
                NOT_INITIALIZED,
                "Server not initialized",
            ));
        }

        let request = JsonRpcRequest {
            jsonrpc: Some("2.0".into()),
            id: id.clone(),
            method: method.to_string(),
            params: envelope.get("params").cloned(),
        };
        match method_table().get(method) {
            Some(handler) => handler(self, request).await,
            None => Some(JsonRpcResponse::error(
                id,
                METHOD_NOT_FOUND,
                "Method not found",
            )),
        }
    }

    async fn handle_initialize(&self, req: JsonRpcRequest) -> Option<JsonRpcResponse> {
        let id = req.id.clone();
        let params: InitializeParams = match parse_params(req.params) {
            Ok(params) => params,
            Err(e) => return Some(error_response(id, &HostdError::InvalidParams(e))),
        };
        if let Some(info) = params.client_info {
            info!(client = %info.name, client_version = %info.version, "client handshake");
            self.session.record_client(info);
        }
        let result = InitializeResult {
            protocol_version: methods::MCP_PROTOCOL_VERSION.to_string(),
            capabilities: ServerCapabilities::default(),
            server_info: ServerInfo {
                name: self.server_name.clone(),
                version: self.server_version.clone(),
            },
        };
        Some(JsonRpcResponse::result(id, json!(result)))
    }

    async fn handle_initialized(&self, req: JsonRpcRequest) -> Option<JsonRpcResponse> {
        self.session.mark_initialized();
        info!("client initialization complete");
        // pure notification when no id is given
        req.id
            .map(|id| JsonRpcResponse::result(Some(id), json!({})))
    }

    async fn handle_tools_list(&self, req: JsonRpcRequest) -> Option<JsonRpcResponse> {
        let tools = self.registry.list_tools();
        debug!(tool_count = tools.len(), "tools/list");
        Some(JsonRpcResponse::result(req.id, json!({ "tools": tools })))
    }

    async fn handle_tools_call(&self, req: JsonRpcRequest) -> Option<JsonRpcResponse> {
        let id = req.id.clone();
        let params = req.params.unwrap_or(Value::Null);
        let Some(name) = params.get("name").and_then(Value::as_str) else {
            return Some(error_response(
                id,
                &HostdError::InvalidParams("Missing tool name".into()),
            ));
        };
        let arguments: Map<String, Value> = match params.get("arguments") {
            None | Some(Value::Null) => Map::new(),
            Some(Value::Object(map)) => map.clone(),
            Some(_) => {
                return Some(error_response(
                    id,
                    &HostdError::InvalidParams("Arguments must be an object".into()),
                ));
            }
        };

        // schema violations never reach the handler
        if let Some((descriptor, _)) = self.registry.find_tool(name) {
            if let Err(e) = validate_arguments(&descriptor.input_schema, &arguments) {
                return Some(error_response(id, &e.into()));
            }
        }

        let context = json!({"tool": name, "arguments": arguments.clone()});
        let result = self
            .kernel
            .execute_with_audit(
                &format!("tools/call:{name}"),
                context,
                self.registry.execute_tool(name, &arguments),
            )
            .await;
        match result {
            Ok(outcome) => Some(JsonRpcResponse::result(id, json!(outcome))),
            Err(e) => Some(error_response(id, &e)),
        }
    }

    async fn handle_resources_list(&self, req: JsonRpcRequest) -> Option<JsonRpcResponse> {
        let resources = self.registry.list_resources();
        Some(JsonRpcResponse::result(
            req.id,
            json!({ "resources": resources }),
        ))
    }

    async fn handle_resources_read(&self, req: JsonRpcRequest) -> Option<JsonRpcResponse> {
        let id = req.id.clone();
        let params = req.params.unwrap_or(Value::Null);
        let Some(uri) = params.get("uri").and_then(Value::as_str) else {
            return Some(error_response(
                id,
                &HostdError::InvalidParams("Missing uri parameter".into()),
            ));
        };
        let context = json!({ "uri": uri });
        let result = self
            .kernel
            .execute_with_audit("resources/read", context, self.registry.read_resource(uri))
            .await;
        match result {
            Ok(content) => Some(JsonRpcResponse::result(id, json!({ "content": content }))),
            Err(e) => Some(error_response(id, &e)),
        }
    }

    /// The handshake advertises `resources.subscribe`; honored as a no-op.
    async fn handle_resources_subscribe(&self, req: JsonRpcRequest) -> Option<JsonRpcResponse> {
        Some(JsonRpcResponse::result(req.id, json!({})))
    }

    async fn handle_completion(&self, req: JsonRpcRequest) -> Option<JsonRpcResponse> {
        Some(JsonRpcResponse::result(req.id, methods::empty_completion()))
    }
}

fn parse_params<T: serde::de::DeserializeOwned>(params: Option<Value>) -> Result<T, String> {
    let value = match params {
        None | Some(Value::Null) => json!({}),
        Some(other) => other,
    };
    serde_json::from_value(value).map_err(|e| e.to_string())
}

/// Format a domain error as a response envelope; the innermost message is
/// preserved verbatim.
pub fn error_response(id: Option<Value>, err: &HostdError) -> JsonRpcResponse {
    JsonRpcResponse::error(id, err.code(), err.to_string())
}
