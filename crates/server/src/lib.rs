//! Server runtime: protocol state machine, plugin registry, audit kernel,
//! and the HTTP/WebSocket shell, assembled behind a builder.

pub mod http;
pub mod kernel;
pub mod protocol;
pub mod registry;

use std::sync::Arc;
use std::time::Duration;

use mcp_hostd_core::{AuditSink, Config, HostdError, NullAuditSink, Plugin, Result, Session};
use mcp_hostd_exec::CommandExecutor;
use tokio_util::sync::CancellationToken;
use tracing::info;

pub use crate::http::AppState;
pub use crate::kernel::SecurityKernel;
pub use crate::protocol::McpDispatcher;
pub use crate::registry::PluginRegistry;

/// Identity advertised in the MCP handshake.
pub const SERVER_NAME: &str = "mcp-hostd";

pub struct HostdServer {
    config: Arc<Config>,
    registry: Arc<PluginRegistry>,
    executor: Arc<CommandExecutor>,
    state: Arc<AppState>,
}

impl HostdServer {
    pub fn builder() -> HostdServerBuilder {
        HostdServerBuilder::default()
    }

    pub fn registry(&self) -> Arc<PluginRegistry> {
        Arc::clone(&self.registry)
    }

    pub fn dispatcher(&self) -> Arc<McpDispatcher> {
        Arc::clone(&self.state.dispatcher)
    }

    pub fn router(&self) -> axum::Router {
        http::router(Arc::clone(&self.state))
    }

    /// Bind and serve until the token is cancelled, then run the shutdown
    /// sequence.
    pub async fn serve(&self, shutdown: CancellationToken) -> Result<()> {
        let addr = self.config.bind_address();
        let listener = tokio::net::TcpListener::bind(&addr)
            .await
            .map_err(|e| HostdError::Configuration(format!("failed to bind {addr}: {e}")))?;
        info!(%addr, "listening");

        let app = self.router();
        axum::serve(listener, app)
            .with_graceful_shutdown(async move { shutdown.cancelled().await })
            .await
            .map_err(HostdError::Io)?;

        self.shutdown().await;
        Ok(())
    }

    /// Terminate tracked children, then run plugin cleanup hooks.
    pub async fn shutdown(&self) {
        info!("shutting down");
        self.executor.kill_all_processes().await;
        self.registry.cleanup().await;
        info!("shutdown complete");
    }
}

#[derive(Default)]
pub struct HostdServerBuilder {
    config: Option<Config>,
    audit: Option<Arc<dyn AuditSink>>,
    executor: Option<Arc<CommandExecutor>>,
    plugins: Vec<Arc<dyn Plugin>>,
}

impl HostdServerBuilder {
    pub fn with_config(mut self, config: Config) -> Self {
        self.config = Some(config);
        self
    }

    pub fn with_audit_sink(mut self, audit: Arc<dyn AuditSink>) -> Self {
        self.audit = Some(audit);
        self
    }

    pub fn with_executor(mut self, executor: Arc<CommandExecutor>) -> Self {
        self.executor = Some(executor);
        self
    }

    pub fn with_plugin(mut self, plugin: Arc<dyn Plugin>) -> Self {
        self.plugins.push(plugin);
        self
    }

    pub async fn build(self) -> Result<HostdServer> {
        let config = self.config.unwrap_or_default();
        config.validate()?;
        let config = Arc::new(config);

        let audit = self
            .audit
            .unwrap_or_else(|| Arc::new(NullAuditSink) as Arc<dyn AuditSink>);
        let executor = self.executor.unwrap_or_else(|| {
            Arc::new(CommandExecutor::new(
                config.security.allowed_commands.clone(),
                Duration::from_millis(config.security.command_timeout),
            ))
        });

        let registry = Arc::new(PluginRegistry::new());
        for plugin in self.plugins {
            registry.register(plugin).await?;
        }

        let session = Arc::new(Session::new());
        let kernel = Arc::new(SecurityKernel::new(
            config.security.max_concurrent_operations,
            Arc::clone(&audit),
            config.security.audit_all,
        ));
        let dispatcher = Arc::new(McpDispatcher::new(
            session,
            Arc::clone(&registry),
            kernel,
            SERVER_NAME,
            env!("CARGO_PKG_VERSION"),
        ));
        let state = Arc::new(AppState {
            dispatcher,
            registry: Arc::clone(&registry),
            server_version: env!("CARGO_PKG_VERSION").to_string(),
        });

        Ok(HostdServer {
            config,
            registry,
            executor,
            state,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use async_trait::async_trait;
    use mcp_hostd_core::{ResourceDescriptor, ToolDescriptor};
    use mcp_hostd_proto::methods::ToolCallResult;
    use serde_json::{json, Map, Value};
    use std::time::Instant;

    struct EchoPlugin;

    #[async_trait]
    impl Plugin for EchoPlugin {
        fn name(&self) -> &str {
            "echo"
        }

        fn tools(&self) -> Vec<ToolDescriptor> {
            vec![ToolDescriptor {
                name: "echo".into(),
                description: "Echo text back".into(),
                input_schema: json!({
                    "type": "object",
                    "properties": {
                        "text": {"type": "string", "description": "Text to echo"}
                    },
                    "required": ["text"]
                }),
            }]
        }

        fn resources(&self) -> Vec<ResourceDescriptor> {
            vec![ResourceDescriptor {
                uri: "test://echo".into(),
                name: "Echo state".into(),
                description: None,
                mime_type: Some("text/plain".into()),
            }]
        }

        async fn call_tool(
            &self,
            _name: &str,
            args: &Map<String, Value>,
        ) -> Result<ToolCallResult> {
            let text = args.get("text").and_then(Value::as_str).unwrap_or_default();
            Ok(ToolCallResult::text(text))
        }

        async fn read_resource(&self, _uri: &str) -> Result<String> {
            Ok("echo ready".to_string())
        }
    }

    struct SleepyPlugin;

    #[async_trait]
    impl Plugin for SleepyPlugin {
        fn name(&self) -> &str {
            "sleepy"
        }

        fn tools(&self) -> Vec<ToolDescriptor> {
            vec![ToolDescriptor {
                name: "nap".into(),
                description: "Sleep for a bit".into(),
                input_schema: json!({"type": "object", "properties": {}}),
            }]
        }

        fn resources(&self) -> Vec<ResourceDescriptor> {
            Vec::new()
        }

        async fn call_tool(
            &self,
            _name: &str,
            _args: &Map<String, Value>,
        ) -> Result<ToolCallResult> {
            tokio::time::sleep(Duration::from_millis(200)).await;
            Ok(ToolCallResult::text("rested"))
        }

        async fn read_resource(&self, uri: &str) -> Result<String> {
            Err(HostdError::Internal(format!("Resource not found: {uri}")))
        }
    }

    async fn server_with_echo() -> HostdServer {
        HostdServer::builder()
            .with_plugin(Arc::new(EchoPlugin))
            .build()
            .await
            .unwrap()
    }

    async fn dispatch(
        server: &HostdServer,
        value: Value,
    ) -> Option<mcp_hostd_proto::JsonRpcResponse> {
        server.state.dispatcher.dispatch_value(value).await
    }

    async fn handshake(server: &HostdServer) {
        let init = dispatch(
            server,
            json!({"jsonrpc": "2.0", "method": "initialize", "id": 0,
                   "params": {"clientInfo": {"name": "test", "version": "0.0"}}}),
        )
        .await
        .unwrap();
        assert!(init.error.is_none());
        dispatch(
            server,
            json!({"jsonrpc": "2.0", "method": "initialized", "id": 1}),
        )
        .await
        .unwrap();
    }

    #[tokio::test]
    async fn dispatch_before_handshake_is_rejected() {
        let server = server_with_echo().await;
        let resp = dispatch(
            &server,
            json!({"jsonrpc": "2.0", "method": "tools/list", "id": 1}),
        )
        .await
        .unwrap();
        assert_eq!(resp.error.as_ref().unwrap().code, -32002);
        assert_eq!(resp.id, json!(1));
        assert!(resp.result.is_none());
    }

    #[tokio::test]
    async fn unknown_method_before_handshake_is_still_gated() {
        let server = server_with_echo().await;
        let resp = dispatch(&server, json!({"jsonrpc": "2.0", "method": "nope", "id": 2}))
            .await
            .unwrap();
        assert_eq!(resp.error.unwrap().code, -32002);
    }

    #[tokio::test]
    async fn wrong_protocol_tag_is_invalid_request() {
        let server = server_with_echo().await;
        let resp = dispatch(
            &server,
            json!({"jsonrpc": "1.0", "method": "initialize", "id": 9}),
        )
        .await
        .unwrap();
        assert_eq!(resp.error.unwrap().code, -32600);
        assert_eq!(resp.id, json!(9));
    }

    #[tokio::test]
    async fn non_object_envelope_is_invalid_request_with_null_id() {
        let server = server_with_echo().await;
        let resp = dispatch(&server, json!([1, 2, 3])).await.unwrap();
        assert_eq!(resp.error.unwrap().code, -32600);
        assert_eq!(resp.id, Value::Null);
    }

    #[tokio::test]
    async fn handshake_result_has_the_advertised_shape() {
        let server = server_with_echo().await;
        let resp = dispatch(
            &server,
            json!({"jsonrpc": "2.0", "method": "initialize", "id": 1, "params": {}}),
        )
        .await
        .unwrap();
        let result = resp.result.unwrap();
        assert_eq!(result["protocolVersion"], "2024-11-05");
        assert_eq!(result["capabilities"]["tools"]["listChanged"], true);
        assert_eq!(result["capabilities"]["resources"]["subscribe"], true);
        assert_eq!(result["capabilities"]["prompts"]["listChanged"], true);
        assert_eq!(result["serverInfo"]["name"], SERVER_NAME);
    }

    #[tokio::test]
    async fn initialized_without_id_is_a_silent_notification() {
        let server = server_with_echo().await;
        dispatch(
            &server,
            json!({"jsonrpc": "2.0", "method": "initialize", "id": 1}),
        )
        .await
        .unwrap();
        let resp = dispatch(&server, json!({"jsonrpc": "2.0", "method": "initialized"})).await;
        assert!(resp.is_none());

        // the flag was still set
        let resp = dispatch(
            &server,
            json!({"jsonrpc": "2.0", "method": "tools/list", "id": 2}),
        )
        .await
        .unwrap();
        assert!(resp.error.is_none());
    }

    #[tokio::test]
    async fn tools_list_returns_registered_descriptors() {
        let server = server_with_echo().await;
        handshake(&server).await;
        let resp = dispatch(
            &server,
            json!({"jsonrpc": "2.0", "method": "tools/list", "id": 3}),
        )
        .await
        .unwrap();
        let tools = resp.result.unwrap()["tools"].as_array().unwrap().clone();
        assert_eq!(tools.len(), 1);
        assert_eq!(tools[0]["name"], "echo");
        assert!(tools[0]["inputSchema"].is_object());
    }

    #[tokio::test]
    async fn tools_call_round_trips_through_the_handler() {
        let server = server_with_echo().await;
        handshake(&server).await;
        let resp = dispatch(
            &server,
            json!({"jsonrpc": "2.0", "method": "tools/call", "id": 4,
                   "params": {"name": "echo", "arguments": {"text": "ping"}}}),
        )
        .await
        .unwrap();
        let result = resp.result.unwrap();
        assert_eq!(result["content"][0]["type"], "text");
        assert_eq!(result["content"][0]["text"], "ping");
    }

    #[tokio::test]
    async fn schema_violation_yields_invalid_params() {
        let server = server_with_echo().await;
        handshake(&server).await;
        let resp = dispatch(
            &server,
            json!({"jsonrpc": "2.0", "method": "tools/call", "id": 5,
                   "params": {"name": "echo", "arguments": {"text": 42}}}),
        )
        .await
        .unwrap();
        assert_eq!(resp.error.unwrap().code, -32602);
    }

    #[tokio::test]
    async fn missing_tool_name_yields_invalid_params() {
        let server = server_with_echo().await;
        handshake(&server).await;
        let resp = dispatch(
            &server,
            json!({"jsonrpc": "2.0", "method": "tools/call", "id": 6, "params": {}}),
        )
        .await
        .unwrap();
        assert_eq!(resp.error.unwrap().code, -32602);
    }

    #[tokio::test]
    async fn unknown_tool_surfaces_as_internal_error() {
        let server = server_with_echo().await;
        handshake(&server).await;
        let resp = dispatch(
            &server,
            json!({"jsonrpc": "2.0", "method": "tools/call", "id": 7,
                   "params": {"name": "missing"}}),
        )
        .await
        .unwrap();
        let error = resp.error.unwrap();
        assert_eq!(error.code, -32603);
        assert!(error.message.contains("Tool not found: missing"));
    }

    #[tokio::test]
    async fn resources_read_returns_content() {
        let server = server_with_echo().await;
        handshake(&server).await;
        let resp = dispatch(
            &server,
            json!({"jsonrpc": "2.0", "method": "resources/read", "id": 8,
                   "params": {"uri": "test://echo"}}),
        )
        .await
        .unwrap();
        assert_eq!(resp.result.unwrap()["content"], "echo ready");
    }

    #[tokio::test]
    async fn resources_read_without_uri_is_invalid_params() {
        let server = server_with_echo().await;
        handshake(&server).await;
        let resp = dispatch(
            &server,
            json!({"jsonrpc": "2.0", "method": "resources/read", "id": 9, "params": {}}),
        )
        .await
        .unwrap();
        assert_eq!(resp.error.unwrap().code, -32602);
    }

    #[tokio::test]
    async fn subscribe_is_a_noop_success() {
        let server = server_with_echo().await;
        handshake(&server).await;
        let resp = dispatch(
            &server,
            json!({"jsonrpc": "2.0", "method": "resources/subscribe", "id": 10,
                   "params": {"uri": "test://echo"}}),
        )
        .await
        .unwrap();
        assert!(resp.error.is_none());
    }

    #[tokio::test]
    async fn completion_works_before_handshake() {
        let server = server_with_echo().await;
        let resp = dispatch(
            &server,
            json!({"jsonrpc": "2.0", "method": "completion/complete", "id": 11}),
        )
        .await
        .unwrap();
        let result = resp.result.unwrap();
        assert_eq!(result["completion"]["total"], 0);
        assert_eq!(result["completion"]["hasMore"], false);
    }

    #[tokio::test]
    async fn unknown_method_after_handshake_is_method_not_found() {
        let server = server_with_echo().await;
        handshake(&server).await;
        let resp = dispatch(&server, json!({"jsonrpc": "2.0", "method": "nope", "id": 12}))
            .await
            .unwrap();
        assert_eq!(resp.error.unwrap().code, -32601);
    }

    #[tokio::test]
    async fn every_response_carries_exactly_one_of_result_or_error() {
        let server = server_with_echo().await;
        handshake(&server).await;
        let frames = vec![
            json!({"jsonrpc": "2.0", "method": "tools/list", "id": 1}),
            json!({"jsonrpc": "2.0", "method": "nope", "id": 2}),
            json!({"jsonrpc": "1.0", "method": "tools/list", "id": 3}),
            json!({"jsonrpc": "2.0", "method": "tools/call", "id": 4, "params": {}}),
        ];
        for frame in frames {
            let resp = dispatch(&server, frame).await.unwrap();
            assert!(resp.result.is_some() ^ resp.error.is_some());
        }
    }

    #[tokio::test]
    async fn admission_saturation_rejects_the_overlapping_call() {
        let config = {
            let mut config = Config::default();
            config.security.max_concurrent_operations = 1;
            config
        };
        let server = Arc::new(
            HostdServer::builder()
                .with_config(config)
                .with_plugin(Arc::new(SleepyPlugin))
                .build()
                .await
                .unwrap(),
        );
        handshake(&server).await;

        let first = {
            let server = Arc::clone(&server);
            tokio::spawn(async move {
                dispatch(
                    &server,
                    json!({"jsonrpc": "2.0", "method": "tools/call", "id": 1,
                           "params": {"name": "nap"}}),
                )
                .await
                .unwrap()
            })
        };
        // give the first call time to take the permit
        tokio::time::sleep(Duration::from_millis(50)).await;

        let started = Instant::now();
        let second = dispatch(
            &server,
            json!({"jsonrpc": "2.0", "method": "tools/call", "id": 2,
                   "params": {"name": "nap"}}),
        )
        .await
        .unwrap();
        assert!(started.elapsed() < Duration::from_millis(5));
        assert_eq!(second.error.unwrap().code, -30001);

        let first = first.await.unwrap();
        assert!(first.error.is_none());
    }

    #[tokio::test]
    async fn colliding_registration_leaves_registry_untouched() {
        let server = server_with_echo().await;
        let before_tools = server.registry.list_tools().len();
        let before_plugins = server.registry.list_plugins();

        struct EchoAgain;

        #[async_trait]
        impl Plugin for EchoAgain {
            fn name(&self) -> &str {
                "echo-again"
            }

            fn tools(&self) -> Vec<ToolDescriptor> {
                vec![
                    ToolDescriptor {
                        name: "fresh".into(),
                        description: "A new tool".into(),
                        input_schema: json!({"type": "object"}),
                    },
                    ToolDescriptor {
                        name: "echo".into(),
                        description: "Colliding tool".into(),
                        input_schema: json!({"type": "object"}),
                    },
                ]
            }

            fn resources(&self) -> Vec<ResourceDescriptor> {
                Vec::new()
            }

            async fn call_tool(
                &self,
                _name: &str,
                _args: &Map<String, Value>,
            ) -> Result<ToolCallResult> {
                Ok(ToolCallResult::text(""))
            }

            async fn read_resource(&self, uri: &str) -> Result<String> {
                Err(HostdError::Internal(format!("Resource not found: {uri}")))
            }
        }

        let err = server.registry.register(Arc::new(EchoAgain)).await;
        assert!(err.is_err());
        assert_eq!(server.registry.list_tools().len(), before_tools);
        assert_eq!(server.registry.list_plugins(), before_plugins);
        assert!(server.registry.find_tool("fresh").is_none());
    }

    #[tokio::test]
    async fn register_unregister_round_trip_restores_state() {
        let server = server_with_echo().await;
        let tools_before = server.registry.list_tools().len();
        let resources_before = server.registry.list_resources().len();
        let plugins_before = server.registry.list_plugins();

        struct Extra;

        #[async_trait]
        impl Plugin for Extra {
            fn name(&self) -> &str {
                "extra"
            }

            fn tools(&self) -> Vec<ToolDescriptor> {
                vec![ToolDescriptor {
                    name: "extra_tool".into(),
                    description: "Temporary".into(),
                    input_schema: json!({"type": "object"}),
                }]
            }

            fn resources(&self) -> Vec<ResourceDescriptor> {
                vec![ResourceDescriptor {
                    uri: "extra://state".into(),
                    name: "Extra".into(),
                    description: None,
                    mime_type: None,
                }]
            }

            async fn call_tool(
                &self,
                _name: &str,
                _args: &Map<String, Value>,
            ) -> Result<ToolCallResult> {
                Ok(ToolCallResult::text(""))
            }

            async fn read_resource(&self, _uri: &str) -> Result<String> {
                Ok(String::new())
            }
        }

        server.registry.register(Arc::new(Extra)).await.unwrap();
        assert_eq!(server.registry.list_tools().len(), tools_before + 1);

        server.registry.unregister("extra").await.unwrap();
        assert_eq!(server.registry.list_tools().len(), tools_before);
        assert_eq!(server.registry.list_resources().len(), resources_before);
        assert_eq!(server.registry.list_plugins(), plugins_before);
    }
}
