//! Shared fixtures for exercising the composed daemon, plus end-to-end
//! tests over the HTTP adapter and the full tool path.

use async_trait::async_trait;
use mcp_hostd_core::{
    AuditEvent, AuditSink, HostdError, Plugin, ResourceDescriptor, Result, ServiceState,
    ServiceStateProvider, ToolDescriptor,
};
use mcp_hostd_proto::methods::ToolCallResult;
use parking_lot::Mutex;
use serde_json::{json, Map, Value};

/// Audit sink that retains every event for assertions.
#[derive(Default)]
pub struct RecordingAuditSink {
    events: Mutex<Vec<AuditEvent>>,
}

impl RecordingAuditSink {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn events(&self) -> Vec<AuditEvent> {
        self.events.lock().clone()
    }
}

impl AuditSink for RecordingAuditSink {
    fn audit(&self, event: &AuditEvent) {
        self.events.lock().push(event.clone());
    }
}

/// Provider over a fixed in-memory state table, recording applied
/// transitions.
pub struct StaticServiceStates {
    pub current: Mutex<Vec<ServiceState>>,
    pub applied: Mutex<Vec<ServiceState>>,
}

impl StaticServiceStates {
    pub fn new(current: Vec<ServiceState>) -> Self {
        Self {
            current: Mutex::new(current),
            applied: Mutex::new(Vec::new()),
        }
    }
}

#[async_trait]
impl ServiceStateProvider for StaticServiceStates {
    async fn capture(&self) -> Result<Vec<ServiceState>> {
        Ok(self.current.lock().clone())
    }

    async fn apply(&self, state: &ServiceState) -> Result<()> {
        self.applied.lock().push(state.clone());
        Ok(())
    }
}

/// Minimal plugin with one string-typed tool and one resource.
pub struct EchoPlugin;

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

    async fn call_tool(&self, _name: &str, args: &Map<String, Value>) -> Result<ToolCallResult> {
        let text = args.get("text").and_then(Value::as_str).unwrap_or_default();
        Ok(ToolCallResult::text(text))
    }

    async fn read_resource(&self, uri: &str) -> Result<String> {
        if uri == "test://echo" {
            Ok("echo ready".to_string())
        } else {
            Err(HostdError::Internal(format!("Resource not found: {uri}")))
        }
    }
}
