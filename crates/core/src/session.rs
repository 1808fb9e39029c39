//! Process-wide MCP session state.

use mcp_hostd_proto::methods::ClientInfo;
use parking_lot::RwLock;

#[derive(Default)]
struct SessionState {
    initialized: bool,
    client_info: Option<ClientInfo>,
}

/// Single-entry session shared by every transport. Created at process
/// start, mutated only by the `initialize`/`initialized` handshake.
#[derive(Default)]
pub struct Session {
    state: RwLock<SessionState>,
}

impl Session {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn is_initialized(&self) -> bool {
        self.state.read().initialized
    }

    pub fn mark_initialized(&self) {
        self.state.write().initialized = true;
    }

    /// Record the client identity; written once, later handshakes do not
    /// overwrite it.
    pub fn record_client(&self, info: ClientInfo) {
        let mut state = self.state.write();
        if state.client_info.is_none() {
            state.client_info = Some(info);
        }
    }

    pub fn client_info(&self) -> Option<ClientInfo> {
        self.state.read().client_info.clone()
    }
}
