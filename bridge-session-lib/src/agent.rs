//! The uniform backend contract
//!
//! Two backend families with divergent event vocabularies sit behind one
//! interface. The registry routes protocol calls through `dyn Agent`; the
//! variants share the permission evaluator, the converters' discipline, and
//! the persistence bridge, but own their execution handles independently.

use std::path::Path;
use std::sync::Arc;

use async_trait::async_trait;
use shared::{
    ClientCapabilities, ContentBlock, InitializeResponse, McpServerConfig, NewSessionResponse,
    PromptResponse,
};

use crate::error::BridgeError;
use crate::session::SessionState;

/// Which adapter variant serves a session.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum AdapterKind {
    /// CLI spawned and supervised by the bridge, stream-json over stdio.
    Subprocess,
    /// SDK-style thread handle over an externally owned stream.
    NativeStream,
}

impl AdapterKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            AdapterKind::Subprocess => "subprocess",
            AdapterKind::NativeStream => "native-stream",
        }
    }

    pub fn from_id(id: &str) -> Option<Self> {
        match id {
            "subprocess" => Some(AdapterKind::Subprocess),
            "native-stream" => Some(AdapterKind::NativeStream),
            _ => None,
        }
    }
}

impl std::fmt::Display for AdapterKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Caller-assembled options for `new_session`.
#[derive(Debug, Clone, Default)]
pub struct NewSessionOptions {
    /// Client-assigned session id; generated when absent.
    pub session_id: Option<String>,
    /// MCP servers to merge with the adapter's built-in tool bridge.
    pub mcp_servers: Vec<McpServerConfig>,
    /// Set to skip the built-in tool-bridge MCP server.
    pub disable_builtin_mcp: bool,
    /// Appended to the backend's default system prompt.
    pub system_prompt_append: Option<String>,
    /// External bookkeeping correlation id.
    pub task_run_id: Option<String>,
}

/// One coding-agent backend, uniform across variants.
#[async_trait]
pub trait Agent: Send + Sync {
    fn kind(&self) -> AdapterKind;

    /// Capability negotiation; pure, no session required.
    async fn initialize(&self, client_capabilities: ClientCapabilities) -> InitializeResponse;

    /// Complete an authentication method advertised by `initialize`.
    async fn authenticate(&self, method_id: &str) -> Result<(), BridgeError>;

    /// Start a backend execution handle bound to a new session.
    async fn new_session(
        &self,
        cwd: &Path,
        opts: NewSessionOptions,
    ) -> Result<NewSessionResponse, BridgeError>;

    /// Push a user turn and drive the backend stream to its terminal event.
    ///
    /// Must not be called again for the same session until the previous call
    /// returned; a violation fails with `PromptInFlight`.
    async fn prompt(
        &self,
        session_id: &str,
        content: Vec<ContentBlock>,
    ) -> Result<PromptResponse, BridgeError>;

    /// Flag the in-flight prompt for cancellation and request backend-level
    /// interruption. Never blocks on acknowledgement.
    async fn cancel(&self, session_id: &str) -> Result<(), BridgeError>;

    /// Reconfigure the session's model. Safe between prompts only.
    async fn set_session_model(&self, session_id: &str, model_id: &str)
        -> Result<(), BridgeError>;

    /// Reconfigure the session's permission mode. Setting the current mode
    /// is an idempotent success.
    async fn set_session_mode(&self, session_id: &str, mode_id: &str) -> Result<(), BridgeError>;

    /// Replay the session's notification history to the client. The client
    /// re-renders; nothing re-executes.
    async fn load_session(&self, session_id: &str) -> Result<(), BridgeError>;

    /// Reconstruct a backend handle for a known session id, preferring the
    /// backend's native resume token, falling back to history replay.
    async fn resume_session(
        &self,
        session_id: &str,
        cwd: &Path,
        native_resume_token: Option<&str>,
    ) -> Result<NewSessionResponse, BridgeError>;

    /// Narrow escape hatch for backend-specific operations.
    async fn ext_method(
        &self,
        name: &str,
        params: serde_json::Value,
    ) -> Result<serde_json::Value, BridgeError>;

    /// Shared state for a live session, if this adapter owns it.
    fn session_state(&self, session_id: &str) -> Option<Arc<SessionState>>;

    /// Models this adapter advertises.
    fn advertised_models(&self) -> Vec<shared::ModelInfo>;

    /// Forget a session (after teardown); the handle is dropped.
    fn drop_session(&self, session_id: &str);
}

/// The cross-adapter extension method: report the ids that correlate this
/// session across processes.
pub const EXT_NATIVE_SESSION_ID: &str = "nativeSessionId";

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn adapter_kind_ids_roundtrip() {
        for kind in [AdapterKind::Subprocess, AdapterKind::NativeStream] {
            assert_eq!(AdapterKind::from_id(kind.as_str()), Some(kind));
        }
        assert_eq!(AdapterKind::from_id("mainframe"), None);
    }
}
