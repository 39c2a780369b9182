use serde::{Deserialize, Serialize};

/// Version of the session protocol spoken over the wire.
///
/// Negotiated at `initialize` time; the agent answers with the highest
/// version it supports that is not greater than the client's.
pub const PROTOCOL_VERSION: u16 = 1;

/// Method name used for every server-to-client push.
pub const SESSION_UPDATE_METHOD: &str = "sessionUpdate";

/// Method name for the synchronous permission round trip.
pub const REQUEST_PERMISSION_METHOD: &str = "requestPermission";

// ============================================================================
// Content blocks
// ============================================================================

/// A piece of prompt or message content.
///
/// Text is the common case; images carry base64 data, resources carry
/// embedded context, and resource links are by-reference only.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ContentBlock {
    Text {
        text: String,
    },
    Image {
        media_type: String,
        data: String,
    },
    Resource {
        uri: String,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        mime_type: Option<String>,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        text: Option<String>,
    },
    ResourceLink {
        uri: String,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        title: Option<String>,
    },
}

impl ContentBlock {
    pub fn text(text: impl Into<String>) -> Self {
        ContentBlock::Text { text: text.into() }
    }
}

// ============================================================================
// Permission modes
// ============================================================================

/// How tool executions are arbitrated for a session.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
pub enum PermissionMode {
    /// Ask the client for every tool that is not covered by a rule.
    #[default]
    #[serde(rename = "default")]
    Default,
    /// File-edit tools are allowed without asking; everything else asks.
    #[serde(rename = "acceptEdits")]
    AcceptEdits,
    /// Every tool is allowed without asking.
    #[serde(rename = "bypassPermissions")]
    BypassPermissions,
    /// Planning mode: the backend researches but must not mutate.
    #[serde(rename = "plan")]
    Plan,
}

impl PermissionMode {
    pub fn as_str(&self) -> &'static str {
        match self {
            PermissionMode::Default => "default",
            PermissionMode::AcceptEdits => "acceptEdits",
            PermissionMode::BypassPermissions => "bypassPermissions",
            PermissionMode::Plan => "plan",
        }
    }

    /// Human-readable name shown by clients in mode pickers.
    pub fn label(&self) -> &'static str {
        match self {
            PermissionMode::Default => "Always Ask",
            PermissionMode::AcceptEdits => "Accept Edits",
            PermissionMode::BypassPermissions => "Bypass Permissions",
            PermissionMode::Plan => "Plan Mode",
        }
    }

    pub fn from_id(id: &str) -> Option<Self> {
        match id {
            "default" => Some(PermissionMode::Default),
            "acceptEdits" => Some(PermissionMode::AcceptEdits),
            "bypassPermissions" => Some(PermissionMode::BypassPermissions),
            "plan" => Some(PermissionMode::Plan),
            _ => None,
        }
    }

    pub fn all() -> [PermissionMode; 4] {
        [
            PermissionMode::Default,
            PermissionMode::AcceptEdits,
            PermissionMode::BypassPermissions,
            PermissionMode::Plan,
        ]
    }
}

impl std::fmt::Display for PermissionMode {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

// ============================================================================
// Stop reasons and tool call metadata
// ============================================================================

/// Why a `prompt` call resolved.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum StopReason {
    EndTurn,
    MaxTurnRequests,
    Cancelled,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ToolCallStatus {
    Pending,
    InProgress,
    Completed,
    Failed,
}

/// Coarse classification of what a tool does, for client rendering.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "snake_case")]
pub enum ToolKind {
    Read,
    Edit,
    Execute,
    Search,
    Fetch,
    Think,
    #[default]
    Other,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PlanEntryStatus {
    Pending,
    InProgress,
    Completed,
}

/// One entry of a session-visible task plan.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PlanEntry {
    pub content: String,
    pub status: PlanEntryStatus,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub priority: Option<String>,
}

/// A slash command advertised by the backend.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AvailableCommand {
    pub name: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub description: Option<String>,
}

/// A model advertised by the backend.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ModelInfo {
    pub model_id: String,
    pub name: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub description: Option<String>,
}

/// One selectable session mode.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ModeInfo {
    pub id: String,
    pub name: String,
}

/// Current mode plus the selectable set, returned from `newSession`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SessionModeState {
    pub current_mode_id: String,
    pub available_modes: Vec<ModeInfo>,
}

impl SessionModeState {
    /// The default mode state: all four permission modes selectable.
    pub fn with_current(mode: PermissionMode) -> Self {
        Self {
            current_mode_id: mode.as_str().to_string(),
            available_modes: PermissionMode::all()
                .iter()
                .map(|m| ModeInfo {
                    id: m.as_str().to_string(),
                    name: m.label().to_string(),
                })
                .collect(),
        }
    }
}

// ============================================================================
// Session notifications
// ============================================================================

/// Payload of a `sessionUpdate` push.
///
/// Chunks are emitted in arrival order and are never buffered or merged;
/// a logical message may span many chunk notifications.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "sessionUpdate", rename_all = "snake_case")]
pub enum SessionUpdate {
    UserMessageChunk {
        content: ContentBlock,
    },
    AgentMessageChunk {
        content: ContentBlock,
    },
    AgentThoughtChunk {
        content: ContentBlock,
    },
    #[serde(rename_all = "camelCase")]
    ToolCall {
        tool_call_id: String,
        title: String,
        kind: ToolKind,
        status: ToolCallStatus,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        raw_input: Option<serde_json::Value>,
    },
    #[serde(rename_all = "camelCase")]
    ToolCallUpdate {
        tool_call_id: String,
        status: ToolCallStatus,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        raw_output: Option<serde_json::Value>,
    },
    Plan {
        entries: Vec<PlanEntry>,
    },
    #[serde(rename_all = "camelCase")]
    AvailableCommandsUpdate {
        available_commands: Vec<AvailableCommand>,
    },
    #[serde(rename_all = "camelCase")]
    CurrentModeUpdate {
        current_mode_id: String,
    },
}

/// A `sessionUpdate` notification addressed to one session.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SessionNotification {
    pub session_id: String,
    #[serde(flatten)]
    pub update: SessionUpdate,
}

// ============================================================================
// Capabilities
// ============================================================================

/// File-system capabilities the client offers the agent. When advertised,
/// the backend may delegate file I/O to the client instead of touching disk.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "camelCase")]
pub struct FsCapabilities {
    #[serde(default)]
    pub read_text_file: bool,
    #[serde(default)]
    pub write_text_file: bool,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "camelCase")]
pub struct ClientCapabilities {
    #[serde(default)]
    pub fs: FsCapabilities,
    #[serde(default)]
    pub terminal: bool,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "camelCase")]
pub struct PromptCapabilities {
    #[serde(default)]
    pub image: bool,
    #[serde(default)]
    pub embedded_context: bool,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "camelCase")]
pub struct AgentCapabilities {
    #[serde(default)]
    pub load_session: bool,
    #[serde(default)]
    pub prompt_capabilities: PromptCapabilities,
}

/// An authentication method advertised at `initialize` time.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AuthMethod {
    pub id: String,
    pub name: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub description: Option<String>,
}

// ============================================================================
// Requests and responses
// ============================================================================

/// Configuration for one MCP server the backend should connect to.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct McpServerConfig {
    pub name: String,
    pub command: String,
    #[serde(default)]
    pub args: Vec<String>,
    #[serde(default)]
    pub env: Vec<EnvVariable>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct EnvVariable {
    pub name: String,
    pub value: String,
}

/// Client-to-agent request vocabulary. Method names are fixed for
/// compatibility with external clients and alternate agent implementations.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "method", content = "params", rename_all = "camelCase")]
pub enum ClientRequest {
    #[serde(rename_all = "camelCase")]
    Initialize {
        #[serde(default)]
        protocol_version: u16,
        #[serde(default)]
        client_capabilities: ClientCapabilities,
    },
    #[serde(rename_all = "camelCase")]
    Authenticate { method_id: String },
    #[serde(rename_all = "camelCase")]
    NewSession {
        cwd: String,
        #[serde(default)]
        mcp_servers: Vec<McpServerConfig>,
        /// Appended to the backend's default system prompt.
        #[serde(default, skip_serializing_if = "Option::is_none")]
        system_prompt_append: Option<String>,
        /// Which adapter variant serves this session; the agent's default
        /// backend is used when absent.
        #[serde(default, skip_serializing_if = "Option::is_none")]
        backend: Option<String>,
        /// Correlation id for external bookkeeping, echoed into logs.
        #[serde(default, skip_serializing_if = "Option::is_none")]
        task_run_id: Option<String>,
    },
    #[serde(rename_all = "camelCase")]
    Prompt {
        session_id: String,
        prompt: Vec<ContentBlock>,
    },
    #[serde(rename_all = "camelCase")]
    Cancel { session_id: String },
    #[serde(rename_all = "camelCase")]
    SetSessionModel {
        session_id: String,
        model_id: String,
    },
    #[serde(rename_all = "camelCase")]
    SetSessionMode {
        session_id: String,
        mode_id: String,
    },
    /// Superset of `setSessionModel`/`setSessionMode` for clients that
    /// configure by option key.
    #[serde(rename_all = "camelCase")]
    SetSessionConfigOption {
        session_id: String,
        option_id: String,
        value: String,
    },
    #[serde(rename_all = "camelCase")]
    LoadSession { session_id: String },
    #[serde(rename_all = "camelCase")]
    ResumeSession {
        session_id: String,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        native_resume_token: Option<String>,
        /// Needed when resumption has to reconstruct or recreate a backend
        /// handle.
        #[serde(default, skip_serializing_if = "Option::is_none")]
        cwd: Option<String>,
    },
    #[serde(rename_all = "camelCase")]
    ExtMethod {
        name: String,
        #[serde(default)]
        params: serde_json::Value,
    },
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct InitializeResponse {
    pub protocol_version: u16,
    pub agent_capabilities: AgentCapabilities,
    #[serde(default)]
    pub auth_methods: Vec<AuthMethod>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct NewSessionResponse {
    pub session_id: String,
    #[serde(default)]
    pub models: Vec<ModelInfo>,
    pub modes: SessionModeState,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PromptResponse {
    pub stop_reason: StopReason,
}

// ============================================================================
// Permission round trip (agent-to-client)
// ============================================================================

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PermissionOptionKind {
    AllowOnce,
    AllowAlways,
    RejectOnce,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PermissionOption {
    pub option_id: String,
    pub name: String,
    pub kind: PermissionOptionKind,
}

/// The tool call a permission request refers to.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ToolCallRef {
    pub tool_call_id: String,
    pub title: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub raw_input: Option<serde_json::Value>,
}

/// Parameters of a `requestPermission` request sent to the client.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RequestPermissionParams {
    pub session_id: String,
    pub tool_call: ToolCallRef,
    pub options: Vec<PermissionOption>,
}

/// The client's answer to a `requestPermission` request.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "outcome", rename_all = "snake_case")]
pub enum RequestPermissionOutcome {
    #[serde(rename_all = "camelCase")]
    Selected { option_id: String },
    Cancelled,
}

// ============================================================================
// Wire frames
// ============================================================================

/// One line received from the client: either a request or an answer to an
/// agent-initiated request. Requests carry a `method` field, answers do not.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum ClientMessage {
    Request {
        #[serde(default, skip_serializing_if = "Option::is_none")]
        id: Option<u64>,
        #[serde(flatten)]
        request: ClientRequest,
    },
    Response {
        id: u64,
        result: serde_json::Value,
    },
}

/// Successful response to a client request.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ResponseFrame {
    pub id: u64,
    pub result: serde_json::Value,
}

/// Failed response to a client request.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ErrorFrame {
    pub id: u64,
    pub error: ErrorObject,
}

/// Server-to-client notification (no response expected).
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct NotificationFrame {
    pub method: String,
    pub params: serde_json::Value,
}

/// Agent-to-client request (`requestPermission`); the client must answer
/// with a `ClientMessage::Response` carrying the same id.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AgentRequestFrame {
    pub id: u64,
    pub method: String,
    pub params: serde_json::Value,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ErrorObject {
    pub code: i64,
    pub message: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub data: Option<serde_json::Value>,
}

/// Protocol error codes. The JSON-RPC reserved range is used for the
/// standard conditions, agent-specific conditions start at -32000.
pub mod error_codes {
    pub const PARSE_ERROR: i64 = -32700;
    pub const METHOD_NOT_FOUND: i64 = -32601;
    pub const INVALID_PARAMS: i64 = -32602;
    pub const INTERNAL_ERROR: i64 = -32603;
    pub const AUTH_REQUIRED: i64 = -32000;
    pub const INVALID_CONFIG: i64 = -32001;
    pub const SESSION_NOT_FOUND: i64 = -32002;
    pub const RESUME_UNAVAILABLE: i64 = -32003;
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn content_block_text_roundtrip() {
        let block = ContentBlock::text("hello");
        let json = serde_json::to_string(&block).unwrap();
        assert_eq!(json, r#"{"type":"text","text":"hello"}"#);

        let parsed: ContentBlock = serde_json::from_str(&json).unwrap();
        assert_eq!(parsed, block);
    }

    #[test]
    fn permission_mode_wire_names() {
        assert_eq!(
            serde_json::to_string(&PermissionMode::AcceptEdits).unwrap(),
            "\"acceptEdits\""
        );
        assert_eq!(
            serde_json::to_string(&PermissionMode::BypassPermissions).unwrap(),
            "\"bypassPermissions\""
        );
        assert_eq!(PermissionMode::from_id("plan"), Some(PermissionMode::Plan));
        assert_eq!(PermissionMode::from_id("nonsense"), None);
    }

    #[test]
    fn session_update_tool_call_roundtrip() {
        let note = SessionNotification {
            session_id: "sess-1".to_string(),
            update: SessionUpdate::ToolCall {
                tool_call_id: "t1".to_string(),
                title: "ls".to_string(),
                kind: ToolKind::Execute,
                status: ToolCallStatus::Pending,
                raw_input: Some(serde_json::json!({"command": "ls"})),
            },
        };

        let json = serde_json::to_value(&note).unwrap();
        assert_eq!(json["sessionUpdate"], "tool_call");
        assert_eq!(json["sessionId"], "sess-1");
        assert_eq!(json["toolCallId"], "t1");

        let parsed: SessionNotification = serde_json::from_value(json).unwrap();
        assert_eq!(parsed, note);
    }

    #[test]
    fn client_request_prompt_roundtrip() {
        let json = r#"{
            "method": "prompt",
            "params": {
                "sessionId": "s-42",
                "prompt": [{"type": "text", "text": "list files"}]
            }
        }"#;
        let parsed: ClientRequest = serde_json::from_str(json).unwrap();
        match parsed {
            ClientRequest::Prompt { session_id, prompt } => {
                assert_eq!(session_id, "s-42");
                assert_eq!(prompt, vec![ContentBlock::text("list files")]);
            }
            other => panic!("wrong variant: {:?}", other),
        }
    }

    #[test]
    fn client_request_defaults() {
        // Optional newSession fields may be absent on the wire.
        let json = r#"{"method": "newSession", "params": {"cwd": "/repo"}}"#;
        let parsed: ClientRequest = serde_json::from_str(json).unwrap();
        match parsed {
            ClientRequest::NewSession {
                cwd,
                mcp_servers,
                system_prompt_append,
                backend,
                task_run_id,
            } => {
                assert_eq!(cwd, "/repo");
                assert!(mcp_servers.is_empty());
                assert!(system_prompt_append.is_none());
                assert!(backend.is_none());
                assert!(task_run_id.is_none());
            }
            other => panic!("wrong variant: {:?}", other),
        }
    }

    #[test]
    fn client_message_distinguishes_requests_from_responses() {
        let req: ClientMessage = serde_json::from_str(
            r#"{"id": 1, "method": "cancel", "params": {"sessionId": "s"}}"#,
        )
        .unwrap();
        assert!(matches!(req, ClientMessage::Request { id: Some(1), .. }));

        let resp: ClientMessage = serde_json::from_str(
            r#"{"id": 7, "result": {"outcome": "selected", "optionId": "allow_once"}}"#,
        )
        .unwrap();
        match resp {
            ClientMessage::Response { id, result } => {
                assert_eq!(id, 7);
                let outcome: RequestPermissionOutcome = serde_json::from_value(result).unwrap();
                assert_eq!(
                    outcome,
                    RequestPermissionOutcome::Selected {
                        option_id: "allow_once".to_string()
                    }
                );
            }
            other => panic!("wrong variant: {:?}", other),
        }
    }

    #[test]
    fn mode_state_lists_all_modes() {
        let state = SessionModeState::with_current(PermissionMode::Plan);
        assert_eq!(state.current_mode_id, "plan");
        assert_eq!(state.available_modes.len(), 4);
        assert!(state.available_modes.iter().any(|m| m.id == "acceptEdits"));
    }

    #[test]
    fn plan_update_roundtrip() {
        let update = SessionUpdate::Plan {
            entries: vec![PlanEntry {
                content: "write tests".to_string(),
                status: PlanEntryStatus::InProgress,
                priority: None,
            }],
        };
        let json = serde_json::to_string(&update).unwrap();
        let parsed: SessionUpdate = serde_json::from_str(&json).unwrap();
        assert_eq!(parsed, update);
    }
}
