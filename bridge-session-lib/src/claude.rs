//! Subprocess backend adapter
//!
//! Drives the Claude Code CLI over its stream-json stdio protocol. The
//! supervisor spawns the CLI per session; a dedicated I/O task owns the
//! client and handles both reading stdout and writing stdin, which prevents
//! pipe-buffer overflow and avoids sharing the client between tasks behind a
//! mutex. The prompt loop consumes the task's event channel, converts events
//! to protocol updates, and answers tool permission requests inline.

use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex as StdMutex};

use async_trait::async_trait;
use claude_codes::io::{ControlRequestPayload, ControlResponse, PermissionResult};
use claude_codes::{AsyncClient, ClaudeInput, ClaudeOutput};
use serde_json::Value;
use shared::{
    AgentCapabilities, AuthMethod, ClientCapabilities, ContentBlock, InitializeResponse,
    McpServerConfig, ModelInfo, NewSessionResponse, PermissionMode, PromptCapabilities,
    PromptResponse, SessionModeState, StopReason,
};
use tokio::sync::mpsc;
use tracing::{debug, info, warn};
use uuid::Uuid;

use crate::agent::{AdapterKind, Agent, NewSessionOptions, EXT_NATIVE_SESSION_ID};
use crate::client::ClientHandle;
use crate::convert::{convert_claude_output, Converted, TurnOutcome};
use crate::error::BridgeError;
use crate::history::PersistenceBridge;
use crate::permissions::{evaluate_tool_use, PermissionDecision};
use crate::session::SessionState;
use crate::supervisor::ProcessSupervisor;
use crate::terminal::{BackgroundTerminals, TerminalStatus};
use crate::tool_use::ToolUseCache;

/// Events are buffered between the I/O task and the prompt loop up to this
/// depth; beyond it the I/O task applies backpressure to the CLI's stdout.
const EVENT_CHANNEL_DEPTH: usize = 256;

const AUTH_METHOD_LOGIN: &str = "claude-login";

/// Configuration shared by all sessions of this adapter.
#[derive(Debug, Clone)]
pub struct ClaudeAgentConfig {
    /// CLI binary; resolved via PATH when relative.
    pub binary_path: PathBuf,
    /// Extra CLI arguments appended to every spawn.
    pub extra_args: Vec<String>,
    /// Credential marker file. Missing or empty means `AuthRequired` before
    /// the CLI is even spawned; `None` skips the check.
    pub credentials_path: Option<PathBuf>,
    /// Models advertised to the client.
    pub models: Vec<ModelInfo>,
    /// Tool-bridge MCP server merged into every session unless the caller
    /// disables it.
    pub builtin_mcp: Option<McpServerConfig>,
}

impl Default for ClaudeAgentConfig {
    fn default() -> Self {
        Self {
            binary_path: PathBuf::from("claude"),
            extra_args: Vec::new(),
            credentials_path: None,
            models: default_models(),
            builtin_mcp: None,
        }
    }
}

fn default_models() -> Vec<ModelInfo> {
    vec![
        ModelInfo {
            model_id: "sonnet".to_string(),
            name: "Claude Sonnet".to_string(),
            description: Some("Balanced speed and capability".to_string()),
        },
        ModelInfo {
            model_id: "opus".to_string(),
            name: "Claude Opus".to_string(),
            description: Some("Most capable".to_string()),
        },
        ModelInfo {
            model_id: "haiku".to_string(),
            name: "Claude Haiku".to_string(),
            description: Some("Fastest".to_string()),
        },
    ]
}

/// Commands sent to the I/O task.
enum IoCommand {
    SendInput(ClaudeInput),
    SendControl(ControlResponse),
}

/// Events received from the I/O task.
enum IoEvent {
    Output(Box<ClaudeOutput>),
    Error(BridgeError),
    Exited { code: i32 },
}

/// Prompt-loop state; locked for the duration of one prompt.
struct PromptPump {
    event_rx: mpsc::Receiver<IoEvent>,
    cache: ToolUseCache,
    /// Set when a turn was cancelled: its residual events are discarded
    /// before the next turn's input is sent.
    drain_stale: bool,
}

struct ClaudeSession {
    state: Arc<SessionState>,
    /// The CLI's own session id, also used to tag user messages.
    native_uuid: Uuid,
    pid: u32,
    command_tx: mpsc::UnboundedSender<IoCommand>,
    pump: tokio::sync::Mutex<PromptPump>,
}

/// The subprocess variant of the uniform backend contract.
pub struct ClaudeAgent {
    config: ClaudeAgentConfig,
    supervisor: Arc<ProcessSupervisor>,
    persistence: Arc<PersistenceBridge>,
    client: ClientHandle,
    sessions: StdMutex<HashMap<String, Arc<ClaudeSession>>>,
    client_capabilities: StdMutex<Option<ClientCapabilities>>,
    /// Long-running shell commands tracked outside any prompt loop.
    terminals: BackgroundTerminals,
}

impl ClaudeAgent {
    pub fn new(
        config: ClaudeAgentConfig,
        supervisor: Arc<ProcessSupervisor>,
        persistence: Arc<PersistenceBridge>,
        client: ClientHandle,
    ) -> Self {
        Self {
            config,
            supervisor,
            persistence,
            client,
            sessions: StdMutex::new(HashMap::new()),
            client_capabilities: StdMutex::new(None),
            terminals: BackgroundTerminals::new(),
        }
    }

    fn session(&self, session_id: &str) -> Result<Arc<ClaudeSession>, BridgeError> {
        self.sessions
            .lock()
            .unwrap()
            .get(session_id)
            .cloned()
            .ok_or_else(|| BridgeError::SessionNotFound(session_id.to_string()))
    }

    fn check_credentials(&self) -> Result<(), BridgeError> {
        let Some(path) = &self.config.credentials_path else {
            return Ok(());
        };
        let stale = std::fs::metadata(path).map(|m| m.len() == 0).unwrap_or(true);
        if stale {
            return Err(BridgeError::AuthRequired(format!(
                "credential marker {} is missing or empty",
                path.display()
            )));
        }
        Ok(())
    }

    /// Assemble the CLI argument list for one session.
    fn build_args(
        &self,
        native_uuid: Uuid,
        resume_token: Option<&str>,
        model: Option<&str>,
        opts: &NewSessionOptions,
    ) -> Vec<String> {
        let mut args: Vec<String> = [
            "--print",
            "--verbose",
            "--output-format",
            "stream-json",
            "--input-format",
            "stream-json",
            "--permission-prompt-tool",
            "stdio",
            "--replay-user-messages",
        ]
        .iter()
        .map(|s| s.to_string())
        .collect();

        match resume_token {
            Some(token) => {
                args.push("--resume".to_string());
                args.push(token.to_string());
            }
            None => {
                args.push("--session-id".to_string());
                args.push(native_uuid.to_string());
            }
        }

        if let Some(model) = model {
            args.push("--model".to_string());
            args.push(model.to_string());
        }

        if let Some(append) = &opts.system_prompt_append {
            args.push("--append-system-prompt".to_string());
            args.push(append.clone());
        }

        if let Some(mcp_config) = merged_mcp_config(
            &opts.mcp_servers,
            if opts.disable_builtin_mcp {
                None
            } else {
                self.config.builtin_mcp.as_ref()
            },
        ) {
            args.push("--mcp-config".to_string());
            args.push(mcp_config);
        }

        args.extend(self.config.extra_args.iter().cloned());
        args
    }

    /// Spawn the CLI and wire up its I/O task, returning the running session.
    fn start_session(
        &self,
        session_id: String,
        native_uuid: Uuid,
        cwd: &Path,
        resume_token: Option<&str>,
        opts: &NewSessionOptions,
    ) -> Result<Arc<ClaudeSession>, BridgeError> {
        ProcessSupervisor::log_binary_info(&self.config.binary_path);

        // Sessions start on the first advertised model; setSessionModel
        // switches later.
        let model = self.config.models.first().map(|m| m.model_id.clone());
        let args = self.build_args(native_uuid, resume_token, model.as_deref(), opts);

        let mut process = self
            .supervisor
            .spawn(&self.config.binary_path, &args, cwd, &[])?;
        let pid = process.pid;
        let child = process
            .take_child()
            .ok_or_else(|| BridgeError::CommunicationError("spawned child already taken".into()))?;
        let client = AsyncClient::new(child).map_err(|e| {
            BridgeError::CommunicationError(format!("failed to attach stream client: {}", e))
        })?;

        let (event_tx, event_rx) = mpsc::channel(EVENT_CHANNEL_DEPTH);
        let (command_tx, command_rx) = mpsc::unbounded_channel();
        let supervisor = Arc::clone(&self.supervisor);
        tokio::spawn(async move {
            claude_io_task(client, command_rx, event_tx, supervisor, pid).await;
        });

        let state = SessionState::new(
            session_id.clone(),
            cwd,
            opts.task_run_id.clone(),
            self.client.clone(),
            Arc::clone(&self.persistence),
        );
        match resume_token {
            Some(token) => state.set_backend_native_id(token),
            None => state.set_backend_native_id(native_uuid.to_string()),
        }
        if let Some(model) = model {
            state.set_model_id(model);
        }

        let session = Arc::new(ClaudeSession {
            state,
            native_uuid,
            pid,
            command_tx,
            pump: tokio::sync::Mutex::new(PromptPump {
                event_rx,
                cache: ToolUseCache::new(),
                drain_stale: false,
            }),
        });
        self.sessions
            .lock()
            .unwrap()
            .insert(session_id, Arc::clone(&session));
        Ok(session)
    }

    fn response_for(&self, session: &ClaudeSession) -> NewSessionResponse {
        NewSessionResponse {
            session_id: session.state.session_id().to_string(),
            models: self.config.models.clone(),
            modes: SessionModeState::with_current(session.state.mode()),
        }
    }

    /// Answer one `canUseTool` control request through the evaluator.
    async fn respond_permission(
        &self,
        session: &Arc<ClaudeSession>,
        request_id: &str,
        tool_name: &str,
        input: &Value,
        suggestions: Vec<Value>,
    ) -> Result<(), BridgeError> {
        let decision =
            evaluate_tool_use(&session.state, request_id, tool_name, input, &suggestions).await;

        let response = match decision {
            PermissionDecision::Allow {
                updated_input,
                updated_permissions,
            } => {
                let input = updated_input.unwrap_or_else(|| input.clone());
                if updated_permissions.is_empty() {
                    ControlResponse::from_result(request_id, PermissionResult::allow(input))
                } else {
                    ControlResponse::from_result(
                        request_id,
                        PermissionResult::allow_with_permissions(input, updated_permissions),
                    )
                }
            }
            PermissionDecision::Deny { reason, .. } => {
                info!("Denying tool {} for session {}", tool_name, session.state.session_id());
                ControlResponse::from_result(request_id, PermissionResult::deny(reason))
            }
        };

        session
            .command_tx
            .send(IoCommand::SendControl(response))
            .map_err(|_| BridgeError::TransportFailure("backend I/O task closed".into()))
    }

    fn terminal_from_params(
        &self,
        params: &Value,
    ) -> Result<Arc<crate::terminal::TerminalHandle>, BridgeError> {
        let terminal_id = params
            .get("terminalId")
            .and_then(Value::as_str)
            .ok_or_else(|| BridgeError::InvalidConfig {
                what: "ext params",
                value: params.to_string(),
            })?;
        self.terminals
            .get(terminal_id)
            .ok_or_else(|| BridgeError::SessionNotFound(terminal_id.to_string()))
    }

    /// Discard events left over from a cancelled turn. Pending permission
    /// requests found here are denied so the backend is not left waiting.
    fn drain_stale_events(&self, session: &Arc<ClaudeSession>, pump: &mut PromptPump) {
        let mut drained = 0usize;
        while let Ok(event) = pump.event_rx.try_recv() {
            drained += 1;
            if let IoEvent::Output(output) = event {
                if let ClaudeOutput::ControlRequest(req) = *output {
                    if matches!(req.request, ControlRequestPayload::CanUseTool(_)) {
                        let deny = ControlResponse::from_result(
                            &req.request_id,
                            PermissionResult::deny("Prompt was cancelled".to_string()),
                        );
                        let _ = session.command_tx.send(IoCommand::SendControl(deny));
                    }
                }
            }
        }
        if drained > 0 {
            debug!("Discarded {} stale events from cancelled turn", drained);
        }
        pump.cache.clear();
        pump.drain_stale = false;
    }
}

#[async_trait]
impl Agent for ClaudeAgent {
    fn kind(&self) -> AdapterKind {
        AdapterKind::Subprocess
    }

    async fn initialize(&self, client_capabilities: ClientCapabilities) -> InitializeResponse {
        *self.client_capabilities.lock().unwrap() = Some(client_capabilities);

        InitializeResponse {
            protocol_version: shared::PROTOCOL_VERSION,
            agent_capabilities: AgentCapabilities {
                load_session: true,
                prompt_capabilities: PromptCapabilities {
                    image: true,
                    embedded_context: true,
                },
            },
            auth_methods: vec![AuthMethod {
                id: AUTH_METHOD_LOGIN.to_string(),
                name: "Log in with Claude Code".to_string(),
                description: Some("Run `claude /login` and retry".to_string()),
            }],
        }
    }

    async fn authenticate(&self, method_id: &str) -> Result<(), BridgeError> {
        if method_id != AUTH_METHOD_LOGIN {
            return Err(BridgeError::InvalidConfig {
                what: "auth method",
                value: method_id.to_string(),
            });
        }
        self.check_credentials()
    }

    async fn new_session(
        &self,
        cwd: &Path,
        opts: NewSessionOptions,
    ) -> Result<NewSessionResponse, BridgeError> {
        self.check_credentials()?;

        let session_id = opts
            .session_id
            .clone()
            .unwrap_or_else(|| Uuid::new_v4().to_string());
        // Client-assigned ids are opaque strings; the CLI wants a UUID.
        let native_uuid = Uuid::parse_str(&session_id).unwrap_or_else(|_| Uuid::new_v4());

        let session = self.start_session(session_id.clone(), native_uuid, cwd, None, &opts)?;
        self.persistence.register(&session_id, None)?;

        info!(
            "New subprocess session {} (pid {}, task_run_id {:?})",
            session_id,
            session.pid,
            session.state.task_run_id()
        );
        Ok(self.response_for(&session))
    }

    async fn prompt(
        &self,
        session_id: &str,
        content: Vec<ContentBlock>,
    ) -> Result<PromptResponse, BridgeError> {
        let session = self.session(session_id)?;
        let _guard = session.state.begin_prompt()?;
        let mut pump = session.pump.lock().await;

        if pump.drain_stale {
            self.drain_stale_events(&session, &mut pump);
        }

        let text = render_prompt(&content);
        session
            .command_tx
            .send(IoCommand::SendInput(ClaudeInput::user_message(
                text,
                session.native_uuid,
            )))
            .map_err(|_| BridgeError::TransportFailure("backend I/O task closed".into()))?;

        let cancel = session.state.cancel_token();
        loop {
            tokio::select! {
                biased;

                _ = cancel.cancelled() => {
                    pump.drain_stale = true;
                    return Ok(PromptResponse { stop_reason: StopReason::Cancelled });
                }

                event = pump.event_rx.recv() => match event {
                    None => {
                        return Err(BridgeError::TransportFailure(
                            "backend event stream closed".into(),
                        ))
                    }
                    Some(IoEvent::Exited { code }) => {
                        return Err(BridgeError::TransportFailure(format!(
                            "backend exited with code {}",
                            code
                        )))
                    }
                    Some(IoEvent::Error(e)) => {
                        if matches!(
                            e,
                            BridgeError::Claude(claude_codes::Error::Io(_))
                                | BridgeError::CommunicationError(_)
                        ) {
                            return Err(BridgeError::TransportFailure(e.to_string()));
                        }
                        // Parse-level errors: the stream is still alive.
                        warn!("Recoverable backend error: {}", e);
                    }
                    Some(IoEvent::Output(output)) => {
                        let output = *output;

                        if let ClaudeOutput::ControlRequest(ref req) = output {
                            if let ControlRequestPayload::CanUseTool(ref tool_req) = req.request {
                                let suggestions: Vec<Value> = tool_req
                                    .permission_suggestions
                                    .iter()
                                    .filter_map(|s| serde_json::to_value(s).ok())
                                    .collect();
                                tokio::select! {
                                    biased;
                                    _ = cancel.cancelled() => {
                                        // Do not leave the backend hanging on
                                        // the unanswered request.
                                        let deny = ControlResponse::from_result(
                                            &req.request_id,
                                            PermissionResult::deny("Prompt was cancelled".to_string()),
                                        );
                                        let _ = session.command_tx.send(IoCommand::SendControl(deny));
                                        pump.drain_stale = true;
                                        return Ok(PromptResponse { stop_reason: StopReason::Cancelled });
                                    }
                                    result = self.respond_permission(
                                        &session,
                                        &req.request_id,
                                        &tool_req.tool_name,
                                        &tool_req.input,
                                        suggestions,
                                    ) => result?,
                                }
                            } else {
                                debug!("Ignoring non-tool control request");
                            }
                            continue;
                        }

                        if let ClaudeOutput::System(ref sys) = output {
                            if sys.subtype == "init".into() {
                                if let Some(native) =
                                    sys.data.get("session_id").and_then(Value::as_str)
                                {
                                    session.state.set_backend_native_id(native);
                                }
                                if session.state.model_id().is_none() {
                                    if let Some(model) =
                                        sys.data.get("model").and_then(Value::as_str)
                                    {
                                        session.state.set_model_id(model);
                                    }
                                }
                            }
                        }

                        match convert_claude_output(&output, &mut pump.cache) {
                            Converted::Updates(updates) => {
                                for update in updates {
                                    session.state.emit(update);
                                }
                            }
                            Converted::TurnComplete(TurnOutcome::EndTurn) => {
                                return Ok(PromptResponse {
                                    stop_reason: StopReason::EndTurn,
                                })
                            }
                            Converted::TurnComplete(TurnOutcome::MaxTurnRequests) => {
                                return Ok(PromptResponse {
                                    stop_reason: StopReason::MaxTurnRequests,
                                })
                            }
                            Converted::TurnComplete(TurnOutcome::Failed(e)) => return Err(e),
                            Converted::Ignored => {}
                        }
                    }
                },
            }
        }
    }

    async fn cancel(&self, session_id: &str) -> Result<(), BridgeError> {
        let session = self.session(session_id)?;
        session
            .state
            .request_cancel(Some("Cancelled by client".to_string()));
        // The CLI closes the turn cooperatively; the prompt loop resolves at
        // its next observation point and residue is drained before the next
        // turn.
        Ok(())
    }

    async fn set_session_model(
        &self,
        session_id: &str,
        model_id: &str,
    ) -> Result<(), BridgeError> {
        if !self.config.models.iter().any(|m| m.model_id == model_id) {
            return Err(BridgeError::InvalidConfig {
                what: "model id",
                value: model_id.to_string(),
            });
        }

        let session = self.session(session_id)?;
        // Between prompts only: a locked pump means a prompt is mid-stream.
        let mut pump = session
            .pump
            .try_lock()
            .map_err(|_| BridgeError::PromptInFlight(session_id.to_string()))?;

        session
            .command_tx
            .send(IoCommand::SendInput(ClaudeInput::user_message(
                format!("/model {}", model_id),
                session.native_uuid,
            )))
            .map_err(|_| BridgeError::TransportFailure("backend I/O task closed".into()))?;
        // The slash command produces its own result cycle; discard it before
        // the next turn.
        pump.drain_stale = true;
        session.state.set_model_id(model_id);
        Ok(())
    }

    async fn set_session_mode(&self, session_id: &str, mode_id: &str) -> Result<(), BridgeError> {
        let mode = PermissionMode::from_id(mode_id).ok_or_else(|| BridgeError::InvalidConfig {
            what: "mode id",
            value: mode_id.to_string(),
        })?;

        let session = self.session(session_id)?;
        session.state.update_mode(mode);
        Ok(())
    }

    async fn load_session(&self, session_id: &str) -> Result<(), BridgeError> {
        let session = self.session(session_id)?;
        session.state.replay_history();
        Ok(())
    }

    async fn resume_session(
        &self,
        session_id: &str,
        cwd: &Path,
        native_resume_token: Option<&str>,
    ) -> Result<NewSessionResponse, BridgeError> {
        if let Ok(existing) = self.session(session_id) {
            // Idempotent: the in-memory session wins.
            return Ok(self.response_for(&existing));
        }

        let history = self.persistence.load_history(session_id)?;
        if native_resume_token.is_none() && history.is_empty() {
            return Err(BridgeError::ResumeUnavailable(session_id.to_string()));
        }

        let native_uuid = native_resume_token
            .and_then(|t| Uuid::parse_str(t).ok())
            .unwrap_or_else(Uuid::new_v4);

        let session = self.start_session(
            session_id.to_string(),
            native_uuid,
            cwd,
            native_resume_token,
            &NewSessionOptions::default(),
        )?;
        self.persistence.register(session_id, None)?;
        session.state.preload_history(history.clone());

        if native_resume_token.is_none() {
            // No native id: the client re-renders history instead of the
            // backend re-deriving it.
            info!(
                "Resuming session {} by replaying {} persisted notifications",
                session_id,
                history.len()
            );
            for notification in history {
                self.client.notify(notification);
            }
        }

        Ok(self.response_for(&session))
    }

    async fn ext_method(&self, name: &str, params: Value) -> Result<Value, BridgeError> {
        match name {
            EXT_NATIVE_SESSION_ID => {
                let session_id = params
                    .get("sessionId")
                    .and_then(Value::as_str)
                    .ok_or_else(|| BridgeError::InvalidConfig {
                        what: "ext params",
                        value: params.to_string(),
                    })?;
                let session = self.session(session_id)?;
                Ok(serde_json::json!({
                    "sessionId": session_id,
                    "nativeSessionId": session.state.backend_native_id(),
                    "pid": session.pid,
                }))
            }

            "terminalCreate" => {
                let command = params
                    .get("command")
                    .and_then(Value::as_str)
                    .ok_or_else(|| BridgeError::InvalidConfig {
                        what: "ext params",
                        value: params.to_string(),
                    })?;
                // Explicit cwd wins; otherwise the owning session's.
                let cwd = match params.get("cwd").and_then(Value::as_str) {
                    Some(cwd) => PathBuf::from(cwd),
                    None => {
                        let session_id = params
                            .get("sessionId")
                            .and_then(Value::as_str)
                            .ok_or_else(|| BridgeError::InvalidConfig {
                                what: "ext params",
                                value: params.to_string(),
                            })?;
                        self.session(session_id)?.state.cwd().to_path_buf()
                    }
                };
                let timeout = params
                    .get("timeoutMs")
                    .and_then(Value::as_u64)
                    .map(std::time::Duration::from_millis);

                let handle = self.terminals.start(command, &cwd, timeout)?;
                Ok(serde_json::json!({ "terminalId": handle.id }))
            }

            "terminalOutput" => {
                let handle = self.terminal_from_params(&params)?;
                Ok(serde_json::json!({
                    "output": handle.pending_output(),
                    "status": terminal_status_json(handle.status()),
                }))
            }

            "terminalKill" => {
                let handle = self.terminal_from_params(&params)?;
                handle.kill();
                Ok(serde_json::json!({}))
            }

            "terminalRelease" => {
                let terminal_id = params
                    .get("terminalId")
                    .and_then(Value::as_str)
                    .unwrap_or_default();
                self.terminals.release(terminal_id);
                Ok(serde_json::json!({}))
            }

            _ => Err(BridgeError::MethodNotFound(name.to_string())),
        }
    }

    fn session_state(&self, session_id: &str) -> Option<Arc<SessionState>> {
        self.sessions
            .lock()
            .unwrap()
            .get(session_id)
            .map(|s| Arc::clone(&s.state))
    }

    fn advertised_models(&self) -> Vec<ModelInfo> {
        self.config.models.clone()
    }

    fn drop_session(&self, session_id: &str) {
        // Dropping the session drops command_tx; the I/O task exits and the
        // CLI process is torn down with it.
        if self.sessions.lock().unwrap().remove(session_id).is_some() {
            info!("Dropped subprocess session {}", session_id);
        }
    }
}

fn terminal_status_json(status: TerminalStatus) -> Value {
    match status {
        TerminalStatus::Started => serde_json::json!({"state": "started"}),
        TerminalStatus::Aborted => serde_json::json!({"state": "aborted"}),
        TerminalStatus::Exited { code } => {
            serde_json::json!({"state": "exited", "exitCode": code})
        }
        TerminalStatus::Killed => serde_json::json!({"state": "killed"}),
        TerminalStatus::TimedOut => serde_json::json!({"state": "timed_out"}),
    }
}

/// Background task owning the stream client: pumps stdout into the event
/// channel and commands onto stdin. Owning the client exclusively avoids the
/// deadlocks a shared mutex would invite.
async fn claude_io_task(
    mut client: AsyncClient,
    mut command_rx: mpsc::UnboundedReceiver<IoCommand>,
    event_tx: mpsc::Sender<IoEvent>,
    supervisor: Arc<ProcessSupervisor>,
    pid: u32,
) {
    // Keep stderr for context when the CLI dies unexpectedly.
    let mut stderr_reader = client.take_stderr();

    loop {
        tokio::select! {
            Some(cmd) = command_rx.recv() => {
                let result = match cmd {
                    IoCommand::SendInput(input) => client.send(&input).await,
                    IoCommand::SendControl(response) => {
                        client.send_control_response(response).await
                    }
                };
                if let Err(e) = result {
                    if event_tx.send(IoEvent::Error(BridgeError::Claude(e))).await.is_err() {
                        break;
                    }
                }
            }

            result = client.receive() => {
                match result {
                    Ok(output) => {
                        if event_tx.send(IoEvent::Output(Box::new(output))).await.is_err() {
                            // Receiver dropped, session ended.
                            break;
                        }
                    }
                    Err(claude_codes::Error::ConnectionClosed) => {
                        supervisor.notify_exit(pid, Some(0));
                        let _ = event_tx.send(IoEvent::Exited { code: 0 }).await;
                        break;
                    }
                    Err(e) => {
                        let err_str = e.to_string();
                        if err_str.contains("exit") || err_str.contains("terminated") {
                            supervisor.notify_exit(pid, Some(1));
                            let _ = event_tx.send(IoEvent::Exited { code: 1 }).await;
                            break;
                        }
                        // Pull stderr for more context before reporting.
                        let enriched = match read_stderr(&mut stderr_reader).await {
                            Some(stderr) => BridgeError::CommunicationError(format!(
                                "{}\nbackend stderr: {}",
                                e, stderr
                            )),
                            None => BridgeError::Claude(e),
                        };
                        if event_tx.send(IoEvent::Error(enriched)).await.is_err() {
                            break;
                        }
                    }
                }
            }
        }
    }
}

/// Read whatever stderr has buffered, bounded by a short timeout.
async fn read_stderr(
    stderr_reader: &mut Option<tokio::io::BufReader<tokio::process::ChildStderr>>,
) -> Option<String> {
    use tokio::io::AsyncReadExt;

    let reader = stderr_reader.as_mut()?;
    let mut buf = Vec::with_capacity(4096);

    match tokio::time::timeout(
        std::time::Duration::from_millis(500),
        reader.read_to_end(&mut buf),
    )
    .await
    {
        Ok(Ok(_)) if !buf.is_empty() => {
            let text = String::from_utf8_lossy(&buf).trim().to_string();
            if text.is_empty() {
                None
            } else {
                Some(text)
            }
        }
        _ => None,
    }
}

/// Translate protocol content blocks into a backend text user message.
/// Embedded resources become fenced context; images and bare links become
/// reference lines. Shared with the native-stream adapter, whose turns carry
/// text the same way.
pub(crate) fn render_prompt(blocks: &[ContentBlock]) -> String {
    let mut parts = Vec::with_capacity(blocks.len());
    for block in blocks {
        match block {
            ContentBlock::Text { text } => parts.push(text.clone()),
            ContentBlock::Image { media_type, .. } => {
                parts.push(format!("[attached image: {}]", media_type))
            }
            ContentBlock::Resource {
                uri,
                text: Some(text),
                ..
            } => parts.push(format!("<context src=\"{}\">\n{}\n</context>", uri, text)),
            ContentBlock::Resource { uri, text: None, .. } => {
                parts.push(format!("[resource: {}]", uri))
            }
            ContentBlock::ResourceLink { uri, title } => {
                parts.push(format!("[{}]({})", title.as_deref().unwrap_or(uri), uri))
            }
        }
    }
    parts.join("\n\n")
}

/// Merge caller MCP servers with the built-in tool bridge into the CLI's
/// `--mcp-config` JSON document.
fn merged_mcp_config(
    servers: &[McpServerConfig],
    builtin: Option<&McpServerConfig>,
) -> Option<String> {
    let mut merged: Vec<&McpServerConfig> = servers.iter().collect();
    if let Some(builtin) = builtin {
        if !merged.iter().any(|s| s.name == builtin.name) {
            merged.push(builtin);
        }
    }
    if merged.is_empty() {
        return None;
    }

    let mut mcp_servers = serde_json::Map::new();
    for server in merged {
        let env: serde_json::Map<String, Value> = server
            .env
            .iter()
            .map(|e| (e.name.clone(), Value::String(e.value.clone())))
            .collect();
        mcp_servers.insert(
            server.name.clone(),
            serde_json::json!({
                "command": server.command,
                "args": server.args,
                "env": env,
            }),
        );
    }

    serde_json::to_string(&serde_json::json!({ "mcpServers": mcp_servers })).ok()
}
