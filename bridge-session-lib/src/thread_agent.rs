//! Native-stream backend adapter
//!
//! The thread-protocol counterpart of the subprocess adapter: same uniform
//! contract, same prompt-loop discipline, but the execution handle is a
//! [`ThreadHandle`] obtained from a [`ThreadTransport`] rather than a
//! supervised child process. Unlike the CLI, the thread protocol does not
//! echo user turns back, so this adapter emits the `user_message_chunk`
//! notifications itself.

use std::collections::HashMap;
use std::path::Path;
use std::sync::{Arc, Mutex as StdMutex};

use async_trait::async_trait;
use serde_json::Value;
use shared::{
    AgentCapabilities, ClientCapabilities, ContentBlock, InitializeResponse, ModelInfo,
    NewSessionResponse, PermissionMode, PromptCapabilities, PromptResponse, SessionModeState,
    SessionUpdate, StopReason,
};
use tokio::sync::mpsc;
use tracing::{debug, info, warn};

use crate::agent::{AdapterKind, Agent, NewSessionOptions, EXT_NATIVE_SESSION_ID};
use crate::client::ClientHandle;
use crate::convert::{Converted, TurnOutcome};
use crate::error::BridgeError;
use crate::history::PersistenceBridge;
use crate::permissions::{evaluate_tool_use, PermissionDecision};
use crate::session::SessionState;
use crate::thread::{ThreadEvent, ThreadTransport, TurnRequest};
use crate::thread_convert::convert_thread_event;
use crate::tool_use::ToolUseCache;

#[derive(Debug, Clone)]
pub struct ThreadAgentConfig {
    pub models: Vec<ModelInfo>,
}

impl Default for ThreadAgentConfig {
    fn default() -> Self {
        Self {
            models: vec![ModelInfo {
                model_id: "default".to_string(),
                name: "Default".to_string(),
                description: None,
            }],
        }
    }
}

struct ThreadPump {
    events: mpsc::Receiver<ThreadEvent>,
    cache: ToolUseCache,
    drain_stale: bool,
}

struct ThreadSession {
    state: Arc<SessionState>,
    turns: mpsc::Sender<TurnRequest>,
    pump: tokio::sync::Mutex<ThreadPump>,
}

/// The native-stream variant of the uniform backend contract.
pub struct ThreadAgent {
    config: ThreadAgentConfig,
    transport: Arc<dyn ThreadTransport>,
    persistence: Arc<PersistenceBridge>,
    client: ClientHandle,
    sessions: StdMutex<HashMap<String, Arc<ThreadSession>>>,
}

impl ThreadAgent {
    pub fn new(
        config: ThreadAgentConfig,
        transport: Arc<dyn ThreadTransport>,
        persistence: Arc<PersistenceBridge>,
        client: ClientHandle,
    ) -> Self {
        Self {
            config,
            transport,
            persistence,
            client,
            sessions: StdMutex::new(HashMap::new()),
        }
    }

    fn session(&self, session_id: &str) -> Result<Arc<ThreadSession>, BridgeError> {
        self.sessions
            .lock()
            .unwrap()
            .get(session_id)
            .cloned()
            .ok_or_else(|| BridgeError::SessionNotFound(session_id.to_string()))
    }

    fn response_for(&self, session: &ThreadSession) -> NewSessionResponse {
        NewSessionResponse {
            session_id: session.state.session_id().to_string(),
            models: self.config.models.clone(),
            modes: SessionModeState::with_current(session.state.mode()),
        }
    }

    fn install_session(
        &self,
        session_id: &str,
        cwd: &Path,
        opts: &NewSessionOptions,
        handle: crate::thread::ThreadHandle,
    ) -> Arc<ThreadSession> {
        let state = SessionState::new(
            session_id,
            cwd,
            opts.task_run_id.clone(),
            self.client.clone(),
            Arc::clone(&self.persistence),
        );

        let session = Arc::new(ThreadSession {
            state,
            turns: handle.turns,
            pump: tokio::sync::Mutex::new(ThreadPump {
                events: handle.events,
                cache: ToolUseCache::new(),
                drain_stale: false,
            }),
        });
        self.sessions
            .lock()
            .unwrap()
            .insert(session_id.to_string(), Arc::clone(&session));
        session
    }

    async fn respond_approval(
        &self,
        session: &Arc<ThreadSession>,
        request_id: &str,
        tool_name: &str,
        input: &Value,
    ) -> Result<(), BridgeError> {
        let decision = evaluate_tool_use(&session.state, request_id, tool_name, input, &[]).await;

        let request = match decision {
            PermissionDecision::Allow { .. } => TurnRequest::Approval {
                request_id: request_id.to_string(),
                allow: true,
                reason: None,
            },
            PermissionDecision::Deny { reason, .. } => {
                info!(
                    "Denying tool {} for session {}",
                    tool_name,
                    session.state.session_id()
                );
                TurnRequest::Approval {
                    request_id: request_id.to_string(),
                    allow: false,
                    reason: Some(reason),
                }
            }
        };

        session
            .turns
            .send(request)
            .await
            .map_err(|_| BridgeError::TransportFailure("thread turn channel closed".into()))
    }

    fn drain_stale_events(&self, session: &Arc<ThreadSession>, pump: &mut ThreadPump) {
        let mut drained = 0usize;
        while let Ok(event) = pump.events.try_recv() {
            drained += 1;
            if let ThreadEvent::ApprovalRequested { request_id, .. } = event {
                let _ = session.turns.try_send(TurnRequest::Approval {
                    request_id,
                    allow: false,
                    reason: Some("Prompt was cancelled".to_string()),
                });
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
impl Agent for ThreadAgent {
    fn kind(&self) -> AdapterKind {
        AdapterKind::NativeStream
    }

    async fn initialize(&self, _client_capabilities: ClientCapabilities) -> InitializeResponse {
        InitializeResponse {
            protocol_version: shared::PROTOCOL_VERSION,
            agent_capabilities: AgentCapabilities {
                load_session: true,
                prompt_capabilities: PromptCapabilities {
                    image: false,
                    embedded_context: true,
                },
            },
            // The thread backend authenticates out of band.
            auth_methods: Vec::new(),
        }
    }

    async fn authenticate(&self, method_id: &str) -> Result<(), BridgeError> {
        Err(BridgeError::InvalidConfig {
            what: "auth method",
            value: method_id.to_string(),
        })
    }

    async fn new_session(
        &self,
        cwd: &Path,
        opts: NewSessionOptions,
    ) -> Result<NewSessionResponse, BridgeError> {
        let session_id = opts
            .session_id
            .clone()
            .unwrap_or_else(|| uuid::Uuid::new_v4().to_string());

        let model = self.config.models.first().map(|m| m.model_id.clone());
        let handle = self.transport.start_thread(cwd, model.as_deref()).await?;

        let session = self.install_session(&session_id, cwd, &opts, handle);
        if let Some(model) = model {
            session.state.set_model_id(model);
        }
        self.persistence.register(&session_id, None)?;

        info!("New native-stream session {}", session_id);
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

        let text = crate::claude::render_prompt(&content);
        session
            .turns
            .send(TurnRequest::UserInput { text })
            .await
            .map_err(|_| BridgeError::TransportFailure("thread turn channel closed".into()))?;

        // The thread stream does not echo user turns; surface them here so
        // the transcript is complete and replayable.
        for block in &content {
            session.state.emit(SessionUpdate::UserMessageChunk {
                content: block.clone(),
            });
        }

        let cancel = session.state.cancel_token();
        loop {
            tokio::select! {
                biased;

                _ = cancel.cancelled() => {
                    pump.drain_stale = true;
                    return Ok(PromptResponse { stop_reason: StopReason::Cancelled });
                }

                event = pump.events.recv() => match event {
                    None => {
                        return Err(BridgeError::TransportFailure(
                            "thread event stream closed".into(),
                        ))
                    }
                    Some(ThreadEvent::ThreadStarted { thread_id }) => {
                        session.state.set_backend_native_id(thread_id);
                    }
                    Some(ThreadEvent::ApprovalRequested {
                        request_id,
                        tool_name,
                        input,
                    }) => {
                        tokio::select! {
                            biased;
                            _ = cancel.cancelled() => {
                                let _ = session.turns.try_send(TurnRequest::Approval {
                                    request_id,
                                    allow: false,
                                    reason: Some("Prompt was cancelled".to_string()),
                                });
                                pump.drain_stale = true;
                                return Ok(PromptResponse { stop_reason: StopReason::Cancelled });
                            }
                            result = self.respond_approval(
                                &session,
                                &request_id,
                                &tool_name,
                                &input,
                            ) => result?,
                        }
                    }
                    Some(event) => match convert_thread_event(&event, &mut pump.cache) {
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
                    },
                },
            }
        }
    }

    async fn cancel(&self, session_id: &str) -> Result<(), BridgeError> {
        let session = self.session(session_id)?;
        session
            .state
            .request_cancel(Some("Cancelled by client".to_string()));
        // Backend-level interruption, without blocking on acknowledgement.
        if session.turns.try_send(TurnRequest::Interrupt).is_err() {
            warn!(
                "Could not queue interrupt for session {}; relying on the flag",
                session_id
            );
        }
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
        if session.pump.try_lock().is_err() {
            return Err(BridgeError::PromptInFlight(session_id.to_string()));
        }

        session
            .turns
            .send(TurnRequest::SetModel {
                model: model_id.to_string(),
            })
            .await
            .map_err(|_| BridgeError::TransportFailure("thread turn channel closed".into()))?;
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
            return Ok(self.response_for(&existing));
        }

        let history = self.persistence.load_history(session_id)?;
        if native_resume_token.is_none() && history.is_empty() {
            return Err(BridgeError::ResumeUnavailable(session_id.to_string()));
        }

        let handle = match native_resume_token {
            Some(thread_id) => self.transport.resume_thread(cwd, thread_id).await?,
            None => {
                let model = self.config.models.first().map(|m| m.model_id.clone());
                self.transport.start_thread(cwd, model.as_deref()).await?
            }
        };

        let session = self.install_session(session_id, cwd, &NewSessionOptions::default(), handle);
        if let Some(thread_id) = native_resume_token {
            session.state.set_backend_native_id(thread_id);
        }
        self.persistence.register(session_id, None)?;
        session.state.preload_history(history.clone());

        if native_resume_token.is_none() {
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
                }))
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
        if self.sessions.lock().unwrap().remove(session_id).is_some() {
            info!("Dropped native-stream session {}", session_id);
        }
    }
}
