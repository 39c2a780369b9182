//! Session registry
//!
//! One record per conversation: knows which adapter variant owns each
//! session id, enforces id uniqueness, routes protocol calls, and turns
//! fatal prompt errors into terminated sessions instead of retried calls.

use std::collections::HashMap;
use std::path::Path;
use std::sync::{Arc, Mutex};

use shared::{
    ClientCapabilities, ContentBlock, InitializeResponse, NewSessionResponse, PromptResponse,
};
use tracing::{info, warn};

use crate::agent::{AdapterKind, Agent, NewSessionOptions};
use crate::error::BridgeError;
use crate::session::SessionState;

pub struct SessionRegistry {
    adapters: HashMap<AdapterKind, Arc<dyn Agent>>,
    default_kind: AdapterKind,
    entries: Mutex<HashMap<String, AdapterKind>>,
}

impl SessionRegistry {
    pub fn new(default_kind: AdapterKind) -> Self {
        Self {
            adapters: HashMap::new(),
            default_kind,
            entries: Mutex::new(HashMap::new()),
        }
    }

    pub fn with_adapter(mut self, agent: Arc<dyn Agent>) -> Self {
        self.adapters.insert(agent.kind(), agent);
        self
    }

    fn adapter(&self, kind: AdapterKind) -> Result<&Arc<dyn Agent>, BridgeError> {
        self.adapters.get(&kind).ok_or(BridgeError::InvalidConfig {
            what: "backend",
            value: kind.as_str().to_string(),
        })
    }

    fn adapter_for(&self, session_id: &str) -> Result<Arc<dyn Agent>, BridgeError> {
        let kind = *self
            .entries
            .lock()
            .unwrap()
            .get(session_id)
            .ok_or_else(|| BridgeError::SessionNotFound(session_id.to_string()))?;
        Ok(Arc::clone(self.adapter(kind)?))
    }

    pub fn contains(&self, session_id: &str) -> bool {
        self.entries.lock().unwrap().contains_key(session_id)
    }

    pub fn session_state(&self, session_id: &str) -> Option<Arc<SessionState>> {
        let adapter = self.adapter_for(session_id).ok()?;
        adapter.session_state(session_id)
    }

    /// Capability negotiation, answered by the default adapter.
    pub async fn initialize(&self, caps: ClientCapabilities) -> Result<InitializeResponse, BridgeError> {
        Ok(self.adapter(self.default_kind)?.initialize(caps).await)
    }

    pub async fn authenticate(&self, method_id: &str) -> Result<(), BridgeError> {
        self.adapter(self.default_kind)?.authenticate(method_id).await
    }

    /// Create a session on the requested adapter variant. Session ids are
    /// unique for the registry's lifetime.
    pub async fn create(
        &self,
        kind: Option<AdapterKind>,
        cwd: &Path,
        opts: NewSessionOptions,
    ) -> Result<NewSessionResponse, BridgeError> {
        let kind = kind.unwrap_or(self.default_kind);

        if let Some(requested) = &opts.session_id {
            if self.contains(requested) {
                return Err(BridgeError::InvalidConfig {
                    what: "session id",
                    value: format!("{} already exists", requested),
                });
            }
        }

        let adapter = self.adapter(kind)?;
        let response = adapter.new_session(cwd, opts).await?;
        self.entries
            .lock()
            .unwrap()
            .insert(response.session_id.clone(), kind);
        Ok(response)
    }

    /// Route a prompt; a fatal error terminates the session rather than
    /// leaving a dead handle behind for the next call to trip over.
    pub async fn prompt(
        &self,
        session_id: &str,
        content: Vec<ContentBlock>,
    ) -> Result<PromptResponse, BridgeError> {
        let adapter = self.adapter_for(session_id)?;
        match adapter.prompt(session_id, content).await {
            Err(e) if e.is_fatal() => {
                warn!("Session {} hit a fatal error, tearing down: {}", session_id, e);
                self.teardown(session_id);
                Err(e)
            }
            other => other,
        }
    }

    pub async fn cancel(&self, session_id: &str) -> Result<(), BridgeError> {
        self.adapter_for(session_id)?.cancel(session_id).await
    }

    pub async fn set_session_model(
        &self,
        session_id: &str,
        model_id: &str,
    ) -> Result<(), BridgeError> {
        self.adapter_for(session_id)?
            .set_session_model(session_id, model_id)
            .await
    }

    pub async fn set_session_mode(
        &self,
        session_id: &str,
        mode_id: &str,
    ) -> Result<(), BridgeError> {
        self.adapter_for(session_id)?
            .set_session_mode(session_id, mode_id)
            .await
    }

    pub async fn load_session(&self, session_id: &str) -> Result<(), BridgeError> {
        self.adapter_for(session_id)?.load_session(session_id).await
    }

    /// Resume a session. An id that is already live is an idempotent no-op
    /// returning the existing session; an id that cannot be reconstructed
    /// degrades to a fresh session with a warning when the caller provided a
    /// working directory, and fails with `ResumeUnavailable` otherwise.
    pub async fn resume(
        &self,
        session_id: &str,
        cwd: Option<&Path>,
        native_resume_token: Option<&str>,
    ) -> Result<NewSessionResponse, BridgeError> {
        let known_kind = self.entries.lock().unwrap().get(session_id).copied();
        // Sessions from before a restart have no registry entry; the default
        // adapter reconstructs them from the shared persistence bridge.
        let kind = known_kind.unwrap_or(self.default_kind);
        let adapter = Arc::clone(self.adapter(kind)?);

        let Some(resolved_cwd) = cwd else {
            if known_kind.is_some() {
                // A live session keeps its original cwd; this is the
                // idempotent no-op path.
                return adapter
                    .resume_session(session_id, Path::new("."), native_resume_token)
                    .await;
            }
            return Err(BridgeError::ResumeUnavailable(session_id.to_string()));
        };

        match adapter
            .resume_session(session_id, resolved_cwd, native_resume_token)
            .await
        {
            Ok(response) => {
                self.entries
                    .lock()
                    .unwrap()
                    .insert(response.session_id.clone(), kind);
                Ok(response)
            }
            Err(BridgeError::ResumeUnavailable(_)) => {
                warn!(
                    "Session {} has no native token and no history; starting fresh",
                    session_id
                );
                self.create(
                    Some(kind),
                    resolved_cwd,
                    NewSessionOptions {
                        session_id: Some(session_id.to_string()),
                        ..Default::default()
                    },
                )
                .await
            }
            Err(e) => Err(e),
        }
    }

    pub async fn ext_method(
        &self,
        name: &str,
        params: serde_json::Value,
    ) -> Result<serde_json::Value, BridgeError> {
        // Session-scoped extensions route to the owning adapter; the rest go
        // to the default.
        let adapter = params
            .get("sessionId")
            .and_then(serde_json::Value::as_str)
            .and_then(|sid| self.adapter_for(sid).ok())
            .map(Ok)
            .unwrap_or_else(|| self.adapter(self.default_kind).cloned())?;
        adapter.ext_method(name, params).await
    }

    /// Terminate a session: forget the record and drop the adapter handle.
    pub fn teardown(&self, session_id: &str) {
        let kind = self.entries.lock().unwrap().remove(session_id);
        if let Some(kind) = kind {
            if let Ok(adapter) = self.adapter(kind) {
                adapter.drop_session(session_id);
            }
            info!("Session {} terminated", session_id);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::client::ClientHandle;
    use crate::history::{MemoryHistoryStore, PersistenceBridge};
    use crate::thread::{ThreadEvent, ThreadHandle, ThreadTransport, TurnRequest};
    use crate::thread_agent::{ThreadAgent, ThreadAgentConfig};
    use async_trait::async_trait;
    use std::collections::VecDeque;
    use tokio::sync::mpsc;

    #[derive(Default)]
    struct ScriptedTransport {
        handles: Mutex<VecDeque<ThreadHandle>>,
    }

    #[async_trait]
    impl ThreadTransport for ScriptedTransport {
        async fn start_thread(
            &self,
            _cwd: &Path,
            _model: Option<&str>,
        ) -> Result<ThreadHandle, BridgeError> {
            self.handles
                .lock()
                .unwrap()
                .pop_front()
                .ok_or_else(|| BridgeError::TransportFailure("no scripted handle".into()))
        }

        async fn resume_thread(
            &self,
            cwd: &Path,
            _thread_id: &str,
        ) -> Result<ThreadHandle, BridgeError> {
            self.start_thread(cwd, None).await
        }
    }

    struct Harness {
        registry: SessionRegistry,
        event_txs: Vec<mpsc::Sender<ThreadEvent>>,
        _turn_rxs: Vec<mpsc::Receiver<TurnRequest>>,
    }

    /// Registry over a native-stream adapter with `n` scripted handles.
    fn harness(n: usize) -> Harness {
        let transport = ScriptedTransport::default();
        let mut event_txs = Vec::new();
        let mut turn_rxs = Vec::new();
        for _ in 0..n {
            let (event_tx, event_rx) = mpsc::channel(256);
            let (turn_tx, turn_rx) = mpsc::channel(256);
            transport.handles.lock().unwrap().push_back(ThreadHandle {
                events: event_rx,
                turns: turn_tx,
            });
            event_txs.push(event_tx);
            turn_rxs.push(turn_rx);
        }

        let (client, _notes, _perms) = ClientHandle::channel();
        let persistence = Arc::new(PersistenceBridge::new(Arc::new(MemoryHistoryStore::new())));
        let agent = Arc::new(ThreadAgent::new(
            ThreadAgentConfig::default(),
            Arc::new(transport),
            persistence,
            client,
        ));

        Harness {
            registry: SessionRegistry::new(AdapterKind::NativeStream).with_adapter(agent),
            event_txs,
            _turn_rxs: turn_rxs,
        }
    }

    #[tokio::test]
    async fn create_registers_and_routes() {
        let h = harness(1);
        let response = h
            .registry
            .create(None, Path::new("/repo"), NewSessionOptions::default())
            .await
            .unwrap();

        assert!(h.registry.contains(&response.session_id));
        assert!(h.registry.session_state(&response.session_id).is_some());
        assert!(h
            .registry
            .set_session_mode(&response.session_id, "acceptEdits")
            .await
            .is_ok());
    }

    #[tokio::test]
    async fn duplicate_session_id_is_rejected() {
        let h = harness(2);
        h.registry
            .create(
                None,
                Path::new("/repo"),
                NewSessionOptions {
                    session_id: Some("s-dup".to_string()),
                    ..Default::default()
                },
            )
            .await
            .unwrap();

        let err = h
            .registry
            .create(
                None,
                Path::new("/repo"),
                NewSessionOptions {
                    session_id: Some("s-dup".to_string()),
                    ..Default::default()
                },
            )
            .await
            .unwrap_err();
        assert!(matches!(err, BridgeError::InvalidConfig { .. }));
    }

    #[tokio::test]
    async fn unknown_session_is_not_found() {
        let h = harness(0);
        let err = h.registry.cancel("nope").await.unwrap_err();
        assert!(matches!(err, BridgeError::SessionNotFound(_)));
    }

    #[tokio::test]
    async fn fatal_prompt_error_terminates_the_session() {
        let mut h = harness(1);
        let sid = h
            .registry
            .create(None, Path::new("/repo"), NewSessionOptions::default())
            .await
            .unwrap()
            .session_id;

        // Close the backend event stream: the prompt hits a transport
        // failure.
        h.event_txs.clear();

        let err = h
            .registry
            .prompt(&sid, vec![shared::ContentBlock::text("hi")])
            .await
            .unwrap_err();
        assert!(err.is_fatal());

        // Terminated, not retried: the id is gone.
        assert!(!h.registry.contains(&sid));
        assert!(matches!(
            h.registry.cancel(&sid).await,
            Err(BridgeError::SessionNotFound(_))
        ));
    }

    #[tokio::test]
    async fn resume_unavailable_degrades_to_fresh_session_with_cwd() {
        let h = harness(1);

        let response = h
            .registry
            .resume("lost-session", Some(Path::new("/repo")), None)
            .await
            .unwrap();
        assert_eq!(response.session_id, "lost-session");
        assert!(h.registry.contains("lost-session"));
    }

    #[tokio::test]
    async fn resume_without_cwd_and_without_state_fails() {
        let h = harness(0);
        let err = h.registry.resume("lost-session", None, None).await.unwrap_err();
        assert!(matches!(err, BridgeError::ResumeUnavailable(_)));
    }

    #[tokio::test]
    async fn ext_method_unknown_name_fails() {
        let h = harness(1);
        let sid = h
            .registry
            .create(None, Path::new("/repo"), NewSessionOptions::default())
            .await
            .unwrap()
            .session_id;

        let err = h
            .registry
            .ext_method("definitelyNotAMethod", serde_json::json!({"sessionId": sid}))
            .await
            .unwrap_err();
        assert!(matches!(err, BridgeError::MethodNotFound(_)));
    }
}
