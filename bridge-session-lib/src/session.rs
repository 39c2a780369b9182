//! Shared per-session state
//!
//! One `SessionState` exists per conversation and is shared (via `Arc`)
//! between the adapter that owns the execution handle, the permission
//! evaluator, and the registry. Everything here is cheap interior-mutability
//! state; the execution handle itself lives in the adapter's I/O task.

use std::collections::HashSet;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};

use shared::{PermissionMode, SessionNotification, SessionUpdate};
use tokio::sync::OwnedMutexGuard;
use tokio_util::sync::CancellationToken;
use tracing::warn;

use crate::client::ClientHandle;
use crate::error::BridgeError;
use crate::history::PersistenceBridge;

/// Cross-task view of one conversation.
pub struct SessionState {
    session_id: String,
    cwd: PathBuf,
    task_run_id: Option<String>,
    client: ClientHandle,
    persistence: Arc<PersistenceBridge>,
    mode: Mutex<PermissionMode>,
    model_id: Mutex<Option<String>>,
    cancelled: AtomicBool,
    cancel_token: Mutex<CancellationToken>,
    interrupt_reason: Mutex<Option<String>>,
    backend_native_id: Mutex<Option<String>>,
    history: Mutex<Vec<SessionNotification>>,
    allow_rules: Mutex<HashSet<String>>,
    /// Held for the duration of a `prompt` call; a second caller gets
    /// `PromptInFlight` instead of interleaving two turns on one handle.
    prompt_gate: Arc<tokio::sync::Mutex<()>>,
}

/// Proof that the holder is the session's single in-flight prompt loop.
pub struct PromptGuard {
    _gate: OwnedMutexGuard<()>,
}

impl SessionState {
    pub fn new(
        session_id: impl Into<String>,
        cwd: impl Into<PathBuf>,
        task_run_id: Option<String>,
        client: ClientHandle,
        persistence: Arc<PersistenceBridge>,
    ) -> Arc<Self> {
        Arc::new(Self {
            session_id: session_id.into(),
            cwd: cwd.into(),
            task_run_id,
            client,
            persistence,
            mode: Mutex::new(PermissionMode::Default),
            model_id: Mutex::new(None),
            cancelled: AtomicBool::new(false),
            cancel_token: Mutex::new(CancellationToken::new()),
            interrupt_reason: Mutex::new(None),
            backend_native_id: Mutex::new(None),
            history: Mutex::new(Vec::new()),
            allow_rules: Mutex::new(HashSet::new()),
            prompt_gate: Arc::new(tokio::sync::Mutex::new(())),
        })
    }

    pub fn session_id(&self) -> &str {
        &self.session_id
    }

    pub fn cwd(&self) -> &Path {
        &self.cwd
    }

    pub fn task_run_id(&self) -> Option<&str> {
        self.task_run_id.as_deref()
    }

    pub fn client(&self) -> &ClientHandle {
        &self.client
    }

    /// Claim the single-prompt slot, clearing any previous cancellation.
    pub fn begin_prompt(&self) -> Result<PromptGuard, BridgeError> {
        let gate = Arc::clone(&self.prompt_gate)
            .try_lock_owned()
            .map_err(|_| BridgeError::PromptInFlight(self.session_id.clone()))?;

        self.cancelled.store(false, Ordering::SeqCst);
        *self.interrupt_reason.lock().unwrap() = None;
        *self.cancel_token.lock().unwrap() = CancellationToken::new();

        Ok(PromptGuard { _gate: gate })
    }

    /// Request cancellation of the in-flight prompt. Safe to call from any
    /// task, at any time; the prompt loop observes the flag at its next
    /// suspension point. The flag stays set until the next `begin_prompt`.
    pub fn request_cancel(&self, reason: Option<String>) {
        self.cancelled.store(true, Ordering::SeqCst);
        if reason.is_some() {
            *self.interrupt_reason.lock().unwrap() = reason;
        }
        self.cancel_token.lock().unwrap().cancel();
    }

    pub fn is_cancelled(&self) -> bool {
        self.cancelled.load(Ordering::SeqCst)
    }

    pub fn interrupt_reason(&self) -> Option<String> {
        self.interrupt_reason.lock().unwrap().clone()
    }

    /// Token for the current prompt; cancelled exactly when
    /// [`request_cancel`](Self::request_cancel) fires.
    pub fn cancel_token(&self) -> CancellationToken {
        self.cancel_token.lock().unwrap().clone()
    }

    pub fn mode(&self) -> PermissionMode {
        *self.mode.lock().unwrap()
    }

    /// Switch permission mode. Emits a `current_mode_update` notification
    /// only when the mode actually changes, so setting the already-current
    /// mode is an idempotent no-op that still succeeds.
    pub fn update_mode(&self, mode: PermissionMode) -> bool {
        {
            let mut current = self.mode.lock().unwrap();
            if *current == mode {
                return false;
            }
            *current = mode;
        }
        self.emit(SessionUpdate::CurrentModeUpdate {
            current_mode_id: mode.as_str().to_string(),
        });
        true
    }

    pub fn model_id(&self) -> Option<String> {
        self.model_id.lock().unwrap().clone()
    }

    pub fn set_model_id(&self, model_id: impl Into<String>) {
        *self.model_id.lock().unwrap() = Some(model_id.into());
    }

    pub fn backend_native_id(&self) -> Option<String> {
        self.backend_native_id.lock().unwrap().clone()
    }

    pub fn set_backend_native_id(&self, id: impl Into<String>) {
        *self.backend_native_id.lock().unwrap() = Some(id.into());
    }

    /// Record an `allow_always` grant for a tool name, scoped to this session.
    pub fn add_allow_rule(&self, tool_name: &str) {
        self.allow_rules.lock().unwrap().insert(tool_name.to_string());
    }

    pub fn has_allow_rule(&self, tool_name: &str) -> bool {
        self.allow_rules.lock().unwrap().contains(tool_name)
    }

    /// Emit one session update: appended to the in-memory history, mirrored
    /// to the persistence bridge, then pushed to the client. This is the only
    /// path by which notifications leave a live session, which is what keeps
    /// replay identical to the original emission order.
    pub fn emit(&self, update: SessionUpdate) {
        let notification = SessionNotification {
            session_id: self.session_id.clone(),
            update,
        };

        self.history.lock().unwrap().push(notification.clone());

        if let Err(e) = self.persistence.append(&self.session_id, &notification) {
            warn!(
                "Failed to persist notification for session {}: {}",
                self.session_id, e
            );
        }

        self.client.notify(notification);
    }

    /// Seed history from a persisted log when reconstructing a session.
    pub fn preload_history(&self, notifications: Vec<SessionNotification>) {
        let mut history = self.history.lock().unwrap();
        debug_assert!(history.is_empty(), "preload into a non-empty history");
        *history = notifications;
    }

    pub fn history_snapshot(&self) -> Vec<SessionNotification> {
        self.history.lock().unwrap().clone()
    }

    /// Replay the in-memory history to the client without re-appending it
    /// anywhere. Used by `loadSession`: the client re-renders, nothing
    /// re-executes.
    pub fn replay_history(&self) {
        for notification in self.history_snapshot() {
            self.client.notify(notification);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::history::{MemoryHistoryStore, PersistenceBridge};
    use shared::ContentBlock;

    fn state_with_client() -> (
        Arc<SessionState>,
        tokio::sync::mpsc::UnboundedReceiver<SessionNotification>,
    ) {
        let (client, notes, _perms) = ClientHandle::channel();
        let persistence = Arc::new(PersistenceBridge::new(Arc::new(MemoryHistoryStore::new())));
        let state = SessionState::new("s-1", "/tmp", None, client, persistence);
        (state, notes)
    }

    #[tokio::test]
    async fn mode_update_is_idempotent() {
        let (state, mut notes) = state_with_client();

        assert!(state.update_mode(PermissionMode::AcceptEdits));
        assert!(!state.update_mode(PermissionMode::AcceptEdits));
        assert!(state.update_mode(PermissionMode::Plan));

        let first = notes.recv().await.unwrap();
        assert_eq!(
            first.update,
            SessionUpdate::CurrentModeUpdate {
                current_mode_id: "acceptEdits".to_string()
            }
        );
        let second = notes.recv().await.unwrap();
        assert_eq!(
            second.update,
            SessionUpdate::CurrentModeUpdate {
                current_mode_id: "plan".to_string()
            }
        );
        // Exactly two updates for three calls.
        assert!(notes.try_recv().is_err());
    }

    #[tokio::test]
    async fn cancel_flag_survives_prompt_end() {
        let (state, _notes) = state_with_client();

        let guard = state.begin_prompt().unwrap();
        state.request_cancel(Some("user hit stop".to_string()));
        assert!(state.is_cancelled());
        drop(guard);

        // Still cancelled after the prompt resolves...
        assert!(state.is_cancelled());
        assert_eq!(state.interrupt_reason().as_deref(), Some("user hit stop"));

        // ...and cleared only when the next prompt begins.
        let _guard = state.begin_prompt().unwrap();
        assert!(!state.is_cancelled());
    }

    #[tokio::test]
    async fn second_prompt_is_rejected_while_first_runs() {
        let (state, _notes) = state_with_client();

        let _guard = state.begin_prompt().unwrap();
        match state.begin_prompt() {
            Err(BridgeError::PromptInFlight(id)) => assert_eq!(id, "s-1"),
            other => panic!("expected PromptInFlight, got {:?}", other.map(|_| ())),
        }
    }

    #[tokio::test]
    async fn emit_records_history_in_order() {
        let (state, mut notes) = state_with_client();

        state.emit(SessionUpdate::UserMessageChunk {
            content: ContentBlock::text("one"),
        });
        state.emit(SessionUpdate::AgentMessageChunk {
            content: ContentBlock::text("two"),
        });

        let history = state.history_snapshot();
        assert_eq!(history.len(), 2);
        assert_eq!(history[0].update, notes.recv().await.unwrap().update);
        assert_eq!(history[1].update, notes.recv().await.unwrap().update);
    }
}
