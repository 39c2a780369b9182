//! Client-side plumbing
//!
//! The bridge never talks to its client directly; it pushes notifications
//! into a channel and issues permission requests that block on a oneshot
//! answer. The transport layer (stdio, a test harness, ...) owns the other
//! ends.

use shared::{RequestPermissionOutcome, RequestPermissionParams, SessionNotification};
use tokio::sync::{mpsc, oneshot};
use tracing::{debug, warn};

/// An agent-initiated permission request awaiting a client answer.
#[derive(Debug)]
pub struct PermissionRequest {
    pub params: RequestPermissionParams,
    /// Answered exactly once; dropping the sender counts as a rejection.
    pub responder: oneshot::Sender<RequestPermissionOutcome>,
}

/// Handle for pushing notifications and permission requests to the client.
///
/// Cloneable; every session shares the same client connection.
#[derive(Clone)]
pub struct ClientHandle {
    notifications: mpsc::UnboundedSender<SessionNotification>,
    permissions: mpsc::UnboundedSender<PermissionRequest>,
}

impl ClientHandle {
    pub fn new(
        notifications: mpsc::UnboundedSender<SessionNotification>,
        permissions: mpsc::UnboundedSender<PermissionRequest>,
    ) -> Self {
        Self {
            notifications,
            permissions,
        }
    }

    /// Convenience constructor for tests and embedders: returns the handle
    /// plus the receiving ends.
    pub fn channel() -> (
        Self,
        mpsc::UnboundedReceiver<SessionNotification>,
        mpsc::UnboundedReceiver<PermissionRequest>,
    ) {
        let (note_tx, note_rx) = mpsc::unbounded_channel();
        let (perm_tx, perm_rx) = mpsc::unbounded_channel();
        (Self::new(note_tx, perm_tx), note_rx, perm_rx)
    }

    /// Push one `sessionUpdate` notification. A closed channel means the
    /// client is gone; the notification is dropped with a log line, the
    /// session itself keeps running.
    pub fn notify(&self, notification: SessionNotification) {
        if self.notifications.send(notification).is_err() {
            debug!("Client notification channel closed, dropping update");
        }
    }

    /// Issue a synchronous permission request and wait for the answer.
    ///
    /// Returns `None` when the client is unreachable or dropped the request
    /// without answering; callers treat that as a rejection.
    pub async fn request_permission(
        &self,
        params: RequestPermissionParams,
    ) -> Option<RequestPermissionOutcome> {
        let (responder, answer) = oneshot::channel();
        if self
            .permissions
            .send(PermissionRequest { params, responder })
            .is_err()
        {
            warn!("Permission channel closed, treating request as rejected");
            return None;
        }

        match answer.await {
            Ok(outcome) => Some(outcome),
            Err(_) => {
                warn!("Permission request dropped without an answer");
                None
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use shared::{PermissionOption, PermissionOptionKind, ToolCallRef};

    fn sample_params() -> RequestPermissionParams {
        RequestPermissionParams {
            session_id: "s-1".to_string(),
            tool_call: ToolCallRef {
                tool_call_id: "t-1".to_string(),
                title: "ls".to_string(),
                raw_input: None,
            },
            options: vec![PermissionOption {
                option_id: "allow_once".to_string(),
                name: "Allow".to_string(),
                kind: PermissionOptionKind::AllowOnce,
            }],
        }
    }

    #[tokio::test]
    async fn permission_round_trip() {
        let (handle, _notes, mut perms) = ClientHandle::channel();

        let request = tokio::spawn(async move { handle.request_permission(sample_params()).await });

        let pending = perms.recv().await.expect("request should arrive");
        assert_eq!(pending.params.tool_call.tool_call_id, "t-1");
        pending
            .responder
            .send(RequestPermissionOutcome::Selected {
                option_id: "allow_once".to_string(),
            })
            .unwrap();

        let outcome = request.await.unwrap();
        assert_eq!(
            outcome,
            Some(RequestPermissionOutcome::Selected {
                option_id: "allow_once".to_string()
            })
        );
    }

    #[tokio::test]
    async fn dropped_responder_is_rejection() {
        let (handle, _notes, mut perms) = ClientHandle::channel();

        let request = tokio::spawn(async move { handle.request_permission(sample_params()).await });

        let pending = perms.recv().await.expect("request should arrive");
        drop(pending);

        assert_eq!(request.await.unwrap(), None);
    }

    #[tokio::test]
    async fn closed_channel_is_rejection() {
        let (handle, _notes, perms) = ClientHandle::channel();
        drop(perms);

        assert_eq!(handle.request_permission(sample_params()).await, None);
    }
}
