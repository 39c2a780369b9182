//! Native-stream backend: thread protocol
//!
//! The second backend family exposes a long-lived "thread" per conversation:
//! the bridge pushes turn requests in and consumes a typed event stream out.
//! Event and item types are defined locally with lenient serde so a backend
//! adding vocabulary between releases degrades to `Unknown` instead of
//! breaking the session.
//!
//! The backend connection itself is behind [`ThreadTransport`]; the provided
//! implementation pumps newline-delimited JSON over any byte stream.

use std::path::Path;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use tokio::io::{AsyncBufReadExt, AsyncRead, AsyncWrite, AsyncWriteExt, BufReader};
use tokio::sync::mpsc;
use tracing::{debug, warn};

use crate::error::BridgeError;

/// Events are buffered up to this depth; beyond it the reader task applies
/// backpressure to the byte stream rather than growing without bound.
pub const EVENT_CHANNEL_DEPTH: usize = 256;

/// Token usage reported at turn completion.
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq)]
pub struct ThreadUsage {
    #[serde(default)]
    pub input_tokens: u64,
    #[serde(default)]
    pub cached_input_tokens: u64,
    #[serde(default)]
    pub output_tokens: u64,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq)]
pub struct ThreadError {
    #[serde(default)]
    pub message: String,
    /// Machine-readable classification when the backend provides one
    /// (e.g. `auth_required`, `turn_limit`).
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub kind: Option<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct FileChangeEntry {
    pub path: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub kind: Option<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct TodoEntry {
    pub text: String,
    #[serde(default)]
    pub completed: bool,
}

/// One unit of thread output. Message and reasoning items carry incremental
/// `text` deltas on start/update; tool-shaped items carry their state.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ThreadItem {
    AgentMessage {
        id: String,
        #[serde(default)]
        text: String,
    },
    Reasoning {
        id: String,
        #[serde(default)]
        text: String,
    },
    CommandExecution {
        id: String,
        command: String,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        aggregated_output: Option<String>,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        exit_code: Option<i32>,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        status: Option<String>,
    },
    FileChange {
        id: String,
        #[serde(default)]
        changes: Vec<FileChangeEntry>,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        status: Option<String>,
    },
    McpToolCall {
        id: String,
        server: String,
        tool: String,
        #[serde(default)]
        arguments: serde_json::Value,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        status: Option<String>,
    },
    WebSearch {
        id: String,
        query: String,
    },
    TodoList {
        id: String,
        #[serde(default)]
        items: Vec<TodoEntry>,
    },
    Error {
        id: String,
        #[serde(default)]
        message: String,
    },
    #[serde(other)]
    Unknown,
}

impl ThreadItem {
    /// The backend-assigned item id, when the item kind carries one.
    pub fn id(&self) -> Option<&str> {
        match self {
            ThreadItem::AgentMessage { id, .. }
            | ThreadItem::Reasoning { id, .. }
            | ThreadItem::CommandExecution { id, .. }
            | ThreadItem::FileChange { id, .. }
            | ThreadItem::McpToolCall { id, .. }
            | ThreadItem::WebSearch { id, .. }
            | ThreadItem::TodoList { id, .. }
            | ThreadItem::Error { id, .. } => Some(id),
            ThreadItem::Unknown => None,
        }
    }
}

/// One event read from the thread stream.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(tag = "type")]
pub enum ThreadEvent {
    #[serde(rename = "thread.started")]
    ThreadStarted { thread_id: String },
    #[serde(rename = "turn.started")]
    TurnStarted,
    #[serde(rename = "turn.completed")]
    TurnCompleted {
        #[serde(default, skip_serializing_if = "Option::is_none")]
        usage: Option<ThreadUsage>,
    },
    #[serde(rename = "turn.failed")]
    TurnFailed { error: ThreadError },
    #[serde(rename = "item.started")]
    ItemStarted { item: ThreadItem },
    #[serde(rename = "item.updated")]
    ItemUpdated { item: ThreadItem },
    #[serde(rename = "item.completed")]
    ItemCompleted { item: ThreadItem },
    /// The backend wants to execute a tool and is waiting for an answer.
    #[serde(rename = "thread.approval_requested")]
    ApprovalRequested {
        request_id: String,
        tool_name: String,
        #[serde(default)]
        input: serde_json::Value,
    },
    #[serde(other)]
    Unknown,
}

/// One request written to the thread stream.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum TurnRequest {
    UserInput {
        text: String,
    },
    Approval {
        request_id: String,
        allow: bool,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        reason: Option<String>,
    },
    /// Ask the backend to stop the in-flight turn.
    Interrupt,
    /// Switch the model for subsequent turns.
    SetModel {
        model: String,
    },
}

/// An owned, bidirectional thread connection: typed events out of the
/// backend, turn requests into it.
pub struct ThreadHandle {
    pub events: mpsc::Receiver<ThreadEvent>,
    pub turns: mpsc::Sender<TurnRequest>,
}

/// How the adapter obtains thread connections. The backend is an opaque
/// event producer behind this boundary; tests substitute a scripted one.
#[async_trait]
pub trait ThreadTransport: Send + Sync {
    /// Start a fresh thread rooted at `cwd`.
    async fn start_thread(
        &self,
        cwd: &Path,
        model: Option<&str>,
    ) -> Result<ThreadHandle, BridgeError>;

    /// Reconnect to an existing thread by its backend-native id.
    async fn resume_thread(
        &self,
        cwd: &Path,
        thread_id: &str,
    ) -> Result<ThreadHandle, BridgeError>;
}

/// Wire a [`ThreadHandle`] over a newline-delimited JSON byte stream.
///
/// Spawns one reader task and one writer task; the handle's channels close
/// when the underlying stream does. Unparseable lines are logged and
/// skipped: new event vocabulary must degrade, not kill the session.
pub fn jsonl_thread_handle<R, W>(reader: R, writer: W) -> ThreadHandle
where
    R: AsyncRead + Unpin + Send + 'static,
    W: AsyncWrite + Unpin + Send + 'static,
{
    let (event_tx, event_rx) = mpsc::channel::<ThreadEvent>(EVENT_CHANNEL_DEPTH);
    let (turn_tx, mut turn_rx) = mpsc::channel::<TurnRequest>(EVENT_CHANNEL_DEPTH);

    tokio::spawn(async move {
        let mut lines = BufReader::new(reader).lines();
        loop {
            match lines.next_line().await {
                Ok(Some(line)) => {
                    let line = line.trim();
                    if line.is_empty() {
                        continue;
                    }
                    match serde_json::from_str::<ThreadEvent>(line) {
                        Ok(event) => {
                            if event_tx.send(event).await.is_err() {
                                break;
                            }
                        }
                        Err(e) => warn!("Skipping unparseable thread event: {}", e),
                    }
                }
                Ok(None) => {
                    debug!("Thread stream closed");
                    break;
                }
                Err(e) => {
                    warn!("Thread stream read error: {}", e);
                    break;
                }
            }
        }
    });

    tokio::spawn(async move {
        let mut writer = writer;
        while let Some(request) = turn_rx.recv().await {
            let mut line = match serde_json::to_string(&request) {
                Ok(json) => json,
                Err(e) => {
                    warn!("Failed to encode turn request: {}", e);
                    continue;
                }
            };
            line.push('\n');
            if writer.write_all(line.as_bytes()).await.is_err() {
                break;
            }
            if writer.flush().await.is_err() {
                break;
            }
        }
    });

    ThreadHandle {
        events: event_rx,
        turns: turn_tx,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn event_wire_names() {
        let started: ThreadEvent =
            serde_json::from_str(r#"{"type": "thread.started", "thread_id": "th-1"}"#).unwrap();
        assert_eq!(
            started,
            ThreadEvent::ThreadStarted {
                thread_id: "th-1".to_string()
            }
        );

        let completed: ThreadEvent =
            serde_json::from_str(r#"{"type": "turn.completed", "usage": {"output_tokens": 9}}"#)
                .unwrap();
        match completed {
            ThreadEvent::TurnCompleted { usage: Some(u) } => assert_eq!(u.output_tokens, 9),
            other => panic!("wrong variant: {:?}", other),
        }
    }

    #[test]
    fn unknown_event_degrades() {
        let parsed: ThreadEvent =
            serde_json::from_str(r#"{"type": "thread.shiny_new_thing", "whatever": 1}"#).unwrap();
        assert_eq!(parsed, ThreadEvent::Unknown);
    }

    #[test]
    fn item_roundtrip() {
        let item: ThreadItem = serde_json::from_str(
            r#"{"type": "command_execution", "id": "c1", "command": "cargo test", "status": "in_progress"}"#,
        )
        .unwrap();
        match &item {
            ThreadItem::CommandExecution {
                id,
                command,
                exit_code,
                ..
            } => {
                assert_eq!(id, "c1");
                assert_eq!(command, "cargo test");
                assert!(exit_code.is_none());
            }
            other => panic!("wrong variant: {:?}", other),
        }
        assert_eq!(item.id(), Some("c1"));
    }

    #[test]
    fn turn_request_wire_shape() {
        let json = serde_json::to_string(&TurnRequest::Approval {
            request_id: "r-1".to_string(),
            allow: false,
            reason: Some("denied".to_string()),
        })
        .unwrap();
        assert!(json.contains(r#""type":"approval""#));

        let parsed: TurnRequest = serde_json::from_str(&json).unwrap();
        match parsed {
            TurnRequest::Approval { allow, .. } => assert!(!allow),
            other => panic!("wrong variant: {:?}", other),
        }
    }

    #[tokio::test]
    async fn jsonl_pump_round_trips_both_directions() {
        let (client_side, bridge_side) = tokio::io::duplex(4096);
        let (read_half, write_half) = tokio::io::split(bridge_side);
        let mut handle = jsonl_thread_handle(read_half, write_half);

        let (mut peer_read, mut peer_write) = tokio::io::split(client_side);

        // Backend -> bridge: one event plus a junk line that must be skipped.
        peer_write
            .write_all(b"{\"type\":\"turn.started\"}\nnot json at all\n{\"type\":\"turn.completed\"}\n")
            .await
            .unwrap();

        assert_eq!(handle.events.recv().await, Some(ThreadEvent::TurnStarted));
        assert_eq!(
            handle.events.recv().await,
            Some(ThreadEvent::TurnCompleted { usage: None })
        );

        // Bridge -> backend.
        handle
            .turns
            .send(TurnRequest::UserInput {
                text: "hi".to_string(),
            })
            .await
            .unwrap();

        let mut buf = vec![0u8; 256];
        let n = tokio::io::AsyncReadExt::read(&mut peer_read, &mut buf).await.unwrap();
        let line = String::from_utf8_lossy(&buf[..n]);
        assert!(line.contains(r#""type":"user_input""#));
        assert!(line.ends_with('\n'));
    }
}
