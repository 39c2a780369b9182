//! Thread event conversion
//!
//! Same discipline as the Claude converter, for the thread vocabulary:
//! pure, ordered, cache-before-notification, unknown events degrade.

use shared::{PlanEntry, PlanEntryStatus, SessionUpdate, ToolCallStatus, ToolKind};
use tracing::{debug, warn};

use crate::convert::{Converted, TurnOutcome};
use crate::error::BridgeError;
use crate::thread::{ThreadEvent, ThreadItem};
use crate::tool_use::{ToolUseCache, ToolUseEntry, ToolUseKind};

/// Convert one thread event.
///
/// `thread.started` and `thread.approval_requested` are adapter business
/// (native-id capture and the permission round trip) and convert to nothing
/// here.
pub fn convert_thread_event(event: &ThreadEvent, cache: &mut ToolUseCache) -> Converted {
    match event {
        ThreadEvent::ThreadStarted { .. } => Converted::Ignored,
        ThreadEvent::TurnStarted => Converted::Ignored,
        ThreadEvent::ApprovalRequested { .. } => Converted::Ignored,

        ThreadEvent::ItemStarted { item } => convert_item(item, cache, ItemPhase::Started),
        ThreadEvent::ItemUpdated { item } => convert_item(item, cache, ItemPhase::Updated),
        ThreadEvent::ItemCompleted { item } => convert_item(item, cache, ItemPhase::Completed),

        ThreadEvent::TurnCompleted { .. } => Converted::TurnComplete(TurnOutcome::EndTurn),

        ThreadEvent::TurnFailed { error } => {
            let message = if error.message.is_empty() {
                "turn failed without a message".to_string()
            } else {
                error.message.clone()
            };
            let outcome = match error.kind.as_deref() {
                Some("auth_required") => TurnOutcome::Failed(BridgeError::AuthRequired(message)),
                Some("turn_limit") => TurnOutcome::MaxTurnRequests,
                _ => {
                    let lower = message.to_lowercase();
                    if lower.contains("authentication") || lower.contains("not logged in") {
                        TurnOutcome::Failed(BridgeError::AuthRequired(message))
                    } else if lower.contains("turn limit") {
                        TurnOutcome::MaxTurnRequests
                    } else {
                        TurnOutcome::Failed(BridgeError::TurnFailed(message))
                    }
                }
            };
            Converted::TurnComplete(outcome)
        }

        ThreadEvent::Unknown => {
            // Backends add event types between releases; degrade instead of
            // crashing the session. The assert keeps development builds
            // honest about vocabulary coverage.
            debug_assert!(false, "unmapped thread event reached the converter");
            warn!("Ignoring unknown thread event");
            Converted::Ignored
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum ItemPhase {
    Started,
    Updated,
    Completed,
}

fn convert_item(item: &ThreadItem, cache: &mut ToolUseCache, phase: ItemPhase) -> Converted {
    match item {
        // Message/reasoning items stream deltas on start and update; the
        // completion event repeats nothing and emits nothing.
        ThreadItem::AgentMessage { text, .. } => match phase {
            ItemPhase::Completed => Converted::Ignored,
            _ if text.is_empty() => Converted::Ignored,
            _ => Converted::Updates(vec![SessionUpdate::AgentMessageChunk {
                content: shared::ContentBlock::text(text),
            }]),
        },
        ThreadItem::Reasoning { text, .. } => match phase {
            ItemPhase::Completed => Converted::Ignored,
            _ if text.is_empty() => Converted::Ignored,
            _ => Converted::Updates(vec![SessionUpdate::AgentThoughtChunk {
                content: shared::ContentBlock::text(text),
            }]),
        },

        ThreadItem::CommandExecution {
            id,
            command,
            aggregated_output,
            exit_code,
            status,
        } => {
            let failed = exit_code.map(|c| c != 0).unwrap_or(false)
                || status.as_deref() == Some("failed");
            tool_item(
                cache,
                phase,
                ToolUseEntry {
                    kind: ToolUseKind::ToolUse,
                    id: id.clone(),
                    name: "command_execution".to_string(),
                    input: serde_json::json!({"command": command}),
                },
                command.clone(),
                ToolKind::Execute,
                aggregated_output
                    .as_ref()
                    .map(|o| serde_json::Value::String(o.clone())),
                failed,
            )
        }

        ThreadItem::FileChange { id, changes, status } => {
            let title = if changes.is_empty() {
                "File change".to_string()
            } else {
                changes
                    .iter()
                    .map(|c| c.path.as_str())
                    .collect::<Vec<_>>()
                    .join(", ")
            };
            tool_item(
                cache,
                phase,
                ToolUseEntry {
                    kind: ToolUseKind::ToolUse,
                    id: id.clone(),
                    name: "file_change".to_string(),
                    input: serde_json::to_value(changes).unwrap_or_default(),
                },
                title,
                ToolKind::Edit,
                None,
                status.as_deref() == Some("failed"),
            )
        }

        ThreadItem::McpToolCall {
            id,
            server,
            tool,
            arguments,
            status,
        } => tool_item(
            cache,
            phase,
            ToolUseEntry {
                kind: ToolUseKind::McpToolUse,
                id: id.clone(),
                name: format!("{}.{}", server, tool),
                input: arguments.clone(),
            },
            format!("{}.{}", server, tool),
            ToolKind::Other,
            None,
            status.as_deref() == Some("failed"),
        ),

        ThreadItem::WebSearch { id, query } => tool_item(
            cache,
            phase,
            ToolUseEntry {
                kind: ToolUseKind::ServerToolUse,
                id: id.clone(),
                name: "web_search".to_string(),
                input: serde_json::json!({"query": query}),
            },
            format!("Search: {}", query),
            ToolKind::Search,
            None,
            false,
        ),

        ThreadItem::TodoList { items, .. } => Converted::Updates(vec![SessionUpdate::Plan {
            entries: items
                .iter()
                .map(|t| PlanEntry {
                    content: t.text.clone(),
                    status: if t.completed {
                        PlanEntryStatus::Completed
                    } else {
                        PlanEntryStatus::Pending
                    },
                    priority: None,
                })
                .collect(),
        }]),

        ThreadItem::Error { message, .. } => {
            // An error item reports a failure inside the turn; the turn
            // itself continues or fails via turn.failed.
            warn!("Backend reported item error: {}", message);
            Converted::Ignored
        }

        ThreadItem::Unknown => {
            debug_assert!(false, "unmapped thread item reached the converter");
            debug!("Ignoring unknown thread item");
            Converted::Ignored
        }
    }
}

/// Shared handling for tool-shaped items: declaration on the first phase,
/// updates afterwards, unmatched completions dropped.
fn tool_item(
    cache: &mut ToolUseCache,
    phase: ItemPhase,
    entry: ToolUseEntry,
    title: String,
    kind: ToolKind,
    raw_output: Option<serde_json::Value>,
    failed: bool,
) -> Converted {
    let id = entry.id.clone();

    match phase {
        ItemPhase::Started => {
            let raw_input = Some(entry.input.clone());
            cache.insert(entry);
            Converted::Updates(vec![SessionUpdate::ToolCall {
                tool_call_id: id,
                title,
                kind,
                status: ToolCallStatus::Pending,
                raw_input,
            }])
        }
        ItemPhase::Updated | ItemPhase::Completed => {
            if !cache.contains(&id) {
                warn!("Dropping {:?} for undeclared tool item {}", phase, id);
                return Converted::Updates(Vec::new());
            }
            let status = match phase {
                ItemPhase::Updated => ToolCallStatus::InProgress,
                _ if failed => ToolCallStatus::Failed,
                _ => ToolCallStatus::Completed,
            };
            Converted::Updates(vec![SessionUpdate::ToolCallUpdate {
                tool_call_id: id,
                status,
                raw_output,
            }])
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::thread::ThreadError;

    fn updates(converted: Converted) -> Vec<SessionUpdate> {
        match converted {
            Converted::Updates(u) => u,
            other => panic!("expected updates, got {:?}", other),
        }
    }

    fn command_item(id: &str, exit_code: Option<i32>) -> ThreadItem {
        ThreadItem::CommandExecution {
            id: id.to_string(),
            command: "ls".to_string(),
            aggregated_output: Some("a.txt\nb.txt".to_string()),
            exit_code,
            status: None,
        }
    }

    #[test]
    fn command_lifecycle_emits_call_then_update() {
        let mut cache = ToolUseCache::new();

        let started = ThreadEvent::ItemStarted {
            item: command_item("c1", None),
        };
        let out = updates(convert_thread_event(&started, &mut cache));
        match &out[0] {
            SessionUpdate::ToolCall {
                tool_call_id,
                status,
                kind,
                ..
            } => {
                assert_eq!(tool_call_id, "c1");
                assert_eq!(*status, ToolCallStatus::Pending);
                assert_eq!(*kind, ToolKind::Execute);
            }
            other => panic!("expected tool_call, got {:?}", other),
        }

        let completed = ThreadEvent::ItemCompleted {
            item: command_item("c1", Some(0)),
        };
        let out = updates(convert_thread_event(&completed, &mut cache));
        match &out[0] {
            SessionUpdate::ToolCallUpdate {
                tool_call_id,
                status,
                raw_output,
            } => {
                assert_eq!(tool_call_id, "c1");
                assert_eq!(*status, ToolCallStatus::Completed);
                assert!(raw_output.is_some());
            }
            other => panic!("expected tool_call_update, got {:?}", other),
        }
    }

    #[test]
    fn nonzero_exit_code_fails_the_call() {
        let mut cache = ToolUseCache::new();
        updates(convert_thread_event(
            &ThreadEvent::ItemStarted {
                item: command_item("c2", None),
            },
            &mut cache,
        ));

        let out = updates(convert_thread_event(
            &ThreadEvent::ItemCompleted {
                item: command_item("c2", Some(127)),
            },
            &mut cache,
        ));
        match &out[0] {
            SessionUpdate::ToolCallUpdate { status, .. } => {
                assert_eq!(*status, ToolCallStatus::Failed)
            }
            other => panic!("expected tool_call_update, got {:?}", other),
        }
    }

    #[test]
    fn undeclared_completion_is_dropped() {
        let mut cache = ToolUseCache::new();
        let out = updates(convert_thread_event(
            &ThreadEvent::ItemCompleted {
                item: command_item("ghost", Some(0)),
            },
            &mut cache,
        ));
        assert!(out.is_empty());
    }

    #[test]
    fn message_deltas_stream_and_completion_is_silent() {
        let mut cache = ToolUseCache::new();

        let delta = ThreadEvent::ItemUpdated {
            item: ThreadItem::AgentMessage {
                id: "m1".to_string(),
                text: "partial".to_string(),
            },
        };
        let out = updates(convert_thread_event(&delta, &mut cache));
        assert_eq!(
            out,
            vec![SessionUpdate::AgentMessageChunk {
                content: shared::ContentBlock::text("partial")
            }]
        );

        let done = ThreadEvent::ItemCompleted {
            item: ThreadItem::AgentMessage {
                id: "m1".to_string(),
                text: "partial plus the rest".to_string(),
            },
        };
        assert!(matches!(
            convert_thread_event(&done, &mut cache),
            Converted::Ignored
        ));
    }

    #[test]
    fn todo_list_becomes_plan() {
        let mut cache = ToolUseCache::new();
        let event = ThreadEvent::ItemUpdated {
            item: ThreadItem::TodoList {
                id: "td1".to_string(),
                items: vec![
                    crate::thread::TodoEntry {
                        text: "first".to_string(),
                        completed: true,
                    },
                    crate::thread::TodoEntry {
                        text: "second".to_string(),
                        completed: false,
                    },
                ],
            },
        };

        let out = updates(convert_thread_event(&event, &mut cache));
        match &out[0] {
            SessionUpdate::Plan { entries } => {
                assert_eq!(entries[0].status, PlanEntryStatus::Completed);
                assert_eq!(entries[1].status, PlanEntryStatus::Pending);
            }
            other => panic!("expected plan, got {:?}", other),
        }
    }

    #[test]
    fn turn_completed_ends_turn() {
        let mut cache = ToolUseCache::new();
        assert!(matches!(
            convert_thread_event(&ThreadEvent::TurnCompleted { usage: None }, &mut cache),
            Converted::TurnComplete(TurnOutcome::EndTurn)
        ));
    }

    #[test]
    fn turn_failed_classification() {
        let mut cache = ToolUseCache::new();

        let auth = ThreadEvent::TurnFailed {
            error: ThreadError {
                message: "expired".to_string(),
                kind: Some("auth_required".to_string()),
            },
        };
        match convert_thread_event(&auth, &mut cache) {
            Converted::TurnComplete(TurnOutcome::Failed(BridgeError::AuthRequired(_))) => {}
            other => panic!("expected AuthRequired, got {:?}", other),
        }

        let limit = ThreadEvent::TurnFailed {
            error: ThreadError {
                message: "turn limit reached".to_string(),
                kind: None,
            },
        };
        match convert_thread_event(&limit, &mut cache) {
            Converted::TurnComplete(TurnOutcome::MaxTurnRequests) => {}
            other => panic!("expected MaxTurnRequests, got {:?}", other),
        }
    }
}
