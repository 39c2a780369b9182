//! Claude event conversion
//!
//! Pure mapping from the Claude stream-json vocabulary to protocol session
//! updates. Each backend event maps to exactly one rule or is explicitly
//! ignored; deltas are emitted in arrival order and never buffered. Terminal
//! result events become a [`TurnOutcome`] instead of a notification so the
//! prompt loop can resolve.

use claude_codes::io::{ContentBlock, ToolResultBlock};
use claude_codes::ClaudeOutput;
use serde_json::Value;
use shared::{
    AvailableCommand, PlanEntry, PlanEntryStatus, SessionUpdate, ToolCallStatus, ToolKind,
};
use tracing::{debug, warn};

use crate::error::BridgeError;
use crate::tool_use::{ToolUseCache, ToolUseEntry, ToolUseKind};

/// What one backend event turned into.
#[derive(Debug)]
pub enum Converted {
    /// Zero or more session updates, in emission order.
    Updates(Vec<SessionUpdate>),
    /// The turn is over; no notification is emitted for the event itself.
    TurnComplete(TurnOutcome),
    /// Explicitly ignored event.
    Ignored,
}

/// How a turn ended, from the terminal backend event.
#[derive(Debug)]
pub enum TurnOutcome {
    EndTurn,
    MaxTurnRequests,
    Failed(BridgeError),
}

/// The todo/plan tool is session-visible task state, not an opaque tool.
const PLAN_TOOL: &str = "TodoWrite";

/// Convert one Claude output event.
///
/// The cache is written before any `tool_call` update is produced, so a
/// result event arriving immediately after its declaration always matches.
pub fn convert_claude_output(output: &ClaudeOutput, cache: &mut ToolUseCache) -> Converted {
    match output {
        ClaudeOutput::System(sys) => {
            if sys.subtype == "init".into() {
                Converted::Updates(init_updates(&sys.data))
            } else {
                // The CLI emits informational system messages (compaction,
                // status) that have no protocol counterpart.
                debug!("Ignoring system event subtype={}", sys.subtype);
                Converted::Ignored
            }
        }

        ClaudeOutput::Assistant(asst) => {
            let mut updates = Vec::new();
            for block in &asst.message.content {
                match block {
                    ContentBlock::Text(t) => updates.push(SessionUpdate::AgentMessageChunk {
                        content: shared::ContentBlock::text(&t.text),
                    }),
                    ContentBlock::Thinking(th) => {
                        updates.push(SessionUpdate::AgentThoughtChunk {
                            content: shared::ContentBlock::text(&th.thinking),
                        })
                    }
                    ContentBlock::ToolUse(tu) => {
                        if tu.name == PLAN_TOOL {
                            updates.push(SessionUpdate::Plan {
                                entries: plan_entries_from_todos(&tu.input),
                            });
                            continue;
                        }

                        let kind = if tu.name.starts_with("mcp__") {
                            ToolUseKind::McpToolUse
                        } else {
                            ToolUseKind::ToolUse
                        };
                        cache.insert(ToolUseEntry {
                            kind,
                            id: tu.id.clone(),
                            name: tu.name.clone(),
                            input: tu.input.clone(),
                        });
                        updates.push(SessionUpdate::ToolCall {
                            tool_call_id: tu.id.clone(),
                            title: tool_title_for(&tu.name, &tu.input),
                            kind: tool_kind_for(&tu.name),
                            status: ToolCallStatus::Pending,
                            raw_input: Some(tu.input.clone()),
                        });
                    }
                    ContentBlock::ToolResult(tr) => {
                        // Uncommon in assistant messages, but the CLI does
                        // surface them there for some server-side tools.
                        if let Some(update) = convert_tool_result(tr, cache) {
                            updates.push(update);
                        }
                    }
                    ContentBlock::Image(_) => {
                        debug!("Ignoring image block in assistant message");
                    }
                }
            }
            Converted::Updates(updates)
        }

        ClaudeOutput::User(user) => {
            let mut updates = Vec::new();
            for block in &user.message.content {
                match block {
                    ContentBlock::Text(t) => updates.push(SessionUpdate::UserMessageChunk {
                        content: shared::ContentBlock::text(&t.text),
                    }),
                    ContentBlock::ToolResult(tr) => {
                        if let Some(update) = convert_tool_result(tr, cache) {
                            updates.push(update);
                        }
                    }
                    // Thinking/tool-use/image blocks do not occur in echoed
                    // user messages; nothing to surface if they ever do.
                    other => debug!("Ignoring user content block: {:?}", other),
                }
            }
            Converted::Updates(updates)
        }

        ClaudeOutput::Result(res) => Converted::TurnComplete(result_outcome(
            res.is_error,
            &res.errors,
            res.num_turns as u64,
        )),

        // Control traffic is adapter business (permission round trips and
        // their acks), never converted to notifications.
        ClaudeOutput::ControlRequest(_) => Converted::Ignored,
        ClaudeOutput::ControlResponse(_) => Converted::Ignored,

        // Error and rate-limit events carry no protocol-update counterpart in
        // the converter; like control traffic they are not surfaced here.
        ClaudeOutput::Error(_) | ClaudeOutput::RateLimitEvent(_) => Converted::Ignored,
    }
}

/// Match a tool result against its declaration. An unmatched result is a
/// contract violation by the backend: logged and dropped, never surfaced to
/// the client as a phantom update and never a crash.
fn convert_tool_result(tr: &ToolResultBlock, cache: &ToolUseCache) -> Option<SessionUpdate> {
    if !cache.contains(&tr.tool_use_id) {
        warn!(
            "Dropping tool result for unknown tool use id {}",
            tr.tool_use_id
        );
        return None;
    }

    let status = if tr.is_error.unwrap_or(false) {
        ToolCallStatus::Failed
    } else {
        ToolCallStatus::Completed
    };

    Some(SessionUpdate::ToolCallUpdate {
        tool_call_id: tr.tool_use_id.clone(),
        status,
        raw_output: tr
            .content
            .as_ref()
            .and_then(|c| serde_json::to_value(c).ok()),
    })
}

fn result_outcome(is_error: bool, errors: &[String], num_turns: u64) -> TurnOutcome {
    if !is_error {
        return TurnOutcome::EndTurn;
    }

    let joined = if errors.is_empty() {
        format!("backend reported an error after {} turns", num_turns)
    } else {
        errors.join("; ")
    };
    let lower = joined.to_lowercase();

    // The result event carries error strings, not structured codes; classify
    // by the markers the CLI is known to produce.
    if lower.contains("max turn") || lower.contains("turn limit") {
        TurnOutcome::MaxTurnRequests
    } else if lower.contains("authentication")
        || lower.contains("credential")
        || lower.contains("oauth")
        || lower.contains("api key")
        || lower.contains("please run /login")
    {
        TurnOutcome::Failed(BridgeError::AuthRequired(joined))
    } else {
        TurnOutcome::Failed(BridgeError::TurnFailed(joined))
    }
}

/// Updates derived from the CLI's init message: slash commands, and the
/// model actually in effect.
fn init_updates(data: &Value) -> Vec<SessionUpdate> {
    let mut updates = Vec::new();

    if let Some(commands) = data.get("slash_commands").and_then(Value::as_array) {
        let available_commands: Vec<AvailableCommand> = commands
            .iter()
            .filter_map(|c| match c {
                Value::String(name) => Some(AvailableCommand {
                    name: name.clone(),
                    description: None,
                }),
                Value::Object(_) => Some(AvailableCommand {
                    name: c.get("name")?.as_str()?.to_string(),
                    description: c
                        .get("description")
                        .and_then(Value::as_str)
                        .map(String::from),
                }),
                _ => None,
            })
            .collect();
        updates.push(SessionUpdate::AvailableCommandsUpdate { available_commands });
    }

    updates
}

fn plan_entries_from_todos(input: &Value) -> Vec<PlanEntry> {
    input
        .get("todos")
        .and_then(Value::as_array)
        .map(|todos| {
            todos
                .iter()
                .filter_map(|todo| {
                    let content = todo.get("content").and_then(Value::as_str)?.to_string();
                    let status = match todo.get("status").and_then(Value::as_str) {
                        Some("completed") => PlanEntryStatus::Completed,
                        Some("in_progress") => PlanEntryStatus::InProgress,
                        _ => PlanEntryStatus::Pending,
                    };
                    Some(PlanEntry {
                        content,
                        status,
                        priority: todo
                            .get("priority")
                            .and_then(Value::as_str)
                            .map(String::from),
                    })
                })
                .collect()
        })
        .unwrap_or_default()
}

/// Classify a tool by name for client rendering.
pub(crate) fn tool_kind_for(name: &str) -> ToolKind {
    match name {
        "Read" | "NotebookRead" => ToolKind::Read,
        "Edit" | "Write" | "MultiEdit" | "NotebookEdit" => ToolKind::Edit,
        "Bash" | "BashOutput" | "KillBash" => ToolKind::Execute,
        "Glob" | "Grep" | "WebSearch" => ToolKind::Search,
        "WebFetch" => ToolKind::Fetch,
        "Task" | "TodoWrite" | "ExitPlanMode" => ToolKind::Think,
        _ => ToolKind::Other,
    }
}

/// Short human title for a tool invocation, derived from the interesting
/// part of its input.
pub(crate) fn tool_title_for(name: &str, input: &Value) -> String {
    let detail = match name {
        "Bash" => input
            .get("command")
            .and_then(Value::as_str)
            .map(|s| truncate(s, 70).to_string()),
        "Read" | "Edit" | "Write" | "MultiEdit" | "NotebookEdit" | "NotebookRead" => input
            .get("file_path")
            .and_then(Value::as_str)
            .map(|s| truncate(s, 70).to_string()),
        "Glob" | "Grep" => input
            .get("pattern")
            .and_then(Value::as_str)
            .map(|p| truncate(p, 40).to_string()),
        "Task" => input
            .get("description")
            .and_then(Value::as_str)
            .map(|s| truncate(s, 60).to_string()),
        "WebFetch" | "WebSearch" => input
            .get("url")
            .or_else(|| input.get("query"))
            .and_then(Value::as_str)
            .map(|s| truncate(s, 60).to_string()),
        _ => None,
    };

    match detail {
        Some(detail) if !detail.is_empty() => format!("{}: {}", name, detail),
        _ => name.to_string(),
    }
}

/// Truncate at a UTF-8 boundary.
fn truncate(s: &str, max_len: usize) -> &str {
    if s.len() <= max_len {
        s
    } else {
        let mut end = max_len;
        while end > 0 && !s.is_char_boundary(end) {
            end -= 1;
        }
        &s[..end]
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const SESSION: &str = "11111111-2222-3333-4444-555555555555";

    fn parse(value: serde_json::Value) -> ClaudeOutput {
        serde_json::from_value(value).expect("event should deserialize")
    }

    fn assistant_with_content(content: serde_json::Value) -> ClaudeOutput {
        parse(serde_json::json!({
            "type": "assistant",
            "message": {
                "id": "msg_1",
                "type": "message",
                "role": "assistant",
                "model": "claude-sonnet-4-5",
                "content": content,
                "stop_reason": null,
                "stop_sequence": null,
                "usage": {"input_tokens": 1, "output_tokens": 1}
            },
            "parent_tool_use_id": null,
            "session_id": SESSION
        }))
    }

    fn user_with_content(content: serde_json::Value) -> ClaudeOutput {
        parse(serde_json::json!({
            "type": "user",
            "message": {"role": "user", "content": content},
            "parent_tool_use_id": null,
            "session_id": SESSION
        }))
    }

    fn updates(converted: Converted) -> Vec<SessionUpdate> {
        match converted {
            Converted::Updates(u) => u,
            other => panic!("expected updates, got {:?}", other),
        }
    }

    #[test]
    fn text_delta_becomes_agent_chunk() {
        let mut cache = ToolUseCache::new();
        let event = assistant_with_content(serde_json::json!([
            {"type": "text", "text": "hello"}
        ]));

        let out = updates(convert_claude_output(&event, &mut cache));
        assert_eq!(
            out,
            vec![SessionUpdate::AgentMessageChunk {
                content: shared::ContentBlock::text("hello")
            }]
        );
    }

    #[test]
    fn thinking_becomes_thought_chunk() {
        let mut cache = ToolUseCache::new();
        let event = assistant_with_content(serde_json::json!([
            {"type": "thinking", "thinking": "let me see", "signature": ""}
        ]));

        let out = updates(convert_claude_output(&event, &mut cache));
        assert_eq!(
            out,
            vec![SessionUpdate::AgentThoughtChunk {
                content: shared::ContentBlock::text("let me see")
            }]
        );
    }

    #[test]
    fn tool_use_then_result_emit_exactly_one_call_and_one_update() {
        let mut cache = ToolUseCache::new();

        let tool_use = assistant_with_content(serde_json::json!([
            {"type": "tool_use", "id": "t1", "name": "Bash", "input": {"command": "ls"}}
        ]));
        let out = updates(convert_claude_output(&tool_use, &mut cache));
        assert_eq!(out.len(), 1);
        match &out[0] {
            SessionUpdate::ToolCall {
                tool_call_id,
                kind,
                status,
                ..
            } => {
                assert_eq!(tool_call_id, "t1");
                assert_eq!(*kind, ToolKind::Execute);
                assert_eq!(*status, ToolCallStatus::Pending);
            }
            other => panic!("expected tool_call, got {:?}", other),
        }
        assert!(cache.contains("t1"));

        let tool_result = user_with_content(serde_json::json!([
            {"type": "tool_result", "tool_use_id": "t1", "content": "a.txt\nb.txt", "is_error": false}
        ]));
        let out = updates(convert_claude_output(&tool_result, &mut cache));
        assert_eq!(out.len(), 1);
        match &out[0] {
            SessionUpdate::ToolCallUpdate {
                tool_call_id,
                status,
                ..
            } => {
                assert_eq!(tool_call_id, "t1");
                assert_eq!(*status, ToolCallStatus::Completed);
            }
            other => panic!("expected tool_call_update, got {:?}", other),
        }
    }

    #[test]
    fn unmatched_tool_result_is_dropped_silently() {
        let mut cache = ToolUseCache::new();
        let event = user_with_content(serde_json::json!([
            {"type": "tool_result", "tool_use_id": "never-declared", "content": "x"}
        ]));

        // Zero notifications and no panic: the chosen log-and-drop behavior.
        let out = updates(convert_claude_output(&event, &mut cache));
        assert!(out.is_empty());
    }

    #[test]
    fn failed_tool_result_maps_to_failed_status() {
        let mut cache = ToolUseCache::new();
        cache.insert(ToolUseEntry {
            kind: ToolUseKind::ToolUse,
            id: "t9".to_string(),
            name: "Bash".to_string(),
            input: serde_json::json!({}),
        });

        let event = user_with_content(serde_json::json!([
            {"type": "tool_result", "tool_use_id": "t9", "content": "boom", "is_error": true}
        ]));
        let out = updates(convert_claude_output(&event, &mut cache));
        match &out[0] {
            SessionUpdate::ToolCallUpdate { status, .. } => {
                assert_eq!(*status, ToolCallStatus::Failed)
            }
            other => panic!("expected tool_call_update, got {:?}", other),
        }
    }

    #[test]
    fn todo_tool_becomes_plan_not_tool_call() {
        let mut cache = ToolUseCache::new();
        let event = assistant_with_content(serde_json::json!([
            {"type": "tool_use", "id": "t2", "name": "TodoWrite", "input": {
                "todos": [
                    {"content": "read the code", "status": "completed"},
                    {"content": "write the fix", "status": "in_progress"},
                    {"content": "add tests", "status": "pending"}
                ]
            }}
        ]));

        let out = updates(convert_claude_output(&event, &mut cache));
        assert_eq!(out.len(), 1);
        match &out[0] {
            SessionUpdate::Plan { entries } => {
                assert_eq!(entries.len(), 3);
                assert_eq!(entries[0].status, PlanEntryStatus::Completed);
                assert_eq!(entries[1].status, PlanEntryStatus::InProgress);
                assert_eq!(entries[2].status, PlanEntryStatus::Pending);
            }
            other => panic!("expected plan, got {:?}", other),
        }
        // Not an opaque tool: no cache entry, no tool_call.
        assert!(cache.is_empty());
    }

    #[test]
    fn user_text_becomes_user_chunk() {
        let mut cache = ToolUseCache::new();
        let event = user_with_content(serde_json::json!([
            {"type": "text", "text": "list files"}
        ]));

        let out = updates(convert_claude_output(&event, &mut cache));
        assert_eq!(
            out,
            vec![SessionUpdate::UserMessageChunk {
                content: shared::ContentBlock::text("list files")
            }]
        );
    }

    #[test]
    fn success_result_ends_turn() {
        match result_outcome(false, &[], 3) {
            TurnOutcome::EndTurn => {}
            other => panic!("expected end_turn, got {:?}", other),
        }
    }

    #[test]
    fn auth_error_result_maps_to_auth_required() {
        match result_outcome(true, &["OAuth token expired".to_string()], 1) {
            TurnOutcome::Failed(BridgeError::AuthRequired(msg)) => {
                assert!(msg.contains("OAuth"))
            }
            other => panic!("expected AuthRequired, got {:?}", other),
        }
    }

    #[test]
    fn turn_limit_result_maps_to_max_turn_requests() {
        match result_outcome(true, &["Reached max turns (25)".to_string()], 25) {
            TurnOutcome::MaxTurnRequests => {}
            other => panic!("expected max_turn_requests, got {:?}", other),
        }
    }

    #[test]
    fn init_system_event_yields_commands_update() {
        let mut cache = ToolUseCache::new();
        let event = parse(serde_json::json!({
            "type": "system",
            "subtype": "init",
            "data": {
                "session_id": SESSION,
                "model": "claude-sonnet-4-5",
                "cwd": "/repo",
                "tools": ["Bash", "Read"],
                "slash_commands": ["compact", "context"]
            },
            "session_id": SESSION
        }));

        let out = updates(convert_claude_output(&event, &mut cache));
        assert_eq!(out.len(), 1);
        match &out[0] {
            SessionUpdate::AvailableCommandsUpdate { available_commands } => {
                assert_eq!(available_commands.len(), 2);
                assert_eq!(available_commands[0].name, "compact");
            }
            other => panic!("expected commands update, got {:?}", other),
        }
    }

    #[test]
    fn tool_titles_pull_the_interesting_field() {
        assert_eq!(
            tool_title_for("Bash", &serde_json::json!({"command": "ls -la"})),
            "Bash: ls -la"
        );
        assert_eq!(
            tool_title_for("Read", &serde_json::json!({"file_path": "/a/b.rs"})),
            "Read: /a/b.rs"
        );
        assert_eq!(tool_title_for("SomeNewTool", &serde_json::json!({})), "SomeNewTool");
    }

    #[test]
    fn mcp_tools_are_cached_as_mcp_kind() {
        let mut cache = ToolUseCache::new();
        let event = assistant_with_content(serde_json::json!([
            {"type": "tool_use", "id": "t3", "name": "mcp__files__list", "input": {}}
        ]));
        updates(convert_claude_output(&event, &mut cache));
        assert_eq!(cache.get("t3").unwrap().kind, ToolUseKind::McpToolUse);
    }
}
