//! Tool permission arbitration
//!
//! Invoked whenever a backend wants to execute a tool, synchronously from
//! the adapter's perspective: the prompt loop is suspended until a decision
//! exists. Depending on the session's permission mode the decision is made
//! locally or round-tripped to the client.

use std::sync::Arc;

use serde_json::Value;
use shared::{
    PermissionMode, PermissionOption, PermissionOptionKind, RequestPermissionOutcome,
    RequestPermissionParams, ToolCallRef,
};
use tracing::{debug, info};

use crate::convert::tool_title_for;
use crate::session::SessionState;

/// The backend tool that asks to leave plan mode.
pub const EXIT_PLAN_TOOL: &str = "ExitPlanMode";

/// Tools that mutate files; auto-allowed in `acceptEdits` mode.
pub const FILE_EDIT_TOOLS: &[&str] = &["Edit", "Write", "MultiEdit", "NotebookEdit"];

const OPTION_ALLOW_ONCE: &str = "allow_once";
const OPTION_ALLOW_ALWAYS: &str = "allow_always";
const OPTION_REJECT_ONCE: &str = "reject_once";

const OPTION_EXIT_ACCEPT_EDITS: &str = "exit_accept_edits";
const OPTION_EXIT_DEFAULT: &str = "exit_default";
const OPTION_STAY_PLAN: &str = "stay_plan";

/// Outcome of arbitration for one tool invocation.
#[derive(Debug, Clone, PartialEq)]
pub enum PermissionDecision {
    Allow {
        /// Replacement input, when the client edited it. `None` keeps the
        /// original.
        updated_input: Option<Value>,
        /// Permission updates to hand back to the backend ("remember this
        /// decision" hints).
        updated_permissions: Vec<Value>,
    },
    Deny {
        reason: String,
        /// When set, the backend must stop the current activity rather than
        /// retry the tool.
        interrupt: bool,
    },
}

impl PermissionDecision {
    pub fn allow() -> Self {
        PermissionDecision::Allow {
            updated_input: None,
            updated_permissions: Vec::new(),
        }
    }

    pub fn allow_with_permissions(updated_permissions: Vec<Value>) -> Self {
        PermissionDecision::Allow {
            updated_input: None,
            updated_permissions,
        }
    }

    pub fn deny(reason: impl Into<String>) -> Self {
        PermissionDecision::Deny {
            reason: reason.into(),
            interrupt: true,
        }
    }

    pub fn is_allowed(&self) -> bool {
        matches!(self, PermissionDecision::Allow { .. })
    }
}

/// Decide whether the backend may run `tool_name` with `input`.
///
/// `tool_call_id` is the adapter's correlation id for the invocation (shown
/// to the client alongside the request). `suggested_permissions` are
/// backend-provided grant hints, echoed back when the client answers
/// "always allow".
///
/// Any mode change made here is emitted as a `current_mode_update` before
/// the decision is returned, so the client's displayed mode never lags.
pub async fn evaluate_tool_use(
    session: &Arc<SessionState>,
    tool_call_id: &str,
    tool_name: &str,
    input: &Value,
    suggested_permissions: &[Value],
) -> PermissionDecision {
    let mode = session.mode();

    if mode == PermissionMode::BypassPermissions {
        return PermissionDecision::allow();
    }
    if mode == PermissionMode::AcceptEdits && FILE_EDIT_TOOLS.contains(&tool_name) {
        return PermissionDecision::allow();
    }

    if tool_name == EXIT_PLAN_TOOL {
        return evaluate_exit_plan(session, tool_call_id, input).await;
    }

    if session.has_allow_rule(tool_name) {
        debug!(
            "Session {} rule auto-allows tool {}",
            session.session_id(),
            tool_name
        );
        return PermissionDecision::allow();
    }

    let params = RequestPermissionParams {
        session_id: session.session_id().to_string(),
        tool_call: ToolCallRef {
            tool_call_id: tool_call_id.to_string(),
            title: tool_title_for(tool_name, input),
            raw_input: Some(input.clone()),
        },
        options: vec![
            PermissionOption {
                option_id: OPTION_ALLOW_ALWAYS.to_string(),
                name: format!("Always allow {}", tool_name),
                kind: PermissionOptionKind::AllowAlways,
            },
            PermissionOption {
                option_id: OPTION_ALLOW_ONCE.to_string(),
                name: "Allow".to_string(),
                kind: PermissionOptionKind::AllowOnce,
            },
            PermissionOption {
                option_id: OPTION_REJECT_ONCE.to_string(),
                name: "Reject".to_string(),
                kind: PermissionOptionKind::RejectOnce,
            },
        ],
    };

    match session.client().request_permission(params).await {
        Some(RequestPermissionOutcome::Selected { option_id })
            if option_id == OPTION_ALLOW_ALWAYS =>
        {
            info!(
                "Session {}: always-allow granted for {}",
                session.session_id(),
                tool_name
            );
            session.add_allow_rule(tool_name);
            PermissionDecision::allow_with_permissions(suggested_permissions.to_vec())
        }
        Some(RequestPermissionOutcome::Selected { option_id })
            if option_id == OPTION_ALLOW_ONCE =>
        {
            PermissionDecision::allow()
        }
        _ => PermissionDecision::deny(format!("User denied permission for {}", tool_name)),
    }
}

/// The three-way exit-plan choice. The chosen option sets the session mode;
/// staying in plan is a hard stop for the backend.
async fn evaluate_exit_plan(
    session: &Arc<SessionState>,
    tool_call_id: &str,
    input: &Value,
) -> PermissionDecision {
    let params = RequestPermissionParams {
        session_id: session.session_id().to_string(),
        tool_call: ToolCallRef {
            tool_call_id: tool_call_id.to_string(),
            title: "Exit plan mode".to_string(),
            raw_input: Some(input.clone()),
        },
        options: vec![
            PermissionOption {
                option_id: OPTION_EXIT_ACCEPT_EDITS.to_string(),
                name: "Yes, and auto-accept edits".to_string(),
                kind: PermissionOptionKind::AllowAlways,
            },
            PermissionOption {
                option_id: OPTION_EXIT_DEFAULT.to_string(),
                name: "Yes, and manually approve edits".to_string(),
                kind: PermissionOptionKind::AllowOnce,
            },
            PermissionOption {
                option_id: OPTION_STAY_PLAN.to_string(),
                name: "No, keep planning".to_string(),
                kind: PermissionOptionKind::RejectOnce,
            },
        ],
    };

    match session.client().request_permission(params).await {
        Some(RequestPermissionOutcome::Selected { option_id })
            if option_id == OPTION_EXIT_ACCEPT_EDITS =>
        {
            session.update_mode(PermissionMode::AcceptEdits);
            PermissionDecision::allow()
        }
        Some(RequestPermissionOutcome::Selected { option_id })
            if option_id == OPTION_EXIT_DEFAULT =>
        {
            session.update_mode(PermissionMode::Default);
            PermissionDecision::allow()
        }
        _ => PermissionDecision::deny("User chose to stay in plan mode"),
    }
}
