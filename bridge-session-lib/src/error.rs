//! Error types for the session bridge

/// Errors that can occur while driving a backend session.
///
/// Recoverable conditions (permission denial, unmatched tool results) are
/// handled locally and never surface here; what does surface either ends the
/// current call (`AuthRequired`, `InvalidConfig`, ...) or makes the session
/// unusable (`TransportFailure`, `SpawnFailed`).
#[derive(Debug, thiserror::Error)]
pub enum BridgeError {
    #[error("Backend authentication required: {0}")]
    AuthRequired(String),

    #[error("Tool permission denied: {reason}")]
    ToolPermissionDenied { reason: String, interrupt: bool },

    #[error("Unsupported {what}: {value}")]
    InvalidConfig { what: &'static str, value: String },

    #[error("Protocol violation from backend: {0}")]
    ProtocolViolation(String),

    #[error("Backend transport failure: {0}")]
    TransportFailure(String),

    #[error("Cannot resume session {0}: no native resume token and no persisted history")]
    ResumeUnavailable(String),

    #[error("Session not found: {0}")]
    SessionNotFound(String),

    #[error("A prompt is already in flight for session {0}")]
    PromptInFlight(String),

    #[error("Unknown extension method: {0}")]
    MethodNotFound(String),

    #[error("Turn failed: {0}")]
    TurnFailed(String),

    #[error("Failed to spawn backend process: {0}")]
    SpawnFailed(#[source] std::io::Error),

    #[error("Backend communication error: {0}")]
    CommunicationError(String),

    #[error("Session already exited with code {0}")]
    AlreadyExited(i32),

    #[error("History store error: {0}")]
    Storage(String),

    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    #[error("Claude client error: {0}")]
    Claude(#[from] claude_codes::Error),
}

impl BridgeError {
    /// Whether the session that produced this error must be torn down.
    ///
    /// Fatal errors are stream/process failures: the execution handle is gone
    /// or in an unknown state and the registry terminates the session rather
    /// than retrying the call.
    pub fn is_fatal(&self) -> bool {
        matches!(
            self,
            BridgeError::TransportFailure(_)
                | BridgeError::SpawnFailed(_)
                | BridgeError::CommunicationError(_)
                | BridgeError::AlreadyExited(_)
        )
    }

    /// Protocol error code for surfacing over the wire.
    pub fn code(&self) -> i64 {
        match self {
            BridgeError::AuthRequired(_) => shared::error_codes::AUTH_REQUIRED,
            BridgeError::InvalidConfig { .. } => shared::error_codes::INVALID_CONFIG,
            BridgeError::SessionNotFound(_) => shared::error_codes::SESSION_NOT_FOUND,
            BridgeError::ResumeUnavailable(_) => shared::error_codes::RESUME_UNAVAILABLE,
            BridgeError::MethodNotFound(_) => shared::error_codes::METHOD_NOT_FOUND,
            BridgeError::PromptInFlight(_) => shared::error_codes::INVALID_PARAMS,
            BridgeError::Serialization(_) => shared::error_codes::PARSE_ERROR,
            _ => shared::error_codes::INTERNAL_ERROR,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn error_display() {
        let err = BridgeError::SessionNotFound("s-1".to_string());
        assert_eq!(format!("{}", err), "Session not found: s-1");

        let err = BridgeError::InvalidConfig {
            what: "mode id",
            value: "turbo".to_string(),
        };
        assert_eq!(format!("{}", err), "Unsupported mode id: turbo");

        let err = BridgeError::PromptInFlight("s-2".to_string());
        assert_eq!(
            format!("{}", err),
            "A prompt is already in flight for session s-2"
        );
    }

    #[test]
    fn fatal_classification() {
        assert!(BridgeError::TransportFailure("pipe closed".into()).is_fatal());
        assert!(BridgeError::AlreadyExited(1).is_fatal());
        assert!(!BridgeError::AuthRequired("expired".into()).is_fatal());
        assert!(!BridgeError::ToolPermissionDenied {
            reason: "denied".into(),
            interrupt: true
        }
        .is_fatal());
        assert!(!BridgeError::ResumeUnavailable("s".into()).is_fatal());
    }

    #[test]
    fn wire_codes() {
        assert_eq!(
            BridgeError::AuthRequired("x".into()).code(),
            shared::error_codes::AUTH_REQUIRED
        );
        assert_eq!(
            BridgeError::MethodNotFound("x".into()).code(),
            shared::error_codes::METHOD_NOT_FOUND
        );
    }
}
