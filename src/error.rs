use thiserror::Error;

/// Errors produced by the workflow core.
///
/// CLI entry points wrap these in `anyhow` with added context; everything
/// below the CLI returns this enum so callers can branch on the failure
/// class (retryable vs terminal, recoverable vs not).
#[derive(Debug, Error)]
pub enum WorkflowError {
    /// Node dependency graph contains a cycle. Fatal for the phase.
    #[error("cycle detected in node dependencies involving '{0}'")]
    CycleDetected(String),

    /// A node lists a dependency that is not part of the phase.
    #[error("node '{node}' depends on unknown node '{dependency}'")]
    UnknownDependency { node: String, dependency: String },

    /// Node parameter validation failed. Fails the node immediately, no retry.
    #[error("invalid parameters for node '{node}': {reason}")]
    InvalidParams { node: String, reason: String },

    /// A node execution failed.
    #[error("node '{node}' failed: {reason}")]
    NodeFailed { node: String, reason: String },

    /// Navigation produced an HTTP error status. Routed through recovery.
    #[error("HTTP {status}: {message}")]
    HttpStatus { status: u16, message: String },

    /// URL queue backend failure.
    #[error("queue error: {0}")]
    Queue(String),

    /// Repository backend failure.
    #[error("storage error: {0}")]
    Storage(String),

    /// Browser collaborator failure.
    #[error("browser error: {0}")]
    Browser(String),

    /// No context-aware rule matched the error. Triggers the AI fallback.
    #[error("no recovery rule matched: {0}")]
    NoRuleMatched(String),

    /// Recovery ran out of options (no rule, AI disabled or unsuccessful).
    #[error("recovery exhausted: {0}")]
    RecoveryExhausted(String),

    /// AI collaborator failure.
    #[error("AI client error: {0}")]
    Ai(String),

    /// Workflow definition could not be loaded or is inconsistent.
    #[error("workflow definition error: {0}")]
    Definition(String),

    /// The execution was canceled via its cancellation token.
    #[error("execution canceled")]
    Canceled,
}

impl WorkflowError {
    /// Whether a URL that failed with this error may be re-enqueued.
    ///
    /// Validation and graph-construction failures are deterministic, so
    /// retrying them would loop forever. Transport-level failures and
    /// server-side HTTP errors are worth another attempt.
    pub fn is_retryable(&self) -> bool {
        match self {
            WorkflowError::HttpStatus { status, .. } => *status == 429 || *status >= 500,
            WorkflowError::Browser(_) | WorkflowError::Queue(_) | WorkflowError::Storage(_) => {
                true
            }
            WorkflowError::NodeFailed { .. } => true,
            _ => false,
        }
    }

    /// Short stable signature used by the pattern analyzer to group errors.
    pub fn signature(&self) -> String {
        match self {
            WorkflowError::HttpStatus { status, .. } => format!("http_{}", status),
            WorkflowError::NodeFailed { node, .. } => format!("node_failed:{}", node),
            WorkflowError::Browser(_) => "browser".to_string(),
            WorkflowError::Queue(_) => "queue".to_string(),
            WorkflowError::Storage(_) => "storage".to_string(),
            other => format!("{:?}", std::mem::discriminant(other)),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_retryable_classification() {
        assert!(WorkflowError::HttpStatus {
            status: 429,
            message: "rate limit exceeded".into()
        }
        .is_retryable());
        assert!(WorkflowError::HttpStatus {
            status: 503,
            message: "service unavailable".into()
        }
        .is_retryable());
        assert!(!WorkflowError::HttpStatus {
            status: 404,
            message: "not found".into()
        }
        .is_retryable());
        assert!(!WorkflowError::CycleDetected("a".into()).is_retryable());
        assert!(!WorkflowError::InvalidParams {
            node: "n1".into(),
            reason: "missing selector".into()
        }
        .is_retryable());
    }

    #[test]
    fn test_http_signature() {
        let err = WorkflowError::HttpStatus {
            status: 429,
            message: "rate limit exceeded".into(),
        };
        assert_eq!(err.signature(), "http_429");
    }
}
