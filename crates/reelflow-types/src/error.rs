use thiserror::Error;

/// The error vocabulary shared across the pipeline. Stage code decides
/// between re-queueing and terminal error states based on `is_retriable`.
#[derive(Debug, Error)]
pub enum CoreError {
    #[error("validation failed: {0}")]
    Validation(String),

    #[error("credentials rejected: {0}")]
    Auth(String),

    #[error("not found: {0}")]
    NotFound(String),

    #[error("rate limited: {0}")]
    RateLimited(String),

    #[error("tool `{program}` timed out after {seconds}s")]
    Timeout { program: String, seconds: u64 },

    #[error("tool `{program}` exited with code {exit_code}: {stderr}")]
    ToolFailure {
        program: String,
        exit_code: i32,
        stderr: String,
    },

    #[error("conflicting update: {0}")]
    Conflict(String),

    #[error("path escapes workspace: {0}")]
    PathEscape(String),
}

impl CoreError {
    /// Retriable errors send the task back to its prior queued-equivalent
    /// status; everything else is fatal for the current stage.
    pub fn is_retriable(&self) -> bool {
        matches!(
            self,
            CoreError::RateLimited(_) | CoreError::Timeout { .. } | CoreError::Conflict(_)
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn classification_matches_propagation_policy() {
        assert!(CoreError::RateLimited("429".into()).is_retriable());
        assert!(CoreError::Timeout {
            program: "generate_video".into(),
            seconds: 600,
        }
        .is_retriable());
        assert!(CoreError::Conflict("already transitioned".into()).is_retriable());

        assert!(!CoreError::Validation("missing title".into()).is_retriable());
        assert!(!CoreError::Auth("bad key".into()).is_retriable());
        assert!(!CoreError::PathEscape("../x".into()).is_retriable());
    }
}
