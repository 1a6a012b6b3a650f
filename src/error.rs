use thiserror::Error;

/// Errors surfaced by the execution boundary.
///
/// Process-level failures (non-zero exit, timeout) are not errors: they
/// are encoded in the `ExecutionResult`.
#[derive(Debug, Error)]
pub enum RunnerError {
    /// Policy violation or malformed request. Never retried.
    #[error("{0}")]
    InvalidInput(String),

    /// The working directory or executable is unusable.
    #[error("execution setup failed: {0}")]
    ExecutionSetup(String),

    /// Anything unclassified. Details stay in the server log.
    #[error("internal error: {0}")]
    Internal(#[from] anyhow::Error),
}

impl RunnerError {
    pub fn invalid_input(reason: impl Into<String>) -> Self {
        Self::InvalidInput(reason.into())
    }

    /// Machine-readable code returned to callers.
    pub fn code(&self) -> &'static str {
        match self {
            Self::InvalidInput(_) => "invalid_input",
            Self::ExecutionSetup(_) => "execution_setup_error",
            Self::Internal(_) => "internal_error",
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_codes() {
        assert_eq!(RunnerError::invalid_input("x").code(), "invalid_input");
        assert_eq!(
            RunnerError::ExecutionSetup("x".into()).code(),
            "execution_setup_error"
        );
        assert_eq!(
            RunnerError::from(anyhow::anyhow!("boom")).code(),
            "internal_error"
        );
    }

    #[test]
    fn test_invalid_input_message_is_the_reason() {
        let err = RunnerError::invalid_input("command cannot be empty");
        assert_eq!(err.to_string(), "command cannot be empty");
    }
}
