use std::process::ExitCode;

/// Errors that cause evolver to exit with a specific code.
#[derive(Debug, thiserror::Error)]
pub enum ExitError {
    #[error("config error: {0}")]
    Config(String),

    #[error("tool not found: {tool}")]
    ToolNotFound { tool: String },

    #[error("{tool} failed (exit {code}): {message}")]
    ToolFailed {
        tool: String,
        code: i32,
        message: String,
    },

    #[error("{tool} timed out after {timeout_secs}s")]
    Timeout { tool: String, timeout_secs: u64 },

    /// A run was refused before it changed any state (task not pending,
    /// lease already held, sender not authorized).
    #[error("precondition failed: {0}")]
    Precondition(String),

    #[error("{0}")]
    Other(String),
}

impl ExitError {
    pub fn exit_code(&self) -> ExitCode {
        match self {
            ExitError::Config(_) => ExitCode::from(2),
            ExitError::ToolNotFound { .. } => ExitCode::from(3),
            ExitError::ToolFailed { .. } => ExitCode::from(4),
            ExitError::Timeout { .. } => ExitCode::from(5),
            ExitError::Precondition(_) => ExitCode::from(6),
            ExitError::Other(_) => ExitCode::from(1),
        }
    }

    /// True for a subprocess that exceeded its deadline.
    pub fn is_timeout(&self) -> bool {
        matches!(self, ExitError::Timeout { .. })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn precondition_message() {
        let err = ExitError::Precondition("lease evolution is held".into());
        assert!(!err.is_timeout());
        assert_eq!(err.to_string(), "precondition failed: lease evolution is held");
    }

    #[test]
    fn timeout_message_names_tool() {
        let err = ExitError::Timeout {
            tool: "claude".into(),
            timeout_secs: 3600,
        };
        assert!(err.is_timeout());
        assert_eq!(err.to_string(), "claude timed out after 3600s");
    }
}
