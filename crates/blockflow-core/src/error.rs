use crate::models::ValueType;

/// Errors raised while validating or executing a block graph.
#[derive(Debug, Clone, PartialEq, thiserror::Error)]
pub enum FlowError {
    #[error("Invalid graph '{command}': {}", .problems.join("; "))]
    InvalidGraph {
        command: String,
        problems: Vec<String>,
    },

    #[error("Unresolved variable '{name}' (available: {})", list_or_none(.available))]
    UnresolvedVariable { name: String, available: Vec<String> },

    #[error("Missing argument ${index}: only {provided} positional argument(s) provided")]
    MissingArgument { index: usize, provided: usize },

    #[error("Undefined variable '{0}' in condition")]
    UndefinedVariable(String),

    #[error("Invalid condition '{condition}': {reason}")]
    InvalidCondition { condition: String, reason: String },

    #[error("Cannot cast '{value}' to {target}")]
    CastFailure { value: String, target: ValueType },

    #[error("Prompt failed: {0}")]
    PromptFailure(String),

    #[error("Step limit exceeded: {0}")]
    StepLimitExceeded(String),

    #[error("Agent session unavailable: {0}")]
    SessionUnavailable(String),

    #[error("Session busy: {0}")]
    SessionBusy(String),

    #[error("Command not found: /{0}")]
    CommandNotFound(String),

    #[error("Shell command rejected: {0}")]
    ShellRejected(String),

    #[error("Invalid invocation: {0}")]
    InvalidInvocation(String),

    #[error("Run cancelled")]
    Cancelled,

    #[error("Internal error: {0}")]
    Internal(String),
}

fn list_or_none(names: &[String]) -> String {
    if names.is_empty() {
        "none".to_string()
    } else {
        names.join(", ")
    }
}

/// A [`FlowError`] attributed to the block that raised it.
#[derive(Debug, Clone, PartialEq, thiserror::Error)]
#[error("block '{block_id}' ({block_name}) in /{command}: {error}")]
pub struct BlockFailure {
    pub block_id: String,
    pub block_name: String,
    pub command: String,
    pub error: FlowError,
}

impl BlockFailure {
    pub fn new(
        block_id: impl Into<String>,
        block_name: impl Into<String>,
        command: impl Into<String>,
        error: FlowError,
    ) -> Self {
        Self {
            block_id: block_id.into(),
            block_name: block_name.into(),
            command: command.into(),
            error,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_unresolved_variable_lists_available_names() {
        let err = FlowError::UnresolvedVariable {
            name: "missing".to_string(),
            available: vec!["count".to_string(), "status".to_string()],
        };
        assert_eq!(
            err.to_string(),
            "Unresolved variable 'missing' (available: count, status)"
        );

        let err = FlowError::UnresolvedVariable {
            name: "x".to_string(),
            available: vec![],
        };
        assert!(err.to_string().ends_with("(available: none)"));
    }

    #[test]
    fn test_block_failure_display_names_block_and_command() {
        let failure = BlockFailure::new(
            "b3",
            "Check status",
            "deploy",
            FlowError::UndefinedVariable("status".to_string()),
        );
        assert_eq!(
            failure.to_string(),
            "block 'b3' (Check status) in /deploy: Undefined variable 'status' in condition"
        );
    }
}
