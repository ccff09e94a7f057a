//! The response envelope returned by the executor.

use std::time::Duration;

use crate::error::{AgentError, ErrorCode};

/// Outcome of one agent run.
#[derive(Debug, Clone)]
pub struct AgentResult {
    /// Whether the run completed successfully.
    pub success: bool,
    /// Final content on success (or partial content on some failures).
    pub content: Option<String>,
    /// Tools executed during the run, in completion order.
    pub tools_used: Vec<String>,
    /// Stable error code on failure.
    pub error_code: Option<ErrorCode>,
    /// Human-readable error message on failure.
    pub error_message: Option<String>,
    /// Wall-clock duration of the run, including queue wait.
    pub duration: Duration,
}

impl AgentResult {
    /// A successful result.
    #[must_use]
    pub fn success(content: impl Into<String>, tools_used: Vec<String>, duration: Duration) -> Self {
        Self {
            success: true,
            content: Some(content.into()),
            tools_used,
            error_code: None,
            error_message: None,
            duration,
        }
    }

    /// A failed result with an explicit code.
    #[must_use]
    pub fn failure(
        code: ErrorCode,
        message: impl Into<String>,
        duration: Duration,
    ) -> Self {
        Self {
            success: false,
            content: None,
            tools_used: Vec::new(),
            error_code: Some(code),
            error_message: Some(message.into()),
            duration,
        }
    }

    /// Build a failed result from an error.
    #[must_use]
    pub fn from_error(error: &AgentError, duration: Duration) -> Self {
        Self::failure(error.code(), error.to_string(), duration)
    }

    /// Record the tools used; failure paths keep whatever ran before the
    /// failure so callers can account for side effects.
    #[must_use]
    pub fn with_tools_used(mut self, tools_used: Vec<String>) -> Self {
        self.tools_used = tools_used;
        self
    }

    /// The content, or empty.
    #[must_use]
    pub fn content_or_empty(&self) -> &str {
        self.content.as_deref().unwrap_or("")
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_success_shape() {
        let result = AgentResult::success("done", vec!["search".to_owned()], Duration::ZERO);
        assert!(result.success);
        assert_eq!(result.content_or_empty(), "done");
        assert!(result.error_code.is_none());
    }

    #[test]
    fn test_from_error() {
        let err = AgentError::Overloaded;
        let result = AgentResult::from_error(&err, Duration::from_millis(3));
        assert!(!result.success);
        assert_eq!(result.error_code, Some(ErrorCode::Overloaded));
        assert!(result.error_message.is_some());
    }
}
