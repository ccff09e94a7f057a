//! Output boundary enforcement.
//!
//! After the reasoning loop produces final content, the boundary checks
//! its length. Over-long content is truncated with a marker; under-short
//! content is handled per the configured mode — warn and keep, retry the
//! model once with a continuation prompt, or fail the request.

use serde::{Deserialize, Serialize};

/// Marker appended to truncated responses.
pub const TRUNCATED_MARKER: &str = "[Response truncated]";

/// What to do when content falls short of the minimum length.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum MinViolationMode {
    /// Record the violation and keep the content.
    #[default]
    Warn,
    /// Ask the model once for a longer response; accept the retry only
    /// if it meets the minimum.
    RetryOnce,
    /// Fail the request with `OUTPUT_TOO_SHORT`.
    Fail,
}

/// Boundary configuration. Zero disables a limit.
#[derive(Debug, Clone, Copy, Default)]
pub struct OutputBoundary {
    /// Maximum content length in characters; 0 disables.
    pub output_max_chars: usize,
    /// Minimum content length in characters; 0 disables.
    pub output_min_chars: usize,
    /// Handling for minimum-length violations.
    pub min_violation_mode: MinViolationMode,
}

impl OutputBoundary {
    /// Apply the maximum-length bound. Returns the (possibly truncated)
    /// content and whether it was cut.
    #[must_use]
    pub fn enforce_max(&self, content: String) -> (String, bool) {
        if self.output_max_chars == 0 || content.chars().count() <= self.output_max_chars {
            return (content, false);
        }
        let cut: String = content.chars().take(self.output_max_chars).collect();
        (format!("{cut}{TRUNCATED_MARKER}"), true)
    }

    /// Whether content meets the minimum-length bound.
    #[must_use]
    pub fn meets_min(&self, content: &str) -> bool {
        self.output_min_chars == 0 || content.chars().count() >= self.output_min_chars
    }

    /// The continuation prompt used by [`MinViolationMode::RetryOnce`].
    #[must_use]
    pub fn continuation_prompt(&self) -> String {
        format!(
            "The previous answer was too brief. Provide a complete answer of at least {} characters, covering the question fully.",
            self.output_min_chars
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_max_disabled_by_zero() {
        let boundary = OutputBoundary::default();
        let (content, cut) = boundary.enforce_max("anything at all".to_owned());
        assert_eq!(content, "anything at all");
        assert!(!cut);
    }

    #[test]
    fn test_max_truncates_with_marker() {
        let boundary = OutputBoundary {
            output_max_chars: 10,
            ..Default::default()
        };
        let (content, cut) = boundary.enforce_max("aaaaaaaaaaaa".to_owned());
        assert_eq!(content, format!("aaaaaaaaaa{TRUNCATED_MARKER}"));
        assert!(cut);
    }

    #[test]
    fn test_min_check() {
        let boundary = OutputBoundary {
            output_min_chars: 5,
            ..Default::default()
        };
        assert!(!boundary.meets_min("hi"));
        assert!(boundary.meets_min("hello"));
        assert!(OutputBoundary::default().meets_min(""));
    }

    #[test]
    fn test_continuation_prompt_names_limit() {
        let boundary = OutputBoundary {
            output_min_chars: 120,
            min_violation_mode: MinViolationMode::RetryOnce,
            ..Default::default()
        };
        assert!(boundary.continuation_prompt().contains("120"));
    }
}
