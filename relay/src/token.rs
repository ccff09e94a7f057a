//! Token estimation for context-window budgeting.

use crate::message::Message;

/// Estimates the token count of a piece of text.
///
/// Estimators are pure: the same text always yields the same count. The
/// trimmer and the conversation manager budget against these estimates, so
/// a conservative (slightly high) estimator is preferable to an optimistic
/// one.
pub trait TokenEstimator: Send + Sync {
    /// Estimate the token count of `text`.
    fn estimate(&self, text: &str) -> u32;

    /// Estimate the token count of a message, including a small
    /// per-message framing overhead.
    fn estimate_message(&self, message: &Message) -> u32 {
        let mut tokens = self.estimate(message.text()) + 4;
        for call in message.tool_calls() {
            tokens += self.estimate(&call.name) + self.estimate(&call.arguments_json());
        }
        tokens
    }

    /// Estimate the total token count of a message sequence.
    fn estimate_messages(&self, messages: &[Message]) -> u32 {
        messages.iter().map(|m| self.estimate_message(m)).sum()
    }
}

/// Character-ratio estimator: one token per four characters, rounded up.
///
/// Good enough for budgeting across the model families this runtime
/// serves; swap in a tokenizer-backed estimator through the builder when
/// exact counts matter.
#[derive(Debug, Clone, Copy, Default)]
pub struct HeuristicTokenEstimator;

impl TokenEstimator for HeuristicTokenEstimator {
    fn estimate(&self, text: &str) -> u32 {
        u32::try_from(text.chars().count().div_ceil(4)).unwrap_or(u32::MAX)
    }
}
