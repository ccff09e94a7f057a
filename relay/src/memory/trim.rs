//! Context-window trimming.
//!
//! Invoked on every loop iteration before the model call. The budget is
//! `max_context_window_tokens − tokens(system) − output_reserve_tokens`;
//! trimming drops whole interaction units so an assistant message that
//! requested tool calls is never separated from the tool responses that
//! answer it, and the final user message survives everything.

use std::sync::Arc;

use tracing::debug;

use crate::message::Message;
use crate::token::TokenEstimator;

/// Two-phase message trimmer.
pub struct MessageTrimmer {
    estimator: Arc<dyn TokenEstimator>,
}

/// A run of messages removed or kept atomically: either one message, or
/// an assistant-with-tool-calls followed by its tool responses.
#[derive(Debug)]
struct Unit {
    len: usize,
    tokens: u32,
    is_tool_interaction: bool,
    contains_last_user: bool,
}

impl MessageTrimmer {
    /// Create a trimmer over a token estimator.
    #[must_use]
    pub fn new(estimator: Arc<dyn TokenEstimator>) -> Self {
        Self { estimator }
    }

    /// Trim `messages` to fit the budget.
    ///
    /// When the budget is non-positive, only the most recent user
    /// message survives.
    #[must_use]
    pub fn trim(
        &self,
        system_prompt: &str,
        messages: Vec<Message>,
        max_context_tokens: u32,
        output_reserve_tokens: u32,
    ) -> Vec<Message> {
        let system_tokens = self.estimator.estimate(system_prompt);
        let budget =
            i64::from(max_context_tokens) - i64::from(system_tokens) - i64::from(output_reserve_tokens);

        if budget <= 0 {
            // No room for history at all: keep the last user message only.
            let last_user = messages.iter().rposition(Message::is_user);
            return match last_user {
                Some(i) => vec![messages.into_iter().nth(i).unwrap_or(Message::user(""))],
                None => Vec::new(),
            };
        }
        let budget = budget as u32;

        if self.estimator.estimate_messages(&messages) <= budget {
            return messages;
        }

        let units = self.units(&messages);
        let mut total: u32 = units.iter().map(|u| u.tokens).sum();

        // Phase 1: drop the oldest units from the front, never touching
        // the unit that holds the last user message.
        let mut dropped = vec![false; units.len()];
        for (i, unit) in units.iter().enumerate() {
            if total <= budget {
                break;
            }
            if unit.contains_last_user {
                break;
            }
            dropped[i] = true;
            total -= unit.tokens;
        }

        // Phase 2: still over budget — drop tool-interaction units after
        // the last user message, oldest first.
        if total > budget {
            let last_user_unit = units.iter().position(|u| u.contains_last_user);
            if let Some(anchor) = last_user_unit {
                for (i, unit) in units.iter().enumerate().skip(anchor + 1) {
                    if total <= budget {
                        break;
                    }
                    if unit.is_tool_interaction {
                        dropped[i] = true;
                        total -= unit.tokens;
                    }
                }
            }
        }

        if total > budget {
            debug!(total, budget, "Messages still over budget after trimming");
        }

        let keep: Vec<bool> = units
            .iter()
            .zip(&dropped)
            .flat_map(|(unit, &gone)| std::iter::repeat_n(!gone, unit.len))
            .collect();
        messages
            .into_iter()
            .zip(keep)
            .filter_map(|(message, keep)| keep.then_some(message))
            .collect()
    }

    /// Group messages into atomic units.
    fn units(&self, messages: &[Message]) -> Vec<Unit> {
        let last_user = messages.iter().rposition(Message::is_user);
        let mut units = Vec::new();
        let mut i = 0;

        while i < messages.len() {
            let start = i;
            let is_tool_interaction = messages[i].has_tool_calls();
            i += 1;
            if is_tool_interaction {
                // Absorb the tool responses that answer this assistant turn.
                while i < messages.len()
                    && matches!(messages[i], Message::ToolResponse { .. })
                {
                    i += 1;
                }
            }

            let len = i - start;
            let tokens = self.estimator.estimate_messages(&messages[start..i]);
            units.push(Unit {
                len,
                tokens,
                is_tool_interaction,
                contains_last_user: last_user.is_some_and(|u| u >= start && u < i),
            });
        }

        units
    }
}

impl std::fmt::Debug for MessageTrimmer {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("MessageTrimmer").finish_non_exhaustive()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::message::ToolCall;
    use crate::token::HeuristicTokenEstimator;
    use serde_json::Map;

    fn trimmer() -> MessageTrimmer {
        MessageTrimmer::new(Arc::new(HeuristicTokenEstimator))
    }

    fn long_text(chars: usize) -> String {
        "x".repeat(chars)
    }

    #[test]
    fn test_under_budget_untouched() {
        let messages = vec![Message::user("hello"), Message::assistant("hi")];
        let out = trimmer().trim("system", messages.clone(), 1000, 10);
        assert_eq!(out.len(), 2);
    }

    #[test]
    fn test_zero_budget_keeps_last_user_only() {
        let messages = vec![
            Message::user("first"),
            Message::assistant("answer"),
            Message::user("second"),
        ];
        // Reserve swallows the whole window.
        let out = trimmer().trim("system", messages, 100, 100);
        assert_eq!(out.len(), 1);
        assert_eq!(out[0].text(), "second");
    }

    #[test]
    fn test_phase1_drops_oldest_first() {
        let messages = vec![
            Message::user(long_text(400)),      // ~104 tokens
            Message::assistant(long_text(400)), // ~104 tokens
            Message::user("latest question"),
        ];
        // Budget fits only the last message.
        let out = trimmer().trim("", messages, 60, 0);
        assert_eq!(out.len(), 1);
        assert_eq!(out[0].text(), "latest question");
    }

    #[test]
    fn test_tool_interaction_unit_is_atomic() {
        let call = ToolCall::new("search", Map::new(), 0);
        let messages = vec![
            Message::assistant_with_tools(long_text(200), vec![call]),
            Message::tool_response("search", long_text(200)),
            Message::user("latest"),
        ];
        // Budget forces the tool interaction out; both halves must go.
        let out = trimmer().trim("", messages, 30, 0);
        assert_eq!(out.len(), 1);
        assert_eq!(out[0].text(), "latest");
    }

    #[test]
    fn test_phase2_drops_tool_interactions_after_last_user() {
        let call = ToolCall::new("search", Map::new(), 0);
        let messages = vec![
            Message::user("question"),
            Message::assistant_with_tools("", vec![call.clone()]),
            Message::tool_response("search", long_text(800)),
            Message::assistant_with_tools("", vec![call]),
            Message::tool_response("search", long_text(800)),
        ];
        // Nothing before the user message to drop; phase 2 must remove
        // tool interactions after it.
        let out = trimmer().trim("", messages, 250, 0);
        assert!(out.iter().any(Message::is_user));
        let tool_responses = out
            .iter()
            .filter(|m| matches!(m, Message::ToolResponse { .. }))
            .count();
        assert!(tool_responses < 2);
        // Orphaned tool responses never appear: every remaining response
        // is preceded by its assistant request.
        for (i, message) in out.iter().enumerate() {
            if matches!(message, Message::ToolResponse { .. }) {
                assert!(i > 0);
                assert!(out[i - 1].has_tool_calls() || matches!(out[i - 1], Message::ToolResponse { .. }));
            }
        }
    }

    #[test]
    fn test_last_user_message_always_survives() {
        let messages = vec![
            Message::user(long_text(4000)),
            Message::assistant(long_text(4000)),
            Message::user(long_text(4000)),
        ];
        let out = trimmer().trim("", messages, 50, 0);
        assert_eq!(out.len(), 1);
        assert!(out[0].is_user());
    }

    #[test]
    fn test_result_fits_budget_or_only_last_user() {
        let estimator = Arc::new(HeuristicTokenEstimator);
        let messages = vec![
            Message::user("one"),
            Message::assistant(long_text(100)),
            Message::user("two"),
            Message::assistant(long_text(100)),
            Message::user("three"),
        ];
        let budget = 40;
        let out = MessageTrimmer::new(Arc::<HeuristicTokenEstimator>::clone(&estimator))
            .trim("", messages, budget, 0);

        let total = estimator.estimate_messages(&out);
        let only_last_user = out.len() == 1 && out[0].is_user();
        assert!(total <= budget || only_last_user);
    }
}
