//! Token usage accounting for LLM operations.

use serde::{Deserialize, Serialize};
use std::ops::{Add, AddAssign};

/// Token usage reported by one LLM call.
///
/// `cached_tokens` counts the portion of `prompt_tokens` served from the
/// provider's prompt cache; cost estimation prices the two bands
/// differently.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Usage {
    /// Tokens in the prompt.
    #[serde(default)]
    pub prompt_tokens: u32,

    /// Prompt tokens served from the provider's cache.
    #[serde(default)]
    pub cached_tokens: u32,

    /// Tokens generated in the completion.
    #[serde(default)]
    pub completion_tokens: u32,

    /// Reasoning tokens (models with hidden chains of thought).
    #[serde(default)]
    pub reasoning_tokens: u32,
}

impl Usage {
    /// Create a usage record with prompt and completion counts.
    #[must_use]
    pub const fn new(prompt_tokens: u32, completion_tokens: u32) -> Self {
        Self {
            prompt_tokens,
            cached_tokens: 0,
            completion_tokens,
            reasoning_tokens: 0,
        }
    }

    /// An empty usage record.
    #[must_use]
    pub const fn zero() -> Self {
        Self {
            prompt_tokens: 0,
            cached_tokens: 0,
            completion_tokens: 0,
            reasoning_tokens: 0,
        }
    }

    /// Set cached prompt tokens.
    #[must_use]
    pub const fn with_cached(mut self, cached: u32) -> Self {
        self.cached_tokens = cached;
        self
    }

    /// Set reasoning tokens.
    #[must_use]
    pub const fn with_reasoning(mut self, reasoning: u32) -> Self {
        self.reasoning_tokens = reasoning;
        self
    }

    /// Total tokens across prompt and completion.
    #[must_use]
    pub const fn total(&self) -> u32 {
        self.prompt_tokens + self.completion_tokens
    }

    /// Returns `true` when nothing was counted.
    #[must_use]
    pub const fn is_zero(&self) -> bool {
        self.prompt_tokens == 0 && self.completion_tokens == 0 && self.reasoning_tokens == 0
    }
}

impl Add for Usage {
    type Output = Self;

    fn add(self, rhs: Self) -> Self {
        Self {
            prompt_tokens: self.prompt_tokens + rhs.prompt_tokens,
            cached_tokens: self.cached_tokens + rhs.cached_tokens,
            completion_tokens: self.completion_tokens + rhs.completion_tokens,
            reasoning_tokens: self.reasoning_tokens + rhs.reasoning_tokens,
        }
    }
}

impl AddAssign for Usage {
    fn add_assign(&mut self, rhs: Self) {
        *self = *self + rhs;
    }
}
