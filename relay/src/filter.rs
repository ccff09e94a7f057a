//! Response post-processing filters.
//!
//! Non-streaming only. Filters run in order after boundary enforcement
//! and before the conversation save. Each filter maps content to
//! content, must be idempotent, and fails open: a broken filter is
//! logged and the chain continues with the prior content.

use std::sync::Arc;

use async_trait::async_trait;
use tracing::warn;

use crate::boundary::TRUNCATED_MARKER;
use crate::error::Result;
use crate::hook::HookContext;

/// One post-processing step.
#[async_trait]
pub trait ResponseFilter: Send + Sync {
    /// Filter name for logs.
    fn name(&self) -> &str;

    /// Transform the content.
    async fn apply(&self, content: String, ctx: &HookContext) -> Result<String>;
}

/// Ordered, fail-open filter chain.
#[derive(Default)]
pub struct ResponseFilterChain {
    filters: Vec<Arc<dyn ResponseFilter>>,
}

impl ResponseFilterChain {
    /// Create a chain; filters run in the given order.
    #[must_use]
    pub fn new(filters: Vec<Arc<dyn ResponseFilter>>) -> Self {
        Self { filters }
    }

    /// An empty chain.
    #[must_use]
    pub fn empty() -> Self {
        Self::default()
    }

    /// Returns `true` when no filters are configured.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.filters.is_empty()
    }

    /// Run the chain.
    pub async fn apply(&self, content: String, ctx: &HookContext) -> String {
        let mut current = content;
        for filter in &self.filters {
            match filter.apply(current.clone(), ctx).await {
                Ok(next) => current = next,
                Err(err) => {
                    warn!(filter = filter.name(), error = %err, "Response filter failed; keeping prior content");
                }
            }
        }
        current
    }
}

impl std::fmt::Debug for ResponseFilterChain {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ResponseFilterChain")
            .field(
                "filters",
                &self.filters.iter().map(|f| f.name().to_owned()).collect::<Vec<_>>(),
            )
            .finish()
    }
}

/// Truncates content to a maximum character count, appending the
/// truncation marker. Idempotent: already-marked content passes through.
#[derive(Debug, Clone, Copy)]
pub struct MaxLengthResponseFilter {
    max_chars: usize,
}

impl MaxLengthResponseFilter {
    /// Create a filter with the given cap.
    #[must_use]
    pub const fn new(max_chars: usize) -> Self {
        Self { max_chars }
    }
}

#[async_trait]
impl ResponseFilter for MaxLengthResponseFilter {
    fn name(&self) -> &str {
        "max_length"
    }

    async fn apply(&self, content: String, _ctx: &HookContext) -> Result<String> {
        if self.max_chars == 0
            || content.chars().count() <= self.max_chars
            || content.ends_with(TRUNCATED_MARKER)
        {
            return Ok(content);
        }
        let cut: String = content.chars().take(self.max_chars).collect();
        Ok(format!("{cut}{TRUNCATED_MARKER}"))
    }
}
