//! Asynchronous metric ingestion.
//!
//! Producers publish [`MetricEvent`]s into a lock-free [`MetricRingBuffer`]
//! and never block; a single [`MetricWriter`] drains the buffer on a fixed
//! interval, enriches token-usage events with estimated cost, and
//! batch-persists through the [`MetricEventStore`](writer::MetricEventStore)
//! boundary. Under pressure the buffer sheds events rather than slowing
//! the request path.

use std::time::{Duration, SystemTime};

use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};

use crate::breaker::BreakerState;
use crate::error::ErrorCode;
use crate::guard::GuardRejectCategory;
use crate::usage::Usage;

pub mod ring;
pub mod writer;

pub use ring::{Drainer, MetricRingBuffer, PublishOutcome};
pub use writer::{MetricEventStore, MetricWriter, MetricWriterConfig, WriterHealth};

/// An observability event produced somewhere on the request path.
///
/// Every variant carries the tenant resolved at publish time, so the
/// writer never has to join request state back in.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
#[non_exhaustive]
pub enum MetricEvent {
    /// Token usage for one LLM call.
    TokenUsage {
        /// Provider identifier.
        provider: String,
        /// Model identifier.
        model: String,
        /// When the call completed.
        at: SystemTime,
        /// Token counts.
        usage: Usage,
        /// Estimated cost; filled in by the writer.
        estimated_cost_usd: Option<Decimal>,
        /// Billing tenant, when known.
        tenant_id: Option<String>,
    },

    /// One tool execution.
    ToolCall {
        /// Tool name.
        name: String,
        /// Execution duration.
        duration: Duration,
        /// Whether the tool succeeded.
        success: bool,
        /// Billing tenant, when known.
        tenant_id: Option<String>,
    },

    /// One completed request.
    Execution {
        /// Wall-clock duration including queue wait.
        duration: Duration,
        /// Whether the request succeeded.
        success: bool,
        /// Error code on failure.
        error_code: Option<ErrorCode>,
        /// Billing tenant, when known.
        tenant_id: Option<String>,
    },

    /// A guard stage rejected a request.
    GuardRejection {
        /// Rejecting stage name.
        stage: String,
        /// Rejection category.
        category: GuardRejectCategory,
        /// Billing tenant, when known.
        tenant_id: Option<String>,
    },

    /// A circuit breaker changed state.
    BreakerTransition {
        /// Breaker name.
        name: String,
        /// Previous state.
        from: BreakerState,
        /// New state.
        to: BreakerState,
        /// Billing tenant, when known.
        tenant_id: Option<String>,
    },

    /// The output boundary mutated or flagged a response.
    BoundaryViolation {
        /// Applied policy (`truncate`, `warn`, `retry_once`, `fail`).
        policy: String,
        /// Observed content length in characters.
        observed_chars: usize,
        /// The violated limit in characters.
        limit_chars: usize,
        /// Billing tenant, when known.
        tenant_id: Option<String>,
    },
}

impl MetricEvent {
    /// The event kind, for counters and logs.
    #[must_use]
    pub const fn kind(&self) -> &'static str {
        match self {
            Self::TokenUsage { .. } => "token_usage",
            Self::ToolCall { .. } => "tool_call",
            Self::Execution { .. } => "execution",
            Self::GuardRejection { .. } => "guard_rejection",
            Self::BreakerTransition { .. } => "breaker_transition",
            Self::BoundaryViolation { .. } => "boundary_violation",
        }
    }
}
