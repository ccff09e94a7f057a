//! Error types for the relay runtime.
//!
//! Every failure that can cross the admission boundary is represented here.
//! The executor never lets an error escape as a panic or a raw `Err` to the
//! transport layer: failures are folded into an
//! [`AgentResult`](crate::result::AgentResult) (non-streaming) or an
//! `Error` event followed by `Done` (streaming), carrying the
//! [`ErrorCode`] taxonomy below.

use thiserror::Error;

/// A type alias for `Result<T, AgentError>`.
pub type Result<T> = std::result::Result<T, AgentError>;

/// Stable error codes surfaced to callers.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, serde::Serialize, serde::Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
#[non_exhaustive]
pub enum ErrorCode {
    /// A guard stage rejected the request before any LLM work.
    GuardRejected,
    /// A lifecycle hook rejected the request.
    HookRejected,
    /// The request permit could not be acquired in fail-fast mode.
    Overloaded,
    /// The request permit wait exceeded the request timeout.
    QueueTimeout,
    /// The LLM call timed out after all retries.
    Timeout,
    /// The circuit breaker guarding the LLM endpoint is open.
    CircuitBreakerOpen,
    /// The output guard rejected the final content.
    OutputGuardRejected,
    /// The final content fell short of the minimum length in `Fail` mode.
    OutputTooShort,
    /// The request asked for something the runtime cannot serve
    /// (e.g. structured output over a stream).
    InvalidResponse,
    /// A tool failed in a way that aborted the request.
    ToolFailed,
    /// The LLM call failed after retries and fallback.
    LlmFailed,
}

impl ErrorCode {
    /// The wire representation of this code.
    #[must_use]
    pub const fn as_str(&self) -> &'static str {
        match self {
            Self::GuardRejected => "GUARD_REJECTED",
            Self::HookRejected => "HOOK_REJECTED",
            Self::Overloaded => "OVERLOADED",
            Self::QueueTimeout => "QUEUE_TIMEOUT",
            Self::Timeout => "TIMEOUT",
            Self::CircuitBreakerOpen => "CIRCUIT_BREAKER_OPEN",
            Self::OutputGuardRejected => "OUTPUT_GUARD_REJECTED",
            Self::OutputTooShort => "OUTPUT_TOO_SHORT",
            Self::InvalidResponse => "INVALID_RESPONSE",
            Self::ToolFailed => "TOOL_FAILED",
            Self::LlmFailed => "LLM_FAILED",
        }
    }
}

impl std::fmt::Display for ErrorCode {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// How an upstream LLM failure should be treated by retry and breaker logic.
#[derive(Debug, Clone, Copy, PartialEq, Eq, serde::Serialize, serde::Deserialize)]
#[serde(rename_all = "snake_case")]
#[non_exhaustive]
pub enum LlmErrorKind {
    /// I/O or deadline timeout.
    Timeout,
    /// Provider returned a 5xx-class failure.
    Server,
    /// Provider rate-limited the call (429 with a retry hint).
    RateLimited,
    /// Authentication or authorization failure.
    Auth,
    /// The request itself was malformed.
    BadRequest,
    /// Anything else.
    Other,
}

impl LlmErrorKind {
    /// Whether a failure of this kind may be retried.
    ///
    /// Only timeouts, server failures, and rate limits are transient;
    /// auth and bad-request failures will not improve on retry.
    #[must_use]
    pub const fn is_transient(&self) -> bool {
        matches!(self, Self::Timeout | Self::Server | Self::RateLimited)
    }
}

/// The main error type for runtime operations.
#[derive(Debug, Error)]
#[non_exhaustive]
pub enum AgentError {
    /// A guard stage rejected the request.
    #[error("guard stage '{stage}' rejected request: {message}")]
    GuardRejected {
        /// Name of the rejecting stage.
        stage: String,
        /// Rejection category (e.g. `rate_limit`).
        category: crate::guard::GuardRejectCategory,
        /// Human-readable reason.
        message: String,
    },

    /// An output guard stage rejected the final content.
    #[error("output guard '{stage}' rejected response: {message}")]
    OutputGuardRejected {
        /// Name of the rejecting stage.
        stage: String,
        /// Rejection category.
        category: crate::guard::GuardRejectCategory,
        /// Human-readable reason.
        message: String,
    },

    /// A lifecycle hook rejected the request.
    #[error("hook '{hook}' rejected request: {reason}")]
    HookRejected {
        /// Name of the rejecting hook.
        hook: String,
        /// Rejection reason.
        reason: String,
    },

    /// A hook deferred the request pending external approval.
    #[error("hook '{hook}' requires approval ({approval_id}): {message}")]
    PendingApproval {
        /// Name of the deferring hook.
        hook: String,
        /// Identifier the approval flow will resolve.
        approval_id: String,
        /// Message shown to the approver.
        message: String,
    },

    /// No request permit was available in fail-fast mode.
    #[error("request rejected: executor at max concurrency")]
    Overloaded,

    /// The permit wait exceeded the request timeout.
    #[error("request timed out waiting for an execution permit")]
    QueueTimeout,

    /// The circuit breaker guarding an endpoint is open.
    #[error("circuit breaker '{name}' is open")]
    CircuitBreakerOpen {
        /// Breaker name.
        name: String,
    },

    /// The LLM call failed.
    #[error("model call failed: {message}")]
    Llm {
        /// Failure classification for retry/breaker decisions.
        kind: LlmErrorKind,
        /// The underlying error message.
        message: String,
    },

    /// A tool failed in a way that aborted the request.
    #[error("tool '{name}' failed: {message}")]
    Tool {
        /// Name of the failing tool.
        name: String,
        /// The underlying error message.
        message: String,
    },

    /// The request asked for an unsupported response shape.
    #[error("invalid response request: {message}")]
    InvalidResponse {
        /// What was unsupported.
        message: String,
    },

    /// The final content fell short of the configured minimum length.
    #[error("response shorter than {min_chars} characters")]
    OutputTooShort {
        /// Configured minimum.
        min_chars: usize,
    },

    /// A memory or summary store operation failed.
    #[error("memory error: {message}")]
    Memory {
        /// The underlying error message.
        message: String,
    },

    /// Invalid runtime configuration.
    #[error("configuration error: {message}")]
    Configuration {
        /// Description of the configuration issue.
        message: String,
    },

    /// JSON serialization/deserialization error.
    #[error("json error: {0}")]
    Json(#[from] serde_json::Error),

    /// The request was cancelled cooperatively.
    ///
    /// Never retried, never counted by circuit breakers.
    #[error("cancelled")]
    Cancelled,

    /// Generic internal error.
    #[error("internal error: {message}")]
    Internal {
        /// The underlying error message.
        message: String,
    },
}

impl AgentError {
    /// Create an LLM error of the given kind.
    #[must_use]
    pub fn llm(kind: LlmErrorKind, message: impl Into<String>) -> Self {
        Self::Llm {
            kind,
            message: message.into(),
        }
    }

    /// Create an LLM timeout error.
    #[must_use]
    pub fn llm_timeout(message: impl Into<String>) -> Self {
        Self::llm(LlmErrorKind::Timeout, message)
    }

    /// Create a tool failure error.
    #[must_use]
    pub fn tool(name: impl Into<String>, message: impl Into<String>) -> Self {
        Self::Tool {
            name: name.into(),
            message: message.into(),
        }
    }

    /// Create a memory error.
    #[must_use]
    pub fn memory(message: impl Into<String>) -> Self {
        Self::Memory {
            message: message.into(),
        }
    }

    /// Create a configuration error.
    #[must_use]
    pub fn configuration(message: impl Into<String>) -> Self {
        Self::Configuration {
            message: message.into(),
        }
    }

    /// Create an internal error.
    #[must_use]
    pub fn internal(message: impl Into<String>) -> Self {
        Self::Internal {
            message: message.into(),
        }
    }

    /// Whether this error may be retried by the outbound retry policy.
    ///
    /// Cancellation is never a failure; admission rejections are final.
    #[must_use]
    pub const fn is_transient(&self) -> bool {
        match self {
            Self::Llm { kind, .. } => kind.is_transient(),
            _ => false,
        }
    }

    /// Whether this error represents cooperative cancellation.
    #[must_use]
    pub const fn is_cancellation(&self) -> bool {
        matches!(self, Self::Cancelled)
    }

    /// The stable code surfaced to callers for this error.
    #[must_use]
    pub const fn code(&self) -> ErrorCode {
        match self {
            Self::GuardRejected { .. } => ErrorCode::GuardRejected,
            Self::OutputGuardRejected { .. } => ErrorCode::OutputGuardRejected,
            Self::HookRejected { .. } | Self::PendingApproval { .. } => ErrorCode::HookRejected,
            Self::Overloaded => ErrorCode::Overloaded,
            Self::QueueTimeout => ErrorCode::QueueTimeout,
            Self::CircuitBreakerOpen { .. } => ErrorCode::CircuitBreakerOpen,
            Self::Llm {
                kind: LlmErrorKind::Timeout,
                ..
            } => ErrorCode::Timeout,
            Self::Llm { .. } => ErrorCode::LlmFailed,
            Self::Tool { .. } => ErrorCode::ToolFailed,
            Self::InvalidResponse { .. } => ErrorCode::InvalidResponse,
            Self::OutputTooShort { .. } => ErrorCode::OutputTooShort,
            Self::Memory { .. }
            | Self::Configuration { .. }
            | Self::Json(_)
            | Self::Cancelled
            | Self::Internal { .. } => ErrorCode::LlmFailed,
        }
    }
}
