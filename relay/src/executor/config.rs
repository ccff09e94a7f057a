//! Executor configuration.
//!
//! One typed struct covers every recognized key; the composition root
//! fills it from whatever configuration source the deployment uses.
//! Defaults are serviceable for a single-node deployment.

use std::time::Duration;

use crate::boundary::OutputBoundary;
use crate::breaker::CircuitBreakerConfig;
use crate::memory::ConversationConfig;
use crate::metrics::MetricWriterConfig;
use crate::retry::RetryPolicy;

/// Admission and loop limits for the executor.
#[derive(Debug, Clone)]
pub struct ExecutorConfig {
    /// Concurrent requests served; further requests queue or fail.
    pub max_concurrent_requests: usize,
    /// Reject immediately at saturation instead of queueing.
    pub fail_fast_on_saturation: bool,
    /// Bound on the entire request, queue wait included.
    pub request_timeout: Duration,
    /// Bound on each individual tool call.
    pub tool_call_timeout: Duration,
    /// Tool-call budget per request (overridable per command).
    pub max_tool_calls: u32,
    /// Cap on tools advertised to the model per request.
    pub max_tools_per_request: usize,
    /// Concurrent tool executions per request.
    pub tool_parallelism: usize,
    /// Model context window, in tokens.
    pub max_context_window_tokens: u32,
    /// Tokens reserved for the model's output.
    pub output_reserve_tokens: u32,
    /// Commands at or below this temperature are cacheable.
    pub cacheable_temperature: f32,
    /// Cap on normalized tool output length, in characters.
    pub max_tool_output_length: usize,
    /// Whether the response filter chain runs.
    pub filters_enabled: bool,
    /// Output length bounds.
    pub boundary: OutputBoundary,
    /// Outbound retry policy.
    pub retry: RetryPolicy,
    /// Circuit breaker settings shared by the registry.
    pub breaker: CircuitBreakerConfig,
    /// Conversation memory settings.
    pub conversation: ConversationConfig,
    /// Metric writer settings.
    pub metrics: MetricWriterConfig,
    /// Ring buffer size (rounded up to a power of two, floor 64).
    pub ring_buffer_size: usize,
}

impl Default for ExecutorConfig {
    fn default() -> Self {
        Self {
            max_concurrent_requests: 64,
            fail_fast_on_saturation: false,
            request_timeout: Duration::from_secs(60),
            tool_call_timeout: Duration::from_secs(30),
            max_tool_calls: 8,
            max_tools_per_request: 32,
            tool_parallelism: 4,
            max_context_window_tokens: 128_000,
            output_reserve_tokens: 4_096,
            cacheable_temperature: 0.0,
            max_tool_output_length: 16_384,
            filters_enabled: true,
            boundary: OutputBoundary::default(),
            retry: RetryPolicy::default(),
            breaker: CircuitBreakerConfig::default(),
            conversation: ConversationConfig::default(),
            metrics: MetricWriterConfig::default(),
            ring_buffer_size: 1024,
        }
    }
}
