//! Convenience re-exports for building and serving agents.
//!
//! ```rust,ignore
//! use relay::prelude::*;
//! ```

pub use crate::boundary::{MinViolationMode, OutputBoundary};
pub use crate::breaker::{BreakerState, CircuitBreaker, CircuitBreakerConfig, CircuitBreakerRegistry};
pub use crate::cache::{CachedResponse, Fingerprint, InMemoryResponseCache, ResponseCache};
pub use crate::command::{AgentCommand, ExecutionMode};
pub use crate::error::{AgentError, ErrorCode, LlmErrorKind, Result};
pub use crate::executor::{
    AgentExecutor, AgentExecutorBuilder, CommandResolver, ContextRetriever, ExecutorConfig,
    StreamEvent,
};
pub use crate::fallback::FallbackStrategy;
pub use crate::filter::{MaxLengthResponseFilter, ResponseFilter, ResponseFilterChain};
pub use crate::guard::{
    GuardPipeline, GuardRejectCategory, GuardResult, GuardStage, InjectionDetectionStage,
    InputValidationStage, OutputGuardPipeline, OutputGuardStage, PermissionStage, RateLimitStage,
};
pub use crate::hook::{
    AgentCompleteHook, AgentStartHook, HookContext, HookExecutor, HookResult, ToolCallOutcome,
    ToolEndHook, ToolStartHook,
};
pub use crate::memory::{
    ConversationConfig, ConversationManager, ConversationSummary, InMemoryStore, MemoryStore,
    MessageTrimmer, Summarizer, SummaryDraft, SummaryService, SummaryStore, UserMemoryStore,
};
pub use crate::message::{MediaAttachment, Message, MessageRole, ToolCall};
pub use crate::metrics::{
    Drainer, MetricEvent, MetricEventStore, MetricRingBuffer, MetricWriter, MetricWriterConfig,
    PublishOutcome, WriterHealth,
};
pub use crate::pricing::{CostCalculator, ModelPricing, ModelPricingStore};
pub use crate::provider::{
    ChunkStream, CompletionChunk, CompletionOptions, CompletionRequest, CompletionResponse,
    LanguageModel, ResponseFormat, ToolDefinition,
};
pub use crate::result::AgentResult;
pub use crate::retry::RetryPolicy;
pub use crate::token::{HeuristicTokenEstimator, TokenEstimator};
pub use crate::tool::{
    AllSelector, DynTool, EmbeddingProvider, KeywordCategorySelector, RemoteTool, RemoteToolClient,
    SemanticSelector, Tool, ToolOutput, ToolRegistry, ToolSelector, WorkerAgentTool,
};
pub use crate::usage::Usage;
