//! The LLM provider boundary.
//!
//! The runtime owns the reasoning loop; providers only turn a message list
//! into one completion (or one stream of chunks). Provider adapters —
//! HTTP SDK wrappers, local inference shims — live outside this crate and
//! implement [`LanguageModel`].

use std::collections::HashMap;
use std::pin::Pin;

use async_trait::async_trait;
use futures::Stream;
use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::error::Result;
use crate::message::{Message, ToolCall};
use crate::usage::Usage;

/// A boxed stream of completion chunks.
pub type ChunkStream = Pin<Box<dyn Stream<Item = Result<CompletionChunk>> + Send>>;

/// Shape of the response the caller expects.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ResponseFormat {
    /// Free-form text.
    #[default]
    Text,
    /// A single JSON document.
    Json,
    /// A single YAML document.
    Yaml,
}

impl ResponseFormat {
    /// Structured formats require a complete document and cannot be
    /// produced incrementally.
    #[must_use]
    pub const fn is_structured(&self) -> bool {
        matches!(self, Self::Json | Self::Yaml)
    }
}

/// Definition of a tool advertised to the model.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ToolDefinition {
    /// Name of the tool (snake_case).
    pub name: String,
    /// Description that helps the model decide when to call it.
    pub description: String,
    /// JSON Schema of the tool's arguments.
    pub parameters: Value,
}

impl ToolDefinition {
    /// Create a new tool definition.
    #[must_use]
    pub fn new(name: impl Into<String>, description: impl Into<String>, parameters: Value) -> Self {
        Self {
            name: name.into(),
            description: description.into(),
            parameters,
        }
    }
}

/// Options for one completion call.
#[derive(Debug, Clone, Default)]
pub struct CompletionOptions {
    /// Model override; the provider's default when `None`.
    pub model: Option<String>,
    /// Sampling temperature.
    pub temperature: Option<f32>,
    /// Maximum tokens to generate.
    pub max_output_tokens: Option<u32>,
    /// Tools the model may request. The runtime owns execution:
    /// provider-side tool execution is always disabled.
    pub tools: Vec<ToolDefinition>,
    /// Expected response shape.
    pub response_format: ResponseFormat,
    /// Opaque per-request metadata forwarded to the provider.
    pub metadata: HashMap<String, String>,
}

/// One completion request: messages plus options.
#[derive(Debug, Clone, Default)]
pub struct CompletionRequest {
    /// Conversation messages, system first.
    pub messages: Vec<Message>,
    /// Call options.
    pub options: CompletionOptions,
}

impl CompletionRequest {
    /// Create a request from messages.
    #[must_use]
    pub fn new(messages: Vec<Message>) -> Self {
        Self {
            messages,
            options: CompletionOptions::default(),
        }
    }

    /// Set the options.
    #[must_use]
    pub fn with_options(mut self, options: CompletionOptions) -> Self {
        self.options = options;
        self
    }
}

/// A complete (non-streaming) model response.
#[derive(Debug, Clone, Default)]
pub struct CompletionResponse {
    /// Generated text, if any.
    pub text: Option<String>,
    /// Tool calls requested by the model, in emission order.
    pub tool_calls: Vec<ToolCall>,
    /// Token usage for this call.
    pub usage: Usage,
    /// The model that actually served the call.
    pub model: String,
}

impl CompletionResponse {
    /// Returns `true` when the model requested at least one tool call.
    #[must_use]
    pub fn has_tool_calls(&self) -> bool {
        !self.tool_calls.is_empty()
    }

    /// The generated text, or empty.
    #[must_use]
    pub fn text_or_empty(&self) -> &str {
        self.text.as_deref().unwrap_or("")
    }
}

/// One chunk of a streaming response.
///
/// Usage metadata, when the provider reports it at all, arrives on the
/// final chunk.
#[derive(Debug, Clone, Default)]
pub struct CompletionChunk {
    /// Incremental text.
    pub text: Option<String>,
    /// Completed tool calls surfaced by this chunk.
    pub tool_calls: Vec<ToolCall>,
    /// Usage metadata (final chunk only).
    pub usage: Option<Usage>,
}

/// A language model endpoint.
///
/// `complete` must be side-effect free from the runtime's perspective:
/// retries assume that re-sending an identical request is safe.
#[async_trait]
pub trait LanguageModel: Send + Sync {
    /// Identifier used in logs, metrics, and pricing lookups.
    fn provider(&self) -> &str;

    /// The model used when a request carries no override.
    fn default_model(&self) -> &str;

    /// Send a completion request and await the full response.
    async fn complete(&self, request: &CompletionRequest) -> Result<CompletionResponse>;

    /// Send a completion request and receive incremental chunks.
    ///
    /// Providers without streaming support may keep the default, which
    /// fails with an unsupported-operation model error.
    async fn stream(&self, request: &CompletionRequest) -> Result<ChunkStream> {
        let _ = request;
        Err(crate::error::AgentError::llm(
            crate::error::LlmErrorKind::Other,
            format!("provider '{}' does not support streaming", self.provider()),
        ))
    }
}
