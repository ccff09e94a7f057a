//! Message types for agent-model communication.
//!
//! A conversation is an insertion-ordered sequence of [`Message`]s. Within
//! one request the executor is the only writer, so ordering is total: the
//! assistant message that requested tool calls always precedes the
//! [`Message::ToolResponse`] entries that answer it.

use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

/// Role of a message in a conversation.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum MessageRole {
    /// System message providing instructions.
    System,
    /// User message.
    User,
    /// Assistant (model) message.
    Assistant,
    /// Tool response message.
    #[serde(rename = "tool")]
    ToolResponse,
}

impl MessageRole {
    /// Get the string representation of the role.
    #[must_use]
    pub const fn as_str(&self) -> &'static str {
        match self {
            Self::System => "system",
            Self::User => "user",
            Self::Assistant => "assistant",
            Self::ToolResponse => "tool",
        }
    }
}

/// A media attachment carried alongside a user message.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MediaAttachment {
    /// MIME type of the attachment (e.g. `image/png`).
    pub mime_type: String,
    /// Reference to the payload: a URL or an opaque storage key.
    pub reference: String,
}

impl MediaAttachment {
    /// Create a new attachment.
    #[must_use]
    pub fn new(mime_type: impl Into<String>, reference: impl Into<String>) -> Self {
        Self {
            mime_type: mime_type.into(),
            reference: reference.into(),
        }
    }
}

/// A tool invocation requested by the model.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ToolCall {
    /// Name of the tool to invoke.
    pub name: String,
    /// Arguments as a JSON object.
    pub arguments: Map<String, Value>,
    /// Monotonic index of this call within the run.
    pub call_index: u32,
}

impl ToolCall {
    /// Create a new tool call.
    #[must_use]
    pub fn new(name: impl Into<String>, arguments: Map<String, Value>, call_index: u32) -> Self {
        Self {
            name: name.into(),
            arguments,
            call_index,
        }
    }

    /// Serialize the arguments to a JSON string for the tool boundary.
    #[must_use]
    pub fn arguments_json(&self) -> String {
        serde_json::to_string(&self.arguments).unwrap_or_else(|_| "{}".to_owned())
    }
}

/// A message in a conversation.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "role", rename_all = "lowercase")]
pub enum Message {
    /// System message providing instructions.
    System {
        /// The instruction text.
        text: String,
    },
    /// User message.
    User {
        /// The user text.
        text: String,
        /// Attachments, in order.
        #[serde(default, skip_serializing_if = "Vec::is_empty")]
        media: Vec<MediaAttachment>,
    },
    /// Assistant (model) message, possibly requesting tool calls.
    Assistant {
        /// The assistant text, empty when the turn is tool calls only.
        text: String,
        /// Tool calls requested by the model.
        #[serde(default, skip_serializing_if = "Vec::is_empty")]
        tool_calls: Vec<ToolCall>,
    },
    /// Response produced by a tool.
    #[serde(rename = "tool")]
    ToolResponse {
        /// Name of the tool that produced this response.
        name: String,
        /// Normalized text content of the response.
        content: String,
    },
}

impl Message {
    /// Create a system message.
    #[must_use]
    pub fn system(text: impl Into<String>) -> Self {
        Self::System { text: text.into() }
    }

    /// Create a user message without attachments.
    #[must_use]
    pub fn user(text: impl Into<String>) -> Self {
        Self::User {
            text: text.into(),
            media: Vec::new(),
        }
    }

    /// Create a user message with attachments.
    #[must_use]
    pub fn user_with_media(text: impl Into<String>, media: Vec<MediaAttachment>) -> Self {
        Self::User {
            text: text.into(),
            media,
        }
    }

    /// Create a plain assistant message.
    #[must_use]
    pub fn assistant(text: impl Into<String>) -> Self {
        Self::Assistant {
            text: text.into(),
            tool_calls: Vec::new(),
        }
    }

    /// Create an assistant message carrying tool calls.
    #[must_use]
    pub fn assistant_with_tools(text: impl Into<String>, tool_calls: Vec<ToolCall>) -> Self {
        Self::Assistant {
            text: text.into(),
            tool_calls,
        }
    }

    /// Create a tool response message.
    #[must_use]
    pub fn tool_response(name: impl Into<String>, content: impl Into<String>) -> Self {
        Self::ToolResponse {
            name: name.into(),
            content: content.into(),
        }
    }

    /// The role of this message.
    #[must_use]
    pub const fn role(&self) -> MessageRole {
        match self {
            Self::System { .. } => MessageRole::System,
            Self::User { .. } => MessageRole::User,
            Self::Assistant { .. } => MessageRole::Assistant,
            Self::ToolResponse { .. } => MessageRole::ToolResponse,
        }
    }

    /// The text content of this message.
    #[must_use]
    pub fn text(&self) -> &str {
        match self {
            Self::System { text } | Self::User { text, .. } | Self::Assistant { text, .. } => text,
            Self::ToolResponse { content, .. } => content,
        }
    }

    /// Returns `true` for user messages.
    #[must_use]
    pub const fn is_user(&self) -> bool {
        matches!(self, Self::User { .. })
    }

    /// Returns `true` for assistant messages that request tool calls.
    #[must_use]
    pub fn has_tool_calls(&self) -> bool {
        matches!(self, Self::Assistant { tool_calls, .. } if !tool_calls.is_empty())
    }

    /// The tool calls requested by this message, if any.
    #[must_use]
    pub fn tool_calls(&self) -> &[ToolCall] {
        match self {
            Self::Assistant { tool_calls, .. } => tool_calls,
            _ => &[],
        }
    }
}
