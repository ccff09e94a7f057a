//! The request envelope.
//!
//! An [`AgentCommand`] carries everything the executor needs to serve one
//! request. Commands are immutable after construction; build them with
//! [`AgentCommand::builder`].

use std::collections::HashMap;

use serde_json::Value;

use crate::message::{MediaAttachment, Message};

/// How the executor drives the model.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, serde::Serialize, serde::Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ExecutionMode {
    /// One completion, no tool loop.
    Standard,
    /// Reason-act loop with tool execution.
    #[default]
    React,
}

/// The request envelope handed to the executor.
#[derive(Debug, Clone)]
pub struct AgentCommand {
    /// System prompt for the run.
    pub system_prompt: String,
    /// The user's prompt.
    pub user_prompt: String,
    /// Execution mode.
    pub mode: ExecutionMode,
    /// Sampling temperature; provider default when `None`.
    pub temperature: Option<f32>,
    /// Override of the executor's tool-call budget.
    pub max_tool_calls: Option<u32>,
    /// Requesting user, when known.
    pub user_id: Option<String>,
    /// Tenant the request bills to, when known.
    pub tenant_id: Option<String>,
    /// Conversation session, when the caller wants persistence.
    pub session_id: Option<String>,
    /// Explicit conversation history; when non-empty it is used verbatim
    /// instead of the memory store.
    pub history: Vec<Message>,
    /// Caller metadata, copied into the hook context.
    pub metadata: HashMap<String, Value>,
    /// Attachments for the user message, in order.
    pub media: Vec<MediaAttachment>,
    /// Expected response shape.
    pub response_format: crate::provider::ResponseFormat,
}

impl AgentCommand {
    /// Start building a command from the user's prompt.
    #[must_use]
    pub fn builder(user_prompt: impl Into<String>) -> AgentCommandBuilder {
        AgentCommandBuilder::new(user_prompt)
    }

    /// The subject used for per-caller accounting (rate limits): the user
    /// when known, else the tenant, else a shared bucket.
    #[must_use]
    pub fn subject(&self) -> &str {
        self.user_id
            .as_deref()
            .or(self.tenant_id.as_deref())
            .unwrap_or("anonymous")
    }
}

/// Builder for [`AgentCommand`].
#[derive(Debug, Clone)]
pub struct AgentCommandBuilder {
    command: AgentCommand,
}

impl AgentCommandBuilder {
    fn new(user_prompt: impl Into<String>) -> Self {
        Self {
            command: AgentCommand {
                system_prompt: String::new(),
                user_prompt: user_prompt.into(),
                mode: ExecutionMode::default(),
                temperature: None,
                max_tool_calls: None,
                user_id: None,
                tenant_id: None,
                session_id: None,
                history: Vec::new(),
                metadata: HashMap::new(),
                media: Vec::new(),
                response_format: crate::provider::ResponseFormat::Text,
            },
        }
    }

    /// Set the system prompt.
    #[must_use]
    pub fn system_prompt(mut self, prompt: impl Into<String>) -> Self {
        self.command.system_prompt = prompt.into();
        self
    }

    /// Set the execution mode.
    #[must_use]
    pub const fn mode(mut self, mode: ExecutionMode) -> Self {
        self.command.mode = mode;
        self
    }

    /// Set the sampling temperature.
    #[must_use]
    pub const fn temperature(mut self, temperature: f32) -> Self {
        self.command.temperature = Some(temperature);
        self
    }

    /// Cap the tool-call budget for this request.
    #[must_use]
    pub const fn max_tool_calls(mut self, max: u32) -> Self {
        self.command.max_tool_calls = Some(max);
        self
    }

    /// Set the requesting user.
    #[must_use]
    pub fn user_id(mut self, user_id: impl Into<String>) -> Self {
        self.command.user_id = Some(user_id.into());
        self
    }

    /// Set the tenant.
    #[must_use]
    pub fn tenant_id(mut self, tenant_id: impl Into<String>) -> Self {
        self.command.tenant_id = Some(tenant_id.into());
        self
    }

    /// Set the conversation session.
    #[must_use]
    pub fn session_id(mut self, session_id: impl Into<String>) -> Self {
        self.command.session_id = Some(session_id.into());
        self
    }

    /// Provide explicit history, used verbatim instead of the store.
    #[must_use]
    pub fn history(mut self, history: Vec<Message>) -> Self {
        self.command.history = history;
        self
    }

    /// Attach a metadata entry.
    #[must_use]
    pub fn metadata(mut self, key: impl Into<String>, value: Value) -> Self {
        self.command.metadata.insert(key.into(), value);
        self
    }

    /// Attach media to the user message.
    #[must_use]
    pub fn media(mut self, media: Vec<MediaAttachment>) -> Self {
        self.command.media = media;
        self
    }

    /// Set the expected response shape.
    #[must_use]
    pub const fn response_format(mut self, format: crate::provider::ResponseFormat) -> Self {
        self.command.response_format = format;
        self
    }

    /// Finish building.
    #[must_use]
    pub fn build(self) -> AgentCommand {
        self.command
    }
}
