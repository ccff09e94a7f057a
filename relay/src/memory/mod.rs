//! Conversation memory.
//!
//! The [`ConversationManager`] loads and saves history around each run
//! and applies hierarchical summarization when sessions outgrow the
//! configured trigger. Store errors degrade, never fail a request: a
//! broken memory path falls back to the most recent turns, and a failed
//! save is logged and forgotten.

use std::sync::Arc;

use async_trait::async_trait;
use tracing::warn;

use crate::command::AgentCommand;
use crate::error::Result;
use crate::message::Message;

pub mod summary;
pub mod trim;

pub use summary::{ConversationSummary, SummaryDraft, SummaryService, SummaryStore, Summarizer};
pub use trim::MessageTrimmer;

/// Conversation persistence (`conversation turns by session`).
#[async_trait]
pub trait MemoryStore: Send + Sync {
    /// Load a session's messages, oldest first. `None` when the session
    /// is unknown.
    async fn get(&self, session_id: &str) -> Result<Option<Vec<Message>>>;

    /// Append one message to a session.
    async fn add_message(
        &self,
        session_id: &str,
        message: Message,
        user_id: Option<&str>,
    ) -> Result<()>;

    /// Delete a session and its messages.
    async fn delete_session(&self, session_id: &str) -> Result<()>;
}

/// Long-lived per-user facts (`user_memories` table), merged into the
/// system context when the store is wired.
#[async_trait]
pub trait UserMemoryStore: Send + Sync {
    /// Facts known about a user, in storage order.
    async fn find_facts(&self, user_id: &str) -> Result<Vec<(String, String)>>;
}

/// In-process memory store, for tests and single-node deployments.
#[derive(Debug, Default)]
pub struct InMemoryStore {
    sessions: std::sync::Mutex<std::collections::HashMap<String, Vec<Message>>>,
}

impl InMemoryStore {
    /// An empty store.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl MemoryStore for InMemoryStore {
    async fn get(&self, session_id: &str) -> Result<Option<Vec<Message>>> {
        Ok(self
            .sessions
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .get(session_id)
            .cloned())
    }

    async fn add_message(
        &self,
        session_id: &str,
        message: Message,
        _user_id: Option<&str>,
    ) -> Result<()> {
        self.sessions
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .entry(session_id.to_owned())
            .or_default()
            .push(message);
        Ok(())
    }

    async fn delete_session(&self, session_id: &str) -> Result<()> {
        self.sessions
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .remove(session_id);
        Ok(())
    }
}

/// Hierarchical-memory configuration.
#[derive(Debug, Clone)]
pub struct ConversationConfig {
    /// Whether summarization is applied at all.
    pub summary_enabled: bool,
    /// Message count past which summarization kicks in.
    pub trigger_message_count: usize,
    /// Recent messages kept verbatim below the summary tiers.
    pub recent_message_count: usize,
    /// Fallback window (in turns) when summarization is disabled,
    /// empty, or failing.
    pub max_conversation_turns: usize,
}

impl Default for ConversationConfig {
    fn default() -> Self {
        Self {
            summary_enabled: true,
            trigger_message_count: 20,
            recent_message_count: 10,
            max_conversation_turns: 50,
        }
    }
}

/// Loads and saves conversation history around each run.
pub struct ConversationManager {
    store: Option<Arc<dyn MemoryStore>>,
    summarizer: Option<Arc<Summarizer>>,
    config: ConversationConfig,
}

impl ConversationManager {
    /// Create a manager. Both collaborators are optional: without a
    /// store, only explicit command history is served; without a
    /// summarizer, the window fallback applies.
    #[must_use]
    pub fn new(
        store: Option<Arc<dyn MemoryStore>>,
        summarizer: Option<Arc<Summarizer>>,
        config: ConversationConfig,
    ) -> Self {
        Self {
            store,
            summarizer,
            config,
        }
    }

    /// The history to prepend for this command.
    ///
    /// Explicit command history is used verbatim. Otherwise the session
    /// is fetched and, when hierarchical memory applies, compressed to
    /// `[facts, narrative] + recent`.
    pub async fn load_history(&self, command: &AgentCommand) -> Vec<Message> {
        if !command.history.is_empty() {
            return command.history.clone();
        }

        let Some(session_id) = command.session_id.as_deref() else {
            return Vec::new();
        };
        let Some(store) = &self.store else {
            return Vec::new();
        };

        let messages = match store.get(session_id).await {
            Ok(Some(messages)) => messages,
            Ok(None) => return Vec::new(),
            Err(err) => {
                warn!(session = session_id, error = %err, "Memory load failed; starting fresh");
                return Vec::new();
            }
        };

        if self.config.summary_enabled
            && messages.len() > self.config.trigger_message_count
            && self.summarizer.is_some()
        {
            match self.hierarchical(session_id, &messages).await {
                Ok(Some(compressed)) => return compressed,
                Ok(None) => {}
                Err(err) => {
                    warn!(session = session_id, error = %err, "Hierarchical memory failed; using window");
                }
            }
        }

        self.take_last(messages)
    }

    /// Assemble the three-tier view, or `None` when the summary came
    /// back empty (the caller falls back to the window).
    async fn hierarchical(
        &self,
        session_id: &str,
        messages: &[Message],
    ) -> Result<Option<Vec<Message>>> {
        let summarizer = self
            .summarizer
            .as_ref()
            .ok_or_else(|| crate::error::AgentError::internal("summarizer not wired"))?;

        let split = messages.len().saturating_sub(self.config.recent_message_count);
        let summary = match summarizer.find(session_id).await? {
            Some(summary) if summary.summarized_up_to >= split => summary,
            _ => summarizer.summarize_now(session_id, messages, split).await?,
        };

        if summary.is_effectively_empty() {
            return Ok(None);
        }

        let mut compressed = Vec::with_capacity(self.config.recent_message_count + 2);
        compressed.push(Message::system(summary.facts_text()));
        compressed.push(Message::system(summary.narrative_text()));
        compressed.extend_from_slice(&messages[split.min(messages.len())..]);
        Ok(Some(compressed))
    }

    fn take_last(&self, messages: Vec<Message>) -> Vec<Message> {
        let window = self.config.max_conversation_turns * 2;
        if messages.len() <= window {
            messages
        } else {
            messages[messages.len() - window..].to_vec()
        }
    }

    /// Persist the completed exchange and kick off background
    /// summarization. Only called on success; failures are logged.
    pub async fn save_history(&self, command: &AgentCommand, assistant_content: &str) {
        let Some(session_id) = command.session_id.as_deref() else {
            return;
        };
        let Some(store) = &self.store else {
            return;
        };

        let user_id = command.user_id.as_deref();
        let user_turn = if command.media.is_empty() {
            Message::user(command.user_prompt.clone())
        } else {
            Message::user_with_media(command.user_prompt.clone(), command.media.clone())
        };

        for message in [user_turn, Message::assistant(assistant_content)] {
            if let Err(err) = store.add_message(session_id, message, user_id).await {
                warn!(session = session_id, error = %err, "Conversation save failed");
                return;
            }
        }

        if self.config.summary_enabled
            && let Some(summarizer) = &self.summarizer
            && let Ok(Some(messages)) = store.get(session_id).await
            && messages.len() > self.config.trigger_message_count
        {
            let split = messages.len().saturating_sub(self.config.recent_message_count);
            summarizer.schedule(session_id.to_owned(), messages, split);
        }
    }

    /// Delete a session, aborting any in-flight summarization first so
    /// it cannot write an orphan summary.
    pub async fn delete_session(&self, session_id: &str) -> Result<()> {
        if let Some(summarizer) = &self.summarizer {
            summarizer.cancel(session_id);
        }
        if let Some(store) = &self.store {
            store.delete_session(session_id).await?;
        }
        Ok(())
    }
}

impl std::fmt::Debug for ConversationManager {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ConversationManager")
            .field("config", &self.config)
            .finish_non_exhaustive()
    }
}
