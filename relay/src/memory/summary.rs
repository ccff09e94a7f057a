//! Hierarchical conversation summarization.
//!
//! Long sessions compress into three tiers: structured facts, a
//! narrative summary, and the recent turns verbatim. The
//! [`SummaryService`] produces the first two; this module owns their
//! persistence discipline — `summarized_up_to` never decreases for a
//! session — and the single-flight rule for background jobs: at most one
//! summarization in flight per session, superseded jobs aborted.

use std::collections::HashMap;
use std::sync::{Arc, Mutex};
use std::time::SystemTime;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use tokio::task::JoinHandle;
use tracing::{debug, warn};

use crate::error::Result;
use crate::message::Message;

/// A persisted conversation summary.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ConversationSummary {
    /// Session this summary belongs to.
    pub session_id: String,
    /// Narrative summary of the summarized prefix.
    pub narrative: String,
    /// Structured facts extracted from the conversation, in order.
    pub facts: Vec<(String, String)>,
    /// Number of leading messages the summary covers. Never decreases
    /// for a session.
    pub summarized_up_to: usize,
    /// First persisted.
    pub created_at: SystemTime,
    /// Last updated.
    pub updated_at: SystemTime,
}

impl ConversationSummary {
    /// Returns `true` when the summary carries no usable content.
    #[must_use]
    pub fn is_effectively_empty(&self) -> bool {
        self.narrative.trim().is_empty() && self.facts.is_empty()
    }

    /// Render the facts tier as a system-message body.
    #[must_use]
    pub fn facts_text(&self) -> String {
        let mut text = String::from("Known facts about this conversation:");
        for (key, value) in &self.facts {
            text.push_str("\n- ");
            text.push_str(key);
            text.push_str(": ");
            text.push_str(value);
        }
        text
    }

    /// Render the narrative tier as a system-message body.
    #[must_use]
    pub fn narrative_text(&self) -> String {
        format!("Summary of the earlier conversation:\n{}", self.narrative)
    }
}

/// Output of one summarization pass, before persistence bookkeeping.
#[derive(Debug, Clone, Default)]
pub struct SummaryDraft {
    /// Narrative summary.
    pub narrative: String,
    /// Structured facts, in order.
    pub facts: Vec<(String, String)>,
}

/// Produces summaries; typically backed by a small LLM call.
#[async_trait]
pub trait SummaryService: Send + Sync {
    /// Summarize a message prefix into narrative + facts.
    async fn summarize(&self, messages: &[Message]) -> Result<SummaryDraft>;
}

/// Summary persistence (`conversation_summaries` table, keyed by
/// session id).
#[async_trait]
pub trait SummaryStore: Send + Sync {
    /// Load the summary for a session.
    async fn find(&self, session_id: &str) -> Result<Option<ConversationSummary>>;

    /// Insert or replace a session's summary.
    async fn upsert(&self, summary: ConversationSummary) -> Result<()>;
}

/// Coordinates summarization for all sessions.
pub struct Summarizer {
    service: Arc<dyn SummaryService>,
    store: Arc<dyn SummaryStore>,
    // session → (job generation, handle); the generation lets a finished
    // job remove itself without clobbering a successor.
    jobs: Mutex<HashMap<String, (u64, JoinHandle<()>)>>,
    next_job: std::sync::atomic::AtomicU64,
}

impl Summarizer {
    /// Create a summarizer.
    #[must_use]
    pub fn new(service: Arc<dyn SummaryService>, store: Arc<dyn SummaryStore>) -> Self {
        Self {
            service,
            store,
            jobs: Mutex::new(HashMap::new()),
            next_job: std::sync::atomic::AtomicU64::new(0),
        }
    }

    /// Load the persisted summary for a session.
    pub async fn find(&self, session_id: &str) -> Result<Option<ConversationSummary>> {
        self.store.find(session_id).await
    }

    /// Summarize `messages[..split]` synchronously and persist.
    ///
    /// The monotonicity invariant is enforced here: a result that would
    /// lower `summarized_up_to` keeps the existing summary instead.
    pub async fn summarize_now(
        &self,
        session_id: &str,
        messages: &[Message],
        split: usize,
    ) -> Result<ConversationSummary> {
        let split = split.min(messages.len());
        let draft = self.service.summarize(&messages[..split]).await?;

        let existing = self.store.find(session_id).await?;
        if let Some(existing) = &existing
            && existing.summarized_up_to >= split
        {
            return Ok(existing.clone());
        }

        let now = SystemTime::now();
        let summary = ConversationSummary {
            session_id: session_id.to_owned(),
            narrative: draft.narrative,
            facts: draft.facts,
            summarized_up_to: split,
            created_at: existing.as_ref().map_or(now, |e| e.created_at),
            updated_at: now,
        };
        self.store.upsert(summary.clone()).await?;
        Ok(summary)
    }

    /// Schedule a background summarization, superseding any job already
    /// in flight for the session.
    pub fn schedule(self: &Arc<Self>, session_id: String, messages: Vec<Message>, split: usize) {
        let generation = self
            .next_job
            .fetch_add(1, std::sync::atomic::Ordering::Relaxed);

        let mut jobs = self.jobs.lock().unwrap_or_else(|e| e.into_inner());
        if let Some((_, previous)) = jobs.remove(&session_id) {
            previous.abort();
        }

        let this = Arc::clone(self);
        let key = session_id.clone();
        let handle = tokio::spawn(async move {
            if let Err(err) = this.summarize_now(&session_id, &messages, split).await {
                warn!(session = %session_id, error = %err, "Background summarization failed");
            } else {
                debug!(session = %session_id, split, "Background summarization completed");
            }
            // Remove our own entry unless a newer job superseded it; the
            // scheduler holds the lock until the entry is inserted, so
            // this cannot run in between.
            let mut jobs = this.jobs.lock().unwrap_or_else(|e| e.into_inner());
            if jobs.get(&session_id).is_some_and(|(g, _)| *g == generation) {
                jobs.remove(&session_id);
            }
        });
        jobs.insert(key, (generation, handle));
    }

    /// Abort any in-flight summarization for a session. Called on
    /// session deletion so a dying session cannot write an orphan
    /// summary.
    pub fn cancel(&self, session_id: &str) {
        let mut jobs = self.jobs.lock().unwrap_or_else(|e| e.into_inner());
        if let Some((_, job)) = jobs.remove(session_id) {
            job.abort();
        }
    }

    /// Returns `true` when a job is in flight for the session.
    #[must_use]
    pub fn has_active_job(&self, session_id: &str) -> bool {
        self.jobs
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .contains_key(session_id)
    }
}

impl std::fmt::Debug for Summarizer {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Summarizer").finish_non_exhaustive()
    }
}
