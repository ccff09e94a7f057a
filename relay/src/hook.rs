//! Lifecycle hooks — observation and intervention around the run.
//!
//! Four extension points wrap every request: before the run starts, before
//! and after each tool call, and after the run completes. Hooks at a point
//! run in ascending [`order`](AgentStartHook::order); a hook that returns
//! [`HookResult::Reject`] or [`HookResult::PendingApproval`] short-circuits
//! the remaining hooks at that point and the decision is handed back to the
//! executor. [`HookResult::Modify`] rewrites parameters and continues.
//!
//! Hook errors are policy, not panic: a hook that declares
//! `fail_on_error()` re-raises, anything else is logged and treated as
//! [`HookResult::Continue`].

use std::collections::HashMap;
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};

use async_trait::async_trait;
use serde_json::{Map, Value};
use tracing::warn;
use uuid::Uuid;

use crate::command::AgentCommand;
use crate::error::Result;
use crate::message::ToolCall;
use crate::result::AgentResult;

/// Well-known metadata keys seeded into every [`HookContext`].
pub mod meta_keys {
    /// Unique run identifier.
    pub const RUN_ID: &str = "runId";
    /// Requesting user, when known.
    pub const USER_ID: &str = "userId";
    /// Billing tenant, when known.
    pub const TENANT_ID: &str = "tenantId";
    /// Conversation session, when present.
    pub const SESSION_ID: &str = "sessionId";
    /// Set to `true` when the response was served from the cache.
    pub const CACHE_HIT: &str = "cacheHit";
}

/// Per-run collaboration slate shared with every hook.
///
/// Created at admission and dropped after the after-complete hooks run.
/// `tools_used` and `metadata` are safe for concurrent append and read
/// from parallel tool executions.
pub struct HookContext {
    run_id: String,
    user_id: Option<String>,
    user_prompt: String,
    started: Instant,
    tools_used: Mutex<Vec<String>>,
    metadata: Mutex<HashMap<String, Value>>,
}

impl HookContext {
    /// Create a context for one run, seeding identity metadata.
    #[must_use]
    pub fn new(command: &AgentCommand) -> Self {
        let run_id = Uuid::new_v4().to_string();
        let mut metadata: HashMap<String, Value> = command
            .metadata
            .iter()
            .map(|(k, v)| (k.clone(), v.clone()))
            .collect();
        metadata.insert(meta_keys::RUN_ID.to_owned(), Value::String(run_id.clone()));
        if let Some(user_id) = &command.user_id {
            metadata.insert(meta_keys::USER_ID.to_owned(), Value::String(user_id.clone()));
        }
        if let Some(tenant_id) = &command.tenant_id {
            metadata.insert(
                meta_keys::TENANT_ID.to_owned(),
                Value::String(tenant_id.clone()),
            );
        }
        if let Some(session_id) = &command.session_id {
            metadata.insert(
                meta_keys::SESSION_ID.to_owned(),
                Value::String(session_id.clone()),
            );
        }

        Self {
            run_id,
            user_id: command.user_id.clone(),
            user_prompt: command.user_prompt.clone(),
            started: Instant::now(),
            tools_used: Mutex::new(Vec::new()),
            metadata: Mutex::new(metadata),
        }
    }

    /// Unique run identifier.
    #[must_use]
    pub fn run_id(&self) -> &str {
        &self.run_id
    }

    /// Requesting user, when known.
    #[must_use]
    pub fn user_id(&self) -> Option<&str> {
        self.user_id.as_deref()
    }

    /// The user's prompt.
    #[must_use]
    pub fn user_prompt(&self) -> &str {
        &self.user_prompt
    }

    /// Time since admission.
    #[must_use]
    pub fn elapsed(&self) -> Duration {
        self.started.elapsed()
    }

    /// Record a completed tool execution.
    pub fn record_tool_use(&self, name: impl Into<String>) {
        self.tools_used
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .push(name.into());
    }

    /// Snapshot of the tools used so far, in completion order.
    #[must_use]
    pub fn tools_used(&self) -> Vec<String> {
        self.tools_used
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .clone()
    }

    /// Insert or replace a metadata entry.
    pub fn insert_metadata(&self, key: impl Into<String>, value: Value) {
        self.metadata
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .insert(key.into(), value);
    }

    /// Read one metadata entry.
    #[must_use]
    pub fn metadata_value(&self, key: &str) -> Option<Value> {
        self.metadata
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .get(key)
            .cloned()
    }

    /// Snapshot of all metadata.
    #[must_use]
    pub fn metadata_snapshot(&self) -> HashMap<String, Value> {
        self.metadata
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .clone()
    }
}

impl std::fmt::Debug for HookContext {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("HookContext")
            .field("run_id", &self.run_id)
            .field("user_id", &self.user_id)
            .finish_non_exhaustive()
    }
}

/// What a hook decides to do.
#[derive(Debug, Clone)]
#[non_exhaustive]
pub enum HookResult {
    /// Continue normally.
    Continue,
    /// Reject the lifecycle event.
    Reject(String),
    /// Defer the event for out-of-band approval.
    PendingApproval {
        /// Identifier the approval flow resolves.
        approval_id: String,
        /// Message shown to the approver.
        message: String,
    },
    /// Replace the event's parameters (tool arguments at
    /// `before_tool_call`; merged into context metadata elsewhere).
    Modify(Map<String, Value>),
}

/// Outcome of a completed tool call, handed to after-tool hooks.
#[derive(Debug, Clone)]
pub struct ToolCallOutcome {
    /// Normalized result content (or error text on failure).
    pub content: String,
    /// Whether the tool succeeded.
    pub success: bool,
    /// Execution duration.
    pub duration: Duration,
}

/// Hook fired before the run starts.
#[async_trait]
pub trait AgentStartHook: Send + Sync {
    /// Hook name for logs and rejection reporting.
    fn name(&self) -> &str;

    /// Execution order; hooks run ascending.
    fn order(&self) -> i32 {
        0
    }

    /// Disabled hooks are skipped.
    fn enabled(&self) -> bool {
        true
    }

    /// Whether this hook's errors abort the point.
    fn fail_on_error(&self) -> bool {
        false
    }

    /// Observe or veto the run before any model work.
    async fn before_agent_start(&self, ctx: &HookContext) -> Result<HookResult>;
}

/// Hook fired before each tool call.
#[async_trait]
pub trait ToolStartHook: Send + Sync {
    /// Hook name for logs and rejection reporting.
    fn name(&self) -> &str;

    /// Execution order; hooks run ascending.
    fn order(&self) -> i32 {
        0
    }

    /// Disabled hooks are skipped.
    fn enabled(&self) -> bool {
        true
    }

    /// Whether this hook's errors abort the point.
    fn fail_on_error(&self) -> bool {
        false
    }

    /// Observe, veto, or rewrite the tool call.
    async fn before_tool_call(&self, ctx: &HookContext, call: &ToolCall) -> Result<HookResult>;
}

/// Hook fired after each tool call.
#[async_trait]
pub trait ToolEndHook: Send + Sync {
    /// Hook name for logs and rejection reporting.
    fn name(&self) -> &str;

    /// Execution order; hooks run ascending.
    fn order(&self) -> i32 {
        0
    }

    /// Disabled hooks are skipped.
    fn enabled(&self) -> bool {
        true
    }

    /// Whether this hook's errors re-raise instead of being logged.
    fn fail_on_error(&self) -> bool {
        false
    }

    /// Observe the completed tool call.
    async fn after_tool_call(
        &self,
        ctx: &HookContext,
        call: &ToolCall,
        outcome: &ToolCallOutcome,
    ) -> Result<HookResult>;
}

/// Hook fired after the run completes (success or failure).
#[async_trait]
pub trait AgentCompleteHook: Send + Sync {
    /// Hook name for logs and rejection reporting.
    fn name(&self) -> &str;

    /// Execution order; hooks run ascending.
    fn order(&self) -> i32 {
        0
    }

    /// Disabled hooks are skipped.
    fn enabled(&self) -> bool {
        true
    }

    /// Whether this hook's errors re-raise instead of being logged.
    fn fail_on_error(&self) -> bool {
        false
    }

    /// Observe the final result.
    async fn after_agent_complete(&self, ctx: &HookContext, result: &AgentResult)
        -> Result<HookResult>;
}

/// Decision returned by a hook point to the executor.
#[derive(Debug, Clone)]
pub enum HookDecision {
    /// All hooks continued.
    Proceed,
    /// A hook rejected the event.
    Rejected {
        /// Name of the rejecting hook.
        hook: String,
        /// Rejection reason.
        reason: String,
    },
    /// A hook deferred the event for approval.
    Pending {
        /// Name of the deferring hook.
        hook: String,
        /// Approval identifier.
        approval_id: String,
        /// Message for the approver.
        message: String,
    },
}

/// Decision for one tool call, carrying a possible argument rewrite.
#[derive(Debug, Clone)]
pub enum ToolCallDecision {
    /// Execute the call, with rewritten arguments when `Some`.
    Proceed(Option<Map<String, Value>>),
    /// Skip the call; the model sees the reason as the tool response.
    Rejected {
        /// Name of the rejecting hook.
        hook: String,
        /// Rejection reason.
        reason: String,
    },
    /// Skip the call pending approval.
    Pending {
        /// Name of the deferring hook.
        hook: String,
        /// Approval identifier.
        approval_id: String,
        /// Message for the approver.
        message: String,
    },
}

/// Ordered hook dispatch for the four lifecycle points.
#[derive(Default)]
pub struct HookExecutor {
    on_start: Vec<Arc<dyn AgentStartHook>>,
    on_tool_start: Vec<Arc<dyn ToolStartHook>>,
    on_tool_end: Vec<Arc<dyn ToolEndHook>>,
    on_complete: Vec<Arc<dyn AgentCompleteHook>>,
}

impl HookExecutor {
    /// Create an executor from hook lists; each list is sorted by
    /// ascending order once.
    #[must_use]
    pub fn new(
        mut on_start: Vec<Arc<dyn AgentStartHook>>,
        mut on_tool_start: Vec<Arc<dyn ToolStartHook>>,
        mut on_tool_end: Vec<Arc<dyn ToolEndHook>>,
        mut on_complete: Vec<Arc<dyn AgentCompleteHook>>,
    ) -> Self {
        on_start.sort_by_key(|h| h.order());
        on_tool_start.sort_by_key(|h| h.order());
        on_tool_end.sort_by_key(|h| h.order());
        on_complete.sort_by_key(|h| h.order());
        Self {
            on_start,
            on_tool_start,
            on_tool_end,
            on_complete,
        }
    }

    /// An executor with no hooks.
    #[must_use]
    pub fn empty() -> Self {
        Self::default()
    }

    /// Run the before-agent-start point.
    pub async fn before_agent_start(&self, ctx: &HookContext) -> Result<HookDecision> {
        for hook in &self.on_start {
            if !hook.enabled() {
                continue;
            }
            match hook.before_agent_start(ctx).await {
                Ok(HookResult::Continue) => {}
                Ok(HookResult::Modify(params)) => {
                    for (key, value) in params {
                        ctx.insert_metadata(key, value);
                    }
                }
                Ok(HookResult::Reject(reason)) => {
                    return Ok(HookDecision::Rejected {
                        hook: hook.name().to_owned(),
                        reason,
                    });
                }
                Ok(HookResult::PendingApproval {
                    approval_id,
                    message,
                }) => {
                    return Ok(HookDecision::Pending {
                        hook: hook.name().to_owned(),
                        approval_id,
                        message,
                    });
                }
                Err(err) if hook.fail_on_error() => return Err(err),
                Err(err) => {
                    warn!(hook = hook.name(), error = %err, "before-start hook failed; continuing");
                }
            }
        }
        Ok(HookDecision::Proceed)
    }

    /// Run the before-tool-call point.
    pub async fn before_tool_call(
        &self,
        ctx: &HookContext,
        call: &ToolCall,
    ) -> Result<ToolCallDecision> {
        let mut rewritten: Option<Map<String, Value>> = None;
        for hook in &self.on_tool_start {
            if !hook.enabled() {
                continue;
            }
            // Later hooks see earlier rewrites.
            let effective = rewritten.as_ref().map_or_else(
                || call.clone(),
                |args| ToolCall::new(call.name.clone(), args.clone(), call.call_index),
            );
            match hook.before_tool_call(ctx, &effective).await {
                Ok(HookResult::Continue) => {}
                Ok(HookResult::Modify(params)) => rewritten = Some(params),
                Ok(HookResult::Reject(reason)) => {
                    return Ok(ToolCallDecision::Rejected {
                        hook: hook.name().to_owned(),
                        reason,
                    });
                }
                Ok(HookResult::PendingApproval {
                    approval_id,
                    message,
                }) => {
                    return Ok(ToolCallDecision::Pending {
                        hook: hook.name().to_owned(),
                        approval_id,
                        message,
                    });
                }
                Err(err) if hook.fail_on_error() => return Err(err),
                Err(err) => {
                    warn!(hook = hook.name(), tool = %call.name, error = %err, "before-tool hook failed; continuing");
                }
            }
        }
        Ok(ToolCallDecision::Proceed(rewritten))
    }

    /// Run the after-tool-call point.
    ///
    /// `Reject`/`PendingApproval` here only stop later hooks at the
    /// point; the tool result stands.
    pub async fn after_tool_call(
        &self,
        ctx: &HookContext,
        call: &ToolCall,
        outcome: &ToolCallOutcome,
    ) -> Result<()> {
        for hook in &self.on_tool_end {
            if !hook.enabled() {
                continue;
            }
            match hook.after_tool_call(ctx, call, outcome).await {
                Ok(HookResult::Continue | HookResult::Modify(_)) => {}
                Ok(HookResult::Reject(reason)) => {
                    warn!(hook = hook.name(), tool = %call.name, reason, "after-tool hook rejected; result stands");
                    break;
                }
                Ok(HookResult::PendingApproval { approval_id, .. }) => {
                    warn!(hook = hook.name(), tool = %call.name, approval_id, "after-tool hook deferred; result stands");
                    break;
                }
                Err(err) if hook.fail_on_error() => return Err(err),
                Err(err) => {
                    warn!(hook = hook.name(), tool = %call.name, error = %err, "after-tool hook failed; continuing");
                }
            }
        }
        Ok(())
    }

    /// Run the after-agent-complete point.
    pub async fn after_agent_complete(
        &self,
        ctx: &HookContext,
        result: &AgentResult,
    ) -> Result<()> {
        for hook in &self.on_complete {
            if !hook.enabled() {
                continue;
            }
            match hook.after_agent_complete(ctx, result).await {
                Ok(HookResult::Continue | HookResult::Modify(_)) => {}
                Ok(HookResult::Reject(reason)) => {
                    warn!(hook = hook.name(), reason, "after-complete hook rejected; result stands");
                    break;
                }
                Ok(HookResult::PendingApproval { approval_id, .. }) => {
                    warn!(hook = hook.name(), approval_id, "after-complete hook deferred; result stands");
                    break;
                }
                Err(err) if hook.fail_on_error() => return Err(err),
                Err(err) => {
                    warn!(hook = hook.name(), error = %err, "after-complete hook failed; continuing");
                }
            }
        }
        Ok(())
    }
}

impl std::fmt::Debug for HookExecutor {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("HookExecutor")
            .field("on_start", &self.on_start.len())
            .field("on_tool_start", &self.on_tool_start.len())
            .field("on_tool_end", &self.on_tool_end.len())
            .field("on_complete", &self.on_complete.len())
            .finish()
    }
}
