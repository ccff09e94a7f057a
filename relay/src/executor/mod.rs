//! The execution engine.
//!
//! [`AgentExecutor`] owns per-request behavior end to end:
//!
//! 1. Acquire a request permit (bounded concurrency, fail-fast or queued)
//! 2. Run the guard pipeline
//! 3. Run before-start hooks
//! 4. Resolve the effective command
//! 5. Consult the response cache for cacheable commands
//! 6. Load conversation history, user memory, and retrieved context
//! 7. Select tools
//! 8. Drive the reason-act loop: call the model through retry and the
//!    circuit breaker, execute requested tools in parallel, append the
//!    results, repeat until the model answers without tools or the tool
//!    budget forces a final toolless iteration
//! 9. Enforce output boundaries and the output guard
//! 10. Run the response filter chain
//! 11. Publish to the cache (at most once per fingerprint)
//! 12. Save the conversation (fire-and-succeed)
//! 13. Run after-complete hooks
//! 14. Emit the execution metric and return
//!
//! Failures fold into the returned [`AgentResult`]; nothing escapes the
//! admission boundary as a raw error.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::{Instant, SystemTime};

use async_trait::async_trait;
use tokio::sync::{OwnedSemaphorePermit, Semaphore};
use tracing::{Instrument, debug, info, info_span, warn};

use crate::breaker::CircuitBreakerRegistry;
use crate::cache::{CachedResponse, Fingerprint, ResponseCache};
use crate::command::{AgentCommand, ExecutionMode};
use crate::error::{AgentError, ErrorCode, Result};
use crate::fallback::FallbackStrategy;
use crate::filter::ResponseFilterChain;
use crate::guard::{GuardPipeline, GuardResult, OutputGuardPipeline};
use crate::hook::{HookContext, HookDecision, HookExecutor, ToolCallDecision, ToolCallOutcome, meta_keys};
use crate::memory::{ConversationManager, MessageTrimmer, UserMemoryStore};
use crate::message::{Message, ToolCall};
use crate::metrics::{MetricEvent, MetricRingBuffer};
use crate::provider::{
    CompletionOptions, CompletionRequest, CompletionResponse, LanguageModel, ToolDefinition,
};
use crate::result::AgentResult;
use crate::retry::RetryPolicy;
use crate::tool::{DynTool, ToolRegistry, ToolSelector};

pub mod builder;
pub mod config;
pub mod stream;

pub use builder::AgentExecutorBuilder;
pub use config::ExecutorConfig;
pub use stream::StreamEvent;

/// Retrieval-augmented context source. Deployments with a vector store
/// implement this; the core only splices the returned context into the
/// system tier.
#[async_trait]
pub trait ContextRetriever: Send + Sync {
    /// Retrieve context relevant to the prompt, or `None`.
    async fn retrieve(&self, prompt: &str) -> Result<Option<String>>;
}

/// Rewrites the admitted command before execution (intent resolution,
/// persona selection).
pub type CommandResolver = Arc<dyn Fn(AgentCommand) -> AgentCommand + Send + Sync>;

/// How one serve attempt ended, before result assembly.
struct ServeOutcome {
    content: String,
    from_cache: bool,
    cached_tools: Vec<String>,
}

/// The request execution engine. Construct through
/// [`AgentExecutorBuilder`].
pub struct AgentExecutor {
    pub(crate) model: Arc<dyn LanguageModel>,
    pub(crate) guards: GuardPipeline,
    pub(crate) output_guards: OutputGuardPipeline,
    pub(crate) hooks: HookExecutor,
    pub(crate) tools: Arc<ToolRegistry>,
    pub(crate) selector: Arc<dyn ToolSelector>,
    pub(crate) conversation: ConversationManager,
    pub(crate) user_memory: Option<Arc<dyn UserMemoryStore>>,
    pub(crate) context_retriever: Option<Arc<dyn ContextRetriever>>,
    pub(crate) resolver: Option<CommandResolver>,
    pub(crate) trimmer: MessageTrimmer,
    pub(crate) cache: Option<Arc<dyn ResponseCache>>,
    pub(crate) retry: RetryPolicy,
    pub(crate) breakers: Arc<CircuitBreakerRegistry>,
    pub(crate) fallback: Option<FallbackStrategy>,
    pub(crate) filters: ResponseFilterChain,
    pub(crate) metrics: Option<Arc<MetricRingBuffer>>,
    pub(crate) permits: Arc<Semaphore>,
    pub(crate) config: ExecutorConfig,
}

impl AgentExecutor {
    /// Start building an executor around a model.
    #[must_use]
    pub fn builder(model: Arc<dyn LanguageModel>) -> AgentExecutorBuilder {
        AgentExecutorBuilder::new(model)
    }

    /// Serve one request to completion.
    pub async fn execute(&self, command: AgentCommand) -> AgentResult {
        let started = Instant::now();
        let span = info_span!(
            "agent_run",
            run.user = command.user_id.as_deref().unwrap_or(""),
            run.tenant = command.tenant_id.as_deref().unwrap_or(""),
            run.mode = ?command.mode,
        );
        self.execute_inner(command, started).instrument(span).await
    }

    async fn execute_inner(&self, command: AgentCommand, started: Instant) -> AgentResult {
        // 1. Admission permit.
        let _permit = match self.acquire_permit().await {
            Ok(permit) => permit,
            Err(err) => {
                let result = AgentResult::from_error(&err, started.elapsed());
                self.publish_execution(&command, &result);
                return result;
            }
        };

        // The per-run slate is created at admission, from the command as
        // the caller sent it; hooks observe the original prompt.
        let ctx = HookContext::new(&command);

        // 2. Guard pipeline: rejected requests cost nothing downstream.
        if let GuardResult::Rejected {
            stage,
            category,
            message,
        } = self.guards.check(&command).await
        {
            self.publish(MetricEvent::GuardRejection {
                stage: stage.clone(),
                category,
                tenant_id: command.tenant_id.clone(),
            });
            let err = AgentError::GuardRejected {
                stage,
                category,
                message,
            };
            info!(error = %err, "Request rejected by guard");
            let result = AgentResult::from_error(&err, started.elapsed());
            self.publish_execution(&command, &result);
            return result;
        }

        // Everything past admission runs under the request deadline.
        let remaining = self
            .config
            .request_timeout
            .saturating_sub(started.elapsed());
        let served = tokio::time::timeout(remaining, self.serve(&command, &ctx)).await;

        let result = match served {
            Ok(Ok(outcome)) => {
                if outcome.from_cache {
                    AgentResult::success(outcome.content, outcome.cached_tools, started.elapsed())
                } else {
                    AgentResult::success(outcome.content, ctx.tools_used(), started.elapsed())
                }
            }
            Ok(Err(err)) => {
                warn!(error = %err, "Request failed");
                AgentResult::from_error(&err, started.elapsed()).with_tools_used(ctx.tools_used())
            }
            Err(_elapsed) => {
                warn!("Request deadline exceeded");
                AgentResult::failure(
                    ErrorCode::Timeout,
                    "request deadline exceeded",
                    started.elapsed(),
                )
                .with_tools_used(ctx.tools_used())
            }
        };

        // 13. After-complete hooks observe every post-admission outcome.
        if let Err(err) = self.hooks.after_agent_complete(&ctx, &result).await {
            // The response is already committed; nothing to retract.
            warn!(error = %err, "After-complete hook failed");
        }

        // 14. Execution metric.
        self.publish_execution(&command, &result);
        result
    }

    /// Steps 3-12.
    async fn serve(&self, command: &AgentCommand, ctx: &HookContext) -> Result<ServeOutcome> {
        // 3. Before-start hooks observe the request as admitted.
        match self.hooks.before_agent_start(ctx).await? {
            HookDecision::Proceed => {}
            HookDecision::Rejected { hook, reason } => {
                return Err(AgentError::HookRejected { hook, reason });
            }
            HookDecision::Pending {
                hook,
                approval_id,
                message,
            } => {
                return Err(AgentError::PendingApproval {
                    hook,
                    approval_id,
                    message,
                });
            }
        }

        // 4. Effective command (intent resolution, persona selection);
        // everything downstream sees the resolved command.
        let resolved;
        let command = match &self.resolver {
            Some(resolver) => {
                resolved = resolver(command.clone());
                &resolved
            }
            None => command,
        };

        // 5. Cache lookup for cacheable commands.
        if let Some(key) = self.cache_key(command)
            && let Some(cache) = &self.cache
            && let Some(hit) = cache.get(&key).await
        {
            debug!(fingerprint = %key, "Response cache hit");
            ctx.insert_metadata(meta_keys::CACHE_HIT, serde_json::Value::Bool(true));
            return Ok(ServeOutcome {
                content: hit.content,
                from_cache: true,
                cached_tools: hit.tools_used,
            });
        }

        // 6. History + user memory + retrieved context.
        let mut messages = self.assemble_messages(command).await;

        // 7. Tool selection.
        let selected = self.select_tools(command).await;
        let definitions: Vec<ToolDefinition> = selected.iter().map(|t| t.definition()).collect();

        // 8. The reason-act loop.
        let max_tool_calls = command.max_tool_calls.unwrap_or(self.config.max_tool_calls);
        let mut tools_enabled = !definitions.is_empty() && max_tool_calls > 0;
        let mut executed_calls: u32 = 0;
        let mut call_index: u32 = 0;
        let mut fallback_used = false;

        let mut content = loop {
            messages = self.trimmer.trim(
                &command.system_prompt,
                messages,
                self.config.max_context_window_tokens,
                self.config.output_reserve_tokens,
            );

            let request = self.build_request(
                command,
                &messages,
                if tools_enabled {
                    definitions.clone()
                } else {
                    Vec::new()
                },
            );
            let response = self.call_model(&request, &mut fallback_used).await?;
            self.publish_token_usage(command, &response);

            if !tools_enabled || !response.has_tool_calls() {
                break response.text.unwrap_or_default();
            }

            let mut calls = response.tool_calls;
            for call in &mut calls {
                call.call_index = call_index;
                call_index += 1;
            }
            messages.push(Message::assistant_with_tools(
                response.text.unwrap_or_default(),
                calls.clone(),
            ));

            let outcomes = self.run_tool_calls(command, ctx, &calls).await;
            // Barrier: tool responses enter history only after every
            // parallel call for this assistant turn has completed.
            for (call, outcome) in &outcomes {
                messages.push(Message::tool_response(&call.name, &outcome.content));
            }

            executed_calls += calls.len() as u32;
            if executed_calls >= max_tool_calls && tools_enabled {
                debug!(executed_calls, max_tool_calls, "Tool budget exhausted; forcing final answer");
                tools_enabled = false;
            }
        };

        // 9. Output boundary.
        content = self
            .enforce_boundary(command, content, &messages, &mut fallback_used)
            .await?;

        // Output guard: content-level policy on what is about to leave.
        if let GuardResult::Rejected {
            stage,
            category,
            message,
        } = self.output_guards.check(command, &content).await
        {
            self.publish(MetricEvent::GuardRejection {
                stage: stage.clone(),
                category,
                tenant_id: command.tenant_id.clone(),
            });
            let err = AgentError::OutputGuardRejected {
                stage,
                category,
                message,
            };
            info!(error = %err, "Response rejected by output guard");
            return Err(err);
        }

        // 10. Response filters.
        if self.config.filters_enabled && !self.filters.is_empty() {
            content = self.filters.apply(content, ctx).await;
        }

        // 11. At-most-once cache publication.
        if let Some(key) = self.cache_key(command)
            && let Some(cache) = &self.cache
        {
            cache
                .put(
                    key,
                    CachedResponse {
                        content: content.clone(),
                        tools_used: ctx.tools_used(),
                    },
                )
                .await;
        }

        // 12. Fire-and-succeed conversation save.
        self.conversation.save_history(command, &content).await;

        Ok(ServeOutcome {
            content,
            from_cache: false,
            cached_tools: Vec::new(),
        })
    }

    async fn acquire_permit(&self) -> Result<OwnedSemaphorePermit> {
        if self.config.fail_fast_on_saturation {
            return Arc::clone(&self.permits)
                .try_acquire_owned()
                .map_err(|_| AgentError::Overloaded);
        }
        match tokio::time::timeout(
            self.config.request_timeout,
            Arc::clone(&self.permits).acquire_owned(),
        )
        .await
        {
            Ok(Ok(permit)) => Ok(permit),
            Ok(Err(_closed)) => Err(AgentError::internal("request semaphore closed")),
            Err(_elapsed) => Err(AgentError::QueueTimeout),
        }
    }

    /// The cache key, for commands that are cacheable at all.
    fn cache_key(&self, command: &AgentCommand) -> Option<Fingerprint> {
        let cacheable = self.cache.is_some()
            && command.temperature.unwrap_or(0.0) <= self.config.cacheable_temperature;
        cacheable.then(|| Fingerprint::of(command, &self.tools.names()))
    }

    /// History, long-lived user facts, and retrieved context, followed
    /// by the user turn.
    async fn assemble_messages(&self, command: &AgentCommand) -> Vec<Message> {
        let mut messages = Vec::new();

        if let Some(user_memory) = &self.user_memory
            && let Some(user_id) = command.user_id.as_deref()
        {
            match user_memory.find_facts(user_id).await {
                Ok(facts) if !facts.is_empty() => {
                    let mut text = String::from("Known facts about this user:");
                    for (key, value) in &facts {
                        text.push_str("\n- ");
                        text.push_str(key);
                        text.push_str(": ");
                        text.push_str(value);
                    }
                    messages.push(Message::system(text));
                }
                Ok(_) => {}
                Err(err) => warn!(error = %err, "User memory lookup failed"),
            }
        }

        messages.extend(self.conversation.load_history(command).await);

        if let Some(retriever) = &self.context_retriever {
            match retriever.retrieve(&command.user_prompt).await {
                Ok(Some(context)) => {
                    messages.push(Message::system(format!("Relevant context:\n{context}")));
                }
                Ok(None) => {}
                Err(err) => warn!(error = %err, "Context retrieval failed"),
            }
        }

        messages.push(if command.media.is_empty() {
            Message::user(command.user_prompt.clone())
        } else {
            Message::user_with_media(command.user_prompt.clone(), command.media.clone())
        });
        messages
    }

    async fn select_tools(&self, command: &AgentCommand) -> Vec<Arc<dyn DynTool>> {
        if command.mode != ExecutionMode::React || self.tools.is_empty() {
            return Vec::new();
        }
        self.selector
            .select(
                &command.user_prompt,
                &self.tools,
                self.config.max_tools_per_request,
            )
            .await
    }

    fn build_request(
        &self,
        command: &AgentCommand,
        messages: &[Message],
        tools: Vec<ToolDefinition>,
    ) -> CompletionRequest {
        let mut all = Vec::with_capacity(messages.len() + 1);
        if !command.system_prompt.is_empty() {
            all.push(Message::system(command.system_prompt.clone()));
        }
        all.extend_from_slice(messages);

        CompletionRequest {
            messages: all,
            options: CompletionOptions {
                model: None,
                temperature: command.temperature,
                max_output_tokens: Some(self.config.output_reserve_tokens),
                tools,
                response_format: command.response_format,
                metadata: HashMap::new(),
            },
        }
    }

    /// One protected model call: retry inside the breaker, fallback (at
    /// most once per request) after final failure.
    pub(crate) async fn call_model(
        &self,
        request: &CompletionRequest,
        fallback_used: &mut bool,
    ) -> Result<CompletionResponse> {
        let breaker = self.breakers.breaker(self.model.provider());
        let attempt = breaker
            .execute(|| self.retry.run(|_attempt| self.model.complete(request)))
            .await;

        match attempt {
            Ok(response) => Ok(response),
            Err(err) => {
                if !*fallback_used
                    && let Some(fallback) = &self.fallback
                    && !fallback.is_empty()
                    && FallbackStrategy::is_eligible(&err)
                {
                    *fallback_used = true;
                    if let Some(response) = fallback.recover(&self.model, request).await {
                        return Ok(response);
                    }
                }
                Err(err)
            }
        }
    }

    /// Execute one assistant turn's tool calls, bounded by the
    /// per-request parallelism limit, preserving call order in the
    /// returned outcomes.
    pub(crate) async fn run_tool_calls(
        &self,
        command: &AgentCommand,
        ctx: &HookContext,
        calls: &[ToolCall],
    ) -> Vec<(ToolCall, ToolCallOutcome)> {
        let parallelism = self.config.tool_parallelism.max(1);
        let mut outcomes = Vec::with_capacity(calls.len());

        for chunk in calls.chunks(parallelism) {
            let futs: Vec<_> = chunk
                .iter()
                .map(|call| self.run_single_tool(command, ctx, call))
                .collect();
            outcomes.extend(futures::future::join_all(futs).await);
        }

        outcomes
    }

    async fn run_single_tool(
        &self,
        command: &AgentCommand,
        ctx: &HookContext,
        call: &ToolCall,
    ) -> (ToolCall, ToolCallOutcome) {
        let span = info_span!("tool", tool.name = %call.name, tool.index = call.call_index);
        async {
            let started = Instant::now();

            // Before-tool hooks may veto or rewrite the call.
            let decision = match self.hooks.before_tool_call(ctx, call).await {
                Ok(decision) => decision,
                Err(err) => {
                    warn!(tool = %call.name, error = %err, "Before-tool hook failed");
                    return (
                        call.clone(),
                        ToolCallOutcome {
                            content: format!("Tool '{}' blocked: {err}", call.name),
                            success: false,
                            duration: started.elapsed(),
                        },
                    );
                }
            };

            let effective = match decision {
                ToolCallDecision::Proceed(None) => call.clone(),
                ToolCallDecision::Proceed(Some(arguments)) => {
                    ToolCall::new(call.name.clone(), arguments, call.call_index)
                }
                ToolCallDecision::Rejected { hook, reason } => {
                    return (
                        call.clone(),
                        ToolCallOutcome {
                            content: format!(
                                "Tool '{}' was rejected by hook '{hook}': {reason}",
                                call.name
                            ),
                            success: false,
                            duration: started.elapsed(),
                        },
                    );
                }
                ToolCallDecision::Pending {
                    hook, approval_id, ..
                } => {
                    return (
                        call.clone(),
                        ToolCallOutcome {
                            content: format!(
                                "Tool '{}' is pending approval '{approval_id}' from hook '{hook}'",
                                call.name
                            ),
                            success: false,
                            duration: started.elapsed(),
                        },
                    );
                }
            };

            let outcome = self.dispatch_tool(&effective).await;
            ctx.record_tool_use(&call.name);
            self.publish(MetricEvent::ToolCall {
                name: call.name.clone(),
                duration: outcome.duration,
                success: outcome.success,
                tenant_id: command.tenant_id.clone(),
            });

            if let Err(err) = self.hooks.after_tool_call(ctx, &effective, &outcome).await {
                warn!(tool = %call.name, error = %err, "After-tool hook failed");
            }

            (call.clone(), outcome)
        }
        .instrument(span)
        .await
    }

    /// Look up and invoke the tool under the per-call timeout. Failures
    /// become tool responses; they never abort the request.
    async fn dispatch_tool(&self, call: &ToolCall) -> ToolCallOutcome {
        let started = Instant::now();
        let Some(tool) = self.tools.get(&call.name) else {
            warn!(tool = %call.name, "Tool not found");
            return ToolCallOutcome {
                content: format!("Tool '{}' not found", call.name),
                success: false,
                duration: started.elapsed(),
            };
        };

        let invocation = tool.call(call.arguments.clone());
        match tokio::time::timeout(self.config.tool_call_timeout, invocation).await {
            Ok(Ok(output)) => ToolCallOutcome {
                content: crate::tool::adapt::normalize_output(
                    &output,
                    self.config.max_tool_output_length,
                ),
                success: true,
                duration: started.elapsed(),
            },
            Ok(Err(err)) => {
                warn!(tool = %call.name, error = %err, "Tool execution failed");
                ToolCallOutcome {
                    content: format!("Tool error: {err}"),
                    success: false,
                    duration: started.elapsed(),
                }
            }
            Err(_elapsed) => {
                warn!(tool = %call.name, "Tool call timed out");
                ToolCallOutcome {
                    content: format!(
                        "Tool '{}' timed out after {:?}",
                        call.name, self.config.tool_call_timeout
                    ),
                    success: false,
                    duration: started.elapsed(),
                }
            }
        }
    }

    /// Step 9: enforce output length bounds.
    async fn enforce_boundary(
        &self,
        command: &AgentCommand,
        content: String,
        messages: &[Message],
        fallback_used: &mut bool,
    ) -> Result<String> {
        let boundary = self.config.boundary;
        let observed = content.chars().count();

        let (mut content, truncated) = boundary.enforce_max(content);
        if truncated {
            self.publish(MetricEvent::BoundaryViolation {
                policy: "truncate".to_owned(),
                observed_chars: observed,
                limit_chars: boundary.output_max_chars,
                tenant_id: command.tenant_id.clone(),
            });
        }

        if boundary.meets_min(&content) {
            return Ok(content);
        }

        use crate::boundary::MinViolationMode;
        let policy = match boundary.min_violation_mode {
            MinViolationMode::Warn => "warn",
            MinViolationMode::RetryOnce => "retry_once",
            MinViolationMode::Fail => "fail",
        };
        self.publish(MetricEvent::BoundaryViolation {
            policy: policy.to_owned(),
            observed_chars: content.chars().count(),
            limit_chars: boundary.output_min_chars,
            tenant_id: command.tenant_id.clone(),
        });

        match boundary.min_violation_mode {
            MinViolationMode::Warn => Ok(content),
            MinViolationMode::Fail => Err(AgentError::OutputTooShort {
                min_chars: boundary.output_min_chars,
            }),
            MinViolationMode::RetryOnce => {
                let mut retry_messages = messages.to_vec();
                retry_messages.push(Message::assistant(content.clone()));
                retry_messages.push(Message::user(boundary.continuation_prompt()));
                let request = self.build_request(command, &retry_messages, Vec::new());

                match self.call_model(&request, fallback_used).await {
                    Ok(response) => {
                        self.publish_token_usage(command, &response);
                        let candidate = response.text.unwrap_or_default();
                        if boundary.meets_min(&candidate) {
                            content = boundary.enforce_max(candidate).0;
                        } else {
                            debug!("Min-length retry still short; keeping original content");
                        }
                        Ok(content)
                    }
                    Err(err) => {
                        warn!(error = %err, "Min-length retry failed; keeping original content");
                        Ok(content)
                    }
                }
            }
        }
    }

    pub(crate) fn publish(&self, event: MetricEvent) {
        if let Some(metrics) = &self.metrics {
            let _ = metrics.publish(event);
        }
    }

    pub(crate) fn publish_token_usage(&self, command: &AgentCommand, response: &CompletionResponse) {
        self.publish(MetricEvent::TokenUsage {
            provider: self.model.provider().to_owned(),
            model: response.model.clone(),
            at: SystemTime::now(),
            usage: response.usage,
            estimated_cost_usd: None,
            tenant_id: command.tenant_id.clone(),
        });
    }

    pub(crate) fn publish_execution(&self, command: &AgentCommand, result: &AgentResult) {
        self.publish(MetricEvent::Execution {
            duration: result.duration,
            success: result.success,
            error_code: result.error_code,
            tenant_id: command.tenant_id.clone(),
        });
    }
}

impl std::fmt::Debug for AgentExecutor {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("AgentExecutor")
            .field("provider", &self.model.provider())
            .field("tools", &self.tools.len())
            .finish_non_exhaustive()
    }
}
