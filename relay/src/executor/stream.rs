//! Streaming execution.
//!
//! Same loop shape as the synchronous path with an emit channel for
//! incremental output. Ordering guarantees:
//!
//! - `Text` events of iteration *n* all precede that iteration's
//!   `ToolStart` events.
//! - `ToolEnd(name)` strictly follows its `ToolStart(name)`; distinct
//!   tools may interleave.
//! - `Done` is terminal. On rejection or failure, `Error` is emitted and
//!   then `Done`.
//!
//! Structured output modes cannot stream — a JSON or YAML document is
//! only valid whole — and are rejected up front. Dropping the returned
//! stream cancels the underlying work cooperatively: the breaker permit
//! is released without recording an outcome and no failure is counted.

use std::pin::Pin;
use std::sync::Arc;
use std::time::Instant;

use async_stream::stream;
use futures::{Stream, StreamExt as _};
use tracing::{debug, info, warn};

use super::AgentExecutor;
use crate::command::AgentCommand;
use crate::error::{AgentError, ErrorCode};
use crate::guard::GuardResult;
use crate::hook::{HookContext, HookDecision};
use crate::message::Message;
use crate::metrics::MetricEvent;
use crate::result::AgentResult;
use crate::usage::Usage;

/// An incremental output event.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum StreamEvent {
    /// A chunk of assistant text.
    Text(String),
    /// A tool execution is starting.
    ToolStart(String),
    /// A tool execution finished.
    ToolEnd(String),
    /// The request failed; `Done` follows.
    Error {
        /// Stable error code.
        code: ErrorCode,
        /// Human-readable message.
        message: String,
    },
    /// Terminal event; nothing follows.
    Done,
}

impl StreamEvent {
    fn error(err: &AgentError) -> Self {
        Self::Error {
            code: err.code(),
            message: err.to_string(),
        }
    }
}

/// A boxed stream of [`StreamEvent`]s.
pub type EventStream = Pin<Box<dyn Stream<Item = StreamEvent> + Send>>;

impl AgentExecutor {
    /// Serve one request as a lazy event stream.
    ///
    /// Nothing runs until the stream is polled; dropping it cancels the
    /// request.
    #[must_use]
    pub fn execute_stream(self: &Arc<Self>, command: AgentCommand) -> EventStream {
        let this = Arc::clone(self);
        Box::pin(stream! {
            let started = Instant::now();

            // Structured output cannot be produced incrementally.
            if command.response_format.is_structured() {
                let err = AgentError::InvalidResponse {
                    message: "structured output formats cannot stream".to_owned(),
                };
                yield StreamEvent::error(&err);
                yield StreamEvent::Done;
                return;
            }

            // Admission permit, shared with the synchronous path.
            let _permit = match this.acquire_permit().await {
                Ok(permit) => permit,
                Err(err) => {
                    let result = AgentResult::from_error(&err, started.elapsed());
                    this.publish_execution(&command, &result);
                    yield StreamEvent::error(&err);
                    yield StreamEvent::Done;
                    return;
                }
            };

            // The per-run slate is created at admission, from the command
            // as the caller sent it; hooks observe the original prompt.
            let ctx = HookContext::new(&command);

            // Guard pipeline.
            if let GuardResult::Rejected { stage, category, message } =
                this.guards.check(&command).await
            {
                this.publish(MetricEvent::GuardRejection {
                    stage: stage.clone(),
                    category,
                    tenant_id: command.tenant_id.clone(),
                });
                let err = AgentError::GuardRejected { stage, category, message };
                info!(error = %err, "Streaming request rejected by guard");
                let result = AgentResult::from_error(&err, started.elapsed());
                this.publish_execution(&command, &result);
                yield StreamEvent::error(&err);
                yield StreamEvent::Done;
                return;
            }

            // Before-start hooks, then command resolution: hooks see the
            // admitted request, the loop sees the effective one.
            let decision = match this.hooks.before_agent_start(&ctx).await {
                Ok(decision) => decision,
                Err(err) => {
                    yield StreamEvent::error(&err);
                    yield StreamEvent::Done;
                    return;
                }
            };
            let early = match decision {
                HookDecision::Proceed => None,
                HookDecision::Rejected { hook, reason } => {
                    Some(AgentError::HookRejected { hook, reason })
                }
                HookDecision::Pending { hook, approval_id, message } => {
                    Some(AgentError::PendingApproval { hook, approval_id, message })
                }
            };
            if let Some(err) = early {
                let result = AgentResult::from_error(&err, started.elapsed());
                this.publish_execution(&command, &result);
                yield StreamEvent::error(&err);
                yield StreamEvent::Done;
                return;
            }

            let command = match &this.resolver {
                Some(resolver) => resolver(command),
                None => command,
            };

            let mut messages = this.assemble_messages(&command).await;
            let selected = this.select_tools(&command).await;
            let definitions: Vec<_> = selected.iter().map(|t| t.definition()).collect();

            let max_tool_calls = command.max_tool_calls.unwrap_or(this.config.max_tool_calls);
            let mut tools_enabled = !definitions.is_empty() && max_tool_calls > 0;
            let mut executed_calls: u32 = 0;
            let mut call_index: u32 = 0;

            let final_text = loop {
                messages = this.trimmer.trim(
                    &command.system_prompt,
                    messages,
                    this.config.max_context_window_tokens,
                    this.config.output_reserve_tokens,
                );
                let request = this.build_request(
                    &command,
                    &messages,
                    if tools_enabled { definitions.clone() } else { Vec::new() },
                );

                // One protected call: establishment retries, the breaker
                // observes the whole stream.
                let breaker = this.breakers.breaker(this.model.provider());
                let permit = match breaker.try_acquire() {
                    Ok(permit) => permit,
                    Err(err) => {
                        let result = AgentResult::from_error(&err, started.elapsed());
                        this.publish_execution(&command, &result);
                        yield StreamEvent::error(&err);
                        yield StreamEvent::Done;
                        return;
                    }
                };
                let established = this.retry.run(|_attempt| this.model.stream(&request)).await;
                let mut chunks = match established {
                    Ok(chunks) => chunks,
                    Err(err) => {
                        if err.is_cancellation() {
                            breaker.on_cancelled(permit);
                        } else {
                            breaker.on_failure(permit, &err);
                        }
                        let result = AgentResult::from_error(&err, started.elapsed());
                        this.publish_execution(&command, &result);
                        yield StreamEvent::error(&err);
                        yield StreamEvent::Done;
                        return;
                    }
                };

                let mut text = String::new();
                let mut tool_calls = Vec::new();
                let mut usage: Option<Usage> = None;
                let mut failure: Option<AgentError> = None;

                while let Some(chunk) = chunks.next().await {
                    match chunk {
                        Ok(chunk) => {
                            if let Some(delta) = chunk.text {
                                text.push_str(&delta);
                                yield StreamEvent::Text(delta);
                            }
                            tool_calls.extend(chunk.tool_calls);
                            if let Some(chunk_usage) = chunk.usage {
                                usage = Some(chunk_usage);
                            }
                        }
                        Err(err) => {
                            failure = Some(err);
                            break;
                        }
                    }
                }
                drop(chunks);

                if let Some(err) = failure {
                    if err.is_cancellation() {
                        breaker.on_cancelled(permit);
                    } else {
                        breaker.on_failure(permit, &err);
                    }
                    warn!(error = %err, "Stream failed mid-flight");
                    let result = AgentResult::from_error(&err, started.elapsed())
                        .with_tools_used(ctx.tools_used());
                    this.publish_execution(&command, &result);
                    yield StreamEvent::error(&err);
                    yield StreamEvent::Done;
                    return;
                }
                breaker.on_success(permit);

                // Usage comes from the final chunk's metadata, else zero.
                this.publish(MetricEvent::TokenUsage {
                    provider: this.model.provider().to_owned(),
                    model: this.model.default_model().to_owned(),
                    at: std::time::SystemTime::now(),
                    usage: usage.unwrap_or_else(Usage::zero),
                    estimated_cost_usd: None,
                    tenant_id: command.tenant_id.clone(),
                });

                if !tools_enabled || tool_calls.is_empty() {
                    break text;
                }

                let mut calls = tool_calls;
                for call in &mut calls {
                    call.call_index = call_index;
                    call_index += 1;
                }
                messages.push(Message::assistant_with_tools(text, calls.clone()));

                for call in &calls {
                    yield StreamEvent::ToolStart(call.name.clone());
                }
                let outcomes = this.run_tool_calls(&command, &ctx, &calls).await;
                for (call, outcome) in &outcomes {
                    messages.push(Message::tool_response(&call.name, &outcome.content));
                    yield StreamEvent::ToolEnd(call.name.clone());
                }

                executed_calls += calls.len() as u32;
                if executed_calls >= max_tool_calls && tools_enabled {
                    debug!(executed_calls, max_tool_calls, "Tool budget exhausted; forcing final answer");
                    tools_enabled = false;
                }
            };

            // Streaming text is already with the client: boundaries and
            // filters do not apply retroactively. Persist and finish.
            this.conversation.save_history(&command, &final_text).await;

            let result = AgentResult::success(final_text, ctx.tools_used(), started.elapsed());
            if let Err(err) = this.hooks.after_agent_complete(&ctx, &result).await {
                warn!(error = %err, "After-complete hook failed");
            }
            this.publish_execution(&command, &result);
            yield StreamEvent::Done;
        })
    }
}
