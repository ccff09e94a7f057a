//! End-to-end executor scenarios against a scripted mock model.

#![allow(clippy::unwrap_used, clippy::panic)]

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use futures::StreamExt as _;
use serde_json::{Map, Value};

use relay::prelude::*;

// ---------------------------------------------------------------------------
// Scripted mock model
// ---------------------------------------------------------------------------

/// One scripted model turn.
#[derive(Clone)]
enum Step {
    /// Final text answer.
    Text(&'static str),
    /// Request these tool calls (by tool name, echo-style args).
    Tools(Vec<&'static str>),
    /// Fail the call with a timeout.
    FailTimeout,
}

struct ScriptedModel {
    script: Vec<Step>,
    cursor: AtomicUsize,
    calls: AtomicUsize,
}

impl ScriptedModel {
    fn new(script: Vec<Step>) -> Arc<Self> {
        Arc::new(Self {
            script,
            cursor: AtomicUsize::new(0),
            calls: AtomicUsize::new(0),
        })
    }

    fn calls(&self) -> usize {
        self.calls.load(Ordering::SeqCst)
    }

    fn next_step(&self) -> Step {
        let i = self.cursor.fetch_add(1, Ordering::SeqCst);
        self.script
            .get(i)
            .cloned()
            .unwrap_or(Step::Text("out of script"))
    }

    fn step_response(&self, step: &Step) -> relay::Result<CompletionResponse> {
        match step {
            Step::Text(text) => Ok(CompletionResponse {
                text: Some((*text).to_owned()),
                tool_calls: Vec::new(),
                usage: Usage::new(10, 5),
                model: "mock-1".to_owned(),
            }),
            Step::Tools(names) => {
                let tool_calls = names
                    .iter()
                    .map(|name| {
                        let mut args = Map::new();
                        args.insert("message".to_owned(), Value::String((*name).to_owned()));
                        ToolCall::new(*name, args, 0)
                    })
                    .collect();
                Ok(CompletionResponse {
                    text: None,
                    tool_calls,
                    usage: Usage::new(10, 5),
                    model: "mock-1".to_owned(),
                })
            }
            Step::FailTimeout => Err(AgentError::llm_timeout("simulated deadline")),
        }
    }
}

#[async_trait]
impl LanguageModel for ScriptedModel {
    fn provider(&self) -> &str {
        "mock"
    }

    fn default_model(&self) -> &str {
        "mock-1"
    }

    async fn complete(&self, _request: &CompletionRequest) -> relay::Result<CompletionResponse> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        let step = self.next_step();
        self.step_response(&step)
    }

    async fn stream(&self, _request: &CompletionRequest) -> relay::Result<ChunkStream> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        let step = self.next_step();
        let response = self.step_response(&step)?;

        let mut chunks: Vec<relay::Result<CompletionChunk>> = Vec::new();
        if let Some(text) = &response.text {
            // Split the text into two deltas to exercise accumulation.
            let mid = text.len() / 2;
            let (head, tail) = text.split_at(mid);
            if !head.is_empty() {
                chunks.push(Ok(CompletionChunk {
                    text: Some(head.to_owned()),
                    ..Default::default()
                }));
            }
            chunks.push(Ok(CompletionChunk {
                text: Some(tail.to_owned()),
                ..Default::default()
            }));
        }
        if !response.tool_calls.is_empty() {
            chunks.push(Ok(CompletionChunk {
                tool_calls: response.tool_calls.clone(),
                ..Default::default()
            }));
        }
        chunks.push(Ok(CompletionChunk {
            usage: Some(response.usage),
            ..Default::default()
        }));

        Ok(Box::pin(futures::stream::iter(chunks)))
    }
}

// ---------------------------------------------------------------------------
// Test tool and hooks
// ---------------------------------------------------------------------------

#[derive(serde::Deserialize, schemars::JsonSchema)]
struct EchoArgs {
    message: String,
}

struct EchoTool;

#[async_trait]
impl Tool for EchoTool {
    const NAME: &'static str = "echo";
    type Args = EchoArgs;

    fn description(&self) -> String {
        "Echoes back the input message.".to_owned()
    }

    async fn run(&self, args: EchoArgs) -> relay::Result<ToolOutput> {
        Ok(ToolOutput::text(format!("echo: {}", args.message)))
    }
}

struct RejectingStartHook;

#[async_trait]
impl AgentStartHook for RejectingStartHook {
    fn name(&self) -> &str {
        "authz"
    }

    async fn before_agent_start(&self, _ctx: &HookContext) -> relay::Result<HookResult> {
        Ok(HookResult::Reject("unauthorized".to_owned()))
    }
}

fn drain_all(drainer: &mut Drainer) -> Vec<MetricEvent> {
    let mut events = Vec::new();
    loop {
        let batch = drainer.drain(256);
        if batch.is_empty() {
            break events;
        }
        events.extend(batch);
    }
}

// ---------------------------------------------------------------------------
// Scenarios
// ---------------------------------------------------------------------------

/// S01: plain hello, no tools, cacheable; one LLM call, cache populated.
#[tokio::test]
async fn s01_hello_populates_cache() {
    let model = ScriptedModel::new(vec![Step::Text("Hello there!")]);
    let cache = Arc::new(InMemoryResponseCache::new(16, Duration::from_secs(60)));
    let executor = AgentExecutor::builder(Arc::<ScriptedModel>::clone(&model))
        .cache(Arc::<InMemoryResponseCache>::clone(&cache))
        .build();

    let result = executor
        .execute(AgentCommand::builder("hello").temperature(0.0).build())
        .await;

    assert!(result.success, "unexpected failure: {:?}", result.error_message);
    assert_eq!(result.content.as_deref(), Some("Hello there!"));
    assert!(result.tools_used.is_empty());
    assert_eq!(model.calls(), 1);
    assert_eq!(cache.len(), 1);

    // Invariant 2: the identical command is served from the cache with
    // zero further LLM calls.
    let again = executor
        .execute(AgentCommand::builder("hello").temperature(0.0).build())
        .await;
    assert!(again.success);
    assert_eq!(again.content.as_deref(), Some("Hello there!"));
    assert_eq!(model.calls(), 1);
}

/// Invariant 3: above the cacheable temperature every execution hits
/// the model.
#[tokio::test]
async fn non_cacheable_commands_always_invoke_model() {
    let model = ScriptedModel::new(vec![Step::Text("a"), Step::Text("b")]);
    let cache = Arc::new(InMemoryResponseCache::new(16, Duration::from_secs(60)));
    let executor = AgentExecutor::builder(Arc::<ScriptedModel>::clone(&model))
        .cache(cache)
        .build();

    for _ in 0..2 {
        let result = executor
            .execute(AgentCommand::builder("creative").temperature(0.9).build())
            .await;
        assert!(result.success);
    }
    assert_eq!(model.calls(), 2);
}

/// S02: dangerous input rejected by the validation stage before any
/// model work.
#[tokio::test]
async fn s02_guard_rejects_dangerous_input() {
    let model = ScriptedModel::new(vec![Step::Text("never reached")]);
    let (buffer, mut drainer) = MetricRingBuffer::with_capacity(64);
    let executor = AgentExecutor::builder(Arc::<ScriptedModel>::clone(&model))
        .guard(Arc::new(
            InputValidationStage::new(10_000).with_denied_patterns(vec!["rm -rf /".to_owned()]),
        ))
        .metrics(Arc::clone(&buffer))
        .build();

    let result = executor
        .execute(AgentCommand::builder("rm -rf / please").build())
        .await;

    assert!(!result.success);
    assert_eq!(result.error_code, Some(ErrorCode::GuardRejected));
    assert!(result.error_message.as_deref().unwrap().contains("inputValidation"));
    assert_eq!(model.calls(), 0);

    let events = drain_all(&mut drainer);
    assert!(events.iter().any(|e| matches!(
        e,
        MetricEvent::GuardRejection { stage, .. } if stage == "inputValidation"
    )));
}

/// Before-start hooks observe the request as admitted; command
/// resolution applies afterward and everything downstream sees it.
#[tokio::test]
async fn start_hooks_run_before_command_resolution() {
    struct PromptRecorder {
        seen: Arc<Mutex<Vec<String>>>,
    }

    #[async_trait]
    impl AgentStartHook for PromptRecorder {
        fn name(&self) -> &str {
            "prompt-recorder"
        }

        async fn before_agent_start(&self, ctx: &HookContext) -> relay::Result<HookResult> {
            self.seen.lock().unwrap().push(ctx.user_prompt().to_owned());
            Ok(HookResult::Continue)
        }
    }

    let model = ScriptedModel::new(vec![Step::Text("resolved answer")]);
    let store = Arc::new(InMemoryStore::new());
    let seen = Arc::new(Mutex::new(Vec::new()));
    let resolver: CommandResolver = Arc::new(|mut command: AgentCommand| {
        command.user_prompt = format!("[persona] {}", command.user_prompt);
        command
    });
    let executor = AgentExecutor::builder(Arc::<ScriptedModel>::clone(&model))
        .start_hook(Arc::new(PromptRecorder {
            seen: Arc::clone(&seen),
        }))
        .resolver(resolver)
        .memory_store(Arc::<InMemoryStore>::clone(&store))
        .build();

    let result = executor
        .execute(AgentCommand::builder("original ask").session_id("s-1").build())
        .await;
    assert!(result.success);

    // The hook saw the prompt before resolution rewrote it.
    assert_eq!(*seen.lock().unwrap(), vec!["original ask".to_owned()]);
    // The loop and the conversation save saw the resolved command.
    let messages = store.get("s-1").await.unwrap().unwrap();
    assert_eq!(messages[0].text(), "[persona] original ask");
}

/// S03: a rejecting before-start hook fails the run with zero model
/// calls.
#[tokio::test]
async fn s03_hook_rejection() {
    let model = ScriptedModel::new(vec![Step::Text("never reached")]);
    let executor = AgentExecutor::builder(Arc::<ScriptedModel>::clone(&model))
        .start_hook(Arc::new(RejectingStartHook))
        .build();

    let result = executor
        .execute(AgentCommand::builder("sync inventory").build())
        .await;

    assert!(!result.success);
    assert_eq!(result.error_code, Some(ErrorCode::HookRejected));
    assert!(result.error_message.as_deref().unwrap().contains("unauthorized"));
    assert_eq!(model.calls(), 0);
}

/// S04: repeated timeouts open the breaker; the open breaker rejects
/// without model work; a successful probe closes it again.
#[tokio::test]
async fn s04_circuit_breaker_lifecycle() {
    let model = ScriptedModel::new(vec![
        Step::FailTimeout,
        Step::FailTimeout,
        Step::Text("recovered"),
    ]);
    let (buffer, mut drainer) = MetricRingBuffer::with_capacity(64);

    let config = ExecutorConfig {
        retry: RetryPolicy::no_retry(),
        breaker: CircuitBreakerConfig {
            failure_threshold: 2,
            reset_timeout: Duration::from_millis(50),
            half_open_max_calls: 1,
            count_rate_limits: true,
        },
        ..Default::default()
    };
    let executor = AgentExecutor::builder(Arc::<ScriptedModel>::clone(&model))
        .config(config)
        .metrics(Arc::clone(&buffer))
        .build();

    let first = executor
        .execute(AgentCommand::builder("summarize today").build())
        .await;
    assert_eq!(first.error_code, Some(ErrorCode::Timeout));

    let second = executor
        .execute(AgentCommand::builder("summarize today").build())
        .await;
    assert_eq!(second.error_code, Some(ErrorCode::Timeout));
    assert_eq!(model.calls(), 2);

    // Breaker is now open: no model invocation.
    let third = executor
        .execute(AgentCommand::builder("summarize today").build())
        .await;
    assert_eq!(third.error_code, Some(ErrorCode::CircuitBreakerOpen));
    assert_eq!(model.calls(), 2);

    // After the reset timeout a trial call succeeds and closes the
    // breaker.
    tokio::time::sleep(Duration::from_millis(70)).await;
    let fourth = executor
        .execute(AgentCommand::builder("summarize today").build())
        .await;
    assert!(fourth.success);
    assert_eq!(fourth.content.as_deref(), Some("recovered"));
    assert_eq!(model.calls(), 3);

    let transitions: Vec<(BreakerState, BreakerState)> = drain_all(&mut drainer)
        .into_iter()
        .filter_map(|e| match e {
            MetricEvent::BreakerTransition { from, to, .. } => Some((from, to)),
            _ => None,
        })
        .collect();
    assert_eq!(
        transitions,
        vec![
            (BreakerState::Closed, BreakerState::Open),
            (BreakerState::Open, BreakerState::HalfOpen),
            (BreakerState::HalfOpen, BreakerState::Closed),
        ]
    );
}

/// S05: over-long content is truncated with the marker and a boundary
/// violation event.
#[tokio::test]
async fn s05_output_truncation() {
    let model = ScriptedModel::new(vec![Step::Text("aaaaaaaaaaaa")]);
    let (buffer, mut drainer) = MetricRingBuffer::with_capacity(64);

    let config = ExecutorConfig {
        boundary: OutputBoundary {
            output_max_chars: 10,
            ..Default::default()
        },
        ..Default::default()
    };
    let executor = AgentExecutor::builder(Arc::<ScriptedModel>::clone(&model))
        .config(config)
        .metrics(Arc::clone(&buffer))
        .build();

    let result = executor.execute(AgentCommand::builder("stretch").build()).await;

    assert!(result.success);
    assert_eq!(
        result.content.as_deref(),
        Some("aaaaaaaaaa[Response truncated]")
    );

    let events = drain_all(&mut drainer);
    assert!(events.iter().any(|e| matches!(
        e,
        MetricEvent::BoundaryViolation { policy, observed_chars: 12, limit_chars: 10, .. }
            if policy == "truncate"
    )));
}

/// An output guard stage rejects the final content with
/// OUTPUT_GUARD_REJECTED; nothing is cached.
#[tokio::test]
async fn output_guard_rejects_response() {
    struct SecretScanStage;

    #[async_trait]
    impl OutputGuardStage for SecretScanStage {
        fn name(&self) -> &str {
            "secretScan"
        }

        fn order(&self) -> i32 {
            10
        }

        async fn check(
            &self,
            _command: &AgentCommand,
            content: &str,
        ) -> relay::Result<GuardResult> {
            if content.contains("SECRET") {
                Ok(GuardResult::rejected(
                    "secretScan",
                    GuardRejectCategory::Validation,
                    "response leaks a secret",
                ))
            } else {
                Ok(GuardResult::Allowed)
            }
        }
    }

    let model = ScriptedModel::new(vec![Step::Text("the SECRET is 42")]);
    let cache = Arc::new(InMemoryResponseCache::new(16, Duration::from_secs(60)));
    let (buffer, mut drainer) = MetricRingBuffer::with_capacity(64);
    let executor = AgentExecutor::builder(Arc::<ScriptedModel>::clone(&model))
        .cache(Arc::<InMemoryResponseCache>::clone(&cache))
        .output_guard(Arc::new(SecretScanStage))
        .metrics(Arc::clone(&buffer))
        .build();

    let result = executor
        .execute(AgentCommand::builder("leak it").temperature(0.0).build())
        .await;

    assert!(!result.success);
    assert_eq!(result.error_code, Some(ErrorCode::OutputGuardRejected));
    assert!(result.error_message.as_deref().unwrap().contains("secretScan"));
    assert_eq!(model.calls(), 1);
    // The rejected response never reaches the cache.
    assert!(cache.is_empty());

    let events = drain_all(&mut drainer);
    assert!(events.iter().any(|e| matches!(
        e,
        MetricEvent::GuardRejection { stage, .. } if stage == "secretScan"
    )));
}

/// Min-length FAIL mode surfaces OUTPUT_TOO_SHORT.
#[tokio::test]
async fn min_length_fail_mode() {
    let model = ScriptedModel::new(vec![Step::Text("ok")]);
    let config = ExecutorConfig {
        boundary: OutputBoundary {
            output_min_chars: 100,
            min_violation_mode: MinViolationMode::Fail,
            ..Default::default()
        },
        ..Default::default()
    };
    let executor = AgentExecutor::builder(Arc::<ScriptedModel>::clone(&model))
        .config(config)
        .build();

    let result = executor.execute(AgentCommand::builder("hi").build()).await;
    assert!(!result.success);
    assert_eq!(result.error_code, Some(ErrorCode::OutputTooShort));
}

/// Min-length RETRY_ONCE accepts the retry only when it meets the
/// limit.
#[tokio::test]
async fn min_length_retry_once() {
    let long_answer: &'static str =
        "This considerably longer answer easily clears the configured minimum length bound.";
    let model = ScriptedModel::new(vec![Step::Text("ok"), Step::Text(long_answer)]);
    let config = ExecutorConfig {
        boundary: OutputBoundary {
            output_min_chars: 40,
            min_violation_mode: MinViolationMode::RetryOnce,
            ..Default::default()
        },
        ..Default::default()
    };
    let executor = AgentExecutor::builder(Arc::<ScriptedModel>::clone(&model))
        .config(config)
        .build();

    let result = executor.execute(AgentCommand::builder("explain").build()).await;
    assert!(result.success);
    assert_eq!(result.content.as_deref(), Some(long_answer));
    assert_eq!(model.calls(), 2);
}

/// S06: structured output over a stream is rejected up front.
#[tokio::test]
async fn s06_streaming_rejects_structured_output() {
    let model = ScriptedModel::new(vec![Step::Text("never reached")]);
    let executor = AgentExecutor::builder(Arc::<ScriptedModel>::clone(&model)).build();

    let command = AgentCommand::builder("as json")
        .response_format(ResponseFormat::Json)
        .build();
    let events: Vec<StreamEvent> = executor.execute_stream(command).collect().await;

    assert_eq!(events.len(), 2);
    assert!(matches!(
        &events[0],
        StreamEvent::Error { code: ErrorCode::InvalidResponse, .. }
    ));
    assert_eq!(events[1], StreamEvent::Done);
    assert_eq!(model.calls(), 0);
}

// ---------------------------------------------------------------------------
// ReAct loop
// ---------------------------------------------------------------------------

/// The loop executes requested tools and feeds results back to the
/// model.
#[tokio::test]
async fn react_loop_runs_tools() {
    let model = ScriptedModel::new(vec![Step::Tools(vec!["echo"]), Step::Text("done")]);
    let executor = AgentExecutor::builder(Arc::<ScriptedModel>::clone(&model))
        .tool(Arc::new(EchoTool))
        .build();

    let result = executor.execute(AgentCommand::builder("use the tool").build()).await;

    assert!(result.success);
    assert_eq!(result.content.as_deref(), Some("done"));
    assert_eq!(result.tools_used, vec!["echo".to_owned()]);
    assert_eq!(model.calls(), 2);
}

/// Invariant 1: the loop terminates in at most max_tool_calls + 1 model
/// calls even against a model that never stops requesting tools.
#[tokio::test]
async fn tool_budget_bounds_llm_calls() {
    let model = ScriptedModel::new(vec![
        Step::Tools(vec!["echo"]),
        Step::Tools(vec!["echo"]),
        Step::Tools(vec!["echo"]),
        Step::Tools(vec!["echo"]),
    ]);
    let config = ExecutorConfig {
        max_tool_calls: 2,
        ..Default::default()
    };
    let executor = AgentExecutor::builder(Arc::<ScriptedModel>::clone(&model))
        .config(config)
        .tool(Arc::new(EchoTool))
        .build();

    let result = executor.execute(AgentCommand::builder("loop forever").build()).await;

    assert!(result.success);
    // Two tool iterations plus one forced toolless iteration.
    assert_eq!(model.calls(), 3);
    assert_eq!(result.tools_used.len(), 2);
}

/// A failing tool becomes a tool response; the request still succeeds.
#[tokio::test]
async fn tool_failure_does_not_fail_request() {
    let model = ScriptedModel::new(vec![Step::Tools(vec!["missing_tool"]), Step::Text("coped")]);
    let executor = AgentExecutor::builder(Arc::<ScriptedModel>::clone(&model))
        .tool(Arc::new(EchoTool))
        .build();

    let result = executor.execute(AgentCommand::builder("try it").build()).await;
    assert!(result.success);
    assert_eq!(result.content.as_deref(), Some("coped"));
}

/// Fallback models recover a failed primary call exactly once.
#[tokio::test]
async fn fallback_recovers_primary_failure() {
    struct FlakyPrimary {
        calls: AtomicUsize,
    }

    #[async_trait]
    impl LanguageModel for FlakyPrimary {
        fn provider(&self) -> &str {
            "mock"
        }

        fn default_model(&self) -> &str {
            "primary"
        }

        async fn complete(&self, request: &CompletionRequest) -> relay::Result<CompletionResponse> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            match request.options.model.as_deref() {
                Some("backup") => Ok(CompletionResponse {
                    text: Some("from backup".to_owned()),
                    tool_calls: Vec::new(),
                    usage: Usage::new(5, 5),
                    model: "backup".to_owned(),
                }),
                _ => Err(AgentError::llm(LlmErrorKind::Server, "primary down")),
            }
        }
    }

    let config = ExecutorConfig {
        retry: RetryPolicy::no_retry(),
        ..Default::default()
    };
    let executor = AgentExecutor::builder(Arc::new(FlakyPrimary {
        calls: AtomicUsize::new(0),
    }))
    .config(config)
    .fallback_models(vec!["backup".to_owned()])
    .build();

    let result = executor.execute(AgentCommand::builder("anything").build()).await;
    assert!(result.success);
    assert_eq!(result.content.as_deref(), Some("from backup"));
}

/// Saturated executor in fail-fast mode rejects with OVERLOADED.
#[tokio::test]
async fn fail_fast_saturation() {
    struct SlowModel;

    #[async_trait]
    impl LanguageModel for SlowModel {
        fn provider(&self) -> &str {
            "mock"
        }

        fn default_model(&self) -> &str {
            "slow"
        }

        async fn complete(&self, _request: &CompletionRequest) -> relay::Result<CompletionResponse> {
            tokio::time::sleep(Duration::from_millis(200)).await;
            Ok(CompletionResponse {
                text: Some("slow answer".to_owned()),
                ..Default::default()
            })
        }
    }

    let config = ExecutorConfig {
        max_concurrent_requests: 1,
        fail_fast_on_saturation: true,
        ..Default::default()
    };
    let executor = AgentExecutor::builder(Arc::new(SlowModel)).config(config).build();

    let busy = {
        let executor = Arc::clone(&executor);
        tokio::spawn(async move { executor.execute(AgentCommand::builder("first").build()).await })
    };
    tokio::time::sleep(Duration::from_millis(50)).await;

    let rejected = executor.execute(AgentCommand::builder("second").build()).await;
    assert_eq!(rejected.error_code, Some(ErrorCode::Overloaded));

    let first = busy.await.unwrap();
    assert!(first.success);
}

// ---------------------------------------------------------------------------
// Streaming
// ---------------------------------------------------------------------------

/// Invariant 8: text precedes tool starts per iteration, start precedes
/// end per tool, Done is last.
#[tokio::test]
async fn streaming_event_ordering() {
    let model = ScriptedModel::new(vec![Step::Tools(vec!["echo"]), Step::Text("all done")]);
    let executor = AgentExecutor::builder(Arc::<ScriptedModel>::clone(&model))
        .tool(Arc::new(EchoTool))
        .build();

    let events: Vec<StreamEvent> = executor
        .execute_stream(AgentCommand::builder("stream it").build())
        .collect()
        .await;

    let start_pos = events
        .iter()
        .position(|e| matches!(e, StreamEvent::ToolStart(name) if name == "echo"))
        .unwrap();
    let end_pos = events
        .iter()
        .position(|e| matches!(e, StreamEvent::ToolEnd(name) if name == "echo"))
        .unwrap();
    assert!(start_pos < end_pos);

    // The final text arrives after tool completion, then Done.
    let text: String = events
        .iter()
        .filter_map(|e| match e {
            StreamEvent::Text(t) => Some(t.as_str()),
            _ => None,
        })
        .collect();
    assert_eq!(text, "all done");
    assert_eq!(events.last(), Some(&StreamEvent::Done));
    assert!(!events.iter().any(|e| matches!(e, StreamEvent::Error { .. })));
}

/// Guard rejections stream as Error then Done.
#[tokio::test]
async fn streaming_guard_rejection() {
    let model = ScriptedModel::new(vec![Step::Text("never reached")]);
    let executor = AgentExecutor::builder(Arc::<ScriptedModel>::clone(&model))
        .guard(Arc::new(InputValidationStage::new(4)))
        .build();

    let events: Vec<StreamEvent> = executor
        .execute_stream(AgentCommand::builder("far too long").build())
        .collect()
        .await;

    assert_eq!(events.len(), 2);
    assert!(matches!(
        &events[0],
        StreamEvent::Error { code: ErrorCode::GuardRejected, .. }
    ));
    assert_eq!(events[1], StreamEvent::Done);
    assert_eq!(model.calls(), 0);
}

// ---------------------------------------------------------------------------
// Memory
// ---------------------------------------------------------------------------

/// Successful runs append user and assistant turns to the session.
#[tokio::test]
async fn successful_runs_persist_conversation() {
    let model = ScriptedModel::new(vec![Step::Text("first answer"), Step::Text("second answer")]);
    let store = Arc::new(InMemoryStore::new());
    let executor = AgentExecutor::builder(Arc::<ScriptedModel>::clone(&model))
        .memory_store(Arc::<InMemoryStore>::clone(&store))
        .build();

    executor
        .execute(AgentCommand::builder("first question").session_id("s-1").build())
        .await;
    executor
        .execute(AgentCommand::builder("second question").session_id("s-1").build())
        .await;

    let messages = store.get("s-1").await.unwrap().unwrap();
    assert_eq!(messages.len(), 4);
    assert_eq!(messages[0].text(), "first question");
    assert_eq!(messages[1].text(), "first answer");
    assert_eq!(messages[2].text(), "second question");
    assert_eq!(messages[3].text(), "second answer");
}

/// Failed runs save nothing.
#[tokio::test]
async fn failed_runs_do_not_persist() {
    let model = ScriptedModel::new(vec![Step::FailTimeout]);
    let store = Arc::new(InMemoryStore::new());
    let config = ExecutorConfig {
        retry: RetryPolicy::no_retry(),
        ..Default::default()
    };
    let executor = AgentExecutor::builder(Arc::<ScriptedModel>::clone(&model))
        .config(config)
        .memory_store(Arc::<InMemoryStore>::clone(&store))
        .build();

    let result = executor
        .execute(AgentCommand::builder("doomed").session_id("s-1").build())
        .await;
    assert!(!result.success);
    assert!(store.get("s-1").await.unwrap().is_none());
}
