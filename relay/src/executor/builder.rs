//! The composition root.
//!
//! Everything the executor collaborates with is wired here explicitly —
//! no ambient registries, no framework magic. Optional collaborators
//! stay `None` and the executor degrades accordingly: no cache means no
//! cache lookups, no metrics buffer means events are dropped at the
//! source, no summary service means windowed memory.

use std::sync::Arc;

use tokio::sync::Semaphore;

use super::config::ExecutorConfig;
use super::{AgentExecutor, CommandResolver, ContextRetriever};
use crate::breaker::{CircuitBreakerRegistry, TransitionListener};
use crate::cache::ResponseCache;
use crate::command::AgentCommand;
use crate::error::AgentError;
use crate::fallback::FallbackStrategy;
use crate::filter::{ResponseFilter, ResponseFilterChain};
use crate::guard::{GuardPipeline, GuardStage, OutputGuardPipeline, OutputGuardStage};
use crate::hook::{AgentCompleteHook, AgentStartHook, HookExecutor, ToolEndHook, ToolStartHook};
use crate::memory::{
    ConversationManager, MemoryStore, MessageTrimmer, Summarizer, SummaryService, SummaryStore,
    UserMemoryStore,
};
use crate::metrics::{MetricEvent, MetricRingBuffer};
use crate::provider::LanguageModel;
use crate::token::{HeuristicTokenEstimator, TokenEstimator};
use crate::tool::{AllSelector, DynTool, ToolRegistry, ToolSelector, WorkerAgentTool};
use crate::tool::adapt::WorkerRunFuture;

/// Builder for [`AgentExecutor`].
pub struct AgentExecutorBuilder {
    model: Arc<dyn LanguageModel>,
    config: ExecutorConfig,
    guards: Vec<Arc<dyn GuardStage>>,
    output_guards: Vec<Arc<dyn OutputGuardStage>>,
    start_hooks: Vec<Arc<dyn AgentStartHook>>,
    tool_start_hooks: Vec<Arc<dyn ToolStartHook>>,
    tool_end_hooks: Vec<Arc<dyn ToolEndHook>>,
    complete_hooks: Vec<Arc<dyn AgentCompleteHook>>,
    tools: ToolRegistry,
    selector: Option<Arc<dyn ToolSelector>>,
    estimator: Option<Arc<dyn TokenEstimator>>,
    memory_store: Option<Arc<dyn MemoryStore>>,
    summary: Option<(Arc<dyn SummaryService>, Arc<dyn SummaryStore>)>,
    user_memory: Option<Arc<dyn UserMemoryStore>>,
    context_retriever: Option<Arc<dyn ContextRetriever>>,
    resolver: Option<CommandResolver>,
    cache: Option<Arc<dyn ResponseCache>>,
    filters: Vec<Arc<dyn ResponseFilter>>,
    fallback_models: Vec<String>,
    metrics: Option<Arc<MetricRingBuffer>>,
}

impl AgentExecutorBuilder {
    /// Start building around a model.
    #[must_use]
    pub fn new(model: Arc<dyn LanguageModel>) -> Self {
        Self {
            model,
            config: ExecutorConfig::default(),
            guards: Vec::new(),
            output_guards: Vec::new(),
            start_hooks: Vec::new(),
            tool_start_hooks: Vec::new(),
            tool_end_hooks: Vec::new(),
            complete_hooks: Vec::new(),
            tools: ToolRegistry::new(),
            selector: None,
            estimator: None,
            memory_store: None,
            summary: None,
            user_memory: None,
            context_retriever: None,
            resolver: None,
            cache: None,
            filters: Vec::new(),
            fallback_models: Vec::new(),
            metrics: None,
        }
    }

    /// Replace the configuration.
    #[must_use]
    pub fn config(mut self, config: ExecutorConfig) -> Self {
        self.config = config;
        self
    }

    /// Add a guard stage.
    #[must_use]
    pub fn guard(mut self, stage: Arc<dyn GuardStage>) -> Self {
        self.guards.push(stage);
        self
    }

    /// Add an output guard stage, run on the final content.
    #[must_use]
    pub fn output_guard(mut self, stage: Arc<dyn OutputGuardStage>) -> Self {
        self.output_guards.push(stage);
        self
    }

    /// Add a before-agent-start hook.
    #[must_use]
    pub fn start_hook(mut self, hook: Arc<dyn AgentStartHook>) -> Self {
        self.start_hooks.push(hook);
        self
    }

    /// Add a before-tool-call hook.
    #[must_use]
    pub fn tool_start_hook(mut self, hook: Arc<dyn ToolStartHook>) -> Self {
        self.tool_start_hooks.push(hook);
        self
    }

    /// Add an after-tool-call hook.
    #[must_use]
    pub fn tool_end_hook(mut self, hook: Arc<dyn ToolEndHook>) -> Self {
        self.tool_end_hooks.push(hook);
        self
    }

    /// Add an after-agent-complete hook.
    #[must_use]
    pub fn complete_hook(mut self, hook: Arc<dyn AgentCompleteHook>) -> Self {
        self.complete_hooks.push(hook);
        self
    }

    /// Register a tool.
    #[must_use]
    pub fn tool(mut self, tool: Arc<dyn DynTool>) -> Self {
        self.tools.register(tool);
        self
    }

    /// Replace the tool registry wholesale.
    #[must_use]
    pub fn tools(mut self, tools: ToolRegistry) -> Self {
        self.tools = tools;
        self
    }

    /// Set the tool selection policy (default: all tools).
    #[must_use]
    pub fn selector(mut self, selector: Arc<dyn ToolSelector>) -> Self {
        self.selector = Some(selector);
        self
    }

    /// Replace the token estimator (default: character heuristic).
    #[must_use]
    pub fn token_estimator(mut self, estimator: Arc<dyn TokenEstimator>) -> Self {
        self.estimator = Some(estimator);
        self
    }

    /// Wire conversation persistence.
    #[must_use]
    pub fn memory_store(mut self, store: Arc<dyn MemoryStore>) -> Self {
        self.memory_store = Some(store);
        self
    }

    /// Wire hierarchical summarization.
    #[must_use]
    pub fn summarization(
        mut self,
        service: Arc<dyn SummaryService>,
        store: Arc<dyn SummaryStore>,
    ) -> Self {
        self.summary = Some((service, store));
        self
    }

    /// Wire long-lived user memory.
    #[must_use]
    pub fn user_memory(mut self, store: Arc<dyn UserMemoryStore>) -> Self {
        self.user_memory = Some(store);
        self
    }

    /// Wire retrieval-augmented context.
    #[must_use]
    pub fn context_retriever(mut self, retriever: Arc<dyn ContextRetriever>) -> Self {
        self.context_retriever = Some(retriever);
        self
    }

    /// Set the command resolver (intent resolution, persona selection).
    #[must_use]
    pub fn resolver(mut self, resolver: CommandResolver) -> Self {
        self.resolver = Some(resolver);
        self
    }

    /// Wire the response cache.
    #[must_use]
    pub fn cache(mut self, cache: Arc<dyn ResponseCache>) -> Self {
        self.cache = Some(cache);
        self
    }

    /// Add a response filter.
    #[must_use]
    pub fn filter(mut self, filter: Arc<dyn ResponseFilter>) -> Self {
        self.filters.push(filter);
        self
    }

    /// Configure fallback models, tried in order after primary failure.
    #[must_use]
    pub fn fallback_models(mut self, models: Vec<String>) -> Self {
        self.fallback_models = models;
        self
    }

    /// Wire the metric ring buffer; without it, events are discarded at
    /// the source.
    #[must_use]
    pub fn metrics(mut self, buffer: Arc<MetricRingBuffer>) -> Self {
        self.metrics = Some(buffer);
        self
    }

    /// Assemble the executor.
    #[must_use]
    pub fn build(self) -> Arc<AgentExecutor> {
        let estimator = self
            .estimator
            .unwrap_or_else(|| Arc::new(HeuristicTokenEstimator));

        let mut breakers = CircuitBreakerRegistry::new(self.config.breaker.clone());
        if let Some(buffer) = &self.metrics {
            let buffer = Arc::clone(buffer);
            let listener: TransitionListener = Arc::new(move |name, from, to| {
                let _ = buffer.publish(MetricEvent::BreakerTransition {
                    name: name.to_owned(),
                    from,
                    to,
                    tenant_id: None,
                });
            });
            breakers = breakers.with_listener(listener);
        }

        let summarizer = self
            .summary
            .map(|(service, store)| Arc::new(Summarizer::new(service, store)));
        let conversation = ConversationManager::new(
            self.memory_store,
            summarizer,
            self.config.conversation.clone(),
        );

        let fallback = (!self.fallback_models.is_empty())
            .then(|| FallbackStrategy::new(self.fallback_models));

        Arc::new(AgentExecutor {
            model: self.model,
            guards: GuardPipeline::new(self.guards),
            output_guards: OutputGuardPipeline::new(self.output_guards),
            hooks: HookExecutor::new(
                self.start_hooks,
                self.tool_start_hooks,
                self.tool_end_hooks,
                self.complete_hooks,
            ),
            tools: Arc::new(self.tools),
            selector: self.selector.unwrap_or_else(|| Arc::new(AllSelector)),
            conversation,
            user_memory: self.user_memory,
            context_retriever: self.context_retriever,
            resolver: self.resolver,
            trimmer: MessageTrimmer::new(Arc::clone(&estimator)),
            cache: self.cache,
            retry: self.config.retry.clone(),
            breakers: Arc::new(breakers),
            fallback,
            filters: ResponseFilterChain::new(self.filters),
            metrics: self.metrics,
            permits: Arc::new(Semaphore::new(self.config.max_concurrent_requests.max(1))),
            config: self.config,
        })
    }
}

impl std::fmt::Debug for AgentExecutorBuilder {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("AgentExecutorBuilder")
            .field("provider", &self.model.provider())
            .field("guards", &self.guards.len())
            .field("tools", &self.tools.len())
            .finish_non_exhaustive()
    }
}

impl AgentExecutor {
    /// Expose this executor as a worker-agent tool: the model of a
    /// parent agent can delegate a `task` string, and the worker's final
    /// content becomes the tool response.
    #[must_use]
    pub fn as_worker_tool(
        self: &Arc<Self>,
        name: impl Into<String>,
        description: impl Into<String>,
    ) -> WorkerAgentTool {
        let this = Arc::clone(self);
        let run: Arc<dyn Fn(String) -> WorkerRunFuture + Send + Sync> = Arc::new(move |task| {
            let this = Arc::clone(&this);
            Box::pin(async move {
                let result = this.execute(AgentCommand::builder(task).build()).await;
                if result.success {
                    Ok(result.content.unwrap_or_default())
                } else {
                    Err(AgentError::tool(
                        "worker_agent",
                        result
                            .error_message
                            .unwrap_or_else(|| "worker failed".to_owned()),
                    ))
                }
            }) as WorkerRunFuture
        });
        WorkerAgentTool::new(name, description, run)
    }
}
