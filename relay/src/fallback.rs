//! Alternate-model recovery after primary LLM failure.
//!
//! When the primary call has exhausted retries, each fallback model is
//! tried once, in order, with a plain toolless completion of the same
//! messages. The first success replaces the failure; if every fallback
//! fails, the original error is preserved.

use std::sync::Arc;

use tracing::{info, warn};

use crate::error::AgentError;
use crate::provider::{CompletionRequest, CompletionResponse, LanguageModel};

/// Ordered list of alternate models.
#[derive(Debug, Clone, Default)]
pub struct FallbackStrategy {
    models: Vec<String>,
}

impl FallbackStrategy {
    /// Create a strategy over the given model identifiers.
    #[must_use]
    pub fn new(models: Vec<String>) -> Self {
        Self { models }
    }

    /// Returns `true` when no fallback models are configured.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.models.is_empty()
    }

    /// Whether recovery should even be attempted for this error.
    ///
    /// Admission failures are final and cancellation must propagate
    /// unchanged.
    #[must_use]
    pub const fn is_eligible(error: &AgentError) -> bool {
        matches!(
            error,
            AgentError::Llm { .. } | AgentError::CircuitBreakerOpen { .. }
        ) && !error.is_cancellation()
    }

    /// Try each fallback model once against the request.
    ///
    /// Tools and structured formats are stripped: a fallback produces a
    /// plain completion. Returns `None` when every fallback fails (the
    /// caller keeps the original error).
    pub async fn recover(
        &self,
        model: &Arc<dyn LanguageModel>,
        request: &CompletionRequest,
    ) -> Option<CompletionResponse> {
        for candidate in &self.models {
            let mut attempt = request.clone();
            attempt.options.model = Some(candidate.clone());
            attempt.options.tools.clear();
            attempt.options.response_format = crate::provider::ResponseFormat::Text;

            match model.complete(&attempt).await {
                Ok(response) => {
                    info!(model = %candidate, "Fallback model recovered the request");
                    return Some(response);
                }
                Err(err) if err.is_cancellation() => return None,
                Err(err) => {
                    warn!(model = %candidate, error = %err, "Fallback model failed");
                }
            }
        }
        None
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::{LlmErrorKind, Result};
    use async_trait::async_trait;
    use std::sync::Mutex;

    struct FlakyModel {
        // Model names that succeed.
        good: Vec<String>,
        calls: Mutex<Vec<Option<String>>>,
    }

    #[async_trait]
    impl LanguageModel for FlakyModel {
        fn provider(&self) -> &str {
            "mock"
        }

        fn default_model(&self) -> &str {
            "primary"
        }

        async fn complete(&self, request: &CompletionRequest) -> Result<CompletionResponse> {
            let model = request.options.model.clone();
            self.calls.lock().unwrap().push(model.clone());
            let name = model.unwrap_or_else(|| "primary".to_owned());
            if self.good.contains(&name) {
                Ok(CompletionResponse {
                    text: Some(format!("answer from {name}")),
                    model: name,
                    ..Default::default()
                })
            } else {
                Err(AgentError::llm(LlmErrorKind::Server, "boom"))
            }
        }
    }

    #[tokio::test]
    async fn test_first_success_wins() {
        let strategy =
            FallbackStrategy::new(vec!["alt-a".to_owned(), "alt-b".to_owned()]);
        let model: Arc<dyn LanguageModel> = Arc::new(FlakyModel {
            good: vec!["alt-a".to_owned(), "alt-b".to_owned()],
            calls: Mutex::new(Vec::new()),
        });

        let response = strategy
            .recover(&model, &CompletionRequest::default())
            .await
            .unwrap();
        assert_eq!(response.text.as_deref(), Some("answer from alt-a"));
    }

    #[tokio::test]
    async fn test_all_failures_yield_none() {
        let strategy = FallbackStrategy::new(vec!["alt-a".to_owned()]);
        let model: Arc<dyn LanguageModel> = Arc::new(FlakyModel {
            good: Vec::new(),
            calls: Mutex::new(Vec::new()),
        });

        assert!(strategy
            .recover(&model, &CompletionRequest::default())
            .await
            .is_none());
    }

    #[tokio::test]
    async fn test_fallback_strips_tools() {
        let strategy = FallbackStrategy::new(vec!["alt-a".to_owned()]);
        let flaky = Arc::new(FlakyModel {
            good: vec!["alt-a".to_owned()],
            calls: Mutex::new(Vec::new()),
        });
        let model: Arc<dyn LanguageModel> = Arc::<FlakyModel>::clone(&flaky);

        let mut request = CompletionRequest::default();
        request.options.tools.push(crate::provider::ToolDefinition::new(
            "search",
            "Search",
            serde_json::json!({"type": "object"}),
        ));

        strategy.recover(&model, &request).await.unwrap();
        // Our mock records the model override, proving the cloned request
        // (with tools stripped) was used rather than the original.
        assert_eq!(
            *flaky.calls.lock().unwrap(),
            vec![Some("alt-a".to_owned())]
        );
    }

    #[test]
    fn test_eligibility() {
        assert!(FallbackStrategy::is_eligible(&AgentError::llm_timeout("t")));
        assert!(FallbackStrategy::is_eligible(&AgentError::CircuitBreakerOpen {
            name: "llm".to_owned()
        }));
        assert!(!FallbackStrategy::is_eligible(&AgentError::Cancelled));
        assert!(!FallbackStrategy::is_eligible(&AgentError::Overloaded));
    }
}
