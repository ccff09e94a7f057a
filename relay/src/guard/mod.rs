//! Guard pipelines — policy checkpoints around the model work.
//!
//! A [`GuardPipeline`] runs its stages in ascending order and admits or
//! rejects a command before the executor spends a single model token. The
//! first rejection short-circuits; later stages never run. The decision is
//! deterministic: the same command against the same stage configuration
//! always produces the same outcome.
//!
//! An [`OutputGuardPipeline`] is the same discipline applied to the final
//! content after generation: a rejection there fails the request with
//! `OUTPUT_GUARD_REJECTED` instead of delivering the response.
//!
//! Stage failures (as opposed to rejections) are fail-open by default:
//! they are logged and treated as allowed. A stage that declares
//! [`fail_on_error`](GuardStage::fail_on_error) turns its own failure into
//! a rejection instead.

use std::sync::Arc;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use tracing::warn;

use crate::command::AgentCommand;
use crate::error::Result;

pub mod stages;

pub use stages::{
    ClassificationStage, InjectionDetectionStage, InputValidationStage, PermissionStage,
    RateLimitStage,
};

/// Why a guard stage rejected a request.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
#[non_exhaustive]
pub enum GuardRejectCategory {
    /// Per-subject quota exceeded.
    RateLimit,
    /// Input failed structural validation.
    Validation,
    /// Prompt-injection heuristics fired.
    Injection,
    /// The request classifier mapped the prompt to a denied category.
    Classification,
    /// The caller lacks a required permission.
    Permission,
    /// Anything else, including failed stages in fail-closed mode.
    Other,
}

impl GuardRejectCategory {
    /// The wire representation of this category.
    #[must_use]
    pub const fn as_str(&self) -> &'static str {
        match self {
            Self::RateLimit => "rate_limit",
            Self::Validation => "validation",
            Self::Injection => "injection",
            Self::Classification => "classification",
            Self::Permission => "permission",
            Self::Other => "other",
        }
    }
}

impl std::fmt::Display for GuardRejectCategory {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Outcome of a guard check.
#[derive(Debug, Clone)]
pub enum GuardResult {
    /// The request may proceed.
    Allowed,
    /// The request is rejected; no further stages run.
    Rejected {
        /// Name of the rejecting stage.
        stage: String,
        /// Rejection category.
        category: GuardRejectCategory,
        /// Human-readable reason.
        message: String,
    },
}

impl GuardResult {
    /// Shorthand for a rejection.
    #[must_use]
    pub fn rejected(
        stage: impl Into<String>,
        category: GuardRejectCategory,
        message: impl Into<String>,
    ) -> Self {
        Self::Rejected {
            stage: stage.into(),
            category,
            message: message.into(),
        }
    }

    /// Returns `true` when the request may proceed.
    #[must_use]
    pub const fn is_allowed(&self) -> bool {
        matches!(self, Self::Allowed)
    }
}

/// A policy checkpoint executed before LLM work.
#[async_trait]
pub trait GuardStage: Send + Sync {
    /// Stage name, surfaced on rejections.
    fn name(&self) -> &str;

    /// Execution order; stages run ascending.
    fn order(&self) -> i32;

    /// Whether a stage failure rejects the request instead of being
    /// logged and skipped.
    fn fail_on_error(&self) -> bool {
        false
    }

    /// Check the command.
    async fn check(&self, command: &AgentCommand) -> Result<GuardResult>;
}

/// Ordered guard stages with first-rejection-wins semantics.
pub struct GuardPipeline {
    stages: Vec<Arc<dyn GuardStage>>,
}

impl GuardPipeline {
    /// Create a pipeline; stages are sorted by ascending order once.
    #[must_use]
    pub fn new(mut stages: Vec<Arc<dyn GuardStage>>) -> Self {
        stages.sort_by_key(|s| s.order());
        Self { stages }
    }

    /// An empty pipeline that admits everything.
    #[must_use]
    pub fn empty() -> Self {
        Self { stages: Vec::new() }
    }

    /// Number of configured stages.
    #[must_use]
    pub fn len(&self) -> usize {
        self.stages.len()
    }

    /// Returns `true` when no stages are configured.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.stages.is_empty()
    }

    /// Run all stages against the command.
    pub async fn check(&self, command: &AgentCommand) -> GuardResult {
        for stage in &self.stages {
            match stage.check(command).await {
                Ok(GuardResult::Allowed) => {}
                Ok(rejected @ GuardResult::Rejected { .. }) => return rejected,
                Err(err) if stage.fail_on_error() => {
                    return GuardResult::rejected(
                        stage.name(),
                        GuardRejectCategory::Other,
                        format!("guard stage failed: {err}"),
                    );
                }
                Err(err) => {
                    warn!(stage = stage.name(), error = %err, "Guard stage failed; treating as allowed");
                }
            }
        }
        GuardResult::Allowed
    }
}

impl std::fmt::Debug for GuardPipeline {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("GuardPipeline")
            .field("stages", &self.stages.iter().map(|s| s.name().to_owned()).collect::<Vec<_>>())
            .finish()
    }
}

/// A policy checkpoint executed on the final content after generation.
///
/// Output stages see the command for context (tenant, mode, prompt) and
/// the content the run is about to deliver.
#[async_trait]
pub trait OutputGuardStage: Send + Sync {
    /// Stage name, surfaced on rejections.
    fn name(&self) -> &str;

    /// Execution order; stages run ascending.
    fn order(&self) -> i32;

    /// Whether a stage failure rejects the response instead of being
    /// logged and skipped.
    fn fail_on_error(&self) -> bool {
        false
    }

    /// Check the final content.
    async fn check(&self, command: &AgentCommand, content: &str) -> Result<GuardResult>;
}

/// Ordered output stages with first-rejection-wins semantics.
pub struct OutputGuardPipeline {
    stages: Vec<Arc<dyn OutputGuardStage>>,
}

impl OutputGuardPipeline {
    /// Create a pipeline; stages are sorted by ascending order once.
    #[must_use]
    pub fn new(mut stages: Vec<Arc<dyn OutputGuardStage>>) -> Self {
        stages.sort_by_key(|s| s.order());
        Self { stages }
    }

    /// An empty pipeline that passes everything.
    #[must_use]
    pub fn empty() -> Self {
        Self { stages: Vec::new() }
    }

    /// Number of configured stages.
    #[must_use]
    pub fn len(&self) -> usize {
        self.stages.len()
    }

    /// Returns `true` when no stages are configured.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.stages.is_empty()
    }

    /// Run all stages against the final content.
    pub async fn check(&self, command: &AgentCommand, content: &str) -> GuardResult {
        for stage in &self.stages {
            match stage.check(command, content).await {
                Ok(GuardResult::Allowed) => {}
                Ok(rejected @ GuardResult::Rejected { .. }) => return rejected,
                Err(err) if stage.fail_on_error() => {
                    return GuardResult::rejected(
                        stage.name(),
                        GuardRejectCategory::Other,
                        format!("output guard stage failed: {err}"),
                    );
                }
                Err(err) => {
                    warn!(stage = stage.name(), error = %err, "Output guard stage failed; treating as allowed");
                }
            }
        }
        GuardResult::Allowed
    }
}

impl std::fmt::Debug for OutputGuardPipeline {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("OutputGuardPipeline")
            .field("stages", &self.stages.iter().map(|s| s.name().to_owned()).collect::<Vec<_>>())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::AgentError;
    use std::sync::atomic::{AtomicUsize, Ordering};

    struct RecordingStage {
        name: &'static str,
        order: i32,
        fail_on_error: bool,
        outcome: Result<GuardResult>,
        calls: Arc<AtomicUsize>,
    }

    impl RecordingStage {
        fn allowed(name: &'static str, order: i32, calls: &Arc<AtomicUsize>) -> Arc<Self> {
            Arc::new(Self {
                name,
                order,
                fail_on_error: false,
                outcome: Ok(GuardResult::Allowed),
                calls: Arc::clone(calls),
            })
        }
    }

    #[async_trait]
    impl GuardStage for RecordingStage {
        fn name(&self) -> &str {
            self.name
        }

        fn order(&self) -> i32 {
            self.order
        }

        fn fail_on_error(&self) -> bool {
            self.fail_on_error
        }

        async fn check(&self, _command: &AgentCommand) -> Result<GuardResult> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            match &self.outcome {
                Ok(result) => Ok(result.clone()),
                Err(_) => Err(AgentError::internal("stage exploded")),
            }
        }
    }

    fn command() -> AgentCommand {
        AgentCommand::builder("hello").build()
    }

    #[tokio::test]
    async fn test_first_rejection_short_circuits() {
        let calls = Arc::new(AtomicUsize::new(0));
        let rejecting = Arc::new(RecordingStage {
            name: "deny",
            order: 10,
            fail_on_error: false,
            outcome: Ok(GuardResult::rejected(
                "deny",
                GuardRejectCategory::Validation,
                "nope",
            )),
            calls: Arc::clone(&calls),
        });
        let later = RecordingStage::allowed("later", 20, &calls);

        let pipeline = GuardPipeline::new(vec![rejecting, later]);
        let result = pipeline.check(&command()).await;

        assert!(!result.is_allowed());
        // Only the rejecting stage ran.
        assert_eq!(calls.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn test_stages_run_in_ascending_order() {
        let calls = Arc::new(AtomicUsize::new(0));
        // Registered out of order on purpose.
        let second = RecordingStage::allowed("second", 20, &calls);
        let first = RecordingStage::allowed("first", 10, &calls);

        let pipeline = GuardPipeline::new(vec![second, first]);
        assert_eq!(pipeline.stages[0].name(), "first");
        assert_eq!(pipeline.stages[1].name(), "second");

        assert!(pipeline.check(&command()).await.is_allowed());
        assert_eq!(calls.load(Ordering::SeqCst), 2);
    }

    #[tokio::test]
    async fn test_failing_stage_is_fail_open_by_default() {
        let calls = Arc::new(AtomicUsize::new(0));
        let failing = Arc::new(RecordingStage {
            name: "flaky",
            order: 10,
            fail_on_error: false,
            outcome: Err(AgentError::internal("boom")),
            calls: Arc::clone(&calls),
        });

        let pipeline = GuardPipeline::new(vec![failing]);
        assert!(pipeline.check(&command()).await.is_allowed());
    }

    #[tokio::test]
    async fn test_failing_stage_fail_closed_when_declared() {
        let calls = Arc::new(AtomicUsize::new(0));
        let failing = Arc::new(RecordingStage {
            name: "strict",
            order: 10,
            fail_on_error: true,
            outcome: Err(AgentError::internal("boom")),
            calls: Arc::clone(&calls),
        });

        let pipeline = GuardPipeline::new(vec![failing]);
        match pipeline.check(&command()).await {
            GuardResult::Rejected { stage, category, .. } => {
                assert_eq!(stage, "strict");
                assert_eq!(category, GuardRejectCategory::Other);
            }
            GuardResult::Allowed => panic!("expected rejection"),
        }
    }

    struct DeniedWordStage {
        word: &'static str,
        order: i32,
        calls: Arc<AtomicUsize>,
    }

    #[async_trait]
    impl OutputGuardStage for DeniedWordStage {
        fn name(&self) -> &str {
            "deniedWord"
        }

        fn order(&self) -> i32 {
            self.order
        }

        async fn check(&self, _command: &AgentCommand, content: &str) -> Result<GuardResult> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            if content.contains(self.word) {
                Ok(GuardResult::rejected(
                    "deniedWord",
                    GuardRejectCategory::Validation,
                    format!("response contains '{}'", self.word),
                ))
            } else {
                Ok(GuardResult::Allowed)
            }
        }
    }

    #[tokio::test]
    async fn test_output_pipeline_first_rejection_short_circuits() {
        let calls = Arc::new(AtomicUsize::new(0));
        let first = Arc::new(DeniedWordStage {
            word: "classified",
            order: 10,
            calls: Arc::clone(&calls),
        });
        let second = Arc::new(DeniedWordStage {
            word: "never-matched",
            order: 20,
            calls: Arc::clone(&calls),
        });
        let pipeline = OutputGuardPipeline::new(vec![first, second]);

        assert!(pipeline.check(&command(), "benign answer").await.is_allowed());
        assert_eq!(calls.load(Ordering::SeqCst), 2);

        match pipeline.check(&command(), "this is classified").await {
            GuardResult::Rejected { stage, category, .. } => {
                assert_eq!(stage, "deniedWord");
                assert_eq!(category, GuardRejectCategory::Validation);
            }
            GuardResult::Allowed => panic!("expected rejection"),
        }
        // The second stage never ran for the rejected content.
        assert_eq!(calls.load(Ordering::SeqCst), 3);
    }
}
