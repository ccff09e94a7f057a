//! Named circuit breakers guarding outbound endpoints.
//!
//! One breaker per logical endpoint. State, failure counts, and timing
//! live in atomics; callers never take a lock on the hot path. A breaker
//! observes one *protected call* at a time — the retry loop runs inside
//! the protected call, so however many attempts retry burns, the breaker
//! counts a single success or failure.
//!
//! Transitions:
//! - `Closed → Open` at `failure_threshold` consecutive failures,
//! - `Open → HalfOpen` lazily once `reset_timeout` has elapsed,
//! - `HalfOpen → Closed` on a successful trial call,
//! - `HalfOpen → Open` on any trial failure.
//!
//! At most `half_open_max_calls` trials run concurrently; excess callers
//! are rejected as if the breaker were open. Cancellation is never
//! counted. Every transition fires the registered transition callback.

use std::collections::HashMap;
use std::sync::atomic::{AtomicU8, AtomicU32, AtomicU64, Ordering};
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};

use tracing::{debug, info};

use crate::error::{AgentError, Result};

/// Breaker state.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, serde::Serialize, serde::Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum BreakerState {
    /// Calls flow freely.
    Closed,
    /// Calls are rejected without reaching the endpoint.
    Open,
    /// A bounded number of trial calls probe the endpoint.
    HalfOpen,
}

impl BreakerState {
    const fn from_u8(value: u8) -> Self {
        match value {
            0 => Self::Closed,
            1 => Self::Open,
            _ => Self::HalfOpen,
        }
    }

    const fn as_u8(self) -> u8 {
        match self {
            Self::Closed => 0,
            Self::Open => 1,
            Self::HalfOpen => 2,
        }
    }

    /// The wire representation of this state.
    #[must_use]
    pub const fn as_str(&self) -> &'static str {
        match self {
            Self::Closed => "closed",
            Self::Open => "open",
            Self::HalfOpen => "half_open",
        }
    }
}

impl std::fmt::Display for BreakerState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Observer invoked on every state transition.
pub type TransitionListener = Arc<dyn Fn(&str, BreakerState, BreakerState) + Send + Sync>;

/// Static breaker configuration.
#[derive(Debug, Clone)]
pub struct CircuitBreakerConfig {
    /// Consecutive failures that open the breaker.
    pub failure_threshold: u32,
    /// How long the breaker stays open before probing.
    pub reset_timeout: Duration,
    /// Concurrent trial calls allowed while half-open.
    pub half_open_max_calls: u32,
    /// Whether rate-limit failures count toward the threshold.
    pub count_rate_limits: bool,
}

impl Default for CircuitBreakerConfig {
    fn default() -> Self {
        Self {
            failure_threshold: 5,
            reset_timeout: Duration::from_secs(30),
            half_open_max_calls: 1,
            count_rate_limits: true,
        }
    }
}

/// A named circuit breaker.
pub struct CircuitBreaker {
    name: String,
    config: CircuitBreakerConfig,
    state: AtomicU8,
    consecutive_failures: AtomicU32,
    /// Milliseconds since `anchor` at which the breaker last opened.
    opened_at_ms: AtomicU64,
    trials_in_flight: AtomicU32,
    anchor: Instant,
    listener: Option<TransitionListener>,
}

/// Permission to run one protected call; returned by
/// [`CircuitBreaker::try_acquire`].
///
/// Dropping the permit without recording an outcome releases any
/// half-open trial slot but changes no state — a cancelled call is
/// neither success nor failure.
#[derive(Debug)]
pub struct BreakerPermit<'a> {
    breaker: &'a CircuitBreaker,
    trial: bool,
    settled: bool,
}

impl BreakerPermit<'_> {
    fn settle(&mut self) {
        if self.trial && !self.settled {
            self.breaker.trials_in_flight.fetch_sub(1, Ordering::AcqRel);
        }
        self.settled = true;
    }
}

impl Drop for BreakerPermit<'_> {
    fn drop(&mut self) {
        // Unwound without an outcome: free the trial slot, touch nothing
        // else.
        self.settle();
    }
}

impl CircuitBreaker {
    /// Create a breaker.
    #[must_use]
    pub fn new(name: impl Into<String>, config: CircuitBreakerConfig) -> Self {
        Self {
            name: name.into(),
            config,
            state: AtomicU8::new(BreakerState::Closed.as_u8()),
            consecutive_failures: AtomicU32::new(0),
            opened_at_ms: AtomicU64::new(0),
            trials_in_flight: AtomicU32::new(0),
            anchor: Instant::now(),
            listener: None,
        }
    }

    /// Attach a transition listener.
    #[must_use]
    pub fn with_listener(mut self, listener: TransitionListener) -> Self {
        self.listener = Some(listener);
        self
    }

    /// Breaker name.
    #[must_use]
    pub fn name(&self) -> &str {
        &self.name
    }

    /// Current state (transitioning `Open → HalfOpen` lazily).
    #[must_use]
    pub fn state(&self) -> BreakerState {
        self.maybe_probe();
        BreakerState::from_u8(self.state.load(Ordering::Acquire))
    }

    fn now_ms(&self) -> u64 {
        u64::try_from(self.anchor.elapsed().as_millis()).unwrap_or(u64::MAX)
    }

    fn transition(&self, from: BreakerState, to: BreakerState) -> bool {
        let swapped = self
            .state
            .compare_exchange(from.as_u8(), to.as_u8(), Ordering::AcqRel, Ordering::Acquire)
            .is_ok();
        if swapped {
            info!(breaker = %self.name, from = %from, to = %to, "Circuit breaker transition");
            if let Some(listener) = &self.listener {
                listener(&self.name, from, to);
            }
        }
        swapped
    }

    /// Move `Open → HalfOpen` when the reset timeout has elapsed.
    fn maybe_probe(&self) {
        if BreakerState::from_u8(self.state.load(Ordering::Acquire)) != BreakerState::Open {
            return;
        }
        let opened_at = self.opened_at_ms.load(Ordering::Acquire);
        let elapsed = self.now_ms().saturating_sub(opened_at);
        if elapsed >= u64::try_from(self.config.reset_timeout.as_millis()).unwrap_or(u64::MAX) {
            self.transition(BreakerState::Open, BreakerState::HalfOpen);
        }
    }

    /// Acquire permission for one protected call.
    pub fn try_acquire(&self) -> Result<BreakerPermit<'_>> {
        self.maybe_probe();
        match BreakerState::from_u8(self.state.load(Ordering::Acquire)) {
            BreakerState::Closed => Ok(BreakerPermit {
                breaker: self,
                trial: false,
                settled: false,
            }),
            BreakerState::Open => Err(AgentError::CircuitBreakerOpen {
                name: self.name.clone(),
            }),
            BreakerState::HalfOpen => {
                // Claim a trial slot without overshooting the cap.
                loop {
                    let current = self.trials_in_flight.load(Ordering::Acquire);
                    if current >= self.config.half_open_max_calls {
                        return Err(AgentError::CircuitBreakerOpen {
                            name: self.name.clone(),
                        });
                    }
                    if self
                        .trials_in_flight
                        .compare_exchange(current, current + 1, Ordering::AcqRel, Ordering::Acquire)
                        .is_ok()
                    {
                        return Ok(BreakerPermit {
                            breaker: self,
                            trial: true,
                            settled: false,
                        });
                    }
                }
            }
        }
    }

    /// Record a successful protected call.
    pub fn on_success(&self, mut permit: BreakerPermit<'_>) {
        let trial = permit.trial;
        permit.settle();
        self.consecutive_failures.store(0, Ordering::Release);
        if trial {
            self.transition(BreakerState::HalfOpen, BreakerState::Closed);
        }
    }

    /// Record a failed protected call.
    ///
    /// Cancellation never counts; rate limits count only when configured.
    pub fn on_failure(&self, mut permit: BreakerPermit<'_>, error: &AgentError) {
        let trial = permit.trial;
        permit.settle();

        if !self.counts(error) {
            debug!(breaker = %self.name, error = %error, "Failure not counted");
            return;
        }

        if trial {
            self.opened_at_ms.store(self.now_ms(), Ordering::Release);
            self.transition(BreakerState::HalfOpen, BreakerState::Open);
            return;
        }

        let failures = self.consecutive_failures.fetch_add(1, Ordering::AcqRel) + 1;
        if failures >= self.config.failure_threshold {
            self.opened_at_ms.store(self.now_ms(), Ordering::Release);
            if self.transition(BreakerState::Closed, BreakerState::Open) {
                self.consecutive_failures.store(0, Ordering::Release);
            }
        }
    }

    /// Release a permit whose call was cancelled; no state changes.
    pub fn on_cancelled(&self, mut permit: BreakerPermit<'_>) {
        permit.settle();
    }

    fn counts(&self, error: &AgentError) -> bool {
        if error.is_cancellation() {
            return false;
        }
        if matches!(
            error,
            AgentError::Llm {
                kind: crate::error::LlmErrorKind::RateLimited,
                ..
            }
        ) {
            return self.config.count_rate_limits;
        }
        true
    }

    /// Run one protected call through the breaker.
    ///
    /// The operation should embed its own retry loop: the breaker records
    /// exactly one observation for the whole call.
    pub async fn execute<T, F, Fut>(&self, op: F) -> Result<T>
    where
        F: FnOnce() -> Fut,
        Fut: std::future::Future<Output = Result<T>>,
    {
        let permit = self.try_acquire()?;
        match op().await {
            Ok(value) => {
                self.on_success(permit);
                Ok(value)
            }
            Err(err) if err.is_cancellation() => {
                self.on_cancelled(permit);
                Err(err)
            }
            Err(err) => {
                self.on_failure(permit, &err);
                Err(err)
            }
        }
    }
}

impl std::fmt::Debug for CircuitBreaker {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("CircuitBreaker")
            .field("name", &self.name)
            .field("state", &BreakerState::from_u8(self.state.load(Ordering::Acquire)))
            .finish_non_exhaustive()
    }
}

/// Registry of named breakers sharing one configuration and listener.
pub struct CircuitBreakerRegistry {
    config: CircuitBreakerConfig,
    listener: Option<TransitionListener>,
    breakers: Mutex<HashMap<String, Arc<CircuitBreaker>>>,
}

impl CircuitBreakerRegistry {
    /// Create a registry.
    #[must_use]
    pub fn new(config: CircuitBreakerConfig) -> Self {
        Self {
            config,
            listener: None,
            breakers: Mutex::new(HashMap::new()),
        }
    }

    /// Attach a transition listener applied to every breaker created
    /// after this call.
    #[must_use]
    pub fn with_listener(mut self, listener: TransitionListener) -> Self {
        self.listener = Some(listener);
        self
    }

    /// Get or create the breaker for an endpoint.
    #[must_use]
    pub fn breaker(&self, name: &str) -> Arc<CircuitBreaker> {
        let mut breakers = self.breakers.lock().unwrap_or_else(|e| e.into_inner());
        Arc::clone(breakers.entry(name.to_owned()).or_insert_with(|| {
            let mut breaker = CircuitBreaker::new(name, self.config.clone());
            if let Some(listener) = &self.listener {
                breaker = breaker.with_listener(Arc::clone(listener));
            }
            Arc::new(breaker)
        }))
    }
}

impl std::fmt::Debug for CircuitBreakerRegistry {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("CircuitBreakerRegistry")
            .field("config", &self.config)
            .finish_non_exhaustive()
    }
}
