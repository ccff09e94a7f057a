//! Model pricing lookup and cost estimation.
//!
//! Cost enrichment runs inside the metric writer, off the request hot
//! path. Pricing rows are looked up by `(provider, model, effective-at)`
//! and memoized for five minutes using a five-minute bucket of the event
//! timestamp, so a repriced model takes effect within one bucket.

use std::num::NonZeroUsize;
use std::sync::{Arc, Mutex};
use std::time::{SystemTime, UNIX_EPOCH};

use async_trait::async_trait;
use lru::LruCache;
use rust_decimal::{Decimal, RoundingStrategy};

/// Per-1000-token prices for one model, in USD.
#[derive(Debug, Clone, Copy, PartialEq, Eq, serde::Serialize, serde::Deserialize)]
pub struct ModelPricing {
    /// Price per 1k uncached prompt tokens.
    pub prompt_per_1k: Decimal,
    /// Price per 1k cached prompt tokens.
    pub cached_prompt_per_1k: Decimal,
    /// Price per 1k completion tokens.
    pub completion_per_1k: Decimal,
    /// Price per 1k reasoning tokens.
    pub reasoning_per_1k: Decimal,
}

/// Pricing persistence, time-versioned per `(provider, model)`.
#[async_trait]
pub trait ModelPricingStore: Send + Sync {
    /// Find the pricing row effective at `at`, or `None` when the model
    /// is unpriced.
    async fn find_effective(
        &self,
        provider: &str,
        model: &str,
        at: SystemTime,
    ) -> Option<ModelPricing>;
}

const PRICE_BUCKET_SECS: u64 = 300;

/// Estimates the USD cost of one LLM call.
pub struct CostCalculator {
    store: Arc<dyn ModelPricingStore>,
    // (provider, model, 5-minute bucket) → pricing lookup result.
    cache: Mutex<LruCache<(String, String, u64), Option<ModelPricing>>>,
}

impl CostCalculator {
    /// Create a calculator over a pricing store.
    #[must_use]
    pub fn new(store: Arc<dyn ModelPricingStore>) -> Self {
        Self {
            store,
            cache: Mutex::new(LruCache::new(
                NonZeroUsize::new(256).unwrap_or(NonZeroUsize::MIN),
            )),
        }
    }

    fn bucket(at: SystemTime) -> u64 {
        at.duration_since(UNIX_EPOCH)
            .map_or(0, |d| d.as_secs() / PRICE_BUCKET_SECS)
    }

    async fn pricing(&self, provider: &str, model: &str, at: SystemTime) -> Option<ModelPricing> {
        let key = (provider.to_owned(), model.to_owned(), Self::bucket(at));
        if let Some(cached) = self
            .cache
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .get(&key)
        {
            return *cached;
        }

        let looked_up = self.store.find_effective(provider, model, at).await;
        self.cache
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .put(key, looked_up);
        looked_up
    }

    /// Estimate the cost of one call.
    ///
    /// Missing pricing yields zero. The result is rounded half-up to
    /// eight decimal places.
    pub async fn calculate(
        &self,
        provider: &str,
        model: &str,
        at: SystemTime,
        prompt_tokens: u32,
        cached_tokens: u32,
        completion_tokens: u32,
        reasoning_tokens: u32,
    ) -> Decimal {
        let Some(pricing) = self.pricing(provider, model, at).await else {
            return Decimal::ZERO;
        };

        let uncached_prompt = prompt_tokens.saturating_sub(cached_tokens);
        let thousand = Decimal::from(1000);

        let cost = Decimal::from(uncached_prompt) * pricing.prompt_per_1k / thousand
            + Decimal::from(cached_tokens) * pricing.cached_prompt_per_1k / thousand
            + Decimal::from(completion_tokens) * pricing.completion_per_1k / thousand
            + Decimal::from(reasoning_tokens) * pricing.reasoning_per_1k / thousand;

        cost.round_dp_with_strategy(8, RoundingStrategy::MidpointAwayFromZero)
    }
}

impl std::fmt::Debug for CostCalculator {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("CostCalculator").finish_non_exhaustive()
    }
}
