//! Background metric writer.
//!
//! One scheduled worker owns the ring buffer's [`Drainer`]. On every tick
//! it drains up to a batch, enriches token-usage events with estimated
//! cost, refreshes the health snapshot, and hands the batch to the
//! [`MetricEventStore`]. Store failures are counted and logged — metric
//! loss never fails a request. Shutdown performs a final drain so a clean
//! stop loses nothing.

use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::{Duration, Instant};

use async_trait::async_trait;
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tracing::{debug, warn};

use super::ring::{Drainer, MetricRingBuffer};
use super::MetricEvent;
use crate::error::{AgentError, Result};
use crate::pricing::CostCalculator;

/// Batch persistence boundary for metric events.
#[async_trait]
pub trait MetricEventStore: Send + Sync {
    /// Persist a batch; order within the batch is publish order.
    async fn insert_batch(&self, events: Vec<MetricEvent>) -> Result<()>;
}

/// Writer configuration.
#[derive(Debug, Clone)]
pub struct MetricWriterConfig {
    /// Maximum events drained per tick.
    pub batch_size: usize,
    /// Tick interval.
    pub flush_interval: Duration,
    /// Worker count. The ring buffer has exactly one consumer, so any
    /// value other than 1 is refused at construction.
    pub writer_threads: usize,
}

impl Default for MetricWriterConfig {
    fn default() -> Self {
        Self {
            batch_size: 256,
            flush_interval: Duration::from_millis(500),
            writer_threads: 1,
        }
    }
}

#[derive(Debug, Default)]
struct HealthInner {
    buffer_usage_pct: AtomicU64,
    last_flush_micros: AtomicU64,
    last_batch_len: AtomicU64,
    flush_errors: AtomicU64,
    flushed_total: AtomicU64,
}

/// Live health snapshot of the metric path.
#[derive(Debug, Clone)]
pub struct WriterHealth {
    inner: Arc<HealthInner>,
}

impl WriterHealth {
    fn new() -> Self {
        Self {
            inner: Arc::new(HealthInner::default()),
        }
    }

    /// Buffer occupancy at the last tick, percent.
    #[must_use]
    pub fn buffer_usage_pct(&self) -> f64 {
        self.inner.buffer_usage_pct.load(Ordering::Acquire) as f64 / 100.0
    }

    /// Duration of the last persist, microseconds.
    #[must_use]
    pub fn last_flush_micros(&self) -> u64 {
        self.inner.last_flush_micros.load(Ordering::Acquire)
    }

    /// Size of the last non-empty batch.
    #[must_use]
    pub fn last_batch_len(&self) -> u64 {
        self.inner.last_batch_len.load(Ordering::Acquire)
    }

    /// Count of failed persist calls since start.
    #[must_use]
    pub fn flush_errors(&self) -> u64 {
        self.inner.flush_errors.load(Ordering::Acquire)
    }

    /// Events persisted since start.
    #[must_use]
    pub fn flushed_total(&self) -> u64 {
        self.inner.flushed_total.load(Ordering::Acquire)
    }
}

/// The background drainer task.
pub struct MetricWriter {
    handle: JoinHandle<()>,
    shutdown: watch::Sender<bool>,
    health: WriterHealth,
}

impl MetricWriter {
    /// Spawn the writer on the current tokio runtime.
    ///
    /// Fails when `writer_threads != 1`: the buffer's single-consumer
    /// contract admits exactly one drainer, and this runtime does not
    /// shard buffers.
    pub fn spawn(
        drainer: Drainer,
        store: Arc<dyn MetricEventStore>,
        cost: Arc<CostCalculator>,
        config: MetricWriterConfig,
    ) -> Result<Self> {
        if config.writer_threads != 1 {
            return Err(AgentError::configuration(format!(
                "writer_threads must be 1 (got {}): the metric ring buffer is single-consumer",
                config.writer_threads
            )));
        }

        let health = WriterHealth::new();
        let (shutdown, shutdown_rx) = watch::channel(false);
        let worker = Worker {
            drainer,
            store,
            cost,
            batch_size: config.batch_size.max(1),
            health: health.clone(),
        };
        let handle = tokio::spawn(worker.run(config.flush_interval, shutdown_rx));

        Ok(Self {
            handle,
            shutdown,
            health,
        })
    }

    /// Health snapshot handle.
    #[must_use]
    pub fn health(&self) -> WriterHealth {
        self.health.clone()
    }

    /// Stop the writer, performing a final drain and flush.
    pub async fn shutdown(self) {
        let _ = self.shutdown.send(true);
        let _ = self.handle.await;
    }
}

impl std::fmt::Debug for MetricWriter {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("MetricWriter").finish_non_exhaustive()
    }
}

struct Worker {
    drainer: Drainer,
    store: Arc<dyn MetricEventStore>,
    cost: Arc<CostCalculator>,
    batch_size: usize,
    health: WriterHealth,
}

impl Worker {
    async fn run(mut self, flush_interval: Duration, mut shutdown: watch::Receiver<bool>) {
        let mut ticker = tokio::time::interval(flush_interval);
        ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);

        loop {
            tokio::select! {
                _ = ticker.tick() => {
                    self.flush_once().await;
                }
                changed = shutdown.changed() => {
                    let stopping = changed.is_err() || *shutdown.borrow();
                    if stopping {
                        // Final drain: loop until the buffer is empty.
                        while self.flush_once().await > 0 {}
                        debug!("Metric writer stopped");
                        return;
                    }
                }
            }
        }
    }

    async fn flush_once(&mut self) -> usize {
        let buffer: &Arc<MetricRingBuffer> = self.drainer.buffer();
        self.health.inner.buffer_usage_pct.store(
            (buffer.usage() * 10_000.0) as u64,
            Ordering::Release,
        );

        let mut batch = self.drainer.drain(self.batch_size);
        if batch.is_empty() {
            return 0;
        }
        let len = batch.len();

        for event in &mut batch {
            self.enrich(event).await;
        }

        let started = Instant::now();
        match self.store.insert_batch(batch).await {
            Ok(()) => {
                self.health
                    .inner
                    .flushed_total
                    .fetch_add(len as u64, Ordering::AcqRel);
            }
            Err(err) => {
                self.health.inner.flush_errors.fetch_add(1, Ordering::AcqRel);
                warn!(error = %err, batch = len, "Metric batch persist failed");
            }
        }
        self.health.inner.last_flush_micros.store(
            u64::try_from(started.elapsed().as_micros()).unwrap_or(u64::MAX),
            Ordering::Release,
        );
        self.health
            .inner
            .last_batch_len
            .store(len as u64, Ordering::Release);
        len
    }

    /// Fill in estimated cost on token-usage events, off the hot path.
    async fn enrich(&self, event: &mut MetricEvent) {
        if let MetricEvent::TokenUsage {
            provider,
            model,
            at,
            usage,
            estimated_cost_usd,
            ..
        } = event
            && estimated_cost_usd.is_none()
        {
            *estimated_cost_usd = Some(
                self.cost
                    .calculate(
                        provider,
                        model,
                        *at,
                        usage.prompt_tokens,
                        usage.cached_tokens,
                        usage.completion_tokens,
                        usage.reasoning_tokens,
                    )
                    .await,
            );
        }
    }
}
