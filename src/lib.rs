//! # scrape-digest
//!
//! A concurrent scrape-and-summarize pipeline engine. Scrape producers run
//! in parallel and deliver partial results out of order; finished scrapes
//! feed a bounded pool of AI-summarization workers; progress streams to
//! remote observers over long-lived per-batch channels with buffering and
//! replay for observers that connect late or disconnect mid-stream.
//!
//! ## Guarantees
//!
//! - **No premature "done"**: a batch confirms complete only when the
//!   registered count equals the immutable expected total, every item is
//!   terminal, and the completion rate reached 1.0.
//! - **At-most-once processing**: each non-cancelled item is handed to the
//!   summarizer at most once; partial payloads arriving before dispatch are
//!   merged into the copy the worker receives.
//! - **No lost terminal events**: progress events may be throttled, but
//!   status transitions and aggregate snapshots are always published.
//!
//! ## Quick start
//!
//! ```rust,no_run
//! use scrape_digest::{DigestPipeline, PipelineConfig, ItemSpec, ScrapePayload, Summarizer};
//! use std::sync::Arc;
//!
//! struct MySummarizer;
//!
//! #[async_trait::async_trait]
//! impl Summarizer for MySummarizer {
//!     async fn summarize(
//!         &self,
//!         _item_id: &str,
//!         payload: &ScrapePayload,
//!     ) -> scrape_digest::Result<String> {
//!         Ok(format!("{} words", payload.transcript.as_deref().unwrap_or("").len()))
//!     }
//! }
//!
//! #[tokio::main]
//! async fn main() -> scrape_digest::Result<()> {
//!     let pipeline = DigestPipeline::new(PipelineConfig::default(), Arc::new(MySummarizer));
//!     pipeline.start();
//!
//!     pipeline.register_expected("batch-1", &[ItemSpec::new("vid-1", "https://example.com/1")])?;
//!     let _sub = pipeline.subscribe("batch-1");
//!
//!     pipeline.on_partial_result("batch-1", "vid-1", ScrapePayload {
//!         transcript: Some("hello world".to_string()),
//!         ..Default::default()
//!     })?;
//!
//!     let outcome = pipeline
//!         .wait_for_drain("batch-1", std::time::Duration::from_secs(30))
//!         .await?;
//!     assert!(outcome.drained);
//!     Ok(())
//! }
//! ```

#![warn(clippy::all)]

pub mod config;
pub mod core;
pub mod utils;

// Re-export main types
pub use config::{GatewayConfig, MonitorConfig, PipelineConfig, PoolConfig, ThrottleConfig};
pub use crate::core::dispatch::{
    DrainOutcome, FinishedItem, PoolStats, ScrapePayload, SummaryPool, Summarizer,
};
pub use crate::core::gateway::{
    DeliveryGateway, Envelope, GatewayBridge, InputBroker, Subscription, kind,
};
pub use crate::core::monitor::{CapacityHook, CapacitySignal, StallEvent, StallHook, StallMonitor};
pub use crate::core::registry::{
    BatchAggregate, BatchRegistry, CompletionCheck, ItemSnapshot, ItemSpec, ItemStateRecord,
    ItemStatus,
};
pub use utils::error::{PipelineError, Result};

use std::sync::Arc;
use std::time::Duration;
use tracing::info;
use uuid::Uuid;

/// Current version of the crate
pub const VERSION: &str = env!("CARGO_PKG_VERSION");
/// Name of the crate
pub const NAME: &str = env!("CARGO_PKG_NAME");

/// The assembled pipeline: registry, dispatcher, monitor, and gateway
/// wired together, constructed once per process and passed by handle to
/// producers and consumers.
pub struct DigestPipeline {
    config: PipelineConfig,
    gateway: Arc<DeliveryGateway>,
    bridge: Arc<GatewayBridge>,
    registry: Arc<BatchRegistry>,
    pool: Arc<SummaryPool>,
    monitor: Arc<StallMonitor>,
    inputs: Arc<InputBroker>,
}

impl DigestPipeline {
    /// Assemble a pipeline around an external summarizer
    pub fn new(config: PipelineConfig, summarizer: Arc<dyn Summarizer>) -> Self {
        let gateway = Arc::new(DeliveryGateway::new(&config.gateway));
        let bridge = Arc::new(GatewayBridge::new(&config.gateway));
        bridge.attach(Arc::clone(&gateway));

        let registry = Arc::new(BatchRegistry::new(
            Arc::clone(&bridge),
            config.registry.clone(),
        ));
        let pool = Arc::new(SummaryPool::new(
            summarizer,
            Arc::clone(&registry),
            Arc::clone(&bridge),
            config.pool.reuse_existing,
        ));
        let monitor = Arc::new(StallMonitor::new(
            Arc::clone(&registry),
            Arc::clone(&pool),
            config.monitor.clone(),
        ));
        let inputs = Arc::new(InputBroker::new(Arc::clone(&bridge), &config.gateway));

        Self {
            config,
            gateway,
            bridge,
            registry,
            pool,
            monitor,
            inputs,
        }
    }

    /// Start workers, the stall monitor, and the bridge retry pump
    pub fn start(&self) {
        self.pool.start_pool(self.config.pool.workers);
        self.monitor.spawn();
        self.bridge.start_pump();
        info!(workers = self.config.pool.workers, "pipeline started");
    }

    /// Stop background tasks; queued work finishes before workers exit
    pub fn shutdown(&self) {
        self.monitor.shutdown();
        self.pool.shutdown();
        self.bridge.shutdown();
        info!("pipeline shut down");
    }

    // Inbound from scrape producers

    /// Register the expected item set for a batch (once, before producers emit)
    pub fn register_expected(&self, batch_id: &str, items: &[ItemSpec]) -> Result<()> {
        self.registry.register_expected(batch_id, items)
    }

    /// Record a progress update for an item
    #[allow(clippy::too_many_arguments)]
    pub fn record_progress(
        &self,
        batch_id: &str,
        item_id: &str,
        stage: &str,
        stage_progress: f64,
        overall_progress: f64,
        message: &str,
        metadata: Option<serde_json::Map<String, serde_json::Value>>,
    ) -> Result<()> {
        self.registry.record_progress(
            batch_id,
            item_id,
            stage,
            stage_progress,
            overall_progress,
            message,
            metadata,
        )
    }

    /// Record a status transition for an item
    pub fn record_status(
        &self,
        batch_id: &str,
        item_id: &str,
        status: ItemStatus,
        error: Option<String>,
        metadata: Option<serde_json::Map<String, serde_json::Value>>,
    ) -> Result<()> {
        self.registry
            .record_status(batch_id, item_id, status, error, metadata)
    }

    /// Accept a partial scrape result for an item
    pub fn on_partial_result(
        &self,
        batch_id: &str,
        item_id: &str,
        payload: ScrapePayload,
    ) -> Result<()> {
        self.pool.on_partial_result(batch_id, item_id, payload)
    }

    /// Cancel an item cooperatively
    pub fn cancel_item(&self, batch_id: &str, item_id: &str) -> Result<()> {
        self.pool.cancel_item(batch_id, item_id)
    }

    // Outbound to the consumer phase

    /// Aggregate view of a batch
    pub fn compute_aggregate(&self, batch_id: &str) -> Result<BatchAggregate> {
        self.registry.compute_aggregate(batch_id)
    }

    /// Strict completion gate; publishes a completion-confirmed event when
    /// the gate passes
    pub fn confirm_complete(&self, batch_id: &str) -> Result<CompletionCheck> {
        let check = self.registry.confirm_complete(batch_id)?;
        if check.confirmed {
            let aggregate = serde_json::to_value(&check.aggregate)?;
            let _ = self.bridge.publish(
                batch_id,
                Envelope::completion_confirmed(batch_id, aggregate),
            );
        }
        Ok(check)
    }

    /// Poll until the batch is drained or the timeout elapses
    pub async fn wait_for_drain(&self, batch_id: &str, timeout: Duration) -> Result<DrainOutcome> {
        self.pool.wait_for_drain(batch_id, timeout).await
    }

    /// All finished items of a batch with payloads and summaries
    pub fn get_all_finished(
        &self,
        batch_id: &str,
    ) -> std::collections::HashMap<String, FinishedItem> {
        self.pool.get_all_finished(batch_id)
    }

    /// Tear down a batch once the consumer phase has moved past it.
    ///
    /// Drops the registry entry, all dispatch state, and the delivery
    /// channel; connected subscriber streams end. Subsequent events for the
    /// batch are rejected as unknown.
    pub fn remove_batch(&self, batch_id: &str) -> Result<()> {
        self.registry.remove_batch(batch_id)?;
        self.pool.remove_batch(batch_id);
        self.gateway.remove_batch(batch_id);
        Ok(())
    }

    // Outbound to transport

    /// Publish an envelope to a batch's subscribers
    pub fn publish(&self, batch_id: &str, envelope: Envelope) -> Result<()> {
        self.bridge.publish(batch_id, envelope)
    }

    /// Subscribe to a batch's message stream
    pub fn subscribe(&self, batch_id: &str) -> Subscription {
        self.gateway.subscribe(batch_id)
    }

    /// Remove a subscriber
    pub fn unsubscribe(&self, batch_id: &str, subscriber_id: Uuid) {
        self.gateway.unsubscribe(batch_id, subscriber_id)
    }

    // Human-in-the-loop

    /// Ask for human input and wait for the correlated response
    pub async fn request_input(
        &self,
        batch_id: &str,
        prompt: &str,
        choices: Option<&[String]>,
    ) -> Result<String> {
        self.inputs.request_input(batch_id, prompt, choices).await
    }

    /// Fulfill a pending input request from an inbound client message
    pub fn deliver_response(&self, correlation_id: &str, text: &str) -> Result<()> {
        self.inputs.deliver_response(correlation_id, text)
    }

    /// Install a stall hook before starting the monitor
    pub fn set_stall_hook(&self, hook: StallHook) {
        self.monitor.set_stall_hook(hook);
    }

    /// Install a capacity hook before starting the monitor
    pub fn set_capacity_hook(&self, hook: CapacityHook) {
        self.monitor.set_capacity_hook(hook);
    }

    /// Seed a prior summary for the reuse path
    pub fn seed_prior_summary(&self, item_id: &str, summary: &str) {
        self.pool.seed_prior_summary(item_id, summary);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use async_trait::async_trait;

    struct EchoSummarizer;

    #[async_trait]
    impl Summarizer for EchoSummarizer {
        async fn summarize(&self, item_id: &str, _payload: &ScrapePayload) -> Result<String> {
            Ok(format!("summary of {}", item_id))
        }
    }

    #[test]
    fn test_constants() {
        assert_eq!(VERSION, env!("CARGO_PKG_VERSION"));
        assert_eq!(NAME, env!("CARGO_PKG_NAME"));
    }

    #[tokio::test]
    async fn test_end_to_end_batch() {
        use tokio_stream::StreamExt;

        let pipeline = DigestPipeline::new(PipelineConfig::default(), Arc::new(EchoSummarizer));
        pipeline.start();

        pipeline
            .register_expected(
                "batch-1",
                &[
                    ItemSpec::new("vid-1", "https://example.com/1"),
                    ItemSpec::new("vid-2", "https://example.com/2"),
                ],
            )
            .unwrap();

        let mut sub = pipeline.subscribe("batch-1");

        for item in ["vid-1", "vid-2"] {
            pipeline
                .on_partial_result(
                    "batch-1",
                    item,
                    ScrapePayload {
                        transcript: Some(format!("transcript of {}", item)),
                        ..Default::default()
                    },
                )
                .unwrap();
        }

        let outcome = pipeline
            .wait_for_drain("batch-1", Duration::from_secs(5))
            .await
            .unwrap();
        assert!(outcome.drained);

        let check = pipeline.confirm_complete("batch-1").unwrap();
        assert!(check.confirmed);
        assert_eq!(check.aggregate.completed, 2);

        let finished = pipeline.get_all_finished("batch-1");
        assert_eq!(finished.len(), 2);
        assert_eq!(finished["vid-1"].summary.as_deref(), Some("summary of vid-1"));

        // The subscriber saw the registration first and the confirmation last
        let first = sub.stream.next().await.unwrap();
        assert_eq!(first.kind, kind::BATCH_INITIALIZED);
        let mut last = None;
        while let Ok(Some(envelope)) =
            tokio::time::timeout(Duration::from_millis(50), sub.stream.next()).await
        {
            last = Some(envelope);
        }
        assert_eq!(last.unwrap().kind, kind::COMPLETION_CONFIRMED);

        pipeline.shutdown();
    }

    #[tokio::test]
    async fn test_remove_batch_tears_down_state() {
        let pipeline = DigestPipeline::new(PipelineConfig::default(), Arc::new(EchoSummarizer));
        pipeline.start();

        pipeline
            .register_expected("batch-1", &[ItemSpec::new("vid-1", "https://example.com/1")])
            .unwrap();
        pipeline
            .on_partial_result(
                "batch-1",
                "vid-1",
                ScrapePayload {
                    transcript: Some("t".to_string()),
                    ..Default::default()
                },
            )
            .unwrap();
        let outcome = pipeline
            .wait_for_drain("batch-1", Duration::from_secs(5))
            .await
            .unwrap();
        assert!(outcome.drained);
        assert_eq!(pipeline.get_all_finished("batch-1").len(), 1);

        pipeline.remove_batch("batch-1").unwrap();

        assert!(pipeline.registry.batch_ids().is_empty());
        assert!(pipeline.get_all_finished("batch-1").is_empty());
        assert_eq!(pipeline.gateway.buffered_count("batch-1"), 0);
        assert!(matches!(
            pipeline.compute_aggregate("batch-1"),
            Err(PipelineError::NotFound(_))
        ));
        assert!(matches!(
            pipeline.on_partial_result("batch-1", "vid-1", ScrapePayload::default()),
            Err(PipelineError::Consistency(_))
        ));
        assert!(matches!(
            pipeline.remove_batch("batch-1"),
            Err(PipelineError::NotFound(_))
        ));

        pipeline.shutdown();
    }
}
