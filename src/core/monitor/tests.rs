//! Tests for the stall/capacity monitor

#[cfg(test)]
mod tests {
    use super::super::{CapacitySignal, StallEvent, StallMonitor};
    use crate::config::{GatewayConfig, MonitorConfig, ThrottleConfig};
    use crate::core::dispatch::{ScrapePayload, SummaryPool, Summarizer};
    use crate::core::gateway::{DeliveryGateway, GatewayBridge};
    use crate::core::registry::{BatchRegistry, ItemSpec, ItemStatus};
    use crate::utils::error::Result;
    use async_trait::async_trait;
    use parking_lot::Mutex;
    use std::sync::Arc;
    use std::time::Duration;

    struct NoopSummarizer;

    #[async_trait]
    impl Summarizer for NoopSummarizer {
        async fn summarize(&self, item_id: &str, _payload: &ScrapePayload) -> Result<String> {
            Ok(format!("summary of {}", item_id))
        }
    }

    fn instant_timeouts() -> MonitorConfig {
        MonitorConfig {
            tick_ms: 10,
            network_stage_timeout_secs: 0,
            compute_stage_timeout_secs: 0,
        }
    }

    fn harness(config: MonitorConfig) -> (Arc<StallMonitor>, Arc<BatchRegistry>, Arc<SummaryPool>) {
        let gateway_config = GatewayConfig::default();
        let gateway = Arc::new(DeliveryGateway::new(&gateway_config));
        let bridge = Arc::new(GatewayBridge::new(&gateway_config));
        bridge.attach(gateway);
        let registry = Arc::new(BatchRegistry::new(
            Arc::clone(&bridge),
            ThrottleConfig::default(),
        ));
        let pool = Arc::new(SummaryPool::new(
            Arc::new(NoopSummarizer),
            Arc::clone(&registry),
            bridge,
            false,
        ));
        let monitor = Arc::new(StallMonitor::new(
            Arc::clone(&registry),
            Arc::clone(&pool),
            config,
        ));
        (monitor, registry, pool)
    }

    fn collect_stalls(monitor: &StallMonitor) -> Arc<Mutex<Vec<StallEvent>>> {
        let events: Arc<Mutex<Vec<StallEvent>>> = Arc::new(Mutex::new(Vec::new()));
        let sink = Arc::clone(&events);
        monitor.set_stall_hook(Arc::new(move |event| {
            sink.lock().push(event);
        }));
        events
    }

    #[tokio::test]
    async fn test_stall_flagged_once_per_stage_entry() {
        let (monitor, registry, _pool) = harness(instant_timeouts());
        let events = collect_stalls(&monitor);

        registry
            .register_expected("b1", &[ItemSpec::new("vid-1", "https://example.com/1")])
            .unwrap();

        // Zero timeout: the pending item is immediately past budget
        monitor.tick();
        monitor.tick();

        let seen = events.lock();
        assert_eq!(seen.len(), 1);
        assert_eq!(seen[0].item_id, "vid-1");
        assert_eq!(seen[0].stage, "pending");
        assert_eq!(seen[0].status, ItemStatus::Pending);
    }

    #[tokio::test]
    async fn test_stage_change_rearms_stall_detection() {
        let (monitor, registry, _pool) = harness(instant_timeouts());
        let events = collect_stalls(&monitor);

        registry
            .register_expected("b1", &[ItemSpec::new("vid-1", "https://example.com/1")])
            .unwrap();
        monitor.tick();

        registry.mark_stage("b1", "vid-1", "summarizing");
        monitor.tick();

        let seen = events.lock();
        assert_eq!(seen.len(), 2);
        assert_eq!(seen[1].stage, "summarizing");
    }

    #[tokio::test]
    async fn test_flag_memory_pruned_when_items_go_terminal() {
        let (monitor, registry, _pool) = harness(instant_timeouts());
        let _events = collect_stalls(&monitor);

        registry
            .register_expected("b1", &[ItemSpec::new("vid-1", "https://example.com/1")])
            .unwrap();
        monitor.tick();
        assert_eq!(monitor.flagged_count(), 1);

        registry
            .record_status("b1", "vid-1", ItemStatus::Completed, None, None)
            .unwrap();
        monitor.tick();
        assert_eq!(monitor.flagged_count(), 0);
    }

    #[tokio::test]
    async fn test_flag_memory_pruned_when_batch_removed() {
        let (monitor, registry, _pool) = harness(instant_timeouts());
        let _events = collect_stalls(&monitor);

        registry
            .register_expected("b1", &[ItemSpec::new("vid-1", "https://example.com/1")])
            .unwrap();
        monitor.tick();
        assert_eq!(monitor.flagged_count(), 1);

        registry.remove_batch("b1").unwrap();
        monitor.tick();
        assert_eq!(monitor.flagged_count(), 0);
    }

    #[tokio::test]
    async fn test_terminal_items_not_flagged() {
        let (monitor, registry, _pool) = harness(instant_timeouts());
        let events = collect_stalls(&monitor);

        registry
            .register_expected("b1", &[ItemSpec::new("vid-1", "https://example.com/1")])
            .unwrap();
        registry
            .record_status("b1", "vid-1", ItemStatus::Completed, None, None)
            .unwrap();

        monitor.tick();
        assert!(events.lock().is_empty());
    }

    #[tokio::test]
    async fn test_fresh_items_within_budget_not_flagged() {
        let config = MonitorConfig {
            tick_ms: 10,
            network_stage_timeout_secs: 3600,
            compute_stage_timeout_secs: 3600,
        };
        let (monitor, registry, _pool) = harness(config);
        let events = collect_stalls(&monitor);

        registry
            .register_expected("b1", &[ItemSpec::new("vid-1", "https://example.com/1")])
            .unwrap();
        monitor.tick();
        assert!(events.lock().is_empty());
    }

    #[tokio::test]
    async fn test_capacity_signal_when_workers_idle_and_queue_nonempty() {
        let (monitor, registry, pool) = harness(instant_timeouts());

        let signals: Arc<Mutex<Vec<CapacitySignal>>> = Arc::new(Mutex::new(Vec::new()));
        let sink = Arc::clone(&signals);
        monitor.set_capacity_hook(Arc::new(move |signal| {
            sink.lock().push(signal);
        }));

        registry
            .register_expected("b1", &[ItemSpec::new("vid-1", "https://example.com/1")])
            .unwrap();
        pool.start_pool(1);

        // Enqueue without yielding: the worker has not dequeued yet, so the
        // monitor observes an idle worker alongside a non-empty queue
        pool.on_partial_result("b1", "vid-1", ScrapePayload::default())
            .unwrap();
        monitor.tick();

        let seen = signals.lock();
        assert_eq!(seen.len(), 1);
        assert_eq!(seen[0].idle_workers, 1);
        assert_eq!(seen[0].queued, 1);
    }

    #[tokio::test]
    async fn test_background_loop_and_shutdown() {
        let (monitor, registry, _pool) = harness(instant_timeouts());
        let events = collect_stalls(&monitor);

        registry
            .register_expected("b1", &[ItemSpec::new("vid-1", "https://example.com/1")])
            .unwrap();

        monitor.spawn();
        tokio::time::sleep(Duration::from_millis(60)).await;
        monitor.shutdown();

        assert_eq!(events.lock().len(), 1);
    }
}
