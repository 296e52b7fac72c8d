//! Tests for the delivery gateway

#[cfg(test)]
mod tests {
    use super::super::bridge::GatewayBridge;
    use super::super::channel::DeliveryGateway;
    use super::super::input::InputBroker;
    use super::super::types::{Envelope, kind};
    use crate::config::GatewayConfig;
    use crate::utils::error::PipelineError;
    use std::sync::Arc;
    use std::time::Duration;
    use tokio_stream::StreamExt;
    use tokio_test::assert_ok;

    fn gateway_config() -> GatewayConfig {
        GatewayConfig {
            buffer_capacity: 3,
            retry_capacity: 4,
            retry_max_attempts: 2,
            retry_base_backoff_ms: 10,
            input_timeout_secs: 1,
        }
    }

    fn progress(batch: &str, item: &str, overall: f64) -> Envelope {
        Envelope::item_progress(batch, item, "scraping", 50.0, overall, "working")
    }

    #[tokio::test]
    async fn test_buffer_replay_in_original_order() {
        let gateway = DeliveryGateway::new(&gateway_config());

        gateway.publish("b1", progress("b1", "i1", 10.0));
        gateway.publish("b1", progress("b1", "i1", 20.0));
        assert_eq!(gateway.buffered_count("b1"), 2);

        let mut sub = gateway.subscribe("b1");
        let first = sub.stream.next().await.unwrap();
        let second = sub.stream.next().await.unwrap();
        assert_eq!(first.fields["overall_progress"], 10.0);
        assert_eq!(second.fields["overall_progress"], 20.0);

        // Buffer is cleared after replay
        assert_eq!(gateway.buffered_count("b1"), 0);
    }

    #[tokio::test]
    async fn test_buffer_overflow_drops_oldest() {
        let gateway = DeliveryGateway::new(&gateway_config());

        for i in 0..5 {
            gateway.publish("b1", progress("b1", "i1", i as f64));
        }
        // Capacity 3: the two oldest were dropped
        assert_eq!(gateway.buffered_count("b1"), 3);
        assert_eq!(gateway.dropped_count("b1"), 2);

        let mut sub = gateway.subscribe("b1");
        let first = sub.stream.next().await.unwrap();
        assert_eq!(first.fields["overall_progress"], 2.0);
    }

    #[tokio::test]
    async fn test_live_fanout_preserves_publish_order() {
        let gateway = DeliveryGateway::new(&gateway_config());

        let mut sub_a = gateway.subscribe("b1");
        let mut sub_b = gateway.subscribe("b1");
        assert_eq!(gateway.subscriber_count("b1"), 2);

        gateway.publish("b1", progress("b1", "i1", 1.0));
        gateway.publish("b1", progress("b1", "i1", 2.0));

        for sub in [&mut sub_a, &mut sub_b] {
            assert_eq!(sub.stream.next().await.unwrap().fields["overall_progress"], 1.0);
            assert_eq!(sub.stream.next().await.unwrap().fields["overall_progress"], 2.0);
        }
    }

    #[tokio::test]
    async fn test_send_failure_is_implicit_disconnect() {
        let gateway = DeliveryGateway::new(&gateway_config());

        let sub = gateway.subscribe("b1");
        drop(sub);
        gateway.publish("b1", progress("b1", "i1", 1.0));

        assert_eq!(gateway.subscriber_count("b1"), 0);
        // The message that hit the dead subscriber is kept for replay
        assert_eq!(gateway.buffered_count("b1"), 1);
    }

    #[tokio::test]
    async fn test_unsubscribe() {
        let gateway = DeliveryGateway::new(&gateway_config());

        let sub = gateway.subscribe("b1");
        gateway.unsubscribe("b1", sub.id);
        assert_eq!(gateway.subscriber_count("b1"), 0);
    }

    #[tokio::test]
    async fn test_remove_batch_drops_buffer_and_ends_streams() {
        let gateway = DeliveryGateway::new(&gateway_config());

        let mut sub = gateway.subscribe("b1");
        gateway.publish("b1", progress("b1", "i1", 1.0));

        gateway.remove_batch("b1");
        assert_eq!(gateway.subscriber_count("b1"), 0);
        assert_eq!(gateway.buffered_count("b1"), 0);

        // The message delivered before removal is still readable, then the
        // stream ends
        assert_eq!(sub.stream.next().await.unwrap().fields["overall_progress"], 1.0);
        assert!(sub.stream.next().await.is_none());
    }

    #[tokio::test]
    async fn test_batches_are_independent() {
        let gateway = DeliveryGateway::new(&gateway_config());

        let mut sub = gateway.subscribe("b1");
        gateway.publish("b2", progress("b2", "i1", 5.0));

        let nothing = tokio::time::timeout(Duration::from_millis(20), sub.stream.next()).await;
        assert!(nothing.is_err());
        assert_eq!(gateway.buffered_count("b2"), 1);
    }

    #[tokio::test]
    async fn test_bridge_direct_delivery_when_attached() {
        let config = gateway_config();
        let gateway = Arc::new(DeliveryGateway::new(&config));
        let bridge = Arc::new(GatewayBridge::new(&config));
        bridge.attach(Arc::clone(&gateway));

        tokio_test::assert_ok!(bridge.publish("b1", progress("b1", "i1", 1.0)));
        assert_eq!(gateway.buffered_count("b1"), 1);
        assert_eq!(bridge.retry_queue_len(), 0);
    }

    #[tokio::test]
    async fn test_bridge_queues_when_detached_then_drains() {
        let config = gateway_config();
        let gateway = Arc::new(DeliveryGateway::new(&config));
        let bridge = Arc::new(GatewayBridge::new(&config));

        bridge.publish("b1", progress("b1", "i1", 1.0)).unwrap();
        bridge.publish("b1", progress("b1", "i1", 2.0)).unwrap();
        assert_eq!(bridge.retry_queue_len(), 2);

        bridge.attach(Arc::clone(&gateway));
        assert!(bridge.pump_now());
        assert_eq!(bridge.retry_queue_len(), 0);
        assert_eq!(gateway.buffered_count("b1"), 2);

        // Replay order survives the bridge
        let mut sub = gateway.subscribe("b1");
        assert_eq!(sub.stream.next().await.unwrap().fields["overall_progress"], 1.0);
        assert_eq!(sub.stream.next().await.unwrap().fields["overall_progress"], 2.0);
    }

    #[tokio::test]
    async fn test_bridge_dead_letters_after_max_attempts() {
        let config = gateway_config();
        let bridge = Arc::new(GatewayBridge::new(&config));

        bridge.publish("b1", progress("b1", "i1", 1.0)).unwrap();

        // max_attempts = 2: two failed pump passes expire the entry
        assert!(!bridge.pump_now());
        assert!(!bridge.pump_now());
        assert_eq!(bridge.retry_queue_len(), 0);
        assert_eq!(bridge.dead_letter_count(), 1);
    }

    #[tokio::test]
    async fn test_bridge_overflow_dead_letters_newest() {
        let config = gateway_config();
        let bridge = Arc::new(GatewayBridge::new(&config));

        for i in 0..4 {
            bridge.publish("b1", progress("b1", "i1", i as f64)).unwrap();
        }
        let overflow = bridge.publish("b1", progress("b1", "i1", 99.0));
        assert!(matches!(overflow, Err(PipelineError::Delivery(_))));
        assert_eq!(bridge.dead_letter_count(), 1);
        assert_eq!(bridge.retry_queue_len(), 4);
    }

    #[tokio::test]
    async fn test_input_exact_correlation() {
        let config = gateway_config();
        let gateway = Arc::new(DeliveryGateway::new(&config));
        let bridge = Arc::new(GatewayBridge::new(&config));
        bridge.attach(Arc::clone(&gateway));
        let broker = Arc::new(InputBroker::new(Arc::clone(&bridge), &config));

        let mut sub = gateway.subscribe("b1");
        let waiter = {
            let broker = Arc::clone(&broker);
            tokio::spawn(async move { broker.request_input("b1", "pick one", None).await })
        };

        // Read the published request to learn the correlation id
        let request = sub.stream.next().await.unwrap();
        assert_eq!(request.kind, kind::USER_INPUT_REQUEST);
        let correlation_id = request.fields["correlation_id"].as_str().unwrap().to_string();

        broker.deliver_response(&correlation_id, "option a").unwrap();
        assert_eq!(waiter.await.unwrap().unwrap(), "option a");
        assert_eq!(broker.pending_count(), 0);
    }

    #[tokio::test]
    async fn test_input_prefix_fallback_picks_latest() {
        let config = gateway_config();
        let bridge = Arc::new(GatewayBridge::new(&config));
        let broker = Arc::new(InputBroker::new(Arc::clone(&bridge), &config));

        let w1 = {
            let broker = Arc::clone(&broker);
            tokio::spawn(async move { broker.request_input("b1", "first", None).await })
        };
        let w2 = {
            let broker = Arc::clone(&broker);
            tokio::spawn(async move { broker.request_input("b1", "second", None).await })
        };
        while broker.pending_count() < 2 {
            tokio::task::yield_now().await;
        }

        // A response with an unknown suffix falls back to the prefix match
        // and takes the lexicographically latest pending id
        broker.deliver_response("input-zzzz", "fallback answer").unwrap();
        assert_eq!(broker.pending_count(), 1);

        let answered = tokio::select! {
            r = w1 => r.unwrap(),
            r = w2 => r.unwrap(),
        };
        assert_eq!(answered.unwrap(), "fallback answer");
    }

    #[tokio::test]
    async fn test_input_unmatched_response() {
        let config = gateway_config();
        let bridge = Arc::new(GatewayBridge::new(&config));
        let broker = InputBroker::new(bridge, &config);

        let result = broker.deliver_response("input-missing", "hello");
        assert!(matches!(result, Err(PipelineError::NotFound(_))));
    }

    #[tokio::test(start_paused = true)]
    async fn test_input_timeout() {
        let config = gateway_config();
        let gateway = Arc::new(DeliveryGateway::new(&config));
        let bridge = Arc::new(GatewayBridge::new(&config));
        bridge.attach(gateway);
        let broker = InputBroker::new(bridge, &config);

        let result = broker.request_input("b1", "anyone there?", None).await;
        assert!(matches!(result, Err(PipelineError::Timeout(_))));
        assert_eq!(broker.pending_count(), 0);
    }

    #[test]
    fn test_envelope_wire_shape() {
        let envelope = Envelope::item_status("b1", "i1", "completed", None);
        let value = serde_json::to_value(&envelope).unwrap();
        assert_eq!(value["type"], "item-status");
        assert_eq!(value["batch_id"], "b1");
        assert_eq!(value["item_id"], "i1");
        assert_eq!(value["status"], "completed");
        assert!(value["timestamp"].is_string());

        let response = Envelope::user_input_response("b1", "input-abc", "yes");
        let value = serde_json::to_value(&response).unwrap();
        assert_eq!(value["type"], "user-input-response");
        assert_eq!(value["correlation_id"], "input-abc");
        assert_eq!(value["text"], "yes");
    }
}
