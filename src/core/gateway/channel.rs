//! Per-batch subscriber fan-out with buffering and replay
//!
//! Messages published while a batch has no connected subscriber are held in a
//! bounded FIFO buffer and replayed, in original order, to the first
//! subscriber that connects. Live messages preserve publish order. A failed
//! send is treated as an implicit disconnect and the subscriber is pruned.

use super::types::Envelope;
use crate::config::GatewayConfig;
use futures::Stream;
use std::collections::VecDeque;
use std::pin::Pin;
use std::task::{Context, Poll};
use tokio::sync::mpsc;
use tokio_stream::wrappers::UnboundedReceiverStream;
use tracing::{debug, warn};
use uuid::Uuid;

/// A connected delivery endpoint for one batch
struct SubscriberSlot {
    id: Uuid,
    tx: mpsc::UnboundedSender<Envelope>,
}

/// Channel state for one batch
#[derive(Default)]
struct BatchChannel {
    subscribers: Vec<SubscriberSlot>,
    buffer: VecDeque<Envelope>,
    dropped: u64,
}

/// Handle returned to a subscriber: an id for unsubscribing plus the
/// live message stream.
pub struct Subscription {
    /// Subscriber id, used for explicit unsubscribe
    pub id: Uuid,
    /// Ordered stream of envelopes (replayed buffer first, then live)
    pub stream: UnboundedReceiverStream<Envelope>,
}

impl Stream for Subscription {
    type Item = Envelope;

    fn poll_next(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Option<Self::Item>> {
        Pin::new(&mut self.stream).poll_next(cx)
    }
}

/// Per-batch pub/sub fan-out with bounded replay buffers
pub struct DeliveryGateway {
    channels: dashmap::DashMap<String, BatchChannel>,
    buffer_capacity: usize,
}

impl DeliveryGateway {
    /// Create a gateway from config
    pub fn new(config: &GatewayConfig) -> Self {
        Self {
            channels: dashmap::DashMap::new(),
            buffer_capacity: config.buffer_capacity,
        }
    }

    /// Publish a message to all subscribers of a batch, or buffer it when
    /// none are connected. Send failures prune the subscriber.
    pub fn publish(&self, batch_id: &str, envelope: Envelope) {
        let mut entry = self
            .channels
            .entry(batch_id.to_string())
            .or_default();
        let channel = entry.value_mut();

        if channel.subscribers.is_empty() {
            if channel.buffer.len() >= self.buffer_capacity {
                channel.buffer.pop_front();
                channel.dropped += 1;
                warn!(
                    batch_id,
                    dropped = channel.dropped,
                    "replay buffer full, dropping oldest message"
                );
            }
            channel.buffer.push_back(envelope);
            return;
        }

        channel.subscribers.retain(|sub| {
            if sub.tx.send(envelope.clone()).is_err() {
                warn!(batch_id, subscriber = %sub.id, "send failed, treating as disconnect");
                false
            } else {
                true
            }
        });

        // Everyone disconnected mid-publish: keep the message for replay
        if channel.subscribers.is_empty() {
            channel.buffer.push_back(envelope);
        }
    }

    /// Subscribe to a batch. Buffered messages are replayed in original
    /// order before any live message, then the buffer is cleared.
    pub fn subscribe(&self, batch_id: &str) -> Subscription {
        let (tx, rx) = mpsc::unbounded_channel();
        let id = Uuid::new_v4();

        let mut entry = self
            .channels
            .entry(batch_id.to_string())
            .or_default();
        let channel = entry.value_mut();

        let replayed = channel.buffer.len();
        for envelope in channel.buffer.drain(..) {
            // Receiver is still in scope, send cannot fail here
            let _ = tx.send(envelope);
        }
        if replayed > 0 {
            debug!(batch_id, replayed, "replayed buffered messages to new subscriber");
        }

        channel.subscribers.push(SubscriberSlot { id, tx });

        Subscription {
            id,
            stream: UnboundedReceiverStream::new(rx),
        }
    }

    /// Remove a subscriber from a batch
    pub fn unsubscribe(&self, batch_id: &str, subscriber_id: Uuid) {
        if let Some(mut entry) = self.channels.get_mut(batch_id) {
            entry.value_mut().subscribers.retain(|s| s.id != subscriber_id);
        }
    }

    /// Number of connected subscribers for a batch
    pub fn subscriber_count(&self, batch_id: &str) -> usize {
        self.channels
            .get(batch_id)
            .map(|c| c.subscribers.len())
            .unwrap_or(0)
    }

    /// Messages dropped from a batch's replay buffer due to overflow
    pub fn dropped_count(&self, batch_id: &str) -> u64 {
        self.channels.get(batch_id).map(|c| c.dropped).unwrap_or(0)
    }

    /// Messages currently buffered for a batch
    pub fn buffered_count(&self, batch_id: &str) -> usize {
        self.channels
            .get(batch_id)
            .map(|c| c.buffer.len())
            .unwrap_or(0)
    }

    /// Drop a batch's channel. Buffered messages are discarded and the
    /// streams of connected subscribers end.
    pub fn remove_batch(&self, batch_id: &str) {
        if self.channels.remove(batch_id).is_some() {
            debug!(batch_id, "batch channel removed");
        }
    }
}
