//! Cross-thread publish bridge
//!
//! Producers run on arbitrary threads and tasks; the gateway they publish to
//! may not be attached yet when the first events arrive (observers connect
//! late, the delivery side is constructed separately). The bridge resolves
//! each publish in order: deliver directly through the attached gateway, or
//! park the message on a bounded retry queue serviced by a single pump task
//! with exponential backoff. Messages that exhaust their attempts are
//! dead-lettered with a log record rather than retried forever.

use super::channel::DeliveryGateway;
use super::types::Envelope;
use crate::config::GatewayConfig;
use crate::utils::error::{PipelineError, Result};
use arc_swap::ArcSwapOption;
use parking_lot::Mutex;
use std::collections::VecDeque;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::time::Duration;
use tracing::{debug, error, info, warn};

/// Maximum pump backoff regardless of consecutive failures
const MAX_BACKOFF: Duration = Duration::from_secs(5);

struct PendingPublish {
    batch_id: String,
    envelope: Envelope,
    attempts: u32,
}

/// Thread-safe publish path for producers outside the delivery context
pub struct GatewayBridge {
    gateway: ArcSwapOption<DeliveryGateway>,
    retry: Mutex<VecDeque<PendingPublish>>,
    retry_capacity: usize,
    max_attempts: u32,
    base_backoff: Duration,
    dead_letters: AtomicU64,
    pump_running: AtomicBool,
    shutdown: AtomicBool,
}

impl GatewayBridge {
    /// Create a detached bridge; messages queue until a gateway is attached
    pub fn new(config: &GatewayConfig) -> Self {
        Self {
            gateway: ArcSwapOption::const_empty(),
            retry: Mutex::new(VecDeque::new()),
            retry_capacity: config.retry_capacity,
            max_attempts: config.retry_max_attempts,
            base_backoff: Duration::from_millis(config.retry_base_backoff_ms),
            dead_letters: AtomicU64::new(0),
            pump_running: AtomicBool::new(false),
            shutdown: AtomicBool::new(false),
        }
    }

    /// Attach the live gateway; queued messages drain on the next pump pass
    pub fn attach(&self, gateway: Arc<DeliveryGateway>) {
        self.gateway.store(Some(gateway));
        info!("delivery gateway attached to bridge");
    }

    /// Detach the gateway; subsequent publishes queue for retry
    pub fn detach(&self) {
        self.gateway.store(None);
    }

    /// Publish an envelope, directly when the gateway is reachable,
    /// otherwise onto the bounded retry queue.
    pub fn publish(&self, batch_id: &str, envelope: Envelope) -> Result<()> {
        if let Some(gateway) = self.gateway.load_full() {
            gateway.publish(batch_id, envelope);
            return Ok(());
        }

        let mut retry = self.retry.lock();
        if retry.len() >= self.retry_capacity {
            self.dead_letters.fetch_add(1, Ordering::Relaxed);
            error!(
                batch_id,
                kind = %envelope.kind,
                "retry queue full, dead-lettering message"
            );
            return Err(PipelineError::Delivery(format!(
                "retry queue full ({} entries), message dead-lettered",
                self.retry_capacity
            )));
        }
        debug!(batch_id, kind = %envelope.kind, "gateway unreachable, queueing for retry");
        retry.push_back(PendingPublish {
            batch_id: batch_id.to_string(),
            envelope,
            attempts: 0,
        });
        Ok(())
    }

    /// Start the single retry pump task. Idempotent.
    pub fn start_pump(self: &Arc<Self>) {
        if self.pump_running.swap(true, Ordering::SeqCst) {
            return;
        }
        let bridge = Arc::clone(self);
        tokio::spawn(async move {
            let mut backoff = bridge.base_backoff;
            loop {
                tokio::time::sleep(backoff).await;
                if bridge.shutdown.load(Ordering::SeqCst) {
                    break;
                }
                if bridge.pump_once() {
                    backoff = bridge.base_backoff;
                } else {
                    backoff = (backoff * 2).min(MAX_BACKOFF);
                }
            }
            bridge.pump_running.store(false, Ordering::SeqCst);
        });
    }

    /// One pump pass. Returns true when the queue is empty or fully drained.
    fn pump_once(&self) -> bool {
        let gateway = self.gateway.load_full();
        let mut retry = self.retry.lock();
        if retry.is_empty() {
            return true;
        }

        match gateway {
            Some(gateway) => {
                let draining: Vec<PendingPublish> = retry.drain(..).collect();
                drop(retry);
                let count = draining.len();
                for pending in draining {
                    gateway.publish(&pending.batch_id, pending.envelope);
                }
                debug!(count, "retry pump delivered queued messages");
                true
            }
            None => {
                // Gateway still unreachable: age the queue, dead-letter the expired
                let before = retry.len();
                for pending in retry.iter_mut() {
                    pending.attempts += 1;
                }
                let max_attempts = self.max_attempts;
                let dead: Vec<(String, String)> = retry
                    .iter()
                    .filter(|p| p.attempts >= max_attempts)
                    .map(|p| (p.batch_id.clone(), p.envelope.kind.clone()))
                    .collect();
                retry.retain(|p| p.attempts < max_attempts);
                let expired = before - retry.len();
                drop(retry);

                if expired > 0 {
                    self.dead_letters
                        .fetch_add(expired as u64, Ordering::Relaxed);
                    for (batch_id, kind) in dead {
                        error!(
                            batch_id,
                            kind,
                            max_attempts,
                            "message exhausted retry attempts, dead-lettered"
                        );
                    }
                } else {
                    warn!(queued = before, "gateway still unreachable, backing off");
                }
                false
            }
        }
    }

    /// Stop the pump task
    pub fn shutdown(&self) {
        self.shutdown.store(true, Ordering::SeqCst);
    }

    /// Total messages dead-lettered since construction
    pub fn dead_letter_count(&self) -> u64 {
        self.dead_letters.load(Ordering::Relaxed)
    }

    /// Messages currently parked on the retry queue
    pub fn retry_queue_len(&self) -> usize {
        self.retry.lock().len()
    }

    #[cfg(test)]
    pub(crate) fn pump_now(&self) -> bool {
        self.pump_once()
    }
}
