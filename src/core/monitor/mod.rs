//! Stall and capacity monitoring
//!
//! A read-only background watcher over registry and pool state. It flags
//! items stuck past a per-stage timeout and signals idle worker capacity,
//! both through advisory hooks; it never cancels, retries, or mutates any
//! tracking state itself. Policy belongs to the caller.

#[cfg(test)]
mod tests;

use crate::config::MonitorConfig;
use crate::core::dispatch::SummaryPool;
use crate::core::registry::{BatchRegistry, ItemStatus};
use chrono::{DateTime, Utc};
use parking_lot::Mutex;
use std::collections::HashSet;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;
use tracing::{debug, warn};

/// Stages dominated by network wait, allowed the longer timeout
const NETWORK_STAGES: &[&str] = &["pending", "loading", "scraping", "downloading", "fetching"];

/// Advisory notification for an item stuck in one stage
#[derive(Debug, Clone)]
pub struct StallEvent {
    /// Batch the item belongs to
    pub batch_id: String,
    /// Stalled item
    pub item_id: String,
    /// Stage the item is stuck in
    pub stage: String,
    /// Status at the time of detection
    pub status: ItemStatus,
    /// Time spent in the current stage
    pub elapsed: Duration,
}

/// Advisory notification that workers sit idle while work is queued
#[derive(Debug, Clone, Copy)]
pub struct CapacitySignal {
    /// Workers not currently summarizing
    pub idle_workers: usize,
    /// Items waiting for a worker
    pub queued: usize,
}

/// Hook invoked for each newly detected stall
pub type StallHook = Arc<dyn Fn(StallEvent) + Send + Sync>;
/// Hook invoked when idle capacity coincides with a non-empty queue
pub type CapacityHook = Arc<dyn Fn(CapacitySignal) + Send + Sync>;

/// Read-only background watcher over item state
pub struct StallMonitor {
    registry: Arc<BatchRegistry>,
    pool: Arc<SummaryPool>,
    config: MonitorConfig,
    stall_hook: Mutex<Option<StallHook>>,
    capacity_hook: Mutex<Option<CapacityHook>>,
    /// (batch_id, item_id, stage entry time) triples already flagged, so
    /// each stall fires once per stage entry
    flagged: Mutex<HashSet<FlagKey>>,
    shutdown: Arc<AtomicBool>,
}

type FlagKey = (String, String, DateTime<Utc>);

impl StallMonitor {
    /// Create a monitor over the given registry and pool
    pub fn new(registry: Arc<BatchRegistry>, pool: Arc<SummaryPool>, config: MonitorConfig) -> Self {
        Self {
            registry,
            pool,
            config,
            stall_hook: Mutex::new(None),
            capacity_hook: Mutex::new(None),
            flagged: Mutex::new(HashSet::new()),
            shutdown: Arc::new(AtomicBool::new(false)),
        }
    }

    /// Install the stall hook
    pub fn set_stall_hook(&self, hook: StallHook) {
        *self.stall_hook.lock() = Some(hook);
    }

    /// Install the capacity hook
    pub fn set_capacity_hook(&self, hook: CapacityHook) {
        *self.capacity_hook.lock() = Some(hook);
    }

    /// Start the background tick loop
    pub fn spawn(self: &Arc<Self>) {
        let monitor = Arc::clone(self);
        tokio::spawn(async move {
            let mut ticker =
                tokio::time::interval(Duration::from_millis(monitor.config.tick_ms));
            ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);
            loop {
                ticker.tick().await;
                if monitor.shutdown.load(Ordering::SeqCst) {
                    break;
                }
                monitor.tick();
            }
        });
    }

    /// Stop the background loop
    pub fn shutdown(&self) {
        self.shutdown.store(true, Ordering::SeqCst);
    }

    /// One monitoring pass over all batches. Reads snapshots only.
    pub fn tick(&self) {
        let now = Utc::now();
        let mut live: HashSet<FlagKey> = HashSet::new();

        for batch_id in self.registry.batch_ids() {
            for item in self.registry.snapshot(&batch_id) {
                if item.status.is_terminal() {
                    continue;
                }
                let key = (batch_id.clone(), item.item_id.clone(), item.stage_entered_at);
                live.insert(key.clone());

                let elapsed = (now - item.stage_entered_at)
                    .to_std()
                    .unwrap_or(Duration::ZERO);
                if elapsed < self.stage_timeout(&item.stage) {
                    continue;
                }

                {
                    let mut flagged = self.flagged.lock();
                    if !flagged.insert(key) {
                        continue;
                    }
                }

                warn!(
                    batch_id,
                    item_id = %item.item_id,
                    stage = %item.stage,
                    elapsed_secs = elapsed.as_secs(),
                    "item stalled past stage timeout"
                );
                let hook = self.stall_hook.lock().clone();
                if let Some(hook) = hook {
                    hook(StallEvent {
                        batch_id: batch_id.clone(),
                        item_id: item.item_id,
                        stage: item.stage,
                        status: item.status,
                        elapsed,
                    });
                }
            }
        }

        // Flags whose item went terminal, entered a new stage, or whose
        // batch was removed are pruned
        self.flagged.lock().retain(|key| live.contains(key));

        let stats = self.pool.stats();
        if stats.in_flight < stats.capacity && stats.queued > 0 {
            debug!(
                idle = stats.capacity - stats.in_flight,
                queued = stats.queued,
                "idle capacity with non-empty queue"
            );
            let hook = self.capacity_hook.lock().clone();
            if let Some(hook) = hook {
                hook(CapacitySignal {
                    idle_workers: stats.capacity - stats.in_flight,
                    queued: stats.queued,
                });
            }
        }
    }

    #[cfg(test)]
    pub(crate) fn flagged_count(&self) -> usize {
        self.flagged.lock().len()
    }

    fn stage_timeout(&self, stage: &str) -> Duration {
        if NETWORK_STAGES.contains(&stage) {
            Duration::from_secs(self.config.network_stage_timeout_secs)
        } else {
            Duration::from_secs(self.config.compute_stage_timeout_secs)
        }
    }
}
