//! Streaming dispatcher and summarization worker pool
//!
//! Finished scrapes stream in as partial payloads; the dispatcher merges
//! them, queues each item once, and a fixed pool of long-lived workers
//! drains the queue. Three disjoint tracking sets (queued, in-flight,
//! cancelled) change membership only inside one short critical section,
//! which together with workers never requeuing on their own gives the
//! at-most-once dispatch guarantee.

use super::payload::ScrapePayload;
use crate::core::gateway::{Envelope, GatewayBridge};
use crate::core::registry::{BatchRegistry, ItemStatus};
use crate::utils::error::{PipelineError, Result};
use async_trait::async_trait;
use parking_lot::Mutex;
use std::collections::{HashMap, HashSet};
use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::time::Duration;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

/// External summarization seam
///
/// The LLM-driven summarizer is an external collaborator; the pool only
/// requires this interface. One item's failure never stops the pool.
#[async_trait]
pub trait Summarizer: Send + Sync {
    /// Produce a summary for one item's merged payload
    async fn summarize(&self, item_id: &str, payload: &ScrapePayload) -> Result<String>;
}

/// Terminal result for one item
#[derive(Debug, Clone)]
pub struct FinishedItem {
    /// Batch the item belongs to
    pub batch_id: String,
    /// The merged payload the terminal state was reached with
    pub payload: ScrapePayload,
    /// Summary text on success
    pub summary: Option<String>,
    /// Error detail on failure
    pub error: Option<String>,
}

/// Result of a bounded drain poll
#[derive(Debug, Clone)]
pub struct DrainOutcome {
    /// Queue empty and every expected item terminal
    pub drained: bool,
    /// Items still non-terminal when the poll gave up
    pub non_terminal: Vec<String>,
}

/// Point-in-time pool occupancy
#[derive(Debug, Clone, Copy)]
pub struct PoolStats {
    /// Items waiting for a worker
    pub queued: usize,
    /// Items currently being summarized
    pub in_flight: usize,
    /// Started worker count
    pub capacity: usize,
}

struct WorkItem {
    batch_id: String,
    item_id: String,
}

/// (batch_id, item_id); tracking is per batch, so identical item ids in
/// different batches never collide
type ItemKey = (String, String);

#[derive(Default)]
struct DispatchState {
    queued: HashSet<ItemKey>,
    in_flight: HashSet<ItemKey>,
    cancelled: HashSet<ItemKey>,
    payloads: HashMap<ItemKey, ScrapePayload>,
    finished: HashMap<ItemKey, FinishedItem>,
}

enum Admission {
    Ignore,
    Merged,
    Reused(String),
    Enqueue,
}

/// Queue-backed fixed pool of summarization workers
pub struct SummaryPool {
    state: Mutex<DispatchState>,
    queue_tx: Mutex<Option<mpsc::UnboundedSender<WorkItem>>>,
    queue_rx: tokio::sync::Mutex<mpsc::UnboundedReceiver<WorkItem>>,
    summarizer: Arc<dyn Summarizer>,
    registry: Arc<BatchRegistry>,
    bridge: Arc<GatewayBridge>,
    prior_summaries: Mutex<HashMap<String, String>>,
    reuse_existing: bool,
    capacity: AtomicUsize,
    workers: Mutex<Vec<JoinHandle<()>>>,
}

impl SummaryPool {
    /// Create a pool; workers start with [`SummaryPool::start_pool`]
    pub fn new(
        summarizer: Arc<dyn Summarizer>,
        registry: Arc<BatchRegistry>,
        bridge: Arc<GatewayBridge>,
        reuse_existing: bool,
    ) -> Self {
        let (tx, rx) = mpsc::unbounded_channel();
        Self {
            state: Mutex::new(DispatchState::default()),
            queue_tx: Mutex::new(Some(tx)),
            queue_rx: tokio::sync::Mutex::new(rx),
            summarizer,
            registry,
            bridge,
            prior_summaries: Mutex::new(HashMap::new()),
            reuse_existing,
            capacity: AtomicUsize::new(0),
            workers: Mutex::new(Vec::new()),
        }
    }

    /// Seed a prior summary for the reuse path
    pub fn seed_prior_summary(&self, item_id: &str, summary: &str) {
        self.prior_summaries
            .lock()
            .insert(item_id.to_string(), summary.to_string());
    }

    /// Accept a partial scrape result for an item.
    ///
    /// Terminal and cancelled items are ignored; an item already queued or
    /// in flight has the payload merged in place (the worker picks up the
    /// merged version); otherwise the payload is stored and the item either
    /// finishes immediately from a prior summary (reuse path) or is queued.
    pub fn on_partial_result(
        &self,
        batch_id: &str,
        item_id: &str,
        payload: ScrapePayload,
    ) -> Result<()> {
        if !self.registry.is_registered(batch_id, item_id) {
            warn!(batch_id, item_id, "partial result for unregistered item dropped");
            return Err(PipelineError::Consistency(format!(
                "item {} is not registered in batch {}",
                item_id, batch_id
            )));
        }
        if let Some(record) = self.registry.get_record(batch_id, item_id) {
            if record.status.is_terminal() {
                debug!(batch_id, item_id, "partial result after terminal state ignored");
                return Ok(());
            }
        }

        let key: ItemKey = (batch_id.to_string(), item_id.to_string());
        let admission = {
            let mut st = self.state.lock();
            if st.finished.contains_key(&key) {
                debug!(batch_id, item_id, "partial result for finished item ignored");
                Admission::Ignore
            } else if st.cancelled.contains(&key) {
                debug!(batch_id, item_id, "partial result for cancelled item ignored");
                Admission::Ignore
            } else if st.queued.contains(&key) || st.in_flight.contains(&key) {
                st.payloads.entry(key).or_default().merge(&payload);
                Admission::Merged
            } else {
                let merged = st.payloads.entry(key.clone()).or_default();
                merged.merge(&payload);

                let prior = if self.reuse_existing {
                    self.prior_summaries.lock().get(item_id).cloned()
                } else {
                    None
                };
                match prior {
                    Some(summary) => {
                        let stored = merged.clone();
                        st.finished.insert(
                            key,
                            FinishedItem {
                                batch_id: batch_id.to_string(),
                                payload: stored,
                                summary: Some(summary.clone()),
                                error: None,
                            },
                        );
                        Admission::Reused(summary)
                    }
                    None => {
                        st.queued.insert(key);
                        Admission::Enqueue
                    }
                }
            }
        };

        match admission {
            Admission::Ignore | Admission::Merged => Ok(()),
            Admission::Reused(_) => {
                info!(batch_id, item_id, "reusing prior summary, skipping dispatch");
                self.registry
                    .record_status(batch_id, item_id, ItemStatus::Completed, None, None)
            }
            Admission::Enqueue => {
                self.registry.mark_stage(batch_id, item_id, "queued");
                let tx = self.queue_tx.lock();
                match tx.as_ref() {
                    Some(tx) => tx
                        .send(WorkItem {
                            batch_id: batch_id.to_string(),
                            item_id: item_id.to_string(),
                        })
                        .map_err(|_| {
                            PipelineError::Delivery("work queue is closed".to_string())
                        }),
                    None => Err(PipelineError::Delivery(
                        "pool has been shut down".to_string(),
                    )),
                }
            }
        }
    }

    /// Start `n` long-lived workers draining the shared queue
    pub fn start_pool(self: &Arc<Self>, n: usize) {
        let mut workers = self.workers.lock();
        for worker_id in 0..n {
            let pool = Arc::clone(self);
            workers.push(tokio::spawn(async move {
                pool.worker_loop(worker_id).await;
            }));
        }
        self.capacity.fetch_add(n, Ordering::SeqCst);
        info!(workers = n, "summarization pool started");
    }

    async fn worker_loop(self: Arc<Self>, worker_id: usize) {
        loop {
            let work = {
                let mut rx = self.queue_rx.lock().await;
                rx.recv().await
            };
            let Some(work) = work else {
                debug!(worker_id, "work queue closed, worker exiting");
                break;
            };

            let key: ItemKey = (work.batch_id.clone(), work.item_id.clone());

            // Acquire: move queued -> in-flight and take the latest merged
            // payload, all inside the one coordinating critical section.
            let payload = {
                let mut st = self.state.lock();
                if st.cancelled.contains(&key) {
                    st.queued.remove(&key);
                    debug!(item_id = %work.item_id, "skipping cancelled item at acquire");
                    continue;
                }
                if !st.queued.remove(&key) {
                    // Stale queue entry; the item was handled elsewhere
                    continue;
                }
                st.in_flight.insert(key.clone());
                st.payloads.get(&key).cloned().unwrap_or_default()
            };

            self.registry
                .mark_stage(&work.batch_id, &work.item_id, "summarizing");
            let result = self.summarizer.summarize(&work.item_id, &payload).await;

            // Commit: discard for cancelled items, otherwise write the
            // terminal result exactly once. Workers never requeue.
            let terminal = {
                let mut st = self.state.lock();
                st.in_flight.remove(&key);
                if st.cancelled.remove(&key) {
                    debug!(item_id = %work.item_id, "discarding result for cancelled item");
                    None
                } else {
                    let latest = st.payloads.get(&key).cloned().unwrap_or(payload);
                    let (summary, error) = match &result {
                        Ok(summary) => (Some(summary.clone()), None),
                        Err(e) => (None, Some(e.to_string())),
                    };
                    st.finished.insert(
                        key.clone(),
                        FinishedItem {
                            batch_id: work.batch_id.clone(),
                            payload: latest,
                            summary,
                            error: error.clone(),
                        },
                    );
                    match error {
                        None => Some((ItemStatus::Completed, None)),
                        Some(e) => Some((ItemStatus::Failed, Some(e))),
                    }
                }
            };

            if let Some((status, error)) = terminal {
                if let Err(e) =
                    self.registry
                        .record_status(&work.batch_id, &work.item_id, status, error, None)
                {
                    warn!(item_id = %work.item_id, error = %e, "terminal status write failed");
                }
            }
        }
    }

    /// Cancel an item cooperatively.
    ///
    /// The item moves into the cancelled set; a worker holding it checks
    /// cancellation before starting expensive work and again before
    /// committing, discarding output for a cancelled item. The registry
    /// records the item as Failed so completion math still terminates.
    pub fn cancel_item(&self, batch_id: &str, item_id: &str) -> Result<()> {
        let key: ItemKey = (batch_id.to_string(), item_id.to_string());
        {
            let mut st = self.state.lock();
            if st.finished.contains_key(&key) {
                debug!(batch_id, item_id, "cancel after terminal state ignored");
                return Ok(());
            }
            st.queued.remove(&key);
            st.cancelled.insert(key);
        }
        info!(batch_id, item_id, "item cancelled");
        let _ = self
            .bridge
            .publish(batch_id, Envelope::cancellation_notice(batch_id, item_id));
        self.registry.record_status(
            batch_id,
            item_id,
            ItemStatus::Failed,
            Some("cancelled".to_string()),
            None,
        )
    }

    /// Poll until the queue is drained and every expected item of the batch
    /// is terminal, or the timeout elapses. On timeout the non-terminal
    /// items are reported rather than blocking forever.
    pub async fn wait_for_drain(&self, batch_id: &str, timeout: Duration) -> Result<DrainOutcome> {
        let deadline = tokio::time::Instant::now() + timeout;
        loop {
            let queue_idle = {
                let st = self.state.lock();
                !st.queued.iter().any(|k| k.0 == batch_id)
                    && !st.in_flight.iter().any(|k| k.0 == batch_id)
            };
            let check = self.registry.confirm_complete(batch_id)?;
            if queue_idle && check.non_terminal.is_empty() {
                return Ok(DrainOutcome {
                    drained: true,
                    non_terminal: Vec::new(),
                });
            }
            if tokio::time::Instant::now() >= deadline {
                warn!(
                    batch_id,
                    non_terminal = check.non_terminal.len(),
                    "drain timed out"
                );
                return Ok(DrainOutcome {
                    drained: false,
                    non_terminal: check.non_terminal,
                });
            }
            tokio::time::sleep(Duration::from_millis(50)).await;
        }
    }

    /// All finished items of a batch with their payloads and summaries
    pub fn get_all_finished(&self, batch_id: &str) -> HashMap<String, FinishedItem> {
        let st = self.state.lock();
        st.finished
            .iter()
            .filter(|(key, _)| key.0 == batch_id)
            .map(|(key, item)| (key.1.clone(), item.clone()))
            .collect()
    }

    /// Drop all dispatch state for a batch.
    ///
    /// Queued, finished, payload, and cancellation entries are discarded.
    /// Items still in flight are marked cancelled; their results are
    /// discarded at commit.
    pub fn remove_batch(&self, batch_id: &str) {
        let mut st = self.state.lock();
        st.queued.retain(|k| k.0 != batch_id);
        st.payloads.retain(|k, _| k.0 != batch_id);
        st.finished.retain(|k, _| k.0 != batch_id);
        st.cancelled.retain(|k| k.0 != batch_id);
        let in_flight: Vec<ItemKey> = st
            .in_flight
            .iter()
            .filter(|k| k.0 == batch_id)
            .cloned()
            .collect();
        for key in in_flight {
            st.cancelled.insert(key);
        }
        info!(batch_id, "dispatch state removed");
    }

    /// Current queue and in-flight occupancy
    pub fn stats(&self) -> PoolStats {
        let st = self.state.lock();
        PoolStats {
            queued: st.queued.len(),
            in_flight: st.in_flight.len(),
            capacity: self.capacity.load(Ordering::SeqCst),
        }
    }

    /// Close the queue; workers finish what is queued and exit
    pub fn shutdown(&self) {
        self.queue_tx.lock().take();
        info!("summarization pool shutting down");
    }
}
