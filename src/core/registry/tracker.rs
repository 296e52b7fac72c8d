//! Batch/item registry and completion tracker
//!
//! Authoritative per-batch, per-item state. Producers report progress and
//! status here; the worker pool writes terminal results back here; the
//! delivery gateway receives throttled progress events and recomputed
//! aggregate snapshots. Each batch has its own coordinating lock, held only
//! for map-sized operations and never across a publish.

use super::types::{
    BatchAggregate, CompletionCheck, ItemSnapshot, ItemSpec, ItemStateRecord, ItemStatus,
};
use crate::config::ThrottleConfig;
use crate::core::gateway::{Envelope, GatewayBridge};
use crate::utils::error::{PipelineError, Result};
use dashmap::DashMap;
use parking_lot::Mutex;
use serde_json::{Map, Value};
use std::collections::HashMap;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tracing::{debug, error, info, warn};

/// Per-batch state behind the batch's coordinating lock
struct BatchState {
    expected_total: usize,
    items: HashMap<String, ItemStateRecord>,
    last_snapshot_bucket: i64,
}

impl BatchState {
    fn mean_progress(&self) -> f64 {
        if self.items.is_empty() {
            return 0.0;
        }
        self.items.values().map(|r| r.overall_progress).sum::<f64>() / self.items.len() as f64
    }
}

/// Authoritative registry of batches and their items
pub struct BatchRegistry {
    batches: DashMap<String, Arc<Mutex<BatchState>>>,
    bridge: Arc<GatewayBridge>,
    throttle: ThrottleConfig,
}

impl BatchRegistry {
    /// Create a registry publishing through the given bridge
    pub fn new(bridge: Arc<GatewayBridge>, throttle: ThrottleConfig) -> Self {
        Self {
            batches: DashMap::new(),
            bridge,
            throttle,
        }
    }

    /// Register the expected item set for a batch.
    ///
    /// Sets the immutable `expected_total` exactly once. A second call for
    /// the same batch is a logged no-op, never an overwrite. An empty item
    /// list against a batch that already has registered items is a
    /// consistency error, not a reset to zero.
    pub fn register_expected(&self, batch_id: &str, items: &[ItemSpec]) -> Result<()> {
        if items.is_empty() {
            if let Some(state) = self.batch_state(batch_id) {
                let registered = state.lock().items.len();
                if registered > 0 {
                    error!(
                        batch_id,
                        registered,
                        "empty registration against a batch with registered items, refusing"
                    );
                    return Err(PipelineError::Consistency(format!(
                        "batch {} already has {} registered items",
                        batch_id, registered
                    )));
                }
            }
            return Err(PipelineError::Validation(format!(
                "cannot register batch {} with an empty item list",
                batch_id
            )));
        }

        match self.batches.entry(batch_id.to_string()) {
            dashmap::mapref::entry::Entry::Occupied(entry) => {
                let expected = entry.get().lock().expected_total;
                warn!(
                    batch_id,
                    expected_total = expected,
                    attempted = items.len(),
                    "expected_total already set, ignoring re-registration"
                );
                Ok(())
            }
            dashmap::mapref::entry::Entry::Vacant(entry) => {
                let records: HashMap<String, ItemStateRecord> = items
                    .iter()
                    .map(|spec| (spec.item_id.clone(), ItemStateRecord::new(spec)))
                    .collect();
                let expected_total = records.len();
                entry.insert(Arc::new(Mutex::new(BatchState {
                    expected_total,
                    items: records,
                    last_snapshot_bucket: 0,
                })));
                info!(batch_id, expected_total, "batch registered");
                let _ = self
                    .bridge
                    .publish(batch_id, Envelope::batch_initialized(batch_id, expected_total));
                Ok(())
            }
        }
    }

    /// Record a progress update for a registered item.
    ///
    /// Emits an item-progress envelope when the throttle allows: overall
    /// progress moved by the configured delta since the last emit, the
    /// minimum interval elapsed, or progress reached 100. Crossing an
    /// aggregate progress bucket additionally publishes a recomputed
    /// batch snapshot. Updates for unregistered items are dropped loudly.
    #[allow(clippy::too_many_arguments)]
    pub fn record_progress(
        &self,
        batch_id: &str,
        item_id: &str,
        stage: &str,
        stage_progress: f64,
        overall_progress: f64,
        message: &str,
        metadata: Option<Map<String, Value>>,
    ) -> Result<()> {
        let state = self.require_batch(batch_id)?;
        let mut to_publish: Vec<Envelope> = Vec::new();

        {
            let mut st = state.lock();
            let Some(record) = st.items.get_mut(item_id) else {
                warn!(batch_id, item_id, "progress event for unregistered item dropped");
                return Err(PipelineError::Consistency(format!(
                    "item {} is not registered in batch {}",
                    item_id, batch_id
                )));
            };
            if record.status.is_terminal() {
                debug!(batch_id, item_id, "progress after terminal state ignored");
                return Ok(());
            }

            let now = chrono::Utc::now();
            if record.stage != stage {
                record.stage = stage.to_string();
                record.stage_entered_at = now;
            }
            if record.status == ItemStatus::Pending {
                record.status = ItemStatus::InProgress;
            }
            record.stage_progress = stage_progress;
            record.overall_progress = overall_progress;
            record.message = message.to_string();
            if let Some(metadata) = metadata {
                for (key, value) in metadata {
                    record.metadata.insert(key, value);
                }
            }
            record.updated_at = now;

            let interval = Duration::from_millis(self.throttle.min_emit_interval_ms);
            let moved =
                (record.overall_progress - record.last_emit_progress).abs()
                    >= self.throttle.min_emit_delta_pp;
            let due = record
                .last_emit_at
                .map(|t| t.elapsed() >= interval)
                .unwrap_or(true);
            let finished = record.overall_progress >= 100.0;

            if moved || due || finished {
                record.last_emit_at = Some(Instant::now());
                record.last_emit_progress = record.overall_progress;
                to_publish.push(Envelope::item_progress(
                    batch_id,
                    item_id,
                    stage,
                    stage_progress,
                    overall_progress,
                    message,
                ));
            }

            let bucket =
                (st.mean_progress() / self.throttle.snapshot_bucket_pp).floor() as i64;
            if bucket != st.last_snapshot_bucket {
                st.last_snapshot_bucket = bucket;
                let aggregate = Self::aggregate_locked(batch_id, &st);
                to_publish.push(Self::snapshot_envelope(batch_id, &aggregate));
            }
        }

        for envelope in to_publish {
            let _ = self.bridge.publish(batch_id, envelope);
        }
        Ok(())
    }

    /// Record a status transition for a registered item.
    ///
    /// Completed forces overall progress to 100; Failed forces it to 0 and
    /// stores the error. Terminal states never regress: a late update against
    /// a terminal item is dropped with a warning. Every accepted status
    /// change publishes the item-status event and a recomputed snapshot;
    /// terminal events are never throttled.
    pub fn record_status(
        &self,
        batch_id: &str,
        item_id: &str,
        status: ItemStatus,
        error: Option<String>,
        metadata: Option<Map<String, Value>>,
    ) -> Result<()> {
        let state = self.require_batch(batch_id)?;
        let mut to_publish: Vec<Envelope> = Vec::new();

        {
            let mut st = state.lock();
            let Some(record) = st.items.get_mut(item_id) else {
                warn!(batch_id, item_id, "status event for unregistered item dropped");
                return Err(PipelineError::Consistency(format!(
                    "item {} is not registered in batch {}",
                    item_id, batch_id
                )));
            };
            if record.status.is_terminal() {
                if record.status != status {
                    warn!(
                        batch_id,
                        item_id,
                        current = record.status.as_str(),
                        attempted = status.as_str(),
                        "status regression from terminal state ignored"
                    );
                }
                return Ok(());
            }

            let now = chrono::Utc::now();
            record.status = status;
            record.updated_at = now;
            match status {
                ItemStatus::Completed => {
                    record.overall_progress = 100.0;
                    record.stage_progress = 100.0;
                }
                ItemStatus::Failed => {
                    record.overall_progress = 0.0;
                    record.error = error.clone();
                }
                _ => {}
            }
            if let Some(metadata) = metadata {
                for (key, value) in metadata {
                    record.metadata.insert(key, value);
                }
            }

            to_publish.push(Envelope::item_status(
                batch_id,
                item_id,
                status.as_str(),
                error.as_deref(),
            ));

            st.last_snapshot_bucket =
                (st.mean_progress() / self.throttle.snapshot_bucket_pp).floor() as i64;
            let aggregate = Self::aggregate_locked(batch_id, &st);
            to_publish.push(Self::snapshot_envelope(batch_id, &aggregate));
        }

        for envelope in to_publish {
            let _ = self.bridge.publish(batch_id, envelope);
        }
        Ok(())
    }

    /// Compute the aggregate view of a batch.
    ///
    /// A registered count exceeding the expected total is flagged as an
    /// anomaly in the result and logged, never auto-corrected.
    pub fn compute_aggregate(&self, batch_id: &str) -> Result<BatchAggregate> {
        let state = self.require_batch(batch_id)?;
        let st = state.lock();
        Ok(Self::aggregate_locked(batch_id, &st))
    }

    /// Strict completion gate.
    ///
    /// Confirmed iff registered == expected, every item is terminal, and the
    /// completion rate reached 1.0. On failure the non-terminal items are
    /// returned so callers can log or retry instead of polling blindly.
    pub fn confirm_complete(&self, batch_id: &str) -> Result<CompletionCheck> {
        let state = self.require_batch(batch_id)?;
        let st = state.lock();
        let aggregate = Self::aggregate_locked(batch_id, &st);

        let non_terminal: Vec<String> = st
            .items
            .values()
            .filter(|r| !r.status.is_terminal())
            .map(|r| r.item_id.clone())
            .collect();

        let confirmed = aggregate.registered_count == aggregate.expected_total
            && non_terminal.is_empty()
            && aggregate.completion_rate >= 1.0;

        if !confirmed {
            debug!(
                batch_id,
                non_terminal = non_terminal.len(),
                completion_rate = aggregate.completion_rate,
                "completion not confirmed"
            );
        }

        Ok(CompletionCheck {
            confirmed,
            non_terminal,
            aggregate,
        })
    }

    /// Current record for one item, if registered
    pub fn get_record(&self, batch_id: &str, item_id: &str) -> Option<ItemStateRecord> {
        let state = self.batch_state(batch_id)?;
        let st = state.lock();
        st.items.get(item_id).cloned()
    }

    /// Whether an item was registered for this batch
    pub fn is_registered(&self, batch_id: &str, item_id: &str) -> bool {
        self.batch_state(batch_id)
            .map(|state| state.lock().items.contains_key(item_id))
            .unwrap_or(false)
    }

    /// Read-only item views for the stall monitor
    pub fn snapshot(&self, batch_id: &str) -> Vec<ItemSnapshot> {
        let Some(state) = self.batch_state(batch_id) else {
            return Vec::new();
        };
        let st = state.lock();
        st.items
            .values()
            .map(|r| ItemSnapshot {
                item_id: r.item_id.clone(),
                stage: r.stage.clone(),
                status: r.status,
                overall_progress: r.overall_progress,
                stage_entered_at: r.stage_entered_at,
            })
            .collect()
    }

    /// All known batch ids
    pub fn batch_ids(&self) -> Vec<String> {
        self.batches.iter().map(|e| e.key().clone()).collect()
    }

    /// Drop a batch and all of its item state.
    ///
    /// Called once the consumer phase has moved past the batch; subsequent
    /// events for it are rejected as unknown.
    pub fn remove_batch(&self, batch_id: &str) -> Result<()> {
        match self.batches.remove(batch_id) {
            Some(_) => {
                info!(batch_id, "batch removed");
                Ok(())
            }
            None => Err(PipelineError::NotFound(format!(
                "batch {} is not registered",
                batch_id
            ))),
        }
    }

    /// Update an item's stage label without emitting progress.
    ///
    /// Used by the dispatcher when moving items through queued/summarizing
    /// so the stall monitor sees accurate stage entry times.
    pub(crate) fn mark_stage(&self, batch_id: &str, item_id: &str, stage: &str) {
        if let Some(state) = self.batch_state(batch_id) {
            let mut st = state.lock();
            if let Some(record) = st.items.get_mut(item_id) {
                if record.status.is_terminal() || record.stage == stage {
                    return;
                }
                let now = chrono::Utc::now();
                record.stage = stage.to_string();
                record.stage_entered_at = now;
                record.updated_at = now;
                if record.status == ItemStatus::Pending {
                    record.status = ItemStatus::InProgress;
                }
            }
        }
    }

    /// Insert an item record past the registration gate, bypassing the
    /// expected-total bookkeeping
    #[cfg(test)]
    pub(crate) fn inject_item(&self, batch_id: &str, spec: &ItemSpec) {
        if let Some(state) = self.batch_state(batch_id) {
            let mut st = state.lock();
            st.items
                .insert(spec.item_id.clone(), ItemStateRecord::new(spec));
        }
    }

    fn batch_state(&self, batch_id: &str) -> Option<Arc<Mutex<BatchState>>> {
        self.batches.get(batch_id).map(|e| Arc::clone(e.value()))
    }

    fn require_batch(&self, batch_id: &str) -> Result<Arc<Mutex<BatchState>>> {
        self.batch_state(batch_id).ok_or_else(|| {
            warn!(batch_id, "event for unknown batch dropped");
            PipelineError::NotFound(format!("batch {} is not registered", batch_id))
        })
    }

    fn aggregate_locked(batch_id: &str, st: &BatchState) -> BatchAggregate {
        let mut completed = 0;
        let mut failed = 0;
        let mut in_progress = 0;
        let mut pending = 0;
        for record in st.items.values() {
            match record.status {
                ItemStatus::Completed => completed += 1,
                ItemStatus::Failed => failed += 1,
                ItemStatus::InProgress => in_progress += 1,
                ItemStatus::Pending => pending += 1,
            }
        }

        let registered_count = st.items.len();
        let anomaly = registered_count > st.expected_total;
        if anomaly {
            error!(
                batch_id,
                registered_count,
                expected_total = st.expected_total,
                "registered count exceeds expected total, likely duplicate registration"
            );
        }

        let completion_rate = if st.expected_total > 0 {
            (completed + failed) as f64 / st.expected_total as f64
        } else {
            0.0
        };

        BatchAggregate {
            batch_id: batch_id.to_string(),
            expected_total: st.expected_total,
            registered_count,
            completed,
            failed,
            in_progress,
            pending,
            completion_rate,
            is_complete: completion_rate >= 1.0,
            anomaly,
        }
    }

    fn snapshot_envelope(batch_id: &str, aggregate: &BatchAggregate) -> Envelope {
        let value = serde_json::to_value(aggregate).unwrap_or(Value::Null);
        Envelope::batch_snapshot(batch_id, value)
    }
}
