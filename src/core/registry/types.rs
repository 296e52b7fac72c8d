//! Registry types and data structures

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use std::str::FromStr;
use std::time::Instant;

/// Canonical item status
///
/// Producers report status as free-form strings with inconsistent spelling
/// ("in_progress", "in-progress", "InProgress"); normalization happens once
/// at the boundary via [`FromStr`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ItemStatus {
    /// Registered, no work observed yet
    Pending,
    /// At least one producer or worker is acting on the item
    InProgress,
    /// Terminal: summarization finished
    Completed,
    /// Terminal: scrape or summarization failed (includes cancellation)
    Failed,
}

impl ItemStatus {
    /// Whether no further transitions occur from this status
    pub fn is_terminal(&self) -> bool {
        matches!(self, ItemStatus::Completed | ItemStatus::Failed)
    }

    /// Canonical wire spelling
    pub fn as_str(&self) -> &'static str {
        match self {
            ItemStatus::Pending => "pending",
            ItemStatus::InProgress => "in_progress",
            ItemStatus::Completed => "completed",
            ItemStatus::Failed => "failed",
        }
    }
}

impl FromStr for ItemStatus {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let normalized: String = s
            .trim()
            .to_ascii_lowercase()
            .chars()
            .filter(|c| c.is_ascii_alphanumeric())
            .collect();
        match normalized.as_str() {
            "pending" => Ok(ItemStatus::Pending),
            "inprogress" => Ok(ItemStatus::InProgress),
            "completed" | "complete" => Ok(ItemStatus::Completed),
            "failed" | "failure" => Ok(ItemStatus::Failed),
            _ => Err(format!("unknown item status: {:?}", s)),
        }
    }
}

/// One source unit submitted at batch registration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ItemSpec {
    /// Item id, unique within the process
    pub item_id: String,
    /// Source URL
    pub url: String,
}

impl ItemSpec {
    /// Convenience constructor
    pub fn new(item_id: &str, url: &str) -> Self {
        Self {
            item_id: item_id.to_string(),
            url: url.to_string(),
        }
    }
}

/// Current state of one item
#[derive(Debug, Clone, Serialize)]
pub struct ItemStateRecord {
    /// Item id
    pub item_id: String,
    /// Source URL
    pub url: String,
    /// Free-form stage label (loading, scraping, summarizing, ...)
    pub stage: String,
    /// Canonical status
    pub status: ItemStatus,
    /// Progress within the current stage, 0..=100
    pub stage_progress: f64,
    /// Overall progress across all stages, 0..=100
    pub overall_progress: f64,
    /// Last human-readable progress message
    pub message: String,
    /// Error detail for a failed item
    pub error: Option<String>,
    /// Producer-supplied metadata, shallow-merged across updates
    pub metadata: Map<String, Value>,
    /// Record creation time
    pub created_at: DateTime<Utc>,
    /// Last mutation time
    pub updated_at: DateTime<Utc>,
    /// When the item entered its current stage
    pub stage_entered_at: DateTime<Utc>,
    /// Last progress emit, for throttling
    #[serde(skip)]
    pub last_emit_at: Option<Instant>,
    /// Overall progress at the last emit
    #[serde(skip)]
    pub last_emit_progress: f64,
}

impl ItemStateRecord {
    pub(crate) fn new(spec: &ItemSpec) -> Self {
        let now = Utc::now();
        Self {
            item_id: spec.item_id.clone(),
            url: spec.url.clone(),
            stage: "pending".to_string(),
            status: ItemStatus::Pending,
            stage_progress: 0.0,
            overall_progress: 0.0,
            message: String::new(),
            error: None,
            metadata: Map::new(),
            created_at: now,
            updated_at: now,
            stage_entered_at: now,
            last_emit_at: None,
            last_emit_progress: 0.0,
        }
    }
}

/// Aggregate view of one batch
///
/// Raw counters are always exposed alongside derived rates so a consumer can
/// detect disagreement instead of trusting a single number.
#[derive(Debug, Clone, Serialize, PartialEq)]
pub struct BatchAggregate {
    /// Batch id
    pub batch_id: String,
    /// Immutable denominator fixed at registration
    pub expected_total: usize,
    /// Items actually registered
    pub registered_count: usize,
    /// Items in terminal Completed state
    pub completed: usize,
    /// Items in terminal Failed state
    pub failed: usize,
    /// Items currently in progress
    pub in_progress: usize,
    /// Items not yet started
    pub pending: usize,
    /// (completed + failed) / expected_total
    pub completion_rate: f64,
    /// completion_rate reached 1.0
    pub is_complete: bool,
    /// registered_count exceeds expected_total; indicates a duplicate
    /// registration bug upstream and is never auto-corrected
    pub anomaly: bool,
}

/// Result of the strict completion gate
#[derive(Debug, Clone, Serialize)]
pub struct CompletionCheck {
    /// True iff registered == expected, all items terminal, rate >= 1.0
    pub confirmed: bool,
    /// Items still in a non-terminal state, for logging and retry decisions
    pub non_terminal: Vec<String>,
    /// The aggregate the decision was based on
    pub aggregate: BatchAggregate,
}

/// Read-only per-item view handed to the stall monitor
#[derive(Debug, Clone)]
pub struct ItemSnapshot {
    /// Item id
    pub item_id: String,
    /// Current stage label
    pub stage: String,
    /// Canonical status
    pub status: ItemStatus,
    /// Overall progress, 0..=100
    pub overall_progress: f64,
    /// When the item entered its current stage
    pub stage_entered_at: DateTime<Utc>,
}
