//! Wire envelope types for the delivery gateway

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

/// Known envelope type families
pub mod kind {
    pub const ITEM_PROGRESS: &str = "item-progress";
    pub const ITEM_STATUS: &str = "item-status";
    pub const BATCH_STATUS_SNAPSHOT: &str = "batch-status-snapshot";
    pub const BATCH_INITIALIZED: &str = "batch-initialized";
    pub const COMPLETION_CONFIRMED: &str = "completion-confirmed";
    pub const CANCELLATION_NOTICE: &str = "cancellation-notice";
    pub const USER_INPUT_REQUEST: &str = "user-input-request";
    pub const USER_INPUT_RESPONSE: &str = "user-input-response";
}

/// Transport-agnostic message envelope
///
/// Every message published to subscribers carries the same outer shape:
/// a type tag, the batch it belongs to, a timestamp, and type-specific
/// fields flattened into the top level.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct Envelope {
    /// Message type family
    #[serde(rename = "type")]
    pub kind: String,
    /// Batch this message belongs to
    pub batch_id: String,
    /// Publish timestamp
    pub timestamp: DateTime<Utc>,
    /// Type-specific fields
    #[serde(flatten)]
    pub fields: Map<String, Value>,
}

impl Envelope {
    /// Create an envelope with no type-specific fields
    pub fn new(kind: &str, batch_id: &str) -> Self {
        Self {
            kind: kind.to_string(),
            batch_id: batch_id.to_string(),
            timestamp: Utc::now(),
            fields: Map::new(),
        }
    }

    /// Attach a type-specific field
    pub fn with_field(mut self, key: &str, value: Value) -> Self {
        self.fields.insert(key.to_string(), value);
        self
    }

    /// Item progress update
    pub fn item_progress(
        batch_id: &str,
        item_id: &str,
        stage: &str,
        stage_progress: f64,
        overall_progress: f64,
        message: &str,
    ) -> Self {
        Self::new(kind::ITEM_PROGRESS, batch_id)
            .with_field("item_id", Value::from(item_id))
            .with_field("stage", Value::from(stage))
            .with_field("stage_progress", Value::from(stage_progress))
            .with_field("overall_progress", Value::from(overall_progress))
            .with_field("message", Value::from(message))
    }

    /// Item status transition
    pub fn item_status(
        batch_id: &str,
        item_id: &str,
        status: &str,
        error: Option<&str>,
    ) -> Self {
        let mut env = Self::new(kind::ITEM_STATUS, batch_id)
            .with_field("item_id", Value::from(item_id))
            .with_field("status", Value::from(status));
        if let Some(error) = error {
            env = env.with_field("error", Value::from(error));
        }
        env
    }

    /// Recomputed aggregate snapshot for a batch
    pub fn batch_snapshot(batch_id: &str, aggregate: Value) -> Self {
        Self::new(kind::BATCH_STATUS_SNAPSHOT, batch_id).with_field("aggregate", aggregate)
    }

    /// Batch registration announcement
    pub fn batch_initialized(batch_id: &str, expected_total: usize) -> Self {
        Self::new(kind::BATCH_INITIALIZED, batch_id)
            .with_field("expected_total", Value::from(expected_total))
    }

    /// Completion gate passed
    pub fn completion_confirmed(batch_id: &str, aggregate: Value) -> Self {
        Self::new(kind::COMPLETION_CONFIRMED, batch_id).with_field("aggregate", aggregate)
    }

    /// Item cancellation notice
    pub fn cancellation_notice(batch_id: &str, item_id: &str) -> Self {
        Self::new(kind::CANCELLATION_NOTICE, batch_id)
            .with_field("item_id", Value::from(item_id))
    }

    /// Client response to an input request, correlated by id
    pub fn user_input_response(batch_id: &str, correlation_id: &str, text: &str) -> Self {
        Self::new(kind::USER_INPUT_RESPONSE, batch_id)
            .with_field("correlation_id", Value::from(correlation_id))
            .with_field("text", Value::from(text))
    }

    /// Request for human input, correlated by id
    pub fn user_input_request(
        batch_id: &str,
        correlation_id: &str,
        prompt: &str,
        choices: Option<&[String]>,
    ) -> Self {
        let mut env = Self::new(kind::USER_INPUT_REQUEST, batch_id)
            .with_field("correlation_id", Value::from(correlation_id))
            .with_field("prompt", Value::from(prompt));
        if let Some(choices) = choices {
            env = env.with_field(
                "choices",
                Value::from(choices.iter().map(|c| Value::from(c.as_str())).collect::<Vec<_>>()),
            );
        }
        env
    }
}
