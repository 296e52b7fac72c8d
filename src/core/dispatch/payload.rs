//! Partial scrape payloads and merge policy
//!
//! A source's transcript and its comments can finish independently and
//! arrive in either order; each arrival is a partial payload merged into
//! whatever is already stored. The merge is field-by-field, non-destructive
//! and idempotent: merging the same payload twice yields the same result
//! as merging it once.

use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

/// Partial scrape result for one item
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq)]
pub struct ScrapePayload {
    /// Source URL
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub url: Option<String>,
    /// Page or video title
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub title: Option<String>,
    /// Primary content (transcript, article body)
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub transcript: Option<String>,
    /// Secondary content (comments, replies)
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub comments: Vec<String>,
    /// Scraper-specific metadata
    #[serde(default, skip_serializing_if = "Map::is_empty")]
    pub metadata: Map<String, Value>,
}

impl ScrapePayload {
    /// Merge another partial payload into this one.
    ///
    /// Longer text wins over shorter text, the longer list wins over the
    /// shorter list, and metadata is shallow-merged with incoming values
    /// taking precedence while keys missing from the incoming payload keep
    /// their old value.
    pub fn merge(&mut self, incoming: &ScrapePayload) {
        merge_text(&mut self.url, &incoming.url);
        merge_text(&mut self.title, &incoming.title);
        merge_text(&mut self.transcript, &incoming.transcript);

        if incoming.comments.len() > self.comments.len() {
            self.comments = incoming.comments.clone();
        }

        for (key, value) in &incoming.metadata {
            self.metadata.insert(key.clone(), value.clone());
        }
    }

    /// Whether any content field carries data
    pub fn is_empty(&self) -> bool {
        self.url.is_none()
            && self.title.is_none()
            && self.transcript.is_none()
            && self.comments.is_empty()
            && self.metadata.is_empty()
    }
}

fn merge_text(current: &mut Option<String>, incoming: &Option<String>) {
    if let Some(incoming) = incoming {
        let longer = current
            .as_ref()
            .map(|c| incoming.len() > c.len())
            .unwrap_or(true);
        if longer {
            *current = Some(incoming.clone());
        }
    }
}
