//! Human-in-the-loop request/response correlation
//!
//! A worker asking for input publishes a `user-input-request` envelope and
//! waits on a single-slot channel keyed by a generated correlation id. The
//! delivery side fulfills it with [`InputBroker::deliver_response`] when the
//! client answers. Responses that match no pending id exactly fall back to a
//! prefix match (the trailing disambiguating suffix stripped), taking the
//! lexicographically latest candidate. The fallback is a best-effort recovery
//! path, not the primary contract, and is always logged.

use super::bridge::GatewayBridge;
use super::types::Envelope;
use crate::config::GatewayConfig;
use crate::utils::error::{PipelineError, Result};
use dashmap::DashMap;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::oneshot;
use tracing::{debug, warn};
use uuid::Uuid;

/// Correlates blocking input requests with asynchronously arriving responses
pub struct InputBroker {
    bridge: Arc<GatewayBridge>,
    pending: DashMap<String, oneshot::Sender<String>>,
    timeout: Duration,
}

impl InputBroker {
    /// Create a broker publishing requests through the given bridge
    pub fn new(bridge: Arc<GatewayBridge>, config: &GatewayConfig) -> Self {
        Self {
            bridge,
            pending: DashMap::new(),
            timeout: Duration::from_secs(config.input_timeout_secs),
        }
    }

    /// Publish an input request and wait for the correlated response.
    ///
    /// The wait is bounded by the configured input timeout; on expiry the
    /// pending slot is removed and a Timeout error returned.
    pub async fn request_input(
        &self,
        batch_id: &str,
        prompt: &str,
        choices: Option<&[String]>,
    ) -> Result<String> {
        let correlation_id = format!("input-{}", Uuid::new_v4());
        let (tx, rx) = oneshot::channel();
        self.pending.insert(correlation_id.clone(), tx);

        let envelope = Envelope::user_input_request(batch_id, &correlation_id, prompt, choices);
        if let Err(e) = self.bridge.publish(batch_id, envelope) {
            self.pending.remove(&correlation_id);
            return Err(e);
        }
        debug!(batch_id, correlation_id, "input request published, waiting");

        match tokio::time::timeout(self.timeout, rx).await {
            Ok(Ok(text)) => Ok(text),
            Ok(Err(_)) => {
                // Sender dropped without a response
                Err(PipelineError::Delivery(format!(
                    "input request {} abandoned",
                    correlation_id
                )))
            }
            Err(_) => {
                self.pending.remove(&correlation_id);
                Err(PipelineError::Timeout(format!(
                    "no response to input request {} within {:?}",
                    correlation_id, self.timeout
                )))
            }
        }
    }

    /// Fulfill a pending input request.
    ///
    /// Exact correlation-id match first; otherwise a prefix-based fallback:
    /// the trailing `-suffix` segment is stripped and the lexicographically
    /// latest pending id sharing the prefix is taken.
    pub fn deliver_response(&self, correlation_id: &str, text: &str) -> Result<()> {
        if let Some((_, tx)) = self.pending.remove(correlation_id) {
            return tx.send(text.to_string()).map_err(|_| {
                PipelineError::Delivery(format!(
                    "requester for {} no longer waiting",
                    correlation_id
                ))
            });
        }

        let fallback = self.prefix_fallback(correlation_id);
        match fallback {
            Some(candidate) => {
                warn!(
                    requested = correlation_id,
                    matched = %candidate,
                    "no exact correlation match, using prefix fallback"
                );
                let (_, tx) = self
                    .pending
                    .remove(&candidate)
                    .ok_or_else(|| PipelineError::NotFound(candidate.clone()))?;
                tx.send(text.to_string()).map_err(|_| {
                    PipelineError::Delivery(format!("requester for {} no longer waiting", candidate))
                })
            }
            None => Err(PipelineError::NotFound(format!(
                "no pending input request matches {}",
                correlation_id
            ))),
        }
    }

    /// Number of requests currently awaiting a response
    pub fn pending_count(&self) -> usize {
        self.pending.len()
    }

    fn prefix_fallback(&self, correlation_id: &str) -> Option<String> {
        let prefix = correlation_id
            .rsplit_once('-')
            .map(|(head, _)| head)
            .unwrap_or(correlation_id);

        self.pending
            .iter()
            .map(|entry| entry.key().clone())
            .filter(|key| key.starts_with(prefix))
            .max()
    }
}
