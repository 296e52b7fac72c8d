//! Delivery gateway: per-batch pub/sub, cross-thread bridge, input broker
//!
//! Bridges the producer side of the pipeline (scrapers, workers, the
//! registry) to remote observers over long-lived subscriber streams.
//! Observers may connect after work has started (buffered replay) or
//! disconnect mid-stream (implicit disconnect on send failure).

pub mod bridge;
pub mod channel;
pub mod input;
pub mod types;

#[cfg(test)]
mod tests;

pub use bridge::GatewayBridge;
pub use channel::{DeliveryGateway, Subscription};
pub use input::InputBroker;
pub use types::{Envelope, kind};
