//! Streaming dispatcher and summarization worker pool
//!
//! Merges out-of-order partial scrape results and feeds each item to the
//! bounded worker pool with at-most-once processing.

mod payload;
mod pool;


pub use payload::ScrapePayload;
pub use pool::{DrainOutcome, FinishedItem, PoolStats, SummaryPool, Summarizer};
