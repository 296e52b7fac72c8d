//! Batch/item registry and completion tracking
//!
//! Authoritative state for every batch and item in flight: who was
//! registered, how far along each item is, and whether a batch is
//! consistently, fully finished.

mod tracker;
mod types;


pub use tracker::BatchRegistry;
pub use types::{
    BatchAggregate, CompletionCheck, ItemSnapshot, ItemSpec, ItemStateRecord, ItemStatus,
};
