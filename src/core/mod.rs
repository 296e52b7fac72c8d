//! Core pipeline engine
//!
//! The concurrency and consistency engine: registry and completion
//! tracking, streaming dispatch to the worker pool, stall monitoring,
//! and the delivery gateway.

pub mod dispatch;
pub mod gateway;
pub mod monitor;
pub mod registry;
