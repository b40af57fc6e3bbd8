/// AlertWatch - scheduled alerting on event sources
///
/// Rules query an event source on a fixed period, group their matches into
/// batches and deliver each batch to a set of notifiers.
pub mod aggregation;
pub mod app;
pub mod cli;
pub mod config;
pub mod core;
pub mod dispatch;
pub mod error;
pub mod formatting;
pub mod internal_metrics;
pub mod notification;
pub mod rules;
pub mod scheduler;
pub mod source;
pub mod state;
pub mod task_manager;

// Re-export core types for convenience
pub use core::*;
