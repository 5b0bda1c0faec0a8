//! Shared data models for the Streamix sync queue.
//!
//! This crate provides Serde-serializable types for:
//! - Task types and submission priorities
//! - The task envelope wire format
//! - Provider fan-out into independent sync tasks
//! - Sync summaries returned by handlers

pub mod envelope;
pub mod provider;
pub mod summary;
pub mod task;

// Re-export common types
pub use envelope::{EnvelopeError, TaskArgs, TaskEnvelope};
pub use provider::{GindexProvider, IptvProvider, Provider};
pub use summary::SyncSummary;
pub use task::{Priority, PriorityParseError, TaskType};
