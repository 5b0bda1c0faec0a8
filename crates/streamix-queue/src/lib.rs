//! Sync task submission for Streamix.
//!
//! This crate provides:
//! - The submission facade with broker and direct execution paths
//! - Priority queues over Redis Streams, with an in-memory broker for tests
//! - Redelivery and dead-letter primitives used by the consumer pipeline
//! - A durable Postgres job store for the broker-less mode

pub mod broker;
pub mod config;
pub mod error;
pub mod job_store;
pub mod memory;
pub mod pg_store;
pub mod publisher;
pub mod redis_broker;
pub mod submit;

pub use broker::{BrokerStats, Delivery, MessageBroker};
pub use config::{redact_url, ExecutionMode, QueueConfig, QueueTopology};
pub use error::{QueueError, QueueResult};
pub use job_store::{JobCounts, JobId, JobRecord, JobState, JobStore, MemoryJobStore};
pub use memory::{DeadLetter, MemoryBroker, SentMessage};
pub use pg_store::PgJobStore;
pub use publisher::Publisher;
pub use redis_broker::RedisBroker;
pub use submit::{BrokerSubmitter, DirectSubmitter, SyncQueue, TaskSubmitter};
