//! Sync task worker.
//!
//! This crate provides:
//! - One consumer pipeline per priority queue with bounded concurrency
//! - Redelivery, dead-lettering and stale delivery recovery
//! - The direct job pool for broker-less deployments
//! - Component supervision with restart backoff
//! - Health, readiness and Prometheus endpoints

pub mod config;
pub mod dispatch;
pub mod error;
pub mod fallback;
pub mod handlers;
pub mod health;
pub mod http_handler;
pub mod logging;
pub mod metrics;
pub mod pipeline;
pub mod retry;
pub mod supervisor;

pub use config::WorkerConfig;
pub use dispatch::{DispatchError, Dispatcher};
pub use error::{WorkerError, WorkerResult};
pub use fallback::{FallbackSettings, FallbackWorker, JobOutcome};
pub use handlers::{HandlerError, HandlerResult, HandlerTable, SyncHandler};
pub use health::{ComponentState, HealthRegistry};
pub use http_handler::HttpSyncHandler;
pub use logging::TaskLogger;
pub use pipeline::{ConsumerPipeline, Disposition, PipelineSettings};
pub use retry::Backoff;
pub use supervisor::{Component, Supervisor};
