//! Sync handler contract and the dispatch table.

use std::collections::HashMap;
use std::sync::Arc;

use async_trait::async_trait;
use streamix_models::{SyncSummary, TaskArgs, TaskType};
use thiserror::Error;

use crate::error::{WorkerError, WorkerResult};

/// Failure reported by a sync handler.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
#[error("{reason}")]
pub struct HandlerError {
    pub reason: String,
}

impl HandlerError {
    pub fn new(reason: impl Into<String>) -> Self {
        Self {
            reason: reason.into(),
        }
    }
}

pub type HandlerResult = Result<SyncSummary, HandlerError>;

/// A downstream sync routine.
///
/// Handlers must tolerate being called more than once with the same
/// arguments: a message that fails is redelivered.
#[async_trait]
pub trait SyncHandler: Send + Sync + 'static {
    async fn handle(&self, args: &TaskArgs) -> HandlerResult;
}

/// Immutable map from every task type to its handler.
#[derive(Clone)]
pub struct HandlerTable {
    handlers: HashMap<TaskType, Arc<dyn SyncHandler>>,
}

impl HandlerTable {
    pub fn builder() -> HandlerTableBuilder {
        HandlerTableBuilder::default()
    }

    /// Route every task type to the same handler.
    pub fn uniform(handler: Arc<dyn SyncHandler>) -> Self {
        Self {
            handlers: TaskType::ALL
                .iter()
                .map(|t| (*t, Arc::clone(&handler)))
                .collect(),
        }
    }

    pub fn get(&self, task_type: TaskType) -> Option<&Arc<dyn SyncHandler>> {
        self.handlers.get(&task_type)
    }
}

#[derive(Default)]
pub struct HandlerTableBuilder {
    handlers: HashMap<TaskType, Arc<dyn SyncHandler>>,
    duplicates: Vec<TaskType>,
}

impl HandlerTableBuilder {
    pub fn register(mut self, task_type: TaskType, handler: Arc<dyn SyncHandler>) -> Self {
        if self.handlers.insert(task_type, handler).is_some() {
            self.duplicates.push(task_type);
        }
        self
    }

    /// Finish the table. Fails unless each task type has exactly one handler.
    pub fn build(self) -> WorkerResult<HandlerTable> {
        if !self.duplicates.is_empty() {
            return Err(WorkerError::handler_table(format!(
                "registered more than once: {}",
                join_types(&self.duplicates)
            )));
        }

        let missing: Vec<TaskType> = TaskType::ALL
            .iter()
            .copied()
            .filter(|t| !self.handlers.contains_key(t))
            .collect();
        if !missing.is_empty() {
            return Err(WorkerError::handler_table(format!(
                "no handler for: {}",
                join_types(&missing)
            )));
        }

        Ok(HandlerTable {
            handlers: self.handlers,
        })
    }
}

fn join_types(types: &[TaskType]) -> String {
    types
        .iter()
        .map(TaskType::as_str)
        .collect::<Vec<_>>()
        .join(", ")
}
