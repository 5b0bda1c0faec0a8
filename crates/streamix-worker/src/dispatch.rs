//! Decoding and dispatch of task payloads.
//!
//! Shared by the broker pipeline and the direct job pool so both paths
//! classify failures the same way.

use std::any::Any;
use std::panic::AssertUnwindSafe;
use std::sync::Arc;
use std::time::{Duration, Instant};

use futures::FutureExt;
use streamix_models::{EnvelopeError, SyncSummary, TaskArgs, TaskEnvelope};
use thiserror::Error;

use crate::handlers::{HandlerError, HandlerTable};
use crate::metrics;

#[derive(Debug, Error)]
pub enum DispatchError {
    /// Payload is not a task envelope.
    #[error("decode_error: {0}")]
    Decode(EnvelopeError),

    /// Envelope carries a tag outside the handler table.
    #[error("unknown_task_type: {0}")]
    UnknownTaskType(String),

    /// Known task type, unusable arguments.
    #[error("invalid_arguments: {0}")]
    InvalidArguments(EnvelopeError),

    #[error("handler_error: {0}")]
    Handler(#[from] HandlerError),

    #[error("timeout: handler did not finish within {0:?}")]
    Timeout(Duration),
}

impl DispatchError {
    /// The same bytes can never succeed; retrying is pointless.
    pub fn is_permanent(&self) -> bool {
        matches!(
            self,
            DispatchError::Decode(_) | DispatchError::InvalidArguments(_)
        )
    }

    /// True when the handler was actually called.
    pub fn reached_handler(&self) -> bool {
        matches!(self, DispatchError::Handler(_) | DispatchError::Timeout(_))
    }
}

/// Decode a raw payload. Unknown tags decode fine and fail at dispatch.
pub fn decode(payload: &str) -> Result<TaskEnvelope, DispatchError> {
    TaskEnvelope::decode(payload).map_err(DispatchError::Decode)
}

/// Routes envelopes to their handler under a hard timeout.
#[derive(Clone)]
pub struct Dispatcher {
    table: Arc<HandlerTable>,
    task_timeout: Duration,
}

impl Dispatcher {
    pub fn new(table: Arc<HandlerTable>, task_timeout: Duration) -> Self {
        Self {
            table,
            task_timeout,
        }
    }

    /// Invoke the handler for `envelope` exactly once.
    ///
    /// On timeout the handler future is dropped, which cancels it at its
    /// next await point. A panicking handler counts as a handler error.
    pub async fn dispatch(&self, envelope: &TaskEnvelope) -> Result<SyncSummary, DispatchError> {
        let kind = envelope.kind().map_err(|e| match e {
            EnvelopeError::UnknownTaskType(tag) => DispatchError::UnknownTaskType(tag),
            other => DispatchError::Decode(other),
        })?;

        let handler = self
            .table
            .get(kind)
            .ok_or_else(|| DispatchError::UnknownTaskType(kind.to_string()))?;

        let args = TaskArgs::from_envelope(envelope).map_err(DispatchError::InvalidArguments)?;

        let started = Instant::now();
        let call = AssertUnwindSafe(handler.handle(&args)).catch_unwind();
        let result = tokio::time::timeout(self.task_timeout, call).await;
        metrics::record_task_duration(kind.as_str(), started.elapsed().as_secs_f64());

        match result {
            Ok(Ok(Ok(summary))) => Ok(summary),
            Ok(Ok(Err(e))) => Err(DispatchError::Handler(e)),
            Ok(Err(panic)) => Err(DispatchError::Handler(HandlerError::new(format!(
                "handler panicked: {}",
                panic_message(panic.as_ref())
            )))),
            Err(_) => Err(DispatchError::Timeout(self.task_timeout)),
        }
    }

    pub fn task_timeout(&self) -> Duration {
        self.task_timeout
    }
}

fn panic_message(panic: &(dyn Any + Send)) -> &str {
    panic
        .downcast_ref::<&str>()
        .copied()
        .or_else(|| panic.downcast_ref::<String>().map(String::as_str))
        .unwrap_or("non-string panic payload")
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::handlers::{HandlerResult, SyncHandler};
    use async_trait::async_trait;
    use std::sync::atomic::{AtomicU32, Ordering};
    use streamix_models::TaskType;

    #[derive(Default)]
    struct Counting {
        calls: AtomicU32,
    }

    #[async_trait]
    impl SyncHandler for Counting {
        async fn handle(&self, args: &TaskArgs) -> HandlerResult {
            self.calls.fetch_add(1, Ordering::SeqCst);
            Ok(SyncSummary::new().with_count("provider", args.provider_id as u64))
        }
    }

    struct Sleepy;

    #[async_trait]
    impl SyncHandler for Sleepy {
        async fn handle(&self, _args: &TaskArgs) -> HandlerResult {
            tokio::time::sleep(Duration::from_secs(60)).await;
            Ok(SyncSummary::new())
        }
    }

    struct Exploding;

    #[async_trait]
    impl SyncHandler for Exploding {
        async fn handle(&self, args: &TaskArgs) -> HandlerResult {
            panic!("catalog row for provider {} is corrupt", args.provider_id);
        }
    }

    fn envelope_for(task_type: TaskType) -> TaskEnvelope {
        if task_type.requires_path() {
            TaskEnvelope::for_folder(task_type, 5, "/0:/Media/")
        } else {
            TaskEnvelope::for_provider(task_type, 5)
        }
    }

    fn dispatcher(handler: Arc<dyn SyncHandler>, timeout: Duration) -> Dispatcher {
        Dispatcher::new(Arc::new(HandlerTable::uniform(handler)), timeout)
    }

    #[tokio::test]
    async fn test_dispatch_calls_handler_once() {
        let handler = Arc::new(Counting::default());
        let dispatcher = dispatcher(handler.clone(), Duration::from_secs(5));

        let envelope = decode(r#"{"type":"iptv_live","provider_id":42}"#).unwrap();
        let summary = dispatcher.dispatch(&envelope).await.unwrap();

        assert_eq!(summary.get("provider"), Some(42));
        assert_eq!(handler.calls.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn test_unknown_type_skips_handlers() {
        let handler = Arc::new(Counting::default());
        let dispatcher = dispatcher(handler.clone(), Duration::from_secs(5));

        let envelope = decode(r#"{"type":"iptv_radio","provider_id":1}"#).unwrap();
        let err = dispatcher.dispatch(&envelope).await.unwrap_err();

        assert!(matches!(err, DispatchError::UnknownTaskType(ref t) if t == "iptv_radio"));
        assert!(!err.is_permanent());
        assert!(err.to_string().starts_with("unknown_task_type"));
        assert_eq!(handler.calls.load(Ordering::SeqCst), 0);
    }

    #[tokio::test]
    async fn test_missing_path_is_permanent() {
        let handler = Arc::new(Counting::default());
        let dispatcher = dispatcher(handler.clone(), Duration::from_secs(5));

        let envelope = decode(r#"{"type":"gindex_movies","provider_id":1}"#).unwrap();
        let err = dispatcher.dispatch(&envelope).await.unwrap_err();

        assert!(matches!(err, DispatchError::InvalidArguments(_)));
        assert!(err.is_permanent());
        assert_eq!(handler.calls.load(Ordering::SeqCst), 0);
    }

    #[test]
    fn test_decode_rejects_malformed_payloads() {
        for raw in ["not json", "[]", r#"{"provider_id":1}"#, r#"{"type":7}"#, r#"{"type":""}"#] {
            let err = decode(raw).unwrap_err();
            assert!(err.is_permanent(), "{raw} should be permanent");
        }
    }

    #[tokio::test(start_paused = true)]
    async fn test_timeout_cancels_handler() {
        let dispatcher = dispatcher(Arc::new(Sleepy), Duration::from_secs(1));
        let envelope = TaskEnvelope::for_provider(TaskType::IptvSeries, 3);

        let err = dispatcher.dispatch(&envelope).await.unwrap_err();

        assert!(matches!(err, DispatchError::Timeout(_)));
        assert!(err.reached_handler());
        assert!(!err.is_permanent());
    }

    #[tokio::test]
    async fn test_dispatch_routes_each_type_to_its_own_handler() {
        let counters: Vec<(TaskType, Arc<Counting>)> = TaskType::ALL
            .iter()
            .map(|t| (*t, Arc::new(Counting::default())))
            .collect();

        let table = counters
            .iter()
            .fold(HandlerTable::builder(), |builder, (task_type, handler)| {
                builder.register(*task_type, handler.clone())
            })
            .build()
            .unwrap();
        let dispatcher = Dispatcher::new(Arc::new(table), Duration::from_secs(5));

        for (i, task_type) in TaskType::ALL.iter().enumerate() {
            dispatcher.dispatch(&envelope_for(*task_type)).await.unwrap();

            for (j, (other, handler)) in counters.iter().enumerate() {
                let expected = u32::from(j <= i);
                assert_eq!(
                    handler.calls.load(Ordering::SeqCst),
                    expected,
                    "{} handler after dispatching {}",
                    other,
                    task_type
                );
            }
        }
    }

    #[tokio::test]
    async fn test_panicking_handler_is_a_handler_error() {
        let dispatcher = dispatcher(Arc::new(Exploding), Duration::from_secs(5));
        let envelope = TaskEnvelope::for_provider(TaskType::IptvMovies, 11);

        let err = dispatcher.dispatch(&envelope).await.unwrap_err();

        assert!(matches!(err, DispatchError::Handler(_)));
        assert!(err.reached_handler());
        assert!(!err.is_permanent());
        assert!(err.to_string().contains("provider 11 is corrupt"), "{err}");
    }
}
