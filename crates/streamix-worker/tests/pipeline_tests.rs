//! Consumer pipeline tests against the in-memory broker.

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use serde_json::json;
use tokio::sync::{watch, Mutex};

use streamix_models::{GindexProvider, IptvProvider, Priority, Provider, SyncSummary, TaskArgs, TaskType};
use streamix_queue::{BrokerStats, MemoryBroker, MessageBroker, Publisher, QueueTopology, SyncQueue};
use streamix_worker::{
    Backoff, ConsumerPipeline, Dispatcher, HandlerError, HandlerResult, HandlerTable,
    HealthRegistry, PipelineSettings, Supervisor, SyncHandler,
};

const NORMAL: &str = "streamix.sync.normal";

/// Records every call and the peak number of concurrent calls.
#[derive(Default)]
struct Recording {
    calls: Mutex<Vec<TaskArgs>>,
    running: AtomicUsize,
    peak: AtomicUsize,
    hold: Duration,
    /// Fail the first call for each distinct argument set
    fail_first: bool,
}

impl Recording {
    fn holding(hold: Duration) -> Self {
        Self {
            hold,
            ..Default::default()
        }
    }

    async fn calls(&self) -> Vec<TaskArgs> {
        self.calls.lock().await.clone()
    }
}

#[async_trait]
impl SyncHandler for Recording {
    async fn handle(&self, args: &TaskArgs) -> HandlerResult {
        let running = self.running.fetch_add(1, Ordering::SeqCst) + 1;
        self.peak.fetch_max(running, Ordering::SeqCst);

        let seen_before = {
            let mut calls = self.calls.lock().await;
            let seen = calls.contains(args);
            calls.push(args.clone());
            seen
        };

        tokio::time::sleep(self.hold).await;
        self.running.fetch_sub(1, Ordering::SeqCst);

        if self.fail_first && !seen_before {
            Err(HandlerError::new("provider returned 502"))
        } else {
            Ok(SyncSummary::new().with_count("movies", 1))
        }
    }
}

fn settings(concurrency: usize) -> PipelineSettings {
    PipelineSettings {
        concurrency,
        max_deliveries: 2,
        fetch_block: Duration::from_millis(20),
        claim_interval: Duration::from_secs(60),
        claim_min_idle: Duration::from_secs(300),
        shutdown_timeout: Duration::from_secs(5),
    }
}

fn pipeline(
    broker: Arc<MemoryBroker>,
    handler: Arc<dyn SyncHandler>,
    priority: Priority,
    concurrency: usize,
) -> ConsumerPipeline {
    let dispatcher = Dispatcher::new(
        Arc::new(HandlerTable::uniform(handler)),
        Duration::from_secs(5),
    );
    ConsumerPipeline::new(
        broker,
        dispatcher,
        &QueueTopology::default(),
        priority,
        "it",
        settings(concurrency),
    )
}

async fn wait_for<F>(broker: &MemoryBroker, what: &str, condition: F)
where
    F: Fn(BrokerStats) -> bool,
{
    let waited = tokio::time::timeout(Duration::from_secs(10), async {
        while !condition(broker.stats().await) {
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
    })
    .await;
    assert!(waited.is_ok(), "timed out waiting for {}", what);
}

#[tokio::test]
async fn test_every_message_handled_once_within_concurrency_bound() {
    let broker = Arc::new(MemoryBroker::new());
    let handler = Arc::new(Recording::holding(Duration::from_millis(30)));
    let pipeline = pipeline(broker.clone(), handler.clone(), Priority::Normal, 3);

    for id in 0..20 {
        broker
            .send(NORMAL, &json!({ "type": "iptv_live", "provider_id": id }).to_string(), 1)
            .await
            .unwrap();
    }

    let (tx, rx) = watch::channel(false);
    let running = tokio::spawn({
        let pipeline = pipeline.clone();
        async move { pipeline.run(rx).await }
    });

    wait_for(&broker, "all messages acked", |s| s.acked == 20).await;
    tx.send(true).unwrap();
    running.await.unwrap().unwrap();

    let calls = handler.calls().await;
    assert_eq!(calls.len(), 20);
    let mut ids: Vec<i64> = calls.iter().map(|a| a.provider_id).collect();
    ids.sort_unstable();
    ids.dedup();
    assert_eq!(ids.len(), 20);

    assert!(handler.peak.load(Ordering::SeqCst) <= 3);
    assert_eq!(broker.stats().await.requeued, 0);
    assert_eq!(broker.pending_count().await, 0);
}

#[tokio::test]
async fn test_transient_failure_is_redelivered_once() {
    let broker = Arc::new(MemoryBroker::new());
    let handler = Arc::new(Recording {
        fail_first: true,
        ..Default::default()
    });
    let pipeline = pipeline(broker.clone(), handler.clone(), Priority::Normal, 2);

    broker
        .send(
            NORMAL,
            r#"{"type":"gindex_movies","provider_id":7,"path":"/1:/Filmes/"}"#,
            1,
        )
        .await
        .unwrap();

    let (tx, rx) = watch::channel(false);
    let running = tokio::spawn({
        let pipeline = pipeline.clone();
        async move { pipeline.run(rx).await }
    });

    wait_for(&broker, "redelivery acked", |s| s.acked == 1).await;
    tx.send(true).unwrap();
    running.await.unwrap().unwrap();

    let stats = broker.stats().await;
    assert_eq!(stats.requeued, 1);
    assert_eq!(stats.dead_lettered, 0);

    let calls = handler.calls().await;
    assert_eq!(calls.len(), 2);
    assert_eq!(calls[0], calls[1]);
    assert_eq!(calls[0].path.as_deref(), Some("/1:/Filmes/"));
}

#[tokio::test]
async fn test_malformed_message_does_not_stop_the_pipeline() {
    let broker = Arc::new(MemoryBroker::new());
    let handler = Arc::new(Recording::default());
    let pipeline = pipeline(broker.clone(), handler.clone(), Priority::Normal, 1);

    broker.send(NORMAL, "not json at all", 1).await.unwrap();
    broker.send(NORMAL, r#"{"provider_id":1}"#, 1).await.unwrap();
    broker
        .send(NORMAL, r#"{"type":"iptv_series","provider_id":3}"#, 1)
        .await
        .unwrap();

    let (tx, rx) = watch::channel(false);
    let running = tokio::spawn({
        let pipeline = pipeline.clone();
        async move { pipeline.run(rx).await }
    });

    wait_for(&broker, "all three settled", |s| s.acked == 1 && s.dead_lettered == 2).await;
    tx.send(true).unwrap();
    running.await.unwrap().unwrap();

    let dead = broker.dead_letters(pipeline.dead_letter_queue()).await;
    assert_eq!(dead.len(), 2);
    assert!(dead.iter().all(|d| d.reason.starts_with("decode_error")));
    assert_eq!(dead[0].payload, "not json at all");

    let calls = handler.calls().await;
    assert_eq!(calls.len(), 1);
    assert_eq!(calls[0].task_type, TaskType::IptvSeries);
}

#[tokio::test]
async fn test_shutdown_waits_for_in_flight_handlers() {
    let broker = Arc::new(MemoryBroker::new());
    let handler = Arc::new(Recording::holding(Duration::from_millis(200)));
    let pipeline = pipeline(broker.clone(), handler.clone(), Priority::High, 2);

    broker
        .send(
            "streamix.sync.high",
            r#"{"type":"iptv_movies","provider_id":9}"#,
            1,
        )
        .await
        .unwrap();

    let (tx, rx) = watch::channel(false);
    let running = tokio::spawn({
        let pipeline = pipeline.clone();
        async move { pipeline.run(rx).await }
    });

    wait_for(&broker, "handler started", |s| s.delivered == 1).await;
    assert_eq!(broker.stats().await.acked, 0);
    tx.send(true).unwrap();
    running.await.unwrap().unwrap();

    assert_eq!(pipeline.in_flight(), 0);
    assert_eq!(broker.stats().await.acked, 1);
    assert_eq!(broker.pending_count().await, 0);
}

#[tokio::test]
async fn test_submitted_fan_out_runs_on_supervised_pipelines() {
    let broker = Arc::new(MemoryBroker::new());
    let handler = Arc::new(Recording::default());
    let topology = QueueTopology::default();

    let queue = SyncQueue::broker(Publisher::new(broker.clone(), topology.clone()));
    let gindex = Provider::Gindex(
        GindexProvider::new(7)
            .with_movies_path("/1:/Filmes/")
            .with_series_path("/1:/Series/"),
    );
    queue.enqueue_provider_sync(&gindex).await.unwrap();
    queue
        .enqueue_provider_sync_with_priority(&Provider::Iptv(IptvProvider::new(42)), Priority::High)
        .await
        .unwrap();
    assert_eq!(broker.sent().await.len(), 6);

    let health = HealthRegistry::new();
    let mut supervisor = Supervisor::new(health.clone(), Backoff::default());
    for priority in Priority::ALL.iter().copied() {
        supervisor.spawn(Arc::new(pipeline(
            broker.clone(),
            handler.clone(),
            priority,
            2,
        )));
    }

    wait_for(&broker, "fan-out acked", |s| s.acked == 6).await;
    assert!(health.is_ready().await);

    supervisor.shutdown();
    supervisor.wait().await;

    for name in topology.queue_names() {
        assert_eq!(broker.depth(&name).await.unwrap(), 0, "{} not drained", name);
    }

    let calls = handler.calls().await;
    let iptv = calls.iter().filter(|a| a.provider_id == 42).count();
    let gindex = calls.iter().filter(|a| a.provider_id == 7).count();
    assert_eq!((iptv, gindex), (4, 2));
    assert!(!health.is_ready().await);
}

#[tokio::test]
async fn test_unknown_type_goes_to_dead_letter_after_redelivery() {
    let broker = Arc::new(MemoryBroker::new());
    let handler = Arc::new(Recording::default());
    let pipeline = pipeline(broker.clone(), handler.clone(), Priority::Low, 1);

    broker
        .send(
            "streamix.sync.low",
            r#"{"type":"iptv_radio","provider_id":1}"#,
            1,
        )
        .await
        .unwrap();

    let (tx, rx) = watch::channel(false);
    let running = tokio::spawn({
        let pipeline = pipeline.clone();
        async move { pipeline.run(rx).await }
    });

    wait_for(&broker, "dead-lettered", |s| s.dead_lettered == 1).await;
    tx.send(true).unwrap();
    running.await.unwrap().unwrap();

    let dead = broker.dead_letters("streamix.sync.low.dead").await;
    assert_eq!(dead.len(), 1);
    assert_eq!(dead[0].attempt, 2);
    assert!(dead[0].reason.starts_with("unknown_task_type"));
    assert!(handler.calls().await.is_empty());
    assert_eq!(broker.stats().await.requeued, 1);
}

/// Upserts one catalog row per provider, like the real sync routines.
#[derive(Default)]
struct Upserting {
    rows: Mutex<std::collections::BTreeMap<i64, u64>>,
    calls: AtomicUsize,
}

#[async_trait]
impl SyncHandler for Upserting {
    async fn handle(&self, args: &TaskArgs) -> HandlerResult {
        self.calls.fetch_add(1, Ordering::SeqCst);
        self.rows.lock().await.insert(args.provider_id, 10);
        Ok(SyncSummary::new().with_count("live_channels", 10))
    }
}

#[tokio::test]
async fn test_duplicate_delivery_leaves_same_state() {
    let body = r#"{"type":"iptv_live","provider_id":42}"#;

    let once = Arc::new(Upserting::default());
    let twice = Arc::new(Upserting::default());

    for (handler, copies) in [(once.clone(), 1), (twice.clone(), 2)] {
        let broker = Arc::new(MemoryBroker::new());
        for _ in 0..copies {
            broker.send(NORMAL, body, 1).await.unwrap();
        }

        let pipeline = pipeline(broker.clone(), handler, Priority::Normal, 2);
        let (tx, rx) = watch::channel(false);
        let running = tokio::spawn({
            let pipeline = pipeline.clone();
            async move { pipeline.run(rx).await }
        });

        wait_for(&broker, "copies acked", move |s| s.acked == copies).await;
        tx.send(true).unwrap();
        running.await.unwrap().unwrap();
    }

    assert_eq!(once.calls.load(Ordering::SeqCst), 1);
    assert_eq!(twice.calls.load(Ordering::SeqCst), 2);
    assert_eq!(*once.rows.lock().await, *twice.rows.lock().await);
}

/// Panics on every call.
#[derive(Default)]
struct Panicking {
    calls: AtomicUsize,
}

#[async_trait]
impl SyncHandler for Panicking {
    async fn handle(&self, args: &TaskArgs) -> HandlerResult {
        self.calls.fetch_add(1, Ordering::SeqCst);
        panic!("unexpected catalog state for provider {}", args.provider_id);
    }
}

fn fast_recovery_pipeline(broker: Arc<MemoryBroker>, handler: Arc<dyn SyncHandler>) -> ConsumerPipeline {
    let dispatcher = Dispatcher::new(
        Arc::new(HandlerTable::uniform(handler)),
        Duration::from_secs(5),
    );
    ConsumerPipeline::new(
        broker,
        dispatcher,
        &QueueTopology::default(),
        Priority::Normal,
        "it",
        PipelineSettings {
            claim_interval: Duration::from_millis(10),
            claim_min_idle: Duration::from_millis(30),
            ..settings(2)
        },
    )
}

#[tokio::test]
async fn test_panicking_handler_is_dead_lettered_after_one_redelivery() {
    let broker = Arc::new(MemoryBroker::new());
    let handler = Arc::new(Panicking::default());
    let pipeline = fast_recovery_pipeline(broker.clone(), handler.clone());

    broker
        .send(NORMAL, r#"{"type":"iptv_series","provider_id":4}"#, 1)
        .await
        .unwrap();

    let (tx, rx) = watch::channel(false);
    let running = tokio::spawn({
        let pipeline = pipeline.clone();
        async move { pipeline.run(rx).await }
    });

    wait_for(&broker, "dead-lettered", |s| s.dead_lettered == 1).await;
    // Several claim intervals: nothing may come back.
    tokio::time::sleep(Duration::from_millis(200)).await;
    tx.send(true).unwrap();
    running.await.unwrap().unwrap();

    assert_eq!(handler.calls.load(Ordering::SeqCst), 2);
    let stats = broker.stats().await;
    assert_eq!(stats.requeued, 1);
    assert_eq!(stats.acked, 0);
    assert_eq!(broker.pending_count().await, 0);

    let dead = broker.dead_letters(pipeline.dead_letter_queue()).await;
    assert_eq!(dead.len(), 1);
    assert_eq!(dead[0].attempt, 2);
    assert!(dead[0].reason.contains("handler panicked"), "{}", dead[0].reason);
}

#[tokio::test]
async fn test_orphaned_final_delivery_is_dead_lettered_without_running() {
    let broker = Arc::new(MemoryBroker::new());
    let handler = Arc::new(Recording::default());
    let pipeline = fast_recovery_pipeline(broker.clone(), handler.clone());

    // A redelivery whose consumer died mid-handler.
    broker
        .send(NORMAL, r#"{"type":"iptv_live","provider_id":8}"#, 2)
        .await
        .unwrap();
    let orphaned = broker
        .fetch(NORMAL, "crashed", 1, Duration::from_millis(10))
        .await
        .unwrap();
    assert_eq!(orphaned.len(), 1);

    let (tx, rx) = watch::channel(false);
    let running = tokio::spawn({
        let pipeline = pipeline.clone();
        async move { pipeline.run(rx).await }
    });

    wait_for(&broker, "orphan dead-lettered", |s| s.dead_lettered == 1).await;
    tx.send(true).unwrap();
    running.await.unwrap().unwrap();

    assert!(handler.calls().await.is_empty());
    let dead = broker.dead_letters(pipeline.dead_letter_queue()).await;
    assert_eq!(dead[0].attempt, 3);
    assert!(dead[0].reason.starts_with("delivery_limit_exceeded"));
    assert_eq!(broker.pending_count().await, 0);
}

#[tokio::test]
async fn test_shutdown_interrupts_outage_backoff() {
    let broker = Arc::new(MemoryBroker::new());
    let pipeline = pipeline(broker.clone(), Arc::new(Recording::default()), Priority::Normal, 1);
    broker.ensure_queue(NORMAL).await.unwrap();

    let (tx, rx) = watch::channel(false);
    let running = tokio::spawn({
        let pipeline = pipeline.clone();
        async move { pipeline.run(rx).await }
    });

    // Three failed fetches put the loop into a two second backoff.
    tokio::time::sleep(Duration::from_millis(50)).await;
    broker.set_unavailable(true).await;
    tokio::time::sleep(Duration::from_millis(1700)).await;

    tx.send(true).unwrap();
    tokio::time::timeout(Duration::from_millis(500), running)
        .await
        .expect("shutdown waited for the backoff")
        .unwrap()
        .unwrap();
}
