//! Component supervision.
//!
//! Each long-running component (one consumer pipeline per priority, or the
//! direct job pool) runs in its own task. A component that returns or
//! panics before shutdown is restarted with exponential backoff.

use std::sync::Arc;
use std::time::Instant;

use async_trait::async_trait;
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tracing::{error, info, warn};

use crate::error::WorkerResult;
use crate::health::{ComponentState, HealthRegistry};
use crate::metrics;
use crate::retry::Backoff;

/// A supervised long-running loop.
#[async_trait]
pub trait Component: Send + Sync + 'static {
    fn name(&self) -> String;

    /// Run until `shutdown` flips to true. Returning early counts as a crash.
    async fn run(&self, shutdown: watch::Receiver<bool>) -> WorkerResult<()>;
}

pub struct Supervisor {
    health: HealthRegistry,
    backoff: Backoff,
    shutdown: watch::Sender<bool>,
    tasks: Vec<JoinHandle<()>>,
}

impl Supervisor {
    pub fn new(health: HealthRegistry, backoff: Backoff) -> Self {
        let (shutdown, _) = watch::channel(false);
        Self {
            health,
            backoff,
            shutdown,
            tasks: Vec::new(),
        }
    }

    /// Start supervising a component.
    pub fn spawn(&mut self, component: Arc<dyn Component>) {
        let health = self.health.clone();
        let backoff = self.backoff;
        let shutdown = self.shutdown.subscribe();

        self.tasks
            .push(tokio::spawn(supervise(component, health, backoff, shutdown)));
    }

    pub fn subscribe(&self) -> watch::Receiver<bool> {
        self.shutdown.subscribe()
    }

    /// Signal shutdown to every component.
    pub fn shutdown(&self) {
        let _ = self.shutdown.send(true);
    }

    /// Wait for every supervised component to stop.
    pub async fn wait(self) {
        for result in futures::future::join_all(self.tasks).await {
            if let Err(e) = result {
                error!("Supervisor task failed: {}", e);
            }
        }
    }

    pub fn health(&self) -> &HealthRegistry {
        &self.health
    }
}

async fn supervise(
    component: Arc<dyn Component>,
    health: HealthRegistry,
    backoff: Backoff,
    mut shutdown: watch::Receiver<bool>,
) {
    let name = component.name();
    let mut restarts = 0u32;

    health.set_state(&name, ComponentState::Starting).await;

    loop {
        health.set_state(&name, ComponentState::Running).await;
        let started = Instant::now();

        let handle = {
            let component = Arc::clone(&component);
            let shutdown = shutdown.clone();
            tokio::spawn(async move { component.run(shutdown).await })
        };
        let result = handle.await;

        if *shutdown.borrow() {
            if let Ok(Err(e)) = &result {
                warn!(component = %name, "Component stopped with error: {}", e);
            }
            break;
        }

        let reason = match result {
            Ok(Ok(())) => "exited unexpectedly".to_string(),
            Ok(Err(e)) => e.to_string(),
            Err(e) => format!("panicked: {}", e),
        };

        // A component that stayed up longer than the backoff cap is healthy again.
        if started.elapsed() > backoff.max {
            restarts = 0;
        }
        let delay = backoff.delay_for_attempt(restarts);
        restarts += 1;

        error!(
            component = %name,
            restarts,
            "Component crashed, restarting in {:?}: {}",
            delay, reason
        );
        health.record_restart(&name, &reason).await;
        metrics::record_component_restart(&name);

        tokio::select! {
            _ = tokio::time::sleep(delay) => {}
            _ = shutdown.changed() => {}
        }
        if *shutdown.borrow() {
            break;
        }
    }

    health.set_state(&name, ComponentState::Stopped).await;
    info!(component = %name, "Component stopped");
}
