//! Health and readiness endpoints.

use std::collections::BTreeMap;
use std::net::SocketAddr;
use std::sync::Arc;

use axum::extract::State;
use axum::http::StatusCode;
use axum::routing::get;
use axum::{Json, Router};
use chrono::{DateTime, Utc};
use metrics_exporter_prometheus::PrometheusHandle;
use serde::Serialize;
use tokio::sync::{watch, RwLock};
use tracing::info;

use crate::error::WorkerResult;

/// Lifecycle state of a supervised component.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum ComponentState {
    Starting,
    Running,
    Restarting,
    Stopped,
}

impl ComponentState {
    pub fn as_str(&self) -> &'static str {
        match self {
            ComponentState::Starting => "starting",
            ComponentState::Running => "running",
            ComponentState::Restarting => "restarting",
            ComponentState::Stopped => "stopped",
        }
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct ComponentHealth {
    pub state: ComponentState,
    pub restarts: u32,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub last_error: Option<String>,
    pub since: DateTime<Utc>,
}

/// Shared record of component states.
#[derive(Debug, Clone, Default)]
pub struct HealthRegistry {
    components: Arc<RwLock<BTreeMap<String, ComponentHealth>>>,
}

impl HealthRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub async fn set_state(&self, component: &str, state: ComponentState) {
        let mut components = self.components.write().await;
        let entry = components
            .entry(component.to_string())
            .or_insert_with(|| ComponentHealth {
                state,
                restarts: 0,
                last_error: None,
                since: Utc::now(),
            });
        if entry.state != state {
            entry.state = state;
            entry.since = Utc::now();
        }
    }

    pub async fn record_restart(&self, component: &str, error: &str) {
        self.set_state(component, ComponentState::Restarting).await;
        if let Some(entry) = self.components.write().await.get_mut(component) {
            entry.restarts += 1;
            entry.last_error = Some(error.to_string());
        }
    }

    pub async fn snapshot(&self) -> BTreeMap<String, ComponentHealth> {
        self.components.read().await.clone()
    }

    /// True when at least one component is registered and all are running.
    pub async fn is_ready(&self) -> bool {
        let components = self.components.read().await;
        !components.is_empty()
            && components
                .values()
                .all(|c| c.state == ComponentState::Running)
    }
}

/// Health response.
#[derive(Serialize)]
pub struct HealthResponse {
    pub status: String,
    pub version: String,
    pub timestamp: String,
}

/// Liveness probe.
pub async fn health() -> Json<HealthResponse> {
    Json(HealthResponse {
        status: "healthy".to_string(),
        version: env!("CARGO_PKG_VERSION").to_string(),
        timestamp: Utc::now().to_rfc3339(),
    })
}

#[derive(Serialize)]
pub struct ReadinessResponse {
    pub status: String,
    pub components: BTreeMap<String, ComponentHealth>,
}

/// Readiness probe: 503 unless every component is running.
pub async fn ready(
    State(registry): State<HealthRegistry>,
) -> Result<Json<ReadinessResponse>, (StatusCode, Json<ReadinessResponse>)> {
    let ready = registry.is_ready().await;
    let response = ReadinessResponse {
        status: if ready { "ready" } else { "degraded" }.to_string(),
        components: registry.snapshot().await,
    };

    if ready {
        Ok(Json(response))
    } else {
        Err((StatusCode::SERVICE_UNAVAILABLE, Json(response)))
    }
}

pub fn create_router(registry: HealthRegistry, metrics_handle: Option<PrometheusHandle>) -> Router {
    let health_routes = Router::new()
        .route("/health", get(health))
        .route("/healthz", get(health))
        .route("/ready", get(ready))
        .with_state(registry);

    let metrics_routes = match metrics_handle {
        Some(handle) => Router::new().route("/metrics", get(move || async move { handle.render() })),
        None => Router::new(),
    };

    health_routes.merge(metrics_routes)
}

/// Serve the health router until `shutdown` flips to true.
pub async fn serve(
    addr: SocketAddr,
    router: Router,
    mut shutdown: watch::Receiver<bool>,
) -> WorkerResult<()> {
    let listener = tokio::net::TcpListener::bind(addr).await?;
    info!("Health server listening on {}", addr);

    axum::serve(listener, router)
        .with_graceful_shutdown(async move {
            while !*shutdown.borrow() {
                if shutdown.changed().await.is_err() {
                    break;
                }
            }
        })
        .await?;

    Ok(())
}
