//! Health endpoint.
//!
//! `GET /healthcheck` reports the last executed task and queue gauges. The
//! worker counts as unhealthy when requests are waiting and nothing was
//! executed for longer than the configured idle limit.

use std::sync::Arc;
use std::time::Duration;

use axum::extract::State;
use axum::response::IntoResponse;
use axum::routing::get;
use axum::{Json, Router};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tokio::net::TcpListener;
use tokio::sync::RwLock;
use tracing::info;

use crate::worker::publisher::DoneTasks;

/// The most recent task whose result was stored.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct LastExecutedTask {
    pub request_id: u64,
    pub timestamp: DateTime<Utc>,
}

/// Body of a `/healthcheck` response.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct HealthReport {
    pub last_executed_task: Option<LastExecutedTask>,
    pub seconds_since_last_task: Option<i64>,
    pub pending_tasks: usize,
    pub executing_tasks: usize,
    pub done_tasks: usize,
    pub is_healthy: bool,
}

#[derive(Debug, Default)]
struct Gauges {
    last_executed: Option<LastExecutedTask>,
    pending: usize,
    executing: usize,
}

/// Health state shared between the scheduler and the HTTP server.
#[derive(Clone)]
pub struct HealthState {
    gauges: Arc<RwLock<Gauges>>,
    done_tasks: DoneTasks,
    max_idle: Duration,
    started_at: DateTime<Utc>,
}

impl HealthState {
    pub fn new(done_tasks: DoneTasks, max_idle: Duration) -> Self {
        Self {
            gauges: Arc::new(RwLock::new(Gauges::default())),
            done_tasks,
            max_idle,
            started_at: Utc::now(),
        }
    }

    pub async fn set_last_executed(&self, request_id: u64) {
        self.gauges.write().await.last_executed = Some(LastExecutedTask {
            request_id,
            timestamp: Utc::now(),
        });
    }

    pub async fn set_queue_gauges(&self, pending: usize, executing: usize) {
        let mut gauges = self.gauges.write().await;
        gauges.pending = pending;
        gauges.executing = executing;
    }

    pub async fn last_executed(&self) -> Option<LastExecutedTask> {
        self.gauges.read().await.last_executed.clone()
    }

    pub async fn report(&self) -> HealthReport {
        let gauges = self.gauges.read().await;
        let now = Utc::now();
        let seconds_since_last_task = gauges
            .last_executed
            .as_ref()
            .map(|last| (now - last.timestamp).num_seconds());

        let idle_since = gauges
            .last_executed
            .as_ref()
            .map_or(self.started_at, |last| last.timestamp);
        let idle = (now - idle_since).to_std().unwrap_or_default();
        let is_healthy = gauges.pending == 0 || idle <= self.max_idle;

        HealthReport {
            last_executed_task: gauges.last_executed.clone(),
            seconds_since_last_task,
            pending_tasks: gauges.pending,
            executing_tasks: gauges.executing,
            done_tasks: self.done_tasks.len().await,
            is_healthy,
        }
    }
}

/// Router exposing `/healthcheck`.
pub fn health_routes(state: HealthState) -> Router {
    Router::new()
        .route("/healthcheck", get(healthcheck))
        .with_state(state)
}

async fn healthcheck(State(state): State<HealthState>) -> impl IntoResponse {
    Json(state.report().await)
}

/// Serve the health endpoint on `0.0.0.0:port` until the task is dropped.
pub async fn serve(port: u16, state: HealthState) -> std::io::Result<()> {
    let listener = TcpListener::bind(("0.0.0.0", port)).await?;
    info!("Health endpoint listening on http://0.0.0.0:{port}/healthcheck");
    axum::serve(listener, health_routes(state)).await
}
