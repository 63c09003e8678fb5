use std::net::SocketAddr;
use std::sync::Arc;

use anyhow::Context;
use axum::extract::State;
use axum::http::StatusCode;
use axum::{routing::get, Json, Router};
use serde_json::{json, Value};
use tokio_util::sync::CancellationToken;
use tracing::{error, info};

use crate::execution::ExecutionEngine;
use crate::scheduler::DispatchTelemetry;
use crate::traits::store_prelude::*;

/// Everything `/status` reports on.
#[derive(Clone)]
pub struct StatusState {
    pub instance_id: String,
    pub store: Arc<dyn StateStore>,
    pub engine: ExecutionEngine,
    pub telemetry: Arc<DispatchTelemetry>,
}

pub fn router(state: StatusState) -> Router {
    Router::new()
        .route("/health", get(health_handler))
        .route("/status", get(status_handler))
        .with_state(state)
}

/// Serve `/health` and `/status` until `shutdown` fires.
pub async fn start_health_server(
    bind: &str,
    port: u16,
    state: StatusState,
    shutdown: CancellationToken,
) -> anyhow::Result<()> {
    let addr: SocketAddr = format!("{}:{}", bind, port)
        .parse()
        .with_context(|| format!("invalid health bind address {}:{}", bind, port))?;
    let listener = tokio::net::TcpListener::bind(addr)
        .await
        .with_context(|| format!("binding health server to {}", addr))?;
    info!("Health server listening on {}", addr);

    axum::serve(listener, router(state))
        .with_graceful_shutdown(async move { shutdown.cancelled().await })
        .await?;
    Ok(())
}

async fn health_handler() -> Json<Value> {
    Json(json!({"status": "ok"}))
}

async fn status_handler(State(state): State<StatusState>) -> Result<Json<Value>, StatusCode> {
    let cron_jobs = state.store.list_cron_jobs().await.map_err(|e| {
        error!(error = %e, "Status: listing cron jobs failed");
        StatusCode::INTERNAL_SERVER_ERROR
    })?;
    let cron_jobs: Vec<Value> = cron_jobs
        .iter()
        .map(|job| {
            json!({
                "agent_id": job.agent_id,
                "enabled": job.enabled,
                "next_run_at_ms": job.next_run_at_ms,
                "last_run_at_ms": job.last_run_at_ms,
                "claimed_by": job.claimed_by,
                "claim_expires_at_ms": job.claim_expires_at_ms,
                "in_flight_run_key": job.in_flight_run_key,
                "failure_count": job.failure_count,
                "backoff_until_ms": job.backoff_until_ms,
                "last_error": job.last_error,
            })
        })
        .collect();

    Ok(Json(json!({
        "status": "ok",
        "instance_id": state.instance_id,
        "lanes": state.engine.lanes().get_lane_statuses(),
        "active_goals": state.engine.active_goal_ids().await,
        "dispatch": state.telemetry.snapshot(),
        "cron_jobs": cron_jobs,
    })))
}
