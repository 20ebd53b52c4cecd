//! HTTP surface implementing the task-handler contract. The status codes are
//! semantic signals to the task transport (some are retried, some are not),
//! so they come straight from [`AuditError::http_status`] and must not drift.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::SystemTime;

use axum::{
    extract::{Query, State},
    http::StatusCode,
    response::IntoResponse,
    routing::{get, post},
    Json, Router,
};
use log::{info, warn};
use tokio::sync::mpsc::UnboundedReceiver;

use crate::config::Snapshot;
use crate::sched::{self, TaskQueue};
use crate::task::{self, Deps, TaskContext};

#[derive(Clone)]
pub struct App {
    pub deps: Deps,
    pub snapshot: Arc<Snapshot>,
    pub queue: Arc<dyn TaskQueue>,
}

pub fn router(app: App) -> Router {
    Router::new()
        .route("/healthz", get(healthz))
        .route("/metrics", get(metrics))
        .route("/sched/tick", post(tick))
        .route("/task/audit", post(audit))
        .with_state(app)
}

async fn healthz() -> &'static str {
    "ok\n"
}

async fn metrics(State(app): State<App>) -> impl IntoResponse {
    Json(app.deps.metrics.snapshot())
}

async fn tick(State(app): State<App>) -> StatusCode {
    sched::tick(&app.snapshot, &app.deps, &app.queue, SystemTime::now()).await;
    StatusCode::OK
}

async fn audit(
    State(app): State<App>,
    Query(params): Query<HashMap<String, String>>,
) -> impl IntoResponse {
    let Some(ref_url) = params.get("ref") else {
        return (StatusCode::BAD_REQUEST, "missing ref parameter\n".to_owned());
    };
    let (status, body) = handle_audit(&app, ref_url).await;
    (
        StatusCode::from_u16(status).unwrap_or(StatusCode::INTERNAL_SERVER_ERROR),
        body,
    )
}

/// Runs one audit task and renders the transport-facing status and body.
/// Shared between the HTTP handler and the in-process queue consumer.
pub async fn handle_audit(app: &App, ref_url: &str) -> (u16, String) {
    let ctx = TaskContext::with_budget(app.snapshot.tuning.task_budget);
    match task::audit_ref(&ctx, &app.deps, &app.snapshot, ref_url).await {
        Ok(summary) => (
            200,
            format!(
                "{} new relevant, {} audited{}\n",
                summary.new_relevant,
                summary.audited,
                if summary.truncated { ", truncated" } else { "" }
            ),
        ),
        Err(e) => {
            warn!("{}: audit task failed: {}", ref_url, e);
            (e.http_status(), format!("{}\n", e))
        }
    }
}

/// Drains the in-process task queue for the lifetime of the service.
pub async fn serve_queue(mut rx: UnboundedReceiver<String>, app: App) {
    while let Some(uri) = rx.recv().await {
        handle_task_uri(&app, &uri).await;
    }
}

pub async fn handle_task_uri(app: &App, uri: &str) {
    let Some(ref_url) = sched::ref_from_task_uri(uri) else {
        warn!("dropping malformed task uri {:?}", uri);
        return;
    };
    let (status, body) = handle_audit(app, &ref_url).await;
    info!("task {} -> {} ({})", uri, status, body.trim());
}
