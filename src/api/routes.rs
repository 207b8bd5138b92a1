//! Request handlers.

use std::sync::Arc;

use axum::extract::{Path, Query, State};
use axum::http::StatusCode;
use axum::response::Json;
use chrono::Utc;
use serde::Deserialize;
use serde_json::{json, Value};
use tracing::warn;

use crate::db::{AlertRow, PositionRow};
use crate::dispatcher;
use crate::emergency;
use crate::models::NormalizedSignal;
use crate::AppState;

#[derive(Debug, Deserialize)]
pub struct LimitQuery {
    #[serde(default = "default_limit")]
    pub limit: usize,
}

fn default_limit() -> usize {
    50
}

/// POST /webhook: signal ingress. `{"ping":true}` answers `{"pong":true}`
/// without touching the database.
pub async fn webhook(
    State(state): State<Arc<AppState>>,
    Json(payload): Json<Value>,
) -> Result<Json<Value>, (StatusCode, Json<Value>)> {
    if payload.get("ping").and_then(Value::as_bool) == Some(true) {
        return Ok(Json(json!({"pong": true})));
    }

    let signal = NormalizedSignal::from_value(payload).map_err(|e| {
        warn!("webhook rejected: {e:#}");
        (
            StatusCode::BAD_REQUEST,
            Json(json!({"ok": false, "error": format!("{e:#}")})),
        )
    })?;

    let summary = dispatcher::dispatch_signal(state, signal).await;
    Ok(Json(json!({
        "ok": true,
        "users": summary.users,
        "executed": summary.executed,
        "ignored": summary.ignored,
        "errors": summary.errors,
    })))
}

/// GET /health
pub async fn health() -> Json<Value> {
    Json(json!({"status": "ok", "time": Utc::now().to_rfc3339()}))
}

/// GET /api/v1/positions?limit=N
pub async fn list_positions(
    State(state): State<Arc<AppState>>,
    Query(params): Query<LimitQuery>,
) -> Result<Json<Vec<PositionRow>>, StatusCode> {
    state
        .db
        .recent_positions(params.limit.min(500))
        .map(Json)
        .map_err(|_| StatusCode::INTERNAL_SERVER_ERROR)
}

/// GET /api/v1/alerts?limit=N
pub async fn list_alerts(
    State(state): State<Arc<AppState>>,
    Query(params): Query<LimitQuery>,
) -> Result<Json<Vec<AlertRow>>, StatusCode> {
    state
        .db
        .recent_alerts(params.limit.min(500))
        .map(Json)
        .map_err(|_| StatusCode::INTERNAL_SERVER_ERROR)
}

/// POST /api/v1/emergency/:user_id disables the bot and flattens everything.
pub async fn emergency(
    State(state): State<Arc<AppState>>,
    Path(user_id): Path<String>,
) -> Result<Json<Value>, (StatusCode, Json<Value>)> {
    match emergency::emergency_shutdown(&state, &user_id).await {
        Ok(report) => Ok(Json(json!({
            "ok": true,
            "closed": report.closed,
            "failed": report.failed,
        }))),
        Err(e) => Err((
            StatusCode::INTERNAL_SERVER_ERROR,
            Json(json!({"ok": false, "error": format!("{e:#}")})),
        )),
    }
}
