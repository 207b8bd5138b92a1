//! HTTP surface: the signal webhook plus a handful of operator endpoints.

mod routes;

use std::sync::Arc;

use axum::routing::{get, post};
use axum::Router;
use tower_http::cors::CorsLayer;
use tower_http::trace::TraceLayer;

use crate::AppState;

pub fn router(state: Arc<AppState>) -> Router {
    Router::new()
        .route("/webhook", post(routes::webhook))
        .route("/health", get(routes::health))
        .route("/api/v1/positions", get(routes::list_positions))
        .route("/api/v1/alerts", get(routes::list_alerts))
        .route("/api/v1/emergency/:user_id", post(routes::emergency))
        .layer(TraceLayer::new_for_http())
        .layer(CorsLayer::permissive())
        .with_state(state)
}
