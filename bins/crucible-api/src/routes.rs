use std::sync::Arc;

use axum::routing::{get, post};
use axum::Router;

use crate::{handlers, AppState};

pub fn routes() -> Router<Arc<AppState>> {
    Router::new()
        .route("/health", get(handlers::health_check))
        .route("/api/v1/executions", post(handlers::submit_execution))
        .route("/api/v1/executions/:id", get(handlers::get_execution))
        .route(
            "/api/v1/executions/:id/cancel",
            post(handlers::cancel_execution),
        )
        .route("/api/v1/quota/:user_id", get(handlers::get_quota))
}
