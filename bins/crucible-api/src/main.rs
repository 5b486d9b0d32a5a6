mod handlers;
mod routes;

use std::sync::Arc;

use axum::Router;
use redis::aio::ConnectionManager;
use tokio::net::TcpListener;
use tracing::info;

use crucible_common::profiles::ProfileRegistry;

#[derive(Clone)]
pub struct AppState {
    pub redis: ConnectionManager,
    pub registry: Arc<ProfileRegistry>,
    pub max_executions_per_day: u64,
}

#[tokio::main]
async fn main() {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info")),
        )
        .with_target(false)
        .init();

    info!("Crucible API booting...");

    let catalog_path = std::env::var("LANGUAGES_CONFIG")
        .unwrap_or_else(|_| "config/languages.json".to_string());
    let registry = Arc::new(
        ProfileRegistry::load(&catalog_path).expect("failed to load language catalog"),
    );
    info!(languages = ?registry.language_ids(), "loaded language catalog");

    let redis_url =
        std::env::var("REDIS_URL").unwrap_or_else(|_| "redis://127.0.0.1:6379".to_string());
    let client = redis::Client::open(redis_url.as_str()).expect("failed to create Redis client");
    let redis_conn = ConnectionManager::new(client)
        .await
        .expect("failed to connect to Redis");
    info!(redis = %redis_url, "connected to Redis");

    let max_executions_per_day = std::env::var("MAX_EXECUTIONS_PER_DAY")
        .ok()
        .and_then(|v| v.parse().ok())
        .unwrap_or(200);

    let state = Arc::new(AppState {
        redis: redis_conn,
        registry,
        max_executions_per_day,
    });

    let app = Router::new().merge(routes::routes()).with_state(state);

    let addr = std::env::var("BIND_ADDR").unwrap_or_else(|_| "0.0.0.0:3000".to_string());
    let listener = TcpListener::bind(&addr).await.expect("failed to bind");

    info!("HTTP server listening on {}", addr);
    info!("ready to accept execution requests");

    axum::serve(listener, app).await.expect("server error");
}
