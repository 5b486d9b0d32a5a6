mod config;
mod orchestrator;
mod quota;
mod sandbox;
#[cfg(test)]
mod sandbox_tests;
mod validator;
mod verdict;

use std::sync::Arc;
use std::time::Duration;

use redis::aio::ConnectionManager;
use tokio::signal;
use tokio::sync::Semaphore;
use tracing::{error, info, warn};

use crucible_common::profiles::ProfileRegistry;
use crucible_common::store;

use crate::config::WorkerConfig;
use crate::orchestrator::Orchestrator;
use crate::sandbox::DockerSandbox;

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info")),
        )
        .with_target(false)
        .with_thread_ids(true)
        .init();

    info!("Crucible worker booting...");

    let cfg = WorkerConfig::from_env();

    let registry = ProfileRegistry::load(&cfg.catalog_path).map_err(|e| {
        error!(path = %cfg.catalog_path, error = %e, "failed to load language catalog");
        e
    })?;
    let registry = Arc::new(registry);
    info!(
        languages = ?registry.language_ids(),
        "loaded language catalog"
    );

    let client = redis::Client::open(cfg.redis_url.as_str())?;
    let conn = ConnectionManager::new(client).await?;
    info!(redis = %cfg.redis_url, "connected to Redis");

    let sandbox = Arc::new(DockerSandbox::connect()?);
    info!("connected to Docker daemon");

    let pool = Arc::new(Semaphore::new(cfg.max_concurrent));
    info!(max_concurrent = cfg.max_concurrent, "worker pool sized");

    let shutdown = async {
        signal::ctrl_c()
            .await
            .expect("failed to install CTRL+C signal handler");
        warn!("received shutdown signal, draining in-flight executions...");
    };

    tokio::select! {
        result = worker_loop(conn, registry, sandbox, pool, &cfg) => result?,
        _ = shutdown => {}
    }

    info!("worker shutdown complete");
    Ok(())
}

/// Lease requests off the per-language queues and hand each to its own
/// task. The semaphore bounds concurrent executions per host, so a burst
/// of submissions queues up instead of exhausting the container daemon.
async fn worker_loop(
    mut conn: ConnectionManager,
    registry: Arc<ProfileRegistry>,
    sandbox: Arc<DockerSandbox>,
    pool: Arc<Semaphore>,
    cfg: &WorkerConfig,
) -> anyhow::Result<()> {
    let queues: Vec<String> = registry
        .language_ids()
        .iter()
        .map(|id| store::queue_key(id))
        .collect();

    loop {
        // Hold a slot before leasing so leased work never waits in-process.
        let permit = pool.clone().acquire_owned().await?;

        match store::lease_request(&mut conn, &queues, cfg.lease_timeout_secs).await {
            Ok(Some(request)) => {
                info!(
                    execution_id = %request.id,
                    language = %request.language,
                    kind = ?request.kind,
                    test_cases = request.test_cases.len(),
                    source_bytes = request.source_code.len(),
                    "leased execution request"
                );

                let task_conn = conn.clone();
                let registry = registry.clone();
                let sandbox = sandbox.clone();
                let policy = cfg.quota;

                tokio::spawn(async move {
                    let _slot = permit;
                    let mut orchestrator =
                        Orchestrator::new(sandbox.as_ref(), registry.as_ref(), policy, task_conn);
                    match orchestrator.process(request).await {
                        Ok(result) => {
                            info!(
                                execution_id = %result.id,
                                status = %result.status,
                                "execution finished"
                            );
                        }
                        Err(e) => {
                            error!(error = format!("{e:#}"), "execution processing failed");
                        }
                    }
                });
            }
            Ok(None) => {
                // Lease timeout; release the slot and poll again.
                drop(permit);
            }
            Err(e) => {
                drop(permit);
                error!(error = %e, "redis error while leasing work");
                tokio::time::sleep(Duration::from_secs(1)).await;
            }
        }
    }
}
