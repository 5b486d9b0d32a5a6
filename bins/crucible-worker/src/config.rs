//! Worker configuration from the environment.

use crate::quota::QuotaPolicy;

#[derive(Debug, Clone)]
pub struct WorkerConfig {
    pub redis_url: String,
    pub catalog_path: String,
    /// Host-level cap on concurrently running executions. Bounds container
    /// provisioning under bursts instead of spawning without limit.
    pub max_concurrent: usize,
    /// BLPOP timeout; short enough to notice shutdown promptly.
    pub lease_timeout_secs: f64,
    pub quota: QuotaPolicy,
}

impl WorkerConfig {
    pub fn from_env() -> Self {
        let redis_url =
            std::env::var("REDIS_URL").unwrap_or_else(|_| "redis://127.0.0.1:6379".to_string());
        let catalog_path = std::env::var("LANGUAGES_CONFIG")
            .unwrap_or_else(|_| "config/languages.json".to_string());
        let max_concurrent = std::env::var("MAX_CONCURRENT_EXECUTIONS")
            .ok()
            .and_then(|v| v.parse().ok())
            .filter(|&n: &usize| n > 0)
            .unwrap_or(4);

        Self {
            redis_url,
            catalog_path,
            max_concurrent,
            lease_timeout_secs: 5.0,
            quota: QuotaPolicy::from_env(),
        }
    }
}
