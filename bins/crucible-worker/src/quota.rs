//! Admission control against per-user rolling quotas.
//!
//! Counters live in Redis under a UTC-day-scoped key and are bumped with
//! atomic increments, so concurrent workers admitting the same user never
//! lose an update. The increment happens *before* the limit comparison:
//! N racing submissions each observe a distinct count and at most
//! `max_executions_per_day` of them pass.

use chrono::Utc;
use redis::aio::ConnectionManager;

use crucible_common::error::SandboxResult;
use crucible_common::store;

#[derive(Debug, Clone, Copy)]
pub struct QuotaPolicy {
    pub max_executions_per_day: u64,
}

impl QuotaPolicy {
    pub fn from_env() -> Self {
        let max_executions_per_day = std::env::var("MAX_EXECUTIONS_PER_DAY")
            .ok()
            .and_then(|v| v.parse().ok())
            .unwrap_or(200);
        Self {
            max_executions_per_day,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Admission {
    Admitted,
    Denied,
}

/// Pure admission decision over an already-incremented counter.
pub fn decide(count_after_increment: u64, policy: &QuotaPolicy) -> Admission {
    if count_after_increment > policy.max_executions_per_day {
        Admission::Denied
    } else {
        Admission::Admitted
    }
}

/// Count one execution against the user's current window and decide.
pub async fn admit(
    conn: &mut ConnectionManager,
    user_id: &str,
    policy: &QuotaPolicy,
) -> SandboxResult<Admission> {
    let day = store::quota_day(Utc::now());
    let count = store::count_execution(conn, user_id, &day).await?;
    Ok(decide(count, policy))
}

/// Record resource usage for a terminal execution.
pub async fn record_usage(
    conn: &mut ConnectionManager,
    user_id: &str,
    cpu_millis: u64,
    memory_byte_seconds: u64,
) -> SandboxResult<()> {
    let day = store::quota_day(Utc::now());
    store::record_usage(conn, user_id, &day, cpu_millis, memory_byte_seconds).await
}
