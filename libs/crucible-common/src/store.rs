//! Redis key scheme and queue/result/cancel/quota operations.
//!
//! Defines the semantics shared by the API and the worker so the two never
//! drift: key layout is deterministic, queues are FIFO per language, result
//! records are append-only (a terminal snapshot is never overwritten), and
//! quota counters are plain atomic increments.

use redis::aio::ConnectionManager;
use redis::AsyncCommands;
use uuid::Uuid;

use crate::error::SandboxResult;
use crate::types::{ExecutionRequest, ExecutionResult};

pub const QUEUE_PREFIX: &str = "crucible:queue";
pub const RESULT_PREFIX: &str = "crucible:result";
pub const CANCEL_PREFIX: &str = "crucible:cancel";
pub const QUOTA_PREFIX: &str = "crucible:quota";

/// Results are kept for a day of polling/history; the durable archive is
/// owned by the persistence layer upstream.
pub const RESULT_TTL_SECS: u64 = 86_400;
pub const CANCEL_TTL_SECS: u64 = 3_600;
/// Quota keys are date-scoped; two days of TTL covers clock skew around
/// the daily rollover.
pub const QUOTA_TTL_SECS: i64 = 2 * 86_400;

/// FIFO queue for one language.
pub fn queue_key(language_id: &str) -> String {
    format!("{QUEUE_PREFIX}:{language_id}")
}

pub fn result_key(id: &Uuid) -> String {
    format!("{RESULT_PREFIX}:{id}")
}

pub fn cancel_key(id: &Uuid) -> String {
    format!("{CANCEL_PREFIX}:{id}")
}

pub fn quota_key(user_id: &str, day: &str) -> String {
    format!("{QUOTA_PREFIX}:{user_id}:{day}")
}

/// UTC day bucket used for quota key rotation.
pub fn quota_day(now: chrono::DateTime<chrono::Utc>) -> String {
    now.format("%Y-%m-%d").to_string()
}

/// Push an accepted request onto its language queue (RPUSH, FIFO).
pub async fn enqueue_request(
    conn: &mut ConnectionManager,
    request: &ExecutionRequest,
) -> SandboxResult<()> {
    let queue = queue_key(&request.language);
    let payload = serde_json::to_string(request)?;
    let _: () = conn.rpush(&queue, payload).await?;
    Ok(())
}

/// Lease the next request from any of the given queues. Blocks up to
/// `timeout_seconds` (BLPOP) so the worker can drain gracefully.
pub async fn lease_request(
    conn: &mut ConnectionManager,
    queues: &[String],
    timeout_seconds: f64,
) -> SandboxResult<Option<ExecutionRequest>> {
    let result: Option<(String, String)> = conn.blpop(queues, timeout_seconds).await?;
    match result {
        Some((_queue, payload)) => Ok(Some(serde_json::from_str(&payload)?)),
        None => Ok(None),
    }
}

/// Store a result snapshot. Returns `false` without writing when the stored
/// snapshot is already terminal: results are logically append-only and a
/// terminal state is never transitioned out of.
pub async fn store_result(
    conn: &mut ConnectionManager,
    result: &ExecutionResult,
) -> SandboxResult<bool> {
    let key = result_key(&result.id);

    if let Some(existing) = load_result(conn, &result.id).await? {
        if existing.status.is_terminal() {
            return Ok(false);
        }
    }

    let payload = serde_json::to_string(result)?;
    let _: () = conn.set_ex(&key, payload, RESULT_TTL_SECS).await?;
    Ok(true)
}

pub async fn load_result(
    conn: &mut ConnectionManager,
    id: &Uuid,
) -> SandboxResult<Option<ExecutionResult>> {
    match load_result_raw(conn, id).await? {
        Some(payload) => Ok(Some(serde_json::from_str(&payload)?)),
        None => Ok(None),
    }
}

/// Raw stored JSON, returned verbatim by the API so repeated polls of a
/// terminal result are byte-identical.
pub async fn load_result_raw(
    conn: &mut ConnectionManager,
    id: &Uuid,
) -> SandboxResult<Option<String>> {
    let payload: Option<String> = conn.get(result_key(id)).await?;
    Ok(payload)
}

/// Flag a request for cancellation. The worker observes the flag
/// cooperatively; the container teardown it triggers is forceful.
pub async fn request_cancel(conn: &mut ConnectionManager, id: &Uuid) -> SandboxResult<()> {
    let _: () = conn.set_ex(cancel_key(id), "1", CANCEL_TTL_SECS as u64).await?;
    Ok(())
}

pub async fn is_cancelled(conn: &mut ConnectionManager, id: &Uuid) -> SandboxResult<bool> {
    let flagged: bool = conn.exists(cancel_key(id)).await?;
    Ok(flagged)
}

/// Counters inside one quota window.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct QuotaUsage {
    pub executions: u64,
    pub cpu_millis: u64,
    pub memory_byte_seconds: u64,
}

/// Atomically count one execution against the user's window and return the
/// new total. HINCRBY makes concurrent admissions race-free; the first
/// increment arms the window TTL.
pub async fn count_execution(
    conn: &mut ConnectionManager,
    user_id: &str,
    day: &str,
) -> SandboxResult<u64> {
    let key = quota_key(user_id, day);
    let count: u64 = conn.hincr(&key, "executions", 1).await?;
    if count == 1 {
        let _: i64 = conn.expire(&key, QUOTA_TTL_SECS).await?;
    }
    Ok(count)
}

/// Record resource usage for a finished execution (any terminal state).
pub async fn record_usage(
    conn: &mut ConnectionManager,
    user_id: &str,
    day: &str,
    cpu_millis: u64,
    memory_byte_seconds: u64,
) -> SandboxResult<()> {
    let key = quota_key(user_id, day);
    let _: u64 = conn.hincr(&key, "cpu_millis", cpu_millis as i64).await?;
    let _: u64 = conn
        .hincr(&key, "memory_byte_seconds", memory_byte_seconds as i64)
        .await?;
    Ok(())
}

pub async fn load_usage(
    conn: &mut ConnectionManager,
    user_id: &str,
    day: &str,
) -> SandboxResult<QuotaUsage> {
    let key = quota_key(user_id, day);
    let fields: Vec<Option<u64>> = conn
        .hget(&key, &["executions", "cpu_millis", "memory_byte_seconds"])
        .await?;
    let mut it = fields.into_iter();
    Ok(QuotaUsage {
        executions: it.next().flatten().unwrap_or(0),
        cpu_millis: it.next().flatten().unwrap_or(0),
        memory_byte_seconds: it.next().flatten().unwrap_or(0),
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;

    #[test]
    fn queue_naming_is_deterministic() {
        assert_eq!(queue_key("python"), "crucible:queue:python");
        assert_eq!(queue_key("javascript"), "crucible:queue:javascript");
    }

    #[test]
    fn result_key_is_deterministic() {
        let id = Uuid::new_v4();
        assert_eq!(result_key(&id), result_key(&id));
        assert!(result_key(&id).starts_with("crucible:result:"));
    }

    #[test]
    fn cancel_key_contains_the_id() {
        let id = Uuid::new_v4();
        assert!(cancel_key(&id).contains(&id.to_string()));
    }

    #[test]
    fn quota_keys_rotate_by_utc_day() {
        let morning = chrono::Utc.with_ymd_and_hms(2026, 3, 1, 0, 5, 0).unwrap();
        let evening = chrono::Utc.with_ymd_and_hms(2026, 3, 1, 23, 55, 0).unwrap();
        let next_day = chrono::Utc.with_ymd_and_hms(2026, 3, 2, 0, 5, 0).unwrap();

        assert_eq!(quota_day(morning), quota_day(evening));
        assert_ne!(quota_day(morning), quota_day(next_day));
        assert_eq!(
            quota_key("alice", &quota_day(morning)),
            "crucible:quota:alice:2026-03-01"
        );
    }
}
