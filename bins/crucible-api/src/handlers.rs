//! HTTP route handlers for the execution boundary.
//!
//! The web layer upstream owns authentication and course content; this
//! surface trusts the `X-User-Id` it forwards and treats submitted test
//! cases as externally owned fixtures.

use std::sync::Arc;

use axum::extract::{Path, State};
use axum::http::{header, HeaderMap, StatusCode};
use axum::response::{IntoResponse, Json, Response};
use chrono::Utc;
use serde::{Deserialize, Serialize};
use tracing::{error, info};
use uuid::Uuid;

use crucible_common::store;
use crucible_common::types::{
    ComparatorKind, ExecutionKind, ExecutionRequest, ExecutionResult, QuotaSnapshot, TestCase,
};

use crate::AppState;

const USER_HEADER: &str = "x-user-id";

#[derive(Debug, Deserialize)]
pub struct SubmitRequest {
    pub language: String,
    pub source_code: String,
    #[serde(default)]
    pub stdin: String,
    #[serde(default)]
    pub exercise_id: Option<Uuid>,
    #[serde(default)]
    pub test_cases: Vec<TestCaseInput>,
    #[serde(default)]
    pub timeout_ms: Option<u64>,
}

#[derive(Debug, Deserialize)]
pub struct TestCaseInput {
    #[serde(default)]
    pub name: String,
    #[serde(default)]
    pub stdin: String,
    pub expected_stdout: String,
    #[serde(default)]
    pub comparator: ComparatorKind,
    #[serde(default = "default_points")]
    pub points: u32,
}

fn default_points() -> u32 {
    10
}

#[derive(Debug, Serialize)]
pub struct SubmitResponse {
    pub id: String,
    pub status: String,
}

fn error_body(message: impl Into<String>) -> Json<serde_json::Value> {
    Json(serde_json::json!({ "error": message.into() }))
}

/// Authenticated caller identity, forwarded by the web layer and trusted
/// at face value.
fn user_id(headers: &HeaderMap) -> Option<String> {
    headers
        .get(USER_HEADER)
        .and_then(|v| v.to_str().ok())
        .map(str::trim)
        .filter(|v| !v.is_empty())
        .map(str::to_string)
}

/// POST /api/v1/executions - accept a request and enqueue it.
/// Synchronous acceptance, asynchronous completion.
pub async fn submit_execution(
    State(state): State<Arc<AppState>>,
    headers: HeaderMap,
    Json(payload): Json<SubmitRequest>,
) -> Response {
    let Some(user_id) = user_id(&headers) else {
        return (
            StatusCode::UNAUTHORIZED,
            error_body("missing X-User-Id header"),
        )
            .into_response();
    };

    let profile = match state.registry.get(&payload.language) {
        Ok(profile) => profile,
        Err(e) => {
            return (StatusCode::UNPROCESSABLE_ENTITY, error_body(e.student_message()))
                .into_response();
        }
    };

    let test_cases: Vec<TestCase> = payload
        .test_cases
        .into_iter()
        .enumerate()
        .map(|(idx, tc)| TestCase {
            id: (idx + 1) as u32,
            name: tc.name,
            stdin: tc.stdin,
            expected_stdout: tc.expected_stdout,
            comparator: tc.comparator,
            points: tc.points,
        })
        .collect();

    let kind = if test_cases.is_empty() {
        ExecutionKind::Playground
    } else {
        ExecutionKind::Graded
    };

    let request = ExecutionRequest {
        id: Uuid::new_v4(),
        user_id,
        language: payload.language,
        source_code: payload.source_code,
        stdin: payload.stdin,
        kind,
        exercise_id: payload.exercise_id,
        test_cases,
        timeout_ms: profile.clamp_timeout_ms(payload.timeout_ms),
        created_at: Utc::now(),
    };

    let mut conn = state.redis.clone();
    let snapshot = ExecutionResult::queued(&request);
    if let Err(e) = store::store_result(&mut conn, &snapshot).await {
        error!(execution_id = %request.id, error = %e, "failed to store initial snapshot");
        return (StatusCode::INTERNAL_SERVER_ERROR, error_body("failed to accept request"))
            .into_response();
    }

    match store::enqueue_request(&mut conn, &request).await {
        Ok(()) => {
            info!(
                execution_id = %request.id,
                language = %request.language,
                kind = ?request.kind,
                test_cases = request.test_cases.len(),
                "execution queued"
            );
            (
                StatusCode::CREATED,
                Json(SubmitResponse {
                    id: request.id.to_string(),
                    status: "queued".to_string(),
                }),
            )
                .into_response()
        }
        Err(e) => {
            error!(execution_id = %request.id, error = %e, "failed to enqueue request");
            (StatusCode::INTERNAL_SERVER_ERROR, error_body("failed to accept request"))
                .into_response()
        }
    }
}

/// GET /api/v1/executions/{id} - poll the current snapshot. Idempotent:
/// the stored JSON is returned verbatim, so repeated polls of a terminal
/// result are byte-identical.
pub async fn get_execution(
    State(state): State<Arc<AppState>>,
    Path(id): Path<String>,
) -> Response {
    let Ok(execution_id) = Uuid::parse_str(&id) else {
        return (StatusCode::BAD_REQUEST, error_body("invalid execution id")).into_response();
    };

    let mut conn = state.redis.clone();
    match store::load_result_raw(&mut conn, &execution_id).await {
        Ok(Some(raw)) => (
            StatusCode::OK,
            [(header::CONTENT_TYPE, "application/json")],
            raw,
        )
            .into_response(),
        Ok(None) => (StatusCode::NOT_FOUND, error_body("unknown execution id")).into_response(),
        Err(e) => {
            error!(execution_id = %execution_id, error = %e, "failed to load result");
            (
                StatusCode::INTERNAL_SERVER_ERROR,
                error_body("failed to query execution"),
            )
                .into_response()
        }
    }
}

/// POST /api/v1/executions/{id}/cancel - Ok | AlreadyTerminal.
pub async fn cancel_execution(
    State(state): State<Arc<AppState>>,
    Path(id): Path<String>,
) -> Response {
    let Ok(execution_id) = Uuid::parse_str(&id) else {
        return (StatusCode::BAD_REQUEST, error_body("invalid execution id")).into_response();
    };

    let mut conn = state.redis.clone();
    let result = match store::load_result(&mut conn, &execution_id).await {
        Ok(Some(result)) => result,
        Ok(None) => {
            return (StatusCode::NOT_FOUND, error_body("unknown execution id")).into_response();
        }
        Err(e) => {
            error!(execution_id = %execution_id, error = %e, "failed to load result");
            return (
                StatusCode::INTERNAL_SERVER_ERROR,
                error_body("failed to query execution"),
            )
                .into_response();
        }
    };

    if result.status.is_terminal() {
        return (
            StatusCode::CONFLICT,
            Json(serde_json::json!({
                "status": "already_terminal",
                "execution_status": result.status,
            })),
        )
            .into_response();
    }

    match store::request_cancel(&mut conn, &execution_id).await {
        Ok(()) => {
            info!(execution_id = %execution_id, "cancellation requested");
            (StatusCode::OK, Json(serde_json::json!({ "status": "ok" }))).into_response()
        }
        Err(e) => {
            error!(execution_id = %execution_id, error = %e, "failed to flag cancellation");
            (
                StatusCode::INTERNAL_SERVER_ERROR,
                error_body("failed to cancel execution"),
            )
                .into_response()
        }
    }
}

/// GET /api/v1/quota/{user_id} - read-only usage snapshot for UI display.
pub async fn get_quota(
    State(state): State<Arc<AppState>>,
    Path(user_id): Path<String>,
) -> Response {
    let day = store::quota_day(Utc::now());
    let mut conn = state.redis.clone();

    match store::load_usage(&mut conn, &user_id, &day).await {
        Ok(usage) => {
            let snapshot = QuotaSnapshot {
                user_id,
                day,
                executions: usage.executions,
                cpu_millis: usage.cpu_millis,
                memory_byte_seconds: usage.memory_byte_seconds,
                max_executions: state.max_executions_per_day,
            };
            (StatusCode::OK, Json(snapshot)).into_response()
        }
        Err(e) => {
            error!(user_id = %user_id, error = %e, "failed to load quota");
            (
                StatusCode::INTERNAL_SERVER_ERROR,
                error_body("failed to query quota"),
            )
                .into_response()
        }
    }
}

/// GET /health - liveness probe.
pub async fn health_check() -> impl IntoResponse {
    (StatusCode::OK, "OK")
}
