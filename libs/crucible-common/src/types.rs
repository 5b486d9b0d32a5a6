use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// Why a submission was made: free-form playground runs carry no test
/// cases, graded runs are scored against an exercise's fixtures.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ExecutionKind {
    Playground,
    Graded,
}

/// Lifecycle of an execution. Transitions are monotonic: once a terminal
/// state is reached no further transition is valid.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ExecutionStatus {
    Queued,
    Validating,
    Running,
    Completed,
    Failed,
    TimedOut,
    Cancelled,
    SecurityRejected,
}

impl ExecutionStatus {
    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            ExecutionStatus::Completed
                | ExecutionStatus::Failed
                | ExecutionStatus::TimedOut
                | ExecutionStatus::Cancelled
                | ExecutionStatus::SecurityRejected
        )
    }

    /// Whether `next` is a legal successor of `self`.
    pub fn can_transition(&self, next: ExecutionStatus) -> bool {
        use ExecutionStatus::*;
        match self {
            Queued => matches!(next, Validating | Failed | Cancelled),
            Validating => matches!(next, Running | SecurityRejected | Failed | Cancelled),
            Running => matches!(next, Completed | Failed | TimedOut | Cancelled),
            _ => false,
        }
    }
}

impl std::fmt::Display for ExecutionStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            ExecutionStatus::Queued => "queued",
            ExecutionStatus::Validating => "validating",
            ExecutionStatus::Running => "running",
            ExecutionStatus::Completed => "completed",
            ExecutionStatus::Failed => "failed",
            ExecutionStatus::TimedOut => "timed_out",
            ExecutionStatus::Cancelled => "cancelled",
            ExecutionStatus::SecurityRejected => "security_rejected",
        };
        f.write_str(s)
    }
}

/// Non-student-visible classification of a `Failed` outcome.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FailureReason {
    QuotaExceeded,
    Infrastructure,
}

/// A denylist rule that matched during validation. `category` is the
/// actionable part shown to the student; `rule` is the pattern that fired.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RuleMatch {
    pub category: String,
    pub rule: String,
}

/// How an expected output is compared against captured stdout.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum ComparatorKind {
    Exact,
    WhitespaceInsensitive,
    NumericTolerance {
        #[serde(default = "default_epsilon")]
        epsilon: f64,
    },
}

impl Default for ComparatorKind {
    fn default() -> Self {
        ComparatorKind::Exact
    }
}

pub fn default_epsilon() -> f64 {
    1e-6
}

fn default_points() -> u32 {
    10
}

/// Expected-output fixture owned by the course-content collaborator.
/// Read-only to this core.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TestCase {
    pub id: u32,
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

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TestCaseStatus {
    Passed,
    Failed,
    RuntimeError,
    TimedOut,
    Skipped,
}

/// Per-case outcome inside a graded execution. Immutable once written.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TestCaseResult {
    pub test_id: u32,
    pub name: String,
    pub status: TestCaseStatus,
    pub actual_stdout: String,
    #[serde(default)]
    pub feedback: Option<String>,
    pub points_awarded: u32,
    pub points_possible: u32,
    pub wall_time_ms: u64,
}

/// One attempt to run code. Immutable once accepted by the API.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ExecutionRequest {
    pub id: Uuid,
    pub user_id: String,
    pub language: String,
    pub source_code: String,
    #[serde(default)]
    pub stdin: String,
    pub kind: ExecutionKind,
    #[serde(default)]
    pub exercise_id: Option<Uuid>,
    #[serde(default)]
    pub test_cases: Vec<TestCase>,
    pub timeout_ms: u64,
    pub created_at: DateTime<Utc>,
}

/// Raw capture from one sandbox invocation, before any scoring.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct RawOutcome {
    pub stdout: String,
    pub stderr: String,
    pub exit_code: Option<i64>,
    pub wall_time_ms: u64,
    pub peak_memory_bytes: u64,
    pub timed_out: bool,
    pub cancelled: bool,
    pub compile_failed: bool,
    pub output_truncated: bool,
}

/// Outcome of a request as stored and polled by callers. A snapshot is
/// written at every status transition; the terminal snapshot is final.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ExecutionResult {
    pub id: Uuid,
    pub user_id: String,
    pub language: String,
    pub kind: ExecutionKind,
    pub status: ExecutionStatus,
    #[serde(default)]
    pub stdout: String,
    #[serde(default)]
    pub stderr: String,
    #[serde(default)]
    pub exit_code: Option<i64>,
    #[serde(default)]
    pub wall_time_ms: u64,
    #[serde(default)]
    pub peak_memory_bytes: u64,
    #[serde(default)]
    pub output_truncated: bool,
    #[serde(default)]
    pub compile_failed: bool,
    #[serde(default)]
    pub test_results: Vec<TestCaseResult>,
    #[serde(default)]
    pub score: u32,
    #[serde(default)]
    pub max_score: u32,
    #[serde(default)]
    pub failure_reason: Option<FailureReason>,
    #[serde(default)]
    pub rejections: Vec<RuleMatch>,
    pub created_at: DateTime<Utc>,
    #[serde(default)]
    pub started_at: Option<DateTime<Utc>>,
    #[serde(default)]
    pub finished_at: Option<DateTime<Utc>>,
}

impl ExecutionResult {
    /// Initial snapshot written when a request is accepted.
    pub fn queued(request: &ExecutionRequest) -> Self {
        Self {
            id: request.id,
            user_id: request.user_id.clone(),
            language: request.language.clone(),
            kind: request.kind,
            status: ExecutionStatus::Queued,
            stdout: String::new(),
            stderr: String::new(),
            exit_code: None,
            wall_time_ms: 0,
            peak_memory_bytes: 0,
            output_truncated: false,
            compile_failed: false,
            test_results: Vec::new(),
            score: 0,
            max_score: 0,
            failure_reason: None,
            rejections: Vec::new(),
            created_at: request.created_at,
            started_at: None,
            finished_at: None,
        }
    }
}

/// Per-user rolling usage counters, read back for UI display.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct QuotaSnapshot {
    pub user_id: String,
    pub day: String,
    pub executions: u64,
    pub cpu_millis: u64,
    pub memory_byte_seconds: u64,
    pub max_executions: u64,
}

impl QuotaSnapshot {
    pub fn remaining(&self) -> u64 {
        self.max_executions.saturating_sub(self.executions)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn terminal_states_admit_no_transition() {
        let terminals = [
            ExecutionStatus::Completed,
            ExecutionStatus::Failed,
            ExecutionStatus::TimedOut,
            ExecutionStatus::Cancelled,
            ExecutionStatus::SecurityRejected,
        ];
        let all = [
            ExecutionStatus::Queued,
            ExecutionStatus::Validating,
            ExecutionStatus::Running,
            ExecutionStatus::Completed,
            ExecutionStatus::Failed,
            ExecutionStatus::TimedOut,
            ExecutionStatus::Cancelled,
            ExecutionStatus::SecurityRejected,
        ];
        for from in terminals {
            assert!(from.is_terminal());
            for to in all {
                assert!(!from.can_transition(to), "{from} -> {to} must be invalid");
            }
        }
    }

    #[test]
    fn lifecycle_follows_the_state_machine() {
        use ExecutionStatus::*;
        assert!(Queued.can_transition(Validating));
        assert!(Queued.can_transition(Failed)); // admission control
        assert!(Validating.can_transition(SecurityRejected));
        assert!(Validating.can_transition(Running));
        assert!(Running.can_transition(Completed));
        assert!(Running.can_transition(TimedOut));
        assert!(Running.can_transition(Cancelled));

        assert!(!Queued.can_transition(Completed));
        assert!(!Running.can_transition(SecurityRejected));
        assert!(!Running.can_transition(Queued));
    }

    #[test]
    fn comparator_defaults_to_exact() {
        let case: TestCase = serde_json::from_str(r#"{"id":1,"expected_stdout":"42"}"#).unwrap();
        assert_eq!(case.comparator, ComparatorKind::Exact);
        assert_eq!(case.points, 10);
        assert!(case.stdin.is_empty());
    }

    #[test]
    fn numeric_comparator_carries_a_default_epsilon() {
        let case: TestCase = serde_json::from_str(
            r#"{"id":1,"expected_stdout":"3.14","comparator":{"kind":"numeric_tolerance"}}"#,
        )
        .unwrap();
        match case.comparator {
            ComparatorKind::NumericTolerance { epsilon } => assert_eq!(epsilon, 1e-6),
            other => panic!("unexpected comparator: {other:?}"),
        }
    }
}
