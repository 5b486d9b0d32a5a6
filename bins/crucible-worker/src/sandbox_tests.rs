//! Integration tests for the execution pipeline.
//!
//! `orchestrator_properties` needs a running Redis; `docker_properties`
//! additionally needs a Docker daemon with the catalog images built. Both
//! are `#[ignore]`d so `cargo test` stays hermetic.

use std::collections::VecDeque;
use std::sync::atomic::{AtomicUsize, Ordering};

use anyhow::Result;
use chrono::Utc;
use uuid::Uuid;

use crucible_common::profiles::{DenyRule, LanguageProfile, NetworkPolicy, ProfileRegistry};
use crucible_common::store;
use crucible_common::types::{
    ComparatorKind, ExecutionKind, ExecutionRequest, ExecutionStatus, FailureReason, RawOutcome,
    TestCase, TestCaseStatus,
};

use crate::orchestrator::{ExecutionBackend, Orchestrator};
use crate::quota::QuotaPolicy;
use crate::sandbox::{CancelProbe, ExecutionLimits};

async fn create_redis_conn() -> redis::aio::ConnectionManager {
    let url =
        std::env::var("REDIS_URL").unwrap_or_else(|_| "redis://127.0.0.1:6379".to_string());
    let client = redis::Client::open(url.as_str()).expect("failed to create Redis client");
    client
        .get_connection_manager()
        .await
        .expect("failed to connect to Redis")
}

fn test_profile() -> LanguageProfile {
    LanguageProfile {
        id: "python".to_string(),
        display_name: "Python".to_string(),
        version: "3.12".to_string(),
        image: "crucible-python:3.12".to_string(),
        file_extension: "py".to_string(),
        compile_command: None,
        run_command: "python3 -u main.py".to_string(),
        default_timeout_ms: 5_000,
        max_memory_mb: 128,
        max_cpus: 1.0,
        max_cpu_time_s: 10,
        network_policy: NetworkPolicy::Deny,
        supports_stdin: true,
        max_output_bytes: 1024 * 1024,
        pids_limit: 64,
        denylist: vec![DenyRule {
            category: "process_spawn".to_string(),
            pattern: r"\bimport\s+subprocess\b".to_string(),
        }],
    }
}

fn test_registry() -> ProfileRegistry {
    ProfileRegistry::from_profiles(vec![test_profile()]).expect("valid test catalog")
}

fn make_request(
    user_id: &str,
    source: &str,
    kind: ExecutionKind,
    test_cases: Vec<TestCase>,
) -> ExecutionRequest {
    ExecutionRequest {
        id: Uuid::new_v4(),
        user_id: user_id.to_string(),
        language: "python".to_string(),
        source_code: source.to_string(),
        stdin: String::new(),
        kind,
        exercise_id: None,
        test_cases,
        timeout_ms: 5_000,
        created_at: Utc::now(),
    }
}

fn make_case(id: u32, stdin: &str, expected: &str, points: u32) -> TestCase {
    TestCase {
        id,
        name: format!("case-{id}"),
        stdin: stdin.to_string(),
        expected_stdout: expected.to_string(),
        comparator: ComparatorKind::Exact,
        points,
    }
}

fn fresh_user() -> String {
    format!("it-user-{}", Uuid::new_v4())
}

/// Scripted backend: pops one outcome per invocation and counts calls.
struct StubBackend {
    outcomes: tokio::sync::Mutex<VecDeque<RawOutcome>>,
    invocations: AtomicUsize,
}

impl StubBackend {
    fn new(outcomes: Vec<RawOutcome>) -> Self {
        Self {
            outcomes: tokio::sync::Mutex::new(outcomes.into()),
            invocations: AtomicUsize::new(0),
        }
    }

    fn invocation_count(&self) -> usize {
        self.invocations.load(Ordering::SeqCst)
    }
}

fn ok_outcome(stdout: &str) -> RawOutcome {
    RawOutcome {
        stdout: stdout.to_string(),
        exit_code: Some(0),
        wall_time_ms: 10,
        ..Default::default()
    }
}

impl ExecutionBackend for StubBackend {
    async fn run(
        &self,
        _profile: &LanguageProfile,
        _source: &str,
        _stdin: &str,
        _limits: &ExecutionLimits,
        _cancel: &mut CancelProbe,
    ) -> Result<RawOutcome> {
        self.invocations.fetch_add(1, Ordering::SeqCst);
        let outcome = self.outcomes.lock().await.pop_front();
        Ok(outcome.unwrap_or_else(|| ok_outcome("")))
    }
}

mod orchestrator_properties {
    use super::*;

    const POLICY: QuotaPolicy = QuotaPolicy {
        max_executions_per_day: 1_000,
    };

    /// A denylist match must reject the request before any backend call.
    #[tokio::test]
    #[ignore] // Requires Redis
    async fn rejected_submission_never_reaches_the_backend() {
        let conn = create_redis_conn().await;
        let registry = test_registry();
        let backend = StubBackend::new(vec![]);

        let request = make_request(
            &fresh_user(),
            "import subprocess\nsubprocess.run(['ls'])",
            ExecutionKind::Playground,
            vec![],
        );

        let mut orchestrator = Orchestrator::new(&backend, &registry, POLICY, conn);
        let result = orchestrator.process(request).await.expect("process");

        assert_eq!(result.status, ExecutionStatus::SecurityRejected);
        assert_eq!(result.rejections[0].category, "process_spawn");
        assert_eq!(backend.invocation_count(), 0, "no container may be provisioned");
    }

    /// Over-quota requests fail during admission, before any backend call.
    #[tokio::test]
    #[ignore] // Requires Redis
    async fn quota_ceiling_blocks_admission() {
        let conn = create_redis_conn().await;
        let registry = test_registry();
        let backend = StubBackend::new(vec![ok_outcome("hi\n"), ok_outcome("hi\n")]);
        let tight = QuotaPolicy {
            max_executions_per_day: 1,
        };
        let user = fresh_user();

        let mut orchestrator = Orchestrator::new(&backend, &registry, tight, conn);

        let first = orchestrator
            .process(make_request(&user, "print('hi')", ExecutionKind::Playground, vec![]))
            .await
            .expect("first run");
        assert_eq!(first.status, ExecutionStatus::Completed);

        let second = orchestrator
            .process(make_request(&user, "print('hi')", ExecutionKind::Playground, vec![]))
            .await
            .expect("second run");
        assert_eq!(second.status, ExecutionStatus::Failed);
        assert_eq!(second.failure_reason, Some(FailureReason::QuotaExceeded));
        assert_eq!(backend.invocation_count(), 1);
    }

    /// Cancelling a queued request terminates it without execution.
    #[tokio::test]
    #[ignore] // Requires Redis
    async fn cancellation_while_queued_skips_execution() {
        let mut conn = create_redis_conn().await;
        let registry = test_registry();
        let backend = StubBackend::new(vec![]);

        let request = make_request(&fresh_user(), "print('hi')", ExecutionKind::Playground, vec![]);
        store::request_cancel(&mut conn, &request.id)
            .await
            .expect("set cancel flag");

        let mut orchestrator = Orchestrator::new(&backend, &registry, POLICY, conn);
        let result = orchestrator.process(request).await.expect("process");

        assert_eq!(result.status, ExecutionStatus::Cancelled);
        assert_eq!(backend.invocation_count(), 0);
    }

    /// 3 cases, 2 passing: score is the sum of the passing points and the
    /// result carries exactly one entry per fixture.
    #[tokio::test]
    #[ignore] // Requires Redis
    async fn graded_suite_scores_two_of_three() {
        let conn = create_redis_conn().await;
        let registry = test_registry();
        let backend = StubBackend::new(vec![
            ok_outcome("1\n"),
            ok_outcome("wrong\n"),
            ok_outcome("3\n"),
        ]);

        let request = make_request(
            &fresh_user(),
            "print(input())",
            ExecutionKind::Graded,
            vec![
                make_case(1, "1", "1", 10),
                make_case(2, "2", "2", 20),
                make_case(3, "3", "3", 30),
            ],
        );

        let mut orchestrator = Orchestrator::new(&backend, &registry, POLICY, conn);
        let result = orchestrator.process(request).await.expect("process");

        assert_eq!(result.status, ExecutionStatus::Completed);
        assert_eq!(result.test_results.len(), 3);
        assert_eq!(result.score, 40);
        assert_eq!(result.max_score, 60);
        assert_eq!(backend.invocation_count(), 3);
    }

    /// Mid-suite cancellation stops the run and records the tail as
    /// skipped, preserving the per-fixture invariant.
    #[tokio::test]
    #[ignore] // Requires Redis
    async fn cancelled_suite_skips_remaining_cases() {
        let conn = create_redis_conn().await;
        let registry = test_registry();
        let cancelled_outcome = RawOutcome {
            cancelled: true,
            ..Default::default()
        };
        let backend = StubBackend::new(vec![ok_outcome("1\n"), cancelled_outcome]);

        let request = make_request(
            &fresh_user(),
            "print(input())",
            ExecutionKind::Graded,
            vec![
                make_case(1, "1", "1", 10),
                make_case(2, "2", "2", 10),
                make_case(3, "3", "3", 10),
            ],
        );

        let mut orchestrator = Orchestrator::new(&backend, &registry, POLICY, conn);
        let result = orchestrator.process(request).await.expect("process");

        assert_eq!(result.status, ExecutionStatus::Cancelled);
        assert_eq!(result.test_results.len(), 3);
        assert_eq!(result.test_results[0].status, TestCaseStatus::Passed);
        assert_eq!(result.test_results[1].status, TestCaseStatus::Skipped);
        assert_eq!(result.test_results[2].status, TestCaseStatus::Skipped);
        assert_eq!(backend.invocation_count(), 2);
    }

    /// Polling a terminal result twice returns byte-identical payloads,
    /// and a terminal snapshot can never be overwritten.
    #[tokio::test]
    #[ignore] // Requires Redis
    async fn terminal_results_are_idempotent_and_append_only() {
        let conn = create_redis_conn().await;
        let registry = test_registry();
        let backend = StubBackend::new(vec![ok_outcome("hi\n")]);

        let request = make_request(&fresh_user(), "print('hi')", ExecutionKind::Playground, vec![]);
        let id = request.id;

        let mut orchestrator = Orchestrator::new(&backend, &registry, POLICY, conn.clone());
        let mut result = orchestrator.process(request).await.expect("process");
        assert_eq!(result.status, ExecutionStatus::Completed);

        let mut conn = conn;
        let first = store::load_result_raw(&mut conn, &id)
            .await
            .expect("load")
            .expect("present");
        let second = store::load_result_raw(&mut conn, &id)
            .await
            .expect("load")
            .expect("present");
        assert_eq!(first, second);

        // Attempting to move out of the terminal state is refused.
        result.stdout = "tampered".to_string();
        let written = store::store_result(&mut conn, &result).await.expect("store");
        assert!(!written);
        let third = store::load_result_raw(&mut conn, &id)
            .await
            .expect("load")
            .expect("present");
        assert_eq!(first, third);
    }

    /// N concurrent executions bump the user's counter by exactly N.
    #[tokio::test]
    #[ignore] // Requires Redis
    async fn quota_counter_has_no_lost_updates() {
        let mut conn = create_redis_conn().await;
        let user = fresh_user();
        let day = store::quota_day(Utc::now());

        let mut handles = Vec::new();
        for _ in 0..16 {
            let mut task_conn = conn.clone();
            let user = user.clone();
            let day = day.clone();
            handles.push(tokio::spawn(async move {
                store::count_execution(&mut task_conn, &user, &day)
                    .await
                    .expect("count")
            }));
        }
        for handle in handles {
            handle.await.expect("join");
        }

        let usage = store::load_usage(&mut conn, &user, &day).await.expect("load");
        assert_eq!(usage.executions, 16);
    }
}

mod docker_properties {
    use super::*;
    use crate::sandbox::DockerSandbox;

    const POLICY: QuotaPolicy = QuotaPolicy {
        max_executions_per_day: 1_000,
    };

    fn catalog_registry() -> ProfileRegistry {
        let path = concat!(env!("CARGO_MANIFEST_DIR"), "/../../config/languages.json");
        ProfileRegistry::load(path).expect("catalog loads")
    }

    async fn run_playground_in(
        language: &str,
        source: &str,
        stdin: &str,
    ) -> crucible_common::types::ExecutionResult {
        let conn = create_redis_conn().await;
        let registry = catalog_registry();
        let sandbox = DockerSandbox::connect().expect("docker daemon");

        let mut request = make_request(&fresh_user(), source, ExecutionKind::Playground, vec![]);
        request.language = language.to_string();
        request.stdin = stdin.to_string();

        let mut orchestrator = Orchestrator::new(&sandbox, &registry, POLICY, conn);
        orchestrator.process(request).await.expect("process")
    }

    async fn run_playground(source: &str, stdin: &str) -> crucible_common::types::ExecutionResult {
        run_playground_in("python", source, stdin).await
    }

    fn hello_source(language: &str) -> &'static str {
        match language {
            "python" => "print('hello')",
            "javascript" => "console.log('hello')",
            "c" => "#include <stdio.h>\nint main(void) { printf(\"hello\\n\"); return 0; }",
            "rust" => "fn main() { println!(\"hello\"); }",
            other => panic!("no hello-world fixture for language '{other}'"),
        }
    }

    /// Every catalog language runs hello world to completion: exit 0, the
    /// literal on stdout, empty stderr.
    #[tokio::test]
    #[ignore] // Requires Docker and Redis
    async fn hello_world_completes_for_every_language() {
        for language in catalog_registry().language_ids() {
            let result = run_playground_in(&language, hello_source(&language), "").await;

            assert_eq!(
                result.status,
                ExecutionStatus::Completed,
                "{language} hello world must complete"
            );
            assert_eq!(result.exit_code, Some(0), "{language} must exit cleanly");
            assert!(result.stdout.contains("hello"), "{language} stdout: {:?}", result.stdout);
            assert!(result.stderr.is_empty(), "{language} stderr: {:?}", result.stderr);
        }
    }

    /// End-to-end doubling: stdin "21" yields stdout "42\n".
    #[tokio::test]
    #[ignore] // Requires Docker and Redis
    async fn python_stdin_doubling_round_trip() {
        let result = run_playground("print(int(input())*2)", "21").await;

        assert_eq!(result.status, ExecutionStatus::Completed);
        assert_eq!(result.exit_code, Some(0));
        assert_eq!(result.stdout, "42\n");
    }

    /// Sleeping past the ceiling yields timed_out, never completed, and
    /// output flushed before the kill is retained.
    #[tokio::test]
    #[ignore] // Requires Docker and Redis
    async fn sleeping_program_times_out_with_partial_output() {
        let source = r#"
import time
print('before sleep', flush=True)
time.sleep(30)
print('after sleep')
"#;
        let result = run_playground(source, "").await;

        assert_eq!(result.status, ExecutionStatus::TimedOut);
        assert!(result.stdout.contains("before sleep"));
        assert!(!result.stdout.contains("after sleep"));
    }

    /// Exceeding the memory ceiling must never look like a clean exit.
    #[tokio::test]
    #[ignore] // Requires Docker and Redis
    async fn memory_hog_never_completes_cleanly() {
        let source = r#"
chunks = []
while True:
    chunks.append(bytearray(16 * 1024 * 1024))
"#;
        let result = run_playground(source, "").await;

        let clean_exit =
            result.status == ExecutionStatus::Completed && result.exit_code == Some(0);
        assert!(!clean_exit, "OOM must not report success: {:?}", result.status);
    }

    /// Two concurrent executions never observe each other's workspace:
    /// each writes its own marker file and sees exactly one marker.
    #[tokio::test]
    #[ignore] // Requires Docker and Redis
    async fn concurrent_executions_are_isolated() {
        let source_a = r#"
import os
open('marker_a', 'w').write('a')
import time; time.sleep(1)
print(sorted(f for f in os.listdir('.') if f.startswith('marker')))
"#;
        let source_b = r#"
import os
open('marker_b', 'w').write('b')
import time; time.sleep(1)
print(sorted(f for f in os.listdir('.') if f.startswith('marker')))
"#;

        let (a, b) = tokio::join!(run_playground(source_a, ""), run_playground(source_b, ""));

        assert_eq!(a.status, ExecutionStatus::Completed);
        assert_eq!(b.status, ExecutionStatus::Completed);
        assert!(a.stdout.contains("marker_a") && !a.stdout.contains("marker_b"));
        assert!(b.stdout.contains("marker_b") && !b.stdout.contains("marker_a"));
    }
}
