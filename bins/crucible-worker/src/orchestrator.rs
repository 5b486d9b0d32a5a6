//! Execution orchestrator - the per-request state machine.
//!
//! `queued -> validating -> (security_rejected | running) ->
//! (completed | failed | timed_out | cancelled)`
//!
//! The orchestrator sequences admission control, static validation, the
//! sandbox run (one invocation per test case for graded requests), verdict
//! scoring, and result persistence. It owns the policy decisions: nothing
//! the student program does becomes a platform error, no student code is
//! ever re-run automatically, and infrastructure detail never reaches the
//! student-facing result.
//!
//! Execution itself sits behind `ExecutionBackend` so the admission and
//! validation paths are testable without a container daemon.

use anyhow::Result;
use chrono::Utc;
use redis::aio::ConnectionManager;
use tracing::{error, info, instrument, warn};

use crucible_common::profiles::{LanguageProfile, ProfileRegistry};
use crucible_common::store;
use crucible_common::types::{
    ExecutionKind, ExecutionRequest, ExecutionResult, ExecutionStatus, FailureReason, RawOutcome,
    RuleMatch, TestCaseStatus,
};

use crate::quota::{self, Admission, QuotaPolicy};
use crate::sandbox::{CancelProbe, DockerSandbox, ExecutionLimits};
use crate::validator;
use crate::verdict;

/// Swappable execution backend. Production is `DockerSandbox`; tests use a
/// counting stub to assert that rejected requests never provision anything.
pub trait ExecutionBackend {
    fn run(
        &self,
        profile: &LanguageProfile,
        source: &str,
        stdin: &str,
        limits: &ExecutionLimits,
        cancel: &mut CancelProbe,
    ) -> impl std::future::Future<Output = Result<RawOutcome>> + Send;
}

impl ExecutionBackend for DockerSandbox {
    async fn run(
        &self,
        profile: &LanguageProfile,
        source: &str,
        stdin: &str,
        limits: &ExecutionLimits,
        cancel: &mut CancelProbe,
    ) -> Result<RawOutcome> {
        DockerSandbox::run(self, profile, source, stdin, limits, cancel).await
    }
}

pub struct Orchestrator<'a, B> {
    backend: &'a B,
    registry: &'a ProfileRegistry,
    policy: QuotaPolicy,
    conn: ConnectionManager,
}

impl<'a, B: ExecutionBackend> Orchestrator<'a, B> {
    pub fn new(
        backend: &'a B,
        registry: &'a ProfileRegistry,
        policy: QuotaPolicy,
        conn: ConnectionManager,
    ) -> Self {
        Self {
            backend,
            registry,
            policy,
            conn,
        }
    }

    /// Drive one request from `queued` to a terminal state. The returned
    /// result has already been persisted.
    #[instrument(
        skip(self, request),
        fields(
            execution_id = %request.id,
            language = %request.language,
            user_id = %request.user_id,
            kind = ?request.kind
        )
    )]
    pub async fn process(&mut self, request: ExecutionRequest) -> Result<ExecutionResult> {
        let mut result = ExecutionResult::queued(&request);
        result.started_at = Some(Utc::now());

        // Admission control while still queued: the counter is incremented
        // before comparison, so concurrent requests cannot race past the
        // ceiling. No container is provisioned on denial.
        match quota::admit(&mut self.conn, &request.user_id, &self.policy).await {
            Ok(Admission::Admitted) => {}
            Ok(Admission::Denied) => {
                info!("daily quota exceeded; refusing execution");
                result.failure_reason = Some(FailureReason::QuotaExceeded);
                return self.finish(result, ExecutionStatus::Failed, &request).await;
            }
            Err(e) => {
                error!(error = %e, "quota check failed");
                result.failure_reason = Some(FailureReason::Infrastructure);
                return self.finish(result, ExecutionStatus::Failed, &request).await;
            }
        }

        self.transition(&mut result, ExecutionStatus::Validating)
            .await?;

        let profile = match self.registry.get(&request.language) {
            Ok(profile) => profile.clone(),
            Err(e) => {
                // The API validates the language at submit time; reaching
                // this point means catalog drift between deployments.
                error!(error = %e, "request references an unknown language");
                result.failure_reason = Some(FailureReason::Infrastructure);
                return self.finish(result, ExecutionStatus::Failed, &request).await;
            }
        };

        if let Err(reason) =
            validator::check_payload_sizes(&request.source_code, &request.stdin)
        {
            result.rejections = vec![RuleMatch {
                category: "payload_too_large".to_string(),
                rule: reason,
            }];
            return self
                .finish(result, ExecutionStatus::SecurityRejected, &request)
                .await;
        }

        if let Err(matches) = validator::validate(&request.source_code, &profile) {
            info!(
                matched_rules = matches.len(),
                "submission rejected by static policy"
            );
            result.rejections = matches;
            return self
                .finish(result, ExecutionStatus::SecurityRejected, &request)
                .await;
        }

        // The caller may have cancelled while the request sat in the queue.
        if store::is_cancelled(&mut self.conn, &request.id)
            .await
            .unwrap_or(false)
        {
            return self
                .finish(result, ExecutionStatus::Cancelled, &request)
                .await;
        }

        self.transition(&mut result, ExecutionStatus::Running).await?;

        match request.kind {
            ExecutionKind::Playground => self.run_playground(&request, &profile, result).await,
            ExecutionKind::Graded => self.run_graded(&request, &profile, result).await,
        }
    }

    async fn run_playground(
        &mut self,
        request: &ExecutionRequest,
        profile: &LanguageProfile,
        mut result: ExecutionResult,
    ) -> Result<ExecutionResult> {
        let limits = ExecutionLimits::from_profile(profile, request.timeout_ms);
        let mut cancel = CancelProbe::new(self.conn.clone(), request.id);

        match self
            .backend
            .run(
                profile,
                &request.source_code,
                &request.stdin,
                &limits,
                &mut cancel,
            )
            .await
        {
            Ok(outcome) => {
                result.stdout = outcome.stdout;
                result.stderr = outcome.stderr;
                result.exit_code = outcome.exit_code;
                result.wall_time_ms = outcome.wall_time_ms;
                result.peak_memory_bytes = outcome.peak_memory_bytes;
                result.output_truncated = outcome.output_truncated;
                result.compile_failed = outcome.compile_failed;

                // A program that fails is still a completed execution:
                // failure lives in the output, not the lifecycle.
                let terminal = if outcome.cancelled {
                    ExecutionStatus::Cancelled
                } else if outcome.timed_out {
                    ExecutionStatus::TimedOut
                } else {
                    ExecutionStatus::Completed
                };
                self.finish(result, terminal, request).await
            }
            Err(e) => {
                error!(error = format!("{e:#}"), "sandbox infrastructure failure");
                result.failure_reason = Some(FailureReason::Infrastructure);
                self.finish(result, ExecutionStatus::Failed, request).await
            }
        }
    }

    /// One independent sandbox invocation per test case, each with its own
    /// stdin under the full profile budget. Cases not reached are recorded
    /// as skipped so the result always carries one entry per fixture.
    async fn run_graded(
        &mut self,
        request: &ExecutionRequest,
        profile: &LanguageProfile,
        mut result: ExecutionResult,
    ) -> Result<ExecutionResult> {
        let limits = ExecutionLimits::from_profile(profile, request.timeout_ms);
        let total = request.test_cases.len();
        let mut case_results = Vec::with_capacity(total);
        let mut cancelled = false;
        let mut infra_failed = false;
        let mut executed = 0usize;
        let mut timed_out_cases = 0usize;

        for (index, case) in request.test_cases.iter().enumerate() {
            // Cooperative cancellation between cases.
            if store::is_cancelled(&mut self.conn, &request.id)
                .await
                .unwrap_or(false)
            {
                cancelled = true;
                break;
            }

            let mut cancel = CancelProbe::new(self.conn.clone(), request.id);
            let outcome = match self
                .backend
                .run(
                    profile,
                    &request.source_code,
                    &case.stdin,
                    &limits,
                    &mut cancel,
                )
                .await
            {
                Ok(outcome) => outcome,
                Err(e) => {
                    error!(
                        test_id = case.id,
                        error = format!("{e:#}"),
                        "sandbox infrastructure failure during graded run"
                    );
                    infra_failed = true;
                    break;
                }
            };

            result.wall_time_ms += outcome.wall_time_ms;
            result.peak_memory_bytes = result.peak_memory_bytes.max(outcome.peak_memory_bytes);
            result.output_truncated |= outcome.output_truncated;

            let judged = verdict::judge_case(case, &outcome);
            executed += 1;
            if judged.status == TestCaseStatus::TimedOut {
                timed_out_cases += 1;
            }
            case_results.push(judged);

            if outcome.cancelled {
                cancelled = true;
                break;
            }

            // Each invocation compiles from scratch; a compile failure is
            // deterministic, so burning the remaining cases' budgets would
            // only repeat it.
            if outcome.compile_failed {
                result.compile_failed = true;
                for rest in &request.test_cases[index + 1..] {
                    case_results.push(verdict::judge_case(rest, &outcome));
                }
                break;
            }
        }

        // Cases never reached keep the one-result-per-fixture invariant.
        while case_results.len() < total {
            case_results.push(verdict::skipped_case(&request.test_cases[case_results.len()]));
        }

        let (score, max_score) = verdict::aggregate(&case_results);
        result.test_results = case_results;
        result.score = score;
        result.max_score = max_score;

        let terminal = if infra_failed {
            result.failure_reason = Some(FailureReason::Infrastructure);
            ExecutionStatus::Failed
        } else if cancelled {
            ExecutionStatus::Cancelled
        } else if executed > 0 && timed_out_cases == executed {
            // The program never got through a single case in time.
            ExecutionStatus::TimedOut
        } else {
            ExecutionStatus::Completed
        };

        self.finish(result, terminal, request).await
    }

    /// Persist an intermediate status transition.
    async fn transition(
        &mut self,
        result: &mut ExecutionResult,
        next: ExecutionStatus,
    ) -> Result<()> {
        if !result.status.can_transition(next) {
            anyhow::bail!("invalid status transition {} -> {}", result.status, next);
        }
        result.status = next;
        store::store_result(&mut self.conn, result).await?;
        Ok(())
    }

    /// Move to a terminal state, persist the final snapshot and account
    /// resource usage. The store refuses to overwrite an already-terminal
    /// record, keeping results append-only.
    async fn finish(
        &mut self,
        mut result: ExecutionResult,
        terminal: ExecutionStatus,
        request: &ExecutionRequest,
    ) -> Result<ExecutionResult> {
        if !result.status.can_transition(terminal) {
            anyhow::bail!(
                "invalid terminal transition {} -> {}",
                result.status,
                terminal
            );
        }
        result.status = terminal;
        result.finished_at = Some(Utc::now());

        let written = store::store_result(&mut self.conn, &result).await?;
        if !written {
            warn!("terminal snapshot already stored; keeping the existing record");
        }

        // Wall time stands in for CPU time in the usage ledger; memory is
        // integrated as peak-bytes x wall-seconds.
        let memory_byte_seconds = result
            .peak_memory_bytes
            .saturating_mul(result.wall_time_ms / 1000);
        if let Err(e) = quota::record_usage(
            &mut self.conn,
            &request.user_id,
            result.wall_time_ms,
            memory_byte_seconds,
        )
        .await
        {
            warn!(error = %e, "failed to record quota usage");
        }

        info!(
            status = %result.status,
            wall_time_ms = result.wall_time_ms,
            score = result.score,
            max_score = result.max_score,
            "execution reached terminal state"
        );
        Ok(result)
    }
}
