//! Test verdict engine - language-agnostic scoring.
//!
//! Compares raw execution outputs against expected test outputs and
//! assigns points. Knows nothing about Docker, runtimes, or queues: a pure
//! function from (captured output, fixture) to a verdict, so scoring is
//! deterministic regardless of the execution backend.
//!
//! Precedence per case: cancellation > timeout > runtime/compile failure >
//! output comparison. Aggregate score is the sum of passed cases' points,
//! independent of execution order.

use crucible_common::types::{
    ComparatorKind, RawOutcome, TestCase, TestCaseResult, TestCaseStatus,
};

/// Judge one case from its captured output.
pub fn judge_case(case: &TestCase, outcome: &RawOutcome) -> TestCaseResult {
    let (status, feedback) = if outcome.cancelled {
        (TestCaseStatus::Skipped, Some("execution cancelled".to_string()))
    } else if outcome.timed_out {
        (TestCaseStatus::TimedOut, Some("time limit exceeded".to_string()))
    } else if outcome.compile_failed {
        (
            TestCaseStatus::RuntimeError,
            Some("compilation failed".to_string()),
        )
    } else if outcome.exit_code != Some(0) {
        (
            TestCaseStatus::RuntimeError,
            Some(format!(
                "program exited with code {}",
                outcome
                    .exit_code
                    .map(|c| c.to_string())
                    .unwrap_or_else(|| "unknown".to_string())
            )),
        )
    } else {
        match compare(&case.comparator, &case.expected_stdout, &outcome.stdout) {
            Ok(()) => (TestCaseStatus::Passed, None),
            Err(feedback) => (TestCaseStatus::Failed, Some(feedback)),
        }
    };

    let points_awarded = if status == TestCaseStatus::Passed {
        case.points
    } else {
        0
    };

    TestCaseResult {
        test_id: case.id,
        name: case.name.clone(),
        status,
        actual_stdout: outcome.stdout.clone(),
        feedback,
        points_awarded,
        points_possible: case.points,
        wall_time_ms: outcome.wall_time_ms,
    }
}

/// Placeholder result for a case that never ran (cancellation or an
/// earlier infrastructure failure). Keeps the one-result-per-case
/// invariant intact.
pub fn skipped_case(case: &TestCase) -> TestCaseResult {
    TestCaseResult {
        test_id: case.id,
        name: case.name.clone(),
        status: TestCaseStatus::Skipped,
        actual_stdout: String::new(),
        feedback: None,
        points_awarded: 0,
        points_possible: case.points,
        wall_time_ms: 0,
    }
}

/// Sum awarded and possible points across the suite.
pub fn aggregate(results: &[TestCaseResult]) -> (u32, u32) {
    let score = results.iter().map(|r| r.points_awarded).sum();
    let max_score = results.iter().map(|r| r.points_possible).sum();
    (score, max_score)
}

/// Compare expected against actual output under the given comparator.
/// `Err` carries student-facing feedback describing the mismatch.
pub fn compare(
    comparator: &ComparatorKind,
    expected: &str,
    actual: &str,
) -> Result<(), String> {
    match comparator {
        ComparatorKind::Exact => {
            let expected = trim_trailing_newline(expected);
            let actual = trim_trailing_newline(actual);
            if expected == actual {
                Ok(())
            } else {
                Err(mismatch_feedback(expected, actual))
            }
        }
        ComparatorKind::WhitespaceInsensitive => {
            let expected = collapse_whitespace(expected);
            let actual = collapse_whitespace(actual);
            if expected == actual {
                Ok(())
            } else {
                Err(mismatch_feedback(&expected, &actual))
            }
        }
        ComparatorKind::NumericTolerance { epsilon } => {
            numeric_compare(expected, actual, *epsilon)
        }
    }
}

/// Strip exactly one trailing newline (LF or CRLF). A program that prints
/// `42\n` matches an expectation of `42`; extra blank lines do not.
fn trim_trailing_newline(s: &str) -> &str {
    let s = s.strip_suffix('\n').unwrap_or(s);
    s.strip_suffix('\r').unwrap_or(s)
}

/// Collapse every run of whitespace to a single space and trim the ends.
fn collapse_whitespace(s: &str) -> String {
    s.split_whitespace().collect::<Vec<_>>().join(" ")
}

/// Parse both sides as whitespace-separated floating-point sequences and
/// compare within epsilon. Unparseable or length-mismatched actual output
/// is a plain failure, never an engine error.
fn numeric_compare(expected: &str, actual: &str, epsilon: f64) -> Result<(), String> {
    let expected_values: Vec<f64> = match parse_floats(expected) {
        Some(values) => values,
        None => {
            return Err("expected output is not a numeric sequence".to_string());
        }
    };
    let actual_values = match parse_floats(actual) {
        Some(values) => values,
        None => {
            return Err("output is not a numeric sequence".to_string());
        }
    };

    if expected_values.len() != actual_values.len() {
        return Err(format!(
            "expected {} numeric values, got {}",
            expected_values.len(),
            actual_values.len()
        ));
    }

    for (index, (e, a)) in expected_values.iter().zip(actual_values.iter()).enumerate() {
        if (e - a).abs() > epsilon {
            return Err(format!(
                "value {} differs: expected {e}, got {a} (tolerance {epsilon})",
                index + 1
            ));
        }
    }
    Ok(())
}

fn parse_floats(s: &str) -> Option<Vec<f64>> {
    let mut values = Vec::new();
    for token in s.split_whitespace() {
        values.push(token.parse::<f64>().ok()?);
    }
    Some(values)
}

fn mismatch_feedback(expected: &str, actual: &str) -> String {
    format!(
        "expected {:?}, got {:?}",
        preview(expected),
        preview(actual)
    )
}

/// First line, capped, so feedback stays readable for multi-line output.
fn preview(s: &str) -> String {
    const MAX: usize = 120;
    let first_line = s.lines().next().unwrap_or("");
    let mut out: String = first_line.chars().take(MAX).collect();
    if first_line.chars().count() > MAX || s.lines().count() > 1 {
        out.push_str("...");
    }
    out
}
