//! Static policy validator.
//!
//! Pattern-matches submitted source against the profile's denylist before
//! any container is provisioned. Deliberately conservative: any match
//! rejects, and every matched rule is reported so the caller can show
//! actionable feedback. This is an advisory fast-fail layer; the network-
//! isolated container is the actual security boundary.

use crucible_common::profiles::LanguageProfile;
use crucible_common::types::RuleMatch;
use regex::Regex;
use tracing::warn;

/// Safety caps applied before any execution machinery is touched.
pub const MAX_SOURCE_BYTES: usize = 1024 * 1024; // 1MB
pub const MAX_STDIN_BYTES: usize = 10 * 1024 * 1024; // 10MB

/// Reject oversized payloads up front. Sizes over these caps never reach
/// the denylist scan, let alone Docker.
pub fn check_payload_sizes(source: &str, stdin: &str) -> Result<(), String> {
    if source.len() > MAX_SOURCE_BYTES {
        return Err(format!(
            "source code exceeds maximum size of {MAX_SOURCE_BYTES} bytes"
        ));
    }
    if stdin.len() > MAX_STDIN_BYTES {
        return Err(format!(
            "stdin exceeds maximum size of {MAX_STDIN_BYTES} bytes"
        ));
    }
    Ok(())
}

/// Scan `source` against the profile denylist.
///
/// Fails closed: source that cannot be scanned meaningfully (NUL bytes) and
/// rules that cannot be compiled both produce rejections rather than a
/// silent pass.
pub fn validate(source: &str, profile: &LanguageProfile) -> Result<(), Vec<RuleMatch>> {
    let mut matches = Vec::new();

    if source.contains('\0') {
        matches.push(RuleMatch {
            category: "unscannable_input".to_string(),
            rule: "source contains NUL bytes".to_string(),
        });
        return Err(matches);
    }

    for rule in &profile.denylist {
        match Regex::new(&rule.pattern) {
            Ok(re) => {
                if re.is_match(source) {
                    matches.push(RuleMatch {
                        category: rule.category.clone(),
                        rule: rule.pattern.clone(),
                    });
                }
            }
            Err(e) => {
                // A broken rule must not widen what is allowed.
                warn!(
                    language = %profile.id,
                    category = %rule.category,
                    error = %e,
                    "denylist rule failed to compile; rejecting submission"
                );
                matches.push(RuleMatch {
                    category: rule.category.clone(),
                    rule: "policy rule could not be evaluated".to_string(),
                });
            }
        }
    }

    if matches.is_empty() {
        Ok(())
    } else {
        Err(matches)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crucible_common::profiles::{DenyRule, NetworkPolicy};

    fn python_profile() -> LanguageProfile {
        LanguageProfile {
            id: "python".to_string(),
            display_name: "Python".to_string(),
            version: "3.12".to_string(),
            image: "crucible-python:3.12".to_string(),
            file_extension: "py".to_string(),
            compile_command: None,
            run_command: "python3 -u main.py".to_string(),
            default_timeout_ms: 10_000,
            max_memory_mb: 128,
            max_cpus: 1.0,
            max_cpu_time_s: 10,
            network_policy: NetworkPolicy::Deny,
            supports_stdin: true,
            max_output_bytes: 1024 * 1024,
            pids_limit: 64,
            denylist: vec![
                DenyRule {
                    category: "process_spawn".to_string(),
                    pattern: r"\b(?:import\s+subprocess|os\.system)".to_string(),
                },
                DenyRule {
                    category: "raw_sockets".to_string(),
                    pattern: r"\bimport\s+socket\b".to_string(),
                },
                DenyRule {
                    category: "dynamic_eval".to_string(),
                    pattern: r"\b(?:eval|exec)\s*\(|__import__".to_string(),
                },
            ],
        }
    }

    #[test]
    fn clean_source_passes() {
        let profile = python_profile();
        assert!(validate("print(int(input()) * 2)\n", &profile).is_ok());
    }

    #[test]
    fn denylisted_import_is_rejected_with_its_category() {
        let profile = python_profile();
        let matches = validate("import subprocess\nsubprocess.run(['ls'])", &profile)
            .expect_err("must reject");
        assert_eq!(matches.len(), 1);
        assert_eq!(matches[0].category, "process_spawn");
    }

    #[test]
    fn every_matching_rule_is_reported() {
        let profile = python_profile();
        let source = "import socket\neval(input())\n";
        let matches = validate(source, &profile).expect_err("must reject");
        let categories: Vec<&str> = matches.iter().map(|m| m.category.as_str()).collect();
        assert!(categories.contains(&"raw_sockets"));
        assert!(categories.contains(&"dynamic_eval"));
    }

    #[test]
    fn broken_rule_fails_closed() {
        let mut profile = python_profile();
        profile.denylist.push(DenyRule {
            category: "reflection".to_string(),
            pattern: "(unclosed".to_string(),
        });
        let matches = validate("print('hello')", &profile).expect_err("must reject");
        assert_eq!(matches.len(), 1);
        assert_eq!(matches[0].category, "reflection");
        // The broken pattern itself is not echoed back to students.
        assert!(!matches[0].rule.contains("unclosed"));
    }

    #[test]
    fn nul_bytes_fail_closed() {
        let profile = python_profile();
        let matches = validate("print('hi')\0", &profile).expect_err("must reject");
        assert_eq!(matches[0].category, "unscannable_input");
    }

    #[test]
    fn payload_caps_are_enforced() {
        assert!(check_payload_sizes("print()", "").is_ok());
        let big = "x".repeat(MAX_SOURCE_BYTES + 1);
        assert!(check_payload_sizes(&big, "").is_err());
        let big_stdin = "y".repeat(MAX_STDIN_BYTES + 1);
        assert!(check_payload_sizes("print()", &big_stdin).is_err());
    }

    #[test]
    fn empty_denylist_allows_everything() {
        let mut profile = python_profile();
        profile.denylist.clear();
        assert!(validate("import socket", &profile).is_ok());
    }
}
