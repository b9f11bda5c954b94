//! Failure diagnosis and bounded self-healing
//!
//! Failure text is matched against an ordered diagnosis table. Entries carry
//! a category, a likely cause, suggested fixes, and (when auto-fixable) a
//! recovery command template filled from the pattern's capture groups.
//! Anything unmatched falls through to "unknown" instead of crashing the
//! process. Retry budgeting lives with the caller: the engine only answers
//! "may I retry" given the current count.

use once_cell::sync::Lazy;
use regex::Regex;

use crate::types::{ActionKind, ErrorCategory, ErrorDiagnosis};

struct DiagnosisRule {
    pattern: Regex,
    category: ErrorCategory,
    /// May reference `{1}` for the pattern's first capture group.
    cause: &'static str,
    suggested_fixes: &'static [&'static str],
    auto_fixable: bool,
    /// Recovery command templates, `{1}` filled from the capture.
    recovery_commands: &'static [&'static str],
}

fn rule(
    pattern: &str,
    category: ErrorCategory,
    cause: &'static str,
    suggested_fixes: &'static [&'static str],
    auto_fixable: bool,
    recovery_commands: &'static [&'static str],
) -> DiagnosisRule {
    DiagnosisRule {
        pattern: Regex::new(pattern).unwrap(),
        category,
        cause,
        suggested_fixes,
        auto_fixable,
        recovery_commands,
    }
}

/// Ordered: first match wins, so the more specific entries come first.
static DIAGNOSIS_TABLE: Lazy<Vec<DiagnosisRule>> = Lazy::new(|| {
    use ErrorCategory::*;
    vec![
        rule(
            // Capture only a plausible package name; shell metacharacters in
            // the failure text must not reach the install template.
            r"(?i)cannot find module '(@?[A-Za-z0-9._/-]+)'",
            Dependency,
            "node module '{1}' is not installed",
            &["install the package", "check package.json for the dependency"],
            true,
            &["npm install {1}"],
        ),
        rule(
            r"(?i)no module named '?([A-Za-z0-9_.-]+)'?",
            Dependency,
            "python module '{1}' is not installed",
            &["install the package", "check the active virtualenv"],
            true,
            &["pip install {1}"],
        ),
        rule(
            r"(?i)can't resolve '([^']+)'|could not find crate `([^`]+)`",
            Dependency,
            "a required dependency is missing",
            &["install the missing dependency"],
            false,
            &[],
        ),
        rule(
            r"(?i)error TS\d+|type '.*' is not assignable",
            Type,
            "type mismatch reported by the compiler",
            &["fix the type annotation or the value producing it"],
            false,
            &[],
        ),
        rule(
            r"(?i)syntaxerror|unexpected token|expected .* found",
            Syntax,
            "the file does not parse",
            &["re-check the most recent edit for unbalanced syntax"],
            false,
            &[],
        ),
        rule(
            r"(?i)(eacces|permission denied|operation not permitted)",
            Permission,
            "insufficient filesystem or process permissions",
            &[
                "check file ownership and mode",
                "run the operation in a directory the agent owns",
            ],
            false,
            &[],
        ),
        rule(
            r"(?i)(eaddrinuse|address already in use|port (\d+) is already)",
            PortConflict,
            "the target port is already bound",
            &["relocate the server to a free port", "stop the process occupying it"],
            true,
            &[],
        ),
        rule(
            r"(?i)(econnrefused|enotfound|etimedout|network is unreachable|could not resolve host)",
            Network,
            "a network endpoint is unreachable",
            &["check connectivity and the endpoint address", "retry once the network recovers"],
            false,
            &[],
        ),
        rule(
            r"(?i)(eslint|prettier|clippy|rustfmt).*(error|warning)|lint error",
            Lint,
            "lint or formatting violations",
            &["run the formatter with its auto-fix flag"],
            true,
            &["npx prettier --write . || cargo fmt || true"],
        ),
    ]
});

/// Diagnoses failures and synthesizes bounded automatic recovery.
pub struct SelfHealingEngine {
    max_retries: u32,
}

impl SelfHealingEngine {
    pub fn new(max_retries: u32) -> Self {
        Self { max_retries }
    }

    pub fn max_retries(&self) -> u32 {
        self.max_retries
    }

    /// Classify failure text. Never fails: unmatched text gets the
    /// "unknown" category with no recovery actions.
    pub fn diagnose(&self, failure_text: &str) -> ErrorDiagnosis {
        for rule in DIAGNOSIS_TABLE.iter() {
            if let Some(captures) = rule.pattern.captures(failure_text) {
                let capture = captures
                    .iter()
                    .skip(1)
                    .flatten()
                    .next()
                    .map(|m| m.as_str().to_string())
                    .unwrap_or_default();
                let recovery_actions = rule
                    .recovery_commands
                    .iter()
                    .map(|template| ActionKind::RunCommand {
                        command: template.replace("{1}", &capture),
                    })
                    .collect();
                let diagnosis = ErrorDiagnosis {
                    error_type: rule.category,
                    message: first_line(failure_text),
                    likely_cause: rule.cause.replace("{1}", &capture),
                    suggested_fixes: rule.suggested_fixes.iter().map(|s| s.to_string()).collect(),
                    auto_fixable: rule.auto_fixable,
                    recovery_actions,
                };
                log::debug!(
                    "[SelfHealing] diagnosis: {} ({})",
                    diagnosis.likely_cause,
                    diagnosis.error_type
                );
                return diagnosis;
            }
        }
        ErrorDiagnosis {
            error_type: ErrorCategory::Unknown,
            message: first_line(failure_text),
            likely_cause: "unrecognized failure".to_string(),
            suggested_fixes: vec!["inspect the captured output manually".to_string()],
            auto_fixable: false,
            recovery_actions: Vec::new(),
        }
    }

    /// Whether another automatic retry is allowed for this diagnosis.
    pub fn can_retry(&self, diagnosis: &ErrorDiagnosis, retry_count: u32) -> bool {
        diagnosis.auto_fixable && retry_count < self.max_retries
    }
}

impl Default for SelfHealingEngine {
    fn default() -> Self {
        Self::new(3)
    }
}

fn first_line(text: &str) -> String {
    text.lines()
        .map(str::trim)
        .find(|l| !l.is_empty())
        .unwrap_or("")
        .to_string()
}
