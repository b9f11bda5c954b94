//! Post-mutation verification
//!
//! Maps `(action kind, file extension)` to a list of checks, each required
//! or optional. Required failures mark the step failed and trigger
//! self-healing; optional failures become warnings and never block. Checks
//! run under the same timeout/capture discipline as regular actions.

use std::path::{Path, PathBuf};

use crate::error::WardenResult;
use crate::exec;
use crate::types::ActionKind;

/// How a check is performed.
#[derive(Debug, Clone, PartialEq)]
pub enum CheckMethod {
    /// Shell command run in the workspace root.
    Shell(String),
    /// In-process JSON parse; no subprocess needed.
    ParseJson(PathBuf),
}

#[derive(Debug, Clone, PartialEq)]
pub struct VerificationCheck {
    pub label: String,
    pub method: CheckMethod,
    pub required: bool,
}

/// Result of running every check for one action.
#[derive(Debug, Clone, Default)]
pub struct VerificationReport {
    /// False when any required check failed.
    pub passed: bool,
    /// Failure text of required checks, for diagnosis.
    pub failures: Vec<String>,
    /// Optional-check failures; recorded, never blocking.
    pub warnings: Vec<String>,
}

pub struct VerificationEngine {
    workspace_root: PathBuf,
    timeout_secs: u64,
}

impl VerificationEngine {
    pub fn new(workspace_root: PathBuf, timeout_secs: u64) -> Self {
        Self {
            workspace_root,
            timeout_secs,
        }
    }

    /// The check table. `resolved` is the on-disk path of a file action.
    pub fn checks_for(&self, action: &ActionKind, resolved: Option<&Path>) -> Vec<VerificationCheck> {
        match action {
            ActionKind::CreateFile { path, .. } | ActionKind::EditFile { path, .. } => {
                let on_disk = resolved
                    .map(Path::to_path_buf)
                    .unwrap_or_else(|| self.workspace_root.join(path));
                self.file_checks(path, &on_disk)
            }
            ActionKind::InstallTool { tool } => vec![VerificationCheck {
                label: format!("{} responds to --version", tool),
                method: CheckMethod::Shell(format!("{} --version", tool)),
                required: false,
            }],
            // Commands, port probes and kills verify themselves through
            // their own exit status / re-probe.
            ActionKind::RunCommand { .. }
            | ActionKind::CheckPort { .. }
            | ActionKind::KillPort { .. } => Vec::new(),
        }
    }

    fn file_checks(&self, logical_path: &str, on_disk: &Path) -> Vec<VerificationCheck> {
        let ext = Path::new(logical_path)
            .extension()
            .and_then(|e| e.to_str())
            .unwrap_or("");
        let quoted = shell_quote(&on_disk.display().to_string());
        match ext {
            "py" => vec![VerificationCheck {
                label: "python syntax check".to_string(),
                method: CheckMethod::Shell(format!("python3 -m py_compile {}", quoted)),
                required: true,
            }],
            "json" => vec![VerificationCheck {
                label: "json parse check".to_string(),
                method: CheckMethod::ParseJson(on_disk.to_path_buf()),
                required: true,
            }],
            "sh" => vec![VerificationCheck {
                label: "shell syntax check".to_string(),
                method: CheckMethod::Shell(format!("bash -n {}", quoted)),
                required: true,
            }],
            "js" => vec![VerificationCheck {
                label: "node syntax check".to_string(),
                method: CheckMethod::Shell(format!("node --check {}", quoted)),
                required: true,
            }],
            "rs" => {
                // cargo checks only make sense inside a crate.
                if self.workspace_root.join("Cargo.toml").exists() {
                    vec![
                        VerificationCheck {
                            label: "cargo check".to_string(),
                            method: CheckMethod::Shell("cargo check --quiet".to_string()),
                            required: true,
                        },
                        VerificationCheck {
                            label: "cargo fmt check".to_string(),
                            method: CheckMethod::Shell("cargo fmt --check".to_string()),
                            required: false,
                        },
                    ]
                } else {
                    Vec::new()
                }
            }
            _ => Vec::new(),
        }
    }

    /// Run every check for an action, splitting failures by required flag.
    pub async fn run(
        &self,
        action: &ActionKind,
        resolved: Option<&Path>,
    ) -> WardenResult<VerificationReport> {
        let checks = self.checks_for(action, resolved);
        let mut report = VerificationReport {
            passed: true,
            ..Default::default()
        };
        for check in checks {
            let failure = self.run_check(&check).await?;
            if let Some(text) = failure {
                if check.required {
                    log::warn!("[Verification] required check failed: {}", check.label);
                    report.passed = false;
                    report.failures.push(format!("{}: {}", check.label, text));
                } else {
                    log::debug!("[Verification] optional check failed: {}", check.label);
                    report.warnings.push(format!("{}: {}", check.label, text));
                }
            }
        }
        Ok(report)
    }

    /// None on pass, failure text on fail.
    async fn run_check(&self, check: &VerificationCheck) -> WardenResult<Option<String>> {
        match &check.method {
            CheckMethod::Shell(command) => {
                let out =
                    exec::run_shell(command, Some(&self.workspace_root), self.timeout_secs).await?;
                if out.success {
                    Ok(None)
                } else {
                    Ok(Some(out.failure_text()))
                }
            }
            CheckMethod::ParseJson(path) => {
                let raw = tokio::fs::read_to_string(path).await?;
                match serde_json::from_str::<serde_json::Value>(&raw) {
                    Ok(_) => Ok(None),
                    Err(e) => Ok(Some(e.to_string())),
                }
            }
        }
    }
}

fn shell_quote(s: &str) -> String {
    format!("'{}'", s.replace('\'', r"'\''"))
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    fn engine(root: &Path) -> VerificationEngine {
        VerificationEngine::new(root.to_path_buf(), 30)
    }

    #[test]
    fn table_selects_checks_by_extension() {
        let dir = tempdir().unwrap();
        let engine = engine(dir.path());

        let py = ActionKind::CreateFile {
            path: "a.py".to_string(),
            content: String::new(),
        };
        let checks = engine.checks_for(&py, None);
        assert_eq!(checks.len(), 1);
        assert!(checks[0].required);

        let txt = ActionKind::CreateFile {
            path: "notes.txt".to_string(),
            content: String::new(),
        };
        assert!(engine.checks_for(&txt, None).is_empty());

        let cmd = ActionKind::RunCommand {
            command: "ls".to_string(),
        };
        assert!(engine.checks_for(&cmd, None).is_empty());

        let tool = ActionKind::InstallTool {
            tool: "ripgrep".to_string(),
        };
        let checks = engine.checks_for(&tool, None);
        assert_eq!(checks.len(), 1);
        assert!(!checks[0].required);
    }

    #[tokio::test]
    async fn json_parse_check_passes_and_fails_in_process() {
        let dir = tempdir().unwrap();
        let engine = engine(dir.path());

        let good = dir.path().join("good.json");
        tokio::fs::write(&good, r#"{"ok": true}"#).await.unwrap();
        let action = ActionKind::CreateFile {
            path: "good.json".to_string(),
            content: String::new(),
        };
        let report = engine.run(&action, Some(&good)).await.unwrap();
        assert!(report.passed);
        assert!(report.failures.is_empty());

        let bad = dir.path().join("bad.json");
        tokio::fs::write(&bad, "{nope").await.unwrap();
        let action = ActionKind::CreateFile {
            path: "bad.json".to_string(),
            content: String::new(),
        };
        let report = engine.run(&action, Some(&bad)).await.unwrap();
        assert!(!report.passed);
        assert_eq!(report.failures.len(), 1);
    }

    #[tokio::test]
    async fn optional_failure_is_a_warning_not_a_block() {
        let dir = tempdir().unwrap();
        let engine = engine(dir.path());
        // A tool that does not exist: the optional --version check fails.
        let action = ActionKind::InstallTool {
            tool: "definitely-not-a-real-tool-xyz".to_string(),
        };
        let report = engine.run(&action, None).await.unwrap();
        assert!(report.passed);
        assert_eq!(report.warnings.len(), 1);
    }
}
