//! Risk assessment, deny-list, and pre-execution safety policy
//!
//! The indicator catalog is data-driven: each entry carries a compiled
//! pattern, a category, a severity (1-10) and the minimum approval tier it
//! triggers. All patterns are compiled once at startup; extension rules
//! supplied by an organization are validated eagerly and can only raise the
//! computed tier, never lower it.
//!
//! The deny-list runs before any scoring: a match rejects the whole plan
//! regardless of approval.

use once_cell::sync::Lazy;
use regex::Regex;
use serde::{Deserialize, Serialize};
use std::path::{Component, Path, PathBuf};

use crate::config::{PolicyRule, PolicyTarget};
use crate::error::{SafetyViolation, WardenError, WardenResult};
use crate::types::{ActionKind, ApprovalTier, ProposedAction, RiskLevel};

/// Category a risk indicator belongs to.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RiskCategory {
    Security,
    Data,
    Infrastructure,
    Financial,
    Compliance,
    ThirdParty,
}

/// One catalog entry.
pub struct RiskIndicator {
    pub pattern: Regex,
    pub category: RiskCategory,
    /// 1-10; summed into the risk score.
    pub severity: u32,
    pub min_tier: ApprovalTier,
    pub label: &'static str,
}

fn indicator(
    pattern: &str,
    category: RiskCategory,
    severity: u32,
    min_tier: ApprovalTier,
    label: &'static str,
) -> RiskIndicator {
    RiskIndicator {
        // Built-in patterns are static and covered by tests.
        pattern: Regex::new(pattern).unwrap(),
        category,
        severity,
        min_tier,
        label,
    }
}

/// Built-in indicator catalog, compiled once.
static CATALOG: Lazy<Vec<RiskIndicator>> = Lazy::new(|| {
    // Both enums declare `Security`; spell the tier out to keep the glob on
    // the category side only.
    use ApprovalTier::{MultiParty, TeamLead, User};
    use RiskCategory::*;
    vec![
        // Security
        indicator(
            r"(?i)\b(password|passwd|secret|api[_-]?key|credential|private[_-]?key|auth[_-]?token)\b",
            Security, 7, ApprovalTier::Security, "credential material referenced",
        ),
        indicator(
            r"(?i)\.env\b",
            Security, 6, ApprovalTier::Security, "environment secrets file touched",
        ),
        indicator(
            r"(?i)\bsudo\b",
            Security, 8, ApprovalTier::Security, "elevated privileges requested",
        ),
        indicator(
            r"(?i)\bchmod\s+[0-7]*7[0-7]*\b|\bchown\b",
            Security, 5, TeamLead, "permission change",
        ),
        // Data
        indicator(
            r"(?i)\b(drop\s+(table|database)|truncate\s+table|delete\s+from)\b",
            Data, 8, ApprovalTier::Security, "destructive database statement",
        ),
        indicator(r"(?i)\brm\s+-[a-z]*r", Data, 7, TeamLead, "recursive delete"),
        indicator(
            r"(?i)\b(migration|alter\s+table)\b",
            Data, 5, TeamLead, "schema migration",
        ),
        // Infrastructure
        indicator(
            r"(?i)\b(kubectl|terraform|docker\s+(rm|rmi|system)|systemctl)\b",
            Infrastructure, 6, TeamLead, "infrastructure tooling",
        ),
        indicator(
            r"(?i)\b(deploy|production|prod)\b",
            Infrastructure, 6, TeamLead, "production deployment reference",
        ),
        indicator(
            r"(?i)\b(iptables|firewall|dns\s+record)\b",
            Infrastructure, 7, ApprovalTier::Security, "network infrastructure change",
        ),
        // Financial
        indicator(
            r"(?i)\b(payment|billing|stripe|invoice|payout|refund)\b",
            Financial, 8, MultiParty, "payment system touched",
        ),
        // Compliance
        indicator(
            r"(?i)\b(gdpr|hipaa|pii|personal\s+data|data\s+retention)\b",
            Compliance, 7, ApprovalTier::Security, "regulated data referenced",
        ),
        // Third-party
        indicator(
            r"(?i)(curl|wget)\s+[^|;]*\|\s*(sh|bash)\b",
            ThirdParty, 9, MultiParty, "remote script piped to shell",
        ),
        indicator(
            r"(?i)\b(npm\s+install|pip3?\s+install|cargo\s+add|gem\s+install|apt(-get)?\s+install)\b",
            ThirdParty, 3, User, "third-party package installation",
        ),
        indicator(
            r"(?i)\bgit\s+push\b",
            ThirdParty, 4, User, "push to remote repository",
        ),
    ]
});

/// Unconditionally destructive patterns. Matching any of these rejects the
/// plan before risk scoring; approval cannot override them.
static DENY_LIST: Lazy<Vec<(Regex, &'static str)>> = Lazy::new(|| {
    let entries: Vec<(&str, &str)> = vec![
        (
            r"(?i)\brm\s+(-[a-z]*\s+)*-[a-z]*[rf][a-z]*\s+(/|/\*|~|\$HOME)(\s|$)",
            "recursive delete of a root path",
        ),
        (r"(?i)\bsudo\s+rm\b", "elevated recursive delete"),
        (
            r"(?i)\bgit\s+push\s+[^\n]*(--force|-f)\b",
            "forced history rewrite",
        ),
        (
            r"(?i)\b(dd\s+[^\n]*of=/dev/|mkfs(\.[a-z0-9]+)?\s)",
            "raw block device write",
        ),
        (r":\(\)\s*\{\s*:\|:&\s*\};:", "fork bomb"),
        (
            r"(?i)\bchmod\s+(-[a-z]+\s+)*777\s+/(\s|$)",
            "world-writable filesystem root",
        ),
        (r"(?i)>\s*/dev/sd[a-z]\b", "overwrite of a block device"),
    ];
    entries
        .into_iter()
        .map(|(p, label)| (Regex::new(p).unwrap(), label))
        .collect()
});

/// Result of assessing one action.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RiskAssessment {
    pub risk_categories: Vec<RiskCategory>,
    /// Sum of matched indicator severities.
    pub risk_score: u32,
    pub required_approval: ApprovalTier,
    /// Human-readable labels of matched indicators.
    pub matched: Vec<String>,
}

impl RiskAssessment {
    pub fn risk_level(&self) -> RiskLevel {
        RiskLevel::from_score(self.risk_score)
    }
}

/// Compiled organization policy rule.
struct CompiledRule {
    pattern: Regex,
    applies_to: PolicyTarget,
    min_tier: ApprovalTier,
}

/// Classifies a proposed action's risk and required approval tier.
pub struct RiskAssessor {
    extensions: Vec<CompiledRule>,
}

impl RiskAssessor {
    pub fn new() -> Self {
        Self {
            extensions: Vec::new(),
        }
    }

    /// Build with organization policy rules; every pattern is compiled and
    /// validated here, so a bad rule fails construction.
    pub fn with_policy(rules: &[PolicyRule]) -> WardenResult<Self> {
        let mut extensions = Vec::with_capacity(rules.len());
        for rule in rules {
            let pattern = Regex::new(&rule.pattern).map_err(|source| WardenError::Pattern {
                pattern: rule.pattern.clone(),
                source,
            })?;
            extensions.push(CompiledRule {
                pattern,
                applies_to: rule.applies_to,
                min_tier: rule.min_tier,
            });
        }
        Ok(Self { extensions })
    }

    /// Check one action against the deny-list. Runs before scoring.
    pub fn check_denied(&self, action: &ActionKind) -> Option<SafetyViolation> {
        let text = action.scan_text();
        for (pattern, label) in DENY_LIST.iter() {
            if pattern.is_match(&text) {
                log::warn!("[RiskAssessor] deny-list hit '{}' on: {}", label, action);
                return Some(SafetyViolation::DeniedCommand {
                    pattern: label.to_string(),
                    command: text,
                });
            }
        }
        None
    }

    /// Score one action against the catalog plus policy extensions. The
    /// tier only ever moves up as more indicators match.
    pub fn assess(&self, action: &ActionKind) -> RiskAssessment {
        let text = action.scan_text();
        let mut categories = Vec::new();
        let mut score = 0;
        let mut tier = ApprovalTier::None;
        let mut matched = Vec::new();

        for entry in CATALOG.iter() {
            if entry.pattern.is_match(&text) {
                if !categories.contains(&entry.category) {
                    categories.push(entry.category);
                }
                score += entry.severity;
                tier = tier.max(entry.min_tier);
                matched.push(entry.label.to_string());
            }
        }

        for rule in &self.extensions {
            let target_text = match rule.applies_to {
                PolicyTarget::Path => match action {
                    ActionKind::CreateFile { path, .. } | ActionKind::EditFile { path, .. } => {
                        path.clone()
                    }
                    _ => continue,
                },
                PolicyTarget::Command => match action {
                    ActionKind::RunCommand { command } => command.clone(),
                    _ => continue,
                },
                PolicyTarget::Any => text.clone(),
            };
            if rule.pattern.is_match(&target_text) {
                // Policy can only raise the tier.
                tier = tier.max(rule.min_tier);
                matched.push(format!("organization policy rule '{}'", rule.pattern));
            }
        }

        // Any matched indicator means at least a human looks at it.
        if score > 0 {
            tier = tier.max(ApprovalTier::User);
        }

        RiskAssessment {
            risk_categories: categories,
            risk_score: score,
            required_approval: tier,
            matched,
        }
    }
}

impl Default for RiskAssessor {
    fn default() -> Self {
        Self::new()
    }
}

/// Pre-execution safety validation, checked before any checkpoint or
/// execution. Violations reject the entire plan and are never downgraded to
/// warnings.
pub struct SafetyPolicy {
    workspace_root: PathBuf,
    max_file_bytes: usize,
}

impl SafetyPolicy {
    pub fn new(workspace_root: PathBuf, max_file_bytes: usize) -> Self {
        Self {
            workspace_root,
            max_file_bytes,
        }
    }

    /// Validate a full action list. First violation wins.
    pub fn validate_plan(
        &self,
        assessor: &RiskAssessor,
        actions: &[ProposedAction],
    ) -> Result<(), SafetyViolation> {
        for action in actions {
            if let Some(violation) = assessor.check_denied(&action.kind) {
                return Err(violation);
            }
            match &action.kind {
                ActionKind::CreateFile { path, content }
                | ActionKind::EditFile { path, content } => {
                    if content.len() > self.max_file_bytes {
                        return Err(SafetyViolation::OversizedFile {
                            size: content.len(),
                            limit: self.max_file_bytes,
                        });
                    }
                    self.check_path(path)?;
                }
                _ => {}
            }
        }
        Ok(())
    }

    /// Resolve a file action path under the workspace root, rejecting
    /// absolute paths outside the root and `..` traversal.
    pub fn resolve(&self, path: &str) -> Result<PathBuf, SafetyViolation> {
        self.check_path(path)?;
        let candidate = Path::new(path);
        if candidate.is_absolute() {
            Ok(candidate.to_path_buf())
        } else {
            Ok(self.workspace_root.join(candidate))
        }
    }

    fn check_path(&self, path: &str) -> Result<(), SafetyViolation> {
        let candidate = Path::new(path);
        if candidate
            .components()
            .any(|c| matches!(c, Component::ParentDir))
        {
            return Err(SafetyViolation::PathEscape(path.to_string()));
        }
        if candidate.is_absolute() && !candidate.starts_with(&self.workspace_root) {
            return Err(SafetyViolation::PathEscape(path.to_string()));
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn cmd(command: &str) -> ActionKind {
        ActionKind::RunCommand {
            command: command.to_string(),
        }
    }

    #[test]
    fn benign_command_needs_no_approval() {
        let assessor = RiskAssessor::new();
        let assessment = assessor.assess(&cmd("echo hello"));
        assert_eq!(assessment.risk_score, 0);
        assert_eq!(assessment.required_approval, ApprovalTier::None);
        assert!(assessment.risk_categories.is_empty());
    }

    #[test]
    fn tier_is_monotone_as_indicators_accumulate() {
        let assessor = RiskAssessor::new();
        let low = assessor.assess(&cmd("npm install lodash"));
        assert_eq!(low.required_approval, ApprovalTier::User);

        // Adding a security indicator raises the tier; the package-install
        // indicator still matching cannot pull it back down.
        let high = assessor.assess(&cmd("npm install lodash && export API_KEY=abc"));
        assert!(high.required_approval >= low.required_approval);
        assert_eq!(high.required_approval, ApprovalTier::Security);
        assert!(high.risk_score > low.risk_score);
    }

    #[test]
    fn security_category_indicators_carry_the_security_tier() {
        // The catalog pairs the Security category with the Security tier on
        // several entries; both ends must come out of the table intact.
        let assessor = RiskAssessor::new();
        for text in ["export API_KEY=abc", "cat .env", "sudo systemctl stop db"] {
            let assessment = assessor.assess(&cmd(text));
            assert!(
                assessment.risk_categories.contains(&RiskCategory::Security),
                "{text} should match a security indicator"
            );
            assert!(assessment.required_approval >= ApprovalTier::Security);
        }
    }

    #[test]
    fn payment_commands_require_multi_party() {
        let assessor = RiskAssessor::new();
        let assessment = assessor.assess(&cmd("run stripe billing migration"));
        assert_eq!(assessment.required_approval, ApprovalTier::MultiParty);
        assert!(assessment.risk_categories.contains(&RiskCategory::Financial));
    }

    #[test]
    fn deny_list_catches_root_delete_and_forced_push() {
        let assessor = RiskAssessor::new();
        assert!(assessor.check_denied(&cmd("rm -rf /")).is_some());
        assert!(assessor.check_denied(&cmd("sudo rm -r /var")).is_some());
        assert!(assessor
            .check_denied(&cmd("git push origin main --force"))
            .is_some());
        assert!(assessor.check_denied(&cmd("rm -rf ./build")).is_none());
        assert!(assessor.check_denied(&cmd("git push origin main")).is_none());
    }

    #[test]
    fn policy_rule_raises_but_never_lowers() {
        let rules = vec![PolicyRule {
            pattern: r"infra/.*\.tf$".to_string(),
            applies_to: PolicyTarget::Path,
            min_tier: ApprovalTier::MultiParty,
        }];
        let assessor = RiskAssessor::with_policy(&rules).unwrap();
        let action = ActionKind::EditFile {
            path: "infra/main.tf".to_string(),
            content: "resource {}".to_string(),
        };
        assert_eq!(
            assessor.assess(&action).required_approval,
            ApprovalTier::MultiParty
        );

        // A rule with a low tier cannot lower what the catalog computed.
        let weak = vec![PolicyRule {
            pattern: "stripe".to_string(),
            applies_to: PolicyTarget::Any,
            min_tier: ApprovalTier::User,
        }];
        let assessor = RiskAssessor::with_policy(&weak).unwrap();
        assert_eq!(
            assessor.assess(&cmd("stripe payout run")).required_approval,
            ApprovalTier::MultiParty
        );
    }

    #[test]
    fn invalid_policy_pattern_fails_construction() {
        let rules = vec![PolicyRule {
            pattern: "([".to_string(),
            applies_to: PolicyTarget::Any,
            min_tier: ApprovalTier::User,
        }];
        assert!(matches!(
            RiskAssessor::with_policy(&rules),
            Err(WardenError::Pattern { .. })
        ));
    }

    #[test]
    fn safety_policy_rejects_escapes_and_oversize() {
        let policy = SafetyPolicy::new(PathBuf::from("/ws"), 16);
        let assessor = RiskAssessor::new();

        let escape = vec![ProposedAction::new(ActionKind::CreateFile {
            path: "../etc/passwd".to_string(),
            content: "x".to_string(),
        })];
        assert!(matches!(
            policy.validate_plan(&assessor, &escape),
            Err(SafetyViolation::PathEscape(_))
        ));

        let oversized = vec![ProposedAction::new(ActionKind::CreateFile {
            path: "big.txt".to_string(),
            content: "x".repeat(17),
        })];
        assert!(matches!(
            policy.validate_plan(&assessor, &oversized),
            Err(SafetyViolation::OversizedFile { .. })
        ));

        let fine = vec![ProposedAction::new(ActionKind::CreateFile {
            path: "src/lib.rs".to_string(),
            content: "ok".to_string(),
        })];
        assert!(policy.validate_plan(&assessor, &fine).is_ok());
    }

    #[test]
    fn resolve_joins_relative_paths_under_the_root() {
        let policy = SafetyPolicy::new(PathBuf::from("/ws"), 1024);
        assert_eq!(policy.resolve("a/b.txt").unwrap(), PathBuf::from("/ws/a/b.txt"));
        assert!(policy.resolve("/etc/shadow").is_err());
        assert!(policy.resolve("../up").is_err());
    }
}
