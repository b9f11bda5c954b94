//! TOML configuration for the execution core
//!
//! Loaded from a file, with environment-variable overrides for the values an
//! operator most commonly needs to change. Organization policy rules are
//! validated eagerly at load so an invalid pattern fails here, not at
//! execution time.

use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};

use crate::error::{WardenError, WardenResult};
use crate::types::ApprovalTier;

/// Top-level configuration.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct WardenConfig {
    #[serde(default)]
    pub execution: ExecutionConfig,
    #[serde(default)]
    pub approval: ApprovalConfig,
    #[serde(default)]
    pub oracle: OracleConfig,
    #[serde(default)]
    pub ports: PortsConfig,
    #[serde(default)]
    pub policy: PolicyConfig,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ExecutionConfig {
    /// Bound on any single spawned command, verification checks included.
    #[serde(default = "default_command_timeout_secs")]
    pub command_timeout_secs: u64,
    /// Self-healing retry budget per action.
    #[serde(default = "default_max_retries")]
    pub max_retries: u32,
    /// Largest file content a plan may write.
    #[serde(default = "default_max_file_bytes")]
    pub max_file_bytes: usize,
    /// All file actions resolve under this root; escapes reject the plan.
    #[serde(default = "default_workspace_root")]
    pub workspace_root: PathBuf,
}

fn default_command_timeout_secs() -> u64 {
    120
}

fn default_max_retries() -> u32 {
    3
}

fn default_max_file_bytes() -> usize {
    2 * 1024 * 1024
}

fn default_workspace_root() -> PathBuf {
    PathBuf::from(".")
}

impl Default for ExecutionConfig {
    fn default() -> Self {
        Self {
            command_timeout_secs: default_command_timeout_secs(),
            max_retries: default_max_retries(),
            max_file_bytes: default_max_file_bytes(),
            workspace_root: default_workspace_root(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ApprovalConfig {
    #[serde(default = "default_plan_ttl_hours")]
    pub plan_ttl_hours: i64,
}

fn default_plan_ttl_hours() -> i64 {
    24
}

impl Default for ApprovalConfig {
    fn default() -> Self {
        Self {
            plan_ttl_hours: default_plan_ttl_hours(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct OracleConfig {
    #[serde(default = "default_oracle_base_url")]
    pub base_url: String,
    #[serde(default = "default_oracle_model")]
    pub model: String,
    /// Usually supplied via WARDEN_ORACLE_API_KEY rather than the file.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub api_key: Option<String>,
    #[serde(default = "default_oracle_timeout_secs")]
    pub timeout_secs: u64,
    /// Exponential backoff base for transient provider errors.
    #[serde(default = "default_oracle_base_delay_ms")]
    pub base_delay_ms: u64,
    #[serde(default = "default_oracle_max_attempts")]
    pub max_attempts: u32,
}

fn default_oracle_base_url() -> String {
    "https://api.openai.com/v1".to_string()
}

fn default_oracle_model() -> String {
    "gpt-4o-mini".to_string()
}

fn default_oracle_timeout_secs() -> u64 {
    30
}

fn default_oracle_base_delay_ms() -> u64 {
    500
}

fn default_oracle_max_attempts() -> u32 {
    3
}

impl Default for OracleConfig {
    fn default() -> Self {
        Self {
            base_url: default_oracle_base_url(),
            model: default_oracle_model(),
            api_key: None,
            timeout_secs: default_oracle_timeout_secs(),
            base_delay_ms: default_oracle_base_delay_ms(),
            max_attempts: default_oracle_max_attempts(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PortsConfig {
    #[serde(default = "default_probe_timeout_ms")]
    pub probe_timeout_ms: u64,
    /// Wait between SIGTERM and the SIGKILL escalation.
    #[serde(default = "default_grace_period_ms")]
    pub grace_period_ms: u64,
    #[serde(default = "default_common_ports")]
    pub common_ports: Vec<u16>,
    #[serde(default = "default_scan_start")]
    pub scan_start: u16,
    #[serde(default = "default_scan_end")]
    pub scan_end: u16,
}

fn default_probe_timeout_ms() -> u64 {
    400
}

fn default_grace_period_ms() -> u64 {
    1500
}

fn default_common_ports() -> Vec<u16> {
    vec![3001, 3002, 8080, 8000, 8081, 5000, 5001, 4000, 4200, 9000]
}

fn default_scan_start() -> u16 {
    3000
}

fn default_scan_end() -> u16 {
    9999
}

impl Default for PortsConfig {
    fn default() -> Self {
        Self {
            probe_timeout_ms: default_probe_timeout_ms(),
            grace_period_ms: default_grace_period_ms(),
            common_ports: default_common_ports(),
            scan_start: default_scan_start(),
            scan_end: default_scan_end(),
        }
    }
}

/// What a policy rule's pattern is matched against.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PolicyTarget {
    Path,
    Command,
    Any,
}

/// Organization-supplied risk rule. Can only raise the computed tier.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PolicyRule {
    pub pattern: String,
    #[serde(default = "default_policy_target")]
    pub applies_to: PolicyTarget,
    pub min_tier: ApprovalTier,
}

fn default_policy_target() -> PolicyTarget {
    PolicyTarget::Any
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct PolicyConfig {
    #[serde(default)]
    pub rules: Vec<PolicyRule>,
}

impl WardenConfig {
    /// Load from a TOML file, validate policy patterns, apply env overrides.
    pub fn from_file(path: &Path) -> WardenResult<Self> {
        let raw = std::fs::read_to_string(path)
            .map_err(|e| WardenError::Config(format!("cannot read {}: {}", path.display(), e)))?;
        let mut config: WardenConfig = toml::from_str(&raw)
            .map_err(|e| WardenError::Config(format!("invalid TOML in {}: {}", path.display(), e)))?;
        config.validate()?;
        config.apply_env_overrides();
        Ok(config)
    }

    /// Defaults plus env overrides, for callers without a config file.
    pub fn from_env() -> WardenResult<Self> {
        let mut config = WardenConfig::default();
        config.apply_env_overrides();
        config.validate()?;
        Ok(config)
    }

    /// Eager validation: a bad policy regex is a load-time error, not a
    /// runtime surprise.
    pub fn validate(&self) -> WardenResult<()> {
        for rule in &self.policy.rules {
            regex::Regex::new(&rule.pattern).map_err(|source| WardenError::Pattern {
                pattern: rule.pattern.clone(),
                source,
            })?;
        }
        if self.ports.scan_start > self.ports.scan_end {
            return Err(WardenError::Config(format!(
                "ports.scan_start {} exceeds scan_end {}",
                self.ports.scan_start, self.ports.scan_end
            )));
        }
        Ok(())
    }

    fn apply_env_overrides(&mut self) {
        if let Ok(root) = std::env::var("WARDEN_WORKSPACE_ROOT") {
            self.execution.workspace_root = PathBuf::from(root);
        }
        if let Some(secs) = env_parse::<u64>("WARDEN_COMMAND_TIMEOUT_SECS") {
            self.execution.command_timeout_secs = secs;
        }
        if let Ok(url) = std::env::var("WARDEN_ORACLE_URL") {
            self.oracle.base_url = url;
        }
        if let Ok(key) = std::env::var("WARDEN_ORACLE_API_KEY") {
            self.oracle.api_key = Some(key);
        }
        if let Ok(model) = std::env::var("WARDEN_ORACLE_MODEL") {
            self.oracle.model = model;
        }
    }
}

fn env_parse<T: std::str::FromStr>(key: &str) -> Option<T> {
    std::env::var(key).ok().and_then(|v| v.trim().parse().ok())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_match_documented_values() {
        let config = WardenConfig::default();
        assert_eq!(config.execution.command_timeout_secs, 120);
        assert_eq!(config.execution.max_retries, 3);
        assert_eq!(config.execution.max_file_bytes, 2 * 1024 * 1024);
        assert_eq!(config.approval.plan_ttl_hours, 24);
        assert_eq!(config.oracle.max_attempts, 3);
        assert_eq!(config.ports.grace_period_ms, 1500);
    }

    #[test]
    fn parses_partial_toml_with_defaults() {
        let toml_src = r#"
            [execution]
            command_timeout_secs = 30

            [[policy.rules]]
            pattern = "(?i)infra/.*\\.tf"
            applies_to = "path"
            min_tier = "security"
        "#;
        let config: WardenConfig = toml::from_str(toml_src).unwrap();
        assert_eq!(config.execution.command_timeout_secs, 30);
        assert_eq!(config.execution.max_retries, 3);
        assert_eq!(config.policy.rules.len(), 1);
        assert_eq!(config.policy.rules[0].min_tier, ApprovalTier::Security);
        config.validate().unwrap();
    }

    #[test]
    fn invalid_policy_pattern_fails_validation() {
        let config = WardenConfig {
            policy: PolicyConfig {
                rules: vec![PolicyRule {
                    pattern: "([unclosed".to_string(),
                    applies_to: PolicyTarget::Any,
                    min_tier: ApprovalTier::User,
                }],
            },
            ..Default::default()
        };
        assert!(matches!(
            config.validate(),
            Err(WardenError::Pattern { .. })
        ));
    }
}
