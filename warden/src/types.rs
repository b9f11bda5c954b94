//! Core data model for the action execution core
//!
//! Actions proposed by the oracle, the Plan lifecycle that gates them, and
//! the records produced while executing them (checkpoints, outcomes,
//! diagnoses). Plans are mutated only through the `mark_*` transition
//! helpers; everything else is plain data.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fmt;
use uuid::Uuid;

use crate::error::{WardenError, WardenResult};

pub type PlanId = String;
pub type CheckpointId = String;

/// A single mutation proposed by the oracle. Closed union: adding a kind
/// forces every match site (risk assessment, execution, verification) to
/// handle it before the crate compiles.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ActionKind {
    CreateFile { path: String, content: String },
    EditFile { path: String, content: String },
    RunCommand { command: String },
    InstallTool { tool: String },
    CheckPort { port: u16 },
    KillPort { port: u16 },
}

impl ActionKind {
    /// Whether executing this action mutates observable state (and therefore
    /// requires a checkpoint first).
    pub fn is_mutating(&self) -> bool {
        !matches!(self, ActionKind::CheckPort { .. })
    }

    /// Paths this action will touch, for checkpointing.
    pub fn touched_paths(&self) -> Vec<String> {
        match self {
            ActionKind::CreateFile { path, .. } | ActionKind::EditFile { path, .. } => {
                vec![path.clone()]
            }
            _ => Vec::new(),
        }
    }

    /// The free text the risk catalog and diagnosis tables scan.
    pub fn scan_text(&self) -> String {
        match self {
            ActionKind::CreateFile { path, content } | ActionKind::EditFile { path, content } => {
                format!("{} {}", path, content)
            }
            ActionKind::RunCommand { command } => command.clone(),
            ActionKind::InstallTool { tool } => format!("install {}", tool),
            ActionKind::CheckPort { port } => format!("check port {}", port),
            ActionKind::KillPort { port } => format!("kill port {}", port),
        }
    }
}

impl fmt::Display for ActionKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ActionKind::CreateFile { path, .. } => write!(f, "CreateFile({})", path),
            ActionKind::EditFile { path, .. } => write!(f, "EditFile({})", path),
            ActionKind::RunCommand { command } => write!(f, "RunCommand({})", command),
            ActionKind::InstallTool { tool } => write!(f, "InstallTool({})", tool),
            ActionKind::CheckPort { port } => write!(f, "CheckPort({})", port),
            ActionKind::KillPort { port } => write!(f, "KillPort({})", port),
        }
    }
}

/// Coarse risk level derived from the summed indicator severities.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RiskLevel {
    Low,
    Medium,
    High,
    Critical,
}

impl RiskLevel {
    pub fn from_score(score: u32) -> Self {
        match score {
            0..=3 => RiskLevel::Low,
            4..=7 => RiskLevel::Medium,
            8..=14 => RiskLevel::High,
            _ => RiskLevel::Critical,
        }
    }
}

/// Ordered approval requirement. A matched higher tier always overrides a
/// lower one already computed, never the reverse.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ApprovalTier {
    None,
    User,
    TeamLead,
    Security,
    MultiParty,
}

impl fmt::Display for ApprovalTier {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            ApprovalTier::None => "none",
            ApprovalTier::User => "user",
            ApprovalTier::TeamLead => "team_lead",
            ApprovalTier::Security => "security",
            ApprovalTier::MultiParty => "multi_party",
        };
        write!(f, "{}", s)
    }
}

/// Role carried by an endorser.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Role {
    Member,
    TeamLead,
    Security,
    Admin,
}

impl Role {
    pub fn is_elevated(&self) -> bool {
        matches!(self, Role::TeamLead | Role::Security | Role::Admin)
    }

    pub fn is_security(&self) -> bool {
        matches!(self, Role::Security | Role::Admin)
    }
}

/// One action as it travels through the plan: the oracle's proposal plus the
/// risk level and warnings computed by the RiskAssessor. Immutable once
/// assessed.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ProposedAction {
    #[serde(flatten)]
    pub kind: ActionKind,
    #[serde(default = "default_risk_level")]
    pub risk_level: RiskLevel,
    #[serde(default)]
    pub warnings: Vec<String>,
}

fn default_risk_level() -> RiskLevel {
    RiskLevel::Low
}

impl ProposedAction {
    pub fn new(kind: ActionKind) -> Self {
        Self {
            kind,
            risk_level: RiskLevel::Low,
            warnings: Vec::new(),
        }
    }
}

/// Plan lifecycle status. Completed, Failed, Rejected and Expired are
/// terminal.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PlanStatus {
    PendingApproval,
    Approved,
    Rejected,
    Executing,
    Completed,
    Failed,
    Expired,
}

impl PlanStatus {
    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            PlanStatus::Completed | PlanStatus::Failed | PlanStatus::Rejected | PlanStatus::Expired
        )
    }

    pub fn is_pending(&self) -> bool {
        matches!(self, PlanStatus::PendingApproval)
    }
}

impl fmt::Display for PlanStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            PlanStatus::PendingApproval => "pending_approval",
            PlanStatus::Approved => "approved",
            PlanStatus::Rejected => "rejected",
            PlanStatus::Executing => "executing",
            PlanStatus::Completed => "completed",
            PlanStatus::Failed => "failed",
            PlanStatus::Expired => "expired",
        };
        write!(f, "{}", s)
    }
}

/// A recorded endorsement.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Endorsement {
    pub approver: String,
    pub role: Role,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub comment: Option<String>,
    pub at: DateTime<Utc>,
}

impl Endorsement {
    pub fn new(approver: impl Into<String>, role: Role) -> Self {
        Self {
            approver: approver.into(),
            role,
            comment: None,
            at: Utc::now(),
        }
    }
}

/// A recorded rejection. A single rejection is terminal for the plan.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Rejection {
    pub approver: String,
    pub reason: String,
    pub at: DateTime<Utc>,
}

/// A batch of proposed mutations gated by approval before execution.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Plan {
    pub id: PlanId,
    pub status: PlanStatus,
    pub actions: Vec<ProposedAction>,
    /// Subset of action indices the caller chose to run. Unapproved indices
    /// are skipped at dispatch, not rejected.
    #[serde(default)]
    pub approved_indices: Vec<usize>,
    pub required_approval: ApprovalTier,
    #[serde(default)]
    pub approvals: Vec<Endorsement>,
    #[serde(default)]
    pub rejections: Vec<Rejection>,
    pub created_at: DateTime<Utc>,
    pub expires_at: DateTime<Utc>,
}

impl Plan {
    pub fn new(actions: Vec<ProposedAction>, required_approval: ApprovalTier, ttl_hours: i64) -> Self {
        let now = Utc::now();
        Self {
            id: format!("plan-{}", Uuid::new_v4()),
            status: PlanStatus::PendingApproval,
            actions,
            approved_indices: Vec::new(),
            required_approval,
            approvals: Vec::new(),
            rejections: Vec::new(),
            created_at: now,
            expires_at: now + chrono::Duration::hours(ttl_hours),
        }
    }

    pub fn is_expired(&self) -> bool {
        Utc::now() > self.expires_at
    }

    fn transition(&mut self, allowed_from: &[PlanStatus], to: PlanStatus) -> WardenResult<()> {
        if !allowed_from.contains(&self.status) {
            return Err(WardenError::InvalidTransition {
                from: self.status.to_string(),
                to: to.to_string(),
            });
        }
        self.status = to;
        Ok(())
    }

    pub fn mark_approved(&mut self) -> WardenResult<()> {
        self.transition(&[PlanStatus::PendingApproval], PlanStatus::Approved)
    }

    pub fn mark_rejected(&mut self, rejection: Rejection) -> WardenResult<()> {
        if self.status.is_terminal() {
            return Err(WardenError::InvalidTransition {
                from: self.status.to_string(),
                to: PlanStatus::Rejected.to_string(),
            });
        }
        self.rejections.push(rejection);
        self.status = PlanStatus::Rejected;
        Ok(())
    }

    pub fn mark_executing(&mut self, approved_indices: Vec<usize>) -> WardenResult<()> {
        if self.is_expired() {
            return Err(WardenError::PlanExpired(self.id.clone()));
        }
        for &index in &approved_indices {
            if index >= self.actions.len() {
                return Err(WardenError::IndexOutOfRange {
                    index,
                    len: self.actions.len(),
                });
            }
        }
        self.transition(&[PlanStatus::Approved], PlanStatus::Executing)?;
        self.approved_indices = approved_indices;
        Ok(())
    }

    pub fn mark_completed(&mut self) -> WardenResult<()> {
        self.transition(&[PlanStatus::Executing], PlanStatus::Completed)
    }

    pub fn mark_failed(&mut self) -> WardenResult<()> {
        self.transition(&[PlanStatus::Executing], PlanStatus::Failed)
    }

    pub fn mark_expired(&mut self) -> WardenResult<()> {
        if self.status.is_terminal() {
            return Err(WardenError::InvalidTransition {
                from: self.status.to_string(),
                to: PlanStatus::Expired.to_string(),
            });
        }
        self.status = PlanStatus::Expired;
        Ok(())
    }
}

/// Point-in-time hash/revision snapshot taken before a mutating action.
/// Rollback from a checkpoint is advisory, never automated.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Checkpoint {
    pub id: CheckpointId,
    pub created_at: DateTime<Utc>,
    pub description: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub plan_id: Option<PlanId>,
    pub step_index: usize,
    /// sha256 hex per tracked path; absent files are omitted.
    pub file_hashes: BTreeMap<String, String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub vcs_revision: Option<String>,
}

/// Failure classification categories used by the self-healing engine.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ErrorCategory {
    Dependency,
    Type,
    Syntax,
    Permission,
    Network,
    PortConflict,
    Lint,
    Unknown,
}

impl fmt::Display for ErrorCategory {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            ErrorCategory::Dependency => "dependency",
            ErrorCategory::Type => "type",
            ErrorCategory::Syntax => "syntax",
            ErrorCategory::Permission => "permission",
            ErrorCategory::Network => "network",
            ErrorCategory::PortConflict => "port-conflict",
            ErrorCategory::Lint => "lint",
            ErrorCategory::Unknown => "unknown",
        };
        write!(f, "{}", s)
    }
}

/// Diagnosis of a failed action.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ErrorDiagnosis {
    pub error_type: ErrorCategory,
    pub message: String,
    pub likely_cause: String,
    pub suggested_fixes: Vec<String>,
    pub auto_fixable: bool,
    /// Concrete corrective actions the engine can apply before retrying.
    pub recovery_actions: Vec<ActionKind>,
}

/// Outcome of executing one action, recovery included. Explicit result type
/// so the orchestrator's recovery branch is exhaustively checkable.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ActionOutcome {
    pub success: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub output: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub exit_code: Option<i32>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
    #[serde(default)]
    pub warnings: Vec<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub diagnosis: Option<ErrorDiagnosis>,
    #[serde(default)]
    pub recovery_attempts: u32,
}

impl ActionOutcome {
    pub fn success(output: Option<String>, exit_code: Option<i32>) -> Self {
        Self {
            success: true,
            output,
            exit_code,
            error: None,
            warnings: Vec::new(),
            diagnosis: None,
            recovery_attempts: 0,
        }
    }

    pub fn failure(error: impl Into<String>, exit_code: Option<i32>) -> Self {
        Self {
            success: false,
            output: None,
            exit_code,
            error: Some(error.into()),
            warnings: Vec::new(),
            diagnosis: None,
            recovery_attempts: 0,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sample_plan() -> Plan {
        Plan::new(
            vec![ProposedAction::new(ActionKind::RunCommand {
                command: "echo hi".to_string(),
            })],
            ApprovalTier::User,
            24,
        )
    }

    #[test]
    fn plan_transitions_follow_the_state_machine() {
        let mut plan = sample_plan();
        assert_eq!(plan.status, PlanStatus::PendingApproval);
        plan.mark_approved().unwrap();
        plan.mark_executing(vec![0]).unwrap();
        plan.mark_completed().unwrap();
        assert!(plan.status.is_terminal());
        // Terminal plans reject further transitions.
        assert!(plan.mark_failed().is_err());
    }

    #[test]
    fn executing_requires_in_range_indices() {
        let mut plan = sample_plan();
        plan.mark_approved().unwrap();
        let err = plan.mark_executing(vec![3]).unwrap_err();
        assert!(matches!(err, WardenError::IndexOutOfRange { index: 3, len: 1 }));
    }

    #[test]
    fn expired_plan_cannot_begin_executing() {
        let mut plan = sample_plan();
        plan.mark_approved().unwrap();
        plan.expires_at = Utc::now() - chrono::Duration::hours(1);
        assert!(matches!(
            plan.mark_executing(vec![0]),
            Err(WardenError::PlanExpired(_))
        ));
    }

    #[test]
    fn rejection_is_terminal_from_any_live_state() {
        let mut plan = sample_plan();
        plan.mark_rejected(Rejection {
            approver: "alice".to_string(),
            reason: "nope".to_string(),
            at: Utc::now(),
        })
        .unwrap();
        assert_eq!(plan.status, PlanStatus::Rejected);
        assert!(plan.mark_approved().is_err());
    }

    #[test]
    fn action_kind_serde_uses_type_tag() {
        let json = r#"{"type":"create_file","path":"a.py","content":"print(1)"}"#;
        let action: ActionKind = serde_json::from_str(json).unwrap();
        assert_eq!(
            action,
            ActionKind::CreateFile {
                path: "a.py".to_string(),
                content: "print(1)".to_string()
            }
        );
    }

    #[test]
    fn tier_ordering_matches_precedence() {
        assert!(ApprovalTier::MultiParty > ApprovalTier::Security);
        assert!(ApprovalTier::Security > ApprovalTier::TeamLead);
        assert!(ApprovalTier::TeamLead > ApprovalTier::User);
        assert!(ApprovalTier::User > ApprovalTier::None);
    }

    #[test]
    fn check_port_is_not_mutating() {
        assert!(!ActionKind::CheckPort { port: 3000 }.is_mutating());
        assert!(ActionKind::KillPort { port: 3000 }.is_mutating());
        assert!(ActionKind::EditFile {
            path: "x".into(),
            content: "y".into()
        }
        .is_mutating());
    }
}
