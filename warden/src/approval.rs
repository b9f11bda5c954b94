//! Plan lifecycle and endorsement rules
//!
//! The gate owns every plan transition. Endorsement rules per tier: User
//! takes one endorsement of any role, TeamLead one elevated endorsement,
//! Security one security/admin endorsement, MultiParty at least two distinct
//! endorsers including one elevated. A single rejection is terminal.
//! Insufficient endorsement never escalates or auto-approves; the plan waits
//! until a qualifying endorsement, a rejection, or expiry.

use std::sync::Arc;

use crate::error::{WardenError, WardenResult};
use crate::risk::RiskAssessor;
use crate::storage::PlanStore;
use crate::types::{
    ApprovalTier, Endorsement, Plan, PlanStatus, ProposedAction, Rejection,
};

pub struct ApprovalGate {
    store: Arc<dyn PlanStore>,
    ttl_hours: i64,
}

impl ApprovalGate {
    pub fn new(store: Arc<dyn PlanStore>, ttl_hours: i64) -> Self {
        Self { store, ttl_hours }
    }

    pub fn store(&self) -> Arc<dyn PlanStore> {
        Arc::clone(&self.store)
    }

    /// Assess every action, stamp risk level and warnings onto it, compute
    /// the plan-wide required tier, and persist. The deny-list runs before
    /// scoring: a hit persists the plan as Rejected immediately, so the
    /// caller sees the terminal status rather than an approvable plan.
    pub async fn create_plan(
        &self,
        assessor: &RiskAssessor,
        actions: Vec<ProposedAction>,
    ) -> WardenResult<Plan> {
        let mut denied: Option<String> = None;
        let mut assessed = Vec::with_capacity(actions.len());
        let mut required = ApprovalTier::None;

        for mut action in actions {
            if denied.is_none() {
                if let Some(violation) = assessor.check_denied(&action.kind) {
                    denied = Some(violation.to_string());
                }
            }
            let assessment = assessor.assess(&action.kind);
            action.risk_level = assessment.risk_level();
            action.warnings = assessment.matched.clone();
            required = required.max(assessment.required_approval);
            assessed.push(action);
        }

        let mut plan = Plan::new(assessed, required, self.ttl_hours);
        if let Some(reason) = denied {
            plan.mark_rejected(Rejection {
                approver: "warden".to_string(),
                reason,
                at: chrono::Utc::now(),
            })?;
            log::warn!("[ApprovalGate] plan {} rejected by deny-list", plan.id);
        } else if required == ApprovalTier::None {
            // Nothing risky matched; no human needs to look at it.
            plan.mark_approved()?;
        }

        log::info!(
            "[ApprovalGate] plan {} created: {} action(s), tier {}, status {}",
            plan.id,
            plan.actions.len(),
            plan.required_approval,
            plan.status
        );
        self.store.add(plan.clone()).await?;
        Ok(plan)
    }

    /// Record an endorsement; transitions to Approved when the tier's rule
    /// is satisfied. Duplicate endorsers are recorded once.
    pub async fn endorse(&self, plan_id: &str, endorsement: Endorsement) -> WardenResult<Plan> {
        let mut plan = self.load_live(plan_id).await?;
        if plan.status != PlanStatus::PendingApproval {
            return Err(WardenError::Approval(format!(
                "plan {} is {}, not awaiting approval",
                plan_id, plan.status
            )));
        }
        if plan
            .approvals
            .iter()
            .any(|e| e.approver == endorsement.approver)
        {
            log::debug!(
                "[ApprovalGate] duplicate endorsement from {} ignored",
                endorsement.approver
            );
        } else {
            plan.approvals.push(endorsement);
        }

        if endorsement_satisfied(plan.required_approval, &plan.approvals) {
            plan.mark_approved()?;
            log::info!("[ApprovalGate] plan {} approved", plan_id);
        }
        self.store.update(&plan).await?;
        Ok(plan)
    }

    /// A single explicit rejection is terminal.
    pub async fn reject(&self, plan_id: &str, rejection: Rejection) -> WardenResult<Plan> {
        let mut plan = self.load_live(plan_id).await?;
        plan.mark_rejected(rejection)?;
        log::info!("[ApprovalGate] plan {} rejected", plan_id);
        self.store.update(&plan).await?;
        Ok(plan)
    }

    /// Approved -> Executing with the caller's approved index subset.
    pub async fn begin_execution(&self, plan_id: &str, indices: Vec<usize>) -> WardenResult<Plan> {
        let mut plan = self.load_live(plan_id).await?;
        plan.mark_executing(indices)?;
        self.store.update(&plan).await?;
        Ok(plan)
    }

    pub async fn get(&self, plan_id: &str) -> WardenResult<Plan> {
        self.store
            .get(plan_id)
            .await?
            .ok_or_else(|| WardenError::PlanNotFound(plan_id.to_string()))
    }

    /// Load and expire-on-read: a plan past its TTL is swept before any
    /// other transition can touch it.
    async fn load_live(&self, plan_id: &str) -> WardenResult<Plan> {
        let mut plan = self.get(plan_id).await?;
        if !plan.status.is_terminal() && plan.is_expired() {
            plan.mark_expired()?;
            self.store.update(&plan).await?;
            return Err(WardenError::PlanExpired(plan_id.to_string()));
        }
        Ok(plan)
    }
}

/// The endorsement rule table.
fn endorsement_satisfied(tier: ApprovalTier, approvals: &[Endorsement]) -> bool {
    match tier {
        ApprovalTier::None => true,
        ApprovalTier::User => !approvals.is_empty(),
        ApprovalTier::TeamLead => approvals.iter().any(|e| e.role.is_elevated()),
        ApprovalTier::Security => approvals.iter().any(|e| e.role.is_security()),
        ApprovalTier::MultiParty => {
            let mut endorsers: Vec<&str> = approvals.iter().map(|e| e.approver.as_str()).collect();
            endorsers.sort_unstable();
            endorsers.dedup();
            endorsers.len() >= 2 && approvals.iter().any(|e| e.role.is_elevated())
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::storage::MemoryPlanStore;
    use crate::types::{ActionKind, Role};

    fn gate() -> ApprovalGate {
        ApprovalGate::new(Arc::new(MemoryPlanStore::new()), 24)
    }

    fn action(command: &str) -> ProposedAction {
        ProposedAction::new(ActionKind::RunCommand {
            command: command.to_string(),
        })
    }

    fn endorse_as(approver: &str, role: Role) -> Endorsement {
        Endorsement::new(approver, role)
    }

    #[tokio::test]
    async fn benign_plan_is_auto_approved() {
        let gate = gate();
        let plan = gate
            .create_plan(&RiskAssessor::new(), vec![action("echo hi")])
            .await
            .unwrap();
        assert_eq!(plan.status, PlanStatus::Approved);
        assert_eq!(plan.required_approval, ApprovalTier::None);
    }

    #[tokio::test]
    async fn user_tier_takes_any_single_endorsement() {
        let gate = gate();
        let plan = gate
            .create_plan(&RiskAssessor::new(), vec![action("npm install lodash")])
            .await
            .unwrap();
        assert_eq!(plan.status, PlanStatus::PendingApproval);
        assert_eq!(plan.required_approval, ApprovalTier::User);

        let plan = gate
            .endorse(&plan.id, endorse_as("alice", Role::Member))
            .await
            .unwrap();
        assert_eq!(plan.status, PlanStatus::Approved);
    }

    #[tokio::test]
    async fn security_tier_ignores_member_endorsements() {
        let gate = gate();
        let plan = gate
            .create_plan(
                &RiskAssessor::new(),
                vec![action("export API_KEY=x && ./deploy.sh")],
            )
            .await
            .unwrap();
        assert_eq!(plan.required_approval, ApprovalTier::Security);

        let plan = gate
            .endorse(&plan.id, endorse_as("alice", Role::Member))
            .await
            .unwrap();
        assert_eq!(plan.status, PlanStatus::PendingApproval);
        let plan = gate
            .endorse(&plan.id, endorse_as("lead", Role::TeamLead))
            .await
            .unwrap();
        assert_eq!(plan.status, PlanStatus::PendingApproval);

        let plan = gate
            .endorse(&plan.id, endorse_as("sec", Role::Security))
            .await
            .unwrap();
        assert_eq!(plan.status, PlanStatus::Approved);
    }

    #[tokio::test]
    async fn multi_party_needs_two_distinct_endorsers_one_elevated() {
        let gate = gate();
        let plan = gate
            .create_plan(&RiskAssessor::new(), vec![action("update stripe billing plan")])
            .await
            .unwrap();
        assert_eq!(plan.required_approval, ApprovalTier::MultiParty);

        // Same endorser twice does not count twice.
        let plan = gate
            .endorse(&plan.id, endorse_as("admin", Role::Admin))
            .await
            .unwrap();
        assert_eq!(plan.status, PlanStatus::PendingApproval);
        let plan = gate
            .endorse(&plan.id, endorse_as("admin", Role::Admin))
            .await
            .unwrap();
        assert_eq!(plan.status, PlanStatus::PendingApproval);

        let plan = gate
            .endorse(&plan.id, endorse_as("bob", Role::Member))
            .await
            .unwrap();
        assert_eq!(plan.status, PlanStatus::Approved);
        assert_eq!(plan.approvals.len(), 2);
    }

    #[tokio::test]
    async fn single_rejection_is_terminal() {
        let gate = gate();
        let plan = gate
            .create_plan(&RiskAssessor::new(), vec![action("npm install x")])
            .await
            .unwrap();
        let plan = gate
            .reject(
                &plan.id,
                Rejection {
                    approver: "alice".to_string(),
                    reason: "not needed".to_string(),
                    at: chrono::Utc::now(),
                },
            )
            .await
            .unwrap();
        assert_eq!(plan.status, PlanStatus::Rejected);

        let err = gate
            .endorse(&plan.id, endorse_as("bob", Role::Admin))
            .await
            .unwrap_err();
        assert!(matches!(err, WardenError::Approval(_)));
    }

    #[tokio::test]
    async fn deny_listed_action_rejects_the_plan_at_creation() {
        let gate = gate();
        let plan = gate
            .create_plan(&RiskAssessor::new(), vec![action("sudo rm -rf /")])
            .await
            .unwrap();
        assert_eq!(plan.status, PlanStatus::Rejected);
        assert_eq!(plan.rejections.len(), 1);
    }

    #[tokio::test]
    async fn expired_plan_is_inert() {
        let gate = ApprovalGate::new(Arc::new(MemoryPlanStore::new()), 24);
        let mut plan = gate
            .create_plan(&RiskAssessor::new(), vec![action("npm install x")])
            .await
            .unwrap();
        plan.expires_at = chrono::Utc::now() - chrono::Duration::hours(1);
        gate.store().update(&plan).await.unwrap();

        let err = gate
            .endorse(&plan.id, endorse_as("alice", Role::Admin))
            .await
            .unwrap_err();
        assert!(matches!(err, WardenError::PlanExpired(_)));
        assert_eq!(gate.get(&plan.id).await.unwrap().status, PlanStatus::Expired);
    }
}
