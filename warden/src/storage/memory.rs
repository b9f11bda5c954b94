//! In-memory store backends
//!
//! Used by tests and by embedders that manage persistence themselves.

use async_trait::async_trait;
use std::collections::HashMap;
use tokio::sync::RwLock;

use super::{sort_checkpoints, CheckpointStore, PlanStore};
use crate::error::StorageError;
use crate::types::{Checkpoint, Plan, PlanId, PlanStatus};

#[derive(Default)]
pub struct MemoryPlanStore {
    plans: RwLock<HashMap<PlanId, Plan>>,
}

impl MemoryPlanStore {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl PlanStore for MemoryPlanStore {
    async fn add(&self, plan: Plan) -> Result<(), StorageError> {
        let mut plans = self.plans.write().await;
        if plans.contains_key(&plan.id) {
            return Err(StorageError::AlreadyExists(plan.id));
        }
        plans.insert(plan.id.clone(), plan);
        Ok(())
    }

    async fn update(&self, plan: &Plan) -> Result<(), StorageError> {
        let mut plans = self.plans.write().await;
        if !plans.contains_key(&plan.id) {
            return Err(StorageError::NotFound(plan.id.clone()));
        }
        plans.insert(plan.id.clone(), plan.clone());
        Ok(())
    }

    async fn get(&self, id: &str) -> Result<Option<Plan>, StorageError> {
        Ok(self.plans.read().await.get(id).cloned())
    }

    async fn list(&self) -> Result<Vec<Plan>, StorageError> {
        let mut plans: Vec<Plan> = self.plans.read().await.values().cloned().collect();
        plans.sort_by(|a, b| a.created_at.cmp(&b.created_at));
        Ok(plans)
    }

    async fn remove(&self, id: &str) -> Result<(), StorageError> {
        self.plans
            .write()
            .await
            .remove(id)
            .map(|_| ())
            .ok_or_else(|| StorageError::NotFound(id.to_string()))
    }

    async fn check_expirations(&self) -> Result<Vec<PlanId>, StorageError> {
        let mut swept = Vec::new();
        let mut plans = self.plans.write().await;
        for plan in plans.values_mut() {
            if !plan.status.is_terminal() && plan.is_expired() {
                if plan.mark_expired().is_ok() {
                    swept.push(plan.id.clone());
                }
            }
        }
        Ok(swept)
    }

    async fn recover_interrupted(&self) -> Result<Vec<PlanId>, StorageError> {
        let mut recovered = Vec::new();
        let mut plans = self.plans.write().await;
        for plan in plans.values_mut() {
            if plan.status == PlanStatus::Executing {
                plan.status = PlanStatus::Approved;
                log::info!(
                    "[PlanStore] plan {} was executing at load, moved back to approved",
                    plan.id
                );
                recovered.push(plan.id.clone());
            }
        }
        Ok(recovered)
    }
}

#[derive(Default)]
pub struct MemoryCheckpointStore {
    checkpoints: RwLock<HashMap<String, Checkpoint>>,
}

impl MemoryCheckpointStore {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl CheckpointStore for MemoryCheckpointStore {
    async fn add(&self, checkpoint: Checkpoint) -> Result<(), StorageError> {
        let mut checkpoints = self.checkpoints.write().await;
        if checkpoints.contains_key(&checkpoint.id) {
            return Err(StorageError::AlreadyExists(checkpoint.id));
        }
        checkpoints.insert(checkpoint.id.clone(), checkpoint);
        Ok(())
    }

    async fn get(&self, id: &str) -> Result<Option<Checkpoint>, StorageError> {
        Ok(self.checkpoints.read().await.get(id).cloned())
    }

    async fn list_for(&self, plan_id: &str) -> Result<Vec<Checkpoint>, StorageError> {
        let mut matching: Vec<Checkpoint> = self
            .checkpoints
            .read()
            .await
            .values()
            .filter(|c| c.plan_id.as_deref() == Some(plan_id))
            .cloned()
            .collect();
        sort_checkpoints(&mut matching);
        Ok(matching)
    }

    async fn latest_for(&self, plan_id: &str) -> Result<Option<Checkpoint>, StorageError> {
        Ok(self.list_for(plan_id).await?.pop())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::{ActionKind, ApprovalTier, ProposedAction};
    use chrono::Utc;
    use std::collections::BTreeMap;

    fn plan() -> Plan {
        Plan::new(
            vec![ProposedAction::new(ActionKind::RunCommand {
                command: "true".to_string(),
            })],
            ApprovalTier::None,
            24,
        )
    }

    #[tokio::test]
    async fn add_get_update_remove_roundtrip() {
        let store = MemoryPlanStore::new();
        let mut p = plan();
        let id = p.id.clone();
        store.add(p.clone()).await.unwrap();
        assert!(store.add(p.clone()).await.is_err());

        p.mark_approved().unwrap();
        store.update(&p).await.unwrap();
        assert_eq!(store.get(&id).await.unwrap().unwrap().status, PlanStatus::Approved);

        store.remove(&id).await.unwrap();
        assert!(store.get(&id).await.unwrap().is_none());
    }

    #[tokio::test]
    async fn expiration_sweep_marks_overdue_plans() {
        let store = MemoryPlanStore::new();
        let mut p = plan();
        p.expires_at = Utc::now() - chrono::Duration::minutes(1);
        let id = p.id.clone();
        store.add(p).await.unwrap();

        let swept = store.check_expirations().await.unwrap();
        assert_eq!(swept, vec![id.clone()]);
        assert_eq!(store.get(&id).await.unwrap().unwrap().status, PlanStatus::Expired);

        // Second sweep finds nothing; expired is terminal.
        assert!(store.check_expirations().await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn latest_checkpoint_is_most_recent() {
        let store = MemoryCheckpointStore::new();
        for step in 0..3 {
            store
                .add(Checkpoint {
                    id: format!("chk-{}", step),
                    created_at: Utc::now(),
                    description: format!("step {}", step),
                    plan_id: Some("plan-1".to_string()),
                    step_index: step,
                    file_hashes: BTreeMap::new(),
                    vcs_revision: None,
                })
                .await
                .unwrap();
        }
        let latest = store.latest_for("plan-1").await.unwrap().unwrap();
        assert_eq!(latest.step_index, 2);
        assert_eq!(store.list_for("plan-1").await.unwrap().len(), 3);
        assert!(store.latest_for("plan-2").await.unwrap().is_none());
    }
}
