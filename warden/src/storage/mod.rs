//! Injected store abstractions for plans and checkpoints
//!
//! Components never touch a global registry: the orchestrator and approval
//! gate receive `Arc<dyn PlanStore>` / `Arc<dyn CheckpointStore>` handles.
//! Two backends exist: an in-memory store for tests and embedding, and a
//! file-per-record JSON store that survives process restarts.

mod file;
mod memory;

pub use file::{FileCheckpointStore, FilePlanStore};
pub use memory::{MemoryCheckpointStore, MemoryPlanStore};

use async_trait::async_trait;

use crate::error::StorageError;
use crate::types::{Checkpoint, Plan, PlanId};

/// Persistence seam for plans.
#[async_trait]
pub trait PlanStore: Send + Sync {
    async fn add(&self, plan: Plan) -> Result<(), StorageError>;
    async fn update(&self, plan: &Plan) -> Result<(), StorageError>;
    async fn get(&self, id: &str) -> Result<Option<Plan>, StorageError>;
    async fn list(&self) -> Result<Vec<Plan>, StorageError>;
    async fn remove(&self, id: &str) -> Result<(), StorageError>;

    /// Sweep plans past their TTL into Expired; returns the ids swept.
    async fn check_expirations(&self) -> Result<Vec<PlanId>, StorageError>;

    /// Crash-recovery sweep: plans found Executing did not finish their
    /// dispatch; move them back to Approved so a caller can re-dispatch
    /// deliberately. Returns the ids recovered.
    async fn recover_interrupted(&self) -> Result<Vec<PlanId>, StorageError>;
}

/// Persistence seam for checkpoints.
#[async_trait]
pub trait CheckpointStore: Send + Sync {
    async fn add(&self, checkpoint: Checkpoint) -> Result<(), StorageError>;
    async fn get(&self, id: &str) -> Result<Option<Checkpoint>, StorageError>;
    /// All checkpoints recorded for a plan, oldest first.
    async fn list_for(&self, plan_id: &str) -> Result<Vec<Checkpoint>, StorageError>;
    /// Most recent checkpoint for a plan.
    async fn latest_for(&self, plan_id: &str) -> Result<Option<Checkpoint>, StorageError>;
}

pub(crate) fn sort_checkpoints(checkpoints: &mut [Checkpoint]) {
    checkpoints.sort_by(|a, b| {
        a.created_at
            .cmp(&b.created_at)
            .then(a.step_index.cmp(&b.step_index))
    });
}
