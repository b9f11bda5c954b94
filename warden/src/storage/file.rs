//! File-backed store backends
//!
//! One JSON file per record. Plans live under status-named subdirectories
//! and move between them on transition, so the directory tree doubles as a
//! queue view for operators. An in-process cache is loaded at startup;
//! pending and executing plans therefore survive a restart.

use async_trait::async_trait;
use std::collections::HashMap;
use std::path::{Path, PathBuf};
use tokio::sync::RwLock;

use super::{sort_checkpoints, CheckpointStore, PlanStore};
use crate::error::StorageError;
use crate::types::{Checkpoint, Plan, PlanId, PlanStatus};

const PLAN_STATUS_DIRS: [&str; 7] = [
    "pending",
    "approved",
    "rejected",
    "executing",
    "completed",
    "failed",
    "expired",
];

fn status_dir(status: PlanStatus) -> &'static str {
    match status {
        PlanStatus::PendingApproval => "pending",
        PlanStatus::Approved => "approved",
        PlanStatus::Rejected => "rejected",
        PlanStatus::Executing => "executing",
        PlanStatus::Completed => "completed",
        PlanStatus::Failed => "failed",
        PlanStatus::Expired => "expired",
    }
}

fn io_err(path: &Path, e: impl std::fmt::Display) -> StorageError {
    StorageError::Io {
        path: path.display().to_string(),
        message: e.to_string(),
    }
}

/// File-per-record plan store. The production backend.
pub struct FilePlanStore {
    base_path: PathBuf,
    cache: RwLock<HashMap<PlanId, Plan>>,
}

impl FilePlanStore {
    /// Open (creating directories as needed) and load every record into the
    /// cache. Interrupted and overdue plans are swept by the explicit
    /// `recover_interrupted` / `check_expirations` calls, not here.
    pub async fn open(base_path: PathBuf) -> Result<Self, StorageError> {
        for dir in PLAN_STATUS_DIRS {
            let path = base_path.join(dir);
            tokio::fs::create_dir_all(&path)
                .await
                .map_err(|e| io_err(&path, e))?;
        }
        let store = Self {
            base_path,
            cache: RwLock::new(HashMap::new()),
        };
        store.load_all().await?;
        Ok(store)
    }

    fn record_path(&self, id: &str, status: PlanStatus) -> PathBuf {
        self.base_path
            .join(status_dir(status))
            .join(format!("{}.json", id))
    }

    async fn load_all(&self) -> Result<(), StorageError> {
        let mut cache = self.cache.write().await;
        for dir in PLAN_STATUS_DIRS {
            let dir_path = self.base_path.join(dir);
            let mut entries = tokio::fs::read_dir(&dir_path)
                .await
                .map_err(|e| io_err(&dir_path, e))?;
            while let Some(entry) = entries.next_entry().await.map_err(|e| io_err(&dir_path, e))? {
                let path = entry.path();
                if path.extension().map_or(true, |ext| ext != "json") {
                    continue;
                }
                let raw = tokio::fs::read_to_string(&path)
                    .await
                    .map_err(|e| io_err(&path, e))?;
                let plan: Plan = serde_json::from_str(&raw).map_err(|e| StorageError::Corrupt {
                    id: path.display().to_string(),
                    message: e.to_string(),
                })?;
                cache.insert(plan.id.clone(), plan);
            }
        }
        log::info!("[PlanStore] loaded {} plans from {}", cache.len(), self.base_path.display());
        Ok(())
    }

    async fn persist(&self, plan: &Plan, previous_status: Option<PlanStatus>) -> Result<(), StorageError> {
        let path = self.record_path(&plan.id, plan.status);
        let json = serde_json::to_string_pretty(plan).map_err(|e| StorageError::Corrupt {
            id: plan.id.clone(),
            message: e.to_string(),
        })?;
        tokio::fs::write(&path, json)
            .await
            .map_err(|e| io_err(&path, e))?;
        // A status change moves the record into its new directory.
        if let Some(old) = previous_status {
            if old != plan.status {
                let old_path = self.record_path(&plan.id, old);
                if let Err(e) = tokio::fs::remove_file(&old_path).await {
                    if e.kind() != std::io::ErrorKind::NotFound {
                        return Err(io_err(&old_path, e));
                    }
                }
            }
        }
        Ok(())
    }
}

#[async_trait]
impl PlanStore for FilePlanStore {
    async fn add(&self, plan: Plan) -> Result<(), StorageError> {
        {
            let cache = self.cache.read().await;
            if cache.contains_key(&plan.id) {
                return Err(StorageError::AlreadyExists(plan.id));
            }
        }
        self.persist(&plan, None).await?;
        self.cache.write().await.insert(plan.id.clone(), plan);
        Ok(())
    }

    async fn update(&self, plan: &Plan) -> Result<(), StorageError> {
        let previous = {
            let cache = self.cache.read().await;
            cache
                .get(&plan.id)
                .map(|p| p.status)
                .ok_or_else(|| StorageError::NotFound(plan.id.clone()))?
        };
        self.persist(plan, Some(previous)).await?;
        self.cache.write().await.insert(plan.id.clone(), plan.clone());
        Ok(())
    }

    async fn get(&self, id: &str) -> Result<Option<Plan>, StorageError> {
        Ok(self.cache.read().await.get(id).cloned())
    }

    async fn list(&self) -> Result<Vec<Plan>, StorageError> {
        let mut plans: Vec<Plan> = self.cache.read().await.values().cloned().collect();
        plans.sort_by(|a, b| a.created_at.cmp(&b.created_at));
        Ok(plans)
    }

    async fn remove(&self, id: &str) -> Result<(), StorageError> {
        let plan = {
            let mut cache = self.cache.write().await;
            cache
                .remove(id)
                .ok_or_else(|| StorageError::NotFound(id.to_string()))?
        };
        let path = self.record_path(id, plan.status);
        if let Err(e) = tokio::fs::remove_file(&path).await {
            if e.kind() != std::io::ErrorKind::NotFound {
                return Err(io_err(&path, e));
            }
        }
        Ok(())
    }

    async fn check_expirations(&self) -> Result<Vec<PlanId>, StorageError> {
        let overdue: Vec<Plan> = {
            let cache = self.cache.read().await;
            cache
                .values()
                .filter(|p| !p.status.is_terminal() && p.is_expired())
                .cloned()
                .collect()
        };
        let mut swept = Vec::new();
        for mut plan in overdue {
            let previous = plan.status;
            if plan.mark_expired().is_ok() {
                self.persist(&plan, Some(previous)).await?;
                swept.push(plan.id.clone());
                self.cache.write().await.insert(plan.id.clone(), plan);
            }
        }
        Ok(swept)
    }

    async fn recover_interrupted(&self) -> Result<Vec<PlanId>, StorageError> {
        let interrupted: Vec<Plan> = {
            let cache = self.cache.read().await;
            cache
                .values()
                .filter(|p| p.status == PlanStatus::Executing)
                .cloned()
                .collect()
        };
        let mut recovered = Vec::new();
        for mut plan in interrupted {
            plan.status = PlanStatus::Approved;
            self.persist(&plan, Some(PlanStatus::Executing)).await?;
            log::info!(
                "[PlanStore] plan {} was executing at load, moved back to approved",
                plan.id
            );
            recovered.push(plan.id.clone());
            self.cache.write().await.insert(plan.id.clone(), plan);
        }
        Ok(recovered)
    }
}

/// File-per-record checkpoint store, laid out by owning plan:
/// `<base>/<plan_id>/<checkpoint_id>.json`.
pub struct FileCheckpointStore {
    base_path: PathBuf,
    cache: RwLock<HashMap<String, Checkpoint>>,
}

impl FileCheckpointStore {
    pub async fn open(base_path: PathBuf) -> Result<Self, StorageError> {
        tokio::fs::create_dir_all(&base_path)
            .await
            .map_err(|e| io_err(&base_path, e))?;
        let store = Self {
            base_path,
            cache: RwLock::new(HashMap::new()),
        };
        store.load_all().await?;
        Ok(store)
    }

    fn plan_dir(&self, plan_id: Option<&str>) -> PathBuf {
        self.base_path.join(plan_id.unwrap_or("unassigned"))
    }

    async fn load_all(&self) -> Result<(), StorageError> {
        let mut cache = self.cache.write().await;
        let mut dirs = tokio::fs::read_dir(&self.base_path)
            .await
            .map_err(|e| io_err(&self.base_path, e))?;
        while let Some(dir) = dirs.next_entry().await.map_err(|e| io_err(&self.base_path, e))? {
            if !dir.path().is_dir() {
                continue;
            }
            let mut entries = tokio::fs::read_dir(dir.path())
                .await
                .map_err(|e| io_err(&dir.path(), e))?;
            while let Some(entry) = entries.next_entry().await.map_err(|e| io_err(&dir.path(), e))? {
                let path = entry.path();
                if path.extension().map_or(true, |ext| ext != "json") {
                    continue;
                }
                let raw = tokio::fs::read_to_string(&path)
                    .await
                    .map_err(|e| io_err(&path, e))?;
                let checkpoint: Checkpoint =
                    serde_json::from_str(&raw).map_err(|e| StorageError::Corrupt {
                        id: path.display().to_string(),
                        message: e.to_string(),
                    })?;
                cache.insert(checkpoint.id.clone(), checkpoint);
            }
        }
        Ok(())
    }
}

#[async_trait]
impl CheckpointStore for FileCheckpointStore {
    async fn add(&self, checkpoint: Checkpoint) -> Result<(), StorageError> {
        {
            let cache = self.cache.read().await;
            if cache.contains_key(&checkpoint.id) {
                return Err(StorageError::AlreadyExists(checkpoint.id));
            }
        }
        let dir = self.plan_dir(checkpoint.plan_id.as_deref());
        tokio::fs::create_dir_all(&dir)
            .await
            .map_err(|e| io_err(&dir, e))?;
        let path = dir.join(format!("{}.json", checkpoint.id));
        let json = serde_json::to_string_pretty(&checkpoint).map_err(|e| StorageError::Corrupt {
            id: checkpoint.id.clone(),
            message: e.to_string(),
        })?;
        tokio::fs::write(&path, json)
            .await
            .map_err(|e| io_err(&path, e))?;
        self.cache
            .write()
            .await
            .insert(checkpoint.id.clone(), checkpoint);
        Ok(())
    }

    async fn get(&self, id: &str) -> Result<Option<Checkpoint>, StorageError> {
        Ok(self.cache.read().await.get(id).cloned())
    }

    async fn list_for(&self, plan_id: &str) -> Result<Vec<Checkpoint>, StorageError> {
        let mut matching: Vec<Checkpoint> = self
            .cache
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
    use tempfile::tempdir;

    fn plan() -> Plan {
        Plan::new(
            vec![ProposedAction::new(ActionKind::RunCommand {
                command: "true".to_string(),
            })],
            ApprovalTier::User,
            24,
        )
    }

    #[tokio::test]
    async fn records_survive_a_reopen() {
        let dir = tempdir().unwrap();
        let mut p = plan();
        let id = p.id.clone();
        {
            let store = FilePlanStore::open(dir.path().to_path_buf()).await.unwrap();
            store.add(p.clone()).await.unwrap();
            p.mark_approved().unwrap();
            store.update(&p).await.unwrap();
        }

        let reopened = FilePlanStore::open(dir.path().to_path_buf()).await.unwrap();
        let loaded = reopened.get(&id).await.unwrap().unwrap();
        assert_eq!(loaded.status, PlanStatus::Approved);
        // The record moved out of pending/ into approved/.
        assert!(!dir.path().join("pending").join(format!("{}.json", id)).exists());
        assert!(dir.path().join("approved").join(format!("{}.json", id)).exists());
    }

    #[tokio::test]
    async fn interrupted_execution_is_recovered_on_reload() {
        let dir = tempdir().unwrap();
        let mut p = plan();
        let id = p.id.clone();
        {
            let store = FilePlanStore::open(dir.path().to_path_buf()).await.unwrap();
            store.add(p.clone()).await.unwrap();
            p.mark_approved().unwrap();
            store.update(&p).await.unwrap();
            p.mark_executing(vec![0]).unwrap();
            store.update(&p).await.unwrap();
            // Simulated crash: store dropped mid-execution.
        }

        let reopened = FilePlanStore::open(dir.path().to_path_buf()).await.unwrap();
        let recovered = reopened.recover_interrupted().await.unwrap();
        assert_eq!(recovered, vec![id.clone()]);
        assert_eq!(
            reopened.get(&id).await.unwrap().unwrap().status,
            PlanStatus::Approved
        );
    }

    #[tokio::test]
    async fn checkpoints_reload_by_plan() {
        let dir = tempdir().unwrap();
        let checkpoint = Checkpoint {
            id: "chk-1".to_string(),
            created_at: chrono::Utc::now(),
            description: "before write".to_string(),
            plan_id: Some("plan-x".to_string()),
            step_index: 0,
            file_hashes: Default::default(),
            vcs_revision: Some("abc123".to_string()),
        };
        {
            let store = FileCheckpointStore::open(dir.path().to_path_buf()).await.unwrap();
            store.add(checkpoint.clone()).await.unwrap();
        }
        let reopened = FileCheckpointStore::open(dir.path().to_path_buf()).await.unwrap();
        assert_eq!(
            reopened.latest_for("plan-x").await.unwrap().unwrap(),
            checkpoint
        );
    }
}
