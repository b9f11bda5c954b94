//! Checkpointing before mutating actions
//!
//! A checkpoint is a sha256 hash per tracked path plus the current VCS
//! revision pointer when the workspace is a git repository. Rollback is
//! advisory: the manager reports the revision and command an operator could
//! use, and never mutates files or rewrites history itself.

use sha2::{Digest, Sha256};
use std::collections::BTreeMap;
use std::path::PathBuf;
use std::sync::Arc;
use uuid::Uuid;

use crate::error::WardenResult;
use crate::exec;
use crate::storage::CheckpointStore;
use crate::types::{Checkpoint, PlanId};

/// Advisory rollback report. Informational only.
#[derive(Debug, Clone)]
pub struct RollbackAdvice {
    pub checkpoint_id: String,
    pub vcs_revision: Option<String>,
    /// Command an operator could run; never executed by this core.
    pub command: Option<String>,
    pub tracked_paths: Vec<String>,
}

pub struct CheckpointManager {
    store: Arc<dyn CheckpointStore>,
    workspace_root: PathBuf,
}

impl CheckpointManager {
    pub fn new(store: Arc<dyn CheckpointStore>, workspace_root: PathBuf) -> Self {
        Self {
            store,
            workspace_root,
        }
    }

    /// Hash every tracked path that exists (absent files are omitted, not
    /// errors), capture the VCS revision if one exists, persist, return.
    pub async fn create_checkpoint(
        &self,
        description: &str,
        plan_id: Option<PlanId>,
        step_index: usize,
        tracked_paths: &[PathBuf],
    ) -> WardenResult<Checkpoint> {
        let mut file_hashes = BTreeMap::new();
        for path in tracked_paths {
            match tokio::fs::read(path).await {
                Ok(bytes) => {
                    file_hashes.insert(path.display().to_string(), sha256_hex(&bytes));
                }
                Err(e) if e.kind() == std::io::ErrorKind::NotFound => {}
                Err(e) => return Err(e.into()),
            }
        }

        let checkpoint = Checkpoint {
            id: format!("chk-{}", Uuid::new_v4()),
            created_at: chrono::Utc::now(),
            description: description.to_string(),
            plan_id,
            step_index,
            file_hashes,
            vcs_revision: self.current_revision().await,
        };
        log::debug!(
            "[Checkpoint] {} covers {} path(s), revision {:?}",
            checkpoint.id,
            checkpoint.file_hashes.len(),
            checkpoint.vcs_revision
        );
        self.store.add(checkpoint.clone()).await?;
        Ok(checkpoint)
    }

    pub async fn latest_for(&self, plan_id: &str) -> WardenResult<Option<Checkpoint>> {
        Ok(self.store.latest_for(plan_id).await?)
    }

    /// Read-only `git rev-parse HEAD`; None outside a repository.
    async fn current_revision(&self) -> Option<String> {
        let out = exec::run_program(
            "git",
            &["rev-parse", "HEAD"],
            Some(&self.workspace_root),
            10,
        )
        .await
        .ok()?;
        if out.success {
            Some(out.stdout.trim().to_string())
        } else {
            None
        }
    }

    /// What an operator could run to revert to this checkpoint.
    pub fn rollback_advice(&self, checkpoint: &Checkpoint) -> RollbackAdvice {
        let tracked_paths: Vec<String> = checkpoint.file_hashes.keys().cloned().collect();
        let command = checkpoint.vcs_revision.as_ref().map(|rev| {
            if tracked_paths.is_empty() {
                format!("git checkout {}", rev)
            } else {
                format!("git checkout {} -- {}", rev, tracked_paths.join(" "))
            }
        });
        RollbackAdvice {
            checkpoint_id: checkpoint.id.clone(),
            vcs_revision: checkpoint.vcs_revision.clone(),
            command,
            tracked_paths,
        }
    }
}

pub fn sha256_hex(bytes: &[u8]) -> String {
    let mut hasher = Sha256::new();
    hasher.update(bytes);
    format!("{:x}", hasher.finalize())
}
