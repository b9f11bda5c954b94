//! Plan execution orchestration
//!
//! Drives the loop for the approved action subset: checkpoint, execute,
//! verify, and on failure hand off to the self-healing engine for bounded
//! recovery. Execution is strictly sequential within one plan; concurrency
//! across plans comes from running executors as separate tasks over shared
//! store handles. Every collaborator is injected, no process-wide state.

use std::path::PathBuf;
use std::sync::Arc;
use tokio::sync::Mutex;

use crate::approval::ApprovalGate;
use crate::checkpoint::CheckpointManager;
use crate::config::WardenConfig;
use crate::error::{WardenError, WardenResult};
use crate::events::{EventLedger, EventSink, ExecutionEvent};
use crate::exec;
use crate::healing::SelfHealingEngine;
use crate::oracle::Oracle;
use crate::ports::{KillOutcome, PortResourceManager};
use crate::risk::{RiskAssessor, SafetyPolicy};
use crate::steps::TaskPlan;
use crate::storage::{CheckpointStore, PlanStore};
use crate::types::{
    ActionKind, ActionOutcome, Plan, PlanStatus, ProposedAction, Rejection,
};
use crate::verify::VerificationEngine;

/// What one `execute_plan` call produced.
#[derive(Debug)]
pub struct ExecutionReport {
    pub plan_id: String,
    pub status: PlanStatus,
    /// (action index, outcome) in dispatch order.
    pub outcomes: Vec<(usize, ActionOutcome)>,
}

pub struct PlanExecutor {
    command_timeout_secs: u64,
    workspace_root: PathBuf,
    plans: Arc<dyn PlanStore>,
    checkpoints: CheckpointManager,
    verifier: VerificationEngine,
    healer: SelfHealingEngine,
    ports: PortResourceManager,
    safety: SafetyPolicy,
    assessor: RiskAssessor,
    sinks: Vec<Arc<dyn EventSink>>,
    ledger: Mutex<EventLedger>,
}

impl PlanExecutor {
    pub fn new(
        config: &WardenConfig,
        plans: Arc<dyn PlanStore>,
        checkpoint_store: Arc<dyn CheckpointStore>,
    ) -> WardenResult<Self> {
        let workspace_root = config.execution.workspace_root.clone();
        Ok(Self {
            command_timeout_secs: config.execution.command_timeout_secs,
            workspace_root: workspace_root.clone(),
            plans,
            checkpoints: CheckpointManager::new(checkpoint_store, workspace_root.clone()),
            verifier: VerificationEngine::new(
                workspace_root.clone(),
                config.execution.command_timeout_secs,
            ),
            healer: SelfHealingEngine::new(config.execution.max_retries),
            ports: PortResourceManager::new(config.ports.clone()),
            safety: SafetyPolicy::new(workspace_root, config.execution.max_file_bytes),
            assessor: RiskAssessor::with_policy(&config.policy.rules)?,
            sinks: Vec::new(),
            ledger: Mutex::new(EventLedger::new()),
        })
    }

    pub fn add_sink(&mut self, sink: Arc<dyn EventSink>) {
        self.sinks.push(sink);
    }

    pub fn risk_assessor(&self) -> &RiskAssessor {
        &self.assessor
    }

    /// Snapshot of the event ledger for this executor.
    pub async fn ledger_events(&self) -> Vec<ExecutionEvent> {
        self.ledger.lock().await.events()
    }

    pub async fn verify_ledger(&self) -> bool {
        self.ledger.lock().await.verify_integrity()
    }

    /// Submit a request to the oracle and persist its proposed actions as a
    /// gated plan. Returns the oracle's message alongside the plan.
    pub async fn propose(
        &self,
        oracle: &dyn Oracle,
        gate: &ApprovalGate,
        prompt: &str,
        context: &str,
    ) -> WardenResult<(String, Plan)> {
        let reply = oracle.submit(prompt, context).await?;
        let actions: Vec<ProposedAction> = reply
            .proposed_actions
            .into_iter()
            .map(ProposedAction::new)
            .collect();
        let plan = gate.create_plan(&self.assessor, actions).await?;
        Ok((reply.message, plan))
    }

    /// Execute the approved subset of a plan's actions. `indices` is the
    /// caller's selection; unapproved indices are skipped, not rejected.
    /// Dispatch order is topological when a TaskPlan is supplied, else the
    /// given list order.
    pub async fn execute_plan(
        &self,
        plan_id: &str,
        indices: Vec<usize>,
        task_plan: Option<&TaskPlan>,
    ) -> WardenResult<ExecutionReport> {
        let mut plan = self
            .plans
            .get(plan_id)
            .await?
            .ok_or_else(|| WardenError::PlanNotFound(plan_id.to_string()))?;

        // Expiry re-check before anything dispatches.
        if !plan.status.is_terminal() && plan.is_expired() {
            plan.mark_expired()?;
            self.plans.update(&plan).await?;
            return Err(WardenError::PlanExpired(plan_id.to_string()));
        }

        // Safety sweep across the full action list: a violation rejects the
        // plan with zero action_start events, never a warning.
        if let Err(violation) = self.safety.validate_plan(&self.assessor, &plan.actions) {
            log::error!("[Orchestrator] plan {} failed safety validation: {}", plan_id, violation);
            plan.mark_rejected(Rejection {
                approver: "warden".to_string(),
                reason: violation.to_string(),
                at: chrono::Utc::now(),
            })?;
            self.plans.update(&plan).await?;
            return Err(violation.into());
        }

        let order = match task_plan {
            Some(tp) => tp
                .dispatch_order()?
                .into_iter()
                .filter(|i| indices.contains(i))
                .collect(),
            None => indices.clone(),
        };

        plan.mark_executing(indices)?;
        self.plans.update(&plan).await?;
        log::info!(
            "[Orchestrator] plan {} executing {} of {} action(s)",
            plan_id,
            order.len(),
            plan.actions.len()
        );

        let mut outcomes = Vec::with_capacity(order.len());
        for index in order {
            // A plan expired or cancelled mid-run stops dispatching further
            // actions; spawned subprocesses are not retroactively killed.
            if let Some(current) = self.plans.get(plan_id).await? {
                if current.status.is_terminal() {
                    log::warn!(
                        "[Orchestrator] plan {} became {} mid-run, stopping dispatch",
                        plan_id,
                        current.status
                    );
                    return Ok(ExecutionReport {
                        plan_id: plan_id.to_string(),
                        status: current.status,
                        outcomes,
                    });
                }
            }
            if plan.is_expired() {
                plan.mark_expired()?;
                self.plans.update(&plan).await?;
                return Ok(ExecutionReport {
                    plan_id: plan_id.to_string(),
                    status: PlanStatus::Expired,
                    outcomes,
                });
            }

            let action = plan.actions[index].clone();
            self.emit(ExecutionEvent::ActionStart {
                plan_id: plan.id.clone(),
                index,
                action: action.kind.clone(),
            })
            .await;

            if action.kind.is_mutating() {
                let tracked: Vec<PathBuf> = action
                    .kind
                    .touched_paths()
                    .iter()
                    .map(|p| {
                        self.safety
                            .resolve(p)
                            .map_err(WardenError::from)
                    })
                    .collect::<WardenResult<_>>()?;
                let checkpoint = self
                    .checkpoints
                    .create_checkpoint(
                        &format!("before action {}: {}", index, action.kind),
                        Some(plan.id.clone()),
                        index,
                        &tracked,
                    )
                    .await?;
                self.emit(ExecutionEvent::CheckpointCreated {
                    plan_id: plan.id.clone(),
                    index,
                    checkpoint_id: checkpoint.id,
                })
                .await;
            }

            let outcome = self.run_with_recovery(&plan, index, &action.kind).await?;

            for warning in &outcome.warnings {
                self.emit(ExecutionEvent::RiskWarning {
                    plan_id: plan.id.clone(),
                    index: Some(index),
                    message: warning.clone(),
                })
                .await;
            }
            self.emit(ExecutionEvent::ActionComplete {
                plan_id: plan.id.clone(),
                index,
                success: outcome.success,
                output: outcome.output.clone(),
                exit_code: outcome.exit_code,
                error: outcome.error.clone(),
            })
            .await;

            let failed = !outcome.success;
            outcomes.push((index, outcome));

            if failed {
                // Required-step failure aborts the remaining actions; the
                // last checkpoint stays available for advisory rollback.
                plan.mark_failed()?;
                self.plans.update(&plan).await?;
                self.emit(ExecutionEvent::PlanComplete {
                    plan_id: plan.id.clone(),
                    status: PlanStatus::Failed,
                })
                .await;
                return Ok(ExecutionReport {
                    plan_id: plan_id.to_string(),
                    status: PlanStatus::Failed,
                    outcomes,
                });
            }
        }

        plan.mark_completed()?;
        self.plans.update(&plan).await?;
        self.emit(ExecutionEvent::PlanComplete {
            plan_id: plan.id.clone(),
            status: PlanStatus::Completed,
        })
        .await;
        Ok(ExecutionReport {
            plan_id: plan_id.to_string(),
            status: PlanStatus::Completed,
            outcomes,
        })
    }

    /// Execute one action with the bounded self-healing loop: on failure,
    /// diagnose, apply synthesized recovery actions, retry immediately.
    /// Retries are capped; an exhausted or unfixable failure carries its
    /// diagnosis back to the caller.
    async fn run_with_recovery(
        &self,
        plan: &Plan,
        index: usize,
        kind: &ActionKind,
    ) -> WardenResult<ActionOutcome> {
        let mut current = kind.clone();
        let mut retry_count: u32 = 0;

        loop {
            let mut outcome = self.execute_action(&current).await?;

            // Post-mutation verification; a required failure is treated the
            // same as an execution failure.
            let failure_text = if outcome.success {
                let resolved = current
                    .touched_paths()
                    .first()
                    .and_then(|p| self.safety.resolve(p).ok());
                let report = self.verifier.run(&current, resolved.as_deref()).await?;
                outcome.warnings.extend(report.warnings);
                if report.passed {
                    outcome.recovery_attempts = retry_count;
                    return Ok(outcome);
                }
                report.failures.join("\n")
            } else {
                outcome
                    .error
                    .clone()
                    .unwrap_or_else(|| "unknown failure".to_string())
            };

            let diagnosis = self.healer.diagnose(&failure_text);
            if !self.healer.can_retry(&diagnosis, retry_count) {
                log::warn!(
                    "[Orchestrator] action {} failed irrecoverably after {} retries: {}",
                    index,
                    retry_count,
                    diagnosis.likely_cause
                );
                let mut failed = ActionOutcome::failure(failure_text, outcome.exit_code);
                failed.warnings = outcome.warnings;
                failed.diagnosis = Some(diagnosis);
                failed.recovery_attempts = retry_count;
                return Ok(failed);
            }

            retry_count += 1;
            self.emit(ExecutionEvent::RecoveryAttempt {
                plan_id: plan.id.clone(),
                index,
                attempt: retry_count,
                category: diagnosis.error_type,
                description: diagnosis.likely_cause.clone(),
            })
            .await;

            // Apply synthesized recovery actions. Their own failures are
            // recorded, not fatal; the retry of the original decides.
            // Recovery commands are filled from failure text the failing
            // process controls, so they pass through the same deny-list as
            // proposed actions before touching a shell.
            for recovery in &diagnosis.recovery_actions {
                if let Some(reason) = self.assessor.check_denied(recovery) {
                    log::warn!(
                        "[Orchestrator] refusing synthesized recovery ({}): {:?}",
                        reason,
                        recovery
                    );
                    continue;
                }
                if let ActionKind::RunCommand { command } = recovery {
                    let out = exec::run_shell(
                        command,
                        Some(&self.workspace_root),
                        self.command_timeout_secs,
                    )
                    .await?;
                    if !out.success {
                        log::warn!(
                            "[Orchestrator] recovery command '{}' failed: {}",
                            command,
                            out.failure_text()
                        );
                    }
                }
            }

            // Port conflicts recover by relocation: rewrite the command onto
            // a re-probed free port.
            if diagnosis.error_type == crate::types::ErrorCategory::PortConflict {
                if let ActionKind::RunCommand { command } = &current {
                    if let Some(busy) = self.ports.embedded_port(command) {
                        let free = self.ports.find_available(busy, &[]).await?;
                        if free != busy {
                            let rewritten = self.ports.rewrite_port(command, free);
                            log::info!(
                                "[Orchestrator] relocating command from port {} to {}",
                                busy,
                                free
                            );
                            current = ActionKind::RunCommand { command: rewritten };
                        }
                    }
                }
            }
        }
    }

    /// Exhaustive dispatch over the action union.
    async fn execute_action(&self, kind: &ActionKind) -> WardenResult<ActionOutcome> {
        match kind {
            ActionKind::CreateFile { path, content } | ActionKind::EditFile { path, content } => {
                let resolved = self.safety.resolve(path)?;
                if let Some(parent) = resolved.parent() {
                    tokio::fs::create_dir_all(parent).await?;
                }
                // Full-content write, never a diff-apply.
                tokio::fs::write(&resolved, content).await?;
                log::debug!("[Orchestrator] wrote {} bytes to {}", content.len(), path);
                Ok(ActionOutcome::success(
                    Some(format!("wrote {} bytes to {}", content.len(), path)),
                    None,
                ))
            }
            ActionKind::RunCommand { command } => {
                let mut to_run = command.clone();
                let mut warnings = Vec::new();
                // Advisory port discipline: re-probe immediately before a
                // command that binds a port; relocate when it is taken.
                if let Some(port) = self.ports.embedded_port(command) {
                    let status = self.ports.check_port(port).await?;
                    if !status.available {
                        let free = self.ports.find_available(port, &[]).await?;
                        to_run = self.ports.rewrite_port(command, free);
                        warnings.push(match &status.owner {
                            Some(owner) => format!(
                                "port {} is held by {} (pid {}); relocated to {}",
                                port, owner.name, owner.pid, free
                            ),
                            None => format!("port {} is busy; relocated to {}", port, free),
                        });
                    }
                }
                let out =
                    exec::run_shell(&to_run, Some(&self.workspace_root), self.command_timeout_secs)
                        .await?;
                let mut outcome = if out.success {
                    ActionOutcome::success(Some(out.stdout.clone()), out.exit_code)
                } else {
                    ActionOutcome::failure(out.failure_text(), out.exit_code)
                };
                outcome.warnings = warnings;
                Ok(outcome)
            }
            ActionKind::InstallTool { tool } => self.install_tool(tool).await,
            ActionKind::CheckPort { port } => {
                let status = self.ports.check_port(*port).await?;
                Ok(ActionOutcome::success(
                    Some(serde_json::to_string(&status)?),
                    None,
                ))
            }
            ActionKind::KillPort { port } => {
                // An approved KillPort action is the explicit confirmation.
                let outcome = self.ports.kill_on_port(*port, true).await?;
                let report = serde_json::to_string(&outcome)?;
                match outcome {
                    KillOutcome::StillBound { pid } => Ok(ActionOutcome::failure(
                        format!("pid {} still bound to port {}", pid, port),
                        None,
                    )),
                    _ => Ok(ActionOutcome::success(Some(report), None)),
                }
            }
        }
    }

    /// Tool installation: no-op when the tool already answers on PATH, else
    /// try the package managers in order.
    async fn install_tool(&self, tool: &str) -> WardenResult<ActionOutcome> {
        let probe = exec::run_shell(
            &format!("command -v {}", tool),
            Some(&self.workspace_root),
            10,
        )
        .await?;
        if probe.success {
            return Ok(ActionOutcome::success(
                Some(format!("{} already installed at {}", tool, probe.stdout.trim())),
                Some(0),
            ));
        }
        let mut last = String::new();
        for installer in [
            format!("npm install -g {}", tool),
            format!("pip install {}", tool),
        ] {
            let out = exec::run_shell(
                &installer,
                Some(&self.workspace_root),
                self.command_timeout_secs,
            )
            .await?;
            if out.success {
                return Ok(ActionOutcome::success(
                    Some(format!("installed {} via `{}`", tool, installer)),
                    out.exit_code,
                ));
            }
            last = out.failure_text();
        }
        Ok(ActionOutcome::failure(
            format!("could not install {}: {}", tool, last),
            None,
        ))
    }

    /// Append to the ledger and fan out to sinks. Sink failures never fail
    /// the plan.
    async fn emit(&self, event: ExecutionEvent) {
        if let Err(e) = self.ledger.lock().await.append(event.clone()) {
            log::warn!("[Orchestrator] ledger append failed: {}", e);
        }
        for sink in &self.sinks {
            sink.on_event(&event).await;
        }
    }
}
