// Warden Library
// Action execution core for an AI coding-assistant backend: risk gating,
// tiered approval, checkpointed execution, verification, and bounded
// self-healing recovery.

// Data model and error surface
pub mod config;
pub mod error;
pub mod types;

// Leaf engines
pub mod checkpoint;
pub mod exec;
pub mod healing;
pub mod ports;
pub mod risk;
pub mod verify;

// Plan lifecycle
pub mod approval;
pub mod steps;
pub mod storage;

// Orchestration and collaborators
pub mod events;
pub mod oracle;
pub mod orchestrator;

pub use approval::ApprovalGate;
pub use checkpoint::{CheckpointManager, RollbackAdvice};
pub use config::WardenConfig;
pub use error::{OracleError, SafetyViolation, StorageError, WardenError, WardenResult};
pub use events::{EventLedger, EventSink, ExecutionEvent, LogSink, RecordingSink};
pub use healing::SelfHealingEngine;
pub use oracle::{HttpOracle, Oracle, OracleReply, StubOracle};
pub use orchestrator::{ExecutionReport, PlanExecutor};
pub use ports::{KillOutcome, PortOwner, PortResourceManager, PortStatus};
pub use risk::{RiskAssessment, RiskAssessor, RiskCategory, SafetyPolicy};
pub use steps::{StepStatus, TaskPlan, TaskStep};
pub use storage::{
    CheckpointStore, FileCheckpointStore, FilePlanStore, MemoryCheckpointStore, MemoryPlanStore,
    PlanStore,
};
pub use types::{
    ActionKind, ActionOutcome, ApprovalTier, Checkpoint, Endorsement, ErrorCategory,
    ErrorDiagnosis, Plan, PlanId, PlanStatus, ProposedAction, Rejection, RiskLevel, Role,
};
pub use verify::{VerificationEngine, VerificationReport};
