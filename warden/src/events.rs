//! Caller-facing execution events and the hash-chained ledger
//!
//! Every event the orchestrator emits is delivered to registered sinks and
//! appended to an in-memory ledger whose entries are chained with
//! `sha256(prev_hash || canonical-json(event))`, so a caller gets a
//! verifiable total order per run. Sink failures are logged, never fail the
//! plan.

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use tokio::sync::Mutex;

use crate::checkpoint::sha256_hex;
use crate::types::{ActionKind, ErrorCategory, PlanId, PlanStatus};

/// Ordered event stream for one plan execution.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "event", rename_all = "snake_case")]
pub enum ExecutionEvent {
    ActionStart {
        plan_id: PlanId,
        index: usize,
        action: ActionKind,
    },
    ActionComplete {
        plan_id: PlanId,
        index: usize,
        success: bool,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        output: Option<String>,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        exit_code: Option<i32>,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        error: Option<String>,
    },
    PlanComplete {
        plan_id: PlanId,
        status: PlanStatus,
    },
    /// Out-of-band: risk or verification warning.
    RiskWarning {
        plan_id: PlanId,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        index: Option<usize>,
        message: String,
    },
    /// Out-of-band: a self-healing retry is about to run.
    RecoveryAttempt {
        plan_id: PlanId,
        index: usize,
        attempt: u32,
        category: ErrorCategory,
        description: String,
    },
    /// A checkpoint was persisted before the mutation at `index`.
    CheckpointCreated {
        plan_id: PlanId,
        index: usize,
        checkpoint_id: String,
    },
}

/// Receives every event the orchestrator emits.
#[async_trait]
pub trait EventSink: Send + Sync {
    async fn on_event(&self, event: &ExecutionEvent);
}

/// Sink that logs events through the `log` facade.
pub struct LogSink;

#[async_trait]
impl EventSink for LogSink {
    async fn on_event(&self, event: &ExecutionEvent) {
        match serde_json::to_string(event) {
            Ok(json) => log::info!("[Events] {}", json),
            Err(e) => log::warn!("[Events] unserializable event: {}", e),
        }
    }
}

/// Sink that records events in memory; the test surface for ordering
/// properties.
#[derive(Default)]
pub struct RecordingSink {
    events: Mutex<Vec<ExecutionEvent>>,
}

impl RecordingSink {
    pub fn new() -> Self {
        Self::default()
    }

    pub async fn events(&self) -> Vec<ExecutionEvent> {
        self.events.lock().await.clone()
    }
}

#[async_trait]
impl EventSink for RecordingSink {
    async fn on_event(&self, event: &ExecutionEvent) {
        self.events.lock().await.push(event.clone());
    }
}

#[derive(Debug, Clone)]
pub struct LedgerEntry {
    pub event: ExecutionEvent,
    pub chain_hash: String,
}

/// In-memory hash-chained event ledger.
#[derive(Debug, Default)]
pub struct EventLedger {
    entries: Vec<LedgerEntry>,
}

const GENESIS_HASH: &str = "0";

impl EventLedger {
    pub fn new() -> Self {
        Self::default()
    }

    /// Append an event, chaining its hash onto the previous entry's.
    pub fn append(&mut self, event: ExecutionEvent) -> Result<String, serde_json::Error> {
        let prev = self
            .entries
            .last()
            .map(|e| e.chain_hash.as_str())
            .unwrap_or(GENESIS_HASH);
        let canonical = serde_json::to_string(&event)?;
        let chain_hash = sha256_hex(format!("{}{}", prev, canonical).as_bytes());
        self.entries.push(LedgerEntry { event, chain_hash });
        Ok(self.entries.last().map(|e| e.chain_hash.clone()).unwrap_or_default())
    }

    pub fn entries(&self) -> &[LedgerEntry] {
        &self.entries
    }

    pub fn events(&self) -> Vec<ExecutionEvent> {
        self.entries.iter().map(|e| e.event.clone()).collect()
    }

    /// Recompute the chain from genesis; false on any mismatch.
    pub fn verify_integrity(&self) -> bool {
        let mut prev = GENESIS_HASH.to_string();
        for entry in &self.entries {
            let canonical = match serde_json::to_string(&entry.event) {
                Ok(json) => json,
                Err(_) => return false,
            };
            let expected = sha256_hex(format!("{}{}", prev, canonical).as_bytes());
            if expected != entry.chain_hash {
                return false;
            }
            prev = entry.chain_hash.clone();
        }
        true
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn start_event(index: usize) -> ExecutionEvent {
        ExecutionEvent::ActionStart {
            plan_id: "plan-1".to_string(),
            index,
            action: ActionKind::RunCommand {
                command: "echo".to_string(),
            },
        }
    }

    #[test]
    fn ledger_chains_and_verifies() {
        let mut ledger = EventLedger::new();
        for i in 0..3 {
            ledger.append(start_event(i)).unwrap();
        }
        assert_eq!(ledger.entries().len(), 3);
        assert!(ledger.verify_integrity());

        // Hashes differ per entry even for similar events.
        let hashes: std::collections::HashSet<_> = ledger
            .entries()
            .iter()
            .map(|e| e.chain_hash.clone())
            .collect();
        assert_eq!(hashes.len(), 3);
    }

    #[test]
    fn tampering_breaks_integrity() {
        let mut ledger = EventLedger::new();
        ledger.append(start_event(0)).unwrap();
        ledger.append(start_event(1)).unwrap();
        ledger.entries[0].event = start_event(9);
        assert!(!ledger.verify_integrity());
    }

    #[tokio::test]
    async fn recording_sink_preserves_order() {
        let sink = RecordingSink::new();
        for i in 0..3 {
            sink.on_event(&start_event(i)).await;
        }
        let events = sink.events().await;
        assert_eq!(events.len(), 3);
        assert_eq!(events[0], start_event(0));
        assert_eq!(events[2], start_event(2));
    }

    #[test]
    fn events_serialize_with_an_event_tag() {
        let json = serde_json::to_string(&ExecutionEvent::PlanComplete {
            plan_id: "plan-1".to_string(),
            status: PlanStatus::Completed,
        })
        .unwrap();
        assert!(json.contains(r#""event":"plan_complete""#));
        assert!(json.contains(r#""status":"completed""#));
    }
}
