//! Error types for the action execution core
//!
//! Every failure is classified, never swallowed: storage, oracle, safety,
//! approval, execution and verification each get their own variant so the
//! orchestrator's recovery branches stay exhaustively checkable.

use thiserror::Error;

/// Convenience alias used across the crate.
pub type WardenResult<T> = Result<T, WardenError>;

/// Errors that can occur anywhere in the execution core.
#[derive(Debug, Error)]
pub enum WardenError {
    #[error("Configuration error: {0}")]
    Config(String),

    #[error("Storage error: {0}")]
    Storage(#[from] StorageError),

    #[error("Oracle error: {0}")]
    Oracle(#[from] OracleError),

    #[error("Safety violation: {0}")]
    Safety(#[from] SafetyViolation),

    #[error("Approval error: {0}")]
    Approval(String),

    #[error("Plan {0} not found")]
    PlanNotFound(String),

    #[error("Invalid plan transition: {from} -> {to}")]
    InvalidTransition { from: String, to: String },

    #[error("Action index {index} out of range for plan with {len} actions")]
    IndexOutOfRange { index: usize, len: usize },

    #[error("Plan {0} has expired")]
    PlanExpired(String),

    #[error("Step dependency cycle involving '{0}'")]
    DependencyCycle(String),

    #[error("Unknown step dependency '{0}'")]
    UnknownDependency(String),

    #[error("Command execution failed: {0}")]
    Exec(String),

    #[error("Verification failed: {0}")]
    Verification(String),

    #[error("Port error: {0}")]
    Port(String),

    #[error("Invalid pattern '{pattern}': {source}")]
    Pattern {
        pattern: String,
        #[source]
        source: regex::Error,
    },

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Serialization error: {0}")]
    Serde(#[from] serde_json::Error),
}

/// Errors raised by plan/checkpoint stores.
#[derive(Debug, Error)]
pub enum StorageError {
    #[error("Record {0} not found")]
    NotFound(String),

    #[error("Record {0} already exists")]
    AlreadyExists(String),

    #[error("Storage I/O failure at {path}: {message}")]
    Io { path: String, message: String },

    #[error("Corrupt record {id}: {message}")]
    Corrupt { id: String, message: String },
}

/// Errors raised when talking to the external reasoning oracle.
///
/// `Transient` errors (rate limits, 5xx, timeouts) are retried with
/// exponential backoff; `Terminal` errors are surfaced immediately.
#[derive(Debug, Error)]
pub enum OracleError {
    #[error("Transient provider error ({status}): {message}")]
    Transient { status: u16, message: String },

    #[error("Terminal provider error ({status}): {message}")]
    Terminal { status: u16, message: String },

    #[error("Request failed: {0}")]
    Request(String),

    #[error("Malformed oracle reply: {0}")]
    Malformed(String),

    #[error("Retries exhausted after {attempts} attempts: {last_error}")]
    RetriesExhausted { attempts: u32, last_error: String },
}

impl OracleError {
    /// Whether a retry with backoff may succeed.
    pub fn is_retryable(&self) -> bool {
        matches!(
            self,
            OracleError::Transient { .. } | OracleError::Request(_)
        )
    }
}

/// Pre-execution safety failures. These reject the whole plan outright and
/// are never downgraded to warnings.
#[derive(Debug, Error)]
pub enum SafetyViolation {
    #[error("Denied command pattern '{pattern}' matched: {command}")]
    DeniedCommand { pattern: String, command: String },

    #[error("Path escapes workspace root: {0}")]
    PathEscape(String),

    #[error("File content too large: {size} bytes (limit {limit})")]
    OversizedFile { size: usize, limit: usize },
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn oracle_retryable_classification() {
        let transient = OracleError::Transient {
            status: 429,
            message: "rate limited".to_string(),
        };
        let terminal = OracleError::Terminal {
            status: 401,
            message: "bad key".to_string(),
        };
        assert!(transient.is_retryable());
        assert!(!terminal.is_retryable());
        assert!(OracleError::Request("connection reset".to_string()).is_retryable());
    }

    #[test]
    fn safety_violation_converts_into_warden_error() {
        let err: WardenError = SafetyViolation::PathEscape("../etc/passwd".to_string()).into();
        assert!(matches!(err, WardenError::Safety(_)));
        assert!(err.to_string().contains("escapes workspace root"));
    }
}
