//! Errors surfaced to callers of the engine

use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::registry::BackendId;

/// Result type alias for engine operations
pub type EngineResult<T> = Result<T, EngineError>;

/// Why one candidate backend did not produce a result
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct BackendFailure {
    pub backend: BackendId,
    pub reason: String,
    /// Invocations made against this backend (0 when it was skipped)
    pub attempts: u32,
}

impl std::fmt::Display for BackendFailure {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(
            f,
            "{}: {} ({} attempt{})",
            self.backend,
            self.reason,
            self.attempts,
            if self.attempts == 1 { "" } else { "s" }
        )
    }
}

/// Errors returned by
/// [`ExecutionCoordinator::execute`](crate::resilience::ExecutionCoordinator::execute)
#[derive(Debug, Clone, Error)]
pub enum EngineError {
    /// The request itself was rejected; no other backend was tried.
    #[error("Fatal error from {backend}: {reason}")]
    Fatal { backend: BackendId, reason: String },

    /// Every candidate failed, was skipped, or none were eligible.
    #[error("All backends exhausted: {}", format_failures(.failures))]
    BackendsExhausted { failures: Vec<BackendFailure> },
}

impl EngineError {
    pub fn is_fatal(&self) -> bool {
        matches!(self, Self::Fatal { .. })
    }

    /// Per-backend failures; empty for fatal errors.
    pub fn failures(&self) -> &[BackendFailure] {
        match self {
            Self::BackendsExhausted { failures } => failures,
            Self::Fatal { .. } => &[],
        }
    }
}

fn format_failures(failures: &[BackendFailure]) -> String {
    if failures.is_empty() {
        return "no eligible backends".to_string();
    }
    failures
        .iter()
        .map(ToString::to_string)
        .collect::<Vec<_>>()
        .join("; ")
}
