//! Execution diagnostics for one stage invocation.
//!
//! [`ExecutionDiagnostics`] records how a stage reached its outcome: how
//! many gateway calls it took, how many of those were transport retries or
//! validation repairs, and how long it spent waiting in backoff.

use serde::{Deserialize, Serialize};

/// # Example
///
/// ```
/// use resonance_pipeline::diagnostics::ExecutionDiagnostics;
///
/// let diag = ExecutionDiagnostics::default();
/// assert!(diag.first_try());
/// ```
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ExecutionDiagnostics {
    /// Gateway calls made, first call included.
    pub attempts: u32,

    /// Calls that followed a retryable transport failure.
    pub transport_retries: u32,

    /// Calls that followed a validation failure.
    pub repairs: u32,

    /// Attempts that hit the per-attempt timeout.
    pub timeouts: u32,

    /// Total time spent sleeping in backoff (milliseconds).
    pub backoff_total_ms: u64,

    /// Whether lenient JSON repair was needed for the accepted answer.
    pub repaired_json: bool,

    /// Validation failure descriptions, oldest first.
    pub validation_errors: Vec<String>,
}

impl ExecutionDiagnostics {
    /// Whether the first call was accepted as-is.
    pub fn first_try(&self) -> bool {
        self.attempts <= 1 && !self.repaired_json
    }
}
