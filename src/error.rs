//! Error types for the simulator and strategy engine.
//!
//! Row and compilation errors are local faults reported to the immediate
//! caller. `Cancelled` is ordinary control flow: it is what a pending pacing
//! wait resolves to when the controller is terminated.

use thiserror::Error;

#[derive(Debug, Clone, PartialEq, Error)]
pub enum SimError {
    #[error("invalid state: cannot advance row {row} ({reason})")]
    InvalidRowState { row: i64, reason: &'static str },

    #[error("strategy compilation failed at line {line}: {message}")]
    Compilation { line: usize, message: String },

    #[error("process is being terminated")]
    Cancelled,

    #[error("strategy '{name}' is already running")]
    RunAlreadyInProgress { name: String },

    #[error("invalid simulation config: {0}")]
    InvalidConfig(String),

    #[error("strategy not found: {0}")]
    StrategyNotFound(String),

    #[error("strategy '{0}' has no usable decision function")]
    MissingDecisionFunction(String),
}

impl SimError {
    /// Cancellation is an expected outcome, not an application fault.
    pub fn is_cancellation(&self) -> bool {
        matches!(self, SimError::Cancelled)
    }
}

pub type Result<T> = std::result::Result<T, SimError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_cancellation_flag() {
        assert!(SimError::Cancelled.is_cancellation());
        assert!(!SimError::InvalidRowState { row: 0, reason: "row is complete" }.is_cancellation());
    }

    #[test]
    fn test_display_mentions_row() {
        let err = SimError::InvalidRowState { row: 3, reason: "out of range" };
        assert!(err.to_string().contains("row 3"));
    }
}
