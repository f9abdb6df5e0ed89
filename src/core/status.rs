use serde::{Deserialize, Serialize};
use std::fmt;

/// Lifecycle status of an execution
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ExecutionStatus {
    Queued,
    Compiling,
    Running,
    Succeeded,
    Failed,
    TimedOut,
    MemoryExceeded,
    Cancelled,
    InternalError,
}

impl ExecutionStatus {
    /// Terminal statuses are written exactly once and never change afterwards
    pub fn is_terminal(&self) -> bool {
        !matches!(
            self,
            ExecutionStatus::Queued | ExecutionStatus::Compiling | ExecutionStatus::Running
        )
    }
}

impl fmt::Display for ExecutionStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            ExecutionStatus::Queued => "queued",
            ExecutionStatus::Compiling => "compiling",
            ExecutionStatus::Running => "running",
            ExecutionStatus::Succeeded => "succeeded",
            ExecutionStatus::Failed => "failed",
            ExecutionStatus::TimedOut => "timed_out",
            ExecutionStatus::MemoryExceeded => "memory_exceeded",
            ExecutionStatus::Cancelled => "cancelled",
            ExecutionStatus::InternalError => "internal_error",
        };
        write!(f, "{}", s)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_terminal_statuses() {
        assert!(!ExecutionStatus::Queued.is_terminal());
        assert!(!ExecutionStatus::Compiling.is_terminal());
        assert!(!ExecutionStatus::Running.is_terminal());
        assert!(ExecutionStatus::Succeeded.is_terminal());
        assert!(ExecutionStatus::TimedOut.is_terminal());
        assert!(ExecutionStatus::InternalError.is_terminal());
    }

    #[test]
    fn test_status_display_matches_serde() {
        for status in [
            ExecutionStatus::MemoryExceeded,
            ExecutionStatus::TimedOut,
            ExecutionStatus::Cancelled,
        ] {
            let json = serde_json::to_string(&status).unwrap();
            assert_eq!(json, format!("\"{}\"", status));
        }
    }
}
