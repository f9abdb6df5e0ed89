use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use super::request::ExecutionRequest;
use super::status::ExecutionStatus;

/// Final outcome of an execution
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ExecutionResult {
    pub execution_id: Uuid,
    pub language: String,
    pub status: ExecutionStatus,
    /// Captured stdout, capped; ends with the truncation marker when cut
    pub stdout: String,
    /// Captured stderr (compiler diagnostics on compile failure), capped
    pub stderr: String,
    #[serde(default)]
    pub stdout_truncated: bool,
    #[serde(default)]
    pub stderr_truncated: bool,
    pub exit_code: Option<i32>,
    /// Wall-clock time from sandbox creation to terminal state
    pub duration_ms: u64,
    /// Peak memory in KB, when the backend reports it
    pub memory_used_kb: Option<u64>,
    pub created_at: DateTime<Utc>,
    pub completed_at: DateTime<Utc>,
}

impl ExecutionResult {
    /// Result with no output, e.g. for requests that never reached a sandbox
    pub fn empty(request: &ExecutionRequest, status: ExecutionStatus) -> Self {
        Self {
            execution_id: request.id(),
            language: request.language().to_string(),
            status,
            stdout: String::new(),
            stderr: String::new(),
            stdout_truncated: false,
            stderr_truncated: false,
            exit_code: None,
            duration_ms: 0,
            memory_used_kb: None,
            created_at: request.submitted_at(),
            completed_at: Utc::now(),
        }
    }

    /// Infrastructure failure surfaced to the caller
    pub fn internal_error(request: &ExecutionRequest, message: impl Into<String>) -> Self {
        Self {
            stderr: message.into(),
            ..Self::empty(request, ExecutionStatus::InternalError)
        }
    }

    pub fn is_success(&self) -> bool {
        self.status == ExecutionStatus::Succeeded
    }
}

/// Acknowledgement of an asynchronous submission
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Submission {
    pub execution_id: Uuid,
    pub status: ExecutionStatus,
}
