//! Result store
//!
//! Write-once-per-id map from execution id to terminal result, plus the
//! pending status of requests that have not finished yet. Entries expire
//! after the configured TTL.

pub mod memory;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::core::{ExecutionResult, ExecutionStatus};
use crate::error::Result;

pub use memory::MemoryResultStore;

/// Outcome of a status lookup
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "state", rename_all = "snake_case")]
pub enum Lookup {
    /// Terminal result is available
    Finished(ExecutionResult),
    /// Known request still queued, compiling or running
    Pending {
        execution_id: Uuid,
        status: ExecutionStatus,
    },
    /// Unknown or evicted id
    NotFound,
}

impl Lookup {
    pub fn status(&self) -> Option<ExecutionStatus> {
        match self {
            Lookup::Finished(result) => Some(result.status),
            Lookup::Pending { status, .. } => Some(*status),
            Lookup::NotFound => None,
        }
    }

    pub fn is_terminal(&self) -> bool {
        matches!(self, Lookup::Finished(_))
    }
}

#[async_trait]
pub trait ResultStore: Send + Sync {
    /// Record the pending status of a request. Ignored once a terminal
    /// result exists.
    async fn mark(&self, execution_id: Uuid, status: ExecutionStatus) -> Result<()>;

    /// Write the terminal result. A second write for the same id fails with
    /// `DuplicateResult` and leaves the first result untouched.
    async fn complete(&self, result: ExecutionResult) -> Result<()>;

    async fn get(&self, execution_id: Uuid) -> Result<Lookup>;

    /// Forget a pending request that was never admitted
    async fn discard(&self, execution_id: Uuid) -> Result<()>;

    /// Evict expired entries, returning how many were removed
    async fn purge_expired(&self) -> Result<usize>;
}
