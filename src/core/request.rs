use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use uuid::Uuid;

use crate::languages::{LanguageId, LanguageProfile};

/// A validated, normalized execution request.
///
/// Only the request validator builds these; fields are read-only afterwards.
#[derive(Debug, Clone)]
pub struct ExecutionRequest {
    id: Uuid,
    source_code: String,
    profile: Arc<LanguageProfile>,
    stdin: Option<String>,
    timeout_secs: u64,
    memory_limit_mb: u64,
    submitter_id: Option<String>,
    submitted_at: DateTime<Utc>,
}

impl ExecutionRequest {
    #[allow(clippy::too_many_arguments)]
    pub(crate) fn new(
        id: Uuid,
        source_code: String,
        profile: Arc<LanguageProfile>,
        stdin: Option<String>,
        timeout_secs: u64,
        memory_limit_mb: u64,
        submitter_id: Option<String>,
        submitted_at: DateTime<Utc>,
    ) -> Self {
        Self {
            id,
            source_code,
            profile,
            stdin,
            timeout_secs,
            memory_limit_mb,
            submitter_id,
            submitted_at,
        }
    }

    pub fn id(&self) -> Uuid {
        self.id
    }

    pub fn source_code(&self) -> &str {
        &self.source_code
    }

    pub fn language(&self) -> &LanguageId {
        &self.profile.id
    }

    pub fn profile(&self) -> &Arc<LanguageProfile> {
        &self.profile
    }

    pub fn stdin(&self) -> Option<&str> {
        self.stdin.as_deref()
    }

    pub fn timeout_secs(&self) -> u64 {
        self.timeout_secs
    }

    /// Total wall-clock budget for compile + run
    pub fn timeout(&self) -> Duration {
        Duration::from_secs(self.timeout_secs)
    }

    pub fn memory_limit_mb(&self) -> u64 {
        self.memory_limit_mb
    }

    pub fn submitter_id(&self) -> Option<&str> {
        self.submitter_id.as_deref()
    }

    pub fn submitted_at(&self) -> DateTime<Utc> {
        self.submitted_at
    }
}
