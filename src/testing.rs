//! Fixtures shared by the in-crate tests

use std::sync::Arc;
use std::time::Duration;

use crate::config::EngineConfig;
use crate::core::ExecutionRequest;
use crate::languages::LanguageRegistry;
use crate::validator::{RawExecutionRequest, RequestLimits, RequestValidator};

pub fn registry() -> Arc<LanguageRegistry> {
    Arc::new(LanguageRegistry::builtin().unwrap())
}

/// Defaults with short grace and backoff so tests stay fast
pub fn fast_config() -> EngineConfig {
    EngineConfig {
        kill_grace: Duration::from_millis(100),
        infra_retry_backoff: Duration::from_millis(10),
        sync_wait_slack: Duration::from_secs(2),
        health_interval: Duration::from_secs(3600),
        ..EngineConfig::default()
    }
}

pub fn normalize(config: &EngineConfig, raw: RawExecutionRequest) -> ExecutionRequest {
    RequestValidator::new(registry(), RequestLimits::from(config))
        .normalize(raw)
        .unwrap()
}

pub fn request(language: &str, source: &str) -> ExecutionRequest {
    normalize(&fast_config(), RawExecutionRequest::new(language, source))
}
