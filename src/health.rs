//! Health and capacity monitoring
//!
//! Every interval the monitor checks the sandbox backend and runs each
//! language's self-test program through the whole pipeline. Repeated
//! backend failures mark the engine degraded, which closes admission until
//! a cycle passes again.

use std::sync::atomic::{AtomicBool, AtomicU32, Ordering};
use std::sync::{Arc, RwLock};
use std::time::Instant;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tokio::task::JoinHandle;
use tokio::time::{interval, MissedTickBehavior};
use tracing::{debug, info, warn};

use crate::core::ExecutionStatus;
use crate::engine::Engine;
use crate::error::EngineError;
use crate::validator::RawExecutionRequest;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum HealthStatus {
    Healthy,
    Degraded,
}

/// Outcome of one language self-test
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SelfTestRecord {
    pub language: String,
    pub passed: bool,
    pub latency_ms: u64,
    pub status: Option<ExecutionStatus>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub detail: Option<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct HealthReport {
    pub status: HealthStatus,
    pub backend: String,
    pub backend_available: bool,
    pub supported_language_count: usize,
    pub queue_depth: usize,
    pub running_count: usize,
    pub last_check_at: Option<DateTime<Utc>>,
    pub self_tests: Vec<SelfTestRecord>,
}

/// Counters shared between the monitor, the scheduler's admission gate and
/// `Engine::health`
#[derive(Debug)]
pub struct HealthState {
    degraded: AtomicBool,
    backend_available: AtomicBool,
    consecutive_failures: AtomicU32,
    last_cycle: RwLock<(Option<DateTime<Utc>>, Vec<SelfTestRecord>)>,
}

impl Default for HealthState {
    fn default() -> Self {
        Self::new()
    }
}

impl HealthState {
    /// Optimistic until the first cycle says otherwise
    pub fn new() -> Self {
        Self {
            degraded: AtomicBool::new(false),
            backend_available: AtomicBool::new(true),
            consecutive_failures: AtomicU32::new(0),
            last_cycle: RwLock::new((None, Vec::new())),
        }
    }

    pub fn is_degraded(&self) -> bool {
        self.degraded.load(Ordering::SeqCst)
    }

    pub fn set_degraded(&self, degraded: bool) {
        self.degraded.store(degraded, Ordering::SeqCst);
    }

    pub fn backend_available(&self) -> bool {
        self.backend_available.load(Ordering::SeqCst)
    }

    pub fn consecutive_failures(&self) -> u32 {
        self.consecutive_failures.load(Ordering::SeqCst)
    }

    pub fn last_cycle(&self) -> (Option<DateTime<Utc>>, Vec<SelfTestRecord>) {
        match self.last_cycle.read() {
            Ok(guard) => guard.clone(),
            Err(poisoned) => poisoned.into_inner().clone(),
        }
    }

    /// Fold one cycle into the counters and flip the gate as needed
    pub fn record_cycle(
        &self,
        backend_available: bool,
        backend_failed: bool,
        self_tests: Vec<SelfTestRecord>,
        failure_threshold: u32,
    ) {
        self.backend_available
            .store(backend_available, Ordering::SeqCst);

        if backend_failed {
            let failures = self.consecutive_failures.fetch_add(1, Ordering::SeqCst) + 1;
            if failures >= failure_threshold && !self.degraded.swap(true, Ordering::SeqCst) {
                warn!(
                    "Sandbox backend failed {} consecutive health checks, engine degraded",
                    failures
                );
            }
        } else {
            self.consecutive_failures.store(0, Ordering::SeqCst);
            if self.degraded.swap(false, Ordering::SeqCst) {
                info!("Health check passed, engine accepting work again");
            }
        }

        let mut last = match self.last_cycle.write() {
            Ok(guard) => guard,
            Err(poisoned) => poisoned.into_inner(),
        };
        *last = (Some(Utc::now()), self_tests);
    }
}

pub struct HealthMonitor {
    engine: Arc<Engine>,
}

impl HealthMonitor {
    pub fn new(engine: Arc<Engine>) -> Self {
        Self { engine }
    }

    /// Run checks every `health_interval` until the task is aborted
    pub fn spawn(self) -> JoinHandle<()> {
        tokio::spawn(async move {
            let mut ticker = interval(self.engine.config().health_interval);
            ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
            loop {
                ticker.tick().await;
                self.run_cycle().await;
            }
        })
    }

    /// One full cycle: backend check plus every language self-test
    pub async fn run_cycle(&self) -> HealthReport {
        let engine = &self.engine;
        let backend_available = match engine.backend().check_available().await {
            Ok(()) => true,
            Err(e) => {
                warn!("Sandbox backend {} unavailable: {:#}", engine.backend().name(), e);
                false
            }
        };

        let mut backend_failed = !backend_available;
        let mut self_tests = Vec::new();
        if backend_available {
            for profile in engine.list_languages() {
                let Some(self_test) = &profile.self_test else {
                    continue;
                };
                let raw = RawExecutionRequest::new(profile.id.as_str(), self_test.source.clone());
                let started = Instant::now();
                let outcome = engine.execute_self_test(raw).await;
                let latency_ms = started.elapsed().as_millis() as u64;

                let record = match outcome {
                    Ok(result) => {
                        if result.status == ExecutionStatus::InternalError {
                            backend_failed = true;
                        }
                        let passed =
                            result.is_success() && result.stdout == self_test.expected_stdout;
                        SelfTestRecord {
                            language: profile.id.to_string(),
                            passed,
                            latency_ms,
                            status: Some(result.status),
                            detail: (!passed)
                                .then(|| failure_detail(&result.stdout, &result.stderr)),
                        }
                    }
                    Err(e) => {
                        if matches!(e, EngineError::Backend(_) | EngineError::Io(_)) {
                            backend_failed = true;
                        }
                        SelfTestRecord {
                            language: profile.id.to_string(),
                            passed: false,
                            latency_ms,
                            status: None,
                            detail: Some(e.to_string()),
                        }
                    }
                };
                if !record.passed {
                    warn!(
                        "Self-test for {} failed: {:?}",
                        record.language, record.detail
                    );
                }
                self_tests.push(record);
            }
        }

        debug!(
            "Health cycle: backend_available={}, {} self-tests, {} passed",
            backend_available,
            self_tests.len(),
            self_tests.iter().filter(|p| p.passed).count()
        );
        engine.health_state().record_cycle(
            backend_available,
            backend_failed,
            self_tests,
            engine.config().health_failure_threshold,
        );
        engine.health()
    }
}

const DETAIL_LIMIT: usize = 200;

fn failure_detail(stdout: &str, stderr: &str) -> String {
    let text = if stderr.trim().is_empty() { stdout } else { stderr };
    text.chars().take(DETAIL_LIMIT).collect()
}
