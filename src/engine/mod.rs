//! Engine - the operations exposed to the calling layer
//!
//! Wires validator, scheduler, runner, result store and health state
//! together. Every operation here is safe to call concurrently.

pub mod scheduler;

use std::sync::{Arc, Mutex};
use std::time::Duration;

use tokio::task::JoinHandle;
use tokio::time::{interval, timeout, MissedTickBehavior};
use tracing::{debug, info, warn};
use uuid::Uuid;

use crate::config::EngineConfig;
use crate::core::{ExecutionResult, Submission};
use crate::error::{EngineError, Result};
use crate::health::{HealthReport, HealthState, HealthStatus};
use crate::languages::{LanguageRegistry, Languages};
use crate::runner::SandboxRunner;
use crate::sandbox::SandboxBackend;
use crate::store::{Lookup, ResultStore};
use crate::validator::{RawExecutionRequest, RequestLimits, RequestValidator};

pub use scheduler::{Admission, CancelOutcome, CancelRelay, Scheduler};

/// Upper bound between TTL sweeps
const MAX_SWEEP_INTERVAL: Duration = Duration::from_secs(60);

pub struct Engine {
    config: Arc<EngineConfig>,
    validator: RequestValidator,
    backend: Arc<dyn SandboxBackend>,
    store: Arc<dyn ResultStore>,
    scheduler: Scheduler,
    health: Arc<HealthState>,
    sweeper: Mutex<Option<JoinHandle<()>>>,
}

impl Engine {
    /// Build the engine and start its dispatcher and TTL sweeper.
    /// Must be called from within a tokio runtime.
    pub fn new(
        config: EngineConfig,
        registry: Arc<LanguageRegistry>,
        backend: Arc<dyn SandboxBackend>,
        store: Arc<dyn ResultStore>,
    ) -> Result<Self> {
        config.validate()?;
        if registry.is_empty() {
            return Err(EngineError::InvalidConfig("no languages registered".into()));
        }

        let config = Arc::new(config);
        let validator = RequestValidator::new(registry, RequestLimits::from(config.as_ref()));
        let health = Arc::new(HealthState::new());
        let runner = Arc::new(SandboxRunner::new(
            Arc::clone(&backend),
            Arc::clone(&store),
            Arc::clone(&config),
        ));
        let scheduler = Scheduler::start(
            Arc::clone(&config),
            runner,
            Arc::clone(&store),
            Arc::clone(&health),
        );
        let sweeper = spawn_sweeper(Arc::clone(&store), config.result_ttl);

        info!(
            "Engine ready: backend {}, {} languages, {} workers",
            backend.name(),
            validator.registry().len(),
            config.workers
        );

        Ok(Self {
            config,
            validator,
            backend,
            store,
            scheduler,
            health,
            sweeper: Mutex::new(Some(sweeper)),
        })
    }

    pub fn config(&self) -> &EngineConfig {
        &self.config
    }

    pub fn backend(&self) -> &Arc<dyn SandboxBackend> {
        &self.backend
    }

    pub fn health_state(&self) -> &Arc<HealthState> {
        &self.health
    }

    /// Validate and queue a request; the caller polls `get_status` afterwards
    pub async fn submit(&self, raw: RawExecutionRequest) -> Result<Submission> {
        let request = self.validator.normalize(raw)?;
        self.scheduler.submit(request, Admission::Normal).await
    }

    /// Validate, queue and wait for the terminal result.
    ///
    /// Gives up with `WaitTimeout` after the request's timeout plus grace and
    /// queueing slack; the request itself keeps going and stays pollable.
    pub async fn execute_sync(&self, raw: RawExecutionRequest) -> Result<ExecutionResult> {
        self.execute(raw, Admission::Normal).await
    }

    /// Like `execute_sync`, but admitted while degraded
    pub(crate) async fn execute_self_test(
        &self,
        raw: RawExecutionRequest,
    ) -> Result<ExecutionResult> {
        self.execute(raw, Admission::SelfTest).await
    }

    async fn execute(
        &self,
        raw: RawExecutionRequest,
        admission: Admission,
    ) -> Result<ExecutionResult> {
        let request = self.validator.normalize(raw)?;
        let wait_budget = self.config.sync_wait_budget(request.timeout());
        let (submission, done) = self.scheduler.submit_and_wait(request, admission).await?;
        let execution_id = submission.execution_id;

        match timeout(wait_budget, done).await {
            Ok(Ok(result)) => Ok(result),
            Ok(Err(_)) => Err(EngineError::Backend(format!(
                "execution {} was dropped before completing",
                execution_id
            ))),
            Err(_) => {
                warn!(
                    "Gave up waiting for {} after {:?}; it remains pollable",
                    execution_id, wait_budget
                );
                Err(EngineError::WaitTimeout(execution_id))
            }
        }
    }

    pub async fn get_status(&self, execution_id: Uuid) -> Result<Lookup> {
        self.store.get(execution_id).await
    }

    pub async fn cancel(&self, execution_id: Uuid) -> Result<CancelOutcome> {
        self.scheduler.cancel(execution_id).await
    }

    /// Apply a cancel relayed from another instance; ids not owned here are ignored
    pub async fn cancel_local(&self, execution_id: Uuid) -> Result<Option<CancelOutcome>> {
        self.scheduler.cancel_local(execution_id).await
    }

    /// Route cancels for requests this instance does not own
    pub fn set_cancel_relay(&self, relay: Arc<dyn CancelRelay>) {
        self.scheduler.set_cancel_relay(relay);
    }

    pub fn list_languages(&self) -> Languages<'_> {
        self.validator.registry().list()
    }

    pub fn health(&self) -> HealthReport {
        let (last_check_at, self_tests) = self.health.last_cycle();
        HealthReport {
            status: if self.health.is_degraded() {
                HealthStatus::Degraded
            } else {
                HealthStatus::Healthy
            },
            backend: self.backend.name().to_string(),
            backend_available: self.health.backend_available(),
            supported_language_count: self.validator.registry().len(),
            queue_depth: self.scheduler.queue_depth(),
            running_count: self.scheduler.running_count(),
            last_check_at,
            self_tests,
        }
    }

    /// Stop accepting work, cancel queued and running requests, stop the sweeper
    pub async fn shutdown(&self) {
        info!("Engine shutting down");
        self.scheduler.shutdown().await;
        let sweeper = match self.sweeper.lock() {
            Ok(mut guard) => guard.take(),
            Err(poisoned) => poisoned.into_inner().take(),
        };
        if let Some(sweeper) = sweeper {
            sweeper.abort();
        }
    }
}

fn spawn_sweeper(store: Arc<dyn ResultStore>, ttl: Duration) -> JoinHandle<()> {
    let period = ttl.min(MAX_SWEEP_INTERVAL).max(Duration::from_millis(10));
    tokio::spawn(async move {
        let mut ticker = interval(period);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
        loop {
            ticker.tick().await;
            match store.purge_expired().await {
                Ok(0) => {}
                Ok(purged) => debug!("Evicted {} expired results", purged),
                Err(e) => warn!("Result sweep failed: {}", e),
            }
        }
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::ExecutionStatus;
    use crate::health::HealthMonitor;
    use crate::languages::LanguageProfile;
    use crate::sandbox::FakeBackend;
    use crate::store::MemoryResultStore;
    use crate::testing::{fast_config, registry};
    use std::collections::HashSet;
    use std::time::Instant;
    use tokio::time::sleep;

    fn engine_with(config: EngineConfig) -> (Arc<Engine>, FakeBackend) {
        let backend = FakeBackend::new();
        let store = Arc::new(MemoryResultStore::new(config.result_ttl));
        let engine = Engine::new(config, registry(), Arc::new(backend.clone()), store).unwrap();
        (Arc::new(engine), backend)
    }

    async fn poll_terminal(engine: &Engine, id: Uuid) -> ExecutionResult {
        let deadline = Instant::now() + Duration::from_secs(5);
        loop {
            if let Lookup::Finished(result) = engine.get_status(id).await.unwrap() {
                return result;
            }
            assert!(Instant::now() < deadline, "execution {} never finished", id);
            sleep(Duration::from_millis(5)).await;
        }
    }

    #[tokio::test]
    async fn test_hello_fenix_sync() {
        let (engine, _) = engine_with(fast_config());
        let result = engine
            .execute_sync(RawExecutionRequest::new("python", "print(\"Hello, Fenix!\")"))
            .await
            .unwrap();

        assert_eq!(result.status, ExecutionStatus::Succeeded);
        assert_eq!(result.stdout, "Hello, Fenix!\n");
        assert_eq!(result.exit_code, Some(0));
    }

    #[tokio::test]
    async fn test_submit_then_poll() {
        let (engine, _) = engine_with(fast_config());
        let submission = engine
            .submit(RawExecutionRequest::new("py", "sleep(30)\nprint(\"later\")"))
            .await
            .unwrap();
        assert_eq!(submission.status, ExecutionStatus::Queued);

        match engine.get_status(submission.execution_id).await.unwrap() {
            Lookup::Pending { execution_id, .. } => {
                assert_eq!(execution_id, submission.execution_id)
            }
            Lookup::Finished(result) => panic!("finished too early: {:?}", result),
            Lookup::NotFound => panic!("submission not visible"),
        }

        let result = poll_terminal(&engine, submission.execution_id).await;
        assert_eq!(result.stdout, "later\n");
        assert_eq!(
            engine.get_status(Uuid::new_v4()).await.unwrap(),
            Lookup::NotFound
        );
    }

    #[tokio::test]
    async fn test_validation_errors_short_circuit() {
        let (engine, backend) = engine_with(fast_config());

        let unsupported = engine
            .submit(RawExecutionRequest::new("cobol", "DISPLAY 'HI'"))
            .await;
        assert!(matches!(unsupported, Err(EngineError::UnsupportedLanguage(_))));

        let too_big = "x".repeat(engine.config().max_source_bytes + 1);
        let oversized = engine.submit(RawExecutionRequest::new("python", too_big)).await;
        assert!(matches!(oversized, Err(EngineError::PayloadTooLarge { .. })));

        assert!(backend.creation_order().is_empty());
        assert_eq!(engine.health().queue_depth, 0);
    }

    #[tokio::test]
    async fn test_sync_timeout_result_within_deadline() {
        let config = fast_config();
        let (engine, backend) = engine_with(config.clone());

        let started = Instant::now();
        let result = engine
            .execute_sync(
                RawExecutionRequest::new("python", "while True: pass").with_timeout_secs(1),
            )
            .await
            .unwrap();

        assert_eq!(result.status, ExecutionStatus::TimedOut);
        let limit = Duration::from_secs(1) + config.kill_grace * 2 + Duration::from_millis(300);
        assert!(started.elapsed() < limit);
        assert_eq!(backend.live_sandboxes(), 0);
        assert_eq!(backend.active_execs(), 0);
    }

    #[tokio::test]
    async fn test_sync_wait_gives_up_but_request_stays_pollable() {
        let config = EngineConfig {
            workers: 1,
            sync_wait_slack: Duration::ZERO,
            ..fast_config()
        };
        let (engine, _) = engine_with(config);

        // Occupy the only slot so the next request waits in the queue
        let blocker = engine
            .submit(RawExecutionRequest::new("python", "sleep(1500)").with_timeout_secs(2))
            .await
            .unwrap();

        let outcome = engine
            .execute_sync(
                RawExecutionRequest::new("python", "print(\"late\")").with_timeout_secs(1),
            )
            .await;
        let waited = match outcome {
            Err(EngineError::WaitTimeout(id)) => id,
            other => panic!("expected WaitTimeout, got {:?}", other),
        };

        poll_terminal(&engine, blocker.execution_id).await;
        let late = poll_terminal(&engine, waited).await;
        assert_eq!(late.stdout, "late\n");
    }

    #[tokio::test]
    async fn test_twenty_submissions_with_five_workers() {
        let config = EngineConfig {
            workers: 5,
            ..fast_config()
        };
        let (engine, backend) = engine_with(config);

        let mut ids = Vec::new();
        for i in 0..20 {
            let submission = engine
                .submit(RawExecutionRequest::new("python", format!("sleep(40)\nprint(\"{}\")", i)))
                .await
                .unwrap();
            ids.push(submission.execution_id);
        }

        let mut max_running = 0;
        for id in &ids {
            loop {
                let health = engine.health();
                max_running = max_running.max(health.running_count);
                if engine.get_status(*id).await.unwrap().is_terminal() {
                    break;
                }
                sleep(Duration::from_millis(5)).await;
            }
        }

        assert!(max_running <= 5);
        assert!(backend.peak_active() <= 5);
        assert_eq!(backend.creation_order(), ids);
        for (i, id) in ids.iter().enumerate() {
            let result = poll_terminal(&engine, *id).await;
            assert_eq!(result.status, ExecutionStatus::Succeeded);
            assert_eq!(result.stdout, format!("{}\n", i));
        }
    }

    #[tokio::test]
    async fn test_cancel_through_engine() {
        let (engine, _) = engine_with(fast_config());
        let submission = engine
            .submit(RawExecutionRequest::new("python", "loop"))
            .await
            .unwrap();
        let id = submission.execution_id;

        let deadline = Instant::now() + Duration::from_secs(5);
        while engine.health().running_count == 0 {
            assert!(Instant::now() < deadline);
            sleep(Duration::from_millis(5)).await;
        }
        assert_eq!(engine.cancel(id).await.unwrap(), CancelOutcome::Signalled);
        assert_eq!(poll_terminal(&engine, id).await.status, ExecutionStatus::Cancelled);
        assert_eq!(engine.cancel(id).await.unwrap(), CancelOutcome::AlreadyFinished);
        assert!(matches!(
            engine.cancel(Uuid::new_v4()).await,
            Err(EngineError::NotFound(_))
        ));
    }

    #[tokio::test]
    async fn test_list_languages_round_trip() {
        let (engine, _) = engine_with(fast_config());
        let listed: Vec<&LanguageProfile> = engine.list_languages().collect();
        let ids: HashSet<&str> = listed.iter().map(|p| p.id.as_str()).collect();
        assert_eq!(ids.len(), listed.len());
        assert_eq!(engine.health().supported_language_count, listed.len());

        for profile in engine.list_languages() {
            let resolved = engine.validator.registry().resolve(profile.id.as_str()).unwrap();
            assert_eq!(resolved.as_ref().id, profile.id);
        }
        // Restartable
        assert_eq!(engine.list_languages().count(), listed.len());
    }

    #[tokio::test]
    async fn test_degraded_after_repeated_backend_failures() {
        let config = EngineConfig {
            health_failure_threshold: 2,
            ..fast_config()
        };
        let (engine, backend) = engine_with(config);
        let monitor = HealthMonitor::new(Arc::clone(&engine));

        backend.set_available(false);
        monitor.run_cycle().await;
        assert_eq!(engine.health().status, HealthStatus::Healthy);
        let report = monitor.run_cycle().await;
        assert_eq!(report.status, HealthStatus::Degraded);
        assert!(!report.backend_available);

        let rejected = engine
            .submit(RawExecutionRequest::new("python", "print(\"x\")"))
            .await;
        assert!(matches!(rejected, Err(EngineError::ServiceDegraded)));

        backend.set_available(true);
        let report = monitor.run_cycle().await;
        assert_eq!(report.status, HealthStatus::Healthy);
        assert!(report.backend_available);
        let python = report
            .self_tests
            .iter()
            .find(|p| p.language == "python")
            .unwrap();
        assert!(python.passed);
        assert!(engine
            .execute_sync(RawExecutionRequest::new("python", "print(\"back\")"))
            .await
            .is_ok());
    }

    #[tokio::test]
    async fn test_shutdown_stops_admission() {
        let (engine, _) = engine_with(EngineConfig {
            workers: 1,
            ..fast_config()
        });
        let running = engine
            .submit(RawExecutionRequest::new("python", "loop"))
            .await
            .unwrap();

        engine.shutdown().await;
        let result = poll_terminal(&engine, running.execution_id).await;
        assert_eq!(result.status, ExecutionStatus::Cancelled);

        let late = engine
            .submit(RawExecutionRequest::new("python", "print(\"late\")"))
            .await;
        assert!(matches!(late, Err(EngineError::Backend(_))));
    }
}
