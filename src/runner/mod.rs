//! Runner module - one execution, one sandbox
//!
//! `SandboxRunner` takes an admitted request through
//! `[Compiling] -> Running -> terminal`:
//! - Writes the source into a fresh sandbox
//! - Runs the optional compile step under its share of the timeout
//! - Runs the program with the remaining budget and the request's stdin
//! - Maps the raw outcome to an `ExecutionStatus` and writes the result
//!
//! Infrastructure failures are retried once after a backoff. Program
//! failures are never retried.

pub mod watchdog;

use std::sync::Arc;
use std::time::Instant;

use chrono::Utc;
use tokio::time::{sleep, timeout};
use tracing::{debug, error, info, warn};

use crate::config::EngineConfig;
use crate::core::{ExecutionRequest, ExecutionResult, ExecutionStatus};
use crate::sandbox::{
    ExecIo, ExecSpec, OutputSink, ProcessExit, SandboxBackend, SandboxHandle, SandboxSpec,
};
use crate::store::ResultStore;

pub use watchdog::{CancelHandle, CancelSignal};
use watchdog::{supervise, StepEnd};

/// Attempts per request: the first run plus one infrastructure retry
const MAX_ATTEMPTS: u32 = 2;

/// Exit code convention for signal deaths
const SIGNAL_EXIT_BASE: i32 = 128;

/// Terminal classification of one attempt, before output is attached
#[derive(Debug)]
struct Verdict {
    status: ExecutionStatus,
    exit_code: Option<i32>,
    memory_kb: Option<u64>,
    /// Compile diagnostics replace stderr when the compile step failed
    diagnostics: Option<OutputSink>,
}

impl Verdict {
    fn new(status: ExecutionStatus) -> Self {
        Self {
            status,
            exit_code: None,
            memory_kb: None,
            diagnostics: None,
        }
    }

    fn from_exit(exit: ProcessExit, memory_kb: Option<u64>) -> Self {
        let (status, exit_code) = match exit {
            ProcessExit::Exited(0) => (ExecutionStatus::Succeeded, Some(0)),
            ProcessExit::Exited(code) => (ExecutionStatus::Failed, Some(code)),
            ProcessExit::Signaled(sig) => {
                (ExecutionStatus::Failed, Some(SIGNAL_EXIT_BASE + sig))
            }
            ProcessExit::TimedOut => (ExecutionStatus::TimedOut, None),
            ProcessExit::MemoryExceeded => (ExecutionStatus::MemoryExceeded, None),
        };
        Self {
            status,
            exit_code,
            memory_kb,
            diagnostics: None,
        }
    }
}

pub struct SandboxRunner {
    backend: Arc<dyn SandboxBackend>,
    store: Arc<dyn ResultStore>,
    config: Arc<EngineConfig>,
}

impl SandboxRunner {
    pub fn new(
        backend: Arc<dyn SandboxBackend>,
        store: Arc<dyn ResultStore>,
        config: Arc<EngineConfig>,
    ) -> Self {
        Self {
            backend,
            store,
            config,
        }
    }

    pub fn backend(&self) -> &Arc<dyn SandboxBackend> {
        &self.backend
    }

    /// Drive `request` to a terminal result and record it in the store.
    pub async fn run(
        &self,
        request: &ExecutionRequest,
        mut cancel: CancelSignal,
    ) -> ExecutionResult {
        info!(
            "Executing {} ({}, timeout {}s, memory {}MB)",
            request.id(),
            request.language(),
            request.timeout_secs(),
            request.memory_limit_mb()
        );

        let result = self.run_attempts(request, &mut cancel).await;

        info!(
            "Execution {} finished: {} in {}ms",
            request.id(),
            result.status,
            result.duration_ms
        );
        if let Err(e) = self.store.complete(result.clone()).await {
            error!("Failed to store result for {}: {}", request.id(), e);
        }
        result
    }

    /// Attempts share one deadline, so a retry only gets what the first
    /// attempt left over.
    async fn run_attempts(
        &self,
        request: &ExecutionRequest,
        cancel: &mut CancelSignal,
    ) -> ExecutionResult {
        let started = Instant::now();
        let deadline = started + request.timeout();
        let mut attempt = 1;
        loop {
            if cancel.is_cancelled() {
                return ExecutionResult::empty(request, ExecutionStatus::Cancelled);
            }

            let err = match self.attempt(request, cancel, started, deadline).await {
                Ok(result) => return result,
                Err(e) => e,
            };

            let retry_at = Instant::now() + self.config.infra_retry_backoff;
            if attempt >= MAX_ATTEMPTS || retry_at >= deadline {
                error!(
                    "Execution {} failed after {} attempts: {:#}",
                    request.id(),
                    attempt,
                    err
                );
                return ExecutionResult::internal_error(
                    request,
                    format!("sandbox infrastructure failure: {:#}", err),
                );
            }

            warn!(
                "Attempt {} for {} hit an infrastructure error, retrying in {:?}: {:#}",
                attempt,
                request.id(),
                self.config.infra_retry_backoff,
                err
            );
            tokio::select! {
                _ = sleep(self.config.infra_retry_backoff) => {}
                _ = cancel.cancelled() => {
                    return ExecutionResult::empty(request, ExecutionStatus::Cancelled);
                }
            }
            attempt += 1;
        }
    }

    /// One attempt in a fresh sandbox. `Err` means infrastructure failure.
    async fn attempt(
        &self,
        request: &ExecutionRequest,
        cancel: &mut CancelSignal,
        started: Instant,
        deadline: Instant,
    ) -> anyhow::Result<ExecutionResult> {
        let spec = SandboxSpec {
            execution_id: request.id(),
            image_ref: request.profile().image_ref.clone(),
            memory_limit_mb: request.memory_limit_mb(),
            allow_network: self.config.allow_network,
        };

        let sandbox: Arc<dyn SandboxHandle> = Arc::from(self.backend.create(&spec).await?);
        debug!("Created sandbox {} for {}", sandbox.id(), request.id());

        let stdout = OutputSink::new(self.config.output_limit_bytes);
        let stderr = OutputSink::new(self.config.output_limit_bytes);
        let verdict = self
            .drive(&sandbox, request, cancel, deadline, &stdout, &stderr)
            .await;

        match timeout(self.config.kill_grace, sandbox.destroy()).await {
            Ok(Ok(())) => {}
            Ok(Err(e)) => error!("Failed to destroy sandbox {}: {:#}", sandbox.id(), e),
            Err(_) => error!("Destroying sandbox {} timed out", sandbox.id()),
        }

        let verdict = verdict?;
        let stdout = stdout.snapshot();
        let stderr = verdict.diagnostics.as_ref().unwrap_or(&stderr).snapshot();

        Ok(ExecutionResult {
            execution_id: request.id(),
            language: request.language().to_string(),
            status: verdict.status,
            stdout: stdout.text,
            stderr: stderr.text,
            stdout_truncated: stdout.truncated,
            stderr_truncated: stderr.truncated,
            exit_code: verdict.exit_code,
            duration_ms: started.elapsed().as_millis() as u64,
            memory_used_kb: verdict.memory_kb,
            created_at: request.submitted_at(),
            completed_at: Utc::now(),
        })
    }

    async fn drive(
        &self,
        sandbox: &Arc<dyn SandboxHandle>,
        request: &ExecutionRequest,
        cancel: &mut CancelSignal,
        deadline: Instant,
        stdout: &OutputSink,
        stderr: &OutputSink,
    ) -> anyhow::Result<Verdict> {
        let profile = request.profile();
        let grace = self.config.kill_grace;

        sandbox
            .write_file(&profile.source_file, request.source_code().as_bytes())
            .await?;

        if let Some(compile_cmd) = profile.compile_argv() {
            let share = request.timeout() * self.config.compile_share_percent / 100;
            let compile_budget = share.min(deadline.saturating_duration_since(Instant::now()));
            if compile_budget.is_zero() {
                return Ok(Verdict::new(ExecutionStatus::TimedOut));
            }
            self.mark(request, ExecutionStatus::Compiling).await;
            let diagnostics = OutputSink::new(self.config.output_limit_bytes);
            let spec = ExecSpec {
                command: compile_cmd,
                time_limit: compile_budget,
                memory_limit_mb: request.memory_limit_mb(),
            };
            let io = ExecIo {
                stdin: None,
                stdout: diagnostics.clone(),
                stderr: diagnostics.clone(),
            };

            let verdict = match supervise(Arc::clone(sandbox), spec, io, grace, cancel).await {
                StepEnd::Finished(outcome) if outcome.exit == ProcessExit::Exited(0) => None,
                StepEnd::Finished(outcome) => {
                    Some(Verdict::from_exit(outcome.exit, outcome.memory_kb))
                }
                StepEnd::DeadlineExceeded => Some(Verdict::new(ExecutionStatus::TimedOut)),
                StepEnd::Cancelled => Some(Verdict::new(ExecutionStatus::Cancelled)),
                StepEnd::Failed(e) => return Err(e.context("compile step failed")),
            };
            if let Some(mut verdict) = verdict {
                debug!("Compilation for {} ended with {}", request.id(), verdict.status);
                if diagnostics.is_empty() {
                    diagnostics.push(compile_failure_message(verdict.status).as_bytes());
                }
                verdict.diagnostics = Some(diagnostics);
                return Ok(verdict);
            }
        }

        let remaining = deadline.saturating_duration_since(Instant::now());
        if remaining.is_zero() {
            return Ok(Verdict::new(ExecutionStatus::TimedOut));
        }

        self.mark(request, ExecutionStatus::Running).await;
        let spec = ExecSpec {
            command: profile.run_argv(),
            time_limit: remaining,
            memory_limit_mb: request.memory_limit_mb(),
        };
        let io = ExecIo {
            stdin: request.stdin().map(|s| s.as_bytes().to_vec()),
            stdout: stdout.clone(),
            stderr: stderr.clone(),
        };

        match supervise(Arc::clone(sandbox), spec, io, grace, cancel).await {
            StepEnd::Finished(outcome) => {
                Ok(Verdict::from_exit(outcome.exit, outcome.memory_kb))
            }
            StepEnd::DeadlineExceeded => Ok(Verdict::new(ExecutionStatus::TimedOut)),
            StepEnd::Cancelled => Ok(Verdict::new(ExecutionStatus::Cancelled)),
            StepEnd::Failed(e) => Err(e.context("run step failed")),
        }
    }

    async fn mark(&self, request: &ExecutionRequest, status: ExecutionStatus) {
        if let Err(e) = self.store.mark(request.id(), status).await {
            warn!("Failed to record {} for {}: {}", status, request.id(), e);
        }
    }
}

/// Stand-in diagnostics when a failed compiler printed nothing
fn compile_failure_message(status: ExecutionStatus) -> &'static str {
    match status {
        ExecutionStatus::TimedOut => "Compilation timed out",
        ExecutionStatus::MemoryExceeded => "Compilation exceeded the memory limit",
        ExecutionStatus::Cancelled => "Compilation cancelled",
        _ => "Compilation failed",
    }
}
