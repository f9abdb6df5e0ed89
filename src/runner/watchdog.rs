//! Deadline and cancellation enforcement for one sandbox step
//!
//! The step runs in its own task. The watchdog only waits on that task's
//! join handle, a timer and the cancel signal, so a sandbox that never
//! returns cannot hold it up: after a kill and one grace period the task is
//! aborted and the worker slot is reclaimed.

use std::sync::Arc;
use std::time::Duration;

use tokio::sync::watch;
use tokio::time::{sleep, timeout};
use tracing::{debug, warn};

use crate::sandbox::{ExecIo, ExecOutcome, ExecSpec, SandboxHandle};

/// Sender half of a cancellation signal, held by the scheduler
#[derive(Debug)]
pub struct CancelHandle {
    tx: watch::Sender<bool>,
}

impl CancelHandle {
    pub fn cancel(&self) {
        self.tx.send_replace(true);
    }
}

/// Receiver half, handed to the runner
#[derive(Debug, Clone)]
pub struct CancelSignal {
    rx: watch::Receiver<bool>,
}

impl CancelSignal {
    pub fn pair() -> (CancelHandle, CancelSignal) {
        let (tx, rx) = watch::channel(false);
        (CancelHandle { tx }, CancelSignal { rx })
    }

    /// A signal that never fires
    pub fn never() -> Self {
        Self::pair().1
    }

    pub fn is_cancelled(&self) -> bool {
        *self.rx.borrow()
    }

    /// Resolves once cancellation is requested. Never resolves if the
    /// handle was dropped without cancelling.
    pub async fn cancelled(&mut self) {
        if self.rx.wait_for(|cancelled| *cancelled).await.is_err() {
            std::future::pending::<()>().await;
        }
    }
}

/// How a supervised step ended
#[derive(Debug)]
pub(crate) enum StepEnd {
    Finished(ExecOutcome),
    DeadlineExceeded,
    Cancelled,
    Failed(anyhow::Error),
}

/// Run `spec` in `sandbox`, enforcing `spec.time_limit + grace` as a hard
/// deadline independent of the backend's own limit.
pub(crate) async fn supervise(
    sandbox: Arc<dyn SandboxHandle>,
    spec: ExecSpec,
    io: ExecIo,
    grace: Duration,
    cancel: &mut CancelSignal,
) -> StepEnd {
    let hard_deadline = spec.time_limit + grace;
    let exec_sandbox = Arc::clone(&sandbox);
    let mut task = tokio::spawn(async move { exec_sandbox.exec(&spec, io).await });

    let reason = tokio::select! {
        joined = &mut task => {
            return match joined {
                Ok(Ok(outcome)) => StepEnd::Finished(outcome),
                Ok(Err(e)) => StepEnd::Failed(e),
                Err(e) => StepEnd::Failed(anyhow::anyhow!("sandbox step task failed: {}", e)),
            };
        }
        _ = sleep(hard_deadline) => {
            warn!(
                "Sandbox {} passed its deadline of {:?}, killing",
                sandbox.id(),
                hard_deadline
            );
            StepEnd::DeadlineExceeded
        }
        _ = cancel.cancelled() => {
            debug!("Cancellation requested for sandbox {}", sandbox.id());
            StepEnd::Cancelled
        }
    };

    match timeout(grace, sandbox.kill()).await {
        Ok(Ok(())) => {}
        Ok(Err(e)) => warn!("Failed to kill sandbox {}: {:#}", sandbox.id(), e),
        Err(_) => warn!("Kill of sandbox {} did not return within {:?}", sandbox.id(), grace),
    }

    if timeout(grace, &mut task).await.is_err() {
        warn!(
            "Sandbox {} unresponsive {:?} after kill, reclaiming slot",
            sandbox.id(),
            grace
        );
        task.abort();
    }

    reason
}
