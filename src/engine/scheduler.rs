//! Execution scheduler / worker pool
//!
//! `W` worker slots (a semaphore) fed by one bounded FIFO queue. A single
//! dispatcher task takes a slot, then pops the queue front and hands the
//! request to a worker task. Submissions beyond `Q_max` queued requests are
//! rejected immediately.

use std::collections::{HashMap, VecDeque};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, RwLock};

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use tokio::sync::{oneshot, Notify, OwnedSemaphorePermit, Semaphore};
use tokio::task::JoinHandle;
use tracing::{debug, error, info, warn};
use uuid::Uuid;

use crate::config::EngineConfig;
use crate::core::{ExecutionRequest, ExecutionResult, ExecutionStatus, Submission};
use crate::error::{EngineError, Result};
use crate::health::HealthState;
use crate::runner::{CancelHandle, CancelSignal, SandboxRunner};
use crate::store::{Lookup, ResultStore};

/// Whether a submission is subject to the degraded gate
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Admission {
    Normal,
    /// Health self-tests; admitted even while degraded
    SelfTest,
}

/// Acknowledgement of a cancel request
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CancelOutcome {
    /// Removed from the queue before it ever ran
    Dequeued,
    /// Kill requested; the runner records `Cancelled`
    Signalled,
    /// Already terminal, nothing to do
    AlreadyFinished,
    /// Pending but not owned here; handed to the relay for its owner
    Forwarded,
}

/// Carries cancels to the engine instance that owns a request, when several
/// instances share one result store
#[async_trait]
pub trait CancelRelay: Send + Sync {
    async fn forward(&self, execution_id: Uuid) -> Result<()>;
}

enum Rejection {
    Full(usize),
    ShutDown,
}

struct QueuedJob {
    request: ExecutionRequest,
    completion: Option<oneshot::Sender<ExecutionResult>>,
}

struct Shared {
    config: Arc<EngineConfig>,
    runner: Arc<SandboxRunner>,
    store: Arc<dyn ResultStore>,
    health: Arc<HealthState>,
    queue: Mutex<VecDeque<QueuedJob>>,
    /// Cancel handles of dispatched requests
    active: Mutex<HashMap<Uuid, CancelHandle>>,
    queued_signal: Notify,
    slots: Arc<Semaphore>,
    running: AtomicUsize,
    relay: RwLock<Option<Arc<dyn CancelRelay>>>,
}

pub struct Scheduler {
    shared: Arc<Shared>,
    dispatcher: Mutex<Option<JoinHandle<()>>>,
}

impl Scheduler {
    /// Create the scheduler and start its dispatcher task
    pub fn start(
        config: Arc<EngineConfig>,
        runner: Arc<SandboxRunner>,
        store: Arc<dyn ResultStore>,
        health: Arc<HealthState>,
    ) -> Self {
        let shared = Arc::new(Shared {
            slots: Arc::new(Semaphore::new(config.workers)),
            queue: Mutex::new(VecDeque::with_capacity(config.queue_depth)),
            active: Mutex::new(HashMap::new()),
            queued_signal: Notify::new(),
            running: AtomicUsize::new(0),
            relay: RwLock::new(None),
            config,
            runner,
            store,
            health,
        });
        info!(
            "Scheduler started with {} worker slots, queue depth {}",
            shared.config.workers, shared.config.queue_depth
        );
        let dispatcher = tokio::spawn(dispatch(Arc::clone(&shared)));
        Self {
            shared,
            dispatcher: Mutex::new(Some(dispatcher)),
        }
    }

    pub fn set_cancel_relay(&self, relay: Arc<dyn CancelRelay>) {
        match self.shared.relay.write() {
            Ok(mut guard) => *guard = Some(relay),
            Err(poisoned) => *poisoned.into_inner() = Some(relay),
        }
    }

    fn relay(&self) -> Option<Arc<dyn CancelRelay>> {
        match self.shared.relay.read() {
            Ok(guard) => guard.clone(),
            Err(poisoned) => poisoned.into_inner().clone(),
        }
    }

    /// Queue a request; returns as soon as it is admitted
    pub async fn submit(
        &self,
        request: ExecutionRequest,
        admission: Admission,
    ) -> Result<Submission> {
        self.admit(request, None, admission).await
    }

    /// Queue a request and get a channel that yields its terminal result
    pub async fn submit_and_wait(
        &self,
        request: ExecutionRequest,
        admission: Admission,
    ) -> Result<(Submission, oneshot::Receiver<ExecutionResult>)> {
        let (tx, rx) = oneshot::channel();
        let submission = self.admit(request, Some(tx), admission).await?;
        Ok((submission, rx))
    }

    async fn admit(
        &self,
        request: ExecutionRequest,
        completion: Option<oneshot::Sender<ExecutionResult>>,
        admission: Admission,
    ) -> Result<Submission> {
        let shared = &self.shared;
        let execution_id = request.id();

        if shared.slots.is_closed() {
            return Err(EngineError::Backend("scheduler is shut down".into()));
        }
        if admission == Admission::Normal && shared.health.is_degraded() {
            return Err(EngineError::ServiceDegraded);
        }
        // Reject before touching the store when the queue is visibly full
        let depth = self.queue_depth();
        if depth >= shared.config.queue_depth {
            debug!("Rejecting {}: queue full ({})", execution_id, depth);
            return Err(EngineError::CapacityExceeded { depth });
        }

        shared.store.mark(execution_id, ExecutionStatus::Queued).await?;

        // Shutdown closes the slots before draining under this lock, so a
        // request pushed here is either dispatched or drained.
        let rejection = {
            let mut queue = lock(&shared.queue);
            if shared.slots.is_closed() {
                Some(Rejection::ShutDown)
            } else if queue.len() >= shared.config.queue_depth {
                Some(Rejection::Full(queue.len()))
            } else {
                queue.push_back(QueuedJob {
                    request,
                    completion,
                });
                None
            }
        };
        if let Some(rejection) = rejection {
            if let Err(e) = shared.store.discard(execution_id).await {
                warn!("Failed to discard rejected {}: {}", execution_id, e);
            }
            return Err(match rejection {
                Rejection::Full(depth) => EngineError::CapacityExceeded { depth },
                Rejection::ShutDown => EngineError::Backend("scheduler is shut down".into()),
            });
        }

        shared.queued_signal.notify_one();
        debug!("Queued {}", execution_id);
        Ok(Submission {
            execution_id,
            status: ExecutionStatus::Queued,
        })
    }

    /// Remove a queued request, or signal a running one to stop. Requests
    /// pending elsewhere go through the cancel relay when one is set.
    pub async fn cancel(&self, execution_id: Uuid) -> Result<CancelOutcome> {
        if let Some(outcome) = self.cancel_local(execution_id).await? {
            return Ok(outcome);
        }

        match self.shared.store.get(execution_id).await? {
            Lookup::Finished(_) => Ok(CancelOutcome::AlreadyFinished),
            Lookup::Pending { .. } => match self.relay() {
                Some(relay) => {
                    relay.forward(execution_id).await?;
                    info!("Forwarded cancel of {} to its owner", execution_id);
                    Ok(CancelOutcome::Forwarded)
                }
                None => Err(EngineError::NotFound(execution_id)),
            },
            Lookup::NotFound => Err(EngineError::NotFound(execution_id)),
        }
    }

    /// Cancel only if the request is queued or running on this scheduler
    pub async fn cancel_local(&self, execution_id: Uuid) -> Result<Option<CancelOutcome>> {
        let shared = &self.shared;
        let dequeued = {
            let mut queue = lock(&shared.queue);
            match queue.iter().position(|job| job.request.id() == execution_id) {
                Some(pos) => queue.remove(pos),
                None => {
                    if let Some(handle) = lock(&shared.active).get(&execution_id) {
                        info!("Cancelling running execution {}", execution_id);
                        handle.cancel();
                        return Ok(Some(CancelOutcome::Signalled));
                    }
                    None
                }
            }
        };

        let Some(job) = dequeued else {
            return Ok(None);
        };
        info!("Cancelled queued execution {}", execution_id);
        let result = ExecutionResult::empty(&job.request, ExecutionStatus::Cancelled);
        shared.store.complete(result.clone()).await?;
        if let Some(tx) = job.completion {
            let _ = tx.send(result);
        }
        Ok(Some(CancelOutcome::Dequeued))
    }

    pub fn queue_depth(&self) -> usize {
        lock(&self.shared.queue).len()
    }

    pub fn running_count(&self) -> usize {
        self.shared.running.load(Ordering::SeqCst)
    }

    /// Stop dispatching, kill running work and cancel everything queued
    pub async fn shutdown(&self) {
        let shared = &self.shared;
        shared.slots.close();
        if let Some(dispatcher) = lock(&self.dispatcher).take() {
            dispatcher.abort();
        }

        for handle in lock(&shared.active).values() {
            handle.cancel();
        }

        let drained: Vec<QueuedJob> = lock(&shared.queue).drain(..).collect();
        if !drained.is_empty() {
            warn!("Cancelling {} queued executions on shutdown", drained.len());
        }
        for job in drained {
            let result = ExecutionResult::empty(&job.request, ExecutionStatus::Cancelled);
            if let Err(e) = shared.store.complete(result.clone()).await {
                error!("Failed to record cancellation of {}: {}", job.request.id(), e);
            }
            if let Some(tx) = job.completion {
                let _ = tx.send(result);
            }
        }
    }
}

/// Take a slot, then the oldest queued request, and hand both to a worker
async fn dispatch(shared: Arc<Shared>) {
    loop {
        let permit = match Arc::clone(&shared.slots).acquire_owned().await {
            Ok(permit) => permit,
            Err(_) => {
                debug!("Worker slots closed, dispatcher exiting");
                return;
            }
        };

        let (job, cancel) = loop {
            let queued = shared.queued_signal.notified();
            if let Some(next) = shared.pop_front() {
                break next;
            }
            queued.await;
        };

        tokio::spawn(work(Arc::clone(&shared), job, cancel, permit));
    }
}

impl Shared {
    /// Pop the queue front and register it as active in one step, so a
    /// concurrent cancel always finds the request in one of the two places.
    fn pop_front(&self) -> Option<(QueuedJob, CancelSignal)> {
        let mut queue = lock(&self.queue);
        let job = queue.pop_front()?;
        let (handle, signal) = CancelSignal::pair();
        lock(&self.active).insert(job.request.id(), handle);
        Some((job, signal))
    }
}

async fn work(
    shared: Arc<Shared>,
    job: QueuedJob,
    cancel: CancelSignal,
    permit: OwnedSemaphorePermit,
) {
    let QueuedJob {
        request,
        completion,
    } = job;
    let execution_id = request.id();
    shared.running.fetch_add(1, Ordering::SeqCst);

    // Run in a child task so a panic inside the runner still ends in a result
    let runner = Arc::clone(&shared.runner);
    let child_request = request.clone();
    let execution = tokio::spawn(async move { runner.run(&child_request, cancel).await });

    let result = match execution.await {
        Ok(result) => result,
        Err(e) => {
            error!("Worker for {} aborted: {}", execution_id, e);
            let result =
                ExecutionResult::internal_error(&request, format!("worker failure: {}", e));
            if let Err(e) = shared.store.complete(result.clone()).await {
                error!("Failed to store result for {}: {}", execution_id, e);
            }
            result
        }
    };

    lock(&shared.active).remove(&execution_id);
    shared.running.fetch_sub(1, Ordering::SeqCst);
    drop(permit);

    if let Some(tx) = completion {
        let _ = tx.send(result);
    }
}

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    match mutex.lock() {
        Ok(guard) => guard,
        Err(poisoned) => poisoned.into_inner(),
    }
}
