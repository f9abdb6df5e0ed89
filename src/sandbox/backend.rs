//! Sandbox backend interface
//!
//! A backend creates isolation units; each `SandboxHandle` belongs to exactly
//! one execution and is destroyed when that execution reaches a terminal
//! state. Handles are never reused.

use std::time::Duration;

use anyhow::Result;
use async_trait::async_trait;
use uuid::Uuid;

use super::output::OutputSink;

/// Parameters for creating one isolation unit
#[derive(Debug, Clone)]
pub struct SandboxSpec {
    pub execution_id: Uuid,
    /// Toolchain image reference from the language profile
    pub image_ref: String,
    pub memory_limit_mb: u64,
    pub allow_network: bool,
}

/// One command to run inside a sandbox
#[derive(Debug, Clone)]
pub struct ExecSpec {
    pub command: Vec<String>,
    /// Wall-clock limit the backend should enforce on its own
    pub time_limit: Duration,
    pub memory_limit_mb: u64,
}

/// Stream wiring for one command
#[derive(Debug, Clone)]
pub struct ExecIo {
    pub stdin: Option<Vec<u8>>,
    pub stdout: OutputSink,
    pub stderr: OutputSink,
}

/// How a sandboxed process ended
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ProcessExit {
    /// Exited normally with the given code
    Exited(i32),
    /// Killed by a signal
    Signaled(i32),
    /// Backend-enforced time limit hit
    TimedOut,
    /// Memory ceiling breached
    MemoryExceeded,
}

/// Raw outcome of one command (no status interpretation)
#[derive(Debug, Clone)]
pub struct ExecOutcome {
    pub exit: ProcessExit,
    pub time_ms: u64,
    pub memory_kb: Option<u64>,
}

#[async_trait]
pub trait SandboxBackend: Send + Sync {
    /// Human-readable backend name (e.g. "isolate")
    fn name(&self) -> &str;

    /// Cheap check that the isolation primitives work on this host
    async fn check_available(&self) -> Result<()>;

    /// Allocate a fresh isolation unit with an empty scratch directory
    async fn create(&self, spec: &SandboxSpec) -> Result<Box<dyn SandboxHandle>>;
}

#[async_trait]
pub trait SandboxHandle: Send + Sync {
    fn id(&self) -> &str;

    /// Write a file into the scratch directory
    async fn write_file(&self, name: &str, content: &[u8]) -> Result<()>;

    /// Run a command to completion, streaming output into `io` as it arrives
    async fn exec(&self, spec: &ExecSpec, io: ExecIo) -> Result<ExecOutcome>;

    /// Forcibly terminate whatever is running in the sandbox
    async fn kill(&self) -> Result<()>;

    /// Release the isolation unit. Idempotent.
    async fn destroy(&self) -> Result<()>;
}
