//! Sandbox module - isolation backends
//!
//! This module provides the isolation boundary for untrusted programs.
//! It handles:
//! - Creating and destroying one isolation unit per execution
//! - Running commands with time and memory ceilings
//! - Capturing bounded stdout/stderr incrementally
//!
//! The sandbox module does NOT:
//! - Interpret outcomes into execution statuses (that's the runner's job)
//! - Know about languages or compilation
//! - Enforce the engine-level watchdog

pub mod backend;
pub mod config;
pub mod fake;
pub mod isolate_box;
pub mod meta;
pub mod output;

// Re-exports for convenience
pub use backend::{
    ExecIo, ExecOutcome, ExecSpec, ProcessExit, SandboxBackend, SandboxHandle, SandboxSpec,
};
pub use config::{BoxIdPool, IsolateSettings};
pub use fake::FakeBackend;
pub use isolate_box::{IsolateBackend, HOST_IMAGE};
pub use meta::{IsolateMeta, IsolateStatus};
pub use output::{CapturedOutput, OutputSink, TRUNCATION_MARKER};
