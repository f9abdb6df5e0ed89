//! Fenix sandbox engine
//!
//! Runs untrusted programs in supported languages inside isolated sandboxes
//! with time, memory and output ceilings, behind a bounded worker pool.
//!
//! ```text
//! RawExecutionRequest -> RequestValidator -> Scheduler -> SandboxRunner -> ResultStore
//! ```

pub mod config;
pub mod core;
pub mod engine;
pub mod error;
pub mod health;
pub mod jobs;
pub mod languages;
pub mod redis_manager;
pub mod runner;
pub mod sandbox;
pub mod store;
pub mod validator;

#[cfg(test)]
mod testing;

pub use config::EngineConfig;
pub use core::{ExecutionRequest, ExecutionResult, ExecutionStatus, Submission};
pub use engine::{CancelOutcome, Engine};
pub use error::{EngineError, Result};
pub use health::{HealthMonitor, HealthReport, HealthStatus};
pub use languages::{LanguageProfile, LanguageRegistry};
pub use store::{Lookup, MemoryResultStore, ResultStore};
pub use validator::{MemoryLimit, RawExecutionRequest};
