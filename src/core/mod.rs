//! Core data model shared by every engine component

pub mod request;
pub mod result;
pub mod status;

pub use request::ExecutionRequest;
pub use result::{ExecutionResult, Submission};
pub use status::ExecutionStatus;
