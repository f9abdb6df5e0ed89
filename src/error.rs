//! Engine error taxonomy
//!
//! Only validation, backpressure and infrastructure failures are errors.
//! A program that fails, times out or runs out of memory is reported through
//! a terminal `ExecutionResult`, never through `EngineError`.

use uuid::Uuid;

#[derive(Debug, thiserror::Error)]
pub enum EngineError {
    #[error("unsupported language: {0}")]
    UnsupportedLanguage(String),

    #[error("{what} too large: {size} bytes (limit {limit})")]
    PayloadTooLarge {
        what: &'static str,
        size: usize,
        limit: usize,
    },

    #[error("invalid request: {0}")]
    InvalidRequest(String),

    #[error("invalid configuration: {0}")]
    InvalidConfig(String),

    #[error("execution queue is full ({depth} waiting)")]
    CapacityExceeded { depth: usize },

    #[error("engine is degraded, not accepting new work")]
    ServiceDegraded,

    #[error("execution not found: {0}")]
    NotFound(Uuid),

    #[error("timed out waiting for execution {0}")]
    WaitTimeout(Uuid),

    #[error("terminal result already written for execution {0}")]
    DuplicateResult(Uuid),

    #[error("sandbox backend error: {0}")]
    Backend(String),

    #[error("result store error: {0}")]
    Store(String),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

impl EngineError {
    /// Transient load-related errors; the caller may retry later.
    pub fn is_retryable(&self) -> bool {
        matches!(
            self,
            EngineError::CapacityExceeded { .. }
                | EngineError::ServiceDegraded
                | EngineError::WaitTimeout(_)
        )
    }

    /// Client-fixable errors raised before admission.
    pub fn is_validation(&self) -> bool {
        matches!(
            self,
            EngineError::UnsupportedLanguage(_)
                | EngineError::PayloadTooLarge { .. }
                | EngineError::InvalidRequest(_)
                | EngineError::InvalidConfig(_)
        )
    }

    /// Stable snake_case code, used in queue replies.
    pub fn code(&self) -> &'static str {
        match self {
            EngineError::UnsupportedLanguage(_) => "unsupported_language",
            EngineError::PayloadTooLarge { .. } => "payload_too_large",
            EngineError::InvalidRequest(_) => "invalid_request",
            EngineError::InvalidConfig(_) => "invalid_config",
            EngineError::CapacityExceeded { .. } => "capacity_exceeded",
            EngineError::ServiceDegraded => "service_degraded",
            EngineError::NotFound(_) => "not_found",
            EngineError::WaitTimeout(_) => "wait_timeout",
            EngineError::DuplicateResult(_) => "duplicate_result",
            EngineError::Backend(_) => "internal_error",
            EngineError::Store(_) => "internal_error",
            EngineError::Io(_) => "internal_error",
        }
    }
}

impl From<redis::RedisError> for EngineError {
    fn from(err: redis::RedisError) -> Self {
        EngineError::Store(err.to_string())
    }
}

impl From<serde_json::Error> for EngineError {
    fn from(err: serde_json::Error) -> Self {
        EngineError::Store(format!("serialization: {}", err))
    }
}

pub type Result<T> = std::result::Result<T, EngineError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_error_categories() {
        assert!(EngineError::CapacityExceeded { depth: 3 }.is_retryable());
        assert!(EngineError::ServiceDegraded.is_retryable());
        assert!(!EngineError::UnsupportedLanguage("cobol".into()).is_retryable());

        assert!(EngineError::UnsupportedLanguage("cobol".into()).is_validation());
        assert!(EngineError::PayloadTooLarge {
            what: "source code",
            size: 10,
            limit: 5
        }
        .is_validation());
        assert!(!EngineError::Backend("isolate missing".into()).is_validation());
    }

    #[test]
    fn test_error_codes() {
        assert_eq!(EngineError::ServiceDegraded.code(), "service_degraded");
        assert_eq!(
            EngineError::Backend("boom".into()).code(),
            "internal_error"
        );
        assert_eq!(
            EngineError::NotFound(Uuid::nil()).to_string(),
            "execution not found: 00000000-0000-0000-0000-000000000000"
        );
    }
}
