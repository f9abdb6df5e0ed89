//! Request validator and normalizer
//!
//! Turns an untrusted `RawExecutionRequest` into an `ExecutionRequest`:
//! resolves the language, enforces payload caps, clamps timeout and memory
//! into the configured bounds and assigns a server-generated execution id.
//! No I/O happens here.

use std::sync::Arc;

use chrono::Utc;
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::config::EngineConfig;
use crate::core::ExecutionRequest;
use crate::error::{EngineError, Result};
use crate::languages::LanguageRegistry;

/// Execution request as received from the calling layer
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct RawExecutionRequest {
    pub source_code: String,
    pub language: String,
    #[serde(default)]
    pub stdin: Option<String>,
    /// Requested timeout in seconds (profile default when absent)
    #[serde(default)]
    pub timeout_secs: Option<u64>,
    /// Requested memory ceiling (profile default when absent)
    #[serde(default)]
    pub memory_limit: Option<MemoryLimit>,
    #[serde(default)]
    pub submitter_id: Option<String>,
}

impl RawExecutionRequest {
    pub fn new(language: impl Into<String>, source_code: impl Into<String>) -> Self {
        Self {
            language: language.into(),
            source_code: source_code.into(),
            ..Self::default()
        }
    }

    pub fn with_stdin(mut self, stdin: impl Into<String>) -> Self {
        self.stdin = Some(stdin.into());
        self
    }

    pub fn with_timeout_secs(mut self, timeout_secs: u64) -> Self {
        self.timeout_secs = Some(timeout_secs);
        self
    }

    pub fn with_memory_limit(mut self, limit: MemoryLimit) -> Self {
        self.memory_limit = Some(limit);
        self
    }
}

/// Memory ceiling as an integer MB count or a free-form string ("512m", "1g")
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum MemoryLimit {
    Megabytes(u64),
    Text(String),
}

impl MemoryLimit {
    /// Normalize to whole megabytes, rounding partial megabytes up
    pub fn to_megabytes(&self) -> Result<u64> {
        match self {
            MemoryLimit::Megabytes(mb) => Ok(*mb),
            MemoryLimit::Text(text) => parse_memory_mb(text),
        }
    }
}

/// Bounds applied to every request
#[derive(Debug, Clone)]
pub struct RequestLimits {
    pub min_timeout_secs: u64,
    pub max_timeout_secs: u64,
    pub min_memory_mb: u64,
    pub max_memory_mb: u64,
    pub max_source_bytes: usize,
    pub max_stdin_bytes: usize,
}

impl From<&EngineConfig> for RequestLimits {
    fn from(config: &EngineConfig) -> Self {
        Self {
            min_timeout_secs: config.min_timeout_secs,
            max_timeout_secs: config.max_timeout_secs,
            min_memory_mb: config.min_memory_mb,
            max_memory_mb: config.max_memory_mb,
            max_source_bytes: config.max_source_bytes,
            max_stdin_bytes: config.max_stdin_bytes,
        }
    }
}

#[derive(Debug, Clone)]
pub struct RequestValidator {
    registry: Arc<LanguageRegistry>,
    limits: RequestLimits,
}

impl RequestValidator {
    pub fn new(registry: Arc<LanguageRegistry>, limits: RequestLimits) -> Self {
        Self { registry, limits }
    }

    pub fn registry(&self) -> &Arc<LanguageRegistry> {
        &self.registry
    }

    /// Validate and normalize a raw request, assigning a fresh execution id
    pub fn normalize(&self, raw: RawExecutionRequest) -> Result<ExecutionRequest> {
        let profile = self.registry.resolve(&raw.language)?;

        if raw.source_code.len() > self.limits.max_source_bytes {
            return Err(EngineError::PayloadTooLarge {
                what: "source code",
                size: raw.source_code.len(),
                limit: self.limits.max_source_bytes,
            });
        }
        if let Some(stdin) = &raw.stdin {
            if stdin.len() > self.limits.max_stdin_bytes {
                return Err(EngineError::PayloadTooLarge {
                    what: "stdin",
                    size: stdin.len(),
                    limit: self.limits.max_stdin_bytes,
                });
            }
        }

        let timeout_secs = raw
            .timeout_secs
            .unwrap_or(profile.default_timeout_secs)
            .clamp(self.limits.min_timeout_secs, self.limits.max_timeout_secs);

        let memory_mb = match &raw.memory_limit {
            Some(limit) => limit.to_megabytes()?,
            None => profile.default_memory_mb,
        }
        .clamp(self.limits.min_memory_mb, self.limits.max_memory_mb);

        Ok(ExecutionRequest::new(
            Uuid::new_v4(),
            raw.source_code,
            profile,
            raw.stdin,
            timeout_secs,
            memory_mb,
            raw.submitter_id,
            Utc::now(),
        ))
    }
}

/// Parse strings like "512", "512m", "512MB", "1g", "65536k" into megabytes
pub fn parse_memory_mb(text: &str) -> Result<u64> {
    let normalized = text.trim().to_lowercase();
    let split = normalized
        .find(|c: char| !c.is_ascii_digit())
        .unwrap_or(normalized.len());
    let (digits, unit) = normalized.split_at(split);

    let value: u64 = digits
        .parse()
        .map_err(|_| EngineError::InvalidRequest(format!("invalid memory limit {:?}", text)))?;

    let megabytes = match unit.trim() {
        "" | "m" | "mb" | "mib" => Some(value),
        "g" | "gb" | "gib" => value.checked_mul(1024),
        "k" | "kb" | "kib" => Some(value.div_ceil(1024)),
        "b" => Some(value.div_ceil(1024 * 1024)),
        _ => None,
    };

    megabytes.ok_or_else(|| EngineError::InvalidRequest(format!("invalid memory limit {:?}", text)))
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio_test::{assert_err, assert_ok};

    fn validator() -> RequestValidator {
        let registry = Arc::new(LanguageRegistry::builtin().unwrap());
        RequestValidator::new(registry, RequestLimits::from(&EngineConfig::default()))
    }

    #[test]
    fn test_parse_memory_mb() {
        assert_eq!(parse_memory_mb("512").unwrap(), 512);
        assert_eq!(parse_memory_mb("512m").unwrap(), 512);
        assert_eq!(parse_memory_mb(" 256MB ").unwrap(), 256);
        assert_eq!(parse_memory_mb("1g").unwrap(), 1024);
        assert_eq!(parse_memory_mb("2GiB").unwrap(), 2048);
        assert_eq!(parse_memory_mb("65536k").unwrap(), 64);
        assert_eq!(parse_memory_mb("1500k").unwrap(), 2);
        assert_eq!(parse_memory_mb("1048576b").unwrap(), 1);

        assert_err!(parse_memory_mb(""));
        assert_err!(parse_memory_mb("lots"));
        assert_err!(parse_memory_mb("12 parsecs"));
        assert_err!(parse_memory_mb("-5m"));
    }

    #[test]
    fn test_normalize_assigns_unique_ids() {
        let validator = validator();
        let a = assert_ok!(validator.normalize(RawExecutionRequest::new("python", "print(1)")));
        let b = assert_ok!(validator.normalize(RawExecutionRequest::new("python", "print(1)")));
        assert_ne!(a.id(), b.id());
        assert_eq!(a.language().as_str(), "python");
    }

    #[test]
    fn test_normalize_uses_profile_defaults() {
        let validator = validator();
        let request = validator
            .normalize(RawExecutionRequest::new("py", "print(1)"))
            .unwrap();
        let profile = validator.registry().resolve("python").unwrap();
        assert_eq!(request.timeout_secs(), profile.default_timeout_secs);
        assert_eq!(request.memory_limit_mb(), profile.default_memory_mb);
    }

    #[test]
    fn test_normalize_clamps_out_of_range_limits() {
        let validator = validator();
        let config = EngineConfig::default();

        let request = validator
            .normalize(
                RawExecutionRequest::new("python", "print(1)")
                    .with_timeout_secs(10_000)
                    .with_memory_limit(MemoryLimit::Text("64g".into())),
            )
            .unwrap();
        assert_eq!(request.timeout_secs(), config.max_timeout_secs);
        assert_eq!(request.memory_limit_mb(), config.max_memory_mb);

        let request = validator
            .normalize(
                RawExecutionRequest::new("python", "print(1)")
                    .with_timeout_secs(0)
                    .with_memory_limit(MemoryLimit::Megabytes(1)),
            )
            .unwrap();
        assert_eq!(request.timeout_secs(), config.min_timeout_secs);
        assert_eq!(request.memory_limit_mb(), config.min_memory_mb);
    }

    #[test]
    fn test_normalize_rejects_unsupported_language() {
        let err = validator()
            .normalize(RawExecutionRequest::new("cobol", "DISPLAY 'HI'."))
            .unwrap_err();
        assert!(matches!(err, EngineError::UnsupportedLanguage(_)));
    }

    #[test]
    fn test_normalize_rejects_large_payloads() {
        let validator = validator();
        let huge = "x".repeat(64 * 1024 + 1);
        let err = validator
            .normalize(RawExecutionRequest::new("python", huge))
            .unwrap_err();
        assert!(matches!(
            err,
            EngineError::PayloadTooLarge {
                what: "source code",
                ..
            }
        ));

        let exact = "x".repeat(64 * 1024);
        assert_ok!(validator.normalize(RawExecutionRequest::new("python", exact)));

        let big_stdin = "1\n".repeat(1024 * 1024);
        let err = validator
            .normalize(RawExecutionRequest::new("python", "input()").with_stdin(big_stdin))
            .unwrap_err();
        assert!(matches!(err, EngineError::PayloadTooLarge { what: "stdin", .. }));
    }

    #[test]
    fn test_raw_request_deserializes_both_memory_forms() {
        let raw: RawExecutionRequest = serde_json::from_str(
            r#"{"source_code":"print(1)","language":"python","memory_limit":"512m"}"#,
        )
        .unwrap();
        assert_eq!(raw.memory_limit, Some(MemoryLimit::Text("512m".into())));

        let raw: RawExecutionRequest = serde_json::from_str(
            r#"{"source_code":"print(1)","language":"python","memory_limit":128,"timeout_secs":3}"#,
        )
        .unwrap();
        assert_eq!(raw.memory_limit, Some(MemoryLimit::Megabytes(128)));
        assert_eq!(raw.timeout_secs, Some(3));
    }
}
