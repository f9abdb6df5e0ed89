use serde::{Deserialize, Serialize};
use tracing::{info, warn};
use uuid::Uuid;

use crate::core::{ExecutionResult, Submission};
use crate::engine::{CancelOutcome, Engine};
use crate::error::EngineError;
use crate::store::Lookup;
use crate::validator::RawExecutionRequest;

/// Worker job enum - represents different types of jobs the worker can process
#[derive(Debug, Serialize, Deserialize)]
#[serde(tag = "job_type")]
pub enum EngineJob {
    /// Queue a program and reply with its execution id
    #[serde(rename = "submit")]
    Submit(RunJob),
    /// Run a program and reply with the terminal result
    #[serde(rename = "execute")]
    Execute(RunJob),
    #[serde(rename = "cancel")]
    Cancel(ControlJob),
    #[serde(rename = "status")]
    Status(ControlJob),
}

#[derive(Debug, Serialize, Deserialize)]
pub struct RunJob {
    /// Redis list the reply is pushed to
    pub reply_key: String,
    #[serde(flatten)]
    pub request: RawExecutionRequest,
}

#[derive(Debug, Serialize, Deserialize)]
pub struct ControlJob {
    pub reply_key: String,
    pub execution_id: Uuid,
}

impl EngineJob {
    pub fn reply_key(&self) -> &str {
        match self {
            EngineJob::Submit(job) | EngineJob::Execute(job) => &job.reply_key,
            EngineJob::Cancel(job) | EngineJob::Status(job) => &job.reply_key,
        }
    }

    pub fn kind(&self) -> &'static str {
        match self {
            EngineJob::Submit(_) => "submit",
            EngineJob::Execute(_) => "execute",
            EngineJob::Cancel(_) => "cancel",
            EngineJob::Status(_) => "status",
        }
    }
}

/// Reply pushed to a job's `reply_key`
#[derive(Debug, Serialize)]
#[serde(tag = "reply", rename_all = "snake_case")]
pub enum JobReply {
    Submitted(Submission),
    Completed(ExecutionResult),
    Status(Lookup),
    Cancelled {
        execution_id: Uuid,
        outcome: CancelOutcome,
    },
    Error {
        code: String,
        message: String,
        retryable: bool,
    },
}

impl From<EngineError> for JobReply {
    fn from(err: EngineError) -> Self {
        JobReply::Error {
            code: err.code().to_string(),
            message: err.to_string(),
            retryable: err.is_retryable(),
        }
    }
}

/// Run one job against the engine and build its reply
pub async fn process_job(engine: &Engine, job: EngineJob) -> JobReply {
    let kind = job.kind();
    let reply = match job {
        EngineJob::Submit(job) => engine
            .submit(job.request)
            .await
            .map(JobReply::Submitted),
        EngineJob::Execute(job) => engine
            .execute_sync(job.request)
            .await
            .map(JobReply::Completed),
        EngineJob::Status(job) => engine
            .get_status(job.execution_id)
            .await
            .map(JobReply::Status),
        EngineJob::Cancel(job) => engine
            .cancel(job.execution_id)
            .await
            .map(|outcome| JobReply::Cancelled {
                execution_id: job.execution_id,
                outcome,
            }),
    };

    match reply {
        Ok(reply) => {
            info!("Processed {} job", kind);
            reply
        }
        Err(e) => {
            warn!("{} job rejected: {}", kind, e);
            e.into()
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::ExecutionStatus;
    use crate::sandbox::FakeBackend;
    use crate::store::MemoryResultStore;
    use crate::testing::{fast_config, registry};
    use std::sync::Arc;

    fn engine() -> Engine {
        let config = fast_config();
        let store = Arc::new(MemoryResultStore::new(config.result_ttl));
        Engine::new(config, registry(), Arc::new(FakeBackend::new()), store).unwrap()
    }

    #[test]
    fn test_parse_jobs() {
        let job: EngineJob = serde_json::from_str(
            r#"{"job_type":"execute","reply_key":"exec:reply:1","language":"python","source_code":"print(1)","timeout_secs":3}"#,
        )
        .unwrap();
        assert_eq!(job.reply_key(), "exec:reply:1");
        match job {
            EngineJob::Execute(run) => {
                assert_eq!(run.request.language, "python");
                assert_eq!(run.request.timeout_secs, Some(3));
            }
            other => panic!("unexpected job {:?}", other),
        }

        let job: EngineJob = serde_json::from_str(
            r#"{"job_type":"cancel","reply_key":"r","execution_id":"00000000-0000-0000-0000-000000000000"}"#,
        )
        .unwrap();
        assert_eq!(job.kind(), "cancel");

        let unknown = r#"{"job_type":"compile","reply_key":"r"}"#;
        assert!(serde_json::from_str::<EngineJob>(unknown).is_err());
    }

    #[tokio::test]
    async fn test_execute_job_replies_with_result() {
        let engine = engine();
        let job = EngineJob::Execute(RunJob {
            reply_key: "r".into(),
            request: RawExecutionRequest::new("python", "print(\"Hello, Fenix!\")"),
        });

        match process_job(&engine, job).await {
            JobReply::Completed(result) => {
                assert_eq!(result.status, ExecutionStatus::Succeeded);
                assert_eq!(result.stdout, "Hello, Fenix!\n");
            }
            other => panic!("unexpected reply {:?}", other),
        }
        engine.shutdown().await;
    }

    #[tokio::test]
    async fn test_error_reply_carries_code() {
        let engine = engine();
        let job = EngineJob::Submit(RunJob {
            reply_key: "r".into(),
            request: RawExecutionRequest::new("cobol", "DISPLAY 'HI'"),
        });

        let reply = process_job(&engine, job).await;
        let json = serde_json::to_value(&reply).unwrap();
        assert_eq!(json["reply"], "error");
        assert_eq!(json["code"], "unsupported_language");
        assert_eq!(json["retryable"], false);

        let status = process_job(
            &engine,
            EngineJob::Status(ControlJob {
                reply_key: "r".into(),
                execution_id: Uuid::new_v4(),
            }),
        )
        .await;
        let json = serde_json::to_value(&status).unwrap();
        assert_eq!(json["reply"], "status");
        assert_eq!(json["state"], "not_found");
        engine.shutdown().await;
    }
}
