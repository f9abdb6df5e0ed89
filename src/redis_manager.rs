//! Redis Manager - Centralized Redis connection and operations
//!
//! This module handles all Redis-related operations including:
//! - Worker ID allocation and lease management
//! - Job queue operations (BLPOP)
//! - Job replies and health reports
//! - The Redis-backed result store
//! - Cancel fan-out between workers sharing the queue

use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use async_trait::async_trait;
use futures_util::StreamExt;
use redis::aio::{ConnectionManager, MultiplexedConnection};
use redis::AsyncCommands;
use serde::Serialize;
use tokio::task::JoinHandle;
use tracing::{error, info, warn};
use uuid::Uuid;

use crate::core::{ExecutionResult, ExecutionStatus};
use crate::engine::{CancelRelay, Engine};
use crate::error::EngineError;
use crate::health::HealthReport;
use crate::jobs::EngineJob;
use crate::sandbox::config::MAX_WORKERS;
use crate::store::{Lookup, ResultStore};

/// Redis key constants
pub mod keys {
    /// Worker lease key prefix for distributed worker ID allocation
    pub const WORKER_LEASE_PREFIX: &str = "exec:worker:lease:";

    /// Engine job queue key
    pub const JOB_QUEUE: &str = "exec:queue";

    /// Terminal result key prefix (for polling)
    pub const RESULT_PREFIX: &str = "exec:result:";

    /// Pending status key prefix
    pub const STATUS_PREFIX: &str = "exec:status:";

    /// Result channel (for pub/sub)
    pub const RESULT_CHANNEL: &str = "exec:results";

    /// Health report key prefix, one per worker
    pub const HEALTH_PREFIX: &str = "exec:health:";

    /// Cancel channel, every worker subscribes
    pub const CANCEL_CHANNEL: &str = "exec:cancel";
}

/// Configuration constants
const WORKER_LEASE_TTL_SECS: u64 = 120;
const REPLY_EXPIRY_SECS: i64 = 300; // 5 minutes

/// Centralized Redis manager for the worker process
pub struct RedisManager {
    worker_id: u32,
    client: redis::Client,
    /// Dedicated to BLPOP, which blocks the connection
    queue_conn: MultiplexedConnection,
    lease_handle: JoinHandle<()>,
}

impl RedisManager {
    /// Create a new RedisManager with the given Redis URL.
    ///
    /// This will:
    /// 1. Connect to Redis
    /// 2. Allocate a unique worker ID (0 to MAX_WORKERS-1)
    /// 3. Start a background task to keep the worker lease alive
    async fn with_url(redis_url: &str) -> Result<Self> {
        let client = redis::Client::open(redis_url).context("Failed to create Redis client")?;

        let queue_conn = get_connection_with_retry(&client).await?;
        info!("Connected to Redis at {}", redis_url);

        let worker_id = allocate_worker_id(&client).await?;
        info!(
            "Allocated worker_id={} (lease {}s)",
            worker_id, WORKER_LEASE_TTL_SECS
        );

        let lease_handle = spawn_lease_heartbeat(client.clone(), worker_id);

        Ok(Self {
            worker_id,
            client,
            queue_conn,
            lease_handle,
        })
    }

    /// Create a new RedisManager using the REDIS_URL environment variable.
    /// Defaults to "redis://localhost:6379" if not set.
    pub async fn from_env() -> Result<Self> {
        let url = std::env::var("REDIS_URL").unwrap_or_else(|_| "redis://localhost:6379".into());
        Self::with_url(&url).await
    }

    /// Get the allocated worker ID
    pub fn worker_id(&self) -> u32 {
        self.worker_id
    }

    pub fn client(&self) -> &redis::Client {
        &self.client
    }

    /// Cloneable handle for pushing replies from job tasks
    pub async fn replier(&self) -> Result<Replier> {
        Ok(Replier {
            conn: ConnectionManager::new(self.client.clone())
                .await
                .context("Failed to open reply connection")?,
        })
    }

    /// Block and wait for the next job from the queue.
    ///
    /// This uses BLPOP to efficiently wait for jobs without polling.
    /// Automatically reconnects on connection failure.
    pub async fn pop_job(&mut self) -> Result<EngineJob> {
        loop {
            let result: Option<(String, String)> =
                match self.queue_conn.blpop(keys::JOB_QUEUE, 0.0).await {
                    Ok(res) => res,
                    Err(e) => {
                        warn!("Redis BLPOP failed: {}. Reconnecting...", e);
                        self.queue_conn = get_connection_with_retry(&self.client).await?;
                        continue;
                    }
                };

            if let Some((_, job_data)) = result {
                match serde_json::from_str::<EngineJob>(&job_data) {
                    Ok(job) => return Ok(job),
                    Err(e) => {
                        warn!("Failed to parse job data: {}. Data: {}", e, job_data);
                        continue;
                    }
                }
            }
        }
    }
}

impl Drop for RedisManager {
    fn drop(&mut self) {
        self.lease_handle.abort();
    }
}

/// Pushes job replies and health reports
#[derive(Clone)]
pub struct Replier {
    conn: ConnectionManager,
}

impl Replier {
    /// RPUSH a reply so the client's BLPOP can pick it up
    pub async fn push<T: Serialize>(&self, key: &str, reply: &T) -> Result<()> {
        let json = serde_json::to_string(reply)?;
        let mut conn = self.conn.clone();
        conn.rpush::<_, _, ()>(key, &json)
            .await
            .with_context(|| format!("Failed to push reply to {}", key))?;

        // Set expiry for the key so it doesn't linger forever if client disconnects
        let _ = conn.expire::<_, ()>(key, REPLY_EXPIRY_SECS).await;
        Ok(())
    }

    /// Store the latest health report for this worker
    pub async fn write_health(
        &self,
        worker_id: u32,
        report: &HealthReport,
        ttl: Duration,
    ) -> Result<()> {
        let json = serde_json::to_string(report)?;
        let key = format!("{}{}", keys::HEALTH_PREFIX, worker_id);
        let mut conn = self.conn.clone();
        conn.set_ex::<_, _, ()>(&key, &json, ttl.as_secs().max(1))
            .await
            .context("Failed to write health report")?;
        Ok(())
    }
}

/// Result store shared by every worker process through Redis.
///
/// Terminal results are written with `SET NX EX`, so Redis itself enforces
/// write-once and TTL eviction.
#[derive(Clone)]
pub struct RedisResultStore {
    conn: ConnectionManager,
    ttl_secs: u64,
}

impl RedisResultStore {
    pub async fn connect(client: &redis::Client, ttl: Duration) -> Result<Self> {
        let conn = ConnectionManager::new(client.clone())
            .await
            .context("Failed to open result store connection")?;
        Ok(Self {
            conn,
            ttl_secs: ttl.as_secs().max(1),
        })
    }
}

fn result_key(execution_id: Uuid) -> String {
    format!("{}{}", keys::RESULT_PREFIX, execution_id)
}

fn status_key(execution_id: Uuid) -> String {
    format!("{}{}", keys::STATUS_PREFIX, execution_id)
}

#[async_trait]
impl ResultStore for RedisResultStore {
    async fn mark(&self, execution_id: Uuid, status: ExecutionStatus) -> crate::Result<()> {
        let json = serde_json::to_string(&status)?;
        let mut conn = self.conn.clone();
        conn.set_ex::<_, _, ()>(status_key(execution_id), json, self.ttl_secs)
            .await?;
        Ok(())
    }

    async fn complete(&self, result: ExecutionResult) -> crate::Result<()> {
        let execution_id = result.execution_id;
        let json = serde_json::to_string(&result)?;
        let mut conn = self.conn.clone();

        let stored: Option<String> = redis::cmd("SET")
            .arg(result_key(execution_id))
            .arg(&json)
            .arg("NX")
            .arg("EX")
            .arg(self.ttl_secs)
            .query_async(&mut conn)
            .await?;
        if stored.is_none() {
            error!(
                "Second terminal write for execution {} rejected (attempted {})",
                execution_id, result.status
            );
            return Err(EngineError::DuplicateResult(execution_id));
        }

        let _ = conn.del::<_, ()>(status_key(execution_id)).await;
        // Publish to channel (ignore errors as there may be no subscribers)
        let _ = conn.publish::<_, _, ()>(keys::RESULT_CHANNEL, &json).await;
        Ok(())
    }

    async fn get(&self, execution_id: Uuid) -> crate::Result<Lookup> {
        let mut conn = self.conn.clone();
        let stored: Option<String> = conn.get(result_key(execution_id)).await?;
        if let Some(json) = stored {
            return Ok(Lookup::Finished(serde_json::from_str(&json)?));
        }

        let status: Option<String> = conn.get(status_key(execution_id)).await?;
        match status {
            Some(json) => Ok(Lookup::Pending {
                execution_id,
                status: serde_json::from_str(&json)?,
            }),
            None => Ok(Lookup::NotFound),
        }
    }

    async fn discard(&self, execution_id: Uuid) -> crate::Result<()> {
        let mut conn = self.conn.clone();
        conn.del::<_, ()>(status_key(execution_id)).await?;
        Ok(())
    }

    /// Keys carry their own expiry
    async fn purge_expired(&self) -> crate::Result<usize> {
        Ok(0)
    }
}

/// Publishes cancels for requests owned by another worker
#[derive(Clone)]
pub struct RedisCancelRelay {
    conn: ConnectionManager,
}

impl RedisCancelRelay {
    pub async fn connect(client: &redis::Client) -> Result<Self> {
        let conn = ConnectionManager::new(client.clone())
            .await
            .context("Failed to open cancel relay connection")?;
        Ok(Self { conn })
    }
}

#[async_trait]
impl CancelRelay for RedisCancelRelay {
    async fn forward(&self, execution_id: Uuid) -> crate::Result<()> {
        let mut conn = self.conn.clone();
        let receivers: usize = conn
            .publish(keys::CANCEL_CHANNEL, execution_id.to_string())
            .await?;
        if receivers == 0 {
            warn!("No worker is listening for cancel of {}", execution_id);
        }
        Ok(())
    }
}

/// Apply cancels published by other workers to the requests this one owns.
///
/// Resubscribes after connection loss.
pub fn spawn_cancel_listener(client: redis::Client, engine: Arc<Engine>) -> JoinHandle<()> {
    tokio::spawn(async move {
        loop {
            if let Err(e) = listen_for_cancels(&client, &engine).await {
                warn!("Cancel listener lost its subscription: {:#}. Retrying in 3 seconds...", e);
            }
            tokio::time::sleep(Duration::from_secs(3)).await;
        }
    })
}

async fn listen_for_cancels(client: &redis::Client, engine: &Engine) -> Result<()> {
    let mut pubsub = client
        .get_async_pubsub()
        .await
        .context("Failed to open pub/sub connection")?;
    pubsub.subscribe(keys::CANCEL_CHANNEL).await?;
    info!("Listening for cancels on {}", keys::CANCEL_CHANNEL);

    let mut messages = pubsub.on_message();
    while let Some(message) = messages.next().await {
        let payload: String = match message.get_payload() {
            Ok(payload) => payload,
            Err(e) => {
                warn!("Unreadable cancel message: {}", e);
                continue;
            }
        };
        let Ok(execution_id) = payload.parse::<Uuid>() else {
            warn!("Ignoring cancel for malformed id {:?}", payload);
            continue;
        };
        match engine.cancel_local(execution_id).await {
            Ok(Some(outcome)) => info!("Relayed cancel of {}: {:?}", execution_id, outcome),
            Ok(None) => {}
            Err(e) => warn!("Relayed cancel of {} failed: {}", execution_id, e),
        }
    }
    anyhow::bail!("pub/sub stream ended")
}

/// Get a Redis connection with retry logic
async fn get_connection_with_retry(client: &redis::Client) -> Result<MultiplexedConnection> {
    loop {
        match client.get_multiplexed_async_connection().await {
            Ok(conn) => return Ok(conn),
            Err(e) => {
                warn!(
                    "Failed to connect to Redis: {}. Retrying in 3 seconds...",
                    e
                );
                tokio::time::sleep(Duration::from_secs(3)).await;
            }
        }
    }
}

/// Allocate a unique worker ID using Redis SET NX with expiration
async fn allocate_worker_id(client: &redis::Client) -> Result<u32> {
    loop {
        let mut conn = get_connection_with_retry(client).await?;

        for worker_id in 0..MAX_WORKERS {
            let key = format!("{}{}", keys::WORKER_LEASE_PREFIX, worker_id);
            let claimed: Option<String> = redis::cmd("SET")
                .arg(&key)
                .arg("claimed")
                .arg("NX")
                .arg("EX")
                .arg(WORKER_LEASE_TTL_SECS as usize)
                .query_async(&mut conn)
                .await?;

            if claimed.is_some() {
                return Ok(worker_id);
            }
        }

        warn!(
            "No free worker_id (0-{}). Retrying in 1 second...",
            MAX_WORKERS - 1
        );
        tokio::time::sleep(Duration::from_secs(1)).await;
    }
}

/// Spawn a background task to keep the worker lease alive
fn spawn_lease_heartbeat(client: redis::Client, worker_id: u32) -> JoinHandle<()> {
    tokio::spawn(async move {
        let interval = Duration::from_secs(WORKER_LEASE_TTL_SECS / 2);

        loop {
            tokio::time::sleep(interval).await;

            match get_connection_with_retry(&client).await {
                Ok(mut conn) => {
                    let key = format!("{}{}", keys::WORKER_LEASE_PREFIX, worker_id);
                    if let Err(e) = redis::cmd("EXPIRE")
                        .arg(&key)
                        .arg(WORKER_LEASE_TTL_SECS as usize)
                        .query_async::<()>(&mut conn)
                        .await
                    {
                        warn!("Failed to refresh worker lease {}: {}", worker_id, e);
                    }
                }
                Err(e) => {
                    warn!(
                        "Failed to refresh worker lease {} (connection): {}",
                        worker_id, e
                    );
                }
            }
        }
    })
}
