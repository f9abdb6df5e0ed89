use std::path::Path;
use std::sync::Arc;

use anyhow::{Context, Result};
use tokio::task::JoinHandle;
use tokio::time::{interval, MissedTickBehavior};
use tracing::{error, info, warn};

use fenix_sandbox::config::EngineConfig;
use fenix_sandbox::engine::Engine;
use fenix_sandbox::health::HealthMonitor;
use fenix_sandbox::jobs::process_job;
use fenix_sandbox::languages::LanguageRegistry;
use fenix_sandbox::redis_manager::{
    spawn_cancel_listener, RedisCancelRelay, RedisManager, RedisResultStore, Replier,
};
use fenix_sandbox::sandbox::{IsolateBackend, IsolateSettings, SandboxBackend};

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::from_default_env()
                .add_directive("fenix_sandbox=info".parse()?),
        )
        .init();

    dotenvy::dotenv().ok();

    let config = EngineConfig::from_env()?;

    // Load language configurations
    let languages_path =
        std::env::var("LANGUAGES_CONFIG").unwrap_or_else(|_| "./files/languages.toml".into());
    let registry = if Path::new(&languages_path).exists() {
        let registry = LanguageRegistry::load(&languages_path)?;
        info!("Loaded language configurations from {}", languages_path);
        registry
    } else {
        warn!(
            "{} not found, using the built-in language profiles",
            languages_path
        );
        LanguageRegistry::builtin()?
    };

    info!("Starting Fenix sandbox worker...");

    let mut redis = RedisManager::from_env().await?;
    let worker_id = redis.worker_id();

    let settings = IsolateSettings::with_worker_id(worker_id);
    let backend = Arc::new(IsolateBackend::new(settings));
    backend
        .check_available()
        .await
        .context("isolate is not usable on this host")?;
    info!("Confirmed isolate sandbox is available");

    let store = Arc::new(RedisResultStore::connect(redis.client(), config.result_ttl).await?);
    let engine = Arc::new(Engine::new(config, Arc::new(registry), backend, store)?);
    let replier = redis.replier().await?;

    // Cancel jobs may land on any worker; fan them out to the owner
    engine.set_cancel_relay(Arc::new(RedisCancelRelay::connect(redis.client()).await?));
    let cancel_listener = spawn_cancel_listener(redis.client().clone(), engine.clone());

    let monitor = HealthMonitor::new(engine.clone()).spawn();
    let health_writer = spawn_health_writer(engine.clone(), replier.clone(), worker_id);

    info!("Waiting for jobs...");

    loop {
        let job = tokio::select! {
            job = redis.pop_job() => job,
            _ = tokio::signal::ctrl_c() => {
                info!("Received shutdown signal");
                break;
            }
        };

        let job = match job {
            Ok(job) => job,
            Err(e) => {
                error!("Failed to pop job: {:#}", e);
                continue;
            }
        };

        info!("Received {} job", job.kind());
        let engine = engine.clone();
        let replier = replier.clone();
        tokio::spawn(async move {
            let reply_key = job.reply_key().to_string();
            let reply = process_job(&engine, job).await;
            if let Err(e) = replier.push(&reply_key, &reply).await {
                error!("Failed to push reply to {}: {:#}", reply_key, e);
            }
        });
    }

    monitor.abort();
    health_writer.abort();
    cancel_listener.abort();
    engine.shutdown().await;
    info!("Worker {} stopped", worker_id);
    Ok(())
}

/// Publish the engine's health report so dispatchers can route around degraded workers
fn spawn_health_writer(engine: Arc<Engine>, replier: Replier, worker_id: u32) -> JoinHandle<()> {
    tokio::spawn(async move {
        let period = engine.config().health_interval;
        let mut ticker = interval(period);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
        loop {
            ticker.tick().await;
            let report = engine.health();
            if let Err(e) = replier.write_health(worker_id, &report, period * 2).await {
                warn!("Failed to write health report: {:#}", e);
            }
        }
    })
}
