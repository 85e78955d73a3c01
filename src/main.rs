// =============================================================================
// Signal Core — Main Entry Point
// =============================================================================
//
// Starts one task per pipeline component (Window Worker, Market-Env Updater,
// Signal Router, Signal Evaluator intake + resolve), all communicating
// exclusively through Redis Streams/Hashes. A single `Arc<AtomicBool>`
// running flag, flipped by `ctrl_c()`, drives graceful shutdown across every
// task.
// =============================================================================

mod aggregator;
mod config;
mod detector;
mod evaluator;
mod gate_cache;
mod market_env;
mod numeric;
mod redis_stream;
mod router;
mod types;
mod window;

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use parking_lot::RwLock;
use tracing::{info, warn};
use tracing_subscriber::EnvFilter;

use crate::config::AppConfig;
use crate::redis_stream::RedisStreams;

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let _ = dotenv::dotenv();

    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
        .init();

    let cfg = Arc::new(AppConfig::from_env());
    info!(symbols = ?cfg.symbols, redis_url = %cfg.redis_url, "signal-core starting");

    let redis = RedisStreams::connect(&cfg.redis_url).await?;
    let running = Arc::new(AtomicBool::new(true));

    let jobs: Arc<RwLock<HashMap<(String, i64, String), evaluator::PendingJob>>> = Arc::new(RwLock::new(HashMap::new()));

    let window_task = tokio::spawn(window::worker::run(redis.clone(), cfg.clone(), running.clone()));
    let market_env_task = tokio::spawn(market_env::worker::run(redis.clone(), cfg.clone(), running.clone()));
    let router_task = tokio::spawn(router::run(redis.clone(), cfg.clone(), running.clone()));
    let eval_intake_task = tokio::spawn(evaluator::worker::run_intake(redis.clone(), cfg.clone(), running.clone(), jobs.clone()));
    let eval_resolve_task = tokio::spawn(evaluator::worker::run_resolve(redis.clone(), cfg.clone(), running.clone(), jobs.clone()));

    info!("all workers running, press Ctrl+C to stop");
    tokio::signal::ctrl_c().await?;
    warn!("shutdown signal received, stopping workers");
    running.store(false, Ordering::Relaxed);

    for (name, handle) in [
        ("window", window_task),
        ("market-env", market_env_task),
        ("router", router_task),
        ("eval-intake", eval_intake_task),
        ("eval-resolve", eval_resolve_task),
    ] {
        if let Err(e) = handle.await {
            warn!(task = name, error = %e, "worker task panicked during shutdown");
        }
    }

    info!("signal-core stopped");
    Ok(())
}
