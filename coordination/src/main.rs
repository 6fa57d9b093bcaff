//! Hive coordinator
//!
//! Builds the coordination context for one instance, registers the
//! configured agents on the message bus and runs periodic maintenance
//! (session and lock sweeps, bus health, state snapshot) until ctrl-c.
//!
//! # Usage
//!
//! ```bash
//! # In-process store, defaults
//! hive-coordinator --agent queen --agent maths_bee
//!
//! # Config file plus overrides
//! HIVE_SESSION_TTL_SECS=600 hive-coordinator --config hive.toml --json-logs
//!
//! # Shared Redis store (built with --features redis-store)
//! hive-coordinator --redis-url redis://127.0.0.1:6379 --instance-id queen-a
//! ```

use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use clap::Parser;
use tokio::time::MissedTickBehavior;
use tracing::{debug, info, warn, Instrument};

use hive_coordination::bus::HealthStatus;
use hive_coordination::store;
use hive_coordination::{telemetry, HiveConfig, HiveContext, SharedHiveContext};

/// Command-line arguments
#[derive(Parser, Debug)]
#[command(author, version, about, long_about = None)]
struct Args {
    /// TOML configuration file (HIVE_* environment variables still apply)
    #[arg(long)]
    config: Option<PathBuf>,

    /// Redis URL for the shared backing store (overrides HIVE_REDIS_URL)
    #[cfg(feature = "redis-store")]
    #[arg(long)]
    redis_url: Option<String>,

    /// Instance identifier reported in state snapshots (overrides HIVE_INSTANCE_ID)
    #[arg(long)]
    instance_id: Option<String>,

    /// Seconds between maintenance passes
    #[arg(long, default_value_t = 30)]
    maintenance_interval_secs: u64,

    /// Agent to register on the message bus (repeatable)
    #[arg(long = "agent")]
    agents: Vec<String>,

    /// Emit logs as JSON lines
    #[arg(long, default_value_t = false)]
    json_logs: bool,
}

#[tokio::main]
async fn main() -> Result<()> {
    let args = Args::parse();
    telemetry::init_tracing(args.json_logs)?;

    let mut config = match &args.config {
        Some(path) => HiveConfig::from_toml_file(path)
            .with_context(|| format!("loading {}", path.display()))?,
        None => HiveConfig::from_env(),
    };
    if let Some(id) = args.instance_id {
        config.instance_id = Some(id);
    }
    #[cfg(feature = "redis-store")]
    if let Some(url) = args.redis_url {
        config.store.redis_url = Some(url);
    }
    for agent in args.agents {
        if !config.bus.agents.contains(&agent) {
            config.bus.agents.push(agent);
        }
    }
    config.validate()?;

    let store = store::open(&config.store)
        .await
        .context("opening backing store")?;
    let ctx = HiveContext::build(config, store).shared();
    for agent in &ctx.config.bus.agents {
        ctx.bus.register(agent)?;
    }

    info!(
        instance_id = %ctx.instance_id,
        agents = ctx.config.bus.agents.len(),
        "Hive coordinator started"
    );

    let interval = Duration::from_secs(args.maintenance_interval_secs.max(1));
    let maintenance = tokio::spawn(maintenance_loop(Arc::clone(&ctx), interval));

    tokio::signal::ctrl_c()
        .await
        .context("waiting for shutdown signal")?;
    info!("Shutdown signal received");

    ctx.shutdown().await;
    maintenance.await.context("maintenance task")?;
    info!("Hive coordinator stopped");
    Ok(())
}

async fn maintenance_loop(ctx: SharedHiveContext, interval: Duration) {
    let cancel = ctx.shutdown_token();
    let mut ticker = tokio::time::interval(interval);
    ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
    let mut tick = 0u64;

    loop {
        tokio::select! {
            _ = cancel.cancelled() => break,
            _ = ticker.tick() => {}
        }
        tick += 1;
        let span = telemetry::maintenance_span(&ctx.instance_id, tick);
        run_maintenance(&ctx).instrument(span).await;
    }
}

async fn run_maintenance(ctx: &HiveContext) {
    if let Err(e) = ctx.store.ping().await {
        warn!(error = %e, "Backing store unreachable; locks fall back to local mode");
    }

    let sessions = ctx.sessions.cleanup().await;
    let stale_locks = ctx.locks.cleanup_expired_locks().await;
    let active_locks = ctx.locks.active_locks().await.len();
    let health = ctx.bus.health_check();
    let state = ctx.controls.get_state();

    if health.status != HealthStatus::Healthy {
        for issue in &health.issues {
            warn!(issue = %issue, "Message bus issue");
        }
    }

    info!(
        system_state = %state.system_state,
        sessions_scanned = sessions.scanned,
        orphans_removed = sessions.orphans_removed,
        purged = sessions.purged,
        stale_locks,
        active_locks,
        bus_status = ?health.status,
        paused_bees = state.paused_bees.len(),
        disabled_features = state.disabled_features.len(),
        "Maintenance pass"
    );
    match serde_json::to_string(&state) {
        Ok(snapshot) => debug!(%snapshot, "Emergency state snapshot"),
        Err(e) => warn!(error = %e, "Cannot serialize state snapshot"),
    }
}
