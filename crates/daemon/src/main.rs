//! mirrorsync daemon entry point.
//!
//! Loads configuration, initializes the state database and sync engine,
//! starts the sync scheduler, and handles graceful shutdown.

mod scheduler;
mod signals;

use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use clap::Parser;
use tracing::{debug, info, warn};
use tracing_appender::non_blocking::WorkerGuard;
use tracing_subscriber::EnvFilter;

use mirrorsync_core::config::AppConfig;
use mirrorsync_core::db::Database;
use mirrorsync_core::events::{EventDispatcher, EventKind, SyncEvent};
use mirrorsync_core::models::RunDirection;
use mirrorsync_core::sync_engine::SyncEngine;

use crate::signals::ShutdownFlag;

// ---------------------------------------------------------------------------
// CLI arguments
// ---------------------------------------------------------------------------

/// mirrorsync synchronization daemon.
#[derive(Parser, Debug)]
#[command(
    name = "mirrorsync-daemon",
    version,
    about = "Bidirectional document-store/relational-mirror synchronization daemon"
)]
struct Args {
    /// Path to the TOML configuration file.
    #[arg(short, long)]
    config: PathBuf,

    /// Override the log level from the config file (trace, debug, info, warn, error).
    #[arg(long)]
    log_level: Option<String>,

    /// Override the configured sync direction.
    #[arg(long, value_parser = parse_direction)]
    direction: Option<RunDirection>,
}

fn parse_direction(s: &str) -> Result<RunDirection, String> {
    s.parse()
}

// ---------------------------------------------------------------------------
// Logging
// ---------------------------------------------------------------------------

/// Install the global subscriber. The returned guard flushes the log file
/// writer and must live until exit.
fn init_tracing(log_level: &str, log_file: Option<&PathBuf>) -> Result<Option<WorkerGuard>> {
    let filter = EnvFilter::try_new(log_level).unwrap_or_else(|_| EnvFilter::new("info"));

    let Some(path) = log_file else {
        tracing_subscriber::fmt()
            .with_env_filter(filter)
            .with_target(true)
            .with_thread_ids(false)
            .with_file(false)
            .init();
        return Ok(None);
    };

    let dir = path
        .parent()
        .filter(|p| !p.as_os_str().is_empty())
        .map(PathBuf::from)
        .unwrap_or_else(|| PathBuf::from("."));
    let file_name = path
        .file_name()
        .context("log_file must name a file")?;
    std::fs::create_dir_all(&dir).context("failed to create log directory")?;

    let appender = tracing_appender::rolling::daily(&dir, file_name);
    let (writer, guard) = tracing_appender::non_blocking(appender);
    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_target(true)
        .with_ansi(false)
        .with_writer(writer)
        .init();
    Ok(Some(guard))
}

/// Event handlers that turn engine events into log lines.
fn logging_handlers() -> EventDispatcher {
    let mut events = EventDispatcher::new();
    events.on(EventKind::RecordFailed, |event| {
        if let SyncEvent::RecordFailed {
            entity,
            direction,
            record_id,
            error,
        } = event
        {
            warn!(%entity, %direction, %record_id, %error, "record not synced");
        }
    });
    events.on(EventKind::ConflictResolved, |event| {
        if let SyncEvent::ConflictResolved {
            entity,
            primary_id,
            mirror_id,
            outcome,
        } = event
        {
            info!(%entity, %primary_id, %mirror_id, %outcome, "conflict resolved");
        }
    });
    events.on(EventKind::RecordApplied, |event| {
        if let SyncEvent::RecordApplied {
            entity,
            direction,
            record_id,
            ..
        } = event
        {
            debug!(%entity, %direction, %record_id, "record applied");
        }
    });
    events.on(EventKind::RunFinished, |event| {
        if let SyncEvent::RunFinished { run_id, status } = event {
            info!(%run_id, %status, "run finished");
        }
    });
    events
}

// ---------------------------------------------------------------------------
// Main
// ---------------------------------------------------------------------------

#[tokio::main]
async fn main() -> Result<()> {
    let args = Args::parse();

    // Load, resolve and validate configuration
    let config =
        AppConfig::load_and_resolve(&args.config).context("failed to load configuration file")?;

    let log_level = args
        .log_level
        .clone()
        .unwrap_or_else(|| config.daemon.log_level.clone());
    let _log_guard = init_tracing(&log_level, config.daemon.log_file.as_ref())?;

    let direction = args.direction.unwrap_or(config.sync.default_direction);

    // Startup banner
    info!("========================================");
    info!("  mirrorsync daemon v{}", env!("CARGO_PKG_VERSION"));
    info!("========================================");
    info!("Config file   : {}", args.config.display());
    info!("Primary store : {}", config.primary.base_url);
    info!("Mirror store  : {}", config.mirror.base_url);
    info!("Mapping file  : {}", config.schema.mapping_file.display());
    info!("Direction     : {}", direction);
    info!("Poll interval : {}s", config.daemon.poll_interval_secs);
    info!("Data dir      : {}", config.daemon.data_dir.display());
    info!("Log level     : {}", log_level);
    info!("========================================");

    // Ensure data directory exists
    std::fs::create_dir_all(&config.daemon.data_dir).context("failed to create data directory")?;

    // Initialize database
    let db_path = config.daemon.database_path();
    let db = Database::new(&db_path).context("failed to open database")?;
    db.initialize()
        .context("failed to initialize database schema")?;
    info!("Database initialized at {}", db_path.display());

    // Initialize sync engine
    let engine = SyncEngine::from_config(&config, Arc::new(db))
        .context("failed to initialize sync engine")?
        .with_events(logging_handlers());
    info!(
        entities = engine.registry().len(),
        "Sync engine initialized"
    );
    let engine = Arc::new(engine);

    // Create the shutdown flag and the scheduler stop signal
    let shutdown = ShutdownFlag::new();
    let stop = Arc::new(tokio::sync::Notify::new());

    let sched = scheduler::Scheduler::new(
        engine,
        Duration::from_secs(config.daemon.poll_interval_secs),
        direction,
        shutdown.clone(),
    );

    // Start the scheduler in a background task
    let scheduler_stop = stop.clone();
    let scheduler_handle = tokio::spawn(async move {
        sched.run(scheduler_stop).await;
    });

    // Wait for shutdown signal
    signals::wait_for_shutdown().await;

    info!("Shutdown signal received, stopping...");

    // Stop fetching in any in-flight run, then stop the loop
    shutdown.trigger();
    stop.notify_one();

    // Wait for the in-flight run to drain (up to 30s)
    match tokio::time::timeout(Duration::from_secs(30), scheduler_handle).await {
        Ok(Ok(())) => info!("scheduler stopped gracefully"),
        Ok(Err(e)) => warn!("scheduler task error: {}", e),
        Err(_) => warn!("scheduler did not stop within 30s, forcing shutdown"),
    }

    info!("mirrorsync daemon stopped.");
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_args_parse() {
        let args = Args::try_parse_from([
            "mirrorsync-daemon",
            "--config",
            "/etc/mirrorsync.toml",
            "--direction",
            "primary_to_mirror",
        ])
        .unwrap();
        assert_eq!(args.config, PathBuf::from("/etc/mirrorsync.toml"));
        assert_eq!(args.direction, Some(RunDirection::PrimaryToMirror));
        assert!(args.log_level.is_none());
    }

    #[test]
    fn test_logging_handlers_cover_key_events() {
        let events = logging_handlers();
        for kind in [
            EventKind::RecordFailed,
            EventKind::ConflictResolved,
            EventKind::RunFinished,
        ] {
            assert_eq!(events.handler_count(kind), 1);
        }
        assert_eq!(events.handler_count(EventKind::PairFinished), 0);
    }
}
