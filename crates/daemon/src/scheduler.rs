//! Sync scheduler that starts a sync run on a configurable interval.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use tokio::sync::Notify;
use tokio::time::{self, MissedTickBehavior};
use tracing::{error, info, warn};

use mirrorsync_core::errors::SyncError;
use mirrorsync_core::models::{RunDirection, RunStatus, SyncRun};
use mirrorsync_core::sync_engine::{RunOptions, SyncEngine};

use crate::signals::ShutdownFlag;

/// Tracks aggregate statistics across sync runs.
#[derive(Debug, Default)]
pub struct SchedulerStats {
    pub total_cycles: AtomicU64,
    pub skipped_cycles: AtomicU64,
    pub total_conflicts: AtomicU64,
    pub total_errors: AtomicU64,
    pub consecutive_errors: AtomicU64,
}

/// The sync scheduler.
///
/// Runs one sync per tick. If a run is still in progress when the next tick
/// fires, that tick is skipped rather than queued.
pub struct Scheduler {
    engine: Arc<SyncEngine>,
    poll_interval: Duration,
    direction: RunDirection,
    shutdown: ShutdownFlag,
    stats: Arc<SchedulerStats>,
}

impl Scheduler {
    pub fn new(
        engine: Arc<SyncEngine>,
        poll_interval: Duration,
        direction: RunDirection,
        shutdown: ShutdownFlag,
    ) -> Self {
        Self {
            engine,
            poll_interval,
            direction,
            shutdown,
            stats: Arc::new(SchedulerStats::default()),
        }
    }

    pub fn stats(&self) -> Arc<SchedulerStats> {
        Arc::clone(&self.stats)
    }

    /// Main scheduler loop. Returns once `stop` is notified or the shutdown
    /// flag is seen between runs.
    pub async fn run(&self, stop: Arc<Notify>) {
        info!(
            poll_interval_secs = self.poll_interval.as_secs(),
            direction = %self.direction,
            "scheduler started"
        );

        let mut interval = time::interval(self.poll_interval);
        interval.set_missed_tick_behavior(MissedTickBehavior::Skip);
        // The first tick fires immediately; consume it to allow the system
        // time to fully start before the first sync.
        interval.tick().await;

        loop {
            tokio::select! {
                _ = interval.tick() => {
                    if self.shutdown.is_set() {
                        break;
                    }
                    self.run_cycle("scheduled").await;
                }
                _ = stop.notified() => break,
            }
        }
        info!("scheduler stopped");
    }

    /// Start one run. Returns `None` when the run could not start.
    pub async fn run_cycle(&self, trigger: &str) -> Option<SyncRun> {
        let cycle = self.stats.total_cycles.fetch_add(1, Ordering::SeqCst) + 1;
        info!(cycle, trigger, "starting sync cycle");

        match self
            .engine
            .run(RunOptions::new(self.direction), self.shutdown.handle())
            .await
        {
            Ok(run) => {
                let totals = run.totals();
                self.stats
                    .total_conflicts
                    .fetch_add(totals.conflicted, Ordering::SeqCst);

                if run.status == RunStatus::Failed {
                    let failed: Vec<String> = run
                        .failed_pairs()
                        .map(|p| format!("{}/{}", p.entity, p.direction))
                        .collect();
                    self.record_error();
                    warn!(
                        cycle,
                        run_id = %run.id,
                        failed_pairs = ?failed,
                        "sync cycle finished with failed pairs"
                    );
                } else {
                    self.stats.consecutive_errors.store(0, Ordering::SeqCst);
                    info!(
                        cycle,
                        run_id = %run.id,
                        status = %run.status,
                        applied = totals.applied,
                        conflicts = totals.conflicted,
                        "sync cycle completed"
                    );
                }
                Some(run)
            }
            Err(SyncError::AlreadyRunning { started_at }) => {
                self.stats.skipped_cycles.fetch_add(1, Ordering::SeqCst);
                warn!(cycle, trigger, %started_at, "skipping sync cycle: previous run still in progress");
                None
            }
            Err(e) => {
                let consecutive = self.record_error();
                error!(cycle, error = %e, consecutive_errors = consecutive, "sync cycle failed");
                None
            }
        }
    }

    fn record_error(&self) -> u64 {
        self.stats.total_errors.fetch_add(1, Ordering::SeqCst);
        self.stats.consecutive_errors.fetch_add(1, Ordering::SeqCst) + 1
    }
}
