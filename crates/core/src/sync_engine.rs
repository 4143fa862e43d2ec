//! Sync orchestrator.
//!
//! The [`SyncEngine`] drives every selected entity through one run:
//!
//! 1. Entities are processed in dependency layers, leaves first. A layer
//!    starts only once the previous one has finished.
//! 2. Within a layer each entity runs as its own task, gated by a semaphore.
//! 3. One-way pairs stream: the fetcher feeds batches to the applier over a
//!    bounded channel.
//! 4. Bidirectional runs fetch both sides in full, pair overlapping changes,
//!    resolve them and apply everything in one combined phase.
//! 5. Each pair's cursor advances to the end of its fully handled prefix.
//!
//! A lock prevents concurrent runs on one engine; the cursor generation
//! check catches runs in other processes.

use std::collections::{HashMap, HashSet, VecDeque};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use chrono::{DateTime, Utc};
use tokio::sync::{mpsc, Semaphore};
use tracing::{debug, error, info, warn};

use crate::applier::WriteApplier;
use crate::config::{AppConfig, SyncConfig};
use crate::conflict::{Conflict, ConflictDetector, ConflictResolver, ResolutionOutcome};
use crate::cursor::{CursorStore, Watermark};
use crate::db::queries::CursorEntry;
use crate::db::Database;
use crate::errors::{CoreError, CursorError, ErrorClass, StoreError, SyncError, TranslateError};
use crate::events::{EventDispatcher, SyncEvent};
use crate::fetcher::ChangeFetcher;
use crate::identity::IdentityMap;
use crate::models::{
    AuditEntry, Cursor, Direction, EntityCounts, FieldError, PairReport, PairStatus, RunDirection,
    RunStatus, Side, SourceRecord, SyncRun, TargetRecord, WriteOutcome,
};
use crate::retry::RetryPolicy;
use crate::schema::{MappingSpec, SchemaRegistry};
use crate::store::{HttpStore, StorePair};
use crate::translator::translate;

// ---------------------------------------------------------------------------
// Run options
// ---------------------------------------------------------------------------

/// What one run should cover.
#[derive(Debug, Clone, Default)]
pub struct RunOptions {
    pub direction: RunDirection,
    /// Start every pair at this time (epoch milliseconds, inclusive) instead
    /// of its stored cursor. Persisted only by pairs that succeed.
    pub since: Option<i64>,
    /// Restrict the run to these entities. Empty means all.
    pub entities: Vec<String>,
}

impl RunOptions {
    pub fn new(direction: RunDirection) -> Self {
        Self {
            direction,
            ..Default::default()
        }
    }

    pub fn since(mut self, since: i64) -> Self {
        self.since = Some(since);
        self
    }

    pub fn entities<I, S>(mut self, entities: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.entities = entities.into_iter().map(Into::into).collect();
        self
    }
}

/// Snapshot of persisted sync state, for status displays.
///
/// `state` and `last_sync_at` are derived from the run history; sync
/// progress itself lives only in the cursors.
#[derive(Debug, Clone)]
pub struct EngineStatus {
    pub state: String,
    pub last_sync_at: Option<DateTime<Utc>>,
    pub last_run: Option<SyncRun>,
    pub cursors: Vec<CursorEntry>,
    pub identities: i64,
    pub conflicts: i64,
    pub errors: i64,
}

impl EngineStatus {
    pub fn load(db: &Database) -> Result<Self, SyncError> {
        let last_run = db.get_latest_sync_run()?;
        let state = match last_run.as_ref().map(|run| run.status) {
            Some(RunStatus::Failed) => "error",
            _ => "idle",
        };
        Ok(Self {
            state: state.to_string(),
            last_sync_at: last_run.as_ref().and_then(|run| run.completed_at),
            last_run,
            cursors: db.list_cursors()?,
            identities: db.count_identities()?,
            conflicts: db.count_conflict_log()?,
            errors: db.count_errors()?,
        })
    }
}

// ---------------------------------------------------------------------------
// Engine
// ---------------------------------------------------------------------------

/// Everything a pair task needs, cheap to clone into spawned tasks.
#[derive(Clone)]
struct EngineContext {
    db: Arc<Database>,
    registry: Arc<SchemaRegistry>,
    stores: StorePair,
    cursors: CursorStore,
    identity: Arc<IdentityMap>,
    applier: Arc<WriteApplier>,
    events: Arc<EventDispatcher>,
    retry: RetryPolicy,
    timeout: Duration,
    page_size: usize,
    max_in_flight: usize,
}

/// The sync orchestrator.
pub struct SyncEngine {
    ctx: EngineContext,
    concurrency: usize,
    /// Atomic flag preventing concurrent runs.
    running: Arc<AtomicBool>,
    run_started_at: Mutex<Option<DateTime<Utc>>>,
}

impl SyncEngine {
    pub fn new(
        settings: &SyncConfig,
        db: Arc<Database>,
        registry: Arc<SchemaRegistry>,
        stores: StorePair,
    ) -> Self {
        let retry = RetryPolicy::from(settings.retry.clone());
        let timeout = settings.request_timeout();
        let identity = Arc::new(IdentityMap::new(Arc::clone(&db)));
        let applier = Arc::new(WriteApplier::new(
            stores.clone(),
            Arc::clone(&identity),
            retry.clone(),
            timeout,
        ));

        info!(
            entities = registry.len(),
            concurrency = settings.concurrency,
            page_size = settings.page_size,
            "initializing sync engine"
        );
        Self {
            ctx: EngineContext {
                cursors: CursorStore::new(Arc::clone(&db)),
                db,
                registry,
                stores,
                identity,
                applier,
                events: Arc::new(EventDispatcher::new()),
                retry,
                timeout,
                page_size: settings.page_size.max(1),
                max_in_flight: settings.max_in_flight_batches.max(1),
            },
            concurrency: settings.concurrency.max(1),
            running: Arc::new(AtomicBool::new(false)),
            run_started_at: Mutex::new(None),
        }
    }

    /// Build an engine talking to the HTTP stores named in `config`, with
    /// the mapping file it points at.
    pub fn from_config(config: &AppConfig, db: Arc<Database>) -> Result<Self, CoreError> {
        let registry = SchemaRegistry::load(&config.schema.mapping_file)?;
        let stores = StorePair::new(
            Arc::new(HttpStore::new("primary", &config.primary)?),
            Arc::new(HttpStore::new("mirror", &config.mirror)?),
        );
        Ok(Self::new(&config.sync, db, Arc::new(registry), stores))
    }

    /// Replace the event handler table.
    pub fn with_events(mut self, events: EventDispatcher) -> Self {
        self.ctx.events = Arc::new(events);
        self
    }

    pub fn db(&self) -> &Database {
        &self.ctx.db
    }

    pub fn registry(&self) -> &SchemaRegistry {
        &self.ctx.registry
    }

    pub fn identity(&self) -> &IdentityMap {
        &self.ctx.identity
    }

    pub fn cursors(&self) -> &CursorStore {
        &self.ctx.cursors
    }

    /// Check if a run is currently in progress.
    pub fn is_running(&self) -> bool {
        self.running.load(Ordering::SeqCst)
    }

    pub fn status(&self) -> Result<EngineStatus, SyncError> {
        let mut status = EngineStatus::load(&self.ctx.db)?;
        if self.is_running() {
            status.state = "running".to_string();
        }
        Ok(status)
    }

    // -----------------------------------------------------------------------
    // Main entry point
    // -----------------------------------------------------------------------

    /// Execute one run. Setting `cancel` stops further fetches; batches
    /// already fetched still finish applying.
    ///
    /// Pair failures are reported in the returned [`SyncRun`]; only
    /// run-level problems (lock held, unknown entity, database down) are
    /// errors.
    pub async fn run(&self, options: RunOptions, cancel: Arc<AtomicBool>) -> Result<SyncRun, SyncError> {
        if self
            .running
            .compare_exchange(false, true, Ordering::SeqCst, Ordering::SeqCst)
            .is_err()
        {
            let started_at = self
                .started_at_slot()
                .map(|t| t.to_rfc3339())
                .unwrap_or_default();
            return Err(SyncError::AlreadyRunning { started_at });
        }

        // RAII guard that clears the running flag on drop (even on panic).
        let _guard = SyncLockGuard(self.running.clone());

        let selected = self.select_entities(&options.entities)?;
        let mut run = SyncRun::start(options.direction, options.since);
        *self.run_started_at.lock().unwrap_or_else(|p| p.into_inner()) = Some(run.started_at);

        info!(
            run_id = %run.id,
            direction = %options.direction,
            since = ?options.since,
            entities = selected.len(),
            "starting sync run"
        );

        let pairs = PairRunner {
            ctx: self.ctx.clone(),
            run_id: run.id.clone(),
            since: options.since,
            cancel: Arc::clone(&cancel),
        };
        let semaphore = Arc::new(Semaphore::new(self.concurrency));

        for layer in self.ctx.registry.dependency_layers() {
            let specs: Vec<MappingSpec> = layer
                .iter()
                .filter(|name| selected.contains(name.as_str()))
                .filter_map(|name| self.ctx.registry.resolve(name).ok().cloned())
                .collect();
            if specs.is_empty() {
                continue;
            }
            debug!(entities = ?layer, "starting dependency layer");

            let mut handles = Vec::with_capacity(specs.len());
            for spec in specs {
                let runner = pairs.clone();
                let semaphore = Arc::clone(&semaphore);
                let direction = options.direction;
                let entity = spec.name.clone();
                let handle = tokio::spawn(async move {
                    let _permit = semaphore.acquire_owned().await.ok();
                    runner.run_entity(spec, direction).await
                });
                handles.push((entity, handle));
            }

            for (entity, handle) in handles {
                match handle.await {
                    Ok(reports) => run.pairs.extend(reports),
                    Err(e) => {
                        error!(entity = %entity, error = %e, "sync task panicked");
                        for &direction in options.direction.directions() {
                            let stored = self
                                .ctx
                                .cursors
                                .get(&entity, direction)
                                .unwrap_or_else(|_| Cursor::epoch());
                            run.pairs.push(PairProgress::failed(
                                &entity,
                                direction,
                                stored,
                                format!("sync task panicked: {e}"),
                            ));
                        }
                    }
                }
            }
        }

        run.finalize(cancel.load(Ordering::SeqCst));
        self.ctx.db.save_sync_run(&run)?;
        self.record_completion(&run);
        Ok(run)
    }

    fn started_at_slot(&self) -> Option<DateTime<Utc>> {
        *self.run_started_at.lock().unwrap_or_else(|p| p.into_inner())
    }

    fn select_entities(&self, requested: &[String]) -> Result<HashSet<String>, SyncError> {
        if requested.is_empty() {
            return Ok(self.ctx.registry.entity_names().map(String::from).collect());
        }
        requested
            .iter()
            .map(|name| -> Result<String, SyncError> {
                Ok(self.ctx.registry.resolve(name)?.name.clone())
            })
            .collect()
    }

    fn record_completion(&self, run: &SyncRun) {
        let totals = run.totals();
        let details = format!(
            "run {} ({}): {} pairs, fetched {}, applied {}, conflicts {}, failed {}",
            run.id,
            run.direction,
            run.pairs.len(),
            totals.fetched,
            totals.applied,
            totals.conflicted,
            totals.failed
        );
        let audit = if run.status == RunStatus::Failed {
            AuditEntry::failure("sync_run", &details)
        } else {
            AuditEntry::success("sync_run", &details)
        };
        if let Err(e) = self.ctx.db.insert_audit_entry(&audit) {
            warn!(error = %e, "failed to write audit entry");
        }

        info!(
            run_id = %run.id,
            status = %run.status,
            fetched = totals.fetched,
            applied = totals.applied,
            conflicted = totals.conflicted,
            failed = totals.failed,
            "sync run completed"
        );
        self.ctx.events.dispatch(&SyncEvent::RunFinished {
            run_id: run.id.clone(),
            status: run.status,
        });
    }
}

/// Clears the running flag when dropped.
struct SyncLockGuard(Arc<AtomicBool>);

impl Drop for SyncLockGuard {
    fn drop(&mut self) {
        self.0.store(false, Ordering::SeqCst);
    }
}

// ---------------------------------------------------------------------------
// Pair bookkeeping
// ---------------------------------------------------------------------------

/// Mutable state of one pair while its records are processed.
struct PairProgress {
    entity: String,
    direction: Direction,
    stored: Cursor,
    watermark: Watermark,
    counts: EntityCounts,
    abort: Option<String>,
}

impl PairProgress {
    fn new(entity: &str, direction: Direction, stored: Cursor) -> Self {
        Self {
            entity: entity.to_string(),
            direction,
            stored,
            watermark: Watermark::new(),
            counts: EntityCounts::default(),
            abort: None,
        }
    }

    fn bare_report(&self) -> PairReport {
        PairReport {
            entity: self.entity.clone(),
            direction: self.direction,
            status: PairStatus::Succeeded,
            counts: self.counts.clone(),
            cursor_before: self.stored.clone(),
            cursor_after: self.stored.clone(),
            error: None,
        }
    }

    /// Report for a pair that failed before it processed anything.
    fn failed(entity: &str, direction: Direction, stored: Cursor, error: String) -> PairReport {
        let mut report = Self::new(entity, direction, stored).bare_report();
        report.status = PairStatus::Failed;
        report.error = Some(error);
        report
    }

    /// Decide the pair's status and move its cursor to the watermark.
    ///
    /// A failed pair leaves its cursor where it was. With a `--since`
    /// override the cursor moves only if the pair succeeded; otherwise it
    /// moves as far as the watermark allows.
    fn finish(self, cursors: &CursorStore, since_override: bool, cancelled: bool) -> PairReport {
        let mut report = self.bare_report();
        report.status = if self.abort.is_some() {
            PairStatus::Failed
        } else if cancelled {
            PairStatus::Cancelled
        } else if self.counts.failed > 0 || self.watermark.outstanding() > 0 {
            PairStatus::Degraded
        } else {
            PairStatus::Succeeded
        };
        report.error = self.abort;

        let persist = match report.status {
            PairStatus::Failed => false,
            PairStatus::Succeeded => true,
            _ => !since_override,
        };
        if let (true, Some(frontier)) = (persist, self.watermark.frontier()) {
            match cursors.advance(&self.entity, self.direction, &self.stored, frontier) {
                Ok(cursor) => report.cursor_after = cursor,
                Err(e @ CursorError::Stale { .. }) => {
                    if report.status != PairStatus::Failed {
                        report.status = PairStatus::Stale;
                    }
                    report.error.get_or_insert_with(|| e.to_string());
                }
                Err(e) => {
                    report.status = PairStatus::Failed;
                    report.error = Some(format!("cursor advance failed: {e}"));
                }
            }
        }
        report
    }
}

/// What happened to one record (or one conflict).
enum Step {
    Done,
    /// A required reference is not resolved yet; try again at the end.
    Deferred,
    /// Failed for good; the pair carries on but the cursor stops here.
    Failed,
    /// Retries ran out; the pair stops.
    Abort(String),
}

/// A unit of work in the combined phase of a bidirectional run.
enum Work {
    Single(Direction, SourceRecord),
    Conflict(Conflict),
}

impl Work {
    /// Position of the item in the change feed of `side`; `None` when the
    /// item did not come from that side.
    fn position(&self, side: Side) -> Option<(i64, &str)> {
        match (self, side) {
            (Self::Single(direction, r), side) if direction.source() == side => {
                Some((r.modified_at, r.id.as_str()))
            }
            (Self::Single(..), _) => None,
            (Self::Conflict(c), Side::Primary) => Some((c.primary.modified_at, c.primary.id.as_str())),
            (Self::Conflict(c), Side::Mirror) => Some((c.mirror.modified_at, c.mirror.id.as_str())),
        }
    }
}

/// Order the combined phase so each direction applies its records in
/// feed order.
///
/// Every item sits in the queue of the side it came from; a conflict sits
/// in both and is taken once it heads both. Two conflicts heading the
/// queues crosswise cannot both keep their place; the one earlier in its
/// own feed goes first.
fn schedule(work: Vec<Work>) -> Vec<Work> {
    let queue = |side: Side| -> VecDeque<usize> {
        let mut items: Vec<usize> = (0..work.len())
            .filter(|&i| work[i].position(side).is_some())
            .collect();
        items.sort_by(|&a, &b| work[a].position(side).cmp(&work[b].position(side)));
        items.into()
    };
    let mut queues = [queue(Side::Primary), queue(Side::Mirror)];
    let mut taken = vec![false; work.len()];
    let mut order = Vec::with_capacity(work.len());

    loop {
        for q in queues.iter_mut() {
            while q.front().is_some_and(|&i| taken[i]) {
                q.pop_front();
            }
        }
        let next = match (queues[0].front().copied(), queues[1].front().copied()) {
            (None, None) => break,
            (Some(i), None) | (None, Some(i)) => i,
            (Some(p), Some(m)) if p == m => p,
            (Some(p), Some(m)) => {
                let p_conflict = matches!(work[p], Work::Conflict(_));
                let m_conflict = matches!(work[m], Work::Conflict(_));
                match (p_conflict, m_conflict) {
                    (false, true) => p,
                    (true, false) => m,
                    _ => {
                        if p_conflict {
                            debug!("crossed conflicts in combined phase");
                        }
                        if work[p].position(Side::Primary) <= work[m].position(Side::Mirror) {
                            p
                        } else {
                            m
                        }
                    }
                }
            }
        };
        taken[next] = true;
        order.push(next);
    }

    let mut slots: Vec<Option<Work>> = work.into_iter().map(Some).collect();
    order.into_iter().filter_map(|i| slots[i].take()).collect()
}

// ---------------------------------------------------------------------------
// Per-entity task
// ---------------------------------------------------------------------------

/// Runs the pairs of one entity within a run.
#[derive(Clone)]
struct PairRunner {
    ctx: EngineContext,
    run_id: String,
    since: Option<i64>,
    cancel: Arc<AtomicBool>,
}

impl PairRunner {
    fn cancelled(&self) -> bool {
        self.cancel.load(Ordering::SeqCst)
    }

    async fn run_entity(&self, spec: MappingSpec, direction: RunDirection) -> Vec<PairReport> {
        let reports = match direction {
            RunDirection::Bidirectional => self.run_bidirectional(&spec).await,
            RunDirection::PrimaryToMirror => vec![self.run_pair(&spec, Direction::PrimaryToMirror).await],
            RunDirection::MirrorToPrimary => vec![self.run_pair(&spec, Direction::MirrorToPrimary).await],
        };
        for report in &reports {
            self.finish_pair(report);
        }
        reports
    }

    fn start_cursor(&self, stored: &Cursor) -> Cursor {
        match self.since {
            Some(ts) => Cursor {
                generation: stored.generation,
                ..Cursor::at(ts, "")
            },
            None => stored.clone(),
        }
    }

    fn fetcher(&self, spec: &MappingSpec, side: Side, start: Cursor) -> ChangeFetcher {
        ChangeFetcher::new(
            Arc::clone(self.ctx.stores.side(side)),
            spec.collection(side),
            start,
            self.ctx.page_size,
            self.ctx.retry.clone(),
            self.ctx.timeout,
        )
    }

    fn finish(&self, pair: PairProgress, cancelled: bool) -> PairReport {
        pair.finish(&self.ctx.cursors, self.since.is_some(), cancelled)
    }

    // -- one-way pairs ------------------------------------------------------

    async fn run_pair(&self, spec: &MappingSpec, direction: Direction) -> PairReport {
        let stored = match self.ctx.cursors.get(&spec.name, direction) {
            Ok(cursor) => cursor,
            Err(e) => return PairProgress::failed(&spec.name, direction, Cursor::epoch(), format!("cursor read failed: {e}")),
        };
        let mut pair = PairProgress::new(&spec.name, direction, stored);
        if self.cancelled() {
            return self.finish(pair, true);
        }

        let start = self.start_cursor(&pair.stored);
        info!(entity = %spec.name, %direction, from = %start, "syncing pair");

        let fetcher = self.fetcher(spec, direction.source(), start);
        let (tx, mut rx) = mpsc::channel(self.ctx.max_in_flight);
        let pump = tokio::spawn(pump_batches(fetcher, tx, Arc::clone(&self.cancel)));

        let mut deferred = Vec::new();
        'batches: while let Some(batch) = rx.recv().await {
            let batch = match batch {
                Ok(batch) => batch,
                Err(e) => {
                    warn!(entity = %spec.name, %direction, error = %e, "change feed failed");
                    pair.abort = Some(format!("fetch failed: {e}"));
                    break;
                }
            };
            debug!(entity = %spec.name, %direction, count = batch.len(), "applying batch");
            pair.counts.fetched += batch.len() as u64;

            for record in batch {
                let seq = pair.watermark.push(Cursor::at(record.modified_at, record.id.clone()));
                match self.process_record(spec, direction, &record, &mut pair.counts, false).await {
                    Step::Done => pair.watermark.complete(seq),
                    Step::Deferred => deferred.push((seq, record)),
                    Step::Failed => {}
                    Step::Abort(reason) => {
                        pair.abort = Some(reason);
                        break 'batches;
                    }
                }
            }
        }
        drop(rx);

        let cancelled = match pump.await {
            Ok(cancelled) => cancelled,
            Err(e) => {
                pair.abort.get_or_insert_with(|| format!("fetch task failed: {e}"));
                false
            }
        };

        if pair.abort.is_none() && !deferred.is_empty() {
            info!(entity = %spec.name, %direction, count = deferred.len(), "retrying deferred records");
            for (seq, record) in deferred {
                match self.process_record(spec, direction, &record, &mut pair.counts, true).await {
                    Step::Done => pair.watermark.complete(seq),
                    Step::Deferred | Step::Failed => {}
                    Step::Abort(reason) => {
                        pair.abort = Some(reason);
                        break;
                    }
                }
            }
        }

        self.finish(pair, cancelled)
    }

    /// Echo check, translation and write for one record of a one-way pair.
    async fn process_record(
        &self,
        spec: &MappingSpec,
        direction: Direction,
        record: &SourceRecord,
        counts: &mut EntityCounts,
        final_pass: bool,
    ) -> Step {
        match self
            .ctx
            .identity
            .is_echo(&spec.name, direction.source(), &record.id, record.modified_at)
        {
            Ok(true) => {
                counts.skipped += 1;
                return Step::Done;
            }
            Ok(false) => {}
            Err(e) => return self.record_failed(spec, direction, &record.id, counts, e.to_string()),
        }
        self.translate_and_write(spec, direction, record, counts, final_pass)
            .await
    }

    async fn translate_and_write(
        &self,
        spec: &MappingSpec,
        direction: Direction,
        record: &SourceRecord,
        counts: &mut EntityCounts,
        final_pass: bool,
    ) -> Step {
        let translation = match translate(record, spec, direction, &self.ctx.identity) {
            Ok(t) => t,
            Err(e @ TranslateError::UnresolvedReference { .. }) if !final_pass => {
                debug!(entity = %spec.name, %direction, record_id = %record.id, reason = %e, "deferring record");
                return Step::Deferred;
            }
            Err(e) => return self.record_failed(spec, direction, &record.id, counts, e.to_string()),
        };
        counts.translated += 1;
        note_field_errors(spec, direction, &record.id, &translation.field_errors, counts);
        self.write(spec, direction, &record.id, &translation.target, counts)
            .await
    }

    async fn write(
        &self,
        spec: &MappingSpec,
        direction: Direction,
        record_id: &str,
        target: &TargetRecord,
        counts: &mut EntityCounts,
    ) -> Step {
        match self.ctx.applier.apply(spec, target).await {
            Ok(outcome) => {
                match outcome {
                    WriteOutcome::Skipped { .. } => counts.skipped += 1,
                    _ => counts.applied += 1,
                }
                self.ctx.events.dispatch(&SyncEvent::RecordApplied {
                    entity: spec.name.clone(),
                    direction,
                    record_id: record_id.to_string(),
                    outcome,
                });
                Step::Done
            }
            Err(e) => {
                let fatal = e.class() == ErrorClass::Fatal;
                let step = self.record_failed(spec, direction, record_id, counts, e.to_string());
                if fatal {
                    step
                } else {
                    Step::Abort(format!("giving up on record {record_id}: {e}"))
                }
            }
        }
    }

    fn record_failed(
        &self,
        spec: &MappingSpec,
        direction: Direction,
        record_id: &str,
        counts: &mut EntityCounts,
        error: String,
    ) -> Step {
        counts.failed += 1;
        warn!(entity = %spec.name, %direction, record_id, error = %error, "record failed");
        self.ctx.events.dispatch(&SyncEvent::RecordFailed {
            entity: spec.name.clone(),
            direction,
            record_id: record_id.to_string(),
            error,
        });
        Step::Failed
    }

    // -- bidirectional ------------------------------------------------------

    async fn run_bidirectional(&self, spec: &MappingSpec) -> Vec<PairReport> {
        let name = spec.name.as_str();
        let stored = (
            self.ctx.cursors.get(name, Direction::PrimaryToMirror),
            self.ctx.cursors.get(name, Direction::MirrorToPrimary),
        );
        let (stored_p, stored_m) = match stored {
            (Ok(p), Ok(m)) => (p, m),
            (Err(e), _) | (_, Err(e)) => {
                let error = format!("cursor read failed: {e}");
                return vec![
                    PairProgress::failed(name, Direction::PrimaryToMirror, Cursor::epoch(), error.clone()),
                    PairProgress::failed(name, Direction::MirrorToPrimary, Cursor::epoch(), error),
                ];
            }
        };
        let mut p2m = PairProgress::new(name, Direction::PrimaryToMirror, stored_p);
        let mut m2p = PairProgress::new(name, Direction::MirrorToPrimary, stored_m);
        if self.cancelled() {
            return vec![self.finish(p2m, true), self.finish(m2p, true)];
        }

        info!(
            entity = name,
            primary_from = %self.start_cursor(&p2m.stored),
            mirror_from = %self.start_cursor(&m2p.stored),
            "syncing entity in both directions"
        );
        let (primary, mirror) = tokio::join!(
            self.fetch_all(spec, Side::Primary, self.start_cursor(&p2m.stored)),
            self.fetch_all(spec, Side::Mirror, self.start_cursor(&m2p.stored)),
        );
        let (primary, mirror) = match (primary, mirror) {
            (Ok(Some(p)), Ok(Some(m))) => (p, m),
            (p, m) => {
                let p_err = p.err();
                let m_err = m.err();
                if p_err.is_none() && m_err.is_none() {
                    // Cancelled mid-fetch: without both full change sets
                    // conflicts cannot be detected, so nothing is applied.
                    return vec![self.finish(p2m, true), self.finish(m2p, true)];
                }
                p2m.abort = Some(match p_err {
                    Some(e) => format!("fetch failed: {e}"),
                    None => "mirror change feed failed, combined phase skipped".to_string(),
                });
                m2p.abort = Some(match m_err {
                    Some(e) => format!("fetch failed: {e}"),
                    None => "primary change feed failed, combined phase skipped".to_string(),
                });
                return vec![self.finish(p2m, false), self.finish(m2p, false)];
            }
        };

        p2m.counts.fetched = primary.len() as u64;
        m2p.counts.fetched = mirror.len() as u64;
        let (primary, seq_p) = self.register(spec, Side::Primary, primary, &mut p2m);
        let (mirror, seq_m) = self.register(spec, Side::Mirror, mirror, &mut m2p);

        let changes = match ConflictDetector::detect(spec, primary, mirror, &self.ctx.identity) {
            Ok(changes) => changes,
            Err(e) => {
                let error = format!("conflict detection failed: {e}");
                p2m.abort = Some(error.clone());
                m2p.abort = Some(error);
                return vec![self.finish(p2m, false), self.finish(m2p, false)];
            }
        };

        let work: Vec<Work> = changes
            .conflicts
            .into_iter()
            .map(Work::Conflict)
            .chain(
                changes
                    .primary_only
                    .into_iter()
                    .map(|r| Work::Single(Direction::PrimaryToMirror, r)),
            )
            .chain(
                changes
                    .mirror_only
                    .into_iter()
                    .map(|r| Work::Single(Direction::MirrorToPrimary, r)),
            )
            .collect();
        let mut work = schedule(work);

        let mut deferred = Vec::new();
        for final_pass in [false, true] {
            let batch = if final_pass {
                if !deferred.is_empty() {
                    info!(entity = name, count = deferred.len(), "retrying deferred records");
                }
                std::mem::take(&mut deferred)
            } else {
                std::mem::take(&mut work)
            };
            for item in batch {
                let step = self
                    .process_work(spec, &item, &mut p2m, &mut m2p, final_pass)
                    .await;
                match step {
                    Step::Done => {
                        for (side, id) in item_ids(&item) {
                            let (seqs, pair) = match side {
                                Side::Primary => (&seq_p, &mut p2m),
                                Side::Mirror => (&seq_m, &mut m2p),
                            };
                            if let Some(&seq) = seqs.get(id) {
                                pair.watermark.complete(seq);
                            }
                        }
                    }
                    Step::Deferred => deferred.push(item),
                    Step::Failed => {}
                    Step::Abort(reason) => {
                        p2m.abort = Some(reason.clone());
                        m2p.abort = Some(reason);
                        break;
                    }
                }
            }
            if p2m.abort.is_some() {
                break;
            }
        }

        vec![self.finish(p2m, false), self.finish(m2p, false)]
    }

    async fn fetch_all(
        &self,
        spec: &MappingSpec,
        side: Side,
        start: Cursor,
    ) -> Result<Option<Vec<SourceRecord>>, StoreError> {
        let mut fetcher = self.fetcher(spec, side, start);
        let mut records = Vec::new();
        loop {
            if self.cancelled() {
                debug!(entity = %spec.name, %side, "cancelled, no further fetches");
                return Ok(None);
            }
            match fetcher.next_page().await? {
                Some(batch) => records.extend(batch),
                None => return Ok(Some(records)),
            }
        }
    }

    /// Put every fetched record on the pair's watermark and drop our own
    /// echoes, which count as handled.
    fn register(
        &self,
        spec: &MappingSpec,
        side: Side,
        records: Vec<SourceRecord>,
        pair: &mut PairProgress,
    ) -> (Vec<SourceRecord>, HashMap<String, u64>) {
        let mut seqs = HashMap::with_capacity(records.len());
        let mut live = Vec::with_capacity(records.len());
        for record in records {
            let seq = pair
                .watermark
                .push(Cursor::at(record.modified_at, record.id.clone()));
            match self
                .ctx
                .identity
                .is_echo(&spec.name, side, &record.id, record.modified_at)
            {
                Ok(true) => {
                    pair.counts.skipped += 1;
                    pair.watermark.complete(seq);
                }
                Ok(false) => {
                    seqs.insert(record.id.clone(), seq);
                    live.push(record);
                }
                Err(e) => {
                    self.record_failed(spec, pair.direction, &record.id, &mut pair.counts, e.to_string());
                }
            }
        }
        (live, seqs)
    }

    async fn process_work(
        &self,
        spec: &MappingSpec,
        item: &Work,
        p2m: &mut PairProgress,
        m2p: &mut PairProgress,
        final_pass: bool,
    ) -> Step {
        match item {
            Work::Single(direction, record) => {
                let pair = match direction {
                    Direction::PrimaryToMirror => p2m,
                    Direction::MirrorToPrimary => m2p,
                };
                self.translate_and_write(spec, *direction, record, &mut pair.counts, final_pass)
                    .await
            }
            Work::Conflict(conflict) => {
                self.process_conflict(spec, conflict, p2m, m2p, final_pass)
                    .await
            }
        }
    }

    async fn process_conflict(
        &self,
        spec: &MappingSpec,
        conflict: &Conflict,
        p2m: &mut PairProgress,
        m2p: &mut PairProgress,
        final_pass: bool,
    ) -> Step {
        let resolution = match ConflictResolver::resolve(conflict, spec, &self.ctx.identity) {
            Ok(resolution) => resolution,
            Err(e @ TranslateError::UnresolvedReference { .. }) if !final_pass => {
                debug!(entity = %spec.name, primary_id = %conflict.primary.id, reason = %e, "deferring conflict");
                return Step::Deferred;
            }
            Err(e) => {
                let error = format!("conflict resolution failed: {e}");
                self.record_failed(spec, Direction::PrimaryToMirror, &conflict.primary.id, &mut p2m.counts, error.clone());
                return self.record_failed(spec, Direction::MirrorToPrimary, &conflict.mirror.id, &mut m2p.counts, error);
            }
        };

        p2m.counts.conflicted += 1;
        m2p.counts.conflicted += 1;
        note_field_errors(
            spec,
            Direction::MirrorToPrimary,
            &conflict.mirror.id,
            &resolution.field_errors,
            &mut m2p.counts,
        );
        if let Err(e) = ConflictResolver::record(&self.ctx.db, Some(&self.run_id), conflict, &resolution) {
            warn!(entity = %spec.name, error = %e, "failed to log conflict resolution");
        }
        self.ctx.events.dispatch(&SyncEvent::ConflictResolved {
            entity: spec.name.clone(),
            primary_id: resolution.primary_id.clone(),
            mirror_id: resolution.mirror_id.clone(),
            outcome: resolution.outcome,
        });

        if resolution.outcome == ResolutionOutcome::BothDeleted {
            if let Err(e) = self.ctx.identity.forget(&spec.name, &resolution.primary_id) {
                warn!(entity = %spec.name, error = %e, "failed to drop identity pair");
            }
            p2m.counts.skipped += 1;
            m2p.counts.skipped += 1;
            return Step::Done;
        }

        for target in resolution.writes() {
            let (direction, counts) = match target.side {
                Side::Primary => (Direction::MirrorToPrimary, &mut m2p.counts),
                Side::Mirror => (Direction::PrimaryToMirror, &mut p2m.counts),
            };
            counts.translated += 1;
            match self.write(spec, direction, &target.source_id, target, counts).await {
                Step::Done => {}
                other => return other,
            }
        }
        Step::Done
    }

    fn finish_pair(&self, report: &PairReport) {
        let counts = &report.counts;
        match report.status {
            PairStatus::Succeeded | PairStatus::Stale | PairStatus::Cancelled => info!(
                entity = %report.entity,
                direction = %report.direction,
                status = %report.status,
                fetched = counts.fetched,
                applied = counts.applied,
                skipped = counts.skipped,
                conflicted = counts.conflicted,
                cursor = %report.cursor_after,
                "pair finished"
            ),
            PairStatus::Degraded | PairStatus::Failed => warn!(
                entity = %report.entity,
                direction = %report.direction,
                status = %report.status,
                fetched = counts.fetched,
                applied = counts.applied,
                failed = counts.failed,
                cursor = %report.cursor_after,
                error = report.error.as_deref().unwrap_or(""),
                "pair finished with failures"
            ),
        }

        if matches!(report.status, PairStatus::Failed | PairStatus::Degraded) {
            let details = format!(
                "{} {}: {} failed records, cursor at {}{}",
                report.direction,
                report.status,
                counts.failed,
                report.cursor_after,
                report
                    .error
                    .as_deref()
                    .map(|e| format!(" ({e})"))
                    .unwrap_or_default()
            );
            if let Err(e) = self
                .ctx
                .db
                .insert_audit_log("pair_failed", Some(&report.entity), Some(&details), false)
            {
                warn!(error = %e, "failed to write audit entry");
            }
        }

        self.ctx.events.dispatch(&SyncEvent::PairFinished {
            entity: report.entity.clone(),
            direction: report.direction,
            status: report.status,
            applied: counts.applied,
            failed: counts.failed,
        });
    }
}

/// The (side, id) of every source record behind a work item.
fn item_ids(item: &Work) -> Vec<(Side, &str)> {
    match item {
        Work::Single(direction, record) => vec![(direction.source(), record.id.as_str())],
        Work::Conflict(c) => vec![
            (Side::Primary, c.primary.id.as_str()),
            (Side::Mirror, c.mirror.id.as_str()),
        ],
    }
}

fn note_field_errors(
    spec: &MappingSpec,
    direction: Direction,
    record_id: &str,
    errors: &[FieldError],
    counts: &mut EntityCounts,
) {
    counts.field_errors += errors.len() as u64;
    for e in errors {
        warn!(
            entity = %spec.name,
            %direction,
            record_id,
            field = %e.field,
            kind = %e.kind,
            detail = %e.detail,
            "field not synced"
        );
    }
}

/// Feed pages from `fetcher` into `tx` until the feed ends, the receiver
/// goes away, or `cancel` is set. Returns whether it stopped on `cancel`.
async fn pump_batches(
    mut fetcher: ChangeFetcher,
    tx: mpsc::Sender<Result<Vec<SourceRecord>, StoreError>>,
    cancel: Arc<AtomicBool>,
) -> bool {
    loop {
        if cancel.load(Ordering::SeqCst) {
            debug!("cancelled, no further fetches");
            return true;
        }
        match fetcher.next_page().await {
            Ok(Some(batch)) => {
                if tx.send(Ok(batch)).await.is_err() {
                    return false;
                }
            }
            Ok(None) => return false,
            Err(e) => {
                let _ = tx.send(Err(e)).await;
                return false;
            }
        }
    }
}
