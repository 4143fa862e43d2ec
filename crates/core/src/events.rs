//! Sync events and the kind-keyed handler table they are dispatched through.
//!
//! The engine emits a [`SyncEvent`] at each notable point of a run. Callers
//! (the daemon, tests) register plain closures per [`EventKind`]; a handler
//! only ever sees events of the kinds it registered for.

use std::collections::HashMap;

use serde::Serialize;
use tracing::debug;

use crate::conflict::ResolutionOutcome;
use crate::models::{Direction, PairStatus, RunStatus, WriteOutcome};

/// Everything the engine reports while it runs.
#[derive(Debug, Clone, Serialize)]
#[serde(tag = "event", rename_all = "snake_case")]
pub enum SyncEvent {
    RecordApplied {
        entity: String,
        direction: Direction,
        record_id: String,
        outcome: WriteOutcome,
    },
    RecordFailed {
        entity: String,
        direction: Direction,
        record_id: String,
        error: String,
    },
    ConflictResolved {
        entity: String,
        primary_id: String,
        mirror_id: String,
        outcome: ResolutionOutcome,
    },
    PairFinished {
        entity: String,
        direction: Direction,
        status: PairStatus,
        applied: u64,
        failed: u64,
    },
    RunFinished {
        run_id: String,
        status: RunStatus,
    },
}

/// Discriminant of [`SyncEvent`], used as the handler table key.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum EventKind {
    RecordApplied,
    RecordFailed,
    ConflictResolved,
    PairFinished,
    RunFinished,
}

impl EventKind {
    pub const ALL: [EventKind; 5] = [
        Self::RecordApplied,
        Self::RecordFailed,
        Self::ConflictResolved,
        Self::PairFinished,
        Self::RunFinished,
    ];
}

impl std::fmt::Display for EventKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::RecordApplied => write!(f, "record_applied"),
            Self::RecordFailed => write!(f, "record_failed"),
            Self::ConflictResolved => write!(f, "conflict_resolved"),
            Self::PairFinished => write!(f, "pair_finished"),
            Self::RunFinished => write!(f, "run_finished"),
        }
    }
}

impl SyncEvent {
    pub fn kind(&self) -> EventKind {
        match self {
            Self::RecordApplied { .. } => EventKind::RecordApplied,
            Self::RecordFailed { .. } => EventKind::RecordFailed,
            Self::ConflictResolved { .. } => EventKind::ConflictResolved,
            Self::PairFinished { .. } => EventKind::PairFinished,
            Self::RunFinished { .. } => EventKind::RunFinished,
        }
    }
}

pub type EventHandler = Box<dyn Fn(&SyncEvent) + Send + Sync>;

/// Handler table. Handlers run synchronously on the emitting task, in
/// registration order, so they should be quick.
#[derive(Default)]
pub struct EventDispatcher {
    handlers: HashMap<EventKind, Vec<EventHandler>>,
}

impl EventDispatcher {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn on(&mut self, kind: EventKind, handler: impl Fn(&SyncEvent) + Send + Sync + 'static) {
        self.handlers.entry(kind).or_default().push(Box::new(handler));
    }

    pub fn handler_count(&self, kind: EventKind) -> usize {
        self.handlers.get(&kind).map_or(0, Vec::len)
    }

    pub fn dispatch(&self, event: &SyncEvent) {
        let kind = event.kind();
        let Some(handlers) = self.handlers.get(&kind) else {
            return;
        };
        debug!(%kind, handlers = handlers.len(), "dispatching event");
        for handler in handlers {
            handler(event);
        }
    }
}

impl std::fmt::Debug for EventDispatcher {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let counts: HashMap<String, usize> = self
            .handlers
            .iter()
            .map(|(k, v)| (k.to_string(), v.len()))
            .collect();
        f.debug_struct("EventDispatcher").field("handlers", &counts).finish()
    }
}
