//! Persisted per-(entity, direction) sync watermarks.
//!
//! The cursor store is the only record of sync progress. Advances are
//! compare-and-swap on the generation counter, so two runs racing on the
//! same pair cannot both move it.

use std::collections::BTreeMap;
use std::sync::Arc;

use tracing::{debug, warn};

use crate::db::queries::AdvanceOutcome;
use crate::db::Database;
use crate::errors::CursorError;
use crate::models::{Cursor, Direction};

#[derive(Clone)]
pub struct CursorStore {
    db: Arc<Database>,
}

impl CursorStore {
    pub fn new(db: Arc<Database>) -> Self {
        Self { db }
    }

    /// Current cursor for a pair; the epoch cursor if the pair never synced.
    pub fn get(&self, entity: &str, direction: Direction) -> Result<Cursor, CursorError> {
        Ok(self
            .db
            .get_cursor(entity, direction)?
            .unwrap_or_else(Cursor::epoch))
    }

    /// Move the pair's cursor to `new`'s position.
    ///
    /// `expected` is the cursor read at the start of the run; if its
    /// generation no longer matches the stored one the call fails with
    /// [`CursorError::Stale`]. Returns the stored cursor afterwards, which
    /// is unchanged when `new` is not ahead of it.
    pub fn advance(
        &self,
        entity: &str,
        direction: Direction,
        expected: &Cursor,
        new: &Cursor,
    ) -> Result<Cursor, CursorError> {
        match self
            .db
            .advance_cursor(entity, direction, expected.generation, new)?
        {
            AdvanceOutcome::Advanced(cursor) => Ok(cursor),
            AdvanceOutcome::Unchanged(cursor) => {
                debug!(entity, %direction, stored = %cursor, requested = %new, "cursor not advanced");
                Ok(cursor)
            }
            AdvanceOutcome::GenerationMismatch { stored } => {
                warn!(
                    entity,
                    %direction,
                    expected = expected.generation,
                    stored,
                    "cursor was advanced by another run"
                );
                Err(CursorError::Stale {
                    entity: entity.to_string(),
                    direction: direction.to_string(),
                    expected: expected.generation,
                    stored,
                })
            }
        }
    }
}

/// In-run progress of one pair: tracks which fetched records are done and
/// exposes the furthest position such that it and everything before it is
/// done. Records are registered in fetch order; they may complete in any
/// order.
#[derive(Debug, Default)]
pub struct Watermark {
    next_seq: u64,
    pending: BTreeMap<u64, (Cursor, bool)>,
    frontier: Option<Cursor>,
}

impl Watermark {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register the next fetched record; returns its sequence number.
    pub fn push(&mut self, position: Cursor) -> u64 {
        let seq = self.next_seq;
        self.next_seq += 1;
        self.pending.insert(seq, (position, false));
        seq
    }

    /// Mark a registered record as durably handled.
    pub fn complete(&mut self, seq: u64) {
        if let Some(entry) = self.pending.get_mut(&seq) {
            entry.1 = true;
        }
        while let Some(entry) = self.pending.first_entry() {
            if !entry.get().1 {
                break;
            }
            let (position, _) = entry.remove();
            self.frontier = Some(position);
        }
    }

    /// Furthest safe position, `None` while the first record is unfinished.
    pub fn frontier(&self) -> Option<&Cursor> {
        self.frontier.as_ref()
    }

    /// Records registered but not yet complete (failed or still deferred).
    pub fn outstanding(&self) -> usize {
        self.pending.values().filter(|(_, done)| !done).count()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn store() -> CursorStore {
        let db = Database::in_memory().unwrap();
        db.initialize().unwrap();
        CursorStore::new(Arc::new(db))
    }

    #[test]
    fn test_get_defaults_to_epoch() {
        let cursors = store();
        assert_eq!(
            cursors.get("Contact", Direction::PrimaryToMirror).unwrap(),
            Cursor::epoch()
        );
    }

    #[test]
    fn test_advance_chain_uses_returned_generation() {
        let cursors = store();
        let start = cursors.get("Contact", Direction::PrimaryToMirror).unwrap();
        let first = cursors
            .advance("Contact", Direction::PrimaryToMirror, &start, &Cursor::at(10, "a"))
            .unwrap();
        let second = cursors
            .advance("Contact", Direction::PrimaryToMirror, &first, &Cursor::at(20, "b"))
            .unwrap();
        assert_eq!(second.generation, 2);
        assert_eq!(second.timestamp, 20);
    }

    #[test]
    fn test_stale_generation_is_rejected() {
        let cursors = store();
        let start = cursors.get("Contact", Direction::PrimaryToMirror).unwrap();
        cursors
            .advance("Contact", Direction::PrimaryToMirror, &start, &Cursor::at(10, "a"))
            .unwrap();

        let err = cursors
            .advance("Contact", Direction::PrimaryToMirror, &start, &Cursor::at(30, "c"))
            .unwrap_err();
        assert!(matches!(
            err,
            CursorError::Stale { expected: 0, stored: 1, .. }
        ));
    }

    #[test]
    fn test_backward_advance_is_noop() {
        let cursors = store();
        let start = cursors.get("Contact", Direction::MirrorToPrimary).unwrap();
        let at = cursors
            .advance("Contact", Direction::MirrorToPrimary, &start, &Cursor::at(10, "b"))
            .unwrap();
        let after = cursors
            .advance("Contact", Direction::MirrorToPrimary, &at, &Cursor::at(10, "a"))
            .unwrap();
        assert_eq!(after, at);
    }

    #[test]
    fn test_watermark_stops_before_first_unfinished() {
        let mut wm = Watermark::new();
        let a = wm.push(Cursor::at(1, "a"));
        let b = wm.push(Cursor::at(2, "b"));
        let c = wm.push(Cursor::at(3, "c"));
        assert!(wm.frontier().is_none());

        wm.complete(c);
        assert!(wm.frontier().is_none());
        wm.complete(a);
        assert_eq!(wm.frontier(), Some(&Cursor::at(1, "a")));
        assert_eq!(wm.outstanding(), 1);

        wm.complete(b);
        assert_eq!(wm.frontier(), Some(&Cursor::at(3, "c")));
        assert_eq!(wm.outstanding(), 0);
    }
}
