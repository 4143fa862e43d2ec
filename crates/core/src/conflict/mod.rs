//! Conflict handling for bidirectional runs.
//!
//! 1. **Detection** -- pairing primary and mirror changes that touch the same
//!    logical record.
//! 2. **Resolution** -- field-level last-write-wins, with deletes winning
//!    over modifications, and an audit row per resolution.

pub mod detector;
pub mod resolver;

pub use detector::{ChangeSet, Conflict, ConflictDetector, ConflictType};
pub use resolver::{ConflictResolver, FieldDecision, Resolution, ResolutionOutcome};
