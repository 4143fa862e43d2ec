//! mirrorsync core library.
//!
//! This crate provides the building blocks for keeping a document store (the
//! primary) and a relational store (the mirror) in step in both directions:
//! configuration, the mapping registry, database persistence for cursors and
//! identities, store clients, translation, conflict resolution, and the sync
//! engine that drives them.

pub mod applier;
pub mod config;
pub mod conflict;
pub mod cursor;
pub mod db;
pub mod errors;
pub mod events;
pub mod fetcher;
pub mod identity;
pub mod models;
pub mod retry;
pub mod schema;
pub mod store;
pub mod sync_engine;
pub mod translator;

// Re-exports for convenience.
pub use config::AppConfig;
pub use db::Database;
pub use events::{EventDispatcher, EventKind, SyncEvent};
pub use identity::IdentityMap;
pub use models::{Direction, PairStatus, RunDirection, RunStatus, SyncRun};
pub use schema::SchemaRegistry;
pub use store::{StoreClient, StorePair};
pub use sync_engine::{RunOptions, SyncEngine};
