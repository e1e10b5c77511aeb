//! EntVC Core Library
//!
//! Embedded change-control engine for structured file content:
//! - Content-addressed snapshot store and append-only change log
//! - Change sets collapsing changes to one per entity
//! - Commit DAG with breadth-first traversal, LCA and three-way merge
//! - Versions (branches) with optional inheritance
//! - State cache materialized from the log, with staleness tracking
//! - Plugin protocol routing file paths to change detectors
//! - Deterministic clock for reproducible ids and timestamps
//! - SQLite storage backend using rusqlite (WAL mode)

pub mod backend;
pub mod change_log;
pub mod change_set;
pub mod clock;
pub mod config;
pub mod engine;
pub mod error;
pub mod graph;
pub mod merge;
pub mod object;
pub mod plugin;
pub mod schema;
pub mod schema_registry;
pub mod snapshot;
pub mod state;
pub mod sync;
pub mod version;

pub use backend::{Backend, QueryResult, Row, SqliteBackend, Value};
pub use change_log::{ChangeLog, NewChange};
pub use change_set::ChangeSets;
pub use clock::Clock;
pub use config::{CacheReadPolicy, ClockConfig, ClockMode, EngineConfig};
pub use engine::{Engine, FileWrite, FileWriteOutcome, FileWriteReport, HistoryEntry, MAIN_VERSION};
pub use error::{EngineError, Result};
pub use graph::CommitGraph;
pub use merge::{
    Conflict, ConflictChoice, ConflictKind, ConflictResolution, MergePlan, MergePlanner, MergeResult,
};
pub use object::{
    Change, ChangeSetElement, Commit, EntityKey, ResolvedEntity, SnapshotId, StateRow, Version,
    TOMBSTONE_SNAPSHOT_ID,
};
pub use plugin::text::TextLinePlugin;
pub use plugin::{ChangePlugin, DetectedChange, GlobPattern, PluginError, PluginRegistry};
pub use schema_registry::{EntitySchema, PropertyType, SchemaRegistry};
pub use snapshot::SnapshotStore;
pub use state::{RebuildOutcome, StateMaterializer};
pub use sync::{ChangeBatch, SYNC_TABLES};
pub use version::Versions;
