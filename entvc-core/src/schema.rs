//! Persisted table layout
//!
//! Table and column names of the log tables are part of the compatibility
//! surface (replication peers read them directly). Everything prefixed
//! `state_cache` is derived and may be dropped at any time.

use crate::backend::Backend;
use crate::error::{EngineError, Result};
use crate::object::TOMBSTONE_SNAPSHOT_ID;

/// Current on-disk layout version, stored in `engine_meta`
pub const FORMAT_VERSION: &str = "1";

const FORMAT_VERSION_KEY: &str = "format_version";

const STATEMENTS: &[&str] = &[
    "CREATE TABLE IF NOT EXISTS snapshot (
        id TEXT PRIMARY KEY,
        content BLOB
    )",
    "CREATE TABLE IF NOT EXISTS change (
        id TEXT PRIMARY KEY,
        seq INTEGER NOT NULL UNIQUE,
        entity_id TEXT NOT NULL,
        file_id TEXT NOT NULL,
        schema_key TEXT NOT NULL,
        schema_version TEXT NOT NULL,
        plugin_key TEXT NOT NULL,
        snapshot_id TEXT NOT NULL REFERENCES snapshot(id),
        created_at TEXT NOT NULL
    )",
    "CREATE INDEX IF NOT EXISTS change_entity_idx ON change (entity_id, file_id, schema_key)",
    "CREATE TABLE IF NOT EXISTS change_set (
        id TEXT PRIMARY KEY
    )",
    "CREATE TABLE IF NOT EXISTS change_set_element (
        change_set_id TEXT NOT NULL REFERENCES change_set(id),
        change_id TEXT NOT NULL REFERENCES change(id),
        entity_id TEXT NOT NULL,
        file_id TEXT NOT NULL,
        schema_key TEXT NOT NULL,
        PRIMARY KEY (change_set_id, entity_id, file_id, schema_key)
    )",
    "CREATE TABLE IF NOT EXISTS \"commit\" (
        id TEXT PRIMARY KEY,
        change_set_id TEXT NOT NULL UNIQUE REFERENCES change_set(id),
        created_at TEXT NOT NULL
    )",
    "CREATE TABLE IF NOT EXISTS commit_edge (
        parent_id TEXT NOT NULL REFERENCES \"commit\"(id),
        child_id TEXT NOT NULL REFERENCES \"commit\"(id),
        position INTEGER NOT NULL,
        PRIMARY KEY (parent_id, child_id)
    )",
    "CREATE INDEX IF NOT EXISTS commit_edge_child_idx ON commit_edge (child_id, position)",
    "CREATE TABLE IF NOT EXISTS version (
        id TEXT PRIMARY KEY,
        name TEXT NOT NULL UNIQUE,
        tip_commit_id TEXT NOT NULL REFERENCES \"commit\"(id),
        working_change_set_id TEXT NOT NULL REFERENCES change_set(id),
        inherits_from_version_id TEXT REFERENCES version(id)
    )",
    "CREATE TABLE IF NOT EXISTS stored_schema (
        key TEXT NOT NULL,
        version TEXT NOT NULL,
        definition TEXT NOT NULL,
        PRIMARY KEY (key, version)
    )",
    "CREATE TABLE IF NOT EXISTS engine_meta (
        key TEXT PRIMARY KEY,
        value TEXT NOT NULL
    )",
    "CREATE TABLE IF NOT EXISTS state_cache (
        version_id TEXT NOT NULL,
        entity_id TEXT NOT NULL,
        file_id TEXT NOT NULL,
        schema_key TEXT NOT NULL,
        plugin_key TEXT NOT NULL,
        snapshot_id TEXT NOT NULL,
        change_id TEXT NOT NULL,
        commit_id TEXT NOT NULL,
        inherited_from_version_id TEXT,
        is_tombstone INTEGER NOT NULL,
        PRIMARY KEY (version_id, entity_id, file_id, schema_key)
    )",
    "CREATE TABLE IF NOT EXISTS state_cache_stale (
        version_id TEXT PRIMARY KEY
    )",
    "CREATE VIEW IF NOT EXISTS state AS
        SELECT version_id, entity_id, file_id, schema_key, plugin_key, snapshot_id,
               change_id, commit_id, inherited_from_version_id
        FROM state_cache
        WHERE is_tombstone = 0",
];

/// Create every table, index and view, and seed the reserved rows
///
/// Idempotent: safe to call on every open. Fails with `InvalidOperation`
/// when the store was written with a different [`FORMAT_VERSION`].
pub fn install(backend: &dyn Backend) -> Result<()> {
    for sql in STATEMENTS {
        backend.execute(sql, &[])?;
    }
    backend.execute(
        "INSERT INTO snapshot (id, content) VALUES (?1, NULL) ON CONFLICT (id) DO NOTHING",
        &[TOMBSTONE_SNAPSHOT_ID.into()],
    )?;
    backend.execute(
        "INSERT INTO engine_meta (key, value) VALUES (?1, ?2) ON CONFLICT (key) DO NOTHING",
        &[FORMAT_VERSION_KEY.into(), FORMAT_VERSION.into()],
    )?;
    match meta_get(backend, FORMAT_VERSION_KEY)? {
        Some(found) if found != FORMAT_VERSION => Err(EngineError::InvalidOperation(format!(
            "store format version {found} is not supported (expected {FORMAT_VERSION})"
        ))),
        _ => Ok(()),
    }
}

/// Read a value from `engine_meta`
pub fn meta_get(backend: &dyn Backend, key: &str) -> Result<Option<String>> {
    let result = backend.execute("SELECT value FROM engine_meta WHERE key = ?1", &[key.into()])?;
    match result.first() {
        Some(row) => Ok(Some(crate::backend::text_at(row, 0, "value")?)),
        None => Ok(None),
    }
}

/// Upsert a value into `engine_meta`
pub fn meta_set(backend: &dyn Backend, key: &str, value: &str) -> Result<()> {
    backend.execute(
        "INSERT INTO engine_meta (key, value) VALUES (?1, ?2) \
         ON CONFLICT (key) DO UPDATE SET value = excluded.value",
        &[key.into(), value.into()],
    )?;
    Ok(())
}
