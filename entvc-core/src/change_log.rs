//! Append-only change log
//!
//! Rows in `change` are written once and never updated. A deletion is a
//! change pointing at the tombstone snapshot.

use crate::backend::{Backend, Row, text_at};
use crate::clock::Clock;
use crate::error::{EngineError, Result};
use crate::object::{Change, EntityKey, SnapshotId};
use crate::schema_registry::SchemaRegistry;
use crate::snapshot::SnapshotStore;
use tracing::debug;

/// Input for [`ChangeLog::append`]
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct NewChange {
    pub key: EntityKey,
    pub schema_version: String,
    pub plugin_key: String,
    /// `None` records a deletion
    pub content: Option<Vec<u8>>,
}

impl NewChange {
    pub fn upsert(
        key: EntityKey,
        schema_version: impl Into<String>,
        plugin_key: impl Into<String>,
        content: impl Into<Vec<u8>>,
    ) -> Self {
        Self {
            key,
            schema_version: schema_version.into(),
            plugin_key: plugin_key.into(),
            content: Some(content.into()),
        }
    }

    pub fn tombstone(
        key: EntityKey,
        schema_version: impl Into<String>,
        plugin_key: impl Into<String>,
    ) -> Self {
        Self {
            key,
            schema_version: schema_version.into(),
            plugin_key: plugin_key.into(),
            content: None,
        }
    }
}

pub(crate) const CHANGE_COLUMNS: &str =
    "id, entity_id, file_id, schema_key, schema_version, plugin_key, snapshot_id, created_at";

/// Change columns qualified with a table alias
pub(crate) fn change_columns(alias: &str) -> String {
    CHANGE_COLUMNS
        .split(", ")
        .map(|c| format!("{alias}.{c}"))
        .collect::<Vec<_>>()
        .join(", ")
}

pub(crate) fn change_from_row(row: &Row, offset: usize) -> Result<Change> {
    let raw_snapshot = text_at(row, offset + 6, "snapshot_id")?;
    let snapshot_id = SnapshotId::parse(&raw_snapshot).ok_or_else(|| {
        EngineError::StorageTransaction(format!("malformed snapshot id '{raw_snapshot}'"))
    })?;
    Ok(Change {
        id: text_at(row, offset, "id")?,
        entity_id: text_at(row, offset + 1, "entity_id")?,
        file_id: text_at(row, offset + 2, "file_id")?,
        schema_key: text_at(row, offset + 3, "schema_key")?,
        schema_version: text_at(row, offset + 4, "schema_version")?,
        plugin_key: text_at(row, offset + 5, "plugin_key")?,
        snapshot_id,
        created_at: text_at(row, offset + 7, "created_at")?,
    })
}

/// View of the change log over one backend
pub struct ChangeLog<'a> {
    backend: &'a dyn Backend,
    snapshots: &'a SnapshotStore,
}

impl<'a> ChangeLog<'a> {
    pub fn new(backend: &'a dyn Backend, snapshots: &'a SnapshotStore) -> Self {
        Self { backend, snapshots }
    }

    /// Validate, store the snapshot and append an immutable change row
    ///
    /// Nothing is written when validation fails.
    pub fn append(&self, clock: &mut Clock, input: &NewChange) -> Result<Change> {
        let snapshot_id = match &input.content {
            Some(content) => {
                SchemaRegistry::new(self.backend).validate(
                    &input.key.schema_key,
                    &input.schema_version,
                    content,
                )?;
                self.snapshots.put(self.backend, content)?
            }
            None => SnapshotId::tombstone(),
        };

        let change = Change {
            id: clock.new_id(),
            entity_id: input.key.entity_id.clone(),
            file_id: input.key.file_id.clone(),
            schema_key: input.key.schema_key.clone(),
            schema_version: input.schema_version.clone(),
            plugin_key: input.plugin_key.clone(),
            snapshot_id,
            created_at: clock.now(),
        };

        self.backend.execute(
            "INSERT INTO change (id, seq, entity_id, file_id, schema_key, schema_version, \
             plugin_key, snapshot_id, created_at) \
             VALUES (?1, (SELECT COALESCE(MAX(seq), 0) + 1 FROM change), ?2, ?3, ?4, ?5, ?6, ?7, ?8)",
            &[
                change.id.as_str().into(),
                change.entity_id.as_str().into(),
                change.file_id.as_str().into(),
                change.schema_key.as_str().into(),
                change.schema_version.as_str().into(),
                change.plugin_key.as_str().into(),
                change.snapshot_id.as_str().into(),
                change.created_at.as_str().into(),
            ],
        )?;

        debug!(
            change_id = %change.id,
            entity = %change.key(),
            tombstone = change.is_tombstone(),
            "appended change"
        );
        Ok(change)
    }

    pub fn get(&self, id: &str) -> Result<Change> {
        let sql = format!("SELECT {CHANGE_COLUMNS} FROM change WHERE id = ?1");
        let result = self.backend.execute(&sql, &[id.into()])?;
        let row = result
            .first()
            .ok_or_else(|| EngineError::not_found("change", id))?;
        change_from_row(row, 0)
    }

    /// All changes ever recorded for one entity, in append order
    pub fn for_entity(&self, key: &EntityKey) -> Result<Vec<Change>> {
        let sql = format!(
            "SELECT {CHANGE_COLUMNS} FROM change \
             WHERE entity_id = ?1 AND file_id = ?2 AND schema_key = ?3 ORDER BY seq"
        );
        let result = self.backend.execute(
            &sql,
            &[
                key.entity_id.as_str().into(),
                key.file_id.as_str().into(),
                key.schema_key.as_str().into(),
            ],
        )?;
        result.rows.iter().map(|row| change_from_row(row, 0)).collect()
    }

    /// Content of a change, `None` for a tombstone
    pub fn content(&self, change: &Change) -> Result<Option<Vec<u8>>> {
        if change.is_tombstone() {
            return Ok(None);
        }
        let bytes = self.snapshots.get(self.backend, &change.snapshot_id)?;
        Ok(Some(bytes.as_ref().clone()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::backend::SqliteBackend;
    use crate::schema;
    use crate::schema_registry::{EntitySchema, PropertyType};

    fn setup() -> (SqliteBackend, SnapshotStore) {
        let backend = SqliteBackend::open_in_memory().unwrap();
        schema::install(&backend).unwrap();
        SchemaRegistry::new(&backend)
            .register(&EntitySchema::new("doc", "1").property("text", PropertyType::String, true))
            .unwrap();
        (backend, SnapshotStore::new(16))
    }

    fn key() -> EntityKey {
        EntityKey::new("doc1", "file1", "doc")
    }

    #[test]
    fn test_append_and_get() {
        let (backend, snapshots) = setup();
        let log = ChangeLog::new(&backend, &snapshots);
        let mut clock = Clock::deterministic(1);
        let change = log
            .append(&mut clock, &NewChange::upsert(key(), "1", "test", br#"{"text":"Hello"}"#.to_vec()))
            .unwrap();
        assert_eq!(log.get(&change.id).unwrap(), change);
        assert_eq!(
            log.content(&change).unwrap().unwrap(),
            br#"{"text":"Hello"}"#.to_vec()
        );
    }

    #[test]
    fn test_schema_violation_writes_nothing() {
        let (backend, snapshots) = setup();
        let log = ChangeLog::new(&backend, &snapshots);
        let mut clock = Clock::deterministic(1);
        let err = log
            .append(&mut clock, &NewChange::upsert(key(), "1", "test", br#"{"text":1}"#.to_vec()))
            .unwrap_err();
        assert!(matches!(err, EngineError::SchemaValidation { .. }));
        assert!(log.for_entity(&key()).unwrap().is_empty());
        let orphan = SnapshotId::from_content(br#"{"text":1}"#);
        assert!(!snapshots.exists(&backend, &orphan).unwrap());
    }

    #[test]
    fn test_tombstone_skips_validation() {
        let (backend, snapshots) = setup();
        let log = ChangeLog::new(&backend, &snapshots);
        let mut clock = Clock::deterministic(1);
        let change = log
            .append(&mut clock, &NewChange::tombstone(key(), "1", "test"))
            .unwrap();
        assert!(change.is_tombstone());
        assert_eq!(log.content(&change).unwrap(), None);
    }

    #[test]
    fn test_history_in_append_order() {
        let (backend, snapshots) = setup();
        let log = ChangeLog::new(&backend, &snapshots);
        let mut clock = Clock::deterministic(1);
        let first = log
            .append(&mut clock, &NewChange::upsert(key(), "1", "test", br#"{"text":"a"}"#.to_vec()))
            .unwrap();
        let second = log
            .append(&mut clock, &NewChange::tombstone(key(), "1", "test"))
            .unwrap();
        let history = log.for_entity(&key()).unwrap();
        assert_eq!(history, vec![first, second]);
    }

    #[test]
    fn test_missing_change() {
        let (backend, snapshots) = setup();
        let log = ChangeLog::new(&backend, &snapshots);
        assert!(matches!(log.get("nope"), Err(EngineError::NotFound { kind: "change", .. })));
    }
}
