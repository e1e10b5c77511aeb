//! Change-set builder
//!
//! A change set holds at most one element per entity key: recording a newer
//! change for the same key replaces the element. Once a commit references a
//! change set it is final and rejects further records.

use crate::backend::{Backend, Row, text_at};
use crate::change_log::{change_columns, change_from_row};
use crate::clock::Clock;
use crate::error::{EngineError, Result};
use crate::object::{Change, ChangeSetElement, EntityKey};

fn element_from_row(row: &Row) -> Result<ChangeSetElement> {
    Ok(ChangeSetElement {
        change_set_id: text_at(row, 0, "change_set_id")?,
        change_id: text_at(row, 1, "change_id")?,
        entity_id: text_at(row, 2, "entity_id")?,
        file_id: text_at(row, 3, "file_id")?,
        schema_key: text_at(row, 4, "schema_key")?,
    })
}

pub struct ChangeSets<'a> {
    backend: &'a dyn Backend,
}

impl<'a> ChangeSets<'a> {
    pub fn new(backend: &'a dyn Backend) -> Self {
        Self { backend }
    }

    /// Create an empty, open change set
    pub fn create(&self, clock: &mut Clock) -> Result<String> {
        let id = clock.new_id();
        self.backend
            .execute("INSERT INTO change_set (id) VALUES (?1)", &[id.as_str().into()])?;
        Ok(id)
    }

    pub fn exists(&self, id: &str) -> Result<bool> {
        let result = self
            .backend
            .execute("SELECT 1 FROM change_set WHERE id = ?1", &[id.into()])?;
        Ok(!result.is_empty())
    }

    /// Whether a commit already finalized this change set
    pub fn is_finalized(&self, id: &str) -> Result<bool> {
        let result = self.backend.execute(
            "SELECT 1 FROM \"commit\" WHERE change_set_id = ?1",
            &[id.into()],
        )?;
        Ok(!result.is_empty())
    }

    /// Upsert the element for the change's entity key (latest wins)
    pub fn record(&self, change_set_id: &str, change: &Change) -> Result<()> {
        if !self.exists(change_set_id)? {
            return Err(EngineError::not_found("change set", change_set_id));
        }
        if self.is_finalized(change_set_id)? {
            return Err(EngineError::InvalidOperation(format!(
                "change set {change_set_id} is already committed"
            )));
        }
        self.backend.execute(
            "INSERT INTO change_set_element (change_set_id, change_id, entity_id, file_id, schema_key) \
             VALUES (?1, ?2, ?3, ?4, ?5) \
             ON CONFLICT (change_set_id, entity_id, file_id, schema_key) \
             DO UPDATE SET change_id = excluded.change_id",
            &[
                change_set_id.into(),
                change.id.as_str().into(),
                change.entity_id.as_str().into(),
                change.file_id.as_str().into(),
                change.schema_key.as_str().into(),
            ],
        )?;
        Ok(())
    }

    /// Elements ordered by entity key
    pub fn elements(&self, change_set_id: &str) -> Result<Vec<ChangeSetElement>> {
        let result = self.backend.execute(
            "SELECT change_set_id, change_id, entity_id, file_id, schema_key \
             FROM change_set_element WHERE change_set_id = ?1 \
             ORDER BY entity_id, file_id, schema_key",
            &[change_set_id.into()],
        )?;
        result.rows.iter().map(element_from_row).collect()
    }

    /// Full change rows of every element, ordered by entity key
    pub fn changes(&self, change_set_id: &str) -> Result<Vec<Change>> {
        let columns = change_columns("c");
        let sql = format!(
            "SELECT {columns} FROM change_set_element e JOIN change c ON c.id = e.change_id \
             WHERE e.change_set_id = ?1 ORDER BY e.entity_id, e.file_id, e.schema_key"
        );
        let result = self.backend.execute(&sql, &[change_set_id.into()])?;
        result.rows.iter().map(|row| change_from_row(row, 0)).collect()
    }

    /// Change for one key within a set, if the set touches it
    pub fn change_for(&self, change_set_id: &str, key: &EntityKey) -> Result<Option<Change>> {
        let columns = change_columns("c");
        let sql = format!(
            "SELECT {columns} FROM change_set_element e JOIN change c ON c.id = e.change_id \
             WHERE e.change_set_id = ?1 AND e.entity_id = ?2 AND e.file_id = ?3 AND e.schema_key = ?4"
        );
        let result = self.backend.execute(
            &sql,
            &[
                change_set_id.into(),
                key.entity_id.as_str().into(),
                key.file_id.as_str().into(),
                key.schema_key.as_str().into(),
            ],
        )?;
        result.first().map(|row| change_from_row(row, 0)).transpose()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::backend::SqliteBackend;
    use crate::change_log::{ChangeLog, NewChange};
    use crate::schema;
    use crate::schema_registry::{EntitySchema, SchemaRegistry};
    use crate::snapshot::SnapshotStore;

    fn setup() -> (SqliteBackend, SnapshotStore, Clock) {
        let backend = SqliteBackend::open_in_memory().unwrap();
        schema::install(&backend).unwrap();
        SchemaRegistry::new(&backend)
            .register(&EntitySchema::new("doc", "1"))
            .unwrap();
        (backend, SnapshotStore::new(0), Clock::deterministic(5))
    }

    #[test]
    fn test_record_supersedes_per_key() {
        let (backend, snapshots, mut clock) = setup();
        let sets = ChangeSets::new(&backend);
        let log = ChangeLog::new(&backend, &snapshots);
        let cs = sets.create(&mut clock).unwrap();

        let key = EntityKey::new("e1", "f", "doc");
        let first = log
            .append(&mut clock, &NewChange::upsert(key.clone(), "1", "p", b"{\"v\":1}".to_vec()))
            .unwrap();
        let second = log
            .append(&mut clock, &NewChange::upsert(key.clone(), "1", "p", b"{\"v\":2}".to_vec()))
            .unwrap();
        sets.record(&cs, &first).unwrap();
        sets.record(&cs, &second).unwrap();

        let elements = sets.elements(&cs).unwrap();
        assert_eq!(elements.len(), 1);
        assert_eq!(elements[0].change_id, second.id);
        assert_eq!(sets.change_for(&cs, &key).unwrap(), Some(second));
        // superseded change stays in the log
        assert!(log.get(&first.id).is_ok());
    }

    #[test]
    fn test_distinct_keys_coexist() {
        let (backend, snapshots, mut clock) = setup();
        let sets = ChangeSets::new(&backend);
        let log = ChangeLog::new(&backend, &snapshots);
        let cs = sets.create(&mut clock).unwrap();
        for entity in ["a", "b"] {
            let change = log
                .append(
                    &mut clock,
                    &NewChange::upsert(EntityKey::new(entity, "f", "doc"), "1", "p", b"{}".to_vec()),
                )
                .unwrap();
            sets.record(&cs, &change).unwrap();
        }
        assert_eq!(sets.changes(&cs).unwrap().len(), 2);
        assert!(sets.change_for(&cs, &EntityKey::new("c", "f", "doc")).unwrap().is_none());
    }

    #[test]
    fn test_record_into_missing_set() {
        let (backend, snapshots, mut clock) = setup();
        let sets = ChangeSets::new(&backend);
        let change = ChangeLog::new(&backend, &snapshots)
            .append(
                &mut clock,
                &NewChange::tombstone(EntityKey::new("a", "f", "doc"), "1", "p"),
            )
            .unwrap();
        assert!(matches!(
            sets.record("missing", &change),
            Err(EngineError::NotFound { .. })
        ));
    }
}
