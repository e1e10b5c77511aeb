//! Replication surface for an external sync collaborator
//!
//! Only the tables listed in [`SYNC_TABLES`] are eligible for replication.
//! The state cache is derived and is rebuilt on the receiving side.

use crate::backend::{Backend, int_at};
use crate::change_log::{change_columns, change_from_row};
use crate::error::{EngineError, Result};
use crate::object::Change;
use serde::{Deserialize, Serialize};

/// Tables a sync transport may copy between replicas
pub const SYNC_TABLES: &[&str] = &[
    "snapshot",
    "change",
    "change_set",
    "change_set_element",
    "commit",
    "commit_edge",
    "version",
];

pub fn is_sync_table(name: &str) -> bool {
    SYNC_TABLES.contains(&name)
}

/// Page of changes returned by [`changes_since`]
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ChangeBatch {
    pub changes: Vec<Change>,
    /// Cursor to pass to the next call; equal to the input when nothing is new
    pub next_cursor: i64,
}

/// Changes appended after `cursor`, in append order, at most `limit`
pub fn changes_since(backend: &dyn Backend, cursor: i64, limit: usize) -> Result<ChangeBatch> {
    if limit == 0 {
        return Err(EngineError::InvalidOperation(
            "changes_since limit must be positive".to_string(),
        ));
    }
    let sql = format!(
        "SELECT c.seq, {} FROM change c WHERE c.seq > ?1 ORDER BY c.seq LIMIT ?2",
        change_columns("c")
    );
    let result = backend.execute(&sql, &[cursor.into(), (limit as i64).into()])?;

    let mut next_cursor = cursor;
    let mut changes = Vec::with_capacity(result.rows.len());
    for row in &result.rows {
        next_cursor = int_at(row, 0, "seq")?;
        changes.push(change_from_row(row, 1)?);
    }
    Ok(ChangeBatch {
        changes,
        next_cursor,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::backend::SqliteBackend;
    use crate::change_log::{ChangeLog, NewChange};
    use crate::clock::Clock;
    use crate::object::EntityKey;
    use crate::schema;
    use crate::snapshot::SnapshotStore;

    #[test]
    fn test_allow_list() {
        assert!(is_sync_table("change"));
        assert!(is_sync_table("commit_edge"));
        assert!(!is_sync_table("state_cache"));
        assert!(!is_sync_table("engine_meta"));
    }

    #[test]
    fn test_changes_since_pages_in_order() {
        let backend = SqliteBackend::open_in_memory().unwrap();
        schema::install(&backend).unwrap();
        let snapshots = SnapshotStore::new(0);
        let log = ChangeLog::new(&backend, &snapshots);
        let mut clock = Clock::deterministic(4);
        let mut appended = Vec::new();
        for i in 0..5 {
            let key = EntityKey::new(format!("e{i}"), "f", "doc");
            appended.push(log.append(&mut clock, &NewChange::tombstone(key, "1", "p")).unwrap());
        }

        let first = changes_since(&backend, 0, 3).unwrap();
        assert_eq!(first.changes, appended[..3].to_vec());
        let second = changes_since(&backend, first.next_cursor, 3).unwrap();
        assert_eq!(second.changes, appended[3..].to_vec());
        let empty = changes_since(&backend, second.next_cursor, 3).unwrap();
        assert!(empty.changes.is_empty());
        assert_eq!(empty.next_cursor, second.next_cursor);

        assert!(changes_since(&backend, 0, 0).is_err());
    }
}
