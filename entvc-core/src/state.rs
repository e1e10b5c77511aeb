//! State materializer
//!
//! The value of an entity in a version is the nearest change to it reachable
//! from the version tip: walk the commit graph breadth-first from the tip and
//! take the first commit whose change set touches the entity. If the
//! version's own history never touches it, resolution continues in the
//! version it inherits from (a tombstone in the own history stops that).
//!
//! `state_cache` stores that resolution per version. It is derived data: a
//! version listed in `state_cache_stale` has rows that must not be served,
//! and [`StateMaterializer::rebuild`] recomputes them from the log.

use crate::backend::{Backend, Row, int_at, opt_text_at, text_at};
use crate::error::{EngineError, Result};
use crate::graph::CommitGraph;
use crate::object::{EntityKey, ResolvedEntity, SnapshotId, StateRow};
use crate::version::Versions;
use std::collections::{BTreeMap, HashSet};
use tracing::{debug, info};

const STATE_COLUMNS: &str = "entity_id, file_id, schema_key, version_id, plugin_key, snapshot_id, \
     change_id, commit_id, inherited_from_version_id, is_tombstone";

const ELEMENT_JOIN: &str = "SELECT e.entity_id, e.file_id, e.schema_key, c.plugin_key, c.snapshot_id, c.id \
     FROM change_set_element e JOIN change c ON c.id = e.change_id";

fn state_from_row(row: &Row) -> Result<StateRow> {
    let raw = text_at(row, 5, "snapshot_id")?;
    Ok(StateRow {
        entity_id: text_at(row, 0, "entity_id")?,
        file_id: text_at(row, 1, "file_id")?,
        schema_key: text_at(row, 2, "schema_key")?,
        version_id: text_at(row, 3, "version_id")?,
        plugin_key: text_at(row, 4, "plugin_key")?,
        snapshot_id: SnapshotId::parse(&raw).ok_or_else(|| {
            EngineError::StorageTransaction(format!("malformed snapshot id '{raw}'"))
        })?,
        change_id: text_at(row, 6, "change_id")?,
        commit_id: text_at(row, 7, "commit_id")?,
        inherited_from_version_id: opt_text_at(row, 8, "inherited_from_version_id")?,
        is_tombstone: int_at(row, 9, "is_tombstone")? != 0,
    })
}

/// Build a state row from an element joined with its change
fn element_state(row: &Row, version_id: &str, commit_id: &str) -> Result<StateRow> {
    let raw = text_at(row, 4, "snapshot_id")?;
    let snapshot_id = SnapshotId::parse(&raw).ok_or_else(|| {
        EngineError::StorageTransaction(format!("malformed snapshot id '{raw}'"))
    })?;
    Ok(StateRow {
        entity_id: text_at(row, 0, "entity_id")?,
        file_id: text_at(row, 1, "file_id")?,
        schema_key: text_at(row, 2, "schema_key")?,
        version_id: version_id.to_string(),
        plugin_key: text_at(row, 3, "plugin_key")?,
        is_tombstone: snapshot_id.is_tombstone(),
        snapshot_id,
        change_id: text_at(row, 5, "change_id")?,
        commit_id: commit_id.to_string(),
        inherited_from_version_id: None,
    })
}

/// Result of rebuilding one version's cache
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RebuildOutcome {
    pub version_id: String,
    pub rows: usize,
    /// Rows that were marked fresh did not match the log
    pub inconsistent: bool,
    pub differing: usize,
}

pub struct StateMaterializer<'a> {
    backend: &'a dyn Backend,
}

impl<'a> StateMaterializer<'a> {
    pub fn new(backend: &'a dyn Backend) -> Self {
        Self { backend }
    }

    // ─────────────────────────────────────────────────────
    // Direct resolution from the log
    // ─────────────────────────────────────────────────────

    /// Resolve one entity by walking the log, ignoring the cache
    pub fn resolve_direct(&self, version_id: &str, key: &EntityKey) -> Result<ResolvedEntity> {
        let versions = Versions::new(self.backend);
        let mut current = Some(version_id.to_string());
        let mut visited = HashSet::new();

        while let Some(source_id) = current {
            if !visited.insert(source_id.clone()) {
                break;
            }
            let source = versions.get(&source_id)?;
            if let Some(mut row) = self.first_in_history(&source.tip_commit_id, key, version_id)? {
                if source_id != version_id {
                    row.inherited_from_version_id = Some(source_id);
                }
                return Ok(ResolvedEntity::from_row(row));
            }
            current = source.inherits_from_version_id;
        }
        Ok(ResolvedEntity::Absent)
    }

    /// Nearest change to `key` reachable from `tip`, ignoring inheritance
    pub(crate) fn first_in_history(
        &self,
        tip: &str,
        key: &EntityKey,
        version_id: &str,
    ) -> Result<Option<StateRow>> {
        let graph = CommitGraph::new(self.backend);
        let sql = format!(
            "{ELEMENT_JOIN} JOIN \"commit\" k ON k.change_set_id = e.change_set_id \
             WHERE k.id = ?1 AND e.entity_id = ?2 AND e.file_id = ?3 AND e.schema_key = ?4"
        );
        for step in graph.walk(tip) {
            let (commit_id, _) = step?;
            let result = self.backend.execute(
                &sql,
                &[
                    commit_id.as_str().into(),
                    key.entity_id.as_str().into(),
                    key.file_id.as_str().into(),
                    key.schema_key.as_str().into(),
                ],
            )?;
            if let Some(row) = result.first() {
                return Ok(Some(element_state(row, version_id, &commit_id)?));
            }
        }
        Ok(None)
    }

    /// Resolve every entity of a version from the log, tombstones included
    pub fn resolve_all_direct(&self, version_id: &str) -> Result<BTreeMap<EntityKey, StateRow>> {
        let versions = Versions::new(self.backend);
        let mut resolved: BTreeMap<EntityKey, StateRow> = BTreeMap::new();
        let mut current = Some(version_id.to_string());
        let mut visited = HashSet::new();

        while let Some(source_id) = current {
            if !visited.insert(source_id.clone()) {
                break;
            }
            let source = versions.get(&source_id)?;
            let inherited = (source_id != version_id).then(|| source_id.clone());
            for (key, mut row) in self.history_state(&source.tip_commit_id, version_id)? {
                row.inherited_from_version_id = inherited.clone();
                resolved.entry(key).or_insert(row);
            }
            current = source.inherits_from_version_id;
        }
        Ok(resolved)
    }

    /// First-match resolution of every entity touched by a tip's history
    fn history_state(&self, tip: &str, version_id: &str) -> Result<BTreeMap<EntityKey, StateRow>> {
        let graph = CommitGraph::new(self.backend);
        let sql = format!(
            "{ELEMENT_JOIN} JOIN \"commit\" k ON k.change_set_id = e.change_set_id WHERE k.id = ?1"
        );
        let mut out = BTreeMap::new();
        for step in graph.walk(tip) {
            let (commit_id, _) = step?;
            let result = self.backend.execute(&sql, &[commit_id.as_str().into()])?;
            for row in &result.rows {
                let state = element_state(row, version_id, &commit_id)?;
                out.entry(state.key()).or_insert(state);
            }
        }
        Ok(out)
    }

    // ─────────────────────────────────────────────────────
    // Cache
    // ─────────────────────────────────────────────────────

    pub fn is_stale(&self, version_id: &str) -> Result<bool> {
        let result = self.backend.execute(
            "SELECT 1 FROM state_cache_stale WHERE version_id = ?1",
            &[version_id.into()],
        )?;
        Ok(!result.is_empty())
    }

    /// Mark a version and every version inheriting from it as stale
    ///
    /// Cached rows stay in place until the next rebuild.
    pub fn invalidate(&self, version_id: &str) -> Result<Vec<String>> {
        let mut affected = vec![version_id.to_string()];
        affected.extend(Versions::new(self.backend).dependents(version_id)?);
        for id in &affected {
            self.backend.execute(
                "INSERT INTO state_cache_stale (version_id) VALUES (?1) \
                 ON CONFLICT (version_id) DO NOTHING",
                &[id.as_str().into()],
            )?;
        }
        debug!(version_id, affected = affected.len(), "invalidated state cache");
        Ok(affected)
    }

    /// Cached row for one entity (the caller checks staleness)
    pub fn cached(&self, version_id: &str, key: &EntityKey) -> Result<Option<StateRow>> {
        let sql = format!(
            "SELECT {STATE_COLUMNS} FROM state_cache \
             WHERE version_id = ?1 AND entity_id = ?2 AND file_id = ?3 AND schema_key = ?4"
        );
        let result = self.backend.execute(
            &sql,
            &[
                version_id.into(),
                key.entity_id.as_str().into(),
                key.file_id.as_str().into(),
                key.schema_key.as_str().into(),
            ],
        )?;
        result.first().map(state_from_row).transpose()
    }

    /// Every cached row of a version, ordered by entity key
    pub fn cached_all(&self, version_id: &str) -> Result<Vec<StateRow>> {
        let sql = format!(
            "SELECT {STATE_COLUMNS} FROM state_cache WHERE version_id = ?1 \
             ORDER BY entity_id, file_id, schema_key"
        );
        let result = self.backend.execute(&sql, &[version_id.into()])?;
        result.rows.iter().map(state_from_row).collect()
    }

    /// Recompute a version's cache from the log and clear its stale mark
    ///
    /// All rows of the version are replaced within the caller's transaction,
    /// so readers never see a mix of rebuilt and stale rows.
    pub fn rebuild(&self, version_id: &str) -> Result<RebuildOutcome> {
        let was_stale = self.is_stale(version_id)?;
        let fresh: Vec<StateRow> = self.resolve_all_direct(version_id)?.into_values().collect();
        let differing = if was_stale {
            0
        } else {
            self.diff_count(version_id, &fresh)?
        };
        let inconsistent = differing > 0;

        self.backend.execute(
            "DELETE FROM state_cache WHERE version_id = ?1",
            &[version_id.into()],
        )?;
        for row in &fresh {
            self.backend.execute(
                "INSERT INTO state_cache (entity_id, file_id, schema_key, version_id, plugin_key, \
                 snapshot_id, change_id, commit_id, inherited_from_version_id, is_tombstone) \
                 VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10)",
                &[
                    row.entity_id.as_str().into(),
                    row.file_id.as_str().into(),
                    row.schema_key.as_str().into(),
                    row.version_id.as_str().into(),
                    row.plugin_key.as_str().into(),
                    row.snapshot_id.as_str().into(),
                    row.change_id.as_str().into(),
                    row.commit_id.as_str().into(),
                    row.inherited_from_version_id.as_deref().into(),
                    row.is_tombstone.into(),
                ],
            )?;
        }
        self.backend.execute(
            "DELETE FROM state_cache_stale WHERE version_id = ?1",
            &[version_id.into()],
        )?;

        info!(version_id, rows = fresh.len(), inconsistent, "rebuilt state cache");
        Ok(RebuildOutcome {
            version_id: version_id.to_string(),
            rows: fresh.len(),
            inconsistent,
            differing,
        })
    }

    /// Compare cached rows with the log without writing anything
    ///
    /// Stale versions make no freshness claim and always pass.
    pub fn verify(&self, version_id: &str) -> Result<()> {
        if self.is_stale(version_id)? {
            return Ok(());
        }
        let fresh: Vec<StateRow> = self.resolve_all_direct(version_id)?.into_values().collect();
        let differing = self.diff_count(version_id, &fresh)?;
        if differing > 0 {
            return Err(EngineError::CacheInconsistency {
                version_id: version_id.to_string(),
                differing,
            });
        }
        Ok(())
    }

    fn diff_count(&self, version_id: &str, fresh: &[StateRow]) -> Result<usize> {
        let cached: BTreeMap<EntityKey, StateRow> = self
            .cached_all(version_id)?
            .into_iter()
            .map(|row| (row.key(), row))
            .collect();
        let fresh_keys: HashSet<EntityKey> = fresh.iter().map(StateRow::key).collect();
        let mut differing = cached.keys().filter(|key| !fresh_keys.contains(*key)).count();
        for row in fresh {
            if cached.get(&row.key()) != Some(row) {
                differing += 1;
            }
        }
        Ok(differing)
    }
}
