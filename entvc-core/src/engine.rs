//! Engine: the transactional entry point over every component
//!
//! Each mutating call runs inside [`Engine::in_transaction`], so a failed
//! operation leaves neither rows nor consumed clock values behind.

use crate::backend::{Backend, SqliteBackend};
use crate::change_log::{ChangeLog, NewChange};
use crate::change_set::ChangeSets;
use crate::clock::Clock;
use crate::config::{CacheReadPolicy, EngineConfig};
use crate::error::{EngineError, Result};
use crate::graph::CommitGraph;
use crate::merge::{ConflictResolution, MergePlanner, MergeResult, apply_resolutions};
use crate::object::{Change, Commit, EntityKey, ResolvedEntity, SnapshotId, StateRow, Version};
use crate::plugin::{ChangePlugin, DetectedChange, PluginRegistry};
use crate::schema::{self, meta_get, meta_set};
use crate::schema_registry::{EntitySchema, SchemaRegistry};
use crate::snapshot::SnapshotStore;
use crate::state::{RebuildOutcome, StateMaterializer};
use crate::sync::{self, ChangeBatch};
use crate::version::Versions;
use std::collections::BTreeMap;
use std::path::Path;
use std::sync::Arc;
use tracing::{debug, info, warn};

/// Name of the version created when a store is initialized
pub const MAIN_VERSION: &str = "main";

const CLOCK_COUNTER_KEY: &str = "clock_counter";

/// New bytes for one file, routed to a plugin by `path`
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FileWrite {
    pub file_id: String,
    pub path: String,
    pub data: Vec<u8>,
}

impl FileWrite {
    pub fn new(file_id: impl Into<String>, path: impl Into<String>, data: impl Into<Vec<u8>>) -> Self {
        Self {
            file_id: file_id.into(),
            path: path.into(),
            data: data.into(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FileWriteOutcome {
    pub file_id: String,
    pub plugin_key: String,
    pub changes: Vec<Change>,
}

/// Per-file result of [`Engine::write_files`]
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct FileWriteReport {
    pub written: Vec<FileWriteOutcome>,
    /// One `PluginDetection` error per failed file
    pub failures: Vec<EngineError>,
    /// File ids whose path no plugin matched
    pub unmatched: Vec<String>,
}

impl FileWriteReport {
    pub fn is_complete(&self) -> bool {
        self.failures.is_empty() && self.unmatched.is_empty()
    }
}

/// One change to an entity reachable from a version tip
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct HistoryEntry {
    pub commit_id: String,
    /// BFS distance from the tip
    pub depth: usize,
    pub change: Change,
}

pub struct Engine {
    backend: Box<dyn Backend>,
    config: EngineConfig,
    clock: Clock,
    snapshots: SnapshotStore,
    plugins: PluginRegistry,
    active_version_id: String,
    tx_depth: usize,
}

impl Engine {
    /// Open an engine over a backend, initializing the store if needed
    pub fn open(backend: Box<dyn Backend>, config: EngineConfig) -> Result<Self> {
        let mut engine = Self {
            backend,
            clock: Clock::from_config(&config.clock),
            snapshots: SnapshotStore::new(config.snapshot_cache_capacity),
            config,
            plugins: PluginRegistry::new(),
            active_version_id: String::new(),
            tx_depth: 0,
        };
        engine.in_transaction(|engine| engine.bootstrap())?;
        Ok(engine)
    }

    /// Open a SQLite database file
    pub fn open_path(path: &Path, config: EngineConfig) -> Result<Self> {
        Self::open(Box::new(SqliteBackend::open(path)?), config)
    }

    pub fn open_in_memory(config: EngineConfig) -> Result<Self> {
        Self::open(Box::new(SqliteBackend::open_in_memory()?), config)
    }

    fn bootstrap(&mut self) -> Result<()> {
        schema::install(self.backend.as_ref())?;

        let initialized = CommitGraph::new(self.backend.as_ref()).count()? > 0;
        if self.config.clock.persist_counter {
            if let Some(raw) = meta_get(self.backend.as_ref(), CLOCK_COUNTER_KEY)? {
                let counter = raw.parse::<u64>().map_err(|e| {
                    EngineError::StorageTransaction(format!("corrupt clock counter '{raw}': {e}"))
                })?;
                self.clock.restore(counter);
            }
        } else if initialized && self.clock.is_deterministic() {
            return Err(EngineError::InvalidOperation(
                "reopening a populated store with a deterministic clock requires persist_counter"
                    .to_string(),
            ));
        }

        if !initialized {
            let backend = self.backend.as_ref();
            let change_set_id = ChangeSets::new(backend).create(&mut self.clock)?;
            let root = CommitGraph::new(backend).create_commit(&mut self.clock, &change_set_id, &[])?;
            let main = Versions::new(backend).create(&mut self.clock, MAIN_VERSION, &root.id)?;
            StateMaterializer::new(backend).invalidate(&main.id)?;
            info!(root = %root.id, version = %main.id, "initialized store");
        }

        let versions = Versions::new(self.backend.as_ref());
        let active = match versions.by_name(MAIN_VERSION)? {
            Some(main) => main,
            None => versions
                .list()?
                .into_iter()
                .next()
                .ok_or_else(|| EngineError::not_found("version", MAIN_VERSION))?,
        };
        self.active_version_id = active.id;
        Ok(())
    }

    /// Run `f` atomically
    ///
    /// Calls nested inside `f` join the outer transaction. On error the
    /// backend rolls back and the clock returns to where it was.
    pub fn in_transaction<T>(&mut self, f: impl FnOnce(&mut Self) -> Result<T>) -> Result<T> {
        if self.tx_depth > 0 {
            return f(self);
        }

        let saved_counter = self.clock.counter();
        self.backend.begin()?;
        self.tx_depth += 1;
        let outcome = f(self).and_then(|value| {
            self.persist_clock()?;
            Ok(value)
        });
        self.tx_depth -= 1;

        let outcome = outcome.and_then(|value| {
            self.backend.commit()?;
            Ok(value)
        });
        if outcome.is_err() {
            if let Err(e) = self.backend.rollback() {
                warn!("rollback failed: {}", e);
            }
            self.clock.restore(saved_counter);
            self.snapshots.clear_cache();
        }
        outcome
    }

    fn persist_clock(&self) -> Result<()> {
        if self.config.clock.persist_counter {
            meta_set(
                self.backend.as_ref(),
                CLOCK_COUNTER_KEY,
                &self.clock.counter().to_string(),
            )?;
        }
        Ok(())
    }

    pub fn config(&self) -> &EngineConfig {
        &self.config
    }

    pub fn clock(&self) -> &Clock {
        &self.clock
    }

    pub fn backend(&self) -> &dyn Backend {
        self.backend.as_ref()
    }

    pub fn plugins(&self) -> &PluginRegistry {
        &self.plugins
    }

    // ─────────────────────────────────────────────────────
    // Schemas and plugins
    // ─────────────────────────────────────────────────────

    pub fn register_schema(&mut self, schema: &EntitySchema) -> Result<()> {
        self.in_transaction(|engine| SchemaRegistry::new(engine.backend.as_ref()).register(schema))
    }

    /// Register a plugin after every existing one, along with its schemas
    pub fn register_plugin(&mut self, plugin: Arc<dyn ChangePlugin>) -> Result<()> {
        if self.plugins.get(plugin.key()).is_some() {
            return Err(EngineError::InvalidOperation(format!(
                "plugin '{}' is already registered",
                plugin.key()
            )));
        }
        self.in_transaction(|engine| {
            let registry = SchemaRegistry::new(engine.backend.as_ref());
            for schema in plugin.schemas() {
                registry.register(&schema)?;
            }
            Ok(())
        })?;
        debug!(plugin = plugin.key(), glob = plugin.detect_changes_glob(), "registered plugin");
        self.plugins.register(plugin)
    }

    // ─────────────────────────────────────────────────────
    // Versions
    // ─────────────────────────────────────────────────────

    pub fn version(&self, id: &str) -> Result<Version> {
        Versions::new(self.backend.as_ref()).get(id)
    }

    pub fn version_by_name(&self, name: &str) -> Result<Option<Version>> {
        Versions::new(self.backend.as_ref()).by_name(name)
    }

    pub fn versions(&self) -> Result<Vec<Version>> {
        Versions::new(self.backend.as_ref()).list()
    }

    pub fn active_version_id(&self) -> &str {
        &self.active_version_id
    }

    pub fn active_version(&self) -> Result<Version> {
        self.version(&self.active_version_id)
    }

    /// Move this engine's active-version pointer; no data changes
    pub fn switch(&mut self, version_id: &str) -> Result<()> {
        let version = self.version(version_id)?;
        debug!(version = %version.name, "switched active version");
        self.active_version_id = version.id;
        Ok(())
    }

    pub fn fork(&mut self, from_version_id: &str, name: &str) -> Result<Version> {
        self.in_transaction(|engine| {
            let version =
                Versions::new(engine.backend.as_ref()).fork(&mut engine.clock, from_version_id, name)?;
            StateMaterializer::new(engine.backend.as_ref()).invalidate(&version.id)?;
            Ok(version)
        })
    }

    /// Point a version at an existing commit
    pub fn advance_tip(&mut self, version_id: &str, commit_id: &str) -> Result<()> {
        self.in_transaction(|engine| {
            Versions::new(engine.backend.as_ref()).advance_tip(version_id, commit_id)?;
            engine.tip_moved(version_id)
        })
    }

    pub fn set_inheritance(&mut self, version_id: &str, parent: Option<&str>) -> Result<()> {
        self.in_transaction(|engine| {
            Versions::new(engine.backend.as_ref()).set_inheritance(version_id, parent)?;
            engine.tip_moved(version_id)
        })
    }

    /// Invalidate (or eagerly rebuild) a version and its dependents
    fn tip_moved(&mut self, version_id: &str) -> Result<()> {
        let affected = StateMaterializer::new(self.backend.as_ref()).invalidate(version_id)?;
        if self.config.eager_cache_rebuild {
            for id in affected {
                self.rebuild(&id)?;
            }
        }
        Ok(())
    }

    // ─────────────────────────────────────────────────────
    // Change log and commits
    // ─────────────────────────────────────────────────────

    pub fn put_snapshot(&mut self, content: &[u8]) -> Result<SnapshotId> {
        self.in_transaction(|engine| engine.snapshots.put(engine.backend.as_ref(), content))
    }

    pub fn snapshot(&self, id: &SnapshotId) -> Result<Arc<Vec<u8>>> {
        self.snapshots.get(self.backend.as_ref(), id)
    }

    /// Append a change and record it in the version's working change set
    pub fn append(&mut self, version_id: &str, input: &NewChange) -> Result<Change> {
        self.in_transaction(|engine| {
            let version = engine.version(version_id)?;
            let backend = engine.backend.as_ref();
            let change = ChangeLog::new(backend, &engine.snapshots).append(&mut engine.clock, input)?;
            ChangeSets::new(backend).record(&version.working_change_set_id, &change)?;
            Ok(change)
        })
    }

    pub fn change(&self, id: &str) -> Result<Change> {
        ChangeLog::new(self.backend.as_ref(), &self.snapshots).get(id)
    }

    /// Content of a change, `None` for a tombstone
    pub fn change_content(&self, change: &Change) -> Result<Option<Vec<u8>>> {
        ChangeLog::new(self.backend.as_ref(), &self.snapshots).content(change)
    }

    /// Uncommitted changes of a version, ordered by entity key
    pub fn working_changes(&self, version_id: &str) -> Result<Vec<Change>> {
        let version = self.version(version_id)?;
        ChangeSets::new(self.backend.as_ref()).changes(&version.working_change_set_id)
    }

    /// Commit the working change set on top of the version tip
    pub fn commit(&mut self, version_id: &str) -> Result<Commit> {
        self.in_transaction(|engine| {
            let version = engine.version(version_id)?;
            let backend = engine.backend.as_ref();
            let changes = ChangeSets::new(backend).elements(&version.working_change_set_id)?.len();
            let commit = CommitGraph::new(backend).create_commit(
                &mut engine.clock,
                &version.working_change_set_id,
                &[version.tip_commit_id.clone()],
            )?;
            let next_working = ChangeSets::new(backend).create(&mut engine.clock)?;
            let versions = Versions::new(backend);
            versions.set_working_change_set(&version.id, &next_working)?;
            versions.advance_tip(&version.id, &commit.id)?;
            engine.tip_moved(&version.id)?;
            info!(version = %version.name, commit_id = %commit.id, changes, "committed");
            Ok(commit)
        })
    }

    pub fn get_commit(&self, id: &str) -> Result<Commit> {
        CommitGraph::new(self.backend.as_ref()).get(id)
    }

    pub fn lowest_common_ancestor(&self, a: &str, b: &str) -> Result<Option<Commit>> {
        CommitGraph::new(self.backend.as_ref())
            .lowest_common_ancestor(a, b)?
            .map(|id| self.get_commit(&id))
            .transpose()
    }

    /// Commits reachable from a version tip, tip first
    pub fn log(&self, version_id: &str, limit: usize) -> Result<Vec<Commit>> {
        let version = self.version(version_id)?;
        let graph = CommitGraph::new(self.backend.as_ref());
        graph
            .walk(&version.tip_commit_id)
            .take(limit)
            .map(|step| step.and_then(|(id, _)| graph.get(&id)))
            .collect()
    }

    /// Every committed change to `key` reachable from a version tip, nearest first
    pub fn entity_history(&self, version_id: &str, key: &EntityKey) -> Result<Vec<HistoryEntry>> {
        let version = self.version(version_id)?;
        let graph = CommitGraph::new(self.backend.as_ref());
        let sets = ChangeSets::new(self.backend.as_ref());
        let mut history = Vec::new();
        for step in graph.walk(&version.tip_commit_id) {
            let (commit_id, depth) = step?;
            let commit = graph.get(&commit_id)?;
            if let Some(change) = sets.change_for(&commit.change_set_id, key)? {
                history.push(HistoryEntry {
                    commit_id,
                    depth,
                    change,
                });
            }
        }
        Ok(history)
    }

    /// Every change ever appended to `key` in any version, in append order
    ///
    /// Includes uncommitted and superseded changes.
    pub fn entity_changes(&self, key: &EntityKey) -> Result<Vec<Change>> {
        ChangeLog::new(self.backend.as_ref(), &self.snapshots).for_entity(key)
    }

    // ─────────────────────────────────────────────────────
    // State
    // ─────────────────────────────────────────────────────

    /// Committed value of an entity in a version
    ///
    /// Under [`CacheReadPolicy::RebuildBeforeRead`] a stale cache is rebuilt
    /// first; otherwise this is [`Engine::read_entity`].
    pub fn resolve(&mut self, version_id: &str, key: &EntityKey) -> Result<ResolvedEntity> {
        self.refresh_for_read(version_id)?;
        self.read_entity(version_id, key)
    }

    /// Read an entity through a shared reference
    ///
    /// Fresh cache rows are served as is; a stale version resolves from the
    /// log. Nothing is written, so concurrent readers can share one engine.
    pub fn read_entity(&self, version_id: &str, key: &EntityKey) -> Result<ResolvedEntity> {
        self.version(version_id)?;
        let state = StateMaterializer::new(self.backend.as_ref());
        if state.is_stale(version_id)? {
            return state.resolve_direct(version_id, key);
        }
        debug!(version_id, entity = %key, "state cache read");
        Ok(state
            .cached(version_id, key)?
            .map_or(ResolvedEntity::Absent, ResolvedEntity::from_row))
    }

    /// Committed content of an entity, `None` when absent or deleted
    pub fn resolve_content(&mut self, version_id: &str, key: &EntityKey) -> Result<Option<Vec<u8>>> {
        match self.resolve(version_id, key)? {
            ResolvedEntity::Present(row) => Ok(Some(self.snapshot(&row.snapshot_id)?.as_ref().clone())),
            _ => Ok(None),
        }
    }

    /// Latest change to an entity including the uncommitted working set
    pub fn resolve_working(&mut self, version_id: &str, key: &EntityKey) -> Result<Option<Change>> {
        let version = self.version(version_id)?;
        if let Some(change) =
            ChangeSets::new(self.backend.as_ref()).change_for(&version.working_change_set_id, key)?
        {
            return Ok(Some(change));
        }
        match self.resolve(version_id, key)?.row() {
            Some(row) => Ok(Some(self.change(&row.change_id)?)),
            None => Ok(None),
        }
    }

    /// Every present entity of a version, ordered by key
    pub fn state(&mut self, version_id: &str) -> Result<Vec<StateRow>> {
        self.refresh_for_read(version_id)?;
        self.read_state(version_id)
    }

    /// Shared-reference counterpart of [`Engine::state`]
    pub fn read_state(&self, version_id: &str) -> Result<Vec<StateRow>> {
        Ok(self
            .state_rows(version_id)?
            .into_iter()
            .filter(|row| !row.is_tombstone)
            .collect())
    }

    /// Committed rows of a version including tombstones
    fn state_rows(&self, version_id: &str) -> Result<Vec<StateRow>> {
        self.version(version_id)?;
        let state = StateMaterializer::new(self.backend.as_ref());
        if state.is_stale(version_id)? {
            return Ok(state.resolve_all_direct(version_id)?.into_values().collect());
        }
        debug!(version_id, "state cache read");
        state.cached_all(version_id)
    }

    /// Rebuild a stale version when the read policy asks for it
    fn refresh_for_read(&mut self, version_id: &str) -> Result<()> {
        if matches!(self.config.cache_read_policy, CacheReadPolicy::RebuildBeforeRead)
            && self.is_stale(version_id)?
        {
            self.rebuild(version_id)?;
        }
        Ok(())
    }

    pub fn is_stale(&self, version_id: &str) -> Result<bool> {
        StateMaterializer::new(self.backend.as_ref()).is_stale(version_id)
    }

    pub fn invalidate(&mut self, version_id: &str) -> Result<Vec<String>> {
        self.in_transaction(|engine| {
            engine.version(version_id)?;
            StateMaterializer::new(engine.backend.as_ref()).invalidate(version_id)
        })
    }

    /// Recompute a version's cache from the log
    ///
    /// If rows that were marked fresh turn out wrong, every version is
    /// rebuilt.
    pub fn rebuild(&mut self, version_id: &str) -> Result<RebuildOutcome> {
        self.in_transaction(|engine| {
            engine.version(version_id)?;
            let outcome = StateMaterializer::new(engine.backend.as_ref()).rebuild(version_id)?;
            if outcome.inconsistent {
                let err = EngineError::CacheInconsistency {
                    version_id: version_id.to_string(),
                    differing: outcome.differing,
                };
                warn!("{}; rebuilding every version", err);
                for version in engine.versions()? {
                    if version.id != version_id {
                        StateMaterializer::new(engine.backend.as_ref()).rebuild(&version.id)?;
                    }
                }
            }
            Ok(outcome)
        })
    }

    pub fn rebuild_all(&mut self) -> Result<Vec<RebuildOutcome>> {
        self.in_transaction(|engine| {
            let ids: Vec<String> = engine.versions()?.into_iter().map(|v| v.id).collect();
            ids.iter().map(|id| engine.rebuild(id)).collect()
        })
    }

    /// Compare a version's cache with the log without writing
    pub fn verify_cache(&self, version_id: &str) -> Result<()> {
        self.version(version_id)?;
        let verified = StateMaterializer::new(self.backend.as_ref()).verify(version_id);
        if let Err(e) = &verified {
            warn!("{}", e);
        }
        verified
    }

    // ─────────────────────────────────────────────────────
    // Files
    // ─────────────────────────────────────────────────────

    /// Detect and record changes for a batch of file writes
    ///
    /// A plugin failure only affects its own file; it is reported in
    /// [`FileWriteReport::failures`] while the other files proceed.
    pub fn write_files(&mut self, version_id: &str, writes: &[FileWrite]) -> Result<FileWriteReport> {
        self.in_transaction(|engine| {
            engine.version(version_id)?;
            let mut report = FileWriteReport::default();
            for write in writes {
                let Some(plugin) = engine.plugins.resolve(&write.path).cloned() else {
                    debug!(file_id = %write.file_id, path = %write.path, "no plugin matches");
                    report.unmatched.push(write.file_id.clone());
                    continue;
                };
                let detected = match engine.detect_file(version_id, write, plugin.as_ref()) {
                    Ok(detected) => detected,
                    Err(err @ EngineError::PluginDetection { .. }) => {
                        warn!("{}", err);
                        report.failures.push(err);
                        continue;
                    }
                    Err(e) => return Err(e),
                };
                let mut changes = Vec::with_capacity(detected.len());
                for change in detected {
                    let input = change.into_new_change(&write.file_id, plugin.key());
                    changes.push(engine.append(version_id, &input)?);
                }
                report.written.push(FileWriteOutcome {
                    file_id: write.file_id.clone(),
                    plugin_key: plugin.key().to_string(),
                    changes,
                });
            }
            Ok(report)
        })
    }

    /// Run detection for one file and validate everything it emitted
    fn detect_file(
        &mut self,
        version_id: &str,
        write: &FileWrite,
        plugin: &dyn ChangePlugin,
    ) -> Result<Vec<DetectedChange>> {
        let failed = |reason: String| EngineError::PluginDetection {
            file_id: write.file_id.clone(),
            path: write.path.clone(),
            plugin_key: plugin.key().to_string(),
            reason,
        };

        let entities: Vec<DetectedChange> = self
            .file_entities(version_id, &write.file_id)?
            .into_iter()
            .filter(|(change, _)| change.plugin_key == plugin.key())
            .map(|(change, content)| DetectedChange {
                entity_id: change.entity_id,
                schema_key: change.schema_key,
                schema_version: change.schema_version,
                content: Some(content),
            })
            .collect();
        let before = if entities.is_empty() {
            None
        } else {
            Some(plugin.apply_changes(None, &entities).map_err(|e| failed(e.to_string()))?)
        };

        let detected = plugin
            .detect_changes(before.as_deref(), Some(write.data.as_slice()))
            .map_err(|e| failed(e.to_string()))?;

        let registry = SchemaRegistry::new(self.backend.as_ref());
        for change in &detected {
            if let Some(content) = &change.content {
                registry
                    .validate(&change.schema_key, &change.schema_version, content)
                    .map_err(|e| failed(e.to_string()))?;
            }
        }
        Ok(detected)
    }

    /// Present entities of a file as seen by the working state, with content
    fn file_entities(&mut self, version_id: &str, file_id: &str) -> Result<Vec<(Change, Vec<u8>)>> {
        let version = self.version(version_id)?;
        self.refresh_for_read(version_id)?;
        let mut current: BTreeMap<EntityKey, Change> = BTreeMap::new();
        for row in self.state_rows(version_id)? {
            if row.file_id == file_id && !row.is_tombstone {
                current.insert(row.key(), self.change(&row.change_id)?);
            }
        }
        for change in ChangeSets::new(self.backend.as_ref()).changes(&version.working_change_set_id)? {
            if change.file_id != file_id {
                continue;
            }
            if change.is_tombstone() {
                current.remove(&change.key());
            } else {
                current.insert(change.key(), change);
            }
        }

        let mut entities = Vec::with_capacity(current.len());
        for change in current.into_values() {
            let content = self.snapshot(&change.snapshot_id)?.as_ref().clone();
            entities.push((change, content));
        }
        Ok(entities)
    }

    /// Tombstone every entity of a file in the working state
    pub fn delete_file(&mut self, version_id: &str, file_id: &str) -> Result<usize> {
        self.in_transaction(|engine| {
            let entities = engine.file_entities(version_id, file_id)?;
            for (change, _) in &entities {
                let input =
                    NewChange::tombstone(change.key(), &change.schema_version, &change.plugin_key);
                engine.append(version_id, &input)?;
            }
            debug!(file_id, entities = entities.len(), "deleted file");
            Ok(entities.len())
        })
    }

    /// Current bytes of a file in the working state, `None` if it has no entities
    pub fn read_file(&mut self, version_id: &str, file_id: &str) -> Result<Option<Vec<u8>>> {
        let entities = self.file_entities(version_id, file_id)?;
        let Some((first, _)) = entities.first() else {
            return Ok(None);
        };
        let plugin_key = first.plugin_key.clone();
        let plugin = self
            .plugins
            .get(&plugin_key)
            .cloned()
            .ok_or_else(|| EngineError::not_found("plugin", plugin_key.as_str()))?;
        let changes: Vec<DetectedChange> = entities
            .into_iter()
            .filter(|(change, _)| change.plugin_key == plugin_key)
            .map(|(change, content)| DetectedChange {
                entity_id: change.entity_id,
                schema_key: change.schema_key,
                schema_version: change.schema_version,
                content: Some(content),
            })
            .collect();
        plugin
            .apply_changes(None, &changes)
            .map(Some)
            .map_err(|e| EngineError::PluginDetection {
                file_id: file_id.to_string(),
                path: String::new(),
                plugin_key,
                reason: e.to_string(),
            })
    }

    // ─────────────────────────────────────────────────────
    // Merge
    // ─────────────────────────────────────────────────────

    /// Merge `source` into `target`, storing the non-conflicting picks
    ///
    /// Nothing moves until [`Engine::commit_merge`]; conflicts are returned
    /// as data.
    pub fn merge(&mut self, source_version_id: &str, target_version_id: &str) -> Result<MergeResult> {
        self.in_transaction(|engine| {
            let source = engine.version(source_version_id)?;
            let target = engine.version(target_version_id)?;
            let backend = engine.backend.as_ref();
            let plan = MergePlanner::new(backend, &engine.plugins)
                .plan(&source.tip_commit_id, &target.tip_commit_id)?;

            let sets = ChangeSets::new(backend);
            let change_set_id = sets.create(&mut engine.clock)?;
            for change in &plan.picks {
                sets.record(&change_set_id, change)?;
            }

            info!(
                source = %source.name,
                target = %target.name,
                lca = ?plan.lca,
                picks = plan.picks.len(),
                conflicts = plan.conflicts.len(),
                "merged"
            );
            Ok(MergeResult {
                source_version_id: source.id,
                target_version_id: target.id,
                source_tip: source.tip_commit_id,
                target_tip: target.tip_commit_id,
                lca: plan.lca,
                change_set_id,
                elements: plan.picks,
                conflicts: plan.conflicts,
            })
        })
    }

    /// Commit a merge with parents `[source tip, target tip]` and advance the target
    pub fn commit_merge(
        &mut self,
        merge: &MergeResult,
        resolutions: &[ConflictResolution],
    ) -> Result<Commit> {
        self.in_transaction(|engine| {
            let source = engine.version(&merge.source_version_id)?;
            let target = engine.version(&merge.target_version_id)?;
            if source.tip_commit_id != merge.source_tip || target.tip_commit_id != merge.target_tip {
                return Err(EngineError::InvalidOperation(
                    "merge is stale: a version tip moved since it was computed".to_string(),
                ));
            }
            let backend = engine.backend.as_ref();
            if ChangeSets::new(backend).is_finalized(&merge.change_set_id)? {
                return Err(EngineError::InvalidOperation(format!(
                    "merge change set {} is already committed",
                    merge.change_set_id
                )));
            }

            apply_resolutions(backend, &engine.snapshots, &mut engine.clock, merge, resolutions)?;
            let commit = CommitGraph::new(backend).create_commit(
                &mut engine.clock,
                &merge.change_set_id,
                &[merge.source_tip.clone(), merge.target_tip.clone()],
            )?;
            Versions::new(backend).advance_tip(&target.id, &commit.id)?;
            engine.tip_moved(&target.id)?;
            info!(
                source = %source.name,
                target = %target.name,
                commit_id = %commit.id,
                resolved = resolutions.len(),
                "committed merge"
            );
            Ok(commit)
        })
    }

    // ─────────────────────────────────────────────────────
    // Sync
    // ─────────────────────────────────────────────────────

    pub fn changes_since(&self, cursor: i64, limit: usize) -> Result<ChangeBatch> {
        sync::changes_since(self.backend.as_ref(), cursor, limit)
    }
}
