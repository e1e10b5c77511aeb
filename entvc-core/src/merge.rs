//! Three-way merge over the commit graph
//!
//! The merge base is the lowest common ancestor of the two tips. Each side
//! contributes the nearest change it made to every entity after the base,
//! unless that change leaves the entity at its base value. An entity
//! changed on both sides to different snapshots is a conflict and
//! is left out of the merged change set until the caller resolves it.

use crate::backend::Backend;
use crate::change_log::{ChangeLog, NewChange};
use crate::change_set::ChangeSets;
use crate::clock::Clock;
use crate::error::{EngineError, Result};
use crate::graph::CommitGraph;
use crate::object::{Change, EntityKey, StateRow};
use crate::plugin::PluginRegistry;
use crate::snapshot::SnapshotStore;
use crate::state::StateMaterializer;
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, HashSet};
use tracing::debug;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ConflictKind {
    /// Both sides changed the entity to different snapshots
    Divergent,
    /// A plugin's `detect_conflicts` flagged the entity
    PluginReported,
}

/// Entity the merge could not decide on
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Conflict {
    pub key: EntityKey,
    /// `None` when that side did not change the entity after the base
    pub source_change: Option<Change>,
    pub target_change: Option<Change>,
    pub kind: ConflictKind,
}

impl Conflict {
    fn any_change(&self) -> Option<&Change> {
        self.source_change.as_ref().or(self.target_change.as_ref())
    }
}

/// Outcome of [`crate::engine::Engine::merge`]
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct MergeResult {
    pub source_version_id: String,
    pub target_version_id: String,
    pub source_tip: String,
    pub target_tip: String,
    /// `None` when the tips share no history
    pub lca: Option<String>,
    /// Open change set holding every non-conflicting pick
    pub change_set_id: String,
    pub elements: Vec<Change>,
    pub conflicts: Vec<Conflict>,
}

impl MergeResult {
    pub fn is_clean(&self) -> bool {
        self.conflicts.is_empty()
    }
}

/// How a conflict is settled when committing a merge
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ConflictChoice {
    TakeSource,
    TakeTarget,
    /// New content for the entity, validated like any append
    Content(Vec<u8>),
    Delete,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ConflictResolution {
    pub key: EntityKey,
    pub choice: ConflictChoice,
}

impl ConflictResolution {
    pub fn new(key: EntityKey, choice: ConflictChoice) -> Self {
        Self { key, choice }
    }
}

/// Picks and conflicts computed between two tips, before anything is stored
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MergePlan {
    pub lca: Option<String>,
    pub picks: Vec<Change>,
    pub conflicts: Vec<Conflict>,
}

pub struct MergePlanner<'a> {
    backend: &'a dyn Backend,
    plugins: &'a PluginRegistry,
}

impl<'a> MergePlanner<'a> {
    pub fn new(backend: &'a dyn Backend, plugins: &'a PluginRegistry) -> Self {
        Self { backend, plugins }
    }

    pub fn plan(&self, source_tip: &str, target_tip: &str) -> Result<MergePlan> {
        let graph = CommitGraph::new(self.backend);
        let lca = graph.lowest_common_ancestor(source_tip, target_tip)?;
        let base: HashSet<String> = match &lca {
            Some(id) => graph
                .walk(id)
                .map(|step| step.map(|(commit_id, _)| commit_id))
                .collect::<Result<_>>()?,
            None => HashSet::new(),
        };

        let mut source = self.side_changes(source_tip, &base)?;
        let mut target = self.side_changes(target_tip, &base)?;
        if let Some(lca) = &lca {
            self.drop_unchanged(lca, &mut source, &mut target)?;
        }

        let mut picks: BTreeMap<EntityKey, Change> = BTreeMap::new();
        let mut conflicts: BTreeMap<EntityKey, Conflict> = BTreeMap::new();
        for (key, change) in &source {
            match target.get(key) {
                Some(other) if other.snapshot_id != change.snapshot_id => {
                    conflicts.insert(
                        key.clone(),
                        Conflict {
                            key: key.clone(),
                            source_change: Some(change.clone()),
                            target_change: Some(other.clone()),
                            kind: ConflictKind::Divergent,
                        },
                    );
                }
                _ => {
                    picks.insert(key.clone(), change.clone());
                }
            }
        }
        for (key, change) in &target {
            if !source.contains_key(key) {
                picks.insert(key.clone(), change.clone());
            }
        }

        for key in self.plugin_flagged(&source, &target) {
            if conflicts.contains_key(&key) {
                continue;
            }
            picks.remove(&key);
            conflicts.insert(
                key.clone(),
                Conflict {
                    source_change: source.get(&key).cloned(),
                    target_change: target.get(&key).cloned(),
                    key,
                    kind: ConflictKind::PluginReported,
                },
            );
        }

        debug!(
            lca = ?lca,
            picks = picks.len(),
            conflicts = conflicts.len(),
            "planned merge"
        );
        Ok(MergePlan {
            lca,
            picks: picks.into_values().collect(),
            conflicts: conflicts.into_values().collect(),
        })
    }

    /// Nearest change per entity made on one side after the base
    fn side_changes(
        &self,
        tip: &str,
        base: &HashSet<String>,
    ) -> Result<BTreeMap<EntityKey, Change>> {
        let graph = CommitGraph::new(self.backend);
        let sets = ChangeSets::new(self.backend);
        let mut out = BTreeMap::new();
        for step in graph.walk(tip) {
            let (commit_id, _) = step?;
            if base.contains(&commit_id) {
                continue;
            }
            let commit = graph.get(&commit_id)?;
            for change in sets.changes(&commit.change_set_id)? {
                out.entry(change.key()).or_insert(change);
            }
        }
        Ok(out)
    }

    /// Remove entries whose value equals the entity's value at the base
    ///
    /// A merge commit carries the picked change forward, so a side can list
    /// an entity it never actually moved away from the base.
    fn drop_unchanged(
        &self,
        lca: &str,
        source: &mut BTreeMap<EntityKey, Change>,
        target: &mut BTreeMap<EntityKey, Change>,
    ) -> Result<()> {
        let state = StateMaterializer::new(self.backend);
        let keys: Vec<EntityKey> = source.keys().chain(target.keys()).cloned().collect();
        let mut base: BTreeMap<EntityKey, Option<StateRow>> = BTreeMap::new();
        for key in keys {
            if !base.contains_key(&key) {
                let row = state.first_in_history(lca, &key, "")?;
                base.insert(key, row);
            }
        }
        let unchanged = |key: &EntityKey, change: &Change| match base.get(key) {
            Some(Some(row)) => row.change_id == change.id || row.snapshot_id == change.snapshot_id,
            _ => false,
        };
        source.retain(|key, change| !unchanged(key, &*change));
        target.retain(|key, change| !unchanged(key, &*change));
        Ok(())
    }

    /// Keys flagged by plugins that touched either side
    fn plugin_flagged(
        &self,
        source: &BTreeMap<EntityKey, Change>,
        target: &BTreeMap<EntityKey, Change>,
    ) -> Vec<EntityKey> {
        let mut flagged = Vec::new();
        let touched: HashSet<&str> = source
            .values()
            .chain(target.values())
            .map(|change| change.plugin_key.as_str())
            .collect();
        for plugin_key in touched {
            let Some(plugin) = self.plugins.get(plugin_key) else {
                continue;
            };
            let of_plugin = |side: &BTreeMap<EntityKey, Change>| -> Vec<Change> {
                side.values()
                    .filter(|change| change.plugin_key == plugin_key)
                    .cloned()
                    .collect()
            };
            let source_side = of_plugin(source);
            let target_side = of_plugin(target);
            let entity_ids: HashSet<String> = plugin
                .detect_conflicts(&source_side, &target_side)
                .into_iter()
                .collect();
            for change in source_side.iter().chain(target_side.iter()) {
                let key = change.key();
                if entity_ids.contains(&key.entity_id) && !flagged.contains(&key) {
                    flagged.push(key);
                }
            }
        }
        flagged.sort();
        flagged
    }
}

/// Record the caller's resolutions into the merge's open change set
///
/// Every conflict needs exactly one resolution; a resolution for an entity
/// that is not in conflict is rejected.
pub(crate) fn apply_resolutions(
    backend: &dyn Backend,
    snapshots: &SnapshotStore,
    clock: &mut Clock,
    merge: &MergeResult,
    resolutions: &[ConflictResolution],
) -> Result<()> {
    let by_key: BTreeMap<&EntityKey, &ConflictResolution> =
        resolutions.iter().map(|r| (&r.key, r)).collect();
    if let Some(stray) = by_key
        .keys()
        .find(|key| !merge.conflicts.iter().any(|c| &&c.key == *key))
    {
        return Err(EngineError::InvalidOperation(format!(
            "no conflict to resolve for {stray}"
        )));
    }
    let unresolved = merge
        .conflicts
        .iter()
        .filter(|c| !by_key.contains_key(&c.key))
        .count();
    if unresolved > 0 {
        return Err(EngineError::UnresolvedConflicts { count: unresolved });
    }

    let log = ChangeLog::new(backend, snapshots);
    let sets = ChangeSets::new(backend);
    let state = StateMaterializer::new(backend);

    for conflict in &merge.conflicts {
        let Some(resolution) = by_key.get(&conflict.key) else {
            continue;
        };
        let Some(template) = conflict.any_change() else {
            continue;
        };
        let change = match &resolution.choice {
            ConflictChoice::TakeSource | ConflictChoice::TakeTarget => {
                let (side_change, tip) = if resolution.choice == ConflictChoice::TakeSource {
                    (&conflict.source_change, &merge.source_tip)
                } else {
                    (&conflict.target_change, &merge.target_tip)
                };
                match side_change {
                    Some(change) => change.clone(),
                    None => match state.first_in_history(tip, &conflict.key, &merge.target_version_id)? {
                        Some(row) => log.get(&row.change_id)?,
                        None => log.append(
                            clock,
                            &NewChange::tombstone(
                                conflict.key.clone(),
                                &template.schema_version,
                                &template.plugin_key,
                            ),
                        )?,
                    },
                }
            }
            ConflictChoice::Content(bytes) => log.append(
                clock,
                &NewChange::upsert(
                    conflict.key.clone(),
                    &template.schema_version,
                    &template.plugin_key,
                    bytes.clone(),
                ),
            )?,
            ConflictChoice::Delete => log.append(
                clock,
                &NewChange::tombstone(
                    conflict.key.clone(),
                    &template.schema_version,
                    &template.plugin_key,
                ),
            )?,
        };
        sets.record(&merge.change_set_id, &change)?;
    }
    Ok(())
}
