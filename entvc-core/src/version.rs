//! Versions (branches): named tips into the commit graph
//!
//! Tips only move inside the transaction that created the target commit, so
//! a version never points at a commit the graph does not contain.

use crate::backend::{Backend, Row, opt_text_at, text_at};
use crate::change_set::ChangeSets;
use crate::clock::Clock;
use crate::error::{EngineError, Result};
use crate::graph::CommitGraph;
use crate::object::Version;
use std::collections::HashSet;
use tracing::info;

const VERSION_COLUMNS: &str =
    "id, name, tip_commit_id, working_change_set_id, inherits_from_version_id";

fn version_from_row(row: &Row) -> Result<Version> {
    Ok(Version {
        id: text_at(row, 0, "id")?,
        name: text_at(row, 1, "name")?,
        tip_commit_id: text_at(row, 2, "tip_commit_id")?,
        working_change_set_id: text_at(row, 3, "working_change_set_id")?,
        inherits_from_version_id: opt_text_at(row, 4, "inherits_from_version_id")?,
    })
}

pub struct Versions<'a> {
    backend: &'a dyn Backend,
}

impl<'a> Versions<'a> {
    pub fn new(backend: &'a dyn Backend) -> Self {
        Self { backend }
    }

    pub fn get(&self, id: &str) -> Result<Version> {
        let sql = format!("SELECT {VERSION_COLUMNS} FROM version WHERE id = ?1");
        let result = self.backend.execute(&sql, &[id.into()])?;
        let row = result
            .first()
            .ok_or_else(|| EngineError::not_found("version", id))?;
        version_from_row(row)
    }

    pub fn by_name(&self, name: &str) -> Result<Option<Version>> {
        let sql = format!("SELECT {VERSION_COLUMNS} FROM version WHERE name = ?1");
        let result = self.backend.execute(&sql, &[name.into()])?;
        result.first().map(version_from_row).transpose()
    }

    /// All versions ordered by name
    pub fn list(&self) -> Result<Vec<Version>> {
        let sql = format!("SELECT {VERSION_COLUMNS} FROM version ORDER BY name");
        let result = self.backend.execute(&sql, &[])?;
        result.rows.iter().map(version_from_row).collect()
    }

    /// Create a version at `tip_commit_id` with a fresh working change set
    pub fn create(&self, clock: &mut Clock, name: &str, tip_commit_id: &str) -> Result<Version> {
        if name.trim().is_empty() {
            return Err(EngineError::InvalidOperation(
                "version name must not be empty".to_string(),
            ));
        }
        if self.by_name(name)?.is_some() {
            return Err(EngineError::InvalidOperation(format!(
                "a version named '{name}' already exists"
            )));
        }
        if !CommitGraph::new(self.backend).exists(tip_commit_id)? {
            return Err(EngineError::not_found("commit", tip_commit_id));
        }

        let version = Version {
            id: clock.new_id(),
            name: name.to_string(),
            tip_commit_id: tip_commit_id.to_string(),
            working_change_set_id: ChangeSets::new(self.backend).create(clock)?,
            inherits_from_version_id: None,
        };
        self.backend.execute(
            "INSERT INTO version (id, name, tip_commit_id, working_change_set_id, inherits_from_version_id) \
             VALUES (?1, ?2, ?3, ?4, NULL)",
            &[
                version.id.as_str().into(),
                version.name.as_str().into(),
                version.tip_commit_id.as_str().into(),
                version.working_change_set_id.as_str().into(),
            ],
        )?;
        Ok(version)
    }

    /// New version sharing the source version's tip
    pub fn fork(&self, clock: &mut Clock, from_version_id: &str, name: &str) -> Result<Version> {
        let source = self.get(from_version_id)?;
        let version = self.create(clock, name, &source.tip_commit_id)?;
        info!(from = %source.name, to = %version.name, tip = %version.tip_commit_id, "forked version");
        Ok(version)
    }

    /// Point a version at another commit of the graph
    pub fn advance_tip(&self, version_id: &str, commit_id: &str) -> Result<()> {
        self.get(version_id)?;
        if !CommitGraph::new(self.backend).exists(commit_id)? {
            return Err(EngineError::not_found("commit", commit_id));
        }
        self.backend.execute(
            "UPDATE version SET tip_commit_id = ?2 WHERE id = ?1",
            &[version_id.into(), commit_id.into()],
        )?;
        Ok(())
    }

    pub fn set_working_change_set(&self, version_id: &str, change_set_id: &str) -> Result<()> {
        self.backend.execute(
            "UPDATE version SET working_change_set_id = ?2 WHERE id = ?1",
            &[version_id.into(), change_set_id.into()],
        )?;
        Ok(())
    }

    /// Configure the version consulted for entities missing from this history
    pub fn set_inheritance(&self, version_id: &str, parent: Option<&str>) -> Result<()> {
        self.get(version_id)?;
        if let Some(parent_id) = parent {
            self.get(parent_id)?;
            if parent_id == version_id || self.inheritance_chain(parent_id)?.iter().any(|v| v == version_id) {
                return Err(EngineError::CyclicGraph {
                    parent_id: parent_id.to_string(),
                    child_id: version_id.to_string(),
                });
            }
        }
        self.backend.execute(
            "UPDATE version SET inherits_from_version_id = ?2 WHERE id = ?1",
            &[version_id.into(), parent.into()],
        )?;
        Ok(())
    }

    /// Versions this one inherits from, nearest first (excluding itself)
    pub fn inheritance_chain(&self, version_id: &str) -> Result<Vec<String>> {
        let mut chain = Vec::new();
        let mut seen = HashSet::from([version_id.to_string()]);
        let mut current = self.get(version_id)?.inherits_from_version_id;
        while let Some(id) = current {
            if !seen.insert(id.clone()) {
                break;
            }
            current = self.get(&id)?.inherits_from_version_id;
            chain.push(id);
        }
        Ok(chain)
    }

    /// Versions whose inheritance chain includes `version_id`
    pub fn dependents(&self, version_id: &str) -> Result<Vec<String>> {
        let mut out = Vec::new();
        for version in self.list()? {
            if version.id != version_id
                && self
                    .inheritance_chain(&version.id)?
                    .iter()
                    .any(|v| v == version_id)
            {
                out.push(version.id);
            }
        }
        Ok(out)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::backend::SqliteBackend;
    use crate::schema;

    fn setup() -> (SqliteBackend, Clock, String) {
        let backend = SqliteBackend::open_in_memory().unwrap();
        schema::install(&backend).unwrap();
        let mut clock = Clock::deterministic(9);
        let cs = ChangeSets::new(&backend).create(&mut clock).unwrap();
        let root = CommitGraph::new(&backend)
            .create_commit(&mut clock, &cs, &[])
            .unwrap();
        (backend, clock, root.id)
    }

    #[test]
    fn test_create_and_fork() {
        let (backend, mut clock, root) = setup();
        let versions = Versions::new(&backend);
        let main = versions.create(&mut clock, "main", &root).unwrap();
        let feature = versions.fork(&mut clock, &main.id, "feature").unwrap();

        assert_eq!(feature.tip_commit_id, main.tip_commit_id);
        assert_ne!(feature.working_change_set_id, main.working_change_set_id);
        assert_eq!(versions.by_name("feature").unwrap(), Some(feature.clone()));
        let names: Vec<String> = versions.list().unwrap().into_iter().map(|v| v.name).collect();
        assert_eq!(names, vec!["feature", "main"]);
    }

    #[test]
    fn test_duplicate_name_rejected() {
        let (backend, mut clock, root) = setup();
        let versions = Versions::new(&backend);
        versions.create(&mut clock, "main", &root).unwrap();
        assert!(matches!(
            versions.create(&mut clock, "main", &root),
            Err(EngineError::InvalidOperation(_))
        ));
    }

    #[test]
    fn test_advance_tip_requires_commit() {
        let (backend, mut clock, root) = setup();
        let versions = Versions::new(&backend);
        let main = versions.create(&mut clock, "main", &root).unwrap();
        assert!(matches!(
            versions.advance_tip(&main.id, "ghost"),
            Err(EngineError::NotFound { kind: "commit", .. })
        ));
        assert_eq!(versions.get(&main.id).unwrap().tip_commit_id, root);
    }

    #[test]
    fn test_inheritance_chain_and_cycles() {
        let (backend, mut clock, root) = setup();
        let versions = Versions::new(&backend);
        let global = versions.create(&mut clock, "global", &root).unwrap();
        let main = versions.create(&mut clock, "main", &root).unwrap();
        let draft = versions.create(&mut clock, "draft", &root).unwrap();

        versions.set_inheritance(&main.id, Some(&global.id)).unwrap();
        versions.set_inheritance(&draft.id, Some(&main.id)).unwrap();
        assert_eq!(
            versions.inheritance_chain(&draft.id).unwrap(),
            vec![main.id.clone(), global.id.clone()]
        );
        assert_eq!(
            versions.dependents(&global.id).unwrap().len(),
            2
        );

        assert!(matches!(
            versions.set_inheritance(&global.id, Some(&draft.id)),
            Err(EngineError::CyclicGraph { .. })
        ));
        assert!(matches!(
            versions.set_inheritance(&main.id, Some(&main.id)),
            Err(EngineError::CyclicGraph { .. })
        ));

        versions.set_inheritance(&main.id, None).unwrap();
        assert_eq!(versions.inheritance_chain(&draft.id).unwrap(), vec![main.id]);
    }
}
