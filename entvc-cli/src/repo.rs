//! On-disk repository layout used by the `entvc` binary
//!
//! ```text
//! <repo>/entvc.db            SQLite store
//! <repo>/entvc-config.json   EngineConfig
//! <repo>/ACTIVE              id of the active version
//! <repo>/MERGE.json          merge waiting for conflict resolutions
//! ```

use anyhow::{Context, Result, anyhow, bail};
use entvc_core::{
    ClockConfig, ClockMode, ConflictResolution, Engine, EngineConfig, MergeResult, TextLinePlugin,
};
use serde::{Deserialize, Serialize};
use std::fs;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tracing::warn;

const DB_FILE: &str = "entvc.db";
const ACTIVE_FILE: &str = "ACTIVE";
const MERGE_FILE: &str = "MERGE.json";

/// Merge computed by `entvc merge` that still has open conflicts
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PendingMerge {
    pub merge: MergeResult,
    pub resolutions: Vec<ConflictResolution>,
}

impl PendingMerge {
    /// Conflicts without a resolution yet
    pub fn open_conflicts(&self) -> usize {
        self.merge
            .conflicts
            .iter()
            .filter(|c| !self.resolutions.iter().any(|r| r.key == c.key))
            .count()
    }
}

pub struct Repo {
    path: PathBuf,
    pub engine: Engine,
}

impl Repo {
    /// Create the repository directory and store
    ///
    /// With a seed the store uses a deterministic clock whose counter is
    /// persisted, so later sessions continue the same sequence.
    pub fn init(path: &Path, seed: Option<u64>) -> Result<Self> {
        if path.join(DB_FILE).exists() {
            bail!("repository already exists at {}", path.display());
        }
        fs::create_dir_all(path)
            .with_context(|| format!("Failed to create {}", path.display()))?;

        let mut config = EngineConfig::default();
        if let Some(seed) = seed {
            config.clock = ClockConfig {
                mode: ClockMode::Deterministic { seed },
                persist_counter: true,
            };
        }
        config.save(path)?;
        Self::open(path)
    }

    pub fn open(path: &Path) -> Result<Self> {
        let db_path = path.join(DB_FILE);
        if !db_path.exists() {
            bail!("no repository at {} (run `entvc init` first)", path.display());
        }
        let config = EngineConfig::load(path)?;
        let mut engine = Engine::open_path(&db_path, config)
            .with_context(|| format!("Failed to open store {}", db_path.display()))?;
        engine.register_plugin(Arc::new(TextLinePlugin::new("*")))?;

        let mut repo = Self {
            path: path.to_path_buf(),
            engine,
        };
        repo.restore_active()?;
        Ok(repo)
    }

    fn restore_active(&mut self) -> Result<()> {
        let active_path = self.path.join(ACTIVE_FILE);
        if !active_path.exists() {
            let id = self.engine.active_version_id().to_string();
            return self.set_active(&id);
        }
        let id = fs::read_to_string(&active_path)?.trim().to_string();
        if let Err(e) = self.engine.switch(&id) {
            warn!("ACTIVE points at an unknown version ({}); using main", e);
            let id = self.engine.active_version_id().to_string();
            self.set_active(&id)?;
        }
        Ok(())
    }

    /// Switch and remember the active version
    pub fn set_active(&mut self, version_id: &str) -> Result<()> {
        self.engine.switch(version_id)?;
        fs::write(self.path.join(ACTIVE_FILE), format!("{version_id}\n"))
            .context("Failed to write ACTIVE")?;
        Ok(())
    }

    pub fn active_id(&self) -> String {
        self.engine.active_version_id().to_string()
    }

    /// Look a version up by name
    pub fn version_id(&self, name: &str) -> Result<String> {
        self.engine
            .version_by_name(name)?
            .map(|v| v.id)
            .ok_or_else(|| anyhow!("no version named '{name}'"))
    }

    pub fn pending_merge(&self) -> Result<Option<PendingMerge>> {
        let merge_path = self.path.join(MERGE_FILE);
        if !merge_path.exists() {
            return Ok(None);
        }
        let data = fs::read_to_string(&merge_path).context("Failed to read MERGE.json")?;
        Ok(Some(serde_json::from_str(&data)?))
    }

    pub fn save_pending_merge(&self, pending: &PendingMerge) -> Result<()> {
        let merge_path = self.path.join(MERGE_FILE);
        let tmp_path = merge_path.with_extension("tmp");
        fs::write(&tmp_path, serde_json::to_string_pretty(pending)?)?;
        fs::rename(&tmp_path, &merge_path).context("Failed to write MERGE.json")?;
        Ok(())
    }

    /// Remove the pending merge; false when there was none
    pub fn clear_pending_merge(&self) -> Result<bool> {
        let merge_path = self.path.join(MERGE_FILE);
        if !merge_path.exists() {
            return Ok(false);
        }
        fs::remove_file(merge_path).context("Failed to remove MERGE.json")?;
        Ok(true)
    }

    /// Fail if a pending merge targets `version_id`
    ///
    /// Moving the target tip would make that merge stale.
    pub fn ensure_no_pending_merge(&self, version_id: &str) -> Result<()> {
        if let Some(pending) = self.pending_merge()? {
            if pending.merge.target_version_id == version_id {
                bail!(
                    "a merge into this version is pending; resolve its conflicts or run `entvc merge --abort`"
                );
            }
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use entvc_core::{ConflictChoice, FileWrite};
    use tempfile::TempDir;

    #[test]
    fn test_init_and_reopen_keeps_active_version() {
        let temp_dir = TempDir::new().unwrap();
        let mut repo = Repo::init(temp_dir.path(), Some(5)).unwrap();
        let main = repo.active_id();
        let feature = repo.engine.fork(&main, "feature").unwrap();
        repo.set_active(&feature.id).unwrap();
        drop(repo);

        let repo = Repo::open(temp_dir.path()).unwrap();
        assert_eq!(repo.active_id(), feature.id);
        assert_eq!(repo.version_id("main").unwrap(), main);
        assert!(repo.version_id("nope").is_err());
    }

    #[test]
    fn test_init_twice_fails() {
        let temp_dir = TempDir::new().unwrap();
        Repo::init(temp_dir.path(), None).unwrap();
        assert!(Repo::init(temp_dir.path(), None).is_err());
    }

    #[test]
    fn test_open_missing_repo_fails() {
        let temp_dir = TempDir::new().unwrap();
        assert!(Repo::open(temp_dir.path()).is_err());
    }

    #[test]
    fn test_pending_merge_round_trip() {
        let temp_dir = TempDir::new().unwrap();
        let mut repo = Repo::init(temp_dir.path(), Some(1)).unwrap();
        let main = repo.active_id();
        repo.engine
            .write_files(&main, &[FileWrite::new("f", "f.txt", "base")])
            .unwrap();
        repo.engine.commit(&main).unwrap();
        let side = repo.engine.fork(&main, "side").unwrap();
        for (version, text) in [(&side.id, "left"), (&main, "right")] {
            repo.engine
                .write_files(version, &[FileWrite::new("f", "f.txt", text)])
                .unwrap();
            repo.engine.commit(version).unwrap();
        }

        let merge = repo.engine.merge(&side.id, &main).unwrap();
        assert_eq!(merge.conflicts.len(), 1);
        let mut pending = PendingMerge {
            merge,
            resolutions: Vec::new(),
        };
        assert_eq!(pending.open_conflicts(), 1);
        repo.save_pending_merge(&pending).unwrap();

        pending.resolutions.push(ConflictResolution::new(
            pending.merge.conflicts[0].key.clone(),
            ConflictChoice::TakeSource,
        ));
        assert_eq!(pending.open_conflicts(), 0);

        let loaded = repo.pending_merge().unwrap().unwrap();
        assert_eq!(loaded.merge, pending.merge);
        assert!(repo.clear_pending_merge().unwrap());
        assert!(repo.pending_merge().unwrap().is_none());
        assert!(!repo.clear_pending_merge().unwrap());
    }

    #[test]
    fn test_pending_merge_blocks_target_until_aborted() {
        let temp_dir = TempDir::new().unwrap();
        let mut repo = Repo::init(temp_dir.path(), Some(2)).unwrap();
        let main = repo.active_id();
        repo.engine
            .write_files(&main, &[FileWrite::new("f", "f.txt", "base")])
            .unwrap();
        repo.engine.commit(&main).unwrap();
        let side = repo.engine.fork(&main, "side").unwrap();
        for (version, text) in [(&side.id, "left"), (&main, "right")] {
            repo.engine
                .write_files(version, &[FileWrite::new("f", "f.txt", text)])
                .unwrap();
            repo.engine.commit(version).unwrap();
        }
        let merge = repo.engine.merge(&side.id, &main).unwrap();
        repo.save_pending_merge(&PendingMerge {
            merge,
            resolutions: Vec::new(),
        })
        .unwrap();

        assert!(repo.ensure_no_pending_merge(&main).is_err());
        repo.ensure_no_pending_merge(&side.id).unwrap();

        assert!(repo.clear_pending_merge().unwrap());
        repo.ensure_no_pending_merge(&main).unwrap();
        let merge = repo.engine.merge(&side.id, &main).unwrap();
        assert_eq!(merge.conflicts.len(), 1);
    }
}
