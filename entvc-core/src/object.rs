//! Core record types of the change log
//!
//! Snapshots are content-addressed the same way git objects are: the id is
//! the SHA-256 of the bytes. Everything else (changes, change sets, commits,
//! versions) carries an id handed out by the engine [`crate::clock::Clock`].

use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};

/// Reserved snapshot id marking a deleted entity
pub const TOMBSTONE_SNAPSHOT_ID: &str = "no-content";

/// Content hash identifying a snapshot
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct SnapshotId(String);

impl SnapshotId {
    /// Compute the id of some content
    pub fn from_content(data: &[u8]) -> Self {
        Self(hex::encode(Sha256::digest(data)))
    }

    /// The tombstone id
    pub fn tombstone() -> Self {
        Self(TOMBSTONE_SNAPSHOT_ID.to_string())
    }

    /// Parse a stored id, accepting either a 64-char hex digest or the tombstone
    pub fn parse(raw: &str) -> Option<Self> {
        if raw == TOMBSTONE_SNAPSHOT_ID {
            return Some(Self::tombstone());
        }
        let bytes = hex::decode(raw).ok()?;
        (bytes.len() == 32).then(|| Self(raw.to_ascii_lowercase()))
    }

    pub fn is_tombstone(&self) -> bool {
        self.0 == TOMBSTONE_SNAPSHOT_ID
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl std::fmt::Display for SnapshotId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(&self.0)
    }
}

/// Identity of one entity: which file it lives in and which schema shapes it
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct EntityKey {
    pub entity_id: String,
    pub file_id: String,
    pub schema_key: String,
}

impl EntityKey {
    pub fn new(
        entity_id: impl Into<String>,
        file_id: impl Into<String>,
        schema_key: impl Into<String>,
    ) -> Self {
        Self {
            entity_id: entity_id.into(),
            file_id: file_id.into(),
            schema_key: schema_key.into(),
        }
    }
}

impl std::fmt::Display for EntityKey {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}/{}#{}", self.file_id, self.schema_key, self.entity_id)
    }
}

/// One immutable logical mutation of one entity
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Change {
    pub id: String,
    pub entity_id: String,
    pub file_id: String,
    pub schema_key: String,
    pub schema_version: String,
    pub plugin_key: String,
    pub snapshot_id: SnapshotId,
    pub created_at: String,
}

impl Change {
    pub fn key(&self) -> EntityKey {
        EntityKey::new(&self.entity_id, &self.file_id, &self.schema_key)
    }

    pub fn is_tombstone(&self) -> bool {
        self.snapshot_id.is_tombstone()
    }
}

/// Latest change for one entity within a change set
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ChangeSetElement {
    pub change_set_id: String,
    pub change_id: String,
    pub entity_id: String,
    pub file_id: String,
    pub schema_key: String,
}

impl ChangeSetElement {
    pub fn key(&self) -> EntityKey {
        EntityKey::new(&self.entity_id, &self.file_id, &self.schema_key)
    }
}

/// Node of the commit graph
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Commit {
    pub id: String,
    pub change_set_id: String,
    pub created_at: String,
    /// Parent ids in edge order (empty for a root, two or more for a merge)
    pub parent_ids: Vec<String>,
}

impl Commit {
    pub fn is_root(&self) -> bool {
        self.parent_ids.is_empty()
    }

    pub fn is_merge(&self) -> bool {
        self.parent_ids.len() > 1
    }
}

/// Named, movable pointer into the commit graph
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Version {
    pub id: String,
    pub name: String,
    pub tip_commit_id: String,
    pub working_change_set_id: String,
    /// Version consulted for entities this version's own history never touched
    pub inherits_from_version_id: Option<String>,
}

/// Materialized value of one entity in one version
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize)]
pub struct StateRow {
    pub entity_id: String,
    pub file_id: String,
    pub schema_key: String,
    pub version_id: String,
    pub plugin_key: String,
    pub snapshot_id: SnapshotId,
    pub change_id: String,
    pub commit_id: String,
    pub inherited_from_version_id: Option<String>,
    pub is_tombstone: bool,
}

impl StateRow {
    pub fn key(&self) -> EntityKey {
        EntityKey::new(&self.entity_id, &self.file_id, &self.schema_key)
    }
}

/// Outcome of resolving one entity in a version
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ResolvedEntity {
    Present(StateRow),
    /// The nearest change deleted the entity
    Tombstone(StateRow),
    Absent,
}

impl ResolvedEntity {
    pub(crate) fn from_row(row: StateRow) -> Self {
        if row.is_tombstone {
            ResolvedEntity::Tombstone(row)
        } else {
            ResolvedEntity::Present(row)
        }
    }

    pub fn row(&self) -> Option<&StateRow> {
        match self {
            ResolvedEntity::Present(row) | ResolvedEntity::Tombstone(row) => Some(row),
            ResolvedEntity::Absent => None,
        }
    }

    pub fn is_present(&self) -> bool {
        matches!(self, ResolvedEntity::Present(_))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_snapshot_id_is_content_hash() {
        let a = SnapshotId::from_content(b"hello world");
        let b = SnapshotId::from_content(b"hello world");
        let c = SnapshotId::from_content(b"hello world!");
        assert_eq!(a, b);
        assert_ne!(a, c);
        assert_eq!(a.as_str().len(), 64);
        assert!(!a.is_tombstone());
    }

    #[test]
    fn test_snapshot_id_parse() {
        let id = SnapshotId::from_content(b"x");
        assert_eq!(SnapshotId::parse(id.as_str()), Some(id));
        assert!(SnapshotId::parse(TOMBSTONE_SNAPSHOT_ID).unwrap().is_tombstone());
        assert_eq!(SnapshotId::parse("zz"), None);
        assert_eq!(SnapshotId::parse("abcd"), None);
    }

    #[test]
    fn test_entity_key_display() {
        let key = EntityKey::new("line:3", "readme", "entvc_text_line");
        assert_eq!(key.to_string(), "readme/entvc_text_line#line:3");
    }

    #[test]
    fn test_resolved_entity_from_row() {
        let row = StateRow {
            entity_id: "e".into(),
            file_id: "f".into(),
            schema_key: "s".into(),
            version_id: "v".into(),
            plugin_key: "p".into(),
            snapshot_id: SnapshotId::tombstone(),
            change_id: "c".into(),
            commit_id: "k".into(),
            inherited_from_version_id: None,
            is_tombstone: true,
        };
        let resolved = ResolvedEntity::from_row(row);
        assert!(!resolved.is_present());
        assert!(resolved.row().is_some());
        assert!(ResolvedEntity::Absent.row().is_none());
    }
}
