//! Error type shared by every engine component

/// Result type for engine operations
pub type Result<T> = std::result::Result<T, EngineError>;

/// Errors that can occur while operating the change-control engine
///
/// Merge conflicts are not errors: they are returned as data in
/// [`crate::merge::MergeResult`].
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum EngineError {
    #[error("{kind} not found: {id}")]
    NotFound { kind: &'static str, id: String },

    #[error("Content rejected by schema '{schema_key}': {reason}")]
    SchemaValidation { schema_key: String, reason: String },

    #[error("Plugin '{plugin_key}' failed on file '{file_id}' ({path}): {reason}")]
    PluginDetection {
        file_id: String,
        path: String,
        plugin_key: String,
        reason: String,
    },

    #[error("Edge {parent_id} -> {child_id} would create a cycle")]
    CyclicGraph { parent_id: String, child_id: String },

    #[error("Storage transaction failed: {0}")]
    StorageTransaction(String),

    #[error("State cache for version {version_id} differs from the log in {differing} row(s)")]
    CacheInconsistency { version_id: String, differing: usize },

    #[error("Merge still has {count} unresolved conflict(s)")]
    UnresolvedConflicts { count: usize },

    #[error("Invalid operation: {0}")]
    InvalidOperation(String),

    #[error("Serialization error: {0}")]
    Serialization(String),
}

impl EngineError {
    pub(crate) fn not_found(kind: &'static str, id: impl Into<String>) -> Self {
        Self::NotFound {
            kind,
            id: id.into(),
        }
    }

    /// Whether the caller can reasonably retry or recover from this error
    pub fn is_recoverable(&self) -> bool {
        matches!(
            self,
            Self::NotFound { .. }
                | Self::SchemaValidation { .. }
                | Self::PluginDetection { .. }
                | Self::UnresolvedConflicts { .. }
                | Self::InvalidOperation(_)
        )
    }
}

impl From<rusqlite::Error> for EngineError {
    fn from(err: rusqlite::Error) -> Self {
        Self::StorageTransaction(err.to_string())
    }
}

impl From<serde_json::Error> for EngineError {
    fn from(err: serde_json::Error) -> Self {
        Self::Serialization(err.to_string())
    }
}
