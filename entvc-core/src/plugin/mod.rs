//! Plugin protocol and registry
//!
//! A plugin turns file bytes into logical entity changes and back:
//!
//! - `detect_changes(before, after)` must be pure: the same inputs always
//!   produce the same changes.
//! - `apply_changes(before, detect_changes(before, after))` reproduces
//!   `after` byte for byte.
//!
//! The registry is an ordered list of `(pattern, plugin)` pairs; the first
//! pattern that matches a path selects the plugin.

pub mod text;

use crate::change_log::NewChange;
use crate::error::{EngineError, Result};
use crate::object::{Change, EntityKey};
use crate::schema_registry::EntitySchema;
use std::sync::Arc;

/// Failure reported by a plugin implementation
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
#[error("{0}")]
pub struct PluginError(pub String);

impl PluginError {
    pub fn new(msg: impl Into<String>) -> Self {
        Self(msg.into())
    }
}

/// One logical change produced by [`ChangePlugin::detect_changes`]
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DetectedChange {
    pub entity_id: String,
    pub schema_key: String,
    pub schema_version: String,
    /// `None` marks a deletion
    pub content: Option<Vec<u8>>,
}

impl DetectedChange {
    pub fn upsert(
        entity_id: impl Into<String>,
        schema_key: impl Into<String>,
        schema_version: impl Into<String>,
        content: impl Into<Vec<u8>>,
    ) -> Self {
        Self {
            entity_id: entity_id.into(),
            schema_key: schema_key.into(),
            schema_version: schema_version.into(),
            content: Some(content.into()),
        }
    }

    pub fn delete(
        entity_id: impl Into<String>,
        schema_key: impl Into<String>,
        schema_version: impl Into<String>,
    ) -> Self {
        Self {
            entity_id: entity_id.into(),
            schema_key: schema_key.into(),
            schema_version: schema_version.into(),
            content: None,
        }
    }

    /// Turn the detected change into log input for one file
    pub fn into_new_change(self, file_id: &str, plugin_key: &str) -> NewChange {
        let key = EntityKey::new(self.entity_id, file_id, self.schema_key);
        NewChange {
            key,
            schema_version: self.schema_version,
            plugin_key: plugin_key.to_string(),
            content: self.content,
        }
    }
}

/// A file-format module the engine drives
pub trait ChangePlugin: Send + Sync {
    /// Unique plugin key stored on every change it produces
    fn key(&self) -> &str;

    /// Path pattern selecting the files this plugin handles
    fn detect_changes_glob(&self) -> &str;

    /// Schemas of the entities this plugin emits
    fn schemas(&self) -> Vec<EntitySchema> {
        Vec::new()
    }

    fn detect_changes(
        &self,
        before: Option<&[u8]>,
        after: Option<&[u8]>,
    ) -> std::result::Result<Vec<DetectedChange>, PluginError>;

    fn apply_changes(
        &self,
        current: Option<&[u8]>,
        changes: &[DetectedChange],
    ) -> std::result::Result<Vec<u8>, PluginError>;

    /// Entity ids that need manual resolution beyond snapshot divergence
    ///
    /// Receives the changes each merge side made to entities of this plugin.
    fn detect_conflicts(&self, _source: &[Change], _target: &[Change]) -> Vec<String> {
        Vec::new()
    }
}

/// Parsed form of a `detect_changes_glob`
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum GlobPattern {
    /// `*` or `**/*`
    Any,
    /// `*.ext` or `**/*.ext`, compared case-insensitively
    Extension(String),
    /// `dir/*` or `dir/**`
    Prefix(String),
    Exact(String),
}

impl GlobPattern {
    pub fn parse(pattern: &str) -> Self {
        let trimmed = pattern.trim().trim_start_matches("./");
        let body = trimmed.strip_prefix("**/").unwrap_or(trimmed);
        if body == "*" || body == "**" {
            return GlobPattern::Any;
        }
        if let Some(ext) = body.strip_prefix("*.") {
            if !ext.contains('/') && !ext.contains('*') {
                return GlobPattern::Extension(ext.to_ascii_lowercase());
            }
        }
        if let Some(prefix) = trimmed
            .strip_suffix("/**")
            .or_else(|| trimmed.strip_suffix("/*"))
        {
            return GlobPattern::Prefix(format!("{prefix}/"));
        }
        GlobPattern::Exact(trimmed.to_string())
    }

    pub fn matches(&self, path: &str) -> bool {
        let path = path.trim_start_matches('/');
        match self {
            GlobPattern::Any => true,
            GlobPattern::Extension(ext) => {
                let name = path.rsplit('/').next().unwrap_or(path);
                name.rsplit_once('.')
                    .is_some_and(|(stem, e)| !stem.is_empty() && e.eq_ignore_ascii_case(ext))
            }
            GlobPattern::Prefix(prefix) => path.starts_with(prefix.as_str()),
            GlobPattern::Exact(exact) => path == exact,
        }
    }
}

/// Ordered plugin registry; first matching pattern wins
#[derive(Default, Clone)]
pub struct PluginRegistry {
    entries: Vec<(GlobPattern, Arc<dyn ChangePlugin>)>,
}

impl PluginRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Add a plugin after every existing one
    pub fn register(&mut self, plugin: Arc<dyn ChangePlugin>) -> Result<()> {
        if self.get(plugin.key()).is_some() {
            return Err(EngineError::InvalidOperation(format!(
                "plugin '{}' is already registered",
                plugin.key()
            )));
        }
        let pattern = GlobPattern::parse(plugin.detect_changes_glob());
        self.entries.push((pattern, plugin));
        Ok(())
    }

    /// Plugin handling `path`, if any
    pub fn resolve(&self, path: &str) -> Option<&Arc<dyn ChangePlugin>> {
        self.entries
            .iter()
            .find(|(pattern, _)| pattern.matches(path))
            .map(|(_, plugin)| plugin)
    }

    pub fn get(&self, key: &str) -> Option<&Arc<dyn ChangePlugin>> {
        self.entries
            .iter()
            .map(|(_, plugin)| plugin)
            .find(|plugin| plugin.key() == key)
    }

    pub fn keys(&self) -> Vec<String> {
        self.entries
            .iter()
            .map(|(_, plugin)| plugin.key().to_string())
            .collect()
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}

impl std::fmt::Debug for PluginRegistry {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PluginRegistry")
            .field("plugins", &self.keys())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    struct Fixed {
        key: &'static str,
        glob: &'static str,
    }

    impl ChangePlugin for Fixed {
        fn key(&self) -> &str {
            self.key
        }

        fn detect_changes_glob(&self) -> &str {
            self.glob
        }

        fn detect_changes(
            &self,
            _before: Option<&[u8]>,
            _after: Option<&[u8]>,
        ) -> std::result::Result<Vec<DetectedChange>, PluginError> {
            Ok(Vec::new())
        }

        fn apply_changes(
            &self,
            _current: Option<&[u8]>,
            _changes: &[DetectedChange],
        ) -> std::result::Result<Vec<u8>, PluginError> {
            Ok(Vec::new())
        }
    }

    fn fixed(key: &'static str, glob: &'static str) -> Arc<dyn ChangePlugin> {
        Arc::new(Fixed { key, glob })
    }

    #[test]
    fn test_glob_parse() {
        assert_eq!(GlobPattern::parse("*"), GlobPattern::Any);
        assert_eq!(GlobPattern::parse("**/*"), GlobPattern::Any);
        assert_eq!(GlobPattern::parse("*.CSV"), GlobPattern::Extension("csv".into()));
        assert_eq!(GlobPattern::parse("**/*.md"), GlobPattern::Extension("md".into()));
        assert_eq!(GlobPattern::parse("docs/*"), GlobPattern::Prefix("docs/".into()));
        assert_eq!(GlobPattern::parse("docs/**"), GlobPattern::Prefix("docs/".into()));
        assert_eq!(GlobPattern::parse("a/b.txt"), GlobPattern::Exact("a/b.txt".into()));
    }

    #[test]
    fn test_glob_matches() {
        let md = GlobPattern::parse("*.md");
        assert!(md.matches("README.MD"));
        assert!(md.matches("/docs/intro.md"));
        assert!(!md.matches("notes.mdx"));
        assert!(!md.matches(".md"));

        let docs = GlobPattern::parse("docs/*");
        assert!(docs.matches("docs/a.txt"));
        assert!(docs.matches("/docs/deep/b.txt"));
        assert!(!docs.matches("documents/a.txt"));
    }

    #[test]
    fn test_first_match_wins() {
        let mut registry = PluginRegistry::new();
        registry.register(fixed("markdown", "*.md")).unwrap();
        registry.register(fixed("fallback", "*")).unwrap();

        assert_eq!(registry.resolve("a.md").unwrap().key(), "markdown");
        assert_eq!(registry.resolve("a.csv").unwrap().key(), "fallback");
        assert_eq!(registry.keys(), vec!["markdown", "fallback"]);
    }

    #[test]
    fn test_duplicate_key_rejected() {
        let mut registry = PluginRegistry::new();
        registry.register(fixed("p", "*.a")).unwrap();
        assert!(matches!(
            registry.register(fixed("p", "*.b")),
            Err(EngineError::InvalidOperation(_))
        ));
        assert_eq!(registry.len(), 1);
        assert!(registry.resolve("x.b").is_none());
    }
}
