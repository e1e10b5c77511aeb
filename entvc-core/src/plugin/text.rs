//! Line-oriented text plugin
//!
//! Each line is one entity (`line:<index>`) holding `{"text": "..."}`.
//! Lines are split on `\n` only, so `\r` and a trailing newline survive the
//! round trip unchanged.

use super::{ChangePlugin, DetectedChange, PluginError};
use crate::schema_registry::{EntitySchema, PropertyType};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

pub const TEXT_PLUGIN_KEY: &str = "entvc_text_lines";
pub const TEXT_LINE_SCHEMA: &str = "entvc_text_line";
pub const TEXT_LINE_SCHEMA_VERSION: &str = "1";

#[derive(Debug, Serialize, Deserialize)]
struct LineContent {
    text: String,
}

/// Plugin treating every line of a UTF-8 file as an entity
#[derive(Debug, Clone)]
pub struct TextLinePlugin {
    glob: String,
}

impl TextLinePlugin {
    /// Plugin matching `glob` (for example `*.txt` or `*`)
    pub fn new(glob: impl Into<String>) -> Self {
        Self { glob: glob.into() }
    }

    pub fn schema() -> EntitySchema {
        EntitySchema::new(TEXT_LINE_SCHEMA, TEXT_LINE_SCHEMA_VERSION)
            .property("text", PropertyType::String, true)
            .closed()
    }

    fn lines(data: Option<&[u8]>) -> Result<Vec<&str>, PluginError> {
        match data {
            None => Ok(Vec::new()),
            Some(bytes) => {
                let text = std::str::from_utf8(bytes)
                    .map_err(|e| PluginError::new(format!("file is not valid UTF-8: {e}")))?;
                Ok(text.split('\n').collect())
            }
        }
    }

    fn entity_id(index: usize) -> String {
        format!("line:{index}")
    }

    fn index_of(entity_id: &str) -> Result<usize, PluginError> {
        entity_id
            .strip_prefix("line:")
            .and_then(|n| n.parse().ok())
            .ok_or_else(|| PluginError::new(format!("unexpected entity id '{entity_id}'")))
    }

    fn encode(line: &str) -> Result<Vec<u8>, PluginError> {
        serde_json::to_vec(&LineContent {
            text: line.to_string(),
        })
        .map_err(|e| PluginError::new(e.to_string()))
    }
}

impl Default for TextLinePlugin {
    fn default() -> Self {
        Self::new("*.txt")
    }
}

impl ChangePlugin for TextLinePlugin {
    fn key(&self) -> &str {
        TEXT_PLUGIN_KEY
    }

    fn detect_changes_glob(&self) -> &str {
        &self.glob
    }

    fn schemas(&self) -> Vec<EntitySchema> {
        vec![Self::schema()]
    }

    fn detect_changes(
        &self,
        before: Option<&[u8]>,
        after: Option<&[u8]>,
    ) -> Result<Vec<DetectedChange>, PluginError> {
        let old = Self::lines(before)?;
        let new = Self::lines(after)?;

        let mut changes = Vec::new();
        for (index, line) in new.iter().enumerate() {
            if old.get(index) != Some(line) {
                changes.push(DetectedChange::upsert(
                    Self::entity_id(index),
                    TEXT_LINE_SCHEMA,
                    TEXT_LINE_SCHEMA_VERSION,
                    Self::encode(line)?,
                ));
            }
        }
        for index in new.len()..old.len() {
            changes.push(DetectedChange::delete(
                Self::entity_id(index),
                TEXT_LINE_SCHEMA,
                TEXT_LINE_SCHEMA_VERSION,
            ));
        }
        Ok(changes)
    }

    fn apply_changes(
        &self,
        current: Option<&[u8]>,
        changes: &[DetectedChange],
    ) -> Result<Vec<u8>, PluginError> {
        let mut lines: BTreeMap<usize, String> = Self::lines(current)?
            .into_iter()
            .enumerate()
            .map(|(i, line)| (i, line.to_string()))
            .collect();

        for change in changes {
            let index = Self::index_of(&change.entity_id)?;
            match &change.content {
                Some(content) => {
                    let line: LineContent = serde_json::from_slice(content)
                        .map_err(|e| PluginError::new(format!("{}: {e}", change.entity_id)))?;
                    lines.insert(index, line.text);
                }
                None => {
                    lines.remove(&index);
                }
            }
        }

        Ok(lines.into_values().collect::<Vec<_>>().join("\n").into_bytes())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;

    fn round_trip(before: Option<&str>, after: &str) -> String {
        let plugin = TextLinePlugin::default();
        let before = before.map(str::as_bytes);
        let changes = plugin.detect_changes(before, Some(after.as_bytes())).unwrap();
        String::from_utf8(plugin.apply_changes(before, &changes).unwrap()).unwrap()
    }

    #[test]
    fn test_detect_only_changed_lines() {
        let plugin = TextLinePlugin::default();
        let changes = plugin
            .detect_changes(Some(b"a\nb\nc"), Some(b"a\nB\nc"))
            .unwrap();
        assert_eq!(changes.len(), 1);
        assert_eq!(changes[0].entity_id, "line:1");
        assert_eq!(changes[0].content.as_deref(), Some(&br#"{"text":"B"}"#[..]));
    }

    #[test]
    fn test_shrinking_file_deletes_tail() {
        let plugin = TextLinePlugin::default();
        let changes = plugin.detect_changes(Some(b"a\nb\nc"), Some(b"a")).unwrap();
        let deleted: Vec<&str> = changes
            .iter()
            .filter(|c| c.content.is_none())
            .map(|c| c.entity_id.as_str())
            .collect();
        assert_eq!(deleted, vec!["line:1", "line:2"]);
    }

    #[test]
    fn test_round_trip_edge_cases() {
        assert_eq!(round_trip(None, ""), "");
        assert_eq!(round_trip(Some("x\n"), "x\n"), "x\n");
        assert_eq!(round_trip(Some("one\r\ntwo"), "one\ntwo\n"), "one\ntwo\n");
        assert_eq!(round_trip(Some("a\nb\nc\nd"), ""), "");
    }

    #[test]
    fn test_invalid_utf8_is_plugin_error() {
        let plugin = TextLinePlugin::default();
        assert!(plugin.detect_changes(None, Some(&[0xff, 0xfe])).is_err());
    }

    #[test]
    fn test_detect_is_deterministic() {
        let plugin = TextLinePlugin::default();
        let a = plugin.detect_changes(Some(b"1\n2"), Some(b"2\n1\n3")).unwrap();
        let b = plugin.detect_changes(Some(b"1\n2"), Some(b"2\n1\n3")).unwrap();
        assert_eq!(a, b);
    }

    #[test]
    fn test_schema_accepts_emitted_content() {
        let plugin = TextLinePlugin::default();
        let schema = TextLinePlugin::schema();
        for change in plugin.detect_changes(None, Some(b"x\n\"quoted\"")).unwrap() {
            schema.validate(change.content.as_deref().unwrap()).unwrap();
        }
    }

    proptest! {
        #[test]
        fn prop_apply_inverts_detect(
            before in proptest::option::of("[a-c\n]{0,24}"),
            after in "[a-c\n\r ]{0,24}",
        ) {
            prop_assert_eq!(round_trip(before.as_deref(), &after), after);
        }
    }
}
