//! Entity schemas
//!
//! Every change carries `(schema_key, schema_version)`. Snapshot content is
//! JSON and must match the registered schema before a change is written.

use crate::backend::{Backend, text_at};
use crate::error::{EngineError, Result};
use serde::{Deserialize, Serialize};
use serde_json::Value as Json;
use std::collections::BTreeMap;

/// JSON type a property must have
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum PropertyType {
    String,
    Number,
    Integer,
    Boolean,
    Object,
    Array,
    Null,
    Any,
}

impl PropertyType {
    fn accepts(self, value: &Json) -> bool {
        match self {
            PropertyType::String => value.is_string(),
            PropertyType::Number => value.is_number(),
            PropertyType::Integer => value.is_i64() || value.is_u64(),
            PropertyType::Boolean => value.is_boolean(),
            PropertyType::Object => value.is_object(),
            PropertyType::Array => value.is_array(),
            PropertyType::Null => value.is_null(),
            PropertyType::Any => true,
        }
    }
}

/// Shape of the entities stored under one schema key and version
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct EntitySchema {
    pub key: String,
    pub version: String,
    #[serde(default)]
    pub properties: BTreeMap<String, PropertyType>,
    #[serde(default)]
    pub required: Vec<String>,
    #[serde(default = "default_additional_properties")]
    pub additional_properties: bool,
}

fn default_additional_properties() -> bool {
    true
}

impl EntitySchema {
    pub fn new(key: impl Into<String>, version: impl Into<String>) -> Self {
        Self {
            key: key.into(),
            version: version.into(),
            properties: BTreeMap::new(),
            required: Vec::new(),
            additional_properties: true,
        }
    }

    /// Declare a property; `required` adds it to the required list
    pub fn property(mut self, name: &str, ty: PropertyType, required: bool) -> Self {
        self.properties.insert(name.to_string(), ty);
        if required {
            self.required.push(name.to_string());
        }
        self
    }

    pub fn closed(mut self) -> Self {
        self.additional_properties = false;
        self
    }

    /// Check content bytes against this schema
    pub fn validate(&self, content: &[u8]) -> std::result::Result<(), String> {
        let value: Json =
            serde_json::from_slice(content).map_err(|e| format!("content is not JSON: {e}"))?;
        let object = value
            .as_object()
            .ok_or_else(|| "content must be a JSON object".to_string())?;

        for name in &self.required {
            if !object.contains_key(name) {
                return Err(format!("missing required property '{name}'"));
            }
        }
        for (name, value) in object {
            match self.properties.get(name) {
                Some(ty) if !ty.accepts(value) => {
                    return Err(format!("property '{name}' must be of type {ty:?}"));
                }
                None if !self.additional_properties => {
                    return Err(format!("unexpected property '{name}'"));
                }
                _ => {}
            }
        }
        Ok(())
    }
}

/// Stored schemas, keyed by `(key, version)`
pub struct SchemaRegistry<'a> {
    backend: &'a dyn Backend,
}

impl<'a> SchemaRegistry<'a> {
    pub fn new(backend: &'a dyn Backend) -> Self {
        Self { backend }
    }

    /// Register (or replace) a schema definition
    pub fn register(&self, schema: &EntitySchema) -> Result<()> {
        let definition = serde_json::to_string(schema)?;
        self.backend.execute(
            "INSERT INTO stored_schema (key, version, definition) VALUES (?1, ?2, ?3) \
             ON CONFLICT (key, version) DO UPDATE SET definition = excluded.definition",
            &[
                schema.key.as_str().into(),
                schema.version.as_str().into(),
                definition.into(),
            ],
        )?;
        Ok(())
    }

    pub fn get(&self, key: &str, version: &str) -> Result<Option<EntitySchema>> {
        let result = self.backend.execute(
            "SELECT definition FROM stored_schema WHERE key = ?1 AND version = ?2",
            &[key.into(), version.into()],
        )?;
        match result.first() {
            Some(row) => Ok(Some(serde_json::from_str(&text_at(row, 0, "definition")?)?)),
            None => Ok(None),
        }
    }

    /// Validate content for a change; unknown schemas are rejected
    pub fn validate(&self, key: &str, version: &str, content: &[u8]) -> Result<()> {
        let schema = self
            .get(key, version)?
            .ok_or_else(|| EngineError::SchemaValidation {
                schema_key: key.to_string(),
                reason: format!("schema version '{version}' is not registered"),
            })?;
        schema
            .validate(content)
            .map_err(|reason| EngineError::SchemaValidation {
                schema_key: key.to_string(),
                reason,
            })
    }
}
