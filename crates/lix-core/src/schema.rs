//! Schema definitions — the `x-lix-*` annotated JSON Schema format.
//!
//! A schema is identified by `(key, version)` and declares at minimum a
//! primary key. Definitions are immutable once referenced by a change; the
//! registry in the engine crate enforces that.

use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::{Error, Result};

// ─── Constraint metadata ─────────────────────────────────────────────────────

/// A foreign key: local pointer paths referencing properties of another
/// schema. Declared as `x-lix-foreign-keys`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ForeignKey {
  pub properties: Vec<String>,
  pub references: ForeignKeyTarget,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ForeignKeyTarget {
  #[serde(rename = "schemaKey", alias = "schema_key")]
  pub schema_key: String,
  pub properties: Vec<String>,
}

/// Which derived views the external query layer may synthesize for a schema.
/// Declared as `x-lix-entity-views`; all permitted when absent.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct ViewPolicy {
  pub base:    bool,
  pub all:     bool,
  pub history: bool,
}

impl Default for ViewPolicy {
  fn default() -> Self {
    Self { base: true, all: true, history: true }
  }
}

// ─── Property typing ─────────────────────────────────────────────────────────

/// Declared type of a top-level property; drives the typed column generated
/// in the per-schema state-cache table.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum PropertyKind {
  String,
  Integer,
  Number,
  Boolean,
  /// Objects, arrays, unions — stored as serialized JSON.
  Json,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PropertyDef {
  pub name: String,
  pub kind: PropertyKind,
}

// ─── SchemaDefinition ────────────────────────────────────────────────────────

/// A parsed, validated schema definition.
///
/// `primary_key` and `unique` paths are normalized JSON pointers (leading
/// slash); the raw definition is retained verbatim for storage and for
/// plugins that round-trip it.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SchemaDefinition {
  pub key:          String,
  pub version:      String,
  pub primary_key:  Vec<String>,
  pub unique:       Vec<Vec<String>>,
  pub foreign_keys: Vec<ForeignKey>,
  pub views:        ViewPolicy,
  pub properties:   Vec<PropertyDef>,
  pub raw:          Value,
}

impl SchemaDefinition {
  /// Parse and validate a raw `x-lix-*` annotated JSON Schema object.
  ///
  /// Fails with [`Error::InvalidSchema`] when the primary key is missing
  /// (required for history and cache views), when `type` is not `object`,
  /// or when `additionalProperties: false` conflicts with a constraint path
  /// naming an undeclared property.
  pub fn from_value(raw: Value) -> Result<Self> {
    let key = required_str(&raw, "x-lix-key")?;
    let invalid = |reason: String| Error::InvalidSchema {
      schema_key: key.clone(),
      reason,
    };

    if raw.get("type").and_then(Value::as_str) != Some("object") {
      return Err(invalid("schema type must be \"object\"".into()));
    }

    let version = raw
      .get("x-lix-version")
      .and_then(Value::as_str)
      .ok_or_else(|| invalid("missing x-lix-version".into()))?
      .to_owned();

    let primary_key = pointer_list(raw.get("x-lix-primary-key"))
      .ok_or_else(|| invalid("missing x-lix-primary-key".into()))?;
    if primary_key.is_empty() {
      return Err(invalid("x-lix-primary-key must not be empty".into()));
    }

    let unique: Vec<Vec<String>> = match raw.get("x-lix-unique") {
      None => Vec::new(),
      Some(Value::Array(groups)) => {
        let mut out = Vec::with_capacity(groups.len());
        for group in groups {
          out.push(
            pointer_list(Some(group))
              .filter(|paths| !paths.is_empty())
              .ok_or_else(|| {
                invalid("x-lix-unique must be an array of non-empty path arrays".into())
              })?,
          );
        }
        out
      }
      Some(_) => return Err(invalid("x-lix-unique must be an array".into())),
    };

    let mut foreign_keys: Vec<ForeignKey> = match raw.get("x-lix-foreign-keys") {
      None => Vec::new(),
      Some(value) => serde_json::from_value(value.clone())
        .map_err(|e| invalid(format!("malformed x-lix-foreign-keys: {e}")))?,
    };
    for fk in &mut foreign_keys {
      for path in fk
        .properties
        .iter_mut()
        .chain(fk.references.properties.iter_mut())
      {
        *path = normalize_pointer(path);
      }
    }

    let views: ViewPolicy = match raw.get("x-lix-entity-views") {
      None => ViewPolicy::default(),
      Some(value) => serde_json::from_value(value.clone())
        .map_err(|e| invalid(format!("malformed x-lix-entity-views: {e}")))?,
    };

    let properties = parse_properties(&raw);

    // With additionalProperties: false, every constraint path must land on a
    // declared property.
    let closed = raw.get("additionalProperties") == Some(&Value::Bool(false));
    if closed {
      let declared: Vec<&str> =
        properties.iter().map(|p| p.name.as_str()).collect();
      let all_paths = primary_key
        .iter()
        .chain(unique.iter().flatten())
        .chain(foreign_keys.iter().flat_map(|fk| fk.properties.iter()));
      for path in all_paths {
        let head = pointer_head(path);
        if !declared.contains(&head) {
          return Err(invalid(format!(
            "constraint path {path:?} names undeclared property {head:?} \
             but additionalProperties is false"
          )));
        }
      }
    }

    Ok(Self {
      key,
      version,
      primary_key,
      unique,
      foreign_keys,
      views,
      properties,
      raw,
    })
  }

  /// Extract the values at `paths` from a snapshot payload. Returns `None`
  /// when any path is absent — constraint checks treat partially-missing
  /// tuples as non-participating.
  pub fn values_at<'a>(
    content: &'a Value,
    paths: &[String],
  ) -> Option<Vec<&'a Value>> {
    paths.iter().map(|p| content.pointer(p)).collect()
  }
}

// ─── Helpers ─────────────────────────────────────────────────────────────────

/// Normalize a declared path (`"name"` or `"/name"`) to a JSON pointer.
pub fn normalize_pointer(path: &str) -> String {
  if path.starts_with('/') {
    path.to_owned()
  } else {
    format!("/{path}")
  }
}

/// First segment of a JSON pointer — the top-level property it addresses.
pub fn pointer_head(pointer: &str) -> &str {
  let trimmed = pointer.trim_start_matches('/');
  trimmed.split('/').next().unwrap_or(trimmed)
}

fn required_str(raw: &Value, field: &str) -> Result<String> {
  raw
    .get(field)
    .and_then(Value::as_str)
    .map(str::to_owned)
    .ok_or_else(|| Error::InvalidSchema {
      schema_key: raw
        .get("x-lix-key")
        .and_then(Value::as_str)
        .unwrap_or("<unknown>")
        .to_owned(),
      reason: format!("missing {field}"),
    })
}

fn pointer_list(value: Option<&Value>) -> Option<Vec<String>> {
  let items = value?.as_array()?;
  items
    .iter()
    .map(|v| v.as_str().map(normalize_pointer))
    .collect()
}

fn parse_properties(raw: &Value) -> Vec<PropertyDef> {
  let Some(props) = raw.get("properties").and_then(Value::as_object) else {
    return Vec::new();
  };
  props
    .iter()
    .map(|(name, decl)| {
      let kind = match decl.get("type").and_then(Value::as_str) {
        Some("string") => PropertyKind::String,
        Some("integer") => PropertyKind::Integer,
        Some("number") => PropertyKind::Number,
        Some("boolean") => PropertyKind::Boolean,
        _ => PropertyKind::Json,
      };
      PropertyDef { name: name.clone(), kind }
    })
    .collect()
}

#[cfg(test)]
mod tests {
  use serde_json::json;

  use super::*;

  fn contact_schema() -> Value {
    json!({
      "type": "object",
      "x-lix-key": "contact",
      "x-lix-version": "1.0",
      "x-lix-primary-key": ["/id"],
      "x-lix-unique": [["/email"]],
      "properties": {
        "id": { "type": "string" },
        "email": { "type": "string" },
        "age": { "type": "integer" },
        "address": { "type": "object" }
      }
    })
  }

  #[test]
  fn parses_constraints_and_property_kinds() {
    let schema = SchemaDefinition::from_value(contact_schema()).unwrap();
    assert_eq!(schema.key, "contact");
    assert_eq!(schema.primary_key, vec!["/id".to_owned()]);
    assert_eq!(schema.unique, vec![vec!["/email".to_owned()]]);

    let address = schema
      .properties
      .iter()
      .find(|p| p.name == "address")
      .unwrap();
    assert_eq!(address.kind, PropertyKind::Json);
  }

  #[test]
  fn missing_primary_key_is_invalid() {
    let mut raw = contact_schema();
    raw.as_object_mut().unwrap().remove("x-lix-primary-key");
    let err = SchemaDefinition::from_value(raw).unwrap_err();
    assert!(matches!(err, Error::InvalidSchema { .. }));
  }

  #[test]
  fn closed_schema_rejects_undeclared_constraint_path() {
    let mut raw = contact_schema();
    let obj = raw.as_object_mut().unwrap();
    obj.insert("additionalProperties".into(), json!(false));
    obj.insert("x-lix-unique".into(), json!([["/nickname"]]));
    let err = SchemaDefinition::from_value(raw).unwrap_err();
    assert!(matches!(err, Error::InvalidSchema { .. }));
  }

  #[test]
  fn bare_paths_are_normalized_to_pointers() {
    let mut raw = contact_schema();
    raw
      .as_object_mut()
      .unwrap()
      .insert("x-lix-primary-key".into(), json!(["id"]));
    let schema = SchemaDefinition::from_value(raw).unwrap();
    assert_eq!(schema.primary_key, vec!["/id".to_owned()]);
  }

  #[test]
  fn nested_pointer_values_resolve() {
    let content = json!({ "address": { "street": "Baker St" } });
    let values = SchemaDefinition::values_at(
      &content,
      &["/address/street".to_owned()],
    )
    .unwrap();
    assert_eq!(values, vec![&json!("Baker St")]);
  }
}
