//! Schema registry — stores `x-lix-*` definitions and generates the
//! per-schema state-cache tables.
//!
//! Table/column definitions are generated once at registration time (never
//! per query) and cached in memory keyed by schema identity; the registry's
//! generation counter lets readers detect when cached definitions are stale.

use std::collections::BTreeMap;

use lix_core::schema::{PropertyKind, SchemaDefinition};
use rusqlite::OptionalExtension as _;

use crate::{encode::encode_dt, error::domain};

// ─── Generated cache-table definition ────────────────────────────────────────

#[derive(Debug, Clone)]
pub(crate) struct CacheColumn {
  pub property: String,
  pub column:   String,
  pub kind:     PropertyKind,
}

/// The typed accessor definition generated for one schema.
#[derive(Debug, Clone)]
pub(crate) struct CacheTable {
  pub name:    String,
  pub columns: Vec<CacheColumn>,
}

#[derive(Debug, Clone)]
pub(crate) struct RegisteredSchema {
  pub definition:  SchemaDefinition,
  pub cache_table: CacheTable,
}

// ─── In-memory mirror ────────────────────────────────────────────────────────

/// In-memory mirror of the `schemas` table, rebuilt at engine open and
/// updated on successful registration. The newest registered version of each
/// key is the one constraints and cache reads resolve against.
#[derive(Debug, Default, Clone)]
pub(crate) struct SchemaRegistry {
  by_key:     BTreeMap<String, RegisteredSchema>,
  generation: u64,
}

impl SchemaRegistry {
  pub fn get(&self, schema_key: &str) -> Option<&RegisteredSchema> {
    self.by_key.get(schema_key)
  }

  pub fn require(
    &self,
    schema_key: &str,
  ) -> Result<&RegisteredSchema, lix_core::Error> {
    self
      .by_key
      .get(schema_key)
      .ok_or_else(|| lix_core::Error::SchemaNotFound(schema_key.to_owned()))
  }

  pub fn schemas(&self) -> impl Iterator<Item = &RegisteredSchema> {
    self.by_key.values()
  }

  pub fn generation(&self) -> u64 {
    self.generation
  }

  pub fn insert(&mut self, registered: RegisteredSchema) {
    self
      .by_key
      .insert(registered.definition.key.clone(), registered);
    self.generation += 1;
  }

  /// Rebuild the mirror from the `schemas` table.
  pub fn load(conn: &rusqlite::Connection) -> rusqlite::Result<Self> {
    let mut registry = Self::default();
    let mut stmt = conn.prepare(
      "SELECT definition FROM schemas ORDER BY schema_key, registered_at",
    )?;
    let raws = stmt
      .query_map([], |row| row.get::<_, String>(0))?
      .collect::<rusqlite::Result<Vec<_>>>()?;

    for raw in raws {
      let value: serde_json::Value = serde_json::from_str(&raw)
        .map_err(|e| rusqlite::Error::ToSqlConversionFailure(Box::new(e)))?;
      let definition = SchemaDefinition::from_value(value)
        .map_err(|e| rusqlite::Error::ToSqlConversionFailure(Box::new(e)))?;
      let cache_table = cache_table_for(&definition);
      registry.insert(RegisteredSchema { definition, cache_table });
    }
    Ok(registry)
  }
}

// ─── Registration ────────────────────────────────────────────────────────────

/// Validate and persist a schema definition, creating its cache table.
///
/// Re-registering an identical `(key, version)` is a no-op; re-registering
/// with different content fails: definitions are immutable once stored.
pub(crate) fn register_schema(
  conn: &rusqlite::Connection,
  raw: serde_json::Value,
) -> Result<RegisteredSchema, tokio_rusqlite::Error> {
  let definition = SchemaDefinition::from_value(raw).map_err(domain)?;

  let existing: Option<String> = conn
    .query_row(
      "SELECT definition FROM schemas
       WHERE schema_key = ?1 AND schema_version = ?2",
      rusqlite::params![definition.key, definition.version],
      |row| row.get(0),
    )
    .optional()?;

  let serialized = definition.raw.to_string();
  if let Some(stored) = existing {
    if stored != serialized {
      return Err(domain(lix_core::Error::InvalidSchema {
        schema_key: definition.key.clone(),
        reason:     format!(
          "schema {}@{} is already registered with different content",
          definition.key, definition.version
        ),
      }));
    }
  } else {
    conn.execute(
      "INSERT INTO schemas (schema_key, schema_version, definition, registered_at)
       VALUES (?1, ?2, ?3, ?4)",
      rusqlite::params![
        definition.key,
        definition.version,
        serialized,
        encode_dt(chrono::Utc::now()),
      ],
    )?;
  }

  let cache_table = cache_table_for(&definition);
  conn.execute_batch(&cache_table_ddl(&cache_table))?;

  Ok(RegisteredSchema { definition, cache_table })
}

// ─── Codegen ─────────────────────────────────────────────────────────────────

/// Restrict a name to a safe SQL identifier fragment.
fn sql_ident(name: &str) -> String {
  name
    .chars()
    .map(|c| if c.is_ascii_alphanumeric() || c == '_' { c } else { '_' })
    .collect()
}

fn sql_type(kind: PropertyKind) -> &'static str {
  match kind {
    PropertyKind::String | PropertyKind::Json => "TEXT",
    PropertyKind::Integer | PropertyKind::Boolean => "INTEGER",
    PropertyKind::Number => "REAL",
  }
}

pub(crate) fn cache_table_for(definition: &SchemaDefinition) -> CacheTable {
  let columns = definition
    .properties
    .iter()
    .map(|p| CacheColumn {
      property: p.name.clone(),
      // Prefixed to avoid collisions with the bookkeeping columns.
      column:   format!("p_{}", sql_ident(&p.name)),
      kind:     p.kind,
    })
    .collect();
  CacheTable {
    name: format!("state_cache_{}", sql_ident(&definition.key)),
    columns,
  }
}

fn cache_table_ddl(table: &CacheTable) -> String {
  let mut cols = String::new();
  for col in &table.columns {
    cols.push_str(&format!(
      "    \"{}\" {},\n",
      col.column,
      sql_type(col.kind)
    ));
  }
  format!(
    "CREATE TABLE IF NOT EXISTS \"{name}\" (
    entity_id  TEXT NOT NULL,
    file_id    TEXT NOT NULL,
    version_id TEXT NOT NULL,
{cols}    snapshot_content          TEXT,
    schema_version            TEXT NOT NULL,
    plugin_key                TEXT NOT NULL,
    change_id                 TEXT,
    commit_id                 TEXT,
    inherited_from_version_id TEXT,
    is_tombstone              INTEGER NOT NULL DEFAULT 0,
    created_at                TEXT NOT NULL,
    updated_at                TEXT NOT NULL,
    PRIMARY KEY (entity_id, file_id, version_id)
);
CREATE INDEX IF NOT EXISTS \"{name}_version_idx\" ON \"{name}\"(version_id);
",
    name = table.name,
    cols = cols,
  )
}

#[cfg(test)]
mod tests {
  use serde_json::json;

  use super::*;

  #[test]
  fn cache_table_names_are_sanitized() {
    let definition = SchemaDefinition::from_value(json!({
      "type": "object",
      "x-lix-key": "mock/odd key",
      "x-lix-version": "1.0",
      "x-lix-primary-key": ["/id"],
      "properties": { "id": { "type": "string" } }
    }))
    .unwrap();

    let table = cache_table_for(&definition);
    assert_eq!(table.name, "state_cache_mock_odd_key");
    assert_eq!(table.columns[0].column, "p_id");
  }

  #[test]
  fn ddl_contains_typed_property_columns() {
    let definition = SchemaDefinition::from_value(json!({
      "type": "object",
      "x-lix-key": "doc",
      "x-lix-version": "1.0",
      "x-lix-primary-key": ["/id"],
      "properties": {
        "id": { "type": "string" },
        "count": { "type": "integer" },
        "ratio": { "type": "number" }
      }
    }))
    .unwrap();

    let ddl = cache_table_ddl(&cache_table_for(&definition));
    assert!(ddl.contains("\"p_count\" INTEGER"));
    assert!(ddl.contains("\"p_ratio\" REAL"));
    assert!(ddl.contains("PRIMARY KEY (entity_id, file_id, version_id)"));
  }
}
