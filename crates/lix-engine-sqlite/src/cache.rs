//! State cache — per-schema denormalized tables mirroring materialized
//! state.
//!
//! Rows are keyed by `(entity_id, file_id, version_id)` and upserted on that
//! key, so overlapping repopulation is idempotent and an interrupted
//! `populate` is repaired by re-running it. Only a version's **direct**
//! entries are cached — inheritance is resolved at read time by falling back
//! to the parent version's rows. Tombstone leaves are cached (flagged) so a
//! child's deletion masks the parent's live row during fallback.

use std::collections::BTreeSet;

use lix_core::state::{StateFilter, StateRow};
use rusqlite::types::Value as SqlValue;
use serde_json::Value;
use tracing::debug;

use crate::{
  encode::{decode_dt, decode_uuid_opt, encode_dt, encode_uuid},
  materialize::{self, AncestryMemo, Leaf},
  registry::{CacheColumn, RegisteredSchema, SchemaRegistry},
  versions,
};

// ─── Population ──────────────────────────────────────────────────────────────

/// Re-derive cache rows for the given versions from the materializer's
/// direct-entries view. Returns the number of rows written.
pub(crate) fn populate(
  conn: &rusqlite::Connection,
  registry: &SchemaRegistry,
  memo: &AncestryMemo,
  version_ids: &[String],
  filter: &StateFilter,
) -> Result<usize, tokio_rusqlite::Error> {
  let mut written = 0usize;
  for version_id in version_ids {
    let version = versions::require_version(conn, version_id)?;
    let Some(tip) = version.commit_id else {
      continue;
    };
    for leaf in materialize::leaves_at(conn, memo, tip, filter)? {
      let Some(schema) = registry.get(&leaf.schema_key) else {
        // Engine bookkeeping schemas have no cache table.
        continue;
      };
      upsert_leaf(conn, schema, version_id, &leaf)?;
      written += 1;
    }
  }
  debug!(rows = written, "state cache populated");
  Ok(written)
}

/// Delete cache rows matching the filter before a repopulation. An empty
/// filter clears the relevant tables entirely.
pub(crate) fn invalidate(
  conn: &rusqlite::Connection,
  registry: &SchemaRegistry,
  version_id: Option<&str>,
  filter: &StateFilter,
) -> rusqlite::Result<usize> {
  let mut removed = 0usize;
  for schema in registry.schemas() {
    if let Some(wanted) = filter.schema_key.as_deref() {
      if schema.definition.key != wanted {
        continue;
      }
    }
    let mut conditions: Vec<String> = Vec::new();
    let mut params: Vec<SqlValue> = Vec::new();
    if let Some(version_id) = version_id {
      params.push(SqlValue::Text(version_id.to_owned()));
      conditions.push(format!("version_id = ?{}", params.len()));
    }
    if let Some(entity_id) = filter.entity_id.as_deref() {
      params.push(SqlValue::Text(entity_id.to_owned()));
      conditions.push(format!("entity_id = ?{}", params.len()));
    }
    if let Some(file_id) = filter.file_id.as_deref() {
      params.push(SqlValue::Text(file_id.to_owned()));
      conditions.push(format!("file_id = ?{}", params.len()));
    }
    let where_clause = if conditions.is_empty() {
      String::new()
    } else {
      format!(" WHERE {}", conditions.join(" AND "))
    };
    let sql =
      format!("DELETE FROM \"{}\"{}", schema.cache_table.name, where_clause);
    removed +=
      conn.execute(&sql, rusqlite::params_from_iter(params.into_iter()))?;
  }
  Ok(removed)
}

fn property_value(content: Option<&Value>, column: &CacheColumn) -> SqlValue {
  use lix_core::schema::PropertyKind;

  let Some(value) = content.and_then(|c| c.get(&column.property)) else {
    return SqlValue::Null;
  };
  match column.kind {
    PropertyKind::String => value
      .as_str()
      .map(|s| SqlValue::Text(s.to_owned()))
      .unwrap_or(SqlValue::Text(value.to_string())),
    PropertyKind::Integer => value
      .as_i64()
      .map(SqlValue::Integer)
      .unwrap_or(SqlValue::Null),
    PropertyKind::Number => value
      .as_f64()
      .map(SqlValue::Real)
      .unwrap_or(SqlValue::Null),
    PropertyKind::Boolean => value
      .as_bool()
      .map(|b| SqlValue::Integer(b as i64))
      .unwrap_or(SqlValue::Null),
    PropertyKind::Json => SqlValue::Text(value.to_string()),
  }
}

fn upsert_leaf(
  conn: &rusqlite::Connection,
  schema: &RegisteredSchema,
  version_id: &str,
  leaf: &Leaf,
) -> rusqlite::Result<()> {
  let table = &schema.cache_table;
  let mut columns = vec![
    "entity_id".to_owned(),
    "file_id".to_owned(),
    "version_id".to_owned(),
  ];
  let mut params: Vec<SqlValue> = vec![
    SqlValue::Text(leaf.entity_id.clone()),
    SqlValue::Text(leaf.file_id.clone()),
    SqlValue::Text(version_id.to_owned()),
  ];

  for column in &table.columns {
    columns.push(format!("\"{}\"", column.column));
    params.push(property_value(leaf.snapshot_content.as_ref(), column));
  }

  let bookkeeping: [(&str, SqlValue); 9] = [
    (
      "snapshot_content",
      leaf
        .snapshot_content
        .as_ref()
        .map(|c| SqlValue::Text(c.to_string()))
        .unwrap_or(SqlValue::Null),
    ),
    ("schema_version", SqlValue::Text(leaf.schema_version.clone())),
    ("plugin_key", SqlValue::Text(leaf.plugin_key.clone())),
    ("change_id", SqlValue::Text(encode_uuid(leaf.change_id))),
    ("commit_id", SqlValue::Text(encode_uuid(leaf.commit_id))),
    ("inherited_from_version_id", SqlValue::Null),
    ("is_tombstone", SqlValue::Integer(leaf.is_tombstone() as i64)),
    ("created_at", SqlValue::Text(encode_dt(leaf.first_seen_at))),
    ("updated_at", SqlValue::Text(encode_dt(leaf.updated_at))),
  ];
  for (name, value) in bookkeeping {
    columns.push(name.to_owned());
    params.push(value);
  }

  let placeholders: Vec<String> =
    (1..=params.len()).map(|i| format!("?{i}")).collect();
  let updates: Vec<String> = columns
    .iter()
    .skip(3)
    .map(|c| format!("{c} = excluded.{c}"))
    .collect();

  let sql = format!(
    "INSERT INTO \"{table}\" ({cols}) VALUES ({values})
     ON CONFLICT(entity_id, file_id, version_id) DO UPDATE SET {updates}",
    table = table.name,
    cols = columns.join(", "),
    values = placeholders.join(", "),
    updates = updates.join(", "),
  );
  conn.execute(&sql, rusqlite::params_from_iter(params.into_iter()))?;
  Ok(())
}

// ─── Reads ───────────────────────────────────────────────────────────────────

struct RawCacheRow {
  entity_id:        String,
  file_id:          String,
  snapshot_content: Option<String>,
  schema_version:   String,
  plugin_key:       String,
  change_id:        Option<String>,
  commit_id:        Option<String>,
  is_tombstone:     bool,
  created_at:       String,
  updated_at:       String,
}

fn raw_rows(
  conn: &rusqlite::Connection,
  schema: &RegisteredSchema,
  version_id: &str,
  filter: &StateFilter,
) -> rusqlite::Result<Vec<RawCacheRow>> {
  let mut conditions = vec!["version_id = ?1".to_owned()];
  let mut params: Vec<SqlValue> = vec![SqlValue::Text(version_id.to_owned())];
  if let Some(entity_id) = filter.entity_id.as_deref() {
    params.push(SqlValue::Text(entity_id.to_owned()));
    conditions.push(format!("entity_id = ?{}", params.len()));
  }
  if let Some(file_id) = filter.file_id.as_deref() {
    params.push(SqlValue::Text(file_id.to_owned()));
    conditions.push(format!("file_id = ?{}", params.len()));
  }

  let sql = format!(
    "SELECT entity_id, file_id, snapshot_content, schema_version, plugin_key,
            change_id, commit_id, is_tombstone, created_at, updated_at
     FROM \"{}\" WHERE {}",
    schema.cache_table.name,
    conditions.join(" AND "),
  );
  let mut stmt = conn.prepare(&sql)?;
  let rows = stmt
    .query_map(rusqlite::params_from_iter(params.into_iter()), |row| {
      Ok(RawCacheRow {
        entity_id:        row.get(0)?,
        file_id:          row.get(1)?,
        snapshot_content: row.get(2)?,
        schema_version:   row.get(3)?,
        plugin_key:       row.get(4)?,
        change_id:        row.get(5)?,
        commit_id:        row.get(6)?,
        is_tombstone:     row.get::<_, i64>(7)? != 0,
        created_at:       row.get(8)?,
        updated_at:       row.get(9)?,
      })
    })?
    .collect::<rusqlite::Result<Vec<_>>>()?;
  Ok(rows)
}

/// Read visible state for `version_id`, resolving inheritance by falling
/// back through the version's ancestor chain. A tombstone row at a nearer
/// version masks ancestors and yields no visible row.
pub(crate) fn read_state(
  conn: &rusqlite::Connection,
  registry: &SchemaRegistry,
  version_id: &str,
  filter: &StateFilter,
) -> Result<Vec<StateRow>, tokio_rusqlite::Error> {
  let chain = versions::inheritance_chain(conn, version_id)?;
  let mut lookup_order = vec![version_id.to_owned()];
  lookup_order.extend(chain);

  let mut out = Vec::new();
  for schema in registry.schemas() {
    if let Some(wanted) = filter.schema_key.as_deref() {
      if schema.definition.key != wanted {
        continue;
      }
    }
    let mut resolved: BTreeSet<(String, String)> = BTreeSet::new();
    for lookup_id in &lookup_order {
      for raw in raw_rows(conn, schema, lookup_id, filter)? {
        let key = (raw.entity_id.clone(), raw.file_id.clone());
        if !resolved.insert(key) {
          continue;
        }
        if raw.is_tombstone {
          // Masks any ancestor's live row.
          continue;
        }
        let Some(content) = raw.snapshot_content.as_deref() else {
          continue;
        };
        let snapshot_content: Value = serde_json::from_str(content)
          .map_err(|e| tokio_rusqlite::Error::Other(Box::new(e)))?;
        out.push(StateRow {
          entity_id: raw.entity_id,
          schema_key: schema.definition.key.clone(),
          file_id: raw.file_id,
          version_id: version_id.to_owned(),
          plugin_key: raw.plugin_key,
          snapshot_content,
          schema_version: raw.schema_version,
          created_at: decode_dt(&raw.created_at)
            .map_err(|e| tokio_rusqlite::Error::Other(Box::new(e)))?,
          updated_at: decode_dt(&raw.updated_at)
            .map_err(|e| tokio_rusqlite::Error::Other(Box::new(e)))?,
          inherited_from_version_id: (lookup_id != version_id)
            .then(|| lookup_id.clone()),
          change_id: decode_uuid_opt(raw.change_id.as_deref())
            .map_err(|e| tokio_rusqlite::Error::Other(Box::new(e)))?,
          commit_id: decode_uuid_opt(raw.commit_id.as_deref())
            .map_err(|e| tokio_rusqlite::Error::Other(Box::new(e)))?,
        });
      }
    }
  }
  Ok(out)
}
