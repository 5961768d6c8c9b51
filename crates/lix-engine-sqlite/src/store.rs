//! Change & snapshot store — the append-only log.
//!
//! Snapshots are deduplicated by the SHA-256 of their canonical JSON
//! serialization; a write that repeats prior content reuses the existing
//! snapshot row. Nothing here ever mutates or removes prior rows.

use chrono::{DateTime, Utc};
use lix_core::change::Change;
use rusqlite::OptionalExtension as _;
use serde_json::Value;
use sha2::{Digest, Sha256};
use uuid::Uuid;

use crate::encode::{decode_dt, decode_uuid, encode_dt, encode_uuid};

/// Input to [`append`]; ids and timestamps are assigned here, not by callers.
#[derive(Debug, Clone)]
pub(crate) struct AppendChange {
  pub entity_id:      String,
  pub schema_key:     String,
  pub schema_version: String,
  pub file_id:        String,
  pub plugin_key:     String,
  /// `None` appends a tombstone.
  pub content:        Option<Value>,
}

/// Content address of a snapshot payload. Canonical because `serde_json`
/// maps have deterministic (sorted) key order.
pub(crate) fn snapshot_id_for(content: &Value) -> String {
  let mut hasher = Sha256::new();
  hasher.update(content.to_string().as_bytes());
  hex::encode(hasher.finalize())
}

/// Append one change to the log, writing its snapshot if the content is new.
pub(crate) fn append(
  conn: &rusqlite::Connection,
  input: &AppendChange,
  created_at: DateTime<Utc>,
) -> rusqlite::Result<Change> {
  let snapshot_id = match &input.content {
    Some(content) => {
      let id = snapshot_id_for(content);
      conn.execute(
        "INSERT OR IGNORE INTO snapshots (snapshot_id, content) VALUES (?1, ?2)",
        rusqlite::params![id, content.to_string()],
      )?;
      Some(id)
    }
    None => None,
  };

  let change = Change {
    id: Uuid::new_v4(),
    entity_id: input.entity_id.clone(),
    schema_key: input.schema_key.clone(),
    schema_version: input.schema_version.clone(),
    file_id: input.file_id.clone(),
    plugin_key: input.plugin_key.clone(),
    snapshot_id,
    created_at,
  };

  conn.execute(
    "INSERT INTO changes (
       change_id, entity_id, schema_key, schema_version,
       file_id, plugin_key, snapshot_id, created_at
     ) VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8)",
    rusqlite::params![
      encode_uuid(change.id),
      change.entity_id,
      change.schema_key,
      change.schema_version,
      change.file_id,
      change.plugin_key,
      change.snapshot_id,
      encode_dt(change.created_at),
    ],
  )?;

  Ok(change)
}

/// Fetch a snapshot payload by content address.
pub(crate) fn snapshot_content(
  conn: &rusqlite::Connection,
  snapshot_id: &str,
) -> rusqlite::Result<Option<Value>> {
  let raw: Option<String> = conn
    .query_row(
      "SELECT content FROM snapshots WHERE snapshot_id = ?1",
      rusqlite::params![snapshot_id],
      |row| row.get(0),
    )
    .optional()?;
  match raw {
    Some(raw) => serde_json::from_str(&raw)
      .map(Some)
      .map_err(|e| rusqlite::Error::ToSqlConversionFailure(Box::new(e))),
    None => Ok(None),
  }
}

/// Read the subset of `change_ids` that belong to one entity triple.
pub(crate) fn changes_at(
  conn: &rusqlite::Connection,
  entity_id: &str,
  schema_key: &str,
  file_id: &str,
  change_ids: &[Uuid],
) -> rusqlite::Result<Vec<Change>> {
  let mut stmt = conn.prepare(
    "SELECT change_id, entity_id, schema_key, schema_version,
            file_id, plugin_key, snapshot_id, created_at
     FROM changes
     WHERE entity_id = ?1 AND schema_key = ?2 AND file_id = ?3",
  )?;
  let all = stmt
    .query_map(rusqlite::params![entity_id, schema_key, file_id], row_to_change)?
    .collect::<rusqlite::Result<Vec<_>>>()?;
  Ok(
    all
      .into_iter()
      .filter(|c| change_ids.contains(&c.id))
      .collect(),
  )
}

pub(crate) fn row_to_change(row: &rusqlite::Row<'_>) -> rusqlite::Result<Change> {
  let id_str: String = row.get(0)?;
  let created_str: String = row.get(7)?;
  Ok(Change {
    id: decode_uuid(&id_str)
      .map_err(|e| rusqlite::Error::ToSqlConversionFailure(Box::new(e)))?,
    entity_id: row.get(1)?,
    schema_key: row.get(2)?,
    schema_version: row.get(3)?,
    file_id: row.get(4)?,
    plugin_key: row.get(5)?,
    snapshot_id: row.get(6)?,
    created_at: decode_dt(&created_str)
      .map_err(|e| rusqlite::Error::ToSqlConversionFailure(Box::new(e)))?,
  })
}

#[cfg(test)]
mod tests {
  use serde_json::json;

  use super::*;
  use crate::schema_sql::SCHEMA;

  fn conn() -> rusqlite::Connection {
    let conn = rusqlite::Connection::open_in_memory().expect("in-memory db");
    conn.execute_batch(SCHEMA).expect("schema");
    conn
  }

  fn change(entity: &str, content: Option<Value>) -> AppendChange {
    AppendChange {
      entity_id:      entity.into(),
      schema_key:     "doc".into(),
      schema_version: "1.0".into(),
      file_id:        "f1".into(),
      plugin_key:     "test".into(),
      content,
    }
  }

  #[test]
  fn identical_content_reuses_snapshot() {
    let conn = conn();
    let now = Utc::now();
    let a = append(&conn, &change("e1", Some(json!({"v": 1}))), now).unwrap();
    let b = append(&conn, &change("e2", Some(json!({"v": 1}))), now).unwrap();

    assert_ne!(a.id, b.id);
    assert_eq!(a.snapshot_id, b.snapshot_id);

    let count: i64 = conn
      .query_row("SELECT COUNT(*) FROM snapshots", [], |r| r.get(0))
      .unwrap();
    assert_eq!(count, 1);
  }

  #[test]
  fn tombstone_has_no_snapshot() {
    let conn = conn();
    let c = append(&conn, &change("e1", None), Utc::now()).unwrap();
    assert!(c.is_tombstone());
  }

  #[test]
  fn changes_at_filters_by_ids() {
    let conn = conn();
    let now = Utc::now();
    let a = append(&conn, &change("e1", Some(json!({"v": 1}))), now).unwrap();
    let b = append(&conn, &change("e1", Some(json!({"v": 2}))), now).unwrap();

    let got = changes_at(&conn, "e1", "doc", "f1", &[b.id]).unwrap();
    assert_eq!(got.len(), 1);
    assert_eq!(got[0].id, b.id);
    assert_ne!(got[0].id, a.id);
  }
}
