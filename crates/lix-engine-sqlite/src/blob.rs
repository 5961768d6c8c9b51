//! Whole-instance serialization.
//!
//! `export_blob` snapshots every durable table into a single JSON document;
//! `import_blob` merges such a document into the local instance. Log rows
//! (snapshots, changes, change-sets, commits) are immutable and content- or
//! id-addressed, so import is INSERT OR IGNORE for those. Version pointers
//! are the one mutable table: a version already known locally keeps its
//! local pointer, unknown versions are adopted as exported.

use lix_core::state::StateFilter;
use rusqlite::OptionalExtension as _;
use serde::{Deserialize, Serialize};
use tracing::info;
use uuid::Uuid;

use crate::{cache, error::domain, graph, materialize::AncestryMemo, registry::SchemaRegistry};

pub(crate) const BLOB_FORMAT_VERSION: u32 = 1;

// ─── Instance identity ───────────────────────────────────────────────────────

pub(crate) fn lix_id(conn: &rusqlite::Connection) -> rusqlite::Result<Option<String>> {
  conn
    .query_row(
      "SELECT value FROM meta WHERE key = 'lix_id'",
      [],
      |row| row.get(0),
    )
    .optional()
}

/// Fetch the instance id, minting one on first open.
pub(crate) fn ensure_lix_id(conn: &rusqlite::Connection) -> rusqlite::Result<String> {
  if let Some(id) = lix_id(conn)? {
    return Ok(id);
  }
  let id = Uuid::new_v4().hyphenated().to_string();
  conn.execute(
    "INSERT INTO meta (key, value) VALUES ('lix_id', ?1)",
    rusqlite::params![id],
  )?;
  Ok(id)
}

// ─── Blob format ─────────────────────────────────────────────────────────────

// Rows travel in their stored text encoding (uuids hyphenated, timestamps
// RFC 3339, payloads as JSON text) so a blob round-trips byte-for-byte.

#[derive(Debug, Serialize, Deserialize)]
struct SchemaRow {
  schema_key:     String,
  schema_version: String,
  definition:     String,
  registered_at:  String,
}

#[derive(Debug, Serialize, Deserialize)]
struct SnapshotRow {
  snapshot_id: String,
  content:     String,
}

#[derive(Debug, Serialize, Deserialize)]
struct ChangeRow {
  change_id:      String,
  entity_id:      String,
  schema_key:     String,
  schema_version: String,
  file_id:        String,
  plugin_key:     String,
  snapshot_id:    Option<String>,
  created_at:     String,
}

#[derive(Debug, Serialize, Deserialize)]
struct ChangeSetRow {
  change_set_id: String,
  created_at:    String,
}

#[derive(Debug, Serialize, Deserialize)]
struct ChangeSetElementRow {
  change_set_id: String,
  change_id:     String,
  entity_id:     String,
  schema_key:    String,
  file_id:       String,
}

#[derive(Debug, Serialize, Deserialize)]
struct CommitRow {
  commit_id:         String,
  change_set_id:     String,
  parent_commit_ids: String,
  created_at:        String,
}

#[derive(Debug, Serialize, Deserialize)]
struct CommitEdgeRow {
  parent_id: String,
  child_id:  String,
}

#[derive(Debug, Serialize, Deserialize)]
struct CommitLabelRow {
  commit_id:  String,
  label:      String,
  created_at: String,
}

#[derive(Debug, Serialize, Deserialize)]
struct VersionRow {
  version_id:               String,
  name:                     String,
  commit_id:                Option<String>,
  working_commit_id:        Option<String>,
  inherits_from_version_id: Option<String>,
  hidden:                   bool,
}

#[derive(Debug, Serialize, Deserialize)]
struct ChangeAuthorRow {
  change_id:  String,
  account_id: String,
}

#[derive(Debug, Serialize, Deserialize)]
pub(crate) struct Blob {
  format_version:      u32,
  lix_id:              String,
  schemas:             Vec<SchemaRow>,
  snapshots:           Vec<SnapshotRow>,
  changes:             Vec<ChangeRow>,
  change_sets:         Vec<ChangeSetRow>,
  change_set_elements: Vec<ChangeSetElementRow>,
  commits:             Vec<CommitRow>,
  commit_edges:        Vec<CommitEdgeRow>,
  commit_labels:       Vec<CommitLabelRow>,
  versions:            Vec<VersionRow>,
  change_authors:      Vec<ChangeAuthorRow>,
}

// ─── Export ──────────────────────────────────────────────────────────────────

fn collect<T, F>(
  conn: &rusqlite::Connection,
  sql: &str,
  map: F,
) -> rusqlite::Result<Vec<T>>
where
  F: Fn(&rusqlite::Row<'_>) -> rusqlite::Result<T>,
{
  let mut stmt = conn.prepare(sql)?;
  let rows = stmt.query_map([], map)?.collect::<rusqlite::Result<Vec<_>>>()?;
  Ok(rows)
}

pub(crate) fn export_blob(
  conn: &rusqlite::Connection,
) -> Result<Vec<u8>, tokio_rusqlite::Error> {
  let blob = Blob {
    format_version: BLOB_FORMAT_VERSION,
    lix_id: ensure_lix_id(conn)?,
    schemas: collect(
      conn,
      "SELECT schema_key, schema_version, definition, registered_at
       FROM schemas ORDER BY schema_key, schema_version",
      |row| {
        Ok(SchemaRow {
          schema_key:     row.get(0)?,
          schema_version: row.get(1)?,
          definition:     row.get(2)?,
          registered_at:  row.get(3)?,
        })
      },
    )?,
    snapshots: collect(
      conn,
      "SELECT snapshot_id, content FROM snapshots ORDER BY snapshot_id",
      |row| Ok(SnapshotRow { snapshot_id: row.get(0)?, content: row.get(1)? }),
    )?,
    changes: collect(
      conn,
      "SELECT change_id, entity_id, schema_key, schema_version, file_id,
              plugin_key, snapshot_id, created_at
       FROM changes ORDER BY created_at, change_id",
      |row| {
        Ok(ChangeRow {
          change_id:      row.get(0)?,
          entity_id:      row.get(1)?,
          schema_key:     row.get(2)?,
          schema_version: row.get(3)?,
          file_id:        row.get(4)?,
          plugin_key:     row.get(5)?,
          snapshot_id:    row.get(6)?,
          created_at:     row.get(7)?,
        })
      },
    )?,
    change_sets: collect(
      conn,
      "SELECT change_set_id, created_at FROM change_sets ORDER BY change_set_id",
      |row| Ok(ChangeSetRow { change_set_id: row.get(0)?, created_at: row.get(1)? }),
    )?,
    change_set_elements: collect(
      conn,
      "SELECT change_set_id, change_id, entity_id, schema_key, file_id
       FROM change_set_elements ORDER BY change_set_id, change_id",
      |row| {
        Ok(ChangeSetElementRow {
          change_set_id: row.get(0)?,
          change_id:     row.get(1)?,
          entity_id:     row.get(2)?,
          schema_key:    row.get(3)?,
          file_id:       row.get(4)?,
        })
      },
    )?,
    commits: collect(
      conn,
      "SELECT commit_id, change_set_id, parent_commit_ids, created_at
       FROM commits ORDER BY created_at, commit_id",
      |row| {
        Ok(CommitRow {
          commit_id:         row.get(0)?,
          change_set_id:     row.get(1)?,
          parent_commit_ids: row.get(2)?,
          created_at:        row.get(3)?,
        })
      },
    )?,
    commit_edges: collect(
      conn,
      "SELECT parent_id, child_id FROM commit_edges ORDER BY parent_id, child_id",
      |row| Ok(CommitEdgeRow { parent_id: row.get(0)?, child_id: row.get(1)? }),
    )?,
    commit_labels: collect(
      conn,
      "SELECT commit_id, label, created_at
       FROM commit_labels ORDER BY commit_id, label",
      |row| {
        Ok(CommitLabelRow {
          commit_id:  row.get(0)?,
          label:      row.get(1)?,
          created_at: row.get(2)?,
        })
      },
    )?,
    versions: collect(
      conn,
      "SELECT version_id, name, commit_id, working_commit_id,
              inherits_from_version_id, hidden
       FROM versions ORDER BY version_id",
      |row| {
        Ok(VersionRow {
          version_id:               row.get(0)?,
          name:                     row.get(1)?,
          commit_id:                row.get(2)?,
          working_commit_id:        row.get(3)?,
          inherits_from_version_id: row.get(4)?,
          hidden:                   row.get(5)?,
        })
      },
    )?,
    change_authors: collect(
      conn,
      "SELECT change_id, account_id FROM change_authors
       ORDER BY change_id, account_id",
      |row| Ok(ChangeAuthorRow { change_id: row.get(0)?, account_id: row.get(1)? }),
    )?,
  };

  serde_json::to_vec(&blob).map_err(|e| tokio_rusqlite::Error::Other(Box::new(e)))
}

// ─── Import ──────────────────────────────────────────────────────────────────

/// Merge an exported blob into this instance. Returns the rebuilt schema
/// registry; the caller swaps it in and repopulates the cache.
pub(crate) fn import_blob(
  conn: &rusqlite::Connection,
  memo: &AncestryMemo,
  bytes: &[u8],
) -> Result<SchemaRegistry, tokio_rusqlite::Error> {
  memo.clear();
  let blob: Blob = serde_json::from_slice(bytes).map_err(|e| {
    tokio_rusqlite::Error::Other(Box::new(crate::Error::MalformedBlob(
      e.to_string(),
    )))
  })?;
  if blob.format_version != BLOB_FORMAT_VERSION {
    return Err(tokio_rusqlite::Error::Other(Box::new(
      crate::Error::MalformedBlob(format!(
        "unsupported blob format version {}",
        blob.format_version
      )),
    )));
  }

  // Schemas go through the registration path so immutability is enforced
  // and cache tables exist before repopulation.
  for row in &blob.schemas {
    let raw: serde_json::Value = serde_json::from_str(&row.definition)
      .map_err(|e| {
        tokio_rusqlite::Error::Other(Box::new(crate::Error::MalformedBlob(
          format!("schema {}: {e}", row.schema_key),
        )))
      })?;
    crate::registry::register_schema(conn, raw)?;
  }

  for row in &blob.snapshots {
    conn.execute(
      "INSERT OR IGNORE INTO snapshots (snapshot_id, content) VALUES (?1, ?2)",
      rusqlite::params![row.snapshot_id, row.content],
    )?;
  }
  for row in &blob.changes {
    conn.execute(
      "INSERT OR IGNORE INTO changes
         (change_id, entity_id, schema_key, schema_version, file_id,
          plugin_key, snapshot_id, created_at)
       VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8)",
      rusqlite::params![
        row.change_id,
        row.entity_id,
        row.schema_key,
        row.schema_version,
        row.file_id,
        row.plugin_key,
        row.snapshot_id,
        row.created_at,
      ],
    )?;
  }
  for row in &blob.change_sets {
    conn.execute(
      "INSERT OR IGNORE INTO change_sets (change_set_id, created_at)
       VALUES (?1, ?2)",
      rusqlite::params![row.change_set_id, row.created_at],
    )?;
  }
  for row in &blob.change_set_elements {
    conn.execute(
      "INSERT OR IGNORE INTO change_set_elements
         (change_set_id, change_id, entity_id, schema_key, file_id)
       VALUES (?1, ?2, ?3, ?4, ?5)",
      rusqlite::params![
        row.change_set_id,
        row.change_id,
        row.entity_id,
        row.schema_key,
        row.file_id,
      ],
    )?;
  }
  for row in &blob.commits {
    conn.execute(
      "INSERT OR IGNORE INTO commits
         (commit_id, change_set_id, parent_commit_ids, created_at)
       VALUES (?1, ?2, ?3, ?4)",
      rusqlite::params![
        row.commit_id,
        row.change_set_id,
        row.parent_commit_ids,
        row.created_at,
      ],
    )?;
  }

  // Edges re-run the graph invariant checks; a blob whose edges would close
  // a cycle against local history aborts the import.
  for row in &blob.commit_edges {
    let parent = crate::encode::decode_uuid(&row.parent_id)
      .map_err(|e| tokio_rusqlite::Error::Other(Box::new(e)))?;
    let child = crate::encode::decode_uuid(&row.child_id)
      .map_err(|e| tokio_rusqlite::Error::Other(Box::new(e)))?;
    let exists: Option<i64> = conn
      .query_row(
        "SELECT 1 FROM commit_edges WHERE parent_id = ?1 AND child_id = ?2",
        rusqlite::params![row.parent_id, row.child_id],
        |r| r.get(0),
      )
      .optional()?;
    if exists.is_none() {
      graph::insert_commit_edge(conn, parent, child)?;
    }
  }

  for row in &blob.commit_labels {
    conn.execute(
      "INSERT OR IGNORE INTO commit_labels (commit_id, label, created_at)
       VALUES (?1, ?2, ?3)",
      rusqlite::params![row.commit_id, row.label, row.created_at],
    )?;
  }

  for row in &blob.versions {
    if let Some(parent) = &row.inherits_from_version_id {
      if *parent == row.version_id {
        return Err(domain(lix_core::Error::InvalidGraph(format!(
          "version {} inherits from itself",
          row.version_id
        ))));
      }
    }
    // Versions known locally keep their local pointer. A foreign version
    // that collides with a local one on name only (names are unique) is
    // adopted under a disambiguated name.
    let name_holder: Option<String> = conn
      .query_row(
        "SELECT version_id FROM versions WHERE name = ?1",
        rusqlite::params![row.name],
        |r| r.get(0),
      )
      .optional()?;
    let name = match name_holder {
      Some(id) if id != row.version_id => {
        format!("{}@{}", row.name, row.version_id)
      }
      _ => row.name.clone(),
    };
    conn.execute(
      "INSERT OR IGNORE INTO versions
         (version_id, name, commit_id, working_commit_id,
          inherits_from_version_id, hidden)
       VALUES (?1, ?2, ?3, ?4, ?5, ?6)",
      rusqlite::params![
        row.version_id,
        name,
        row.commit_id,
        row.working_commit_id,
        row.inherits_from_version_id,
        row.hidden,
      ],
    )?;
  }

  for row in &blob.change_authors {
    conn.execute(
      "INSERT OR IGNORE INTO change_authors (change_id, account_id)
       VALUES (?1, ?2)",
      rusqlite::params![row.change_id, row.account_id],
    )?;
  }

  let registry = SchemaRegistry::load(conn)?;

  // Imported history may shadow or extend anything; rebuild the cache for
  // every version rather than chasing affected triples.
  let version_ids: Vec<String> = collect(
    conn,
    "SELECT version_id FROM versions ORDER BY version_id",
    |row| row.get(0),
  )?;
  let all = StateFilter::default();
  cache::invalidate(conn, &registry, None, &all)?;
  cache::populate(conn, &registry, memo, &version_ids, &all)?;

  info!(
    source = %blob.lix_id,
    changes = blob.changes.len(),
    commits = blob.commits.len(),
    "blob imported"
  );

  Ok(registry)
}
