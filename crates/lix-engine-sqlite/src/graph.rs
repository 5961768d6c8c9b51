//! Change-set / commit graph builder.
//!
//! `commit_pending` folds the transaction buffer into the log: it partitions
//! pending changes by target version, synthesizes one change-set and one
//! commit per affected version, derives the parent/child edges, repoints the
//! versions, and attributes tracked changes to the active accounts. The
//! state cache is refreshed synchronously for exactly the affected triples —
//! there is no implicit trigger registry.

use std::collections::BTreeMap;

use chrono::{DateTime, Utc};
use lix_core::{
  change::{Change, ChangeSet, ChangeSetElement},
  commit::{CHECKPOINT_LABEL, Commit},
  state::{StateFilter, StateRow},
  version::GLOBAL_VERSION_ID,
};
use rusqlite::OptionalExtension as _;
use serde_json::json;
use tracing::debug;
use uuid::Uuid;

use crate::{
  cache,
  encode::{decode_dt, decode_uuid, decode_uuid_list, encode_dt, encode_uuid, encode_uuid_list},
  error::domain,
  materialize::{self, AncestryMemo},
  registry::SchemaRegistry,
  store::{self, AppendChange},
  txn::PendingChange,
  versions,
};

/// Schema key under which change-set-element rows appear in the
/// materialized-state delta.
pub(crate) const CHANGE_SET_ELEMENT_SCHEMA: &str = "lix_change_set_element";

// ─── Commit rows ─────────────────────────────────────────────────────────────

pub(crate) fn insert_commit(
  conn: &rusqlite::Connection,
  commit: &Commit,
) -> Result<(), tokio_rusqlite::Error> {
  conn.execute(
    "INSERT INTO commits (commit_id, change_set_id, parent_commit_ids, created_at)
     VALUES (?1, ?2, ?3, ?4)",
    rusqlite::params![
      encode_uuid(commit.id),
      encode_uuid(commit.change_set_id),
      encode_uuid_list(&commit.parent_commit_ids)
        .map_err(|e| tokio_rusqlite::Error::Other(Box::new(e)))?,
      encode_dt(commit.created_at),
    ],
  )?;
  Ok(())
}

pub(crate) fn get_commit(
  conn: &rusqlite::Connection,
  commit_id: Uuid,
) -> rusqlite::Result<Option<Commit>> {
  conn
    .query_row(
      "SELECT commit_id, change_set_id, parent_commit_ids, created_at
       FROM commits WHERE commit_id = ?1",
      rusqlite::params![encode_uuid(commit_id)],
      row_to_commit,
    )
    .optional()
}

pub(crate) fn row_to_commit(row: &rusqlite::Row<'_>) -> rusqlite::Result<Commit> {
  let id: String = row.get(0)?;
  let change_set_id: String = row.get(1)?;
  let parents: String = row.get(2)?;
  let created_at: String = row.get(3)?;
  let bad = |e: crate::Error| rusqlite::Error::ToSqlConversionFailure(Box::new(e));
  Ok(Commit {
    id: decode_uuid(&id).map_err(bad)?,
    change_set_id: decode_uuid(&change_set_id).map_err(bad)?,
    parent_commit_ids: decode_uuid_list(&parents).map_err(bad)?,
    created_at: decode_dt(&created_at).map_err(bad)?,
  })
}

// ─── Edges ───────────────────────────────────────────────────────────────────

/// Insert a derived commit edge, enforcing the graph invariants: no
/// self-reference, no duplicate, and no edge that would make a commit its
/// own ancestor.
pub(crate) fn insert_commit_edge(
  conn: &rusqlite::Connection,
  parent_id: Uuid,
  child_id: Uuid,
) -> Result<(), tokio_rusqlite::Error> {
  if parent_id == child_id {
    return Err(domain(lix_core::Error::InvalidGraph(format!(
      "commit {parent_id} cannot be its own parent"
    ))));
  }

  let duplicate: Option<i64> = conn
    .query_row(
      "SELECT 1 FROM commit_edges WHERE parent_id = ?1 AND child_id = ?2",
      rusqlite::params![encode_uuid(parent_id), encode_uuid(child_id)],
      |row| row.get(0),
    )
    .optional()?;
  if duplicate.is_some() {
    return Err(domain(lix_core::Error::InvalidGraph(format!(
      "duplicate commit edge {parent_id} -> {child_id}"
    ))));
  }

  // The edge closes a cycle iff the child is already an ancestor of the
  // parent.
  let ancestors = materialize::ancestry(conn, parent_id)?;
  if ancestors.iter().any(|(id, _)| *id == child_id) {
    return Err(domain(lix_core::Error::InvalidGraph(format!(
      "edge {parent_id} -> {child_id} would make {child_id} its own ancestor"
    ))));
  }

  conn.execute(
    "INSERT INTO commit_edges (parent_id, child_id) VALUES (?1, ?2)",
    rusqlite::params![encode_uuid(parent_id), encode_uuid(child_id)],
  )?;
  Ok(())
}

fn edge_exists(
  conn: &rusqlite::Connection,
  parent_id: Uuid,
  child_id: Uuid,
) -> rusqlite::Result<bool> {
  let row: Option<i64> = conn
    .query_row(
      "SELECT 1 FROM commit_edges WHERE parent_id = ?1 AND child_id = ?2",
      rusqlite::params![encode_uuid(parent_id), encode_uuid(child_id)],
      |row| row.get(0),
    )
    .optional()?;
  Ok(row.is_some())
}

// ─── Labels ──────────────────────────────────────────────────────────────────

pub(crate) fn attach_label(
  conn: &rusqlite::Connection,
  commit_id: Uuid,
  label: &str,
  at: DateTime<Utc>,
) -> rusqlite::Result<()> {
  conn.execute(
    "INSERT OR IGNORE INTO commit_labels (commit_id, label, created_at)
     VALUES (?1, ?2, ?3)",
    rusqlite::params![encode_uuid(commit_id), label, encode_dt(at)],
  )?;
  Ok(())
}

pub(crate) fn latest_labeled(
  conn: &rusqlite::Connection,
  label: &str,
) -> rusqlite::Result<Option<Uuid>> {
  let id: Option<String> = conn
    .query_row(
      "SELECT commit_id FROM commit_labels WHERE label = ?1
       ORDER BY created_at DESC, commit_id DESC LIMIT 1",
      rusqlite::params![label],
      |row| row.get(0),
    )
    .optional()?;
  id.as_deref()
    .map(|s| {
      decode_uuid(s)
        .map_err(|e| rusqlite::Error::ToSqlConversionFailure(Box::new(e)))
    })
    .transpose()
}

/// Commits carrying `label`, newest first.
pub(crate) fn labeled_commits(
  conn: &rusqlite::Connection,
  label: &str,
) -> rusqlite::Result<Vec<Commit>> {
  let mut stmt = conn.prepare(
    "SELECT c.commit_id, c.change_set_id, c.parent_commit_ids, c.created_at
     FROM commit_labels l
     JOIN commits c ON c.commit_id = l.commit_id
     WHERE l.label = ?1
     ORDER BY l.created_at DESC, c.commit_id DESC",
  )?;
  stmt
    .query_map(rusqlite::params![label], row_to_commit)?
    .collect::<rusqlite::Result<Vec<_>>>()
}

// ─── Commit synthesis ────────────────────────────────────────────────────────

#[derive(Debug, Default)]
pub(crate) struct CommitData {
  pub commits:     Vec<Commit>,
  pub changes:     Vec<Change>,
  pub state_delta: Vec<StateRow>,
}

/// Fold drained pending changes into new change-sets and commits, one per
/// affected version. Runs inside the caller's transaction on the connection
/// thread.
pub(crate) fn commit_pending(
  conn: &rusqlite::Connection,
  registry: &SchemaRegistry,
  memo: &AncestryMemo,
  pending: Vec<PendingChange>,
  active_accounts: &[String],
) -> Result<CommitData, tokio_rusqlite::Error> {
  let now = Utc::now();
  let mut data = CommitData::default();

  // 1. Partition by target version; a change belongs to exactly one.
  let mut by_version: BTreeMap<String, Vec<PendingChange>> = BTreeMap::new();
  for change in pending {
    by_version
      .entry(change.version_id.clone())
      .or_default()
      .push(change);
  }

  for (version_id, staged) in by_version {
    let version = versions::require_version(conn, &version_id)?;

    // 2. One change-set per affected version.
    let change_set = ChangeSet { id: Uuid::new_v4(), created_at: now };
    conn.execute(
      "INSERT INTO change_sets (change_set_id, created_at) VALUES (?1, ?2)",
      rusqlite::params![encode_uuid(change_set.id), encode_dt(now)],
    )?;

    // 3. One commit, parented on the version's previous tip (empty for a
    // brand-new version).
    let commit = Commit {
      id:                Uuid::new_v4(),
      change_set_id:     change_set.id,
      parent_commit_ids: version.commit_id.into_iter().collect(),
      created_at:        now,
    };
    insert_commit(conn, &commit)?;

    // 4. Derived edges for the new parent/child pairs.
    for parent_id in &commit.parent_commit_ids {
      insert_commit_edge(conn, *parent_id, commit.id)?;
    }

    for staged_change in &staged {
      let change = store::append(
        conn,
        &AppendChange {
          entity_id:      staged_change.entity_id.clone(),
          schema_key:     staged_change.schema_key.clone(),
          schema_version: staged_change.schema_version.clone(),
          file_id:        staged_change.file_id.clone(),
          plugin_key:     staged_change.plugin_key.clone(),
          content:        staged_change.content.clone(),
        },
        now,
      )?;

      let element = ChangeSetElement {
        change_set_id: change_set.id,
        change_id:     change.id,
        entity_id:     change.entity_id.clone(),
        schema_key:    change.schema_key.clone(),
        file_id:       change.file_id.clone(),
      };
      conn.execute(
        "INSERT INTO change_set_elements
           (change_set_id, change_id, entity_id, schema_key, file_id)
         VALUES (?1, ?2, ?3, ?4, ?5)",
        rusqlite::params![
          encode_uuid(element.change_set_id),
          encode_uuid(element.change_id),
          element.entity_id,
          element.schema_key,
          element.file_id,
        ],
      )?;

      // 6. Author attribution for tracked domain changes.
      if !staged_change.untracked {
        for account_id in active_accounts {
          conn.execute(
            "INSERT OR IGNORE INTO change_authors (change_id, account_id)
             VALUES (?1, ?2)",
            rusqlite::params![encode_uuid(change.id), account_id],
          )?;
        }
      }

      // 7. Materialized-state delta: domain rows and change-set-element
      // rows only; commit/change-set/version bookkeeping is metadata.
      if let Some(content) = &staged_change.content {
        data.state_delta.push(StateRow {
          entity_id:                 change.entity_id.clone(),
          schema_key:                change.schema_key.clone(),
          file_id:                   change.file_id.clone(),
          version_id:                version_id.clone(),
          plugin_key:                change.plugin_key.clone(),
          snapshot_content:          content.clone(),
          schema_version:            change.schema_version.clone(),
          created_at:                now,
          updated_at:                now,
          inherited_from_version_id: None,
          change_id:                 Some(change.id),
          commit_id:                 Some(commit.id),
        });
      }
      data.state_delta.push(StateRow {
        entity_id:                 format!("{}~{}", change_set.id, change.id),
        schema_key:                CHANGE_SET_ELEMENT_SCHEMA.to_owned(),
        file_id:                   element.file_id.clone(),
        version_id:                GLOBAL_VERSION_ID.to_owned(),
        plugin_key:                change.plugin_key.clone(),
        snapshot_content:          json!({
          "change_set_id": change_set.id,
          "change_id": change.id,
          "entity_id": change.entity_id,
          "schema_key": change.schema_key,
          "file_id": change.file_id,
        }),
        schema_version:            "1.0".to_owned(),
        created_at:                now,
        updated_at:                now,
        inherited_from_version_id: None,
        change_id:                 Some(change.id),
        commit_id:                 Some(commit.id),
      });

      data.changes.push(change);
    }

    // 5. Repoint the version at its new tip.
    versions::repoint_version(conn, &version_id, commit.id)?;

    // On-commit hook: refresh the cache for exactly the affected triples.
    for staged_change in &staged {
      let filter = StateFilter {
        entity_id:  Some(staged_change.entity_id.clone()),
        schema_key: Some(staged_change.schema_key.clone()),
        file_id:    Some(staged_change.file_id.clone()),
      };
      cache::invalidate(conn, registry, Some(&version_id), &filter)?;
      cache::populate(conn, registry, memo, &[version_id.clone()], &filter)?;
    }

    debug!(
      version = %version_id,
      commit = %commit.id,
      changes = staged.len(),
      "commit synthesized"
    );
    data.commits.push(commit);
  }

  Ok(data)
}

/// Label `commit_id` as a checkpoint and link it to the previous checkpoint
/// so checkpoints form their own lineage independent of auto-commit
/// granularity.
pub(crate) fn mark_checkpoint(
  conn: &rusqlite::Connection,
  commit_id: Uuid,
) -> Result<(), tokio_rusqlite::Error> {
  let prior = latest_labeled(conn, CHECKPOINT_LABEL)?;
  attach_label(conn, commit_id, CHECKPOINT_LABEL, Utc::now())?;

  if let Some(prior_id) = prior {
    if prior_id != commit_id && !edge_exists(conn, prior_id, commit_id)? {
      insert_commit_edge(conn, prior_id, commit_id)?;
    }
  }
  Ok(())
}
