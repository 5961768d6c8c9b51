//! Diff engines over materialized leaf state.
//!
//! Version diffs are merge-biased: they answer "what would applying the
//! source version onto the target change", so the source side wins on
//! conflict and entities the source never knew about are preserved as
//! unchanged. Commit diffs are symmetric and restricted to the entity
//! triples actually touched by commits reachable from exactly one side,
//! unless the caller asks for unchanged rows too.

use std::collections::{BTreeMap, BTreeSet};

use lix_core::{
  diff::{CommitDiffEntry, CommitDiffStatus, VersionDiffEntry, VersionDiffStatus},
  state::StateFilter,
};
use uuid::Uuid;

use crate::{
  error::domain,
  materialize::{self, AncestryMemo, Leaf},
};

type TripleKey = (String, String, String);

fn key_of(leaf: &Leaf) -> TripleKey {
  (leaf.entity_id.clone(), leaf.schema_key.clone(), leaf.file_id.clone())
}

// ─── Version diff ────────────────────────────────────────────────────────────

pub(crate) fn diff_versions(
  conn: &rusqlite::Connection,
  memo: &AncestryMemo,
  source_id: &str,
  target_id: &str,
  filter: &StateFilter,
) -> Result<Vec<VersionDiffEntry>, tokio_rusqlite::Error> {
  let source: BTreeMap<TripleKey, Leaf> =
    materialize::version_leaves(conn, memo, source_id, filter)?
      .into_iter()
      .map(|leaf| (key_of(&leaf), leaf))
      .collect();
  let target: BTreeMap<TripleKey, Leaf> =
    materialize::version_leaves(conn, memo, target_id, filter)?
      .into_iter()
      .map(|leaf| (key_of(&leaf), leaf))
      .collect();

  let keys: BTreeSet<&TripleKey> = source.keys().chain(target.keys()).collect();

  let mut entries = Vec::new();
  for key in keys {
    let src = source.get(key);
    let tgt = target.get(key);
    let src_live = src.is_some_and(|l| !l.is_tombstone());
    let tgt_live = tgt.is_some_and(|l| !l.is_tombstone());

    let status = match (src_live, tgt_live) {
      (true, true) => match (src, tgt) {
        (Some(s), Some(t)) if s.change_id == t.change_id => {
          VersionDiffStatus::Unchanged
        },
        _ => VersionDiffStatus::Updated,
      },
      // Live only in the source; a target tombstone is overwritten.
      (true, false) => VersionDiffStatus::Created,
      (false, true) => match src {
        // Source explicitly deleted what the target still has.
        Some(_) => VersionDiffStatus::Deleted,
        // The source never knew about the entity; merging preserves it.
        None => VersionDiffStatus::Unchanged,
      },
      // Deleted (or absent) on both sides; nothing to report.
      (false, false) => continue,
    };

    let (entity_id, schema_key, file_id) = key.clone();
    entries.push(VersionDiffEntry {
      entity_id,
      schema_key,
      file_id,
      before: tgt.and_then(|l| l.snapshot_content.clone()),
      after: match status {
        VersionDiffStatus::Unchanged if !src_live => {
          tgt.and_then(|l| l.snapshot_content.clone())
        },
        _ => src.and_then(|l| l.snapshot_content.clone()),
      },
      before_change_id: tgt.map(|l| l.change_id),
      after_change_id: src.map(|l| l.change_id),
      status,
    });
  }
  Ok(entries)
}

// ─── Commit diff ─────────────────────────────────────────────────────────────

pub(crate) fn diff_commits(
  conn: &rusqlite::Connection,
  memo: &AncestryMemo,
  before_id: Uuid,
  after_id: Uuid,
  filter: &StateFilter,
  include_unchanged: bool,
) -> Result<Vec<CommitDiffEntry>, tokio_rusqlite::Error> {
  for id in [before_id, after_id] {
    if !materialize::commit_exists(conn, id)? {
      return Err(domain(lix_core::Error::CommitNotFound(id)));
    }
  }

  let before_ancestry = memo.get_or_walk(conn, before_id)?;
  let after_ancestry = memo.get_or_walk(conn, after_id)?;

  let before_leaves = index_leaves(conn, &before_ancestry, filter)?;
  let after_leaves = index_leaves(conn, &after_ancestry, filter)?;

  // Only commits reachable from exactly one side can change a triple's
  // leaf, so restrict the comparison to the triples they touched.
  let relevant: BTreeSet<TripleKey> = if include_unchanged {
    before_leaves.keys().chain(after_leaves.keys()).cloned().collect()
  } else {
    let before_set: BTreeSet<Uuid> =
      before_ancestry.iter().map(|(id, _)| *id).collect();
    let after_set: BTreeSet<Uuid> =
      after_ancestry.iter().map(|(id, _)| *id).collect();
    let exclusive: Vec<Uuid> = before_set
      .symmetric_difference(&after_set)
      .copied()
      .collect();
    touched_triples(conn, &exclusive, filter)?
  };

  let mut entries = Vec::new();
  for key in relevant {
    let before = before_leaves.get(&key);
    let after = after_leaves.get(&key);
    let before_live = before.is_some_and(|l| !l.is_tombstone());
    let after_live = after.is_some_and(|l| !l.is_tombstone());

    let status = match (before_live, after_live) {
      (false, true) => CommitDiffStatus::Added,
      (true, false) => CommitDiffStatus::Removed,
      (true, true) => match (before, after) {
        (Some(b), Some(a)) if b.change_id == a.change_id => {
          CommitDiffStatus::Unchanged
        },
        _ => CommitDiffStatus::Modified,
      },
      (false, false) => continue,
    };
    if status == CommitDiffStatus::Unchanged && !include_unchanged {
      continue;
    }

    let (entity_id, schema_key, file_id) = key;
    entries.push(CommitDiffEntry {
      entity_id,
      schema_key,
      file_id,
      before: before.and_then(|l| l.snapshot_content.clone()),
      after: after.and_then(|l| l.snapshot_content.clone()),
      before_change_id: before.map(|l| l.change_id),
      after_change_id: after.map(|l| l.change_id),
      status,
    });
  }
  Ok(entries)
}

fn index_leaves(
  conn: &rusqlite::Connection,
  ancestors: &[(Uuid, usize)],
  filter: &StateFilter,
) -> rusqlite::Result<BTreeMap<TripleKey, Leaf>> {
  let raw = materialize::candidates(conn, ancestors, filter)?;
  Ok(
    materialize::pick_leaves(raw)
      .into_iter()
      .map(|leaf| (key_of(&leaf), leaf))
      .collect(),
  )
}

/// Entity triples referenced by the change-set elements of `commits`.
fn touched_triples(
  conn: &rusqlite::Connection,
  commits: &[Uuid],
  filter: &StateFilter,
) -> rusqlite::Result<BTreeSet<TripleKey>> {
  let mut stmt = conn.prepare(
    "SELECT e.entity_id, e.schema_key, e.file_id
     FROM commits k
     JOIN change_set_elements e ON e.change_set_id = k.change_set_id
     WHERE k.commit_id = ?1",
  )?;

  let mut out = BTreeSet::new();
  for commit_id in commits {
    let rows = stmt
      .query_map(
        rusqlite::params![crate::encode::encode_uuid(*commit_id)],
        |row| {
          Ok((
            row.get::<_, String>(0)?,
            row.get::<_, String>(1)?,
            row.get::<_, String>(2)?,
          ))
        },
      )?
      .collect::<rusqlite::Result<Vec<_>>>()?;
    for (entity_id, schema_key, file_id) in rows {
      if filter.matches(&entity_id, &schema_key, &file_id) {
        out.insert((entity_id, schema_key, file_id));
      }
    }
  }
  Ok(out)
}
