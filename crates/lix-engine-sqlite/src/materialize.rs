//! State materializer — reconstructs leaf state by walking commit ancestry.
//!
//! Ancestry is an explicit breadth-first walk over the `commit_edges`
//! adjacency with a minimum-depth map and a visited guard (commits reachable
//! through multiple paths keep their smallest depth). Within a
//! `(entity_id, schema_key, file_id)` group the leaf is the candidate with
//! the smallest depth; ties break by newest `created_at`, then by highest
//! change id — a total order, because concurrent commits can share a
//! timestamp.

use std::{
  collections::{BTreeMap, VecDeque},
  sync::{Arc, Mutex, PoisonError},
};

use chrono::{DateTime, Utc};
use lix_core::state::StateFilter;
use serde_json::Value;
use uuid::Uuid;

use crate::{
  encode::{decode_dt, decode_uuid, encode_uuid},
  versions,
};

// ─── Row types ───────────────────────────────────────────────────────────────

/// One change observed at one ancestor commit.
#[derive(Debug, Clone)]
pub(crate) struct Candidate {
  pub entity_id:        String,
  pub schema_key:       String,
  pub schema_version:   String,
  pub file_id:          String,
  pub plugin_key:       String,
  pub change_id:        Uuid,
  pub commit_id:        Uuid,
  pub depth:            usize,
  pub snapshot_content: Option<Value>,
  pub created_at:       DateTime<Utc>,
}

/// The most recent state of one entity triple as of a target commit.
#[derive(Debug, Clone)]
pub(crate) struct Leaf {
  pub entity_id:        String,
  pub schema_key:       String,
  pub schema_version:   String,
  pub file_id:          String,
  pub plugin_key:       String,
  pub change_id:        Uuid,
  pub commit_id:        Uuid,
  /// `None` marks a tombstone leaf — excluded from visible state but
  /// distinguishable from "never existed" for diffing.
  pub snapshot_content: Option<Value>,
  /// Oldest candidate timestamp for the triple (cache `created_at`).
  pub first_seen_at:    DateTime<Utc>,
  /// Winning change's timestamp (cache `updated_at`).
  pub updated_at:       DateTime<Utc>,
}

impl Leaf {
  pub fn is_tombstone(&self) -> bool {
    self.snapshot_content.is_none()
  }
}

// ─── Ancestry ────────────────────────────────────────────────────────────────

/// Memo of ancestry walks keyed by start commit. A commit's ancestry only
/// changes when a write transaction adds edges, so the engine clears the
/// memo after every commit, checkpoint, and import.
#[derive(Debug, Default)]
pub(crate) struct AncestryMemo {
  inner: Mutex<BTreeMap<Uuid, Arc<Vec<(Uuid, usize)>>>>,
}

impl AncestryMemo {
  pub fn get_or_walk(
    &self,
    conn: &rusqlite::Connection,
    start: Uuid,
  ) -> rusqlite::Result<Arc<Vec<(Uuid, usize)>>> {
    let mut inner =
      self.inner.lock().unwrap_or_else(PoisonError::into_inner);
    if let Some(hit) = inner.get(&start) {
      return Ok(Arc::clone(hit));
    }
    let walked = Arc::new(ancestry(conn, start)?);
    inner.insert(start, Arc::clone(&walked));
    Ok(walked)
  }

  pub fn clear(&self) {
    self
      .inner
      .lock()
      .unwrap_or_else(PoisonError::into_inner)
      .clear();
  }
}

pub(crate) fn commit_exists(
  conn: &rusqlite::Connection,
  commit_id: Uuid,
) -> rusqlite::Result<bool> {
  let count: i64 = conn.query_row(
    "SELECT COUNT(*) FROM commits WHERE commit_id = ?1",
    rusqlite::params![encode_uuid(commit_id)],
    |row| row.get(0),
  )?;
  Ok(count > 0)
}

/// All ancestors of `start` (inclusive) with their minimum depth, ordered by
/// `(depth, commit_id)` for determinism.
pub(crate) fn ancestry(
  conn: &rusqlite::Connection,
  start: Uuid,
) -> rusqlite::Result<Vec<(Uuid, usize)>> {
  let mut parents_stmt = conn.prepare(
    "SELECT parent_id FROM commit_edges WHERE child_id = ?1 ORDER BY parent_id",
  )?;

  let mut min_depth: BTreeMap<Uuid, usize> = BTreeMap::new();
  let mut queue = VecDeque::new();
  queue.push_back((start, 0usize));

  while let Some((commit_id, depth)) = queue.pop_front() {
    if let Some(existing) = min_depth.get(&commit_id) {
      if *existing <= depth {
        continue;
      }
    }
    min_depth.insert(commit_id, depth);

    let parents = parents_stmt
      .query_map(rusqlite::params![encode_uuid(commit_id)], |row| {
        row.get::<_, String>(0)
      })?
      .collect::<rusqlite::Result<Vec<_>>>()?;
    for parent in parents {
      let parent_id = decode_uuid(&parent)
        .map_err(|e| rusqlite::Error::ToSqlConversionFailure(Box::new(e)))?;
      queue.push_back((parent_id, depth + 1));
    }
  }

  let mut out: Vec<(Uuid, usize)> = min_depth.into_iter().collect();
  out.sort_by(|a, b| a.1.cmp(&b.1).then_with(|| a.0.cmp(&b.0)));
  Ok(out)
}

// ─── Candidates ──────────────────────────────────────────────────────────────

/// Join each ancestor commit's change-set elements to concrete changes.
pub(crate) fn candidates(
  conn: &rusqlite::Connection,
  ancestors: &[(Uuid, usize)],
  filter: &StateFilter,
) -> rusqlite::Result<Vec<Candidate>> {
  let mut stmt = conn.prepare(
    "SELECT c.change_id, c.entity_id, c.schema_key, c.schema_version,
            c.file_id, c.plugin_key, c.created_at, s.content
     FROM commits k
     JOIN change_set_elements e ON e.change_set_id = k.change_set_id
     JOIN changes c             ON c.change_id     = e.change_id
     LEFT JOIN snapshots s      ON s.snapshot_id   = c.snapshot_id
     WHERE k.commit_id = ?1",
  )?;

  let mut out = Vec::new();
  for (commit_id, depth) in ancestors {
    let rows = stmt
      .query_map(rusqlite::params![encode_uuid(*commit_id)], |row| {
        let change_id: String = row.get(0)?;
        let created_at: String = row.get(6)?;
        let content: Option<String> = row.get(7)?;
        Ok((
          change_id,
          row.get::<_, String>(1)?,
          row.get::<_, String>(2)?,
          row.get::<_, String>(3)?,
          row.get::<_, String>(4)?,
          row.get::<_, String>(5)?,
          created_at,
          content,
        ))
      })?
      .collect::<rusqlite::Result<Vec<_>>>()?;

    for (id, entity_id, schema_key, schema_version, file_id, plugin_key, at, content) in rows {
      if !filter.matches(&entity_id, &schema_key, &file_id) {
        continue;
      }
      let snapshot_content = content
        .as_deref()
        .map(serde_json::from_str)
        .transpose()
        .map_err(|e| rusqlite::Error::ToSqlConversionFailure(Box::new(e)))?;
      out.push(Candidate {
        entity_id,
        schema_key,
        schema_version,
        file_id,
        plugin_key,
        change_id: decode_uuid(&id)
          .map_err(|e| rusqlite::Error::ToSqlConversionFailure(Box::new(e)))?,
        commit_id: *commit_id,
        depth: *depth,
        snapshot_content,
        created_at: decode_dt(&at)
          .map_err(|e| rusqlite::Error::ToSqlConversionFailure(Box::new(e)))?,
      });
    }
  }
  Ok(out)
}

// ─── Leaf selection ──────────────────────────────────────────────────────────

/// Pick one leaf per entity triple from raw candidates. Pure so the
/// tie-break is unit-testable.
pub(crate) fn pick_leaves(candidates: Vec<Candidate>) -> Vec<Leaf> {
  let mut groups: BTreeMap<(String, String, String), Vec<Candidate>> =
    BTreeMap::new();
  for candidate in candidates {
    groups
      .entry((
        candidate.entity_id.clone(),
        candidate.schema_key.clone(),
        candidate.file_id.clone(),
      ))
      .or_default()
      .push(candidate);
  }

  let mut leaves = Vec::with_capacity(groups.len());
  for (_, mut rows) in groups {
    rows.sort_by(|a, b| {
      a.depth
        .cmp(&b.depth)
        .then_with(|| b.created_at.cmp(&a.created_at))
        .then_with(|| b.change_id.cmp(&a.change_id))
    });
    let first_seen_at = rows
      .iter()
      .map(|c| c.created_at)
      .min()
      .unwrap_or_else(Utc::now);
    let Some(winner) = rows.into_iter().next() else {
      continue;
    };
    leaves.push(Leaf {
      entity_id: winner.entity_id,
      schema_key: winner.schema_key,
      schema_version: winner.schema_version,
      file_id: winner.file_id,
      plugin_key: winner.plugin_key,
      change_id: winner.change_id,
      commit_id: winner.commit_id,
      snapshot_content: winner.snapshot_content,
      first_seen_at,
      updated_at: winner.created_at,
    });
  }
  leaves
}

/// Leaf state of every triple matching `filter` as of `target`, tombstone
/// leaves included.
pub(crate) fn leaves_at(
  conn: &rusqlite::Connection,
  memo: &AncestryMemo,
  target: Uuid,
  filter: &StateFilter,
) -> rusqlite::Result<Vec<Leaf>> {
  let ancestors = memo.get_or_walk(conn, target)?;
  let raw = candidates(conn, &ancestors, filter)?;
  Ok(pick_leaves(raw))
}

// ─── Version resolution ──────────────────────────────────────────────────────

/// Leaf state for a version: its own ancestry first, then each inheritance
/// ancestor for triples the nearer lineages did not resolve. A tombstone at
/// a nearer depth resolves the triple (and masks parents). The
/// `inherited_from` tag readers see is attached on the cache read path.
pub(crate) fn version_leaves(
  conn: &rusqlite::Connection,
  memo: &AncestryMemo,
  version_id: &str,
  filter: &StateFilter,
) -> Result<Vec<Leaf>, tokio_rusqlite::Error> {
  let version = versions::require_version(conn, version_id)?;
  let mut resolved: BTreeMap<(String, String, String), Leaf> = BTreeMap::new();

  if let Some(tip) = version.commit_id {
    for leaf in leaves_at(conn, memo, tip, filter)? {
      resolved.insert(
        (leaf.entity_id.clone(), leaf.schema_key.clone(), leaf.file_id.clone()),
        leaf,
      );
    }
  }

  for ancestor_id in versions::inheritance_chain(conn, version_id)? {
    let ancestor = versions::require_version(conn, &ancestor_id)?;
    let Some(tip) = ancestor.commit_id else {
      continue;
    };
    for leaf in leaves_at(conn, memo, tip, filter)? {
      let key = (
        leaf.entity_id.clone(),
        leaf.schema_key.clone(),
        leaf.file_id.clone(),
      );
      resolved.entry(key).or_insert(leaf);
    }
  }

  Ok(resolved.into_values().collect())
}

// ─── History ─────────────────────────────────────────────────────────────────

/// All states of one entity triple along the ancestry of `root`, nearest
/// first, renumbered so depth 0 is the current state and depth N the Nth
/// earlier one.
pub(crate) fn history_at(
  conn: &rusqlite::Connection,
  memo: &AncestryMemo,
  root: Uuid,
  entity_id: &str,
  schema_key: &str,
  file_id: &str,
) -> rusqlite::Result<Vec<Candidate>> {
  let ancestors = memo.get_or_walk(conn, root)?;
  let filter = StateFilter {
    entity_id:  Some(entity_id.to_owned()),
    schema_key: Some(schema_key.to_owned()),
    file_id:    Some(file_id.to_owned()),
  };
  let mut states = candidates(conn, &ancestors, &filter)?;
  states.sort_by(|a, b| {
    a.depth
      .cmp(&b.depth)
      .then_with(|| b.created_at.cmp(&a.created_at))
      .then_with(|| b.change_id.cmp(&a.change_id))
  });
  // A change reachable through multiple paths appears once, at its nearest
  // depth.
  states.dedup_by(|a, b| a.change_id == b.change_id);
  for (index, state) in states.iter_mut().enumerate() {
    state.depth = index;
  }
  Ok(states)
}

#[cfg(test)]
mod tests {
  use chrono::TimeZone as _;
  use serde_json::json;

  use super::*;

  fn candidate(
    entity: &str,
    depth: usize,
    at_secs: i64,
    change_id: Uuid,
  ) -> Candidate {
    Candidate {
      entity_id:        entity.into(),
      schema_key:       "doc".into(),
      schema_version:   "1.0".into(),
      file_id:          "f1".into(),
      plugin_key:       "test".into(),
      change_id,
      commit_id:        Uuid::new_v4(),
      depth,
      snapshot_content: Some(json!({ "at": at_secs })),
      created_at:       Utc.timestamp_opt(at_secs, 0).unwrap(),
    }
  }

  #[test]
  fn smallest_depth_wins() {
    let newer = Uuid::new_v4();
    let older = Uuid::new_v4();
    let leaves = pick_leaves(vec![
      candidate("e1", 2, 100, older),
      candidate("e1", 0, 50, newer),
    ]);
    assert_eq!(leaves.len(), 1);
    assert_eq!(leaves[0].change_id, newer);
  }

  #[test]
  fn equal_depth_breaks_by_newest_created_at() {
    let a = Uuid::new_v4();
    let b = Uuid::new_v4();
    let leaves =
      pick_leaves(vec![candidate("e1", 1, 100, a), candidate("e1", 1, 200, b)]);
    assert_eq!(leaves[0].change_id, b);
  }

  #[test]
  fn equal_depth_and_timestamp_break_by_change_id_total_order() {
    let mut ids = [Uuid::new_v4(), Uuid::new_v4()];
    ids.sort();
    let [low, high] = ids;

    // Same winner regardless of candidate order.
    for pair in [[low, high], [high, low]] {
      let leaves = pick_leaves(vec![
        candidate("e1", 1, 100, pair[0]),
        candidate("e1", 1, 100, pair[1]),
      ]);
      assert_eq!(leaves[0].change_id, high);
    }
  }

  #[test]
  fn bookkeeping_timestamps_span_the_candidate_set() {
    let first = Uuid::new_v4();
    let last = Uuid::new_v4();
    let leaves = pick_leaves(vec![
      candidate("e1", 3, 10, first),
      candidate("e1", 0, 99, last),
    ]);
    assert_eq!(leaves[0].first_seen_at, Utc.timestamp_opt(10, 0).unwrap());
    assert_eq!(leaves[0].updated_at, Utc.timestamp_opt(99, 0).unwrap());
  }
}
