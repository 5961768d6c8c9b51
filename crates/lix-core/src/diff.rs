//! Diff result types.
//!
//! Version diffs are deliberately asymmetric and merge-biased: the source
//! side wins on conflict. Commit diffs are symmetric reconstructions of the
//! leaf state at two commits.

use serde::{Deserialize, Serialize};
use serde_json::Value;
use uuid::Uuid;

// ─── Version diff ────────────────────────────────────────────────────────────

/// Classification of one entity in a source-wins version comparison.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum VersionDiffStatus {
  /// A live leaf exists in the source only.
  Created,
  /// The source leaf is an explicit tombstone and the target has a live leaf.
  Deleted,
  /// Both sides have live leaves with different change ids.
  Updated,
  /// Same change id on both sides, or the entity exists only in the target
  /// (the source never knew about it, so it is preserved).
  Unchanged,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct VersionDiffEntry {
  pub entity_id:  String,
  pub schema_key: String,
  pub file_id:    String,
  pub before:     Option<Value>,
  pub after:      Option<Value>,
  pub before_change_id: Option<Uuid>,
  pub after_change_id:  Option<Uuid>,
  pub status:     VersionDiffStatus,
}

// ─── Commit diff ─────────────────────────────────────────────────────────────

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum CommitDiffStatus {
  Added,
  Removed,
  Modified,
  Unchanged,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CommitDiffEntry {
  pub entity_id:  String,
  pub schema_key: String,
  pub file_id:    String,
  pub before:     Option<Value>,
  pub after:      Option<Value>,
  pub before_change_id: Option<Uuid>,
  pub after_change_id:  Option<Uuid>,
  pub status:     CommitDiffStatus,
}
