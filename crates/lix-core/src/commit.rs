//! Commits and the commit DAG.
//!
//! A commit points at one change-set and any number of parents. Edges are
//! derived from `parent_commit_ids` and must stay acyclic and
//! non-self-referencing. Checkpoints are ordinary commits carrying the
//! `"checkpoint"` label; auto-commits from intermediate mutations are not
//! checkpoints.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// Label attached to user-visible, stable save points.
pub const CHECKPOINT_LABEL: &str = "checkpoint";

/// A node in the commit DAG.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Commit {
  pub id:                Uuid,
  pub change_set_id:     Uuid,
  pub parent_commit_ids: Vec<Uuid>,
  pub created_at:        DateTime<Utc>,
}

/// A derived parent/child adjacency row.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct CommitEdge {
  pub parent_id: Uuid,
  pub child_id:  Uuid,
}

/// A label attached to a commit (e.g. [`CHECKPOINT_LABEL`]).
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CommitLabel {
  pub commit_id:  Uuid,
  pub label:      String,
  pub created_at: DateTime<Utc>,
}
