//! Transaction buffer — pending mutations staged before commit.
//!
//! The buffer is scoped to the in-flight write transaction of one engine
//! handle: staged rows are visible to subsequent validator and reader calls
//! on the same handle (so multi-statement transactions can self-reference)
//! but invisible to other connections until commit. Commit folds the buffer
//! into the change store; rollback discards it with no store mutation.

use std::collections::BTreeMap;

use chrono::{DateTime, Utc};
use serde_json::Value;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum PendingOp {
  Insert,
  Update,
  Delete,
}

/// One staged mutation. A later write to the same key within the same
/// transaction supersedes the earlier one.
#[derive(Debug, Clone)]
pub(crate) struct PendingChange {
  pub entity_id:      String,
  pub schema_key:     String,
  pub schema_version: String,
  pub file_id:        String,
  pub plugin_key:     String,
  pub version_id:     String,
  /// `None` is a staged tombstone.
  pub content:        Option<Value>,
  pub untracked:      bool,
  pub op:             PendingOp,
  pub staged_at:      DateTime<Utc>,
}

/// Key identity of a staged row: `(version_id, schema_key, entity_id,
/// file_id)`.
pub(crate) type PendingKey = (String, String, String, String);

fn key_of(change: &PendingChange) -> PendingKey {
  (
    change.version_id.clone(),
    change.schema_key.clone(),
    change.entity_id.clone(),
    change.file_id.clone(),
  )
}

#[derive(Debug, Default)]
pub(crate) struct TxnBuffer {
  pending: BTreeMap<PendingKey, PendingChange>,
}

impl TxnBuffer {
  pub fn stage(&mut self, change: PendingChange) {
    self.pending.insert(key_of(&change), change);
  }

  pub fn is_empty(&self) -> bool {
    self.pending.is_empty()
  }

  /// Staged rows for one schema across a set of versions — the validator's
  /// view of in-flight state.
  pub fn rows_for<'a>(
    &'a self,
    version_ids: &'a [String],
    schema_key: &'a str,
  ) -> impl Iterator<Item = &'a PendingChange> + 'a {
    self.pending.values().filter(move |p| {
      p.schema_key == schema_key && version_ids.contains(&p.version_id)
    })
  }

  /// Staged rows targeting one version, for read-path overlay.
  pub fn rows_for_version<'a>(
    &'a self,
    version_id: &'a str,
  ) -> impl Iterator<Item = &'a PendingChange> + 'a {
    self
      .pending
      .values()
      .filter(move |p| p.version_id == version_id)
  }

  /// Drain the buffer for commit folding.
  pub fn take_all(&mut self) -> Vec<PendingChange> {
    std::mem::take(&mut self.pending).into_values().collect()
  }

  /// Discard everything (rollback).
  pub fn clear(&mut self) {
    self.pending.clear();
  }
}

#[cfg(test)]
mod tests {
  use serde_json::json;

  use super::*;

  fn pending(entity: &str, content: Option<Value>) -> PendingChange {
    PendingChange {
      entity_id:      entity.into(),
      schema_key:     "doc".into(),
      schema_version: "1.0".into(),
      file_id:        "f1".into(),
      plugin_key:     "test".into(),
      version_id:     "v1".into(),
      content,
      untracked:      false,
      op:             PendingOp::Insert,
      staged_at:      Utc::now(),
    }
  }

  #[test]
  fn later_write_supersedes_earlier_for_same_key() {
    let mut buffer = TxnBuffer::default();
    buffer.stage(pending("e1", Some(json!({"v": 1}))));
    buffer.stage(pending("e1", Some(json!({"v": 2}))));

    let drained = buffer.take_all();
    assert_eq!(drained.len(), 1);
    assert_eq!(drained[0].content, Some(json!({"v": 2})));
  }

  #[test]
  fn rollback_discards_everything() {
    let mut buffer = TxnBuffer::default();
    buffer.stage(pending("e1", Some(json!({"v": 1}))));
    buffer.stage(pending("e2", None));
    buffer.clear();
    assert!(buffer.is_empty());
  }
}
