//! Read-surface row shapes consumed by the external query-rewriting layer.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use uuid::Uuid;

// ─── State rows ──────────────────────────────────────────────────────────────

/// One row of materialized current state for a version.
///
/// Rows overlaid from a pending, uncommitted transaction buffer have no
/// change or commit yet; `change_id`/`commit_id` are `None` for them.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StateRow {
  pub entity_id:                 String,
  pub schema_key:                String,
  pub file_id:                   String,
  pub version_id:                String,
  pub plugin_key:                String,
  pub snapshot_content:          Value,
  pub schema_version:            String,
  pub created_at:                DateTime<Utc>,
  pub updated_at:                DateTime<Utc>,
  /// Set when the row was resolved through version inheritance rather than
  /// from the version's own lineage.
  pub inherited_from_version_id: Option<String>,
  pub change_id:                 Option<Uuid>,
  pub commit_id:                 Option<Uuid>,
}

/// One historical state of an entity along a commit ancestry path.
/// Depth 0 is the state at the root commit; depth N is the Nth earlier state.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct HistoryRow {
  pub entity_id:        String,
  pub schema_key:       String,
  pub file_id:          String,
  pub plugin_key:       String,
  /// `None` marks a deletion state (tombstone) in the history sequence.
  pub snapshot_content: Option<Value>,
  pub schema_version:   String,
  pub change_id:        Uuid,
  pub commit_id:        Uuid,
  /// The commit whose ancestry this history was computed against.
  pub root_commit_id:   Uuid,
  pub depth:            usize,
  pub created_at:       DateTime<Utc>,
}

// ─── Filters ─────────────────────────────────────────────────────────────────

/// Restriction applied to state reads, cache population, and invalidation.
/// Empty fields mean "no restriction on that axis".
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct StateFilter {
  pub entity_id:  Option<String>,
  pub schema_key: Option<String>,
  pub file_id:    Option<String>,
}

impl StateFilter {
  pub fn for_schema(schema_key: impl Into<String>) -> Self {
    Self { schema_key: Some(schema_key.into()), ..Self::default() }
  }

  pub fn matches(
    &self,
    entity_id: &str,
    schema_key: &str,
    file_id: &str,
  ) -> bool {
    self.entity_id.as_deref().is_none_or(|e| e == entity_id)
      && self.schema_key.as_deref().is_none_or(|s| s == schema_key)
      && self.file_id.as_deref().is_none_or(|f| f == file_id)
  }
}
