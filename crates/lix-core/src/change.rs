//! Change types — the fundamental unit of the lix change log.
//!
//! A change is an immutable record of an entity's new (or deleted) content.
//! Changes are never updated in place; a new state is a new change, and an
//! explicit deletion is a change whose snapshot is `None` (a tombstone).

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use uuid::Uuid;

// ─── Snapshot ────────────────────────────────────────────────────────────────

/// A content-addressed JSON payload referenced by one or more changes. A
/// no-op write that repeats prior content reuses the existing snapshot.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Snapshot {
  /// SHA-256 hex digest of the canonical JSON serialization.
  pub id:      String,
  pub content: Value,
}

// ─── Change ──────────────────────────────────────────────────────────────────

/// One immutable record in the append-only log. `snapshot_id == None` marks
/// an explicit deletion (tombstone).
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Change {
  pub id:             Uuid,
  pub entity_id:      String,
  pub schema_key:     String,
  pub schema_version: String,
  pub file_id:        String,
  pub plugin_key:     String,
  pub snapshot_id:    Option<String>,
  /// Server-assigned timestamp; never changes after creation.
  pub created_at:     DateTime<Utc>,
}

impl Change {
  pub fn is_tombstone(&self) -> bool {
    self.snapshot_id.is_none()
  }
}

// ─── Change-Set ──────────────────────────────────────────────────────────────

/// The unordered set of changes belonging to one commit — "what changed" for
/// one unit of work.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ChangeSet {
  pub id:         Uuid,
  pub created_at: DateTime<Utc>,
}

/// One element of a change-set. Elements always reference an existing change.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ChangeSetElement {
  pub change_set_id: Uuid,
  pub change_id:     Uuid,
  pub entity_id:     String,
  pub schema_key:    String,
  pub file_id:       String,
}

// ─── Authorship ──────────────────────────────────────────────────────────────

/// Attribution of a tracked domain change to an account that was active when
/// the change was committed.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ChangeAuthor {
  pub change_id:  Uuid,
  pub account_id: String,
}

// ─── NewPendingChange ────────────────────────────────────────────────────────

/// Input to the engine's `insert`/`update`/`delete` staging operations.
/// Change ids and timestamps are always assigned by the engine at commit
/// time; they are not accepted from callers.
#[derive(Debug, Clone)]
pub struct NewPendingChange {
  pub entity_id:      String,
  pub schema_key:     String,
  pub file_id:        String,
  /// `None` stages a tombstone.
  pub content:        Option<Value>,
  /// Plugin that produced the change; defaults to the engine's own key for
  /// direct entity writes.
  pub plugin_key:     Option<String>,
  /// Target version; `None` means the engine's active version.
  pub version_id:     Option<String>,
  /// Untracked changes receive no author attribution at commit.
  pub untracked:      bool,
}

impl NewPendingChange {
  /// Convenience constructor with all optional fields set to their defaults.
  pub fn new(
    schema_key: impl Into<String>,
    entity_id: impl Into<String>,
    file_id: impl Into<String>,
    content: Option<Value>,
  ) -> Self {
    Self {
      entity_id: entity_id.into(),
      schema_key: schema_key.into(),
      file_id: file_id.into(),
      content,
      plugin_key: None,
      version_id: None,
      untracked: false,
    }
  }
}
