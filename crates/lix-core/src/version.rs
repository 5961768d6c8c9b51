//! Versions — named, mutable pointers into the commit DAG.
//!
//! A version with `inherits_from_version_id` set sees entities from its
//! parent unless it has its own (possibly tombstoned) change for that
//! entity. Inheritance is a read-time fallback, not a copy.

use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// Well-known id of the hidden global scope version. Engine bookkeeping and
/// cross-version records target this scope.
pub const GLOBAL_VERSION_ID: &str = "global";

/// Default name of the version created (and made active) at engine open.
pub const MAIN_VERSION_NAME: &str = "main";

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Version {
  pub id:                       String,
  pub name:                     String,
  /// Tip of this version's lineage; `None` until its first commit.
  pub commit_id:                Option<Uuid>,
  pub working_commit_id:        Option<Uuid>,
  pub inherits_from_version_id: Option<String>,
  pub hidden:                   bool,
}

/// Input to the engine's `create_version`.
#[derive(Debug, Clone, Default)]
pub struct NewVersion {
  pub name:           String,
  /// Start the new lineage at an existing commit instead of empty.
  pub from_commit_id: Option<Uuid>,
  pub inherits_from:  Option<String>,
  pub hidden:         bool,
}

impl NewVersion {
  pub fn named(name: impl Into<String>) -> Self {
    Self { name: name.into(), ..Self::default() }
  }
}
