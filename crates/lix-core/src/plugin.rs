//! The plugin boundary — external change sources and file materialization.
//!
//! A plugin turns an external document format into per-entity changes and,
//! optionally, materializes committed changes back into file bytes. The
//! engine treats this as an opaque boundary: it never inspects snapshot
//! content beyond what the mutation validator's schema requires.

use serde_json::Value;

use crate::{Error, Result, schema::SchemaDefinition};

/// One change detected by a plugin when comparing two states of a file.
/// `snapshot == None` reports that the entity was deleted.
#[derive(Debug, Clone)]
pub struct DetectedChange {
  pub entity_id: String,
  pub schema:    SchemaDefinition,
  pub snapshot:  Option<Value>,
}

/// A resolved leaf change handed to [`FilePlugin::apply_changes`].
#[derive(Debug, Clone)]
pub struct FileChange {
  pub entity_id:        String,
  pub schema_key:       String,
  pub schema_version:   String,
  pub snapshot_content: Option<Value>,
}

/// A file-format plugin.
///
/// `apply_changes` is an optional capability; the default implementation
/// reports [`Error::PluginCapabilityMissing`].
pub trait FilePlugin: Send + Sync {
  /// Stable key identifying this plugin; recorded on every change it
  /// produces.
  fn key(&self) -> &str;

  /// Compare two file states and report the entity-level changes between
  /// them. `before == None` means the file is new.
  fn detect_changes(
    &self,
    before: Option<&[u8]>,
    after: &[u8],
  ) -> Result<Vec<DetectedChange>>;

  /// Materialize committed changes back into file bytes.
  fn apply_changes(&self, _changes: &[FileChange]) -> Result<Vec<u8>> {
    Err(Error::PluginCapabilityMissing {
      plugin_key: self.key().to_owned(),
      capability: "applyChanges",
    })
  }
}
