//! Error types for `lix-core`.
//!
//! Every user-visible failure carries the offending entity/schema/version
//! identifiers so callers can decide to retry, surface to a human, or abandon
//! the transaction.

use thiserror::Error;
use uuid::Uuid;

#[derive(Debug, Error)]
pub enum Error {
  /// A schema definition was rejected at registration time. Fatal to that
  /// `register` call only.
  #[error("invalid schema {schema_key:?}: {reason}")]
  InvalidSchema { schema_key: String, reason: String },

  /// Primary-key uniqueness violation against the target version (or one of
  /// its inheritance ancestors).
  #[error(
    "primary key violation for entity {entity_id:?} (schema {schema_key:?}, version {version_id:?})"
  )]
  PrimaryKeyViolation {
    schema_key: String,
    entity_id:  String,
    version_id: String,
  },

  /// A declared unique constraint was violated.
  #[error(
    "unique constraint {properties:?} violated by entity {entity_id:?} (schema {schema_key:?}, version {version_id:?})"
  )]
  UniqueViolation {
    schema_key: String,
    entity_id:  String,
    version_id: String,
    properties: Vec<String>,
  },

  /// A foreign key does not resolve to a live row in the referenced schema.
  #[error(
    "foreign key on entity {entity_id:?} (schema {schema_key:?}, version {version_id:?}) does not resolve in schema {referenced_schema_key:?}"
  )]
  ForeignKeyViolation {
    schema_key:            String,
    entity_id:             String,
    version_id:            String,
    referenced_schema_key: String,
  },

  /// Self-referencing or duplicate commit edge, a commit linked as its own
  /// ancestor, or a cyclic version-inheritance chain.
  #[error("invalid graph: {0}")]
  InvalidGraph(String),

  /// A mutation was routed at a read-only history view.
  #[error("view {view:?} is read-only")]
  ReadOnlyView { view: String },

  /// No plugin is registered for the given key.
  #[error("no plugin registered for key {plugin_key:?}")]
  MissingPlugin { plugin_key: String },

  /// The plugin exists but does not implement the requested capability.
  #[error("plugin {plugin_key:?} does not implement {capability}")]
  PluginCapabilityMissing {
    plugin_key: String,
    capability: &'static str,
  },

  #[error("commit not found: {0}")]
  CommitNotFound(Uuid),

  #[error("version not found: {0:?}")]
  VersionNotFound(String),

  #[error("schema not found: {0:?}")]
  SchemaNotFound(String),

  #[error("serialization error: {0}")]
  Serialization(#[from] serde_json::Error),
}

impl Error {
  /// Whether this is a mutation-time constraint violation: primary key,
  /// unique, or foreign key. These reject a single mutation; the
  /// enclosing transaction continues and can be retried with corrected data.
  pub fn is_constraint_violation(&self) -> bool {
    matches!(
      self,
      Self::PrimaryKeyViolation { .. }
        | Self::UniqueViolation { .. }
        | Self::ForeignKeyViolation { .. }
    )
  }
}

pub type Result<T, E = Error> = std::result::Result<T, E>;
