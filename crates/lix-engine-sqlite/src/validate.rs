//! Mutation validator — schema constraint enforcement.
//!
//! Runs before anything is staged or appended: on violation the mutation is
//! rejected and the change log is never polluted with invalid states.
//! Checks run against the committed state cache for the target version and
//! its inheritance ancestors, overlaid with the in-flight transaction
//! buffer (staged inserts count, staged deletions don't).

use std::collections::BTreeMap;

use lix_core::{schema::SchemaDefinition, state::StateFilter};
use serde_json::Value;

use crate::{
  cache,
  error::domain,
  registry::SchemaRegistry,
  txn::{PendingOp, TxnBuffer},
  versions,
};

/// The validator's view of one live row.
struct VisibleRow {
  entity_id: String,
  file_id:   String,
  content:   Value,
}

/// Live rows of one schema as the in-flight transaction sees them.
fn visible_rows(
  conn: &rusqlite::Connection,
  registry: &SchemaRegistry,
  buffer: &TxnBuffer,
  schema_key: &str,
  version_id: &str,
) -> Result<Vec<VisibleRow>, tokio_rusqlite::Error> {
  let mut rows: BTreeMap<(String, String), VisibleRow> = BTreeMap::new();

  let filter = StateFilter::for_schema(schema_key);
  for row in cache::read_state(conn, registry, version_id, &filter)? {
    rows.insert(
      (row.entity_id.clone(), row.file_id.clone()),
      VisibleRow {
        entity_id: row.entity_id,
        file_id:   row.file_id,
        content:   row.snapshot_content,
      },
    );
  }

  let mut lookup_order = vec![version_id.to_owned()];
  lookup_order.extend(versions::inheritance_chain(conn, version_id)?);
  for pending in buffer.rows_for(&lookup_order, schema_key) {
    let key = (pending.entity_id.clone(), pending.file_id.clone());
    match &pending.content {
      Some(content) => {
        rows.insert(
          key,
          VisibleRow {
            entity_id: pending.entity_id.clone(),
            file_id:   pending.file_id.clone(),
            content:   content.clone(),
          },
        );
      }
      None => {
        rows.remove(&key);
      }
    }
  }

  Ok(rows.into_values().collect())
}

/// Validate a proposed insert/update. Tombstone staging (`delete`) is not
/// constraint-checked. An insert additionally requires its key to be free:
/// a live row under the same `(entity_id, file_id)` rejects it, where an
/// update would overwrite.
pub(crate) fn validate_mutation(
  conn: &rusqlite::Connection,
  registry: &SchemaRegistry,
  buffer: &TxnBuffer,
  schema: &SchemaDefinition,
  op: PendingOp,
  version_id: &str,
  entity_id: &str,
  file_id: &str,
  content: &Value,
) -> Result<(), tokio_rusqlite::Error> {
  let peers = visible_rows(conn, registry, buffer, &schema.key, version_id)?;
  let is_self =
    |row: &VisibleRow| row.entity_id == entity_id && row.file_id == file_id;

  if op == PendingOp::Insert && peers.iter().any(|row| is_self(row)) {
    return Err(domain(lix_core::Error::PrimaryKeyViolation {
      schema_key: schema.key.clone(),
      entity_id:  entity_id.to_owned(),
      version_id: version_id.to_owned(),
    }));
  }

  // (a) primary-key uniqueness.
  if let Some(pk) = SchemaDefinition::values_at(content, &schema.primary_key) {
    let clash = peers.iter().any(|row| {
      !is_self(row)
        && SchemaDefinition::values_at(&row.content, &schema.primary_key)
          .is_some_and(|other| other == pk)
    });
    if clash {
      return Err(domain(lix_core::Error::PrimaryKeyViolation {
        schema_key: schema.key.clone(),
        entity_id:  entity_id.to_owned(),
        version_id: version_id.to_owned(),
      }));
    }
  }

  // (b) declared unique groups, nested pointer fields included.
  for group in &schema.unique {
    let Some(values) = SchemaDefinition::values_at(content, group) else {
      // Partially-missing tuples do not participate in uniqueness.
      continue;
    };
    let clash = peers.iter().any(|row| {
      !is_self(row)
        && SchemaDefinition::values_at(&row.content, group)
          .is_some_and(|other| other == values)
    });
    if clash {
      return Err(domain(lix_core::Error::UniqueViolation {
        schema_key: schema.key.clone(),
        entity_id:  entity_id.to_owned(),
        version_id: version_id.to_owned(),
        properties: group.clone(),
      }));
    }
  }

  // (c) foreign keys resolve to a live (not tombstoned) row.
  for fk in &schema.foreign_keys {
    let Some(local) = SchemaDefinition::values_at(content, &fk.properties)
    else {
      continue;
    };
    let referenced = visible_rows(
      conn,
      registry,
      buffer,
      &fk.references.schema_key,
      version_id,
    )?;
    let resolves = referenced.iter().any(|row| {
      SchemaDefinition::values_at(&row.content, &fk.references.properties)
        .is_some_and(|target| target == local)
    });
    if !resolves {
      return Err(domain(lix_core::Error::ForeignKeyViolation {
        schema_key:            schema.key.clone(),
        entity_id:             entity_id.to_owned(),
        version_id:            version_id.to_owned(),
        referenced_schema_key: fk.references.schema_key.clone(),
      }));
    }
  }

  Ok(())
}
