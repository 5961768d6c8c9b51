//! Version registry rows and inheritance resolution.
//!
//! Inheritance cycles are rejected when a version is created or repointed,
//! never at read time; `inheritance_chain` still carries a visited set so a
//! corrupted store cannot loop it.

use lix_core::version::Version;
use rusqlite::OptionalExtension as _;
use uuid::Uuid;

use crate::{
  encode::{decode_uuid_opt, encode_uuid},
  error::domain,
};

pub(crate) fn row_to_version(row: &rusqlite::Row<'_>) -> rusqlite::Result<Version> {
  let commit_id: Option<String> = row.get(2)?;
  let working_commit_id: Option<String> = row.get(3)?;
  let hidden: i64 = row.get(5)?;
  Ok(Version {
    id: row.get(0)?,
    name: row.get(1)?,
    commit_id: decode_uuid_opt(commit_id.as_deref())
      .map_err(|e| rusqlite::Error::ToSqlConversionFailure(Box::new(e)))?,
    working_commit_id: decode_uuid_opt(working_commit_id.as_deref())
      .map_err(|e| rusqlite::Error::ToSqlConversionFailure(Box::new(e)))?,
    inherits_from_version_id: row.get(4)?,
    hidden: hidden != 0,
  })
}

const VERSION_COLUMNS: &str = "version_id, name, commit_id, working_commit_id, \
                               inherits_from_version_id, hidden";

pub(crate) fn get_version(
  conn: &rusqlite::Connection,
  version_id: &str,
) -> rusqlite::Result<Option<Version>> {
  conn
    .query_row(
      &format!("SELECT {VERSION_COLUMNS} FROM versions WHERE version_id = ?1"),
      rusqlite::params![version_id],
      row_to_version,
    )
    .optional()
}

pub(crate) fn require_version(
  conn: &rusqlite::Connection,
  version_id: &str,
) -> Result<Version, tokio_rusqlite::Error> {
  get_version(conn, version_id)?.ok_or_else(|| {
    domain(lix_core::Error::VersionNotFound(version_id.to_owned()))
  })
}

pub(crate) fn list_versions(
  conn: &rusqlite::Connection,
) -> rusqlite::Result<Vec<Version>> {
  let mut stmt = conn
    .prepare(&format!("SELECT {VERSION_COLUMNS} FROM versions ORDER BY name"))?;
  stmt
    .query_map([], row_to_version)?
    .collect::<rusqlite::Result<Vec<_>>>()
}

pub(crate) fn insert_version(
  conn: &rusqlite::Connection,
  version: &Version,
) -> rusqlite::Result<()> {
  conn.execute(
    "INSERT INTO versions (version_id, name, commit_id, working_commit_id,
                           inherits_from_version_id, hidden)
     VALUES (?1, ?2, ?3, ?4, ?5, ?6)",
    rusqlite::params![
      version.id,
      version.name,
      version.commit_id.map(encode_uuid),
      version.working_commit_id.map(encode_uuid),
      version.inherits_from_version_id,
      version.hidden as i64,
    ],
  )?;
  Ok(())
}

/// Repoint a version's tip after a commit.
pub(crate) fn repoint_version(
  conn: &rusqlite::Connection,
  version_id: &str,
  commit_id: Uuid,
) -> rusqlite::Result<()> {
  conn.execute(
    "UPDATE versions SET commit_id = ?2, working_commit_id = ?2
     WHERE version_id = ?1",
    rusqlite::params![version_id, encode_uuid(commit_id)],
  )?;
  Ok(())
}

/// Ordered inheritance ancestors of a version (nearest parent first), not
/// including the version itself.
pub(crate) fn inheritance_chain(
  conn: &rusqlite::Connection,
  version_id: &str,
) -> rusqlite::Result<Vec<String>> {
  let mut chain = Vec::new();
  let mut visited = vec![version_id.to_owned()];
  let mut current = version_id.to_owned();

  loop {
    let parent: Option<Option<String>> = conn
      .query_row(
        "SELECT inherits_from_version_id FROM versions WHERE version_id = ?1",
        rusqlite::params![current],
        |row| row.get(0),
      )
      .optional()?;
    match parent.flatten() {
      Some(parent_id) if !visited.contains(&parent_id) => {
        visited.push(parent_id.clone());
        chain.push(parent_id.clone());
        current = parent_id;
      }
      _ => break,
    }
  }
  Ok(chain)
}

/// Reject an inheritance link that would make `version_id` a direct or
/// transitive ancestor of itself.
pub(crate) fn check_inheritance_acyclic(
  conn: &rusqlite::Connection,
  version_id: &str,
  inherits_from: &str,
) -> Result<(), tokio_rusqlite::Error> {
  if version_id == inherits_from {
    return Err(domain(lix_core::Error::InvalidGraph(format!(
      "version {version_id:?} cannot inherit from itself"
    ))));
  }
  let chain = inheritance_chain(conn, inherits_from)?;
  if chain.iter().any(|ancestor| ancestor == version_id) {
    return Err(domain(lix_core::Error::InvalidGraph(format!(
      "version {version_id:?} inheriting from {inherits_from:?} would form a cycle"
    ))));
  }
  Ok(())
}
