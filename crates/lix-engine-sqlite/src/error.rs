//! Error type for `lix-engine-sqlite`.

use thiserror::Error;

#[derive(Debug, Error)]
pub enum Error {
  #[error("core error: {0}")]
  Core(#[from] lix_core::Error),

  #[error("database error: {0}")]
  Database(tokio_rusqlite::Error),

  #[error("json error: {0}")]
  Json(#[from] serde_json::Error),

  #[error("uuid parse error: {0}")]
  Uuid(#[from] uuid::Error),

  #[error("date/time parse error: {0}")]
  DateParse(String),

  #[error("malformed export blob: {0}")]
  MalformedBlob(String),
}

impl Error {
  /// The underlying constraint/graph/taxonomy error, if this wraps one.
  pub fn as_core(&self) -> Option<&lix_core::Error> {
    match self {
      Self::Core(e) => Some(e),
      _ => None,
    }
  }
}

/// Domain errors raised inside a connection-thread closure travel out
/// through [`tokio_rusqlite::Error::Other`]; unwrap them back into
/// [`Error::Core`] so callers match on the taxonomy, not on transport.
impl From<tokio_rusqlite::Error> for Error {
  fn from(err: tokio_rusqlite::Error) -> Self {
    match err {
      tokio_rusqlite::Error::Other(boxed) => match boxed.downcast::<lix_core::Error>() {
        Ok(core) => Self::Core(*core),
        Err(other) => Self::Database(tokio_rusqlite::Error::Other(other)),
      },
      other => Self::Database(other),
    }
  }
}

impl From<rusqlite::Error> for Error {
  fn from(err: rusqlite::Error) -> Self {
    Self::Database(tokio_rusqlite::Error::Rusqlite(err))
  }
}

/// Wrap a domain error for transport out of a connection-thread closure.
pub(crate) fn domain(err: lix_core::Error) -> tokio_rusqlite::Error {
  tokio_rusqlite::Error::Other(Box::new(err))
}

pub type Result<T, E = Error> = std::result::Result<T, E>;
