//! The `StateReader` trait — the narrow read surface consumed by the
//! external query-rewriting layer.
//!
//! The query layer reads exclusively through this interface (backed by the
//! state cache and materializer), never from the raw change log in the hot
//! path. History reads are read-only; engines must reject mutations routed
//! at history views with [`crate::Error::ReadOnlyView`].

use std::future::Future;

use uuid::Uuid;

use crate::state::{HistoryRow, StateFilter, StateRow};

/// Abstraction over an engine's materialized-state read surface.
///
/// All methods return `Send` futures so the trait can be used in
/// multi-threaded async runtimes.
pub trait StateReader: Send + Sync {
  type Error: std::error::Error + Send + Sync + 'static;

  /// Current state of the active version, including rows staged in the
  /// caller's own uncommitted transaction.
  fn state(
    &self,
    filter: &StateFilter,
  ) -> impl Future<Output = Result<Vec<StateRow>, Self::Error>> + Send + '_;

  /// Current committed state of an explicit version (`_all` variant).
  fn state_all<'a>(
    &'a self,
    version_id: &'a str,
    filter: &'a StateFilter,
  ) -> impl Future<Output = Result<Vec<StateRow>, Self::Error>> + Send + 'a;

  /// Historical states along the ancestry of `root_commit_id` (`_history`
  /// variant), ordered by depth. Finite and restartable.
  fn state_history(
    &self,
    root_commit_id: Uuid,
    filter: &StateFilter,
  ) -> impl Future<Output = Result<Vec<HistoryRow>, Self::Error>> + Send + '_;
}
