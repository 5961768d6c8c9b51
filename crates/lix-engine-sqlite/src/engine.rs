//! [`LixEngine`] — the public handle over one SQLite-backed lix instance.
//!
//! All database work runs on the connection thread via
//! [`tokio_rusqlite::Connection::call`]; each closure is one serialization
//! unit, so a commit's change-set synthesis can never interleave with
//! another write. Handle-level state (schema registry mirror, transaction
//! buffer, active version and accounts, plugins) is shared behind an `Arc`
//! so cloned handles observe each other's staged writes.

use std::{
  collections::BTreeMap,
  path::Path,
  sync::{Arc, Mutex, PoisonError, RwLock},
};

use chrono::Utc;
use lix_core::{
  change::{Change, NewPendingChange},
  commit::{CHECKPOINT_LABEL, Commit},
  diff::{CommitDiffEntry, VersionDiffEntry},
  plugin::{FileChange, FilePlugin},
  reader::StateReader,
  schema::SchemaDefinition,
  state::{HistoryRow, StateFilter, StateRow},
  version::{GLOBAL_VERSION_ID, MAIN_VERSION_NAME, NewVersion, Version},
};
use rusqlite::OptionalExtension as _;
use serde_json::Value;
use tracing::{debug, info};
use uuid::Uuid;

use crate::{
  Error, Result, blob, cache, diff,
  error::domain,
  graph, materialize,
  registry::{self, SchemaRegistry},
  schema_sql::SCHEMA,
  store,
  txn::{PendingChange, PendingOp, TxnBuffer},
  validate, versions,
};

/// Plugin key recorded on changes written directly through the entity API
/// rather than detected from a file.
pub const OWN_ENTITY_PLUGIN_KEY: &str = "lix_own_entity";

// ─── Outcome types ───────────────────────────────────────────────────────────

/// What a commit produced: the new commits (one per affected version), the
/// appended changes, and the materialized-state delta (domain rows plus
/// change-set-element rows).
#[derive(Debug, Default)]
pub struct CommitOutcome {
  pub commits:     Vec<Commit>,
  pub changes:     Vec<Change>,
  pub state_delta: Vec<StateRow>,
}

/// Which projection of a schema a view name refers to.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ViewScope {
  /// Active-version state.
  Base,
  /// Explicit-version state (`{key}_all`).
  All,
  /// Ancestry traversal (`{key}_history`); read-only.
  History,
}

// ─── Engine ──────────────────────────────────────────────────────────────────

struct Shared {
  registry:        RwLock<Arc<SchemaRegistry>>,
  buffer:          Mutex<TxnBuffer>,
  active_version:  RwLock<String>,
  active_accounts: RwLock<Vec<String>>,
  plugins:         RwLock<BTreeMap<String, Arc<dyn FilePlugin>>>,
  ancestry:        materialize::AncestryMemo,
}

/// A lix change-control engine backed by a single SQLite file.
///
/// Cloning is cheap — the connection is reference-counted and handle state
/// is shared.
#[derive(Clone)]
pub struct LixEngine {
  conn:   tokio_rusqlite::Connection,
  lix_id: String,
  shared: Arc<Shared>,
}

fn unpoison<T>(result: std::result::Result<T, PoisonError<T>>) -> T {
  result.unwrap_or_else(PoisonError::into_inner)
}

impl LixEngine {
  /// Open (or create) an engine at `path` and run schema initialisation.
  pub async fn open(path: impl AsRef<Path>) -> Result<Self> {
    let conn = tokio_rusqlite::Connection::open(path).await?;
    Self::init(conn).await
  }

  /// Open an in-memory engine — useful for testing.
  pub async fn open_in_memory() -> Result<Self> {
    let conn = tokio_rusqlite::Connection::open_in_memory().await?;
    Self::init(conn).await
  }

  async fn init(conn: tokio_rusqlite::Connection) -> Result<Self> {
    let (lix_id, registry, main_id) = conn
      .call(|conn| {
        conn.execute_batch(SCHEMA)?;
        let lix_id = blob::ensure_lix_id(conn)?;

        if versions::get_version(conn, GLOBAL_VERSION_ID)?.is_none() {
          versions::insert_version(conn, &Version {
            id:                       GLOBAL_VERSION_ID.to_owned(),
            name:                     GLOBAL_VERSION_ID.to_owned(),
            commit_id:                None,
            working_commit_id:        None,
            inherits_from_version_id: None,
            hidden:                   true,
          })?;
        }

        let main_id: String = match conn
          .query_row(
            "SELECT version_id FROM versions WHERE name = ?1",
            rusqlite::params![MAIN_VERSION_NAME],
            |row| row.get(0),
          )
          .optional()?
        {
          Some(id) => id,
          None => {
            let id = Uuid::new_v4().hyphenated().to_string();
            versions::insert_version(conn, &Version {
              id:                       id.clone(),
              name:                     MAIN_VERSION_NAME.to_owned(),
              commit_id:                None,
              working_commit_id:        None,
              inherits_from_version_id: Some(GLOBAL_VERSION_ID.to_owned()),
              hidden:                   false,
            })?;
            id
          }
        };

        let registry = SchemaRegistry::load(conn)?;
        Ok((lix_id, registry, main_id))
      })
      .await?;

    info!(lix_id = %lix_id, "engine opened");
    Ok(Self {
      conn,
      lix_id,
      shared: Arc::new(Shared {
        registry:        RwLock::new(Arc::new(registry)),
        buffer:          Mutex::new(TxnBuffer::default()),
        active_version:  RwLock::new(main_id),
        active_accounts: RwLock::new(Vec::new()),
        plugins:         RwLock::new(BTreeMap::new()),
        ancestry:        materialize::AncestryMemo::default(),
      }),
    })
  }

  /// Stable identity of this instance, minted at first open.
  pub fn lix_id(&self) -> &str {
    &self.lix_id
  }

  fn registry(&self) -> Arc<SchemaRegistry> {
    unpoison(self.shared.registry.read()).clone()
  }

  fn active_version_id(&self) -> String {
    unpoison(self.shared.active_version.read()).clone()
  }

  // ─── Schemas ───────────────────────────────────────────────────────────────

  /// Register (or idempotently re-register) a schema definition and create
  /// its state-cache table.
  pub async fn register_schema(&self, raw: Value) -> Result<SchemaDefinition> {
    let registered = self
      .conn
      .call(move |conn| registry::register_schema(conn, raw))
      .await?;

    let definition = registered.definition.clone();
    let generation = {
      let mut guard = unpoison(self.shared.registry.write());
      let mut next = (**guard).clone();
      next.insert(registered);
      let generation = next.generation();
      *guard = Arc::new(next);
      generation
    };
    debug!(schema_key = %definition.key, generation, "registered schema");
    Ok(definition)
  }

  /// Monotonic registry generation, bumped on every registration. Readers
  /// caching schema-derived artifacts compare generations to detect
  /// staleness instead of re-reading definitions.
  pub fn schema_generation(&self) -> u64 {
    self.registry().generation()
  }

  /// Resolve a view name to its schema key and scope, honoring the schema's
  /// view policy.
  pub fn resolve_view(&self, view_name: &str) -> Result<(String, ViewScope)> {
    let registry = self.registry();
    for schema in registry.schemas() {
      let key = &schema.definition.key;
      let views = &schema.definition.views;
      if view_name == key && views.base {
        return Ok((key.clone(), ViewScope::Base));
      }
      if views.all && view_name == format!("{key}_all") {
        return Ok((key.clone(), ViewScope::All));
      }
      if views.history && view_name == format!("{key}_history") {
        return Ok((key.clone(), ViewScope::History));
      }
    }
    Err(Error::Core(lix_core::Error::SchemaNotFound(
      view_name.to_owned(),
    )))
  }

  // ─── Mutations ─────────────────────────────────────────────────────────────

  /// Stage a new entity state. Validated against schema constraints before
  /// it enters the transaction buffer.
  pub async fn insert(&self, input: NewPendingChange) -> Result<()> {
    self.stage_write(input, PendingOp::Insert).await
  }

  /// Stage a replacement state for an existing entity.
  pub async fn update(&self, input: NewPendingChange) -> Result<()> {
    self.stage_write(input, PendingOp::Update).await
  }

  /// Stage an explicit deletion (tombstone). Idempotent: deleting an entity
  /// that is already absent stages a tombstone all the same.
  pub async fn delete(
    &self,
    schema_key: &str,
    entity_id: &str,
    file_id: &str,
    version_id: Option<String>,
  ) -> Result<()> {
    let registry = self.registry();
    let schema = registry.require(schema_key).map_err(Error::Core)?;
    let pending = PendingChange {
      entity_id:      entity_id.to_owned(),
      schema_key:     schema_key.to_owned(),
      schema_version: schema.definition.version.clone(),
      file_id:        file_id.to_owned(),
      plugin_key:     OWN_ENTITY_PLUGIN_KEY.to_owned(),
      version_id:     version_id.unwrap_or_else(|| self.active_version_id()),
      content:        None,
      untracked:      false,
      op:             PendingOp::Delete,
      staged_at:      Utc::now(),
    };
    let mut guard = unpoison(self.shared.buffer.lock());
    guard.stage(pending);
    Ok(())
  }

  /// Route a mutation through a view name. History views reject all writes.
  pub async fn write_view(
    &self,
    view_name: &str,
    entity_id: &str,
    file_id: &str,
    version_id: Option<String>,
    content: Option<Value>,
  ) -> Result<()> {
    let (schema_key, scope) = self.resolve_view(view_name)?;
    if scope == ViewScope::History {
      return Err(Error::Core(lix_core::Error::ReadOnlyView {
        view: view_name.to_owned(),
      }));
    }
    match content {
      Some(content) => {
        let mut input =
          NewPendingChange::new(schema_key, entity_id, file_id, Some(content));
        input.version_id = version_id;
        self.stage_write(input, PendingOp::Update).await
      }
      None => {
        self
          .delete(&schema_key, entity_id, file_id, version_id)
          .await
      }
    }
  }

  async fn stage_write(
    &self,
    input: NewPendingChange,
    op: PendingOp,
  ) -> Result<()> {
    let registry = self.registry();
    let schema = registry.require(&input.schema_key).map_err(Error::Core)?;
    let Some(content) = input.content else {
      return Err(Error::Core(lix_core::Error::InvalidSchema {
        schema_key: input.schema_key.clone(),
        reason:     "insert/update requires snapshot content".to_owned(),
      }));
    };

    let pending = PendingChange {
      entity_id: input.entity_id,
      schema_key: input.schema_key,
      schema_version: schema.definition.version.clone(),
      file_id: input.file_id,
      plugin_key: input
        .plugin_key
        .unwrap_or_else(|| OWN_ENTITY_PLUGIN_KEY.to_owned()),
      version_id: input
        .version_id
        .unwrap_or_else(|| self.active_version_id()),
      content: Some(content),
      untracked: input.untracked,
      op,
      staged_at: Utc::now(),
    };

    let definition = schema.definition.clone();
    let shared = Arc::clone(&self.shared);
    self
      .conn
      .call(move |conn| {
        {
          let buffer = unpoison(shared.buffer.lock());
          validate::validate_mutation(
            conn,
            &registry,
            &buffer,
            &definition,
            pending.op,
            &pending.version_id,
            &pending.entity_id,
            &pending.file_id,
            pending.content.as_ref().unwrap_or(&Value::Null),
          )?;
        }
        unpoison(shared.buffer.lock()).stage(pending);
        Ok(())
      })
      .await?;
    Ok(())
  }

  /// Discard all staged mutations without touching the change log.
  pub fn rollback(&self) {
    unpoison(self.shared.buffer.lock()).clear();
  }

  /// Whether any mutations are staged and uncommitted.
  pub fn has_pending(&self) -> bool {
    !unpoison(self.shared.buffer.lock()).is_empty()
  }

  // ─── Commits ───────────────────────────────────────────────────────────────

  /// Fold the transaction buffer into the change log: one change-set and
  /// commit per affected version, edges derived, versions repointed, cache
  /// refreshed. A commit with nothing staged is a no-op.
  pub async fn commit(&self) -> Result<CommitOutcome> {
    let registry = self.registry();
    let accounts = unpoison(self.shared.active_accounts.read()).clone();
    let shared = Arc::clone(&self.shared);

    let data = self
      .conn
      .call(move |conn| {
        let pending = unpoison(shared.buffer.lock()).take_all();
        if pending.is_empty() {
          return Ok(graph::CommitData::default());
        }

        let tx = conn.transaction().map_err(tokio_rusqlite::Error::from)?;
        match graph::commit_pending(
          &tx,
          &registry,
          &shared.ancestry,
          pending.clone(),
          &accounts,
        ) {
          Ok(data) => {
            tx.commit().map_err(tokio_rusqlite::Error::from)?;
            shared.ancestry.clear();
            Ok(data)
          }
          Err(err) => {
            // The buffer survives a failed commit so the caller can fix the
            // problem and retry or roll back.
            drop(tx);
            let mut buffer = unpoison(shared.buffer.lock());
            for change in pending {
              buffer.stage(change);
            }
            Err(err)
          }
        }
      })
      .await?;

    Ok(CommitOutcome {
      commits:     data.commits,
      changes:     data.changes,
      state_delta: data.state_delta,
    })
  }

  /// Commit staged work (if any) and label the active version's tip as a
  /// checkpoint, linked to the previous checkpoint.
  pub async fn create_checkpoint(&self) -> Result<Commit> {
    let registry = self.registry();
    let accounts = unpoison(self.shared.active_accounts.read()).clone();
    let active = self.active_version_id();
    let shared = Arc::clone(&self.shared);

    let commit = self
      .conn
      .call(move |conn| {
        let pending = unpoison(shared.buffer.lock()).take_all();
        let tx = conn.transaction().map_err(tokio_rusqlite::Error::from)?;

        let result = (|| {
          if !pending.is_empty() {
            graph::commit_pending(
              &tx,
              &registry,
              &shared.ancestry,
              pending.clone(),
              &accounts,
            )?;
          }
          let version = versions::require_version(&tx, &active)?;
          let Some(tip) = version.commit_id else {
            return Err(domain(lix_core::Error::InvalidGraph(format!(
              "version {active:?} has no commits to checkpoint"
            ))));
          };
          graph::mark_checkpoint(&tx, tip)?;
          graph::get_commit(&tx, tip)?
            .ok_or_else(|| domain(lix_core::Error::CommitNotFound(tip)))
        })();

        match result {
          Ok(commit) => {
            tx.commit().map_err(tokio_rusqlite::Error::from)?;
            shared.ancestry.clear();
            Ok(commit)
          }
          Err(err) => {
            drop(tx);
            let mut buffer = unpoison(shared.buffer.lock());
            for change in pending {
              buffer.stage(change);
            }
            Err(err)
          }
        }
      })
      .await?;
    Ok(commit)
  }

  /// All checkpoint commits, newest first.
  pub async fn checkpoints(&self) -> Result<Vec<Commit>> {
    let commits = self
      .conn
      .call(|conn| Ok(graph::labeled_commits(conn, CHECKPOINT_LABEL)?))
      .await?;
    Ok(commits)
  }

  /// Fetch a commit by id.
  pub async fn commit_by_id(&self, commit_id: Uuid) -> Result<Commit> {
    let commit = self
      .conn
      .call(move |conn| {
        graph::get_commit(conn, commit_id)?
          .ok_or_else(|| domain(lix_core::Error::CommitNotFound(commit_id)))
      })
      .await?;
    Ok(commit)
  }

  // ─── Versions ──────────────────────────────────────────────────────────────

  /// Create a named version, optionally starting from an existing commit
  /// and/or inheriting from another version.
  pub async fn create_version(&self, new: NewVersion) -> Result<Version> {
    let version = Version {
      id:                       Uuid::new_v4().hyphenated().to_string(),
      name:                     new.name,
      commit_id:                new.from_commit_id,
      working_commit_id:        new.from_commit_id,
      inherits_from_version_id: new.inherits_from,
      hidden:                   new.hidden,
    };
    let created = self
      .conn
      .call(move |conn| {
        if let Some(from) = version.commit_id {
          if !materialize::commit_exists(conn, from)? {
            return Err(domain(lix_core::Error::CommitNotFound(from)));
          }
        }
        if let Some(parent) = &version.inherits_from_version_id {
          versions::require_version(conn, parent)?;
          versions::check_inheritance_acyclic(conn, &version.id, parent)?;
        }
        versions::insert_version(conn, &version)?;
        Ok(version)
      })
      .await?;
    info!(version = %created.id, name = %created.name, "version created");
    Ok(created)
  }

  /// Make `version_id` the target of subsequent reads and writes.
  pub async fn switch_version(&self, version_id: &str) -> Result<()> {
    let id = version_id.to_owned();
    self
      .conn
      .call(move |conn| versions::require_version(conn, &id).map(|_| ()))
      .await?;
    *unpoison(self.shared.active_version.write()) = version_id.to_owned();
    Ok(())
  }

  pub async fn active_version(&self) -> Result<Version> {
    self.version(&self.active_version_id()).await
  }

  pub async fn version(&self, version_id: &str) -> Result<Version> {
    let id = version_id.to_owned();
    let version = self
      .conn
      .call(move |conn| versions::require_version(conn, &id))
      .await?;
    Ok(version)
  }

  pub async fn list_versions(&self) -> Result<Vec<Version>> {
    let all = self
      .conn
      .call(|conn| Ok(versions::list_versions(conn)?))
      .await?;
    Ok(all)
  }

  /// Inheritance ancestors of a version, nearest parent first.
  pub async fn resolve_inheritance(
    &self,
    version_id: &str,
  ) -> Result<Vec<String>> {
    let id = version_id.to_owned();
    let chain = self
      .conn
      .call(move |conn| {
        versions::require_version(conn, &id)?;
        Ok(versions::inheritance_chain(conn, &id)?)
      })
      .await?;
    Ok(chain)
  }

  // ─── Accounts ──────────────────────────────────────────────────────────────

  /// Accounts attributed as authors of subsequently committed tracked
  /// changes.
  pub fn set_active_accounts(&self, accounts: Vec<String>) {
    *unpoison(self.shared.active_accounts.write()) = accounts;
  }

  pub fn active_accounts(&self) -> Vec<String> {
    unpoison(self.shared.active_accounts.read()).clone()
  }

  /// Accounts recorded as authors of one change.
  pub async fn change_authors(&self, change_id: Uuid) -> Result<Vec<String>> {
    let authors = self
      .conn
      .call(move |conn| {
        let mut stmt = conn.prepare(
          "SELECT account_id FROM change_authors WHERE change_id = ?1
           ORDER BY account_id",
        )?;
        let rows = stmt
          .query_map(
            rusqlite::params![crate::encode::encode_uuid(change_id)],
            |row| row.get::<_, String>(0),
          )?
          .collect::<rusqlite::Result<Vec<_>>>()?;
        Ok(rows)
      })
      .await?;
    Ok(authors)
  }

  /// Change records for one entity triple, restricted to `change_ids`
  /// (typically the ids reported by a [`CommitOutcome`]).
  pub async fn changes_at(
    &self,
    entity_id: &str,
    schema_key: &str,
    file_id: &str,
    change_ids: Vec<Uuid>,
  ) -> Result<Vec<Change>> {
    let (entity_id, schema_key, file_id) =
      (entity_id.to_owned(), schema_key.to_owned(), file_id.to_owned());
    let changes = self
      .conn
      .call(move |conn| {
        Ok(store::changes_at(
          conn,
          &entity_id,
          &schema_key,
          &file_id,
          &change_ids,
        )?)
      })
      .await?;
    Ok(changes)
  }

  /// Snapshot payload by content address; `None` for an unknown id.
  pub async fn snapshot_content(
    &self,
    snapshot_id: &str,
  ) -> Result<Option<Value>> {
    let snapshot_id = snapshot_id.to_owned();
    let content = self
      .conn
      .call(move |conn| Ok(store::snapshot_content(conn, &snapshot_id)?))
      .await?;
    Ok(content)
  }

  // ─── Plugins ───────────────────────────────────────────────────────────────

  pub fn register_plugin(&self, plugin: Arc<dyn FilePlugin>) {
    unpoison(self.shared.plugins.write())
      .insert(plugin.key().to_owned(), plugin);
  }

  fn plugin(&self, plugin_key: &str) -> Result<Arc<dyn FilePlugin>> {
    unpoison(self.shared.plugins.read())
      .get(plugin_key)
      .cloned()
      .ok_or_else(|| {
        Error::Core(lix_core::Error::MissingPlugin {
          plugin_key: plugin_key.to_owned(),
        })
      })
  }

  /// Run a plugin's change detection over two file states and stage the
  /// detected entity changes. Returns how many were staged.
  pub async fn detect_file_changes(
    &self,
    plugin_key: &str,
    file_id: &str,
    before: Option<&[u8]>,
    after: &[u8],
  ) -> Result<usize> {
    let plugin = self.plugin(plugin_key)?;
    let detected = plugin.detect_changes(before, after)?;

    let mut staged = 0usize;
    for change in detected {
      match change.snapshot {
        Some(snapshot) => {
          let mut input = NewPendingChange::new(
            change.schema.key.clone(),
            change.entity_id,
            file_id,
            Some(snapshot),
          );
          input.plugin_key = Some(plugin_key.to_owned());
          self.stage_write(input, PendingOp::Update).await?;
        }
        None => {
          self
            .delete(&change.schema.key, &change.entity_id, file_id, None)
            .await?;
        }
      }
      staged += 1;
    }
    Ok(staged)
  }

  /// Materialize the committed state of one file back into bytes via its
  /// plugin's `applyChanges` capability.
  pub async fn apply_file_changes(
    &self,
    plugin_key: &str,
    file_id: &str,
    version_id: Option<String>,
  ) -> Result<Vec<u8>> {
    let plugin = self.plugin(plugin_key)?;
    let version_id = version_id.unwrap_or_else(|| self.active_version_id());
    let filter = StateFilter {
      file_id: Some(file_id.to_owned()),
      ..StateFilter::default()
    };
    let rows = self.state_all(&version_id, &filter).await?;

    let changes: Vec<FileChange> = rows
      .into_iter()
      .map(|row| FileChange {
        entity_id:        row.entity_id,
        schema_key:       row.schema_key,
        schema_version:   row.schema_version,
        snapshot_content: Some(row.snapshot_content),
      })
      .collect();
    Ok(plugin.apply_changes(&changes)?)
  }

  // ─── Diffs ─────────────────────────────────────────────────────────────────

  /// Merge-biased comparison: what applying `source` onto `target` would
  /// change.
  pub async fn diff_versions(
    &self,
    source_id: &str,
    target_id: &str,
    filter: &StateFilter,
  ) -> Result<Vec<VersionDiffEntry>> {
    let (source, target, filter) =
      (source_id.to_owned(), target_id.to_owned(), filter.clone());
    let shared = Arc::clone(&self.shared);
    let entries = self
      .conn
      .call(move |conn| {
        diff::diff_versions(conn, &shared.ancestry, &source, &target, &filter)
      })
      .await?;
    Ok(entries)
  }

  /// Symmetric leaf-state comparison between two commits.
  pub async fn diff_commits(
    &self,
    before_id: Uuid,
    after_id: Uuid,
    filter: &StateFilter,
    include_unchanged: bool,
  ) -> Result<Vec<CommitDiffEntry>> {
    let filter = filter.clone();
    let shared = Arc::clone(&self.shared);
    let entries = self
      .conn
      .call(move |conn| {
        diff::diff_commits(
          conn,
          &shared.ancestry,
          before_id,
          after_id,
          &filter,
          include_unchanged,
        )
      })
      .await?;
    Ok(entries)
  }

  // ─── Cache administration ──────────────────────────────────────────────────

  /// Re-derive cache rows for the given versions from the materializer.
  pub async fn populate_cache(
    &self,
    version_ids: Vec<String>,
    filter: &StateFilter,
  ) -> Result<usize> {
    let registry = self.registry();
    let filter = filter.clone();
    let shared = Arc::clone(&self.shared);
    let written = self
      .conn
      .call(move |conn| {
        cache::populate(conn, &registry, &shared.ancestry, &version_ids, &filter)
      })
      .await?;
    Ok(written)
  }

  /// Drop cache rows matching the filter; `None` hits every version.
  pub async fn invalidate_cache(
    &self,
    version_id: Option<String>,
    filter: &StateFilter,
  ) -> Result<usize> {
    let registry = self.registry();
    let filter = filter.clone();
    let removed = self
      .conn
      .call(move |conn| {
        Ok(cache::invalidate(conn, &registry, version_id.as_deref(), &filter)?)
      })
      .await?;
    Ok(removed)
  }

  // ─── Blob export / import ──────────────────────────────────────────────────

  /// Serialize the whole instance into a portable JSON blob.
  pub async fn export_blob(&self) -> Result<Vec<u8>> {
    let bytes = self.conn.call(|conn| blob::export_blob(conn)).await?;
    Ok(bytes)
  }

  /// Merge an exported blob into this instance and rebuild the cache.
  pub async fn import_blob(&self, bytes: Vec<u8>) -> Result<()> {
    let shared = Arc::clone(&self.shared);
    let registry = self
      .conn
      .call(move |conn| {
        let tx = conn.transaction().map_err(tokio_rusqlite::Error::from)?;
        let registry = blob::import_blob(&tx, &shared.ancestry, &bytes)?;
        tx.commit().map_err(tokio_rusqlite::Error::from)?;
        shared.ancestry.clear();
        Ok(registry)
      })
      .await?;
    *unpoison(self.shared.registry.write()) = Arc::new(registry);
    Ok(())
  }

  // ─── Reads ─────────────────────────────────────────────────────────────────

  async fn read_state_for(
    &self,
    version_id: String,
    filter: StateFilter,
    overlay_pending: bool,
  ) -> Result<Vec<StateRow>> {
    let registry = self.registry();
    let shared = Arc::clone(&self.shared);
    let rows = self
      .conn
      .call(move |conn| {
        let mut rows =
          cache::read_state(conn, &registry, &version_id, &filter)?;
        if overlay_pending {
          let buffer = unpoison(shared.buffer.lock());
          overlay(&mut rows, &buffer, &version_id, &filter);
        }
        Ok(rows)
      })
      .await?;
    Ok(rows)
  }

  async fn read_history(
    &self,
    root: Uuid,
    filter: StateFilter,
  ) -> Result<Vec<HistoryRow>> {
    let shared = Arc::clone(&self.shared);
    let rows = self
      .conn
      .call(move |conn| {
        if !materialize::commit_exists(conn, root)? {
          return Err(domain(lix_core::Error::CommitNotFound(root)));
        }
        let ancestors = shared.ancestry.get_or_walk(conn, root)?;
        let all = materialize::candidates(conn, &ancestors, &filter)?;

        let mut triples: Vec<(String, String, String)> = all
          .iter()
          .map(|c| (c.entity_id.clone(), c.schema_key.clone(), c.file_id.clone()))
          .collect();
        triples.sort();
        triples.dedup();

        let mut out = Vec::new();
        for (entity_id, schema_key, file_id) in triples {
          for state in materialize::history_at(
            conn,
            &shared.ancestry,
            root,
            &entity_id,
            &schema_key,
            &file_id,
          )? {
            out.push(HistoryRow {
              entity_id:        state.entity_id,
              schema_key:       state.schema_key,
              file_id:          state.file_id,
              plugin_key:       state.plugin_key,
              snapshot_content: state.snapshot_content,
              schema_version:   state.schema_version,
              change_id:        state.change_id,
              commit_id:        state.commit_id,
              root_commit_id:   root,
              depth:            state.depth,
              created_at:       state.created_at,
            });
          }
        }
        Ok(out)
      })
      .await?;
    Ok(rows)
  }
}

/// Overlay staged rows onto committed state: staged live rows replace (or
/// add) their committed counterpart, staged tombstones hide it.
fn overlay(
  rows: &mut Vec<StateRow>,
  buffer: &TxnBuffer,
  version_id: &str,
  filter: &StateFilter,
) {
  for pending in buffer.rows_for_version(version_id) {
    if !filter.matches(&pending.entity_id, &pending.schema_key, &pending.file_id)
    {
      continue;
    }
    rows.retain(|row| {
      row.entity_id != pending.entity_id
        || row.schema_key != pending.schema_key
        || row.file_id != pending.file_id
    });
    if let Some(content) = &pending.content {
      rows.push(StateRow {
        entity_id:                 pending.entity_id.clone(),
        schema_key:                pending.schema_key.clone(),
        file_id:                   pending.file_id.clone(),
        version_id:                version_id.to_owned(),
        plugin_key:                pending.plugin_key.clone(),
        snapshot_content:          content.clone(),
        schema_version:            pending.schema_version.clone(),
        created_at:                pending.staged_at,
        updated_at:                pending.staged_at,
        inherited_from_version_id: None,
        change_id:                 None,
        commit_id:                 None,
      });
    }
  }
}

impl StateReader for LixEngine {
  type Error = Error;

  fn state(
    &self,
    filter: &StateFilter,
  ) -> impl Future<Output = Result<Vec<StateRow>>> + Send + '_ {
    let filter = filter.clone();
    async move {
      self
        .read_state_for(self.active_version_id(), filter, true)
        .await
    }
  }

  fn state_all<'a>(
    &'a self,
    version_id: &'a str,
    filter: &'a StateFilter,
  ) -> impl Future<Output = Result<Vec<StateRow>>> + Send + 'a {
    let filter = filter.clone();
    async move {
      self
        .read_state_for(version_id.to_owned(), filter, false)
        .await
    }
  }

  fn state_history(
    &self,
    root_commit_id: Uuid,
    filter: &StateFilter,
  ) -> impl Future<Output = Result<Vec<HistoryRow>>> + Send + '_ {
    let filter = filter.clone();
    async move { self.read_history(root_commit_id, filter).await }
  }
}
