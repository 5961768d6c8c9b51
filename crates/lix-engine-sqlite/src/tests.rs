//! Integration tests for `LixEngine` against an in-memory database.

use std::sync::Arc;

use lix_core::{
  change::NewPendingChange,
  diff::{CommitDiffStatus, VersionDiffStatus},
  plugin::{DetectedChange, FilePlugin},
  reader::StateReader,
  schema::SchemaDefinition,
  state::StateFilter,
  version::NewVersion,
};
use serde_json::{Value, json};
use uuid::Uuid;

use crate::{Error, LixEngine, engine::ViewScope};

async fn engine() -> LixEngine {
  LixEngine::open_in_memory().await.expect("in-memory engine")
}

fn doc_schema() -> Value {
  json!({
    "type": "object",
    "x-lix-key": "doc",
    "x-lix-version": "1.0",
    "x-lix-primary-key": ["id"],
    "properties": {
      "id": { "type": "string" },
      "title": { "type": "string" }
    },
    "additionalProperties": false
  })
}

fn tag_schema() -> Value {
  json!({
    "type": "object",
    "x-lix-key": "tag",
    "x-lix-version": "1.0",
    "x-lix-primary-key": ["id"],
    "x-lix-unique": [["label"]],
    "properties": {
      "id": { "type": "string" },
      "label": { "type": "string" }
    },
    "additionalProperties": false
  })
}

fn comment_schema() -> Value {
  json!({
    "type": "object",
    "x-lix-key": "comment",
    "x-lix-version": "1.0",
    "x-lix-primary-key": ["id"],
    "x-lix-foreign-keys": [{
      "properties": ["doc_id"],
      "references": { "schemaKey": "doc", "properties": ["id"] }
    }],
    "properties": {
      "id": { "type": "string" },
      "doc_id": { "type": "string" },
      "body": { "type": "string" }
    },
    "additionalProperties": false
  })
}

fn doc(entity: &str, title: &str) -> NewPendingChange {
  NewPendingChange::new(
    "doc",
    entity,
    "f1",
    Some(json!({ "id": entity, "title": title })),
  )
}

// ─── Staging and commit ──────────────────────────────────────────────────────

#[tokio::test]
async fn staged_rows_are_visible_before_commit_without_change_ids() {
  let e = engine().await;
  e.register_schema(doc_schema()).await.unwrap();
  e.insert(doc("d1", "hello")).await.unwrap();

  let rows = e.state(&StateFilter::for_schema("doc")).await.unwrap();
  assert_eq!(rows.len(), 1);
  assert_eq!(rows[0].snapshot_content["title"], "hello");
  assert!(rows[0].change_id.is_none());
  assert!(rows[0].commit_id.is_none());

  // Committed view of the same version does not include staged rows.
  let version = e.active_version().await.unwrap();
  let committed = e
    .state_all(&version.id, &StateFilter::for_schema("doc"))
    .await
    .unwrap();
  assert!(committed.is_empty());
}

#[tokio::test]
async fn commit_assigns_change_and_commit_ids() {
  let e = engine().await;
  e.register_schema(doc_schema()).await.unwrap();
  e.insert(doc("d1", "hello")).await.unwrap();

  let outcome = e.commit().await.unwrap();
  assert_eq!(outcome.commits.len(), 1);
  assert_eq!(outcome.changes.len(), 1);
  // Domain row plus its change-set-element row.
  assert_eq!(outcome.state_delta.len(), 2);

  let rows = e.state(&StateFilter::for_schema("doc")).await.unwrap();
  assert_eq!(rows.len(), 1);
  assert_eq!(rows[0].change_id, Some(outcome.changes[0].id));
  assert_eq!(rows[0].commit_id, Some(outcome.commits[0].id));

  let version = e.active_version().await.unwrap();
  assert_eq!(version.commit_id, Some(outcome.commits[0].id));
}

#[tokio::test]
async fn committed_changes_are_readable_with_their_snapshots() {
  let e = engine().await;
  e.register_schema(doc_schema()).await.unwrap();
  e.insert(doc("d1", "hello")).await.unwrap();

  let outcome = e.commit().await.unwrap();
  let change = outcome
    .changes
    .iter()
    .find(|c| c.schema_key == "doc")
    .expect("domain change");

  let read = e
    .changes_at("d1", "doc", "f1", vec![change.id])
    .await
    .unwrap();
  assert_eq!(read.len(), 1);
  assert_eq!(read[0].id, change.id);

  let snapshot_id = read[0].snapshot_id.clone().expect("live change");
  let content = e.snapshot_content(&snapshot_id).await.unwrap();
  assert_eq!(content, Some(json!({ "id": "d1", "title": "hello" })));
  assert_eq!(e.snapshot_content("missing").await.unwrap(), None);
}

#[tokio::test]
async fn commit_with_nothing_staged_is_a_noop() {
  let e = engine().await;
  let outcome = e.commit().await.unwrap();
  assert!(outcome.commits.is_empty());
  assert!(e.active_version().await.unwrap().commit_id.is_none());
}

#[tokio::test]
async fn rollback_discards_staged_rows() {
  let e = engine().await;
  e.register_schema(doc_schema()).await.unwrap();
  e.insert(doc("d1", "hello")).await.unwrap();
  assert!(e.has_pending());

  e.rollback();
  assert!(!e.has_pending());
  let rows = e.state(&StateFilter::for_schema("doc")).await.unwrap();
  assert!(rows.is_empty());

  // Nothing reached the log either.
  let outcome = e.commit().await.unwrap();
  assert!(outcome.commits.is_empty());
}

#[tokio::test]
async fn later_staged_write_supersedes_earlier_one() {
  let e = engine().await;
  e.register_schema(doc_schema()).await.unwrap();
  e.insert(doc("d1", "first")).await.unwrap();
  e.update(doc("d1", "second")).await.unwrap();

  let outcome = e.commit().await.unwrap();
  assert_eq!(outcome.changes.len(), 1);

  let rows = e.state(&StateFilter::for_schema("doc")).await.unwrap();
  assert_eq!(rows[0].snapshot_content["title"], "second");
}

#[tokio::test]
async fn repeated_content_reuses_the_snapshot() {
  let e = engine().await;
  e.register_schema(doc_schema()).await.unwrap();

  e.insert(doc("d1", "same")).await.unwrap();
  let first = e.commit().await.unwrap();
  e.update(doc("d1", "other")).await.unwrap();
  e.commit().await.unwrap();
  e.update(doc("d1", "same")).await.unwrap();
  let third = e.commit().await.unwrap();

  assert_eq!(
    first.changes[0].snapshot_id,
    third.changes[0].snapshot_id,
    "identical content must share one content address"
  );
  assert_ne!(first.changes[0].id, third.changes[0].id);
}

// ─── Tombstones ──────────────────────────────────────────────────────────────

#[tokio::test]
async fn deletion_excludes_the_entity_and_diffs_as_removed() {
  let e = engine().await;
  e.register_schema(doc_schema()).await.unwrap();

  e.insert(doc("d1", "hello")).await.unwrap();
  let created = e.commit().await.unwrap();
  e.delete("doc", "d1", "f1", None).await.unwrap();
  let deleted = e.commit().await.unwrap();

  let rows = e.state(&StateFilter::for_schema("doc")).await.unwrap();
  assert!(rows.is_empty(), "tombstoned entity must not be visible");
  assert!(deleted.changes[0].is_tombstone());

  let entries = e
    .diff_commits(
      created.commits[0].id,
      deleted.commits[0].id,
      &StateFilter::default(),
      false,
    )
    .await
    .unwrap();
  let doc_entry = entries
    .iter()
    .find(|entry| entry.schema_key == "doc")
    .expect("doc entity in diff");
  assert_eq!(doc_entry.status, CommitDiffStatus::Removed);
  assert!(doc_entry.after.is_none());
}

#[tokio::test]
async fn staged_tombstone_hides_committed_state_until_rollback() {
  let e = engine().await;
  e.register_schema(doc_schema()).await.unwrap();
  e.insert(doc("d1", "hello")).await.unwrap();
  e.commit().await.unwrap();

  e.delete("doc", "d1", "f1", None).await.unwrap();
  let rows = e.state(&StateFilter::for_schema("doc")).await.unwrap();
  assert!(rows.is_empty());

  e.rollback();
  let rows = e.state(&StateFilter::for_schema("doc")).await.unwrap();
  assert_eq!(rows.len(), 1);
}

// ─── Constraints ─────────────────────────────────────────────────────────────

#[tokio::test]
async fn duplicate_primary_key_is_rejected() {
  let e = engine().await;
  e.register_schema(doc_schema()).await.unwrap();
  e.insert(doc("d1", "hello")).await.unwrap();
  e.commit().await.unwrap();

  let err = e
    .insert(NewPendingChange::new(
      "doc",
      "other-entity",
      "f1",
      Some(json!({ "id": "d1", "title": "clash" })),
    ))
    .await
    .unwrap_err();
  assert!(matches!(
    err,
    Error::Core(lix_core::Error::PrimaryKeyViolation { .. })
  ));
}

#[tokio::test]
async fn insert_over_a_live_entity_is_rejected_where_update_overwrites() {
  let e = engine().await;
  e.register_schema(doc_schema()).await.unwrap();
  e.insert(doc("d1", "hello")).await.unwrap();
  e.commit().await.unwrap();

  let err = e.insert(doc("d1", "again")).await.unwrap_err();
  assert!(matches!(
    err,
    Error::Core(lix_core::Error::PrimaryKeyViolation { .. })
  ));
  e.update(doc("d1", "again")).await.unwrap();
  e.rollback();

  // A staged tombstone frees the key for a fresh insert.
  e.delete("doc", "d1", "f1", None).await.unwrap();
  e.insert(doc("d1", "rebuilt")).await.unwrap();
  e.commit().await.unwrap();

  let rows = e.state(&StateFilter::for_schema("doc")).await.unwrap();
  assert_eq!(rows.len(), 1);
  assert_eq!(rows[0].snapshot_content["title"], "rebuilt");
}

#[tokio::test]
async fn unique_group_violation_is_rejected_across_staged_and_committed() {
  let e = engine().await;
  e.register_schema(tag_schema()).await.unwrap();
  e.insert(NewPendingChange::new(
    "tag",
    "t1",
    "f1",
    Some(json!({ "id": "t1", "label": "urgent" })),
  ))
  .await
  .unwrap();

  // Staged rows participate in uniqueness before they are committed.
  let err = e
    .insert(NewPendingChange::new(
      "tag",
      "t2",
      "f1",
      Some(json!({ "id": "t2", "label": "urgent" })),
    ))
    .await
    .unwrap_err();
  assert!(matches!(
    err,
    Error::Core(lix_core::Error::UniqueViolation { .. })
  ));
}

#[tokio::test]
async fn foreign_key_must_resolve_to_a_live_row() {
  let e = engine().await;
  e.register_schema(doc_schema()).await.unwrap();
  e.register_schema(comment_schema()).await.unwrap();

  let err = e
    .insert(NewPendingChange::new(
      "comment",
      "c1",
      "f1",
      Some(json!({ "id": "c1", "doc_id": "missing", "body": "hi" })),
    ))
    .await
    .unwrap_err();
  assert!(matches!(
    err,
    Error::Core(lix_core::Error::ForeignKeyViolation { .. })
  ));

  // A staged (not yet committed) referent satisfies the constraint.
  e.insert(doc("d1", "hello")).await.unwrap();
  e.insert(NewPendingChange::new(
    "comment",
    "c1",
    "f1",
    Some(json!({ "id": "c1", "doc_id": "d1", "body": "hi" })),
  ))
  .await
  .unwrap();
  e.commit().await.unwrap();
}

#[tokio::test]
async fn schema_reregistration_with_different_content_is_rejected() {
  let e = engine().await;
  e.register_schema(doc_schema()).await.unwrap();
  e.register_schema(doc_schema()).await.unwrap();

  let mut changed = doc_schema();
  changed["properties"]["extra"] = json!({ "type": "string" });
  let err = e.register_schema(changed).await.unwrap_err();
  assert!(matches!(
    err,
    Error::Core(lix_core::Error::InvalidSchema { .. })
  ));
}

#[tokio::test]
async fn registry_generation_bumps_with_each_registration() {
  let e = engine().await;
  let initial = e.schema_generation();
  e.register_schema(doc_schema()).await.unwrap();
  let after_doc = e.schema_generation();
  assert!(after_doc > initial);
  e.register_schema(tag_schema()).await.unwrap();
  assert!(e.schema_generation() > after_doc);
}

// ─── Versions and inheritance ────────────────────────────────────────────────

#[tokio::test]
async fn child_version_reads_fall_back_to_the_parent() {
  let e = engine().await;
  e.register_schema(doc_schema()).await.unwrap();
  e.insert(doc("d1", "from-main")).await.unwrap();
  e.commit().await.unwrap();

  let main = e.active_version().await.unwrap();
  let child = e
    .create_version(NewVersion {
      name: "feature".into(),
      inherits_from: Some(main.id.clone()),
      ..NewVersion::default()
    })
    .await
    .unwrap();

  let rows = e
    .state_all(&child.id, &StateFilter::for_schema("doc"))
    .await
    .unwrap();
  assert_eq!(rows.len(), 1);
  assert_eq!(rows[0].inherited_from_version_id, Some(main.id.clone()));

  // The child's own write shadows the parent without touching it.
  e.switch_version(&child.id).await.unwrap();
  e.update(doc("d1", "from-child")).await.unwrap();
  e.commit().await.unwrap();

  let child_rows = e
    .state_all(&child.id, &StateFilter::for_schema("doc"))
    .await
    .unwrap();
  assert_eq!(child_rows[0].snapshot_content["title"], "from-child");
  assert!(child_rows[0].inherited_from_version_id.is_none());

  let main_rows = e
    .state_all(&main.id, &StateFilter::for_schema("doc"))
    .await
    .unwrap();
  assert_eq!(main_rows[0].snapshot_content["title"], "from-main");
}

#[tokio::test]
async fn child_tombstone_masks_the_inherited_row() {
  let e = engine().await;
  e.register_schema(doc_schema()).await.unwrap();
  e.insert(doc("d1", "from-main")).await.unwrap();
  e.commit().await.unwrap();

  let main = e.active_version().await.unwrap();
  let child = e
    .create_version(NewVersion {
      name: "feature".into(),
      inherits_from: Some(main.id.clone()),
      ..NewVersion::default()
    })
    .await
    .unwrap();

  e.switch_version(&child.id).await.unwrap();
  e.delete("doc", "d1", "f1", None).await.unwrap();
  e.commit().await.unwrap();

  let child_rows = e
    .state_all(&child.id, &StateFilter::for_schema("doc"))
    .await
    .unwrap();
  assert!(child_rows.is_empty(), "child deletion must mask the parent row");

  let main_rows = e
    .state_all(&main.id, &StateFilter::for_schema("doc"))
    .await
    .unwrap();
  assert_eq!(main_rows.len(), 1, "parent version must be unaffected");
}

#[tokio::test]
async fn resolve_inheritance_lists_ancestors_nearest_first() {
  let e = engine().await;
  let main = e.active_version().await.unwrap();
  let child = e
    .create_version(NewVersion {
      name: "child".into(),
      inherits_from: Some(main.id.clone()),
      ..NewVersion::default()
    })
    .await
    .unwrap();

  let chain = e.resolve_inheritance(&child.id).await.unwrap();
  assert_eq!(chain, vec![main.id.clone(), "global".to_owned()]);
}

#[tokio::test]
async fn commits_land_on_the_active_version_only() {
  let e = engine().await;
  e.register_schema(doc_schema()).await.unwrap();
  let main = e.active_version().await.unwrap();
  let other = e
    .create_version(NewVersion::named("scratch"))
    .await
    .unwrap();

  e.switch_version(&other.id).await.unwrap();
  e.insert(doc("d1", "scratch-only")).await.unwrap();
  e.commit().await.unwrap();

  assert!(e.version(&main.id).await.unwrap().commit_id.is_none());
  assert!(e.version(&other.id).await.unwrap().commit_id.is_some());
}

// ─── Checkpoints ─────────────────────────────────────────────────────────────

#[tokio::test]
async fn checkpoints_form_a_newest_first_lineage() {
  let e = engine().await;
  e.register_schema(doc_schema()).await.unwrap();

  e.insert(doc("d1", "one")).await.unwrap();
  let first = e.create_checkpoint().await.unwrap();
  e.update(doc("d1", "two")).await.unwrap();
  let second = e.create_checkpoint().await.unwrap();

  assert_ne!(first.id, second.id);
  let checkpoints = e.checkpoints().await.unwrap();
  assert_eq!(checkpoints.len(), 2);
  assert_eq!(checkpoints[0].id, second.id);
  assert_eq!(checkpoints[1].id, first.id);
}

#[tokio::test]
async fn checkpoint_without_any_commit_is_an_error() {
  let e = engine().await;
  let err = e.create_checkpoint().await.unwrap_err();
  assert!(matches!(err, Error::Core(lix_core::Error::InvalidGraph(_))));
}

#[tokio::test]
async fn checkpoint_diff_reports_only_the_touched_entities() {
  let e = engine().await;
  e.register_schema(doc_schema()).await.unwrap();

  // Two entities at the first checkpoint, one touched by the second.
  e.insert(doc("name", "Ada")).await.unwrap();
  e.insert(doc("age", "36")).await.unwrap();
  let first = e.create_checkpoint().await.unwrap();

  e.update(doc("name", "Grace")).await.unwrap();
  let second = e.create_checkpoint().await.unwrap();

  let entries = e
    .diff_commits(first.id, second.id, &StateFilter::default(), false)
    .await
    .unwrap();
  assert_eq!(entries.len(), 1);
  assert_eq!(entries[0].entity_id, "name");
  assert_eq!(entries[0].status, CommitDiffStatus::Modified);
  assert_eq!(entries[0].after.as_ref().unwrap()["title"], "Grace");
}

// ─── Version diff ────────────────────────────────────────────────────────────

#[tokio::test]
async fn diff_versions_is_merge_biased() {
  let e = engine().await;
  e.register_schema(doc_schema()).await.unwrap();

  e.insert(doc("e1", "original")).await.unwrap();
  e.insert(doc("e2", "doomed")).await.unwrap();
  let base = e.commit().await.unwrap();
  let main = e.active_version().await.unwrap();

  let feature = e
    .create_version(NewVersion {
      name: "feature".into(),
      from_commit_id: Some(base.commits[0].id),
      ..NewVersion::default()
    })
    .await
    .unwrap();

  e.switch_version(&feature.id).await.unwrap();
  e.update(doc("e1", "reworked")).await.unwrap();
  e.insert(doc("e3", "brand-new")).await.unwrap();
  e.delete("doc", "e2", "f1", None).await.unwrap();
  e.commit().await.unwrap();

  // The target moves on independently; the source never saw e4.
  e.switch_version(&main.id).await.unwrap();
  e.insert(doc("e4", "target-only")).await.unwrap();
  e.commit().await.unwrap();

  let entries = e
    .diff_versions(&feature.id, &main.id, &StateFilter::for_schema("doc"))
    .await
    .unwrap();
  let status_of = |entity: &str| {
    entries
      .iter()
      .find(|entry| entry.entity_id == entity)
      .unwrap_or_else(|| panic!("entity {entity} missing from diff"))
      .status
  };

  assert_eq!(status_of("e1"), VersionDiffStatus::Updated);
  assert_eq!(status_of("e2"), VersionDiffStatus::Deleted);
  assert_eq!(status_of("e3"), VersionDiffStatus::Created);
  assert_eq!(status_of("e4"), VersionDiffStatus::Unchanged);
}

// ─── History ─────────────────────────────────────────────────────────────────

#[tokio::test]
async fn history_orders_states_nearest_first_with_renumbered_depths() {
  let e = engine().await;
  e.register_schema(doc_schema()).await.unwrap();

  for title in ["one", "two", "three"] {
    e.update(doc("d1", title)).await.unwrap();
    e.commit().await.unwrap();
  }
  let tip = e.active_version().await.unwrap().commit_id.unwrap();

  let rows = e
    .state_history(tip, &StateFilter::for_schema("doc"))
    .await
    .unwrap();
  assert_eq!(rows.len(), 3);
  let titles: Vec<&str> = rows
    .iter()
    .map(|row| row.snapshot_content.as_ref().unwrap()["title"].as_str().unwrap())
    .collect();
  assert_eq!(titles, vec!["three", "two", "one"]);
  let depths: Vec<usize> = rows.iter().map(|row| row.depth).collect();
  assert_eq!(depths, vec![0, 1, 2]);
  assert!(rows.iter().all(|row| row.root_commit_id == tip));
}

#[tokio::test]
async fn history_of_an_unknown_commit_is_an_error() {
  let e = engine().await;
  let err = e
    .state_history(Uuid::new_v4(), &StateFilter::default())
    .await
    .unwrap_err();
  assert!(matches!(
    err,
    Error::Core(lix_core::Error::CommitNotFound(_))
  ));
}

// ─── Views ───────────────────────────────────────────────────────────────────

#[tokio::test]
async fn view_names_resolve_to_schema_and_scope() {
  let e = engine().await;
  e.register_schema(doc_schema()).await.unwrap();

  assert_eq!(e.resolve_view("doc").unwrap(), ("doc".into(), ViewScope::Base));
  assert_eq!(
    e.resolve_view("doc_all").unwrap(),
    ("doc".into(), ViewScope::All)
  );
  assert_eq!(
    e.resolve_view("doc_history").unwrap(),
    ("doc".into(), ViewScope::History)
  );
  assert!(matches!(
    e.resolve_view("nope").unwrap_err(),
    Error::Core(lix_core::Error::SchemaNotFound(_))
  ));
}

#[tokio::test]
async fn history_views_reject_mutations() {
  let e = engine().await;
  e.register_schema(doc_schema()).await.unwrap();

  let err = e
    .write_view(
      "doc_history",
      "d1",
      "f1",
      None,
      Some(json!({ "id": "d1", "title": "nope" })),
    )
    .await
    .unwrap_err();
  assert!(matches!(
    err,
    Error::Core(lix_core::Error::ReadOnlyView { .. })
  ));
}

// ─── Authors ─────────────────────────────────────────────────────────────────

#[tokio::test]
async fn tracked_changes_are_attributed_to_active_accounts() {
  let e = engine().await;
  e.register_schema(doc_schema()).await.unwrap();
  e.set_active_accounts(vec!["acct-1".into(), "acct-2".into()]);

  e.insert(doc("d1", "tracked")).await.unwrap();
  let mut untracked = doc("d2", "untracked");
  untracked.untracked = true;
  e.insert(untracked).await.unwrap();
  let outcome = e.commit().await.unwrap();

  let tracked_change =
    outcome.changes.iter().find(|c| c.entity_id == "d1").unwrap();
  let untracked_change =
    outcome.changes.iter().find(|c| c.entity_id == "d2").unwrap();

  let authors = e.change_authors(tracked_change.id).await.unwrap();
  assert_eq!(authors, vec!["acct-1".to_owned(), "acct-2".to_owned()]);
  assert!(e.change_authors(untracked_change.id).await.unwrap().is_empty());
}

// ─── Plugins ─────────────────────────────────────────────────────────────────

/// Test plugin: files are JSON objects, one entity per top-level key.
struct JsonPlugin;

impl FilePlugin for JsonPlugin {
  fn key(&self) -> &str {
    "json_test"
  }

  fn detect_changes(
    &self,
    before: Option<&[u8]>,
    after: &[u8],
  ) -> lix_core::Result<Vec<DetectedChange>> {
    let schema = SchemaDefinition::from_value(doc_schema())?;
    let before: Value = before
      .map(serde_json::from_slice)
      .transpose()?
      .unwrap_or_else(|| json!({}));
    let after: Value = serde_json::from_slice(after)?;

    let mut detected = Vec::new();
    if let (Some(before), Some(after)) = (before.as_object(), after.as_object())
    {
      for (key, value) in after {
        if before.get(key) != Some(value) {
          detected.push(DetectedChange {
            entity_id: key.clone(),
            schema:    schema.clone(),
            snapshot:  Some(json!({ "id": key, "title": value })),
          });
        }
      }
      for key in before.keys() {
        if !after.contains_key(key) {
          detected.push(DetectedChange {
            entity_id: key.clone(),
            schema:    schema.clone(),
            snapshot:  None,
          });
        }
      }
    }
    Ok(detected)
  }
}

#[tokio::test]
async fn plugin_detection_stages_entity_changes() {
  let e = engine().await;
  e.register_schema(doc_schema()).await.unwrap();
  e.register_plugin(Arc::new(JsonPlugin));

  let staged = e
    .detect_file_changes(
      "json_test",
      "file.json",
      None,
      br#"{ "a": "1", "b": "2" }"#,
    )
    .await
    .unwrap();
  assert_eq!(staged, 2);
  let outcome = e.commit().await.unwrap();
  assert_eq!(outcome.changes.len(), 2);
  assert!(outcome.changes.iter().all(|c| c.plugin_key == "json_test"));

  // A second detection against the previous state stages one update and one
  // deletion.
  let staged = e
    .detect_file_changes(
      "json_test",
      "file.json",
      Some(br#"{ "a": "1", "b": "2" }"#.as_slice()),
      br#"{ "a": "changed" }"#,
    )
    .await
    .unwrap();
  assert_eq!(staged, 2);
  e.commit().await.unwrap();

  let rows = e.state(&StateFilter::for_schema("doc")).await.unwrap();
  assert_eq!(rows.len(), 1);
  assert_eq!(rows[0].entity_id, "a");
}

#[tokio::test]
async fn unknown_plugin_and_missing_capability_are_reported() {
  let e = engine().await;
  e.register_schema(doc_schema()).await.unwrap();
  e.register_plugin(Arc::new(JsonPlugin));

  let err = e
    .detect_file_changes("nope", "file.json", None, b"{}")
    .await
    .unwrap_err();
  assert!(matches!(
    err,
    Error::Core(lix_core::Error::MissingPlugin { .. })
  ));

  // JsonPlugin has no applyChanges implementation.
  let err = e
    .apply_file_changes("json_test", "file.json", None)
    .await
    .unwrap_err();
  assert!(matches!(
    err,
    Error::Core(lix_core::Error::PluginCapabilityMissing { .. })
  ));
}

// ─── Cache administration ────────────────────────────────────────────────────

#[tokio::test]
async fn cache_rebuild_agrees_with_the_materializer() {
  let e = engine().await;
  e.register_schema(doc_schema()).await.unwrap();
  e.insert(doc("d1", "one")).await.unwrap();
  e.insert(doc("d2", "two")).await.unwrap();
  e.commit().await.unwrap();
  let version = e.active_version().await.unwrap();

  let before = e
    .state_all(&version.id, &StateFilter::for_schema("doc"))
    .await
    .unwrap();

  // Blow the cache away and re-derive it from the log.
  e.invalidate_cache(None, &StateFilter::default()).await.unwrap();
  let empty = e
    .state_all(&version.id, &StateFilter::for_schema("doc"))
    .await
    .unwrap();
  assert!(empty.is_empty());

  e.populate_cache(vec![version.id.clone()], &StateFilter::default())
    .await
    .unwrap();
  let after = e
    .state_all(&version.id, &StateFilter::for_schema("doc"))
    .await
    .unwrap();
  assert_eq!(before, after);
}

// ─── Export / import ─────────────────────────────────────────────────────────

#[tokio::test]
async fn blob_roundtrip_carries_history_and_state() {
  let a = engine().await;
  a.register_schema(doc_schema()).await.unwrap();
  a.insert(doc("d1", "one")).await.unwrap();
  a.commit().await.unwrap();
  a.update(doc("d1", "two")).await.unwrap();
  a.delete("doc", "d1", "f1", None).await.unwrap();
  a.insert(doc("d2", "kept")).await.unwrap();
  a.commit().await.unwrap();
  let a_main = a.active_version().await.unwrap();

  let bytes = a.export_blob().await.unwrap();

  let b = engine().await;
  b.import_blob(bytes).await.unwrap();

  let rows = b
    .state_all(&a_main.id, &StateFilter::for_schema("doc"))
    .await
    .unwrap();
  assert_eq!(rows.len(), 1);
  assert_eq!(rows[0].entity_id, "d2");

  // Full history travelled too, not just the leaves.
  let tip = b.version(&a_main.id).await.unwrap().commit_id.unwrap();
  let history = b
    .state_history(tip, &StateFilter::for_schema("doc"))
    .await
    .unwrap();
  assert!(history.len() >= 3);

  // Instance identity stays local.
  assert_ne!(a.lix_id(), b.lix_id());
}

#[tokio::test]
async fn malformed_blob_is_rejected() {
  let e = engine().await;
  let err = e.import_blob(b"not json".to_vec()).await.unwrap_err();
  assert!(matches!(err, Error::Database(_) | Error::MalformedBlob(_)));
}

// ─── Graph invariants (connection-level) ─────────────────────────────────────

mod graph_invariants {
  use chrono::Utc;
  use lix_core::commit::Commit;
  use uuid::Uuid;

  use crate::{encode::encode_uuid, graph, schema_sql::SCHEMA, versions};

  fn raw_conn() -> rusqlite::Connection {
    let conn = rusqlite::Connection::open_in_memory().expect("open");
    conn.execute_batch(SCHEMA).expect("schema");
    conn
  }

  fn seed_commit(conn: &rusqlite::Connection) -> Uuid {
    let change_set_id = Uuid::new_v4();
    conn
      .execute(
        "INSERT INTO change_sets (change_set_id, created_at) VALUES (?1, ?2)",
        rusqlite::params![
          encode_uuid(change_set_id),
          Utc::now().to_rfc3339()
        ],
      )
      .expect("change set");
    let commit = Commit {
      id: Uuid::new_v4(),
      change_set_id,
      parent_commit_ids: Vec::new(),
      created_at: Utc::now(),
    };
    graph::insert_commit(conn, &commit).expect("commit");
    commit.id
  }

  fn is_invalid_graph(err: &tokio_rusqlite::Error) -> bool {
    matches!(
      err,
      tokio_rusqlite::Error::Other(boxed)
        if matches!(
          boxed.downcast_ref::<lix_core::Error>(),
          Some(lix_core::Error::InvalidGraph(_))
        )
    )
  }

  #[test]
  fn self_edges_are_rejected() {
    let conn = raw_conn();
    let a = seed_commit(&conn);
    let err = graph::insert_commit_edge(&conn, a, a).unwrap_err();
    assert!(is_invalid_graph(&err));
  }

  #[test]
  fn duplicate_edges_are_rejected() {
    let conn = raw_conn();
    let a = seed_commit(&conn);
    let b = seed_commit(&conn);
    graph::insert_commit_edge(&conn, a, b).unwrap();
    let err = graph::insert_commit_edge(&conn, a, b).unwrap_err();
    assert!(is_invalid_graph(&err));
  }

  #[test]
  fn cycle_closing_edges_are_rejected() {
    let conn = raw_conn();
    let a = seed_commit(&conn);
    let b = seed_commit(&conn);
    let c = seed_commit(&conn);
    graph::insert_commit_edge(&conn, a, b).unwrap();
    graph::insert_commit_edge(&conn, b, c).unwrap();
    let err = graph::insert_commit_edge(&conn, c, a).unwrap_err();
    assert!(is_invalid_graph(&err));
  }

  #[test]
  fn inheritance_cycles_are_rejected() {
    let conn = raw_conn();
    conn
      .execute_batch(
        "INSERT INTO versions (version_id, name) VALUES ('a', 'a');
         INSERT INTO versions (version_id, name) VALUES ('b', 'b');
         UPDATE versions SET inherits_from_version_id = 'a' WHERE version_id = 'b';",
      )
      .expect("seed versions");

    let err = versions::check_inheritance_acyclic(&conn, "a", "b").unwrap_err();
    assert!(is_invalid_graph(&err));

    let err = versions::check_inheritance_acyclic(&conn, "a", "a").unwrap_err();
    assert!(is_invalid_graph(&err));
  }
}
