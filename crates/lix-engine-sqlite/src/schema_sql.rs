//! SQL schema for the lix SQLite engine.
//!
//! Executed once at connection startup. The change log tables (`snapshots`,
//! `changes`) are strictly append-only — no UPDATE or DELETE is ever issued
//! against them. Per-schema state-cache tables are generated separately by
//! the schema registry at registration time.

/// Full schema DDL; idempotent thanks to `CREATE TABLE IF NOT EXISTS`.
pub const SCHEMA: &str = "
PRAGMA journal_mode = WAL;
PRAGMA foreign_keys = ON;

-- Engine identity and misc key/value state (e.g. lix_id for sync).
CREATE TABLE IF NOT EXISTS meta (
    key   TEXT PRIMARY KEY,
    value TEXT NOT NULL
);

CREATE TABLE IF NOT EXISTS schemas (
    schema_key     TEXT NOT NULL,
    schema_version TEXT NOT NULL,
    definition     TEXT NOT NULL,   -- raw x-lix-* annotated JSON Schema
    registered_at  TEXT NOT NULL,
    PRIMARY KEY (schema_key, schema_version)
);

-- Content-addressed payloads; id is the SHA-256 hex of the canonical JSON.
CREATE TABLE IF NOT EXISTS snapshots (
    snapshot_id TEXT PRIMARY KEY,
    content     TEXT NOT NULL
);

-- The append-only change log. snapshot_id NULL marks a tombstone.
CREATE TABLE IF NOT EXISTS changes (
    change_id      TEXT PRIMARY KEY,
    entity_id      TEXT NOT NULL,
    schema_key     TEXT NOT NULL,
    schema_version TEXT NOT NULL,
    file_id        TEXT NOT NULL,
    plugin_key     TEXT NOT NULL,
    snapshot_id    TEXT REFERENCES snapshots(snapshot_id),
    created_at     TEXT NOT NULL    -- ISO 8601 UTC; engine-assigned
);

CREATE TABLE IF NOT EXISTS change_sets (
    change_set_id TEXT PRIMARY KEY,
    created_at    TEXT NOT NULL
);

CREATE TABLE IF NOT EXISTS change_set_elements (
    change_set_id TEXT NOT NULL REFERENCES change_sets(change_set_id),
    change_id     TEXT NOT NULL REFERENCES changes(change_id),
    entity_id     TEXT NOT NULL,
    schema_key    TEXT NOT NULL,
    file_id       TEXT NOT NULL,
    PRIMARY KEY (change_set_id, change_id)
);

CREATE TABLE IF NOT EXISTS commits (
    commit_id         TEXT PRIMARY KEY,
    change_set_id     TEXT NOT NULL REFERENCES change_sets(change_set_id),
    parent_commit_ids TEXT NOT NULL,  -- JSON array of commit ids
    created_at        TEXT NOT NULL
);

-- Adjacency derived from parent_commit_ids; must stay acyclic.
CREATE TABLE IF NOT EXISTS commit_edges (
    parent_id TEXT NOT NULL REFERENCES commits(commit_id),
    child_id  TEXT NOT NULL REFERENCES commits(commit_id),
    PRIMARY KEY (parent_id, child_id),
    CHECK  (parent_id != child_id)
);

CREATE TABLE IF NOT EXISTS commit_labels (
    commit_id  TEXT NOT NULL REFERENCES commits(commit_id),
    label      TEXT NOT NULL,
    created_at TEXT NOT NULL,
    PRIMARY KEY (commit_id, label)
);

CREATE TABLE IF NOT EXISTS versions (
    version_id                TEXT PRIMARY KEY,
    name                      TEXT NOT NULL UNIQUE,
    commit_id                 TEXT REFERENCES commits(commit_id),
    working_commit_id         TEXT REFERENCES commits(commit_id),
    inherits_from_version_id  TEXT REFERENCES versions(version_id),
    hidden                    INTEGER NOT NULL DEFAULT 0
);

CREATE TABLE IF NOT EXISTS change_authors (
    change_id  TEXT NOT NULL REFERENCES changes(change_id),
    account_id TEXT NOT NULL,
    PRIMARY KEY (change_id, account_id)
);

CREATE INDEX IF NOT EXISTS changes_entity_idx
    ON changes(entity_id, schema_key, file_id);
CREATE INDEX IF NOT EXISTS changes_created_idx  ON changes(created_at);
CREATE INDEX IF NOT EXISTS cse_change_set_idx
    ON change_set_elements(change_set_id);
CREATE INDEX IF NOT EXISTS cse_entity_idx
    ON change_set_elements(entity_id, schema_key, file_id);
CREATE INDEX IF NOT EXISTS commit_edges_child_idx ON commit_edges(child_id);
CREATE INDEX IF NOT EXISTS commit_labels_label_idx ON commit_labels(label);
";
