//! SQL migration definitions for the webindex database.
//!
//! Migrations are applied in order on database open. Each migration has a
//! version number and a batch of SQL statements.

/// A database migration with a version and SQL statements.
pub(crate) struct Migration {
    pub version: u32,
    pub description: &'static str,
    pub sql: &'static str,
}

/// All migrations, in ascending version order.
pub(crate) fn all_migrations() -> Vec<Migration> {
    vec![Migration {
        version: 1,
        description: "Initial schema: indexed, indexed_content, chunks, tasks",
        sql: r#"
-- Schema version tracking
CREATE TABLE IF NOT EXISTS schema_migrations (
    version   INTEGER PRIMARY KEY,
    applied_at TEXT NOT NULL DEFAULT (datetime('now'))
);

-- One row per (organization, normalized url)
CREATE TABLE IF NOT EXISTS indexed (
    id                  TEXT PRIMARY KEY,
    org_id              TEXT NOT NULL,
    url                 TEXT NOT NULL,
    normalized_url      TEXT NOT NULL,
    do_crawl            INTEGER NOT NULL DEFAULT 0,
    is_sitemap          INTEGER NOT NULL DEFAULT 0,
    found_from_index_id TEXT,
    depth               INTEGER NOT NULL DEFAULT 0,
    scrape_options      TEXT,
    status              TEXT NOT NULL DEFAULT 'PENDING',
    error               TEXT,
    skip                INTEGER NOT NULL DEFAULT 0,
    skip_reason         TEXT,
    canonical_url       TEXT,
    hash                TEXT,
    title               TEXT,
    description         TEXT,
    truncated           INTEGER NOT NULL DEFAULT 0,
    created_at          TEXT NOT NULL,
    updated_at          TEXT NOT NULL,
    indexed_at          TEXT,
    claimed_at          TEXT,
    UNIQUE(org_id, normalized_url)
);

CREATE UNIQUE INDEX IF NOT EXISTS idx_indexed_org_hash
    ON indexed(org_id, hash) WHERE hash IS NOT NULL;
CREATE INDEX IF NOT EXISTS idx_indexed_claim ON indexed(org_id, status, created_at);
CREATE INDEX IF NOT EXISTS idx_indexed_found_from ON indexed(found_from_index_id);

-- Normalized content, 1:1 with indexed
CREATE TABLE IF NOT EXISTS indexed_content (
    index_id   TEXT PRIMARY KEY REFERENCES indexed(id) ON DELETE CASCADE,
    content    TEXT NOT NULL,
    updated_at TEXT NOT NULL
);

-- Embedded chunks owned by an indexed item
CREATE TABLE IF NOT EXISTS chunks (
    id          TEXT PRIMARY KEY,
    index_id    TEXT NOT NULL REFERENCES indexed(id) ON DELETE CASCADE,
    org_id      TEXT NOT NULL,
    chunk_index INTEGER NOT NULL,
    text        TEXT NOT NULL,
    embedding   TEXT NOT NULL,
    model       TEXT NOT NULL,
    created_at  TEXT NOT NULL
);

CREATE INDEX IF NOT EXISTS idx_chunks_index_id ON chunks(index_id);

-- Dispatch task queue
CREATE TABLE IF NOT EXISTS tasks (
    id         TEXT PRIMARY KEY,
    org_id     TEXT NOT NULL,
    kind       TEXT NOT NULL,
    payload    TEXT NOT NULL,
    status     TEXT NOT NULL DEFAULT 'pending',
    attempts   INTEGER NOT NULL DEFAULT 0,
    run_after  TEXT NOT NULL,
    last_error TEXT,
    created_at TEXT NOT NULL,
    updated_at TEXT NOT NULL
);

CREATE INDEX IF NOT EXISTS idx_tasks_ready ON tasks(status, run_after, created_at);
CREATE INDEX IF NOT EXISTS idx_tasks_org ON tasks(org_id, kind);

INSERT INTO schema_migrations (version) VALUES (1);
"#,
    }]
}
