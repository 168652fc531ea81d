//! SQL migration definitions for the tracking database.
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
        description: "Initial schema: analysis_requests, analysis_steps",
        sql: r#"
-- Schema version tracking
CREATE TABLE IF NOT EXISTS schema_migrations (
    version   INTEGER PRIMARY KEY,
    applied_at TEXT NOT NULL DEFAULT (datetime('now'))
);

-- One row per analysis request
CREATE TABLE IF NOT EXISTS analysis_requests (
    request_id      TEXT PRIMARY KEY,
    source_ref      TEXT NOT NULL,
    implementation  TEXT NOT NULL,
    overall_status  TEXT NOT NULL,
    result_data     TEXT NOT NULL DEFAULT '',
    failure_kind    TEXT,
    failure_message TEXT,
    storage_error   TEXT,
    created_at      TEXT NOT NULL,
    updated_at      TEXT NOT NULL
);

CREATE INDEX IF NOT EXISTS idx_requests_created_at ON analysis_requests(created_at);

-- Five rows per request, one per pipeline step
CREATE TABLE IF NOT EXISTS analysis_steps (
    request_id   TEXT NOT NULL REFERENCES analysis_requests(request_id) ON DELETE CASCADE,
    step         TEXT NOT NULL,
    position     INTEGER NOT NULL,
    status       TEXT NOT NULL,
    message      TEXT NOT NULL,
    started_at   TEXT,
    completed_at TEXT,
    PRIMARY KEY (request_id, step)
);

INSERT INTO schema_migrations (version) VALUES (1);
"#,
    }]
}
