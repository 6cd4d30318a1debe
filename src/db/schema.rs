//! Database schema and migrations for rapidstore.
//!
//! Migrations are applied sequentially when the database is first opened or
//! upgraded. Timestamps are unix seconds.

/// Database migrations.
///
/// Each migration is a SQL script that will be executed in order.
/// The schema_version table tracks which migrations have been applied.
pub const MIGRATIONS: &[&str] = &[
    // v1: mime dedup table
    r#"
CREATE TABLE mime (
    id      INTEGER PRIMARY KEY AUTOINCREMENT,
    mime    TEXT NOT NULL UNIQUE
);
"#,
    // v2: file records
    r#"
CREATE TABLE file_record (
    id              INTEGER PRIMARY KEY AUTOINCREMENT,
    name            TEXT NOT NULL,
    mime_id         INTEGER REFERENCES mime(id) ON DELETE SET NULL ON UPDATE CASCADE,
    size            INTEGER NOT NULL CHECK (size >= 0),
    is_private      INTEGER NOT NULL DEFAULT 0,
    created_at      INTEGER NOT NULL,
    updated_at      INTEGER,
    delete_at_time  INTEGER,
    status          INTEGER NOT NULL CHECK (status IN (0, 1, 2, 3)),
    status_time     INTEGER
);
"#,
    // v3: indexes for the GC sweeps and the mime foreign key
    r#"
CREATE INDEX idx_file_record_status ON file_record(status);
CREATE INDEX idx_file_record_status_delete_at ON file_record(status, delete_at_time);
CREATE INDEX idx_file_record_mime_id ON file_record(mime_id);
"#,
];
