//! SQLite schema for the job store
//!
//! Timestamps are stored as Unix milliseconds, enums as their canonical
//! upper-case names and paths as UTF-8 text.

use rusqlite::Connection;

use crate::error::StoreResult;

/// Current schema version
pub const SCHEMA_VERSION: u32 = 2;

const CREATE_JOBS_TABLE: &str = r#"
CREATE TABLE IF NOT EXISTS jobs (
    job_id TEXT PRIMARY KEY,
    archive_type TEXT NOT NULL,
    target_archive_size_bytes INTEGER NOT NULL,
    user_name TEXT NOT NULL DEFAULT '',
    state TEXT NOT NULL,
    num_files INTEGER NOT NULL DEFAULT 0,
    total_size_bytes INTEGER NOT NULL DEFAULT 0,
    num_archives INTEGER NOT NULL DEFAULT 0,
    num_archives_complete INTEGER NOT NULL DEFAULT 0,
    num_files_complete INTEGER NOT NULL DEFAULT 0,
    total_size_complete_bytes INTEGER NOT NULL DEFAULT 0,
    created_at INTEGER NOT NULL,
    start_time INTEGER,
    end_time INTEGER,
    origin_host TEXT,
    version INTEGER NOT NULL DEFAULT 0
)
"#;

const CREATE_ARCHIVES_TABLE: &str = r#"
CREATE TABLE IF NOT EXISTS archives (
    job_id TEXT NOT NULL,
    archive_id INTEGER NOT NULL,
    archive_type TEXT NOT NULL,
    size_bytes INTEGER NOT NULL DEFAULT 0,
    output_path TEXT NOT NULL,
    hash_path TEXT NOT NULL,
    url TEXT,
    state TEXT NOT NULL,
    host_name TEXT,
    worker_id TEXT,
    start_time INTEGER,
    end_time INTEGER,
    dispatched_at INTEGER,
    retry_count INTEGER NOT NULL DEFAULT 0,
    error_message TEXT,
    attempt INTEGER NOT NULL DEFAULT 0,

    PRIMARY KEY (job_id, archive_id),
    FOREIGN KEY (job_id) REFERENCES jobs(job_id)
)
"#;

const CREATE_FILE_ENTRIES_TABLE: &str = r#"
CREATE TABLE IF NOT EXISTS file_entries (
    job_id TEXT NOT NULL,
    archive_id INTEGER NOT NULL,
    seq INTEGER NOT NULL,
    source_path TEXT NOT NULL,
    entry_path TEXT NOT NULL,
    size_bytes INTEGER NOT NULL,
    state TEXT NOT NULL,

    PRIMARY KEY (job_id, archive_id, seq)
)
"#;

const CREATE_STORE_INFO_TABLE: &str = r#"
CREATE TABLE IF NOT EXISTS store_info (
    key TEXT PRIMARY KEY,
    value TEXT
)
"#;

const CREATE_INDEXES: &[&str] = &[
    "CREATE INDEX IF NOT EXISTS idx_jobs_state ON jobs(state)",
    "CREATE INDEX IF NOT EXISTS idx_jobs_created ON jobs(created_at)",
];

const PRAGMAS: &str = r#"
PRAGMA journal_mode = WAL;
PRAGMA synchronous = NORMAL;
PRAGMA foreign_keys = ON;
PRAGMA temp_store = MEMORY;
"#;

/// Configure the connection and create missing tables
pub fn initialize(conn: &Connection) -> StoreResult<()> {
    conn.execute_batch(PRAGMAS)?;

    conn.execute(CREATE_JOBS_TABLE, [])?;
    conn.execute(CREATE_ARCHIVES_TABLE, [])?;
    conn.execute(CREATE_FILE_ENTRIES_TABLE, [])?;
    conn.execute(CREATE_STORE_INFO_TABLE, [])?;
    for sql in CREATE_INDEXES {
        conn.execute(sql, [])?;
    }
    migrate(conn)?;

    conn.execute(
        "INSERT OR REPLACE INTO store_info (key, value) VALUES ('schema_version', ?1)",
        [SCHEMA_VERSION.to_string()],
    )?;

    Ok(())
}

/// Bring tables created by older versions up to date
fn migrate(conn: &Connection) -> StoreResult<()> {
    // Version 2: archives.attempt
    if !has_column(conn, "archives", "attempt")? {
        conn.execute(
            "ALTER TABLE archives ADD COLUMN attempt INTEGER NOT NULL DEFAULT 0",
            [],
        )?;
    }
    Ok(())
}

fn has_column(conn: &Connection, table: &str, column: &str) -> StoreResult<bool> {
    let mut stmt = conn.prepare(&format!("PRAGMA table_info({})", table))?;
    let names = stmt
        .query_map([], |row| row.get::<_, String>(1))?
        .collect::<Result<Vec<_>, _>>()?;
    Ok(names.iter().any(|name| name == column))
}
