//! Database schema definitions
//!
//! This module contains all SQL schema definitions for the Sumi-Frontier database.
//! The `revisiting_queue` layout is the persisted contract every alternative
//! queue backend has to reproduce.

/// SQL schema for the database
pub const SCHEMA_SQL: &str = r#"
-- Revisiting queue: at most one live record per fingerprint within a partition
CREATE TABLE IF NOT EXISTS revisiting_queue (
    id INTEGER PRIMARY KEY AUTOINCREMENT,
    fingerprint TEXT NOT NULL,
    score REAL NOT NULL,
    url TEXT NOT NULL,
    method TEXT NOT NULL,
    headers TEXT NOT NULL,
    cookies TEXT NOT NULL,
    meta TEXT NOT NULL,
    partition_id INTEGER NOT NULL,
    host_bucket INTEGER NOT NULL,
    created_at INTEGER NOT NULL,   -- microseconds since epoch
    crawl_at INTEGER NOT NULL,     -- seconds since epoch
    UNIQUE(partition_id, fingerprint)
);

CREATE INDEX IF NOT EXISTS idx_queue_partition_crawl_at
    ON revisiting_queue(partition_id, crawl_at);
CREATE INDEX IF NOT EXISTS idx_queue_score ON revisiting_queue(score);

-- Persisted crawl states, authoritative across restarts
CREATE TABLE IF NOT EXISTS states (
    fingerprint TEXT PRIMARY KEY,
    state INTEGER NOT NULL
);

-- Per-document metadata
CREATE TABLE IF NOT EXISTS metadata (
    fingerprint TEXT PRIMARY KEY,
    url TEXT NOT NULL,
    depth INTEGER NOT NULL DEFAULT 0,
    created_at TEXT NOT NULL,
    fetched_at TEXT,
    status_code INTEGER,
    score REAL NOT NULL DEFAULT 0,
    error TEXT
);
"#;

/// Initializes the database schema
///
/// # Arguments
///
/// * `conn` - The database connection
///
/// # Returns
///
/// * `Ok(())` - Schema initialized successfully
/// * `Err(rusqlite::Error)` - Failed to initialize schema
pub fn initialize_schema(conn: &rusqlite::Connection) -> Result<(), rusqlite::Error> {
    conn.execute_batch(SCHEMA_SQL)?;
    Ok(())
}

/// Opens a connection with the pragmas every component uses
pub fn open_connection(path: &std::path::Path) -> Result<rusqlite::Connection, rusqlite::Error> {
    let conn = rusqlite::Connection::open(path)?;

    conn.execute_batch(
        "
        PRAGMA journal_mode = WAL;
        PRAGMA synchronous = NORMAL;
        PRAGMA busy_timeout = 5000;
        PRAGMA temp_store = MEMORY;
    ",
    )?;

    initialize_schema(&conn)?;
    Ok(conn)
}

/// Opens an in-memory connection with the schema applied
pub fn open_in_memory() -> Result<rusqlite::Connection, rusqlite::Error> {
    let conn = rusqlite::Connection::open_in_memory()?;
    initialize_schema(&conn)?;
    Ok(conn)
}
