//! Internal tables.
//!
//! ```text
//! ps_buckets               per-bucket op ids, checksums and counts
//! ps_oplog                 live PUT operations per bucket
//! ps_updated_rows          rows to re-evaluate on the next full sync
//! ps_crud                  local writes waiting for upload (AUTOINCREMENT)
//! ps_tx                    local transaction id counter
//! ps_kv                    client id and shared status snapshot
//! ps_local_state           applied op id and upload target
//! ps_sync_state            last sync time per priority
//! ps_stream_subscriptions  persisted stream subscriptions
//! ps_untyped               rows for tables with unusable names
//! ps_data__<table>         materialized rows, one JSON document per id
//! ```

use crate::error::{StorageError, StorageResult};
use rusqlite::Connection;

/// Prefix of materialized data tables.
pub const DATA_TABLE_PREFIX: &str = "ps_data__";

/// Idempotent DDL applied on every open.
pub(crate) const CREATE_TABLES: &str = r#"
CREATE TABLE IF NOT EXISTS ps_buckets (
    id                INTEGER PRIMARY KEY,
    name              TEXT NOT NULL UNIQUE,
    last_applied_op   INTEGER NOT NULL DEFAULT 0,
    last_op           INTEGER NOT NULL DEFAULT 0,
    add_checksum      INTEGER NOT NULL DEFAULT 0,
    op_checksum       INTEGER NOT NULL DEFAULT 0,
    priority          INTEGER NOT NULL DEFAULT 3,
    count_at_last     INTEGER NOT NULL DEFAULT 0,
    count_since_last  INTEGER NOT NULL DEFAULT 0
);

CREATE TABLE IF NOT EXISTS ps_oplog (
    bucket    INTEGER NOT NULL,
    op_id     INTEGER NOT NULL,
    row_type  TEXT,
    row_id    TEXT,
    key       TEXT,
    data      TEXT,
    hash      INTEGER NOT NULL
);
CREATE INDEX IF NOT EXISTS ps_oplog_by_row ON ps_oplog (row_type, row_id);
CREATE INDEX IF NOT EXISTS ps_oplog_by_opid ON ps_oplog (bucket, op_id);
CREATE INDEX IF NOT EXISTS ps_oplog_by_key ON ps_oplog (bucket, key);

CREATE TABLE IF NOT EXISTS ps_updated_rows (
    row_type  TEXT NOT NULL,
    row_id    TEXT NOT NULL,
    PRIMARY KEY (row_type, row_id)
) WITHOUT ROWID;

CREATE TABLE IF NOT EXISTS ps_crud (
    id     INTEGER PRIMARY KEY AUTOINCREMENT,
    data   TEXT NOT NULL,
    tx_id  INTEGER
);

CREATE TABLE IF NOT EXISTS ps_tx (
    id       INTEGER PRIMARY KEY CHECK (id = 1),
    next_tx  INTEGER NOT NULL
);
INSERT OR IGNORE INTO ps_tx (id, next_tx) VALUES (1, 1);

CREATE TABLE IF NOT EXISTS ps_kv (
    key    TEXT PRIMARY KEY NOT NULL,
    value  TEXT
);

CREATE TABLE IF NOT EXISTS ps_local_state (
    id                         INTEGER PRIMARY KEY CHECK (id = 1),
    last_op                    INTEGER NOT NULL DEFAULT 0,
    target_op                  INTEGER NOT NULL DEFAULT 0,
    awaiting_write_checkpoint  INTEGER NOT NULL DEFAULT 0
);
INSERT OR IGNORE INTO ps_local_state (id) VALUES (1);

CREATE TABLE IF NOT EXISTS ps_sync_state (
    priority        INTEGER PRIMARY KEY NOT NULL,
    last_synced_at  TEXT NOT NULL
);

CREATE TABLE IF NOT EXISTS ps_stream_subscriptions (
    id              INTEGER PRIMARY KEY,
    stream_name     TEXT NOT NULL,
    parameters      TEXT NOT NULL,
    ttl_secs        INTEGER,
    priority        INTEGER,
    is_default      INTEGER NOT NULL DEFAULT 0,
    explicit        INTEGER NOT NULL DEFAULT 0,
    expires_at      TEXT,
    has_synced      INTEGER NOT NULL DEFAULT 0,
    last_synced_at  TEXT,
    UNIQUE (stream_name, parameters)
);

CREATE TABLE IF NOT EXISTS ps_untyped (
    type  TEXT NOT NULL,
    id    TEXT NOT NULL,
    data  TEXT,
    PRIMARY KEY (type, id)
);
"#;

/// Applies connection settings and creates internal tables.
pub(crate) fn initialize(conn: &Connection, file_backed: bool) -> StorageResult<()> {
    if file_backed {
        conn.pragma_update_and_check(None, "journal_mode", "WAL", |_| Ok(()))?;
        conn.pragma_update(None, "synchronous", "NORMAL")?;
    }
    conn.execute_batch(CREATE_TABLES)?;
    Ok(())
}

/// Returns true if `name` can be used as a local table name.
pub fn is_valid_table_name(name: &str) -> bool {
    !name.is_empty()
        && name.len() <= 128
        && name
            .chars()
            .all(|c| c.is_ascii_alphanumeric() || c == '_')
}

/// Returns the materialized table for a user table name.
pub fn data_table(name: &str) -> StorageResult<String> {
    if is_valid_table_name(name) {
        Ok(format!("{DATA_TABLE_PREFIX}{name}"))
    } else {
        Err(StorageError::InvalidTableName(name.to_string()))
    }
}

/// Creates the materialized table for `name` if needed and returns its name.
pub(crate) fn ensure_data_table(conn: &Connection, name: &str) -> StorageResult<String> {
    let table = data_table(name)?;
    conn.execute_batch(&format!(
        "CREATE TABLE IF NOT EXISTS \"{table}\" (id TEXT PRIMARY KEY NOT NULL, data TEXT)"
    ))?;
    Ok(table)
}

/// Lists the user table names that have materialized tables.
pub(crate) fn data_tables(conn: &Connection) -> StorageResult<Vec<String>> {
    let mut stmt = conn.prepare(
        "SELECT name FROM sqlite_master WHERE type = 'table' AND name LIKE 'ps\\_data\\_\\_%' ESCAPE '\\'",
    )?;
    let names = stmt
        .query_map([], |row| row.get::<_, String>(0))?
        .collect::<Result<Vec<_>, _>>()?;
    Ok(names
        .into_iter()
        .filter_map(|n| n.strip_prefix(DATA_TABLE_PREFIX).map(str::to_string))
        .collect())
}
