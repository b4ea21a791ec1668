//! SQLite-backed bucket storage.

use crate::change_feed::{ChangeFeed, TableUpdate};
use crate::config::StorageConfig;
use crate::error::{StorageError, StorageResult};
use crate::schema;
use parking_lot::{Mutex, MutexGuard};
use rusqlite::types::{Value as SqlValue, ValueRef};
use rusqlite::{params, Connection, OptionalExtension, Row, TransactionBehavior};
use serde_json::{Map, Value};
use skiff_sync_protocol::OpId;
use std::path::Path;
use std::sync::mpsc::Receiver;
use tracing::{debug, info};

const CLIENT_ID_KEY: &str = "client_id";

/// Applied op id and upload target of the local database.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct LocalState {
    /// Highest write checkpoint seen in an applied full checkpoint.
    pub last_op_id: OpId,
    /// Write checkpoint local uploads must reach before remote data applies.
    pub target_op_id: OpId,
    /// Set after local writes or uploads until a write checkpoint is known.
    pub awaiting_write_checkpoint: bool,
}

impl LocalState {
    /// Returns true if downloaded data may be applied to local tables.
    pub fn has_reached_target(&self) -> bool {
        !self.awaiting_write_checkpoint && self.last_op_id >= self.target_op_id
    }
}

/// Durable local state for the sync engine.
///
/// Holds one SQLite connection behind a mutex. Every write, whether it
/// comes from downloaded data or from the application, goes through that
/// mutex, so bucket checksums and materialized rows never interleave.
///
/// # Invariants
///
/// - Per-bucket op ids only increase
/// - A batch is applied entirely or not at all
/// - CRUD ids are never reused (SQLite AUTOINCREMENT)
/// - The upload target only moves forward, except through [`BucketStorage::clear`]
pub struct BucketStorage {
    conn: Mutex<Connection>,
    config: StorageConfig,
    feed: ChangeFeed,
}

impl BucketStorage {
    /// Opens storage with the given configuration.
    pub fn open(config: StorageConfig) -> StorageResult<Self> {
        let conn = match &config.path {
            Some(path) => {
                if let Some(parent) = path.parent().filter(|p| !p.as_os_str().is_empty()) {
                    std::fs::create_dir_all(parent)?;
                }
                Connection::open(path)?
            }
            None => Connection::open_in_memory()?,
        };
        conn.busy_timeout(config.lock_timeout)?;
        schema::initialize(&conn, config.path.is_some())?;

        info!(path = ?config.path, "opened bucket storage");
        Ok(Self {
            conn: Mutex::new(conn),
            config,
            feed: ChangeFeed::new(),
        })
    }

    /// Opens a private in-memory database.
    pub fn in_memory() -> StorageResult<Self> {
        Self::open(StorageConfig::in_memory())
    }

    /// Opens a database file with default settings.
    pub fn open_file(path: impl AsRef<Path>) -> StorageResult<Self> {
        Self::open(StorageConfig::file(path))
    }

    /// Returns the configuration.
    pub fn config(&self) -> &StorageConfig {
        &self.config
    }

    /// Returns the database file, if any.
    pub fn path(&self) -> Option<&Path> {
        self.config.path.as_deref()
    }

    /// Returns the change feed.
    pub fn change_feed(&self) -> &ChangeFeed {
        &self.feed
    }

    /// Subscribes to table change notifications.
    pub fn subscribe_changes(&self) -> Receiver<TableUpdate> {
        self.feed.subscribe()
    }

    /// Acquires the write lock, failing after the configured timeout.
    pub(crate) fn lock_conn(&self) -> StorageResult<MutexGuard<'_, Connection>> {
        self.conn
            .try_lock_for(self.config.lock_timeout)
            .ok_or(StorageError::LockTimeout(self.config.lock_timeout))
    }

    /// Runs `f` inside an immediate SQLite transaction under the write lock.
    ///
    /// The transaction commits only if `f` succeeds.
    pub(crate) fn with_write_txn<T>(
        &self,
        f: impl FnOnce(&rusqlite::Transaction<'_>) -> StorageResult<T>,
    ) -> StorageResult<T> {
        let mut conn = self.lock_conn()?;
        let txn = conn.transaction_with_behavior(TransactionBehavior::Immediate)?;
        let result = f(&txn)?;
        txn.commit()?;
        Ok(result)
    }

    /// Runs a read-only closure against the connection.
    pub fn read<T>(&self, f: impl FnOnce(&Connection) -> StorageResult<T>) -> StorageResult<T> {
        let conn = self.lock_conn()?;
        f(&conn)
    }

    /// Returns the persistent client id, creating it on first use.
    pub fn client_id(&self) -> StorageResult<String> {
        self.with_write_txn(|txn| {
            let existing: Option<String> = txn
                .query_row(
                    "SELECT value FROM ps_kv WHERE key = ?1",
                    [CLIENT_ID_KEY],
                    |row| row.get(0),
                )
                .optional()?
                .flatten();
            if let Some(id) = existing {
                return Ok(id);
            }
            let id = uuid::Uuid::new_v4().to_string();
            txn.execute(
                "INSERT INTO ps_kv (key, value) VALUES (?1, ?2)",
                params![CLIENT_ID_KEY, id],
            )?;
            debug!(client_id = %id, "generated client id");
            Ok(id)
        })
    }

    /// Reads a value from the key-value table.
    pub fn get_kv(&self, key: &str) -> StorageResult<Option<String>> {
        let conn = self.lock_conn()?;
        Ok(conn
            .query_row("SELECT value FROM ps_kv WHERE key = ?1", [key], |row| {
                row.get::<_, Option<String>>(0)
            })
            .optional()?
            .flatten())
    }

    /// Writes a value to the key-value table.
    pub fn put_kv(&self, key: &str, value: &str) -> StorageResult<()> {
        let conn = self.lock_conn()?;
        conn.execute(
            "INSERT OR REPLACE INTO ps_kv (key, value) VALUES (?1, ?2)",
            params![key, value],
        )?;
        Ok(())
    }

    /// Returns the local op id state.
    pub fn local_state(&self) -> StorageResult<LocalState> {
        let conn = self.lock_conn()?;
        read_local_state(&conn)
    }

    /// Removes all synced and local data, keeping only the client id.
    ///
    /// This is the only operation that lowers the upload target.
    pub fn clear(&self) -> StorageResult<()> {
        let tables = self.with_write_txn(|txn| {
            let tables = schema::data_tables(txn)?;
            for table in &tables {
                txn.execute_batch(&format!(
                    "DROP TABLE IF EXISTS \"{}{}\"",
                    schema::DATA_TABLE_PREFIX,
                    table
                ))?;
            }
            txn.execute_batch(
                "DELETE FROM ps_buckets;
                 DELETE FROM ps_oplog;
                 DELETE FROM ps_updated_rows;
                 DELETE FROM ps_crud;
                 DELETE FROM ps_untyped;
                 DELETE FROM ps_sync_state;
                 DELETE FROM ps_stream_subscriptions;
                 DELETE FROM ps_kv WHERE key != 'client_id';
                 UPDATE ps_tx SET next_tx = 1;
                 UPDATE ps_local_state SET last_op = 0, target_op = 0, awaiting_write_checkpoint = 0;",
            )?;
            Ok(tables)
        })?;

        info!(tables = tables.len(), "cleared local database");
        let mut update = TableUpdate::new(tables);
        update.tables.insert(crate::change_feed::CRUD_TABLE.to_string());
        self.feed.emit(update);
        Ok(())
    }

    /// Executes a statement under the write lock.
    ///
    /// Statements run this way bypass the CRUD queue.
    pub fn execute(&self, sql: &str, params: &[Value]) -> StorageResult<usize> {
        let conn = self.lock_conn()?;
        let changed = conn.execute(sql, rusqlite::params_from_iter(params.iter().map(to_sql)))?;
        Ok(changed)
    }

    /// Returns all rows of a query as JSON objects.
    pub fn get_all(&self, sql: &str, params: &[Value]) -> StorageResult<Vec<Map<String, Value>>> {
        let conn = self.lock_conn()?;
        let mut stmt = conn.prepare(sql)?;
        let columns: Vec<String> = stmt.column_names().iter().map(|c| c.to_string()).collect();
        let rows = stmt
            .query_map(rusqlite::params_from_iter(params.iter().map(to_sql)), |row| {
                row_to_json(row, &columns)
            })?
            .collect::<Result<Vec<_>, _>>()?;
        Ok(rows)
    }

    /// Returns the first row of a query, if any.
    pub fn get_optional(
        &self,
        sql: &str,
        params: &[Value],
    ) -> StorageResult<Option<Map<String, Value>>> {
        Ok(self.get_all(sql, params)?.into_iter().next())
    }

    /// Returns the first row of a query, failing if there is none.
    pub fn get(&self, sql: &str, params: &[Value]) -> StorageResult<Map<String, Value>> {
        self.get_optional(sql, params)?.ok_or(StorageError::NotFound)
    }

    /// Returns a materialized row as a JSON object.
    pub fn row(&self, table: &str, id: &str) -> StorageResult<Option<Map<String, Value>>> {
        let conn = self.lock_conn()?;
        read_row(&conn, table, id)
    }

    /// Returns all materialized rows of a table, ordered by id.
    pub fn rows(&self, table: &str) -> StorageResult<Vec<(String, Map<String, Value>)>> {
        let data_table = schema::data_table(table)?;
        let conn = self.lock_conn()?;
        if !table_exists(&conn, &data_table)? {
            return Ok(Vec::new());
        }
        let mut stmt = conn.prepare(&format!(
            "SELECT id, data FROM \"{data_table}\" ORDER BY id"
        ))?;
        let raw = stmt
            .query_map([], |row| {
                Ok((row.get::<_, String>(0)?, row.get::<_, Option<String>>(1)?))
            })?
            .collect::<Result<Vec<_>, _>>()?;
        raw.into_iter()
            .map(|(id, data)| Ok((id, parse_object(data.as_deref())?)))
            .collect()
    }
}

impl std::fmt::Debug for BucketStorage {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("BucketStorage")
            .field("path", &self.config.path)
            .finish_non_exhaustive()
    }
}

pub(crate) fn read_local_state(conn: &Connection) -> StorageResult<LocalState> {
    let state = conn.query_row(
        "SELECT last_op, target_op, awaiting_write_checkpoint FROM ps_local_state WHERE id = 1",
        [],
        |row| {
            Ok(LocalState {
                last_op_id: OpId(row.get(0)?),
                target_op_id: OpId(row.get(1)?),
                awaiting_write_checkpoint: row.get(2)?,
            })
        },
    )?;
    Ok(state)
}

pub(crate) fn table_exists(conn: &Connection, name: &str) -> StorageResult<bool> {
    let found: Option<i64> = conn
        .query_row(
            "SELECT 1 FROM sqlite_master WHERE type = 'table' AND name = ?1",
            [name],
            |row| row.get(0),
        )
        .optional()?;
    Ok(found.is_some())
}

pub(crate) fn read_row(
    conn: &Connection,
    table: &str,
    id: &str,
) -> StorageResult<Option<Map<String, Value>>> {
    let data_table = schema::data_table(table)?;
    if !table_exists(conn, &data_table)? {
        return Ok(None);
    }
    let data: Option<Option<String>> = conn
        .query_row(
            &format!("SELECT data FROM \"{data_table}\" WHERE id = ?1"),
            [id],
            |row| row.get(0),
        )
        .optional()?;
    match data {
        Some(data) => Ok(Some(parse_object(data.as_deref())?)),
        None => Ok(None),
    }
}

/// Parses a stored row document. Non-object payloads become `{"value": ...}`.
pub(crate) fn parse_object(data: Option<&str>) -> StorageResult<Map<String, Value>> {
    match data {
        None => Ok(Map::new()),
        Some(text) => match serde_json::from_str::<Value>(text)? {
            Value::Object(map) => Ok(map),
            other => {
                let mut map = Map::new();
                map.insert("value".into(), other);
                Ok(map)
            }
        },
    }
}

fn to_sql(value: &Value) -> SqlValue {
    match value {
        Value::Null => SqlValue::Null,
        Value::Bool(b) => SqlValue::Integer(i64::from(*b)),
        Value::Number(n) => match n.as_i64() {
            Some(i) => SqlValue::Integer(i),
            None => SqlValue::Real(n.as_f64().unwrap_or_default()),
        },
        Value::String(s) => SqlValue::Text(s.clone()),
        other => SqlValue::Text(other.to_string()),
    }
}

fn row_to_json(row: &Row<'_>, columns: &[String]) -> rusqlite::Result<Map<String, Value>> {
    let mut map = Map::new();
    for (i, name) in columns.iter().enumerate() {
        let value = match row.get_ref(i)? {
            ValueRef::Null => Value::Null,
            ValueRef::Integer(i) => Value::from(i),
            ValueRef::Real(f) => serde_json::Number::from_f64(f)
                .map(Value::Number)
                .unwrap_or(Value::Null),
            ValueRef::Text(t) => Value::String(String::from_utf8_lossy(t).into_owned()),
            ValueRef::Blob(b) => Value::Array(b.iter().map(|byte| Value::from(*byte)).collect()),
        };
        map.insert(name.clone(), value);
    }
    Ok(map)
}
