//! Local writes and the CRUD upload queue.
//!
//! Every local write goes through [`BucketStorage::write_transaction`],
//! which updates the materialized row and appends a [`CrudEntry`] in the
//! same SQLite transaction. Entries leave the queue only through
//! [`BucketStorage::handle_crud_uploaded`].
//!
//! ```rust,ignore
//! storage.write_transaction(|tx| {
//!     tx.put("todos", "1", json_map)?;
//!     tx.delete("todos", "2")?;
//!     Ok(())
//! })?;
//!
//! if let Some(batch) = storage.get_crud_batch(100)? {
//!     upload(&batch.crud)?;
//!     batch.complete(None)?;
//! }
//! ```

use crate::change_feed::{TableUpdate, CRUD_TABLE};
use crate::error::StorageResult;
use crate::schema;
use crate::storage::{read_local_state, read_row, BucketStorage};
use rusqlite::{params, Connection, OptionalExtension};
use serde_json::{Map, Value};
use skiff_sync_protocol::{CrudEntry, OpId, UpdateType};
use std::collections::BTreeSet;
use std::future::Future;
use std::sync::Arc;
use tracing::{debug, trace};

/// Handle for writes inside [`BucketStorage::write_transaction`].
pub struct LocalWriteTransaction<'a> {
    conn: &'a Connection,
    track_previous_values: bool,
    tx_id: Option<i64>,
    tables: BTreeSet<String>,
}

impl<'a> LocalWriteTransaction<'a> {
    fn new(conn: &'a Connection, track_previous_values: bool) -> Self {
        Self {
            conn,
            track_previous_values,
            tx_id: None,
            tables: BTreeSet::new(),
        }
    }

    /// Reads a row as seen by this transaction.
    pub fn get(&self, table: &str, id: &str) -> StorageResult<Option<Map<String, Value>>> {
        read_row(self.conn, table, id)
    }

    /// Inserts or replaces a row.
    pub fn put(&mut self, table: &str, id: &str, data: Map<String, Value>) -> StorageResult<()> {
        self.put_inner(table, id, data, None)
    }

    /// Inserts or replaces a row, attaching metadata to the queued entry.
    pub fn put_with_metadata(
        &mut self,
        table: &str,
        id: &str,
        data: Map<String, Value>,
        metadata: impl Into<String>,
    ) -> StorageResult<()> {
        self.put_inner(table, id, data, Some(metadata.into()))
    }

    /// Merges `changes` into an existing row.
    ///
    /// Returns false and queues nothing if the row does not exist.
    pub fn patch(
        &mut self,
        table: &str,
        id: &str,
        changes: Map<String, Value>,
    ) -> StorageResult<bool> {
        self.patch_inner(table, id, changes, None)
    }

    /// Merges `changes` into an existing row, attaching metadata.
    pub fn patch_with_metadata(
        &mut self,
        table: &str,
        id: &str,
        changes: Map<String, Value>,
        metadata: impl Into<String>,
    ) -> StorageResult<bool> {
        self.patch_inner(table, id, changes, Some(metadata.into()))
    }

    /// Deletes a row.
    ///
    /// Returns false and queues nothing if the row does not exist.
    pub fn delete(&mut self, table: &str, id: &str) -> StorageResult<bool> {
        self.delete_inner(table, id, None)
    }

    /// Deletes a row, attaching metadata.
    pub fn delete_with_metadata(
        &mut self,
        table: &str,
        id: &str,
        metadata: impl Into<String>,
    ) -> StorageResult<bool> {
        self.delete_inner(table, id, Some(metadata.into()))
    }

    fn put_inner(
        &mut self,
        table: &str,
        id: &str,
        data: Map<String, Value>,
        metadata: Option<String>,
    ) -> StorageResult<()> {
        let data_table = schema::ensure_data_table(self.conn, table)?;
        self.conn.execute(
            &format!("INSERT OR REPLACE INTO \"{data_table}\" (id, data) VALUES (?1, ?2)"),
            params![id, serde_json::to_string(&data)?],
        )?;
        let entry = CrudEntry::new(UpdateType::Put, table, id, Some(data)).with_metadata(metadata);
        self.enqueue(entry)
    }

    fn patch_inner(
        &mut self,
        table: &str,
        id: &str,
        changes: Map<String, Value>,
        metadata: Option<String>,
    ) -> StorageResult<bool> {
        let Some(mut row) = self.get(table, id)? else {
            return Ok(false);
        };
        let previous = self.track_previous_values.then(|| {
            changes
                .keys()
                .map(|k| (k.clone(), row.get(k).cloned().unwrap_or(Value::Null)))
                .collect::<Map<_, _>>()
        });
        for (key, value) in &changes {
            row.insert(key.clone(), value.clone());
        }

        let data_table = schema::data_table(table)?;
        self.conn.execute(
            &format!("UPDATE \"{data_table}\" SET data = ?1 WHERE id = ?2"),
            params![serde_json::to_string(&row)?, id],
        )?;
        let entry = CrudEntry::new(UpdateType::Patch, table, id, Some(changes))
            .with_previous_values(previous)
            .with_metadata(metadata);
        self.enqueue(entry)?;
        Ok(true)
    }

    fn delete_inner(
        &mut self,
        table: &str,
        id: &str,
        metadata: Option<String>,
    ) -> StorageResult<bool> {
        let Some(row) = self.get(table, id)? else {
            return Ok(false);
        };
        let data_table = schema::data_table(table)?;
        self.conn
            .execute(&format!("DELETE FROM \"{data_table}\" WHERE id = ?1"), [id])?;
        let entry = CrudEntry::new(UpdateType::Delete, table, id, None)
            .with_previous_values(self.track_previous_values.then_some(row))
            .with_metadata(metadata);
        self.enqueue(entry)?;
        Ok(true)
    }

    fn enqueue(&mut self, entry: CrudEntry) -> StorageResult<()> {
        let tx_id = match self.tx_id {
            Some(id) => id,
            None => {
                let id: i64 =
                    self.conn
                        .query_row("SELECT next_tx FROM ps_tx WHERE id = 1", [], |row| {
                            row.get(0)
                        })?;
                self.conn
                    .execute("UPDATE ps_tx SET next_tx = next_tx + 1 WHERE id = 1", [])?;
                self.conn.execute(
                    "UPDATE ps_local_state SET awaiting_write_checkpoint = 1 WHERE id = 1",
                    [],
                )?;
                self.tx_id = Some(id);
                id
            }
        };
        self.conn.execute(
            "INSERT INTO ps_crud (data, tx_id) VALUES (?1, ?2)",
            params![entry.to_row_data()?, tx_id],
        )?;
        trace!(table = %entry.table, id = %entry.id, op = %entry.op, tx_id, "queued local write");
        self.tables.insert(entry.table);
        Ok(())
    }
}

/// A batch of queued writes, oldest first.
#[derive(Debug)]
pub struct CrudBatch {
    /// Queued entries.
    pub crud: Vec<CrudEntry>,
    /// Whether more entries remain after this batch.
    pub has_more: bool,
    storage: Arc<BucketStorage>,
}

impl CrudBatch {
    /// Removes the batch from the queue after a successful upload.
    pub fn complete(self, write_checkpoint: Option<OpId>) -> StorageResult<()> {
        match self.crud.last() {
            Some(last) => self
                .storage
                .handle_crud_uploaded(last.client_id, write_checkpoint),
            None => Ok(()),
        }
    }
}

/// All queued writes of one local transaction.
#[derive(Debug)]
pub struct CrudTransaction {
    /// Local transaction id, if the entries carry one.
    pub transaction_id: Option<i64>,
    /// Queued entries in write order.
    pub crud: Vec<CrudEntry>,
    storage: Arc<BucketStorage>,
}

impl CrudTransaction {
    /// Removes the transaction from the queue after a successful upload.
    pub fn complete(self, write_checkpoint: Option<OpId>) -> StorageResult<()> {
        match self.crud.last() {
            Some(last) => self
                .storage
                .handle_crud_uploaded(last.client_id, write_checkpoint),
            None => Ok(()),
        }
    }
}

/// CRUD high-water mark captured by [`BucketStorage::begin_target_update`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct TargetUpdateTicket {
    sequence: i64,
}

impl BucketStorage {
    /// Runs local writes in one transaction.
    ///
    /// Nothing is written or queued if `f` fails. After commit a change
    /// notification names the written tables and `ps_crud`.
    pub fn write_transaction<T>(
        &self,
        f: impl FnOnce(&mut LocalWriteTransaction<'_>) -> StorageResult<T>,
    ) -> StorageResult<T> {
        let track = self.config().track_previous_values;
        let (result, tables) = self.with_write_txn(|txn| {
            let mut tx = LocalWriteTransaction::new(txn, track);
            let result = f(&mut tx)?;
            Ok((result, tx.tables))
        })?;

        if !tables.is_empty() {
            let mut update = TableUpdate::new(tables);
            update.tables.insert(CRUD_TABLE.to_string());
            self.change_feed().emit(update);
        }
        Ok(result)
    }

    /// Returns the oldest queued write.
    pub fn next_crud_item(&self) -> StorageResult<Option<CrudEntry>> {
        let conn = self.lock_conn()?;
        Ok(query_crud(&conn, "ORDER BY id LIMIT 1", params![])?
            .into_iter()
            .next())
    }

    /// Returns true if writes are waiting for upload.
    pub fn has_pending_crud(&self) -> StorageResult<bool> {
        let conn = self.lock_conn()?;
        crud_pending(&conn)
    }

    /// Returns up to `limit` queued writes, or `None` if the queue is empty.
    pub fn get_crud_batch(self: &Arc<Self>, limit: usize) -> StorageResult<Option<CrudBatch>> {
        let limit = i64::try_from(limit).unwrap_or(i64::MAX).max(1);
        let mut crud = {
            let conn = self.lock_conn()?;
            query_crud(&conn, "ORDER BY id LIMIT ?1", params![limit.saturating_add(1)])?
        };
        if crud.is_empty() {
            return Ok(None);
        }
        let has_more = crud.len() as i64 > limit;
        crud.truncate(limit as usize);
        Ok(Some(CrudBatch {
            crud,
            has_more,
            storage: Arc::clone(self),
        }))
    }

    /// Returns the writes of the oldest queued transaction.
    pub fn next_crud_transaction(self: &Arc<Self>) -> StorageResult<Option<CrudTransaction>> {
        let conn = self.lock_conn()?;
        let Some(first) = query_crud(&conn, "ORDER BY id LIMIT 1", params![])?
            .into_iter()
            .next()
        else {
            return Ok(None);
        };
        let transaction_id = first.transaction_id;
        let crud = match transaction_id {
            Some(tx_id) => query_crud(&conn, "WHERE tx_id = ?1 ORDER BY id", params![tx_id])?,
            None => vec![first],
        };
        Ok(Some(CrudTransaction {
            transaction_id,
            crud,
            storage: Arc::clone(self),
        }))
    }

    /// Removes uploaded writes from the queue.
    ///
    /// With a write checkpoint the upload target advances once the queue
    /// is empty. Without one, remote data stays unapplied until
    /// [`BucketStorage::update_local_target`] resolves a checkpoint.
    pub fn handle_crud_uploaded(
        &self,
        last_client_id: i64,
        write_checkpoint: Option<OpId>,
    ) -> StorageResult<()> {
        self.with_write_txn(|txn| {
            txn.execute("DELETE FROM ps_crud WHERE id <= ?1", [last_client_id])?;
            match write_checkpoint {
                Some(op_id) => {
                    if !crud_pending(txn)? {
                        txn.execute(
                            "UPDATE ps_local_state
                             SET target_op = MAX(target_op, ?1), awaiting_write_checkpoint = 0
                             WHERE id = 1",
                            [op_id.value()],
                        )?;
                    }
                }
                None => {
                    txn.execute(
                        "UPDATE ps_local_state SET awaiting_write_checkpoint = 1 WHERE id = 1",
                        [],
                    )?;
                }
            }
            Ok(())
        })?;
        debug!(last_client_id, ?write_checkpoint, "uploaded local writes");
        self.change_feed().emit(TableUpdate::new([CRUD_TABLE]));
        Ok(())
    }

    /// Captures the CRUD high-water mark if a write checkpoint is awaited.
    pub fn begin_target_update(&self) -> StorageResult<Option<TargetUpdateTicket>> {
        let conn = self.lock_conn()?;
        if !read_local_state(&conn)?.awaiting_write_checkpoint {
            return Ok(None);
        }
        Ok(Some(TargetUpdateTicket {
            sequence: crud_sequence(&conn)?,
        }))
    }

    /// Commits a write checkpoint obtained after [`Self::begin_target_update`].
    ///
    /// Returns false if writes were queued in between or are still pending.
    pub fn commit_target_update(
        &self,
        ticket: TargetUpdateTicket,
        op_id: OpId,
    ) -> StorageResult<bool> {
        let committed = self.with_write_txn(|txn| {
            if crud_pending(txn)? || crud_sequence(txn)? != ticket.sequence {
                return Ok(false);
            }
            txn.execute(
                "UPDATE ps_local_state
                 SET target_op = MAX(target_op, ?1), awaiting_write_checkpoint = 0
                 WHERE id = 1",
                [op_id.value()],
            )?;
            Ok(true)
        })?;
        debug!(%op_id, committed, "local target update");
        Ok(committed)
    }

    /// Resolves an awaited write checkpoint through `fetch`.
    ///
    /// `fetch` runs without holding the write lock. Returns true if the
    /// target was updated.
    pub async fn update_local_target<F, Fut, E>(&self, fetch: F) -> Result<bool, E>
    where
        F: FnOnce() -> Fut,
        Fut: Future<Output = Result<OpId, E>>,
        E: From<crate::error::StorageError>,
    {
        let Some(ticket) = self.begin_target_update()? else {
            return Ok(false);
        };
        let op_id = fetch().await?;
        Ok(self.commit_target_update(ticket, op_id)?)
    }
}

fn crud_pending(conn: &Connection) -> StorageResult<bool> {
    let found: Option<i64> = conn
        .query_row("SELECT 1 FROM ps_crud LIMIT 1", [], |row| row.get(0))
        .optional()?;
    Ok(found.is_some())
}

fn crud_sequence(conn: &Connection) -> StorageResult<i64> {
    let seq: Option<i64> = conn
        .query_row(
            "SELECT seq FROM sqlite_sequence WHERE name = 'ps_crud'",
            [],
            |row| row.get(0),
        )
        .optional()?;
    Ok(seq.unwrap_or(0))
}

fn query_crud(
    conn: &Connection,
    clause: &str,
    params: &[&dyn rusqlite::ToSql],
) -> StorageResult<Vec<CrudEntry>> {
    let mut stmt = conn.prepare(&format!("SELECT id, tx_id, data FROM ps_crud {clause}"))?;
    let rows = stmt
        .query_map(params, |row| {
            Ok((
                row.get::<_, i64>(0)?,
                row.get::<_, Option<i64>>(1)?,
                row.get::<_, String>(2)?,
            ))
        })?
        .collect::<Result<Vec<_>, _>>()?;
    rows.into_iter()
        .map(|(id, tx_id, data)| Ok(CrudEntry::from_row(id, tx_id, &data)?))
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::StorageConfig;
    use serde_json::json;

    fn storage() -> Arc<BucketStorage> {
        Arc::new(BucketStorage::in_memory().unwrap())
    }

    fn object(value: Value) -> Map<String, Value> {
        match value {
            Value::Object(map) => map,
            _ => panic!("expected object"),
        }
    }

    #[test]
    fn write_transaction_queues_entries() {
        let storage = storage();
        let rx = storage.subscribe_changes();
        storage
            .write_transaction(|tx| {
                tx.put("todos", "1", object(json!({"title": "a"})))?;
                tx.put("todos", "2", object(json!({"title": "b"})))?;
                Ok(())
            })
            .unwrap();

        let update = rx.try_recv().unwrap();
        assert!(update.contains("todos"));
        assert!(update.touches_crud());

        let batch = storage.get_crud_batch(10).unwrap().unwrap();
        assert_eq!(batch.crud.len(), 2);
        assert!(!batch.has_more);
        assert_eq!(batch.crud[0].transaction_id, batch.crud[1].transaction_id);
        assert!(batch.crud[0].client_id < batch.crud[1].client_id);
        assert!(storage.local_state().unwrap().awaiting_write_checkpoint);
    }

    #[test]
    fn failed_transaction_leaves_nothing() {
        let storage = storage();
        let result: StorageResult<()> = storage.write_transaction(|tx| {
            tx.put("todos", "1", Map::new())?;
            Err(crate::error::StorageError::NotFound)
        });
        assert!(result.is_err());
        assert!(storage.next_crud_item().unwrap().is_none());
        assert!(!storage.local_state().unwrap().awaiting_write_checkpoint);
    }

    #[test]
    fn patch_and_delete_missing_rows() {
        let storage = storage();
        let (patched, deleted) = storage
            .write_transaction(|tx| Ok((tx.patch("todos", "x", Map::new())?, tx.delete("todos", "x")?)))
            .unwrap();
        assert!(!patched);
        assert!(!deleted);
        assert!(!storage.has_pending_crud().unwrap());
    }

    #[test]
    fn previous_values_are_tracked() {
        let storage = Arc::new(
            BucketStorage::open(StorageConfig::in_memory().track_previous_values(true)).unwrap(),
        );
        storage
            .write_transaction(|tx| {
                tx.put("todos", "1", object(json!({"title": "a", "done": false})))?;
                tx.patch("todos", "1", object(json!({"done": true})))?;
                tx.delete_with_metadata("todos", "1", "cleanup")?;
                Ok(())
            })
            .unwrap();

        let batch = storage.get_crud_batch(10).unwrap().unwrap();
        let patch = &batch.crud[1];
        assert_eq!(patch.op, UpdateType::Patch);
        assert_eq!(patch.previous_values, Some(object(json!({"done": false}))));

        let delete = &batch.crud[2];
        assert_eq!(delete.op, UpdateType::Delete);
        assert_eq!(
            delete.previous_values,
            Some(object(json!({"title": "a", "done": true})))
        );
        assert_eq!(delete.metadata.as_deref(), Some("cleanup"));
        assert_eq!(storage.row("todos", "1").unwrap(), None);
    }

    #[test]
    fn batches_respect_limit() {
        let storage = storage();
        for i in 0..3 {
            storage
                .write_transaction(|tx| tx.put("todos", &i.to_string(), Map::new()))
                .unwrap();
        }
        let batch = storage.get_crud_batch(2).unwrap().unwrap();
        assert_eq!(batch.crud.len(), 2);
        assert!(batch.has_more);
        batch.complete(None).unwrap();

        let rest = storage.get_crud_batch(2).unwrap().unwrap();
        assert_eq!(rest.crud.len(), 1);
        assert!(!rest.has_more);
    }

    #[test]
    fn transactions_group_entries() {
        let storage = storage();
        storage
            .write_transaction(|tx| {
                tx.put("a", "1", Map::new())?;
                tx.put("b", "1", Map::new())
            })
            .unwrap();
        storage
            .write_transaction(|tx| tx.put("a", "2", Map::new()))
            .unwrap();

        let first = storage.next_crud_transaction().unwrap().unwrap();
        assert_eq!(first.crud.len(), 2);
        first.complete(Some(OpId(5))).unwrap();

        let second = storage.next_crud_transaction().unwrap().unwrap();
        assert_eq!(second.crud.len(), 1);
        assert_ne!(second.transaction_id, None);
        second.complete(Some(OpId(7))).unwrap();

        assert!(storage.next_crud_transaction().unwrap().is_none());
        let state = storage.local_state().unwrap();
        assert_eq!(state.target_op_id, OpId(7));
        assert!(!state.awaiting_write_checkpoint);
    }

    #[test]
    fn write_checkpoint_waits_for_empty_queue() {
        let storage = storage();
        storage
            .write_transaction(|tx| tx.put("a", "1", Map::new()))
            .unwrap();
        storage
            .write_transaction(|tx| tx.put("a", "2", Map::new()))
            .unwrap();

        let first = storage.next_crud_item().unwrap().unwrap();
        storage
            .handle_crud_uploaded(first.client_id, Some(OpId(10)))
            .unwrap();
        let state = storage.local_state().unwrap();
        assert_eq!(state.target_op_id, OpId(0));
        assert!(state.awaiting_write_checkpoint);
    }

    #[test]
    fn target_update_detects_concurrent_write() {
        let storage = storage();
        storage
            .write_transaction(|tx| tx.put("a", "1", Map::new()))
            .unwrap();
        storage.handle_crud_uploaded(1, None).unwrap();

        let ticket = storage.begin_target_update().unwrap().unwrap();
        storage
            .write_transaction(|tx| tx.put("a", "2", Map::new()))
            .unwrap();
        assert!(!storage.commit_target_update(ticket, OpId(3)).unwrap());

        storage.handle_crud_uploaded(2, None).unwrap();
        assert!(!storage.commit_target_update(ticket, OpId(3)).unwrap());

        let ticket = storage.begin_target_update().unwrap().unwrap();
        assert!(storage.commit_target_update(ticket, OpId(4)).unwrap());
        let state = storage.local_state().unwrap();
        assert_eq!(state.target_op_id, OpId(4));
        assert!(storage.begin_target_update().unwrap().is_none());
    }

    #[test]
    fn target_never_regresses() {
        let storage = storage();
        storage
            .write_transaction(|tx| tx.put("a", "1", Map::new()))
            .unwrap();
        storage.handle_crud_uploaded(1, Some(OpId(9))).unwrap();
        storage
            .write_transaction(|tx| tx.put("a", "2", Map::new()))
            .unwrap();
        storage.handle_crud_uploaded(2, Some(OpId(4))).unwrap();
        assert_eq!(storage.local_state().unwrap().target_op_id, OpId(9));
    }
}
