//! Bucket state, oplog application and checkpoint validation.

use crate::change_feed::TableUpdate;
use crate::error::{StorageError, StorageResult};
use crate::schema;
use crate::storage::{read_local_state, BucketStorage};
use chrono::{DateTime, Utc};
use rusqlite::{params, Connection, OptionalExtension};
use skiff_sync_protocol::{
    checksum, Checkpoint, Checksum, OpId, OpType, SyncDataBatch, SyncDataBucket,
    FULL_SYNC_PRIORITY,
};
use std::collections::{BTreeMap, BTreeSet};
use tracing::{debug, trace, warn};

/// Stored state of one bucket.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BucketState {
    /// Bucket name.
    pub name: String,
    /// Highest op id stored for the bucket.
    pub last_op: OpId,
    /// Highest op id applied to local tables.
    pub last_applied_op: OpId,
    /// Checksum contributions not attached to a live oplog row.
    pub add_checksum: Checksum,
    /// Sum of live oplog row checksums.
    pub op_checksum: Checksum,
    /// Bucket priority from the last full checkpoint.
    pub priority: i32,
    /// Operation count at the last completed checkpoint.
    pub count_at_last: i64,
    /// Operations received since the last completed checkpoint.
    pub count_since_last: i64,
}

impl BucketState {
    /// Returns the cached checksum of the bucket.
    pub fn checksum(&self) -> Checksum {
        self.add_checksum + self.op_checksum
    }
}

/// Outcome of validating a checkpoint.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ChecksumValidation {
    /// Whether every considered bucket matched.
    pub checkpoint_valid: bool,
    /// Buckets whose checksum did not match.
    pub failures: Vec<String>,
}

/// Result of [`BucketStorage::sync_local_database`].
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct SyncLocalResult {
    /// Whether the checkpoint checksums matched.
    pub checkpoint_valid: bool,
    /// Whether the checkpoint was applied to local tables.
    pub ready: bool,
    /// Buckets whose checksum did not match. They were removed.
    pub failures: Vec<String>,
}

/// Download counters of one bucket.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct LocalBucketProgress {
    /// Bucket priority.
    pub priority: i32,
    /// Operation count at the last completed checkpoint.
    pub at_last: i64,
    /// Operations received since then.
    pub since_last: i64,
}

/// Mark left by a completed sync at some priority.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SyncMark {
    /// Priority the sync covered. [`FULL_SYNC_PRIORITY`] for a complete sync.
    pub priority: i32,
    /// When it completed.
    pub synced_at: DateTime<Utc>,
}

struct BucketRow {
    id: i64,
    last_op: i64,
    add_checksum: i64,
    op_checksum: i64,
}

impl BucketStorage {
    /// Stores downloaded operations.
    ///
    /// The whole batch is written in one transaction. Operations at or
    /// below a bucket's stored op id are skipped, so a repeated batch has
    /// no effect. Op ids that decrease inside a bucket batch fail the
    /// whole batch with [`StorageError::OutOfOrder`].
    pub fn save_sync_data(&self, batch: &SyncDataBatch) -> StorageResult<()> {
        self.with_write_txn(|txn| {
            for bucket in &batch.buckets {
                save_bucket_data(txn, bucket)?;
            }
            Ok(())
        })?;
        trace!(operations = batch.operation_count(), "saved sync data");
        Ok(())
    }

    /// Drops buckets and their operations.
    ///
    /// Rows the buckets contributed to are re-evaluated on the next full
    /// sync, so rows also present in other buckets keep that data.
    pub fn remove_buckets(&self, names: &[String]) -> StorageResult<()> {
        if names.is_empty() {
            return Ok(());
        }
        self.with_write_txn(|txn| {
            for name in names {
                remove_bucket(txn, name)?;
            }
            Ok(())
        })?;
        debug!(buckets = ?names, "removed buckets");
        Ok(())
    }

    /// Returns stored bucket states ordered by name.
    pub fn bucket_states(&self) -> StorageResult<Vec<BucketState>> {
        let conn = self.lock_conn()?;
        let mut stmt = conn.prepare(
            "SELECT name, last_op, last_applied_op, add_checksum, op_checksum, priority,
                    count_at_last, count_since_last
             FROM ps_buckets ORDER BY name",
        )?;
        let states = stmt
            .query_map([], |row| {
                Ok(BucketState {
                    name: row.get(0)?,
                    last_op: OpId(row.get(1)?),
                    last_applied_op: OpId(row.get(2)?),
                    add_checksum: Checksum::from_i64(row.get(3)?),
                    op_checksum: Checksum::from_i64(row.get(4)?),
                    priority: row.get(5)?,
                    count_at_last: row.get(6)?,
                    count_since_last: row.get(7)?,
                })
            })?
            .collect::<Result<Vec<_>, _>>()?;
        Ok(states)
    }

    /// Compares stored checksums with a checkpoint.
    ///
    /// Checksums are recomputed from the oplog, not taken from the cached
    /// per-bucket sums. With a priority, only buckets at or above it count.
    pub fn validate_checksums(
        &self,
        checkpoint: &Checkpoint,
        priority: Option<i32>,
    ) -> StorageResult<ChecksumValidation> {
        let conn = self.lock_conn()?;
        validate(&conn, checkpoint, priority)
    }

    /// Validates a checkpoint and applies it to local tables if possible.
    ///
    /// On a checksum mismatch the failing buckets are removed and must be
    /// downloaded again from op id 0. A checkpoint that validates is only
    /// applied when no local writes are pending and the upload target has
    /// been reached, except for priority 0 which always applies.
    pub fn sync_local_database(
        &self,
        checkpoint: &Checkpoint,
        priority: Option<i32>,
    ) -> StorageResult<SyncLocalResult> {
        let validation = self.validate_checksums(checkpoint, priority)?;
        if !validation.checkpoint_valid {
            warn!(failures = ?validation.failures, "checksum mismatch, removing buckets");
            self.remove_buckets(&validation.failures)?;
            return Ok(SyncLocalResult {
                checkpoint_valid: false,
                ready: false,
                failures: validation.failures,
            });
        }

        let names: Vec<String> = checkpoint
            .buckets_up_to(priority)
            .map(|b| b.bucket.clone())
            .collect();
        let full = priority.is_none();

        let applied = self.with_write_txn(|txn| {
            for name in &names {
                txn.execute(
                    "UPDATE ps_buckets SET last_op = MAX(last_op, ?1) WHERE name = ?2",
                    params![checkpoint.last_op_id.value(), name],
                )?;
            }
            if full {
                if let Some(write_checkpoint) = checkpoint.write_checkpoint {
                    txn.execute(
                        "UPDATE ps_local_state SET last_op = MAX(last_op, ?1) WHERE id = 1",
                        [write_checkpoint.value()],
                    )?;
                }
            }

            if !can_apply(txn, priority)? {
                return Ok(None);
            }

            let tables = apply_operations(txn, &names, full)?;
            mark_applied(txn, checkpoint, &names, priority)?;
            Ok(Some(tables))
        })?;

        match applied {
            None => {
                debug!(?priority, "checkpoint valid but local writes are pending");
                Ok(SyncLocalResult {
                    checkpoint_valid: true,
                    ready: false,
                    failures: Vec::new(),
                })
            }
            Some(tables) => {
                debug!(?priority, tables = tables.len(), "applied checkpoint");
                self.change_feed().emit(TableUpdate::new(tables));
                Ok(SyncLocalResult {
                    checkpoint_valid: true,
                    ready: true,
                    failures: Vec::new(),
                })
            }
        }
    }

    /// Returns download counters per bucket.
    pub fn local_progress(&self) -> StorageResult<BTreeMap<String, LocalBucketProgress>> {
        Ok(self
            .bucket_states()?
            .into_iter()
            .map(|b| {
                (
                    b.name,
                    LocalBucketProgress {
                        priority: b.priority,
                        at_last: b.count_at_last,
                        since_last: b.count_since_last,
                    },
                )
            })
            .collect())
    }

    /// Returns true once a full checkpoint has been applied.
    pub fn has_completed_sync(&self) -> StorageResult<bool> {
        let conn = self.lock_conn()?;
        let found: Option<i64> = conn
            .query_row(
                "SELECT 1 FROM ps_sync_state WHERE priority = ?1",
                [FULL_SYNC_PRIORITY],
                |row| row.get(0),
            )
            .optional()?;
        Ok(found.is_some())
    }

    /// Returns the completed-sync marks, highest priority number first.
    pub fn sync_marks(&self) -> StorageResult<Vec<SyncMark>> {
        let conn = self.lock_conn()?;
        let mut stmt = conn
            .prepare("SELECT priority, last_synced_at FROM ps_sync_state ORDER BY priority DESC")?;
        let raw = stmt
            .query_map([], |row| Ok((row.get::<_, i32>(0)?, row.get::<_, String>(1)?)))?
            .collect::<Result<Vec<_>, _>>()?;
        Ok(raw
            .into_iter()
            .filter_map(|(priority, at)| {
                DateTime::parse_from_rfc3339(&at).ok().map(|t| SyncMark {
                    priority,
                    synced_at: t.with_timezone(&Utc),
                })
            })
            .collect())
    }
}

fn load_or_create_bucket(conn: &Connection, name: &str) -> StorageResult<BucketRow> {
    conn.execute("INSERT OR IGNORE INTO ps_buckets (name) VALUES (?1)", [name])?;
    let row = conn.query_row(
        "SELECT id, last_op, add_checksum, op_checksum FROM ps_buckets WHERE name = ?1",
        [name],
        |row| {
            Ok(BucketRow {
                id: row.get(0)?,
                last_op: row.get(1)?,
                add_checksum: row.get(2)?,
                op_checksum: row.get(3)?,
            })
        },
    )?;
    Ok(row)
}

fn save_bucket_data(conn: &Connection, data: &SyncDataBucket) -> StorageResult<()> {
    let bucket = load_or_create_bucket(conn, &data.bucket)?;
    let mut last_op = bucket.last_op;
    let mut add_checksum = bucket.add_checksum;
    let mut op_checksum = bucket.op_checksum;
    let mut previous: Option<OpId> = None;
    let mut applied: i64 = 0;
    let mut skipped: usize = 0;

    for entry in &data.data {
        if let Some(prev) = previous {
            if entry.op_id <= prev {
                return Err(StorageError::OutOfOrder {
                    bucket: data.bucket.clone(),
                    op_id: entry.op_id,
                    previous: prev,
                });
            }
        }
        previous = Some(entry.op_id);

        if entry.op_id.value() <= last_op {
            trace!(bucket = %data.bucket, op_id = %entry.op_id, "skipping known operation");
            skipped += 1;
            continue;
        }
        applied += 1;
        let hash = entry.checksum.as_i64();

        match entry.op {
            OpType::Put | OpType::Remove => {
                let key = entry.row_key();
                let superseded: Vec<i64> = conn
                    .prepare_cached("SELECT hash FROM ps_oplog WHERE bucket = ?1 AND key = ?2")?
                    .query_map(params![bucket.id, key], |row| row.get(0))?
                    .collect::<Result<_, _>>()?;
                for old_hash in &superseded {
                    add_checksum = checksum::add(add_checksum, *old_hash);
                    op_checksum = checksum::subtract(op_checksum, *old_hash);
                }
                if !superseded.is_empty() {
                    conn.execute(
                        "DELETE FROM ps_oplog WHERE bucket = ?1 AND key = ?2",
                        params![bucket.id, key],
                    )?;
                }

                if entry.op == OpType::Put {
                    conn.execute(
                        "INSERT INTO ps_oplog (bucket, op_id, row_type, row_id, key, data, hash)
                         VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7)",
                        params![
                            bucket.id,
                            entry.op_id.value(),
                            entry.object_type.as_deref().unwrap_or_default(),
                            entry.object_id.as_deref().unwrap_or_default(),
                            key,
                            entry.data,
                            hash
                        ],
                    )?;
                    op_checksum = checksum::add(op_checksum, hash);
                } else {
                    add_checksum = checksum::add(add_checksum, hash);
                    conn.execute(
                        "INSERT OR IGNORE INTO ps_updated_rows (row_type, row_id) VALUES (?1, ?2)",
                        params![
                            entry.object_type.as_deref().unwrap_or_default(),
                            entry.object_id.as_deref().unwrap_or_default()
                        ],
                    )?;
                }
            }
            OpType::Move => {
                add_checksum = checksum::add(add_checksum, hash);
            }
            OpType::Clear => {
                conn.execute(
                    "INSERT OR IGNORE INTO ps_updated_rows (row_type, row_id)
                     SELECT row_type, row_id FROM ps_oplog WHERE bucket = ?1",
                    [bucket.id],
                )?;
                conn.execute("DELETE FROM ps_oplog WHERE bucket = ?1", [bucket.id])?;
                conn.execute(
                    "UPDATE ps_buckets SET last_applied_op = 0 WHERE id = ?1",
                    [bucket.id],
                )?;
                add_checksum = hash;
                op_checksum = 0;
            }
        }
        last_op = entry.op_id.value();
    }

    // The batch checksum covers the whole batch, so a partly replayed batch
    // was already counted.
    if let Some(batch_checksum) = data.checksum {
        if applied > 0 && skipped == 0 {
            add_checksum = checksum::add(add_checksum, batch_checksum.as_i64());
        } else if applied > 0 {
            debug!(bucket = %data.bucket, skipped, "ignoring checksum of partly replayed batch");
        }
    }

    conn.execute(
        "UPDATE ps_buckets
         SET last_op = ?1, add_checksum = ?2, op_checksum = ?3,
             count_since_last = count_since_last + ?4
         WHERE id = ?5",
        params![last_op, add_checksum, op_checksum, applied, bucket.id],
    )?;
    Ok(())
}

fn remove_bucket(conn: &Connection, name: &str) -> StorageResult<()> {
    let id: Option<i64> = conn
        .query_row("SELECT id FROM ps_buckets WHERE name = ?1", [name], |row| {
            row.get(0)
        })
        .optional()?;
    let Some(id) = id else {
        return Ok(());
    };
    conn.execute(
        "INSERT OR IGNORE INTO ps_updated_rows (row_type, row_id)
         SELECT row_type, row_id FROM ps_oplog WHERE bucket = ?1",
        [id],
    )?;
    conn.execute("DELETE FROM ps_oplog WHERE bucket = ?1", [id])?;
    conn.execute("DELETE FROM ps_buckets WHERE id = ?1", [id])?;
    Ok(())
}

fn validate(
    conn: &Connection,
    checkpoint: &Checkpoint,
    priority: Option<i32>,
) -> StorageResult<ChecksumValidation> {
    let mut failures = Vec::new();
    for declared in checkpoint.buckets_up_to(priority) {
        let actual = recompute_checksum(conn, &declared.bucket)?;
        if actual != declared.checksum {
            debug!(
                bucket = %declared.bucket,
                expected = %declared.checksum,
                actual = %actual,
                "checksum mismatch"
            );
            failures.push(declared.bucket.clone());
        }
    }
    Ok(ChecksumValidation {
        checkpoint_valid: failures.is_empty(),
        failures,
    })
}

fn recompute_checksum(conn: &Connection, bucket: &str) -> StorageResult<Checksum> {
    let row: Option<(i64, i64)> = conn
        .query_row(
            "SELECT id, add_checksum FROM ps_buckets WHERE name = ?1",
            [bucket],
            |row| Ok((row.get(0)?, row.get(1)?)),
        )
        .optional()?;
    let Some((id, add_checksum)) = row else {
        return Ok(Checksum::ZERO);
    };

    let mut stmt = conn.prepare_cached("SELECT hash FROM ps_oplog WHERE bucket = ?1")?;
    let mut total = add_checksum;
    let hashes = stmt.query_map([id], |row| row.get::<_, i64>(0))?;
    for hash in hashes {
        total = checksum::add(total, hash?);
    }
    Ok(Checksum::from_i64(total))
}

fn can_apply(conn: &Connection, priority: Option<i32>) -> StorageResult<bool> {
    if priority == Some(0) {
        return Ok(true);
    }
    let pending: Option<i64> = conn
        .query_row("SELECT 1 FROM ps_crud LIMIT 1", [], |row| row.get(0))
        .optional()?;
    if pending.is_some() {
        return Ok(false);
    }
    Ok(read_local_state(conn)?.has_reached_target())
}

/// Rebuilds every row touched since the last application.
///
/// Each row takes the data of its newest live operation across the
/// considered buckets. Rows without any live operation are deleted.
fn apply_operations(conn: &Connection, buckets: &[String], full: bool) -> StorageResult<BTreeSet<String>> {
    let bucket_filter = if full {
        String::new()
    } else {
        let placeholders: Vec<String> = (1..=buckets.len()).map(|i| format!("?{i}")).collect();
        format!(" AND b.name IN ({})", placeholders.join(", "))
    };
    let params = rusqlite::params_from_iter(if full { &[][..] } else { buckets });

    let mut rows: BTreeSet<(String, String)> = BTreeSet::new();
    {
        let mut stmt = conn.prepare(&format!(
            "SELECT DISTINCT o.row_type, o.row_id FROM ps_oplog o
             JOIN ps_buckets b ON o.bucket = b.id
             WHERE o.op_id > b.last_applied_op{bucket_filter}"
        ))?;
        let touched = stmt.query_map(params, |row| Ok((row.get(0)?, row.get(1)?)))?;
        for row in touched {
            rows.insert(row?);
        }
    }
    if full {
        let mut stmt = conn.prepare("SELECT row_type, row_id FROM ps_updated_rows")?;
        let updated = stmt.query_map([], |row| Ok((row.get(0)?, row.get(1)?)))?;
        for row in updated {
            rows.insert(row?);
        }
    }

    let mut tables = BTreeSet::new();
    let latest_sql = format!(
        "SELECT o.data FROM ps_oplog o JOIN ps_buckets b ON o.bucket = b.id
         WHERE o.row_type = ?1 AND o.row_id = ?2{}
         ORDER BY o.op_id DESC LIMIT 1",
        if full {
            String::new()
        } else {
            let placeholders: Vec<String> =
                (3..buckets.len() + 3).map(|i| format!("?{i}")).collect();
            format!(" AND b.name IN ({})", placeholders.join(", "))
        }
    );

    for (row_type, row_id) in rows {
        let mut values: Vec<&str> = vec![row_type.as_str(), row_id.as_str()];
        if !full {
            values.extend(buckets.iter().map(String::as_str));
        }
        let latest: Option<Option<String>> = conn
            .query_row(&latest_sql, rusqlite::params_from_iter(values), |row| {
                row.get(0)
            })
            .optional()?;
        let data = latest.flatten();

        if schema::is_valid_table_name(&row_type) {
            let table = schema::ensure_data_table(conn, &row_type)?;
            match &data {
                Some(data) => conn.execute(
                    &format!("INSERT OR REPLACE INTO \"{table}\" (id, data) VALUES (?1, ?2)"),
                    params![row_id, data],
                )?,
                None => conn.execute(&format!("DELETE FROM \"{table}\" WHERE id = ?1"), [&row_id])?,
            };
            tables.insert(row_type);
        } else {
            match &data {
                Some(data) => conn.execute(
                    "INSERT OR REPLACE INTO ps_untyped (type, id, data) VALUES (?1, ?2, ?3)",
                    params![row_type, row_id, data],
                )?,
                None => conn.execute(
                    "DELETE FROM ps_untyped WHERE type = ?1 AND id = ?2",
                    params![row_type, row_id],
                )?,
            };
        }
    }
    Ok(tables)
}

fn mark_applied(
    conn: &Connection,
    checkpoint: &Checkpoint,
    buckets: &[String],
    priority: Option<i32>,
) -> StorageResult<()> {
    for name in buckets {
        conn.execute(
            "UPDATE ps_buckets SET last_applied_op = last_op WHERE name = ?1",
            [name],
        )?;
    }

    let now = Utc::now().to_rfc3339();
    match priority {
        None => {
            for declared in &checkpoint.buckets {
                conn.execute(
                    "UPDATE ps_buckets
                     SET priority = ?1,
                         count_at_last = COALESCE(?2, count_at_last + count_since_last),
                         count_since_last = 0
                     WHERE name = ?3",
                    params![declared.effective_priority(), declared.count, declared.bucket],
                )?;
            }
            conn.execute("DELETE FROM ps_updated_rows", [])?;
            conn.execute("DELETE FROM ps_sync_state", [])?;
            conn.execute(
                "INSERT INTO ps_sync_state (priority, last_synced_at) VALUES (?1, ?2)",
                params![FULL_SYNC_PRIORITY, now],
            )?;
        }
        Some(priority) => {
            conn.execute(
                "INSERT OR REPLACE INTO ps_sync_state (priority, last_synced_at) VALUES (?1, ?2)",
                params![priority, now],
            )?;
        }
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use skiff_sync_protocol::{BucketChecksum, OplogEntry};

    fn storage() -> BucketStorage {
        BucketStorage::in_memory().unwrap()
    }

    fn put(op_id: i64, id: &str, data: &str, hash: u32) -> OplogEntry {
        OplogEntry::put(op_id, "items", id, data, hash)
    }

    fn save(storage: &BucketStorage, bucket: &str, entries: Vec<OplogEntry>) {
        storage
            .save_sync_data(&SyncDataBucket::new(bucket, entries).into())
            .unwrap();
    }

    fn checkpoint(last_op_id: i64, buckets: &[(&str, u32)]) -> Checkpoint {
        Checkpoint::new(
            last_op_id,
            buckets
                .iter()
                .map(|(name, checksum)| BucketChecksum::new(*name, *checksum))
                .collect(),
        )
    }

    #[test]
    fn put_then_sync_materializes_row() {
        let storage = storage();
        save(&storage, "b1", vec![put(1, "r1", r#"{"name":"x"}"#, 10)]);

        let result = storage
            .sync_local_database(&checkpoint(1, &[("b1", 10)]), None)
            .unwrap();
        assert!(result.checkpoint_valid);
        assert!(result.ready);

        let row = storage.row("items", "r1").unwrap().unwrap();
        assert_eq!(row["name"], "x");
        assert!(storage.has_completed_sync().unwrap());
    }

    #[test]
    fn superseded_put_keeps_checksum_contribution() {
        let storage = storage();
        save(&storage, "b1", vec![put(1, "r1", r#"{"v":1}"#, 5)]);
        save(&storage, "b1", vec![put(2, "r1", r#"{"v":2}"#, 7)]);

        let state = &storage.bucket_states().unwrap()[0];
        assert_eq!(state.add_checksum, Checksum::new(5));
        assert_eq!(state.op_checksum, Checksum::new(7));
        assert_eq!(state.last_op, OpId(2));

        let result = storage
            .sync_local_database(&checkpoint(2, &[("b1", 12)]), None)
            .unwrap();
        assert!(result.ready);
        assert_eq!(storage.row("items", "r1").unwrap().unwrap()["v"], 2);
    }

    #[test]
    fn remove_deletes_row() {
        let storage = storage();
        save(&storage, "b1", vec![put(1, "r1", "{}", 1)]);
        storage
            .sync_local_database(&checkpoint(1, &[("b1", 1)]), None)
            .unwrap();

        save(&storage, "b1", vec![OplogEntry::remove(2, "items", "r1", 2u32)]);
        let result = storage
            .sync_local_database(&checkpoint(2, &[("b1", 3)]), None)
            .unwrap();
        assert!(result.ready);
        assert_eq!(storage.row("items", "r1").unwrap(), None);
    }

    #[test]
    fn clear_resets_bucket() {
        let storage = storage();
        save(&storage, "b1", vec![put(1, "r1", "{}", 1), put(2, "r2", "{}", 2)]);
        storage
            .sync_local_database(&checkpoint(2, &[("b1", 3)]), None)
            .unwrap();

        save(&storage, "b1", vec![OplogEntry::marker(3, OpType::Clear, 40u32)]);
        let result = storage
            .sync_local_database(&checkpoint(3, &[("b1", 40)]), None)
            .unwrap();
        assert!(result.ready);
        assert!(storage.rows("items").unwrap().is_empty());
    }

    #[test]
    fn move_only_changes_checksum() {
        let storage = storage();
        save(
            &storage,
            "b1",
            vec![put(1, "r1", "{}", 1), OplogEntry::marker(2, OpType::Move, 8u32)],
        );
        let validation = storage
            .validate_checksums(&checkpoint(2, &[("b1", 9)]), None)
            .unwrap();
        assert!(validation.checkpoint_valid);
    }

    #[test]
    fn mismatch_removes_failed_bucket() {
        let storage = storage();
        save(&storage, "good", vec![put(1, "a", "{}", 1)]);
        save(&storage, "bad", vec![put(2, "b", "{}", 2)]);

        let result = storage
            .sync_local_database(&checkpoint(2, &[("good", 1), ("bad", 99)]), None)
            .unwrap();
        assert!(!result.checkpoint_valid);
        assert!(!result.ready);
        assert_eq!(result.failures, vec!["bad".to_string()]);

        let names: Vec<String> = storage
            .bucket_states()
            .unwrap()
            .into_iter()
            .map(|b| b.name)
            .collect();
        assert_eq!(names, vec!["good".to_string()]);
    }

    #[test]
    fn duplicate_batch_is_ignored() {
        let storage = storage();
        let batch: SyncDataBatch = SyncDataBucket::new("b1", vec![put(1, "r1", "{}", 5)])
            .with_checksum(3u32)
            .into();
        storage.save_sync_data(&batch).unwrap();
        storage.save_sync_data(&batch).unwrap();

        let state = &storage.bucket_states().unwrap()[0];
        assert_eq!(state.checksum(), Checksum::new(8));
        assert_eq!(state.count_since_last, 1);
    }

    #[test]
    fn partly_replayed_batch_skips_batch_checksum() {
        let storage = storage();
        save(&storage, "b1", vec![put(1, "r1", "{}", 5)]);
        let batch: SyncDataBatch =
            SyncDataBucket::new("b1", vec![put(1, "r1", "{}", 5), put(2, "r2", "{}", 7)])
                .with_checksum(3u32)
                .into();
        storage.save_sync_data(&batch).unwrap();

        let state = &storage.bucket_states().unwrap()[0];
        assert_eq!(state.checksum(), Checksum::new(12));
        assert_eq!(state.last_op, OpId::from(2));
        assert_eq!(state.count_since_last, 2);
    }

    #[test]
    fn out_of_order_batch_is_rejected_atomically() {
        let storage = storage();
        let batch: SyncDataBatch = SyncDataBatch::new(vec![
            SyncDataBucket::new("a", vec![put(1, "r1", "{}", 1)]),
            SyncDataBucket::new("b", vec![put(5, "r2", "{}", 1), put(4, "r3", "{}", 1)]),
        ]);
        let err = storage.save_sync_data(&batch).unwrap_err();
        assert!(matches!(err, StorageError::OutOfOrder { .. }));
        assert!(storage.bucket_states().unwrap().is_empty());
    }

    #[test]
    fn row_shared_between_buckets_survives_removal() {
        let storage = storage();
        save(&storage, "a", vec![put(1, "r1", r#"{"from":"a"}"#, 1)]);
        save(&storage, "b", vec![put(2, "r1", r#"{"from":"b"}"#, 1)]);
        storage
            .sync_local_database(&checkpoint(2, &[("a", 1), ("b", 1)]), None)
            .unwrap();
        assert_eq!(storage.row("items", "r1").unwrap().unwrap()["from"], "b");

        storage.remove_buckets(&["b".to_string()]).unwrap();
        storage
            .sync_local_database(&checkpoint(3, &[("a", 1)]), None)
            .unwrap();
        assert_eq!(storage.row("items", "r1").unwrap().unwrap()["from"], "a");

        storage.remove_buckets(&["a".to_string()]).unwrap();
        storage.sync_local_database(&checkpoint(4, &[]), None).unwrap();
        assert_eq!(storage.row("items", "r1").unwrap(), None);
    }

    #[test]
    fn partial_sync_applies_only_priority_buckets() {
        let storage = storage();
        save(&storage, "urgent", vec![put(1, "u", "{}", 1)]);
        save(&storage, "later", vec![put(2, "l", "{}", 1)]);

        let checkpoint = Checkpoint::new(
            2,
            vec![
                BucketChecksum::new("urgent", 1u32).with_priority(1),
                BucketChecksum::new("later", 1u32).with_priority(3),
            ],
        );
        let result = storage.sync_local_database(&checkpoint, Some(1)).unwrap();
        assert!(result.ready);
        assert!(storage.row("items", "u").unwrap().is_some());
        assert!(storage.row("items", "l").unwrap().is_none());

        let marks = storage.sync_marks().unwrap();
        assert_eq!(marks.len(), 1);
        assert_eq!(marks[0].priority, 1);
        assert!(!storage.has_completed_sync().unwrap());
    }

    #[test]
    fn full_sync_records_counts() {
        let storage = storage();
        save(&storage, "b1", vec![put(1, "r1", "{}", 1), put(2, "r2", "{}", 1)]);
        let checkpoint = Checkpoint::new(2, vec![BucketChecksum::new("b1", 2u32).with_count(2)]);
        storage.sync_local_database(&checkpoint, None).unwrap();

        let state = &storage.bucket_states().unwrap()[0];
        assert_eq!(state.count_at_last, 2);
        assert_eq!(state.count_since_last, 0);
        assert_eq!(state.last_applied_op, OpId(2));

        save(&storage, "b1", vec![put(3, "r3", "{}", 1)]);
        let progress = storage.local_progress().unwrap();
        assert_eq!(progress["b1"].at_last, 2);
        assert_eq!(progress["b1"].since_last, 1);
    }

    #[test]
    fn untyped_rows_are_kept_aside() {
        let storage = storage();
        save(
            &storage,
            "b1",
            vec![OplogEntry::put(1, "weird-name", "x", "{}", 1u32)],
        );
        let result = storage
            .sync_local_database(&checkpoint(1, &[("b1", 1)]), None)
            .unwrap();
        assert!(result.ready);
        let rows = storage
            .get_all("SELECT type, id FROM ps_untyped", &[])
            .unwrap();
        assert_eq!(rows.len(), 1);
    }

    #[test]
    fn applied_checkpoint_notifies_tables() {
        let storage = storage();
        let rx = storage.subscribe_changes();
        save(&storage, "b1", vec![put(1, "r1", "{}", 1)]);
        storage
            .sync_local_database(&checkpoint(1, &[("b1", 1)]), None)
            .unwrap();

        let update = rx.try_recv().unwrap();
        assert!(update.contains("items"));
    }
}
