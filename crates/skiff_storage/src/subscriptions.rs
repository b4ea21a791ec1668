//! Persisted stream subscriptions.

use crate::error::StorageResult;
use crate::storage::BucketStorage;
use chrono::{DateTime, Utc};
use rusqlite::{params, Connection, OptionalExtension, Row};
use serde_json::Value;
use std::time::Duration;

/// Stored state of one stream subscription.
#[derive(Debug, Clone, PartialEq)]
pub struct StreamSubscriptionRecord {
    /// Row id.
    pub id: i64,
    /// Stream name.
    pub name: String,
    /// Stream parameters, `None` when unparameterized.
    pub parameters: Option<Value>,
    /// Time to live after the last handle is dropped.
    pub ttl: Option<Duration>,
    /// Priority override requested by the application.
    pub priority: Option<i32>,
    /// Whether the service syncs this stream by default.
    pub is_default: bool,
    /// Whether the application subscribed explicitly.
    pub has_explicit_subscription: bool,
    /// When an inactive explicit subscription stops being requested.
    pub expires_at: Option<DateTime<Utc>>,
    /// Whether a checkpoint including this stream was applied.
    pub has_synced: bool,
    /// When that happened last.
    pub last_synced_at: Option<DateTime<Utc>>,
}

impl StreamSubscriptionRecord {
    /// Returns true if the subscription should be part of sync requests at `now`.
    pub fn is_requested(&self, now: DateTime<Utc>) -> bool {
        self.has_explicit_subscription && self.expires_at.map_or(true, |at| at > now)
    }
}

/// Canonical text form of stream parameters, used as part of the key.
pub fn parameters_key(parameters: Option<&Value>) -> String {
    match parameters {
        None | Some(Value::Null) => "null".to_string(),
        Some(value) => value.to_string(),
    }
}

impl BucketStorage {
    /// Records an explicit subscription and clears any pending expiry.
    pub fn upsert_subscription(
        &self,
        name: &str,
        parameters: Option<&Value>,
        ttl: Option<Duration>,
        priority: Option<i32>,
    ) -> StorageResult<StreamSubscriptionRecord> {
        let key = parameters_key(parameters);
        let ttl_secs = ttl.map(|t| i64::try_from(t.as_secs()).unwrap_or(i64::MAX));
        self.with_write_txn(|txn| {
            txn.execute(
                "INSERT INTO ps_stream_subscriptions
                     (stream_name, parameters, ttl_secs, priority, explicit, expires_at)
                 VALUES (?1, ?2, ?3, ?4, 1, NULL)
                 ON CONFLICT (stream_name, parameters) DO UPDATE SET
                     ttl_secs = excluded.ttl_secs,
                     priority = excluded.priority,
                     explicit = 1,
                     expires_at = NULL",
                params![name, key, ttl_secs, priority],
            )?;
            find(txn, name, &key)?.ok_or(crate::error::StorageError::NotFound)
        })
    }

    /// Starts the expiry of an explicit subscription whose last handle was dropped.
    pub fn expire_subscription(
        &self,
        name: &str,
        parameters: Option<&Value>,
        expires_at: DateTime<Utc>,
    ) -> StorageResult<()> {
        let conn = self.lock_conn()?;
        conn.execute(
            "UPDATE ps_stream_subscriptions SET expires_at = ?1
             WHERE stream_name = ?2 AND parameters = ?3",
            params![expires_at.to_rfc3339(), name, parameters_key(parameters)],
        )?;
        Ok(())
    }

    /// Drops the explicit flag. Default streams keep their row.
    pub fn remove_explicit_subscription(
        &self,
        name: &str,
        parameters: Option<&Value>,
    ) -> StorageResult<()> {
        self.with_write_txn(|txn| {
            let key = parameters_key(parameters);
            txn.execute(
                "UPDATE ps_stream_subscriptions SET explicit = 0, expires_at = NULL
                 WHERE stream_name = ?1 AND parameters = ?2",
                params![name, key],
            )?;
            txn.execute(
                "DELETE FROM ps_stream_subscriptions
                 WHERE stream_name = ?1 AND parameters = ?2 AND explicit = 0 AND is_default = 0",
                params![name, key],
            )?;
            Ok(())
        })
    }

    /// Looks up a subscription.
    pub fn subscription(
        &self,
        name: &str,
        parameters: Option<&Value>,
    ) -> StorageResult<Option<StreamSubscriptionRecord>> {
        let conn = self.lock_conn()?;
        find(&conn, name, &parameters_key(parameters))
    }

    /// Returns all stored subscriptions ordered by name.
    pub fn subscriptions(&self) -> StorageResult<Vec<StreamSubscriptionRecord>> {
        let conn = self.lock_conn()?;
        let mut stmt = conn.prepare(&format!("{SELECT} ORDER BY stream_name, parameters"))?;
        let records = stmt
            .query_map([], read_record)?
            .collect::<Result<Vec<_>, _>>()?;
        Ok(records)
    }

    /// Returns the explicit subscriptions to include in a request at `now`.
    pub fn requested_subscriptions(
        &self,
        now: DateTime<Utc>,
    ) -> StorageResult<Vec<StreamSubscriptionRecord>> {
        Ok(self
            .subscriptions()?
            .into_iter()
            .filter(|s| s.is_requested(now))
            .collect())
    }

    /// Replaces the set of default streams reported by the service.
    pub fn set_default_streams(&self, names: &[String]) -> StorageResult<()> {
        self.with_write_txn(|txn| {
            txn.execute("UPDATE ps_stream_subscriptions SET is_default = 0", [])?;
            for name in names {
                txn.execute(
                    "INSERT INTO ps_stream_subscriptions (stream_name, parameters, is_default)
                     VALUES (?1, 'null', 1)
                     ON CONFLICT (stream_name, parameters) DO UPDATE SET is_default = 1",
                    [name],
                )?;
            }
            txn.execute(
                "DELETE FROM ps_stream_subscriptions WHERE explicit = 0 AND is_default = 0",
                [],
            )?;
            Ok(())
        })
    }

    /// Marks the given subscriptions as synced at `at`.
    pub fn mark_subscriptions_synced(&self, ids: &[i64], at: DateTime<Utc>) -> StorageResult<()> {
        if ids.is_empty() {
            return Ok(());
        }
        self.with_write_txn(|txn| {
            let at = at.to_rfc3339();
            for id in ids {
                txn.execute(
                    "UPDATE ps_stream_subscriptions SET has_synced = 1, last_synced_at = ?1
                     WHERE id = ?2",
                    params![at, id],
                )?;
            }
            Ok(())
        })
    }

    /// Deletes explicit subscriptions that expired before `now`.
    ///
    /// Returns the number of rows removed.
    pub fn remove_expired_subscriptions(&self, now: DateTime<Utc>) -> StorageResult<usize> {
        let expired: Vec<i64> = self
            .subscriptions()?
            .into_iter()
            .filter(|s| s.has_explicit_subscription && !s.is_requested(now))
            .map(|s| s.id)
            .collect();
        if expired.is_empty() {
            return Ok(0);
        }
        self.with_write_txn(|txn| {
            for id in &expired {
                txn.execute(
                    "UPDATE ps_stream_subscriptions SET explicit = 0, expires_at = NULL WHERE id = ?1",
                    [id],
                )?;
            }
            txn.execute(
                "DELETE FROM ps_stream_subscriptions WHERE explicit = 0 AND is_default = 0",
                [],
            )?;
            Ok(expired.len())
        })
    }
}

const SELECT: &str = "SELECT id, stream_name, parameters, ttl_secs, priority, is_default, explicit,
        expires_at, has_synced, last_synced_at
 FROM ps_stream_subscriptions";

fn find(conn: &Connection, name: &str, key: &str) -> StorageResult<Option<StreamSubscriptionRecord>> {
    let record = conn
        .query_row(
            &format!("{SELECT} WHERE stream_name = ?1 AND parameters = ?2"),
            params![name, key],
            read_record,
        )
        .optional()?;
    Ok(record)
}

fn read_record(row: &Row<'_>) -> rusqlite::Result<StreamSubscriptionRecord> {
    let parameters: String = row.get(2)?;
    let ttl_secs: Option<i64> = row.get(3)?;
    Ok(StreamSubscriptionRecord {
        id: row.get(0)?,
        name: row.get(1)?,
        parameters: serde_json::from_str::<Value>(&parameters)
            .ok()
            .filter(|v| !v.is_null()),
        ttl: ttl_secs.map(|s| Duration::from_secs(u64::try_from(s).unwrap_or_default())),
        priority: row.get(4)?,
        is_default: row.get(5)?,
        has_explicit_subscription: row.get(6)?,
        expires_at: parse_time(row.get(7)?),
        has_synced: row.get(8)?,
        last_synced_at: parse_time(row.get(9)?),
    })
}

fn parse_time(text: Option<String>) -> Option<DateTime<Utc>> {
    text.and_then(|t| DateTime::parse_from_rfc3339(&t).ok())
        .map(|t| t.with_timezone(&Utc))
}
