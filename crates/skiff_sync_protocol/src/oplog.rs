//! Bucket oplog entries and downloaded data batches.

use crate::checksum::Checksum;
use crate::error::ProtocolError;
use crate::op_id::OpId;
use serde::{Deserialize, Deserializer, Serialize};
use serde_json::value::RawValue;
use std::fmt;
use std::str::FromStr;

/// Kind of a bucket operation.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum OpType {
    /// Insert or replace a row.
    Put,
    /// Delete a row from this bucket.
    Remove,
    /// Compacted operation, only its checksum remains.
    Move,
    /// Drop everything in the bucket up to this point.
    Clear,
}

impl OpType {
    /// Returns the wire name of the operation.
    pub fn as_str(&self) -> &'static str {
        match self {
            OpType::Put => "PUT",
            OpType::Remove => "REMOVE",
            OpType::Move => "MOVE",
            OpType::Clear => "CLEAR",
        }
    }

    /// Returns true for operations that target a specific row.
    pub fn targets_row(&self) -> bool {
        matches!(self, OpType::Put | OpType::Remove)
    }
}

impl FromStr for OpType {
    type Err = ProtocolError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "PUT" => Ok(OpType::Put),
            "REMOVE" => Ok(OpType::Remove),
            "MOVE" => Ok(OpType::Move),
            "CLEAR" => Ok(OpType::Clear),
            other => Err(ProtocolError::UnknownOpType(other.to_string())),
        }
    }
}

impl fmt::Display for OpType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// A single operation in a bucket's oplog.
///
/// # Fields
///
/// - `op_id`: position in the bucket, strictly increasing
/// - `op`: PUT, REMOVE, MOVE or CLEAR
/// - `object_type` / `object_id`: target table and row for PUT and REMOVE
/// - `subkey`: distinguishes multiple contributions to one row from one bucket
/// - `data`: raw row payload, kept byte-for-byte as sent
/// - `checksum`: contribution of this operation to the bucket checksum
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct OplogEntry {
    /// Operation id.
    pub op_id: OpId,
    /// Operation kind.
    pub op: OpType,
    /// Target table.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub object_type: Option<String>,
    /// Target row id.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub object_id: Option<String>,
    /// Sub key within the row.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub subkey: Option<String>,
    /// Checksum contribution.
    #[serde(default)]
    pub checksum: Checksum,
    /// Raw row payload.
    #[serde(default, deserialize_with = "deserialize_payload")]
    pub data: Option<String>,
}

impl OplogEntry {
    /// Creates a PUT entry.
    pub fn put(
        op_id: impl Into<OpId>,
        table: impl Into<String>,
        id: impl Into<String>,
        data: impl Into<String>,
        checksum: impl Into<Checksum>,
    ) -> Self {
        Self {
            op_id: op_id.into(),
            op: OpType::Put,
            object_type: Some(table.into()),
            object_id: Some(id.into()),
            subkey: None,
            checksum: checksum.into(),
            data: Some(data.into()),
        }
    }

    /// Creates a REMOVE entry.
    pub fn remove(
        op_id: impl Into<OpId>,
        table: impl Into<String>,
        id: impl Into<String>,
        checksum: impl Into<Checksum>,
    ) -> Self {
        Self {
            op_id: op_id.into(),
            op: OpType::Remove,
            object_type: Some(table.into()),
            object_id: Some(id.into()),
            subkey: None,
            checksum: checksum.into(),
            data: None,
        }
    }

    /// Creates an entry that carries only an op id and checksum (MOVE or CLEAR).
    pub fn marker(op_id: impl Into<OpId>, op: OpType, checksum: impl Into<Checksum>) -> Self {
        Self {
            op_id: op_id.into(),
            op,
            object_type: None,
            object_id: None,
            subkey: None,
            checksum: checksum.into(),
            data: None,
        }
    }

    /// Sets the subkey.
    #[must_use]
    pub fn with_subkey(mut self, subkey: impl Into<String>) -> Self {
        self.subkey = Some(subkey.into());
        self
    }

    /// Returns the key that identifies the row contribution of this entry.
    ///
    /// Two entries with the same key in one bucket supersede each other.
    pub fn row_key(&self) -> String {
        format!(
            "{}/{}/{}",
            self.object_type.as_deref().unwrap_or_default(),
            self.object_id.as_deref().unwrap_or_default(),
            self.subkey.as_deref().unwrap_or_default()
        )
    }
}

/// Keeps payloads byte-for-byte.
///
/// With `raw_data` the service sends the row as a JSON string, whose content
/// is kept. Object payloads are kept as their raw JSON text.
fn deserialize_payload<'de, D>(deserializer: D) -> Result<Option<String>, D::Error>
where
    D: Deserializer<'de>,
{
    let raw: Option<Box<RawValue>> = Option::deserialize(deserializer)?;
    match raw {
        None => Ok(None),
        Some(raw) => {
            let text = raw.get();
            if text == "null" {
                Ok(None)
            } else if text.starts_with('"') {
                serde_json::from_str::<String>(text)
                    .map(Some)
                    .map_err(serde::de::Error::custom)
            } else {
                Ok(Some(text.to_string()))
            }
        }
    }
}

/// Operations for one bucket, as sent in a single data line.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SyncDataBucket {
    /// Bucket name.
    pub bucket: String,
    /// Operations in op id order.
    pub data: Vec<OplogEntry>,
    /// Whether more data follows for this bucket in the current checkpoint.
    #[serde(default)]
    pub has_more: bool,
    /// Op id the batch starts after.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub after: Option<OpId>,
    /// Op id to continue after.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub next_after: Option<OpId>,
    /// Checksum declared for the batch as a whole.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub checksum: Option<Checksum>,
}

impl SyncDataBucket {
    /// Creates a batch for one bucket.
    pub fn new(bucket: impl Into<String>, data: Vec<OplogEntry>) -> Self {
        Self {
            bucket: bucket.into(),
            data,
            has_more: false,
            after: None,
            next_after: None,
            checksum: None,
        }
    }

    /// Sets the batch-level checksum.
    #[must_use]
    pub fn with_checksum(mut self, checksum: impl Into<Checksum>) -> Self {
        self.checksum = Some(checksum.into());
        self
    }

    /// Returns the highest op id in the batch.
    pub fn last_op_id(&self) -> Option<OpId> {
        self.data.iter().map(|e| e.op_id).max()
    }
}

/// A set of bucket batches applied in one storage transaction.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct SyncDataBatch {
    /// Per-bucket batches.
    pub buckets: Vec<SyncDataBucket>,
}

impl SyncDataBatch {
    /// Creates a batch.
    pub fn new(buckets: Vec<SyncDataBucket>) -> Self {
        Self { buckets }
    }

    /// Total number of operations across all buckets.
    pub fn operation_count(&self) -> usize {
        self.buckets.iter().map(|b| b.data.len()).sum()
    }
}

impl From<SyncDataBucket> for SyncDataBatch {
    fn from(bucket: SyncDataBucket) -> Self {
        Self::new(vec![bucket])
    }
}
