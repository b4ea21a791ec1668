//! Local write entries queued for upload.

use crate::error::{ProtocolError, ProtocolResult};
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use std::fmt;
use std::str::FromStr;

/// Type of a local write.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum UpdateType {
    /// Insert or replace a row.
    Put,
    /// Update some columns of a row.
    Patch,
    /// Delete a row.
    Delete,
}

impl UpdateType {
    /// Returns the wire name.
    pub fn as_str(&self) -> &'static str {
        match self {
            UpdateType::Put => "PUT",
            UpdateType::Patch => "PATCH",
            UpdateType::Delete => "DELETE",
        }
    }
}

impl FromStr for UpdateType {
    type Err = ProtocolError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "PUT" => Ok(UpdateType::Put),
            "PATCH" => Ok(UpdateType::Patch),
            "DELETE" => Ok(UpdateType::Delete),
            other => Err(ProtocolError::UnknownUpdateType(other.to_string())),
        }
    }
}

impl fmt::Display for UpdateType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Stored form of a queued write (the `data` column of the CRUD queue).
#[derive(Debug, Clone, Serialize, Deserialize)]
struct StoredCrud {
    op: UpdateType,
    #[serde(rename = "type")]
    table: String,
    id: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    data: Option<Map<String, Value>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    old: Option<Map<String, Value>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    metadata: Option<String>,
}

/// A local write waiting to be uploaded.
///
/// Entries are created in the same transaction as the write itself and
/// removed only after the connector confirms the upload.
#[derive(Debug, Clone, PartialEq)]
pub struct CrudEntry {
    /// Client-side id, strictly increasing and never reused.
    pub client_id: i64,
    /// Write type.
    pub op: UpdateType,
    /// Table name.
    pub table: String,
    /// Row id.
    pub id: String,
    /// Id of the local transaction that produced this write.
    pub transaction_id: Option<i64>,
    /// Changed columns. `None` for DELETE.
    pub op_data: Option<Map<String, Value>>,
    /// Previous values of the changed columns, when tracked.
    pub previous_values: Option<Map<String, Value>>,
    /// Application metadata attached to the write.
    pub metadata: Option<String>,
}

impl CrudEntry {
    /// Creates an entry. The client id is assigned by storage.
    pub fn new(
        op: UpdateType,
        table: impl Into<String>,
        id: impl Into<String>,
        op_data: Option<Map<String, Value>>,
    ) -> Self {
        Self {
            client_id: 0,
            op,
            table: table.into(),
            id: id.into(),
            transaction_id: None,
            op_data,
            previous_values: None,
            metadata: None,
        }
    }

    /// Sets the previous-value snapshot.
    #[must_use]
    pub fn with_previous_values(mut self, old: Option<Map<String, Value>>) -> Self {
        self.previous_values = old;
        self
    }

    /// Sets the metadata.
    #[must_use]
    pub fn with_metadata(mut self, metadata: Option<String>) -> Self {
        self.metadata = metadata;
        self
    }

    /// Decodes an entry from a CRUD queue row.
    pub fn from_row(client_id: i64, transaction_id: Option<i64>, data: &str) -> ProtocolResult<Self> {
        let stored: StoredCrud = serde_json::from_str(data)?;
        Ok(Self {
            client_id,
            op: stored.op,
            table: stored.table,
            id: stored.id,
            transaction_id,
            op_data: stored.data,
            previous_values: stored.old,
            metadata: stored.metadata,
        })
    }

    /// Encodes the part of the entry stored in the queue's `data` column.
    pub fn to_row_data(&self) -> ProtocolResult<String> {
        let stored = StoredCrud {
            op: self.op,
            table: self.table.clone(),
            id: self.id.clone(),
            data: self.op_data.clone(),
            old: self.previous_values.clone(),
            metadata: self.metadata.clone(),
        };
        Ok(serde_json::to_string(&stored)?)
    }

    /// Returns the JSON form handed to upload connectors.
    pub fn to_json(&self) -> Value {
        let mut object = Map::new();
        object.insert("op_id".into(), Value::from(self.client_id));
        object.insert("op".into(), Value::from(self.op.as_str()));
        object.insert("type".into(), Value::from(self.table.clone()));
        object.insert("id".into(), Value::from(self.id.clone()));
        if let Some(tx_id) = self.transaction_id {
            object.insert("tx_id".into(), Value::from(tx_id));
        }
        if let Some(data) = &self.op_data {
            object.insert("data".into(), Value::Object(data.clone()));
        }
        if let Some(old) = &self.previous_values {
            object.insert("old".into(), Value::Object(old.clone()));
        }
        if let Some(metadata) = &self.metadata {
            object.insert("metadata".into(), Value::from(metadata.clone()));
        }
        Value::Object(object)
    }
}
