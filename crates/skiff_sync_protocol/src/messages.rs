//! Streaming sync request and response lines.

use crate::checksum::Checksum;
use crate::error::{ProtocolError, ProtocolResult};
use crate::op_id::OpId;
use crate::oplog::SyncDataBucket;
use crate::FALLBACK_PRIORITY;
use serde::{Deserialize, Serialize};
use serde_json::value::RawValue;
use serde_json::{Map, Value};
use std::collections::{BTreeMap, HashMap};

/// Position of one bucket in a stream request.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct BucketRequest {
    /// Bucket name.
    pub name: String,
    /// Last op id the client already has.
    pub after: OpId,
}

/// An explicit stream subscription sent with a request.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StreamSubscriptionRequest {
    /// Stream name.
    pub stream: String,
    /// Stream parameters.
    #[serde(default)]
    pub parameters: Option<Value>,
    /// Priority override chosen by the client.
    #[serde(default)]
    pub override_priority: Option<i32>,
}

/// Stream subscriptions sent with a request.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct RequestedStreams {
    /// Whether the service should also sync streams marked as default.
    pub include_defaults: bool,
    /// Explicit subscriptions, referenced by index from checkpoints.
    pub subscriptions: Vec<StreamSubscriptionRequest>,
}

/// Body of the long-lived streaming request.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StreamingSyncRequest {
    /// Known buckets and the op id to resume after.
    pub buckets: Vec<BucketRequest>,
    /// Ask the service to include bucket checksums in checkpoints.
    pub include_checksum: bool,
    /// Ask for row payloads as unparsed JSON strings.
    pub raw_data: bool,
    /// Client parameters for bucket computation.
    #[serde(default)]
    pub parameters: Map<String, Value>,
    /// Persistent client id.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub client_id: Option<String>,
    /// Stream subscriptions.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub streams: Option<RequestedStreams>,
}

impl StreamingSyncRequest {
    /// Creates a request for the given buckets.
    pub fn new(buckets: Vec<BucketRequest>) -> Self {
        Self {
            buckets,
            include_checksum: true,
            raw_data: true,
            parameters: Map::new(),
            client_id: None,
            streams: None,
        }
    }

    /// Returns the resume position for a bucket, if requested.
    pub fn after(&self, bucket: &str) -> Option<OpId> {
        self.buckets.iter().find(|b| b.name == bucket).map(|b| b.after)
    }
}

/// Why a bucket is part of a checkpoint.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum BucketSubscriptionReason {
    /// Included by a default stream, indexing [`Checkpoint::streams`].
    #[serde(rename = "default")]
    DefaultStream(usize),
    /// Included by an explicit subscription, indexing the request's subscriptions.
    #[serde(rename = "sub")]
    ExplicitSubscription(usize),
}

/// Declared state of one bucket in a checkpoint.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct BucketChecksum {
    /// Bucket name.
    pub bucket: String,
    /// Expected checksum over everything up to the checkpoint.
    pub checksum: Checksum,
    /// Bucket priority.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub priority: Option<i32>,
    /// Number of operations in the bucket.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub count: Option<i64>,
    /// Last op id of the bucket.
    #[serde(default, alias = "op_id", skip_serializing_if = "Option::is_none")]
    pub last_op_id: Option<OpId>,
    /// Stream subscriptions that caused the bucket to be synced.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub subscriptions: Option<Vec<BucketSubscriptionReason>>,
}

impl BucketChecksum {
    /// Creates a bucket checksum with fallback priority.
    pub fn new(bucket: impl Into<String>, checksum: impl Into<Checksum>) -> Self {
        Self {
            bucket: bucket.into(),
            checksum: checksum.into(),
            priority: None,
            count: None,
            last_op_id: None,
            subscriptions: None,
        }
    }

    /// Sets the priority.
    #[must_use]
    pub fn with_priority(mut self, priority: i32) -> Self {
        self.priority = Some(priority);
        self
    }

    /// Sets the operation count.
    #[must_use]
    pub fn with_count(mut self, count: i64) -> Self {
        self.count = Some(count);
        self
    }

    /// Returns the priority, defaulting to [`FALLBACK_PRIORITY`].
    pub fn effective_priority(&self) -> i32 {
        self.priority.unwrap_or(FALLBACK_PRIORITY)
    }
}

/// A stream the service considers for this client.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StreamDescription {
    /// Stream name.
    pub name: String,
    /// Whether the stream is synced without an explicit subscription.
    #[serde(default)]
    pub is_default: bool,
    /// Errors the service reported for the stream.
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub errors: Vec<Value>,
}

/// A target state the client must reach and validate.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Checkpoint {
    /// Op id of the checkpoint.
    #[serde(default)]
    pub last_op_id: OpId,
    /// Write checkpoint covering uploads acknowledged by the service.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub write_checkpoint: Option<OpId>,
    /// Declared bucket states.
    pub buckets: Vec<BucketChecksum>,
    /// Streams relevant for this client.
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub streams: Vec<StreamDescription>,
}

impl Checkpoint {
    /// Creates a checkpoint.
    pub fn new(last_op_id: impl Into<OpId>, buckets: Vec<BucketChecksum>) -> Self {
        Self {
            last_op_id: last_op_id.into(),
            write_checkpoint: None,
            buckets,
            streams: Vec::new(),
        }
    }

    /// Sets the write checkpoint.
    #[must_use]
    pub fn with_write_checkpoint(mut self, write_checkpoint: impl Into<OpId>) -> Self {
        self.write_checkpoint = Some(write_checkpoint.into());
        self
    }

    /// Returns the declared state of a bucket.
    pub fn bucket(&self, name: &str) -> Option<&BucketChecksum> {
        self.buckets.iter().find(|b| b.bucket == name)
    }

    /// Returns the buckets at or above the given priority.
    pub fn buckets_up_to(&self, priority: Option<i32>) -> impl Iterator<Item = &BucketChecksum> {
        self.buckets
            .iter()
            .filter(move |b| priority.map_or(true, |p| b.effective_priority() <= p))
    }

    /// Fills in a missing `last_op_id` from the per-bucket op ids.
    fn normalized(mut self) -> Self {
        if self.last_op_id == OpId::ZERO {
            if let Some(max) = self.buckets.iter().filter_map(|b| b.last_op_id).max() {
                self.last_op_id = max;
            }
        }
        self
    }

    /// Produces the checkpoint that results from applying a diff.
    pub fn apply_diff(&self, diff: &CheckpointDiff) -> Checkpoint {
        let mut by_name: BTreeMap<&str, BucketChecksum> = self
            .buckets
            .iter()
            .map(|b| (b.bucket.as_str(), b.clone()))
            .collect();
        for updated in &diff.updated_buckets {
            by_name.insert(updated.bucket.as_str(), updated.clone());
        }
        for removed in &diff.removed_buckets {
            by_name.remove(removed.as_str());
        }

        Checkpoint {
            last_op_id: diff.last_op_id,
            write_checkpoint: diff.write_checkpoint,
            buckets: by_name.into_values().collect(),
            streams: self.streams.clone(),
        }
    }
}

/// Incremental update to the current target checkpoint.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CheckpointDiff {
    /// New checkpoint op id.
    pub last_op_id: OpId,
    /// Buckets that were added or changed.
    #[serde(default)]
    pub updated_buckets: Vec<BucketChecksum>,
    /// Buckets that are no longer part of the checkpoint.
    #[serde(default)]
    pub removed_buckets: Vec<String>,
    /// Write checkpoint.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub write_checkpoint: Option<OpId>,
}

/// All data for the current checkpoint has been sent.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct CheckpointComplete {
    /// Op id of the completed checkpoint.
    pub last_op_id: OpId,
}

/// All data up to a priority has been sent.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct PartialCheckpointComplete {
    /// Op id of the checkpoint.
    pub last_op_id: OpId,
    /// Highest priority number included.
    pub priority: i32,
}

/// Severity of a server log line.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum LogSeverity {
    /// Debug output.
    Debug,
    /// Informational.
    Info,
    /// Warning.
    Warning,
    /// Error.
    Error,
}

/// A log message sent by the service.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct LogLine {
    /// Severity.
    pub severity: LogSeverity,
    /// Message.
    pub line: String,
}

/// One decoded line of the response stream.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum SyncLine {
    /// New target checkpoint.
    Checkpoint(Checkpoint),
    /// Change to the target checkpoint.
    CheckpointDiff(CheckpointDiff),
    /// Checkpoint fully downloaded.
    CheckpointComplete(CheckpointComplete),
    /// Priority level fully downloaded.
    PartialCheckpointComplete(PartialCheckpointComplete),
    /// Operations for one bucket.
    Data(SyncDataBucket),
    /// Keepalive carrying the remaining token lifetime in seconds.
    #[serde(rename = "token_expires_in")]
    KeepAlive(i64),
    /// Server log message.
    Log(LogLine),
    /// A line this client does not understand.
    #[serde(skip_serializing)]
    Unknown(String),
}

impl SyncLine {
    /// Decodes one response line.
    ///
    /// Accepts the wrapped form (`{"checkpoint": {...}}`) and the bare
    /// form of data batches and checkpoints.
    pub fn parse(line: &str) -> ProtocolResult<SyncLine> {
        let fields: HashMap<String, Box<RawValue>> = serde_json::from_str(line)?;

        if fields.contains_key("bucket") {
            return Ok(SyncLine::Data(serde_json::from_str(line)?));
        }
        if let Some(raw) = fields.get("checkpoint") {
            let checkpoint: Checkpoint = serde_json::from_str(raw.get())?;
            return Ok(SyncLine::Checkpoint(checkpoint.normalized()));
        }
        if let Some(raw) = fields.get("checkpoint_diff") {
            return Ok(SyncLine::CheckpointDiff(serde_json::from_str(raw.get())?));
        }
        if let Some(raw) = fields.get("checkpoint_complete") {
            return Ok(SyncLine::CheckpointComplete(serde_json::from_str(raw.get())?));
        }
        if let Some(raw) = fields.get("partial_checkpoint_complete") {
            return Ok(SyncLine::PartialCheckpointComplete(serde_json::from_str(
                raw.get(),
            )?));
        }
        if let Some(raw) = fields.get("data") {
            return Ok(SyncLine::Data(serde_json::from_str(raw.get())?));
        }
        if let Some(raw) = fields.get("token_expires_in") {
            return Ok(SyncLine::KeepAlive(serde_json::from_str(raw.get())?));
        }
        if let Some(raw) = fields.get("log") {
            return Ok(SyncLine::Log(serde_json::from_str(raw.get())?));
        }
        if fields.contains_key("buckets") {
            let checkpoint: Checkpoint = serde_json::from_str(line)?;
            return Ok(SyncLine::Checkpoint(checkpoint.normalized()));
        }

        match fields.keys().min() {
            Some(key) => Ok(SyncLine::Unknown(key.clone())),
            None => Err(ProtocolError::MalformedLine(line.to_string())),
        }
    }

    /// Encodes the line in wrapped form.
    pub fn to_json_line(&self) -> ProtocolResult<String> {
        Ok(serde_json::to_string(self)?)
    }
}

/// Response of the write checkpoint endpoint.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct WriteCheckpointResponse {
    /// Response payload.
    pub data: WriteCheckpointData,
}

/// Payload of [`WriteCheckpointResponse`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct WriteCheckpointData {
    /// Op id that covers every upload acknowledged so far.
    pub write_checkpoint: OpId,
}
