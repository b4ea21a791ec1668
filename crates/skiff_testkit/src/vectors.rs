//! Shared test vectors.
//!
//! The sync service and every client must agree on these values exactly.

use serde::{Deserialize, Serialize};

/// A checksum arithmetic vector.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ChecksumVector {
    /// Unique identifier for this vector.
    pub id: String,
    /// Human-readable description.
    pub description: String,
    /// Left operand as stored (64-bit).
    pub a: i64,
    /// Right operand as stored (64-bit).
    pub b: i64,
    /// Expected `a + b` modulo 2^32.
    pub sum: u32,
    /// Expected `a - b` modulo 2^32.
    pub difference: u32,
}

/// Checksum arithmetic vectors.
pub fn checksum_vectors() -> Vec<ChecksumVector> {
    let vector = |id: &str, description: &str, a: i64, b: i64, sum: u32, difference: u32| {
        ChecksumVector {
            id: id.into(),
            description: description.into(),
            a,
            b,
            sum,
            difference,
        }
    };
    vec![
        vector("zero", "Zero operands", 0, 0, 0, 0),
        vector("small", "No wraparound", 5, 3, 8, 2),
        vector("underflow", "Difference wraps below zero", 1, 2, 3, 0xffff_ffff),
        vector("overflow", "Sum wraps at 2^32", 0xffff_ffff, 1, 0, 0xffff_fffe),
        vector("half", "Two halves wrap to zero", 0x8000_0000, 0x8000_0000, 0, 0),
        vector("negative", "Signed storage value", -1, 2, 1, 0xffff_fffd),
        vector("high_bits", "Bits above 32 are ignored", 0x1_0000_0005, 3, 8, 2),
    ]
}

/// A JSON checksum as sent by the service and its 32-bit value.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ChecksumJsonVector {
    /// Unique identifier for this vector.
    pub id: String,
    /// JSON literal.
    pub json: String,
    /// Expected 32-bit value.
    pub expected: u32,
}

/// Checksum decoding vectors.
pub fn checksum_json_vectors() -> Vec<ChecksumJsonVector> {
    [
        ("zero", "0", 0),
        ("positive", "123456", 123_456),
        ("signed_minus_one", "-1", 0xffff_ffff),
        ("signed_min", "-2147483648", 0x8000_0000),
        ("unsigned_max", "4294967295", 0xffff_ffff),
    ]
    .into_iter()
    .map(|(id, json, expected)| ChecksumJsonVector {
        id: id.into(),
        json: json.into(),
        expected,
    })
    .collect()
}

/// A response line and the kind of line it decodes to.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LineVector {
    /// Unique identifier for this vector.
    pub id: String,
    /// Raw line.
    pub line: String,
    /// Expected kind, named like the wire key (`checkpoint`, `data`, ...).
    pub kind: String,
}

/// Response line decoding vectors.
pub fn line_vectors() -> Vec<LineVector> {
    [
        (
            "wrapped_checkpoint",
            r#"{"checkpoint":{"last_op_id":"3","buckets":[{"bucket":"a","checksum":1}]}}"#,
            "checkpoint",
        ),
        (
            "bare_checkpoint",
            r#"{"last_op_id":"3","buckets":[]}"#,
            "checkpoint",
        ),
        (
            "checkpoint_diff",
            r#"{"checkpoint_diff":{"last_op_id":"4","updated_buckets":[],"removed_buckets":["a"]}}"#,
            "checkpoint_diff",
        ),
        (
            "wrapped_data",
            r#"{"data":{"bucket":"a","data":[{"op_id":"1","op":"PUT","object_type":"t","object_id":"x","checksum":5,"data":"{}"}]}}"#,
            "data",
        ),
        (
            "bare_data",
            r#"{"bucket":"a","data":[],"has_more":false}"#,
            "data",
        ),
        (
            "checkpoint_complete",
            r#"{"checkpoint_complete":{"last_op_id":"3"}}"#,
            "checkpoint_complete",
        ),
        (
            "partial_checkpoint_complete",
            r#"{"partial_checkpoint_complete":{"last_op_id":"3","priority":1}}"#,
            "partial_checkpoint_complete",
        ),
        ("keepalive", r#"{"token_expires_in":42}"#, "token_expires_in"),
        (
            "log",
            r#"{"log":{"severity":"warning","line":"slow query"}}"#,
            "log",
        ),
        ("unknown", r#"{"future_line":{}}"#, "unknown"),
    ]
    .into_iter()
    .map(|(id, line, kind)| LineVector {
        id: id.into(),
        line: line.into(),
        kind: kind.into(),
    })
    .collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashSet;

    #[test]
    fn vector_ids_are_unique() {
        let ids: HashSet<_> = checksum_vectors().into_iter().map(|v| v.id).collect();
        assert_eq!(ids.len(), checksum_vectors().len());
        let ids: HashSet<_> = line_vectors().into_iter().map(|v| v.id).collect();
        assert_eq!(ids.len(), line_vectors().len());
    }
}
