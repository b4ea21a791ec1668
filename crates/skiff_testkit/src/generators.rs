//! Property-based test generators using proptest.
//!
//! Oplog strategies produce entries with strictly increasing op ids and
//! checksums derived from the payload, so the expected bucket checksum can
//! be computed independently of storage.

use proptest::prelude::*;
use serde_json::{Map, Value};
use skiff_sync_protocol::{checksum, Checksum, OpType, OplogEntry};

/// Strategy for bucket names.
pub fn bucket_name_strategy() -> impl Strategy<Value = String> {
    prop::string::string_regex("[a-z][a-z0-9_]{0,15}").expect("Invalid regex")
}

/// Strategy for valid table names.
pub fn table_name_strategy() -> impl Strategy<Value = String> {
    prop::string::string_regex("[a-z][a-z0-9_]{0,11}").expect("Invalid regex")
}

/// Strategy for row ids. Drawn from a small space so ops collide on rows.
pub fn row_id_strategy() -> impl Strategy<Value = String> {
    (0u8..8).prop_map(|n| format!("row_{n}"))
}

/// Strategy for row contents.
pub fn row_data_strategy() -> impl Strategy<Value = Map<String, Value>> {
    prop::collection::btree_map(
        prop::string::string_regex("[a-z]{1,6}").expect("Invalid regex"),
        prop_oneof![
            any::<i64>().prop_map(Value::from),
            "[a-zA-Z0-9 ]{0,12}".prop_map(Value::from),
            any::<bool>().prop_map(Value::from),
        ],
        0..4,
    )
    .prop_map(|entries| entries.into_iter().collect())
}

/// Strategy for arbitrary checksums.
pub fn checksum_strategy() -> impl Strategy<Value = Checksum> {
    any::<u32>().prop_map(Checksum::new)
}

/// FNV-1a over the payload bytes, used as the op checksum in generated data.
pub fn payload_checksum(data: &str) -> Checksum {
    let hash = data.bytes().fold(0x811c_9dc5u32, |hash, byte| {
        (hash ^ u32::from(byte)).wrapping_mul(0x0100_0193)
    });
    Checksum::new(hash)
}

#[derive(Debug, Clone)]
enum GeneratedOp {
    Put(String, Map<String, Value>),
    Remove(String),
    Move(Checksum),
}

fn generated_op_strategy() -> impl Strategy<Value = GeneratedOp> {
    prop_oneof![
        6 => (row_id_strategy(), row_data_strategy())
            .prop_map(|(id, data)| GeneratedOp::Put(id, data)),
        2 => row_id_strategy().prop_map(GeneratedOp::Remove),
        1 => checksum_strategy().prop_map(GeneratedOp::Move),
    ]
}

/// Strategy for an oplog of one bucket writing into `table`.
///
/// Op ids start at 1 and increase by at least one.
pub fn oplog_strategy(
    table: &'static str,
    len: std::ops::Range<usize>,
) -> impl Strategy<Value = Vec<OplogEntry>> {
    prop::collection::vec((generated_op_strategy(), 1i64..4), len).prop_map(move |ops| {
        let mut op_id = 0;
        ops.into_iter()
            .map(|(op, step)| {
                op_id += step;
                match op {
                    GeneratedOp::Put(id, data) => {
                        let data = Value::Object(data).to_string();
                        let checksum = payload_checksum(&data);
                        OplogEntry::put(op_id, table, id, data, checksum)
                    }
                    GeneratedOp::Remove(id) => {
                        let checksum = payload_checksum(&id);
                        OplogEntry::remove(op_id, table, id, checksum)
                    }
                    GeneratedOp::Move(checksum) => {
                        OplogEntry::marker(op_id, OpType::Move, checksum)
                    }
                }
            })
            .collect()
    })
}

/// Bucket checksum the service would declare after `entries`.
pub fn expected_checksum<'a>(entries: impl IntoIterator<Item = &'a OplogEntry>) -> Checksum {
    let total = entries.into_iter().fold(0i64, |total, entry| {
        if entry.op == OpType::Clear {
            entry.checksum.as_i64()
        } else {
            checksum::add(total, entry.checksum.as_i64())
        }
    });
    Checksum::from_i64(total)
}

/// Rows expected in `table` after applying `entries` from a single bucket.
pub fn expected_rows<'a>(
    entries: impl IntoIterator<Item = &'a OplogEntry>,
) -> std::collections::BTreeMap<String, Map<String, Value>> {
    let mut rows = std::collections::BTreeMap::new();
    for entry in entries {
        let Some(id) = entry.object_id.clone() else {
            if entry.op == OpType::Clear {
                rows.clear();
            }
            continue;
        };
        match entry.op {
            OpType::Put => {
                let data = entry
                    .data
                    .as_deref()
                    .and_then(|d| serde_json::from_str(d).ok())
                    .unwrap_or_default();
                rows.insert(id, data);
            }
            OpType::Remove => {
                rows.remove(&id);
            }
            OpType::Move | OpType::Clear => {}
        }
    }
    rows
}

/// A local write generated for CRUD queue tests.
#[derive(Debug, Clone)]
pub enum LocalWrite {
    /// Insert or replace a row.
    Put(String, Map<String, Value>),
    /// Merge columns into a row.
    Patch(String, Map<String, Value>),
    /// Delete a row.
    Delete(String),
}

/// Strategy for local writes against a small set of rows.
pub fn local_write_strategy() -> impl Strategy<Value = LocalWrite> {
    prop_oneof![
        3 => (row_id_strategy(), row_data_strategy()).prop_map(|(id, d)| LocalWrite::Put(id, d)),
        2 => (row_id_strategy(), row_data_strategy()).prop_map(|(id, d)| LocalWrite::Patch(id, d)),
        1 => row_id_strategy().prop_map(LocalWrite::Delete),
    ]
}

/// Strategy for a sequence of local transactions.
pub fn local_transactions_strategy(
    transactions: std::ops::Range<usize>,
) -> impl Strategy<Value = Vec<Vec<LocalWrite>>> {
    prop::collection::vec(prop::collection::vec(local_write_strategy(), 1..5), transactions)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn payload_checksum_is_stable() {
        assert_eq!(payload_checksum(""), Checksum::new(0x811c_9dc5));
        assert_eq!(payload_checksum("a"), Checksum::new(0xe40c_292c));
    }

    #[test]
    fn expected_checksum_resets_on_clear() {
        let entries = vec![
            OplogEntry::put(1, "t", "a", "{}", 10u32),
            OplogEntry::marker(2, OpType::Clear, 3u32),
            OplogEntry::marker(3, OpType::Move, 4u32),
        ];
        assert_eq!(expected_checksum(&entries), Checksum::new(7));
    }

    proptest! {
        #[test]
        fn oplog_ids_increase(entries in oplog_strategy("items", 1..20)) {
            for pair in entries.windows(2) {
                prop_assert!(pair[0].op_id < pair[1].op_id);
            }
        }
    }
}
