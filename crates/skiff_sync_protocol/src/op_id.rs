//! Operation identifiers.

use crate::error::ProtocolError;
use serde::de::{self, Visitor};
use serde::{Deserialize, Deserializer, Serialize, Serializer};
use std::fmt;
use std::str::FromStr;

/// Largest possible op id.
///
/// Used as the local target while a write checkpoint is still unknown.
pub const MAX_OP_ID: OpId = OpId(i64::MAX);

/// A 64-bit operation id assigned by the sync service.
///
/// Serialized as a decimal string. Both strings and JSON integers are
/// accepted when decoding.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct OpId(pub i64);

impl OpId {
    /// The op id before any operation.
    pub const ZERO: OpId = OpId(0);

    /// Returns the raw integer.
    #[must_use]
    pub const fn value(self) -> i64 {
        self.0
    }
}

impl From<i64> for OpId {
    fn from(value: i64) -> Self {
        Self(value)
    }
}

impl FromStr for OpId {
    type Err = ProtocolError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        s.trim()
            .parse::<i64>()
            .map(OpId)
            .map_err(|_| ProtocolError::InvalidOpId(s.to_string()))
    }
}

impl fmt::Display for OpId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl Serialize for OpId {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.collect_str(&self.0)
    }
}

struct OpIdVisitor;

impl Visitor<'_> for OpIdVisitor {
    type Value = OpId;

    fn expecting(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str("an op id as a decimal string or integer")
    }

    fn visit_i64<E: de::Error>(self, v: i64) -> Result<OpId, E> {
        Ok(OpId(v))
    }

    fn visit_u64<E: de::Error>(self, v: u64) -> Result<OpId, E> {
        i64::try_from(v)
            .map(OpId)
            .map_err(|_| E::custom(format!("op id out of range: {v}")))
    }

    fn visit_str<E: de::Error>(self, v: &str) -> Result<OpId, E> {
        v.parse().map_err(E::custom)
    }
}

impl<'de> Deserialize<'de> for OpId {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        deserializer.deserialize_any(OpIdVisitor)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn decodes_strings_and_numbers() {
        let from_str: OpId = serde_json::from_str("\"42\"").unwrap();
        let from_num: OpId = serde_json::from_str("42").unwrap();
        assert_eq!(from_str, OpId(42));
        assert_eq!(from_num, OpId(42));
    }

    #[test]
    fn encodes_as_string() {
        assert_eq!(serde_json::to_string(&OpId(7)).unwrap(), "\"7\"");
        assert_eq!(
            serde_json::to_string(&MAX_OP_ID).unwrap(),
            "\"9223372036854775807\""
        );
    }

    #[test]
    fn rejects_garbage() {
        assert!(serde_json::from_str::<OpId>("\"x1\"").is_err());
        assert!(serde_json::from_str::<OpId>("18446744073709551615").is_err());
        assert!("".parse::<OpId>().is_err());
    }
}
