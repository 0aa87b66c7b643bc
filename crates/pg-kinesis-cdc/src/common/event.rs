//! Row-change model and the outbound JSON envelope.
//!
//! A [`ChangeEvent`] is the immutable record of one row change after
//! filtering: operation kind, schema-qualified relation, the per-column
//! old/new values, and the LSN the driver attached at ingest. Per-column
//! population follows the upstream semantics:
//!
//! - DELETE carries only `old`
//! - INSERT carries only `new`
//! - UPDATE carries `new` always, and `old` only for columns whose
//!   textual value changed
//!
//! [`ChangeEvent::encode`] serializes the canonical envelope:
//!
//! ```json
//! {"lsn":"0/1A0","table":"public.users","operation":"INSERT",
//!  "columns":{"id":{"new":{"v":"7","t":"integer","q":"false"}}}}
//! ```
//!
//! `q` is the *string* `"true"` or `"false"`, matching what downstream
//! consumers already parse. Column key order is unordered-map semantics.

use crate::common::{BridgeError, Lsn, Result};
use bytes::Bytes;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::fmt;

/// Maximum size of one encoded record. Larger records are rejected with a
/// non-retryable error.
pub const MAX_RECORD_BYTES: usize = 1 << 20; // 1MiB

/// Row-change operation kind. Transaction markers (BEGIN/COMMIT) are
/// dropped before an event is built.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Operation {
    Insert,
    Update,
    Delete,
}

impl Operation {
    pub fn as_str(&self) -> &'static str {
        match self {
            Operation::Insert => "INSERT",
            Operation::Update => "UPDATE",
            Operation::Delete => "DELETE",
        }
    }
}

impl fmt::Display for Operation {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// One column value as decoded from the wire: the literal text, the
/// declared SQL type, and whether the wire format quoted it.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ColumnValue {
    pub value: String,
    pub sql_type: String,
    pub quoted: bool,
}

impl ColumnValue {
    pub fn new(value: impl Into<String>, sql_type: impl Into<String>, quoted: bool) -> Self {
        Self {
            value: value.into(),
            sql_type: sql_type.into(),
            quoted,
        }
    }
}

/// Raw row images produced by the parser: the current tuple and, for
/// UPDATEs with a replica identity, the old key tuple.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct RowChange {
    pub current: HashMap<String, ColumnValue>,
    pub old: HashMap<String, ColumnValue>,
}

/// Old/new pair for one column after the population rule was applied.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ColumnTuple {
    pub new: Option<ColumnValue>,
    pub old: Option<ColumnValue>,
}

/// An immutable record of one row change.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ChangeEvent {
    pub op: Operation,
    pub relation: String,
    pub columns: HashMap<String, ColumnTuple>,
    pub lsn: Lsn,
}

impl ChangeEvent {
    /// Build an event from parsed row images, applying the old/new
    /// population rule for the operation kind.
    pub fn from_row(op: Operation, relation: impl Into<String>, row: RowChange, lsn: Lsn) -> Self {
        let mut old_columns = row.old;
        let columns = row
            .current
            .into_iter()
            .map(|(name, value)| {
                let tuple = match op {
                    Operation::Delete => ColumnTuple {
                        new: None,
                        old: Some(value),
                    },
                    Operation::Insert => ColumnTuple {
                        new: Some(value),
                        old: None,
                    },
                    Operation::Update => {
                        let old = old_columns
                            .remove(&name)
                            .filter(|old| old.value != value.value);
                        ColumnTuple {
                            new: Some(value),
                            old,
                        }
                    }
                };
                (name, tuple)
            })
            .collect();

        Self {
            op,
            relation: relation.into(),
            columns,
            lsn,
        }
    }

    /// Serialize the canonical JSON envelope.
    ///
    /// Fails with [`BridgeError::OversizedRecord`] when the payload
    /// exceeds [`MAX_RECORD_BYTES`]; that error is non-retryable.
    pub fn encode(&self) -> Result<OutgoingRecord> {
        let payload = serde_json::to_vec(&Envelope::from_event(self))?;
        if payload.len() > MAX_RECORD_BYTES {
            return Err(BridgeError::OversizedRecord {
                bytes: payload.len(),
            });
        }
        Ok(OutgoingRecord {
            payload: Bytes::from(payload),
            partition_key: self.relation.clone(),
            lsn: self.lsn,
        })
    }
}

/// An encoded record ready for the batch publisher. The partition key is
/// the qualified relation name, so one table's changes stay ordered
/// within a shard.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct OutgoingRecord {
    pub payload: Bytes,
    pub partition_key: String,
    pub lsn: Lsn,
}

/// Wire shape of the outbound envelope. Kept as its own serde type so
/// the round trip (encode → parse → equivalent event) is testable.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct Envelope {
    pub lsn: String,
    pub table: String,
    pub operation: String,
    pub columns: HashMap<String, EnvelopeColumn>,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct EnvelopeColumn {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub new: Option<EnvelopeValue>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub old: Option<EnvelopeValue>,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct EnvelopeValue {
    pub v: String,
    pub t: String,
    pub q: String,
}

impl EnvelopeValue {
    fn from_column(value: &ColumnValue) -> Self {
        Self {
            v: value.value.clone(),
            t: value.sql_type.clone(),
            q: if value.quoted { "true" } else { "false" }.to_string(),
        }
    }

    fn into_column(self) -> ColumnValue {
        ColumnValue {
            value: self.v,
            sql_type: self.t,
            quoted: self.q == "true",
        }
    }
}

impl Envelope {
    pub fn from_event(event: &ChangeEvent) -> Self {
        let columns = event
            .columns
            .iter()
            .map(|(name, tuple)| {
                (
                    name.clone(),
                    EnvelopeColumn {
                        new: tuple.new.as_ref().map(EnvelopeValue::from_column),
                        old: tuple.old.as_ref().map(EnvelopeValue::from_column),
                    },
                )
            })
            .collect();

        Self {
            lsn: event.lsn.to_string(),
            table: event.relation.clone(),
            operation: event.op.to_string(),
            columns,
        }
    }

    /// Reconstruct the event this envelope was encoded from.
    pub fn into_event(self) -> Result<ChangeEvent> {
        let op = match self.operation.as_str() {
            "INSERT" => Operation::Insert,
            "UPDATE" => Operation::Update,
            "DELETE" => Operation::Delete,
            other => {
                return Err(BridgeError::parse(
                    format!("unknown operation {other:?}"),
                    self.operation.clone(),
                ))
            }
        };
        let lsn: Lsn = self
            .lsn
            .parse()
            .map_err(|e: String| BridgeError::parse(e, self.lsn.clone()))?;

        let columns = self
            .columns
            .into_iter()
            .map(|(name, col)| {
                (
                    name,
                    ColumnTuple {
                        new: col.new.map(EnvelopeValue::into_column),
                        old: col.old.map(EnvelopeValue::into_column),
                    },
                )
            })
            .collect();

        Ok(ChangeEvent {
            op,
            relation: self.table,
            columns,
            lsn,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn insert_row() -> RowChange {
        let mut current = HashMap::new();
        current.insert("id".to_string(), ColumnValue::new("7", "integer", false));
        current.insert("name".to_string(), ColumnValue::new("a", "text", true));
        RowChange {
            current,
            old: HashMap::new(),
        }
    }

    #[test]
    fn test_insert_carries_only_new() {
        let event = ChangeEvent::from_row(Operation::Insert, "public.users", insert_row(), Lsn(7));
        for tuple in event.columns.values() {
            assert!(tuple.new.is_some());
            assert!(tuple.old.is_none());
        }
    }

    #[test]
    fn test_delete_carries_only_old() {
        let event = ChangeEvent::from_row(Operation::Delete, "public.users", insert_row(), Lsn(7));
        for tuple in event.columns.values() {
            assert!(tuple.new.is_none());
            assert!(tuple.old.is_some());
        }
    }

    #[test]
    fn test_update_diffs_old_values() {
        let mut current = HashMap::new();
        current.insert("id".to_string(), ColumnValue::new("1", "integer", false));
        current.insert("name".to_string(), ColumnValue::new("b", "text", true));
        let mut old = HashMap::new();
        old.insert("id".to_string(), ColumnValue::new("1", "integer", false));
        old.insert("name".to_string(), ColumnValue::new("a", "text", true));

        let event = ChangeEvent::from_row(
            Operation::Update,
            "public.users",
            RowChange { current, old },
            Lsn(9),
        );

        let id = &event.columns["id"];
        assert!(id.new.is_some());
        assert!(id.old.is_none(), "unchanged column must not carry old");

        let name = &event.columns["name"];
        assert_eq!(name.new.as_ref().unwrap().value, "b");
        assert_eq!(name.old.as_ref().unwrap().value, "a");
    }

    #[test]
    fn test_envelope_shape() {
        let event = ChangeEvent::from_row(
            Operation::Insert,
            "public.users",
            insert_row(),
            "0/1A0".parse().unwrap(),
        );
        let record = event.encode().unwrap();
        assert_eq!(record.partition_key, "public.users");

        let value: serde_json::Value = serde_json::from_slice(&record.payload).unwrap();
        let expected: serde_json::Value = serde_json::json!({
            "lsn": "0/1A0",
            "table": "public.users",
            "operation": "INSERT",
            "columns": {
                "id": {"new": {"v": "7", "t": "integer", "q": "false"}},
                "name": {"new": {"v": "a", "t": "text", "q": "true"}}
            }
        });
        assert_eq!(value, expected);
    }

    #[test]
    fn test_envelope_round_trip() {
        let mut current = HashMap::new();
        current.insert(
            "payload".to_string(),
            ColumnValue::new("it's quoted", "text", true),
        );
        let mut old = HashMap::new();
        old.insert(
            "payload".to_string(),
            ColumnValue::new("previous", "text", true),
        );

        let event = ChangeEvent::from_row(
            Operation::Update,
            "app.events",
            RowChange { current, old },
            Lsn((3 << 32) | 0xBEEF),
        );

        let record = event.encode().unwrap();
        let envelope: Envelope = serde_json::from_slice(&record.payload).unwrap();
        let decoded = envelope.into_event().unwrap();
        assert_eq!(decoded, event);
    }

    #[test]
    fn test_oversized_record_rejected() {
        let mut current = HashMap::new();
        current.insert(
            "blob".to_string(),
            ColumnValue::new("x".repeat(MAX_RECORD_BYTES), "text", true),
        );
        let event = ChangeEvent::from_row(
            Operation::Insert,
            "public.blobs",
            RowChange {
                current,
                old: HashMap::new(),
            },
            Lsn(1),
        );

        match event.encode() {
            Err(BridgeError::OversizedRecord { bytes }) => assert!(bytes > MAX_RECORD_BYTES),
            other => panic!("expected OversizedRecord, got {other:?}"),
        }
    }

    #[test]
    fn test_into_event_rejects_unknown_operation() {
        let envelope = Envelope {
            lsn: "0/0".to_string(),
            table: "t".to_string(),
            operation: "TRUNCATE".to_string(),
            columns: HashMap::new(),
        };
        assert!(envelope.into_event().is_err());
    }
}
