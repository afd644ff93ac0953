//! Reconstruction of nested attribute trees from flat key/value records.
//!
//! Legacy nodes stored every attribute leaf as its own row, keyed by a dotted
//! path (`kinds.0.symbols.1`). Containers are announced by `dict`/`list`
//! marker rows that sort before their children, so a single ordered pass is
//! enough to rebuild the tree.

use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};
use serde_json::Value;
use time::OffsetDateTime;

use crate::format_timestamp;

#[derive(Debug, Clone, thiserror::Error, Eq, PartialEq)]
pub enum AttributeError {
    #[error("cannot traverse segment '{segment}' of key '{key}'")]
    PathTraversal { key: String, segment: String },
    #[error("list marker '{key}' carries no valid length")]
    MissingListLength { key: String },
    #[error("list marker '{key}' announces {len} slots, more than the node has records")]
    ListTooLong { key: String, len: i64 },
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, Eq, PartialEq, Hash)]
#[serde(rename_all = "snake_case")]
pub enum AttributeDatatype {
    #[serde(rename = "txt")]
    Text,
    Float,
    Int,
    Bool,
    Date,
    Dict,
    List,
    #[serde(rename = "none")]
    Null,
}

impl AttributeDatatype {
    #[must_use]
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Text => "txt",
            Self::Float => "float",
            Self::Int => "int",
            Self::Bool => "bool",
            Self::Date => "date",
            Self::Dict => "dict",
            Self::List => "list",
            Self::Null => "none",
        }
    }

    #[must_use]
    pub fn parse(value: &str) -> Option<Self> {
        match value {
            "txt" | "text" => Some(Self::Text),
            "float" => Some(Self::Float),
            "int" => Some(Self::Int),
            "bool" => Some(Self::Bool),
            "date" => Some(Self::Date),
            "dict" => Some(Self::Dict),
            "list" => Some(Self::List),
            "none" => Some(Self::Null),
            _ => None,
        }
    }
}

/// Scalar payload of a flat record. `Absent` doubles as the "unset" slot of a
/// pre-sized sequence.
#[derive(Debug, Clone, PartialEq)]
pub enum AttributeValue {
    Absent,
    Text(String),
    Float(f64),
    Int(i64),
    Bool(bool),
    Date(OffsetDateTime),
}

impl AttributeValue {
    fn datatype(&self) -> AttributeDatatype {
        match self {
            Self::Absent => AttributeDatatype::Null,
            Self::Text(_) => AttributeDatatype::Text,
            Self::Float(_) => AttributeDatatype::Float,
            Self::Int(_) => AttributeDatatype::Int,
            Self::Bool(_) => AttributeDatatype::Bool,
            Self::Date(_) => AttributeDatatype::Date,
        }
    }

    #[must_use]
    pub fn to_json(&self) -> Value {
        match self {
            Self::Absent => Value::Null,
            Self::Text(text) => Value::String(text.clone()),
            Self::Float(number) => serde_json::Number::from_f64(*number)
                .map_or_else(|| Value::String(number.to_string()), Value::Number),
            Self::Int(number) => Value::from(*number),
            Self::Bool(flag) => Value::Bool(*flag),
            // Only years outside the four-digit range fail to format.
            Self::Date(stamp) => format_timestamp(*stamp).map_or(Value::Null, Value::String),
        }
    }
}

/// One legacy attribute (or extra) row.
#[derive(Debug, Clone, PartialEq)]
pub struct AttributeRecord {
    pub id: i64,
    pub parent_id: i64,
    pub key: String,
    /// Datatype tag as stored; unknown tags decode to null.
    pub datatype: String,
    pub value: AttributeValue,
}

/// Typed value columns of a legacy row. Which one is meaningful depends on
/// the datatype tag.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct StoredColumns {
    pub tval: String,
    pub fval: Option<f64>,
    pub ival: Option<i64>,
    pub bval: Option<bool>,
    pub dval: Option<OffsetDateTime>,
}

impl AttributeRecord {
    /// Builds a record from the legacy column layout, picking the value
    /// column that matches `datatype`.
    #[must_use]
    pub fn from_columns(
        id: i64,
        parent_id: i64,
        key: String,
        datatype: String,
        columns: StoredColumns,
    ) -> Self {
        let value = match AttributeDatatype::parse(&datatype) {
            Some(AttributeDatatype::Text) => AttributeValue::Text(columns.tval),
            Some(AttributeDatatype::Float) => {
                columns.fval.map_or(AttributeValue::Absent, AttributeValue::Float)
            }
            Some(AttributeDatatype::Int | AttributeDatatype::List) => {
                columns.ival.map_or(AttributeValue::Absent, AttributeValue::Int)
            }
            Some(AttributeDatatype::Bool) => {
                columns.bval.map_or(AttributeValue::Absent, AttributeValue::Bool)
            }
            Some(AttributeDatatype::Date) => {
                columns.dval.map_or(AttributeValue::Absent, AttributeValue::Date)
            }
            Some(AttributeDatatype::Dict | AttributeDatatype::Null) | None => AttributeValue::Absent,
        };

        Self {
            id,
            parent_id,
            key,
            datatype,
            value,
        }
    }
}

/// Reconstructed attribute tree.
#[derive(Debug, Clone, PartialEq)]
pub enum AttributeNode {
    Leaf(AttributeValue),
    Mapping(BTreeMap<String, AttributeNode>),
    Sequence(Vec<AttributeNode>),
}

impl Default for AttributeNode {
    fn default() -> Self {
        Self::Mapping(BTreeMap::new())
    }
}

impl AttributeNode {
    #[must_use]
    pub fn to_json(&self) -> Value {
        match self {
            Self::Leaf(value) => value.to_json(),
            Self::Mapping(entries) => Value::Object(
                entries
                    .iter()
                    .map(|(key, node)| (key.clone(), node.to_json()))
                    .collect(),
            ),
            Self::Sequence(items) => Value::Array(items.iter().map(Self::to_json).collect()),
        }
    }

    /// Number of set scalar leaves in the tree.
    #[must_use]
    pub fn leaf_count(&self) -> usize {
        match self {
            Self::Leaf(AttributeValue::Absent) => 0,
            Self::Leaf(_) => 1,
            Self::Mapping(entries) => entries.values().map(Self::leaf_count).sum(),
            Self::Sequence(items) => items.iter().map(Self::leaf_count).sum(),
        }
    }

    /// Encodes a mapping-rooted tree back into flat records, sorted by key.
    /// Unset values are written as `none` rows.
    #[must_use]
    pub fn to_records(&self, parent_id: i64) -> Vec<AttributeRecord> {
        let mut out = Vec::new();
        if let Self::Mapping(entries) = self {
            for (key, child) in entries {
                encode_into(key, child, parent_id, &mut out);
            }
        }
        out.sort_by(|lhs, rhs| lhs.key.cmp(&rhs.key));
        for (index, record) in out.iter_mut().enumerate() {
            record.id = i64::try_from(index + 1).unwrap_or(i64::MAX);
        }
        out
    }
}

fn encode_into(key: &str, node: &AttributeNode, parent_id: i64, out: &mut Vec<AttributeRecord>) {
    let marker = |datatype: AttributeDatatype, value: AttributeValue| AttributeRecord {
        id: 0,
        parent_id,
        key: key.to_string(),
        datatype: datatype.as_str().to_string(),
        value,
    };

    match node {
        AttributeNode::Leaf(value) => out.push(marker(value.datatype(), value.clone())),
        AttributeNode::Mapping(entries) => {
            out.push(marker(AttributeDatatype::Dict, AttributeValue::Absent));
            for (child_key, child) in entries {
                encode_into(&format!("{key}.{child_key}"), child, parent_id, out);
            }
        }
        AttributeNode::Sequence(items) => {
            let len = i64::try_from(items.len()).unwrap_or(i64::MAX);
            out.push(marker(AttributeDatatype::List, AttributeValue::Int(len)));
            for (index, child) in items.iter().enumerate() {
                encode_into(&format!("{key}.{index}"), child, parent_id, out);
            }
        }
    }
}

/// A record that could not be placed, with the reason.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RecordFailure {
    pub record_id: i64,
    pub parent_id: i64,
    pub key: String,
    pub error: AttributeError,
}

#[derive(Debug, Clone, PartialEq)]
pub struct FlattenReport {
    pub attributes: AttributeNode,
    pub failures: Vec<RecordFailure>,
}

impl FlattenReport {
    #[must_use]
    pub fn error_count(&self) -> usize {
        self.failures.len()
    }
}

fn parse_index(segment: &str) -> Option<usize> {
    if segment.is_empty() || !segment.bytes().all(|byte| byte.is_ascii_digit()) {
        return None;
    }
    segment.parse().ok()
}

// Numeric segments on a mapping are keyed by their integer spelling.
fn mapping_key(segment: &str) -> String {
    parse_index(segment).map_or_else(|| segment.to_string(), |index| index.to_string())
}

/// Returns the container that receives the last segment of `key`.
///
/// # Errors
/// Returns [`AttributeError::PathTraversal`] when an intermediate segment is
/// missing, out of range, or crosses a scalar leaf.
pub fn resolve_container<'a>(
    root: &'a mut AttributeNode,
    key: &str,
) -> Result<&'a mut AttributeNode, AttributeError> {
    let segments: Vec<&str> = key.split('.').collect();
    let parents = &segments[..segments.len().saturating_sub(1)];

    let mut current = root;
    for segment in parents {
        current = match current {
            AttributeNode::Mapping(entries) => entries.get_mut(&mapping_key(segment)),
            AttributeNode::Sequence(items) => parse_index(segment).and_then(|i| items.get_mut(i)),
            AttributeNode::Leaf(_) => None,
        }
        .ok_or_else(|| AttributeError::PathTraversal {
            key: key.to_string(),
            segment: (*segment).to_string(),
        })?;
    }

    Ok(current)
}

fn decode(record: &AttributeRecord, max_list_len: usize) -> Result<AttributeNode, AttributeError> {
    let Some(datatype) = AttributeDatatype::parse(&record.datatype) else {
        tracing::debug!(
            key = %record.key,
            datatype = %record.datatype,
            "unknown datatype stored as null"
        );
        return Ok(AttributeNode::Leaf(AttributeValue::Absent));
    };

    let node = match datatype {
        AttributeDatatype::Dict => AttributeNode::Mapping(BTreeMap::new()),
        AttributeDatatype::Null => AttributeNode::Leaf(AttributeValue::Absent),
        AttributeDatatype::List => {
            let missing = || AttributeError::MissingListLength {
                key: record.key.clone(),
            };
            let AttributeValue::Int(stored) = record.value else {
                return Err(missing());
            };
            let len = usize::try_from(stored).map_err(|_| missing())?;
            if len > max_list_len {
                return Err(AttributeError::ListTooLong {
                    key: record.key.clone(),
                    len: stored,
                });
            }
            AttributeNode::Sequence(vec![AttributeNode::Leaf(AttributeValue::Absent); len])
        }
        AttributeDatatype::Float => match record.value {
            AttributeValue::Float(number) if number.is_nan() => {
                AttributeNode::Leaf(AttributeValue::Text("NaN".to_string()))
            }
            ref other => AttributeNode::Leaf(other.clone()),
        },
        _ => AttributeNode::Leaf(record.value.clone()),
    };

    Ok(node)
}

fn place(
    record: &AttributeRecord,
    root: &mut AttributeNode,
    max_list_len: usize,
) -> Result<(), AttributeError> {
    let container = resolve_container(root, &record.key)?;
    let local = record.key.rsplit('.').next().unwrap_or_default();
    let node = decode(record, max_list_len)?;

    match container {
        AttributeNode::Mapping(entries) => {
            entries.insert(mapping_key(local), node);
            Ok(())
        }
        AttributeNode::Sequence(items) => {
            let slot = parse_index(local)
                .and_then(|index| items.get_mut(index))
                .ok_or_else(|| AttributeError::PathTraversal {
                    key: record.key.clone(),
                    segment: local.to_string(),
                })?;
            *slot = node;
            Ok(())
        }
        AttributeNode::Leaf(_) => Err(AttributeError::PathTraversal {
            key: record.key.clone(),
            segment: local.to_string(),
        }),
    }
}

/// Rebuilds the attribute tree of one node from its flat records.
///
/// `records` must be sorted by key. A record that cannot be placed is
/// logged, counted in the report and skipped; the rest still apply. Every
/// list slot has its own row, so a list marker may not announce more slots
/// than there are records.
#[must_use]
pub fn flatten_records(records: &[AttributeRecord]) -> FlattenReport {
    let mut root = AttributeNode::default();
    let mut failures = Vec::new();
    let max_list_len = records.len();

    for record in records {
        if let Err(error) = place(record, &mut root, max_list_len) {
            tracing::warn!(
                record_id = record.id,
                node_id = record.parent_id,
                key = %record.key,
                %error,
                "could not transfer flat record"
            );
            failures.push(RecordFailure {
                record_id: record.id,
                parent_id: record.parent_id,
                key: record.key.clone(),
                error,
            });
        }
    }

    FlattenReport {
        attributes: root,
        failures,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;
    use serde_json::json;

    fn record(key: &str, datatype: &str, value: AttributeValue) -> AttributeRecord {
        AttributeRecord {
            id: 0,
            parent_id: 7,
            key: key.to_string(),
            datatype: datatype.to_string(),
            value,
        }
    }

    fn sorted(mut records: Vec<AttributeRecord>) -> Vec<AttributeRecord> {
        records.sort_by(|lhs, rhs| lhs.key.cmp(&rhs.key));
        for (index, item) in records.iter_mut().enumerate() {
            item.id = i64::try_from(index).unwrap_or_default() + 1;
        }
        records
    }

    #[test]
    fn text_and_nan_float_flatten_without_errors() {
        let report = flatten_records(&sorted(vec![
            record("a", "txt", AttributeValue::Text("foo".to_string())),
            record("b", "float", AttributeValue::Float(f64::NAN)),
        ]));

        assert_eq!(report.error_count(), 0);
        assert_eq!(report.attributes.to_json(), json!({"a": "foo", "b": "NaN"}));
    }

    #[test]
    fn dict_marker_precedes_children() {
        let report = flatten_records(&sorted(vec![
            record("a", "dict", AttributeValue::Absent),
            record("a.x", "int", AttributeValue::Int(5)),
        ]));

        assert_eq!(report.error_count(), 0);
        assert_eq!(report.attributes.to_json(), json!({"a": {"x": 5}}));
    }

    #[test]
    fn list_marker_presizes_slots_and_indexes_children() {
        let report = flatten_records(&sorted(vec![
            record("kinds", "list", AttributeValue::Int(3)),
            record("kinds.0", "dict", AttributeValue::Absent),
            record("kinds.0.name", "txt", AttributeValue::Text("Ba".to_string())),
            record("kinds.2", "bool", AttributeValue::Bool(true)),
        ]));

        assert_eq!(report.error_count(), 0);
        assert_eq!(
            report.attributes.to_json(),
            json!({"kinds": [{"name": "Ba"}, null, true]})
        );
    }

    #[test]
    fn ten_element_list_is_filled_despite_lexicographic_order() {
        let mut records = vec![record("l", "list", AttributeValue::Int(11))];
        for index in 0..11_i64 {
            records.push(record(&format!("l.{index}"), "int", AttributeValue::Int(index)));
        }
        let report = flatten_records(&sorted(records));

        assert_eq!(report.error_count(), 0);
        assert_eq!(
            report.attributes.to_json(),
            json!({"l": [0, 1, 2, 3, 4, 5, 6, 7, 8, 9, 10]})
        );
    }

    #[test]
    fn missing_parent_is_counted_and_skipped() {
        let report = flatten_records(&sorted(vec![
            record("a.x", "int", AttributeValue::Int(1)),
            record("b", "int", AttributeValue::Int(2)),
        ]));

        assert_eq!(report.error_count(), 1);
        assert_eq!(report.failures[0].key, "a.x");
        assert_eq!(report.failures[0].parent_id, 7);
        assert!(matches!(
            report.failures[0].error,
            AttributeError::PathTraversal { ref segment, .. } if segment == "a"
        ));
        assert_eq!(report.attributes.to_json(), json!({"b": 2}));
    }

    #[test]
    fn out_of_range_index_and_bad_markers_are_errors() {
        let report = flatten_records(&sorted(vec![
            record("l", "list", AttributeValue::Int(1)),
            record("l.1", "int", AttributeValue::Int(1)),
            record("m", "list", AttributeValue::Absent),
            record("n", "list", AttributeValue::Int(-2)),
            record("s", "txt", AttributeValue::Text("x".to_string())),
            record("s.deeper", "int", AttributeValue::Int(3)),
        ]));

        assert_eq!(report.error_count(), 4);
        assert_eq!(
            report
                .failures
                .iter()
                .filter(|failure| matches!(failure.error, AttributeError::MissingListLength { .. }))
                .count(),
            2
        );
        assert_eq!(report.attributes.to_json(), json!({"l": [null], "s": "x"}));
    }

    #[test]
    fn oversized_list_length_is_a_record_failure() {
        let report = flatten_records(&sorted(vec![
            record("huge", "list", AttributeValue::Int(i64::MAX)),
            record("huge.0", "int", AttributeValue::Int(1)),
            record("ok", "int", AttributeValue::Int(2)),
        ]));

        assert_eq!(report.error_count(), 2);
        assert!(matches!(
            report.failures[0].error,
            AttributeError::ListTooLong { len: i64::MAX, .. }
        ));
        assert_eq!(report.failures[1].key, "huge.0");
        assert_eq!(report.attributes.to_json(), json!({"ok": 2}));

        let within = flatten_records(&sorted(vec![
            record("l", "list", AttributeValue::Int(2)),
            record("l.0", "none", AttributeValue::Absent),
            record("l.1", "int", AttributeValue::Int(1)),
        ]));
        assert_eq!(within.error_count(), 0);
        assert_eq!(within.attributes.to_json(), json!({"l": [null, 1]}));
    }

    #[test]
    fn none_and_unknown_datatypes_decode_to_null() {
        let report = flatten_records(&sorted(vec![
            record("x", "none", AttributeValue::Absent),
            record("y", "pickle", AttributeValue::Absent),
            record("z", "int", AttributeValue::Int(1)),
        ]));

        assert_eq!(report.error_count(), 0);
        assert_eq!(report.attributes.to_json(), json!({"x": null, "y": null, "z": 1}));
    }

    #[test]
    fn unset_values_encode_as_none_rows() {
        let tree = AttributeNode::Mapping(BTreeMap::from([
            ("gone".to_string(), AttributeNode::Leaf(AttributeValue::Absent)),
            (
                "slots".to_string(),
                AttributeNode::Sequence(vec![AttributeNode::Leaf(AttributeValue::Absent)]),
            ),
        ]));

        let records = tree.to_records(3);
        let tags: Vec<(&str, &str)> = records
            .iter()
            .map(|item| (item.key.as_str(), item.datatype.as_str()))
            .collect();
        assert_eq!(tags, vec![("gone", "none"), ("slots", "list"), ("slots.0", "none")]);
        assert_eq!(flatten_records(&records).attributes, tree);
    }

    #[test]
    fn from_columns_picks_the_matching_value_column() {
        let columns = StoredColumns {
            tval: "ignored".to_string(),
            fval: Some(1.5),
            ival: Some(4),
            bval: Some(false),
            dval: None,
        };

        let float = AttributeRecord::from_columns(1, 2, "f".into(), "float".into(), columns.clone());
        assert_eq!(float.value, AttributeValue::Float(1.5));

        let list = AttributeRecord::from_columns(1, 2, "l".into(), "list".into(), columns.clone());
        assert_eq!(list.value, AttributeValue::Int(4));

        let text = AttributeRecord::from_columns(1, 2, "t".into(), "txt".into(), columns.clone());
        assert_eq!(text.value, AttributeValue::Text("ignored".to_string()));

        let date = AttributeRecord::from_columns(1, 2, "d".into(), "date".into(), columns);
        assert_eq!(date.value, AttributeValue::Absent);
    }

    #[test]
    fn numeric_mapping_keys_use_integer_spelling() {
        let report = flatten_records(&sorted(vec![
            record("m", "dict", AttributeValue::Absent),
            record("m.007", "int", AttributeValue::Int(1)),
        ]));

        assert_eq!(report.attributes.to_json(), json!({"m": {"7": 1}}));
    }

    fn scalar() -> impl Strategy<Value = AttributeValue> {
        prop_oneof![
            "[a-z]{0,6}".prop_map(AttributeValue::Text),
            any::<i64>().prop_map(AttributeValue::Int),
            any::<bool>().prop_map(AttributeValue::Bool),
            (-1.0e6_f64..1.0e6).prop_map(AttributeValue::Float),
        ]
    }

    fn tree() -> impl Strategy<Value = AttributeNode> {
        let leaf = scalar().prop_map(AttributeNode::Leaf);
        leaf.prop_recursive(3, 24, 4, |inner| {
            prop_oneof![
                prop::collection::btree_map("[a-z]{1,3}", inner.clone(), 0..4)
                    .prop_map(AttributeNode::Mapping),
                prop::collection::vec(inner, 0..12).prop_map(AttributeNode::Sequence),
            ]
        })
    }

    proptest! {
        #[test]
        fn prop_flatten_is_identity_on_consistent_encoding(
            entries in prop::collection::btree_map("[a-z]{1,3}", tree(), 0..5)
        ) {
            let original = AttributeNode::Mapping(entries);
            let records = original.to_records(1);
            let rebuilt = flatten_records(&records);

            prop_assert_eq!(rebuilt.error_count(), 0);
            prop_assert_eq!(&rebuilt.attributes, &original);

            let again = flatten_records(&rebuilt.attributes.to_records(1));
            prop_assert_eq!(again.attributes, original);
        }

        #[test]
        fn prop_leaves_plus_errors_cover_scalar_records(
            entries in prop::collection::btree_map("[a-z]{1,3}", tree(), 0..5),
            drop_index in any::<prop::sample::Index>()
        ) {
            let mut records = AttributeNode::Mapping(entries).to_records(1);
            let containers: Vec<usize> = records
                .iter()
                .enumerate()
                .filter(|(_, item)| item.datatype == "dict" || item.datatype == "list")
                .map(|(index, _)| index)
                .collect();
            if !containers.is_empty() {
                records.remove(containers[drop_index.index(containers.len())]);
            }

            let scalar_records = records
                .iter()
                .filter(|item| item.datatype != "dict" && item.datatype != "list")
                .count();
            let report = flatten_records(&records);
            let failed_scalars = report
                .failures
                .iter()
                .filter(|failure| {
                    records
                        .iter()
                        .any(|item| item.key == failure.key
                            && item.datatype != "dict"
                            && item.datatype != "list")
                })
                .count();

            prop_assert_eq!(report.attributes.leaf_count() + failed_scalars, scalar_records);
        }
    }
}
