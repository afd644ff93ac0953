use std::collections::{BTreeMap, HashMap};

use serde::ser::SerializeMap;
use serde::{Deserialize, Serialize, Serializer};
use time::{OffsetDateTime, UtcOffset};

use crate::{day_key, TimestampError};

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct CreationRecord {
    pub id: i64,
    #[serde(with = "time::serde::rfc3339")]
    pub created_at: OffsetDateTime,
    #[serde(rename = "type")]
    pub node_type: String,
}

/// Node counts per type, most frequent first. Serializes as a JSON object
/// that keeps this order.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct TypeCounts(Vec<(String, usize)>);

impl TypeCounts {
    #[must_use]
    pub fn get(&self, node_type: &str) -> Option<usize> {
        self.0
            .iter()
            .find(|(candidate, _)| candidate == node_type)
            .map(|(_, count)| *count)
    }

    pub fn iter(&self) -> impl Iterator<Item = (&str, usize)> {
        self.0.iter().map(|(name, count)| (name.as_str(), *count))
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }
}

impl Serialize for TypeCounts {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        let mut map = serializer.serialize_map(Some(self.0.len()))?;
        for (name, count) in &self.0 {
            map.serialize_entry(name, count)?;
        }
        map.end()
    }
}

#[derive(Debug, Clone, Serialize, PartialEq, Eq)]
pub struct StatisticsReport {
    pub total: usize,
    pub types: TypeCounts,
    pub ctime_by_day: BTreeMap<String, usize>,
}

/// Summarizes node creation: totals, counts per type and a dense per-day
/// histogram between the first and last creation day (UTC).
///
/// # Errors
/// Returns [`TimestampError::Format`] when a day key cannot be rendered.
pub fn creation_statistics(
    records: &[CreationRecord],
) -> Result<StatisticsReport, TimestampError> {
    let mut per_type: HashMap<&str, usize> = HashMap::new();
    for record in records {
        *per_type.entry(record.node_type.as_str()).or_default() += 1;
    }

    // (count, type) descending, both components.
    let mut ranked: Vec<(usize, &str)> = per_type
        .into_iter()
        .map(|(name, count)| (count, name))
        .collect();
    ranked.sort_unstable_by(|lhs, rhs| rhs.cmp(lhs));
    let types = TypeCounts(
        ranked
            .into_iter()
            .map(|(count, name)| (name.to_string(), count))
            .collect(),
    );

    let mut per_day: BTreeMap<time::Date, usize> = BTreeMap::new();
    for record in records {
        let day = record.created_at.to_offset(UtcOffset::UTC).date();
        *per_day.entry(day).or_default() += 1;
    }

    let mut ctime_by_day = BTreeMap::new();
    if let (Some((&first, _)), Some((&last, _))) =
        (per_day.first_key_value(), per_day.last_key_value())
    {
        let mut current = Some(first);
        while let Some(day) = current.filter(|day| *day <= last) {
            ctime_by_day.insert(day_key(day)?, per_day.get(&day).copied().unwrap_or(0));
            current = day.next_day();
        }
    }

    Ok(StatisticsReport {
        total: records.len(),
        types,
        ctime_by_day,
    })
}
