//! Domain types and pure algorithms for the provenance store.
//!
//! Everything in this crate works on plain values handed in by a storage
//! layer; nothing here touches a database. The SQLite store in
//! `provdb-store-sqlite` feeds query rows into these functions.

use time::macros::format_description;
use time::{Date, OffsetDateTime, UtcOffset};

pub mod attributes;
pub mod migration;
pub mod statistics;
pub mod structure;

pub use attributes::{
    flatten_records, resolve_container, AttributeDatatype, AttributeError, AttributeNode,
    AttributeRecord, AttributeValue, FlattenReport, RecordFailure, StoredColumns,
};
pub use migration::{
    AlwaysProceed, ErrorCheckpoint, FlatRecordKind, MigrationOptions, MigrationOutcome,
    MigrationPhase, NeverProceed, DEFAULT_GROUP_SIZE,
};
pub use statistics::{creation_statistics, CreationRecord, StatisticsReport, TypeCounts};
pub use structure::{
    get_formula, get_symbols_string, resolve_closest_structures, structure_formula,
    BandsStructureRow, FormulaError, FormulaMode, Kind, Site, StructureFilter, StructureMatch,
    BANDS_NODE_TYPE, STRUCTURE_NODE_TYPE, UNKNOWN_FORMULA,
};

#[derive(Debug, Clone, thiserror::Error, Eq, PartialEq)]
pub enum TimestampError {
    #[error("invalid RFC3339 timestamp: {0}")]
    Parse(String),
    #[error("failed to format timestamp: {0}")]
    Format(String),
}

/// Parses an RFC3339 timestamp and normalizes it to UTC.
///
/// # Errors
/// Returns [`TimestampError::Parse`] when the value is not RFC3339.
pub fn parse_timestamp(value: &str) -> Result<OffsetDateTime, TimestampError> {
    OffsetDateTime::parse(value, &time::format_description::well_known::Rfc3339)
        .map(|parsed| parsed.to_offset(UtcOffset::UTC))
        .map_err(|err| TimestampError::Parse(format!("{value}: {err}")))
}

/// Formats a timestamp in fixed-width UTC form
/// (`YYYY-MM-DDTHH:MM:SS.ffffffZ`), so stored values sort chronologically.
///
/// # Errors
/// Returns [`TimestampError::Format`] when formatting fails.
pub fn format_timestamp(value: OffsetDateTime) -> Result<String, TimestampError> {
    value
        .to_offset(UtcOffset::UTC)
        .format(format_description!(
            "[year]-[month]-[day]T[hour]:[minute]:[second].[subsecond digits:6]Z"
        ))
        .map_err(|err| TimestampError::Format(err.to_string()))
}

/// Calendar day key used by the per-day histogram.
///
/// # Errors
/// Returns [`TimestampError::Format`] when formatting fails.
pub fn day_key(date: Date) -> Result<String, TimestampError> {
    date.format(format_description!("[year]-[month]-[day]"))
        .map_err(|err| TimestampError::Format(err.to_string()))
}

/// Short human date (`07 Feb 2026`) used in bands listings.
///
/// # Errors
/// Returns [`TimestampError::Format`] when formatting fails.
pub fn display_date(value: OffsetDateTime) -> Result<String, TimestampError> {
    value
        .to_offset(UtcOffset::UTC)
        .format(format_description!("[day] [month repr:short] [year]"))
        .map_err(|err| TimestampError::Format(err.to_string()))
}

#[must_use]
pub fn now_utc() -> OffsetDateTime {
    OffsetDateTime::now_utc().to_offset(UtcOffset::UTC)
}
