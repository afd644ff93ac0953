//! Data migrations: flat attribute/extra rows into JSON columns, and legacy
//! TEXT columns into canonical JSON.

use std::collections::BTreeMap;

use anyhow::{anyhow, Context, Result};
use provdb_core::{
    flatten_records, parse_timestamp, AttributeRecord, ErrorCheckpoint, FlatRecordKind,
    MigrationOptions, MigrationOutcome, MigrationPhase, StoredColumns,
};
use rusqlite::{params, Connection, OptionalExtension};

use crate::{collect_rows, has_column, SqliteProvenanceStore};

/// Legacy TEXT columns that hold JSON documents.
pub const JSON_TEXT_COLUMNS: [(&str, &str); 4] = [
    ("db_dbauthinfo", "metadata"),
    ("db_dbauthinfo", "auth_params"),
    ("db_dbcomputer", "metadata"),
    ("db_dblog", "metadata"),
];

const FAILURE_SAMPLE_LIMIT: usize = 50;

#[derive(Debug, Clone, serde::Serialize, serde::Deserialize, PartialEq, Eq)]
pub struct FailedRecord {
    pub record_id: i64,
    pub node_id: i64,
    pub key: String,
    pub reason: String,
}

#[derive(Debug, Clone, serde::Serialize, serde::Deserialize, PartialEq, Eq)]
pub struct MigrationReport {
    pub kind: FlatRecordKind,
    pub created_columns: Vec<String>,
    pub total_nodes: usize,
    pub total_groups: usize,
    pub migrated_nodes: usize,
    pub error_count: usize,
    /// First failures only; `error_count` is authoritative.
    pub failure_sample: Vec<FailedRecord>,
    pub phase: MigrationPhase,
    pub outcome: MigrationOutcome,
}

#[derive(Debug, Clone, serde::Serialize, serde::Deserialize, PartialEq, Eq)]
pub struct JsonColumnResult {
    pub table: String,
    pub column: String,
    pub rows_rewritten: usize,
}

#[derive(Debug, Clone, serde::Serialize, serde::Deserialize, PartialEq, Eq)]
pub struct JsonColumnReport {
    pub columns: Vec<JsonColumnResult>,
}

impl SqliteProvenanceStore {
    /// Adds the `attributes` and `extras` JSON columns to `db_dbnode` when
    /// missing. Returns the names of the columns it created.
    pub fn ensure_node_json_columns(&self) -> Result<Vec<String>> {
        ensure_node_json_columns(&self.conn)
    }

    /// Rebuilds every node's structured column from its legacy flat rows.
    ///
    /// Runs in a single transaction. Nodes are processed `group_size` at a
    /// time in id order. When any row failed to convert, `checkpoint` decides
    /// between commit and a full rollback.
    pub fn migrate_flat_records(
        &mut self,
        kind: FlatRecordKind,
        options: &MigrationOptions,
        checkpoint: &mut dyn ErrorCheckpoint,
    ) -> Result<MigrationReport> {
        let column = kind.target_column();
        let group_size = options.group_size.max(1);
        tracing::info!(kind = kind.as_str(), group_size, "starting flat record migration");

        let mut phase = MigrationPhase::NotStarted;
        let tx = self
            .conn
            .transaction()
            .context("failed to start migration transaction")?;

        let created_columns = if options.create_columns {
            ensure_node_json_columns(&tx)?
        } else {
            if !has_column(&tx, "db_dbnode", column)? {
                return Err(anyhow!(
                    "db_dbnode.{column} is missing; rerun with column creation enabled"
                ));
            }
            Vec::new()
        };
        phase.advance(MigrationPhase::ColumnsEnsured);

        let total_nodes: i64 = tx
            .query_row("SELECT COUNT(id) FROM db_dbnode", [], |row| row.get(0))
            .context("failed to count nodes")?;
        let total_nodes = usize::try_from(total_nodes).context("negative node count")?;
        let total_groups = options.total_groups(total_nodes);

        let mut migrated_nodes = 0_usize;
        let mut error_count = 0_usize;
        let mut failure_sample = Vec::new();

        for group in 0..total_groups {
            phase.advance(MigrationPhase::BatchLoop(group));
            tracing::debug!(group, total_groups, "migrating group");

            let limit = i64::try_from(group_size).context("group size overflow")?;
            let offset = i64::try_from(group * group_size).context("group offset overflow")?;

            let node_ids = load_group_node_ids(&tx, limit, offset)?;
            let mut group_records = load_group_records(&tx, kind, limit, offset)?;

            let mut update = tx
                .prepare_cached(&format!("UPDATE db_dbnode SET {column} = ?1 WHERE id = ?2"))
                .with_context(|| format!("failed to prepare {column} update"))?;

            for node_id in node_ids {
                let mut records = group_records.records.remove(&node_id).unwrap_or_default();
                records.sort_by(|lhs, rhs| lhs.key.cmp(&rhs.key));

                let report = flatten_records(&records);
                let date_failures = group_records.bad_dates.remove(&node_id).unwrap_or_default();
                error_count += report.error_count() + date_failures.len();

                let failures = date_failures
                    .into_iter()
                    .chain(report.failures.iter().map(|failure| FailedRecord {
                        record_id: failure.record_id,
                        node_id: failure.parent_id,
                        key: failure.key.clone(),
                        reason: failure.error.to_string(),
                    }));
                let room = FAILURE_SAMPLE_LIMIT.saturating_sub(failure_sample.len());
                failure_sample.extend(failures.take(room));

                let payload = serde_json::to_string(&report.attributes.to_json())
                    .with_context(|| format!("failed to serialize {column} of node {node_id}"))?;
                update
                    .execute(params![payload, node_id])
                    .with_context(|| format!("failed to store {column} of node {node_id}"))?;
                migrated_nodes += 1;
            }
        }

        let mut report = MigrationReport {
            kind,
            created_columns,
            total_nodes,
            total_groups,
            migrated_nodes,
            error_count,
            failure_sample,
            phase,
            outcome: MigrationOutcome::Committed,
        };

        if error_count > 0 {
            report.phase.advance(MigrationPhase::ErrorCheckpoint);
            tracing::warn!(error_count, "migration finished with conversion errors");

            if !checkpoint.proceed(error_count) {
                tx.rollback().context("failed to roll back migration")?;
                tracing::info!(kind = kind.as_str(), "migration rolled back");
                report.phase.advance(MigrationPhase::RolledBack);
                report.outcome = MigrationOutcome::RolledBack;
                return Ok(report);
            }
        }

        tx.commit().context("failed to commit migration")?;
        tracing::info!(kind = kind.as_str(), migrated_nodes, "migration committed");
        report.phase.advance(MigrationPhase::Committed);
        Ok(report)
    }

    /// Validates and canonicalizes the JSON stored in [`JSON_TEXT_COLUMNS`].
    /// Any invalid document aborts the whole migration.
    pub fn migrate_json_columns(&mut self) -> Result<JsonColumnReport> {
        let tx = self
            .conn
            .transaction()
            .context("failed to start json column transaction")?;

        let mut columns = Vec::with_capacity(JSON_TEXT_COLUMNS.len());
        for (table, column) in JSON_TEXT_COLUMNS {
            let invalid: Option<i64> = tx
                .query_row(
                    &format!(
                        "SELECT id FROM {table}
                         WHERE {column} IS NOT NULL AND json_valid({column}) = 0
                         ORDER BY id LIMIT 1"
                    ),
                    [],
                    |row| row.get(0),
                )
                .optional()
                .with_context(|| format!("failed to validate {table}.{column}"))?;

            if let Some(row_id) = invalid {
                return Err(anyhow!(
                    "{table}.{column} row {row_id} does not hold valid JSON"
                ));
            }

            let rows_rewritten = tx
                .execute(
                    &format!("UPDATE {table} SET {column} = json({column}) WHERE {column} IS NOT NULL"),
                    [],
                )
                .with_context(|| format!("failed to rewrite {table}.{column}"))?;

            tracing::debug!(table, column, rows_rewritten, "canonicalized json column");
            columns.push(JsonColumnResult {
                table: table.to_string(),
                column: column.to_string(),
                rows_rewritten,
            });
        }

        tx.commit().context("failed to commit json column migration")?;
        Ok(JsonColumnReport { columns })
    }
}

fn ensure_node_json_columns(conn: &Connection) -> Result<Vec<String>> {
    let mut created = Vec::new();
    for kind in [FlatRecordKind::Attributes, FlatRecordKind::Extras] {
        let column = kind.target_column();
        if has_column(conn, "db_dbnode", column)? {
            continue;
        }

        tracing::debug!(column, "creating node json column");
        conn.execute_batch(&format!(
            "ALTER TABLE db_dbnode ADD COLUMN {column} TEXT DEFAULT '{{}}'"
        ))
        .with_context(|| format!("failed to add db_dbnode.{column}"))?;
        created.push(column.to_string());
    }
    Ok(created)
}

fn load_group_node_ids(conn: &Connection, limit: i64, offset: i64) -> Result<Vec<i64>> {
    let mut stmt = conn.prepare_cached("SELECT id FROM db_dbnode ORDER BY id LIMIT ?1 OFFSET ?2")?;
    let rows = stmt.query_map(params![limit, offset], |row| row.get(0))?;
    collect_rows(rows)
}

// Rows of one group, keyed by node. A `dval` that does not parse leaves the
// value unset and is reported with the node's other failures.
#[derive(Default)]
struct GroupRecords {
    records: BTreeMap<i64, Vec<AttributeRecord>>,
    bad_dates: BTreeMap<i64, Vec<FailedRecord>>,
}

fn load_group_records(
    conn: &Connection,
    kind: FlatRecordKind,
    limit: i64,
    offset: i64,
) -> Result<GroupRecords> {
    let mut stmt = conn.prepare_cached(&format!(
        "SELECT r.id, r.dbnode_id, r.key, r.datatype, r.tval, r.fval, r.ival, r.bval, r.dval
         FROM {} r
         WHERE r.dbnode_id IN (SELECT id FROM db_dbnode ORDER BY id LIMIT ?1 OFFSET ?2)",
        kind.source_table()
    ))?;

    let rows = stmt.query_map(params![limit, offset], |row| {
        let (dval, date_error) = match row.get::<_, Option<String>>(8)? {
            Some(raw) => match parse_timestamp(&raw) {
                Ok(stamp) => (Some(stamp), None),
                Err(err) => (None, Some(err.to_string())),
            },
            None => (None, None),
        };
        let columns = StoredColumns {
            tval: row.get(4)?,
            fval: row.get(5)?,
            ival: row.get(6)?,
            bval: row.get::<_, Option<i64>>(7)?.map(|flag| flag != 0),
            dval,
        };
        let record = AttributeRecord::from_columns(
            row.get(0)?,
            row.get(1)?,
            row.get(2)?,
            row.get(3)?,
            columns,
        );
        Ok((record, date_error))
    })?;

    let mut grouped = GroupRecords::default();
    for (record, date_error) in collect_rows(rows)? {
        if let Some(reason) = date_error {
            tracing::warn!(
                record_id = record.id,
                node_id = record.parent_id,
                key = %record.key,
                %reason,
                "could not transfer flat record"
            );
            grouped
                .bad_dates
                .entry(record.parent_id)
                .or_default()
                .push(FailedRecord {
                    record_id: record.id,
                    node_id: record.parent_id,
                    key: record.key.clone(),
                    reason,
                });
        }
        grouped.records.entry(record.parent_id).or_default().push(record);
    }
    Ok(grouped)
}
