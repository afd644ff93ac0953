#![allow(clippy::missing_errors_doc)]
#![allow(clippy::uninlined_format_args)]

use std::path::Path;

use anyhow::{anyhow, Context, Result};
use provdb_core::{
    creation_statistics, format_timestamp, now_utc, parse_timestamp, resolve_closest_structures,
    AttributeNode, AttributeRecord, AttributeValue, BandsStructureRow, CreationRecord,
    FlatRecordKind, Kind, Site, StatisticsReport, StructureFilter, StructureMatch,
    TimestampError, BANDS_NODE_TYPE, STRUCTURE_NODE_TYPE,
};
use rusqlite::types::{Value as SqlValue, ValueRef};
use rusqlite::{params, params_from_iter, Connection, OptionalExtension};
use serde_json::Value;
use time::{Duration, OffsetDateTime};
use ulid::Ulid;

mod migrate;

pub use migrate::{
    FailedRecord, JsonColumnReport, JsonColumnResult, MigrationReport, JSON_TEXT_COLUMNS,
};

const SCHEMA_VERSION: i64 = 1;

const SCHEMA_V1: &str = r"
CREATE TABLE IF NOT EXISTS db_dbuser (
  id INTEGER PRIMARY KEY AUTOINCREMENT,
  email TEXT NOT NULL UNIQUE
);

CREATE TABLE IF NOT EXISTS db_dbnode (
  id INTEGER PRIMARY KEY AUTOINCREMENT,
  uuid TEXT NOT NULL,
  node_type TEXT NOT NULL,
  label TEXT NOT NULL DEFAULT '',
  ctime TEXT NOT NULL,
  user_id INTEGER NOT NULL,
  FOREIGN KEY (user_id) REFERENCES db_dbuser(id)
);

CREATE INDEX IF NOT EXISTS idx_dbnode_uuid ON db_dbnode(uuid);
CREATE INDEX IF NOT EXISTS idx_dbnode_type_ctime ON db_dbnode(node_type, ctime);

CREATE TABLE IF NOT EXISTS db_dblink (
  id INTEGER PRIMARY KEY AUTOINCREMENT,
  input_id INTEGER NOT NULL,
  output_id INTEGER NOT NULL,
  link_type TEXT NOT NULL,
  FOREIGN KEY (input_id) REFERENCES db_dbnode(id),
  FOREIGN KEY (output_id) REFERENCES db_dbnode(id)
);

CREATE INDEX IF NOT EXISTS idx_dblink_output ON db_dblink(output_id);

CREATE TABLE IF NOT EXISTS db_dbgroup (
  id INTEGER PRIMARY KEY AUTOINCREMENT,
  name TEXT NOT NULL UNIQUE,
  user_id INTEGER NOT NULL,
  FOREIGN KEY (user_id) REFERENCES db_dbuser(id)
);

CREATE TABLE IF NOT EXISTS db_dbgroup_dbnodes (
  dbgroup_id INTEGER NOT NULL,
  dbnode_id INTEGER NOT NULL,
  PRIMARY KEY (dbgroup_id, dbnode_id),
  FOREIGN KEY (dbgroup_id) REFERENCES db_dbgroup(id),
  FOREIGN KEY (dbnode_id) REFERENCES db_dbnode(id)
);

CREATE TABLE IF NOT EXISTS db_dbattribute (
  id INTEGER PRIMARY KEY AUTOINCREMENT,
  dbnode_id INTEGER NOT NULL,
  key TEXT NOT NULL,
  datatype TEXT NOT NULL,
  tval TEXT NOT NULL DEFAULT '',
  fval REAL,
  ival INTEGER,
  bval INTEGER CHECK (bval IN (0, 1) OR bval IS NULL),
  dval TEXT,
  UNIQUE(dbnode_id, key),
  FOREIGN KEY (dbnode_id) REFERENCES db_dbnode(id)
);

CREATE TABLE IF NOT EXISTS db_dbextra (
  id INTEGER PRIMARY KEY AUTOINCREMENT,
  dbnode_id INTEGER NOT NULL,
  key TEXT NOT NULL,
  datatype TEXT NOT NULL,
  tval TEXT NOT NULL DEFAULT '',
  fval REAL,
  ival INTEGER,
  bval INTEGER CHECK (bval IN (0, 1) OR bval IS NULL),
  dval TEXT,
  UNIQUE(dbnode_id, key),
  FOREIGN KEY (dbnode_id) REFERENCES db_dbnode(id)
);

CREATE TABLE IF NOT EXISTS db_dbauthinfo (
  id INTEGER PRIMARY KEY AUTOINCREMENT,
  metadata TEXT,
  auth_params TEXT
);

CREATE TABLE IF NOT EXISTS db_dbcomputer (
  id INTEGER PRIMARY KEY AUTOINCREMENT,
  name TEXT NOT NULL UNIQUE,
  metadata TEXT
);

CREATE TABLE IF NOT EXISTS db_dblog (
  id INTEGER PRIMARY KEY AUTOINCREMENT,
  metadata TEXT
);
";

pub struct SqliteProvenanceStore {
    conn: Connection,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct NewNode {
    /// Generated when absent.
    pub uuid: Option<String>,
    pub node_type: String,
    pub label: String,
    pub ctime: OffsetDateTime,
    pub user_id: i64,
}

#[derive(Debug, Clone, serde::Serialize, serde::Deserialize, PartialEq, Eq)]
pub struct NodeSummary {
    pub id: i64,
    pub uuid: String,
    pub node_type: String,
    pub label: String,
}

#[derive(Debug, Clone, serde::Serialize, serde::Deserialize, PartialEq, Eq)]
pub struct DuplicateUuid {
    pub id: i64,
    pub uuid: String,
}

/// Parameters of a bands listing. Owner, time window and groups are
/// evaluated in SQL; element filters run on the joined rows.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BandsQuery {
    pub owner_email: Option<String>,
    pub past_days: Option<u32>,
    pub group_names: Vec<String>,
    pub group_ids: Vec<i64>,
    pub filter: StructureFilter,
    pub as_of: OffsetDateTime,
}

impl Default for BandsQuery {
    fn default() -> Self {
        Self {
            owner_email: None,
            past_days: None,
            group_names: Vec::new(),
            group_ids: Vec::new(),
            filter: StructureFilter::default(),
            as_of: now_utc(),
        }
    }
}

impl SqliteProvenanceStore {
    pub fn open(path: &Path) -> Result<Self> {
        let conn = Connection::open(path)
            .with_context(|| format!("failed to open sqlite database at {}", path.display()))?;

        conn.execute_batch(
            "PRAGMA journal_mode = WAL;
             PRAGMA foreign_keys = ON;
             PRAGMA busy_timeout = 5000;",
        )
        .context("failed to configure sqlite pragmas")?;

        Ok(Self { conn })
    }

    pub fn migrate(&self) -> Result<()> {
        self.conn
            .execute_batch(
                "CREATE TABLE IF NOT EXISTS schema_migrations (
                    version INTEGER PRIMARY KEY,
                    applied_at TEXT NOT NULL
                );",
            )
            .context("failed to ensure schema_migrations exists")?;

        self.conn
            .execute_batch(SCHEMA_V1)
            .context("failed to apply provenance schema")?;

        self.conn
            .execute(
                "INSERT OR IGNORE INTO schema_migrations(version, applied_at) VALUES (?1, ?2)",
                params![SCHEMA_VERSION, format_timestamp(now_utc())?],
            )
            .context("failed to register schema migration")?;

        Ok(())
    }

    pub fn insert_user(&self, email: &str) -> Result<i64> {
        if email.trim().is_empty() {
            return Err(anyhow!("user email MUST be provided"));
        }

        self.conn
            .execute("INSERT INTO db_dbuser(email) VALUES (?1)", params![email])
            .with_context(|| format!("failed to insert user {email}"))?;
        Ok(self.conn.last_insert_rowid())
    }

    pub fn insert_node(&self, node: &NewNode) -> Result<i64> {
        let uuid = node
            .uuid
            .clone()
            .unwrap_or_else(|| Ulid::new().to_string().to_lowercase());
        let ctime = format_timestamp(node.ctime)?;

        self.conn
            .execute(
                "INSERT INTO db_dbnode(uuid, node_type, label, ctime, user_id)
                 VALUES (?1, ?2, ?3, ?4, ?5)",
                params![uuid, node.node_type, node.label, ctime, node.user_id],
            )
            .context("failed to insert node")?;
        Ok(self.conn.last_insert_rowid())
    }

    pub fn insert_link(&self, input_id: i64, output_id: i64, link_type: &str) -> Result<()> {
        self.conn
            .execute(
                "INSERT INTO db_dblink(input_id, output_id, link_type) VALUES (?1, ?2, ?3)",
                params![input_id, output_id, link_type],
            )
            .with_context(|| format!("failed to link node {input_id} -> {output_id}"))?;
        Ok(())
    }

    pub fn create_group(&self, name: &str, user_id: i64) -> Result<i64> {
        self.conn
            .execute(
                "INSERT INTO db_dbgroup(name, user_id) VALUES (?1, ?2)",
                params![name, user_id],
            )
            .with_context(|| format!("failed to create group {name}"))?;
        Ok(self.conn.last_insert_rowid())
    }

    pub fn add_node_to_group(&self, group_id: i64, node_id: i64) -> Result<()> {
        self.conn
            .execute(
                "INSERT OR IGNORE INTO db_dbgroup_dbnodes(dbgroup_id, dbnode_id) VALUES (?1, ?2)",
                params![group_id, node_id],
            )
            .context("failed to add node to group")?;
        Ok(())
    }

    /// Writes one legacy flat row. `record.id` is ignored; the row id is
    /// returned.
    pub fn insert_flat_record(&self, kind: FlatRecordKind, record: &AttributeRecord) -> Result<i64> {
        let (mut tval, mut fval, mut ival, mut bval, mut dval) =
            (String::new(), None, None, None, None);
        match &record.value {
            AttributeValue::Absent => {}
            AttributeValue::Text(text) => tval.clone_from(text),
            AttributeValue::Float(number) => fval = Some(*number),
            AttributeValue::Int(number) => ival = Some(*number),
            AttributeValue::Bool(flag) => bval = Some(i64::from(*flag)),
            AttributeValue::Date(stamp) => dval = Some(format_timestamp(*stamp)?),
        }

        self.conn
            .execute(
                &format!(
                    "INSERT INTO {}(dbnode_id, key, datatype, tval, fval, ival, bval, dval)
                     VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8)",
                    kind.source_table()
                ),
                params![record.parent_id, record.key, record.datatype, tval, fval, ival, bval, dval],
            )
            .with_context(|| {
                format!("failed to insert {} row {}", kind.as_str(), record.key)
            })?;
        Ok(self.conn.last_insert_rowid())
    }

    /// Stores a whole tree as legacy flat rows for `node_id`.
    pub fn insert_flat_tree(
        &self,
        kind: FlatRecordKind,
        node_id: i64,
        tree: &AttributeNode,
    ) -> Result<usize> {
        let records = tree.to_records(node_id);
        for record in &records {
            self.insert_flat_record(kind, record)?;
        }
        Ok(records.len())
    }

    /// Structured attributes/extras of a node, `None` when the column is
    /// absent or NULL.
    pub fn node_json_column(&self, kind: FlatRecordKind, node_id: i64) -> Result<Option<Value>> {
        let column = kind.target_column();
        if !has_column(&self.conn, "db_dbnode", column)? {
            return Ok(None);
        }

        let raw: Option<String> = self
            .conn
            .query_row(
                &format!("SELECT {column} FROM db_dbnode WHERE id = ?1"),
                params![node_id],
                |row| row.get(0),
            )
            .optional()
            .with_context(|| format!("failed to read {column} of node {node_id}"))?
            .flatten();

        raw.map(|text| {
            serde_json::from_str(&text)
                .with_context(|| format!("invalid stored {column} JSON for node {node_id}"))
        })
        .transpose()
    }

    /// Creation statistics over all nodes, or over the nodes created by
    /// `user_id`.
    pub fn creation_statistics(&self, user_id: Option<i64>) -> Result<StatisticsReport> {
        let mut stmt = self.conn.prepare(
            "SELECT n.id, n.ctime, n.node_type
             FROM db_dbnode n
             WHERE ?1 IS NULL OR n.user_id = ?1",
        )?;

        let rows = stmt.query_map(params![user_id], |row| {
            Ok(CreationRecord {
                id: row.get(0)?,
                created_at: parse_timestamp(&row.get::<_, String>(1)?).map_err(to_sql_error)?,
                node_type: row.get(2)?,
            })
        })?;

        let records = collect_rows(rows)?;
        Ok(creation_statistics(&records)?)
    }

    pub fn duplicate_node_uuids(&self) -> Result<Vec<DuplicateUuid>> {
        let mut stmt = self.conn.prepare(
            "SELECT s.id, s.uuid FROM (SELECT *, COUNT(*) OVER(PARTITION BY uuid) AS c FROM db_dbnode)
             AS s WHERE c > 1 ORDER BY s.uuid, s.id",
        )?;

        let rows = stmt.query_map([], |row| {
            Ok(DuplicateUuid {
                id: row.get(0)?,
                uuid: row.get(1)?,
            })
        })?;
        collect_rows(rows)
    }

    /// Executes an arbitrary statement and returns its rows as JSON values.
    pub fn raw(&self, sql: &str) -> Result<Vec<Vec<Value>>> {
        let mut stmt = self
            .conn
            .prepare(sql)
            .with_context(|| format!("failed to prepare raw statement: {sql}"))?;
        let column_count = stmt.column_count();

        let mut rows = stmt.query([])?;
        let mut out = Vec::new();
        while let Some(row) = rows.next()? {
            let mut values = Vec::with_capacity(column_count);
            for index in 0..column_count {
                values.push(sql_value_to_json(row.get_ref(index)?));
            }
            out.push(values);
        }
        Ok(out)
    }

    /// Every node reachable backwards through links from `node_ids`.
    pub fn all_parents(&self, node_ids: &[i64]) -> Result<Vec<NodeSummary>> {
        if node_ids.is_empty() {
            return Ok(Vec::new());
        }

        let sql = format!(
            "WITH RECURSIVE ancestors(id) AS (
                SELECT input_id FROM db_dblink WHERE output_id IN ({})
                UNION
                SELECT l.input_id FROM db_dblink l JOIN ancestors a ON l.output_id = a.id
             )
             SELECT n.id, n.uuid, n.node_type, n.label
             FROM db_dbnode n JOIN ancestors a ON a.id = n.id
             ORDER BY n.id ASC",
            placeholders(node_ids.len())
        );

        let mut stmt = self.conn.prepare(&sql)?;
        let rows = stmt.query_map(params_from_iter(node_ids.iter()), parse_node_summary)?;
        collect_rows(rows)
    }

    /// Bands nodes with their closest ancestor structure and its formula.
    pub fn bands_and_parent_structures(&self, query: &BandsQuery) -> Result<Vec<StructureMatch>> {
        if !has_column(&self.conn, "db_dbnode", FlatRecordKind::Attributes.target_column())? {
            return Err(anyhow!(
                "db_dbnode.attributes is missing; migrate attributes with column creation first"
            ));
        }

        let mut sql = String::from(
            "WITH RECURSIVE lineage(descendant_id, ancestor_id) AS (
                SELECT l.output_id, l.input_id
                FROM db_dblink l JOIN db_dbnode b ON b.id = l.output_id
                WHERE b.node_type = ?
                UNION
                SELECT lineage.descendant_id, l.input_id
                FROM lineage JOIN db_dblink l ON l.output_id = lineage.ancestor_id
             )
             SELECT DISTINCT b.id, b.label, b.ctime, s.id, s.ctime,
                    json_extract(s.attributes, '$.kinds'),
                    json_extract(s.attributes, '$.sites')
             FROM lineage
             JOIN db_dbnode b ON b.id = lineage.descendant_id
             JOIN db_dbuser u ON u.id = b.user_id
             JOIN db_dbnode s ON s.id = lineage.ancestor_id
             WHERE s.node_type = ?",
        );
        let mut bind: Vec<SqlValue> = vec![
            SqlValue::Text(BANDS_NODE_TYPE.to_string()),
            SqlValue::Text(STRUCTURE_NODE_TYPE.to_string()),
        ];

        if let Some(email) = &query.owner_email {
            sql.push_str(" AND u.email = ?");
            bind.push(SqlValue::Text(email.clone()));
        }

        if let Some(days) = query.past_days {
            let since = query.as_of - Duration::days(i64::from(days));
            sql.push_str(" AND b.ctime >= ?");
            bind.push(SqlValue::Text(format_timestamp(since)?));
        }

        if !query.group_names.is_empty() || !query.group_ids.is_empty() {
            sql.push_str(
                " AND EXISTS (SELECT 1 FROM db_dbgroup_dbnodes gn
                   JOIN db_dbgroup g ON g.id = gn.dbgroup_id
                   WHERE gn.dbnode_id = b.id",
            );
            if !query.group_names.is_empty() {
                sql.push_str(&format!(" AND g.name IN ({})", placeholders(query.group_names.len())));
                bind.extend(query.group_names.iter().cloned().map(SqlValue::Text));
            }
            if !query.group_ids.is_empty() {
                sql.push_str(&format!(" AND g.id IN ({})", placeholders(query.group_ids.len())));
                bind.extend(query.group_ids.iter().copied().map(SqlValue::Integer));
            }
            sql.push(')');
        }

        sql.push_str(" ORDER BY s.ctime DESC, s.id DESC");

        let mut stmt = self.conn.prepare(&sql)?;
        let rows = stmt.query_map(params_from_iter(bind), |row| {
            Ok((
                row.get::<_, i64>(0)?,
                row.get::<_, String>(1)?,
                parse_timestamp(&row.get::<_, String>(2)?).map_err(to_sql_error)?,
                row.get::<_, i64>(3)?,
                json_text(row.get_ref(5)?),
                json_text(row.get_ref(6)?),
            ))
        })?;

        let joined = collect_rows(rows)?
            .into_iter()
            .map(|(bands_id, label, bands_ctime, structure_id, kinds, sites)| BandsStructureRow {
                bands_id,
                label,
                bands_ctime,
                structure_id,
                kinds: decode_attribute::<Vec<Kind>>(structure_id, "kinds", kinds),
                sites: decode_attribute::<Vec<Site>>(structure_id, "sites", sites),
            });

        let matches = resolve_closest_structures(joined, &query.filter);
        tracing::debug!(
            formula_mode = query.filter.formula_mode.as_str(),
            matches = matches.len(),
            "resolved bands structures"
        );
        Ok(matches)
    }

    #[cfg(test)]
    fn connection(&self) -> &Connection {
        &self.conn
    }
}

fn decode_attribute<T: serde::de::DeserializeOwned>(
    structure_id: i64,
    name: &str,
    raw: Option<String>,
) -> Option<T> {
    let text = raw?;
    match serde_json::from_str(&text) {
        Ok(value) => Some(value),
        Err(err) => {
            tracing::warn!(structure_id, attribute = name, error = %err, "ignoring malformed structure attribute");
            None
        }
    }
}

// json_extract yields text for containers and native values for scalars.
fn json_text(value: ValueRef<'_>) -> Option<String> {
    match value {
        ValueRef::Text(bytes) => Some(String::from_utf8_lossy(bytes).into_owned()),
        _ => None,
    }
}

fn parse_node_summary(row: &rusqlite::Row<'_>) -> rusqlite::Result<NodeSummary> {
    Ok(NodeSummary {
        id: row.get(0)?,
        uuid: row.get(1)?,
        node_type: row.get(2)?,
        label: row.get(3)?,
    })
}

fn sql_value_to_json(value: ValueRef<'_>) -> Value {
    match value {
        ValueRef::Null => Value::Null,
        ValueRef::Integer(number) => Value::from(number),
        ValueRef::Real(number) => serde_json::Number::from_f64(number)
            .map_or_else(|| Value::String(number.to_string()), Value::Number),
        ValueRef::Text(bytes) => Value::String(String::from_utf8_lossy(bytes).into_owned()),
        ValueRef::Blob(bytes) => Value::Array(bytes.iter().map(|byte| Value::from(*byte)).collect()),
    }
}

fn placeholders(count: usize) -> String {
    vec!["?"; count].join(", ")
}

pub(crate) fn table_columns(conn: &Connection, table_name: &str) -> Result<Vec<String>> {
    let mut stmt = conn
        .prepare(&format!("PRAGMA table_info({table_name})"))
        .with_context(|| format!("failed to inspect table_info for {table_name}"))?;
    let mut rows = stmt.query([])?;

    let mut available = Vec::new();
    while let Some(row) = rows.next()? {
        available.push(row.get::<_, String>(1)?);
    }

    Ok(available)
}

pub(crate) fn has_column(conn: &Connection, table_name: &str, column: &str) -> Result<bool> {
    Ok(table_columns(conn, table_name)?
        .iter()
        .any(|candidate| candidate == column))
}

#[allow(clippy::needless_pass_by_value)]
fn to_sql_error(err: TimestampError) -> rusqlite::Error {
    rusqlite::Error::FromSqlConversionFailure(
        0,
        rusqlite::types::Type::Text,
        Box::new(std::io::Error::new(
            std::io::ErrorKind::InvalidData,
            err.to_string(),
        )),
    )
}

pub(crate) fn collect_rows<T>(
    rows: rusqlite::MappedRows<'_, impl FnMut(&rusqlite::Row<'_>) -> rusqlite::Result<T>>,
) -> Result<Vec<T>> {
    let mut values = Vec::new();
    for row in rows {
        values.push(row?);
    }
    Ok(values)
}
