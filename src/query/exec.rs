use std::collections::HashSet;

use itertools::Itertools;
use log::{debug, trace};
use rusqlite::types::ValueRef;
use rusqlite::{Connection, Row, Rows, Statement};
use serde::{Deserialize, Serialize};

use crate::sql_writer::SqlWriter;
use crate::store::KeyStore;
use crate::value::Value;

use super::compiler::QueryCompiler;
use super::QueryError;

type Result<T, E = QueryError> = std::result::Result<T, E>;

/// Options for one enumeration of a compiled query.
#[derive(Debug, Clone)]
pub struct QueryOptions {
    /// Rows to skip from the start of the result set.
    pub skip: u64,
    /// Maximum number of rows to return.
    pub limit: u64,
    /// User parameter bindings, a dictionary keyed by parameter name.
    pub params: Option<Value>,
}

impl Default for QueryOptions {
    fn default() -> Self {
        Self {
            skip: 0,
            limit: u64::MAX,
            params: None,
        }
    }
}

/// One term match reported by a full-text row, decoded from the FTS
/// `offsets()` column.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct FullTextTerm {
    pub term_index: u32,
    pub byte_offset: u32,
    pub byte_length: u32,
}

/// A compiled, prepared query against the document table.
///
/// Compilation translates the selector and sort expressions to SQL once; the
/// prepared statement then lives as long as this object and is rebound and
/// reset for every enumeration.
pub struct SqliteQuery<'conn> {
    stmt: Statement<'conn>,
    sql: String,
    fts_properties: Vec<String>,
    parameters: HashSet<String>,
    column_count: usize,
}

impl<'conn> SqliteQuery<'conn> {
    /// Compiles `selector` (a WHERE expression) and an optional `sort` (an
    /// array of ordering terms) into a prepared statement of the shape
    ///
    /// ```sql
    /// SELECT sequence, key, meta, length(body) [, offsets("<t>::<p>") ...]
    ///   FROM <t> [, "<t>::<p>" AS FTS<i> ...]
    ///   [WHERE (<where>)] [ORDER BY <order>]
    ///   LIMIT $limit OFFSET $offset
    /// ```
    ///
    /// Fails with [QueryError::NoSuchIndex] if a MATCH references a property
    /// the store has no full-text index for.
    pub fn new(
        store: &dyn KeyStore,
        conn: &'conn Connection,
        selector: &Value,
        sort: Option<&Value>,
    ) -> Result<Self> {
        let table = store.table_name();
        let mut qp = QueryCompiler::new(table, "body");
        let where_sql = qp.compile_where(selector)?;
        let order_by_sql = match sort {
            Some(order) => Some(qp.compile_order_by(order)?),
            None => None,
        };

        let mut sql = SqlWriter::new();
        sql.write_str("SELECT sequence, key, meta, length(body)");
        for property in qp.fts_properties() {
            if !store.has_fts_index(property) {
                return Err(QueryError::NoSuchIndex(property.clone()));
            }
            sql.write_str(", offsets(");
            sql.write_name(&format!("{}::{}", table, property));
            sql.write_char(')');
        }
        write!(sql, " FROM {}", table);
        for (i, property) in qp.fts_properties().iter().enumerate() {
            sql.write_str(", ");
            sql.write_name(&format!("{}::{}", table, property));
            write!(sql, " AS FTS{}", i + 1);
        }
        if !where_sql.is_empty() {
            write!(sql, " WHERE ({})", where_sql);
        }
        if let Some(order) = order_by_sql {
            if !order.is_empty() {
                write!(sql, " ORDER BY {}", order);
            }
        }
        sql.write_str(" LIMIT $limit OFFSET $offset");
        let sql = sql.build();
        debug!("compiled query: {}", sql);

        let stmt = conn.prepare(&sql)?;
        let column_count = stmt.column_count();
        Ok(Self {
            stmt,
            sql,
            fts_properties: qp.fts_properties().to_vec(),
            parameters: qp.parameters().clone(),
            column_count,
        })
    }

    /// The prepared SQL.
    pub fn sql(&self) -> &str {
        &self.sql
    }

    /// Property paths joined as FTS tables, in alias order.
    pub fn fts_properties(&self) -> &[String] {
        &self.fts_properties
    }

    /// User parameter names referenced by the query.
    pub fn parameters(&self) -> &HashSet<String> {
        &self.parameters
    }

    /// Starts an enumeration. Clears and rebinds all parameters and steps
    /// from the first row; the borrow makes a second concurrent enumeration
    /// impossible, and dropping the returned rows resets the statement.
    pub fn run(&mut self, options: &QueryOptions) -> Result<QueryRows<'_>> {
        trace!("running query: {}", self.sql);
        // Bindings survive a statement reset, so every user parameter
        // reverts to NULL before this enumeration's values go in.
        for name in &self.parameters {
            let index = self
                .stmt
                .parameter_index(&format!("$_{}", name))?
                .ok_or_else(|| QueryError::InvalidQueryParam(name.clone()))?;
            self.stmt.raw_bind_parameter(index, rusqlite::types::Null)?;
        }
        if let Some(params) = &options.params {
            bind_parameters(&mut self.stmt, params)?;
        }
        let offset = i64::try_from(options.skip).unwrap_or(i64::MAX);
        let limit = i64::try_from(options.limit).unwrap_or(-1);
        bind_named(&mut self.stmt, "$offset", offset)?;
        bind_named(&mut self.stmt, "$limit", limit)?;

        let has_full_text = self.column_count >= 5;
        let rows = self.stmt.raw_query();
        Ok(QueryRows {
            rows,
            fts_properties: &self.fts_properties,
            has_full_text,
            current: None,
        })
    }
}

/// Decodes a `Value` dictionary into statement bindings. Names map to
/// `$_<name>` placeholders; null values are skipped.
fn bind_parameters(stmt: &mut Statement<'_>, params: &Value) -> Result<()> {
    let Some(dict) = params.as_dict() else {
        return Err(QueryError::InvalidParameter(
            "parameter bindings must be a dictionary".to_string(),
        ));
    };
    for (name, value) in dict {
        let key = format!("$_{}", name);
        match value {
            Value::Null => continue,
            Value::Bool(b) => bind_named(stmt, &key, *b as i64)?,
            Value::Int(n) => bind_named(stmt, &key, *n)?,
            Value::Float(f) => bind_named(stmt, &key, *f)?,
            Value::String(s) => bind_named(stmt, &key, s.as_str())?,
            Value::Data(data) => bind_named(stmt, &key, data.as_slice())?,
            Value::Array(_) | Value::Dict(_) => {
                return Err(QueryError::InvalidParameter(format!(
                    "unsupported type for parameter `{}`",
                    name
                )));
            }
        }
    }
    Ok(())
}

fn bind_named<T: rusqlite::ToSql>(
    stmt: &mut Statement<'_>,
    name: &str,
    value: T,
) -> Result<()> {
    let index = stmt
        .parameter_index(name)?
        .ok_or_else(|| QueryError::InvalidQueryParam(name.to_string()))?;
    stmt.raw_bind_parameter(index, value)?;
    Ok(())
}

/// One decoded result row.
#[derive(Debug, Clone)]
pub struct QueryRow {
    pub sequence: i64,
    pub record_id: Vec<u8>,
    pub meta: Vec<u8>,
    pub body_length: u64,
    offsets: Option<String>,
}

impl QueryRow {
    /// Term matches for a full-text row. Empty when the query has no MATCH.
    pub fn full_text_terms(&self) -> Result<Vec<FullTextTerm>> {
        let Some(offsets) = &self.offsets else {
            return Ok(Vec::new());
        };
        // offsets() yields space-separated integers in groups of four:
        // (column, term, byte offset, byte length)
        let numbers: Vec<u32> = offsets
            .split_ascii_whitespace()
            .map(str::parse)
            .collect::<Result<_, _>>()
            .map_err(|e| {
                QueryError::InvalidQuery(format!("unexpected offsets() output: {}", e))
            })?;
        Ok(numbers
            .into_iter()
            .tuples()
            .map(|(_column, term_index, byte_offset, byte_length)| FullTextTerm {
                term_index,
                byte_offset,
                byte_length,
            })
            .collect())
    }
}

/// A scoped enumeration over a compiled query. Dropping it resets the
/// underlying statement (errors swallowed).
pub struct QueryRows<'q> {
    rows: Rows<'q>,
    fts_properties: &'q [String],
    has_full_text: bool,
    current: Option<QueryRow>,
}

impl QueryRows<'_> {
    /// Steps to the next row; `None` at the end of the result set.
    pub fn next(&mut self) -> Result<Option<&QueryRow>> {
        let has_full_text = self.has_full_text;
        match self.rows.next()? {
            None => self.current = None,
            Some(row) => {
                let offsets = if has_full_text {
                    Some(row.get::<_, String>(4)?)
                } else {
                    None
                };
                self.current = Some(QueryRow {
                    sequence: row.get(0)?,
                    record_id: column_bytes(row, 1)?,
                    meta: column_bytes(row, 2)?,
                    body_length: row.get::<_, i64>(3)? as u64,
                    offsets,
                });
            }
        }
        Ok(self.current.as_ref())
    }

    /// Whether the statement carries full-text offset columns.
    pub fn has_full_text(&self) -> bool {
        self.has_full_text
    }

    /// The matched text of the current row, re-read from the store. Empty
    /// when there is no current row, the record is gone, or its sequence no
    /// longer matches (document updated since it was indexed).
    pub fn matched_text(&self, store: &dyn KeyStore) -> Result<String> {
        let (Some(row), Some(property)) = (&self.current, self.fts_properties.first()) else {
            return Ok(String::new());
        };
        let Some(record) = store.read_record(&row.record_id)? else {
            return Ok(String::new());
        };
        if record.sequence != row.sequence {
            return Ok(String::new());
        }
        let body: Value = serde_json::from_slice::<serde_json::Value>(&record.body)?.into();
        // Only the first FTS property's text is recovered; multi-property
        // MATCH queries report terms but not text for the others.
        Ok(body
            .at_path(property)
            .and_then(Value::as_str)
            .unwrap_or_default()
            .to_string())
    }
}

fn column_bytes(row: &Row<'_>, idx: usize) -> Result<Vec<u8>> {
    match row.get_ref(idx)? {
        ValueRef::Null => Ok(Vec::new()),
        ValueRef::Text(t) => Ok(t.to_vec()),
        ValueRef::Blob(b) => Ok(b.to_vec()),
        other => Err(QueryError::Sql(rusqlite::Error::InvalidColumnType(
            idx,
            String::new(),
            other.data_type(),
        ))),
    }
}
