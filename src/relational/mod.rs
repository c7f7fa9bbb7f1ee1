//! Disk-backed engine over a single-table SQLite file.
//!
//! Large CSV uploads are streamed into one TEXT-affinity relation and all
//! access goes through generated, parameterized SQL. Column identifiers reach
//! SQL only after validation against the relation's column list; every value
//! travels as a bound parameter. There is no undo/redo here and `reset` is an
//! explicit unsupported operation.
//!
//! Statements auto-commit one at a time (imports are batched in
//! transactions), so an interrupted call leaves the relation at its last
//! committed statement.

use crate::ingest::sanitize_column_names;
use crate::table::ops::{CleanOp, EmptyTarget, FilterOperator, TextOperation};
use crate::{AlchemistError, Result};
use rusqlite::types::Value as SqlValue;
use rusqlite::{params_from_iter, Connection};
use serde::Deserialize;
use serde_json::{json, Value};
use std::path::{Path, PathBuf};

/// Rows per import transaction.
pub const IMPORT_CHUNK_ROWS: usize = 50_000;

/// Hard cap on page size.
pub const MAX_PAGE_SIZE: i64 = 500;

const PREVIEW_LIMIT: i64 = 100;

/// One disk-backed relation plus its open connection.
pub struct RelationalStore {
    conn: Connection,
    db_path: PathBuf,
    table: String,
    columns: Vec<String>,
}

/// Pagination request; maps 1:1 onto the page endpoint's query string.
#[derive(Debug, Clone, Deserialize)]
pub struct PageQuery {
    #[serde(default = "default_page")]
    pub page: i64,
    #[serde(default = "default_page_size")]
    pub page_size: i64,
    pub sort_column: Option<String>,
    #[serde(default)]
    pub sort_dir: SortDir,
    pub filter_column: Option<String>,
    pub filter_operator: Option<FilterOperator>,
    pub filter_value: Option<String>,
    pub search_term: Option<String>,
}

impl Default for PageQuery {
    fn default() -> Self {
        Self {
            page: default_page(),
            page_size: default_page_size(),
            sort_column: None,
            sort_dir: SortDir::default(),
            filter_column: None,
            filter_operator: None,
            filter_value: None,
            search_term: None,
        }
    }
}

fn default_page() -> i64 {
    1
}

fn default_page_size() -> i64 {
    50
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SortDir {
    #[default]
    Asc,
    Desc,
}

impl SortDir {
    fn as_sql(self) -> &'static str {
        match self {
            SortDir::Asc => "ASC",
            SortDir::Desc => "DESC",
        }
    }
}

pub(crate) fn sqlite_value_to_json(value: SqlValue) -> Value {
    match value {
        SqlValue::Null => Value::Null,
        SqlValue::Integer(v) => json!(v),
        SqlValue::Real(v) => json!(v),
        SqlValue::Text(s) => json!(s),
        SqlValue::Blob(b) => json!(String::from_utf8_lossy(&b).into_owned()),
    }
}

fn quote_ident(name: &str) -> String {
    format!("\"{}\"", name.replace('"', "\"\""))
}

impl RelationalStore {
    /// Stream a CSV file into a fresh relation, replacing any database file at
    /// `db_path`. Column names are sanitized with the same rules as the
    /// in-memory path; empty fields become NULL.
    pub fn import(db_path: &Path, csv_path: &Path, table: &str) -> Result<Self> {
        if db_path.exists() {
            std::fs::remove_file(db_path)?;
        }

        let mut reader = csv::ReaderBuilder::new()
            .flexible(true)
            .from_path(csv_path)
            .map_err(|e| AlchemistError::Parse(format!("error reading csv file: {}", e)))?;
        let headers: Vec<String> = reader
            .headers()
            .map_err(|e| AlchemistError::Parse(format!("error reading csv header: {}", e)))?
            .iter()
            .map(|s| s.to_string())
            .collect();
        if headers.is_empty() {
            return Err(AlchemistError::Parse("csv file has no columns".to_string()));
        }
        let columns = sanitize_column_names(&headers);

        let mut conn = Connection::open(db_path)?;
        let column_defs: Vec<String> = columns
            .iter()
            .map(|c| format!("{} TEXT", quote_ident(c)))
            .collect();
        conn.execute(
            &format!(
                "CREATE TABLE {} ({})",
                quote_ident(table),
                column_defs.join(", ")
            ),
            [],
        )?;

        let placeholders = vec!["?"; columns.len()].join(", ");
        let quoted: Vec<String> = columns.iter().map(|c| quote_ident(c)).collect();
        let insert_sql = format!(
            "INSERT INTO {} ({}) VALUES ({})",
            quote_ident(table),
            quoted.join(", "),
            placeholders
        );

        let mut batch: Vec<csv::StringRecord> = Vec::with_capacity(IMPORT_CHUNK_ROWS);
        for record in reader.records() {
            let record = record
                .map_err(|e| AlchemistError::Parse(format!("error reading csv row: {}", e)))?;
            batch.push(record);
            if batch.len() == IMPORT_CHUNK_ROWS {
                insert_batch(&mut conn, &insert_sql, columns.len(), &batch)?;
                batch.clear();
            }
        }
        if !batch.is_empty() {
            insert_batch(&mut conn, &insert_sql, columns.len(), &batch)?;
        }

        Ok(Self {
            conn,
            db_path: db_path.to_path_buf(),
            table: table.to_string(),
            columns,
        })
    }

    /// Reopen an existing relation, reading the column list from the schema.
    pub fn open(db_path: &Path, table: &str) -> Result<Self> {
        if !db_path.exists() {
            return Err(AlchemistError::NotFound(format!(
                "database file {} does not exist",
                db_path.display()
            )));
        }
        let conn = Connection::open(db_path)?;

        let mut stmt = conn.prepare(&format!("PRAGMA table_info({})", quote_ident(table)))?;
        let columns: Vec<String> = stmt
            .query_map([], |row| row.get::<_, String>(1))?
            .collect::<std::result::Result<_, _>>()?;
        drop(stmt);
        if columns.is_empty() {
            return Err(AlchemistError::NotFound(format!(
                "relation '{}' does not exist",
                table
            )));
        }

        Ok(Self {
            conn,
            db_path: db_path.to_path_buf(),
            table: table.to_string(),
            columns,
        })
    }

    pub fn db_path(&self) -> &Path {
        &self.db_path
    }

    pub fn table(&self) -> &str {
        &self.table
    }

    pub fn columns(&self) -> &[String] {
        &self.columns
    }

    pub fn row_count(&self) -> Result<i64> {
        let count = self.conn.query_row(
            &format!("SELECT COUNT(1) FROM {}", quote_ident(&self.table)),
            [],
            |row| row.get(0),
        )?;
        Ok(count)
    }

    fn ensure_known_column(&self, name: &str) -> Result<()> {
        if self.columns.iter().any(|c| c == name) {
            Ok(())
        } else {
            Err(AlchemistError::Validation(format!(
                "column '{}' does not exist in the relation",
                name
            )))
        }
    }

    /// Idempotent index creation, used before filtered or sorted scans.
    pub fn ensure_index(&self, column: &str) -> Result<()> {
        self.ensure_known_column(column)?;
        let index_name = format!("idx_{}_{}", self.table, column);
        self.conn.execute(
            &format!(
                "CREATE INDEX IF NOT EXISTS {} ON {} ({})",
                quote_ident(&index_name),
                quote_ident(&self.table),
                quote_ident(column)
            ),
            [],
        )?;
        Ok(())
    }

    fn fetch_rows(&self, sql: &str, params: Vec<SqlValue>) -> Result<Vec<Value>> {
        let mut stmt = self.conn.prepare(sql)?;
        let names: Vec<String> = stmt.column_names().into_iter().map(String::from).collect();
        let mut rows = stmt.query(params_from_iter(params))?;

        let mut out = Vec::new();
        while let Some(row) = rows.next()? {
            let mut obj = serde_json::Map::new();
            for (i, name) in names.iter().enumerate() {
                let value: SqlValue = row.get(i)?;
                obj.insert(name.clone(), sqlite_value_to_json(value));
            }
            out.push(Value::Object(obj));
        }
        Ok(out)
    }

    /// First `limit` rows, unordered.
    pub fn preview(&self, limit: i64) -> Result<Vec<Value>> {
        self.fetch_rows(
            &format!("SELECT * FROM {} LIMIT ?", quote_ident(&self.table)),
            vec![SqlValue::Integer(limit)],
        )
    }

    /// One page of rows under an optional filter, all-column search, and sort.
    ///
    /// The WHERE clause is shared between the row query and the COUNT, so
    /// `total_rows` always describes the same result set as `data`.
    pub fn page(&self, query: &PageQuery) -> Result<Value> {
        let page = query.page.max(1);
        let page_size = query.page_size.clamp(1, MAX_PAGE_SIZE);
        let offset = (page - 1) * page_size;

        if let Some(sort_column) = &query.sort_column {
            self.ensure_known_column(sort_column)
                .map_err(|_| AlchemistError::Validation("invalid sort column".to_string()))?;
            self.ensure_index(sort_column)?;
        }

        let mut where_clauses: Vec<String> = Vec::new();
        let mut params: Vec<SqlValue> = Vec::new();

        let filter_value = query
            .filter_value
            .as_deref()
            .map(str::trim)
            .filter(|v| !v.is_empty());
        if let (Some(column), Some(operator), Some(value)) =
            (&query.filter_column, query.filter_operator, filter_value)
        {
            self.ensure_known_column(column)
                .map_err(|_| AlchemistError::Validation("invalid filter column".to_string()))?;
            self.ensure_index(column)?;

            let ident = quote_ident(column);
            match operator {
                FilterOperator::Equals => {
                    where_clauses.push(format!("lower(CAST({} AS TEXT)) = lower(?)", ident));
                    params.push(SqlValue::Text(value.to_string()));
                }
                FilterOperator::NotEquals => {
                    where_clauses.push(format!("lower(CAST({} AS TEXT)) != lower(?)", ident));
                    params.push(SqlValue::Text(value.to_string()));
                }
                FilterOperator::Contains => {
                    where_clauses.push(format!("lower(CAST({} AS TEXT)) LIKE lower(?)", ident));
                    params.push(SqlValue::Text(format!("%{}%", value)));
                }
                FilterOperator::NotContains => {
                    where_clauses.push(format!("lower(CAST({} AS TEXT)) NOT LIKE lower(?)", ident));
                    params.push(SqlValue::Text(format!("%{}%", value)));
                }
                FilterOperator::GreaterThan => {
                    where_clauses.push(format!("CAST({} AS REAL) > CAST(? AS REAL)", ident));
                    params.push(SqlValue::Text(value.to_string()));
                }
                FilterOperator::LessThan => {
                    where_clauses.push(format!("CAST({} AS REAL) < CAST(? AS REAL)", ident));
                    params.push(SqlValue::Text(value.to_string()));
                }
            }
        }

        let search_term = query
            .search_term
            .as_deref()
            .map(str::trim)
            .filter(|s| !s.is_empty());
        if let Some(term) = search_term {
            let like = format!("%{}%", term);
            let clauses: Vec<String> = self
                .columns
                .iter()
                .map(|c| {
                    params.push(SqlValue::Text(like.clone()));
                    format!("lower(CAST({} AS TEXT)) LIKE lower(?)", quote_ident(c))
                })
                .collect();
            where_clauses.push(format!("({})", clauses.join(" OR ")));
        }

        let where_sql = if where_clauses.is_empty() {
            String::new()
        } else {
            format!("WHERE {}", where_clauses.join(" AND "))
        };

        let order_sql = match &query.sort_column {
            Some(column) => format!(
                "ORDER BY {} {}",
                quote_ident(column),
                query.sort_dir.as_sql()
            ),
            None => String::new(),
        };

        let total_rows: i64 = self.conn.query_row(
            &format!(
                "SELECT COUNT(1) FROM {} {}",
                quote_ident(&self.table),
                where_sql
            ),
            params_from_iter(params.clone()),
            |row| row.get(0),
        )?;

        let mut row_params = params;
        row_params.push(SqlValue::Integer(page_size));
        row_params.push(SqlValue::Integer(offset));
        let data = self.fetch_rows(
            &format!(
                "SELECT * FROM {} {} {} LIMIT ? OFFSET ?",
                quote_ident(&self.table),
                where_sql,
                order_sql
            ),
            row_params,
        )?;

        Ok(json!({
            "data": data,
            "page": page,
            "page_size": page_size,
            "total_rows": total_rows,
            "columns": self.columns,
        }))
    }

    /// Apply the restricted cleaning set. Everything outside it is an
    /// unsupported operation for this mode.
    pub fn clean(&mut self, operations: &[CleanOp]) -> Result<Value> {
        let mut results = Vec::with_capacity(operations.len());

        for operation in operations {
            match operation {
                CleanOp::RemoveDuplicates => {
                    let before = self.row_count()?;
                    let suffix = uuid::Uuid::new_v4().simple().to_string();
                    let mut tmp = format!("{}__dedup_{}", self.table, suffix);
                    tmp.truncate(63);

                    // Rebuild and swap; the relation keeps its name.
                    self.conn.execute(
                        &format!(
                            "CREATE TABLE {} AS SELECT DISTINCT * FROM {}",
                            quote_ident(&tmp),
                            quote_ident(&self.table)
                        ),
                        [],
                    )?;
                    self.conn
                        .execute(&format!("DROP TABLE {}", quote_ident(&self.table)), [])?;
                    self.conn.execute(
                        &format!(
                            "ALTER TABLE {} RENAME TO {}",
                            quote_ident(&tmp),
                            quote_ident(&self.table)
                        ),
                        [],
                    )?;
                    let after = self.row_count()?;

                    results.push(json!({
                        "operation": "remove_duplicates",
                        "removed": before - after,
                    }));
                }

                CleanOp::RemoveEmpty { target } => {
                    if *target != EmptyTarget::Rows {
                        return Err(AlchemistError::Unsupported(
                            "large mode supports remove_empty for rows only".to_string(),
                        ));
                    }
                    let before = self.row_count()?;
                    let predicates: Vec<String> = self
                        .columns
                        .iter()
                        .map(|c| {
                            let ident = quote_ident(c);
                            format!("({} IS NULL OR trim(CAST({} AS TEXT)) = '')", ident, ident)
                        })
                        .collect();
                    self.conn.execute(
                        &format!(
                            "DELETE FROM {} WHERE {}",
                            quote_ident(&self.table),
                            predicates.join(" AND ")
                        ),
                        [],
                    )?;
                    let after = self.row_count()?;

                    results.push(json!({
                        "operation": "remove_empty",
                        "target": "rows",
                        "removed": before - after,
                    }));
                }

                CleanOp::CleanText {
                    columns,
                    text_operations,
                    case_type,
                } => {
                    use crate::table::ops::CaseType;
                    if text_operations.contains(&TextOperation::NormalizeCase)
                        && *case_type == CaseType::Title
                    {
                        return Err(AlchemistError::Unsupported(
                            "large mode supports lower and upper case normalization only"
                                .to_string(),
                        ));
                    }

                    for column in columns {
                        if self.ensure_known_column(column).is_err() {
                            continue;
                        }
                        let ident = quote_ident(column);
                        for text_op in text_operations {
                            let sql = match text_op {
                                TextOperation::TrimWhitespace => format!(
                                    "UPDATE {} SET {} = trim(CAST({} AS TEXT))",
                                    quote_ident(&self.table),
                                    ident,
                                    ident
                                ),
                                TextOperation::NormalizeCase => {
                                    let func = match case_type {
                                        CaseType::Upper => "upper",
                                        _ => "lower",
                                    };
                                    format!(
                                        "UPDATE {} SET {} = {}(CAST({} AS TEXT))",
                                        quote_ident(&self.table),
                                        ident,
                                        func,
                                        ident
                                    )
                                }
                            };
                            self.conn.execute(&sql, [])?;
                        }
                    }

                    results.push(json!({
                        "operation": "clean_text",
                        "columns": columns,
                        "text_operations": text_operations,
                    }));
                }

                other => {
                    return Err(AlchemistError::Unsupported(format!(
                        "operation not supported in large mode: {}",
                        other.name()
                    )));
                }
            }
        }

        let total = self.row_count()?;
        Ok(json!({
            "data": self.preview(PREVIEW_LIMIT)?,
            "shape": [total, self.columns.len()],
            "results": results,
        }))
    }

    /// Distinct rendered values by descending frequency, feeding cluster
    /// suggestion.
    pub fn value_counts(&self, column: &str, limit: i64) -> Result<Vec<(String, u64)>> {
        self.ensure_known_column(column)?;
        let ident = quote_ident(column);
        let mut stmt = self.conn.prepare(&format!(
            "SELECT CAST({} AS TEXT) AS value, COUNT(1) AS count \
             FROM {} WHERE {} IS NOT NULL \
             GROUP BY CAST({} AS TEXT) \
             ORDER BY COUNT(1) DESC, value ASC LIMIT ?",
            ident,
            quote_ident(&self.table),
            ident,
            ident
        ))?;
        let pairs = stmt
            .query_map([limit], |row| {
                Ok((row.get::<_, String>(0)?, row.get::<_, i64>(1)? as u64))
            })?
            .collect::<std::result::Result<Vec<_>, _>>()?;
        Ok(pairs)
    }

    /// Column profile: total/null/blank/unique counts and top values.
    pub fn profile(&self, column: &str, top_n: i64) -> Result<Value> {
        self.ensure_known_column(column)?;
        let ident = quote_ident(column);
        let table = quote_ident(&self.table);

        let total_rows: i64 =
            self.conn
                .query_row(&format!("SELECT COUNT(1) FROM {}", table), [], |r| r.get(0))?;
        let null_rows: i64 = self.conn.query_row(
            &format!("SELECT COUNT(1) FROM {} WHERE {} IS NULL", table, ident),
            [],
            |r| r.get(0),
        )?;
        let empty_rows: i64 = self.conn.query_row(
            &format!(
                "SELECT COUNT(1) FROM {} WHERE trim(CAST({} AS TEXT)) = ''",
                table, ident
            ),
            [],
            |r| r.get(0),
        )?;
        let unique_count: i64 = self.conn.query_row(
            &format!("SELECT COUNT(DISTINCT {}) FROM {}", ident, table),
            [],
            |r| r.get(0),
        )?;

        let mut stmt = self.conn.prepare(&format!(
            "SELECT CAST({} AS TEXT) AS value, COUNT(1) AS count \
             FROM {} GROUP BY CAST({} AS TEXT) \
             ORDER BY COUNT(1) DESC, value ASC LIMIT ?",
            ident, table, ident
        ))?;
        let top_values = stmt
            .query_map([top_n], |row| {
                let value: Option<String> = row.get(0)?;
                let count: i64 = row.get(1)?;
                Ok(json!({
                    "value": value.unwrap_or_default(),
                    "count": count,
                }))
            })?
            .collect::<std::result::Result<Vec<_>, _>>()?;

        Ok(json!({
            "column": column,
            "total_rows": total_rows,
            "null_rows": null_rows,
            "empty_rows": empty_rows,
            "unique_count": unique_count,
            "top_values": top_values,
        }))
    }

    /// Set the listed values of a column to the canonical value, returning the
    /// number of updated rows.
    ///
    /// Rows already holding the canonical are updated (and counted) when the
    /// canonical itself appears in `values`.
    pub fn apply_merge(&self, column: &str, canonical: &str, values: &[String]) -> Result<usize> {
        self.ensure_known_column(column)?;
        if values.is_empty() {
            return Ok(0);
        }
        self.ensure_index(column)?;

        let ident = quote_ident(column);
        let placeholders = vec!["?"; values.len()].join(", ");
        let mut params: Vec<SqlValue> = vec![SqlValue::Text(canonical.to_string())];
        params.extend(values.iter().map(|v| SqlValue::Text(v.clone())));

        let changed = self.conn.execute(
            &format!(
                "UPDATE {} SET {} = ? WHERE CAST({} AS TEXT) IN ({})",
                quote_ident(&self.table),
                ident,
                ident,
                placeholders
            ),
            params_from_iter(params),
        )?;
        Ok(changed)
    }

    /// Visit every row in storage order without materializing the relation.
    pub fn stream_rows<F>(&self, mut visit: F) -> Result<()>
    where
        F: FnMut(&[SqlValue]) -> Result<()>,
    {
        let mut stmt = self
            .conn
            .prepare(&format!("SELECT * FROM {}", quote_ident(&self.table)))?;
        let width = stmt.column_count();
        let mut rows = stmt.query([])?;
        while let Some(row) = rows.next()? {
            let mut values = Vec::with_capacity(width);
            for i in 0..width {
                values.push(row.get::<_, SqlValue>(i)?);
            }
            visit(&values)?;
        }
        Ok(())
    }
}

fn insert_batch(
    conn: &mut Connection,
    insert_sql: &str,
    width: usize,
    batch: &[csv::StringRecord],
) -> Result<()> {
    let tx = conn.transaction()?;
    {
        let mut stmt = tx.prepare_cached(insert_sql)?;
        for record in batch {
            let values: Vec<SqlValue> = (0..width)
                .map(|i| match record.get(i) {
                    Some("") | None => SqlValue::Null,
                    Some(field) => SqlValue::Text(field.to_string()),
                })
                .collect();
            stmt.execute(params_from_iter(values))?;
        }
    }
    tx.commit()?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;
    use tempfile::TempDir;

    fn store_with(csv: &str) -> (TempDir, RelationalStore) {
        let dir = TempDir::new().unwrap();
        let csv_path = dir.path().join("upload.csv");
        std::fs::write(&csv_path, csv).unwrap();
        let store = RelationalStore::import(&dir.path().join("data.db"), &csv_path, "data").unwrap();
        (dir, store)
    }

    fn sample_store() -> (TempDir, RelationalStore) {
        store_with(
            "city,population\n\
             Oslo,700000\n\
             oslo ,1\n\
             Bergen,290000\n\
             Oslo,700000\n\
             ,\n",
        )
    }

    fn clean_ops(value: serde_json::Value) -> Vec<CleanOp> {
        serde_json::from_value(value).unwrap()
    }

    #[test]
    fn test_import_counts_and_columns() {
        let (_dir, store) = sample_store();
        assert_eq!(store.columns(), ["city", "population"]);
        assert_eq!(store.row_count().unwrap(), 5);
    }

    #[test]
    fn test_import_sanitizes_headers_and_nulls_empty_fields() {
        let (_dir, store) = store_with("First Name,price ($)\nx,\n");
        assert_eq!(store.columns(), ["First_Name", "price"]);
        let rows = store.preview(10).unwrap();
        assert!(rows[0]["price"].is_null());
    }

    #[test]
    fn test_open_reads_schema() {
        let (dir, store) = sample_store();
        let path = store.db_path().to_path_buf();
        drop(store);
        let reopened = RelationalStore::open(&path, "data").unwrap();
        assert_eq!(reopened.columns(), ["city", "population"]);
        drop(dir);
    }

    #[test]
    fn test_page_filter_and_count_agree() {
        let (_dir, store) = sample_store();
        let page = store
            .page(&PageQuery {
                filter_column: Some("city".to_string()),
                filter_operator: Some(FilterOperator::Equals),
                filter_value: Some("OSLO".to_string()),
                ..PageQuery::default()
            })
            .unwrap();
        assert_eq!(page["total_rows"], json!(2));
        assert_eq!(page["data"].as_array().unwrap().len(), 2);
    }

    #[test]
    fn test_page_numeric_filter_casts_to_real() {
        let (_dir, store) = sample_store();
        let page = store
            .page(&PageQuery {
                filter_column: Some("population".to_string()),
                filter_operator: Some(FilterOperator::GreaterThan),
                filter_value: Some("500000".to_string()),
                ..PageQuery::default()
            })
            .unwrap();
        assert_eq!(page["total_rows"], json!(2));
    }

    #[test]
    fn test_page_search_spans_all_columns() {
        let (_dir, store) = sample_store();
        let page = store
            .page(&PageQuery {
                search_term: Some("berg".to_string()),
                ..PageQuery::default()
            })
            .unwrap();
        assert_eq!(page["total_rows"], json!(1));
        assert_eq!(page["data"][0]["city"], json!("Bergen"));
    }

    #[test]
    fn test_page_sort_and_window() {
        let (_dir, store) = sample_store();
        let page = store
            .page(&PageQuery {
                page: 2,
                page_size: 2,
                sort_column: Some("city".to_string()),
                sort_dir: SortDir::Desc,
                ..PageQuery::default()
            })
            .unwrap();
        assert_eq!(page["page"], json!(2));
        assert_eq!(page["data"].as_array().unwrap().len(), 2);
        // Full count is unaffected by the page window.
        assert_eq!(page["total_rows"], json!(5));
    }

    #[test]
    fn test_page_rejects_unknown_columns() {
        let (_dir, store) = sample_store();
        let err = store
            .page(&PageQuery {
                sort_column: Some("city\"; DROP TABLE data; --".to_string()),
                ..PageQuery::default()
            })
            .unwrap_err();
        assert!(matches!(err, AlchemistError::Validation(_)));
        assert_eq!(store.row_count().unwrap(), 5);
    }

    #[test]
    fn test_page_size_is_clamped() {
        let (_dir, store) = sample_store();
        let page = store
            .page(&PageQuery {
                page: 0,
                page_size: 10_000,
                ..PageQuery::default()
            })
            .unwrap();
        assert_eq!(page["page"], json!(1));
        assert_eq!(page["page_size"], json!(MAX_PAGE_SIZE));
    }

    #[test]
    fn test_clean_remove_duplicates_rebuilds() {
        let (_dir, mut store) = sample_store();
        let response = store
            .clean(&clean_ops(json!([{"type": "remove_duplicates"}])))
            .unwrap();
        assert_eq!(response["results"][0]["removed"], json!(1));
        assert_eq!(store.row_count().unwrap(), 4);
        // The relation keeps its name after the swap.
        assert_eq!(store.table(), "data");
    }

    #[test]
    fn test_clean_remove_empty_rows() {
        let (_dir, mut store) = sample_store();
        let response = store
            .clean(&clean_ops(json!([{"type": "remove_empty"}])))
            .unwrap();
        assert_eq!(response["results"][0]["removed"], json!(1));
        assert_eq!(store.row_count().unwrap(), 4);
    }

    #[test]
    fn test_clean_text_trim_and_lower() {
        let (_dir, mut store) = sample_store();
        store
            .clean(&clean_ops(json!([{
                "type": "clean_text",
                "columns": ["city"],
                "text_operations": ["trim_whitespace", "normalize_case"]
            }])))
            .unwrap();
        let counts = store.value_counts("city", 10).unwrap();
        assert_eq!(counts[0], ("oslo".to_string(), 3));
    }

    #[test]
    fn test_value_counts_ties_break_by_value() {
        let (_dir, store) = store_with(
            "city,population\n\
             delta,1\n\
             alpha,1\n\
             charlie,1\n\
             bravo,1\n",
        );
        let counts = store.value_counts("city", 10).unwrap();
        let values: Vec<&str> = counts.iter().map(|(v, _)| v.as_str()).collect();
        assert_eq!(values, vec!["alpha", "bravo", "charlie", "delta"]);
    }

    #[test]
    fn test_clean_rejects_unsupported_operations() {
        let (_dir, mut store) = sample_store();
        let err = store
            .clean(&clean_ops(
                json!([{"type": "fill_missing", "column": "city"}]),
            ))
            .unwrap_err();
        assert!(matches!(err, AlchemistError::Unsupported(_)));

        let err = store
            .clean(&clean_ops(json!([{
                "type": "clean_text",
                "columns": ["city"],
                "text_operations": ["normalize_case"],
                "case_type": "title"
            }])))
            .unwrap_err();
        assert!(matches!(err, AlchemistError::Unsupported(_)));
    }

    #[test]
    fn test_profile_counts() {
        let (_dir, store) = sample_store();
        let profile = store.profile("city", 3).unwrap();
        assert_eq!(profile["total_rows"], json!(5));
        assert_eq!(profile["null_rows"], json!(1));
        assert_eq!(profile["unique_count"], json!(3));
        assert_eq!(profile["top_values"][0]["value"], json!("Oslo"));
    }

    #[test]
    fn test_apply_merge_counts_changed_rows() {
        let (_dir, store) = sample_store();
        let changed = store
            .apply_merge("city", "Oslo", &["oslo ".to_string()])
            .unwrap();
        assert_eq!(changed, 1);

        // Values already equal to the canonical still count when listed.
        let changed = store
            .apply_merge("city", "Oslo", &["Oslo".to_string()])
            .unwrap();
        assert_eq!(changed, 3);
    }

    #[test]
    fn test_stream_rows_visits_every_row() {
        let (_dir, store) = sample_store();
        let mut seen = 0;
        store
            .stream_rows(|row| {
                assert_eq!(row.len(), 2);
                seen += 1;
                Ok(())
            })
            .unwrap();
        assert_eq!(seen, 5);
    }
}
