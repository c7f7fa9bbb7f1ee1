//! In-memory table engine.
//!
//! A [`TabularStore`] owns the live `DataFrame`, an immutable snapshot of the
//! originally loaded data, and a bounded undo/redo history. Mutating calls are
//! preceded by [`TabularStore::save_state`], which pushes the pre-operation
//! snapshot and clears the redo stack. Snapshots are `DataFrame::clone()`,
//! which is cheap (Arc-backed columns) but logically a deep copy.

pub mod json;
pub mod ops;

pub use ops::{CleanOp, FilterOperator, FilterPredicate, TransformOp};

use crate::ingest::{sanitize_column_names, FileFormat};
use crate::relational::sqlite_value_to_json;
use crate::{AlchemistError, Result};
use chrono::{DateTime, Utc};
use polars::prelude::*;
use serde_json::{json, Value};
use std::io::Cursor;
use std::path::Path;

/// Maximum undo depth; the oldest snapshot is discarded beyond this.
pub const MAX_HISTORY: usize = 50;

/// Rows included in load and preview responses.
pub const PREVIEW_ROWS: usize = 100;

struct HistoryEntry {
    snapshot: DataFrame,
    description: String,
    timestamp: DateTime<Utc>,
}

/// The in-memory engine behind small and medium sessions.
#[derive(Default)]
pub struct TabularStore {
    data: Option<DataFrame>,
    original: Option<DataFrame>,
    undo_stack: Vec<HistoryEntry>,
    redo_stack: Vec<HistoryEntry>,
}

impl TabularStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// The live table, or a validation error when nothing is loaded.
    pub fn dataframe(&self) -> Result<&DataFrame> {
        self.data
            .as_ref()
            .ok_or_else(|| AlchemistError::Validation("no dataset loaded".to_string()))
    }

    pub fn shape(&self) -> Result<(usize, usize)> {
        Ok(self.dataframe()?.shape())
    }

    pub fn column_names(&self) -> Result<Vec<String>> {
        Ok(self
            .dataframe()?
            .get_column_names()
            .iter()
            .map(|s| s.to_string())
            .collect())
    }

    /// Load a dataset, replacing whatever was loaded before.
    ///
    /// On failure both the live table and the original snapshot are cleared,
    /// so a half-loaded session can never serve stale rows.
    pub fn load(&mut self, content: &[u8], format: FileFormat) -> Result<Value> {
        self.data = None;
        self.original = None;
        self.undo_stack.clear();
        self.redo_stack.clear();

        let (mut df, sqlite_table) = match format {
            FileFormat::Csv => (read_csv(content)?, None),
            FileFormat::Excel => (read_excel(content)?, None),
            FileFormat::Json => (read_json(content)?, None),
            FileFormat::Sqlite => {
                let (df, table) = read_sqlite(content)?;
                (df, Some(table))
            }
        };

        // JSON columns keep their dotted flatten paths; file headers from the
        // other formats are sanitized.
        if format != FileFormat::Json {
            let sanitized = sanitize_column_names(
                &df.get_column_names()
                    .iter()
                    .map(|s| s.to_string())
                    .collect::<Vec<_>>(),
            );
            df.set_column_names(sanitized)?;
        }

        self.original = Some(df.clone());
        self.data = Some(df);

        let df = self.dataframe()?;
        let preview = json::preview_rows(df, PREVIEW_ROWS)?;
        let mut response = json!({
            "data": preview,
            "preview": preview,
            "columns": column_list(df),
            "shape": [df.height(), df.width()],
            "dtypes": dtype_map(df),
            "note": "full dataset loaded and available for operations",
        });
        if let Some(table) = sqlite_table {
            response["sqlite_table"] = json!(table);
        }
        Ok(response)
    }

    /// Apply an ordered batch of cleaning operations.
    pub fn clean(&mut self, operations: &[CleanOp]) -> Result<Value> {
        self.dataframe()?;
        let mut df = self.data.take().expect("checked above");

        let mut results = Vec::with_capacity(operations.len());
        for operation in operations {
            match ops::apply_clean_op(&mut df, operation) {
                Ok(result) => results.push(result),
                Err(e) => {
                    // Data-access errors abort the batch; already-applied
                    // operations stay applied, the caller's snapshot covers
                    // rollback.
                    self.data = Some(df);
                    return Err(e);
                }
            }
        }

        self.data = Some(df);
        let df = self.dataframe()?;
        Ok(json!({
            "data": json::rows_to_json(df, 0, df.height())?,
            "shape": [df.height(), df.width()],
            "results": results,
        }))
    }

    /// Apply filter predicates as a pure read; the stored table is untouched.
    pub fn filter(&self, filters: &[FilterPredicate]) -> Result<Value> {
        let filtered = ops::apply_filters(self.dataframe()?, filters)?;
        Ok(json!({
            "data": json::rows_to_json(&filtered, 0, filtered.height())?,
            "shape": [filtered.height(), filtered.width()],
        }))
    }

    /// Apply an ordered batch of transform operations.
    pub fn transform(&mut self, operations: &[TransformOp]) -> Result<Value> {
        self.dataframe()?;
        let mut df = self.data.take().expect("checked above");

        let mut results = Vec::with_capacity(operations.len());
        for operation in operations {
            match ops::apply_transform_op(&mut df, operation) {
                Ok(result) => results.push(result),
                Err(e) => {
                    self.data = Some(df);
                    return Err(e);
                }
            }
        }

        self.data = Some(df);
        let df = self.dataframe()?;
        Ok(json!({
            "data": json::rows_to_json(df, 0, df.height())?,
            "shape": [df.height(), df.width()],
            "columns": column_list(df),
            "results": results,
        }))
    }

    /// Push the current table onto the undo stack and clear the redo stack.
    pub fn save_state(&mut self, description: &str) {
        let Some(df) = &self.data else {
            return;
        };
        self.undo_stack.push(HistoryEntry {
            snapshot: df.clone(),
            description: description.to_string(),
            timestamp: Utc::now(),
        });
        self.redo_stack.clear();
        if self.undo_stack.len() > MAX_HISTORY {
            self.undo_stack.remove(0);
        }
    }

    pub fn undo(&mut self) -> Result<Value> {
        let previous = self
            .undo_stack
            .pop()
            .ok_or_else(|| AlchemistError::NoHistory("no operations to undo".to_string()))?;

        if let Some(current) = &self.data {
            self.redo_stack.push(HistoryEntry {
                snapshot: current.clone(),
                description: "state before undo".to_string(),
                timestamp: Utc::now(),
            });
        }

        let message = format!("undid: {}", previous.description);
        self.data = Some(previous.snapshot);
        let df = self.dataframe()?;
        Ok(json!({
            "data": json::rows_to_json(df, 0, df.height())?,
            "shape": [df.height(), df.width()],
            "message": message,
        }))
    }

    pub fn redo(&mut self) -> Result<Value> {
        let next = self
            .redo_stack
            .pop()
            .ok_or_else(|| AlchemistError::NoHistory("no operations to redo".to_string()))?;

        if let Some(current) = &self.data {
            self.undo_stack.push(HistoryEntry {
                snapshot: current.clone(),
                description: "state before redo".to_string(),
                timestamp: Utc::now(),
            });
        }

        let message = format!("redid: {}", next.description);
        self.data = Some(next.snapshot);
        let df = self.dataframe()?;
        Ok(json!({
            "data": json::rows_to_json(df, 0, df.height())?,
            "shape": [df.height(), df.width()],
            "message": message,
        }))
    }

    /// Restore the originally loaded data and drop both history stacks.
    pub fn reset(&mut self) -> Result<Value> {
        let original = self.original.as_ref().ok_or_else(|| {
            AlchemistError::NoOriginal("no original data available to reset to".to_string())
        })?;

        self.data = Some(original.clone());
        self.undo_stack.clear();
        self.redo_stack.clear();

        let df = self.dataframe()?;
        Ok(json!({
            "data": json::rows_to_json(df, 0, df.height())?,
            "shape": [df.height(), df.width()],
            "message": "data reset to original state",
        }))
    }

    pub fn history(&self) -> Value {
        let entries: Vec<Value> = self
            .undo_stack
            .iter()
            .enumerate()
            .map(|(i, entry)| {
                json!({
                    "index": i,
                    "timestamp": entry.timestamp.to_rfc3339(),
                    "description": entry.description,
                    "shape": [entry.snapshot.height(), entry.snapshot.width()],
                })
            })
            .collect();

        json!({
            "history": entries,
            "can_undo": !self.undo_stack.is_empty(),
            "can_redo": !self.redo_stack.is_empty(),
        })
    }

    pub fn info(&self) -> Result<Value> {
        let df = self.dataframe()?;

        let mut missing = serde_json::Map::new();
        let mut numeric = Vec::new();
        let mut categorical = Vec::new();
        let mut datetime = Vec::new();
        for column in df.get_columns() {
            let name = column.name().to_string();
            missing.insert(name.clone(), json!(column.null_count()));
            match column.dtype() {
                dt if ops::is_numeric(dt) => numeric.push(name),
                DataType::String => categorical.push(name),
                DataType::Date | DataType::Datetime(_, _) | DataType::Time => datetime.push(name),
                _ => {}
            }
        }

        Ok(json!({
            "shape": [df.height(), df.width()],
            "columns": column_list(df),
            "dtypes": dtype_map(df),
            "missing_values": missing,
            "memory_usage": df.estimated_size(),
            "numeric_columns": numeric,
            "categorical_columns": categorical,
            "datetime_columns": datetime,
        }))
    }

    /// Dry-run cleaning operations against a sample, leaving the live table
    /// and history untouched.
    ///
    /// The sample is either caller-supplied rows (typically the rows a client
    /// already holds) or the first `sample_size` live rows.
    pub fn preview_operations(
        &self,
        operations: &[CleanOp],
        sample_size: usize,
        source_rows: Option<&[Value]>,
    ) -> Result<Value> {
        let mut sample = match source_rows {
            Some(rows) => json::df_from_records(rows)?,
            None => self.dataframe()?.head(Some(sample_size)),
        };
        let original = json::rows_to_json(&sample, 0, sample.height())?;

        let mut results = Vec::with_capacity(operations.len());
        for operation in operations {
            results.push(ops::apply_clean_op(&mut sample, operation)?);
        }

        Ok(json!({
            "original_data": original,
            "preview_data": json::rows_to_json(&sample, 0, sample.height())?,
            "results": results,
            "sample_size": sample.height(),
            "note": match source_rows {
                Some(rows) => format!("preview computed on {} caller-supplied rows", rows.len()),
                None => format!("preview limited to {} rows", sample_size),
            },
        }))
    }

    /// Distinct rendered values of a text-like column by descending count.
    pub fn value_counts(&self, column: &str, limit: usize) -> Result<Vec<(String, u64)>> {
        let df = self.dataframe()?;
        let series = df
            .column(column)
            .map_err(|_| AlchemistError::NotFound(format!("column '{}' does not exist", column)))?
            .as_materialized_series()
            .clone();
        let cast = series.cast(&DataType::String)?;
        let values = cast.str()?;

        let mut counts: std::collections::HashMap<String, u64> = std::collections::HashMap::new();
        for value in values.into_iter().flatten() {
            *counts.entry(value.to_string()).or_insert(0) += 1;
        }

        let mut pairs: Vec<(String, u64)> = counts.into_iter().collect();
        pairs.sort_by(|a, b| b.1.cmp(&a.1).then_with(|| a.0.cmp(&b.0)));
        pairs.truncate(limit);
        Ok(pairs)
    }

    /// Bulk-replace the listed values of a column with the canonical.
    /// The column is rendered as text first, so a merge on a numeric column
    /// leaves it as a text column. The caller is expected to `save_state`
    /// first.
    pub fn apply_merge(&mut self, column: &str, canonical: &str, values: &[String]) -> Result<()> {
        let df = self.dataframe()?;
        let series = df
            .column(column)
            .map_err(|_| AlchemistError::NotFound(format!("column '{}' does not exist", column)))?
            .as_materialized_series()
            .clone();
        let cast = series.cast(&DataType::String)?;

        let targets: std::collections::HashSet<&str> =
            values.iter().map(String::as_str).collect();
        let replaced: Vec<Option<String>> = cast
            .str()?
            .into_iter()
            .map(|v| {
                v.map(|s| {
                    if targets.contains(s) {
                        canonical.to_string()
                    } else {
                        s.to_string()
                    }
                })
            })
            .collect();

        let df = self.data.as_mut().expect("checked above");
        df.with_column(Series::new(column.into(), replaced))?;
        Ok(())
    }
}

fn column_list(df: &DataFrame) -> Vec<String> {
    df.get_column_names()
        .iter()
        .map(|s| s.to_string())
        .collect()
}

fn dtype_map(df: &DataFrame) -> Value {
    let mut map = serde_json::Map::new();
    for column in df.get_columns() {
        map.insert(
            column.name().to_string(),
            json!(column.dtype().to_string()),
        );
    }
    Value::Object(map)
}

fn read_csv(content: &[u8]) -> Result<DataFrame> {
    CsvReadOptions::default()
        .with_infer_schema_length(Some(1000))
        .into_reader_with_file_handle(Cursor::new(content))
        .finish()
        .map_err(|e| AlchemistError::Parse(format!("error loading csv file: {}", e)))
}

fn read_excel(content: &[u8]) -> Result<DataFrame> {
    use calamine::{Data, Reader};

    let mut workbook = calamine::open_workbook_auto_from_rs(Cursor::new(content))
        .map_err(|e| AlchemistError::Parse(format!("error loading excel file: {}", e)))?;
    let sheet = workbook
        .sheet_names()
        .first()
        .cloned()
        .ok_or_else(|| AlchemistError::Parse("workbook has no sheets".to_string()))?;
    let range = workbook
        .worksheet_range(&sheet)
        .map_err(|e| AlchemistError::Parse(format!("error loading excel file: {}", e)))?;

    let mut rows = range.rows();
    let headers: Vec<String> = rows
        .next()
        .ok_or_else(|| AlchemistError::Parse("worksheet is empty".to_string()))?
        .iter()
        .map(|cell| match cell {
            Data::Empty => String::new(),
            other => other.to_string(),
        })
        .collect();

    let records: Vec<Value> = rows
        .map(|row| {
            let mut obj = serde_json::Map::new();
            for (header, cell) in headers.iter().zip(row) {
                let value = match cell {
                    Data::Empty => Value::Null,
                    Data::Int(v) => json!(v),
                    Data::Float(v) => json!(v),
                    Data::Bool(v) => json!(v),
                    Data::String(s) => json!(s),
                    Data::DateTime(dt) => match dt.as_datetime() {
                        Some(naive) => json!(naive.format("%Y-%m-%dT%H:%M:%S%.3f").to_string()),
                        None => json!(dt.as_f64()),
                    },
                    Data::DateTimeIso(s) | Data::DurationIso(s) => json!(s),
                    Data::Error(_) => Value::Null,
                };
                obj.insert(header.clone(), value);
            }
            Value::Object(obj)
        })
        .collect();

    if records.is_empty() {
        let columns: Vec<Column> = headers
            .iter()
            .map(|h| Series::new_empty(h.as_str().into(), &DataType::String).into())
            .collect();
        return DataFrame::new(columns).map_err(AlchemistError::from);
    }
    json::df_from_records(&records)
}

fn read_json(content: &[u8]) -> Result<DataFrame> {
    let text = std::str::from_utf8(content)
        .map_err(|e| AlchemistError::Parse(format!("invalid utf-8 in json file: {}", e)))?;
    let value: Value = serde_json::from_str(text)
        .map_err(|e| AlchemistError::Parse(format!("invalid json format: {}", e)))?;

    match value {
        Value::Array(items) => json::df_from_records(&items),
        Value::Object(obj) => {
            let nested = obj
                .values()
                .any(|v| matches!(v, Value::Object(_) | Value::Array(_)));
            let record = if nested {
                Value::Object(json::flatten_object(&obj))
            } else {
                Value::Object(obj)
            };
            json::df_from_records(&[record])
        }
        _ => Err(AlchemistError::Parse(
            "json file must contain an object or an array of objects".to_string(),
        )),
    }
}

fn read_sqlite(content: &[u8]) -> Result<(DataFrame, String)> {
    let path = std::env::temp_dir().join(format!("alchemist-upload-{}.db", uuid::Uuid::new_v4()));
    std::fs::write(&path, content)?;
    let result = read_first_sqlite_table(&path);
    let _ = std::fs::remove_file(&path);
    result
}

fn read_first_sqlite_table(path: &Path) -> Result<(DataFrame, String)> {
    let conn = rusqlite::Connection::open_with_flags(
        path,
        rusqlite::OpenFlags::SQLITE_OPEN_READ_ONLY,
    )
    .map_err(|e| AlchemistError::Parse(format!("error loading sqlite file: {}", e)))?;

    let table: String = conn
        .query_row(
            "SELECT name FROM sqlite_master \
             WHERE type = 'table' AND name NOT LIKE 'sqlite_%' ORDER BY name LIMIT 1",
            [],
            |row| row.get(0),
        )
        .map_err(|_| AlchemistError::Parse("no tables found in the sqlite database".to_string()))?;

    let quoted = format!("\"{}\"", table.replace('"', "\"\""));
    let mut stmt = conn.prepare(&format!("SELECT * FROM {}", quoted))?;
    let names: Vec<String> = stmt.column_names().into_iter().map(String::from).collect();

    let mut records = Vec::new();
    let mut rows = stmt.query([])?;
    while let Some(row) = rows.next()? {
        let mut obj = serde_json::Map::new();
        for (i, name) in names.iter().enumerate() {
            let value: rusqlite::types::Value = row.get(i)?;
            obj.insert(name.clone(), sqlite_value_to_json(value));
        }
        records.push(Value::Object(obj));
    }

    let df = if records.is_empty() {
        let columns: Vec<Column> = names
            .iter()
            .map(|n| Series::new_empty(n.as_str().into(), &DataType::String).into())
            .collect();
        DataFrame::new(columns)?
    } else {
        json::df_from_records(&records)?
    };
    Ok((df, table))
}
