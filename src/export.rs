//! Dataset exporters.
//!
//! In-memory tables export to CSV, XLSX, JSON records, and portable SQL.
//! Disk-backed relations export to portable SQL only, streamed row by row so
//! the relation is never materialized. The SQL dialect keeps to backtick
//! identifiers and ANSI literals so the dump loads into MySQL or SQLite.

use crate::relational::RelationalStore;
use crate::table::json::any_value_to_json;
use crate::{AlchemistError, Result};
use polars::prelude::*;
use rusqlite::types::Value as SqlValue;
use serde_json::Value;

/// Rows per INSERT statement in SQL dumps.
const SQL_BATCH_ROWS: usize = 500;

/// Rows sampled to infer SQL column types for a disk-backed relation.
const SQL_TYPE_SAMPLE_ROWS: i64 = 100;

/// Supported download formats.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ExportFormat {
    Csv,
    Excel,
    Json,
    Sql,
}

impl ExportFormat {
    pub fn parse(name: &str) -> Result<Self> {
        match name.trim().to_lowercase().as_str() {
            "csv" => Ok(ExportFormat::Csv),
            "excel" | "xlsx" => Ok(ExportFormat::Excel),
            "json" => Ok(ExportFormat::Json),
            "sql" => Ok(ExportFormat::Sql),
            other => Err(AlchemistError::Validation(format!(
                "unsupported export format: {}",
                other
            ))),
        }
    }

    pub fn extension(self) -> &'static str {
        match self {
            ExportFormat::Csv => "csv",
            ExportFormat::Excel => "xlsx",
            ExportFormat::Json => "json",
            ExportFormat::Sql => "sql",
        }
    }

    pub fn content_type(self) -> &'static str {
        match self {
            ExportFormat::Csv => "text/csv",
            ExportFormat::Excel => {
                "application/vnd.openxmlformats-officedocument.spreadsheetml.sheet"
            }
            ExportFormat::Json => "application/json",
            ExportFormat::Sql => "text/plain; charset=utf-8",
        }
    }
}

/// A finished export: raw bytes plus the download filename and MIME type.
#[derive(Debug)]
pub struct ExportPayload {
    pub bytes: Vec<u8>,
    pub filename: String,
    pub content_type: &'static str,
}

fn download_name(base: &str, format: ExportFormat) -> String {
    let suffix = format!(".{}", format.extension());
    if base.ends_with(&suffix) {
        base.to_string()
    } else {
        format!("{}{}", base, suffix)
    }
}

fn sql_table_name(base: &str) -> String {
    let name: String = base
        .trim()
        .trim_end_matches(".sql")
        .chars()
        .map(|c| if c.is_ascii_alphanumeric() { c } else { '_' })
        .collect();
    if name.is_empty() || name.chars().next().is_some_and(|c| c.is_ascii_digit()) {
        format!("t_{}", name)
    } else {
        name
    }
}

/// Export an in-memory table.
pub fn export_dataframe(
    df: &DataFrame,
    format: ExportFormat,
    filename: &str,
) -> Result<ExportPayload> {
    let bytes = match format {
        ExportFormat::Csv => dataframe_to_csv(df)?,
        ExportFormat::Excel => dataframe_to_xlsx(df)?,
        ExportFormat::Json => dataframe_to_json(df)?,
        ExportFormat::Sql => dataframe_to_sql(df, &sql_table_name(filename))?,
    };
    Ok(ExportPayload {
        bytes,
        filename: download_name(filename, format),
        content_type: format.content_type(),
    })
}

/// Export a disk-backed relation. Only the SQL dump is streamed from disk;
/// other formats require an in-memory session.
pub fn export_relation(
    store: &RelationalStore,
    format: ExportFormat,
    filename: &str,
) -> Result<ExportPayload> {
    if format != ExportFormat::Sql {
        return Err(AlchemistError::Unsupported(format!(
            "only SQL export is available in large mode, not {}",
            format.extension()
        )));
    }
    let bytes = relation_to_sql(store, &sql_table_name(filename))?;
    Ok(ExportPayload {
        bytes,
        filename: download_name(filename, format),
        content_type: format.content_type(),
    })
}

fn dataframe_to_csv(df: &DataFrame) -> Result<Vec<u8>> {
    let mut buffer = Vec::new();
    let mut df = df.clone();
    CsvWriter::new(&mut buffer)
        .include_header(true)
        .finish(&mut df)?;
    Ok(buffer)
}

fn dataframe_to_json(df: &DataFrame) -> Result<Vec<u8>> {
    let rows = crate::table::json::rows_to_json(df, 0, df.height())?;
    serde_json::to_vec_pretty(&rows)
        .map_err(|e| AlchemistError::Internal(format!("JSON export failed: {}", e)))
}

fn dataframe_to_xlsx(df: &DataFrame) -> Result<Vec<u8>> {
    let xlsx_err = |e: rust_xlsxwriter::XlsxError| {
        AlchemistError::Internal(format!("xlsx export failed: {}", e))
    };

    let mut workbook = rust_xlsxwriter::Workbook::new();
    let sheet = workbook.add_worksheet();

    for (col, name) in df.get_column_names().iter().enumerate() {
        sheet
            .write_string(0, col as u16, name.as_str())
            .map_err(xlsx_err)?;
    }

    let columns = df.get_columns();
    for row in 0..df.height() {
        for (col, column) in columns.iter().enumerate() {
            let cell = (row + 1) as u32;
            match any_value_to_json(column.get(row)?) {
                Value::Null => {}
                Value::Bool(b) => {
                    sheet.write_boolean(cell, col as u16, b).map_err(xlsx_err)?;
                }
                Value::Number(n) => {
                    let v = n.as_f64().unwrap_or(0.0);
                    sheet.write_number(cell, col as u16, v).map_err(xlsx_err)?;
                }
                Value::String(s) => {
                    sheet.write_string(cell, col as u16, &s).map_err(xlsx_err)?;
                }
                other => {
                    sheet
                        .write_string(cell, col as u16, &other.to_string())
                        .map_err(xlsx_err)?;
                }
            }
        }
    }

    workbook.save_to_buffer().map_err(xlsx_err)
}

fn sql_column_type(dtype: &DataType) -> &'static str {
    if dtype.is_integer() {
        "BIGINT"
    } else if dtype.is_float() {
        "DOUBLE"
    } else if dtype == &DataType::Boolean {
        "BOOLEAN"
    } else {
        "TEXT"
    }
}

fn sql_string_literal(s: &str) -> String {
    format!("'{}'", s.replace('\'', "''"))
}

fn json_to_sql_literal(value: &Value) -> String {
    match value {
        Value::Null => "NULL".to_string(),
        Value::Bool(b) => if *b { "1" } else { "0" }.to_string(),
        Value::Number(n) => n.to_string(),
        Value::String(s) => sql_string_literal(s),
        other => sql_string_literal(&other.to_string()),
    }
}

fn write_create_table(out: &mut String, table: &str, columns: &[(String, &'static str)]) {
    out.push_str(&format!("CREATE TABLE `{}` (\n", table));
    for (i, (name, sql_type)) in columns.iter().enumerate() {
        let comma = if i + 1 < columns.len() { "," } else { "" };
        out.push_str(&format!("  `{}` {}{}\n", name, sql_type, comma));
    }
    out.push_str(");\n\n");
}

struct InsertWriter<'a> {
    out: &'a mut String,
    prefix: String,
    pending: Vec<String>,
}

impl<'a> InsertWriter<'a> {
    fn new(out: &'a mut String, table: &str, columns: &[(String, &'static str)]) -> Self {
        let names: Vec<String> = columns
            .iter()
            .map(|(name, _)| format!("`{}`", name))
            .collect();
        Self {
            out,
            prefix: format!("INSERT INTO `{}` ({}) VALUES\n", table, names.join(", ")),
            pending: Vec::new(),
        }
    }

    fn push(&mut self, literals: Vec<String>) {
        self.pending.push(format!("  ({})", literals.join(", ")));
        if self.pending.len() >= SQL_BATCH_ROWS {
            self.flush();
        }
    }

    fn flush(&mut self) {
        if self.pending.is_empty() {
            return;
        }
        self.out.push_str(&self.prefix);
        self.out.push_str(&self.pending.join(",\n"));
        self.out.push_str(";\n");
        self.pending.clear();
    }
}

fn dataframe_to_sql(df: &DataFrame, table: &str) -> Result<Vec<u8>> {
    let columns: Vec<(String, &'static str)> = df
        .get_columns()
        .iter()
        .map(|c| (c.name().to_string(), sql_column_type(c.dtype())))
        .collect();

    let mut out = String::new();
    write_create_table(&mut out, table, &columns);

    let series = df.get_columns();
    let mut writer = InsertWriter::new(&mut out, table, &columns);
    for row in 0..df.height() {
        let mut literals = Vec::with_capacity(series.len());
        for column in series {
            literals.push(json_to_sql_literal(&any_value_to_json(column.get(row)?)));
        }
        writer.push(literals);
    }
    writer.flush();

    Ok(out.into_bytes())
}

/// Infer SQL column types for a TEXT-affinity relation from a row sample.
fn infer_relation_types(store: &RelationalStore) -> Result<Vec<(String, &'static str)>> {
    let sample = store.preview(SQL_TYPE_SAMPLE_ROWS)?;
    let mut columns = Vec::with_capacity(store.columns().len());
    for name in store.columns() {
        let mut seen = false;
        let mut all_int = true;
        let mut all_num = true;
        for row in &sample {
            let Some(value) = row.get(name) else { continue };
            let text = match value {
                Value::Null => continue,
                Value::String(s) if s.trim().is_empty() => continue,
                Value::String(s) => s.trim().to_string(),
                Value::Number(n) => n.to_string(),
                other => other.to_string(),
            };
            seen = true;
            all_int = all_int && text.parse::<i64>().is_ok();
            all_num = all_num && text.parse::<f64>().is_ok();
        }
        let sql_type = if seen && all_int {
            "BIGINT"
        } else if seen && all_num {
            "DOUBLE"
        } else {
            "TEXT"
        };
        columns.push((name.clone(), sql_type));
    }
    Ok(columns)
}

fn sqlite_value_to_sql_literal(value: &SqlValue, sql_type: &str) -> String {
    match value {
        SqlValue::Null => "NULL".to_string(),
        SqlValue::Integer(v) => v.to_string(),
        SqlValue::Real(v) => v.to_string(),
        SqlValue::Text(s) => {
            // Numeric-typed columns carry TEXT affinity on disk; emit bare
            // literals when the cell actually parses.
            if sql_type != "TEXT" && s.trim().parse::<f64>().is_ok() {
                s.trim().to_string()
            } else {
                sql_string_literal(s)
            }
        }
        SqlValue::Blob(b) => sql_string_literal(&String::from_utf8_lossy(b)),
    }
}

fn relation_to_sql(store: &RelationalStore, table: &str) -> Result<Vec<u8>> {
    let columns = infer_relation_types(store)?;

    let mut out = String::new();
    write_create_table(&mut out, table, &columns);

    let mut writer = InsertWriter::new(&mut out, table, &columns);
    store.stream_rows(|row| {
        let literals: Vec<String> = row
            .iter()
            .zip(&columns)
            .map(|(value, (_, sql_type))| sqlite_value_to_sql_literal(value, sql_type))
            .collect();
        writer.push(literals);
        Ok(())
    })?;
    writer.flush();

    Ok(out.into_bytes())
}
