//! File-type sniffing and column-name sanitization.
//!
//! Both engines share the same ingestion rules: the uploaded file's format is
//! determined from its extension first and its content second, and column
//! names are sanitized identically whether the dataset lands in memory or in
//! the SQLite file.

use serde::Serialize;

/// Supported upload formats.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum FileFormat {
    Csv,
    Excel,
    Json,
    Sqlite,
}

impl FileFormat {
    /// Whether the format can be imported in a streaming fashion.
    ///
    /// Only streamable formats are eligible for disk-backed mode.
    pub fn streamable(self) -> bool {
        matches!(self, FileFormat::Csv)
    }

    pub fn as_str(self) -> &'static str {
        match self {
            FileFormat::Csv => "csv",
            FileFormat::Excel => "excel",
            FileFormat::Json => "json",
            FileFormat::Sqlite => "sqlite",
        }
    }
}

const SQLITE_MAGIC: &[u8] = b"SQLite format 3\0";

/// Determine the file format from the filename extension, falling back to
/// content heuristics when the extension is missing or unknown.
pub fn detect_format(content: &[u8], filename: &str) -> Option<FileFormat> {
    let ext = filename
        .rsplit_once('.')
        .map(|(_, e)| e.to_ascii_lowercase())
        .unwrap_or_default();

    match ext.as_str() {
        "csv" => return Some(FileFormat::Csv),
        "xlsx" | "xls" | "xlsm" => return Some(FileFormat::Excel),
        "json" => return Some(FileFormat::Json),
        "db" | "sqlite" | "sqlite3" => return Some(FileFormat::Sqlite),
        _ => {}
    }

    if content.starts_with(SQLITE_MAGIC) {
        return Some(FileFormat::Sqlite);
    }

    if let Ok(text) = std::str::from_utf8(content) {
        if serde_json::from_str::<serde_json::Value>(text).is_ok() {
            return Some(FileFormat::Json);
        }
        // CSV heuristic: the first few non-empty lines all contain commas.
        if text.contains(',') && text.contains('\n') {
            let mut lines = text.lines().filter(|l| !l.trim().is_empty()).take(5);
            if lines.all(|l| l.contains(',')) {
                return Some(FileFormat::Csv);
            }
        }
    }

    None
}

/// Sanitize a list of column names, preserving order and making the results
/// unique.
///
/// Rules: trim whitespace, replace anything outside `[A-Za-z0-9_]` with an
/// underscore, collapse runs of underscores, strip leading/trailing
/// underscores, prefix names that start with a digit with `col_`, and name
/// empty results `unnamed_column`. Collisions get a `_1`, `_2`, ... suffix.
pub fn sanitize_column_names(names: &[String]) -> Vec<String> {
    let mut taken: Vec<String> = Vec::with_capacity(names.len());

    for name in names {
        let mut clean: String = name
            .trim()
            .chars()
            .map(|c| if c.is_alphanumeric() || c == '_' { c } else { '_' })
            .collect();

        while clean.contains("__") {
            clean = clean.replace("__", "_");
        }
        let mut clean = clean.trim_matches('_').to_string();

        if clean.chars().next().is_some_and(|c| c.is_ascii_digit()) {
            clean = format!("col_{}", clean);
        }
        if clean.is_empty() {
            clean = "unnamed_column".to_string();
        }

        let mut unique = clean.clone();
        let mut counter = 1;
        while taken.contains(&unique) {
            unique = format!("{}_{}", clean, counter);
            counter += 1;
        }
        taken.push(unique);
    }

    taken
}
