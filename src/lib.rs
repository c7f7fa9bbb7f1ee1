//! Alchemist - data cleaning and transformation backend
//!
//! The core of the crate is a dual-engine data session: uploaded datasets are
//! served either by an in-memory Polars engine (full operation vocabulary,
//! undo/redo) or by a disk-backed SQLite engine (large CSVs, paginated access,
//! restricted operation set). The [`session`] module owns the mapping from
//! session id to engine and presents one contract regardless of backing store.
//!
//! # Architecture
//!
//! - [`table`] - in-memory engine over a Polars `DataFrame` with bounded
//!   undo/redo history
//! - [`relational`] - disk engine over a single-table SQLite file
//! - [`cluster`] - fingerprint-based grouping of near-duplicate values
//! - [`session`] - session routing and metadata persistence
//! - [`expr`] - the expression language behind `create_column`
//! - [`stats`] - descriptive statistics over the in-memory table
//! - [`export`] - CSV / XLSX / JSON / portable SQL exporters
//! - [`ingest`] - file-type sniffing and column-name sanitization

pub mod cluster;
pub mod export;
pub mod expr;
pub mod ingest;
pub mod relational;
pub mod session;
pub mod stats;
pub mod table;

pub use polars::prelude::DataFrame;

pub use session::{SessionManager, SessionMode};
pub use table::TabularStore;

/// Crate version, exposed by the REST API.
pub const VERSION: &str = env!("CARGO_PKG_VERSION");

/// Errors produced by the alchemist core.
///
/// Every error is recovered at the request boundary and converted into a
/// `{success: false, error, detail?}` response; none of these crash the
/// process.
#[derive(Debug, thiserror::Error)]
pub enum AlchemistError {
    /// Bad or missing request fields; user-correctable.
    #[error("Validation error: {0}")]
    Validation(String),

    /// Operation not valid for the session's mode, or unknown op type.
    #[error("Unsupported operation: {0}")]
    Unsupported(String),

    /// Session, column, or relation absent.
    #[error("Not found: {0}")]
    NotFound(String),

    /// Undo/redo requested with an empty stack.
    #[error("No history: {0}")]
    NoHistory(String),

    /// Reset requested but nothing was ever loaded.
    #[error("No original data: {0}")]
    NoOriginal(String),

    /// Disk or database I/O failure.
    #[error("Storage error: {0}")]
    Storage(String),

    /// Malformed input file.
    #[error("Parse error: {0}")]
    Parse(String),

    /// Bug-class failure; should not happen with valid inputs.
    #[error("Internal error: {0}")]
    Internal(String),
}

/// Convenience result type used throughout the crate.
pub type Result<T> = std::result::Result<T, AlchemistError>;

impl From<polars::prelude::PolarsError> for AlchemistError {
    fn from(err: polars::prelude::PolarsError) -> Self {
        AlchemistError::Internal(format!("dataframe operation failed: {}", err))
    }
}

impl From<rusqlite::Error> for AlchemistError {
    fn from(err: rusqlite::Error) -> Self {
        AlchemistError::Storage(format!("sqlite operation failed: {}", err))
    }
}

impl From<std::io::Error> for AlchemistError {
    fn from(err: std::io::Error) -> Self {
        AlchemistError::Storage(format!("I/O failure: {}", err))
    }
}
