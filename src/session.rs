//! Session routing.
//!
//! A session binds an id to exactly one engine, chosen at upload time and
//! never changed afterwards: large CSVs go to the disk-backed
//! [`RelationalStore`], everything else to the in-memory [`TabularStore`].
//! Every request is dispatched to the owning engine; operations the engine
//! does not support come back as `Unsupported` instead of silently degrading.
//!
//! Each session owns its store behind its own `Mutex`, so the table and its
//! history always move together and sessions never contend with each other.
//! The manager's id map sits behind an `RwLock`.

use crate::cluster;
use crate::ingest::{detect_format, FileFormat};
use crate::relational::{PageQuery, RelationalStore};
use crate::table::{CleanOp, FilterPredicate, TabularStore, TransformOp};
use crate::{AlchemistError, Result};
use chrono::Utc;
use serde::{Deserialize, Serialize};
use serde_json::{json, Value};
use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex, MutexGuard, RwLock};

/// Uploads at or above this size that are CSV go to the disk engine.
pub const DEFAULT_LARGE_FILE_THRESHOLD: usize = 25 * 1024 * 1024;

/// Default and bounds for the cluster suggestion scan.
pub const DEFAULT_MAX_UNIQUE_SCANNED: i64 = 2000;
const MIN_UNIQUE_SCANNED: i64 = 50;
const MAX_UNIQUE_SCANNED: i64 = 10_000;

const PREVIEW_LIMIT: i64 = 100;
const DISK_RELATION: &str = "data";

/// Which engine serves a session.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SessionMode {
    InMemory,
    DiskBacked,
}

/// Persisted session record. Live table content is never part of this.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SessionMeta {
    pub session_id: String,
    pub filename: String,
    pub mode: SessionMode,
    pub created_at: String,
    pub file_format: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub stored_path: Option<PathBuf>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub db_path: Option<PathBuf>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub relation: Option<String>,
    #[serde(default)]
    pub columns: Vec<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub row_count: Option<i64>,
}

/// JSON-file key-value store for session metadata.
///
/// Writes are best-effort: once the data mutation has succeeded, a failed
/// metadata write is logged and never fails the triggering request.
pub struct SessionStore {
    dir: PathBuf,
}

impl SessionStore {
    pub fn new(dir: PathBuf) -> Self {
        if let Err(e) = std::fs::create_dir_all(&dir) {
            tracing::warn!(dir = %dir.display(), error = %e, "could not create session directory");
        }
        Self { dir }
    }

    fn path_for(&self, session_id: &str) -> PathBuf {
        self.dir.join(format!("{}.json", session_id))
    }

    pub fn put(&self, meta: &SessionMeta) {
        let path = self.path_for(&meta.session_id);
        let result = serde_json::to_vec_pretty(meta)
            .map_err(std::io::Error::other)
            .and_then(|bytes| std::fs::write(&path, bytes));
        if let Err(e) = result {
            tracing::warn!(session_id = %meta.session_id, error = %e, "session metadata write failed");
        }
    }

    pub fn get(&self, session_id: &str) -> Option<SessionMeta> {
        let bytes = std::fs::read(self.path_for(session_id)).ok()?;
        serde_json::from_slice(&bytes).ok()
    }
}

enum Engine {
    InMemory(Mutex<TabularStore>),
    DiskBacked(Mutex<RelationalStore>),
}

/// One live session: metadata plus its owning engine.
pub struct SessionHandle {
    meta: Mutex<SessionMeta>,
    engine: Engine,
}

impl SessionHandle {
    pub fn meta(&self) -> Result<SessionMeta> {
        Ok(lock(&self.meta)?.clone())
    }

    pub fn mode(&self) -> Result<SessionMode> {
        Ok(lock(&self.meta)?.mode)
    }
}

fn lock<T>(mutex: &Mutex<T>) -> Result<MutexGuard<'_, T>> {
    mutex
        .lock()
        .map_err(|_| AlchemistError::Internal("session lock poisoned".to_string()))
}

/// Build an operation log entry for a mutation response.
pub fn operation_log(operation_type: &str, details: Value) -> Value {
    json!({
        "timestamp": Utc::now().to_rfc3339(),
        "operation_type": operation_type,
        "details": details,
        "log_id": uuid::Uuid::new_v4().to_string(),
    })
}

/// Owns every live session and routes requests to the right engine.
pub struct SessionManager {
    sessions: RwLock<HashMap<String, Arc<SessionHandle>>>,
    store: SessionStore,
    uploads_dir: PathBuf,
    large_file_threshold: usize,
}

impl SessionManager {
    pub fn new(data_dir: &Path, large_file_threshold: usize) -> Result<Self> {
        let uploads_dir = data_dir.join("uploads");
        std::fs::create_dir_all(&uploads_dir)?;
        Ok(Self {
            sessions: RwLock::new(HashMap::new()),
            store: SessionStore::new(data_dir.join("sessions")),
            uploads_dir,
            large_file_threshold,
        })
    }

    pub fn session_count(&self) -> Result<usize> {
        let sessions = self
            .sessions
            .read()
            .map_err(|_| AlchemistError::Internal("session map lock poisoned".to_string()))?;
        Ok(sessions.len())
    }

    pub fn handle(&self, session_id: &str) -> Result<Arc<SessionHandle>> {
        let sessions = self
            .sessions
            .read()
            .map_err(|_| AlchemistError::Internal("session map lock poisoned".to_string()))?;
        sessions.get(session_id).cloned().ok_or_else(|| {
            AlchemistError::NotFound(format!("session '{}' does not exist", session_id))
        })
    }

    fn insert(&self, session_id: &str, handle: SessionHandle) -> Result<Arc<SessionHandle>> {
        let handle = Arc::new(handle);
        let mut sessions = self
            .sessions
            .write()
            .map_err(|_| AlchemistError::Internal("session map lock poisoned".to_string()))?;
        sessions.insert(session_id.to_string(), Arc::clone(&handle));
        Ok(handle)
    }

    fn persist_meta(&self, handle: &SessionHandle) -> Result<()> {
        let meta = handle.meta()?;
        self.store.put(&meta);
        Ok(())
    }

    /// Ingest an upload, pick the engine, and create (or replace) the session.
    pub fn upload(
        &self,
        filename: &str,
        content: &[u8],
        session_id: Option<String>,
    ) -> Result<Value> {
        let session_id = session_id.unwrap_or_else(|| uuid::Uuid::new_v4().to_string());
        if filename.is_empty() {
            return Err(AlchemistError::Validation("no file selected".to_string()));
        }

        let format = detect_format(content, filename).ok_or_else(|| {
            AlchemistError::Validation(format!("unsupported file type: {}", filename))
        })?;

        if content.len() >= self.large_file_threshold && format.streamable() {
            self.upload_disk_backed(&session_id, filename, content)
        } else {
            self.upload_in_memory(&session_id, filename, content, format)
        }
    }

    fn upload_in_memory(
        &self,
        session_id: &str,
        filename: &str,
        content: &[u8],
        format: FileFormat,
    ) -> Result<Value> {
        let mut table = TabularStore::new();
        let data_info = table.load(content, format)?;

        let columns: Vec<String> =
            serde_json::from_value(data_info["columns"].clone()).unwrap_or_default();
        let row_count = data_info["shape"][0].as_i64();

        let meta = SessionMeta {
            session_id: session_id.to_string(),
            filename: filename.to_string(),
            mode: SessionMode::InMemory,
            created_at: Utc::now().to_rfc3339(),
            file_format: format.as_str().to_string(),
            stored_path: None,
            db_path: None,
            relation: None,
            columns,
            row_count,
        };
        let handle = self.insert(
            session_id,
            SessionHandle {
                meta: Mutex::new(meta),
                engine: Engine::InMemory(Mutex::new(table)),
            },
        )?;
        self.persist_meta(&handle)?;

        Ok(json!({
            "session_id": session_id,
            "data_info": data_info,
            "large_mode": false,
            "operation_log": operation_log("upload", json!({
                "filename": filename,
                "file_type": format.as_str(),
                "large_mode": false,
            })),
        }))
    }

    fn upload_disk_backed(&self, session_id: &str, filename: &str, content: &[u8]) -> Result<Value> {
        let upload_id = uuid::Uuid::new_v4().to_string();
        let safe_name = filename.rsplit(['/', '\\']).next().unwrap_or("upload.csv");
        let stored_path = self
            .uploads_dir
            .join(format!("{}__{}", upload_id, safe_name));
        std::fs::write(&stored_path, content)?;

        let db_path = self.uploads_dir.join(format!("{}.db", upload_id));
        let relational = RelationalStore::import(&db_path, &stored_path, DISK_RELATION)?;

        let columns = relational.columns().to_vec();
        let total_rows = relational.row_count()?;
        let preview = relational.preview(PREVIEW_LIMIT)?;
        let dtypes: Value = columns
            .iter()
            .map(|c| (c.clone(), json!("unknown")))
            .collect::<serde_json::Map<_, _>>()
            .into();

        let meta = SessionMeta {
            session_id: session_id.to_string(),
            filename: filename.to_string(),
            mode: SessionMode::DiskBacked,
            created_at: Utc::now().to_rfc3339(),
            file_format: "csv".to_string(),
            stored_path: Some(stored_path),
            db_path: Some(db_path),
            relation: Some(DISK_RELATION.to_string()),
            columns: columns.clone(),
            row_count: Some(total_rows),
        };
        let handle = self.insert(
            session_id,
            SessionHandle {
                meta: Mutex::new(meta),
                engine: Engine::DiskBacked(Mutex::new(relational)),
            },
        )?;
        self.persist_meta(&handle)?;

        Ok(json!({
            "session_id": session_id,
            "data_info": {
                "data": preview,
                "preview": preview,
                "columns": columns,
                "shape": [total_rows, columns.len()],
                "dtypes": dtypes,
                "note": "large file mode: data is paginated and operations are limited",
            },
            "large_mode": true,
            "pagination": { "total_rows": total_rows },
            "operation_log": operation_log("upload", json!({
                "filename": filename,
                "file_type": "csv",
                "large_mode": true,
            })),
        }))
    }

    /// Run a closure against the in-memory table of a session.
    pub fn with_table<R>(
        &self,
        session_id: &str,
        f: impl FnOnce(&TabularStore) -> Result<R>,
    ) -> Result<R> {
        let handle = self.handle(session_id)?;
        match &handle.engine {
            Engine::InMemory(table) => f(&*lock(table)?),
            Engine::DiskBacked(_) => Err(AlchemistError::Unsupported(
                "operation requires an in-memory session".to_string(),
            )),
        }
    }

    /// Run a closure against the disk-backed relation of a session.
    pub fn with_relational<R>(
        &self,
        session_id: &str,
        f: impl FnOnce(&RelationalStore) -> Result<R>,
    ) -> Result<R> {
        let handle = self.handle(session_id)?;
        match &handle.engine {
            Engine::DiskBacked(store) => f(&*lock(store)?),
            Engine::InMemory(_) => Err(AlchemistError::Unsupported(
                "session is not in large file mode".to_string(),
            )),
        }
    }

    pub fn clean(&self, session_id: &str, operations: &[CleanOp]) -> Result<Value> {
        let handle = self.handle(session_id)?;
        let mut response = match &handle.engine {
            Engine::InMemory(table) => {
                let mut table = lock(table)?;
                table.save_state("clean operation");
                let response = table.clean(operations)?;
                let columns = table.column_names()?;
                drop(table);
                let mut meta = lock(&handle.meta)?;
                meta.columns = columns;
                meta.row_count = response["shape"][0].as_i64();
                drop(meta);
                response
            }
            Engine::DiskBacked(store) => {
                let response = lock(store)?.clean(operations)?;
                let mut meta = lock(&handle.meta)?;
                meta.row_count = response["shape"][0].as_i64();
                drop(meta);
                response
            }
        };
        self.persist_meta(&handle)?;
        response["operation_log"] = operation_log(
            "clean",
            json!({
                "operations": operations.len(),
                "large_mode": handle.mode()? == SessionMode::DiskBacked,
            }),
        );
        Ok(response)
    }

    pub fn filter(&self, session_id: &str, filters: &[FilterPredicate]) -> Result<Value> {
        let handle = self.handle(session_id)?;
        match &handle.engine {
            Engine::InMemory(table) => {
                let mut response = lock(table)?.filter(filters)?;
                response["operation_log"] =
                    operation_log("filter", json!({ "filters": filters.len() }));
                Ok(response)
            }
            Engine::DiskBacked(_) => Err(AlchemistError::Unsupported(
                "filtering a large session is served by the page endpoint".to_string(),
            )),
        }
    }

    pub fn transform(&self, session_id: &str, operations: &[TransformOp]) -> Result<Value> {
        let handle = self.handle(session_id)?;
        match &handle.engine {
            Engine::InMemory(table) => {
                let mut table = lock(table)?;
                table.save_state("transform operation");
                let mut response = table.transform(operations)?;
                drop(table);
                {
                    let mut meta = lock(&handle.meta)?;
                    meta.columns =
                        serde_json::from_value(response["columns"].clone()).unwrap_or_default();
                    meta.row_count = response["shape"][0].as_i64();
                }
                self.persist_meta(&handle)?;
                response["operation_log"] =
                    operation_log("transform", json!({ "operations": operations.len() }));
                Ok(response)
            }
            Engine::DiskBacked(_) => Err(AlchemistError::Unsupported(
                "transforms are not supported in large mode".to_string(),
            )),
        }
    }

    pub fn preview_operations(
        &self,
        session_id: &str,
        operations: &[CleanOp],
        sample_size: usize,
        source_rows: Option<&[Value]>,
    ) -> Result<Value> {
        self.with_table(session_id, |table| {
            table.preview_operations(operations, sample_size, source_rows)
        })
    }

    pub fn undo(&self, session_id: &str) -> Result<Value> {
        let handle = self.handle(session_id)?;
        match &handle.engine {
            Engine::InMemory(table) => lock(table)?.undo(),
            Engine::DiskBacked(_) => Err(AlchemistError::Unsupported(
                "undo is not supported in large mode".to_string(),
            )),
        }
    }

    pub fn redo(&self, session_id: &str) -> Result<Value> {
        let handle = self.handle(session_id)?;
        match &handle.engine {
            Engine::InMemory(table) => lock(table)?.redo(),
            Engine::DiskBacked(_) => Err(AlchemistError::Unsupported(
                "redo is not supported in large mode".to_string(),
            )),
        }
    }

    pub fn reset(&self, session_id: &str) -> Result<Value> {
        let handle = self.handle(session_id)?;
        match &handle.engine {
            Engine::InMemory(table) => lock(table)?.reset(),
            Engine::DiskBacked(_) => Err(AlchemistError::Unsupported(
                "reset is not supported in large mode".to_string(),
            )),
        }
    }

    pub fn history(&self, session_id: &str) -> Result<Value> {
        let handle = self.handle(session_id)?;
        match &handle.engine {
            Engine::InMemory(table) => Ok(lock(table)?.history()),
            Engine::DiskBacked(_) => Err(AlchemistError::Unsupported(
                "history is not kept in large mode".to_string(),
            )),
        }
    }

    pub fn info(&self, session_id: &str) -> Result<Value> {
        let handle = self.handle(session_id)?;
        match &handle.engine {
            Engine::InMemory(table) => lock(table)?.info(),
            Engine::DiskBacked(_) => {
                let meta = handle.meta()?;
                let dtypes: Value = meta
                    .columns
                    .iter()
                    .map(|c| (c.clone(), json!("unknown")))
                    .collect::<serde_json::Map<_, _>>()
                    .into();
                Ok(json!({
                    "shape": [meta.row_count.unwrap_or(0), meta.columns.len()],
                    "columns": meta.columns,
                    "dtypes": dtypes,
                    "large_mode": true,
                }))
            }
        }
    }

    pub fn page(&self, session_id: &str, query: &PageQuery) -> Result<Value> {
        self.with_relational(session_id, |store| store.page(query))
    }

    pub fn profile(&self, session_id: &str, column: &str, top_n: i64) -> Result<Value> {
        let handle = self.handle(session_id)?;
        let mut response = match &handle.engine {
            Engine::DiskBacked(store) => {
                let mut response = lock(store)?.profile(column, top_n)?;
                response["large_mode"] = json!(true);
                response
            }
            Engine::InMemory(table) => {
                let table = lock(table)?;
                let df = table.dataframe()?;
                let series = df.column(column).map_err(|_| {
                    AlchemistError::NotFound(format!("column '{}' does not exist", column))
                })?;
                let total = df.height();
                let nulls = series.null_count();

                let counts = table.value_counts(column, usize::MAX)?;
                let empty = counts
                    .iter()
                    .filter(|(v, _)| v.trim().is_empty())
                    .map(|(_, c)| *c)
                    .sum::<u64>();
                let top_values: Vec<Value> = counts
                    .iter()
                    .take(top_n.max(0) as usize)
                    .map(|(v, c)| json!({ "value": v, "count": c }))
                    .collect();
                json!({
                    "column": column,
                    "total_rows": total,
                    "null_rows": nulls,
                    "empty_rows": empty,
                    "unique_count": counts.len(),
                    "top_values": top_values,
                    "large_mode": false,
                })
            }
        };
        response["session_id"] = json!(session_id);
        Ok(response)
    }

    /// Scan distinct values of a column and suggest merge clusters.
    pub fn suggest_clusters(
        &self,
        session_id: &str,
        column: &str,
        max_unique: Option<i64>,
    ) -> Result<Value> {
        let max_unique = max_unique
            .unwrap_or(DEFAULT_MAX_UNIQUE_SCANNED)
            .clamp(MIN_UNIQUE_SCANNED, MAX_UNIQUE_SCANNED);

        let handle = self.handle(session_id)?;
        let counts = match &handle.engine {
            Engine::InMemory(table) => lock(table)?.value_counts(column, max_unique as usize)?,
            Engine::DiskBacked(store) => {
                let store = lock(store)?;
                store.ensure_index(column)?;
                store.value_counts(column, max_unique)?
            }
        };

        let clusters = cluster::build_clusters(&counts);
        Ok(json!({
            "column": column,
            "clusters": clusters,
            "unique_scanned": counts.len(),
        }))
    }

    /// Merge the listed values of a column into the canonical value.
    pub fn apply_merge(
        &self,
        session_id: &str,
        column: &str,
        canonical: &str,
        values: &[String],
    ) -> Result<Value> {
        if values.is_empty() {
            return Err(AlchemistError::Validation(
                "values[] must not be empty".to_string(),
            ));
        }

        let handle = self.handle(session_id)?;
        let (changed_rows, data, shape) = match &handle.engine {
            Engine::InMemory(table) => {
                let mut table = lock(table)?;
                table.save_state(&format!("cluster merge on {}", column));
                table.apply_merge(column, canonical, values)?;
                let df = table.dataframe()?;
                // No precise count for the bulk replace.
                (
                    Value::Null,
                    crate::table::json::preview_rows(df, PREVIEW_LIMIT as usize)?,
                    json!([df.height(), df.width()]),
                )
            }
            Engine::DiskBacked(store) => {
                let store = lock(store)?;
                let changed = store.apply_merge(column, canonical, values)?;
                let total = store.row_count()?;
                let preview = store.preview(PREVIEW_LIMIT)?;
                let width = store.columns().len();
                drop(store);
                let mut meta = lock(&handle.meta)?;
                meta.row_count = Some(total);
                drop(meta);
                (json!(changed), preview, json!([total, width]))
            }
        };
        self.persist_meta(&handle)?;

        Ok(json!({
            "changed_rows": changed_rows,
            "data": data,
            "shape": shape,
            "note": "returned data is a preview of the first 100 rows",
            "operation_log": operation_log("cluster_merge", json!({
                "column": column,
                "canonical": canonical,
                "values": values,
                "large_mode": handle.mode()? == SessionMode::DiskBacked,
            })),
        }))
    }

    /// Look up a persisted session record.
    pub fn persisted_meta(&self, session_id: &str) -> Option<SessionMeta> {
        self.store.get(session_id)
    }

    /// Session metadata: the live handle's view when the session is loaded,
    /// the persisted record otherwise.
    pub fn session_meta(&self, session_id: &str) -> Result<SessionMeta> {
        match self.handle(session_id) {
            Ok(handle) => handle.meta(),
            Err(_) => self.persisted_meta(session_id).ok_or_else(|| {
                AlchemistError::NotFound(format!("session '{}' does not exist", session_id))
            }),
        }
    }
}
