//! SQLite capture-row store.
//!
//! The device tooling writes raw capture rows into a local SQLite database.
//! This store only reads: rows whose task-id column is in the requested set
//! come back as JSON objects keyed by column name.

use async_trait::async_trait;
use rusqlite::types::ValueRef;
use rusqlite::{Connection, OpenFlags};
use searchsweep_core::error::{Result, SweepError};
use searchsweep_core::store::CaptureStore;
use searchsweep_core::types::Fields;
use searchsweep_core::value::TASK_ID_ALIASES;
use searchsweep_core::MAX_BATCH_SIZE;
use serde_json::{Value, json};
use std::path::Path;
use std::sync::Mutex;

pub struct SqliteCaptureStore {
    conn: Mutex<Connection>,
    table: String,
    task_column: String,
}

impl SqliteCaptureStore {
    /// Open the capture database read-only.
    pub fn open(path: &Path, table: &str) -> Result<Self> {
        if !path.exists() {
            return Err(SweepError::Config(format!(
                "capture db not found: {}",
                path.display()
            )));
        }
        let conn = Connection::open_with_flags(
            path,
            OpenFlags::SQLITE_OPEN_READ_ONLY | OpenFlags::SQLITE_OPEN_NO_MUTEX,
        )
        .map_err(|e| SweepError::external("capture_open", e))?;
        tracing::info!("🗄️ Capture db opened: {} (table {})", path.display(), table);
        Self::from_connection(conn, table)
    }

    /// Wrap an existing connection; the table must already exist.
    pub fn from_connection(conn: Connection, table: &str) -> Result<Self> {
        if table.is_empty() || !table.chars().all(|c| c.is_ascii_alphanumeric() || c == '_') {
            return Err(SweepError::Config(format!("invalid capture table name '{table}'")));
        }
        let task_column = Self::detect_task_column(&conn, table)?;
        Ok(Self {
            conn: Mutex::new(conn),
            table: table.to_string(),
            task_column,
        })
    }

    fn detect_task_column(conn: &Connection, table: &str) -> Result<String> {
        let mut stmt = conn
            .prepare(&format!("PRAGMA table_info(\"{table}\")"))
            .map_err(|e| SweepError::external("capture_schema", e))?;
        let columns: Vec<String> = stmt
            .query_map([], |row| row.get::<_, String>(1))
            .map_err(|e| SweepError::external("capture_schema", e))?
            .filter_map(|c| c.ok())
            .collect();
        if columns.is_empty() {
            return Err(SweepError::Config(format!("capture table '{table}' not found")));
        }
        TASK_ID_ALIASES
            .iter()
            .find(|want| columns.iter().any(|c| c == *want))
            .map(|c| c.to_string())
            .ok_or_else(|| {
                SweepError::Config(format!(
                    "capture table '{table}' has no task id column (tried {})",
                    TASK_ID_ALIASES.join(", ")
                ))
            })
    }

    fn query_chunk(&self, conn: &Connection, ids: &[i64]) -> Result<Vec<Fields>> {
        let placeholders = vec!["?"; ids.len()].join(",");
        let sql = format!(
            "SELECT * FROM \"{}\" WHERE \"{}\" IN ({placeholders})",
            self.table, self.task_column
        );
        let mut stmt = conn
            .prepare(&sql)
            .map_err(|e| SweepError::external("capture_query", e))?;
        let names: Vec<String> = stmt.column_names().iter().map(|s| s.to_string()).collect();
        let rows = stmt
            .query_map(rusqlite::params_from_iter(ids.iter()), |row| {
                let mut fields = Fields::new();
                for (idx, name) in names.iter().enumerate() {
                    fields.insert(name.clone(), sql_to_json(row.get_ref(idx)?));
                }
                Ok(fields)
            })
            .map_err(|e| SweepError::external("capture_query", e))?;
        rows.collect::<std::result::Result<Vec<_>, _>>()
            .map_err(|e| SweepError::external("capture_query", e))
    }
}

fn sql_to_json(value: ValueRef<'_>) -> Value {
    match value {
        ValueRef::Null | ValueRef::Blob(_) => Value::Null,
        ValueRef::Integer(i) => json!(i),
        ValueRef::Real(f) => json!(f),
        ValueRef::Text(t) => Value::String(String::from_utf8_lossy(t).into_owned()),
    }
}

#[async_trait]
impl CaptureStore for SqliteCaptureStore {
    async fn rows_by_task_ids(&self, task_ids: &[i64]) -> Result<Vec<Fields>> {
        let mut ids: Vec<i64> = task_ids.iter().copied().filter(|id| *id > 0).collect();
        ids.sort_unstable();
        ids.dedup();
        if ids.is_empty() {
            return Ok(Vec::new());
        }

        let conn = self.conn.lock().unwrap_or_else(|poisoned| poisoned.into_inner());
        let mut out = Vec::new();
        for chunk in ids.chunks(MAX_BATCH_SIZE) {
            out.extend(self.query_chunk(&conn, chunk)?);
        }
        tracing::debug!("📥 {} capture rows for {} task ids", out.len(), ids.len());
        Ok(out)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn seed(path: &Path, column: &str) {
        let conn = Connection::open(path).unwrap();
        conn.execute_batch(&format!(
            "CREATE TABLE capture_results (
                id INTEGER PRIMARY KEY,
                {column} INTEGER NOT NULL,
                ItemID TEXT,
                UserAlias TEXT,
                Duration REAL,
                Raw BLOB
            );
            INSERT INTO capture_results ({column}, ItemID, UserAlias, Duration) VALUES
                (1, 'i1', 'alice', 120.0),
                (1, 'i2', 'alice', 60),
                (2, 'i3', 'bob', NULL),
                (3, 'i4', 'carol', 30);"
        ))
        .unwrap();
    }

    #[tokio::test]
    async fn test_rows_by_task_ids() {
        let dir = std::env::temp_dir().join("searchsweep-capture-test");
        std::fs::create_dir_all(&dir).ok();
        let path = dir.join("capture.sqlite");
        std::fs::remove_file(&path).ok();
        seed(&path, "TaskID");

        let store = SqliteCaptureStore::open(&path, "capture_results").unwrap();
        let rows = store.rows_by_task_ids(&[1, 2, 2, 99]).await.unwrap();
        assert_eq!(rows.len(), 3);
        assert!(rows.iter().all(|r| r["TaskID"] != json!(3)));
        let i1 = rows.iter().find(|r| r["ItemID"] == json!("i1")).unwrap();
        assert_eq!(i1["Duration"], json!(120.0));
        assert_eq!(i1["Raw"], Value::Null);

        assert!(store.rows_by_task_ids(&[]).await.unwrap().is_empty());
        std::fs::remove_dir_all(&dir).ok();
    }

    #[tokio::test]
    async fn test_snake_case_task_column() {
        let dir = std::env::temp_dir().join("searchsweep-capture-test2");
        std::fs::create_dir_all(&dir).ok();
        let path = dir.join("capture.sqlite");
        std::fs::remove_file(&path).ok();
        seed(&path, "task_id");

        let store = SqliteCaptureStore::open(&path, "capture_results").unwrap();
        assert_eq!(store.task_column, "task_id");
        assert_eq!(store.rows_by_task_ids(&[3]).await.unwrap().len(), 1);
        std::fs::remove_dir_all(&dir).ok();
    }

    #[tokio::test]
    async fn test_lowercase_task_column_rows_carry_a_known_alias() {
        let dir = std::env::temp_dir().join("searchsweep-capture-test3");
        std::fs::create_dir_all(&dir).ok();
        let path = dir.join("capture.sqlite");
        std::fs::remove_file(&path).ok();
        seed(&path, "taskid");

        let store = SqliteCaptureStore::open(&path, "capture_results").unwrap();
        assert_eq!(store.task_column, "taskid");
        let rows = store.rows_by_task_ids(&[1]).await.unwrap();
        assert_eq!(rows.len(), 2);
        for row in &rows {
            let id = searchsweep_core::value::first_value(row, TASK_ID_ALIASES)
                .and_then(searchsweep_core::value::coerce_i64);
            assert_eq!(id, Some(1));
        }
        std::fs::remove_dir_all(&dir).ok();
    }

    #[test]
    fn test_rejects_bad_table_and_missing_db() {
        let conn = Connection::open_in_memory().unwrap();
        let err = SqliteCaptureStore::from_connection(conn, "x; DROP TABLE y").err().unwrap();
        assert!(err.is_config());

        let conn = Connection::open_in_memory().unwrap();
        let err = SqliteCaptureStore::from_connection(conn, "capture_results").err().unwrap();
        assert!(err.is_config());

        let missing = std::env::temp_dir().join("searchsweep-no-such-dir/capture.sqlite");
        assert!(SqliteCaptureStore::open(&missing, "capture_results").err().unwrap().is_config());
    }
}
