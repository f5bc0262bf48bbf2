//! In-process stores for tests and local experiments.

use async_trait::async_trait;
use serde_json::{Value, json};
use std::collections::{BTreeMap, BTreeSet, HashMap};
use std::sync::{Mutex, MutexGuard};

use crate::error::{Result, SweepError};
use crate::filter::Filter;
use crate::store::{CaptureStore, RecordStore};
use crate::types::{Fields, Record, Table};
use crate::value::coerce_i64;

#[derive(Default)]
struct Tables {
    rows: BTreeMap<Table, Vec<Record>>,
    next_record: usize,
    next_task_id: i64,
    create_calls: usize,
    update_calls: usize,
    failing: BTreeSet<Table>,
}

/// A [`RecordStore`] backed by vectors.
///
/// New Task rows without a TaskID get the next free number, mirroring the
/// auto-number column of the real table.
pub struct MemoryRecordStore {
    inner: Mutex<Tables>,
    task_id_column: String,
}

impl Default for MemoryRecordStore {
    fn default() -> Self {
        Self::new()
    }
}

impl MemoryRecordStore {
    pub fn new() -> Self {
        Self::with_task_id_column("TaskID")
    }

    pub fn with_task_id_column(column: impl Into<String>) -> Self {
        Self {
            inner: Mutex::new(Tables::default()),
            task_id_column: column.into(),
        }
    }

    fn lock(&self) -> MutexGuard<'_, Tables> {
        self.inner.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    /// Seed a row directly (not counted as a create call). Returns its record id.
    pub fn insert(&self, table: Table, fields: Value) -> String {
        let fields = match fields {
            Value::Object(map) => map,
            _ => Fields::new(),
        };
        let mut tables = self.lock();
        Self::push(&mut tables, table, fields, &self.task_id_column)
    }

    fn push(tables: &mut Tables, table: Table, mut fields: Fields, task_id_column: &str) -> String {
        tables.next_record += 1;
        let record_id = format!("rec{:06}", tables.next_record);
        if table == Table::Task {
            match fields.get(task_id_column).and_then(coerce_i64) {
                Some(id) => tables.next_task_id = tables.next_task_id.max(id),
                None => {
                    tables.next_task_id += 1;
                    fields.insert(task_id_column.to_string(), json!(tables.next_task_id));
                }
            }
        }
        tables.rows.entry(table).or_default().push(Record {
            record_id: record_id.clone(),
            fields,
        });
        record_id
    }

    /// Snapshot of every row in `table`.
    pub fn rows(&self, table: Table) -> Vec<Record> {
        self.lock().rows.get(&table).cloned().unwrap_or_default()
    }

    pub fn create_calls(&self) -> usize {
        self.lock().create_calls
    }

    pub fn update_calls(&self) -> usize {
        self.lock().update_calls
    }

    /// Make every subsequent write to `table` fail.
    pub fn fail_writes_to(&self, table: Table) {
        self.lock().failing.insert(table);
    }
}

#[async_trait]
impl RecordStore for MemoryRecordStore {
    async fn query(
        &self,
        table: Table,
        filter: &Filter,
        _page_size: usize,
        limit: usize,
    ) -> Result<Vec<Record>> {
        let tables = self.lock();
        let matched = tables
            .rows
            .get(&table)
            .into_iter()
            .flatten()
            .filter(|r| filter.matches(&r.fields))
            .take(if limit == 0 { usize::MAX } else { limit })
            .cloned()
            .collect();
        Ok(matched)
    }

    async fn batch_create(&self, table: Table, rows: Vec<Fields>) -> Result<Vec<String>> {
        let mut tables = self.lock();
        if tables.failing.contains(&table) {
            return Err(SweepError::external("batch_create", format!("{table} is read-only")));
        }
        tables.create_calls += 1;
        Ok(rows
            .into_iter()
            .map(|fields| Self::push(&mut tables, table, fields, &self.task_id_column))
            .collect())
    }

    async fn batch_update(&self, table: Table, rows: Vec<Record>) -> Result<()> {
        let mut tables = self.lock();
        if tables.failing.contains(&table) {
            return Err(SweepError::external("batch_update", format!("{table} is read-only")));
        }
        tables.update_calls += 1;
        let existing = tables.rows.entry(table).or_default();
        for patch in rows {
            let Some(target) = existing.iter_mut().find(|r| r.record_id == patch.record_id) else {
                return Err(SweepError::external(
                    "batch_update",
                    format!("record {} not found in {table}", patch.record_id),
                ));
            };
            target.fields.extend(patch.fields);
        }
        Ok(())
    }
}

/// A [`CaptureStore`] holding rows grouped by task id.
#[derive(Default)]
pub struct MemoryCaptureStore {
    rows: Mutex<HashMap<i64, Vec<Fields>>>,
}

impl MemoryCaptureStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn add(&self, task_id: i64, row: Value) {
        let Value::Object(fields) = row else {
            return;
        };
        self.rows
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .entry(task_id)
            .or_default()
            .push(fields);
    }
}

#[async_trait]
impl CaptureStore for MemoryCaptureStore {
    async fn rows_by_task_ids(&self, task_ids: &[i64]) -> Result<Vec<Fields>> {
        let rows = self.rows.lock().unwrap_or_else(|poisoned| poisoned.into_inner());
        let wanted: BTreeSet<i64> = task_ids.iter().copied().collect();
        Ok(wanted
            .iter()
            .filter_map(|id| rows.get(id))
            .flatten()
            .cloned()
            .collect())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_auto_task_ids_and_update() {
        let store = MemoryRecordStore::new();
        store.insert(Table::Task, json!({"TaskID": 10}));
        let ids = store
            .batch_create(Table::Task, vec![Fields::new(), Fields::new()])
            .await
            .unwrap();
        assert_eq!(ids.len(), 2);

        let rows = store.rows(Table::Task);
        let task_ids: Vec<i64> = rows
            .iter()
            .filter_map(|r| r.fields.get("TaskID").and_then(coerce_i64))
            .collect();
        assert_eq!(task_ids, vec![10, 11, 12]);

        let mut patch = Fields::new();
        patch.insert("Status".into(), json!("success"));
        store
            .batch_update(Table::Task, vec![Record { record_id: ids[0].clone(), fields: patch }])
            .await
            .unwrap();
        let hit = store
            .query(Table::Task, &Filter::new().eq("Status", "success"), 0, 0)
            .await
            .unwrap();
        assert_eq!(hit.len(), 1);
        assert_eq!(hit[0].fields["TaskID"], json!(11));
    }

    #[tokio::test]
    async fn test_failing_writes() {
        let store = MemoryRecordStore::new();
        store.fail_writes_to(Table::WebhookPlan);
        let err = store
            .batch_create(Table::WebhookPlan, vec![Fields::new()])
            .await
            .unwrap_err();
        assert!(matches!(err, SweepError::External { .. }));
        assert!(store.batch_create(Table::Task, vec![Fields::new()]).await.is_ok());
    }

    #[tokio::test]
    async fn test_capture_rows_by_ids() {
        let capture = MemoryCaptureStore::new();
        capture.add(1, json!({"ItemID": "a"}));
        capture.add(2, json!({"ItemID": "b"}));
        capture.add(3, json!({"ItemID": "c"}));
        let rows = capture.rows_by_task_ids(&[3, 1, 1]).await.unwrap();
        assert_eq!(rows.len(), 2);
        assert_eq!(rows[0]["ItemID"], json!("a"));
    }
}
