//! Collaborator traits: the record store and the capture store.

use async_trait::async_trait;
use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};

use crate::error::Result;
use crate::filter::Filter;
use crate::types::{Fields, Record, Table};

/// Generic filtered-query / batch-create / batch-update over the logical tables.
///
/// Implementations fail fast: a failing call returns an error and is never
/// retried internally.
#[async_trait]
pub trait RecordStore: Send + Sync {
    /// Records matching `filter`, in store order. `page_size` 0 uses the
    /// backend default; `limit` 0 means no limit.
    async fn query(
        &self,
        table: Table,
        filter: &Filter,
        page_size: usize,
        limit: usize,
    ) -> Result<Vec<Record>>;

    /// Create rows, returning the assigned record ids in input order.
    async fn batch_create(&self, table: Table, rows: Vec<Fields>) -> Result<Vec<String>>;

    /// Patch existing rows; only the given columns change.
    async fn batch_update(&self, table: Table, rows: Vec<Record>) -> Result<()>;
}

/// Read-only lookup of raw capture rows.
#[async_trait]
pub trait CaptureStore: Send + Sync {
    async fn rows_by_task_ids(&self, task_ids: &[i64]) -> Result<Vec<Fields>>;
}

/// Passes reads through and swallows every write.
///
/// Created rows get `dryrun-N` ids so callers can still report what would
/// have been created.
pub struct DryRunStore {
    inner: Arc<dyn RecordStore>,
    next_id: AtomicUsize,
}

impl DryRunStore {
    pub fn new(inner: Arc<dyn RecordStore>) -> Self {
        Self {
            inner,
            next_id: AtomicUsize::new(1),
        }
    }
}

#[async_trait]
impl RecordStore for DryRunStore {
    async fn query(
        &self,
        table: Table,
        filter: &Filter,
        page_size: usize,
        limit: usize,
    ) -> Result<Vec<Record>> {
        self.inner.query(table, filter, page_size, limit).await
    }

    async fn batch_create(&self, table: Table, rows: Vec<Fields>) -> Result<Vec<String>> {
        tracing::info!("🧪 [dry-run] would create {} {} rows", rows.len(), table);
        let start = self.next_id.fetch_add(rows.len(), Ordering::Relaxed);
        Ok((start..start + rows.len())
            .map(|n| format!("dryrun-{n}"))
            .collect())
    }

    async fn batch_update(&self, table: Table, rows: Vec<Record>) -> Result<()> {
        tracing::info!("🧪 [dry-run] would update {} {} rows", rows.len(), table);
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::memory::MemoryRecordStore;
    use serde_json::json;

    #[tokio::test]
    async fn test_dry_run_swallows_writes() {
        let memory = Arc::new(MemoryRecordStore::new());
        memory.insert(Table::Task, json!({"TaskID": 1, "App": "a"}));
        let dry = DryRunStore::new(memory.clone());

        let rows = dry.query(Table::Task, &Filter::new(), 0, 0).await.unwrap();
        assert_eq!(rows.len(), 1);

        let ids = dry
            .batch_create(Table::Task, vec![Fields::new(), Fields::new()])
            .await
            .unwrap();
        assert_eq!(ids, vec!["dryrun-1", "dryrun-2"]);
        dry.batch_update(Table::Task, rows).await.unwrap();

        assert_eq!(memory.rows(Table::Task).len(), 1);
        assert_eq!(memory.create_calls(), 0);
        assert_eq!(memory.update_calls(), 0);
    }
}
