//! Check-then-act deduplication behind one narrow seam.
//!
//! Child tasks and webhook plans are both "create the rows for a key unless
//! the key already exists". [`EnsureUnique`] owns that decision so a backend
//! with real conditional writes can replace [`CheckThenCreate`] without
//! touching clustering, generation or the plan state machine.

use async_trait::async_trait;
use searchsweep_core::error::{Result, SweepError};
use searchsweep_core::filter::Filter;
use searchsweep_core::store::RecordStore;
use searchsweep_core::types::{Fields, Record, Table};
use searchsweep_core::value::normalize_value;
use std::collections::{BTreeMap, BTreeSet};
use std::sync::Arc;

/// Rows to create for one key when it is not yet materialized.
#[derive(Debug, Clone)]
pub struct UniqueEntry {
    pub key: String,
    pub rows: Vec<Fields>,
}

/// A set of keys sharing one scope (e.g. same App and Date).
#[derive(Debug, Clone)]
pub struct UniqueBatch {
    pub table: Table,
    /// Conditions every existing row of the batch matches.
    pub scope: Filter,
    /// Column holding the key.
    pub key_field: String,
    /// Keys per existence query.
    pub lookup_chunk: usize,
    pub entries: Vec<UniqueEntry>,
}

#[derive(Debug, Clone, Default)]
pub struct UniqueOutcome {
    /// Newly created record ids per key, in entry order.
    pub created: Vec<(String, Vec<String>)>,
    /// Rows already present per key; more than one means a past race.
    pub existing: BTreeMap<String, Vec<Record>>,
}

#[async_trait]
pub trait EnsureUnique: Send + Sync {
    async fn ensure(&self, batch: UniqueBatch) -> Result<UniqueOutcome>;
}

/// Existing rows for `keys` within `scope`, looked up `chunk` keys at a time.
/// Every chunk is merged before the caller sees anything.
pub async fn lookup_by_keys(
    store: &dyn RecordStore,
    table: Table,
    scope: &Filter,
    key_field: &str,
    keys: &[String],
    chunk: usize,
    page_size: usize,
) -> Result<BTreeMap<String, Vec<Record>>> {
    let unique_keys: BTreeSet<&str> = keys
        .iter()
        .map(|k| k.trim())
        .filter(|k| !k.is_empty())
        .collect();
    let unique_keys: Vec<&str> = unique_keys.into_iter().collect();

    let mut found: BTreeMap<String, Vec<Record>> = BTreeMap::new();
    for part in unique_keys.chunks(chunk.max(1)) {
        let filter = scope.clone().any_of(key_field, part.iter().copied());
        for record in store.query(table, &filter, page_size, 0).await? {
            let key = record.fields.get(key_field).map(normalize_value).unwrap_or_default();
            if part.contains(&key.as_str()) {
                found.entry(key).or_default().push(record);
            }
        }
    }
    Ok(found)
}

/// Existence query immediately followed by batch creates. Not transactional:
/// two racing invocations can both miss and both create.
pub struct CheckThenCreate {
    store: Arc<dyn RecordStore>,
    batch_size: usize,
    page_size: usize,
}

impl CheckThenCreate {
    pub fn new(store: Arc<dyn RecordStore>, batch_size: usize, page_size: usize) -> Self {
        Self {
            store,
            batch_size: batch_size.clamp(1, searchsweep_core::MAX_BATCH_SIZE),
            page_size,
        }
    }
}

#[async_trait]
impl EnsureUnique for CheckThenCreate {
    async fn ensure(&self, batch: UniqueBatch) -> Result<UniqueOutcome> {
        let keys: Vec<String> = batch.entries.iter().map(|e| e.key.clone()).collect();
        let existing = lookup_by_keys(
            self.store.as_ref(),
            batch.table,
            &batch.scope,
            &batch.key_field,
            &keys,
            batch.lookup_chunk,
            self.page_size,
        )
        .await?;

        let mut seen: BTreeSet<String> = existing.keys().cloned().collect();
        let mut pending: Vec<(String, Fields)> = Vec::new();
        for entry in batch.entries {
            if !seen.insert(entry.key.clone()) {
                tracing::debug!("⏭️ {} already materialized, skipping", entry.key);
                continue;
            }
            pending.extend(entry.rows.into_iter().map(|row| (entry.key.clone(), row)));
        }

        let mut created: Vec<(String, Vec<String>)> = Vec::new();
        for chunk in pending.chunks(self.batch_size) {
            let rows: Vec<Fields> = chunk.iter().map(|(_, row)| row.clone()).collect();
            let ids = self.store.batch_create(batch.table, rows).await?;
            if ids.len() != chunk.len() {
                return Err(SweepError::external(
                    "batch_create",
                    format!(
                        "{} returned {} record ids for {} rows",
                        batch.table,
                        ids.len(),
                        chunk.len()
                    ),
                ));
            }
            for ((key, _), id) in chunk.iter().zip(ids) {
                match created.last_mut() {
                    Some((last, bucket)) if last == key => bucket.push(id),
                    _ => created.push((key.clone(), vec![id])),
                }
            }
        }

        Ok(UniqueOutcome { created, existing })
    }
}
