//! Task and content-metadata reads.

use chrono::FixedOffset;
use searchsweep_core::config::TaskFields;
use searchsweep_core::error::Result;
use searchsweep_core::filter::Filter;
use searchsweep_core::store::RecordStore;
use searchsweep_core::types::{ContentMeta, Day, Table, Task};
use searchsweep_core::MAX_FILTER_VALUES;
use std::collections::{BTreeMap, BTreeSet, HashMap, VecDeque};

/// Read access to the Task and ContentMeta tables.
pub struct TaskDirectory<'a> {
    store: &'a dyn RecordStore,
    fields: &'a TaskFields,
    offset: FixedOffset,
    page_size: usize,
    content_book_id: String,
}

impl<'a> TaskDirectory<'a> {
    pub fn new(
        store: &'a dyn RecordStore,
        fields: &'a TaskFields,
        offset: FixedOffset,
        page_size: usize,
    ) -> Self {
        Self {
            store,
            fields,
            offset,
            page_size,
            content_book_id: "BookID".into(),
        }
    }

    /// Column the ContentMeta table is filtered by.
    pub fn with_content_book_column(mut self, column: impl Into<String>) -> Self {
        self.content_book_id = column.into();
        self
    }

    fn decode(&self, records: Vec<searchsweep_core::Record>) -> Vec<Task> {
        records
            .iter()
            .filter_map(|r| Task::from_record(r, self.fields, self.offset))
            .collect()
    }

    pub async fn task_by_id(&self, task_id: i64) -> Result<Option<Task>> {
        let filter = Filter::new().eq(&self.fields.task_id, task_id.to_string());
        let records = self.store.query(Table::Task, &filter, 1, 1).await?;
        Ok(self
            .decode(records)
            .into_iter()
            .find(|t| t.task_id == task_id))
    }

    /// Tasks for `ids`, looked up in OR-groups of at most 50 ids.
    pub async fn tasks_by_ids(&self, ids: &BTreeSet<i64>) -> Result<HashMap<i64, Task>> {
        let ids: Vec<String> = ids.iter().filter(|id| **id > 0).map(i64::to_string).collect();
        let mut out = HashMap::new();
        for chunk in ids.chunks(MAX_FILTER_VALUES) {
            let filter = Filter::new().any_of(&self.fields.task_id, chunk.iter().cloned());
            let records = self.store.query(Table::Task, &filter, self.page_size, 0).await?;
            for task in self.decode(records) {
                out.entry(task.task_id).or_insert(task);
            }
        }
        Ok(out)
    }

    /// `root` plus every descendant linked through ParentTaskID, breadth first.
    pub async fn closure(&self, root: &Task) -> Result<Vec<Task>> {
        let mut seen: BTreeSet<i64> = BTreeSet::from([root.task_id]);
        let mut out = vec![root.clone()];
        let mut frontier: VecDeque<i64> = VecDeque::from([root.task_id]);

        while !frontier.is_empty() {
            let level: Vec<String> = frontier.drain(..).map(|id| id.to_string()).collect();
            for chunk in level.chunks(MAX_FILTER_VALUES) {
                let filter = Filter::new().any_of(&self.fields.parent_task_id, chunk.iter().cloned());
                let records = self.store.query(Table::Task, &filter, self.page_size, 0).await?;
                for task in self.decode(records) {
                    if seen.insert(task.task_id) {
                        frontier.push_back(task.task_id);
                        out.push(task);
                    }
                }
            }
        }
        tracing::debug!("🌳 Task {} closure: {} tasks", root.task_id, out.len());
        Ok(out)
    }

    /// Tasks of every group in `group_ids` on `day`.
    pub async fn tasks_by_groups(
        &self,
        group_ids: &[String],
        day: Day,
    ) -> Result<BTreeMap<String, Vec<Task>>> {
        let mut out: BTreeMap<String, Vec<Task>> = BTreeMap::new();
        for chunk in group_ids.chunks(MAX_FILTER_VALUES) {
            let filter = Filter::new()
                .on_day(&self.fields.date, day)
                .any_of(&self.fields.group_id, chunk.iter().cloned());
            let records = self.store.query(Table::Task, &filter, self.page_size, 0).await?;
            for task in self.decode(records) {
                if chunk.contains(&task.group_id) {
                    out.entry(task.group_id.clone()).or_default().push(task);
                }
            }
        }
        Ok(out)
    }

    /// ContentMeta keyed by BookID; the first row wins on duplicates.
    pub async fn content_meta(
        &self,
        book_ids: &BTreeSet<String>,
    ) -> Result<HashMap<String, ContentMeta>> {
        let ids: Vec<&String> = book_ids.iter().filter(|b| !b.is_empty()).collect();
        let mut out = HashMap::new();
        for chunk in ids.chunks(MAX_FILTER_VALUES) {
            let filter = Filter::new()
                .any_of(&self.content_book_id, chunk.iter().map(|s| s.as_str()));
            let records = self
                .store
                .query(Table::ContentMeta, &filter, self.page_size, 0)
                .await?;
            let metas = records
                .iter()
                .filter_map(|r| ContentMeta::from_fields(&r.fields, &self.content_book_id));
            for meta in metas {
                out.entry(meta.book_id.clone()).or_insert(meta);
            }
        }
        Ok(out)
    }
}
