//! Clustering & threshold engine.
//!
//! A [`ClusterContext`] owns every grouping map of one invocation: rows are
//! [`ingest`](ClusterContext::ingest)ed one by one, then
//! [`finish`](ClusterContext::finish) scores each cluster against its content
//! metadata. Nothing here is shared across invocations.

use searchsweep_core::config::PlatformLabels;
use searchsweep_core::types::{ContentMeta, Fields, Task};
use serde::Serialize;
use serde_json::{Value, json};
use std::collections::{BTreeSet, HashMap};

use crate::capture::CaptureRow;

/// `{platformLabel}_{bookID}_{userKey}`.
pub fn group_id(label: &str, book_id: &str, user_key: &str) -> String {
    format!("{label}_{book_id}_{user_key}")
}

/// The item a cluster's collection task points at.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct CollectionItem {
    pub item_id: String,
    /// Placeholder id of a row that carried no item id.
    pub synthetic: bool,
}

/// Capture rows of one viewer on one piece of content.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct Cluster {
    pub group_id: String,
    pub app: String,
    pub book_id: String,
    pub user_key: String,
    pub user_id: String,
    pub user_name: String,
    pub params: String,
    pub duration_sec: i64,
    pub item_ids: BTreeSet<String>,
    pub collection_item: Option<CollectionItem>,
    pub anchors: BTreeSet<String>,
    /// Tasks whose rows landed in this cluster.
    pub source_task_ids: BTreeSet<i64>,
}

impl Cluster {
    fn absorb(&mut self, row: &CaptureRow, task_id: i64) {
        self.source_task_ids.insert(task_id);
        if self.user_id.is_empty() {
            self.user_id = row.user_id.clone();
        }
        if self.user_name.is_empty() {
            self.user_name = row.user_name.clone();
        }
        if self.item_ids.insert(row.item_id.clone()) {
            self.duration_sec += row.duration_sec;
        }
        if self.collection_item.is_none() && row.is_collection() {
            self.collection_item = Some(CollectionItem {
                item_id: row.item_id.clone(),
                synthetic: row.synthetic_item,
            });
        }
        self.anchors.extend(row.anchor_links());
    }

    /// Collection item id usable for a follow-up task.
    pub fn real_collection_item(&self) -> Option<&str> {
        self.collection_item
            .as_ref()
            .filter(|c| !c.synthetic)
            .map(|c| c.item_id.as_str())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum Verdict {
    Selected,
    BelowThreshold,
    MissingMeta,
    InvalidDuration,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ScoredCluster {
    pub cluster: Cluster,
    pub verdict: Verdict,
    pub reference_sec: Option<i64>,
    pub ratio: Option<f64>,
    pub meta: Option<ContentMeta>,
}

impl ScoredCluster {
    pub fn is_selected(&self) -> bool {
        self.verdict == Verdict::Selected
    }

    /// Content snapshot attached to the cluster's webhook plan.
    pub fn snapshot(&self, threshold: f64) -> Value {
        let c = &self.cluster;
        let meta = self.meta.as_ref();
        json!({
            "group_id": c.group_id,
            "app": c.app,
            "book_id": c.book_id,
            "user_key": c.user_key,
            "user_id": c.user_id,
            "user_name": c.user_name,
            "params": c.params,
            "duration_sec": c.duration_sec,
            "reference_sec": self.reference_sec,
            "ratio": self.ratio,
            "threshold": threshold,
            "item_count": c.item_ids.len(),
            "collection_item": c.real_collection_item(),
            "anchors": c.anchors,
            "episode_count": meta.and_then(|m| m.episode_count),
            "priority": meta.map(|m| m.priority.as_str()).unwrap_or(""),
            "tag": meta.map(|m| m.tag.as_str()).unwrap_or(""),
        })
    }
}

/// Scored clusters plus the run-level diagnostics.
#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct ClusterReport {
    pub clusters: Vec<ScoredCluster>,
    pub rows_seen: usize,
    /// Rows with no readable task id column.
    pub rows_without_task_id: usize,
    pub unresolved_task_ids: BTreeSet<i64>,
    pub missing_meta_book_ids: BTreeSet<String>,
    pub invalid_duration_book_ids: BTreeSet<String>,
}

impl ClusterReport {
    pub fn selected(&self) -> impl Iterator<Item = &ScoredCluster> {
        self.clusters.iter().filter(|c| c.is_selected())
    }
}

/// Invocation-local grouping state.
pub struct ClusterContext<'a> {
    parent: &'a Task,
    tasks: &'a HashMap<i64, Task>,
    labels: &'a PlatformLabels,
    clusters: Vec<Cluster>,
    index: HashMap<String, usize>,
    rows_seen: usize,
    rows_without_task_id: usize,
    unresolved: BTreeSet<i64>,
}

impl<'a> ClusterContext<'a> {
    pub fn new(parent: &'a Task, tasks: &'a HashMap<i64, Task>, labels: &'a PlatformLabels) -> Self {
        Self {
            parent,
            tasks,
            labels,
            clusters: Vec::new(),
            index: HashMap::new(),
            rows_seen: 0,
            rows_without_task_id: 0,
            unresolved: BTreeSet::new(),
        }
    }

    /// Fold one raw capture row into its cluster.
    pub fn ingest(&mut self, fields: &Fields) {
        let row = CaptureRow::from_fields(fields, self.rows_seen);
        self.rows_seen += 1;

        let Some(task_id) = row.task_id else {
            tracing::debug!("capture row {} has no task id", self.rows_seen - 1);
            self.rows_without_task_id += 1;
            return;
        };
        let Some(task) = self.tasks.get(&task_id) else {
            self.unresolved.insert(task_id);
            return;
        };
        let book_id = if task.book_id.is_empty() { &row.book_id } else { &task.book_id };
        if book_id.is_empty() {
            self.unresolved.insert(task_id);
            return;
        }
        let Some(user_key) = row.user_key() else {
            return;
        };

        let app = if task.app.is_empty() { &self.parent.app } else { &task.app };
        let key = group_id(self.labels.label(app), book_id, user_key);

        let idx = match self.index.get(&key) {
            Some(idx) => *idx,
            None => {
                let params = [&task.params, &row.params]
                    .into_iter()
                    .find(|p| !p.is_empty())
                    .cloned()
                    .unwrap_or_default();
                self.clusters.push(Cluster {
                    group_id: key.clone(),
                    app: app.clone(),
                    book_id: book_id.clone(),
                    user_key: user_key.to_string(),
                    user_id: String::new(),
                    user_name: String::new(),
                    params,
                    duration_sec: 0,
                    item_ids: BTreeSet::new(),
                    collection_item: None,
                    anchors: BTreeSet::new(),
                    source_task_ids: BTreeSet::new(),
                });
                self.index.insert(key, self.clusters.len() - 1);
                self.clusters.len() - 1
            }
        };
        self.clusters[idx].absorb(&row, task_id);
    }

    /// Book ids whose metadata `finish` will need.
    pub fn book_ids(&self) -> BTreeSet<String> {
        self.clusters.iter().map(|c| c.book_id.clone()).collect()
    }

    pub fn cluster_count(&self) -> usize {
        self.clusters.len()
    }

    /// Score every cluster; `ratio >= threshold` selects.
    pub fn finish(self, metas: &HashMap<String, ContentMeta>, threshold: f64) -> ClusterReport {
        let mut report = ClusterReport {
            rows_seen: self.rows_seen,
            rows_without_task_id: self.rows_without_task_id,
            unresolved_task_ids: self.unresolved,
            ..Default::default()
        };

        for cluster in self.clusters {
            let meta = metas.get(&cluster.book_id).cloned();
            let reference_sec = meta.as_ref().and_then(ContentMeta::reference_seconds);
            let (verdict, ratio) = match (&meta, reference_sec) {
                (None, _) => {
                    report.missing_meta_book_ids.insert(cluster.book_id.clone());
                    (Verdict::MissingMeta, None)
                }
                (Some(_), Some(reference)) if reference > 0 => {
                    let ratio = cluster.duration_sec as f64 / reference as f64;
                    if ratio >= threshold {
                        (Verdict::Selected, Some(ratio))
                    } else {
                        (Verdict::BelowThreshold, Some(ratio))
                    }
                }
                (Some(_), _) => {
                    report.invalid_duration_book_ids.insert(cluster.book_id.clone());
                    (Verdict::InvalidDuration, None)
                }
            };
            tracing::debug!(
                "📊 {} {}s / {:?}s → {:?}",
                cluster.group_id,
                cluster.duration_sec,
                reference_sec,
                verdict
            );
            report.clusters.push(ScoredCluster {
                cluster,
                verdict,
                reference_sec,
                ratio,
                meta,
            });
        }

        if !report.missing_meta_book_ids.is_empty() {
            tracing::warn!(
                "⚠️ No content metadata for books: {:?}",
                report.missing_meta_book_ids
            );
        }
        if !report.invalid_duration_book_ids.is_empty() {
            tracing::warn!(
                "⚠️ Invalid reference duration for books: {:?}",
                report.invalid_duration_book_ids
            );
        }
        if !report.unresolved_task_ids.is_empty() {
            tracing::warn!("⚠️ Unresolved task ids: {:?}", report.unresolved_task_ids);
        }
        report
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use searchsweep_core::types::TaskStatus;

    fn task(id: i64, app: &str, book: &str) -> Task {
        Task {
            record_id: format!("rec{id}"),
            task_id: id,
            biz_task_id: String::new(),
            parent_task_id: String::new(),
            app: app.into(),
            scene: "general-search".into(),
            params: "query".into(),
            item_id: String::new(),
            book_id: book.into(),
            url: String::new(),
            user_id: String::new(),
            user_name: String::new(),
            group_id: String::new(),
            date: None,
            status: TaskStatus::Success,
            extra: String::new(),
        }
    }

    fn row(v: Value) -> Fields {
        v.as_object().cloned().unwrap()
    }

    fn meta(book: &str, minutes: f64) -> (String, ContentMeta) {
        (
            book.to_string(),
            ContentMeta {
                book_id: book.into(),
                total_duration_min: Some(minutes),
                episode_count: None,
                priority: String::new(),
                tag: String::new(),
            },
        )
    }

    fn scenario_rows() -> Vec<Fields> {
        vec![
            row(json!({"TaskID": 1, "ItemID": "i1", "UserAlias": "u", "Duration": 120})),
            row(json!({"TaskID": 1, "ItemID": "i1", "UserAlias": "u", "Duration": 120})),
            row(json!({"TaskID": 1, "ItemID": "i2", "UserAlias": "u", "Duration": 60})),
        ]
    }

    fn run(rows: &[Fields], metas: &HashMap<String, ContentMeta>, threshold: f64) -> ClusterReport {
        let parent = task(1, "com.smile.gifmaker", "B1");
        let tasks = HashMap::from([(1, parent.clone())]);
        let labels = PlatformLabels::default();
        let mut ctx = ClusterContext::new(&parent, &tasks, &labels);
        for r in rows {
            ctx.ingest(r);
        }
        ctx.finish(metas, threshold)
    }

    #[test]
    fn test_duplicate_item_counted_once_and_selected() {
        let metas = HashMap::from([meta("B1", 5.0)]);
        let report = run(&scenario_rows(), &metas, 0.5);
        assert_eq!(report.clusters.len(), 1);
        let c = &report.clusters[0];
        assert_eq!(c.cluster.group_id, "快手_B1_u");
        assert_eq!(c.cluster.duration_sec, 180);
        assert_eq!(c.ratio, Some(0.6));
        assert!(c.is_selected());
    }

    #[test]
    fn test_below_threshold() {
        let metas = HashMap::from([meta("B1", 1000.0 / 60.0)]);
        let report = run(&scenario_rows(), &metas, 0.5);
        assert_eq!(report.clusters[0].reference_sec, Some(1000));
        assert_eq!(report.clusters[0].verdict, Verdict::BelowThreshold);
        assert_eq!(report.selected().count(), 0);
    }

    #[test]
    fn test_boundary_is_inclusive() {
        let rows = vec![row(json!({"TaskID": 1, "ItemID": "i1", "UserID": "u", "Duration": 150}))];
        let metas = HashMap::from([meta("B1", 5.0)]);
        assert!(run(&rows, &metas, 0.5).clusters[0].is_selected());
    }

    #[test]
    fn test_row_order_does_not_change_result() {
        let metas = HashMap::from([meta("B1", 5.0)]);
        let mut rows = scenario_rows();
        rows.reverse();
        let report = run(&rows, &metas, 0.5);
        assert_eq!(report.clusters[0].cluster.group_id, "快手_B1_u");
        assert_eq!(report.clusters[0].cluster.duration_sec, 180);
    }

    #[test]
    fn test_missing_and_invalid_meta() {
        let parent = task(1, "com.smile.gifmaker", "B1");
        let tasks = HashMap::from([
            (1, parent.clone()),
            (2, task(2, "com.smile.gifmaker", "B2")),
            (3, task(3, "com.smile.gifmaker", "B3")),
        ]);
        let labels = PlatformLabels::default();
        let mut ctx = ClusterContext::new(&parent, &tasks, &labels);
        for (id, dur) in [(1, 200), (2, 200), (3, 200)] {
            ctx.ingest(&row(json!({"TaskID": id, "ItemID": "x", "UserName": "n", "Duration": dur})));
        }
        assert_eq!(ctx.book_ids().len(), 3);
        let metas = HashMap::from([meta("B1", 5.0), meta("B3", 0.0)]);
        let report = ctx.finish(&metas, 0.5);

        assert!(report.missing_meta_book_ids.contains("B2"));
        assert!(report.invalid_duration_book_ids.contains("B3"));
        let selected: Vec<&str> = report.selected().map(|c| c.cluster.book_id.as_str()).collect();
        assert_eq!(selected, vec!["B1"]);
    }

    #[test]
    fn test_unresolved_and_ungroupable_rows() {
        let parent = task(1, "", "");
        let mut child = task(2, "", "B9");
        child.params = String::new();
        let tasks = HashMap::from([(1, parent.clone()), (2, child)]);
        let labels = PlatformLabels::default();
        let mut ctx = ClusterContext::new(&parent, &tasks, &labels);

        ctx.ingest(&row(json!({"TaskID": 99, "UserID": "u"})));
        ctx.ingest(&row(json!({"TaskID": 1, "UserID": "u"})));
        ctx.ingest(&row(json!({"TaskID": 2, "Duration": 10})));
        // Row-level book id fills in for the task.
        ctx.ingest(&row(json!({"TaskID": 1, "BookID": "B7", "UserID": "u", "Params": "p"})));
        ctx.ingest(&row(json!({"TaskID": 2, "UserName": "v"})));
        ctx.ingest(&row(json!({"task": 2, "UserName": "v"})));

        assert_eq!(ctx.cluster_count(), 2);
        let report = ctx.finish(&HashMap::new(), 0.5);
        assert_eq!(report.unresolved_task_ids, BTreeSet::from([1, 99]));
        assert_eq!(report.rows_seen, 6);
        assert_eq!(report.rows_without_task_id, 1);
        let b7 = report.clusters.iter().find(|c| c.cluster.book_id == "B7").unwrap();
        assert_eq!(b7.cluster.group_id, "_B7_u");
        assert_eq!(b7.cluster.params, "query");
    }

    #[test]
    fn test_collection_and_anchors() {
        let rows = vec![
            row(json!({"TaskID": 1, "UserID": "u", "Tags": "合集", "Duration": 10})),
            row(json!({"TaskID": 1, "ItemID": "c1", "UserID": "u", "Tags": "合集"})),
            row(json!({"TaskID": 1, "ItemID": "c2", "UserID": "u", "AnchorPoint": "kwai://a https://b.cn/x"})),
            row(json!({"TaskID": 1, "ItemID": "c2", "UserID": "u", "AnchorPoint": "https://b.cn/x"})),
        ];
        let report = run(&rows, &HashMap::from([meta("B1", 1.0)]), 0.1);
        let c = &report.clusters[0].cluster;
        assert_eq!(c.collection_item.as_ref().unwrap().item_id, "__row_0");
        assert_eq!(c.real_collection_item(), None);
        assert_eq!(c.anchors.len(), 2);
        assert_eq!(c.item_ids.len(), 3);
    }
}
