//! Follow-up task generation for selected clusters.

use searchsweep_core::config::{SceneConfig, TaskFields};
use searchsweep_core::error::Result;
use searchsweep_core::filter::Filter;
use searchsweep_core::types::{Day, NewTask, Table, Task, TaskStatus};
use searchsweep_core::MAX_FILTER_VALUES;
use std::collections::BTreeMap;

use crate::cluster::Cluster;
use crate::unique::{EnsureUnique, UniqueBatch, UniqueEntry};

/// Tasks a cluster materializes into: one profile search, one collection
/// capture when the collection item is real, one anchor capture per link.
pub fn build_child_tasks(cluster: &Cluster, parent: &Task, day: Day, scenes: &SceneConfig) -> Vec<NewTask> {
    let params = if cluster.params.is_empty() {
        parent.params.clone()
    } else {
        cluster.params.clone()
    };
    let base = NewTask {
        app: cluster.app.clone(),
        scene: scenes.profile_search.clone(),
        params,
        item_id: String::new(),
        book_id: cluster.book_id.clone(),
        url: String::new(),
        user_id: cluster.user_id.clone(),
        user_name: cluster.user_name.clone(),
        group_id: cluster.group_id.clone(),
        parent_task_id: parent.task_id.to_string(),
        date: day,
        status: TaskStatus::Pending,
    };

    let mut tasks = vec![base.clone()];
    if let Some(item_id) = cluster.real_collection_item() {
        tasks.push(NewTask {
            scene: scenes.collection_capture.clone(),
            item_id: item_id.to_string(),
            ..base.clone()
        });
    }
    for link in &cluster.anchors {
        tasks.push(NewTask {
            scene: scenes.anchor_capture.clone(),
            url: link.clone(),
            ..base.clone()
        });
    }
    tasks
}

#[derive(Debug, Clone, Default, PartialEq)]
pub struct ChildOutcome {
    pub created_record_ids: Vec<String>,
    /// Groups that already had tasks for (App, GroupID, Date).
    pub skipped_groups: Vec<String>,
}

pub struct ChildTaskGenerator<'a> {
    unique: &'a dyn EnsureUnique,
    fields: &'a TaskFields,
    scenes: &'a SceneConfig,
}

impl<'a> ChildTaskGenerator<'a> {
    pub fn new(unique: &'a dyn EnsureUnique, fields: &'a TaskFields, scenes: &'a SceneConfig) -> Self {
        Self {
            unique,
            fields,
            scenes,
        }
    }

    /// Create follow-up tasks for every cluster not yet materialized for
    /// (App, GroupID, Date). Clusters are checked per App in one batched
    /// existence query.
    pub async fn generate(&self, clusters: &[&Cluster], parent: &Task, day: Day) -> Result<ChildOutcome> {
        let mut by_app: BTreeMap<&str, Vec<&Cluster>> = BTreeMap::new();
        for &cluster in clusters {
            by_app.entry(cluster.app.as_str()).or_default().push(cluster);
        }

        let mut outcome = ChildOutcome::default();
        for (app, group) in by_app {
            let mut scope = Filter::new().on_day(&self.fields.date, day);
            if !app.is_empty() {
                scope = scope.eq(&self.fields.app, app);
            }
            let entries = group
                .iter()
                .map(|c| UniqueEntry {
                    key: c.group_id.clone(),
                    rows: build_child_tasks(c, parent, day, self.scenes)
                        .iter()
                        .map(|t| t.to_fields(self.fields))
                        .collect(),
                })
                .collect();

            let result = self
                .unique
                .ensure(UniqueBatch {
                    table: Table::Task,
                    scope,
                    key_field: self.fields.group_id.clone(),
                    lookup_chunk: MAX_FILTER_VALUES,
                    entries,
                })
                .await?;

            for (group_id, ids) in result.created {
                tracing::info!("🧩 {} → {} follow-up tasks", group_id, ids.len());
                outcome.created_record_ids.extend(ids);
            }
            for group_id in result.existing.into_keys() {
                tracing::info!("⏭️ {} already has follow-up tasks on {}", group_id, day);
                outcome.skipped_groups.push(group_id);
            }
        }
        Ok(outcome)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::cluster::CollectionItem;
    use crate::unique::CheckThenCreate;
    use chrono::FixedOffset;
    use searchsweep_core::memory::MemoryRecordStore;
    use std::collections::BTreeSet;
    use std::sync::Arc;

    fn day() -> Day {
        Day::parse_ymd("2026-02-07", FixedOffset::east_opt(8 * 3600).unwrap()).unwrap()
    }

    fn parent() -> Task {
        Task {
            record_id: "rec1".into(),
            task_id: 1,
            biz_task_id: String::new(),
            parent_task_id: String::new(),
            app: "com.smile.gifmaker".into(),
            scene: "general-search".into(),
            params: "parent-query".into(),
            item_id: String::new(),
            book_id: "B1".into(),
            url: String::new(),
            user_id: String::new(),
            user_name: String::new(),
            group_id: String::new(),
            date: Some(day()),
            status: TaskStatus::Success,
            extra: String::new(),
        }
    }

    fn cluster(group: &str) -> Cluster {
        Cluster {
            group_id: group.into(),
            app: "com.smile.gifmaker".into(),
            book_id: "B1".into(),
            user_key: "u".into(),
            user_id: "u".into(),
            user_name: "Alice".into(),
            params: String::new(),
            duration_sec: 180,
            item_ids: BTreeSet::from(["i1".to_string()]),
            collection_item: None,
            anchors: BTreeSet::new(),
            source_task_ids: BTreeSet::from([1]),
        }
    }

    #[test]
    fn test_task_shapes() {
        let scenes = SceneConfig::default();
        let mut c = cluster("快手_B1_u");
        assert_eq!(build_child_tasks(&c, &parent(), day(), &scenes).len(), 1);

        c.collection_item = Some(CollectionItem { item_id: "__row_0".into(), synthetic: true });
        assert_eq!(build_child_tasks(&c, &parent(), day(), &scenes).len(), 1);

        c.collection_item = Some(CollectionItem { item_id: "c9".into(), synthetic: false });
        c.anchors = BTreeSet::from(["kwai://a".to_string(), "https://b".to_string()]);
        let tasks = build_child_tasks(&c, &parent(), day(), &scenes);
        assert_eq!(tasks.len(), 4);
        assert_eq!(tasks[0].scene, "personal-page-search");
        assert_eq!(tasks[0].params, "parent-query");
        assert_eq!(tasks[1].scene, "collection-video-capture");
        assert_eq!(tasks[1].item_id, "c9");
        assert!(tasks[2..].iter().all(|t| t.scene == "anchor-link-capture" && !t.url.is_empty()));
        assert!(tasks.iter().all(|t| t.group_id == "快手_B1_u"
            && t.parent_task_id == "1"
            && t.status == TaskStatus::Pending
            && t.date == day()));
    }

    #[tokio::test]
    async fn test_generate_is_idempotent() {
        let store = Arc::new(MemoryRecordStore::new());
        let unique = CheckThenCreate::new(store.clone(), 500, 0);
        let fields = TaskFields::default();
        let scenes = SceneConfig::default();
        let generator = ChildTaskGenerator::new(&unique, &fields, &scenes);

        let mut c1 = cluster("快手_B1_u");
        c1.anchors = BTreeSet::from(["https://x".to_string()]);
        let c2 = cluster("快手_B1_v");

        let first = generator.generate(&[&c1, &c2], &parent(), day()).await.unwrap();
        assert_eq!(first.created_record_ids.len(), 3);
        assert!(first.skipped_groups.is_empty());

        let second = generator.generate(&[&c1, &c2], &parent(), day()).await.unwrap();
        assert!(second.created_record_ids.is_empty());
        assert_eq!(second.skipped_groups.len(), 2);
        assert_eq!(store.rows(Table::Task).len(), 3);
    }
}
