//! One invocation end to end: closure → capture rows → clusters → follow-up
//! tasks → webhook plans, returning a JSON-serializable summary.

use searchsweep_core::config::SweepConfig;
use searchsweep_core::error::{Result, SweepError};
use searchsweep_core::store::{CaptureStore, DryRunStore, RecordStore};
use searchsweep_core::types::{Day, Task};
use serde::Serialize;
use std::collections::{BTreeSet, HashMap};
use std::sync::Arc;
use std::time::Instant;

use crate::children::ChildTaskGenerator;
use crate::cluster::{Cluster, ClusterContext};
use crate::lookup::TaskDirectory;
use crate::plan::{PlanBook, PlanCandidate};
use crate::unique::CheckThenCreate;

/// What one invocation saw and did. Printed as the CLI's only stdout output.
#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct RunSummary {
    pub parent_task_id: Option<i64>,
    pub group_id: Option<String>,
    pub date: String,
    pub dry_run: bool,
    pub resolved_task_count: usize,
    pub capture_row_count: usize,
    /// Capture rows dropped for lacking a readable task id column.
    pub rows_without_task_id: usize,
    pub unresolved_task_ids: Vec<i64>,
    pub missing_meta_book_ids: Vec<String>,
    pub invalid_duration_book_ids: Vec<String>,
    pub cluster_count: usize,
    pub selected_cluster_count: usize,
    pub created_child_task_count: usize,
    pub created_child_record_ids: Vec<String>,
    pub skipped_existing_groups: Vec<String>,
    pub plans_created: usize,
    pub plans_updated: usize,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub ready: Option<bool>,
    #[serde(skip_serializing_if = "Vec::is_empty")]
    pub pending_task_ids: Vec<i64>,
    pub elapsed_ms: u64,
}

pub struct Pipeline {
    config: SweepConfig,
    store: Arc<dyn RecordStore>,
    capture: Arc<dyn CaptureStore>,
    dry_run: bool,
}

impl Pipeline {
    pub fn new(config: SweepConfig, store: Arc<dyn RecordStore>, capture: Arc<dyn CaptureStore>) -> Self {
        Self {
            config,
            store,
            capture,
            dry_run: false,
        }
    }

    /// Route every write through a [`DryRunStore`]; reads still hit the real store.
    pub fn dry_run(mut self, enabled: bool) -> Self {
        if enabled && !self.dry_run {
            self.store = Arc::new(DryRunStore::new(self.store));
        }
        self.dry_run = self.dry_run || enabled;
        self
    }

    fn directory(&self) -> TaskDirectory<'_> {
        TaskDirectory::new(
            self.store.as_ref(),
            &self.config.task_fields,
            self.config.utc_offset(),
            self.config.pipeline.page_size,
        )
        .with_content_book_column(self.config.content_fields.book_id.clone())
    }

    fn unique(&self) -> Arc<CheckThenCreate> {
        Arc::new(CheckThenCreate::new(
            self.store.clone(),
            self.config.pipeline.batch_size,
            self.config.pipeline.page_size,
        ))
    }

    fn plan_book(&self, unique: Arc<CheckThenCreate>) -> PlanBook {
        let p = &self.config.pipeline;
        PlanBook::new(self.store.clone(), unique, p.biz_type.clone(), self.config.utc_offset())
            .with_lookup_chunk(p.plan_lookup_chunk)
            .with_page_size(p.page_size)
    }

    /// Cluster the captures of `parent_task_id` and its descendants, create
    /// follow-up tasks for every selected cluster and upsert their plans.
    pub async fn run_for_parent(&self, parent_task_id: i64, threshold: Option<f64>) -> Result<RunSummary> {
        let started = Instant::now();
        let threshold = threshold.unwrap_or(self.config.pipeline.threshold);
        if !(0.0..=1.0).contains(&threshold) {
            return Err(SweepError::InvalidInput(format!(
                "threshold {threshold} outside [0, 1]"
            )));
        }

        let dir = self.directory();
        let parent = dir
            .task_by_id(parent_task_id)
            .await?
            .ok_or_else(|| SweepError::Lookup(format!("parent task {parent_task_id} not found")))?;
        let day = parent.date.ok_or_else(|| {
            SweepError::InvalidInput(format!("parent task {parent_task_id} has no Date"))
        })?;
        tracing::info!(
            "🔎 Sweeping task {} ({} / {}) on {}, threshold {}",
            parent.task_id,
            parent.app,
            parent.book_id,
            day,
            threshold
        );

        let mut summary = RunSummary {
            parent_task_id: Some(parent_task_id),
            date: day.to_string(),
            dry_run: self.dry_run,
            ..Default::default()
        };

        let tasks: HashMap<i64, Task> = dir
            .closure(&parent)
            .await?
            .into_iter()
            .map(|t| (t.task_id, t))
            .collect();
        summary.resolved_task_count = tasks.len();
        let mut task_ids: Vec<i64> = tasks.keys().copied().collect();
        task_ids.sort_unstable();

        let rows = self.capture.rows_by_task_ids(&task_ids).await?;
        summary.capture_row_count = rows.len();
        if rows.is_empty() {
            tracing::warn!("⚠️ No capture rows for tasks {:?}", task_ids);
            summary.elapsed_ms = started.elapsed().as_millis() as u64;
            return Ok(summary);
        }

        let mut ctx = ClusterContext::new(&parent, &tasks, &self.config.platform_labels);
        for row in &rows {
            ctx.ingest(row);
        }
        let metas = dir.content_meta(&ctx.book_ids()).await?;
        let report = ctx.finish(&metas, threshold);

        summary.rows_without_task_id = report.rows_without_task_id;
        if report.rows_without_task_id > 0 {
            tracing::warn!(
                "⚠️ {} of {} capture rows have no task id column",
                report.rows_without_task_id,
                report.rows_seen
            );
        }
        summary.unresolved_task_ids = report.unresolved_task_ids.iter().copied().collect();
        summary.missing_meta_book_ids = report.missing_meta_book_ids.iter().cloned().collect();
        summary.invalid_duration_book_ids = report.invalid_duration_book_ids.iter().cloned().collect();
        summary.cluster_count = report.clusters.len();

        let selected: Vec<&Cluster> = report.selected().map(|s| &s.cluster).collect();
        summary.selected_cluster_count = selected.len();
        tracing::info!(
            "📊 {} rows → {} clusters, {} selected",
            report.rows_seen,
            report.clusters.len(),
            selected.len()
        );
        if selected.is_empty() {
            summary.elapsed_ms = started.elapsed().as_millis() as u64;
            return Ok(summary);
        }

        let unique = self.unique();
        let generator = ChildTaskGenerator::new(
            unique.as_ref(),
            &self.config.task_fields,
            &self.config.scenes,
        );
        let children = generator.generate(&selected, &parent, day).await?;
        summary.created_child_task_count = children.created_record_ids.len();
        summary.created_child_record_ids = children.created_record_ids;
        summary.skipped_existing_groups = children.skipped_groups;

        let group_ids: Vec<String> = selected.iter().map(|c| c.group_id.clone()).collect();
        let by_group = dir.tasks_by_groups(&group_ids, day).await?;
        let candidates = report
            .selected()
            .map(|scored| {
                let cluster = &scored.cluster;
                let task_ids: BTreeSet<i64> = by_group
                    .get(&cluster.group_id)
                    .into_iter()
                    .flatten()
                    .filter(|t| t.app == cluster.app)
                    .map(|t| t.task_id)
                    .collect();
                PlanCandidate {
                    group_id: cluster.group_id.clone(),
                    task_ids,
                    payload: Some(scored.snapshot(threshold)),
                }
            })
            .collect();

        let plans = self.plan_book(unique).upsert(day, candidates).await?;
        summary.plans_created = plans.created.len();
        summary.plans_updated = plans.updated.len();
        summary.elapsed_ms = started.elapsed().as_millis() as u64;
        tracing::info!(
            "✅ Task {}: {} follow-up tasks, {} plans created, {} updated ({}ms)",
            parent_task_id,
            summary.created_child_task_count,
            summary.plans_created,
            summary.plans_updated,
            summary.elapsed_ms
        );
        Ok(summary)
    }

    /// Re-sync one group's plan from the Task table and report its readiness.
    pub async fn run_for_group(&self, group_id: &str, day: Day) -> Result<RunSummary> {
        let started = Instant::now();
        let group_id = group_id.trim();
        if group_id.is_empty() {
            return Err(SweepError::InvalidInput("group id is empty".into()));
        }
        let dir = self.directory();
        let mut summary = RunSummary {
            group_id: Some(group_id.to_string()),
            date: day.to_string(),
            dry_run: self.dry_run,
            ..Default::default()
        };

        let tasks = dir
            .tasks_by_groups(&[group_id.to_string()], day)
            .await?
            .remove(group_id)
            .unwrap_or_default();
        if tasks.is_empty() {
            return Err(SweepError::Lookup(format!("no tasks for group {group_id} on {day}")));
        }
        summary.resolved_task_count = tasks.len();
        tracing::info!("🔁 Re-syncing plan {} on {} ({} tasks)", group_id, day, tasks.len());

        let plans = self.plan_book(self.unique());
        let outcome = plans
            .upsert(
                day,
                vec![PlanCandidate {
                    group_id: group_id.to_string(),
                    task_ids: tasks.iter().map(|t| t.task_id).collect(),
                    payload: None,
                }],
            )
            .await?;
        summary.plans_created = outcome.created.len();
        summary.plans_updated = outcome.updated.len();

        // In dry-run a newly planned group has no row to read back.
        if let Some(plan) = plans.find(group_id, day).await? {
            let readiness = plans.check_ready(&plan, &dir).await?;
            summary.ready = Some(readiness.ready);
            summary.pending_task_ids = readiness.pending_task_ids;
            summary.unresolved_task_ids = readiness.missing_task_ids;
        }
        summary.elapsed_ms = started.elapsed().as_millis() as u64;
        Ok(summary)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use searchsweep_core::memory::{MemoryCaptureStore, MemoryRecordStore};
    use searchsweep_core::types::Table;
    use serde_json::json;

    fn pipeline(store: &Arc<MemoryRecordStore>) -> Pipeline {
        Pipeline::new(SweepConfig::default(), store.clone(), Arc::new(MemoryCaptureStore::new()))
    }

    #[tokio::test]
    async fn test_missing_parent_is_lookup_error() {
        let store = Arc::new(MemoryRecordStore::new());
        let err = pipeline(&store).run_for_parent(7, None).await.unwrap_err();
        assert!(matches!(err, SweepError::Lookup(_)));
    }

    #[tokio::test]
    async fn test_rejects_bad_threshold_and_undated_parent() {
        let store = Arc::new(MemoryRecordStore::new());
        store.insert(Table::Task, json!({"TaskID": 1, "App": "a"}));
        let p = pipeline(&store);
        assert!(matches!(
            p.run_for_parent(1, Some(1.5)).await.unwrap_err(),
            SweepError::InvalidInput(_)
        ));
        assert!(matches!(
            p.run_for_parent(1, None).await.unwrap_err(),
            SweepError::InvalidInput(_)
        ));
    }

    #[tokio::test]
    async fn test_no_capture_rows_is_empty_summary() {
        let store = Arc::new(MemoryRecordStore::new());
        store.insert(Table::Task, json!({"TaskID": 1, "App": "a", "Date": 1_770_393_600_000_i64}));
        let summary = pipeline(&store).run_for_parent(1, None).await.unwrap();
        assert_eq!(summary.resolved_task_count, 1);
        assert_eq!(summary.cluster_count, 0);
        assert_eq!(summary.date, "2026-02-07");
        assert_eq!(store.create_calls(), 0);
    }

    #[tokio::test]
    async fn test_unknown_group_is_lookup_error() {
        let store = Arc::new(MemoryRecordStore::new());
        let day = Day::parse_ymd("2026-02-07", SweepConfig::default().utc_offset()).unwrap();
        let err = pipeline(&store).run_for_group("快手_B1_u", day).await.unwrap_err();
        assert!(matches!(err, SweepError::Lookup(_)));
    }
}
