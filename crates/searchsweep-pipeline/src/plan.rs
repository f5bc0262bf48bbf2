//! Webhook plan state machine.
//!
//! ```text
//! pending ──upsert (TaskIDs ∪= candidates, payload refreshed)──▶ pending
//!    │
//!    ├── record_delivery_success ──▶ success   (final)
//!    ├── record_delivery_failure ──▶ failed    (RetryCount+1, reconciled later)
//!    └── mark_error ───────────────▶ error     (final)
//! ```
//!
//! Upsert never touches Status or RetryCount; those belong to the dispatch
//! driver. Readiness is computed against live Task state on every call.

use chrono::FixedOffset;
use searchsweep_core::error::{Result, SweepError};
use searchsweep_core::filter::Filter;
use searchsweep_core::store::RecordStore;
use searchsweep_core::types::{
    Day, Fields, PlanStatus, Record, Table, WebhookPlan, format_task_ids, plan_columns,
};
use serde::Serialize;
use serde_json::{Value, json};
use std::collections::{BTreeSet, HashMap};
use std::sync::Arc;

use crate::lookup::TaskDirectory;
use crate::unique::{EnsureUnique, UniqueBatch, UniqueEntry, lookup_by_keys};

/// One group's desired plan contents.
#[derive(Debug, Clone, PartialEq)]
pub struct PlanCandidate {
    pub group_id: String,
    pub task_ids: BTreeSet<i64>,
    /// Latest content snapshot; `None` keeps whatever the plan already holds.
    pub payload: Option<Value>,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct UpsertOutcome {
    pub created: Vec<String>,
    pub updated: Vec<String>,
    pub unchanged: Vec<String>,
}

/// Live dispatch readiness of one plan.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct Readiness {
    pub ready: bool,
    /// Tasks found but not yet terminal.
    pub pending_task_ids: Vec<i64>,
    /// TaskIDs with no Task row.
    pub missing_task_ids: Vec<i64>,
}

pub struct PlanBook {
    store: Arc<dyn RecordStore>,
    unique: Arc<dyn EnsureUnique>,
    biz_type: String,
    offset: FixedOffset,
    lookup_chunk: usize,
    page_size: usize,
}

impl PlanBook {
    pub fn new(
        store: Arc<dyn RecordStore>,
        unique: Arc<dyn EnsureUnique>,
        biz_type: impl Into<String>,
        offset: FixedOffset,
    ) -> Self {
        Self {
            store,
            unique,
            biz_type: biz_type.into(),
            offset,
            lookup_chunk: 40,
            page_size: 0,
        }
    }

    /// GroupIDs per existence query.
    pub fn with_lookup_chunk(mut self, chunk: usize) -> Self {
        self.lookup_chunk = chunk.max(1);
        self
    }

    pub fn with_page_size(mut self, page_size: usize) -> Self {
        self.page_size = page_size;
        self
    }

    pub fn biz_type(&self) -> &str {
        &self.biz_type
    }

    fn scope(&self, day: Day) -> Filter {
        Filter::new()
            .eq(plan_columns::BIZ_TYPE, self.biz_type.as_str())
            .on_day(plan_columns::DATE, day)
    }

    fn decode(&self, records: &[Record]) -> Vec<WebhookPlan> {
        records
            .iter()
            .filter_map(|r| WebhookPlan::from_record(r, self.offset))
            .collect()
    }

    /// Create missing plans and merge candidates into existing ones.
    ///
    /// Every GroupID chunk is looked up before any write happens. When past
    /// races left several rows for one key, all their TaskIDs are folded into
    /// the first row.
    pub async fn upsert(&self, day: Day, candidates: Vec<PlanCandidate>) -> Result<UpsertOutcome> {
        let mut outcome = UpsertOutcome::default();
        let candidates = merge_candidates(candidates);
        if candidates.is_empty() {
            return Ok(outcome);
        }

        let entries = candidates
            .iter()
            .map(|c| {
                let plan = WebhookPlan {
                    record_id: String::new(),
                    biz_type: self.biz_type.clone(),
                    group_id: c.group_id.clone(),
                    date: day,
                    status: PlanStatus::Pending,
                    task_ids: c.task_ids.clone(),
                    payload: c.payload.clone().unwrap_or_else(|| json!({"group_id": c.group_id})),
                    retry_count: 0,
                    last_error: String::new(),
                };
                UniqueEntry {
                    key: c.group_id.clone(),
                    rows: vec![plan.to_fields()],
                }
            })
            .collect();

        let result = self
            .unique
            .ensure(UniqueBatch {
                table: Table::WebhookPlan,
                scope: self.scope(day),
                key_field: plan_columns::GROUP_ID.to_string(),
                lookup_chunk: self.lookup_chunk,
                entries,
            })
            .await?;
        for (group_id, _) in &result.created {
            tracing::info!("📝 Plan created: {} / {} / {}", self.biz_type, group_id, day);
            outcome.created.push(group_id.clone());
        }

        let mut patches: Vec<Record> = Vec::new();
        for candidate in &candidates {
            let Some(records) = result.existing.get(&candidate.group_id) else {
                continue;
            };
            let plans = self.decode(records);
            let Some(first) = plans.first() else {
                tracing::warn!("⚠️ Plan rows for {} could not be decoded", candidate.group_id);
                continue;
            };
            if plans.len() > 1 {
                tracing::warn!(
                    "⚠️ {} duplicate plan rows for {}, merging into {}",
                    plans.len(),
                    candidate.group_id,
                    first.record_id
                );
            }
            let mut merged: BTreeSet<i64> = plans.iter().flat_map(|p| p.task_ids.iter().copied()).collect();
            merged.extend(candidate.task_ids.iter().copied());
            let payload = candidate.payload.as_ref().unwrap_or(&first.payload);

            if merged == first.task_ids && *payload == first.payload {
                outcome.unchanged.push(candidate.group_id.clone());
                continue;
            }
            let mut fields = Fields::new();
            fields.insert(plan_columns::TASK_IDS.into(), json!(format_task_ids(&merged)));
            fields.insert(plan_columns::PAYLOAD.into(), json!(payload.to_string()));
            patches.push(Record {
                record_id: first.record_id.clone(),
                fields,
            });
            tracing::info!(
                "🔄 Plan updated: {} TaskIDs {} → {}",
                candidate.group_id,
                first.task_ids.len(),
                merged.len()
            );
            outcome.updated.push(candidate.group_id.clone());
        }
        if !patches.is_empty() {
            self.store.batch_update(Table::WebhookPlan, patches).await?;
        }
        Ok(outcome)
    }

    /// The plan for (biz type, group, day), if any.
    pub async fn find(&self, group_id: &str, day: Day) -> Result<Option<WebhookPlan>> {
        let found = lookup_by_keys(
            self.store.as_ref(),
            Table::WebhookPlan,
            &self.scope(day),
            plan_columns::GROUP_ID,
            &[group_id.to_string()],
            1,
            self.page_size,
        )
        .await?;
        Ok(found
            .get(group_id)
            .and_then(|records| self.decode(records).into_iter().next()))
    }

    /// Plans of this biz type on `day` still awaiting delivery (pending or failed).
    pub async fn plans_for_reconcile(&self, day: Day) -> Result<Vec<WebhookPlan>> {
        let records = self
            .store
            .query(Table::WebhookPlan, &self.scope(day), self.page_size, 0)
            .await?;
        Ok(self
            .decode(&records)
            .into_iter()
            .filter(|p| !p.status.is_final())
            .collect())
    }

    /// Ready only when every TaskID exists and is terminal. Empty plans are never ready.
    pub async fn check_ready(&self, plan: &WebhookPlan, tasks: &TaskDirectory<'_>) -> Result<Readiness> {
        if plan.task_ids.is_empty() {
            return Ok(Readiness {
                ready: false,
                pending_task_ids: Vec::new(),
                missing_task_ids: Vec::new(),
            });
        }
        let live = tasks.tasks_by_ids(&plan.task_ids).await?;
        let mut pending = Vec::new();
        let mut missing = Vec::new();
        for id in &plan.task_ids {
            match live.get(id) {
                None => missing.push(*id),
                Some(task) if !task.status.is_terminal() => pending.push(*id),
                Some(_) => {}
            }
        }
        let ready = pending.is_empty() && missing.is_empty();
        tracing::debug!(
            "🚦 Plan {} ready={} pending={:?} missing={:?}",
            plan.group_id,
            ready,
            pending,
            missing
        );
        Ok(Readiness {
            ready,
            pending_task_ids: pending,
            missing_task_ids: missing,
        })
    }

    /// Mark a delivered plan. Returns false when the plan was already final.
    pub async fn record_delivery_success(&self, plan: &mut WebhookPlan) -> Result<bool> {
        self.transition(plan, PlanStatus::Success, None, false).await
    }

    /// Record a failed delivery: RetryCount+1, status failed, error kept.
    pub async fn record_delivery_failure(&self, plan: &mut WebhookPlan, error: &str) -> Result<bool> {
        self.transition(plan, PlanStatus::Failed, Some(error), true).await
    }

    /// Plan-level fault; the plan is never retried afterwards.
    pub async fn mark_error(&self, plan: &mut WebhookPlan, reason: &str) -> Result<bool> {
        self.transition(plan, PlanStatus::Error, Some(reason), false).await
    }

    async fn transition(
        &self,
        plan: &mut WebhookPlan,
        to: PlanStatus,
        error: Option<&str>,
        bump_retry: bool,
    ) -> Result<bool> {
        if plan.record_id.is_empty() {
            return Err(SweepError::InvalidInput(format!(
                "plan {} has no record id",
                plan.group_id
            )));
        }
        if plan.status.is_final() {
            tracing::debug!("Plan {} already {}, ignoring {}", plan.group_id, plan.status, to);
            return Ok(false);
        }

        let retry_count = if bump_retry { plan.retry_count + 1 } else { plan.retry_count };
        let last_error = error.unwrap_or("").to_string();
        let mut fields = Fields::new();
        fields.insert(plan_columns::STATUS.into(), json!(to.as_str()));
        fields.insert(plan_columns::RETRY_COUNT.into(), json!(retry_count));
        fields.insert(plan_columns::LAST_ERROR.into(), json!(last_error));
        self.store
            .batch_update(
                Table::WebhookPlan,
                vec![Record {
                    record_id: plan.record_id.clone(),
                    fields,
                }],
            )
            .await?;

        tracing::info!("📮 Plan {} {} → {}", plan.group_id, plan.status, to);
        plan.status = to;
        plan.retry_count = retry_count;
        plan.last_error = last_error;
        Ok(true)
    }
}

/// One candidate per GroupID, first-seen order. TaskIDs are unioned and the
/// last non-empty payload wins.
fn merge_candidates(candidates: Vec<PlanCandidate>) -> Vec<PlanCandidate> {
    let mut merged: Vec<PlanCandidate> = Vec::with_capacity(candidates.len());
    let mut index: HashMap<String, usize> = HashMap::new();
    for candidate in candidates {
        match index.get(&candidate.group_id) {
            Some(&i) => {
                let slot = &mut merged[i];
                slot.task_ids.extend(candidate.task_ids);
                if candidate.payload.is_some() {
                    slot.payload = candidate.payload;
                }
            }
            None => {
                index.insert(candidate.group_id.clone(), merged.len());
                merged.push(candidate);
            }
        }
    }
    merged
}
