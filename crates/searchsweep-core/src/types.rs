//! Domain records exchanged with the record store.

use chrono::{DateTime, FixedOffset, NaiveDate, NaiveDateTime, NaiveTime};
use serde::{Deserialize, Serialize, Serializer};
use serde_json::{Value, json};
use std::collections::BTreeSet;
use std::fmt;

use crate::config::TaskFields;
use crate::error::{Result, SweepError};
use crate::value::{
    Aliases, BOOK_ID_ALIASES, TASK_ID_ALIASES, coerce_f64, coerce_i64, first_text, first_value,
    normalize_epoch_millis, normalize_value, text_with_fallback,
};

/// Raw column → cell map of one record.
pub type Fields = serde_json::Map<String, Value>;

/// A stored row plus the store-assigned identifier.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Record {
    pub record_id: String,
    pub fields: Fields,
}

/// Logical tables behind the record store.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum Table {
    Task,
    ContentMeta,
    WebhookPlan,
}

impl fmt::Display for Table {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Table::Task => write!(f, "task"),
            Table::ContentMeta => write!(f, "content_meta"),
            Table::WebhookPlan => write!(f, "webhook_plan"),
        }
    }
}

// ─── Day ──────────────────────────────────────────────────

/// A calendar day in the configured offset.
///
/// Filters compare on [`Day::start_millis`]; humans see `YYYY-MM-DD`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct Day {
    date: NaiveDate,
    start_millis: i64,
}

impl Day {
    pub fn new(date: NaiveDate, offset: FixedOffset) -> Self {
        let local_midnight = date.and_time(NaiveTime::MIN);
        let utc = local_midnight - chrono::Duration::seconds(offset.local_minus_utc() as i64);
        Self {
            date,
            start_millis: utc.and_utc().timestamp_millis(),
        }
    }

    /// Parse `YYYY-MM-DD`.
    pub fn parse_ymd(raw: &str, offset: FixedOffset) -> Result<Self> {
        NaiveDate::parse_from_str(raw.trim(), "%Y-%m-%d")
            .map(|d| Self::new(d, offset))
            .map_err(|e| SweepError::InvalidInput(format!("bad date '{raw}': {e}")))
    }

    /// The day containing the instant `millis`.
    pub fn from_millis(millis: i64, offset: FixedOffset) -> Option<Self> {
        let instant = DateTime::from_timestamp_millis(millis)?;
        Some(Self::new(instant.with_timezone(&offset).date_naive(), offset))
    }

    /// Decode a Date cell: epoch millis/seconds (number or digits) or a
    /// `YYYY-MM-DD[ HH:MM:SS]` / `YYYY/MM/DD` string.
    pub fn from_cell(value: &Value, offset: FixedOffset) -> Option<Self> {
        if let Value::Number(n) = value {
            let ms = n.as_i64().or_else(|| n.as_f64().map(|f| f as i64))?;
            return Self::from_millis(normalize_epoch_millis(ms), offset);
        }
        let text = normalize_value(value);
        if text.is_empty() {
            return None;
        }
        if text.chars().all(|c| c.is_ascii_digit()) {
            let n: i64 = text.parse().ok()?;
            return Self::from_millis(normalize_epoch_millis(n), offset);
        }
        for layout in ["%Y-%m-%d", "%Y/%m/%d"] {
            if let Ok(d) = NaiveDate::parse_from_str(&text, layout) {
                return Some(Self::new(d, offset));
            }
        }
        for layout in ["%Y-%m-%d %H:%M:%S", "%Y-%m-%dT%H:%M:%S"] {
            if let Ok(dt) = NaiveDateTime::parse_from_str(&text, layout) {
                return Some(Self::new(dt.date(), offset));
            }
        }
        DateTime::parse_from_rfc3339(&text)
            .ok()
            .map(|dt| Self::new(dt.with_timezone(&offset).date_naive(), offset))
    }

    pub fn date(&self) -> NaiveDate {
        self.date
    }

    /// Epoch millis of local midnight.
    pub fn start_millis(&self) -> i64 {
        self.start_millis
    }
}

impl fmt::Display for Day {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.date.format("%Y-%m-%d"))
    }
}

impl Serialize for Day {
    fn serialize<S: Serializer>(&self, serializer: S) -> std::result::Result<S::Ok, S::Error> {
        serializer.collect_str(self)
    }
}

// ─── Task ─────────────────────────────────────────────────

const PARENT_TASK_ID_ALIASES: Aliases = &["ParentTaskID", "parent_task_id"];
const GROUP_ID_ALIASES: Aliases = &["GroupID", "group_id"];

/// Task status as stored in the Task table.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub enum TaskStatus {
    Pending,
    Running,
    Success,
    Failed,
    Other(String),
}

impl TaskStatus {
    pub fn parse(raw: &str) -> Self {
        match raw.trim().to_ascii_lowercase().as_str() {
            "" | "pending" => TaskStatus::Pending,
            "running" => TaskStatus::Running,
            "success" => TaskStatus::Success,
            "failed" => TaskStatus::Failed,
            _ => TaskStatus::Other(raw.trim().to_string()),
        }
    }

    pub fn as_str(&self) -> &str {
        match self {
            TaskStatus::Pending => "pending",
            TaskStatus::Running => "running",
            TaskStatus::Success => "success",
            TaskStatus::Failed => "failed",
            TaskStatus::Other(s) => s,
        }
    }

    /// Success and failed never change without an external re-dispatch.
    pub fn is_terminal(&self) -> bool {
        matches!(self, TaskStatus::Success | TaskStatus::Failed)
    }
}

impl fmt::Display for TaskStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// A decoded Task row.
#[derive(Debug, Clone, PartialEq)]
pub struct Task {
    pub record_id: String,
    pub task_id: i64,
    pub biz_task_id: String,
    pub parent_task_id: String,
    pub app: String,
    pub scene: String,
    pub params: String,
    pub item_id: String,
    pub book_id: String,
    pub url: String,
    pub user_id: String,
    pub user_name: String,
    pub group_id: String,
    pub date: Option<Day>,
    pub status: TaskStatus,
    pub extra: String,
}

impl Task {
    /// Decode a record; rows without a positive TaskID are not tasks.
    pub fn from_record(record: &Record, names: &TaskFields, offset: FixedOffset) -> Option<Self> {
        let f = &record.fields;
        let get = |name: &str| first_text(f, &[name]);

        let mut id_names = vec![names.task_id.as_str()];
        id_names.extend(TASK_ID_ALIASES.iter().copied());
        let task_id = first_value(f, &id_names).and_then(coerce_i64)?;
        if task_id <= 0 {
            return None;
        }

        let date = first_value(f, &[names.date.as_str(), "Date", "date"])
            .and_then(|v| Day::from_cell(v, offset));

        Some(Self {
            record_id: record.record_id.clone(),
            task_id,
            biz_task_id: get(&names.biz_task_id),
            parent_task_id: text_with_fallback(f, &names.parent_task_id, PARENT_TASK_ID_ALIASES),
            app: get(&names.app),
            scene: get(&names.scene),
            params: get(&names.params),
            item_id: get(&names.item_id),
            book_id: text_with_fallback(f, &names.book_id, BOOK_ID_ALIASES),
            url: get(&names.url),
            user_id: get(&names.user_id),
            user_name: get(&names.user_name),
            group_id: text_with_fallback(f, &names.group_id, GROUP_ID_ALIASES),
            date,
            status: TaskStatus::parse(&get(&names.status)),
            extra: get(&names.extra),
        })
    }
}

/// A task row about to be created.
#[derive(Debug, Clone, PartialEq)]
pub struct NewTask {
    pub app: String,
    pub scene: String,
    pub params: String,
    pub item_id: String,
    pub book_id: String,
    pub url: String,
    pub user_id: String,
    pub user_name: String,
    pub group_id: String,
    pub parent_task_id: String,
    pub date: Day,
    pub status: TaskStatus,
}

impl NewTask {
    /// Encode with the configured column names; blank text cells are omitted.
    pub fn to_fields(&self, names: &TaskFields) -> Fields {
        let mut fields = Fields::new();
        let text = [
            (&names.app, &self.app),
            (&names.scene, &self.scene),
            (&names.params, &self.params),
            (&names.item_id, &self.item_id),
            (&names.book_id, &self.book_id),
            (&names.url, &self.url),
            (&names.user_id, &self.user_id),
            (&names.user_name, &self.user_name),
            (&names.group_id, &self.group_id),
            (&names.parent_task_id, &self.parent_task_id),
        ];
        for (column, value) in text {
            if !column.is_empty() && !value.trim().is_empty() {
                fields.insert(column.clone(), Value::String(value.trim().to_string()));
            }
        }
        fields.insert(names.date.clone(), json!(self.date.start_millis()));
        fields.insert(names.status.clone(), Value::String(self.status.as_str().to_string()));
        fields
    }
}

// ─── ContentMeta ──────────────────────────────────────────

const META_DURATION: Aliases = &["TotalDuration", "Duration", "total_duration", "duration"];
const META_EPISODES: Aliases = &["EpisodeCount", "Episodes", "episode_count"];
const META_PRIORITY: Aliases = &["Priority", "priority"];
const META_TAG: Aliases = &["Scene", "Tag", "scene", "tag"];

/// Reference data for one piece of content.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ContentMeta {
    pub book_id: String,
    /// Total duration in minutes.
    pub total_duration_min: Option<f64>,
    pub episode_count: Option<i64>,
    pub priority: String,
    pub tag: String,
}

impl ContentMeta {
    /// Decode a ContentMeta row keyed by `book_column`, falling back to the
    /// usual BookID spellings.
    pub fn from_fields(fields: &Fields, book_column: &str) -> Option<Self> {
        let book_id = text_with_fallback(fields, book_column, BOOK_ID_ALIASES);
        if book_id.is_empty() {
            return None;
        }
        Some(Self {
            book_id,
            total_duration_min: first_value(fields, META_DURATION).and_then(coerce_f64),
            episode_count: first_value(fields, META_EPISODES).and_then(coerce_i64),
            priority: first_text(fields, META_PRIORITY),
            tag: first_text(fields, META_TAG),
        })
    }

    /// Reference duration in whole seconds, `round(minutes * 60)`.
    pub fn reference_seconds(&self) -> Option<i64> {
        self.total_duration_min
            .filter(|m| m.is_finite())
            .map(|m| (m * 60.0).round() as i64)
    }
}

// ─── WebhookPlan ──────────────────────────────────────────

/// Column names of the WebhookPlan table.
pub mod plan_columns {
    pub const BIZ_TYPE: &str = "BizType";
    pub const GROUP_ID: &str = "GroupID";
    pub const DATE: &str = "Date";
    pub const STATUS: &str = "Status";
    pub const TASK_IDS: &str = "TaskIDs";
    pub const PAYLOAD: &str = "Payload";
    pub const RETRY_COUNT: &str = "RetryCount";
    pub const LAST_ERROR: &str = "LastError";
}

/// Delivery state of a webhook plan.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum PlanStatus {
    Pending,
    Success,
    Failed,
    /// Plan-level fault, distinct from a business failure.
    Error,
}

impl PlanStatus {
    pub fn parse(raw: &str) -> Option<Self> {
        match raw.trim().to_ascii_lowercase().as_str() {
            "" | "pending" => Some(PlanStatus::Pending),
            "success" => Some(PlanStatus::Success),
            "failed" => Some(PlanStatus::Failed),
            "error" => Some(PlanStatus::Error),
            _ => None,
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            PlanStatus::Pending => "pending",
            PlanStatus::Success => "success",
            PlanStatus::Failed => "failed",
            PlanStatus::Error => "error",
        }
    }

    /// Success and error are never revisited; failed stays eligible for reconciliation.
    pub fn is_final(&self) -> bool {
        matches!(self, PlanStatus::Success | PlanStatus::Error)
    }
}

impl fmt::Display for PlanStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// One webhook delivery plan, unique per (biz type, group, day).
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct WebhookPlan {
    pub record_id: String,
    pub biz_type: String,
    pub group_id: String,
    pub date: Day,
    pub status: PlanStatus,
    pub task_ids: BTreeSet<i64>,
    pub payload: Value,
    pub retry_count: u32,
    pub last_error: String,
}

impl WebhookPlan {
    /// Decode a plan row. Rows missing their key columns are skipped; an
    /// unrecognised status decodes as [`PlanStatus::Error`].
    pub fn from_record(record: &Record, offset: FixedOffset) -> Option<Self> {
        use plan_columns::*;
        let f = &record.fields;
        let biz_type = first_text(f, &[BIZ_TYPE, "biz_type"]);
        let group_id = first_text(f, &[GROUP_ID, "group_id"]);
        let date = first_value(f, &[DATE, "date"]).and_then(|v| Day::from_cell(v, offset))?;
        if biz_type.is_empty() || group_id.is_empty() {
            return None;
        }
        let raw_status = first_text(f, &[STATUS, "status"]);
        let status = PlanStatus::parse(&raw_status).unwrap_or_else(|| {
            tracing::warn!("⚠️ Plan {} has unknown status '{}'", record.record_id, raw_status);
            PlanStatus::Error
        });
        let payload = match f.get(PAYLOAD) {
            None | Some(Value::Null) => Value::Null,
            Some(Value::Object(o)) => Value::Object(o.clone()),
            Some(other) => {
                let text = normalize_value(other);
                serde_json::from_str(&text).unwrap_or(Value::String(text))
            }
        };
        Some(Self {
            record_id: record.record_id.clone(),
            biz_type,
            group_id,
            date,
            status,
            task_ids: f.get(TASK_IDS).map(parse_task_ids).unwrap_or_default(),
            payload,
            retry_count: first_value(f, &[RETRY_COUNT])
                .and_then(coerce_i64)
                .map(|n| n.max(0) as u32)
                .unwrap_or(0),
            last_error: first_text(f, &[LAST_ERROR]),
        })
    }

    /// Full row for creation.
    pub fn to_fields(&self) -> Fields {
        use plan_columns::*;
        let mut fields = Fields::new();
        fields.insert(BIZ_TYPE.into(), json!(self.biz_type));
        fields.insert(GROUP_ID.into(), json!(self.group_id));
        fields.insert(DATE.into(), json!(self.date.start_millis()));
        fields.insert(STATUS.into(), json!(self.status.as_str()));
        fields.insert(TASK_IDS.into(), json!(format_task_ids(&self.task_ids)));
        fields.insert(PAYLOAD.into(), json!(self.payload.to_string()));
        fields.insert(RETRY_COUNT.into(), json!(self.retry_count));
        if !self.last_error.is_empty() {
            fields.insert(LAST_ERROR.into(), json!(self.last_error));
        }
        fields
    }
}

/// Parse a TaskIDs cell: JSON array, or ids separated by commas/whitespace.
pub fn parse_task_ids(value: &Value) -> BTreeSet<i64> {
    match value {
        Value::Array(items) if !items.iter().any(|it| it.is_object()) => {
            items.iter().filter_map(coerce_i64).filter(|n| *n > 0).collect()
        }
        other => {
            let text = normalize_value(other);
            if text.starts_with('[') {
                if let Ok(Value::Array(items)) = serde_json::from_str::<Value>(&text) {
                    return items.iter().filter_map(coerce_i64).filter(|n| *n > 0).collect();
                }
            }
            text.split(|c: char| c == ',' || c == ';' || c.is_whitespace())
                .filter_map(|part| part.trim().parse::<f64>().ok())
                .map(|f| f as i64)
                .filter(|n| *n > 0)
                .collect()
        }
    }
}

/// Sorted, comma-joined TaskIDs.
pub fn format_task_ids(ids: &BTreeSet<i64>) -> String {
    ids.iter().map(i64::to_string).collect::<Vec<_>>().join(",")
}

#[cfg(test)]
mod tests {
    use super::*;

    fn cst() -> FixedOffset {
        FixedOffset::east_opt(8 * 3600).unwrap()
    }

    fn record(v: Value) -> Record {
        Record {
            record_id: "rec1".into(),
            fields: v.as_object().cloned().unwrap(),
        }
    }

    #[test]
    fn test_day_boundaries() {
        let day = Day::parse_ymd("2026-02-07", cst()).unwrap();
        // 2026-02-07T00:00:00+08:00
        assert_eq!(day.start_millis(), 1_770_393_600_000);
        assert_eq!(day.to_string(), "2026-02-07");

        let late = Day::from_millis(1_770_393_600_000 + 23 * 3600 * 1000, cst()).unwrap();
        assert_eq!(late, day);
        assert_eq!(Day::from_cell(&json!(1_770_393_600), cst()), Some(day));
        assert_eq!(Day::from_cell(&json!("2026/02/07"), cst()), Some(day));
        assert_eq!(Day::from_cell(&json!("2026-02-07 13:00:00"), cst()), Some(day));
        assert_eq!(Day::from_cell(&json!(""), cst()), None);
        assert!(Day::parse_ymd("07-02-2026", cst()).is_err());
    }

    #[test]
    fn test_task_decode() {
        let names = TaskFields::default();
        let task = Task::from_record(
            &record(json!({
                "TaskID": 12,
                "App": "com.smile.gifmaker",
                "BookID": [{"text": "B1"}],
                "Status": "Success",
                "Date": 1_770_393_600_000i64,
                "ParentTaskID": "3",
            })),
            &names,
            cst(),
        )
        .unwrap();
        assert_eq!(task.task_id, 12);
        assert_eq!(task.book_id, "B1");
        assert_eq!(task.status, TaskStatus::Success);
        assert!(task.status.is_terminal());
        assert_eq!(task.parent_task_id, "3");
        assert_eq!(task.date.unwrap().to_string(), "2026-02-07");

        // Historical spelling of the id column.
        let legacy = Task::from_record(&record(json!({"task_id": "5"})), &names, cst()).unwrap();
        assert_eq!(legacy.task_id, 5);
        assert_eq!(legacy.status, TaskStatus::Pending);

        assert!(Task::from_record(&record(json!({"App": "x"})), &names, cst()).is_none());
    }

    #[test]
    fn test_task_status_terminality() {
        assert!(!TaskStatus::parse("running").is_terminal());
        assert!(!TaskStatus::parse("dispatched").is_terminal());
        assert_eq!(TaskStatus::parse("dispatched").as_str(), "dispatched");
        assert!(TaskStatus::parse("FAILED").is_terminal());
    }

    #[test]
    fn test_new_task_encoding_skips_blank() {
        let day = Day::parse_ymd("2026-02-07", cst()).unwrap();
        let task = NewTask {
            app: "a".into(),
            scene: "s".into(),
            params: String::new(),
            item_id: String::new(),
            book_id: "b".into(),
            url: "  ".into(),
            user_id: "u".into(),
            user_name: "n".into(),
            group_id: "g".into(),
            parent_task_id: "1".into(),
            date: day,
            status: TaskStatus::Pending,
        };
        let fields = task.to_fields(&TaskFields::default());
        assert!(!fields.contains_key("Params"));
        assert!(!fields.contains_key("URL"));
        assert_eq!(fields["Date"], json!(1_770_393_600_000i64));
        assert_eq!(fields["Status"], json!("pending"));
    }

    #[test]
    fn test_content_meta() {
        let row = record(json!({"BookID": "B1", "TotalDuration": "5.01", "EpisodeCount": 80}));
        let meta = ContentMeta::from_fields(&row.fields, "BookID").unwrap();
        assert_eq!(meta.reference_seconds(), Some(301));
        assert_eq!(meta.episode_count, Some(80));
        assert!(ContentMeta::from_fields(&Fields::new(), "BookID").is_none());

        let custom = record(json!({"书籍ID": "B9", "TotalDuration": 3}));
        assert_eq!(ContentMeta::from_fields(&custom.fields, "书籍ID").unwrap().book_id, "B9");
        let snake = record(json!({"book_id": "B2"}));
        assert_eq!(ContentMeta::from_fields(&snake.fields, "书籍ID").unwrap().book_id, "B2");
    }

    #[test]
    fn test_plan_roundtrip_fields() {
        let day = Day::parse_ymd("2026-02-07", cst()).unwrap();
        let plan = WebhookPlan {
            record_id: String::new(),
            biz_type: "x".into(),
            group_id: "G1".into(),
            date: day,
            status: PlanStatus::Pending,
            task_ids: [3, 1, 2].into_iter().collect(),
            payload: json!({"book_id": "B1"}),
            retry_count: 0,
            last_error: String::new(),
        };
        let fields = plan.to_fields();
        assert_eq!(fields["TaskIDs"], json!("1,2,3"));
        let decoded = WebhookPlan::from_record(
            &Record { record_id: "rec9".into(), fields },
            cst(),
        )
        .unwrap();
        assert_eq!(decoded.task_ids, plan.task_ids);
        assert_eq!(decoded.payload, plan.payload);
        assert_eq!(decoded.status, PlanStatus::Pending);
    }

    #[test]
    fn test_plan_unknown_status_is_error() {
        let plan = WebhookPlan::from_record(
            &record(json!({"BizType": "x", "GroupID": "G", "Date": "2026-02-07", "Status": "weird"})),
            cst(),
        )
        .unwrap();
        assert_eq!(plan.status, PlanStatus::Error);
    }

    #[test]
    fn test_parse_task_ids_shapes() {
        let want: BTreeSet<i64> = [1, 2, 3].into_iter().collect();
        assert_eq!(parse_task_ids(&json!("3, 1,2")), want);
        assert_eq!(parse_task_ids(&json!("[1,2,3]")), want);
        assert_eq!(parse_task_ids(&json!([3, "2", 1])), want);
        assert_eq!(parse_task_ids(&json!([{"text": "1,2 3"}])), want);
        assert!(parse_task_ids(&json!("")).is_empty());
    }
}
