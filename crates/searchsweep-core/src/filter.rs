//! Record-store filter model.
//!
//! A [`Filter`] is an AND of equality conditions plus an optional OR-group of
//! equality conditions, which is all the Task / ContentMeta / WebhookPlan
//! lookups need. Backends translate it to their own query language; the
//! in-memory store evaluates it with [`Filter::matches`].

use serde::Serialize;

use crate::types::{Day, Fields};
use crate::value::{coerce_i64, normalize_epoch_millis, normalize_value};

const DAY_MILLIS: i64 = 24 * 60 * 60 * 1000;

/// Right-hand side of an equality condition.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub enum FilterValue {
    Text(String),
    /// Day-start epoch millis; matches any instant within that day.
    ExactDate(i64),
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct Condition {
    pub field: String,
    pub value: FilterValue,
}

impl Condition {
    pub fn text(field: impl Into<String>, value: impl Into<String>) -> Self {
        Self {
            field: field.into(),
            value: FilterValue::Text(value.into()),
        }
    }

    pub fn matches(&self, fields: &Fields) -> bool {
        let Some(cell) = fields.get(&self.field) else {
            return false;
        };
        match &self.value {
            FilterValue::Text(want) => {
                if let serde_json::Value::Array(items) = cell {
                    if items.iter().any(|it| normalize_value(it) == *want) {
                        return true;
                    }
                }
                normalize_value(cell) == *want
            }
            FilterValue::ExactDate(start) => coerce_i64(cell)
                .map(normalize_epoch_millis)
                .is_some_and(|ms| ms >= *start && ms < start + DAY_MILLIS),
        }
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct Filter {
    /// Every condition must hold.
    pub all: Vec<Condition>,
    /// At least one must hold when non-empty.
    pub any: Vec<Condition>,
}

impl Filter {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn eq(mut self, field: impl Into<String>, value: impl Into<String>) -> Self {
        self.all.push(Condition::text(field, value));
        self
    }

    pub fn on_day(mut self, field: impl Into<String>, day: Day) -> Self {
        self.all.push(Condition {
            field: field.into(),
            value: FilterValue::ExactDate(day.start_millis()),
        });
        self
    }

    /// OR-of-equality over `values` for one field. Blank and repeated values are dropped.
    pub fn any_of<I, S>(mut self, field: &str, values: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        for value in values {
            let value: String = value.into();
            let value = value.trim().to_string();
            if value.is_empty() {
                continue;
            }
            let cond = Condition::text(field, value);
            if !self.any.contains(&cond) {
                self.any.push(cond);
            }
        }
        self
    }

    pub fn is_empty(&self) -> bool {
        self.all.is_empty() && self.any.is_empty()
    }

    pub fn matches(&self, fields: &Fields) -> bool {
        self.all.iter().all(|c| c.matches(fields))
            && (self.any.is_empty() || self.any.iter().any(|c| c.matches(fields)))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::FixedOffset;
    use serde_json::json;

    fn fields(v: serde_json::Value) -> Fields {
        v.as_object().cloned().unwrap()
    }

    #[test]
    fn test_and_with_or_group() {
        let day = Day::parse_ymd("2026-02-07", FixedOffset::east_opt(8 * 3600).unwrap()).unwrap();
        let filter = Filter::new()
            .eq("App", "com.smile.gifmaker")
            .on_day("Date", day)
            .any_of("GroupID", ["G1", "G2", "G2", " "]);
        assert_eq!(filter.any.len(), 2);

        let hit = fields(json!({
            "App": "com.smile.gifmaker",
            "Date": day.start_millis() + 3_600_000,
            "GroupID": [{"text": "G2"}],
        }));
        assert!(filter.matches(&hit));

        let other_day = fields(json!({
            "App": "com.smile.gifmaker",
            "Date": day.start_millis() + 24 * 3_600_000,
            "GroupID": "G1",
        }));
        assert!(!filter.matches(&other_day));

        let other_group = fields(json!({
            "App": "com.smile.gifmaker",
            "Date": day.start_millis(),
            "GroupID": "G3",
        }));
        assert!(!filter.matches(&other_group));
    }

    #[test]
    fn test_multi_value_cell_and_numbers() {
        let f = fields(json!({"Tags": ["a", "b"], "TaskID": 12.0}));
        assert!(Filter::new().eq("Tags", "b").matches(&f));
        assert!(Filter::new().eq("TaskID", "12").matches(&f));
        assert!(!Filter::new().eq("Missing", "").matches(&f));
        assert!(Filter::new().matches(&f));
    }
}
