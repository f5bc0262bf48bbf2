//! Raw capture rows as the clustering engine sees them.

use regex::Regex;
use searchsweep_core::types::Fields;
use searchsweep_core::value::{
    Aliases, BOOK_ID_ALIASES, TASK_ID_ALIASES, coerce_f64, coerce_i64, first_text, first_value,
};
use std::collections::BTreeSet;
use std::sync::LazyLock;

pub const TASK_ID: Aliases = TASK_ID_ALIASES;
pub const ITEM_ID: Aliases = &["ItemID", "item_id", "ItemId", "PhotoID", "photo_id"];
pub const USER_ALIAS: Aliases = &["UserAlias", "user_alias", "AuthorAlias", "author_alias"];
pub const USER_ID: Aliases = &["UserID", "user_id", "AuthorID", "author_id"];
pub const USER_NAME: Aliases = &["UserName", "user_name", "AuthorName", "author_name"];
pub const DURATION: Aliases = &["Duration", "duration", "DurationSec", "duration_sec", "PlayDuration"];
pub const TAGS: Aliases = &["Tags", "tags", "Tag", "tag"];
pub const ANCHOR: Aliases = &["AnchorPoint", "anchor_point", "Anchor", "anchor"];
pub const EXTRA: Aliases = &["Extra", "extra"];
pub const BOOK_ID: Aliases = BOOK_ID_ALIASES;
pub const PARAMS: Aliases = &["Params", "params"];

/// Prefix of placeholder item ids for rows that carry none.
pub const SYNTHETIC_ITEM_PREFIX: &str = "__row_";

/// Durations above this are milliseconds.
const MILLIS_THRESHOLD: f64 = 100_000.0;

static COLLECTION_RE: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"(?i)合集|collection|compilation").expect("collection pattern"));

static ANCHOR_URL_RE: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r#"[A-Za-z][A-Za-z0-9+.\-]*://[^\s"'<>,，。；;）)\]}]+"#).expect("anchor pattern")
});

/// One decoded capture row.
#[derive(Debug, Clone, PartialEq)]
pub struct CaptureRow {
    pub task_id: Option<i64>,
    pub item_id: String,
    pub synthetic_item: bool,
    pub user_alias: String,
    pub user_id: String,
    pub user_name: String,
    pub duration_sec: i64,
    pub tags: String,
    pub anchor_text: String,
    pub book_id: String,
    pub params: String,
}

impl CaptureRow {
    /// Decode row `index` of the current pass.
    pub fn from_fields(fields: &Fields, index: usize) -> Self {
        let item_id = first_text(fields, ITEM_ID);
        let synthetic_item = item_id.is_empty();
        let item_id = if synthetic_item {
            format!("{SYNTHETIC_ITEM_PREFIX}{index}")
        } else {
            item_id
        };

        let mut anchor_text = first_text(fields, ANCHOR);
        let extra = first_text(fields, EXTRA);
        if !extra.is_empty() {
            if !anchor_text.is_empty() {
                anchor_text.push('\n');
            }
            anchor_text.push_str(&extra);
        }

        Self {
            task_id: first_value(fields, TASK_ID).and_then(coerce_i64).filter(|id| *id > 0),
            item_id,
            synthetic_item,
            user_alias: first_text(fields, USER_ALIAS),
            user_id: first_text(fields, USER_ID),
            user_name: first_text(fields, USER_NAME),
            duration_sec: normalize_duration(first_value(fields, DURATION).and_then(coerce_f64)),
            tags: first_text(fields, TAGS),
            anchor_text,
            book_id: first_text(fields, BOOK_ID),
            params: first_text(fields, PARAMS),
        }
    }

    /// First non-empty of alias, id, name.
    pub fn user_key(&self) -> Option<&str> {
        [&self.user_alias, &self.user_id, &self.user_name]
            .into_iter()
            .map(|s| s.as_str())
            .find(|s| !s.is_empty())
    }

    pub fn is_collection(&self) -> bool {
        COLLECTION_RE.is_match(&self.tags)
    }

    pub fn anchor_links(&self) -> BTreeSet<String> {
        extract_anchor_links(&self.anchor_text)
    }
}

/// Seconds from a raw duration of unknown unit.
///
/// Non-finite or non-positive → 0; above 100000 → milliseconds.
pub fn normalize_duration(raw: Option<f64>) -> i64 {
    let Some(mut value) = raw.filter(|v| v.is_finite() && *v > 0.0) else {
        return 0;
    };
    if value > MILLIS_THRESHOLD {
        value /= 1000.0;
    }
    value.round() as i64
}

/// Distinct scheme-prefixed links (app deeplinks or http/https) in `text`.
pub fn extract_anchor_links(text: &str) -> BTreeSet<String> {
    ANCHOR_URL_RE
        .find_iter(text)
        .map(|m| m.as_str().trim_end_matches(['.', '!', '?', ':']).to_string())
        .filter(|link| !link.ends_with("://"))
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn fields(v: serde_json::Value) -> Fields {
        v.as_object().cloned().unwrap()
    }

    #[test]
    fn test_duration_units() {
        assert_eq!(normalize_duration(Some(120.4)), 120);
        assert_eq!(normalize_duration(Some(100_000.0)), 100_000);
        assert_eq!(normalize_duration(Some(120_500.0)), 121);
        assert_eq!(normalize_duration(Some(-3.0)), 0);
        assert_eq!(normalize_duration(Some(f64::NAN)), 0);
        assert_eq!(normalize_duration(None), 0);
    }

    #[test]
    fn test_decode_row() {
        let row = CaptureRow::from_fields(
            &fields(json!({
                "task_id": "12",
                "ItemID": "i1",
                "UserID": "u1",
                "UserName": "Alice",
                "Duration": "95000",
                "Tags": "短剧 合集",
                "AnchorPoint": "kwai://profile/123, see https://v.kuaishou.com/abc.",
            })),
            3,
        );
        assert_eq!(row.task_id, Some(12));
        assert_eq!(row.user_key(), Some("u1"));
        assert_eq!(row.duration_sec, 95_000);
        assert!(row.is_collection());
        let links: Vec<String> = row.anchor_links().into_iter().collect();
        assert_eq!(links, vec!["https://v.kuaishou.com/abc", "kwai://profile/123"]);
    }

    #[test]
    fn test_every_task_id_spelling_decodes() {
        for column in TASK_ID_ALIASES {
            let mut row = Fields::new();
            row.insert(column.to_string(), json!(7));
            row.insert("ItemID".into(), json!("i1"));
            assert_eq!(CaptureRow::from_fields(&row, 0).task_id, Some(7), "column {column}");
        }
    }

    #[test]
    fn test_synthetic_item_and_missing_identity() {
        let row = CaptureRow::from_fields(&fields(json!({"TaskID": 1, "Tags": "Collection"})), 7);
        assert!(row.synthetic_item);
        assert_eq!(row.item_id, "__row_7");
        assert_eq!(row.user_key(), None);
        assert!(row.is_collection());
    }

    #[test]
    fn test_anchor_from_extra_deduplicated() {
        let row = CaptureRow::from_fields(
            &fields(json!({
                "Anchor": "snssdk1128://item?id=9",
                "Extra": "{\"url\":\"snssdk1128://item?id=9\"}",
            })),
            0,
        );
        assert_eq!(row.anchor_links().len(), 1);
        assert!(extract_anchor_links("no links here").is_empty());
    }
}
