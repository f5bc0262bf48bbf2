//! SearchSweep configuration system.
//!
//! Loaded from `~/.searchsweep/config.toml` (or an explicit path), then
//! overridden by the environment variables the Bitable tooling has always
//! used (`FEISHU_APP_ID`, `TASK_BITABLE_URL`, `TASK_FIELD_*`, ...).

use chrono::{FixedOffset, Offset, Utc};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::path::{Path, PathBuf};

use crate::error::{Result, SweepError};

pub const DEFAULT_BASE_URL: &str = "https://open.feishu.cn";
pub const DEFAULT_BIZ_TYPE: &str = "piracy_general_search";

/// Root configuration.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct SweepConfig {
    #[serde(default)]
    pub feishu: FeishuConfig,
    #[serde(default)]
    pub capture: CaptureConfig,
    #[serde(default)]
    pub pipeline: PipelineConfig,
    #[serde(default)]
    pub scenes: SceneConfig,
    #[serde(default)]
    pub platform_labels: PlatformLabels,
    #[serde(default)]
    pub task_fields: TaskFields,
    #[serde(default)]
    pub content_fields: ContentFields,
}

impl SweepConfig {
    /// Load config from `path`, or from the default path when `None`.
    /// A missing default file yields the built-in defaults.
    pub fn load(path: Option<&Path>) -> Result<Self> {
        match path {
            Some(p) => Self::load_from(p),
            None => {
                let p = Self::default_path();
                if p.exists() {
                    Self::load_from(&p)
                } else {
                    Ok(Self::default())
                }
            }
        }
    }

    /// Load config from a specific path.
    pub fn load_from(path: &Path) -> Result<Self> {
        let content = std::fs::read_to_string(path)
            .map_err(|e| SweepError::Config(format!("Failed to read config {}: {e}", path.display())))?;
        Self::from_toml(&content)
    }

    pub fn from_toml(content: &str) -> Result<Self> {
        toml::from_str(content).map_err(|e| SweepError::Config(format!("Failed to parse config: {e}")))
    }

    /// Get the default config path.
    pub fn default_path() -> PathBuf {
        Self::home_dir().join("config.toml")
    }

    /// Get the SearchSweep home directory.
    pub fn home_dir() -> PathBuf {
        dirs::home_dir()
            .unwrap_or_else(|| PathBuf::from("."))
            .join(".searchsweep")
    }

    /// Apply overrides from the process environment.
    pub fn apply_env(&mut self) {
        self.apply_env_with(|key| std::env::var(key).ok());
    }

    /// Apply overrides from an arbitrary variable source. Blank values are ignored.
    pub fn apply_env_with<F>(&mut self, lookup: F)
    where
        F: Fn(&str) -> Option<String>,
    {
        let get = |key: &str| {
            lookup(key)
                .map(|v| v.trim().to_string())
                .filter(|v| !v.is_empty())
        };

        if let Some(v) = get("FEISHU_APP_ID") {
            self.feishu.app_id = v;
        }
        if let Some(v) = get("FEISHU_APP_SECRET") {
            self.feishu.app_secret = v;
        }
        if let Some(v) = get("FEISHU_BASE_URL") {
            self.feishu.base_url = v;
        }
        if let Some(v) = get("TASK_BITABLE_URL") {
            self.feishu.task_table_url = v;
        }
        if let Some(v) = get("CONTENT_BITABLE_URL") {
            self.feishu.content_table_url = v;
        }
        if let Some(v) = get("WEBHOOK_BITABLE_URL") {
            self.feishu.webhook_table_url = v;
        }
        if let Some(v) = get("CAPTURE_DB_PATH") {
            self.capture.db_path = v;
        }
        if let Some(v) = get("CONTENT_FIELD_BOOKID") {
            self.content_fields.book_id = v;
        }
        for (env_name, slot) in self.task_fields.env_slots() {
            if let Some(v) = get(env_name) {
                *slot = v;
            }
        }
    }

    /// Fail fast on missing credentials or table references.
    pub fn validate(&self) -> Result<()> {
        let required = [
            ("FEISHU_APP_ID", &self.feishu.app_id),
            ("FEISHU_APP_SECRET", &self.feishu.app_secret),
            ("TASK_BITABLE_URL", &self.feishu.task_table_url),
            ("CONTENT_BITABLE_URL", &self.feishu.content_table_url),
            ("WEBHOOK_BITABLE_URL", &self.feishu.webhook_table_url),
        ];
        let missing: Vec<&str> = required
            .iter()
            .filter(|(_, v)| v.trim().is_empty())
            .map(|(k, _)| *k)
            .collect();
        if !missing.is_empty() {
            return Err(SweepError::Config(format!("{} required", missing.join("/"))));
        }
        if self.capture.db_path.trim().is_empty() {
            return Err(SweepError::Config("capture.db_path is required".into()));
        }
        if !(0.0..=1.0).contains(&self.pipeline.threshold) {
            return Err(SweepError::Config(format!(
                "pipeline.threshold must be within [0, 1], got {}",
                self.pipeline.threshold
            )));
        }
        Ok(())
    }

    /// Day boundaries are computed in this offset.
    pub fn utc_offset(&self) -> FixedOffset {
        FixedOffset::east_opt(self.pipeline.utc_offset_hours * 3600)
            .unwrap_or_else(|| Utc.fix())
    }
}

/// Feishu credentials and table references.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct FeishuConfig {
    #[serde(default)]
    pub app_id: String,
    #[serde(default)]
    pub app_secret: String,
    #[serde(default = "default_base_url")]
    pub base_url: String,
    #[serde(default)]
    pub task_table_url: String,
    #[serde(default)]
    pub content_table_url: String,
    #[serde(default)]
    pub webhook_table_url: String,
    #[serde(default = "default_timeout_secs")]
    pub timeout_secs: u64,
}

fn default_base_url() -> String { DEFAULT_BASE_URL.into() }
fn default_timeout_secs() -> u64 { 30 }

impl Default for FeishuConfig {
    fn default() -> Self {
        Self {
            app_id: String::new(),
            app_secret: String::new(),
            base_url: default_base_url(),
            task_table_url: String::new(),
            content_table_url: String::new(),
            webhook_table_url: String::new(),
            timeout_secs: default_timeout_secs(),
        }
    }
}

/// Device capture database.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CaptureConfig {
    #[serde(default = "default_capture_db")]
    pub db_path: String,
    #[serde(default = "default_capture_table")]
    pub table: String,
}

fn default_capture_db() -> String { "~/.searchsweep/capture.sqlite".into() }
fn default_capture_table() -> String { "capture_results".into() }

impl Default for CaptureConfig {
    fn default() -> Self {
        Self {
            db_path: default_capture_db(),
            table: default_capture_table(),
        }
    }
}

impl CaptureConfig {
    /// Database path with `~` expanded.
    pub fn expanded_db_path(&self) -> PathBuf {
        PathBuf::from(shellexpand::tilde(&self.db_path).to_string())
    }
}

/// Clustering, batching and plan settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PipelineConfig {
    #[serde(default = "default_threshold")]
    pub threshold: f64,
    #[serde(default = "default_biz_type")]
    pub biz_type: String,
    /// GroupIDs per webhook-plan existence query.
    #[serde(default = "default_plan_lookup_chunk")]
    pub plan_lookup_chunk: usize,
    /// Rows per batch create/update call (store maximum is 500).
    #[serde(default = "default_batch_size")]
    pub batch_size: usize,
    #[serde(default = "default_page_size")]
    pub page_size: usize,
    #[serde(default = "default_utc_offset_hours")]
    pub utc_offset_hours: i32,
}

fn default_threshold() -> f64 { 0.5 }
fn default_biz_type() -> String { DEFAULT_BIZ_TYPE.into() }
fn default_plan_lookup_chunk() -> usize { 40 }
fn default_batch_size() -> usize { crate::MAX_BATCH_SIZE }
fn default_page_size() -> usize { crate::DEFAULT_PAGE_SIZE }
fn default_utc_offset_hours() -> i32 { 8 }

impl Default for PipelineConfig {
    fn default() -> Self {
        Self {
            threshold: default_threshold(),
            biz_type: default_biz_type(),
            plan_lookup_chunk: default_plan_lookup_chunk(),
            batch_size: default_batch_size(),
            page_size: default_page_size(),
            utc_offset_hours: default_utc_offset_hours(),
        }
    }
}

/// Scene names written on generated follow-up tasks.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SceneConfig {
    #[serde(default = "default_profile_scene")]
    pub profile_search: String,
    #[serde(default = "default_collection_scene")]
    pub collection_capture: String,
    #[serde(default = "default_anchor_scene")]
    pub anchor_capture: String,
}

fn default_profile_scene() -> String { "personal-page-search".into() }
fn default_collection_scene() -> String { "collection-video-capture".into() }
fn default_anchor_scene() -> String { "anchor-link-capture".into() }

impl Default for SceneConfig {
    fn default() -> Self {
        Self {
            profile_search: default_profile_scene(),
            collection_capture: default_collection_scene(),
            anchor_capture: default_anchor_scene(),
        }
    }
}

/// App package name → platform label used in GroupIDs.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(transparent)]
pub struct PlatformLabels(pub BTreeMap<String, String>);

impl Default for PlatformLabels {
    fn default() -> Self {
        let mut map = BTreeMap::new();
        map.insert("com.smile.gifmaker".to_string(), "快手".to_string());
        Self(map)
    }
}

impl PlatformLabels {
    /// Label for `app`, or the app value itself when unmapped.
    pub fn label<'a>(&'a self, app: &'a str) -> &'a str {
        self.0.get(app).map(String::as_str).unwrap_or(app)
    }
}

/// Column names of the Task table. Each can be overridden via `TASK_FIELD_*`.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct TaskFields {
    pub task_id: String,
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
    pub date: String,
    pub status: String,
    pub group_id: String,
    pub extra: String,
}

impl Default for TaskFields {
    fn default() -> Self {
        Self {
            task_id: "TaskID".into(),
            biz_task_id: "BizTaskID".into(),
            parent_task_id: "ParentTaskID".into(),
            app: "App".into(),
            scene: "Scene".into(),
            params: "Params".into(),
            item_id: "ItemID".into(),
            book_id: "BookID".into(),
            url: "URL".into(),
            user_id: "UserID".into(),
            user_name: "UserName".into(),
            date: "Date".into(),
            status: "Status".into(),
            group_id: "GroupID".into(),
            extra: "Extra".into(),
        }
    }
}

impl TaskFields {
    fn env_slots(&mut self) -> [(&'static str, &mut String); 15] {
        [
            ("TASK_FIELD_TASKID", &mut self.task_id),
            ("TASK_FIELD_BIZ_TASK_ID", &mut self.biz_task_id),
            ("TASK_FIELD_PARENT_TASK_ID", &mut self.parent_task_id),
            ("TASK_FIELD_APP", &mut self.app),
            ("TASK_FIELD_SCENE", &mut self.scene),
            ("TASK_FIELD_PARAMS", &mut self.params),
            ("TASK_FIELD_ITEMID", &mut self.item_id),
            ("TASK_FIELD_BOOKID", &mut self.book_id),
            ("TASK_FIELD_URL", &mut self.url),
            ("TASK_FIELD_USERID", &mut self.user_id),
            ("TASK_FIELD_USERNAME", &mut self.user_name),
            ("TASK_FIELD_DATE", &mut self.date),
            ("TASK_FIELD_STATUS", &mut self.status),
            ("TASK_FIELD_GROUPID", &mut self.group_id),
            ("TASK_FIELD_EXTRA", &mut self.extra),
        ]
    }
}

/// Column names of the ContentMeta table.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ContentFields {
    /// Filter column for BookID lookups.
    pub book_id: String,
}

impl Default for ContentFields {
    fn default() -> Self {
        Self {
            book_id: "BookID".into(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;

    #[test]
    fn test_defaults() {
        let config = SweepConfig::default();
        assert_eq!(config.feishu.base_url, DEFAULT_BASE_URL);
        assert_eq!(config.pipeline.plan_lookup_chunk, 40);
        assert_eq!(config.pipeline.batch_size, 500);
        assert_eq!(config.platform_labels.label("com.smile.gifmaker"), "快手");
        assert_eq!(config.platform_labels.label("com.other"), "com.other");
    }

    #[test]
    fn test_parse_partial_toml() {
        let config = SweepConfig::from_toml(
            r#"
            [pipeline]
            threshold = 0.8

            [platform_labels]
            "com.ss.android.ugc.aweme" = "抖音"

            [task_fields]
            task_id = "任务ID"
            "#,
        )
        .unwrap();
        assert_eq!(config.pipeline.threshold, 0.8);
        assert_eq!(config.pipeline.biz_type, DEFAULT_BIZ_TYPE);
        assert_eq!(config.platform_labels.label("com.ss.android.ugc.aweme"), "抖音");
        assert_eq!(config.task_fields.task_id, "任务ID");
        assert_eq!(config.task_fields.book_id, "BookID");
        assert_eq!(config.content_fields.book_id, "BookID");
    }

    #[test]
    fn test_env_overrides() {
        let env: HashMap<&str, &str> = HashMap::from([
            ("FEISHU_APP_ID", "cli_x"),
            ("FEISHU_APP_SECRET", " secret "),
            ("TASK_BITABLE_URL", "https://x.feishu.cn/base/app?table=t1"),
            ("TASK_FIELD_GROUPID", "Group"),
            ("CONTENT_FIELD_BOOKID", "book_id"),
            ("FEISHU_BASE_URL", "   "),
        ]);
        let mut config = SweepConfig::default();
        config.apply_env_with(|k| env.get(k).map(|v| v.to_string()));
        assert_eq!(config.feishu.app_id, "cli_x");
        assert_eq!(config.feishu.app_secret, "secret");
        assert_eq!(config.feishu.base_url, DEFAULT_BASE_URL);
        assert_eq!(config.task_fields.group_id, "Group");
        assert_eq!(config.content_fields.book_id, "book_id");
    }

    #[test]
    fn test_validate_reports_missing() {
        let config = SweepConfig::default();
        let err = config.validate().unwrap_err();
        assert!(err.is_config());
        assert!(err.to_string().contains("FEISHU_APP_ID"));

        let mut config = SweepConfig::default();
        config.feishu.app_id = "a".into();
        config.feishu.app_secret = "b".into();
        config.feishu.task_table_url = "u1".into();
        config.feishu.content_table_url = "u2".into();
        config.feishu.webhook_table_url = "u3".into();
        assert!(config.validate().is_ok());

        config.pipeline.threshold = 1.5;
        assert!(config.validate().is_err());
    }
}
