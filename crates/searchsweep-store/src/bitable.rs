//! Feishu Bitable record store.
//!
//! One [`FeishuClient`] (tenant token cached until shortly before expiry)
//! serves the three logical tables. Each table is addressed by a Bitable URL;
//! wiki URLs are resolved to their backing app token once, at connect time.

use async_trait::async_trait;
use searchsweep_core::config::FeishuConfig;
use searchsweep_core::error::{Result, SweepError};
use searchsweep_core::filter::{Condition, Filter, FilterValue};
use searchsweep_core::store::RecordStore;
use searchsweep_core::types::{Fields, Record, Table};
use searchsweep_core::{DEFAULT_PAGE_SIZE, MAX_BATCH_SIZE, MAX_PAGE_SIZE};
use serde::Deserialize;
use serde::de::DeserializeOwned;
use serde_json::{Value, json};
use std::collections::HashMap;
use std::time::{Duration, Instant};
use tokio::sync::Mutex;

/// Location of one Bitable table, parsed from its share URL.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BitableRef {
    pub raw_url: String,
    pub app_token: String,
    pub table_id: String,
    pub view_id: String,
    pub wiki_token: String,
}

impl BitableRef {
    /// Parse `https://…/base/<app>?table=<id>` or `https://…/wiki/<node>?table=<id>`.
    pub fn parse(raw: &str) -> Result<Self> {
        let raw = raw.trim();
        if raw.is_empty() {
            return Err(SweepError::Config("bitable url is empty".into()));
        }
        let url = reqwest::Url::parse(raw)
            .map_err(|e| SweepError::Config(format!("bad bitable url '{raw}': {e}")))?;

        let segments: Vec<&str> = url
            .path_segments()
            .map(|s| s.filter(|p| !p.is_empty()).collect())
            .unwrap_or_default();

        let mut app_token = String::new();
        let mut wiki_token = String::new();
        for pair in segments.windows(2) {
            match pair[0] {
                "base" => {
                    app_token = pair[1].to_string();
                    break;
                }
                "wiki" => wiki_token = pair[1].to_string(),
                _ => {}
            }
        }
        if app_token.is_empty() && wiki_token.is_empty() {
            app_token = segments.last().map(|s| s.to_string()).unwrap_or_default();
        }

        let query_value = |keys: &[&str]| -> String {
            keys.iter()
                .find_map(|k| {
                    url.query_pairs()
                        .find(|(name, value)| name == *k && !value.trim().is_empty())
                        .map(|(_, value)| value.trim().to_string())
                })
                .unwrap_or_default()
        };
        let table_id = query_value(&["table", "tableId", "table_id"]);
        let view_id = query_value(&["view", "viewId", "view_id"]);
        if table_id.is_empty() {
            return Err(SweepError::Config(format!(
                "missing table_id in bitable url query: {raw}"
            )));
        }

        Ok(Self {
            raw_url: raw.to_string(),
            app_token,
            table_id,
            view_id,
            wiki_token,
        })
    }
}

#[derive(Debug, Deserialize)]
struct Envelope<T> {
    #[serde(default)]
    code: i64,
    #[serde(default)]
    msg: String,
    data: Option<T>,
}

#[derive(Debug, Deserialize)]
struct TenantToken {
    #[serde(default)]
    code: i64,
    #[serde(default)]
    msg: String,
    #[serde(default)]
    tenant_access_token: String,
    #[serde(default)]
    expire: u64,
}

#[derive(Debug, Default, Deserialize)]
struct WikiNode {
    #[serde(default)]
    node: WikiNodeInner,
}

#[derive(Debug, Default, Deserialize)]
struct WikiNodeInner {
    #[serde(default)]
    obj_type: String,
    #[serde(default)]
    obj_token: String,
}

#[derive(Debug, Default, Deserialize)]
struct SearchPage {
    #[serde(default)]
    items: Vec<RawRecord>,
    #[serde(default)]
    has_more: bool,
    #[serde(default)]
    page_token: Option<String>,
}

#[derive(Debug, Default, Deserialize)]
struct CreatedRecords {
    #[serde(default)]
    records: Vec<RawRecord>,
}

#[derive(Debug, Default, Deserialize)]
struct RawRecord {
    #[serde(default)]
    record_id: String,
    #[serde(default)]
    fields: Fields,
}

struct CachedToken {
    value: String,
    expires_at: Instant,
}

/// Authenticated Feishu Open API client.
pub struct FeishuClient {
    base_url: String,
    app_id: String,
    app_secret: String,
    http: reqwest::Client,
    token: Mutex<Option<CachedToken>>,
}

impl FeishuClient {
    pub fn new(config: &FeishuConfig) -> Result<Self> {
        if config.app_id.trim().is_empty() || config.app_secret.trim().is_empty() {
            return Err(SweepError::Config("FEISHU_APP_ID/FEISHU_APP_SECRET required".into()));
        }
        let http = reqwest::Client::builder()
            .timeout(Duration::from_secs(config.timeout_secs.max(1)))
            .build()
            .map_err(|e| SweepError::Config(format!("http client: {e}")))?;
        Ok(Self {
            base_url: config.base_url.trim_end_matches('/').to_string(),
            app_id: config.app_id.trim().to_string(),
            app_secret: config.app_secret.trim().to_string(),
            http,
            token: Mutex::new(None),
        })
    }

    /// Tenant access token, refreshed a minute before it expires.
    async fn tenant_token(&self) -> Result<String> {
        let mut cached = self.token.lock().await;
        if let Some(tok) = cached.as_ref() {
            if tok.expires_at > Instant::now() {
                return Ok(tok.value.clone());
            }
        }

        let url = format!("{}/open-apis/auth/v3/tenant_access_token/internal", self.base_url);
        let resp = self
            .http
            .post(&url)
            .json(&json!({"app_id": self.app_id, "app_secret": self.app_secret}))
            .send()
            .await
            .map_err(|e| SweepError::external("tenant_token", e))?;
        if !resp.status().is_success() {
            let status = resp.status();
            let text = resp.text().await.unwrap_or_default();
            return Err(SweepError::external("tenant_token", format!("http {status}: {text}")));
        }
        let body: TenantToken = resp
            .json()
            .await
            .map_err(|e| SweepError::external("tenant_token", e))?;
        if body.code != 0 {
            return Err(SweepError::external(
                "tenant_token",
                format!("code={} msg={}", body.code, body.msg),
            ));
        }
        let value = body.tenant_access_token.trim().to_string();
        if value.is_empty() {
            return Err(SweepError::external("tenant_token", "token missing in response"));
        }
        let ttl = body.expire.max(120).saturating_sub(60);
        tracing::debug!("🔑 Tenant token refreshed (ttl {ttl}s)");
        *cached = Some(CachedToken {
            value: value.clone(),
            expires_at: Instant::now() + Duration::from_secs(ttl),
        });
        Ok(value)
    }

    /// Send an authenticated request and unwrap the `{code, msg, data}` envelope.
    async fn call<T: DeserializeOwned + Default>(
        &self,
        op: &str,
        method: reqwest::Method,
        path: &str,
        body: Option<&Value>,
    ) -> Result<T> {
        let token = self.tenant_token().await?;
        let url = format!("{}{}", self.base_url, path);
        let mut req = self
            .http
            .request(method, &url)
            .header("Content-Type", "application/json; charset=utf-8")
            .header("Authorization", format!("Bearer {token}"));
        if let Some(body) = body {
            req = req.json(body);
        }

        let resp = req.send().await.map_err(|e| SweepError::external(op, e))?;
        if !resp.status().is_success() {
            let status = resp.status();
            let text = resp.text().await.unwrap_or_default();
            return Err(SweepError::external(op, format!("http {status}: {text}")));
        }
        let envelope: Envelope<T> = resp.json().await.map_err(|e| SweepError::external(op, e))?;
        if envelope.code != 0 {
            return Err(SweepError::external(
                op,
                format!("code={} msg={}", envelope.code, envelope.msg),
            ));
        }
        Ok(envelope.data.unwrap_or_default())
    }

    /// App token backing a table reference, following wiki nodes.
    pub async fn resolve_app_token(&self, table: &BitableRef) -> Result<String> {
        if !table.app_token.is_empty() {
            return Ok(table.app_token.clone());
        }
        let path = format!(
            "/open-apis/wiki/v2/spaces/get_node?token={}",
            encode_query_value(&table.wiki_token)
        );
        let data: WikiNode = self
            .call("wiki_get_node", reqwest::Method::GET, &path, None)
            .await?;
        if data.node.obj_type.trim() != "bitable" {
            return Err(SweepError::Lookup(format!(
                "wiki node {} is '{}', not bitable",
                table.wiki_token, data.node.obj_type
            )));
        }
        let token = data.node.obj_token.trim().to_string();
        if token.is_empty() {
            return Err(SweepError::Lookup(format!(
                "wiki node {} has no obj_token",
                table.wiki_token
            )));
        }
        tracing::debug!("📚 Wiki node {} → app {}", table.wiki_token, token);
        Ok(token)
    }
}

fn encode_query_value(raw: &str) -> String {
    reqwest::Url::parse_with_params("http://x/", &[("v", raw)])
        .ok()
        .and_then(|u| u.query().map(|q| q.trim_start_matches("v=").to_string()))
        .unwrap_or_else(|| raw.to_string())
}

fn condition_json(cond: &Condition) -> Value {
    let value = match &cond.value {
        FilterValue::Text(s) => json!([s]),
        FilterValue::ExactDate(ms) => json!(["ExactDate", ms.to_string()]),
    };
    json!({"field_name": cond.field, "operator": "is", "value": value})
}

/// Render a [`Filter`] as a Bitable search filter. `None` when it has no conditions.
pub fn filter_json(filter: &Filter) -> Option<Value> {
    let all: Vec<Value> = filter.all.iter().map(condition_json).collect();
    let any: Vec<Value> = filter.any.iter().map(condition_json).collect();
    match (all.is_empty(), any.is_empty()) {
        (true, true) => None,
        (true, false) => Some(json!({"conjunction": "or", "conditions": any})),
        (false, true) => Some(json!({"conjunction": "and", "conditions": all})),
        (false, false) => Some(json!({
            "conjunction": "and",
            "conditions": all,
            "children": [{"conjunction": "or", "conditions": any}],
        })),
    }
}

/// 0 → default, otherwise clamped to the store maximum.
pub fn clamp_page_size(size: usize) -> usize {
    match size {
        0 => DEFAULT_PAGE_SIZE,
        n => n.min(MAX_PAGE_SIZE),
    }
}

/// Token for the next page, or `None` when the loop must stop. A `has_more`
/// without a continuation token stops too.
fn next_page_token(page: &SearchPage, collected: usize, limit: usize) -> Option<String> {
    if limit > 0 && collected >= limit {
        return None;
    }
    let token = page.page_token.as_deref().unwrap_or("").trim();
    if !page.has_more || token.is_empty() {
        return None;
    }
    Some(token.to_string())
}

struct TableTarget {
    app_token: String,
    table_id: String,
}

/// [`RecordStore`] over three Bitable tables.
pub struct BitableRecordStore {
    client: FeishuClient,
    targets: HashMap<Table, TableTarget>,
}

impl BitableRecordStore {
    /// Authenticate and resolve every table reference.
    pub async fn connect(config: &FeishuConfig) -> Result<Self> {
        let client = FeishuClient::new(config)?;
        let refs = [
            (Table::Task, "TASK_BITABLE_URL", &config.task_table_url),
            (Table::ContentMeta, "CONTENT_BITABLE_URL", &config.content_table_url),
            (Table::WebhookPlan, "WEBHOOK_BITABLE_URL", &config.webhook_table_url),
        ];
        let mut targets = HashMap::new();
        for (table, env_name, raw) in refs {
            if raw.trim().is_empty() {
                return Err(SweepError::Config(format!("{env_name} required")));
            }
            let parsed = BitableRef::parse(raw)?;
            let app_token = client.resolve_app_token(&parsed).await?;
            tracing::info!("📋 {} table → app {} / {}", table, app_token, parsed.table_id);
            targets.insert(
                table,
                TableTarget {
                    app_token,
                    table_id: parsed.table_id,
                },
            );
        }
        Ok(Self { client, targets })
    }

    fn target(&self, table: Table) -> Result<&TableTarget> {
        self.targets
            .get(&table)
            .ok_or_else(|| SweepError::Config(format!("no bitable configured for {table}")))
    }

    fn records_path(target: &TableTarget, suffix: &str) -> String {
        format!(
            "/open-apis/bitable/v1/apps/{}/tables/{}/records{}",
            target.app_token, target.table_id, suffix
        )
    }
}

#[async_trait]
impl RecordStore for BitableRecordStore {
    async fn query(
        &self,
        table: Table,
        filter: &Filter,
        page_size: usize,
        limit: usize,
    ) -> Result<Vec<Record>> {
        let target = self.target(table)?;
        let page_size = clamp_page_size(page_size);
        let body = match filter_json(filter) {
            Some(f) => json!({"filter": f}),
            None => json!({}),
        };

        let mut out: Vec<Record> = Vec::new();
        let mut page_token = String::new();
        let mut pages = 0usize;
        loop {
            let mut suffix = format!("/search?page_size={page_size}");
            if !page_token.is_empty() {
                suffix.push_str("&page_token=");
                suffix.push_str(&encode_query_value(&page_token));
            }
            let page: SearchPage = self
                .client
                .call(
                    "search_records",
                    reqwest::Method::POST,
                    &Self::records_path(target, &suffix),
                    Some(&body),
                )
                .await?;
            pages += 1;
            out.extend(page.items.iter().map(|r| Record {
                record_id: r.record_id.trim().to_string(),
                fields: r.fields.clone(),
            }));
            match next_page_token(&page, out.len(), limit) {
                Some(token) => page_token = token,
                None => break,
            }
        }
        if limit > 0 && out.len() > limit {
            out.truncate(limit);
        }
        tracing::debug!("🔎 {} search: {} records in {} pages", table, out.len(), pages);
        Ok(out)
    }

    async fn batch_create(&self, table: Table, rows: Vec<Fields>) -> Result<Vec<String>> {
        let target = self.target(table)?;
        let mut ids = Vec::with_capacity(rows.len());
        for chunk in rows.chunks(MAX_BATCH_SIZE) {
            let records: Vec<Value> = chunk.iter().map(|f| json!({"fields": f})).collect();
            let created: CreatedRecords = self
                .client
                .call(
                    "batch_create",
                    reqwest::Method::POST,
                    &Self::records_path(target, "/batch_create"),
                    Some(&json!({"records": records})),
                )
                .await?;
            ids.extend(created.records.into_iter().map(|r| r.record_id));
            tracing::info!("➕ Created {} {} records", chunk.len(), table);
        }
        Ok(ids)
    }

    async fn batch_update(&self, table: Table, rows: Vec<Record>) -> Result<()> {
        let target = self.target(table)?;
        for chunk in rows.chunks(MAX_BATCH_SIZE) {
            let records: Vec<Value> = chunk
                .iter()
                .map(|r| json!({"record_id": r.record_id, "fields": r.fields}))
                .collect();
            let _: Value = self
                .client
                .call(
                    "batch_update",
                    reqwest::Method::POST,
                    &Self::records_path(target, "/batch_update"),
                    Some(&json!({"records": records})),
                )
                .await?;
            tracing::info!("✏️ Updated {} {} records", chunk.len(), table);
        }
        Ok(())
    }
}
