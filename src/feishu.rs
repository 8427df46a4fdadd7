//! Feishu (Lark) Bitable destination client.
//!
//! Implements [`TabularStore`] over the Feishu Open API. Every response is
//! an envelope `{code, msg, data}`; a non-zero `code` is an error even when
//! the HTTP status is 200. Requests authenticate with a tenant access token
//! served by a [`TokenCache`] in front of [`FeishuTokenSource`].

use anyhow::{bail, Context, Result};
use async_trait::async_trait;
use serde::de::DeserializeOwned;
use serde::Deserialize;
use serde_json::{json, Map, Value};
use std::sync::Arc;
use std::time::{Duration, Instant};

use chat_digest_core::models::ExportRecord;

use crate::config::FeishuConfig;
use crate::token_cache::TokenCache;
use crate::traits::{
    AccessToken, FieldSpec, FieldType, MediaUpload, TableSchema, TabularStore, TokenSource,
};

// ═══════════════════════════════════════════════════════════════════════
// Export table schema
// ═══════════════════════════════════════════════════════════════════════

pub const FIELD_CONTENT: &str = "Content";
pub const FIELD_TIME: &str = "Time";
pub const FIELD_SENDER: &str = "Sender";
pub const FIELD_SUMMARY: &str = "Summary";
pub const FIELD_MESSAGE_TYPE: &str = "Message Type";
pub const FIELD_CATEGORY: &str = "Category";
pub const FIELD_CHAT: &str = "Chat";
pub const FIELD_DATE: &str = "Date";
pub const FIELD_IMPORTANCE: &str = "Importance";
pub const FIELD_KEYWORDS: &str = "Keywords";
pub const FIELD_ATTACHMENT: &str = "Attachment";

const DEFAULT_VIEW_NAME: &str = "Grid view";

/// The fixed schema of an export table.
pub fn export_table_schema(name: &str) -> TableSchema {
    let field = |name: &str, field_type| FieldSpec {
        name: name.to_string(),
        field_type,
    };
    TableSchema {
        name: name.to_string(),
        default_view_name: DEFAULT_VIEW_NAME.to_string(),
        fields: vec![
            field(FIELD_CONTENT, FieldType::Text),
            field(FIELD_TIME, FieldType::Text),
            field(FIELD_SENDER, FieldType::Text),
            field(FIELD_SUMMARY, FieldType::Text),
            field(FIELD_MESSAGE_TYPE, FieldType::SingleSelect),
            field(FIELD_CATEGORY, FieldType::SingleSelect),
            field(FIELD_CHAT, FieldType::Text),
            field(FIELD_DATE, FieldType::DateTime),
            field(FIELD_IMPORTANCE, FieldType::SingleSelect),
            field(FIELD_KEYWORDS, FieldType::Text),
            field(FIELD_ATTACHMENT, FieldType::Attachment),
        ],
    }
}

/// Row fields for one record, keyed by column name.
///
/// Optional values that are absent are left out rather than sent empty.
pub fn record_fields(record: &ExportRecord) -> Map<String, Value> {
    let mut fields = Map::new();
    fields.insert(FIELD_CONTENT.into(), json!(record.message_content));
    let time = record
        .timestamp
        .instant()
        .map(|t| t.format("%H:%M:%S").to_string())
        .unwrap_or_else(|| "Unknown".to_string());
    fields.insert(FIELD_TIME.into(), json!(time));
    fields.insert(FIELD_SENDER.into(), json!(record.sender));
    if let Some(summary) = &record.summary {
        fields.insert(FIELD_SUMMARY.into(), json!(summary));
    }
    fields.insert(FIELD_MESSAGE_TYPE.into(), json!(record.message_type));
    fields.insert(FIELD_CATEGORY.into(), json!(record.category));
    fields.insert(FIELD_CHAT.into(), json!(record.chat_name));
    if let Some(millis) = date_millis(record) {
        fields.insert(FIELD_DATE.into(), json!(millis));
    }
    fields.insert(FIELD_IMPORTANCE.into(), json!(record.importance.as_str()));
    if let Some(keywords) = &record.keywords {
        fields.insert(FIELD_KEYWORDS.into(), json!(keywords));
    }
    if let Some(token) = &record.attachment_token {
        fields.insert(FIELD_ATTACHMENT.into(), json!([{ "file_token": token }]));
    }
    fields
}

/// Message instant in epoch millis, else midnight UTC of the record's date.
fn date_millis(record: &ExportRecord) -> Option<i64> {
    record.timestamp.epoch_millis().or_else(|| {
        chrono::NaiveDate::parse_from_str(&record.date, "%Y-%m-%d")
            .ok()
            .and_then(|d| d.and_hms_opt(0, 0, 0))
            .map(|dt| dt.and_utc().timestamp_millis())
    })
}

// ═══════════════════════════════════════════════════════════════════════
// Envelope
// ═══════════════════════════════════════════════════════════════════════

#[derive(Debug, Deserialize)]
struct Envelope<T> {
    #[serde(default)]
    code: i64,
    #[serde(default)]
    msg: String,
    data: Option<T>,
}

/// Codes meaning the access token was rejected (invalid or expired).
const TOKEN_REJECTED_CODES: [i64; 2] = [99991663, 99991668];

impl<T> Envelope<T> {
    fn token_rejected(&self) -> bool {
        TOKEN_REJECTED_CODES.contains(&self.code)
    }

    fn into_data(self, what: &str) -> Result<Option<T>> {
        if self.code != 0 {
            bail!("{} failed: code {}: {}", what, self.code, self.msg);
        }
        Ok(self.data)
    }
}

async fn parse_envelope<T: DeserializeOwned>(
    resp: reqwest::Response,
    what: &str,
) -> Result<Envelope<T>> {
    let status = resp.status();
    let body = resp
        .text()
        .await
        .with_context(|| format!("{}: failed to read response", what))?;
    serde_json::from_str(&body)
        .with_context(|| format!("{}: HTTP {} with unexpected body: {}", what, status, body))
}

async fn read_envelope<T: DeserializeOwned>(
    resp: reqwest::Response,
    what: &str,
) -> Result<Option<T>> {
    parse_envelope(resp, what).await?.into_data(what)
}

// ═══════════════════════════════════════════════════════════════════════
// Token source
// ═══════════════════════════════════════════════════════════════════════

#[derive(Debug, Deserialize)]
struct TenantTokenResponse {
    #[serde(default)]
    code: i64,
    #[serde(default)]
    msg: String,
    tenant_access_token: Option<String>,
    expire: Option<u64>,
}

/// Exchanges app id and secret for a tenant access token.
pub struct FeishuTokenSource {
    client: reqwest::Client,
    api_base: String,
    app_id: String,
    app_secret: String,
}

impl FeishuTokenSource {
    pub fn new(client: reqwest::Client, config: &FeishuConfig) -> Result<Self> {
        Ok(Self {
            client,
            api_base: config.api_base.trim_end_matches('/').to_string(),
            app_id: config.app_id.clone(),
            app_secret: config.resolved_app_secret()?,
        })
    }
}

#[async_trait]
impl TokenSource for FeishuTokenSource {
    async fn fetch_token(&self) -> Result<AccessToken> {
        let resp = self
            .client
            .post(format!("{}/auth/v3/tenant_access_token/internal", self.api_base))
            .json(&json!({ "app_id": self.app_id, "app_secret": self.app_secret }))
            .send()
            .await
            .context("Tenant token request failed")?;
        let body: TenantTokenResponse = resp
            .json()
            .await
            .context("Tenant token response was not JSON")?;

        if body.code != 0 {
            bail!("Tenant token request failed: code {}: {}", body.code, body.msg);
        }
        let (Some(token), Some(expire)) = (body.tenant_access_token, body.expire) else {
            bail!("Tenant token response is missing the token or its expiry");
        };
        Ok(AccessToken {
            token,
            expires_at: Instant::now() + Duration::from_secs(expire),
        })
    }
}

// ═══════════════════════════════════════════════════════════════════════
// Client
// ═══════════════════════════════════════════════════════════════════════

pub struct FeishuClient {
    client: reqwest::Client,
    api_base: String,
    web_base: String,
    app_id: String,
    folder_token: String,
    tokens: TokenCache,
}

impl FeishuClient {
    pub fn new(config: &FeishuConfig) -> Result<Self> {
        let client = reqwest::Client::builder()
            .timeout(Duration::from_secs(config.timeout_secs))
            .build()
            .context("Failed to build HTTP client")?;
        let source = FeishuTokenSource::new(client.clone(), config)?;
        Ok(Self::with_token_source(client, config, Arc::new(source)))
    }

    /// Build with an explicit token source.
    pub fn with_token_source(
        client: reqwest::Client,
        config: &FeishuConfig,
        source: Arc<dyn TokenSource>,
    ) -> Self {
        Self {
            client,
            api_base: config.api_base.trim_end_matches('/').to_string(),
            web_base: config.web_base.trim_end_matches('/').to_string(),
            app_id: config.app_id.clone(),
            folder_token: config.folder_token.clone(),
            tokens: TokenCache::new(source),
        }
    }

    /// Acquire a token, proving the credentials work.
    pub async fn check_credentials(&self) -> Result<()> {
        self.tokens.token().await.map(|_| ())
    }

    /// POST a JSON body. A rejected token is refreshed and the call retried once.
    async fn post<T: DeserializeOwned>(&self, path: &str, body: &Value, what: &str) -> Result<Option<T>> {
        let envelope: Envelope<T> = self.send_post(path, body, what).await?;
        if !envelope.token_rejected() {
            return envelope.into_data(what);
        }

        tracing::warn!(code = envelope.code, what, "Access token rejected; refreshing");
        self.tokens.invalidate().await;
        let envelope: Envelope<T> = self.send_post(path, body, what).await?;
        envelope.into_data(what)
    }

    async fn send_post<T: DeserializeOwned>(
        &self,
        path: &str,
        body: &Value,
        what: &str,
    ) -> Result<Envelope<T>> {
        let token = self.tokens.token().await?;
        let resp = self
            .client
            .post(format!("{}{}", self.api_base, path))
            .bearer_auth(token)
            .json(body)
            .send()
            .await
            .with_context(|| format!("{}: request failed", what))?;
        parse_envelope(resp, what).await
    }
}

#[async_trait]
impl TabularStore for FeishuClient {
    async fn create_base(&self, name: &str) -> Result<String> {
        let data: Option<Value> = self
            .post(
                "/bitable/v1/apps",
                &json!({ "name": name, "folder_token": self.folder_token }),
                "Create base",
            )
            .await?;
        data.as_ref()
            .and_then(|d| d.pointer("/app/app_token"))
            .and_then(Value::as_str)
            .map(str::to_string)
            .ok_or_else(|| anyhow::anyhow!("Create base: response has no app_token"))
    }

    async fn create_table(&self, app_token: &str, schema: &TableSchema) -> Result<String> {
        let fields: Vec<Value> = schema
            .fields
            .iter()
            .map(|f| json!({ "field_name": f.name, "type": f.field_type.code() }))
            .collect();
        let body = json!({
            "table": {
                "name": schema.name,
                "default_view_name": schema.default_view_name,
                "fields": fields,
            }
        });
        let data: Option<Value> = self
            .post(&format!("/bitable/v1/apps/{}/tables", app_token), &body, "Create table")
            .await?;
        data.as_ref()
            .and_then(|d| d.get("table_id"))
            .and_then(Value::as_str)
            .map(str::to_string)
            .ok_or_else(|| anyhow::anyhow!("Create table: response has no table_id"))
    }

    async fn batch_insert(
        &self,
        app_token: &str,
        table_id: &str,
        records: &[ExportRecord],
    ) -> Result<usize> {
        let rows: Vec<Value> = records
            .iter()
            .map(|r| json!({ "fields": record_fields(r) }))
            .collect();
        let path = format!(
            "/bitable/v1/apps/{}/tables/{}/records/batch_create",
            app_token, table_id
        );
        let data: Option<Value> = self
            .post(&path, &json!({ "records": rows }), "Insert records")
            .await?;
        let written = data
            .as_ref()
            .and_then(|d| d.get("records"))
            .and_then(Value::as_array)
            .map(Vec::len)
            .unwrap_or(records.len());
        Ok(written)
    }

    async fn upload_media(&self, app_token: &str, upload: MediaUpload) -> Result<String> {
        let token = self.tokens.token().await?;
        let size = upload.bytes.len();
        let part = reqwest::multipart::Part::bytes(upload.bytes)
            .file_name(upload.file_name.clone())
            .mime_str(&upload.content_type)
            .with_context(|| format!("Invalid content type: {}", upload.content_type))?;
        let form = reqwest::multipart::Form::new()
            .text("file_name", upload.file_name.clone())
            .text("parent_type", upload.parent.as_str())
            .text("parent_node", app_token.to_string())
            .text("size", size.to_string())
            .part("file", part);

        let resp = self
            .client
            .post(format!("{}/drive/v1/medias/upload_all", self.api_base))
            .bearer_auth(token)
            .multipart(form)
            .send()
            .await
            .context("Upload media: request failed")?;
        let data: Option<Value> = read_envelope(resp, "Upload media").await?;
        data.as_ref()
            .and_then(|d| d.get("file_token"))
            .and_then(Value::as_str)
            .map(str::to_string)
            .ok_or_else(|| anyhow::anyhow!("Upload media: response has no file_token"))
    }

    fn app_id(&self) -> &str {
        &self.app_id
    }

    async fn get_app_owner(&self, app_id: &str) -> Result<String> {
        let token = self.tokens.token().await?;
        let resp = self
            .client
            .get(format!("{}/application/v6/applications/{}", self.api_base, app_id))
            .query(&[("lang", "zh_cn")])
            .bearer_auth(token)
            .send()
            .await
            .context("Get app owner: request failed")?;
        let data: Option<Value> = read_envelope(resp, "Get app owner").await?;
        data.as_ref()
            .and_then(|d| d.pointer("/app/owner/owner_id"))
            .and_then(Value::as_str)
            .filter(|id| !id.is_empty())
            .map(str::to_string)
            .ok_or_else(|| anyhow::anyhow!("Get app owner: application has no owner"))
    }

    async fn transfer_ownership(&self, app_token: &str, owner_id: &str) -> Result<()> {
        let path = format!(
            "/drive/v1/permissions/{}/members/transfer_owner?type=bitable",
            app_token
        );
        let _: Option<Value> = self
            .post(
                &path,
                &json!({ "member_type": "openid", "member_id": owner_id }),
                "Transfer ownership",
            )
            .await?;
        Ok(())
    }

    fn base_url(&self, app_token: &str) -> String {
        format!("{}/{}", self.web_base, app_token)
    }
}
