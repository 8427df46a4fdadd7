//! Collaborator traits.
//!
//! The pipeline talks to three external systems (the chat source, the
//! completion API, and the tabular destination store) only through the
//! traits in this module. Concrete HTTP clients live in [`crate::chatlog`],
//! [`crate::completion`], and [`crate::feishu`]; tests substitute in-memory
//! fakes.
//!
//! ```text
//! ┌────────────┐    ┌──────────────────┐    ┌──────────────┐
//! │ ChatSource │──▶ │ DigestSynthesizer│◀──▶│ Completion   │
//! │            │    │ ExportCoordinator│    │ Client       │
//! └────────────┘    └────────┬─────────┘    └──────────────┘
//!                            ▼
//!                     ┌──────────────┐      ┌─────────────┐
//!                     │ TabularStore │◀─────│ TokenSource │
//!                     └──────────────┘      └─────────────┘
//! ```

use anyhow::Result;
use async_trait::async_trait;
use chrono::NaiveDate;
use std::time::Instant;

use chat_digest_core::models::{ExportRecord, MediaKind, RawMessage};

// ═══════════════════════════════════════════════════════════════════════
// Chat Source
// ═══════════════════════════════════════════════════════════════════════

/// Downloaded media bytes plus the declared content type, if any.
#[derive(Debug, Clone, PartialEq)]
pub struct MediaPayload {
    pub bytes: Vec<u8>,
    pub content_type: Option<String>,
}

/// Read access to the raw chat log.
#[async_trait]
pub trait ChatSource: Send + Sync {
    /// Raw messages for one subject (group or contact) on one day.
    async fn fetch_messages(&self, subject_id: &str, date: NaiveDate) -> Result<Vec<RawMessage>>;

    /// Binary media referenced by a message.
    async fn fetch_media(&self, kind: MediaKind, media_ref: &str) -> Result<MediaPayload>;
}

// ═══════════════════════════════════════════════════════════════════════
// Completion Client
// ═══════════════════════════════════════════════════════════════════════

#[derive(Debug, Clone, PartialEq)]
pub struct CompletionRequest {
    pub system: String,
    pub user: String,
    pub temperature: f32,
    pub max_tokens: u32,
}

#[derive(Debug, Clone, PartialEq)]
pub struct Completion {
    pub text: String,
    /// `stop`, `length`, ... as reported by the API.
    pub finish_reason: Option<String>,
}

impl Completion {
    /// The model stopped at the output token budget.
    pub fn is_truncated(&self) -> bool {
        self.finish_reason.as_deref() == Some("length")
    }
}

/// A chat-completions style LLM endpoint.
#[async_trait]
pub trait CompletionClient: Send + Sync {
    /// Model identifier, for logs.
    fn model_name(&self) -> &str;

    async fn complete(&self, request: &CompletionRequest) -> Result<Completion>;
}

// ═══════════════════════════════════════════════════════════════════════
// Tabular Store
// ═══════════════════════════════════════════════════════════════════════

/// Destination column types, with the store's numeric codes.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FieldType {
    Text,
    SingleSelect,
    DateTime,
    Attachment,
}

impl FieldType {
    pub fn code(&self) -> u32 {
        match self {
            FieldType::Text => 1,
            FieldType::SingleSelect => 3,
            FieldType::DateTime => 5,
            FieldType::Attachment => 17,
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct FieldSpec {
    pub name: String,
    pub field_type: FieldType,
}

#[derive(Debug, Clone, PartialEq)]
pub struct TableSchema {
    pub name: String,
    pub default_view_name: String,
    pub fields: Vec<FieldSpec>,
}

/// Where an uploaded file is attached in the destination.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum UploadParent {
    Image,
    File,
}

impl UploadParent {
    pub fn for_media(kind: MediaKind) -> Self {
        match kind {
            MediaKind::Image => UploadParent::Image,
            MediaKind::Video => UploadParent::File,
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            UploadParent::Image => "bitable_image",
            UploadParent::File => "bitable_file",
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct MediaUpload {
    pub file_name: String,
    pub content_type: String,
    pub parent: UploadParent,
    pub bytes: Vec<u8>,
}

/// The collaborative spreadsheet-like store rows are exported to.
#[async_trait]
pub trait TabularStore: Send + Sync {
    /// Create a new base (workbook). Returns its app token.
    async fn create_base(&self, name: &str) -> Result<String>;

    /// Create a table in a base. Returns the table id.
    async fn create_table(&self, app_token: &str, schema: &TableSchema) -> Result<String>;

    /// Insert rows in order. Returns the number of rows written.
    async fn batch_insert(
        &self,
        app_token: &str,
        table_id: &str,
        records: &[ExportRecord],
    ) -> Result<usize>;

    /// Upload a file into a base. Returns the file token.
    async fn upload_media(&self, app_token: &str, upload: MediaUpload) -> Result<String>;

    /// Identifier of the application acting on the store.
    fn app_id(&self) -> &str;

    /// Owner (user id) of an application.
    async fn get_app_owner(&self, app_id: &str) -> Result<String>;

    /// Make `owner_id` the owner of the base.
    async fn transfer_ownership(&self, app_token: &str, owner_id: &str) -> Result<()>;

    /// Browser URL of a base.
    fn base_url(&self, app_token: &str) -> String;
}

// ═══════════════════════════════════════════════════════════════════════
// Token Source
// ═══════════════════════════════════════════════════════════════════════

#[derive(Debug, Clone, PartialEq)]
pub struct AccessToken {
    pub token: String,
    pub expires_at: Instant,
}

/// Exchanges application credentials for a short-lived access token.
#[async_trait]
pub trait TokenSource: Send + Sync {
    async fn fetch_token(&self) -> Result<AccessToken>;
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn upload_parent_per_media_kind() {
        assert_eq!(UploadParent::for_media(MediaKind::Image).as_str(), "bitable_image");
        assert_eq!(UploadParent::for_media(MediaKind::Video).as_str(), "bitable_file");
    }

    #[test]
    fn truncation_flag() {
        let c = Completion {
            text: String::new(),
            finish_reason: Some("length".into()),
        };
        assert!(c.is_truncated());
        assert_eq!(FieldType::Attachment.code(), 17);
    }
}
