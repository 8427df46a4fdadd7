//! Batch export coordination.
//!
//! Moves normalized messages into a new destination table:
//!
//! ```text
//! Created ─▶ per batch: ResolvingAttachments ┐
//!                       Classifying ─────────┴▶ BuildingRecords ─▶ Committing
//!         ─▶ TransferringOwnership ─▶ Completed
//! ```
//!
//! Attachment resolution and classification for a batch run concurrently;
//! both degrade instead of failing. Base creation, table creation and
//! commits are fatal and surface as a [`PipelineError`] naming the stage.
//! A commit failure also names the slices that were already written, since
//! committed rows are not rolled back.

use anyhow::anyhow;
use chrono::NaiveDate;
use serde::Serialize;
use serde_json::Value;
use std::fmt;
use std::sync::Arc;
use std::time::Duration;

use chat_digest_core::batch::{self, Batch};
use chat_digest_core::json_repair::{self, ExtractTarget};
use chat_digest_core::models::{CanonicalMessage, ExportRecord, Importance};
use chat_digest_core::normalize::truncate_chars;

use crate::attachments::{AttachmentResolver, UploadTask};
use crate::cancel::CancelToken;
use crate::config::ExportConfig;
use crate::error::{PipelineError, SliceRange, Stage};
use crate::feishu::export_table_schema;
use crate::ownership::{self, OwnershipOutcome};
use crate::progress::{ExportEvent, ExportProgress, ExportProgressReporter, NoProgress};
use crate::traits::{ChatSource, CompletionClient, CompletionRequest, TabularStore};

pub const DEFAULT_CATEGORY: &str = "General";
pub const DEFAULT_MESSAGE_TYPE: &str = "Text message";
pub const DEFAULT_TABLE_NAME: &str = "Chat log";

/// Content sent to the classifier per message.
const CLASSIFY_CONTENT_CHARS: usize = 500;
const CLASSIFY_MAX_TOKENS: u32 = 8000;
const CLASSIFY_TEMPERATURE: f32 = 0.1;

// ═══════════════════════════════════════════════════════════════════════
// Options and results
// ═══════════════════════════════════════════════════════════════════════

#[derive(Debug, Clone, PartialEq)]
pub struct ExportOptions {
    pub batch_size: usize,
    pub commit_slice: usize,
    pub commit_delay: Duration,
    pub batch_delay: Duration,
    pub attachment_concurrency: usize,
    pub attachment_timeout: Duration,
    pub classify: bool,
    pub transfer_ownership: bool,
}

impl From<&ExportConfig> for ExportOptions {
    fn from(config: &ExportConfig) -> Self {
        Self {
            batch_size: config.batch_size,
            commit_slice: config.commit_slice,
            commit_delay: Duration::from_millis(config.commit_delay_ms),
            batch_delay: Duration::from_millis(config.batch_delay_ms),
            attachment_concurrency: config.attachment_concurrency,
            attachment_timeout: Duration::from_secs(config.attachment_timeout_secs),
            classify: config.classify,
            transfer_ownership: config.transfer_ownership,
        }
    }
}

impl Default for ExportOptions {
    fn default() -> Self {
        Self::from(&ExportConfig::default())
    }
}

/// Names used for the destination.
#[derive(Debug, Clone)]
pub struct ExportRequest {
    /// Written into every row's chat column.
    pub chat_name: String,
    /// Name of the new base.
    pub base_name: String,
    pub table_name: String,
    /// Date column for messages whose time could not be read.
    pub fallback_date: Option<NaiveDate>,
}

impl ExportRequest {
    pub fn new(chat_name: &str, base_name: &str) -> Self {
        Self {
            chat_name: chat_name.to_string(),
            base_name: base_name.to_string(),
            table_name: DEFAULT_TABLE_NAME.to_string(),
            fallback_date: None,
        }
    }

    pub fn with_fallback_date(mut self, date: NaiveDate) -> Self {
        self.fallback_date = Some(date);
        self
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ExportState {
    Created,
    ResolvingAttachments,
    Classifying,
    BuildingRecords,
    Committing,
    TransferringOwnership,
    Completed,
    Failed,
}

impl fmt::Display for ExportState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            ExportState::Created => "created",
            ExportState::ResolvingAttachments => "resolving-attachments",
            ExportState::Classifying => "classifying",
            ExportState::BuildingRecords => "building-records",
            ExportState::Committing => "committing",
            ExportState::TransferringOwnership => "transferring-ownership",
            ExportState::Completed => "completed",
            ExportState::Failed => "failed",
        };
        f.write_str(s)
    }
}

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ExportSummary {
    pub app_token: String,
    pub table_id: String,
    pub url: String,
    pub records_written: usize,
    pub batches: usize,
    pub committed_slices: Vec<SliceRange>,
    pub attachments_uploaded: usize,
    pub attachments_failed: usize,
    /// Batches whose classification fell back to defaults.
    pub classification_fallbacks: usize,
    pub ownership: OwnershipOutcome,
}

// ═══════════════════════════════════════════════════════════════════════
// Classification
// ═══════════════════════════════════════════════════════════════════════

/// Per-message labels from the classifier, or the defaults.
#[derive(Debug, Clone, PartialEq)]
pub struct Classification {
    pub summary: Option<String>,
    pub importance: Importance,
    pub category: String,
    pub message_type: String,
    pub keywords: Option<String>,
}

impl Default for Classification {
    fn default() -> Self {
        Self {
            summary: None,
            importance: Importance::Medium,
            category: DEFAULT_CATEGORY.to_string(),
            message_type: DEFAULT_MESSAGE_TYPE.to_string(),
            keywords: None,
        }
    }
}

impl Classification {
    fn from_value(value: &Value) -> Self {
        let text = |key: &str| {
            value
                .get(key)
                .and_then(Value::as_str)
                .map(str::trim)
                .filter(|s| !s.is_empty())
                .map(str::to_string)
        };
        let keywords = match value.get("keywords") {
            Some(Value::Array(items)) => {
                let words: Vec<&str> = items.iter().filter_map(Value::as_str).collect();
                (!words.is_empty()).then(|| words.join(", "))
            }
            _ => text("keywords"),
        };
        let defaults = Classification::default();
        Self {
            summary: text("summary"),
            importance: text("importance")
                .and_then(|s| Importance::parse_lenient(&s))
                .unwrap_or(defaults.importance),
            category: text("category").unwrap_or(defaults.category),
            message_type: text("messageType").unwrap_or(defaults.message_type),
            keywords,
        }
    }
}

/// Labels for one batch.
#[derive(Debug, Clone)]
pub struct ClassifiedBatch {
    pub labels: Vec<Classification>,
    /// The model was asked but its answer was unusable.
    pub fell_back: bool,
}

impl ClassifiedBatch {
    fn defaults(len: usize, fell_back: bool) -> Self {
        Self {
            labels: vec![Classification::default(); len],
            fell_back,
        }
    }
}

/// One completion call per batch, positional results.
pub struct Classifier {
    client: Option<Arc<dyn CompletionClient>>,
}

impl Classifier {
    pub fn new(client: Option<Arc<dyn CompletionClient>>) -> Self {
        Self { client }
    }

    pub async fn classify_batch(&self, messages: &[CanonicalMessage]) -> ClassifiedBatch {
        let Some(client) = &self.client else {
            return ClassifiedBatch::defaults(messages.len(), false);
        };
        if messages.is_empty() {
            return ClassifiedBatch::defaults(0, false);
        }

        let request = CompletionRequest {
            system: "You label chat messages. Reply with a JSON array only.".to_string(),
            user: classification_prompt(messages),
            temperature: CLASSIFY_TEMPERATURE,
            max_tokens: CLASSIFY_MAX_TOKENS,
        };
        let completion = match client.complete(&request).await {
            Ok(c) => c,
            Err(e) => {
                tracing::warn!(error = %format!("{:#}", e), "Classification request failed; using defaults");
                return ClassifiedBatch::defaults(messages.len(), true);
            }
        };

        let value = match json_repair::extract(
            &completion.text,
            ExtractTarget::Array,
            completion.finish_reason.as_deref(),
        ) {
            Ok(extraction) => extraction.value,
            Err(e) => {
                tracing::warn!(error = %e, "Classification response unparseable; using defaults");
                return ClassifiedBatch::defaults(messages.len(), true);
            }
        };

        match as_label_array(&value) {
            Some(items) if items.len() == messages.len() => ClassifiedBatch {
                labels: items.iter().map(Classification::from_value).collect(),
                fell_back: false,
            },
            Some(items) => {
                tracing::warn!(
                    expected = messages.len(),
                    got = items.len(),
                    "Classification length mismatch; using defaults"
                );
                ClassifiedBatch::defaults(messages.len(), true)
            }
            None => {
                tracing::warn!("Classification response is not an array; using defaults");
                ClassifiedBatch::defaults(messages.len(), true)
            }
        }
    }
}

/// The array itself, or the first array inside a wrapping object.
fn as_label_array(value: &Value) -> Option<&Vec<Value>> {
    match value {
        Value::Array(items) => Some(items),
        Value::Object(map) => map.values().find_map(Value::as_array),
        _ => None,
    }
}

pub fn classification_prompt(messages: &[CanonicalMessage]) -> String {
    let listing: Vec<String> = messages
        .iter()
        .enumerate()
        .map(|(i, m)| {
            format!(
                "[Message {}] Sender: {}\nContent: {}",
                i + 1,
                m.sender_display_name,
                truncate_chars(&m.content, CLASSIFY_CONTENT_CHARS)
            )
        })
        .collect();

    format!(
        "Analyze the following {n} chat messages and return one JSON result per message.\n\n\
         For each message:\n\
         1. summary: a short summary, only if the message is longer than 50 characters\n\
         2. importance: high, medium or low\n\
         3. messageType: e.g. question, information sharing, decision, small talk, announcement\n\
         4. category: a one or two word topic category\n\
         5. keywords: at most 3, comma separated\n\n\
         Return a JSON array with exactly {n} elements in message order:\n\
         [{{\"summary\": \"\", \"importance\": \"medium\", \"messageType\": \"\", \"category\": \"\", \"keywords\": \"\"}}]\n\n\
         Messages:\n{listing}",
        n = messages.len(),
        listing = listing.join("\n\n"),
    )
}

// ═══════════════════════════════════════════════════════════════════════
// Coordinator
// ═══════════════════════════════════════════════════════════════════════

pub struct ExportCoordinator {
    store: Arc<dyn TabularStore>,
    attachments: AttachmentResolver,
    classifier: Classifier,
    options: ExportOptions,
    reporter: Arc<dyn ExportProgressReporter>,
}

impl ExportCoordinator {
    /// `completion` is only used when `options.classify` is set.
    pub fn new(
        source: Arc<dyn ChatSource>,
        store: Arc<dyn TabularStore>,
        completion: Option<Arc<dyn CompletionClient>>,
        options: ExportOptions,
    ) -> Self {
        let attachments = AttachmentResolver::new(
            source,
            store.clone(),
            options.attachment_timeout,
            options.attachment_concurrency,
        );
        let classifier = Classifier::new(completion.filter(|_| options.classify));
        Self {
            store,
            attachments,
            classifier,
            options,
            reporter: Arc::new(NoProgress),
        }
    }

    pub fn with_reporter(mut self, reporter: Arc<dyn ExportProgressReporter>) -> Self {
        self.reporter = reporter;
        self
    }

    /// Export `messages` into a new base and table.
    pub async fn run(
        &self,
        messages: Vec<CanonicalMessage>,
        request: &ExportRequest,
        cancel: &CancelToken,
    ) -> Result<ExportSummary, PipelineError> {
        let result = self.run_batches(messages, request, cancel).await;
        if let Err(e) = &result {
            tracing::error!(state = %ExportState::Failed, error = %e, "Export failed");
        }
        result
    }

    async fn run_batches(
        &self,
        messages: Vec<CanonicalMessage>,
        request: &ExportRequest,
        cancel: &CancelToken,
    ) -> Result<ExportSummary, PipelineError> {
        let mut state = ExportState::Created;
        log_state(&mut state, ExportState::Created);
        if cancel.is_cancelled() {
            return Err(PipelineError::cancelled());
        }

        self.reporter.report(ExportEvent::Preparing {
            chat: request.chat_name.clone(),
        });
        let app_token = self
            .store
            .create_base(&request.base_name)
            .await
            .map_err(|e| PipelineError::new(Stage::CreateBase, e))?;
        let table_id = self
            .store
            .create_table(&app_token, &export_table_schema(&request.table_name))
            .await
            .map_err(|e| PipelineError::new(Stage::CreateTable, e))?;
        tracing::info!(%app_token, %table_id, "Created destination table");

        let total_messages = messages.len();
        let batches = batch::partition(messages, self.options.batch_size);
        let total_batches = batches.len();

        let mut committed: Vec<SliceRange> = Vec::new();
        let mut attachments_uploaded = 0;
        let mut attachments_failed = 0;
        let mut classification_fallbacks = 0;

        for batch in &batches {
            if cancel.is_cancelled() {
                return Err(cancelled_at(batch, &committed));
            }

            let tasks = UploadTask::for_batch(&batch.items);
            log_state(&mut state, ExportState::ResolvingAttachments);
            log_state(&mut state, ExportState::Classifying);
            let labelled = async {
                tokio::join!(
                    self.attachments.resolve_all(&tasks, &app_token, cancel),
                    self.classifier.classify_batch(&batch.items),
                )
            };
            let (resolved, classified) = tokio::select! {
                pair = labelled => pair,
                _ = cancel.cancelled() => return Err(cancelled_at(batch, &committed)),
            };
            if resolved.cancelled {
                return Err(cancelled_at(batch, &committed));
            }
            attachments_uploaded += resolved.uploaded();
            attachments_failed += resolved.failed();
            if classified.fell_back {
                classification_fallbacks += 1;
                tracing::warn!(batch = batch.index + 1, "Batch exported with default labels");
            }

            log_state(&mut state, ExportState::BuildingRecords);
            let records: Vec<ExportRecord> = batch
                .items
                .iter()
                .zip(classified.labels)
                .enumerate()
                .map(|(i, (message, label))| {
                    build_record(
                        message,
                        label,
                        &request.chat_name,
                        request.fallback_date,
                        resolved.token_for(i),
                    )
                })
                .collect();

            log_state(&mut state, ExportState::Committing);
            let slice_size = self.options.commit_slice.clamp(1, batch::MAX_BATCH_SIZE);
            for (slice_index, slice) in records.chunks(slice_size).enumerate() {
                if slice_index > 0 {
                    tokio::time::sleep(self.options.commit_delay).await;
                }
                let written = self
                    .store
                    .batch_insert(&app_token, &table_id, slice)
                    .await
                    .map_err(|e| {
                        PipelineError::new(
                            Stage::Commit {
                                committed: committed.clone(),
                            },
                            e,
                        )
                    })?;
                let start = batch.offset + slice_index * slice_size;
                let range = SliceRange {
                    batch_index: batch.index,
                    start,
                    end: start + written.min(slice.len()),
                };
                if !range.is_empty() {
                    committed.push(range);
                }
                if written < slice.len() {
                    return Err(PipelineError::new(
                        Stage::Commit {
                            committed: committed.clone(),
                        },
                        anyhow!(
                            "destination acknowledged {} of {} rows in batch {}",
                            written,
                            slice.len(),
                            batch.index + 1
                        ),
                    ));
                }
            }

            let messages_so_far = batch.offset + batch.len();
            tracing::info!(
                batch = batch.index + 1,
                total_batches,
                messages_so_far,
                total_messages,
                "Batch committed"
            );
            self.reporter.report(ExportEvent::Batch(ExportProgress {
                batch_index: batch.index,
                total_batches,
                messages_so_far,
                total_messages,
            }));

            if batch.index + 1 < total_batches {
                tokio::time::sleep(self.options.batch_delay).await;
            }
        }

        let records_written = committed.iter().map(SliceRange::len).sum();

        log_state(&mut state, ExportState::TransferringOwnership);
        let ownership = if self.options.transfer_ownership {
            ownership::transfer_to_app_owner(self.store.as_ref(), &app_token).await
        } else {
            OwnershipOutcome::Skipped
        };

        log_state(&mut state, ExportState::Completed);
        self.reporter.report(ExportEvent::Finished {
            chat: request.chat_name.clone(),
            records: records_written,
        });

        Ok(ExportSummary {
            url: self.store.base_url(&app_token),
            app_token,
            table_id,
            records_written,
            batches: total_batches,
            committed_slices: committed,
            attachments_uploaded,
            attachments_failed,
            classification_fallbacks,
            ownership,
        })
    }
}

fn log_state(state: &mut ExportState, next: ExportState) {
    tracing::debug!(from = %state, to = %next, "Export state");
    *state = next;
}

fn cancelled_at(batch: &Batch<CanonicalMessage>, committed: &[SliceRange]) -> PipelineError {
    let rows: usize = committed.iter().map(SliceRange::len).sum();
    PipelineError::new(
        Stage::Cancelled,
        anyhow!(
            "cancelled at batch {}; {} row(s) already committed",
            batch.index + 1,
            rows
        ),
    )
}

/// One destination row from a message and its labels. Messages without a
/// readable time take `fallback_date` for the date column.
pub fn build_record(
    message: &CanonicalMessage,
    label: Classification,
    chat_name: &str,
    fallback_date: Option<NaiveDate>,
    attachment_token: Option<String>,
) -> ExportRecord {
    ExportRecord {
        message_content: message.content.clone(),
        timestamp: message.timestamp,
        sender: message.sender_display_name.clone(),
        summary: label.summary,
        message_type: label.message_type,
        category: label.category,
        chat_name: chat_name.to_string(),
        date: message
            .timestamp
            .date()
            .or(fallback_date)
            .map(|d| d.format("%Y-%m-%d").to_string())
            .unwrap_or_default(),
        importance: label.importance,
        keywords: label.keywords,
        attachment_token,
    }
}
