//! Attachment resolution: download from the chat source, upload to the
//! destination store, hand back a file token.
//!
//! Failures never escape. A failed, empty, or timed-out attachment resolves
//! to `None`, and the row is still exported without it.

use anyhow::{bail, Result};
use futures::stream::{self, StreamExt};
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use chat_digest_core::models::{CanonicalMessage, MediaKind};

use crate::cancel::CancelToken;
use crate::traits::{ChatSource, MediaUpload, TabularStore, UploadParent};

/// One media item to move into the destination.
#[derive(Debug, Clone, PartialEq)]
pub struct UploadTask {
    /// Position of the message within its batch.
    pub task_id: usize,
    pub message_id: String,
    pub media_kind: MediaKind,
    pub source_ref: String,
}

impl UploadTask {
    /// Upload tasks for every message in a batch that carries media.
    pub fn for_batch(messages: &[CanonicalMessage]) -> Vec<UploadTask> {
        messages
            .iter()
            .enumerate()
            .filter_map(|(i, m)| {
                let kind = m.kind.media_kind()?;
                let source_ref = m.media_ref.as_ref().filter(|r| !r.is_empty())?;
                Some(UploadTask {
                    task_id: i,
                    message_id: m.id.clone(),
                    media_kind: kind,
                    source_ref: source_ref.clone(),
                })
            })
            .collect()
    }
}

/// Results of one batch, keyed by task id.
#[derive(Debug, Default)]
pub struct ResolvedAttachments {
    pub tokens: HashMap<usize, Option<String>>,
    /// The run was cancelled while uploads were in flight.
    pub cancelled: bool,
}

impl ResolvedAttachments {
    pub fn token_for(&self, task_id: usize) -> Option<String> {
        self.tokens.get(&task_id).cloned().flatten()
    }

    pub fn uploaded(&self) -> usize {
        self.tokens.values().filter(|t| t.is_some()).count()
    }

    pub fn failed(&self) -> usize {
        self.tokens.values().filter(|t| t.is_none()).count()
    }
}

pub struct AttachmentResolver {
    source: Arc<dyn ChatSource>,
    store: Arc<dyn TabularStore>,
    timeout: Duration,
    concurrency: usize,
}

impl AttachmentResolver {
    pub fn new(
        source: Arc<dyn ChatSource>,
        store: Arc<dyn TabularStore>,
        timeout: Duration,
        concurrency: usize,
    ) -> Self {
        Self {
            source,
            store,
            timeout,
            concurrency: concurrency.max(1),
        }
    }

    /// Resolve a single task. `None` on any failure.
    pub async fn resolve(&self, task: &UploadTask, app_token: &str) -> Option<String> {
        match tokio::time::timeout(self.timeout, self.try_resolve(task, app_token)).await {
            Ok(Ok(token)) => {
                tracing::debug!(message_id = %task.message_id, "Attachment uploaded");
                Some(token)
            }
            Ok(Err(e)) => {
                tracing::warn!(
                    message_id = %task.message_id,
                    kind = task.media_kind.as_str(),
                    error = %format!("{:#}", e),
                    "Attachment skipped"
                );
                None
            }
            Err(_) => {
                tracing::warn!(
                    message_id = %task.message_id,
                    timeout_secs = self.timeout.as_secs(),
                    "Attachment timed out"
                );
                None
            }
        }
    }

    async fn try_resolve(&self, task: &UploadTask, app_token: &str) -> Result<String> {
        let payload = self
            .source
            .fetch_media(task.media_kind, &task.source_ref)
            .await?;
        if payload.bytes.is_empty() {
            bail!("downloaded media is empty");
        }

        let (content_type, ext) = media_type(task.media_kind, payload.content_type.as_deref());
        let upload = MediaUpload {
            file_name: file_name(task, ext),
            content_type,
            parent: UploadParent::for_media(task.media_kind),
            bytes: payload.bytes,
        };
        self.store.upload_media(app_token, upload).await
    }

    /// Resolve a batch of tasks with bounded parallelism.
    ///
    /// Stops early if `cancel` fires; unfinished tasks are left out of the
    /// map and `cancelled` is set.
    pub async fn resolve_all(
        &self,
        tasks: &[UploadTask],
        app_token: &str,
        cancel: &CancelToken,
    ) -> ResolvedAttachments {
        if tasks.is_empty() {
            return ResolvedAttachments::default();
        }

        let work = stream::iter(tasks)
            .map(|task| async move { (task.task_id, self.resolve(task, app_token).await) })
            .buffer_unordered(self.concurrency)
            .collect::<Vec<_>>();

        tokio::select! {
            results = work => ResolvedAttachments {
                tokens: results.into_iter().collect(),
                cancelled: false,
            },
            _ = cancel.cancelled() => {
                tracing::warn!(pending = tasks.len(), "Attachment uploads cancelled");
                ResolvedAttachments {
                    tokens: HashMap::new(),
                    cancelled: true,
                }
            }
        }
    }
}

/// MIME type and file extension, from the declared type or the media kind.
pub fn media_type(kind: MediaKind, declared: Option<&str>) -> (String, &'static str) {
    let declared = declared
        .and_then(|ct| ct.split(';').next())
        .map(|ct| ct.trim().to_ascii_lowercase());

    let known = declared.as_deref().and_then(|ct| {
        let ext = match ct {
            "image/jpeg" | "image/jpg" => "jpg",
            "image/png" => "png",
            "image/gif" => "gif",
            "image/webp" => "webp",
            "video/mp4" => "mp4",
            "video/quicktime" => "mov",
            "video/webm" => "webm",
            _ => return None,
        };
        Some((ct.to_string(), ext))
    });

    known.unwrap_or_else(|| match kind {
        MediaKind::Image => ("image/jpeg".to_string(), "jpg"),
        MediaKind::Video => ("video/mp4".to_string(), "mp4"),
    })
}

fn file_name(task: &UploadTask, ext: &str) -> String {
    let id: String = task
        .message_id
        .chars()
        .filter(|c| c.is_ascii_alphanumeric() || matches!(c, '-' | '_'))
        .collect();
    format!("{}_{}.{}", task.media_kind.as_str(), id, ext)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn media_type_inference() {
        assert_eq!(
            media_type(MediaKind::Image, Some("image/png; charset=binary")),
            ("image/png".to_string(), "png")
        );
        assert_eq!(
            media_type(MediaKind::Image, Some("application/octet-stream")),
            ("image/jpeg".to_string(), "jpg")
        );
        assert_eq!(media_type(MediaKind::Video, None), ("video/mp4".to_string(), "mp4"));
    }

    #[test]
    fn file_name_is_sanitized() {
        let task = UploadTask {
            task_id: 0,
            message_id: "12/34:56".into(),
            media_kind: MediaKind::Video,
            source_ref: "abc".into(),
        };
        assert_eq!(file_name(&task, "mp4"), "video_123456.mp4");
    }
}
