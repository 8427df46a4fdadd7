//! Chat-log HTTP reader.
//!
//! Talks to a local chatlog server:
//!
//! | Call | Endpoint |
//! |------|----------|
//! | messages for a day | `GET /api/v1/chatlog?talker=&time=YYYY-MM-DD&limit=1000&format=json` |
//! | media bytes | `GET /image/{ref}`, `GET /video/{ref}` |
//! | group chats | `GET /api/v1/chatroom?format=json` |
//! | connectivity | `GET /api/v1/session?limit=1&format=json` |
//!
//! The chatlog and chatroom endpoints answer with a bare array, or an object
//! carrying the array under `items` or `data`.

use anyhow::{bail, Context, Result};
use async_trait::async_trait;
use chrono::NaiveDate;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::time::Duration;

use chat_digest_core::models::{MediaKind, RawMessage};

use crate::config::ChatlogConfig;
use crate::traits::{ChatSource, MediaPayload};

/// Most messages requested per subject per day.
const DAY_LIMIT: u32 = 1000;

pub struct ChatlogClient {
    client: reqwest::Client,
    base_url: String,
}

impl ChatlogClient {
    pub fn new(config: &ChatlogConfig) -> Result<Self> {
        let client = reqwest::Client::builder()
            .timeout(Duration::from_secs(config.timeout_secs))
            .build()
            .context("Failed to build HTTP client")?;
        Ok(Self {
            client,
            base_url: config.base_url.trim_end_matches('/').to_string(),
        })
    }

    /// Group chats known to the server, usable as a `talker` subject.
    pub async fn list_chatrooms(&self) -> Result<Vec<ChatTarget>> {
        let resp = self
            .client
            .get(format!("{}/api/v1/chatroom", self.base_url))
            .query(&[("format", "json")])
            .send()
            .await
            .with_context(|| format!("Failed to list chat rooms at {}", self.base_url))?;

        let status = resp.status();
        if !status.is_success() {
            let body = resp.text().await.unwrap_or_default();
            bail!("Chat room API error {}: {}", status, body);
        }

        let json: Value = resp.json().await.context("Chat room response was not JSON")?;
        parse_chatroom_list(json)
    }

    /// True when the server answers the session listing with 200.
    pub async fn check_connection(&self) -> Result<()> {
        let resp = self
            .client
            .get(format!("{}/api/v1/session", self.base_url))
            .query(&[("limit", "1"), ("format", "json")])
            .send()
            .await
            .with_context(|| format!("Chat log server unreachable at {}", self.base_url))?;
        if !resp.status().is_success() {
            bail!("Chat log server returned {}", resp.status());
        }
        Ok(())
    }
}

#[async_trait]
impl ChatSource for ChatlogClient {
    async fn fetch_messages(&self, subject_id: &str, date: NaiveDate) -> Result<Vec<RawMessage>> {
        let day = date.format("%Y-%m-%d").to_string();
        let limit = DAY_LIMIT.to_string();
        let resp = self
            .client
            .get(format!("{}/api/v1/chatlog", self.base_url))
            .query(&[
                ("talker", subject_id),
                ("time", day.as_str()),
                ("limit", limit.as_str()),
                ("format", "json"),
            ])
            .send()
            .await
            .with_context(|| format!("Failed to fetch chat log for {} on {}", subject_id, day))?;

        let status = resp.status();
        if !status.is_success() {
            let body = resp.text().await.unwrap_or_default();
            bail!("Chat log API error {}: {}", status, body);
        }

        let json: Value = resp.json().await.context("Chat log response was not JSON")?;
        parse_message_list(json)
    }

    async fn fetch_media(&self, kind: MediaKind, media_ref: &str) -> Result<MediaPayload> {
        let url = format!("{}/{}/{}", self.base_url, kind.as_str(), media_ref);
        let resp = self
            .client
            .get(&url)
            .send()
            .await
            .with_context(|| format!("Failed to download {}", url))?;

        let status = resp.status();
        if !status.is_success() {
            bail!("Media download {} returned {}", url, status);
        }

        let content_type = resp
            .headers()
            .get(reqwest::header::CONTENT_TYPE)
            .and_then(|v| v.to_str().ok())
            .map(str::to_string);
        let bytes = resp.bytes().await.context("Failed to read media body")?;

        Ok(MediaPayload {
            bytes: bytes.to_vec(),
            content_type,
        })
    }
}

/// A chat that can be digested or exported.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ChatTarget {
    /// Identifier passed as the subject, e.g. `12345678@chatroom`.
    pub id: String,
    pub display_name: String,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct RawChatroom {
    #[serde(default)]
    name: String,
    #[serde(default)]
    nick_name: Option<String>,
    #[serde(default)]
    remark: Option<String>,
    #[serde(default)]
    users: Vec<Value>,
}

/// Rooms without a name, or that look like neither a group nor a labelled
/// chat, are dropped.
pub fn parse_chatroom_list(json: Value) -> Result<Vec<ChatTarget>> {
    let rooms = unwrap_list(json, "chat room")?
        .into_iter()
        .filter_map(|v| serde_json::from_value::<RawChatroom>(v).ok())
        .filter_map(|room| {
            let label = room
                .nick_name
                .filter(|s| !s.trim().is_empty())
                .or(room.remark.filter(|s| !s.trim().is_empty()));
            let is_group = room.name.contains("@chatroom") || room.users.len() > 2;
            if room.name.is_empty() || (label.is_none() && !is_group) {
                return None;
            }
            Some(ChatTarget {
                display_name: label.unwrap_or_else(|| room.name.clone()),
                id: room.name,
            })
        })
        .collect();
    Ok(rooms)
}

fn unwrap_list(json: Value, what: &str) -> Result<Vec<Value>> {
    Ok(match json {
        Value::Array(items) => items,
        Value::Object(mut map) => match map.remove("items").or_else(|| map.remove("data")) {
            Some(Value::Array(items)) => items,
            Some(Value::Null) | None => Vec::new(),
            Some(other) => bail!("Unexpected {} payload: {}", what, other),
        },
        Value::Null => Vec::new(),
        other => bail!("Unexpected {} payload: {}", what, other),
    })
}

/// Accept a bare array, `{items: [...]}` or `{data: [...]}`.
///
/// Entries that do not deserialize as a message are skipped.
pub fn parse_message_list(json: Value) -> Result<Vec<RawMessage>> {
    let list = unwrap_list(json, "chat log")?;

    let total = list.len();
    let messages: Vec<RawMessage> = list
        .into_iter()
        .filter_map(|v| serde_json::from_value(v).ok())
        .collect();
    if messages.len() < total {
        tracing::warn!(
            skipped = total - messages.len(),
            "Skipped chat log entries that were not messages"
        );
    }
    Ok(messages)
}

/// Fetch every day in `from..=to`. Days that fail are logged and skipped.
pub async fn fetch_range(
    source: &dyn ChatSource,
    subject_id: &str,
    from: NaiveDate,
    to: NaiveDate,
) -> Result<Vec<RawMessage>> {
    if to < from {
        bail!("Date range is empty: {} is after {}", from, to);
    }

    let mut all = Vec::new();
    let mut failed_days = 0usize;
    for day in from.iter_days().take_while(|d| *d <= to) {
        match source.fetch_messages(subject_id, day).await {
            Ok(mut messages) => {
                tracing::info!(date = %day, count = messages.len(), "Fetched messages");
                all.append(&mut messages);
            }
            Err(e) => {
                failed_days += 1;
                tracing::warn!(date = %day, error = %e, "Skipping day that failed to load");
            }
        }
    }

    let days = (to - from).num_days() as usize + 1;
    if failed_days == days {
        bail!("Failed to fetch messages for every day in {}..={}", from, to);
    }
    Ok(all)
}
