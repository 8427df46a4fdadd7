//! Message normalization.
//!
//! Converts heterogeneous chat-log records into [`CanonicalMessage`]s:
//! unsupported kinds are dropped, the timestamp is resolved from whichever
//! time field the record carries, a human-friendly sender name is derived,
//! and display content is rendered per kind.
//!
//! Normalization is a pure transform. A record that cannot be normalized is
//! skipped; it never aborts the batch.

use chrono::{DateTime, FixedOffset, NaiveDateTime, Offset, TimeZone, Utc};
use serde_json::Value;
use sha2::{Digest, Sha256};

use crate::models::{CanonicalMessage, MessageKind, MessageTime, RawMessage};

/// Maximum length of display content, in characters.
pub const MAX_CONTENT_CHARS: usize = 1000;

/// Epoch values above this are treated as milliseconds.
const EPOCH_MILLIS_THRESHOLD: i64 = 100_000_000_000;

/// Label used when the sender id is actually a group-room id.
pub const GROUP_SENDER_LABEL: &str = "Group chat";

/// Content marker of "nudge" system lines ("X patted Y").
const NUDGE_MARKER: &str = "拍了拍";

/// Converts raw chat-log records into canonical messages.
#[derive(Debug, Clone)]
pub struct Normalizer {
    /// Offset applied to epoch timestamps and zone-less time strings.
    offset: FixedOffset,
    /// Drop "nudge" system lines.
    drop_nudges: bool,
}

impl Default for Normalizer {
    fn default() -> Self {
        Self {
            offset: Utc.fix(),
            drop_nudges: true,
        }
    }
}

impl Normalizer {
    pub fn new(offset: FixedOffset) -> Self {
        Self {
            offset,
            drop_nudges: true,
        }
    }

    /// Build a normalizer from an offset in minutes east of UTC.
    /// Out-of-range offsets fall back to UTC.
    pub fn with_offset_minutes(minutes: i32) -> Self {
        let offset = FixedOffset::east_opt(minutes * 60)
            .unwrap_or_else(|| Utc.fix());
        Self::new(offset)
    }

    pub fn keep_nudges(mut self) -> Self {
        self.drop_nudges = false;
        self
    }

    /// Normalize a list of raw records, preserving input order.
    pub fn normalize(&self, raw: &[RawMessage]) -> Vec<CanonicalMessage> {
        raw.iter()
            .enumerate()
            .filter_map(|(i, r)| self.normalize_one(r, i))
            .collect()
    }

    /// Normalize one record. Returns `None` for unsupported or empty records.
    pub fn normalize_one(&self, raw: &RawMessage, position: usize) -> Option<CanonicalMessage> {
        let kind = raw.kind.map(MessageKind::from_code)?;
        if !kind.is_supported() {
            return None;
        }
        if kind == MessageKind::Link && !has_link_payload(raw) {
            return None;
        }

        let content = display_content(raw, kind);
        if self.drop_nudges && content.contains(NUDGE_MARKER) {
            return None;
        }

        let raw_sender_id = raw.raw_sender().unwrap_or("Unknown").to_string();
        let sender_display_name = match raw.sender_name.as_deref().map(str::trim) {
            Some(name) if !name.is_empty() => name.to_string(),
            _ => friendly_sender_name(&raw_sender_id),
        };

        let media_ref = kind.media_kind().and_then(|_| media_reference(raw));

        Some(CanonicalMessage {
            id: raw.identifier(position),
            sender_display_name,
            raw_sender_id,
            content,
            media_ref,
            kind,
            timestamp: self.resolve_time(raw),
        })
    }

    /// Resolve the message time from the first usable field.
    ///
    /// Order: structured `time`, then numeric `timestamp` (seconds, or
    /// milliseconds when the value is too large to be seconds), then a
    /// string `timestamp`. Anything else is [`MessageTime::Unknown`].
    pub fn resolve_time(&self, raw: &RawMessage) -> MessageTime {
        if let Some(t) = raw.time.as_deref().and_then(|s| self.parse_time_str(s)) {
            return MessageTime::At(t);
        }
        let parsed = match &raw.timestamp {
            Some(Value::Number(n)) => n
                .as_i64()
                .or_else(|| n.as_f64().map(|f| f as i64))
                .and_then(|epoch| self.from_epoch(epoch)),
            Some(Value::String(s)) => match s.trim().parse::<i64>() {
                Ok(epoch) => self.from_epoch(epoch),
                Err(_) => self.parse_time_str(s),
            },
            _ => None,
        };
        parsed.map(MessageTime::At).unwrap_or(MessageTime::Unknown)
    }

    fn from_epoch(&self, epoch: i64) -> Option<DateTime<FixedOffset>> {
        if epoch <= 0 {
            return None;
        }
        let utc = if epoch > EPOCH_MILLIS_THRESHOLD {
            DateTime::from_timestamp_millis(epoch)?
        } else {
            DateTime::from_timestamp(epoch, 0)?
        };
        Some(utc.with_timezone(&self.offset))
    }

    fn parse_time_str(&self, s: &str) -> Option<DateTime<FixedOffset>> {
        let s = s.trim();
        if s.is_empty() {
            return None;
        }
        if let Ok(t) = DateTime::parse_from_rfc3339(s) {
            return Some(t);
        }
        for fmt in ["%Y-%m-%d %H:%M:%S", "%Y-%m-%dT%H:%M:%S", "%Y-%m-%d %H:%M"] {
            if let Ok(naive) = NaiveDateTime::parse_from_str(s, fmt) {
                return self.offset.from_local_datetime(&naive).single();
            }
        }
        None
    }
}

fn has_link_payload(raw: &RawMessage) -> bool {
    let has_content = raw.content.as_deref().is_some_and(|c| !c.trim().is_empty());
    let has_payload = raw.contents.as_ref().is_some_and(|c| {
        c.title.as_deref().is_some_and(|t| !t.is_empty())
            || c.url.as_deref().is_some_and(|u| !u.is_empty())
    });
    has_content || has_payload
}

fn media_reference(raw: &RawMessage) -> Option<String> {
    let contents = raw.contents.as_ref()?;
    contents
        .md5
        .clone()
        .filter(|s| !s.is_empty())
        .or_else(|| contents.path.clone().filter(|s| !s.is_empty()))
}

/// Render display content for a record of the given kind.
pub fn display_content(raw: &RawMessage, kind: MessageKind) -> String {
    let text = match kind {
        MessageKind::Image => "[image]".to_string(),
        MessageKind::Video => "[video]".to_string(),
        MessageKind::Link => {
            let title = raw
                .contents
                .as_ref()
                .and_then(|c| c.title.as_deref())
                .filter(|t| !t.is_empty());
            let url = raw
                .contents
                .as_ref()
                .and_then(|c| c.url.as_deref())
                .filter(|u| !u.is_empty());
            match (title, url) {
                (Some(t), Some(u)) => format!("[{}]({})", t, u),
                (Some(t), None) => format!("[{}]", t),
                _ => raw
                    .content
                    .clone()
                    .filter(|c| !c.trim().is_empty())
                    .unwrap_or_else(|| "[link]".to_string()),
            }
        }
        MessageKind::Text | MessageKind::Other => raw.content.clone().unwrap_or_default(),
    };
    truncate_chars(&strip_control_chars(&text), MAX_CONTENT_CHARS)
}

/// Remove C0/C1 control characters. Newlines and tabs are kept.
pub fn strip_control_chars(s: &str) -> String {
    s.chars()
        .filter(|c| *c == '\n' || *c == '\t' || !c.is_control())
        .collect()
}

/// Cap `s` at `max` characters, appending `…` when cut.
pub fn truncate_chars(s: &str, max: usize) -> String {
    if s.chars().count() <= max {
        return s.to_string();
    }
    let mut out: String = s.chars().take(max).collect();
    out.push('…');
    out
}

/// Derive a readable name from an opaque sender id.
///
/// | Id shape | Result |
/// |----------|--------|
/// | contains `@chatroom` | [`GROUP_SENDER_LABEL`] |
/// | digits only | `User` + last 4 digits |
/// | alphanumeric, longer than 8 | `User` + 3-digit hash label |
/// | anything longer than 12 chars | first 12 chars + `…` |
/// | otherwise | unchanged |
///
/// For ids containing `@`, only the part before the `@` is classified.
pub fn friendly_sender_name(raw_id: &str) -> String {
    let raw_id = raw_id.trim();
    if raw_id.is_empty() || raw_id == "Unknown" {
        return "Unknown".to_string();
    }
    if raw_id.contains("@chatroom") {
        return GROUP_SENDER_LABEL.to_string();
    }

    let id = raw_id.split('@').next().unwrap_or(raw_id);

    if !id.is_empty() && id.chars().all(|c| c.is_ascii_digit()) {
        let tail: String = id
            .chars()
            .rev()
            .take(4)
            .collect::<Vec<_>>()
            .into_iter()
            .rev()
            .collect();
        return format!("User{}", tail);
    }

    if id.chars().count() > 8 && id.chars().all(|c| c.is_ascii_alphanumeric()) {
        return format!("User{:03}", hash_label(id));
    }

    truncate_chars(id, 12)
}

/// Stable 0-999 label derived from the SHA-256 of the id.
fn hash_label(id: &str) -> u32 {
    let digest = Sha256::digest(id.as_bytes());
    let n = u32::from_be_bytes([digest[0], digest[1], digest[2], digest[3]]);
    n % 1000
}
