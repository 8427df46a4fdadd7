//! Core data models used throughout chat-digest.
//!
//! These types represent the raw chat-log records, the canonical messages
//! produced by the normalizer, the digest handed to the presentation layer,
//! and the rows written to the destination store.

use chrono::{DateTime, FixedOffset, NaiveDate};
use serde::{Deserialize, Serialize, Serializer};
use serde_json::Value;
use std::fmt;

// ═══════════════════════════════════════════════════════════════════════
// Raw records
// ═══════════════════════════════════════════════════════════════════════

/// One record as returned by the chat-log source.
///
/// The source is loosely typed: field names for the sender and the time
/// vary across message kinds, ids can be strings or numbers, and
/// `timestamp` may be epoch seconds, epoch milliseconds, or a string.
/// Every field is therefore optional.
#[derive(Debug, Clone, Default, Deserialize, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct RawMessage {
    #[serde(default)]
    pub id: Option<Value>,
    #[serde(default)]
    pub seq: Option<i64>,
    #[serde(default, rename = "type")]
    pub kind: Option<i64>,
    #[serde(default)]
    pub sub_type: Option<i64>,
    #[serde(default)]
    pub time: Option<String>,
    #[serde(default)]
    pub timestamp: Option<Value>,
    #[serde(default)]
    pub talker: Option<String>,
    #[serde(default)]
    pub talker_name: Option<String>,
    #[serde(default)]
    pub sender: Option<String>,
    #[serde(default)]
    pub sender_name: Option<String>,
    #[serde(default)]
    pub content: Option<String>,
    #[serde(default)]
    pub contents: Option<RawContents>,
}

/// Structured payload attached to media and link records.
#[derive(Debug, Clone, Default, Deserialize, Serialize)]
pub struct RawContents {
    #[serde(default)]
    pub md5: Option<String>,
    #[serde(default)]
    pub path: Option<String>,
    #[serde(default)]
    pub title: Option<String>,
    #[serde(default)]
    pub url: Option<String>,
    #[serde(default)]
    pub desc: Option<String>,
}

impl RawMessage {
    /// Stable identifier for the record: explicit `id`, then `seq`, then
    /// the record's position in the fetched list.
    pub fn identifier(&self, position: usize) -> String {
        match &self.id {
            Some(Value::String(s)) if !s.is_empty() => s.clone(),
            Some(Value::Number(n)) => n.to_string(),
            _ => match self.seq {
                Some(seq) => seq.to_string(),
                None => format!("msg-{}", position),
            },
        }
    }

    /// Opaque sender id: `sender`, falling back to `talker`.
    pub fn raw_sender(&self) -> Option<&str> {
        self.sender
            .as_deref()
            .filter(|s| !s.is_empty())
            .or_else(|| self.talker.as_deref().filter(|s| !s.is_empty()))
    }
}

// ═══════════════════════════════════════════════════════════════════════
// Canonical messages
// ═══════════════════════════════════════════════════════════════════════

/// Kind of a chat message.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum MessageKind {
    Text,
    Image,
    Video,
    Link,
    Other,
}

impl MessageKind {
    /// Map a chat-log type code to a kind.
    ///
    /// | Code | Kind |
    /// |------|------|
    /// | `1`  | text |
    /// | `3`  | image |
    /// | `43` | video |
    /// | `49` | link / shared app card |
    pub fn from_code(code: i64) -> Self {
        match code {
            1 => MessageKind::Text,
            3 => MessageKind::Image,
            43 => MessageKind::Video,
            49 => MessageKind::Link,
            _ => MessageKind::Other,
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            MessageKind::Text => "text",
            MessageKind::Image => "image",
            MessageKind::Video => "video",
            MessageKind::Link => "link",
            MessageKind::Other => "other",
        }
    }

    pub fn is_supported(&self) -> bool {
        !matches!(self, MessageKind::Other)
    }

    /// The media kind carried by this message, if any.
    pub fn media_kind(&self) -> Option<MediaKind> {
        match self {
            MessageKind::Image => Some(MediaKind::Image),
            MessageKind::Video => Some(MediaKind::Video),
            _ => None,
        }
    }
}

/// When a message was sent.
///
/// Sources supply inconsistent time fields. Anything the normalizer cannot
/// resolve becomes [`MessageTime::Unknown`] instead of failing the run.
/// Known instants order before `Unknown`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub enum MessageTime {
    At(DateTime<FixedOffset>),
    Unknown,
}

impl MessageTime {
    pub fn instant(&self) -> Option<DateTime<FixedOffset>> {
        match self {
            MessageTime::At(t) => Some(*t),
            MessageTime::Unknown => None,
        }
    }

    pub fn is_known(&self) -> bool {
        matches!(self, MessageTime::At(_))
    }

    /// Local hour of day (0-23) in the instant's own offset.
    pub fn hour(&self) -> Option<u32> {
        use chrono::Timelike;
        self.instant().map(|t| t.hour())
    }

    /// `HH:MM`, or `Unknown`.
    pub fn clock(&self) -> String {
        match self {
            MessageTime::At(t) => t.format("%H:%M").to_string(),
            MessageTime::Unknown => "Unknown".to_string(),
        }
    }

    pub fn date(&self) -> Option<NaiveDate> {
        self.instant().map(|t| t.date_naive())
    }

    pub fn epoch_millis(&self) -> Option<i64> {
        self.instant().map(|t| t.timestamp_millis())
    }
}

impl fmt::Display for MessageTime {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            MessageTime::At(t) => write!(f, "{}", t.to_rfc3339()),
            MessageTime::Unknown => write!(f, "unknown"),
        }
    }
}

impl Serialize for MessageTime {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.collect_str(self)
    }
}

/// Normalized, platform-agnostic representation of one chat message.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct CanonicalMessage {
    pub id: String,
    pub sender_display_name: String,
    pub raw_sender_id: String,
    pub content: String,
    pub media_ref: Option<String>,
    pub kind: MessageKind,
    pub timestamp: MessageTime,
}

// ═══════════════════════════════════════════════════════════════════════
// Digest
// ═══════════════════════════════════════════════════════════════════════

/// Whether the subject of a digest is a group or a one-to-one chat.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SubjectKind {
    Group,
    Direct,
}

impl SubjectKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            SubjectKind::Group => "group",
            SubjectKind::Direct => "direct",
        }
    }
}

impl std::str::FromStr for SubjectKind {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_lowercase().as_str() {
            "group" => Ok(SubjectKind::Group),
            "direct" | "private" => Ok(SubjectKind::Direct),
            other => Err(format!("unknown subject kind '{}': use group or direct", other)),
        }
    }
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct TopicHighlight {
    pub title: String,
    pub summary: String,
    pub participants: Vec<String>,
    pub time_range: String,
    pub category: String,
    pub significance: String,
    pub keyword_tags: Vec<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub sentiment_tone: Option<String>,
}

/// Message counts per part of the day.
///
/// | Bucket | Hours |
/// |--------|-------|
/// | morning | 06:00-11:59 |
/// | afternoon | 12:00-17:59 |
/// | evening | 18:00-23:59 |
/// | night | 00:00-05:59 |
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct TimeDistribution {
    pub morning: usize,
    pub afternoon: usize,
    pub evening: usize,
    pub night: usize,
}

impl TimeDistribution {
    pub fn total(&self) -> usize {
        self.morning + self.afternoon + self.evening + self.night
    }
}

/// Deterministic statistics, always computed locally.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ActivityStats {
    pub total_messages: usize,
    pub active_users: Vec<String>,
    pub peak_time_range: String,
    pub message_distribution: TimeDistribution,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct QuotableMessage {
    pub content: String,
    pub author: String,
    pub timestamp: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub context: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub message_type: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub sentiment_score: Option<f64>,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct MemberContribution {
    pub name: String,
    pub message_count: u32,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub quality_score: Option<f64>,
    pub specialties: Vec<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub response_time: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub initiated_topics: Option<u32>,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct KnowledgeShare {
    #[serde(rename = "type")]
    pub kind: String,
    pub content: String,
    pub author: String,
    pub timestamp: String,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct ActionItem {
    pub task: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub assignee: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub context: Option<String>,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct Decision {
    pub decision: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub context: Option<String>,
    pub participants: Vec<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub timestamp: Option<String>,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct ContentValue {
    pub knowledge_sharing: Vec<KnowledgeShare>,
    pub action_items: Vec<ActionItem>,
    pub decisions_made: Vec<Decision>,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct GroupHealth {
    pub participation_balance: f64,
    pub topic_diversity: f64,
    pub interaction_quality: f64,
    pub overall_health_score: f64,
    pub recommendations: Vec<String>,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct PrivateAnalysis {
    pub relationship_tone: String,
    pub conversation_patterns: Vec<String>,
    pub emotional_insights: Vec<String>,
    pub communication_style: String,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct TrendInsights {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub compared_to_previous: Option<String>,
}

/// Structured analytical summary of one subject's day.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct DigestResult {
    pub id: String,
    pub subject_id: String,
    pub subject_name: String,
    pub subject_kind: SubjectKind,
    pub date: NaiveDate,
    pub topic_highlights: Vec<TopicHighlight>,
    pub activity_stats: ActivityStats,
    pub quotable_messages: Vec<QuotableMessage>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub member_contributions: Option<Vec<MemberContribution>>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub content_value: Option<ContentValue>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub group_health: Option<GroupHealth>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub private_analysis: Option<PrivateAnalysis>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub trend_insights: Option<TrendInsights>,
}

// ═══════════════════════════════════════════════════════════════════════
// Export
// ═══════════════════════════════════════════════════════════════════════

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, Default)]
#[serde(rename_all = "lowercase")]
pub enum Importance {
    High,
    #[default]
    Medium,
    Low,
}

impl Importance {
    /// Lenient parse of model output. Accepts English and Chinese labels.
    pub fn parse_lenient(s: &str) -> Option<Self> {
        match s.trim().to_lowercase().as_str() {
            "high" | "高" => Some(Importance::High),
            "medium" | "mid" | "normal" | "中" => Some(Importance::Medium),
            "low" | "低" => Some(Importance::Low),
            _ => None,
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            Importance::High => "high",
            Importance::Medium => "medium",
            Importance::Low => "low",
        }
    }
}

/// One destination row, built from one canonical message.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ExportRecord {
    pub message_content: String,
    pub timestamp: MessageTime,
    pub sender: String,
    pub summary: Option<String>,
    pub message_type: String,
    pub category: String,
    pub chat_name: String,
    pub date: String,
    pub importance: Importance,
    pub keywords: Option<String>,
    pub attachment_token: Option<String>,
}

/// Kind of binary media carried by a message.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum MediaKind {
    Image,
    Video,
}

impl MediaKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            MediaKind::Image => "image",
            MediaKind::Video => "video",
        }
    }
}
