//! Digest synthesis.
//!
//! Builds a bounded prompt from normalized messages, asks the completion
//! API for a structured JSON digest, recovers the JSON with
//! [`json_repair::extract`], and merges the result with statistics computed
//! locally. The statistics always come from [`stats::activity_stats`]; the
//! model never supplies counts or user lists.
//!
//! A truncated completion (`finish_reason == "length"`) is retried once
//! with a reduced prompt and a larger output budget, as described by
//! [`RetryPolicy`]. When no usable JSON comes back, the result is a
//! degraded digest: complete statistics plus a single topic explaining what
//! went wrong.

use anyhow::{bail, Result};
use chrono::{DateTime, NaiveDate, Utc};
use serde::de::DeserializeOwned;
use serde::Serialize;
use serde_json::Value;
use std::collections::HashSet;
use std::fmt;
use std::sync::Arc;

use chat_digest_core::json_repair::{self, ExtractTarget};
use chat_digest_core::models::{
    CanonicalMessage, DigestResult, MessageTime, SubjectKind, TopicHighlight,
};
use chat_digest_core::normalize::{strip_control_chars, truncate_chars};
use chat_digest_core::stats;

use crate::traits::{CompletionClient, CompletionRequest};

const DIGEST_SYSTEM_PROMPT: &str = "You are a JSON analysis assistant. Return exactly one JSON \
object as requested, with no markdown fences and no text before or after it.";

const NARRATIVE_SYSTEM_PROMPT: &str = "You are a meticulous note-taker who turns chat logs into \
detailed, well-organized daily reports suitable for archiving. Write in Markdown.";

const ASK_SYSTEM_PROMPT: &str = "You analyze chat logs and answer the user's request \
using only what the log shows. Write in Markdown.";

/// Placeholder text when the narrative report cannot be generated.
pub const NARRATIVE_UNAVAILABLE: &str = "Narrative report unavailable: the completion request failed.";

// ═══════════════════════════════════════════════════════════════════════
// Options
// ═══════════════════════════════════════════════════════════════════════

/// How much of the conversation goes into one prompt.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PromptLimits {
    pub max_messages: usize,
    pub sender_chars: usize,
    pub content_chars: usize,
    pub subject_chars: usize,
}

impl PromptLimits {
    pub const STANDARD: PromptLimits = PromptLimits {
        max_messages: 50,
        sender_chars: 30,
        content_chars: 300,
        subject_chars: 50,
    };

    /// Half the messages, half the content.
    pub fn reduced(&self) -> PromptLimits {
        PromptLimits {
            max_messages: (self.max_messages / 2).max(1),
            content_chars: (self.content_chars / 2).max(1),
            ..*self
        }
    }
}

/// One completion attempt: prompt size and output budget.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct AttemptPlan {
    pub limits: PromptLimits,
    pub max_tokens: u32,
}

/// At most two attempts. The second runs only when the first was truncated.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RetryPolicy {
    pub first: AttemptPlan,
    pub on_truncation: Option<AttemptPlan>,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            first: AttemptPlan {
                limits: PromptLimits::STANDARD,
                max_tokens: 4000,
            },
            on_truncation: Some(AttemptPlan {
                limits: PromptLimits::STANDARD.reduced(),
                max_tokens: 8000,
            }),
        }
    }
}

impl RetryPolicy {
    /// A policy that never retries.
    pub fn single(plan: AttemptPlan) -> Self {
        Self {
            first: plan,
            on_truncation: None,
        }
    }

    fn plans(&self) -> impl Iterator<Item = &AttemptPlan> {
        std::iter::once(&self.first).chain(self.on_truncation.as_ref())
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct DigestOptions {
    pub temperature: f32,
    pub retry: RetryPolicy,
    pub narrative_temperature: f32,
    pub narrative_max_tokens: u32,
    pub narrative_messages: usize,
    pub narrative_content_chars: usize,
    pub ask_temperature: f32,
    pub ask_max_tokens: u32,
    pub ask_messages: usize,
    pub ask_content_chars: usize,
}

impl Default for DigestOptions {
    fn default() -> Self {
        Self {
            temperature: 0.1,
            retry: RetryPolicy::default(),
            narrative_temperature: 0.5,
            narrative_max_tokens: 4000,
            narrative_messages: 20,
            narrative_content_chars: 200,
            ask_temperature: 0.7,
            ask_max_tokens: 4000,
            ask_messages: 500,
            ask_content_chars: 300,
        }
    }
}

// ═══════════════════════════════════════════════════════════════════════
// Request / result types
// ═══════════════════════════════════════════════════════════════════════

/// A free-form request over the messages of a date range.
#[derive(Debug, Clone)]
pub struct AskRequest {
    pub prompt: String,
    pub subject_name: String,
    pub from: NaiveDate,
    pub to: NaiveDate,
}

/// What the digest is about.
#[derive(Debug, Clone)]
pub struct DigestSubject {
    pub id: String,
    pub name: String,
    pub date: NaiveDate,
    /// Explicit kind. `None` falls back to the sender-count heuristic.
    pub kind: Option<SubjectKind>,
}

/// Why a digest came back degraded.
#[derive(Debug, Clone, PartialEq)]
pub enum DigestFailure {
    /// Every attempt hit the output token budget.
    Truncated,
    /// The response could not be turned into JSON.
    Unparseable(String),
    /// The completion call itself failed.
    Api(String),
}

impl fmt::Display for DigestFailure {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            DigestFailure::Truncated => {
                f.write_str("the model's response was cut off before the digest was complete")
            }
            DigestFailure::Unparseable(e) => {
                write!(f, "the model's response could not be parsed as JSON ({})", e)
            }
            DigestFailure::Api(e) => write!(f, "the completion request failed ({})", e),
        }
    }
}

/// Structured digest plus the narrative report.
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct GeneratedReport {
    pub digest: DigestResult,
    pub text_report: String,
    pub generated_at: DateTime<Utc>,
}

// ═══════════════════════════════════════════════════════════════════════
// Synthesizer
// ═══════════════════════════════════════════════════════════════════════

pub struct DigestSynthesizer {
    client: Arc<dyn CompletionClient>,
    options: DigestOptions,
}

impl DigestSynthesizer {
    pub fn new(client: Arc<dyn CompletionClient>) -> Self {
        Self::with_options(client, DigestOptions::default())
    }

    pub fn with_options(client: Arc<dyn CompletionClient>, options: DigestOptions) -> Self {
        Self { client, options }
    }

    /// Digest plus narrative, ready for presentation.
    pub async fn generate_report(
        &self,
        messages: &[CanonicalMessage],
        subject: &DigestSubject,
    ) -> GeneratedReport {
        let digest = self.synthesize(messages, subject).await;
        let text_report = self.narrative(messages, subject, &digest).await;
        GeneratedReport {
            digest,
            text_report,
            generated_at: Utc::now(),
        }
    }

    /// Structured digest. Never fails; see [`DigestFailure`] for the
    /// degraded shapes.
    pub async fn synthesize(
        &self,
        messages: &[CanonicalMessage],
        subject: &DigestSubject,
    ) -> DigestResult {
        let kind = subject
            .kind
            .unwrap_or_else(|| stats::infer_subject_kind(messages));
        let mut digest = empty_digest(messages, subject, kind);

        if messages.is_empty() {
            tracing::info!(subject = %subject.id, "No messages; skipping completion");
            return digest;
        }

        match self.request_digest_json(messages, subject, kind).await {
            Ok(value) => merge_model_output(&mut digest, &value),
            Err(failure) => {
                tracing::warn!(subject = %subject.id, %failure, "Returning degraded digest");
                digest.topic_highlights = vec![failure_topic(&failure)];
            }
        }
        digest
    }

    async fn request_digest_json(
        &self,
        messages: &[CanonicalMessage],
        subject: &DigestSubject,
        kind: SubjectKind,
    ) -> std::result::Result<Value, DigestFailure> {
        let mut plans = self.options.retry.plans().peekable();
        let mut failure = DigestFailure::Truncated;

        while let Some(plan) = plans.next() {
            let request = CompletionRequest {
                system: DIGEST_SYSTEM_PROMPT.to_string(),
                user: digest_prompt(messages, subject, kind, &plan.limits),
                temperature: self.options.temperature,
                max_tokens: plan.max_tokens,
            };

            let completion = match self.client.complete(&request).await {
                Ok(c) => c,
                Err(e) => return Err(DigestFailure::Api(format!("{:#}", e))),
            };

            if completion.is_truncated() && plans.peek().is_some() {
                tracing::warn!(
                    max_tokens = plan.max_tokens,
                    "Digest completion truncated; retrying with a reduced prompt"
                );
                continue;
            }

            match json_repair::extract(
                &completion.text,
                ExtractTarget::Object,
                completion.finish_reason.as_deref(),
            ) {
                Ok(extraction) => {
                    if extraction.was_repaired() {
                        tracing::info!(stage = %extraction.stage, "Recovered digest JSON after repair");
                    }
                    return Ok(extraction.value);
                }
                Err(e) if e.was_truncated() => failure = DigestFailure::Truncated,
                Err(e) => {
                    failure = DigestFailure::Unparseable(
                        e.last_error().unwrap_or("no JSON found").to_string(),
                    );
                }
            }
            break;
        }
        Err(failure)
    }

    /// Free-form Markdown report. Failure yields [`NARRATIVE_UNAVAILABLE`].
    pub async fn narrative(
        &self,
        messages: &[CanonicalMessage],
        subject: &DigestSubject,
        digest: &DigestResult,
    ) -> String {
        let request = CompletionRequest {
            system: NARRATIVE_SYSTEM_PROMPT.to_string(),
            user: narrative_prompt(messages, subject, digest, &self.options),
            temperature: self.options.narrative_temperature,
            max_tokens: self.options.narrative_max_tokens,
        };
        match self.client.complete(&request).await {
            Ok(c) if !c.text.trim().is_empty() => c.text,
            Ok(_) => {
                tracing::warn!("Narrative completion was empty");
                NARRATIVE_UNAVAILABLE.to_string()
            }
            Err(e) => {
                tracing::warn!(error = %e, "Narrative completion failed");
                NARRATIVE_UNAVAILABLE.to_string()
            }
        }
    }

    /// Answer a user-written prompt over `messages`.
    ///
    /// Unlike the digest, this has no fallback: an empty range, a blank
    /// prompt or a failed completion is an error.
    pub async fn ask(&self, messages: &[CanonicalMessage], request: &AskRequest) -> Result<String> {
        if request.prompt.trim().is_empty() {
            bail!("Prompt is empty");
        }
        if messages.is_empty() {
            bail!("No messages between {} and {}", request.from, request.to);
        }
        if messages.len() > self.options.ask_messages {
            tracing::warn!(
                total = messages.len(),
                used = self.options.ask_messages,
                "Prompt covers only the first messages of the range"
            );
        }

        let completion = self
            .client
            .complete(&CompletionRequest {
                system: ASK_SYSTEM_PROMPT.to_string(),
                user: ask_prompt(messages, request, &self.options),
                temperature: self.options.ask_temperature,
                max_tokens: self.options.ask_max_tokens,
            })
            .await?;
        if completion.text.trim().is_empty() {
            bail!("Completion returned no text");
        }
        Ok(completion.text)
    }
}

fn empty_digest(
    messages: &[CanonicalMessage],
    subject: &DigestSubject,
    kind: SubjectKind,
) -> DigestResult {
    DigestResult {
        id: uuid::Uuid::new_v4().to_string(),
        subject_id: subject.id.clone(),
        subject_name: subject.name.clone(),
        subject_kind: kind,
        date: subject.date,
        topic_highlights: Vec::new(),
        activity_stats: stats::activity_stats(messages),
        quotable_messages: Vec::new(),
        member_contributions: None,
        content_value: None,
        group_health: None,
        private_analysis: None,
        trend_insights: None,
    }
}

fn failure_topic(failure: &DigestFailure) -> TopicHighlight {
    let title = match failure {
        DigestFailure::Truncated => "Digest truncated",
        DigestFailure::Unparseable(_) => "Digest could not be parsed",
        DigestFailure::Api(_) => "Digest request failed",
    };
    TopicHighlight {
        title: title.to_string(),
        summary: format!(
            "The topic analysis is unavailable because {}. Activity statistics are still complete.",
            failure
        ),
        category: "System".to_string(),
        significance: "low".to_string(),
        ..Default::default()
    }
}

/// Copy the model's sections into `digest`, one section at a time.
///
/// A malformed section is dropped without affecting the others. List
/// sections keep every element that decodes.
pub fn merge_model_output(digest: &mut DigestResult, value: &Value) {
    digest.topic_highlights = lenient_list(value, "topicHighlights");
    digest.quotable_messages = lenient_list(value, "quotableMessages");
    digest.content_value = lenient_section(value, "contentValue");
    digest.trend_insights = lenient_section(value, "trendInsights");

    match digest.subject_kind {
        SubjectKind::Group => {
            if value.get("memberContributions").is_some() {
                digest.member_contributions = Some(lenient_list(value, "memberContributions"));
            }
            digest.group_health = lenient_section(value, "groupHealth");
        }
        SubjectKind::Direct => {
            digest.private_analysis = lenient_section(value, "privateAnalysis");
        }
    }
}

fn lenient_list<T: DeserializeOwned>(value: &Value, key: &str) -> Vec<T> {
    let Some(items) = value.get(key).and_then(Value::as_array) else {
        return Vec::new();
    };
    let decoded: Vec<T> = items
        .iter()
        .filter_map(|item| serde_json::from_value(item.clone()).ok())
        .collect();
    if decoded.len() < items.len() {
        tracing::debug!(
            section = key,
            dropped = items.len() - decoded.len(),
            "Dropped malformed digest entries"
        );
    }
    decoded
}

fn lenient_section<T: DeserializeOwned>(value: &Value, key: &str) -> Option<T> {
    let section = value.get(key)?;
    match serde_json::from_value(section.clone()) {
        Ok(v) => Some(v),
        Err(e) => {
            tracing::debug!(section = key, error = %e, "Dropped malformed digest section");
            None
        }
    }
}

// ═══════════════════════════════════════════════════════════════════════
// Prompts
// ═══════════════════════════════════════════════════════════════════════

fn clean(s: &str, max: usize) -> String {
    truncate_chars(&strip_control_chars(s), max)
}

fn transcript(
    messages: &[CanonicalMessage],
    max: usize,
    sender_chars: usize,
    content_chars: usize,
    stamp: fn(&MessageTime) -> String,
) -> (String, Vec<String>) {
    let mut users = Vec::new();
    let mut seen = HashSet::new();
    let lines: Vec<String> = messages
        .iter()
        .take(max)
        .map(|m| {
            let sender = clean(&m.sender_display_name, sender_chars);
            if seen.insert(sender.clone()) {
                users.push(sender.clone());
            }
            format!(
                "[{}] {}: {}",
                stamp(&m.timestamp),
                sender,
                clean(&m.content, content_chars)
            )
        })
        .collect();
    (lines.join("\n"), users)
}

const GROUP_SCHEMA: &str = r#"{
  "topicHighlights": [{"title": "", "summary": "80-120 words of context", "participants": [""], "timeRange": "", "category": "tech|study|work|life|decision|discussion|other", "significance": "high|medium|low", "keywordTags": [""], "sentimentTone": "positive|neutral|negative|mixed"}],
  "quotableMessages": [{"content": "", "author": "", "timestamp": "", "messageType": "insight|humor|decision|question|solution", "sentimentScore": 0.5}],
  "memberContributions": [{"name": "", "messageCount": 0, "qualityScore": 8, "specialties": [""], "responseTime": "fast|normal|slow", "initiatedTopics": 0}],
  "contentValue": {"knowledgeSharing": [{"type": "", "content": "", "author": "", "timestamp": ""}], "actionItems": [{"task": "", "assignee": "", "context": ""}], "decisionsMade": [{"decision": "", "context": "", "participants": [""], "timestamp": ""}]},
  "groupHealth": {"participationBalance": 0.8, "topicDiversity": 0.7, "interactionQuality": 0.9, "overallHealthScore": 85, "recommendations": [""]},
  "trendInsights": {"comparedToPrevious": ""}
}"#;

const DIRECT_SCHEMA: &str = r#"{
  "topicHighlights": [{"title": "", "summary": "80-120 words of context", "participants": [""], "timeRange": "", "category": "work|study|life|emotion|decision|discussion|other", "significance": "high|medium|low", "keywordTags": [""], "sentimentTone": "positive|neutral|negative|mixed"}],
  "quotableMessages": [{"content": "", "author": "", "timestamp": "", "messageType": "insight|humor|decision|question|solution|emotion", "sentimentScore": 0.5}],
  "privateAnalysis": {"relationshipTone": "friendly|professional|intimate|neutral", "conversationPatterns": [""], "emotionalInsights": [""], "communicationStyle": ""},
  "contentValue": {"knowledgeSharing": [{"type": "", "content": "", "author": "", "timestamp": ""}], "actionItems": [{"task": "", "assignee": "", "context": ""}], "decisionsMade": [{"decision": "", "context": "", "participants": [""], "timestamp": ""}]},
  "trendInsights": {"comparedToPrevious": ""}
}"#;

/// User prompt for the structured digest.
pub fn digest_prompt(
    messages: &[CanonicalMessage],
    subject: &DigestSubject,
    kind: SubjectKind,
    limits: &PromptLimits,
) -> String {
    let (log, users) = transcript(
        messages,
        limits.max_messages,
        limits.sender_chars,
        limits.content_chars,
        MessageTime::clock,
    );
    let (what, schema, extra) = match kind {
        SubjectKind::Group => (
            "group chat",
            GROUP_SCHEMA,
            "- memberContributions: the 3-5 most active contributors\n",
        ),
        SubjectKind::Direct => ("one-to-one chat", DIRECT_SCHEMA, ""),
    };

    format!(
        "Analyze this {what} log and produce a concise but informative daily digest as JSON.\n\n\
         Chat: {name}\n\
         Date: {date}\n\
         Participants: {users}\n\n\
         Chat log:\n{log}\n\n\
         Return JSON with exactly this shape:\n{schema}\n\n\
         Requirements:\n\
         - topicHighlights: at most 3 important topics, each with enough detail\n\
         - quotableMessages: at most 3 of the most valuable messages\n\
         {extra}\
         - Use only participant names that appear in the chat log\n\
         - Escape any double quote inside a string value as \\\"\n\
         - No trailing commas; close every bracket\n",
        what = what,
        name = clean(&subject.name, limits.subject_chars),
        date = subject.date.format("%Y-%m-%d"),
        users = users.join(", "),
        log = log,
        schema = schema,
        extra = extra,
    )
}

/// User prompt for the narrative report.
pub fn narrative_prompt(
    messages: &[CanonicalMessage],
    subject: &DigestSubject,
    digest: &DigestResult,
    options: &DigestOptions,
) -> String {
    let (log, _) = transcript(
        messages,
        options.narrative_messages,
        PromptLimits::STANDARD.sender_chars,
        options.narrative_content_chars,
        MessageTime::clock,
    );
    format!(
        "Write a detailed daily report of this chat from the log and statistics below.\n\n\
         Chat: {name}\n\
         Date: {date}\n\
         Total messages: {total}\n\
         Active users: {active}\n\
         Peak hour: {peak}\n\n\
         Chat log:\n{log}\n\n\
         Cover: key statistics; main topics with background, discussion and outcome; \
         decisions and agreements; shared resources; notable quotes; a timeline of key \
         events; a closing summary.",
        name = clean(&subject.name, PromptLimits::STANDARD.subject_chars),
        date = subject.date.format("%Y-%m-%d"),
        total = digest.activity_stats.total_messages,
        active = digest.activity_stats.active_users.len(),
        peak = digest.activity_stats.peak_time_range,
        log = log,
    )
}

/// User prompt for a free-form request. Lines carry the date because the
/// range may span several days.
pub fn ask_prompt(
    messages: &[CanonicalMessage],
    request: &AskRequest,
    options: &DigestOptions,
) -> String {
    let (log, users) = transcript(
        messages,
        options.ask_messages,
        PromptLimits::STANDARD.sender_chars,
        options.ask_content_chars,
        dated_clock,
    );
    format!(
        "{prompt}\n\n\
         Chat: {name}\n\
         Time range: {from} - {to}\n\
         Participants: {users}\n\n\
         Chat log:\n{log}",
        prompt = request.prompt.trim(),
        name = clean(&request.subject_name, PromptLimits::STANDARD.subject_chars),
        from = request.from.format("%Y-%m-%d"),
        to = request.to.format("%Y-%m-%d"),
        users = users.join(", "),
        log = log,
    )
}

fn dated_clock(time: &MessageTime) -> String {
    match time.instant() {
        Some(t) => t.format("%m/%d %H:%M").to_string(),
        None => time.clock(),
    }
}

/// Serialize a report for `--json` output.
pub fn report_json(report: &GeneratedReport) -> Result<String> {
    Ok(serde_json::to_string_pretty(report)?)
}
