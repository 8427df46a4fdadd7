//! Digest synthesis against a scripted completion client.

use anyhow::{anyhow, Result};
use async_trait::async_trait;
use chat_digest::digest::{AskRequest, DigestSubject, DigestSynthesizer, NARRATIVE_UNAVAILABLE};
use chat_digest::traits::{Completion, CompletionClient, CompletionRequest};
use chat_digest_core::models::{CanonicalMessage, MessageKind, MessageTime, SubjectKind};
use chrono::{FixedOffset, NaiveDate, TimeZone};
use std::collections::VecDeque;
use std::sync::{Arc, Mutex};

// ─── Scripted client ────────────────────────────────────────────────

/// Replays canned responses in order and records every request.
struct Scripted {
    responses: Mutex<VecDeque<Result<Completion, String>>>,
    requests: Mutex<Vec<CompletionRequest>>,
}

impl Scripted {
    fn new(responses: Vec<Result<Completion, String>>) -> Arc<Self> {
        Arc::new(Self {
            responses: Mutex::new(responses.into()),
            requests: Mutex::new(Vec::new()),
        })
    }

    fn requests(&self) -> Vec<CompletionRequest> {
        self.requests.lock().unwrap().clone()
    }
}

#[async_trait]
impl CompletionClient for Scripted {
    fn model_name(&self) -> &str {
        "scripted"
    }

    async fn complete(&self, request: &CompletionRequest) -> Result<Completion> {
        self.requests.lock().unwrap().push(request.clone());
        match self.responses.lock().unwrap().pop_front() {
            Some(Ok(c)) => Ok(c),
            Some(Err(e)) => Err(anyhow!(e)),
            None => Err(anyhow!("script exhausted")),
        }
    }
}

fn ok(text: &str) -> Result<Completion, String> {
    Ok(Completion {
        text: text.to_string(),
        finish_reason: Some("stop".into()),
    })
}

fn cut_off(text: &str) -> Result<Completion, String> {
    Ok(Completion {
        text: text.to_string(),
        finish_reason: Some("length".into()),
    })
}

// ─── Helpers ────────────────────────────────────────────────────────

fn message(i: usize, sender: &str, hour: u32) -> CanonicalMessage {
    CanonicalMessage {
        id: i.to_string(),
        sender_display_name: sender.to_string(),
        raw_sender_id: format!("wxid_{}", sender),
        content: format!("note {} from {}", i, sender),
        media_ref: None,
        kind: MessageKind::Text,
        timestamp: MessageTime::At(
            FixedOffset::east_opt(8 * 3600)
                .unwrap()
                .with_ymd_and_hms(2025, 5, 27, hour, 15, 0)
                .unwrap(),
        ),
    }
}

fn conversation() -> Vec<CanonicalMessage> {
    vec![
        message(1, "alice", 9),
        message(2, "bob", 9),
        message(3, "carol", 14),
        message(4, "alice", 20),
    ]
}

fn subject(kind: Option<SubjectKind>) -> DigestSubject {
    DigestSubject {
        id: "123@chatroom".into(),
        name: "Team".into(),
        date: NaiveDate::from_ymd_opt(2025, 5, 27).unwrap(),
        kind,
    }
}

const GROUP_DIGEST: &str = r#"Here you go:
```json
{
  "topicHighlights": [
    {"title": "Release plan", "summary": "Agreed on Friday", "participants": ["alice", "bob"],
     "timeRange": "09:00-10:00", "category": "work", "significance": "high", "keywordTags": ["release"]}
  ],
  "quotableMessages": [{"content": "ship it", "author": "bob", "timestamp": "09:15"}],
  "memberContributions": [{"name": "alice", "messageCount": 2, "specialties": ["ops"]}],
  "groupHealth": {"participationBalance": 0.8, "topicDiversity": 0.4, "interactionQuality": 0.7,
                  "overallHealthScore": 0.7, "recommendations": []}
}
```"#;

// ─── Tests ──────────────────────────────────────────────────────────

#[tokio::test]
async fn successful_digest_keeps_local_statistics() {
    let client = Scripted::new(vec![ok(GROUP_DIGEST)]);
    let digest = DigestSynthesizer::new(client.clone())
        .synthesize(&conversation(), &subject(None))
        .await;

    assert_eq!(digest.subject_kind, SubjectKind::Group);
    assert_eq!(digest.activity_stats.total_messages, 4);
    assert_eq!(digest.activity_stats.message_distribution.total(), 4);
    assert_eq!(digest.topic_highlights.len(), 1);
    assert_eq!(digest.topic_highlights[0].title, "Release plan");
    assert_eq!(digest.quotable_messages[0].author, "bob");
    assert!(digest.group_health.is_some());
    assert!(digest.private_analysis.is_none());
    assert_eq!(client.requests().len(), 1);
}

#[tokio::test]
async fn api_failure_yields_single_failure_topic() {
    let client = Scripted::new(vec![Err("HTTP 503".into())]);
    let digest = DigestSynthesizer::new(client)
        .synthesize(&conversation(), &subject(None))
        .await;

    assert_eq!(digest.activity_stats.total_messages, 4);
    assert_eq!(digest.topic_highlights.len(), 1);
    assert!(digest.topic_highlights[0].summary.contains("HTTP 503"));
    assert!(digest.member_contributions.is_none());
}

#[tokio::test]
async fn unparseable_response_yields_failure_topic() {
    let client = Scripted::new(vec![ok("I'm sorry, I can't summarize this conversation.")]);
    let digest = DigestSynthesizer::new(client)
        .synthesize(&conversation(), &subject(None))
        .await;

    assert_eq!(digest.activity_stats.total_messages, 4);
    assert_eq!(digest.topic_highlights.len(), 1);
    assert_eq!(digest.topic_highlights[0].category, "System");
}

#[tokio::test]
async fn truncated_response_retries_with_larger_budget() {
    let client = Scripted::new(vec![
        cut_off(r#"{"topicHighlights": [{"title": "Rel"#),
        ok(GROUP_DIGEST),
    ]);
    let digest = DigestSynthesizer::new(client.clone())
        .synthesize(&conversation(), &subject(None))
        .await;

    let requests = client.requests();
    assert_eq!(requests.len(), 2);
    assert_eq!(requests[0].max_tokens, 4000);
    assert_eq!(requests[1].max_tokens, 8000);
    assert!((requests[0].temperature - 0.1).abs() < f32::EPSILON);
    assert_eq!(digest.topic_highlights[0].title, "Release plan");
}

#[tokio::test]
async fn truncated_final_attempt_is_repaired() {
    let client = Scripted::new(vec![
        cut_off(r#"{"topicHighlights": [{"title": "Rel"#),
        cut_off(r#"{"topicHighlights": [{"title": "Release plan", "summary": "Agreed"}], "quotableMess"#),
    ]);
    let digest = DigestSynthesizer::new(client.clone())
        .synthesize(&conversation(), &subject(None))
        .await;

    assert_eq!(client.requests().len(), 2);
    assert_eq!(digest.topic_highlights.len(), 1);
    assert_eq!(digest.topic_highlights[0].title, "Release plan");
    assert!(digest.quotable_messages.is_empty());
}

#[tokio::test]
async fn explicit_kind_overrides_sender_heuristic() {
    let client = Scripted::new(vec![ok(
        r#"{"topicHighlights": [], "privateAnalysis": {"relationshipTone": "warm"}, "groupHealth": {"overallHealthScore": 1}}"#,
    )]);
    let digest = DigestSynthesizer::new(client.clone())
        .synthesize(&conversation(), &subject(Some(SubjectKind::Direct)))
        .await;

    assert_eq!(digest.subject_kind, SubjectKind::Direct);
    assert_eq!(
        digest.private_analysis.map(|p| p.relationship_tone).as_deref(),
        Some("warm")
    );
    assert!(digest.group_health.is_none());
}

#[tokio::test]
async fn empty_day_makes_no_digest_call() {
    let client = Scripted::new(vec![ok("Quiet day.")]);
    let report = DigestSynthesizer::new(client.clone())
        .generate_report(&[], &subject(Some(SubjectKind::Group)))
        .await;

    assert_eq!(report.digest.activity_stats.total_messages, 0);
    assert!(report.digest.topic_highlights.is_empty());
    assert_eq!(client.requests().len(), 1);
    assert_eq!(report.text_report, "Quiet day.");
}

#[tokio::test]
async fn narrative_failure_uses_placeholder() {
    let client = Scripted::new(vec![ok(GROUP_DIGEST), Err("timeout".into())]);
    let report = DigestSynthesizer::new(client.clone())
        .generate_report(&conversation(), &subject(None))
        .await;

    assert_eq!(report.text_report, NARRATIVE_UNAVAILABLE);
    assert_eq!(report.digest.topic_highlights.len(), 1);
    let requests = client.requests();
    assert_eq!(requests.len(), 2);
    assert!(requests[1].user.contains("Team"));
}

// ─── Custom prompt ──────────────────────────────────────────────────

fn ask_request(prompt: &str) -> AskRequest {
    AskRequest {
        prompt: prompt.to_string(),
        subject_name: "Team".into(),
        from: NaiveDate::from_ymd_opt(2025, 5, 26).unwrap(),
        to: NaiveDate::from_ymd_opt(2025, 5, 27).unwrap(),
    }
}

#[tokio::test]
async fn ask_sends_prompt_range_and_dated_log() {
    let client = Scripted::new(vec![ok("## Decisions\n- ship Friday")]);
    let answer = DigestSynthesizer::new(client.clone())
        .ask(&conversation(), &ask_request("  List every decision.  "))
        .await
        .unwrap();

    assert_eq!(answer, "## Decisions\n- ship Friday");
    let requests = client.requests();
    assert_eq!(requests.len(), 1);
    let user = &requests[0].user;
    assert!(user.starts_with("List every decision.\n"), "{}", user);
    assert!(user.contains("Time range: 2025-05-26 - 2025-05-27"));
    assert!(user.contains("[05/27 09:15] alice: note 1 from alice"));
    assert!(user.contains("Participants: alice, bob, carol"));
}

#[tokio::test]
async fn ask_rejects_empty_input_without_calling() {
    let client = Scripted::new(vec![ok("unused")]);
    let synthesizer = DigestSynthesizer::new(client.clone());

    assert!(synthesizer.ask(&[], &ask_request("Summarize")).await.is_err());
    assert!(synthesizer
        .ask(&conversation(), &ask_request("   "))
        .await
        .is_err());
    assert!(client.requests().is_empty());
}

#[tokio::test]
async fn ask_surfaces_completion_failure() {
    let client = Scripted::new(vec![Err("HTTP 401".into())]);
    let err = DigestSynthesizer::new(client)
        .ask(&conversation(), &ask_request("Summarize"))
        .await
        .unwrap_err();
    assert!(format!("{:#}", err).contains("HTTP 401"));
}
