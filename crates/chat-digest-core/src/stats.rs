//! Deterministic activity statistics.
//!
//! Everything in [`ActivityStats`] is computed here from the normalized
//! messages. Model output never contributes to these numbers, so the user
//! list and counts cannot be hallucinated.

use std::collections::{BTreeMap, HashSet};

use crate::models::{ActivityStats, CanonicalMessage, SubjectKind, TimeDistribution};

/// Peak range reported when no message has a known time.
const DEFAULT_PEAK_RANGE: &str = "00:00 - 01:00";

/// Compute all deterministic statistics for a message set.
pub fn activity_stats(messages: &[CanonicalMessage]) -> ActivityStats {
    ActivityStats {
        total_messages: messages.len(),
        active_users: active_users(messages),
        peak_time_range: peak_time_range(messages),
        message_distribution: time_distribution(messages),
    }
}

/// Distinct non-empty display names, in order of first appearance.
pub fn active_users(messages: &[CanonicalMessage]) -> Vec<String> {
    let mut seen = HashSet::new();
    messages
        .iter()
        .map(|m| m.sender_display_name.trim())
        .filter(|name| !name.is_empty())
        .filter(|name| seen.insert(name.to_string()))
        .map(str::to_string)
        .collect()
}

/// The busiest hour, formatted `HH:00 - HH+1:00`.
///
/// Ties go to the earliest hour. Messages with an unknown time are not
/// counted.
pub fn peak_time_range(messages: &[CanonicalMessage]) -> String {
    let mut per_hour: BTreeMap<u32, usize> = BTreeMap::new();
    for hour in messages.iter().filter_map(|m| m.timestamp.hour()) {
        *per_hour.entry(hour).or_insert(0) += 1;
    }

    let mut best: Option<(u32, usize)> = None;
    for (hour, count) in per_hour {
        if best.map_or(true, |(_, c)| count > c) {
            best = Some((hour, count));
        }
    }

    match best {
        Some((hour, _)) => format!("{:02}:00 - {:02}:00", hour, hour + 1),
        None => DEFAULT_PEAK_RANGE.to_string(),
    }
}

/// Four-bucket time-of-day histogram. Unknown times are not bucketed.
pub fn time_distribution(messages: &[CanonicalMessage]) -> TimeDistribution {
    let mut dist = TimeDistribution::default();
    for hour in messages.iter().filter_map(|m| m.timestamp.hour()) {
        match hour {
            6..=11 => dist.morning += 1,
            12..=17 => dist.afternoon += 1,
            18..=23 => dist.evening += 1,
            _ => dist.night += 1,
        }
    }
    dist
}

/// Guess the subject kind from the sender set: two or fewer distinct
/// senders looks like a direct chat.
///
/// Only used when the caller does not say which kind the subject is.
pub fn infer_subject_kind(messages: &[CanonicalMessage]) -> SubjectKind {
    let senders: HashSet<&str> = messages.iter().map(|m| m.raw_sender_id.as_str()).collect();
    if senders.len() <= 2 {
        SubjectKind::Direct
    } else {
        SubjectKind::Group
    }
}
