//! Resilient JSON extraction from completion text.
//!
//! Completion APIs give no JSON-mode guarantee. Output arrives wrapped in
//! markdown fences, surrounded by prose, cut off at the token budget, or
//! carrying unescaped quotes copied from chat content. [`extract`] recovers
//! a value with a graduated sequence of repairs, cheapest first:
//!
//! | # | Stage | Function |
//! |---|-------|----------|
//! | 1 | strip code fences | [`strip_code_fences`] |
//! | 2 | smart quotes to ASCII | [`normalize_quotes`] |
//! | 3 | slice first plausible opener .. last closer | [`slice_candidate`] |
//! | 4 | direct parse | |
//! | 5 | targeted fix at the parser's error offset | [`targeted_fix`] |
//! | 6 | cut back to the last fully closed container | [`closed_prefix`] |
//! | 7 | append the missing closers | [`balance_closers`] |
//!
//! Stages 1-3 always run. Stages 4-7 each end in a parse attempt and the
//! first success wins. If every attempt fails, the [`ExtractionFailure`]
//! carries the original text, the completion's finish reason, and every
//! intermediate candidate with its parse error.
//!
//! Every stage is a pure `&str -> String` function.

use serde_json::Value;
use std::fmt;

/// Upper bound on error-offset fixes applied in stage 5.
const MAX_TARGETED_FIXES: usize = 32;

/// What the caller expects at the top level.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ExtractTarget {
    /// A single JSON object (the digest).
    Object,
    /// A JSON array (per-message classification). Whichever of `[` or `{`
    /// opens a value first wins, so an array wrapped in an object comes back
    /// as the object.
    Array,
}

/// The parse attempt that produced (or failed to produce) a value.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RepairStage {
    Direct,
    TargetedFix,
    ClosedPrefix,
    Balanced,
}

impl fmt::Display for RepairStage {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            RepairStage::Direct => "direct",
            RepairStage::TargetedFix => "targeted-fix",
            RepairStage::ClosedPrefix => "closed-prefix",
            RepairStage::Balanced => "balanced",
        };
        f.write_str(s)
    }
}

/// One failed parse attempt.
#[derive(Debug, Clone, PartialEq)]
pub struct RepairAttempt {
    pub stage: RepairStage,
    pub candidate: String,
    pub error: String,
}

/// A recovered value and the stage that recovered it.
#[derive(Debug, Clone, PartialEq)]
pub struct Extraction {
    pub value: Value,
    pub stage: RepairStage,
}

impl Extraction {
    /// True when the value needed any repair beyond fence/slice cleanup.
    pub fn was_repaired(&self) -> bool {
        self.stage != RepairStage::Direct
    }
}

/// Every repair failed.
#[derive(Debug, Clone, PartialEq, thiserror::Error)]
#[error(
    "no JSON value recovered after {n} attempt(s) (finish reason: {reason})",
    n = .attempts.len(),
    reason = .finish_reason.as_deref().unwrap_or("unknown")
)]
pub struct ExtractionFailure {
    pub original: String,
    pub finish_reason: Option<String>,
    pub attempts: Vec<RepairAttempt>,
}

impl ExtractionFailure {
    /// The completion stopped at its output token budget.
    pub fn was_truncated(&self) -> bool {
        self.finish_reason.as_deref() == Some("length")
    }

    /// Parse error of the final attempt.
    pub fn last_error(&self) -> Option<&str> {
        self.attempts.last().map(|a| a.error.as_str())
    }
}

/// Recover a JSON value from `text`.
pub fn extract(
    text: &str,
    target: ExtractTarget,
    finish_reason: Option<&str>,
) -> Result<Extraction, ExtractionFailure> {
    let mut attempts = Vec::new();
    let fail = |attempts: Vec<RepairAttempt>| ExtractionFailure {
        original: text.to_string(),
        finish_reason: finish_reason.map(str::to_string),
        attempts,
    };

    let cleaned = normalize_quotes(&strip_code_fences(text));
    let Some(sliced) = slice_candidate(&cleaned, target) else {
        attempts.push(RepairAttempt {
            stage: RepairStage::Direct,
            candidate: cleaned.clone(),
            error: "no JSON opening bracket found".to_string(),
        });
        return Err(fail(attempts));
    };
    let mut candidate = sliced.to_string();

    if let Some(value) = attempt(RepairStage::Direct, &candidate, &mut attempts) {
        return Ok(Extraction {
            value,
            stage: RepairStage::Direct,
        });
    }

    if let Some(fixed) = targeted_fix(&candidate) {
        if let Some(value) = attempt(RepairStage::TargetedFix, &fixed, &mut attempts) {
            return Ok(Extraction {
                value,
                stage: RepairStage::TargetedFix,
            });
        }
        candidate = fixed;
    }

    if let Some(prefix) = closed_prefix(&candidate) {
        if let Some(value) = attempt(RepairStage::ClosedPrefix, &prefix, &mut attempts) {
            return Ok(Extraction {
                value,
                stage: RepairStage::ClosedPrefix,
            });
        }
    }

    if let Some(balanced) = balance_closers(&candidate) {
        if let Some(value) = attempt(RepairStage::Balanced, &balanced, &mut attempts) {
            return Ok(Extraction {
                value,
                stage: RepairStage::Balanced,
            });
        }
    }

    Err(fail(attempts))
}

fn attempt(stage: RepairStage, candidate: &str, attempts: &mut Vec<RepairAttempt>) -> Option<Value> {
    match serde_json::from_str::<Value>(candidate) {
        Ok(v) => Some(v),
        Err(e) => {
            attempts.push(RepairAttempt {
                stage,
                candidate: candidate.to_string(),
                error: e.to_string(),
            });
            None
        }
    }
}

// ═══════════════════════════════════════════════════════════════════════
// Stages 1-3: cleanup
// ═══════════════════════════════════════════════════════════════════════

/// Remove markdown code-fence markers (```` ``` ```` with an optional
/// language tag) and trim the result.
pub fn strip_code_fences(text: &str) -> String {
    let mut out = String::with_capacity(text.len());
    let mut rest = text;
    while let Some(pos) = rest.find("```") {
        out.push_str(&rest[..pos]);
        rest = &rest[pos + 3..];
        let tag_len = rest
            .char_indices()
            .find(|(_, c)| !c.is_ascii_alphanumeric())
            .map(|(i, _)| i)
            .unwrap_or(rest.len());
        rest = rest[tag_len..].trim_start();
    }
    out.push_str(rest);
    out.trim().to_string()
}

/// Slice from the first plausible opening bracket to the last matching
/// closer.
///
/// Objects look for `{`..`}`; arrays accept `[`..`]` or `{`..`}`, whichever
/// comes first. An opener only counts when what follows it can start a
/// JSON value, so prose such as `[Message 1]` or `{name}` before the real
/// payload is skipped. When no closer follows the opener (truncated
/// output), the slice runs to the end of the text.
pub fn slice_candidate(text: &str, target: ExtractTarget) -> Option<&str> {
    let (start, open) = text.char_indices().find(|&(i, c)| {
        let wanted = match target {
            ExtractTarget::Object => c == '{',
            ExtractTarget::Array => c == '[' || c == '{',
        };
        wanted && opens_value(c, &text[i + c.len_utf8()..])
    })?;
    let close = closer_for(open)?;
    let end = text[start..]
        .rfind(close)
        .map(|i| start + i + close.len_utf8())
        .unwrap_or(text.len());
    Some(&text[start..end])
}

/// Whether `rest`, the text right after `open`, can continue a JSON value.
fn opens_value(open: char, rest: &str) -> bool {
    let rest = rest.trim_start();
    let Some(next) = rest.chars().next() else {
        return true;
    };
    match open {
        '{' => matches!(next, '"' | '}'),
        _ => match next {
            '{' | '[' | '"' | ']' | '-' => true,
            c if c.is_ascii_digit() => true,
            _ => {
                let word: String = rest.chars().take_while(|c| c.is_ascii_alphabetic()).collect();
                let cut_off = !word.is_empty() && word.len() == rest.len();
                ["true", "false", "null"]
                    .iter()
                    .any(|lit| word == *lit || (cut_off && lit.starts_with(word.as_str())))
            }
        },
    }
}

/// Replace typographic quotes with their ASCII equivalents.
pub fn normalize_quotes(text: &str) -> String {
    text.chars()
        .map(|c| match c {
            '\u{201C}' | '\u{201D}' | '\u{201E}' | '\u{201F}' | '\u{2033}' => '"',
            '\u{2018}' | '\u{2019}' | '\u{201A}' | '\u{201B}' | '\u{2032}' => '\'',
            other => other,
        })
        .collect()
}

// ═══════════════════════════════════════════════════════════════════════
// Stage 5: targeted fix at the error offset
// ═══════════════════════════════════════════════════════════════════════

/// Repair quote problems at the offsets the parser reports.
///
/// Two repairs are applied, depending on the characters around the
/// error offset:
///
/// - **unescaped quote**: a string closed early and the parser then found
///   ordinary text (`"he said "hi""`). The early quote is escaped.
/// - **missing comma**: a string value is directly followed by the next
///   key (`"a":"1" "b":2`). A comma is inserted after the closing quote.
///
/// Fixes repeat while each one moves the parser forward. Returns `None`
/// when no fix applies.
pub fn targeted_fix(candidate: &str) -> Option<String> {
    let mut current = candidate.to_string();
    let mut changed = false;

    for _ in 0..MAX_TARGETED_FIXES {
        let err = match serde_json::from_str::<Value>(&current) {
            Ok(_) => break,
            Err(e) => e,
        };
        if err.is_eof() {
            break;
        }
        let key_expected = err.to_string().starts_with("key must be a string");
        let Some(offset) = error_offset(&current, err.line(), err.column()) else {
            break;
        };
        match repair_at(&current, offset, key_expected) {
            Some(next) => {
                current = next;
                changed = true;
            }
            None => break,
        }
    }

    changed.then_some(current)
}

/// Byte offset of a 1-based (line, column) parser position.
fn error_offset(text: &str, line: usize, column: usize) -> Option<usize> {
    if line == 0 {
        return None;
    }
    let line_start = if line == 1 {
        0
    } else {
        text.match_indices('\n').nth(line - 2).map(|(i, _)| i + 1)?
    };
    let mut offset = (line_start + column.saturating_sub(1)).min(text.len());
    while !text.is_char_boundary(offset) {
        offset -= 1;
    }
    Some(offset)
}

fn next_non_ws(text: &str, from: usize) -> Option<(usize, char)> {
    text[from..]
        .char_indices()
        .find(|(_, c)| !c.is_whitespace())
        .map(|(i, c)| (from + i, c))
}

fn prev_non_ws(text: &str, before: usize) -> Option<(usize, char)> {
    text[..before]
        .char_indices()
        .rev()
        .find(|(_, c)| !c.is_whitespace())
}

fn escape_at(text: &str, quote: usize) -> String {
    format!("{}\\{}", &text[..quote], &text[quote..])
}

fn comma_after(text: &str, quote: usize) -> String {
    format!("{},{}", &text[..quote + 1], &text[quote + 1..])
}

fn repair_at(text: &str, offset: usize, key_expected: bool) -> Option<String> {
    let (cur_i, cur) = next_non_ws(text, offset)?;
    let (prev_i, prev) = prev_non_ws(text, cur_i)?;

    match (prev, cur) {
        ('"', '"') => {
            // `..."hi""}`: the quote before is an inner quote; the current
            // one closes the value. `"1" "b":` is a missing comma.
            let after = next_non_ws(text, cur_i + 1).map(|(_, c)| c);
            match after {
                None | Some(',') | Some('}') | Some(']') => Some(escape_at(text, prev_i)),
                _ => Some(comma_after(text, prev_i)),
            }
        }
        ('"', c) if !matches!(c, ',' | '}' | ']' | ':') => Some(escape_at(text, prev_i)),
        (',', c) if key_expected && c != '"' => {
            // `"he said \"hi", ok"`: the quote before the comma was inner.
            let (q_i, q) = prev_non_ws(text, prev_i)?;
            (q == '"').then(|| escape_at(text, q_i))
        }
        _ => None,
    }
}

// ═══════════════════════════════════════════════════════════════════════
// Stages 6-7: structural recovery
// ═══════════════════════════════════════════════════════════════════════

fn closer_for(c: char) -> Option<char> {
    match c {
        '{' => Some('}'),
        '[' => Some(']'),
        _ => None,
    }
}

/// Cut the candidate back to its deepest fully closed prefix.
///
/// Scans once, tracking a stack of open containers outside strings. If the
/// top-level container closes before the end of the text, the prefix up to
/// that point is returned (trailing text dropped). Otherwise the text is
/// cut right after the last container that did close, and the containers
/// still open at that point are closed. Returns `None` when neither applies.
pub fn closed_prefix(candidate: &str) -> Option<String> {
    let mut stack: Vec<char> = Vec::new();
    let mut in_string = false;
    let mut escaped = false;
    let mut last_close: Option<(usize, Vec<char>)> = None;

    for (i, c) in candidate.char_indices() {
        if in_string {
            if escaped {
                escaped = false;
            } else if c == '\\' {
                escaped = true;
            } else if c == '"' {
                in_string = false;
            }
            continue;
        }
        match c {
            '"' => in_string = true,
            '{' | '[' => stack.extend(closer_for(c)),
            '}' | ']' => {
                if stack.last() != Some(&c) {
                    break;
                }
                stack.pop();
                let end = i + c.len_utf8();
                if stack.is_empty() {
                    return (end < candidate.trim_end().len())
                        .then(|| candidate[..end].to_string());
                }
                last_close = Some((end, stack.clone()));
            }
            _ => {}
        }
    }

    let (end, open) = last_close?;
    let mut out = candidate[..end].to_string();
    out.extend(open.iter().rev());
    Some(out)
}

#[derive(Debug, Default)]
struct ScanState {
    stack: Vec<char>,
    in_string: bool,
    escaped: bool,
    string_start: usize,
    string_is_key: bool,
    /// Start of a completed key with no `:` after it yet.
    pending_key: Option<usize>,
    mismatch: bool,
}

fn scan(text: &str) -> ScanState {
    let mut st = ScanState::default();
    let mut prev_sig: Option<char> = None;

    for (i, c) in text.char_indices() {
        if st.in_string {
            if st.escaped {
                st.escaped = false;
            } else if c == '\\' {
                st.escaped = true;
            } else if c == '"' {
                st.in_string = false;
                if st.string_is_key {
                    st.pending_key = Some(st.string_start);
                }
                prev_sig = Some('"');
            }
            continue;
        }
        match c {
            '"' => {
                st.in_string = true;
                st.string_start = i;
                st.string_is_key =
                    st.stack.last() == Some(&'}') && matches!(prev_sig, Some('{') | Some(','));
            }
            '{' | '[' => st.stack.extend(closer_for(c)),
            '}' | ']' => {
                if st.stack.last() != Some(&c) {
                    st.mismatch = true;
                    return st;
                }
                st.stack.pop();
            }
            ':' => st.pending_key = None,
            _ => {}
        }
        if !c.is_whitespace() {
            prev_sig = Some(c);
        }
    }
    st
}

/// Drop trailing commas and partial literals; give a dangling `:` a value.
fn trim_dangling(s: &mut String) {
    loop {
        let len = s.trim_end().len();
        s.truncate(len);
        if s.ends_with(',') {
            s.pop();
            continue;
        }
        let run_start = s
            .char_indices()
            .rev()
            .take_while(|(_, c)| c.is_ascii_alphanumeric() || matches!(c, '.' | '+' | '-'))
            .last()
            .map(|(i, _)| i);
        if let Some(start) = run_start {
            if serde_json::from_str::<Value>(&s[start..]).is_err() {
                s.truncate(start);
                continue;
            }
        }
        break;
    }
    if s.ends_with(':') {
        s.push_str("null");
    }
}

/// Close everything the truncated candidate left open.
///
/// An unterminated string value is closed; an unterminated or dangling key
/// is dropped; trailing commas and partial literals are removed; then one
/// closer is appended for every container still open, innermost first.
/// Returns `None` when nothing is left open or the brackets are mismatched.
pub fn balance_closers(candidate: &str) -> Option<String> {
    let st = scan(candidate);
    if st.mismatch || st.stack.is_empty() {
        return None;
    }

    let mut s = candidate.to_string();
    if st.in_string {
        if st.string_is_key {
            s.truncate(st.string_start);
        } else {
            if st.escaped {
                s.pop();
            }
            s.push('"');
        }
    } else if let Some(key_start) = st.pending_key {
        s.truncate(key_start);
    }

    trim_dangling(&mut s);
    s.extend(st.stack.iter().rev());
    Some(s)
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn object(text: &str) -> Extraction {
        extract(text, ExtractTarget::Object, Some("stop")).expect("should recover")
    }

    #[test]
    fn fenced_json() {
        let text = "Here you go:\n```json\n{\"a\": 1, \"b\": [true]}\n```\nThanks!";
        let got = object(text);
        assert_eq!(got.value, json!({"a": 1, "b": [true]}));
        assert_eq!(got.stage, RepairStage::Direct);
        assert!(!got.was_repaired());
    }

    #[test]
    fn truncated_mid_array() {
        let got = extract("{\"a\":[1,2,", ExtractTarget::Object, Some("length")).unwrap();
        assert_eq!(got.value, json!({"a": [1, 2]}));
        assert_eq!(got.stage, RepairStage::Balanced);
    }

    #[test]
    fn unescaped_quote_in_value() {
        let got = object(r#"{"x":"he said "hi""}"#);
        assert_eq!(got.value, json!({"x": "he said \"hi\""}));
        assert_eq!(got.stage, RepairStage::TargetedFix);
    }

    #[test]
    fn unescaped_quote_followed_by_more_text() {
        let got = object(r#"{"x":"he said "hi", ok"}"#);
        assert_eq!(got.value["x"], "he said \"hi\", ok");
    }

    #[test]
    fn missing_comma_between_members() {
        let got = object("{\"a\":\"1\"\n\"b\":\"2\"}");
        assert_eq!(got.value, json!({"a": "1", "b": "2"}));
    }

    #[test]
    fn smart_quotes() {
        let got = object("{\u{201C}a\u{201D}: \u{201C}b\u{201D}}");
        assert_eq!(got.value, json!({"a": "b"}));
    }

    #[test]
    fn trailing_prose_after_object() {
        let got = object("{\"a\":1} and then {\"b\":");
        assert_eq!(got.value, json!({"a": 1}));
        assert_eq!(got.stage, RepairStage::Direct);
    }

    #[test]
    fn second_object_is_cut_off() {
        let got = object("{\"a\":1} {\"b\":2}");
        assert_eq!(got.value, json!({"a": 1}));
        assert_eq!(got.stage, RepairStage::ClosedPrefix);
    }

    #[test]
    fn echoed_labels_before_array_are_skipped() {
        let text = "Labels for [Message 1] and [Message 2]:\n[{\"importance\":\"high\"},{\"importance\":\"low\"}]";
        let got = extract(text, ExtractTarget::Array, Some("stop")).unwrap();
        assert_eq!(got.value.as_array().map(Vec::len), Some(2));
        assert_eq!(got.stage, RepairStage::Direct);

        let got = object("Summary for {chat name}: {\"a\": true}");
        assert_eq!(got.value, json!({"a": true}));
    }

    #[test]
    fn truncated_inside_second_element() {
        let text = r#"{"topicHighlights":[{"title":"a","summary":"b"},{"title":"c","summ"#;
        let got = extract(text, ExtractTarget::Object, Some("length")).unwrap();
        let topics = got.value["topicHighlights"].as_array().unwrap();
        assert_eq!(topics[0]["title"], "a");
    }

    #[test]
    fn truncated_in_string_value() {
        let got = extract(r#"{"a":"partial val"#, ExtractTarget::Object, None).unwrap();
        assert_eq!(got.value, json!({"a": "partial val"}));
    }

    #[test]
    fn truncated_partial_literal_and_key() {
        assert_eq!(balance_closers(r#"{"a":tru"#).unwrap(), r#"{"a":null}"#);
        assert_eq!(balance_closers(r#"{"a":1,"ke"#).unwrap(), r#"{"a":1}"#);
        assert_eq!(balance_closers(r#"{"a":1,"key""#).unwrap(), r#"{"a":1}"#);
        assert_eq!(balance_closers(r#"[1,2.5"#).unwrap(), "[1,2.5]");
        assert!(balance_closers("{}").is_none());
    }

    #[test]
    fn array_target_accepts_wrapper() {
        let got = extract(
            "```\n[{\"importance\":\"high\"},{\"importance\":\"low\"}]\n```",
            ExtractTarget::Array,
            None,
        )
        .unwrap();
        assert_eq!(got.value.as_array().unwrap().len(), 2);

        let wrapped = extract("{\"results\":[{}]}", ExtractTarget::Array, None).unwrap();
        assert_eq!(wrapped.value, json!({"results": [{}]}));

        let bare = extract("Result: [true, null]", ExtractTarget::Array, None).unwrap();
        assert_eq!(bare.value, json!([true, null]));
    }

    #[test]
    fn failure_keeps_diagnostics() {
        let err = extract("I could not do that, sorry.", ExtractTarget::Object, Some("stop"))
            .unwrap_err();
        assert_eq!(err.original, "I could not do that, sorry.");
        assert_eq!(err.finish_reason.as_deref(), Some("stop"));
        assert!(!err.attempts.is_empty());
        assert!(!err.was_truncated());

        let err = extract("{\"a\": ]", ExtractTarget::Object, Some("length")).unwrap_err();
        assert!(err.was_truncated());
        assert!(err.last_error().is_some());
        assert!(err.to_string().contains("length"));
    }

    #[test]
    fn stabilized_output_is_idempotent() {
        let inputs = [
            "```json\n{\"a\":[1,2,",
            r#"{"x":"he said "hi""}"#,
            "{\"a\":\"1\" \"b\":{\"c\":[true,null,",
            "{\"k\":\u{201C}v\u{201D}}",
            r#"{"topicHighlights":[{"title":"a"},{"ti"#,
        ];
        for input in inputs {
            let first = object(input).value;
            let reserialized = serde_json::to_string(&first).unwrap();
            let second = object(&reserialized);
            assert_eq!(second.value, first, "input: {}", input);
            assert_eq!(second.stage, RepairStage::Direct);
        }
    }

    #[test]
    fn strip_fences_keeps_content() {
        assert_eq!(strip_code_fences("```json\n{}\n```"), "{}");
        assert_eq!(strip_code_fences("no fences"), "no fences");
    }

    #[test]
    fn slice_without_closer_runs_to_end() {
        assert_eq!(
            slice_candidate("x {\"a\":[1", ExtractTarget::Object),
            Some("{\"a\":[1")
        );
        assert_eq!(slice_candidate("none", ExtractTarget::Object), None);
        assert_eq!(
            slice_candidate("see [note] then [1, 2]", ExtractTarget::Array),
            Some("[1, 2]")
        );
        assert_eq!(slice_candidate("[", ExtractTarget::Array), Some("["));
    }
}
