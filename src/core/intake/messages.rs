use crate::core::analysis::AnalysisOutcome;
use crate::core::store::now_ms;
use crate::core::store::types::ChatMessageRecord;

const MAX_DETAIL_CHARS: usize = 200;

const ENCODING_MARKERS: &[&str] = &["encoding", "utf-8", "utf8", "codec"];
const NOT_FOUND_MARKERS: &[&str] = &["not found", "no such file"];
const RATE_LIMIT_MARKERS: &[&str] = &["rate limit", "429", "quota", "too many requests"];
const TIMEOUT_MARKERS: &[&str] = &["timed out", "timeout"];
const UNDERSTANDING_MARKERS: &[&str] = &["could not understand", "couldn't understand", "sql"];

/// User-facing text for a failed task. Never echoes more than a short excerpt
/// of the raw error.
pub fn categorize_error(error_text: &str) -> String {
    let lower = error_text.to_lowercase();
    let matches = |markers: &[&str]| markers.iter().any(|m| lower.contains(m));

    if matches(ENCODING_MARKERS) {
        "I had trouble reading the file encoding. Please save the file as UTF-8 and upload it again."
            .to_string()
    } else if matches(NOT_FOUND_MARKERS) {
        "I could not find the data file for this request. Please upload your data again."
            .to_string()
    } else if matches(RATE_LIMIT_MARKERS) {
        "The analysis service is busy right now, please try again shortly.".to_string()
    } else if matches(TIMEOUT_MARKERS) {
        "That analysis took too long to run. Try narrowing your question, for example to fewer rows or a shorter period."
            .to_string()
    } else if matches(UNDERSTANDING_MARKERS) {
        "I couldn't understand the request well enough to build a safe query, try rephrasing your question."
            .to_string()
    } else {
        format!(
            "Something went wrong while analysing your request: {}",
            truncate(error_text, MAX_DETAIL_CHARS)
        )
    }
}

fn truncate(text: &str, max: usize) -> String {
    if text.chars().count() <= max {
        return text.to_string();
    }
    let mut out: String = text.chars().take(max).collect();
    out.push_str("...");
    out
}

pub(crate) fn answer_message(outcome: &AnalysisOutcome, request_id: &str) -> ChatMessageRecord {
    ChatMessageRecord {
        role: "assistant".to_string(),
        content: outcome.answer.clone(),
        created_at: now_ms(),
        request_id: Some(request_id.to_string()),
        error: false,
        chart_id: outcome.widget_id.clone(),
    }
}

pub(crate) fn error_message(error_text: &str, request_id: &str) -> ChatMessageRecord {
    ChatMessageRecord {
        role: "assistant".to_string(),
        content: categorize_error(error_text),
        created_at: now_ms(),
        request_id: Some(request_id.to_string()),
        error: true,
        chart_id: None,
    }
}
