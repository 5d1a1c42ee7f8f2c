use anyhow::Result;
use async_trait::async_trait;
use regex::Regex;
use serde::{Deserialize, Serialize};
use std::sync::{Arc, LazyLock};
use tracing::{debug, warn};

use crate::core::dataset::Schema;
use crate::core::llm::{ChatMessage, LlmProvider, extract_json_block};

/// Below this score visualization is skipped and follow-up questions are required.
pub const CONFIDENCE_THRESHOLD: u8 = 50;
pub const MIN_FOLLOW_UPS: usize = 2;
const BASE_SCORE: i32 = 50;

static SELECT_FROM: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"(?is)\bSELECT\b.+\bFROM\b").expect("valid regex"));
static AGGREGATE: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"(?i)\b(SUM|AVG|COUNT|MIN|MAX|TOTAL|GROUP_CONCAT)\s*\(").expect("valid regex")
});
static GROUP_BY: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"(?i)\bGROUP\s+BY\b").expect("valid regex"));
static SELECT_STAR: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"(?i)\bSELECT\s+\*").expect("valid regex"));
static DATE_FUNCTION: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"(?i)\b(STRFTIME|DATE|DATETIME|JULIANDAY|DATE_TRUNC|EXTRACT|YEAR|MONTH|WEEK|DAY)\s*\(")
        .expect("valid regex")
});
static TEMPORAL_PROMPT: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(
        r"(?i)\b(day|daily|week|weekly|month|monthly|quarter|quarterly|year|yearly|annual|date|trend|over time|since|timeline)\b",
    )
    .expect("valid regex")
});
static GROUPING_PROMPT: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"(?i)\b(by|per|each|breakdown)\b").expect("valid regex"));
static AGGREGATE_PROMPT: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"(?i)\b(total|sum|average|avg|mean|count|how many|number of)\b")
        .expect("valid regex")
});

/// Point deltas applied to the base score of 50.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ConfidenceWeights {
    pub select_from: i32,
    pub missing_select_from: i32,
    pub aggregate_grouped: i32,
    pub aggregate_ungrouped: i32,
    pub missing_aggregate: i32,
    pub column_overlap: i32,
    pub no_column_overlap: i32,
    pub temporal_handled: i32,
    pub temporal_missing: i32,
    pub select_star: i32,
}

impl Default for ConfidenceWeights {
    fn default() -> Self {
        Self {
            select_from: 20,
            missing_select_from: -30,
            aggregate_grouped: 10,
            aggregate_ungrouped: -15,
            missing_aggregate: -15,
            column_overlap: 15,
            no_column_overlap: -20,
            temporal_handled: 10,
            temporal_missing: -15,
            select_star: -5,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ConfidenceAssessment {
    pub score: u8,
    pub reasoning: String,
    pub issues: Vec<String>,
    pub follow_up_questions: Vec<String>,
}

impl ConfidenceAssessment {
    /// Build an assessment from a raw score, clamping and filling follow-ups.
    pub fn new(raw_score: i64, reasoning: impl Into<String>, issues: Vec<String>) -> Self {
        let score = raw_score.clamp(0, 100) as u8;
        let follow_up_questions = if score < CONFIDENCE_THRESHOLD {
            follow_ups_for(&issues)
        } else {
            Vec::new()
        };
        Self {
            score,
            reasoning: reasoning.into(),
            issues,
            follow_up_questions,
        }
    }

    pub fn passes_gate(&self) -> bool {
        self.score >= CONFIDENCE_THRESHOLD
    }
}

#[async_trait]
pub trait ConfidenceScorer: Send + Sync {
    async fn score(&self, user_prompt: &str, sql: &str, schema: &Schema)
    -> ConfidenceAssessment;
}

#[derive(Debug, Clone, Default)]
pub struct HeuristicScorer {
    weights: ConfidenceWeights,
}

impl HeuristicScorer {
    pub fn new(weights: ConfidenceWeights) -> Self {
        Self { weights }
    }

    pub fn assess(&self, user_prompt: &str, sql: &str, schema: &Schema) -> ConfidenceAssessment {
        let w = &self.weights;
        let mut score = BASE_SCORE;
        let mut notes = Vec::new();
        let mut issues = Vec::new();

        if SELECT_FROM.is_match(sql) {
            score += w.select_from;
            notes.push("query selects from the dataset");
        } else {
            score += w.missing_select_from;
            issues.push("missing_select_from".to_string());
        }

        let has_aggregate = AGGREGATE.is_match(sql);
        if has_aggregate {
            if GROUP_BY.is_match(sql) {
                score += w.aggregate_grouped;
                notes.push("aggregation is grouped");
            } else if GROUPING_PROMPT.is_match(user_prompt) {
                score += w.aggregate_ungrouped;
                issues.push("aggregate_ungrouped".to_string());
            }
        } else if AGGREGATE_PROMPT.is_match(user_prompt) {
            score += w.missing_aggregate;
            issues.push("missing_aggregate".to_string());
        }

        let sql_lower = sql.to_lowercase();
        let referenced = schema
            .iter()
            .filter(|(col, _)| mentions_identifier(&sql_lower, &col.to_lowercase()))
            .count();
        if referenced > 0 {
            score += w.column_overlap;
            notes.push("references known columns");
        } else {
            score += w.no_column_overlap;
            issues.push("no_column_overlap".to_string());
        }

        if TEMPORAL_PROMPT.is_match(user_prompt) {
            if DATE_FUNCTION.is_match(sql) {
                score += w.temporal_handled;
                notes.push("handles dates");
            } else {
                score += w.temporal_missing;
                issues.push("temporal_missing".to_string());
            }
        }

        if SELECT_STAR.is_match(sql) {
            score += w.select_star;
            issues.push("select_star".to_string());
        }

        let mut reasoning = notes.join("; ");
        if !issues.is_empty() {
            if !reasoning.is_empty() {
                reasoning.push_str("; ");
            }
            reasoning.push_str("concerns: ");
            reasoning.push_str(&issues.join(", "));
        }
        debug!("Heuristic confidence {} ({})", score, reasoning);
        ConfidenceAssessment::new(score as i64, reasoning, issues)
    }
}

#[async_trait]
impl ConfidenceScorer for HeuristicScorer {
    async fn score(&self, user_prompt: &str, sql: &str, schema: &Schema) -> ConfidenceAssessment {
        self.assess(user_prompt, sql, schema)
    }
}

fn mentions_identifier(haystack: &str, ident: &str) -> bool {
    if ident.is_empty() {
        return false;
    }
    haystack.match_indices(ident).any(|(i, _)| {
        let before = haystack[..i].chars().next_back();
        let after = haystack[i + ident.len()..].chars().next();
        let boundary = |c: Option<char>| c.is_none_or(|c| !(c.is_alphanumeric() || c == '_'));
        boundary(before) && boundary(after)
    })
}

fn question_for(issue: &str) -> Option<&'static str> {
    match issue {
        "missing_select_from" => {
            Some("Which part of your data should this question be answered from?")
        }
        "aggregate_ungrouped" => {
            Some("How should the results be grouped, for example by region or by product?")
        }
        "missing_aggregate" => {
            Some("Should the values be totalled, averaged or counted?")
        }
        "no_column_overlap" => {
            Some("Which columns in your dataset hold the values you are asking about?")
        }
        "temporal_missing" => {
            Some("Which date column and time period (day, month, year) should be used?")
        }
        "select_star" => Some("Which specific fields would you like to see?"),
        _ => None,
    }
}

const GENERIC_QUESTIONS: &[&str] = &[
    "Could you describe the metric you want to see in more detail?",
    "Is there a specific time range or filter that should apply?",
    "How would you like the results broken down?",
];

fn follow_ups_for(issues: &[String]) -> Vec<String> {
    let mut out: Vec<String> = Vec::new();
    for issue in issues {
        let q = question_for(issue).map(str::to_string).unwrap_or_else(|| {
            if issue.ends_with('?') {
                issue.clone()
            } else {
                format!("Could you clarify: {}?", issue.trim_end_matches('.'))
            }
        });
        if !out.contains(&q) {
            out.push(q);
        }
    }
    for q in GENERIC_QUESTIONS {
        if out.len() >= MIN_FOLLOW_UPS {
            break;
        }
        if !out.iter().any(|o| o == q) {
            out.push(q.to_string());
        }
    }
    out
}

#[derive(Deserialize)]
struct LlmVerdict {
    #[serde(default)]
    score: serde_json::Value,
    #[serde(default)]
    reasoning: String,
    #[serde(default)]
    issues: Vec<String>,
}

const SCORER_PROMPT: &str = "You review SQL written for a data question. Reply with JSON only: \
{\"score\": <0-100>, \"reasoning\": \"<one sentence>\", \"issues\": [\"<short issue>\", ...]}. \
Score how well the SQL answers the question using the given columns.";

/// Delegates scoring to the text-completion model, falling back to the heuristic.
pub struct LlmScorer {
    llm: Arc<dyn LlmProvider>,
    fallback: HeuristicScorer,
}

impl LlmScorer {
    pub fn new(llm: Arc<dyn LlmProvider>, fallback: HeuristicScorer) -> Self {
        Self { llm, fallback }
    }
}

pub(crate) fn coerce_score(value: &serde_json::Value) -> Option<i64> {
    match value {
        serde_json::Value::Number(n) => n
            .as_i64()
            .or_else(|| n.as_f64().map(|f| f.round() as i64)),
        serde_json::Value::String(s) => s
            .trim()
            .trim_end_matches('%')
            .parse::<f64>()
            .ok()
            .map(|f| f.round() as i64),
        _ => None,
    }
}

#[async_trait]
impl ConfidenceScorer for LlmScorer {
    async fn score(&self, user_prompt: &str, sql: &str, schema: &Schema) -> ConfidenceAssessment {
        let columns = schema
            .iter()
            .map(|(c, t)| format!("{} ({})", c, t))
            .collect::<Vec<_>>()
            .join(", ");
        let messages = [
            ChatMessage::system(SCORER_PROMPT),
            ChatMessage::user(format!(
                "Question: {}\nColumns: {}\nSQL: {}",
                user_prompt, columns, sql
            )),
        ];
        let reply = match self.llm.generate(&messages).await {
            Ok(r) => r,
            Err(e) => {
                warn!("LLM scorer unavailable, using heuristic: {}", e);
                return self.fallback.assess(user_prompt, sql, schema);
            }
        };
        let verdict = extract_json_block(&reply)
            .and_then(|block| serde_json::from_str::<LlmVerdict>(block).ok());
        match verdict.and_then(|v| coerce_score(&v.score).map(|s| (s, v))) {
            Some((score, v)) => ConfidenceAssessment::new(score, v.reasoning, v.issues),
            None => {
                warn!("LLM scorer reply was not a verdict, using heuristic");
                self.fallback.assess(user_prompt, sql, schema)
            }
        }
    }
}
