use super::steps::ChartSpec;
use crate::core::confidence::{ConfidenceAssessment, MIN_FOLLOW_UPS};
use crate::core::dataset::Row;
use crate::core::sql_guard::GuardedSql;

const MORE_INFORMATION_PHRASES: &[&str] = &[
    "more information",
    "more detail",
    "more context",
    "need to know",
    "clarif",
];

/// Result of one coordinator pass, before anything is persisted.
#[derive(Debug, Clone)]
pub(crate) struct AnalysisPass {
    pub answer: String,
    pub sql: GuardedSql,
    pub assessment: ConfidenceAssessment,
    pub chart: Option<ChartSpec>,
    pub rows: Vec<Row>,
}

fn states_more_information(answer: &str) -> bool {
    let lower = answer.to_lowercase();
    MORE_INFORMATION_PHRASES.iter().any(|p| lower.contains(p))
}

/// Check the answer contract. The error is the reason, fed back into the next pass.
pub(crate) fn validate_pass(pass: &AnalysisPass, min_answer_chars: usize) -> Result<(), String> {
    let len = pass.answer.trim().chars().count();
    if len < min_answer_chars {
        return Err(format!(
            "answer is {} characters, at least {} are required",
            len, min_answer_chars
        ));
    }
    if pass.assessment.passes_gate() {
        return Ok(());
    }
    if pass.assessment.follow_up_questions.len() < MIN_FOLLOW_UPS {
        return Err(format!(
            "confidence {} is below the threshold but only {} follow-up questions were given",
            pass.assessment.score,
            pass.assessment.follow_up_questions.len()
        ));
    }
    if !states_more_information(&pass.answer) {
        return Err("low-confidence answer must say that more information is needed".to_string());
    }
    if pass.chart.is_some() {
        return Err("low-confidence answer must not include a visualization".to_string());
    }
    Ok(())
}
