//! Analysis orchestration: SQL generation, the confidence gate, visualization
//! and narrative synthesis for one task.

mod chart;
mod coordinator;
mod intent;
mod steps;
mod validate;

pub use chart::infer_chart;
pub use coordinator::{Coordinator, CoordinatorSettings};
pub use intent::is_formatting_request;
pub use steps::{
    ChartRequest, ChartSpec, GENERATE_SQL, HandlerTable, NarrativeRequest, SYNTHESIZE,
    SqlRequest, StepHandler, StepInput, StepOutput, VISUALIZE, clarification_answer,
    default_handlers,
};

use serde::Serialize;
use thiserror::Error;

use crate::core::confidence::ConfidenceAssessment;
use crate::core::dataset::Row;
use crate::core::sql_guard::{GuardRejection, GuardedSql};
use crate::core::widgets::WidgetChange;

/// Where the data for a task comes from.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Routing {
    Dashboard { dashboard_id: String },
    /// Legacy upload-scoped route. Results are returned inline, no widget is stored.
    File { file_id: String },
}

impl Routing {
    pub fn dashboard_id(&self) -> Option<&str> {
        match self {
            Routing::Dashboard { dashboard_id } => Some(dashboard_id),
            Routing::File { .. } => None,
        }
    }
}

/// Normalized task, decoded once at intake.
#[derive(Debug, Clone, PartialEq)]
pub struct AnalysisRequest {
    pub job_id: String,
    pub chat_id: String,
    pub request_id: String,
    pub routing: Routing,
    pub user_prompt: String,
    pub context_widget_ids: Vec<String>,
    pub target_widget_type: Option<String>,
}

#[derive(Debug, Clone, Serialize)]
pub struct AnalysisOutcome {
    pub answer: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub sql: Option<GuardedSql>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub chart: Option<ChartSpec>,
    /// Result rows, only when no widget holds them.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub data: Option<Vec<Row>>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub confidence: Option<ConfidenceAssessment>,
    pub follow_up_questions: Vec<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub widget_id: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub widget_change: Option<WidgetChange>,
    pub attempts: usize,
}

impl AnalysisOutcome {
    pub(crate) fn answer_only(answer: impl Into<String>) -> Self {
        Self {
            answer: answer.into(),
            sql: None,
            chart: None,
            data: None,
            confidence: None,
            follow_up_questions: Vec::new(),
            widget_id: None,
            widget_change: None,
            attempts: 0,
        }
    }
}

#[derive(Debug, Error)]
pub enum AnalysisError {
    #[error(transparent)]
    UnsafeSql(#[from] GuardRejection),
    #[error("Output contract violated after {attempts} attempts: {reason}")]
    OutputContract { attempts: usize, reason: String },
    #[error("No handler registered for step '{0}'")]
    MissingHandler(&'static str),
    #[error("Step '{step}' returned {got} output")]
    UnexpectedOutput { step: &'static str, got: &'static str },
    #[error("Step '{step}' failed: {cause}")]
    Step {
        step: &'static str,
        cause: anyhow::Error,
    },
    #[error("Dataset error: {0}")]
    Dataset(anyhow::Error),
    #[error("Store error: {0}")]
    Store(anyhow::Error),
}

#[cfg(test)]
pub(crate) mod tests;
