use anyhow::{Result, anyhow};
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::HashMap;
use std::sync::Arc;
use tracing::warn;

use super::chart::infer_chart;
use crate::core::confidence::ConfidenceAssessment;
use crate::core::dataset::{DATASET_TABLE, Row, Schema};
use crate::core::llm::{ChatMessage, LlmProvider, extract_json_block, strip_code_fence};

pub const GENERATE_SQL: &str = "generate_sql";
pub const VISUALIZE: &str = "visualize";
pub const SYNTHESIZE: &str = "synthesize";

/// Rows shown to the model when asking for SQL or a narrative.
const PROMPT_ROWS: usize = 20;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ChartSpec {
    pub title: String,
    #[serde(rename = "type")]
    pub widget_type: String,
    #[serde(default)]
    pub config: Value,
}

#[derive(Debug, Clone)]
pub struct SqlRequest {
    pub user_prompt: String,
    pub schema: Schema,
    pub sample: Vec<Row>,
    /// Why the previous pass was rejected, if it was.
    pub feedback: Option<String>,
}

#[derive(Debug, Clone)]
pub struct ChartRequest {
    pub user_prompt: String,
    pub sql: String,
    pub rows: Vec<Row>,
    pub target_type: Option<String>,
    /// Present when restyling an existing widget.
    pub current: Option<ChartSpec>,
}

#[derive(Debug, Clone)]
pub struct NarrativeRequest {
    pub user_prompt: String,
    pub rows: Vec<Row>,
    pub chart: Option<ChartSpec>,
    pub assessment: ConfidenceAssessment,
    pub feedback: Option<String>,
}

#[derive(Debug, Clone)]
pub enum StepInput {
    GenerateSql(SqlRequest),
    Visualize(ChartRequest),
    Synthesize(NarrativeRequest),
}

#[derive(Debug, Clone, PartialEq)]
pub enum StepOutput {
    Sql(String),
    Chart(ChartSpec),
    Narrative(String),
}

impl StepOutput {
    pub fn kind(&self) -> &'static str {
        match self {
            StepOutput::Sql(_) => "sql",
            StepOutput::Chart(_) => "chart",
            StepOutput::Narrative(_) => "narrative",
        }
    }
}

/// One step of the pipeline, selected by name from a [`HandlerTable`].
#[async_trait]
pub trait StepHandler: Send + Sync {
    async fn run(&self, input: StepInput) -> Result<StepOutput>;
}

#[async_trait]
impl<F> StepHandler for F
where
    F: Fn(StepInput) -> Result<StepOutput> + Send + Sync,
{
    async fn run(&self, input: StepInput) -> Result<StepOutput> {
        (self)(input)
    }
}

pub type HandlerTable = HashMap<String, Arc<dyn StepHandler>>;

/// Model-backed handlers for all three steps.
pub fn default_handlers(llm: Arc<dyn LlmProvider>) -> HandlerTable {
    let mut table: HandlerTable = HashMap::new();
    table.insert(
        GENERATE_SQL.to_string(),
        Arc::new(SqlGenerator { llm: llm.clone() }),
    );
    table.insert(
        VISUALIZE.to_string(),
        Arc::new(ChartDesigner { llm: llm.clone() }),
    );
    table.insert(SYNTHESIZE.to_string(), Arc::new(Narrator { llm }));
    table
}

fn wrong_input(step: &str, input: &StepInput) -> anyhow::Error {
    let got = match input {
        StepInput::GenerateSql(_) => GENERATE_SQL,
        StepInput::Visualize(_) => VISUALIZE,
        StepInput::Synthesize(_) => SYNTHESIZE,
    };
    anyhow!("{} handler received {} input", step, got)
}

fn rows_preview(rows: &[Row]) -> String {
    let shown: Vec<&Row> = rows.iter().take(PROMPT_ROWS).collect();
    serde_json::to_string(&shown).unwrap_or_default()
}

/// Trim fences, whitespace and trailing statement terminators.
pub(crate) fn clean_sql(raw: &str) -> String {
    strip_code_fence(raw)
        .trim()
        .trim_end_matches(|c: char| c == ';' || c.is_whitespace())
        .to_string()
}

struct SqlGenerator {
    llm: Arc<dyn LlmProvider>,
}

#[async_trait]
impl StepHandler for SqlGenerator {
    async fn run(&self, input: StepInput) -> Result<StepOutput> {
        let req = match input {
            StepInput::GenerateSql(req) => req,
            other => return Err(wrong_input(GENERATE_SQL, &other)),
        };
        let columns = req
            .schema
            .iter()
            .map(|(name, ty)| format!("- {} ({})", name, ty))
            .collect::<Vec<_>>()
            .join("\n");
        let mut prompt = format!(
            "Question: {}\n\nTable `{}` columns:\n{}\n\nSample rows: {}",
            req.user_prompt,
            DATASET_TABLE,
            columns,
            rows_preview(&req.sample)
        );
        if let Some(feedback) = &req.feedback {
            prompt.push_str(&format!("\n\nThe previous attempt was rejected: {}", feedback));
        }
        let messages = [
            ChatMessage::system(format!(
                "You write one SQLite SELECT statement over the table `{}` that answers the \
                 user's question. Reply with the SQL only: no explanation, no comments, no \
                 trailing semicolon.",
                DATASET_TABLE
            )),
            ChatMessage::user(prompt),
        ];
        let reply = self.llm.generate(&messages).await?;
        let sql = clean_sql(&reply);
        if sql.is_empty() {
            return Err(anyhow!("model returned no SQL"));
        }
        Ok(StepOutput::Sql(sql))
    }
}

struct ChartDesigner {
    llm: Arc<dyn LlmProvider>,
}

#[async_trait]
impl StepHandler for ChartDesigner {
    async fn run(&self, input: StepInput) -> Result<StepOutput> {
        let req = match input {
            StepInput::Visualize(req) => req,
            other => return Err(wrong_input(VISUALIZE, &other)),
        };
        let mut prompt = format!(
            "Request: {}\nSQL: {}\nRows: {}",
            req.user_prompt,
            req.sql,
            rows_preview(&req.rows)
        );
        if let Some(current) = &req.current {
            prompt.push_str(&format!(
                "\nCurrent chart: {}",
                serde_json::to_string(current)?
            ));
        }
        if let Some(target) = &req.target_type {
            prompt.push_str(&format!("\nThe chart type must be '{}'.", target));
        }
        let messages = [
            ChatMessage::system(
                "You design dashboard charts. Reply with JSON only: {\"title\": \"...\", \
                 \"type\": \"bar|line|pie|scatter|area|table|kpi\", \"config\": {\"xKey\": \
                 \"...\", \"yKeys\": [\"...\"], \"colors\": [\"...\"]}}",
            ),
            ChatMessage::user(prompt),
        ];
        let reply = self.llm.generate(&messages).await?;
        let parsed = extract_json_block(&reply)
            .and_then(|block| serde_json::from_str::<ChartSpec>(block).ok());
        let mut spec = match parsed {
            Some(spec) => spec,
            None => {
                warn!("Chart designer reply was not a chart spec, inferring one");
                match req.current {
                    Some(current) => current,
                    None => infer_chart(&req.user_prompt, &req.rows, None),
                }
            }
        };
        if let Some(target) = req.target_type {
            spec.widget_type = target;
        }
        Ok(StepOutput::Chart(spec))
    }
}

struct Narrator {
    llm: Arc<dyn LlmProvider>,
}

#[async_trait]
impl StepHandler for Narrator {
    async fn run(&self, input: StepInput) -> Result<StepOutput> {
        let req = match input {
            StepInput::Synthesize(req) => req,
            other => return Err(wrong_input(SYNTHESIZE, &other)),
        };
        if !req.assessment.passes_gate() {
            return Ok(StepOutput::Narrative(clarification_answer(&req.assessment)));
        }
        let mut prompt = format!(
            "Question: {}\nResult rows ({} total): {}",
            req.user_prompt,
            req.rows.len(),
            rows_preview(&req.rows)
        );
        if let Some(chart) = &req.chart {
            prompt.push_str(&format!(
                "\nShown as a {} chart titled '{}'.",
                chart.widget_type, chart.title
            ));
        }
        if let Some(feedback) = &req.feedback {
            prompt.push_str(&format!("\nYour previous answer was rejected: {}", feedback));
        }
        let messages = [
            ChatMessage::system(
                "You are a data analyst. In two to four sentences, answer the question from the \
                 result rows and point out the most notable figures.",
            ),
            ChatMessage::user(prompt),
        ];
        match self.llm.generate(&messages).await {
            Ok(text) if !text.trim().is_empty() => {
                Ok(StepOutput::Narrative(text.trim().to_string()))
            }
            Ok(_) => Ok(StepOutput::Narrative(templated_summary(&req))),
            Err(e) => {
                warn!("Narrator unavailable, using templated summary: {}", e);
                Ok(StepOutput::Narrative(templated_summary(&req)))
            }
        }
    }
}

fn templated_summary(req: &NarrativeRequest) -> String {
    let n = req.rows.len();
    let plural = if n == 1 { "" } else { "s" };
    match &req.chart {
        Some(chart) => format!(
            "Here is \"{}\" for your question \"{}\", based on {} result row{}.",
            chart.title, req.user_prompt, n, plural
        ),
        None => format!(
            "I ran the analysis for \"{}\" and found {} result row{}.",
            req.user_prompt, n, plural
        ),
    }
}

/// Answer used below the confidence threshold: says more information is needed
/// and lists the follow-up questions.
pub fn clarification_answer(assessment: &ConfidenceAssessment) -> String {
    let mut out = String::from(
        "I need more information before I can answer this reliably, so I haven't built a chart yet.",
    );
    if !assessment.reasoning.trim().is_empty() {
        out.push_str(&format!(" ({})", assessment.reasoning.trim()));
    }
    out.push_str("\n\nCould you help me with the following?");
    for (i, q) in assessment.follow_up_questions.iter().enumerate() {
        out.push_str(&format!("\n{}. {}", i + 1, q));
    }
    out
}
