use std::path::Path;
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, info, warn};

use super::steps::{
    ChartRequest, ChartSpec, GENERATE_SQL, HandlerTable, NarrativeRequest, SYNTHESIZE, SqlRequest,
    StepInput, StepOutput, VISUALIZE,
};
use super::validate::{AnalysisPass, validate_pass};
use super::{AnalysisError, AnalysisOutcome, AnalysisRequest, Routing, is_formatting_request};
use crate::core::config::AppConfig;
use crate::core::confidence::ConfidenceScorer;
use crate::core::dataset::{DatasetEngine, Row, Schema};
use crate::core::jobs::{JobStatus, JobTracker};
use crate::core::sql_guard::{GuardedSql, guard};
use crate::core::store::types::WidgetRecord;
use crate::core::store::{NewWidget, Store, WidgetVisual};
use crate::core::widgets::{self, WidgetChange};

const SAMPLE_ROWS: usize = 5;

pub(crate) const UPLOAD_ANSWER: &str = "I couldn't find any data for this dashboard yet. \
Please upload a CSV file and ask your question again.";

#[derive(Debug, Clone)]
pub struct CoordinatorSettings {
    pub max_attempts: usize,
    pub row_limit: usize,
    pub min_answer_chars: usize,
    pub plan_timeout: Duration,
    pub query_timeout: Duration,
}

impl CoordinatorSettings {
    pub fn from_config(cfg: &AppConfig) -> Self {
        Self {
            max_attempts: cfg.analysis.max_attempts,
            row_limit: cfg.analysis.row_limit,
            min_answer_chars: cfg.analysis.min_answer_chars,
            plan_timeout: Duration::from_millis(cfg.store.op_timeout_ms.saturating_mul(10)),
            query_timeout: Duration::from_millis(cfg.analysis.query_timeout_ms),
        }
    }
}

/// Runs the analysis pipeline for one task. Steps run one after another;
/// each is looked up by name in the handler table.
pub struct Coordinator {
    store: Store,
    tracker: JobTracker,
    handlers: HandlerTable,
    scorer: Arc<dyn ConfidenceScorer>,
    settings: CoordinatorSettings,
}

impl Coordinator {
    pub fn new(
        store: Store,
        tracker: JobTracker,
        handlers: HandlerTable,
        scorer: Arc<dyn ConfidenceScorer>,
        settings: CoordinatorSettings,
    ) -> Result<Self, AnalysisError> {
        for step in [GENERATE_SQL, VISUALIZE, SYNTHESIZE] {
            if !handlers.contains_key(step) {
                return Err(AnalysisError::MissingHandler(step));
            }
        }
        Ok(Self {
            store,
            tracker,
            handlers,
            scorer,
            settings,
        })
    }

    pub async fn run(&self, req: &AnalysisRequest) -> Result<AnalysisOutcome, AnalysisError> {
        self.progress(&req.job_id, 10).await?;

        let Some(engine) = self.open_dataset(&req.routing).await? else {
            info!("No dataset for job {}, asking for an upload", req.job_id);
            return Ok(AnalysisOutcome::answer_only(UPLOAD_ANSWER));
        };

        if let Some(widget) = self.formatting_target(req).await? {
            return self.reformat(req, &engine, widget).await;
        }

        let schema = engine.schema().await.map_err(AnalysisError::Dataset)?;
        let sample = engine
            .sample(SAMPLE_ROWS)
            .await
            .map_err(AnalysisError::Dataset)?;

        let attempts = self.settings.max_attempts.max(1);
        let mut feedback: Option<String> = None;
        for attempt in 1..=attempts {
            let pass = self
                .analysis_pass(req, &engine, &schema, &sample, feedback.take())
                .await?;
            match validate_pass(&pass, self.settings.min_answer_chars) {
                Ok(()) => return self.finish(req, pass, attempt).await,
                Err(reason) => {
                    warn!(
                        "Job {} pass {}/{} rejected: {}",
                        req.job_id, attempt, attempts, reason
                    );
                    feedback = Some(reason);
                }
            }
        }
        Err(AnalysisError::OutputContract {
            attempts,
            reason: feedback.unwrap_or_default(),
        })
    }

    async fn progress(&self, job_id: &str, progress: u8) -> Result<(), AnalysisError> {
        self.tracker
            .update_status(job_id, JobStatus::Processing, Some(progress))
            .await
            .map_err(AnalysisError::Store)?;
        Ok(())
    }

    async fn open_dataset(&self, routing: &Routing) -> Result<Option<DatasetEngine>, AnalysisError> {
        let record = match routing {
            Routing::Dashboard { dashboard_id } => {
                match self
                    .store
                    .dataset_for_dashboard(dashboard_id)
                    .await
                    .map_err(AnalysisError::Store)?
                {
                    Some(rec) => rec,
                    None => return Ok(None),
                }
            }
            Routing::File { file_id } => self
                .store
                .dataset_by_file(file_id)
                .await
                .map_err(AnalysisError::Store)?
                .ok_or_else(|| {
                    AnalysisError::Dataset(anyhow::anyhow!("Data file '{}' not found", file_id))
                })?,
        };
        debug!("Using dataset {} at {}", record.id, record.db_path);
        DatasetEngine::open(Path::new(&record.db_path))
            .map(|engine| Some(engine.with_query_timeout(self.settings.query_timeout)))
            .map_err(AnalysisError::Dataset)
    }

    /// A context widget on this dashboard with a stored query, if the prompt only restyles.
    async fn formatting_target(
        &self,
        req: &AnalysisRequest,
    ) -> Result<Option<WidgetRecord>, AnalysisError> {
        let Some(dashboard_id) = req.routing.dashboard_id() else {
            return Ok(None);
        };
        if req.context_widget_ids.is_empty() || !is_formatting_request(&req.user_prompt) {
            return Ok(None);
        }
        for id in &req.context_widget_ids {
            let widget = self.store.get_widget(id).await.map_err(AnalysisError::Store)?;
            if let Some(widget) = widget
                && widget.dashboard_id == dashboard_id
                && widget.sql.is_some()
            {
                return Ok(Some(widget));
            }
        }
        Ok(None)
    }

    /// Restyle an existing widget without generating a new query.
    async fn reformat(
        &self,
        req: &AnalysisRequest,
        engine: &DatasetEngine,
        widget: WidgetRecord,
    ) -> Result<AnalysisOutcome, AnalysisError> {
        info!("Job {} restyles widget {}", req.job_id, widget.id);
        self.progress(&req.job_id, 40).await?;

        let sql = GuardedSql::from_stored(widget.sql.clone().unwrap_or_default());
        let rows: Vec<Row> = match widget
            .data
            .clone()
            .and_then(|d| serde_json::from_value(d).ok())
        {
            Some(rows) => rows,
            None => engine
                .execute(&sql, self.settings.row_limit)
                .await
                .map_err(AnalysisError::Dataset)?,
        };
        let current = ChartSpec {
            title: widget.title.clone(),
            widget_type: widget.widget_type.clone(),
            config: widget.config.clone(),
        };
        let chart = self
            .visualize(ChartRequest {
                user_prompt: req.user_prompt.clone(),
                sql: sql.as_str().to_string(),
                rows,
                target_type: req.target_widget_type.clone(),
                current: Some(current),
            })
            .await?;
        self.progress(&req.job_id, 80).await?;

        let updated = widgets::update_widget(
            &self.store,
            &widget.id,
            &WidgetVisual {
                title: chart.title.clone(),
                widget_type: chart.widget_type.clone(),
                config: chart.config.clone(),
                data: None,
            },
        )
        .await
        .map_err(AnalysisError::Store)?;

        Ok(AnalysisOutcome {
            answer: format!(
                "I've updated \"{}\" as requested. The underlying query and data are unchanged.",
                updated.title
            ),
            sql: Some(sql),
            chart: Some(chart),
            data: None,
            confidence: None,
            follow_up_questions: Vec::new(),
            widget_id: Some(updated.id),
            widget_change: Some(WidgetChange::Updated),
            attempts: 1,
        })
    }

    async fn analysis_pass(
        &self,
        req: &AnalysisRequest,
        engine: &DatasetEngine,
        schema: &Schema,
        sample: &[Row],
        feedback: Option<String>,
    ) -> Result<AnalysisPass, AnalysisError> {
        self.progress(&req.job_id, 20).await?;
        let raw_sql = self
            .generate_sql(SqlRequest {
                user_prompt: req.user_prompt.clone(),
                schema: schema.clone(),
                sample: sample.to_vec(),
                feedback: feedback.clone(),
            })
            .await?;

        let sql = guard(&raw_sql, engine, self.settings.plan_timeout)
            .await
            .inspect_err(|e| warn!("Job {}: {}", req.job_id, e))?;
        self.progress(&req.job_id, 40).await?;

        let assessment = self
            .scorer
            .score(&req.user_prompt, sql.as_str(), schema)
            .await;
        debug!(
            "Job {} confidence {}: {}",
            req.job_id, assessment.score, assessment.reasoning
        );

        if !assessment.passes_gate() {
            info!(
                "Job {} confidence {} below threshold, skipping visualization",
                req.job_id, assessment.score
            );
            self.progress(&req.job_id, 70).await?;
            let answer = self
                .synthesize(NarrativeRequest {
                    user_prompt: req.user_prompt.clone(),
                    rows: Vec::new(),
                    chart: None,
                    assessment: assessment.clone(),
                    feedback,
                })
                .await?;
            return Ok(AnalysisPass {
                answer,
                sql,
                assessment,
                chart: None,
                rows: Vec::new(),
            });
        }

        self.progress(&req.job_id, 55).await?;
        let rows = engine
            .execute(&sql, self.settings.row_limit)
            .await
            .map_err(AnalysisError::Dataset)?;

        self.progress(&req.job_id, 70).await?;
        let chart = self
            .visualize(ChartRequest {
                user_prompt: req.user_prompt.clone(),
                sql: sql.as_str().to_string(),
                rows: rows.clone(),
                target_type: req.target_widget_type.clone(),
                current: None,
            })
            .await?;

        self.progress(&req.job_id, 85).await?;
        let answer = self
            .synthesize(NarrativeRequest {
                user_prompt: req.user_prompt.clone(),
                rows: rows.clone(),
                chart: Some(chart.clone()),
                assessment: assessment.clone(),
                feedback,
            })
            .await?;

        Ok(AnalysisPass {
            answer,
            sql,
            assessment,
            chart: Some(chart),
            rows,
        })
    }

    /// Persist a validated pass. Only dashboard-routed, visualized passes get a widget.
    async fn finish(
        &self,
        req: &AnalysisRequest,
        pass: AnalysisPass,
        attempt: usize,
    ) -> Result<AnalysisOutcome, AnalysisError> {
        let follow_up_questions = pass.assessment.follow_up_questions.clone();
        let mut outcome = AnalysisOutcome {
            answer: pass.answer,
            sql: Some(pass.sql.clone()),
            chart: pass.chart.clone(),
            data: None,
            confidence: Some(pass.assessment),
            follow_up_questions,
            widget_id: None,
            widget_change: None,
            attempts: attempt,
        };
        let Some(chart) = pass.chart else {
            return Ok(outcome);
        };

        match &req.routing {
            Routing::Dashboard { dashboard_id } => {
                let widget = widgets::create_widget(
                    &self.store,
                    &NewWidget {
                        id: uuid::Uuid::new_v4().to_string(),
                        dashboard_id: dashboard_id.clone(),
                        title: chart.title,
                        widget_type: chart.widget_type,
                        config: chart.config,
                        data: Some(serde_json::to_value(&pass.rows).map_err(|e| {
                            AnalysisError::Store(anyhow::Error::from(e))
                        })?),
                        sql: Some(pass.sql),
                        layout: None,
                        chat_id: Some(req.chat_id.clone()),
                        is_configured: true,
                    },
                )
                .await
                .map_err(AnalysisError::Store)?;
                outcome.widget_id = Some(widget.id);
                outcome.widget_change = Some(WidgetChange::Created);
            }
            Routing::File { .. } => {
                outcome.data = Some(pass.rows);
            }
        }
        Ok(outcome)
    }

    async fn run_step(
        &self,
        step: &'static str,
        input: StepInput,
    ) -> Result<StepOutput, AnalysisError> {
        let handler = self
            .handlers
            .get(step)
            .ok_or(AnalysisError::MissingHandler(step))?;
        handler
            .run(input)
            .await
            .map_err(|cause| AnalysisError::Step { step, cause })
    }

    async fn generate_sql(&self, req: SqlRequest) -> Result<String, AnalysisError> {
        match self.run_step(GENERATE_SQL, StepInput::GenerateSql(req)).await? {
            StepOutput::Sql(sql) => Ok(sql),
            other => Err(AnalysisError::UnexpectedOutput {
                step: GENERATE_SQL,
                got: other.kind(),
            }),
        }
    }

    async fn visualize(&self, req: ChartRequest) -> Result<ChartSpec, AnalysisError> {
        match self.run_step(VISUALIZE, StepInput::Visualize(req)).await? {
            StepOutput::Chart(chart) => Ok(chart),
            other => Err(AnalysisError::UnexpectedOutput {
                step: VISUALIZE,
                got: other.kind(),
            }),
        }
    }

    async fn synthesize(&self, req: NarrativeRequest) -> Result<String, AnalysisError> {
        match self.run_step(SYNTHESIZE, StepInput::Synthesize(req)).await? {
            StepOutput::Narrative(text) => Ok(text),
            other => Err(AnalysisError::UnexpectedOutput {
                step: SYNTHESIZE,
                got: other.kind(),
            }),
        }
    }
}
