
use anyhow::{Result, anyhow};
use async_trait::async_trait;
use std::collections::HashMap;
use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::time::Duration;
use tempfile::TempDir;

use super::{
    Coordinator, CoordinatorSettings, GENERATE_SQL, HandlerTable, SYNTHESIZE, StepHandler,
    StepInput, StepOutput, VISUALIZE, clarification_answer, infer_chart,
};
use crate::core::confidence::{ConfidenceAssessment, ConfidenceScorer};
use crate::core::dataset::{Schema, write_test_dataset};
use crate::core::jobs::{JobTracker, MemoryEphemeralStore};
use crate::core::store::Store;

/// Read-only, plannable, and never finishes on its own.
pub(crate) const RUNAWAY_SQL: &str = "WITH RECURSIVE c(x) AS (SELECT 1 UNION ALL SELECT x + 1 FROM c) \
     SELECT COUNT(*) FROM c, csv_data";

/// Store with two dashboards: `d1` (owner `u1`) has the sales dataset, also
/// reachable as file `f1`; `d2` (owner `u2`) has none.
pub(crate) struct Fixture {
    pub dir: TempDir,
    pub store: Store,
    pub tracker: JobTracker,
}

pub(crate) async fn fixture() -> Fixture {
    let dir = tempfile::tempdir().expect("tempdir");
    let path = dir.path().join("sales.db");
    write_test_dataset(&path);

    let store = Store::open_in_memory().expect("store");
    store.create_dashboard("d1", "u1", "Sales").await.unwrap();
    store.create_dashboard("d2", "u2", "Empty").await.unwrap();
    store
        .register_dataset("ds1", Some("d1"), Some("f1"), &path.to_string_lossy(), 1)
        .await
        .unwrap();

    let tracker = JobTracker::new(
        store.clone(),
        Arc::new(MemoryEphemeralStore::new()),
        Duration::from_secs(60),
        Duration::from_millis(200),
    );
    Fixture {
        dir,
        store,
        tracker,
    }
}

/// Scorer that always returns the same assessment.
pub(crate) struct FixedScorer {
    pub score: i64,
    pub reasoning: &'static str,
}

#[async_trait]
impl ConfidenceScorer for FixedScorer {
    async fn score(&self, _prompt: &str, _sql: &str, _schema: &Schema) -> ConfidenceAssessment {
        ConfidenceAssessment::new(self.score, self.reasoning, Vec::new())
    }
}

/// Per-step call counters for [`fixed_handlers`].
#[derive(Default)]
pub(crate) struct StepCalls {
    pub generate_sql: AtomicUsize,
    pub visualize: AtomicUsize,
    pub synthesize: AtomicUsize,
}

impl StepCalls {
    pub fn get(&self, step: &str) -> usize {
        match step {
            GENERATE_SQL => self.generate_sql.load(Ordering::SeqCst),
            VISUALIZE => self.visualize.load(Ordering::SeqCst),
            _ => self.synthesize.load(Ordering::SeqCst),
        }
    }
}

/// Deterministic handlers: the generator always returns `sql`, the chart is
/// inferred from the rows and the narrative is templated.
pub(crate) fn fixed_handlers(sql: &str, calls: Arc<StepCalls>) -> HandlerTable {
    let mut table: HandlerTable = HashMap::new();

    let sql = sql.to_string();
    let c = calls.clone();
    let generate: Arc<dyn StepHandler> = Arc::new(move |input: StepInput| -> Result<StepOutput> {
        c.generate_sql.fetch_add(1, Ordering::SeqCst);
        match input {
            StepInput::GenerateSql(_) => Ok(StepOutput::Sql(sql.clone())),
            _ => Err(anyhow!("unexpected input")),
        }
    });
    table.insert(GENERATE_SQL.to_string(), generate);

    let c = calls.clone();
    let visualize: Arc<dyn StepHandler> = Arc::new(move |input: StepInput| -> Result<StepOutput> {
        c.visualize.fetch_add(1, Ordering::SeqCst);
        match input {
            StepInput::Visualize(req) => {
                let mut spec = match req.current {
                    Some(current) => current,
                    None => infer_chart(&req.user_prompt, &req.rows, None),
                };
                if let Some(target) = req.target_type {
                    spec.widget_type = target;
                }
                Ok(StepOutput::Chart(spec))
            }
            _ => Err(anyhow!("unexpected input")),
        }
    });
    table.insert(VISUALIZE.to_string(), visualize);

    let c = calls;
    let synthesize: Arc<dyn StepHandler> =
        Arc::new(move |input: StepInput| -> Result<StepOutput> {
            c.synthesize.fetch_add(1, Ordering::SeqCst);
            match input {
                StepInput::Synthesize(req) if req.assessment.passes_gate() => {
                    Ok(StepOutput::Narrative(format!(
                        "Your question returned {} row(s) of results.",
                        req.rows.len()
                    )))
                }
                StepInput::Synthesize(req) => {
                    Ok(StepOutput::Narrative(clarification_answer(&req.assessment)))
                }
                _ => Err(anyhow!("unexpected input")),
            }
        });
    table.insert(SYNTHESIZE.to_string(), synthesize);
    table
}

pub(crate) fn settings() -> CoordinatorSettings {
    CoordinatorSettings {
        max_attempts: 3,
        row_limit: 500,
        min_answer_chars: 20,
        plan_timeout: Duration::from_secs(2),
        query_timeout: Duration::from_millis(300),
    }
}

pub(crate) fn coordinator(fx: &Fixture, handlers: HandlerTable, score: i64) -> Coordinator {
    Coordinator::new(
        fx.store.clone(),
        fx.tracker.clone(),
        handlers,
        Arc::new(FixedScorer {
            score,
            reasoning: "vague request",
        }),
        settings(),
    )
    .expect("coordinator")
}
