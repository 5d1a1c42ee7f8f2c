mod core;
mod interfaces;
mod logging;

use anyhow::Result;
use std::sync::Arc;
use std::time::Duration;
use tracing::{error, info, warn};

use crate::core::analysis::{Coordinator, CoordinatorSettings, default_handlers};
use crate::core::confidence::{HeuristicScorer, LlmScorer};
use crate::core::config::{AppConfig, StoreConfig};
use crate::core::intake::TaskIntake;
use crate::core::jobs::{EphemeralStore, JobTracker, MemoryEphemeralStore};
use crate::core::llm::{LlmProvider, OpenAiCompatibleProvider};
use crate::core::queue::QueueProducer;
use crate::core::signature::SignatureVerifier;
use crate::core::store::Store;
use crate::interfaces::web::{self, AppState};

#[tokio::main]
async fn main() {
    if let Err(e) = run().await {
        error!("querydeck exited with an error: {:#}", e);
        eprintln!("Error: {:#}", e);
        std::process::exit(1);
    }
}

fn ephemeral_store(cfg: &StoreConfig) -> Result<Arc<dyn EphemeralStore>> {
    if cfg.ephemeral_url.trim().is_empty() {
        return Ok(Arc::new(MemoryEphemeralStore::new()));
    }
    #[cfg(feature = "cache")]
    {
        info!("Mirroring job snapshots to Redis");
        Ok(Arc::new(crate::core::jobs::RedisEphemeralStore::new(
            &cfg.ephemeral_url,
        )?))
    }
    #[cfg(not(feature = "cache"))]
    {
        warn!("ephemeral_url is set but the `cache` feature is disabled, keeping snapshots in memory");
        Ok(Arc::new(MemoryEphemeralStore::new()))
    }
}

async fn run() -> Result<()> {
    dotenvy::dotenv().ok();
    let cfg = AppConfig::load()?;
    logging::init(&cfg.log.level);
    info!("Starting querydeck (queue '{}')", cfg.queue.name);

    if cfg.queue.current_signing_key.is_empty() && cfg.queue.next_signing_key.is_empty() {
        warn!("No queue signing keys configured, every delivery will be rejected");
    }

    let store = Store::open(&cfg.store.path).await?;
    let tracker = JobTracker::new(
        store.clone(),
        ephemeral_store(&cfg.store)?,
        Duration::from_secs(cfg.store.job_ttl_secs),
        Duration::from_millis(cfg.store.op_timeout_ms),
    );

    let llm: Arc<dyn LlmProvider> = Arc::new(OpenAiCompatibleProvider::new(&cfg.llm)?);
    let scorer = Arc::new(LlmScorer::new(
        llm.clone(),
        HeuristicScorer::new(cfg.analysis.weights.clone()),
    ));
    let coordinator = Coordinator::new(
        store.clone(),
        tracker.clone(),
        default_handlers(llm),
        scorer,
        CoordinatorSettings::from_config(&cfg),
    )?;

    let intake_url = format!(
        "{}{}",
        cfg.server.public_url.trim_end_matches('/'),
        cfg.queue.intake_path()
    );
    info!("Accepting queue deliveries signed for {}", intake_url);
    let intake = TaskIntake::new(
        SignatureVerifier::from_config(&cfg.queue),
        intake_url,
        store.clone(),
        tracker.clone(),
        Arc::new(coordinator),
    );
    let queue = Arc::new(QueueProducer::from_config(&cfg)?);

    let state = AppState::new(&cfg, store, tracker, Arc::new(intake), queue);
    let addr = format!("{}:{}", cfg.server.host, cfg.server.port);
    web::serve(&addr, state, async {
        if tokio::signal::ctrl_c().await.is_ok() {
            info!("Shutdown signal received");
        }
    })
    .await
}
