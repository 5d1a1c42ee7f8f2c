pub(crate) mod auth;
mod handlers;
mod router;

pub use router::build_api_router;

use anyhow::Result;
use std::sync::Arc;
use tracing::info;

use crate::core::config::AppConfig;
use crate::core::intake::TaskIntake;
use crate::core::jobs::JobTracker;
use crate::core::queue::TaskQueue;
use crate::core::store::Store;

#[derive(Clone)]
pub struct AppState {
    pub(crate) store: Store,
    pub(crate) tracker: JobTracker,
    pub(crate) intake: Arc<TaskIntake>,
    pub(crate) queue: Arc<dyn TaskQueue>,
    pub(crate) queue_name: String,
    pub(crate) intake_path: String,
    pub(crate) allowed_origins: Vec<String>,
}

impl AppState {
    pub fn new(
        cfg: &AppConfig,
        store: Store,
        tracker: JobTracker,
        intake: Arc<TaskIntake>,
        queue: Arc<dyn TaskQueue>,
    ) -> Self {
        Self {
            store,
            tracker,
            intake,
            queue,
            queue_name: cfg.queue.name.clone(),
            intake_path: cfg.queue.intake_path(),
            allowed_origins: vec![
                cfg.server.public_url.trim_end_matches('/').to_string(),
                format!("http://{}:{}", cfg.server.host, cfg.server.port),
            ],
        }
    }
}

/// Bind and serve until `shutdown` resolves.
pub async fn serve<F>(addr: &str, state: AppState, shutdown: F) -> Result<()>
where
    F: std::future::Future<Output = ()> + Send + 'static,
{
    let app = build_api_router(state);
    let listener = tokio::net::TcpListener::bind(addr).await?;
    info!("API server running at http://{}", addr);
    axum::serve(listener, app)
        .with_graceful_shutdown(shutdown)
        .await?;
    info!("API server stopped");
    Ok(())
}
