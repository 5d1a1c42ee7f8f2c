//! Authenticated task intake from the push-delivery queue.
//!
//! Any failure after the envelope is accepted marks the job failed, leaves a
//! categorized chat message and surfaces as `Processing`, which the HTTP layer
//! answers with a 500 so the queue redelivers.

mod envelope;
mod messages;

pub use envelope::{DecodedTask, TaskEnvelope};
pub use messages::categorize_error;

use anyhow::Result;
use serde::Serialize;
use std::sync::Arc;
use thiserror::Error;
use tracing::{error, info, warn};

use crate::core::analysis::{AnalysisOutcome, Coordinator};
use crate::core::jobs::{JobStatus, JobTracker};
use crate::core::signature::SignatureVerifier;
use crate::core::store::Store;
use crate::core::widgets;

/// Queue-assigned delivery id, used as the job id when the envelope has no `task_id`.
pub const MESSAGE_ID_HEADER: &str = "x-queue-message-id";

/// Owner recorded when neither the envelope nor a dashboard names one.
const ANONYMOUS_OWNER: &str = "anonymous";

#[derive(Debug, Error)]
pub enum IntakeError {
    #[error("Invalid signature")]
    Unauthorized,
    #[error("Invalid JSON payload")]
    MalformedJson(serde_json::Error),
    #[error("Missing required fields: [{}]", .0.join(", "))]
    MissingFields(Vec<&'static str>),
    #[error("Processing failed")]
    Processing { request_id: String, detail: String },
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct IntakeAccepted {
    pub success: bool,
    pub request_id: String,
}

pub struct TaskIntake {
    verifier: SignatureVerifier,
    intake_url: String,
    store: Store,
    tracker: JobTracker,
    coordinator: Arc<Coordinator>,
}

impl TaskIntake {
    /// `intake_url` is the full public URL deliveries are signed for.
    pub fn new(
        verifier: SignatureVerifier,
        intake_url: String,
        store: Store,
        tracker: JobTracker,
        coordinator: Arc<Coordinator>,
    ) -> Self {
        Self {
            verifier,
            intake_url,
            store,
            tracker,
            coordinator,
        }
    }

    /// Verify, decode and process one delivery. Safe to repeat for the same envelope.
    pub async fn handle(
        &self,
        raw_body: &[u8],
        signature: Option<&str>,
        message_id: Option<&str>,
    ) -> Result<IntakeAccepted, IntakeError> {
        if !self.verifier.verify(signature, raw_body, &self.intake_url) {
            warn!("Rejected queue delivery with an invalid signature");
            return Err(IntakeError::Unauthorized);
        }
        let envelope = TaskEnvelope::parse(raw_body).map_err(IntakeError::MalformedJson)?;
        let task = envelope
            .decode(message_id)
            .map_err(IntakeError::MissingFields)?;
        let request_id = task.request.request_id.clone();

        match self.process(&task).await {
            Ok(_) => Ok(IntakeAccepted {
                success: true,
                request_id,
            }),
            Err(e) => {
                let detail = format!("{:#}", e);
                self.record_failure(&task, &detail).await;
                Err(IntakeError::Processing { request_id, detail })
            }
        }
    }

    async fn process(&self, task: &DecodedTask) -> Result<AnalysisOutcome> {
        let req = &task.request;
        let dashboard_id = req.routing.dashboard_id();
        let owner = self.resolve_owner(task).await?;

        if !self.tracker.create(&req.job_id, &owner, dashboard_id).await? {
            info!("Job {} redelivered", req.job_id);
        }
        let attempt = self.tracker.record_attempt(&req.job_id).await?;
        self.tracker
            .update_status(&req.job_id, JobStatus::Processing, Some(5))
            .await?;
        info!(
            "Processing job {} (attempt {}) for chat {}",
            req.job_id, attempt, req.chat_id
        );

        let outcome = self.coordinator.run(req).await?;

        self.tracker
            .complete(&req.job_id, &serde_json::to_value(&outcome)?)
            .await?;
        self.store
            .append_chat_message(
                &req.chat_id,
                &messages::answer_message(&outcome, &req.request_id),
            )
            .await?;
        if let (Some(change), Some(dashboard_id)) = (outcome.widget_change, dashboard_id) {
            widgets::trigger_refresh(&self.store, dashboard_id, change.refresh_reason()).await;
        }
        info!("Job {} completed", req.job_id);
        Ok(outcome)
    }

    async fn resolve_owner(&self, task: &DecodedTask) -> Result<String> {
        if let Some(user_id) = &task.user_id {
            return Ok(user_id.clone());
        }
        let Some(dashboard_id) = task.request.routing.dashboard_id() else {
            return Ok(ANONYMOUS_OWNER.to_string());
        };
        Ok(self
            .store
            .get_dashboard(dashboard_id)
            .await?
            .map(|d| d.user_id)
            .unwrap_or_else(|| ANONYMOUS_OWNER.to_string()))
    }

    async fn record_failure(&self, task: &DecodedTask, detail: &str) {
        let req = &task.request;
        error!("Job {} failed: {}", req.job_id, detail);
        if let Err(e) = self.tracker.fail(&req.job_id, detail).await {
            error!("Could not mark job {} failed: {}", req.job_id, e);
        }
        if let Err(e) = self
            .store
            .append_chat_message(&req.chat_id, &messages::error_message(detail, &req.request_id))
            .await
        {
            error!("Could not append error message for job {}: {}", req.job_id, e);
        }
    }
}
