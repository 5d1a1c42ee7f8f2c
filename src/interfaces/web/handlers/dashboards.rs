use axum::{
    Extension, Json,
    extract::{Path, State},
    http::StatusCode,
    response::{IntoResponse, Response},
};
use serde::Deserialize;
use tracing::{error, info, warn};
use uuid::Uuid;

use super::super::AppState;
use super::super::auth::CallerId;
use super::json_error;
use crate::core::store::now_ms;
use crate::core::store::types::{ChatMessageRecord, DashboardRecord};

const DASHBOARD_NOT_FOUND: &str = "Dashboard not found";

#[derive(Deserialize)]
pub struct AskRequest {
    chat_id: String,
    user_prompt: String,
    #[serde(default)]
    context_widget_ids: Vec<String>,
    #[serde(default)]
    target_widget_type: Option<String>,
}

async fn owned_dashboard(
    state: &AppState,
    dashboard_id: &str,
    caller: &CallerId,
) -> Result<DashboardRecord, Response> {
    match state.store.get_dashboard(dashboard_id).await {
        Ok(Some(dashboard)) if dashboard.user_id == caller.0 => Ok(dashboard),
        Ok(_) => Err(json_error(StatusCode::NOT_FOUND, DASHBOARD_NOT_FOUND)),
        Err(e) => Err(json_error(
            StatusCode::INTERNAL_SERVER_ERROR,
            format!("Database error: {}", e),
        )),
    }
}

/// Producer side: record the job, then hand the task to the queue.
pub async fn ask_endpoint(
    Path(dashboard_id): Path<String>,
    State(state): State<AppState>,
    Extension(caller): Extension<CallerId>,
    Json(payload): Json<AskRequest>,
) -> Response {
    let chat_id = payload.chat_id.trim().to_string();
    let user_prompt = payload.user_prompt.trim().to_string();
    if chat_id.is_empty() || user_prompt.is_empty() {
        return json_error(
            StatusCode::BAD_REQUEST,
            "chat_id and user_prompt are required",
        );
    }
    if let Err(resp) = owned_dashboard(&state, &dashboard_id, &caller).await {
        return resp;
    }

    let job_id = Uuid::new_v4().to_string();
    if let Err(e) = state
        .tracker
        .create(&job_id, &caller.0, Some(&dashboard_id))
        .await
    {
        error!("Could not create job for dashboard {}: {}", dashboard_id, e);
        return json_error(StatusCode::INTERNAL_SERVER_ERROR, e.to_string());
    }

    let question = ChatMessageRecord {
        role: "user".to_string(),
        content: user_prompt.clone(),
        created_at: now_ms(),
        request_id: Some(job_id.clone()),
        error: false,
        chart_id: None,
    };
    if let Err(e) = state.store.append_chat_message(&chat_id, &question).await {
        warn!("Could not record question for job {}: {}", job_id, e);
    }

    let task = serde_json::json!({
        "task_id": job_id,
        "chat_id": chat_id,
        "request_id": job_id,
        "dashboard_id": dashboard_id,
        "user_prompt": user_prompt,
        "user_id": caller.0,
        "context_widget_ids": payload.context_widget_ids,
        "target_widget_type": payload.target_widget_type,
        "received_at": now_ms(),
    });

    match state.queue.enqueue(&state.queue_name, &task).await {
        Ok(task_id) => {
            info!("Queued job {} for dashboard {}", job_id, dashboard_id);
            (
                StatusCode::ACCEPTED,
                Json(serde_json::json!({ "job_id": job_id, "task_id": task_id })),
            )
                .into_response()
        }
        Err(e) => {
            error!("Enqueue failed for job {}: {}", job_id, e);
            if let Err(e) = state
                .tracker
                .fail(&job_id, &format!("Failed to enqueue task: {}", e))
                .await
            {
                error!("Could not mark job {} failed: {}", job_id, e);
            }
            json_error(StatusCode::SERVICE_UNAVAILABLE, "Task queue unavailable")
        }
    }
}

/// Watermark plus widgets, for observers polling after a refresh.
pub async fn get_dashboard_endpoint(
    Path(dashboard_id): Path<String>,
    State(state): State<AppState>,
    Extension(caller): Extension<CallerId>,
) -> Response {
    let dashboard = match owned_dashboard(&state, &dashboard_id, &caller).await {
        Ok(dashboard) => dashboard,
        Err(resp) => return resp,
    };
    match state.store.list_widgets(&dashboard_id).await {
        Ok(widgets) => Json(serde_json::json!({
            "dashboard": dashboard,
            "widgets": widgets,
        }))
        .into_response(),
        Err(e) => json_error(
            StatusCode::INTERNAL_SERVER_ERROR,
            format!("Database error: {}", e),
        ),
    }
}
