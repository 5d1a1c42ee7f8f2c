use axum::{
    Extension, Json,
    extract::{Path, State},
    http::StatusCode,
    response::{
        IntoResponse, Response,
        sse::{Event, KeepAlive, Sse},
    },
};
use std::convert::Infallible;
use tokio_stream::StreamExt;
use tokio_stream::wrappers::BroadcastStream;
use tracing::error;

use super::super::AppState;
use super::super::auth::CallerId;
use super::json_error;
use crate::core::jobs::JobSnapshot;

const JOB_NOT_FOUND: &str = "Job not found";

/// Jobs owned by someone else read as absent.
async fn owned_snapshot(
    state: &AppState,
    job_id: &str,
    caller: &CallerId,
) -> Result<JobSnapshot, Response> {
    match state.tracker.get_status(job_id).await {
        Ok(Some(snapshot)) if snapshot.owner == caller.0 => Ok(snapshot),
        Ok(_) => Err(json_error(StatusCode::NOT_FOUND, JOB_NOT_FOUND)),
        Err(e) => {
            error!("Status read for job {} failed: {}", job_id, e);
            Err(json_error(StatusCode::INTERNAL_SERVER_ERROR, e.to_string()))
        }
    }
}

pub async fn get_job_endpoint(
    Path(job_id): Path<String>,
    State(state): State<AppState>,
    Extension(caller): Extension<CallerId>,
) -> Response {
    match owned_snapshot(&state, &job_id, &caller).await {
        Ok(snapshot) => Json(snapshot).into_response(),
        Err(resp) => resp,
    }
}

fn job_event(update: &JobSnapshot) -> Option<Result<Event, Infallible>> {
    Event::default().event("job").json_data(update).ok().map(Ok)
}

/// Current snapshot first, then one event per durable write to this job.
pub async fn job_events_endpoint(
    Path(job_id): Path<String>,
    State(state): State<AppState>,
    Extension(caller): Extension<CallerId>,
) -> Response {
    // Subscribe before reading so no write between the two is missed.
    let receiver = state.tracker.subscribe();
    let current = match owned_snapshot(&state, &job_id, &caller).await {
        Ok(snapshot) => snapshot,
        Err(resp) => return resp,
    };

    let updates = BroadcastStream::new(receiver).filter_map(move |msg| match msg {
        Ok(update) if update.job_id == job_id => job_event(&update),
        Ok(_) => None,
        Err(_) => Some(Ok(Event::default().event("lagged").data("Job stream lagged"))),
    });
    let stream = tokio_stream::iter(job_event(&current)).chain(updates);

    Sse::new(stream)
        .keep_alive(KeepAlive::default())
        .into_response()
}
