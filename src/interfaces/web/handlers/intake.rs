use axum::{
    Json,
    body::Bytes,
    extract::State,
    http::{HeaderMap, StatusCode},
    response::{IntoResponse, Response},
};

use super::super::AppState;
use super::json_error;
use crate::core::intake::{IntakeError, MESSAGE_ID_HEADER};
use crate::core::signature::SIGNATURE_HEADER;

impl IntoResponse for IntakeError {
    fn into_response(self) -> Response {
        match self {
            IntakeError::Unauthorized => json_error(StatusCode::UNAUTHORIZED, self.to_string()),
            IntakeError::MalformedJson(_) | IntakeError::MissingFields(_) => {
                json_error(StatusCode::BAD_REQUEST, self.to_string())
            }
            IntakeError::Processing { request_id, detail } => (
                StatusCode::INTERNAL_SERVER_ERROR,
                Json(serde_json::json!({
                    "error": "Processing failed",
                    "detail": detail,
                    "request_id": request_id,
                })),
            )
                .into_response(),
        }
    }
}

fn header<'a>(headers: &'a HeaderMap, name: &str) -> Option<&'a str> {
    headers.get(name).and_then(|v| v.to_str().ok())
}

/// Queue push target. The raw body is taken as bytes since the signature
/// covers it byte for byte.
pub async fn process_task_endpoint(
    State(state): State<AppState>,
    headers: HeaderMap,
    body: Bytes,
) -> Response {
    match state
        .intake
        .handle(
            &body,
            header(&headers, SIGNATURE_HEADER),
            header(&headers, MESSAGE_ID_HEADER),
        )
        .await
    {
        Ok(accepted) => Json(accepted).into_response(),
        Err(e) => e.into_response(),
    }
}
