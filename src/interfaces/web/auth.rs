use axum::{
    Json,
    body::Body,
    http::{Request, StatusCode},
    middleware::Next,
    response::{IntoResponse, Response},
};

/// Caller identity forwarded by the fronting gateway.
pub const USER_HEADER: &str = "x-user-id";

/// Authenticated caller, inserted into request extensions by [`require_user`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub(crate) struct CallerId(pub(crate) String);

pub async fn require_user(mut req: Request<Body>, next: Next) -> Response {
    let caller = req
        .headers()
        .get(USER_HEADER)
        .and_then(|v| v.to_str().ok())
        .map(str::trim)
        .filter(|v| !v.is_empty())
        .map(str::to_string);

    match caller {
        Some(user_id) => {
            req.extensions_mut().insert(CallerId(user_id));
            next.run(req).await
        }
        None => (
            StatusCode::UNAUTHORIZED,
            Json(serde_json::json!({ "error": "Missing X-User-Id header" })),
        )
            .into_response(),
    }
}
