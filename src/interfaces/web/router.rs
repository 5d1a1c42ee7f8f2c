use axum::{
    Router,
    body::Body,
    http::{HeaderValue, Method, Request, header},
    middleware,
    middleware::Next,
    routing::{get, post},
};
use tower_http::cors::CorsLayer;
use tower_http::trace::TraceLayer;

use super::AppState;
use super::auth;
use super::handlers::{dashboards, intake, jobs};

fn build_cors(origins: &[String]) -> CorsLayer {
    let origins: Vec<HeaderValue> = origins.iter().filter_map(|o| o.parse().ok()).collect();

    CorsLayer::new()
        .allow_origin(origins)
        .allow_methods([Method::GET, Method::POST, Method::OPTIONS])
        .allow_headers(tower_http::cors::Any)
}

pub fn build_api_router(state: AppState) -> Router {
    // Queue deliveries authenticate with their signature, not a caller header.
    let public_routes = Router::new()
        .route(&state.intake_path, post(intake::process_task_endpoint))
        .layer(middleware::from_fn(security_headers))
        .with_state(state.clone());

    let authed_routes = Router::new()
        .route("/api/jobs/{job_id}", get(jobs::get_job_endpoint))
        .route("/api/jobs/{job_id}/events", get(jobs::job_events_endpoint))
        .route(
            "/api/dashboards/{dashboard_id}",
            get(dashboards::get_dashboard_endpoint),
        )
        .route(
            "/api/dashboards/{dashboard_id}/ask",
            post(dashboards::ask_endpoint),
        )
        .layer(middleware::from_fn(auth::require_user))
        .layer(middleware::from_fn(security_headers))
        .layer(build_cors(&state.allowed_origins))
        .with_state(state.clone());

    public_routes
        .merge(authed_routes)
        .layer(TraceLayer::new_for_http())
}

async fn security_headers(req: Request<Body>, next: Next) -> axum::response::Response {
    let mut response = next.run(req).await;
    let headers = response.headers_mut();
    headers.insert(
        header::X_CONTENT_TYPE_OPTIONS,
        HeaderValue::from_static("nosniff"),
    );
    headers.insert(header::X_FRAME_OPTIONS, HeaderValue::from_static("DENY"));
    response
}
