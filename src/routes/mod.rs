//! Router assembly: HTTP endpoints, CORS, and HTTP tracing.

use std::sync::Arc;

use axum::{
    routing::{get, post},
    Router,
};
use tower_http::{
    cors::{Any, CorsLayer},
    trace::{DefaultMakeSpan, DefaultOnRequest, DefaultOnResponse, TraceLayer},
};
use tracing::Level;

use crate::state::AppState;

pub mod http;

/// Build the application router with:
/// - JSON API under `/api/v1/...`
/// - CORS (allow any origin/method/headers); adjust for production if needed
/// - HTTP trace layer (per-request spans w/ method, path, status, latency)
pub fn build_router(state: Arc<AppState>) -> Router {
    Router::new()
        .route("/api/v1/health", get(http::http_health))
        // Capture pipeline
        .route("/api/v1/questions/analyze", post(http::http_post_analyze))
        .route("/api/v1/questions/analyze/batch", post(http::http_post_analyze_batch))
        .route("/api/v1/questions/check-duplicate", post(http::http_post_check_duplicate))
        // Error book
        .route(
            "/api/v1/questions",
            post(http::http_post_question)
                .get(http::http_list_questions)
                .delete(http::http_clear_questions),
        )
        .route("/api/v1/questions/:id", get(http::http_get_question))
        .route("/api/v1/questions/:id/mastered", post(http::http_post_mastered))
        .route("/api/v1/questions/:id/practice-result", post(http::http_post_practice_result))
        // Tutoring
        .route("/api/v1/questions/:id/chat", post(http::http_post_chat))
        .route("/api/v1/stats", get(http::http_get_stats))
        .route("/api/v1/practice", post(http::http_post_practice))
        .route("/api/v1/routing/plan", post(http::http_post_routing_plan))
        // State + CORS + HTTP tracing
        .with_state(state)
        .layer(
            CorsLayer::new()
                .allow_origin(Any)
                .allow_methods(Any)
                .allow_headers(Any),
        )
        .layer(
            TraceLayer::new_for_http()
                .make_span_with(DefaultMakeSpan::new().level(Level::INFO))
                .on_request(DefaultOnRequest::new().level(Level::INFO))
                .on_response(DefaultOnResponse::new().level(Level::INFO)),
        )
}
