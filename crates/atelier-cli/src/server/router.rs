use axum::extract::DefaultBodyLimit;
use axum::routing::{get, post};
use axum::Router;
use tower_http::cors::{Any, CorsLayer};
use tower_http::trace::TraceLayer;

use super::handlers;
use super::state::AppState;

/// Uploaded audio and images travel in the request body.
const MAX_BODY_BYTES: usize = 25 * 1024 * 1024;

pub fn create_router(state: AppState) -> Router {
    let v1_routes = Router::new()
        .route("/text-generation", post(handlers::text_generation))
        .route("/image-generation", post(handlers::image_generation))
        .route("/speech-to-text", post(handlers::speech_to_text))
        .route("/text-to-speech", post(handlers::text_to_speech))
        .route("/vision-task", post(handlers::vision_task))
        .route("/chat", post(handlers::chat))
        .route("/models", get(handlers::models));

    Router::new()
        .nest("/v1", v1_routes)
        .route("/health", get(handlers::health))
        .layer(DefaultBodyLimit::max(MAX_BODY_BYTES))
        .layer(TraceLayer::new_for_http())
        .layer(
            CorsLayer::new()
                .allow_origin(Any)
                .allow_methods(Any)
                .allow_headers(Any),
        )
        .with_state(state)
}
