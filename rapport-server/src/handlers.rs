use std::sync::Arc;

use axum::{
    extract::{DefaultBodyLimit, Json, State},
    http::StatusCode,
    response::{IntoResponse, Response},
    routing::{get, post},
    Router,
};
use rapport_core::{Error, ModelContext};
use serde::Serialize;
use serde_json::json;
use tower_http::{cors::CorsLayer, trace::TraceLayer};

use crate::error::ApiError;
use crate::extract::{GenerateForm, TextRequest, ValidJson};

#[derive(Serialize)]
pub struct GenerationResponse {
    pub response: String,
}

// Application state: the model slot filled once loading finishes.
pub struct AppState {
    pub context: Arc<ModelContext>,
}

impl AppState {
    pub fn new(context: Arc<ModelContext>) -> Self {
        Self { context }
    }
}

pub fn router(state: Arc<AppState>, body_limit: usize) -> Router {
    Router::new()
        .route("/health", get(health_handler))
        .route("/generate", post(generate_handler))
        .route("/generate-text", post(generate_text_handler))
        .layer(DefaultBodyLimit::max(body_limit))
        .layer(CorsLayer::permissive())
        .layer(TraceLayer::new_for_http())
        .with_state(state)
}

async fn health_handler(State(state): State<Arc<AppState>>) -> Response {
    match state.context.pipeline() {
        Ok(pipeline) => (
            StatusCode::OK,
            Json(json!({ "status": "ready", "model": pipeline.model_id() })),
        )
            .into_response(),
        Err(_) => (
            StatusCode::SERVICE_UNAVAILABLE,
            Json(json!({ "status": "loading" })),
        )
            .into_response(),
    }
}

async fn generate_handler(
    State(state): State<Arc<AppState>>,
    form: GenerateForm,
) -> Result<Json<GenerationResponse>, ApiError> {
    let prompt = form.into_prompt()?;
    let pipeline = state.context.pipeline()?;
    let response = run_blocking(move || pipeline.generate(&prompt)).await?;
    Ok(Json(GenerationResponse { response }))
}

async fn generate_text_handler(
    State(state): State<Arc<AppState>>,
    ValidJson(request): ValidJson<TextRequest>,
) -> Result<Json<GenerationResponse>, ApiError> {
    let prompt = request.into_prompt()?;
    let pipeline = state.context.pipeline()?;
    let response = run_blocking(move || pipeline.generate_text(&prompt)).await?;
    Ok(Json(GenerationResponse { response }))
}

/// Generation holds the device for seconds; keep it off the async workers.
async fn run_blocking<F>(f: F) -> Result<String, Error>
where
    F: FnOnce() -> Result<String, Error> + Send + 'static,
{
    tokio::task::spawn_blocking(f)
        .await
        .map_err(Error::inference)?
}
