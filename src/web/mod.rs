//! HTTP surface: the JSON API, the scene stream and the browser UI.

use std::num::NonZeroU16;
use std::path::Path;
use std::sync::Arc;

use axum::extract::rejection::JsonRejection;
use axum::extract::{Json, State};
use axum::response::{IntoResponse, Response};
use axum::routing::{get, post};
use axum::Router;
use chrono::Utc;
use serde::{Deserialize, Serialize};
use serde_json::{Value, json};
use tower_http::services::{ServeDir, ServeFile};
use tracing::{error, info};

use crate::beats::normalize_scene_count;
use crate::error::StoryframeError;
use crate::pipeline::ScenePipeline;
use crate::upstream::{ImageGenerator, ImageRef, UpstreamError};

mod ndjson;

use ndjson::ndjson_response;

/// Shared handler state.
#[derive(Clone, Debug)]
pub struct AppState {
    generator: Arc<dyn ImageGenerator>,
}

impl AppState {
    /// State backed by `generator`, usually an [`UpstreamClient`](crate::upstream::UpstreamClient).
    pub fn new(generator: Arc<dyn ImageGenerator>) -> Self {
        Self { generator }
    }
}

#[derive(Deserialize, Debug)]
pub(crate) struct GenerationRequest {
    #[serde(default)]
    prompt: Option<String>,
    #[serde(default)]
    size: Option<String>,
    #[serde(default)]
    model: Option<String>,
}

#[derive(Deserialize, Debug)]
pub(crate) struct SceneRequest {
    #[serde(default)]
    prompt: Option<String>,
    #[serde(default, rename = "sceneCount")]
    scene_count: Option<Value>,
    #[serde(default)]
    model: Option<String>,
}

#[derive(Serialize, Debug)]
struct GenerationResponse {
    created: i64,
    data: Vec<ImageRef>,
    #[serde(skip_serializing_if = "Option::is_none")]
    error: Option<ErrorMessage>,
}

#[derive(Serialize, Debug)]
struct ErrorMessage {
    message: String,
}

fn required_prompt(prompt: Option<&str>) -> Result<&str, StoryframeError> {
    prompt
        .map(str::trim)
        .filter(|prompt| !prompt.is_empty())
        .ok_or_else(|| StoryframeError::BadRequest("Prompt is required.".to_string()))
}

fn non_blank(value: Option<&str>) -> Option<&str> {
    value.map(str::trim).filter(|value| !value.is_empty())
}

async fn generate_handler(
    State(state): State<AppState>,
    payload: Result<Json<GenerationRequest>, JsonRejection>,
) -> Result<Response, StoryframeError> {
    state.generator.ensure_configured()?;
    let Json(request) = payload?;
    let prompt = required_prompt(request.prompt.as_deref())?;

    let result = state
        .generator
        .generate_image(
            prompt,
            non_blank(request.model.as_deref()),
            non_blank(request.size.as_deref()),
        )
        .await;

    let response = match result {
        Ok(image) => GenerationResponse {
            created: Utc::now().timestamp(),
            data: vec![image],
            error: None,
        },
        Err(err @ UpstreamError::NoImageProduced { .. }) => {
            info!("Upstream produced no image: {}", err);
            GenerationResponse {
                created: Utc::now().timestamp(),
                data: Vec::new(),
                error: Some(ErrorMessage {
                    message: err.to_string(),
                }),
            }
        }
        Err(err) => return Err(err.into()),
    };
    Ok(Json(response).into_response())
}

async fn generate_scenes_handler(
    State(state): State<AppState>,
    payload: Result<Json<SceneRequest>, JsonRejection>,
) -> Result<Response, StoryframeError> {
    state.generator.ensure_configured()?;
    let Json(request) = payload?;
    let prompt = required_prompt(request.prompt.as_deref())?;
    let count = normalize_scene_count(request.scene_count.as_ref());
    let model = non_blank(request.model.as_deref()).map(str::to_string);

    info!("Generating {} scenes", count);
    let (outcomes, _run) = ScenePipeline::new(prompt, count, model).spawn(state.generator.clone());
    ndjson_response(outcomes)
}

async fn health_handler() -> impl IntoResponse {
    Json(json!({ "status": "ok" }))
}

fn create_router(static_dir: &Path) -> Router<AppState> {
    let index = ServeFile::new(static_dir.join("index.html"));
    Router::new()
        .route("/api/generate", post(generate_handler))
        .route("/api/generate-scenes", post(generate_scenes_handler))
        .route("/api/health", get(health_handler))
        .fallback_service(ServeDir::new(static_dir).fallback(index))
}

/// The full application: API routes plus the UI served from `static_dir`.
pub fn create_app(generator: Arc<dyn ImageGenerator>, static_dir: &Path) -> Router {
    create_router(static_dir).with_state(AppState::new(generator))
}

async fn shutdown_signal() {
    if let Err(err) = tokio::signal::ctrl_c().await {
        error!("Failed to listen for shutdown signal: {}", err);
        std::future::pending::<()>().await;
    }
    info!("Shutting down");
}

/// Binds the listener and serves `app` until ctrl-c.
pub async fn setup_server(
    listen_addr: &str,
    port: NonZeroU16,
    app: Router,
) -> Result<(), anyhow::Error> {
    let addr = format!("{}:{}", listen_addr, port);
    info!("Starting server on http://{}", addr);
    let listener = tokio::net::TcpListener::bind(&addr).await?;
    if let Err(err) = axum::serve(listener, app)
        .with_graceful_shutdown(shutdown_signal())
        .await
    {
        error!("Server error: {}", err);
    }
    Ok(())
}
