use atelier_contracts::requests::{normalize_audio, normalize_image, RawRequest};
use atelier_contracts::TaskKind;
use atelier_engine::{GatewayError, InferenceResult};
use axum::body::Bytes;
use axum::extract::{Multipart, Request, State};
use axum::http::header;
use axum::{Json, RequestExt};
use serde_json::{json, Value};

use super::error::ApiError;
use super::state::AppState;

type ApiResult = Result<Json<Value>, ApiError>;

pub async fn text_generation(State(state): State<AppState>, body: Bytes) -> ApiResult {
    json_task(&state, TaskKind::TextGeneration, &body).await
}

pub async fn image_generation(State(state): State<AppState>, body: Bytes) -> ApiResult {
    json_task(&state, TaskKind::ImageGeneration, &body).await
}

pub async fn text_to_speech(State(state): State<AppState>, body: Bytes) -> ApiResult {
    json_task(&state, TaskKind::TextToSpeech, &body).await
}

pub async fn chat(State(state): State<AppState>, body: Bytes) -> ApiResult {
    json_task(&state, TaskKind::Chat, &body).await
}

/// Multipart (`file`/`audio`, `model`) or JSON with base64 `audio`.
pub async fn speech_to_text(State(state): State<AppState>, req: Request) -> ApiResult {
    let task = TaskKind::SpeechToText;
    if !is_multipart(&req) {
        return json_body_task(&state, task, req).await;
    }
    let form = read_form(&state, task, req, &["file", "audio"]).await?;
    let request = normalize_audio(form.model, form.file.unwrap_or_default(), form.file_mime)
        .map_err(|err| gateway_error(&state, task, err.into()))?;
    run(&state, task, state.gateway.execute(request).await)
}

/// Multipart (`file`/`image`, `model`, `task`, `question`) or JSON with `image`/`imageUrl`.
pub async fn vision_task(State(state): State<AppState>, req: Request) -> ApiResult {
    let task = TaskKind::VisionTask;
    if !is_multipart(&req) {
        return json_body_task(&state, task, req).await;
    }
    let form = read_form(&state, task, req, &["file", "image"]).await?;
    let request = normalize_image(
        form.model,
        form.file.unwrap_or_default(),
        form.file_mime,
        form.task.as_deref(),
        form.question,
    )
    .map_err(|err| gateway_error(&state, task, err.into()))?;
    run(&state, task, state.gateway.execute(request).await)
}

pub async fn models(State(state): State<AppState>) -> Json<Value> {
    Json(state.gateway.models_overview())
}

pub async fn health(State(state): State<AppState>) -> Json<Value> {
    Json(json!({
        "status": "ok",
        "providers": state.gateway.provider_names(),
    }))
}

async fn json_task(state: &AppState, task: TaskKind, body: &[u8]) -> ApiResult {
    let raw = parse_raw(state, task, body)?;
    run(state, task, state.gateway.handle(task, raw).await)
}

async fn json_body_task(state: &AppState, task: TaskKind, req: Request) -> ApiResult {
    let body = req
        .extract::<Bytes, _>()
        .await
        .map_err(|err| ApiError::bad_request(&state.gateway, task, format!("Failed reading body: {err}")))?;
    json_task(state, task, &body).await
}

/// An empty body is an empty request: the normalizer reports the missing field.
fn parse_raw(state: &AppState, task: TaskKind, body: &[u8]) -> Result<RawRequest, ApiError> {
    if body.iter().all(u8::is_ascii_whitespace) {
        return Ok(RawRequest::default());
    }
    serde_json::from_slice(body)
        .map_err(|err| ApiError::bad_request(&state.gateway, task, format!("Invalid JSON payload: {err}")))
}

fn run(
    state: &AppState,
    task: TaskKind,
    outcome: Result<InferenceResult, GatewayError>,
) -> ApiResult {
    outcome
        .map(|result| Json(result.to_envelope()))
        .map_err(|err| gateway_error(state, task, err))
}

fn gateway_error(state: &AppState, task: TaskKind, err: GatewayError) -> ApiError {
    ApiError::from_gateway(&state.gateway, task, &err)
}

fn is_multipart(req: &Request) -> bool {
    req.headers()
        .get(header::CONTENT_TYPE)
        .and_then(|value| value.to_str().ok())
        .map(|value| value.to_ascii_lowercase().starts_with("multipart/form-data"))
        .unwrap_or(false)
}

#[derive(Debug, Default)]
struct UploadForm {
    file: Option<Vec<u8>>,
    file_mime: Option<String>,
    model: Option<String>,
    task: Option<String>,
    question: Option<String>,
}

async fn read_form(
    state: &AppState,
    task: TaskKind,
    req: Request,
    file_fields: &[&str],
) -> Result<UploadForm, ApiError> {
    let bad_request = |message: String| ApiError::bad_request(&state.gateway, task, message);
    let mut multipart = req
        .extract::<Multipart, _>()
        .await
        .map_err(|err| bad_request(format!("Invalid multipart payload: {err}")))?;

    let mut form = UploadForm::default();
    while let Some(field) = multipart
        .next_field()
        .await
        .map_err(|err| bad_request(format!("Failed reading multipart field: {err}")))?
    {
        let name = field.name().unwrap_or_default().to_string();
        if file_fields.contains(&name.as_str()) {
            form.file_mime = field.content_type().map(str::to_string);
            let bytes = field
                .bytes()
                .await
                .map_err(|err| bad_request(format!("Failed reading multipart '{name}' field: {err}")))?;
            form.file = Some(bytes.to_vec());
            continue;
        }
        let slot = match name.as_str() {
            "model" => &mut form.model,
            "task" => &mut form.task,
            "question" => &mut form.question,
            _ => continue,
        };
        let text = field
            .text()
            .await
            .map_err(|err| bad_request(format!("Failed reading multipart '{name}' field: {err}")))?;
        *slot = Some(text);
    }
    Ok(form)
}
