use std::io::Cursor;

use atelier_contracts::models::ModelCandidate;
use atelier_contracts::outcome::{truncate_text, AttemptOutcome};
use atelier_contracts::TaskKind;
use base64::engine::general_purpose::STANDARD as BASE64;
use base64::Engine as _;
use serde::Serialize;
use serde_json::{json, Map, Value};

use crate::error::GatewayError;
use crate::providers::ProviderReply;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "kebab-case")]
pub enum Encoding {
    DataUrl,
    PlainText,
    Json,
}

#[derive(Debug, Clone, PartialEq)]
pub enum ResultPayload {
    Text(String),
    DataUrl { mime: String, url: String },
    Json(Value),
}

impl ResultPayload {
    pub fn encoding(&self) -> Encoding {
        match self {
            ResultPayload::Text(_) => Encoding::PlainText,
            ResultPayload::DataUrl { .. } => Encoding::DataUrl,
            ResultPayload::Json(_) => Encoding::Json,
        }
    }

    fn to_value(&self) -> Value {
        match self {
            ResultPayload::Text(text) => Value::String(text.clone()),
            ResultPayload::DataUrl { url, .. } => Value::String(url.clone()),
            ResultPayload::Json(value) => value.clone(),
        }
    }
}

/// What the caller gets back. `used_model` is the backend id that actually
/// served the request, which after fallback need not be the requested one.
#[derive(Debug, Clone, PartialEq)]
pub struct InferenceResult {
    pub task: TaskKind,
    pub used_model: String,
    pub used_alias: String,
    pub provider: String,
    pub requested_model: Option<String>,
    pub payload: ResultPayload,
    pub fallback_reason: Option<String>,
    pub warnings: Vec<String>,
    pub attempts: Vec<AttemptOutcome>,
    pub metadata: Map<String, Value>,
}

impl InferenceResult {
    pub fn encoding(&self) -> Encoding {
        self.payload.encoding()
    }

    pub fn to_envelope(&self) -> Value {
        let mut envelope = Map::new();
        envelope.insert("success".to_string(), Value::Bool(true));
        envelope.insert(self.task.output_field().to_string(), self.payload.to_value());
        envelope.insert("model".to_string(), Value::String(self.used_model.clone()));
        envelope.insert("alias".to_string(), Value::String(self.used_alias.clone()));
        envelope.insert("provider".to_string(), Value::String(self.provider.clone()));
        envelope.insert("requestedModel".to_string(), json!(self.requested_model));
        if let Some(reason) = &self.fallback_reason {
            envelope.insert("fallbackReason".to_string(), Value::String(reason.clone()));
        }
        if !self.warnings.is_empty() {
            envelope.insert("warnings".to_string(), json!(self.warnings));
        }
        envelope.insert("attempts".to_string(), json!(self.attempts.len()));
        envelope.insert("encoding".to_string(), json!(self.encoding()));
        for (key, value) in &self.metadata {
            envelope.entry(key.clone()).or_insert_with(|| value.clone());
        }
        Value::Object(envelope)
    }
}

/// Converts a provider reply into a result for `task`.
///
/// Binary output becomes a `data:` URL; text output is trimmed; vision
/// results pass through as JSON. Anything else is a decode error.
pub fn encode(
    task: TaskKind,
    candidate: &ModelCandidate,
    reply: ProviderReply,
) -> Result<InferenceResult, GatewayError> {
    let decode_error = |message: String| GatewayError::Decode {
        candidate: candidate.alias.clone(),
        message,
    };
    let mut metadata = Map::new();

    let payload = match (task, reply) {
        (TaskKind::ImageGeneration | TaskKind::TextToSpeech, ProviderReply::Binary { bytes, mime }) => {
            if bytes.is_empty() {
                return Err(decode_error("empty binary response".to_string()));
            }
            let mime = resolve_mime(task, &bytes, &mime);
            if task == TaskKind::ImageGeneration {
                if let Some((width, height)) = image_dimensions(&bytes) {
                    metadata.insert("width".to_string(), json!(width));
                    metadata.insert("height".to_string(), json!(height));
                }
            }
            metadata.insert("mimeType".to_string(), Value::String(mime.clone()));
            metadata.insert("bytes".to_string(), json!(bytes.len()));
            ResultPayload::DataUrl {
                url: data_url(&mime, &bytes),
                mime,
            }
        }
        (TaskKind::VisionTask, ProviderReply::Json(value)) => ResultPayload::Json(value),
        (TaskKind::VisionTask, ProviderReply::Text(text)) => {
            ResultPayload::Json(Value::String(text.trim().to_string()))
        }
        (TaskKind::TextGeneration | TaskKind::Chat | TaskKind::SpeechToText, ProviderReply::Text(text)) => {
            ResultPayload::Text(text.trim().to_string())
        }
        (TaskKind::TextGeneration | TaskKind::Chat | TaskKind::SpeechToText, ProviderReply::Json(value)) => {
            let text = extract_text(&value).ok_or_else(|| {
                decode_error(format!(
                    "no text field in response: {}",
                    truncate_text(&value.to_string(), 200)
                ))
            })?;
            ResultPayload::Text(text.trim().to_string())
        }
        (task, ProviderReply::Binary { mime, .. }) => {
            return Err(decode_error(format!(
                "binary '{mime}' response cannot serve task '{task}'"
            )))
        }
        (task, _) => {
            return Err(decode_error(format!(
                "expected binary output for task '{task}'"
            )))
        }
    };

    Ok(InferenceResult {
        task,
        used_model: candidate.backend_id.clone(),
        used_alias: candidate.alias.clone(),
        provider: candidate.provider.clone(),
        requested_model: None,
        payload,
        fallback_reason: None,
        warnings: Vec::new(),
        attempts: Vec::new(),
        metadata,
    })
}

pub fn data_url(mime: &str, bytes: &[u8]) -> String {
    format!("data:{mime};base64,{}", BASE64.encode(bytes))
}

/// HF `generated_text`/`text`, OpenRouter `choices[0].message.content`, or a bare string.
fn extract_text(value: &Value) -> Option<String> {
    match value {
        Value::String(text) => Some(text.clone()),
        Value::Array(items) => items.first().and_then(extract_text),
        Value::Object(obj) => {
            for key in ["generated_text", "text", "summary_text"] {
                if let Some(text) = obj.get(key).and_then(Value::as_str) {
                    return Some(text.to_string());
                }
            }
            let choice = obj.get("choices")?.as_array()?.first()?;
            choice
                .pointer("/message/content")
                .or_else(|| choice.get("text"))
                .and_then(Value::as_str)
                .map(str::to_string)
        }
        _ => None,
    }
}

fn resolve_mime(task: TaskKind, bytes: &[u8], declared: &str) -> String {
    let family = if task == TaskKind::ImageGeneration {
        "image/"
    } else {
        "audio/"
    };
    if declared.starts_with(family) {
        return declared.to_string();
    }
    if task == TaskKind::ImageGeneration {
        return image::guess_format(bytes)
            .map(|format| format.to_mime_type().to_string())
            .unwrap_or_else(|_| "image/png".to_string());
    }
    sniff_audio(bytes).to_string()
}

fn sniff_audio(bytes: &[u8]) -> &'static str {
    match bytes {
        [b'R', b'I', b'F', b'F', ..] => "audio/wav",
        [b'f', b'L', b'a', b'C', ..] => "audio/flac",
        [b'O', b'g', b'g', b'S', ..] => "audio/ogg",
        [b'I', b'D', b'3', ..] | [0xFF, 0xFB, ..] | [0xFF, 0xF3, ..] => "audio/mpeg",
        _ => "audio/wav",
    }
}

fn image_dimensions(bytes: &[u8]) -> Option<(u32, u32)> {
    image::ImageReader::new(Cursor::new(bytes))
        .with_guessed_format()
        .ok()?
        .into_dimensions()
        .ok()
}
