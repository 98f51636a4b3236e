use base64::engine::general_purpose::STANDARD as BASE64;
use base64::Engine as _;
use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::tasks::{TaskKind, VisionOp};

pub const DEFAULT_TEMPERATURE: f32 = 0.7;
pub const DEFAULT_MAX_TOKENS: u32 = 512;
pub const DEFAULT_IMAGE_SIDE: u32 = 1024;
pub const DEFAULT_NEGATIVE_PROMPT: &str = "blurry, low quality, distorted, deformed";

/// Inbound JSON body. Every field is optional here; [`normalize`] decides what each task needs.
#[derive(Debug, Clone, Default, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RawRequest {
    pub prompt: Option<String>,
    pub text: Option<String>,
    pub model: Option<String>,
    pub max_tokens: Option<i64>,
    pub temperature: Option<f32>,
    pub negative_prompt: Option<String>,
    pub width: Option<i64>,
    pub height: Option<i64>,
    pub system_prompt: Option<String>,
    pub image: Option<String>,
    pub image_url: Option<String>,
    pub audio: Option<String>,
    pub task: Option<String>,
    pub question: Option<String>,
    pub messages: Option<Vec<ChatMessage>>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ChatMessage {
    pub role: String,
    pub content: String,
}

impl ChatMessage {
    pub fn new(role: &str, content: impl Into<String>) -> Self {
        Self {
            role: role.to_string(),
            content: content.into(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ImageSource {
    Bytes { bytes: Vec<u8>, mime: String },
    Url(String),
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Payload {
    Prompt {
        text: String,
    },
    Chat {
        messages: Vec<ChatMessage>,
    },
    Audio {
        bytes: Vec<u8>,
        mime: String,
    },
    Image {
        source: ImageSource,
        op: VisionOp,
        question: Option<String>,
    },
}

#[derive(Debug, Clone, PartialEq)]
pub struct GenerationParams {
    pub max_tokens: u32,
    pub temperature: f32,
    pub width: u32,
    pub height: u32,
    pub negative_prompt: Option<String>,
    pub system_prompt: Option<String>,
}

impl Default for GenerationParams {
    fn default() -> Self {
        Self {
            max_tokens: DEFAULT_MAX_TOKENS,
            temperature: DEFAULT_TEMPERATURE,
            width: DEFAULT_IMAGE_SIDE,
            height: DEFAULT_IMAGE_SIDE,
            negative_prompt: None,
            system_prompt: None,
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct InferenceRequest {
    pub task: TaskKind,
    pub model_key: Option<String>,
    pub payload: Payload,
    pub params: GenerationParams,
}

impl InferenceRequest {
    /// Vision requests narrow the candidate list to models serving their op.
    pub fn capability(&self) -> Option<&'static str> {
        match &self.payload {
            Payload::Image { op, .. } => Some(op.as_str()),
            _ => None,
        }
    }

    pub fn prompt(&self) -> Option<&str> {
        match &self.payload {
            Payload::Prompt { text } => Some(text.as_str()),
            _ => None,
        }
    }
}

/// Client-side problems: reported as HTTP 400, never retried, no provider call made.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum RequestError {
    #[error("missing required field '{field}' for {task}")]
    MissingField { task: TaskKind, field: &'static str },
    #[error("invalid value for '{field}': {reason}")]
    InvalidField { field: &'static str, reason: String },
}

impl RequestError {
    fn invalid(field: &'static str, reason: impl Into<String>) -> Self {
        Self::InvalidField {
            field,
            reason: reason.into(),
        }
    }
}

pub fn normalize(task: TaskKind, raw: RawRequest) -> Result<InferenceRequest, RequestError> {
    let params = normalize_params(task, &raw)?;
    let model_key = non_blank(raw.model.clone());

    let payload = match task {
        TaskKind::TextGeneration | TaskKind::ImageGeneration => Payload::Prompt {
            text: required_text(task, raw.prompt, "prompt")?,
        },
        TaskKind::TextToSpeech => Payload::Prompt {
            text: required_text(task, raw.text.or(raw.prompt), "text")?,
        },
        TaskKind::Chat => Payload::Chat {
            messages: chat_messages(raw.messages, raw.prompt, params.system_prompt.as_deref())?,
        },
        TaskKind::SpeechToText => {
            let encoded = required_text(task, raw.audio, "audio")?;
            let (bytes, mime) = decode_base64_payload("audio", &encoded, "audio/wav")?;
            Payload::Audio { bytes, mime }
        }
        TaskKind::VisionTask => {
            let source = match (non_blank(raw.image), non_blank(raw.image_url)) {
                (Some(encoded), _) => {
                    let (bytes, mime) = decode_base64_payload("image", &encoded, "image/png")?;
                    ImageSource::Bytes { bytes, mime }
                }
                (None, Some(url)) => ImageSource::Url(url),
                (None, None) => {
                    return Err(RequestError::MissingField {
                        task,
                        field: "image",
                    })
                }
            };
            vision_payload(source, raw.task.as_deref(), raw.question)?
        }
    };

    Ok(InferenceRequest {
        task,
        model_key,
        payload,
        params,
    })
}

/// Multipart transcription path: the audio bytes arrive as a form file.
pub fn normalize_audio(
    model: Option<String>,
    bytes: Vec<u8>,
    mime: Option<String>,
) -> Result<InferenceRequest, RequestError> {
    if bytes.is_empty() {
        return Err(RequestError::MissingField {
            task: TaskKind::SpeechToText,
            field: "file",
        });
    }
    Ok(InferenceRequest {
        task: TaskKind::SpeechToText,
        model_key: non_blank(model),
        payload: Payload::Audio {
            bytes,
            mime: non_blank(mime).unwrap_or_else(|| "audio/wav".to_string()),
        },
        params: GenerationParams::default(),
    })
}

/// Multipart vision path.
pub fn normalize_image(
    model: Option<String>,
    bytes: Vec<u8>,
    mime: Option<String>,
    op: Option<&str>,
    question: Option<String>,
) -> Result<InferenceRequest, RequestError> {
    if bytes.is_empty() {
        return Err(RequestError::MissingField {
            task: TaskKind::VisionTask,
            field: "file",
        });
    }
    let source = ImageSource::Bytes {
        bytes,
        mime: non_blank(mime).unwrap_or_else(|| "image/png".to_string()),
    };
    Ok(InferenceRequest {
        task: TaskKind::VisionTask,
        model_key: non_blank(model),
        payload: vision_payload(source, op, question)?,
        params: GenerationParams::default(),
    })
}

fn vision_payload(
    source: ImageSource,
    op: Option<&str>,
    question: Option<String>,
) -> Result<Payload, RequestError> {
    let op = op
        .unwrap_or_default()
        .parse::<VisionOp>()
        .map_err(|reason| RequestError::invalid("task", reason))?;
    let question = non_blank(question);
    if op == VisionOp::QuestionAnswering && question.is_none() {
        return Err(RequestError::MissingField {
            task: TaskKind::VisionTask,
            field: "question",
        });
    }
    Ok(Payload::Image {
        source,
        op,
        question,
    })
}

fn normalize_params(task: TaskKind, raw: &RawRequest) -> Result<GenerationParams, RequestError> {
    let defaults = GenerationParams::default();
    let temperature = raw.temperature.unwrap_or(defaults.temperature);
    if !temperature.is_finite() || !(0.0..=2.0).contains(&temperature) {
        return Err(RequestError::invalid(
            "temperature",
            format!("{temperature} is outside [0, 2]"),
        ));
    }
    let negative_prompt = match task {
        TaskKind::ImageGeneration => Some(
            non_blank(raw.negative_prompt.clone())
                .unwrap_or_else(|| DEFAULT_NEGATIVE_PROMPT.to_string()),
        ),
        _ => non_blank(raw.negative_prompt.clone()),
    };
    Ok(GenerationParams {
        max_tokens: positive("maxTokens", raw.max_tokens, defaults.max_tokens)?,
        temperature,
        width: positive("width", raw.width, defaults.width)?,
        height: positive("height", raw.height, defaults.height)?,
        negative_prompt,
        system_prompt: non_blank(raw.system_prompt.clone()),
    })
}

fn positive(field: &'static str, value: Option<i64>, default: u32) -> Result<u32, RequestError> {
    match value {
        None => Ok(default),
        Some(raw) if raw > 0 => Ok(u32::try_from(raw).unwrap_or(u32::MAX)),
        Some(raw) => Err(RequestError::invalid(field, format!("{raw} must be positive"))),
    }
}

fn chat_messages(
    messages: Option<Vec<ChatMessage>>,
    prompt: Option<String>,
    system_prompt: Option<&str>,
) -> Result<Vec<ChatMessage>, RequestError> {
    let mut conversation: Vec<ChatMessage> = messages
        .unwrap_or_default()
        .into_iter()
        .filter(|message| !message.content.trim().is_empty())
        .collect();
    if conversation.is_empty() {
        let Some(prompt) = non_blank(prompt) else {
            return Err(RequestError::MissingField {
                task: TaskKind::Chat,
                field: "messages",
            });
        };
        conversation.push(ChatMessage::new("user", prompt));
    }
    if let Some(system) = system_prompt {
        if conversation.first().map(|message| message.role.as_str()) != Some("system") {
            conversation.insert(0, ChatMessage::new("system", system));
        }
    }
    Ok(conversation)
}

fn required_text(
    task: TaskKind,
    value: Option<String>,
    field: &'static str,
) -> Result<String, RequestError> {
    non_blank(value)
        .map(|text| text.trim().to_string())
        .ok_or(RequestError::MissingField { task, field })
}

fn non_blank(value: Option<String>) -> Option<String> {
    value.filter(|text| !text.trim().is_empty())
}

/// Accepts plain base64 or a `data:<mime>;base64,<data>` URL.
fn decode_base64_payload(
    field: &'static str,
    raw: &str,
    default_mime: &str,
) -> Result<(Vec<u8>, String), RequestError> {
    let raw = raw.trim();
    let (mime, data) = match raw.strip_prefix("data:") {
        Some(rest) => {
            let (header, data) = rest
                .split_once(',')
                .ok_or_else(|| RequestError::invalid(field, "malformed data URL"))?;
            let mime = header
                .strip_suffix(";base64")
                .ok_or_else(|| RequestError::invalid(field, "data URL must be base64 encoded"))?;
            let mime = if mime.is_empty() { default_mime } else { mime };
            (mime.to_string(), data)
        }
        None => (default_mime.to_string(), raw),
    };
    let bytes = BASE64
        .decode(data.trim().as_bytes())
        .map_err(|err| RequestError::invalid(field, format!("invalid base64: {err}")))?;
    if bytes.is_empty() {
        return Err(RequestError::invalid(field, "decoded payload is empty"));
    }
    Ok((bytes, mime))
}
