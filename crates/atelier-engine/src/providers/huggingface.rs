use std::time::Duration;

use async_trait::async_trait;
use atelier_contracts::outcome::ProviderFailure;
use atelier_contracts::requests::{ChatMessage, ImageSource, Payload};
use atelier_contracts::{TaskKind, VisionOp};
use base64::engine::general_purpose::STANDARD as BASE64;
use base64::Engine as _;
use reqwest::header::CONTENT_TYPE;
use reqwest::{Client as HttpClient, RequestBuilder};
use serde_json::json;
use tracing::debug;

use super::{
    http_client, normalize_api_base, read_reply, send_failure, InferenceProvider, ProviderCall,
    ProviderReply,
};

const DEFAULT_API_BASE: &str = "https://api-inference.huggingface.co";

/// HuggingFace serverless Inference API (`POST {base}/models/{model}`).
pub struct HuggingFaceProvider {
    api_base: String,
    api_key: Option<String>,
    http: HttpClient,
}

impl HuggingFaceProvider {
    pub fn new(
        api_base: Option<String>,
        api_key: Option<String>,
        timeout: Duration,
    ) -> Result<Self, reqwest::Error> {
        Ok(Self {
            api_base: normalize_api_base(api_base, DEFAULT_API_BASE),
            api_key,
            http: http_client(timeout)?,
        })
    }

    fn endpoint(&self, backend_id: &str) -> String {
        format!("{}/models/{}", self.api_base, backend_id)
    }

    fn build_request(&self, call: &ProviderCall<'_>) -> Result<RequestBuilder, ProviderFailure> {
        let post = self.http.post(self.endpoint(call.backend_id));
        let params = &call.params;
        let request = match (call.task, call.payload) {
            (TaskKind::TextGeneration, Payload::Prompt { text }) => post.json(&json!({
                "inputs": text,
                "parameters": {
                    "max_new_tokens": params.max_tokens,
                    "temperature": params.temperature,
                    "return_full_text": false,
                },
            })),
            (TaskKind::Chat, Payload::Chat { messages }) => post.json(&json!({
                "inputs": flatten_chat(messages),
                "parameters": {
                    "max_new_tokens": params.max_tokens,
                    "temperature": params.temperature,
                    "return_full_text": false,
                },
            })),
            (TaskKind::ImageGeneration, Payload::Prompt { text }) => post.json(&json!({
                "inputs": text,
                "parameters": {
                    "negative_prompt": params.negative_prompt,
                    "width": params.width,
                    "height": params.height,
                },
            })),
            (TaskKind::TextToSpeech, Payload::Prompt { text }) => post.json(&json!({ "inputs": text })),
            (TaskKind::SpeechToText, Payload::Audio { bytes, mime }) => post
                .header(CONTENT_TYPE, mime.as_str())
                .body(bytes.clone()),
            (
                TaskKind::VisionTask,
                Payload::Image {
                    source,
                    op,
                    question,
                },
            ) => {
                // URLs are downloaded once by the gateway before the candidate loop.
                let ImageSource::Bytes { bytes, mime } = source else {
                    return Err(ProviderFailure::fatal("image URL was not fetched before invocation"));
                };
                if *op == VisionOp::QuestionAnswering {
                    post.json(&json!({
                        "inputs": {
                            "image": BASE64.encode(bytes),
                            "question": question,
                        }
                    }))
                } else {
                    post.header(CONTENT_TYPE, mime.as_str()).body(bytes.clone())
                }
            }
            (task, _) => {
                return Err(ProviderFailure::fatal(format!(
                    "payload does not match task '{task}'"
                )))
            }
        };
        Ok(request)
    }
}

#[async_trait]
impl InferenceProvider for HuggingFaceProvider {
    fn name(&self) -> &str {
        "huggingface"
    }

    async fn invoke(&self, call: &ProviderCall<'_>) -> Result<ProviderReply, ProviderFailure> {
        let Some(api_key) = self.api_key.as_deref() else {
            return Err(ProviderFailure::fatal("HUGGINGFACE_API_KEY is not set"));
        };
        let request = self.build_request(call)?;
        debug!(backend_id = call.backend_id, task = %call.task, "huggingface request");
        let response = request
            .bearer_auth(api_key)
            .send()
            .await
            .map_err(|err| send_failure("HuggingFace", err))?;
        read_reply("HuggingFace", response).await
    }
}

fn flatten_chat(messages: &[ChatMessage]) -> String {
    let mut prompt = messages
        .iter()
        .map(|message| format!("{}: {}", message.role, message.content.trim()))
        .collect::<Vec<_>>()
        .join("\n");
    prompt.push_str("\nassistant:");
    prompt
}
