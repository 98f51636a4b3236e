use std::time::Duration;

use async_trait::async_trait;
use atelier_contracts::outcome::ProviderFailure;
use atelier_contracts::requests::{ChatMessage, Payload};
use reqwest::Client as HttpClient;
use serde_json::{json, Value};

use super::{
    http_client, normalize_api_base, read_reply, send_failure, InferenceProvider, ProviderCall,
    ProviderReply,
};

const DEFAULT_API_BASE: &str = "https://openrouter.ai/api/v1";

/// OpenRouter chat completions. Serves chat and plain-prompt text generation.
pub struct OpenRouterProvider {
    api_base: String,
    api_key: Option<String>,
    referer: Option<String>,
    http: HttpClient,
}

impl OpenRouterProvider {
    pub fn new(
        api_base: Option<String>,
        api_key: Option<String>,
        referer: Option<String>,
        timeout: Duration,
    ) -> Result<Self, reqwest::Error> {
        Ok(Self {
            api_base: normalize_api_base(api_base, DEFAULT_API_BASE),
            api_key,
            referer,
            http: http_client(timeout)?,
        })
    }

    fn completions_endpoint(&self) -> String {
        format!("{}/chat/completions", self.api_base)
    }

    fn messages(call: &ProviderCall<'_>) -> Result<Vec<ChatMessage>, ProviderFailure> {
        match call.payload {
            Payload::Chat { messages } => Ok(messages.clone()),
            Payload::Prompt { text } => {
                let mut messages = Vec::new();
                if let Some(system) = call.params.system_prompt.as_deref() {
                    messages.push(ChatMessage::new("system", system));
                }
                messages.push(ChatMessage::new("user", text.as_str()));
                Ok(messages)
            }
            _ => Err(ProviderFailure::fatal(format!(
                "OpenRouter cannot serve task '{}'",
                call.task
            ))),
        }
    }
}

#[async_trait]
impl InferenceProvider for OpenRouterProvider {
    fn name(&self) -> &str {
        "openrouter"
    }

    async fn invoke(&self, call: &ProviderCall<'_>) -> Result<ProviderReply, ProviderFailure> {
        let Some(api_key) = self.api_key.as_deref() else {
            return Err(ProviderFailure::fatal("OPENROUTER_API_KEY is not set"));
        };
        let payload = json!({
            "model": call.backend_id,
            "messages": Self::messages(call)?,
            "max_tokens": call.params.max_tokens,
            "temperature": call.params.temperature,
        });
        let mut request = self
            .http
            .post(self.completions_endpoint())
            .bearer_auth(api_key)
            .header("X-Title", "Atelier")
            .json(&payload);
        if let Some(referer) = self.referer.as_deref() {
            request = request.header("HTTP-Referer", referer);
        }
        let response = request
            .send()
            .await
            .map_err(|err| send_failure("OpenRouter", err))?;
        let reply = read_reply("OpenRouter", response).await?;
        embedded_error(&reply).map_or(Ok(reply), Err)
    }
}

/// OpenRouter can answer 200 with an `error` object whose `code` carries the real status.
fn embedded_error(reply: &ProviderReply) -> Option<ProviderFailure> {
    let ProviderReply::Json(body) = reply else {
        return None;
    };
    let error = body.get("error")?;
    let code = error
        .get("code")
        .and_then(Value::as_u64)
        .and_then(|code| u16::try_from(code).ok())
        .unwrap_or(500);
    let mut failure = ProviderFailure::http(code, body.to_string());
    failure.message = format!("OpenRouter {}", failure.message);
    Some(failure)
}
