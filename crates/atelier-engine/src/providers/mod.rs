mod dryrun;
mod huggingface;
mod openrouter;

use std::collections::BTreeMap;
use std::env;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use atelier_contracts::outcome::{parse_retry_after, ProviderFailure};
use atelier_contracts::requests::{GenerationParams, Payload};
use atelier_contracts::TaskKind;
use reqwest::header::{CONTENT_TYPE, RETRY_AFTER};
use reqwest::Client as HttpClient;
use serde_json::Value;

pub use dryrun::DryrunProvider;
pub use huggingface::HuggingFaceProvider;
pub use openrouter::OpenRouterProvider;

/// One provider call: the request as it goes over the wire for one candidate.
#[derive(Debug, Clone)]
pub struct ProviderCall<'a> {
    pub task: TaskKind,
    pub backend_id: &'a str,
    pub payload: &'a Payload,
    /// Already clamped to the candidate's limits.
    pub params: GenerationParams,
}

#[derive(Debug, Clone, PartialEq)]
pub enum ProviderReply {
    Binary { bytes: Vec<u8>, mime: String },
    Json(Value),
    Text(String),
}

#[async_trait]
pub trait InferenceProvider: Send + Sync {
    fn name(&self) -> &str;
    async fn invoke(&self, call: &ProviderCall<'_>) -> Result<ProviderReply, ProviderFailure>;
}

#[derive(Default, Clone)]
pub struct ProviderRegistry {
    providers: BTreeMap<String, Arc<dyn InferenceProvider>>,
}

impl ProviderRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn register<P: InferenceProvider + 'static>(&mut self, provider: P) {
        let provider: Arc<dyn InferenceProvider> = Arc::new(provider);
        self.providers.insert(provider.name().to_string(), provider);
    }

    /// Serves `name` with `provider`, e.g. routing every backend to dryrun.
    pub fn register_as(&mut self, name: &str, provider: Arc<dyn InferenceProvider>) {
        self.providers.insert(name.to_string(), provider);
    }

    pub fn get(&self, name: &str) -> Option<Arc<dyn InferenceProvider>> {
        self.providers.get(name).cloned()
    }

    pub fn names(&self) -> Vec<String> {
        self.providers.keys().cloned().collect()
    }
}

pub(crate) fn non_empty_env(key: &str) -> Option<String> {
    env::var(key)
        .ok()
        .map(|value| value.trim().to_string())
        .filter(|value| !value.is_empty())
}

pub(crate) fn normalize_api_base(raw: Option<String>, default: &str) -> String {
    raw.map(|value| value.trim().trim_end_matches('/').to_string())
        .filter(|value| !value.is_empty())
        .unwrap_or_else(|| default.to_string())
}

pub(crate) fn http_client(timeout: Duration) -> Result<HttpClient, reqwest::Error> {
    HttpClient::builder().timeout(timeout).build()
}

/// Timeouts and refused connections are transient; anything else on the wire is left to the classifier.
pub(crate) fn send_failure(provider: &str, err: reqwest::Error) -> ProviderFailure {
    let message = format!("{provider} request failed: {err}");
    if err.is_timeout() || err.is_connect() {
        ProviderFailure::unavailable(message)
    } else {
        ProviderFailure::transport(message)
    }
}

/// Turns an upstream response into a reply, or a failure carrying status, body and `Retry-After`.
pub(crate) async fn read_reply(
    provider: &str,
    response: reqwest::Response,
) -> Result<ProviderReply, ProviderFailure> {
    let status = response.status();
    let retry_after = response
        .headers()
        .get(RETRY_AFTER)
        .and_then(|value| value.to_str().ok())
        .and_then(parse_retry_after);
    let mime = response
        .headers()
        .get(CONTENT_TYPE)
        .and_then(|value| value.to_str().ok())
        .map(|value| value.split(';').next().unwrap_or(value).trim().to_ascii_lowercase())
        .unwrap_or_default();

    if !status.is_success() {
        let body = response.text().await.unwrap_or_default();
        let mut failure = ProviderFailure::http(status.as_u16(), body).with_retry_after(retry_after);
        failure.message = format!("{provider} {}", failure.message);
        return Err(failure);
    }

    let bytes = response
        .bytes()
        .await
        .map_err(|err| send_failure(provider, err))?;
    if mime == "application/json" || mime.ends_with("+json") {
        let value: Value = serde_json::from_slice(&bytes).map_err(|err| {
            ProviderFailure::fatal(format!("{provider} returned invalid JSON payload: {err}"))
        })?;
        return Ok(ProviderReply::Json(value));
    }
    if mime.starts_with("text/") {
        return Ok(ProviderReply::Text(String::from_utf8_lossy(&bytes).into_owned()));
    }
    Ok(ProviderReply::Binary {
        bytes: bytes.to_vec(),
        mime,
    })
}
