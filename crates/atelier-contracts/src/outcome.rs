use std::fmt;
use std::time::Duration;

use serde::Serialize;
use serde_json::Value;

use crate::retry::BackoffKind;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "kebab-case")]
pub enum AttemptStatus {
    Success,
    RetryableLoading,
    RetryableRateLimited,
    NotFound,
    Fatal,
}

impl AttemptStatus {
    pub fn as_str(self) -> &'static str {
        match self {
            AttemptStatus::Success => "success",
            AttemptStatus::RetryableLoading => "retryable-loading",
            AttemptStatus::RetryableRateLimited => "retryable-rate-limited",
            AttemptStatus::NotFound => "not-found",
            AttemptStatus::Fatal => "fatal",
        }
    }

    pub fn backoff_kind(self) -> Option<BackoffKind> {
        match self {
            AttemptStatus::RetryableLoading => Some(BackoffKind::Loading),
            AttemptStatus::RetryableRateLimited => Some(BackoffKind::RateLimited),
            _ => None,
        }
    }
}

impl fmt::Display for AttemptStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// What a provider reports when a call does not succeed.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct ProviderFailure {
    /// HTTP status, `None` for transport failures and local errors.
    pub status: Option<u16>,
    pub message: String,
    pub body: String,
    pub retry_after: Option<Duration>,
    /// Set by providers that already know the class (missing key, connect timeout).
    pub forced: Option<AttemptStatus>,
}

impl ProviderFailure {
    pub fn http(status: u16, body: impl Into<String>) -> Self {
        let body = body.into();
        Self {
            status: Some(status),
            message: format!("request failed ({status}): {}", truncate_text(&body, 512)),
            body,
            ..Self::default()
        }
    }

    pub fn transport(message: impl Into<String>) -> Self {
        Self {
            message: message.into(),
            ..Self::default()
        }
    }

    pub fn fatal(message: impl Into<String>) -> Self {
        Self {
            message: message.into(),
            forced: Some(AttemptStatus::Fatal),
            ..Self::default()
        }
    }

    /// Transient transport failure (connect error, timeout): retried like a cold start.
    pub fn unavailable(message: impl Into<String>) -> Self {
        Self {
            message: message.into(),
            forced: Some(AttemptStatus::RetryableLoading),
            ..Self::default()
        }
    }

    pub fn with_retry_after(mut self, retry_after: Option<Duration>) -> Self {
        self.retry_after = retry_after;
        self
    }
}

impl fmt::Display for ProviderFailure {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.message)
    }
}

#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Classified {
    pub status: AttemptStatus,
    pub wait_hint: Option<Duration>,
}

impl Classified {
    fn new(status: AttemptStatus, wait_hint: Option<Duration>) -> Self {
        Self { status, wait_hint }
    }
}

/// Maps a provider failure onto the closed attempt status set.
///
/// Structured signals (HTTP status, JSON `error`/`estimated_time` fields) win.
/// Substring matching on the message is a last resort for failures that carry
/// no status; it is a heuristic and only the retry policy it triggers matters.
pub fn classify(failure: &ProviderFailure) -> Classified {
    if let Some(status) = failure.forced {
        return Classified::new(status, None);
    }

    let parsed: Option<Value> = serde_json::from_str(failure.body.trim()).ok();
    let estimated = parsed
        .as_ref()
        .and_then(|body| body.get("estimated_time"))
        .and_then(Value::as_f64)
        .and_then(hint_from_secs);
    let error_text = parsed
        .as_ref()
        .and_then(|body| body.get("error"))
        .map(|error| match error {
            Value::String(text) => text.to_ascii_lowercase(),
            Value::Object(obj) => obj
                .get("message")
                .and_then(Value::as_str)
                .unwrap_or_default()
                .to_ascii_lowercase(),
            _ => String::new(),
        })
        .unwrap_or_default();

    if let Some(status) = failure.status {
        return match status {
            503 => Classified::new(AttemptStatus::RetryableLoading, estimated),
            429 => Classified::new(AttemptStatus::RetryableRateLimited, failure.retry_after),
            404 | 410 => Classified::new(AttemptStatus::NotFound, None),
            _ if estimated.is_some() => Classified::new(AttemptStatus::RetryableLoading, estimated),
            400 | 422
                if contains_any(
                    &error_text,
                    &["not supported", "does not exist", "not found", "unsupported"],
                ) =>
            {
                Classified::new(AttemptStatus::NotFound, None)
            }
            500 | 502 | 504 => Classified::new(AttemptStatus::RetryableLoading, None),
            _ => Classified::new(AttemptStatus::Fatal, None),
        };
    }

    let haystack = format!("{} {}", failure.message, failure.body).to_ascii_lowercase();
    if estimated.is_some() || contains_any(&haystack, &["loading", "503"]) {
        return Classified::new(AttemptStatus::RetryableLoading, estimated);
    }
    if contains_any(&haystack, &["rate limit", "rate-limit", "429", "too many requests"]) {
        return Classified::new(AttemptStatus::RetryableRateLimited, failure.retry_after);
    }
    if contains_any(&haystack, &["not found", "404", "does not exist", "not supported"]) {
        return Classified::new(AttemptStatus::NotFound, None);
    }
    Classified::new(AttemptStatus::Fatal, None)
}

/// Parses a `Retry-After` header value given in seconds.
pub fn parse_retry_after(raw: &str) -> Option<Duration> {
    raw.trim().parse::<f64>().ok().and_then(hint_from_secs)
}

/// Provider-supplied seconds; values past `Duration::MAX` saturate and are
/// capped later by the retry policy.
fn hint_from_secs(secs: f64) -> Option<Duration> {
    if !secs.is_finite() || secs < 0.0 {
        return None;
    }
    Some(Duration::try_from_secs_f64(secs).unwrap_or(Duration::MAX))
}

/// One retry-loop iteration, as recorded in logs and the event journal.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct AttemptOutcome {
    pub candidate: String,
    pub backend_id: String,
    pub attempt: u32,
    pub status: AttemptStatus,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub wait_hint_ms: Option<u64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub message: Option<String>,
}

fn contains_any(haystack: &str, needles: &[&str]) -> bool {
    needles.iter().any(|needle| haystack.contains(needle))
}

pub fn truncate_text(value: &str, max_chars: usize) -> String {
    if value.chars().count() <= max_chars {
        return value.to_string();
    }
    value.chars().take(max_chars).collect::<String>() + "…"
}
