use std::path::PathBuf;
use std::time::Duration;

use crate::providers::non_empty_env;

pub const DEFAULT_REQUEST_TIMEOUT: Duration = Duration::from_secs(120);

/// Provider credentials and runtime switches, read from the process environment.
/// Keys never come from request payloads.
#[derive(Debug, Clone, PartialEq)]
pub struct GatewayConfig {
    pub huggingface_api_key: Option<String>,
    pub huggingface_api_base: Option<String>,
    pub openrouter_api_key: Option<String>,
    pub openrouter_api_base: Option<String>,
    pub openrouter_referer: Option<String>,
    pub request_timeout: Duration,
    /// Route every candidate to the offline dryrun provider.
    pub dryrun: bool,
    pub events_path: Option<PathBuf>,
}

impl Default for GatewayConfig {
    fn default() -> Self {
        Self {
            huggingface_api_key: None,
            huggingface_api_base: None,
            openrouter_api_key: None,
            openrouter_api_base: None,
            openrouter_referer: None,
            request_timeout: DEFAULT_REQUEST_TIMEOUT,
            dryrun: false,
            events_path: None,
        }
    }
}

impl GatewayConfig {
    pub fn from_env() -> Self {
        Self::from_lookup(non_empty_env)
    }

    pub fn from_lookup(lookup: impl Fn(&str) -> Option<String>) -> Self {
        let request_timeout = lookup("ATELIER_REQUEST_TIMEOUT_SECS")
            .and_then(|raw| raw.parse::<u64>().ok())
            .filter(|secs| *secs > 0)
            .map(Duration::from_secs)
            .unwrap_or(DEFAULT_REQUEST_TIMEOUT);
        Self {
            huggingface_api_key: lookup("HUGGINGFACE_API_KEY").or_else(|| lookup("HF_TOKEN")),
            huggingface_api_base: lookup("HUGGINGFACE_API_BASE"),
            openrouter_api_key: lookup("OPENROUTER_API_KEY"),
            openrouter_api_base: lookup("OPENROUTER_API_BASE"),
            openrouter_referer: lookup("OPENROUTER_REFERER"),
            request_timeout,
            dryrun: lookup("ATELIER_DRYRUN")
                .and_then(|raw| flag_value(&raw))
                .unwrap_or(false),
            events_path: lookup("ATELIER_EVENTS_PATH").map(PathBuf::from),
        }
    }
}

pub fn flag_value(raw: &str) -> Option<bool> {
    let lowered = raw.trim().to_ascii_lowercase();
    if matches!(lowered.as_str(), "1" | "true" | "yes" | "on") {
        Some(true)
    } else if matches!(lowered.as_str(), "0" | "false" | "no" | "off") {
        Some(false)
    } else {
        None
    }
}
