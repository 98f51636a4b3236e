use atelier_contracts::models::RegistryError;
use atelier_contracts::requests::RequestError;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum GatewayError {
    #[error(transparent)]
    Request(#[from] RequestError),
    #[error(transparent)]
    Registry(#[from] RegistryError),
    #[error("Model '{candidate}' failed: {message}")]
    Fatal { candidate: String, message: String },
    #[error("All models failed. Last error: {last_error}")]
    AllCandidatesFailed {
        last_error: String,
        attempted: Vec<String>,
    },
    #[error("Model '{candidate}' returned an unexpected response: {message}")]
    Decode { candidate: String, message: String },
    #[error("failed to build HTTP client: {0}")]
    HttpClient(#[from] reqwest::Error),
}

impl GatewayError {
    /// Problems with the caller's input: answered with 400 and never retried.
    pub fn is_client_error(&self) -> bool {
        matches!(self, GatewayError::Request(_))
    }

    pub fn kind(&self) -> &'static str {
        match self {
            GatewayError::Request(_) => "client-error",
            GatewayError::Registry(_) => "configuration",
            GatewayError::Fatal { .. } => "provider-fatal",
            GatewayError::AllCandidatesFailed { .. } => "all-candidates-failed",
            GatewayError::Decode { .. } => "provider-decode",
            GatewayError::HttpClient(_) => "configuration",
        }
    }

    pub fn hint(&self) -> String {
        match self {
            GatewayError::Request(RequestError::MissingField { field, .. }) => {
                format!("Include a non-empty '{field}' field in the request.")
            }
            GatewayError::Request(RequestError::InvalidField { field, .. }) => {
                format!("Check the '{field}' value and send the request again.")
            }
            GatewayError::Registry(_) | GatewayError::HttpClient(_) => {
                "The gateway model table cannot serve this request; contact the operator.".to_string()
            }
            GatewayError::Fatal { .. } => {
                "The provider rejected the request. Verify the provider API key and the request parameters.".to_string()
            }
            GatewayError::AllCandidatesFailed { .. } => {
                "Every model is unavailable right now (cold starts, rate limits or missing models). Retry in a minute or choose another entry from availableModels.".to_string()
            }
            GatewayError::Decode { .. } => {
                "The provider answered in an unexpected format. Try another model from availableModels.".to_string()
            }
        }
    }
}
