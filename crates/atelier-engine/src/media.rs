use std::time::Duration;

use atelier_contracts::requests::{ImageSource, InferenceRequest, Payload, RequestError};
use reqwest::header::CONTENT_TYPE;
use reqwest::Client as HttpClient;
use tracing::debug;

use crate::error::GatewayError;
use crate::providers::http_client;

/// Downloads `imageUrl` inputs once per invocation, so retries and fallback
/// candidates all send the same bytes.
#[derive(Clone)]
pub struct ImageFetcher {
    http: HttpClient,
}

impl ImageFetcher {
    pub fn new(timeout: Duration) -> Result<Self, reqwest::Error> {
        Ok(Self {
            http: http_client(timeout)?,
        })
    }

    /// Replaces an image URL with its downloaded bytes. Other payloads pass through.
    pub async fn inline(&self, mut request: InferenceRequest) -> Result<InferenceRequest, GatewayError> {
        let url = match &request.payload {
            Payload::Image {
                source: ImageSource::Url(url),
                ..
            } => url.clone(),
            _ => return Ok(request),
        };
        let (bytes, mime) = self.fetch(&url).await.map_err(|reason| {
            GatewayError::from(RequestError::InvalidField {
                field: "imageUrl",
                reason,
            })
        })?;
        debug!(url = %url, bytes = bytes.len(), "image fetched");
        if let Payload::Image { source, .. } = &mut request.payload {
            *source = ImageSource::Bytes { bytes, mime };
        }
        Ok(request)
    }

    async fn fetch(&self, url: &str) -> Result<(Vec<u8>, String), String> {
        let response = self
            .http
            .get(url)
            .send()
            .await
            .map_err(|err| format!("failed downloading image ({url}): {err}"))?;
        if !response.status().is_success() {
            return Err(format!(
                "image download failed ({}): {url}",
                response.status().as_u16()
            ));
        }
        let mime = response
            .headers()
            .get(CONTENT_TYPE)
            .and_then(|value| value.to_str().ok())
            .map(|value| value.split(';').next().unwrap_or(value).trim().to_string())
            .filter(|value| !value.is_empty())
            .unwrap_or_else(|| "image/png".to_string());
        let bytes = response
            .bytes()
            .await
            .map_err(|err| format!("failed reading image bytes ({url}): {err}"))?;
        Ok((bytes.to_vec(), mime))
    }
}
