//! AI alt-text generation
//!
//! The HTTP client speaks the image-to-text run API: the image goes up as a
//! JSON array of bytes together with a prompt, and the description comes
//! back under `result.description`.

use async_trait::async_trait;
use serde::{Deserialize, Serialize};

use crate::error::AppError;

pub const DEFAULT_PROMPT: &str = "Write concise alt text for this image for a screen reader user. \
Describe the important visual content in one or two sentences without starting with 'Image of'.";
const MAX_TOKENS: u32 = 256;

#[async_trait]
pub trait AltTextGenerator: Send + Sync {
    async fn describe(&self, image: &[u8]) -> Result<String, AppError>;
}

/// Used when no inference endpoint is configured; every call is an upstream failure
#[derive(Debug, Clone, Copy, Default)]
pub struct UnconfiguredAltText;

#[async_trait]
impl AltTextGenerator for UnconfiguredAltText {
    async fn describe(&self, _image: &[u8]) -> Result<String, AppError> {
        Err(AppError::Upstream(
            "AI inference endpoint is not configured".to_string(),
        ))
    }
}

#[derive(Serialize)]
struct InferenceRequest<'a> {
    image: &'a [u8],
    prompt: &'a str,
    max_tokens: u32,
}

#[derive(Deserialize)]
struct InferenceResponse {
    result: Option<InferenceResult>,
}

#[derive(Deserialize)]
struct InferenceResult {
    description: Option<String>,
}

#[derive(Debug, Clone)]
pub struct HttpAltTextGenerator {
    client: reqwest::Client,
    endpoint: String,
    token: Option<String>,
    prompt: String,
}

impl HttpAltTextGenerator {
    pub fn new(
        client: reqwest::Client,
        endpoint: impl Into<String>,
        token: Option<String>,
        prompt: Option<String>,
    ) -> Self {
        Self {
            client,
            endpoint: endpoint.into(),
            token,
            prompt: prompt.unwrap_or_else(|| DEFAULT_PROMPT.to_string()),
        }
    }
}

#[async_trait]
impl AltTextGenerator for HttpAltTextGenerator {
    async fn describe(&self, image: &[u8]) -> Result<String, AppError> {
        let body = InferenceRequest {
            image,
            prompt: &self.prompt,
            max_tokens: MAX_TOKENS,
        };

        let mut request = self.client.post(&self.endpoint).json(&body);
        if let Some(token) = &self.token {
            request = request.bearer_auth(token);
        }

        let response = request
            .send()
            .await
            .map_err(|e| AppError::Upstream(format!("inference request failed: {}", e)))?;
        let status = response.status();
        if !status.is_success() {
            let detail = response.text().await.unwrap_or_default();
            return Err(AppError::Upstream(format!(
                "inference returned {}: {}",
                status, detail
            )));
        }

        let parsed: InferenceResponse = response
            .json()
            .await
            .map_err(|e| AppError::Upstream(format!("invalid inference response: {}", e)))?;

        parsed
            .result
            .and_then(|r| r.description)
            .map(|d| d.trim().to_string())
            .filter(|d| !d.is_empty())
            .ok_or_else(|| AppError::Upstream("inference returned no description".to_string()))
    }
}
