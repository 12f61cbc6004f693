//! Request and response bodies for the HTTP API

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::optimiser::OptimisedImage;

/// Query string for `GET /api/metrics`
///
/// # Example
/// Query string: `?format=prometheus`
#[derive(Deserialize, Default)]
pub struct MetricsParams {
    /// `json` (default), `yaml` or `prometheus`
    pub format: Option<String>,
}

/// Query string for `GET /api/admin/kv/export`
#[derive(Deserialize, Default)]
pub struct ExportParams {
    /// `yaml` (default) or `json`
    pub format: Option<String>,
}

/// Query string for `GET /api/ai/alt`
#[derive(Deserialize)]
pub struct AltTextParams {
    /// Remote image to describe
    pub url: String,
}

/// Query string for `GET /api/images/optimise`
///
/// # Example
/// Query string: `?url=https://example.com/a.png&quality=70&lossy=true`
#[derive(Deserialize)]
pub struct OptimiseParams {
    pub url: String,
    pub quality: Option<u8>,
    pub lossy: Option<bool>,
    /// Persist the result and return its URL instead of inline bytes
    pub store: Option<bool>,
}

/// JSON body for `POST /api/images/optimise`
///
/// # Example
/// ```json
/// { "image": "iVBORw0KGgo...", "quality": 70, "lossy": true, "store": true }
/// ```
#[derive(Deserialize)]
pub struct OptimiseRequest {
    /// Base64 encoded image, optionally as a `data:` URL
    pub image: String,
    pub quality: Option<u8>,
    pub lossy: Option<bool>,
    pub store: Option<bool>,
}

#[derive(Serialize)]
pub struct OptimiseResponse {
    #[serde(flatten)]
    pub result: OptimisedImage,
    /// Base64 WebP bytes, present when the image was not stored
    #[serde(skip_serializing_if = "Option::is_none")]
    pub image: Option<String>,
}

#[derive(Serialize)]
#[serde(rename_all = "camelCase")]
pub struct AltTextResponse {
    pub alt_text: String,
    pub width: u32,
    pub height: u32,
    pub compression_ratio: f64,
    /// Bytes sent to the model
    pub size: usize,
}

/// Request payload for creating a redirect
///
/// # Example
/// ```json
/// { "url": "https://github.com/x", "slug": "gh" }
/// ```
#[derive(Deserialize)]
pub struct CreateRedirectRequest {
    /// Destination URL
    pub url: String,

    /// Optional custom slug; a random 6-character one is generated otherwise
    pub slug: Option<String>,
}

#[derive(Serialize)]
#[serde(rename_all = "camelCase")]
pub struct RevokeResponse {
    pub token_id: Uuid,
    pub revoked_at: DateTime<Utc>,
}
