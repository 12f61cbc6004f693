//! Image payload extraction
//!
//! Images arrive as a remote URL, a base64 body (optionally a `data:` URL)
//! or a multipart form. Every path enforces the same decoded byte budget.

use axum::extract::Multipart;
use axum::http::{header::CONTENT_TYPE, HeaderMap};
use base64::{engine::general_purpose::STANDARD, Engine};
use reqwest::Url;

use crate::error::AppError;

/// Image bytes plus the optional encode settings sent alongside them
#[derive(Debug, Default)]
pub struct ImageUpload {
    pub bytes: Vec<u8>,
    pub quality: Option<u8>,
    pub lossy: Option<bool>,
    pub store: Option<bool>,
}

fn check_budget(len: usize, max_bytes: usize) -> Result<(), AppError> {
    if len > max_bytes {
        return Err(AppError::PayloadTooLarge);
    }
    Ok(())
}

pub fn is_multipart(headers: &HeaderMap) -> bool {
    headers
        .get(CONTENT_TYPE)
        .and_then(|v| v.to_str().ok())
        .is_some_and(|ct| ct.to_ascii_lowercase().starts_with("multipart/form-data"))
}

/// Decodes a base64 payload, accepting a `data:<mime>;base64,` prefix and
/// embedded whitespace
pub fn decode_base64_image(raw: &[u8], max_bytes: usize) -> Result<Vec<u8>, AppError> {
    let text = std::str::from_utf8(raw)
        .map_err(|_| AppError::Validation("image must be base64 text".to_string()))?
        .trim();
    let payload = match text.split_once(";base64,") {
        Some((prefix, data)) if prefix.starts_with("data:") => data,
        _ => text,
    };
    let compact: String = payload.chars().filter(|c| !c.is_ascii_whitespace()).collect();
    if compact.is_empty() {
        return Err(AppError::Validation("image is empty".to_string()));
    }

    let bytes = STANDARD
        .decode(compact.as_bytes())
        .map_err(|_| AppError::Validation("image is not valid base64".to_string()))?;
    check_budget(bytes.len(), max_bytes)?;
    Ok(bytes)
}

fn parse_flag(name: &str, value: &str) -> Result<bool, AppError> {
    match value.trim().to_ascii_lowercase().as_str() {
        "true" | "1" | "yes" | "on" => Ok(true),
        "false" | "0" | "no" | "off" => Ok(false),
        _ => Err(AppError::Validation(format!("{} must be a boolean", name))),
    }
}

/// Reads an `image` (or `file`) field plus optional `quality`, `lossy` and
/// `store` fields
pub async fn read_multipart(
    mut multipart: Multipart,
    max_bytes: usize,
) -> Result<ImageUpload, AppError> {
    let mut upload = ImageUpload::default();
    let mut found = false;

    while let Some(field) = multipart
        .next_field()
        .await
        .map_err(|e| AppError::Validation(e.body_text()))?
    {
        let name = field.name().unwrap_or_default().to_string();
        match name.as_str() {
            "image" | "file" => {
                let bytes = field
                    .bytes()
                    .await
                    .map_err(|e| AppError::Validation(e.body_text()))?;
                check_budget(bytes.len(), max_bytes)?;
                upload.bytes = bytes.to_vec();
                found = true;
            }
            "quality" | "lossy" | "store" => {
                let text = field
                    .text()
                    .await
                    .map_err(|e| AppError::Validation(e.body_text()))?;
                match name.as_str() {
                    "quality" => {
                        upload.quality = Some(text.trim().parse().map_err(|_| {
                            AppError::Validation("quality must be an integer".to_string())
                        })?)
                    }
                    "lossy" => upload.lossy = Some(parse_flag("lossy", &text)?),
                    _ => upload.store = Some(parse_flag("store", &text)?),
                }
            }
            _ => {}
        }
    }

    if !found {
        return Err(AppError::Validation(
            "multipart form must include an 'image' field".to_string(),
        ));
    }
    Ok(upload)
}

/// Downloads a remote image, refusing anything over `max_bytes`
pub async fn fetch_image(
    client: &reqwest::Client,
    url: &str,
    max_bytes: usize,
) -> Result<Vec<u8>, AppError> {
    let parsed =
        Url::parse(url).map_err(|_| AppError::Validation("url must be an absolute URL".to_string()))?;
    if !matches!(parsed.scheme(), "http" | "https") {
        return Err(AppError::Validation("url must use http or https".to_string()));
    }

    let mut response = client
        .get(parsed)
        .send()
        .await
        .map_err(|e| AppError::Validation(format!("could not fetch image: {}", e)))?;
    if !response.status().is_success() {
        return Err(AppError::Validation(format!(
            "could not fetch image: remote returned {}",
            response.status()
        )));
    }
    // Declared length is checked up front, but chunked bodies carry none
    if let Some(len) = response.content_length() {
        check_budget(len as usize, max_bytes)?;
    }

    let mut bytes = Vec::new();
    while let Some(chunk) = response
        .chunk()
        .await
        .map_err(|e| AppError::Validation(format!("could not fetch image: {}", e)))?
    {
        // Stop reading as soon as the budget is exceeded
        check_budget(bytes.len() + chunk.len(), max_bytes)?;
        bytes.extend_from_slice(&chunk);
    }
    Ok(bytes)
}
