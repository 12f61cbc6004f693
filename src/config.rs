//! Runtime configuration read from the environment (and `.env` via dotenvy)

use std::env;

use anyhow::{bail, Context};

use crate::optimiser::ALT_TARGET_BYTES;

#[derive(Debug, Clone)]
pub struct Config {
    pub port: u16,
    pub database_url: String,
    pub jwt_secret: String,
    /// Base used when returning links to stored images
    pub public_url: String,
    /// Decoded input budget for uploaded and fetched images
    pub max_image_bytes: usize,
    /// Size the alt-text search must fit before inference
    pub alt_target_bytes: usize,
    pub ai_api_url: Option<String>,
    pub ai_api_token: Option<String>,
    pub ai_alt_prompt: Option<String>,
    /// Regexes selecting keys for KV export/import; empty selects everything
    pub kv_export_patterns: Vec<String>,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            port: 8080,
            database_url: "data.db".to_string(),
            jwt_secret: String::new(),
            public_url: "http://localhost:8080".to_string(),
            max_image_bytes: ALT_TARGET_BYTES,
            alt_target_bytes: ALT_TARGET_BYTES,
            ai_api_url: None,
            ai_api_token: None,
            ai_alt_prompt: None,
            kv_export_patterns: Vec::new(),
        }
    }
}

fn optional(name: &str) -> Option<String> {
    env::var(name).ok().filter(|v| !v.trim().is_empty())
}

impl Config {
    /// # Environment Variables
    ///
    /// - `PORT` - Server port number (default: 8080)
    /// - `DATABASE_URL` - Path to database file (default: "data.db")
    /// - `JWT_SECRET` - HS256 signing secret (required)
    /// - `PUBLIC_URL` - Base URL for stored image links
    /// - `MAX_IMAGE_BYTES` - Image input budget (default: 4 MiB)
    /// - `ALT_TARGET_BYTES` - Size budget for images sent to inference (default: 4 MiB)
    /// - `AI_API_URL`, `AI_API_TOKEN`, `AI_ALT_PROMPT` - alt-text inference
    /// - `KV_EXPORT_PATTERNS` - comma-separated key regexes for export/import
    pub fn from_env() -> anyhow::Result<Self> {
        let defaults = Config::default();

        let port = match optional("PORT") {
            Some(raw) => raw.parse().with_context(|| format!("invalid PORT '{}'", raw))?,
            None => defaults.port,
        };

        let jwt_secret = optional("JWT_SECRET").context("JWT_SECRET must be set")?;

        let max_image_bytes = match optional("MAX_IMAGE_BYTES") {
            Some(raw) => raw
                .parse()
                .with_context(|| format!("invalid MAX_IMAGE_BYTES '{}'", raw))?,
            None => defaults.max_image_bytes,
        };
        if max_image_bytes == 0 {
            bail!("MAX_IMAGE_BYTES must be greater than zero");
        }

        let alt_target_bytes = match optional("ALT_TARGET_BYTES") {
            Some(raw) => raw
                .parse()
                .with_context(|| format!("invalid ALT_TARGET_BYTES '{}'", raw))?,
            None => defaults.alt_target_bytes,
        };
        if alt_target_bytes == 0 {
            bail!("ALT_TARGET_BYTES must be greater than zero");
        }

        let kv_export_patterns = optional("KV_EXPORT_PATTERNS")
            .map(|raw| {
                raw.split(',')
                    .map(str::trim)
                    .filter(|p| !p.is_empty())
                    .map(String::from)
                    .collect()
            })
            .unwrap_or_default();

        Ok(Self {
            port,
            database_url: optional("DATABASE_URL").unwrap_or(defaults.database_url),
            jwt_secret,
            public_url: optional("PUBLIC_URL")
                .map(|u| u.trim_end_matches('/').to_string())
                .unwrap_or_else(|| format!("http://localhost:{}", port)),
            max_image_bytes,
            alt_target_bytes,
            ai_api_url: optional("AI_API_URL"),
            ai_api_token: optional("AI_API_TOKEN"),
            ai_alt_prompt: optional("AI_ALT_PROMPT"),
            kv_export_patterns,
        })
    }

    /// Request body limit: base64 inflates by 4/3, plus room for multipart framing
    pub fn body_limit(&self) -> usize {
        self.max_image_bytes / 3 * 4 + 64 * 1024
    }
}
