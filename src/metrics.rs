//! KV-backed metrics
//!
//! Every counter and timestamp lives under its own colon-separated key;
//! related values are siblings sharing a prefix
//! (`metrics:redirect:gh:ok`, `metrics:redirect:gh:last-hit`), so each write
//! touches exactly one key.
//!
//! Counters are decimal strings updated with read-modify-write. Two
//! concurrent increments of the same key can lose an update. This is a known
//! limitation of the plain KV port, not something callers should rely on
//! being exact under concurrency.

use std::sync::Arc;

use axum::http::StatusCode;
use chrono::Utc;
use uuid::Uuid;

use crate::error::{AuthError, KvError};
use crate::kv::KvStore;

pub const METRICS_PREFIX: &str = "metrics:";
pub const METRICS_OK: &str = "metrics:ok";
pub const METRICS_ERROR: &str = "metrics:error";
pub const METRICS_LAST_ERROR: &str = "metrics:last-error";

/// Normalises free text (slugs, path segments) into a kebab-case key segment
pub fn key_segment(raw: &str) -> String {
    let segment: String = raw
        .trim()
        .to_lowercase()
        .chars()
        .map(|c| if c.is_ascii_alphanumeric() || c == '-' { c } else { '-' })
        .collect();
    if segment.is_empty() {
        "unknown".to_string()
    } else {
        segment
    }
}

pub fn now_millis() -> i64 {
    Utc::now().timestamp_millis()
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum VisitorClass {
    Bot,
    Human,
    Unknown,
}

impl VisitorClass {
    pub fn as_str(&self) -> &'static str {
        match self {
            VisitorClass::Bot => "bot",
            VisitorClass::Human => "human",
            VisitorClass::Unknown => "unknown",
        }
    }
}

const BOT_MARKERS: &[&str] = &[
    "bot",
    "crawler",
    "spider",
    "slurp",
    "curl",
    "wget",
    "python-requests",
    "python-urllib",
    "go-http-client",
    "okhttp",
    "httpclient",
    "headless",
    "scrapy",
    "node-fetch",
    "axios",
    "postman",
    "insomnia",
    "facebookexternalhit",
    "preview",
];

/// User-Agent heuristic: known automation markers win, then browser engines
pub fn classify_visitor(user_agent: Option<&str>) -> VisitorClass {
    let ua = match user_agent.map(str::trim) {
        Some(ua) if !ua.is_empty() => ua.to_lowercase(),
        _ => return VisitorClass::Unknown,
    };

    if BOT_MARKERS.iter().any(|marker| ua.contains(marker)) {
        return VisitorClass::Bot;
    }
    if ua.starts_with("mozilla/")
        && ["applewebkit", "gecko", "trident"]
            .iter()
            .any(|engine| ua.contains(engine))
    {
        return VisitorClass::Human;
    }
    VisitorClass::Unknown
}

/// What the metrics layer needs to know about a request
#[derive(Debug, Clone, Default)]
pub struct RequestContext {
    pub path: String,
    pub user_agent: Option<String>,
}

impl RequestContext {
    pub fn new(path: impl Into<String>, user_agent: Option<String>) -> Self {
        Self {
            path: path.into(),
            user_agent,
        }
    }

    /// First path segment after `/api/`, e.g. `metrics` for `/api/metrics`
    pub fn resource(&self) -> Option<String> {
        // Redirects and image objects live outside `/api` and have no resource
        let rest = self.path.strip_prefix("/api/")?;
        let first = rest.split('/').next().filter(|s| !s.is_empty())?;
        Some(key_segment(first))
    }

    pub fn visitor(&self) -> VisitorClass {
        classify_visitor(self.user_agent.as_deref())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RedirectOutcome {
    Ok,
    Error,
}

impl RedirectOutcome {
    fn as_str(&self) -> &'static str {
        match self {
            RedirectOutcome::Ok => "ok",
            RedirectOutcome::Error => "error",
        }
    }
}

fn outcome_for(status: StatusCode) -> &'static str {
    if status.as_u16() < 400 {
        "ok"
    } else {
        "error"
    }
}

pub fn redirect_key(slug: &str, suffix: &str) -> String {
    format!("metrics:redirect:{}:{}", key_segment(slug), suffix)
}

pub fn usage_key(token_id: &Uuid, suffix: &str) -> String {
    format!("auth:usage:{}:{}", token_id, suffix)
}

#[derive(Clone)]
pub struct MetricsStore {
    kv: Arc<dyn KvStore>,
}

impl MetricsStore {
    pub fn new(kv: Arc<dyn KvStore>) -> Self {
        Self { kv }
    }

    /// Reads the counter (absent counts as 0), adds one and writes it back
    pub async fn try_increment(&self, key: &str) -> Result<i64, KvError> {
        // A corrupted value restarts the counter rather than failing the write
        let current = match self.kv.get(key).await? {
            Some(raw) => raw.trim().parse::<i64>().unwrap_or_else(|_| {
                tracing::warn!(key, value = %raw, "non-numeric counter reset");
                0
            }),
            None => 0,
        };
        let next = current.saturating_add(1);
        self.kv.put(key, &next.to_string()).await?;
        Ok(next)
    }

    /// Fail-open increment: a storage error is logged and swallowed
    pub async fn increment(&self, key: &str) {
        if let Err(e) = self.try_increment(key).await {
            tracing::warn!(key, "failed to increment metric: {}", e);
        }
    }

    pub async fn try_set_timestamp(&self, key: &str, when_millis: i64) -> Result<(), KvError> {
        self.kv.put(key, &when_millis.to_string()).await
    }

    /// Fail-open timestamp write
    pub async fn set_timestamp(&self, key: &str, when_millis: i64) {
        if let Err(e) = self.try_set_timestamp(key, when_millis).await {
            tracing::warn!(key, "failed to set metric timestamp: {}", e);
        }
    }

    pub async fn get(&self, key: &str) -> Result<Option<String>, KvError> {
        self.kv.get(key).await
    }

    /// Integer value of `key`, 0 when absent or not numeric
    pub async fn counter(&self, key: &str) -> Result<i64, KvError> {
        Ok(self
            .kv
            .get(key)
            .await?
            .and_then(|raw| raw.trim().parse().ok())
            .unwrap_or(0))
    }

    pub async fn scan(&self, prefix: &str) -> Result<Vec<(String, String)>, KvError> {
        self.kv.list(prefix).await
    }

    /// Attempts every increment, reporting the first failure
    async fn increment_all(&self, keys: &[String]) -> Result<(), KvError> {
        let mut first_error = None;
        for key in keys {
            if let Err(e) = self.try_increment(key).await {
                first_error.get_or_insert(e);
            }
        }
        first_error.map_or(Ok(()), Err)
    }

    /// Status-class, per-resource and visitor-class counters for one response
    pub async fn record_api_metrics(
        &self,
        ctx: &RequestContext,
        status: StatusCode,
    ) -> Result<(), KvError> {
        let outcome = outcome_for(status);

        // Global status class, then per resource, then per visitor class
        let mut keys = vec![format!("metrics:{}", outcome)];
        if let Some(resource) = ctx.resource() {
            keys.push(format!("metrics:resources:{}:{}", resource, outcome));
        }
        keys.push(format!("metrics:visitors:{}", ctx.visitor().as_str()));
        self.increment_all(&keys).await
    }

    /// Counts an API error by kind and stamps when it happened
    pub async fn record_api_error_metrics(
        &self,
        ctx: &RequestContext,
        kind: &str,
    ) -> Result<(), KvError> {
        tracing::debug!(path = %ctx.path, kind, "recording error metric");
        self.record_error_kind(kind).await
    }

    /// `errors:<kind>:count`, `errors:<kind>:last-seen` and the global `last-error`
    pub async fn record_error_kind(&self, kind: &str) -> Result<(), KvError> {
        let kind = key_segment(kind);
        let now = now_millis();

        // All three writes are attempted even if one fails
        let counted = self
            .try_increment(&format!("metrics:errors:{}:count", kind))
            .await;
        let stamped = self
            .try_set_timestamp(&format!("metrics:errors:{}:last-seen", kind), now)
            .await;
        let last = self.try_set_timestamp(METRICS_LAST_ERROR, now).await;
        counted.and(stamped).and(last).map(|_| ())
    }

    /// Counts one lookup of `slug` and stamps `last-hit`, for hits and misses alike
    pub async fn update_redirect_metrics(
        &self,
        slug: &str,
        outcome: RedirectOutcome,
    ) -> Result<(), KvError> {
        let counted = self.try_increment(&redirect_key(slug, outcome.as_str())).await;
        let stamped = self
            .try_set_timestamp(&redirect_key(slug, "last-hit"), now_millis())
            .await;
        counted.and(stamped).map(|_| ())
    }

    pub async fn record_auth_failure(&self, error: AuthError) -> Result<(), KvError> {
        self.try_increment(&format!("metrics:auth:{}", error.reason()))
            .await
            .map(|_| ())
    }

    /// `auth:usage:<jti>:count` and `:last-used`, outside the `metrics:` namespace
    pub async fn record_token_usage(&self, token_id: Uuid) -> Result<(), KvError> {
        let counted = self.try_increment(&usage_key(&token_id, "count")).await;
        let stamped = self
            .try_set_timestamp(&usage_key(&token_id, "last-used"), now_millis())
            .await;
        counted.and(stamped).map(|_| ())
    }
}
