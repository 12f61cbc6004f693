//! Aggregated metrics views
//!
//! Reads are assembled from several scoped `get`/`scan` calls over the
//! `metrics:` namespace rather than one stored blob, so writers only ever
//! touch single keys.

use std::collections::BTreeMap;

use chrono::{DateTime, Utc};
use prometheus::{Encoder, IntCounterVec, IntGauge, IntGaugeVec, Opts, Registry, TextEncoder};
use serde::Serialize;

use crate::document::explode;
use crate::error::{AppError, KvError};
use crate::metrics::{MetricsStore, METRICS_ERROR, METRICS_LAST_ERROR, METRICS_OK, METRICS_PREFIX};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MetricsFormat {
    Json,
    Yaml,
    Prometheus,
}

impl MetricsFormat {
    pub fn parse(raw: Option<&str>) -> Result<Self, AppError> {
        match raw.map(|s| s.trim().to_lowercase()).as_deref() {
            None | Some("") | Some("json") => Ok(MetricsFormat::Json),
            Some("yaml") | Some("yml") => Ok(MetricsFormat::Yaml),
            Some("prometheus") | Some("prom") => Ok(MetricsFormat::Prometheus),
            Some(other) => Err(AppError::Validation(format!(
                "unsupported metrics format '{}'",
                other
            ))),
        }
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct Totals {
    pub ok: i64,
    pub error: i64,
    pub total: i64,
}

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct MetricsReport {
    pub totals: Totals,
    pub last_error: Option<i64>,
    pub resources: serde_yaml::Value,
    pub visitors: serde_yaml::Value,
    pub redirects: serde_yaml::Value,
    pub errors: serde_yaml::Value,
    pub auth: serde_yaml::Value,
}

async fn section(metrics: &MetricsStore, prefix: &str) -> Result<serde_yaml::Value, KvError> {
    let entries = metrics.scan(prefix).await?.into_iter().map(|(key, value)| {
        let relative = key.strip_prefix(prefix).unwrap_or(&key).to_string();
        (relative, value)
    });
    Ok(explode(entries))
}

pub async fn build_report(metrics: &MetricsStore) -> Result<MetricsReport, KvError> {
    let ok = metrics.counter(METRICS_OK).await?;
    let error = metrics.counter(METRICS_ERROR).await?;
    let last_error = metrics
        .get(METRICS_LAST_ERROR)
        .await?
        .and_then(|raw| raw.parse().ok());

    Ok(MetricsReport {
        totals: Totals {
            ok,
            error,
            total: ok + error,
        },
        last_error,
        resources: section(metrics, "metrics:resources:").await?,
        visitors: section(metrics, "metrics:visitors:").await?,
        redirects: section(metrics, "metrics:redirect:").await?,
        errors: section(metrics, "metrics:errors:").await?,
        auth: section(metrics, "metrics:auth:").await?,
    })
}

/// Prometheus families rebuilt from the KV scan on every scrape.
/// Slugs, resources and kinds are labels, so the set of metric names is fixed.
struct PromFamilies {
    requests: IntCounterVec,
    resources: IntCounterVec,
    visitors: IntCounterVec,
    redirects: IntCounterVec,
    redirect_last_hit: IntGaugeVec,
    errors: IntCounterVec,
    error_last_seen: IntGaugeVec,
    auth_failures: IntCounterVec,
    last_error: IntGauge,
}

impl PromFamilies {
    fn register(registry: &Registry) -> prometheus::Result<Self> {
        let families = Self {
            requests: IntCounterVec::new(
                Opts::new("site_requests_total", "API responses by outcome"),
                &["outcome"],
            )?,
            resources: IntCounterVec::new(
                Opts::new("site_resource_requests_total", "API responses by resource and outcome"),
                &["outcome", "resource"],
            )?,
            visitors: IntCounterVec::new(
                Opts::new("site_visitors_total", "API requests by visitor class"),
                &["class"],
            )?,
            redirects: IntCounterVec::new(
                Opts::new("site_redirects_total", "Redirect lookups by slug and outcome"),
                &["outcome", "slug"],
            )?,
            redirect_last_hit: IntGaugeVec::new(
                Opts::new(
                    "site_redirect_last_hit_timestamp_milliseconds",
                    "Last lookup of a slug, epoch milliseconds",
                ),
                &["slug"],
            )?,
            errors: IntCounterVec::new(
                Opts::new("site_errors_total", "Errors by kind"),
                &["kind"],
            )?,
            error_last_seen: IntGaugeVec::new(
                Opts::new(
                    "site_error_last_seen_timestamp_milliseconds",
                    "Last occurrence of an error kind, epoch milliseconds",
                ),
                &["kind"],
            )?,
            auth_failures: IntCounterVec::new(
                Opts::new("site_auth_failures_total", "Rejected credentials by reason"),
                &["reason"],
            )?,
            last_error: IntGauge::new(
                "site_last_error_timestamp_milliseconds",
                "Last error of any kind, epoch milliseconds",
            )?,
        };

        registry.register(Box::new(families.requests.clone()))?;
        registry.register(Box::new(families.resources.clone()))?;
        registry.register(Box::new(families.visitors.clone()))?;
        registry.register(Box::new(families.redirects.clone()))?;
        registry.register(Box::new(families.redirect_last_hit.clone()))?;
        registry.register(Box::new(families.errors.clone()))?;
        registry.register(Box::new(families.error_last_seen.clone()))?;
        registry.register(Box::new(families.auth_failures.clone()))?;
        registry.register(Box::new(families.last_error.clone()))?;
        Ok(families)
    }

    /// Routes one `metrics:` entry to its family; unknown layouts are skipped
    fn record(&self, key: &str, value: i64) {
        let Some(rest) = key.strip_prefix(METRICS_PREFIX) else {
            return;
        };
        let segments: Vec<&str> = rest.split(':').collect();
        match segments.as_slice() {
            [outcome @ ("ok" | "error")] => add(&self.requests, &[*outcome], value),
            ["last-error"] => self.last_error.set(value),
            ["resources", resource, outcome] => add(&self.resources, &[*outcome, *resource], value),
            ["visitors", class] => add(&self.visitors, &[*class], value),
            ["redirect", slug, "last-hit"] => {
                self.redirect_last_hit.with_label_values(&[*slug]).set(value)
            }
            ["redirect", slug, outcome] => add(&self.redirects, &[*outcome, *slug], value),
            ["errors", kind, "count"] => add(&self.errors, &[*kind], value),
            ["errors", kind, "last-seen"] => {
                self.error_last_seen.with_label_values(&[*kind]).set(value)
            }
            ["auth", reason] => add(&self.auth_failures, &[*reason], value),
            _ => tracing::trace!(key, "metric key has no prometheus family"),
        }
    }
}

fn add(family: &IntCounterVec, labels: &[&str], value: i64) {
    // Counters only move forward
    if let Ok(value) = u64::try_from(value) {
        family.with_label_values(labels).inc_by(value);
    }
}

/// Prometheus text exposition of every numeric `metrics:` entry
pub fn render_prometheus(entries: &[(String, String)]) -> prometheus::Result<String> {
    let registry = Registry::new();
    let families = PromFamilies::register(&registry)?;
    for (key, raw) in entries {
        if let Ok(value) = raw.trim().parse::<i64>() {
            families.record(key, value);
        }
    }

    let mut buffer = Vec::new();
    TextEncoder::new().encode(&registry.gather(), &mut buffer)?;
    String::from_utf8(buffer).map_err(|e| prometheus::Error::Msg(e.to_string()))
}

pub async fn prometheus_text(metrics: &MetricsStore) -> Result<String, AppError> {
    let entries = metrics.scan(METRICS_PREFIX).await?;
    render_prometheus(&entries).map_err(|e| AppError::Internal(anyhow::Error::from(e)))
}

#[derive(Debug, Clone, Serialize, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct RedirectStat {
    pub slug: String,
    pub hits: i64,
    pub errors: i64,
    pub last_hit: Option<DateTime<Utc>>,
}

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct DashboardSummary {
    pub total_requests: i64,
    pub ok: i64,
    pub error: i64,
    pub error_rate: f64,
    pub visitors: BTreeMap<String, i64>,
    pub top_redirects: Vec<RedirectStat>,
}

const TOP_REDIRECTS: usize = 10;

pub async fn build_dashboard(metrics: &MetricsStore) -> Result<DashboardSummary, KvError> {
    let ok = metrics.counter(METRICS_OK).await?;
    let error = metrics.counter(METRICS_ERROR).await?;
    let total_requests = ok + error;

    let visitors = metrics
        .scan("metrics:visitors:")
        .await?
        .into_iter()
        .filter_map(|(key, raw)| {
            let class = key.rsplit(':').next()?.to_string();
            Some((class, raw.parse().ok()?))
        })
        .collect();

    let mut redirects: BTreeMap<String, RedirectStat> = BTreeMap::new();
    for (key, raw) in metrics.scan("metrics:redirect:").await? {
        let Some((slug, field)) = key
            .strip_prefix("metrics:redirect:")
            .and_then(|rest| rest.rsplit_once(':'))
        else {
            continue;
        };
        let Ok(value) = raw.parse::<i64>() else {
            continue;
        };
        let stat = redirects.entry(slug.to_string()).or_insert_with(|| RedirectStat {
            slug: slug.to_string(),
            hits: 0,
            errors: 0,
            last_hit: None,
        });
        match field {
            "ok" => stat.hits = value,
            "error" => stat.errors = value,
            "last-hit" => stat.last_hit = DateTime::from_timestamp_millis(value),
            _ => {}
        }
    }

    let mut top_redirects: Vec<RedirectStat> = redirects.into_values().collect();
    top_redirects.sort_by(|a, b| b.hits.cmp(&a.hits).then_with(|| a.slug.cmp(&b.slug)));
    top_redirects.truncate(TOP_REDIRECTS);

    let error_rate = if total_requests > 0 {
        error as f64 / total_requests as f64
    } else {
        0.0
    };

    Ok(DashboardSummary {
        total_requests,
        ok,
        error,
        error_rate,
        visitors,
        top_redirects,
    })
}
