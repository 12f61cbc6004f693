//! Short-link redirects
//!
//! Entries live under `redirect:<slug>` with the destination URL as value.
//! Every lookup, hit or miss, is counted under `metrics:redirect:<slug>:*`
//! as a best-effort task so the redirect itself never waits on or fails
//! because of metrics. Slugs share the kebab-case alphabet of metric keys,
//! so a slug is its own key segment and two slugs never share counters.

use std::sync::Arc;

use rand::{distr::Alphanumeric, Rng};
use reqwest::Url;
use serde::Serialize;

use crate::error::AppError;
use crate::kv::KvStore;
use crate::metrics::{MetricsStore, RedirectOutcome};
use crate::tasks::BackgroundTasks;

pub const REDIRECT_PREFIX: &str = "redirect:";
const RANDOM_SLUG_LEN: usize = 6;
const MAX_SLUG_LEN: usize = 64;
const RANDOM_SLUG_ATTEMPTS: usize = 5;
/// Error kind for lookups whose slug can never exist
pub const INVALID_SLUG_ERROR: &str = "invalid-slug";

pub fn redirect_entry_key(slug: &str) -> String {
    format!("{}{}", REDIRECT_PREFIX, slug)
}

/// Lowercased slug, or `None` when it contains anything but `[a-z0-9-]`
pub fn normalise_slug(raw: &str) -> Option<String> {
    let slug = raw.trim().to_lowercase();
    let valid = !slug.is_empty()
        && slug.len() <= MAX_SLUG_LEN
        && slug.chars().all(|c| c.is_ascii_alphanumeric() || c == '-');
    valid.then_some(slug)
}

fn random_slug() -> String {
    rand::rng()
        .sample_iter(&Alphanumeric)
        .take(RANDOM_SLUG_LEN)
        .map(|b| char::from(b).to_ascii_lowercase())
        .collect()
}

#[derive(Debug, Clone, Serialize, PartialEq, Eq)]
pub struct RedirectEntry {
    pub slug: String,
    pub url: String,
}

#[derive(Clone)]
pub struct RedirectResolver {
    kv: Arc<dyn KvStore>,
    metrics: MetricsStore,
    tasks: BackgroundTasks,
}

impl RedirectResolver {
    pub fn new(kv: Arc<dyn KvStore>, metrics: MetricsStore, tasks: BackgroundTasks) -> Self {
        Self { kv, metrics, tasks }
    }

    pub async fn resolve(&self, slug: &str) -> Result<String, AppError> {
        let Some(slug) = normalise_slug(slug) else {
            // No slug namespace to count under, so the miss lands in the error kinds
            let metrics = self.metrics.clone();
            self.tasks
                .run("redirect-metrics", async move {
                    metrics.record_error_kind(INVALID_SLUG_ERROR).await
                })
                .await;
            return Err(AppError::NotFound("redirect".to_string()));
        };

        let target = self.kv.get(&redirect_entry_key(&slug)).await?;
        let outcome = if target.is_some() {
            RedirectOutcome::Ok
        } else {
            RedirectOutcome::Error
        };

        let metrics = self.metrics.clone();
        let counted_slug = slug.clone();
        self.tasks
            .run("redirect-metrics", async move {
                metrics.update_redirect_metrics(&counted_slug, outcome).await
            })
            .await;

        match target {
            Some(url) => {
                tracing::debug!(slug = %slug, url = %url, "redirect resolved");
                Ok(url)
            }
            None => Err(AppError::NotFound(format!("redirect '{}'", slug))),
        }
    }

    /// Stores a new entry. Without a slug a random 6-character one is generated.
    pub async fn create(&self, url: &str, slug: Option<&str>) -> Result<RedirectEntry, AppError> {
        let parsed = Url::parse(url)
            .map_err(|_| AppError::Validation("url must be an absolute URL".to_string()))?;
        if !matches!(parsed.scheme(), "http" | "https") {
            return Err(AppError::Validation(
                "url must use http or https".to_string(),
            ));
        }

        let slug = match slug.filter(|s| !s.trim().is_empty()) {
            Some(requested) => {
                let slug = normalise_slug(requested).ok_or_else(|| {
                    AppError::Validation(
                        "slug may only contain letters, digits and '-'".to_string(),
                    )
                })?;
                if self.kv.get(&redirect_entry_key(&slug)).await?.is_some() {
                    return Err(AppError::Conflict(
                        "Slug already taken. Please choose another.".to_string(),
                    ));
                }
                slug
            }
            None => self.free_random_slug().await?,
        };

        self.kv.put(&redirect_entry_key(&slug), url).await?;
        tracing::info!(slug = %slug, "redirect created");
        Ok(RedirectEntry {
            slug,
            url: url.to_string(),
        })
    }

    async fn free_random_slug(&self) -> Result<String, AppError> {
        for _ in 0..RANDOM_SLUG_ATTEMPTS {
            let candidate = random_slug();
            if self.kv.get(&redirect_entry_key(&candidate)).await?.is_none() {
                return Ok(candidate);
            }
        }
        Err(AppError::Conflict(
            "could not allocate a free slug".to_string(),
        ))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::kv::MemoryKv;

    fn resolver() -> (Arc<MemoryKv>, MetricsStore, RedirectResolver) {
        let kv = Arc::new(MemoryKv::new());
        let metrics = MetricsStore::new(kv.clone());
        let resolver = RedirectResolver::new(kv.clone(), metrics.clone(), BackgroundTasks::inline());
        (kv, metrics, resolver)
    }

    #[tokio::test]
    async fn test_resolve_hit_counts_exactly_once() {
        let (kv, metrics, resolver) = resolver();
        kv.put("redirect:gh", "https://github.com/x").await.unwrap();

        assert_eq!(resolver.resolve("gh").await.unwrap(), "https://github.com/x");
        assert_eq!(metrics.counter("metrics:redirect:gh:ok").await.unwrap(), 1);
        assert_eq!(metrics.counter("metrics:redirect:gh:error").await.unwrap(), 0);
        assert!(metrics.counter("metrics:redirect:gh:last-hit").await.unwrap() > 0);
    }

    #[tokio::test]
    async fn test_resolve_miss() {
        let (_, metrics, resolver) = resolver();
        let err = resolver.resolve("nope").await.unwrap_err();
        assert!(matches!(err, AppError::NotFound(_)));
        assert_eq!(metrics.counter("metrics:redirect:nope:error").await.unwrap(), 1);
    }

    #[tokio::test]
    async fn test_resolve_survives_metrics_failure() {
        let (kv, _, resolver) = resolver();
        kv.put("redirect:gh", "https://github.com/x").await.unwrap();
        kv.set_fail_writes(true);
        assert_eq!(resolver.resolve("GH").await.unwrap(), "https://github.com/x");
    }

    #[tokio::test]
    async fn test_invalid_slug_is_not_found() {
        let (kv, metrics, resolver) = resolver();
        assert!(matches!(
            resolver.resolve("../etc").await,
            Err(AppError::NotFound(_))
        ));
        assert!(kv.list("metrics:redirect:").await.unwrap().is_empty());
        assert_eq!(
            metrics.counter("metrics:errors:invalid-slug:count").await.unwrap(),
            1
        );
        assert!(metrics.counter("metrics:last-error").await.unwrap() > 0);
    }

    #[tokio::test]
    async fn test_similar_slugs_keep_separate_counters() {
        let (kv, metrics, resolver) = resolver();
        kv.put("redirect:a-b", "https://example.com/dash").await.unwrap();
        // Only reachable through a raw import
        kv.put("redirect:a_b", "https://example.com/underscore").await.unwrap();

        assert_eq!(resolver.resolve("a-b").await.unwrap(), "https://example.com/dash");
        assert!(matches!(
            resolver.resolve("a_b").await,
            Err(AppError::NotFound(_))
        ));

        assert_eq!(metrics.counter("metrics:redirect:a-b:ok").await.unwrap(), 1);
        assert_eq!(metrics.counter("metrics:redirect:a-b:error").await.unwrap(), 0);
        assert_eq!(
            metrics.counter("metrics:errors:invalid-slug:count").await.unwrap(),
            1
        );
    }

    #[tokio::test]
    async fn test_create_rejects_underscore_slug() {
        let (_, _, resolver) = resolver();
        assert!(matches!(
            resolver.create("https://example.com/a", Some("a_b")).await,
            Err(AppError::Validation(_))
        ));
    }

    #[tokio::test]
    async fn test_create_with_custom_and_random_slug() {
        let (_, _, resolver) = resolver();
        let entry = resolver
            .create("https://example.com/a", Some("Blog"))
            .await
            .unwrap();
        assert_eq!(entry.slug, "blog");

        let err = resolver
            .create("https://example.com/b", Some("blog"))
            .await
            .unwrap_err();
        assert!(matches!(err, AppError::Conflict(_)));

        let random = resolver.create("https://example.com/c", None).await.unwrap();
        assert_eq!(random.slug.len(), 6);
        assert_eq!(resolver.resolve(&random.slug).await.unwrap(), "https://example.com/c");
    }

    #[tokio::test]
    async fn test_create_rejects_bad_urls() {
        let (_, _, resolver) = resolver();
        assert!(matches!(
            resolver.create("not a url", None).await,
            Err(AppError::Validation(_))
        ));
        assert!(matches!(
            resolver.create("ftp://example.com", None).await,
            Err(AppError::Validation(_))
        ));
    }
}
