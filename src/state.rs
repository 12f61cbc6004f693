//! Application state shared across all request handlers

use std::sync::Arc;
use std::time::Duration;

use redb::Database;

use crate::alt_text::{AltTextGenerator, HttpAltTextGenerator, UnconfiguredAltText};
use crate::config::Config;
use crate::document::KeyFilter;
use crate::kv::{KvStore, RedbKv};
use crate::metrics::MetricsStore;
use crate::optimiser::Optimiser;
use crate::redirect::RedirectResolver;
use crate::tasks::BackgroundTasks;
use crate::token::TokenValidator;

const UPSTREAM_TIMEOUT: Duration = Duration::from_secs(30);

/// Cloned into every handler; everything inside is behind an `Arc` or cheap to copy
#[derive(Clone)]
pub struct AppState {
    pub db: Arc<Database>,
    pub kv: Arc<dyn KvStore>,
    pub metrics: MetricsStore,
    pub tokens: TokenValidator,
    pub redirects: RedirectResolver,
    pub optimiser: Arc<Optimiser>,
    pub alt_text: Arc<dyn AltTextGenerator>,
    pub http: reqwest::Client,
    pub export_filter: KeyFilter,
    pub tasks: BackgroundTasks,
    pub config: Arc<Config>,
}

impl AppState {
    /// Production wiring: redb-backed KV, detached background tasks and the
    /// HTTP alt-text client when `AI_API_URL` is set
    pub fn new(db: Arc<Database>, config: Config) -> anyhow::Result<Self> {
        let http = reqwest::Client::builder()
            .timeout(UPSTREAM_TIMEOUT)
            .user_agent(concat!("site-api/", env!("CARGO_PKG_VERSION")))
            .build()?;

        let alt_text: Arc<dyn AltTextGenerator> = match &config.ai_api_url {
            Some(url) => Arc::new(HttpAltTextGenerator::new(
                http.clone(),
                url.clone(),
                config.ai_api_token.clone(),
                config.ai_alt_prompt.clone(),
            )),
            None => {
                tracing::warn!("AI_API_URL not set, alt text generation is disabled");
                Arc::new(UnconfiguredAltText)
            }
        };

        Self::build(db, config, http, alt_text, BackgroundTasks::detached())
    }

    pub fn build(
        db: Arc<Database>,
        config: Config,
        http: reqwest::Client,
        alt_text: Arc<dyn AltTextGenerator>,
        tasks: BackgroundTasks,
    ) -> anyhow::Result<Self> {
        let kv: Arc<dyn KvStore> = Arc::new(RedbKv::new(db.clone()));
        let metrics = MetricsStore::new(kv.clone());
        let tokens = TokenValidator::new(config.jwt_secret.as_bytes(), kv.clone());
        let redirects = RedirectResolver::new(kv.clone(), metrics.clone(), tasks);
        let export_filter = KeyFilter::new(&config.kv_export_patterns)?;

        Ok(Self {
            db,
            kv,
            metrics,
            tokens,
            redirects,
            optimiser: Arc::new(Optimiser::webp()),
            alt_text,
            http,
            export_filter,
            tasks,
            config: Arc::new(config),
        })
    }
}
