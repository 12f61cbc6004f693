//! Route definitions for the site API
//!
//! This module configures all HTTP routes, maps them to their handlers and
//! attaches the scope each group requires.

use axum::extract::DefaultBodyLimit;
use axum::middleware;
use axum::routing::{get, post};
use axum::Router;

use crate::handler::{
    alt_text_from_upload, alt_text_from_url, create_redirect, export_kv, get_dashboard,
    get_metrics, import_kv, optimise_from_upload, optimise_from_url, redirect_slug, revoke_token,
    serve_image, whoami,
};
use crate::middleware::{auth_middleware, metrics_middleware, ScopeGuard};
use crate::state::AppState;

/// Creates and configures the Axum application router with all routes
///
/// # Route Definitions
///
/// Public:
/// - `GET /go/{slug}` - Redirects to the stored destination
/// - `GET /images/{name}` - Serves a stored optimised image
///
/// Token required (scope in brackets):
/// - `GET /api/auth` - Identity behind the token (any valid token)
/// - `GET /api/metrics` - Aggregated metrics [`api:metrics`]
/// - `GET /api/dashboard` - Dashboard summary [`dashboard:metrics`]
/// - `GET|POST /api/ai/alt` - Alt text for an image [`ai:alt`]
/// - `GET|POST /api/images/optimise` - WebP optimisation [`api:images`]
/// - `POST /api/admin/redirects` - Creates a redirect [`admin:redirects`]
/// - `GET /api/admin/kv/export`, `POST /api/admin/kv/import` [`admin:kv`]
/// - `POST /api/admin/tokens/{token_id}/revoke` [`admin:tokens`]
///
/// # Example Usage
///
/// ```no_run
/// # use std::sync::Arc;
/// # use site_api::config::Config;
/// # use site_api::database::init_db;
/// # use site_api::route::create_app;
/// # use site_api::state::AppState;
/// # let db = init_db("data.db").unwrap();
/// let state = AppState::new(Arc::new(db), Config::default()).unwrap();
/// let app = create_app(state);
/// // axum::serve(listener, app).await.unwrap();
/// ```
pub fn create_app(state: AppState) -> Router {
    let guarded = |scope: &'static str| {
        middleware::from_fn_with_state(ScopeGuard::new(&state, scope), auth_middleware)
    };

    let identity_routes = Router::new()
        .route("/auth", get(whoami))
        .route_layer(middleware::from_fn_with_state(
            ScopeGuard::any(&state),
            auth_middleware,
        ));

    let metrics_routes = Router::new()
        .route("/metrics", get(get_metrics))
        .route_layer(guarded("api:metrics"));

    let dashboard_routes = Router::new()
        .route("/dashboard", get(get_dashboard))
        .route_layer(guarded("dashboard:metrics"));

    let ai_routes = Router::new()
        .route("/ai/alt", get(alt_text_from_url).post(alt_text_from_upload))
        .route_layer(guarded("ai:alt"));

    let image_routes = Router::new()
        .route(
            "/images/optimise",
            get(optimise_from_url).post(optimise_from_upload),
        )
        .route_layer(guarded("api:images"));

    let redirect_admin = Router::new()
        .route("/admin/redirects", post(create_redirect))
        .route_layer(guarded("admin:redirects"));

    let kv_admin = Router::new()
        .route("/admin/kv/export", get(export_kv))
        .route("/admin/kv/import", post(import_kv))
        .route_layer(guarded("admin:kv"));

    let token_admin = Router::new()
        .route("/admin/tokens/{token_id}/revoke", post(revoke_token))
        .route_layer(guarded("admin:tokens"));

    let api_routes = Router::new()
        .merge(identity_routes)
        .merge(metrics_routes)
        .merge(dashboard_routes)
        .merge(ai_routes)
        .merge(image_routes)
        .merge(redirect_admin)
        .merge(kv_admin)
        .merge(token_admin)
        .layer(DefaultBodyLimit::max(state.config.body_limit()))
        .layer(middleware::from_fn_with_state(
            state.clone(),
            metrics_middleware,
        ));

    Router::new()
        .route("/go/{slug}", get(redirect_slug))
        .route("/images/{name}", get(serve_image))
        .nest("/api", api_routes)
        .with_state(state)
}
