//! Request middleware for the `/api` router
//!
//! - `auth_middleware` guards each route group with a required scope
//! - `metrics_middleware` counts every API response, including rejections

use axum::{
    extract::{OriginalUri, Request, State},
    http::header::USER_AGENT,
    middleware::Next,
    response::Response,
};

use crate::error::{AppError, AuthError, ErrorKind};
use crate::metrics::RequestContext;
use crate::permission::authorize;
use crate::state::AppState;
use crate::token::{extract_credential, Identity};

/// State for `auth_middleware`: the app plus the scope the guarded routes need
#[derive(Clone)]
pub struct ScopeGuard {
    pub state: AppState,
    /// `None` accepts any valid token
    pub scope: Option<&'static str>,
}

impl ScopeGuard {
    pub fn new(state: &AppState, scope: &'static str) -> Self {
        Self {
            state: state.clone(),
            scope: Some(scope),
        }
    }

    pub fn any(state: &AppState) -> Self {
        Self {
            state: state.clone(),
            scope: None,
        }
    }
}

async fn authenticate(guard: &ScopeGuard, raw: Option<String>) -> Result<Identity, AppError> {
    // No header and no query parameter
    let raw = raw.ok_or(AuthError::Missing)?;

    // Expiry, signature, then revocation
    let identity = guard.state.tokens.validate(&raw).await?;

    // `/api/auth` only needs a valid token
    if let Some(scope) = guard.scope {
        if !authorize(&identity.subject, scope) {
            tracing::warn!(
                subject = %identity.subject,
                scope,
                "access denied: insufficient scope"
            );
            return Err(AuthError::InsufficientScope.into());
        }
    }
    Ok(identity)
}

/// Middleware to authenticate and authorize a request
///
/// Accepts the token from `Authorization: Bearer <token>` or `?token=<token>`
/// (header first), validates it, checks the guard's scope and hands the
/// resulting [`Identity`] to the handler as a request extension. Rejections
/// are counted under `metrics:auth:<reason>`.
///
/// This middleware:
/// 1. Extracts the raw credential
/// 2. Validates it and checks the scope
/// 3. Records the failure reason, or the token usage on success
/// 4. Inserts the identity and forwards the request
pub async fn auth_middleware(
    State(guard): State<ScopeGuard>,
    mut request: Request,
    next: Next,
) -> Result<Response, AppError> {
    let state = &guard.state;
    let raw = extract_credential(request.headers(), request.uri());

    let identity = match authenticate(&guard, raw).await {
        Ok(identity) => identity,
        Err(e) => {
            // Storage failures during validation are not auth reasons
            if let AppError::Auth(reason) = &e {
                tracing::debug!(reason = reason.reason(), "request rejected");
                let metrics = state.metrics.clone();
                let reason = *reason;
                state
                    .tasks
                    .run("auth-failure-metrics", async move {
                        metrics.record_auth_failure(reason).await
                    })
                    .await;
            }
            return Err(e);
        }
    };

    // Tokens without a `jti` cannot be tracked
    if let Some(token_id) = identity.token_id {
        let metrics = state.metrics.clone();
        state
            .tasks
            .run("token-usage", async move {
                metrics.record_token_usage(token_id).await
            })
            .await;
    }

    // Handlers read it back with `Extension<Identity>`
    request.extensions_mut().insert(identity);
    Ok(next.run(request).await)
}

/// Middleware recording status-class, resource, visitor and error metrics
/// for every API response. Recording is best-effort and never changes the
/// response.
pub async fn metrics_middleware(
    State(state): State<AppState>,
    request: Request,
    next: Next,
) -> Response {
    // Nested routers see a stripped path; metrics are keyed by the full one.
    let path = request
        .extensions()
        .get::<OriginalUri>()
        .map(|uri| uri.path().to_string())
        .unwrap_or_else(|| request.uri().path().to_string());
    let user_agent = request
        .headers()
        .get(USER_AGENT)
        .and_then(|v| v.to_str().ok())
        .map(String::from);
    let ctx = RequestContext::new(path, user_agent);

    let response = next.run(request).await;
    let status = response.status();

    // Set by `AppError::into_response`, absent on success
    let error_kind = response.extensions().get::<ErrorKind>().map(|kind| kind.0);

    let metrics = state.metrics.clone();
    state
        .tasks
        .run("api-metrics", async move {
            let recorded = metrics.record_api_metrics(&ctx, status).await;
            let errors = match error_kind {
                Some(kind) => metrics.record_api_error_metrics(&ctx, kind).await,
                None => Ok(()),
            };
            recorded.and(errors)
        })
        .await;

    response
}
