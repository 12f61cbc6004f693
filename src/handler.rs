//! HTTP request handlers
//!
//! Handlers stay thin: they pull inputs out of the request, call into the
//! metrics, token, redirect, optimiser and document modules, and wrap the
//! result in the standard envelope. Every failure is an `AppError`.

use axum::{
    body::{to_bytes, Body},
    extract::{
        rejection::{JsonRejection, QueryRejection},
        FromRequest, Multipart, Path, Query, Request, State,
    },
    http::{
        header::{CACHE_CONTROL, CONTENT_TYPE, LOCATION},
        HeaderValue, StatusCode,
    },
    response::{IntoResponse, Response},
    Extension, Json,
};
use base64::{engine::general_purpose::STANDARD, Engine};
use chrono::Utc;
use uuid::Uuid;

use crate::database::{get_image, put_image};
use crate::document::{export_document, import_document, to_yaml};
use crate::error::{AppError, KvError};
use crate::input::{decode_base64_image, fetch_image, is_multipart, read_multipart, ImageUpload};
use crate::model::{
    AltTextParams, AltTextResponse, CreateRedirectRequest, ExportParams, MetricsParams,
    OptimiseParams, OptimiseRequest, OptimiseResponse, RevokeResponse,
};
use crate::optimiser::{content_filename, OptimiseOptions};
use crate::report::{build_dashboard, build_report, prometheus_text, MetricsFormat};
use crate::response::{success, Envelope};
use crate::state::AppState;
use crate::token::{revoke, Identity};

fn query_error(e: QueryRejection) -> AppError {
    AppError::Validation(e.body_text())
}

fn json_error(e: JsonRejection) -> AppError {
    AppError::Validation(e.body_text())
}

fn with_content_type(body: String, content_type: &'static str) -> Response {
    ([(CONTENT_TYPE, HeaderValue::from_static(content_type))], body).into_response()
}

/// Redirects a slug to its destination
///
/// # Response
///
/// - **302 Found** - `Location` set to the stored URL
/// - **404 Not Found** - Unknown slug
///
/// Hit and miss counters are written as a best-effort task.
pub async fn redirect_slug(
    Path(slug): Path<String>,
    State(state): State<AppState>,
) -> Result<Response, AppError> {
    let target = state.redirects.resolve(&slug).await?;
    let location = HeaderValue::from_str(&target)
        .map_err(|e| anyhow::anyhow!("stored redirect for '{}' is not a valid header: {}", slug, e))?;
    Ok((StatusCode::FOUND, [(LOCATION, location)]).into_response())
}

/// Serves a stored optimised image
pub async fn serve_image(
    Path(name): Path<String>,
    State(state): State<AppState>,
) -> Result<Response, AppError> {
    let bytes = get_image(&state.db, &name)
        .map_err(KvError::from)?
        .ok_or_else(|| AppError::NotFound("image".to_string()))?;
    Ok((
        [
            (CONTENT_TYPE, HeaderValue::from_static("image/webp")),
            (
                CACHE_CONTROL,
                HeaderValue::from_static("public, max-age=31536000, immutable"),
            ),
        ],
        Body::from(bytes),
    )
        .into_response())
}

/// Returns the identity behind the presented token
pub async fn whoami(Extension(identity): Extension<Identity>) -> Response {
    success(StatusCode::OK, identity)
}

/// Aggregated metrics
///
/// `GET /api/metrics?format=json|yaml|prometheus`
pub async fn get_metrics(
    State(state): State<AppState>,
    params: Result<Query<MetricsParams>, QueryRejection>,
) -> Result<Response, AppError> {
    let Query(params) = params.map_err(query_error)?;
    let format = MetricsFormat::parse(params.format.as_deref())?;

    match format {
        MetricsFormat::Json => {
            let report = build_report(&state.metrics).await?;
            Ok(success(StatusCode::OK, report))
        }
        MetricsFormat::Yaml => {
            let report = build_report(&state.metrics).await?;
            let body = serde_yaml::to_string(&Envelope::success(StatusCode::OK, report))
                .map_err(anyhow::Error::from)?;
            Ok(with_content_type(body, "application/yaml; charset=utf-8"))
        }
        MetricsFormat::Prometheus => {
            let body = prometheus_text(&state.metrics).await?;
            Ok(with_content_type(body, "text/plain; version=0.0.4; charset=utf-8"))
        }
    }
}

pub async fn get_dashboard(State(state): State<AppState>) -> Result<Response, AppError> {
    let summary = build_dashboard(&state.metrics).await?;
    Ok(success(StatusCode::OK, summary))
}

/// Size-targets the image, then asks the model for a description
async fn describe_image(state: &AppState, bytes: Vec<u8>) -> Result<AltTextResponse, AppError> {
    let optimiser = state.optimiser.clone();
    let target = state.config.alt_target_bytes;
    let optimised =
        tokio::task::spawn_blocking(move || optimiser.optimise_to_target(&bytes, target))
            .await
            .map_err(anyhow::Error::from)??;

    let alt_text = state.alt_text.describe(&optimised.buffer).await?;
    Ok(AltTextResponse {
        alt_text,
        width: optimised.width,
        height: optimised.height,
        compression_ratio: optimised.compression_ratio,
        size: optimised.buffer.len(),
    })
}

/// `GET /api/ai/alt?url=<image url>`
pub async fn alt_text_from_url(
    State(state): State<AppState>,
    params: Result<Query<AltTextParams>, QueryRejection>,
) -> Result<Response, AppError> {
    let Query(params) = params.map_err(query_error)?;
    let bytes = fetch_image(&state.http, &params.url, state.config.max_image_bytes).await?;
    let response = describe_image(&state, bytes).await?;
    Ok(success(StatusCode::OK, response))
}

async fn read_body(state: &AppState, request: Request) -> Result<Vec<u8>, AppError> {
    let body = to_bytes(request.into_body(), state.config.body_limit())
        .await
        .map_err(|_| AppError::PayloadTooLarge)?;
    Ok(body.to_vec())
}

async fn read_multipart_upload(state: &AppState, request: Request) -> Result<ImageUpload, AppError> {
    let multipart = Multipart::from_request(request, state)
        .await
        .map_err(|e| AppError::Validation(e.body_text()))?;
    read_multipart(multipart, state.config.max_image_bytes).await
}

/// `POST /api/ai/alt` with a raw base64 body or a multipart form
pub async fn alt_text_from_upload(
    State(state): State<AppState>,
    request: Request,
) -> Result<Response, AppError> {
    let bytes = if is_multipart(request.headers()) {
        read_multipart_upload(&state, request).await?.bytes
    } else {
        let body = read_body(&state, request).await?;
        decode_base64_image(&body, state.config.max_image_bytes)?
    };
    let response = describe_image(&state, bytes).await?;
    Ok(success(StatusCode::OK, response))
}

async fn optimise_upload(state: &AppState, upload: ImageUpload) -> Result<OptimiseResponse, AppError> {
    let options = OptimiseOptions {
        quality: upload.quality,
        lossy: upload.lossy,
    };
    let optimiser = state.optimiser.clone();
    let bytes = upload.bytes;
    let mut result = tokio::task::spawn_blocking(move || optimiser.optimise(&bytes, options))
        .await
        .map_err(anyhow::Error::from)??;

    if !upload.store.unwrap_or(false) {
        let image = STANDARD.encode(&result.buffer);
        return Ok(OptimiseResponse {
            result,
            image: Some(image),
        });
    }

    let name = content_filename(&result.buffer, Utc::now().timestamp());
    put_image(&state.db, &name, &result.buffer).map_err(KvError::from)?;
    tracing::info!(name = %name, size = result.buffer.len(), "optimised image stored");
    result.url = Some(format!("{}/images/{}", state.config.public_url, name));
    Ok(OptimiseResponse {
        result,
        image: None,
    })
}

/// `GET /api/images/optimise?url=&quality=&lossy=&store=`
pub async fn optimise_from_url(
    State(state): State<AppState>,
    params: Result<Query<OptimiseParams>, QueryRejection>,
) -> Result<Response, AppError> {
    let Query(params) = params.map_err(query_error)?;
    let bytes = fetch_image(&state.http, &params.url, state.config.max_image_bytes).await?;
    let upload = ImageUpload {
        bytes,
        quality: params.quality,
        lossy: params.lossy,
        store: params.store,
    };
    let response = optimise_upload(&state, upload).await?;
    Ok(success(StatusCode::OK, response))
}

/// `POST /api/images/optimise` with a JSON body or a multipart form
pub async fn optimise_from_upload(
    State(state): State<AppState>,
    request: Request,
) -> Result<Response, AppError> {
    let upload = if is_multipart(request.headers()) {
        read_multipart_upload(&state, request).await?
    } else {
        let Json(body) = Json::<OptimiseRequest>::from_request(request, &state)
            .await
            .map_err(json_error)?;
        ImageUpload {
            bytes: decode_base64_image(body.image.as_bytes(), state.config.max_image_bytes)?,
            quality: body.quality,
            lossy: body.lossy,
            store: body.store,
        }
    };
    let response = optimise_upload(&state, upload).await?;
    Ok(success(StatusCode::OK, response))
}

/// Creates a redirect
///
/// # Request Body
///
/// ```json
/// { "url": "https://github.com/x", "slug": "gh" }
/// ```
///
/// # Response
///
/// - **201 Created** - Redirect stored
/// - **409 Conflict** - Slug already exists
pub async fn create_redirect(
    State(state): State<AppState>,
    payload: Result<Json<CreateRedirectRequest>, JsonRejection>,
) -> Result<Response, AppError> {
    let Json(payload) = payload.map_err(json_error)?;
    let entry = state
        .redirects
        .create(&payload.url, payload.slug.as_deref())
        .await?;
    Ok(success(StatusCode::CREATED, entry))
}

/// `GET /api/admin/kv/export?format=yaml|json`
pub async fn export_kv(
    State(state): State<AppState>,
    params: Result<Query<ExportParams>, QueryRejection>,
) -> Result<Response, AppError> {
    let Query(params) = params.map_err(query_error)?;
    let document = export_document(state.kv.as_ref(), &state.export_filter).await?;

    match params.format.as_deref().map(str::to_lowercase).as_deref() {
        None | Some("yaml") | Some("yml") => Ok(with_content_type(
            to_yaml(&document)?,
            "application/yaml; charset=utf-8",
        )),
        Some("json") => Ok(Json(document).into_response()),
        Some(other) => Err(AppError::Validation(format!(
            "unsupported export format '{}'",
            other
        ))),
    }
}

/// `POST /api/admin/kv/import` with a YAML (or JSON) document body
pub async fn import_kv(
    State(state): State<AppState>,
    request: Request,
) -> Result<Response, AppError> {
    let body = read_body(&state, request).await?;
    let text = String::from_utf8(body)
        .map_err(|_| AppError::Validation("document must be UTF-8".to_string()))?;
    let summary = import_document(state.kv.as_ref(), &text, &state.export_filter).await?;
    Ok(success(StatusCode::OK, summary))
}

/// `POST /api/admin/tokens/{token_id}/revoke`
pub async fn revoke_token(
    Path(token_id): Path<String>,
    State(state): State<AppState>,
) -> Result<Response, AppError> {
    let token_id = Uuid::parse_str(&token_id)
        .map_err(|_| AppError::Validation("token id must be a UUID".to_string()))?;
    revoke(state.kv.as_ref(), &token_id).await?;
    tracing::info!(token_id = %token_id, "token revoked");
    Ok(success(
        StatusCode::OK,
        RevokeResponse {
            token_id,
            revoked_at: Utc::now(),
        },
    ))
}
