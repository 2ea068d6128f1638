use std::any::Any;
use std::sync::Arc;
use std::time::{Duration, Instant};

use axum::{
    body::Bytes,
    extract::{rejection::BytesRejection, DefaultBodyLimit, Request, State},
    http::{header, HeaderValue, Method, StatusCode},
    middleware::{self, Next},
    response::{IntoResponse, Response},
    routing::{any, get},
    Json, Router,
};
use base64::{
    alphabet,
    engine::{general_purpose, GeneralPurpose},
    Engine as _,
};
use serde_json::json;
use tower_http::{
    catch_panic::CatchPanicLayer,
    cors::{AllowOrigin, Any as AnyOrigin, CorsLayer},
    services::ServeDir,
};

use crate::config::Config;
use crate::extract::{ExtractionError, MarkdownExtractor};
use crate::models::{ExtractRequest, ExtractResponse};

// ── Limits ───────────────────────────────────────────────────────────────────

pub const MAX_IMAGE_SIZE: usize = 10 * 1024 * 1024;
/// Room for a maximal image in base64 plus the JSON wrapper. Anything larger
/// necessarily carries an oversized image.
const MAX_REQUEST_BODY: usize = 20 * 1024 * 1024;
const REQUEST_TIMEOUT: Duration = Duration::from_secs(60);

/// Standard alphabet with padding, tolerant of non-zero trailing bits.
const IMAGE_BASE64: GeneralPurpose = GeneralPurpose::new(
    &alphabet::STANDARD,
    general_purpose::PAD.with_decode_allow_trailing_bits(true),
);

// ── Error type ───────────────────────────────────────────────────────────────

#[derive(Debug, thiserror::Error)]
pub enum ApiError {
    #[error("method not allowed")]
    MethodNotAllowed,
    #[error("invalid JSON body")]
    InvalidJson,
    #[error("image_base64 is required")]
    MissingImage,
    #[error("mime_type is required")]
    MissingMimeType,
    #[error("invalid base64 encoding")]
    InvalidBase64,
    #[error("image too large (max 10MB)")]
    ImageTooLarge,
    #[error("request timed out")]
    Timeout,
    #[error(transparent)]
    Extraction(#[from] ExtractionError),
}

impl ApiError {
    pub fn status(&self) -> StatusCode {
        match self {
            ApiError::MethodNotAllowed => StatusCode::METHOD_NOT_ALLOWED,
            ApiError::InvalidJson
            | ApiError::MissingImage
            | ApiError::MissingMimeType
            | ApiError::InvalidBase64
            | ApiError::ImageTooLarge => StatusCode::BAD_REQUEST,
            ApiError::Timeout | ApiError::Extraction(_) => StatusCode::INTERNAL_SERVER_ERROR,
        }
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        // Extraction failures are passed through as-is, upstream wording included.
        (self.status(), Json(ExtractResponse::failure(self.to_string()))).into_response()
    }
}

// ── State & router ───────────────────────────────────────────────────────────

#[derive(Clone)]
pub struct AppState {
    pub extractor: Arc<dyn MarkdownExtractor>,
}

pub fn create_router(config: &Config, extractor: Arc<dyn MarkdownExtractor>) -> Router {
    let state = AppState { extractor };

    Router::new()
        .route("/health", get(health))
        .route(
            "/api/v1/extract",
            any(extract_endpoint).layer(DefaultBodyLimit::max(MAX_REQUEST_BODY)),
        )
        .fallback_service(ServeDir::new(&config.static_dir))
        .with_state(state)
        .layer(cors_layer(&config.allowed_origins))
        .layer(middleware::from_fn(log_requests))
        .layer(CatchPanicLayer::custom(handle_panic))
}

fn cors_layer(origins: &[String]) -> CorsLayer {
    let allow_origin = if origins.iter().any(|o| o == "*") {
        AllowOrigin::from(AnyOrigin)
    } else {
        let values: Vec<HeaderValue> = origins
            .iter()
            .filter_map(|o| match HeaderValue::from_str(o) {
                Ok(v) => Some(v),
                Err(_) => {
                    tracing::warn!(origin = %o, "ignoring invalid CORS origin");
                    None
                }
            })
            .collect();
        AllowOrigin::list(values)
    };

    CorsLayer::new()
        .allow_origin(allow_origin)
        .allow_methods([Method::GET, Method::POST, Method::OPTIONS])
        .allow_headers([header::CONTENT_TYPE])
}

// ── Middleware ───────────────────────────────────────────────────────────────

async fn log_requests(req: Request, next: Next) -> Response {
    let method = req.method().clone();
    let path = req.uri().path().to_string();
    let started = Instant::now();

    let response = next.run(req).await;

    tracing::info!(
        %method,
        path = %path,
        status = response.status().as_u16(),
        elapsed_ms = started.elapsed().as_millis() as u64,
        "request"
    );
    response
}

fn handle_panic(err: Box<dyn Any + Send + 'static>) -> Response {
    let detail = if let Some(s) = err.downcast_ref::<String>() {
        s.as_str()
    } else if let Some(s) = err.downcast_ref::<&str>() {
        *s
    } else {
        "unknown panic"
    };
    tracing::error!(detail, "handler panicked");

    (
        StatusCode::INTERNAL_SERVER_ERROR,
        Json(ExtractResponse::failure("internal server error")),
    )
        .into_response()
}

// ── Handlers ─────────────────────────────────────────────────────────────────

async fn health() -> impl IntoResponse {
    Json(json!({"status": "ok"}))
}

async fn extract_endpoint(
    State(state): State<AppState>,
    method: Method,
    body: Result<Bytes, BytesRejection>,
) -> Response {
    let outcome = tokio::time::timeout(REQUEST_TIMEOUT, run_extraction(&state, method, body))
        .await
        .unwrap_or(Err(ApiError::Timeout));

    match outcome {
        Ok(markdown) => (StatusCode::OK, Json(ExtractResponse::ok(markdown))).into_response(),
        Err(e) => {
            match &e {
                ApiError::Extraction(inner) => tracing::warn!(error = %inner, "extraction failed"),
                ApiError::Timeout => tracing::warn!("extraction timed out"),
                _ => {}
            }
            e.into_response()
        }
    }
}

async fn run_extraction(
    state: &AppState,
    method: Method,
    body: Result<Bytes, BytesRejection>,
) -> Result<String, ApiError> {
    if method != Method::POST {
        return Err(ApiError::MethodNotAllowed);
    }

    let body = body.map_err(|rejection| match rejection.status() {
        StatusCode::PAYLOAD_TOO_LARGE => ApiError::ImageTooLarge,
        _ => ApiError::InvalidJson,
    })?;
    let (image, mime_type) = decode_request(&body)?;

    let markdown = state
        .extractor
        .extract_markdown(&image, &mime_type)
        .await?;
    Ok(markdown)
}

/// Parses and validates the request body, returning the decoded image and its mime type.
fn decode_request(body: &[u8]) -> Result<(Vec<u8>, String), ApiError> {
    // A bare `null` body is an empty request, not a syntax error.
    let req: ExtractRequest = serde_json::from_slice::<Option<ExtractRequest>>(body)
        .map_err(|_| ApiError::InvalidJson)?
        .unwrap_or_default();

    let encoded = req
        .image_base64
        .filter(|s| !s.is_empty())
        .ok_or(ApiError::MissingImage)?;
    let mime_type = req
        .mime_type
        .filter(|s| !s.is_empty())
        .ok_or(ApiError::MissingMimeType)?;

    let image = decode_image(&encoded)?;
    if image.len() > MAX_IMAGE_SIZE {
        return Err(ApiError::ImageTooLarge);
    }

    Ok((image, mime_type))
}

/// Decodes padded standard base64, skipping CR/LF line breaks.
fn decode_image(encoded: &str) -> Result<Vec<u8>, ApiError> {
    let result = if encoded.contains(['\r', '\n']) {
        let joined: Vec<u8> = encoded
            .bytes()
            .filter(|b| !matches!(b, b'\r' | b'\n'))
            .collect();
        IMAGE_BASE64.decode(joined)
    } else {
        IMAGE_BASE64.decode(encoded)
    };
    result.map_err(|_| ApiError::InvalidBase64)
}
