#![forbid(unsafe_code)]

//! Axum backend exposing `/info`, `/convert` and `/health`.
//!
//! Every route is mounted twice, at the root and under `/api`, so both the
//! standalone page and reverse-proxied deployments reach the same handlers.
//! Anything that is not an API route falls through to the optional static
//! site in `WWW_ROOT`.

use std::{
    net::{IpAddr, SocketAddr},
    path::{Component, Path, PathBuf},
    sync::Arc,
};

use anyhow::{Context, Result};
use axum::{
    Json, Router,
    body::Body,
    extract::{State, rejection::JsonRejection},
    http::{HeaderName, HeaderValue, Method, Request, StatusCode, header},
    response::{IntoResponse, Response},
    routing::{get, post},
};
use chrono::{DateTime, Utc};
use clap::Parser;
use mime_guess::MimeGuess;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use tokio::{fs::File, signal, time::Instant};
use tokio_util::io::ReaderStream;
use tower_http::{
    cors::{Any, CorsLayer},
    trace::TraceLayer,
};
use tracing::{error, info, warn};
use tracing_subscriber::EnvFilter;
use tubeconvert::config::{ConfigOverrides, ConvertMode, resolve_config};
use tubeconvert::redirect::ConversionFallback;
use tubeconvert::security::{attachment_disposition, ensure_not_root};
use tubeconvert::transcode::{ConversionRequest, FfmpegTranscoder};
use tubeconvert::{ResolveError, Resolver, VideoReference};

const DEFAULT_LOG_FILTER: &str = "tubeconvert=info,backend=info,tower_http=info";
const STRATEGY_HEADER: HeaderName = HeaderName::from_static("x-resolution-strategy");

const URL_REQUIRED: &str = "URL is required";
const INVALID_URL: &str = "Invalid YouTube URL format";
const INFO_FAILED: &str = "Failed to fetch video information. Please check the URL and try again.";
const CONVERT_FAILED: &str = "Failed to convert video. Please try again.";

#[derive(Debug, Parser)]
#[command(name = "backend", about = "YouTube to audio conversion API")]
struct BackendArgs {
    /// Listen address (overrides HOST).
    #[arg(long)]
    host: Option<String>,
    /// Listen port (overrides PORT).
    #[arg(long)]
    port: Option<u16>,
    /// Directory with the static front-end (overrides WWW_ROOT).
    #[arg(long)]
    www_root: Option<PathBuf>,
    /// Alternative `.env` file.
    #[arg(long)]
    env_file: Option<PathBuf>,
    /// `stream` converts on this server, `links` always answers with redirect links.
    #[arg(long, value_enum)]
    convert_mode: Option<ConvertMode>,
}

impl BackendArgs {
    fn into_overrides(self) -> ConfigOverrides {
        ConfigOverrides {
            host: self.host,
            port: self.port,
            www_root: self.www_root,
            convert_mode: self.convert_mode,
            env_path: self.env_file,
        }
    }
}

fn parse_host_arg(value: &str) -> Result<IpAddr> {
    value
        .parse::<IpAddr>()
        .context("expected a valid IPv4 or IPv6 address for --host/HOST")
}

/// Shared, read-only request context. The resolver and transcoder hold only
/// configuration; everything per-request lives on the handler's stack.
#[derive(Clone)]
struct AppState {
    resolver: Arc<Resolver>,
    transcoder: Arc<FfmpegTranscoder>,
    www_root: Option<Arc<PathBuf>>,
}

#[derive(Debug)]
struct ApiError {
    status: StatusCode,
    message: String,
    details: Option<String>,
}

impl ApiError {
    fn new(status: StatusCode, message: impl Into<String>) -> Self {
        Self {
            status,
            message: message.into(),
            details: None,
        }
    }

    fn bad_request(message: impl Into<String>) -> Self {
        Self::new(StatusCode::BAD_REQUEST, message)
    }

    fn not_found(message: impl Into<String>) -> Self {
        Self::new(StatusCode::NOT_FOUND, message)
    }

    fn internal(message: impl Into<String>) -> Self {
        Self::new(StatusCode::INTERNAL_SERVER_ERROR, message)
    }

    fn method_not_allowed() -> Self {
        Self::new(StatusCode::METHOD_NOT_ALLOWED, "Method not allowed")
    }

    fn with_details(mut self, details: impl Into<String>) -> Self {
        self.details = Some(details.into());
        self
    }

    /// Maps a resolution error onto the response the front-end expects:
    /// unavailable videos keep their own status and message, everything else
    /// is a 500 with `fallback` as message and the cause as details.
    fn from_resolve(err: ResolveError, fallback: &str) -> Self {
        match err {
            ResolveError::InvalidReference(_) => Self::bad_request(INVALID_URL),
            ResolveError::VideoUnavailable(reason) => Self::new(
                StatusCode::from_u16(reason.http_status())
                    .unwrap_or(StatusCode::FORBIDDEN),
                reason.message(),
            ),
            other => Self::internal(fallback).with_details(other.to_string()),
        }
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let mut body = serde_json::json!({
            "error": self.message,
        });
        if let Some(details) = self.details {
            body["details"] = Value::String(details);
        }
        (self.status, Json(body)).into_response()
    }
}

type ApiResult<T> = Result<T, ApiError>;

#[derive(Debug, Default, Deserialize)]
struct InfoRequest {
    url: Option<String>,
}

#[derive(Debug, Default, Deserialize)]
struct ConvertRequest {
    url: Option<String>,
    // Clients send both `"192"` and `192`.
    quality: Option<Value>,
    format: Option<Value>,
}

#[derive(Debug, Serialize)]
struct HealthPayload {
    status: &'static str,
    message: &'static str,
    timestamp: DateTime<Utc>,
}

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(DEFAULT_LOG_FILTER)),
        )
        .init();

    let args = BackendArgs::parse();
    ensure_not_root("backend")?;

    let config = resolve_config(args.into_overrides()).context("loading configuration")?;
    let host = parse_host_arg(&config.host)?;
    let resolver = config.build_resolver();
    info!(
        strategies = ?resolver.strategy_names(),
        mode = ?config.convert_mode,
        timeout = ?config.request_timeout,
        "resolver configured"
    );
    if let Some(root) = &config.www_root {
        info!(www_root = %root.display(), "serving static files");
    }

    let state = AppState {
        resolver: Arc::new(resolver),
        transcoder: Arc::new(config.build_transcoder()),
        www_root: config.www_root.clone().map(Arc::new),
    };

    let addr = SocketAddr::new(host, config.port);
    let listener = tokio::net::TcpListener::bind(addr)
        .await
        .with_context(|| format!("binding to {}", addr))?;
    info!("API server listening on http://{}", addr);

    axum::serve(listener, app(state))
        .with_graceful_shutdown(shutdown_signal())
        .await
        .context("running API server")?;

    Ok(())
}

fn app(state: AppState) -> Router {
    let cors = CorsLayer::new()
        .allow_origin(Any)
        .allow_methods([Method::POST, Method::GET, Method::OPTIONS])
        .allow_headers([header::CONTENT_TYPE])
        .expose_headers([header::CONTENT_DISPOSITION, STRATEGY_HEADER]);

    Router::new()
        .merge(api_routes())
        .nest("/api", api_routes())
        .fallback(static_fallback)
        .layer(cors)
        .layer(TraceLayer::new_for_http())
        .with_state(state)
}

fn api_routes() -> Router<AppState> {
    Router::new()
        .route(
            "/info",
            post(info).options(preflight).fallback(method_not_allowed),
        )
        .route(
            "/convert",
            post(convert).options(preflight).fallback(method_not_allowed),
        )
        .route(
            "/health",
            get(health).options(preflight).fallback(method_not_allowed),
        )
}

async fn shutdown_signal() {
    // Only graceful shutdown depends on this; Ctrl+C still terminates.
    if let Err(err) = signal::ctrl_c().await {
        warn!("Failed to install Ctrl+C handler: {}", err);
    }
}

/// Bare `OPTIONS` without CORS request headers never reaches the CORS layer's
/// preflight path, so answer it here too.
async fn preflight() -> StatusCode {
    StatusCode::OK
}

async fn method_not_allowed() -> ApiError {
    ApiError::method_not_allowed()
}

async fn health() -> Json<HealthPayload> {
    Json(HealthPayload {
        status: "OK",
        message: "Server is running",
        timestamp: Utc::now(),
    })
}

async fn info(
    State(state): State<AppState>,
    payload: Result<Json<InfoRequest>, JsonRejection>,
) -> ApiResult<Response> {
    let body = payload.map(|Json(body)| body).unwrap_or_default();
    let reference = parse_reference(body.url.as_deref())?;

    let resolution = state
        .resolver
        .resolve(&reference, false)
        .await
        .map_err(|err| {
            warn!(video = reference.id(), error = %err, "info request failed");
            ApiError::from_resolve(err, INFO_FAILED)
        })?;

    info!(video = reference.id(), strategy = %resolution.strategy, "info resolved");
    let mut response = Json(resolution.metadata).into_response();
    set_strategy_header(&mut response, &resolution.strategy);
    Ok(response)
}

async fn convert(
    State(state): State<AppState>,
    payload: Result<Json<ConvertRequest>, JsonRejection>,
) -> ApiResult<Response> {
    let body = payload.map(|Json(body)| body).unwrap_or_default();
    let reference = parse_reference(body.url.as_deref())?;
    let quality = body.quality.as_ref().and_then(value_as_text);
    let format = body.format.as_ref().and_then(value_as_text);
    let request = ConversionRequest::new(reference, quality.as_deref(), format.as_deref());
    let video = request.reference.id().to_string();
    // One budget covers resolution and the wait for the first encoded bytes.
    let deadline = Instant::now() + state.resolver.budget();

    let resolution = state
        .resolver
        .resolve_until(&request.reference, true, deadline)
        .await
        .map_err(|err| {
            warn!(%video, error = %err, "convert request failed");
            ApiError::from_resolve(err, CONVERT_FAILED)
        })?;

    let Some(source) = resolution.audio else {
        info!(%video, strategy = %resolution.strategy, "no audio stream, answering with redirect links");
        let mut response =
            Json(ConversionFallback::new(&request, &resolution.metadata)).into_response();
        set_strategy_header(&mut response, &resolution.strategy);
        return Ok(response);
    };

    let audio = state
        .transcoder
        .transcode(source, request.quality, request.format, deadline)
        .await
        .map_err(|err| {
            error!(%video, error = %err, "transcode failed before streaming");
            let status = StatusCode::from_u16(err.http_status())
                .unwrap_or(StatusCode::INTERNAL_SERVER_ERROR);
            ApiError::new(status, CONVERT_FAILED).with_details(err.to_string())
        })?;

    info!(
        %video,
        strategy = %resolution.strategy,
        format = request.format.extension(),
        quality = request.quality.as_str(),
        "streaming converted audio"
    );
    let disposition = attachment_disposition(&resolution.metadata.title, request.format.extension());
    let disposition = HeaderValue::from_str(&disposition)
        .map_err(|err| ApiError::internal(CONVERT_FAILED).with_details(err.to_string()))?;

    let mut response = Body::from_stream(audio.into_stream()).into_response();
    let headers = response.headers_mut();
    headers.insert(
        header::CONTENT_TYPE,
        HeaderValue::from_static(request.format.mime_type()),
    );
    headers.insert(header::CONTENT_DISPOSITION, disposition);
    set_strategy_header(&mut response, &resolution.strategy);
    Ok(response)
}

fn parse_reference(url: Option<&str>) -> ApiResult<VideoReference> {
    let url = url
        .map(str::trim)
        .filter(|url| !url.is_empty())
        .ok_or_else(|| ApiError::bad_request(URL_REQUIRED))?;
    VideoReference::parse(url).map_err(|_| ApiError::bad_request(INVALID_URL))
}

fn value_as_text(value: &Value) -> Option<String> {
    match value {
        Value::String(text) => Some(text.clone()),
        Value::Number(number) => Some(number.to_string()),
        _ => None,
    }
}

fn set_strategy_header(response: &mut Response, strategy: &str) {
    if let Ok(value) = HeaderValue::from_str(strategy) {
        response.headers_mut().insert(STRATEGY_HEADER, value);
    }
}

async fn static_fallback(State(state): State<AppState>, req: Request<Body>) -> Response {
    let path = req.uri().path();
    if path == "/api" || path.starts_with("/api/") {
        return ApiError::not_found("endpoint not found").into_response();
    }
    let Some(root) = state.www_root.as_deref() else {
        return ApiError::not_found("endpoint not found").into_response();
    };

    match serve_www_path(root, path).await {
        Ok(response) => response,
        Err(err) => err.into_response(),
    }
}

async fn serve_www_path(root: &Path, request_path: &str) -> ApiResult<Response> {
    let target = resolve_www_path(root, request_path)?;
    match tokio::fs::metadata(&target).await {
        Ok(meta) if meta.is_dir() => stream_file(root.join("index.html")).await,
        Ok(_) => stream_file(target).await,
        Err(_) if should_fallback_to_index(request_path) => {
            stream_file(root.join("index.html")).await
        }
        Err(_) => Err(ApiError::not_found("file not found")),
    }
}

fn resolve_www_path(root: &Path, request_path: &str) -> ApiResult<PathBuf> {
    let trimmed = request_path.trim_start_matches('/');
    if trimmed.is_empty() {
        return Ok(root.join("index.html"));
    }
    let candidate = Path::new(trimmed);
    if candidate
        .components()
        .any(|component| !matches!(component, Component::Normal(_)))
    {
        return Err(ApiError::not_found("file not found"));
    }
    Ok(root.join(candidate))
}

/// Extension-less paths are front-end routes and get `index.html`.
fn should_fallback_to_index(request_path: &str) -> bool {
    let trimmed = request_path.trim_start_matches('/');
    trimmed.is_empty() || Path::new(trimmed).extension().is_none()
}

async fn stream_file(path: PathBuf) -> ApiResult<Response> {
    let file = File::open(&path)
        .await
        .map_err(|_| ApiError::not_found("file not found"))?;
    let mut response = Body::from_stream(ReaderStream::new(file)).into_response();
    if let Some(mime) = MimeGuess::from_path(&path).first()
        && let Ok(value) = HeaderValue::from_str(mime.as_ref())
    {
        response.headers_mut().insert(header::CONTENT_TYPE, value);
    }
    Ok(response)
}
