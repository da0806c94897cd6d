use std::{
    collections::HashSet,
    io::ErrorKind,
    path::{Path, PathBuf},
    sync::{Arc, LazyLock},
    time::SystemTime,
};

use axum::{
    Json, Router,
    extract::{Request, State},
    http::{HeaderValue, Method, StatusCode, header::ORIGIN},
    middleware::{self, Next},
    response::{IntoResponse, Response},
    routing::{get, post},
};
use regex::Regex;
use serde::{Deserialize, Serialize};
use thiserror::Error;
use tokio::{
    net::TcpListener, process::Command, sync::Semaphore, task::JoinHandle, time::Duration,
};
use tower_http::{
    cors::{AllowOrigin, Any, CorsLayer},
    services::ServeDir,
    trace::TraceLayer,
};
use tracing::{debug, info, warn};
use url::Url;

#[derive(Clone)]
struct AppState {
    downloads_dir: PathBuf,
    allowed_origins: Arc<HashSet<String>>,
    download_semaphore: Arc<Semaphore>,
}

const DEFAULT_PORT: u16 = 3000;
const DEFAULT_ALLOWED_ORIGINS: [&str; 2] = ["http://localhost:5173", "http://localhost:4173"];
const DEFAULT_MAX_CONCURRENT_DOWNLOADS: usize = 3;
const SWEEP_INTERVAL_SECONDS: u64 = 60 * 60;
const RETENTION_MAX_AGE_SECONDS: u64 = 60 * 60;

static YOUTUBE_URL_PATTERN: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"^(https?://)?(www\.)?(youtube\.com|youtu\.be)/.+$").expect("valid pattern")
});

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Quality {
    P1080,
    P720,
    P480,
    P360,
}

impl Quality {
    fn from_request(value: Option<&str>) -> Self {
        match value {
            Some("1080p") => Self::P1080,
            Some("720p") => Self::P720,
            Some("480p") => Self::P480,
            _ => Self::P360,
        }
    }

    fn label(self) -> &'static str {
        match self {
            Self::P1080 => "1080p",
            Self::P720 => "720p",
            Self::P480 => "480p",
            Self::P360 => "360p",
        }
    }

    fn format_expr(self) -> &'static str {
        match self {
            Self::P1080 => "bestvideo[height<=1080]+bestaudio/best",
            Self::P720 => "bestvideo[height<=720]+bestaudio/best",
            Self::P480 => "bestvideo[height<=480]+bestaudio/best",
            Self::P360 => "bestvideo[height<=360]+bestaudio/best",
        }
    }
}

#[derive(Debug, Deserialize)]
struct DownloadRequest {
    url: Option<String>,
    quality: Option<String>,
}

#[derive(Debug, Serialize, Deserialize)]
struct VideoInfo {
    #[serde(skip_serializing_if = "Option::is_none")]
    title: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    thumbnail: Option<String>,
    // yt-dlp reports duration as an integer or a float depending on the extractor.
    #[serde(skip_serializing_if = "Option::is_none")]
    duration: Option<serde_json::Value>,
    #[serde(skip_serializing_if = "Option::is_none")]
    uploader: Option<String>,
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
struct DownloadResponse {
    success: bool,
    message: &'static str,
    download_url: String,
    video_info: VideoInfo,
}

#[derive(Debug, Serialize)]
struct ErrorBody {
    error: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    details: Option<String>,
}

#[derive(Debug)]
struct ApiError {
    status: StatusCode,
    message: String,
    details: Option<String>,
}

impl ApiError {
    fn bad_request(message: impl Into<String>) -> Self {
        Self {
            status: StatusCode::BAD_REQUEST,
            message: message.into(),
            details: None,
        }
    }

    fn forbidden(message: impl Into<String>) -> Self {
        Self {
            status: StatusCode::FORBIDDEN,
            message: message.into(),
            details: None,
        }
    }

    fn internal(message: impl Into<String>) -> Self {
        Self {
            status: StatusCode::INTERNAL_SERVER_ERROR,
            message: message.into(),
            details: None,
        }
    }

    fn download_failed(source: ExtractorError) -> Self {
        Self {
            status: StatusCode::INTERNAL_SERVER_ERROR,
            message: "Download failed".to_string(),
            details: Some(source.to_string()),
        }
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let body = Json(ErrorBody {
            error: self.message,
            details: self.details,
        });

        (self.status, body).into_response()
    }
}

#[derive(Debug, Error)]
enum ExtractorError {
    #[error("yt-dlp is not installed. Install yt-dlp and restart the server.")]
    ToolMissing,
    #[error("failed to run yt-dlp: {0}")]
    Spawn(std::io::Error),
    #[error("{0}")]
    ToolFailed(String),
    #[error("could not parse video metadata: {0}")]
    Metadata(#[from] serde_json::Error),
}

#[tokio::main]
async fn main() {
    tracing_subscriber::fmt()
        .with_env_filter(
            std::env::var("RUST_LOG")
                .unwrap_or_else(|_| "tubedrop=info,tower_http=info".to_string()),
        )
        .init();

    if let Err(error) = run().await {
        eprintln!("Server error: {}", error.message);
        std::process::exit(1);
    }
}

async fn run() -> Result<(), ApiError> {
    let root = PathBuf::from(env!("CARGO_MANIFEST_DIR"));
    let downloads_dir = root.join("downloads");

    tokio::fs::create_dir_all(&downloads_dir)
        .await
        .map_err(|error| {
            ApiError::internal(format!("Could not create downloads directory: {error}"))
        })?;

    let allowed_origins = load_allowed_origins()?;
    let max_concurrent_downloads = read_usize_env("MAX_CONCURRENT_DOWNLOADS")
        .filter(|value| *value > 0)
        .unwrap_or(DEFAULT_MAX_CONCURRENT_DOWNLOADS);

    let state = AppState {
        downloads_dir: downloads_dir.clone(),
        allowed_origins,
        download_semaphore: Arc::new(Semaphore::new(max_concurrent_downloads)),
    };

    let sweeper = spawn_retention_sweeper(downloads_dir);

    let app = build_router(state);

    let addr = resolve_bind_addr();
    let listener = TcpListener::bind(&addr)
        .await
        .map_err(|error| ApiError::internal(format!("Could not bind {addr}: {error}")))?;

    info!("Server running on http://{addr}");

    let served = axum::serve(listener, app)
        .await
        .map_err(|error| ApiError::internal(format!("HTTP server error: {error}")));

    sweeper.abort();
    served
}

fn build_router(state: AppState) -> Router {
    let cors = build_cors_layer(Arc::clone(&state.allowed_origins));
    let downloads_service = ServeDir::new(&state.downloads_dir);

    Router::new()
        .route("/api/download", post(start_download))
        .route("/health", get(health))
        .layer(middleware::from_fn_with_state(
            state.clone(),
            enforce_allowed_origin,
        ))
        .layer(cors)
        .nest_service("/downloads", downloads_service)
        .layer(TraceLayer::new_for_http())
        .with_state(state)
}

async fn health() -> Json<serde_json::Value> {
    Json(serde_json::json!({"status": "ok"}))
}

async fn start_download(
    State(state): State<AppState>,
    Json(payload): Json<DownloadRequest>,
) -> Result<Json<DownloadResponse>, ApiError> {
    let url = payload.url.as_deref().and_then(non_empty).unwrap_or_default();
    if url.is_empty() {
        return Err(ApiError::bad_request("URL is required"));
    }
    if !is_youtube_url(url) {
        return Err(ApiError::bad_request("Invalid YouTube URL"));
    }

    let quality = Quality::from_request(payload.quality.as_deref());
    let _download_permit = state
        .download_semaphore
        .clone()
        .acquire_owned()
        .await
        .map_err(|_| ApiError::internal("Could not reserve download capacity"))?;

    info!("Starting {} download of {url}", quality.label());
    let completed = download_video(&state.downloads_dir, url, quality)
        .await
        .map_err(|error| {
            warn!("Download of {url} failed: {error}");
            ApiError::download_failed(error)
        })?;
    info!("Download completed: {}", completed.filename);

    Ok(Json(DownloadResponse {
        success: true,
        message: "Download completed",
        download_url: format!("/downloads/{}", completed.filename),
        video_info: completed.video,
    }))
}

async fn enforce_allowed_origin(
    State(state): State<AppState>,
    request: Request,
    next: Next,
) -> Result<Response, ApiError> {
    let Some(origin) = request.headers().get(ORIGIN) else {
        return Ok(next.run(request).await);
    };

    let normalized = origin.to_str().ok().and_then(normalize_origin);
    if normalized
        .as_ref()
        .is_some_and(|value| state.allowed_origins.contains(value))
    {
        return Ok(next.run(request).await);
    }

    debug!("Rejected request from disallowed origin {:?}", origin);
    Err(ApiError::forbidden("Not allowed by CORS"))
}

struct CompletedDownload {
    filename: String,
    video: VideoInfo,
}

async fn download_video(
    downloads_dir: &Path,
    url: &str,
    quality: Quality,
) -> Result<CompletedDownload, ExtractorError> {
    let video = probe_video(url).await?;
    let filename = download_filename(video.title.as_deref().unwrap_or_default(), quality);
    let destination = downloads_dir.join(&filename);

    fetch_video(url, quality, &destination).await?;

    Ok(CompletedDownload { filename, video })
}

async fn probe_video(url: &str) -> Result<VideoInfo, ExtractorError> {
    let output = run_yt_dlp(&[
        "--dump-single-json",
        "--no-check-certificates",
        "--no-warnings",
        "--prefer-free-formats",
        url,
    ])
    .await?;

    Ok(serde_json::from_slice(&output.stdout)?)
}

async fn fetch_video(url: &str, quality: Quality, destination: &Path) -> Result<(), ExtractorError> {
    let output_arg = destination.to_string_lossy();

    run_yt_dlp(&[
        "-o",
        output_arg.as_ref(),
        "-f",
        quality.format_expr(),
        "--merge-output-format",
        "mp4",
        "--no-check-certificates",
        "--no-warnings",
        "--prefer-free-formats",
        url,
    ])
    .await?;

    Ok(())
}

async fn run_yt_dlp(args: &[&str]) -> Result<std::process::Output, ExtractorError> {
    let output = Command::new("yt-dlp")
        .args(args)
        .output()
        .await
        .map_err(|error| {
            if error.kind() == ErrorKind::NotFound {
                ExtractorError::ToolMissing
            } else {
                ExtractorError::Spawn(error)
            }
        })?;

    if !output.status.success() {
        return Err(ExtractorError::ToolFailed(last_stderr_line(&output.stderr)));
    }

    Ok(output)
}

fn last_stderr_line(stderr: &[u8]) -> String {
    String::from_utf8_lossy(stderr)
        .lines()
        .map(str::trim)
        .filter(|line| !line.is_empty())
        .next_back()
        .unwrap_or("yt-dlp exited with an error")
        .to_string()
}

fn download_filename(title: &str, quality: Quality) -> String {
    format!("{}-{}.mp4", sanitize_title(title), quality.label())
}

fn sanitize_title(value: &str) -> String {
    let mut sanitized = String::with_capacity(value.len());

    for character in value.chars() {
        if character.is_ascii_alphanumeric()
            || matches!(character, '.' | '-' | '_' | ' ' | '(' | ')')
        {
            sanitized.push(character);
        } else {
            sanitized.push('_');
        }
    }

    let compact = sanitized.trim();
    if compact.is_empty() {
        "video".to_string()
    } else {
        compact.to_string()
    }
}

fn is_youtube_url(input: &str) -> bool {
    YOUTUBE_URL_PATTERN.is_match(input)
}

fn spawn_retention_sweeper(downloads_dir: PathBuf) -> JoinHandle<()> {
    tokio::spawn(async move {
        let mut ticker = tokio::time::interval(Duration::from_secs(SWEEP_INTERVAL_SECONDS));
        loop {
            ticker.tick().await;
            sweep_expired_downloads(
                &downloads_dir,
                Duration::from_secs(RETENTION_MAX_AGE_SECONDS),
            )
            .await;
        }
    })
}

async fn sweep_expired_downloads(downloads_dir: &Path, max_age: Duration) {
    let mut entries = match tokio::fs::read_dir(downloads_dir).await {
        Ok(entries) => entries,
        Err(error) => {
            if error.kind() != ErrorKind::NotFound {
                warn!("Could not open downloads directory for sweep: {error}");
            }
            return;
        }
    };

    let now = SystemTime::now();

    loop {
        let maybe_entry = match entries.next_entry().await {
            Ok(value) => value,
            Err(error) => {
                warn!("Could not iterate downloads directory: {error}");
                break;
            }
        };

        let Some(entry) = maybe_entry else {
            break;
        };

        let path = entry.path();
        let metadata = match entry.metadata().await {
            Ok(metadata) => metadata,
            Err(error) => {
                warn!("Could not read metadata of {:?}: {error}", path);
                continue;
            }
        };

        if !metadata.is_file() {
            continue;
        }

        let modified_at = match metadata.modified() {
            Ok(value) => value,
            Err(error) => {
                warn!("Could not read modification time of {:?}: {error}", path);
                continue;
            }
        };

        let age = now
            .duration_since(modified_at)
            .unwrap_or(Duration::from_secs(0));
        if age < max_age {
            continue;
        }

        match tokio::fs::remove_file(&path).await {
            Ok(()) => info!("Removed expired download {:?}", path),
            Err(error) if error.kind() == ErrorKind::NotFound => {}
            Err(error) => warn!("Could not remove expired download {:?}: {error}", path),
        }
    }
}

fn load_allowed_origins() -> Result<Arc<HashSet<String>>, ApiError> {
    let configured = std::env::var("ALLOWED_ORIGINS").ok();
    let origins = parse_allowed_origins(configured.as_deref())?;
    info!(
        "CORS allow-list loaded with {} origin(s): {:?}",
        origins.len(),
        origins
    );
    Ok(Arc::new(origins))
}

fn parse_allowed_origins(configured: Option<&str>) -> Result<HashSet<String>, ApiError> {
    let entries = configured
        .map(|value| {
            value
                .split(',')
                .map(str::trim)
                .filter(|origin| !origin.is_empty())
                .map(ToString::to_string)
                .collect::<Vec<_>>()
        })
        .unwrap_or_default();

    let origins = if entries.is_empty() {
        warn!("ALLOWED_ORIGINS is not set, falling back to local development origins.");
        DEFAULT_ALLOWED_ORIGINS
            .iter()
            .map(ToString::to_string)
            .collect()
    } else {
        entries
    };

    origins
        .iter()
        .map(|origin| {
            normalize_origin(origin).ok_or_else(|| {
                ApiError::internal(format!(
                    "Invalid origin in ALLOWED_ORIGINS: {origin}. Use values like https://example.com"
                ))
            })
        })
        .collect()
}

fn build_cors_layer(allowed_origins: Arc<HashSet<String>>) -> CorsLayer {
    let allow_origin = AllowOrigin::predicate(move |origin: &HeaderValue, _| {
        let normalized = origin.to_str().ok().and_then(normalize_origin);
        let allowed = normalized
            .as_ref()
            .is_some_and(|value| allowed_origins.contains(value));
        debug!(
            "CORS origin check raw={:?} normalized={:?} allowed={}",
            origin, normalized, allowed
        );
        allowed
    });

    CorsLayer::new()
        .allow_origin(allow_origin)
        .allow_methods([Method::GET, Method::POST])
        .allow_headers(Any)
}

fn normalize_origin(value: &str) -> Option<String> {
    let parsed = Url::parse(value).ok()?;
    let host = parsed.host_str()?.to_ascii_lowercase();
    let scheme = parsed.scheme();
    let default_port = match scheme {
        "http" => 80,
        "https" => 443,
        _ => return None,
    };
    let port = parsed.port();

    if parsed.path() != "/" || parsed.query().is_some() || parsed.fragment().is_some() {
        return None;
    }

    let include_port = port.is_some_and(|explicit| explicit != default_port);

    if include_port {
        Some(format!("{scheme}://{host}:{}", port?))
    } else {
        Some(format!("{scheme}://{host}"))
    }
}

fn resolve_bind_addr() -> String {
    if let Some(port) = std::env::var("PORT")
        .ok()
        .and_then(|value| value.trim().parse::<u16>().ok())
    {
        return format!("0.0.0.0:{port}");
    }

    format!("0.0.0.0:{DEFAULT_PORT}")
}

fn read_usize_env(name: &str) -> Option<usize> {
    std::env::var(name)
        .ok()
        .and_then(|value| value.trim().parse::<usize>().ok())
}

fn non_empty(value: &str) -> Option<&str> {
    let trimmed = value.trim();
    if trimmed.is_empty() {
        None
    } else {
        Some(trimmed)
    }
}
