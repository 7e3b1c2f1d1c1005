//! HTTP surface for the PII scanning service.
//!
//! This module exposes a compact Axum router with a handful of endpoints:
//!
//! - `POST /detect` – Scan a document and return the detected spans, the
//!   masked rendering, and a per-type summary.
//! - `POST /detect/stream` – Chunked scan streamed as newline-delimited JSON
//!   frames, one per completed chunk in ascending chunk order, closed by a
//!   terminal frame carrying the aggregate summary.
//! - `GET /metrics` – Observe scan counters and the last chunk count.
//! - `GET /commands` – Machine-readable command catalog, mounted only when
//!   reflection is enabled.
//!
//! Offsets and counts cross the wire as native `i32`/`f32`; the conversion
//! from the engine's `usize` offsets happens here and nowhere else. Requests
//! may carry an `x-deadline-ms` header; a deadline of zero fails immediately
//! with `DEADLINE_EXCEEDED`, and an expired deadline abandons in-flight
//! detection.

use crate::detection::{
    ChunkFrame, DetectionApi, DetectionError, DetectionResult, PiiType, ScanOptions, Span,
};
use axum::{
    Json, Router,
    body::Body,
    extract::State,
    http::{HeaderMap, StatusCode, header},
    response::{IntoResponse, Response},
    routing::{get, post},
};
use futures_util::StreamExt;
use serde::{Deserialize, Serialize};
use serde_json::json;
use std::collections::BTreeMap;
use std::sync::Arc;
use std::time::Duration;
use tokio::time::Instant;

/// Build the HTTP router exposing the detection API surface.
pub fn create_router<S>(service: Arc<S>, enable_reflection: bool) -> Router
where
    S: DetectionApi + 'static,
{
    let mut router = Router::new()
        .route("/detect", post(detect::<S>))
        .route("/detect/stream", post(detect_streaming::<S>))
        .route("/metrics", get(get_metrics::<S>));
    if enable_reflection {
        router = router.route("/commands", get(get_commands));
    }
    router.with_state(service)
}

/// Request body for the detection endpoints.
#[derive(Deserialize)]
struct DetectRequest {
    /// Raw text to scan.
    content: String,
    /// Optional confidence floor; the policy default applies when absent.
    #[serde(default)]
    threshold: Option<f32>,
    /// Optional per-request detector overrides.
    #[serde(default)]
    options: Option<DetectOptions>,
}

/// Per-request detector overrides.
#[derive(Deserialize, Clone, Copy)]
struct DetectOptions {
    #[serde(default = "default_enabled")]
    enable_ml: bool,
    #[serde(default = "default_enabled")]
    enable_regex: bool,
    #[serde(default = "default_enabled")]
    enable_rule: bool,
    #[serde(default = "default_enabled")]
    fetch_policy_from_store: bool,
}

fn default_enabled() -> bool {
    true
}

fn scan_options(options: Option<DetectOptions>) -> ScanOptions {
    match options {
        Some(options) => ScanOptions {
            enable_ml: options.enable_ml,
            enable_regex: options.enable_regex,
            enable_rule: options.enable_rule,
            fetch_policy_from_store: options.fetch_policy_from_store,
        },
        None => ScanOptions::default(),
    }
}

/// Span as it crosses the wire: native integer offsets, float score.
#[derive(Serialize)]
struct WireSpan {
    text: String,
    #[serde(rename = "type")]
    pii_type: PiiType,
    detector_label: String,
    start: i32,
    end: i32,
    score: f32,
}

impl From<Span> for WireSpan {
    fn from(span: Span) -> Self {
        Self {
            text: span.text,
            pii_type: span.pii_type,
            detector_label: span.detector_label,
            start: i32::try_from(span.start).unwrap_or(i32::MAX),
            end: i32::try_from(span.end).unwrap_or(i32::MAX),
            score: span.score,
        }
    }
}

/// Success response for `POST /detect`.
#[derive(Serialize)]
struct DetectResponse {
    entities: Vec<WireSpan>,
    masked_content: String,
    summary: BTreeMap<String, i32>,
}

impl From<DetectionResult> for DetectResponse {
    fn from(result: DetectionResult) -> Self {
        Self {
            entities: result.spans.into_iter().map(WireSpan::from).collect(),
            masked_content: result.masked_content,
            summary: coerce_summary(result.summary),
        }
    }
}

/// One streamed frame on the wire.
#[derive(Serialize)]
struct WireChunkFrame {
    chunk_index: i32,
    total_chunks: i32,
    entities: Vec<WireSpan>,
    #[serde(skip_serializing_if = "Option::is_none")]
    summary: Option<BTreeMap<String, i32>>,
}

impl From<ChunkFrame> for WireChunkFrame {
    fn from(frame: ChunkFrame) -> Self {
        Self {
            chunk_index: i32::try_from(frame.chunk_index).unwrap_or(i32::MAX),
            total_chunks: i32::try_from(frame.total_chunks).unwrap_or(i32::MAX),
            entities: frame.spans.into_iter().map(WireSpan::from).collect(),
            summary: frame.summary.map(coerce_summary),
        }
    }
}

fn coerce_summary(summary: BTreeMap<String, u32>) -> BTreeMap<String, i32> {
    summary
        .into_iter()
        .map(|(name, count)| (name, i32::try_from(count).unwrap_or(i32::MAX)))
        .collect()
}

/// Scan a document and return the consolidated detection result.
async fn detect<S>(
    State(service): State<Arc<S>>,
    headers: HeaderMap,
    Json(request): Json<DetectRequest>,
) -> Result<Json<DetectResponse>, ApiError>
where
    S: DetectionApi,
{
    let deadline = parse_deadline(&headers)?;
    validate_request(&request, service.max_content_bytes())?;
    if let Some(deadline) = deadline
        && deadline <= Instant::now()
    {
        return Err(ApiError::DeadlineExceeded);
    }

    let scan = service.detect(request.content, request.threshold, scan_options(request.options));
    let result = match deadline {
        Some(deadline) => tokio::time::timeout_at(deadline, scan)
            .await
            .map_err(|_| ApiError::DeadlineExceeded)??,
        None => scan.await?,
    };
    Ok(Json(DetectResponse::from(result)))
}

/// Scan a document, streaming NDJSON chunk frames.
async fn detect_streaming<S>(
    State(service): State<Arc<S>>,
    headers: HeaderMap,
    Json(request): Json<DetectRequest>,
) -> Result<Response, ApiError>
where
    S: DetectionApi,
{
    let deadline = parse_deadline(&headers)?;
    validate_request(&request, service.max_content_bytes())?;
    if let Some(deadline) = deadline
        && deadline <= Instant::now()
    {
        return Err(ApiError::DeadlineExceeded);
    }

    let stream = service
        .detect_streaming(
            request.content,
            request.threshold,
            scan_options(request.options),
            deadline,
        )
        .await?;

    let body = Body::from_stream(stream.map(|frame| {
        let line = serde_json::to_string(&WireChunkFrame::from(frame))
            .unwrap_or_else(|_| "{}".to_string());
        Ok::<String, std::convert::Infallible>(line + "\n")
    }));

    Response::builder()
        .status(StatusCode::OK)
        .header(header::CONTENT_TYPE, "application/x-ndjson")
        .body(body)
        .map_err(|error| ApiError::Internal(error.to_string()))
}

/// Return a concise metrics snapshot with scan counters.
async fn get_metrics<S>(State(service): State<Arc<S>>) -> Json<MetricsResponse>
where
    S: DetectionApi,
{
    let snapshot = service.metrics_snapshot();
    Json(MetricsResponse {
        scans_completed: snapshot.scans_completed,
        spans_detected: snapshot.spans_detected,
        last_chunk_count: snapshot.last_chunk_count,
    })
}

/// Response body for `GET /metrics`.
#[derive(Serialize)]
struct MetricsResponse {
    scans_completed: u64,
    spans_detected: u64,
    #[serde(skip_serializing_if = "Option::is_none")]
    last_chunk_count: Option<u64>,
}

/// Descriptor for a single command in the discovery catalog.
#[derive(Serialize)]
struct CommandDescriptor {
    name: &'static str,
    method: &'static str,
    path: &'static str,
    description: &'static str,
    #[serde(skip_serializing_if = "Option::is_none")]
    request_example: Option<serde_json::Value>,
}

/// Response body for `GET /commands`.
#[derive(Serialize)]
struct CommandsResponse {
    commands: Vec<CommandDescriptor>,
}

/// Enumerate supported HTTP commands for discovery/UX in hosts and tools.
async fn get_commands() -> Json<CommandsResponse> {
    Json(CommandsResponse {
        commands: vec![
            CommandDescriptor {
                name: "detect",
                method: "POST",
                path: "/detect",
                description: "Scan text for PII and return spans, masked content, and a per-type summary.",
                request_example: Some(json!({
                    "content": "Contact john.doe@example.com",
                    "threshold": 0.5,
                    "options": {
                        "enable_ml": true,
                        "enable_regex": true,
                        "enable_rule": true,
                        "fetch_policy_from_store": true
                    }
                })),
            },
            CommandDescriptor {
                name: "detect_stream",
                method: "POST",
                path: "/detect/stream",
                description: "Chunked scan streamed as NDJSON frames ordered by chunk index, closed by a terminal summary frame.",
                request_example: Some(json!({
                    "content": "Long document ...",
                    "threshold": 0.5
                })),
            },
            CommandDescriptor {
                name: "metrics",
                method: "GET",
                path: "/metrics",
                description: "Return scan counters useful for observability dashboards.",
                request_example: None,
            },
        ],
    })
}

fn parse_deadline(headers: &HeaderMap) -> Result<Option<Instant>, ApiError> {
    let Some(value) = headers.get("x-deadline-ms") else {
        return Ok(None);
    };
    let millis: u64 = value
        .to_str()
        .ok()
        .and_then(|raw| raw.trim().parse().ok())
        .ok_or_else(|| ApiError::InvalidArgument("x-deadline-ms must be an integer".into()))?;
    Ok(Some(Instant::now() + Duration::from_millis(millis)))
}

fn validate_request(request: &DetectRequest, max_content_bytes: usize) -> Result<(), ApiError> {
    if request.content.len() > max_content_bytes {
        return Err(ApiError::InvalidArgument(format!(
            "content exceeds maximum size of {max_content_bytes} bytes"
        )));
    }
    if let Some(threshold) = request.threshold
        && !(0.0..=1.0).contains(&threshold)
    {
        return Err(ApiError::InvalidArgument(
            "threshold must be between 0.0 and 1.0".into(),
        ));
    }
    Ok(())
}

/// Errors surfaced to HTTP callers.
///
/// Detection degradation never lands here; only transport, deadline, and
/// input-validation failures reach the client as errors.
enum ApiError {
    InvalidArgument(String),
    DeadlineExceeded,
    Internal(String),
}

impl From<DetectionError> for ApiError {
    fn from(error: DetectionError) -> Self {
        ApiError::Internal(error.to_string())
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let (status, code, message) = match self {
            ApiError::InvalidArgument(message) => {
                (StatusCode::BAD_REQUEST, "INVALID_ARGUMENT", message)
            }
            ApiError::DeadlineExceeded => (
                StatusCode::GATEWAY_TIMEOUT,
                "DEADLINE_EXCEEDED",
                "request deadline expired".to_string(),
            ),
            ApiError::Internal(message) => {
                (StatusCode::INTERNAL_SERVER_ERROR, "INTERNAL", message)
            }
        };
        (status, Json(json!({ "code": code, "message": message }))).into_response()
    }
}
