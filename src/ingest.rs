//! The ingest HTTP server: a Loki push-protocol subset, a Prometheus
//! exposition endpoint, and liveness/readiness probes.
//!
//! Built on `axum` + `tokio`, the pack's established choice for an HTTP
//! surface (the `vector`/`estuary-flow` manifests both carry it). The
//! teacher has no service layer of its own; the request-handling shape here
//! — decode, validate, hand off to a background writer, map errors to a
//! compact JSON body — follows the same "errors are values, not panics"
//! discipline as the rest of this codebase.

use std::io::Read as _;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use axum::body::Bytes;
use axum::extract::State;
use axum::http::{HeaderMap, StatusCode};
use axum::response::{IntoResponse, Response};
use axum::routing::{get, post};
use axum::Router;
use chrono::{DateTime, Utc};
use serde::Deserialize;
use tokio::sync::Semaphore;

use crate::error::LogtapError;
use crate::lifecycle::{AuditLog, WebhookDispatcher};
use crate::metrics::Metrics;
use crate::model::LogEntry;
use crate::redact::Redactor;
use crate::write::Writer;

const MAX_BODY_BYTES: usize = 16 * 1024 * 1024;
const MAX_RAW_BODY_BYTES: usize = 64 * 1024 * 1024;

pub struct AppState {
    pub writer: Writer,
    pub redactor: Redactor,
    pub metrics: Arc<Metrics>,
    pub audit: Arc<AuditLog>,
    pub webhooks: Arc<WebhookDispatcher>,
    pub degraded: AtomicBool,
    pub ready: AtomicBool,
    pub push_semaphore: Semaphore,
}

impl AppState {
    pub fn permits(buf_size: usize) -> usize {
        (buf_size / 1024).max(16)
    }
}

pub fn router(state: Arc<AppState>) -> Router {
    Router::new()
        .route("/loki/api/v1/push", post(push))
        .route("/metrics", get(metrics_endpoint))
        .route("/healthz", get(healthz))
        .route("/ready", get(ready))
        .with_state(state)
        .layer(axum::extract::DefaultBodyLimit::max(MAX_RAW_BODY_BYTES))
}

#[derive(Debug, Deserialize)]
struct PushRequest {
    streams: Vec<PushStream>,
}

#[derive(Debug, Deserialize)]
struct PushStream {
    stream: LabelMap,
    values: Vec<[String; 2]>,
}

/// Mirrors `LogEntry`'s `label_map` wire format: a JSON object, decoded
/// order-preserving into a `Vec`.
#[derive(Debug, Deserialize)]
struct LabelMap(#[serde(with = "crate::model::label_map")] Vec<(String, String)>);

fn error_response(status: StatusCode, err: LogtapError) -> Response {
    (status, axum::Json(err.to_json())).into_response()
}

/// 429 with the `Retry-After: 1` header spec.md §4.4 requires.
fn busy_response() -> Response {
    let mut resp = error_response(StatusCode::TOO_MANY_REQUESTS, LogtapError::Backpressure);
    resp.headers_mut()
        .insert("Retry-After", axum::http::HeaderValue::from_static("1"));
    resp
}

async fn push(State(state): State<Arc<AppState>>, headers: HeaderMap, body: Bytes) -> Response {
    let Ok(_permit) = state.push_semaphore.try_acquire() else {
        return busy_response();
    };

    if state.degraded.load(Ordering::Acquire) {
        return error_response(
            StatusCode::SERVICE_UNAVAILABLE,
            LogtapError::Io("rotator is degraded".to_string()),
        );
    }

    let content_type = headers
        .get(axum::http::header::CONTENT_TYPE)
        .and_then(|v| v.to_str().ok())
        .unwrap_or("application/json");

    if content_type.starts_with("application/x-protobuf") {
        return error_response(
            StatusCode::NOT_IMPLEMENTED,
            LogtapError::protocol("protobuf push bodies are not decoded"),
        );
    }

    let decoded = match decode_body(&headers, &body) {
        Ok(d) => d,
        Err(e) => return error_response(StatusCode::BAD_REQUEST, e),
    };

    if decoded.len() > MAX_BODY_BYTES {
        return error_response(
            StatusCode::PAYLOAD_TOO_LARGE,
            LogtapError::protocol(format!("body exceeds {} bytes uncompressed", MAX_BODY_BYTES)),
        );
    }

    let parsed: PushRequest = match serde_json::from_slice(&decoded) {
        Ok(p) => p,
        Err(e) => {
            return error_response(StatusCode::BAD_REQUEST, LogtapError::protocol(e.to_string()))
        }
    };

    // Counted up front because backpressure tripping partway through a batch
    // must still account for every entry the handler never got to attempt
    // (spec §8 property 8: logs_dropped_total increases by exactly the
    // number of entries not enqueued, not just the one that tripped it).
    let total_entries: usize = parsed.streams.iter().map(|s| s.values.len()).sum();
    let mut processed: usize = 0;

    let now = Utc::now();
    for stream in parsed.streams {
        let labels = stream.stream.0;
        for [ts_str, message] in stream.values {
            let timestamp = parse_ns_timestamp(&ts_str).unwrap_or_else(|| {
                state.metrics.parse_fallback_total.inc();
                now
            });
            let (message, labels) = state.redactor.apply(&message, &labels, false);
            let entry = LogEntry::new(timestamp, labels, message);
            state.metrics.logs_received_total.inc();
            match state.writer.write(entry) {
                Ok(()) => {
                    processed += 1;
                }
                Err(LogtapError::Backpressure) => {
                    let not_enqueued = (total_entries - processed) as u64;
                    state.metrics.logs_dropped_total.inc_by(not_enqueued);
                    return busy_response();
                }
                Err(e) => {
                    state.degraded.store(true, Ordering::Release);
                    return error_response(StatusCode::SERVICE_UNAVAILABLE, e);
                }
            }
        }
    }

    StatusCode::NO_CONTENT.into_response()
}

fn parse_ns_timestamp(s: &str) -> Option<DateTime<Utc>> {
    let nanos: i64 = s.parse().ok()?;
    DateTime::from_timestamp(nanos / 1_000_000_000, (nanos % 1_000_000_000) as u32)
}

fn decode_body(headers: &HeaderMap, body: &[u8]) -> Result<Vec<u8>, LogtapError> {
    let encoding = headers
        .get(axum::http::header::CONTENT_ENCODING)
        .and_then(|v| v.to_str().ok())
        .unwrap_or("identity");
    match encoding {
        "identity" | "" => Ok(body.to_vec()),
        "gzip" => {
            let mut out = Vec::new();
            flate2::read::GzDecoder::new(body)
                .read_to_end(&mut out)
                .map_err(|e| LogtapError::protocol(format!("bad gzip body: {e}")))?;
            Ok(out)
        }
        "snappy" => snap::raw::Decoder::new()
            .decompress_vec(body)
            .map_err(|e| LogtapError::protocol(format!("bad snappy body: {e}"))),
        other => Err(LogtapError::protocol(format!("unsupported content-encoding: {other}"))),
    }
}

async fn metrics_endpoint(State(state): State<Arc<AppState>>) -> Response {
    (
        StatusCode::OK,
        [("content-type", "text/plain; version=0.0.4")],
        state.metrics.render(),
    )
        .into_response()
}

async fn healthz(State(state): State<Arc<AppState>>) -> StatusCode {
    if state.degraded.load(Ordering::Acquire) {
        StatusCode::SERVICE_UNAVAILABLE
    } else {
        StatusCode::OK
    }
}

async fn ready(State(state): State<Arc<AppState>>) -> StatusCode {
    if state.ready.load(Ordering::Acquire) {
        StatusCode::OK
    } else {
        StatusCode::SERVICE_UNAVAILABLE
    }
}

/// Waits up to 5 s for in-flight handlers to drain before the caller
/// cancels the rest of the process (spec.md §4.4 graceful shutdown).
pub async fn drain(state: &AppState, total_permits: usize) {
    let budget = Duration::from_secs(5);
    let deadline = tokio::time::Instant::now() + budget;
    loop {
        if state.push_semaphore.available_permits() >= total_permits {
            return;
        }
        if tokio::time::Instant::now() >= deadline {
            tracing::warn!("graceful shutdown drain budget exceeded, cancelling in-flight handlers");
            return;
        }
        tokio::time::sleep(Duration::from_millis(50)).await;
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_nanosecond_timestamps() {
        let ts = parse_ns_timestamp("1700000000000000000").unwrap();
        assert_eq!(ts.timestamp(), 1_700_000_000);
    }

    #[test]
    fn rejects_garbage_timestamp() {
        assert!(parse_ns_timestamp("not-a-number").is_none());
    }

    #[test]
    fn decodes_gzip_body() {
        use flate2::write::GzEncoder;
        use flate2::Compression;
        use std::io::Write as _;

        let mut enc = GzEncoder::new(Vec::new(), Compression::default());
        enc.write_all(b"{\"streams\":[]}").unwrap();
        let gz = enc.finish().unwrap();

        let mut headers = HeaderMap::new();
        headers.insert(axum::http::header::CONTENT_ENCODING, "gzip".parse().unwrap());
        let decoded = decode_body(&headers, &gz).unwrap();
        assert_eq!(decoded, b"{\"streams\":[]}");
    }

    #[test]
    fn rejects_unknown_encoding() {
        let mut headers = HeaderMap::new();
        headers.insert(axum::http::header::CONTENT_ENCODING, "br".parse().unwrap());
        assert!(decode_body(&headers, b"x").is_err());
    }

    /// Spec §8 property 8 / scenario S3: every entry in a batch must end up
    /// either written or counted in `logs_dropped_total`, even when
    /// backpressure trips partway through (not just on the entry that
    /// tripped it).
    #[tokio::test]
    async fn backpressure_mid_batch_accounts_for_every_entry() {
        let dir = tempfile::tempdir().unwrap();
        let rotator =
            crate::rotate::Rotator::new(dir.path().to_path_buf(), 1024 * 1024, 1024 * 1024 * 1024, false).unwrap();
        let metrics = Arc::new(Metrics::new("0.0.0"));
        let gauge_metrics = metrics.clone();
        let writer = Writer::spawn(rotator, 1, move |len| gauge_metrics.writer_queue_length.set(len as i64), |_| {});
        let state = Arc::new(AppState {
            writer,
            redactor: Redactor::disabled(),
            metrics: metrics.clone(),
            audit: Arc::new(AuditLog::open(dir.path()).unwrap()),
            webhooks: Arc::new(WebhookDispatcher::new(Vec::new(), Vec::new(), dir.path().to_path_buf())),
            degraded: AtomicBool::new(false),
            ready: AtomicBool::new(true),
            push_semaphore: Semaphore::new(AppState::permits(1)),
        });

        let n: usize = 500;
        let values: Vec<[String; 2]> = (0..n)
            .map(|i| ["1700000000000000000".to_string(), format!("line-{i}")])
            .collect();
        let body = serde_json::json!({ "streams": [{ "stream": {"app": "x"}, "values": values }] });
        let bytes = Bytes::from(serde_json::to_vec(&body).unwrap());

        let _ = push(State(state.clone()), HeaderMap::new(), bytes).await;
        std::thread::sleep(Duration::from_millis(200));

        let written = state.writer.lines_written();
        let dropped = state.metrics.logs_dropped_total.get();
        assert_eq!(written + dropped, n as u64, "every pushed entry must be written or counted dropped");
    }
}
