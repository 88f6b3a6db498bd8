//! `POST /api/chat` and `GET /health` handlers.

use axum::body::Body;
use axum::extract::rejection::JsonRejection;
use axum::extract::State;
use axum::http::{header, HeaderMap, HeaderValue, StatusCode};
use axum::response::{IntoResponse, Response};
use axum::Json;
use std::convert::Infallible;
use std::sync::Arc;
use tokio::sync::mpsc;
use tokio_stream::wrappers::ReceiverStream;

use super::protocol::{
    RelayErrorBody, RelayFrame, RelayReply, RelayRequest, STREAM_ACCEPT, STREAM_HEADER,
};
use super::AppState;
use crate::api::{build_chat_request, CompletionStream};
use crate::error::{ApiError, UpstreamKind, RELAY_AUTH_TEXT};
use crate::types::MAX_MESSAGE_CHARS;

const STREAM_CHANNEL_CAPACITY: usize = 32;

pub(super) async fn chat(
    State(state): State<Arc<AppState>>,
    headers: HeaderMap,
    payload: Result<Json<RelayRequest>, JsonRejection>,
) -> Response {
    let Json(payload) = match payload {
        Ok(payload) => payload,
        Err(rejection) => {
            tracing::debug!(error = %rejection.body_text(), "rejected relay body");
            return error_response(StatusCode::BAD_REQUEST, "Message is required", None);
        }
    };
    if let Err(reason) = validate_message(&payload.message) {
        return error_response(StatusCode::BAD_REQUEST, reason, None);
    }

    let credential = match state.credential_for(&payload) {
        Ok(credential) => credential,
        Err(err) => {
            tracing::warn!(error = %err, "no usable credential for relay request");
            return error_response(StatusCode::UNAUTHORIZED, RELAY_AUTH_TEXT, None);
        }
    };

    let streaming = wants_stream(&headers);
    let request = build_chat_request(
        &state.upstream,
        &payload.history,
        &payload.message,
        streaming,
    );
    tracing::info!(
        streaming,
        history = payload.history.len(),
        source = %credential.source,
        key = %credential.fingerprint(),
        model = %request.model,
        "relaying chat turn"
    );

    if !streaming {
        return match state.client.complete(&credential, &request).await {
            Ok(completion) => Json(RelayReply {
                response: completion.content,
                usage: completion.usage,
                model: completion.model,
            })
            .into_response(),
            Err(err) => upstream_error_response(&err),
        };
    }

    // Open before committing the 200 so upstream status still maps cleanly.
    let stream = match state.client.open_stream(&credential, &request).await {
        Ok(stream) => stream,
        Err(err) => return upstream_error_response(&err),
    };
    let (tx, rx) = mpsc::channel(STREAM_CHANNEL_CAPACITY);
    tokio::spawn(pump_stream(stream, tx));

    (
        StatusCode::OK,
        [
            (header::CONTENT_TYPE, "text/plain; charset=utf-8"),
            (header::CACHE_CONTROL, "no-cache"),
            (header::CONNECTION, "keep-alive"),
            (header::ACCESS_CONTROL_ALLOW_ORIGIN, "*"),
            (header::ACCESS_CONTROL_ALLOW_HEADERS, "Cache-Control"),
        ],
        Body::from_stream(ReceiverStream::new(rx)),
    )
        .into_response()
}

pub(super) async fn method_not_allowed() -> Response {
    error_response(StatusCode::METHOD_NOT_ALLOWED, "Method not allowed", None)
}

pub(super) async fn health() -> Json<serde_json::Value> {
    Json(serde_json::json!({ "status": "ok" }))
}

/// Forward upstream deltas as relay frames until done, failed, or the
/// caller hangs up. Dropping the upstream stream aborts the upstream body.
async fn pump_stream(mut stream: CompletionStream, tx: mpsc::Sender<Result<String, Infallible>>) {
    let mut fragments = 0usize;
    loop {
        let frame = match stream.next_delta().await {
            Some(Ok(delta)) => RelayFrame::Content(delta),
            Some(Err(err)) => {
                tracing::error!(error = %err, fragments, "upstream stream failed mid-response");
                let (_, message) = classify_upstream_error(&err);
                let _ = tx.send(Ok(RelayFrame::Error(message.to_string()).encode())).await;
                return;
            }
            None => {
                tracing::info!(
                    fragments,
                    chars = stream.accumulated().chars().count(),
                    malformed = stream.malformed_frames(),
                    "relay stream complete"
                );
                let _ = tx.send(Ok(RelayFrame::Done.encode())).await;
                return;
            }
        };
        fragments += 1;
        if tx.send(Ok(frame.encode())).await.is_err() {
            tracing::debug!(fragments, "caller disconnected; dropping upstream stream");
            return;
        }
    }
}

fn validate_message(message: &str) -> Result<(), &'static str> {
    if message.trim().is_empty() {
        return Err("Message is required");
    }
    if message.chars().count() > MAX_MESSAGE_CHARS {
        return Err("Message too long");
    }
    Ok(())
}

fn wants_stream(headers: &HeaderMap) -> bool {
    let accept_stream = headers
        .get(header::ACCEPT)
        .and_then(|value| value.to_str().ok())
        .is_some_and(|accept| accept.contains(STREAM_ACCEPT));
    let flag = headers
        .get(STREAM_HEADER)
        .and_then(|value| value.to_str().ok())
        .is_some_and(|value| value.trim() == "true");
    accept_stream || flag
}

/// Relay status and caller-facing text for an upstream failure.
pub(crate) fn classify_upstream_error(err: &ApiError) -> (StatusCode, &'static str) {
    let (status, kind) = match err {
        ApiError::Config(_) => (StatusCode::UNAUTHORIZED, UpstreamKind::Auth),
        ApiError::Timeout => (StatusCode::REQUEST_TIMEOUT, UpstreamKind::Timeout),
        ApiError::Status { code, .. } => match code {
            401 | 403 => (StatusCode::UNAUTHORIZED, UpstreamKind::Auth),
            429 => (StatusCode::TOO_MANY_REQUESTS, UpstreamKind::RateLimit),
            408 | 504 => (StatusCode::REQUEST_TIMEOUT, UpstreamKind::Timeout),
            _ => (StatusCode::INTERNAL_SERVER_ERROR, UpstreamKind::Generic),
        },
        ApiError::Http(_) | ApiError::InvalidResponse(_) => {
            (StatusCode::INTERNAL_SERVER_ERROR, UpstreamKind::Generic)
        }
    };
    (status, kind.relay_text())
}

fn upstream_error_response(err: &ApiError) -> Response {
    let (status, message) = classify_upstream_error(err);
    tracing::error!(error = %err, status = status.as_u16(), "upstream call failed");
    let retry_after = (status == StatusCode::TOO_MANY_REQUESTS)
        .then(|| err.retry_after_secs())
        .flatten();
    error_response(status, message, retry_after)
}

fn error_response(status: StatusCode, message: &str, retry_after_secs: Option<u64>) -> Response {
    let mut response = (
        status,
        Json(RelayErrorBody {
            error: message.to_string(),
        }),
    )
        .into_response();
    if let Some(secs) = retry_after_secs {
        response
            .headers_mut()
            .insert(header::RETRY_AFTER, HeaderValue::from(secs));
    }
    response
}
