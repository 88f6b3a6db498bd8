//! HTTP client for OpenAI-compatible chat-completion APIs.
//!
//! The API layer is split into cohesive modules:
//! - `completions`: request shaping and `/chat/completions` calls
//! - `stream`: incremental delta stream over a streaming response body
//! - `sse`: the `data:` line decoder shared with the relay client
//! - `client`: credential checks, timeout policy, and dispatch

use crate::credentials::Credential;
use crate::error::ApiError;
use crate::types::{ChatRequest, Completion};
use async_trait::async_trait;
use reqwest::header::{HeaderMap, RETRY_AFTER};
use std::time::SystemTime;

mod client;
mod completions;
pub mod sse;
mod stream;

pub use client::ApiClient;
pub use completions::build_chat_request;
pub use stream::CompletionStream;

/// Upstream chat-completion interface used by the relay.
///
/// This trait lets tests provide deterministic canned completions and
/// streams without network calls while the production path uses
/// [`ApiClient`].
#[async_trait]
pub trait UpstreamClient: Send + Sync {
    /// Buffered call: wait for the full body and return the first choice.
    async fn complete(
        &self,
        credential: &Credential,
        request: &ChatRequest,
    ) -> Result<Completion, ApiError>;

    /// Streaming call: return once the upstream has answered 2xx, with the
    /// body exposed as a lazy sequence of text deltas.
    async fn open_stream(
        &self,
        credential: &Credential,
        request: &ChatRequest,
    ) -> Result<CompletionStream, ApiError>;
}

/// Parse `Retry-After` as delta-seconds or an HTTP-date.
pub(crate) fn parse_retry_after_secs(headers: &HeaderMap) -> Option<u64> {
    let raw = headers.get(RETRY_AFTER)?.to_str().ok()?.trim();
    if let Ok(seconds) = raw.parse::<u64>() {
        return Some(seconds);
    }
    let at = httpdate::parse_http_date(raw).ok()?;
    let wait = at
        .duration_since(SystemTime::now())
        .map(|d| d.as_secs())
        .unwrap_or(0);
    Some(wait)
}
