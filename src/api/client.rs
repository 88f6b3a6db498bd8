//! API client for OpenAI-compatible chat transports.

use async_trait::async_trait;
use std::time::Duration;

use super::completions;
use super::stream::CompletionStream;
use super::UpstreamClient;
use crate::credentials::Credential;
use crate::error::ApiError;
use crate::types::{ChatRequest, Completion};

/// Client for OpenAI-compatible model APIs.
///
/// Holds no credential of its own: each call names the [`Credential`] it
/// runs under, so one client serves user-keyed and guest requests alike.
#[derive(Debug, Clone)]
pub struct ApiClient {
    http: reqwest::Client,
    timeout: Duration,
}

impl ApiClient {
    /// Build a client whose calls fail with [`ApiError::Timeout`] after
    /// `timeout` (connect through end of body).
    pub fn new(timeout: Duration) -> Self {
        Self {
            http: build_http_client(timeout),
            timeout,
        }
    }

    pub fn timeout(&self) -> Duration {
        self.timeout
    }

    /// Buffered completion: the first choice's content plus usage metadata.
    pub async fn complete(
        &self,
        credential: &Credential,
        request: &ChatRequest,
    ) -> Result<Completion, ApiError> {
        let (base_url, api_key) = checked_target(credential)?;
        let body = ChatRequest {
            stream: false,
            ..request.clone()
        };
        tracing::debug!(
            model = %body.model,
            messages = body.messages.len(),
            source = %credential.source,
            key = %credential.fingerprint(),
            "sending buffered completion"
        );
        let response = completions::request(&self.http, base_url, &body, api_key).await?;
        Ok(Completion::from(response))
    }

    /// Open a streaming completion. Status errors surface here, before any
    /// delta is produced.
    pub async fn open_stream(
        &self,
        credential: &Credential,
        request: &ChatRequest,
    ) -> Result<CompletionStream, ApiError> {
        let (base_url, api_key) = checked_target(credential)?;
        let body = ChatRequest {
            stream: true,
            ..request.clone()
        };
        tracing::debug!(
            model = %body.model,
            messages = body.messages.len(),
            source = %credential.source,
            key = %credential.fingerprint(),
            "opening completion stream"
        );
        let response = completions::open(&self.http, base_url, &body, api_key).await?;
        Ok(CompletionStream::from_response(response))
    }

    /// Streaming completion driven to the end, reporting each delta to
    /// `on_fragment(delta, accumulated)`. Returns the full text.
    pub async fn stream<F>(
        &self,
        credential: &Credential,
        request: &ChatRequest,
        on_fragment: F,
    ) -> Result<String, ApiError>
    where
        F: FnMut(&str, &str),
    {
        self.open_stream(credential, request)
            .await?
            .for_each_fragment(on_fragment)
            .await
    }
}

#[async_trait]
impl UpstreamClient for ApiClient {
    async fn complete(
        &self,
        credential: &Credential,
        request: &ChatRequest,
    ) -> Result<Completion, ApiError> {
        ApiClient::complete(self, credential, request).await
    }

    async fn open_stream(
        &self,
        credential: &Credential,
        request: &ChatRequest,
    ) -> Result<CompletionStream, ApiError> {
        ApiClient::open_stream(self, credential, request).await
    }
}

/// Build an HTTP client with timeout applied.
fn build_http_client(timeout: Duration) -> reqwest::Client {
    // Fall back to reqwest defaults if builder creation fails for any reason.
    reqwest::Client::builder()
        .timeout(timeout)
        .build()
        .unwrap_or_else(|_| reqwest::Client::new())
}

/// Normalized base URL and key, or a config error before any network use.
fn checked_target(credential: &Credential) -> Result<(&str, &str), ApiError> {
    let api_key = credential.api_key.trim();
    if api_key.is_empty() {
        return Err(ApiError::Config("API key not configured".to_string()));
    }
    let base_url = credential.base_url.trim().trim_end_matches('/');
    if base_url.is_empty() {
        return Err(ApiError::Config("base URL not configured".to_string()));
    }
    Ok((base_url, api_key))
}
