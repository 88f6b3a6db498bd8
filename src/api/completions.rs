//! `/chat/completions` request shaping and HTTP helpers.

use crate::api::parse_retry_after_secs;
use crate::config::UpstreamConfig;
use crate::error::ApiError;
use crate::types::{context_window, ChatMessage, ChatRequest, ChatResponse};

/// Build the upstream request for one turn: optional system prompt, the
/// trailing history window, then the new user message.
pub fn build_chat_request(
    upstream: &UpstreamConfig,
    history: &[ChatMessage],
    user_text: &str,
    stream: bool,
) -> ChatRequest {
    let window = context_window(history);
    let mut messages = Vec::with_capacity(window.len() + 2);
    if !upstream.system_prompt.trim().is_empty() {
        messages.push(ChatMessage::system(upstream.system_prompt.clone()));
    }
    messages.extend(window.iter().cloned());
    messages.push(ChatMessage::user(user_text));
    ChatRequest {
        model: upstream.model.clone(),
        messages,
        temperature: upstream.temperature,
        max_tokens: upstream.max_tokens,
        stream,
    }
}

/// Send one buffered `/chat/completions` request and parse the response.
pub(crate) async fn request(
    http: &reqwest::Client,
    base_url: &str,
    request: &ChatRequest,
    bearer: &str,
) -> Result<ChatResponse, ApiError> {
    let response = send(http, base_url, request, bearer).await?;
    let body = response.text().await?;
    serde_json::from_str::<ChatResponse>(&body)
        .map_err(|err| ApiError::InvalidResponse(format!("chat completion body: {err}")))
}

/// Send one streaming `/chat/completions` request and hand back the raw
/// response once the status is known to be 2xx.
pub(crate) async fn open(
    http: &reqwest::Client,
    base_url: &str,
    request: &ChatRequest,
    bearer: &str,
) -> Result<reqwest::Response, ApiError> {
    send(http, base_url, request, bearer).await
}

async fn send(
    http: &reqwest::Client,
    base_url: &str,
    request: &ChatRequest,
    bearer: &str,
) -> Result<reqwest::Response, ApiError> {
    let url = format!("{base_url}/chat/completions");
    let response = http
        .post(&url)
        .bearer_auth(bearer)
        .json(request)
        .send()
        .await?;
    if !response.status().is_success() {
        let status = response.status().as_u16();
        let retry_after_secs = parse_retry_after_secs(response.headers());
        let body = response.text().await.unwrap_or_default();
        return Err(ApiError::status(status, body, retry_after_secs));
    }
    Ok(response)
}
