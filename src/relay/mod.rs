//! Server-side relay: accepts one chat turn and forwards it upstream.
//!
//! Routes:
//! - `POST /api/chat`: buffered JSON reply or streamed `data:` frames
//! - `GET /health`: liveness
//!
//! Any other method on `/api/chat` gets `405`.

use axum::routing::{get, post};
use axum::Router;
use std::future::Future;
use std::sync::Arc;
use tokio::net::TcpListener;

use crate::api::UpstreamClient;
use crate::config::{AccessConfig, Config, UpstreamConfig};
use crate::credentials::{resolve_credential, Credential, Resolution, UserKeyRecord};
use crate::error::CredentialError;

mod handler;
pub mod protocol;

pub use protocol::{RelayErrorBody, RelayFrame, RelayReply, RelayRequest};

/// Shared handler state. Built once at startup.
pub struct AppState {
    pub upstream: UpstreamConfig,
    pub access: AccessConfig,
    pub client: Arc<dyn UpstreamClient>,
}

impl AppState {
    pub fn new(config: &Config, client: Arc<dyn UpstreamClient>) -> Self {
        Self {
            upstream: config.upstream.clone(),
            access: config.access.clone(),
            client,
        }
    }

    /// Credential for one request: the caller's key override if present,
    /// else the server policy. The usage counter lives with the client, so
    /// the server resolves as if none has been used.
    fn credential_for(&self, request: &RelayRequest) -> Result<Credential, CredentialError> {
        let user = request
            .user_api_key
            .as_deref()
            .map(str::trim)
            .filter(|key| !key.is_empty())
            .map(|key| UserKeyRecord {
                api_key: key.to_string(),
                base_url: request
                    .user_base_url
                    .as_deref()
                    .map(|url| url.trim().trim_end_matches('/').to_string())
                    .unwrap_or_default(),
                timestamp: 0,
            });
        let resolution = match user {
            Some(record) => Resolution::User(record),
            None => resolve_credential(&self.access, None, 0)?,
        };
        Credential::materialize(resolution, &self.upstream.base_url, &self.upstream.api_key)
    }
}

/// Relay routes bound to `state`.
pub fn router(state: Arc<AppState>) -> Router {
    Router::new()
        .route(
            "/api/chat",
            post(handler::chat).fallback(handler::method_not_allowed),
        )
        .route("/health", get(handler::health))
        .with_state(state)
}

/// Serve the relay on `listener` until `shutdown` resolves.
pub async fn serve<F>(listener: TcpListener, state: Arc<AppState>, shutdown: F) -> std::io::Result<()>
where
    F: Future<Output = ()> + Send + 'static,
{
    let addr = listener.local_addr()?;
    tracing::info!(
        %addr,
        model = %state.upstream.model,
        guest_mode = state.access.allow_guest_mode,
        require_user_key = state.access.require_user_api_key,
        "relay listening"
    );
    axum::serve(listener, router(state))
        .with_graceful_shutdown(shutdown)
        .await
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::api::CompletionStream;
    use crate::credentials::CredentialSource;
    use crate::error::ApiError;
    use crate::types::{ChatRequest, Completion, Usage};
    use async_trait::async_trait;
    use futures_util::stream;
    use std::sync::Mutex;

    enum Reply {
        Fragments(Vec<&'static str>),
        FailWith(fn() -> ApiError),
        FailAfter(&'static str),
    }

    struct FakeUpstream {
        reply: Reply,
        calls: Mutex<Vec<(Credential, ChatRequest)>>,
    }

    impl FakeUpstream {
        fn new(reply: Reply) -> Arc<Self> {
            Arc::new(Self {
                reply,
                calls: Mutex::new(Vec::new()),
            })
        }

        fn calls(&self) -> Vec<(Credential, ChatRequest)> {
            self.calls.lock().unwrap().clone()
        }

        fn record(&self, credential: &Credential, request: &ChatRequest) {
            self.calls
                .lock()
                .unwrap()
                .push((credential.clone(), request.clone()));
        }
    }

    fn chunk(delta: &str) -> Result<Vec<u8>, ApiError> {
        Ok(format!(
            "data: {}\n\n",
            serde_json::json!({"choices": [{"delta": {"content": delta}}]})
        )
        .into_bytes())
    }

    #[async_trait]
    impl UpstreamClient for FakeUpstream {
        async fn complete(
            &self,
            credential: &Credential,
            request: &ChatRequest,
        ) -> Result<Completion, ApiError> {
            self.record(credential, request);
            match &self.reply {
                Reply::Fragments(parts) => Ok(Completion {
                    content: parts.concat(),
                    usage: Some(Usage {
                        prompt_tokens: 1,
                        completion_tokens: 2,
                        total_tokens: 3,
                    }),
                    model: "fake-model".into(),
                }),
                Reply::FailWith(make) => Err(make()),
                Reply::FailAfter(_) => Err(ApiError::Timeout),
            }
        }

        async fn open_stream(
            &self,
            credential: &Credential,
            request: &ChatRequest,
        ) -> Result<CompletionStream, ApiError> {
            self.record(credential, request);
            let items: Vec<Result<Vec<u8>, ApiError>> = match &self.reply {
                Reply::Fragments(parts) => {
                    let mut items: Vec<_> = parts.iter().map(|p| chunk(p)).collect();
                    items.push(Ok(b"data: [DONE]\n\n".to_vec()));
                    items
                }
                Reply::FailWith(make) => return Err(make()),
                Reply::FailAfter(part) => vec![chunk(part), Err(ApiError::Timeout)],
            };
            Ok(CompletionStream::from_chunks(stream::iter(items)))
        }
    }

    fn guest_config() -> Config {
        let mut config = Config::default();
        config.upstream.api_key = "sk-server-key".into();
        config.upstream.base_url = "https://upstream.example/v1".into();
        config.access.allow_guest_mode = true;
        config
    }

    async fn spawn_relay(config: Config, upstream: Arc<FakeUpstream>) -> String {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        let state = Arc::new(AppState::new(&config, upstream));
        tokio::spawn(async move {
            let _ = axum::serve(listener, router(state)).await;
        });
        format!("http://{addr}")
    }

    fn post_chat(base: &str, body: serde_json::Value) -> reqwest::RequestBuilder {
        reqwest::Client::new()
            .post(format!("{base}/api/chat"))
            .json(&body)
    }

    #[tokio::test]
    async fn buffered_reply_carries_response_usage_and_model() {
        let upstream = FakeUpstream::new(Reply::Fragments(vec!["Hel", "lo"]));
        let base = spawn_relay(guest_config(), upstream.clone()).await;

        let response = post_chat(&base, serde_json::json!({"message": "hi"}))
            .send()
            .await
            .unwrap();
        assert_eq!(response.status(), 200);
        let reply: RelayReply = response.json().await.unwrap();
        assert_eq!(reply.response, "Hello");
        assert_eq!(reply.model, "fake-model");
        assert_eq!(reply.usage.map(|u| u.total_tokens), Some(3));

        let calls = upstream.calls();
        assert_eq!(calls.len(), 1);
        assert_eq!(calls[0].0.source, CredentialSource::GuestQuota);
        assert_eq!(calls[0].0.api_key, "sk-server-key");
        assert!(!calls[0].1.stream);
    }

    #[tokio::test]
    async fn streamed_reply_is_framed_with_headers_and_done() {
        let upstream = FakeUpstream::new(Reply::Fragments(vec!["Hel", "lo"]));
        let base = spawn_relay(guest_config(), upstream).await;

        let response = post_chat(&base, serde_json::json!({"message": "hi"}))
            .header("x-stream", "true")
            .send()
            .await
            .unwrap();
        assert_eq!(response.status(), 200);
        let headers = response.headers().clone();
        assert_eq!(headers["content-type"], "text/plain; charset=utf-8");
        assert_eq!(headers["cache-control"], "no-cache");
        assert_eq!(headers["access-control-allow-origin"], "*");
        let body = response.text().await.unwrap();
        assert_eq!(
            body,
            "data: {\"content\":\"Hel\"}\n\ndata: {\"content\":\"lo\"}\n\ndata: [DONE]\n\n"
        );
    }

    #[tokio::test]
    async fn mid_stream_failure_emits_error_frame_without_done() {
        let upstream = FakeUpstream::new(Reply::FailAfter("partial"));
        let base = spawn_relay(guest_config(), upstream).await;

        let body = post_chat(&base, serde_json::json!({"message": "hi"}))
            .header("accept", "text/stream")
            .send()
            .await
            .unwrap()
            .text()
            .await
            .unwrap();
        assert!(body.starts_with("data: {\"content\":\"partial\"}\n\n"));
        assert!(body.contains("\"error\":\"Request timeout\""));
        assert!(!body.contains("[DONE]"));
    }

    #[tokio::test]
    async fn invalid_messages_never_reach_upstream() {
        let upstream = FakeUpstream::new(Reply::Fragments(vec!["x"]));
        let base = spawn_relay(guest_config(), upstream.clone()).await;

        let long = "a".repeat(4001);
        for (body, expected) in [
            (serde_json::json!({"message": long}), "Message too long"),
            (serde_json::json!({"message": "   "}), "Message is required"),
            (serde_json::json!({"history": []}), "Message is required"),
        ] {
            let response = post_chat(&base, body).send().await.unwrap();
            assert_eq!(response.status(), 400);
            let err: RelayErrorBody = response.json().await.unwrap();
            assert_eq!(err.error, expected);
        }
        assert!(upstream.calls().is_empty());
    }

    #[tokio::test]
    async fn wrong_method_is_405_and_health_is_ok() {
        let upstream = FakeUpstream::new(Reply::Fragments(vec![]));
        let base = spawn_relay(guest_config(), upstream).await;
        let client = reqwest::Client::new();

        let response = client.get(format!("{base}/api/chat")).send().await.unwrap();
        assert_eq!(response.status(), 405);
        let err: RelayErrorBody = response.json().await.unwrap();
        assert_eq!(err.error, "Method not allowed");

        let health: serde_json::Value = client
            .get(format!("{base}/health"))
            .send()
            .await
            .unwrap()
            .json()
            .await
            .unwrap();
        assert_eq!(health["status"], "ok");
    }

    #[tokio::test]
    async fn history_is_truncated_and_system_prompt_prepended() {
        let upstream = FakeUpstream::new(Reply::Fragments(vec!["ok"]));
        let base = spawn_relay(guest_config(), upstream.clone()).await;
        let history: Vec<_> = (0..15)
            .map(|i| serde_json::json!({"role": "user", "content": format!("m{i}")}))
            .collect();

        post_chat(&base, serde_json::json!({"message": "now", "history": history}))
            .send()
            .await
            .unwrap();
        let calls = upstream.calls();
        let messages = &calls[0].1.messages;
        assert_eq!(messages.len(), 12);
        assert_eq!(messages[0].content, crate::config::Config::default().upstream.system_prompt);
        assert_eq!(messages[1].content, "m5");
        assert_eq!(messages[11].content, "now");
    }

    #[tokio::test]
    async fn error_bubbles_in_history_are_not_forwarded() {
        let upstream = FakeUpstream::new(Reply::Fragments(vec!["ok"]));
        let base = spawn_relay(guest_config(), upstream.clone()).await;
        let history = serde_json::json!([
            {"role": "user", "content": "hi"},
            {"role": "error", "content": "Request timeout - please try again"},
        ]);

        let response = post_chat(&base, serde_json::json!({"message": "hi", "history": history}))
            .send()
            .await
            .unwrap();
        assert_eq!(response.status(), 200);
        let calls = upstream.calls();
        let contents: Vec<_> = calls[0].1.messages.iter().map(|m| m.content.as_str()).collect();
        assert_eq!(contents.len(), 3);
        assert_eq!(&contents[1..], ["hi", "hi"]);
    }

    #[tokio::test]
    async fn user_key_override_wins_and_base_url_defaults() {
        let upstream = FakeUpstream::new(Reply::Fragments(vec!["ok"]));
        let mut config = guest_config();
        config.access.allow_guest_mode = false;
        config.upstream.api_key.clear();
        let base = spawn_relay(config, upstream.clone()).await;

        let response = post_chat(
            &base,
            serde_json::json!({"message": "hi", "userApiKey": "sk-user-override"}),
        )
        .send()
        .await
        .unwrap();
        assert_eq!(response.status(), 200);
        let calls = upstream.calls();
        assert_eq!(calls[0].0.source, CredentialSource::UserSupplied);
        assert_eq!(calls[0].0.api_key, "sk-user-override");
        assert_eq!(calls[0].0.base_url, "https://upstream.example/v1");
    }

    #[tokio::test]
    async fn missing_credentials_are_401() {
        let upstream = FakeUpstream::new(Reply::Fragments(vec!["ok"]));
        let mut config = guest_config();
        config.upstream.api_key.clear();
        let base = spawn_relay(config, upstream.clone()).await;

        let response = post_chat(&base, serde_json::json!({"message": "hi"}))
            .send()
            .await
            .unwrap();
        assert_eq!(response.status(), 401);
        let err: RelayErrorBody = response.json().await.unwrap();
        assert_eq!(err.error, "Invalid or missing API key");
        assert!(upstream.calls().is_empty());
    }

    #[tokio::test]
    async fn upstream_rate_limit_passes_retry_after_in_stream_mode() {
        let upstream = FakeUpstream::new(Reply::FailWith(|| {
            ApiError::status(429, "slow down".into(), Some(9))
        }));
        let base = spawn_relay(guest_config(), upstream).await;

        let response = post_chat(&base, serde_json::json!({"message": "hi"}))
            .header("x-stream", "true")
            .send()
            .await
            .unwrap();
        assert_eq!(response.status(), 429);
        assert_eq!(response.headers()["retry-after"], "9");
        let err: RelayErrorBody = response.json().await.unwrap();
        assert_eq!(err.error, crate::error::RATE_LIMIT_TEXT);
    }
}
