//! Client side of the relay HTTP contract.

use async_trait::async_trait;
use futures_util::stream::BoxStream;
use futures_util::{Stream, StreamExt};
use std::collections::VecDeque;
use std::time::Duration;

use crate::api::sse::SseDecoder;
use crate::error::ChatError;
use crate::relay::protocol::{RelayErrorBody, RelayFrame, RelayReply, RelayRequest, STREAM_HEADER};

/// What the relay answered with on a 2xx.
#[derive(Debug)]
pub enum RelayResponse {
    Buffered(RelayReply),
    Stream(RelayStream),
}

/// Relay call used by the chat session.
///
/// Tests substitute scripted transports; the production path is
/// [`HttpRelayTransport`].
#[async_trait]
pub trait RelayTransport: Send + Sync {
    /// Send one turn. Non-2xx answers become classified [`ChatError`]s.
    async fn open(&self, request: &RelayRequest, stream: bool)
        -> Result<RelayResponse, ChatError>;
}

/// Frame-at-a-time reader over a streamed relay body.
pub struct RelayStream {
    chunks: BoxStream<'static, Result<Vec<u8>, ChatError>>,
    decoder: SseDecoder,
    pending: VecDeque<RelayFrame>,
    exhausted: bool,
}

impl std::fmt::Debug for RelayStream {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RelayStream")
            .field("pending", &self.pending.len())
            .field("exhausted", &self.exhausted)
            .finish()
    }
}

impl RelayStream {
    pub fn from_chunks<S>(chunks: S) -> Self
    where
        S: Stream<Item = Result<Vec<u8>, ChatError>> + Send + 'static,
    {
        Self {
            chunks: chunks.boxed(),
            decoder: SseDecoder::new(),
            pending: VecDeque::new(),
            exhausted: false,
        }
    }

    /// Next frame in arrival order; `None` once the body has closed.
    pub async fn next_frame(&mut self) -> Option<Result<RelayFrame, ChatError>> {
        loop {
            if let Some(frame) = self.pending.pop_front() {
                return Some(Ok(frame));
            }
            if self.exhausted {
                return None;
            }
            let events = match self.chunks.next().await {
                Some(Ok(bytes)) => self.decoder.push(&bytes),
                Some(Err(err)) => {
                    self.exhausted = true;
                    return Some(Err(err));
                }
                None => {
                    self.exhausted = true;
                    self.decoder.finish().into_iter().collect()
                }
            };
            for event in events {
                if let Some(frame) = RelayFrame::from_event(event, &mut self.decoder) {
                    self.pending.push_back(frame);
                }
            }
        }
    }

    pub fn malformed_frames(&self) -> u64 {
        self.decoder.malformed_frames()
    }
}

/// reqwest-backed [`RelayTransport`] posting to the relay's chat URL.
#[derive(Debug, Clone)]
pub struct HttpRelayTransport {
    http: reqwest::Client,
    url: String,
}

impl HttpRelayTransport {
    pub fn new(url: impl Into<String>) -> Self {
        let http = reqwest::Client::builder()
            .connect_timeout(Duration::from_secs(10))
            .build()
            .unwrap_or_else(|_| reqwest::Client::new());
        Self {
            http,
            url: url.into(),
        }
    }

    pub fn url(&self) -> &str {
        &self.url
    }
}

#[async_trait]
impl RelayTransport for HttpRelayTransport {
    async fn open(
        &self,
        request: &RelayRequest,
        stream: bool,
    ) -> Result<RelayResponse, ChatError> {
        let mut builder = self.http.post(&self.url).json(request);
        if stream {
            builder = builder.header(STREAM_HEADER, "true");
        }
        let response = builder
            .send()
            .await
            .map_err(|err| ChatError::Network(err.to_string()))?;

        let status = response.status();
        if !status.is_success() {
            let body = response.text().await.unwrap_or_default();
            let detail = serde_json::from_str::<RelayErrorBody>(&body)
                .map(|parsed| parsed.error)
                .unwrap_or(body);
            tracing::debug!(status = status.as_u16(), %detail, "relay rejected turn");
            return Err(ChatError::from_relay_status(status.as_u16(), detail));
        }

        if !stream {
            let body = response
                .text()
                .await
                .map_err(|err| ChatError::Network(err.to_string()))?;
            let reply = serde_json::from_str::<RelayReply>(&body)
                .map_err(|err| ChatError::Decode(format!("relay reply: {err}")))?;
            return Ok(RelayResponse::Buffered(reply));
        }

        let chunks = response.bytes_stream().map(|chunk| {
            chunk
                .map(|bytes| bytes.to_vec())
                .map_err(|err| ChatError::Network(err.to_string()))
        });
        Ok(RelayResponse::Stream(RelayStream::from_chunks(chunks)))
    }
}
