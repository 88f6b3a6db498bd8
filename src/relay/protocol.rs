//! Relay wire contract shared by the server handler and the chat client.
//!
//! Streaming bodies are `data: <json>\n\n` frames:
//!
//! ```text
//! data: {"content":"Hel"}
//!
//! data: {"content":"lo"}
//!
//! data: [DONE]
//! ```
//!
//! A failure after the 200 has been committed is reported as a single
//! `data: {"error":"..."}` frame and the body closes without `[DONE]`.

use serde::{Deserialize, Deserializer, Serialize};

use crate::api::sse::{SseDecoder, SseEvent};
use crate::types::{ChatMessage, Role, Usage};

/// Header that opts into a streamed response.
pub const STREAM_HEADER: &str = "x-stream";
/// `Accept` value fragment that opts into a streamed response.
pub const STREAM_ACCEPT: &str = "text/stream";

/// `POST /api/chat` body.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RelayRequest {
    pub message: String,
    #[serde(default, deserialize_with = "conversational_history")]
    pub history: Vec<ChatMessage>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub user_api_key: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub user_base_url: Option<String>,
}

/// Entries with a role the upstream does not take (a client's `error`
/// bubbles, say) are dropped rather than failing the whole body.
fn conversational_history<'de, D>(deserializer: D) -> Result<Vec<ChatMessage>, D::Error>
where
    D: Deserializer<'de>,
{
    #[derive(Deserialize)]
    struct Entry {
        role: String,
        content: String,
    }

    let entries = Vec::<Entry>::deserialize(deserializer)?;
    Ok(entries
        .into_iter()
        .filter_map(|entry| {
            let role = match entry.role.as_str() {
                "system" => Role::System,
                "user" => Role::User,
                "assistant" => Role::Assistant,
                _ => return None,
            };
            Some(ChatMessage {
                role,
                content: entry.content,
            })
        })
        .collect())
}

/// Buffered `200` body.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RelayReply {
    pub response: String,
    #[serde(default)]
    pub usage: Option<Usage>,
    #[serde(default)]
    pub model: String,
}

/// Body of every non-2xx relay response.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RelayErrorBody {
    pub error: String,
}

/// One frame of a streamed relay body.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RelayFrame {
    Content(String),
    Error(String),
    Done,
}

#[derive(Debug, Serialize, Deserialize)]
struct FramePayload {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    content: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    error: Option<String>,
}

impl RelayFrame {
    /// Wire text for this frame, separator included.
    pub fn encode(&self) -> String {
        let payload = match self {
            Self::Done => return "data: [DONE]\n\n".to_string(),
            Self::Content(text) => FramePayload {
                content: Some(text.clone()),
                error: None,
            },
            Self::Error(message) => FramePayload {
                content: None,
                error: Some(message.clone()),
            },
        };
        // Serializing two optional strings cannot fail.
        let json = serde_json::to_string(&payload).unwrap_or_default();
        format!("data: {json}\n\n")
    }

    /// Interpret one decoded event. Payloads that are not valid frames are
    /// counted as malformed on `decoder` and skipped.
    pub fn from_event(event: SseEvent, decoder: &mut SseDecoder) -> Option<Self> {
        let payload = match event {
            SseEvent::Done => return Some(Self::Done),
            SseEvent::Data(payload) => payload,
        };
        let frame = decoder.decode_json::<FramePayload>(&payload)?;
        if let Some(message) = frame.error {
            return Some(Self::Error(message));
        }
        frame.content.map(Self::Content)
    }
}
