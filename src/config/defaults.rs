//! Default configuration constants.

/// Default OpenAI-compatible API base URL.
pub(super) const DEFAULT_API_BASE_URL: &str = "https://api.openai.com/v1";
/// Default provider model ID.
pub(super) const DEFAULT_MODEL_ID: &str = "gpt-4o-mini";
/// Default timeout for upstream chat-completion requests.
pub(super) const DEFAULT_API_TIMEOUT_SECS: u64 = 30;
/// Default sampling temperature sent upstream.
pub(super) const DEFAULT_TEMPERATURE: f64 = 0.7;
/// Default completion token cap sent upstream.
pub(super) const DEFAULT_MAX_TOKENS: u32 = 1000;
/// System prompt prepended to every upstream request.
pub(super) const DEFAULT_SYSTEM_PROMPT: &str =
    "You are a helpful AI assistant. Provide clear, concise, and accurate responses.";
/// Number of guest-mode sends allowed without a user key.
pub(super) const DEFAULT_GUEST_MODE_LIMIT: u32 = 10;
/// Relay listen address.
pub(super) const DEFAULT_BIND_ADDR: &str = "127.0.0.1:3000";
/// Relay endpoint the chat client talks to.
pub(super) const DEFAULT_RELAY_URL: &str = "http://127.0.0.1:3000/api/chat";
