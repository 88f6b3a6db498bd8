//! Unified error types for the relay and the chat session.

use std::fmt;

// ---------------------------------------------------------------------------
// ConfigError
// ---------------------------------------------------------------------------

/// Errors when loading or parsing configuration.
#[derive(Debug)]
pub enum ConfigError {
    Io(std::io::Error),
    Toml(toml::de::Error),
    Invalid(String),
}

impl fmt::Display for ConfigError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Io(e) => write!(f, "io: {e}"),
            Self::Toml(e) => write!(f, "toml: {e}"),
            Self::Invalid(msg) => write!(f, "invalid config: {msg}"),
        }
    }
}

impl std::error::Error for ConfigError {}

impl From<std::io::Error> for ConfigError {
    fn from(e: std::io::Error) -> Self {
        Self::Io(e)
    }
}

impl From<toml::de::Error> for ConfigError {
    fn from(e: toml::de::Error) -> Self {
        Self::Toml(e)
    }
}

// ---------------------------------------------------------------------------
// ApiError
// ---------------------------------------------------------------------------

/// Errors from the upstream chat-completion client.
#[derive(Debug)]
pub enum ApiError {
    /// No usable key or base URL; raised before any network call.
    Config(String),
    /// The request exceeded the client timeout.
    Timeout,
    /// Network / reqwest-level error.
    Http(reqwest::Error),
    /// Non-2xx status from the provider.
    Status {
        code: u16,
        body: String,
        retry_after_secs: Option<u64>,
    },
    /// A 2xx body that could not be interpreted.
    InvalidResponse(String),
}

impl ApiError {
    pub fn status(code: u16, body: String, retry_after_secs: Option<u64>) -> Self {
        Self::Status {
            code,
            body,
            retry_after_secs,
        }
    }

    pub fn status_code(&self) -> Option<u16> {
        match self {
            Self::Status { code, .. } => Some(*code),
            _ => None,
        }
    }

    pub fn retry_after_secs(&self) -> Option<u64> {
        match self {
            Self::Status {
                retry_after_secs, ..
            } => *retry_after_secs,
            _ => None,
        }
    }

    pub fn is_timeout(&self) -> bool {
        matches!(self, Self::Timeout)
    }
}

impl fmt::Display for ApiError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Config(msg) => write!(f, "config: {msg}"),
            Self::Timeout => write!(f, "request timeout"),
            Self::Http(e) => write!(f, "http: {e}"),
            Self::Status { code, body, .. } => write!(f, "status {code}: {body}"),
            Self::InvalidResponse(msg) => write!(f, "invalid response: {msg}"),
        }
    }
}

impl std::error::Error for ApiError {}

impl From<reqwest::Error> for ApiError {
    fn from(e: reqwest::Error) -> Self {
        if e.is_timeout() {
            Self::Timeout
        } else {
            Self::Http(e)
        }
    }
}

// ---------------------------------------------------------------------------
// CredentialError
// ---------------------------------------------------------------------------

/// Outcomes of credential resolution and key validation that block a send.
#[derive(Debug)]
pub enum CredentialError {
    /// `require_user_api_key` is set and no user key is stored.
    UserKeyRequired,
    /// Guest mode applies but the server has no key configured for it.
    GuestKeyMissing,
    /// Neither a user key nor guest quota is available.
    NoCredential,
    /// A candidate key was rejected by the format check.
    InvalidFormat(String),
    /// Persisted client state could not be read or written.
    Store(crate::credentials::StoreError),
}

impl fmt::Display for CredentialError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::UserKeyRequired => write!(f, "User API key is required but not provided"),
            Self::GuestKeyMissing => write!(f, "Server API key not configured for guest mode"),
            Self::NoCredential => write!(f, "No valid API key available"),
            Self::InvalidFormat(msg) => write!(f, "{msg}"),
            Self::Store(e) => write!(f, "credential store: {e}"),
        }
    }
}

impl std::error::Error for CredentialError {}

impl From<crate::credentials::StoreError> for CredentialError {
    fn from(e: crate::credentials::StoreError) -> Self {
        Self::Store(e)
    }
}

// ---------------------------------------------------------------------------
// ChatError: client-side taxonomy
// ---------------------------------------------------------------------------

pub const API_ERROR_TEXT: &str = "Sorry, I encountered an error. Please try again.";
pub const NETWORK_ERROR_TEXT: &str = "Network error. Please check your connection.";
pub const RATE_LIMIT_TEXT: &str = "Rate limit exceeded. Please wait a moment.";
pub const INVALID_INPUT_TEXT: &str = "Please enter a valid message.";
pub const NO_CREDENTIAL_TEXT: &str =
    "Please configure your API key or check your remaining free messages.";
pub const AUTH_ERROR_TEXT: &str = "API key error. Please check your configuration.";
pub const TIMEOUT_TEXT: &str = "Request timeout - please try again";

/// Relay `error` text for credential failures.
pub const RELAY_AUTH_TEXT: &str = "Invalid or missing API key";
/// Relay `error` text for upstream timeouts.
pub const RELAY_TIMEOUT_TEXT: &str = "Request timeout";

/// Sub-classification of upstream failures surfaced by the relay.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum UpstreamKind {
    Auth,
    RateLimit,
    Timeout,
    Generic,
}

impl UpstreamKind {
    /// The `error` text the relay sends for this kind, in bodies and frames.
    pub fn relay_text(self) -> &'static str {
        match self {
            Self::Auth => RELAY_AUTH_TEXT,
            Self::RateLimit => RATE_LIMIT_TEXT,
            Self::Timeout => RELAY_TIMEOUT_TEXT,
            Self::Generic => API_ERROR_TEXT,
        }
    }

    /// Inverse of [`relay_text`](Self::relay_text). Unrecognized text is `Generic`.
    pub fn from_relay_text(text: &str) -> Self {
        let text = text.trim();
        [Self::Auth, Self::RateLimit, Self::Timeout]
            .into_iter()
            .find(|kind| kind.relay_text() == text)
            .unwrap_or(Self::Generic)
    }
}

/// Terminal failure of one chat turn as seen by the session.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ChatError {
    /// Empty or over-length message, rejected before the network.
    InvalidInput(String),
    /// No usable credential; the user has to configure a key.
    Config(String),
    /// Non-2xx from the relay or an error frame in its stream.
    Upstream { kind: UpstreamKind, detail: String },
    /// Transport failure talking to the relay.
    Network(String),
    /// The relay answered 2xx with a body that could not be decoded.
    Decode(String),
}

impl ChatError {
    /// Text shown to the user in the error message bubble.
    pub fn user_message(&self) -> &'static str {
        match self {
            Self::InvalidInput(_) => INVALID_INPUT_TEXT,
            Self::Config(_) => NO_CREDENTIAL_TEXT,
            Self::Upstream { kind, .. } => match kind {
                UpstreamKind::Auth => AUTH_ERROR_TEXT,
                UpstreamKind::RateLimit => RATE_LIMIT_TEXT,
                UpstreamKind::Timeout => TIMEOUT_TEXT,
                UpstreamKind::Generic => API_ERROR_TEXT,
            },
            Self::Network(_) => NETWORK_ERROR_TEXT,
            Self::Decode(_) => API_ERROR_TEXT,
        }
    }

    /// Classify a relay HTTP status into the upstream taxonomy.
    pub fn from_relay_status(status: u16, detail: String) -> Self {
        let kind = match status {
            400 => return Self::InvalidInput(detail),
            401 | 403 => UpstreamKind::Auth,
            408 | 504 => UpstreamKind::Timeout,
            429 => UpstreamKind::RateLimit,
            _ => UpstreamKind::Generic,
        };
        Self::Upstream { kind, detail }
    }

    /// Classify an `error` frame received mid-stream.
    pub fn from_relay_frame(detail: String) -> Self {
        Self::Upstream {
            kind: UpstreamKind::from_relay_text(&detail),
            detail,
        }
    }
}

impl fmt::Display for ChatError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::InvalidInput(msg) => write!(f, "invalid input: {msg}"),
            Self::Config(msg) => write!(f, "config: {msg}"),
            Self::Upstream { kind, detail } => write!(f, "upstream ({kind:?}): {detail}"),
            Self::Network(msg) => write!(f, "network: {msg}"),
            Self::Decode(msg) => write!(f, "decode: {msg}"),
        }
    }
}

impl std::error::Error for ChatError {}

impl From<CredentialError> for ChatError {
    fn from(e: CredentialError) -> Self {
        match e {
            CredentialError::InvalidFormat(msg) => Self::InvalidInput(msg),
            other => Self::Config(other.to_string()),
        }
    }
}
