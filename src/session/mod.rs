//! Client-side conversation state machine.
//!
//! ```text
//! Idle -> Sending -> Streaming --------> Idle
//!                 \-> AwaitingResponse -/
//!  (any non-idle) -> Error -> Idle   (after the error message is appended)
//! ```
//!
//! One turn is in flight at most. A turn is opened synchronously with
//! [`ChatSession::begin_send`] (or [`ChatSession::begin_retry`]), which hands
//! back a [`TurnTicket`]; [`ChatSession::run_turn`] then drives the relay
//! call. The ticket's cancellation token can be fired from elsewhere (the
//! terminal's Ctrl-C handler) while `run_turn` is pending.

use rand::rngs::OsRng;
use rand::RngCore;
use std::time::SystemTime;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;

use crate::credentials::{CredentialManager, CredentialSource, KeyValueStore, Resolution};
use crate::error::ChatError;
use crate::relay::protocol::{RelayFrame, RelayRequest};
use crate::types::{context_window, ChatMessage, MAX_MESSAGE_CHARS};

mod transport;

pub use transport::{HttpRelayTransport, RelayResponse, RelayStream, RelayTransport};

// ---- Messages ----

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MessageRole {
    User,
    Assistant,
    System,
    /// Locally generated failure notice; never sent upstream.
    Error,
}

/// One conversation entry. Immutable once appended.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Message {
    pub id: String,
    pub content: String,
    pub role: MessageRole,
    pub created_at: SystemTime,
}

impl Message {
    fn new(role: MessageRole, content: impl Into<String>) -> Self {
        Self {
            id: generate_message_id(),
            content: content.into(),
            role,
            created_at: SystemTime::now(),
        }
    }

    /// Wire form for the relay history, or `None` for error notices.
    fn to_history(&self) -> Option<ChatMessage> {
        match self.role {
            MessageRole::User => Some(ChatMessage::user(self.content.clone())),
            MessageRole::Assistant => Some(ChatMessage::assistant(self.content.clone())),
            MessageRole::System => Some(ChatMessage::system(self.content.clone())),
            MessageRole::Error => None,
        }
    }
}

/// Opaque 128-bit hex id.
fn generate_message_id() -> String {
    let mut bytes = [0u8; 16];
    OsRng.fill_bytes(&mut bytes);
    bytes.iter().map(|b| format!("{b:02x}")).collect()
}

// ---- State ----

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SessionState {
    Idle,
    Sending,
    Streaming,
    AwaitingResponse,
    Error,
}

impl SessionState {
    pub fn is_busy(self) -> bool {
        matches!(self, Self::Sending | Self::Streaming | Self::AwaitingResponse)
    }
}

/// Change notifications for live rendering.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SessionEvent {
    StateChanged(SessionState),
    /// A streamed delta was applied to the buffer.
    Fragment(String),
    MessageAppended(Message),
}

/// Identifies one turn; events for any other turn are discarded.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct TurnId(u64);

/// Input to the in-flight turn.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TurnEvent {
    Fragment(String),
    /// Terminal success. `Some` carries a buffered reply; `None` commits the
    /// streaming buffer.
    Completed(Option<String>),
    Failed(ChatError),
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TurnOutcome {
    Completed,
    Failed(ChatError),
    Cancelled,
}

/// Why a send did not open a turn.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SendRejected {
    /// A turn is already in flight.
    Busy,
    /// Empty or over-length text. Nothing is appended.
    InvalidInput,
    /// `/retry` with no user message in the conversation.
    NothingToRetry,
    /// No usable credential. An error message was appended.
    NoCredential(ChatError),
}

/// An opened turn, ready for [`ChatSession::run_turn`].
#[derive(Debug)]
pub struct TurnTicket {
    turn: TurnId,
    token: CancellationToken,
    source: CredentialSource,
    request: RelayRequest,
}

impl TurnTicket {
    pub fn id(&self) -> TurnId {
        self.turn
    }

    /// Which credential this turn goes out under.
    pub fn source(&self) -> CredentialSource {
        self.source
    }

    /// Fires cancellation of this turn when cancelled.
    pub fn cancellation_token(&self) -> CancellationToken {
        self.token.clone()
    }
}

#[derive(Debug)]
struct InFlight {
    turn: TurnId,
    token: CancellationToken,
    source: CredentialSource,
}

// ---- Session ----

/// Conversation plus the lifecycle of its single in-flight turn.
pub struct ChatSession<T: RelayTransport, S: KeyValueStore> {
    transport: T,
    credentials: CredentialManager<S>,
    stream: bool,
    messages: Vec<Message>,
    state: SessionState,
    streaming_buffer: String,
    last_error: Option<ChatError>,
    in_flight: Option<InFlight>,
    next_turn: u64,
    events: Option<mpsc::UnboundedSender<SessionEvent>>,
}

impl<T: RelayTransport, S: KeyValueStore> ChatSession<T, S> {
    pub fn new(transport: T, credentials: CredentialManager<S>, stream: bool) -> Self {
        Self {
            transport,
            credentials,
            stream,
            messages: Vec::new(),
            state: SessionState::Idle,
            streaming_buffer: String::new(),
            last_error: None,
            in_flight: None,
            next_turn: 0,
            events: None,
        }
    }

    /// Route change notifications to `sink`.
    pub fn set_event_sink(&mut self, sink: mpsc::UnboundedSender<SessionEvent>) {
        self.events = Some(sink);
    }

    pub fn messages(&self) -> &[Message] {
        &self.messages
    }

    pub fn state(&self) -> SessionState {
        self.state
    }

    pub fn is_loading(&self) -> bool {
        self.state.is_busy()
    }

    /// Live text of the in-flight streamed reply.
    pub fn streaming_content(&self) -> &str {
        &self.streaming_buffer
    }

    pub fn last_error(&self) -> Option<&ChatError> {
        self.last_error.as_ref()
    }

    pub fn clear_error(&mut self) {
        self.last_error = None;
    }

    pub fn credentials(&mut self) -> &mut CredentialManager<S> {
        &mut self.credentials
    }

    /// True iff credential resolution would currently succeed.
    pub fn can_send_message(&mut self) -> bool {
        self.credentials.can_send()
    }

    pub fn remaining_guest_messages(&self) -> u32 {
        self.credentials.remaining_guest_messages().unwrap_or(0)
    }

    /// Drop the conversation and any in-flight turn.
    pub fn clear_messages(&mut self) {
        self.abandon_in_flight();
        self.messages.clear();
        self.last_error = None;
        self.set_state(SessionState::Idle);
    }

    /// Send `text` and drive the turn to its end.
    pub async fn send_message(&mut self, text: &str) -> Result<TurnOutcome, SendRejected> {
        let ticket = self.begin_send(text)?;
        Ok(self.run_turn(ticket).await)
    }

    /// Re-send the last user message and drive the turn to its end.
    pub async fn retry_last_message(&mut self) -> Result<TurnOutcome, SendRejected> {
        let ticket = self.begin_retry()?;
        Ok(self.run_turn(ticket).await)
    }

    /// Validate, resolve a credential, append the user message, and open a
    /// turn.
    pub fn begin_send(&mut self, text: &str) -> Result<TurnTicket, SendRejected> {
        if self.state.is_busy() {
            return Err(SendRejected::Busy);
        }
        if text.trim().is_empty() || text.chars().count() > MAX_MESSAGE_CHARS {
            return Err(SendRejected::InvalidInput);
        }
        let resolution = self.resolve_or_report()?;
        let history = self.history_window(self.messages.len());
        self.append(Message::new(MessageRole::User, text));
        Ok(self.open_turn(text.to_string(), history, resolution))
    }

    /// Drop everything after the last user message and open a turn for it
    /// again, without appending a second copy.
    pub fn begin_retry(&mut self) -> Result<TurnTicket, SendRejected> {
        if self.state.is_busy() {
            return Err(SendRejected::Busy);
        }
        let last_user = self
            .messages
            .iter()
            .rposition(|message| message.role == MessageRole::User)
            .ok_or(SendRejected::NothingToRetry)?;
        self.messages.truncate(last_user + 1);
        let resolution = self.resolve_or_report()?;
        let text = self.messages[last_user].content.clone();
        let history = self.history_window(last_user);
        Ok(self.open_turn(text, history, resolution))
    }

    /// Drive an opened turn through the relay until it completes, fails, or
    /// its token is cancelled.
    pub async fn run_turn(&mut self, ticket: TurnTicket) -> TurnOutcome {
        let TurnTicket {
            turn,
            token,
            request,
            ..
        } = ticket;
        if !self.is_current(turn) {
            return TurnOutcome::Cancelled;
        }
        let stream = self.stream;
        if !stream {
            self.set_state(SessionState::AwaitingResponse);
        }

        let opened = tokio::select! {
            biased;
            _ = token.cancelled() => None,
            opened = self.transport.open(&request, stream) => Some(opened),
        };
        let Some(opened) = opened else {
            return self.finish_cancelled(turn);
        };

        let mut frames = match opened {
            Err(err) => return self.finish(turn, TurnEvent::Failed(err)),
            Ok(RelayResponse::Buffered(reply)) => {
                return self.finish(turn, TurnEvent::Completed(Some(reply.response)));
            }
            Ok(RelayResponse::Stream(frames)) => frames,
        };
        self.set_state(SessionState::Streaming);

        loop {
            let next = tokio::select! {
                biased;
                _ = token.cancelled() => None,
                frame = frames.next_frame() => Some(frame),
            };
            let event = match next {
                None => return self.finish_cancelled(turn),
                Some(Some(Ok(RelayFrame::Content(delta)))) => {
                    self.handle_event(turn, TurnEvent::Fragment(delta));
                    continue;
                }
                Some(Some(Ok(RelayFrame::Done))) => TurnEvent::Completed(None),
                Some(Some(Ok(RelayFrame::Error(detail)))) => {
                    TurnEvent::Failed(ChatError::from_relay_frame(detail))
                }
                Some(Some(Err(err))) => TurnEvent::Failed(err),
                Some(None) => TurnEvent::Failed(ChatError::Network(
                    "relay stream closed before completion".to_string(),
                )),
            };
            if frames.malformed_frames() > 0 {
                tracing::warn!(
                    skipped = frames.malformed_frames(),
                    "relay stream contained malformed frames"
                );
            }
            return self.finish(turn, event);
        }
    }

    /// Apply one event to the in-flight turn. Returns `false` (and changes
    /// nothing) when `turn` is not the current turn.
    pub fn handle_event(&mut self, turn: TurnId, event: TurnEvent) -> bool {
        if !self.is_current(turn) {
            tracing::debug!(?turn, "discarding event for stale turn");
            return false;
        }
        match event {
            TurnEvent::Fragment(delta) => {
                if self.state != SessionState::Streaming {
                    self.set_state(SessionState::Streaming);
                }
                self.streaming_buffer.push_str(&delta);
                self.emit(SessionEvent::Fragment(delta));
            }
            TurnEvent::Completed(reply) => {
                let content = match reply {
                    Some(content) => content,
                    None => std::mem::take(&mut self.streaming_buffer),
                };
                self.streaming_buffer.clear();
                let source = self.in_flight.take().map(|flight| flight.source);
                self.append(Message::new(MessageRole::Assistant, content));
                if source == Some(CredentialSource::GuestQuota) {
                    match self.credentials.increment_usage() {
                        Ok(count) => tracing::debug!(count, "guest usage recorded"),
                        Err(err) => tracing::warn!(error = %err, "failed to record guest usage"),
                    }
                }
                self.set_state(SessionState::Idle);
            }
            TurnEvent::Failed(err) => {
                self.streaming_buffer.clear();
                if let Some(flight) = self.in_flight.take() {
                    flight.token.cancel();
                }
                self.report_error(err);
            }
        }
        true
    }

    /// Cancel the in-flight turn, if any. Nothing is appended.
    pub fn cancel(&mut self) -> bool {
        if self.in_flight.is_none() {
            return false;
        }
        self.abandon_in_flight();
        self.set_state(SessionState::Idle);
        true
    }

    // ---- internals ----

    fn resolve_or_report(&mut self) -> Result<Resolution, SendRejected> {
        match self.credentials.resolve() {
            Ok(resolution) => Ok(resolution),
            Err(err) => {
                tracing::info!(error = %err, "send blocked: no usable credential");
                let err = ChatError::from(err);
                self.report_error(err.clone());
                Err(SendRejected::NoCredential(err))
            }
        }
    }

    fn open_turn(
        &mut self,
        message: String,
        history: Vec<ChatMessage>,
        resolution: Resolution,
    ) -> TurnTicket {
        self.last_error = None;
        self.streaming_buffer.clear();
        self.next_turn += 1;
        let turn = TurnId(self.next_turn);
        let token = CancellationToken::new();
        let source = resolution.source();
        let (user_api_key, user_base_url) = match resolution {
            Resolution::User(record) => (Some(record.api_key), Some(record.base_url)),
            Resolution::Guest => (None, None),
        };
        self.in_flight = Some(InFlight {
            turn,
            token: token.clone(),
            source,
        });
        self.set_state(SessionState::Sending);
        tracing::debug!(?turn, %source, history = history.len(), "opening turn");
        TurnTicket {
            turn,
            token,
            source,
            request: RelayRequest {
                message,
                history,
                user_api_key,
                user_base_url,
            },
        }
    }

    /// Non-error messages before index `end`, trailing window only.
    fn history_window(&self, end: usize) -> Vec<ChatMessage> {
        let prior: Vec<ChatMessage> = self.messages[..end]
            .iter()
            .filter_map(Message::to_history)
            .collect();
        context_window(&prior).to_vec()
    }

    fn finish(&mut self, turn: TurnId, event: TurnEvent) -> TurnOutcome {
        let outcome = match &event {
            TurnEvent::Failed(err) => TurnOutcome::Failed(err.clone()),
            _ => TurnOutcome::Completed,
        };
        if self.handle_event(turn, event) {
            outcome
        } else {
            TurnOutcome::Cancelled
        }
    }

    fn finish_cancelled(&mut self, turn: TurnId) -> TurnOutcome {
        if self.is_current(turn) {
            self.cancel();
        }
        tracing::debug!(?turn, "turn cancelled");
        TurnOutcome::Cancelled
    }

    fn report_error(&mut self, err: ChatError) {
        tracing::warn!(error = %err, "chat turn failed");
        self.set_state(SessionState::Error);
        self.append(Message::new(MessageRole::Error, err.user_message()));
        self.last_error = Some(err);
        self.set_state(SessionState::Idle);
    }

    fn abandon_in_flight(&mut self) {
        if let Some(flight) = self.in_flight.take() {
            flight.token.cancel();
        }
        self.streaming_buffer.clear();
    }

    fn is_current(&self, turn: TurnId) -> bool {
        self.in_flight
            .as_ref()
            .is_some_and(|flight| flight.turn == turn)
    }

    fn append(&mut self, message: Message) {
        self.emit(SessionEvent::MessageAppended(message.clone()));
        self.messages.push(message);
    }

    fn set_state(&mut self, state: SessionState) {
        self.state = state;
        self.emit(SessionEvent::StateChanged(state));
    }

    fn emit(&self, event: SessionEvent) {
        if let Some(sink) = &self.events {
            let _ = sink.send(event);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::AccessConfig;
    use crate::credentials::MemoryStore;
    use crate::error::{
        UpstreamKind, NETWORK_ERROR_TEXT, NO_CREDENTIAL_TEXT, RATE_LIMIT_TEXT, TIMEOUT_TEXT,
    };
    use crate::relay::protocol::RelayReply;
    use async_trait::async_trait;
    use futures_util::{stream, StreamExt};
    use std::collections::VecDeque;
    use std::sync::Mutex;

    /// One scripted relay answer.
    enum Script {
        Reply(&'static str),
        Frames(Vec<&'static str>),
        /// Frames, then a body that never ends.
        FramesThenHang(Vec<&'static str>),
        Fail(ChatError),
    }

    struct ScriptedTransport {
        scripts: Mutex<VecDeque<Script>>,
        requests: Mutex<Vec<RelayRequest>>,
    }

    impl ScriptedTransport {
        fn new(scripts: Vec<Script>) -> Self {
            Self {
                scripts: Mutex::new(scripts.into()),
                requests: Mutex::new(Vec::new()),
            }
        }

        fn requests(&self) -> Vec<RelayRequest> {
            self.requests.lock().unwrap().clone()
        }
    }

    fn frame_bytes(frames: Vec<&'static str>) -> Vec<Result<Vec<u8>, ChatError>> {
        frames
            .into_iter()
            .map(|frame| Ok(format!("data: {frame}\n\n").into_bytes()))
            .collect()
    }

    #[async_trait]
    impl RelayTransport for ScriptedTransport {
        async fn open(
            &self,
            request: &RelayRequest,
            _stream: bool,
        ) -> Result<RelayResponse, ChatError> {
            self.requests.lock().unwrap().push(request.clone());
            let script = self
                .scripts
                .lock()
                .unwrap()
                .pop_front()
                .expect("unexpected relay call");
            match script {
                Script::Reply(text) => Ok(RelayResponse::Buffered(RelayReply {
                    response: text.to_string(),
                    usage: None,
                    model: "m".into(),
                })),
                Script::Frames(frames) => Ok(RelayResponse::Stream(RelayStream::from_chunks(
                    stream::iter(frame_bytes(frames)),
                ))),
                Script::FramesThenHang(frames) => Ok(RelayResponse::Stream(
                    RelayStream::from_chunks(
                        stream::iter(frame_bytes(frames)).chain(stream::pending()),
                    ),
                )),
                Script::Fail(err) => Err(err),
            }
        }
    }

    fn guest_access(limit: u32) -> AccessConfig {
        AccessConfig {
            require_user_api_key: false,
            allow_guest_mode: true,
            guest_mode_limit: limit,
        }
    }

    fn session(
        scripts: Vec<Script>,
        access: AccessConfig,
        stream: bool,
    ) -> ChatSession<ScriptedTransport, MemoryStore> {
        let creds = CredentialManager::new(access, "https://api.example.com/v1", MemoryStore::new());
        ChatSession::new(ScriptedTransport::new(scripts), creds, stream)
    }

    fn roles(session: &ChatSession<ScriptedTransport, MemoryStore>) -> Vec<MessageRole> {
        session.messages().iter().map(|m| m.role).collect()
    }

    #[tokio::test]
    async fn streamed_fragments_commit_as_one_assistant_message() {
        let mut s = session(
            vec![Script::Frames(vec![
                r#"{"content":"Hel"}"#,
                r#"{"content":"lo"}"#,
                "[DONE]",
            ])],
            guest_access(5),
            true,
        );
        let outcome = s.send_message("hi").await.unwrap();
        assert_eq!(outcome, TurnOutcome::Completed);
        assert_eq!(roles(&s), vec![MessageRole::User, MessageRole::Assistant]);
        assert_eq!(s.messages()[1].content, "Hello");
        assert_eq!(s.state(), SessionState::Idle);
        assert_eq!(s.streaming_content(), "");
        assert_eq!(s.credentials().usage_count().unwrap(), 1);
    }

    #[tokio::test]
    async fn buffered_reply_commits_and_counts_guest_usage() {
        let mut s = session(vec![Script::Reply("Hi there")], guest_access(5), false);
        s.send_message("hello").await.unwrap();
        assert_eq!(s.messages()[1].content, "Hi there");
        assert_eq!(s.remaining_guest_messages(), 4);
    }

    #[tokio::test]
    async fn guest_quota_of_two_blocks_third_send_before_network() {
        let mut s = session(
            vec![Script::Reply("one"), Script::Reply("two")],
            guest_access(2),
            false,
        );
        s.send_message("a").await.unwrap();
        s.send_message("b").await.unwrap();
        assert_eq!(s.credentials().usage_count().unwrap(), 2);

        let rejected = s.send_message("c").await.unwrap_err();
        assert!(matches!(rejected, SendRejected::NoCredential(ChatError::Config(_))));
        assert_eq!(s.transport.requests().len(), 2);
        let last = s.messages().last().unwrap();
        assert_eq!(last.role, MessageRole::Error);
        assert_eq!(last.content, NO_CREDENTIAL_TEXT);
        assert_eq!(s.state(), SessionState::Idle);
        assert!(s.requests_carry_no_user_key());
    }

    impl ChatSession<ScriptedTransport, MemoryStore> {
        fn requests_carry_no_user_key(&self) -> bool {
            self.transport
                .requests()
                .iter()
                .all(|r| r.user_api_key.is_none() && r.user_base_url.is_none())
        }
    }

    #[tokio::test]
    async fn user_key_turns_never_count_usage_and_carry_override() {
        let mut s = session(vec![Script::Reply("ok")], guest_access(1), false);
        s.credentials()
            .set_user_api_key("sk-user-abcdef123", Some("https://mine.example/v1"))
            .unwrap();
        s.send_message("hi").await.unwrap();
        assert_eq!(s.credentials().usage_count().unwrap(), 0);
        let request = &s.transport.requests()[0];
        assert_eq!(request.user_api_key.as_deref(), Some("sk-user-abcdef123"));
        assert_eq!(request.user_base_url.as_deref(), Some("https://mine.example/v1"));
    }

    #[tokio::test]
    async fn surrounding_whitespace_is_kept_in_transcript_and_request() {
        let mut s = session(vec![Script::Reply("ok")], guest_access(5), false);
        s.send_message("  indented\n").await.unwrap();
        assert_eq!(s.messages()[0].content, "  indented\n");
        assert_eq!(s.transport.requests()[0].message, "  indented\n");
    }

    #[tokio::test]
    async fn invalid_or_busy_sends_are_no_ops() {
        let mut s = session(vec![], guest_access(5), true);
        assert_eq!(s.begin_send("   ").unwrap_err(), SendRejected::InvalidInput);
        let long = "x".repeat(MAX_MESSAGE_CHARS + 1);
        assert_eq!(s.begin_send(&long).unwrap_err(), SendRejected::InvalidInput);
        assert!(s.messages().is_empty());

        let _ticket = s.begin_send("first").unwrap();
        assert_eq!(s.state(), SessionState::Sending);
        assert_eq!(s.begin_send("second").unwrap_err(), SendRejected::Busy);
        assert_eq!(s.begin_retry().unwrap_err(), SendRejected::Busy);
        assert_eq!(roles(&s), vec![MessageRole::User]);
    }

    #[tokio::test]
    async fn failure_appends_classified_error_and_returns_to_idle() {
        let err = ChatError::Upstream {
            kind: UpstreamKind::RateLimit,
            detail: "429".into(),
        };
        let mut s = session(vec![Script::Fail(err.clone())], guest_access(5), false);
        let outcome = s.send_message("hi").await.unwrap();
        assert_eq!(outcome, TurnOutcome::Failed(err.clone()));
        assert_eq!(s.messages()[1].content, RATE_LIMIT_TEXT);
        assert_eq!(s.last_error(), Some(&err));
        assert_eq!(s.state(), SessionState::Idle);
        assert_eq!(s.credentials().usage_count().unwrap(), 0);

        s.clear_error();
        assert!(s.last_error().is_none());
    }

    #[tokio::test]
    async fn error_frame_mid_stream_discards_partial_text() {
        let mut s = session(
            vec![Script::Frames(vec![
                r#"{"content":"par"}"#,
                r#"{"error":"Request timeout"}"#,
            ])],
            guest_access(5),
            true,
        );
        let outcome = s.send_message("hi").await.unwrap();
        assert!(matches!(
            outcome,
            TurnOutcome::Failed(ChatError::Upstream {
                kind: UpstreamKind::Timeout,
                ..
            })
        ));
        assert_eq!(roles(&s), vec![MessageRole::User, MessageRole::Error]);
        assert_eq!(s.messages()[1].content, TIMEOUT_TEXT);
        assert_eq!(s.streaming_content(), "");
    }

    #[tokio::test]
    async fn stream_closing_without_done_is_a_network_failure() {
        let mut s = session(
            vec![Script::Frames(vec![r#"{"content":"cut"}"#])],
            guest_access(5),
            true,
        );
        s.send_message("hi").await.unwrap();
        assert_eq!(s.messages()[1].content, NETWORK_ERROR_TEXT);
    }

    #[tokio::test]
    async fn cancellation_after_one_fragment_commits_nothing() {
        let mut s = session(
            vec![Script::FramesThenHang(vec![r#"{"content":"Hel"}"#])],
            guest_access(5),
            true,
        );
        let (tx, mut rx) = mpsc::unbounded_channel();
        s.set_event_sink(tx);

        let ticket = s.begin_send("hi").unwrap();
        let token = ticket.cancellation_token();
        tokio::spawn(async move {
            while let Some(event) = rx.recv().await {
                if matches!(event, SessionEvent::Fragment(_)) {
                    token.cancel();
                    break;
                }
            }
        });

        let outcome = s.run_turn(ticket).await;
        assert_eq!(outcome, TurnOutcome::Cancelled);
        assert_eq!(roles(&s), vec![MessageRole::User]);
        assert_eq!(s.state(), SessionState::Idle);
        assert_eq!(s.streaming_content(), "");
        assert!(s.last_error().is_none());
        assert_eq!(s.credentials().usage_count().unwrap(), 0);
    }

    #[tokio::test]
    async fn late_events_after_cancel_are_discarded() {
        let mut s = session(vec![], guest_access(5), true);
        let ticket = s.begin_send("hi").unwrap();
        let turn = ticket.id();
        assert_eq!(ticket.source(), CredentialSource::GuestQuota);
        assert!(s.handle_event(turn, TurnEvent::Fragment("He".into())));
        assert_eq!(s.streaming_content(), "He");

        assert!(s.cancel());
        assert!(!s.handle_event(turn, TurnEvent::Fragment("llo".into())));
        assert!(!s.handle_event(turn, TurnEvent::Completed(None)));
        assert_eq!(roles(&s), vec![MessageRole::User]);
        assert_eq!(s.streaming_content(), "");
        assert_eq!(s.run_turn(ticket).await, TurnOutcome::Cancelled);
        assert!(!s.cancel());
    }

    #[tokio::test]
    async fn retry_keeps_single_user_message_and_drops_errors() {
        let mut s = session(
            vec![
                Script::Reply("first answer"),
                Script::Fail(ChatError::Network("down".into())),
                Script::Reply("second answer"),
            ],
            guest_access(10),
            false,
        );
        s.send_message("one").await.unwrap();
        s.send_message("two").await.unwrap();
        assert_eq!(
            roles(&s),
            vec![
                MessageRole::User,
                MessageRole::Assistant,
                MessageRole::User,
                MessageRole::Error
            ]
        );

        let outcome = s.retry_last_message().await.unwrap();
        assert_eq!(outcome, TurnOutcome::Completed);
        let contents: Vec<&str> = s.messages().iter().map(|m| m.content.as_str()).collect();
        assert_eq!(contents, vec!["one", "first answer", "two", "second answer"]);

        let retry_request = &s.transport.requests()[2];
        assert_eq!(retry_request.message, "two");
        assert_eq!(
            retry_request.history,
            vec![ChatMessage::user("one"), ChatMessage::assistant("first answer")]
        );
    }

    #[tokio::test]
    async fn retry_without_user_message_is_rejected() {
        let mut s = session(vec![], guest_access(5), false);
        assert_eq!(s.begin_retry().unwrap_err(), SendRejected::NothingToRetry);
    }

    #[tokio::test]
    async fn history_skips_errors_and_keeps_last_ten() {
        let scripts = (0..12).map(|_| Script::Reply("r")).collect();
        let mut s = session(scripts, guest_access(100), false);
        for i in 0..12 {
            s.send_message(&format!("m{i}")).await.unwrap();
        }
        let last = s.transport.requests().pop().unwrap();
        assert_eq!(last.history.len(), 10);
        assert_eq!(last.history[0], ChatMessage::user("m6"));
        assert_eq!(last.message, "m11");
    }

    #[tokio::test]
    async fn clear_messages_resets_everything() {
        let mut s = session(vec![Script::Fail(ChatError::Network("x".into()))], guest_access(5), false);
        s.send_message("hi").await.unwrap();
        assert!(s.last_error().is_some());
        s.clear_messages();
        assert!(s.messages().is_empty());
        assert!(s.last_error().is_none());
        assert_eq!(s.state(), SessionState::Idle);
        assert!(!s.is_loading());
    }

    #[tokio::test]
    async fn state_walks_through_error_back_to_idle() {
        let mut s = session(
            vec![Script::Fail(ChatError::Network("down".into()))],
            guest_access(5),
            false,
        );
        let (tx, mut rx) = mpsc::unbounded_channel();
        s.set_event_sink(tx);
        s.send_message("hi").await.unwrap();

        let mut states = Vec::new();
        while let Ok(event) = rx.try_recv() {
            if let SessionEvent::StateChanged(state) = event {
                states.push(state);
            }
        }
        assert_eq!(
            states,
            vec![
                SessionState::Sending,
                SessionState::AwaitingResponse,
                SessionState::Error,
                SessionState::Idle
            ]
        );
    }

    #[test]
    fn message_ids_are_unique_hex() {
        let a = generate_message_id();
        let b = generate_message_id();
        assert_eq!(a.len(), 32);
        assert!(a.chars().all(|c| c.is_ascii_hexdigit()));
        assert_ne!(a, b);
    }

    #[test]
    fn can_send_tracks_credential_resolution() {
        let mut s = session(vec![], AccessConfig::default(), false);
        assert!(!s.can_send_message());
        let mut s = session(vec![], guest_access(1), false);
        assert!(s.can_send_message());
    }
}
