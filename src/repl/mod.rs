//! Line-oriented terminal chat over a [`ChatSession`].
//!
//! Streamed replies are printed as fragments arrive. Ctrl-C during a reply
//! cancels that turn; Ctrl-C or EOF at the prompt leaves the loop.

pub mod commands;
pub mod render;

use std::io;
use tokio::io::{AsyncBufReadExt, BufReader};
use tokio::sync::mpsc;

use crate::build_info;
use crate::credentials::{key_fingerprint, CredentialManager, CredentialSource, KeyValueStore};
use crate::error::{CredentialError, INVALID_INPUT_TEXT};
use crate::session::{
    ChatSession, MessageRole, RelayTransport, SendRejected, SessionEvent, TurnOutcome, TurnTicket,
};

use commands::{parse_slash_command, SlashCommandAction, SLASH_COMMANDS};
pub use render::Renderer;

const KEY_HINT: &str = "Use /key <api-key> [base-url] to chat with your own key.";

/// Run the interactive chat loop until `/quit`, EOF, or Ctrl-C at the prompt.
pub async fn run_chat<T, S>(
    session: &mut ChatSession<T, S>,
    renderer: Renderer,
    relay_url: &str,
) -> io::Result<()>
where
    T: RelayTransport,
    S: KeyValueStore,
{
    let (tx, mut events) = mpsc::unbounded_channel();
    session.set_event_sink(tx);

    renderer.info(&build_info::banner_line());
    renderer.field("relay", relay_url);
    if !session.credentials().has_user_api_key() {
        show_guest_remaining(session, renderer);
    }
    renderer.info("Type a message, /help for commands, Ctrl-C to stop a reply.");

    let mut lines = BufReader::new(tokio::io::stdin()).lines();
    loop {
        renderer.prompt();
        let line = tokio::select! {
            line = lines.next_line() => line?,
            _ = tokio::signal::ctrl_c() => None,
        };
        let Some(line) = line else {
            eprintln!();
            break;
        };
        let input = line.trim();
        if input.is_empty() {
            continue;
        }

        if let Some(action) = parse_slash_command(input) {
            if action == SlashCommandAction::Quit {
                break;
            }
            handle_command(session, &mut events, renderer, action).await;
            continue;
        }

        let opened = session.begin_send(&line);
        start_turn(session, &mut events, renderer, opened).await;
    }
    Ok(())
}

async fn handle_command<T, S>(
    session: &mut ChatSession<T, S>,
    events: &mut mpsc::UnboundedReceiver<SessionEvent>,
    renderer: Renderer,
    action: SlashCommandAction,
) where
    T: RelayTransport,
    S: KeyValueStore,
{
    match action {
        SlashCommandAction::Quit => {}
        SlashCommandAction::Help => {
            renderer.section("commands");
            for command in SLASH_COMMANDS {
                renderer.field(command.name, command.description);
            }
        }
        SlashCommandAction::Retry => {
            let opened = session.begin_retry();
            start_turn(session, events, renderer, opened).await;
        }
        SlashCommandAction::Clear => {
            session.clear_messages();
            drain_events(events);
            renderer.info("Conversation cleared.");
        }
        SlashCommandAction::KeyStatus => {
            if let Err(err) = show_credential_status(renderer, session.credentials()) {
                renderer.error(&err.to_string());
            }
        }
        SlashCommandAction::KeySet { key, base_url } => {
            match session
                .credentials()
                .set_user_api_key(&key, base_url.as_deref())
            {
                Ok(record) => renderer.info(&format!(
                    "Saved API key {} for {}.",
                    key_fingerprint(&record.api_key),
                    record.base_url
                )),
                Err(err) => renderer.error(&err.to_string()),
            }
        }
        SlashCommandAction::KeyClear => match session.credentials().clear_user_api_key() {
            Ok(()) => renderer.info("Removed stored API key."),
            Err(err) => renderer.error(&err.to_string()),
        },
        SlashCommandAction::Usage => {
            if let Err(err) = show_usage(renderer, session.credentials()) {
                renderer.error(&err.to_string());
            }
        }
        SlashCommandAction::UsageReset => match session.credentials().reset_usage() {
            Ok(()) => renderer.info("Guest usage reset."),
            Err(err) => renderer.error(&err.to_string()),
        },
        SlashCommandAction::Unknown(name) => {
            renderer.warn(&format!("unknown command {name}; try /help"));
        }
    }
}

/// Report a rejected send, or drive an opened turn to its end.
async fn start_turn<T, S>(
    session: &mut ChatSession<T, S>,
    events: &mut mpsc::UnboundedReceiver<SessionEvent>,
    renderer: Renderer,
    opened: Result<TurnTicket, SendRejected>,
) where
    T: RelayTransport,
    S: KeyValueStore,
{
    let ticket = match opened {
        Ok(ticket) => ticket,
        Err(rejected) => {
            let mut view = TurnView::default();
            while let Ok(event) = events.try_recv() {
                view.apply(event, renderer);
            }
            match rejected {
                SendRejected::Busy => renderer.warn("a reply is still in progress"),
                SendRejected::InvalidInput => renderer.warn(INVALID_INPUT_TEXT),
                SendRejected::NothingToRetry => renderer.warn("nothing to retry"),
                SendRejected::NoCredential(_) => renderer.info(KEY_HINT),
            }
            return;
        }
    };
    let source = ticket.source();
    let outcome = drive_turn(session, ticket, events, renderer).await;
    if outcome == TurnOutcome::Completed && source == CredentialSource::GuestQuota {
        show_guest_remaining(session, renderer);
    }
}

/// Run one turn, rendering events as they arrive. Ctrl-C cancels the turn.
async fn drive_turn<T, S>(
    session: &mut ChatSession<T, S>,
    ticket: TurnTicket,
    events: &mut mpsc::UnboundedReceiver<SessionEvent>,
    renderer: Renderer,
) -> TurnOutcome
where
    T: RelayTransport,
    S: KeyValueStore,
{
    let token = ticket.cancellation_token();
    let mut view = TurnView::default();
    let mut watch_ctrl_c = true;

    let outcome = {
        let run = session.run_turn(ticket);
        tokio::pin!(run);
        loop {
            tokio::select! {
                outcome = &mut run => break outcome,
                Some(event) = events.recv() => view.apply(event, renderer),
                signal = tokio::signal::ctrl_c(), if watch_ctrl_c && !token.is_cancelled() => {
                    match signal {
                        Ok(()) => token.cancel(),
                        Err(err) => {
                            tracing::warn!(error = %err, "ctrl-c handler unavailable");
                            watch_ctrl_c = false;
                        }
                    }
                }
            }
        }
    };

    while let Ok(event) = events.try_recv() {
        view.apply(event, renderer);
    }
    if outcome == TurnOutcome::Cancelled {
        view.close_line(renderer);
        renderer.info("(cancelled)");
    }
    outcome
}

fn drain_events(events: &mut mpsc::UnboundedReceiver<SessionEvent>) {
    while events.try_recv().is_ok() {}
}

/// Tracks what has been printed for the current turn.
#[derive(Debug, Default)]
struct TurnView {
    fragments: usize,
    line_open: bool,
}

impl TurnView {
    fn apply(&mut self, event: SessionEvent, renderer: Renderer) {
        match event {
            SessionEvent::Fragment(delta) => {
                if self.fragments == 0 {
                    renderer.assistant_header();
                }
                self.fragments += 1;
                self.line_open = true;
                renderer.fragment(&delta);
            }
            SessionEvent::MessageAppended(message) => match message.role {
                MessageRole::Assistant if self.fragments > 0 => self.close_line(renderer),
                MessageRole::Assistant => {
                    renderer.assistant_header();
                    renderer.reply(&message.content);
                }
                MessageRole::Error => {
                    self.close_line(renderer);
                    renderer.error(&message.content);
                }
                MessageRole::User | MessageRole::System => {}
            },
            SessionEvent::StateChanged(state) => {
                tracing::trace!(?state, "session state");
            }
        }
    }

    fn close_line(&mut self, renderer: Renderer) {
        if self.line_open {
            renderer.end_reply();
            self.line_open = false;
        }
    }
}

fn show_guest_remaining<T, S>(session: &ChatSession<T, S>, renderer: Renderer)
where
    T: RelayTransport,
    S: KeyValueStore,
{
    let remaining = session.remaining_guest_messages();
    renderer.info(&guest_remaining_line(remaining));
    if remaining == 0 {
        renderer.info(KEY_HINT);
    }
}

fn guest_remaining_line(remaining: u32) -> String {
    match remaining {
        1 => "1 free message remaining.".to_string(),
        n => format!("{n} free messages remaining."),
    }
}

/// Print the stored key (masked) and the guest quota.
pub fn show_credential_status<S: KeyValueStore>(
    renderer: Renderer,
    credentials: &mut CredentialManager<S>,
) -> Result<(), CredentialError> {
    let record = credentials.user_api_key()?;
    renderer.section("credentials");
    match record {
        Some(record) => {
            renderer.field("api key", &key_fingerprint(&record.api_key));
            renderer.field("base url", &record.base_url);
        }
        None => renderer.field("api key", "not set"),
    }
    let required = if credentials.policy().require_user_api_key {
        "yes"
    } else {
        "no"
    };
    renderer.field("key required", required);
    show_usage(renderer, credentials)
}

/// Print guest usage against the configured limit.
pub fn show_usage<S: KeyValueStore>(
    renderer: Renderer,
    credentials: &CredentialManager<S>,
) -> Result<(), CredentialError> {
    let policy = credentials.policy();
    if !policy.allow_guest_mode {
        renderer.field("guest mode", "disabled");
        return Ok(());
    }
    let used = credentials.usage_count()?;
    let remaining = credentials.remaining_guest_messages()?;
    renderer.field(
        "guest usage",
        &usage_summary(used, policy.guest_mode_limit, remaining),
    );
    Ok(())
}

fn usage_summary(used: u32, limit: u32, remaining: u32) -> String {
    format!("{used}/{limit} used, {remaining} remaining")
}
