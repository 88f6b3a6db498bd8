//! chatrelay: a streaming chat relay for OpenAI-compatible APIs.
//!
//! The server side ([`relay`]) accepts one chat turn over HTTP, picks a
//! credential (the caller's own key or the server's guest key), and forwards
//! the turn upstream, either buffered or as a stream of `data:` frames.
//! The client side ([`session`]) keeps the conversation, enforces the guest
//! quota, and drives turns against the relay; [`repl`] puts a terminal on it.
//!
//! # Quick start
//!
//! ```no_run
//! use chatrelay::config::load_config;
//! use chatrelay::credentials::{CredentialManager, MemoryStore};
//! use chatrelay::session::{ChatSession, HttpRelayTransport};
//!
//! # async fn example() {
//! let config = load_config(None).unwrap().config;
//! let credentials = CredentialManager::new(
//!     config.access.clone(),
//!     config.upstream.base_url.clone(),
//!     MemoryStore::new(),
//! );
//! let transport = HttpRelayTransport::new(config.client.relay_url.clone());
//! let mut session = ChatSession::new(transport, credentials, true);
//! session.send_message("Hello!").await.unwrap();
//! println!("{}", session.messages().last().unwrap().content);
//! # }
//! ```

pub mod api;
pub mod build_info;
pub mod config;
pub mod credentials;
pub mod error;
pub mod relay;
pub mod repl;
pub mod session;
#[cfg(test)]
pub mod testsupport;
pub mod types;
