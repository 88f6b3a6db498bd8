//! CLI argument parsing via clap.

use chatrelay::build_info::LONG_VERSION;
use clap::{Parser, Subcommand};

/// Streaming chat relay for OpenAI-compatible APIs, plus a terminal client.
#[derive(Debug, Parser)]
#[command(name = "chatrelay", version = LONG_VERSION)]
pub struct Args {
    /// Path to config file (default: ./chatrelay.toml or ~/.config/chatrelay/chatrelay.toml).
    #[arg(short = 'c', long = "config", global = true)]
    pub config: Option<String>,

    /// Override the upstream model name.
    #[arg(short = 'm', long = "model", global = true)]
    pub model: Option<String>,

    /// Override the upstream API base URL.
    #[arg(long = "base-url", global = true)]
    pub base_url: Option<String>,

    /// Disable color output.
    #[arg(long = "no-color", global = true)]
    pub no_color: bool,

    /// What to run. Defaults to `chat`.
    #[command(subcommand)]
    pub command: Option<Command>,
}

#[derive(Debug, Clone, PartialEq, Eq, Subcommand)]
pub enum Command {
    /// Run the relay HTTP server.
    Serve {
        /// Listen address, e.g. 127.0.0.1:8787.
        #[arg(long = "bind")]
        bind: Option<String>,
    },
    /// Chat with a relay from the terminal.
    Chat {
        /// Relay chat endpoint URL.
        #[arg(long = "relay-url")]
        relay_url: Option<String>,
        /// Ask for buffered replies instead of a stream.
        #[arg(long = "no-stream")]
        no_stream: bool,
    },
    /// Manage the stored user API key.
    Key {
        #[command(subcommand)]
        action: KeyCommand,
    },
    /// Show or reset guest usage.
    Usage {
        #[command(subcommand)]
        action: Option<UsageCommand>,
    },
}

#[derive(Debug, Clone, PartialEq, Eq, Subcommand)]
pub enum KeyCommand {
    /// Prompt for a key (input hidden) and store it with the upstream
    /// base URL (`--base-url` to pick another).
    Set,
    /// Remove the stored key.
    Clear,
    /// Show the stored key (masked) and guest quota.
    Status,
}

#[derive(Debug, Clone, PartialEq, Eq, Subcommand)]
pub enum UsageCommand {
    /// Zero the guest usage counter.
    Reset,
}
