//! CLI entry point for chatrelay.

mod cli;

use chatrelay::api::ApiClient;
use chatrelay::config::{load_config, Config};
use chatrelay::credentials::{CredentialManager, FileStore};
use chatrelay::relay::{self, AppState};
use chatrelay::repl::{self, Renderer};
use chatrelay::session::{ChatSession, HttpRelayTransport};
use clap::Parser;
use cli::{Command, KeyCommand, UsageCommand};
use std::sync::Arc;
use tokio::net::TcpListener;
use tracing_subscriber::EnvFilter;

#[tokio::main]
async fn main() {
    let args = cli::Args::parse();
    let command = args.command.clone().unwrap_or(Command::Chat {
        relay_url: None,
        no_stream: false,
    });
    init_tracing(&command);

    // Load config.
    let loaded = match load_config(args.config.as_deref()) {
        Ok(loaded) => loaded,
        Err(e) => {
            eprintln!("error: {e}");
            std::process::exit(1);
        }
    };
    let mut config = loaded.config;
    tracing::debug!(source = %loaded.source, "config loaded");

    // Apply CLI overrides.
    if let Some(model) = &args.model {
        config.upstream.model = model.clone();
    }
    if let Some(url) = &args.base_url {
        config.upstream.base_url = url.trim_end_matches('/').to_string();
    }

    let renderer = Renderer::new(!args.no_color);
    let result = match command {
        Command::Serve { bind } => run_serve(config, bind).await,
        Command::Chat {
            relay_url,
            no_stream,
        } => run_chat(config, renderer, relay_url, no_stream).await,
        Command::Key { action } => run_key(&config, renderer, action),
        Command::Usage { action } => run_usage(&config, renderer, action),
    };
    if let Err(msg) = result {
        renderer.error(&msg);
        std::process::exit(1);
    }
}

/// `RUST_LOG` wins; otherwise the server logs at info and the client stays quiet.
fn init_tracing(command: &Command) {
    let default_directive = match command {
        Command::Serve { .. } => "chatrelay=info",
        _ => "chatrelay=warn",
    };
    let filter =
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(default_directive));
    let _ = tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(std::io::stderr)
        .try_init();
}

async fn run_serve(mut config: Config, bind: Option<String>) -> Result<(), String> {
    if let Some(bind) = bind {
        config.server.bind = bind;
    }
    if config.upstream.api_key.trim().is_empty() && !config.access.require_user_api_key {
        tracing::warn!("no upstream api key configured; guest turns will be refused");
    }
    let listener = TcpListener::bind(&config.server.bind)
        .await
        .map_err(|e| format!("failed to bind {}: {e}", config.server.bind))?;
    let client = Arc::new(ApiClient::new(config.upstream.timeout()));
    let state = Arc::new(AppState::new(&config, client));
    relay::serve(listener, state, shutdown_signal())
        .await
        .map_err(|e| format!("relay server failed: {e}"))
}

async fn shutdown_signal() {
    if let Err(e) = tokio::signal::ctrl_c().await {
        tracing::error!(error = %e, "failed to listen for ctrl-c");
        std::future::pending::<()>().await;
    }
    tracing::info!("shutting down");
}

async fn run_chat(
    config: Config,
    renderer: Renderer,
    relay_url: Option<String>,
    no_stream: bool,
) -> Result<(), String> {
    let relay_url = relay_url.unwrap_or_else(|| config.client.relay_url.clone());
    let credentials = open_credentials(&config)?;
    let transport = HttpRelayTransport::new(relay_url.clone());
    let stream = config.client.stream && !no_stream;
    let mut session = ChatSession::new(transport, credentials, stream);
    repl::run_chat(&mut session, renderer, &relay_url)
        .await
        .map_err(|e| format!("terminal i/o failed: {e}"))
}

fn run_key(config: &Config, renderer: Renderer, action: KeyCommand) -> Result<(), String> {
    let mut credentials = open_credentials(config)?;
    match action {
        KeyCommand::Set => {
            let key = rpassword::prompt_password("API key: ")
                .map_err(|e| format!("failed to read key: {e}"))?;
            let record = credentials
                .set_user_api_key(&key, None)
                .map_err(|e| e.to_string())?;
            renderer.info(&format!(
                "Saved API key {} for {}.",
                chatrelay::credentials::key_fingerprint(&record.api_key),
                record.base_url
            ));
        }
        KeyCommand::Clear => {
            credentials
                .clear_user_api_key()
                .map_err(|e| e.to_string())?;
            renderer.info("Removed stored API key.");
        }
        KeyCommand::Status => {
            repl::show_credential_status(renderer, &mut credentials).map_err(|e| e.to_string())?;
        }
    }
    Ok(())
}

fn run_usage(
    config: &Config,
    renderer: Renderer,
    action: Option<UsageCommand>,
) -> Result<(), String> {
    let mut credentials = open_credentials(config)?;
    match action {
        Some(UsageCommand::Reset) => {
            credentials.reset_usage().map_err(|e| e.to_string())?;
            renderer.info("Guest usage reset.");
        }
        None => repl::show_usage(renderer, &credentials).map_err(|e| e.to_string())?,
    }
    Ok(())
}

fn open_credentials(config: &Config) -> Result<CredentialManager<FileStore>, String> {
    let store = FileStore::open_default(config.client.state_dir.as_deref())
        .map_err(|e| format!("failed to open client state: {e}"))?;
    tracing::debug!(path = %store.path().display(), "client state store");
    Ok(CredentialManager::new(
        config.access.clone(),
        config.upstream.base_url.clone(),
        store,
    ))
}
