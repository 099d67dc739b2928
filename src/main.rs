//! Ambientbot - Entry Point
//!
//! Runs the decision core against a JSON-lines adapter: one inbound
//! event per stdin line, one outcome per stdout line. Platform
//! transports talk to this process instead of linking the core.

use anyhow::{Context, Result};
use std::path::PathBuf;
use std::sync::Arc;
use tokio::io::{AsyncBufReadExt, BufReader};
use tokio::sync::mpsc;
use tracing::{error, info, warn};
use tracing_subscriber::EnvFilter;

use ambientbot::{
    Config, ConversationStore, HttpModelClient, InboundEvent, MemoryStore, Orchestrator, Outcome,
};

#[tokio::main]
async fn main() -> Result<()> {
    dotenvy::dotenv().ok();

    let args: Vec<String> = std::env::args().collect();
    if args.iter().any(|a| a == "--help" || a == "-h") {
        println!("ambientbot v{}", env!("CARGO_PKG_VERSION"));
        println!();
        println!("Usage: ambientbot [--config <path>]");
        println!();
        println!("Reads inbound chat events as JSON lines on stdin and writes");
        println!("outcomes as JSON lines on stdout.");
        println!();
        println!("Environment variables:");
        println!("  AMBIENTBOT_CONFIG    Config file path (default: ambientbot.toml)");
        println!("  AMBIENTBOT_API_KEY   Overrides dialogue.api_key");
        println!("  AMBIENTBOT_BASE_URL  Overrides dialogue.base_url");
        return Ok(());
    }

    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| "info".into()))
        .with_writer(std::io::stderr)
        .init();

    let config_path = args
        .iter()
        .position(|a| a == "--config")
        .and_then(|i| args.get(i + 1))
        .map(PathBuf::from)
        .or_else(|| std::env::var("AMBIENTBOT_CONFIG").ok().map(PathBuf::from))
        .unwrap_or_else(|| PathBuf::from("ambientbot.toml"));

    let config = Config::load(&config_path)
        .with_context(|| format!("loading config from {}", config_path.display()))?;
    info!("config loaded from {}", config_path.display());

    let memory = MemoryStore::open(&config.data_dir.join("memory.db"))?;
    let conversations = ConversationStore::open(&config.data_dir.join("conversations.db"))?;
    memory.purge_expired()?;
    conversations.cleanup_expired()?;
    let invoker = Arc::new(HttpModelClient::new());

    let orchestrator = Arc::new(Orchestrator::new(config, invoker, memory, conversations)?);
    info!("ambientbot v{} ready", env!("CARGO_PKG_VERSION"));

    // Replies are serialized through one writer task; handlers run one
    // task per event so slow model calls never block other scopes.
    let (tx, mut rx) = mpsc::unbounded_channel::<String>();
    let writer = tokio::spawn(async move {
        while let Some(line) = rx.recv().await {
            println!("{}", line);
        }
    });

    let stdin = BufReader::new(tokio::io::stdin());
    let mut lines = stdin.lines();

    while let Some(line) = lines.next_line().await? {
        let trimmed = line.trim();
        if trimmed.is_empty() {
            continue;
        }

        let event: InboundEvent = match serde_json::from_str(trimmed) {
            Ok(event) => event,
            Err(e) => {
                warn!("unparseable event line: {}", e);
                continue;
            }
        };

        let orchestrator = Arc::clone(&orchestrator);
        let tx = tx.clone();
        tokio::spawn(async move {
            let scope_id = event.scope_id.clone();
            let outcome = orchestrator.handle_message(event).await;
            let line = match outcome {
                Outcome::Sent(text) => serde_json::json!({
                    "scope_id": scope_id,
                    "outcome": "sent",
                    "text": text,
                }),
                Outcome::Suppressed(reason) => serde_json::json!({
                    "scope_id": scope_id,
                    "outcome": "suppressed",
                    "reason": reason.as_str(),
                }),
                Outcome::Error(e) => {
                    error!(scope_id = %scope_id, "handler error: {}", e);
                    serde_json::json!({
                        "scope_id": scope_id,
                        "outcome": "error",
                    })
                }
            };
            let _ = tx.send(line.to_string());
        });
    }

    drop(tx);
    let _ = writer.await;
    Ok(())
}
