//! libp2p-proxy: talk to a libp2p proxy server from the command line.

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use proxy_client::{InboundMessage, OutboundMessage, ProxyClient, ProxyConfig};
use serde_json::{json, Value};
use std::path::PathBuf;
use tracing::{info, warn};

/// libp2p proxy command-line interface.
#[derive(Parser)]
#[command(name = "libp2p-proxy")]
#[command(about = "Subscribe to and send messages through a libp2p proxy server")]
#[command(version)]
struct Cli {
    #[command(subcommand)]
    command: Commands,

    /// Proxy server URL. Defaults to PROXY_SERVER_URL or ws://127.0.0.1:8888
    #[arg(long, global = true)]
    url: Option<String>,

    /// Log level (trace, debug, info, warn, error)
    #[arg(short, long, default_value = "info", global = true)]
    log_level: String,

    /// Write JSONL logs to this file instead of stderr
    #[arg(long, global = true)]
    log_file: Option<PathBuf>,

    /// Write JSONL logs to ~/.libp2p-proxy/logs/client.jsonl
    #[arg(long, global = true, conflicts_with = "log_file")]
    json_log: bool,
}

#[derive(Subcommand)]
enum Commands {
    /// Print every message received on the given protocols as JSON lines
    Listen {
        /// Protocol to subscribe to (repeatable)
        #[arg(short, long = "protocol", required = true)]
        protocols: Vec<String>,
    },
    /// Send one message
    Send {
        /// Destination protocol
        #[arg(short, long)]
        protocol: String,

        /// Payload; parsed as JSON when possible, sent as a string otherwise
        #[arg(short, long)]
        data: String,

        /// Peer that should receive the message
        #[arg(long)]
        server_peer_id: Option<String>,

        /// Ask the proxy to persist the message
        #[arg(long)]
        save_data: bool,
    },
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    observability::init_with_config(observability::LogConfig {
        service_name: "libp2p-proxy".into(),
        default_level: cli.log_level.clone(),
        log_path: log_path(&cli),
        also_stderr: false,
    });

    let mut config = ProxyConfig::from_env().context("invalid proxy configuration")?;
    if let Some(url) = cli.url {
        config.url = url;
        config.validate().context("invalid --url")?;
    }

    match cli.command {
        Commands::Listen { protocols } => listen(config, protocols).await,
        Commands::Send {
            protocol,
            data,
            server_peer_id,
            save_data,
        } => {
            let mut message = OutboundMessage::new(protocol, parse_payload(&data)).save_data(save_data);
            if let Some(peer_id) = server_peer_id {
                message = message.to_peer(peer_id);
            }
            send(config, message).await
        }
    }
}

async fn listen(config: ProxyConfig, protocols: Vec<String>) -> Result<()> {
    let client = ProxyClient::builder(config)
        .on_peer_id(|peer_id| info!(peer_id = %peer_id, "Proxy assigned peer id"))
        .build();

    for protocol in &protocols {
        client
            .subscribe_sync(protocol.clone(), print_message)
            .await
            .with_context(|| format!("failed to subscribe to {}", protocol))?;
    }
    info!(?protocols, "Listening, press Ctrl-C to stop");

    tokio::signal::ctrl_c().await.context("failed to wait for Ctrl-C")?;

    if let Err(e) = client.unsubscribe_all().await {
        warn!(error = %e, "Failed to unsubscribe cleanly");
    }
    Ok(())
}

async fn send(config: ProxyConfig, message: OutboundMessage) -> Result<()> {
    let client = ProxyClient::new(config);
    let protocol = message.protocol.clone();

    client
        .send(message)
        .await
        .with_context(|| format!("failed to send on {}", protocol))?;
    info!(protocol = %protocol, "Message sent");

    client.close().await;
    Ok(())
}

fn print_message(message: InboundMessage) {
    let mut line = json!({
        "protocol": message.protocol,
        "data": message.data,
    });
    if !message.extra.is_empty() {
        line["extra"] = Value::Object(message.extra);
    }
    println!("{}", line);
}

fn log_path(cli: &Cli) -> Option<PathBuf> {
    if cli.json_log {
        observability::default_log_path()
    } else {
        cli.log_file.clone()
    }
}

/// JSON if it parses, otherwise the raw string.
fn parse_payload(raw: &str) -> Value {
    serde_json::from_str(raw).unwrap_or_else(|_| Value::String(raw.to_string()))
}
