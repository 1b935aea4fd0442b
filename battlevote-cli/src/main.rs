//! battlevote: vote in real-time item battles from the terminal.
//!
//! Reads commands from stdin (`vote <id>`, `random`, `show`, … see `help`)
//! and prints tally updates and notices as they arrive from the relay.

mod app;
mod config;

use std::path::PathBuf;
use std::sync::Arc;

use anyhow::{Context, Result};
use battlevote_sdk::channel::{ChannelConfig, Connector, LocalRelay, WebSocketConnector};
use battlevote_sdk::identity::{FingerprintIdentity, IdentityProvider, StaticIdentity};
use battlevote_sdk::items::ItemClient;
use battlevote_sdk::session::BattleSession;
use battlevote_sdk::types::ItemId;
use battlevote_sdk::{BattleStore, Channel, VotingEngine};
use clap::Parser;
use tokio::io::{AsyncBufReadExt, BufReader};
use tokio::sync::broadcast;
use tracing_subscriber::EnvFilter;

use crate::app::{App, Flow};
use crate::config::{Config, Resolved};

#[derive(Parser, Debug)]
#[command(name = "battlevote", about = "Vote in real-time item battles")]
pub struct Cli {
    /// Relay WebSocket URL
    #[arg(long, env = "BATTLEVOTE_RELAY_URL")]
    relay_url: Option<String>,

    /// Item service base URL
    #[arg(long, env = "BATTLEVOTE_API_URL")]
    api_url: Option<String>,

    /// Directory for local state (state.db lives under battlevote/)
    #[arg(long, env = "BATTLEVOTE_DATA_DIR")]
    data_dir: Option<PathBuf>,

    /// Items per random battle
    #[arg(long, env = "BATTLEVOTE_BATTLEFIELD_SIZE")]
    battlefield_size: Option<usize>,

    /// Highest item id a random battle may draw
    #[arg(long, env = "BATTLEVOTE_MAX_ITEM_ID")]
    max_item_id: Option<ItemId>,

    /// Vote under this id instead of the device fingerprint
    #[arg(long, env = "BATTLEVOTE_USER_ID")]
    user_id: Option<String>,

    /// Use an in-process relay (no network)
    #[arg(long, env = "BATTLEVOTE_OFFLINE")]
    offline: bool,

    /// Config file (default: ~/.config/battlevote/config.toml)
    #[arg(long, env = "BATTLEVOTE_CONFIG")]
    config: Option<PathBuf>,
}

#[tokio::main]
async fn main() -> Result<()> {
    // Logs go to stderr so they don't interleave with the tally on stdout.
    let json_logs = std::env::var("BATTLEVOTE_LOG_JSON").unwrap_or_default() == "1";
    let filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new("battlevote=info,battlevote_sdk=info"));
    if json_logs {
        tracing_subscriber::fmt()
            .with_env_filter(filter)
            .with_writer(std::io::stderr)
            .json()
            .init();
    } else {
        tracing_subscriber::fmt()
            .with_env_filter(filter)
            .with_writer(std::io::stderr)
            .init();
    }

    let cli = Cli::parse();
    let config_path = cli.config.clone().unwrap_or_else(config::default_config_path);
    let resolved = Resolved::merge(&cli, &Config::load(&config_path));

    let store_path = resolved.store_path();
    if let Some(dir) = store_path.parent() {
        tokio::fs::create_dir_all(dir)
            .await
            .with_context(|| format!("creating {}", dir.display()))?;
    }
    let store = BattleStore::open(&store_path)
        .with_context(|| format!("opening {}", store_path.display()))?;

    let identity: Arc<dyn IdentityProvider> = match &resolved.user_id {
        Some(id) => Arc::new(StaticIdentity(id.clone())),
        None => Arc::new(FingerprintIdentity::new(store.clone())),
    };
    let connector: Arc<dyn Connector> = if resolved.offline {
        Arc::new(LocalRelay::new())
    } else {
        Arc::new(WebSocketConnector)
    };

    tracing::info!(
        relay = %resolved.client.relay_url,
        store = %store_path.display(),
        offline = resolved.offline,
        "Starting battlevote"
    );

    let (notice_tx, mut notices) = broadcast::channel(64);
    let channel = Channel::new(ChannelConfig::from(&resolved.client), connector, identity);
    let _status = channel.on_connection_change(|connected| {
        if connected {
            tracing::info!("Relay connected");
        } else {
            tracing::warn!("Relay disconnected");
        }
    });

    let session = BattleSession::restore(store.clone(), &resolved.client, notice_tx.clone());
    let engine = VotingEngine::new(channel.clone(), store, notice_tx);
    engine.initialize(session.battle_key());

    if let Err(e) = channel.connect().await {
        tracing::warn!("{e}; voting disabled until `connect` succeeds");
    }
    let sync = engine.spawn_storage_sync(resolved.client.storage_poll_interval);

    let mut states = engine.subscribe_state();
    let mut app = App {
        session,
        engine,
        items: ItemClient::new(&resolved.client),
    };
    app.show();
    println!("Type `help` for commands.");

    let mut lines = BufReader::new(tokio::io::stdin()).lines();
    loop {
        tokio::select! {
            line = lines.next_line() => {
                let Some(line) = line? else { break };
                match app::parse_command(&line) {
                    Ok(Some(cmd)) => {
                        if app.execute(cmd).await? == Flow::Quit {
                            break;
                        }
                    }
                    Ok(None) => {}
                    Err(e) => println!("{e}"),
                }
            }
            notice = notices.recv() => match notice {
                Ok(notice) => println!("* {notice}"),
                Err(broadcast::error::RecvError::Lagged(n)) => {
                    tracing::debug!("Skipped {n} notices");
                }
                Err(broadcast::error::RecvError::Closed) => break,
            },
            changed = states.changed() => {
                if changed.is_err() {
                    break;
                }
                app.show();
            }
        }
    }

    sync.abort();
    channel.disconnect();
    Ok(())
}
