use std::{
    fs,
    path::{Path, PathBuf},
    sync::Arc,
};

use anyhow::{Context, Result};
use chat_sync::{load_settings, load_settings_from, ChatSyncService, InMemoryChatBackend};
use clap::{Parser, Subcommand};
use serde::Serialize;
use shared::{
    domain::{ChannelId, MessageId},
    protocol::{ChannelRecord, IdentityProfile, ProfileData},
};
use tracing_subscriber::EnvFilter;

/// Runs the chat sync service against a JSON channel fixture.
#[derive(Parser, Debug)]
#[command(name = "sync-inspect")]
struct Cli {
    /// JSON array of channel records loaded into the in-memory backend.
    #[arg(long)]
    fixture: PathBuf,
    /// Connect as this user id.
    #[arg(long)]
    user: String,
    /// Settings file; defaults to chat_sync.toml in the working directory.
    #[arg(long)]
    config: Option<PathBuf>,
    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Lists the channels the user has posted in.
    Channels {
        #[arg(long)]
        force: bool,
    },
    Unread {
        channel: String,
    },
    ToggleLike {
        channel: String,
        message: String,
        #[arg(long)]
        parent: Option<String>,
    },
}

#[derive(Serialize)]
struct UnreadReport<'a> {
    channel_id: &'a ChannelId,
    local: u32,
    refreshed: u32,
}

fn load_fixture(path: &Path) -> Result<Vec<ChannelRecord>> {
    let raw = fs::read_to_string(path)
        .with_context(|| format!("failed to read fixture '{}'", path.display()))?;
    serde_json::from_str(&raw)
        .with_context(|| format!("failed to parse fixture '{}'", path.display()))
}

fn print_json<T: Serialize>(value: &T) -> Result<()> {
    println!("{}", serde_json::to_string_pretty(value)?);
    Ok(())
}

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .with_writer(std::io::stderr)
        .init();
    let cli = Cli::parse();

    let settings = match &cli.config {
        Some(path) => load_settings_from(path)?,
        None => load_settings(),
    };
    let channels = load_fixture(&cli.fixture)?;
    tracing::info!(channels = channels.len(), "fixture loaded");

    let backend = Arc::new(InMemoryChatBackend::with_channels(channels));
    let service = ChatSyncService::new(backend, settings);
    service
        .connect_user(IdentityProfile {
            auth_token: cli.user.clone(),
            user_data: ProfileData {
                name: cli.user.clone(),
                ..ProfileData::default()
            },
        })
        .await?;

    match cli.command {
        Command::Channels { force } => {
            let channels = service.get_user_channels(force).await;
            print_json(&channels)?;
        }
        Command::Unread { channel } => {
            let channel_id = ChannelId::new(channel);
            service.get_user_channels(false).await;
            let local = service.unread_count(&channel_id).await;
            let refreshed = service.force_refresh_unread(&channel_id).await;
            print_json(&UnreadReport {
                channel_id: &channel_id,
                local,
                refreshed,
            })?;
        }
        Command::ToggleLike {
            channel,
            message,
            parent,
        } => {
            service.set_active_channel(ChannelId::new(channel)).await;
            let parent = parent.map(MessageId::new);
            let state = service
                .toggle_like(&MessageId::new(message), parent.as_ref())
                .await?;
            print_json(&state)?;
        }
    }

    service.disconnect().await?;
    Ok(())
}
