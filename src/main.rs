//! Example bot: replies to `.ping` and `.uptime`, and logs guild creates.
//! Demonstrates wiring a [`vocalize::Client`] end to end. Commands here
//! match on the whole post-prefix remainder, so only single-word commands
//! (no arguments) are supported — see [`vocalize::commands`].

use std::time::Instant;

use tracing::info;
use tracing_subscriber::EnvFilter;
use vocalize::client::{Client, ClientConfig};
use vocalize::commands::Command;
use vocalize::types::CreateMessage;

const INTENT_GUILDS: u32 = 1 << 0;
const INTENT_GUILD_MESSAGES: u32 = 1 << 9;
const INTENT_MESSAGE_CONTENT: u32 = 1 << 15;

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
        .init();

    let config = ClientConfig::from_env(INTENT_GUILDS | INTENT_GUILD_MESSAGES | INTENT_MESSAGE_CONTENT)?;
    let client = Client::new(config)?;
    let start_time = Instant::now();

    client.on("READY", |data| {
        let session_id = data.get("session_id").and_then(|v| v.as_str()).unwrap_or("?");
        info!(session_id, "bot is ready");
    });

    client.on("GUILD_CREATE", |data| {
        let name = data.get("name").and_then(|v| v.as_str()).unwrap_or("?");
        info!(guild = name, "joined or synced guild");
    });

    client.add_command(Command::new("ping", "replies with pong", |client, ctx| {
        let channel_id = ctx.channel_id.clone();
        tokio::spawn(async move {
            let _ = client
                .send_message(&channel_id, CreateMessage::new().content("pong"))
                .await;
        });
    }));

    client.add_command(Command::new("uptime", "shows how long the bot has been running", move |client, ctx| {
        let channel_id = ctx.channel_id.clone();
        let elapsed = start_time.elapsed().as_secs();
        tokio::spawn(async move {
            let _ = client
                .send_message(&channel_id, CreateMessage::new().content(format!("up for {elapsed}s")))
                .await;
        });
    }));

    client.start()?;
    tokio::signal::ctrl_c().await?;
    client.stop().await?;
    Ok(())
}
