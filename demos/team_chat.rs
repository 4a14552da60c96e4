//! Joins a team conversation and prints everything that happens on it.
//!
//! This example shows how to:
//! 1. Authenticate the client with a bearer token
//! 2. Subscribe to history, messages, presence and lifecycle events
//! 3. Post a message once the connection is up
//!
//! Run with tracing enabled:
//! ```sh
//! RUST_LOG=info,rustls=off cargo run --example team_chat
//! ```
//!
//! Optionally log to a file:
//! ```sh
//! LOG_FILE=team_chat.log RUST_LOG=info,rustls=off cargo run --example team_chat
//! ```
//!
//! Requires the following environment variables:
//! - `TEAM_CHAT_ENDPOINT` (e.g. `wss://practice.example.com`)
//! - `TEAM_CHAT_TOKEN`
//! - `TEAM_CHAT_TEAM_ID`
//!
//! Pass a message as the first argument to post it after joining.

use std::fs::File;
use std::time::Duration;

use team_chat_transport::chat::{Client, ConnectEvent, DisconnectEvent, ErrorEvent};
use team_chat_transport::ws::config::{Config, ReconnectConfig};
use team_chat_transport::{ENDPOINT_VAR, TEAM_ID_VAR, TOKEN_VAR};
use tracing::{error, info, warn};
use tracing_subscriber::EnvFilter;
use tracing_subscriber::layer::SubscriberExt as _;
use tracing_subscriber::util::SubscriberInitExt as _;

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    if let Ok(path) = std::env::var("LOG_FILE") {
        let file = File::create(path)?;
        tracing_subscriber::registry()
            .with(EnvFilter::from_default_env())
            .with(
                tracing_subscriber::fmt::layer()
                    .with_writer(file)
                    .with_ansi(false),
            )
            .init();
    } else {
        tracing_subscriber::fmt::init();
    }

    let endpoint = std::env::var(ENDPOINT_VAR)?;
    let token = std::env::var(TOKEN_VAR)?;
    let team_id = std::env::var(TEAM_ID_VAR)?;
    let mut outgoing = std::env::args().nth(1);

    let config = Config::default().with_reconnect(
        ReconnectConfig::exponential(Duration::from_secs(1), Duration::from_secs(30))
            .with_max_attempts(10),
    );
    let client = Client::new(&endpoint, config)?.with_token(token);
    let dispatcher = client.dispatcher();

    let _history = dispatcher.on_team_joined(|joined| {
        info!(recent = joined.recent_messages.len(), team = %joined.team, "Joined team");
        for message in &joined.recent_messages {
            info!(
                at = %message.created_at,
                sender = %message.sender_name,
                content = %message.content,
                "history"
            );
        }
    });

    let _messages = dispatcher.on_message(|message| {
        info!(
            at = %message.created_at,
            sender = %message.sender_name,
            content = %message.content,
            "message"
        );
    });

    let _joined =
        dispatcher.on_user_joined(|presence| info!(user_id = %presence.user_id, "joined"));
    let _left = dispatcher.on_user_left(|presence| info!(user_id = %presence.user_id, "left"));
    let _typing = dispatcher.on_typing(|payload| info!(%payload, "typing"));

    let _connect = dispatcher.on_connect(|event: &ConnectEvent| {
        info!(team_id = %event.team_id, attempt = event.attempt, "connected");
    });
    let _disconnect = dispatcher.on_disconnect(|event: &DisconnectEvent| {
        warn!(team_id = %event.team_id, reason = ?event.reason, "disconnected");
    });
    let _errors = dispatcher.on_error(|event: &ErrorEvent| error!(%event, "error"));

    client.connect(team_id)?;

    let mut state = client.state_receiver();
    loop {
        tokio::select! {
            _ = tokio::signal::ctrl_c() => break,
            changed = state.changed() => {
                if changed.is_err() {
                    break;
                }
                let current = *state.borrow_and_update();
                info!(state = ?current, "state changed");

                // Post once, on the first successful connect.
                if current.is_connected()
                    && let Some(message) = outgoing.take()
                {
                    match client.send(message) {
                        Ok(()) => info!("Message posted"),
                        Err(e) => error!(error = %e, "Unable to post message"),
                    }
                }
            }
        }
    }

    client.disconnect();
    info!("Disconnected");

    Ok(())
}
