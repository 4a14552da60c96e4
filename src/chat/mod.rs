#![expect(
    clippy::module_name_repetitions,
    reason = "Re-exported names intentionally match their modules for API clarity"
)]

//! Real-time team-chat session client.
//!
//! This module provides the WebSocket transport behind a team conversation: an authenticated
//! connection bound to one team, typed event fan-out and automatic reconnection.
//!
//! # Events
//!
//! - **message**: a new [`ChatMessage`] was posted
//! - **team-joined**: history batch returned in reply to `join_team`
//! - **user-joined / user-left / typing**: presence and typing notifications
//! - **connect / disconnect**: connection lifecycle
//! - **error**: server `error` frames and transport faults
//!
//! # Example
//!
//! ```rust, no_run
//! use team_chat_transport::chat::Client;
//! use team_chat_transport::ws::config::Config;
//!
//! #[tokio::main]
//! async fn main() -> anyhow::Result<()> {
//!     let client = Client::new("wss://practice.example.com", Config::default())?
//!         .with_token(std::env::var("TEAM_CHAT_TOKEN")?);
//!
//!     let _history = client.dispatcher().on_team_joined(|joined| {
//!         println!("{} recent messages", joined.recent_messages.len());
//!     });
//!
//!     client.connect("team-1")?;
//!     tokio::signal::ctrl_c().await?;
//!     client.disconnect();
//!     Ok(())
//! }
//! ```

pub mod client;
pub mod dispatcher;
pub mod types;

// Re-export commonly used types
pub use client::{ChatProtocol, Client, Session};
pub use dispatcher::{
    ConnectEvent, DisconnectEvent, DisconnectReason, Dispatcher, ErrorEvent, Subscription,
};
pub use types::request::ClientFrame;
pub use types::response::{ChatMessage, Presence, ServerFrame, TeamJoined};
