#![cfg_attr(doc, doc = include_str!("../README.md"))]

pub mod chat;
pub mod error;
pub mod ws;

use crate::error::Error;

pub type Result<T> = std::result::Result<T, Error>;

/// Environment variable the demos read the server's base WebSocket URL from.
pub const ENDPOINT_VAR: &str = "TEAM_CHAT_ENDPOINT";
/// Environment variable the demos read the bearer token from.
pub const TOKEN_VAR: &str = "TEAM_CHAT_TOKEN";
/// Environment variable the demos read the team to join from.
pub const TEAM_ID_VAR: &str = "TEAM_CHAT_TEAM_ID";
