//! Core WebSocket infrastructure.
//!
//! This module provides protocol-agnostic connection handling used by the team-chat client.
//!
//! # Architecture
//!
//! - [`connection`]: Opens a socket and drives it with heartbeat monitoring
//! - [`reconnect::ReconnectPolicy`]: Owns the single reconnection timer
//! - [`WireProtocol`]: Trait for decoding inbound frames and producing heartbeat probes

pub mod config;
pub mod connection;
pub mod error;
pub mod reconnect;
pub mod traits;

pub use connection::ConnectionState;
#[expect(
    clippy::module_name_repetitions,
    reason = "WsError includes module name for clarity when used outside this module"
)]
pub use error::WsError;
pub use reconnect::ReconnectPolicy;
pub use traits::*;
