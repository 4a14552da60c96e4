use bon::Builder;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;

/// Frame received from the team-chat server.
///
/// All text frames on the connection are decoded into this enum, discriminated by `type`.
/// Discriminators this client does not know yet decode as [`ServerFrame::Unknown`].
#[non_exhaustive]
#[derive(Debug, Clone, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ServerFrame {
    /// Token accepted; carries the server-confirmed identity
    Connected {
        #[serde(rename = "userId")]
        user_id: String,
    },
    /// Reply to `join_team`, seeding the message history
    TeamJoined(TeamJoined),
    /// A new message posted to the team conversation
    NewMessage { data: ChatMessage },
    /// A team member came online
    UserJoined { data: Presence },
    /// A team member went offline
    UserLeft { data: Presence },
    /// Typing notification, passed through untouched
    TypingIndicator { data: Value },
    /// Server-side rejection, e.g. an invalid token or unknown team
    Error {
        #[serde(alias = "message")]
        error: String,
    },
    /// Heartbeat acknowledgment
    Pong,
    /// Discriminator this client does not understand
    #[serde(other)]
    Unknown,
}

impl ServerFrame {
    /// Wire discriminator of this frame, for logging.
    #[must_use]
    pub const fn kind(&self) -> &'static str {
        match self {
            Self::Connected { .. } => "connected",
            Self::TeamJoined(_) => "team_joined",
            Self::NewMessage { .. } => "new_message",
            Self::UserJoined { .. } => "user_joined",
            Self::UserLeft { .. } => "user_left",
            Self::TypingIndicator { .. } => "typing_indicator",
            Self::Error { .. } => "error",
            Self::Pong => "pong",
            Self::Unknown => "unknown",
        }
    }
}

/// A delivered conversation entry.
#[non_exhaustive]
#[derive(Debug, Clone, PartialEq, Eq, Deserialize, Serialize, Builder)]
#[serde(rename_all = "camelCase")]
pub struct ChatMessage {
    /// Unique identifier for this message
    pub id: String,
    /// Team the message was posted to
    pub team_id: String,
    /// User id of the author
    pub sender_id: String,
    /// Display name of the author at the time of posting
    #[serde(alias = "userName")]
    pub sender_name: String,
    /// Message body text
    #[serde(alias = "message", alias = "body")]
    pub content: String,
    /// When the server accepted the message
    pub created_at: DateTime<Utc>,
}

/// Payload of a `team_joined` frame.
#[non_exhaustive]
#[derive(Debug, Clone, Deserialize, Builder)]
#[serde(rename_all = "camelCase")]
pub struct TeamJoined {
    /// Team descriptor as sent by the server
    #[serde(default)]
    #[builder(default)]
    pub team: Value,
    /// Recent history, oldest first
    #[serde(default)]
    #[builder(default)]
    pub recent_messages: Vec<ChatMessage>,
}

/// Payload of `user_joined` / `user_left` frames.
#[non_exhaustive]
#[derive(Debug, Clone, PartialEq, Eq, Deserialize, Builder)]
#[serde(rename_all = "camelCase")]
pub struct Presence {
    #[builder(into)]
    pub user_id: String,
}

/// Decode one inbound text frame.
///
/// Returns `Ok(None)` for empty or whitespace-only input (keepalive noise) and an error for
/// input that is not a well-formed frame. Unrecognized discriminators are not an error; they
/// decode as [`ServerFrame::Unknown`].
pub fn decode(bytes: &[u8]) -> crate::Result<Option<ServerFrame>> {
    let trimmed = bytes
        .iter()
        .position(|b| !b.is_ascii_whitespace())
        .map_or(&[][..], |start| &bytes[start..]);

    if trimmed.is_empty() {
        return Ok(None);
    }

    #[cfg(feature = "tracing")]
    {
        let jd = &mut serde_json::Deserializer::from_slice(trimmed);
        let frame: ServerFrame = serde_path_to_error::deserialize(jd).map_err(|e| {
            tracing::debug!(path = %e.path(), error = %e.inner(), "frame decoding failed");
            e.into_inner()
        })?;
        Ok(Some(frame))
    }

    #[cfg(not(feature = "tracing"))]
    {
        let frame: ServerFrame = serde_json::from_slice(trimmed)?;
        Ok(Some(frame))
    }
}
