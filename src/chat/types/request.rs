use serde::Serialize;

/// Frame sent by the client.
#[non_exhaustive]
#[derive(Clone, Debug, PartialEq, Eq, Serialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ClientFrame {
    /// Bind the connection to a team; sent once right after every open
    JoinTeam {
        #[serde(rename = "teamId")]
        team_id: String,
    },
    /// Post a message to the bound team
    SendMessage { message: String },
    /// Heartbeat probe, answered by `pong`
    Ping,
}

impl ClientFrame {
    #[must_use]
    pub fn join_team<S: Into<String>>(team_id: S) -> Self {
        Self::JoinTeam {
            team_id: team_id.into(),
        }
    }

    #[must_use]
    pub fn send_message<S: Into<String>>(message: S) -> Self {
        Self::SendMessage {
            message: message.into(),
        }
    }

    /// Encode this frame as wire JSON text.
    pub fn encode(&self) -> crate::Result<String> {
        Ok(serde_json::to_string(self)?)
    }
}
