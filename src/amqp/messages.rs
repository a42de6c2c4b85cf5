//! AMQP message definitions and serialization

use crate::error::{LadderError, Result};
use crate::types::SessionId;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// Durable queue the player commands arrive on
pub const PLAYER_COMMAND_QUEUE: &str = "ladder.player_commands";

/// Topic exchange every notification is published to
pub const NOTIFICATION_EXCHANGE: &str = "ladder.notifications";

/// Routing key of a notification kind, e.g. `notification.match_seed`
pub fn notification_routing_key(kind: &str) -> String {
    format!("notification.{}", kind)
}

/// Message envelope with metadata
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MessageEnvelope<T> {
    pub payload: T,
    pub correlation_id: String,
    pub timestamp: DateTime<Utc>,
    pub routing_key: String,
}

impl<T> MessageEnvelope<T>
where
    T: Serialize + serde::de::DeserializeOwned,
{
    pub fn new(payload: T, routing_key: String) -> Self {
        Self {
            payload,
            correlation_id: uuid::Uuid::new_v4().to_string(),
            timestamp: Utc::now(),
            routing_key,
        }
    }

    /// Reuse an existing id so redeliveries of the same payload can be deduplicated
    pub fn with_correlation_id(mut self, correlation_id: impl Into<String>) -> Self {
        self.correlation_id = correlation_id.into();
        self
    }

    pub fn to_bytes(&self) -> Result<Vec<u8>> {
        serde_json::to_vec(self).map_err(|e| {
            LadderError::InternalError {
                message: format!("Failed to serialize message: {}", e),
            }
            .into()
        })
    }

    pub fn from_bytes(bytes: &[u8]) -> Result<Self> {
        serde_json::from_slice(bytes).map_err(|e| {
            LadderError::InvalidCommand {
                reason: format!("Failed to deserialize message: {}", e),
            }
            .into()
        })
    }
}

/// Action requested by a player through the chat front-end
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "command", rename_all = "snake_case")]
pub enum PlayerCommand {
    Register { name: String },
    Rename { name: String },
    /// Join the upcoming race of a league
    Join { league: String },
    Cancel { league: String },
    /// Report the running race as finished; `league` picks the race when
    /// the player runs several at once
    Complete {
        #[serde(default, skip_serializing_if = "Option::is_none")]
        league: Option<String>,
    },
    Forfeit {
        #[serde(default, skip_serializing_if = "Option::is_none")]
        league: Option<String>,
    },
    /// Latest results of a league
    Recap { league: String },
    /// Administrators only
    ForceClose { session_id: SessionId },
}

impl PlayerCommand {
    pub fn name(&self) -> &'static str {
        match self {
            PlayerCommand::Register { .. } => "register",
            PlayerCommand::Rename { .. } => "rename",
            PlayerCommand::Join { .. } => "join",
            PlayerCommand::Cancel { .. } => "cancel",
            PlayerCommand::Complete { .. } => "complete",
            PlayerCommand::Forfeit { .. } => "forfeit",
            PlayerCommand::Recap { .. } => "recap",
            PlayerCommand::ForceClose { .. } => "force_close",
        }
    }
}

/// A command together with the identity that issued it
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CommandRequest {
    /// Identity of the caller on the messaging platform
    pub external_id: String,
    #[serde(flatten)]
    pub command: PlayerCommand,
    #[serde(default = "Utc::now")]
    pub timestamp: DateTime<Utc>,
}

impl CommandRequest {
    pub fn new(external_id: impl Into<String>, command: PlayerCommand) -> Self {
        Self {
            external_id: external_id.into(),
            command,
            timestamp: Utc::now(),
        }
    }
}

/// Message serialization and validation utilities
pub struct MessageUtils;

impl MessageUtils {
    pub fn serialize_command(request: &CommandRequest) -> Result<Vec<u8>> {
        Self::validate_command(request)?;
        serde_json::to_vec(request).map_err(|e| {
            LadderError::InternalError {
                message: format!("Failed to serialize command: {}", e),
            }
            .into()
        })
    }

    pub fn deserialize_command(bytes: &[u8]) -> Result<CommandRequest> {
        let request: CommandRequest =
            serde_json::from_slice(bytes).map_err(|e| LadderError::InvalidCommand {
                reason: format!("Failed to deserialize command: {}", e),
            })?;

        Self::validate_command(&request)?;
        Ok(request)
    }

    pub fn validate_command(request: &CommandRequest) -> Result<()> {
        if request.external_id.trim().is_empty() {
            return Err(LadderError::InvalidCommand {
                reason: "Caller identity cannot be empty".to_string(),
            }
            .into());
        }

        let league = match &request.command {
            PlayerCommand::Join { league }
            | PlayerCommand::Cancel { league }
            | PlayerCommand::Recap { league } => Some(league),
            PlayerCommand::Complete { league } | PlayerCommand::Forfeit { league } => {
                league.as_ref()
            }
            _ => None,
        };
        if league.is_some_and(|code| code.trim().is_empty()) {
            return Err(LadderError::InvalidCommand {
                reason: "League code cannot be empty".to_string(),
            }
            .into());
        }

        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_command_wire_format() {
        let raw = br#"{"external_id":"1234","command":"join","league":"std"}"#;
        let request = MessageUtils::deserialize_command(raw).unwrap();

        assert_eq!(request.external_id, "1234");
        assert_eq!(
            request.command,
            PlayerCommand::Join {
                league: "std".to_string()
            }
        );

        let raw = br#"{"external_id":"1234","command":"forfeit"}"#;
        let request = MessageUtils::deserialize_command(raw).unwrap();
        assert_eq!(request.command, PlayerCommand::Forfeit { league: None });
        assert_eq!(request.command.name(), "forfeit");

        let raw = br#"{"external_id":"1234","command":"complete","league":"alt"}"#;
        let request = MessageUtils::deserialize_command(raw).unwrap();
        assert_eq!(
            request.command,
            PlayerCommand::Complete {
                league: Some("alt".to_string())
            }
        );
    }

    #[test]
    fn test_command_validation() {
        let empty_caller = CommandRequest::new(" ", PlayerCommand::Complete { league: None });
        assert!(MessageUtils::validate_command(&empty_caller).is_err());

        let empty_league = CommandRequest::new(
            "1234",
            PlayerCommand::Cancel {
                league: String::new(),
            },
        );
        assert!(MessageUtils::validate_command(&empty_league).is_err());

        let blank_race = CommandRequest::new(
            "1234",
            PlayerCommand::Forfeit {
                league: Some(" ".to_string()),
            },
        );
        assert!(MessageUtils::validate_command(&blank_race).is_err());

        let unknown = br#"{"external_id":"1234","command":"dance"}"#;
        let err = MessageUtils::deserialize_command(unknown).unwrap_err();
        assert!(matches!(
            err.downcast_ref::<LadderError>(),
            Some(LadderError::InvalidCommand { .. })
        ));
    }

    #[test]
    fn test_envelope_keeps_given_correlation_id() {
        let envelope = MessageEnvelope::new(
            PlayerCommand::Complete { league: None },
            notification_routing_key("command_reply"),
        )
        .with_correlation_id("abc");

        assert_eq!(envelope.routing_key, "notification.command_reply");
        assert_eq!(envelope.correlation_id, "abc");

        let bytes = envelope.to_bytes().unwrap();
        let decoded = MessageEnvelope::<PlayerCommand>::from_bytes(&bytes).unwrap();
        assert_eq!(decoded.payload, PlayerCommand::Complete { league: None });
    }
}
