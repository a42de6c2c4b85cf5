//! Outbound notification model

use crate::types::{MatchId, Outcome, PlayerId, SessionId, SessionStatus};
use crate::utils::{current_timestamp, generate_id};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// Who a notification is addressed to
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(tag = "type", content = "id")]
pub enum Recipient {
    /// A league announcement channel
    Channel(String),
    /// A single player, by external identity
    User(String),
}

impl Recipient {
    pub fn id(&self) -> &str {
        match self {
            Recipient::Channel(id) | Recipient::User(id) => id,
        }
    }
}

/// What a notification announces, with the identifiers it refers to
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum NotificationKind {
    SessionStatusUpdate {
        session_id: SessionId,
        status: SessionStatus,
    },
    SessionCountdown {
        session_id: SessionId,
        seconds_left: i64,
    },
    SessionEmpty {
        session_id: SessionId,
    },
    OddPlayerKicked {
        session_id: SessionId,
        player_id: PlayerId,
    },
    MatchSeed {
        match_id: MatchId,
        player_id: PlayerId,
    },
    MatchEnd {
        match_id: MatchId,
        player_id: PlayerId,
        outcome: Outcome,
    },
    SessionRecap {
        session_id: SessionId,
    },
    CommandReply {
        command: String,
        success: bool,
    },
}

impl NotificationKind {
    /// Stable name used in routing keys and metric labels
    pub fn name(&self) -> &'static str {
        match self {
            NotificationKind::SessionStatusUpdate { .. } => "session_status_update",
            NotificationKind::SessionCountdown { .. } => "session_countdown",
            NotificationKind::SessionEmpty { .. } => "session_empty",
            NotificationKind::OddPlayerKicked { .. } => "odd_player_kicked",
            NotificationKind::MatchSeed { .. } => "match_seed",
            NotificationKind::MatchEnd { .. } => "match_end",
            NotificationKind::SessionRecap { .. } => "session_recap",
            NotificationKind::CommandReply { .. } => "command_reply",
        }
    }
}

/// File attached to a notification, passed through to the recipient untouched
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct NotificationFile {
    pub name: String,
    pub content_type: String,
    pub data: Vec<u8>,
}

/// One outbound message
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Notification {
    pub id: Uuid,
    pub recipient: Recipient,
    pub kind: NotificationKind,
    /// Notifications sharing a key are delivered in the order they were sent
    pub ordering_key: Option<Uuid>,
    pub body: String,
    #[serde(default)]
    pub files: Vec<NotificationFile>,
    pub created_at: DateTime<Utc>,
}

impl Notification {
    pub fn new(recipient: Recipient, kind: NotificationKind, body: impl Into<String>) -> Self {
        Self {
            id: generate_id(),
            recipient,
            kind,
            ordering_key: None,
            body: body.into(),
            files: Vec::new(),
            created_at: current_timestamp(),
        }
    }

    pub fn to_channel(channel: &str, kind: NotificationKind, body: impl Into<String>) -> Self {
        Self::new(Recipient::Channel(channel.to_string()), kind, body)
    }

    pub fn to_user(external_id: &str, kind: NotificationKind, body: impl Into<String>) -> Self {
        Self::new(Recipient::User(external_id.to_string()), kind, body)
    }

    pub fn with_ordering_key(mut self, key: Uuid) -> Self {
        self.ordering_key = Some(key);
        self
    }

    pub fn with_file(mut self, file: NotificationFile) -> Self {
        self.files.push(file);
        self
    }

    pub fn kind_name(&self) -> &'static str {
        self.kind.name()
    }

    /// One-line description for logs; the body is escaped so it stays on one line
    pub fn summary(&self) -> String {
        let recipient = match &self.recipient {
            Recipient::Channel(id) => format!("channel {}", id),
            Recipient::User(id) => format!("user {}", id),
        };
        let body = serde_json::to_string(&self.body).unwrap_or_default();

        let mut summary = format!("{} to {}", self.kind_name(), recipient);
        if !self.files.is_empty() {
            summary.push_str(&format!(", {} file(s)", self.files.len()));
        }
        summary.push_str(&format!(", body: {}", body));
        summary
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_builder_and_summary() {
        let session_id = generate_id();
        let notification = Notification::to_user(
            "user-1",
            NotificationKind::SessionEmpty { session_id },
            "line one\nline two",
        )
        .with_ordering_key(session_id)
        .with_file(NotificationFile {
            name: "seed.zpf".to_string(),
            content_type: "application/zlib".to_string(),
            data: vec![1, 2, 3],
        });

        assert_eq!(notification.ordering_key, Some(session_id));
        assert_eq!(notification.recipient.id(), "user-1");

        let summary = notification.summary();
        assert!(summary.starts_with("session_empty to user user-1, 1 file(s)"));
        assert!(!summary.contains('\n'));
    }

    #[test]
    fn test_kind_serializes_with_tag() {
        let kind = NotificationKind::SessionCountdown {
            session_id: generate_id(),
            seconds_left: 30,
        };
        let json = serde_json::to_value(&kind).expect("serialize kind");
        assert_eq!(json["kind"], "session_countdown");
        assert_eq!(json["seconds_left"], 30);
    }
}
