//! Error types for the racing ladder
//!
//! Domain conditions are `LadderError` variants carried inside `anyhow::Error`;
//! callers downcast to classify them.

use crate::types::SessionStatus;

/// Result type alias for convenience
pub type Result<T> = anyhow::Result<T>;

/// Custom error types for specific ladder scenarios
#[derive(Debug, thiserror::Error)]
pub enum LadderError {
    #[error("cannot {action} while the race is {status}")]
    InvalidPhase {
        action: &'static str,
        status: SessionStatus,
    },

    #[error("you already joined this race")]
    AlreadyJoined { player_id: String },

    #[error("you have not joined this race")]
    NotJoined { player_id: String },

    #[error("your race is already over")]
    EntryAlreadyTerminal { entry_id: String },

    #[error("matchmaker invoked with an odd number of players ({count})")]
    OddCount { count: usize },

    #[error("store unavailable: {message}")]
    StoreUnavailable { message: String },

    #[error("transaction conflict on {resource}")]
    TransactionConflict { resource: String },

    #[error("session not found: {session_id}")]
    SessionNotFound { session_id: String },

    #[error("no league with code `{short_code}`")]
    LeagueNotFound { short_code: String },

    #[error("no upcoming race for league `{short_code}`")]
    NoUpcomingSession { short_code: String },

    #[error("no race has been run yet for league `{short_code}`")]
    NoPastSession { short_code: String },

    #[error("you are not registered, use the register command first")]
    PlayerNotFound { player_id: String },

    #[error("an account is already linked to this identity")]
    PlayerAlreadyRegistered { external_id: String },

    #[error("you are not racing right now")]
    NoActiveEntry { player_id: String },

    #[error("you are racing in several leagues ({leagues}), name the league of your race")]
    AmbiguousEntry { player_id: String, leagues: String },

    #[error("match entry not found: {entry_id}")]
    EntryNotFound { entry_id: String },

    #[error("invalid player name: {reason}")]
    InvalidName { reason: String },

    #[error("invalid command: {reason}")]
    InvalidCommand { reason: String },

    #[error("only administrators can {action}")]
    PermissionDenied { action: &'static str },

    #[error("seed generation failed: {reason}")]
    SeedGenerationFailed { reason: String },

    #[error("AMQP connection failed: {message}")]
    AmqpConnectionFailed { message: String },

    #[error("Configuration error: {message}")]
    ConfigurationError { message: String },

    #[error("Internal service error: {message}")]
    InternalError { message: String },
}

impl LadderError {
    /// Whether the message is safe to show to any caller
    pub fn is_public(&self) -> bool {
        matches!(
            self,
            LadderError::InvalidPhase { .. }
                | LadderError::AlreadyJoined { .. }
                | LadderError::NotJoined { .. }
                | LadderError::EntryAlreadyTerminal { .. }
                | LadderError::LeagueNotFound { .. }
                | LadderError::NoUpcomingSession { .. }
                | LadderError::NoPastSession { .. }
                | LadderError::PlayerNotFound { .. }
                | LadderError::PlayerAlreadyRegistered { .. }
                | LadderError::NoActiveEntry { .. }
                | LadderError::AmbiguousEntry { .. }
                | LadderError::InvalidName { .. }
                | LadderError::InvalidCommand { .. }
                | LadderError::PermissionDenied { .. }
        )
    }

    /// Whether retrying the same operation later may succeed
    pub fn is_retryable(&self) -> bool {
        matches!(
            self,
            LadderError::StoreUnavailable { .. } | LadderError::TransactionConflict { .. }
        )
    }
}

/// Find the `LadderError` inside an error chain, if any
pub fn ladder_error(err: &anyhow::Error) -> Option<&LadderError> {
    err.chain().find_map(|cause| cause.downcast_ref::<LadderError>())
}

/// Whether the error chain carries a retryable condition
pub fn is_retryable(err: &anyhow::Error) -> bool {
    ladder_error(err).is_some_and(LadderError::is_retryable)
}

/// Message shown to the caller of a player action.
///
/// Public errors are shown verbatim; anything else is only detailed for
/// administrators.
pub fn user_facing_message(err: &anyhow::Error, is_admin: bool) -> String {
    match ladder_error(err) {
        Some(e) if e.is_public() => e.to_string(),
        _ if is_admin => format!("{:#}", err),
        _ => "There was an error processing your command.".to_string(),
    }
}
