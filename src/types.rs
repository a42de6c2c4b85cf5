//! Common types used throughout the racing ladder

use chrono::{DateTime, Duration, Utc};
use serde::{Deserialize, Serialize};
use skillratings::glicko2::Glicko2Rating;
use uuid::Uuid;

/// Unique identifier for players
pub type PlayerId = Uuid;

/// Unique identifier for leagues
pub type LeagueId = Uuid;

/// Unique identifier for match sessions
pub type SessionId = Uuid;

/// Unique identifier for matches
pub type MatchId = Uuid;

/// Unique identifier for match entries
pub type EntryId = Uuid;

/// Recurring slots at which a league's sessions start
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct LeagueSchedule {
    /// Any past or future slot; every other slot is a multiple of `interval_seconds` away
    pub anchor: DateTime<Utc>,
    pub interval_seconds: i64,
}

impl LeagueSchedule {
    /// First slot strictly after `after`
    pub fn next_slot_after(&self, after: DateTime<Utc>) -> DateTime<Utc> {
        let interval = self.interval_seconds.max(1);
        let elapsed = (after - self.anchor).num_seconds();
        let periods = elapsed.div_euclid(interval) + 1;
        let slot = self.anchor + Duration::seconds(periods * interval);

        // Sub-second truncation can overshoot by one slot
        let previous = slot - Duration::seconds(interval);
        if previous > after {
            previous
        } else {
            slot
        }
    }
}

/// A named competition configuration
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct League {
    pub id: LeagueId,
    pub name: String,
    /// Unique code used in commands, e.g. `std`
    pub short_code: String,
    /// Channel receiving the league's announcements
    pub announce_channel_id: String,
    /// Seconds before start at which the session becomes joinable
    pub joinable_offset_seconds: i64,
    /// Seconds before start at which the joined set is frozen and paired
    pub preparation_offset_seconds: i64,
    /// Players at or above this deviation are left out of the leaderboard
    pub deviation_threshold: f64,
    pub schedule: LeagueSchedule,
    /// Opaque settings forwarded to the seed generator
    pub generator_settings: serde_json::Value,
    pub generator_version: String,
}

impl League {
    pub fn joinable_offset(&self) -> Duration {
        Duration::seconds(self.joinable_offset_seconds)
    }

    pub fn preparation_offset(&self) -> Duration {
        Duration::seconds(self.preparation_offset_seconds)
    }
}

/// Lifecycle of a match session, in strict forward order
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub enum SessionStatus {
    Waiting,
    Joinable,
    Preparing,
    InProgress,
    Closed,
}

impl SessionStatus {
    /// The status following this one, `None` once closed
    pub fn next(self) -> Option<SessionStatus> {
        match self {
            SessionStatus::Waiting => Some(SessionStatus::Joinable),
            SessionStatus::Joinable => Some(SessionStatus::Preparing),
            SessionStatus::Preparing => Some(SessionStatus::InProgress),
            SessionStatus::InProgress => Some(SessionStatus::Closed),
            SessionStatus::Closed => None,
        }
    }

    pub fn is_active(self) -> bool {
        self != SessionStatus::Closed
    }

    pub fn as_str(self) -> &'static str {
        match self {
            SessionStatus::Waiting => "waiting",
            SessionStatus::Joinable => "joinable",
            SessionStatus::Preparing => "preparing",
            SessionStatus::InProgress => "in_progress",
            SessionStatus::Closed => "closed",
        }
    }
}

impl std::fmt::Display for SessionStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// One scheduled race event for a league
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MatchSession {
    pub id: SessionId,
    pub league_id: LeagueId,
    pub start_date: DateTime<Utc>,
    pub status: SessionStatus,
    /// Joined players in join order
    pub player_ids: Vec<PlayerId>,
    /// Player removed at preparation time to even out the count
    pub kicked_player_id: Option<PlayerId>,
    /// Countdown marks (seconds before start) already announced
    pub countdowns_sent: Vec<i64>,
    pub created_at: DateTime<Utc>,
    pub closed_at: Option<DateTime<Utc>>,
}

/// State of one player's half of a match
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum EntryStatus {
    Waiting,
    InProgress,
    Finished,
    Forfeit,
}

impl EntryStatus {
    pub fn is_terminal(self) -> bool {
        matches!(self, EntryStatus::Finished | EntryStatus::Forfeit)
    }
}

/// Result of a match from one entry's point of view
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum Outcome {
    Win,
    Draw,
    Loss,
}

impl Outcome {
    /// Glicko-2 score of the outcome
    pub fn score(self) -> f64 {
        match self {
            Outcome::Win => 1.0,
            Outcome::Draw => 0.5,
            Outcome::Loss => 0.0,
        }
    }

    pub fn reversed(self) -> Outcome {
        match self {
            Outcome::Win => Outcome::Loss,
            Outcome::Draw => Outcome::Draw,
            Outcome::Loss => Outcome::Win,
        }
    }

    pub fn as_str(self) -> &'static str {
        match self {
            Outcome::Win => "win",
            Outcome::Draw => "draw",
            Outcome::Loss => "loss",
        }
    }
}

/// One player's participation in a match
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MatchEntry {
    pub id: EntryId,
    pub match_id: MatchId,
    pub player_id: PlayerId,
    pub status: EntryStatus,
    /// Only set once both entries of the match are terminal
    pub outcome: Option<Outcome>,
    pub started_at: Option<DateTime<Utc>>,
    pub ended_at: Option<DateTime<Utc>>,
}

impl MatchEntry {
    /// Time between start and end, once both are known
    pub fn duration(&self) -> Option<Duration> {
        match (self.started_at, self.ended_at) {
            (Some(start), Some(end)) => Some(end - start),
            _ => None,
        }
    }
}

/// Seed attached to a match when it starts
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MatchSeed {
    pub seed: String,
    pub generator_version: String,
    #[serde(default)]
    pub patch: Vec<u8>,
    pub spoiler_log: Option<String>,
}

/// A 1v1 pairing produced from a session at preparation time
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Match {
    pub id: MatchId,
    pub league_id: LeagueId,
    pub session_id: SessionId,
    pub entries: [MatchEntry; 2],
    pub seed: Option<MatchSeed>,
    pub created_at: DateTime<Utc>,
    pub resolved_at: Option<DateTime<Utc>>,
    /// Set once the rating update for this match has been applied
    pub rated: bool,
}

/// Glicko-2 rating of a player
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct PlayerRating {
    pub rating: f64,
    pub deviation: f64,
    pub volatility: f64,
}

impl Default for PlayerRating {
    fn default() -> Self {
        Self {
            rating: 1500.0,
            deviation: 350.0,
            volatility: 0.06,
        }
    }
}

impl PlayerRating {
    /// 95% confidence bounds (`rating ± 2×deviation`)
    pub fn bounds(&self) -> RatingBounds {
        RatingBounds {
            lower: self.rating - 2.0 * self.deviation,
            upper: self.rating + 2.0 * self.deviation,
        }
    }
}

impl From<Glicko2Rating> for PlayerRating {
    fn from(rating: Glicko2Rating) -> Self {
        Self {
            rating: rating.rating,
            deviation: rating.deviation,
            volatility: rating.volatility,
        }
    }
}

impl From<PlayerRating> for Glicko2Rating {
    fn from(rating: PlayerRating) -> Self {
        Self {
            rating: rating.rating,
            deviation: rating.deviation,
            volatility: rating.volatility,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct RatingBounds {
    pub lower: f64,
    pub upper: f64,
}

/// Registered account
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Player {
    pub id: PlayerId,
    pub name: String,
    /// Identity on the external messaging platform
    pub external_id: String,
    pub rating: PlayerRating,
    /// Start of the current inactivity period used for deviation decay
    pub rating_period_start: DateTime<Utc>,
    pub games_played: u64,
    pub created_at: DateTime<Utc>,
    /// Bumped on every committed write, used for conflict detection
    pub version: u64,
}

/// One row of a league leaderboard
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LeaderboardEntry {
    pub rank: usize,
    pub player_id: PlayerId,
    pub name: String,
    pub rating: PlayerRating,
    pub bounds: RatingBounds,
    pub games_played: u64,
}

/// Session with its league, for display
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ActiveSession {
    pub session: MatchSession,
    pub league: League,
}

/// Latest started session of a league with its matches
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SessionRecap {
    pub league: League,
    pub session: MatchSession,
    pub matches: Vec<Match>,
}
