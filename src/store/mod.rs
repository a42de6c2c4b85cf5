//! Persistent store interface
//!
//! All session state changes go through a `SessionTx`: an exclusive,
//! per-session working copy that is either committed as a whole or dropped.

pub mod memory;

pub use memory::InMemoryStore;

use crate::error::Result;
use crate::types::{
    EntryId, League, LeagueId, Match, MatchSession, Player, PlayerId, SessionId,
};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use std::collections::{HashMap, HashSet};
use tokio::sync::OwnedMutexGuard;

/// Exclusive hold on one session.
///
/// Returned by `commit` so the caller can finish follow-up work (queueing
/// notifications) before the next transaction on the same session starts.
pub struct SessionGuard {
    _lock: OwnedMutexGuard<()>,
}

impl SessionGuard {
    pub fn new(lock: OwnedMutexGuard<()>) -> Self {
        Self { _lock: lock }
    }
}

/// Working copy of a session and everything a state change may touch
pub struct SessionTx {
    pub session: MatchSession,
    pub league: League,
    pub matches: Vec<Match>,
    players: HashMap<PlayerId, Player>,
    dirty_players: HashSet<PlayerId>,
    guard: SessionGuard,
}

impl SessionTx {
    pub fn new(
        guard: SessionGuard,
        session: MatchSession,
        league: League,
        matches: Vec<Match>,
        players: Vec<Player>,
    ) -> Self {
        Self {
            session,
            league,
            matches,
            players: players.into_iter().map(|p| (p.id, p)).collect(),
            dirty_players: HashSet::new(),
            guard,
        }
    }

    /// Snapshot of a participant, as loaded when the transaction began
    pub fn player(&self, player_id: &PlayerId) -> Option<&Player> {
        self.players.get(player_id)
    }

    /// Stage a player write; the commit fails if the stored row moved on meanwhile
    pub fn update_player(&mut self, player: Player) {
        self.dirty_players.insert(player.id);
        self.players.insert(player.id, player);
    }

    /// Split into the parts a store writes back
    pub fn into_parts(self) -> (SessionGuard, MatchSession, Vec<Match>, Vec<Player>) {
        let dirty = self.dirty_players;
        let players = self
            .players
            .into_values()
            .filter(|p| dirty.contains(&p.id))
            .collect();
        (self.guard, self.session, self.matches, players)
    }
}

/// Transactional storage of leagues, sessions, matches and players
#[async_trait]
pub trait LadderStore: Send + Sync {
    /// Lock a session and load its working copy
    async fn begin_session(&self, session_id: SessionId) -> Result<SessionTx>;

    /// Write a transaction back atomically.
    ///
    /// Fails with `TransactionConflict` if a staged player was modified since
    /// the transaction began; nothing is written in that case.
    async fn commit(&self, tx: SessionTx) -> Result<SessionGuard>;

    async fn insert_league(&self, league: League) -> Result<()>;

    async fn get_league(&self, league_id: LeagueId) -> Result<Option<League>>;

    async fn league_by_short_code(&self, short_code: &str) -> Result<Option<League>>;

    async fn list_leagues(&self) -> Result<Vec<League>>;

    /// Insert a new session; a league has at most one session that is not closed
    async fn insert_session(&self, session: MatchSession) -> Result<()>;

    async fn get_session(&self, session_id: SessionId) -> Result<Option<MatchSession>>;

    async fn active_session_ids(&self) -> Result<Vec<SessionId>>;

    async fn sessions_for_league(&self, league_id: LeagueId) -> Result<Vec<MatchSession>>;

    /// Sessions not closed, plus sessions closed at or after `closed_since`
    async fn sessions_since(&self, closed_since: DateTime<Utc>) -> Result<Vec<MatchSession>>;

    async fn session_matches(&self, session_id: SessionId) -> Result<Vec<Match>>;

    /// Session owning a match entry
    async fn find_entry_session(&self, entry_id: EntryId) -> Result<Option<SessionId>>;

    /// Non-terminal entries of a player in sessions that are in progress,
    /// with the league of each, ordered by session start
    async fn active_entries(&self, player_id: PlayerId) -> Result<Vec<(LeagueId, EntryId)>>;

    /// Fails with `PlayerAlreadyRegistered` on a duplicate external id
    async fn insert_player(&self, player: Player) -> Result<()>;

    async fn get_player(&self, player_id: PlayerId) -> Result<Option<Player>>;

    async fn player_by_external_id(&self, external_id: &str) -> Result<Option<Player>>;

    /// Versioned write outside any session; returns the stored row
    async fn update_player(&self, player: Player) -> Result<Player>;

    async fn list_players(&self) -> Result<Vec<Player>>;

    /// Players with at least one match in the league
    async fn players_for_league(&self, league_id: LeagueId) -> Result<Vec<Player>>;
}
