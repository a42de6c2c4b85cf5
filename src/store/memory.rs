//! In-memory store
//!
//! Sessions are serialized through one async mutex each; the data itself sits
//! behind a single `RwLock` that is never held across an await point.

use crate::error::{LadderError, Result};
use crate::store::{LadderStore, SessionGuard, SessionTx};
use crate::types::{
    EntryId, League, LeagueId, Match, MatchSession, Player, PlayerId, SessionId, SessionStatus,
};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use std::collections::{HashMap, HashSet};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, RwLock, RwLockReadGuard, RwLockWriteGuard};
use tracing::debug;

#[derive(Debug, Default)]
struct StoreData {
    leagues: HashMap<LeagueId, League>,
    sessions: HashMap<SessionId, MatchSession>,
    /// Matches of each session, in creation order
    matches: HashMap<SessionId, Vec<Match>>,
    players: HashMap<PlayerId, Player>,
}

#[derive(Debug)]
pub struct InMemoryStore {
    data: RwLock<StoreData>,
    session_locks: Mutex<HashMap<SessionId, Arc<tokio::sync::Mutex<()>>>>,
    available: AtomicBool,
    /// Leagues whose session inserts fail
    faulty_leagues: Mutex<HashSet<LeagueId>>,
}

impl Default for InMemoryStore {
    fn default() -> Self {
        Self::new()
    }
}

impl InMemoryStore {
    pub fn new() -> Self {
        Self {
            data: RwLock::new(StoreData::default()),
            session_locks: Mutex::new(HashMap::new()),
            available: AtomicBool::new(true),
            faulty_leagues: Mutex::new(HashSet::new()),
        }
    }

    /// Simulate an outage; every operation fails with `StoreUnavailable` while false
    pub fn set_available(&self, available: bool) {
        self.available.store(available, Ordering::SeqCst);
    }

    /// Make session inserts of one league fail while the rest keeps working
    pub fn set_league_faulty(&self, league_id: LeagueId, faulty: bool) {
        if let Ok(mut leagues) = self.faulty_leagues.lock() {
            if faulty {
                leagues.insert(league_id);
            } else {
                leagues.remove(&league_id);
            }
        }
    }

    fn is_league_faulty(&self, league_id: &LeagueId) -> bool {
        self.faulty_leagues
            .lock()
            .map(|leagues| leagues.contains(league_id))
            .unwrap_or(false)
    }

    fn check_available(&self) -> Result<()> {
        if self.available.load(Ordering::SeqCst) {
            Ok(())
        } else {
            Err(LadderError::StoreUnavailable {
                message: "in-memory store marked unavailable".to_string(),
            }
            .into())
        }
    }

    fn read(&self) -> Result<RwLockReadGuard<'_, StoreData>> {
        self.check_available()?;
        Ok(self
            .data
            .read()
            .map_err(|_| LadderError::InternalError {
                message: "Failed to acquire store read lock".to_string(),
            })?)
    }

    fn write(&self) -> Result<RwLockWriteGuard<'_, StoreData>> {
        self.check_available()?;
        Ok(self
            .data
            .write()
            .map_err(|_| LadderError::InternalError {
                message: "Failed to acquire store write lock".to_string(),
            })?)
    }

    fn session_lock(&self, session_id: SessionId) -> Result<Arc<tokio::sync::Mutex<()>>> {
        let mut locks = self
            .session_locks
            .lock()
            .map_err(|_| LadderError::InternalError {
                message: "Failed to acquire session lock table".to_string(),
            })?;
        Ok(locks.entry(session_id).or_default().clone())
    }

    /// Drop the locks of closed sessions nobody holds or waits for.
    ///
    /// A caller can only get a lock through the table, so a count of one
    /// means the entry is unreachable apart from the table itself.
    fn prune_session_locks(&self, data: &StoreData) -> Result<usize> {
        let mut locks = self
            .session_locks
            .lock()
            .map_err(|_| LadderError::InternalError {
                message: "Failed to acquire session lock table".to_string(),
            })?;
        let before = locks.len();
        locks.retain(|session_id, lock| {
            let closed = data
                .sessions
                .get(session_id)
                .map_or(true, |s| s.status == SessionStatus::Closed);
            !closed || Arc::strong_count(lock) > 1
        });
        Ok(before - locks.len())
    }

    fn load_tx(&self, guard: SessionGuard, session_id: SessionId) -> Result<SessionTx> {
        let data = self.read()?;

        let session = data
            .sessions
            .get(&session_id)
            .cloned()
            .ok_or_else(|| LadderError::SessionNotFound {
                session_id: session_id.to_string(),
            })?;
        let league = data
            .leagues
            .get(&session.league_id)
            .cloned()
            .ok_or_else(|| LadderError::InternalError {
                message: format!("session {} references a missing league", session_id),
            })?;
        let matches = data.matches.get(&session_id).cloned().unwrap_or_default();

        let mut player_ids: HashSet<PlayerId> = session.player_ids.iter().copied().collect();
        player_ids.extend(session.kicked_player_id);
        for race in &matches {
            player_ids.extend(race.entries.iter().map(|e| e.player_id));
        }
        let players = player_ids
            .iter()
            .filter_map(|id| data.players.get(id).cloned())
            .collect();

        Ok(SessionTx::new(guard, session, league, matches, players))
    }
}

#[async_trait]
impl LadderStore for InMemoryStore {
    async fn begin_session(&self, session_id: SessionId) -> Result<SessionTx> {
        self.check_available()?;
        let lock = self.session_lock(session_id)?;
        let guard = SessionGuard::new(lock.lock_owned().await);
        self.load_tx(guard, session_id)
    }

    async fn commit(&self, tx: SessionTx) -> Result<SessionGuard> {
        let (guard, session, matches, players) = tx.into_parts();
        let mut data = self.write()?;

        for player in &players {
            let stored = data
                .players
                .get(&player.id)
                .ok_or_else(|| LadderError::PlayerNotFound {
                    player_id: player.id.to_string(),
                })?;
            if stored.version != player.version {
                return Err(LadderError::TransactionConflict {
                    resource: format!("player {}", player.id),
                }
                .into());
            }
        }

        for mut player in players {
            player.version += 1;
            data.players.insert(player.id, player);
        }
        debug!("Committed session {} ({})", session.id, session.status);
        data.matches.insert(session.id, matches);
        data.sessions.insert(session.id, session);

        Ok(guard)
    }

    async fn insert_league(&self, league: League) -> Result<()> {
        let mut data = self.write()?;
        let duplicate = data
            .leagues
            .values()
            .any(|l| l.short_code == league.short_code && l.id != league.id);
        if duplicate {
            return Err(LadderError::ConfigurationError {
                message: format!("duplicate league short code `{}`", league.short_code),
            }
            .into());
        }
        data.leagues.insert(league.id, league);
        Ok(())
    }

    async fn get_league(&self, league_id: LeagueId) -> Result<Option<League>> {
        Ok(self.read()?.leagues.get(&league_id).cloned())
    }

    async fn league_by_short_code(&self, short_code: &str) -> Result<Option<League>> {
        Ok(self
            .read()?
            .leagues
            .values()
            .find(|l| l.short_code == short_code)
            .cloned())
    }

    async fn list_leagues(&self) -> Result<Vec<League>> {
        let mut leagues: Vec<League> = self.read()?.leagues.values().cloned().collect();
        leagues.sort_by(|a, b| a.short_code.cmp(&b.short_code));
        Ok(leagues)
    }

    async fn insert_session(&self, session: MatchSession) -> Result<()> {
        if self.is_league_faulty(&session.league_id) {
            return Err(LadderError::InternalError {
                message: format!("write to league {} rejected", session.league_id),
            }
            .into());
        }
        let mut data = self.write()?;

        if !data.leagues.contains_key(&session.league_id) {
            return Err(LadderError::InternalError {
                message: format!("unknown league {}", session.league_id),
            }
            .into());
        }
        let has_active = data
            .sessions
            .values()
            .any(|s| s.league_id == session.league_id && s.status.is_active());
        if has_active {
            return Err(LadderError::TransactionConflict {
                resource: format!("active session of league {}", session.league_id),
            }
            .into());
        }

        data.sessions.insert(session.id, session);
        Ok(())
    }

    async fn get_session(&self, session_id: SessionId) -> Result<Option<MatchSession>> {
        Ok(self.read()?.sessions.get(&session_id).cloned())
    }

    async fn active_session_ids(&self) -> Result<Vec<SessionId>> {
        let data = self.read()?;
        let mut sessions: Vec<&MatchSession> = data
            .sessions
            .values()
            .filter(|s| s.status.is_active())
            .collect();
        sessions.sort_by_key(|s| s.start_date);
        let ids = sessions.into_iter().map(|s| s.id).collect();

        let pruned = self.prune_session_locks(&data)?;
        if pruned > 0 {
            debug!("Released {} locks of closed sessions", pruned);
        }
        Ok(ids)
    }

    async fn sessions_for_league(&self, league_id: LeagueId) -> Result<Vec<MatchSession>> {
        let mut sessions: Vec<MatchSession> = self
            .read()?
            .sessions
            .values()
            .filter(|s| s.league_id == league_id)
            .cloned()
            .collect();
        sessions.sort_by_key(|s| s.start_date);
        Ok(sessions)
    }

    async fn sessions_since(&self, closed_since: DateTime<Utc>) -> Result<Vec<MatchSession>> {
        let mut sessions: Vec<MatchSession> = self
            .read()?
            .sessions
            .values()
            .filter(|s| s.status.is_active() || s.closed_at.is_some_and(|at| at >= closed_since))
            .cloned()
            .collect();
        sessions.sort_by_key(|s| s.start_date);
        Ok(sessions)
    }

    async fn session_matches(&self, session_id: SessionId) -> Result<Vec<Match>> {
        Ok(self
            .read()?
            .matches
            .get(&session_id)
            .cloned()
            .unwrap_or_default())
    }

    async fn find_entry_session(&self, entry_id: EntryId) -> Result<Option<SessionId>> {
        let data = self.read()?;
        Ok(data
            .matches
            .values()
            .flatten()
            .find(|m| m.entries.iter().any(|e| e.id == entry_id))
            .map(|m| m.session_id))
    }

    async fn active_entries(&self, player_id: PlayerId) -> Result<Vec<(LeagueId, EntryId)>> {
        let data = self.read()?;
        let mut sessions: Vec<&MatchSession> = data
            .sessions
            .values()
            .filter(|s| s.status == SessionStatus::InProgress)
            .collect();
        sessions.sort_by_key(|s| (s.start_date, s.id));

        Ok(sessions
            .into_iter()
            .filter_map(|s| data.matches.get(&s.id).map(|m| (s.league_id, m)))
            .flat_map(|(league_id, matches)| {
                matches
                    .iter()
                    .flat_map(|m| m.entries.iter())
                    .filter(|e| e.player_id == player_id && !e.status.is_terminal())
                    .map(move |e| (league_id, e.id))
            })
            .collect())
    }

    async fn insert_player(&self, player: Player) -> Result<()> {
        let mut data = self.write()?;
        if data
            .players
            .values()
            .any(|p| p.external_id == player.external_id)
        {
            return Err(LadderError::PlayerAlreadyRegistered {
                external_id: player.external_id,
            }
            .into());
        }
        data.players.insert(player.id, player);
        Ok(())
    }

    async fn get_player(&self, player_id: PlayerId) -> Result<Option<Player>> {
        Ok(self.read()?.players.get(&player_id).cloned())
    }

    async fn player_by_external_id(&self, external_id: &str) -> Result<Option<Player>> {
        Ok(self
            .read()?
            .players
            .values()
            .find(|p| p.external_id == external_id)
            .cloned())
    }

    async fn update_player(&self, mut player: Player) -> Result<Player> {
        let mut data = self.write()?;
        let stored = data
            .players
            .get(&player.id)
            .ok_or_else(|| LadderError::PlayerNotFound {
                player_id: player.id.to_string(),
            })?;
        if stored.version != player.version {
            return Err(LadderError::TransactionConflict {
                resource: format!("player {}", player.id),
            }
            .into());
        }

        player.version += 1;
        data.players.insert(player.id, player.clone());
        Ok(player)
    }

    async fn list_players(&self) -> Result<Vec<Player>> {
        Ok(self.read()?.players.values().cloned().collect())
    }

    async fn players_for_league(&self, league_id: LeagueId) -> Result<Vec<Player>> {
        let data = self.read()?;
        let ids: HashSet<PlayerId> = data
            .matches
            .values()
            .flatten()
            .filter(|m| m.league_id == league_id)
            .flat_map(|m| m.entries.iter().map(|e| e.player_id))
            .collect();
        Ok(ids
            .iter()
            .filter_map(|id| data.players.get(id).cloned())
            .collect())
    }
}
