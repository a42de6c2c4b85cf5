//! Session and match state transitions
//!
//! Pure rules over `MatchSession` and `Match` values: which phase change is
//! due, who may join or leave, how entries resolve. No I/O happens here; the
//! manager applies these inside a store transaction.

use crate::error::{LadderError, Result};
use crate::types::{
    EntryStatus, League, Match, MatchEntry, MatchSeed, MatchSession, Outcome, PlayerId,
    SessionStatus,
};
use crate::utils::generate_id;
use chrono::{DateTime, Utc};

impl MatchSession {
    /// New `Waiting` session of `league` starting at `start_date`
    pub fn new(league: &League, start_date: DateTime<Utc>, now: DateTime<Utc>) -> Self {
        Self {
            id: generate_id(),
            league_id: league.id,
            start_date,
            status: SessionStatus::Waiting,
            player_ids: Vec::new(),
            kicked_player_id: None,
            countdowns_sent: Vec::new(),
            created_at: now,
            closed_at: None,
        }
    }

    pub fn joinable_at(&self, league: &League) -> DateTime<Utc> {
        self.start_date - league.joinable_offset()
    }

    pub fn preparation_at(&self, league: &League) -> DateTime<Utc> {
        self.start_date - league.preparation_offset()
    }

    /// The next time-triggered status, if its deadline has passed.
    ///
    /// Only one step is ever returned; closing an in-progress session depends
    /// on its matches and is not time-triggered.
    pub fn due_transition(&self, league: &League, now: DateTime<Utc>) -> Option<SessionStatus> {
        let due = match self.status {
            SessionStatus::Waiting => now >= self.joinable_at(league),
            SessionStatus::Joinable => now >= self.preparation_at(league),
            SessionStatus::Preparing => now >= self.start_date,
            SessionStatus::InProgress | SessionStatus::Closed => false,
        };
        if due {
            self.status.next()
        } else {
            None
        }
    }

    pub fn has_player(&self, player_id: &PlayerId) -> bool {
        self.player_ids.contains(player_id)
    }

    pub fn add_player(&mut self, player_id: PlayerId) -> Result<()> {
        if self.status != SessionStatus::Joinable {
            return Err(LadderError::InvalidPhase {
                action: "join",
                status: self.status,
            }
            .into());
        }
        if self.has_player(&player_id) {
            return Err(LadderError::AlreadyJoined {
                player_id: player_id.to_string(),
            }
            .into());
        }

        self.player_ids.push(player_id);
        Ok(())
    }

    pub fn remove_player(&mut self, player_id: &PlayerId) -> Result<()> {
        if !matches!(self.status, SessionStatus::Waiting | SessionStatus::Joinable) {
            return Err(LadderError::InvalidPhase {
                action: "cancel",
                status: self.status,
            }
            .into());
        }

        let index = self
            .player_ids
            .iter()
            .position(|id| id == player_id)
            .ok_or_else(|| LadderError::NotJoined {
                player_id: player_id.to_string(),
            })?;
        self.player_ids.remove(index);
        Ok(())
    }

    /// Drop the last player to join when the count is odd
    pub fn kick_odd_player(&mut self) -> Option<PlayerId> {
        if self.player_ids.len() % 2 == 0 {
            return None;
        }
        let kicked = self.player_ids.pop();
        self.kicked_player_id = kicked;
        kicked
    }

    /// Move to `next`, which must directly follow the current status.
    ///
    /// The one exception is an empty session closing at preparation time.
    pub fn set_status(&mut self, next: SessionStatus, now: DateTime<Utc>) -> Result<()> {
        let allowed = self.status.next() == Some(next)
            || (self.status == SessionStatus::Joinable
                && next == SessionStatus::Closed
                && self.player_ids.is_empty());
        if !allowed {
            return Err(LadderError::InternalError {
                message: format!(
                    "illegal session transition {} -> {} for {}",
                    self.status, next, self.id
                ),
            }
            .into());
        }

        self.status = next;
        if next == SessionStatus::Closed {
            self.closed_at = Some(now);
        }
        Ok(())
    }

    /// Countdown marks crossed at `now` and not yet announced, largest first
    pub fn pending_countdowns(&self, marks: &[i64], now: DateTime<Utc>) -> Vec<i64> {
        let left = (self.start_date - now).num_seconds();
        let mut pending: Vec<i64> = marks
            .iter()
            .copied()
            .filter(|mark| *mark > 0 && left <= *mark && !self.countdowns_sent.contains(mark))
            .collect();
        pending.sort_unstable_by(|a, b| b.cmp(a));
        pending.dedup();
        pending
    }
}

impl MatchEntry {
    fn new(match_id: crate::types::MatchId, player_id: PlayerId) -> Self {
        Self {
            id: generate_id(),
            match_id,
            player_id,
            status: EntryStatus::Waiting,
            outcome: None,
            started_at: None,
            ended_at: None,
        }
    }

    fn finish(&mut self, status: EntryStatus, now: DateTime<Utc>) -> Result<()> {
        if self.status.is_terminal() {
            return Err(LadderError::EntryAlreadyTerminal {
                entry_id: self.id.to_string(),
            }
            .into());
        }

        self.status = status;
        self.started_at.get_or_insert(now);
        self.ended_at = Some(now);
        Ok(())
    }
}

impl Match {
    /// Pair two players of a session
    pub fn new(session: &MatchSession, first: PlayerId, second: PlayerId, now: DateTime<Utc>) -> Self {
        let id = generate_id();
        Self {
            id,
            league_id: session.league_id,
            session_id: session.id,
            entries: [MatchEntry::new(id, first), MatchEntry::new(id, second)],
            seed: None,
            created_at: now,
            resolved_at: None,
            rated: false,
        }
    }

    /// Attach the seed and start both entries
    pub fn start(&mut self, seed: MatchSeed, now: DateTime<Utc>) {
        self.seed = Some(seed);
        for entry in self.entries.iter_mut() {
            if entry.status == EntryStatus::Waiting {
                entry.status = EntryStatus::InProgress;
                entry.started_at = Some(now);
            }
        }
    }

    pub fn entry_index(&self, entry_id: &crate::types::EntryId) -> Option<usize> {
        self.entries.iter().position(|e| e.id == *entry_id)
    }

    pub fn complete_entry(&mut self, index: usize, now: DateTime<Utc>) -> Result<()> {
        self.entries[index].finish(EntryStatus::Finished, now)
    }

    pub fn forfeit_entry(&mut self, index: usize, now: DateTime<Utc>) -> Result<()> {
        self.entries[index].finish(EntryStatus::Forfeit, now)
    }

    pub fn is_resolved(&self) -> bool {
        self.resolved_at.is_some()
    }

    /// Derive outcomes once both entries are terminal.
    ///
    /// Returns the first entry's outcome when this call resolved the match.
    /// A forfeit loses against a finish; two forfeits or equal times draw.
    pub fn resolve(&mut self, now: DateTime<Utc>) -> Option<Outcome> {
        if self.is_resolved() || !self.entries.iter().all(|e| e.status.is_terminal()) {
            return None;
        }

        let [first, second] = &self.entries;
        let outcome = match (first.status, second.status) {
            (EntryStatus::Forfeit, EntryStatus::Forfeit) => Outcome::Draw,
            (EntryStatus::Forfeit, _) => Outcome::Loss,
            (_, EntryStatus::Forfeit) => Outcome::Win,
            _ => match (first.duration(), second.duration()) {
                (Some(a), Some(b)) if a < b => Outcome::Win,
                (Some(a), Some(b)) if a > b => Outcome::Loss,
                _ => Outcome::Draw,
            },
        };

        self.entries[0].outcome = Some(outcome);
        self.entries[1].outcome = Some(outcome.reversed());
        self.resolved_at = Some(now);
        Some(outcome)
    }
}
