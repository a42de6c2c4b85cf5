//! Session manager
//!
//! Owns the session lifecycle. Every change to a session runs inside one
//! store transaction; notifications and metrics are only emitted after the
//! commit succeeded, while the session is still locked, so announcements for
//! one session leave in the order their changes were made.

use crate::error::{ladder_error, LadderError, Result};
use crate::metrics::MetricsCollector;
use crate::notification::{render, Notification, NotificationPublisher};
use crate::rating::{build_leaderboard, RatingChange, RatingEngine};
use crate::session::matching::{Matchmaker, RandomMatchmaker};
use crate::session::seed::{random_seed_string, SeedGenerator, UnpatchedSeedGenerator};
use crate::store::{LadderStore, SessionTx};
use crate::types::{
    ActiveSession, EntryId, EntryStatus, LeaderboardEntry, League, LeagueId, Match, MatchId,
    MatchSeed, MatchSession, Outcome, Player, PlayerId, SessionId, SessionRecap, SessionStatus,
};
use crate::utils::{generate_id, Clock, SystemClock};
use chrono::{DateTime, Duration, Utc};
use serde::Serialize;
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Instant;
use tracing::{debug, error, info, warn};

/// Attempts for a transaction that lost a race on a player row
const MAX_COMMIT_ATTEMPTS: usize = 3;

/// Upper bound of transitions applied to one session per sweep
const MAX_STEPS_PER_SWEEP: usize = 5;

const MAX_NAME_LENGTH: usize = 32;

/// Everything a committed transaction announces
#[derive(Default)]
struct Effects {
    notifications: Vec<Notification>,
    transitions: Vec<(SessionStatus, SessionStatus)>,
    odd_kick: bool,
    empty_session: bool,
    matches_created: usize,
    resolved: Vec<Outcome>,
    rating_updates: Vec<f64>,
    decay_steps: u32,
}

impl Effects {
    fn transition(&mut self, from: SessionStatus, to: SessionStatus) {
        self.transitions.push((from, to));
    }
}

/// Decision of one advancement step
enum Advance {
    Idle,
    Countdown,
    Moved(SessionStatus),
    /// Start is due but seeds must be generated first, outside the lock
    NeedsSeeds,
}

/// Outcome of one sweep over the active sessions
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct TickReport {
    pub sessions: usize,
    pub created: usize,
    pub transitions: usize,
    pub failed: usize,
}

pub struct SessionManager {
    store: Arc<dyn LadderStore>,
    notifier: Arc<dyn NotificationPublisher>,
    matchmaker: Arc<dyn Matchmaker>,
    seed_generator: Arc<dyn SeedGenerator>,
    rating_engine: RatingEngine,
    clock: Arc<dyn Clock>,
    metrics: Option<Arc<MetricsCollector>>,
    countdown_marks: Vec<i64>,
    recent_window: Duration,
}

fn is_conflict(err: &anyhow::Error) -> bool {
    matches!(
        ladder_error(err),
        Some(LadderError::TransactionConflict { .. })
    )
}

fn is_unavailable(err: &anyhow::Error) -> bool {
    matches!(ladder_error(err), Some(LadderError::StoreUnavailable { .. }))
}

fn all_resolved(matches: &[Match]) -> bool {
    matches.iter().all(Match::is_resolved)
}

fn internal(message: String) -> anyhow::Error {
    LadderError::InternalError { message }.into()
}

fn apply_change(mut player: Player, change: &RatingChange, now: DateTime<Utc>) -> Player {
    player.rating = change.new_rating;
    player.rating_period_start = now;
    player.games_played += 1;
    player
}

/// Trimmed display name, or why it is refused
pub fn validate_name(name: &str) -> Result<String> {
    let name = name.trim();
    let reason = if name.is_empty() {
        Some("the name cannot be empty")
    } else if name.chars().count() > MAX_NAME_LENGTH {
        Some("the name is longer than 32 characters")
    } else if name.chars().any(|c| c.is_control() || c == '`' || c == '@') {
        Some("the name contains forbidden characters")
    } else {
        None
    };

    match reason {
        Some(reason) => Err(LadderError::InvalidName {
            reason: reason.to_string(),
        }
        .into()),
        None => Ok(name.to_string()),
    }
}

impl SessionManager {
    pub fn new(
        store: Arc<dyn LadderStore>,
        notifier: Arc<dyn NotificationPublisher>,
        rating_engine: RatingEngine,
    ) -> Self {
        Self {
            store,
            notifier,
            matchmaker: Arc::new(RandomMatchmaker),
            seed_generator: Arc::new(UnpatchedSeedGenerator),
            rating_engine,
            clock: Arc::new(SystemClock),
            metrics: None,
            countdown_marks: vec![300, 60, 30, 5],
            recent_window: Duration::hours(24),
        }
    }

    pub fn with_matchmaker(mut self, matchmaker: Arc<dyn Matchmaker>) -> Self {
        self.matchmaker = matchmaker;
        self
    }

    pub fn with_seed_generator(mut self, seed_generator: Arc<dyn SeedGenerator>) -> Self {
        self.seed_generator = seed_generator;
        self
    }

    pub fn with_clock(mut self, clock: Arc<dyn Clock>) -> Self {
        self.clock = clock;
        self
    }

    pub fn with_metrics(mut self, metrics: Arc<MetricsCollector>) -> Self {
        self.metrics = Some(metrics);
        self
    }

    pub fn with_countdown_marks(mut self, marks: Vec<i64>) -> Self {
        self.countdown_marks = marks;
        self
    }

    /// How long closed sessions keep showing up in `get_active_sessions_around_now`
    pub fn with_recent_window(mut self, window: Duration) -> Self {
        self.recent_window = window;
        self
    }

    pub fn store(&self) -> Arc<dyn LadderStore> {
        self.store.clone()
    }

    pub fn now(&self) -> DateTime<Utc> {
        self.clock.now()
    }

    // ----- transaction plumbing -----

    /// Run `apply` against a fresh working copy of the session and commit it.
    ///
    /// `apply` is re-run from scratch when the commit loses a race on a player
    /// row. An error from `apply` drops the working copy untouched.
    async fn transact<T, F>(&self, session_id: SessionId, mut apply: F) -> Result<T>
    where
        F: FnMut(&mut SessionTx, DateTime<Utc>, &mut Effects) -> Result<T>,
    {
        let mut attempt = 1;
        loop {
            let mut tx = self.store.begin_session(session_id).await?;
            let now = self.clock.now();
            let mut effects = Effects::default();
            let value = apply(&mut tx, now, &mut effects)?;

            match self.store.commit(tx).await {
                Ok(guard) => {
                    self.emit(effects).await;
                    drop(guard);
                    return Ok(value);
                }
                Err(e) if attempt < MAX_COMMIT_ATTEMPTS && is_conflict(&e) => {
                    debug!(
                        "Commit on session {} conflicted (attempt {}): {:#}",
                        session_id, attempt, e
                    );
                    attempt += 1;
                }
                Err(e) => return Err(e),
            }
        }
    }

    async fn emit(&self, effects: Effects) {
        if let Some(metrics) = &self.metrics {
            for (from, to) in &effects.transitions {
                metrics.record_transition(*from, *to);
            }
            if effects.odd_kick {
                metrics.record_odd_kick();
            }
            if effects.empty_session {
                metrics.record_empty_session();
            }
            if effects.matches_created > 0 {
                metrics.record_matches_created(effects.matches_created);
            }
            for outcome in &effects.resolved {
                metrics.record_match_resolved(*outcome);
            }
            for rating in &effects.rating_updates {
                metrics.record_rating_update(*rating);
            }
            metrics.record_decay_steps(effects.decay_steps);
        }

        for notification in effects.notifications {
            self.notifier.publish(notification).await;
        }
    }

    fn observe<T>(&self, action: &str, started: Instant, result: &Result<T>) {
        if let Err(e) = result {
            debug!("{} failed: {:#}", action, e);
        }
        if let Some(metrics) = &self.metrics {
            metrics.record_action(action, result.is_ok(), started.elapsed());
        }
    }

    async fn require_player(&self, player_id: PlayerId) -> Result<Player> {
        self.store
            .get_player(player_id)
            .await?
            .ok_or_else(|| {
                LadderError::PlayerNotFound {
                    player_id: player_id.to_string(),
                }
                .into()
            })
    }

    async fn league_by_code(&self, short_code: &str) -> Result<League> {
        let short_code = short_code.trim().to_lowercase();
        self.store
            .league_by_short_code(&short_code)
            .await?
            .ok_or_else(|| LadderError::LeagueNotFound { short_code }.into())
    }

    /// The league's session that is not closed yet
    async fn current_session(&self, league: &League) -> Result<MatchSession> {
        self.store
            .sessions_for_league(league.id)
            .await?
            .into_iter()
            .find(|s| s.status.is_active())
            .ok_or_else(|| {
                LadderError::NoUpcomingSession {
                    short_code: league.short_code.clone(),
                }
                .into()
            })
    }

    // ----- player actions -----

    /// Add a player to a joinable session
    pub async fn join(&self, session_id: SessionId, player_id: PlayerId) -> Result<()> {
        let started = Instant::now();
        let result = async {
            self.require_player(player_id).await?;
            self.transact(session_id, |tx, _, _| tx.session.add_player(player_id))
                .await?;
            info!("Player {} joined session {}", player_id, session_id);
            Ok(())
        }
        .await;
        self.observe("join", started, &result);
        result
    }

    /// Remove a player from a session that has not started preparing
    pub async fn cancel(&self, session_id: SessionId, player_id: PlayerId) -> Result<()> {
        let started = Instant::now();
        let result = self
            .transact(session_id, |tx, _, _| tx.session.remove_player(&player_id))
            .await;
        if result.is_ok() {
            info!("Player {} left session {}", player_id, session_id);
        }
        self.observe("cancel", started, &result);
        result
    }

    /// Join the current session of a league
    pub async fn join_league(&self, short_code: &str, player_id: PlayerId) -> Result<SessionId> {
        let league = self.league_by_code(short_code).await?;
        let session = self.current_session(&league).await?;
        self.join(session.id, player_id).await?;
        Ok(session.id)
    }

    /// Leave the current session of a league
    pub async fn cancel_league(&self, short_code: &str, player_id: PlayerId) -> Result<SessionId> {
        let league = self.league_by_code(short_code).await?;
        let session = self.current_session(&league).await?;
        self.cancel(session.id, player_id).await?;
        Ok(session.id)
    }

    /// Record a finished race
    pub async fn complete(&self, entry_id: EntryId) -> Result<()> {
        let started = Instant::now();
        let result = self.finish_entry(entry_id, EntryStatus::Finished).await;
        self.observe("complete", started, &result);
        result
    }

    /// Record an abandoned race
    pub async fn forfeit(&self, entry_id: EntryId) -> Result<()> {
        let started = Instant::now();
        let result = self.finish_entry(entry_id, EntryStatus::Forfeit).await;
        self.observe("forfeit", started, &result);
        result
    }

    /// `complete` for the player's entry in the race they are running.
    ///
    /// Fails with `AmbiguousEntry` when the player runs races in more than one
    /// league; `complete_in_league` names the race instead.
    pub async fn complete_for_player(&self, player_id: PlayerId) -> Result<EntryId> {
        let entry_id = self.active_entry(player_id, None).await?;
        self.complete(entry_id).await?;
        Ok(entry_id)
    }

    /// `forfeit` for the player's entry in the race they are running
    pub async fn forfeit_for_player(&self, player_id: PlayerId) -> Result<EntryId> {
        let entry_id = self.active_entry(player_id, None).await?;
        self.forfeit(entry_id).await?;
        Ok(entry_id)
    }

    /// `complete` for the player's entry in the running race of a league
    pub async fn complete_in_league(
        &self,
        short_code: &str,
        player_id: PlayerId,
    ) -> Result<EntryId> {
        let league = self.league_by_code(short_code).await?;
        let entry_id = self.active_entry(player_id, Some(league.id)).await?;
        self.complete(entry_id).await?;
        Ok(entry_id)
    }

    /// `forfeit` for the player's entry in the running race of a league
    pub async fn forfeit_in_league(
        &self,
        short_code: &str,
        player_id: PlayerId,
    ) -> Result<EntryId> {
        let league = self.league_by_code(short_code).await?;
        let entry_id = self.active_entry(player_id, Some(league.id)).await?;
        self.forfeit(entry_id).await?;
        Ok(entry_id)
    }

    async fn active_entry(
        &self,
        player_id: PlayerId,
        league_id: Option<LeagueId>,
    ) -> Result<EntryId> {
        let entries: Vec<(LeagueId, EntryId)> = self
            .store
            .active_entries(player_id)
            .await?
            .into_iter()
            .filter(|(league, _)| league_id.map_or(true, |id| id == *league))
            .collect();

        match entries.as_slice() {
            [] => Err(LadderError::NoActiveEntry {
                player_id: player_id.to_string(),
            }
            .into()),
            [(_, entry_id)] => Ok(*entry_id),
            _ => {
                let mut leagues = Vec::new();
                for (league_id, _) in &entries {
                    if let Some(league) = self.store.get_league(*league_id).await? {
                        if !leagues.contains(&league.short_code) {
                            leagues.push(league.short_code);
                        }
                    }
                }
                Err(LadderError::AmbiguousEntry {
                    player_id: player_id.to_string(),
                    leagues: leagues.join(", "),
                }
                .into())
            }
        }
    }

    async fn finish_entry(&self, entry_id: EntryId, status: EntryStatus) -> Result<()> {
        let action = if status == EntryStatus::Forfeit {
            "forfeit"
        } else {
            "complete"
        };
        let session_id = self
            .store
            .find_entry_session(entry_id)
            .await?
            .ok_or_else(|| LadderError::EntryNotFound {
                entry_id: entry_id.to_string(),
            })?;

        let closed = self
            .transact(session_id, |tx, now, effects| {
                if tx.session.status != SessionStatus::InProgress {
                    return Err(LadderError::InvalidPhase {
                        action,
                        status: tx.session.status,
                    }
                    .into());
                }

                let (race_index, entry_index) = tx
                    .matches
                    .iter()
                    .enumerate()
                    .find_map(|(i, m)| m.entry_index(&entry_id).map(|e| (i, e)))
                    .ok_or_else(|| LadderError::EntryNotFound {
                        entry_id: entry_id.to_string(),
                    })?;

                let race = &mut tx.matches[race_index];
                if status == EntryStatus::Forfeit {
                    race.forfeit_entry(entry_index, now)?;
                } else {
                    race.complete_entry(entry_index, now)?;
                }
                if let Some(outcome) = race.resolve(now) {
                    debug!("Match {} resolved ({} for first entry)", race.id, outcome.as_str());
                    effects.resolved.push(outcome);
                }

                if all_resolved(&tx.matches) {
                    self.close_in_tx(tx, now, effects)?;
                    return Ok(true);
                }
                Ok(false)
            })
            .await?;

        info!("Entry {} marked {}", entry_id, action);
        if closed {
            info!("Session {} closed after its last match resolved", session_id);
        }
        Ok(())
    }

    /// Forfeit every unfinished entry of an in-progress session and close it
    pub async fn force_close(&self, session_id: SessionId) -> Result<()> {
        let started = Instant::now();
        let result = self
            .transact(session_id, |tx, now, effects| {
                if tx.session.status != SessionStatus::InProgress {
                    return Err(LadderError::InvalidPhase {
                        action: "force close",
                        status: tx.session.status,
                    }
                    .into());
                }

                for race in tx.matches.iter_mut() {
                    for index in 0..race.entries.len() {
                        if !race.entries[index].status.is_terminal() {
                            race.forfeit_entry(index, now)?;
                        }
                    }
                    if let Some(outcome) = race.resolve(now) {
                        effects.resolved.push(outcome);
                    }
                }
                self.close_in_tx(tx, now, effects)
            })
            .await;
        if result.is_ok() {
            warn!("Session {} was force-closed", session_id);
        }
        self.observe("force_close", started, &result);
        result
    }

    // ----- phase advancement -----

    /// Apply at most one due transition (or countdown) to a session.
    ///
    /// Returns the status entered, if any. Calling it again when nothing is
    /// due is a no-op.
    pub async fn advance_session(&self, session_id: SessionId) -> Result<Option<SessionStatus>> {
        let step = self
            .transact(session_id, |tx, now, effects| {
                self.advance_in_tx(tx, now, effects)
            })
            .await?;

        match step {
            Advance::Idle | Advance::Countdown => Ok(None),
            Advance::Moved(status) => Ok(Some(status)),
            Advance::NeedsSeeds => self.start_session(session_id).await,
        }
    }

    fn advance_in_tx(
        &self,
        tx: &mut SessionTx,
        now: DateTime<Utc>,
        effects: &mut Effects,
    ) -> Result<Advance> {
        match tx.session.status {
            SessionStatus::Closed => return Ok(Advance::Idle),
            SessionStatus::InProgress => {
                if all_resolved(&tx.matches) {
                    self.close_in_tx(tx, now, effects)?;
                    return Ok(Advance::Moved(SessionStatus::Closed));
                }
                return Ok(Advance::Idle);
            }
            _ => {}
        }

        match tx.session.due_transition(&tx.league, now) {
            Some(SessionStatus::Joinable) => {
                tx.session.set_status(SessionStatus::Joinable, now)?;
                effects.transition(SessionStatus::Waiting, SessionStatus::Joinable);
                effects
                    .notifications
                    .push(render::session_status(&tx.league, &tx.session, now));
                info!("Session {} is now joinable", tx.session.id);
                Ok(Advance::Moved(SessionStatus::Joinable))
            }
            Some(SessionStatus::Preparing) => self.prepare_in_tx(tx, now, effects),
            Some(SessionStatus::InProgress) => Ok(Advance::NeedsSeeds),
            Some(other) => Err(internal(format!(
                "unexpected time-triggered transition to {} for {}",
                other, tx.session.id
            ))),
            None if tx.session.status == SessionStatus::Preparing => {
                let pending = tx.session.pending_countdowns(&self.countdown_marks, now);
                let Some(latest) = pending.last().copied() else {
                    return Ok(Advance::Idle);
                };
                tx.session.countdowns_sent.extend(pending.iter().copied());
                effects
                    .notifications
                    .push(render::session_countdown(&tx.league, &tx.session, latest));
                debug!("Session {} countdown at {}s", tx.session.id, latest);
                Ok(Advance::Countdown)
            }
            None => Ok(Advance::Idle),
        }
    }

    /// Freeze the joined set, drop the odd player out and pair the rest
    fn prepare_in_tx(
        &self,
        tx: &mut SessionTx,
        now: DateTime<Utc>,
        effects: &mut Effects,
    ) -> Result<Advance> {
        if let Some(kicked) = tx.session.kick_odd_player() {
            effects.odd_kick = true;
            info!("Player {} removed from session {} for parity", kicked, tx.session.id);
            match tx.player(&kicked) {
                Some(player) => effects
                    .notifications
                    .push(render::odd_player_kicked(player, &tx.session)),
                None => warn!("Kicked player {} has no account row", kicked),
            }
        }

        if tx.session.player_ids.is_empty() {
            tx.session.set_status(SessionStatus::Closed, now)?;
            effects.transition(SessionStatus::Joinable, SessionStatus::Closed);
            effects.empty_session = true;
            effects
                .notifications
                .push(render::session_empty(&tx.league, &tx.session));
            info!("Session {} closed without players", tx.session.id);
            return Ok(Advance::Moved(SessionStatus::Closed));
        }

        let pairs = self.matchmaker.pair(&tx.session.player_ids)?;
        let matches: Vec<Match> = pairs
            .into_iter()
            .map(|(first, second)| Match::new(&tx.session, first, second, now))
            .collect();
        effects.matches_created = matches.len();
        tx.matches = matches;

        tx.session.set_status(SessionStatus::Preparing, now)?;
        effects.transition(SessionStatus::Joinable, SessionStatus::Preparing);
        effects
            .notifications
            .push(render::session_status(&tx.league, &tx.session, now));
        info!(
            "Session {} preparing with {} matches",
            tx.session.id,
            tx.matches.len()
        );
        Ok(Advance::Moved(SessionStatus::Preparing))
    }

    /// Generate seeds without holding the session, then start the race
    async fn start_session(&self, session_id: SessionId) -> Result<Option<SessionStatus>> {
        let (league, pending) = {
            let tx = self.store.begin_session(session_id).await?;
            let now = self.clock.now();
            if tx.session.due_transition(&tx.league, now) != Some(SessionStatus::InProgress) {
                return Ok(None);
            }
            let pending: Vec<MatchId> = tx
                .matches
                .iter()
                .filter(|m| m.seed.is_none())
                .map(|m| m.id)
                .collect();
            (tx.league.clone(), pending)
        };

        let mut seeds: HashMap<MatchId, MatchSeed> = HashMap::new();
        for match_id in pending {
            let seed = random_seed_string();
            let generated = self
                .seed_generator
                .generate_seed(&league.generator_settings, &league.generator_version, &seed)
                .await
                .map_err(|e| LadderError::SeedGenerationFailed {
                    reason: format!("match {}: {:#}", match_id, e),
                })?;
            seeds.insert(
                match_id,
                MatchSeed {
                    seed,
                    generator_version: league.generator_version.clone(),
                    patch: generated.patch,
                    spoiler_log: generated.spoiler_log,
                },
            );
        }

        self.transact(session_id, |tx, now, effects| {
            if tx.session.status != SessionStatus::Preparing {
                return Ok(None);
            }

            for race in tx.matches.iter_mut() {
                let seed = match race.seed.clone().or_else(|| seeds.get(&race.id).cloned()) {
                    Some(seed) => seed,
                    None => return Err(internal(format!("no seed generated for match {}", race.id))),
                };
                race.start(seed, now);
            }
            tx.session.set_status(SessionStatus::InProgress, now)?;
            effects.transition(SessionStatus::Preparing, SessionStatus::InProgress);

            for race in &tx.matches {
                for entry in &race.entries {
                    match tx.player(&entry.player_id) {
                        Some(player) => effects
                            .notifications
                            .push(render::match_seed(&tx.session, race, player, now)),
                        None => warn!("Player {} has no account row", entry.player_id),
                    }
                }
            }
            effects
                .notifications
                .push(render::session_status(&tx.league, &tx.session, now));
            info!("Session {} started", tx.session.id);
            Ok(Some(SessionStatus::InProgress))
        })
        .await
    }

    /// Rate every resolved match once and close the session
    fn close_in_tx(
        &self,
        tx: &mut SessionTx,
        now: DateTime<Utc>,
        effects: &mut Effects,
    ) -> Result<()> {
        let mut names: HashMap<PlayerId, String> = HashMap::new();

        for index in 0..tx.matches.len() {
            let race = tx.matches[index].clone();
            let [first_entry, second_entry] = &race.entries;
            let outcome = first_entry
                .outcome
                .ok_or_else(|| internal(format!("closing with unresolved match {}", race.id)))?;

            let lookup = |id: &PlayerId| {
                tx.player(id)
                    .cloned()
                    .ok_or_else(|| internal(format!("player {} missing from session", id)))
            };
            let mut first = lookup(&first_entry.player_id)?;
            let mut second = lookup(&second_entry.player_id)?;

            if !race.rated {
                let result = self.rating_engine.rate_match(
                    (&first.rating, first.rating_period_start),
                    (&second.rating, second.rating_period_start),
                    outcome,
                    now,
                );
                first = apply_change(first, &result.first, now);
                second = apply_change(second, &result.second, now);

                effects.rating_updates.push(first.rating.rating);
                effects.rating_updates.push(second.rating.rating);
                effects.decay_steps += result.first.decay_periods + result.second.decay_periods;
                debug!(
                    "Match {} rated: {} {:+.1}, {} {:+.1}",
                    race.id,
                    first.name,
                    result.first.delta(),
                    second.name,
                    result.second.delta()
                );

                tx.update_player(first.clone());
                tx.update_player(second.clone());
                tx.matches[index].rated = true;
            }

            effects.notifications.push(render::match_end(
                &tx.session,
                &race,
                first_entry,
                second_entry,
                &first,
                &second,
            ));
            effects.notifications.push(render::match_end(
                &tx.session,
                &race,
                second_entry,
                first_entry,
                &second,
                &first,
            ));
            names.insert(first.id, first.name);
            names.insert(second.id, second.name);
        }

        let from = tx.session.status;
        tx.session.set_status(SessionStatus::Closed, now)?;
        effects.transition(from, SessionStatus::Closed);
        effects.notifications.push(render::session_recap(
            &tx.league,
            &tx.session,
            &tx.matches,
            &names,
        ));
        effects
            .notifications
            .push(render::session_status(&tx.league, &tx.session, now));
        Ok(())
    }

    /// Advance every active session as far as its deadlines allow.
    ///
    /// A session that fails is logged and skipped; only a store outage aborts
    /// the sweep.
    pub async fn advance_all(&self) -> Result<TickReport> {
        let ids = self.store.active_session_ids().await?;
        let mut report = TickReport {
            sessions: ids.len(),
            ..TickReport::default()
        };

        for session_id in ids {
            for _ in 0..MAX_STEPS_PER_SWEEP {
                match self.advance_session(session_id).await {
                    Ok(Some(_)) => report.transitions += 1,
                    Ok(None) => break,
                    Err(e) if is_unavailable(&e) => return Err(e),
                    Err(e) => {
                        report.failed += 1;
                        error!("Failed to advance session {}: {:#}", session_id, e);
                        break;
                    }
                }
            }
        }

        Ok(report)
    }

    /// Schedule the next session of every league that has none pending.
    ///
    /// A league that fails is logged and skipped; only a store outage stops
    /// the pass.
    pub async fn ensure_upcoming_sessions(&self) -> Result<usize> {
        let now = self.clock.now();
        let mut created = 0;

        for league in self.store.list_leagues().await? {
            match self.ensure_league_session(&league, now).await {
                Ok(true) => created += 1,
                Ok(false) => {}
                Err(e) if is_unavailable(&e) => return Err(e),
                Err(e) => {
                    error!(
                        "Failed to schedule a session for league {}: {:#}",
                        league.short_code, e
                    );
                }
            }
        }

        Ok(created)
    }

    /// Whether a new session was scheduled for `league`
    async fn ensure_league_session(&self, league: &League, now: DateTime<Utc>) -> Result<bool> {
        let sessions = self.store.sessions_for_league(league.id).await?;
        if sessions.iter().any(|s| s.status.is_active()) {
            return Ok(false);
        }

        let start = league
            .schedule
            .next_slot_after(now + league.joinable_offset());
        let session = MatchSession::new(league, start, now);
        match self.store.insert_session(session.clone()).await {
            Ok(()) => {}
            Err(e) if is_conflict(&e) => {
                debug!("League {} got a session concurrently", league.short_code);
                return Ok(false);
            }
            Err(e) => return Err(e),
        }

        let tx = self.store.begin_session(session.id).await?;
        self.notifier
            .publish(render::session_status(league, &session, now))
            .await;
        drop(tx);

        if let Some(metrics) = &self.metrics {
            metrics.record_session_created(SessionStatus::Waiting);
        }
        info!(
            "Scheduled session {} for league {} at {}",
            session.id, league.short_code, start
        );
        Ok(true)
    }

    /// One scheduler pass: create missing sessions, then advance the active ones
    pub async fn tick(&self) -> Result<TickReport> {
        let created = self.ensure_upcoming_sessions().await?;
        let mut report = self.advance_all().await?;
        report.created = created;
        Ok(report)
    }

    /// Apply elapsed inactivity periods to every player.
    ///
    /// Rows changed concurrently are skipped; the next sweep picks them up.
    pub async fn decay_sweep(&self) -> Result<usize> {
        let now = self.clock.now();
        let mut decayed = 0;

        for mut player in self.store.list_players().await? {
            let outcome = self.rating_engine.apply_inactivity_decay(
                &player.rating,
                player.rating_period_start,
                now,
            );
            if outcome.periods_applied == 0 {
                continue;
            }

            player.rating = outcome.rating;
            player.rating_period_start = outcome.period_start;
            let player_id = player.id;
            match self.store.update_player(player).await {
                Ok(_) => {
                    decayed += 1;
                    if let Some(metrics) = &self.metrics {
                        metrics.record_decay_steps(outcome.periods_applied);
                    }
                }
                Err(e) if is_conflict(&e) => {
                    debug!("Skipping decay of player {} this sweep", player_id)
                }
                Err(e) => return Err(e),
            }
        }

        if decayed > 0 {
            info!("Applied inactivity decay to {} players", decayed);
        }
        Ok(decayed)
    }

    // ----- players -----

    pub async fn register_player(&self, name: &str, external_id: &str) -> Result<Player> {
        let started = Instant::now();
        let result = async {
            let name = validate_name(name)?;
            if self.store.player_by_external_id(external_id).await?.is_some() {
                return Err(LadderError::PlayerAlreadyRegistered {
                    external_id: external_id.to_string(),
                }
                .into());
            }
            self.ensure_name_free(&name, None).await?;

            let now = self.clock.now();
            let player = Player {
                id: generate_id(),
                name,
                external_id: external_id.to_string(),
                rating: self.rating_engine.initial_rating(),
                rating_period_start: now,
                games_played: 0,
                created_at: now,
                version: 0,
            };
            self.store.insert_player(player.clone()).await?;
            info!("Registered player {} ({})", player.name, player.id);
            Ok(player)
        }
        .await;

        if result.is_ok() {
            if let Some(metrics) = &self.metrics {
                metrics.record_player_registered();
            }
        }
        self.observe("register", started, &result);
        result
    }

    pub async fn rename_player(&self, external_id: &str, name: &str) -> Result<Player> {
        let started = Instant::now();
        let result = async {
            let name = validate_name(name)?;
            let mut attempt = 1;
            loop {
                let mut player = self.player_by_external_id(external_id).await?;
                self.ensure_name_free(&name, Some(player.id)).await?;
                let old_name = std::mem::replace(&mut player.name, name.clone());

                match self.store.update_player(player).await {
                    Ok(player) => {
                        info!("Player {} renamed from {} to {}", player.id, old_name, player.name);
                        return Ok(player);
                    }
                    Err(e) if attempt < MAX_COMMIT_ATTEMPTS && is_conflict(&e) => attempt += 1,
                    Err(e) => return Err(e),
                }
            }
        }
        .await;
        self.observe("rename", started, &result);
        result
    }

    async fn ensure_name_free(&self, name: &str, owner: Option<PlayerId>) -> Result<()> {
        let taken = self
            .store
            .list_players()
            .await?
            .iter()
            .any(|p| p.name.eq_ignore_ascii_case(name) && Some(p.id) != owner);
        if taken {
            return Err(LadderError::InvalidName {
                reason: format!("the name {} is already taken", name),
            }
            .into());
        }
        Ok(())
    }

    pub async fn player_by_external_id(&self, external_id: &str) -> Result<Player> {
        self.store
            .player_by_external_id(external_id)
            .await?
            .ok_or_else(|| {
                LadderError::PlayerNotFound {
                    player_id: external_id.to_string(),
                }
                .into()
            })
    }

    // ----- read side -----

    pub async fn list_leagues(&self) -> Result<Vec<League>> {
        self.store.list_leagues().await
    }

    pub async fn get_league(&self, league_id: LeagueId) -> Result<Option<League>> {
        self.store.get_league(league_id).await
    }

    /// Ranked players of a league; `deviation_threshold` defaults to the league's own
    pub async fn get_leaderboard_for_league(
        &self,
        short_code: &str,
        deviation_threshold: Option<f64>,
    ) -> Result<Vec<LeaderboardEntry>> {
        let league = self.league_by_code(short_code).await?;
        let players = self.store.players_for_league(league.id).await?;
        Ok(build_leaderboard(
            players,
            deviation_threshold.unwrap_or(league.deviation_threshold),
        ))
    }

    /// Sessions not closed yet, and those closed recently, with their leagues
    pub async fn get_active_sessions_around_now(&self) -> Result<Vec<ActiveSession>> {
        let now = self.clock.now();
        let leagues: HashMap<LeagueId, League> = self
            .store
            .list_leagues()
            .await?
            .into_iter()
            .map(|l| (l.id, l))
            .collect();

        Ok(self
            .store
            .sessions_since(now - self.recent_window)
            .await?
            .into_iter()
            .filter_map(|session| {
                let league = leagues.get(&session.league_id)?.clone();
                Some(ActiveSession { session, league })
            })
            .collect())
    }

    /// Latest session of a league that actually raced, with its matches
    pub async fn get_session_recap(&self, short_code: &str) -> Result<SessionRecap> {
        let league = self.league_by_code(short_code).await?;
        let sessions = self.store.sessions_for_league(league.id).await?;

        for session in sessions.into_iter().rev() {
            if session.status < SessionStatus::InProgress {
                continue;
            }
            let matches = self.store.session_matches(session.id).await?;
            if !matches.is_empty() {
                return Ok(SessionRecap {
                    league,
                    session,
                    matches,
                });
            }
        }

        Err(LadderError::NoPastSession {
            short_code: league.short_code,
        }
        .into())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::notification::{NotificationBus, NotificationKind, NotificationReceiver};
    use crate::session::seed::{GeneratedSeed, MockSeedGenerator};
    use crate::store::InMemoryStore;
    use crate::types::LeagueSchedule;
    use crate::utils::ManualClock;
    use chrono::TimeZone;

    struct Harness {
        manager: SessionManager,
        store: Arc<InMemoryStore>,
        clock: Arc<ManualClock>,
        receiver: NotificationReceiver,
        league: League,
    }

    fn start() -> DateTime<Utc> {
        Utc.with_ymd_and_hms(2024, 5, 1, 20, 0, 0).unwrap()
    }

    async fn harness() -> Harness {
        let store = Arc::new(InMemoryStore::new());
        let clock = Arc::new(ManualClock::new(start() - Duration::hours(2)));
        let (bus, mut receivers) =
            NotificationBus::new(256, 1, std::time::Duration::from_millis(50));
        let league = League {
            id: generate_id(),
            name: "Standard".to_string(),
            short_code: "std".to_string(),
            announce_channel_id: "announcements".to_string(),
            joinable_offset_seconds: 3600,
            preparation_offset_seconds: 900,
            deviation_threshold: 120.0,
            schedule: LeagueSchedule {
                anchor: start(),
                interval_seconds: 86_400,
            },
            generator_settings: serde_json::Value::Null,
            generator_version: "v1".to_string(),
        };
        store.insert_league(league.clone()).await.unwrap();

        let manager = SessionManager::new(store.clone(), Arc::new(bus), RatingEngine::default())
            .with_clock(clock.clone());

        Harness {
            manager,
            store,
            clock,
            receiver: receivers.remove(0),
            league,
        }
    }

    fn drain(receiver: &mut NotificationReceiver) -> Vec<Notification> {
        let mut out = Vec::new();
        while let Ok(n) = receiver.try_recv() {
            out.push(n);
        }
        out
    }

    #[tokio::test]
    async fn test_ensure_upcoming_session_is_idempotent() {
        let mut h = harness().await;

        assert_eq!(h.manager.ensure_upcoming_sessions().await.unwrap(), 1);
        assert_eq!(h.manager.ensure_upcoming_sessions().await.unwrap(), 0);

        let sessions = h.store.sessions_for_league(h.league.id).await.unwrap();
        assert_eq!(sessions.len(), 1);
        // The 20:00 slot still has its full joinable window ahead
        assert_eq!(sessions[0].start_date, start());
        assert_eq!(sessions[0].status, SessionStatus::Waiting);

        let sent = drain(&mut h.receiver);
        assert_eq!(sent.len(), 1);
        assert!(sent[0].body.contains("has been scheduled"));
    }

    #[tokio::test]
    async fn test_join_outside_joinable_phase_fails() {
        let h = harness().await;
        h.manager.ensure_upcoming_sessions().await.unwrap();
        let player = h.manager.register_player("alice", "ext-alice").await.unwrap();

        let err = h.manager.join_league("std", player.id).await.unwrap_err();
        assert!(matches!(
            ladder_error(&err),
            Some(LadderError::InvalidPhase {
                status: SessionStatus::Waiting,
                ..
            })
        ));
    }

    #[tokio::test]
    async fn test_countdown_announces_latest_mark_once() {
        let mut h = harness().await;
        let session = MatchSession::new(&h.league, start(), h.clock.now());
        h.store.insert_session(session.clone()).await.unwrap();
        let (a, b) = (
            h.manager.register_player("alice", "ext-alice").await.unwrap(),
            h.manager.register_player("bob", "ext-bob").await.unwrap(),
        );

        h.clock.set(start() - Duration::minutes(30));
        h.manager.advance_session(session.id).await.unwrap();
        h.manager.join(session.id, a.id).await.unwrap();
        h.manager.join(session.id, b.id).await.unwrap();
        h.clock.set(start() - Duration::minutes(10));
        assert_eq!(
            h.manager.advance_session(session.id).await.unwrap(),
            Some(SessionStatus::Preparing)
        );
        drain(&mut h.receiver);

        // 45s before start: 300 and 60 are both crossed, only 60 is announced
        h.clock.set(start() - Duration::seconds(45));
        assert_eq!(h.manager.advance_session(session.id).await.unwrap(), None);
        assert_eq!(h.manager.advance_session(session.id).await.unwrap(), None);

        let sent = drain(&mut h.receiver);
        assert_eq!(sent.len(), 1);
        assert!(matches!(
            sent[0].kind,
            NotificationKind::SessionCountdown {
                seconds_left: 60,
                ..
            }
        ));
        assert!(sent[0].body.ends_with("@here"));
    }

    #[tokio::test]
    async fn test_seed_failure_keeps_session_preparing() {
        let h = harness().await;
        let (bus, _receivers) = NotificationBus::new(64, 1, std::time::Duration::from_millis(10));

        let mut generator = MockSeedGenerator::new();
        let mut calls = 0;
        generator.expect_generate_seed().returning(move |_, _, _| {
            calls += 1;
            if calls == 1 {
                Err(anyhow::anyhow!("generator offline"))
            } else {
                Ok(GeneratedSeed {
                    patch: vec![1, 2, 3],
                    spoiler_log: Some("{}".to_string()),
                })
            }
        });
        let manager = SessionManager::new(
            h.store.clone(),
            Arc::new(bus),
            RatingEngine::default(),
        )
        .with_clock(h.clock.clone())
        .with_seed_generator(Arc::new(generator));

        let session = MatchSession::new(&h.league, start(), h.clock.now());
        h.store.insert_session(session.clone()).await.unwrap();
        let a = manager.register_player("alice", "ext-alice").await.unwrap();
        let b = manager.register_player("bob", "ext-bob").await.unwrap();

        h.clock.set(start() - Duration::minutes(30));
        manager.advance_session(session.id).await.unwrap();
        manager.join(session.id, a.id).await.unwrap();
        manager.join(session.id, b.id).await.unwrap();
        h.clock.set(start() - Duration::minutes(10));
        manager.advance_session(session.id).await.unwrap();

        h.clock.set(start());
        let err = manager.advance_session(session.id).await.unwrap_err();
        assert!(matches!(
            ladder_error(&err),
            Some(LadderError::SeedGenerationFailed { .. })
        ));
        let stored = h.store.get_session(session.id).await.unwrap().unwrap();
        assert_eq!(stored.status, SessionStatus::Preparing);

        assert_eq!(
            manager.advance_session(session.id).await.unwrap(),
            Some(SessionStatus::InProgress)
        );
        let matches = h.store.session_matches(session.id).await.unwrap();
        let seed = matches[0].seed.as_ref().expect("seed attached");
        assert_eq!(seed.patch, vec![1, 2, 3]);
        assert_eq!(seed.generator_version, "v1");
    }

    #[tokio::test]
    async fn test_decay_sweep_applies_each_period_once() {
        let h = harness().await;
        let player = h.manager.register_player("alice", "ext-alice").await.unwrap();
        let mut veteran = player.clone();
        veteran.rating.deviation = 80.0;
        h.store.update_player(veteran).await.unwrap();

        let period = Duration::seconds(RatingEngine::default().config().decay_period_seconds);
        h.clock.advance(period * 2 + Duration::hours(1));

        assert_eq!(h.manager.decay_sweep().await.unwrap(), 1);
        let once = h.store.get_player(player.id).await.unwrap().unwrap();
        assert!(once.rating.deviation > 80.0);
        assert_eq!(once.rating_period_start, player.rating_period_start + period * 2);

        assert_eq!(h.manager.decay_sweep().await.unwrap(), 0);
        let again = h.store.get_player(player.id).await.unwrap().unwrap();
        assert_eq!(again.rating.deviation, once.rating.deviation);
    }

    #[tokio::test]
    async fn test_register_and_rename_validation() {
        let h = harness().await;

        let alice = h.manager.register_player("  alice ", "ext-alice").await.unwrap();
        assert_eq!(alice.name, "alice");
        assert_eq!(alice.rating.rating, 1500.0);

        let err = h.manager.register_player("other", "ext-alice").await.unwrap_err();
        assert!(matches!(
            ladder_error(&err),
            Some(LadderError::PlayerAlreadyRegistered { .. })
        ));

        let err = h.manager.register_player("ALICE", "ext-2").await.unwrap_err();
        assert!(matches!(ladder_error(&err), Some(LadderError::InvalidName { .. })));

        let err = h.manager.register_player("", "ext-3").await.unwrap_err();
        assert!(matches!(ladder_error(&err), Some(LadderError::InvalidName { .. })));

        let renamed = h.manager.rename_player("ext-alice", "alicia").await.unwrap();
        assert_eq!(renamed.name, "alicia");
        assert_eq!(renamed.version, alice.version + 1);

        let err = h.manager.rename_player("ext-nobody", "x").await.unwrap_err();
        assert!(matches!(ladder_error(&err), Some(LadderError::PlayerNotFound { .. })));
    }

    #[test]
    fn test_validate_name() {
        assert_eq!(validate_name(" bob ").unwrap(), "bob");
        assert!(validate_name("a`b").is_err());
        assert!(validate_name(&"x".repeat(33)).is_err());
        assert!(validate_name(&"x".repeat(32)).is_ok());
    }
}
