//! Shared fixtures for the ladder integration tests
#![allow(dead_code)]

use async_trait::async_trait;
use chrono::{DateTime, Duration, TimeZone, Utc};
use race_ladder::error::Result;
use race_ladder::notification::{Notification, NotificationPublisher};
use race_ladder::rating::RatingEngine;
use race_ladder::session::{Matchmaker, SessionManager};
use race_ladder::store::{InMemoryStore, LadderStore};
use race_ladder::types::{League, LeagueSchedule, MatchSession, Player, PlayerId, SessionId};
use race_ladder::utils::{generate_id, ManualClock};
use std::sync::{Arc, Mutex};

/// Captures everything the manager publishes, in publish order
#[derive(Debug, Default)]
pub struct RecordingPublisher {
    notifications: Mutex<Vec<Notification>>,
}

impl RecordingPublisher {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn notifications(&self) -> Vec<Notification> {
        self.notifications
            .lock()
            .map(|n| n.clone())
            .unwrap_or_default()
    }

    /// Kind names of the notifications ordered by `session_id`
    pub fn kinds_for_session(&self, session_id: SessionId) -> Vec<&'static str> {
        self.notifications()
            .iter()
            .filter(|n| n.ordering_key == Some(session_id))
            .map(|n| n.kind_name())
            .collect()
    }

    pub fn count_kind(&self, kind: &str) -> usize {
        self.notifications()
            .iter()
            .filter(|n| n.kind_name() == kind)
            .count()
    }

    pub fn clear(&self) {
        if let Ok(mut n) = self.notifications.lock() {
            n.clear();
        }
    }
}

#[async_trait]
impl NotificationPublisher for RecordingPublisher {
    async fn publish(&self, notification: Notification) -> bool {
        if let Ok(mut n) = self.notifications.lock() {
            n.push(notification);
        }
        true
    }
}

/// Pairs players in join order so tests can predict opponents
#[derive(Debug, Default)]
pub struct InOrderMatchmaker;

impl Matchmaker for InOrderMatchmaker {
    fn pair(&self, players: &[PlayerId]) -> Result<Vec<(PlayerId, PlayerId)>> {
        Ok(players.chunks_exact(2).map(|p| (p[0], p[1])).collect())
    }
}

/// Start of the first session: 2024-05-01 20:00 UTC
pub fn start_slot() -> DateTime<Utc> {
    Utc.with_ymd_and_hms(2024, 5, 1, 20, 0, 0).unwrap()
}

/// Daily league opening an hour before start and preparing 15 minutes before
pub fn test_league(short_code: &str) -> League {
    League {
        id: generate_id(),
        name: format!("League {}", short_code),
        short_code: short_code.to_string(),
        announce_channel_id: format!("{}-announcements", short_code),
        joinable_offset_seconds: 3600,
        preparation_offset_seconds: 900,
        deviation_threshold: 120.0,
        schedule: LeagueSchedule {
            anchor: start_slot(),
            interval_seconds: 86_400,
        },
        generator_settings: serde_json::json!({ "mode": "standard" }),
        generator_version: "v1".to_string(),
    }
}

pub struct TestSystem {
    pub manager: Arc<SessionManager>,
    pub store: Arc<InMemoryStore>,
    pub clock: Arc<ManualClock>,
    pub publisher: Arc<RecordingPublisher>,
    pub league: League,
}

/// Manager over an in-memory store, clock at 18:00 on the day of the first slot
pub async fn create_test_system() -> TestSystem {
    let store = Arc::new(InMemoryStore::new());
    let clock = Arc::new(ManualClock::new(start_slot() - Duration::hours(2)));
    let publisher = Arc::new(RecordingPublisher::new());
    let league = test_league("std");
    store.insert_league(league.clone()).await.unwrap();

    let manager = SessionManager::new(store.clone(), publisher.clone(), RatingEngine::default())
        .with_matchmaker(Arc::new(InOrderMatchmaker))
        .with_clock(clock.clone());

    TestSystem {
        manager: Arc::new(manager),
        store,
        clock,
        publisher,
        league,
    }
}

impl TestSystem {
    pub async fn register(&self, name: &str) -> Player {
        self.manager
            .register_player(name, &format!("ext-{}", name))
            .await
            .unwrap()
    }

    pub async fn player(&self, player_id: PlayerId) -> Player {
        self.store.get_player(player_id).await.unwrap().unwrap()
    }

    /// Move the clock and run one scheduler pass
    pub async fn tick_at(&self, at: DateTime<Utc>) {
        self.clock.set(at);
        self.manager.tick().await.unwrap();
    }

    /// Create the first session and open it for joining
    pub async fn open_session(&self) -> MatchSession {
        self.tick_at(start_slot() - Duration::hours(2)).await;
        self.tick_at(start_slot() - Duration::minutes(59)).await;
        self.session().await
    }

    /// The league's most recently scheduled session
    pub async fn session(&self) -> MatchSession {
        self.store
            .sessions_for_league(self.league.id)
            .await
            .unwrap()
            .into_iter()
            .max_by_key(|s| s.start_date)
            .unwrap()
    }

    pub async fn session_by_id(&self, session_id: SessionId) -> MatchSession {
        self.store.get_session(session_id).await.unwrap().unwrap()
    }
}
