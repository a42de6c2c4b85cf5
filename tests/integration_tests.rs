//! End-to-end session lifecycle tests
//!
//! Drive the manager through whole sessions with a manual clock:
//! - scheduling, joining and cancelling
//! - parity kick and empty sessions
//! - race results, rating updates and the read side
//! - notification order per session

mod fixtures;

use chrono::Duration;
use fixtures::{create_test_system, start_slot, test_league};
use race_ladder::error::ladder_error;
use race_ladder::types::{EntryStatus, Outcome, SessionStatus};
use race_ladder::LadderError;
use race_ladder::LadderStore;

const STATUS: &str = "session_status_update";

#[tokio::test]
async fn test_full_session_with_odd_player() {
    let system = create_test_system().await;
    let alice = system.register("alice").await;
    let bob = system.register("bob").await;
    let carol = system.register("carol").await;

    let session = system.open_session().await;
    assert_eq!(session.status, SessionStatus::Joinable);
    assert_eq!(session.start_date, start_slot());

    for player in [&alice, &bob, &carol] {
        let joined = system.manager.join_league("STD", player.id).await.unwrap();
        assert_eq!(joined, session.id);
    }

    // Preparation: carol joined last and is dropped for parity
    system.tick_at(start_slot() - Duration::minutes(14)).await;
    let session = system.session_by_id(session.id).await;
    assert_eq!(session.status, SessionStatus::Preparing);
    assert_eq!(session.player_ids, vec![alice.id, bob.id]);
    assert_eq!(session.kicked_player_id, Some(carol.id));

    system.tick_at(start_slot()).await;
    let session = system.session_by_id(session.id).await;
    assert_eq!(session.status, SessionStatus::InProgress);

    let matches = system.store.session_matches(session.id).await.unwrap();
    assert_eq!(matches.len(), 1);
    let seed = matches[0].seed.clone().expect("seed assigned at start");
    assert_eq!(seed.seed.len(), 10);
    assert_eq!(seed.generator_version, "v1");

    // Alice is ten minutes faster
    system.clock.set(start_slot() + Duration::minutes(30));
    system.manager.complete_for_player(alice.id).await.unwrap();
    system.clock.set(start_slot() + Duration::minutes(40));
    system.manager.complete_for_player(bob.id).await.unwrap();

    let session = system.session_by_id(session.id).await;
    assert_eq!(session.status, SessionStatus::Closed);
    assert!(session.closed_at.is_some());

    let race = &system.store.session_matches(session.id).await.unwrap()[0];
    assert!(race.rated);
    let alice_entry = race.entries.iter().find(|e| e.player_id == alice.id).unwrap();
    assert_eq!(alice_entry.outcome, Some(Outcome::Win));
    assert_eq!(alice_entry.status, EntryStatus::Finished);

    let alice = system.player(alice.id).await;
    let bob = system.player(bob.id).await;
    let carol = system.player(carol.id).await;
    assert!(alice.rating.rating > 1500.0);
    assert!(bob.rating.rating < 1500.0);
    assert!(alice.rating.deviation < 350.0);
    assert_eq!(alice.games_played, 1);
    assert_eq!(bob.games_played, 1);
    assert_eq!(carol.games_played, 0);
    assert_eq!(carol.rating.rating, 1500.0);

    assert_eq!(
        system.publisher.kinds_for_session(session.id),
        vec![
            STATUS,
            STATUS,
            "odd_player_kicked",
            STATUS,
            "match_seed",
            "match_seed",
            STATUS,
            "match_end",
            "match_end",
            "session_recap",
            STATUS,
        ]
    );
}

#[tokio::test]
async fn test_session_without_players_closes_at_preparation() {
    let system = create_test_system().await;
    let session = system.open_session().await;

    system.tick_at(start_slot() - Duration::minutes(15)).await;

    let closed = system.session_by_id(session.id).await;
    assert_eq!(closed.status, SessionStatus::Closed);
    assert!(system.store.session_matches(session.id).await.unwrap().is_empty());
    assert_eq!(
        system.publisher.kinds_for_session(session.id),
        vec![STATUS, STATUS, "session_empty"]
    );

    // The following tick schedules the next day's slot
    system.tick_at(start_slot() - Duration::minutes(14)).await;
    let next = system.session().await;
    assert_ne!(next.id, session.id);
    assert_eq!(next.start_date, start_slot() + Duration::days(1));
    assert_eq!(next.status, SessionStatus::Waiting);
}

#[tokio::test]
async fn test_single_player_is_kicked_and_session_closes() {
    let system = create_test_system().await;
    let alice = system.register("alice").await;
    let session = system.open_session().await;
    system.manager.join(session.id, alice.id).await.unwrap();

    system.tick_at(start_slot() - Duration::minutes(10)).await;

    let closed = system.session_by_id(session.id).await;
    assert_eq!(closed.status, SessionStatus::Closed);
    assert_eq!(closed.kicked_player_id, Some(alice.id));
    assert_eq!(
        system.publisher.kinds_for_session(session.id),
        vec![STATUS, STATUS, "odd_player_kicked", "session_empty"]
    );

    let kicked = system
        .publisher
        .notifications()
        .into_iter()
        .find(|n| n.kind_name() == "odd_player_kicked")
        .unwrap();
    assert_eq!(kicked.recipient.id(), "ext-alice");
}

#[tokio::test]
async fn test_join_and_cancel_rules() {
    let system = create_test_system().await;
    let alice = system.register("alice").await;
    let bob = system.register("bob").await;

    // Scheduled but not open yet
    system.tick_at(start_slot() - Duration::hours(2)).await;
    let err = system.manager.join_league("std", alice.id).await.unwrap_err();
    assert!(matches!(
        ladder_error(&err),
        Some(LadderError::InvalidPhase {
            status: SessionStatus::Waiting,
            ..
        })
    ));

    system.tick_at(start_slot() - Duration::minutes(30)).await;
    system.manager.join_league("std", alice.id).await.unwrap();
    let err = system.manager.join_league("std", alice.id).await.unwrap_err();
    assert!(matches!(
        ladder_error(&err),
        Some(LadderError::AlreadyJoined { .. })
    ));

    let err = system.manager.cancel_league("std", bob.id).await.unwrap_err();
    assert!(matches!(ladder_error(&err), Some(LadderError::NotJoined { .. })));

    system.manager.cancel_league("std", alice.id).await.unwrap();
    system.manager.join_league("std", alice.id).await.unwrap();
    system.manager.join_league("std", bob.id).await.unwrap();

    system.tick_at(start_slot() - Duration::minutes(15)).await;
    assert_eq!(system.session().await.status, SessionStatus::Preparing);

    let err = system.manager.cancel_league("std", alice.id).await.unwrap_err();
    assert!(matches!(
        ladder_error(&err),
        Some(LadderError::InvalidPhase {
            status: SessionStatus::Preparing,
            ..
        })
    ));
    assert_eq!(system.session().await.player_ids.len(), 2);
}

#[tokio::test]
async fn test_unknown_league_and_player() {
    let system = create_test_system().await;
    let alice = system.register("alice").await;
    system.open_session().await;

    let err = system.manager.join_league("nope", alice.id).await.unwrap_err();
    assert!(matches!(
        ladder_error(&err),
        Some(LadderError::LeagueNotFound { .. })
    ));

    let err = system
        .manager
        .join_league("std", race_ladder::utils::generate_id())
        .await
        .unwrap_err();
    assert!(matches!(
        ladder_error(&err),
        Some(LadderError::PlayerNotFound { .. })
    ));
}

#[tokio::test]
async fn test_results_only_accepted_while_in_progress() {
    let system = create_test_system().await;
    let alice = system.register("alice").await;
    let bob = system.register("bob").await;
    let session = system.open_session().await;
    system.manager.join(session.id, alice.id).await.unwrap();
    system.manager.join(session.id, bob.id).await.unwrap();
    system.tick_at(start_slot() - Duration::minutes(10)).await;

    // Preparing: matches exist but have not started
    let entry_id = system.store.session_matches(session.id).await.unwrap()[0].entries[0].id;
    let err = system.manager.complete(entry_id).await.unwrap_err();
    assert!(matches!(
        ladder_error(&err),
        Some(LadderError::InvalidPhase {
            status: SessionStatus::Preparing,
            ..
        })
    ));

    system.tick_at(start_slot()).await;
    system.manager.complete(entry_id).await.unwrap();
    let err = system.manager.forfeit(entry_id).await.unwrap_err();
    assert!(matches!(
        ladder_error(&err),
        Some(LadderError::EntryAlreadyTerminal { .. })
    ));
}

#[tokio::test]
async fn test_double_forfeit_is_a_draw() {
    let system = create_test_system().await;
    let alice = system.register("alice").await;
    let bob = system.register("bob").await;
    let session = system.open_session().await;
    system.manager.join(session.id, alice.id).await.unwrap();
    system.manager.join(session.id, bob.id).await.unwrap();
    system.tick_at(start_slot() - Duration::minutes(10)).await;
    system.tick_at(start_slot()).await;

    system.clock.set(start_slot() + Duration::minutes(5));
    system.manager.forfeit_for_player(alice.id).await.unwrap();
    system.manager.forfeit_for_player(bob.id).await.unwrap();

    let race = &system.store.session_matches(session.id).await.unwrap()[0];
    assert!(race.entries.iter().all(|e| e.outcome == Some(Outcome::Draw)));
    assert_eq!(
        system.session_by_id(session.id).await.status,
        SessionStatus::Closed
    );

    let alice = system.player(alice.id).await;
    let bob = system.player(bob.id).await;
    assert!((alice.rating.rating - bob.rating.rating).abs() < 1e-9);
}

#[tokio::test]
async fn test_equal_times_are_a_draw() {
    let system = create_test_system().await;
    let alice = system.register("alice").await;
    let bob = system.register("bob").await;
    let session = system.open_session().await;
    system.manager.join(session.id, alice.id).await.unwrap();
    system.manager.join(session.id, bob.id).await.unwrap();
    system.tick_at(start_slot() - Duration::minutes(10)).await;
    system.tick_at(start_slot()).await;

    system.clock.set(start_slot() + Duration::minutes(42));
    system.manager.complete_for_player(bob.id).await.unwrap();
    system.manager.complete_for_player(alice.id).await.unwrap();

    let race = &system.store.session_matches(session.id).await.unwrap()[0];
    assert_eq!(race.entries[0].outcome, Some(Outcome::Draw));
}

#[tokio::test]
async fn test_force_close_forfeits_unfinished_entries() {
    let system = create_test_system().await;
    let names = ["alice", "bob", "carol", "dave"];
    let mut players = Vec::new();
    for name in names {
        players.push(system.register(name).await);
    }
    let session = system.open_session().await;
    for player in &players {
        system.manager.join(session.id, player.id).await.unwrap();
    }
    system.tick_at(start_slot() - Duration::minutes(10)).await;
    system.tick_at(start_slot()).await;

    // alice vs bob finishes normally, carol vs dave only has carol's time
    system.clock.set(start_slot() + Duration::minutes(50));
    system.manager.complete_for_player(players[0].id).await.unwrap();
    system.manager.complete_for_player(players[1].id).await.unwrap();
    system.manager.complete_for_player(players[2].id).await.unwrap();
    assert_eq!(
        system.session_by_id(session.id).await.status,
        SessionStatus::InProgress
    );

    system.manager.force_close(session.id).await.unwrap();

    assert_eq!(
        system.session_by_id(session.id).await.status,
        SessionStatus::Closed
    );
    let matches = system.store.session_matches(session.id).await.unwrap();
    assert!(matches.iter().all(|m| m.rated));
    let dave_entry = matches
        .iter()
        .flat_map(|m| m.entries.iter())
        .find(|e| e.player_id == players[3].id)
        .unwrap();
    assert_eq!(dave_entry.status, EntryStatus::Forfeit);
    assert_eq!(dave_entry.outcome, Some(Outcome::Loss));

    // Closed sessions cannot be force-closed again
    let err = system.manager.force_close(session.id).await.unwrap_err();
    assert!(matches!(
        ladder_error(&err),
        Some(LadderError::InvalidPhase {
            status: SessionStatus::Closed,
            ..
        })
    ));
    let err = system
        .manager
        .complete_for_player(players[3].id)
        .await
        .unwrap_err();
    assert!(matches!(
        ladder_error(&err),
        Some(LadderError::NoActiveEntry { .. })
    ));
}

#[tokio::test]
async fn test_results_for_player_racing_in_two_leagues() {
    let system = create_test_system().await;
    let alt = test_league("alt");
    system.store.insert_league(alt.clone()).await.unwrap();
    let alice = system.register("alice").await;
    let bob = system.register("bob").await;
    let carol = system.register("carol").await;

    // Both leagues race at the same time and alice is in both
    let std_session = system.open_session().await;
    system.manager.join(std_session.id, alice.id).await.unwrap();
    system.manager.join(std_session.id, bob.id).await.unwrap();
    let alt_session = system.manager.join_league("alt", alice.id).await.unwrap();
    system.manager.join_league("alt", carol.id).await.unwrap();
    system.tick_at(start_slot() - Duration::minutes(10)).await;
    system.tick_at(start_slot()).await;
    assert_eq!(
        system.session_by_id(alt_session).await.status,
        SessionStatus::InProgress
    );

    system.clock.set(start_slot() + Duration::minutes(30));
    let err = system
        .manager
        .complete_for_player(alice.id)
        .await
        .unwrap_err();
    match ladder_error(&err) {
        Some(LadderError::AmbiguousEntry { leagues, .. }) => {
            assert!(leagues.contains("std") && leagues.contains("alt"));
        }
        other => panic!("unexpected error {:?}", other),
    }
    let entry_status = |matches: &[race_ladder::types::Match]| {
        matches
            .iter()
            .flat_map(|m| m.entries.iter())
            .find(|e| e.player_id == alice.id)
            .map(|e| e.status)
    };
    let std_matches = system.store.session_matches(std_session.id).await.unwrap();
    assert_eq!(entry_status(&std_matches), Some(EntryStatus::InProgress));

    // Naming the league records the time in that race only
    let entry = system
        .manager
        .complete_in_league("ALT", alice.id)
        .await
        .unwrap();
    let alt_matches = system.store.session_matches(alt_session).await.unwrap();
    assert!(alt_matches[0].entries.iter().any(|e| e.id == entry));
    assert_eq!(entry_status(&alt_matches), Some(EntryStatus::Finished));
    let std_matches = system.store.session_matches(std_session.id).await.unwrap();
    assert_eq!(entry_status(&std_matches), Some(EntryStatus::InProgress));

    // One race left, so the player-scoped form is unambiguous again
    system.manager.forfeit_for_player(alice.id).await.unwrap();
    let std_matches = system.store.session_matches(std_session.id).await.unwrap();
    assert_eq!(entry_status(&std_matches), Some(EntryStatus::Forfeit));

    let err = system
        .manager
        .forfeit_in_league("alt", alice.id)
        .await
        .unwrap_err();
    assert!(matches!(
        ladder_error(&err),
        Some(LadderError::NoActiveEntry { .. })
    ));
}

#[tokio::test]
async fn test_countdowns_before_start() {
    let system = create_test_system().await;
    let alice = system.register("alice").await;
    let bob = system.register("bob").await;
    let session = system.open_session().await;
    system.manager.join(session.id, alice.id).await.unwrap();
    system.manager.join(session.id, bob.id).await.unwrap();

    system.tick_at(start_slot() - Duration::minutes(15)).await;
    system.tick_at(start_slot() - Duration::minutes(5)).await;
    system.tick_at(start_slot() - Duration::seconds(40)).await;
    system.tick_at(start_slot() - Duration::seconds(35)).await;

    let countdowns: Vec<_> = system
        .publisher
        .notifications()
        .into_iter()
        .filter(|n| n.kind_name() == "session_countdown")
        .collect();
    assert_eq!(countdowns.len(), 2);
    assert!(countdowns[1].body.contains("@here"));
    assert_eq!(
        system.session_by_id(session.id).await.countdowns_sent,
        vec![300, 60]
    );
}

#[tokio::test]
async fn test_read_side_after_a_session() {
    let system = create_test_system().await;
    let alice = system.register("alice").await;
    let bob = system.register("bob").await;
    let carol = system.register("carol").await;

    let err = system.manager.get_session_recap("std").await.unwrap_err();
    assert!(matches!(
        ladder_error(&err),
        Some(LadderError::NoPastSession { .. })
    ));

    let session = system.open_session().await;
    system.manager.join(session.id, alice.id).await.unwrap();
    system.manager.join(session.id, bob.id).await.unwrap();
    system.tick_at(start_slot() - Duration::minutes(10)).await;
    system.tick_at(start_slot()).await;
    system.clock.set(start_slot() + Duration::minutes(20));
    system.manager.forfeit_for_player(bob.id).await.unwrap();
    system.manager.complete_for_player(alice.id).await.unwrap();

    let recap = system.manager.get_session_recap("std").await.unwrap();
    assert_eq!(recap.session.id, session.id);
    assert_eq!(recap.matches.len(), 1);

    // Fresh ratings are still provisional at the league's own threshold
    let board = system
        .manager
        .get_leaderboard_for_league("std", None)
        .await
        .unwrap();
    assert!(board.is_empty());

    let board = system
        .manager
        .get_leaderboard_for_league("std", Some(400.0))
        .await
        .unwrap();
    assert_eq!(board.len(), 2);
    assert_eq!(board[0].player_id, alice.id);
    assert_eq!(board[0].rank, 1);
    assert_eq!(board[1].player_id, bob.id);
    assert!(board.iter().all(|e| e.player_id != carol.id));

    // The closed session stays listed next to the newly scheduled one
    system.tick_at(start_slot() + Duration::hours(1)).await;
    let around = system.manager.get_active_sessions_around_now().await.unwrap();
    assert_eq!(around.len(), 2);
    assert_eq!(around[0].session.id, session.id);
    assert_eq!(around[1].session.status, SessionStatus::Waiting);
    assert_eq!(around[1].league.short_code, "std");

    system.clock.set(start_slot() + Duration::hours(30));
    let around = system.manager.get_active_sessions_around_now().await.unwrap();
    assert!(around.iter().all(|a| a.session.id != session.id));
}

#[tokio::test]
async fn test_store_outage_stops_the_tick() {
    let system = create_test_system().await;
    system.open_session().await;

    system.store.set_available(false);
    let err = system.manager.tick().await.unwrap_err();
    assert!(matches!(
        ladder_error(&err),
        Some(LadderError::StoreUnavailable { .. })
    ));

    system.store.set_available(true);
    system.clock.set(start_slot() - Duration::minutes(10));
    let report = system.manager.tick().await.unwrap();
    assert_eq!(report.transitions, 1);
    assert_eq!(system.session().await.status, SessionStatus::Closed);
}

#[tokio::test]
async fn test_failing_league_does_not_stop_the_tick() {
    let system = create_test_system().await;
    let broken = test_league("broken");
    system.store.insert_league(broken.clone()).await.unwrap();
    system.store.set_league_faulty(broken.id, true);

    let report = system.manager.tick().await.unwrap();
    assert_eq!(report.created, 1);

    // The healthy league keeps advancing while the other one fails
    system.clock.set(start_slot() - Duration::minutes(59));
    let report = system.manager.tick().await.unwrap();
    assert_eq!(report.created, 0);
    assert_eq!(report.transitions, 1);
    assert_eq!(system.session().await.status, SessionStatus::Joinable);
    assert!(system
        .store
        .sessions_for_league(broken.id)
        .await
        .unwrap()
        .is_empty());

    system.store.set_league_faulty(broken.id, false);
    let report = system.manager.tick().await.unwrap();
    assert_eq!(report.created, 1);
}
