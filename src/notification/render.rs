//! Message bodies for every notification kind

use crate::notification::types::{Notification, NotificationFile, NotificationKind};
use crate::types::{
    EntryStatus, League, Match, MatchEntry, MatchSession, Outcome, Player, PlayerId,
    SessionStatus,
};
use crate::utils::format_duration;
use chrono::{DateTime, Utc};
use std::collections::HashMap;

/// Content type of seed patch attachments
pub const SEED_CONTENT_TYPE: &str = "application/zlib";

fn start_time(session: &MatchSession) -> String {
    session.start_date.format("%Y-%m-%d %H:%M UTC").to_string()
}

fn time_until(session: &MatchSession, now: DateTime<Utc>) -> String {
    format_duration(session.start_date - now)
}

/// Announcement of the status a session just entered
pub fn session_status(league: &League, session: &MatchSession, now: DateTime<Utc>) -> Notification {
    let code = &league.short_code;
    let body = match session.status {
        SessionStatus::Waiting => format!(
            "The next race for league `{}` has been scheduled for {} (in {}).",
            code,
            start_time(session),
            time_until(session, now)
        ),
        SessionStatus::Joinable => format!(
            "The race for league `{}` can now be joined! The race starts at {} (in {}).\n\
             You can join using `join {}`.",
            code,
            start_time(session),
            time_until(session, now),
            code
        ),
        SessionStatus::Preparing => format!(
            "The race for league `{}` has begun preparations, you can no longer join. \
             Seeds will soon be sent to the {} contestants.\n\
             The race starts at {} (in {}). Watch this channel for the official go.",
            code,
            session.player_ids.len(),
            start_time(session),
            time_until(session, now)
        ),
        SessionStatus::InProgress => format!(
            "The race for league `{}` **starts now**. Good luck and have fun! @here",
            code
        ),
        SessionStatus::Closed => format!(
            "All players have finished their last `{}` race, rankings have been updated.",
            code
        ),
    };

    Notification::to_channel(
        &league.announce_channel_id,
        NotificationKind::SessionStatusUpdate {
            session_id: session.id,
            status: session.status,
        },
        body,
    )
    .with_ordering_key(session.id)
}

/// Countdown before the start; the last minute pings the channel
pub fn session_countdown(league: &League, session: &MatchSession, seconds_left: i64) -> Notification {
    let mut body = format!(
        "The next race for league `{}` starts in {}.",
        league.short_code,
        format_duration(chrono::Duration::seconds(seconds_left))
    );
    if seconds_left <= 60 {
        body.push_str(" @here");
    }

    Notification::to_channel(
        &league.announce_channel_id,
        NotificationKind::SessionCountdown {
            session_id: session.id,
            seconds_left,
        },
        body,
    )
    .with_ordering_key(session.id)
}

pub fn session_empty(league: &League, session: &MatchSession) -> Notification {
    let body = format!(
        "The race for league `{}` is closed, you can no longer join.\n\
         There were not enough players to start the race.",
        league.short_code
    );

    Notification::to_channel(
        &league.announce_channel_id,
        NotificationKind::SessionEmpty {
            session_id: session.id,
        },
        body,
    )
    .with_ordering_key(session.id)
}

pub fn odd_player_kicked(player: &Player, session: &MatchSession) -> Notification {
    let body = format!(
        "Sorry {}, but there was an odd number of players and you were the last person to join.\n\
         You have been removed from the race, this won't affect your ranking.",
        player.name
    );

    Notification::to_user(
        &player.external_id,
        NotificationKind::OddPlayerKicked {
            session_id: session.id,
            player_id: player.id,
        },
        body,
    )
    .with_ordering_key(session.id)
}

/// Attachment name for a session's seed, e.g. `seed_2024-05-01_20h00.zpf`
pub fn seed_file_name(session: &MatchSession) -> String {
    format!("seed_{}.zpf", session.start_date.format("%Y-%m-%d_%Hh%M"))
}

/// Seed delivery to one player of a match; the patch travels as an attachment
pub fn match_seed(
    session: &MatchSession,
    race: &Match,
    player: &Player,
    now: DateTime<Utc>,
) -> Notification {
    let kind = NotificationKind::MatchSeed {
        match_id: race.id,
        player_id: player.id,
    };
    let countdown = if session.start_date > now {
        format!("Your race starts in {}", time_until(session, now))
    } else {
        "Your race starts now".to_string()
    };

    let Some(seed) = &race.seed else {
        let body = format!(
            "{}, the seed will be announced separately.",
            countdown
        );
        return Notification::to_user(&player.external_id, kind, body).with_ordering_key(session.id);
    };

    if seed.patch.is_empty() {
        let body = format!(
            "Your seed is `{}` (generator {}).\n\
             {}, **do not explore the seed before the match starts**.",
            seed.seed, seed.generator_version, countdown
        );
        return Notification::to_user(&player.external_id, kind, body).with_ordering_key(session.id);
    }

    let body = format!(
        "Here is your seed in _Patch_ format, apply it to your ROM with the randomizer.\n\
         {}, **do not explore the seed before the match starts**.",
        countdown
    );
    Notification::to_user(&player.external_id, kind, body)
        .with_ordering_key(session.id)
        .with_file(NotificationFile {
            name: seed_file_name(session),
            content_type: SEED_CONTENT_TYPE.to_string(),
            data: seed.patch.clone(),
        })
}

fn entry_time(entry: &MatchEntry) -> String {
    entry
        .duration()
        .map(format_duration)
        .unwrap_or_else(|| "-".to_string())
}

/// Result of a resolved match, addressed to the owner of `own`
pub fn match_end(
    session: &MatchSession,
    race: &Match,
    own: &MatchEntry,
    opponent_entry: &MatchEntry,
    player: &Player,
    opponent: &Player,
) -> Notification {
    let mut body = format!("{}, your race against {} has ended.\n", player.name, opponent.name);

    match own.status {
        EntryStatus::Forfeit => {
            body.push_str(&format!("You forfeited your race after {}.\n", entry_time(own)))
        }
        EntryStatus::Finished => {
            body.push_str(&format!("You completed your race in {}.\n", entry_time(own)))
        }
        _ => {}
    }
    match opponent_entry.status {
        EntryStatus::Forfeit => body.push_str(&format!(
            "{} forfeited after {}.\n",
            opponent.name,
            entry_time(opponent_entry)
        )),
        EntryStatus::Finished => body.push_str(&format!(
            "{} completed their race in {}.\n",
            opponent.name,
            entry_time(opponent_entry)
        )),
        _ => {}
    }

    let outcome = own.outcome.unwrap_or(Outcome::Draw);
    match outcome {
        Outcome::Win => body.push_str("**You won!**"),
        Outcome::Draw => body.push_str("**The race is a draw.**"),
        Outcome::Loss => body.push_str(&format!("**{} wins.**", opponent.name)),
    }

    Notification::to_user(
        &player.external_id,
        NotificationKind::MatchEnd {
            match_id: race.id,
            player_id: player.id,
            outcome,
        },
        body,
    )
    .with_ordering_key(session.id)
}

/// Plain-text results table of a session
pub fn recap_table(matches: &[Match], names: &HashMap<PlayerId, String>) -> String {
    let cell = |entry: &MatchEntry| -> (String, String) {
        let name = names
            .get(&entry.player_id)
            .cloned()
            .unwrap_or_else(|| entry.player_id.to_string());
        let name = if entry.outcome == Some(Outcome::Win) {
            format!("*{}*", name)
        } else {
            name
        };
        let time = if entry.status == EntryStatus::Forfeit {
            "forfeit".to_string()
        } else {
            entry_time(entry)
        };
        (name, time)
    };

    let mut rows = vec![[
        "Player 1".to_string(),
        String::new(),
        "vs".to_string(),
        "Player 2".to_string(),
        String::new(),
        "Seed".to_string(),
    ]];
    for race in matches {
        let (name0, time0) = cell(&race.entries[0]);
        let (name1, time1) = cell(&race.entries[1]);
        let seed = race
            .seed
            .as_ref()
            .map(|s| s.seed.clone())
            .unwrap_or_default();
        rows.push([name0, time0, String::new(), name1, time1, seed]);
    }

    let mut widths = [0usize; 6];
    for row in &rows {
        for (width, value) in widths.iter_mut().zip(row.iter()) {
            *width = (*width).max(value.chars().count());
        }
    }

    let mut table = String::new();
    for row in &rows {
        let line: Vec<String> = row
            .iter()
            .zip(widths.iter())
            .map(|(value, width)| format!("{:<width$}", value, width = width))
            .collect();
        table.push_str(line.join("  ").trim_end());
        table.push('\n');
    }
    table
}

pub fn session_recap(
    league: &League,
    session: &MatchSession,
    matches: &[Match],
    names: &HashMap<PlayerId, String>,
) -> Notification {
    let body = format!(
        "Results for latest `{}` race:\n```\n{}```\n",
        league.short_code,
        recap_table(matches, names)
    );

    Notification::to_channel(
        &league.announce_channel_id,
        NotificationKind::SessionRecap {
            session_id: session.id,
        },
        body,
    )
    .with_ordering_key(session.id)
}

/// Answer to a player command
pub fn command_reply(external_id: &str, command: &str, success: bool, text: &str) -> Notification {
    Notification::to_user(
        external_id,
        NotificationKind::CommandReply {
            command: command.to_string(),
            success,
        },
        text,
    )
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::{LeagueSchedule, MatchSeed, PlayerRating};
    use crate::utils::generate_id;
    use chrono::{Duration, TimeZone};

    fn league() -> League {
        League {
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
        }
    }

    fn start() -> DateTime<Utc> {
        Utc.with_ymd_and_hms(2024, 5, 1, 20, 0, 0).unwrap()
    }

    fn session(status: SessionStatus) -> MatchSession {
        MatchSession {
            id: generate_id(),
            league_id: generate_id(),
            start_date: start(),
            status,
            player_ids: vec![generate_id(), generate_id()],
            kicked_player_id: None,
            countdowns_sent: Vec::new(),
            created_at: start() - Duration::days(1),
            closed_at: None,
        }
    }

    fn player(name: &str) -> Player {
        Player {
            id: generate_id(),
            name: name.to_string(),
            external_id: format!("ext-{}", name),
            rating: PlayerRating::default(),
            rating_period_start: start(),
            games_played: 0,
            created_at: start(),
            version: 0,
        }
    }

    fn entry(player: &Player, status: EntryStatus, seconds: i64, outcome: Outcome) -> MatchEntry {
        MatchEntry {
            id: generate_id(),
            match_id: generate_id(),
            player_id: player.id,
            status,
            outcome: Some(outcome),
            started_at: Some(start()),
            ended_at: Some(start() + Duration::seconds(seconds)),
        }
    }

    fn resolved_match(a: &Player, b: &Player, seed: Option<MatchSeed>) -> Match {
        Match {
            id: generate_id(),
            league_id: generate_id(),
            session_id: generate_id(),
            entries: [
                entry(a, EntryStatus::Finished, 3723, Outcome::Win),
                entry(b, EntryStatus::Forfeit, 600, Outcome::Loss),
            ],
            seed,
            created_at: start(),
            resolved_at: Some(start() + Duration::hours(2)),
            rated: false,
        }
    }

    #[test]
    fn test_status_bodies() {
        let league = league();
        let now = start() - Duration::minutes(30);

        let joinable = session_status(&league, &session(SessionStatus::Joinable), now);
        assert!(joinable.body.contains("can now be joined"));
        assert!(joinable.body.contains("(in 30m00s)"));

        let preparing = session_status(&league, &session(SessionStatus::Preparing), now);
        assert!(preparing.body.contains("sent to the 2 contestants"));

        let started = session_status(&league, &session(SessionStatus::InProgress), start());
        assert!(started.body.ends_with("@here"));
        assert_eq!(started.recipient.id(), "announcements");
    }

    #[test]
    fn test_countdown_mentions_channel_in_last_minute() {
        let league = league();
        let session = session(SessionStatus::Preparing);

        assert!(!session_countdown(&league, &session, 300).body.contains("@here"));
        assert!(session_countdown(&league, &session, 60).body.ends_with("@here"));
        assert!(session_countdown(&league, &session, 5).body.contains("starts in 5s"));
    }

    #[test]
    fn test_seed_with_patch_is_attached() {
        let session = session(SessionStatus::InProgress);
        let (a, b) = (player("alice"), player("bob"));
        let race = resolved_match(
            &a,
            &b,
            Some(MatchSeed {
                seed: "ABCD".to_string(),
                generator_version: "v1".to_string(),
                patch: vec![0x78, 0x9c],
                spoiler_log: None,
            }),
        );

        let notification = match_seed(&session, &race, &a, start() - Duration::minutes(15));

        assert_eq!(notification.files.len(), 1);
        assert_eq!(notification.files[0].name, "seed_2024-05-01_20h00.zpf");
        assert_eq!(notification.files[0].content_type, SEED_CONTENT_TYPE);
        assert_eq!(notification.recipient.id(), "ext-alice");
    }

    #[test]
    fn test_seed_without_patch_shows_seed_string() {
        let session = session(SessionStatus::InProgress);
        let (a, b) = (player("alice"), player("bob"));
        let race = resolved_match(
            &a,
            &b,
            Some(MatchSeed {
                seed: "WXYZ".to_string(),
                generator_version: "v1".to_string(),
                patch: Vec::new(),
                spoiler_log: None,
            }),
        );

        let notification = match_seed(&session, &race, &b, start());
        assert!(notification.files.is_empty());
        assert!(notification.body.contains("`WXYZ`"));
    }

    #[test]
    fn test_match_end_body() {
        let session = session(SessionStatus::InProgress);
        let (a, b) = (player("alice"), player("bob"));
        let race = resolved_match(&a, &b, None);

        let winner = match_end(&session, &race, &race.entries[0], &race.entries[1], &a, &b);
        assert!(winner.body.contains("You completed your race in 1h02m03s."));
        assert!(winner.body.contains("bob forfeited after 10m00s."));
        assert!(winner.body.ends_with("**You won!**"));

        let loser = match_end(&session, &race, &race.entries[1], &race.entries[0], &b, &a);
        assert!(loser.body.ends_with("**alice wins.**"));
    }

    #[test]
    fn test_recap_table_marks_winner_and_forfeit() {
        let (a, b) = (player("alice"), player("bob"));
        let race = resolved_match(&a, &b, None);
        let names: HashMap<PlayerId, String> =
            [(a.id, a.name.clone()), (b.id, b.name.clone())].into();

        let table = recap_table(&[race], &names);
        let lines: Vec<&str> = table.lines().collect();

        assert_eq!(lines.len(), 2);
        assert!(lines[0].starts_with("Player 1"));
        assert!(lines[1].starts_with("*alice*"));
        assert!(lines[1].contains("1h02m03s"));
        assert!(lines[1].contains("forfeit"));
    }
}
