//! Leaderboard construction
//!
//! Players are ranked by the lower bound of their 95% confidence interval
//! (`rating - 2×deviation`); provisional players are left out.

use crate::types::{LeaderboardEntry, Player};

/// Rank `players` for display.
///
/// Players whose deviation is at or above `deviation_threshold` are excluded.
/// Ties on the lower bound are broken by rating, then by name.
pub fn build_leaderboard<I>(players: I, deviation_threshold: f64) -> Vec<LeaderboardEntry>
where
    I: IntoIterator<Item = Player>,
{
    let mut eligible: Vec<Player> = players
        .into_iter()
        .filter(|player| player.rating.deviation < deviation_threshold)
        .collect();

    eligible.sort_by(|a, b| {
        let (a_bounds, b_bounds) = (a.rating.bounds(), b.rating.bounds());
        b_bounds
            .lower
            .total_cmp(&a_bounds.lower)
            .then_with(|| b.rating.rating.total_cmp(&a.rating.rating))
            .then_with(|| a.name.cmp(&b.name))
    });

    eligible
        .into_iter()
        .enumerate()
        .map(|(index, player)| LeaderboardEntry {
            rank: index + 1,
            player_id: player.id,
            bounds: player.rating.bounds(),
            name: player.name,
            rating: player.rating,
            games_played: player.games_played,
        })
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::PlayerRating;
    use crate::utils::{current_timestamp, generate_id};
    use proptest::prelude::*;

    fn player(name: &str, rating: f64, deviation: f64) -> Player {
        Player {
            id: generate_id(),
            name: name.to_string(),
            external_id: format!("ext-{}", name),
            rating: PlayerRating {
                rating,
                deviation,
                volatility: 0.06,
            },
            rating_period_start: current_timestamp(),
            games_played: 3,
            created_at: current_timestamp(),
            version: 0,
        }
    }

    #[test]
    fn test_sorted_by_lower_bound() {
        let players = vec![
            // lower bound 1500
            player("alice", 1700.0, 100.0),
            // lower bound 1560
            player("bob", 1600.0, 20.0),
            // lower bound 1300
            player("carol", 1500.0, 100.0),
        ];

        let board = build_leaderboard(players, 150.0);
        let names: Vec<&str> = board.iter().map(|e| e.name.as_str()).collect();

        assert_eq!(names, vec!["bob", "alice", "carol"]);
        assert_eq!(board[0].rank, 1);
        assert_eq!(board[2].rank, 3);
        assert_eq!(board[0].bounds.lower, 1560.0);
    }

    #[test]
    fn test_provisional_players_excluded() {
        let players = vec![
            player("veteran", 1500.0, 60.0),
            player("at-threshold", 1900.0, 100.0),
            player("newcomer", 2000.0, 350.0),
        ];

        let board = build_leaderboard(players, 100.0);

        assert_eq!(board.len(), 1);
        assert_eq!(board[0].name, "veteran");
    }

    proptest! {
        #[test]
        fn prop_leaderboard_is_sorted_and_filtered(
            ratings in prop::collection::vec((1000.0f64..2500.0, 20.0f64..350.0), 0..40),
            threshold in 30.0f64..350.0,
        ) {
            let players: Vec<Player> = ratings
                .iter()
                .enumerate()
                .map(|(i, (r, d))| player(&format!("p{}", i), *r, *d))
                .collect();

            let board = build_leaderboard(players, threshold);

            for entry in &board {
                prop_assert!(entry.rating.deviation < threshold);
            }
            for pair in board.windows(2) {
                prop_assert!(pair[0].bounds.lower >= pair[1].bounds.lower);
            }
            let expected = ratings.iter().filter(|(_, d)| *d < threshold).count();
            prop_assert_eq!(board.len(), expected);
        }
    }
}
