//! Glicko-2 rating engine
//!
//! Thin layer over the skillratings crate that adds the ladder's inactivity
//! decay policy: one deviation decay step per whole elapsed period, applied
//! before any match-based update.

use crate::config::RatingConfig;
use crate::types::{Outcome, PlayerRating};
use chrono::{DateTime, Duration, Utc};
use serde::{Deserialize, Serialize};
use skillratings::glicko2::{decay_deviation, glicko2, Glicko2Config, Glicko2Rating};
use skillratings::Outcomes;

/// Result of applying the inactivity decay to one rating
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct DecayOutcome {
    pub rating: PlayerRating,
    /// Start of the period still in progress after decay
    pub period_start: DateTime<Utc>,
    pub periods_applied: u32,
}

/// Rating change of one player after a match
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct RatingChange {
    pub old_rating: PlayerRating,
    pub new_rating: PlayerRating,
    pub decay_periods: u32,
}

impl RatingChange {
    pub fn delta(&self) -> f64 {
        self.new_rating.rating - self.old_rating.rating
    }
}

/// Rating changes for both players of a match
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct MatchRatingResult {
    pub first: RatingChange,
    pub second: RatingChange,
}

/// Pure Glicko-2 rating engine
#[derive(Debug, Clone)]
pub struct RatingEngine {
    config: RatingConfig,
    glicko2_config: Glicko2Config,
}

impl Default for RatingEngine {
    fn default() -> Self {
        let config = RatingConfig::default();
        let glicko2_config = config.glicko2_config();
        Self {
            config,
            glicko2_config,
        }
    }
}

impl RatingEngine {
    /// Create a new rating engine
    pub fn new(config: RatingConfig) -> crate::error::Result<Self> {
        config.validate()?;
        let glicko2_config = config.glicko2_config();

        Ok(Self {
            config,
            glicko2_config,
        })
    }

    pub fn config(&self) -> &RatingConfig {
        &self.config
    }

    /// Rating given to newly registered players
    pub fn initial_rating(&self) -> PlayerRating {
        self.config.initial()
    }

    /// Glicko-2 update for a single game, `outcome` seen from `first`
    pub fn update_ratings(
        &self,
        first: &PlayerRating,
        second: &PlayerRating,
        outcome: Outcome,
    ) -> (PlayerRating, PlayerRating) {
        let outcome = match outcome {
            Outcome::Win => Outcomes::WIN,
            Outcome::Draw => Outcomes::DRAW,
            Outcome::Loss => Outcomes::LOSS,
        };

        let first: Glicko2Rating = (*first).into();
        let second: Glicko2Rating = (*second).into();
        let (new_first, new_second) = glicko2(&first, &second, &outcome, &self.glicko2_config);

        (new_first.into(), new_second.into())
    }

    /// One decay step; deviation never grows past the initial deviation
    pub fn decay_once(&self, rating: &PlayerRating) -> PlayerRating {
        let decayed: PlayerRating = decay_deviation(&Glicko2Rating::from(*rating)).into();
        let ceiling = self.config.initial_deviation.max(rating.deviation);

        PlayerRating {
            deviation: decayed.deviation.min(ceiling),
            ..decayed
        }
    }

    /// Apply one decay step per whole period elapsed since `period_start`.
    ///
    /// The returned `period_start` is advanced by exactly the applied periods,
    /// so calling this again at the same `now` is a no-op.
    pub fn apply_inactivity_decay(
        &self,
        rating: &PlayerRating,
        period_start: DateTime<Utc>,
        now: DateTime<Utc>,
    ) -> DecayOutcome {
        let period = self.config.decay_period_seconds.max(1);
        let elapsed = (now - period_start).num_seconds();
        if elapsed < period {
            return DecayOutcome {
                rating: *rating,
                period_start,
                periods_applied: 0,
            };
        }

        let periods = elapsed / period;
        let mut decayed = *rating;
        for _ in 0..periods {
            decayed = self.decay_once(&decayed);
        }

        DecayOutcome {
            rating: decayed,
            period_start: period_start + Duration::seconds(periods * period),
            periods_applied: u32::try_from(periods).unwrap_or(u32::MAX),
        }
    }

    /// Decay both players for their inactivity, then apply the match result.
    ///
    /// Both players start a fresh rating period at `now` afterwards.
    pub fn rate_match(
        &self,
        first: (&PlayerRating, DateTime<Utc>),
        second: (&PlayerRating, DateTime<Utc>),
        outcome: Outcome,
        now: DateTime<Utc>,
    ) -> MatchRatingResult {
        let first_decay = self.apply_inactivity_decay(first.0, first.1, now);
        let second_decay = self.apply_inactivity_decay(second.0, second.1, now);

        let (new_first, new_second) =
            self.update_ratings(&first_decay.rating, &second_decay.rating, outcome);

        MatchRatingResult {
            first: RatingChange {
                old_rating: *first.0,
                new_rating: new_first,
                decay_periods: first_decay.periods_applied,
            },
            second: RatingChange {
                old_rating: *second.0,
                new_rating: new_second,
                decay_periods: second_decay.periods_applied,
            },
        }
    }
}
