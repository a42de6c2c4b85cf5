//! Rating system configuration

use crate::error::{LadderError, Result};
use crate::types::PlayerRating;
use serde::{Deserialize, Serialize};
use skillratings::glicko2::Glicko2Config;

/// Glicko-2 parameters and inactivity decay policy
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct RatingConfig {
    pub initial_rating: f64,
    pub initial_deviation: f64,
    pub initial_volatility: f64,
    /// System constant constraining volatility change
    pub tau: f64,
    pub convergence_tolerance: f64,
    /// Length of an inactivity period; one decay step is applied per elapsed period
    pub decay_period_seconds: i64,
}

impl Default for RatingConfig {
    fn default() -> Self {
        Self {
            initial_rating: 1500.0,
            initial_deviation: 350.0,
            initial_volatility: 0.06,
            tau: 0.5,
            convergence_tolerance: 0.000_001,
            decay_period_seconds: 7 * 24 * 3600,
        }
    }
}

impl RatingConfig {
    pub fn initial(&self) -> PlayerRating {
        PlayerRating {
            rating: self.initial_rating,
            deviation: self.initial_deviation,
            volatility: self.initial_volatility,
        }
    }

    pub fn glicko2_config(&self) -> Glicko2Config {
        Glicko2Config {
            tau: self.tau,
            convergence_tolerance: self.convergence_tolerance,
        }
    }

    pub fn validate(&self) -> Result<()> {
        if self.initial_deviation <= 0.0 {
            return Err(LadderError::ConfigurationError {
                message: "Initial deviation must be positive".to_string(),
            }
            .into());
        }
        if self.initial_volatility <= 0.0 {
            return Err(LadderError::ConfigurationError {
                message: "Initial volatility must be positive".to_string(),
            }
            .into());
        }
        if self.tau <= 0.0 {
            return Err(LadderError::ConfigurationError {
                message: "Tau must be positive".to_string(),
            }
            .into());
        }
        if self.convergence_tolerance <= 0.0 {
            return Err(LadderError::ConfigurationError {
                message: "Convergence tolerance must be positive".to_string(),
            }
            .into());
        }
        if self.decay_period_seconds <= 0 {
            return Err(LadderError::ConfigurationError {
                message: "Decay period must be positive".to_string(),
            }
            .into());
        }
        Ok(())
    }
}
