//! Rating system built on the Glicko-2 algorithm
//!
//! This module provides the pure rating engine (match updates and inactivity
//! decay) and leaderboard construction. Nothing here performs I/O.

pub mod glicko2;
pub mod leaderboard;

// Re-export commonly used types
pub use glicko2::{DecayOutcome, MatchRatingResult, RatingChange, RatingEngine};
pub use leaderboard::build_leaderboard;
