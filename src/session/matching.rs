//! Pairing of a session's frozen player set

use crate::error::{LadderError, Result};
use crate::types::PlayerId;
use rand::seq::SliceRandom;

/// Turns an even set of players into disjoint 1v1 pairs
pub trait Matchmaker: Send + Sync {
    /// Pair every player exactly once; an odd count is a caller bug
    fn pair(&self, players: &[PlayerId]) -> Result<Vec<(PlayerId, PlayerId)>>;
}

/// Uniformly random pairing, reshuffled on every call
#[derive(Debug, Default, Clone, Copy)]
pub struct RandomMatchmaker;

impl Matchmaker for RandomMatchmaker {
    fn pair(&self, players: &[PlayerId]) -> Result<Vec<(PlayerId, PlayerId)>> {
        if players.len() % 2 != 0 {
            return Err(LadderError::OddCount {
                count: players.len(),
            }
            .into());
        }

        let mut shuffled = players.to_vec();
        shuffled.shuffle(&mut rand::thread_rng());

        Ok(shuffled
            .chunks_exact(2)
            .map(|pair| (pair[0], pair[1]))
            .collect())
    }
}
