//! Seed-generation collaborator

use crate::error::Result;
use async_trait::async_trait;
use rand::distributions::Alphanumeric;
use rand::Rng;

/// Output of an external seed generator
#[derive(Debug, Clone, Default, PartialEq)]
pub struct GeneratedSeed {
    /// Patch to apply to the game image; empty when the generator only names the seed
    pub patch: Vec<u8>,
    pub spoiler_log: Option<String>,
}

/// Produces the patch for one match at race start
#[cfg_attr(test, mockall::automock)]
#[async_trait]
pub trait SeedGenerator: Send + Sync {
    async fn generate_seed(
        &self,
        settings: &serde_json::Value,
        version: &str,
        seed: &str,
    ) -> Result<GeneratedSeed>;
}

/// Generator used when no randomizer is wired in: players only get the seed string
#[derive(Debug, Default, Clone, Copy)]
pub struct UnpatchedSeedGenerator;

#[async_trait]
impl SeedGenerator for UnpatchedSeedGenerator {
    async fn generate_seed(
        &self,
        _settings: &serde_json::Value,
        _version: &str,
        _seed: &str,
    ) -> Result<GeneratedSeed> {
        Ok(GeneratedSeed::default())
    }
}

/// Random seed string handed to the generator
pub fn random_seed_string() -> String {
    rand::thread_rng()
        .sample_iter(&Alphanumeric)
        .take(10)
        .map(|c| char::from(c).to_ascii_uppercase())
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_seed_string_shape() {
        let seed = random_seed_string();
        assert_eq!(seed.len(), 10);
        assert!(seed.chars().all(|c| c.is_ascii_uppercase() || c.is_ascii_digit()));
    }

    #[tokio::test]
    async fn test_unpatched_generator_returns_empty_patch() {
        let generated = UnpatchedSeedGenerator
            .generate_seed(&serde_json::Value::Null, "v1", "ABC")
            .await
            .unwrap();
        assert!(generated.patch.is_empty());
        assert!(generated.spoiler_log.is_none());
    }
}
