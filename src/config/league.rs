//! League configuration

use crate::error::{LadderError, Result};
use crate::types::{League, LeagueSchedule};
use crate::utils::generate_id;
use chrono::{DateTime, TimeZone, Utc};
use serde::{Deserialize, Serialize};

/// League declaration as found in the configuration file
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct LeagueConfig {
    pub name: String,
    pub short_code: String,
    pub announce_channel_id: String,
    pub joinable_offset_seconds: i64,
    pub preparation_offset_seconds: i64,
    pub deviation_threshold: f64,
    pub schedule_anchor: DateTime<Utc>,
    pub schedule_interval_seconds: i64,
    pub generator_settings: serde_json::Value,
    pub generator_version: String,
}

impl Default for LeagueConfig {
    fn default() -> Self {
        Self {
            name: "Standard".to_string(),
            short_code: "std".to_string(),
            announce_channel_id: "announcements".to_string(),
            joinable_offset_seconds: 3600,
            preparation_offset_seconds: 900,
            deviation_threshold: 120.0,
            schedule_anchor: Utc
                .with_ymd_and_hms(2024, 1, 1, 20, 0, 0)
                .single()
                .unwrap_or_else(Utc::now),
            schedule_interval_seconds: 24 * 3600,
            generator_settings: serde_json::Value::Null,
            generator_version: String::new(),
        }
    }
}

impl LeagueConfig {
    pub fn validate(&self) -> Result<()> {
        if self.short_code.is_empty()
            || !self
                .short_code
                .chars()
                .all(|c| c.is_ascii_alphanumeric() || c == '-' || c == '_')
        {
            return Err(LadderError::ConfigurationError {
                message: format!("Invalid league short code: `{}`", self.short_code),
            }
            .into());
        }
        if self.preparation_offset_seconds <= 0 {
            return Err(LadderError::ConfigurationError {
                message: format!(
                    "League `{}`: preparation offset must be positive",
                    self.short_code
                ),
            }
            .into());
        }
        if self.joinable_offset_seconds <= self.preparation_offset_seconds {
            return Err(LadderError::ConfigurationError {
                message: format!(
                    "League `{}`: joinable offset must be larger than preparation offset",
                    self.short_code
                ),
            }
            .into());
        }
        if self.schedule_interval_seconds <= self.joinable_offset_seconds {
            return Err(LadderError::ConfigurationError {
                message: format!(
                    "League `{}`: schedule interval must be larger than joinable offset",
                    self.short_code
                ),
            }
            .into());
        }
        if self.deviation_threshold <= 0.0 {
            return Err(LadderError::ConfigurationError {
                message: format!(
                    "League `{}`: deviation threshold must be positive",
                    self.short_code
                ),
            }
            .into());
        }
        Ok(())
    }

    /// Build the league record with a fresh id
    pub fn into_league(self) -> League {
        League {
            id: generate_id(),
            name: self.name,
            short_code: self.short_code.to_lowercase(),
            announce_channel_id: self.announce_channel_id,
            joinable_offset_seconds: self.joinable_offset_seconds,
            preparation_offset_seconds: self.preparation_offset_seconds,
            deviation_threshold: self.deviation_threshold,
            schedule: LeagueSchedule {
                anchor: self.schedule_anchor,
                interval_seconds: self.schedule_interval_seconds,
            },
            generator_settings: self.generator_settings,
            generator_version: self.generator_version,
        }
    }
}
