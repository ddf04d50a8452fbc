//! Tunables for a [`Tileset`](crate::Tileset).
//!
//! Every field has a default, so a JSON file only needs the values it
//! overrides:
//!
//! ```json
//! { "error_target": 16, "cache": { "max_size": 2000 } }
//! ```

use serde::{Deserialize, Deserializer, Serialize};

use crate::error::{Error, Result};

/// Traversal, cache and queue settings.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct TilesetConfig {
    /// Screen-space error in pixels below which a tile is used as is.
    pub error_target: f64,
    /// Screen-space error a previously active tile may reach before it is
    /// refined. Values below `error_target` are treated as `error_target`.
    pub error_threshold: f64,
    /// Tiles at this depth are never refined.
    pub max_depth: u32,
    /// Also load the siblings of active tiles.
    pub load_siblings: bool,
    /// Soft cap on the number of active tiles, applied by
    /// [`Tileset::active_tiles_within_cap`](crate::Tileset::active_tiles_within_cap).
    pub max_active_tiles: Option<usize>,
    /// Cache budget.
    pub cache: CacheConfig,
    /// Download queue settings.
    #[serde(deserialize_with = "QueueConfig::deserialize_download")]
    pub download: QueueConfig,
    /// Parse queue settings.
    #[serde(deserialize_with = "QueueConfig::deserialize_parse")]
    pub parse: QueueConfig,
}

impl Default for TilesetConfig {
    fn default() -> Self {
        Self {
            error_target: 6.0,
            error_threshold: 60.0,
            max_depth: 15,
            load_siblings: false,
            max_active_tiles: None,
            cache: CacheConfig::default(),
            download: QueueConfig::download(),
            parse: QueueConfig::parse(),
        }
    }
}

/// Cache budget in number of resident tiles.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct CacheConfig {
    /// Eviction stops once the cache is down to this many entries.
    pub min_size: usize,
    /// Eviction starts once the cache holds more than this many entries.
    pub max_size: usize,
}

impl Default for CacheConfig {
    fn default() -> Self {
        Self {
            min_size: 600,
            max_size: 800,
        }
    }
}

/// Settings for one job queue.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct QueueConfig {
    /// Maximum simultaneously running jobs.
    pub max_jobs: usize,
    /// Schedule pending jobs automatically on every tick.
    pub auto_update: bool,
}

impl Default for QueueConfig {
    fn default() -> Self {
        Self {
            max_jobs: 1,
            auto_update: true,
        }
    }
}

/// A queue block as written, before the queue's own defaults fill the gaps.
#[derive(Deserialize)]
struct PartialQueueConfig {
    max_jobs: Option<usize>,
    auto_update: Option<bool>,
}

impl QueueConfig {
    /// Defaults of the download queue.
    #[must_use]
    pub fn download() -> Self {
        Self {
            max_jobs: 4,
            ..Self::default()
        }
    }

    /// Defaults of the parse queue.
    #[must_use]
    pub fn parse() -> Self {
        Self::default()
    }

    fn deserialize_with_defaults<'de, D>(
        deserializer: D,
        defaults: Self,
    ) -> std::result::Result<Self, D::Error>
    where
        D: Deserializer<'de>,
    {
        let partial = PartialQueueConfig::deserialize(deserializer)?;
        Ok(Self {
            max_jobs: partial.max_jobs.unwrap_or(defaults.max_jobs),
            auto_update: partial.auto_update.unwrap_or(defaults.auto_update),
        })
    }

    fn deserialize_download<'de, D>(deserializer: D) -> std::result::Result<Self, D::Error>
    where
        D: Deserializer<'de>,
    {
        Self::deserialize_with_defaults(deserializer, Self::download())
    }

    fn deserialize_parse<'de, D>(deserializer: D) -> std::result::Result<Self, D::Error>
    where
        D: Deserializer<'de>,
    {
        Self::deserialize_with_defaults(deserializer, Self::parse())
    }
}

impl TilesetConfig {
    /// Parse a configuration from JSON and validate it.
    pub fn from_json(source: &str) -> Result<Self> {
        let config: Self = serde_json::from_str(source).map_err(|e| Error::Config {
            detail: e.to_string(),
        })?;
        config.validate()?;
        Ok(config)
    }

    /// Check that the values are usable.
    pub fn validate(&self) -> Result<()> {
        let fail = |detail: &str| {
            Err(Error::Config {
                detail: detail.to_string(),
            })
        };

        if !self.error_target.is_finite() || self.error_target < 0.0 {
            return fail("error_target must be a non-negative number");
        }
        if self.error_threshold.is_nan() {
            return fail("error_threshold must be a number");
        }
        if self.cache.min_size > self.cache.max_size {
            return fail("cache.min_size must not exceed cache.max_size");
        }
        if self.download.max_jobs == 0 || self.parse.max_jobs == 0 {
            return fail("queues need at least one job slot");
        }
        Ok(())
    }

    /// The hysteresis threshold actually used by traversal.
    #[must_use]
    pub fn effective_error_threshold(&self) -> f64 {
        self.error_threshold.max(self.error_target)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults() {
        let config = TilesetConfig::default();
        assert!((config.error_target - 6.0).abs() < f64::EPSILON);
        assert!((config.error_threshold - 60.0).abs() < f64::EPSILON);
        assert_eq!(config.max_depth, 15);
        assert_eq!(config.cache.min_size, 600);
        assert_eq!(config.cache.max_size, 800);
        assert_eq!(config.download.max_jobs, 4);
        assert_eq!(config.parse.max_jobs, 1);
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_partial_json_keeps_defaults() {
        let config =
            TilesetConfig::from_json(r#"{ "error_target": 16, "cache": { "max_size": 2000 } }"#)
                .unwrap();
        assert!((config.error_target - 16.0).abs() < f64::EPSILON);
        assert_eq!(config.cache.max_size, 2000);
        assert_eq!(config.cache.min_size, 600);
        assert_eq!(config.download.max_jobs, 4);
    }

    #[test]
    fn test_partial_queue_block_keeps_queue_defaults() {
        let config =
            TilesetConfig::from_json(r#"{ "download": { "auto_update": false }, "parse": {} }"#)
                .unwrap();
        assert_eq!(config.download.max_jobs, 4);
        assert!(!config.download.auto_update);
        assert_eq!(config.parse, QueueConfig::parse());

        let config = TilesetConfig::from_json(r#"{ "parse": { "max_jobs": 3 } }"#).unwrap();
        assert_eq!(config.parse.max_jobs, 3);
        assert!(config.parse.auto_update);
        assert_eq!(config.download, QueueConfig::download());
    }

    #[test]
    fn test_config_round_trips_through_json() {
        let mut config = TilesetConfig::default();
        config.download.auto_update = false;
        let json = serde_json::to_string(&config).unwrap();
        assert_eq!(TilesetConfig::from_json(&json).unwrap(), config);
    }

    #[test]
    fn test_invalid_config() {
        assert!(matches!(
            TilesetConfig::from_json(r#"{ "cache": { "min_size": 10, "max_size": 5 } }"#),
            Err(Error::Config { .. })
        ));
        assert!(TilesetConfig::from_json(r#"{ "download": { "max_jobs": 0 } }"#).is_err());
        assert!(TilesetConfig::from_json("not json").is_err());
    }

    #[test]
    fn test_threshold_is_clamped_to_target() {
        let config = TilesetConfig {
            error_target: 20.0,
            error_threshold: 5.0,
            ..TilesetConfig::default()
        };
        assert!((config.effective_error_threshold() - 20.0).abs() < f64::EPSILON);
    }
}
