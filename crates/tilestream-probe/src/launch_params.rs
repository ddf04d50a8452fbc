//! Launch parameter parsing for the probe.
//!
//! Parameters come from command-line arguments. An optional JSON config file
//! supplies a full [`TilesetConfig`]; individual flags override it.

use std::path::PathBuf;

use clap::Parser;
use tilestream::{Error, TilesetConfig};

/// Default number of frames to simulate.
const DEFAULT_FRAMES: u32 = 240;
/// Default frame pacing in milliseconds (about 60 fps).
const DEFAULT_FRAME_MS: u64 = 16;

/// Launch parameters for the probe.
#[derive(Parser, Debug)]
#[command(about = "Stream a tileset around an orbiting camera and report pipeline stats")]
pub struct LaunchParams {
    /// Path or http(s) URL of the tileset manifest.
    pub tileset: String,

    /// Number of frames to simulate.
    #[arg(long, default_value_t = DEFAULT_FRAMES)]
    pub frames: u32,

    /// Screen-space error in pixels below which tiles are not refined.
    #[arg(long)]
    pub error_target: Option<f64>,

    /// Screen-space error at which previously active tiles refine.
    #[arg(long)]
    pub error_threshold: Option<f64>,

    /// Deepest level that is ever refined.
    #[arg(long)]
    pub max_depth: Option<u32>,

    /// Also load the siblings of active tiles.
    #[arg(long)]
    pub load_siblings: bool,

    /// Cache size eviction trims down to.
    #[arg(long)]
    pub cache_min: Option<usize>,

    /// Cache size above which eviction starts.
    #[arg(long)]
    pub cache_max: Option<usize>,

    /// Orbit radius in meters. Defaults to the diagonal of the tileset bounds.
    #[arg(long)]
    pub orbit_radius: Option<f64>,

    /// Milliseconds to sleep between frames.
    #[arg(long, default_value_t = DEFAULT_FRAME_MS)]
    pub frame_ms: u64,

    /// JSON file with a tileset configuration.
    #[arg(long)]
    pub config: Option<PathBuf>,
}

impl LaunchParams {
    /// Whether the manifest is fetched over HTTP.
    pub fn is_remote(&self) -> bool {
        self.tileset.starts_with("http://") || self.tileset.starts_with("https://")
    }

    /// Build the tileset configuration from the config file and flags.
    pub fn tileset_config(&self) -> tilestream::Result<TilesetConfig> {
        let mut config = match &self.config {
            Some(path) => {
                let source = std::fs::read_to_string(path).map_err(|e| Error::Io {
                    path: path.display().to_string(),
                    message: e.to_string(),
                })?;
                TilesetConfig::from_json(&source)?
            }
            None => TilesetConfig::default(),
        };

        if let Some(error_target) = self.error_target {
            config.error_target = error_target;
        }
        if let Some(error_threshold) = self.error_threshold {
            config.error_threshold = error_threshold;
        }
        if let Some(max_depth) = self.max_depth {
            config.max_depth = max_depth;
        }
        config.load_siblings |= self.load_siblings;
        if let Some(min_size) = self.cache_min {
            config.cache.min_size = min_size;
        }
        if let Some(max_size) = self.cache_max {
            config.cache.max_size = max_size;
        }

        config.validate()?;
        Ok(config)
    }
}
