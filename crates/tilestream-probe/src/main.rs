//! Headless driver for the tilestream engine.
//!
//! Loads a tileset, orbits a camera around it for a fixed number of frames
//! and logs the counters a viewer's diagnostics panel would show.

mod launch_params;

use std::process::ExitCode;
use std::sync::Arc;
use std::time::Duration;

use clap::Parser;
use glam::DVec3;
use launch_params::LaunchParams;
use tilestream::{
    Error, Fetcher, FileFetcher, HttpFetcher, TaskSpawner, TileContentParser, TileTree, Tileset,
    View,
};

/// Vertical field of view of the simulated camera.
const FOV_Y: f64 = std::f64::consts::FRAC_PI_4;
/// Simulated viewport size in pixels.
const VIEWPORT: (f64, f64) = (1920.0, 1080.0);
/// Tilesets centered this far from the origin are treated as geocentric.
const GEOCENTRIC_THRESHOLD: f64 = 1.0e6;

fn main() -> ExitCode {
    {
        use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};
        tracing_subscriber::registry()
            .with(tracing_subscriber::fmt::layer())
            .with(
                tracing_subscriber::EnvFilter::try_from_default_env()
                    .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info")),
            )
            .init();
    }

    let params = LaunchParams::parse();

    let runtime = match tokio::runtime::Builder::new_multi_thread()
        .enable_all()
        .build()
    {
        Ok(runtime) => runtime,
        Err(e) => {
            tracing::error!("Failed to start async runtime: {}", e);
            return ExitCode::FAILURE;
        }
    };

    match runtime.block_on(run(params)) {
        Ok(()) => ExitCode::SUCCESS,
        Err(e) => {
            tracing::error!("{}", e);
            ExitCode::FAILURE
        }
    }
}

/// Read the manifest and pick the matching transport for tile content.
async fn load_tree(params: &LaunchParams) -> tilestream::Result<(TileTree, Arc<dyn Fetcher>)> {
    if params.is_remote() {
        let http = HttpFetcher::new();
        let bytes = http.get(&params.tileset).await?;
        let source = String::from_utf8_lossy(&bytes);
        let tree = TileTree::load_with_base(&source, &params.tileset)?;
        let fetcher: Arc<dyn Fetcher> = Arc::new(http);
        Ok((tree, fetcher))
    } else {
        let source = tokio::fs::read_to_string(&params.tileset)
            .await
            .map_err(|e| Error::Io {
                path: params.tileset.clone(),
                message: e.to_string(),
            })?;
        let tree = TileTree::load_with_base(&source, &params.tileset)?;
        let fetcher: Arc<dyn Fetcher> = Arc::new(FileFetcher::default());
        Ok((tree, fetcher))
    }
}

async fn run(params: LaunchParams) -> tilestream::Result<()> {
    let config = params.tileset_config()?;
    let (tree, fetcher) = load_tree(&params).await?;
    tracing::info!(
        "Loaded tileset: {} tiles, depth {}, version {}",
        tree.len(),
        tree.max_depth(),
        tree.asset_version().unwrap_or("unknown")
    );

    let bounds = tree.bounds();
    let center = bounds.center();
    let radius = params
        .orbit_radius
        .unwrap_or_else(|| bounds.size().length())
        .max(1.0);
    // Geocentric tilesets orbit around the local vertical.
    let up = if center.length() > GEOCENTRIC_THRESHOLD {
        center.normalize()
    } else {
        DVec3::Z
    };
    let east = up.any_orthonormal_vector();
    let north = up.cross(east);

    let mut tileset = Tileset::new(
        tree,
        fetcher,
        TileContentParser,
        config,
        TaskSpawner::current(),
    )?;

    let frames = params.frames.max(1);
    for frame in 0..frames {
        let angle = std::f64::consts::TAU * f64::from(frame) / f64::from(frames);
        let eye = center + (east * angle.cos() + north * angle.sin() + up * 0.5) * radius;
        let view = View::looking_at(eye, center, up, FOV_Y, VIEWPORT, (1.0, radius * 10.0));

        let summary = tileset.update(&view);
        let stats = tileset.stats();
        tracing::info!(
            "Frame {}: Downloading: {} Parsing: {} Active: {} Visible: {} Cache: {:.0}% ({:.1} MB)",
            summary.frame,
            stats.downloading + stats.pending_downloads,
            stats.parsing + stats.pending_parses,
            stats.active,
            stats.visible,
            tileset.cache_fullness() * 100.0,
            stats.cache_megabytes()
        );
        if !summary.evicted.is_empty() {
            tracing::debug!("Evicted {} tiles", summary.evicted.len());
        }

        tokio::time::sleep(Duration::from_millis(params.frame_ms)).await;
    }

    let stats = tileset.stats();
    tracing::info!(
        "Finished after {} frames: {} cached ({:.1} MB), {} failed{}",
        stats.frame,
        stats.cache_item_count,
        stats.cache_megabytes(),
        stats.failed,
        if stats.cache_over_budget {
            ", cache over budget"
        } else {
            ""
        }
    );
    Ok(())
}
