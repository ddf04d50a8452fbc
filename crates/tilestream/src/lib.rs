//! Streaming manager for hierarchical level-of-detail tilesets.
//!
//! This crate walks a 3D Tiles style tile tree once per frame, picks the
//! tiles that best match the current view, and keeps their content resident
//! through prioritized background downloads and a bounded LRU cache.
//!
//! # Design principles
//!
//! - **Explicit ticks**: nothing happens between calls to [`Tileset::update`]
//! - **Arena tree**: nodes are addressed by [`TileId`]; per-frame state lives
//!   in a parallel table
//! - **Pluggable I/O**: content comes from a [`Fetcher`] and is decoded by a
//!   [`ContentParser`]
//!
//! # Example
//!
//! ```ignore
//! use std::sync::Arc;
//! use tilestream::{FileFetcher, TaskSpawner, TileContentParser, TileTree, Tileset, TilesetConfig, View};
//!
//! let tree = TileTree::load_with_base(&manifest, "data/tileset.json")?;
//! let mut tileset = Tileset::new(
//!     tree,
//!     Arc::new(FileFetcher::default()),
//!     TileContentParser,
//!     TilesetConfig::default(),
//!     TaskSpawner::current(),
//! )?;
//!
//! loop {
//!     tileset.update(&View::new(camera, fov_y, width, height));
//!     for (tile, content) in tileset.visible_tiles() {
//!         // Draw.
//!     }
//! }
//! ```

pub mod bounds;
pub mod cache;
pub mod config;
pub mod content;
mod error;
pub mod fetch;
pub mod manifest;
pub mod queue;
mod runtime;
mod stats;
mod tileset;
pub mod tree;
pub mod view;

pub use bounds::{Aabb, BoundingVolume, OrientedBoundingBox};
pub use cache::{CacheEntry, ResourceCache};
pub use config::{CacheConfig, QueueConfig, TilesetConfig};
pub use content::{ContentFormat, ContentParser, TileContent, TileContentParser};
pub use error::{Error, Result};
pub use fetch::{Fetcher, FileFetcher, HttpFetcher, MemoryFetcher};
pub use queue::{Completion, JobQueue, JobState, PriorityInfo};
pub use runtime::{JobFuture, TaskSpawner};
pub use stats::{MetadataValue, TilesetStats};
pub use tileset::{FrameSummary, LoadState, QueueSettings, TileRuntimeState, Tileset};
pub use tree::{TileId, TileNode, TileTree};
pub use view::{Frustum, View};
