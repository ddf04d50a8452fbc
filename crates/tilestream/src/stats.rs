//! Read-only introspection of a [`Tileset`].

use std::collections::BTreeMap;
use std::fmt;
use std::sync::Arc;

use crate::bounds::Aabb;
use crate::content::ContentParser;
use crate::tileset::{LoadState, TileRuntimeState, Tileset};
use crate::tree::TileId;

/// Counters for a diagnostics panel.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct TilesetStats {
    /// Download jobs running.
    pub downloading: usize,
    /// Parse jobs running.
    pub parsing: usize,
    /// Download jobs waiting for a slot.
    pub pending_downloads: usize,
    /// Parse jobs waiting for a slot.
    pub pending_parses: usize,
    /// Entries resident in the cache.
    pub cache_item_count: usize,
    /// Bytes resident in the cache, as sized by the content parser.
    pub cache_bytes: usize,
    /// Configured lower cache bound.
    pub cache_min_size: usize,
    /// Configured upper cache bound.
    pub cache_max_size: usize,
    /// Whether the cache holds more than `cache_max_size` entries.
    pub cache_over_budget: bool,
    /// Tiles in the active set.
    pub active: usize,
    /// Active tiles with loaded content.
    pub visible: usize,
    /// Tiles whose last load failed.
    pub failed: usize,
    /// Last update number.
    pub frame: u64,
}

impl TilesetStats {
    /// Resident cache size in mebibytes.
    #[must_use]
    #[allow(clippy::cast_precision_loss)]
    pub fn cache_megabytes(&self) -> f64 {
        self.cache_bytes as f64 / (1024.0 * 1024.0)
    }
}

/// A value in a tile's metadata table.
#[derive(Debug, Clone, PartialEq)]
pub enum MetadataValue {
    /// Counts and indices.
    Integer(u64),
    /// Distances and errors.
    Number(f64),
    /// Flags.
    Bool(bool),
    /// Names and locators.
    Text(String),
    /// Missing optional value.
    None,
}

impl fmt::Display for MetadataValue {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            MetadataValue::Integer(v) => write!(f, "{v}"),
            MetadataValue::Number(v) => write!(f, "{v:.2}"),
            MetadataValue::Bool(v) => write!(f, "{v}"),
            MetadataValue::Text(v) => f.write_str(v),
            MetadataValue::None => f.write_str("-"),
        }
    }
}

impl<P: ContentParser> Tileset<P> {
    /// Snapshot of the pipeline and cache counters.
    #[must_use]
    pub fn stats(&self) -> TilesetStats {
        let config = self.config();
        let cache = self.cache();
        let (visible, failed) = self.tree().traverse().fold((0, 0), |(visible, failed), node| {
            let state = self.runtime(node.id).copied().unwrap_or_default();
            (
                visible + usize::from(state.visible),
                failed + usize::from(state.load_state == LoadState::Failed),
            )
        });

        TilesetStats {
            downloading: self.download_queue().running_count(),
            parsing: self.parse_queue().running_count(),
            pending_downloads: self.download_queue().pending_count(),
            pending_parses: self.parse_queue().pending_count(),
            cache_item_count: cache.item_count(),
            cache_bytes: cache.total_bytes(),
            cache_min_size: config.cache.min_size,
            cache_max_size: config.cache.max_size,
            cache_over_budget: cache.is_over_budget(config.cache.max_size),
            active: self.active_tiles().len(),
            visible,
            failed,
            frame: self.frame(),
        }
    }

    /// Resident items relative to the lower cache bound, as a fraction.
    #[must_use]
    #[allow(clippy::cast_precision_loss)]
    pub fn cache_fullness(&self) -> f64 {
        let min_size = self.config().cache.min_size;
        if min_size == 0 {
            return 0.0;
        }
        self.cache().item_count() as f64 / min_size as f64
    }

    /// Bounds of the active tiles, or `None` when nothing is active.
    #[must_use]
    pub fn bounds_of_active(&self) -> Option<Aabb> {
        self.active_tiles()
            .iter()
            .filter_map(|&tile| self.tree().get(tile))
            .map(|node| node.bounding_volume.aabb())
            .reduce(Aabb::union)
    }

    /// Bounds of the whole tree.
    #[must_use]
    pub fn bounds(&self) -> Aabb {
        self.tree().bounds()
    }

    /// Loaded content for a tile.
    #[must_use]
    pub fn content_of(&self, tile: TileId) -> Option<Arc<P::Content>> {
        self.cache().get(tile).map(|entry| Arc::clone(entry.content()))
    }

    /// Visible tiles in walk order with their content.
    #[must_use]
    pub fn visible_tiles(&self) -> Vec<(TileId, Arc<P::Content>)> {
        self.active_tiles()
            .iter()
            .filter(|&&tile| self.runtime(tile).is_some_and(|s| s.visible))
            .filter_map(|&tile| self.content_of(tile).map(|content| (tile, content)))
            .collect()
    }

    /// Key/value description of a tile, for inspection panels.
    ///
    /// Returns an empty map for unknown tiles.
    #[must_use]
    pub fn metadata_of(&self, tile: TileId) -> BTreeMap<&'static str, MetadataValue> {
        let mut metadata = BTreeMap::new();
        let Some(node) = self.tree().get(tile) else {
            return metadata;
        };
        let state: TileRuntimeState = self.runtime(tile).copied().unwrap_or_default();

        metadata.insert("index", MetadataValue::Integer(u64::from(tile.0)));
        metadata.insert("depth", MetadataValue::Integer(u64::from(node.depth)));
        metadata.insert(
            "geometric_error",
            MetadataValue::Number(node.geometric_error),
        );
        metadata.insert(
            "screen_space_error",
            MetadataValue::Number(state.screen_space_error),
        );
        metadata.insert(
            "distance_to_camera",
            MetadataValue::Number(state.distance_to_camera),
        );
        metadata.insert("is_leaf", MetadataValue::Bool(node.is_leaf()));
        metadata.insert(
            "load_state",
            MetadataValue::Text(state.load_state.as_str().to_string()),
        );
        metadata.insert("active", MetadataValue::Bool(state.active));
        metadata.insert("visible", MetadataValue::Bool(state.visible));
        metadata.insert(
            "content_uri",
            node.content
                .clone()
                .map_or(MetadataValue::None, MetadataValue::Text),
        );
        metadata
    }
}

#[cfg(test)]
mod tests {
    use glam::DVec3;

    use super::*;
    use crate::config::TilesetConfig;
    use crate::content::ContentFormat;
    use crate::tileset::tests::{
        TWO_LEVEL_URIS, fetcher_with, new_tileset, payload, settle, target, view_at,
    };
    use crate::tree::tests::TWO_LEVEL;

    #[tokio::test]
    async fn test_stats_track_pipeline() {
        let fetcher = fetcher_with(&TWO_LEVEL_URIS);
        let mut tileset = new_tileset(TWO_LEVEL, &fetcher, target(10.0));
        let view = view_at(DVec3::new(0.0, 0.0, 2000.0));

        tileset.update(&view);
        let stats = tileset.stats();
        assert_eq!(stats.downloading, 2);
        assert_eq!(stats.pending_downloads, 0);
        assert_eq!(stats.active, 2);
        assert_eq!(stats.visible, 0);
        assert_eq!(stats.frame, 1);

        settle(&mut tileset, &view).await;
        let stats = tileset.stats();
        assert_eq!(stats.downloading + stats.parsing, 0);
        assert_eq!(stats.cache_item_count, 2);
        assert_eq!(stats.cache_bytes, 2 * payload().len());
        assert_eq!(stats.visible, 2);
        assert_eq!(stats.cache_min_size, 600);
        assert!(!stats.cache_over_budget);

        let sized = TilesetStats {
            cache_bytes: 3 * 1024 * 1024,
            ..stats
        };
        assert!((sized.cache_megabytes() - 3.0).abs() < f64::EPSILON);
    }

    #[tokio::test]
    async fn test_failed_count() {
        let fetcher = fetcher_with(&TWO_LEVEL_URIS);
        fetcher.remove("a/tile.b3dm");
        let mut tileset = new_tileset(TWO_LEVEL, &fetcher, target(10.0));

        settle(&mut tileset, &view_at(DVec3::new(0.0, 0.0, 2000.0))).await;
        assert_eq!(tileset.stats().failed, 1);
        assert_eq!(tileset.stats().visible, 1);
    }

    #[tokio::test]
    async fn test_cache_fullness() {
        let fetcher = fetcher_with(&TWO_LEVEL_URIS);
        let mut config = target(10.0);
        config.cache.min_size = 4;
        let mut tileset = new_tileset(TWO_LEVEL, &fetcher, config);
        assert!(tileset.cache_fullness().abs() < f64::EPSILON);

        settle(&mut tileset, &view_at(DVec3::new(0.0, 0.0, 2000.0))).await;
        assert!((tileset.cache_fullness() - 0.5).abs() < f64::EPSILON);
    }

    #[tokio::test]
    async fn test_bounds_of_active() {
        let fetcher = fetcher_with(&TWO_LEVEL_URIS);
        let mut tileset = new_tileset(TWO_LEVEL, &fetcher, target(10.0));
        assert!(tileset.bounds_of_active().is_none());

        tileset.update(&view_at(DVec3::new(0.0, 0.0, 2000.0)));
        let bounds = tileset.bounds_of_active().unwrap();
        assert!((bounds.min - DVec3::splat(-20.0)).length() < 1e-9);
        assert!((bounds.max - DVec3::splat(20.0)).length() < 1e-9);
        assert_eq!(tileset.bounds(), bounds);
    }

    #[tokio::test]
    async fn test_visible_tiles_carry_content() {
        let fetcher = fetcher_with(&TWO_LEVEL_URIS);
        let mut tileset = new_tileset(TWO_LEVEL, &fetcher, target(10.0));

        settle(&mut tileset, &view_at(DVec3::new(0.0, 0.0, 2000.0))).await;
        let visible = tileset.visible_tiles();
        assert_eq!(
            visible.iter().map(|(tile, _)| *tile).collect::<Vec<_>>(),
            vec![TileId(1), TileId(4)]
        );
        assert_eq!(visible[0].1.format, ContentFormat::Batched3dModel);
        assert_eq!(visible[0].1.feature_count, Some(1));
        assert!(tileset.content_of(TileId::ROOT).is_none());
    }

    #[tokio::test]
    async fn test_metadata_of() {
        let fetcher = fetcher_with(&TWO_LEVEL_URIS);
        let mut tileset = new_tileset(TWO_LEVEL, &fetcher, TilesetConfig::default());
        tileset.update(&view_at(DVec3::new(0.0, 0.0, 2000.0)));

        let metadata = tileset.metadata_of(TileId(6));
        assert_eq!(metadata["index"], MetadataValue::Integer(6));
        assert_eq!(metadata["depth"], MetadataValue::Integer(2));
        assert_eq!(metadata["is_leaf"], MetadataValue::Bool(true));
        assert_eq!(metadata["content_uri"], MetadataValue::None);
        assert_eq!(metadata.len(), 10);

        let root = tileset.metadata_of(TileId::ROOT);
        assert_eq!(
            root["content_uri"],
            MetadataValue::Text("root.b3dm".to_string())
        );
        assert_eq!(root["geometric_error"], MetadataValue::Number(100.0));
        assert_eq!(root["load_state"].to_string(), "unloaded");

        assert!(tileset.metadata_of(TileId(99)).is_empty());
    }
}
