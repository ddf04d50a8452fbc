//! Reference-counted, size-bounded store of loaded tile content.
//!
//! Entries are pinned while their reference count is above zero. Once
//! released they stay resident until [`ResourceCache::evict_if_over_budget`]
//! needs room, at which point the least recently touched unpinned entries go
//! first.

use std::collections::HashMap;
use std::collections::hash_map::Entry;
use std::sync::Arc;

use crate::TileId;
use crate::error::{Error, Result};

/// Loaded content for one tile.
#[derive(Debug)]
pub struct CacheEntry<C> {
    content: Arc<C>,
    byte_size: usize,
    ref_count: u32,
    last_touched_frame: u64,
}

impl<C> CacheEntry<C> {
    /// Shared handle to the content.
    #[must_use]
    pub fn content(&self) -> &Arc<C> {
        &self.content
    }

    /// Resident size in bytes, as reported when the content was stored.
    #[must_use]
    pub fn byte_size(&self) -> usize {
        self.byte_size
    }

    /// Number of outstanding references.
    #[must_use]
    pub fn ref_count(&self) -> u32 {
        self.ref_count
    }

    /// Frame at which the entry was last inserted, acquired or touched.
    #[must_use]
    pub fn last_touched_frame(&self) -> u64 {
        self.last_touched_frame
    }
}

/// LRU cache of tile content keyed by [`TileId`].
#[derive(Debug)]
pub struct ResourceCache<C> {
    entries: HashMap<TileId, CacheEntry<C>>,
    frame: u64,
    tile_limit: Option<usize>,
}

impl<C> Default for ResourceCache<C> {
    fn default() -> Self {
        Self::new()
    }
}

impl<C> ResourceCache<C> {
    /// Create an empty cache that accepts any tile id.
    #[must_use]
    pub fn new() -> Self {
        Self {
            entries: HashMap::new(),
            frame: 0,
            tile_limit: None,
        }
    }

    /// Create an empty cache for a tree of `tile_count` nodes. Inserting an
    /// id outside the tree is rejected.
    #[must_use]
    pub fn for_tree(tile_count: usize) -> Self {
        Self {
            tile_limit: Some(tile_count),
            ..Self::new()
        }
    }

    /// Set the frame counter used to stamp entries.
    pub fn set_frame(&mut self, frame: u64) {
        self.frame = frame;
    }

    /// Current frame counter.
    #[must_use]
    pub fn frame(&self) -> u64 {
        self.frame
    }

    /// Take a reference to a resident entry, or `None` on a miss.
    pub fn acquire(&mut self, tile: TileId) -> Option<&CacheEntry<C>> {
        let frame = self.frame;
        let entry = self.entries.get_mut(&tile)?;
        entry.ref_count += 1;
        entry.last_touched_frame = frame;
        Some(entry)
    }

    /// Store content for a tile. A new entry starts unreferenced; replacing an
    /// entry keeps its references.
    pub fn insert(&mut self, tile: TileId, content: C) -> Result<&CacheEntry<C>> {
        self.insert_sized(tile, content, 0)
    }

    /// Like [`insert`](Self::insert), recording the content's size in bytes.
    pub fn insert_sized(
        &mut self,
        tile: TileId,
        content: C,
        byte_size: usize,
    ) -> Result<&CacheEntry<C>> {
        if self.tile_limit.is_some_and(|limit| tile.index() >= limit) {
            return Err(Error::InvalidTileId { id: tile });
        }

        let frame = self.frame;
        let content = Arc::new(content);
        let entry = match self.entries.entry(tile) {
            Entry::Occupied(occupied) => {
                let entry = occupied.into_mut();
                entry.content = content;
                entry.byte_size = byte_size;
                entry.last_touched_frame = frame;
                entry
            }
            Entry::Vacant(vacant) => vacant.insert(CacheEntry {
                content,
                byte_size,
                ref_count: 0,
                last_touched_frame: frame,
            }),
        };
        Ok(entry)
    }

    /// Drop a reference. The entry stays resident at zero references.
    pub fn release(&mut self, tile: TileId) {
        match self.entries.get_mut(&tile) {
            Some(entry) if entry.ref_count > 0 => entry.ref_count -= 1,
            Some(_) => tracing::debug!(%tile, "release of unreferenced cache entry"),
            None => tracing::debug!(%tile, "release of missing cache entry"),
        }
    }

    /// Refresh an entry's LRU age without taking a reference.
    pub fn touch(&mut self, tile: TileId) {
        if let Some(entry) = self.entries.get_mut(&tile) {
            entry.last_touched_frame = self.frame;
        }
    }

    /// Peek at an entry without changing it.
    #[must_use]
    pub fn get(&self, tile: TileId) -> Option<&CacheEntry<C>> {
        self.entries.get(&tile)
    }

    /// Whether content for the tile is resident.
    #[must_use]
    pub fn contains(&self, tile: TileId) -> bool {
        self.entries.contains_key(&tile)
    }

    /// Number of resident entries.
    #[must_use]
    pub fn item_count(&self) -> usize {
        self.entries.len()
    }

    /// Total size of the resident entries in bytes.
    #[must_use]
    pub fn total_bytes(&self) -> usize {
        self.entries.values().map(|e| e.byte_size).sum()
    }

    /// Number of entries with outstanding references.
    #[must_use]
    pub fn pinned_count(&self) -> usize {
        self.entries.values().filter(|e| e.ref_count > 0).count()
    }

    /// Whether the resident count exceeds `max_size`.
    #[must_use]
    pub fn is_over_budget(&self, max_size: usize) -> bool {
        self.entries.len() > max_size
    }

    /// Evict unreferenced entries, oldest first, once the cache holds more
    /// than `max_size` items, until it holds at most `min_size` or nothing
    /// evictable is left. Returns the evicted tiles in eviction order.
    pub fn evict_if_over_budget(&mut self, min_size: usize, max_size: usize) -> Vec<TileId> {
        if self.entries.len() <= max_size {
            return Vec::new();
        }

        let excess = self.entries.len().saturating_sub(min_size);
        let evicted = self.oldest_unreferenced(excess);
        for tile in &evicted {
            self.entries.remove(tile);
        }

        if self.entries.len() > max_size {
            tracing::warn!(
                items = self.entries.len(),
                max_size,
                "tile cache over budget: remaining entries are in use"
            );
        }
        evicted
    }

    /// Evict every unreferenced entry.
    pub fn unload_all_unused(&mut self) -> Vec<TileId> {
        let evicted = self.oldest_unreferenced(usize::MAX);
        for tile in &evicted {
            self.entries.remove(tile);
        }
        evicted
    }

    fn oldest_unreferenced(&self, limit: usize) -> Vec<TileId> {
        let mut candidates: Vec<(u64, TileId)> = self
            .entries
            .iter()
            .filter(|(_, e)| e.ref_count == 0)
            .map(|(&tile, e)| (e.last_touched_frame, tile))
            .collect();
        candidates.sort_unstable();
        candidates.into_iter().take(limit).map(|(_, tile)| tile).collect()
    }
}
