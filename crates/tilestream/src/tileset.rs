//! Level of detail selection and load management.
//!
//! A [`Tileset`] owns the tile tree, the content cache and the two job
//! queues. The caller drives it with [`Tileset::update`] once per frame:
//!
//! 1. Finished downloads and parses are applied (the integration point).
//! 2. A pre-order walk from the root picks one active tile per branch using
//!    the screen-space error of each tile. Tiles that refine additively
//!    stay active alongside their children.
//! 3. Active tiles are pinned in the cache or requested; tiles that left the
//!    active set are released and their outstanding jobs cancelled.
//! 4. The cache is trimmed to budget and both queues get a scheduling pass.
//!
//! All access to the tree and runtime table during the walk is read-only
//! except for the per-tile metrics it records. The selected set is applied
//! afterwards, so the walk never observes half-updated state.

use std::collections::HashSet;
use std::fmt;
use std::sync::Arc;

use crate::cache::ResourceCache;
use crate::config::{QueueConfig, TilesetConfig};
use crate::content::{ContentParser, TileContentParser};
use crate::error::{Error, Result};
use crate::fetch::Fetcher;
use crate::manifest::Refine;
use crate::queue::{Completion, JobQueue, JobState, PriorityInfo, Producer};
use crate::runtime::{JobFuture, TaskSpawner};
use crate::tree::{TileId, TileNode, TileTree};
use crate::view::View;

/// Where a tile's content is in the load pipeline.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub enum LoadState {
    /// Not resident and not requested.
    #[default]
    Unloaded,
    /// Waiting for a download slot.
    Queued,
    /// Downloading or parsing.
    Loading,
    /// Resident in the cache, or a structural tile with nothing to load.
    Loaded,
    /// The last load failed. Stays failed until retried.
    Failed,
}

impl LoadState {
    /// Lowercase name, as shown in metadata.
    #[must_use]
    pub fn as_str(self) -> &'static str {
        match self {
            LoadState::Unloaded => "unloaded",
            LoadState::Queued => "queued",
            LoadState::Loading => "loading",
            LoadState::Loaded => "loaded",
            LoadState::Failed => "failed",
        }
    }
}

/// Per-tile state that changes from frame to frame.
#[derive(Debug, Clone, Copy, Default, PartialEq)]
pub struct TileRuntimeState {
    /// Distance from the camera to the bounding volume, 0 when inside.
    pub distance_to_camera: f64,
    /// Screen-space error in pixels.
    pub screen_space_error: f64,
    /// Whether the bounding volume intersected the view frustum.
    pub in_frustum: bool,
    /// Whether the tile is the selected representative of its branch.
    pub active: bool,
    /// Whether the tile is active and its content is loaded.
    pub visible: bool,
    /// Load pipeline state.
    pub load_state: LoadState,
    /// Last frame at which the walk reached this tile.
    pub last_visited_frame: u64,
    /// Whether the tileset holds a cache reference for this tile.
    pub pinned: bool,
}

/// What happened during one [`Tileset::update`].
#[derive(Debug, Clone, Default, PartialEq)]
pub struct FrameSummary {
    /// Frame number of this update.
    pub frame: u64,
    /// Tiles reached by the walk.
    pub visited: usize,
    /// Tiles in the active set.
    pub active: usize,
    /// Active tiles with loaded content.
    pub visible: usize,
    /// New download jobs enqueued.
    pub requested: usize,
    /// Jobs cancelled because their tile is no longer wanted.
    pub cancelled: usize,
    /// Tiles whose content entered the cache.
    pub loaded: usize,
    /// Jobs that failed.
    pub failed: usize,
    /// Tiles evicted from the cache.
    pub evicted: Vec<TileId>,
    /// Download jobs started by the scheduling pass.
    pub downloads_started: usize,
    /// Parse jobs started by the scheduling pass.
    pub parses_started: usize,
}

/// A streaming tile hierarchy.
pub struct Tileset<P: ContentParser = TileContentParser> {
    tree: TileTree,
    runtime: Vec<TileRuntimeState>,
    cache: ResourceCache<P::Content>,
    download: JobQueue<Vec<u8>>,
    parse: JobQueue<P::Content>,
    fetcher: Arc<dyn Fetcher>,
    parser: Arc<P>,
    config: TilesetConfig,
    frame: u64,
    active: Vec<TileId>,
    requested: HashSet<TileId>,
}

impl<P: ContentParser> fmt::Debug for Tileset<P> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Tileset")
            .field("tiles", &self.tree.len())
            .field("frame", &self.frame)
            .field("active", &self.active.len())
            .field("cached", &self.cache.item_count())
            .field("download", &self.download)
            .field("parse", &self.parse)
            .finish_non_exhaustive()
    }
}

/// Mutable settings of one of a [`Tileset`]'s queues.
///
/// Jobs are only enqueued, cancelled and started by the tileset, which keeps
/// every tile's [`LoadState`] in step with its job.
pub struct QueueSettings<'a, T> {
    queue: &'a mut JobQueue<T>,
    config: &'a mut QueueConfig,
}

impl<T: Send + 'static> QueueSettings<'_, T> {
    /// Replace the function used to rank pending jobs.
    pub fn set_priority_callback<F>(&mut self, callback: F)
    where
        F: Fn(&PriorityInfo) -> f64 + Send + Sync + 'static,
    {
        self.queue.set_priority_callback(callback);
    }

    /// Enable or disable scheduling on every update.
    pub fn set_auto_update(&mut self, auto_update: bool) {
        self.queue.set_auto_update(auto_update);
        self.config.auto_update = auto_update;
    }

    /// Change the concurrency limit. A limit of zero is raised to one.
    pub fn set_max_jobs(&mut self, max_jobs: usize) {
        let max_jobs = max_jobs.max(1);
        self.queue.set_max_jobs(max_jobs);
        self.config.max_jobs = max_jobs;
    }
}

/// Tiles chosen by one walk.
struct Selection {
    active: Vec<TileId>,
    visited: usize,
}

impl<P: ContentParser> Tileset<P> {
    /// Create a tileset. Jobs run on `spawner`; nothing is fetched until the
    /// first [`update`](Self::update).
    pub fn new(
        tree: TileTree,
        fetcher: Arc<dyn Fetcher>,
        parser: P,
        config: TilesetConfig,
        spawner: TaskSpawner,
    ) -> Result<Self> {
        config.validate()?;

        let mut download = JobQueue::new("download", config.download.max_jobs, spawner.clone());
        download.set_auto_update(config.download.auto_update);
        let mut parse = JobQueue::new("parse", config.parse.max_jobs, spawner);
        parse.set_auto_update(config.parse.auto_update);

        tracing::info!(
            tiles = tree.len(),
            max_depth = tree.max_depth(),
            version = tree.asset_version().unwrap_or("unknown"),
            "created tileset"
        );

        Ok(Self {
            runtime: vec![TileRuntimeState::default(); tree.len()],
            cache: ResourceCache::for_tree(tree.len()),
            tree,
            download,
            parse,
            fetcher,
            parser: Arc::new(parser),
            config,
            frame: 0,
            active: Vec::new(),
            requested: HashSet::new(),
        })
    }

    /// Advance one frame for the given view.
    pub fn update(&mut self, view: &View) -> FrameSummary {
        self.frame += 1;
        self.cache.set_frame(self.frame);
        let mut summary = FrameSummary {
            frame: self.frame,
            ..FrameSummary::default()
        };

        self.apply_completions(&mut summary);

        let selection = select(&self.tree, &mut self.runtime, view, &self.config, self.frame);
        summary.visited = selection.visited;

        let now_active: HashSet<TileId> = selection.active.iter().copied().collect();
        let mut requested = now_active.clone();
        let mut prefetch = Vec::new();
        if self.config.load_siblings {
            for &tile in &selection.active {
                for sibling in self.tree.siblings(tile) {
                    if requested.insert(sibling) {
                        prefetch.push(sibling);
                    }
                }
            }
        }

        // Release tiles that left the active set.
        for &tile in &self.active {
            if now_active.contains(&tile) {
                continue;
            }
            let state = &mut self.runtime[tile.index()];
            state.active = false;
            state.visible = false;
            if state.pinned {
                state.pinned = false;
                self.cache.release(tile);
            }
        }

        for &tile in &selection.active {
            self.runtime[tile.index()].active = true;
            self.acquire_or_request(tile, &mut summary);
        }
        for tile in prefetch {
            self.prefetch(tile, view, &mut summary);
        }

        let stale: Vec<TileId> = self
            .tree
            .traverse()
            .map(|node| node.id)
            .filter(|id| {
                matches!(
                    self.runtime[id.index()].load_state,
                    LoadState::Queued | LoadState::Loading
                ) && !requested.contains(id)
            })
            .collect();
        for tile in stale {
            self.cancel_load(tile, &mut summary);
        }

        self.refresh_priorities();

        summary.evicted = self
            .cache
            .evict_if_over_budget(self.config.cache.min_size, self.config.cache.max_size);
        for &tile in &summary.evicted {
            let state = &mut self.runtime[tile.index()];
            state.load_state = LoadState::Unloaded;
            state.visible = false;
        }

        for &tile in &selection.active {
            let has_content = self.tree.get(tile).is_some_and(TileNode::has_content);
            let state = &mut self.runtime[tile.index()];
            state.visible = has_content && state.load_state == LoadState::Loaded;
            if state.visible {
                summary.visible += 1;
            }
        }

        summary.active = selection.active.len();
        self.active = selection.active;
        self.requested = requested;

        summary.downloads_started = self.download.auto_schedule();
        summary.parses_started = self.parse.auto_schedule();
        self.mark_started_downloads();

        tracing::trace!(
            frame = summary.frame,
            visited = summary.visited,
            active = summary.active,
            visible = summary.visible,
            requested = summary.requested,
            cancelled = summary.cancelled,
            evicted = summary.evicted.len(),
            "tileset update"
        );
        summary
    }

    fn apply_completions(&mut self, summary: &mut FrameSummary) {
        for completion in self.download.poll_completed() {
            match completion {
                Completion::Done { tile, value } => self.enqueue_parse(tile, value),
                Completion::Failed { tile, error } => self.fail(tile, &error, summary),
                Completion::Discarded { tile } => {
                    self.runtime[tile.index()].load_state = LoadState::Unloaded;
                }
            }
        }

        for completion in self.parse.poll_completed() {
            match completion {
                Completion::Done { tile, value } => {
                    let byte_size = self.parser.byte_size(&value);
                    match self.cache.insert_sized(tile, value, byte_size) {
                        Ok(_) => {
                            self.runtime[tile.index()].load_state = LoadState::Loaded;
                            summary.loaded += 1;
                            tracing::debug!(%tile, byte_size, "tile loaded");
                        }
                        Err(error) => self.fail(tile, &error, summary),
                    }
                }
                Completion::Failed { tile, error } => self.fail(tile, &error, summary),
                Completion::Discarded { tile } => {
                    self.runtime[tile.index()].load_state = LoadState::Unloaded;
                }
            }
        }
    }

    fn fail(&mut self, tile: TileId, error: &Error, summary: &mut FrameSummary) {
        tracing::warn!(%tile, %error, "failed to load tile");
        if let Some(state) = self.runtime.get_mut(tile.index()) {
            state.load_state = LoadState::Failed;
            state.visible = false;
        }
        summary.failed += 1;
    }

    fn enqueue_parse(&mut self, tile: TileId, bytes: Vec<u8>) {
        let uri = self
            .tree
            .get(tile)
            .and_then(|node| node.content.clone())
            .unwrap_or_default();
        let parser = Arc::clone(&self.parser);
        let producer: Producer<P::Content> = Box::new(move || -> JobFuture<P::Content> {
            Box::pin(async move { parser.parse(&uri, bytes) })
        });

        let info = self.priority_info(tile);
        self.parse.enqueue(tile, info, producer);
        self.runtime[tile.index()].load_state = LoadState::Loading;
    }

    fn acquire_or_request(&mut self, tile: TileId, summary: &mut FrameSummary) {
        if !self.tree.get(tile).is_some_and(TileNode::has_content) {
            self.runtime[tile.index()].load_state = LoadState::Loaded;
            return;
        }
        if self.runtime[tile.index()].pinned {
            self.cache.touch(tile);
            return;
        }
        if self.cache.acquire(tile).is_some() {
            let state = &mut self.runtime[tile.index()];
            state.pinned = true;
            state.load_state = LoadState::Loaded;
            return;
        }
        self.request_load(tile, summary);
    }

    fn prefetch(&mut self, tile: TileId, view: &View, summary: &mut FrameSummary) {
        let Some(node) = self.tree.get(tile) else {
            return;
        };
        if !node.has_content() {
            return;
        }
        // Siblings may not have been reached by the walk; they still need
        // metrics for job priorities.
        if self.runtime[tile.index()].last_visited_frame != self.frame {
            measure(&mut self.runtime[tile.index()], node, view);
        }
        if self.cache.contains(tile) {
            self.cache.touch(tile);
            return;
        }
        self.request_load(tile, summary);
    }

    fn request_load(&mut self, tile: TileId, summary: &mut FrameSummary) {
        match self.runtime[tile.index()].load_state {
            LoadState::Failed => {}
            LoadState::Queued | LoadState::Loading => {
                // A job cancelled on an earlier frame may still be in flight.
                self.download.revive(tile);
                self.parse.revive(tile);
            }
            LoadState::Unloaded | LoadState::Loaded => {
                let Some(uri) = self.tree.get(tile).and_then(|node| node.content.clone()) else {
                    return;
                };
                let fetcher = Arc::clone(&self.fetcher);
                let producer: Producer<Vec<u8>> = Box::new(move || fetcher.fetch(&uri));

                let info = self.priority_info(tile);
                if self.download.enqueue(tile, info, producer) {
                    self.runtime[tile.index()].load_state = LoadState::Queued;
                    summary.requested += 1;
                    tracing::debug!(%tile, "requested tile");
                }
            }
        }
    }

    fn cancel_load(&mut self, tile: TileId, summary: &mut FrameSummary) {
        let download = self.download.job_state(tile);
        let parse = self.parse.job_state(tile);

        let mut reverted = download.is_none() && parse.is_none();
        for (queue_state, is_download) in [(download, true), (parse, false)] {
            if !matches!(queue_state, Some(JobState::Pending | JobState::Running)) {
                continue;
            }
            if is_download {
                self.download.cancel(tile);
            } else {
                self.parse.cancel(tile);
            }
            summary.cancelled += 1;
            // Running jobs report back as discarded and revert then.
            reverted |= queue_state == Some(JobState::Pending);
        }

        if reverted {
            self.runtime[tile.index()].load_state = LoadState::Unloaded;
        }
    }

    fn refresh_priorities(&mut self) {
        let pending: Vec<TileId> = self
            .download
            .pending_tiles()
            .chain(self.parse.pending_tiles())
            .collect();
        for tile in pending {
            let info = self.priority_info(tile);
            self.download.update_info(tile, info);
            self.parse.update_info(tile, info);
        }
    }

    fn mark_started_downloads(&mut self) {
        for &tile in &self.requested {
            let state = &mut self.runtime[tile.index()];
            if state.load_state == LoadState::Queued
                && self.download.job_state(tile) == Some(JobState::Running)
            {
                state.load_state = LoadState::Loading;
            }
        }
    }

    fn priority_info(&self, tile: TileId) -> PriorityInfo {
        let state = self.runtime.get(tile.index()).copied().unwrap_or_default();
        PriorityInfo {
            tile,
            distance_to_camera: state.distance_to_camera,
            screen_space_error: state.screen_space_error,
            depth: self.tree.get(tile).map_or(0, |node| node.depth),
            active: state.active,
        }
    }

    /// Reset a failed tile so the next update requests it again. Returns
    /// whether the tile was failed.
    pub fn retry(&mut self, tile: TileId) -> bool {
        debug_assert!(self.tree.contains(tile), "retry of unknown tile {tile}");
        match self.runtime.get_mut(tile.index()) {
            Some(state) if state.load_state == LoadState::Failed => {
                state.load_state = LoadState::Unloaded;
                true
            }
            _ => false,
        }
    }

    /// Reset every failed tile. Returns how many were reset.
    pub fn retry_failed(&mut self) -> usize {
        let mut count = 0;
        for state in &mut self.runtime {
            if state.load_state == LoadState::Failed {
                state.load_state = LoadState::Unloaded;
                count += 1;
            }
        }
        count
    }

    /// Evict every cached tile that is not pinned. Returns how many were
    /// evicted.
    pub fn unload_unused(&mut self) -> usize {
        let evicted = self.cache.unload_all_unused();
        for &tile in &evicted {
            self.runtime[tile.index()].load_state = LoadState::Unloaded;
        }
        evicted.len()
    }

    /// Current configuration.
    #[must_use]
    pub fn config(&self) -> &TilesetConfig {
        &self.config
    }

    /// Replace the configuration. Traversal settings apply from the next
    /// update; queue limits apply immediately.
    pub fn set_config(&mut self, config: TilesetConfig) -> Result<()> {
        config.validate()?;
        self.download.set_max_jobs(config.download.max_jobs);
        self.download.set_auto_update(config.download.auto_update);
        self.parse.set_max_jobs(config.parse.max_jobs);
        self.parse.set_auto_update(config.parse.auto_update);
        self.config = config;
        Ok(())
    }

    /// The download queue.
    #[must_use]
    pub fn download_queue(&self) -> &JobQueue<Vec<u8>> {
        &self.download
    }

    /// Settings of the download queue. Scheduling goes through
    /// [`schedule_job_run`](Self::schedule_job_run).
    pub fn download_queue_mut(&mut self) -> QueueSettings<'_, Vec<u8>> {
        QueueSettings {
            queue: &mut self.download,
            config: &mut self.config.download,
        }
    }

    /// The parse queue.
    #[must_use]
    pub fn parse_queue(&self) -> &JobQueue<P::Content> {
        &self.parse
    }

    /// Settings of the parse queue.
    pub fn parse_queue_mut(&mut self) -> QueueSettings<'_, P::Content> {
        QueueSettings {
            queue: &mut self.parse,
            config: &mut self.config.parse,
        }
    }

    /// Run a scheduling pass on both queues regardless of their
    /// `auto_update` setting. Returns the number of jobs started.
    pub fn schedule_job_run(&mut self) -> usize {
        let started = self.download.schedule_job_run() + self.parse.schedule_job_run();
        self.mark_started_downloads();
        started
    }

    /// Wait for every running job to report back. The results are applied
    /// by the next [`update`](Self::update).
    pub async fn wait_idle(&mut self) {
        self.download.wait_idle().await;
        self.parse.wait_idle().await;
    }

    /// Whether both queues are empty.
    #[must_use]
    pub fn is_idle(&self) -> bool {
        self.download.is_idle() && self.parse.is_idle()
    }

    /// The active set ordered by distance to the camera, truncated to
    /// `max_active_tiles` when set.
    #[must_use]
    pub fn active_tiles_within_cap(&self) -> Vec<TileId> {
        let mut tiles = self.active.clone();
        tiles.sort_by(|a, b| {
            let da = self.runtime[a.index()].distance_to_camera;
            let db = self.runtime[b.index()].distance_to_camera;
            da.total_cmp(&db).then_with(|| a.cmp(b))
        });
        if let Some(cap) = self.config.max_active_tiles {
            tiles.truncate(cap);
        }
        tiles
    }

    /// The tile tree.
    #[must_use]
    pub fn tree(&self) -> &TileTree {
        &self.tree
    }

    /// The content cache.
    #[must_use]
    pub fn cache(&self) -> &ResourceCache<P::Content> {
        &self.cache
    }

    /// Number of the last update, 0 before the first.
    #[must_use]
    pub fn frame(&self) -> u64 {
        self.frame
    }

    /// Active tiles in walk order.
    #[must_use]
    pub fn active_tiles(&self) -> &[TileId] {
        &self.active
    }

    /// Runtime state of a tile.
    #[must_use]
    pub fn runtime(&self, tile: TileId) -> Option<&TileRuntimeState> {
        self.runtime.get(tile.index())
    }
}

/// Walk the tree in pre-order and pick the active set.
fn select(
    tree: &TileTree,
    runtime: &mut [TileRuntimeState],
    view: &View,
    config: &TilesetConfig,
    frame: u64,
) -> Selection {
    let threshold = config.effective_error_threshold();
    let mut active = Vec::new();
    let mut visited = 0;
    let mut stack = vec![TileId::ROOT];

    while let Some(id) = stack.pop() {
        let Some(node) = tree.get(id) else {
            continue;
        };
        visited += 1;

        let state = &mut runtime[id.index()];
        measure(state, node, view);
        state.last_visited_frame = frame;
        if !state.in_frustum {
            continue;
        }

        // A failed tile holds its branch unrefined until it is retried.
        let failed = node.has_content() && state.load_state == LoadState::Failed;
        // `state.active` still holds the previous frame's selection here.
        // Additive tiles stay active while refined, so only replaced tiles
        // get the looser bound.
        let limit = if state.active && node.refine == Refine::Replace {
            threshold
        } else {
            config.error_target
        };
        if failed
            || state.screen_space_error <= limit
            || node.depth >= config.max_depth
            || node.is_leaf()
        {
            active.push(id);
        } else {
            if node.refine == Refine::Add && node.has_content() {
                active.push(id);
            }
            stack.extend(node.children.iter().rev().copied());
        }
    }

    Selection { active, visited }
}

fn measure(state: &mut TileRuntimeState, node: &TileNode, view: &View) {
    state.distance_to_camera = node.bounding_volume.distance_to_point(view.position);
    state.screen_space_error =
        view.screen_space_error(node.geometric_error, state.distance_to_camera);
    state.in_frustum = view.contains(&node.bounding_volume);
}
