//! Viewport-driven tile scheduling.
//!
//! ```text
//!   request_viewport ──Command──► coordinator ──► TileQueue (BinaryHeap)
//!                                      │                │
//!                                      │   dispatch while active < workers
//!                                      │                ▼
//!                                      │          tile job ──spawn──► build (holds slot)
//!                                      │          (timeout)            │
//!                                      ◄──────── slot released ◄───────┘
//!                                                       │
//!                                         TileEvent ◄───┘ (current epoch only)
//! ```
//!
//! A single coordinator task owns the queue. Every viewport request bumps
//! the epoch and cancels the tiles the old epoch had not finished. Queued
//! ones are dropped. Running ones keep building and populate the cache; if
//! the new viewport asks for the same tile the job is adopted into the new
//! epoch, otherwise it delivers nothing.
//!
//! A worker slot belongs to the build, not to the wait on it: a tile that
//! times out is tombstoned at once but its slot is only freed when the
//! build underneath finishes.

use crate::config::SchedulerConfig;
use crate::event::{TileEvent, TileEventKind, TileState, TileView, Tombstone};
use crate::level::select_level;
use crate::product::ResolvedProduct;
use crate::queue::{QueuedTile, TileQueue};
use crate::request::{PlannedTile, Ticket, ViewportPlan, ViewportRequest};
use crate::stats::{SchedulerCounters, SchedulerStats};
use crate::tracker::Tracker;
use cache_store::EntryView;
use std::collections::HashMap;
use layer_registry::LayerRegistry;
use parking_lot::Mutex;
use pyramid::{DerivedPipeline, PyramidBuilder};
use sift_common::{
    BoundingBox, CacheKey, GeoTransform, PixelWindow, Result, SiftError, TileCoord, TileGrid,
};
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Instant;
use tokio::sync::{mpsc, oneshot};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

enum Command {
    Viewport {
        epoch: u64,
        request: ViewportRequest,
        reply: oneshot::Sender<Result<ViewportPlan>>,
    },
}

/// State shared by the handle, the coordinator and tile jobs.
struct Shared {
    builder: Arc<PyramidBuilder>,
    pipeline: Arc<DerivedPipeline>,
    registry: LayerRegistry,
    config: SchedulerConfig,
    grid: TileGrid,
    counters: SchedulerCounters,
    tracker: Mutex<Tracker>,
    events: mpsc::UnboundedSender<TileEvent>,
}

/// Handle to a running scheduler.
///
/// Dropping the handle stops the coordinator; [`TileScheduler::shutdown`]
/// also waits for it.
pub struct TileScheduler {
    shared: Arc<Shared>,
    commands: mpsc::UnboundedSender<Command>,
    shutdown_token: CancellationToken,
    coordinator: Option<JoinHandle<()>>,
}

impl TileScheduler {
    /// Start the coordinator. Tile notifications arrive on the returned
    /// receiver.
    ///
    /// Must be called from within a tokio runtime.
    pub fn start(
        builder: Arc<PyramidBuilder>,
        pipeline: Arc<DerivedPipeline>,
        registry: LayerRegistry,
        config: SchedulerConfig,
    ) -> Result<(Self, mpsc::UnboundedReceiver<TileEvent>)> {
        config.validate().map_err(SiftError::config)?;

        let (events_tx, events_rx) = mpsc::unbounded_channel();
        let (commands_tx, commands_rx) = mpsc::unbounded_channel();
        let shutdown_token = CancellationToken::new();

        let shared = Arc::new(Shared {
            builder,
            pipeline,
            registry,
            grid: config.tile_grid(),
            config,
            counters: SchedulerCounters::default(),
            tracker: Mutex::new(Tracker::default()),
            events: events_tx,
        });

        info!(
            workers = shared.config.workers,
            tile_width = shared.grid.tile_width,
            tile_height = shared.grid.tile_height,
            timeout_ms = shared.config.build_timeout_ms,
            policy = shared.config.level_policy.as_str(),
            "Starting tile scheduler"
        );

        let coordinator = Coordinator::new(shared.clone(), shutdown_token.clone());
        let handle = tokio::spawn(coordinator.run(commands_rx));

        Ok((
            Self {
                shared,
                commands: commands_tx,
                shutdown_token,
                coordinator: Some(handle),
            },
            events_rx,
        ))
    }

    /// Replace the current viewport. Never blocks; the returned ticket
    /// carries the new epoch and resolves to the plan.
    pub fn request_viewport(&self, request: ViewportRequest) -> Ticket {
        let (epoch, superseded) = self.shared.tracker.lock().advance();
        if superseded > 0 {
            SchedulerCounters::add(&self.shared.counters.tiles_cancelled, superseded as u64);
            metrics::counter!("sift_tiles_cancelled_total").increment(superseded as u64);
            debug!(epoch, tiles = superseded, "Cancelled unfinished tiles of previous epoch");
        }
        let (reply, plan) = oneshot::channel();
        if self
            .commands
            .send(Command::Viewport {
                epoch,
                request,
                reply,
            })
            .is_err()
        {
            debug!(epoch, "Scheduler stopped; viewport request dropped");
        }
        Ticket::new(epoch, plan)
    }

    /// Epoch of the most recent viewport request.
    pub fn current_epoch(&self) -> u64 {
        self.shared.tracker.lock().epoch()
    }

    /// State of a tile in `epoch` (the current or the one before it).
    pub fn tile_state(&self, epoch: u64, coord: &TileCoord) -> Option<TileState> {
        self.shared.tracker.lock().get(epoch, coord)
    }

    pub fn config(&self) -> &SchedulerConfig {
        &self.shared.config
    }

    pub fn stats(&self) -> SchedulerStats {
        self.shared.counters.snapshot()
    }

    /// Stop the coordinator and wait for it to exit. Builds already running
    /// are left to finish in the background.
    pub async fn shutdown(mut self) {
        info!("Shutting down tile scheduler");
        self.shutdown_token.cancel();

        if let Some(handle) = self.coordinator.take() {
            match handle.await {
                Ok(()) => info!("Tile scheduler stopped"),
                Err(e) => tracing::error!("Tile coordinator panicked: {}", e),
            }
        }
    }
}

impl Drop for TileScheduler {
    fn drop(&mut self) {
        self.shutdown_token.cancel();
    }
}

impl std::fmt::Debug for TileScheduler {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("TileScheduler")
            .field("epoch", &self.current_epoch())
            .field("stats", &self.stats())
            .finish()
    }
}

// =============================================================================
// Coordinator
// =============================================================================

/// Running jobs by the entry they cut from and the tile they deliver.
type JobKey = (CacheKey, TileCoord);

/// A dispatched tile job.
///
/// Both fields are only read or written under the tracker lock, which is
/// what makes adoption and delivery mutually exclusive.
#[derive(Debug)]
struct RunningJob {
    /// Epoch the job delivers for; moved forward when a newer viewport
    /// adopts it.
    epoch: AtomicU64,
    finished: AtomicBool,
}

impl RunningJob {
    fn new(epoch: u64) -> Self {
        Self {
            epoch: AtomicU64::new(epoch),
            finished: AtomicBool::new(false),
        }
    }

    fn epoch(&self) -> u64 {
        self.epoch.load(Ordering::Relaxed)
    }

    fn is_finished(&self) -> bool {
        self.finished.load(Ordering::Relaxed)
    }

    /// Retarget the job at `epoch`; false once it has delivered.
    fn adopt(&self, epoch: u64) -> bool {
        if self.is_finished() {
            return false;
        }
        self.epoch.store(epoch, Ordering::Relaxed);
        true
    }

    /// Mark delivered and return the epoch to deliver for.
    fn finish(&self) -> u64 {
        self.finished.store(true, Ordering::Relaxed);
        self.epoch()
    }
}

struct Coordinator {
    shared: Arc<Shared>,
    shutdown: CancellationToken,
    queue: TileQueue,
    running: HashMap<JobKey, Arc<RunningJob>>,
    active: usize,
    done_tx: mpsc::UnboundedSender<()>,
    done_rx: mpsc::UnboundedReceiver<()>,
}

impl Coordinator {
    fn new(shared: Arc<Shared>, shutdown: CancellationToken) -> Self {
        let (done_tx, done_rx) = mpsc::unbounded_channel();
        Self {
            shared,
            shutdown,
            queue: TileQueue::default(),
            running: HashMap::new(),
            active: 0,
            done_tx,
            done_rx,
        }
    }

    async fn run(mut self, mut commands: mpsc::UnboundedReceiver<Command>) {
        loop {
            tokio::select! {
                biased;

                _ = self.shutdown.cancelled() => {
                    debug!("Tile coordinator received shutdown");
                    break;
                }

                Some(()) = self.done_rx.recv() => {
                    self.active = self.active.saturating_sub(1);
                }

                command = commands.recv() => match command {
                    Some(Command::Viewport { epoch, request, reply }) => {
                        self.handle_viewport(epoch, request, reply);
                    }
                    None => break,
                },
            }
            self.dispatch();
        }

        self.cancel_queued();
    }

    fn handle_viewport(
        &mut self,
        epoch: u64,
        request: ViewportRequest,
        reply: oneshot::Sender<Result<ViewportPlan>>,
    ) {
        if !self.shared.tracker.lock().is_current(epoch) {
            let _ = reply.send(Err(SiftError::Cancelled(format!(
                "viewport epoch {} superseded before planning",
                epoch
            ))));
            return;
        }

        self.cancel_queued();
        let result = self.plan(epoch, &request);
        match &result {
            Ok(plan) => {
                SchedulerCounters::bump(&self.shared.counters.viewports);
                metrics::counter!("sift_viewports_total").increment(1);
                info!(
                    epoch,
                    product = %plan.product,
                    time = %plan.time,
                    level = plan.level,
                    preview_level = ?plan.preview_level,
                    tiles = plan.tiles.len(),
                    "Planned viewport"
                );
            }
            Err(e) => warn!(epoch, family = %request.family, error = %e, "Viewport rejected"),
        }
        let _ = reply.send(result);
    }

    /// Drop every waiting tile. Tiles a viewport change already cancelled
    /// are not counted again.
    fn cancel_queued(&mut self) {
        let dropped = self.queue.drain();
        if dropped.is_empty() {
            return;
        }
        let cancelled = {
            let mut tracker = self.shared.tracker.lock();
            dropped
                .iter()
                .filter(|tile| tracker.cancel(tile.epoch, &tile.coord))
                .count()
        };
        if cancelled > 0 {
            SchedulerCounters::add(&self.shared.counters.tiles_cancelled, cancelled as u64);
            metrics::counter!("sift_tiles_cancelled_total").increment(cancelled as u64);
        }
        self.shared.counters.queued.store(0, Ordering::Relaxed);
        debug!(tiles = dropped.len(), "Dropped queued tiles");
    }

    fn plan(&mut self, epoch: u64, request: &ViewportRequest) -> Result<ViewportPlan> {
        request.validate()?;
        let builder = &self.shared.builder;
        let product = Arc::new(ResolvedProduct::resolve(&self.shared.registry, request)?);

        let sizes = product.pixel_sizes(builder);
        let level = select_level(&sizes, request.pixel_size, self.shared.config.level_policy);
        let cached = product.is_cached(builder, level);

        let mut planned = self.tiles_in_view(&product, level, &request.bbox, cached);

        let mut preview_level = None;
        if !cached && self.shared.config.preview_cached_levels {
            preview_level =
                (level + 1..=product.max_level(builder)).find(|&l| product.is_cached(builder, l));
            if let Some(preview) = preview_level {
                planned.extend(self.tiles_in_view(&product, preview, &request.bbox, true));
            }
        }

        self.running.retain(|_, job| !job.is_finished());
        let mut level_keys: HashMap<u32, Option<CacheKey>> = HashMap::new();
        let (mut queued, mut adopted) = (0u64, 0u64);
        {
            let mut tracker = self.shared.tracker.lock();
            for (tile, distance) in &planned {
                let coord = tile.coord;
                let key = *level_keys
                    .entry(coord.level)
                    .or_insert_with(|| product.key(builder, coord.level).ok());
                let job = key.and_then(|key| self.running.get(&(key, coord)));
                if job.is_some_and(|job| job.adopt(epoch)) {
                    tracker.set(epoch, coord, TileState::Building);
                    adopted += 1;
                } else {
                    self.queue
                        .push(epoch, coord, tile.cached, *distance, product.clone());
                    tracker.set(epoch, coord, TileState::Requested);
                    queued += 1;
                }
            }
        }
        if adopted > 0 {
            SchedulerCounters::add(&self.shared.counters.tiles_adopted, adopted);
            debug!(epoch, tiles = adopted, "Adopted running tiles");
        }
        SchedulerCounters::add(&self.shared.counters.tiles_queued, queued);
        self.shared
            .counters
            .queued
            .store(self.queue.len(), Ordering::Relaxed);

        planned.sort_by(|(a, da), (b, db)| {
            b.cached
                .cmp(&a.cached)
                .then_with(|| a.coord.level.cmp(&b.coord.level))
                .then_with(|| da.total_cmp(db))
        });

        Ok(ViewportPlan {
            epoch,
            product: product.label.clone(),
            time: product.time,
            level,
            preview_level,
            tiles: planned.into_iter().map(|(tile, _)| tile).collect(),
        })
    }

    /// Tiles of `level` intersecting `bbox`, with their distance to its
    /// center.
    fn tiles_in_view(
        &self,
        product: &ResolvedProduct,
        level: u32,
        bbox: &BoundingBox,
        cached: bool,
    ) -> Vec<(PlannedTile, f64)> {
        let builder = &self.shared.builder;
        let shape = product.level_shape(builder, level);
        let geotransform = product.level_geotransform(builder, level);
        let Some(window) = geotransform.window_for_bbox(bbox, shape.rows, shape.cols) else {
            return Vec::new();
        };
        let (cx, cy) = bbox.center();

        self.shared
            .grid
            .tiles_covering(level, &window)
            .into_iter()
            .filter_map(|coord| {
                let tile = self.shared.grid.tile_window(&coord, &shape)?;
                let (x, y) = tile_center(&geotransform, &tile);
                let distance = (x - cx).hypot(y - cy);
                Some((PlannedTile { coord, cached }, distance))
            })
            .collect()
    }

    fn dispatch(&mut self) {
        while self.active < self.shared.config.workers {
            let Some(tile) = self.queue.pop() else {
                break;
            };
            {
                let mut tracker = self.shared.tracker.lock();
                // Superseded while waiting; already marked cancelled.
                if !tracker.is_current(tile.epoch) {
                    continue;
                }
                tracker.set(tile.epoch, tile.coord, TileState::Building);
            }

            let job = Arc::new(RunningJob::new(tile.epoch));
            if let Ok(key) = tile.product.key(&self.shared.builder, tile.coord.level) {
                self.running.insert((key, tile.coord), job.clone());
            }
            self.active += 1;
            SchedulerCounters::bump(&self.shared.counters.tiles_started);
            let slot = SlotGuard(self.done_tx.clone());
            tokio::spawn(run_tile(
                self.shared.clone(),
                tile,
                job,
                self.shutdown.clone(),
                slot,
            ));
        }
        self.shared.counters.active.store(self.active, Ordering::Relaxed);
        self.shared
            .counters
            .queued
            .store(self.queue.len(), Ordering::Relaxed);
        metrics::gauge!("sift_tiles_active").set(self.active as f64);
    }
}

fn tile_center(geotransform: &GeoTransform, window: &PixelWindow) -> (f64, f64) {
    geotransform.pixel_to_world(
        window.col as f64 + window.cols as f64 / 2.0,
        window.row as f64 + window.rows as f64 / 2.0,
    )
}

/// Frees a worker slot when dropped. Owned by the build task.
struct SlotGuard(mpsc::UnboundedSender<()>);

impl Drop for SlotGuard {
    fn drop(&mut self) {
        let _ = self.0.send(());
    }
}

// =============================================================================
// Tile jobs
// =============================================================================

async fn run_tile(
    shared: Arc<Shared>,
    tile: QueuedTile,
    job: Arc<RunningJob>,
    shutdown: CancellationToken,
    slot: SlotGuard,
) {
    let started = Instant::now();
    let level = tile.coord.level;

    // The build runs in its own task so a timeout only abandons the wait.
    // It hands the slot back when it finishes; if nobody is waiting any
    // more the slot is dropped with the task's output.
    let build = {
        let shared = shared.clone();
        let product = tile.product.clone();
        tokio::spawn(async move {
            let built = build_level(&shared, &product, level).await;
            (built, slot)
        })
    };

    let (outcome, _slot) = tokio::select! {
        biased;

        _ = shutdown.cancelled() => {
            let mut tracker = shared.tracker.lock();
            let epoch = job.finish();
            if tracker.cancel(epoch, &tile.coord) {
                SchedulerCounters::bump(&shared.counters.tiles_cancelled);
            }
            return;
        }

        result = tokio::time::timeout(shared.config.build_timeout(), build) => match result {
            Ok(Ok((Ok(view), slot))) => (slice(&shared, &tile, view), Some(slot)),
            Ok(Ok((Err(e), slot))) => (Err(Tombstone::Failed(e)), Some(slot)),
            Ok(Err(join)) => (
                Err(Tombstone::Failed(SiftError::build_failure(format!(
                    "tile build task failed: {}",
                    join
                )))),
                None,
            ),
            Err(_) => (Err(Tombstone::TimedOut), None),
        },
    };

    let geotransform = tile
        .product
        .level_geotransform(&shared.builder, level);
    let geotransform = match &outcome {
        Ok(view) => geotransform.for_window(&view.window()),
        Err(_) => shared
            .grid
            .tile_window(&tile.coord, &tile.product.level_shape(&shared.builder, level))
            .map(|w| geotransform.for_window(&w))
            .unwrap_or(geotransform),
    };

    let kind = match outcome {
        Ok(view) => TileEventKind::Ready(view),
        Err(tombstone) => TileEventKind::Unavailable(tombstone),
    };
    deliver(&shared, &tile, &job, geotransform, kind, started);
}

/// Materialize the level a tile is cut from, holding its time steps and
/// cache keys for the duration.
async fn build_level(
    shared: &Shared,
    product: &ResolvedProduct,
    level: u32,
) -> Result<EntryView> {
    let _checkouts = product.checkout(&shared.registry)?;
    let _lease = shared
        .builder
        .store()
        .lease(product.lease_keys(&shared.builder, level)?);
    product
        .materialize(&shared.builder, &shared.pipeline, level)
        .await
}

fn slice(
    shared: &Shared,
    tile: &QueuedTile,
    view: EntryView,
) -> std::result::Result<TileView, Tombstone> {
    let shape = view.entry().shape;
    match shared.grid.tile_window(&tile.coord, &shape) {
        Some(window) => Ok(TileView::new(view, window)),
        None => Err(Tombstone::Failed(SiftError::build_failure(format!(
            "tile {} lies outside level shape {}x{}",
            tile.coord, shape.rows, shape.cols
        )))),
    }
}

/// Send the tile's notification if the epoch the job delivers for is
/// still current.
fn deliver(
    shared: &Shared,
    tile: &QueuedTile,
    job: &RunningJob,
    geotransform: GeoTransform,
    kind: TileEventKind,
    started: Instant,
) {
    let reason = match &kind {
        TileEventKind::Unavailable(tombstone) => Some(tombstone.to_string()),
        TileEventKind::Ready(_) => None,
    };

    // Checked and sent under the tracker lock so neither a viewport request
    // nor an adoption can slip in between.
    let mut tracker = shared.tracker.lock();
    let epoch = job.finish();
    let event = TileEvent {
        epoch,
        product: tile.product.label.clone(),
        coord: tile.coord,
        geotransform,
        kind,
    };
    let state = event.state();
    if !tracker.is_current(epoch) {
        // The viewport change already marked the tile cancelled.
        drop(tracker);
        SchedulerCounters::bump(&shared.counters.notifications_suppressed);
        debug!(
            epoch,
            tile = %tile.coord,
            state = ?state,
            "Suppressed notification for superseded epoch"
        );
        return;
    }
    tracker.set(epoch, tile.coord, state);
    let _ = shared.events.send(event);
    drop(tracker);

    let elapsed = started.elapsed();
    metrics::histogram!("sift_tile_seconds").record(elapsed.as_secs_f64());
    match state {
        TileState::Ready => {
            SchedulerCounters::bump(&shared.counters.tiles_ready);
            metrics::counter!("sift_tiles_ready_total").increment(1);
            debug!(
                epoch,
                tile = %tile.coord,
                elapsed_ms = elapsed.as_millis() as u64,
                "Tile ready"
            );
        }
        TileState::TimedOut => {
            SchedulerCounters::bump(&shared.counters.tiles_timed_out);
            metrics::counter!("sift_tiles_timed_out_total").increment(1);
            warn!(
                epoch,
                tile = %tile.coord,
                timeout_ms = shared.config.build_timeout_ms,
                "Tile timed out; build continues in the background"
            );
        }
        _ => {
            SchedulerCounters::bump(&shared.counters.tiles_failed);
            metrics::counter!("sift_tiles_failed_total").increment(1);
            warn!(
                epoch,
                tile = %tile.coord,
                reason = reason.as_deref().unwrap_or("unknown"),
                "Tile failed"
            );
        }
    }
}
