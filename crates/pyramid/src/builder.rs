//! Lazy construction of pyramid levels.
//!
//! Level 0 is the source band read through the reader capability; every
//! further level aggregates `factor x factor` blocks of the level above it.
//! Levels are built on demand and cached in the store, one build per level
//! key no matter how many callers ask at once.

use crate::config::PyramidConfig;
use crate::single_flight::{SingleFlight, SingleFlightStats};
use cache_store::{CacheStore, EntryMetadata, EntryView};
use futures::future::{BoxFuture, FutureExt};
use raster_ops::{aggregate, AggregationMethod, ReaderRegistry};
use serde::Serialize;
use sift_common::{
    CacheKey, GeoTransform, RasterArray, RasterShape, Result, SiftError, SourceDescriptor,
};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Instant;
use tokio::sync::broadcast;
use tracing::{debug, info, warn};

/// Progress of a level build, broadcast to subscribers.
#[derive(Debug, Clone, Serialize)]
pub struct BuildProgress {
    pub dataset: String,
    pub key: CacheKey,
    pub level: u32,
    /// Number of stages this build needs.
    pub stages: u32,
    /// Stage in progress, `0..stages`.
    pub current_stage: u32,
    /// Fraction of the current stage done, `0.0..=1.0`.
    pub completion: f32,
    pub stage_desc: String,
}

/// Builder statistics.
#[derive(Debug, Clone, Default, Serialize)]
pub struct BuilderStats {
    pub levels_built: u64,
    pub source_imports: u64,
    pub cache_hits: u64,
    pub failures: u64,
    pub coalesced: u64,
}

#[derive(Default)]
struct BuilderCounters {
    levels_built: AtomicU64,
    source_imports: AtomicU64,
    cache_hits: AtomicU64,
    failures: AtomicU64,
}

/// Builds and caches pyramid levels for raster sources.
pub struct PyramidBuilder {
    store: Arc<CacheStore>,
    readers: ReaderRegistry,
    config: PyramidConfig,
    flights: SingleFlight<CacheKey, Result<EntryView>>,
    progress: broadcast::Sender<BuildProgress>,
    counters: BuilderCounters,
}

impl PyramidBuilder {
    pub fn new(
        store: Arc<CacheStore>,
        readers: ReaderRegistry,
        config: PyramidConfig,
    ) -> Result<Self> {
        config.validate().map_err(SiftError::config)?;
        let (progress, _) = broadcast::channel(256);
        Ok(Self {
            store,
            readers,
            config,
            flights: SingleFlight::new(),
            progress,
            counters: BuilderCounters::default(),
        })
    }

    pub fn store(&self) -> &Arc<CacheStore> {
        &self.store
    }

    pub fn readers(&self) -> &ReaderRegistry {
        &self.readers
    }

    pub fn config(&self) -> &PyramidConfig {
        &self.config
    }

    /// Receive progress updates for builds started after this call.
    pub fn subscribe_progress(&self) -> broadcast::Receiver<BuildProgress> {
        self.progress.subscribe()
    }

    /// Aggregation used for this source's levels.
    pub fn aggregation(&self, source: &SourceDescriptor) -> AggregationMethod {
        self.config.aggregation_for(source.display_name())
    }

    /// Cache key of `level` for `source`. Level 0 is the source key itself.
    pub fn level_key(&self, source: &SourceDescriptor, level: u32) -> CacheKey {
        source.source_key().for_level(
            level,
            self.aggregation(source).as_str(),
            self.config.factor,
        )
    }

    /// Keys of levels `0..=level`, the chain a build of `level` touches.
    pub fn level_chain(&self, source: &SourceDescriptor, level: u32) -> Vec<CacheKey> {
        (0..=level).map(|l| self.level_key(source, l)).collect()
    }

    pub fn level_shape(&self, source: &SourceDescriptor, level: u32) -> RasterShape {
        source
            .info
            .shape()
            .at_level(self.config.factor as usize, level)
    }

    pub fn level_geotransform(&self, source: &SourceDescriptor, level: u32) -> GeoTransform {
        source.info.geotransform.scaled(self.config.scale(level) as f64)
    }

    /// Coarsest level worth building: the first whose shape is 1x1, capped
    /// at `max_level`.
    pub fn max_level(&self, source: &SourceDescriptor) -> u32 {
        let mut level = 0;
        while level < self.config.max_level {
            let shape = self.level_shape(source, level);
            if shape.rows <= 1 && shape.cols <= 1 {
                break;
            }
            level += 1;
        }
        level
    }

    /// Pixel size of each level `0..=max_level`, finest first.
    pub fn level_pixel_sizes(&self, source: &SourceDescriptor) -> Vec<f64> {
        (0..=self.max_level(source))
            .map(|l| self.level_geotransform(source, l).pixel_size())
            .collect()
    }

    /// Return `level` of `source`, building it (and any missing ancestors)
    /// if needed.
    pub fn ensure_level<'a>(
        &'a self,
        source: &'a SourceDescriptor,
        level: u32,
    ) -> BoxFuture<'a, Result<EntryView>> {
        async move {
            if level > self.config.max_level {
                return Err(SiftError::build_failure(format!(
                    "level {} exceeds max_level {}",
                    level, self.config.max_level
                )));
            }

            let key = self.level_key(source, level);
            if let Some(view) = self.store.get(&key)? {
                self.counters.cache_hits.fetch_add(1, Ordering::Relaxed);
                return Ok(view);
            }

            self.flights
                .run(key, || async move {
                    // Another leader may have finished between our miss and
                    // taking leadership.
                    if let Some(view) = self.store.get(&key)? {
                        return Ok(view);
                    }
                    let started = Instant::now();
                    let result = if level == 0 {
                        self.import_source(source, key).await
                    } else {
                        match self.ensure_level(source, level - 1).await {
                            Ok(parent) => self.reduce(source, level, key, parent).await,
                            Err(e) => Err(e),
                        }
                    };
                    self.record_build(source, level, key, started, &result);
                    result
                })
                .await
        }
        .boxed()
    }

    /// Whether `level` of `source` is already cached.
    pub fn is_cached(&self, source: &SourceDescriptor, level: u32) -> bool {
        self.store.contains(&self.level_key(source, level))
    }

    fn record_build(
        &self,
        source: &SourceDescriptor,
        level: u32,
        key: CacheKey,
        started: Instant,
        result: &Result<EntryView>,
    ) {
        let elapsed = started.elapsed();
        match result {
            Ok(_) => {
                self.counters.levels_built.fetch_add(1, Ordering::Relaxed);
                metrics::counter!("sift_pyramid_builds_total", "level" => level.to_string())
                    .increment(1);
                metrics::histogram!("sift_pyramid_build_seconds").record(elapsed.as_secs_f64());
                info!(
                    dataset = source.display_name(),
                    level,
                    key = %key.short(),
                    elapsed_ms = elapsed.as_millis() as u64,
                    "Built pyramid level"
                );
            }
            Err(e) => {
                self.counters.failures.fetch_add(1, Ordering::Relaxed);
                metrics::counter!("sift_pyramid_build_failures_total").increment(1);
                warn!(
                    dataset = source.display_name(),
                    level,
                    key = %key.short(),
                    error = %e,
                    "Pyramid level build failed"
                );
            }
        }
    }

    async fn import_source(&self, source: &SourceDescriptor, key: CacheKey) -> Result<EntryView> {
        self.counters.source_imports.fetch_add(1, Ordering::Relaxed);
        let reader = self.readers.resolve(&source.format, &source.path)?;
        let store = self.store.clone();
        let source = source.clone();
        let progress = self.progress.clone();
        let block_rows = self.config.read_block_rows(source.info.block_height);

        run_blocking(move || {
            let info = &source.info;
            if info.needs_conversion() {
                warn!(
                    dataset = %info.dataset_name,
                    source_dtype = %info.source_dtype,
                    "Source is not float32, converting on import"
                );
            }

            let stage_desc = format!("importing {}", source.format);
            let mut values = Vec::with_capacity(info.rows * info.cols);
            let mut row = 0;
            while row < info.rows {
                let n = block_rows.min(info.rows - row);
                let block = reader.read_rows(&source.path, info, source.band, row, n)?;
                if block.len() != n * info.cols {
                    return Err(SiftError::source_read(format!(
                        "{} returned {} values for {} rows of {} columns",
                        source.path.display(),
                        block.len(),
                        n,
                        info.cols
                    )));
                }
                values.extend_from_slice(&block);
                row += n;
                debug!(
                    dataset = %info.dataset_name,
                    rows_read = row,
                    total_rows = info.rows,
                    "Read source rows"
                );
                let _ = progress.send(BuildProgress {
                    dataset: info.dataset_name.clone(),
                    key,
                    level: 0,
                    stages: 1,
                    current_stage: 0,
                    completion: row as f32 / info.rows.max(1) as f32,
                    stage_desc: stage_desc.clone(),
                });
            }

            let array = RasterArray::from_f32(info.rows, info.cols, values)?;
            let metadata = EntryMetadata::new(Some(info.geotransform.clone()), info.no_data)
                .with_label(format!("{} L0", info.dataset_name));
            store.put(key, &array, metadata)?;

            let _ = progress.send(BuildProgress {
                dataset: info.dataset_name.clone(),
                key,
                level: 0,
                stages: 1,
                current_stage: 0,
                completion: 1.0,
                stage_desc: format!("done loading {}", source.format),
            });
            fetch_built(&store, &key)
        })
        .await
    }

    async fn reduce(
        &self,
        source: &SourceDescriptor,
        level: u32,
        key: CacheKey,
        parent: EntryView,
    ) -> Result<EntryView> {
        let store = self.store.clone();
        let progress = self.progress.clone();
        let factor = self.config.factor as usize;
        let method = self.aggregation(source);
        let geotransform = self.level_geotransform(source, level);
        let dataset = source.display_name().to_string();
        let nodata = source.info.no_data;

        run_blocking(move || {
            let shape = parent.entry().shape;
            let values = parent.as_f32().ok_or_else(|| {
                SiftError::build_failure(format!("level {} parent is not float32", level))
            })?;

            let (data, rows, cols) = aggregate(&values, shape.rows, shape.cols, factor, method, nodata);
            let array = RasterArray::from_f32(rows, cols, data)?;
            let metadata = EntryMetadata::new(Some(geotransform), nodata)
                .with_label(format!("{} L{} {}", dataset, level, method));
            store.put(key, &array, metadata)?;

            let _ = progress.send(BuildProgress {
                dataset,
                key,
                level,
                stages: 1,
                current_stage: 0,
                completion: 1.0,
                stage_desc: format!("aggregated level {} ({})", level, method),
            });
            fetch_built(&store, &key)
        })
        .await
    }

    pub fn stats(&self) -> BuilderStats {
        BuilderStats {
            levels_built: self.counters.levels_built.load(Ordering::Relaxed),
            source_imports: self.counters.source_imports.load(Ordering::Relaxed),
            cache_hits: self.counters.cache_hits.load(Ordering::Relaxed),
            failures: self.counters.failures.load(Ordering::Relaxed),
            coalesced: self.flight_stats().coalesced,
        }
    }

    pub fn flight_stats(&self) -> SingleFlightStats {
        self.flights.stats()
    }
}

/// Run blocking disk/CPU work off the async threads.
pub(crate) async fn run_blocking<T, F>(work: F) -> Result<T>
where
    F: FnOnce() -> Result<T> + Send + 'static,
    T: Send + 'static,
{
    tokio::task::spawn_blocking(work)
        .await
        .map_err(|e| SiftError::build_failure(format!("build task failed: {}", e)))?
}

/// View of an entry that was just stored.
pub(crate) fn fetch_built(store: &CacheStore, key: &CacheKey) -> Result<EntryView> {
    store.get(key)?.ok_or_else(|| {
        SiftError::build_failure(format!("entry {} vanished right after it was stored", key.short()))
    })
}
