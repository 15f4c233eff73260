//! Integration tests for the pyramid builder and derived product pipeline.

use cache_store::{CacheConfig, CacheStore};
use futures::future::join_all;
use pyramid::{DerivedPipeline, PyramidBuilder, PyramidConfig, Recipe};
use raster_ops::{
    write_flat, BandOp, FlatBinaryReader, FlatHeader, RasterReader, ReaderRegistry,
    ResampleMethod, TargetGrid,
};
use sift_common::{GeoTransform, RasterInfo, Result, SiftError, SourceDescriptor};
use std::path::Path;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;
use test_utils::{assert_slice_approx_eq, create_ramp_grid, grid, TempWorkspace};

const ND: f32 = -9999.0;

/// Flat reader that counts row reads and can be slowed down or broken.
struct InstrumentedReader {
    tag: &'static str,
    reads: Arc<AtomicUsize>,
    delay: Duration,
    fail: bool,
}

impl InstrumentedReader {
    fn new(tag: &'static str, delay: Duration) -> (Self, Arc<AtomicUsize>) {
        let reads = Arc::new(AtomicUsize::new(0));
        let reader = Self {
            tag,
            reads: reads.clone(),
            delay,
            fail: false,
        };
        (reader, reads)
    }
}

impl RasterReader for InstrumentedReader {
    fn format(&self) -> &str {
        self.tag
    }

    fn is_relevant(&self, _path: &Path) -> bool {
        false
    }

    fn describe(&self, path: &Path) -> Result<RasterInfo> {
        FlatBinaryReader.describe(path)
    }

    fn read_rows(
        &self,
        path: &Path,
        info: &RasterInfo,
        band: Option<u32>,
        start_row: usize,
        rows: usize,
    ) -> Result<Vec<f32>> {
        self.reads.fetch_add(1, Ordering::SeqCst);
        std::thread::sleep(self.delay);
        if self.fail {
            return Err(SiftError::source_read(format!("{} is unreadable", path.display())));
        }
        FlatBinaryReader.read_rows(path, info, band, start_row, rows)
    }
}

struct Harness {
    _ws: TempWorkspace,
    store: Arc<CacheStore>,
    builder: PyramidBuilder,
    readers: ReaderRegistry,
    sources: std::path::PathBuf,
}

impl Harness {
    fn new(readers: ReaderRegistry, config: PyramidConfig) -> Self {
        let ws = TempWorkspace::new();
        let mut cache = CacheConfig::new(ws.cache_root(), 64 << 20);
        cache.fsync = false;
        let store = CacheStore::open(cache).expect("open store");
        let builder = PyramidBuilder::new(store.clone(), readers.clone(), config).expect("builder");
        let sources = ws.sources_dir();
        Self {
            _ws: ws,
            store,
            builder,
            readers,
            sources,
        }
    }

    fn with_builtins() -> Self {
        Self::new(ReaderRegistry::with_builtins(), PyramidConfig::default())
    }

    /// Write a flat source and describe it through `format`.
    fn source(
        &self,
        name: &str,
        format: &str,
        spec: &grid::GridSpec,
        data: &[f32],
        no_data: Option<f32>,
    ) -> SourceDescriptor {
        let path = self.sources.join(format!("{}.f32", name));
        let mut header = FlatHeader::new(spec.rows, spec.cols, spec.geotransform());
        header.no_data = no_data;
        header.dataset_name = Some(name.to_string());
        write_flat(&path, &header, data).expect("write source");
        self.readers
            .descriptor(&path, Some(format), None)
            .expect("describe source")
    }
}

const GRID_4X4: grid::GridSpec = grid::GridSpec {
    rows: 4,
    cols: 4,
    origin_x: 0.0,
    origin_y: 4.0,
    pixel_size: 1.0,
    projection: "EPSG:4326",
};

// ============================================================================
// Level construction
// ============================================================================

#[tokio::test]
async fn test_level_zero_is_the_source() {
    let h = Harness::with_builtins();
    let data = create_ramp_grid(4, 4);
    let source = h.source("B03", "flat", &GRID_4X4, &data, None);

    let view = h.builder.ensure_level(&source, 0).await.unwrap();
    assert_eq!(view.key(), source.source_key());
    assert_eq!(view.as_f32().unwrap().as_ref(), data.as_slice());
    assert_eq!(view.entry().geotransform, Some(GRID_4X4.geotransform()));
}

#[tokio::test]
async fn test_mean_aggregation_with_nodata_blocks() {
    let h = Harness::with_builtins();
    #[rustfmt::skip]
    let data = vec![
        1.0, 2.0, ND, ND,
        5.0, 6.0, ND, ND,
        9.0, ND, 11.0, 12.0,
        13.0, ND, 15.0, 16.0,
    ];
    let source = h.source("B03", "flat", &GRID_4X4, &data, Some(ND));

    let view = h.builder.ensure_level(&source, 1).await.unwrap();
    let shape = view.entry().shape;
    assert_eq!((shape.rows, shape.cols), (2, 2));
    assert_slice_approx_eq!(view.as_f32().unwrap(), vec![3.5, ND, 11.0, 13.5], 1e-6);
    assert_eq!(view.entry().no_data, Some(ND));

    let gt = view.entry().geotransform.clone().unwrap();
    assert_eq!(gt.pixel_width, 2.0);
    assert_eq!(gt.origin_y, 4.0);
}

#[tokio::test]
async fn test_nan_blocks_stay_nodata_without_sentinel() {
    let h = Harness::with_builtins();
    let mut data = create_ramp_grid(4, 4);
    for idx in [0, 1, 4, 5] {
        data[idx] = f32::NAN;
    }
    let source = h.source("B03", "flat", &GRID_4X4, &data, None);

    let view = h.builder.ensure_level(&source, 1).await.unwrap();
    let values = view.as_f32().unwrap();
    assert!(values[0].is_nan());
    assert!(values[1..].iter().all(|v| v.is_finite()));
}

#[tokio::test]
async fn test_max_aggregation_for_reflectivity() {
    let h = Harness::with_builtins();
    let data = create_ramp_grid(4, 4);
    let source = h.source("REFL_composite", "flat", &GRID_4X4, &data, None);

    let view = h.builder.ensure_level(&source, 1).await.unwrap();
    assert_eq!(view.as_f32().unwrap().as_ref(), &[6.0, 8.0, 14.0, 16.0]);
}

#[tokio::test]
async fn test_level_shapes_round_up() {
    let h = Harness::with_builtins();
    let data = create_ramp_grid(grid::ODD_5X7.cols, grid::ODD_5X7.rows);
    let source = h.source("B03", "flat", &grid::ODD_5X7, &data, None);

    let shapes: Vec<(usize, usize)> = (0..=3)
        .map(|l| {
            let s = h.builder.level_shape(&source, l);
            (s.rows, s.cols)
        })
        .collect();
    assert_eq!(shapes, vec![(5, 7), (3, 4), (2, 2), (1, 1)]);
    assert_eq!(h.builder.max_level(&source), 3);
    assert_eq!(h.builder.level_pixel_sizes(&source), vec![1.0, 2.0, 4.0, 8.0]);

    let view = h.builder.ensure_level(&source, 3).await.unwrap();
    assert_eq!(view.entry().shape.len(), 1);
}

#[tokio::test]
async fn test_level_beyond_max_is_rejected() {
    let config = PyramidConfig {
        max_level: 2,
        ..Default::default()
    };
    let h = Harness::new(ReaderRegistry::with_builtins(), config);
    let source = h.source("B03", "flat", &GRID_4X4, &create_ramp_grid(4, 4), None);

    let err = h.builder.ensure_level(&source, 3).await.unwrap_err();
    assert!(matches!(err, SiftError::BuildFailure(_)));
}

#[tokio::test]
async fn test_level_chain_keys() {
    let h = Harness::with_builtins();
    let mean = h.source("B03", "flat", &GRID_4X4, &create_ramp_grid(4, 4), None);

    let chain = h.builder.level_chain(&mean, 2);
    assert_eq!(chain.len(), 3);
    assert_eq!(chain[0], mean.source_key());
    assert_ne!(chain[1], chain[2]);
    assert_eq!(
        chain[1],
        mean.source_key().for_level(1, "mean", 2)
    );
}

// ============================================================================
// Concurrency and caching
// ============================================================================

#[tokio::test]
async fn test_concurrent_requests_build_once() {
    let (reader, reads) = InstrumentedReader::new("slow", Duration::from_millis(100));
    let mut readers = ReaderRegistry::with_builtins();
    readers.register(reader);
    let h = Harness::new(readers, PyramidConfig::default());
    let source = h.source("B03", "slow", &GRID_4X4, &create_ramp_grid(4, 4), None);

    let results = join_all((0..8).map(|_| h.builder.ensure_level(&source, 2))).await;

    let keys: Vec<_> = results.into_iter().map(|r| r.unwrap().key()).collect();
    assert!(keys.iter().all(|k| *k == keys[0]));
    assert_eq!(reads.load(Ordering::SeqCst), 1);

    let stats = h.builder.stats();
    assert_eq!(stats.source_imports, 1);
    assert_eq!(stats.levels_built, 3);
    assert_eq!(stats.coalesced, 7);
}

#[tokio::test]
async fn test_cached_levels_are_reused() {
    let h = Harness::with_builtins();
    let source = h.source("B03", "flat", &GRID_4X4, &create_ramp_grid(4, 4), None);

    h.builder.ensure_level(&source, 2).await.unwrap();
    assert!(h.builder.is_cached(&source, 1));
    h.builder.ensure_level(&source, 2).await.unwrap();
    h.builder.ensure_level(&source, 1).await.unwrap();

    let stats = h.builder.stats();
    assert_eq!(stats.levels_built, 3);
    assert_eq!(stats.cache_hits, 2);

    // A second builder over the same store finds everything cached.
    let other = PyramidBuilder::new(
        h.store.clone(),
        ReaderRegistry::with_builtins(),
        PyramidConfig::default(),
    )
    .unwrap();
    other.ensure_level(&source, 2).await.unwrap();
    assert_eq!(other.stats().source_imports, 0);
}

#[tokio::test]
async fn test_source_read_error_reaches_every_waiter() {
    let (mut reader, reads) = InstrumentedReader::new("broken", Duration::from_millis(50));
    reader.fail = true;
    let mut readers = ReaderRegistry::with_builtins();
    readers.register(reader);
    let h = Harness::new(readers, PyramidConfig::default());
    let source = h.source("B03", "broken", &GRID_4X4, &create_ramp_grid(4, 4), None);

    let results = join_all((0..4).map(|_| h.builder.ensure_level(&source, 1))).await;

    for result in results {
        assert!(matches!(result, Err(SiftError::SourceRead(_))));
    }
    assert_eq!(reads.load(Ordering::SeqCst), 1);
    assert!(!h.store.contains(&source.source_key()));
    assert_eq!(h.builder.stats().failures, 2);
}

#[tokio::test]
async fn test_import_reports_progress_per_block() {
    let config = PyramidConfig {
        read_increment_rows: 2,
        max_read_rows: 2,
        ..Default::default()
    };
    let h = Harness::new(ReaderRegistry::with_builtins(), config);
    let data = create_ramp_grid(grid::ODD_5X7.cols, grid::ODD_5X7.rows);
    let source = h.source("B03", "flat", &grid::ODD_5X7, &data, None);
    let mut progress = h.builder.subscribe_progress();

    h.builder.ensure_level(&source, 0).await.unwrap();

    let mut events = Vec::new();
    while let Ok(event) = progress.try_recv() {
        events.push(event);
    }
    let completions: Vec<f32> = events.iter().map(|e| e.completion).collect();
    assert_eq!(completions, vec![0.4, 0.8, 1.0, 1.0]);
    assert_eq!(events[0].stage_desc, "importing flat");
    assert_eq!(events[3].stage_desc, "done loading flat");
    assert!(events.iter().all(|e| e.level == 0 && e.dataset == "B03"));
}

// ============================================================================
// Derived products
// ============================================================================

fn pipeline(h: &Harness) -> DerivedPipeline {
    DerivedPipeline::with_builtins(h.store.clone())
}

#[tokio::test]
async fn test_derived_product_computed_once() {
    let h = Harness::with_builtins();
    let source = h.source("B03", "flat", &GRID_4X4, &create_ramp_grid(4, 4), None);
    let input = h.builder.ensure_level(&source, 0).await.unwrap().key();
    let pipeline = pipeline(&h);
    let recipe = Recipe::colorize("viridis", 1.0, 16.0);

    let first = pipeline.compute(&recipe, &[input]).await.unwrap();
    let second = pipeline.compute(&recipe, &[input]).await.unwrap();

    assert_eq!(first.key(), second.key());
    assert_eq!(first.key(), pipeline.output_key(&recipe, &[input]).unwrap());
    let stats = pipeline.stats();
    assert_eq!(stats.computations, 1);
    assert_eq!(stats.cache_hits, 1);
}

#[tokio::test]
async fn test_concurrent_derived_requests_compute_once() {
    let h = Harness::with_builtins();
    let source = h.source("B03", "flat", &GRID_4X4, &create_ramp_grid(4, 4), None);
    let input = h.builder.ensure_level(&source, 0).await.unwrap().key();
    let pipeline = pipeline(&h);
    let recipe = Recipe::colorize("grayscale", 0.0, 16.0);
    let inputs = [input];

    let results = join_all((0..6).map(|_| pipeline.compute(&recipe, &inputs))).await;
    assert!(results.iter().all(|r| r.is_ok()));
    assert_eq!(pipeline.stats().computations, 1);
}

#[tokio::test]
async fn test_colorize_makes_nodata_transparent() {
    let h = Harness::with_builtins();
    let mut data = create_ramp_grid(4, 4);
    data[5] = ND;
    let source = h.source("B03", "flat", &GRID_4X4, &data, Some(ND));
    let input = h.builder.ensure_level(&source, 0).await.unwrap().key();

    let view = pipeline(&h)
        .compute(&Recipe::colorize("grayscale", 1.0, 16.0), &[input])
        .await
        .unwrap();

    let bytes = view.bytes();
    assert_eq!(bytes.len(), 16 * 4);
    assert_eq!(view.entry().shape.channels, 4);
    assert_eq!(bytes[5 * 4 + 3], 0);
    assert_eq!(&bytes[0..4], &[0, 0, 0, 255]);
    assert_eq!(&bytes[15 * 4..], &[255, 255, 255, 255]);
}

#[tokio::test]
async fn test_band_algebra_normalized_difference() {
    let h = Harness::with_builtins();
    let nir = h.source("B08", "flat", &GRID_4X4, &[0.6; 16], None);
    let mut red_values = [0.2; 16];
    red_values[3] = ND;
    red_values[7] = -0.6;
    let red = h.source("B04", "flat", &GRID_4X4, &red_values, Some(ND));

    let nir_key = h.builder.ensure_level(&nir, 0).await.unwrap().key();
    let red_key = h.builder.ensure_level(&red, 0).await.unwrap().key();

    let recipe = Recipe::BandAlgebra {
        op: BandOp::NormalizedDifference,
    };
    let view = pipeline(&h).compute(&recipe, &[nir_key, red_key]).await.unwrap();
    let values = view.as_f32().unwrap();

    assert!((values[0] - 0.5).abs() < 1e-6);
    assert!(values[3].is_nan());
    // 0.6 + -0.6 == 0
    assert!(values[7].is_nan());
}

#[tokio::test]
async fn test_band_algebra_rejects_wrong_arity() {
    let h = Harness::with_builtins();
    let source = h.source("B03", "flat", &GRID_4X4, &create_ramp_grid(4, 4), None);
    let input = h.builder.ensure_level(&source, 0).await.unwrap().key();

    let recipe = Recipe::BandAlgebra {
        op: BandOp::Difference,
    };
    assert!(pipeline(&h).compute(&recipe, &[input]).await.is_err());
}

#[tokio::test]
async fn test_missing_input_is_not_found() {
    let h = Harness::with_builtins();
    let source = h.source("B03", "flat", &GRID_4X4, &create_ramp_grid(4, 4), None);

    let err = pipeline(&h)
        .compute(&Recipe::colorize("viridis", 0.0, 1.0), &[source.source_key()])
        .await
        .unwrap_err();
    assert!(matches!(err, SiftError::NotFound(_)));
}

#[tokio::test]
async fn test_reproject_follows_pyramid_levels() {
    let h = Harness::with_builtins();
    let data = create_ramp_grid(4, 4);
    let source = h.source("B03", "flat", &GRID_4X4, &data, None);
    let pipeline = pipeline(&h);

    let recipe = Recipe::Reproject {
        target: TargetGrid::covering("EPSG:4326", 0.0, 0.0, 4.0, 4.0, 1.0),
        method: ResampleMethod::Nearest,
    };

    let l0 = h.builder.ensure_level(&source, 0).await.unwrap();
    let full = pipeline.compute(&recipe, &[l0.key()]).await.unwrap();
    assert_eq!(full.as_f32().unwrap().as_ref(), data.as_slice());

    let l1 = h.builder.ensure_level(&source, 1).await.unwrap();
    let coarse = pipeline
        .compute(&recipe.at_scale(2), &[l1.key()])
        .await
        .unwrap();
    assert_eq!((coarse.entry().shape.rows, coarse.entry().shape.cols), (2, 2));
    assert_eq!(coarse.as_f32().unwrap().as_ref(), l1.as_f32().unwrap().as_ref());
    assert_eq!(
        coarse.entry().geotransform,
        Some(GeoTransform::north_up(0.0, 4.0, 2.0, "EPSG:4326"))
    );
}

#[tokio::test]
async fn test_unknown_colormap_fails() {
    let h = Harness::with_builtins();
    let source = h.source("B03", "flat", &GRID_4X4, &create_ramp_grid(4, 4), None);
    let input = h.builder.ensure_level(&source, 0).await.unwrap().key();

    let pipeline = pipeline(&h);
    let result = pipeline
        .compute(&Recipe::colorize("no-such-map", 0.0, 1.0), &[input])
        .await;
    assert!(matches!(result, Err(SiftError::NotFound(_))));
    assert_eq!(pipeline.stats().failures, 1);
}
