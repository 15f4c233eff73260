//! Derived products: recipes applied to cached inputs, cached in turn.

use crate::builder::{fetch_built, run_blocking};
use crate::recipe::Recipe;
use crate::single_flight::SingleFlight;
use cache_store::{CacheStore, EntryMetadata, EntryView};
use raster_ops::{
    colorize, evaluate, reproject, Band, ColormapRegistry, ProjectionRegistry, SourceGrid,
};
use serde::Serialize;
use sift_common::{CacheKey, RasterArray, Result, SiftError};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Instant;
use tracing::{debug, info, warn};

#[derive(Debug, Clone, Default, Serialize)]
pub struct PipelineStats {
    pub computations: u64,
    pub cache_hits: u64,
    pub failures: u64,
}

/// Computes and caches derived products.
pub struct DerivedPipeline {
    store: Arc<CacheStore>,
    colormaps: Arc<ColormapRegistry>,
    projections: Arc<ProjectionRegistry>,
    flights: SingleFlight<CacheKey, Result<EntryView>>,
    computations: AtomicU64,
    cache_hits: AtomicU64,
    failures: AtomicU64,
}

impl DerivedPipeline {
    pub fn new(
        store: Arc<CacheStore>,
        colormaps: ColormapRegistry,
        projections: ProjectionRegistry,
    ) -> Self {
        Self {
            store,
            colormaps: Arc::new(colormaps),
            projections: Arc::new(projections),
            flights: SingleFlight::new(),
            computations: AtomicU64::new(0),
            cache_hits: AtomicU64::new(0),
            failures: AtomicU64::new(0),
        }
    }

    /// Pipeline with the built-in colormaps and projections.
    pub fn with_builtins(store: Arc<CacheStore>) -> Self {
        Self::new(
            store,
            ColormapRegistry::with_builtins(),
            ProjectionRegistry::with_builtins(),
        )
    }

    pub fn colormaps(&self) -> &ColormapRegistry {
        &self.colormaps
    }

    pub fn projections(&self) -> &ProjectionRegistry {
        &self.projections
    }

    /// Key the output of `recipe` over `inputs` is stored under.
    pub fn output_key(&self, recipe: &Recipe, inputs: &[CacheKey]) -> Result<CacheKey> {
        recipe.key(inputs)
    }

    /// Apply `recipe` to the cached `inputs`, reusing a cached result when
    /// one exists. Inputs must already be in the store.
    pub async fn compute(&self, recipe: &Recipe, inputs: &[CacheKey]) -> Result<EntryView> {
        recipe.check_inputs(inputs.len())?;
        let key = recipe.key(inputs)?;

        if let Some(view) = self.store.get(&key)? {
            self.cache_hits.fetch_add(1, Ordering::Relaxed);
            metrics::counter!("sift_pipeline_cache_hits_total").increment(1);
            debug!(recipe = recipe.name(), key = %key.short(), "Derived product cache hit");
            return Ok(view);
        }

        self.flights
            .run(key, || async move {
                if let Some(view) = self.store.get(&key)? {
                    return Ok(view);
                }
                let started = Instant::now();
                let result = self.compute_uncached(recipe, inputs, key).await;
                match &result {
                    Ok(_) => {
                        self.computations.fetch_add(1, Ordering::Relaxed);
                        metrics::counter!("sift_pipeline_computations_total", "recipe" => recipe.name())
                            .increment(1);
                        info!(
                            recipe = recipe.name(),
                            inputs = inputs.len(),
                            key = %key.short(),
                            elapsed_ms = started.elapsed().as_millis() as u64,
                            "Computed derived product"
                        );
                    }
                    Err(e) => {
                        self.failures.fetch_add(1, Ordering::Relaxed);
                        warn!(recipe = recipe.name(), key = %key.short(), error = %e, "Derived product failed");
                    }
                }
                result
            })
            .await
    }

    async fn compute_uncached(
        &self,
        recipe: &Recipe,
        inputs: &[CacheKey],
        key: CacheKey,
    ) -> Result<EntryView> {
        let mut views = Vec::with_capacity(inputs.len());
        for input in inputs {
            let view = self.store.get(input)?.ok_or_else(|| {
                SiftError::NotFound(format!("input {} is not cached", input.short()))
            })?;
            views.push(view);
        }

        let store = self.store.clone();
        let colormaps = self.colormaps.clone();
        let projections = self.projections.clone();
        let recipe = recipe.clone();

        run_blocking(move || {
            let (array, metadata) = apply(&recipe, &views, &colormaps, &projections)?;
            store.put(key, &array, metadata.with_label(recipe.name()))?;
            fetch_built(&store, &key)
        })
        .await
    }

    pub fn stats(&self) -> PipelineStats {
        PipelineStats {
            computations: self.computations.load(Ordering::Relaxed),
            cache_hits: self.cache_hits.load(Ordering::Relaxed),
            failures: self.failures.load(Ordering::Relaxed),
        }
    }
}

fn float_values<'a>(view: &'a EntryView, recipe: &Recipe) -> Result<std::borrow::Cow<'a, [f32]>> {
    view.as_f32().ok_or_else(|| {
        SiftError::build_failure(format!(
            "{} needs float32 input, {} is {}",
            recipe.name(),
            view.key().short(),
            view.entry().dtype.as_str()
        ))
    })
}

fn apply(
    recipe: &Recipe,
    views: &[EntryView],
    colormaps: &ColormapRegistry,
    projections: &ProjectionRegistry,
) -> Result<(RasterArray, EntryMetadata)> {
    let first = &views[0];
    let shape = first.entry().shape;

    match recipe {
        Recipe::Colorize {
            colormap,
            vmin,
            vmax,
        } => {
            let gradient = colormaps.get(colormap)?;
            let values = float_values(first, recipe)?;
            let pixels = colorize(&values, first.entry().no_data, gradient, *vmin, *vmax);
            let array = RasterArray::from_rgba(shape.rows, shape.cols, pixels)?;
            Ok((array, EntryMetadata::new(first.entry().geotransform.clone(), None)))
        }
        Recipe::BandAlgebra { op } => {
            if let Some(other) = views.iter().find(|v| v.entry().shape != shape) {
                return Err(SiftError::build_failure(format!(
                    "band algebra inputs differ in shape: {}x{} vs {}x{}",
                    shape.rows,
                    shape.cols,
                    other.entry().shape.rows,
                    other.entry().shape.cols
                )));
            }
            let values = views
                .iter()
                .map(|v| float_values(v, recipe))
                .collect::<Result<Vec<_>>>()?;
            let bands: Vec<Band<'_>> = values
                .iter()
                .zip(views)
                .map(|(values, view)| Band {
                    values: values.as_ref(),
                    nodata: view.entry().no_data,
                })
                .collect();
            let data = evaluate(op, &bands)?;
            let array = RasterArray::from_f32(shape.rows, shape.cols, data)?;
            Ok((array, EntryMetadata::new(first.entry().geotransform.clone(), None)))
        }
        Recipe::Reproject { target, method } => {
            let geotransform = first.entry().geotransform.as_ref().ok_or_else(|| {
                SiftError::build_failure(format!(
                    "input {} has no geotransform to reproject from",
                    first.key().short()
                ))
            })?;
            let values = float_values(first, recipe)?;
            let source = SourceGrid {
                data: &values,
                rows: shape.rows,
                cols: shape.cols,
                geotransform,
                nodata: first.entry().no_data,
            };
            let data = reproject(source, target, *method, projections)?;
            let array = RasterArray::from_f32(target.rows, target.cols, data)?;
            Ok((array, EntryMetadata::new(Some(target.geotransform()), None)))
        }
    }
}
