//! A viewport's product resolved against the registry: which sources feed
//! it, how its levels are shaped, and how a level is materialized.

use crate::request::{ProductSpec, ViewportRequest};
use cache_store::EntryView;
use chrono::{DateTime, Utc};
use layer_registry::{Checkout, LayerRegistry, ResolvedSource};
use pyramid::{DerivedPipeline, PyramidBuilder, Recipe};
use sift_common::{CacheKey, GeoTransform, RasterShape, Result, SiftError};

#[derive(Debug)]
pub(crate) struct ResolvedProduct {
    pub label: String,
    pub time: DateTime<Utc>,
    /// Requested family first, then any extra recipe inputs.
    pub sources: Vec<ResolvedSource>,
    pub recipe: Option<Recipe>,
}

impl ResolvedProduct {
    /// Resolve the request's family (and extra inputs) at the nearest
    /// registered time step.
    pub fn resolve(registry: &LayerRegistry, request: &ViewportRequest) -> Result<Self> {
        let time = registry.nearest_time(&request.family, request.time)?;
        let mut sources = vec![registry.resolve_source(&request.family, time)?];

        let recipe = match &request.product {
            ProductSpec::Raw => None,
            ProductSpec::Derived {
                recipe,
                extra_families,
            } => {
                for family in extra_families {
                    let t = registry.nearest_time(family, time)?;
                    sources.push(registry.resolve_source(family, t)?);
                }
                recipe.check_inputs(sources.len())?;
                Some(recipe.clone())
            }
        };

        Ok(Self {
            label: request.product.label(&request.family),
            time,
            sources,
            recipe,
        })
    }

    fn primary(&self) -> &ResolvedSource {
        &self.sources[0]
    }

    /// Coarsest level every input supports.
    pub fn max_level(&self, builder: &PyramidBuilder) -> u32 {
        self.sources
            .iter()
            .map(|s| builder.max_level(&s.entry.descriptor))
            .min()
            .unwrap_or(0)
    }

    pub fn level_shape(&self, builder: &PyramidBuilder, level: u32) -> RasterShape {
        match &self.recipe {
            Some(Recipe::Reproject { target, .. }) => {
                let grid = target.scaled(builder.config().scale(level));
                RasterShape::new(grid.rows, grid.cols)
            }
            _ => builder.level_shape(&self.primary().entry.descriptor, level),
        }
    }

    pub fn level_geotransform(&self, builder: &PyramidBuilder, level: u32) -> GeoTransform {
        match &self.recipe {
            Some(Recipe::Reproject { target, .. }) => target
                .scaled(builder.config().scale(level))
                .geotransform(),
            _ => builder.level_geotransform(&self.primary().entry.descriptor, level),
        }
    }

    /// Pixel size of each selectable level, finest first.
    pub fn pixel_sizes(&self, builder: &PyramidBuilder) -> Vec<f64> {
        (0..=self.max_level(builder))
            .map(|level| self.level_geotransform(builder, level).pixel_size())
            .collect()
    }

    fn recipe_at(&self, builder: &PyramidBuilder, level: u32) -> Option<Recipe> {
        self.recipe
            .as_ref()
            .map(|r| r.at_scale(builder.config().scale(level)))
    }

    fn input_keys(&self, builder: &PyramidBuilder, level: u32) -> Vec<CacheKey> {
        self.sources
            .iter()
            .map(|s| builder.level_key(&s.entry.descriptor, level))
            .collect()
    }

    /// Key of the entry tiles at `level` are cut from.
    pub fn key(&self, builder: &PyramidBuilder, level: u32) -> Result<CacheKey> {
        let inputs = self.input_keys(builder, level);
        match self.recipe_at(builder, level) {
            Some(recipe) => recipe.key(&inputs),
            None => Ok(inputs[0]),
        }
    }

    pub fn is_cached(&self, builder: &PyramidBuilder, level: u32) -> bool {
        self.key(builder, level)
            .map(|key| builder.store().contains(&key))
            .unwrap_or(false)
    }

    /// Everything a build of `level` may touch: each input's level chain
    /// plus the derived output.
    pub fn lease_keys(&self, builder: &PyramidBuilder, level: u32) -> Result<Vec<CacheKey>> {
        let mut keys: Vec<CacheKey> = self
            .sources
            .iter()
            .flat_map(|s| builder.level_chain(&s.entry.descriptor, level))
            .collect();
        if self.recipe.is_some() {
            keys.push(self.key(builder, level)?);
        }
        Ok(keys)
    }

    /// Hold every input time step for the duration of a job.
    pub fn checkout(&self, registry: &LayerRegistry) -> Result<Vec<Checkout>> {
        self.sources
            .iter()
            .map(|s| {
                registry
                    .checkout(&s.family, s.entry.time)
                    .map_err(SiftError::from)
            })
            .collect()
    }

    /// Build (or fetch) the entry for `level`.
    pub async fn materialize(
        &self,
        builder: &PyramidBuilder,
        pipeline: &DerivedPipeline,
        level: u32,
    ) -> Result<EntryView> {
        let mut inputs = Vec::with_capacity(self.sources.len());
        for source in &self.sources {
            let view = builder.ensure_level(&source.entry.descriptor, level).await?;
            inputs.push(view);
        }

        match self.recipe_at(builder, level) {
            Some(recipe) => {
                let keys: Vec<CacheKey> = inputs.iter().map(|v| v.key()).collect();
                pipeline.compute(&recipe, &keys).await
            }
            None => inputs.pop().ok_or_else(|| {
                SiftError::build_failure(format!("product {} has no inputs", self.label))
            }),
        }
    }
}
