//! Derived product recipes.

use raster_ops::{BandOp, ResampleMethod, TargetGrid};
use serde::{Deserialize, Serialize};
use sift_common::{CacheKey, Result, SiftError};

/// A transform over one or more cached inputs.
///
/// Each variant carries all of its parameters, so a recipe plus its input
/// keys hashes to exactly one output key.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "recipe", rename_all = "snake_case")]
pub enum Recipe {
    /// Float grid to RGBA8 through a named colormap.
    Colorize {
        colormap: String,
        vmin: f32,
        vmax: f32,
    },
    /// Pixel-wise algebra across same-shape inputs.
    BandAlgebra { op: BandOp },
    /// Resample onto a target projection and pixel grid.
    Reproject {
        target: TargetGrid,
        #[serde(default)]
        method: ResampleMethod,
    },
}

impl Recipe {
    pub fn colorize(colormap: impl Into<String>, vmin: f32, vmax: f32) -> Self {
        Recipe::Colorize {
            colormap: colormap.into(),
            vmin,
            vmax,
        }
    }

    pub fn name(&self) -> &'static str {
        match self {
            Recipe::Colorize { .. } => "colorize",
            Recipe::BandAlgebra { .. } => "band_algebra",
            Recipe::Reproject { .. } => "reproject",
        }
    }

    /// Check the number of inputs the recipe is given.
    pub fn check_inputs(&self, inputs: usize) -> Result<()> {
        match self {
            Recipe::BandAlgebra { op } => op.check_arity(inputs),
            Recipe::Colorize { .. } | Recipe::Reproject { .. } if inputs == 1 => Ok(()),
            _ => Err(SiftError::build_failure(format!(
                "{} takes exactly one input, got {}",
                self.name(),
                inputs
            ))),
        }
    }

    /// The recipe applied to inputs `factor` times coarser than the ones it
    /// was written for. Only reprojection depends on the pixel grid.
    pub fn at_scale(&self, factor: usize) -> Recipe {
        match self {
            Recipe::Reproject { target, method } => Recipe::Reproject {
                target: target.scaled(factor),
                method: *method,
            },
            other => other.clone(),
        }
    }

    /// Output key for this recipe over `inputs`, in order.
    pub fn key(&self, inputs: &[CacheKey]) -> Result<CacheKey> {
        let params = serde_json::to_vec(self)?;
        let builder = inputs.iter().fold(
            CacheKey::builder("recipe").field("recipe", params),
            |builder, input| builder.key("input", input),
        );
        Ok(builder.finish())
    }
}
