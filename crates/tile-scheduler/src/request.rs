//! Viewport requests and the plans they produce.

use chrono::{DateTime, Utc};
use pyramid::Recipe;
use serde::{Deserialize, Serialize};
use sift_common::{BoundingBox, Result, SiftError, TileCoord};
use tokio::sync::oneshot;

/// What to show for a layer.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, Default)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum ProductSpec {
    /// The pyramid level itself.
    #[default]
    Raw,
    /// A recipe over the requested family plus `extra_families`, all at the
    /// same time step and level.
    Derived {
        recipe: Recipe,
        #[serde(default)]
        extra_families: Vec<String>,
    },
}

impl ProductSpec {
    pub fn derived(recipe: Recipe) -> Self {
        ProductSpec::Derived {
            recipe,
            extra_families: Vec::new(),
        }
    }

    /// Display label, `family` or `family:recipe`.
    pub fn label(&self, family: &str) -> String {
        match self {
            ProductSpec::Raw => family.to_string(),
            ProductSpec::Derived { recipe, .. } => format!("{}:{}", family, recipe.name()),
        }
    }
}

/// A renderer's view: what area, at what resolution, of which layer.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ViewportRequest {
    /// Visible area in the product's coordinate system.
    pub bbox: BoundingBox,
    /// Ground size of one screen pixel, in the same units as `bbox`.
    pub pixel_size: f64,
    pub family: String,
    /// Requested time; the nearest registered time step is used.
    pub time: DateTime<Utc>,
    #[serde(default)]
    pub product: ProductSpec,
}

impl ViewportRequest {
    pub fn new(
        family: impl Into<String>,
        time: DateTime<Utc>,
        bbox: BoundingBox,
        pixel_size: f64,
    ) -> Self {
        Self {
            bbox,
            pixel_size,
            family: family.into(),
            time,
            product: ProductSpec::Raw,
        }
    }

    pub fn with_product(mut self, product: ProductSpec) -> Self {
        self.product = product;
        self
    }

    pub(crate) fn validate(&self) -> Result<()> {
        if !self.bbox.is_valid() {
            return Err(SiftError::config(format!("invalid viewport bbox {:?}", self.bbox)));
        }
        if !(self.pixel_size.is_finite() && self.pixel_size > 0.0) {
            return Err(SiftError::config(format!(
                "viewport pixel size must be positive, got {}",
                self.pixel_size
            )));
        }
        Ok(())
    }
}

/// One tile queued by a viewport.
#[derive(Debug, Clone, Copy, PartialEq, Serialize)]
pub struct PlannedTile {
    pub coord: TileCoord,
    /// Whether the tile's level was already cached when planned.
    pub cached: bool,
}

/// How a viewport request was resolved.
#[derive(Debug, Clone, Serialize)]
pub struct ViewportPlan {
    pub epoch: u64,
    pub product: String,
    /// Time step actually used.
    pub time: DateTime<Utc>,
    /// Level chosen for the requested pixel size.
    pub level: u32,
    /// Coarser cached level queued ahead of `level`, if any.
    pub preview_level: Option<u32>,
    /// Tiles in priority order.
    pub tiles: Vec<PlannedTile>,
}

impl ViewportPlan {
    /// Tiles at the selected level (previews excluded).
    pub fn primary_tiles(&self) -> impl Iterator<Item = &PlannedTile> {
        self.tiles.iter().filter(move |t| t.coord.level == self.level)
    }
}

/// Handle returned by `request_viewport`.
#[derive(Debug)]
pub struct Ticket {
    pub epoch: u64,
    plan: oneshot::Receiver<Result<ViewportPlan>>,
}

impl Ticket {
    pub(crate) fn new(epoch: u64, plan: oneshot::Receiver<Result<ViewportPlan>>) -> Self {
        Self { epoch, plan }
    }

    /// Wait for the scheduler to resolve the request.
    ///
    /// A request superseded before it was planned resolves to
    /// `SiftError::Cancelled`.
    pub async fn plan(self) -> Result<ViewportPlan> {
        match self.plan.await {
            Ok(plan) => plan,
            Err(_) => Err(SiftError::Cancelled(format!(
                "scheduler stopped before planning epoch {}",
                self.epoch
            ))),
        }
    }
}
