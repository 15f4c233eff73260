//! World-space extents for viewports and raster footprints.

use serde::{Deserialize, Serialize};
use std::str::FromStr;

/// Axis-aligned extent in the units of a raster's projection reference.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct BoundingBox {
    pub min_x: f64,
    pub min_y: f64,
    pub max_x: f64,
    pub max_y: f64,
}

impl BoundingBox {
    pub fn new(min_x: f64, min_y: f64, max_x: f64, max_y: f64) -> Self {
        Self {
            min_x,
            min_y,
            max_x,
            max_y,
        }
    }

    /// Box of `width` x `height` centered on (`cx`, `cy`), the shape a
    /// renderer's camera usually reports.
    pub fn around(cx: f64, cy: f64, width: f64, height: f64) -> Self {
        let (hw, hh) = (width / 2.0, height / 2.0);
        Self::new(cx - hw, cy - hh, cx + hw, cy + hh)
    }

    pub fn width(&self) -> f64 {
        self.max_x - self.min_x
    }

    pub fn height(&self) -> f64 {
        self.max_y - self.min_y
    }

    pub fn center(&self) -> (f64, f64) {
        (
            self.min_x + self.width() / 2.0,
            self.min_y + self.height() / 2.0,
        )
    }

    /// Finite corners with min <= max on both axes. Degenerate (zero-area)
    /// boxes are valid.
    pub fn is_valid(&self) -> bool {
        let corners = [self.min_x, self.min_y, self.max_x, self.max_y];
        corners.iter().all(|v| v.is_finite())
            && self.min_x <= self.max_x
            && self.min_y <= self.max_y
    }

    /// Overlapping region, `None` when the boxes only touch or are apart.
    pub fn overlap(&self, other: &BoundingBox) -> Option<BoundingBox> {
        let clipped = BoundingBox::new(
            self.min_x.max(other.min_x),
            self.min_y.max(other.min_y),
            self.max_x.min(other.max_x),
            self.max_y.min(other.max_y),
        );
        (clipped.min_x < clipped.max_x && clipped.min_y < clipped.max_y).then_some(clipped)
    }

    pub fn contains(&self, x: f64, y: f64) -> bool {
        (self.min_x..=self.max_x).contains(&x) && (self.min_y..=self.max_y).contains(&y)
    }
}

/// Parses `"min_x,min_y,max_x,max_y"`, the form used on the command line
/// and in YAML viewport fixtures.
impl FromStr for BoundingBox {
    type Err = BboxParseError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let values = s
            .split(',')
            .map(|part| {
                let part = part.trim();
                part.parse::<f64>()
                    .map_err(|_| BboxParseError::InvalidNumber(part.to_string()))
            })
            .collect::<Result<Vec<_>, _>>()?;

        let [min_x, min_y, max_x, max_y] = values[..] else {
            return Err(BboxParseError::WrongArity(values.len()));
        };
        let bbox = Self::new(min_x, min_y, max_x, max_y);
        if !bbox.is_valid() {
            return Err(BboxParseError::Inverted(s.to_string()));
        }
        Ok(bbox)
    }
}

#[derive(Debug, thiserror::Error)]
pub enum BboxParseError {
    #[error("expected 4 comma-separated values, got {0}")]
    WrongArity(usize),

    #[error("not a number: {0:?}")]
    InvalidNumber(String),

    #[error("extent is inverted or not finite: {0}")]
    Inverted(String),
}
