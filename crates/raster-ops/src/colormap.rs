//! Named color gradients and colorization of float grids to RGBA.

use rayon::prelude::*;
use sift_common::{is_nodata, Result, SiftError};
use std::collections::BTreeMap;

/// Color value in RGBA format
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Color {
    pub r: u8,
    pub g: u8,
    pub b: u8,
    pub a: u8,
}

impl Color {
    pub const fn new(r: u8, g: u8, b: u8, a: u8) -> Self {
        Self { r, g, b, a }
    }

    pub const fn rgb(r: u8, g: u8, b: u8) -> Self {
        Self::new(r, g, b, 255)
    }

    pub const fn transparent() -> Self {
        Self::new(0, 0, 0, 0)
    }

    pub fn to_array(self) -> [u8; 4] {
        [self.r, self.g, self.b, self.a]
    }
}

/// Linear color interpolation
pub fn interpolate_color(color1: Color, color2: Color, t: f32) -> Color {
    let t = t.clamp(0.0, 1.0);
    let t_inv = 1.0 - t;

    let mix = |a: u8, b: u8| ((a as f32 * t_inv) + (b as f32 * t)).round() as u8;
    Color::new(
        mix(color1.r, color2.r),
        mix(color1.g, color2.g),
        mix(color1.b, color2.b),
        mix(color1.a, color2.a),
    )
}

/// Piecewise-linear gradient over normalized positions `0.0..=1.0`.
#[derive(Debug, Clone, PartialEq)]
pub struct Gradient {
    stops: Vec<(f32, Color)>,
}

impl Gradient {
    /// Build from `(position, color)` stops. Stops are sorted by position;
    /// at least one is required.
    pub fn new(mut stops: Vec<(f32, Color)>) -> Result<Self> {
        if stops.is_empty() {
            return Err(SiftError::config("gradient needs at least one stop"));
        }
        if stops.iter().any(|(p, _)| !p.is_finite()) {
            return Err(SiftError::config("gradient stop positions must be finite"));
        }
        stops.sort_by(|a, b| a.0.total_cmp(&b.0));
        Ok(Self { stops })
    }

    /// Evenly spaced stops.
    fn even(colors: &[Color]) -> Self {
        let last = (colors.len().max(2) - 1) as f32;
        Self {
            stops: colors
                .iter()
                .enumerate()
                .map(|(i, c)| (i as f32 / last, *c))
                .collect(),
        }
    }

    /// Color at normalized position `t` (clamped to the stop range).
    pub fn sample(&self, t: f32) -> Color {
        let (first_pos, first) = self.stops[0];
        if t <= first_pos {
            return first;
        }
        for pair in self.stops.windows(2) {
            let (p0, c0) = pair[0];
            let (p1, c1) = pair[1];
            if t <= p1 {
                let span = p1 - p0;
                let local = if span > 0.0 { (t - p0) / span } else { 1.0 };
                return interpolate_color(c0, c1, local);
            }
        }
        self.stops[self.stops.len() - 1].1
    }
}

/// Registry of named gradients used by `Colorize` recipes.
#[derive(Debug, Clone)]
pub struct ColormapRegistry {
    gradients: BTreeMap<String, Gradient>,
}

impl ColormapRegistry {
    pub fn new() -> Self {
        Self {
            gradients: BTreeMap::new(),
        }
    }

    /// Registry with the built-in gradients:
    /// `grayscale`, `viridis`, `temperature`, `ndvi`.
    pub fn with_builtins() -> Self {
        let mut registry = Self::new();
        registry.insert(
            "grayscale",
            Gradient::even(&[Color::rgb(0, 0, 0), Color::rgb(255, 255, 255)]),
        );
        registry.insert(
            "viridis",
            Gradient::even(&[
                Color::rgb(68, 1, 84),
                Color::rgb(59, 82, 139),
                Color::rgb(33, 145, 140),
                Color::rgb(94, 201, 98),
                Color::rgb(253, 231, 37),
            ]),
        );
        registry.insert(
            "temperature",
            Gradient::even(&[
                Color::rgb(25, 0, 76),
                Color::rgb(0, 0, 255),
                Color::rgb(0, 255, 255),
                Color::rgb(0, 255, 0),
                Color::rgb(255, 255, 0),
                Color::rgb(255, 165, 0),
                Color::rgb(255, 0, 0),
                Color::rgb(139, 0, 0),
            ]),
        );
        registry.insert(
            "ndvi",
            Gradient::even(&[
                Color::rgb(165, 0, 38),
                Color::rgb(215, 48, 39),
                Color::rgb(254, 224, 139),
                Color::rgb(166, 217, 106),
                Color::rgb(26, 152, 80),
                Color::rgb(0, 104, 55),
            ]),
        );
        registry
    }

    pub fn insert(&mut self, name: impl Into<String>, gradient: Gradient) {
        self.gradients.insert(name.into(), gradient);
    }

    pub fn get(&self, name: &str) -> Result<&Gradient> {
        self.gradients
            .get(name)
            .ok_or_else(|| SiftError::NotFound(format!("colormap '{}'", name)))
    }

    pub fn names(&self) -> impl Iterator<Item = &str> {
        self.gradients.keys().map(String::as_str)
    }
}

impl Default for ColormapRegistry {
    fn default() -> Self {
        Self::with_builtins()
    }
}

/// Map values to RGBA8 through `gradient`, scaling `vmin..vmax` to `0..1`.
///
/// No-data becomes fully transparent. Values outside the range clamp to the
/// end colors.
pub fn colorize(
    data: &[f32],
    nodata: Option<f32>,
    gradient: &Gradient,
    vmin: f32,
    vmax: f32,
) -> Vec<u8> {
    let range = vmax - vmin;
    let range = if range.abs() < f32::EPSILON { 1.0 } else { range };

    let mut pixels = vec![0u8; data.len() * 4];
    pixels
        .par_chunks_mut(4)
        .zip(data.par_iter())
        .for_each(|(px, &v)| {
            let color = if is_nodata(v, nodata) {
                Color::transparent()
            } else {
                gradient.sample((v - vmin) / range)
            };
            px.copy_from_slice(&color.to_array());
        });
    pixels
}
