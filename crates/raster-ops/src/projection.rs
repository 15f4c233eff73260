//! Pluggable coordinate reference systems.
//!
//! Projections convert between a CRS's native coordinates and geographic
//! longitude/latitude in degrees. The registry resolves a geotransform's
//! projection reference to an implementation.

use sift_common::{Result, SiftError};
use std::collections::HashMap;
use std::f64::consts::PI;
use std::sync::Arc;

/// A coordinate reference system.
pub trait Projection: Send + Sync {
    /// Canonical reference, e.g. "EPSG:4326".
    fn name(&self) -> &str;

    /// Native coordinates to (lon, lat) degrees. `None` outside the domain.
    fn to_lonlat(&self, x: f64, y: f64) -> Option<(f64, f64)>;

    /// (lon, lat) degrees to native coordinates. `None` outside the domain.
    fn from_lonlat(&self, lon: f64, lat: f64) -> Option<(f64, f64)>;
}

/// WGS84 longitude/latitude (EPSG:4326).
#[derive(Debug, Clone, Copy, Default)]
pub struct Geographic;

impl Projection for Geographic {
    fn name(&self) -> &str {
        "EPSG:4326"
    }

    fn to_lonlat(&self, x: f64, y: f64) -> Option<(f64, f64)> {
        (y.abs() <= 90.0 && x.is_finite()).then_some((x, y))
    }

    fn from_lonlat(&self, lon: f64, lat: f64) -> Option<(f64, f64)> {
        (lat.abs() <= 90.0 && lon.is_finite()).then_some((lon, lat))
    }
}

/// Spherical Web Mercator (EPSG:3857).
#[derive(Debug, Clone, Copy, Default)]
pub struct WebMercator;

impl WebMercator {
    /// WGS84 semi-major axis, used as the sphere radius.
    pub const RADIUS: f64 = 6_378_137.0;
    /// Latitude where the projected square world ends.
    pub const MAX_LAT: f64 = 85.051_128_779_806_6;
}

impl Projection for WebMercator {
    fn name(&self) -> &str {
        "EPSG:3857"
    }

    fn to_lonlat(&self, x: f64, y: f64) -> Option<(f64, f64)> {
        if !x.is_finite() || !y.is_finite() {
            return None;
        }
        let lon = (x / Self::RADIUS).to_degrees();
        let lat = (2.0 * (y / Self::RADIUS).exp().atan() - PI / 2.0).to_degrees();
        Some((lon, lat))
    }

    fn from_lonlat(&self, lon: f64, lat: f64) -> Option<(f64, f64)> {
        if lat.abs() > Self::MAX_LAT || !lon.is_finite() {
            return None;
        }
        let x = Self::RADIUS * lon.to_radians();
        let y = Self::RADIUS * (PI / 4.0 + lat.to_radians() / 2.0).tan().ln();
        Some((x, y))
    }
}

/// Resolves projection references to implementations.
#[derive(Clone)]
pub struct ProjectionRegistry {
    projections: HashMap<String, Arc<dyn Projection>>,
}

impl ProjectionRegistry {
    /// Empty registry.
    pub fn new() -> Self {
        Self {
            projections: HashMap::new(),
        }
    }

    /// Registry with EPSG:4326 and EPSG:3857 and their common aliases.
    pub fn with_builtins() -> Self {
        let mut registry = Self::new();
        let geographic: Arc<dyn Projection> = Arc::new(Geographic);
        let mercator: Arc<dyn Projection> = Arc::new(WebMercator);

        for alias in ["EPSG:4326", "CRS:84", "WGS84"] {
            registry.register_arc(alias, geographic.clone());
        }
        for alias in ["EPSG:3857", "EPSG:900913"] {
            registry.register_arc(alias, mercator.clone());
        }
        registry
    }

    pub fn register(&mut self, reference: &str, projection: impl Projection + 'static) {
        self.register_arc(reference, Arc::new(projection));
    }

    pub fn register_arc(&mut self, reference: &str, projection: Arc<dyn Projection>) {
        self.projections.insert(normalize(reference), projection);
    }

    pub fn get(&self, reference: &str) -> Result<Arc<dyn Projection>> {
        self.projections
            .get(&normalize(reference))
            .cloned()
            .ok_or_else(|| SiftError::Projection(format!("unsupported projection '{}'", reference)))
    }

    pub fn supports(&self, reference: &str) -> bool {
        self.projections.contains_key(&normalize(reference))
    }
}

impl Default for ProjectionRegistry {
    fn default() -> Self {
        Self::with_builtins()
    }
}

fn normalize(reference: &str) -> String {
    reference.trim().to_uppercase()
}
