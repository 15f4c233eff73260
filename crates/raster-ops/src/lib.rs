//! Raster kernels used by the pyramid builder and derived product pipeline.
//!
//! Everything here is pure computation over `f32` grids (plus the reader
//! capability that produces them); caching and concurrency live elsewhere.

pub mod aggregate;
pub mod band_math;
pub mod colormap;
pub mod flat;
pub mod interpolation;
pub mod projection;
pub mod reader;
pub mod reproject;

pub use aggregate::{aggregate, AggregationMethod};
pub use band_math::{evaluate, Band, BandOp};
pub use colormap::{colorize, Color, ColormapRegistry, Gradient};
pub use flat::{write_flat, FlatBinaryReader, FlatHeader};
pub use interpolation::{bilinear_interpolate, nearest_interpolate, ResampleMethod};
pub use projection::{Geographic, Projection, ProjectionRegistry, WebMercator};
pub use reader::{format_for_path, RasterReader, ReaderRegistry};
pub use reproject::{reproject, SourceGrid, TargetGrid};
