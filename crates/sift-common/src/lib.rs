//! Common types shared across the SIFT workspace cache crates.

pub mod bbox;
pub mod error;
pub mod geo;
pub mod key;
pub mod raster;
pub mod source;
pub mod tile;

pub use bbox::{BboxParseError, BoundingBox};
pub use error::{Result, SiftError};
pub use geo::{GeoTransform, PixelWindow};
pub use key::{CacheKey, KeyBuilder};
pub use raster::{is_nodata, DataType, RasterArray, RasterData, RasterShape};
pub use source::{RasterInfo, SourceDescriptor, SourceSignature};
pub use tile::{TileCoord, TileGrid};
