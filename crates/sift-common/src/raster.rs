//! In-memory raster arrays and element types.

use crate::{Result, SiftError};
use serde::{Deserialize, Serialize};
use std::borrow::Cow;

/// Element type of a stored array.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum DataType {
    Float32,
    Uint8,
}

impl DataType {
    /// Size of one element in bytes.
    pub fn size_of(&self) -> usize {
        match self {
            DataType::Float32 => 4,
            DataType::Uint8 => 1,
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            DataType::Float32 => "float32",
            DataType::Uint8 => "uint8",
        }
    }
}

/// Shape of a stored array: rows x cols x channels, row-major.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct RasterShape {
    pub rows: usize,
    pub cols: usize,
    pub channels: usize,
}

impl RasterShape {
    /// Single-channel shape.
    pub fn new(rows: usize, cols: usize) -> Self {
        Self {
            rows,
            cols,
            channels: 1,
        }
    }

    pub fn with_channels(rows: usize, cols: usize, channels: usize) -> Self {
        Self {
            rows,
            cols,
            channels,
        }
    }

    /// Total number of elements.
    pub fn len(&self) -> usize {
        self.rows * self.cols * self.channels
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Number of bytes for this shape at the given element type.
    pub fn byte_len(&self, dtype: DataType) -> usize {
        self.len() * dtype.size_of()
    }

    /// Shape after reducing linear resolution by `factor`, rounding up so the
    /// reduced raster still covers the full extent.
    pub fn reduced(&self, factor: usize) -> RasterShape {
        let factor = factor.max(1);
        RasterShape {
            rows: self.rows.div_ceil(factor),
            cols: self.cols.div_ceil(factor),
            channels: self.channels,
        }
    }

    /// Shape of pyramid level `level` for this level-0 shape.
    pub fn at_level(&self, factor: usize, level: u32) -> RasterShape {
        (0..level).fold(*self, |shape, _| shape.reduced(factor))
    }
}

/// Owned array payload.
#[derive(Debug, Clone, PartialEq)]
pub enum RasterData {
    Float32(Vec<f32>),
    Uint8(Vec<u8>),
}

/// An owned raster array ready to be written to the cache.
#[derive(Debug, Clone, PartialEq)]
pub struct RasterArray {
    pub shape: RasterShape,
    pub data: RasterData,
}

impl RasterArray {
    /// Single-band float array.
    pub fn from_f32(rows: usize, cols: usize, values: Vec<f32>) -> Result<Self> {
        let shape = RasterShape::new(rows, cols);
        if values.len() != shape.len() {
            return Err(SiftError::build_failure(format!(
                "array of {} values does not match shape {}x{}",
                values.len(),
                rows,
                cols
            )));
        }
        Ok(Self {
            shape,
            data: RasterData::Float32(values),
        })
    }

    /// Interleaved RGBA byte array.
    pub fn from_rgba(rows: usize, cols: usize, pixels: Vec<u8>) -> Result<Self> {
        let shape = RasterShape::with_channels(rows, cols, 4);
        if pixels.len() != shape.len() {
            return Err(SiftError::build_failure(format!(
                "RGBA buffer of {} bytes does not match shape {}x{}x4",
                pixels.len(),
                rows,
                cols
            )));
        }
        Ok(Self {
            shape,
            data: RasterData::Uint8(pixels),
        })
    }

    pub fn dtype(&self) -> DataType {
        match self.data {
            RasterData::Float32(_) => DataType::Float32,
            RasterData::Uint8(_) => DataType::Uint8,
        }
    }

    /// Raw native-endian bytes of the array.
    pub fn as_bytes(&self) -> &[u8] {
        match &self.data {
            RasterData::Float32(values) => bytemuck::cast_slice(values),
            RasterData::Uint8(bytes) => bytes,
        }
    }

    pub fn as_f32(&self) -> Option<&[f32]> {
        match &self.data {
            RasterData::Float32(values) => Some(values),
            RasterData::Uint8(_) => None,
        }
    }

    pub fn byte_len(&self) -> usize {
        self.as_bytes().len()
    }
}

/// True if `value` is a no-data sample: NaN, or equal to the declared sentinel.
#[inline]
pub fn is_nodata(value: f32, sentinel: Option<f32>) -> bool {
    value.is_nan() || sentinel.is_some_and(|s| value == s)
}

/// View raw bytes as `f32`s, borrowing when the slice is suitably aligned.
pub fn f32_view(bytes: &[u8]) -> Cow<'_, [f32]> {
    match bytemuck::try_cast_slice::<u8, f32>(bytes) {
        Ok(values) => Cow::Borrowed(values),
        Err(_) => Cow::Owned(bytemuck::pod_collect_to_vec(bytes)),
    }
}
