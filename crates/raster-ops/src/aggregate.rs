//! Block aggregation for generating pyramid levels.
//!
//! Each output cell summarizes a `factor x factor` block of the input. Output
//! dimensions round up, so the last row/column of blocks may be partial and
//! aggregates only the cells it actually contains.

use rayon::prelude::*;
use serde::{Deserialize, Serialize};
use sift_common::is_nodata;
use std::fmt;
use std::str::FromStr;

/// Function used to summarize a block.
///
/// - **Mean**: continuous quantities (reflectance, temperature)
/// - **Max**: peak-preserving products (reflectivity, precipitation rate)
/// - **Nearest**: categorical data (masks, classifications)
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, Default)]
#[serde(rename_all = "lowercase")]
pub enum AggregationMethod {
    #[default]
    Mean,
    Max,
    /// First valid cell of the block in row-major order.
    Nearest,
}

impl AggregationMethod {
    pub fn as_str(&self) -> &'static str {
        match self {
            AggregationMethod::Mean => "mean",
            AggregationMethod::Max => "max",
            AggregationMethod::Nearest => "nearest",
        }
    }

    /// Default method for a product name when none is configured.
    pub fn for_product(product: &str) -> Self {
        let upper = product.to_uppercase();

        if upper.contains("REFL") || upper.contains("DBZ") || upper.contains("PRECIP_RATE") {
            return AggregationMethod::Max;
        }

        if upper.contains("MASK") || upper.contains("CLASS") || upper.contains("FLAG") {
            return AggregationMethod::Nearest;
        }

        AggregationMethod::Mean
    }
}

impl fmt::Display for AggregationMethod {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for AggregationMethod {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_lowercase().as_str() {
            "mean" => Ok(AggregationMethod::Mean),
            "max" => Ok(AggregationMethod::Max),
            "nearest" => Ok(AggregationMethod::Nearest),
            other => Err(format!("unknown aggregation method '{}'", other)),
        }
    }
}

/// Reduce a row-major grid by `factor` in both dimensions.
///
/// NaN is always no-data; `nodata` adds a declared sentinel. Blocks with no
/// valid cells produce the sentinel (or NaN when none is declared). No-data
/// never contributes to a result.
///
/// Returns `(data, rows, cols)` of the reduced grid.
pub fn aggregate(
    data: &[f32],
    rows: usize,
    cols: usize,
    factor: usize,
    method: AggregationMethod,
    nodata: Option<f32>,
) -> (Vec<f32>, usize, usize) {
    if factor <= 1 {
        return (data.to_vec(), rows, cols);
    }

    let out_rows = rows.div_ceil(factor);
    let out_cols = cols.div_ceil(factor);
    if out_rows == 0 || out_cols == 0 {
        return (Vec::new(), 0, 0);
    }

    let fill = nodata.unwrap_or(f32::NAN);
    let mut output = vec![fill; out_rows * out_cols];

    output
        .par_chunks_mut(out_cols)
        .enumerate()
        .for_each(|(out_row, out)| {
            let row_start = out_row * factor;
            let row_end = (row_start + factor).min(rows);

            for (out_col, cell) in out.iter_mut().enumerate() {
                let col_start = out_col * factor;
                let col_end = (col_start + factor).min(cols);

                let block = (row_start..row_end).flat_map(|r| {
                    let base = r * cols;
                    data[base + col_start..base + col_end].iter().copied()
                });

                if let Some(v) = reduce_block(block, method, nodata) {
                    *cell = v;
                }
            }
        });

    (output, out_rows, out_cols)
}

/// Summarize the valid values of one block, or `None` if there are none.
#[inline]
fn reduce_block(
    values: impl Iterator<Item = f32>,
    method: AggregationMethod,
    nodata: Option<f32>,
) -> Option<f32> {
    let mut valid = values.filter(|v| !is_nodata(*v, nodata));

    match method {
        AggregationMethod::Nearest => valid.next(),
        AggregationMethod::Max => valid.reduce(f32::max),
        AggregationMethod::Mean => {
            let mut sum = 0.0f64;
            let mut count = 0usize;
            for v in valid {
                sum += v as f64;
                count += 1;
            }
            (count > 0).then(|| (sum / count as f64) as f32)
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn ramp() -> Vec<f32> {
        (1..=16).map(|x| x as f32).collect()
    }

    #[test]
    fn test_aggregate_mean() {
        let (result, rows, cols) = aggregate(&ramp(), 4, 4, 2, AggregationMethod::Mean, None);

        assert_eq!((rows, cols), (2, 2));
        // (1 + 2 + 5 + 6) / 4
        assert!((result[0] - 3.5).abs() < 0.001);
        // (3 + 4 + 7 + 8) / 4
        assert!((result[1] - 5.5).abs() < 0.001);
        assert!((result[2] - 11.5).abs() < 0.001);
        assert!((result[3] - 13.5).abs() < 0.001);
    }

    #[test]
    fn test_aggregate_max() {
        let (result, _, _) = aggregate(&ramp(), 4, 4, 2, AggregationMethod::Max, None);

        // max of 1, 2, 5, 6
        assert_eq!(result[0], 6.0);
        // max of 3, 4, 7, 8
        assert_eq!(result[1], 8.0);
    }

    #[test]
    fn test_aggregate_nearest() {
        let (result, _, _) = aggregate(&ramp(), 4, 4, 2, AggregationMethod::Nearest, None);

        assert_eq!(result[0], 1.0);
        assert_eq!(result[1], 3.0);
    }

    #[test]
    fn test_all_nodata_block_yields_nodata() {
        let mut data = ramp();
        for idx in [0, 1, 4, 5] {
            data[idx] = -9999.0;
        }
        let (result, _, _) = aggregate(&data, 4, 4, 2, AggregationMethod::Mean, Some(-9999.0));

        assert_eq!(result[0], -9999.0);
        assert!((result[1] - 5.5).abs() < 0.001);
    }

    #[test]
    fn test_half_nodata_block_averages_valid_cells() {
        let mut data = ramp();
        data[0] = f32::NAN;
        data[4] = f32::NAN;
        let (result, _, _) = aggregate(&data, 4, 4, 2, AggregationMethod::Mean, None);

        // Valid cells 2 and 6 -> 4.0; no-data is never counted as zero.
        assert!((result[0] - 4.0).abs() < 0.001);
    }

    #[test]
    fn test_nearest_skips_nodata() {
        let mut data = ramp();
        data[0] = f32::NAN;
        let (result, _, _) = aggregate(&data, 4, 4, 2, AggregationMethod::Nearest, None);
        assert_eq!(result[0], 2.0);
    }

    #[test]
    fn test_odd_dimensions_round_up() {
        // 5x3 grid, factor 2 -> 3x2 with partial edge blocks
        let data: Vec<f32> = (0..15).map(|x| x as f32).collect();
        let (result, rows, cols) = aggregate(&data, 5, 3, 2, AggregationMethod::Max, None);

        assert_eq!((rows, cols), (3, 2));
        // Right column block only contains column 2.
        assert_eq!(result[1], 5.0);
        // Bottom row block only contains row 4.
        assert_eq!(result[4], 13.0);
        assert_eq!(result[5], 14.0);
    }

    #[test]
    fn test_factor_one_is_identity() {
        let (result, rows, cols) = aggregate(&ramp(), 4, 4, 1, AggregationMethod::Mean, None);
        assert_eq!((rows, cols), (4, 4));
        assert_eq!(result, ramp());
    }

    #[test]
    fn test_method_for_product() {
        assert_eq!(AggregationMethod::for_product("B04"), AggregationMethod::Mean);
        assert_eq!(AggregationMethod::for_product("REFL_0"), AggregationMethod::Max);
        assert_eq!(AggregationMethod::for_product("cloud_mask"), AggregationMethod::Nearest);
        assert_eq!("MAX".parse::<AggregationMethod>(), Ok(AggregationMethod::Max));
        assert!("median".parse::<AggregationMethod>().is_err());
    }
}
