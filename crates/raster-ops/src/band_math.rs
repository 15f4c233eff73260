//! Per-pixel algebra across same-shape bands.

use rayon::prelude::*;
use serde::{Deserialize, Serialize};
use sift_common::{is_nodata, Result, SiftError};

/// Band combination applied pixel by pixel.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "op", rename_all = "snake_case")]
pub enum BandOp {
    /// Sum of all inputs.
    Sum,
    /// `a - b`
    Difference,
    /// `a / b`
    Ratio,
    /// `(a - b) / (a + b)`, e.g. NDVI from (NIR, red).
    NormalizedDifference,
    /// `offset + sum(weights[i] * input[i])`
    Linear { weights: Vec<f32>, offset: f32 },
}

impl BandOp {
    pub fn as_str(&self) -> &'static str {
        match self {
            BandOp::Sum => "sum",
            BandOp::Difference => "difference",
            BandOp::Ratio => "ratio",
            BandOp::NormalizedDifference => "normalized_difference",
            BandOp::Linear { .. } => "linear",
        }
    }

    /// Check the operand count.
    pub fn check_arity(&self, inputs: usize) -> Result<()> {
        let ok = match self {
            BandOp::Sum => inputs >= 1,
            BandOp::Difference | BandOp::Ratio | BandOp::NormalizedDifference => inputs == 2,
            BandOp::Linear { weights, .. } => inputs >= 1 && weights.len() == inputs,
        };
        if ok {
            Ok(())
        } else {
            Err(SiftError::build_failure(format!(
                "{} cannot combine {} input(s)",
                self.as_str(),
                inputs
            )))
        }
    }

    #[inline]
    fn apply(&self, values: &[f32]) -> f32 {
        match self {
            BandOp::Sum => values.iter().sum(),
            BandOp::Difference => values[0] - values[1],
            BandOp::Ratio => values[0] / values[1],
            BandOp::NormalizedDifference => {
                (values[0] - values[1]) / (values[0] + values[1])
            }
            BandOp::Linear { weights, offset } => {
                offset + weights.iter().zip(values).map(|(w, v)| w * v).sum::<f32>()
            }
        }
    }
}

/// One operand: values plus its declared no-data sentinel.
#[derive(Debug, Clone, Copy)]
pub struct Band<'a> {
    pub values: &'a [f32],
    pub nodata: Option<f32>,
}

/// Evaluate `op` over `bands`. Any no-data operand yields NaN, and so does
/// any non-finite result (division by zero).
pub fn evaluate(op: &BandOp, bands: &[Band<'_>]) -> Result<Vec<f32>> {
    op.check_arity(bands.len())?;
    let len = bands[0].values.len();
    if let Some(bad) = bands.iter().find(|b| b.values.len() != len) {
        return Err(SiftError::build_failure(format!(
            "band shapes differ: {} vs {} values",
            len,
            bad.values.len()
        )));
    }

    let mut output = vec![f32::NAN; len];
    output.par_iter_mut().enumerate().for_each_init(
        || Vec::with_capacity(bands.len()),
        |operands, (i, out)| {
            operands.clear();
            for band in bands {
                let v = band.values[i];
                if is_nodata(v, band.nodata) {
                    return;
                }
                operands.push(v);
            }
            let result = op.apply(operands);
            if result.is_finite() {
                *out = result;
            }
        },
    );
    Ok(output)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn band(values: &[f32]) -> Band<'_> {
        Band {
            values,
            nodata: None,
        }
    }

    #[test]
    fn test_difference_and_ratio() {
        let a = [4.0, 6.0];
        let b = [2.0, 0.0];
        let diff = evaluate(&BandOp::Difference, &[band(&a), band(&b)]).unwrap();
        assert_eq!(diff, vec![2.0, 6.0]);

        let ratio = evaluate(&BandOp::Ratio, &[band(&a), band(&b)]).unwrap();
        assert_eq!(ratio[0], 2.0);
        assert!(ratio[1].is_nan(), "division by zero is no-data");
    }

    #[test]
    fn test_normalized_difference() {
        let nir = [0.5, 0.0];
        let red = [0.1, 0.0];
        let ndvi = evaluate(&BandOp::NormalizedDifference, &[band(&nir), band(&red)]).unwrap();
        assert!((ndvi[0] - 0.4 / 0.6).abs() < 1e-6);
        assert!(ndvi[1].is_nan());
    }

    #[test]
    fn test_nodata_operand_propagates() {
        let a = [1.0, -9999.0, 3.0];
        let b = [1.0, 1.0, f32::NAN];
        let sum = evaluate(
            &BandOp::Sum,
            &[
                Band {
                    values: &a,
                    nodata: Some(-9999.0),
                },
                band(&b),
            ],
        )
        .unwrap();
        assert_eq!(sum[0], 2.0);
        assert!(sum[1].is_nan());
        assert!(sum[2].is_nan());
    }

    #[test]
    fn test_linear_combination() {
        let a = [1.0, 2.0];
        let b = [10.0, 20.0];
        let op = BandOp::Linear {
            weights: vec![2.0, 0.5],
            offset: 1.0,
        };
        let out = evaluate(&op, &[band(&a), band(&b)]).unwrap();
        assert_eq!(out, vec![8.0, 15.0]);
    }

    #[test]
    fn test_arity_and_shape_checks() {
        let a = [1.0];
        let b = [1.0, 2.0];
        assert!(evaluate(&BandOp::Ratio, &[band(&a)]).is_err());
        assert!(evaluate(&BandOp::Sum, &[band(&a), band(&b)]).is_err());
        let op = BandOp::Linear {
            weights: vec![1.0],
            offset: 0.0,
        };
        assert!(evaluate(&op, &[band(&a), band(&a)]).is_err());
    }

    #[test]
    fn test_serde_tagging() {
        let json = serde_json::to_string(&BandOp::NormalizedDifference).unwrap();
        assert_eq!(json, r#"{"op":"normalized_difference"}"#);
    }
}
