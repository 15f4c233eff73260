//! Fixtures shared by the SIFT workspace test suites: value generators,
//! grid specs, temp workspaces and float assertions.
//!
//! ```ignore
//! use test_utils::{grid, raster, TempWorkspace};
//! ```

pub mod fixtures;
pub mod generators;

pub use fixtures::*;
pub use generators::*;

use std::future::Future;
use std::time::Duration;

/// Await `fut`, panicking after `limit`.
pub async fn within<F: Future>(limit: Duration, fut: F) -> F::Output {
    match tokio::time::timeout(limit, fut).await {
        Ok(out) => out,
        Err(_) => panic!("operation did not complete within {:?}", limit),
    }
}

/// `|left - right| <= epsilon`, compared as f64.
#[macro_export]
macro_rules! assert_approx_eq {
    ($left:expr, $right:expr, $epsilon:expr) => {{
        let left: f64 = $left as f64;
        let right: f64 = $right as f64;
        let epsilon: f64 = $epsilon as f64;
        let diff = (left - right).abs();
        if diff > epsilon {
            panic!(
                "assertion failed: {:?} vs {:?} differ by {:?} (epsilon {:?})",
                left, right, diff, epsilon
            );
        }
    }};
}

/// Element-wise approximate equality of two float slices. NaN matches NaN.
#[macro_export]
macro_rules! assert_slice_approx_eq {
    ($left:expr, $right:expr, $epsilon:expr) => {{
        let left = &$left;
        let right = &$right;
        assert_eq!(left.len(), right.len(), "slice lengths differ");
        for (i, (l, r)) in left.iter().zip(right.iter()).enumerate() {
            let (l, r) = (*l as f64, *r as f64);
            if l.is_nan() && r.is_nan() {
                continue;
            }
            if (l - r).abs() > $epsilon as f64 {
                panic!(
                    "assertion failed at index {}: `{:?}` vs `{:?}` (epsilon {:?})",
                    i, l, r, $epsilon
                );
            }
        }
    }};
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_assert_approx_eq_within_epsilon() {
        assert_approx_eq!(0.1f32 + 0.2f32, 0.3, 1e-6);
        assert_approx_eq!(-5.5, -5.500001, 0.0001);
    }

    #[test]
    #[should_panic(expected = "assertion failed")]
    fn test_assert_approx_eq_outside_epsilon() {
        assert_approx_eq!(1.1, 1.0, 0.001);
    }

    #[test]
    fn test_assert_slice_approx_eq_nan() {
        assert_slice_approx_eq!(vec![1.0f32, f32::NAN], vec![1.00001f32, f32::NAN], 0.001);
    }

    #[tokio::test]
    async fn test_within_returns_output() {
        let v = within(Duration::from_secs(1), async { 7 }).await;
        assert_eq!(v, 7);
    }
}
