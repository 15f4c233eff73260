//! Choosing a pyramid level for a requested pixel size.

use serde::{Deserialize, Serialize};

/// Relative slack when comparing pixel sizes, so 2.0000000001 counts as 2.
const SIZE_TOLERANCE: f64 = 1e-9;

/// How a requested pixel size maps onto the available levels.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, Default)]
#[serde(rename_all = "snake_case")]
pub enum LevelPolicy {
    /// Finest level whose pixels are at least as large as requested.
    /// Never reads more detail than the viewport can show.
    #[default]
    FinestNotFinerThan,
    /// Coarsest level whose pixels are no larger than requested.
    /// Never shows less detail than the viewport could.
    CoarsestNotExceeding,
    /// Level closest to the request on a log scale; ties go to the finer level.
    Nearest,
}

impl LevelPolicy {
    pub fn as_str(&self) -> &'static str {
        match self {
            LevelPolicy::FinestNotFinerThan => "finest_not_finer_than",
            LevelPolicy::CoarsestNotExceeding => "coarsest_not_exceeding",
            LevelPolicy::Nearest => "nearest",
        }
    }
}

impl std::str::FromStr for LevelPolicy {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_lowercase().replace('-', "_").as_str() {
            "finest_not_finer_than" => Ok(LevelPolicy::FinestNotFinerThan),
            "coarsest_not_exceeding" => Ok(LevelPolicy::CoarsestNotExceeding),
            "nearest" => Ok(LevelPolicy::Nearest),
            other => Err(format!("unknown level policy '{}'", other)),
        }
    }
}

/// Pick a level from `pixel_sizes` (finest first, one per level).
///
/// Requests finer than level 0 get level 0; requests coarser than the last
/// level get the last level.
pub fn select_level(pixel_sizes: &[f64], requested: f64, policy: LevelPolicy) -> u32 {
    if pixel_sizes.is_empty() || requested.is_nan() || requested <= 0.0 {
        return 0;
    }
    let last = pixel_sizes.len() - 1;
    let at_least = |size: f64| size >= requested * (1.0 - SIZE_TOLERANCE);
    let at_most = |size: f64| size <= requested * (1.0 + SIZE_TOLERANCE);

    let level = match policy {
        LevelPolicy::FinestNotFinerThan => pixel_sizes
            .iter()
            .position(|&s| at_least(s))
            .unwrap_or(last),
        LevelPolicy::CoarsestNotExceeding => pixel_sizes
            .iter()
            .rposition(|&s| at_most(s))
            .unwrap_or(0),
        LevelPolicy::Nearest => {
            let target = requested.log2();
            let mut best = 0;
            let mut best_distance = f64::INFINITY;
            for (level, &size) in pixel_sizes.iter().enumerate() {
                let distance = (size.log2() - target).abs();
                if distance + SIZE_TOLERANCE < best_distance {
                    best = level;
                    best_distance = distance;
                }
            }
            best
        }
    };
    level as u32
}

#[cfg(test)]
mod tests {
    use super::*;

    const SIZES: [f64; 4] = [1.0, 2.0, 4.0, 8.0];

    #[test]
    fn test_default_policy_picks_level_two_at_three_meters() {
        assert_eq!(select_level(&SIZES, 3.0, LevelPolicy::default()), 2);
    }

    #[test]
    fn test_finest_not_finer_than() {
        let p = LevelPolicy::FinestNotFinerThan;
        assert_eq!(select_level(&SIZES, 0.5, p), 0);
        assert_eq!(select_level(&SIZES, 1.0, p), 0);
        assert_eq!(select_level(&SIZES, 2.0, p), 1);
        assert_eq!(select_level(&SIZES, 2.0000001, p), 2);
        assert_eq!(select_level(&SIZES, 100.0, p), 3);
    }

    #[test]
    fn test_coarsest_not_exceeding() {
        let p = LevelPolicy::CoarsestNotExceeding;
        assert_eq!(select_level(&SIZES, 3.0, p), 1);
        assert_eq!(select_level(&SIZES, 4.0, p), 2);
        assert_eq!(select_level(&SIZES, 0.5, p), 0);
        assert_eq!(select_level(&SIZES, 100.0, p), 3);
    }

    #[test]
    fn test_nearest() {
        let p = LevelPolicy::Nearest;
        assert_eq!(select_level(&SIZES, 3.0, p), 2);
        assert_eq!(select_level(&SIZES, 2.5, p), 1);
        // log2(2.828) sits exactly between 2 and 4.
        assert_eq!(select_level(&SIZES, 8.0_f64.sqrt(), p), 1);
    }

    #[test]
    fn test_degenerate_inputs() {
        assert_eq!(select_level(&[], 3.0, LevelPolicy::default()), 0);
        assert_eq!(select_level(&SIZES, 0.0, LevelPolicy::default()), 0);
        assert_eq!(select_level(&SIZES, f64::NAN, LevelPolicy::default()), 0);
    }

    #[test]
    fn test_policy_parse() {
        assert_eq!("nearest".parse::<LevelPolicy>().unwrap(), LevelPolicy::Nearest);
        assert_eq!(
            "coarsest-not-exceeding".parse::<LevelPolicy>().unwrap(),
            LevelPolicy::CoarsestNotExceeding
        );
        assert!("finest".parse::<LevelPolicy>().is_err());
    }
}
