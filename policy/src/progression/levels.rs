//! Level thresholds: static table mapping cumulative points to levels

use serde::Serialize;

/// One row of the level table
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct LevelThreshold {
    /// Level number (1-indexed)
    pub level: u32,
    /// Minimum cumulative points required to hold this level
    pub points: u64,
    /// Display name
    pub name: &'static str,
    /// Display color (hex)
    pub color: &'static str,
}

/// The level ladder, strictly increasing in both level and points
pub const LEVEL_THRESHOLDS: &[LevelThreshold] = &[
    LevelThreshold {
        level: 1,
        points: 0,
        name: "Seeker of Knowledge",
        color: "#8bc34a",
    },
    LevelThreshold {
        level: 2,
        points: 1_000,
        name: "First Steps in Jannah",
        color: "#4caf50",
    },
    LevelThreshold {
        level: 3,
        points: 5_000,
        name: "Devoted Reciter",
        color: "#2196f3",
    },
    LevelThreshold {
        level: 4,
        points: 10_000,
        name: "Quran Guardian",
        color: "#9c27b0",
    },
    LevelThreshold {
        level: 5,
        points: 25_000,
        name: "Hafiz Aspirant",
        color: "#ff9800",
    },
    LevelThreshold {
        level: 6,
        points: 50_000,
        name: "Master Reciter",
        color: "#f44336",
    },
    LevelThreshold {
        level: 7,
        points: 100_000,
        name: "Quran Champion",
        color: "#ffd700",
    },
];

/// Lowest level a user can hold
pub const MIN_LEVEL: u32 = 1;

impl LevelThreshold {
    /// Look up the table row for a level; unknown levels fall back to level 1
    pub fn for_level(level: u32) -> &'static LevelThreshold {
        LEVEL_THRESHOLDS
            .iter()
            .find(|t| t.level == level)
            .unwrap_or(&LEVEL_THRESHOLDS[0])
    }

    /// The highest level in the table
    pub fn max_level() -> u32 {
        LEVEL_THRESHOLDS
            .last()
            .map(|t| t.level)
            .unwrap_or(MIN_LEVEL)
    }
}

/// Highest level whose threshold is at or below `points`
pub fn level_for_points(points: u64) -> u32 {
    LEVEL_THRESHOLDS
        .iter()
        .rev()
        .find(|t| points >= t.points)
        .map(|t| t.level)
        .unwrap_or(MIN_LEVEL)
}

/// Points threshold of the level after `level`.
///
/// At the top level this is the top threshold itself.
pub fn next_level_threshold(level: u32) -> u64 {
    LEVEL_THRESHOLDS
        .iter()
        .find(|t| t.level > level)
        .or_else(|| LEVEL_THRESHOLDS.last())
        .map(|t| t.points)
        .unwrap_or(0)
}

/// Points still needed to reach the next level (0 at the top level)
pub fn points_to_next_level(total_points: u64, level: u32) -> u64 {
    next_level_threshold(level).saturating_sub(total_points)
}

/// Progress through the current level as a percentage in [0, 100]
pub fn progress_percentage(total_points: u64, level: u32) -> f64 {
    let current = LevelThreshold::for_level(level).points;
    let next = next_level_threshold(level);
    if next <= current {
        return 100.0;
    }
    let into_level = total_points.saturating_sub(current) as f64;
    let span = (next - current) as f64;
    (into_level / span * 100.0).clamp(0.0, 100.0)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_thresholds_strictly_increasing() {
        for pair in LEVEL_THRESHOLDS.windows(2) {
            assert!(pair[1].level > pair[0].level, "{:?}", pair);
            assert!(pair[1].points > pair[0].points, "{:?}", pair);
        }
        assert_eq!(LEVEL_THRESHOLDS[0].points, 0);
    }

    #[test]
    fn test_level_for_points_boundaries() {
        assert_eq!(level_for_points(0), 1);
        assert_eq!(level_for_points(999), 1);
        assert_eq!(level_for_points(1_000), 2);
        assert_eq!(level_for_points(4_999), 2);
        assert_eq!(level_for_points(5_000), 3);
        assert_eq!(level_for_points(100_000), 7);
        assert_eq!(level_for_points(u64::MAX), 7);
    }

    #[test]
    fn test_level_derivation_is_idempotent() {
        for points in [0, 1, 999, 1_000, 12_345, 60_000, 250_000] {
            let once = level_for_points(points);
            let twice = level_for_points(points);
            assert_eq!(once, twice);
            let expected = LEVEL_THRESHOLDS
                .iter()
                .filter(|t| t.points <= points)
                .map(|t| t.level)
                .max()
                .unwrap();
            assert_eq!(once, expected);
        }
    }

    #[test]
    fn test_points_to_next_level() {
        assert_eq!(points_to_next_level(0, 1), 1_000);
        assert_eq!(points_to_next_level(1_500, 2), 3_500);
        assert_eq!(points_to_next_level(150_000, 7), 0);
    }

    #[test]
    fn test_progress_percentage() {
        assert_eq!(progress_percentage(0, 1), 0.0);
        assert_eq!(progress_percentage(500, 1), 50.0);
        assert_eq!(progress_percentage(3_000, 2), 50.0);
        assert_eq!(progress_percentage(120_000, 7), 100.0);
    }

    #[test]
    fn test_for_level_fallback() {
        assert_eq!(LevelThreshold::for_level(3).name, "Devoted Reciter");
        assert_eq!(LevelThreshold::for_level(42).level, 1);
        assert_eq!(LevelThreshold::max_level(), 7);
    }
}
