// Mouth shape helpers for presenters

use serde::{Deserialize, Serialize};

/// Coarse mouth shape for 2D presenters, bucketed in steps of 5/30 openness
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum MouthShape {
    Closed,
    SlightlyOpen,
    Open,
    WideOpen,
    VeryWideOpen,
}

impl MouthShape {
    pub fn from_openness(openness: f32) -> Self {
        let pixels = openness.clamp(0.0, 1.0) * 30.0;
        if pixels < 5.0 {
            MouthShape::Closed
        } else if pixels < 10.0 {
            MouthShape::SlightlyOpen
        } else if pixels < 15.0 {
            MouthShape::Open
        } else if pixels < 20.0 {
            MouthShape::WideOpen
        } else {
            MouthShape::VeryWideOpen
        }
    }
}

/// Which of `count` pre-rendered mouth frames to show for `openness`
pub fn sprite_index(openness: f32, count: usize) -> usize {
    if count == 0 {
        return 0;
    }
    let index = (openness.clamp(0.0, 1.0) * count as f32) as usize;
    index.min(count - 1)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_shape_buckets() {
        assert_eq!(MouthShape::from_openness(0.0), MouthShape::Closed);
        assert_eq!(MouthShape::from_openness(4.0 / 30.0), MouthShape::Closed);
        assert_eq!(MouthShape::from_openness(0.2), MouthShape::SlightlyOpen);
        assert_eq!(MouthShape::from_openness(0.4), MouthShape::Open);
        assert_eq!(MouthShape::from_openness(0.6), MouthShape::WideOpen);
        assert_eq!(MouthShape::from_openness(1.0), MouthShape::VeryWideOpen);
        assert_eq!(MouthShape::from_openness(7.0), MouthShape::VeryWideOpen);
    }

    #[test]
    fn test_sprite_index() {
        assert_eq!(sprite_index(0.0, 8), 0);
        assert_eq!(sprite_index(0.5, 8), 4);
        assert_eq!(sprite_index(1.0, 8), 7);
        assert_eq!(sprite_index(0.3, 0), 0);
    }
}
