use std::fmt;

use super::adapter::TileDetection;

/// Thresholds for dropping tile-local detections before remapping.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct FilterParams {
    /// Detections whose bbox comes within this many pixels of the tile edge
    /// are treated as truncated.
    pub border_threshold: u32,
    /// Minimum area in pixels.
    pub min_area: f64,
    /// Maximum area as a fraction of the tile area (exclusive).
    pub max_area_fraction: f64,
    pub min_confidence: f32,
    pub min_stability: f32,
}

impl Default for FilterParams {
    fn default() -> Self {
        Self {
            border_threshold: 5,
            min_area: 100.0,
            max_area_fraction: 0.9,
            min_confidence: 0.0,
            min_stability: 0.0,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq)]
pub enum Rejection {
    TouchesBorder,
    TooSmall(f64),
    TooLarge(f64),
    LowConfidence(f32),
    LowStability(f32),
}

impl fmt::Display for Rejection {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Rejection::TouchesBorder => write!(f, "touches tile border"),
            Rejection::TooSmall(a) => write!(f, "area {a} below minimum"),
            Rejection::TooLarge(a) => write!(f, "area {a} above maximum"),
            Rejection::LowConfidence(c) => write!(f, "confidence {c} below minimum"),
            Rejection::LowStability(s) => write!(f, "stability {s} below minimum"),
        }
    }
}

impl FilterParams {
    /// Decide whether a detection on a `width × height` tile survives.
    pub fn check(&self, det: &TileDetection, width: u32, height: u32) -> Result<(), Rejection> {
        let b = self.border_threshold as f64;
        let (w, h) = (width as f64, height as f64);
        let bbox = &det.bbox;

        if bbox.x1 <= b || bbox.y1 <= b || bbox.x2 >= w - b || bbox.y2 >= h - b {
            return Err(Rejection::TouchesBorder);
        }
        if det.area < self.min_area {
            return Err(Rejection::TooSmall(det.area));
        }
        if det.area >= self.max_area_fraction * w * h {
            return Err(Rejection::TooLarge(det.area));
        }
        if det.confidence < self.min_confidence {
            return Err(Rejection::LowConfidence(det.confidence));
        }
        if det.stability < self.min_stability {
            return Err(Rejection::LowStability(det.stability));
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::geometry::{BBox, Polygon};

    fn det(x1: f64, y1: f64, x2: f64, y2: f64, area: f64) -> TileDetection {
        let polygon = Polygon::new(vec![[x1, y1], [x2, y1], [x2, y2], [x1, y2]]).unwrap();
        TileDetection {
            polygon,
            bbox: BBox::new(x1, y1, x2, y2),
            area,
            confidence: 1.0,
            stability: 1.0,
            point_coords: Vec::new(),
            text: None,
        }
    }

    #[test]
    fn touching_edge_is_dropped() {
        let p = FilterParams::default();
        assert_eq!(p.check(&det(0.0, 50.0, 40.0, 90.0, 1600.0), 200, 200), Err(Rejection::TouchesBorder));
        assert_eq!(p.check(&det(50.0, 50.0, 200.0, 90.0, 6000.0), 200, 200), Err(Rejection::TouchesBorder));
    }

    #[test]
    fn border_threshold_is_inclusive() {
        let p = FilterParams::default();
        assert_eq!(p.check(&det(5.0, 50.0, 40.0, 90.0, 1400.0), 200, 200), Err(Rejection::TouchesBorder));
        assert_eq!(p.check(&det(50.0, 50.0, 195.0, 90.0, 5800.0), 200, 200), Err(Rejection::TouchesBorder));
    }

    #[test]
    fn six_pixels_inside_is_kept() {
        let p = FilterParams::default();
        assert_eq!(p.check(&det(6.0, 6.0, 194.0, 194.0, 1000.0), 200, 200), Ok(()));
    }

    #[test]
    fn confidence_does_not_rescue_border_detections() {
        let p = FilterParams::default();
        let mut d = det(0.0, 10.0, 50.0, 50.0, 2000.0);
        d.confidence = 1.0;
        d.stability = 1.0;
        assert_eq!(p.check(&d, 200, 200), Err(Rejection::TouchesBorder));
    }

    #[test]
    fn area_bounds() {
        let p = FilterParams::default();
        assert_eq!(p.check(&det(10.0, 10.0, 19.0, 19.0, 81.0), 200, 200), Err(Rejection::TooSmall(81.0)));
        assert_eq!(p.check(&det(10.0, 10.0, 20.0, 20.0, 100.0), 200, 200), Ok(()));
        // 0.9 * 200 * 200 = 36000
        assert_eq!(p.check(&det(10.0, 10.0, 190.0, 190.0, 36000.0), 200, 200), Err(Rejection::TooLarge(36000.0)));
        assert_eq!(p.check(&det(10.0, 10.0, 190.0, 190.0, 35999.0), 200, 200), Ok(()));
    }

    #[test]
    fn score_floors() {
        let p = FilterParams {
            min_confidence: 0.8,
            min_stability: 0.9,
            ..FilterParams::default()
        };
        let mut d = det(10.0, 10.0, 30.0, 30.0, 400.0);
        d.confidence = 0.5;
        assert_eq!(p.check(&d, 200, 200), Err(Rejection::LowConfidence(0.5)));
        d.confidence = 0.85;
        d.stability = 0.7;
        assert_eq!(p.check(&d, 200, 200), Err(Rejection::LowStability(0.7)));
        d.stability = 0.95;
        assert_eq!(p.check(&d, 200, 200), Ok(()));
    }
}
