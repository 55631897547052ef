use image::RgbImage;

use crate::error::DetectError;
use crate::geometry::{BBox, Point, Polygon};
use crate::mask::Mask;

/// Shape reported by a detector, in tile-local pixels.
#[derive(Debug, Clone)]
pub enum RawShape {
    /// Segmentation output; traced to a polygon during normalization.
    Mask(Mask),
    /// Text-spotting style output.
    Polygon(Vec<Point>),
}

/// Unprocessed output of a detector for one tile.
#[derive(Debug, Clone)]
pub struct RawDetection {
    pub shape: RawShape,
    pub confidence: f32,
    pub stability: f32,
    pub bbox: Option<BBox>,
    pub point_coords: Vec<Point>,
    pub text: Option<String>,
}

impl RawDetection {
    pub fn from_polygon(points: Vec<Point>, confidence: f32) -> Self {
        Self {
            shape: RawShape::Polygon(points),
            confidence,
            stability: 1.0,
            bbox: None,
            point_coords: Vec::new(),
            text: None,
        }
    }

    pub fn from_mask(mask: Mask, confidence: f32, stability: f32) -> Self {
        Self {
            shape: RawShape::Mask(mask),
            confidence,
            stability,
            bbox: None,
            point_coords: Vec::new(),
            text: None,
        }
    }
}

/// A detection after normalization, still in tile-local pixels.
#[derive(Debug, Clone)]
pub struct TileDetection {
    pub polygon: Polygon,
    pub bbox: BBox,
    /// Pixel area: mask pixel count, or polygon area for polygon output.
    pub area: f64,
    pub confidence: f32,
    pub stability: f32,
    pub point_coords: Vec<Point>,
    pub text: Option<String>,
}

/// A segmentation or text-spotting model run on a single tile.
///
/// Implementations must not mutate shared state; the pipeline may call
/// `detect` from several threads when built with the `parallel` feature.
pub trait Detector: Sync {
    /// Identifier credited as the annotation generator.
    fn name(&self) -> &str;

    fn detect(&self, tile: &RgbImage) -> Result<Vec<RawDetection>, DetectError>;
}

impl<D: Detector + ?Sized> Detector for &D {
    fn name(&self) -> &str {
        (**self).name()
    }

    fn detect(&self, tile: &RgbImage) -> Result<Vec<RawDetection>, DetectError> {
        (**self).detect(tile)
    }
}

impl<D: Detector + ?Sized> Detector for Box<D> {
    fn name(&self) -> &str {
        (**self).name()
    }

    fn detect(&self, tile: &RgbImage) -> Result<Vec<RawDetection>, DetectError> {
        (**self).detect(tile)
    }
}

/// Turn a raw detection into a polygon with area and extent.
pub fn normalize(raw: RawDetection) -> Result<TileDetection, DetectError> {
    if !raw.confidence.is_finite() || !raw.stability.is_finite() {
        return Err(DetectError::Malformed("non-finite score".into()));
    }
    if raw.point_coords.iter().flatten().any(|v| !v.is_finite()) {
        return Err(DetectError::Malformed("non-finite point coordinate".into()));
    }

    let (polygon, area, extent) = match raw.shape {
        RawShape::Mask(mask) => {
            let area = mask.area();
            if area == 0 {
                return Err(DetectError::Malformed("empty mask".into()));
            }
            let polygon = mask
                .largest_contour()
                .ok_or_else(|| DetectError::Malformed("mask has no traceable contour".into()))?;
            (polygon, area as f64, mask.bbox())
        }
        RawShape::Polygon(points) => {
            let polygon = Polygon::new(points)?;
            let area = polygon.area();
            (polygon, area, None)
        }
    };

    let bbox = raw
        .bbox
        .or(extent)
        .unwrap_or_else(|| polygon.bbox());

    Ok(TileDetection {
        polygon,
        bbox,
        area,
        confidence: raw.confidence,
        stability: raw.stability,
        point_coords: raw.point_coords,
        text: raw.text,
    })
}

/// Run the detector on one tile and normalize everything it returns.
///
/// Any malformed record fails the whole tile.
pub fn detect_tile<D: Detector + ?Sized>(
    detector: &D,
    tile: &RgbImage,
) -> Result<Vec<TileDetection>, DetectError> {
    detector
        .detect(tile)?
        .into_iter()
        .map(normalize)
        .collect()
}
