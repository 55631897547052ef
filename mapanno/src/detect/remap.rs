use crate::error::GeometryError;
use crate::geometry::{BBox, Point, Polygon};

/// Maps tile-local pixels back to the original image.
///
/// `orig = trunc((local + offset) / scale)`, where `offset` is the tile's
/// position in the resized level and `scale` is resized/original.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct TileTransform {
    pub offset: (u32, u32),
    pub scale: f64,
}

impl TileTransform {
    pub fn new(offset: (u32, u32), scale: f64) -> Self {
        Self { offset, scale }
    }

    #[inline]
    pub fn point(&self, p: Point) -> Point {
        [
            ((p[0] + self.offset.0 as f64) / self.scale).trunc(),
            ((p[1] + self.offset.1 as f64) / self.scale).trunc(),
        ]
    }

    pub fn points(&self, points: &[Point]) -> Vec<Point> {
        points.iter().map(|&p| self.point(p)).collect()
    }

    /// Remap every vertex. Truncation can merge neighbouring vertices, so a
    /// tiny polygon may collapse and fail.
    pub fn polygon(&self, polygon: &Polygon) -> Result<Polygon, GeometryError> {
        Polygon::new(self.points(polygon.points()))
    }

    pub fn bbox(&self, b: &BBox) -> BBox {
        let [x1, y1] = self.point([b.x1, b.y1]);
        let [x2, y2] = self.point([b.x2, b.y2]);
        BBox::new(x1, y1, x2, y2)
    }

    /// Extent of a `width × height` tile in original pixels, as
    /// `(x, y, width, height)`.
    pub fn region(&self, width: u32, height: u32) -> (u32, u32, u32, u32) {
        let inv = 1.0 / self.scale;
        (
            (self.offset.0 as f64 * inv) as u32,
            (self.offset.1 as f64 * inv) as u32,
            (width as f64 * inv) as u32,
            (height as f64 * inv) as u32,
        )
    }
}
