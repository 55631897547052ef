use image::{GrayImage, Luma};
use imageproc::contours::{find_contours, BorderType};
use imageproc::geometry::approximate_polygon_dp;

use crate::geometry::{BBox, Polygon};

/// Epsilon for contour simplification; only drops collinear boundary pixels.
const CONTOUR_EPSILON: f64 = 0.01;

/// Binary mask with row-major storage. Any non-zero byte is foreground.
#[derive(Debug, Clone)]
pub struct Mask {
    pub width: u32,
    pub height: u32,
    pub stride: u32,
    pub buf: Vec<u8>,
}

impl Mask {
    /// Create an empty mask.
    pub fn new(width: u32, height: u32) -> Self {
        let stride = width;
        let buf = vec![0u8; stride as usize * height as usize];
        Self { width, height, stride, buf }
    }

    /// Create a mask from existing row-major data.
    ///
    /// Returns `None` unless `stride >= width` and `buf` holds `stride * height` bytes.
    pub fn from_buf(width: u32, height: u32, stride: u32, buf: Vec<u8>) -> Option<Self> {
        let needed = (stride as usize).checked_mul(height as usize)?;
        if stride < width || buf.len() < needed {
            return None;
        }
        Some(Self { width, height, stride, buf })
    }

    #[inline]
    fn index(&self, x: u32, y: u32) -> usize {
        y as usize * self.stride as usize + x as usize
    }

    /// Transpose column-major data (COCO / Fortran order) into a mask.
    pub fn from_column_major(width: u32, height: u32, data: &[u8]) -> Option<Self> {
        let (w, h) = (width as usize, height as usize);
        if w.checked_mul(h) != Some(data.len()) {
            return None;
        }
        let mut mask = Self::new(width, height);
        for x in 0..w {
            for y in 0..h {
                mask.buf[y * w + x] = data[x * h + y];
            }
        }
        Some(mask)
    }

    #[inline]
    pub fn get(&self, x: u32, y: u32) -> bool {
        self.buf[self.index(x, y)] != 0
    }

    #[inline]
    pub fn set(&mut self, x: u32, y: u32, on: bool) {
        let i = self.index(x, y);
        self.buf[i] = on as u8;
    }

    /// Number of foreground pixels.
    pub fn area(&self) -> u64 {
        (0..self.height)
            .map(|y| {
                let row = self.index(0, y);
                self.buf[row..row + self.width as usize]
                    .iter()
                    .filter(|&&v| v != 0)
                    .count() as u64
            })
            .sum()
    }

    /// Pixel extent of the foreground as `[x1, x2] × [y1, y2]` with exclusive
    /// right/bottom edges (COCO convention: `w = x2 - x1`).
    pub fn bbox(&self) -> Option<BBox> {
        let mut extent: Option<(u32, u32, u32, u32)> = None;
        for y in 0..self.height {
            for x in 0..self.width {
                if !self.get(x, y) {
                    continue;
                }
                extent = Some(match extent {
                    None => (x, y, x, y),
                    Some((x1, y1, x2, y2)) => (x1.min(x), y1.min(y), x2.max(x), y2.max(y)),
                });
            }
        }
        extent.map(|(x1, y1, x2, y2)| {
            BBox::new(x1 as f64, y1 as f64, (x2 + 1) as f64, (y2 + 1) as f64)
        })
    }

    pub fn to_gray_image(&self) -> GrayImage {
        GrayImage::from_fn(self.width, self.height, |x, y| {
            Luma([if self.get(x, y) { 255 } else { 0 }])
        })
    }

    /// Largest outer contour of the foreground as a polygon.
    ///
    /// Returns `None` when no contour encloses a non-degenerate area.
    pub fn largest_contour(&self) -> Option<Polygon> {
        let gray = self.to_gray_image();
        find_contours::<i32>(&gray)
            .into_iter()
            .filter(|c| c.border_type == BorderType::Outer && c.points.len() >= 3)
            .filter_map(|c| {
                let simplified = approximate_polygon_dp(&c.points, CONTOUR_EPSILON, true);
                let points = simplified
                    .iter()
                    .map(|p| [p.x as f64, p.y as f64])
                    .collect();
                Polygon::new(points).ok()
            })
            .map(|poly| (poly.area(), poly))
            .filter(|(area, _)| *area > 0.0)
            .max_by(|a, b| a.0.total_cmp(&b.0))
            .map(|(_, poly)| poly)
    }
}
