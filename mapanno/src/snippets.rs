//! Upright line snippets cut from text-spotting annotations, the input of
//! handwritten text recognition.
//!
//! Each text polygon is enclosed in its minimum-area rectangle. The image is
//! rotated about the rectangle's centre until the long side is horizontal
//! and the rectangle is cropped out.

use std::f64::consts::{FRAC_PI_2, PI};

use image::{imageops, Rgb, RgbImage};
use imageproc::geometric_transformations::{rotate, Interpolation};
use imageproc::geometry::min_area_rect;
use imageproc::point::Point as PixelPoint;
use log::debug;

use crate::annotation::AnnotationPage;
use crate::geometry::{Point, Polygon};

/// Shortest long side a snippet may have, in pixels.
pub const MIN_SNIPPET_WIDTH: f64 = 35.0;
/// Shortest short side a snippet may have, in pixels.
pub const MIN_SNIPPET_HEIGHT: f64 = 25.0;

/// Rectangle of least area around a polygon, described by its long side.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct RotatedRect {
    pub center: Point,
    /// Length of the long side.
    pub width: f64,
    /// Length of the short side.
    pub height: f64,
    /// Direction of the long side in radians, in `(-π/2, π/2]`.
    pub angle: f64,
}

impl RotatedRect {
    /// Enclose the polygon's vertices, truncated to whole pixels.
    pub fn enclosing(polygon: &Polygon) -> Self {
        let pixels: Vec<PixelPoint<i32>> = polygon
            .points()
            .iter()
            .map(|p| PixelPoint::new(p[0] as i32, p[1] as i32))
            .collect();
        let corners = min_area_rect(&pixels).map(|c| [c.x as f64, c.y as f64]);

        let e0 = [corners[1][0] - corners[0][0], corners[1][1] - corners[0][1]];
        let e1 = [corners[2][0] - corners[1][0], corners[2][1] - corners[1][1]];
        let (l0, l1) = (e0[0].hypot(e0[1]), e1[0].hypot(e1[1]));
        let (width, height, long) = if l0 >= l1 { (l0, l1, e0) } else { (l1, l0, e1) };

        let mut angle = long[1].atan2(long[0]);
        if angle > FRAC_PI_2 {
            angle -= PI;
        } else if angle <= -FRAC_PI_2 {
            angle += PI;
        }

        let center = [
            corners.iter().map(|c| c[0]).sum::<f64>() / 4.0,
            corners.iter().map(|c| c[1]).sum::<f64>() / 4.0,
        ];
        Self {
            center,
            width,
            height,
            angle,
        }
    }

    pub fn is_readable(&self) -> bool {
        self.width >= MIN_SNIPPET_WIDTH && self.height >= MIN_SNIPPET_HEIGHT
    }

    /// Cut the rectangle out of `image`, rotated so its long side runs left
    /// to right. Pixels outside the image come out black.
    pub fn cut(&self, image: &RgbImage) -> Option<RgbImage> {
        let [cx, cy] = self.center;
        let reach = (self.width.hypot(self.height) / 2.0).ceil() + 1.0;
        let x0 = (cx - reach).floor().max(0.0) as u32;
        let y0 = (cy - reach).floor().max(0.0) as u32;
        let x1 = ((cx + reach).ceil().max(0.0) as u32).min(image.width());
        let y1 = ((cy + reach).ceil().max(0.0) as u32).min(image.height());
        if x1 <= x0 || y1 <= y0 {
            return None;
        }

        // Rotate only the neighbourhood of the rectangle, not the whole map.
        let local = imageops::crop_imm(image, x0, y0, x1 - x0, y1 - y0).to_image();
        let (lx, ly) = (cx - x0 as f64, cy - y0 as f64);
        let upright = rotate(
            &local,
            (lx as f32, ly as f32),
            -self.angle as f32,
            Interpolation::Bilinear,
            Rgb([0, 0, 0]),
        );

        let sx = (lx - self.width / 2.0).round().max(0.0) as u32;
        let sy = (ly - self.height / 2.0).round().max(0.0) as u32;
        let (sw, sh) = (self.width.round() as u32, self.height.round() as u32);
        let snippet = imageops::crop_imm(&upright, sx, sy, sw, sh).to_image();
        (snippet.width() > 0 && snippet.height() > 0).then_some(snippet)
    }
}

/// A cut-out line, named after the annotation it came from.
#[derive(Debug, Clone)]
pub struct Snippet {
    pub id: String,
    pub image: RgbImage,
}

#[derive(Debug, Clone, Default)]
pub struct SnippetRun {
    pub snippets: Vec<Snippet>,
    /// Annotations whose rectangle is below the minimum size.
    pub too_small: usize,
    /// Annotations whose selector holds no usable polygon.
    pub malformed: usize,
}

/// Cut a snippet for every annotation on the page, in page order.
pub fn extract_snippets(image: &RgbImage, page: &AnnotationPage) -> SnippetRun {
    let mut run = SnippetRun::default();
    for annotation in &page.items {
        let polygon = match annotation.polygon() {
            Ok(polygon) => polygon,
            Err(e) => {
                debug!("{}: no snippet, {e}", annotation.id);
                run.malformed += 1;
                continue;
            }
        };
        let rect = RotatedRect::enclosing(&polygon);
        if !rect.is_readable() {
            run.too_small += 1;
            continue;
        }
        match rect.cut(image) {
            Some(cut) => run.snippets.push(Snippet {
                id: annotation.id.clone(),
                image: cut,
            }),
            None => {
                debug!("{}: rectangle lies outside the image", annotation.id);
                run.too_small += 1;
            }
        }
    }
    run
}
