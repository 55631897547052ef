use image::imageops::{self, FilterType};
use image::RgbImage;

use super::remap::TileTransform;
use crate::error::PlanError;

/// Sliding-window configuration.
///
/// Windows of `window_size` advance by `step_size`, so neighbours overlap by
/// `window_size - step_size` pixels. Each scale level shrinks the image by a
/// further `resize_factor` until it fits in a single window.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct TilePlan {
    pub window_size: u32,
    pub step_size: u32,
    pub resize_factor: u32,
}

impl Default for TilePlan {
    fn default() -> Self {
        Self {
            window_size: 1000,
            step_size: 750,
            resize_factor: 2,
        }
    }
}

/// Position of one window, in the pixel space of its scale level.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct TileRegion {
    /// Enumeration order across all levels.
    pub index: usize,
    pub level: usize,
    pub factor: f64,
    pub x: u32,
    pub y: u32,
    pub width: u32,
    pub height: u32,
}

impl TileRegion {
    pub fn transform(&self) -> TileTransform {
        TileTransform::new((self.x, self.y), self.factor)
    }
}

/// A window cut out of one scale level, ready for the detector.
#[derive(Debug, Clone)]
pub struct Tile {
    pub region: TileRegion,
    pub parent_image_id: String,
    pub pixels: RgbImage,
}

impl Tile {
    pub fn scale_factor(&self) -> f64 {
        self.region.factor
    }

    pub fn offset(&self) -> (u32, u32) {
        (self.region.x, self.region.y)
    }

    pub fn width(&self) -> u32 {
        self.pixels.width()
    }

    pub fn height(&self) -> u32 {
        self.pixels.height()
    }
}

/// One resized copy of the image.
#[derive(Debug, Clone)]
pub struct ScaleLevel {
    pub level: usize,
    pub factor: f64,
    pub image: RgbImage,
}

impl TilePlan {
    pub fn new(window_size: u32, step_size: u32, resize_factor: u32) -> Result<Self, PlanError> {
        let plan = Self {
            window_size,
            step_size,
            resize_factor,
        };
        plan.validate()?;
        Ok(plan)
    }

    pub fn validate(&self) -> Result<(), PlanError> {
        if self.window_size == 0 {
            return Err(PlanError::ZeroWindow);
        }
        if self.step_size == 0 || self.step_size > self.window_size {
            return Err(PlanError::InvalidStep {
                step: self.step_size,
                window: self.window_size,
            });
        }
        if self.resize_factor < 2 {
            return Err(PlanError::InvalidResizeFactor(self.resize_factor));
        }
        Ok(())
    }

    /// Size after trimming the bottom/right so both sides divide by `resize_factor`.
    pub fn cropped_size(&self, width: u32, height: u32) -> (u32, u32) {
        let f = self.resize_factor;
        (width - width % f, height - height % f)
    }

    /// Scale factors to process, largest first, for an already cropped size.
    ///
    /// An image that fits in one window is processed once at its own size.
    pub fn scale_factors(&self, width: u32, height: u32) -> Vec<f64> {
        let window = self.window_size;
        let longest = width.max(height);
        if longest <= window {
            return vec![1.0];
        }

        let f_min = window as f64 / longest as f64;
        let mut factors = Vec::new();
        let (mut w, mut h) = (width, height);
        let mut n = 0i32;
        while w > window || h > window {
            let f = f_min.max((self.resize_factor as f64).powi(-n));
            (w, h) = scaled_size(width, height, f);
            factors.push(f);
            n += 1;
        }
        factors
    }

    /// Row-major windows over a `width × height` level.
    pub fn windows(&self, width: u32, height: u32) -> Windows {
        Windows {
            width,
            height,
            window: self.window_size,
            step: self.step_size,
            x: 0,
            y: 0,
        }
    }

    /// Every tile region for an image of the given original size, in the
    /// order [`TilePlan::tiles`] yields them.
    pub fn regions(&self, width: u32, height: u32) -> Vec<TileRegion> {
        let (cw, ch) = self.cropped_size(width, height);
        let mut out = Vec::new();
        for (level, factor) in self.scale_factors(cw, ch).into_iter().enumerate() {
            let (lw, lh) = scaled_size(cw, ch, factor);
            for win in self.windows(lw, lh) {
                out.push(win.into_region(out.len(), level, factor));
            }
        }
        out
    }

    /// Lazily resized scale levels of `image`.
    pub fn levels(&self, image: &RgbImage) -> ScaleLevels {
        let (cw, ch) = self.cropped_size(image.width(), image.height());
        let base = if (cw, ch) == image.dimensions() {
            image.clone()
        } else {
            imageops::crop_imm(image, 0, 0, cw, ch).to_image()
        };
        ScaleLevels {
            factors: self.scale_factors(cw, ch).into_iter(),
            base,
            level: 0,
        }
    }

    /// Lazily cut tiles of `image`, level by level.
    pub fn tiles(&self, image: &RgbImage, image_id: &str) -> Tiles {
        Tiles {
            plan: *self,
            levels: self.levels(image),
            current: None,
            next_index: 0,
            image_id: image_id.to_string(),
        }
    }
}

fn scaled_size(width: u32, height: u32, factor: f64) -> (u32, u32) {
    (
        (width as f64 * factor) as u32,
        (height as f64 * factor) as u32,
    )
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Window {
    pub x: u32,
    pub y: u32,
    pub width: u32,
    pub height: u32,
}

impl Window {
    fn into_region(self, index: usize, level: usize, factor: f64) -> TileRegion {
        TileRegion {
            index,
            level,
            factor,
            x: self.x,
            y: self.y,
            width: self.width,
            height: self.height,
        }
    }
}

/// Rolling window iterator; windows past the right/bottom edge are truncated.
#[derive(Debug, Clone)]
pub struct Windows {
    width: u32,
    height: u32,
    window: u32,
    step: u32,
    x: u32,
    y: u32,
}

impl Iterator for Windows {
    type Item = Window;

    fn next(&mut self) -> Option<Window> {
        if self.width == 0 || self.y >= self.height {
            return None;
        }
        let win = Window {
            x: self.x,
            y: self.y,
            width: self.window.min(self.width - self.x),
            height: self.window.min(self.height - self.y),
        };
        self.x += self.step;
        if self.x >= self.width {
            self.x = 0;
            self.y += self.step;
        }
        Some(win)
    }
}

pub struct ScaleLevels {
    factors: std::vec::IntoIter<f64>,
    base: RgbImage,
    level: usize,
}

impl Iterator for ScaleLevels {
    type Item = ScaleLevel;

    fn next(&mut self) -> Option<ScaleLevel> {
        let factor = self.factors.next()?;
        let (w, h) = scaled_size(self.base.width(), self.base.height(), factor);
        let image = if (w, h) == self.base.dimensions() {
            self.base.clone()
        } else {
            log::debug!(
                "resizing {}x{} to {:.2}%: {w}x{h}",
                self.base.width(),
                self.base.height(),
                factor * 100.0
            );
            imageops::resize(&self.base, w, h, FilterType::Lanczos3)
        };
        let level = ScaleLevel {
            level: self.level,
            factor,
            image,
        };
        self.level += 1;
        Some(level)
    }
}

pub struct Tiles {
    plan: TilePlan,
    levels: ScaleLevels,
    current: Option<(ScaleLevel, Windows)>,
    next_index: usize,
    image_id: String,
}

impl Iterator for Tiles {
    type Item = Tile;

    fn next(&mut self) -> Option<Tile> {
        loop {
            if let Some((level, windows)) = &mut self.current {
                if let Some(win) = windows.next() {
                    let pixels =
                        imageops::crop_imm(&level.image, win.x, win.y, win.width, win.height)
                            .to_image();
                    let region = win.into_region(self.next_index, level.level, level.factor);
                    self.next_index += 1;
                    return Some(Tile {
                        region,
                        parent_image_id: self.image_id.clone(),
                        pixels,
                    });
                }
            }
            let level = self.levels.next()?;
            let windows = self.plan.windows(level.image.width(), level.image.height());
            self.current = Some((level, windows));
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use image::Rgb;

    fn gradient(width: u32, height: u32) -> RgbImage {
        RgbImage::from_fn(width, height, |x, y| Rgb([(x % 256) as u8, (y % 256) as u8, 7]))
    }

    #[test]
    fn new_validates() {
        assert_eq!(TilePlan::new(0, 1, 2), Err(PlanError::ZeroWindow));
        assert_eq!(
            TilePlan::new(100, 150, 2),
            Err(PlanError::InvalidStep { step: 150, window: 100 })
        );
        assert_eq!(
            TilePlan::new(100, 0, 2),
            Err(PlanError::InvalidStep { step: 0, window: 100 })
        );
        assert_eq!(TilePlan::new(100, 50, 1), Err(PlanError::InvalidResizeFactor(1)));
        assert!(TilePlan::new(100, 100, 3).is_ok());
    }

    #[test]
    fn crop_to_resize_multiple() {
        let plan = TilePlan::default();
        assert_eq!(plan.cropped_size(4001, 3000), (4000, 3000));
        assert_eq!(plan.cropped_size(7, 9), (6, 8));
    }

    #[test]
    fn scale_factors_halve_until_fit() {
        let plan = TilePlan::default();
        assert_eq!(plan.scale_factors(4000, 3000), vec![1.0, 0.5, 0.25]);
    }

    #[test]
    fn scale_factors_bounded_by_f_min() {
        let plan = TilePlan::default();
        assert_eq!(plan.scale_factors(2500, 900), vec![1.0, 0.5, 0.4]);
    }

    #[test]
    fn small_image_gets_single_level() {
        let plan = TilePlan::default();
        assert_eq!(plan.scale_factors(800, 1000), vec![1.0]);
    }

    #[test]
    fn windows_truncate_at_edges() {
        let plan = TilePlan::default();
        let wins: Vec<Window> = plan.windows(2000, 900).collect();
        let xs: Vec<(u32, u32)> = wins.iter().map(|w| (w.x, w.width)).collect();
        assert_eq!(xs, vec![(0, 1000), (750, 1000), (1500, 500), (0, 1000), (750, 1000), (1500, 500)]);
        let ys: Vec<(u32, u32)> = wins.iter().map(|w| (w.y, w.height)).collect();
        assert_eq!(ys[0], (0, 900));
        assert_eq!(ys[3], (750, 150));
    }

    #[test]
    fn window_reaching_the_edge_is_followed_by_a_sliver() {
        // Starts follow range(0, size, step), so a start inside the image
        // yields a window even when the previous one already reached the edge.
        let plan = TilePlan::new(100, 75, 2).unwrap();
        let wins: Vec<Window> = plan.windows(80, 60).collect();
        assert_eq!(
            wins,
            vec![
                Window { x: 0, y: 0, width: 80, height: 60 },
                Window { x: 75, y: 0, width: 5, height: 60 },
            ]
        );
        assert_eq!(plan.regions(80, 60).len(), 2);
    }

    #[test]
    fn windows_are_row_major() {
        let plan = TilePlan::new(10, 5, 2).unwrap();
        let order: Vec<(u32, u32)> = plan.windows(15, 12).map(|w| (w.x, w.y)).collect();
        assert_eq!(
            order,
            vec![(0, 0), (5, 0), (10, 0), (0, 5), (5, 5), (10, 5), (0, 10), (5, 10), (10, 10)]
        );
    }

    #[test]
    fn regions_are_deterministic_and_indexed() {
        let plan = TilePlan::new(100, 75, 2).unwrap();
        let a = plan.regions(431, 297);
        let b = plan.regions(431, 297);
        assert_eq!(a, b);
        for (i, r) in a.iter().enumerate() {
            assert_eq!(r.index, i);
        }
        // Levels never increase in factor.
        assert!(a.windows(2).all(|w| w[0].factor >= w[1].factor));
    }

    #[test]
    fn tiles_cover_every_pixel() {
        for &(window, step) in &[(10u32, 7u32), (10, 10), (16, 5)] {
            let plan = TilePlan::new(window, step, 2).unwrap();
            for &(w, h) in &[(9u32, 9u32), (37, 21), (50, 8), (64, 64), (3, 41)] {
                let (cw, ch) = plan.cropped_size(w, h);
                let regions = plan.regions(w, h);
                for py in 0..ch {
                    for px in 0..cw {
                        let covered = regions.iter().any(|r| {
                            let x0 = r.x as f64 / r.factor;
                            let y0 = r.y as f64 / r.factor;
                            let x1 = (r.x + r.width) as f64 / r.factor;
                            let y1 = (r.y + r.height) as f64 / r.factor;
                            (px as f64) >= x0 && (px as f64) < x1 && (py as f64) >= y0 && (py as f64) < y1
                        });
                        assert!(covered, "pixel ({px},{py}) uncovered for {w}x{h} window={window} step={step}");
                    }
                }
            }
        }
    }

    #[test]
    fn tiles_match_regions() {
        let plan = TilePlan::new(16, 12, 2).unwrap();
        let img = gradient(41, 30);
        let regions = plan.regions(41, 30);
        let tiles: Vec<Tile> = plan.tiles(&img, "map").collect();
        assert_eq!(tiles.len(), regions.len());
        for (tile, region) in tiles.iter().zip(&regions) {
            assert_eq!(&tile.region, region);
            assert_eq!(tile.width(), region.width);
            assert_eq!(tile.height(), region.height);
            assert_eq!(tile.parent_image_id, "map");
        }
    }

    #[test]
    fn full_scale_tiles_are_crops_of_the_original() {
        let plan = TilePlan::new(16, 12, 2).unwrap();
        let img = gradient(40, 30);
        for tile in plan.tiles(&img, "map").filter(|t| t.scale_factor() == 1.0) {
            let (ox, oy) = tile.offset();
            assert_eq!(tile.pixels.get_pixel(0, 0), img.get_pixel(ox, oy));
            let (lx, ly) = (tile.width() - 1, tile.height() - 1);
            assert_eq!(tile.pixels.get_pixel(lx, ly), img.get_pixel(ox + lx, oy + ly));
        }
    }

    #[test]
    fn levels_resize_lazily_to_expected_sizes() {
        let plan = TilePlan::new(10, 10, 2).unwrap();
        let img = gradient(41, 20);
        let sizes: Vec<(f64, (u32, u32))> = plan
            .levels(&img)
            .map(|l| (l.factor, l.image.dimensions()))
            .collect();
        assert_eq!(sizes, vec![(1.0, (40, 20)), (0.5, (20, 10)), (0.25, (10, 5))]);
    }
}
