use image::RgbImage;
use log::{debug, info, warn};
use uuid::Uuid;

#[cfg(feature = "parallel")]
use rayon::iter::{IntoParallelRefIterator, ParallelIterator};

use super::adapter::{detect_tile, Detector};
use super::dedup::{deduplicate, DedupParams};
use super::filter::FilterParams;
use super::tiling::{Tile, TilePlan};
use crate::annotation::{Annotation, Generator, ImageRecord, Motivation, RawRecord, TextualBody, TileRecord};
use crate::error::{DetectError, PlanError};
use crate::geometry::{BBox, Point, Polygon};

/// A detection placed in original-image pixel coordinates.
#[derive(Debug, Clone)]
pub struct Detection {
    pub id: String,
    /// Position in the image-wide enumeration (tile order, then detector order).
    pub order: usize,
    pub tile_index: usize,
    pub polygon: Polygon,
    pub bbox: BBox,
    /// Pixel area measured on the tile.
    pub area: f64,
    pub point_coords: Vec<Point>,
    pub source_scale: f64,
    pub canvas_id: String,
    pub confidence: f32,
    pub stability: f32,
    pub text: Option<String>,
}

impl Detection {
    pub fn to_annotation(&self, motivation: Motivation, generator: &str) -> Annotation {
        let mut annotation = Annotation::new(
            self.id.clone(),
            motivation,
            self.canvas_id.clone(),
            &self.polygon,
            Some(Generator::software(generator)),
        );
        if let Some(text) = &self.text {
            annotation
                .body
                .push(TextualBody::supplementing(text.clone(), Some(Generator::software(generator))));
        }
        annotation
    }

    fn to_raw_record(&self) -> RawRecord {
        RawRecord {
            uuid: self.id.clone(),
            bbox: self.bbox.to_xywh(),
            area: self.area,
            predicted_iou: self.confidence,
            stability_score: self.stability,
            point_coords: self.point_coords.clone(),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Default)]
pub struct PipelineConfig {
    pub plan: TilePlan,
    pub filter: FilterParams,
    pub dedup: DedupParams,
    pub motivation: Motivation,
}

/// Counters for one processed image.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct RunStats {
    pub tiles: usize,
    pub failed_tiles: usize,
    pub raw_detections: usize,
    pub rejected: usize,
    pub unmappable: usize,
    pub duplicates: usize,
    pub kept: usize,
}

/// Result of running the pipeline on one image.
#[derive(Debug, Clone)]
pub struct ImageOutput {
    /// Per-tile record of everything that passed the filter, before dedup.
    pub record: ImageRecord,
    /// Detections surviving deduplication, in enumeration order.
    pub detections: Vec<Detection>,
    /// `detections` as annotations.
    pub annotations: Vec<Annotation>,
    pub stats: RunStats,
}

struct TileOutcome {
    record: TileRecord,
    detections: Vec<Detection>,
    failed: bool,
    raw: usize,
    rejected: usize,
    unmappable: usize,
}

/// Tile → detect → filter → remap → dedup, for one detector.
pub struct Pipeline<D> {
    config: PipelineConfig,
    detector: D,
}

impl<D: Detector> Pipeline<D> {
    pub fn new(config: PipelineConfig, detector: D) -> Result<Self, PlanError> {
        config.plan.validate()?;
        Ok(Self { config, detector })
    }

    pub fn config(&self) -> &PipelineConfig {
        &self.config
    }

    pub fn detector(&self) -> &D {
        &self.detector
    }

    /// Process one image.
    ///
    /// Tiles whose detection fails are logged and contribute nothing. Only a
    /// fatal backend error aborts, and it does so before any further tile.
    pub fn run(
        &self,
        image: &RgbImage,
        image_name: &str,
        canvas_id: &str,
    ) -> Result<ImageOutput, DetectError> {
        let tiles = self.config.plan.tiles(image, image_name);
        let outcomes = self.process_tiles(tiles, canvas_id)?;

        let mut stats = RunStats::default();
        let mut cutouts = Vec::with_capacity(outcomes.len());
        let mut detections = Vec::new();
        for outcome in outcomes {
            stats.tiles += 1;
            stats.failed_tiles += outcome.failed as usize;
            stats.raw_detections += outcome.raw;
            stats.rejected += outcome.rejected;
            stats.unmappable += outcome.unmappable;
            detections.extend(outcome.detections);
            cutouts.push(outcome.record);
        }
        for (order, det) in detections.iter_mut().enumerate() {
            det.order = order;
        }

        stats.duplicates = deduplicate(&mut detections, &self.config.dedup);
        stats.kept = detections.len();

        info!(
            "{image_name}: {} tiles ({} failed), {} raw, {} filtered, {} duplicates removed, {} kept",
            stats.tiles,
            stats.failed_tiles,
            stats.raw_detections,
            stats.rejected + stats.unmappable,
            stats.duplicates,
            stats.kept
        );

        let motivation = self.config.motivation;
        let annotations = detections
            .iter()
            .map(|d| d.to_annotation(motivation, self.detector.name()))
            .collect();

        Ok(ImageOutput {
            record: ImageRecord {
                image: image_name.to_string(),
                width: image.width(),
                height: image.height(),
                cutouts,
            },
            detections,
            annotations,
            stats,
        })
    }

    #[cfg(not(feature = "parallel"))]
    fn process_tiles(
        &self,
        tiles: impl Iterator<Item = Tile>,
        canvas_id: &str,
    ) -> Result<Vec<TileOutcome>, DetectError> {
        tiles
            .map(|tile| self.process_tile(&tile, canvas_id))
            .collect()
    }

    /// Tiles of one scale level are detected concurrently; outcomes keep
    /// enumeration order. A fatal error stops the level early.
    #[cfg(feature = "parallel")]
    fn process_tiles(
        &self,
        tiles: impl Iterator<Item = Tile>,
        canvas_id: &str,
    ) -> Result<Vec<TileOutcome>, DetectError> {
        let mut tiles = tiles.peekable();
        let mut outcomes = Vec::new();
        while let Some(first) = tiles.next() {
            let level = first.region.level;
            let mut batch = vec![first];
            while let Some(tile) = tiles.next_if(|t| t.region.level == level) {
                batch.push(tile);
            }
            let level_outcomes: Vec<TileOutcome> = batch
                .par_iter()
                .map(|tile| self.process_tile(tile, canvas_id))
                .collect::<Result<_, _>>()?;
            outcomes.extend(level_outcomes);
        }
        Ok(outcomes)
    }

    fn process_tile(&self, tile: &Tile, canvas_id: &str) -> Result<TileOutcome, DetectError> {
        let region = tile.region;
        let transform = region.transform();
        let (x, y, width, height) = transform.region(tile.width(), tile.height());
        debug!(
            "tile {} at {x}x{y} ({}x{} px, f={:.4})",
            region.index,
            tile.width(),
            tile.height(),
            region.factor
        );

        let mut outcome = TileOutcome {
            record: TileRecord {
                x,
                y,
                f: region.factor,
                width,
                height,
                results: Vec::new(),
                annotations: Vec::new(),
            },
            detections: Vec::new(),
            failed: false,
            raw: 0,
            rejected: 0,
            unmappable: 0,
        };

        let found = match detect_tile(&self.detector, &tile.pixels) {
            Ok(found) => found,
            Err(e) if e.is_fatal() => return Err(e),
            Err(e) => {
                warn!(
                    "{}: tile {} at {x}x{y} skipped: {e}",
                    tile.parent_image_id, region.index
                );
                outcome.failed = true;
                return Ok(outcome);
            }
        };
        outcome.raw = found.len();

        let motivation = self.config.motivation;
        for det in found {
            if let Err(reason) = self.config.filter.check(&det, tile.width(), tile.height()) {
                debug!("tile {}: dropped detection, {reason}", region.index);
                outcome.rejected += 1;
                continue;
            }
            let polygon = match transform.polygon(&det.polygon) {
                Ok(polygon) => polygon,
                Err(e) => {
                    debug!("tile {}: dropped detection, {e}", region.index);
                    outcome.unmappable += 1;
                    continue;
                }
            };

            let detection = Detection {
                id: Uuid::new_v4().to_string(),
                order: 0,
                tile_index: region.index,
                polygon,
                bbox: transform.bbox(&det.bbox),
                area: det.area,
                point_coords: transform.points(&det.point_coords),
                source_scale: region.factor,
                canvas_id: canvas_id.to_string(),
                confidence: det.confidence,
                stability: det.stability,
                text: det.text,
            };
            outcome.record.results.push(detection.to_raw_record());
            outcome
                .record
                .annotations
                .push(detection.to_annotation(motivation, self.detector.name()));
            outcome.detections.push(detection);
        }
        Ok(outcome)
    }
}
