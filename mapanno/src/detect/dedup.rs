//! Removal of near-duplicate detections produced by overlapping windows and
//! repeated scale levels.
//!
//! Every unordered pair `(a, b)`, with `a` earlier in enumeration order, is
//! compared by polygon IoU. When the IoU exceeds the threshold exactly one of
//! the two is marked, chosen by [`ScalePreference`]. Marks are never undone:
//! a detection marked by any pair is dropped, even if it would have won a
//! different pair. Survivors keep their relative order.
//!
//! The decision is pairwise and therefore quadratic in the worst case. Pairs
//! are pruned with a sweep over bounding boxes sorted by left edge; pairs with
//! disjoint boxes have IoU 0 and can never be marked, so the result is the same
//! as comparing all pairs.

#[cfg(feature = "parallel")]
use rayon::iter::{IntoParallelIterator, ParallelIterator};

use geo::{Area, Polygon as GeoPolygon};
use log::warn;
use serde::{Deserialize, Serialize};

use super::pipeline::Detection;
use crate::annotation::{Annotation, ImageRecord};
use crate::geometry::{iou_with_areas, BBox, Polygon};

/// Which side of an overlapping pair survives.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ScalePreference {
    /// Keep the detection from the lower scale factor (the more downscaled
    /// level). Equal scales keep the earlier detection.
    #[default]
    Coarser,
    /// Keep the detection from the higher scale factor. Equal scales keep
    /// the earlier detection.
    Finer,
}

#[derive(Debug, Clone, Copy, PartialEq)]
pub struct DedupParams {
    /// Pairs with IoU strictly above this are duplicates.
    pub overlap_threshold: f64,
    pub prefer: ScalePreference,
}

impl Default for DedupParams {
    fn default() -> Self {
        Self {
            overlap_threshold: 0.7,
            prefer: ScalePreference::Coarser,
        }
    }
}

/// Anything the deduplicator can compare: a shape and the scale it came from.
pub trait Scaled {
    fn polygon(&self) -> &Polygon;
    fn source_scale(&self) -> f64;
}

impl Scaled for Detection {
    fn polygon(&self) -> &Polygon {
        &self.polygon
    }

    fn source_scale(&self) -> f64 {
        self.source_scale
    }
}

impl Scaled for (Polygon, f64) {
    fn polygon(&self) -> &Polygon {
        &self.0
    }

    fn source_scale(&self) -> f64 {
        self.1
    }
}

struct Prepared {
    shape: GeoPolygon<f64>,
    area: f64,
    bbox: BBox,
    scale: f64,
}

impl DedupParams {
    /// Index of the loser of an overlapping pair, `a` enumerated before `b`.
    fn loser(&self, a: usize, scale_a: f64, b: usize, scale_b: f64) -> usize {
        let keep_a = match self.prefer {
            ScalePreference::Coarser => scale_a <= scale_b,
            ScalePreference::Finer => scale_a >= scale_b,
        };
        if keep_a {
            b
        } else {
            a
        }
    }
}

/// Mark every item that loses at least one overlapping pair.
pub fn duplicate_mask<T: Scaled>(items: &[T], params: &DedupParams) -> Vec<bool> {
    let prepared: Vec<Prepared> = items
        .iter()
        .map(|item| {
            let shape = item.polygon().to_geo();
            Prepared {
                area: shape.unsigned_area(),
                shape,
                bbox: item.polygon().bbox(),
                scale: item.source_scale(),
            }
        })
        .collect();
    let n = prepared.len();

    let mut by_left: Vec<usize> = (0..n).collect();
    by_left.sort_by(|&a, &b| prepared[a].bbox.x1.total_cmp(&prepared[b].bbox.x1));

    let losers_from = |k: usize| -> Vec<usize> {
        let i = by_left[k];
        let pi = &prepared[i];
        let mut losers = Vec::new();
        for &j in &by_left[k + 1..] {
            let pj = &prepared[j];
            if pj.bbox.x1 > pi.bbox.x2 {
                break;
            }
            if !pi.bbox.intersects(&pj.bbox) {
                continue;
            }
            let (a, b) = if i < j { (i, j) } else { (j, i) };
            let (pa, pb) = (&prepared[a], &prepared[b]);
            if iou_with_areas(&pa.shape, pa.area, &pb.shape, pb.area) > params.overlap_threshold {
                losers.push(params.loser(a, pa.scale, b, pb.scale));
            }
        }
        losers
    };

    #[cfg(feature = "parallel")]
    let losers: Vec<usize> = (0..n).into_par_iter().flat_map_iter(losers_from).collect();

    #[cfg(not(feature = "parallel"))]
    let losers: Vec<usize> = (0..n).flat_map(losers_from).collect();

    let mut marked = vec![false; n];
    for i in losers {
        marked[i] = true;
    }
    marked
}

/// Drop duplicates in place, preserving the order of survivors.
///
/// Returns the number of detections removed.
pub fn deduplicate(detections: &mut Vec<Detection>, params: &DedupParams) -> usize {
    let marked = duplicate_mask(detections, params);
    let before = detections.len();
    let mut idx = 0;
    detections.retain(|_| {
        let keep = !marked[idx];
        idx += 1;
        keep
    });
    before - detections.len()
}

/// Outcome of deduplicating annotations read back from a raw output file.
#[derive(Debug, Clone, Default)]
pub struct RecordDedup {
    pub kept: Vec<Annotation>,
    pub removed: usize,
    /// Annotations whose selector could not be parsed; left out of `kept`.
    pub malformed: usize,
}

/// Apply the duplicate rule to every annotation of a stored image record,
/// using each cutout's `f` as the source scale.
pub fn deduplicate_record(record: &ImageRecord, params: &DedupParams) -> RecordDedup {
    let mut shapes = Vec::new();
    let mut annotations = Vec::new();
    let mut malformed = 0;
    for (f, annotation) in record.scaled_annotations() {
        match annotation.polygon() {
            Ok(polygon) => {
                shapes.push((polygon, f));
                annotations.push(annotation);
            }
            Err(e) => {
                warn!("{}: skipping annotation {}: {e}", record.image, annotation.id);
                malformed += 1;
            }
        }
    }

    let marked = duplicate_mask(&shapes, params);
    let kept: Vec<Annotation> = annotations
        .into_iter()
        .zip(&marked)
        .filter(|(_, &dup)| !dup)
        .map(|(a, _)| a.clone())
        .collect();
    RecordDedup {
        removed: shapes.len() - kept.len(),
        kept,
        malformed,
    }
}
