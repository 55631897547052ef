//! Detector backed by an external program.
//!
//! Each tile is written as a PNG to a scratch directory and its path is
//! appended to the configured command line. The program prints a JSON array
//! on stdout, one record per detection, shaped like the output of SAM2's
//! automatic mask generator:
//!
//! ```json
//! [{"segmentation": {"size": [h, w], "counts": "..."},
//!   "bbox": [x, y, w, h], "predicted_iou": 0.93, "stability_score": 0.97,
//!   "point_coords": [[x, y]]}]
//! ```
//!
//! Text spotters report `"polygon": [[x, y], ...]` and `"text"` instead of a
//! segmentation.

use std::fs;
use std::io::{self, Read};
use std::path::{Path, PathBuf};
use std::process::{Child, Command, ExitStatus, Stdio};
use std::thread;
use std::time::{Duration, Instant};

use image::{ImageFormat, RgbImage};
use log::debug;
use serde::Deserialize;
use uuid::Uuid;

use super::adapter::{Detector, RawDetection, RawShape};
use crate::error::DetectError;
use crate::geometry::{BBox, Point};
use crate::rle::CocoRle;

/// How to invoke the external program.
#[derive(Debug, Clone)]
pub struct ExternalConfig {
    /// Reported as the annotation generator.
    pub name: String,
    pub program: PathBuf,
    pub args: Vec<String>,
    /// Model weights the program loads; checked to exist up front.
    pub weights: Option<PathBuf>,
    /// Per-tile limit; the child is killed when it runs over.
    pub timeout: Option<Duration>,
    /// Where tile PNGs are written. Defaults to the system temp directory.
    pub scratch_dir: Option<PathBuf>,
}

impl ExternalConfig {
    pub fn new(name: impl Into<String>, program: impl Into<PathBuf>) -> Self {
        Self {
            name: name.into(),
            program: program.into(),
            args: Vec::new(),
            weights: None,
            timeout: None,
            scratch_dir: None,
        }
    }
}

#[derive(Debug)]
pub struct ExternalDetector {
    config: ExternalConfig,
    scratch_dir: PathBuf,
}

impl ExternalDetector {
    pub fn new(config: ExternalConfig) -> Result<Self, DetectError> {
        if let Some(weights) = &config.weights {
            if !weights.is_file() {
                return Err(DetectError::BackendUnavailable(format!(
                    "weights file {} not found",
                    weights.display()
                )));
            }
        }
        let scratch_dir = config.scratch_dir.clone().unwrap_or_else(std::env::temp_dir);
        if !scratch_dir.is_dir() {
            return Err(DetectError::BackendUnavailable(format!(
                "scratch directory {} does not exist",
                scratch_dir.display()
            )));
        }
        Ok(Self {
            config,
            scratch_dir,
        })
    }

    pub fn config(&self) -> &ExternalConfig {
        &self.config
    }

    fn spawn(&self, tile_path: &Path) -> Result<Child, DetectError> {
        Command::new(&self.config.program)
            .args(&self.config.args)
            .arg(tile_path)
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .spawn()
            .map_err(|e| {
                let msg = format!("cannot run {}: {e}", self.config.program.display());
                match e.kind() {
                    io::ErrorKind::NotFound | io::ErrorKind::PermissionDenied => {
                        DetectError::BackendUnavailable(msg)
                    }
                    _ => DetectError::Inference(msg),
                }
            })
    }

    fn wait(&self, child: &mut Child) -> Result<ExitStatus, DetectError> {
        let io_err = |e: io::Error| DetectError::Inference(format!("waiting for detector: {e}"));
        let Some(timeout) = self.config.timeout else {
            return child.wait().map_err(io_err);
        };
        let start = Instant::now();
        loop {
            if let Some(status) = child.try_wait().map_err(io_err)? {
                return Ok(status);
            }
            if start.elapsed() >= timeout {
                // The child may have exited between the two calls.
                let _ = child.kill();
                let _ = child.wait();
                return Err(DetectError::Timeout(timeout));
            }
            thread::sleep(Duration::from_millis(10));
        }
    }
}

/// Removes the tile PNG however the call ends.
struct ScratchFile(PathBuf);

impl Drop for ScratchFile {
    fn drop(&mut self) {
        if let Err(e) = fs::remove_file(&self.0) {
            debug!("could not remove {}: {e}", self.0.display());
        }
    }
}

fn drain(pipe: Option<impl Read + Send + 'static>) -> thread::JoinHandle<Vec<u8>> {
    thread::spawn(move || {
        let mut buf = Vec::new();
        if let Some(mut pipe) = pipe {
            let _ = pipe.read_to_end(&mut buf);
        }
        buf
    })
}

impl Detector for ExternalDetector {
    fn name(&self) -> &str {
        &self.config.name
    }

    fn detect(&self, tile: &RgbImage) -> Result<Vec<RawDetection>, DetectError> {
        let scratch = ScratchFile(self.scratch_dir.join(format!("{}.png", Uuid::new_v4())));
        tile.save_with_format(&scratch.0, ImageFormat::Png)
            .map_err(|e| DetectError::Inference(format!("writing tile: {e}")))?;

        let mut child = self.spawn(&scratch.0)?;
        let stdout = drain(child.stdout.take());
        let stderr = drain(child.stderr.take());
        let status = self.wait(&mut child)?;
        let stdout = stdout.join().unwrap_or_default();
        let stderr = stderr.join().unwrap_or_default();

        if !status.success() {
            let stderr = String::from_utf8_lossy(&stderr);
            let last = stderr.lines().rev().find(|l| !l.trim().is_empty()).unwrap_or("");
            return Err(DetectError::Inference(format!(
                "{} exited with {status}: {last}",
                self.config.program.display()
            )));
        }

        let stdout = std::str::from_utf8(&stdout)
            .map_err(|e| DetectError::Malformed(format!("detector output is not UTF-8: {e}")))?;
        parse_output(stdout, tile.width(), tile.height())
    }
}

fn one() -> f32 {
    1.0
}

#[derive(Debug, Deserialize)]
struct OutputRecord {
    #[serde(default)]
    segmentation: Option<CocoRle>,
    #[serde(default)]
    polygon: Option<Vec<Point>>,
    #[serde(default)]
    bbox: Option<[f64; 4]>,
    #[serde(default = "one")]
    predicted_iou: f32,
    #[serde(default = "one")]
    stability_score: f32,
    #[serde(default)]
    point_coords: Vec<Point>,
    #[serde(default)]
    text: Option<String>,
}

impl OutputRecord {
    fn into_raw(self, width: u32, height: u32) -> Result<RawDetection, DetectError> {
        let shape = match (self.segmentation, self.polygon) {
            (Some(rle), _) => {
                if rle.size != [height, width] {
                    return Err(DetectError::Malformed(format!(
                        "mask is {}x{}, tile is {width}x{height}",
                        rle.width(),
                        rle.height()
                    )));
                }
                let mask = rle
                    .to_mask()
                    .map_err(|e| DetectError::Malformed(format!("segmentation: {e}")))?;
                RawShape::Mask(mask)
            }
            (None, Some(points)) => RawShape::Polygon(points),
            (None, None) => {
                return Err(DetectError::Malformed(
                    "record has neither segmentation nor polygon".into(),
                ))
            }
        };
        Ok(RawDetection {
            shape,
            confidence: self.predicted_iou,
            stability: self.stability_score,
            bbox: self.bbox.map(|[x, y, w, h]| BBox::from_xywh(x, y, w, h)),
            point_coords: self.point_coords,
            text: self.text,
        })
    }
}

/// Parse the JSON printed by a detector for a `width × height` tile.
pub fn parse_output(json: &str, width: u32, height: u32) -> Result<Vec<RawDetection>, DetectError> {
    let records: Vec<OutputRecord> = serde_json::from_str(json)
        .map_err(|e| DetectError::Malformed(format!("detector output: {e}")))?;
    records
        .into_iter()
        .map(|r| r.into_raw(width, height))
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parse_rle_record() {
        // 3x2 mask, column-major runs: 2 off, 2 on, 2 off
        let json = r#"[{"segmentation": {"size": [2, 3], "counts": [2, 2, 2]},
                        "bbox": [1, 0, 1, 2], "predicted_iou": 0.9,
                        "stability_score": 0.95, "point_coords": [[1.5, 1.0]]}]"#;
        let raws = parse_output(json, 3, 2).unwrap();
        assert_eq!(raws.len(), 1);
        let raw = &raws[0];
        let RawShape::Mask(mask) = &raw.shape else {
            panic!("expected a mask");
        };
        assert_eq!(mask.area(), 2);
        assert!(mask.get(1, 0) && mask.get(1, 1));
        assert_eq!(raw.bbox, Some(BBox::new(1.0, 0.0, 2.0, 2.0)));
        assert_eq!(raw.confidence, 0.9);
        assert_eq!(raw.point_coords, vec![[1.5, 1.0]]);
    }

    #[test]
    fn parse_polygon_record_with_text() {
        let json = r#"[{"polygon": [[0, 0], [10, 0], [10, 4]], "text": "Batavia"}]"#;
        let raws = parse_output(json, 20, 20).unwrap();
        assert!(matches!(raws[0].shape, RawShape::Polygon(ref p) if p.len() == 3));
        assert_eq!(raws[0].text.as_deref(), Some("Batavia"));
        assert_eq!(raws[0].confidence, 1.0);
    }

    #[test]
    fn parse_rejects_malformed_output() {
        assert!(matches!(parse_output("not json", 4, 4), Err(DetectError::Malformed(_))));
        assert!(matches!(
            parse_output(r#"[{"bbox": [0, 0, 1, 1]}]"#, 4, 4),
            Err(DetectError::Malformed(_))
        ));
        // mask size differs from the tile
        assert!(matches!(
            parse_output(r#"[{"segmentation": {"size": [2, 2], "counts": [4]}}]"#, 4, 4),
            Err(DetectError::Malformed(_))
        ));
    }

    #[test]
    fn oversized_mask_is_refused_before_decoding() {
        // Runs cover all 70000x70000 pixels, so only the size check stops it.
        let json = r#"[{"segmentation": {"size": [70000, 70000],
                        "counts": [4000000000, 900000000]}}]"#;
        let err = parse_output(json, 64, 64).unwrap_err();
        assert!(matches!(err, DetectError::Malformed(ref m) if m.contains("70000x70000")), "{err}");
        assert!(!err.is_fatal());
    }

    #[test]
    fn missing_weights_are_fatal() {
        let mut config = ExternalConfig::new("sam2", "sam2-tile");
        config.weights = Some(PathBuf::from("/nonexistent/sam2_hiera_large.pt"));
        let err = ExternalDetector::new(config).unwrap_err();
        assert!(err.is_fatal());
    }

    #[test]
    fn missing_program_is_fatal() {
        let detector =
            ExternalDetector::new(ExternalConfig::new("none", "/nonexistent/detector")).unwrap();
        let err = detector.detect(&RgbImage::new(4, 4)).unwrap_err();
        assert!(err.is_fatal(), "{err}");
    }

    #[cfg(unix)]
    fn shell(script: &str) -> ExternalConfig {
        let mut config = ExternalConfig::new("sh", "sh");
        config.args = vec!["-c".into(), script.into(), "sh".into()];
        config
    }

    #[cfg(unix)]
    #[test]
    fn runs_program_with_tile_path() {
        let detector = ExternalDetector::new(shell(
            r#"test -s "$1" && echo '[{"polygon": [[1, 1], [6, 1], [6, 5]], "predicted_iou": 0.8}]'"#,
        ))
        .unwrap();
        let raws = detector.detect(&RgbImage::new(8, 8)).unwrap();
        assert_eq!(raws.len(), 1);
        assert_eq!(raws[0].confidence, 0.8);
    }

    #[cfg(unix)]
    #[test]
    fn nonzero_exit_fails_the_tile() {
        let detector = ExternalDetector::new(shell("echo 'CUDA out of memory' >&2; exit 3")).unwrap();
        let err = detector.detect(&RgbImage::new(8, 8)).unwrap_err();
        assert!(!err.is_fatal());
        assert!(err.to_string().contains("CUDA out of memory"), "{err}");
    }

    #[cfg(unix)]
    #[test]
    fn slow_program_times_out() {
        let mut config = shell("exec sleep 5");
        config.timeout = Some(Duration::from_millis(100));
        let detector = ExternalDetector::new(config).unwrap();
        let err = detector.detect(&RgbImage::new(8, 8)).unwrap_err();
        assert!(matches!(err, DetectError::Timeout(_)));
    }
}
