use serde::Deserialize;

use crate::annotation::Motivation;
use crate::detect::dedup::{DedupParams, ScalePreference};
use crate::detect::filter::FilterParams;
use crate::detect::pipeline::PipelineConfig;
use crate::detect::tiling::TilePlan;
use crate::error::ConfigError;

/// Serde-driven pipeline settings matching the TOML format. Every key is
/// optional and falls back to the pipeline default.
#[derive(Debug, Clone, PartialEq, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct ConfigFile {
    pub window_size: u32,
    pub step_size: u32,
    pub resize_factor: u32,
    pub border_threshold: u32,
    pub min_area: f64,
    pub max_area_fraction: f64,
    pub min_confidence: f32,
    pub min_stability: f32,
    pub overlap_threshold: f64,
    pub prefer: ScalePreference,
    pub motivation: Motivation,
}

impl Default for ConfigFile {
    fn default() -> Self {
        let plan = TilePlan::default();
        let filter = FilterParams::default();
        let dedup = DedupParams::default();
        Self {
            window_size: plan.window_size,
            step_size: plan.step_size,
            resize_factor: plan.resize_factor,
            border_threshold: filter.border_threshold,
            min_area: filter.min_area,
            max_area_fraction: filter.max_area_fraction,
            min_confidence: filter.min_confidence,
            min_stability: filter.min_stability,
            overlap_threshold: dedup.overlap_threshold,
            prefer: dedup.prefer,
            motivation: Motivation::default(),
        }
    }
}

impl ConfigFile {
    pub fn from_toml_str(toml_str: &str) -> Result<Self, ConfigError> {
        toml::from_str(toml_str).map_err(|e| ConfigError::Parse(e.to_string()))
    }

    /// Validate and convert into the settings the pipeline runs with.
    pub fn into_pipeline_config(self) -> Result<PipelineConfig, ConfigError> {
        let plan = TilePlan::new(self.window_size, self.step_size, self.resize_factor)?;
        check_unit("max_area_fraction", self.max_area_fraction, false)?;
        check_unit("overlap_threshold", self.overlap_threshold, true)?;
        check_unit("min_confidence", self.min_confidence as f64, true)?;
        check_unit("min_stability", self.min_stability as f64, true)?;
        if self.min_area.is_nan() || self.min_area < 0.0 {
            return Err(ConfigError::OutOfRange {
                name: "min_area",
                range: "[0, inf)",
                value: self.min_area,
            });
        }

        Ok(PipelineConfig {
            plan,
            filter: FilterParams {
                border_threshold: self.border_threshold,
                min_area: self.min_area,
                max_area_fraction: self.max_area_fraction,
                min_confidence: self.min_confidence,
                min_stability: self.min_stability,
            },
            dedup: DedupParams {
                overlap_threshold: self.overlap_threshold,
                prefer: self.prefer,
            },
            motivation: self.motivation,
        })
    }
}

impl PipelineConfig {
    /// Parse and validate a TOML config.
    pub fn from_toml_str(toml_str: &str) -> Result<Self, ConfigError> {
        ConfigFile::from_toml_str(toml_str)?.into_pipeline_config()
    }
}

fn check_unit(name: &'static str, value: f64, zero_ok: bool) -> Result<(), ConfigError> {
    let ok = if zero_ok {
        (0.0..=1.0).contains(&value)
    } else {
        value > 0.0 && value <= 1.0
    };
    if ok {
        Ok(())
    } else {
        Err(ConfigError::OutOfRange {
            name,
            range: if zero_ok { "[0, 1]" } else { "(0, 1]" },
            value,
        })
    }
}
