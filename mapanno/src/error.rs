use std::time::Duration;

use thiserror::Error;

#[derive(Debug, Error, PartialEq)]
pub enum GeometryError {
    #[error("no polygon element found in selector value")]
    MissingPolygon,

    #[error("invalid point '{0}', expected \"x,y\"")]
    InvalidPoint(String),

    #[error("polygon needs at least 3 distinct points, got {0}")]
    TooFewPoints(usize),

    #[error("polygon contains a non-finite coordinate")]
    NonFinite,
}

#[derive(Debug, Error, PartialEq)]
pub enum PlanError {
    #[error("window size must be positive")]
    ZeroWindow,

    #[error("step size {step} must be in 1..={window}")]
    InvalidStep { step: u32, window: u32 },

    #[error("resize factor must be at least 2, got {0}")]
    InvalidResizeFactor(u32),
}

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("config parse error: {0}")]
    Parse(String),

    #[error("invalid tiling: {0}")]
    Plan(#[from] PlanError),

    #[error("{name} must be in {range}, got {value}")]
    OutOfRange {
        name: &'static str,
        range: &'static str,
        value: f64,
    },
}

/// Failure of a detector backend.
///
/// Only [`DetectError::BackendUnavailable`] is fatal; every other variant
/// costs the current tile and nothing more.
#[derive(Debug, Error)]
pub enum DetectError {
    #[error("detector backend unavailable: {0}")]
    BackendUnavailable(String),

    #[error("inference failed: {0}")]
    Inference(String),

    #[error("malformed detector output: {0}")]
    Malformed(String),

    #[error("detector timed out after {0:?}")]
    Timeout(Duration),
}

impl DetectError {
    /// True when the run cannot continue with any further tile.
    pub fn is_fatal(&self) -> bool {
        matches!(self, DetectError::BackendUnavailable(_))
    }
}

impl From<GeometryError> for DetectError {
    fn from(e: GeometryError) -> Self {
        DetectError::Malformed(e.to_string())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn only_backend_errors_are_fatal() {
        assert!(DetectError::BackendUnavailable("no weights".into()).is_fatal());
        assert!(!DetectError::Inference("oom".into()).is_fatal());
        assert!(!DetectError::Malformed("bad json".into()).is_fatal());
        assert!(!DetectError::Timeout(Duration::from_secs(1)).is_fatal());
    }

    #[test]
    fn geometry_error_becomes_malformed() {
        let e: DetectError = GeometryError::TooFewPoints(2).into();
        assert!(matches!(e, DetectError::Malformed(_)));
    }
}
