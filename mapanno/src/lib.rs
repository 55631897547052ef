pub mod error;
pub mod geometry;
pub mod mask;
pub mod rle;
pub mod annotation;
#[cfg(feature = "config")]
pub mod config;
pub mod manifest;
pub mod htr;
pub mod snippets;
pub mod georef;
pub mod detect;
