//! Sliding-window multi-scale detection.
//!
//! Stages, in data-flow order: [`tiling`] → [`adapter`] (backends in
//! [`external`]) → [`filter`] → [`remap`] → [`dedup`], wired together by
//! [`pipeline`].
pub mod tiling;
pub mod adapter;
pub mod external;
pub mod filter;
pub mod remap;
pub mod dedup;
pub mod pipeline;
