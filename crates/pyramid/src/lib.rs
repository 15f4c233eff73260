//! Lazy multi-resolution pyramids and derived products over the cache store.
//!
//! ```text
//!   source ──read_rows──► L0 ──aggregate──► L1 ──aggregate──► L2 ...
//!                          │                 │
//!                          └──── Recipe ─────┴──► derived entries
//! ```
//!
//! Every artifact is addressed by a deterministic [`CacheKey`](sift_common::CacheKey)
//! and built at most once at a time through [`SingleFlight`].

pub mod builder;
pub mod config;
pub mod pipeline;
pub mod recipe;
pub mod single_flight;

pub use builder::{BuildProgress, BuilderStats, PyramidBuilder};
pub use config::PyramidConfig;
pub use pipeline::{DerivedPipeline, PipelineStats};
pub use recipe::Recipe;
pub use single_flight::{SingleFlight, SingleFlightStats};
