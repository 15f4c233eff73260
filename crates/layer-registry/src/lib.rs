//! Logical, time-indexed product families mapped onto cache sources.
//!
//! The registry is the entry point for the document model and the renderer:
//! a `(family, time)` pair resolves to a source descriptor and its level-0
//! [`CacheKey`](sift_common::CacheKey). Registration only appends times or
//! replaces descriptors nobody is using yet.

pub mod error;
pub mod registry;
pub mod time;

pub use error::{RegistryError, RegistryResult};
pub use registry::{Checkout, LayerRegistry, Registration, ResolvedSource, TimeEntry};
pub use time::parse_time;
