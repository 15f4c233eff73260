//! Viewport-driven tile scheduling over pyramids and derived products.
//!
//! The renderer describes what it shows with a [`ViewportRequest`]; the
//! scheduler picks a level, queues the tiles in view by priority and
//! notifies the renderer with a [`TileEvent`] as each one becomes ready (or
//! is tombstoned). A newer viewport supersedes everything queued for the
//! previous one.

pub mod config;
pub mod event;
pub mod level;
mod product;
mod queue;
pub mod request;
pub mod scheduler;
pub mod stats;
mod tracker;

pub use config::SchedulerConfig;
pub use event::{TileEvent, TileEventKind, TileState, TileView, Tombstone};
pub use level::{select_level, LevelPolicy};
pub use request::{PlannedTile, ProductSpec, Ticket, ViewportPlan, ViewportRequest};
pub use scheduler::TileScheduler;
pub use stats::SchedulerStats;
