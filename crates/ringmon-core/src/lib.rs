//! ringmon-core — storage engine for the ringmon time-series monitor.
//!
//! Provides:
//! - `codec` — the 16-bit value encodings (IEEE half floats and
//!   approximate unsigned integers)
//! - `storage` — the per-series multi-resolution ring-buffer files and
//!   their read path
//! - `calendar` — boundary generation for calendar-window aggregation
//! - `registry` — lazy name → series mapping
//! - `task`, `monitor` — the queue and single worker thread that every
//!   collaborator funnels reads and writes through

pub mod calendar;
pub mod codec;
pub mod monitor;
pub mod registry;
pub mod storage;
pub mod task;
pub mod util;

pub const VERSION: &str = env!("CARGO_PKG_VERSION");
