pub mod level;
pub mod read;
pub mod series;

pub use level::LevelInfo;
pub use read::{RangeParams, range_params};
pub use series::{MIN_STEP, SeriesLog};
