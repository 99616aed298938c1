//! Calibration of record weights to external per-year targets

mod target;
mod reweighter;

pub use target::{Aggregate, CalibrationTarget, RecordFilter, TargetsByYear};
pub use reweighter::{Calibration, ReweightConfig, Reweighter};
