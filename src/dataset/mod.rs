//! Base-year microdata: records, snapshots and the validating loader

mod data;
mod snapshot;
mod summary;
pub mod loader;

pub use data::{DataStatus, Record, Schema, Value, VariableSpec, VariableType};
pub use snapshot::{CalibrationReport, Snapshot, YearSummary};
pub use summary::{FieldSummary, StatusSummary};
pub use loader::{DatasetLoader, RawDataset, RawRecord};
