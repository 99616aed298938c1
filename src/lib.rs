//! Budget Window - projection engine for tax-benefit microsimulation inputs
//!
//! This library provides:
//! - Validated loading of base-year household microdata with per-field status
//! - Year-indexed growth factors (multiplicative, additive, categorical shifts)
//! - Iterative proportional fitting of weights to per-year calibration targets
//! - Lazy, parallel, year-ordered projection across a budget window

pub mod error;
pub mod dataset;
pub mod growth;
pub mod calibration;
pub mod projection;
pub mod settings;
pub mod scenario;

// Re-export commonly used types
pub use error::{ProjectionError, Result, TargetError};
pub use dataset::{DataStatus, DatasetLoader, Record, Schema, Snapshot, StatusSummary};
pub use growth::{GrowthFactor, GrowthFactorProvider, GrowthFactorTable};
pub use calibration::{CalibrationTarget, Reweighter, TargetsByYear};
pub use projection::{BudgetWindow, BudgetWindowProjector, ProjectionConfig, WindowProjection, WindowStatus};
pub use settings::RunSettings;
pub use scenario::{ScenarioComparison, WindowRunner};
