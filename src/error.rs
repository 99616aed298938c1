//! Error types for budget-window projections
//!
//! Every failure the core can raise is a variant of [`ProjectionError`].
//! None of them are retried inside the crate; retry policy belongs to the caller.

use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Achieved calibration error for one target after reweighting
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TargetError {
    /// Target name
    pub name: String,
    /// Expected aggregate value
    pub target: f64,
    /// Weighted aggregate actually achieved
    pub achieved: f64,
    /// Relative error (absolute error when the target is zero)
    pub relative_error: f64,
}

#[derive(Debug, Error)]
pub enum ProjectionError {
    /// Malformed or missing required input data
    #[error("Data integrity error: {reason}")]
    DataIntegrity { reason: String },

    /// Growth-factor configuration has no entry for a (category, year) pair
    #[error("Missing growth factor for category '{category}' in year {year}")]
    MissingFactor { category: String, year: i32 },

    /// Reweighting did not reach the configured tolerance
    #[error(
        "Calibration did not converge for year {year} after {iterations} iterations (max relative error {max_error:.3e})",
        max_error = max_relative_error(.errors)
    )]
    CalibrationNonconvergence {
        year: i32,
        iterations: u32,
        errors: Vec<TargetError>,
    },

    #[error("Invalid budget window: start year {start_year} is after end year {end_year}")]
    InvalidWindow { start_year: i32, end_year: i32 },

    #[error("Invalid calibration target '{name}' for year {year}: {reason}")]
    InvalidTarget { name: String, year: i32, reason: String },

    #[error("Projection cancelled while computing year {year}")]
    Cancelled { year: i32 },

    #[error("Configuration error: {reason}")]
    Config { reason: String },

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("CSV error: {0}")]
    Csv(#[from] csv::Error),

    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),
}

impl ProjectionError {
    pub fn data_integrity(reason: impl Into<String>) -> Self {
        ProjectionError::DataIntegrity { reason: reason.into() }
    }

    pub fn config(reason: impl Into<String>) -> Self {
        ProjectionError::Config { reason: reason.into() }
    }

    /// Year the error is attached to, if any
    pub fn year(&self) -> Option<i32> {
        match self {
            ProjectionError::MissingFactor { year, .. }
            | ProjectionError::CalibrationNonconvergence { year, .. }
            | ProjectionError::InvalidTarget { year, .. }
            | ProjectionError::Cancelled { year } => Some(*year),
            _ => None,
        }
    }
}

fn max_relative_error(errors: &[TargetError]) -> f64 {
    errors.iter().map(|e| e.relative_error).fold(0.0, f64::max)
}

pub type Result<T> = std::result::Result<T, ProjectionError>;
