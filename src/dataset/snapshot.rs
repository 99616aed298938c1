//! Year-tagged population snapshots

use super::data::{DataStatus, Record, Schema};
use crate::calibration::CalibrationTarget;
use crate::error::TargetError;
use serde::{Deserialize, Serialize};
use std::sync::Arc;

/// Outcome of reweighting attached to a projected snapshot
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CalibrationReport {
    /// Fixed-point iterations actually run
    pub iterations: u32,

    /// Whether every target met the tolerance
    pub converged: bool,

    /// Achieved error per target
    pub errors: Vec<TargetError>,

    /// Records whose weight was clamped to the positive floor
    pub clamped: Vec<u64>,
}

impl CalibrationReport {
    pub fn max_error(&self) -> f64 {
        self.errors.iter().map(|e| e.relative_error).fold(0.0, f64::max)
    }

    /// Quality flag raised by this calibration, if any
    pub fn status(&self) -> DataStatus {
        if self.converged && self.clamped.is_empty() {
            DataStatus::Ok
        } else {
            DataStatus::Partial
        }
    }
}

/// The full set of records representing a population for one year
///
/// Snapshots are never mutated once built; projected years are fresh copies.
#[derive(Debug, Clone, PartialEq)]
pub struct Snapshot {
    pub year: i32,
    pub status: DataStatus,
    pub schema: Arc<Schema>,
    pub records: Vec<Record>,

    /// Present on projected years, absent on the loaded base year
    pub calibration: Option<CalibrationReport>,
}

impl Snapshot {
    pub fn new(year: i32, schema: Arc<Schema>, records: Vec<Record>, status: DataStatus) -> Self {
        Self {
            year,
            status,
            schema,
            records,
            calibration: None,
        }
    }

    pub fn len(&self) -> usize {
        self.records.len()
    }

    pub fn is_empty(&self) -> bool {
        self.records.is_empty()
    }

    pub fn weights(&self) -> Vec<f64> {
        self.records.iter().map(|r| r.weight).collect()
    }

    pub fn total_weight(&self) -> f64 {
        self.records.iter().map(|r| r.weight).sum()
    }

    /// Weighted sum of a numeric variable; missing values contribute nothing
    pub fn weighted_sum(&self, variable: &str) -> f64 {
        self.records
            .iter()
            .filter_map(|r| r.numeric(variable).map(|v| v * r.weight))
            .sum()
    }

    /// Weighted aggregate for a calibration target under the current weights
    pub fn aggregate(&self, target: &CalibrationTarget) -> f64 {
        let weights = self.weights();
        target.evaluate(&self.records, &weights)
    }

    pub fn summary(&self) -> YearSummary {
        let (iterations, max_error, converged, clamped) = match &self.calibration {
            Some(report) => (
                report.iterations,
                report.max_error(),
                report.converged,
                report.clamped.len(),
            ),
            None => (0, 0.0, true, 0),
        };

        YearSummary {
            year: self.year,
            status: self.status,
            records: self.records.len(),
            total_weight: self.total_weight(),
            iterations,
            max_error,
            converged,
            clamped,
        }
    }
}

/// One line of window-level reporting
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct YearSummary {
    pub year: i32,
    pub status: DataStatus,
    pub records: usize,
    pub total_weight: f64,
    pub iterations: u32,
    pub max_error: f64,
    pub converged: bool,
    pub clamped: usize,
}
