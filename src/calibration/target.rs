//! External calibration targets and the weighted aggregates they constrain

use crate::dataset::{Record, Value};
use crate::error::{ProjectionError, Result};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

/// What a target measures over its contributing records
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum Aggregate {
    /// Sum of weights (population or household counts)
    Count,
    /// Weighted sum of a numeric variable (income totals)
    Sum { variable: String },
}

/// Which records contribute to a target
#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum RecordFilter {
    #[default]
    All,
    /// Categorical variable equals a given label
    Equals { variable: String, value: String },
    /// Boolean variable is true
    IsTrue { variable: String },
}

impl RecordFilter {
    pub fn matches(&self, record: &Record) -> bool {
        match self {
            RecordFilter::All => true,
            RecordFilter::Equals { variable, value } => {
                matches!(record.get(variable), Some(Value::Categorical(c)) if c == value)
            }
            RecordFilter::IsTrue { variable } => matches!(record.get(variable), Some(Value::Boolean(true))),
        }
    }
}

/// A named aggregate with the value expected for one year
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CalibrationTarget {
    pub name: String,
    pub value: f64,
    #[serde(default = "default_aggregate")]
    pub aggregate: Aggregate,
    #[serde(default)]
    pub filter: RecordFilter,
}

fn default_aggregate() -> Aggregate {
    Aggregate::Count
}

impl CalibrationTarget {
    pub fn new(name: &str, value: f64, aggregate: Aggregate, filter: RecordFilter) -> Self {
        Self {
            name: name.to_string(),
            value,
            aggregate,
            filter,
        }
    }

    /// Total population (sum of all weights)
    pub fn population(value: f64) -> Self {
        Self::new("total population", value, Aggregate::Count, RecordFilter::All)
    }

    /// True for an unfiltered count, the target used for global renormalisation
    pub fn is_population_total(&self) -> bool {
        self.aggregate == Aggregate::Count && self.filter == RecordFilter::All
    }

    /// Per-unit-weight contribution of a record, `None` if it does not contribute
    pub fn contribution(&self, record: &Record) -> Option<f64> {
        if !self.filter.matches(record) {
            return None;
        }
        match &self.aggregate {
            Aggregate::Count => Some(1.0),
            Aggregate::Sum { variable } => record.numeric(variable),
        }
    }

    /// Weighted aggregate over `records` under `weights` (aligned by index)
    pub fn evaluate(&self, records: &[Record], weights: &[f64]) -> f64 {
        records
            .iter()
            .zip(weights)
            .filter_map(|(record, w)| self.contribution(record).map(|c| c * w))
            .sum()
    }

    /// Relative error of an achieved aggregate; absolute error when the target is zero
    pub fn relative_error(&self, achieved: f64) -> f64 {
        if self.value > 0.0 {
            (achieved - self.value).abs() / self.value
        } else {
            achieved.abs()
        }
    }

    pub fn validate(&self, year: i32) -> Result<()> {
        if !self.value.is_finite() {
            return Err(self.invalid(year, "value is not finite"));
        }
        if self.value < 0.0 {
            return Err(self.invalid(year, "value must be non-negative"));
        }
        if self.name.trim().is_empty() {
            return Err(self.invalid(year, "target has no name"));
        }
        Ok(())
    }

    fn invalid(&self, year: i32, reason: &str) -> ProjectionError {
        ProjectionError::InvalidTarget {
            name: self.name.clone(),
            year,
            reason: reason.to_string(),
        }
    }
}

/// Calibration targets for each year of the window
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct TargetsByYear {
    targets: BTreeMap<i32, Vec<CalibrationTarget>>,
}

impl TargetsByYear {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn insert(&mut self, year: i32, target: CalibrationTarget) {
        self.targets.entry(year).or_default().push(target);
    }

    pub fn with(mut self, year: i32, target: CalibrationTarget) -> Self {
        self.insert(year, target);
        self
    }

    /// Targets for a year; empty when none were supplied
    pub fn for_year(&self, year: i32) -> &[CalibrationTarget] {
        self.targets.get(&year).map(Vec::as_slice).unwrap_or(&[])
    }

    pub fn years(&self) -> impl Iterator<Item = i32> + '_ {
        self.targets.keys().copied()
    }

    pub fn is_empty(&self) -> bool {
        self.targets.values().all(Vec::is_empty)
    }

    /// Validate values and reject duplicate names within a year
    pub fn validate(&self) -> Result<()> {
        for (year, targets) in &self.targets {
            let mut names = std::collections::BTreeSet::new();
            for target in targets {
                target.validate(*year)?;
                if !names.insert(target.name.as_str()) {
                    return Err(target.invalid(*year, "duplicate target name"));
                }
            }
        }
        Ok(())
    }
}
