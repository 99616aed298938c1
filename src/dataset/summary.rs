//! Per-field data-quality status returned alongside a loaded snapshot
//!
//! The loader never logs this itself; callers decide how to render it.

use super::data::{DataStatus, VariableType};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;

/// Completeness and consistency of one declared variable
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FieldSummary {
    pub name: String,
    pub var_type: VariableType,
    pub required: bool,

    /// Records carrying a valid value
    pub present: usize,

    /// Records with no value at all
    pub missing: usize,

    /// Records whose value did not match the declared type
    pub inconsistent: usize,

    pub status: DataStatus,
}

impl FieldSummary {
    /// Share of records with a valid value, in [0, 1]
    pub fn completeness(&self) -> f64 {
        let total = self.present + self.missing + self.inconsistent;
        if total == 0 {
            0.0
        } else {
            self.present as f64 / total as f64
        }
    }
}

/// Structured status summary for a loaded dataset
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StatusSummary {
    pub loaded_at: DateTime<Utc>,
    pub year: i32,
    pub status: DataStatus,
    pub fields: Vec<FieldSummary>,

    pub records_ok: usize,
    pub records_partial: usize,
    pub records_invalid: usize,

    /// Records with a non-positive or non-finite weight
    pub nonpositive_weights: usize,
}

impl StatusSummary {
    pub fn field(&self, name: &str) -> Option<&FieldSummary> {
        self.fields.iter().find(|f| f.name == name)
    }

    /// Count of fields in the given status
    pub fn fields_with(&self, status: DataStatus) -> usize {
        self.fields.iter().filter(|f| f.status == status).count()
    }

    pub fn total_records(&self) -> usize {
        self.records_ok + self.records_partial + self.records_invalid
    }
}

impl fmt::Display for StatusSummary {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        writeln!(
            f,
            "Dataset {} [{}]: {} records ({} ok, {} partial, {} invalid)",
            self.year,
            self.status,
            self.total_records(),
            self.records_ok,
            self.records_partial,
            self.records_invalid,
        )?;
        writeln!(
            f,
            "Fields: {} ok, {} partial, {} invalid",
            self.fields_with(DataStatus::Ok),
            self.fields_with(DataStatus::Partial),
            self.fields_with(DataStatus::Invalid),
        )?;
        for field in &self.fields {
            writeln!(
                f,
                "  {:<30} {:<12} {:>8} {:>7.2}%{}",
                field.name,
                field.var_type.as_str(),
                field.status.as_str(),
                field.completeness() * 100.0,
                if field.required { "  (required)" } else { "" },
            )?;
        }
        Ok(())
    }
}
