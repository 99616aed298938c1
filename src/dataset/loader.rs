//! Load and validate a base-year microdata snapshot
//!
//! Input arrives either as an in-memory [`RawDataset`] handed over by an
//! external collaborator, or as a CSV file with `id`, `weight` and one column
//! per declared variable.

use super::data::{DataStatus, Record, Schema, Value, VariableType};
use super::snapshot::Snapshot;
use super::summary::{FieldSummary, StatusSummary};
use crate::error::{ProjectionError, Result};
use chrono::Utc;
use csv::Reader;
use std::collections::{BTreeMap, HashSet};
use std::path::Path;
use std::sync::Arc;

/// Column holding the stable record identifier
pub const ID_COLUMN: &str = "id";

/// Column holding the record weight
pub const WEIGHT_COLUMN: &str = "weight";

/// One unvalidated input row
#[derive(Debug, Clone, PartialEq)]
pub struct RawRecord {
    pub id: u64,
    pub weight: f64,
    pub values: BTreeMap<String, Value>,
}

impl RawRecord {
    pub fn new(id: u64, weight: f64) -> Self {
        Self {
            id,
            weight,
            values: BTreeMap::new(),
        }
    }

    pub fn with(mut self, name: &str, value: Value) -> Self {
        self.values.insert(name.to_string(), value);
        self
    }
}

/// Snapshot-shaped input supplied by the data collaborator
#[derive(Debug, Clone, PartialEq)]
pub struct RawDataset {
    pub schema: Schema,
    pub rows: Vec<RawRecord>,
}

#[derive(Default)]
struct FieldCounts {
    present: usize,
    missing: usize,
    inconsistent: usize,
}

/// Validates base-year microdata into an immutable [`Snapshot`]
#[derive(Debug, Clone, Copy)]
pub struct DatasetLoader {
    year: i32,
}

impl DatasetLoader {
    /// Create a loader tagging snapshots with the given base year
    pub fn new(year: i32) -> Self {
        Self { year }
    }

    pub fn year(&self) -> i32 {
        self.year
    }

    /// Validate and normalize a raw dataset
    ///
    /// Records missing declared variables are tagged `Partial` rather than
    /// rejected. Fails when a required variable has no value on any record,
    /// or when no record carries a usable positive weight.
    pub fn load(&self, source: RawDataset) -> Result<(Snapshot, StatusSummary)> {
        let RawDataset { schema, rows } = source;
        schema.validate()?;

        if rows.is_empty() {
            return Err(ProjectionError::data_integrity("dataset contains no records"));
        }

        let mut ids = HashSet::with_capacity(rows.len());
        let mut counts: Vec<FieldCounts> = schema.variables().iter().map(|_| FieldCounts::default()).collect();
        let mut records = Vec::with_capacity(rows.len());
        let mut nonpositive_weights = 0;

        for row in rows {
            if !ids.insert(row.id) {
                return Err(ProjectionError::data_integrity(format!(
                    "duplicate record id {}",
                    row.id
                )));
            }
            if let Some(name) = row.values.keys().find(|name| schema.get(name).is_none()) {
                return Err(ProjectionError::data_integrity(format!(
                    "record {} carries undeclared variable '{}'",
                    row.id, name
                )));
            }

            let mut record = Record::new(row.id, row.weight);
            let mut values = row.values;

            for (spec, count) in schema.variables().iter().zip(counts.iter_mut()) {
                match values.remove(&spec.name) {
                    None => {
                        count.missing += 1;
                        record.status = record.status.worse(DataStatus::Partial);
                    }
                    Some(value) if is_consistent(&value, spec.var_type) => {
                        count.present += 1;
                        record.values.insert(spec.name.clone(), value);
                    }
                    Some(_) => {
                        count.inconsistent += 1;
                        record.status = record.status.worse(DataStatus::Partial);
                    }
                }
            }

            if !(row.weight.is_finite() && row.weight > 0.0) {
                nonpositive_weights += 1;
                record.status = DataStatus::Invalid;
            }

            records.push(record);
        }

        for (spec, count) in schema.variables().iter().zip(&counts) {
            if spec.required && count.present == 0 {
                return Err(ProjectionError::data_integrity(format!(
                    "required variable '{}' is absent from every record",
                    spec.name
                )));
            }
        }

        if nonpositive_weights == records.len() {
            return Err(ProjectionError::data_integrity(
                "no record has a positive weight",
            ));
        }

        let fields: Vec<FieldSummary> = schema
            .variables()
            .iter()
            .zip(counts)
            .map(|(spec, count)| {
                let status = if count.inconsistent > 0 {
                    DataStatus::Invalid
                } else if count.missing > 0 {
                    DataStatus::Partial
                } else {
                    DataStatus::Ok
                };
                FieldSummary {
                    name: spec.name.clone(),
                    var_type: spec.var_type,
                    required: spec.required,
                    present: count.present,
                    missing: count.missing,
                    inconsistent: count.inconsistent,
                    status,
                }
            })
            .collect();

        let required_invalid = fields
            .iter()
            .any(|f| f.required && f.status == DataStatus::Invalid);
        let any_degraded = fields.iter().any(|f| f.status != DataStatus::Ok)
            || records.iter().any(|r| r.status != DataStatus::Ok);

        let status = if required_invalid {
            DataStatus::Invalid
        } else if any_degraded {
            DataStatus::Partial
        } else {
            DataStatus::Ok
        };

        let count_status = |s: DataStatus| records.iter().filter(|r| r.status == s).count();
        let summary = StatusSummary {
            loaded_at: Utc::now(),
            year: self.year,
            status,
            fields,
            records_ok: count_status(DataStatus::Ok),
            records_partial: count_status(DataStatus::Partial),
            records_invalid: count_status(DataStatus::Invalid),
            nonpositive_weights,
        };

        let snapshot = Snapshot::new(self.year, Arc::new(schema), records, status);
        Ok((snapshot, summary))
    }

    /// Load a dataset from a CSV file
    pub fn load_csv<P: AsRef<Path>>(&self, path: P, schema: Schema) -> Result<(Snapshot, StatusSummary)> {
        let reader = Reader::from_path(path)?;
        self.load(read_rows(reader, schema)?)
    }

    /// Load a dataset from any reader (e.g., string buffer, network stream)
    pub fn load_csv_from_reader<R: std::io::Read>(
        &self,
        reader: R,
        schema: Schema,
    ) -> Result<(Snapshot, StatusSummary)> {
        let csv_reader = Reader::from_reader(reader);
        self.load(read_rows(csv_reader, schema)?)
    }
}

fn is_consistent(value: &Value, var_type: VariableType) -> bool {
    match value {
        Value::Numeric(v) => var_type == VariableType::Numeric && v.is_finite(),
        other => other.value_type() == var_type,
    }
}

/// Convert CSV rows into raw records
///
/// Cells that do not parse as the declared type are kept as raw text so the
/// loader reports them as type-inconsistent instead of silently missing.
fn read_rows<R: std::io::Read>(mut reader: Reader<R>, schema: Schema) -> Result<RawDataset> {
    let headers = reader.headers()?.clone();

    let id_idx = headers
        .iter()
        .position(|h| h == ID_COLUMN)
        .ok_or_else(|| ProjectionError::data_integrity("CSV has no 'id' column"))?;
    let weight_idx = headers
        .iter()
        .position(|h| h == WEIGHT_COLUMN)
        .ok_or_else(|| ProjectionError::data_integrity("CSV has no 'weight' column"))?;

    let mut columns = Vec::new();
    for (idx, header) in headers.iter().enumerate() {
        if idx == id_idx || idx == weight_idx {
            continue;
        }
        let spec = schema.get(header).ok_or_else(|| {
            ProjectionError::data_integrity(format!("CSV column '{}' is not declared in the schema", header))
        })?;
        columns.push((idx, spec.name.clone(), spec.var_type));
    }

    let mut rows = Vec::new();
    for (line, result) in reader.records().enumerate() {
        let record = result?;
        // Header is line 1
        let row_number = line + 2;

        let id: u64 = record[id_idx].trim().parse().map_err(|_| {
            ProjectionError::data_integrity(format!("row {}: invalid id '{}'", row_number, &record[id_idx]))
        })?;
        let weight: f64 = record[weight_idx].trim().parse().map_err(|_| {
            ProjectionError::data_integrity(format!(
                "row {}: invalid weight '{}'",
                row_number, &record[weight_idx]
            ))
        })?;

        let mut raw = RawRecord::new(id, weight);
        for (idx, name, var_type) in &columns {
            let cell = record.get(*idx).unwrap_or("").trim();
            if cell.is_empty() {
                continue;
            }
            let value = Value::parse(cell, *var_type).unwrap_or_else(|| Value::Categorical(cell.to_string()));
            raw.values.insert(name.clone(), value);
        }
        rows.push(raw);
    }

    Ok(RawDataset { schema, rows })
}
