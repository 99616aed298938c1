//! Apply a year's growth factors to base-year records

use super::table::{GrowthFactor, GrowthFactorTable};
use crate::dataset::{Record, Schema, Value, VariableType};
use crate::error::{ProjectionError, Result};
use blake3::Hasher;
use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};

/// Settings threaded through every uprating call
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct UprateOptions {
    /// Basis mixed into every categorical draw seed
    pub seed_basis: u64,

    /// Substitute identity for missing numeric categories instead of failing
    pub allow_identity_defaults: bool,
}

/// Factor bound to one schema variable for a given year
#[derive(Debug, Clone, PartialEq)]
pub struct BoundFactor {
    pub variable: String,
    pub category: String,
    pub factor: GrowthFactor,
}

/// Resolve the factor for every uprated variable in the schema
///
/// Fails with `MissingFactor` on the first category the table cannot
/// satisfy, and with a configuration error when a factor kind does not fit
/// the variable's type.
pub fn bind_factors(schema: &Schema, table: &GrowthFactorTable, options: UprateOptions) -> Result<Vec<BoundFactor>> {
    let mut bound = Vec::new();

    for spec in schema.variables() {
        let Some(category) = spec.uprating.as_deref() else {
            continue;
        };

        let factor = match table.require(category) {
            Ok(factor) => factor.clone(),
            Err(err) => {
                if options.allow_identity_defaults && spec.var_type == VariableType::Numeric {
                    log::warn!(
                        "No growth factor for '{}' in {}; uprating '{}' by identity",
                        category,
                        table.year,
                        spec.name
                    );
                    GrowthFactor::identity()
                } else {
                    return Err(err);
                }
            }
        };
        factor.validate(category, table.year)?;

        let compatible = match spec.var_type {
            VariableType::Numeric => factor.is_numeric(),
            VariableType::Categorical => !factor.is_numeric(),
            VariableType::Boolean => false,
        };
        if !compatible {
            return Err(ProjectionError::config(format!(
                "growth factor for '{}' in {} cannot uprate {} variable '{}'",
                category,
                table.year,
                spec.var_type.as_str(),
                spec.name
            )));
        }

        bound.push(BoundFactor {
            variable: spec.name.clone(),
            category: category.to_string(),
            factor,
        });
    }

    Ok(bound)
}

/// Produce the uprated copy of a record for `year`
///
/// Missing values stay missing; the weight is carried over unchanged.
pub fn uprate_record(record: &Record, factors: &[BoundFactor], year: i32, options: UprateOptions) -> Record {
    let mut uprated = record.clone();

    for bound in factors {
        let Some(value) = uprated.values.get_mut(&bound.variable) else {
            continue;
        };

        match (&bound.factor, value) {
            (GrowthFactor::Multiplicative { factor }, Value::Numeric(v)) => *v *= factor,
            (GrowthFactor::Additive { delta }, Value::Numeric(v)) => *v += delta,
            (GrowthFactor::CategoricalShift { transitions }, Value::Categorical(current)) => {
                if let Some(row) = transitions.get(current.as_str()) {
                    let u = unit_draw(options.seed_basis, record.id, year, &bound.variable);
                    if let Some(next) = choose(row.iter().map(|(to, p)| (to.as_str(), *p)), u) {
                        *current = next.to_string();
                    }
                }
            }
            // Type mismatches are rejected by bind_factors
            _ => {}
        }
    }

    uprated
}

/// Seed for the draw on (record, year, variable)
pub fn draw_seed(seed_basis: u64, record_id: u64, year: i32, variable: &str) -> u64 {
    let mut hasher = Hasher::new();
    hasher.update(&seed_basis.to_le_bytes());
    hasher.update(&record_id.to_le_bytes());
    hasher.update(&year.to_le_bytes());
    hasher.update(variable.as_bytes());
    let hash = hasher.finalize();

    let mut bytes = [0u8; 8];
    bytes.copy_from_slice(&hash.as_bytes()[..8]);
    u64::from_le_bytes(bytes)
}

/// Uniform draw in [0, 1), reproducible for the same inputs
pub fn unit_draw(seed_basis: u64, record_id: u64, year: i32, variable: &str) -> f64 {
    let mut rng = StdRng::seed_from_u64(draw_seed(seed_basis, record_id, year, variable));
    rng.gen::<f64>()
}

/// Pick the outcome whose cumulative probability interval contains `u`
fn choose<'a>(outcomes: impl Iterator<Item = (&'a str, f64)>, u: f64) -> Option<&'a str> {
    let mut cumulative = 0.0;
    let mut last = None;
    for (outcome, probability) in outcomes {
        if probability <= 0.0 {
            continue;
        }
        cumulative += probability;
        last = Some(outcome);
        if u < cumulative {
            return Some(outcome);
        }
    }
    // Rounding can leave the total just under one
    last
}
