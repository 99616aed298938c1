//! Growth factors for one projected year

use crate::error::{ProjectionError, Result};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

/// Tolerance for transition probabilities summing to one
const PROBABILITY_TOLERANCE: f64 = 1e-9;

/// Uprating rule for one variable category, cumulative from the base year
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum GrowthFactor {
    /// value' = value * factor
    Multiplicative { factor: f64 },

    /// value' = value + delta
    Additive { delta: f64 },

    /// Probabilistic reassignment of a categorical value
    ///
    /// `transitions[from][to]` is the probability that a record in `from`
    /// moves to `to`. Categories with no row keep their value.
    CategoricalShift {
        transitions: BTreeMap<String, BTreeMap<String, f64>>,
    },
}

impl GrowthFactor {
    pub fn identity() -> Self {
        GrowthFactor::Multiplicative { factor: 1.0 }
    }

    pub fn is_numeric(&self) -> bool {
        !matches!(self, GrowthFactor::CategoricalShift { .. })
    }

    /// Check factor values are finite and shift rows are distributions
    pub fn validate(&self, category: &str, year: i32) -> Result<()> {
        match self {
            GrowthFactor::Multiplicative { factor } if !factor.is_finite() || *factor < 0.0 => {
                Err(ProjectionError::config(format!(
                    "multiplicative factor for '{}' in {} must be finite and non-negative, got {}",
                    category, year, factor
                )))
            }
            GrowthFactor::Additive { delta } if !delta.is_finite() => Err(ProjectionError::config(
                format!("additive factor for '{}' in {} is not finite", category, year),
            )),
            GrowthFactor::CategoricalShift { transitions } => {
                for (from, row) in transitions {
                    if row.values().any(|p| !p.is_finite() || *p < 0.0) {
                        return Err(ProjectionError::config(format!(
                            "shift '{}' in {}: transition probabilities from '{}' must be non-negative",
                            category, year, from
                        )));
                    }
                    let total: f64 = row.values().sum();
                    if (total - 1.0).abs() > PROBABILITY_TOLERANCE {
                        return Err(ProjectionError::config(format!(
                            "shift '{}' in {}: transitions from '{}' sum to {}, expected 1",
                            category, year, from, total
                        )));
                    }
                }
                Ok(())
            }
            _ => Ok(()),
        }
    }
}

/// All growth factors for a single year, keyed by variable category
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct GrowthFactorTable {
    pub year: i32,
    factors: BTreeMap<String, GrowthFactor>,
}

impl GrowthFactorTable {
    pub fn new(year: i32) -> Self {
        Self {
            year,
            factors: BTreeMap::new(),
        }
    }

    pub fn insert(&mut self, category: &str, factor: GrowthFactor) {
        self.factors.insert(category.to_string(), factor);
    }

    pub fn with(mut self, category: &str, factor: GrowthFactor) -> Self {
        self.insert(category, factor);
        self
    }

    pub fn get(&self, category: &str) -> Option<&GrowthFactor> {
        self.factors.get(category)
    }

    /// Look up a category, failing with the exact missing (category, year) pair
    pub fn require(&self, category: &str) -> Result<&GrowthFactor> {
        self.factors.get(category).ok_or_else(|| ProjectionError::MissingFactor {
            category: category.to_string(),
            year: self.year,
        })
    }

    pub fn categories(&self) -> impl Iterator<Item = &str> {
        self.factors.keys().map(String::as_str)
    }

    pub fn len(&self) -> usize {
        self.factors.len()
    }

    pub fn is_empty(&self) -> bool {
        self.factors.is_empty()
    }

    pub fn validate(&self) -> Result<()> {
        for (category, factor) in &self.factors {
            factor.validate(category, self.year)?;
        }
        Ok(())
    }
}
