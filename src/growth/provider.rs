//! Pluggable growth-factor sources

use super::table::{GrowthFactor, GrowthFactorTable};
use crate::error::{ProjectionError, Result};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

/// Capability to supply growth factors for a projected year
///
/// Implementations must be deterministic: the same year always yields the
/// same table. Lookups that cannot be satisfied surface as
/// [`ProjectionError::MissingFactor`] via [`GrowthFactorTable::require`],
/// never as an identity factor.
pub trait GrowthFactorProvider: Send + Sync {
    /// All factors defined for `year`, cumulative from the base year
    fn factors_for(&self, year: i32) -> Result<GrowthFactorTable>;

    /// Short label used in logs and reports
    fn name(&self) -> &str;
}

/// One (category, year) factor in a flat configuration list
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FactorEntry {
    pub category: String,
    pub year: i32,
    #[serde(flatten)]
    pub factor: GrowthFactor,
}

/// Explicit factors keyed by year and category (hardcoded or file-backed)
#[derive(Debug, Clone, Default, PartialEq)]
pub struct StaticFactorProvider {
    name: String,
    by_year: BTreeMap<i32, BTreeMap<String, GrowthFactor>>,
}

impl StaticFactorProvider {
    pub fn new(name: &str) -> Self {
        Self {
            name: name.to_string(),
            by_year: BTreeMap::new(),
        }
    }

    pub fn insert(&mut self, category: &str, year: i32, factor: GrowthFactor) {
        self.by_year
            .entry(year)
            .or_default()
            .insert(category.to_string(), factor);
    }

    pub fn with(mut self, category: &str, year: i32, factor: GrowthFactor) -> Self {
        self.insert(category, year, factor);
        self
    }

    /// Build from a flat list; a repeated (category, year) pair is a configuration error
    pub fn from_entries(name: &str, entries: Vec<FactorEntry>) -> Result<Self> {
        let mut provider = Self::new(name);
        for entry in entries {
            if provider.get(&entry.category, entry.year).is_some() {
                return Err(ProjectionError::config(format!(
                    "growth factor for '{}' in {} defined more than once",
                    entry.category, entry.year
                )));
            }
            entry.factor.validate(&entry.category, entry.year)?;
            provider.insert(&entry.category, entry.year, entry.factor);
        }
        Ok(provider)
    }

    pub fn get(&self, category: &str, year: i32) -> Option<&GrowthFactor> {
        self.by_year.get(&year).and_then(|factors| factors.get(category))
    }

    /// Years with at least one factor defined
    pub fn years(&self) -> impl Iterator<Item = i32> + '_ {
        self.by_year.keys().copied()
    }
}

impl GrowthFactorProvider for StaticFactorProvider {
    fn factors_for(&self, year: i32) -> Result<GrowthFactorTable> {
        let mut table = GrowthFactorTable::new(year);
        if let Some(factors) = self.by_year.get(&year) {
            for (category, factor) in factors {
                table.insert(category, factor.clone());
            }
        }
        table.validate()?;
        Ok(table)
    }

    fn name(&self) -> &str {
        &self.name
    }
}

/// Multiplicative factors compounded from year-on-year growth rates
///
/// `rates[category][y]` is the growth from year `y - 1` to `y`. The base year
/// maps to 1.0; a year whose chain back to the base year has a gap, or that
/// precedes the base year, has no factor for that category.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct IndexedFactorProvider {
    #[serde(default = "default_indexed_name")]
    name: String,
    base_year: i32,
    rates: BTreeMap<String, BTreeMap<i32, f64>>,
}

fn default_indexed_name() -> String {
    "indexed".to_string()
}

impl IndexedFactorProvider {
    pub fn new(base_year: i32) -> Self {
        Self {
            name: default_indexed_name(),
            base_year,
            rates: BTreeMap::new(),
        }
    }

    pub fn with_rate(mut self, category: &str, year: i32, rate: f64) -> Self {
        self.rates
            .entry(category.to_string())
            .or_default()
            .insert(year, rate);
        self
    }

    /// Same rate for every year in `first..=last`
    pub fn with_constant_rate(mut self, category: &str, first: i32, last: i32, rate: f64) -> Self {
        for year in first..=last {
            self = self.with_rate(category, year, rate);
        }
        self
    }

    pub fn base_year(&self) -> i32 {
        self.base_year
    }

    fn cumulative(&self, rates: &BTreeMap<i32, f64>, year: i32) -> Option<f64> {
        if year < self.base_year {
            return None;
        }
        let mut index = 1.0;
        for y in (self.base_year + 1)..=year {
            index *= 1.0 + rates.get(&y)?;
        }
        Some(index)
    }
}

impl GrowthFactorProvider for IndexedFactorProvider {
    fn factors_for(&self, year: i32) -> Result<GrowthFactorTable> {
        let mut table = GrowthFactorTable::new(year);
        for (category, rates) in &self.rates {
            if let Some(factor) = self.cumulative(rates, year) {
                table.insert(category, GrowthFactor::Multiplicative { factor });
            }
        }
        table.validate()?;
        Ok(table)
    }

    fn name(&self) -> &str {
        &self.name
    }
}
