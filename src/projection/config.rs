//! Window bounds and projection options

use crate::calibration::ReweightConfig;
use crate::error::{ProjectionError, Result};
use crate::growth::UprateOptions;
use serde::{Deserialize, Serialize};

/// Inclusive range of projected years
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(try_from = "RawWindow")]
pub struct BudgetWindow {
    start_year: i32,
    end_year: i32,
}

#[derive(Deserialize)]
struct RawWindow {
    start_year: i32,
    end_year: i32,
}

impl TryFrom<RawWindow> for BudgetWindow {
    type Error = ProjectionError;

    fn try_from(raw: RawWindow) -> Result<Self> {
        BudgetWindow::new(raw.start_year, raw.end_year)
    }
}

impl BudgetWindow {
    pub fn new(start_year: i32, end_year: i32) -> Result<Self> {
        if start_year > end_year {
            return Err(ProjectionError::InvalidWindow { start_year, end_year });
        }
        Ok(Self { start_year, end_year })
    }

    pub fn start_year(&self) -> i32 {
        self.start_year
    }

    pub fn end_year(&self) -> i32 {
        self.end_year
    }

    /// Years in ascending order
    pub fn years(&self) -> std::ops::RangeInclusive<i32> {
        self.start_year..=self.end_year
    }

    pub fn len(&self) -> usize {
        let span = i64::from(self.end_year) - i64::from(self.start_year);
        usize::try_from(span + 1).unwrap_or(usize::MAX)
    }

    pub fn is_empty(&self) -> bool {
        false
    }

    pub fn contains(&self, year: i32) -> bool {
        self.years().contains(&year)
    }
}

/// Options for a window projection
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct ProjectionConfig {
    /// Maximum number of years computed at once
    #[serde(default = "default_concurrency")]
    pub concurrency: usize,

    /// Emit best-effort snapshots for years that fail to calibrate
    #[serde(default)]
    pub partial_results: bool,

    /// Basis for every categorical draw
    #[serde(default)]
    pub seed_basis: u64,

    /// Uprate by identity when a numeric category has no factor
    #[serde(default)]
    pub allow_identity_defaults: bool,

    #[serde(default)]
    pub reweight: ReweightConfig,
}

/// Number of available cores, falling back to one
pub fn default_concurrency() -> usize {
    std::thread::available_parallelism()
        .map(|n| n.get())
        .unwrap_or(1)
}

impl Default for ProjectionConfig {
    fn default() -> Self {
        Self {
            concurrency: default_concurrency(),
            partial_results: false,
            seed_basis: 0,
            allow_identity_defaults: false,
            reweight: ReweightConfig::default(),
        }
    }
}

impl ProjectionConfig {
    pub fn uprate_options(&self) -> UprateOptions {
        UprateOptions {
            seed_basis: self.seed_basis,
            allow_identity_defaults: self.allow_identity_defaults,
        }
    }

    pub fn validate(&self) -> Result<()> {
        if self.concurrency == 0 {
            return Err(ProjectionError::config("concurrency must be at least 1"));
        }
        self.reweight.validate()
    }
}
