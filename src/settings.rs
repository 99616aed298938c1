//! JSON run settings for a window projection
//!
//! ```json
//! {
//!   "base_year": 2022,
//!   "window": {"start_year": 2022, "end_year": 2027},
//!   "max_workers": 7,
//!   "projection": {"partial_results": false, "reweight": {"max_iterations": 20}},
//!   "factors": {"csv": {"path": "growth_factors.csv"}},
//!   "targets": {"2023": [{"name": "total population", "value": 67000000}]}
//! }
//! ```

use crate::calibration::TargetsByYear;
use crate::error::Result;
use crate::growth::{
    load_growth_factors, FactorEntry, GrowthFactorProvider, IndexedFactorProvider, StaticFactorProvider,
};
use crate::projection::{BudgetWindow, ProjectionConfig};
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::sync::Arc;

/// Where growth factors come from, selected by configuration
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FactorSource {
    /// CSV file in the `growth_factors.csv` layout
    Csv { path: PathBuf },
    /// Year-on-year growth rates compounded from a base year
    Indexed(IndexedFactorProvider),
    /// Explicit (category, year) entries inline
    Table {
        #[serde(default = "default_table_name")]
        name: String,
        entries: Vec<FactorEntry>,
    },
}

fn default_table_name() -> String {
    "table".to_string()
}

impl FactorSource {
    /// Build the provider; relative CSV paths resolve against `root`
    pub fn build(&self, root: Option<&Path>) -> Result<Arc<dyn GrowthFactorProvider>> {
        Ok(match self {
            FactorSource::Csv { path } => {
                let path = match root {
                    Some(root) if path.is_relative() => root.join(path),
                    _ => path.clone(),
                };
                Arc::new(load_growth_factors(path)?)
            }
            FactorSource::Indexed(provider) => Arc::new(provider.clone()),
            FactorSource::Table { name, entries } => {
                Arc::new(StaticFactorProvider::from_entries(name, entries.clone())?)
            }
        })
    }
}

/// Complete configuration for one projection run
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RunSettings {
    /// Year the input microdata describes
    pub base_year: i32,

    pub window: BudgetWindow,

    /// Upper bound on worker threads, applied on top of `projection.concurrency`
    #[serde(default)]
    pub max_workers: Option<usize>,

    #[serde(default)]
    pub projection: ProjectionConfig,

    pub factors: FactorSource,

    #[serde(default)]
    pub targets: TargetsByYear,

    /// Directory relative paths resolve against (the settings file's directory)
    #[serde(skip)]
    pub root: Option<PathBuf>,
}

impl RunSettings {
    /// Load settings from a JSON file
    pub fn from_json_path<P: AsRef<Path>>(path: P) -> Result<Self> {
        let path = path.as_ref();
        let file = std::fs::File::open(path)?;
        let mut settings: RunSettings = serde_json::from_reader(std::io::BufReader::new(file))?;
        settings.root = path.parent().map(Path::to_path_buf);
        settings.validate()?;
        Ok(settings)
    }

    pub fn from_json_str(json: &str) -> Result<Self> {
        let settings: RunSettings = serde_json::from_str(json)?;
        settings.validate()?;
        Ok(settings)
    }

    pub fn validate(&self) -> Result<()> {
        self.projection_config().validate()?;
        self.targets.validate()
    }

    /// Projection options with the worker cap applied
    pub fn projection_config(&self) -> ProjectionConfig {
        let mut config = self.projection;
        if let Some(cap) = self.max_workers {
            config.concurrency = config.concurrency.min(cap.max(1));
        }
        config
    }

    pub fn provider(&self) -> Result<Arc<dyn GrowthFactorProvider>> {
        self.factors.build(self.root.as_deref())
    }
}
