//! Scenario runner for repeated window projections
//!
//! Holds the loaded base snapshot once, then runs many projections with
//! different growth-factor sources or options without reloading microdata.
//! A reform can be compared against a baseline as percentage changes in
//! weighted aggregates per year.

use crate::calibration::TargetsByYear;
use crate::dataset::{Snapshot, VariableType};
use crate::error::{ProjectionError, Result};
use crate::growth::GrowthFactorProvider;
use crate::projection::{BudgetWindow, BudgetWindowProjector, ProjectionConfig, WindowOutcome};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::io;
use std::sync::Arc;

/// Aggregate name used for the sum of weights in comparisons
pub const TOTAL_WEIGHT: &str = "total_weight";

/// One named variant to project (e.g. baseline and reform uprating)
#[derive(Clone)]
pub struct Scenario {
    pub name: String,
    pub provider: Arc<dyn GrowthFactorProvider>,
    pub config: ProjectionConfig,
}

impl Scenario {
    pub fn new(name: &str, provider: Arc<dyn GrowthFactorProvider>, config: ProjectionConfig) -> Self {
        Self {
            name: name.to_string(),
            provider,
            config,
        }
    }
}

/// Result of one scenario
#[derive(Debug)]
pub struct ScenarioOutcome {
    pub name: String,
    pub outcome: WindowOutcome,
}

/// Change in one weighted aggregate for one year
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AggregateChange {
    pub year: i32,
    pub aggregate: String,
    pub baseline: f64,
    pub reform: f64,
    /// Percentage difference from the baseline; empty when the baseline is zero
    pub pct_diff: Option<f64>,
}

impl AggregateChange {
    fn new(year: i32, aggregate: &str, baseline: f64, reform: f64) -> Self {
        let pct_diff = (baseline != 0.0).then(|| (reform - baseline) / baseline * 100.0);
        Self {
            year,
            aggregate: aggregate.to_string(),
            baseline,
            reform,
            pct_diff,
        }
    }
}

/// Baseline-versus-reform table over the years both scenarios produced
#[derive(Debug, Clone, PartialEq)]
pub struct ScenarioComparison {
    pub baseline: String,
    pub reform: String,
    pub changes: Vec<AggregateChange>,
}

impl ScenarioComparison {
    /// Compare total weight and the weighted sum of each numeric `variable`
    ///
    /// Years produced by only one of the two scenarios are skipped.
    pub fn between(baseline: &ScenarioOutcome, reform: &ScenarioOutcome, variables: &[String]) -> Result<Self> {
        if let Some(first) = baseline.outcome.snapshots.first() {
            for variable in variables {
                match first.schema.get(variable) {
                    Some(spec) if spec.var_type == VariableType::Numeric => {}
                    _ => {
                        return Err(ProjectionError::config(format!(
                            "cannot compare '{}': not a numeric variable",
                            variable
                        )))
                    }
                }
            }
        }

        let reform_years: BTreeMap<i32, &Snapshot> =
            reform.outcome.snapshots.iter().map(|s| (s.year, s)).collect();

        let mut changes = Vec::new();
        for base in &baseline.outcome.snapshots {
            let Some(other) = reform_years.get(&base.year) else {
                log::debug!("Year {} missing from '{}', not compared", base.year, reform.name);
                continue;
            };
            changes.push(AggregateChange::new(
                base.year,
                TOTAL_WEIGHT,
                base.total_weight(),
                other.total_weight(),
            ));
            for variable in variables {
                changes.push(AggregateChange::new(
                    base.year,
                    variable,
                    base.weighted_sum(variable),
                    other.weighted_sum(variable),
                ));
            }
        }

        Ok(Self {
            baseline: baseline.name.clone(),
            reform: reform.name.clone(),
            changes,
        })
    }

    pub fn get(&self, year: i32, aggregate: &str) -> Option<&AggregateChange> {
        self.changes
            .iter()
            .find(|c| c.year == year && c.aggregate == aggregate)
    }

    pub fn years(&self) -> Vec<i32> {
        let mut years: Vec<i32> = self.changes.iter().map(|c| c.year).collect();
        years.dedup();
        years
    }

    /// One CSV row per (year, aggregate)
    pub fn write_csv<W: io::Write>(&self, writer: W) -> Result<()> {
        let mut writer = csv::Writer::from_writer(writer);
        for change in &self.changes {
            writer.serialize(change)?;
        }
        writer.flush()?;
        Ok(())
    }
}

/// Pre-loaded runner sharing one immutable base snapshot across projections
///
/// # Example
/// ```ignore
/// let runner = WindowRunner::new(base, window, targets);
///
/// let baseline = Scenario::new("baseline", Arc::new(obr_factors), config);
/// let reform = Scenario::new("reform", Arc::new(reform_factors), config);
/// for result in runner.run_scenarios(&[baseline, reform]) {
///     println!("{}: {}", result.name, result.outcome.report.status);
/// }
/// ```
#[derive(Debug, Clone)]
pub struct WindowRunner {
    base: Arc<Snapshot>,
    window: BudgetWindow,
    targets: TargetsByYear,
}

impl WindowRunner {
    pub fn new(base: Arc<Snapshot>, window: BudgetWindow, targets: TargetsByYear) -> Self {
        Self { base, window, targets }
    }

    /// Run a single projection, failing on the first error
    pub fn run(&self, provider: Arc<dyn GrowthFactorProvider>, config: ProjectionConfig) -> Result<Vec<Snapshot>> {
        BudgetWindowProjector::new(provider, config)
            .project(Arc::clone(&self.base), self.window, self.targets.clone())?
            .collect_all()
    }

    /// Run one scenario to the end, keeping everything produced before a failure
    pub fn run_scenario(&self, scenario: &Scenario) -> Result<ScenarioOutcome> {
        let outcome = BudgetWindowProjector::new(Arc::clone(&scenario.provider), scenario.config)
            .project(Arc::clone(&self.base), self.window, self.targets.clone())?
            .finish();
        Ok(ScenarioOutcome {
            name: scenario.name.clone(),
            outcome,
        })
    }

    /// Run multiple scenarios against the same base
    pub fn run_scenarios(&self, scenarios: &[Scenario]) -> Vec<Result<ScenarioOutcome>> {
        scenarios.iter().map(|s| self.run_scenario(s)).collect()
    }

    /// Run a baseline and a reform and compare them year by year
    ///
    /// Either scenario failing part-way is an error.
    pub fn compare(&self, baseline: &Scenario, reform: &Scenario, variables: &[String]) -> Result<ScenarioComparison> {
        let mut base = self.run_scenario(baseline)?;
        if let Some(e) = base.outcome.error.take() {
            return Err(e);
        }
        let mut other = self.run_scenario(reform)?;
        if let Some(e) = other.outcome.error.take() {
            return Err(e);
        }
        ScenarioComparison::between(&base, &other, variables)
    }

    pub fn base(&self) -> &Snapshot {
        &self.base
    }

    pub fn window(&self) -> BudgetWindow {
        self.window
    }

    /// Targets for inspection or modification between runs
    pub fn targets_mut(&mut self) -> &mut TargetsByYear {
        &mut self.targets
    }
}
