//! Budget-window projection: uprate, reweight and assemble each year's snapshot

use super::cancel::CancellationToken;
use super::config::{BudgetWindow, ProjectionConfig};
use super::window::{WindowJob, WindowProjection};
use crate::calibration::{CalibrationTarget, Reweighter, TargetsByYear};
use crate::dataset::{DataStatus, Snapshot};
use crate::error::{ProjectionError, Result};
use crate::growth::{bind_factors, uprate_record, GrowthFactorProvider};
use std::sync::Arc;

/// Orchestrates growth factors and reweighting across a budget window
///
/// # Example
/// ```ignore
/// let projector = BudgetWindowProjector::new(Arc::new(provider), ProjectionConfig::default());
/// let window = BudgetWindow::new(2022, 2027)?;
///
/// for snapshot in projector.project(base, window, targets)? {
///     let snapshot = snapshot?;
///     println!("{}: {:.0}", snapshot.year, snapshot.total_weight());
/// }
/// ```
#[derive(Clone)]
pub struct BudgetWindowProjector {
    provider: Arc<dyn GrowthFactorProvider>,
    config: ProjectionConfig,
}

impl BudgetWindowProjector {
    pub fn new(provider: Arc<dyn GrowthFactorProvider>, config: ProjectionConfig) -> Self {
        Self { provider, config }
    }

    pub fn config(&self) -> &ProjectionConfig {
        &self.config
    }

    pub fn provider(&self) -> &Arc<dyn GrowthFactorProvider> {
        &self.provider
    }

    /// Start a lazy projection of every year in the window
    ///
    /// Inputs are validated before any year starts. The returned iterator
    /// yields snapshots in ascending year order and stops after the first
    /// error.
    pub fn project(
        &self,
        base: Arc<Snapshot>,
        window: BudgetWindow,
        targets: TargetsByYear,
    ) -> Result<WindowProjection> {
        self.validate_inputs(&base, &targets)?;

        for year in targets.years().filter(|y| !window.contains(*y)) {
            log::debug!("Ignoring calibration targets for {} outside window {}-{}", year, window.start_year(), window.end_year());
        }

        log::info!(
            "Projecting {} record(s) from {} over {}-{} using '{}' factors ({} worker(s))",
            base.len(),
            base.year,
            window.start_year(),
            window.end_year(),
            self.provider.name(),
            self.config.concurrency
        );

        let job = WindowJob {
            base,
            provider: Arc::clone(&self.provider),
            config: self.config,
            targets,
        };
        WindowProjection::start(job, window)
    }

    /// Project a single year synchronously on the calling thread
    pub fn project_year(
        &self,
        base: &Snapshot,
        year: i32,
        targets: &[CalibrationTarget],
        cancel: &CancellationToken,
    ) -> Result<Snapshot> {
        self.config.validate()?;
        ensure_usable_base(base)?;
        compute_year(base, self.provider.as_ref(), &self.config, year, targets, cancel)
    }

    fn validate_inputs(&self, base: &Snapshot, targets: &TargetsByYear) -> Result<()> {
        self.config.validate()?;
        ensure_usable_base(base)?;
        targets.validate()
    }
}

fn ensure_usable_base(base: &Snapshot) -> Result<()> {
    if base.status == DataStatus::Invalid {
        return Err(ProjectionError::data_integrity(format!(
            "base snapshot for {} is INVALID and cannot be projected",
            base.year
        )));
    }
    if base.is_empty() {
        return Err(ProjectionError::data_integrity("base snapshot has no records"));
    }
    Ok(())
}

/// Build the calibrated snapshot for one year from the immutable base
///
/// Steps: copy and uprate the base records with the year's factors, reweight
/// to the year's targets, then tag the status as the worse of the base
/// status and any calibration flag. A calibration that misses tolerance is
/// an error unless partial results are enabled.
pub(crate) fn compute_year(
    base: &Snapshot,
    provider: &dyn GrowthFactorProvider,
    config: &ProjectionConfig,
    year: i32,
    targets: &[CalibrationTarget],
    cancel: &CancellationToken,
) -> Result<Snapshot> {
    if cancel.is_cancelled() {
        return Err(ProjectionError::Cancelled { year });
    }

    let options = config.uprate_options();
    let table = provider.factors_for(year)?;
    let factors = bind_factors(&base.schema, &table, options)?;

    let mut records: Vec<_> = base
        .records
        .iter()
        .map(|record| uprate_record(record, &factors, year, options))
        .collect();

    let calibration = Reweighter::new(config.reweight).calibrate(&records, year, targets, cancel)?;
    let calibration = if config.partial_results {
        if !calibration.converged {
            log::warn!(
                "Year {}: calibration missed tolerance (max error {:.3e}); keeping best-effort weights",
                year,
                calibration.max_error()
            );
        }
        calibration
    } else {
        calibration.into_result(year)?
    };

    for (record, weight) in records.iter_mut().zip(&calibration.weights) {
        record.weight = *weight;
    }

    let report = calibration.report();
    let status = base.status.worse(report.status());

    let mut snapshot = Snapshot::new(year, Arc::clone(&base.schema), records, status);
    snapshot.calibration = Some(report);
    Ok(snapshot)
}
