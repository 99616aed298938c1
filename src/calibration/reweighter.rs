//! Iterative proportional fitting of record weights to calibration targets

use super::target::CalibrationTarget;
use crate::dataset::{CalibrationReport, Record, Snapshot};
use crate::error::{ProjectionError, Result, TargetError};
use crate::projection::CancellationToken;
use serde::{Deserialize, Serialize};
use std::collections::BTreeSet;

/// Settings for the fixed-point loop
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct ReweightConfig {
    /// Maximum number of full sweeps over the targets
    #[serde(default = "default_max_iterations")]
    pub max_iterations: u32,

    /// Relative error every target must reach
    #[serde(default = "default_tolerance")]
    pub tolerance: f64,

    /// Smallest weight a record may carry
    #[serde(default = "default_weight_floor")]
    pub weight_floor: f64,
}

fn default_max_iterations() -> u32 {
    20
}

fn default_tolerance() -> f64 {
    1e-6
}

fn default_weight_floor() -> f64 {
    1e-9
}

impl Default for ReweightConfig {
    fn default() -> Self {
        Self {
            max_iterations: default_max_iterations(),
            tolerance: default_tolerance(),
            weight_floor: default_weight_floor(),
        }
    }
}

impl ReweightConfig {
    pub fn validate(&self) -> Result<()> {
        if self.max_iterations == 0 {
            return Err(ProjectionError::config("max_iterations must be at least 1"));
        }
        if !(self.tolerance.is_finite() && self.tolerance > 0.0) {
            return Err(ProjectionError::config("tolerance must be a positive number"));
        }
        if !(self.weight_floor.is_finite() && self.weight_floor > 0.0) {
            return Err(ProjectionError::config("weight_floor must be a positive number"));
        }
        Ok(())
    }
}

/// Best-effort result of a calibration run
#[derive(Debug, Clone, PartialEq)]
pub struct Calibration {
    /// New weights aligned to the input records
    pub weights: Vec<f64>,
    pub iterations: u32,
    pub converged: bool,
    pub errors: Vec<TargetError>,
    /// Ids of records clamped to the weight floor
    pub clamped: Vec<u64>,
}

impl Calibration {
    pub fn max_error(&self) -> f64 {
        self.errors.iter().map(|e| e.relative_error).fold(0.0, f64::max)
    }

    pub fn report(&self) -> CalibrationReport {
        CalibrationReport {
            iterations: self.iterations,
            converged: self.converged,
            errors: self.errors.clone(),
            clamped: self.clamped.clone(),
        }
    }

    /// Convert a non-converged result into the corresponding error
    pub fn into_result(self, year: i32) -> Result<Calibration> {
        if self.converged {
            Ok(self)
        } else {
            Err(ProjectionError::CalibrationNonconvergence {
                year,
                iterations: self.iterations,
                errors: self.errors,
            })
        }
    }
}

/// Adjusts per-record weights so weighted aggregates match external totals
#[derive(Debug, Clone, Copy, Default)]
pub struct Reweighter {
    config: ReweightConfig,
}

impl Reweighter {
    pub fn new(config: ReweightConfig) -> Self {
        Self { config }
    }

    pub fn config(&self) -> &ReweightConfig {
        &self.config
    }

    /// Calibrate a snapshot's weights, failing if the tolerance is not met
    pub fn reweight(
        &self,
        snapshot: &Snapshot,
        year: i32,
        targets: &[CalibrationTarget],
        cancel: &CancellationToken,
    ) -> Result<Calibration> {
        self.calibrate(&snapshot.records, year, targets, cancel)?
            .into_result(year)
    }

    /// Run the fixed-point loop and return the best-effort weights
    ///
    /// Each sweep scales the contributing records of every target by
    /// `target / achieved`. With several targets, weights are then rescaled
    /// globally to the population total if exactly one such target is given.
    /// Only cancellation and invalid targets are errors here; non-convergence
    /// is reported through [`Calibration::converged`].
    pub fn calibrate(
        &self,
        records: &[Record],
        year: i32,
        targets: &[CalibrationTarget],
        cancel: &CancellationToken,
    ) -> Result<Calibration> {
        self.config.validate()?;
        for target in targets {
            target.validate(year)?;
        }

        let floor = self.config.weight_floor;
        let mut clamped = BTreeSet::new();
        let mut weights: Vec<f64> = records.iter().map(|r| r.weight).collect();
        clamp_weights(records, &mut weights, floor, &mut clamped);

        // contributions[t][i]: per-unit-weight contribution of record i to target t
        let contributions: Vec<Vec<Option<f64>>> = targets
            .iter()
            .map(|t| records.iter().map(|r| t.contribution(r)).collect())
            .collect();

        let population = if targets.len() > 1 {
            let mut totals = targets.iter().filter(|t| t.is_population_total());
            match (totals.next(), totals.next()) {
                (Some(total), None) => Some(total.value),
                _ => None,
            }
        } else {
            None
        };

        let mut errors = measure(targets, &contributions, &weights, floor);
        let mut iterations = 0;
        let mut converged = within_tolerance(&errors, self.config.tolerance);

        while !converged && iterations < self.config.max_iterations {
            if cancel.is_cancelled() {
                return Err(ProjectionError::Cancelled { year });
            }
            iterations += 1;

            for (target, contribution) in targets.iter().zip(&contributions) {
                let achieved = weighted(contribution, &weights);
                if !(achieved.is_finite() && achieved > 0.0) {
                    // Nothing to scale; left to the convergence check
                    continue;
                }
                let ratio = target.value / achieved;
                for (w, c) in weights.iter_mut().zip(contribution) {
                    if c.is_some() {
                        *w *= ratio;
                    }
                }
            }

            if let Some(total_target) = population {
                let total: f64 = weights.iter().sum();
                if total.is_finite() && total > 0.0 {
                    let scale = total_target / total;
                    weights.iter_mut().for_each(|w| *w *= scale);
                }
            }

            clamp_weights(records, &mut weights, floor, &mut clamped);
            errors = measure(targets, &contributions, &weights, floor);
            converged = within_tolerance(&errors, self.config.tolerance);
        }

        if !clamped.is_empty() {
            log::warn!(
                "Year {}: {} record weight(s) clamped to floor {:e}",
                year,
                clamped.len(),
                floor
            );
        }
        log::debug!(
            "Year {}: calibration {} after {} iteration(s) across {} target(s)",
            year,
            if converged { "converged" } else { "did not converge" },
            iterations,
            targets.len()
        );

        Ok(Calibration {
            weights,
            iterations,
            converged,
            errors,
            clamped: clamped.into_iter().collect(),
        })
    }
}

fn weighted(contribution: &[Option<f64>], weights: &[f64]) -> f64 {
    contribution
        .iter()
        .zip(weights)
        .filter_map(|(c, w)| c.map(|c| c * w))
        .sum()
}

fn measure(
    targets: &[CalibrationTarget],
    contributions: &[Vec<Option<f64>>],
    weights: &[f64],
    floor: f64,
) -> Vec<TargetError> {
    targets
        .iter()
        .zip(contributions)
        .map(|(target, contribution)| {
            let achieved = weighted(contribution, weights);
            // A zero target is as met as it can be once every contributor sits at the floor
            let relative_error = if target.value == 0.0 && at_floor(contribution, weights, floor) {
                0.0
            } else {
                target.relative_error(achieved)
            };
            TargetError {
                name: target.name.clone(),
                target: target.value,
                achieved,
                relative_error,
            }
        })
        .collect()
}

fn at_floor(contribution: &[Option<f64>], weights: &[f64], floor: f64) -> bool {
    contribution
        .iter()
        .zip(weights)
        .all(|(c, w)| c.map_or(true, |c| c == 0.0) || *w <= floor)
}

fn within_tolerance(errors: &[TargetError], tolerance: f64) -> bool {
    errors
        .iter()
        .all(|e| e.relative_error.is_finite() && e.relative_error <= tolerance)
}

fn clamp_weights(records: &[Record], weights: &mut [f64], floor: f64, clamped: &mut BTreeSet<u64>) {
    for (record, w) in records.iter().zip(weights.iter_mut()) {
        if !w.is_finite() || *w < floor {
            *w = floor;
            clamped.insert(record.id);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::calibration::{Aggregate, RecordFilter};
    use crate::dataset::Value;
    use approx::assert_relative_eq;

    fn records(weights: &[f64]) -> Vec<Record> {
        weights
            .iter()
            .enumerate()
            .map(|(i, w)| {
                let region = if i % 2 == 0 { "north" } else { "south" };
                Record::new(i as u64 + 1, *w)
                    .with("region", Value::Categorical(region.into()))
                    .with("income", Value::Numeric(1000.0 * (i as f64 + 1.0)))
            })
            .collect()
    }

    fn region(name: &str, value: f64) -> CalibrationTarget {
        CalibrationTarget::new(
            name,
            value,
            Aggregate::Count,
            RecordFilter::Equals { variable: "region".into(), value: name.into() },
        )
    }

    #[test]
    fn test_uniform_scaling_to_population_total() {
        let recs = records(&[10.0, 20.0, 30.0]);
        let result = Reweighter::default()
            .calibrate(&recs, 2023, &[CalibrationTarget::population(90.0)], &CancellationToken::new())
            .unwrap();

        assert!(result.converged);
        assert!(result.iterations <= 20);
        assert_relative_eq!(result.weights[0], 15.0, max_relative = 1e-6);
        assert_relative_eq!(result.weights[1], 30.0, max_relative = 1e-6);
        assert_relative_eq!(result.weights[2], 45.0, max_relative = 1e-6);
        assert!(result.clamped.is_empty());
    }

    #[test]
    fn test_raking_crossed_margins() {
        // north/south crossed with employed/not employed
        let recs: Vec<Record> = [("north", true, 10.0), ("south", true, 20.0), ("north", false, 30.0), ("south", false, 40.0)]
            .iter()
            .enumerate()
            .map(|(i, (region, employed, w))| {
                Record::new(i as u64 + 1, *w)
                    .with("region", Value::Categorical(region.to_string()))
                    .with("employed", Value::Boolean(*employed))
            })
            .collect();
        let employed = CalibrationTarget::new(
            "employed",
            70.0,
            Aggregate::Count,
            RecordFilter::IsTrue { variable: "employed".into() },
        );
        let targets = vec![CalibrationTarget::population(120.0), region("north", 60.0), employed];

        let reweighter = Reweighter::new(ReweightConfig {
            max_iterations: 500,
            ..Default::default()
        });
        let result = reweighter
            .calibrate(&recs, 2024, &targets, &CancellationToken::new())
            .unwrap();
        assert!(result.converged, "errors: {:?}", result.errors);

        for target in &targets {
            let achieved = target.evaluate(&recs, &result.weights);
            assert!(target.relative_error(achieved) <= 1e-6, "{} achieved {}", target.name, achieved);
        }
        assert!(result.weights.iter().all(|w| *w > 0.0));
    }

    #[test]
    fn test_sum_target_scales_contributors_only() {
        let recs = records(&[10.0, 20.0, 30.0]);
        let north_income = CalibrationTarget::new(
            "north income",
            50_000.0,
            Aggregate::Sum { variable: "income".into() },
            RecordFilter::Equals { variable: "region".into(), value: "north".into() },
        );
        let result = Reweighter::default()
            .calibrate(&recs, 2024, &[north_income], &CancellationToken::new())
            .unwrap();

        assert!(result.converged);
        assert_relative_eq!(result.weights[0], 5.0, max_relative = 1e-9);
        assert_relative_eq!(result.weights[1], 20.0);
        assert_relative_eq!(result.weights[2], 15.0, max_relative = 1e-9);
    }

    #[test]
    fn test_unreachable_target_fails_with_errors() {
        // Nobody lives in the west, so its target cannot be met
        let recs = records(&[10.0, 20.0]);
        let targets = vec![region("north", 15.0), region("west", 5.0)];
        let calibration = Reweighter::default()
            .calibrate(&recs, 2025, &targets, &CancellationToken::new())
            .unwrap();
        assert!(!calibration.converged);
        assert_eq!(calibration.iterations, 20);

        let err = calibration.into_result(2025).unwrap_err();
        match err {
            ProjectionError::CalibrationNonconvergence { year, errors, iterations } => {
                assert_eq!(year, 2025);
                assert_eq!(iterations, 20);
                let west = errors.iter().find(|e| e.name == "west").unwrap();
                assert_relative_eq!(west.relative_error, 1.0);
            }
            other => panic!("expected nonconvergence, got {:?}", other),
        }
    }

    #[test]
    fn test_zero_target_clamps_to_floor() {
        let recs = records(&[10.0, 20.0, 30.0]);
        let config = ReweightConfig {
            tolerance: 1e-6,
            weight_floor: 1e-12,
            ..Default::default()
        };
        let result = Reweighter::new(config)
            .calibrate(&recs, 2023, &[region("south", 0.0)], &CancellationToken::new())
            .unwrap();

        assert_eq!(result.clamped, vec![2]);
        assert_relative_eq!(result.weights[1], 1e-12);
        assert!(result.converged);
        assert_relative_eq!(result.weights[0], 10.0);
    }

    #[test]
    fn test_zero_income_target_met_at_floor() {
        let recs: Vec<Record> = (1..=3)
            .map(|id| Record::new(id, 10.0).with("income", Value::Numeric(30_000.0)))
            .collect();
        let no_income = CalibrationTarget::new(
            "income",
            0.0,
            Aggregate::Sum { variable: "income".into() },
            RecordFilter::All,
        );
        let result = Reweighter::default()
            .calibrate(&recs, 2024, &[no_income], &CancellationToken::new())
            .unwrap();

        assert!(result.converged, "errors: {:?}", result.errors);
        assert_eq!(result.iterations, 1);
        assert_eq!(result.clamped, vec![1, 2, 3]);
        assert_eq!(result.errors[0].relative_error, 0.0);
        assert_relative_eq!(result.errors[0].achieved, 3.0 * 30_000.0 * 1e-9, max_relative = 1e-9);
        assert_eq!(result.report().status(), crate::dataset::DataStatus::Partial);
    }

    #[test]
    fn test_zero_target_not_met_before_clamping() {
        let recs = records(&[10.0, 20.0]);
        let north = region("north", 0.0);
        let contributions: Vec<Vec<Option<f64>>> = vec![recs.iter().map(|r| north.contribution(r)).collect()];
        let errors = measure(&[north], &contributions, &[10.0, 20.0], 1e-9);
        assert_relative_eq!(errors[0].relative_error, 10.0);
    }

    #[test]
    fn test_nonpositive_input_weights_clamped() {
        let recs = records(&[0.0, 20.0]);
        let result = Reweighter::default()
            .calibrate(&recs, 2023, &[], &CancellationToken::new())
            .unwrap();
        assert!(result.converged);
        assert_eq!(result.iterations, 0);
        assert_eq!(result.clamped, vec![1]);
        assert!(result.weights[0] > 0.0);
    }

    #[test]
    fn test_cancellation_observed_between_iterations() {
        let recs = records(&[10.0, 20.0]);
        let cancel = CancellationToken::new();
        cancel.cancel();
        let err = Reweighter::default()
            .calibrate(&recs, 2026, &[CalibrationTarget::population(50.0)], &cancel)
            .unwrap_err();
        assert!(matches!(err, ProjectionError::Cancelled { year: 2026 }));
    }

    #[test]
    fn test_invalid_target_rejected_before_iterating() {
        let recs = records(&[10.0]);
        let err = Reweighter::default()
            .calibrate(&recs, 2023, &[CalibrationTarget::population(f64::NAN)], &CancellationToken::new())
            .unwrap_err();
        assert!(matches!(err, ProjectionError::InvalidTarget { .. }));
    }
}
