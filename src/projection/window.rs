//! Lazy, ordered production of year snapshots across a budget window
//!
//! Years run on a bounded rayon pool. Completed years that arrive out of
//! order wait in a buffer keyed by year until every earlier year has been
//! yielded, so output is always ascending regardless of completion order.

use super::cancel::CancellationToken;
use super::config::{BudgetWindow, ProjectionConfig};
use super::engine::compute_year;
use crate::calibration::TargetsByYear;
use crate::dataset::{Snapshot, YearSummary};
use crate::error::{ProjectionError, Result};
use crate::growth::GrowthFactorProvider;
use crossbeam_channel::{unbounded, Receiver, Sender};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fmt;
use std::sync::Arc;

/// Window-level lifecycle
///
/// `Pending -> Running(year) -> Complete | Failed(year, reason)`
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "state", rename_all = "SCREAMING_SNAKE_CASE")]
pub enum WindowStatus {
    Pending,
    /// Waiting on `year`, the next one to be yielded
    Running { year: i32 },
    Complete,
    Failed { year: i32, reason: String },
}

impl WindowStatus {
    pub fn is_terminal(&self) -> bool {
        matches!(self, WindowStatus::Complete | WindowStatus::Failed { .. })
    }
}

impl fmt::Display for WindowStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            WindowStatus::Pending => write!(f, "PENDING"),
            WindowStatus::Running { year } => write!(f, "RUNNING({})", year),
            WindowStatus::Complete => write!(f, "COMPLETE"),
            WindowStatus::Failed { year, reason } => write!(f, "FAILED({}): {}", year, reason),
        }
    }
}

/// Final status record for a window
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct WindowReport {
    pub start_year: i32,
    pub end_year: i32,
    pub status: WindowStatus,
    /// Years yielded successfully, ascending
    pub years_produced: Vec<i32>,
    /// Produced years whose calibration missed tolerance (partial-results mode)
    pub partial_years: Vec<i32>,
}

/// Everything left once a window has been driven to the end
#[derive(Debug)]
pub struct WindowOutcome {
    pub snapshots: Vec<Snapshot>,
    pub report: WindowReport,
    pub error: Option<ProjectionError>,
}

impl WindowOutcome {
    pub fn summaries(&self) -> Vec<YearSummary> {
        self.snapshots.iter().map(Snapshot::summary).collect()
    }
}

/// Shared read-only inputs for every year task
pub(crate) struct WindowJob {
    pub base: Arc<Snapshot>,
    pub provider: Arc<dyn GrowthFactorProvider>,
    pub config: ProjectionConfig,
    pub targets: TargetsByYear,
}

type YearResult = (i32, Result<Snapshot>);

/// Iterator over a window's snapshots in ascending year order
///
/// At most `concurrency` years are computed ahead of the consumer. The first
/// error is yielded once, cancels in-flight years and ends iteration.
/// Dropping the iterator also cancels outstanding work.
pub struct WindowProjection {
    job: Arc<WindowJob>,
    window: BudgetWindow,
    pool: rayon::ThreadPool,
    sender: Sender<YearResult>,
    receiver: Receiver<YearResult>,
    cancel: CancellationToken,

    // Widened so stepping past `i32::MAX` cannot overflow
    next_dispatch: i64,
    next_emit: i64,
    in_flight: usize,
    buffer: BTreeMap<i32, Result<Snapshot>>,

    status: WindowStatus,
    years_produced: Vec<i32>,
    partial_years: Vec<i32>,
}

impl WindowProjection {
    pub(crate) fn start(job: WindowJob, window: BudgetWindow) -> Result<Self> {
        let workers = job.config.concurrency.max(1);
        let pool = rayon::ThreadPoolBuilder::new()
            .num_threads(workers)
            .thread_name(|i| format!("budget-window-{}", i))
            .build()
            .map_err(|e| ProjectionError::config(format!("failed to build worker pool: {}", e)))?;
        let (sender, receiver) = unbounded();

        Ok(Self {
            job: Arc::new(job),
            window,
            pool,
            sender,
            receiver,
            cancel: CancellationToken::new(),
            next_dispatch: i64::from(window.start_year()),
            next_emit: i64::from(window.start_year()),
            in_flight: 0,
            buffer: BTreeMap::new(),
            status: WindowStatus::Pending,
            years_produced: Vec::new(),
            partial_years: Vec::new(),
        })
    }

    pub fn window(&self) -> BudgetWindow {
        self.window
    }

    pub fn status(&self) -> &WindowStatus {
        &self.status
    }

    /// Token that stops in-flight years at their next iteration boundary
    pub fn cancellation_token(&self) -> CancellationToken {
        self.cancel.clone()
    }

    /// Cancel outstanding work; the next call to `next` reports the cancellation
    pub fn cancel(&self) {
        self.cancel.cancel();
    }

    pub fn report(&self) -> WindowReport {
        WindowReport {
            start_year: self.window.start_year(),
            end_year: self.window.end_year(),
            status: self.status.clone(),
            years_produced: self.years_produced.clone(),
            partial_years: self.partial_years.clone(),
        }
    }

    /// Drain the window, failing on the first error
    pub fn collect_all(self) -> Result<Vec<Snapshot>> {
        self.collect()
    }

    /// Drain the window, keeping every snapshot produced before any failure
    pub fn finish(mut self) -> WindowOutcome {
        let mut snapshots = Vec::new();
        let mut error = None;
        for item in self.by_ref() {
            match item {
                Ok(snapshot) => snapshots.push(snapshot),
                Err(e) => error = Some(e),
            }
        }
        WindowOutcome {
            snapshots,
            report: self.report(),
            error,
        }
    }

    fn max_in_flight(&self) -> usize {
        self.job.config.concurrency.max(1)
    }

    /// Keep the pool busy up to the concurrency limit
    ///
    /// Buffered results count against the limit so that a slow early year
    /// cannot let the rest of the window run ahead of the consumer.
    fn dispatch(&mut self) {
        while self.in_flight + self.buffer.len() < self.max_in_flight()
            && self.next_dispatch <= i64::from(self.window.end_year())
        {
            let Ok(year) = i32::try_from(self.next_dispatch) else {
                break;
            };
            let job = Arc::clone(&self.job);
            let sender = self.sender.clone();
            let cancel = self.cancel.clone();

            self.pool.spawn(move || {
                log::debug!("Year {}: started", year);
                let result = compute_year(
                    &job.base,
                    job.provider.as_ref(),
                    &job.config,
                    year,
                    job.targets.for_year(year),
                    &cancel,
                );
                // Receiver is gone once the window was dropped
                let _ = sender.send((year, result));
            });

            self.in_flight += 1;
            self.next_dispatch += 1;
        }
    }

    fn fail(&mut self, year: i32, error: ProjectionError) -> Option<Result<Snapshot>> {
        log::debug!("Window failed at {}: {}", year, error);
        self.status = WindowStatus::Failed {
            year,
            reason: error.to_string(),
        };
        self.cancel.cancel();
        self.buffer.clear();
        Some(Err(error))
    }
}

impl Iterator for WindowProjection {
    type Item = Result<Snapshot>;

    fn next(&mut self) -> Option<Self::Item> {
        if self.status.is_terminal() {
            return None;
        }

        let Ok(year) = i32::try_from(self.next_emit) else {
            return None;
        };
        self.status = WindowStatus::Running { year };

        if self.cancel.is_cancelled() && !self.buffer.contains_key(&year) {
            return self.fail(year, ProjectionError::Cancelled { year });
        }

        self.dispatch();

        let result = loop {
            if let Some(result) = self.buffer.remove(&year) {
                break result;
            }
            match self.receiver.recv() {
                Ok((done, result)) => {
                    self.in_flight -= 1;
                    self.buffer.insert(done, result);
                    self.dispatch();
                }
                // We hold a sender, so this only happens if a worker died
                Err(_) => {
                    break Err(ProjectionError::config(format!("worker for year {} stopped unexpectedly", year)));
                }
            }
        };

        match result {
            Ok(snapshot) => {
                log::info!(
                    "Year {} projected [{}]: total weight {:.2}",
                    snapshot.year,
                    snapshot.status,
                    snapshot.total_weight()
                );
                self.years_produced.push(year);
                if snapshot.calibration.as_ref().is_some_and(|c| !c.converged) {
                    self.partial_years.push(year);
                }

                self.next_emit += 1;
                self.status = match i32::try_from(self.next_emit) {
                    Ok(next) if next <= self.window.end_year() => WindowStatus::Running { year: next },
                    _ => WindowStatus::Complete,
                };
                Some(Ok(snapshot))
            }
            Err(error) => self.fail(year, error),
        }
    }

    fn size_hint(&self) -> (usize, Option<usize>) {
        if self.status.is_terminal() {
            (0, Some(0))
        } else {
            let remaining = (i64::from(self.window.end_year()) - self.next_emit + 1).max(0);
            (0, usize::try_from(remaining).ok())
        }
    }
}

impl Drop for WindowProjection {
    fn drop(&mut self) {
        self.cancel.cancel();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::calibration::{Aggregate, CalibrationTarget, RecordFilter};
    use crate::dataset::{DataStatus, Record, Schema, Value, VariableSpec, VariableType};
    use crate::growth::{GrowthFactor, GrowthFactorTable, StaticFactorProvider};
    use crate::projection::BudgetWindowProjector;
    use approx::assert_relative_eq;
    use std::collections::BTreeMap;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::time::{Duration, Instant};

    fn base() -> Arc<Snapshot> {
        let schema = Arc::new(Schema::new(vec![
            VariableSpec::new("employment_income", VariableType::Numeric).uprated_by("earnings"),
            VariableSpec::new("age_band", VariableType::Categorical).uprated_by("ageing"),
        ]));
        let records = (0..3)
            .map(|i| {
                Record::new(i + 1, 10.0 * (i as f64 + 1.0))
                    .with("employment_income", Value::Numeric(1000.0 * (i as f64 + 1.0)))
                    .with("age_band", Value::Categorical("16-24".into()))
            })
            .collect();
        Arc::new(Snapshot::new(2022, schema, records, DataStatus::Ok))
    }

    fn ageing() -> GrowthFactor {
        let mut row = BTreeMap::new();
        row.insert("16-24".to_string(), 0.7);
        row.insert("25-64".to_string(), 0.3);
        let mut transitions = BTreeMap::new();
        transitions.insert("16-24".to_string(), row);
        GrowthFactor::CategoricalShift { transitions }
    }

    fn provider(first: i32, last: i32) -> StaticFactorProvider {
        let mut provider = StaticFactorProvider::new("test");
        for year in first..=last {
            let growth = 1.03f64.powi(year - 2022);
            provider.insert("earnings", year, GrowthFactor::Multiplicative { factor: growth });
            provider.insert("ageing", year, ageing());
        }
        provider
    }

    fn targets(first: i32, last: i32) -> TargetsByYear {
        let mut targets = TargetsByYear::new();
        for year in first..=last {
            targets.insert(year, CalibrationTarget::population(60.0 + 10.0 * (year - 2022) as f64));
        }
        targets
    }

    fn projector(provider: StaticFactorProvider, concurrency: usize, partial: bool) -> BudgetWindowProjector {
        BudgetWindowProjector::new(
            Arc::new(provider),
            ProjectionConfig {
                concurrency,
                partial_results: partial,
                seed_basis: 7,
                ..Default::default()
            },
        )
    }

    #[test]
    fn test_one_snapshot_per_year_ascending() {
        let window = BudgetWindow::new(2022, 2027).unwrap();
        let projection = projector(provider(2022, 2027), 4, false)
            .project(base(), window, targets(2022, 2027))
            .unwrap();
        assert_eq!(projection.status(), &WindowStatus::Pending);

        let outcome = projection.finish();
        assert!(outcome.error.is_none());
        assert_eq!(outcome.snapshots.len(), window.len());
        let years: Vec<i32> = outcome.snapshots.iter().map(|s| s.year).collect();
        assert_eq!(years, vec![2022, 2023, 2024, 2025, 2026, 2027]);
        assert_eq!(outcome.report.status, WindowStatus::Complete);
        assert_eq!(outcome.report.years_produced, years);

        for snapshot in &outcome.snapshots {
            let expected = 60.0 + 10.0 * (snapshot.year - 2022) as f64;
            assert_relative_eq!(snapshot.total_weight(), expected, max_relative = 1e-6);
            assert!(snapshot.records.iter().all(|r| r.weight > 0.0));
        }
    }

    #[test]
    fn test_uniform_scaling_scenario() {
        let window = BudgetWindow::new(2022, 2023).unwrap();
        let targets = TargetsByYear::new().with(2023, CalibrationTarget::population(90.0));
        let snapshots = projector(provider(2022, 2023), 2, false)
            .project(base(), window, targets)
            .unwrap()
            .collect_all()
            .unwrap();

        assert_eq!(snapshots.len(), 2);
        let weights = snapshots[1].weights();
        assert_relative_eq!(weights[0], 15.0, max_relative = 1e-6);
        assert_relative_eq!(weights[1], 30.0, max_relative = 1e-6);
        assert_relative_eq!(weights[2], 45.0, max_relative = 1e-6);
        assert!(snapshots[1].calibration.as_ref().unwrap().iterations <= 20);

        // No targets for the base year: weights carried over
        assert_eq!(snapshots[0].weights(), vec![10.0, 20.0, 30.0]);
    }

    #[test]
    fn test_projection_is_bit_identical_across_runs_and_workers() {
        let window = BudgetWindow::new(2022, 2026).unwrap();
        let first = projector(provider(2022, 2026), 1, false)
            .project(base(), window, targets(2022, 2026))
            .unwrap()
            .collect_all()
            .unwrap();
        let second = projector(provider(2022, 2026), 3, false)
            .project(base(), window, targets(2022, 2026))
            .unwrap()
            .collect_all()
            .unwrap();

        assert_eq!(first, second);
        for (a, b) in first.iter().zip(&second) {
            for (ra, rb) in a.records.iter().zip(&b.records) {
                assert_eq!(ra.weight.to_bits(), rb.weight.to_bits());
            }
        }
    }

    #[test]
    fn test_missing_factor_stops_window() {
        let window = BudgetWindow::new(2022, 2027).unwrap();
        // Nothing for 2025 onwards
        let mut projection = projector(provider(2022, 2024), 4, false)
            .project(base(), window, targets(2022, 2027))
            .unwrap();

        let mut produced = Vec::new();
        let mut failure = None;
        for item in projection.by_ref() {
            match item {
                Ok(snapshot) => produced.push(snapshot.year),
                Err(e) => failure = Some(e),
            }
        }

        assert_eq!(produced, vec![2022, 2023, 2024]);
        match failure {
            Some(ProjectionError::MissingFactor { category, year }) => {
                assert_eq!(year, 2025);
                assert_eq!(category, "earnings");
            }
            other => panic!("expected MissingFactor, got {:?}", other),
        }
        match projection.status() {
            WindowStatus::Failed { year, reason } => {
                assert_eq!(*year, 2025);
                assert!(reason.contains("earnings"));
            }
            other => panic!("expected Failed, got {:?}", other),
        }
        assert!(projection.next().is_none());
    }

    fn unreachable_targets(window: BudgetWindow) -> TargetsByYear {
        let mut targets = TargetsByYear::new();
        targets.insert(
            window.start_year() + 1,
            CalibrationTarget::new(
                "nobody",
                10.0,
                Aggregate::Count,
                RecordFilter::Equals { variable: "age_band".into(), value: "65+".into() },
            ),
        );
        targets
    }

    #[test]
    fn test_nonconvergence_halts_window() {
        let window = BudgetWindow::new(2022, 2025).unwrap();
        let outcome = projector(provider(2022, 2025), 2, false)
            .project(base(), window, unreachable_targets(window))
            .unwrap()
            .finish();

        assert_eq!(outcome.snapshots.len(), 1);
        assert!(matches!(
            outcome.error,
            Some(ProjectionError::CalibrationNonconvergence { year: 2023, .. })
        ));
        assert!(matches!(outcome.report.status, WindowStatus::Failed { year: 2023, .. }));
    }

    #[test]
    fn test_partial_results_mode_continues() {
        let window = BudgetWindow::new(2022, 2025).unwrap();
        let outcome = projector(provider(2022, 2025), 2, true)
            .project(base(), window, unreachable_targets(window))
            .unwrap()
            .finish();

        assert!(outcome.error.is_none());
        assert_eq!(outcome.snapshots.len(), 4);
        assert_eq!(outcome.report.partial_years, vec![2023]);
        assert_eq!(outcome.snapshots[1].status, DataStatus::Partial);
        assert_eq!(outcome.snapshots[2].status, DataStatus::Ok);
        assert_eq!(outcome.report.status, WindowStatus::Complete);
    }

    #[test]
    fn test_cancel_before_first_year() {
        let window = BudgetWindow::new(2022, 2024).unwrap();
        let mut projection = projector(provider(2022, 2024), 2, false)
            .project(base(), window, targets(2022, 2024))
            .unwrap();
        projection.cancel();
        assert!(matches!(projection.next(), Some(Err(ProjectionError::Cancelled { year: 2022 }))));
        assert!(projection.next().is_none());
    }

    #[test]
    fn test_invalid_targets_fail_before_start() {
        let window = BudgetWindow::new(2022, 2023).unwrap();
        let targets = TargetsByYear::new().with(2023, CalibrationTarget::population(-5.0));
        let result = projector(provider(2022, 2023), 2, false).project(base(), window, targets);
        assert!(matches!(result, Err(ProjectionError::InvalidTarget { .. })));
    }

    /// Provider that counts lookups and slows down early years
    struct CountingProvider {
        inner: StaticFactorProvider,
        calls: Arc<AtomicUsize>,
    }

    impl GrowthFactorProvider for CountingProvider {
        fn factors_for(&self, year: i32) -> Result<GrowthFactorTable> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            if year == 2022 {
                std::thread::sleep(Duration::from_millis(50));
            }
            self.inner.factors_for(year)
        }

        fn name(&self) -> &str {
            "counting"
        }
    }

    #[test]
    fn test_lazy_production_bounded_by_concurrency() {
        let calls = Arc::new(AtomicUsize::new(0));
        let provider = CountingProvider {
            inner: provider(2022, 2031),
            calls: Arc::clone(&calls),
        };
        let projector = BudgetWindowProjector::new(
            Arc::new(provider),
            ProjectionConfig {
                concurrency: 2,
                ..Default::default()
            },
        );
        let window = BudgetWindow::new(2022, 2031).unwrap();
        let mut projection = projector.project(base(), window, targets(2022, 2031)).unwrap();

        let first = projection.next().unwrap().unwrap();
        assert_eq!(first.year, 2022);
        // 2022 finished slowest; only the concurrency limit may have started
        assert!(calls.load(Ordering::SeqCst) <= 2);

        let rest: Vec<i32> = projection.map(|s| s.unwrap().year).collect();
        assert_eq!(rest, (2023..=2031).collect::<Vec<_>>());
        assert_eq!(calls.load(Ordering::SeqCst), 10);
    }

    #[test]
    fn test_slow_early_year_keeps_order() {
        let provider = CountingProvider {
            inner: provider(2022, 2029),
            calls: Arc::new(AtomicUsize::new(0)),
        };
        let projector = BudgetWindowProjector::new(
            Arc::new(provider),
            ProjectionConfig {
                concurrency: 4,
                ..Default::default()
            },
        );
        let window = BudgetWindow::new(2022, 2029).unwrap();
        let outcome = projector.project(base(), window, targets(2022, 2029)).unwrap().finish();

        assert!(outcome.error.is_none());
        let years: Vec<i32> = outcome.snapshots.iter().map(|s| s.year).collect();
        assert_eq!(years, (2022..=2029).collect::<Vec<_>>());
        assert_eq!(outcome.report.years_produced, years);
    }

    /// Every year from `first` onwards has a target no record can meet
    fn endless_calibration(first: i32, last: i32) -> (TargetsByYear, ProjectionConfig) {
        let mut targets = TargetsByYear::new();
        for year in first..=last {
            targets.insert(
                year,
                CalibrationTarget::new(
                    "nobody",
                    10.0,
                    Aggregate::Count,
                    RecordFilter::Equals { variable: "age_band".into(), value: "65+".into() },
                ),
            );
        }
        let mut config = ProjectionConfig {
            concurrency: 2,
            ..Default::default()
        };
        config.reweight.max_iterations = u32::MAX;
        (targets, config)
    }

    #[test]
    fn test_cancel_stops_year_in_flight() {
        let (targets, config) = endless_calibration(2022, 2024);
        let projector = BudgetWindowProjector::new(Arc::new(provider(2022, 2024)), config);
        let window = BudgetWindow::new(2022, 2024).unwrap();
        let mut projection = projector.project(base(), window, targets).unwrap();

        let token = projection.cancellation_token();
        let canceller = std::thread::spawn(move || {
            std::thread::sleep(Duration::from_millis(50));
            token.cancel();
        });

        // Blocks until the worker for 2022 notices the cancellation
        let started = Instant::now();
        let first = projection.next();
        canceller.join().unwrap();

        assert!(matches!(first, Some(Err(ProjectionError::Cancelled { year: 2022 }))));
        assert!(started.elapsed() < Duration::from_secs(10));
        assert!(matches!(projection.status(), WindowStatus::Failed { year: 2022, .. }));
        assert!(projection.next().is_none());
    }

    #[test]
    fn test_drop_releases_years_in_flight() {
        // 2022 calibrates normally, every later year would iterate forever
        let (mut targets, config) = endless_calibration(2023, 2026);
        targets.insert(2022, CalibrationTarget::population(60.0));

        let shared = Arc::new(provider(2022, 2026));
        let projector = BudgetWindowProjector::new(shared.clone(), config);
        let window = BudgetWindow::new(2022, 2026).unwrap();
        let mut projection = projector.project(base(), window, targets).unwrap();
        drop(projector);

        let first = projection.next().unwrap().unwrap();
        assert_eq!(first.year, 2022);

        let token = projection.cancellation_token();
        drop(projection);
        assert!(token.is_cancelled());

        // Workers hold the provider until they return
        let started = Instant::now();
        while Arc::strong_count(&shared) > 1 {
            assert!(
                started.elapsed() < Duration::from_secs(10),
                "workers still running after drop"
            );
            std::thread::sleep(Duration::from_millis(5));
        }
    }

    #[test]
    fn test_window_ending_at_last_representable_year() {
        let window = BudgetWindow::new(i32::MAX - 1, i32::MAX).unwrap();
        let mut factors = StaticFactorProvider::new("flat");
        for year in window.years() {
            factors.insert("earnings", year, GrowthFactor::identity());
            factors.insert("ageing", year, ageing());
        }
        let mut projection = projector(factors, 2, false)
            .project(base(), window, TargetsByYear::new())
            .unwrap();

        assert_eq!(projection.next().unwrap().unwrap().year, i32::MAX - 1);
        assert_eq!(projection.next().unwrap().unwrap().year, i32::MAX);
        assert_eq!(projection.status(), &WindowStatus::Complete);
        assert!(projection.next().is_none());
        assert_eq!(projection.size_hint(), (0, Some(0)));
    }
}
