//! Budget Window CLI
//!
//! Command-line interface for inspecting microdata and projecting it across a budget window

use anyhow::{bail, Context, Result};
use budget_window::dataset::{DatasetLoader, Schema, Snapshot};
use budget_window::projection::{BudgetWindow, BudgetWindowProjector};
use budget_window::scenario::{ScenarioComparison, ScenarioOutcome};
use budget_window::settings::RunSettings;
use clap::{Parser, Subcommand};
use std::fs;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Instant;

#[derive(Parser)]
#[command(name = "budget-window", version, about = "Project base-year microdata across a budget window")]
struct Cli {
    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand)]
enum Command {
    /// Load a dataset and print its data-quality status
    Inspect {
        /// Microdata CSV (id, weight and one column per variable)
        #[arg(long)]
        data: PathBuf,
        /// JSON schema declaring variables
        #[arg(long)]
        schema: PathBuf,
        /// Base year of the dataset
        #[arg(long, default_value_t = 2022)]
        year: i32,
    },
    /// Project a dataset across the window and write one CSV per year
    Project {
        /// JSON run settings
        #[arg(long)]
        settings: PathBuf,
        #[arg(long)]
        data: PathBuf,
        #[arg(long)]
        schema: PathBuf,
        /// Output directory
        #[arg(long, default_value = "window_output")]
        output: PathBuf,
        /// Override the first projected year
        #[arg(long)]
        start: Option<i32>,
        /// Override the last projected year
        #[arg(long)]
        end: Option<i32>,
        /// Override the worker count
        #[arg(long)]
        workers: Option<usize>,
        /// Keep best-effort snapshots when calibration misses tolerance
        #[arg(long)]
        partial: bool,
    },
    /// Project a baseline and a reform and write percentage changes per year
    Compare {
        /// JSON run settings for the baseline
        #[arg(long)]
        baseline: PathBuf,
        /// JSON run settings for the reform
        #[arg(long)]
        reform: PathBuf,
        #[arg(long)]
        data: PathBuf,
        #[arg(long)]
        schema: PathBuf,
        /// Numeric variables whose weighted sums are compared (comma separated)
        #[arg(long, value_delimiter = ',')]
        variables: Vec<String>,
        /// Output directory
        #[arg(long, default_value = "window_output")]
        output: PathBuf,
    },
}

fn main() -> Result<()> {
    env_logger::init();
    let cli = Cli::parse();

    match cli.command {
        Command::Inspect { data, schema, year } => inspect(&data, &schema, year),
        Command::Project {
            settings,
            data,
            schema,
            output,
            start,
            end,
            workers,
            partial,
        } => {
            let mut settings = RunSettings::from_json_path(&settings)
                .with_context(|| format!("failed to read settings {}", settings.display()))?;
            if start.is_some() || end.is_some() {
                settings.window = BudgetWindow::new(
                    start.unwrap_or(settings.window.start_year()),
                    end.unwrap_or(settings.window.end_year()),
                )?;
            }
            if let Some(workers) = workers {
                settings.projection.concurrency = workers;
                settings.max_workers = None;
            }
            if partial {
                settings.projection.partial_results = true;
            }
            project(&settings, &data, &schema, &output)
        }
        Command::Compare {
            baseline,
            reform,
            data,
            schema,
            variables,
            output,
        } => compare(&baseline, &reform, &data, &schema, &variables, &output).map(|_| ()),
    }
}

fn load(data: &Path, schema: &Path, year: i32) -> Result<Snapshot> {
    let schema = Schema::from_json_path(schema)
        .with_context(|| format!("failed to read schema {}", schema.display()))?;
    let (snapshot, summary) = DatasetLoader::new(year)
        .load_csv(data, schema)
        .with_context(|| format!("failed to load {}", data.display()))?;

    log::info!(
        "Loaded {} records for {} [{}]",
        snapshot.len(),
        snapshot.year,
        snapshot.status
    );
    print!("{}", summary);
    Ok(snapshot)
}

fn inspect(data: &Path, schema: &Path, year: i32) -> Result<()> {
    load(data, schema, year)?;
    Ok(())
}

fn project(settings: &RunSettings, data: &Path, schema: &Path, output: &Path) -> Result<()> {
    let start = Instant::now();
    let base = Arc::new(load(data, schema, settings.base_year)?);

    let provider = settings.provider().context("failed to build growth factor provider")?;
    let projector = BudgetWindowProjector::new(provider, settings.projection_config());

    fs::create_dir_all(output)
        .with_context(|| format!("failed to create output directory {}", output.display()))?;

    println!(
        "\nProjecting {}-{} ({} years)...",
        settings.window.start_year(),
        settings.window.end_year(),
        settings.window.len()
    );

    let mut projection = projector.project(Arc::clone(&base), settings.window, settings.targets.clone())?;
    let mut summaries = Vec::new();
    let mut failure = None;

    for item in projection.by_ref() {
        match item {
            Ok(snapshot) => {
                let path = output.join(format!("snapshot_{}.csv", snapshot.year));
                write_snapshot(&path, &snapshot)?;
                let summary = snapshot.summary();
                println!(
                    "  {} [{:>7}] total weight {:>16.2}  iterations {:>3}  max error {:.2e}",
                    summary.year,
                    summary.status.as_str(),
                    summary.total_weight,
                    summary.iterations,
                    summary.max_error,
                );
                summaries.push(summary);
            }
            Err(e) => failure = Some(e),
        }
    }

    let summary_path = output.join("window_summary.csv");
    let mut writer = csv::Writer::from_path(&summary_path)?;
    for summary in &summaries {
        writer.serialize(summary)?;
    }
    writer.flush()?;

    let report = projection.report();
    println!("\nWindow status: {}", report.status);
    if !report.partial_years.is_empty() {
        println!("Best-effort years (calibration missed tolerance): {:?}", report.partial_years);
    }
    println!("Output written to {}", output.display());
    println!("Total time: {:?}", start.elapsed());

    if let Some(e) = failure {
        bail!("projection failed: {}", e);
    }
    Ok(())
}

fn compare(
    baseline: &Path,
    reform: &Path,
    data: &Path,
    schema: &Path,
    variables: &[String],
    output: &Path,
) -> Result<PathBuf> {
    let start = Instant::now();
    let read = |path: &Path| {
        RunSettings::from_json_path(path).with_context(|| format!("failed to read settings {}", path.display()))
    };
    let baseline_settings = read(baseline)?;
    let reform_settings = read(reform)?;
    if baseline_settings.base_year != reform_settings.base_year {
        bail!(
            "baseline and reform disagree on the base year ({} vs {})",
            baseline_settings.base_year,
            reform_settings.base_year
        );
    }

    let base = Arc::new(load(data, schema, baseline_settings.base_year)?);
    let run = |name: &str, settings: &RunSettings| -> Result<ScenarioOutcome> {
        let provider = settings.provider().context("failed to build growth factor provider")?;
        let projector = BudgetWindowProjector::new(provider, settings.projection_config());
        let mut outcome = projector
            .project(Arc::clone(&base), settings.window, settings.targets.clone())?
            .finish();
        if let Some(e) = outcome.error.take() {
            bail!("{} projection failed: {}", name, e);
        }
        Ok(ScenarioOutcome {
            name: name.to_string(),
            outcome,
        })
    };
    let baseline_outcome = run("baseline", &baseline_settings)?;
    let reform_outcome = run("reform", &reform_settings)?;

    let comparison = ScenarioComparison::between(&baseline_outcome, &reform_outcome, variables)?;

    fs::create_dir_all(output)
        .with_context(|| format!("failed to create output directory {}", output.display()))?;
    let path = output.join("comparison.csv");
    let file = fs::File::create(&path).with_context(|| format!("failed to create {}", path.display()))?;
    comparison.write_csv(file)?;

    println!("\nPercentage changes in aggregates (reform vs baseline):");
    for change in &comparison.changes {
        match change.pct_diff {
            Some(pct) => println!("  {} {:<24} {:>+10.4}%", change.year, change.aggregate, pct),
            None => println!("  {} {:<24} {:>11}", change.year, change.aggregate, "n/a"),
        }
    }
    println!("Output written to {}", path.display());
    println!("Total time: {:?}", start.elapsed());
    Ok(path)
}

fn write_snapshot(path: &Path, snapshot: &Snapshot) -> Result<()> {
    let mut writer = csv::Writer::from_path(path)
        .with_context(|| format!("failed to create {}", path.display()))?;

    let mut header = vec!["id".to_string(), "weight".to_string()];
    header.extend(snapshot.schema.variables().iter().map(|v| v.name.clone()));
    writer.write_record(&header)?;

    for record in &snapshot.records {
        let mut row = vec![record.id.to_string(), format!("{:.10}", record.weight)];
        row.extend(
            snapshot
                .schema
                .variables()
                .iter()
                .map(|v| record.get(&v.name).map(|value| value.to_string()).unwrap_or_default()),
        );
        writer.write_record(&row)?;
    }

    writer.flush()?;
    Ok(())
}
