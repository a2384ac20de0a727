//! ClvForge: customer lifetime value CLI
//!
//! This is the main entrypoint that loads the transaction export, runs the
//! pipeline and writes the feature, scoring and decile tables.

use anyhow::{Context, Result};
use clap::Parser;
use clvforge::{data, Args, ClvPipeline, PipelineReport};
use std::time::Instant;
use tracing::info;
use tracing_subscriber::{fmt, prelude::*, EnvFilter};

fn main() -> Result<()> {
    let args = Args::parse();
    init_tracing(args.verbose);

    let config = args.to_config().context("invalid configuration")?;
    let start_time = Instant::now();

    let report = ClvPipeline::new(config)
        .run_file(&args.input)
        .with_context(|| format!("pipeline failed on {}", args.input.display()))?;

    write_outputs(&args, &report)?;
    print_summary(&report);

    info!(
        elapsed_secs = start_time.elapsed().as_secs_f64(),
        output_dir = %args.output_dir.display(),
        "Done"
    );
    Ok(())
}

fn init_tracing(verbose: bool) {
    let default_level = if verbose { "debug" } else { "info" };
    tracing_subscriber::registry()
        .with(EnvFilter::try_from_env("CLVFORGE_LOG").unwrap_or_else(|_| EnvFilter::new(default_level)))
        .with(fmt::layer())
        .init();
}

fn write_outputs(args: &Args, report: &PipelineReport) -> Result<()> {
    std::fs::create_dir_all(&args.output_dir)
        .with_context(|| format!("cannot create {}", args.output_dir.display()))?;

    data::write_feature_table(&report.features, args.output_dir.join("features.csv"))
        .context("writing features.csv")?;
    data::write_scored_customers(&report.scored, args.output_dir.join("scored_customers.csv"))
        .context("writing scored_customers.csv")?;
    data::write_decile_profile(&report.decile_profile, args.output_dir.join("decile_profile.csv"))
        .context("writing decile_profile.csv")?;
    Ok(())
}

fn print_summary(report: &PipelineReport) {
    println!("=== CLV Pipeline ===\n");
    println!(
        "Rows kept: {} of {} ({} dropped)",
        report.ingest.kept_rows,
        report.ingest.total_rows,
        report.ingest.dropped()
    );
    println!(
        "Snapshot: {} (last transaction {})",
        report.snapshot_date, report.date_max
    );
    println!(
        "Customers: {} ({} returned, {} inactive), target total {:.2}",
        report.dataset.customers,
        report.dataset.repeat_customers,
        report.dataset.inactive_customers,
        report.dataset.total_target_value
    );

    println!("\n=== Hold-out Metrics ===");
    println!("{:<20} {:>10} {:>10} {:>8}", "model", "RMSE", "MAE", "R2");
    for outcome in &report.ensemble.outcomes {
        match &outcome.result {
            Ok(m) => println!(
                "{:<20} {:>10.2} {:>10.2} {:>8.3}",
                outcome.name, m.metrics.rmse, m.metrics.mae, m.metrics.r2
            ),
            Err(failure) => println!("{:<20} unavailable: {}", outcome.name, failure),
        }
    }
    println!("Segmentation model: {}", report.segmentation_model);

    println!("\n=== Decile Profile ===");
    for row in &report.decile_profile {
        let actual = row
            .mean_actual
            .map(|v| format!("{v:.2}"))
            .unwrap_or_else(|| "-".to_string());
        println!(
            "Decile {:>2}: {:>5} customers, predicted {:>10.2}, actual {:>10}",
            row.decile, row.customers, row.mean_predicted, actual
        );
    }

    let roi = &report.roi;
    println!("\n=== Campaign on Decile 10 ===");
    println!("Targeted: {}", roi.targeted_count);
    println!("Cost: {:.2}", roi.cost);
    println!("Incremental value: {:.2}", roi.incremental_value);
    println!("Profit: {:.2} (ROI {:.1}%)", roi.profit, roi.roi_pct);

    let risk = &report.risk;
    println!("\n=== RFM Risk ===");
    println!(
        "At risk: {} customers ({:.1}%), historical value {:.2} ({:.1}% of total)",
        risk.at_risk,
        risk.at_risk_share * 100.0,
        risk.at_risk_monetary,
        risk.at_risk_monetary_share * 100.0
    );
    println!(
        "Lost (111): {} customers, historical value {:.2} ({:.1}% of total)",
        risk.lost,
        risk.lost_monetary,
        risk.lost_monetary_share * 100.0
    );
}
