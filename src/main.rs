use std::sync::Arc;

use clap::Parser;
use colored::*;
use tracing_subscriber::EnvFilter;

use wifi_heatmap::alert::{Alert, Severity};
use wifi_heatmap::cli::{Args, Command, MaintenanceCommand};
use wifi_heatmap::config::Config;
use wifi_heatmap::cycle::CycleReport;
use wifi_heatmap::maintenance;
use wifi_heatmap::service::HeatmapService;
use wifi_heatmap::web;

// ---------------------------------------------------------------------------
// Output helpers
// ---------------------------------------------------------------------------

fn severity_label(severity: Severity) -> ColoredString {
    let label = format!("{:<7}", severity.to_string().to_uppercase());
    match severity {
        Severity::Info => label.bright_blue(),
        Severity::Warning => label.bright_yellow(),
        Severity::Error => label.bright_red(),
    }
}

fn print_alert(alert: &Alert) {
    println!(
        "  {} {} {}",
        alert.created_at.format("%Y-%m-%d %H:%M").to_string().dimmed(),
        severity_label(alert.severity),
        alert.message
    );
}

fn print_report(report: &CycleReport) {
    println!(
        "{}",
        format!(
            "Check cycle at {}: {} new alert(s) ({} degradation, {} weak signal, {} disappearance)",
            report.ran_at.format("%Y-%m-%d %H:%M:%S"),
            report.total,
            report.raised.degradation,
            report.raised.weak_signal,
            report.raised.disappearance,
        )
        .bright_green()
    );
    if report.suppressed > 0 {
        println!("  {} duplicate(s) suppressed", report.suppressed);
    }
    if report.skipped_rows > 0 {
        println!("  {}", format!("{} malformed observation row(s) skipped", report.skipped_rows).yellow());
    }
    if report.pruned > 0 {
        println!("  {} expired alert(s) pruned", report.pruned);
    }
    for alert in &report.alerts {
        print_alert(alert);
    }
}

fn print_json(value: &serde_json::Value) -> Result<(), Box<dyn std::error::Error>> {
    println!("{}", serde_json::to_string_pretty(value)?);
    Ok(())
}

// ---------------------------------------------------------------------------
// Maintenance
// ---------------------------------------------------------------------------

fn run_maintenance(config: &Config, action: &MaintenanceCommand) -> Result<(), Box<dyn std::error::Error>> {
    let path = &config.database.observations_path;
    let store = maintenance::open_existing(path)?;
    let now = chrono::Local::now().naive_local();

    match action {
        MaintenanceCommand::Stats => {
            let stats = maintenance::db_stats(&store, Some(path))?;
            println!("{}", "Database statistics".bright_cyan().bold());
            println!("  Total records:   {}", stats.records);
            println!("  Unique networks: {}", stats.networks);
            println!("  Unique rooms:    {}", stats.rooms);
            println!(
                "  Date range:      {} to {}",
                stats.first_scan.as_deref().unwrap_or("-"),
                stats.last_scan.as_deref().unwrap_or("-")
            );
            if let Some(mb) = stats.file_size_mb() {
                println!("  Database size:   {mb:.2} MB");
            }
        }
        MaintenanceCommand::Cleanup { days, yes } => {
            let count = maintenance::count_older_than(&store, *days, now)?;
            if count == 0 {
                println!("{}", format!("No records older than {days} days").bright_green());
            } else if !yes {
                println!("{count} record(s) older than {days} days; re-run with --yes to delete them");
            } else {
                let deleted = maintenance::cleanup(&store, *days, now)?;
                maintenance::vacuum(&store)?;
                println!("{}", format!("Deleted {deleted} old record(s)").bright_green());
            }
        }
        MaintenanceCommand::Vacuum => {
            let before = std::fs::metadata(path)?.len();
            maintenance::vacuum(&store)?;
            let after = std::fs::metadata(path)?.len();
            println!("{}", "Database optimized".bright_green());
            println!("  Before: {:.2} MB", before as f64 / (1024.0 * 1024.0));
            println!("  After:  {:.2} MB", after as f64 / (1024.0 * 1024.0));
        }
        MaintenanceCommand::Aggregate { days, yes } => {
            let count = maintenance::count_older_than(&store, *days, now)?;
            if count == 0 {
                println!("{}", format!("No records older than {days} days").bright_green());
            } else if !yes {
                println!("{count} record(s) older than {days} days; re-run with --yes to aggregate them");
            } else {
                let outcome = maintenance::aggregate(&store, *days, now)?;
                maintenance::vacuum(&store)?;
                println!(
                    "{}",
                    format!(
                        "Aggregated {} record(s) into {} hourly row(s) ({:.1}% reduction)",
                        outcome.original,
                        outcome.aggregated,
                        outcome.reduction() * 100.0
                    )
                    .bright_green()
                );
                if outcome.skipped > 0 {
                    println!(
                        "  {}",
                        format!("{} malformed record(s) left unaggregated", outcome.skipped).yellow()
                    );
                }
            }
        }
    }
    Ok(())
}

// ---------------------------------------------------------------------------
// Entry point
// ---------------------------------------------------------------------------

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
        .with_writer(std::io::stderr)
        .init();

    let args = Args::parse();
    let mut config = Config::load(args.config.as_deref())?;
    args.apply_overrides(&mut config);
    config.validate()?;

    if let Command::Maintenance { action } = &args.command {
        return run_maintenance(&config, action);
    }

    let service = Arc::new(HeatmapService::open(config)?);

    match args.command {
        Command::Serve { .. } => {
            let listener = web::bind(&service).await?;
            let scheduler = service.spawn_scheduler();
            let result = web::serve(listener, Arc::clone(&service)).await;
            if let Some(handle) = scheduler {
                handle.abort();
            }
            result?;
        }
        Command::Check => {
            let report = service.check_alerts().await?;
            print_report(&report);
        }
        Command::Alerts { hours, severity } => {
            let alerts = service.alerts(hours, severity).await?;
            println!("{}", format!("{} alert(s) in the last {hours}h", alerts.len()).bright_cyan());
            for alert in &alerts {
                print_alert(alert);
            }
        }
        Command::Channels => {
            let rec = service.channel_recommendations().await?;
            if let Some(best) = rec.get("best_channel") {
                println!("{}", format!("Recommended channel: {best}").bright_green().bold());
            }
            print_json(&rec)?;
        }
        Command::Stats => {
            print_json(&service.stats().await?)?;
        }
        Command::Maintenance { .. } => {}
    }

    Ok(())
}
