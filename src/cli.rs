use std::path::PathBuf;

use clap::{Parser, Subcommand};

use crate::alert::Severity;
use crate::config::{Config, MAX_QUERY_HOURS, MAX_WINDOW_DAYS};

#[derive(Parser, Debug)]
#[command(name = "wifi-heatmap")]
#[command(version)]
#[command(about = "Wi-Fi signal analysis: degradation alerts, channel recommendations and a dashboard API")]
pub struct Args {
    /// Configuration file (defaults to ./wifi-heatmap.toml when present)
    #[arg(long, global = true)]
    pub config: Option<PathBuf>,

    /// Observation database written by the collector
    #[arg(long, global = true)]
    pub db: Option<PathBuf>,

    /// Alert ledger database
    #[arg(long = "alerts-db", global = true)]
    pub alerts_db: Option<PathBuf>,

    #[command(subcommand)]
    pub command: Command,
}

#[derive(Subcommand, Debug, Clone, PartialEq)]
pub enum Command {
    /// Run the HTTP API and the periodic check scheduler
    Serve {
        /// Port to listen on
        #[arg(long)]
        port: Option<u16>,

        /// Address to bind
        #[arg(long)]
        bind: Option<String>,

        /// Do not run scheduled check cycles
        #[arg(long)]
        no_scheduler: bool,
    },

    /// Run one check cycle and print the alerts it raised
    Check,

    /// List recent alerts
    Alerts {
        /// Look-back window in hours
        #[arg(long, default_value = "24", value_parser = clap::value_parser!(i64).range(1..=MAX_QUERY_HOURS))]
        hours: i64,

        /// Only show alerts of this severity (info, warning, error)
        #[arg(long, value_parser = parse_severity)]
        severity: Option<Severity>,
    },

    /// Recommend a 2.4 GHz channel
    Channels,

    /// Network statistics over the stats window
    Stats,

    /// Observation database upkeep
    Maintenance {
        #[command(subcommand)]
        action: MaintenanceCommand,
    },
}

#[derive(Subcommand, Debug, Clone, PartialEq)]
pub enum MaintenanceCommand {
    /// Show database statistics
    Stats,

    /// Delete observations older than N days
    Cleanup {
        #[arg(long, default_value = "30", value_parser = clap::value_parser!(i64).range(0..=MAX_WINDOW_DAYS))]
        days: i64,

        /// Actually delete; without it only the affected row count is shown
        #[arg(long)]
        yes: bool,
    },

    /// Compact the database file
    Vacuum,

    /// Replace observations older than N days with hourly averages
    Aggregate {
        #[arg(long, default_value = "7", value_parser = clap::value_parser!(i64).range(0..=MAX_WINDOW_DAYS))]
        days: i64,

        /// Actually rewrite; without it only the affected row count is shown
        #[arg(long)]
        yes: bool,
    },
}

fn parse_severity(s: &str) -> Result<Severity, String> {
    s.parse()
}

impl Args {
    /// Fold command-line overrides into a loaded configuration.
    pub fn apply_overrides(&self, config: &mut Config) {
        if let Some(db) = &self.db {
            config.database.observations_path = db.clone();
        }
        if let Some(alerts_db) = &self.alerts_db {
            config.database.alerts_path = alerts_db.clone();
        }
        if let Command::Serve { port, bind, no_scheduler } = &self.command {
            if let Some(port) = port {
                config.server.port = *port;
            }
            if let Some(bind) = bind {
                config.server.bind = bind.clone();
            }
            if *no_scheduler {
                config.server.check_interval_secs = 0;
            }
        }
    }
}
