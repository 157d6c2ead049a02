pub mod aggregates;
pub mod alert;
pub mod cache;
pub mod channel;
pub mod cli;
pub mod config;
pub mod cycle;
pub mod detectors;
pub mod error;
pub mod ledger;
pub mod maintenance;
pub mod observation;
pub mod service;
pub mod signal;
pub mod web;

pub use alert::{Alert, AlertKind, NewAlert, Severity};
pub use cache::{AnalysisCache, CacheKey};
pub use channel::{ChannelUsage, Recommendation};
pub use config::Config;
pub use cycle::{CheckCycle, CycleReport};
pub use error::{HeatmapError, Result};
pub use ledger::AlertLedger;
pub use observation::{NetworkKey, Observation, ObservationStore, SqliteObservationStore};
pub use service::HeatmapService;
