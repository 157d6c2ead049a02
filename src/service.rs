//! # Stage: Service
//!
//! ## Responsibility
//! Wire the observation store, alert ledger, check cycle and analysis cache
//! into the operations the HTTP layer and CLI expose, and run the periodic
//! check scheduler.
//!
//! ## Guarantees
//! - At most one check cycle runs at a time; concurrent triggers queue
//! - Store and ledger I/O runs on the blocking pool, never on a runtime worker
//! - Dashboard aggregates go through the cache; alert reads and checks never do
//!
//! ## NOT Responsible For
//! - HTTP framing (see [`crate::web`])
//! - Database upkeep (see [`crate::maintenance`])

use std::sync::Arc;

use chrono::{Duration, NaiveDateTime};
use serde_json::{json, Value};
use tokio::sync::Mutex;
use tokio::task::JoinHandle;
use tracing::{error, info, warn};

use crate::aggregates::{self, HEATMAP_NETWORKS, TREND_NETWORKS};
use crate::alert::{Alert, Severity};
use crate::cache::{AnalysisCache, CacheKey, CacheStats};
use crate::channel;
use crate::config::{Config, MAX_QUERY_HOURS};
use crate::cycle::{CheckCycle, CycleReport};
use crate::error::{HeatmapError, Result};
use crate::ledger::AlertLedger;
use crate::observation::{lookback_start, Observation, ObservationStore, ScanWindow, SqliteObservationStore};

/// Width of one trend bucket.
pub const TREND_BUCKET_MINUTES: i64 = 15;

/// Source of "now" for every operation.
pub type Clock = Arc<dyn Fn() -> NaiveDateTime + Send + Sync>;

/// Local wall clock, matching the collector's naive local timestamps.
pub fn local_clock() -> Clock {
    Arc::new(|| chrono::Local::now().naive_local())
}

/// Caller-supplied lookback in hours, bounded to `1..=MAX_QUERY_HOURS`.
pub fn query_span(hours: i64) -> Result<Duration> {
    if (1..=MAX_QUERY_HOURS).contains(&hours) {
        Ok(Duration::hours(hours))
    } else {
        Err(HeatmapError::Http(format!("hours must be an integer in 1..={MAX_QUERY_HOURS}, got {hours}")))
    }
}

async fn blocking<T, F>(f: F) -> Result<T>
where
    F: FnOnce() -> Result<T> + Send + 'static,
    T: Send + 'static,
{
    tokio::task::spawn_blocking(f).await?
}

pub struct HeatmapService {
    store: Arc<dyn ObservationStore>,
    ledger: Arc<AlertLedger>,
    cycle: Arc<Mutex<CheckCycle>>,
    cache: AnalysisCache<Value>,
    config: Config,
    clock: Clock,
}

impl HeatmapService {
    pub fn new(store: Arc<dyn ObservationStore>, ledger: Arc<AlertLedger>, config: Config) -> Self {
        HeatmapService {
            store,
            ledger,
            cycle: Arc::new(Mutex::new(CheckCycle::new(&config.analysis))),
            cache: AnalysisCache::new(config.analysis.cache_ttl()),
            config,
            clock: local_clock(),
        }
    }

    /// Open both databases named in `config`.
    pub fn open(config: Config) -> Result<Self> {
        let store = SqliteObservationStore::open(&config.database.observations_path)?;
        let ledger = AlertLedger::open(&config.database.alerts_path, config.analysis.dedup_window())?;
        info!(
            target: "wifi_heatmap::service",
            observations = %config.database.observations_path.display(),
            alerts = %config.database.alerts_path.display(),
            "databases opened"
        );
        Ok(Self::new(Arc::new(store), Arc::new(ledger), config))
    }

    pub fn with_clock(mut self, clock: Clock) -> Self {
        self.clock = clock;
        self
    }

    pub fn config(&self) -> &Config {
        &self.config
    }

    pub fn ledger(&self) -> &Arc<AlertLedger> {
        &self.ledger
    }

    pub fn now(&self) -> NaiveDateTime {
        (self.clock)()
    }

    fn stats_span(&self) -> Duration {
        self.config.analysis.stats_window()
    }

    pub fn cache_stats(&self) -> CacheStats {
        self.cache.stats()
    }

    async fn read_window(&self, span: Duration) -> Result<ScanWindow> {
        let store = Arc::clone(&self.store);
        let now = self.now();
        let since = lookback_start(now, span)?;
        blocking(move || store.window(since, now)).await
    }

    async fn cached<F>(&self, key: CacheKey, span: Duration, build: F) -> Result<Value>
    where
        F: FnOnce(ScanWindow) -> Result<Value> + Send + 'static,
    {
        self.cache
            .get_or_compute(key, || async move {
                let window = self.read_window(span).await?;
                build(window)
            })
            .await
    }

    // -- dashboard aggregates ------------------------------------------------

    pub async fn stats(&self) -> Result<Value> {
        self.cached(CacheKey::new("stats"), self.stats_span(), |w| {
            Ok(serde_json::to_value(aggregates::network_stats(&w.observations))?)
        })
        .await
    }

    pub async fn channel_recommendations(&self) -> Result<Value> {
        self.cached(CacheKey::new("channel_recommendations"), self.stats_span(), |w| {
            Ok(serde_json::to_value(channel::recommend_from_observations(&w.observations))?)
        })
        .await
    }

    pub async fn heatmap(&self) -> Result<Value> {
        self.cached(CacheKey::new("heatmap"), self.stats_span(), |w| {
            let grid = aggregates::heatmap(&w.observations, HEATMAP_NETWORKS);
            let room_averages = aggregates::room_averages(&grid);
            Ok(json!({ "grid": grid, "room_averages": room_averages }))
        })
        .await
    }

    pub async fn trends(&self, hours: i64) -> Result<Value> {
        let span = query_span(hours)?;
        let key = CacheKey::new("trends").with_param("hours", hours);
        self.cached(key, span, move |w| {
            let series = aggregates::signal_trends(
                &w.observations,
                TREND_NETWORKS,
                Duration::minutes(TREND_BUCKET_MINUTES),
            );
            Ok(json!({ "hours": hours, "bucket_minutes": TREND_BUCKET_MINUTES, "series": series }))
        })
        .await
    }

    pub fn clear_cache(&self) -> usize {
        self.cache.clear()
    }

    // -- uncached reads ------------------------------------------------------

    /// The newest observations of the trailing hour, oldest first.
    pub async fn latest(&self) -> Result<Vec<Observation>> {
        let mut window = self.read_window(Duration::hours(1)).await?;
        let limit = self.config.analysis.latest_limit;
        let excess = window.observations.len().saturating_sub(limit);
        Ok(window.observations.split_off(excess))
    }

    /// Alerts created within the last `hours`, newest first.
    pub async fn alerts(&self, hours: i64, severity: Option<Severity>) -> Result<Vec<Alert>> {
        let since = lookback_start(self.now(), query_span(hours)?)?;
        let ledger = Arc::clone(&self.ledger);
        blocking(move || ledger.query(since, severity)).await
    }

    // -- check cycle ---------------------------------------------------------

    /// Run one check cycle now. Waits for any cycle already in progress.
    pub async fn check_alerts(&self) -> Result<CycleReport> {
        let mut cycle = Arc::clone(&self.cycle).lock_owned().await;
        let store = Arc::clone(&self.store);
        let ledger = Arc::clone(&self.ledger);
        let now = self.now();
        blocking(move || cycle.run(store.as_ref(), &ledger, now)).await
    }

    /// Run [`Self::check_alerts`] every `check_interval_secs` until the
    /// handle is aborted. Returns `None` when the interval is zero.
    pub fn spawn_scheduler(self: &Arc<Self>) -> Option<JoinHandle<()>> {
        let secs = self.config.server.check_interval_secs;
        if secs == 0 {
            info!(target: "wifi_heatmap::scheduler", "scheduled checks disabled");
            return None;
        }
        let service = Arc::clone(self);
        Some(tokio::spawn(async move {
            let mut ticker = tokio::time::interval(std::time::Duration::from_secs(secs));
            ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);
            let mut consecutive_failures: u32 = 0;

            loop {
                ticker.tick().await;
                match service.check_alerts().await {
                    Ok(report) => {
                        consecutive_failures = 0;
                        if report.total > 0 {
                            info!(
                                target: "wifi_heatmap::scheduler",
                                raised = report.total,
                                "scheduled check raised alerts"
                            );
                        }
                    }
                    Err(e) => {
                        consecutive_failures = consecutive_failures.saturating_add(1);
                        if consecutive_failures >= 5 {
                            error!(
                                target: "wifi_heatmap::scheduler",
                                error = %e,
                                consecutive_failures,
                                "scheduled check failed repeatedly, will retry next tick"
                            );
                        } else {
                            warn!(
                                target: "wifi_heatmap::scheduler",
                                error = %e,
                                "scheduled check failed, will retry next tick"
                            );
                        }
                    }
                }
            }
        }))
    }
}
