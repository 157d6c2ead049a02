//! # Stage: Maintenance
//!
//! ## Responsibility
//! Upkeep of the observation database the collector keeps appending to:
//! size/coverage statistics, retention cleanup, `VACUUM`, and folding old
//! raw scans into hourly averages.
//!
//! ## Guarantees
//! - Destructive operations run in a single transaction; a failure leaves
//!   the table untouched
//! - [`aggregate`] folds only rows that read back as observations; rows with
//!   an unparsable timestamp or a non-numeric signal stay in place and are
//!   counted
//!
//! ## NOT Responsible For
//! - Asking for confirmation (the CLI requires `--yes`)
//! - The alert ledger, which prunes itself every check cycle

use std::collections::BTreeMap;
use std::path::Path;

use chrono::{Duration, NaiveDateTime};
use rusqlite::params;
use serde::Serialize;

use crate::aggregates::bucket_start;
use crate::config::MAX_WINDOW_DAYS;
use crate::error::{HeatmapError, Result};
use crate::observation::{self, format_timestamp, lookback_start, Observation, SqliteObservationStore};

/// Coverage and size of the observation database.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct DbStats {
    pub records: u64,
    pub networks: u64,
    pub rooms: u64,
    pub first_scan: Option<String>,
    pub last_scan: Option<String>,
    /// On-disk size of the main database file; `None` for in-memory stores.
    pub file_size_bytes: Option<u64>,
}

impl DbStats {
    pub fn file_size_mb(&self) -> Option<f64> {
        self.file_size_bytes.map(|b| b as f64 / (1024.0 * 1024.0))
    }
}

/// Result of [`aggregate`].
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct AggregateOutcome {
    /// Raw rows older than the cutoff that were replaced.
    pub original: u64,
    /// Hourly rows written in their place.
    pub aggregated: u64,
    /// Old rows left untouched because they do not parse as observations.
    pub skipped: u64,
}

impl AggregateOutcome {
    /// Fraction of rows removed, 0.0 when nothing was aggregated.
    pub fn reduction(&self) -> f64 {
        if self.original == 0 {
            0.0
        } else {
            1.0 - self.aggregated as f64 / self.original as f64
        }
    }
}

fn cutoff(days: i64, now: NaiveDateTime) -> Result<NaiveDateTime> {
    if !(0..=MAX_WINDOW_DAYS).contains(&days) {
        return Err(HeatmapError::Config(format!("days must be in 0..={MAX_WINDOW_DAYS}, got {days}")));
    }
    lookback_start(now, Duration::days(days))
}

/// Open an observation database for upkeep. Unlike
/// [`SqliteObservationStore::open`], a missing file is an error rather than
/// a fresh empty database.
pub fn open_existing(path: &Path) -> Result<SqliteObservationStore> {
    if !path.exists() {
        return Err(HeatmapError::Io(std::io::Error::new(
            std::io::ErrorKind::NotFound,
            format!("database not found at {}; run the collector first to create it", path.display()),
        )));
    }
    SqliteObservationStore::open(path)
}

pub fn db_stats(store: &SqliteObservationStore, path: Option<&Path>) -> Result<DbStats> {
    let conn = store.connection();
    let (records, networks, rooms, first_scan, last_scan) = conn
        .query_row(
            "SELECT COUNT(*), COUNT(DISTINCT ssid), COUNT(DISTINCT room), MIN(timestamp), MAX(timestamp)
             FROM wifi_scans",
            [],
            |row| {
                Ok((
                    row.get::<_, i64>(0)?,
                    row.get::<_, i64>(1)?,
                    row.get::<_, i64>(2)?,
                    row.get::<_, Option<String>>(3)?,
                    row.get::<_, Option<String>>(4)?,
                ))
            },
        )
        .map_err(HeatmapError::store)?;
    let file_size_bytes = match path {
        Some(p) => Some(std::fs::metadata(p)?.len()),
        None => None,
    };
    Ok(DbStats {
        records: records.max(0) as u64,
        networks: networks.max(0) as u64,
        rooms: rooms.max(0) as u64,
        first_scan,
        last_scan,
        file_size_bytes,
    })
}

/// Rows that [`cleanup`] would delete.
pub fn count_older_than(store: &SqliteObservationStore, days: i64, now: NaiveDateTime) -> Result<u64> {
    let cutoff = format_timestamp(&cutoff(days, now)?);
    let conn = store.connection();
    let n: i64 = conn
        .query_row("SELECT COUNT(*) FROM wifi_scans WHERE timestamp < ?1", params![cutoff], |row| row.get(0))
        .map_err(HeatmapError::store)?;
    Ok(n.max(0) as u64)
}

/// Delete observations older than `days`. Returns the number removed.
pub fn cleanup(store: &SqliteObservationStore, days: i64, now: NaiveDateTime) -> Result<u64> {
    let cutoff = format_timestamp(&cutoff(days, now)?);
    let mut conn = store.connection();
    let tx = conn.transaction().map_err(HeatmapError::store)?;
    let deleted = tx
        .execute("DELETE FROM wifi_scans WHERE timestamp < ?1", params![cutoff])
        .map_err(HeatmapError::store)?;
    tx.commit().map_err(HeatmapError::store)?;
    tracing::info!(target: "wifi_heatmap::maintenance", days, deleted, "old observations removed");
    Ok(deleted as u64)
}

pub fn vacuum(store: &SqliteObservationStore) -> Result<()> {
    store.connection().execute_batch("VACUUM").map_err(HeatmapError::store)?;
    tracing::info!(target: "wifi_heatmap::maintenance", "database vacuumed");
    Ok(())
}

/// Running mean of one hour of one `(room, network, station)`.
struct HourlyGroup {
    sum: f64,
    count: u32,
    row: Observation,
}

impl HourlyGroup {
    fn new(hour: NaiveDateTime, first: Observation) -> Self {
        HourlyGroup { sum: first.signal_dbm, count: 1, row: Observation { timestamp: hour, ..first } }
    }

    /// Fold in a later reading; its non-empty metadata replaces the older.
    fn add(&mut self, o: Observation) {
        self.sum += o.signal_dbm;
        self.count += 1;
        self.row.channel = o.channel.or(self.row.channel);
        self.row.frequency = o.frequency.or(self.row.frequency.take());
        self.row.security_type = o.security_type.or(self.row.security_type.take());
        self.row.vendor = o.vendor.or(self.row.vendor.take());
    }

    fn finish(self) -> Observation {
        Observation { signal_dbm: self.sum / f64::from(self.count), ..self.row }
    }
}

type HourKey = (NaiveDateTime, String, String, Option<String>);

/// Replace observations older than `days` with one row per hour and
/// `(room, ssid, bssid)` carrying the mean signal in dBm.
pub fn aggregate(store: &SqliteObservationStore, days: i64, now: NaiveDateTime) -> Result<AggregateOutcome> {
    let cutoff = cutoff(days, now)?;
    let mut conn = store.connection();
    let tx = conn.transaction().map_err(HeatmapError::store)?;

    let mut groups: BTreeMap<HourKey, HourlyGroup> = BTreeMap::new();
    let mut folded = Vec::new();
    let mut skipped = 0u64;
    for (id, row) in observation::rows_before(&tx, cutoff)? {
        let Some(o) = row else {
            skipped += 1;
            continue;
        };
        folded.push(id);
        let hour = bucket_start(o.timestamp, Duration::hours(1));
        let key = (hour, o.room.clone(), o.network_id.clone(), o.station_id.clone());
        match groups.get_mut(&key) {
            Some(group) => group.add(o),
            None => {
                groups.insert(key, HourlyGroup::new(hour, o));
            }
        }
    }
    if skipped > 0 {
        tracing::warn!(
            target: "wifi_heatmap::maintenance",
            skipped,
            "malformed old rows left out of aggregation"
        );
    }
    if folded.is_empty() {
        return Ok(AggregateOutcome { skipped, ..AggregateOutcome::default() });
    }

    {
        let mut delete = tx.prepare("DELETE FROM wifi_scans WHERE id = ?1").map_err(HeatmapError::store)?;
        for id in &folded {
            delete.execute(params![id]).map_err(HeatmapError::store)?;
        }
    }
    let hourly: Vec<Observation> = groups.into_values().map(HourlyGroup::finish).collect();
    observation::insert_rows(&tx, &hourly)?;
    tx.commit().map_err(HeatmapError::store)?;

    let outcome = AggregateOutcome { original: folded.len() as u64, aggregated: hourly.len() as u64, skipped };
    tracing::info!(
        target: "wifi_heatmap::maintenance",
        days,
        original = outcome.original,
        aggregated = outcome.aggregated,
        "old observations aggregated to hourly means"
    );
    Ok(outcome)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::detectors::testutil::{reading, store_with, ts};
    use crate::observation::ObservationStore;

    fn now() -> NaiveDateTime {
        ts("2024-05-20 12:00:00")
    }

    fn store() -> SqliteObservationStore {
        store_with(&[
            reading(ts("2024-05-01 10:05:00"), "Kitchen", "HomeNet", -40.0),
            reading(ts("2024-05-01 10:35:00"), "Kitchen", "HomeNet", -50.0),
            reading(ts("2024-05-01 10:50:00"), "Kitchen", "Guest", -70.0),
            reading(ts("2024-05-01 11:10:00"), "Kitchen", "HomeNet", -60.0),
            reading(ts("2024-05-19 11:00:00"), "Office", "HomeNet", -45.0),
        ])
    }

    #[test]
    fn test_db_stats_counts() {
        let stats = db_stats(&store(), None).unwrap();
        assert_eq!(stats.records, 5);
        assert_eq!(stats.networks, 2);
        assert_eq!(stats.rooms, 2);
        assert_eq!(stats.first_scan.as_deref(), Some("2024-05-01 10:05:00"));
        assert_eq!(stats.last_scan.as_deref(), Some("2024-05-19 11:00:00"));
        assert!(stats.file_size_mb().is_none());
    }

    #[test]
    fn test_db_stats_reports_file_size() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("wifi_data.db");
        let store = SqliteObservationStore::open(&path).unwrap();
        let stats = db_stats(&store, Some(&path)).unwrap();
        assert_eq!(stats.records, 0);
        assert!(stats.file_size_bytes.is_some());
    }

    #[test]
    fn test_cleanup_removes_only_old_rows() {
        let store = store();
        assert_eq!(count_older_than(&store, 7, now()).unwrap(), 4);
        assert_eq!(cleanup(&store, 7, now()).unwrap(), 4);
        assert_eq!(db_stats(&store, None).unwrap().records, 1);
        assert_eq!(cleanup(&store, 7, now()).unwrap(), 0);
    }

    #[test]
    fn test_aggregate_folds_to_hourly_means() {
        let store = store();
        let outcome = aggregate(&store, 7, now()).unwrap();
        assert_eq!(outcome, AggregateOutcome { original: 4, aggregated: 3, skipped: 0 });
        assert!((outcome.reduction() - 0.25).abs() < 1e-9);

        let window = store.window(ts("2024-05-01 00:00:00"), ts("2024-05-02 00:00:00")).unwrap();
        let summary: Vec<(String, String, f64)> = window
            .observations
            .iter()
            .map(|o| (format_timestamp(&o.timestamp), o.network_id.clone(), o.signal_dbm))
            .collect();
        assert!(summary.contains(&("2024-05-01 10:00:00".into(), "HomeNet".into(), -45.0)));
        assert!(summary.contains(&("2024-05-01 10:00:00".into(), "Guest".into(), -70.0)));
        assert!(summary.contains(&("2024-05-01 11:00:00".into(), "HomeNet".into(), -60.0)));
        assert_eq!(window.observations[0].channel, Some(6));
        assert_eq!(db_stats(&store, None).unwrap().records, 4);
    }

    #[test]
    fn test_aggregate_leaves_unreadable_rows_out_of_the_mean() {
        let store = SqliteObservationStore::open_in_memory().unwrap();
        store
            .connection()
            .execute_batch(
                "INSERT INTO wifi_scans (timestamp, room, ssid, signal, channel)
                   VALUES ('2024-05-01 10:05:00', 'Kitchen', 'HomeNet', -40, 6);
                 INSERT INTO wifi_scans (timestamp, room, ssid, signal, channel)
                   VALUES ('2024-05-01 10:20:00', 'Kitchen', 'HomeNet', 'n/a', 6);
                 INSERT INTO wifi_scans (timestamp, room, ssid, signal, channel)
                   VALUES ('2024-05-01 10:40:00', 'Kitchen', 'HomeNet', '56\\', 11);
                 INSERT INTO wifi_scans (timestamp, room, ssid, signal, channel)
                   VALUES ('2024-05-01T10:50:00', 'Kitchen', 'HomeNet', -40, 6);",
            )
            .unwrap();

        let outcome = aggregate(&store, 7, now()).unwrap();
        assert_eq!(outcome, AggregateOutcome { original: 2, aggregated: 1, skipped: 2 });

        // -40 dBm and quality 56 (-72 dBm); the text signal is not read as zero
        let window = store.window(ts("2024-05-01 00:00:00"), ts("2024-05-02 00:00:00")).unwrap();
        assert_eq!(window.observations.len(), 1);
        assert_eq!(format_timestamp(&window.observations[0].timestamp), "2024-05-01 10:00:00");
        assert_eq!(window.observations[0].signal_dbm, -56.0);
        assert_eq!(window.observations[0].channel, Some(11));

        let left: i64 = store
            .connection()
            .query_row("SELECT COUNT(*) FROM wifi_scans WHERE signal = 'n/a' OR timestamp LIKE '%T%'", [], |row| {
                row.get(0)
            })
            .unwrap();
        assert_eq!(left, 2);
    }

    #[test]
    fn test_out_of_range_days_rejected() {
        let store = store();
        for days in [-1, MAX_WINDOW_DAYS + 1, i64::MAX] {
            assert!(matches!(cleanup(&store, days, now()), Err(HeatmapError::Config(_))), "{days}");
            assert!(matches!(aggregate(&store, days, now()), Err(HeatmapError::Config(_))), "{days}");
            assert!(matches!(count_older_than(&store, days, now()), Err(HeatmapError::Config(_))), "{days}");
        }
        assert_eq!(db_stats(&store, None).unwrap().records, 5);
    }

    #[test]
    fn test_open_existing_requires_the_file() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("wifi_data.db");
        let err = open_existing(&path).err().unwrap();
        assert!(matches!(err, HeatmapError::Io(ref e) if e.kind() == std::io::ErrorKind::NotFound));
        assert!(!path.exists());

        SqliteObservationStore::open(&path).unwrap();
        assert!(open_existing(&path).is_ok());
    }

    #[test]
    fn test_aggregate_with_nothing_old_is_noop() {
        let store = store();
        assert_eq!(aggregate(&store, 365, now()).unwrap(), AggregateOutcome::default());
        assert_eq!(db_stats(&store, None).unwrap().records, 5);
    }

    #[test]
    fn test_vacuum_keeps_rows() {
        let store = store();
        vacuum(&store).unwrap();
        let stats = db_stats(&store, None).unwrap();
        assert_eq!(stats.records, 5);
        assert_eq!(stats.last_scan.as_deref(), Some("2024-05-19 11:00:00"));
    }
}
