//! End-to-end tests for the check cycle: detectors against a real SQLite
//! observation store, alerts persisted to a ledger, dedup and episodes across
//! cycles and restarts, and failure atomicity.

use chrono::{Duration, NaiveDateTime};
use wifi_heatmap::config::AnalysisConfig;
use wifi_heatmap::observation::{parse_timestamp, ScanWindow, Sightings};
use wifi_heatmap::*;

fn ts(s: &str) -> NaiveDateTime {
    parse_timestamp(s).unwrap()
}

fn scan(at: &str, room: &str, ssid: &str, dbm: f64) -> Observation {
    Observation {
        timestamp: ts(at),
        room: room.into(),
        network_id: ssid.into(),
        station_id: Some("aa:bb:cc:00:11:22".into()),
        signal_dbm: dbm,
        channel: Some(6),
        frequency: Some("2437 MHz".into()),
        security_type: Some("WPA2".into()),
        vendor: None,
    }
}

fn store(observations: &[Observation]) -> SqliteObservationStore {
    let store = SqliteObservationStore::open_in_memory().unwrap();
    store.insert(observations).unwrap();
    store
}

fn ledger() -> AlertLedger {
    AlertLedger::open_in_memory(Duration::hours(1)).unwrap()
}

fn cycle() -> CheckCycle {
    CheckCycle::new(&AnalysisConfig::default())
}

// ---------------------------------------------------------------------------
// Degradation
// ---------------------------------------------------------------------------

#[test]
fn test_kitchen_homenet_drop_raises_one_warning() {
    let store = store(&[
        scan("2024-05-01 10:15:00", "Kitchen", "HomeNet", -45.0),
        scan("2024-05-01 10:45:00", "Kitchen", "HomeNet", -45.0),
        scan("2024-05-01 11:15:00", "Kitchen", "HomeNet", -62.0),
        scan("2024-05-01 11:45:00", "Kitchen", "HomeNet", -62.0),
    ]);
    let ledger = ledger();
    let mut cycle = cycle();

    let report = cycle.run(&store, &ledger, ts("2024-05-01 12:00:00")).unwrap();
    assert_eq!(report.raised.degradation, 1);
    assert_eq!(report.total, 1);
    let alert = &report.alerts[0];
    assert_eq!(alert.kind, AlertKind::Degradation);
    assert_eq!(alert.severity, Severity::Warning);
    assert_eq!(alert.room, "Kitchen");
    assert_eq!(alert.network_id, "HomeNet");
    assert_eq!(alert.details["delta"], 17.0);

    // same drop measured again inside the dedup window
    store.insert(&[scan("2024-05-01 12:05:00", "Kitchen", "HomeNet", -62.0)]).unwrap();
    let again = cycle.run(&store, &ledger, ts("2024-05-01 12:10:00")).unwrap();
    assert_eq!(again.total, 0);
    assert_eq!(again.suppressed, 1);
    assert_eq!(ledger.len().unwrap(), 1);
}

#[test]
fn test_no_previous_hour_no_degradation() {
    let store = store(&[
        scan("2024-05-01 11:15:00", "Kitchen", "HomeNet", -45.0),
        scan("2024-05-01 11:45:00", "Kitchen", "HomeNet", -75.0),
    ]);
    let report = cycle().run(&store, &ledger(), ts("2024-05-01 12:00:00")).unwrap();
    assert_eq!(report.raised.degradation, 0);
}

#[test]
fn test_degradation_realerts_after_dedup_window() {
    let store = store(&[
        scan("2024-05-01 10:30:00", "Kitchen", "HomeNet", -45.0),
        scan("2024-05-01 11:30:00", "Kitchen", "HomeNet", -62.0),
        scan("2024-05-01 12:30:00", "Kitchen", "HomeNet", -75.0),
        scan("2024-05-01 13:20:00", "Kitchen", "HomeNet", -75.0),
    ]);
    let ledger = ledger();
    let mut cycle = cycle();
    assert_eq!(cycle.run(&store, &ledger, ts("2024-05-01 12:00:00")).unwrap().raised.degradation, 1);
    // past the dedup window, and the signal dropped again
    let later = cycle.run(&store, &ledger, ts("2024-05-01 13:30:00")).unwrap();
    assert_eq!(later.raised.degradation, 1);
    assert_eq!(ledger.len().unwrap(), 2);
}

// ---------------------------------------------------------------------------
// Disappearance episodes
// ---------------------------------------------------------------------------

#[test]
fn test_disappearance_once_per_episode_and_reset_by_new_sighting() {
    let store = store(&[scan("2024-05-01 09:00:00", "Porch", "Printer", -60.0)]);
    let ledger = ledger();
    let mut cycle = cycle();

    let first = cycle.run(&store, &ledger, ts("2024-05-01 12:00:00")).unwrap();
    assert_eq!(first.raised.disappearance, 1);

    // no new observations: no duplicate, even after the dedup window
    let second = cycle.run(&store, &ledger, ts("2024-05-01 12:30:00")).unwrap();
    assert_eq!(second.total, 0);
    let third = cycle.run(&store, &ledger, ts("2024-05-01 14:30:00")).unwrap();
    assert_eq!(third.total, 0);
    assert_eq!(cycle.state().absent_count(), 1);

    // the printer comes back, then leaves again
    store.insert(&[scan("2024-05-01 15:00:00", "Porch", "Printer", -60.0)]).unwrap();
    let back = cycle.run(&store, &ledger, ts("2024-05-01 15:10:00")).unwrap();
    assert_eq!(back.raised.disappearance, 0);
    assert_eq!(cycle.state().absent_count(), 0);

    let gone_again = cycle.run(&store, &ledger, ts("2024-05-01 16:00:00")).unwrap();
    assert_eq!(gone_again.raised.disappearance, 1);
    assert_eq!(gone_again.alerts[0].details["minutes_missing"], 60);

    let all = ledger.query(ts("2024-05-01 00:00:00"), None).unwrap();
    assert_eq!(all.iter().filter(|a| a.kind == AlertKind::Disappearance).count(), 2);
}

#[test]
fn test_episode_survives_restart() {
    let dir = tempfile::tempdir().unwrap();
    let ledger_path = dir.path().join("alerts.db");
    let store = store(&[scan("2024-05-01 09:00:00", "Porch", "Printer", -60.0)]);

    {
        let ledger = AlertLedger::open(&ledger_path, Duration::hours(1)).unwrap();
        let report = cycle().run(&store, &ledger, ts("2024-05-01 12:00:00")).unwrap();
        assert_eq!(report.raised.disappearance, 1);
    }

    // fresh process: new detector state, reopened ledger, well past dedup
    let ledger = AlertLedger::open(&ledger_path, Duration::hours(1)).unwrap();
    let report = cycle().run(&store, &ledger, ts("2024-05-01 16:00:00")).unwrap();
    assert_eq!(report.total, 0);
    assert_eq!(ledger.len().unwrap(), 1);
}

// ---------------------------------------------------------------------------
// Weak signal
// ---------------------------------------------------------------------------

#[test]
fn test_weak_signal_majority_policy_end_to_end() {
    let store = store(&[
        scan("2024-05-01 11:10:00", "Attic", "HomeNet", -85.0),
        scan("2024-05-01 11:30:00", "Attic", "HomeNet", -86.0),
        scan("2024-05-01 11:50:00", "Attic", "HomeNet", -70.0),
        scan("2024-05-01 11:10:00", "Garage", "HomeNet", -70.0),
        scan("2024-05-01 11:30:00", "Garage", "HomeNet", -90.0),
        scan("2024-05-01 11:50:00", "Garage", "HomeNet", -71.0),
    ]);
    let report = cycle().run(&store, &ledger(), ts("2024-05-01 12:00:00")).unwrap();
    assert_eq!(report.raised.weak_signal, 1);
    assert_eq!(report.alerts[0].room, "Attic");
    assert_eq!(report.alerts[0].severity, Severity::Info);
}

// ---------------------------------------------------------------------------
// Malformed rows
// ---------------------------------------------------------------------------

#[test]
fn test_malformed_rows_are_skipped_not_fatal() {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("wifi_data.db");
    let store = SqliteObservationStore::open(&path).unwrap();
    store.insert(&[scan("2024-05-01 11:45:00", "Attic", "HomeNet", -90.0)]).unwrap();

    let raw = rusqlite::Connection::open(&path).unwrap();
    raw.execute(
        "INSERT INTO wifi_scans (timestamp, room, ssid, signal, channel) VALUES (?1, 'Attic', 'Guest', 'n/a', 'x')",
        ["2024-05-01 11:40:00"],
    )
    .unwrap();
    drop(raw);

    let report = cycle().run(&store, &ledger(), ts("2024-05-01 12:00:00")).unwrap();
    assert_eq!(report.raised.weak_signal, 1);
    assert!(report.skipped_rows >= 1);
}

#[test]
fn test_unparsable_timestamp_row_does_not_hide_a_disappearance() {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("wifi_data.db");
    let store = SqliteObservationStore::open(&path).unwrap();
    store.insert(&[scan("2024-05-01 09:00:00", "Porch", "Printer", -60.0)]).unwrap();

    // text that compares greater than any real timestamp
    let raw = rusqlite::Connection::open(&path).unwrap();
    raw.execute(
        "INSERT INTO wifi_scans (timestamp, room, ssid, signal) VALUES (?1, 'Porch', 'Printer', -60)",
        ["garbage"],
    )
    .unwrap();
    drop(raw);

    let report = cycle().run(&store, &ledger(), ts("2024-05-01 12:00:00")).unwrap();
    assert_eq!(report.raised.disappearance, 1);
    assert_eq!(report.alerts[0].details["last_seen"], "2024-05-01 09:00:00");
    assert!(report.skipped_rows >= 1);
}

// ---------------------------------------------------------------------------
// Failure atomicity
// ---------------------------------------------------------------------------

/// Serves windows normally but cannot answer last-seen queries.
struct FlakyStore {
    inner: SqliteObservationStore,
}

impl ObservationStore for FlakyStore {
    fn window(&self, since: NaiveDateTime, until: NaiveDateTime) -> Result<ScanWindow> {
        self.inner.window(since, until)
    }

    fn last_seen(&self, _since: NaiveDateTime) -> Result<Sightings> {
        Err(HeatmapError::Store(rusqlite::Error::InvalidQuery))
    }
}

#[test]
fn test_store_failure_writes_nothing() {
    // degradation and weak-signal candidates exist before the failing read
    let store = FlakyStore {
        inner: store(&[
            scan("2024-05-01 10:30:00", "Kitchen", "HomeNet", -45.0),
            scan("2024-05-01 11:30:00", "Kitchen", "HomeNet", -88.0),
        ]),
    };
    let ledger = ledger();
    let err = cycle().run(&store, &ledger, ts("2024-05-01 12:00:00")).unwrap_err();
    assert!(matches!(err, HeatmapError::Store(_)));
    assert!(ledger.is_empty().unwrap());
}

#[test]
fn test_ledger_write_failure_is_reported() {
    let dir = tempfile::tempdir().unwrap();
    let ledger_path = dir.path().join("alerts.db");
    let ledger = AlertLedger::open(&ledger_path, Duration::hours(1)).unwrap();
    let store = store(&[scan("2024-05-01 11:50:00", "Attic", "HomeNet", -90.0)]);

    let raw = rusqlite::Connection::open(&ledger_path).unwrap();
    raw.execute_batch("DROP TABLE alerts").unwrap();
    drop(raw);

    let mut cycle = cycle();
    let err = cycle.run(&store, &ledger, ts("2024-05-01 12:00:00")).unwrap_err();
    assert!(matches!(err, HeatmapError::Ledger(_)));
    assert!(cycle.state().last_alerted(AlertKind::WeakSignal, &NetworkKey::new("Attic", "HomeNet")).is_none());
}

// ---------------------------------------------------------------------------
// Retention
// ---------------------------------------------------------------------------

#[test]
fn test_alerts_older_than_retention_are_pruned() {
    let store = store(&[scan("2024-05-01 11:50:00", "Attic", "HomeNet", -90.0)]);
    let ledger = ledger();
    let mut cycle = cycle();
    assert_eq!(cycle.run(&store, &ledger, ts("2024-05-01 12:00:00")).unwrap().total, 1);
    let report = cycle.run(&store, &ledger, ts("2024-05-09 12:00:00")).unwrap();
    assert_eq!(report.pruned, 1);
    assert!(ledger.is_empty().unwrap());
}
