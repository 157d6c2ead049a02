//! # Stage: Observation Store
//!
//! ## Responsibility
//! Read access to the signal observations the collector appends to
//! `wifi_scans`. Detectors only ever issue two kinds of reads through the
//! [`ObservationStore`] trait: a bounded time window, and the latest sighting
//! per `(room, network)` since a cutoff.
//!
//! ## Guarantees
//! - Bounded: every read carries a lower time bound; nothing scans the full history
//! - Tolerant: rows with an unparsable timestamp or signal are skipped and counted
//! - Signals are normalised to dBm on read (see [`crate::signal`])
//!
//! ## NOT Responsible For
//! - Running the scan itself (the collector owns `nmcli` and the room setting)
//! - Retention of raw observations (see [`crate::maintenance`])

use std::collections::BTreeMap;
use std::fmt;
use std::path::Path;
use std::sync::{Mutex, MutexGuard, PoisonError};

use chrono::{Duration, NaiveDateTime};
use rusqlite::types::Value;
use rusqlite::{params, Connection};
use serde::{Deserialize, Serialize};

use crate::error::{HeatmapError, Result};
use crate::signal::normalize_signal;

/// Wall-clock format used by the collector for every timestamp column.
pub const TIMESTAMP_FORMAT: &str = "%Y-%m-%d %H:%M:%S";

/// Format a timestamp the way the collector writes it.
pub fn format_timestamp(ts: &NaiveDateTime) -> String {
    ts.format(TIMESTAMP_FORMAT).to_string()
}

/// Start of the trailing `span` ending at `now`.
///
/// Fails with a configuration error instead of panicking when the result
/// falls outside the representable date range.
pub fn lookback_start(now: NaiveDateTime, span: Duration) -> Result<NaiveDateTime> {
    now.checked_sub_signed(span).ok_or_else(|| {
        HeatmapError::Config(format!("lookback of {span} before {now} is out of range"))
    })
}

/// Parse a collector timestamp, optionally with fractional seconds.
///
/// Only the space-separated form is accepted: store reads compare the TEXT
/// column lexicographically, and a `T`-separated value would sort outside
/// the windows it belongs to.
pub fn parse_timestamp(text: &str) -> Option<NaiveDateTime> {
    NaiveDateTime::parse_from_str(text, TIMESTAMP_FORMAT)
        .or_else(|_| NaiveDateTime::parse_from_str(text, "%Y-%m-%d %H:%M:%S%.f"))
        .ok()
}

/// Serde adapter that keeps timestamps in the collector's text format.
pub mod ts_format {
    use chrono::NaiveDateTime;
    use serde::{Deserialize, Deserializer, Serializer};

    pub fn serialize<S: Serializer>(ts: &NaiveDateTime, s: S) -> Result<S::Ok, S::Error> {
        s.serialize_str(&super::format_timestamp(ts))
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(d: D) -> Result<NaiveDateTime, D::Error> {
        let text = String::deserialize(d)?;
        super::parse_timestamp(&text)
            .ok_or_else(|| serde::de::Error::custom(format!("invalid timestamp '{text}'")))
    }
}

// ---------------------------------------------------------------------------
// Records
// ---------------------------------------------------------------------------

/// Identity of a network as seen from one room.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct NetworkKey {
    pub room: String,
    pub network_id: String,
}

impl NetworkKey {
    pub fn new(room: impl Into<String>, network_id: impl Into<String>) -> Self {
        NetworkKey { room: room.into(), network_id: network_id.into() }
    }
}

impl fmt::Display for NetworkKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} in {}", self.network_id, self.room)
    }
}

/// One scan result for one access point. Immutable once written.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Observation {
    #[serde(with = "ts_format")]
    pub timestamp: NaiveDateTime,
    pub room: String,
    /// SSID.
    pub network_id: String,
    /// BSSID.
    pub station_id: Option<String>,
    /// Signal strength in dBm.
    pub signal_dbm: f64,
    /// Raw channel number; `None` when the stored value was not numeric.
    pub channel: Option<u16>,
    pub frequency: Option<String>,
    pub security_type: Option<String>,
    pub vendor: Option<String>,
}

impl Observation {
    pub fn key(&self) -> NetworkKey {
        NetworkKey::new(self.room.clone(), self.network_id.clone())
    }
}

/// Result of a windowed read.
#[derive(Debug, Clone, Default)]
pub struct ScanWindow {
    /// Parsed rows, ascending by timestamp.
    pub observations: Vec<Observation>,
    /// Rows dropped because a timestamp, room, network or signal was unusable.
    pub skipped: usize,
}

/// Most recent sighting of a network.
#[derive(Debug, Clone, PartialEq)]
pub struct LastSeen {
    pub key: NetworkKey,
    pub last_seen: NaiveDateTime,
}

/// Result of a last-seen read.
#[derive(Debug, Clone, Default)]
pub struct Sightings {
    /// One entry per `(room, network)`, ordered by key.
    pub networks: Vec<LastSeen>,
    /// Rows dropped because a timestamp, room or network was unusable.
    pub skipped: usize,
}

// ---------------------------------------------------------------------------
// Store trait
// ---------------------------------------------------------------------------

/// Read interface the analysis core consumes.
pub trait ObservationStore: Send + Sync {
    /// Rows with `since <= timestamp < until`, oldest first.
    fn window(&self, since: NaiveDateTime, until: NaiveDateTime) -> Result<ScanWindow>;

    /// Latest parsable timestamp per `(room, network)` among rows at or
    /// after `since`.
    fn last_seen(&self, since: NaiveDateTime) -> Result<Sightings>;
}

// ---------------------------------------------------------------------------
// SQLite implementation
// ---------------------------------------------------------------------------

const SCHEMA: &str = "
    CREATE TABLE IF NOT EXISTS wifi_scans (
        id INTEGER PRIMARY KEY AUTOINCREMENT,
        timestamp TEXT NOT NULL,
        room TEXT NOT NULL,
        ssid TEXT NOT NULL,
        bssid TEXT,
        signal INTEGER,
        channel INTEGER,
        frequency TEXT,
        security TEXT,
        vendor TEXT
    );
    CREATE INDEX IF NOT EXISTS idx_timestamp ON wifi_scans(timestamp);
    CREATE INDEX IF NOT EXISTS idx_room ON wifi_scans(room);
    CREATE INDEX IF NOT EXISTS idx_ssid ON wifi_scans(ssid);
";

/// Observation store backed by the collector's SQLite database.
pub struct SqliteObservationStore {
    conn: Mutex<Connection>,
}

impl SqliteObservationStore {
    /// Open (and if needed create) the database at `path`.
    pub fn open(path: &Path) -> Result<Self> {
        if let Some(parent) = path.parent() {
            if !parent.as_os_str().is_empty() {
                std::fs::create_dir_all(parent)?;
            }
        }
        let conn = Connection::open(path).map_err(HeatmapError::store)?;
        conn.pragma_update_and_check(None, "journal_mode", "WAL", |row| row.get::<_, String>(0))
            .map_err(HeatmapError::store)?;
        Self::with_connection(conn)
    }

    /// Private in-memory database, used by tests and dry runs.
    pub fn open_in_memory() -> Result<Self> {
        let conn = Connection::open_in_memory().map_err(HeatmapError::store)?;
        Self::with_connection(conn)
    }

    fn with_connection(conn: Connection) -> Result<Self> {
        conn.execute_batch(SCHEMA).map_err(HeatmapError::store)?;
        Ok(SqliteObservationStore { conn: Mutex::new(conn) })
    }

    pub(crate) fn connection(&self) -> MutexGuard<'_, Connection> {
        self.conn.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Append observations in one transaction. This is the collector's write
    /// path; the analysis core never calls it.
    pub fn insert(&self, observations: &[Observation]) -> Result<usize> {
        let mut conn = self.connection();
        let tx = conn.transaction().map_err(HeatmapError::store)?;
        insert_rows(&tx, observations)?;
        tx.commit().map_err(HeatmapError::store)?;
        Ok(observations.len())
    }
}

pub(crate) fn insert_rows(conn: &Connection, observations: &[Observation]) -> Result<()> {
    let mut stmt = conn
        .prepare_cached(
            "INSERT INTO wifi_scans
             (timestamp, room, ssid, bssid, signal, channel, frequency, security, vendor)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9)",
        )
        .map_err(HeatmapError::store)?;
    for o in observations {
        stmt.execute(params![
            format_timestamp(&o.timestamp),
            o.room,
            o.network_id,
            o.station_id,
            o.signal_dbm,
            o.channel,
            o.frequency,
            o.security_type,
            o.vendor,
        ])
        .map_err(HeatmapError::store)?;
    }
    Ok(())
}

/// Every row whose timestamp text sorts before `cutoff`, oldest first, with
/// its row id. Rows that do not parse as observations are `None`.
pub(crate) fn rows_before(conn: &Connection, cutoff: NaiveDateTime) -> Result<Vec<(i64, Option<Observation>)>> {
    let mut stmt = conn
        .prepare_cached(
            "SELECT timestamp, room, ssid, bssid, signal, channel, frequency, security, vendor, id
             FROM wifi_scans
             WHERE timestamp < ?1
             ORDER BY timestamp, id",
        )
        .map_err(HeatmapError::store)?;
    let rows = stmt
        .query_map(params![format_timestamp(&cutoff)], |row| Ok((row.get::<_, i64>(9)?, RawRow::from_row(row)?)))
        .map_err(HeatmapError::store)?;
    let mut out = Vec::new();
    for row in rows {
        let (id, raw) = row.map_err(HeatmapError::store)?;
        out.push((id, raw.into_observation()));
    }
    Ok(out)
}

impl ObservationStore for SqliteObservationStore {
    fn window(&self, since: NaiveDateTime, until: NaiveDateTime) -> Result<ScanWindow> {
        let conn = self.connection();
        let mut stmt = conn
            .prepare_cached(
                "SELECT timestamp, room, ssid, bssid, signal, channel, frequency, security, vendor
                 FROM wifi_scans
                 WHERE timestamp >= ?1 AND timestamp < ?2
                 ORDER BY timestamp, id",
            )
            .map_err(HeatmapError::store)?;
        let rows = stmt
            .query_map(params![format_timestamp(&since), format_timestamp(&until)], RawRow::from_row)
            .map_err(HeatmapError::store)?;

        let mut window = ScanWindow::default();
        for row in rows {
            match row.map_err(HeatmapError::store)?.into_observation() {
                Some(o) => window.observations.push(o),
                None => window.skipped += 1,
            }
        }
        if window.skipped > 0 {
            tracing::debug!(
                target: "wifi_heatmap::observation",
                skipped = window.skipped,
                "skipped malformed observation rows"
            );
        }
        Ok(window)
    }

    fn last_seen(&self, since: NaiveDateTime) -> Result<Sightings> {
        let conn = self.connection();
        // Unparsable TEXT can sort above every real timestamp, so the maximum
        // is taken over parsed values only.
        let mut stmt = conn
            .prepare_cached("SELECT room, ssid, timestamp FROM wifi_scans WHERE timestamp >= ?1")
            .map_err(HeatmapError::store)?;
        let rows = stmt
            .query_map(params![format_timestamp(&since)], |row| {
                Ok((
                    row.get::<_, Option<String>>(0)?,
                    row.get::<_, Option<String>>(1)?,
                    row.get::<_, Option<String>>(2)?,
                ))
            })
            .map_err(HeatmapError::store)?;

        let mut newest: BTreeMap<NetworkKey, NaiveDateTime> = BTreeMap::new();
        let mut skipped = 0;
        for row in rows {
            let (room, ssid, ts) = row.map_err(HeatmapError::store)?;
            let (Some(room), Some(ssid), Some(at)) =
                (non_empty(room), non_empty(ssid), ts.as_deref().and_then(parse_timestamp))
            else {
                skipped += 1;
                continue;
            };
            let slot = newest.entry(NetworkKey::new(room, ssid)).or_insert(at);
            *slot = (*slot).max(at);
        }
        if skipped > 0 {
            tracing::debug!(
                target: "wifi_heatmap::observation",
                skipped,
                "skipped malformed rows while reading last sightings"
            );
        }
        let networks = newest.into_iter().map(|(key, last_seen)| LastSeen { key, last_seen }).collect();
        Ok(Sightings { networks, skipped })
    }
}

// ---------------------------------------------------------------------------
// Row parsing
// ---------------------------------------------------------------------------

struct RawRow {
    timestamp: Option<String>,
    room: Option<String>,
    ssid: Option<String>,
    bssid: Option<String>,
    signal: Value,
    channel: Value,
    frequency: Option<String>,
    security: Option<String>,
    vendor: Option<String>,
}

impl RawRow {
    /// Reads the first nine columns in `wifi_scans` declaration order.
    fn from_row(row: &rusqlite::Row<'_>) -> rusqlite::Result<Self> {
        Ok(RawRow {
            timestamp: row.get(0)?,
            room: row.get(1)?,
            ssid: row.get(2)?,
            bssid: row.get(3)?,
            signal: row.get(4)?,
            channel: row.get(5)?,
            frequency: row.get(6)?,
            security: row.get(7)?,
            vendor: row.get(8)?,
        })
    }

    fn into_observation(self) -> Option<Observation> {
        let timestamp = parse_timestamp(self.timestamp.as_deref()?)?;
        let room = non_empty(self.room)?;
        let network_id = non_empty(self.ssid)?;
        let signal_dbm = normalize_signal(numeric(&self.signal)?);
        let channel = numeric(&self.channel)
            .filter(|c| c.fract() == 0.0 && *c >= 0.0 && *c <= f64::from(u16::MAX))
            .map(|c| c as u16);
        Some(Observation {
            timestamp,
            room,
            network_id,
            station_id: non_empty(self.bssid),
            signal_dbm,
            channel,
            frequency: non_empty(self.frequency),
            security_type: non_empty(self.security),
            vendor: non_empty(self.vendor),
        })
    }
}

/// Interpret a dynamically-typed SQLite value as a finite number.
/// `nmcli` sometimes leaves escaping backslashes in text columns.
fn numeric(value: &Value) -> Option<f64> {
    let n = match value {
        Value::Integer(i) => *i as f64,
        Value::Real(r) => *r,
        Value::Text(t) => t.trim().replace('\\', "").parse::<f64>().ok()?,
        Value::Null | Value::Blob(_) => return None,
    };
    n.is_finite().then_some(n)
}

fn non_empty(s: Option<String>) -> Option<String> {
    s.map(|s| s.trim().to_string()).filter(|s| !s.is_empty() && s != "--")
}
