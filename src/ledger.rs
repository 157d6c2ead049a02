//! # Stage: Alert Ledger
//!
//! ## Responsibility
//! Durable, deduplicated log of every alert the check cycle raises. Backed by
//! an SQLite table with an index on `(kind, room, network_id, created_at)` so
//! the dedup check and the episode lookup never scan the whole history.
//!
//! ## Guarantees
//! - Dedup: no two alerts with the same `(kind, room, network_id)` are stored
//!   with `created_at` values within `dedup_window` of each other
//! - Atomic batches: [`AlertLedger::append_batch`] commits every accepted
//!   alert of a cycle or none of them
//! - Durable: a committed alert survives process restart
//! - Readers never observe a half-written batch
//!
//! ## NOT Responsible For
//! - Deciding whether an alert should be raised (detectors)
//! - Episode tracking across cycles ([`crate::detectors::DetectorState`])

use std::path::Path;
use std::sync::{Mutex, MutexGuard, PoisonError};

use chrono::{Duration, NaiveDateTime};
use rusqlite::{params, Connection, OptionalExtension, Transaction};

use crate::alert::{Alert, AlertKind, NewAlert, Severity};
use crate::error::{HeatmapError, Result};
use crate::observation::{format_timestamp, lookback_start, parse_timestamp, NetworkKey};

const SCHEMA: &str = "
    CREATE TABLE IF NOT EXISTS alerts (
        seq INTEGER PRIMARY KEY AUTOINCREMENT,
        id TEXT NOT NULL UNIQUE,
        kind TEXT NOT NULL,
        severity TEXT NOT NULL,
        room TEXT NOT NULL,
        network_id TEXT NOT NULL,
        message TEXT NOT NULL,
        created_at TEXT NOT NULL,
        details TEXT NOT NULL
    );
    CREATE INDEX IF NOT EXISTS idx_alerts_key
        ON alerts(kind, room, network_id, created_at);
    CREATE INDEX IF NOT EXISTS idx_alerts_created
        ON alerts(created_at);
";

/// Outcome of one [`AlertLedger::append_batch`] call.
#[derive(Debug, Clone, Default)]
pub struct BatchOutcome {
    /// Alerts that were persisted, in input order.
    pub inserted: Vec<Alert>,
    /// Candidates dropped by the dedup window.
    pub suppressed: usize,
}

/// Persistent alert log with dedup, time-windowed reads and retention.
pub struct AlertLedger {
    conn: Mutex<Connection>,
    dedup_window: Duration,
}

impl AlertLedger {
    /// Open (and if needed create) the ledger database at `path`.
    pub fn open(path: &Path, dedup_window: Duration) -> Result<Self> {
        if let Some(parent) = path.parent() {
            if !parent.as_os_str().is_empty() {
                std::fs::create_dir_all(parent)?;
            }
        }
        let conn = Connection::open(path).map_err(HeatmapError::ledger)?;
        conn.pragma_update_and_check(None, "journal_mode", "WAL", |row| row.get::<_, String>(0))
            .map_err(HeatmapError::ledger)?;
        conn.pragma_update(None, "synchronous", "FULL").map_err(HeatmapError::ledger)?;
        Self::with_connection(conn, dedup_window)
    }

    pub fn open_in_memory(dedup_window: Duration) -> Result<Self> {
        let conn = Connection::open_in_memory().map_err(HeatmapError::ledger)?;
        Self::with_connection(conn, dedup_window)
    }

    fn with_connection(conn: Connection, dedup_window: Duration) -> Result<Self> {
        conn.execute_batch(SCHEMA).map_err(HeatmapError::ledger)?;
        Ok(AlertLedger { conn: Mutex::new(conn), dedup_window })
    }

    fn connection(&self) -> MutexGuard<'_, Connection> {
        self.conn.lock().unwrap_or_else(PoisonError::into_inner)
    }

    pub fn dedup_window(&self) -> Duration {
        self.dedup_window
    }

    /// Persist one alert unless an identical-key alert exists inside the dedup
    /// window. Returns the stored alert, or `None` when deduplicated.
    pub fn append(&self, alert: NewAlert, now: NaiveDateTime) -> Result<Option<Alert>> {
        let mut outcome = self.append_batch(vec![alert], now)?;
        Ok(outcome.inserted.pop())
    }

    /// Persist a cycle's candidates in one transaction.
    ///
    /// Dedup is evaluated inside the transaction, so two candidates with the
    /// same key in one batch collapse to one alert.
    pub fn append_batch(&self, alerts: Vec<NewAlert>, now: NaiveDateTime) -> Result<BatchOutcome> {
        let mut conn = self.connection();
        let cutoff = format_timestamp(&lookback_start(now, self.dedup_window)?);
        let tx = conn.transaction().map_err(HeatmapError::ledger)?;
        let created_at = format_timestamp(&now);

        let mut outcome = BatchOutcome::default();
        for candidate in alerts {
            if recent_exists(&tx, candidate.kind, &candidate.key, &cutoff)? {
                outcome.suppressed += 1;
                continue;
            }
            let alert = Alert {
                id: uuid::Uuid::new_v4().to_string(),
                kind: candidate.kind,
                severity: candidate.severity(),
                room: candidate.key.room,
                network_id: candidate.key.network_id,
                message: candidate.message,
                created_at: now,
                details: candidate.details,
            };
            let details = serde_json::to_string(&alert.details)?;
            tx.execute(
                "INSERT INTO alerts (id, kind, severity, room, network_id, message, created_at, details)
                 VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8)",
                params![
                    alert.id,
                    alert.kind.as_str(),
                    alert.severity.as_str(),
                    alert.room,
                    alert.network_id,
                    alert.message,
                    created_at,
                    details,
                ],
            )
            .map_err(HeatmapError::ledger)?;
            outcome.inserted.push(alert);
        }
        tx.commit().map_err(HeatmapError::ledger)?;
        Ok(outcome)
    }

    /// Alerts created at or after `since`, newest first, optionally limited
    /// to one severity.
    pub fn query(&self, since: NaiveDateTime, severity: Option<Severity>) -> Result<Vec<Alert>> {
        let conn = self.connection();
        let since = format_timestamp(&since);
        let mut stmt = conn
            .prepare_cached(
                "SELECT id, kind, severity, room, network_id, message, created_at, details
                 FROM alerts
                 WHERE created_at >= ?1 AND (?2 IS NULL OR severity = ?2)
                 ORDER BY created_at DESC, seq DESC",
            )
            .map_err(HeatmapError::ledger)?;
        let rows = stmt
            .query_map(params![since, severity.map(|s| s.as_str())], |row| {
                Ok(StoredAlert {
                    id: row.get(0)?,
                    kind: row.get(1)?,
                    severity: row.get(2)?,
                    room: row.get(3)?,
                    network_id: row.get(4)?,
                    message: row.get(5)?,
                    created_at: row.get(6)?,
                    details: row.get(7)?,
                })
            })
            .map_err(HeatmapError::ledger)?;

        let mut alerts = Vec::new();
        for row in rows {
            let stored = row.map_err(HeatmapError::ledger)?;
            match stored.into_alert() {
                Some(alert) => alerts.push(alert),
                None => tracing::warn!(
                    target: "wifi_heatmap::ledger",
                    "skipping unreadable alert row"
                ),
            }
        }
        Ok(alerts)
    }

    /// Creation time of the newest alert of `kind` for `key`, if any.
    pub fn latest_created_at(&self, kind: AlertKind, key: &NetworkKey) -> Result<Option<NaiveDateTime>> {
        let conn = self.connection();
        let latest: Option<String> = conn
            .query_row(
                "SELECT MAX(created_at) FROM alerts
                 WHERE kind = ?1 AND room = ?2 AND network_id = ?3",
                params![kind.as_str(), key.room, key.network_id],
                |row| row.get(0),
            )
            .optional()
            .map_err(HeatmapError::ledger)?
            .flatten();
        Ok(latest.as_deref().and_then(parse_timestamp))
    }

    /// Delete alerts older than `retention`. Returns the number removed.
    pub fn prune(&self, retention: Duration, now: NaiveDateTime) -> Result<usize> {
        let cutoff = format_timestamp(&lookback_start(now, retention)?);
        let conn = self.connection();
        conn.execute("DELETE FROM alerts WHERE created_at < ?1", params![cutoff])
            .map_err(HeatmapError::ledger)
    }

    /// Number of stored alerts.
    pub fn len(&self) -> Result<usize> {
        let conn = self.connection();
        let n: i64 = conn
            .query_row("SELECT COUNT(*) FROM alerts", [], |row| row.get(0))
            .map_err(HeatmapError::ledger)?;
        Ok(n.max(0) as usize)
    }

    pub fn is_empty(&self) -> Result<bool> {
        Ok(self.len()? == 0)
    }
}

fn recent_exists(tx: &Transaction<'_>, kind: AlertKind, key: &NetworkKey, cutoff: &str) -> Result<bool> {
    tx.query_row(
        "SELECT EXISTS(
             SELECT 1 FROM alerts
             WHERE kind = ?1 AND room = ?2 AND network_id = ?3 AND created_at >= ?4
         )",
        params![kind.as_str(), key.room, key.network_id, cutoff],
        |row| row.get::<_, bool>(0),
    )
    .map_err(HeatmapError::ledger)
}

struct StoredAlert {
    id: String,
    kind: String,
    severity: String,
    room: String,
    network_id: String,
    message: String,
    created_at: String,
    details: String,
}

impl StoredAlert {
    fn into_alert(self) -> Option<Alert> {
        let details = serde_json::from_str(&self.details)
            .unwrap_or(serde_json::Value::String(self.details));
        Some(Alert {
            id: self.id,
            kind: self.kind.parse().ok()?,
            severity: self.severity.parse().ok()?,
            room: self.room,
            network_id: self.network_id,
            message: self.message,
            created_at: parse_timestamp(&self.created_at)?,
            details,
        })
    }
}
