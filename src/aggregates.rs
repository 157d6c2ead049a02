//! # Stage: Aggregates
//!
//! ## Responsibility
//! Dashboard datasets computed from one scan window: overall network
//! statistics, the room × network heatmap matrix, per-room averages and
//! per-network signal trends in fixed-width time buckets.
//!
//! ## Guarantees
//! - Pure: every function takes observations in and returns a value, no I/O
//! - Deterministic ordering: rankings break count ties by name
//! - An empty window yields zero counts and empty collections, never an error
//!
//! ## NOT Responsible For
//! - Reading the window (see [`crate::service`])
//! - Caching (see [`crate::cache`])

use std::collections::{BTreeMap, BTreeSet, HashMap};

use chrono::{Duration, NaiveDateTime, Timelike};
use serde::Serialize;

use crate::detectors::mean;
use crate::observation::{ts_format, Observation};
use crate::signal::round1;

/// Networks listed in [`NetworkStats::top_networks`].
pub const TOP_NETWORKS: usize = 10;
/// Columns of the heatmap matrix.
pub const HEATMAP_NETWORKS: usize = 10;
/// Series plotted by [`signal_trends`].
pub const TREND_NETWORKS: usize = 5;

// ---------------------------------------------------------------------------
// Network statistics
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct DateRange {
    #[serde(with = "ts_format")]
    pub start: NaiveDateTime,
    #[serde(with = "ts_format")]
    pub end: NaiveDateTime,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct NetworkCount {
    pub network_id: String,
    pub scans: usize,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct NetworkStats {
    pub total_scans: usize,
    pub unique_networks: usize,
    pub unique_rooms: usize,
    pub date_range: Option<DateRange>,
    pub top_networks: Vec<NetworkCount>,
    pub security_types: BTreeMap<String, usize>,
    pub avg_signal_by_room: BTreeMap<String, f64>,
}

/// Networks ranked by scan count, most scanned first.
pub fn rank_networks(observations: &[Observation], limit: usize) -> Vec<NetworkCount> {
    let mut counts: HashMap<&str, usize> = HashMap::new();
    for o in observations {
        *counts.entry(o.network_id.as_str()).or_default() += 1;
    }
    let mut ranked: Vec<NetworkCount> = counts
        .into_iter()
        .map(|(id, scans)| NetworkCount { network_id: id.to_string(), scans })
        .collect();
    ranked.sort_by(|a, b| b.scans.cmp(&a.scans).then_with(|| a.network_id.cmp(&b.network_id)));
    ranked.truncate(limit);
    ranked
}

pub fn network_stats(observations: &[Observation]) -> NetworkStats {
    if observations.is_empty() {
        return NetworkStats::default();
    }

    let networks: BTreeSet<&str> = observations.iter().map(|o| o.network_id.as_str()).collect();
    let rooms: BTreeSet<&str> = observations.iter().map(|o| o.room.as_str()).collect();

    let start = observations.iter().map(|o| o.timestamp).min();
    let end = observations.iter().map(|o| o.timestamp).max();
    let date_range = start.zip(end).map(|(start, end)| DateRange { start, end });

    let mut security_types: BTreeMap<String, usize> = BTreeMap::new();
    for sec in observations.iter().filter_map(|o| o.security_type.as_deref()) {
        *security_types.entry(sec.to_string()).or_default() += 1;
    }

    let mut by_room: BTreeMap<&str, Vec<f64>> = BTreeMap::new();
    for o in observations {
        by_room.entry(o.room.as_str()).or_default().push(o.signal_dbm);
    }
    let avg_signal_by_room = by_room
        .into_iter()
        .filter_map(|(room, signals)| mean(&signals).map(|m| (room.to_string(), round1(m))))
        .collect();

    NetworkStats {
        total_scans: observations.len(),
        unique_networks: networks.len(),
        unique_rooms: rooms.len(),
        date_range,
        top_networks: rank_networks(observations, TOP_NETWORKS),
        security_types,
        avg_signal_by_room,
    }
}

// ---------------------------------------------------------------------------
// Heatmap
// ---------------------------------------------------------------------------

/// Mean dBm per room (rows) and network (columns). Cells with no readings
/// are `None`.
#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct HeatmapGrid {
    pub rooms: Vec<String>,
    pub networks: Vec<String>,
    pub values: Vec<Vec<Option<f64>>>,
}

pub fn heatmap(observations: &[Observation], top_n: usize) -> HeatmapGrid {
    let networks: Vec<String> =
        rank_networks(observations, top_n).into_iter().map(|n| n.network_id).collect();
    let column: HashMap<&str, usize> =
        networks.iter().enumerate().map(|(i, n)| (n.as_str(), i)).collect();

    let mut cells: BTreeMap<&str, Vec<Vec<f64>>> = BTreeMap::new();
    for o in observations {
        let Some(&col) = column.get(o.network_id.as_str()) else {
            continue;
        };
        let row = cells.entry(o.room.as_str()).or_insert_with(|| vec![Vec::new(); networks.len()]);
        row[col].push(o.signal_dbm);
    }

    let rooms = cells.keys().map(|r| r.to_string()).collect();
    let values = cells
        .into_values()
        .map(|row| row.iter().map(|cell| mean(cell).map(round1)).collect())
        .collect();
    HeatmapGrid { rooms, networks, values }
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct RoomAverage {
    pub room: String,
    pub mean_dbm: f64,
}

/// Average of each room's network means, strongest room first.
pub fn room_averages(grid: &HeatmapGrid) -> Vec<RoomAverage> {
    let mut averages: Vec<RoomAverage> = grid
        .rooms
        .iter()
        .zip(&grid.values)
        .filter_map(|(room, row)| {
            let cells: Vec<f64> = row.iter().flatten().copied().collect();
            mean(&cells).map(|m| RoomAverage { room: room.clone(), mean_dbm: round1(m) })
        })
        .collect();
    averages.sort_by(|a, b| b.mean_dbm.total_cmp(&a.mean_dbm).then_with(|| a.room.cmp(&b.room)));
    averages
}

// ---------------------------------------------------------------------------
// Trends
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct TrendPoint {
    #[serde(with = "ts_format")]
    pub bucket_start: NaiveDateTime,
    pub mean_dbm: f64,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct TrendSeries {
    pub network_id: String,
    pub points: Vec<TrendPoint>,
}

/// Floor `ts` to a multiple of `bucket` since the epoch.
pub fn bucket_start(ts: NaiveDateTime, bucket: Duration) -> NaiveDateTime {
    let width = bucket.num_seconds().max(1);
    let whole = ts.with_nanosecond(0).unwrap_or(ts);
    let offset = whole.and_utc().timestamp().rem_euclid(width);
    whole - Duration::seconds(offset)
}

/// Per-network mean signal in `bucket`-wide slots for the `top_n` most
/// scanned networks. Empty buckets are omitted.
pub fn signal_trends(observations: &[Observation], top_n: usize, bucket: Duration) -> Vec<TrendSeries> {
    rank_networks(observations, top_n)
        .into_iter()
        .map(|top| {
            let mut slots: BTreeMap<NaiveDateTime, Vec<f64>> = BTreeMap::new();
            for o in observations.iter().filter(|o| o.network_id == top.network_id) {
                slots.entry(bucket_start(o.timestamp, bucket)).or_default().push(o.signal_dbm);
            }
            let points = slots
                .into_iter()
                .filter_map(|(bucket_start, signals)| {
                    mean(&signals).map(|m| TrendPoint { bucket_start, mean_dbm: round1(m) })
                })
                .collect();
            TrendSeries { network_id: top.network_id, points }
        })
        .collect()
}
