//! Hour-over-hour signal degradation.
//!
//! Two adjacent trailing buckets are compared per `(room, network)`:
//!
//! ```text
//!   previous = [now − 2w, now − w)      current = [now − w, now)
//! ```
//!
//! An alert is raised when `mean(previous) − mean(current) > threshold`.
//! A key with no readings in either bucket has no baseline and is skipped.

use std::collections::BTreeMap;

use chrono::{Duration, NaiveDateTime};
use serde_json::json;

use super::{mean, CheckContext, Detector, DetectorState, Evaluation};
use crate::alert::{AlertKind, NewAlert};
use crate::config::AnalysisConfig;
use crate::error::Result;
use crate::observation::{lookback_start, NetworkKey};
use crate::signal::round1;

#[derive(Debug, Clone)]
pub struct DegradationDetector {
    /// Drop in dB that must be exceeded.
    threshold: f64,
    /// Bucket width.
    window: Duration,
}

#[derive(Default)]
struct Buckets {
    previous: Vec<f64>,
    current: Vec<f64>,
    newest: Option<NaiveDateTime>,
}

impl DegradationDetector {
    pub fn new(threshold: f64, window: Duration) -> Self {
        DegradationDetector { threshold, window }
    }

    pub fn from_config(config: &AnalysisConfig) -> Self {
        Self::new(config.degradation_threshold, config.degradation_window())
    }
}

impl Detector for DegradationDetector {
    fn kind(&self) -> AlertKind {
        AlertKind::Degradation
    }

    fn evaluate(&self, ctx: &CheckContext<'_>, state: &mut DetectorState) -> Result<Evaluation> {
        let split = lookback_start(ctx.now, self.window)?;
        let scan = ctx.store.window(lookback_start(split, self.window)?, ctx.now)?;

        let mut by_key: BTreeMap<NetworkKey, Buckets> = BTreeMap::new();
        for o in &scan.observations {
            let b = by_key.entry(o.key()).or_default();
            if o.timestamp < split {
                b.previous.push(o.signal_dbm);
            } else {
                b.current.push(o.signal_dbm);
            }
            b.newest = b.newest.max(Some(o.timestamp));
        }

        let mut candidates = Vec::new();
        for (key, b) in by_key {
            if let Some(at) = b.newest {
                state.observe(&key, at);
            }
            let (Some(previous_mean), Some(current_mean)) = (mean(&b.previous), mean(&b.current))
            else {
                continue;
            };
            let delta = previous_mean - current_mean;
            if delta <= self.threshold {
                continue;
            }
            let message = format!(
                "Signal degradation detected for {} in {}: {:.1} dBm to {:.1} dBm",
                key.network_id, key.room, previous_mean, current_mean
            );
            candidates.push(NewAlert::new(
                AlertKind::Degradation,
                key,
                message,
                json!({
                    "previous_mean": round1(previous_mean),
                    "current_mean": round1(current_mean),
                    "delta": round1(delta),
                }),
            ));
        }

        Ok(Evaluation { candidates, skipped: scan.skipped })
    }
}
